//! Recursive tree-pattern matcher
//!
//! Every token that is not blocked and passes the root conditions is a
//! candidate. A candidate is expanded through the query's sub-queries:
//! each one walks to children or parents up to its depth and tests every
//! reachable token against its own nested structure. Required sub-queries
//! without a satisfying token reject the candidate, negated ones reject it
//! when one exists. A saved node records every token that satisfies it;
//! sub-queries without save names only test existence. Surviving
//! candidates become matches, and saved nodes that declare fill are then
//! flooded with their descendants.
//!
//! Sentences are independent trees, so candidates can be matched in
//! parallel per sentence. Results always come back in store order.

use crate::pattern::{BoundCondition, Condition};
use crate::query::{Depth, Direction, FillSpec, Link, Node, Query};
use crate::store::{GlobalId, TokenPos, TokenStore};
use rayon::prelude::*;
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Arc;
use thiserror::Error;

/// Global ids treated as absent during matching
pub type BlockSet = FxHashSet<GlobalId>;

/// Error running a query against a store
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MatchError {
    #[error("Match error: unknown columns: {}", .0.join(", "))]
    UnknownColumns(Vec<String>),
}

/// Identifies a match by its query and root token
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MatchId {
    pub query: Option<Arc<str>>,
    pub root: GlobalId,
}

impl MatchId {
    /// `query#doc.sentence.token`, or `doc.sentence.token` without a query
    pub fn render(&self, store: &TokenStore) -> String {
        match &self.query {
            Some(query) => format!("{}#{}", query, store.display_id(self.root)),
            None => store.display_id(self.root),
        }
    }
}

/// A token bound in a match, directly (level 0) or by fill
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchedNode {
    pub role: Arc<str>,
    pub token: GlobalId,
    pub fill_level: u32,
}

/// One realized assignment of save names to tokens
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Match {
    pub id: MatchId,
    pub nodes: Vec<MatchedNode>,
}

impl Match {
    /// Token bound directly under a save name
    pub fn get(&self, role: &str) -> Option<GlobalId> {
        self.iter_named()
            .find(|&(name, _)| name == role)
            .map(|(_, token)| token)
    }

    /// Every token bound directly under a save name
    pub fn get_all<'a>(&'a self, role: &'a str) -> impl Iterator<Item = GlobalId> + 'a {
        self.iter_named()
            .filter(move |&(name, _)| name == role)
            .map(|(_, token)| token)
    }

    /// Direct bindings as (save name, token) pairs, in binding order
    pub fn iter_named(&self) -> impl Iterator<Item = (&str, GlobalId)> + '_ {
        self.nodes
            .iter()
            .filter(|node| node.fill_level == 0)
            .map(|node| (&*node.role, node.token))
    }
}

/// Long-form match table: one row per bound token per match
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeMatches {
    save_names: Vec<Arc<str>>,
    rows: Vec<NodeMatch>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeMatch {
    pub match_id: MatchId,
    pub role: Arc<str>,
    pub token: GlobalId,
    pub fill_level: u32,
}

impl NodeMatches {
    pub fn new(save_names: Vec<Arc<str>>) -> Self {
        Self {
            save_names,
            rows: Vec::new(),
        }
    }

    pub fn from_matches(save_names: &[Arc<str>], matches: Vec<Match>) -> Self {
        let rows = matches
            .into_iter()
            .flat_map(|m| {
                let id = m.id;
                m.nodes.into_iter().map(move |node| NodeMatch {
                    match_id: id.clone(),
                    role: node.role,
                    token: node.token,
                    fill_level: node.fill_level,
                })
            })
            .collect();
        Self {
            save_names: save_names.to_vec(),
            rows,
        }
    }

    /// Save names declared by the queries behind this table
    pub fn save_names(&self) -> &[Arc<str>] {
        &self.save_names
    }

    pub fn rows(&self) -> &[NodeMatch] {
        &self.rows
    }

    pub fn iter(&self) -> std::slice::Iter<'_, NodeMatch> {
        self.rows.iter()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Distinct match ids, in row order
    pub fn match_ids(&self) -> Vec<&MatchId> {
        let mut seen = FxHashSet::default();
        self.rows
            .iter()
            .map(|row| &row.match_id)
            .filter(|id| seen.insert(*id))
            .collect()
    }

    pub fn match_count(&self) -> usize {
        self.match_ids().len()
    }

    /// Every token bound directly or by fill
    pub fn tokens(&self) -> BlockSet {
        self.rows.iter().map(|row| row.token).collect()
    }

    /// Append another table, merging declared save names
    pub fn append(&mut self, other: NodeMatches) {
        for name in other.save_names {
            if !self.save_names.contains(&name) {
                self.save_names.push(name);
            }
        }
        self.rows.extend(other.rows);
    }
}

impl<'a> IntoIterator for &'a NodeMatches {
    type Item = &'a NodeMatch;
    type IntoIter = std::slice::Iter<'a, NodeMatch>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.iter()
    }
}

/// Conditions of one node, resolved against the store
#[derive(Debug)]
struct Filter<'q> {
    conditions: Vec<BoundCondition<'q>>,
}

impl<'q> Filter<'q> {
    fn bind(conditions: &'q [Condition], store: &TokenStore, missing: &mut Vec<String>) -> Self {
        let mut bound = Vec::with_capacity(conditions.len());
        for condition in conditions {
            match condition.bind(store) {
                Some(b) => bound.push(b),
                None => missing.push(condition.attribute.clone()),
            }
        }
        Self { conditions: bound }
    }

    #[inline]
    fn accepts(&self, store: &TokenStore, pos: TokenPos) -> bool {
        self.conditions.iter().all(|c| c.test(store, pos))
    }
}

#[derive(Debug)]
struct PreparedNode<'q> {
    filter: Filter<'q>,
    save: Option<&'q Arc<str>>,
    links: Vec<PreparedLink<'q>>,
    fills: Vec<PreparedFill<'q>>,
}

#[derive(Debug)]
struct PreparedLink<'q> {
    link: &'q Link,
    node: PreparedNode<'q>,
    /// Whether the nested structure declares any save name
    saves: bool,
}

#[derive(Debug)]
struct PreparedFill<'q> {
    spec: &'q FillSpec,
    filter: Filter<'q>,
}

impl<'q> PreparedNode<'q> {
    fn new(node: &'q Node, store: &TokenStore, missing: &mut Vec<String>) -> Self {
        Self {
            filter: Filter::bind(&node.conditions, store, missing),
            save: node.save.as_ref(),
            links: node
                .links
                .iter()
                .map(|link| {
                    let node = PreparedNode::new(&link.node, store, missing);
                    PreparedLink {
                        link,
                        saves: node.saves(),
                        node,
                    }
                })
                .collect(),
            fills: node
                .fills
                .iter()
                .map(|spec| PreparedFill {
                    spec,
                    filter: Filter::bind(&spec.conditions, store, missing),
                })
                .collect(),
        }
    }

    fn saves(&self) -> bool {
        self.save.is_some() || self.links.iter().any(|link| link.saves)
    }
}

/// A revisited token: the parent links contain a cycle
#[derive(Debug, Clone, Copy)]
struct Cycle(TokenPos);

/// A token bound directly while expanding one candidate
struct Binding<'p, 'q> {
    role: &'q Arc<str>,
    pos: TokenPos,
    fills: &'p [PreparedFill<'q>],
}

/// Raw match: root position plus (role, position, fill level) rows
type Found = (TokenPos, Vec<(Arc<str>, TokenPos, u32)>);

struct Search<'s> {
    store: &'s TokenStore,
    blocked: &'s [bool],
    fill: bool,
}

impl Search<'_> {
    fn match_at(&self, root: &PreparedNode, pos: TokenPos) -> Option<Found> {
        if self.blocked[pos] || !root.filter.accepts(self.store, pos) {
            return None;
        }

        let mut bindings = Vec::new();
        match self.satisfy(root, pos, &mut bindings) {
            Ok(true) => {}
            Ok(false) => return None,
            Err(cycle) => {
                self.report_cycle(pos, cycle);
                return None;
            }
        }

        // A token reached along several paths is recorded once per role
        let mut seen = FxHashSet::default();
        bindings.retain(|b| seen.insert((b.role.clone(), b.pos)));

        let mut nodes: Vec<_> = bindings
            .iter()
            .map(|b| (b.role.clone(), b.pos, 0))
            .collect();
        if self.fill {
            match self.expand_fill(&bindings) {
                Ok(filled) => nodes.extend(filled),
                Err(cycle) => {
                    self.report_cycle(pos, cycle);
                    return None;
                }
            }
        }
        Some((pos, nodes))
    }

    fn report_cycle(&self, root: TokenPos, cycle: Cycle) {
        tracing::warn!(
            candidate = %self.store.display_id(self.store.id(root)),
            at = %self.store.display_id(self.store.id(cycle.0)),
            "cycle in parent links, rejecting candidate"
        );
    }

    /// Try to satisfy `node` at `pos`, appending the saved bindings of
    /// every satisfying token in its nested structure
    ///
    /// On `Ok(false)` the bindings are left as they were.
    fn satisfy<'p, 'q>(
        &self,
        node: &'p PreparedNode<'q>,
        pos: TokenPos,
        out: &mut Vec<Binding<'p, 'q>>,
    ) -> Result<bool, Cycle> {
        if !node.filter.accepts(self.store, pos) {
            return Ok(false);
        }

        let mark = out.len();
        if let Some(role) = node.save {
            out.push(Binding {
                role,
                pos,
                fills: &node.fills,
            });
        }

        for prepared in &node.links {
            let link = prepared.link;
            let through = link.connected.then_some(&prepared.node.filter);
            let candidates = self.walk(pos, link.direction, link.depth, through, &[])?;

            if link.negated {
                for &(candidate, _) in &candidates {
                    let mut scratch = Vec::new();
                    if self.satisfy(&prepared.node, candidate, &mut scratch)? {
                        out.truncate(mark);
                        return Ok(false);
                    }
                }
                continue;
            }

            let mut found = false;
            for &(candidate, _) in &candidates {
                if self.satisfy(&prepared.node, candidate, out)? {
                    found = true;
                    // Unsaved structure only needs one witness
                    if !prepared.saves {
                        break;
                    }
                }
            }
            if !found && link.required {
                out.truncate(mark);
                return Ok(false);
            }
        }

        Ok(true)
    }

    /// Breadth-first walk from `start`, returning (token, distance)
    ///
    /// Blocked and avoided tokens are neither returned nor walked through.
    /// With a `through` filter only passing tokens are kept and expanded.
    /// Each level is in store order.
    fn walk(
        &self,
        start: TokenPos,
        direction: Direction,
        depth: Depth,
        through: Option<&Filter>,
        avoid: &[TokenPos],
    ) -> Result<Vec<(TokenPos, u32)>, Cycle> {
        let mut visited = FxHashSet::default();
        visited.insert(start);
        let mut frontier = vec![start];
        let mut found = Vec::new();
        let mut level = 0;

        while !frontier.is_empty() && depth.allows(level + 1) {
            level += 1;
            let mut next_frontier = Vec::new();
            for &pos in &frontier {
                let parent;
                let next: &[TokenPos] = match direction {
                    Direction::Descendants => self.store.children(pos),
                    Direction::Ancestors => {
                        parent = self.store.parent(pos);
                        parent.as_slice()
                    }
                };
                for &candidate in next {
                    if self.blocked[candidate] || avoid.contains(&candidate) {
                        continue;
                    }
                    if !visited.insert(candidate) {
                        return Err(Cycle(candidate));
                    }
                    if through.is_some_and(|filter| !filter.accepts(self.store, candidate)) {
                        continue;
                    }
                    next_frontier.push(candidate);
                }
            }
            next_frontier.sort_unstable();
            found.extend(next_frontier.iter().map(|&pos| (pos, level)));
            frontier = next_frontier;
        }

        Ok(found)
    }

    /// Flood saved nodes that declare fill with their descendants
    ///
    /// The flood never enters tokens bound directly in the same match.
    fn expand_fill(&self, bindings: &[Binding]) -> Result<Vec<(Arc<str>, TokenPos, u32)>, Cycle> {
        let direct: Vec<TokenPos> = bindings.iter().map(|b| b.pos).collect();
        let mut rows = Vec::new();

        for binding in bindings {
            let mut levels: Vec<(TokenPos, u32)> = Vec::new();
            let mut index: FxHashMap<TokenPos, usize> = FxHashMap::default();
            for fill in binding.fills {
                let spec = fill.spec;
                let through = spec.connected.then_some(&fill.filter);
                let reached = self.walk(
                    binding.pos,
                    Direction::Descendants,
                    spec.depth,
                    through,
                    &direct,
                )?;
                for (pos, level) in reached {
                    if !fill.filter.accepts(self.store, pos) {
                        continue;
                    }
                    match index.get(&pos) {
                        Some(&i) => levels[i].1 = levels[i].1.min(level),
                        None => {
                            index.insert(pos, levels.len());
                            levels.push((pos, level));
                        }
                    }
                }
            }
            levels.sort_unstable_by_key(|&(pos, level)| (level, pos));
            rows.extend(
                levels
                    .into_iter()
                    .map(|(pos, level)| (binding.role.clone(), pos, level)),
            );
        }

        Ok(rows)
    }
}

/// Runs single queries against a store
#[derive(Debug, Clone, Copy)]
pub struct Matcher<'s> {
    store: &'s TokenStore,
    parallel: bool,
    fill: bool,
}

impl<'s> Matcher<'s> {
    pub fn new(store: &'s TokenStore) -> Self {
        Self {
            store,
            parallel: true,
            fill: true,
        }
    }

    /// Match sentences on the rayon thread pool
    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Expand fill sub-queries
    pub fn fill(mut self, fill: bool) -> Self {
        self.fill = fill;
        self
    }

    pub fn store(&self) -> &'s TokenStore {
        self.store
    }

    /// Find all matches of `query`, ignoring tokens in `block`
    pub fn find(&self, query: &Query, block: &BlockSet) -> Result<Vec<Match>, MatchError> {
        self.find_named(query, None, block)
    }

    /// Like [`find`](Self::find), tagging match ids with a query name
    pub fn find_named(
        &self,
        query: &Query,
        name: Option<&str>,
        block: &BlockSet,
    ) -> Result<Vec<Match>, MatchError> {
        let mut missing = Vec::new();
        let root = PreparedNode::new(query.root(), self.store, &mut missing);
        if !missing.is_empty() {
            missing.sort();
            missing.dedup();
            return Err(MatchError::UnknownColumns(missing));
        }

        let blocked = self.block_mask(block);
        let search = Search {
            store: self.store,
            blocked: &blocked,
            fill: self.fill,
        };

        let search = &search;
        let root = &root;
        let mut found: Vec<Found> = if self.parallel {
            self.store
                .sentences()
                .par_iter()
                .flat_map_iter(|range| {
                    range
                        .clone()
                        .filter_map(move |pos| search.match_at(root, pos))
                })
                .collect()
        } else {
            (0..self.store.len())
                .filter_map(|pos| search.match_at(root, pos))
                .collect()
        };
        found.sort_by_key(|(pos, _)| *pos);

        let name: Option<Arc<str>> = name.map(Arc::from);
        let matches: Vec<Match> = found
            .into_iter()
            .map(|(root, nodes)| Match {
                id: MatchId {
                    query: name.clone(),
                    root: self.store.id(root),
                },
                nodes: nodes
                    .into_iter()
                    .map(|(role, pos, fill_level)| MatchedNode {
                        role,
                        token: self.store.id(pos),
                        fill_level,
                    })
                    .collect(),
            })
            .collect();

        tracing::debug!(
            query = name.as_deref().unwrap_or("-"),
            blocked = block.len(),
            matches = matches.len(),
            "query matched"
        );
        Ok(matches)
    }

    /// Run a query and flatten its matches into a node-match table
    pub fn node_matches(&self, query: &Query, block: &BlockSet) -> Result<NodeMatches, MatchError> {
        let matches = self.find(query, block)?;
        Ok(NodeMatches::from_matches(query.save_names(), matches))
    }

    fn block_mask(&self, block: &BlockSet) -> Vec<bool> {
        let mut mask = vec![false; self.store.len()];
        for id in block {
            if let Some(pos) = self.store.position(*id) {
                mask[pos] = true;
            }
        }
        mask
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use crate::query::{QueryNode, SubQuery};
    use proptest::prelude::*;

    const LEMMAS: [&str; 3] = ["a", "b", "c"];
    const RELATIONS: [&str; 2] = ["x", "y"];

    /// Random forest: token i+2 attaches to one of tokens 1..=i+1
    fn build_store(shape: &[(usize, usize, usize)]) -> TokenStore {
        let mut builder = TokenStore::builder();
        builder.push("d", 1, 1, None, "root", [("lemma", "a")]);
        for (i, &(parent, lemma, relation)) in shape.iter().enumerate() {
            let token = i as u32 + 2;
            let parent = (parent % (i + 1)) as u32 + 1;
            builder.push(
                "d",
                1,
                token,
                Some(parent),
                RELATIONS[relation],
                [("lemma", LEMMAS[lemma])],
            );
        }
        builder.build().unwrap()
    }

    fn forest() -> impl Strategy<Value = Vec<(usize, usize, usize)>> {
        prop::collection::vec((0usize..64, 0usize..3, 0usize..2), 0..24)
    }

    fn roots(store: &TokenStore, query: &Query) -> Vec<GlobalId> {
        Matcher::new(store)
            .find(query, &BlockSet::default())
            .unwrap()
            .into_iter()
            .map(|m| m.id.root)
            .collect()
    }

    proptest! {
        #[test]
        fn matching_is_deterministic(shape in forest()) {
            let store = build_store(&shape);
            let query = QueryNode::new()
                .when("lemma", ["a", "b"])
                .save("r")
                .with(SubQuery::children(QueryNode::new().when("relation", ["x"]).save("c")).depth(2))
                .fill(QueryNode::new())
                .build()
                .unwrap();

            let matcher = Matcher::new(&store);
            let first = matcher.find(&query, &BlockSet::default()).unwrap();
            let second = matcher.find(&query, &BlockSet::default()).unwrap();
            let serial = matcher.parallel(false).find(&query, &BlockSet::default()).unwrap();
            prop_assert_eq!(&first, &second);
            prop_assert_eq!(&first, &serial);
        }

        #[test]
        fn required_matches_are_subset_of_optional(shape in forest()) {
            let store = build_store(&shape);
            let child = || QueryNode::new().when("lemma", ["b"]).save("c");
            let required = QueryNode::new().when("relation", ["x", "root"]).save("r")
                .with(SubQuery::children(child()).depth(2))
                .build()
                .unwrap();
            let optional = QueryNode::new().when("relation", ["x", "root"]).save("r")
                .with(SubQuery::children(child()).depth(2).optional())
                .build()
                .unwrap();

            let required = roots(&store, &required);
            let optional = roots(&store, &optional);
            prop_assert!(optional.len() >= required.len());
            prop_assert!(required.iter().all(|id| optional.contains(id)));
        }

        #[test]
        fn negation_partitions_root_candidates(shape in forest()) {
            let store = build_store(&shape);
            let child = || QueryNode::new().when("relation", ["y"]);
            let base = || QueryNode::new().when("lemma", ["a", "c"]);

            let all = roots(&store, &base().build().unwrap());
            let with = roots(&store, &base().children(child()).build().unwrap());
            let without = roots(&store, &base().not_children(child()).build().unwrap());

            prop_assert!(with.iter().all(|id| !without.contains(id)));
            let mut union: Vec<GlobalId> = with.into_iter().chain(without).collect();
            union.sort();
            prop_assert_eq!(union, all);
        }
    }
}
