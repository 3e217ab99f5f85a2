//! Multi-query runner
//!
//! Runs an ordered list of named queries against one store and
//! concatenates their node-match tables. With chaining, every token bound
//! by an earlier query (directly or by fill) is blocked for the later
//! ones, so earlier, more specific queries take priority.

use crate::matcher::{BlockSet, MatchError, Matcher, NodeMatches};
use crate::query::Query;
use crate::store::TokenStore;

/// Options for [`run_queries`]
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Block tokens bound by earlier queries
    pub chain: bool,
    /// Expand fill sub-queries
    pub fill: bool,
    /// Match sentences in parallel
    pub parallel: bool,
    /// Tokens blocked for every query
    pub block: BlockSet,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            chain: false,
            fill: true,
            parallel: true,
            block: BlockSet::default(),
        }
    }
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn chain(mut self, chain: bool) -> Self {
        self.chain = chain;
        self
    }

    pub fn fill(mut self, fill: bool) -> Self {
        self.fill = fill;
        self
    }

    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn block(mut self, block: BlockSet) -> Self {
        self.block = block;
        self
    }
}

/// Run named queries in order and concatenate their matches
///
/// Match ids are namespaced by query name. A query that matches nothing
/// contributes no rows; that is not an error.
pub fn run_queries<'q, I>(
    store: &TokenStore,
    queries: I,
    options: &RunOptions,
) -> Result<NodeMatches, MatchError>
where
    I: IntoIterator<Item = (&'q str, &'q Query)>,
{
    let matcher = Matcher::new(store)
        .parallel(options.parallel)
        .fill(options.fill);

    let mut block = options.block.clone();
    let mut result = NodeMatches::default();
    for (name, query) in queries {
        let matches = matcher.find_named(query, Some(name), &block)?;
        let table = NodeMatches::from_matches(query.save_names(), matches);
        tracing::info!(
            query = name,
            matches = table.match_count(),
            rows = table.len(),
            blocked = block.len(),
            "ran query"
        );

        if options.chain {
            block.extend(table.iter().map(|row| row.token));
        }
        result.append(table);
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{QueryNode, SubQuery};
    use crate::store::GlobalId;
    use rustc_hash::FxHashSet;

    /// d1 s1:
    /// 1: zegt (VERB, root)
    ///   ├─ 2: Jan (NOUN, su)
    ///   └─ 5: komt (VERB, vc)
    ///        ├─ 3: dat (SCONJ, cmp)
    ///        └─ 4: hij (PRON, su)
    fn create_test_store() -> TokenStore {
        let mut builder = TokenStore::builder();
        builder
            .push("d1", 1, 1, None, "root", [("lemma", "zeggen"), ("pos", "VERB")])
            .push("d1", 1, 2, Some(1), "su", [("lemma", "Jan"), ("pos", "NOUN")])
            .push("d1", 1, 3, Some(5), "cmp", [("lemma", "dat"), ("pos", "SCONJ")])
            .push("d1", 1, 4, Some(5), "su", [("lemma", "hij"), ("pos", "PRON")])
            .push("d1", 1, 5, Some(1), "vc", [("lemma", "komen"), ("pos", "VERB")]);
        builder.build().unwrap()
    }

    fn tok(store: &TokenStore, token: u32) -> GlobalId {
        store.global_id("d1", 1, token).unwrap()
    }

    fn speech_query() -> Query {
        QueryNode::new()
            .when("lemma", ["zeggen"])
            .save("verb")
            .children(QueryNode::new().when("relation", ["su"]).save("source"))
            .children(QueryNode::new().when("relation", ["vc"]).save("quote"))
            .build()
            .unwrap()
    }

    fn verb_query() -> Query {
        QueryNode::new()
            .when("pos", ["VERB"])
            .save("pred")
            .with(SubQuery::children(QueryNode::new().when("relation", ["su"]).save("subj")).optional())
            .build()
            .unwrap()
    }

    fn bound(table: &NodeMatches, query: &str) -> FxHashSet<GlobalId> {
        table
            .iter()
            .filter(|row| row.match_id.query.as_deref() == Some(query))
            .map(|row| row.token)
            .collect()
    }

    #[test]
    fn test_unchained_queries_overlap() {
        let store = create_test_store();
        let (speech, verb) = (speech_query(), verb_query());

        let table = run_queries(
            &store,
            [("speech", &speech), ("verb", &verb)],
            &RunOptions::default(),
        )
        .unwrap();

        assert_eq!(table.match_count(), 3);
        let overlap: Vec<_> = bound(&table, "speech")
            .intersection(&bound(&table, "verb"))
            .copied()
            .collect();
        assert!(overlap.contains(&tok(&store, 5)));
    }

    #[test]
    fn test_chain_suppresses_whole_match() {
        let store = create_test_store();
        let (speech, verb) = (speech_query(), verb_query());

        let table = run_queries(
            &store,
            [("speech", &speech), ("verb", &verb)],
            &RunOptions::new().chain(true),
        )
        .unwrap();

        // "komen" (token 5) was bound as the quote, so the verb match
        // rooted there disappears entirely, not just its token 5 row
        assert!(bound(&table, "verb").is_empty());
        assert_eq!(table.match_count(), 1);
        let ids: Vec<String> = table
            .match_ids()
            .into_iter()
            .map(|id| id.render(&store))
            .collect();
        assert_eq!(ids, vec!["speech#d1.1.1"]);
    }

    #[test]
    fn test_chain_blocks_fill() {
        let store = create_test_store();
        let quote = QueryNode::new()
            .when("relation", ["vc"])
            .save("quote")
            .fill(QueryNode::new())
            .build()
            .unwrap();
        let subject = QueryNode::new()
            .when("relation", ["su"])
            .save("subj")
            .build()
            .unwrap();

        let table = run_queries(
            &store,
            [("quote", &quote), ("subject", &subject)],
            &RunOptions::new().chain(true),
        )
        .unwrap();

        // "hij" was filled by the first query; only "Jan" is left
        let subjects: Vec<u32> = bound(&table, "subject").iter().map(|id| id.token).collect();
        assert_eq!(subjects, vec![2]);
    }

    #[test]
    fn test_external_block_set() {
        let store = create_test_store();
        let verb = verb_query();

        let mut block = BlockSet::default();
        block.insert(tok(&store, 1));
        let table = run_queries(&store, [("verb", &verb)], &RunOptions::new().block(block)).unwrap();

        let roots: Vec<u32> = table.match_ids().iter().map(|id| id.root.token).collect();
        assert_eq!(roots, vec![5]);
    }

    #[test]
    fn test_empty_result_is_not_an_error() {
        let store = create_test_store();
        let nothing = QueryNode::new()
            .when("lemma", ["absent"])
            .save("x")
            .build()
            .unwrap();

        let table = run_queries(&store, [("nothing", &nothing)], &RunOptions::default()).unwrap();
        assert!(table.is_empty());
        assert_eq!(table.save_names().len(), 1);
    }

    #[test]
    fn test_unknown_column_stops_run() {
        let store = create_test_store();
        let bad = QueryNode::new().when("upos", ["VERB"]).build().unwrap();
        let verb = verb_query();

        let result = run_queries(&store, [("verb", &verb), ("bad", &bad)], &RunOptions::default());
        assert_eq!(
            result,
            Err(MatchError::UnknownColumns(vec!["upos".to_string()]))
        );
    }

    #[test]
    fn test_chained_bindings_subset_of_unchained() {
        let store = create_test_store();
        let (speech, verb) = (speech_query(), verb_query());
        let queries = [("verb", &verb), ("speech", &speech)];

        let chained = run_queries(&store, queries, &RunOptions::new().chain(true)).unwrap();
        let unchained = run_queries(&store, queries, &RunOptions::default()).unwrap();

        assert!(chained.tokens().is_subset(&unchained.tokens()));
        assert!(bound(&chained, "verb").is_disjoint(&bound(&chained, "speech")));
    }

    #[test]
    fn test_chain_blocking_an_earlier_binding_adds_nothing() {
        // 1: r
        //   ├─ 2: x (k=first)
        //   └─ 3: x
        let mut builder = TokenStore::builder();
        builder
            .push("d1", 1, 1, None, "root", [("lemma", "r"), ("k", "")])
            .push("d1", 1, 2, Some(1), "x", [("lemma", "x"), ("k", "first")])
            .push("d1", 1, 3, Some(1), "x", [("lemma", "x"), ("k", "")]);
        let store = builder.build().unwrap();

        let first = QueryNode::new().when("k", ["first"]).save("f").build().unwrap();
        let second = QueryNode::new()
            .when("lemma", ["r"])
            .save("r")
            .children(QueryNode::new().when("lemma", ["x"]).save("c"))
            .build()
            .unwrap();
        let queries = [("first", &first), ("second", &second)];

        let chained = run_queries(&store, queries, &RunOptions::new().chain(true)).unwrap();
        let unchained = run_queries(&store, queries, &RunOptions::default()).unwrap();

        let tokens = |table: &NodeMatches| {
            let mut tokens: Vec<u32> = table.tokens().iter().map(|id| id.token).collect();
            tokens.sort_unstable();
            tokens
        };
        assert_eq!(tokens(&unchained), vec![1, 2, 3]);
        assert_eq!(tokens(&chained), vec![1, 2, 3]);
        let chained_children: Vec<u32> = bound(&chained, "second")
            .into_iter()
            .filter(|id| id.token != 1)
            .map(|id| id.token)
            .collect();
        assert_eq!(chained_children, vec![3]);
        assert!(chained.tokens().is_subset(&unchained.tokens()));
    }
}
