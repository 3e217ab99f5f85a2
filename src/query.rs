//! Query construction
//!
//! A query is a tree of nodes. Each node carries token conditions, an
//! optional save name, and nested sub-queries that walk down to children
//! or up to parents. [`QueryNode`] is the declarative builder;
//! [`Query::new`] validates it into an immutable [`Query`].
//!
//! ```
//! use treequery::{Query, QueryNode};
//!
//! let query = Query::new(
//!     QueryNode::new()
//!         .when("lemma", ["says"])
//!         .save("verb")
//!         .children(QueryNode::new().when("relation", ["su"]).save("source")),
//! )
//! .unwrap();
//! assert_eq!(query.save_names().len(), 2);
//! ```

use crate::pattern::Condition;
use std::sync::Arc;
use thiserror::Error;

/// Error type for query construction failures
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("Query error: {0}")]
    Syntax(String),

    #[error("Query error: Duplicate save name: {0}")]
    DuplicateSaveName(String),

    #[error("Query error: Fill cannot be negated or contain sub-queries")]
    FillCannotNest,

    #[error("Query error: Fill inherits its save name and cannot declare one: {0}")]
    FillCannotSave(String),

    #[error("Query error: Negated sub-query cannot save: {0}")]
    NegatedSave(String),

    #[error("Query error: Negated sub-query cannot contain fill")]
    NegatedFill,

    #[error("Query error: Negated sub-query cannot be optional")]
    NegatedOptional,

    #[error("Query error: Depth must be positive")]
    InvalidDepth,

    #[error("Query error: Unsupported match mode '{flag}' in {key}")]
    UnsupportedMatchMode { key: String, flag: char },

    #[error("Query error: Regex and fixed match modes conflict in {0}")]
    ConflictingMatchModes(String),

    #[error("Query error: Invalid regex {pattern:?}: {source}")]
    InvalidRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("Query error: No values given for {0}")]
    EmptyCondition(String),
}

/// Which way a sub-query walks from its parent node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Descendants,
    Ancestors,
}

/// How far a sub-query walks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Depth {
    Limited(u32),
    Unbounded,
}

impl Depth {
    #[inline]
    pub fn allows(self, depth: u32) -> bool {
        match self {
            Depth::Limited(max) => depth <= max,
            Depth::Unbounded => true,
        }
    }
}

/// Kind of a nested sub-query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    Children,
    Parents,
    /// Flood-annotates descendants of a saved node
    Fill,
}

/// A nested sub-query with its traversal options
#[derive(Debug, Clone)]
pub struct SubQuery {
    pub relation: Relation,
    pub node: QueryNode,
    pub required: bool,
    pub negated: bool,
    pub depth: Depth,
    pub connected: bool,
}

impl SubQuery {
    fn with_relation(relation: Relation, node: QueryNode) -> Self {
        Self {
            relation,
            node,
            required: true,
            negated: false,
            depth: Depth::Limited(1),
            connected: false,
        }
    }

    pub fn children(node: QueryNode) -> Self {
        Self::with_relation(Relation::Children, node)
    }

    pub fn parents(node: QueryNode) -> Self {
        Self::with_relation(Relation::Parents, node)
    }

    /// Rejects the parent node if any child matches
    pub fn not_children(node: QueryNode) -> Self {
        Self::children(node).negated()
    }

    /// Rejects the parent node if any parent matches
    pub fn not_parents(node: QueryNode) -> Self {
        Self::parents(node).negated()
    }

    /// Flood-fill all descendants (matching `node`'s conditions)
    pub fn fill(node: QueryNode) -> Self {
        Self {
            depth: Depth::Unbounded,
            ..Self::with_relation(Relation::Fill, node)
        }
    }

    pub fn depth(mut self, depth: u32) -> Self {
        self.depth = Depth::Limited(depth);
        self
    }

    pub fn unbounded(mut self) -> Self {
        self.depth = Depth::Unbounded;
        self
    }

    pub fn connected(mut self) -> Self {
        self.connected = true;
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn negated(mut self) -> Self {
        self.negated = true;
        self
    }

    pub fn direction(&self) -> Direction {
        match self.relation {
            Relation::Parents => Direction::Ancestors,
            Relation::Children | Relation::Fill => Direction::Descendants,
        }
    }
}

/// Declarative description of one query node
///
/// Nothing is checked until the node is turned into a [`Query`].
#[derive(Debug, Clone, Default)]
pub struct QueryNode {
    lookups: Vec<(String, Vec<String>)>,
    save: Option<String>,
    subs: Vec<SubQuery>,
}

impl QueryNode {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `key` (with optional `__FLAGS`) to match one of `values`
    pub fn when<I, S>(mut self, key: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.lookups
            .push((key.to_string(), values.into_iter().map(Into::into).collect()));
        self
    }

    pub fn save(mut self, name: &str) -> Self {
        self.save = Some(name.to_string());
        self
    }

    pub fn with(mut self, sub: SubQuery) -> Self {
        self.subs.push(sub);
        self
    }

    pub fn children(self, node: QueryNode) -> Self {
        self.with(SubQuery::children(node))
    }

    pub fn parents(self, node: QueryNode) -> Self {
        self.with(SubQuery::parents(node))
    }

    pub fn not_children(self, node: QueryNode) -> Self {
        self.with(SubQuery::not_children(node))
    }

    pub fn not_parents(self, node: QueryNode) -> Self {
        self.with(SubQuery::not_parents(node))
    }

    pub fn fill(self, node: QueryNode) -> Self {
        self.with(SubQuery::fill(node))
    }

    /// Validate into a [`Query`]
    pub fn build(self) -> Result<Query, QueryError> {
        Query::new(self)
    }
}

/// A validated query node
#[derive(Debug)]
pub(crate) struct Node {
    pub conditions: Vec<Condition>,
    pub save: Option<Arc<str>>,
    pub links: Vec<Link>,
    pub fills: Vec<FillSpec>,
}

/// A validated structural sub-query
#[derive(Debug)]
pub(crate) struct Link {
    pub direction: Direction,
    pub required: bool,
    pub negated: bool,
    pub depth: Depth,
    pub connected: bool,
    pub node: Node,
}

/// A validated fill attached to a saved node
#[derive(Debug)]
pub(crate) struct FillSpec {
    pub conditions: Vec<Condition>,
    pub depth: Depth,
    pub connected: bool,
}

/// An immutable, validated tree pattern
#[derive(Debug, Clone)]
pub struct Query {
    root: Arc<Node>,
    save_names: Vec<Arc<str>>,
}

impl Query {
    pub fn new(root: QueryNode) -> Result<Self, QueryError> {
        let mut save_names = Vec::new();
        let root = compile_node(root, false, &mut save_names)?;
        Ok(Self {
            root: Arc::new(root),
            save_names,
        })
    }

    /// Every save name in the query, in declaration order
    pub fn save_names(&self) -> &[Arc<str>] {
        &self.save_names
    }

    pub(crate) fn root(&self) -> &Node {
        &self.root
    }
}

fn compile_conditions(lookups: Vec<(String, Vec<String>)>) -> Result<Vec<Condition>, QueryError> {
    lookups
        .into_iter()
        .map(|(key, values)| Condition::new(&key, &values))
        .collect()
}

fn compile_node(
    node: QueryNode,
    in_negated: bool,
    save_names: &mut Vec<Arc<str>>,
) -> Result<Node, QueryError> {
    let conditions = compile_conditions(node.lookups)?;

    let save = match node.save {
        Some(name) if in_negated => return Err(QueryError::NegatedSave(name)),
        Some(name) => {
            if save_names.iter().any(|n| **n == *name) {
                return Err(QueryError::DuplicateSaveName(name));
            }
            let name: Arc<str> = name.into();
            save_names.push(name.clone());
            Some(name)
        }
        None => None,
    };

    let mut links = Vec::new();
    let mut fills = Vec::new();
    for sub in node.subs {
        if sub.depth == Depth::Limited(0) {
            return Err(QueryError::InvalidDepth);
        }
        if sub.relation == Relation::Fill {
            if in_negated {
                return Err(QueryError::NegatedFill);
            }
            if sub.negated || !sub.node.subs.is_empty() {
                return Err(QueryError::FillCannotNest);
            }
            if let Some(name) = sub.node.save {
                return Err(QueryError::FillCannotSave(name));
            }
            let conditions = compile_conditions(sub.node.lookups)?;
            if save.is_none() {
                // Nothing to flood with
                tracing::debug!("dropping fill under a node without save name");
                continue;
            }
            fills.push(FillSpec {
                conditions,
                depth: sub.depth,
                connected: sub.connected,
            });
            continue;
        }

        if sub.negated && !sub.required {
            return Err(QueryError::NegatedOptional);
        }
        let direction = sub.direction();
        let child = compile_node(sub.node, in_negated || sub.negated, save_names)?;
        links.push(Link {
            direction,
            required: sub.required,
            negated: sub.negated,
            depth: sub.depth,
            connected: sub.connected,
            node: child,
        });
    }

    Ok(Node {
        conditions,
        save,
        links,
        fills,
    })
}
