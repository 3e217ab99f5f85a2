//! Treequery: declarative pattern queries over dependency parses
//!
//! Tokens live in a [`TokenStore`] indexed by (document, sentence, token).
//! A [`Query`] describes a tree pattern: token conditions, save names and
//! nested sub-queries over children or parents. The [`Matcher`] finds its
//! matches, [`run_queries`] applies several queries in priority order, and
//! [`annotate`] writes the saved roles back onto the tokens.
//!
//! ```
//! use treequery::{AnnotateOptions, Matcher, QueryNode, TokenStore, annotate};
//!
//! let mut builder = TokenStore::builder();
//! builder
//!     .push("d1", 1, 1, None, "root", [("lemma", "says")])
//!     .push("d1", 1, 2, Some(1), "su", [("lemma", "John")])
//!     .push("d1", 1, 3, Some(1), "vc", [("lemma", "dat")]);
//! let store = builder.build().unwrap();
//!
//! let query = QueryNode::new()
//!     .when("lemma", ["says"])
//!     .save("verb")
//!     .children(QueryNode::new().when("relation", ["su"]).save("source"))
//!     .build()
//!     .unwrap();
//!
//! let matches = Matcher::new(&store).node_matches(&query, &Default::default()).unwrap();
//! let annotation = annotate(&store, &matches, &AnnotateOptions::new("quote")).unwrap();
//! let store = store.with_annotation(&annotation).unwrap();
//!
//! let john = store.global_id("d1", 1, 2).unwrap();
//! assert_eq!(store.get(john, "quote"), Some("source"));
//! ```

pub mod annotate; // Role/id columns from node matches
pub mod conllu; // CoNLL-U loading
pub mod matcher; // Recursive tree-pattern matching
pub mod parser; // Query text syntax
pub mod pattern; // Token conditions and match modes
pub mod query; // Query construction and validation
pub mod runner; // Ordered, optionally chained query runs
pub mod store; // Indexed token store

// Re-exports for convenience
pub use annotate::{
    AnnotateError, AnnotateOptions, AnnotateQueriesOptions, Annotation, AnnotationRow, Diagnostic,
    ProjectedRow, annotate, annotate_queries,
};
pub use conllu::{CoNLLUReader, LoadError, ParseError};
pub use matcher::{BlockSet, Match, MatchError, MatchId, MatchedNode, Matcher, NodeMatch, NodeMatches};
pub use parser::{parse_node, parse_query};
pub use pattern::{Condition, MatchMode};
pub use query::{Depth, Direction, Query, QueryError, QueryNode, Relation, SubQuery};
pub use runner::{RunOptions, run_queries};
pub use store::{GlobalId, RELATION, StoreError, TokenStore, TokenStoreBuilder};
