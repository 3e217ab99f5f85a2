//! Indexed token store
//!
//! Tokens from dependency parses, partitioned by (document, sentence).
//! Each token has at most one parent in the same sentence, so every
//! sentence is a small tree. The store is frozen once built: queries run
//! against a read-only snapshot with O(1) lookup by global id and in both
//! directions along parent links.

use lasso::{Spur, ThreadedRodeo};
use rustc_hash::FxHashMap;
use std::fmt;
use std::ops::Range;
use thiserror::Error;

/// Name of the column holding the dependency relation to the parent
pub const RELATION: &str = "relation";

/// Position of a token inside a [`TokenStore`]
pub type TokenPos = usize;

/// Globally unique token identifier: (document, sentence, token_id)
///
/// `doc` indexes the store's sorted document table, so ids order the same
/// way as (document name, sentence, token_id).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GlobalId {
    pub doc: u32,
    pub sentence: u32,
    pub token: u32,
}

impl GlobalId {
    pub const fn new(doc: u32, sentence: u32, token: u32) -> Self {
        Self {
            doc,
            sentence,
            token,
        }
    }
}

impl fmt::Display for GlobalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.doc, self.sentence, self.token)
    }
}

/// Error building or extending a token store
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Store error: duplicate token {doc}.{sentence}.{token}")]
    DuplicateToken {
        doc: String,
        sentence: u32,
        token: u32,
    },

    #[error("Store error: token {doc}.{sentence}.{token} refers to missing parent {parent}")]
    MissingParent {
        doc: String,
        sentence: u32,
        token: u32,
        parent: u32,
    },

    #[error("Store error: annotation has several rows for token {0}")]
    DuplicatedRows(String),

    #[error("Store error: annotation has {found} rows but the store has {expected} tokens")]
    AnnotationMismatch { expected: usize, found: usize },
}

#[derive(Debug)]
struct PendingToken {
    doc: u32,
    sentence: u32,
    token: u32,
    parent: Option<u32>,
    values: Vec<(usize, Spur)>,
}

/// Accumulates token rows and validates them into a [`TokenStore`]
#[derive(Debug)]
pub struct TokenStoreBuilder {
    rows: Vec<PendingToken>,
    docs: Vec<String>,
    doc_ids: FxHashMap<String, u32>,
    columns: Vec<String>,
    column_ids: FxHashMap<String, usize>,
    interner: ThreadedRodeo,
}

impl TokenStoreBuilder {
    pub fn new() -> Self {
        let mut builder = Self {
            rows: Vec::new(),
            docs: Vec::new(),
            doc_ids: FxHashMap::default(),
            columns: Vec::new(),
            column_ids: FxHashMap::default(),
            interner: ThreadedRodeo::new(),
        };
        builder.column_id(RELATION);
        builder
    }

    fn column_id(&mut self, name: &str) -> usize {
        if let Some(&id) = self.column_ids.get(name) {
            return id;
        }
        let id = self.columns.len();
        self.columns.push(name.to_string());
        self.column_ids.insert(name.to_string(), id);
        id
    }

    fn doc_id(&mut self, name: &str) -> u32 {
        if let Some(&id) = self.doc_ids.get(name) {
            return id;
        }
        let id = self.docs.len() as u32;
        self.docs.push(name.to_string());
        self.doc_ids.insert(name.to_string(), id);
        id
    }

    /// Add one token row
    ///
    /// `parent` is the token_id of the parent in the same sentence, or
    /// `None` for a root. Attribute names that have not been seen yet
    /// become new columns. Validation happens in [`build`](Self::build).
    pub fn push<'a, I>(
        &mut self,
        doc: &str,
        sentence: u32,
        token: u32,
        parent: Option<u32>,
        relation: &str,
        attrs: I,
    ) -> &mut Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let doc = self.doc_id(doc);
        let mut values = vec![(0, self.interner.get_or_intern(relation))];
        for (key, value) in attrs {
            let column = self.column_id(key);
            values.push((column, self.interner.get_or_intern(value)));
        }
        self.rows.push(PendingToken {
            doc,
            sentence,
            token,
            parent,
            values,
        });
        self
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Sort, index and validate the accumulated rows
    pub fn build(self) -> Result<TokenStore, StoreError> {
        let Self {
            mut rows,
            docs,
            columns,
            column_ids,
            interner,
            ..
        } = self;

        // Documents are renumbered in name order
        let mut order: Vec<u32> = (0..docs.len() as u32).collect();
        order.sort_by(|&a, &b| docs[a as usize].cmp(&docs[b as usize]));
        let mut remap = vec![0u32; docs.len()];
        for (new_id, &old_id) in order.iter().enumerate() {
            remap[old_id as usize] = new_id as u32;
        }
        let docs: Vec<String> = order.iter().map(|&id| docs[id as usize].clone()).collect();
        for row in &mut rows {
            row.doc = remap[row.doc as usize];
        }
        rows.sort_by_key(|row| (row.doc, row.sentence, row.token));

        let n = rows.len();
        let mut ids = Vec::with_capacity(n);
        let mut lookup = FxHashMap::default();
        lookup.reserve(n);
        for (pos, row) in rows.iter().enumerate() {
            let id = GlobalId::new(row.doc, row.sentence, row.token);
            if lookup.insert(id, pos).is_some() {
                return Err(StoreError::DuplicateToken {
                    doc: docs[row.doc as usize].clone(),
                    sentence: row.sentence,
                    token: row.token,
                });
            }
            ids.push(id);
        }

        let mut parents = vec![None; n];
        let mut children = vec![Vec::new(); n];
        for (pos, row) in rows.iter().enumerate() {
            let Some(parent) = row.parent else {
                continue;
            };
            let parent_id = GlobalId::new(row.doc, row.sentence, parent);
            let Some(&parent_pos) = lookup.get(&parent_id) else {
                return Err(StoreError::MissingParent {
                    doc: docs[row.doc as usize].clone(),
                    sentence: row.sentence,
                    token: row.token,
                    parent,
                });
            };
            parents[pos] = Some(parent_pos);
            // Rows are in token order, so children stay sorted
            children[parent_pos].push(pos);
        }

        let mut sentences = Vec::new();
        let mut start = 0;
        for pos in 1..=n {
            if pos == n || (ids[pos].doc, ids[pos].sentence) != (ids[start].doc, ids[start].sentence)
            {
                sentences.push(start..pos);
                start = pos;
            }
        }

        let mut values = vec![vec![None; n]; columns.len()];
        for (pos, row) in rows.iter().enumerate() {
            for &(column, sym) in &row.values {
                values[column][pos] = Some(sym);
            }
        }

        Ok(TokenStore {
            docs,
            ids,
            parents,
            children,
            sentences,
            lookup,
            columns,
            column_ids,
            values,
            interner,
        })
    }
}

impl Default for TokenStoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A frozen, indexed collection of tokens
#[derive(Debug)]
pub struct TokenStore {
    docs: Vec<String>,
    ids: Vec<GlobalId>,
    parents: Vec<Option<TokenPos>>,
    children: Vec<Vec<TokenPos>>,
    sentences: Vec<Range<TokenPos>>,
    lookup: FxHashMap<GlobalId, TokenPos>,
    columns: Vec<String>,
    column_ids: FxHashMap<String, usize>,
    values: Vec<Vec<Option<Spur>>>,
    interner: ThreadedRodeo,
}

impl TokenStore {
    pub fn builder() -> TokenStoreBuilder {
        TokenStoreBuilder::new()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// All global ids, in store order
    pub fn ids(&self) -> &[GlobalId] {
        &self.ids
    }

    pub fn id(&self, pos: TokenPos) -> GlobalId {
        self.ids[pos]
    }

    pub fn position(&self, id: GlobalId) -> Option<TokenPos> {
        self.lookup.get(&id).copied()
    }

    /// Resolve a global id from a document name
    pub fn global_id(&self, doc: &str, sentence: u32, token: u32) -> Option<GlobalId> {
        let doc = self
            .docs
            .binary_search_by(|name| name.as_str().cmp(doc))
            .ok()? as u32;
        let id = GlobalId::new(doc, sentence, token);
        self.lookup.contains_key(&id).then_some(id)
    }

    pub fn doc_name(&self, doc: u32) -> Option<&str> {
        self.docs.get(doc as usize).map(String::as_str)
    }

    pub fn docs(&self) -> &[String] {
        &self.docs
    }

    /// Render an id with the document name instead of its index
    ///
    /// Ids whose document is not in this store keep the numeric index.
    pub fn display_id(&self, id: GlobalId) -> String {
        match self.doc_name(id.doc) {
            Some(name) => format!("{}.{}.{}", name, id.sentence, id.token),
            None => id.to_string(),
        }
    }

    pub fn parent(&self, pos: TokenPos) -> Option<TokenPos> {
        self.parents[pos]
    }

    /// Children of a token, in token order
    pub fn children(&self, pos: TokenPos) -> &[TokenPos] {
        &self.children[pos]
    }

    /// Contiguous position ranges, one per (document, sentence)
    pub fn sentences(&self) -> &[Range<TokenPos>] {
        &self.sentences
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<usize> {
        self.column_ids.get(name).copied()
    }

    #[inline]
    pub fn symbol(&self, pos: TokenPos, column: usize) -> Option<Spur> {
        self.values[column][pos]
    }

    /// Symbol for a value if any token carries it
    pub fn lookup_symbol(&self, value: &str) -> Option<Spur> {
        self.interner.get(value)
    }

    pub fn resolve(&self, sym: Spur) -> &str {
        self.interner.resolve(&sym)
    }

    pub fn value(&self, pos: TokenPos, column: usize) -> Option<&str> {
        self.symbol(pos, column).map(|sym| self.resolve(sym))
    }

    /// Value of a named column for a token, if both exist
    pub fn get(&self, id: GlobalId, column: &str) -> Option<&str> {
        self.value(self.position(id)?, self.column(column)?)
    }

    /// Replace or add a column, one value per token in store order
    pub(crate) fn set_column<'a, I>(&mut self, name: &str, values: I)
    where
        I: IntoIterator<Item = Option<&'a str>>,
    {
        let interned: Vec<Option<Spur>> = values
            .into_iter()
            .map(|value| value.map(|v| self.interner.get_or_intern(v)))
            .collect();
        debug_assert_eq!(interned.len(), self.len());
        match self.column(name) {
            Some(column) => self.values[column] = interned,
            None => {
                self.column_ids.insert(name.to_string(), self.columns.len());
                self.columns.push(name.to_string());
                self.values.push(interned);
            }
        }
    }
}
