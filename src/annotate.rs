//! Annotation of a token store from node matches
//!
//! Turns a long-form [`NodeMatches`] table into one role and one match-id
//! value per token. Ties between several bindings of the same token are
//! resolved in three steps:
//!
//! 1. With `unique_fill`, a direct binding (fill level 0) beats every fill
//!    binding of the token, and among fill bindings only the nearest one
//!    (smallest level) survives.
//! 2. Tokens that still have several bindings are either concatenated into
//!    one delimited value (`concat_dup`) or emitted as several rows.
//! 3. The result is joined onto the store left-outer, in store order.

use crate::matcher::{MatchError, MatchId, NodeMatch, NodeMatches};
use crate::query::Query;
use crate::runner::{RunOptions, run_queries};
use crate::store::{GlobalId, StoreError, TokenStore};
use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;

/// Error annotating a store
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AnnotateError {
    #[error("Annotate error: node matches declare no save names")]
    EmptyBindings,

    #[error("Annotate error: missing columns: {}", .0.join(", "))]
    MissingColumns(Vec<String>),

    #[error(transparent)]
    Match(#[from] MatchError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Non-fatal conditions reported alongside an annotation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    /// No match rows at all; every token is left unannotated
    ZeroRows,
    /// A requested role is not declared by any query
    MissingSaveTarget(String),
}

/// Options for [`annotate`]
#[derive(Debug, Clone)]
pub struct AnnotateOptions {
    column: String,
    unique_fill: bool,
    concat_dup: bool,
    show_fill: bool,
    delimiter: String,
    roles: Option<Vec<String>>,
}

impl AnnotateOptions {
    /// Annotate into `column`, `column_id` and optionally `column_fill`
    pub fn new(column: &str) -> Self {
        Self {
            column: column.to_string(),
            unique_fill: true,
            concat_dup: true,
            show_fill: false,
            delimiter: ",".to_string(),
            roles: None,
        }
    }

    pub fn unique_fill(mut self, unique_fill: bool) -> Self {
        self.unique_fill = unique_fill;
        self
    }

    pub fn concat_dup(mut self, concat_dup: bool) -> Self {
        self.concat_dup = concat_dup;
        self
    }

    pub fn show_fill(mut self, show_fill: bool) -> Self {
        self.show_fill = show_fill;
        self
    }

    pub fn delimiter(mut self, delimiter: &str) -> Self {
        self.delimiter = delimiter.to_string();
        self
    }

    /// Only annotate these save names
    pub fn roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles = Some(roles.into_iter().map(Into::into).collect());
        self
    }

    pub fn role_column(&self) -> &str {
        &self.column
    }

    pub fn id_column(&self) -> String {
        format!("{}_id", self.column)
    }

    pub fn fill_column(&self) -> String {
        format!("{}_fill", self.column)
    }
}

/// Annotation values for one output row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotationRow {
    pub token: GlobalId,
    pub role: Option<String>,
    pub id: Option<String>,
    pub fill: Option<u32>,
}

impl AnnotationRow {
    fn empty(token: GlobalId) -> Self {
        Self {
            token,
            role: None,
            id: None,
            fill: None,
        }
    }
}

/// Store-aligned annotation columns
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Annotation {
    role_column: String,
    id_column: String,
    fill_column: Option<String>,
    rows: Vec<AnnotationRow>,
    diagnostics: Vec<Diagnostic>,
}

impl Annotation {
    pub fn role_column(&self) -> &str {
        &self.role_column
    }

    pub fn id_column(&self) -> &str {
        &self.id_column
    }

    pub fn fill_column(&self) -> Option<&str> {
        self.fill_column.as_deref()
    }

    /// Rows in store order; a token may span several rows when not
    /// concatenating
    pub fn rows(&self) -> &[AnnotationRow] {
        &self.rows
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    /// Rows for one token
    pub fn get(&self, token: GlobalId) -> impl Iterator<Item = &AnnotationRow> + '_ {
        self.rows.iter().filter(move |row| row.token == token)
    }

    /// Whether some token spans several rows
    pub fn is_duplicated(&self) -> bool {
        self.rows.windows(2).any(|w| w[0].token == w[1].token)
    }
}

/// Resolve node matches into per-token annotation values
pub fn annotate(
    store: &TokenStore,
    matches: &NodeMatches,
    options: &AnnotateOptions,
) -> Result<Annotation, AnnotateError> {
    if matches.save_names().is_empty() {
        return Err(AnnotateError::EmptyBindings);
    }

    let mut diagnostics = Vec::new();
    if let Some(roles) = &options.roles {
        for role in roles {
            if !matches.save_names().iter().any(|name| **name == **role) {
                tracing::warn!(role = %role, "no query declares this save name");
                diagnostics.push(Diagnostic::MissingSaveTarget(role.clone()));
            }
        }
    }

    // Exact duplicates collapse into their first row
    let mut seen: FxHashMap<(&MatchId, &str, GlobalId), usize> = FxHashMap::default();
    let mut rows: Vec<NodeMatch> = Vec::new();
    for row in matches {
        let wanted = match &options.roles {
            Some(roles) => roles.iter().any(|role| **role == *row.role),
            None => true,
        };
        if !wanted {
            continue;
        }
        match seen.get(&(&row.match_id, &*row.role, row.token)) {
            Some(&i) => rows[i].fill_level = rows[i].fill_level.min(row.fill_level),
            None => {
                seen.insert((&row.match_id, &*row.role, row.token), rows.len());
                rows.push(row.clone());
            }
        }
    }

    if rows.is_empty() {
        tracing::warn!(column = %options.column, "annotating zero rows");
        diagnostics.push(Diagnostic::ZeroRows);
    }

    if options.unique_fill {
        rows = unique_fill(rows);
    }

    let mut by_token: FxHashMap<GlobalId, Vec<&NodeMatch>> = FxHashMap::default();
    for row in &rows {
        by_token.entry(row.token).or_default().push(row);
    }

    let mut out = Vec::with_capacity(store.len());
    for &token in store.ids() {
        let Some(bound) = by_token.remove(&token) else {
            out.push(AnnotationRow::empty(token));
            continue;
        };
        if options.concat_dup {
            out.push(concat(store, token, &bound, &options.delimiter));
        } else {
            out.extend(bound.iter().map(|row| AnnotationRow {
                token,
                role: Some(row.role.to_string()),
                id: Some(row.match_id.render(store)),
                fill: Some(row.fill_level),
            }));
        }
    }
    if !by_token.is_empty() {
        tracing::debug!(tokens = by_token.len(), "skipping matches for tokens not in store");
    }

    let fill_column = options.show_fill.then(|| options.fill_column());
    if fill_column.is_none() {
        for row in &mut out {
            row.fill = None;
        }
    }

    tracing::debug!(
        column = %options.column,
        rows = rows.len(),
        tokens = out.iter().filter(|row| row.role.is_some()).count(),
        "annotated"
    );

    Ok(Annotation {
        role_column: options.column.clone(),
        id_column: options.id_column(),
        fill_column,
        rows: out,
        diagnostics,
    })
}

/// Drop fill bindings of tokens bound directly, and keep only the nearest
/// fill binding of the rest
fn unique_fill(rows: Vec<NodeMatch>) -> Vec<NodeMatch> {
    let mut direct = FxHashSet::default();
    let mut nearest: FxHashMap<GlobalId, (u32, usize)> = FxHashMap::default();
    for (i, row) in rows.iter().enumerate() {
        if row.fill_level == 0 {
            direct.insert(row.token);
            continue;
        }
        let entry = nearest.entry(row.token).or_insert((row.fill_level, i));
        if row.fill_level < entry.0 {
            *entry = (row.fill_level, i);
        }
    }

    rows.into_iter()
        .enumerate()
        .filter(|(i, row)| {
            row.fill_level == 0
                || (!direct.contains(&row.token)
                    && nearest.get(&row.token).is_some_and(|&(_, keep)| keep == *i))
        })
        .map(|(_, row)| row)
        .collect()
}

fn concat(store: &TokenStore, token: GlobalId, rows: &[&NodeMatch], delimiter: &str) -> AnnotationRow {
    let role = rows
        .iter()
        .map(|row| &*row.role)
        .collect::<Vec<_>>()
        .join(delimiter);
    let id = rows
        .iter()
        .map(|row| row.match_id.render(store))
        .collect::<Vec<_>>()
        .join(delimiter);
    AnnotationRow {
        token,
        role: Some(role),
        id: Some(id),
        fill: rows.iter().map(|row| row.fill_level).min(),
    }
}

/// A node-match row joined with token columns
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectedRow<'a, 's> {
    pub node: &'a NodeMatch,
    pub values: Vec<Option<&'s str>>,
}

impl NodeMatches {
    /// Join each row with the requested columns of its token
    pub fn project<'a, 's>(
        &'a self,
        store: &'s TokenStore,
        columns: &[&str],
    ) -> Result<Vec<ProjectedRow<'a, 's>>, AnnotateError> {
        let missing: Vec<String> = columns
            .iter()
            .filter(|name| store.column(name).is_none())
            .map(|name| name.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(AnnotateError::MissingColumns(missing));
        }

        let columns: Vec<usize> = columns.iter().filter_map(|name| store.column(name)).collect();
        Ok(self
            .iter()
            .map(|node| {
                let pos = store.position(node.token);
                ProjectedRow {
                    node,
                    values: columns
                        .iter()
                        .map(|&column| pos.and_then(|pos| store.value(pos, column)))
                        .collect(),
                }
            })
            .collect())
    }
}

impl TokenStore {
    /// Merge an annotation as attribute columns
    ///
    /// Same-named columns are replaced. The annotation must have exactly
    /// one row per token.
    pub fn with_annotation(mut self, annotation: &Annotation) -> Result<TokenStore, StoreError> {
        if let Some(w) = annotation.rows.windows(2).find(|w| w[0].token == w[1].token) {
            return Err(StoreError::DuplicatedRows(self.display_id(w[0].token)));
        }
        let aligned = annotation.rows.len() == self.len()
            && annotation
                .rows
                .iter()
                .zip(self.ids())
                .all(|(row, id)| row.token == *id);
        if !aligned {
            return Err(StoreError::AnnotationMismatch {
                expected: self.len(),
                found: annotation.rows.len(),
            });
        }

        self.set_column(
            &annotation.role_column,
            annotation.rows.iter().map(|row| row.role.as_deref()),
        );
        self.set_column(
            &annotation.id_column,
            annotation.rows.iter().map(|row| row.id.as_deref()),
        );
        if let Some(column) = &annotation.fill_column {
            let fills: Vec<Option<String>> = annotation
                .rows
                .iter()
                .map(|row| row.fill.map(|level| level.to_string()))
                .collect();
            self.set_column(column, fills.iter().map(Option::as_deref));
        }
        Ok(self)
    }
}

/// Options for [`annotate_queries`]
#[derive(Debug, Clone)]
pub struct AnnotateQueriesOptions {
    pub annotate: AnnotateOptions,
    pub run: RunOptions,
    /// Replace values already present in the role column
    pub overwrite: bool,
}

impl AnnotateQueriesOptions {
    pub fn new(column: &str) -> Self {
        Self {
            annotate: AnnotateOptions::new(column),
            run: RunOptions::default(),
            overwrite: true,
        }
    }

    pub fn annotate(mut self, annotate: AnnotateOptions) -> Self {
        self.annotate = annotate;
        self
    }

    pub fn run(mut self, run: RunOptions) -> Self {
        self.run = run;
        self
    }

    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }
}

/// Run queries, annotate and merge the result into the store
///
/// Without `overwrite`, tokens that already carry a role are blocked and
/// keep their previous role, id and fill values.
pub fn annotate_queries<'q, I>(
    store: TokenStore,
    queries: I,
    options: &AnnotateQueriesOptions,
) -> Result<(TokenStore, Vec<Diagnostic>), AnnotateError>
where
    I: IntoIterator<Item = (&'q str, &'q Query)>,
{
    let settings = &options.annotate;
    let previous = if options.overwrite {
        None
    } else {
        store.column(settings.role_column())
    };

    let mut run = options.run.clone();
    if let Some(column) = previous {
        let annotated = (0..store.len()).filter(|&pos| store.symbol(pos, column).is_some());
        run.block.extend(annotated.map(|pos| store.id(pos)));
    }

    let matches = run_queries(&store, queries, &run)?;
    let mut annotation = annotate(&store, &matches, settings)?;

    if let Some(role_column) = previous {
        let id_column = store.column(&settings.id_column());
        let fill_column = annotation.fill_column.as_deref().and_then(|name| store.column(name));
        for row in &mut annotation.rows {
            let Some(pos) = store.position(row.token) else {
                continue;
            };
            if row.role.is_some() || store.symbol(pos, role_column).is_none() {
                continue;
            }
            row.role = store.value(pos, role_column).map(str::to_string);
            row.id = id_column.and_then(|c| store.value(pos, c)).map(str::to_string);
            row.fill = fill_column
                .and_then(|c| store.value(pos, c))
                .and_then(|v| v.parse().ok());
        }
    }

    let diagnostics = annotation.diagnostics.clone();
    let store = store.with_annotation(&annotation)?;
    Ok((store, diagnostics))
}
