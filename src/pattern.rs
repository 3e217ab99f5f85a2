//! Atomic token conditions
//!
//! A condition tests one attribute of a token against a set of terms.
//! The attribute name may carry match-mode flags after a double
//! underscore, e.g. `lemma__RI` for a case-insensitive regex:
//!
//! - `N`: negate (the token passes if no term matches)
//! - `R`: regular expression, searched anywhere in the value
//! - `I`: ignore case
//! - `F`: fixed string, matched against the whole value
//!
//! Without `R` or `F`, terms are wildcards over the whole value: `*` for
//! any run of characters and `?` for a single character.

use crate::query::QueryError;
use crate::store::{TokenPos, TokenStore};
use lasso::Spur;
use regex::{Regex, RegexBuilder};
use std::fmt::Debug;

/// Match-mode flags parsed from an attribute key
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MatchMode {
    pub negate: bool,
    pub regex: bool,
    pub ignore_case: bool,
    pub fixed: bool,
}

impl MatchMode {
    /// Split `attribute__FLAGS` into the attribute name and its flags
    pub fn parse_key(key: &str) -> Result<(&str, MatchMode), QueryError> {
        let Some((attribute, flags)) = key.rsplit_once("__") else {
            return Ok((key, MatchMode::default()));
        };
        // Lowercase suffixes belong to the attribute name
        if attribute.is_empty() || !flags.chars().all(|c| c.is_ascii_uppercase()) {
            return Ok((key, MatchMode::default()));
        }

        let mut mode = MatchMode::default();
        for flag in flags.chars() {
            match flag {
                'N' => mode.negate = true,
                'R' => mode.regex = true,
                'I' => mode.ignore_case = true,
                'F' => mode.fixed = true,
                _ => {
                    return Err(QueryError::UnsupportedMatchMode {
                        key: key.to_string(),
                        flag,
                    });
                }
            }
        }
        if mode.regex && mode.fixed {
            return Err(QueryError::ConflictingMatchModes(key.to_string()));
        }
        Ok((attribute, mode))
    }
}

/// One term of a condition: either a literal or a compiled pattern
#[derive(Clone)]
pub enum Term {
    Exact(String),
    Pattern(String, Regex), // Source term + compiled regex
}

impl Debug for Term {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Term::Exact(s) => f.debug_tuple("Exact").field(s).finish(),
            Term::Pattern(source, _) => f.debug_tuple("Pattern").field(source).finish(),
        }
    }
}

// Compare source terms, not compiled regexes
impl PartialEq for Term {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Term::Exact(a), Term::Exact(b)) => a == b,
            (Term::Pattern(a, _), Term::Pattern(b, _)) => a == b,
            _ => false,
        }
    }
}

impl Term {
    fn compile(value: &str, mode: MatchMode) -> Result<Term, QueryError> {
        let source = if mode.regex {
            value.to_string()
        } else if mode.fixed || !has_wildcards(value) {
            if !mode.ignore_case {
                return Ok(Term::Exact(value.to_string()));
            }
            format!("^{}$", regex::escape(value))
        } else {
            glob_to_regex(value)
        };

        let regex = RegexBuilder::new(&source)
            .case_insensitive(mode.ignore_case)
            .build()
            .map_err(|source| QueryError::InvalidRegex {
                pattern: value.to_string(),
                source,
            })?;
        Ok(Term::Pattern(value.to_string(), regex))
    }
}

fn has_wildcards(value: &str) -> bool {
    value.contains(['*', '?'])
}

/// Translate a `*`/`?` wildcard into an anchored regex
fn glob_to_regex(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 8);
    out.push('^');
    let mut buf = [0u8; 4];
    for c in value.chars() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            _ => out.push_str(&regex::escape(c.encode_utf8(&mut buf))),
        }
    }
    out.push('$');
    out
}

/// A test of one token attribute against a set of terms
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub attribute: String,
    pub mode: MatchMode,
    pub terms: Vec<Term>,
}

impl Condition {
    /// Compile a condition from a flagged key and its values
    pub fn new<S: AsRef<str>>(key: &str, values: &[S]) -> Result<Self, QueryError> {
        let (attribute, mode) = MatchMode::parse_key(key)?;
        if values.is_empty() {
            return Err(QueryError::EmptyCondition(key.to_string()));
        }
        let terms = values
            .iter()
            .map(|value| Term::compile(value.as_ref(), mode))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            attribute: attribute.to_string(),
            mode,
            terms,
        })
    }

    /// Resolve the condition against a store's columns and symbols
    ///
    /// Returns `None` if the store has no such column.
    pub(crate) fn bind<'q>(&'q self, store: &TokenStore) -> Option<BoundCondition<'q>> {
        let column = store.column(&self.attribute)?;
        let mut exact = Vec::new();
        let mut patterns = Vec::new();
        for term in &self.terms {
            match term {
                // A literal never interned cannot match any token
                Term::Exact(value) => exact.extend(store.lookup_symbol(value)),
                Term::Pattern(_, regex) => patterns.push(regex),
            }
        }
        Some(BoundCondition {
            column,
            negate: self.mode.negate,
            exact,
            patterns,
        })
    }
}

/// A condition resolved against one store
#[derive(Debug)]
pub(crate) struct BoundCondition<'q> {
    column: usize,
    negate: bool,
    exact: Vec<Spur>,
    patterns: Vec<&'q Regex>,
}

impl BoundCondition<'_> {
    #[inline]
    pub(crate) fn test(&self, store: &TokenStore, pos: TokenPos) -> bool {
        let hit = match store.symbol(pos, self.column) {
            None => false,
            Some(sym) => {
                self.exact.contains(&sym) || {
                    !self.patterns.is_empty() && {
                        let value = store.resolve(sym);
                        self.patterns.iter().any(|re| re.is_match(value))
                    }
                }
            }
        };
        hit != self.negate
    }
}
