//! Query text syntax
//!
//! Parses query strings into [`QueryNode`] trees using a pest grammar.
//! The result goes through the same validation as builder-made queries.

use pest::Parser;
use pest::iterators::{Pair, Pairs};
use pest_derive::Parser;
use std::str::FromStr;

use crate::pattern::MatchMode;
use crate::query::{Query, QueryError, QueryNode, SubQuery};

#[derive(Parser)]
#[grammar = "query.pest"]
struct QueryParser;

impl From<pest::error::Error<Rule>> for QueryError {
    fn from(err: pest::error::Error<Rule>) -> Self {
        QueryError::Syntax(err.to_string())
    }
}

/// Parse and validate a query string
pub fn parse_query(input: &str) -> Result<Query, QueryError> {
    parse_node(input)?.build()
}

/// Parse a query string into an unvalidated node tree
pub fn parse_node(input: &str) -> Result<QueryNode, QueryError> {
    let mut pairs = QueryParser::parse(Rule::query, input)?;
    let query = next_pair(&mut pairs, "query")?;
    let mut inner = query.into_inner();
    build_node(next_pair(&mut inner, "node")?)
}

impl FromStr for Query {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_query(s)
    }
}

fn next_pair<'i>(pairs: &mut Pairs<'i, Rule>, what: &str) -> Result<Pair<'i, Rule>, QueryError> {
    pairs
        .next()
        .ok_or_else(|| QueryError::Syntax(format!("Expected {}", what)))
}

/// Parse a node: name? [conditions] { sub-queries }
fn build_node(pair: Pair<Rule>) -> Result<QueryNode, QueryError> {
    let mut node = QueryNode::new();

    for part in pair.into_inner() {
        match part.as_rule() {
            Rule::save_name => node = node.save(part.as_str()),
            Rule::condition_list => {
                for condition in part.into_inner() {
                    let (key, values) = parse_condition(condition)?;
                    node = node.when(&key, values);
                }
            }
            Rule::body => {
                for sub in part.into_inner() {
                    node = node.with(parse_sub_query(sub)?);
                }
            }
            _ => {}
        }
    }

    Ok(node)
}

/// Parse a condition: key="value", key!=("a", "b")
fn parse_condition(pair: Pair<Rule>) -> Result<(String, Vec<String>), QueryError> {
    let mut inner = pair.into_inner();

    let key = next_pair(&mut inner, "condition key")?.as_str();
    let operator = next_pair(&mut inner, "operator")?.as_str();
    let values = next_pair(&mut inner, "condition value")?
        .into_inner()
        .map(|string| unescape(string.into_inner().as_str()))
        .collect();

    // key!="v" is shorthand for the negate flag
    let key = if operator == "!=" {
        let (_, mode) = MatchMode::parse_key(key)?;
        if mode == MatchMode::default() {
            format!("{}__N", key)
        } else {
            format!("{}N", key)
        }
    } else {
        key.to_string()
    };

    Ok((key, values))
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

/// Parse a sub-query: kind (options)? node
fn parse_sub_query(pair: Pair<Rule>) -> Result<SubQuery, QueryError> {
    let mut inner = pair.into_inner();

    let kind = next_pair(&mut inner, "sub-query kind")?.as_str();
    let mut next = next_pair(&mut inner, "sub-query node")?;

    let mut options = Vec::new();
    if next.as_rule() == Rule::options {
        options.extend(next.into_inner());
        next = next_pair(&mut inner, "sub-query node")?;
    }

    let node = build_node(next)?;
    let mut sub = match kind {
        "children" => SubQuery::children(node),
        "parents" => SubQuery::parents(node),
        "not_children" => SubQuery::not_children(node),
        "not_parents" => SubQuery::not_parents(node),
        "fill" => SubQuery::fill(node),
        _ => return Err(QueryError::Syntax(format!("Unknown sub-query: {}", kind))),
    };

    for option in options {
        sub = match option.as_rule() {
            Rule::connected => sub.connected(),
            Rule::optional => sub.optional(),
            Rule::depth_opt => {
                let value = next_pair(&mut option.into_inner(), "depth")?.as_str();
                if value == "inf" {
                    sub.unbounded()
                } else {
                    let depth = value
                        .parse()
                        .map_err(|_| QueryError::Syntax(format!("Invalid depth: {}", value)))?;
                    sub.depth(depth)
                }
            }
            _ => sub,
        };
    }

    Ok(sub)
}
