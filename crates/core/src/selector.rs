//! Label-selector expressions matching applications to nodes.
//!
//! Grammar is the familiar equality/set-based form: comma-separated
//! requirements like `env=dev`, `tier!=web`, `region in (eu, us)`,
//! `arch notin (arm)`, bare `key` (exists), and `!key` (absent).

use std::collections::BTreeMap;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Requirement {
    Eq(String, String),
    NotEq(String, String),
    In(String, Vec<String>),
    NotIn(String, Vec<String>),
    Exists(String),
    NotExists(String),
}

/// A parsed selector expression.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selector {
    requirements: Vec<Requirement>,
}

impl Selector {
    /// Parse a selector expression. An empty expression matches everything.
    pub fn parse(expr: &str) -> Result<Self> {
        let mut requirements = Vec::new();
        for part in split_requirements(expr) {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            requirements.push(parse_requirement(part, expr)?);
        }
        Ok(Self { requirements })
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|r| match r {
            Requirement::Eq(k, v) => labels.get(k).map(|x| x == v).unwrap_or(false),
            Requirement::NotEq(k, v) => labels.get(k).map(|x| x != v).unwrap_or(true),
            Requirement::In(k, vs) => labels.get(k).map(|x| vs.contains(x)).unwrap_or(false),
            Requirement::NotIn(k, vs) => labels.get(k).map(|x| !vs.contains(x)).unwrap_or(true),
            Requirement::Exists(k) => labels.contains_key(k),
            Requirement::NotExists(k) => !labels.contains_key(k),
        })
    }
}

/// Split on commas that are not inside an `in (...)` value set.
fn split_requirements(expr: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, c) in expr.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                out.push(&expr[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    out.push(&expr[start..]);
    out
}

fn parse_requirement(part: &str, expr: &str) -> Result<Requirement> {
    let invalid = || Error::InvalidSelector(expr.to_string());

    if let Some((key, rest)) = split_op(part, " notin ") {
        return Ok(Requirement::NotIn(key, parse_set(&rest).ok_or_else(invalid)?));
    }
    if let Some((key, rest)) = split_op(part, " in ") {
        return Ok(Requirement::In(key, parse_set(&rest).ok_or_else(invalid)?));
    }
    if let Some((key, value)) = split_op(part, "!=") {
        return Ok(Requirement::NotEq(key, value));
    }
    if let Some((key, value)) = split_op(part, "==") {
        return Ok(Requirement::Eq(key, value));
    }
    if let Some((key, value)) = split_op(part, "=") {
        return Ok(Requirement::Eq(key, value));
    }
    if let Some(key) = part.strip_prefix('!') {
        let key = key.trim();
        if key.is_empty() || !is_valid_key(key) {
            return Err(invalid());
        }
        return Ok(Requirement::NotExists(key.to_string()));
    }
    if is_valid_key(part) {
        return Ok(Requirement::Exists(part.to_string()));
    }
    Err(invalid())
}

fn split_op(part: &str, op: &str) -> Option<(String, String)> {
    let (k, v) = part.split_once(op)?;
    let k = k.trim();
    if k.is_empty() || !is_valid_key(k) {
        return None;
    }
    Some((k.to_string(), v.trim().to_string()))
}

fn parse_set(rest: &str) -> Option<Vec<String>> {
    let inner = rest.trim().strip_prefix('(')?.strip_suffix(')')?;
    Some(
        inner
            .split(',')
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .collect(),
    )
}

fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn equality_and_inequality() {
        let s = Selector::parse("env=dev,tier!=web").unwrap();
        assert!(s.matches(&labels(&[("env", "dev"), ("tier", "db")])));
        assert!(!s.matches(&labels(&[("env", "dev"), ("tier", "web")])));
        assert!(!s.matches(&labels(&[("tier", "db")])));
    }

    #[test]
    fn set_membership() {
        let s = Selector::parse("region in (eu, us),arch notin (arm)").unwrap();
        assert!(s.matches(&labels(&[("region", "eu"), ("arch", "amd64")])));
        assert!(s.matches(&labels(&[("region", "us")])));
        assert!(!s.matches(&labels(&[("region", "ap")])));
        assert!(!s.matches(&labels(&[("region", "eu"), ("arch", "arm")])));
    }

    #[test]
    fn exists_and_not_exists() {
        let s = Selector::parse("gpu,!legacy").unwrap();
        assert!(s.matches(&labels(&[("gpu", "true")])));
        assert!(!s.matches(&labels(&[("gpu", "true"), ("legacy", "1")])));
        assert!(!s.matches(&labels(&[])));
    }

    #[test]
    fn empty_selector_matches_everything() {
        let s = Selector::parse("").unwrap();
        assert!(s.matches(&labels(&[])));
        assert!(s.matches(&labels(&[("any", "thing")])));
    }

    #[test]
    fn malformed_expressions_error() {
        assert!(Selector::parse("env in dev").is_err());
        assert!(Selector::parse("=dev").is_err());
        assert!(Selector::parse("bad key=1").is_err());
    }
}
