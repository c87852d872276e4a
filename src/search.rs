//! Search engine: evaluates [`SearchArgs`] against a built index file.
//!
//! Case-sensitive regexes of the form `^literal$` and `^literal` are turned
//! into equality and prefix tests. Both are pushed down into SQL as an
//! equality or a range on `name`, so the name index is used. Substring
//! queries are pushed down as `instr` over `name` or `name_lower`. Everything
//! else is a scan in `(path, line)` order that stops as soon as the result
//! cap is reached.

use std::path::Path;

use regex::Regex;
use regex_syntax::hir::{HirKind, Look};
use rusqlite::{params_from_iter, Connection};

use crate::error::{Result, SymbolsError};
use crate::{store, SearchArgs, Symbol};

/// A string test, from cheapest to most general.
#[derive(Debug, Clone)]
pub enum Matcher {
    /// Matches everything (empty pattern or a bare `^`).
    All,
    Substring { needle: String, case_sensitive: bool },
    Exact(String),
    Prefix(String),
    Regex(Regex),
}

impl Matcher {
    /// Plain substring test, case-folded unless `case_sensitive`.
    pub fn substring(needle: &str, case_sensitive: bool) -> Self {
        if needle.is_empty() {
            return Matcher::All;
        }
        let needle = if case_sensitive { needle.to_string() } else { needle.to_lowercase() };
        Matcher::Substring { needle, case_sensitive }
    }

    /// Regex test with the literal fast paths applied when possible.
    pub fn regex(pattern: &str, case_sensitive: bool) -> Result<Self> {
        if pattern.is_empty() || pattern == "^" {
            return Ok(Matcher::All);
        }
        if case_sensitive {
            match anchored_literal(pattern) {
                Some((literal, true)) => return Ok(Matcher::Exact(literal)),
                Some((literal, false)) => return Ok(Matcher::Prefix(literal)),
                None => {}
            }
        }
        let expr = if case_sensitive { pattern.to_string() } else { format!("(?i){}", pattern) };
        let regex = Regex::new(&expr).map_err(|source| SymbolsError::InvalidRegex {
            pattern: pattern.to_string(),
            source,
        })?;
        Ok(Matcher::Regex(regex))
    }

    pub fn is_match(&self, value: &str) -> bool {
        match self {
            Matcher::All => true,
            Matcher::Substring { needle, case_sensitive: true } => value.contains(needle.as_str()),
            Matcher::Substring { needle, case_sensitive: false } => value.to_lowercase().contains(needle.as_str()),
            Matcher::Exact(literal) => value == literal,
            Matcher::Prefix(literal) => value.starts_with(literal.as_str()),
            Matcher::Regex(regex) => regex.is_match(value),
        }
    }
}

/// `^lit$` gives `(lit, true)`, `^lit` gives `(lit, false)`, anything else
/// (including patterns that do not parse) gives `None`.
pub fn anchored_literal(pattern: &str) -> Option<(String, bool)> {
    let hir = regex_syntax::Parser::new().parse(pattern).ok()?;
    let HirKind::Concat(parts) = hir.kind() else { return None };
    let (first, rest) = parts.split_first()?;
    if !matches!(first.kind(), HirKind::Look(Look::Start)) {
        return None;
    }
    let (body, exact) = match rest.split_last() {
        Some((last, body)) if matches!(last.kind(), HirKind::Look(Look::End)) => (body, true),
        _ => (rest, false),
    };
    if body.is_empty() {
        return None;
    }
    let mut literal = Vec::new();
    for part in body {
        match part.kind() {
            HirKind::Literal(lit) => literal.extend_from_slice(&lit.0),
            _ => return None,
        }
    }
    String::from_utf8(literal).ok().map(|s| (s, exact))
}

/// Smallest string above every string that starts with `prefix`, under
/// SQLite's byte-wise text ordering. `None` when no such bound exists (every
/// character is `char::MAX`).
pub fn prefix_upper_bound(prefix: &str) -> Option<String> {
    let mut chars: Vec<char> = prefix.chars().collect();
    while let Some(last) = chars.pop() {
        let next = match last {
            '\u{D7FF}' => Some('\u{E000}'),
            char::MAX => None,
            c => char::from_u32(c as u32 + 1),
        };
        if let Some(next) = next {
            chars.push(next);
            return Some(chars.into_iter().collect());
        }
    }
    None
}

// ─── Query plan ─────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct QueryPlan {
    pub name: Matcher,
    pub include: Vec<Matcher>,
    pub exclude: Option<Matcher>,
    pub limit: usize,
}

impl QueryPlan {
    pub fn new(args: &SearchArgs) -> Result<Self> {
        let case_sensitive = args.is_case_sensitive;
        let name = if args.is_regexp {
            Matcher::regex(&args.query, case_sensitive)?
        } else {
            Matcher::substring(&args.query, case_sensitive)
        };
        let include = args
            .include_patterns
            .iter()
            .map(|p| Matcher::regex(p, case_sensitive))
            .filter(|m| !matches!(m, Ok(Matcher::All)))
            .collect::<Result<Vec<_>>>()?;
        let exclude = match Matcher::regex(&args.exclude_pattern, case_sensitive)? {
            Matcher::All => None,
            m => Some(m),
        };
        Ok(Self { name, include, exclude, limit: args.limit() })
    }

    pub fn matches_path(&self, path: &str) -> bool {
        self.include.iter().all(|m| m.is_match(path))
            && !self.exclude.as_ref().is_some_and(|m| m.is_match(path))
    }

    pub fn matches(&self, symbol: &Symbol) -> bool {
        self.name.is_match(&symbol.name) && self.matches_path(&symbol.path)
    }

    /// SQL for the candidate rows and its bound parameters.
    fn sql(&self) -> (String, Vec<String>) {
        const SELECT: &str = "SELECT name, path, line, kind, parent FROM symbols";
        const ORDER: &str = "ORDER BY path, line, id";
        let (filter, params) = match &self.name {
            Matcher::Exact(literal) => ("WHERE name = ?1", vec![literal.clone()]),
            Matcher::Prefix(literal) => match prefix_upper_bound(literal) {
                Some(upper) => ("WHERE name >= ?1 AND name < ?2", vec![literal.clone(), upper]),
                None => ("WHERE name >= ?1", vec![literal.clone()]),
            },
            // `name_lower` holds `str::to_lowercase` of the name, the same
            // folding the needle went through.
            Matcher::Substring { needle, case_sensitive: false } => ("WHERE instr(name_lower, ?1) > 0", vec![needle.clone()]),
            Matcher::Substring { needle, case_sensitive: true } => ("WHERE instr(name, ?1) > 0", vec![needle.clone()]),
            Matcher::All | Matcher::Regex(_) => ("", Vec::new()),
        };
        (format!("{} {} {}", SELECT, filter, ORDER), params)
    }

    pub fn execute(&self, conn: &Connection) -> Result<Vec<Symbol>> {
        let (sql, params) = self.sql();
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(params.iter()))?;
        let mut results = Vec::new();
        while results.len() < self.limit {
            let Some(row) = rows.next()? else { break };
            let symbol = Symbol {
                name: row.get(0)?,
                path: row.get(1)?,
                line: row.get(2)?,
                kind: row.get(3)?,
                parent: row.get(4)?,
            };
            if self.matches(&symbol) {
                results.push(symbol);
            }
        }
        Ok(results)
    }
}

/// Run `args` against the index at `db_file`, read-only.
pub fn search(args: &SearchArgs, db_file: &Path) -> Result<Vec<Symbol>> {
    let plan = QueryPlan::new(args)?;
    let conn = store::open_read_only(db_file)?;
    plan.execute(&conn)
}

#[cfg(test)]
#[path = "search_tests.rs"]
mod tests;
