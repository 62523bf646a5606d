//! Relative item path resolution
//!
//! Item attributes may reference other items relative to the item that
//! declares them. A single leading dot roots the reference at the item itself,
//! every additional dot climbs one level up the tree:
//!
//! - `.child` below `living.light` resolves to `living.light.child`
//! - `..dimmer` resolves to `living.dimmer`
//! - `..self` resolves to `living`
//!
//! Paths that do not start with a dot are returned unchanged.

use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

/// Errors raised while resolving a relative reference
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("relative path '{reference}' of item '{base}' climbs above the root")]
    AboveRoot { base: String, reference: String },
}

const SELF_TERMINATORS: &str = "() +-*/<>!=&%";

/// Resolve `reference` relative to the item at `base`
pub fn resolve_relative(base: &str, reference: &str) -> Result<String, PathError> {
    if !reference.starts_with('.') {
        return Ok(reference.to_string());
    }
    let mut rel = reference.trim_end();
    let mut root = base.to_string();

    while let Some(rest) = rel.strip_prefix('.') {
        rel = rest;
        if rel.starts_with('.') {
            match root.rfind('.') {
                Some(idx) => root.truncate(idx),
                None if root.is_empty() => {
                    return Err(PathError::AboveRoot {
                        base: base.to_string(),
                        reference: reference.to_string(),
                    })
                }
                None => root.clear(),
            }
        }
    }

    let mut trailing = "";
    if rel.len() > 4 && rel.starts_with("self") {
        let next = rel[4..].chars().next().unwrap_or(' ');
        if SELF_TERMINATORS.contains(next) {
            trailing = &rel[4..];
            rel = "";
        }
    }

    let mut result = match (root.is_empty(), rel.is_empty()) {
        (true, _) => rel.to_string(),
        (false, true) => root,
        (false, false) => format!("{root}.{rel}"),
    };
    result.push_str(trailing);

    if let Some(stripped) = result.strip_suffix(".self") {
        result = stripped.to_string();
    }
    Ok(result.replace(".self.", "."))
}

fn reference_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"\b(item|set_item|age|changed_by)\(\s*(['"])(\.[^'"]*)(['"])"#)
            .expect("reference pattern is valid")
    })
}

/// Rewrite relative references inside an expression to absolute paths
///
/// References appear as the first string argument of the item access
/// functions, e.g. `item('..temp') * 2`.
pub fn rewrite_expression(base: &str, expression: &str) -> Result<String, PathError> {
    let pattern = reference_pattern();
    let mut out = String::with_capacity(expression.len());
    let mut last = 0;
    for caps in pattern.captures_iter(expression) {
        let (Some(whole), Some(func), Some(quote), Some(rel)) =
            (caps.get(0), caps.get(1), caps.get(2), caps.get(3))
        else {
            continue;
        };
        let absolute = resolve_relative(base, rel.as_str())?;
        out.push_str(&expression[last..whole.start()]);
        out.push_str(func.as_str());
        out.push('(');
        out.push_str(quote.as_str());
        out.push_str(&absolute);
        out.push_str(quote.as_str());
        last = whole.end();
    }
    out.push_str(&expression[last..]);
    Ok(out)
}

/// Item paths referenced by an expression through `item('...')`
pub fn referenced_paths(expression: &str) -> Vec<String> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| {
        Regex::new(r#"\bitem\(\s*['"]([^'"]+)['"]"#)
            .expect("item pattern is valid")
    });
    let mut paths: Vec<String> = Vec::new();
    for caps in pattern.captures_iter(expression) {
        if let Some(m) = caps.get(1) {
            let path = m.as_str().to_string();
            if !paths.contains(&path) {
                paths.push(path);
            }
        }
    }
    paths
}

/// The parent path of a dotted path, `None` for top-level paths
pub fn parent_path(path: &str) -> Option<&str> {
    path.rfind('.').map(|idx| &path[..idx])
}

/// The last segment of a dotted path
pub fn leaf_name(path: &str) -> &str {
    path.rsplit('.').next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absolute_paths_pass_through() {
        assert_eq!(resolve_relative("a.b", "x.y").unwrap(), "x.y");
    }

    #[test]
    fn test_single_dot_is_child() {
        assert_eq!(resolve_relative("living.light", ".dimmer").unwrap(), "living.light.dimmer");
    }

    #[test]
    fn test_each_extra_dot_climbs() {
        assert_eq!(resolve_relative("living.light", "..dimmer").unwrap(), "living.dimmer");
        assert_eq!(resolve_relative("a.b.c", "...x").unwrap(), "a.x");
        assert_eq!(resolve_relative("a.b.c", "..self").unwrap(), "a.b");
        assert_eq!(resolve_relative("a.b", ".self").unwrap(), "a.b");
    }

    #[test]
    fn test_self_infix_and_operator_suffix() {
        assert_eq!(resolve_relative("a.b", "..self.c").unwrap(), "a.c");
        assert_eq!(resolve_relative("a.b", ".self()").unwrap(), "a.b()");
    }

    #[test]
    fn test_above_root_is_error() {
        assert!(resolve_relative("a", "...x").is_err());
        assert_eq!(resolve_relative("a", "..x").unwrap(), "x");
    }

    #[test]
    fn test_rewrite_expression() {
        let expr = "item('..temp') * 2 + item(\"outside.temp\")";
        assert_eq!(
            rewrite_expression("house.room.heating", expr).unwrap(),
            "item('house.room.temp') * 2 + item(\"outside.temp\")"
        );
    }

    #[test]
    fn test_referenced_paths() {
        let paths = referenced_paths("item('a.b') + item('c') - item('a.b')");
        assert_eq!(paths, vec!["a.b".to_string(), "c".to_string()]);
    }

    #[test]
    fn test_parent_and_leaf() {
        assert_eq!(parent_path("a.b.c"), Some("a.b"));
        assert_eq!(parent_path("a"), None);
        assert_eq!(leaf_name("a.b.c"), "c");
    }
}
