//! # Path Utilities
//!
//! Archive paths are `/`-separated strings with the empty string denoting
//! the root directory. They never begin or end with `/` and never contain
//! empty, `.` or `..` segments; [`normalize`] is the single entry point
//! that enforces this, and every public operation normalizes its path
//! arguments before touching the index.
//!
//! The parent of a path is the path with its final segment (and the `/`
//! before it) removed; the parent of a single-segment path is the root.
//! This definition is mirrored by the generated `parent` columns in the
//! index schema, so [`parent`] and the SQL expression must agree exactly.
//!
//! Glob patterns support `?`, `*`, `[...]` character classes and `**`
//! (zero or more whole segments, crossing `/`). Patterns are translated to
//! an anchored regex; the literal prefix before the first metacharacter is
//! extracted separately so the index can bound the candidate set with a
//! primary-key range scan instead of scanning every row.

use eyre::Result;
use regex::Regex;

use crate::error::BarecatError;

/// Normalizes a path: strips leading `/`, collapses consecutive `/`,
/// strips a trailing `/`. `.` and `..` segments are rejected.
pub fn normalize(path: &str) -> Result<String> {
    let mut out = String::with_capacity(path.len());
    for segment in path.split('/') {
        if segment.is_empty() {
            continue;
        }
        if segment == "." || segment == ".." {
            return Err(BarecatError::InvalidPath(format!(
                "'{path}' contains a '{segment}' segment"
            ))
            .into());
        }
        if !out.is_empty() {
            out.push('/');
        }
        out.push_str(segment);
    }
    Ok(out)
}

/// Parent of a normalized path; `None` for the root, which has no parent.
pub fn parent(path: &str) -> Option<&str> {
    if path.is_empty() {
        return None;
    }
    Some(match path.rfind('/') {
        Some(i) => &path[..i],
        None => "",
    })
}

/// Final segment of a normalized path; the root maps to `""`.
pub fn basename(path: &str) -> &str {
    match path.rfind('/') {
        Some(i) => &path[i + 1..],
        None => path,
    }
}

/// Proper ancestors of a normalized path, root first, the path itself
/// excluded: `ancestors("a/b/c")` yields `""`, `"a"`, `"a/b"`.
pub fn ancestors(path: &str) -> impl Iterator<Item = &str> {
    std::iter::once("").chain(path.match_indices('/').map(move |(i, _)| &path[..i]))
}

/// Whether `path` lies strictly inside the directory `dir`.
pub fn is_within(path: &str, dir: &str) -> bool {
    if dir.is_empty() {
        return !path.is_empty();
    }
    path.len() > dir.len() && path.starts_with(dir) && path.as_bytes()[dir.len()] == b'/'
}

/// Escapes a literal path for use in a SQLite `GLOB` pattern.
pub fn escape_sql_glob(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for ch in path.chars() {
        match ch {
            '[' => out.push_str("[[]"),
            '?' => out.push_str("[?]"),
            '*' => out.push_str("[*]"),
            _ => out.push(ch),
        }
    }
    out
}

/// Translates a glob pattern into an anchored regex over full paths.
///
/// A `**` that stands alone as a segment matches zero or more whole
/// segments; within a segment, `*` and `?` never cross `/`.
pub fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let segments: Vec<&str> = pattern.split('/').collect();
    let last = segments.len() - 1;
    let mut re = String::from("^");
    for (i, segment) in segments.iter().enumerate() {
        if *segment == "**" {
            if i == last {
                re.push_str(".*");
            } else {
                re.push_str("(?:.*/)?");
            }
            continue;
        }
        translate_segment(pattern, segment, &mut re)?;
        if i != last {
            re.push('/');
        }
    }
    re.push('$');
    Regex::new(&re)
        .map_err(|e| BarecatError::InvalidPattern(format!("'{pattern}': {e}")).into())
}

fn translate_segment(pattern: &str, segment: &str, re: &mut String) -> Result<()> {
    let mut chars = segment.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '*' => re.push_str("[^/]*"),
            '?' => re.push_str("[^/]"),
            '[' => {
                re.push('[');
                let mut closed = false;
                let mut first = true;
                while let Some(c) = chars.next() {
                    match c {
                        '!' if first => re.push('^'),
                        ']' if !first => {
                            re.push(']');
                            closed = true;
                            break;
                        }
                        '\\' => re.push_str("\\\\"),
                        c => re.push(c),
                    }
                    first = false;
                }
                if !closed {
                    return Err(BarecatError::InvalidPattern(format!(
                        "'{pattern}': unterminated character class"
                    ))
                    .into());
                }
            }
            ch => re.push_str(&regex::escape(&ch.to_string())),
        }
    }
    Ok(())
}

/// Longest literal prefix of a glob pattern, truncated to the last `/`
/// before the first metacharacter. This is the range-scan key for
/// candidate enumeration; `""` means the whole archive must be scanned.
pub fn literal_prefix(pattern: &str) -> &str {
    let meta = pattern
        .find(|c| matches!(c, '*' | '?' | '['))
        .unwrap_or(pattern.len());
    match pattern[..meta].rfind('/') {
        Some(i) => &pattern[..=i],
        None => "",
    }
}

/// Smallest string strictly greater than every string starting with
/// `prefix`, for use as an exclusive upper bound in a range scan. `None`
/// when no such bound exists (empty prefix, or all chars at the maximum).
pub fn prefix_upper_bound(prefix: &str) -> Option<String> {
    let mut chars: Vec<char> = prefix.chars().collect();
    while let Some(&last) = chars.last() {
        // Incrementing '/' or any ASCII char below 0x7f stays a valid
        // scalar; anything trickier just drops the char and retries.
        if (last as u32) < 0x7f {
            *chars.last_mut().unwrap() = char::from_u32(last as u32 + 1).unwrap();
            return Some(chars.into_iter().collect());
        }
        chars.pop();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_and_collapses() {
        assert_eq!(normalize("/a//b/c/").unwrap(), "a/b/c");
        assert_eq!(normalize("").unwrap(), "");
        assert_eq!(normalize("/").unwrap(), "");
        assert_eq!(normalize("a").unwrap(), "a");
    }

    #[test]
    fn normalize_rejects_dot_segments() {
        assert!(normalize("a/./b").is_err());
        assert!(normalize("../a").is_err());
        assert!(normalize("a/..").is_err());
    }

    #[test]
    fn parent_matches_sql_definition() {
        assert_eq!(parent(""), None);
        assert_eq!(parent("a"), Some(""));
        assert_eq!(parent("a/b"), Some("a"));
        assert_eq!(parent("a/b/c"), Some("a/b"));
    }

    #[test]
    fn ancestors_root_first() {
        let anc: Vec<&str> = ancestors("a/b/c").collect();
        assert_eq!(anc, vec!["", "a", "a/b"]);
        let anc: Vec<&str> = ancestors("a").collect();
        assert_eq!(anc, vec![""]);
    }

    #[test]
    fn is_within_bounds() {
        assert!(is_within("a/b", "a"));
        assert!(is_within("a/b", ""));
        assert!(!is_within("a", "a"));
        assert!(!is_within("ab/c", "a"));
        assert!(!is_within("", ""));
    }

    #[test]
    fn glob_star_stays_in_segment() {
        let re = glob_to_regex("a/*.bin").unwrap();
        assert!(re.is_match("a/x.bin"));
        assert!(!re.is_match("a/b/x.bin"));
    }

    #[test]
    fn glob_double_star_crosses_segments() {
        let re = glob_to_regex("**/x*").unwrap();
        assert!(re.is_match("x1"));
        assert!(re.is_match("a/x1"));
        assert!(re.is_match("a/b/x2"));
        assert!(!re.is_match("a/b/y3"));
    }

    #[test]
    fn glob_classes_and_question() {
        let re = glob_to_regex("a/[xy]?").unwrap();
        assert!(re.is_match("a/x1"));
        assert!(re.is_match("a/y2"));
        assert!(!re.is_match("a/z1"));
        assert!(!re.is_match("a/x12"));

        let re = glob_to_regex("a/[!x]1").unwrap();
        assert!(re.is_match("a/y1"));
        assert!(!re.is_match("a/x1"));
    }

    #[test]
    fn glob_unterminated_class_is_invalid() {
        let err = glob_to_regex("a/[xy").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BarecatError>(),
            Some(BarecatError::InvalidPattern(_))
        ));
    }

    #[test]
    fn literal_prefix_truncates_at_slash() {
        assert_eq!(literal_prefix("a/b/x*"), "a/b/");
        assert_eq!(literal_prefix("a/bc*/d"), "a/");
        assert_eq!(literal_prefix("**/x"), "");
        assert_eq!(literal_prefix("x*"), "");
    }

    #[test]
    fn prefix_upper_bound_increments_last_char() {
        assert_eq!(prefix_upper_bound("a/b/").as_deref(), Some("a/b0"));
        assert_eq!(prefix_upper_bound("").as_deref(), None);
    }

    #[test]
    fn sql_glob_escaping() {
        assert_eq!(escape_sql_glob("a[1]/b*?"), "a[[]1]/b[*][?]");
    }
}
