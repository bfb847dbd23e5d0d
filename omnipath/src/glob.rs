//! Wildcard pattern plumbing: brace expansion, magic detection, and
//! translation of glob patterns into anchored regexes.
//!
//! Matching follows POSIX glob: `*` and `?` stay inside one path segment and
//! never match a leading dot; `**` (when recursive matching is on) spans
//! segments; brace groups fan out before translation.
use crate::{Error, Result};
use regex::Regex;

/// True if the pattern contains wildcard or brace magic.
pub fn has_magic(pattern: &str) -> bool {
    pattern
        .chars()
        .any(|c| matches!(c, '*' | '?' | '[' | '{'))
}

/// True if the pattern contains wildcard magic other than braces.
pub(crate) fn has_magic_ignore_brace(pattern: &str) -> bool {
    pattern.chars().any(|c| matches!(c, '*' | '?' | '['))
}

/// Expand every brace group into the cartesian list of patterns.
///
/// `a/{x,y}/b` becomes `a/x/b` and `a/y/b`; groups may nest. A pattern
/// without braces expands to itself.
pub fn ungloblize(pattern: &str) -> Vec<String> {
    let chars: Vec<char> = pattern.chars().collect();

    let mut open = None;
    let mut depth = 0usize;
    for (index, &c) in chars.iter().enumerate() {
        match c {
            '{' => {
                if depth == 0 {
                    open = Some(index);
                }
                depth += 1;
            }
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    let open = open.unwrap_or(0);
                    let prefix: String = chars[..open].iter().collect();
                    let body: String = chars[open + 1..index].iter().collect();
                    let suffix: String = chars[index + 1..].iter().collect();

                    let mut expanded = Vec::new();
                    for alternative in split_top_level(&body) {
                        for tail in ungloblize(&format!("{alternative}{suffix}")) {
                            expanded.push(format!("{prefix}{tail}"));
                        }
                    }
                    return expanded;
                }
            }
            _ => {}
        }
    }
    vec![pattern.to_string()]
}

/// Split brace-group alternatives at top-level commas.
fn split_top_level(body: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    for c in body.chars() {
        match c {
            '{' => {
                depth += 1;
                current.push(c);
            }
            '}' if depth > 0 => {
                depth -= 1;
                current.push(c);
            }
            ',' if depth == 0 => parts.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    parts.push(current);
    parts
}

/// Collapse runs of 2+ stars into a single star, used when recursive
/// matching is off.
pub(crate) fn collapse_recursive_wildcards(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    let mut stars = 0usize;
    for c in pattern.chars() {
        if c == '*' {
            stars += 1;
            continue;
        }
        if stars > 0 {
            out.push('*');
            stars = 0;
        }
        out.push(c);
    }
    if stars > 0 {
        out.push('*');
    }
    out
}

/// Translate a brace-free glob pattern into an anchored [`Regex`].
pub(crate) fn translate(pattern: &str, recursive: bool) -> Result<Regex> {
    let pattern = if recursive {
        pattern.to_string()
    } else {
        collapse_recursive_wildcards(pattern)
    };
    let chars: Vec<char> = pattern.chars().collect();

    let mut out = String::from("^");
    let mut index = 0;
    let mut segment_start = true;
    while index < chars.len() {
        let c = chars[index];
        match c {
            '*' => {
                let mut stars = 0;
                while index < chars.len() && chars[index] == '*' {
                    stars += 1;
                    index += 1;
                }
                if stars >= 2 {
                    out.push_str(".*");
                } else if segment_start {
                    // a leading dot is not matched by a wildcard
                    out.push_str("(?:[^/.][^/]*)?");
                } else {
                    out.push_str("[^/]*");
                }
                segment_start = false;
                continue;
            }
            '?' => {
                if segment_start {
                    out.push_str("[^/.]");
                } else {
                    out.push_str("[^/]");
                }
                segment_start = false;
            }
            '[' => {
                match translate_class(&chars, index) {
                    Some((class, next)) => {
                        out.push_str(&class);
                        index = next;
                        segment_start = false;
                        continue;
                    }
                    // no closing bracket: a literal '['
                    None => out.push_str("\\["),
                }
                segment_start = false;
            }
            '/' => {
                out.push('/');
                segment_start = true;
            }
            other => {
                out.push_str(&regex::escape(&other.to_string()));
                segment_start = false;
            }
        }
        index += 1;
    }
    out.push('$');

    Regex::new(&out).map_err(|err| Error::InvalidArgument {
        detail: format!("invalid pattern {pattern:?}: {err}"),
    })
}

/// Translate a `[...]` class starting at `open`; returns the regex fragment
/// and the index just past the closing bracket.
fn translate_class(chars: &[char], open: usize) -> Option<(String, usize)> {
    let mut index = open + 1;
    let negated = chars.get(index) == Some(&'!');
    if negated {
        index += 1;
    }
    // a ']' right after the opening (or the negation) is a literal member
    let body_start = index;
    if chars.get(index) == Some(&']') {
        index += 1;
    }
    while index < chars.len() && chars[index] != ']' {
        index += 1;
    }
    if index >= chars.len() {
        return None;
    }

    let mut class = String::from("[");
    if negated {
        class.push('^');
    }
    for &c in &chars[body_start..index] {
        if c == '\\' {
            class.push_str("\\\\");
        } else {
            class.push(c);
        }
    }
    class.push(']');
    Some((class, index + 1))
}

/// Partition a path-like pattern at the first wildcard segment.
///
/// Returns `(literal_prefix, wildcard_suffix)`, each a `/`-joined string.
pub(crate) fn split_magic(pattern: &str) -> (String, String) {
    if !has_magic(pattern) {
        return (pattern.to_string(), String::new());
    }
    let parts: Vec<&str> = pattern.split('/').collect();
    for (index, part) in parts.iter().enumerate() {
        if has_magic(part) {
            return (parts[..index].join("/"), parts[index..].join("/"));
        }
    }
    (pattern.to_string(), String::new())
}

/// Like [`split_magic`], but brace groups do not count as magic and may
/// contain `/`.
pub(crate) fn split_magic_ignore_brace(pattern: &str) -> (String, String) {
    let mut normal_parts: Vec<&str> = Vec::new();
    let mut magic_parts: Vec<&str> = Vec::new();

    let (protocol, rest) = match pattern.find("://") {
        Some(at) => (Some(&pattern[..at + 2]), &pattern[at + 3..]),
        None => (None, pattern),
    };
    let (rest, trailing_slash) = match rest.strip_suffix('/') {
        Some(stripped) => (stripped, true),
        None => (rest, false),
    };

    let mut depth = 0usize;
    let mut segment_start = 0usize;
    let bytes: Vec<(usize, char)> = rest.char_indices().collect();
    for &(at, c) in bytes.iter() {
        match c {
            '{' => depth += 1,
            '}' if depth > 0 => depth -= 1,
            '/' if depth == 0 => {
                let segment = &rest[segment_start..at];
                if has_magic_ignore_brace(segment) {
                    magic_parts.push(&rest[segment_start..]);
                    segment_start = rest.len();
                    break;
                }
                normal_parts.push(segment);
                segment_start = at + 1;
            }
            _ => {}
        }
    }
    if segment_start < rest.len() || (segment_start == 0 && rest.is_empty()) {
        let tail = &rest[segment_start..];
        if has_magic_ignore_brace(tail) {
            magic_parts.push(tail);
        } else {
            normal_parts.push(tail);
        }
    }

    let mut normal = normal_parts.join("/");
    let mut magic = magic_parts.join("/");
    if let Some(protocol) = protocol {
        if normal.is_empty() {
            magic = format!("{protocol}/{magic}");
        } else {
            normal = format!("{protocol}/{normal}");
        }
    }
    if trailing_slash {
        if magic.is_empty() {
            normal.push('/');
        } else {
            magic.push('/');
        }
    }
    (normal, magic)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn braces_expand_cartesian() {
        assert_eq!(ungloblize("a/{x,y}/b"), vec!["a/x/b", "a/y/b"]);
        assert_eq!(
            ungloblize("{a,b}/{1,2}"),
            vec!["a/1", "a/2", "b/1", "b/2"]
        );
        assert_eq!(ungloblize("plain"), vec!["plain"]);
    }

    #[test]
    fn nested_braces_expand_recursively() {
        assert_eq!(
            ungloblize("x{a,b{c,d}}y"),
            vec!["xay", "xbcy", "xbdy"]
        );
    }

    #[test]
    fn wildcards_stay_inside_a_segment() {
        let regex = translate("s3://b/x/*.txt", true).unwrap();
        assert!(regex.is_match("s3://b/x/file.txt"));
        assert!(!regex.is_match("s3://b/x/sub/file.txt"));
        assert!(!regex.is_match("s3://b/x/.hidden.txt"));
    }

    #[test]
    fn double_star_spans_segments() {
        let regex = translate("s3://b/**.txt", true).unwrap();
        assert!(regex.is_match("s3://b/x/y/file.txt"));
        assert!(regex.is_match("s3://b/file.txt"));

        let collapsed = translate("s3://b/**.txt", false).unwrap();
        assert!(!collapsed.is_match("s3://b/x/y/file.txt"));
        assert!(collapsed.is_match("s3://b/file.txt"));
    }

    #[test]
    fn question_mark_and_classes() {
        let regex = translate("file-?.[0-9]", true).unwrap();
        assert!(regex.is_match("file-a.7"));
        assert!(!regex.is_match("file-ab.7"));
        assert!(!regex.is_match("file-a.x"));

        let negated = translate("[!abc]x", true).unwrap();
        assert!(negated.is_match("dx"));
        assert!(!negated.is_match("ax"));
    }

    #[test]
    fn magic_split_keeps_the_protocol() {
        assert_eq!(
            split_magic("s3://bucket/dir/*.txt"),
            ("s3://bucket/dir".to_string(), "*.txt".to_string())
        );
        assert_eq!(
            split_magic("s3://bucket/dir/file"),
            ("s3://bucket/dir/file".to_string(), String::new())
        );
    }

    #[test]
    fn magic_split_ignoring_braces() {
        let (normal, magic) = split_magic_ignore_brace("s3://b/{x,y}/z/*.txt");
        assert_eq!(normal, "s3://b/{x,y}/z");
        assert_eq!(magic, "*.txt");

        let (normal, magic) = split_magic_ignore_brace("s3://b/dir/");
        assert_eq!(normal, "s3://b/dir/");
        assert_eq!(magic, "");
    }
}
