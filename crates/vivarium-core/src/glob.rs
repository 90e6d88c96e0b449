//! Glob matching for filesystem paths and URLs.
//!
//! Patterns compile to anchored regular expressions. Two dialects are
//! in use:
//!
//! - **Path globs** (`Glob::path`): `*` matches within one path
//!   segment, `**` matches across segments, `?` matches one non-slash
//!   character.
//! - **URL globs** (`Glob::url`): `*` matches any run of characters,
//!   which is what network mock tables expect
//!   (`https://api.example.com/*` covers the whole subtree).
//!
//! Matching is case-insensitive in both dialects.

use regex::Regex;

/// A compiled glob pattern.
#[derive(Debug, Clone)]
pub struct Glob {
    pattern: String,
    regex: Regex,
}

impl Glob {
    /// Compile a path-dialect glob.
    #[must_use]
    pub fn path(pattern: &str) -> Self {
        Self::compile(pattern, true)
    }

    /// Compile a URL-dialect glob.
    #[must_use]
    pub fn url(pattern: &str) -> Self {
        Self::compile(pattern, false)
    }

    fn compile(pattern: &str, segment_aware: bool) -> Self {
        let mut regex_str = String::with_capacity(pattern.len() * 2 + 4);
        regex_str.push_str("(?i)^");

        let chars: Vec<char> = pattern.chars().collect();
        let mut i = 0;
        while i < chars.len() {
            match chars[i] {
                '*' => {
                    if segment_aware {
                        if i + 1 < chars.len() && chars[i + 1] == '*' {
                            regex_str.push_str(".*");
                            i += 1;
                        } else {
                            regex_str.push_str("[^/]*");
                        }
                    } else {
                        regex_str.push_str(".*");
                    }
                }
                '?' if segment_aware => regex_str.push_str("[^/]"),
                c => {
                    if "\\.+()[]{}^$|?".contains(c) {
                        regex_str.push('\\');
                    }
                    regex_str.push(c);
                }
            }
            i += 1;
        }
        regex_str.push('$');

        // The translation above escapes every regex metacharacter, so
        // compilation cannot fail; fall back to match-nothing anyway.
        let regex = Regex::new(&regex_str)
            .unwrap_or_else(|_| Regex::new("$^").expect("empty regex compiles"));

        Self {
            pattern: pattern.to_string(),
            regex,
        }
    }

    /// The source pattern.
    #[must_use]
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Test a candidate string against the pattern.
    #[must_use]
    pub fn is_match(&self, candidate: &str) -> bool {
        self.regex.is_match(candidate)
    }
}

/// Test a candidate against a list of compiled globs.
#[must_use]
pub fn matches_any(candidate: &str, globs: &[Glob]) -> bool {
    globs.iter().any(|g| g.is_match(candidate))
}

/// Normalize a filesystem path: force a leading `/`, collapse `.` and
/// empty segments, resolve `..` without escaping the root.
#[must_use]
pub fn normalize_path(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }

    let mut out = String::with_capacity(path.len() + 1);
    out.push('/');
    out.push_str(&segments.join("/"));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn star_stays_within_segment() {
        let g = Glob::path("/data/*");
        assert!(g.is_match("/data/x"));
        assert!(g.is_match("/data/file.txt"));
        assert!(!g.is_match("/data/sub/x"));
        assert!(!g.is_match("/other/x"));
    }

    #[test]
    fn double_star_crosses_segments() {
        let g = Glob::path("/data/**");
        assert!(g.is_match("/data/x"));
        assert!(g.is_match("/data/sub/deep/x"));
        assert!(!g.is_match("/database/x"));

        let all = Glob::path("/**");
        assert!(all.is_match("/anything/at/all"));
    }

    #[test]
    fn question_mark_matches_one_char() {
        let g = Glob::path("/logs/app.?");
        assert!(g.is_match("/logs/app.1"));
        assert!(!g.is_match("/logs/app.12"));
        assert!(!g.is_match("/logs/app./"));
    }

    #[test]
    fn regex_metacharacters_are_literal() {
        let g = Glob::path("/a+b/(c)/d.txt");
        assert!(g.is_match("/a+b/(c)/d.txt"));
        assert!(!g.is_match("/aab/(c)/dxtxt"));
    }

    #[test]
    fn url_star_crosses_everything() {
        let g = Glob::url("https://api.example.com/*");
        assert!(g.is_match("https://api.example.com/v1/users?id=2"));
        assert!(!g.is_match("https://other.example.com/v1"));
    }

    #[test]
    fn matching_is_case_insensitive() {
        let g = Glob::path("/Data/*");
        assert!(g.is_match("/data/X"));
    }

    #[test]
    fn normalize_collapses_dots() {
        assert_eq!(normalize_path("/a/./b/../c"), "/a/c");
        assert_eq!(normalize_path("a/b"), "/a/b");
        assert_eq!(normalize_path("/../../x"), "/x");
        assert_eq!(normalize_path("//a///b/"), "/a/b");
        assert_eq!(normalize_path("/"), "/");
    }
}
