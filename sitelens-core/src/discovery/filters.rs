use regex::Regex;

use crate::error::{Result, ScanError};

const REGEX_METACHARACTERS: &[char] = &['^', '$', '(', ')', '|', '+', '?', '[', ']', '{', '}', '\\'];

/// Include/exclude gate applied to canonical paths. Exclude wins; an empty
/// include list lets everything through.
#[derive(Debug, Clone, Default)]
pub struct RouteFilter {
    include: Vec<Regex>,
    exclude: Vec<Regex>,
}

impl RouteFilter {
    pub fn new(include: &[String], exclude: &[String]) -> Result<Self> {
        Ok(Self {
            include: include
                .iter()
                .map(|p| compile_path_pattern(p))
                .collect::<Result<_>>()?,
            exclude: exclude
                .iter()
                .map(|p| compile_path_pattern(p))
                .collect::<Result<_>>()?,
        })
    }

    pub fn allows(&self, path: &str) -> bool {
        if self.exclude.iter().any(|re| re.is_match(path)) {
            return false;
        }
        self.include.is_empty() || self.include.iter().any(|re| re.is_match(path))
    }
}

/// Compiles a user pattern. Anything with regex metacharacters is taken as
/// an unanchored regex; otherwise it is an anchored glob where `*` matches
/// within one segment and `**` matches across segments.
pub fn compile_path_pattern(pattern: &str) -> Result<Regex> {
    let source = if pattern.contains(REGEX_METACHARACTERS) {
        pattern.to_string()
    } else {
        glob_to_regex(pattern)
    };
    Regex::new(&source)
        .map_err(|e| ScanError::ConfigValidation(format!("pattern `{pattern}` is invalid: {e}")))
}

fn glob_to_regex(glob: &str) -> String {
    let mut out = String::from("^");
    let mut rest = glob;
    while !rest.is_empty() {
        if let Some(tail) = rest.strip_prefix("**") {
            out.push_str(".*");
            rest = tail;
        } else if let Some(tail) = rest.strip_prefix('*') {
            out.push_str("[^/]*");
            rest = tail;
        } else {
            let next = rest.find('*').unwrap_or(rest.len());
            out.push_str(&regex::escape(&rest[..next]));
            rest = &rest[next..];
        }
    }
    out.push('$');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(include: &[&str], exclude: &[&str]) -> RouteFilter {
        let owned = |v: &[&str]| v.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        RouteFilter::new(&owned(include), &owned(exclude)).unwrap()
    }

    #[test]
    fn empty_include_allows_everything() {
        assert!(filter(&[], &[]).allows("/anything"));
    }

    #[test]
    fn globs_distinguish_single_and_multi_segment() {
        let f = filter(&["/blog/*"], &[]);
        assert!(f.allows("/blog/post"));
        assert!(!f.allows("/blog/2024/post"));

        let f = filter(&["/docs/**"], &[]);
        assert!(f.allows("/docs/a/b/c"));
        assert!(!f.allows("/about"));
    }

    #[test]
    fn exclude_wins_over_include() {
        let f = filter(&["/blog/**"], &["/blog/drafts/*"]);
        assert!(f.allows("/blog/live"));
        assert!(!f.allows("/blog/drafts/wip"));
    }

    #[test]
    fn metacharacters_switch_to_regex() {
        let f = filter(&[], &[r"^/admin(/|$)"]);
        assert!(!f.allows("/admin"));
        assert!(!f.allows("/admin/users"));
        assert!(f.allows("/administrators-guide"));
    }

    #[test]
    fn invalid_regex_is_a_config_error() {
        let err = RouteFilter::new(&["(unclosed".to_string()], &[]).unwrap_err();
        assert!(matches!(err, ScanError::ConfigValidation(_)));
    }
}
