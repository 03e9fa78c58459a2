use glob::{MatchOptions, Pattern};
use std::path::{Component, Path};

const CASE_SENSITIVE: bool = !cfg!(any(target_os = "windows", target_os = "macos"));

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: CASE_SENSITIVE,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

#[derive(Debug, Clone)]
enum Rule {
    /// No separator in the pattern: tested against every path segment.
    Segment(Pattern),
    /// Tested against the whole relative path.
    Path(Pattern),
}

/// Compiled set of glob exclusion rules, evaluated against root-relative paths.
#[derive(Debug, Clone, Default)]
pub struct PathMatcher {
    rules: Vec<Rule>,
}

impl PathMatcher {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, glob::PatternError> {
        let rules = patterns
            .iter()
            .map(|p| p.as_ref().trim())
            .filter(|p| !p.is_empty())
            .map(|p| {
                let normalized = p.trim_start_matches("./").trim_end_matches('/');
                let pattern = Pattern::new(normalized)?;
                Ok(if normalized.contains('/') {
                    Rule::Path(pattern)
                } else {
                    Rule::Segment(pattern)
                })
            })
            .collect::<Result<Vec<_>, glob::PatternError>>()?;
        Ok(Self { rules })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn matches(&self, relative_path: &Path) -> bool {
        if self.rules.is_empty() {
            return false;
        }
        let segments: Vec<String> = relative_path
            .components()
            .filter_map(|c| match c {
                Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect();
        if segments.is_empty() {
            return false;
        }
        let joined = segments.join("/");

        self.rules.iter().any(|rule| match rule {
            Rule::Segment(pattern) => segments
                .iter()
                .any(|segment| pattern.matches_with(segment, MATCH_OPTIONS)),
            Rule::Path(pattern) => pattern.matches_with(&joined, MATCH_OPTIONS),
        })
    }
}

/// One-shot form of [`PathMatcher::matches`]. Invalid patterns never match.
pub fn matches<S: AsRef<str>>(relative_path: &Path, patterns: &[S]) -> bool {
    let valid: Vec<&str> = patterns
        .iter()
        .map(|p| p.as_ref())
        .filter(|p| Pattern::new(p).is_ok())
        .collect();
    PathMatcher::new(&valid)
        .map(|m| m.matches(relative_path))
        .unwrap_or(false)
}
