use crate::error::{Error, Result};
use globset::{GlobBuilder, GlobMatcher};

#[derive(Debug, Clone)]
struct Rule {
    matcher: GlobMatcher,
    negated: bool,
    dir_only: bool,
}

/// Compiled ignore spec.
///
/// One pattern per line, gitignore style:
///
/// - blank lines and lines starting with `#` are skipped
/// - `!pattern` re-includes paths matched by an earlier rule
/// - a leading `/`, or any `/` inside the pattern, anchors it to the root;
///   otherwise it matches at any depth
/// - a trailing `/` only matches directories
/// - `*` stays within one path segment, `**` spans segments
///
/// The last matching rule decides.
#[derive(Debug, Clone, Default)]
pub struct IgnoreMatcher {
    rules: Vec<Rule>,
}

impl IgnoreMatcher {
    /// Matcher that ignores nothing
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn parse(spec: &str) -> Result<Self> {
        let mut rules = Vec::new();

        for line in spec.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (negated, pattern) = match line.strip_prefix('!') {
                Some(rest) => (true, rest),
                None => (false, line),
            };
            let (dir_only, pattern) = match pattern.strip_suffix('/') {
                Some(rest) => (true, rest),
                None => (false, pattern),
            };
            let anchored = pattern.starts_with('/') || pattern.contains('/');
            let pattern = pattern.trim_start_matches('/');
            if pattern.is_empty() {
                continue;
            }

            let glob = if anchored {
                pattern.to_string()
            } else {
                format!("**/{pattern}")
            };
            let matcher = GlobBuilder::new(&glob)
                .literal_separator(true)
                .build()
                .map_err(|source| Error::IgnorePattern {
                    pattern: line.to_string(),
                    source,
                })?
                .compile_matcher();

            rules.push(Rule {
                matcher,
                negated,
                dir_only,
            });
        }

        Ok(Self { rules })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Whether `path` (relative, `/`-separated) should be left out
    pub fn is_ignored(&self, path: &str, is_dir: bool) -> bool {
        let path = path.trim_start_matches('/');
        let mut ignored = false;
        for rule in &self.rules {
            if rule.dir_only && !is_dir {
                continue;
            }
            if rule.matcher.is_match(path) {
                ignored = !rule.negated;
            }
        }
        ignored
    }
}
