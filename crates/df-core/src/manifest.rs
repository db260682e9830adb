//! Remote record of the last installed dependency set

use std::collections::BTreeSet;

/// Set of dependency tokens, compared without regard to order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyManifest {
    tokens: BTreeSet<String>,
}

impl DependencyManifest {
    /// Build a manifest from tokens; entries are additionally split on whitespace
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let tokens = tokens
            .into_iter()
            .flat_map(|t| {
                t.as_ref()
                    .split_whitespace()
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .collect();
        Self { tokens }
    }

    /// Parse the remote file contents
    pub fn parse(text: &str) -> Self {
        Self::new(text.split_whitespace())
    }

    /// Render the file contents: sorted tokens on one line
    pub fn render(&self) -> String {
        let mut text = self.tokens.iter().cloned().collect::<Vec<_>>().join(" ");
        text.push('\n');
        text
    }

    /// Tokens in sorted order
    pub fn tokens(&self) -> impl Iterator<Item = &str> {
        self.tokens.iter().map(String::as_str)
    }

    /// Number of distinct tokens
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Whether the manifest is empty
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_does_not_matter() {
        let installed = DependencyManifest::parse("wiringpi oracle-java8-jdk\n");
        let requested = DependencyManifest::new(["oracle-java8-jdk", "wiringpi"]);
        assert_eq!(installed, requested);
    }

    #[test]
    fn test_duplicates_and_whitespace() {
        let a = DependencyManifest::new(["git  git", "\tvim\n"]);
        let b = DependencyManifest::parse("vim git");
        assert_eq!(a, b);
        assert_eq!(a.len(), 2);
    }

    #[test]
    fn test_render_is_sorted() {
        let manifest = DependencyManifest::new(["zsh", "git", "curl"]);
        assert_eq!(manifest.render(), "curl git zsh\n");
        assert_eq!(DependencyManifest::parse(&manifest.render()), manifest);
    }

    #[test]
    fn test_missing_manifest_differs_from_request() {
        let installed = DependencyManifest::parse("");
        assert!(installed.is_empty());
        assert_ne!(installed, DependencyManifest::new(["git"]));
    }
}
