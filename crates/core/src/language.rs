//! Language tags
//!
//! Languages are opaque lowercase BCP-47-style tags (`"en"`, `"ja"`,
//! `"zh-cn"`). Nothing in the pipeline is pair-specific: every type carries
//! `source_*`/`target_*` tags so a 36-language matrix composes without type
//! changes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// An opaque language tag
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Language(String);

impl Language {
    /// Create a tag, trimming and lowercasing the input
    pub fn new(tag: impl AsRef<str>) -> Self {
        Self(tag.as_ref().trim().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Primary subtag, e.g. `"zh"` for `"zh-cn"`
    pub fn primary(&self) -> &str {
        self.0.split('-').next().unwrap_or(&self.0)
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Language({})", self.0)
    }
}

impl From<&str> for Language {
    fn from(tag: &str) -> Self {
        Self::new(tag)
    }
}

impl From<String> for Language {
    fn from(tag: String) -> Self {
        Self::new(tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalization() {
        assert_eq!(Language::new(" EN ").as_str(), "en");
        assert_eq!(Language::new("zh-CN").as_str(), "zh-cn");
    }

    #[test]
    fn test_primary_subtag() {
        assert_eq!(Language::new("zh-cn").primary(), "zh");
        assert_eq!(Language::new("ja").primary(), "ja");
    }

    #[test]
    fn test_transparent_serde() {
        let lang = Language::new("ja");
        assert_eq!(serde_json::to_string(&lang).unwrap(), "\"ja\"");
        let back: Language = serde_json::from_str("\"ja\"").unwrap();
        assert_eq!(back, lang);
    }
}
