use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Which catalog categories allow cancelling individual lines.
///
/// Categories not listed fall back to `default_eligible`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CategoryEligibility {
    #[serde(default)]
    pub categories: BTreeMap<String, bool>,
    #[serde(default)]
    pub default_eligible: bool,
}

impl CategoryEligibility {
    pub fn only<I, S>(categories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            categories: categories.into_iter().map(|c| (c.into(), true)).collect(),
            default_eligible: false,
        }
    }

    /// Category codes compare case-insensitively; config sources may fold key case.
    pub fn allows_partial(&self, category: &str) -> bool {
        self.categories
            .iter()
            .find(|(code, _)| code.eq_ignore_ascii_case(category))
            .map(|(_, eligible)| *eligible)
            .unwrap_or(self.default_eligible)
    }
}

impl Default for CategoryEligibility {
    fn default() -> Self {
        Self::only(["GOODS"])
    }
}
