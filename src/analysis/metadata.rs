use std::collections::{BTreeMap, BTreeSet};

use super::{CacheScope, Landmark, Purity, Role};

/// What static analysis knows about one block. Every field is a
/// conservative estimate.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockMetadata {
    pub name: String,
    /// Whether the block renders anything besides whitespace.
    pub emits_output: bool,
    pub emits_landmarks: BTreeSet<Landmark>,
    pub inferred_role: Role,
    /// Context paths the block may read, as dotted paths.
    pub depends_on: BTreeSet<String>,
    pub is_pure: Purity,
    pub cache_scope: CacheScope,
}

/// What static analysis knows about a template.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateMetadata {
    pub name: String,
    /// Parent template, when `extends` names it with a literal.
    pub extends: Option<String>,
    pub blocks: BTreeMap<String, BlockMetadata>,
    /// Context paths read outside of any block.
    pub top_level_depends_on: BTreeSet<String>,
}

impl TemplateMetadata {
    /// Metadata for a template whose tree was not kept.
    pub(crate) fn empty(name: &str) -> Self {
        Self {
            name: name.to_string(),
            extends: None,
            blocks: BTreeMap::new(),
            top_level_depends_on: BTreeSet::new(),
        }
    }

    pub fn block(&self, name: &str) -> Option<&BlockMetadata> {
        self.blocks.get(name)
    }

    /// Union of top-level and block dependencies, sorted.
    pub fn depends_on(&self) -> Vec<String> {
        let mut all: BTreeSet<&String> = self.top_level_depends_on.iter().collect();
        for block in self.blocks.values() {
            all.extend(block.depends_on.iter());
        }
        all.into_iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ntest::timeout(100)]
    fn test_depends_on_is_a_sorted_union() {
        let block = BlockMetadata {
            name: "content".to_string(),
            emits_output: true,
            emits_landmarks: BTreeSet::new(),
            inferred_role: Role::Content,
            depends_on: ["page.title", "site.name"].map(String::from).into(),
            is_pure: Purity::Pure,
            cache_scope: CacheScope::Page,
        };
        let metadata = TemplateMetadata {
            name: "t".to_string(),
            extends: None,
            blocks: [("content".to_string(), block)].into(),
            top_level_depends_on: ["site.name", "author"].map(String::from).into(),
        };
        assert_eq!(metadata.depends_on(), ["author", "page.title", "site.name"]);
        assert!(metadata.block("content").is_some());
        assert!(TemplateMetadata::empty("t").depends_on().is_empty());
    }
}
