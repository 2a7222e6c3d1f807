use std::collections::BTreeSet;

use super::Purity;

/// The broadest granularity at which a block's output may be reused.
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "snake_case")
)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CacheScope {
    /// Must be rendered every time.
    None,
    /// Reusable for every render of the same page.
    Page,
    /// Reusable across the whole site.
    Site,
    #[default]
    Unknown,
}

/// Derives a cache scope from a block's purity and the context paths it
/// reads. A path matches a prefix when its first segment equals it.
pub(crate) fn infer(
    purity: Purity,
    depends_on: &BTreeSet<String>,
    page_prefixes: &[String],
    site_prefixes: &[String],
) -> CacheScope {
    match purity {
        Purity::Impure => CacheScope::None,
        Purity::Unknown => CacheScope::Unknown,
        Purity::Pure if depends_on.is_empty() => CacheScope::Site,
        Purity::Pure => {
            let matches = |path: &str, prefixes: &[String]| {
                let root = path.split('.').next().unwrap_or(path);
                prefixes.iter().any(|prefix| prefix == root)
            };
            if depends_on.iter().any(|dep| matches(dep, page_prefixes)) {
                CacheScope::Page
            } else if depends_on.iter().all(|dep| matches(dep, site_prefixes)) {
                CacheScope::Site
            } else {
                CacheScope::Unknown
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn scope(purity: Purity, deps: &[&str]) -> CacheScope {
        let config = Config::default();
        let deps = deps.iter().map(|d| (*d).to_string()).collect();
        infer(purity, &deps, &config.page_prefixes, &config.site_prefixes)
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_purity_decides_first() {
        assert_eq!(scope(Purity::Impure, &[]), CacheScope::None);
        assert_eq!(scope(Purity::Impure, &["site.title"]), CacheScope::None);
        assert_eq!(scope(Purity::Unknown, &[]), CacheScope::Unknown);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_prefix_classification() {
        assert_eq!(scope(Purity::Pure, &[]), CacheScope::Site);
        assert_eq!(scope(Purity::Pure, &["site.title", "theme"]), CacheScope::Site);
        assert_eq!(scope(Purity::Pure, &["site.title", "page.title"]), CacheScope::Page);
        assert_eq!(scope(Purity::Pure, &["toc"]), CacheScope::Page);
        assert_eq!(scope(Purity::Pure, &["site.title", "user"]), CacheScope::Unknown);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_prefixes_match_whole_segments() {
        assert_eq!(scope(Purity::Pure, &["pages.all"]), CacheScope::Unknown);
        assert_eq!(scope(Purity::Pure, &["sitemap"]), CacheScope::Unknown);
    }
}
