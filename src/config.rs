use std::{collections::HashMap, sync::Arc, time::Duration};

use crate::{
    analysis::Purity,
    builtins::{self, Args, FilterFn, FunctionFn, TestFn},
    environment::Environment,
    interface::Loader,
    value::Value,
};

/// Engine configuration. Every field has a default, so a partial document
/// deserializes cleanly under the `serde` feature.
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(default)
)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Keep the optimized tree next to the compiled template so it can be
    /// analyzed. Without it `block_metadata()` is always empty.
    pub preserve_tree: bool,
    pub optimize: bool,
    /// Raise `UndefinedError` on failed plain access instead of rendering
    /// nothing.
    pub strict: bool,
    /// Evaluate pure filters over constant input at compile time. Filters
    /// replaced after a template was compiled are not seen by it.
    pub inline_filters: bool,
    pub autoescape: bool,
    pub trim_blocks: bool,
    pub max_include_depth: usize,
    pub max_nesting_depth: usize,
    pub render_timeout: Option<Duration>,
    /// Re-check the loader's source hash on every `get_template`.
    pub auto_reload: bool,
    /// Dependency roots that vary from page to page.
    pub page_prefixes: Vec<String>,
    /// Dependency roots that are stable across a whole site.
    pub site_prefixes: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            preserve_tree: true,
            optimize: true,
            strict: false,
            inline_filters: false,
            autoescape: false,
            trim_blocks: false,
            max_include_depth: 32,
            max_nesting_depth: 128,
            render_timeout: None,
            auto_reload: true,
            page_prefixes: ["page", "post", "toc"].map(String::from).to_vec(),
            site_prefixes: ["site", "config", "theme"].map(String::from).to_vec(),
        }
    }
}

impl Config {
    /// Warnings about settings that change semantics in ways a user should
    /// know about.
    pub(crate) fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.inline_filters && self.optimize {
            warnings.push(
                "inline_filters is enabled: pure filters over constant input are evaluated \
                 at compile time, so replacing a filter later does not affect templates \
                 that are already compiled"
                    .to_string(),
            );
        }
        if self.max_include_depth == 0 {
            warnings.push("max_include_depth is 0: every include, import and macro call fails".to_string());
        }
        warnings
    }
}

#[derive(Clone)]
pub(crate) struct FilterEntry {
    pub(crate) func: Arc<FilterFn>,
    pub(crate) purity: Purity,
}

#[derive(Clone)]
pub(crate) struct FunctionEntry {
    pub(crate) func: Arc<FunctionFn>,
    pub(crate) purity: Purity,
}

/// Filters, tests and global functions. Frozen once the environment is built.
#[derive(Clone, Default)]
pub(crate) struct Registry {
    pub(crate) filters: HashMap<String, FilterEntry>,
    pub(crate) tests: HashMap<String, Arc<TestFn>>,
    pub(crate) functions: HashMap<String, FunctionEntry>,
}

impl Registry {
    pub(crate) fn with_builtins() -> Self {
        let mut registry = Self::default();
        builtins::register(&mut registry);
        registry
    }

    pub(crate) fn add_filter(&mut self, name: &str, purity: Purity, func: Arc<FilterFn>) {
        self.filters
            .insert(name.to_string(), FilterEntry { func, purity });
    }

    pub(crate) fn add_test(&mut self, name: &str, func: Arc<TestFn>) {
        self.tests.insert(name.to_string(), func);
    }

    pub(crate) fn add_function(&mut self, name: &str, purity: Purity, func: Arc<FunctionFn>) {
        self.functions
            .insert(name.to_string(), FunctionEntry { func, purity });
    }

    /// Names a misspelt filter could have meant.
    pub(crate) fn filter_names(&self) -> impl Iterator<Item = &str> {
        self.filters.keys().map(String::as_str)
    }

    pub(crate) fn test_names(&self) -> impl Iterator<Item = &str> {
        self.tests
            .keys()
            .map(String::as_str)
            .chain(["defined", "undefined"])
    }

    pub(crate) fn function_names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }
}

/// Builds an [`Environment`].
///
/// # Examples
///
/// ```
/// use kiln::{Context, Environment, Purity};
///
/// let env = Environment::builder()
///     .strict(true)
///     .filter("shout", Purity::Pure, |value, _| {
///         Ok(format!("{}!", value.to_output().to_uppercase()).into())
///     })
///     .build();
///
/// let template = env.from_string("{{ name | shout }}").unwrap();
/// let mut context = Context::new();
/// context.insert("name", "hi");
/// assert_eq!(template.render(&context).unwrap(), "HI!");
/// ```
pub struct EnvironmentBuilder {
    config: Config,
    registry: Registry,
    loader: Option<Box<dyn Loader>>,
}

impl Default for EnvironmentBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvironmentBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
            registry: Registry::with_builtins(),
            loader: None,
        }
    }

    /// Replaces the whole configuration.
    #[must_use]
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn preserve_tree(mut self, yes: bool) -> Self {
        self.config.preserve_tree = yes;
        self
    }

    #[must_use]
    pub fn optimize(mut self, yes: bool) -> Self {
        self.config.optimize = yes;
        self
    }

    #[must_use]
    pub fn strict(mut self, yes: bool) -> Self {
        self.config.strict = yes;
        self
    }

    #[must_use]
    pub fn inline_filters(mut self, yes: bool) -> Self {
        self.config.inline_filters = yes;
        self
    }

    #[must_use]
    pub fn autoescape(mut self, yes: bool) -> Self {
        self.config.autoescape = yes;
        self
    }

    #[must_use]
    pub fn trim_blocks(mut self, yes: bool) -> Self {
        self.config.trim_blocks = yes;
        self
    }

    #[must_use]
    pub fn max_include_depth(mut self, depth: usize) -> Self {
        self.config.max_include_depth = depth;
        self
    }

    #[must_use]
    pub fn max_nesting_depth(mut self, depth: usize) -> Self {
        self.config.max_nesting_depth = depth;
        self
    }

    #[must_use]
    pub fn render_timeout(mut self, limit: Option<Duration>) -> Self {
        self.config.render_timeout = limit;
        self
    }

    #[must_use]
    pub fn auto_reload(mut self, yes: bool) -> Self {
        self.config.auto_reload = yes;
        self
    }

    #[must_use]
    pub fn page_prefixes<I, S>(mut self, prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.page_prefixes = prefixes.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn site_prefixes<I, S>(mut self, prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.site_prefixes = prefixes.into_iter().map(Into::into).collect();
        self
    }

    /// Registers a filter, replacing any built-in of the same name.
    #[must_use]
    pub fn filter<F>(mut self, name: &str, purity: Purity, filter: F) -> Self
    where
        F: Fn(&Value, &Args) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.registry.add_filter(name, purity, Arc::new(filter));
        self
    }

    #[must_use]
    pub fn test<F>(mut self, name: &str, test: F) -> Self
    where
        F: Fn(&Value, &Args) -> Result<bool, String> + Send + Sync + 'static,
    {
        self.registry.add_test(name, Arc::new(test));
        self
    }

    /// Registers a global function, callable as `name(...)`.
    #[must_use]
    pub fn function<F>(mut self, name: &str, purity: Purity, function: F) -> Self
    where
        F: Fn(&Args) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.registry.add_function(name, purity, Arc::new(function));
        self
    }

    #[must_use]
    pub fn loader<L: Loader + 'static>(mut self, loader: L) -> Self {
        self.loader = Some(Box::new(loader));
        self
    }

    pub fn build(self) -> Environment {
        let warnings = self.config.warnings();
        for warning in &warnings {
            log::warn!("{warning}");
        }
        Environment::from_parts(self.config, self.registry, self.loader, warnings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ntest::timeout(100)]
    fn test_defaults() {
        let config = Config::default();
        assert!(config.preserve_tree);
        assert!(config.optimize);
        assert!(!config.strict);
        assert!(!config.inline_filters);
        assert_eq!(config.max_include_depth, 32);
        assert_eq!(config.page_prefixes, vec!["page", "post", "toc"]);
        assert_eq!(config.site_prefixes, vec!["site", "config", "theme"]);
        assert!(config.warnings().is_empty());
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_inline_filters_warns() {
        let config = Config {
            inline_filters: true,
            ..Config::default()
        };
        let warnings = config.warnings();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("inline_filters"));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_user_filter_replaces_builtin() {
        let mut registry = Registry::with_builtins();
        assert_eq!(registry.filters["random"].purity, Purity::Impure);
        registry.add_filter("random", Purity::Pure, Arc::new(|v: &Value, _: &Args| Ok::<_, String>(v.clone())));
        assert_eq!(registry.filters["random"].purity, Purity::Pure);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_test_names_include_definedness() {
        let registry = Registry::with_builtins();
        let names: Vec<&str> = registry.test_names().collect();
        assert!(names.contains(&"defined"));
        assert!(names.contains(&"even"));
    }
}
