use std::{
    collections::HashMap,
    sync::{Arc, Weak},
    time::{Duration, Instant},
};

use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};

use crate::{
    compiler,
    config::{Config, EnvironmentBuilder, Registry},
    error::{Error, KilnResult},
    interface::Loader,
    optimizer::Optimizer,
    parser::{ParseOptions, ParseOutput, parse},
    template::Template,
    value::Value,
};

pub(crate) type TemplateCache = RwLock<HashMap<String, Arc<Template>>>;

/// Name given to templates compiled with [`Environment::from_string`].
const STRING_TEMPLATE: &str = "<string>";

struct Fragment {
    output: String,
    expires: Option<Instant>,
}

/// State shared by an environment and every template it compiled.
pub(crate) struct Shared {
    pub(crate) config: Config,
    pub(crate) registry: Registry,
    loader: Option<Box<dyn Loader>>,
    sources: RwLock<HashMap<String, String>>,
    fragments: Mutex<HashMap<String, Fragment>>,
    warnings: Vec<String>,
}

/// Compiles, caches and hands out templates.
///
/// An `Environment` is a cheap handle: clones share the same registries,
/// template cache and fragment cache, and can be sent to other threads.
///
/// # Examples
///
/// ```rust
/// use kiln::{Context, Environment, MemoryLoader, Value};
///
/// let loader = MemoryLoader::new()
///     .with("base.html", "<title>{% block title %}Site{% endblock %}</title>")
///     .with("page.html", "{% extends \"base.html\" %}{% block title %}{{ page.title }}{% endblock %}");
/// let env = Environment::builder().loader(loader).build();
///
/// let mut context = Context::new();
/// context.insert("page", Value::from_pairs([("title", "About")]));
/// let html = env.get_template("page.html").unwrap().render(&context).unwrap();
/// assert_eq!(html, "<title>About</title>");
/// ```
#[derive(Clone)]
pub struct Environment {
    shared: Arc<Shared>,
    cache: Arc<TemplateCache>,
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("config", &self.shared.config)
            .field("cached_templates", &self.cached_templates())
            .finish_non_exhaustive()
    }
}

impl Environment {
    /// An environment with the default configuration and no loader.
    pub fn new() -> Self {
        EnvironmentBuilder::new().build()
    }

    pub fn builder() -> EnvironmentBuilder {
        EnvironmentBuilder::new()
    }

    pub(crate) fn from_parts(
        config: Config,
        registry: Registry,
        loader: Option<Box<dyn Loader>>,
        warnings: Vec<String>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                registry,
                loader,
                sources: RwLock::new(HashMap::new()),
                fragments: Mutex::new(HashMap::new()),
                warnings,
            }),
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub(crate) const fn from_handles(shared: Arc<Shared>, cache: Arc<TemplateCache>) -> Self {
        Self { shared, cache }
    }

    /// Handles a template keeps. The cache is held weakly so cached
    /// templates do not keep their own cache alive.
    pub(crate) fn handles(&self) -> (Arc<Shared>, Weak<TemplateCache>) {
        (Arc::clone(&self.shared), Arc::downgrade(&self.cache))
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Warnings about the configuration, also logged by `build()`.
    pub fn config_warnings(&self) -> &[String] {
        &self.shared.warnings
    }

    /// Registers template source under `name`, taking precedence over the
    /// loader, and compiles it.
    ///
    /// # Errors
    ///
    /// Any lex, parse or compile error in `source`.
    pub fn add_template<N: Into<String>, S: Into<String>>(
        &self,
        name: N,
        source: S,
    ) -> KilnResult<Arc<Template>> {
        let (name, source) = (name.into(), source.into());
        let template = Arc::new(self.compile(&name, &source)?);
        self.shared.sources.write().insert(name.clone(), source);
        self.cache.write().insert(name, Arc::clone(&template));
        Ok(template)
    }

    /// Returns the compiled template called `name`, compiling it on first
    /// use. With `auto_reload` the source is reloaded and its hash compared
    /// on every call, so edited templates are recompiled.
    ///
    /// # Errors
    ///
    /// * `Error::TemplateNotFound` if neither registered sources nor the loader
    ///   know `name`.
    /// * `Error::Io` if the loader failed to read it.
    /// * Any lex, parse or compile error.
    pub fn get_template(&self, name: &str) -> KilnResult<Arc<Template>> {
        let cached = self.cache.read().get(name).cloned();
        if let Some(template) = &cached {
            if !self.shared.config.auto_reload {
                return Ok(Arc::clone(template));
            }
        }

        let source = self.load_source(name)?;
        let hash = source_hash(&source);
        if let Some(template) = cached {
            if template.source_matches(&hash) {
                return Ok(template);
            }
            log::debug!("source of {name} changed, recompiling");
        }

        let template = Arc::new(self.compile_with_hash(name, &source, hash)?);
        self.cache
            .write()
            .insert(name.to_string(), Arc::clone(&template));
        Ok(template)
    }

    /// Compiles a template that has no name. Identical sources share one
    /// compiled template.
    ///
    /// # Errors
    ///
    /// Any lex, parse or compile error in `source`.
    pub fn from_string(&self, source: &str) -> KilnResult<Arc<Template>> {
        let hash = source_hash(source);
        let key = format!("{STRING_TEMPLATE}:{hash}");
        let cached = self.cache.read().get(&key).cloned();
        if let Some(template) = cached {
            return Ok(template);
        }
        let template = Arc::new(self.compile_with_hash(STRING_TEMPLATE, source, hash)?);
        self.cache.write().insert(key, Arc::clone(&template));
        Ok(template)
    }

    /// Drops `name` from the template cache. Renders already holding the
    /// template are unaffected. Returns whether anything was cached.
    pub fn invalidate(&self, name: &str) -> bool {
        let removed = self.cache.write().remove(name).is_some();
        if removed {
            log::debug!("invalidated {name}");
        }
        removed
    }

    /// Drops every compiled template and every cached fragment.
    pub fn clear_cache(&self) {
        self.cache.write().clear();
        self.shared.fragments.lock().clear();
        log::debug!("cleared template and fragment caches");
    }

    /// Names of the templates currently cached, sorted.
    pub fn cached_templates(&self) -> Vec<String> {
        let mut names: Vec<String> = self.cache.read().keys().cloned().collect();
        names.sort();
        names
    }

    fn load_source(&self, name: &str) -> KilnResult<String> {
        let registered = self.shared.sources.read().get(name).cloned();
        if let Some(source) = registered {
            return Ok(source);
        }
        match &self.shared.loader {
            Some(loader) => loader.load(name),
            None => Err(Error::TemplateNotFound {
                name: name.to_string(),
            }),
        }
    }

    fn compile(&self, name: &str, source: &str) -> KilnResult<Template> {
        self.compile_with_hash(name, source, source_hash(source))
    }

    /// Source to template: parse, optimize, compile.
    fn compile_with_hash(&self, name: &str, source: &str, hash: String) -> KilnResult<Template> {
        let config = &self.shared.config;
        let registry = &self.shared.registry;
        let options = ParseOptions {
            trim_blocks: config.trim_blocks,
            max_nesting_depth: config.max_nesting_depth,
        };
        let ParseOutput { ast, warnings } = parse(source, name, options)?;
        let ast = if config.optimize {
            Optimizer::new(registry, config.autoescape, config.inline_filters).run(ast)
        } else {
            ast
        };
        let compiled = compiler::compile(&ast, registry)?;
        log::debug!("compiled template {name} ({} bytes of source)", source.len());
        Ok(Template::new(
            name,
            hash,
            compiled,
            config.preserve_tree.then_some(ast),
            warnings,
            self,
        ))
    }

    pub(crate) fn cached_fragment(&self, key: &str) -> Option<String> {
        let mut fragments = self.shared.fragments.lock();
        let fragment = fragments.get(key)?;
        if fragment.expires.is_some_and(|at| Instant::now() >= at) {
            fragments.remove(key);
            return None;
        }
        Some(fragment.output.clone())
    }

    pub(crate) fn store_fragment(&self, key: String, output: String, ttl: Option<Duration>) {
        let expires = ttl.and_then(|ttl| Instant::now().checked_add(ttl));
        self.shared
            .fragments
            .lock()
            .insert(key, Fragment { output, expires });
    }
}

fn source_hash(source: &str) -> String {
    Sha256::digest(source.as_bytes())
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

/// Parses a fragment TTL: integer seconds, or a number followed by one of
/// `s`, `m`, `h`, `d`.
pub(crate) fn parse_ttl(ttl: &Value) -> Result<Duration, String> {
    let invalid = || format!("invalid cache ttl {}", ttl.repr());
    match ttl {
        Value::Int(seconds) => u64::try_from(*seconds)
            .map(Duration::from_secs)
            .map_err(|_| invalid()),
        Value::Str(text) | Value::Safe(text) => {
            let text = text.trim();
            let (digits, unit) = match text.char_indices().last() {
                Some((_, c)) if c.is_ascii_alphabetic() => {
                    (text.strip_suffix(c).unwrap_or(text), Some(c))
                }
                _ => (text, None),
            };
            let amount: u64 = digits.trim().parse().map_err(|_| invalid())?;
            let multiplier = match unit {
                None | Some('s') => 1,
                Some('m') => 60,
                Some('h') => 3_600,
                Some('d') => 86_400,
                Some(_) => return Err(invalid()),
            };
            amount
                .checked_mul(multiplier)
                .map(Duration::from_secs)
                .ok_or_else(invalid)
        }
        _ => Err(invalid()),
    }
}
