use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, OnceLock, Weak},
    time::{Duration, Instant},
};

use crate::{
    analysis::{self, BlockMetadata, TemplateMetadata},
    ast::TemplateAst,
    compiler::{Caller, CompiledTemplate, Flow, NodeFn},
    environment::{Environment, Shared, TemplateCache},
    error::{Error, KilnResult, TemplateRuntimeError, UndefinedError, Warning, closest_match},
    interface::Context,
    value::{Resolved, Value, escape_html},
};

/// One level of render-time bindings.
pub(crate) type Frame = HashMap<String, Value>;

/// A compiled template, ready to render.
///
/// Templates are immutable and shared behind an `Arc`: rendering never takes
/// a lock on the template itself, so one instance can be rendered from many
/// threads at once. Evicting a template from the environment's cache does not
/// affect renders that already hold it.
///
/// # Examples
///
/// ```rust
/// use kiln::{Context, Environment, MemoryLoader};
///
/// let env = Environment::builder()
///     .loader(MemoryLoader::new().with("hello.html", "Hello, {{ name }}!"))
///     .build();
///
/// let template = env.get_template("hello.html").unwrap();
/// let mut context = Context::new();
/// context.insert("name", "World");
///
/// assert_eq!(template.render(&context).unwrap(), "Hello, World!");
/// assert_eq!(template.depends_on(), ["name"]);
/// ```
pub struct Template {
    name: Arc<str>,
    source_hash: String,
    compiled: CompiledTemplate,
    ast: Option<TemplateAst>,
    warnings: Vec<Warning>,
    metadata: OnceLock<TemplateMetadata>,
    shared: Arc<Shared>,
    cache: Weak<TemplateCache>,
}

impl std::fmt::Debug for Template {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Template")
            .field("name", &self.name)
            .field("source_hash", &self.source_hash)
            .finish_non_exhaustive()
    }
}

impl Template {
    pub(crate) fn new(
        name: &str,
        source_hash: String,
        compiled: CompiledTemplate,
        ast: Option<TemplateAst>,
        warnings: Vec<Warning>,
        environment: &Environment,
    ) -> Self {
        let (shared, cache) = environment.handles();
        Self {
            name: Arc::from(name),
            source_hash,
            compiled,
            ast,
            warnings,
            metadata: OnceLock::new(),
            shared,
            cache,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Hex SHA-256 of the source this template was compiled from.
    pub fn source_hash(&self) -> &str {
        &self.source_hash
    }

    /// Warnings recorded while parsing, such as the `??` precedence trap.
    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }

    /// The optimized syntax tree, if the environment keeps it.
    pub fn ast(&self) -> Option<&TemplateAst> {
        self.ast.as_ref()
    }

    /// Renders the template, following `extends` up the inheritance chain.
    ///
    /// # Arguments
    ///
    /// * `context` - The data the template is rendered against.
    ///
    /// # Errors
    ///
    /// * `Error::Undefined` if a plain lookup fails in strict mode.
    /// * `Error::Runtime` for type errors, unknown filters and the like.
    /// * `Error::TemplateNotFound` if an included or extended template is missing.
    /// * `Error::RecursionLimit` if includes, imports, extends or macro calls nest
    ///   deeper than `max_include_depth`.
    /// * `Error::Timeout` if a render timeout is configured and exceeded.
    pub fn render(&self, context: &Context) -> KilnResult<String> {
        let environment = self.environment();
        let mut state = State::new(&environment, context.as_map(), Arc::clone(&self.name));
        state.run(self)
    }

    /// Renders a single block, resolved through the inheritance chain as a
    /// full render would.
    ///
    /// # Errors
    ///
    /// As [`Template::render`], plus `Error::Runtime` if no template in the
    /// chain defines `name`.
    pub fn render_block(&self, name: &str, context: &Context) -> KilnResult<String> {
        let environment = self.environment();
        let mut state = State::new(&environment, context.as_map(), Arc::clone(&self.name));
        state.run(self)?;

        let Some((body, template)) = state.blocks.get(name).and_then(|chain| chain.first()).cloned()
        else {
            let suggestion = closest_match(name, state.blocks.keys().map(String::as_str));
            return Err(state.runtime_error(0, format!("no block named '{name}'"), suggestion));
        };
        state.template = template;
        state.block_stack.push((name.to_string(), 0));
        state.push_frame(Frame::new());
        let mut out = String::new();
        body(&mut state, &mut out)?;
        Ok(out)
    }

    /// Static analysis of the whole template. Computed on first use.
    pub fn template_metadata(&self) -> &TemplateMetadata {
        self.metadata.get_or_init(|| match &self.ast {
            Some(ast) => analysis::analyze(ast, &self.shared.registry, &self.shared.config),
            None => TemplateMetadata::empty(&self.name),
        })
    }

    /// Per-block analysis. Empty when the tree was not preserved.
    pub fn block_metadata(&self) -> &BTreeMap<String, BlockMetadata> {
        &self.template_metadata().blocks
    }

    /// Every context path the template reads, blocks included, sorted.
    pub fn depends_on(&self) -> Vec<String> {
        self.template_metadata().depends_on()
    }

    pub(crate) fn source_matches(&self, hash: &str) -> bool {
        self.source_hash == hash
    }

    fn environment(&self) -> Environment {
        Environment::from_handles(
            Arc::clone(&self.shared),
            self.cache.upgrade().unwrap_or_default(),
        )
    }
}

/// Everything that changes while a template renders. A fresh state is built
/// for each render call and for each included or imported template.
pub(crate) struct State<'a> {
    environment: &'a Environment,
    context: &'a BTreeMap<String, Value>,
    pub(crate) template: Arc<str>,
    pub(crate) frames: Vec<Frame>,
    pub(crate) callers: Vec<Option<Caller>>,
    /// Block bodies by name, most derived first.
    blocks: HashMap<String, Vec<(NodeFn, Arc<str>)>>,
    /// Blocks being rendered and their position in the chain, for `super()`.
    block_stack: Vec<(String, usize)>,
    depth: usize,
    lenient: usize,
    deadline: Option<Instant>,
    parent: Option<Arc<Template>>,
}

impl<'a> State<'a> {
    fn new(
        environment: &'a Environment,
        context: &'a BTreeMap<String, Value>,
        template: Arc<str>,
    ) -> Self {
        let deadline = environment
            .config()
            .render_timeout
            .and_then(|limit| Instant::now().checked_add(limit));
        Self {
            environment,
            context,
            template,
            frames: vec![Frame::new()],
            callers: Vec::new(),
            blocks: HashMap::new(),
            block_stack: Vec::new(),
            depth: 0,
            lenient: 0,
            deadline,
            parent: None,
        }
    }

    /// A state for another template, inheriting limits but not bindings.
    fn nested<'b>(&self, context: &'b BTreeMap<String, Value>, template: Arc<str>) -> State<'b>
    where
        'a: 'b,
    {
        State {
            depth: self.depth,
            deadline: self.deadline,
            ..State::new(self.environment, context, template)
        }
    }

    /// Runs `template` and then every template it extends, returning the
    /// output of the last one in the chain.
    fn run(&mut self, template: &Template) -> KilnResult<String> {
        self.check_deadline()?;
        self.register_blocks(template);
        self.template = Arc::clone(&template.name);
        let mut out = String::with_capacity(template.compiled.size_hint);
        (template.compiled.root)(self, &mut out)?;

        while let Some(parent) = self.parent.take() {
            self.check_deadline()?;
            self.register_blocks(&parent);
            self.template = Arc::clone(&parent.name);
            out.clear();
            out.reserve(parent.compiled.size_hint);
            (parent.compiled.root)(self, &mut out)?;
        }
        Ok(out)
    }

    fn register_blocks(&mut self, template: &Template) {
        for (name, body) in &template.compiled.blocks {
            self.blocks
                .entry(name.clone())
                .or_default()
                .push((Arc::clone(body), Arc::clone(&template.name)));
        }
    }

    fn timeout_limit(&self) -> Duration {
        self.environment.config().render_timeout.unwrap_or_default()
    }

    pub(crate) fn autoescape(&self) -> bool {
        self.environment.config().autoescape
    }

    /// Local names search frames first; everything else searches the
    /// context first.
    pub(crate) fn lookup(&self, name: &str, local: bool) -> Option<Value> {
        let in_frames = || self.frames.iter().rev().find_map(|frame| frame.get(name));
        let found = if local {
            in_frames().or_else(|| self.context.get(name))
        } else {
            self.context.get(name).or_else(in_frames)
        };
        found.cloned()
    }

    /// Outcome of a failed plain lookup: an error in strict mode, otherwise
    /// Undefined.
    pub(crate) fn undefined(&self, name: &str, line: usize) -> KilnResult<Resolved> {
        if self.environment.config().strict && self.lenient == 0 {
            return Err(Error::Undefined(UndefinedError {
                template: self.template.to_string(),
                line,
                name: name.to_string(),
            }));
        }
        Ok(Resolved::undefined(name))
    }

    pub(crate) fn runtime_error(
        &self,
        line: usize,
        message: impl Into<String>,
        suggestion: Option<String>,
    ) -> Error {
        Error::Runtime(TemplateRuntimeError {
            template: self.template.to_string(),
            line,
            message: message.into(),
            suggestion,
        })
    }

    /// Runs `f` with strict lookups relaxed.
    pub(crate) fn leniently<T>(&mut self, f: impl FnOnce(&mut Self) -> T) -> T {
        self.lenient = self.lenient.saturating_add(1);
        let result = f(self);
        self.lenient = self.lenient.saturating_sub(1);
        result
    }

    pub(crate) fn write(&self, value: &Resolved, out: &mut String) {
        match value {
            Resolved::Value(Value::Safe(markup)) => out.push_str(markup),
            Resolved::Value(value) if self.autoescape() => {
                out.push_str(&escape_html(&value.to_output()));
            }
            Resolved::Value(value) => out.push_str(&value.to_output()),
            Resolved::Undefined(_) => {}
        }
    }

    /// Wraps rendered output as a value. Output that was escaped on the way
    /// in must not be escaped again.
    pub(crate) fn markup(&self, text: String) -> Value {
        if self.autoescape() {
            Value::from_safe(text)
        } else {
            Value::from(text)
        }
    }

    pub(crate) fn push_frame(&mut self, frame: Frame) {
        self.frames.push(frame);
    }

    pub(crate) fn pop_frame(&mut self) {
        if self.frames.len() > 1 {
            self.frames.pop();
        }
    }

    pub(crate) fn bind(&mut self, name: &str, value: Value) {
        if let Some(frame) = self.frames.last_mut() {
            frame.insert(name.to_string(), value);
        }
    }

    pub(crate) fn bind_root(&mut self, name: &str, value: Value) {
        if let Some(frame) = self.frames.first_mut() {
            frame.insert(name.to_string(), value);
        }
    }

    /// All visible bindings in one frame, inner bindings shadowing outer.
    pub(crate) fn flatten_frames(&self) -> Frame {
        let mut flat = Frame::new();
        for frame in &self.frames {
            flat.extend(frame.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        flat
    }

    pub(crate) fn check_deadline(&self) -> KilnResult<()> {
        match self.deadline {
            Some(deadline) if Instant::now() > deadline => Err(Error::Timeout {
                template: self.template.to_string(),
                limit: self.timeout_limit(),
            }),
            _ => Ok(()),
        }
    }

    /// Counts one level of include, import, extends or macro call.
    pub(crate) fn enter(&mut self) -> KilnResult<()> {
        let limit = self.environment.config().max_include_depth;
        if self.depth >= limit {
            return Err(Error::RecursionLimit {
                depth: limit,
                template: self.template.to_string(),
            });
        }
        self.depth = self.depth.saturating_add(1);
        Ok(())
    }

    pub(crate) fn leave(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    fn load(&self, name: &Value, line: usize) -> KilnResult<Arc<Template>> {
        self.check_deadline()?;
        let Some(name) = name.as_str() else {
            return Err(self.runtime_error(
                line,
                format!("template name must be a string, not '{}'", name.kind_name()),
                None,
            ));
        };
        self.environment.get_template(name)
    }

    /// Renders another template against this context plus every binding
    /// visible here.
    pub(crate) fn include(
        &mut self,
        name: &Value,
        ignore_missing: bool,
        line: usize,
        out: &mut String,
    ) -> KilnResult<()> {
        let template = match self.load(name, line) {
            Ok(template) => template,
            Err(Error::TemplateNotFound { name: missing })
                if ignore_missing && name.as_str() == Some(missing.as_str()) =>
            {
                log::debug!("skipping missing include {missing}");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        self.enter()?;
        let mut context = self.context.clone();
        context.extend(self.flatten_frames());
        let result = self
            .nested(&context, Arc::clone(&template.name))
            .run(&template);
        self.leave();
        out.push_str(&result?);
        Ok(())
    }

    /// Runs another template for its top-level bindings and returns them.
    pub(crate) fn import(&mut self, name: &Value, line: usize) -> KilnResult<BTreeMap<String, Value>> {
        let template = self.load(name, line)?;
        self.enter()?;
        let mut imported = self.nested(self.context, Arc::clone(&template.name));
        let result = imported.run(&template);
        self.leave();
        result?;
        let exports = imported.frames.swap_remove(0);
        Ok(exports.into_iter().collect())
    }

    pub(crate) fn extends(&mut self, name: &Value, line: usize) -> KilnResult<()> {
        if self.parent.is_some() {
            return Err(self.runtime_error(line, "a template can only extend one parent", None));
        }
        let template = self.load(name, line)?;
        self.enter()?;
        self.parent = Some(template);
        Ok(())
    }

    /// Block nodes render nothing once the template is known to extend
    /// another; the parent decides where they go.
    pub(crate) fn is_extending(&self) -> bool {
        self.parent.is_some()
    }

    pub(crate) fn render_block(
        &mut self,
        name: &str,
        own_body: &NodeFn,
        out: &mut String,
    ) -> KilnResult<Flow> {
        let (body, template) = match self.blocks.get(name).and_then(|chain| chain.first()) {
            Some((body, template)) => (Arc::clone(body), Arc::clone(template)),
            None => (Arc::clone(own_body), Arc::clone(&self.template)),
        };
        self.block_stack.push((name.to_string(), 0));
        let result = self.render_in(&template, &body, out);
        self.block_stack.pop();
        result.map(|_| Flow::Normal)
    }

    /// `super()`: the next definition of the current block up the chain.
    pub(crate) fn super_block(&mut self, line: usize) -> KilnResult<Value> {
        let Some((name, index)) = self.block_stack.last().cloned() else {
            return Err(self.runtime_error(line, "super() used outside of a block", None));
        };
        let parent = index.saturating_add(1);
        let Some((body, template)) = self
            .blocks
            .get(&name)
            .and_then(|chain| chain.get(parent))
            .cloned()
        else {
            return Err(self.runtime_error(
                line,
                format!("block '{name}' has no parent definition"),
                None,
            ));
        };
        self.block_stack.push((name, parent));
        let mut out = String::new();
        let result = self.render_in(&template, &body, &mut out);
        self.block_stack.pop();
        result?;
        Ok(Value::from_safe(out))
    }

    fn render_in(&mut self, template: &Arc<str>, body: &NodeFn, out: &mut String) -> KilnResult<Flow> {
        let saved = std::mem::replace(&mut self.template, Arc::clone(template));
        self.push_frame(Frame::new());
        let result = body(self, out);
        self.pop_frame();
        self.template = saved;
        result
    }

    /// `{% slot %}`: the content passed by the enclosing `{% call %}`, run
    /// with the caller's bindings. Renders nothing for a plain call.
    pub(crate) fn slot(&mut self, out: &mut String) -> KilnResult<()> {
        let Some(top) = self.callers.pop() else {
            return Ok(());
        };
        let Some(caller) = top else {
            self.callers.push(None);
            return Ok(());
        };
        let frames = std::mem::replace(&mut self.frames, caller.frames.clone());
        let template = std::mem::replace(&mut self.template, Arc::clone(&caller.template));
        let result = (caller.body)(self, out);
        self.template = template;
        self.frames = frames;
        self.callers.push(Some(caller));
        result.map(|_| ())
    }

    /// `{% cache %}`: reuses stored output for `key` until `ttl` passes.
    pub(crate) fn cached_fragment(
        &mut self,
        key: &str,
        ttl: Option<Duration>,
        body: &NodeFn,
        out: &mut String,
    ) -> KilnResult<Flow> {
        let key = format!("{}:{key}", self.template);
        if let Some(hit) = self.environment.cached_fragment(&key) {
            log::trace!("fragment cache hit for {key}");
            out.push_str(&hit);
            return Ok(Flow::Normal);
        }
        let mut rendered = String::new();
        let flow = body(self, &mut rendered)?;
        out.push_str(&rendered);
        self.environment.store_fragment(key, rendered, ttl);
        Ok(flow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::MemoryLoader;

    fn environment(templates: &[(&str, &str)]) -> Environment {
        let loader = templates
            .iter()
            .fold(MemoryLoader::new(), |loader, (name, source)| loader.with(*name, *source));
        Environment::builder().loader(loader).build()
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_lookup_order() {
        let env = Environment::new();
        let mut context = BTreeMap::new();
        context.insert("x".to_string(), Value::from("context"));
        let mut state = State::new(&env, &context, Arc::from("t"));
        state.bind("x", Value::from("frame"));

        assert_eq!(state.lookup("x", true), Some(Value::from("frame")));
        assert_eq!(state.lookup("x", false), Some(Value::from("context")));
        assert_eq!(state.lookup("y", true), None);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_frames_shadow_and_pop() {
        let env = Environment::new();
        let context = BTreeMap::new();
        let mut state = State::new(&env, &context, Arc::from("t"));
        state.bind("a", Value::Int(1));
        state.push_frame(Frame::new());
        state.bind("a", Value::Int(2));
        state.bind_root("b", Value::Int(3));
        assert_eq!(state.lookup("a", true), Some(Value::Int(2)));
        assert_eq!(state.flatten_frames()["a"], Value::Int(2));

        state.pop_frame();
        state.pop_frame();
        assert_eq!(state.frames.len(), 1);
        assert_eq!(state.lookup("a", true), Some(Value::Int(1)));
        assert_eq!(state.lookup("b", true), Some(Value::Int(3)));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_leniency_nests() {
        let env = Environment::builder().strict(true).build();
        let context = BTreeMap::new();
        let mut state = State::new(&env, &context, Arc::from("t"));
        assert!(state.undefined("x", 1).is_err());
        let inner = state.leniently(|s| s.leniently(|s| s.undefined("x", 1)));
        assert!(inner.unwrap().is_undefined());
        assert!(state.undefined("x", 1).is_err());
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_write_escapes_unless_safe() {
        let env = Environment::builder().autoescape(true).build();
        let context = BTreeMap::new();
        let state = State::new(&env, &context, Arc::from("t"));
        let mut out = String::new();
        state.write(&Resolved::Value(Value::from("<b>")), &mut out);
        state.write(&Resolved::Value(Value::from_safe("<i>")), &mut out);
        state.write(&Resolved::undefined("x"), &mut out);
        assert_eq!(out, "&lt;b&gt;<i>");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_depth_limit() {
        let env = Environment::builder().max_include_depth(2).build();
        let context = BTreeMap::new();
        let mut state = State::new(&env, &context, Arc::from("t"));
        state.enter().unwrap();
        state.enter().unwrap();
        assert!(matches!(
            state.enter(),
            Err(Error::RecursionLimit { depth: 2, .. })
        ));
        state.leave();
        assert!(state.enter().is_ok());
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_render_block_through_chain() {
        let env = environment(&[
            ("base.html", "<h1>{% block title %}Base{% endblock %}</h1>"),
            ("child.html", "{% extends \"base.html\" %}{% block title %}Child / {{ super() }}{% endblock %}"),
        ]);
        let template = env.get_template("child.html").unwrap();
        let context = Context::new();
        assert_eq!(template.render(&context).unwrap(), "<h1>Child / Base</h1>");
        assert_eq!(template.render_block("title", &context).unwrap(), "Child / Base");

        let err = template.render_block("titl", &context).unwrap_err();
        let Error::Runtime(err) = err else {
            panic!("expected a runtime error");
        };
        assert_eq!(err.suggestion.as_deref(), Some("title"));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_metadata_without_tree_is_empty() {
        let env = Environment::builder().preserve_tree(false).build();
        let template = env.from_string("{% block a %}{{ x }}{% endblock %}").unwrap();
        assert!(template.ast().is_none());
        assert!(template.block_metadata().is_empty());
        assert!(template.depends_on().is_empty());
        assert_eq!(template.render(&[("x", 1)].into_iter().collect()).unwrap(), "1");
    }
}
