//! Lowers a syntax tree into a tree of closures.
//!
//! Every closure is `Send + Sync` and captures only immutable data: constants,
//! pre-resolved registry entries and compiled children. All render-time state
//! lives in [`State`], which is created fresh for each render call, so one
//! compiled template can be rendered from many threads at once.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use crate::{
    ast::{
        BoolOpKind, Expr, ExprKind, FilterCall, Node, NodeKind, Target, TemplateAst, UnaryOpKind,
    },
    builtins::{Args, RANGE_LIMIT},
    config::Registry,
    environment::parse_ttl,
    error::{CompileError, KilnResult, closest_match},
    scope::ScopeStack,
    template::{Frame, State},
    value::{Resolved, Value, ops},
};

pub(crate) type ExprFn = Arc<dyn Fn(&mut State<'_>) -> KilnResult<Resolved> + Send + Sync>;
pub(crate) type NodeFn = Arc<dyn Fn(&mut State<'_>, &mut String) -> KilnResult<Flow> + Send + Sync>;
type FilterApply = Arc<dyn Fn(&mut State<'_>, Value) -> KilnResult<Value> + Send + Sync>;

/// How control leaves a rendered body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Normal,
    Break,
    Continue,
}

/// The executable half of a template.
pub(crate) struct CompiledTemplate {
    pub(crate) root: NodeFn,
    /// Every block in the template, nested ones included.
    pub(crate) blocks: HashMap<String, NodeFn>,
    /// Static lower bound on the rendered size, used to pre-size buffers.
    pub(crate) size_hint: usize,
}

/// A `{% def %}` macro. Calling it renders its body with the bindings that
/// were visible where it was defined, plus its parameters.
pub struct Macro {
    name: String,
    template: Arc<str>,
    params: Vec<(String, Option<ExprFn>)>,
    body: NodeFn,
    closure: Frame,
}

/// Content passed to a macro by `{% call %}`, rendered where the macro
/// says `{% slot %}`.
pub(crate) struct Caller {
    pub(crate) body: NodeFn,
    pub(crate) frames: Vec<Frame>,
    pub(crate) template: Arc<str>,
}

impl Macro {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn call(
        self: &Arc<Self>,
        state: &mut State<'_>,
        positional: Vec<Value>,
        mut keyword: BTreeMap<String, Value>,
        caller: Option<Caller>,
        line: usize,
    ) -> KilnResult<Value> {
        if positional.len() > self.params.len() {
            return Err(state.runtime_error(
                line,
                format!(
                    "macro '{}' takes {} argument(s) but {} were given",
                    self.name,
                    self.params.len(),
                    positional.len()
                ),
                None,
            ));
        }
        if let Some(unknown) = keyword
            .keys()
            .find(|k| !self.params.iter().any(|(name, _)| name == *k))
        {
            let suggestion = closest_match(unknown, self.params.iter().map(|(n, _)| n.as_str()));
            return Err(state.runtime_error(
                line,
                format!("macro '{}' has no parameter '{unknown}'", self.name),
                suggestion,
            ));
        }

        state.enter()?;
        let mut frame = Frame::new();
        frame.insert(self.name.clone(), Value::Macro(Arc::clone(self)));
        let saved_frames = std::mem::replace(&mut state.frames, vec![self.closure.clone(), frame]);
        let saved_template = std::mem::replace(&mut state.template, Arc::clone(&self.template));
        state.callers.push(caller);

        let result = self.bind_params(state, positional, &mut keyword).and_then(|()| {
            let mut out = String::new();
            (self.body)(state, &mut out).map(|_| out)
        });

        state.callers.pop();
        state.template = saved_template;
        state.frames = saved_frames;
        state.leave();
        result.map(Value::from_safe)
    }

    fn bind_params(
        &self,
        state: &mut State<'_>,
        positional: Vec<Value>,
        keyword: &mut BTreeMap<String, Value>,
    ) -> KilnResult<()> {
        let mut positional = positional.into_iter();
        for (name, default) in &self.params {
            let value = match (positional.next(), keyword.remove(name), default) {
                (Some(value), _, _) | (None, Some(value), _) => value,
                (None, None, Some(default)) => default(state)?.into_value(),
                (None, None, None) => Value::None,
            };
            state.bind(name, value);
        }
        Ok(())
    }
}

/// Compiles `ast`. Only fails on trees the parser would never produce.
pub(crate) fn compile(ast: &TemplateAst, registry: &Registry) -> Result<CompiledTemplate, CompileError> {
    let mut compiler = Compiler {
        template: Arc::from(ast.name.as_str()),
        registry,
        scopes: ScopeStack::new(),
        blocks: HashMap::new(),
        size_hint: 0,
        loop_depth: 0,
        def_depth: 0,
    };
    let root = compiler.body(&ast.body)?;
    log::debug!(
        "compiled {}: {} block(s), size hint {}",
        ast.name,
        compiler.blocks.len(),
        compiler.size_hint
    );
    Ok(CompiledTemplate {
        root,
        blocks: compiler.blocks,
        size_hint: compiler.size_hint,
    })
}

struct Compiler<'a> {
    template: Arc<str>,
    registry: &'a Registry,
    scopes: ScopeStack,
    blocks: HashMap<String, NodeFn>,
    size_hint: usize,
    loop_depth: usize,
    def_depth: usize,
}

impl Compiler<'_> {
    fn invariant(&self, message: impl Into<String>) -> CompileError {
        CompileError {
            template: self.template.to_string(),
            message: message.into(),
        }
    }

    fn body(&mut self, nodes: &[Node]) -> Result<NodeFn, CompileError> {
        let mut compiled = nodes
            .iter()
            .map(|node| self.node(node))
            .collect::<Result<Vec<_>, _>>()?;
        if compiled.len() == 1 {
            if let Some(only) = compiled.pop() {
                return Ok(only);
            }
        }
        Ok(Arc::new(move |state, out| {
            for node in &compiled {
                let flow = node(state, out)?;
                if flow != Flow::Normal {
                    return Ok(flow);
                }
            }
            Ok(Flow::Normal)
        }))
    }

    fn scoped_body(&mut self, nodes: &[Node], names: &[&str]) -> Result<NodeFn, CompileError> {
        self.scopes.push();
        for name in names {
            self.scopes.bind(name);
        }
        let body = self.body(nodes);
        self.scopes.pop();
        body
    }

    fn node(&mut self, node: &Node) -> Result<NodeFn, CompileError> {
        let line = node.line;
        Ok(match &node.kind {
            NodeKind::Data(text) => {
                self.size_hint = self.size_hint.saturating_add(text.len());
                let text: Arc<str> = Arc::from(text.as_str());
                Arc::new(move |_, out| {
                    out.push_str(&text);
                    Ok(Flow::Normal)
                })
            }
            NodeKind::Output(expr) => {
                self.size_hint = self.size_hint.saturating_add(8);
                let expr = self.expr(expr)?;
                Arc::new(move |state, out| {
                    let value = expr(state)?;
                    state.write(&value, out);
                    Ok(Flow::Normal)
                })
            }
            NodeKind::If {
                branches,
                else_body,
            } => {
                let branches = branches
                    .iter()
                    .map(|branch| Ok((self.expr(&branch.condition)?, self.body(&branch.body)?)))
                    .collect::<Result<Vec<_>, CompileError>>()?;
                let else_body = else_body.as_deref().map(|b| self.body(b)).transpose()?;
                Arc::new(move |state, out| {
                    for (condition, body) in &branches {
                        if condition(state)?.is_true() {
                            return body(state, out);
                        }
                    }
                    match &else_body {
                        Some(body) => body(state, out),
                        None => Ok(Flow::Normal),
                    }
                })
            }
            NodeKind::For {
                target,
                iter,
                filter,
                body,
                empty,
            } => self.for_loop(target, iter, filter.as_ref(), body, empty.as_deref(), line)?,
            NodeKind::Match { subject, cases } => {
                let subject = self.expr(subject)?;
                let cases = cases
                    .iter()
                    .map(|case| {
                        let patterns = case
                            .patterns
                            .iter()
                            .map(|p| self.expr(p))
                            .collect::<Result<Vec<_>, _>>()?;
                        Ok((patterns, self.body(&case.body)?))
                    })
                    .collect::<Result<Vec<_>, CompileError>>()?;
                Arc::new(move |state, out| {
                    let subject = subject(state)?.into_value();
                    for (patterns, body) in &cases {
                        let mut matched = patterns.is_empty();
                        for pattern in patterns {
                            if pattern(state)?.into_value() == subject {
                                matched = true;
                                break;
                            }
                        }
                        if matched {
                            return body(state, out);
                        }
                    }
                    Ok(Flow::Normal)
                })
            }
            NodeKind::Let { target, value } => {
                let value = self.expr(value)?;
                for name in target.names() {
                    self.scopes.bind_root(name);
                }
                let target = target.clone();
                Arc::new(move |state, _| {
                    let value = value(state)?.into_value();
                    assign(state, &target, value, true, line)?;
                    Ok(Flow::Normal)
                })
            }
            NodeKind::Set { target, value } => {
                let value = self.expr(value)?;
                for name in target.names() {
                    self.scopes.bind(name);
                }
                let target = target.clone();
                Arc::new(move |state, _| {
                    let value = value(state)?.into_value();
                    assign(state, &target, value, false, line)?;
                    Ok(Flow::Normal)
                })
            }
            NodeKind::Capture { name, body } => {
                let body = self.body(body)?;
                self.scopes.bind(name);
                let name = name.clone();
                Arc::new(move |state, _| {
                    let mut captured = String::new();
                    let flow = body(state, &mut captured)?;
                    let value = state.markup(captured);
                    state.bind(&name, value);
                    Ok(flow)
                })
            }
            NodeKind::With { bindings, body } => {
                let values = bindings
                    .iter()
                    .map(|(name, expr)| Ok((name.clone(), self.expr(expr)?)))
                    .collect::<Result<Vec<_>, CompileError>>()?;
                let names: Vec<&str> = bindings.iter().map(|(n, _)| n.as_str()).collect();
                let body = self.scoped_body(body, &names)?;
                Arc::new(move |state, out| {
                    let mut frame = Frame::with_capacity(values.len());
                    for (name, expr) in &values {
                        frame.insert(name.clone(), expr(state)?.into_value());
                    }
                    state.push_frame(frame);
                    let flow = body(state, out);
                    state.pop_frame();
                    flow
                })
            }
            NodeKind::Def { name, params, body } => self.def(name, params, body)?,
            NodeKind::Slot => {
                if self.def_depth == 0 {
                    return Err(self.invariant("slot outside of a def"));
                }
                Arc::new(|state, out| {
                    state.slot(out)?;
                    Ok(Flow::Normal)
                })
            }
            NodeKind::CallBlock { call, body } => {
                let ExprKind::Call {
                    callee,
                    args,
                    kwargs,
                } = &call.kind
                else {
                    return Err(self.invariant("call block without a call expression"));
                };
                let callee = self.expr(callee)?;
                let (args, kwargs) = self.call_args(args, kwargs)?;
                let label = expr_label(call);
                let body = self.body(body)?;
                Arc::new(move |state, out| {
                    let callee = callee(state)?.into_value();
                    let Value::Macro(target) = callee else {
                        return Err(state.runtime_error(
                            line,
                            format!("'{label}' is not a macro"),
                            None,
                        ));
                    };
                    let (positional, keyword) = eval_args(state, &args, &kwargs)?;
                    let caller = Caller {
                        body: Arc::clone(&body),
                        frames: state.frames.clone(),
                        template: Arc::clone(&state.template),
                    };
                    let rendered = target.call(state, positional, keyword, Some(caller), line)?;
                    out.push_str(&rendered.to_output());
                    Ok(Flow::Normal)
                })
            }
            NodeKind::Include {
                template,
                ignore_missing,
            } => {
                let template = self.expr(template)?;
                let ignore_missing = *ignore_missing;
                Arc::new(move |state, out| {
                    let name = template(state)?.into_value();
                    state.include(&name, ignore_missing, line, out)?;
                    Ok(Flow::Normal)
                })
            }
            NodeKind::Import { template, alias } => {
                let template = self.expr(template)?;
                self.scopes.bind_root(alias);
                let alias = alias.clone();
                Arc::new(move |state, _| {
                    let name = template(state)?.into_value();
                    let exports = state.import(&name, line)?;
                    state.bind_root(&alias, Value::Map(Arc::new(exports)));
                    Ok(Flow::Normal)
                })
            }
            NodeKind::FromImport { template, names } => {
                let template = self.expr(template)?;
                for (name, alias) in names {
                    self.scopes.bind_root(alias.as_deref().unwrap_or(name.as_str()));
                }
                let names = names.clone();
                Arc::new(move |state, _| {
                    let source = template(state)?.into_value();
                    let mut exports = state.import(&source, line)?;
                    for (name, alias) in &names {
                        let Some(value) = exports.remove(name) else {
                            let suggestion = closest_match(name, exports.keys().map(String::as_str));
                            return Err(state.runtime_error(
                                line,
                                format!("'{}' does not export '{name}'", source.to_output()),
                                suggestion,
                            ));
                        };
                        state.bind_root(alias.as_deref().unwrap_or(name.as_str()), value);
                    }
                    Ok(Flow::Normal)
                })
            }
            NodeKind::Extends { template } => {
                let template = self.expr(template)?;
                Arc::new(move |state, _| {
                    let name = template(state)?.into_value();
                    state.extends(&name, line)?;
                    Ok(Flow::Normal)
                })
            }
            NodeKind::Block { name, body } => {
                let body = self.scoped_body(body, &[])?;
                if self.blocks.insert(name.clone(), Arc::clone(&body)).is_some() {
                    return Err(self.invariant(format!("block '{name}' compiled twice")));
                }
                let name = name.clone();
                Arc::new(move |state, out| {
                    if state.is_extending() {
                        return Ok(Flow::Normal);
                    }
                    state.render_block(&name, &body, out)
                })
            }
            NodeKind::Cache { key, ttl, body } => {
                let key = self.expr(key)?;
                let ttl = ttl.as_ref().map(|t| self.expr(t)).transpose()?;
                let body = self.body(body)?;
                Arc::new(move |state, out| {
                    let key = ops::key_string(&key(state)?.into_value());
                    let ttl = match &ttl {
                        Some(ttl) => {
                            let ttl = ttl(state)?.into_value();
                            Some(parse_ttl(&ttl).map_err(|msg| state.runtime_error(line, msg, None))?)
                        }
                        None => None,
                    };
                    state.cached_fragment(&key, ttl, &body, out)
                })
            }
            NodeKind::FilterBlock { filter, body } => {
                let apply = self.filter_call(filter)?;
                let body = self.body(body)?;
                Arc::new(move |state, out| {
                    let mut rendered = String::new();
                    let flow = body(state, &mut rendered)?;
                    let input = state.markup(rendered);
                    let result = apply(state, input)?;
                    state.write(&Resolved::Value(result), out);
                    Ok(flow)
                })
            }
            NodeKind::Break | NodeKind::Continue => {
                if self.loop_depth == 0 {
                    return Err(self.invariant("loop control outside of a loop"));
                }
                let flow = if matches!(node.kind, NodeKind::Break) {
                    Flow::Break
                } else {
                    Flow::Continue
                };
                Arc::new(move |_, _| Ok(flow))
            }
        })
    }

    fn for_loop(
        &mut self,
        target: &Target,
        iter: &Expr,
        filter: Option<&Expr>,
        body: &[Node],
        empty: Option<&[Node]>,
        line: usize,
    ) -> Result<NodeFn, CompileError> {
        let iter = self.expr(iter)?;
        self.scopes.push();
        for name in target.names() {
            self.scopes.bind(name);
        }
        self.scopes.bind("loop");
        let filter = filter.map(|f| self.expr(f)).transpose();
        self.loop_depth = self.loop_depth.saturating_add(1);
        let compiled_body = self.body(body);
        self.loop_depth = self.loop_depth.saturating_sub(1);
        self.scopes.pop();
        let (filter, body) = (filter?, compiled_body?);
        let empty = empty.map(|e| self.body(e)).transpose()?;
        let target = target.clone();

        Ok(Arc::new(move |state, out| {
            let iterable = iter(state)?.into_value();
            let items = loop_items(&iterable, &target)
                .map_err(|msg| state.runtime_error(line, msg, None))?;

            state.push_frame(Frame::new());
            let result: KilnResult<usize> = (|| {
                let items = match &filter {
                    Some(filter) => {
                        let mut kept = Vec::with_capacity(items.len());
                        for item in items {
                            assign(state, &target, item.clone(), false, line)?;
                            if filter(state)?.is_true() {
                                kept.push(item);
                            }
                        }
                        kept
                    }
                    None => items,
                };
                let length = items.len();
                for (index, item) in items.into_iter().enumerate() {
                    state.check_deadline()?;
                    assign(state, &target, item, false, line)?;
                    state.bind("loop", loop_value(index, length));
                    if body(state, out)? == Flow::Break {
                        break;
                    }
                }
                Ok(length)
            })();
            state.pop_frame();

            match (result?, &empty) {
                (0, Some(empty)) => empty(state, out),
                _ => Ok(Flow::Normal),
            }
        }))
    }

    fn def(
        &mut self,
        name: &str,
        params: &[crate::ast::Param],
        body: &[Node],
    ) -> Result<NodeFn, CompileError> {
        self.scopes.bind(name);
        self.scopes.push();
        self.scopes.bind(name);
        let mut compiled_params = Vec::with_capacity(params.len());
        for param in params {
            let default = param.default.as_ref().map(|d| self.expr(d)).transpose();
            self.scopes.bind(&param.name);
            match default {
                Ok(default) => compiled_params.push((param.name.clone(), default)),
                Err(e) => {
                    self.scopes.pop();
                    return Err(e);
                }
            }
        }
        let saved_loop_depth = std::mem::take(&mut self.loop_depth);
        self.def_depth = self.def_depth.saturating_add(1);
        let body = self.body(body);
        self.def_depth = self.def_depth.saturating_sub(1);
        self.loop_depth = saved_loop_depth;
        self.scopes.pop();
        let body = body?;

        let name = name.to_string();
        let template = Arc::clone(&self.template);
        Ok(Arc::new(move |state, _| {
            let value = Value::Macro(Arc::new(Macro {
                name: name.clone(),
                template: Arc::clone(&template),
                params: compiled_params.clone(),
                body: Arc::clone(&body),
                closure: state.flatten_frames(),
            }));
            state.bind(&name, value);
            Ok(Flow::Normal)
        }))
    }

    fn call_args(
        &self,
        args: &[Expr],
        kwargs: &[(String, Expr)],
    ) -> Result<(Vec<ExprFn>, Vec<(String, ExprFn)>), CompileError> {
        let args = args
            .iter()
            .map(|a| self.expr(a))
            .collect::<Result<Vec<_>, _>>()?;
        let kwargs = kwargs
            .iter()
            .map(|(name, a)| Ok((name.clone(), self.expr(a)?)))
            .collect::<Result<Vec<_>, CompileError>>()?;
        Ok((args, kwargs))
    }

    fn filter_call(&self, call: &FilterCall) -> Result<FilterApply, CompileError> {
        let (args, kwargs) = self.call_args(&call.args, &call.kwargs)?;
        let line = call.line;
        let name = call.name.clone();
        Ok(match self.registry.filters.get(&call.name) {
            Some(entry) => {
                let func = Arc::clone(&entry.func);
                Arc::new(move |state, input| {
                    let (positional, keyword) = eval_args(state, &args, &kwargs)?;
                    func(&input, &Args::new(positional, keyword)).map_err(|msg| {
                        state.runtime_error(line, format!("filter '{name}': {msg}"), None)
                    })
                })
            }
            None => {
                let suggestion = closest_match(&name, self.registry.filter_names());
                Arc::new(move |state, _| {
                    Err(state.runtime_error(
                        line,
                        format!("unknown filter '{name}'"),
                        suggestion.clone(),
                    ))
                })
            }
        })
    }

    /// Input of a filter step. `default` sees a missing value instead of
    /// raising in strict mode.
    fn filter_input(&self, value: &Expr, first: &FilterCall) -> Result<ExprFn, CompileError> {
        let value = self.expr(value)?;
        if matches!(first.name.as_str(), "default" | "d") {
            Ok(Arc::new(move |state| state.leniently(|s| value(s))))
        } else {
            Ok(value)
        }
    }

    fn expr(&self, expr: &Expr) -> Result<ExprFn, CompileError> {
        let line = expr.line;
        Ok(match &expr.kind {
            ExprKind::Const(value) => {
                let value = value.clone();
                Arc::new(move |_| Ok(Resolved::Value(value.clone())))
            }
            ExprKind::Name(name) => {
                let local = self.scopes.is_local(name);
                let name = name.clone();
                Arc::new(move |state| match state.lookup(&name, local) {
                    Some(value) => Ok(Resolved::Value(value)),
                    None => state.undefined(&name, line),
                })
            }
            ExprKind::Getattr { value, attr } => {
                let base = self.expr(value)?;
                let attr = attr.clone();
                let label = expr_label(expr);
                Arc::new(move |state| match base(state)? {
                    Resolved::Value(v) => match v.get_attr(&attr) {
                        Some(found) => Ok(Resolved::Value(found)),
                        None => state.undefined(&label, line),
                    },
                    undefined @ Resolved::Undefined(_) => Ok(undefined),
                })
            }
            ExprKind::OptionalGetattr { value, attr } => {
                let base = self.expr(value)?;
                let attr = attr.clone();
                Arc::new(move |state| Ok(base(state)?.attr(&attr)))
            }
            ExprKind::Getitem { value, key } => {
                let base = self.expr(value)?;
                let key = self.expr(key)?;
                let label = expr_label(expr);
                Arc::new(move |state| match base(state)? {
                    Resolved::Value(v) => {
                        let key = key(state)?.into_value();
                        match v.get_item(&key) {
                            Some(found) => Ok(Resolved::Value(found)),
                            None => state.undefined(&label, line),
                        }
                    }
                    undefined @ Resolved::Undefined(_) => Ok(undefined),
                })
            }
            ExprKind::OptionalGetitem { value, key } => {
                let base = self.expr(value)?;
                let key = self.expr(key)?;
                Arc::new(move |state| {
                    let base = base(state)?;
                    if base.is_missing() {
                        return Ok(Resolved::undefined("?[]"));
                    }
                    let key = key(state)?.into_value();
                    Ok(base.item(&key))
                })
            }
            ExprKind::Slice {
                value,
                start,
                stop,
                step,
            } => {
                let base = self.expr(value)?;
                let bound = |b: &Option<Box<Expr>>| b.as_deref().map(|e| self.expr(e)).transpose();
                let (start, stop, step) = (bound(start)?, bound(stop)?, bound(step)?);
                Arc::new(move |state| {
                    let value = match base(state)? {
                        Resolved::Value(value) => value,
                        undefined @ Resolved::Undefined(_) => return Ok(undefined),
                    };
                    let mut bounds = [None; 3];
                    for (slot, bound) in bounds.iter_mut().zip([&start, &stop, &step]) {
                        if let Some(bound) = bound {
                            let bound = bound(state)?.into_value();
                            *slot = ops::slice_bound(&bound)
                                .map_err(|msg| state.runtime_error(line, msg, None))?;
                        }
                    }
                    let [start, stop, step] = bounds;
                    value
                        .slice(start, stop, step)
                        .map(Resolved::Value)
                        .map_err(|msg| state.runtime_error(line, msg, None))
                })
            }
            ExprKind::List(items) => {
                let items = items
                    .iter()
                    .map(|i| self.expr(i))
                    .collect::<Result<Vec<_>, _>>()?;
                Arc::new(move |state| {
                    let mut values = Vec::with_capacity(items.len());
                    for item in &items {
                        values.push(item(state)?.into_value());
                    }
                    Ok(Resolved::Value(Value::from(values)))
                })
            }
            ExprKind::Dict(pairs) => {
                let pairs = pairs
                    .iter()
                    .map(|(k, v)| Ok((self.expr(k)?, self.expr(v)?)))
                    .collect::<Result<Vec<_>, CompileError>>()?;
                Arc::new(move |state| {
                    let mut map = BTreeMap::new();
                    for (key, value) in &pairs {
                        let key = ops::key_string(&key(state)?.into_value());
                        map.insert(key, value(state)?.into_value());
                    }
                    Ok(Resolved::Value(Value::Map(Arc::new(map))))
                })
            }
            ExprKind::BinOp { op, left, right } => {
                let (op, left, right) = (*op, self.expr(left)?, self.expr(right)?);
                Arc::new(move |state| {
                    let l = left(state)?.into_value();
                    let r = right(state)?.into_value();
                    ops::binary(op, &l, &r)
                        .map(Resolved::Value)
                        .map_err(|msg| state.runtime_error(line, msg, None))
                })
            }
            ExprKind::UnaryOp { op, operand } => {
                let (op, operand) = (*op, self.expr(operand)?);
                Arc::new(move |state| {
                    let value = operand(state)?;
                    let result = match op {
                        UnaryOpKind::Not => Ok(Value::Bool(!value.is_true())),
                        UnaryOpKind::Neg => ops::negate(&value.into_value()),
                        UnaryOpKind::Pos => ops::plus(&value.into_value()),
                    };
                    result
                        .map(Resolved::Value)
                        .map_err(|msg| state.runtime_error(line, msg, None))
                })
            }
            ExprKind::BoolOp { op, left, right } => {
                let (op, left, right) = (*op, self.expr(left)?, self.expr(right)?);
                Arc::new(move |state| {
                    let l = left(state)?;
                    match (op, l.is_true()) {
                        (BoolOpKind::And, false) | (BoolOpKind::Or, true) => Ok(l),
                        (BoolOpKind::And, true) | (BoolOpKind::Or, false) => right(state),
                    }
                })
            }
            ExprKind::Compare { op, left, right } => {
                let (op, left, right) = (*op, self.expr(left)?, self.expr(right)?);
                Arc::new(move |state| {
                    let l = left(state)?.into_value();
                    let r = right(state)?.into_value();
                    ops::compare(op, &l, &r)
                        .map(|b| Resolved::Value(Value::Bool(b)))
                        .map_err(|msg| state.runtime_error(line, msg, None))
                })
            }
            ExprKind::Test {
                value,
                name,
                args,
                negated,
            } => self.test(value, name, args, *negated, line)?,
            ExprKind::Concat(parts) => {
                let parts = parts
                    .iter()
                    .map(|p| self.expr(p))
                    .collect::<Result<Vec<_>, _>>()?;
                Arc::new(move |state| {
                    let mut values = Vec::with_capacity(parts.len());
                    for part in &parts {
                        values.push(part(state)?.into_value());
                    }
                    Ok(Resolved::Value(ops::concat(&values)))
                })
            }
            ExprKind::Range {
                start,
                end,
                inclusive,
            } => {
                let (start, end, inclusive) = (self.expr(start)?, self.expr(end)?, *inclusive);
                Arc::new(move |state| {
                    let s = start(state)?.into_value();
                    let e = end(state)?.into_value();
                    ops::range(&s, &e, inclusive, RANGE_LIMIT)
                        .map(Resolved::Value)
                        .map_err(|msg| state.runtime_error(line, msg, None))
                })
            }
            ExprKind::Conditional {
                condition,
                then,
                otherwise,
            } => {
                let condition = self.expr(condition)?;
                let then = self.expr(then)?;
                let otherwise = otherwise.as_deref().map(|o| self.expr(o)).transpose()?;
                Arc::new(move |state| {
                    if condition(state)?.is_true() {
                        then(state)
                    } else {
                        match &otherwise {
                            Some(otherwise) => otherwise(state),
                            None => Ok(Resolved::undefined("else")),
                        }
                    }
                })
            }
            ExprKind::NullCoalesce { left, right } => {
                let (left, right) = (self.expr(left)?, self.expr(right)?);
                Arc::new(move |state| {
                    let l = state.leniently(|s| left(s))?;
                    l.coalesce(|| right(state))
                })
            }
            ExprKind::Filter { value, filter } => {
                let input = self.filter_input(value, filter)?;
                let apply = self.filter_call(filter)?;
                Arc::new(move |state| {
                    let input = input(state)?.into_value();
                    apply(state, input).map(Resolved::Value)
                })
            }
            ExprKind::Pipeline { value, steps } => {
                let Some(first) = steps.first() else {
                    return Err(self.invariant("pipeline without steps"));
                };
                let input = self.filter_input(value, first)?;
                let steps = steps
                    .iter()
                    .map(|s| self.filter_call(s))
                    .collect::<Result<Vec<_>, _>>()?;
                Arc::new(move |state| {
                    let mut value = input(state)?.into_value();
                    for step in &steps {
                        value = step(state, value)?;
                    }
                    Ok(Resolved::Value(value))
                })
            }
            ExprKind::Call {
                callee,
                args,
                kwargs,
            } => self.call(callee, args, kwargs, line)?,
        })
    }

    fn test(
        &self,
        value: &Expr,
        name: &str,
        args: &[Expr],
        negated: bool,
        line: usize,
    ) -> Result<ExprFn, CompileError> {
        let value = self.expr(value)?;
        if matches!(name, "defined" | "undefined") {
            let want_defined = name == "defined";
            return Ok(Arc::new(move |state| {
                let defined = !state.leniently(|s| value(s))?.is_undefined();
                Ok(Resolved::Value(Value::Bool((defined == want_defined) != negated)))
            }));
        }
        let (args, kwargs) = self.call_args(args, &[])?;
        let name = name.to_string();
        Ok(match self.registry.tests.get(&name) {
            Some(test) => {
                let test = Arc::clone(test);
                Arc::new(move |state| {
                    let input = value(state)?.into_value();
                    let (positional, keyword) = eval_args(state, &args, &kwargs)?;
                    let passed = test(&input, &Args::new(positional, keyword)).map_err(|msg| {
                        state.runtime_error(line, format!("test '{name}': {msg}"), None)
                    })?;
                    Ok(Resolved::Value(Value::Bool(passed != negated)))
                })
            }
            None => {
                let suggestion = closest_match(&name, self.registry.test_names());
                Arc::new(move |state| {
                    Err(state.runtime_error(line, format!("unknown test '{name}'"), suggestion.clone()))
                })
            }
        })
    }

    fn call(
        &self,
        callee: &Expr,
        args: &[Expr],
        kwargs: &[(String, Expr)],
        line: usize,
    ) -> Result<ExprFn, CompileError> {
        let (args, kwargs) = self.call_args(args, kwargs)?;
        if let ExprKind::Name(name) = &callee.kind {
            if !self.scopes.is_local(name) {
                if name == "super" {
                    return Ok(Arc::new(move |state| state.super_block(line).map(Resolved::Value)));
                }
                if let Some(entry) = self.registry.functions.get(name) {
                    let func = Arc::clone(&entry.func);
                    let name = name.clone();
                    return Ok(Arc::new(move |state| {
                        let (positional, keyword) = eval_args(state, &args, &kwargs)?;
                        func(&Args::new(positional, keyword))
                            .map(Resolved::Value)
                            .map_err(|msg| state.runtime_error(line, format!("{name}(): {msg}"), None))
                    }));
                }
            }
        }

        let suggestion = match &callee.kind {
            ExprKind::Name(name) => closest_match(name, self.registry.function_names()),
            _ => None,
        };
        let label = expr_label(callee);
        let callee = self.expr(callee)?;
        Ok(Arc::new(move |state| {
            match state.leniently(|s| callee(s))? {
                Resolved::Value(Value::Macro(target)) => {
                    let (positional, keyword) = eval_args(state, &args, &kwargs)?;
                    target
                        .call(state, positional, keyword, None, line)
                        .map(Resolved::Value)
                }
                Resolved::Value(other) => Err(state.runtime_error(
                    line,
                    format!("'{label}' is a {} and cannot be called", other.kind_name()),
                    None,
                )),
                Resolved::Undefined(_) => Err(state.runtime_error(
                    line,
                    format!("'{label}' is not a macro or function"),
                    suggestion.clone(),
                )),
            }
        }))
    }
}

fn eval_args(
    state: &mut State<'_>,
    args: &[ExprFn],
    kwargs: &[(String, ExprFn)],
) -> KilnResult<(Vec<Value>, BTreeMap<String, Value>)> {
    let mut positional = Vec::with_capacity(args.len());
    for arg in args {
        positional.push(arg(state)?.into_value());
    }
    let mut keyword = BTreeMap::new();
    for (name, arg) in kwargs {
        keyword.insert(name.clone(), arg(state)?.into_value());
    }
    Ok((positional, keyword))
}

/// Binds a loop item or assigned value to its target, unpacking tuples.
fn assign(
    state: &mut State<'_>,
    target: &Target,
    value: Value,
    root: bool,
    line: usize,
) -> KilnResult<()> {
    let bind = |state: &mut State<'_>, name: &str, value: Value| {
        if root {
            state.bind_root(name, value);
        } else {
            state.bind(name, value);
        }
    };
    match target {
        Target::Name(name) => bind(state, name, value),
        Target::Tuple(names) => {
            let items = value
                .try_iter()
                .map_err(|msg| state.runtime_error(line, msg, None))?;
            if items.len() != names.len() {
                return Err(state.runtime_error(
                    line,
                    format!(
                        "cannot unpack {} value(s) into {} name(s)",
                        items.len(),
                        names.len()
                    ),
                    None,
                ));
            }
            for (name, item) in names.iter().zip(items) {
                bind(state, name, item);
            }
        }
    }
    Ok(())
}

/// Items a loop visits. Maps unpacked into two names yield key/value pairs.
fn loop_items(iterable: &Value, target: &Target) -> Result<Vec<Value>, String> {
    match (iterable, target) {
        (Value::Map(map), Target::Tuple(names)) if names.len() == 2 => Ok(map
            .iter()
            .map(|(k, v)| Value::from(vec![Value::from(k.as_str()), v.clone()]))
            .collect()),
        _ => iterable.try_iter(),
    }
}

fn loop_value(index: usize, length: usize) -> Value {
    let remaining = length.saturating_sub(index);
    Value::from_pairs([
        ("index", Value::from(index.saturating_add(1))),
        ("index0", Value::from(index)),
        ("revindex", Value::from(remaining)),
        ("revindex0", Value::from(remaining.saturating_sub(1))),
        ("first", Value::Bool(index == 0)),
        ("last", Value::Bool(remaining == 1)),
        ("length", Value::from(length)),
    ])
}

/// Source-like text for a name/attribute chain, used in error messages.
fn expr_label(expr: &Expr) -> String {
    match &expr.kind {
        ExprKind::Name(name) => name.clone(),
        ExprKind::Getattr { value, attr } => format!("{}.{attr}", expr_label(value)),
        ExprKind::OptionalGetattr { value, attr } => format!("{}?.{attr}", expr_label(value)),
        ExprKind::Getitem { value, key } | ExprKind::OptionalGetitem { value, key } => {
            match key.as_const() {
                Some(key) => format!("{}[{}]", expr_label(value), key.repr()),
                None => format!("{}[...]", expr_label(value)),
            }
        }
        ExprKind::Call { callee, .. } => format!("{}()", expr_label(callee)),
        _ => "expression".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{ParseOptions, parse};

    fn compile_source(source: &str) -> Result<CompiledTemplate, CompileError> {
        let ast = parse(source, "test", ParseOptions::default()).unwrap().ast;
        compile(&ast, &Registry::with_builtins())
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_blocks_are_collected_with_nesting() {
        let compiled = compile_source(
            "{% block outer %}a{% block inner %}b{% endblock %}{% endblock %}",
        )
        .unwrap();
        let mut names: Vec<&String> = compiled.blocks.keys().collect();
        names.sort();
        assert_eq!(names, ["inner", "outer"]);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_size_hint_counts_text() {
        let compiled = compile_source("hello {{ name }} world").unwrap();
        assert!(compiled.size_hint >= "hello  world".len());
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_unknown_filter_still_compiles() {
        assert!(compile_source("{{ x | no_such_filter }}").is_ok());
        assert!(compile_source("{{ x is no_such_test }}").is_ok());
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_malformed_trees_are_compile_errors() {
        let registry = Registry::with_builtins();
        let ast = TemplateAst {
            name: "broken".to_string(),
            body: vec![Node::new(NodeKind::Break, 3)],
            blocks: Vec::new(),
        };
        let err = compile(&ast, &registry).err().unwrap();
        assert_eq!(err.template, "broken");
        assert!(err.message.contains("loop control"));

        let ast = TemplateAst {
            name: "broken".to_string(),
            body: vec![Node::new(NodeKind::Slot, 1)],
            blocks: Vec::new(),
        };
        assert!(compile(&ast, &registry).is_err());
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_loop_value_fields() {
        let value = loop_value(1, 3);
        assert_eq!(value.get_attr("index"), Some(Value::Int(2)));
        assert_eq!(value.get_attr("revindex0"), Some(Value::Int(1)));
        assert_eq!(value.get_attr("last"), Some(Value::Bool(false)));
        assert_eq!(loop_value(2, 3).get_attr("last"), Some(Value::Bool(true)));

        let only = loop_value(0, 1);
        assert_eq!(only.get_attr("first"), Some(Value::Bool(true)));
        assert_eq!(only.get_attr("last"), Some(Value::Bool(true)));
        assert_eq!(only.get_attr("revindex"), Some(Value::Int(1)));
        assert_eq!(only.get_attr("revindex0"), Some(Value::Int(0)));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_map_loop_items_unpack_pairs() {
        let map = Value::from_pairs([("a", 1), ("b", 2)]);
        let pairs = loop_items(&map, &Target::Tuple(vec!["k".into(), "v".into()])).unwrap();
        assert_eq!(pairs[1], Value::from(vec![Value::from("b"), Value::Int(2)]));
        let keys = loop_items(&map, &Target::Name("k".into())).unwrap();
        assert_eq!(keys, vec![Value::from("a"), Value::from("b")]);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_expr_labels() {
        let parsed = parse("{{ user.profile['name'] }}", "t", ParseOptions::default()).unwrap();
        let Some(NodeKind::Output(expr)) = parsed.ast.body.first().map(|n| &n.kind) else {
            panic!("expected output");
        };
        assert_eq!(expr_label(expr), "user.profile['name']");
    }
}
