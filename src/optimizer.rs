//! Tree-to-tree passes run between parsing and code generation.
//!
//! Every pass preserves rendered output for deterministic templates and keeps
//! the line numbers of the nodes it rewrites. Passes run in order: constant
//! folding, filter inlining (opt-in), dead-branch elimination, output lowering.

use std::{collections::BTreeMap, sync::Arc};

use crate::{
    analysis::Purity,
    ast::{
        BoolOpKind, Expr, ExprKind, FilterCall, IfBranch, MatchCase, Node, NodeKind, Param,
        TemplateAst, UnaryOpKind,
    },
    builtins::Args,
    config::Registry,
    value::{Value, escape_html, ops},
};

/// Constant ranges up to this many items are materialised at compile time.
const FOLD_RANGE_LIMIT: usize = 1024;

pub(crate) struct Optimizer<'a> {
    registry: &'a Registry,
    autoescape: bool,
    inline_filters: bool,
}

impl<'a> Optimizer<'a> {
    pub(crate) const fn new(registry: &'a Registry, autoescape: bool, inline_filters: bool) -> Self {
        Self {
            registry,
            autoescape,
            inline_filters,
        }
    }

    pub(crate) fn run(&self, mut ast: TemplateAst) -> TemplateAst {
        let before = count_nodes(&ast.body);
        ast.body = map_node_exprs(ast.body, &mut |e| self.fold(e));
        if self.inline_filters {
            ast.body = map_node_exprs(ast.body, &mut |e| self.inline(e));
        }
        ast.body = self.eliminate(ast.body);
        ast.body = self.lower(ast.body);
        log::debug!(
            "optimized {}: {} nodes -> {}",
            ast.name,
            before,
            count_nodes(&ast.body)
        );
        ast
    }

    fn fold(&self, expr: Expr) -> Expr {
        let expr = map_children(expr, &mut |child| self.fold(child));
        fold_shallow(expr)
    }

    fn inline(&self, expr: Expr) -> Expr {
        let expr = map_children(expr, &mut |child| self.inline(child));
        fold_shallow(self.try_inline(expr))
    }

    /// Evaluates a pure filter at compile time if its input and arguments
    /// are all constants.
    fn try_inline(&self, expr: Expr) -> Expr {
        let line = expr.line;
        match expr.kind {
            ExprKind::Filter { value, filter } => match value.as_const() {
                Some(input) => match self.apply_pure(input, &filter) {
                    Some(result) => Expr::new(ExprKind::Const(result), line),
                    None => Expr::new(ExprKind::Filter { value, filter }, line),
                },
                None => Expr::new(ExprKind::Filter { value, filter }, line),
            },
            ExprKind::Pipeline { value, steps } => {
                let mut current = value;
                let mut remaining = steps.into_iter().peekable();
                while let Some(step) = remaining.peek() {
                    let Some(result) = current.as_const().and_then(|v| self.apply_pure(v, step))
                    else {
                        break;
                    };
                    current = Box::new(Expr::new(ExprKind::Const(result), step.line));
                    remaining.next();
                }
                let steps: Vec<FilterCall> = remaining.collect();
                if steps.is_empty() {
                    Expr::new(current.kind, line)
                } else {
                    Expr::new(ExprKind::Pipeline { value: current, steps }, line)
                }
            }
            kind => Expr::new(kind, line),
        }
    }

    fn apply_pure(&self, input: &Value, call: &FilterCall) -> Option<Value> {
        let entry = self.registry.filters.get(&call.name)?;
        if entry.purity != Purity::Pure {
            return None;
        }
        let positional = call
            .args
            .iter()
            .map(|arg| arg.as_const().cloned())
            .collect::<Option<Vec<_>>>()?;
        let keyword = call
            .kwargs
            .iter()
            .map(|(name, arg)| arg.as_const().map(|v| (name.clone(), v.clone())))
            .collect::<Option<BTreeMap<_, _>>>()?;
        (entry.func)(input, &Args::new(positional, keyword)).ok()
    }

    /// Drops statically dead branches, splicing the surviving body in place.
    /// `if`, `for`-`empty` and `match` arms share the enclosing scope, so the
    /// splice cannot change name resolution.
    fn eliminate(&self, nodes: Vec<Node>) -> Vec<Node> {
        let mut out = Vec::with_capacity(nodes.len());
        for node in nodes {
            let line = node.line;
            match node.kind {
                NodeKind::If {
                    branches,
                    else_body,
                } if !branches.iter().any(|b| contains_block(&b.body))
                    && !else_body.as_deref().is_some_and(contains_block) =>
                {
                    let mut kept = Vec::new();
                    let mut else_body = else_body;
                    for branch in branches {
                        match branch.condition.as_const().map(Value::is_true) {
                            Some(false) => {}
                            Some(true) => {
                                else_body = Some(branch.body);
                                break;
                            }
                            None => kept.push(branch),
                        }
                    }
                    if kept.is_empty() {
                        out.extend(self.eliminate(else_body.unwrap_or_default()));
                    } else {
                        let branches = kept
                            .into_iter()
                            .map(|b| IfBranch {
                                condition: b.condition,
                                body: self.eliminate(b.body),
                            })
                            .collect();
                        let else_body = else_body.map(|body| self.eliminate(body));
                        out.push(Node::new(
                            NodeKind::If {
                                branches,
                                else_body,
                            },
                            line,
                        ));
                    }
                }
                NodeKind::For {
                    target,
                    iter,
                    filter,
                    body,
                    empty,
                } => {
                    let is_empty = iter
                        .as_const()
                        .and_then(|v| v.try_iter().ok())
                        .is_some_and(|items| items.is_empty());
                    if is_empty && !contains_block(&body) {
                        out.extend(self.eliminate(empty.unwrap_or_default()));
                    } else {
                        out.push(Node::new(
                            NodeKind::For {
                                target,
                                iter,
                                filter,
                                body: self.eliminate(body),
                                empty: empty.map(|e| self.eliminate(e)),
                            },
                            line,
                        ));
                    }
                }
                NodeKind::Match { subject, cases } => {
                    match static_case(&subject, &cases) {
                        Some(index) if !cases.iter().any(|c| contains_block(&c.body)) => {
                            let body = cases
                                .into_iter()
                                .nth(index)
                                .map(|c| c.body)
                                .unwrap_or_default();
                            out.extend(self.eliminate(body));
                        }
                        _ => out.push(Node::new(
                            NodeKind::Match {
                                subject,
                                cases: cases
                                    .into_iter()
                                    .map(|c| MatchCase {
                                        patterns: c.patterns,
                                        body: self.eliminate(c.body),
                                    })
                                    .collect(),
                            },
                            line,
                        )),
                    }
                }
                kind => out.push(Node::new(
                    map_bodies(kind, &mut |body| self.eliminate(body)),
                    line,
                )),
            }
        }
        out
    }

    /// Turns constant output into text and merges adjacent text.
    fn lower(&self, nodes: Vec<Node>) -> Vec<Node> {
        let mut out: Vec<Node> = Vec::with_capacity(nodes.len());
        for node in nodes {
            let line = node.line;
            let kind = match node.kind {
                NodeKind::Output(Expr {
                    kind: ExprKind::Const(value),
                    ..
                }) if !matches!(value, Value::Macro(_)) => {
                    let text = if self.autoescape && !value.is_safe() {
                        escape_html(&value.to_output())
                    } else {
                        value.to_output()
                    };
                    NodeKind::Data(text)
                }
                kind => map_bodies(kind, &mut |body| self.lower(body)),
            };
            if let NodeKind::Data(text) = &kind {
                if text.is_empty() {
                    continue;
                }
                if let Some(Node {
                    kind: NodeKind::Data(previous),
                    ..
                }) = out.last_mut()
                {
                    previous.push_str(text);
                    continue;
                }
            }
            out.push(Node::new(kind, line));
        }
        out
    }
}

/// Index of the arm a constant `match` subject selects, if decidable.
fn static_case(subject: &Expr, cases: &[MatchCase]) -> Option<usize> {
    let subject = subject.as_const()?;
    for (index, case) in cases.iter().enumerate() {
        if case.patterns.is_empty() {
            return Some(index);
        }
        for pattern in &case.patterns {
            if pattern.as_const()? == subject {
                return Some(index);
            }
        }
    }
    // No arm matches: nothing renders.
    Some(cases.len())
}

fn contains_block(nodes: &[Node]) -> bool {
    let mut stack: Vec<&Node> = nodes.iter().collect();
    while let Some(node) = stack.pop() {
        if matches!(node.kind, NodeKind::Block { .. }) {
            return true;
        }
        for_each_body(&node.kind, |body| stack.extend(body.iter()));
    }
    false
}

fn count_nodes(nodes: &[Node]) -> usize {
    let mut count: usize = 0;
    let mut stack: Vec<&Node> = nodes.iter().collect();
    while let Some(node) = stack.pop() {
        count = count.saturating_add(1);
        for_each_body(&node.kind, |body| stack.extend(body.iter()));
    }
    count
}

/// Calls `f` with every child body of a node.
pub(crate) fn for_each_body<'n>(kind: &'n NodeKind, mut f: impl FnMut(&'n [Node])) {
    match kind {
        NodeKind::If {
            branches,
            else_body,
        } => {
            for branch in branches {
                f(&branch.body);
            }
            if let Some(body) = else_body {
                f(body);
            }
        }
        NodeKind::For { body, empty, .. } => {
            f(body);
            if let Some(body) = empty {
                f(body);
            }
        }
        NodeKind::Match { cases, .. } => {
            for case in cases {
                f(&case.body);
            }
        }
        NodeKind::Capture { body, .. }
        | NodeKind::With { body, .. }
        | NodeKind::Def { body, .. }
        | NodeKind::CallBlock { body, .. }
        | NodeKind::Block { body, .. }
        | NodeKind::Cache { body, .. }
        | NodeKind::FilterBlock { body, .. } => f(body),
        NodeKind::Data(_)
        | NodeKind::Output(_)
        | NodeKind::Let { .. }
        | NodeKind::Set { .. }
        | NodeKind::Slot
        | NodeKind::Include { .. }
        | NodeKind::Import { .. }
        | NodeKind::FromImport { .. }
        | NodeKind::Extends { .. }
        | NodeKind::Break
        | NodeKind::Continue => {}
    }
}

/// Rebuilds a node with `f` applied to each child body.
fn map_bodies(kind: NodeKind, f: &mut impl FnMut(Vec<Node>) -> Vec<Node>) -> NodeKind {
    match kind {
        NodeKind::If {
            branches,
            else_body,
        } => NodeKind::If {
            branches: branches
                .into_iter()
                .map(|b| IfBranch {
                    condition: b.condition,
                    body: f(b.body),
                })
                .collect(),
            else_body: else_body.map(&mut *f),
        },
        NodeKind::For {
            target,
            iter,
            filter,
            body,
            empty,
        } => NodeKind::For {
            target,
            iter,
            filter,
            body: f(body),
            empty: empty.map(&mut *f),
        },
        NodeKind::Match { subject, cases } => NodeKind::Match {
            subject,
            cases: cases
                .into_iter()
                .map(|c| MatchCase {
                    patterns: c.patterns,
                    body: f(c.body),
                })
                .collect(),
        },
        NodeKind::Capture { name, body } => NodeKind::Capture {
            name,
            body: f(body),
        },
        NodeKind::With { bindings, body } => NodeKind::With {
            bindings,
            body: f(body),
        },
        NodeKind::Def { name, params, body } => NodeKind::Def {
            name,
            params,
            body: f(body),
        },
        NodeKind::CallBlock { call, body } => NodeKind::CallBlock {
            call,
            body: f(body),
        },
        NodeKind::Block { name, body } => NodeKind::Block {
            name,
            body: f(body),
        },
        NodeKind::Cache { key, ttl, body } => NodeKind::Cache {
            key,
            ttl,
            body: f(body),
        },
        NodeKind::FilterBlock { filter, body } => NodeKind::FilterBlock {
            filter,
            body: f(body),
        },
        kind @ (NodeKind::Data(_)
        | NodeKind::Output(_)
        | NodeKind::Let { .. }
        | NodeKind::Set { .. }
        | NodeKind::Slot
        | NodeKind::Include { .. }
        | NodeKind::Import { .. }
        | NodeKind::FromImport { .. }
        | NodeKind::Extends { .. }
        | NodeKind::Break
        | NodeKind::Continue) => kind,
    }
}

/// Applies `f` to every expression owned by `nodes`, recursing into bodies.
fn map_node_exprs(nodes: Vec<Node>, f: &mut impl FnMut(Expr) -> Expr) -> Vec<Node> {
    nodes
        .into_iter()
        .map(|node| {
            let kind = match node.kind {
                NodeKind::Output(expr) => NodeKind::Output(f(expr)),
                NodeKind::If {
                    branches,
                    else_body,
                } => NodeKind::If {
                    branches: branches
                        .into_iter()
                        .map(|b| IfBranch {
                            condition: f(b.condition),
                            body: map_node_exprs(b.body, f),
                        })
                        .collect(),
                    else_body: else_body.map(|body| map_node_exprs(body, f)),
                },
                NodeKind::For {
                    target,
                    iter,
                    filter,
                    body,
                    empty,
                } => NodeKind::For {
                    target,
                    iter: f(iter),
                    filter: filter.map(&mut *f),
                    body: map_node_exprs(body, f),
                    empty: empty.map(|body| map_node_exprs(body, f)),
                },
                NodeKind::Match { subject, cases } => NodeKind::Match {
                    subject: f(subject),
                    cases: cases
                        .into_iter()
                        .map(|c| MatchCase {
                            patterns: c.patterns.into_iter().map(&mut *f).collect(),
                            body: map_node_exprs(c.body, f),
                        })
                        .collect(),
                },
                NodeKind::Let { target, value } => NodeKind::Let {
                    target,
                    value: f(value),
                },
                NodeKind::Set { target, value } => NodeKind::Set {
                    target,
                    value: f(value),
                },
                NodeKind::Capture { name, body } => NodeKind::Capture {
                    name,
                    body: map_node_exprs(body, f),
                },
                NodeKind::With { bindings, body } => NodeKind::With {
                    bindings: bindings.into_iter().map(|(n, e)| (n, f(e))).collect(),
                    body: map_node_exprs(body, f),
                },
                NodeKind::Def { name, params, body } => NodeKind::Def {
                    name,
                    params: params
                        .into_iter()
                        .map(|p| Param {
                            name: p.name,
                            default: p.default.map(&mut *f),
                        })
                        .collect(),
                    body: map_node_exprs(body, f),
                },
                NodeKind::CallBlock { call, body } => NodeKind::CallBlock {
                    call: f(call),
                    body: map_node_exprs(body, f),
                },
                NodeKind::Include {
                    template,
                    ignore_missing,
                } => NodeKind::Include {
                    template: f(template),
                    ignore_missing,
                },
                NodeKind::Import { template, alias } => NodeKind::Import {
                    template: f(template),
                    alias,
                },
                NodeKind::FromImport { template, names } => NodeKind::FromImport {
                    template: f(template),
                    names,
                },
                NodeKind::Extends { template } => NodeKind::Extends {
                    template: f(template),
                },
                NodeKind::Block { name, body } => NodeKind::Block {
                    name,
                    body: map_node_exprs(body, f),
                },
                NodeKind::Cache { key, ttl, body } => NodeKind::Cache {
                    key: f(key),
                    ttl: ttl.map(&mut *f),
                    body: map_node_exprs(body, f),
                },
                NodeKind::FilterBlock { filter, body } => NodeKind::FilterBlock {
                    filter: map_filter_args(filter, f),
                    body: map_node_exprs(body, f),
                },
                kind @ (NodeKind::Data(_)
                | NodeKind::Slot
                | NodeKind::Break
                | NodeKind::Continue) => kind,
            };
            Node::new(kind, node.line)
        })
        .collect()
}

fn map_filter_args(call: FilterCall, f: &mut impl FnMut(Expr) -> Expr) -> FilterCall {
    FilterCall {
        name: call.name,
        args: call.args.into_iter().map(&mut *f).collect(),
        kwargs: call.kwargs.into_iter().map(|(n, e)| (n, f(e))).collect(),
        line: call.line,
    }
}

/// Rebuilds an expression with `f` applied to each direct child.
fn map_children(expr: Expr, f: &mut impl FnMut(Expr) -> Expr) -> Expr {
    fn boxed(e: Box<Expr>, f: &mut impl FnMut(Expr) -> Expr) -> Box<Expr> {
        Box::new(f(*e))
    }
    let kind = match expr.kind {
        kind @ (ExprKind::Const(_) | ExprKind::Name(_)) => kind,
        ExprKind::Getattr { value, attr } => ExprKind::Getattr {
            value: boxed(value, f),
            attr,
        },
        ExprKind::OptionalGetattr { value, attr } => ExprKind::OptionalGetattr {
            value: boxed(value, f),
            attr,
        },
        ExprKind::Getitem { value, key } => ExprKind::Getitem {
            value: boxed(value, f),
            key: boxed(key, f),
        },
        ExprKind::OptionalGetitem { value, key } => ExprKind::OptionalGetitem {
            value: boxed(value, f),
            key: boxed(key, f),
        },
        ExprKind::Slice {
            value,
            start,
            stop,
            step,
        } => ExprKind::Slice {
            value: boxed(value, f),
            start: start.map(|e| boxed(e, f)),
            stop: stop.map(|e| boxed(e, f)),
            step: step.map(|e| boxed(e, f)),
        },
        ExprKind::List(items) => ExprKind::List(items.into_iter().map(&mut *f).collect()),
        ExprKind::Dict(pairs) => {
            ExprKind::Dict(pairs.into_iter().map(|(k, v)| (f(k), f(v))).collect())
        }
        ExprKind::BinOp { op, left, right } => ExprKind::BinOp {
            op,
            left: boxed(left, f),
            right: boxed(right, f),
        },
        ExprKind::UnaryOp { op, operand } => ExprKind::UnaryOp {
            op,
            operand: boxed(operand, f),
        },
        ExprKind::BoolOp { op, left, right } => ExprKind::BoolOp {
            op,
            left: boxed(left, f),
            right: boxed(right, f),
        },
        ExprKind::Compare { op, left, right } => ExprKind::Compare {
            op,
            left: boxed(left, f),
            right: boxed(right, f),
        },
        ExprKind::Test {
            value,
            name,
            args,
            negated,
        } => ExprKind::Test {
            value: boxed(value, f),
            name,
            args: args.into_iter().map(&mut *f).collect(),
            negated,
        },
        ExprKind::Concat(parts) => ExprKind::Concat(parts.into_iter().map(&mut *f).collect()),
        ExprKind::Range {
            start,
            end,
            inclusive,
        } => ExprKind::Range {
            start: boxed(start, f),
            end: boxed(end, f),
            inclusive,
        },
        ExprKind::Conditional {
            condition,
            then,
            otherwise,
        } => ExprKind::Conditional {
            condition: boxed(condition, f),
            then: boxed(then, f),
            otherwise: otherwise.map(|e| boxed(e, f)),
        },
        ExprKind::NullCoalesce { left, right } => ExprKind::NullCoalesce {
            left: boxed(left, f),
            right: boxed(right, f),
        },
        ExprKind::Filter { value, filter } => ExprKind::Filter {
            value: boxed(value, f),
            filter: map_filter_args(filter, f),
        },
        ExprKind::Pipeline { value, steps } => ExprKind::Pipeline {
            value: boxed(value, f),
            steps: steps.into_iter().map(|s| map_filter_args(s, f)).collect(),
        },
        ExprKind::Call {
            callee,
            args,
            kwargs,
        } => ExprKind::Call {
            callee: boxed(callee, f),
            args: args.into_iter().map(&mut *f).collect(),
            kwargs: kwargs.into_iter().map(|(n, e)| (n, f(e))).collect(),
        },
    };
    Expr::new(kind, expr.line)
}

/// Folds `expr` itself, assuming its children are already folded. Anything
/// that would fail at runtime is left alone so the error surfaces there.
fn fold_shallow(expr: Expr) -> Expr {
    let line = expr.line;
    let constant = |value: Value| Expr::new(ExprKind::Const(value), line);
    match expr.kind {
        ExprKind::BinOp { op, left, right } => match (left.as_const(), right.as_const()) {
            (Some(l), Some(r)) => match ops::binary(op, l, r) {
                Ok(value) => constant(value),
                Err(_) => Expr::new(ExprKind::BinOp { op, left, right }, line),
            },
            _ => Expr::new(ExprKind::BinOp { op, left, right }, line),
        },
        ExprKind::UnaryOp { op, operand } => {
            let folded = operand.as_const().and_then(|v| match op {
                UnaryOpKind::Neg => ops::negate(v).ok(),
                UnaryOpKind::Pos => ops::plus(v).ok(),
                UnaryOpKind::Not => Some(Value::Bool(!v.is_true())),
            });
            match folded {
                Some(value) => constant(value),
                None => Expr::new(ExprKind::UnaryOp { op, operand }, line),
            }
        }
        ExprKind::BoolOp { op, left, right } => match left.as_const().map(Value::is_true) {
            Some(truthy) => match (op, truthy) {
                (BoolOpKind::And, false) | (BoolOpKind::Or, true) => Expr::new(left.kind, line),
                (BoolOpKind::And, true) | (BoolOpKind::Or, false) => *right,
            },
            None => Expr::new(ExprKind::BoolOp { op, left, right }, line),
        },
        ExprKind::Compare { op, left, right } => {
            let folded = match (left.as_const(), right.as_const()) {
                (Some(l), Some(r)) => ops::compare(op, l, r).ok(),
                _ => None,
            };
            match folded {
                Some(result) => constant(Value::Bool(result)),
                None => Expr::new(ExprKind::Compare { op, left, right }, line),
            }
        }
        ExprKind::Concat(parts) => {
            let values: Option<Vec<Value>> = parts.iter().map(|p| p.as_const().cloned()).collect();
            match values {
                Some(values) => constant(ops::concat(&values)),
                None => Expr::new(ExprKind::Concat(parts), line),
            }
        }
        ExprKind::Range {
            start,
            end,
            inclusive,
        } => {
            let folded = match (start.as_const(), end.as_const()) {
                (Some(s), Some(e)) => ops::range(s, e, inclusive, FOLD_RANGE_LIMIT).ok(),
                _ => None,
            };
            match folded {
                Some(value) => constant(value),
                None => Expr::new(
                    ExprKind::Range {
                        start,
                        end,
                        inclusive,
                    },
                    line,
                ),
            }
        }
        ExprKind::Conditional {
            condition,
            then,
            otherwise,
        } => match (condition.as_const().map(Value::is_true), otherwise) {
            (Some(true), _) => *then,
            (Some(false), Some(otherwise)) => *otherwise,
            (_, otherwise) => Expr::new(
                ExprKind::Conditional {
                    condition,
                    then,
                    otherwise,
                },
                line,
            ),
        },
        ExprKind::NullCoalesce { left, right } => match left.as_const() {
            Some(Value::None) => *right,
            Some(_) => *left,
            None => Expr::new(ExprKind::NullCoalesce { left, right }, line),
        },
        ExprKind::List(items) => {
            let values: Option<Vec<Value>> = items.iter().map(|i| i.as_const().cloned()).collect();
            match values {
                Some(values) => constant(Value::List(Arc::new(values))),
                None => Expr::new(ExprKind::List(items), line),
            }
        }
        ExprKind::Dict(pairs) => {
            let entries: Option<BTreeMap<String, Value>> = pairs
                .iter()
                .map(|(k, v)| Some((ops::key_string(k.as_const()?), v.as_const()?.clone())))
                .collect();
            match entries {
                Some(entries) => constant(Value::Map(Arc::new(entries))),
                None => Expr::new(ExprKind::Dict(pairs), line),
            }
        }
        ExprKind::Getattr { value, attr } => {
            match value.as_const().and_then(|v| v.get_attr(&attr)) {
                Some(found) => constant(found),
                None => Expr::new(ExprKind::Getattr { value, attr }, line),
            }
        }
        ExprKind::Getitem { value, key } => {
            let found = match (value.as_const(), key.as_const()) {
                (Some(v), Some(k)) => v.get_item(k),
                _ => None,
            };
            match found {
                Some(found) => constant(found),
                None => Expr::new(ExprKind::Getitem { value, key }, line),
            }
        }
        kind => Expr::new(kind, line),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ast::BinOpKind,
        parser::{ParseOptions, parse},
    };

    fn optimize_with(source: &str, registry: &Registry, autoescape: bool, inline: bool) -> Vec<Node> {
        let parsed = parse(source, "t", ParseOptions::default()).unwrap();
        Optimizer::new(registry, autoescape, inline).run(parsed.ast).body
    }

    fn optimize(source: &str) -> Vec<Node> {
        optimize_with(source, &Registry::with_builtins(), false, false)
    }

    fn data(text: &str) -> Vec<Node> {
        vec![Node::new(NodeKind::Data(text.to_string()), 1)]
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_constant_arithmetic_becomes_text() {
        assert_eq!(optimize("a{{ 1 + 2 * 3 }}b"), data("a7b"));
        assert_eq!(optimize("{{ 'x' ~ 1 ~ none }}"), data("x1"));
        assert_eq!(optimize("{{ [1, 2] + [3] }}"), data("[1, 2, 3]"));
        assert_eq!(optimize("{{ 1..=3 }}"), data("[1, 2, 3]"));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_failing_operation_is_left_for_runtime() {
        let body = optimize("{{ 1 // 0 }}");
        assert!(matches!(
            body.first().map(|n| &n.kind),
            Some(NodeKind::Output(Expr {
                kind: ExprKind::BinOp { .. },
                ..
            }))
        ));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_oversized_repetition_is_left_for_runtime() {
        let body = optimize("{{ 'x' * 9223372036854775807 }}{{ [0] * 9223372036854775807 }}");
        assert_eq!(body.len(), 2);
        for node in &body {
            assert!(matches!(
                &node.kind,
                NodeKind::Output(Expr {
                    kind: ExprKind::BinOp {
                        op: BinOpKind::Mul,
                        ..
                    },
                    ..
                })
            ));
        }
        assert_eq!(optimize("{{ 'ab' * 2 }}"), data("abab"));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_large_range_is_not_materialised() {
        let body = optimize("{% for i in 0..5000 %}{% end %}");
        assert!(matches!(
            body.first().map(|n| &n.kind),
            Some(NodeKind::For {
                iter: Expr {
                    kind: ExprKind::Range { .. },
                    ..
                },
                ..
            })
        ));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_dead_branches() {
        assert_eq!(optimize("{% if false %}a{% elif 1 > 0 %}b{% else %}c{% end %}"), data("b"));
        assert_eq!(optimize("{% if 0 %}a{% end %}z"), data("z"));
        assert_eq!(optimize("{% for x in [] %}{{ x }}{% empty %}none{% end %}"), data("none"));
        assert_eq!(
            optimize("{% match 2 %}{% case 1 %}one{% case 2, 3 %}few{% case _ %}many{% end %}"),
            data("few")
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_dynamic_branches_are_kept() {
        let body = optimize("{% if false %}a{% elif user %}b{% end %}");
        let Some(NodeKind::If { branches, .. }) = body.first().map(|n| &n.kind) else {
            panic!("expected the if to survive");
        };
        assert_eq!(branches.len(), 1);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_branches_holding_blocks_survive() {
        let body = optimize("{% if false %}{% block sidebar %}x{% end %}{% end %}");
        assert_eq!(body.len(), 1);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_autoescape_lowering() {
        let registry = Registry::with_builtins();
        let body = optimize_with("{{ '<b>' }}", &registry, true, false);
        assert_eq!(body, data("&lt;b&gt;"));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_filter_inlining_is_opt_in() {
        let registry = Registry::with_builtins();
        let kept = optimize_with("{{ 'abc' | upper }}", &registry, false, false);
        assert!(matches!(kept.first().map(|n| &n.kind), Some(NodeKind::Output(_))));

        let inlined = optimize_with("{{ ('abc' | upper) ~ '!' }}", &registry, false, true);
        assert_eq!(inlined, data("ABC!"));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_impure_filters_are_never_inlined() {
        let registry = Registry::with_builtins();
        let body = optimize_with("{{ [1, 2, 3] | shuffle }}", &registry, false, true);
        assert!(matches!(body.first().map(|n| &n.kind), Some(NodeKind::Output(_))));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_pipeline_partially_inlined() {
        let registry = Registry::with_builtins();
        let body = optimize_with("{{ ' Hi ' |> trim |> lower |> shuffle }}", &registry, false, true);
        let Some(NodeKind::Output(Expr {
            kind: ExprKind::Pipeline { value, steps },
            ..
        })) = body.first().map(|n| &n.kind)
        else {
            panic!("expected a pipeline");
        };
        assert_eq!(value.as_const(), Some(&Value::from("hi")));
        assert_eq!(steps.len(), 1);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_line_numbers_survive() {
        let body = optimize("a\n\n{% if user %}{{ 1 + 1 }}{% end %}");
        let Some(node) = body.get(1) else {
            panic!("expected if node");
        };
        assert_eq!(node.line, 3);
    }
}
