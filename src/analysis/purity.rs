use std::collections::HashMap;

use super::{collect_defs, for_each_child};
use crate::{
    ast::{Expr, ExprKind, FilterCall, Node, NodeKind, TemplateAst},
    config::Registry,
    optimizer::for_each_body,
};

/// Whether output is a deterministic function of its inputs.
///
/// A three-point lattice ordered `Pure < Unknown < Impure`. Combining two
/// classes always takes the less certain one, so a result can only ever move
/// towards `Impure`.
///
/// ```
/// use kiln::Purity;
///
/// assert_eq!(Purity::Pure.join(Purity::Unknown), Purity::Unknown);
/// assert_eq!(Purity::Impure.join(Purity::Pure), Purity::Impure);
/// ```
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "snake_case")
)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Purity {
    Pure,
    #[default]
    Unknown,
    Impure,
}

impl Purity {
    #[must_use]
    pub fn join(self, other: Self) -> Self {
        self.max(other)
    }
}

/// Purity of node lists, with local `def`s resolved to the purity of their
/// bodies.
pub(crate) struct PurityAnalyzer<'a> {
    registry: &'a Registry,
    defs: HashMap<&'a str, Purity>,
}

impl<'a> PurityAnalyzer<'a> {
    pub(crate) fn new(ast: &'a TemplateAst, registry: &'a Registry) -> Self {
        let bodies: HashMap<&str, &[Node]> = collect_defs(&ast.body)
            .into_iter()
            .map(|(name, (_, body))| (name, body))
            .collect();
        let mut analyzer = Self {
            registry,
            defs: bodies.keys().map(|name| (*name, Purity::Pure)).collect(),
        };

        // Purity only grows, so this settles after at most two rounds per def.
        loop {
            let mut changed = false;
            for (name, body) in &bodies {
                let purity = analyzer.body(body);
                if analyzer.defs.get(name) != Some(&purity) {
                    analyzer.defs.insert(*name, purity);
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        analyzer
    }

    pub(crate) fn body(&self, nodes: &[Node]) -> Purity {
        let mut purity = Purity::Pure;
        let mut stack: Vec<&Node> = nodes.iter().collect();
        while let Some(node) = stack.pop() {
            purity = purity.join(self.node(node));
            if purity == Purity::Impure {
                return purity;
            }
            if !matches!(node.kind, NodeKind::Def { .. }) {
                for_each_body(&node.kind, |body| stack.extend(body.iter()));
            }
        }
        purity
    }

    /// Purity of the node itself, excluding child bodies.
    fn node(&self, node: &Node) -> Purity {
        match &node.kind {
            NodeKind::Data(_)
            | NodeKind::Def { .. }
            | NodeKind::Slot
            | NodeKind::Capture { .. }
            | NodeKind::Block { .. }
            | NodeKind::Break
            | NodeKind::Continue => Purity::Pure,
            NodeKind::Output(expr)
            | NodeKind::Let { value: expr, .. }
            | NodeKind::Set { value: expr, .. }
            | NodeKind::CallBlock { call: expr, .. } => self.expr(expr),
            NodeKind::If { branches, .. } => self.exprs(branches.iter().map(|b| &b.condition)),
            NodeKind::For { iter, filter, .. } => self
                .expr(iter)
                .join(filter.as_ref().map_or(Purity::Pure, |f| self.expr(f))),
            NodeKind::Match { subject, cases } => self
                .expr(subject)
                .join(self.exprs(cases.iter().flat_map(|c| c.patterns.iter()))),
            NodeKind::With { bindings, .. } => self.exprs(bindings.iter().map(|(_, e)| e)),
            NodeKind::Cache { key, ttl, .. } => self
                .expr(key)
                .join(ttl.as_ref().map_or(Purity::Pure, |t| self.expr(t))),
            NodeKind::FilterBlock { filter, .. } => {
                let args = filter.args.iter().chain(filter.kwargs.iter().map(|(_, e)| e));
                self.filter(filter).join(self.exprs(args))
            }
            NodeKind::Include { .. }
            | NodeKind::Import { .. }
            | NodeKind::FromImport { .. }
            | NodeKind::Extends { .. } => Purity::Unknown,
        }
    }

    fn exprs<'e>(&self, exprs: impl Iterator<Item = &'e Expr>) -> Purity {
        exprs.fold(Purity::Pure, |acc, e| acc.join(self.expr(e)))
    }

    pub(crate) fn expr(&self, expr: &Expr) -> Purity {
        let mut purity = Purity::Pure;
        let mut stack = vec![expr];
        while let Some(expr) = stack.pop() {
            let own = match &expr.kind {
                ExprKind::Filter { filter, .. } => self.filter(filter),
                ExprKind::Pipeline { steps, .. } => steps
                    .iter()
                    .fold(Purity::Pure, |acc, step| acc.join(self.filter(step))),
                ExprKind::Test { name, .. } => {
                    if self.registry.tests.contains_key(name)
                        || matches!(name.as_str(), "defined" | "undefined")
                    {
                        Purity::Pure
                    } else {
                        Purity::Unknown
                    }
                }
                ExprKind::Call { callee, .. } => self.call(callee),
                _ => Purity::Pure,
            };
            purity = purity.join(own);
            if purity == Purity::Impure {
                return purity;
            }
            for_each_child(expr, |child| stack.push(child));
        }
        purity
    }

    fn filter(&self, call: &FilterCall) -> Purity {
        self.registry
            .filters
            .get(&call.name)
            .map_or(Purity::Unknown, |entry| entry.purity)
    }

    fn call(&self, callee: &Expr) -> Purity {
        let ExprKind::Name(name) = &callee.kind else {
            return Purity::Unknown;
        };
        if let Some(purity) = self.defs.get(name.as_str()) {
            return *purity;
        }
        self.registry
            .functions
            .get(name)
            .map_or(Purity::Unknown, |entry| entry.purity)
    }
}
