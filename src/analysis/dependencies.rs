use std::collections::{BTreeMap, BTreeSet, HashMap};

use super::{collect_defs, for_each_child};
use crate::{
    ast::{Expr, ExprKind, Node, NodeKind, TemplateAst},
    config::Registry,
    scope::ScopeStack,
    value::Value,
};

/// Names the runtime provides itself. Never dependencies.
const RUNTIME_NAMES: &[&str] = &["loop", "super", "caller"];

/// Context paths read by a template.
#[derive(Debug, Default)]
pub(crate) struct Dependencies {
    /// Paths read outside of any block.
    pub(crate) top_level: BTreeSet<String>,
    /// Paths read inside each block, including blocks nested in it.
    pub(crate) blocks: BTreeMap<String, BTreeSet<String>>,
}

impl Dependencies {
    fn into_all(self) -> BTreeSet<String> {
        let mut all = self.top_level;
        for paths in self.blocks.into_values() {
            all.extend(paths);
        }
        all
    }
}

/// Context paths a local `def` reads when called, keyed by its name.
type DefPaths<'a> = HashMap<&'a str, BTreeSet<String>>;

enum Work<'a> {
    Node(&'a Node),
    Expr(&'a Expr),
    Push,
    Pop,
    Bind(&'a str),
    BindRoot(&'a str),
    EnterBlock(&'a str),
    ExitBlock,
}

/// Walks `ast` in document order, tracking which names are bound locally.
/// A call to a `def` of this template reads whatever the def's body reads.
pub(crate) fn collect(ast: &TemplateAst, registry: &Registry) -> Dependencies {
    let defs = def_paths(ast, registry);
    walk(ast.body.iter().map(Work::Node).collect(), registry, &defs)
}

/// Free paths of every `def`, iterated to a fixpoint so defs calling each
/// other (or themselves) see each other's reads. Sets only grow and are
/// bounded by the paths written in the template, so this terminates.
fn def_paths<'a>(ast: &'a TemplateAst, registry: &Registry) -> DefPaths<'a> {
    let defs = collect_defs(&ast.body);
    let mut paths: DefPaths<'a> = defs.keys().map(|name| (*name, BTreeSet::new())).collect();
    loop {
        let mut changed = false;
        for (name, (node, _)) in &defs {
            let found = walk(vec![Work::Node(*node)], registry, &paths).into_all();
            if paths.get(name) != Some(&found) {
                paths.insert(*name, found);
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
    paths
}

fn walk<'a>(start: Vec<Work<'a>>, registry: &Registry, defs: &DefPaths<'_>) -> Dependencies {
    let mut walker = Walker {
        registry,
        defs,
        scopes: ScopeStack::new(),
        active_blocks: Vec::new(),
        found: Dependencies::default(),
    };
    let mut work: Vec<Work<'a>> = start.into_iter().rev().collect();
    while let Some(item) = work.pop() {
        match item {
            Work::Node(node) => {
                let mut next = Vec::new();
                walker.node(node, &mut next);
                work.extend(next.into_iter().rev());
            }
            Work::Expr(expr) => {
                let mut next = Vec::new();
                walker.expr(expr, &mut next);
                work.extend(next.into_iter().rev().map(Work::Expr));
            }
            Work::Push => walker.scopes.push(),
            Work::Pop => walker.scopes.pop(),
            Work::Bind(name) => walker.scopes.bind(name),
            Work::BindRoot(name) => walker.scopes.bind_root(name),
            Work::EnterBlock(name) => {
                walker.found.blocks.entry(name.to_string()).or_default();
                walker.active_blocks.push(name);
            }
            Work::ExitBlock => {
                walker.active_blocks.pop();
            }
        }
    }
    walker.found
}

struct Walker<'a, 'r> {
    registry: &'r Registry,
    defs: &'r DefPaths<'r>,
    scopes: ScopeStack,
    active_blocks: Vec<&'a str>,
    found: Dependencies,
}

impl<'a> Walker<'a, '_> {
    /// Queues the work for one node, in evaluation order.
    fn node(&self, node: &'a Node, next: &mut Vec<Work<'a>>) {
        let nodes = |next: &mut Vec<Work<'a>>, body: &'a [Node]| {
            next.extend(body.iter().map(Work::Node));
        };
        match &node.kind {
            NodeKind::Data(_) | NodeKind::Slot | NodeKind::Break | NodeKind::Continue => {}
            NodeKind::Output(expr)
            | NodeKind::Include { template: expr, .. }
            | NodeKind::Extends { template: expr } => {
                next.push(Work::Expr(expr));
            }
            NodeKind::If {
                branches,
                else_body,
            } => {
                for branch in branches {
                    next.push(Work::Expr(&branch.condition));
                    nodes(next, &branch.body);
                }
                if let Some(body) = else_body {
                    nodes(next, body);
                }
            }
            NodeKind::For {
                target,
                iter,
                filter,
                body,
                empty,
            } => {
                next.push(Work::Expr(iter));
                next.push(Work::Push);
                next.extend(target.names().into_iter().map(Work::Bind));
                next.push(Work::Bind("loop"));
                if let Some(filter) = filter {
                    next.push(Work::Expr(filter));
                }
                nodes(next, body);
                next.push(Work::Pop);
                if let Some(body) = empty {
                    nodes(next, body);
                }
            }
            NodeKind::Match { subject, cases } => {
                next.push(Work::Expr(subject));
                for case in cases {
                    next.extend(case.patterns.iter().map(Work::Expr));
                    nodes(next, &case.body);
                }
            }
            NodeKind::Let { target, value } => {
                next.push(Work::Expr(value));
                next.extend(target.names().into_iter().map(Work::BindRoot));
            }
            NodeKind::Set { target, value } => {
                next.push(Work::Expr(value));
                next.extend(target.names().into_iter().map(Work::Bind));
            }
            NodeKind::Capture { name, body } => {
                nodes(next, body);
                next.push(Work::Bind(name));
            }
            NodeKind::With { bindings, body } => {
                next.extend(bindings.iter().map(|(_, expr)| Work::Expr(expr)));
                next.push(Work::Push);
                next.extend(bindings.iter().map(|(name, _)| Work::Bind(name)));
                nodes(next, body);
                next.push(Work::Pop);
            }
            NodeKind::Def { name, params, body } => {
                next.push(Work::Bind(name));
                next.push(Work::Push);
                next.push(Work::Bind(name));
                for param in params {
                    if let Some(default) = &param.default {
                        next.push(Work::Expr(default));
                    }
                    next.push(Work::Bind(&param.name));
                }
                nodes(next, body);
                next.push(Work::Pop);
            }
            NodeKind::CallBlock { call, body } => {
                next.push(Work::Expr(call));
                nodes(next, body);
            }
            NodeKind::Import { template, alias } => {
                next.push(Work::Expr(template));
                next.push(Work::BindRoot(alias));
            }
            NodeKind::FromImport { template, names } => {
                next.push(Work::Expr(template));
                next.extend(
                    names
                        .iter()
                        .map(|(name, alias)| Work::BindRoot(alias.as_deref().unwrap_or(name.as_str()))),
                );
            }
            NodeKind::Block { name, body } => {
                next.push(Work::EnterBlock(name));
                next.push(Work::Push);
                nodes(next, body);
                next.push(Work::Pop);
                next.push(Work::ExitBlock);
            }
            NodeKind::Cache { key, ttl, body } => {
                next.push(Work::Expr(key));
                if let Some(ttl) = ttl {
                    next.push(Work::Expr(ttl));
                }
                nodes(next, body);
            }
            NodeKind::FilterBlock { filter, body } => {
                next.extend(filter.args.iter().map(Work::Expr));
                next.extend(filter.kwargs.iter().map(|(_, arg)| Work::Expr(arg)));
                nodes(next, body);
            }
        }
    }

    /// Records the path `expr` reads, if any, and queues the sub-expressions
    /// that still need visiting.
    fn expr(&mut self, expr: &'a Expr, next: &mut Vec<&'a Expr>) {
        match &expr.kind {
            ExprKind::Name(_)
            | ExprKind::Getattr { .. }
            | ExprKind::OptionalGetattr { .. }
            | ExprKind::Getitem { .. }
            | ExprKind::OptionalGetitem { .. } => {
                if let Some((root, path)) = dotted_path(expr, next) {
                    if !self.is_bound(root) {
                        self.record(path);
                    }
                }
            }
            ExprKind::Call {
                callee,
                args,
                kwargs,
            } => {
                if let ExprKind::Name(name) = &callee.kind {
                    if self.scopes.is_local(name) {
                        let defs = self.defs;
                        for path in defs.get(name.as_str()).into_iter().flatten() {
                            self.record(path.clone());
                        }
                    } else if !self.registry.functions.contains_key(name)
                        && !RUNTIME_NAMES.contains(&name.as_str())
                    {
                        next.push(callee);
                    }
                } else {
                    next.push(callee);
                }
                next.extend(args.iter());
                next.extend(kwargs.iter().map(|(_, arg)| arg));
            }
            _ => for_each_child(expr, |child| next.push(child)),
        }
    }

    fn is_bound(&self, root: &str) -> bool {
        self.scopes.is_local(root) || RUNTIME_NAMES.contains(&root)
    }

    fn record(&mut self, path: String) {
        if self.active_blocks.is_empty() {
            self.found.top_level.insert(path);
            return;
        }
        for block in &self.active_blocks {
            if let Some(paths) = self.found.blocks.get_mut(*block) {
                paths.insert(path.clone());
            }
        }
    }
}

/// The longest static dotted path of an access chain, with its root name.
///
/// A dynamic key ends the path at its base; the key itself is queued so its
/// own reads are recorded. A chain rooted in something other than a name has
/// no path and its root is queued instead.
fn dotted_path<'e>(expr: &'e Expr, next: &mut Vec<&'e Expr>) -> Option<(&'e str, String)> {
    let mut segments: Vec<String> = Vec::new();
    let mut current = expr;
    loop {
        match &current.kind {
            ExprKind::Name(root) => {
                let mut path = root.clone();
                for segment in segments.iter().rev() {
                    path.push('.');
                    path.push_str(segment);
                }
                return Some((root, path));
            }
            ExprKind::Getattr { value, attr } | ExprKind::OptionalGetattr { value, attr } => {
                segments.push(attr.clone());
                current = value;
            }
            ExprKind::Getitem { value, key } | ExprKind::OptionalGetitem { value, key } => {
                match key.as_const() {
                    Some(Value::Str(key)) => segments.push(key.to_string()),
                    Some(Value::Int(index)) => segments.push(index.to_string()),
                    _ => {
                        segments.clear();
                        next.push(key);
                    }
                }
                current = value;
            }
            _ => {
                next.push(current);
                return None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::tests::parse_ast;

    fn deps(source: &str) -> Dependencies {
        collect(&parse_ast(source), &Registry::with_builtins())
    }

    fn top(source: &str) -> Vec<String> {
        deps(source).top_level.into_iter().collect()
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_loop_variables_are_not_dependencies() {
        assert_eq!(
            top("{% for item in items %}{{ item.name }}{{ loop.index }}{% end %}"),
            ["items"]
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_longest_static_path() {
        assert_eq!(
            top("{{ page.meta.title }}{{ site['menu'][0].url }}{{ user?.profile }}"),
            ["page.meta.title", "site.menu.0.url", "user.profile"]
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_dynamic_key_stops_the_path() {
        assert_eq!(
            top("{{ site.pages[page.slug].title }}"),
            ["page.slug", "site.pages"]
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_bindings_are_scoped() {
        assert_eq!(
            top("{% with t = page.title %}{{ t }}{% end %}{{ t }}"),
            ["page.title", "t"]
        );
        assert_eq!(top("{% let x = a %}{{ x.y }}"), ["a"]);
        assert_eq!(top("{{ x }}{% let x = 1 %}"), ["x"]);
        assert_eq!(top("{% capture c %}{{ body }}{% end %}{{ c }}"), ["body"]);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_macros_and_globals() {
        assert_eq!(
            top("{% def card(p, size=default_size) %}{{ p.title }}{{ theme.color }}{% end %}\
                 {{ card(page) }}{{ range(3) }}{{ len(tags) }}{{ helper(x) }}"),
            ["default_size", "helper", "page", "tags", "theme.color", "x"]
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_blocks_collect_their_own_dependencies() {
        let found = deps(
            "{{ title }}{% block outer %}{{ a }}{% block inner %}{{ b }}{% endblock %}{% endblock %}\
             {% block empty %}static{% endblock %}",
        );
        assert_eq!(found.top_level.into_iter().collect::<Vec<_>>(), ["title"]);
        assert_eq!(found.blocks["outer"].iter().collect::<Vec<_>>(), ["a", "b"]);
        assert_eq!(found.blocks["inner"].iter().collect::<Vec<_>>(), ["b"]);
        assert!(found.blocks["empty"].is_empty());
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_blocks_inherit_reads_of_called_defs() {
        let found = deps(
            "{% def card() %}{{ page.title }}{% end %}\
             {% def row(n) %}{% if n %}{{ row(n - 1) }}{% endif %}{{ card() }}{{ site.name }}{% end %}\
             {% block b %}{{ card() }}{% endblock %}\
             {% block r %}{{ row(3) }}{% endblock %}",
        );
        assert_eq!(found.blocks["b"].iter().collect::<Vec<_>>(), ["page.title"]);
        assert_eq!(
            found.blocks["r"].iter().collect::<Vec<_>>(),
            ["page.title", "site.name"]
        );
    }

    #[test]
    #[ntest::timeout(500)]
    fn test_deep_nesting_does_not_recurse() {
        let depth = 100;
        let source = format!(
            "{}{{{{ deep }}}}{}",
            "{% if x %}".repeat(depth),
            "{% endif %}".repeat(depth)
        );
        let ast = crate::parser::parse(
            &source,
            "deep.html",
            crate::parser::ParseOptions {
                trim_blocks: false,
                max_nesting_depth: 1000,
            },
        )
        .unwrap()
        .ast;
        let found = collect(&ast, &Registry::with_builtins());
        assert_eq!(found.top_level.into_iter().collect::<Vec<_>>(), ["deep", "x"]);
    }
}
