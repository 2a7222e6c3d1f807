//! Static analysis over a retained syntax tree.
//!
//! Every analyzer here is total: it never fails and, when it cannot be sure,
//! answers `Unknown` instead of guessing. Results are conservative hints for
//! tooling and never feed back into rendering. Tree walks use explicit work
//! stacks so adversarially deep templates cannot exhaust the native stack.

mod cache_scope;
mod dependencies;
mod landmarks;
mod metadata;
mod purity;

use std::collections::{BTreeMap, HashMap};

pub use cache_scope::CacheScope;
pub use landmarks::{Landmark, Role};
pub use metadata::{BlockMetadata, TemplateMetadata};
pub use purity::Purity;

use crate::{
    ast::{Expr, ExprKind, Node, NodeKind, TemplateAst},
    config::{Config, Registry},
    optimizer::for_each_body,
};

/// Computes metadata for every block in `ast`.
pub(crate) fn analyze(ast: &TemplateAst, registry: &Registry, config: &Config) -> TemplateMetadata {
    let dependencies = dependencies::collect(ast, registry);
    let purity = purity::PurityAnalyzer::new(ast, registry);

    let mut blocks = BTreeMap::new();
    for (name, body) in find_blocks(&ast.body) {
        let is_pure = purity.body(body);
        let depends_on = dependencies.blocks.get(name).cloned().unwrap_or_default();
        let scan = landmarks::scan(body);
        let cache_scope = cache_scope::infer(
            is_pure,
            &depends_on,
            &config.page_prefixes,
            &config.site_prefixes,
        );
        blocks.insert(
            name.to_string(),
            BlockMetadata {
                name: name.to_string(),
                emits_output: scan.emits_output,
                inferred_role: landmarks::infer_role(name, &scan.order),
                emits_landmarks: scan.order.into_iter().collect(),
                depends_on,
                is_pure,
                cache_scope,
            },
        );
    }

    log::debug!("analyzed {}: {} block(s)", ast.name, blocks.len());
    TemplateMetadata {
        name: ast.name.clone(),
        extends: ast.parent_name().map(str::to_string),
        blocks,
        top_level_depends_on: dependencies.top_level,
    }
}

/// Every block in document order, nested blocks included.
fn find_blocks(nodes: &[Node]) -> Vec<(&str, &[Node])> {
    let mut found = Vec::new();
    let mut stack: Vec<&Node> = nodes.iter().rev().collect();
    while let Some(node) = stack.pop() {
        if let NodeKind::Block { name, body } = &node.kind {
            found.push((name.as_str(), body.as_slice()));
        }
        let mut children = Vec::new();
        for_each_body(&node.kind, |body| children.extend(body.iter()));
        stack.extend(children.into_iter().rev());
    }
    found
}

/// Every `def` in `nodes` by name, with its node and body. A later
/// definition of the same name replaces an earlier one.
fn collect_defs(nodes: &[Node]) -> HashMap<&str, (&Node, &[Node])> {
    let mut defs = HashMap::new();
    let mut stack: Vec<&Node> = nodes.iter().rev().collect();
    while let Some(node) = stack.pop() {
        if let NodeKind::Def { name, body, .. } = &node.kind {
            defs.insert(name.as_str(), (node, body.as_slice()));
        }
        let mut children = Vec::new();
        for_each_body(&node.kind, |body| children.extend(body.iter()));
        stack.extend(children.into_iter().rev());
    }
    defs
}

/// Calls `f` with every direct sub-expression of `expr`.
fn for_each_child<'e>(expr: &'e Expr, mut f: impl FnMut(&'e Expr)) {
    match &expr.kind {
        ExprKind::Const(_) | ExprKind::Name(_) => {}
        ExprKind::Getattr { value, .. } | ExprKind::OptionalGetattr { value, .. } => f(value),
        ExprKind::Getitem { value, key } | ExprKind::OptionalGetitem { value, key } => {
            f(value);
            f(key);
        }
        ExprKind::Slice {
            value,
            start,
            stop,
            step,
        } => {
            f(value);
            for bound in [start, stop, step].into_iter().flatten() {
                f(bound);
            }
        }
        ExprKind::List(items) | ExprKind::Concat(items) => items.iter().for_each(f),
        ExprKind::Dict(pairs) => {
            for (key, value) in pairs {
                f(key);
                f(value);
            }
        }
        ExprKind::BinOp { left, right, .. }
        | ExprKind::BoolOp { left, right, .. }
        | ExprKind::Compare { left, right, .. }
        | ExprKind::NullCoalesce { left, right } => {
            f(left);
            f(right);
        }
        ExprKind::Range { start, end, .. } => {
            f(start);
            f(end);
        }
        ExprKind::UnaryOp { operand, .. } => f(operand),
        ExprKind::Test { value, args, .. } => {
            f(value);
            args.iter().for_each(f);
        }
        ExprKind::Conditional {
            condition,
            then,
            otherwise,
        } => {
            f(condition);
            f(then);
            if let Some(otherwise) = otherwise {
                f(otherwise);
            }
        }
        ExprKind::Filter { value, filter } => {
            f(value);
            filter.args.iter().for_each(&mut f);
            filter.kwargs.iter().for_each(|(_, arg)| f(arg));
        }
        ExprKind::Pipeline { value, steps } => {
            f(value);
            for step in steps {
                step.args.iter().for_each(&mut f);
                step.kwargs.iter().for_each(|(_, arg)| f(arg));
            }
        }
        ExprKind::Call {
            callee,
            args,
            kwargs,
        } => {
            f(callee);
            args.iter().for_each(&mut f);
            kwargs.iter().for_each(|(_, arg)| f(arg));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{ParseOptions, parse};

    pub(super) fn parse_ast(source: &str) -> TemplateAst {
        parse(source, "test.html", ParseOptions::default())
            .unwrap()
            .ast
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_find_blocks_in_document_order() {
        let ast = parse_ast(
            "{% block a %}{% block b %}{% endblock %}{% endblock %}\
             {% if x %}{% block c %}{% endblock %}{% endif %}",
        );
        let names: Vec<&str> = find_blocks(&ast.body).into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, ["a", "b", "c"]);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_analyze_collects_everything() {
        let ast = parse_ast(
            "{% extends \"base.html\" %}\
             {% block nav %}<nav>{% for p in site.pages %}{{ p.title }}{% end %}</nav>{% endblock %}\
             {% block content %}<main>{{ page.body | upper }}</main>{% endblock %}",
        );
        let metadata = analyze(&ast, &Registry::with_builtins(), &Config::default());
        assert_eq!(metadata.extends.as_deref(), Some("base.html"));

        let nav = &metadata.blocks["nav"];
        assert_eq!(nav.inferred_role, Role::Navigation);
        assert_eq!(nav.is_pure, Purity::Pure);
        assert_eq!(nav.cache_scope, CacheScope::Site);
        assert!(nav.depends_on.contains("site.pages"));

        let content = &metadata.blocks["content"];
        assert_eq!(content.inferred_role, Role::Content);
        assert_eq!(content.cache_scope, CacheScope::Page);
        assert!(content.emits_landmarks.contains(&Landmark::Main));
        assert!(metadata.top_level_depends_on.is_empty());
    }
}
