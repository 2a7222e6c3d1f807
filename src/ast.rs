//! Syntax tree produced by the parser and consumed by the optimizer, the
//! compiler and the analysis layer.
//!
//! Every node owns its children; there is no sharing and no cycles. Each node
//! records the source line it started on so diagnostics survive optimization.

use crate::value::Value;

/// Root of a parsed template.
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateAst {
    pub name: String,
    pub body: Vec<Node>,
    /// Block names in source order. Unique within the template.
    pub blocks: Vec<String>,
}

impl TemplateAst {
    /// The parent template expression, if this template uses `extends`.
    pub fn extends(&self) -> Option<&Expr> {
        self.body.iter().find_map(|node| match &node.kind {
            NodeKind::Extends { template } => Some(template),
            _ => None,
        })
    }

    /// Statically known parent name (`{% extends "base.html" %}`).
    pub fn parent_name(&self) -> Option<&str> {
        self.extends().and_then(|expr| match &expr.kind {
            ExprKind::Const(Value::Str(name)) => Some(name.as_ref()),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub kind: NodeKind,
    pub line: usize,
}

impl Node {
    pub const fn new(kind: NodeKind, line: usize) -> Self {
        Self { kind, line }
    }
}

/// Assignment target of `for`, `let` and `set`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Name(String),
    Tuple(Vec<String>),
}

impl Target {
    pub fn names(&self) -> Vec<&str> {
        match self {
            Self::Name(name) => vec![name.as_str()],
            Self::Tuple(names) => names.iter().map(String::as_str).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IfBranch {
    pub condition: Expr,
    pub body: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchCase {
    /// Alternatives compared with `==`. Empty means the `_` wildcard.
    pub patterns: Vec<Expr>,
    pub body: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub default: Option<Expr>,
}

/// `name(args)` as used by filters and pipeline steps.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterCall {
    pub name: String,
    pub args: Vec<Expr>,
    pub kwargs: Vec<(String, Expr)>,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    /// Literal template text.
    Data(String),
    Output(Expr),
    If {
        branches: Vec<IfBranch>,
        else_body: Option<Vec<Node>>,
    },
    For {
        target: Target,
        iter: Expr,
        filter: Option<Expr>,
        body: Vec<Node>,
        empty: Option<Vec<Node>>,
    },
    Match {
        subject: Expr,
        cases: Vec<MatchCase>,
    },
    /// Template-wide binding.
    Let { target: Target, value: Expr },
    /// Binding in the innermost scope.
    Set { target: Target, value: Expr },
    Capture { name: String, body: Vec<Node> },
    With {
        bindings: Vec<(String, Expr)>,
        body: Vec<Node>,
    },
    Def {
        name: String,
        params: Vec<Param>,
        body: Vec<Node>,
    },
    /// Caller-supplied content inside a `def`.
    Slot,
    CallBlock { call: Expr, body: Vec<Node> },
    Include {
        template: Expr,
        ignore_missing: bool,
    },
    Import { template: Expr, alias: String },
    FromImport {
        template: Expr,
        names: Vec<(String, Option<String>)>,
    },
    Extends { template: Expr },
    Block { name: String, body: Vec<Node> },
    Cache {
        key: Expr,
        ttl: Option<Expr>,
        body: Vec<Node>,
    },
    FilterBlock { filter: FilterCall, body: Vec<Node> },
    Break,
    Continue,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub line: usize,
}

impl Expr {
    pub const fn new(kind: ExprKind, line: usize) -> Self {
        Self { kind, line }
    }

    pub const fn as_const(&self) -> Option<&Value> {
        match &self.kind {
            ExprKind::Const(value) => Some(value),
            _ => None,
        }
    }

    pub const fn is_filter_like(&self) -> bool {
        matches!(self.kind, ExprKind::Filter { .. } | ExprKind::Pipeline { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOpKind {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
}

impl BinOpKind {
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::FloorDiv => "//",
            Self::Mod => "%",
            Self::Pow => "**",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOpKind {
    Neg,
    Pos,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BoolOpKind {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Const(Value),
    Name(String),
    Getattr {
        value: Box<Expr>,
        attr: String,
    },
    OptionalGetattr {
        value: Box<Expr>,
        attr: String,
    },
    Getitem {
        value: Box<Expr>,
        key: Box<Expr>,
    },
    OptionalGetitem {
        value: Box<Expr>,
        key: Box<Expr>,
    },
    Slice {
        value: Box<Expr>,
        start: Option<Box<Expr>>,
        stop: Option<Box<Expr>>,
        step: Option<Box<Expr>>,
    },
    List(Vec<Expr>),
    Dict(Vec<(Expr, Expr)>),
    BinOp {
        op: BinOpKind,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    UnaryOp {
        op: UnaryOpKind,
        operand: Box<Expr>,
    },
    BoolOp {
        op: BoolOpKind,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Compare {
        op: CmpOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    /// `value is [not] name(args)`
    Test {
        value: Box<Expr>,
        name: String,
        args: Vec<Expr>,
        negated: bool,
    },
    /// `a ~ b ~ c`
    Concat(Vec<Expr>),
    Range {
        start: Box<Expr>,
        end: Box<Expr>,
        inclusive: bool,
    },
    /// `then if condition else otherwise`
    Conditional {
        condition: Box<Expr>,
        then: Box<Expr>,
        otherwise: Option<Box<Expr>>,
    },
    NullCoalesce {
        left: Box<Expr>,
        right: Box<Expr>,
    },
    /// `value | name(args)`
    Filter {
        value: Box<Expr>,
        filter: FilterCall,
    },
    /// `value |> step |> step`
    Pipeline {
        value: Box<Expr>,
        steps: Vec<FilterCall>,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
        kwargs: Vec<(String, Expr)>,
    },
}
