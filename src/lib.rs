//! A template compiler with static analysis.
//!
//! Source text goes through a lexer, a recursive-descent parser, a
//! semantics-preserving optimizer and a code generator that lowers the tree
//! into closures. The optimized tree can be kept next to the compiled
//! template, where the analysis layer reads it to report the context paths a
//! block depends on, whether its output is deterministic, what structural
//! role it plays and how widely its output may be cached.
//!
//! ```rust
//! use kiln::{CacheScope, Context, Environment, Purity};
//!
//! let env = Environment::new();
//! let template = env
//!     .from_string("{% block nav %}<nav>{{ site.title | upper }}</nav>{% endblock %}")
//!     .unwrap();
//!
//! let mut context = Context::new();
//! context.insert("site", kiln::Value::from_pairs([("title", "kiln")]));
//! assert_eq!(template.render(&context).unwrap(), "<nav>KILN</nav>");
//!
//! let nav = &template.block_metadata()["nav"];
//! assert_eq!(nav.is_pure, Purity::Pure);
//! assert_eq!(nav.cache_scope, CacheScope::Site);
//! assert!(nav.depends_on.contains("site.title"));
//! ```

mod analysis;
mod ast;
mod builtins;
mod compiler;
mod config;
mod environment;
mod error;
mod interface;
mod lexer;
mod optimizer;
mod parser;
mod scope;
mod template;
mod value;

// Public exports.
pub use analysis::{BlockMetadata, CacheScope, Landmark, Purity, Role, TemplateMetadata};
pub use ast::{
    BinOpKind, BoolOpKind, CmpOp, Expr, ExprKind, FilterCall, IfBranch, MatchCase, Node, NodeKind,
    Param, Target, TemplateAst, UnaryOpKind,
};
pub use builtins::Args;
pub use compiler::Macro;
pub use config::{Config, EnvironmentBuilder};
pub use environment::Environment;
pub use error::{
    CompileError, Error, KilnResult, LexError, ParseError, TemplateRuntimeError, UndefinedError,
    Warning,
};
pub use interface::{Context, FileSystemLoader, Loader, MemoryLoader};
pub use template::Template;
pub use value::{Resolved, Undefined, Value, escape_html};
