//! Recursive-descent parser.
//!
//! Statements are parsed one function per construct, with an explicit stack
//! of open constructs so a mismatched closer can name what it was expected to
//! close. Expressions use the precedence table below, loosest first:
//!
//! | Level | Operators | Associativity |
//! |---|---|---|
//! | 1 | `a if cond else b` | right |
//! | 2 | `??` | right |
//! | 3 | `\|`, `\|>` | left |
//! | 4 | `or` | left |
//! | 5 | `and` | left |
//! | 6 | `not` | prefix |
//! | 7 | `== != < <= > >= in not in`, `is [not] test` | none |
//! | 8 | `~` | left |
//! | 9 | `..`, `..=` | none |
//! | 10 | `+ -` | left |
//! | 11 | `* / // %` | left |
//! | 12 | unary `- +` | prefix |
//! | 13 | `**` | right |
//! | 14 | `.x ?.x [k] ?[k] [a:b:c] f()` | postfix |
//!
//! So `a ?? b | f` is `a ?? (b | f)`. That shape is accepted but produces a
//! [`Warning`], since `a | default(b) | f` is almost always what was meant.

use crate::{
    ast::{
        BinOpKind, BoolOpKind, CmpOp, Expr, ExprKind, FilterCall, IfBranch, MatchCase, Node,
        NodeKind, Param, Target, TemplateAst, UnaryOpKind,
    },
    error::{KilnResult, ParseError, Warning, closest_match, snippet},
    lexer::{Token, TokenKind, tokenize},
    value::Value,
};

type ParseResult<T> = Result<T, ParseError>;

const KNOWN_TAGS: &[&str] = &[
    "if", "for", "match", "let", "set", "capture", "with", "def", "slot", "call", "include",
    "import", "from", "extends", "block", "cache", "filter", "break", "continue", "raw",
];

/// Clause keywords that are only valid directly inside a specific construct.
const CLAUSES: &[&str] = &["elif", "else", "empty", "case"];

#[derive(Debug, Clone, Copy)]
pub(crate) struct ParseOptions {
    pub(crate) trim_blocks: bool,
    pub(crate) max_nesting_depth: usize,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            trim_blocks: false,
            max_nesting_depth: 128,
        }
    }
}

#[derive(Debug)]
pub(crate) struct ParseOutput {
    pub(crate) ast: TemplateAst,
    pub(crate) warnings: Vec<Warning>,
}

#[derive(Debug, Clone, Copy)]
struct OpenConstruct {
    name: &'static str,
    line: usize,
}

struct Parser<'a> {
    source: &'a str,
    template: &'a str,
    tokens: Vec<Token>,
    pos: usize,
    /// Byte offset of each line start, for slicing source text in hints.
    line_starts: Vec<usize>,
    depth: usize,
    max_depth: usize,
    open: Vec<OpenConstruct>,
    blocks: Vec<String>,
    seen_extends: bool,
    loop_depth: usize,
    def_depth: usize,
    warnings: Vec<Warning>,
    /// Returned by `peek` once the cursor runs past the stream.
    eof: Token,
}

impl<'a> Parser<'a> {
    fn new(source: &'a str, template: &'a str, tokens: Vec<Token>, max_depth: usize) -> Self {
        let line_starts = std::iter::once(0)
            .chain(source.match_indices('\n').map(|(i, _)| i.saturating_add(1)))
            .collect();
        let eof = tokens.last().cloned().unwrap_or(Token {
            kind: TokenKind::Eof,
            line: 1,
            column: 1,
        });
        Self {
            source,
            template,
            tokens,
            pos: 0,
            line_starts,
            depth: 0,
            max_depth,
            open: Vec::new(),
            blocks: Vec::new(),
            seen_extends: false,
            loop_depth: 0,
            def_depth: 0,
            warnings: Vec::new(),
            eof,
        }
    }

    fn error_at(&self, token: &Token, message: String, suggestion: Option<String>) -> ParseError {
        ParseError {
            template: self.template.to_string(),
            line: token.line,
            column: token.column,
            message,
            snippet: snippet(self.source, token.line, token.column),
            suggestion,
        }
    }

    fn make_error(&self, message: String) -> ParseError {
        self.error_at(self.peek(), message, None)
    }

    fn peek(&self) -> &Token {
        self.tokens.get(self.pos).unwrap_or(&self.eof)
    }

    fn previous(&self) -> &Token {
        self.tokens.get(self.pos.saturating_sub(1)).unwrap_or(self.peek())
    }

    fn peek_kind(&self) -> &TokenKind {
        &self.peek().kind
    }

    fn peek_kind_at(&self, offset: usize) -> Option<&TokenKind> {
        self.tokens.get(self.pos.saturating_add(offset)).map(|t| &t.kind)
    }

    fn next(&mut self) -> Token {
        let token = self.peek().clone();
        if token.kind != TokenKind::Eof {
            self.pos = self.pos.saturating_add(1);
        }
        token
    }

    fn at(&self, kind: &TokenKind) -> bool {
        self.peek_kind() == kind
    }

    fn at_name(&self, word: &str) -> bool {
        matches!(self.peek_kind(), TokenKind::Name(name) if name == word)
    }

    fn consume(&mut self, kind: &TokenKind) -> bool {
        if self.at(kind) {
            self.next();
            true
        } else {
            false
        }
    }

    fn consume_name(&mut self, word: &str) -> bool {
        if self.at_name(word) {
            self.next();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &TokenKind) -> ParseResult<Token> {
        if self.at(kind) {
            Ok(self.next())
        } else {
            Err(self.make_error(format!(
                "expected {}, found {}",
                kind.describe(),
                self.peek_kind().describe()
            )))
        }
    }

    fn expect_identifier(&mut self) -> ParseResult<String> {
        match self.peek_kind() {
            TokenKind::Name(name) => {
                let name = name.clone();
                self.next();
                Ok(name)
            }
            other => Err(self.make_error(format!("expected identifier, found {}", other.describe()))),
        }
    }

    /// Byte offset of the token at `index` in the source.
    fn offset_of(&self, index: usize) -> usize {
        self.tokens.get(index).map_or(self.source.len(), |token| {
            let line_start = self
                .line_starts
                .get(token.line.saturating_sub(1))
                .copied()
                .unwrap_or(0);
            line_start.saturating_add(token.column.saturating_sub(1))
        })
    }

    /// Source text spanning tokens `start..end`, trimmed.
    fn source_between(&self, start: usize, end: usize) -> &'a str {
        let from = self.offset_of(start);
        let to = self.offset_of(end).max(from);
        self.source.get(from..to).map_or("", str::trim)
    }

    /// Index of the first token at or after the cursor matching `stop`.
    fn find_forward(&self, stop: impl Fn(&TokenKind) -> bool) -> usize {
        self.tokens
            .iter()
            .enumerate()
            .skip(self.pos)
            .find(|(_, t)| stop(&t.kind) || t.kind == TokenKind::Eof)
            .map_or(self.tokens.len().saturating_sub(1), |(i, _)| i)
    }

    /// Runs `f` one nesting level deeper, failing past the configured maximum.
    fn nested<T>(&mut self, f: impl FnOnce(&mut Self) -> ParseResult<T>) -> ParseResult<T> {
        self.link()?;
        let result = f(self);
        self.depth = self.depth.saturating_sub(1);
        result
    }

    /// Parses a left-associative chain. Each link wraps everything parsed
    /// before it, so every [`Self::link`] inside `f` counts as one more level
    /// until the chain ends.
    fn chain<T>(&mut self, f: impl FnOnce(&mut Self) -> ParseResult<T>) -> ParseResult<T> {
        let depth = self.depth;
        let result = f(self);
        self.depth = depth;
        result
    }

    fn link(&mut self) -> ParseResult<()> {
        if self.depth >= self.max_depth {
            return Err(self.make_error(format!(
                "template nesting exceeds the maximum depth of {}",
                self.max_depth
            )));
        }
        self.depth = self.depth.saturating_add(1);
        Ok(())
    }

    fn warn(&mut self, line: usize, message: String) {
        log::warn!("{}:{}: {}", self.template, line, message);
        self.warnings.push(Warning {
            template: self.template.to_string(),
            line,
            message,
        });
    }

    fn parse_template(mut self) -> ParseResult<ParseOutput> {
        let (body, _) = self.parse_nodes(None, &[])?;
        Ok(ParseOutput {
            ast: TemplateAst {
                name: self.template.to_string(),
                body,
                blocks: self.blocks,
            },
            warnings: self.warnings,
        })
    }

    /// Parses nodes until a tag whose keyword closes `construct` (or is one of
    /// `clauses`). The stopping keyword has been consumed on return; the rest
    /// of its tag has not.
    fn parse_nodes(
        &mut self,
        construct: Option<&'static str>,
        clauses: &[&str],
    ) -> ParseResult<(Vec<Node>, Option<String>)> {
        let mut nodes = Vec::new();
        loop {
            let token = self.peek().clone();
            match &token.kind {
                TokenKind::Eof => {
                    return match self.open.last() {
                        Some(open) if construct.is_some() => Err(self.error_at(
                            &token,
                            format!(
                                "unexpected end of template: expected closer for '{}' opened at line {}",
                                open.name, open.line
                            ),
                            Some("{% end %}".to_string()),
                        )),
                        _ => Ok((nodes, None)),
                    };
                }
                TokenKind::Data(text) => {
                    nodes.push(Node::new(NodeKind::Data(text.clone()), token.line));
                    self.next();
                }
                TokenKind::VariableBegin => {
                    self.next();
                    let expr = self.parse_expression()?;
                    self.expect(&TokenKind::VariableEnd)?;
                    nodes.push(Node::new(NodeKind::Output(expr), token.line));
                }
                TokenKind::BlockBegin => {
                    let Some(TokenKind::Name(word)) = self.peek_kind_at(1).cloned() else {
                        self.next();
                        return Err(self.make_error(format!(
                            "expected tag name, found {}",
                            self.peek_kind().describe()
                        )));
                    };
                    let closes = construct.is_some_and(|c| {
                        word == "end" || word.strip_prefix("end") == Some(c)
                    });
                    if closes || clauses.contains(&word.as_str()) {
                        self.next();
                        self.next();
                        return Ok((nodes, Some(word)));
                    }
                    if word.starts_with("end") || CLAUSES.contains(&word.as_str()) {
                        return Err(self.mismatched_closer(&word));
                    }
                    self.next();
                    self.next();
                    let node = self.nested(|p| p.parse_statement(&word, token.line))?;
                    nodes.extend(node);
                }
                other => {
                    return Err(self.make_error(format!("unexpected {}", other.describe())));
                }
            }
        }
    }

    fn mismatched_closer(&self, found: &str) -> ParseError {
        let token = self.tokens.get(self.pos.saturating_add(1)).unwrap_or(self.peek());
        match self.open.last() {
            Some(open) => self.error_at(
                token,
                format!(
                    "expected closer for '{}' (opened at line {}), found '{}'",
                    open.name, open.line, found
                ),
                Some(format!("{{% end{} %}}", open.name)),
            ),
            None => self.error_at(
                token,
                format!("unexpected '{found}': no block is open"),
                None,
            ),
        }
    }

    /// Consumes the remainder of a closing tag.
    fn finish_closer(&mut self) -> ParseResult<()> {
        self.expect(&TokenKind::BlockEnd)?;
        Ok(())
    }

    fn with_open<T>(
        &mut self,
        name: &'static str,
        line: usize,
        f: impl FnOnce(&mut Self) -> ParseResult<T>,
    ) -> ParseResult<T> {
        self.open.push(OpenConstruct { name, line });
        let result = f(self)?;
        self.open.pop();
        Ok(result)
    }

    /// Parses the tag named `word`; `{% word` has already been consumed.
    /// Returns `None` for tags that produce no node.
    fn parse_statement(&mut self, word: &str, line: usize) -> ParseResult<Option<Node>> {
        let kind = match word {
            "if" => self.with_open("if", line, Self::parse_if)?,
            "for" => self.with_open("for", line, Self::parse_for)?,
            "match" => self.with_open("match", line, Self::parse_match)?,
            "let" | "set" => {
                let target = self.parse_target()?;
                self.expect(&TokenKind::Assign)?;
                let value = self.parse_expression()?;
                self.expect(&TokenKind::BlockEnd)?;
                if word == "let" {
                    NodeKind::Let { target, value }
                } else {
                    NodeKind::Set { target, value }
                }
            }
            "capture" => self.with_open("capture", line, |p| {
                let name = p.expect_identifier()?;
                p.expect(&TokenKind::BlockEnd)?;
                let body = p.parse_simple_body("capture")?;
                Ok(NodeKind::Capture { name, body })
            })?,
            "with" => self.with_open("with", line, |p| {
                let bindings = p.parse_bindings()?;
                p.expect(&TokenKind::BlockEnd)?;
                let body = p.parse_simple_body("with")?;
                Ok(NodeKind::With { bindings, body })
            })?,
            "def" => self.with_open("def", line, Self::parse_def)?,
            "slot" => {
                if self.def_depth == 0 {
                    return Err(self.make_error("'slot' is only valid inside a 'def'".to_string()));
                }
                self.expect(&TokenKind::BlockEnd)?;
                NodeKind::Slot
            }
            "call" => self.with_open("call", line, |p| {
                let call = p.parse_postfix()?;
                if !matches!(call.kind, ExprKind::Call { .. }) {
                    return Err(p.make_error("expected a macro call after 'call'".to_string()));
                }
                p.expect(&TokenKind::BlockEnd)?;
                let body = p.parse_simple_body("call")?;
                Ok(NodeKind::CallBlock { call, body })
            })?,
            "include" => self.parse_include()?,
            "import" => {
                let template = self.parse_expression()?;
                if !self.consume_name("as") {
                    return Err(self.make_error(format!(
                        "expected 'as', found {}",
                        self.peek_kind().describe()
                    )));
                }
                let alias = self.expect_identifier()?;
                self.expect(&TokenKind::BlockEnd)?;
                NodeKind::Import { template, alias }
            }
            "from" => self.parse_from_import()?,
            "extends" => {
                if self.seen_extends {
                    return Err(self.make_error("a template may only extend one parent".to_string()));
                }
                self.seen_extends = true;
                let template = self.parse_expression()?;
                self.expect(&TokenKind::BlockEnd)?;
                NodeKind::Extends { template }
            }
            "block" => self.parse_block(line)?,
            "cache" => self.with_open("cache", line, |p| {
                let key = p.parse_coalesce()?;
                let ttl = if p.consume_name("ttl") {
                    p.expect(&TokenKind::Assign)?;
                    Some(p.parse_coalesce()?)
                } else {
                    None
                };
                p.expect(&TokenKind::BlockEnd)?;
                let body = p.parse_simple_body("cache")?;
                Ok(NodeKind::Cache { key, ttl, body })
            })?,
            "filter" => self.with_open("filter", line, |p| {
                let filter = p.parse_filter_call()?;
                p.expect(&TokenKind::BlockEnd)?;
                let body = p.parse_simple_body("filter")?;
                Ok(NodeKind::FilterBlock { filter, body })
            })?,
            "break" | "continue" => {
                if self.loop_depth == 0 {
                    return Err(self.make_error(format!("'{word}' is only valid inside a 'for' loop")));
                }
                self.expect(&TokenKind::BlockEnd)?;
                if word == "break" {
                    NodeKind::Break
                } else {
                    NodeKind::Continue
                }
            }
            "unless" => {
                let start = self.pos;
                let end = self.find_forward(|k| *k == TokenKind::BlockEnd);
                let condition = self.source_between(start, end);
                return Err(self.error_at(
                    self.previous(),
                    "unknown tag 'unless'".to_string(),
                    Some(format!("{{% if not ({condition}) %}}")),
                ));
            }
            other => {
                let suggestion =
                    closest_match(other, KNOWN_TAGS.iter().copied()).map(|tag| format!("{{% {tag} %}}"));
                return Err(self.error_at(
                    self.previous(),
                    format!("unknown tag '{other}'"),
                    suggestion,
                ));
            }
        };
        Ok(Some(Node::new(kind, line)))
    }

    /// Body of a construct with no intermediate clauses.
    fn parse_simple_body(&mut self, construct: &'static str) -> ParseResult<Vec<Node>> {
        let (body, _) = self.parse_nodes(Some(construct), &[])?;
        self.finish_closer()?;
        Ok(body)
    }

    fn parse_if(&mut self) -> ParseResult<NodeKind> {
        let condition = self.parse_expression()?;
        self.expect(&TokenKind::BlockEnd)?;
        let mut branches = Vec::new();
        let mut condition = Some(condition);
        loop {
            let (body, closer) = self.parse_nodes(Some("if"), &["elif", "else"])?;
            if let Some(condition) = condition.take() {
                branches.push(IfBranch { condition, body });
            }
            match closer.as_deref() {
                Some("elif") => {
                    condition = Some(self.parse_expression()?);
                    self.expect(&TokenKind::BlockEnd)?;
                }
                Some("else") => {
                    if self.at_name("if") {
                        let start = self.pos.saturating_add(1);
                        let end = self.find_forward(|k| *k == TokenKind::BlockEnd);
                        let text = self.source_between(start, end).to_string();
                        return Err(self.error_at(
                            &self.peek().clone(),
                            "'else if' is not supported".to_string(),
                            Some(format!("{{% elif {text} %}}")),
                        ));
                    }
                    self.expect(&TokenKind::BlockEnd)?;
                    let else_body = self.parse_simple_body("if")?;
                    return Ok(NodeKind::If {
                        branches,
                        else_body: Some(else_body),
                    });
                }
                _ => {
                    self.finish_closer()?;
                    return Ok(NodeKind::If {
                        branches,
                        else_body: None,
                    });
                }
            }
        }
    }

    fn parse_for(&mut self) -> ParseResult<NodeKind> {
        let target = self.parse_target()?;
        if !self.consume_name("in") {
            return Err(self.make_error(format!(
                "expected 'in', found {}",
                self.peek_kind().describe()
            )));
        }
        let iter = self.parse_coalesce()?;
        let filter = if self.consume_name("if") {
            Some(self.parse_coalesce()?)
        } else {
            None
        };
        self.expect(&TokenKind::BlockEnd)?;

        self.loop_depth = self.loop_depth.saturating_add(1);
        let parsed = self.parse_nodes(Some("for"), &["empty", "else"]);
        self.loop_depth = self.loop_depth.saturating_sub(1);
        let (body, closer) = parsed?;

        let empty = match closer.as_deref() {
            Some("empty" | "else") => {
                self.expect(&TokenKind::BlockEnd)?;
                Some(self.parse_simple_body("for")?)
            }
            _ => {
                self.finish_closer()?;
                None
            }
        };
        Ok(NodeKind::For {
            target,
            iter,
            filter,
            body,
            empty,
        })
    }

    fn parse_match(&mut self) -> ParseResult<NodeKind> {
        let subject = self.parse_expression()?;
        self.expect(&TokenKind::BlockEnd)?;
        let (leading, mut closer) = self.parse_nodes(Some("match"), &["case"])?;
        let stray = leading.iter().find(|node| match &node.kind {
            NodeKind::Data(text) => !text.trim().is_empty(),
            _ => true,
        });
        if let Some(node) = stray {
            let line = node.line;
            return Err(ParseError {
                template: self.template.to_string(),
                line,
                column: 1,
                message: "only '{% case %}' arms may appear directly inside 'match'".to_string(),
                snippet: snippet(self.source, line, 1),
                suggestion: None,
            });
        }

        let mut cases = Vec::new();
        while closer.as_deref() == Some("case") {
            let patterns = if self.consume_name("_") {
                Vec::new()
            } else {
                let mut patterns = vec![self.parse_coalesce()?];
                while self.consume(&TokenKind::Comma) {
                    patterns.push(self.parse_coalesce()?);
                }
                patterns
            };
            self.expect(&TokenKind::BlockEnd)?;
            let (body, next) = self.parse_nodes(Some("match"), &["case"])?;
            cases.push(MatchCase { patterns, body });
            closer = next;
        }
        self.finish_closer()?;
        Ok(NodeKind::Match { subject, cases })
    }

    fn parse_def(&mut self) -> ParseResult<NodeKind> {
        let name = self.expect_identifier()?;
        let mut params = Vec::new();
        self.expect(&TokenKind::LParen)?;
        while !self.at(&TokenKind::RParen) {
            let param = self.expect_identifier()?;
            let default = if self.consume(&TokenKind::Assign) {
                Some(self.parse_expression()?)
            } else {
                None
            };
            params.push(Param {
                name: param,
                default,
            });
            if !self.consume(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(&TokenKind::RParen)?;
        self.expect(&TokenKind::BlockEnd)?;

        let saved_loop_depth = std::mem::take(&mut self.loop_depth);
        self.def_depth = self.def_depth.saturating_add(1);
        let body = self.parse_simple_body("def");
        self.def_depth = self.def_depth.saturating_sub(1);
        self.loop_depth = saved_loop_depth;
        Ok(NodeKind::Def {
            name,
            params,
            body: body?,
        })
    }

    fn parse_include(&mut self) -> ParseResult<NodeKind> {
        let template_start = self.pos;
        let template = self.parse_expression()?;
        let template_end = self.pos;

        if self.at_name("with") {
            let with_token = self.next();
            let mut rendered = Vec::new();
            loop {
                let name = self.expect_identifier()?;
                self.expect(&TokenKind::Assign)?;
                let start = self.pos;
                self.parse_expression()?;
                rendered.push(format!("{name} = {}", self.source_between(start, self.pos)));
                if !self.consume(&TokenKind::Comma) {
                    break;
                }
            }
            let template_text = self.source_between(template_start, template_end);
            return Err(self.error_at(
                &with_token,
                "'include' does not accept inline bindings".to_string(),
                Some(format!(
                    "{{% with {} %}}{{% include {template_text} %}}{{% end %}}",
                    rendered.join(", ")
                )),
            ));
        }

        let ignore_missing = if self.consume_name("ignore") {
            if !self.consume_name("missing") {
                return Err(self.make_error(format!(
                    "expected 'missing', found {}",
                    self.peek_kind().describe()
                )));
            }
            true
        } else {
            false
        };
        self.expect(&TokenKind::BlockEnd)?;
        Ok(NodeKind::Include {
            template,
            ignore_missing,
        })
    }

    fn parse_from_import(&mut self) -> ParseResult<NodeKind> {
        let template = self.parse_expression()?;
        if !self.consume_name("import") {
            return Err(self.make_error(format!(
                "expected 'import', found {}",
                self.peek_kind().describe()
            )));
        }
        let mut names = Vec::new();
        loop {
            let name = self.expect_identifier()?;
            let alias = if self.consume_name("as") {
                Some(self.expect_identifier()?)
            } else {
                None
            };
            names.push((name, alias));
            if !self.consume(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(&TokenKind::BlockEnd)?;
        Ok(NodeKind::FromImport { template, names })
    }

    fn parse_block(&mut self, line: usize) -> ParseResult<NodeKind> {
        let name_token = self.peek().clone();
        let name = self.expect_identifier()?;
        if self.blocks.contains(&name) {
            return Err(self.error_at(
                &name_token,
                format!("block '{name}' is defined more than once"),
                None,
            ));
        }
        self.blocks.push(name.clone());
        self.expect(&TokenKind::BlockEnd)?;

        let body = self.with_open("block", line, |p| {
            let (body, _) = p.parse_nodes(Some("block"), &[])?;
            if let TokenKind::Name(closing) = p.peek_kind().clone() {
                if closing != name {
                    return Err(p.make_error(format!(
                        "block '{name}' closed with the name '{closing}'"
                    )));
                }
                p.next();
            }
            p.finish_closer()?;
            Ok(body)
        })?;
        Ok(NodeKind::Block { name, body })
    }

    fn parse_target(&mut self) -> ParseResult<Target> {
        let parenthesized = self.consume(&TokenKind::LParen);
        let first = self.expect_identifier()?;
        let mut names = vec![first];
        while self.consume(&TokenKind::Comma) {
            names.push(self.expect_identifier()?);
        }
        if parenthesized {
            self.expect(&TokenKind::RParen)?;
        }
        Ok(if names.len() == 1 {
            Target::Name(names.remove(0))
        } else {
            Target::Tuple(names)
        })
    }

    fn parse_bindings(&mut self) -> ParseResult<Vec<(String, Expr)>> {
        let mut bindings = Vec::new();
        loop {
            let name = self.expect_identifier()?;
            self.expect(&TokenKind::Assign)?;
            bindings.push((name, self.parse_expression()?));
            if !self.consume(&TokenKind::Comma) {
                return Ok(bindings);
            }
        }
    }

    pub(crate) fn parse_expression(&mut self) -> ParseResult<Expr> {
        self.nested(Self::parse_ternary)
    }

    fn parse_ternary(&mut self) -> ParseResult<Expr> {
        let then = self.parse_coalesce()?;
        if !self.at_name("if") {
            return Ok(then);
        }
        let line = self.next().line;
        let condition = self.parse_coalesce()?;
        let otherwise = if self.consume_name("else") {
            Some(Box::new(self.parse_expression()?))
        } else {
            None
        };
        Ok(Expr::new(
            ExprKind::Conditional {
                condition: Box::new(condition),
                then: Box::new(then),
                otherwise,
            },
            line,
        ))
    }

    fn parse_coalesce(&mut self) -> ParseResult<Expr> {
        let left = self.parse_pipe()?;
        if !self.at(&TokenKind::Coalesce) {
            return Ok(left);
        }
        let line = self.next().line;
        let right = self.nested(Self::parse_coalesce)?;
        if right.is_filter_like() {
            self.warn(
                line,
                "`a ?? b | f` applies the filter to `b` only; write `a | default(b) | f` to filter the result"
                    .to_string(),
            );
        }
        Ok(Expr::new(
            ExprKind::NullCoalesce {
                left: Box::new(left),
                right: Box::new(right),
            },
            line,
        ))
    }

    fn parse_pipe(&mut self) -> ParseResult<Expr> {
        self.chain(|p| {
            let mut expr = p.parse_or()?;
            loop {
                if p.consume(&TokenKind::Pipe) {
                    p.link()?;
                    let filter = p.parse_filter_call()?;
                    let line = filter.line;
                    expr = Expr::new(
                        ExprKind::Filter {
                            value: Box::new(expr),
                            filter,
                        },
                        line,
                    );
                } else if p.consume(&TokenKind::PipeForward) {
                    p.link()?;
                    let step = p.parse_filter_call()?;
                    expr = match expr.kind {
                        ExprKind::Pipeline { value, mut steps } => {
                            steps.push(step);
                            Expr::new(ExprKind::Pipeline { value, steps }, expr.line)
                        }
                        kind => {
                            let line = step.line;
                            Expr::new(
                                ExprKind::Pipeline {
                                    value: Box::new(Expr::new(kind, expr.line)),
                                    steps: vec![step],
                                },
                                line,
                            )
                        }
                    };
                } else {
                    return Ok(expr);
                }
            }
        })
    }

    fn parse_filter_call(&mut self) -> ParseResult<FilterCall> {
        let line = self.peek().line;
        let name = self.expect_identifier()?;
        if self.at(&TokenKind::Colon) {
            let colon = self.next();
            let start = self.pos;
            let end = self.find_forward(|k| {
                matches!(
                    k,
                    TokenKind::Pipe
                        | TokenKind::PipeForward
                        | TokenKind::VariableEnd
                        | TokenKind::BlockEnd
                )
            });
            let args = self.source_between(start, end).to_string();
            return Err(self.error_at(
                &colon,
                "filter arguments are passed in parentheses, not after ':'".to_string(),
                Some(format!("{name}({args})")),
            ));
        }
        let (args, kwargs) = if self.consume(&TokenKind::LParen) {
            self.parse_call_args()?
        } else {
            (Vec::new(), Vec::new())
        };
        Ok(FilterCall {
            name,
            args,
            kwargs,
            line,
        })
    }

    /// Arguments after an opening `(`, through the closing `)`.
    fn parse_call_args(&mut self) -> ParseResult<(Vec<Expr>, Vec<(String, Expr)>)> {
        let mut args = Vec::new();
        let mut kwargs = Vec::new();
        while !self.at(&TokenKind::RParen) {
            let is_keyword = matches!(self.peek_kind(), TokenKind::Name(_))
                && self.peek_kind_at(1) == Some(&TokenKind::Assign);
            if is_keyword {
                let name = self.expect_identifier()?;
                self.next();
                kwargs.push((name, self.parse_expression()?));
            } else {
                if !kwargs.is_empty() {
                    return Err(self.make_error(
                        "positional argument follows keyword argument".to_string(),
                    ));
                }
                args.push(self.parse_expression()?);
            }
            if !self.consume(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(&TokenKind::RParen)?;
        Ok((args, kwargs))
    }

    fn parse_or(&mut self) -> ParseResult<Expr> {
        self.chain(|p| {
            let mut left = p.parse_and()?;
            while p.at_name("or") {
                p.link()?;
                let line = p.next().line;
                let right = p.parse_and()?;
                left = Expr::new(
                    ExprKind::BoolOp {
                        op: BoolOpKind::Or,
                        left: Box::new(left),
                        right: Box::new(right),
                    },
                    line,
                );
            }
            Ok(left)
        })
    }

    fn parse_and(&mut self) -> ParseResult<Expr> {
        self.chain(|p| {
            let mut left = p.parse_not()?;
            while p.at_name("and") {
                p.link()?;
                let line = p.next().line;
                let right = p.parse_not()?;
                left = Expr::new(
                    ExprKind::BoolOp {
                        op: BoolOpKind::And,
                        left: Box::new(left),
                        right: Box::new(right),
                    },
                    line,
                );
            }
            Ok(left)
        })
    }

    fn parse_not(&mut self) -> ParseResult<Expr> {
        if !self.at_name("not") {
            return self.parse_compare();
        }
        let line = self.next().line;
        let operand = self.nested(Self::parse_not)?;
        Ok(Expr::new(
            ExprKind::UnaryOp {
                op: UnaryOpKind::Not,
                operand: Box::new(operand),
            },
            line,
        ))
    }

    fn parse_compare(&mut self) -> ParseResult<Expr> {
        let left = self.parse_concat()?;
        let line = self.peek().line;
        let op = match self.peek_kind().clone() {
            TokenKind::EqEq => Some(CmpOp::Eq),
            TokenKind::NotEq => Some(CmpOp::Ne),
            TokenKind::Lt => Some(CmpOp::Lt),
            TokenKind::LtEq => Some(CmpOp::Le),
            TokenKind::Gt => Some(CmpOp::Gt),
            TokenKind::GtEq => Some(CmpOp::Ge),
            TokenKind::Name(word) if word == "in" => Some(CmpOp::In),
            TokenKind::Name(word)
                if word == "not"
                    && matches!(self.peek_kind_at(1), Some(TokenKind::Name(next)) if next == "in") =>
            {
                self.next();
                Some(CmpOp::NotIn)
            }
            TokenKind::Name(word) if word == "is" => {
                self.next();
                return self.parse_test(left, line);
            }
            _ => None,
        };
        let Some(op) = op else {
            return Ok(left);
        };
        self.next();
        let right = self.parse_concat()?;
        Ok(Expr::new(
            ExprKind::Compare {
                op,
                left: Box::new(left),
                right: Box::new(right),
            },
            line,
        ))
    }

    fn parse_test(&mut self, value: Expr, line: usize) -> ParseResult<Expr> {
        let negated = self.consume_name("not");
        let name = self.expect_identifier()?;
        let args = if self.consume(&TokenKind::LParen) {
            let (args, _) = self.parse_call_args()?;
            args
        } else {
            match self.peek_kind() {
                TokenKind::Int(_) | TokenKind::Float(_) | TokenKind::Str(_) => {
                    vec![self.parse_primary()?]
                }
                _ => Vec::new(),
            }
        };
        Ok(Expr::new(
            ExprKind::Test {
                value: Box::new(value),
                name,
                args,
                negated,
            },
            line,
        ))
    }

    fn parse_concat(&mut self) -> ParseResult<Expr> {
        let first = self.parse_range()?;
        if !self.at(&TokenKind::Tilde) {
            return Ok(first);
        }
        let line = first.line;
        let mut parts = vec![first];
        while self.consume(&TokenKind::Tilde) {
            parts.push(self.parse_range()?);
        }
        Ok(Expr::new(ExprKind::Concat(parts), line))
    }

    fn parse_range(&mut self) -> ParseResult<Expr> {
        let start = self.parse_additive()?;
        let inclusive = match self.peek_kind() {
            TokenKind::DotDot => false,
            TokenKind::DotDotEq => true,
            _ => return Ok(start),
        };
        let line = self.next().line;
        let end = self.parse_additive()?;
        Ok(Expr::new(
            ExprKind::Range {
                start: Box::new(start),
                end: Box::new(end),
                inclusive,
            },
            line,
        ))
    }

    fn parse_additive(&mut self) -> ParseResult<Expr> {
        self.chain(|p| {
            let mut left = p.parse_multiplicative()?;
            loop {
                let op = match p.peek_kind() {
                    TokenKind::Plus => BinOpKind::Add,
                    TokenKind::Minus => BinOpKind::Sub,
                    _ => return Ok(left),
                };
                p.link()?;
                let line = p.next().line;
                let right = p.parse_multiplicative()?;
                left = binop(op, left, right, line);
            }
        })
    }

    fn parse_multiplicative(&mut self) -> ParseResult<Expr> {
        self.chain(|p| {
            let mut left = p.parse_unary()?;
            loop {
                let op = match p.peek_kind() {
                    TokenKind::Star => BinOpKind::Mul,
                    TokenKind::Slash => BinOpKind::Div,
                    TokenKind::SlashSlash => BinOpKind::FloorDiv,
                    TokenKind::Percent => BinOpKind::Mod,
                    _ => return Ok(left),
                };
                p.link()?;
                let line = p.next().line;
                let right = p.parse_unary()?;
                left = binop(op, left, right, line);
            }
        })
    }

    fn parse_unary(&mut self) -> ParseResult<Expr> {
        let op = match self.peek_kind() {
            TokenKind::Minus => UnaryOpKind::Neg,
            TokenKind::Plus => UnaryOpKind::Pos,
            _ => return self.parse_power(),
        };
        let line = self.next().line;
        let operand = self.nested(Self::parse_unary)?;
        Ok(Expr::new(
            ExprKind::UnaryOp {
                op,
                operand: Box::new(operand),
            },
            line,
        ))
    }

    fn parse_power(&mut self) -> ParseResult<Expr> {
        let base = self.parse_postfix()?;
        if !self.at(&TokenKind::StarStar) {
            return Ok(base);
        }
        let line = self.next().line;
        let exponent = self.nested(Self::parse_unary)?;
        Ok(binop(BinOpKind::Pow, base, exponent, line))
    }

    fn parse_postfix(&mut self) -> ParseResult<Expr> {
        self.chain(|p| {
            let mut expr = p.parse_primary()?;
            loop {
                let line = p.peek().line;
                match p.peek_kind() {
                    TokenKind::Dot | TokenKind::QuestionDot => {
                        p.link()?;
                        let optional = p.next().kind == TokenKind::QuestionDot;
                        let attr = match p.next().kind {
                            TokenKind::Name(name) => name,
                            TokenKind::Int(i) => i.to_string(),
                            other => {
                                p.pos = p.pos.saturating_sub(1);
                                return Err(p.make_error(format!(
                                    "expected attribute name, found {}",
                                    other.describe()
                                )));
                            }
                        };
                        let value = Box::new(expr);
                        expr = if optional {
                            Expr::new(ExprKind::OptionalGetattr { value, attr }, line)
                        } else {
                            Expr::new(ExprKind::Getattr { value, attr }, line)
                        };
                    }
                    TokenKind::QuestionBracket => {
                        p.link()?;
                        p.next();
                        let key = p.parse_expression()?;
                        p.expect(&TokenKind::RBracket)?;
                        expr = Expr::new(
                            ExprKind::OptionalGetitem {
                                value: Box::new(expr),
                                key: Box::new(key),
                            },
                            line,
                        );
                    }
                    TokenKind::LBracket => {
                        p.link()?;
                        p.next();
                        expr = p.parse_subscript(expr, line)?;
                    }
                    TokenKind::LParen => {
                        p.link()?;
                        p.next();
                        let (args, kwargs) = p.parse_call_args()?;
                        expr = Expr::new(
                            ExprKind::Call {
                                callee: Box::new(expr),
                                args,
                                kwargs,
                            },
                            line,
                        );
                    }
                    _ => return Ok(expr),
                }
            }
        })
    }

    /// `[key]` or `[start:stop:step]`, after the opening bracket.
    fn parse_subscript(&mut self, value: Expr, line: usize) -> ParseResult<Expr> {
        let start = if self.at(&TokenKind::Colon) {
            None
        } else {
            Some(self.parse_expression()?)
        };
        if !self.consume(&TokenKind::Colon) {
            self.expect(&TokenKind::RBracket)?;
            let Some(key) = start else {
                return Err(self.make_error("expected subscript".to_string()));
            };
            return Ok(Expr::new(
                ExprKind::Getitem {
                    value: Box::new(value),
                    key: Box::new(key),
                },
                line,
            ));
        }
        let stop = if self.at(&TokenKind::Colon) || self.at(&TokenKind::RBracket) {
            None
        } else {
            Some(Box::new(self.parse_expression()?))
        };
        let step = if self.consume(&TokenKind::Colon) && !self.at(&TokenKind::RBracket) {
            Some(Box::new(self.parse_expression()?))
        } else {
            None
        };
        self.expect(&TokenKind::RBracket)?;
        Ok(Expr::new(
            ExprKind::Slice {
                value: Box::new(value),
                start: start.map(Box::new),
                stop,
                step,
            },
            line,
        ))
    }

    fn parse_primary(&mut self) -> ParseResult<Expr> {
        self.nested(|p| {
            let token = p.next();
            let line = token.line;
            let kind = match token.kind {
                TokenKind::Int(i) => ExprKind::Const(Value::Int(i)),
                TokenKind::Float(f) => ExprKind::Const(Value::Float(f)),
                TokenKind::Str(s) => ExprKind::Const(Value::from(s)),
                TokenKind::Name(name) => match name.as_str() {
                    "true" | "True" => ExprKind::Const(Value::Bool(true)),
                    "false" | "False" => ExprKind::Const(Value::Bool(false)),
                    "none" | "None" => ExprKind::Const(Value::None),
                    _ => ExprKind::Name(name),
                },
                TokenKind::LParen => {
                    let inner = p.parse_expression()?;
                    p.expect(&TokenKind::RParen)?;
                    return Ok(inner);
                }
                TokenKind::LBracket => {
                    let mut items = Vec::new();
                    while !p.at(&TokenKind::RBracket) {
                        items.push(p.parse_expression()?);
                        if !p.consume(&TokenKind::Comma) {
                            break;
                        }
                    }
                    p.expect(&TokenKind::RBracket)?;
                    ExprKind::List(items)
                }
                TokenKind::LBrace => {
                    let mut pairs = Vec::new();
                    while !p.at(&TokenKind::RBrace) {
                        let key = p.parse_expression()?;
                        p.expect(&TokenKind::Colon)?;
                        let value = p.parse_expression()?;
                        pairs.push((key, value));
                        if !p.consume(&TokenKind::Comma) {
                            break;
                        }
                    }
                    p.expect(&TokenKind::RBrace)?;
                    ExprKind::Dict(pairs)
                }
                other => {
                    return Err(p.error_at(
                        &Token {
                            kind: other.clone(),
                            line,
                            column: token.column,
                        },
                        format!("expected expression, found {}", other.describe()),
                        None,
                    ));
                }
            };
            Ok(Expr::new(kind, line))
        })
    }
}

fn binop(op: BinOpKind, left: Expr, right: Expr, line: usize) -> Expr {
    Expr::new(
        ExprKind::BinOp {
            op,
            left: Box::new(left),
            right: Box::new(right),
        },
        line,
    )
}

/// Lexes and parses `source` into a tree, collecting warnings.
pub(crate) fn parse(source: &str, name: &str, options: ParseOptions) -> KilnResult<ParseOutput> {
    let tokens = tokenize(source, name, options.trim_blocks)?;
    let output = Parser::new(source, name, tokens, options.max_nesting_depth).parse_template()?;
    Ok(output)
}
