use crate::error::LexError;

type LexResult<T> = Result<T, LexError>;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TokenKind {
    /// Literal text between tags, trimmed according to `-` markers.
    Data(String),
    VariableBegin,
    VariableEnd,
    BlockBegin,
    BlockEnd,
    Name(String),
    Str(String),
    Int(i64),
    Float(f64),
    Dot,
    QuestionDot,
    QuestionBracket,
    Coalesce,
    LBracket,
    RBracket,
    LParen,
    RParen,
    LBrace,
    RBrace,
    Comma,
    Colon,
    Pipe,
    PipeForward,
    Plus,
    Minus,
    Star,
    StarStar,
    Slash,
    SlashSlash,
    Percent,
    Tilde,
    EqEq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Assign,
    DotDot,
    DotDotEq,
    Eof,
}

impl TokenKind {
    /// Short description for "expected X, found Y" messages.
    pub(crate) fn describe(&self) -> String {
        match self {
            Self::Data(_) => "template text".to_string(),
            Self::VariableBegin => "'{{'".to_string(),
            Self::VariableEnd => "'}}'".to_string(),
            Self::BlockBegin => "'{%'".to_string(),
            Self::BlockEnd => "'%}'".to_string(),
            Self::Name(name) => format!("'{name}'"),
            Self::Str(s) => format!("string \"{s}\""),
            Self::Int(i) => format!("number {i}"),
            Self::Float(f) => format!("number {f}"),
            Self::Eof => "end of template".to_string(),
            Self::Dot => "'.'".to_string(),
            Self::QuestionDot => "'?.'".to_string(),
            Self::QuestionBracket => "'?['".to_string(),
            Self::Coalesce => "'??'".to_string(),
            Self::LBracket => "'['".to_string(),
            Self::RBracket => "']'".to_string(),
            Self::LParen => "'('".to_string(),
            Self::RParen => "')'".to_string(),
            Self::LBrace => "'{'".to_string(),
            Self::RBrace => "'}'".to_string(),
            Self::Comma => "','".to_string(),
            Self::Colon => "':'".to_string(),
            Self::Pipe => "'|'".to_string(),
            Self::PipeForward => "'|>'".to_string(),
            Self::Plus => "'+'".to_string(),
            Self::Minus => "'-'".to_string(),
            Self::Star => "'*'".to_string(),
            Self::StarStar => "'**'".to_string(),
            Self::Slash => "'/'".to_string(),
            Self::SlashSlash => "'//'".to_string(),
            Self::Percent => "'%'".to_string(),
            Self::Tilde => "'~'".to_string(),
            Self::EqEq => "'=='".to_string(),
            Self::NotEq => "'!='".to_string(),
            Self::Lt => "'<'".to_string(),
            Self::LtEq => "'<='".to_string(),
            Self::Gt => "'>'".to_string(),
            Self::GtEq => "'>='".to_string(),
            Self::Assign => "'='".to_string(),
            Self::DotDot => "'..'".to_string(),
            Self::DotDotEq => "'..='".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Token {
    pub(crate) kind: TokenKind,
    pub(crate) line: usize,
    pub(crate) column: usize,
}

/// Longest-match operator table, checked in order.
const OPERATORS: &[(&str, TokenKind)] = &[
    ("..=", TokenKind::DotDotEq),
    ("??", TokenKind::Coalesce),
    ("?.", TokenKind::QuestionDot),
    ("?[", TokenKind::QuestionBracket),
    ("|>", TokenKind::PipeForward),
    ("..", TokenKind::DotDot),
    ("**", TokenKind::StarStar),
    ("//", TokenKind::SlashSlash),
    ("==", TokenKind::EqEq),
    ("!=", TokenKind::NotEq),
    ("<=", TokenKind::LtEq),
    (">=", TokenKind::GtEq),
    (".", TokenKind::Dot),
    ("[", TokenKind::LBracket),
    ("]", TokenKind::RBracket),
    ("(", TokenKind::LParen),
    (")", TokenKind::RParen),
    (",", TokenKind::Comma),
    (":", TokenKind::Colon),
    ("|", TokenKind::Pipe),
    ("+", TokenKind::Plus),
    ("-", TokenKind::Minus),
    ("*", TokenKind::Star),
    ("/", TokenKind::Slash),
    ("%", TokenKind::Percent),
    ("~", TokenKind::Tilde),
    ("<", TokenKind::Lt),
    (">", TokenKind::Gt),
    ("=", TokenKind::Assign),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TagKind {
    Variable,
    Block,
}

impl TagKind {
    const fn close(self) -> &'static str {
        match self {
            Self::Variable => "}}",
            Self::Block => "%}",
        }
    }

    const fn trimmed_close(self) -> &'static str {
        match self {
            Self::Variable => "-}}",
            Self::Block => "-%}",
        }
    }
}

/// Single-pass scanner. Every loop advances `pos`, and nothing is rescanned,
/// so lexing time is linear in the input length.
struct Lexer<'a> {
    input: &'a str,
    template: &'a str,
    pos: usize,
    /// Current line number (1-indexed)
    line: usize,
    /// The starting location of the current line
    line_start_pos: usize,
    trim_blocks: bool,
    /// Strip leading whitespace from the next data run (`-%}` was seen).
    trim_next_data: bool,
    /// Drop one newline from the next data run (`trim_blocks`).
    strip_next_newline: bool,
    tokens: Vec<Token>,
}

impl<'a> Lexer<'a> {
    fn new(input: &'a str, template: &'a str, trim_blocks: bool) -> Self {
        Self {
            input,
            template,
            pos: 0,
            line: 1,
            line_start_pos: 0,
            trim_blocks,
            trim_next_data: false,
            strip_next_newline: false,
            tokens: Vec::new(),
        }
    }

    #[inline]
    fn current_column(&self) -> usize {
        self.pos.saturating_sub(self.line_start_pos).saturating_add(1)
    }

    fn make_error_at(&self, line: usize, column: usize, message: String) -> LexError {
        LexError {
            template: self.template.to_string(),
            line,
            column,
            message,
        }
    }

    fn make_error(&self, message: String) -> LexError {
        self.make_error_at(self.line, self.current_column(), message)
    }

    fn eof(&self) -> bool {
        self.pos >= self.input.len()
    }

    fn rest(&self) -> &'a str {
        self.input.get(self.pos..).unwrap_or("")
    }

    fn peek(&self, s: &str) -> bool {
        self.rest().starts_with(s)
    }

    fn peek_char(&self) -> Option<char> {
        self.rest().chars().next()
    }

    /// Moves to `new_pos`, keeping line bookkeeping correct for any newlines
    /// skipped over.
    fn advance_to(&mut self, new_pos: usize) {
        let skipped = self.input.get(self.pos..new_pos).unwrap_or("");
        for (offset, _) in skipped.match_indices('\n') {
            self.line = self.line.saturating_add(1);
            self.line_start_pos = self.pos.saturating_add(offset).saturating_add(1);
        }
        self.pos = new_pos;
    }

    fn advance(&mut self, len: usize) {
        self.advance_to(self.pos.saturating_add(len));
    }

    fn push(&mut self, kind: TokenKind, line: usize, column: usize) {
        self.tokens.push(Token { kind, line, column });
    }

    fn run(mut self) -> LexResult<Vec<Token>> {
        while !self.eof() {
            self.lex_data();
            if self.eof() {
                break;
            }
            if self.peek("{#") {
                self.lex_comment()?;
            } else if self.peek("{%") && self.raw_block_starts() {
                self.lex_raw()?;
            } else if self.peek("{{") {
                self.lex_tag(TagKind::Variable)?;
            } else {
                self.lex_tag(TagKind::Block)?;
            }
        }
        let (line, column) = (self.line, self.current_column());
        self.push(TokenKind::Eof, line, column);
        Ok(self.tokens)
    }

    /// Finds the next `{{`, `{%` or `{#` at or after `from`.
    fn find_tag_start(&self, from: usize) -> Option<usize> {
        let bytes = self.input.as_bytes();
        let mut search = from;
        while let Some(offset) = self.input.get(search..).and_then(|s| s.find('{')) {
            let at = search.saturating_add(offset);
            if matches!(bytes.get(at.saturating_add(1)), Some(b'{' | b'%' | b'#')) {
                return Some(at);
            }
            search = at.saturating_add(1);
        }
        None
    }

    fn lex_data(&mut self) {
        let (line, column) = (self.line, self.current_column());
        let end = self.find_tag_start(self.pos).unwrap_or(self.input.len());
        let raw = self.input.get(self.pos..end).unwrap_or("");
        let trims_left_of_tag = self.input.as_bytes().get(end.saturating_add(2)) == Some(&b'-');
        self.advance_to(end);

        let mut text = raw;
        if std::mem::take(&mut self.strip_next_newline) {
            text = text
                .strip_prefix("\r\n")
                .or_else(|| text.strip_prefix('\n'))
                .unwrap_or(text);
        }
        if std::mem::take(&mut self.trim_next_data) {
            text = text.trim_start();
        }
        if trims_left_of_tag && end < self.input.len() {
            text = text.trim_end();
        }
        if !text.is_empty() {
            self.push(TokenKind::Data(text.to_string()), line, column);
        }
    }

    fn lex_comment(&mut self) -> LexResult<()> {
        let (line, column) = (self.line, self.current_column());
        let body_start = self.pos.saturating_add(2);
        let Some(offset) = self.input.get(body_start..).and_then(|s| s.find("#}")) else {
            return Err(self.make_error_at(line, column, "unterminated comment".to_string()));
        };
        let close = body_start.saturating_add(offset);
        if close > body_start && self.input.as_bytes().get(close.saturating_sub(1)) == Some(&b'-') {
            self.trim_next_data = true;
        }
        self.advance_to(close.saturating_add(2));
        Ok(())
    }

    /// Whether the `{%` at the cursor opens a `raw` block.
    fn raw_block_starts(&self) -> bool {
        tag_word_is(self.rest(), "raw")
    }

    fn lex_raw(&mut self) -> LexResult<()> {
        let (line, column) = (self.line, self.current_column());
        let unterminated =
            |lexer: &Self| lexer.make_error_at(line, column, "unterminated raw block".to_string());
        let Some(open_end) = self.rest().find("%}") else {
            return Err(unterminated(self));
        };
        let body_start = self.pos.saturating_add(open_end).saturating_add(2);
        let mut search = body_start;
        let close_start = loop {
            let Some(offset) = self.input.get(search..).and_then(|s| s.find("{%")) else {
                return Err(unterminated(self));
            };
            let at = search.saturating_add(offset);
            if tag_word_is(self.input.get(at..).unwrap_or(""), "endraw") {
                break at;
            }
            search = at.saturating_add(2);
        };
        let Some(close_len) = self
            .input
            .get(close_start..)
            .and_then(|s| s.find("%}"))
            .map(|i| i.saturating_add(2))
        else {
            return Err(unterminated(self));
        };

        let body = self.input.get(body_start..close_start).unwrap_or("");
        self.advance_to(body_start);
        let (body_line, body_column) = (self.line, self.current_column());
        if !body.is_empty() {
            self.push(TokenKind::Data(body.to_string()), body_line, body_column);
        }
        self.advance_to(close_start.saturating_add(close_len));
        Ok(())
    }

    fn lex_tag(&mut self, kind: TagKind) -> LexResult<()> {
        let (line, column) = (self.line, self.current_column());
        self.advance(2);
        if self.peek("-") {
            self.advance(1);
        }
        let begin = match kind {
            TagKind::Variable => TokenKind::VariableBegin,
            TagKind::Block => TokenKind::BlockBegin,
        };
        self.push(begin, line, column);

        let mut depth = 0usize;
        loop {
            self.skip_whitespace();
            if self.eof() {
                let what = match kind {
                    TagKind::Variable => "unterminated '{{' tag",
                    TagKind::Block => "unterminated '{%' tag",
                };
                return Err(self.make_error_at(line, column, what.to_string()));
            }
            if depth == 0 {
                let (end_line, end_column) = (self.line, self.current_column());
                let end = match kind {
                    TagKind::Variable => TokenKind::VariableEnd,
                    TagKind::Block => TokenKind::BlockEnd,
                };
                if self.peek(kind.trimmed_close()) {
                    self.advance(3);
                    self.trim_next_data = true;
                    self.push(end, end_line, end_column);
                    return Ok(());
                }
                if self.peek(kind.close()) {
                    self.advance(2);
                    if kind == TagKind::Block && self.trim_blocks {
                        self.strip_next_newline = true;
                    }
                    self.push(end, end_line, end_column);
                    return Ok(());
                }
            }
            self.lex_expression_token(&mut depth)?;
        }
    }

    fn skip_whitespace(&mut self) {
        let rest = self.rest();
        let trimmed = rest.trim_start();
        let skipped = rest.len().saturating_sub(trimmed.len());
        if skipped > 0 {
            self.advance(skipped);
        }
    }

    fn lex_expression_token(&mut self, depth: &mut usize) -> LexResult<()> {
        let (line, column) = (self.line, self.current_column());
        let Some(c) = self.peek_char() else {
            return Err(self.make_error("unexpected end of template".to_string()));
        };

        if c == '"' || c == '\'' {
            let value = self.lex_string(c)?;
            self.push(TokenKind::Str(value), line, column);
            return Ok(());
        }
        if c.is_ascii_digit() {
            let kind = self.lex_number()?;
            self.push(kind, line, column);
            return Ok(());
        }
        if c.is_alphabetic() || c == '_' {
            let name = self.lex_name();
            self.push(TokenKind::Name(name), line, column);
            return Ok(());
        }
        match c {
            '{' => {
                *depth = depth.saturating_add(1);
                self.advance(1);
                self.push(TokenKind::LBrace, line, column);
                return Ok(());
            }
            '}' => {
                *depth = depth.saturating_sub(1);
                self.advance(1);
                self.push(TokenKind::RBrace, line, column);
                return Ok(());
            }
            _ => {}
        }
        for (text, kind) in OPERATORS {
            if self.peek(text) {
                self.advance(text.len());
                self.push(kind.clone(), line, column);
                return Ok(());
            }
        }
        Err(self.make_error(format!("unexpected character '{c}'")))
    }

    fn lex_name(&mut self) -> String {
        let rest = self.rest();
        let len = rest
            .char_indices()
            .find(|(_, c)| !(c.is_alphanumeric() || *c == '_'))
            .map_or(rest.len(), |(i, _)| i);
        let name = rest.get(..len).unwrap_or("").to_string();
        self.advance(len);
        name
    }

    fn lex_number(&mut self) -> LexResult<TokenKind> {
        let rest = self.rest();
        let bytes = rest.as_bytes();
        // End of the digit run (underscores allowed) starting at `from`.
        let digits = |from: usize| {
            let run = bytes.get(from..).map_or(0, |tail| {
                tail.iter().take_while(|b| b.is_ascii_digit() || **b == b'_').count()
            });
            from.saturating_add(run)
        };
        let mut len = digits(0);
        let mut is_float = false;
        // `1..3` is a range, not a float.
        let after_dot = len.saturating_add(1);
        if bytes.get(len) == Some(&b'.') && bytes.get(after_dot).is_some_and(u8::is_ascii_digit) {
            is_float = true;
            len = digits(after_dot);
        }
        if matches!(bytes.get(len), Some(b'e' | b'E')) {
            let mut exp_len = len.saturating_add(1);
            if matches!(bytes.get(exp_len), Some(b'+' | b'-')) {
                exp_len = exp_len.saturating_add(1);
            }
            if bytes.get(exp_len).is_some_and(u8::is_ascii_digit) {
                is_float = true;
                let exponent = bytes.get(exp_len..).map_or(0, |tail| {
                    tail.iter().take_while(|b| b.is_ascii_digit()).count()
                });
                len = exp_len.saturating_add(exponent);
            }
        }
        let text: String = rest.get(..len).unwrap_or("").chars().filter(|c| *c != '_').collect();
        let kind = if is_float {
            text.parse::<f64>()
                .map(TokenKind::Float)
                .map_err(|_| self.make_error(format!("invalid number '{text}'")))?
        } else {
            text.parse::<i64>()
                .map(TokenKind::Int)
                .map_err(|_| self.make_error(format!("integer literal '{text}' is out of range")))?
        };
        self.advance(len);
        Ok(kind)
    }

    /// Scans a quoted string. A backslash always consumes exactly one
    /// following character, so adversarial escape runs stay linear.
    fn lex_string(&mut self, quote: char) -> LexResult<String> {
        let (line, column) = (self.line, self.current_column());
        let mut value = String::new();
        let mut chars = self.rest().char_indices();
        chars.next();
        let mut escaped = false;
        let mut end = None;
        for (i, c) in chars {
            if escaped {
                value.push(match c {
                    'n' => '\n',
                    't' => '\t',
                    'r' => '\r',
                    '0' => '\0',
                    other => other,
                });
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == quote {
                end = Some(i.saturating_add(c.len_utf8()));
                break;
            } else {
                value.push(c);
            }
        }
        match end {
            Some(len) => {
                self.advance(len);
                Ok(value)
            }
            None => Err(self.make_error_at(line, column, "unterminated string literal".to_string())),
        }
    }
}

/// Checks whether `tag` (starting at `{%`) has `word` as its first word.
fn tag_word_is(tag: &str, word: &str) -> bool {
    let Some(inner) = tag.strip_prefix("{%") else {
        return false;
    };
    let inner = inner.strip_prefix('-').unwrap_or(inner).trim_start();
    let Some(after) = inner.strip_prefix(word) else {
        return false;
    };
    after.starts_with(|c: char| c.is_whitespace() || c == '-' || c == '%')
}

/// Converts template source into tokens, ending with `Eof`.
pub(crate) fn tokenize(input: &str, template: &str, trim_blocks: bool) -> LexResult<Vec<Token>> {
    Lexer::new(input, template, trim_blocks).run()
}
