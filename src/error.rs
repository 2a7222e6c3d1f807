use std::time::Duration;

use thiserror::Error;

pub type KilnResult<T> = std::result::Result<T, Error>;

/// Raised by the lexer for unterminated tags, comments and string literals.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Error)]
#[error("lex error in {template} at line {line}, column {column}: {message}")]
pub struct LexError {
    pub template: String,
    pub line: usize,
    pub column: usize,
    pub message: String,
}

/// A syntax error, with the offending source line and an optional rewrite
/// in this template language's syntax.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ParseError {
    pub template: String,
    pub line: usize,
    pub column: usize,
    pub message: String,
    /// The source line the error points at, followed by a caret line.
    pub snippet: String,
    pub suggestion: Option<String>,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "parse error in {} at line {}, column {}: {}",
            self.template, self.line, self.column, self.message
        )?;
        if !self.snippet.is_empty() {
            write!(f, "\n{}", self.snippet)?;
        }
        if let Some(suggestion) = &self.suggestion {
            write!(f, "\nhint: try `{}`", suggestion)?;
        }
        Ok(())
    }
}

impl std::error::Error for ParseError {}

/// An internal invariant violation during code generation. Never expected for
/// a tree the parser accepted.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Error)]
#[error("internal compiler error in {template}: {message}")]
pub struct CompileError {
    pub template: String,
    pub message: String,
}

/// Strict mode only: a plain (non-optional) access could not be resolved.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Error)]
#[error("undefined value '{name}' in {template} at line {line}")]
pub struct UndefinedError {
    pub template: String,
    pub line: usize,
    pub name: String,
}

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TemplateRuntimeError {
    pub template: String,
    pub line: usize,
    pub message: String,
    pub suggestion: Option<String>,
}

impl std::fmt::Display for TemplateRuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "runtime error in {} at line {}: {}",
            self.template, self.line, self.message
        )?;
        if let Some(suggestion) = &self.suggestion {
            write!(f, " (did you mean `{}`?)", suggestion)?;
        }
        Ok(())
    }
}

impl std::error::Error for TemplateRuntimeError {}

/// A non-fatal diagnostic recorded while compiling a template.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Error)]
#[error("warning in {template} at line {line}: {message}")]
pub struct Warning {
    pub template: String,
    pub line: usize,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Lex(#[from] LexError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error("template not found: {name}")]
    TemplateNotFound { name: String },
    #[error(transparent)]
    Undefined(#[from] UndefinedError),
    #[error(transparent)]
    Runtime(#[from] TemplateRuntimeError),
    #[error("include depth limit of {depth} exceeded in {template}")]
    RecursionLimit { depth: usize, template: String },
    #[error("rendering {template} exceeded the {limit:?} render timeout")]
    Timeout { template: String, limit: Duration },
    #[error("failed to load template {name}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// The template the error is attributed to, when one is known.
    pub fn template_name(&self) -> Option<&str> {
        match self {
            Self::Lex(e) => Some(&e.template),
            Self::Parse(e) => Some(&e.template),
            Self::Compile(e) => Some(&e.template),
            Self::TemplateNotFound { name } | Self::Io { name, .. } => Some(name),
            Self::Undefined(e) => Some(&e.template),
            Self::Runtime(e) => Some(&e.template),
            Self::RecursionLimit { template, .. } | Self::Timeout { template, .. } => {
                Some(template)
            }
        }
    }

    /// Source line of the fault, when one is known.
    pub const fn line(&self) -> Option<usize> {
        match self {
            Self::Lex(e) => Some(e.line),
            Self::Parse(e) => Some(e.line),
            Self::Undefined(e) => Some(e.line),
            Self::Runtime(e) => Some(e.line),
            Self::Compile(_)
            | Self::TemplateNotFound { .. }
            | Self::RecursionLimit { .. }
            | Self::Timeout { .. }
            | Self::Io { .. } => None,
        }
    }
}

/// Renders `line` of `source` with a caret under `column`.
pub(crate) fn snippet(source: &str, line: usize, column: usize) -> String {
    let Some(text) = source.lines().nth(line.saturating_sub(1)) else {
        return String::new();
    };
    let gutter = line.to_string();
    let pad = " ".repeat(gutter.len());
    let caret_pad = " ".repeat(column.saturating_sub(1));
    format!("{gutter} | {text}\n{pad} | {caret_pad}^")
}

/// Closest candidate by edit distance, for "did you mean" hints.
pub(crate) fn closest_match<'a, I>(name: &str, candidates: I) -> Option<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let max_distance = (name.len() / 3).max(1);
    candidates
        .into_iter()
        .map(|candidate| (edit_distance(name, candidate), candidate))
        .filter(|(distance, _)| *distance <= max_distance)
        .min_by_key(|(distance, _)| *distance)
        .map(|(_, candidate)| candidate.to_string())
}

fn edit_distance(a: &str, b: &str) -> usize {
    let b_chars: Vec<char> = b.chars().collect();
    let mut previous: Vec<usize> = (0..=b_chars.len()).collect();
    for (i, ca) in a.chars().enumerate() {
        let mut current = Vec::with_capacity(previous.len());
        current.push(i.saturating_add(1));
        for ((cb, diagonal), above) in b_chars.iter().zip(&previous).zip(previous.iter().skip(1)) {
            let left = current.last().copied().unwrap_or(0);
            let substitute = diagonal.saturating_add(usize::from(ca != *cb));
            current.push(
                substitute
                    .min(above.saturating_add(1))
                    .min(left.saturating_add(1)),
            );
        }
        previous = current;
    }
    previous.last().copied().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ntest::timeout(100)]
    fn test_snippet_points_at_column() {
        let source = "first\n{% for x in %}\nlast";
        let rendered = snippet(source, 2, 12);
        assert_eq!(rendered, "2 | {% for x in %}\n  |            ^");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_snippet_out_of_range_is_empty() {
        assert_eq!(snippet("one line", 4, 1), "");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_closest_match() {
        let names = ["upper", "lower", "length"];
        assert_eq!(closest_match("uper", names), Some("upper".to_string()));
        assert_eq!(closest_match("lenght", names), Some("length".to_string()));
        assert_eq!(closest_match("zzzzzz", names), None);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_edit_distance() {
        assert_eq!(edit_distance("", ""), 0);
        assert_eq!(edit_distance("", "abc"), 3);
        assert_eq!(edit_distance("abc", ""), 3);
        assert_eq!(edit_distance("kitten", "sitting"), 3);
        assert_eq!(edit_distance("endfor", "endif"), 2);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_error_identity() {
        let err = Error::from(UndefinedError {
            template: "page.html".to_string(),
            line: 7,
            name: "user.name".to_string(),
        });
        assert_eq!(err.template_name(), Some("page.html"));
        assert_eq!(err.line(), Some(7));
        assert_eq!(
            err.to_string(),
            "undefined value 'user.name' in page.html at line 7"
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_parse_error_display_includes_hint() {
        let err = ParseError {
            template: "a.html".to_string(),
            line: 1,
            column: 4,
            message: "unexpected 'else if'".to_string(),
            snippet: String::new(),
            suggestion: Some("{% elif cond %}".to_string()),
        };
        let text = err.to_string();
        assert!(text.contains("line 1, column 4"));
        assert!(text.ends_with("hint: try `{% elif cond %}`"));
    }
}
