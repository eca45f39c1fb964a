//! Python tokenizer.
//!
//! Produces the token stream the analysis walks: names, literals, operators,
//! and the `Newline` / `Indent` / `Dedent` structure of logical lines.
//! Lexical problems (unterminated strings, unbalanced brackets, inconsistent
//! dedent, stray characters) are reported as [`SyntaxError`]s.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenKind {
    Name(String),
    Number,
    /// String literal with its prefix (`r`, `b`, `f`, ...) and raw contents.
    Str { prefix: String, value: String },
    Op(&'static str),
    Newline,
    Indent,
    Dedent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    /// 1-based line.
    pub line: usize,
    /// 0-based column.
    pub col: usize,
}

impl Token {
    pub fn is_name(&self, name: &str) -> bool {
        matches!(&self.kind, TokenKind::Name(n) if n == name)
    }

    pub fn is_op(&self, op: &str) -> bool {
        matches!(&self.kind, TokenKind::Op(o) if *o == op)
    }

    pub fn name(&self) -> Option<&str> {
        match &self.kind {
            TokenKind::Name(n) => Some(n),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntaxError {
    pub message: String,
    pub line: usize,
    pub col: usize,
}

impl fmt::Display for SyntaxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (line {}, column {})", self.message, self.line, self.col)
    }
}

impl std::error::Error for SyntaxError {}

const OPS3: &[&str] = &["**=", "//=", ">>=", "<<=", "..."];
const OPS2: &[&str] = &[
    "**", "//", "==", "!=", "<=", ">=", "->", "+=", "-=", "*=", "/=", "%=", "&=", "|=", "^=",
    "<<", ">>", ":=", "@=",
];
const OPS1: &[&str] = &[
    "+", "-", "*", "/", "%", "@", "&", "|", "^", "~", "<", ">", "(", ")", "[", "]", "{", "}",
    ",", ":", ".", ";", "=",
];

const TAB_SIZE: usize = 8;

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    col: usize,
    tokens: Vec<Token>,
    parens: Vec<(char, usize, usize)>,
    indents: Vec<usize>,
    at_line_start: bool,
    line_has_tokens: bool,
    /// Fragment mode lexes f-string expressions: no line structure.
    fragment: bool,
}

/// Tokenize a complete module.
pub fn tokenize(source: &str) -> Result<Vec<Token>, SyntaxError> {
    let normalized = source.replace("\r\n", "\n").replace('\r', "\n");
    let mut lexer = Lexer::new(&normalized, 1, 0, false);
    lexer.run()?;
    Ok(lexer.tokens)
}

/// Tokenize an expression embedded in an f-string. Errors are ignored by
/// callers; the enclosing literal already lexed cleanly.
fn tokenize_fragment(source: &str, line: usize, col: usize) -> Result<Vec<Token>, SyntaxError> {
    let mut lexer = Lexer::new(source, line, col, true);
    lexer.run()?;
    Ok(lexer.tokens)
}

fn is_ident_start(c: char) -> bool {
    c == '_' || c.is_alphabetic()
}

fn is_ident_continue(c: char) -> bool {
    c == '_' || c.is_alphanumeric()
}

fn is_string_prefix(s: &str) -> bool {
    if s.len() > 2 {
        return false;
    }
    let lower = s.to_ascii_lowercase();
    matches!(
        lower.as_str(),
        "r" | "u" | "b" | "f" | "br" | "rb" | "fr" | "rf"
    )
}

impl Lexer {
    fn new(source: &str, line: usize, col: usize, fragment: bool) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
            line,
            col,
            tokens: Vec::new(),
            parens: Vec::new(),
            indents: vec![0],
            at_line_start: !fragment,
            line_has_tokens: false,
            fragment,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.get(self.pos).copied()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.col = 0;
        } else {
            self.col += 1;
        }
        Some(c)
    }

    fn error(&self, message: impl Into<String>, line: usize, col: usize) -> SyntaxError {
        SyntaxError {
            message: message.into(),
            line,
            col,
        }
    }

    fn push(&mut self, kind: TokenKind, line: usize, col: usize) {
        self.line_has_tokens = true;
        self.tokens.push(Token { kind, line, col });
    }

    fn run(&mut self) -> Result<(), SyntaxError> {
        loop {
            if self.at_line_start && self.parens.is_empty() && !self.fragment {
                if !self.handle_indentation()? {
                    break;
                }
                continue;
            }

            let Some(c) = self.peek() else { break };
            let (line, col) = (self.line, self.col);
            match c {
                '\n' => {
                    self.bump();
                    if self.parens.is_empty() && !self.fragment {
                        if self.line_has_tokens {
                            self.tokens.push(Token {
                                kind: TokenKind::Newline,
                                line,
                                col,
                            });
                        }
                        self.line_has_tokens = false;
                        self.at_line_start = true;
                    }
                }
                ' ' | '\t' | '\x0c' => {
                    self.bump();
                }
                '#' => self.skip_comment(),
                '\\' => {
                    self.bump();
                    if self.peek() == Some('\n') {
                        self.bump();
                    } else {
                        return Err(self.error(
                            "unexpected character after line continuation character",
                            line,
                            col,
                        ));
                    }
                }
                '"' | '\'' => self.lex_string(String::new(), line, col)?,
                c if c.is_ascii_digit() => self.lex_number(line, col),
                '.' if self.peek_at(1).is_some_and(|n| n.is_ascii_digit()) => {
                    self.lex_number(line, col)
                }
                c if is_ident_start(c) => {
                    let ident = self.lex_ident();
                    if matches!(self.peek(), Some('"') | Some('\'')) && is_string_prefix(&ident) {
                        self.lex_string(ident, line, col)?;
                    } else {
                        self.push(TokenKind::Name(ident), line, col);
                    }
                }
                _ => self.lex_op(line, col)?,
            }
        }

        if let Some(&(open, line, col)) = self.parens.last() {
            return Err(self.error(format!("'{open}' was never closed"), line, col));
        }
        if !self.fragment {
            if self.line_has_tokens {
                self.tokens.push(Token {
                    kind: TokenKind::Newline,
                    line: self.line,
                    col: self.col,
                });
            }
            while self.indents.len() > 1 {
                self.indents.pop();
                self.tokens.push(Token {
                    kind: TokenKind::Dedent,
                    line: self.line,
                    col: 0,
                });
            }
        }
        Ok(())
    }

    /// Measure indentation at the start of a logical line. Returns `false` at
    /// end of input.
    fn handle_indentation(&mut self) -> Result<bool, SyntaxError> {
        let mut width = 0usize;
        loop {
            match self.peek() {
                Some(' ') => width += 1,
                Some('\t') => width = (width / TAB_SIZE + 1) * TAB_SIZE,
                Some('\x0c') => width = 0,
                _ => break,
            }
            self.bump();
        }
        match self.peek() {
            None => return Ok(false),
            Some('\n') => {
                self.bump();
                return Ok(true);
            }
            Some('#') => {
                self.skip_comment();
                return Ok(true);
            }
            _ => {}
        }

        self.at_line_start = false;
        let current = self.indents.last().copied().unwrap_or(0);
        if width > current {
            self.indents.push(width);
            self.tokens.push(Token {
                kind: TokenKind::Indent,
                line: self.line,
                col: 0,
            });
        } else if width < current {
            while self.indents.last().is_some_and(|&w| w > width) {
                self.indents.pop();
                self.tokens.push(Token {
                    kind: TokenKind::Dedent,
                    line: self.line,
                    col: 0,
                });
            }
            if self.indents.last().copied() != Some(width) {
                return Err(self.error(
                    "unindent does not match any outer indentation level",
                    self.line,
                    width,
                ));
            }
        }
        Ok(true)
    }

    fn skip_comment(&mut self) {
        while let Some(c) = self.peek() {
            if c == '\n' {
                break;
            }
            self.bump();
        }
    }

    fn lex_ident(&mut self) -> String {
        let mut ident = String::new();
        while let Some(c) = self.peek() {
            if !is_ident_continue(c) {
                break;
            }
            ident.push(c);
            self.bump();
        }
        ident
    }

    fn lex_number(&mut self, line: usize, col: usize) {
        let mut prev = '\0';
        while let Some(c) = self.peek() {
            let exponent_sign = (c == '+' || c == '-') && matches!(prev, 'e' | 'E');
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' || exponent_sign {
                prev = c;
                self.bump();
            } else {
                break;
            }
        }
        self.push(TokenKind::Number, line, col);
    }

    fn lex_string(&mut self, prefix: String, line: usize, col: usize) -> Result<(), SyntaxError> {
        let Some(quote) = self.bump() else {
            return Err(self.error("unterminated string literal", line, col));
        };
        let triple = self.peek() == Some(quote) && self.peek_at(1) == Some(quote);
        if triple {
            self.bump();
            self.bump();
        }
        let body_line = self.line;
        let body_col = self.col;

        let mut value = String::new();
        loop {
            let Some(c) = self.bump() else {
                let what = if triple {
                    "unterminated triple-quoted string literal"
                } else {
                    "unterminated string literal"
                };
                return Err(self.error(what, line, col));
            };
            match c {
                '\\' => {
                    if let Some(next) = self.bump() {
                        value.push('\\');
                        value.push(next);
                    }
                }
                '\n' if !triple => {
                    return Err(self.error("unterminated string literal", line, col));
                }
                c if c == quote => {
                    if !triple {
                        break;
                    }
                    if self.peek() == Some(quote) && self.peek_at(1) == Some(quote) {
                        self.bump();
                        self.bump();
                        break;
                    }
                    value.push(c);
                }
                c => value.push(c),
            }
        }

        let is_fstring = prefix.to_ascii_lowercase().contains('f');
        self.push(
            TokenKind::Str {
                prefix,
                value: value.clone(),
            },
            line,
            col,
        );
        if is_fstring {
            for (expr, offset) in fstring_expressions(&value) {
                if let Ok(tokens) = tokenize_fragment(&expr, body_line, body_col + offset) {
                    self.tokens.extend(tokens);
                }
            }
        }
        Ok(())
    }

    fn lex_op(&mut self, line: usize, col: usize) -> Result<(), SyntaxError> {
        let rest: String = self.chars[self.pos..self.chars.len().min(self.pos + 3)]
            .iter()
            .collect();
        let op = OPS3
            .iter()
            .chain(OPS2)
            .chain(OPS1)
            .find(|op| rest.starts_with(**op))
            .copied();
        let Some(op) = op else {
            let c = self.peek().unwrap_or('?');
            return Err(self.error(format!("invalid character '{c}'"), line, col));
        };
        for _ in 0..op.chars().count() {
            self.bump();
        }

        match op {
            "(" | "[" | "{" => {
                let open = op.chars().next().unwrap_or('(');
                self.parens.push((open, line, col));
            }
            ")" | "]" | "}" => {
                let close = op.chars().next().unwrap_or(')');
                let expected = match close {
                    ')' => '(',
                    ']' => '[',
                    _ => '{',
                };
                match self.parens.pop() {
                    Some((open, _, _)) if open == expected => {}
                    Some((open, _, _)) => {
                        return Err(self.error(
                            format!(
                                "closing parenthesis '{close}' does not match opening parenthesis '{open}'"
                            ),
                            line,
                            col,
                        ))
                    }
                    None => return Err(self.error(format!("unmatched '{close}'"), line, col)),
                }
            }
            _ => {}
        }
        self.push(TokenKind::Op(op), line, col);
        Ok(())
    }
}

/// Extract `{expression}` segments from an f-string body with their offsets.
fn fstring_expressions(body: &str) -> Vec<(String, usize)> {
    let chars: Vec<char> = body.chars().collect();
    let mut out = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '{' if chars.get(i + 1) == Some(&'{') => i += 2,
            '{' => {
                let start = i + 1;
                let mut depth = 1;
                let mut j = start;
                while j < chars.len() && depth > 0 {
                    match chars[j] {
                        '{' => depth += 1,
                        '}' => depth -= 1,
                        _ => {}
                    }
                    j += 1;
                }
                let end = if depth == 0 { j - 1 } else { j };
                let expr: String = chars[start..end]
                    .iter()
                    .collect::<String>()
                    .split(['!', ':'])
                    .next()
                    .unwrap_or_default()
                    .to_string();
                out.push((expr, start));
                i = j;
            }
            _ => i += 1,
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        tokenize(src).unwrap().into_iter().map(|t| t.kind).collect()
    }

    fn names(src: &str) -> Vec<String> {
        tokenize(src)
            .unwrap()
            .into_iter()
            .filter_map(|t| t.name().map(str::to_string))
            .collect()
    }

    #[test]
    fn simple_function_structure() {
        let k = kinds("def f(x):\n    return x\n");
        assert_eq!(k[0], TokenKind::Name("def".into()));
        assert!(k.contains(&TokenKind::Indent));
        assert!(k.contains(&TokenKind::Dedent));
        assert_eq!(k.iter().filter(|t| **t == TokenKind::Newline).count(), 2);
    }

    #[test]
    fn comments_and_blank_lines_produce_no_tokens() {
        assert!(kinds("# just a comment\n\n   \n").is_empty());
    }

    #[test]
    fn newlines_inside_brackets_are_joined() {
        let k = kinds("x = call(\n    1,\n    2,\n)\n");
        assert_eq!(k.iter().filter(|t| **t == TokenKind::Newline).count(), 1);
        assert!(!k.contains(&TokenKind::Indent));
    }

    #[test]
    fn backslash_continuation() {
        let k = kinds("x = 1 + \\\n    2\n");
        assert_eq!(k.iter().filter(|t| **t == TokenKind::Newline).count(), 1);
    }

    #[test]
    fn string_prefixes_and_triple_quotes() {
        let toks = tokenize("a = rb'\\x00'\nb = \"\"\"multi\nline\"\"\"\n").unwrap();
        let strs: Vec<_> = toks
            .iter()
            .filter_map(|t| match &t.kind {
                TokenKind::Str { prefix, value } => Some((prefix.clone(), value.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(strs[0].0, "rb");
        assert_eq!(strs[1].1, "multi\nline");
    }

    #[test]
    fn fstring_expressions_are_tokenized() {
        let n = names("x = f\"{eval(code)} and {{literal}}\"\n");
        assert!(n.contains(&"eval".to_string()));
        assert!(!n.contains(&"literal".to_string()));
    }

    #[test]
    fn unterminated_string_is_error() {
        let err = tokenize("x = 'oops\n").unwrap_err();
        assert!(err.message.contains("unterminated string"));
        assert_eq!(err.line, 1);
    }

    #[test]
    fn unterminated_triple_string_is_error() {
        let err = tokenize("x = '''never closed\n\n").unwrap_err();
        assert!(err.message.contains("triple-quoted"));
    }

    #[test]
    fn unclosed_bracket_is_error() {
        let err = tokenize("x = foo(1, 2\n").unwrap_err();
        assert!(err.message.contains("never closed"));
    }

    #[test]
    fn mismatched_bracket_is_error() {
        let err = tokenize("x = [1, 2)\n").unwrap_err();
        assert!(err.message.contains("does not match"));
    }

    #[test]
    fn bad_dedent_is_error() {
        let err = tokenize("if x:\n        a = 1\n    b = 2\n").unwrap_err();
        assert!(err.message.contains("unindent"));
        assert_eq!(err.line, 3);
    }

    #[test]
    fn invalid_character_is_error() {
        let err = tokenize("x = $y\n").unwrap_err();
        assert!(err.message.contains("invalid character"));
    }

    #[test]
    fn numbers_with_exponents() {
        let k = kinds("x = 1.5e-3 + 0x1F\n");
        assert_eq!(k.iter().filter(|t| **t == TokenKind::Number).count(), 2);
    }

    #[test]
    fn crlf_is_normalized() {
        let k = kinds("a = 1\r\nb = 2\r\n");
        assert_eq!(k.iter().filter(|t| **t == TokenKind::Newline).count(), 2);
    }
}
