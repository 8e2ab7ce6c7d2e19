//! Tokenizer for header text

use std::sync::Arc;

use crate::error::{Diagnostic, SourceLocation};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Ident,
    Int(u64),
    /// Floating literal; only ever skipped over
    Float,
    Str,
    Char(u64),
    Punct(&'static str),
}

#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    /// Source text of the token
    pub text: String,
    pub file: Arc<str>,
    pub line: usize,
    pub column: usize,
    /// First token on its line; directives are recognized by this
    pub line_start: bool,
    /// Preceded by whitespace or a comment
    pub space_before: bool,
}

impl Token {
    pub fn is_punct(&self, p: &str) -> bool {
        matches!(self.kind, TokenKind::Punct(q) if q == p)
    }

    pub fn is_ident(&self, name: &str) -> bool {
        self.kind == TokenKind::Ident && self.text == name
    }

    pub fn location(&self) -> SourceLocation {
        SourceLocation::new(self.file.as_ref(), self.line, self.column)
    }

    /// Same token, reported at `site`. Used for macro expansions.
    pub fn relocated(&self, site: &Token) -> Token {
        Token {
            file: site.file.clone(),
            line: site.line,
            column: site.column,
            line_start: false,
            ..self.clone()
        }
    }

    /// A synthesized integer token at the position of `site`
    pub fn int_at(value: u64, site: &Token) -> Token {
        Token {
            kind: TokenKind::Int(value),
            text: value.to_string(),
            file: site.file.clone(),
            line: site.line,
            column: site.column,
            line_start: false,
            space_before: true,
        }
    }
}

/// Longest first
const PUNCTUATORS: &[&str] = &[
    "...", "<<=", ">>=", "->", "++", "--", "<<", ">>", "<=", ">=", "==", "!=", "&&", "||", "*=",
    "/=", "%=", "+=", "-=", "&=", "^=", "|=", "##", "[", "]", "(", ")", "{", "}", ".", "&", "*",
    "+", "-", "~", "!", "/", "%", "<", ">", "^", "|", "?", ":", ";", "=", ",", "#",
];

struct Lexer<'a> {
    src: &'a [u8],
    text: &'a str,
    pos: usize,
    line: usize,
    line_begin: usize,
    file: Arc<str>,
}

impl<'a> Lexer<'a> {
    fn peek(&self, ahead: usize) -> u8 {
        self.src.get(self.pos + ahead).copied().unwrap_or(0)
    }

    fn column(&self) -> usize {
        self.pos - self.line_begin + 1
    }

    fn newline(&mut self) {
        self.line += 1;
        self.line_begin = self.pos;
    }

    fn error(&self, message: impl Into<String>) -> Diagnostic {
        Diagnostic::new(
            SourceLocation::new(self.file.as_ref(), self.line, self.column()),
            message,
        )
    }

    /// Skip blanks and comments. Returns (saw whitespace, crossed a line).
    fn skip_trivia(&mut self) -> Result<(bool, bool), Diagnostic> {
        let mut space = false;
        let mut newline = false;
        loop {
            match self.peek(0) {
                b'\n' => {
                    self.pos += 1;
                    self.newline();
                    space = true;
                    newline = true;
                }
                b' ' | b'\t' | b'\r' | 0x0b | 0x0c => {
                    self.pos += 1;
                    space = true;
                }
                // Line continuation
                b'\\' if self.peek(1) == b'\n' || (self.peek(1) == b'\r' && self.peek(2) == b'\n') => {
                    self.pos += if self.peek(1) == b'\r' { 3 } else { 2 };
                    self.newline();
                    space = true;
                }
                b'/' if self.peek(1) == b'/' => {
                    while self.pos < self.src.len() && self.peek(0) != b'\n' {
                        self.pos += 1;
                    }
                    space = true;
                }
                b'/' if self.peek(1) == b'*' => {
                    let start = self.error("unterminated /* comment");
                    self.pos += 2;
                    loop {
                        if self.pos >= self.src.len() {
                            return Err(start);
                        }
                        if self.peek(0) == b'*' && self.peek(1) == b'/' {
                            self.pos += 2;
                            break;
                        }
                        self.pos += 1;
                        if self.src[self.pos - 1] == b'\n' {
                            self.newline();
                            newline = true;
                        }
                    }
                    space = true;
                }
                _ => return Ok((space, newline)),
            }
        }
    }

    fn number(&mut self) -> Result<TokenKind, Diagnostic> {
        let start = self.pos;
        while self.peek(0).is_ascii_alphanumeric()
            || self.peek(0) == b'_'
            || self.peek(0) == b'.'
            || (matches!(self.peek(0), b'+' | b'-')
                && matches!(self.src[self.pos - 1], b'e' | b'E' | b'p' | b'P')
                && !self.text[start..self.pos].starts_with("0x"))
        {
            self.pos += 1;
        }
        let text = &self.text[start..self.pos];
        let digits = text.trim_end_matches(['u', 'U', 'l', 'L']);

        let parsed = if let Some(hex) = digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
            u64::from_str_radix(hex, 16)
        } else if let Some(bin) = digits.strip_prefix("0b").or_else(|| digits.strip_prefix("0B")) {
            u64::from_str_radix(bin, 2)
        } else if digits.len() > 1 && digits.starts_with('0') {
            u64::from_str_radix(&digits[1..], 8)
        } else {
            digits.parse()
        };

        match parsed {
            Ok(value) => Ok(TokenKind::Int(value)),
            Err(_) if text.contains(['.', 'e', 'E']) && !text.starts_with("0x") => Ok(TokenKind::Float),
            Err(_) => Err(self.error(format!("invalid integer literal '{text}'"))),
        }
    }

    fn escape(&mut self) -> Result<u64, Diagnostic> {
        // after the backslash
        let c = self.peek(0);
        self.pos += 1;
        Ok(match c {
            b'n' => 10,
            b't' => 9,
            b'r' => 13,
            b'a' => 7,
            b'b' => 8,
            b'f' => 12,
            b'v' => 11,
            b'x' => {
                let mut value = 0u64;
                while self.peek(0).is_ascii_hexdigit() {
                    value = value.wrapping_mul(16) + (self.peek(0) as char).to_digit(16).unwrap_or(0) as u64;
                    self.pos += 1;
                }
                value
            }
            b'0'..=b'7' => {
                let mut value = (c - b'0') as u64;
                for _ in 0..2 {
                    if !(b'0'..=b'7').contains(&self.peek(0)) {
                        break;
                    }
                    value = value * 8 + (self.peek(0) - b'0') as u64;
                    self.pos += 1;
                }
                value
            }
            0 => return Err(self.error("unterminated escape sequence")),
            other => other as u64,
        })
    }

    fn quoted(&mut self, quote: u8) -> Result<TokenKind, Diagnostic> {
        let what = if quote == b'"' { "string" } else { "character" };
        let unterminated = self.error(format!("unterminated {what} literal"));
        self.pos += 1;
        let mut value = 0u64;
        loop {
            match self.peek(0) {
                0 | b'\n' => return Err(unterminated),
                b'\\' => {
                    self.pos += 1;
                    value = self.escape()?;
                }
                c if c == quote => {
                    self.pos += 1;
                    break;
                }
                c => {
                    self.pos += 1;
                    value = c as u64;
                }
            }
        }
        Ok(if quote == b'"' {
            TokenKind::Str
        } else {
            TokenKind::Char(value)
        })
    }

    fn next(&mut self) -> Result<Option<Token>, Diagnostic> {
        let (space, crossed_line) = self.skip_trivia()?;
        if self.pos >= self.src.len() {
            return Ok(None);
        }
        let start = self.pos;
        let line = self.line;
        let column = self.column();
        let line_start = crossed_line || start == 0;

        let c = self.peek(0);
        let kind = if c.is_ascii_alphabetic() || c == b'_' {
            while self.peek(0).is_ascii_alphanumeric() || self.peek(0) == b'_' {
                self.pos += 1;
            }
            TokenKind::Ident
        } else if c.is_ascii_digit() || (c == b'.' && self.peek(1).is_ascii_digit()) {
            self.number()?
        } else if c == b'"' || c == b'\'' {
            self.quoted(c)?
        } else {
            let rest = &self.text[self.pos..];
            let Some(p) = PUNCTUATORS.iter().find(|p| rest.starts_with(**p)) else {
                let ch = rest.chars().next().unwrap_or('?');
                return Err(self.error(format!("unexpected character '{ch}'")));
            };
            self.pos += p.len();
            TokenKind::Punct(p)
        };

        Ok(Some(Token {
            kind,
            text: self.text[start..self.pos].to_string(),
            file: self.file.clone(),
            line,
            column,
            line_start,
            space_before: space,
        }))
    }
}

/// Split `text` into tokens, attributing them to `file`
pub fn tokenize(file: &Arc<str>, text: &str) -> Result<Vec<Token>, Diagnostic> {
    let mut lexer = Lexer {
        src: text.as_bytes(),
        text,
        pos: 0,
        line: 1,
        line_begin: 0,
        file: file.clone(),
    };
    let mut tokens = Vec::new();
    while let Some(token) = lexer.next()? {
        tokens.push(token);
    }
    Ok(tokens)
}
