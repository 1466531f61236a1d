//! SQL lexer.
//!
//! Hand-rolled scanner producing a token stream with source positions.
//! Handles `--` and `/* */` comments, single-quoted strings with `''`
//! escapes, blob literals (`x'..'`), quoted identifiers (`"..."`,
//! `[...]`, backticks), numbers, parameters, and multi-character
//! operators.

use crate::error::{QuereusError, Result};

/// Lexical token kinds
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    /// Bare identifier or keyword (keywords are matched case-insensitively
    /// by the parser)
    Ident(String),
    /// Identifier quoted with `"`, `[` `]`, or backticks
    QuotedIdent(String),
    /// String literal with quotes removed and `''` unescaped
    String(String),
    Integer(i64),
    Float(f64),
    /// Blob literal `x'hexdigits'`
    Blob(Vec<u8>),
    /// `?` anonymous parameter
    Question,
    /// `:name`, `@name`, or `$name` with the sigil stripped
    NamedParam(String),
    LParen,
    RParen,
    Comma,
    Dot,
    Semicolon,
    Star,
    Plus,
    Minus,
    Slash,
    Percent,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Concat,
}

/// A token with its source position
#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub line: u32,
    pub column: u32,
    /// Byte offset of the first character
    pub offset: usize,
    /// Byte offset one past the last character
    pub end_offset: usize,
}

/// Tokenize a SQL program
pub fn tokenize(source: &str) -> Result<Vec<Token>> {
    Lexer::new(source).run()
}

struct Lexer<'a> {
    src: &'a str,
    bytes: &'a [u8],
    pos: usize,
    line: u32,
    column: u32,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Lexer {
            src,
            bytes: src.as_bytes(),
            pos: 0,
            line: 1,
            column: 1,
        }
    }

    fn run(mut self) -> Result<Vec<Token>> {
        let mut tokens = Vec::new();
        while let Some(token) = self.next_token()? {
            tokens.push(token);
        }
        Ok(tokens)
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn peek_at(&self, ahead: usize) -> Option<u8> {
        self.bytes.get(self.pos + ahead).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let c = self.peek()?;
        self.pos += 1;
        if c == b'\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn error(&self, message: impl Into<String>) -> QuereusError {
        QuereusError::syntax(message, self.line, self.column)
    }

    fn skip_trivia(&mut self) -> Result<()> {
        loop {
            match self.peek() {
                Some(c) if c.is_ascii_whitespace() => {
                    self.bump();
                }
                Some(b'-') if self.peek_at(1) == Some(b'-') => {
                    while let Some(c) = self.peek() {
                        if c == b'\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                Some(b'/') if self.peek_at(1) == Some(b'*') => {
                    let (line, column) = (self.line, self.column);
                    self.bump();
                    self.bump();
                    loop {
                        match self.peek() {
                            Some(b'*') if self.peek_at(1) == Some(b'/') => {
                                self.bump();
                                self.bump();
                                break;
                            }
                            Some(_) => {
                                self.bump();
                            }
                            None => {
                                return Err(QuereusError::syntax(
                                    "unterminated block comment",
                                    line,
                                    column,
                                ));
                            }
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn next_token(&mut self) -> Result<Option<Token>> {
        self.skip_trivia()?;
        let Some(c) = self.peek() else {
            return Ok(None);
        };
        let (line, column, offset) = (self.line, self.column, self.pos);

        let kind = match c {
            b'(' => self.single(TokenKind::LParen),
            b')' => self.single(TokenKind::RParen),
            b',' => self.single(TokenKind::Comma),
            b'.' if !self.peek_at(1).is_some_and(|d| d.is_ascii_digit()) => {
                self.single(TokenKind::Dot)
            }
            b';' => self.single(TokenKind::Semicolon),
            b'*' => self.single(TokenKind::Star),
            b'+' => self.single(TokenKind::Plus),
            b'-' => self.single(TokenKind::Minus),
            b'/' => self.single(TokenKind::Slash),
            b'%' => self.single(TokenKind::Percent),
            b'?' => self.single(TokenKind::Question),
            b'=' => {
                self.bump();
                if self.peek() == Some(b'=') {
                    self.bump();
                }
                TokenKind::Eq
            }
            b'!' => {
                self.bump();
                if self.peek() == Some(b'=') {
                    self.bump();
                    TokenKind::Ne
                } else {
                    return Err(self.error("unexpected character '!'"));
                }
            }
            b'<' => {
                self.bump();
                match self.peek() {
                    Some(b'=') => {
                        self.bump();
                        TokenKind::Le
                    }
                    Some(b'>') => {
                        self.bump();
                        TokenKind::Ne
                    }
                    _ => TokenKind::Lt,
                }
            }
            b'>' => {
                self.bump();
                if self.peek() == Some(b'=') {
                    self.bump();
                    TokenKind::Ge
                } else {
                    TokenKind::Gt
                }
            }
            b'|' => {
                self.bump();
                if self.peek() == Some(b'|') {
                    self.bump();
                    TokenKind::Concat
                } else {
                    return Err(self.error("unexpected character '|'"));
                }
            }
            b'\'' => self.string_literal()?,
            b'"' => self.quoted_ident(b'"', b'"')?,
            b'[' => self.quoted_ident(b'[', b']')?,
            b'`' => self.quoted_ident(b'`', b'`')?,
            b':' | b'@' | b'$' => {
                self.bump();
                let name = self.ident_text();
                if name.is_empty() {
                    return Err(self.error("expected parameter name after sigil"));
                }
                TokenKind::NamedParam(name)
            }
            b'0'..=b'9' => self.number()?,
            b'.' => self.number()?,
            c if c == b'x' || c == b'X' => {
                if self.peek_at(1) == Some(b'\'') {
                    self.blob_literal()?
                } else {
                    TokenKind::Ident(self.ident_text())
                }
            }
            c if c.is_ascii_alphabetic() || c == b'_' => TokenKind::Ident(self.ident_text()),
            other => {
                return Err(self.error(format!("unexpected character '{}'", other as char)));
            }
        };

        Ok(Some(Token {
            kind,
            line,
            column,
            offset,
            end_offset: self.pos,
        }))
    }

    fn single(&mut self, kind: TokenKind) -> TokenKind {
        self.bump();
        kind
    }

    fn ident_text(&mut self) -> String {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == b'_' {
                self.bump();
            } else {
                break;
            }
        }
        self.src[start..self.pos].to_string()
    }

    fn string_literal(&mut self) -> Result<TokenKind> {
        let (line, column) = (self.line, self.column);
        self.bump(); // opening quote
        let mut text = String::new();
        loop {
            match self.bump() {
                Some(b'\'') => {
                    // '' escapes a quote
                    if self.peek() == Some(b'\'') {
                        self.bump();
                        text.push('\'');
                    } else {
                        return Ok(TokenKind::String(text));
                    }
                }
                Some(c) => {
                    // Re-assemble multi-byte UTF-8 sequences byte-wise
                    text.push(c as char);
                    if c >= 0x80 {
                        // Rebuild from source slice instead of pushing raw bytes
                        text.pop();
                        let start = self.pos - 1;
                        let mut end = self.pos;
                        while end < self.bytes.len() && (self.bytes[end] & 0xC0) == 0x80 {
                            self.bump();
                            end += 1;
                        }
                        text.push_str(&self.src[start..end]);
                    }
                }
                None => {
                    return Err(QuereusError::syntax("unterminated string", line, column));
                }
            }
        }
    }

    fn quoted_ident(&mut self, open: u8, close: u8) -> Result<TokenKind> {
        let (line, column) = (self.line, self.column);
        self.bump(); // opening delimiter
        let start = self.pos;
        loop {
            match self.peek() {
                Some(c) if c == close => {
                    let text = self.src[start..self.pos].to_string();
                    self.bump();
                    // "" escapes the delimiter inside double quotes
                    if open == b'"' && self.peek() == Some(b'"') {
                        self.bump();
                        let mut extended = text;
                        extended.push('"');
                        return self.quoted_ident_continue(extended, line, column);
                    }
                    return Ok(TokenKind::QuotedIdent(text));
                }
                Some(_) => {
                    self.bump();
                }
                None => {
                    return Err(QuereusError::syntax(
                        "unterminated quoted identifier",
                        line,
                        column,
                    ));
                }
            }
        }
    }

    fn quoted_ident_continue(
        &mut self,
        mut text: String,
        line: u32,
        column: u32,
    ) -> Result<TokenKind> {
        loop {
            match self.peek() {
                Some(b'"') => {
                    self.bump();
                    if self.peek() == Some(b'"') {
                        self.bump();
                        text.push('"');
                    } else {
                        return Ok(TokenKind::QuotedIdent(text));
                    }
                }
                Some(c) => {
                    self.bump();
                    text.push(c as char);
                }
                None => {
                    return Err(QuereusError::syntax(
                        "unterminated quoted identifier",
                        line,
                        column,
                    ));
                }
            }
        }
    }

    fn blob_literal(&mut self) -> Result<TokenKind> {
        let (line, column) = (self.line, self.column);
        self.bump(); // x
        self.bump(); // opening quote
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c == b'\'' {
                let hex = &self.src[start..self.pos];
                self.bump();
                if hex.len() % 2 != 0 {
                    return Err(QuereusError::syntax(
                        "blob literal requires an even number of hex digits",
                        line,
                        column,
                    ));
                }
                let mut bytes = Vec::with_capacity(hex.len() / 2);
                for chunk in hex.as_bytes().chunks(2) {
                    let pair = std::str::from_utf8(chunk).map_err(|_| {
                        QuereusError::syntax("invalid blob literal", line, column)
                    })?;
                    let byte = u8::from_str_radix(pair, 16).map_err(|_| {
                        QuereusError::syntax(
                            format!("invalid hex digits in blob literal: '{pair}'"),
                            line,
                            column,
                        )
                    })?;
                    bytes.push(byte);
                }
                return Ok(TokenKind::Blob(bytes));
            }
            self.bump();
        }
        Err(QuereusError::syntax("unterminated blob literal", line, column))
    }

    fn number(&mut self) -> Result<TokenKind> {
        let (line, column) = (self.line, self.column);
        let start = self.pos;
        let mut is_float = false;
        while let Some(c) = self.peek() {
            match c {
                b'0'..=b'9' => {
                    self.bump();
                }
                b'.' if !is_float => {
                    is_float = true;
                    self.bump();
                }
                b'e' | b'E' => {
                    is_float = true;
                    self.bump();
                    if matches!(self.peek(), Some(b'+') | Some(b'-')) {
                        self.bump();
                    }
                }
                _ => break,
            }
        }
        let text = &self.src[start..self.pos];
        if is_float {
            text.parse::<f64>()
                .map(TokenKind::Float)
                .map_err(|_| QuereusError::syntax(format!("bad numeric literal '{text}'"), line, column))
        } else {
            text.parse::<i64>()
                .map(TokenKind::Integer)
                .map_err(|_| QuereusError::syntax(format!("integer literal out of range: '{text}'"), line, column))
        }
    }
}
