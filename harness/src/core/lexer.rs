//! Tokenizer for Rhai source used by the static validation pass.
//!
//! The lexer only needs to be precise about identifiers, literals, and the
//! punctuation that changes how an identifier is used (`.`, `::`, `(`, `:`).
//! Anything it accepts that Rhai rejects is caught later by the real parser.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Ident,
    Number,
    /// String literal (plain, raw, or backtick template). `text` is the unescaped body.
    Str,
    Char,
    Punct,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    pub line: u32,
    pub column: u32,
}

impl Token {
    pub fn is_punct(&self, text: &str) -> bool {
        self.kind == TokenKind::Punct && self.text == text
    }

    pub fn is_ident(&self, text: &str) -> bool {
        self.kind == TokenKind::Ident && self.text == text
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LexError {
    pub message: String,
    pub line: u32,
    pub column: u32,
}

impl fmt::Display for LexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}: {}", self.line, self.column, self.message)
    }
}

const PUNCT_3: &[&str] = &["..=", "<<=", ">>=", "**="];
const PUNCT_2: &[&str] = &[
    "::", "==", "!=", "<=", ">=", "&&", "||", "=>", "->", "..", "+=", "-=", "*=", "/=", "%=",
    "&=", "|=", "^=", "<<", ">>", "**", "?.", "?[", "??", "#{",
];

/// Split `source` into tokens. Tokens inside `${...}` interpolations are
/// emitted inline after the template's own `Str` token.
pub fn tokenize(source: &str) -> Result<Vec<Token>, LexError> {
    let mut lexer = Lexer::new(source);
    let mut tokens = Vec::new();
    lexer.lex_tokens(&mut tokens, false)?;
    Ok(tokens)
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: u32,
    column: u32,
}

impl Lexer {
    fn new(source: &str) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
            column: 1,
        }
    }

    fn peek(&self) -> Option<char> {
        self.peek_at(0)
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn starts_with(&self, text: &str) -> bool {
        text.chars()
            .enumerate()
            .all(|(i, c)| self.peek_at(i) == Some(c))
    }

    fn error(&self, message: impl Into<String>, line: u32, column: u32) -> LexError {
        LexError {
            message: message.into(),
            line,
            column,
        }
    }

    /// Lex until end of input, or until the `}` closing an interpolation.
    fn lex_tokens(&mut self, out: &mut Vec<Token>, in_interpolation: bool) -> Result<(), LexError> {
        let mut depth = 0usize;
        while let Some(c) = self.peek() {
            let (line, column) = (self.line, self.column);
            if c.is_whitespace() {
                self.bump();
                continue;
            }
            if self.starts_with("//") {
                while self.peek().is_some_and(|c| c != '\n') {
                    self.bump();
                }
                continue;
            }
            if self.starts_with("/*") {
                self.skip_block_comment(line, column)?;
                continue;
            }

            let (kind, text) = if c.is_ascii_alphabetic() || c == '_' {
                (TokenKind::Ident, self.lex_ident())
            } else if c.is_ascii_digit() {
                (TokenKind::Number, self.lex_number())
            } else if c == '"' {
                (TokenKind::Str, self.lex_string(line, column)?)
            } else if c == '\'' {
                (TokenKind::Char, self.lex_char(line, column)?)
            } else if c == '#' && self.raw_string_hashes().is_some() {
                (TokenKind::Str, self.lex_raw_string(line, column)?)
            } else if c == '`' {
                out.push(Token {
                    kind: TokenKind::Str,
                    text: String::new(),
                    line,
                    column,
                });
                self.lex_template(out, line, column)?;
                continue;
            } else {
                (TokenKind::Punct, self.lex_punct())
            };

            if in_interpolation && kind == TokenKind::Punct {
                match text.as_str() {
                    "{" | "#{" => depth += 1,
                    "}" if depth == 0 => return Ok(()),
                    "}" => depth -= 1,
                    _ => {}
                }
            }
            out.push(Token {
                kind,
                text,
                line,
                column,
            });
        }
        if in_interpolation {
            return Err(self.error(
                "unterminated `${` interpolation",
                self.line,
                self.column,
            ));
        }
        Ok(())
    }

    fn skip_block_comment(&mut self, line: u32, column: u32) -> Result<(), LexError> {
        let mut depth = 0usize;
        loop {
            if self.starts_with("/*") {
                self.bump();
                self.bump();
                depth += 1;
            } else if self.starts_with("*/") {
                self.bump();
                self.bump();
                depth -= 1;
                if depth == 0 {
                    return Ok(());
                }
            } else if self.bump().is_none() {
                return Err(self.error("unterminated block comment", line, column));
            }
        }
    }

    fn lex_ident(&mut self) -> String {
        let mut text = String::new();
        while let Some(c) = self.peek() {
            if !(c.is_ascii_alphanumeric() || c == '_') {
                break;
            }
            text.push(c);
            self.bump();
        }
        text
    }

    fn lex_number(&mut self) -> String {
        let mut text = String::new();
        loop {
            match self.peek() {
                Some(c) if c.is_ascii_alphanumeric() || c == '_' => {
                    text.push(c);
                    self.bump();
                    let exponent = (c == 'e' || c == 'E') && !text.starts_with("0x");
                    if exponent
                        && matches!(self.peek(), Some('+' | '-'))
                        && self.peek_at(1).is_some_and(|d| d.is_ascii_digit())
                    {
                        if let Some(sign) = self.bump() {
                            text.push(sign);
                        }
                    }
                }
                Some('.')
                    if !text.contains('.')
                        && self.peek_at(1).is_some_and(|d| d.is_ascii_digit()) =>
                {
                    text.push('.');
                    self.bump();
                }
                _ => break,
            }
        }
        text
    }

    fn lex_string(&mut self, line: u32, column: u32) -> Result<String, LexError> {
        self.bump();
        let mut text = String::new();
        loop {
            match self.bump() {
                None => return Err(self.error("unterminated string literal", line, column)),
                Some('"') => return Ok(text),
                Some('\\') => match self.bump() {
                    None => return Err(self.error("unterminated string literal", line, column)),
                    Some('n') => text.push('\n'),
                    Some('t') => text.push('\t'),
                    Some('r') => text.push('\r'),
                    // Line continuation.
                    Some('\n') => {}
                    Some(other) => text.push(other),
                },
                Some(c) => text.push(c),
            }
        }
    }

    fn lex_char(&mut self, line: u32, column: u32) -> Result<String, LexError> {
        self.bump();
        let mut text = String::new();
        loop {
            match self.bump() {
                None | Some('\n') => {
                    return Err(self.error("unterminated character literal", line, column));
                }
                Some('\'') => return Ok(text),
                Some('\\') => {
                    text.push('\\');
                    if let Some(next) = self.bump() {
                        text.push(next);
                    }
                }
                Some(c) => text.push(c),
            }
        }
    }

    /// Number of `#` before the opening quote of a raw string at the cursor.
    fn raw_string_hashes(&self) -> Option<usize> {
        let mut hashes = 0;
        while self.peek_at(hashes) == Some('#') {
            hashes += 1;
        }
        (self.peek_at(hashes) == Some('"')).then_some(hashes)
    }

    fn lex_raw_string(&mut self, line: u32, column: u32) -> Result<String, LexError> {
        let hashes = self.raw_string_hashes().unwrap_or_default();
        for _ in 0..=hashes {
            self.bump();
        }
        let closing: String = std::iter::once('"')
            .chain(std::iter::repeat_n('#', hashes))
            .collect();
        let mut text = String::new();
        loop {
            if self.starts_with(&closing) {
                for _ in 0..closing.chars().count() {
                    self.bump();
                }
                return Ok(text);
            }
            match self.bump() {
                Some(c) => text.push(c),
                None => return Err(self.error("unterminated raw string literal", line, column)),
            }
        }
    }

    fn lex_template(
        &mut self,
        out: &mut Vec<Token>,
        line: u32,
        column: u32,
    ) -> Result<(), LexError> {
        self.bump();
        loop {
            if self.starts_with("${") {
                self.bump();
                self.bump();
                self.lex_tokens(out, true)?;
                continue;
            }
            match self.bump() {
                Some('`') => return Ok(()),
                Some(_) => {}
                None => return Err(self.error("unterminated template string", line, column)),
            }
        }
    }

    fn lex_punct(&mut self) -> String {
        let candidate = PUNCT_3
            .iter()
            .chain(PUNCT_2)
            .find(|p| self.starts_with(p))
            .map(|p| p.to_string());
        match candidate {
            Some(p) => {
                for _ in 0..p.chars().count() {
                    self.bump();
                }
                p
            }
            None => self.bump().map(String::from).unwrap_or_default(),
        }
    }
}
