//! The scanner (§4.1): character stream → token stream, with comment and
//! whitespace elision and literal parsing done inline. Reads source
//! byte-by-byte, as the design calls for, tracking the line number so every
//! downstream diagnostic can be stamped with it.

use derive_more::Display;
use regex::Regex;

use crate::common::Id;
use crate::error::CompileError;

pub const MAX_IDENTIFIER_LENGTH: usize = 64;
pub const MAX_INTEGER_LENGTH: usize = 20;
pub const MAX_STRING_LENGTH: usize = 128;

/// The value an unsigned decimal literal is bounded by when it is not
/// immediately preceded by a unary `-`. A literal preceded by `-` is
/// allowed one further magnitude, `2^63`, so that `-9223372036854775808`
/// (`INT64_MIN`) is expressible at all — see `Lexer::scan_integer`.
const UNSIGNED_INTEGER_BOUND: u64 = i64::MAX as u64;
const NEGATED_INTEGER_BOUND: u64 = 1u64 << 63;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Display, Debug)]
#[allow(missing_docs)]
pub enum Keyword {
    #[display("uint64_t")]
    Uint64,
    #[display("void")]
    Void,
    #[display("if")]
    If,
    #[display("else")]
    Else,
    #[display("while")]
    While,
    #[display("return")]
    Return,
}

impl Keyword {
    /// `int`, `char`, and `unsigned` are bootstrapping-mode aliases for
    /// `uint64_t` (§4.1); every other reserved word matches verbatim.
    fn lookup(word: &str) -> Option<Keyword> {
        Some(match word {
            "uint64_t" | "int" | "char" | "unsigned" => Keyword::Uint64,
            "void" => Keyword::Void,
            "if" => Keyword::If,
            "else" => Keyword::Else,
            "while" => Keyword::While,
            "return" => Keyword::Return,
            _ => return None,
        })
    }
}

/// Token classes. Literal payloads are carried directly on the kind rather
/// than re-sliced from the source, since the scanner already owns them.
#[derive(Clone, PartialEq, Eq, Display, Debug)]
#[allow(missing_docs)]
pub enum TokenKind {
    #[display("identifier '{_0}'")]
    Identifier(Id),
    #[display("integer {_0}")]
    Integer(u64),
    #[display("character {_0}")]
    Character(u8),
    #[display("string {_0:?}")]
    StringLiteral(String),
    #[display("keyword '{_0}'")]
    Keyword(Keyword),
    #[display(";")]
    Semicolon,
    #[display(",")]
    Comma,
    #[display("(")]
    LParen,
    #[display(")")]
    RParen,
    #[display("{{")]
    LBrace,
    #[display("}}")]
    RBrace,
    #[display("+")]
    Plus,
    #[display("-")]
    Minus,
    #[display("*")]
    Star,
    #[display("/")]
    Slash,
    #[display("%")]
    Percent,
    #[display("=")]
    Assign,
    #[display("==")]
    Eq,
    #[display("!=")]
    Neq,
    #[display("<")]
    Lt,
    #[display("<=")]
    Leq,
    #[display(">")]
    Gt,
    #[display(">=")]
    Geq,
    #[display("&")]
    Amp,
}

#[derive(Clone, PartialEq, Eq, Display, Debug)]
#[display("{kind} (line {line})")]
pub struct Token {
    pub kind: TokenKind,
    pub line: u64,
}

pub struct Lexer<'input> {
    chars: Vec<char>,
    pos: usize,
    line: u64,
    /// Whether the most recently returned token was a `-`, which loosens
    /// the bound on the very next integer literal (§4.1).
    previous_was_minus: bool,
    whitespace: Regex,
}

impl<'input> Lexer<'input> {
    pub fn new(input: &'input str) -> Self {
        Lexer {
            chars: input.chars().collect(),
            pos: 0,
            line: 1,
            previous_was_minus: false,
            // Only used to recognize runs of plain whitespace; comments are
            // handled explicitly below since `//`/`/* */` both need to
            // count ignored characters and, for the latter, detect a
            // runaway (unterminated) comment.
            whitespace: Regex::new(r"^[ \t\x0b\x0c\r]+$").unwrap(),
        }
    }

    pub fn end_of_input(&self) -> bool {
        self.pos >= self.chars.len()
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
        }
        Some(c)
    }

    fn error(&self, message: impl Into<String>) -> CompileError {
        CompileError::Scanner { line: self.line, message: message.into() }
    }

    /// Skips whitespace and comments, billing their contents as ignored
    /// characters. Returns an error only for a runaway `/* ... */` comment
    /// that never closes (§4.1: "a fatal scanner error").
    fn skip_ignored(&mut self) -> Result<(), CompileError> {
        loop {
            match self.peek() {
                Some(c) if self.whitespace.is_match(&c.to_string()) || c == '\n' => {
                    self.advance();
                }
                Some('/') if self.peek_at(1) == Some('/') => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.advance();
                    }
                }
                Some('/') if self.peek_at(1) == Some('*') => {
                    let start_line = self.line;
                    self.advance();
                    self.advance();
                    loop {
                        match (self.peek(), self.peek_at(1)) {
                            (Some('*'), Some('/')) => {
                                self.advance();
                                self.advance();
                                break;
                            }
                            (Some(_), _) => {
                                self.advance();
                            }
                            (None, _) => {
                                return Err(CompileError::Scanner {
                                    line: start_line,
                                    message: "runaway comment: unterminated /* ... */".into(),
                                });
                            }
                        }
                    }
                }
                _ => break,
            }
        }
        Ok(())
    }

    fn scan_identifier_or_keyword(&mut self) -> Result<TokenKind, CompileError> {
        let mut text = String::new();
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == '_' {
                text.push(c);
                self.advance();
            } else {
                break;
            }
        }
        if text.len() > MAX_IDENTIFIER_LENGTH {
            return Err(self.error(format!(
                "identifier '{text}' exceeds the maximum length of {MAX_IDENTIFIER_LENGTH}"
            )));
        }
        if let Some(keyword) = Keyword::lookup(&text) {
            return Ok(TokenKind::Keyword(keyword));
        }
        Ok(TokenKind::Identifier(Id::from(text)))
    }

    /// Scans an unsigned decimal literal. `negated` loosens the bound from
    /// `INT64_MAX` up to `2^63`, the one extra magnitude `INT64_MIN` needs
    /// once negated: see the module docs.
    fn scan_integer(&mut self) -> Result<TokenKind, CompileError> {
        let negated = self.previous_was_minus;
        let mut digits = String::new();
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                digits.push(c);
                self.advance();
            } else {
                break;
            }
        }
        if digits.len() > MAX_INTEGER_LENGTH {
            return Err(self.error(format!(
                "integer literal '{digits}' exceeds {MAX_INTEGER_LENGTH} digits"
            )));
        }
        let value: u128 = digits.parse().map_err(|_| self.error("malformed integer literal"))?;
        let bound = if negated { NEGATED_INTEGER_BOUND } else { UNSIGNED_INTEGER_BOUND };
        if value > bound as u128 {
            return Err(self.error(format!(
                "integer literal {value} exceeds the permitted bound of {bound}"
            )));
        }
        Ok(TokenKind::Integer(value as u64))
    }

    fn scan_escape(&mut self) -> Result<u8, CompileError> {
        match self.advance() {
            Some('n') => Ok(b'\n'),
            Some('t') => Ok(b'\t'),
            Some('b') => Ok(0x08),
            Some('\'') => Ok(b'\''),
            Some('"') => Ok(b'"'),
            Some('%') => Ok(b'%'),
            Some('\\') => Ok(b'\\'),
            Some(other) => Err(self.error(format!("invalid escape sequence '\\{other}'"))),
            None => Err(self.error("unterminated escape sequence")),
        }
    }

    fn scan_character(&mut self) -> Result<TokenKind, CompileError> {
        self.advance(); // opening quote
        let value = match self.advance() {
            Some('\\') => self.scan_escape()?,
            Some(c) if c.is_ascii() => c as u8,
            Some(c) => return Err(self.error(format!("non-ASCII character literal '{c}'"))),
            None => return Err(self.error("unterminated character literal")),
        };
        match self.advance() {
            Some('\'') => Ok(TokenKind::Character(value)),
            _ => Err(self.error("character literal must contain exactly one character")),
        }
    }

    fn scan_string(&mut self) -> Result<TokenKind, CompileError> {
        self.advance(); // opening quote
        let mut bytes = Vec::new();
        loop {
            match self.advance() {
                Some('"') => break,
                Some('\\') => bytes.push(self.scan_escape()?),
                Some(c) if c.is_ascii() => bytes.push(c as u8),
                Some(c) => return Err(self.error(format!("non-ASCII character '{c}' in string"))),
                None => return Err(self.error("unterminated string literal")),
            }
            if bytes.len() > MAX_STRING_LENGTH {
                return Err(self.error(format!(
                    "string literal exceeds {MAX_STRING_LENGTH} characters"
                )));
            }
        }
        Ok(TokenKind::StringLiteral(String::from_utf8_lossy(&bytes).into_owned()))
    }

    fn scan_punctuation(&mut self) -> Result<TokenKind, CompileError> {
        let c = self.advance().expect("caller checked peek()");
        let kind = match c {
            ';' => TokenKind::Semicolon,
            ',' => TokenKind::Comma,
            '(' => TokenKind::LParen,
            ')' => TokenKind::RParen,
            '{' => TokenKind::LBrace,
            '}' => TokenKind::RBrace,
            '+' => TokenKind::Plus,
            '-' => TokenKind::Minus,
            '*' => TokenKind::Star,
            '/' => TokenKind::Slash,
            '%' => TokenKind::Percent,
            '&' => TokenKind::Amp,
            '=' => {
                if self.peek() == Some('=') {
                    self.advance();
                    TokenKind::Eq
                } else {
                    TokenKind::Assign
                }
            }
            '!' if self.peek() == Some('=') => {
                self.advance();
                TokenKind::Neq
            }
            '<' => {
                if self.peek() == Some('=') {
                    self.advance();
                    TokenKind::Leq
                } else {
                    TokenKind::Lt
                }
            }
            '>' => {
                if self.peek() == Some('=') {
                    self.advance();
                    TokenKind::Geq
                } else {
                    TokenKind::Gt
                }
            }
            other => return Err(self.error(format!("unexpected character {other:?}"))),
        };
        Ok(kind)
    }

    /// Scans and returns the next token, or `None` at end of input.
    pub fn next(&mut self) -> Result<Option<Token>, CompileError> {
        self.skip_ignored()?;
        if self.end_of_input() {
            return Ok(None);
        }
        let line = self.line;
        let c = self.peek().unwrap();
        let kind = if c.is_ascii_alphabetic() || c == '_' {
            self.scan_identifier_or_keyword()?
        } else if c.is_ascii_digit() {
            self.scan_integer()?
        } else if c == '\'' {
            self.scan_character()?
        } else if c == '"' {
            self.scan_string()?
        } else {
            self.scan_punctuation()?
        };
        self.previous_was_minus = matches!(kind, TokenKind::Minus);
        Ok(Some(Token { kind, line }))
    }

    /// Collects every token, for tooling (`-s tokens` style dumps) and
    /// tests. Propagates the first scanner error encountered.
    pub fn tokenize(mut self) -> Result<Vec<Token>, CompileError> {
        let mut tokens = Vec::new();
        while let Some(token) = self.next()? {
            tokens.push(token);
        }
        Ok(tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        Lexer::new(src).tokenize().unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn scans_keywords_and_aliases() {
        assert_eq!(
            kinds("int char unsigned uint64_t"),
            vec![
                TokenKind::Keyword(Keyword::Uint64),
                TokenKind::Keyword(Keyword::Uint64),
                TokenKind::Keyword(Keyword::Uint64),
                TokenKind::Keyword(Keyword::Uint64),
            ]
        );
    }

    #[test]
    fn scans_identifier() {
        assert_eq!(kinds("foo_bar1"), vec![TokenKind::Identifier(Id::from("foo_bar1".to_string()))]);
    }

    #[test]
    fn rejects_overlong_identifier() {
        let long = "a".repeat(MAX_IDENTIFIER_LENGTH + 1);
        assert!(Lexer::new(&long).tokenize().is_err());
    }

    #[test]
    fn int_min_only_allowed_after_minus() {
        assert!(Lexer::new("9223372036854775808").tokenize().is_err());
        assert_eq!(
            kinds("-9223372036854775808"),
            vec![TokenKind::Minus, TokenKind::Integer(1u64 << 63)]
        );
    }

    #[test]
    fn elides_comments_and_tracks_lines() {
        let tokens = Lexer::new("// comment\nx /* multi\nline */ = 1;").tokenize().unwrap();
        assert_eq!(tokens[0].line, 2);
        assert_eq!(tokens[1].line, 3);
    }

    #[test]
    fn runaway_comment_is_fatal() {
        assert!(Lexer::new("/* never closes").tokenize().is_err());
    }

    #[test]
    fn string_and_char_escapes() {
        assert_eq!(
            kinds(r#" "a\nb" 'x' '\t' "#),
            vec![
                TokenKind::StringLiteral("a\nb".to_string()),
                TokenKind::Character(b'x'),
                TokenKind::Character(b'\t'),
            ]
        );
    }

    #[test]
    fn comparison_punctuation() {
        assert_eq!(
            kinds("== != <= >= < >"),
            vec![
                TokenKind::Eq,
                TokenKind::Neq,
                TokenKind::Leq,
                TokenKind::Geq,
                TokenKind::Lt,
                TokenKind::Gt,
            ]
        );
    }

    #[test]
    fn unknown_character_is_an_error() {
        assert!(Lexer::new("@").tokenize().is_err());
    }
}
