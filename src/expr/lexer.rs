//! Tokenizer for the KSY expression language.

use crate::errors::{ErrorKind, KaitaiError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    Dot,
    Comma,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Question,
    Colon,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Amp,
    Pipe,
    Caret,
    Tilde,
    Bang,
    Lt,
    Le,
    Gt,
    Ge,
    Shl,
    Shr,
    EqEq,
    NotEq,
    AndAnd,
    OrOr,
    Eof,
}

pub struct Lexer<'a> {
    src: &'a str,
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
}

impl<'a> Lexer<'a> {
    pub fn new(src: &'a str) -> Self {
        Lexer {
            src,
            chars: src.char_indices().peekable(),
        }
    }

    fn err(&self, reason: impl Into<String>) -> KaitaiError {
        KaitaiError::new(ErrorKind::ExprCompileError {
            source: self.src.to_string(),
            reason: reason.into(),
        })
    }

    pub fn tokenize(mut self) -> Result<Vec<Token>> {
        let mut tokens = Vec::new();
        loop {
            self.skip_whitespace();
            let Some(&(_, c)) = self.chars.peek() else {
                tokens.push(Token::Eof);
                break;
            };
            if c.is_ascii_digit() {
                tokens.push(self.lex_number()?);
            } else if c == '"' {
                tokens.push(self.lex_string()?);
            } else if c == '_' || c.is_alphabetic() {
                tokens.push(self.lex_ident());
            } else {
                tokens.push(self.lex_operator()?);
            }
        }
        Ok(tokens)
    }

    fn skip_whitespace(&mut self) {
        while let Some(&(_, c)) = self.chars.peek() {
            if c.is_whitespace() {
                self.chars.next();
            } else {
                break;
            }
        }
    }

    fn lex_number(&mut self) -> Result<Token> {
        let start = self.chars.peek().unwrap().0;
        let mut is_float = false;
        if self.src[start..].starts_with("0x") || self.src[start..].starts_with("0X") {
            self.chars.next();
            self.chars.next();
            let hex_start = start + 2;
            let mut end = hex_start;
            while let Some(&(i, c)) = self.chars.peek() {
                if c.is_ascii_hexdigit() {
                    self.chars.next();
                    end = i + c.len_utf8();
                } else {
                    break;
                }
            }
            let val = i64::from_str_radix(&self.src[hex_start..end], 16)
                .map_err(|e| self.err(e.to_string()))?;
            return Ok(Token::Int(val));
        }
        if self.src[start..].starts_with("0b") || self.src[start..].starts_with("0B") {
            self.chars.next();
            self.chars.next();
            let bin_start = start + 2;
            let mut end = bin_start;
            while let Some(&(i, c)) = self.chars.peek() {
                if c == '0' || c == '1' {
                    self.chars.next();
                    end = i + c.len_utf8();
                } else {
                    break;
                }
            }
            let val = i64::from_str_radix(&self.src[bin_start..end], 2)
                .map_err(|e| self.err(e.to_string()))?;
            return Ok(Token::Int(val));
        }
        let mut end = start;
        while let Some(&(i, c)) = self.chars.peek() {
            if c.is_ascii_digit() {
                self.chars.next();
                end = i + c.len_utf8();
            } else if c == '.' && !is_float {
                // Don't consume the dot if it's a member-access dot on an
                // integer literal followed by a non-digit, e.g. `5.to_s`.
                let mut lookahead = self.chars.clone();
                lookahead.next();
                if matches!(lookahead.peek(), Some((_, d)) if d.is_ascii_digit()) {
                    is_float = true;
                    self.chars.next();
                    end = i + 1;
                } else {
                    break;
                }
            } else {
                break;
            }
        }
        let text = &self.src[start..end];
        if is_float {
            Ok(Token::Float(text.parse().map_err(|_| self.err("bad float literal"))?))
        } else {
            Ok(Token::Int(text.parse().map_err(|_| self.err("bad int literal"))?))
        }
    }

    fn lex_string(&mut self) -> Result<Token> {
        self.chars.next(); // opening quote
        let mut out = String::new();
        loop {
            match self.chars.next() {
                None => return Err(self.err("unterminated string literal")),
                Some((_, '"')) => break,
                Some((_, '\\')) => match self.chars.next() {
                    Some((_, 'n')) => out.push('\n'),
                    Some((_, 't')) => out.push('\t'),
                    Some((_, '"')) => out.push('"'),
                    Some((_, '\\')) => out.push('\\'),
                    Some((_, other)) => out.push(other),
                    None => return Err(self.err("unterminated escape in string literal")),
                },
                Some((_, c)) => out.push(c),
            }
        }
        Ok(Token::Str(out))
    }

    fn lex_ident(&mut self) -> Token {
        let start = self.chars.peek().unwrap().0;
        let mut end = start;
        while let Some(&(i, c)) = self.chars.peek() {
            if c == '_' || c.is_alphanumeric() {
                self.chars.next();
                end = i + c.len_utf8();
            } else {
                break;
            }
        }
        let text = &self.src[start..end];
        match text {
            "true" => Token::Ident("true".to_string()),
            "false" => Token::Ident("false".to_string()),
            _ => Token::Ident(text.to_string()),
        }
    }

    fn lex_operator(&mut self) -> Result<Token> {
        let (_, c) = self.chars.next().unwrap();
        macro_rules! peek_eat {
            ($ch:expr) => {{
                if matches!(self.chars.peek(), Some((_, c)) if *c == $ch) {
                    self.chars.next();
                    true
                } else {
                    false
                }
            }};
        }
        Ok(match c {
            '.' => Token::Dot,
            ',' => Token::Comma,
            '(' => Token::LParen,
            ')' => Token::RParen,
            '[' => Token::LBracket,
            ']' => Token::RBracket,
            '?' => Token::Question,
            ':' => Token::Colon,
            '+' => Token::Plus,
            '-' => Token::Minus,
            '*' => Token::Star,
            '/' => Token::Slash,
            '%' => Token::Percent,
            '~' => Token::Tilde,
            '^' => Token::Caret,
            '&' if peek_eat!('&') => Token::AndAnd,
            '&' => Token::Amp,
            '|' if peek_eat!('|') => Token::OrOr,
            '|' => Token::Pipe,
            '!' if peek_eat!('=') => Token::NotEq,
            '!' => Token::Bang,
            '=' if peek_eat!('=') => Token::EqEq,
            '<' if peek_eat!('<') => Token::Shl,
            '<' if peek_eat!('=') => Token::Le,
            '<' => Token::Lt,
            '>' if peek_eat!('>') => Token::Shr,
            '>' if peek_eat!('=') => Token::Ge,
            '>' => Token::Gt,
            other => return Err(self.err(format!("unexpected character `{other}`"))),
        })
    }
}
