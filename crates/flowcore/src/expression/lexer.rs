//! Tokenizer for the expression language.

use crate::error::ExpressionError;

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Number(f64),
    Str(String),
    Ident(String),
    Dot,
    Comma,
    Colon,
    Question,
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Bang,
    EqEq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    AndAnd,
    OrOr,
    Coalesce,
    Arrow,
    Eof,
}

impl TokenKind {
    pub fn describe(&self) -> String {
        match self {
            TokenKind::Number(n) => format!("number {n}"),
            TokenKind::Str(_) => "string literal".to_string(),
            TokenKind::Ident(name) => format!("'{name}'"),
            TokenKind::Eof => "end of expression".to_string(),
            other => format!("'{}'", other.symbol()),
        }
    }

    fn symbol(&self) -> &'static str {
        match self {
            TokenKind::Dot => ".",
            TokenKind::Comma => ",",
            TokenKind::Colon => ":",
            TokenKind::Question => "?",
            TokenKind::LParen => "(",
            TokenKind::RParen => ")",
            TokenKind::LBracket => "[",
            TokenKind::RBracket => "]",
            TokenKind::LBrace => "{",
            TokenKind::RBrace => "}",
            TokenKind::Plus => "+",
            TokenKind::Minus => "-",
            TokenKind::Star => "*",
            TokenKind::Slash => "/",
            TokenKind::Percent => "%",
            TokenKind::Bang => "!",
            TokenKind::EqEq => "==",
            TokenKind::NotEq => "!=",
            TokenKind::Lt => "<",
            TokenKind::LtEq => "<=",
            TokenKind::Gt => ">",
            TokenKind::GtEq => ">=",
            TokenKind::AndAnd => "&&",
            TokenKind::OrOr => "||",
            TokenKind::Coalesce => "??",
            TokenKind::Arrow => "=>",
            _ => "?",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub offset: usize,
}

pub fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_' || c == '$'
}

pub fn is_ident_continue(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '$'
}

/// Split `source` into tokens. Offsets are byte offsets into `source`.
pub fn tokenize(source: &str) -> Result<Vec<Token>, ExpressionError> {
    let mut lexer = Lexer {
        source,
        chars: source.char_indices().peekable(),
        tokens: Vec::new(),
    };
    lexer.run()?;
    Ok(lexer.tokens)
}

struct Lexer<'a> {
    source: &'a str,
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
    tokens: Vec<Token>,
}

impl<'a> Lexer<'a> {
    fn run(&mut self) -> Result<(), ExpressionError> {
        while let Some(&(offset, c)) = self.chars.peek() {
            if c.is_whitespace() {
                self.chars.next();
                continue;
            }

            let kind = if c.is_ascii_digit() {
                self.number(offset)?
            } else if c == '"' || c == '\'' {
                self.string(offset, c)?
            } else if is_ident_start(c) {
                self.ident(offset)
            } else {
                self.chars.next();
                self.punct(offset, c)?
            };
            self.tokens.push(Token { kind, offset });
        }

        self.tokens.push(Token {
            kind: TokenKind::Eof,
            offset: self.source.len(),
        });
        Ok(())
    }

    fn eat(&mut self, expected: char) -> bool {
        if matches!(self.chars.peek(), Some(&(_, c)) if c == expected) {
            self.chars.next();
            true
        } else {
            false
        }
    }

    fn punct(&mut self, offset: usize, c: char) -> Result<TokenKind, ExpressionError> {
        let kind = match c {
            '.' => TokenKind::Dot,
            ',' => TokenKind::Comma,
            ':' => TokenKind::Colon,
            '(' => TokenKind::LParen,
            ')' => TokenKind::RParen,
            '[' => TokenKind::LBracket,
            ']' => TokenKind::RBracket,
            '{' => TokenKind::LBrace,
            '}' => TokenKind::RBrace,
            '+' => TokenKind::Plus,
            '-' => TokenKind::Minus,
            '*' => TokenKind::Star,
            '/' => TokenKind::Slash,
            '%' => TokenKind::Percent,
            '?' => {
                if self.eat('?') {
                    TokenKind::Coalesce
                } else if self.optional_chain() {
                    TokenKind::Dot
                } else {
                    TokenKind::Question
                }
            }
            '!' => {
                if self.eat('=') {
                    self.eat('=');
                    TokenKind::NotEq
                } else {
                    TokenKind::Bang
                }
            }
            '=' => {
                if self.eat('=') {
                    self.eat('=');
                    TokenKind::EqEq
                } else if self.eat('>') {
                    TokenKind::Arrow
                } else {
                    return Err(ExpressionError::syntax(
                        "assignment is not supported, use '==' to compare",
                        offset,
                    ));
                }
            }
            '<' => {
                if self.eat('=') {
                    TokenKind::LtEq
                } else {
                    TokenKind::Lt
                }
            }
            '>' => {
                if self.eat('=') {
                    TokenKind::GtEq
                } else {
                    TokenKind::Gt
                }
            }
            '&' => {
                if self.eat('&') {
                    TokenKind::AndAnd
                } else {
                    return Err(ExpressionError::syntax("bitwise '&' is not supported", offset));
                }
            }
            '|' => {
                if self.eat('|') {
                    TokenKind::OrOr
                } else {
                    return Err(ExpressionError::syntax("bitwise '|' is not supported", offset));
                }
            }
            other => {
                return Err(ExpressionError::syntax(
                    format!("unexpected character '{other}'"),
                    offset,
                ))
            }
        };
        Ok(kind)
    }

    /// `?.` is optional chaining unless followed by a digit (`a ?.5 : b`).
    /// Member access on null already yields null, so it lexes as a plain dot.
    fn optional_chain(&mut self) -> bool {
        let mut lookahead = self.chars.clone();
        match (lookahead.next(), lookahead.next()) {
            (Some((_, '.')), Some((_, next))) if !next.is_ascii_digit() => {
                self.chars.next();
                true
            }
            _ => false,
        }
    }

    fn number(&mut self, start: usize) -> Result<TokenKind, ExpressionError> {
        let mut end = start;
        let mut seen_dot = false;
        while let Some(&(i, c)) = self.chars.peek() {
            if c.is_ascii_digit() || c == '_' {
                end = i + 1;
                self.chars.next();
            } else if c == '.' && !seen_dot {
                // `1.foo` is not a number, `1.5` is.
                let mut lookahead = self.chars.clone();
                lookahead.next();
                match lookahead.peek() {
                    Some(&(_, d)) if d.is_ascii_digit() => {
                        seen_dot = true;
                        end = i + 1;
                        self.chars.next();
                    }
                    _ => break,
                }
            } else if c == 'e' || c == 'E' {
                end = i + 1;
                self.chars.next();
                if let Some(&(j, sign)) = self.chars.peek() {
                    if sign == '+' || sign == '-' {
                        end = j + 1;
                        self.chars.next();
                    }
                }
            } else {
                break;
            }
        }

        let text: String = self.source[start..end].chars().filter(|c| *c != '_').collect();
        text.parse::<f64>()
            .map(TokenKind::Number)
            .map_err(|_| ExpressionError::syntax(format!("invalid number '{text}'"), start))
    }

    fn string(&mut self, start: usize, quote: char) -> Result<TokenKind, ExpressionError> {
        self.chars.next();
        let mut out = String::new();
        loop {
            let Some((offset, c)) = self.chars.next() else {
                return Err(ExpressionError::syntax("unterminated string literal", start));
            };
            match c {
                c if c == quote => return Ok(TokenKind::Str(out)),
                '\\' => {
                    let Some((_, escaped)) = self.chars.next() else {
                        return Err(ExpressionError::syntax("unterminated string literal", start));
                    };
                    match escaped {
                        'n' => out.push('\n'),
                        't' => out.push('\t'),
                        'r' => out.push('\r'),
                        '0' => out.push('\0'),
                        'u' => out.push(self.unicode_escape(offset)?),
                        other => out.push(other),
                    }
                }
                other => out.push(other),
            }
        }
    }

    fn unicode_escape(&mut self, offset: usize) -> Result<char, ExpressionError> {
        let mut code = 0u32;
        for _ in 0..4 {
            let digit = self
                .chars
                .next()
                .and_then(|(_, c)| c.to_digit(16))
                .ok_or_else(|| ExpressionError::syntax("invalid \\u escape", offset))?;
            code = code * 16 + digit;
        }
        char::from_u32(code).ok_or_else(|| ExpressionError::syntax("invalid \\u escape", offset))
    }

    fn ident(&mut self, start: usize) -> TokenKind {
        let mut end = start;
        while let Some(&(i, c)) = self.chars.peek() {
            if is_ident_continue(c) {
                end = i + c.len_utf8();
                self.chars.next();
            } else {
                break;
            }
        }
        TokenKind::Ident(self.source[start..end].to_string())
    }
}
