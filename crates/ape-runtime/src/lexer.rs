//! Lexical analysis (tokenization)
//!
//! Single-pass scanner over the source bytes, tracking 0-based line/column
//! positions. Comments (`//` and `/* */`) are skipped; string escapes are
//! resolved here so the parser sees the final contents.

use crate::span::Pos;
use crate::token::{Token, TokenKind};

/// Lexer state for tokenizing source code
pub struct Lexer<'a> {
    src: &'a [u8],
    offset: usize,
    line: i32,
    column: i32,
}

impl<'a> Lexer<'a> {
    /// Create a new lexer for the given source code
    pub fn new(source: &'a str) -> Self {
        Self {
            src: source.as_bytes(),
            offset: 0,
            line: 0,
            column: 0,
        }
    }

    /// Tokenize the whole input. The final token is always `Eof`.
    pub fn tokenize(mut self) -> Vec<Token> {
        let mut tokens = Vec::new();
        loop {
            let token = self.next_token();
            let done = token.kind == TokenKind::Eof;
            tokens.push(token);
            if done {
                break;
            }
        }
        tokens
    }

    fn next_token(&mut self) -> Token {
        self.skip_whitespace_and_comments();

        let pos = Pos::new(self.line, self.column);
        let ch = match self.peek() {
            Some(c) => c,
            None => return Token { kind: TokenKind::Eof, pos },
        };

        let kind = match ch {
            b'+' => self.op3(b'=', TokenKind::PlusAssign, b'+', TokenKind::PlusPlus, TokenKind::Plus),
            b'-' => self.op3(b'=', TokenKind::MinusAssign, b'-', TokenKind::MinusMinus, TokenKind::Minus),
            b'*' => self.op2(b'=', TokenKind::StarAssign, TokenKind::Star),
            b'/' => self.op2(b'=', TokenKind::SlashAssign, TokenKind::Slash),
            b'%' => self.op2(b'=', TokenKind::PercentAssign, TokenKind::Percent),
            b'=' => self.op2(b'=', TokenKind::EqualEqual, TokenKind::Assign),
            b'!' => self.op2(b'=', TokenKind::BangEqual, TokenKind::Bang),
            b'<' => self.op2(b'=', TokenKind::LessEqual, TokenKind::Less),
            b'>' => self.op2(b'=', TokenKind::GreaterEqual, TokenKind::Greater),
            b'&' => self.op2(b'&', TokenKind::AndAnd, TokenKind::Illegal('&')),
            b'|' => self.op2(b'|', TokenKind::OrOr, TokenKind::Illegal('|')),
            b'(' => self.single(TokenKind::LParen),
            b')' => self.single(TokenKind::RParen),
            b'{' => self.single(TokenKind::LBrace),
            b'}' => self.single(TokenKind::RBrace),
            b'[' => self.single(TokenKind::LBracket),
            b']' => self.single(TokenKind::RBracket),
            b',' => self.single(TokenKind::Comma),
            b':' => self.single(TokenKind::Colon),
            b';' => self.single(TokenKind::Semicolon),
            b'.' => self.single(TokenKind::Dot),
            b'"' => self.read_string(),
            c if c.is_ascii_digit() => self.read_number(),
            c if c == b'_' || c.is_ascii_alphabetic() => self.read_ident(),
            c => self.single(TokenKind::Illegal(c as char)),
        };

        Token { kind, pos }
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.offset).copied()
    }

    fn peek_at(&self, ahead: usize) -> Option<u8> {
        self.src.get(self.offset + ahead).copied()
    }

    fn advance(&mut self) -> Option<u8> {
        let ch = self.peek()?;
        self.offset += 1;
        if ch == b'\n' {
            self.line += 1;
            self.column = 0;
        } else {
            self.column += 1;
        }
        Some(ch)
    }

    fn single(&mut self, kind: TokenKind) -> TokenKind {
        self.advance();
        kind
    }

    /// Consume one char, then `next` for the two-char operator or `single` otherwise.
    fn op2(&mut self, next: u8, double: TokenKind, single: TokenKind) -> TokenKind {
        self.advance();
        if self.peek() == Some(next) {
            self.advance();
            double
        } else {
            single
        }
    }

    /// Three-way operator: `x=`, `xx` or bare `x`.
    fn op3(
        &mut self,
        eq: u8,
        with_eq: TokenKind,
        twin: u8,
        with_twin: TokenKind,
        bare: TokenKind,
    ) -> TokenKind {
        self.advance();
        match self.peek() {
            Some(c) if c == eq => {
                self.advance();
                with_eq
            }
            Some(c) if c == twin => {
                self.advance();
                with_twin
            }
            _ => bare,
        }
    }

    fn skip_whitespace_and_comments(&mut self) {
        loop {
            match self.peek() {
                Some(c) if c.is_ascii_whitespace() => {
                    self.advance();
                }
                Some(b'/') if self.peek_at(1) == Some(b'/') => {
                    while let Some(c) = self.peek() {
                        if c == b'\n' {
                            break;
                        }
                        self.advance();
                    }
                }
                Some(b'/') if self.peek_at(1) == Some(b'*') => {
                    self.advance();
                    self.advance();
                    while let Some(c) = self.advance() {
                        if c == b'*' && self.peek() == Some(b'/') {
                            self.advance();
                            break;
                        }
                    }
                }
                _ => break,
            }
        }
    }

    fn read_string(&mut self) -> TokenKind {
        self.advance(); // opening quote
        let mut bytes = Vec::new();
        loop {
            match self.advance() {
                None | Some(b'"') => break,
                Some(b'\\') => match self.advance() {
                    Some(b'n') => bytes.push(b'\n'),
                    Some(b't') => bytes.push(b'\t'),
                    Some(b'"') => bytes.push(b'"'),
                    Some(b'\\') => bytes.push(b'\\'),
                    Some(other) => {
                        bytes.push(b'\\');
                        bytes.push(other);
                    }
                    None => break,
                },
                Some(c) => bytes.push(c),
            }
        }
        TokenKind::String(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn read_number(&mut self) -> TokenKind {
        let start = self.offset;
        if self.peek() == Some(b'0') && matches!(self.peek_at(1), Some(b'x') | Some(b'X')) {
            self.advance();
            self.advance();
            while matches!(self.peek(), Some(c) if c.is_ascii_hexdigit()) {
                self.advance();
            }
            let digits = &self.src[start + 2..self.offset];
            let text = std::str::from_utf8(digits).unwrap_or("");
            return match u64::from_str_radix(text, 16) {
                Ok(n) => TokenKind::Number(n as f64),
                Err(_) => TokenKind::Illegal('x'),
            };
        }

        while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
            self.advance();
        }
        if self.peek() == Some(b'.') && matches!(self.peek_at(1), Some(c) if c.is_ascii_digit()) {
            self.advance();
            while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
                self.advance();
            }
        }
        let text = std::str::from_utf8(&self.src[start..self.offset]).unwrap_or("0");
        match text.parse::<f64>() {
            Ok(n) => TokenKind::Number(n),
            Err(_) => TokenKind::Illegal('0'),
        }
    }

    fn read_ident(&mut self) -> TokenKind {
        let start = self.offset;
        while matches!(self.peek(), Some(c) if c == b'_' || c.is_ascii_alphanumeric()) {
            self.advance();
        }
        let text = std::str::from_utf8(&self.src[start..self.offset]).unwrap_or("");
        TokenKind::lookup_ident(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(input: &str) -> Vec<TokenKind> {
        Lexer::new(input).tokenize().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_operators() {
        assert_eq!(
            kinds("+ += ++ - -= -- == = != ! <= < >= > && ||"),
            vec![
                TokenKind::Plus,
                TokenKind::PlusAssign,
                TokenKind::PlusPlus,
                TokenKind::Minus,
                TokenKind::MinusAssign,
                TokenKind::MinusMinus,
                TokenKind::EqualEqual,
                TokenKind::Assign,
                TokenKind::BangEqual,
                TokenKind::Bang,
                TokenKind::LessEqual,
                TokenKind::Less,
                TokenKind::GreaterEqual,
                TokenKind::Greater,
                TokenKind::AndAnd,
                TokenKind::OrOr,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_numbers() {
        assert_eq!(
            kinds("1 2.5 0x1F"),
            vec![
                TokenKind::Number(1.0),
                TokenKind::Number(2.5),
                TokenKind::Number(31.0),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(
            kinds(r#""lorem\nipsum" "a\tb" "q\"q" "\\""#),
            vec![
                TokenKind::String("lorem\nipsum".to_string()),
                TokenKind::String("a\tb".to_string()),
                TokenKind::String("q\"q".to_string()),
                TokenKind::String("\\".to_string()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_keywords_and_idents() {
        assert_eq!(
            kinds("const var fn foo in"),
            vec![
                TokenKind::Const,
                TokenKind::Var,
                TokenKind::Fn,
                TokenKind::Ident("foo".to_string()),
                TokenKind::In,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_comments_are_skipped() {
        assert_eq!(
            kinds("1 // line\n/* block\n */ 2"),
            vec![TokenKind::Number(1.0), TokenKind::Number(2.0), TokenKind::Eof]
        );
    }

    #[test]
    fn test_positions() {
        let tokens = Lexer::new("1+1;\ncrash()").tokenize();
        // crash starts line 1, column 0; its lparen at column 5
        let crash = &tokens[4];
        assert_eq!(crash.pos, Pos::new(1, 0));
        let lparen = &tokens[5];
        assert_eq!(lparen.kind, TokenKind::LParen);
        assert_eq!(lparen.pos, Pos::new(1, 5));
    }
}
