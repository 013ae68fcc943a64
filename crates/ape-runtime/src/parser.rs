//! Pratt parser producing the AST
//!
//! Statements are terminated by optional semicolons. The parser performs a
//! handful of desugarings so the compiler sees a single assignment form:
//! `a.b` becomes `a["b"]`, compound assignment becomes read-modify-write,
//! postfix `++`/`--` becomes `x = x ± 1`, and `fn name(...)` declarations
//! become `const name = fn(...)`.

use crate::ast::*;
use crate::error::ApeError;
use crate::lexer::Lexer;
use crate::span::Pos;
use crate::token::{Token, TokenKind};

/// Binding powers, weakest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    Lowest,
    Assign,
    LogicalOr,
    LogicalAnd,
    Equals,
    LessGreater,
    Sum,
    Product,
    Prefix,
    Postfix,
    Call,
}

fn precedence_of(kind: &TokenKind) -> Precedence {
    match kind {
        TokenKind::Assign
        | TokenKind::PlusAssign
        | TokenKind::MinusAssign
        | TokenKind::StarAssign
        | TokenKind::SlashAssign
        | TokenKind::PercentAssign => Precedence::Assign,
        TokenKind::OrOr => Precedence::LogicalOr,
        TokenKind::AndAnd => Precedence::LogicalAnd,
        TokenKind::EqualEqual | TokenKind::BangEqual => Precedence::Equals,
        TokenKind::Less | TokenKind::LessEqual | TokenKind::Greater | TokenKind::GreaterEqual => {
            Precedence::LessGreater
        }
        TokenKind::Plus | TokenKind::Minus => Precedence::Sum,
        TokenKind::Star | TokenKind::Slash | TokenKind::Percent => Precedence::Product,
        TokenKind::PlusPlus | TokenKind::MinusMinus => Precedence::Postfix,
        TokenKind::LParen | TokenKind::LBracket | TokenKind::Dot => Precedence::Call,
        _ => Precedence::Lowest,
    }
}

/// Parser over a token stream
pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    /// Create a parser for the given source text
    pub fn new(source: &str) -> Self {
        Self {
            tokens: Lexer::new(source).tokenize(),
            pos: 0,
        }
    }

    /// Parse a whole program
    pub fn parse_program(&mut self) -> Result<Vec<Stmt>, ApeError> {
        let mut statements = Vec::new();
        loop {
            self.skip_semicolons();
            if self.cur_kind() == &TokenKind::Eof {
                break;
            }
            statements.push(self.parse_statement()?);
        }
        Ok(statements)
    }

    // ── Token helpers ─────────────────────────────────────────────────────

    fn cur(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn cur_kind(&self) -> &TokenKind {
        &self.cur().kind
    }

    fn cur_pos(&self) -> Pos {
        self.cur().pos
    }

    fn peek_kind(&self, ahead: usize) -> &TokenKind {
        let idx = (self.pos + ahead).min(self.tokens.len() - 1);
        &self.tokens[idx].kind
    }

    fn advance(&mut self) -> Token {
        let token = self.cur().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, kind: TokenKind) -> Result<Token, ApeError> {
        if self.cur_kind() == &kind {
            Ok(self.advance())
        } else {
            Err(ApeError::parse(
                format!("expected '{}', got '{}'", kind, self.cur_kind()),
                self.cur_pos(),
            ))
        }
    }

    fn expect_ident(&mut self) -> Result<Ident, ApeError> {
        let pos = self.cur_pos();
        match self.cur_kind().clone() {
            TokenKind::Ident(name) => {
                self.advance();
                Ok(Ident { name, pos })
            }
            other => Err(ApeError::parse(
                format!("expected identifier, got '{}'", other),
                pos,
            )),
        }
    }

    fn skip_semicolons(&mut self) {
        while self.cur_kind() == &TokenKind::Semicolon {
            self.advance();
        }
    }

    // ── Statements ────────────────────────────────────────────────────────

    fn parse_statement(&mut self) -> Result<Stmt, ApeError> {
        let stmt = match self.cur_kind() {
            TokenKind::Const => self.parse_define(false)?,
            TokenKind::Var => self.parse_define(true)?,
            TokenKind::Fn if matches!(self.peek_kind(1), TokenKind::Ident(_)) => {
                self.parse_fn_statement()?
            }
            TokenKind::If => self.parse_if_statement()?,
            TokenKind::While => self.parse_while_statement()?,
            TokenKind::For => self.parse_for_statement()?,
            TokenKind::Return => self.parse_return_statement()?,
            TokenKind::Break => {
                let pos = self.advance().pos;
                Stmt::new(StmtKind::Break, pos)
            }
            TokenKind::Continue => {
                let pos = self.advance().pos;
                Stmt::new(StmtKind::Continue, pos)
            }
            TokenKind::Recover => self.parse_recover_statement()?,
            TokenKind::LBrace => {
                let block = self.parse_block()?;
                let pos = block.pos;
                Stmt::new(StmtKind::Block(block), pos)
            }
            _ => {
                let expr = self.parse_expression(Precedence::Lowest)?;
                let pos = expr.pos;
                Stmt::new(StmtKind::Expression(expr), pos)
            }
        };
        self.skip_semicolons();
        Ok(stmt)
    }

    fn parse_define(&mut self, assignable: bool) -> Result<Stmt, ApeError> {
        let pos = self.advance().pos; // const / var
        let name = self.expect_ident()?;
        self.expect(TokenKind::Assign)?;
        let mut value = self.parse_expression(Precedence::Lowest)?;
        // Name function literals after the binding so they can recurse.
        if let ExprKind::FnLit(fn_lit) = &mut value.kind {
            if fn_lit.name.is_none() {
                fn_lit.name = Some(name.name.clone());
            }
        }
        Ok(Stmt::new(StmtKind::Define { name, value, assignable }, pos))
    }

    fn parse_fn_statement(&mut self) -> Result<Stmt, ApeError> {
        let pos = self.cur_pos();
        self.advance(); // fn
        let name = self.expect_ident()?;
        let fn_lit = self.parse_fn_tail(Some(name.name.clone()))?;
        let value = Expr::new(ExprKind::FnLit(fn_lit), pos);
        Ok(Stmt::new(
            StmtKind::Define {
                name,
                value,
                assignable: false,
            },
            pos,
        ))
    }

    fn parse_if_statement(&mut self) -> Result<Stmt, ApeError> {
        let pos = self.advance().pos; // if
        self.expect(TokenKind::LParen)?;
        let cond = self.parse_expression(Precedence::Lowest)?;
        self.expect(TokenKind::RParen)?;
        let body = self.parse_block()?;
        let mut cases = vec![IfCase { cond, body }];
        let mut alternative = None;

        while self.cur_kind() == &TokenKind::Else {
            self.advance();
            if self.cur_kind() == &TokenKind::If {
                self.advance();
                self.expect(TokenKind::LParen)?;
                let cond = self.parse_expression(Precedence::Lowest)?;
                self.expect(TokenKind::RParen)?;
                let body = self.parse_block()?;
                cases.push(IfCase { cond, body });
            } else {
                alternative = Some(self.parse_block()?);
                break;
            }
        }

        Ok(Stmt::new(StmtKind::If { cases, alternative }, pos))
    }

    fn parse_while_statement(&mut self) -> Result<Stmt, ApeError> {
        let pos = self.advance().pos; // while
        self.expect(TokenKind::LParen)?;
        let cond = self.parse_expression(Precedence::Lowest)?;
        self.expect(TokenKind::RParen)?;
        let body = self.parse_block()?;
        Ok(Stmt::new(StmtKind::While { cond, body }, pos))
    }

    fn parse_for_statement(&mut self) -> Result<Stmt, ApeError> {
        let pos = self.advance().pos; // for
        self.expect(TokenKind::LParen)?;

        // `for (item in ...)` vs `for (init; test; update)`
        if matches!(self.cur_kind(), TokenKind::Ident(_)) && self.peek_kind(1) == &TokenKind::In {
            let item = self.expect_ident()?;
            self.advance(); // in
            let source = self.parse_expression(Precedence::Lowest)?;
            self.expect(TokenKind::RParen)?;
            let body = self.parse_block()?;
            return Ok(Stmt::new(StmtKind::Foreach { item, source, body }, pos));
        }

        let init = if self.cur_kind() == &TokenKind::Semicolon {
            None
        } else {
            let stmt = match self.cur_kind() {
                TokenKind::Const => self.parse_define(false)?,
                TokenKind::Var => self.parse_define(true)?,
                _ => {
                    let expr = self.parse_expression(Precedence::Lowest)?;
                    let expr_pos = expr.pos;
                    Stmt::new(StmtKind::Expression(expr), expr_pos)
                }
            };
            Some(Box::new(stmt))
        };
        self.expect(TokenKind::Semicolon)?;

        let test = if self.cur_kind() == &TokenKind::Semicolon {
            None
        } else {
            Some(self.parse_expression(Precedence::Lowest)?)
        };
        self.expect(TokenKind::Semicolon)?;

        let update = if self.cur_kind() == &TokenKind::RParen {
            None
        } else {
            Some(self.parse_expression(Precedence::Lowest)?)
        };
        self.expect(TokenKind::RParen)?;

        let body = self.parse_block()?;
        Ok(Stmt::new(
            StmtKind::For {
                init,
                test,
                update,
                body,
            },
            pos,
        ))
    }

    fn parse_return_statement(&mut self) -> Result<Stmt, ApeError> {
        let pos = self.advance().pos; // return
        let value = match self.cur_kind() {
            TokenKind::Semicolon | TokenKind::RBrace | TokenKind::Eof => None,
            _ => Some(self.parse_expression(Precedence::Lowest)?),
        };
        Ok(Stmt::new(StmtKind::Return(value), pos))
    }

    fn parse_recover_statement(&mut self) -> Result<Stmt, ApeError> {
        let pos = self.advance().pos; // recover
        self.expect(TokenKind::LParen)?;
        let error_ident = self.expect_ident()?;
        self.expect(TokenKind::RParen)?;
        let body = self.parse_block()?;
        Ok(Stmt::new(StmtKind::Recover { error_ident, body }, pos))
    }

    fn parse_block(&mut self) -> Result<Block, ApeError> {
        let pos = self.expect(TokenKind::LBrace)?.pos;
        let mut statements = Vec::new();
        loop {
            self.skip_semicolons();
            match self.cur_kind() {
                TokenKind::RBrace => {
                    self.advance();
                    break;
                }
                TokenKind::Eof => {
                    return Err(ApeError::parse("unterminated block", self.cur_pos()));
                }
                _ => statements.push(self.parse_statement()?),
            }
        }
        Ok(Block { statements, pos })
    }

    // ── Expressions ───────────────────────────────────────────────────────

    fn parse_expression(&mut self, precedence: Precedence) -> Result<Expr, ApeError> {
        let mut left = self.parse_prefix()?;
        while precedence_of(self.cur_kind()) > precedence {
            left = self.parse_infix(left)?;
        }
        Ok(left)
    }

    fn parse_prefix(&mut self) -> Result<Expr, ApeError> {
        let pos = self.cur_pos();
        match self.cur_kind().clone() {
            TokenKind::Number(n) => {
                self.advance();
                Ok(Expr::new(ExprKind::NumberLit(n), pos))
            }
            TokenKind::String(s) => {
                self.advance();
                Ok(Expr::new(ExprKind::StringLit(s), pos))
            }
            TokenKind::True => {
                self.advance();
                Ok(Expr::new(ExprKind::BoolLit(true), pos))
            }
            TokenKind::False => {
                self.advance();
                Ok(Expr::new(ExprKind::BoolLit(false), pos))
            }
            TokenKind::Null => {
                self.advance();
                Ok(Expr::new(ExprKind::NullLit, pos))
            }
            TokenKind::Ident(name) => {
                self.advance();
                Ok(Expr::new(ExprKind::Ident(name), pos))
            }
            TokenKind::Minus => {
                self.advance();
                let right = self.parse_expression(Precedence::Prefix)?;
                Ok(Expr::new(
                    ExprKind::Prefix {
                        op: PrefixOp::Minus,
                        right: Box::new(right),
                    },
                    pos,
                ))
            }
            TokenKind::Bang => {
                self.advance();
                let right = self.parse_expression(Precedence::Prefix)?;
                Ok(Expr::new(
                    ExprKind::Prefix {
                        op: PrefixOp::Bang,
                        right: Box::new(right),
                    },
                    pos,
                ))
            }
            TokenKind::LParen => {
                self.advance();
                let expr = self.parse_expression(Precedence::Lowest)?;
                self.expect(TokenKind::RParen)?;
                Ok(expr)
            }
            TokenKind::LBracket => self.parse_array_literal(),
            TokenKind::LBrace => self.parse_map_literal(),
            TokenKind::Fn => {
                self.advance();
                let fn_lit = self.parse_fn_tail(None)?;
                Ok(Expr::new(ExprKind::FnLit(fn_lit), pos))
            }
            other => Err(ApeError::parse(
                format!("unexpected token '{}'", other),
                pos,
            )),
        }
    }

    fn parse_infix(&mut self, left: Expr) -> Result<Expr, ApeError> {
        let op_pos = self.cur_pos();
        match self.cur_kind().clone() {
            TokenKind::Plus => self.parse_binary(left, InfixOp::Add, op_pos),
            TokenKind::Minus => self.parse_binary(left, InfixOp::Sub, op_pos),
            TokenKind::Star => self.parse_binary(left, InfixOp::Mul, op_pos),
            TokenKind::Slash => self.parse_binary(left, InfixOp::Div, op_pos),
            TokenKind::Percent => self.parse_binary(left, InfixOp::Mod, op_pos),
            TokenKind::EqualEqual => self.parse_binary(left, InfixOp::Equal, op_pos),
            TokenKind::BangEqual => self.parse_binary(left, InfixOp::NotEqual, op_pos),
            TokenKind::Greater => self.parse_binary(left, InfixOp::GreaterThan, op_pos),
            TokenKind::GreaterEqual => self.parse_binary(left, InfixOp::GreaterThanEqual, op_pos),
            TokenKind::Less => self.parse_binary(left, InfixOp::LessThan, op_pos),
            TokenKind::LessEqual => self.parse_binary(left, InfixOp::LessThanEqual, op_pos),
            TokenKind::AndAnd => self.parse_logical(left, LogicalOp::And, op_pos),
            TokenKind::OrOr => self.parse_logical(left, LogicalOp::Or, op_pos),
            TokenKind::Assign => {
                self.advance();
                let value = self.parse_expression(Precedence::Lowest)?;
                self.make_assign(left, value, op_pos)
            }
            TokenKind::PlusAssign => self.parse_compound_assign(left, InfixOp::Add, op_pos),
            TokenKind::MinusAssign => self.parse_compound_assign(left, InfixOp::Sub, op_pos),
            TokenKind::StarAssign => self.parse_compound_assign(left, InfixOp::Mul, op_pos),
            TokenKind::SlashAssign => self.parse_compound_assign(left, InfixOp::Div, op_pos),
            TokenKind::PercentAssign => self.parse_compound_assign(left, InfixOp::Mod, op_pos),
            TokenKind::PlusPlus => self.parse_postfix(left, InfixOp::Add, op_pos),
            TokenKind::MinusMinus => self.parse_postfix(left, InfixOp::Sub, op_pos),
            TokenKind::LParen => {
                self.advance();
                let mut args = Vec::new();
                if self.cur_kind() != &TokenKind::RParen {
                    args.push(self.parse_expression(Precedence::Lowest)?);
                    while self.cur_kind() == &TokenKind::Comma {
                        self.advance();
                        args.push(self.parse_expression(Precedence::Lowest)?);
                    }
                }
                self.expect(TokenKind::RParen)?;
                Ok(Expr::new(
                    ExprKind::Call {
                        function: Box::new(left),
                        args,
                    },
                    op_pos,
                ))
            }
            TokenKind::LBracket => {
                self.advance();
                let index = self.parse_expression(Precedence::Lowest)?;
                self.expect(TokenKind::RBracket)?;
                Ok(Expr::new(
                    ExprKind::Index {
                        left: Box::new(left),
                        index: Box::new(index),
                    },
                    op_pos,
                ))
            }
            TokenKind::Dot => {
                self.advance();
                let field = self.expect_ident()?;
                let index = Expr::new(ExprKind::StringLit(field.name), field.pos);
                Ok(Expr::new(
                    ExprKind::Index {
                        left: Box::new(left),
                        index: Box::new(index),
                    },
                    op_pos,
                ))
            }
            other => Err(ApeError::parse(
                format!("unexpected token '{}'", other),
                op_pos,
            )),
        }
    }

    fn parse_binary(&mut self, left: Expr, op: InfixOp, pos: Pos) -> Result<Expr, ApeError> {
        let precedence = precedence_of(self.cur_kind());
        self.advance();
        let right = self.parse_expression(precedence)?;
        Ok(Expr::new(
            ExprKind::Infix {
                op,
                left: Box::new(left),
                right: Box::new(right),
            },
            pos,
        ))
    }

    fn parse_logical(&mut self, left: Expr, op: LogicalOp, pos: Pos) -> Result<Expr, ApeError> {
        let precedence = precedence_of(self.cur_kind());
        self.advance();
        let right = self.parse_expression(precedence)?;
        Ok(Expr::new(
            ExprKind::Logical {
                op,
                left: Box::new(left),
                right: Box::new(right),
            },
            pos,
        ))
    }

    /// `x <op>= e` desugars to `x = x <op> e`
    fn parse_compound_assign(
        &mut self,
        left: Expr,
        op: InfixOp,
        pos: Pos,
    ) -> Result<Expr, ApeError> {
        self.advance();
        let rhs = self.parse_expression(Precedence::Lowest)?;
        let value = Expr::new(
            ExprKind::Infix {
                op,
                left: Box::new(left.clone()),
                right: Box::new(rhs),
            },
            pos,
        );
        self.make_assign(left, value, pos)
    }

    /// `x++` / `x--` desugar to `x = x ± 1`
    fn parse_postfix(&mut self, left: Expr, op: InfixOp, pos: Pos) -> Result<Expr, ApeError> {
        self.advance();
        let one = Expr::new(ExprKind::NumberLit(1.0), pos);
        let value = Expr::new(
            ExprKind::Infix {
                op,
                left: Box::new(left.clone()),
                right: Box::new(one),
            },
            pos,
        );
        self.make_assign(left, value, pos)
    }

    fn make_assign(&self, target: Expr, value: Expr, pos: Pos) -> Result<Expr, ApeError> {
        match target.kind {
            ExprKind::Ident(_) | ExprKind::Index { .. } => Ok(Expr::new(
                ExprKind::Assign {
                    target: Box::new(target),
                    value: Box::new(value),
                },
                pos,
            )),
            _ => Err(ApeError::parse("invalid assignment target", target.pos)),
        }
    }

    fn parse_array_literal(&mut self) -> Result<Expr, ApeError> {
        let pos = self.advance().pos; // [
        let mut elements = Vec::new();
        if self.cur_kind() != &TokenKind::RBracket {
            elements.push(self.parse_expression(Precedence::Lowest)?);
            while self.cur_kind() == &TokenKind::Comma {
                self.advance();
                if self.cur_kind() == &TokenKind::RBracket {
                    break; // trailing comma
                }
                elements.push(self.parse_expression(Precedence::Lowest)?);
            }
        }
        self.expect(TokenKind::RBracket)?;
        Ok(Expr::new(ExprKind::ArrayLit(elements), pos))
    }

    fn parse_map_literal(&mut self) -> Result<Expr, ApeError> {
        let pos = self.advance().pos; // {
        let mut entries = Vec::new();
        if self.cur_kind() != &TokenKind::RBrace {
            loop {
                let key = self.parse_map_key()?;
                self.expect(TokenKind::Colon)?;
                let value = self.parse_expression(Precedence::Lowest)?;
                entries.push((key, value));
                if self.cur_kind() == &TokenKind::Comma {
                    self.advance();
                    if self.cur_kind() == &TokenKind::RBrace {
                        break; // trailing comma
                    }
                } else {
                    break;
                }
            }
        }
        self.expect(TokenKind::RBrace)?;
        Ok(Expr::new(ExprKind::MapLit(entries), pos))
    }

    /// A bare identifier key is shorthand for a string key: `{a: 1}` ≡ `{"a": 1}`
    fn parse_map_key(&mut self) -> Result<Expr, ApeError> {
        let pos = self.cur_pos();
        if let TokenKind::Ident(name) = self.cur_kind().clone() {
            if self.peek_kind(1) == &TokenKind::Colon {
                self.advance();
                return Ok(Expr::new(ExprKind::StringLit(name), pos));
            }
        }
        self.parse_expression(Precedence::Lowest)
    }

    /// Parameter list and body, after the `fn` keyword (and optional name)
    fn parse_fn_tail(&mut self, name: Option<String>) -> Result<FnLit, ApeError> {
        self.expect(TokenKind::LParen)?;
        let mut params = Vec::new();
        if self.cur_kind() != &TokenKind::RParen {
            params.push(self.expect_ident()?);
            while self.cur_kind() == &TokenKind::Comma {
                self.advance();
                params.push(self.expect_ident()?);
            }
        }
        self.expect(TokenKind::RParen)?;
        let body = self.parse_block()?;
        Ok(FnLit { name, params, body })
    }
}

/// Parse source text into a program
pub fn parse(source: &str) -> Result<Vec<Stmt>, ApeError> {
    Parser::new(source).parse_program()
}
