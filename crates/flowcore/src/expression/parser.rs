//! Recursive-descent parser producing [`Expr`] trees.
//!
//! Function calls are resolved against the whitelist here, so an expression
//! that parses can only ever reach whitelisted functions.

use super::ast::{BinaryOp, Expr, ExprKind, LogicalOp, UnaryOp};
use super::functions::{self, FunctionKind};
use super::lexer::{tokenize, Token, TokenKind};
use crate::error::ExpressionError;
use crate::value::{number, Value};

type Result<T> = std::result::Result<T, ExpressionError>;

/// Context variables an expression may reference.
pub const VARIABLES: &[&str] = &[
    "$json",
    "$items",
    "$node",
    "$workflow",
    "$execution",
    "$env",
    "$now",
];

const LAMBDA_HINT: &str = "lambdas are only allowed as arguments to map, filter, find, some, every, reduce and sortBy";

/// Binding strength of the unary operators; infix levels are below it.
const UNARY_LEVEL: usize = 7;

enum Infix {
    Binary(BinaryOp),
    Logical(LogicalOp),
}

fn infix(level: usize, kind: &TokenKind) -> Option<Infix> {
    use Infix::{Binary, Logical};
    let op = match (level, kind) {
        (0, TokenKind::Coalesce) => Logical(LogicalOp::Coalesce),
        (1, TokenKind::OrOr) => Logical(LogicalOp::Or),
        (2, TokenKind::AndAnd) => Logical(LogicalOp::And),
        (3, TokenKind::EqEq) => Binary(BinaryOp::Eq),
        (3, TokenKind::NotEq) => Binary(BinaryOp::NotEq),
        (4, TokenKind::Lt) => Binary(BinaryOp::Lt),
        (4, TokenKind::LtEq) => Binary(BinaryOp::LtEq),
        (4, TokenKind::Gt) => Binary(BinaryOp::Gt),
        (4, TokenKind::GtEq) => Binary(BinaryOp::GtEq),
        (5, TokenKind::Plus) => Binary(BinaryOp::Add),
        (5, TokenKind::Minus) => Binary(BinaryOp::Sub),
        (6, TokenKind::Star) => Binary(BinaryOp::Mul),
        (6, TokenKind::Slash) => Binary(BinaryOp::Div),
        (6, TokenKind::Percent) => Binary(BinaryOp::Rem),
        _ => return None,
    };
    Some(op)
}

/// Parse one block body (the text between `{{` and `}}`).
pub fn parse(source: &str, max_depth: usize) -> Result<Expr> {
    let tokens = tokenize(source)?;
    if matches!(tokens.first().map(|t| &t.kind), Some(TokenKind::Eof)) {
        return Err(ExpressionError::syntax("empty expression", 0));
    }

    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
        max_depth,
        scopes: Vec::new(),
        lambda_slot: false,
    };
    let expr = parser.expression()?;
    let trailing = parser.peek();
    if trailing.kind != TokenKind::Eof {
        return Err(ExpressionError::syntax(
            format!("unexpected {}", trailing.kind.describe()),
            trailing.offset,
        ));
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
    max_depth: usize,
    /// Lambda parameters currently in scope, innermost last.
    scopes: Vec<String>,
    /// Set right before parsing a function argument; consumed by the first
    /// primary expression of that argument.
    lambda_slot: bool,
}

impl Parser {
    fn peek(&self) -> &Token {
        // The token list always ends with Eof and we never advance past it.
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_at(&self, ahead: usize) -> &TokenKind {
        let index = (self.pos + ahead).min(self.tokens.len() - 1);
        &self.tokens[index].kind
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if token.kind != TokenKind::Eof {
            self.pos += 1;
        }
        token
    }

    fn check(&self, kind: &TokenKind) -> bool {
        &self.peek().kind == kind
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &TokenKind, what: &str) -> Result<Token> {
        if self.check(kind) {
            return Ok(self.advance());
        }
        let found = self.peek();
        Err(ExpressionError::syntax(
            format!("expected {what}, found {}", found.kind.describe()),
            found.offset,
        ))
    }

    /// Account for one more level of tree depth.
    fn descend(&mut self, offset: usize) -> Result<()> {
        self.depth += 1;
        if self.depth > self.max_depth {
            return Err(ExpressionError::exceeded(
                format!("expression nesting exceeds {} levels", self.max_depth),
                offset,
            ));
        }
        Ok(())
    }

    fn expression(&mut self) -> Result<Expr> {
        let offset = self.peek().offset;
        self.descend(offset)?;
        let expr = self.conditional();
        self.depth -= 1;
        expr
    }

    fn conditional(&mut self) -> Result<Expr> {
        let condition = self.binary(0)?;
        if !self.eat(&TokenKind::Question) {
            return Ok(condition);
        }
        let then_branch = self.expression()?;
        self.expect(&TokenKind::Colon, "':' in conditional expression")?;
        let else_branch = self.expression()?;
        let offset = condition.offset;
        Ok(Expr::new(
            ExprKind::Conditional {
                condition: Box::new(condition),
                then_branch: Box::new(then_branch),
                else_branch: Box::new(else_branch),
            },
            offset,
        ))
    }

    fn binary(&mut self, level: usize) -> Result<Expr> {
        if level == UNARY_LEVEL {
            return self.unary();
        }

        let mut lhs = self.binary(level + 1)?;
        let mut chain = 0;
        while let Some(op) = infix(level, &self.peek().kind) {
            let offset = self.advance().offset;
            self.descend(offset)?;
            chain += 1;
            let rhs = self.binary(level + 1)?;
            let (lhs_box, rhs_box) = (Box::new(lhs), Box::new(rhs));
            let kind = match op {
                Infix::Binary(op) => ExprKind::Binary {
                    op,
                    lhs: lhs_box,
                    rhs: rhs_box,
                },
                Infix::Logical(op) => ExprKind::Logical {
                    op,
                    lhs: lhs_box,
                    rhs: rhs_box,
                },
            };
            lhs = Expr::new(kind, offset);
        }
        self.depth -= chain;
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr> {
        let op = match self.peek().kind {
            TokenKind::Bang => UnaryOp::Not,
            TokenKind::Minus => UnaryOp::Neg,
            _ => return self.postfix(),
        };
        let offset = self.advance().offset;
        self.descend(offset)?;
        let operand = self.unary();
        self.depth -= 1;
        let operand = operand?;

        if let (UnaryOp::Neg, ExprKind::Literal(Value::Number(n))) = (op, &operand.kind) {
            if let Some(f) = n.as_f64() {
                return Ok(Expr::new(ExprKind::Literal(number(-f)), offset));
            }
        }
        Ok(Expr::new(
            ExprKind::Unary {
                op,
                operand: Box::new(operand),
            },
            offset,
        ))
    }

    fn postfix(&mut self) -> Result<Expr> {
        let mut expr = self.primary()?;
        let mut chain = 0;
        loop {
            let offset = self.peek().offset;
            match self.peek().kind.clone() {
                TokenKind::Dot => {
                    self.advance();
                    self.descend(offset)?;
                    chain += 1;
                    expr = self.member(expr, offset)?;
                }
                TokenKind::LBracket => {
                    self.advance();
                    self.descend(offset)?;
                    chain += 1;
                    let index = self.expression()?;
                    self.expect(&TokenKind::RBracket, "']'")?;
                    expr = Expr::new(
                        ExprKind::Index {
                            object: Box::new(expr),
                            index: Box::new(index),
                        },
                        offset,
                    );
                }
                TokenKind::LParen => {
                    return Err(ExpressionError::forbidden(
                        "only whitelisted functions can be called",
                        offset,
                    ));
                }
                _ => break,
            }
        }
        self.depth -= chain;
        Ok(expr)
    }

    /// After a `.`: property access, numeric index or method call.
    fn member(&mut self, object: Expr, offset: usize) -> Result<Expr> {
        let token = self.advance();
        let name = match token.kind {
            TokenKind::Ident(name) => name,
            TokenKind::Number(n) if n >= 0.0 && n.fract() == 0.0 => {
                return Ok(Expr::new(
                    ExprKind::Index {
                        object: Box::new(object),
                        index: Expr::boxed(ExprKind::Literal(number(n)), token.offset),
                    },
                    offset,
                ));
            }
            other => {
                return Err(ExpressionError::syntax(
                    format!("expected property name after '.', found {}", other.describe()),
                    token.offset,
                ))
            }
        };

        if !self.check(&TokenKind::LParen) {
            return Ok(Expr::new(
                ExprKind::Member {
                    object: Box::new(object),
                    property: name,
                },
                offset,
            ));
        }

        let Some(function) = functions::lookup(&name) else {
            return Err(ExpressionError::forbidden(
                format!("method '{name}' is not allowed"),
                token.offset,
            ));
        };
        self.advance();
        let mut args = vec![object];
        args.extend(self.arguments()?);
        self.finish_call(function, args, token.offset)
    }

    fn primary(&mut self) -> Result<Expr> {
        let lambda_allowed = std::mem::take(&mut self.lambda_slot);
        let token = self.advance();
        let offset = token.offset;

        let kind = match token.kind {
            TokenKind::Number(n) => ExprKind::Literal(number(n)),
            TokenKind::Str(s) => ExprKind::Literal(Value::String(s)),
            TokenKind::Ident(name) => return self.identifier(name, offset, lambda_allowed),
            TokenKind::LParen => {
                if let Some(params) = self.lambda_params() {
                    if !lambda_allowed {
                        return Err(ExpressionError::syntax(LAMBDA_HINT, offset));
                    }
                    return self.lambda(params, offset);
                }
                let inner = self.expression()?;
                self.expect(&TokenKind::RParen, "')'")?;
                return Ok(inner);
            }
            TokenKind::LBracket => {
                let items = self.list(&TokenKind::RBracket, "']'", Self::expression)?;
                ExprKind::Array(items)
            }
            TokenKind::LBrace => ExprKind::Object(self.object_entries()?),
            other => {
                return Err(ExpressionError::syntax(
                    format!("unexpected {}", other.describe()),
                    offset,
                ))
            }
        };
        Ok(Expr::new(kind, offset))
    }

    fn identifier(&mut self, name: String, offset: usize, lambda_allowed: bool) -> Result<Expr> {
        let kind = match name.as_str() {
            "true" => ExprKind::Literal(Value::Bool(true)),
            "false" => ExprKind::Literal(Value::Bool(false)),
            "null" | "undefined" => ExprKind::Literal(Value::Null),
            var if var.starts_with('$') => {
                if !VARIABLES.contains(&var) {
                    return Err(ExpressionError::syntax(
                        format!("unknown variable '{var}'"),
                        offset,
                    ));
                }
                ExprKind::Variable(name)
            }
            _ if self.check(&TokenKind::Arrow) => {
                if !lambda_allowed {
                    return Err(ExpressionError::syntax(LAMBDA_HINT, offset));
                }
                self.advance();
                return self.lambda(vec![name], offset);
            }
            _ if self.check(&TokenKind::LParen) => {
                let Some(function) = functions::lookup(&name) else {
                    return Err(ExpressionError::forbidden(
                        format!("function '{name}' is not allowed"),
                        offset,
                    ));
                };
                self.advance();
                let args = self.arguments()?;
                return self.finish_call(function, args, offset);
            }
            local if self.scopes.iter().any(|s| s == local) => ExprKind::Local(name),
            other => {
                return Err(ExpressionError::syntax(
                    format!("unknown identifier '{other}'; context variables start with '$'"),
                    offset,
                ))
            }
        };
        Ok(Expr::new(kind, offset))
    }

    /// With the `(` consumed: if the tokens form `(a, b) =>`, consume them and
    /// return the parameter names.
    fn lambda_params(&mut self) -> Option<Vec<String>> {
        let mut params = Vec::new();
        let mut ahead = 0;
        if self.peek_at(0) != &TokenKind::RParen {
            loop {
                match self.peek_at(ahead) {
                    TokenKind::Ident(name) => params.push(name.clone()),
                    _ => return None,
                }
                ahead += 1;
                match self.peek_at(ahead) {
                    TokenKind::Comma => ahead += 1,
                    TokenKind::RParen => break,
                    _ => return None,
                }
            }
        }
        if self.peek_at(ahead + 1) != &TokenKind::Arrow {
            return None;
        }
        self.pos += ahead + 2;
        Some(params)
    }

    fn lambda(&mut self, params: Vec<String>, offset: usize) -> Result<Expr> {
        if let Some(bad) = params.iter().find(|p| p.starts_with('$')) {
            return Err(ExpressionError::syntax(
                format!("lambda parameter '{bad}' must not start with '$'"),
                offset,
            ));
        }
        let outer = self.scopes.len();
        self.scopes.extend(params.iter().cloned());
        let body = self.expression();
        self.scopes.truncate(outer);
        Ok(Expr::new(
            ExprKind::Lambda {
                params,
                body: Box::new(body?),
            },
            offset,
        ))
    }

    /// Call arguments after `(`, through the closing `)`.
    fn arguments(&mut self) -> Result<Vec<Expr>> {
        self.list(&TokenKind::RParen, "')'", |p| {
            p.lambda_slot = true;
            let arg = p.expression();
            p.lambda_slot = false;
            arg
        })
    }

    /// Comma-separated items up to `close`; a trailing comma is accepted.
    fn list(
        &mut self,
        close: &TokenKind,
        what: &str,
        mut item: impl FnMut(&mut Self) -> Result<Expr>,
    ) -> Result<Vec<Expr>> {
        let mut items = Vec::new();
        while !self.check(close) {
            items.push(item(self)?);
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(close, what)?;
        Ok(items)
    }

    fn object_entries(&mut self) -> Result<Vec<(String, Expr)>> {
        let mut entries: Vec<(String, Expr)> = Vec::new();
        while !self.check(&TokenKind::RBrace) {
            let token = self.advance();
            let key = match token.kind {
                TokenKind::Ident(name) => name,
                TokenKind::Str(s) => s,
                TokenKind::Number(n) => number(n).to_string(),
                other => {
                    return Err(ExpressionError::syntax(
                        format!("expected object key, found {}", other.describe()),
                        token.offset,
                    ))
                }
            };
            self.expect(&TokenKind::Colon, "':' after object key")?;
            let value = self.expression()?;
            // Later keys win, as in a JSON object.
            entries.retain(|(k, _)| k != &key);
            entries.push((key, value));
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(&TokenKind::RBrace, "'}'")?;
        Ok(entries)
    }

    fn finish_call(
        &self,
        function: &'static functions::Function,
        args: Vec<Expr>,
        offset: usize,
    ) -> Result<Expr> {
        let count = args.len();
        if count < function.min_args || count > function.max_args {
            let expected = match (function.min_args, function.max_args) {
                (min, max) if min == max => format!("{min}"),
                (min, usize::MAX) => format!("at least {min}"),
                (min, max) => format!("{min} to {max}"),
            };
            return Err(ExpressionError::syntax(
                format!(
                    "{}() takes {} argument(s), got {}",
                    function.name, expected, count
                ),
                offset,
            ));
        }

        let wants_lambda = matches!(function.kind, FunctionKind::HigherOrder(_));
        for (i, arg) in args.iter().enumerate() {
            let is_lambda = matches!(arg.kind, ExprKind::Lambda { .. });
            if wants_lambda && i == 1 && !is_lambda {
                return Err(ExpressionError::syntax(
                    format!("{}() expects a lambda such as `x => x` as argument 2", function.name),
                    arg.offset,
                ));
            }
            if is_lambda && !(wants_lambda && i == 1) {
                return Err(ExpressionError::syntax(LAMBDA_HINT, arg.offset));
            }
        }

        Ok(Expr::new(
            ExprKind::Call {
                function: function.name,
                args,
            },
            offset,
        ))
    }
}
