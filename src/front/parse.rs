//! The parser (§4.2): recursive descent over the token stream, producing
//! the AST. Syntax errors are line-stamped and recovered from via the
//! lookahead predicates `look_for_factor`/`look_for_statement`/
//! `look_for_type`, so one bad declaration does not stop the whole file
//! from being diagnosed; an unterminated brace or similarly unrecoverable
//! shape is a fatal parser error instead.

use crate::common::Id;
use crate::error::CompileError;

use super::ast::*;
use super::lex::{Keyword, Lexer, Token, TokenKind};

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    errors: Vec<CompileError>,
}

/// Parses a complete C* translation unit. On success, returns the AST. On
/// failure, returns every diagnostic collected while trying to recover
/// (§7: syntax errors print and continue; only truly unrecoverable input
/// aborts immediately).
pub fn parse(input: &str) -> Result<Program, Vec<CompileError>> {
    let tokens = Lexer::new(input).tokenize().map_err(|e| vec![e])?;
    let mut parser = Parser { tokens, pos: 0, errors: Vec::new() };
    let program = parser.parse_program();
    if parser.errors.is_empty() {
        Ok(program)
    } else {
        Err(parser.errors)
    }
}

impl Parser {
    fn peek(&self) -> Option<&TokenKind> {
        self.tokens.get(self.pos).map(|t| &t.kind)
    }

    fn line(&self) -> u64 {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|t| t.line)
            .unwrap_or(1)
    }

    fn advance(&mut self) -> Option<TokenKind> {
        let kind = self.tokens.get(self.pos).map(|t| t.kind.clone());
        if kind.is_some() {
            self.pos += 1;
        }
        kind
    }

    fn error(&mut self, message: impl Into<String>) {
        self.errors.push(CompileError::Parser { line: self.line(), message: message.into() });
    }

    fn fatal(&mut self, message: impl Into<String>) -> CompileError {
        CompileError::Parser { line: self.line(), message: message.into() }
    }

    fn expect(&mut self, want: &TokenKind, what: &str) -> bool {
        if self.peek() == Some(want) {
            self.advance();
            true
        } else {
            self.error(format!("expected {what}, found {:?}", self.peek()));
            false
        }
    }

    /// Consumes tokens until one that satisfies `stop`, EOF, or a token
    /// that could start a new top-level declaration — the shared resync
    /// point all three `look_for_*` helpers build on.
    fn resync_to(&mut self, stop: impl Fn(&TokenKind) -> bool) {
        while let Some(kind) = self.peek() {
            if stop(kind) {
                break;
            }
            self.advance();
        }
    }

    fn look_for_type(&mut self) {
        self.resync_to(Self::starts_type);
    }

    fn look_for_statement(&mut self) {
        self.resync_to(|k| Self::starts_statement(k) || matches!(k, TokenKind::RBrace));
    }

    fn look_for_factor(&mut self) {
        self.resync_to(|k| {
            matches!(k, TokenKind::Semicolon | TokenKind::RParen | TokenKind::Comma | TokenKind::RBrace)
        });
    }

    fn starts_type(kind: &TokenKind) -> bool {
        matches!(kind, TokenKind::Keyword(Keyword::Uint64) | TokenKind::Keyword(Keyword::Void))
    }

    fn starts_statement(kind: &TokenKind) -> bool {
        matches!(
            kind,
            TokenKind::Keyword(Keyword::If)
                | TokenKind::Keyword(Keyword::While)
                | TokenKind::Keyword(Keyword::Return)
                | TokenKind::Star
                | TokenKind::Identifier(_)
                | TokenKind::LBrace
        )
    }

    fn parse_program(&mut self) -> Program {
        let mut decls = Vec::new();
        while self.peek().is_some() {
            match self.parse_top_level_decl() {
                Ok(decl) => decls.push(decl),
                Err(_) => self.look_for_type(),
            }
        }
        Program { decls }
    }

    fn parse_type(&mut self) -> Result<Type, CompileError> {
        match self.peek() {
            Some(TokenKind::Keyword(Keyword::Void)) => {
                self.advance();
                Ok(Type::Void)
            }
            Some(TokenKind::Keyword(Keyword::Uint64)) => {
                self.advance();
                if self.peek() == Some(&TokenKind::Star) {
                    self.advance();
                    Ok(Type::Pointer)
                } else {
                    Ok(Type::Uint64)
                }
            }
            _ => Err(self.fatal("expected a type")),
        }
    }

    fn parse_ident(&mut self) -> Result<Id, CompileError> {
        match self.peek().cloned() {
            Some(TokenKind::Identifier(id)) => {
                self.advance();
                Ok(id)
            }
            _ => Err(self.fatal("expected an identifier")),
        }
    }

    fn parse_top_level_decl(&mut self) -> Result<TopLevelDecl, CompileError> {
        let line = self.line();
        let ty = self.parse_type()?;
        let name = self.parse_ident()?;

        if self.peek() == Some(&TokenKind::LParen) {
            self.advance();
            let params = self.parse_params();
            if !self.expect(&TokenKind::RParen, ")") {
                self.look_for_type();
            }
            let body = match self.peek() {
                Some(TokenKind::Semicolon) => {
                    self.advance();
                    None
                }
                Some(TokenKind::LBrace) => Some(self.parse_block()),
                _ => {
                    self.error("expected ';' or a procedure body");
                    None
                }
            };
            return Ok(TopLevelDecl::Procedure(Procedure {
                return_type: ty,
                name,
                params,
                body,
                line,
            }));
        }

        if ty == Type::Void {
            self.error("a global variable cannot have type void");
        }
        let init = if self.peek() == Some(&TokenKind::Assign) {
            self.advance();
            Some(self.parse_literal()?)
        } else {
            None
        };
        if !self.expect(&TokenKind::Semicolon, ";") {
            self.look_for_type();
        }
        Ok(TopLevelDecl::Global { ty, name, init, line })
    }

    fn parse_params(&mut self) -> Vec<(Type, Id)> {
        let mut params = Vec::new();
        if self.peek() == Some(&TokenKind::RParen) {
            return params;
        }
        loop {
            match (|this: &mut Self| -> Result<(Type, Id), CompileError> {
                let ty = this.parse_type()?;
                let name = this.parse_ident()?;
                Ok((ty, name))
            })(self)
            {
                Ok(param) => params.push(param),
                Err(_) => self.look_for_type(),
            }
            if self.peek() == Some(&TokenKind::Comma) {
                self.advance();
            } else {
                break;
            }
        }
        params
    }

    fn parse_literal(&mut self) -> Result<Literal, CompileError> {
        match self.peek().cloned() {
            Some(TokenKind::Integer(v)) => {
                self.advance();
                Ok(Literal::Integer(v))
            }
            Some(TokenKind::Minus) => {
                self.advance();
                match self.advance() {
                    Some(TokenKind::Integer(v)) => Ok(Literal::Integer(v.wrapping_neg())),
                    _ => Err(self.fatal("expected an integer after unary '-'")),
                }
            }
            Some(TokenKind::Character(c)) => {
                self.advance();
                Ok(Literal::Character(c))
            }
            _ => Err(self.fatal("expected a literal")),
        }
    }

    fn parse_block(&mut self) -> Vec<Stmt> {
        self.expect(&TokenKind::LBrace, "{");
        let mut stmts = Vec::new();
        while !matches!(self.peek(), Some(TokenKind::RBrace) | None) {
            match self.parse_statement() {
                Ok(stmt) => stmts.push(stmt),
                Err(_) => self.look_for_statement(),
            }
        }
        self.expect(&TokenKind::RBrace, "}");
        stmts
    }

    fn parse_statement(&mut self) -> Result<Stmt, CompileError> {
        let line = self.line();
        match self.peek().cloned() {
            Some(TokenKind::LBrace) => Ok(Stmt::Block(self.parse_block())),
            Some(TokenKind::Keyword(Keyword::If)) => {
                self.advance();
                self.expect(&TokenKind::LParen, "(");
                let guard = self.parse_expr()?;
                self.expect(&TokenKind::RParen, ")");
                let tt = self.parse_statement_as_block()?;
                let ff = if self.peek() == Some(&TokenKind::Keyword(Keyword::Else)) {
                    self.advance();
                    self.parse_statement_as_block()?
                } else {
                    Vec::new()
                };
                Ok(Stmt::If { guard, tt, ff, line })
            }
            Some(TokenKind::Keyword(Keyword::While)) => {
                self.advance();
                self.expect(&TokenKind::LParen, "(");
                let guard = self.parse_expr()?;
                self.expect(&TokenKind::RParen, ")");
                let body = self.parse_statement_as_block()?;
                Ok(Stmt::While { guard, body, line })
            }
            Some(TokenKind::Keyword(Keyword::Return)) => {
                self.advance();
                let value = if self.peek() != Some(&TokenKind::Semicolon) {
                    Some(self.parse_expr()?)
                } else {
                    None
                };
                self.expect(&TokenKind::Semicolon, ";");
                Ok(Stmt::Return { value, line })
            }
            Some(TokenKind::Star) => {
                self.advance();
                let address = self.parse_expr()?;
                self.expect(&TokenKind::Assign, "=");
                let value = self.parse_expr()?;
                self.expect(&TokenKind::Semicolon, ";");
                Ok(Stmt::StoreDeref { address, value, line })
            }
            Some(TokenKind::Keyword(Keyword::Uint64)) | Some(TokenKind::Keyword(Keyword::Void)) => {
                let ty = self.parse_type()?;
                let name = self.parse_ident()?;
                self.expect(&TokenKind::Semicolon, ";");
                Ok(Stmt::VarDecl { ty, name, line })
            }
            Some(TokenKind::Identifier(name)) => {
                self.advance();
                if self.peek() == Some(&TokenKind::LParen) {
                    self.advance();
                    let args = self.parse_args();
                    self.expect(&TokenKind::RParen, ")");
                    self.expect(&TokenKind::Semicolon, ";");
                    Ok(Stmt::Call { name, args, line })
                } else {
                    self.expect(&TokenKind::Assign, "=");
                    let value = self.parse_expr()?;
                    self.expect(&TokenKind::Semicolon, ";");
                    Ok(Stmt::Assign { name, value, line })
                }
            }
            _ => Err(self.fatal("expected a statement")),
        }
    }

    /// A single statement, wrapped in a one-element block unless it is
    /// already a `{ ... }` block — `if`/`while` bodies in C* need not be
    /// braced.
    fn parse_statement_as_block(&mut self) -> Result<Vec<Stmt>, CompileError> {
        match self.peek() {
            Some(TokenKind::LBrace) => Ok(self.parse_block()),
            _ => Ok(vec![self.parse_statement()?]),
        }
    }

    fn parse_args(&mut self) -> Vec<Expr> {
        let mut args = Vec::new();
        if self.peek() == Some(&TokenKind::RParen) {
            return args;
        }
        loop {
            match self.parse_expr() {
                Ok(expr) => args.push(expr),
                Err(_) => self.look_for_factor(),
            }
            if self.peek() == Some(&TokenKind::Comma) {
                self.advance();
            } else {
                break;
            }
        }
        args
    }

    fn parse_expr(&mut self) -> Result<Expr, CompileError> {
        let lhs = self.parse_simple()?;
        let op = match self.peek() {
            Some(TokenKind::Eq) => Some(BinOp::Eq),
            Some(TokenKind::Neq) => Some(BinOp::Neq),
            Some(TokenKind::Lt) => Some(BinOp::Lt),
            Some(TokenKind::Leq) => Some(BinOp::Leq),
            Some(TokenKind::Gt) => Some(BinOp::Gt),
            Some(TokenKind::Geq) => Some(BinOp::Geq),
            _ => None,
        };
        match op {
            Some(op) => {
                let line = self.line();
                self.advance();
                let rhs = self.parse_simple()?;
                Ok(Expr::BinOp { op, lhs: Box::new(lhs), rhs: Box::new(rhs), line })
            }
            None => Ok(lhs),
        }
    }

    fn parse_simple(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.parse_term()?;
        loop {
            let op = match self.peek() {
                Some(TokenKind::Plus) => BinOp::Add,
                Some(TokenKind::Minus) => BinOp::Sub,
                _ => break,
            };
            let line = self.line();
            self.advance();
            let rhs = self.parse_term()?;
            lhs = Expr::BinOp { op, lhs: Box::new(lhs), rhs: Box::new(rhs), line };
        }
        Ok(lhs)
    }

    fn parse_term(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.parse_factor()?;
        loop {
            let op = match self.peek() {
                Some(TokenKind::Star) => BinOp::Mul,
                Some(TokenKind::Slash) => BinOp::Div,
                Some(TokenKind::Percent) => BinOp::Mod,
                _ => break,
            };
            let line = self.line();
            self.advance();
            let rhs = self.parse_factor()?;
            lhs = Expr::BinOp { op, lhs: Box::new(lhs), rhs: Box::new(rhs), line };
        }
        Ok(lhs)
    }

    fn parse_factor(&mut self) -> Result<Expr, CompileError> {
        let line = self.line();
        if self.peek() == Some(&TokenKind::Minus) {
            self.advance();
            let inner = self.parse_factor()?;
            return Ok(Expr::Negate(Box::new(inner), line));
        }
        if self.peek() == Some(&TokenKind::Star) {
            self.advance();
            let inner = self.parse_factor()?;
            return Ok(Expr::Deref(Box::new(inner), line));
        }
        match self.peek().cloned() {
            Some(TokenKind::Integer(v)) => {
                self.advance();
                Ok(Expr::Literal(Literal::Integer(v), line))
            }
            Some(TokenKind::Character(c)) => {
                self.advance();
                Ok(Expr::Literal(Literal::Character(c), line))
            }
            Some(TokenKind::StringLiteral(s)) => {
                self.advance();
                Ok(Expr::StringLiteral(s, line))
            }
            Some(TokenKind::Identifier(name)) => {
                self.advance();
                if self.peek() == Some(&TokenKind::LParen) {
                    self.advance();
                    let args = self.parse_args();
                    self.expect(&TokenKind::RParen, ")");
                    Ok(Expr::Call { name, args, line })
                } else {
                    Ok(Expr::Var(name, line))
                }
            }
            Some(TokenKind::LParen) => {
                self.advance();
                // An optional leading type turns this into a cast, as in
                // `(uint64_t) x` — otherwise it's a parenthesized expr.
                let is_cast = matches!(self.peek(), Some(k) if Self::starts_type(k));
                if is_cast {
                    let ty = self.parse_type()?;
                    let expr = self.parse_expr()?;
                    self.expect(&TokenKind::RParen, ")");
                    Ok(Expr::Cast { ty, expr: Box::new(expr), line })
                } else {
                    let expr = self.parse_expr()?;
                    self.expect(&TokenKind::RParen, ")");
                    Ok(expr)
                }
            }
            _ => Err(self.fatal(format!("expected a factor, found {:?}", self.peek()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_trivial_main() {
        let prog = parse("uint64_t main() { return 42; }").unwrap();
        assert_eq!(prog.decls.len(), 1);
        match &prog.decls[0] {
            TopLevelDecl::Procedure(p) => {
                assert_eq!(p.name, Id::from("main".to_string()));
                assert!(p.body.is_some());
            }
            _ => panic!("expected a procedure"),
        }
    }

    #[test]
    fn parses_global_with_initializer() {
        let prog = parse("uint64_t x = 5;").unwrap();
        match &prog.decls[0] {
            TopLevelDecl::Global { name, init, .. } => {
                assert_eq!(*name, Id::from("x".to_string()));
                assert!(matches!(init, Some(Literal::Integer(5))));
            }
            _ => panic!("expected a global"),
        }
    }

    #[test]
    fn parses_pointer_deref_assignment() {
        let prog = parse(
            "uint64_t main() { uint64_t *p; p = malloc(8); *p = 7; return *p; }",
        )
        .unwrap();
        let TopLevelDecl::Procedure(p) = &prog.decls[0] else { panic!() };
        let body = p.body.as_ref().unwrap();
        assert!(matches!(body[2], Stmt::StoreDeref { .. }));
    }

    #[test]
    fn reports_syntax_error_and_recovers() {
        let err = parse("uint64_t x = ;\nuint64_t main() { return 0; }").unwrap_err();
        assert!(!err.is_empty());
    }

    #[test]
    fn comparison_binds_looser_than_arithmetic() {
        let prog = parse("uint64_t main() { return 1 + 2 < 3 * 4; }").unwrap();
        let TopLevelDecl::Procedure(p) = &prog.decls[0] else { panic!() };
        match &p.body.as_ref().unwrap()[0] {
            Stmt::Return { value: Some(Expr::BinOp { op: BinOp::Lt, .. }), .. } => {}
            other => panic!("unexpected shape: {other:?}"),
        }
    }
}
