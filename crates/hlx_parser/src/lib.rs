use hlx_ast::*;
use hlx_lexer::{Lexer, Span, SpannedToken, Token};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct ParseError {
    pub message: String,
    pub span: Span,
}

pub type ParseResult<T> = Result<T, ParseError>;

/// Best-effort tree plus everything reported while building it
#[derive(Debug)]
pub struct ParseOutput {
    pub file: SourceFile,
    pub errors: Vec<ParseError>,
}

impl ParseOutput {
    /// False as soon as any error was reported, even if the tree looks complete
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Recursive-descent parser over a pull-based token stream with one token of lookahead.
///
/// Productions return `Err` at the first malformed token. Blocks and the top level
/// are the recovery points: they record the error, `synchronize`, and keep going.
pub struct Parser<'src> {
    lexer: Lexer<'src>,
    next: SpannedToken,
    errors: Vec<ParseError>,
}

impl<'src> Parser<'src> {
    pub fn new(source: &'src str) -> Self {
        let mut lexer = Lexer::new(source);
        let next = lexer.next_token();
        Self {
            lexer,
            next,
            errors: Vec::new(),
        }
    }

    pub fn parse(source: &str) -> ParseOutput {
        let mut parser = Parser::new(source);
        let (file, _) = parser.parse_source_file();
        ParseOutput {
            file,
            errors: parser.errors,
        }
    }

    pub fn errors(&self) -> &[ParseError] {
        &self.errors
    }

    // === Token Access ===

    fn peek(&self) -> &Token {
        &self.next.token
    }

    fn peek_span(&self) -> Span {
        self.next.span
    }

    fn advance(&mut self) -> SpannedToken {
        let following = self.lexer.next_token();
        std::mem::replace(&mut self.next, following)
    }

    fn is_at_end(&self) -> bool {
        matches!(self.peek(), Token::Eof)
    }

    fn check(&self, token: &Token) -> bool {
        std::mem::discriminant(self.peek()) == std::mem::discriminant(token)
    }

    fn error_here(&self, message: &str) -> ParseError {
        ParseError {
            message: message.to_string(),
            span: self.peek_span(),
        }
    }

    fn expect(&mut self, expected: Token, message: &str) -> ParseResult<SpannedToken> {
        if self.check(&expected) {
            Ok(self.advance())
        } else {
            Err(self.error_here(message))
        }
    }

    fn expect_ident(&mut self, message: &str) -> ParseResult<Ident> {
        match self.peek().clone() {
            Token::Ident(name) => {
                let span = self.advance().span;
                Ok(Ident::new(name, span))
            }
            _ => Err(self.error_here(message)),
        }
    }

    // === Error Recovery ===

    fn report(&mut self, error: ParseError) {
        // An unclosed block fails both the block and its function at the same token.
        if self.errors.last() == Some(&error) {
            return;
        }
        self.errors.push(error);
    }

    /// Skip to a point where parsing can resume: EOF, the next `fn`, a `;` at
    /// brace depth 0 (consumed), or a `}` closing depth 0 (kept) or depth 1 (consumed).
    fn synchronize(&mut self) {
        let mut braces = 0usize;
        loop {
            match self.peek() {
                Token::LBrace => braces += 1,
                Token::RBrace => {
                    if braces == 0 {
                        break;
                    }
                    if braces == 1 {
                        self.advance();
                        break;
                    }
                    braces -= 1;
                }
                Token::Semi if braces == 0 => {
                    self.advance();
                    break;
                }
                Token::Fn | Token::Eof => break,
                _ => {}
            }
            self.advance();
        }
    }

    // === Parsing ===

    /// Parse every function in the file. The flag is false if anything was reported.
    pub fn parse_source_file(&mut self) -> (SourceFile, bool) {
        let mut functions = Vec::new();

        while !self.is_at_end() {
            if !self.check(&Token::Fn) {
                let error = self.error_here("only function definitions are allowed on the top level");
                self.report(error);
                let stuck_at = self.peek_span();
                self.synchronize();
                // A stray `}` at depth 0 stops the scan without consuming anything.
                if self.peek_span() == stuck_at && !self.is_at_end() {
                    self.advance();
                }
                continue;
            }

            match self.parse_function_decl() {
                Ok(function) => functions.push(function),
                Err(error) => {
                    self.report(error);
                    self.synchronize();
                }
            }
        }

        debug!(
            functions = functions.len(),
            errors = self.errors.len(),
            "parsed source file"
        );
        (SourceFile { functions }, self.errors.is_empty())
    }

    fn parse_function_decl(&mut self) -> ParseResult<FunctionDecl> {
        let start = self.advance().span; // fn
        let name = self.expect_ident("expected identifier")?;
        let params = self.parse_param_list()?;

        self.expect(Token::Colon, "expected ':'")?;
        let return_type = self.parse_type()?;

        if !self.check(&Token::LBrace) {
            return Err(self.error_here("expected function body"));
        }
        let body = self.parse_block()?;
        let span = start.to(body.span);

        Ok(FunctionDecl {
            name,
            params,
            return_type,
            body,
            span,
        })
    }

    fn parse_param_list(&mut self) -> ParseResult<Vec<ParamDecl>> {
        self.expect(Token::LParen, "expected '('")?;

        let mut params = Vec::new();
        while !self.check(&Token::RParen) {
            let name = self.expect_ident("expected parameter declaration")?;
            self.expect(Token::Colon, "expected ':'")?;
            let ty = self.parse_type()?;
            let span = name.span.to(ty.span);
            params.push(ParamDecl { name, ty, span });

            if !self.check(&Token::Comma) {
                break;
            }
            self.advance();
        }

        self.expect(Token::RParen, "expected ')'")?;
        Ok(params)
    }

    fn parse_type(&mut self) -> ParseResult<TypeSpec> {
        let kind = match self.peek() {
            Token::Void => TypeKind::Void,
            Token::NumberType => TypeKind::Number,
            Token::Ident(name) => TypeKind::Custom(name.clone()),
            _ => return Err(self.error_here("expected type specifier")),
        };
        let span = self.advance().span;
        Ok(TypeSpec { kind, span })
    }

    fn parse_block(&mut self) -> ParseResult<Block> {
        let start = self.advance().span; // {

        let mut stmts = Vec::new();
        loop {
            match self.peek() {
                Token::RBrace => break,
                Token::Eof | Token::Fn => {
                    return Err(self.error_here("expected '}' at the end of the block"));
                }
                _ => {}
            }

            match self.parse_stmt() {
                Ok(stmt) => stmts.push(stmt),
                Err(error) => {
                    self.report(error);
                    self.synchronize();
                }
            }
        }

        let end = self.advance(); // }
        Ok(Block {
            stmts,
            span: start.to(end.span),
        })
    }

    fn parse_stmt(&mut self) -> ParseResult<Stmt> {
        match self.peek() {
            Token::If => self.parse_if_stmt().map(Stmt::If),
            Token::While => self.parse_while_stmt().map(Stmt::While),
            Token::Return => self.parse_return_stmt().map(Stmt::Return),
            Token::Let | Token::Var => self.parse_decl_stmt().map(Stmt::Decl),
            _ => self.parse_expr_or_assignment(),
        }
    }

    fn parse_if_stmt(&mut self) -> ParseResult<IfStmt> {
        let start = self.advance().span; // if
        let condition = self.parse_expr()?;

        if !self.check(&Token::LBrace) {
            return Err(self.error_here("expected if body"));
        }
        let then_block = self.parse_block()?;
        let mut span = start.to(then_block.span);

        let else_block = if self.check(&Token::Else) {
            self.advance();
            let block = if self.check(&Token::If) {
                let nested = self.parse_if_stmt()?;
                let nested_span = nested.span;
                Block {
                    stmts: vec![Stmt::If(nested)],
                    span: nested_span,
                }
            } else {
                if !self.check(&Token::LBrace) {
                    return Err(self.error_here("expected else body"));
                }
                self.parse_block()?
            };
            span = span.to(block.span);
            Some(block)
        } else {
            None
        };

        Ok(IfStmt {
            condition,
            then_block,
            else_block,
            span,
        })
    }

    fn parse_while_stmt(&mut self) -> ParseResult<WhileStmt> {
        let start = self.advance().span; // while
        let condition = self.parse_expr()?;

        if !self.check(&Token::LBrace) {
            return Err(self.error_here("expected 'while' body"));
        }
        let body = self.parse_block()?;
        let span = start.to(body.span);

        Ok(WhileStmt {
            condition,
            body,
            span,
        })
    }

    fn parse_return_stmt(&mut self) -> ParseResult<ReturnStmt> {
        let start = self.advance().span; // return

        let value = if self.check(&Token::Semi) {
            None
        } else {
            Some(self.parse_expr()?)
        };

        let end = self.expect(Token::Semi, "expected ';' at the end of a return statement")?;
        Ok(ReturnStmt {
            value,
            span: start.to(end.span),
        })
    }

    fn parse_decl_stmt(&mut self) -> ParseResult<DeclStmt> {
        let keyword = self.advance();
        let is_mutable = matches!(keyword.token, Token::Var);

        let name = self.expect_ident("expected identifier")?;

        let ty = if self.check(&Token::Colon) {
            self.advance();
            Some(self.parse_type()?)
        } else {
            None
        };

        let init = if self.check(&Token::Eq) {
            self.advance();
            Some(self.parse_expr()?)
        } else {
            None
        };

        let var_end = init
            .as_ref()
            .map(|e| e.span)
            .or(ty.as_ref().map(|t| t.span))
            .unwrap_or(name.span);
        let var_span = name.span.to(var_end);

        let end = self.expect(Token::Semi, "expected ';' after declaration")?;

        Ok(DeclStmt {
            var: VarDecl {
                name,
                ty,
                is_mutable,
                init,
                span: var_span,
            },
            span: keyword.span.to(end.span),
        })
    }

    fn parse_expr_or_assignment(&mut self) -> ParseResult<Stmt> {
        let expr = self.parse_expr()?;

        if self.check(&Token::Eq) {
            let lhs_span = expr.span;
            let ExprKind::DeclRef(target) = expr.kind else {
                return Err(ParseError {
                    message: "expected variable on the LHS of an assignment".to_string(),
                    span: lhs_span,
                });
            };
            self.advance(); // =
            let value = self.parse_expr()?;
            self.expect(Token::Semi, "expected ';' at the end of assignment")?;
            let span = target.span.to(value.span);
            return Ok(Stmt::Assign(Assignment {
                target,
                value,
                span,
            }));
        }

        self.expect(Token::Semi, "expected ';' at the end of expression")?;
        Ok(Stmt::Expr(expr))
    }

    // === Expression Parsing (precedence climbing) ===

    fn parse_expr(&mut self) -> ParseResult<Expr> {
        self.parse_binary(0)
    }

    /// Operators at `min_prec` or above are consumed here; the right operand is
    /// parsed one level tighter, which keeps equal-precedence chains left-associative.
    fn parse_binary(&mut self, min_prec: u8) -> ParseResult<Expr> {
        let mut left = self.parse_prefix()?;

        while let Some(op) = self.peek_binop() {
            let prec = op.precedence();
            if prec < min_prec {
                break;
            }

            self.advance(); // consume operator
            let right = self.parse_binary(prec + 1)?;

            let span = left.span.to(right.span);
            left = Expr {
                kind: ExprKind::Binary(Box::new(left), op, Box::new(right)),
                span,
            };
        }

        Ok(left)
    }

    fn peek_binop(&self) -> Option<BinOp> {
        match self.peek() {
            Token::Plus => Some(BinOp::Add),
            Token::Minus => Some(BinOp::Sub),
            Token::Star => Some(BinOp::Mul),
            Token::Slash => Some(BinOp::Div),
            Token::Percent => Some(BinOp::Mod),
            Token::EqEq => Some(BinOp::Eq),
            Token::NotEq => Some(BinOp::NotEq),
            Token::Lt => Some(BinOp::Lt),
            Token::Gt => Some(BinOp::Gt),
            Token::LtEq => Some(BinOp::LtEq),
            Token::GtEq => Some(BinOp::GtEq),
            Token::AndAnd => Some(BinOp::And),
            Token::OrOr => Some(BinOp::Or),
            _ => None,
        }
    }

    fn parse_prefix(&mut self) -> ParseResult<Expr> {
        let op = match self.peek() {
            Token::Not => UnaryOp::Not,
            Token::Minus => UnaryOp::Neg,
            _ => return self.parse_primary(),
        };
        let start = self.advance().span;

        let operand = self.parse_prefix()?;
        let span = start.to(operand.span);
        Ok(Expr {
            kind: ExprKind::Unary(op, Box::new(operand)),
            span,
        })
    }

    fn parse_primary(&mut self) -> ParseResult<Expr> {
        match self.peek().clone() {
            Token::LParen => {
                let start = self.advance().span;
                let inner = self.parse_expr()?;
                let end = self.expect(Token::RParen, "expected ')'")?;
                Ok(Expr {
                    kind: ExprKind::Grouping(Box::new(inner)),
                    span: start.to(end.span),
                })
            }
            Token::Number(text) => {
                let span = self.advance().span;
                Ok(Expr {
                    kind: ExprKind::NumberLiteral(text),
                    span,
                })
            }
            Token::Ident(name) => {
                let span = self.advance().span;
                let ident = Ident::new(name, span);

                if !self.check(&Token::LParen) {
                    return Ok(Expr {
                        kind: ExprKind::DeclRef(ident),
                        span,
                    });
                }

                let (args, end) = self.parse_arg_list()?;
                Ok(Expr {
                    kind: ExprKind::Call(ident, args),
                    span: span.to(end),
                })
            }
            _ => Err(self.error_here("expected expression")),
        }
    }

    fn parse_arg_list(&mut self) -> ParseResult<(Vec<Expr>, Span)> {
        self.expect(Token::LParen, "expected '('")?;

        let mut args = Vec::new();
        while !self.check(&Token::RParen) {
            args.push(self.parse_expr()?);

            if !self.check(&Token::Comma) {
                break;
            }
            self.advance();
        }

        let end = self.expect(Token::RParen, "expected ')'")?;
        Ok((args, end.span))
    }
}
