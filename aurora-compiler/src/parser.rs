//! Recursive-descent parser with precedence climbing.

use crate::error::CompileError;
use crate::ir::*;
use crate::lexer;
use crate::token::{Token, TokenKind};

/// Parses a whole source file into its IR.
pub fn parse(source: &str) -> Result<Program, CompileError> {
    let tokens = lexer::tokenize(source)?;
    Parser::new(tokens).program()
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_kind(&self) -> TokenKind {
        self.peek().kind
    }

    fn peek2_kind(&self) -> TokenKind {
        self.tokens
            .get(self.pos + 1)
            .map(|t| t.kind)
            .unwrap_or(TokenKind::Eof)
    }

    fn bump(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.peek_kind() == kind
    }

    fn eat(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind) -> Result<Token, CompileError> {
        if self.check(kind) {
            Ok(self.bump())
        } else {
            Err(self.expected(kind.describe()))
        }
    }

    fn expected(&self, what: &str) -> CompileError {
        let token = self.peek();
        CompileError::Parse {
            expected: what.to_owned(),
            got: if token.kind == TokenKind::Eof {
                "end of input".to_owned()
            } else {
                token.lexeme.clone()
            },
            line: token.line,
            column: token.column,
        }
    }

    // ---- declarations ----

    fn program(&mut self) -> Result<Program, CompileError> {
        let mut program = Program::default();

        if self.eat(TokenKind::Module) {
            let name = self.expect(TokenKind::Ident)?;
            program.module = Some(name.lexeme);
            self.expect(TokenKind::LBrace)?;
            while !self.check(TokenKind::RBrace) {
                self.declaration(&mut program)?;
            }
            self.expect(TokenKind::RBrace)?;
        } else {
            while !self.check(TokenKind::Eof) {
                self.declaration(&mut program)?;
            }
        }

        self.expect(TokenKind::Eof)?;
        Ok(program)
    }

    fn declaration(&mut self, program: &mut Program) -> Result<(), CompileError> {
        match self.peek_kind() {
            TokenKind::Shared => {
                program.shared.push(self.shared_decl()?);
                Ok(())
            }
            TokenKind::Fn => {
                program.functions.push(self.fn_decl()?);
                Ok(())
            }
            _ => Err(self.expected("`fn` or `shared` declaration")),
        }
    }

    fn shared_decl(&mut self) -> Result<SharedDecl, CompileError> {
        let kw = self.expect(TokenKind::Shared)?;
        let name = self.expect(TokenKind::Ident)?;
        self.expect(TokenKind::Colon)?;
        let ty = self.ty()?;
        self.expect(TokenKind::Assign)?;
        let init = self.expr()?;
        self.expect(TokenKind::Semicolon)?;
        Ok(SharedDecl {
            name: name.lexeme,
            ty,
            init,
            line: kw.line,
            column: kw.column,
        })
    }

    fn fn_decl(&mut self) -> Result<FunctionDecl, CompileError> {
        let kw = self.expect(TokenKind::Fn)?;
        let name = self.expect(TokenKind::Ident)?;
        self.expect(TokenKind::LParen)?;
        let mut params = Vec::new();
        if !self.check(TokenKind::RParen) {
            loop {
                let pname = self.expect(TokenKind::Ident)?;
                self.expect(TokenKind::Colon)?;
                let ty = self.ty()?;
                params.push(Param {
                    name: pname.lexeme,
                    ty,
                });
                if !self.eat(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(TokenKind::RParen)?;
        let ret = if self.eat(TokenKind::Arrow) {
            Some(self.ty()?)
        } else {
            None
        };
        let body = self.block()?;
        Ok(FunctionDecl {
            name: name.lexeme,
            params,
            ret,
            body,
            line: kw.line,
            column: kw.column,
        })
    }

    fn ty(&mut self) -> Result<Type, CompileError> {
        match self.peek_kind() {
            TokenKind::TyInt => {
                self.bump();
                Ok(Type::Int)
            }
            TokenKind::TyFloat => {
                self.bump();
                Ok(Type::Float)
            }
            TokenKind::TyBool => {
                self.bump();
                Ok(Type::Bool)
            }
            TokenKind::TyString => {
                self.bump();
                Ok(Type::Str)
            }
            TokenKind::TyThread => {
                self.bump();
                Ok(Type::Thread)
            }
            TokenKind::TyArray => {
                self.bump();
                self.expect(TokenKind::Lt)?;
                let elem = self.ty()?;
                self.expect(TokenKind::Gt)?;
                Ok(Type::Array(Box::new(elem)))
            }
            _ => Err(self.expected("type name")),
        }
    }

    // ---- statements ----

    fn block(&mut self) -> Result<Block, CompileError> {
        self.expect(TokenKind::LBrace)?;
        let mut stmts = Vec::new();
        while !self.check(TokenKind::RBrace) {
            stmts.push(self.stmt()?);
        }
        self.expect(TokenKind::RBrace)?;
        Ok(Block { stmts })
    }

    fn stmt(&mut self) -> Result<Stmt, CompileError> {
        let token = self.peek().clone();
        let (line, column) = (token.line, token.column);
        let at = |kind| Stmt { kind, line, column };

        match token.kind {
            TokenKind::Let => {
                self.bump();
                let name = self.expect(TokenKind::Ident)?;
                let ty = if self.eat(TokenKind::Colon) {
                    Some(self.ty()?)
                } else {
                    None
                };
                self.expect(TokenKind::Assign)?;
                let value = self.expr()?;
                self.expect(TokenKind::Semicolon)?;
                Ok(at(StmtKind::Let {
                    name: name.lexeme,
                    ty,
                    value,
                }))
            }
            TokenKind::If => {
                self.bump();
                let cond = self.expr()?;
                let then_block = self.block()?;
                let else_block = if self.eat(TokenKind::Else) {
                    if self.check(TokenKind::If) {
                        // `else if` chains as a nested single-statement block
                        let nested = self.stmt()?;
                        Some(Block { stmts: vec![nested] })
                    } else {
                        Some(self.block()?)
                    }
                } else {
                    None
                };
                Ok(at(StmtKind::If {
                    cond,
                    then_block,
                    else_block,
                }))
            }
            TokenKind::While => {
                self.bump();
                let cond = self.expr()?;
                let body = self.block()?;
                Ok(at(StmtKind::While { cond, body }))
            }
            TokenKind::For => {
                self.bump();
                let iter = self.expect(TokenKind::Ident)?;
                self.expect(TokenKind::In)?;
                let start = self.expr()?;
                self.expect(TokenKind::DotDot)?;
                let end = self.expr()?;
                let step = if self.eat(TokenKind::Step) {
                    Some(self.expr()?)
                } else {
                    None
                };
                let body = self.block()?;
                Ok(at(StmtKind::For {
                    iter: iter.lexeme,
                    start,
                    end,
                    step,
                    body,
                }))
            }
            TokenKind::Break => {
                self.bump();
                self.expect(TokenKind::Semicolon)?;
                Ok(at(StmtKind::Break))
            }
            TokenKind::Continue => {
                self.bump();
                self.expect(TokenKind::Semicolon)?;
                Ok(at(StmtKind::Continue))
            }
            TokenKind::Return => {
                self.bump();
                let value = if self.check(TokenKind::Semicolon) {
                    None
                } else {
                    Some(self.expr()?)
                };
                self.expect(TokenKind::Semicolon)?;
                Ok(at(StmtKind::Return(value)))
            }
            TokenKind::Join => {
                self.bump();
                let handle = self.expr()?;
                self.expect(TokenKind::Semicolon)?;
                Ok(at(StmtKind::Join(handle)))
            }
            TokenKind::Print => {
                self.bump();
                self.expect(TokenKind::LParen)?;
                let arg = self.expr()?;
                self.expect(TokenKind::RParen)?;
                self.expect(TokenKind::Semicolon)?;
                Ok(at(StmtKind::Request {
                    service: RequestService::Print,
                    arg: Some(arg),
                }))
            }
            TokenKind::Ident if token.lexeme == "atomic" && self.peek2_kind() == TokenKind::Dot => {
                self.atomic_stmt(line, column)
            }
            TokenKind::Ident if token.lexeme == "request" => self.request_stmt(line, column),
            _ => {
                // Expression-led statements: assignment targets parse as
                // expressions first, then `=` decides.
                let expr = self.expr()?;
                if self.eat(TokenKind::Assign) {
                    let value = self.expr()?;
                    self.expect(TokenKind::Semicolon)?;
                    let kind = match expr.kind {
                        ExprKind::Var(name) => StmtKind::Assign { name, value },
                        ExprKind::ArrayIndex { name, index } => StmtKind::ArrayAssign {
                            name,
                            index: *index,
                            value,
                        },
                        _ => {
                            return Err(CompileError::Parse {
                                expected: "assignable target".to_owned(),
                                got: "expression".to_owned(),
                                line,
                                column,
                            })
                        }
                    };
                    Ok(at(kind))
                } else {
                    self.expect(TokenKind::Semicolon)?;
                    Ok(at(StmtKind::Expr(expr)))
                }
            }
        }
    }

    /// `atomic.add(shared, value);` / `atomic.store(shared, value);`
    fn atomic_stmt(&mut self, line: usize, column: usize) -> Result<Stmt, CompileError> {
        self.bump(); // `atomic`
        self.expect(TokenKind::Dot)?;
        let op = self.expect(TokenKind::Ident)?;
        let kind = match op.lexeme.as_str() {
            "add" => AtomicKind::Add,
            "store" => AtomicKind::Store,
            _ => return Err(self.expected_at("`add`, `store` or `load`", &op)),
        };
        self.expect(TokenKind::LParen)?;
        let shared = self.expect(TokenKind::Ident)?;
        self.expect(TokenKind::Comma)?;
        let value = self.expr()?;
        self.expect(TokenKind::RParen)?;
        self.expect(TokenKind::Semicolon)?;
        Ok(Stmt {
            kind: StmtKind::Atomic {
                kind,
                shared: shared.lexeme,
                value,
            },
            line,
            column,
        })
    }

    /// Legacy `request service print(x);` and the shorter
    /// `request print(x);`.
    fn request_stmt(&mut self, line: usize, column: usize) -> Result<Stmt, CompileError> {
        self.bump(); // `request`
        if self.check(TokenKind::Ident) && self.peek().lexeme == "service" {
            self.bump();
        }
        let (service, takes_arg) = match self.peek_kind() {
            TokenKind::Print => {
                self.bump();
                (RequestService::Print, true)
            }
            TokenKind::Ident => {
                let name = self.bump();
                match name.lexeme.as_str() {
                    "exit" => (RequestService::Exit, true),
                    "pause" => (RequestService::Pause, true),
                    "pause_silent" => (RequestService::PauseSilent, false),
                    _ => return Err(self.expected_at("service name", &name)),
                }
            }
            _ => return Err(self.expected("service name")),
        };
        self.expect(TokenKind::LParen)?;
        let arg = if takes_arg && !self.check(TokenKind::RParen) {
            Some(self.expr()?)
        } else {
            None
        };
        self.expect(TokenKind::RParen)?;
        self.expect(TokenKind::Semicolon)?;
        Ok(Stmt {
            kind: StmtKind::Request { service, arg },
            line,
            column,
        })
    }

    fn expected_at(&self, what: &str, token: &Token) -> CompileError {
        CompileError::Parse {
            expected: what.to_owned(),
            got: token.lexeme.clone(),
            line: token.line,
            column: token.column,
        }
    }

    // ---- expressions, precedence climbing from `||` up ----

    fn expr(&mut self) -> Result<Expr, CompileError> {
        self.logical_or()
    }

    fn binary_chain(
        &mut self,
        ops: &[(TokenKind, BinOp)],
        next: fn(&mut Self) -> Result<Expr, CompileError>,
    ) -> Result<Expr, CompileError> {
        let mut lhs = next(self)?;
        'outer: loop {
            for (kind, op) in ops {
                if self.check(*kind) {
                    self.bump();
                    let rhs = next(self)?;
                    let (line, column) = (lhs.line, lhs.column);
                    lhs = Expr {
                        kind: ExprKind::Binary {
                            op: *op,
                            lhs: Box::new(lhs),
                            rhs: Box::new(rhs),
                        },
                        line,
                        column,
                    };
                    continue 'outer;
                }
            }
            return Ok(lhs);
        }
    }

    fn logical_or(&mut self) -> Result<Expr, CompileError> {
        self.binary_chain(&[(TokenKind::OrOr, BinOp::Or)], Self::logical_and)
    }

    fn logical_and(&mut self) -> Result<Expr, CompileError> {
        self.binary_chain(&[(TokenKind::AndAnd, BinOp::And)], Self::comparison)
    }

    fn comparison(&mut self) -> Result<Expr, CompileError> {
        self.binary_chain(
            &[
                (TokenKind::Le, BinOp::Le),
                (TokenKind::Ge, BinOp::Ge),
                (TokenKind::Lt, BinOp::Lt),
                (TokenKind::Gt, BinOp::Gt),
                (TokenKind::EqEq, BinOp::Eq),
                (TokenKind::NotEq, BinOp::Ne),
            ],
            Self::bit_or,
        )
    }

    fn bit_or(&mut self) -> Result<Expr, CompileError> {
        self.binary_chain(&[(TokenKind::Pipe, BinOp::BitOr)], Self::bit_xor)
    }

    fn bit_xor(&mut self) -> Result<Expr, CompileError> {
        self.binary_chain(&[(TokenKind::Caret, BinOp::BitXor)], Self::bit_and)
    }

    fn bit_and(&mut self) -> Result<Expr, CompileError> {
        self.binary_chain(&[(TokenKind::Amp, BinOp::BitAnd)], Self::shift)
    }

    fn shift(&mut self) -> Result<Expr, CompileError> {
        self.binary_chain(
            &[(TokenKind::Shl, BinOp::Shl), (TokenKind::Shr, BinOp::Shr)],
            Self::additive,
        )
    }

    fn additive(&mut self) -> Result<Expr, CompileError> {
        self.binary_chain(
            &[(TokenKind::Plus, BinOp::Add), (TokenKind::Minus, BinOp::Sub)],
            Self::term,
        )
    }

    fn term(&mut self) -> Result<Expr, CompileError> {
        self.binary_chain(
            &[
                (TokenKind::Star, BinOp::Mul),
                (TokenKind::Slash, BinOp::Div),
                (TokenKind::Percent, BinOp::Rem),
            ],
            Self::unary,
        )
    }

    fn unary(&mut self) -> Result<Expr, CompileError> {
        let token = self.peek().clone();
        let op = match token.kind {
            TokenKind::Minus => Some(UnOp::Neg),
            TokenKind::Bang => Some(UnOp::Not),
            TokenKind::Tilde => Some(UnOp::BitNot),
            _ => None,
        };
        if let Some(op) = op {
            self.bump();
            let operand = self.unary()?;
            return Ok(Expr {
                kind: ExprKind::Unary {
                    op,
                    operand: Box::new(operand),
                },
                line: token.line,
                column: token.column,
            });
        }
        self.cast()
    }

    fn cast(&mut self) -> Result<Expr, CompileError> {
        let mut expr = self.primary()?;
        while self.eat(TokenKind::As) {
            let ty = self.ty()?;
            let (line, column) = (expr.line, expr.column);
            expr = Expr {
                kind: ExprKind::Cast {
                    ty,
                    expr: Box::new(expr),
                },
                line,
                column,
            };
        }
        Ok(expr)
    }

    fn primary(&mut self) -> Result<Expr, CompileError> {
        let token = self.peek().clone();
        let (line, column) = (token.line, token.column);
        let at = |kind| Expr { kind, line, column };

        match token.kind {
            TokenKind::IntLit => {
                self.bump();
                let value = token.lexeme.parse::<i64>().map_err(|_| {
                    self.expected_at("integer literal", &token)
                })?;
                Ok(at(ExprKind::Int(value)))
            }
            TokenKind::FloatLit => {
                self.bump();
                let value = token.lexeme.parse::<f64>().map_err(|_| {
                    self.expected_at("float literal", &token)
                })?;
                Ok(at(ExprKind::Float(value)))
            }
            TokenKind::StrLit => {
                self.bump();
                Ok(at(ExprKind::Str(token.lexeme)))
            }
            TokenKind::True => {
                self.bump();
                Ok(at(ExprKind::Bool(true)))
            }
            TokenKind::False => {
                self.bump();
                Ok(at(ExprKind::Bool(false)))
            }
            TokenKind::LParen => {
                self.bump();
                let expr = self.expr()?;
                self.expect(TokenKind::RParen)?;
                Ok(expr)
            }
            TokenKind::LBracket => {
                self.bump();
                let mut elems = Vec::new();
                if !self.check(TokenKind::RBracket) {
                    loop {
                        elems.push(self.expr()?);
                        if !self.eat(TokenKind::Comma) {
                            break;
                        }
                    }
                }
                self.expect(TokenKind::RBracket)?;
                Ok(at(ExprKind::ArrayLit(elems)))
            }
            TokenKind::Input => {
                self.bump();
                self.expect(TokenKind::LParen)?;
                self.expect(TokenKind::RParen)?;
                Ok(at(ExprKind::Input))
            }
            TokenKind::Spawn => {
                self.bump();
                let func = if self.eat(TokenKind::LParen) {
                    let name = self.expect(TokenKind::Ident)?;
                    self.expect(TokenKind::RParen)?;
                    name
                } else {
                    self.expect(TokenKind::Ident)?
                };
                Ok(at(ExprKind::Spawn(func.lexeme)))
            }
            TokenKind::Ident if token.lexeme == "atomic" && self.peek2_kind() == TokenKind::Dot => {
                self.bump();
                self.expect(TokenKind::Dot)?;
                let op = self.expect(TokenKind::Ident)?;
                if op.lexeme != "load" {
                    return Err(self.expected_at("`load`", &op));
                }
                self.expect(TokenKind::LParen)?;
                let shared = self.expect(TokenKind::Ident)?;
                self.expect(TokenKind::RParen)?;
                Ok(at(ExprKind::AtomicLoad(shared.lexeme)))
            }
            TokenKind::Ident => {
                self.bump();
                if self.eat(TokenKind::LParen) {
                    let mut args = Vec::new();
                    if !self.check(TokenKind::RParen) {
                        loop {
                            args.push(self.expr()?);
                            if !self.eat(TokenKind::Comma) {
                                break;
                            }
                        }
                    }
                    self.expect(TokenKind::RParen)?;
                    Ok(at(ExprKind::Call {
                        name: token.lexeme,
                        args,
                    }))
                } else if self.eat(TokenKind::LBracket) {
                    let index = self.expr()?;
                    self.expect(TokenKind::RBracket)?;
                    Ok(at(ExprKind::ArrayIndex {
                        name: token.lexeme,
                        index: Box::new(index),
                    }))
                } else {
                    Ok(at(ExprKind::Var(token.lexeme)))
                }
            }
            _ => Err(self.expected("expression")),
        }
    }
}
