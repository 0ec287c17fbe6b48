//! Recursive descent parser for the OOX verification language.

use crate::ast::*;
use crate::lexer::Lexer;
use crate::token::{Span, Token, TokenKind};
use thiserror::Error;

/// A syntax error, positioned in the source.
#[derive(Debug, Error)]
pub enum ParseError {
    /// The current token is not what the grammar allows here.
    #[error("expected {expected} but found {found} at {span}")]
    Expected {
        expected: String,
        found: String,
        span: Span,
    },
    /// The input stopped in the middle of a construct.
    #[error("source ended unexpectedly at {span}")]
    UnexpectedEnd { span: Span },
    /// A construct that tokenises fine but is not legal OOX.
    #[error("{message} at {span}")]
    Invalid { message: String, span: Span },
}

impl ParseError {
    /// Source location of the failure.
    pub fn span(&self) -> Span {
        match *self {
            ParseError::Expected { span, .. }
            | ParseError::UnexpectedEnd { span }
            | ParseError::Invalid { span, .. } => span,
        }
    }
}

pub type ParseResult<T> = Result<T, ParseError>;

/// Parse OOX source text into a compilation unit.
pub fn parse(source: &str) -> ParseResult<CompilationUnit> {
    Parser::new(source).parse_compilation_unit()
}

/// Parser for OOX source code.
pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    /// Create a parser over the token stream of `source`, trivia dropped.
    pub fn new(source: &str) -> Self {
        let mut tokens = Lexer::new(source).tokenize();
        tokens.retain(|t| !t.kind.is_trivia());
        Self { tokens, pos: 0 }
    }

    /// Parse a complete compilation unit.
    pub fn parse_compilation_unit(&mut self) -> ParseResult<CompilationUnit> {
        let mut classes = Vec::new();
        while !self.is_at_end() {
            classes.push(self.parse_class()?);
        }
        Ok(CompilationUnit { classes })
    }

    fn parse_class(&mut self) -> ParseResult<Class> {
        let start = self.current_span();
        self.expect(TokenKind::Class)?;
        let name = self.parse_ident()?;
        self.expect(TokenKind::LBrace)?;

        let mut members = Vec::new();
        while self.peek_kind() != &TokenKind::RBrace {
            members.push(self.parse_member(&name)?);
        }
        self.expect(TokenKind::RBrace)?;

        let span = start.to(self.prev_span());
        Ok(Class {
            name,
            members,
            span,
        })
    }

    /// Parse a field, method, or constructor.
    fn parse_member(&mut self, class_name: &str) -> ParseResult<DeclarationMember> {
        let start = self.current_span();

        // Constructor: `ClassName(params) spec { body }`
        if let TokenKind::Ident(name) = self.peek_kind() {
            if name == class_name && self.peek_ahead_kind(1) == &TokenKind::LParen {
                let name = self.parse_ident()?;
                let params = self.parse_params()?;
                let specification = self.parse_specification()?;
                let body = self.parse_block()?;
                let span = start.to(self.prev_span());
                return Ok(DeclarationMember::Constructor {
                    name,
                    params,
                    specification,
                    body,
                    span,
                });
            }
        }

        let is_static = if self.peek_kind() == &TokenKind::Static {
            self.advance();
            true
        } else {
            false
        };

        if !is_static && self.peek_kind() != &TokenKind::Void {
            // Could be a field: `type name ;`
            let checkpoint = self.pos;
            let ty = self.parse_non_void_type()?;
            let name = self.parse_declared_name()?;
            if self.peek_kind() == &TokenKind::Semicolon {
                self.advance();
                let span = start.to(self.prev_span());
                return Ok(DeclarationMember::Field { ty, name, span });
            }
            // Not a field after all: an instance method. Rewind and re-parse.
            self.pos = checkpoint;
        }

        let return_type = self.parse_type()?;
        let name = self.parse_ident()?;
        let params = self.parse_params()?;
        let specification = self.parse_specification()?;
        let body = self.parse_block()?;
        let span = start.to(self.prev_span());
        Ok(DeclarationMember::Method {
            is_static,
            return_type,
            name,
            params,
            specification,
            body,
            span,
        })
    }

    fn parse_params(&mut self) -> ParseResult<Vec<Parameter>> {
        self.expect(TokenKind::LParen)?;
        let mut params = Vec::new();
        if self.peek_kind() != &TokenKind::RParen {
            loop {
                let start = self.current_span();
                let ty = self.parse_non_void_type()?;
                let name = self.parse_declared_name()?;
                let span = start.to(self.prev_span());
                params.push(Parameter { ty, name, span });
                if self.peek_kind() == &TokenKind::Comma {
                    self.advance();
                } else {
                    break;
                }
            }
        }
        self.expect(TokenKind::RParen)?;
        Ok(params)
    }

    /// Parse zero or more `requires(..)`, `ensures(..)`, `exceptional(..)`.
    fn parse_specification(&mut self) -> ParseResult<Specification> {
        let mut spec = Specification::default();
        loop {
            match self.peek_kind() {
                TokenKind::Requires => {
                    self.advance();
                    self.expect(TokenKind::LParen)?;
                    spec.requires = Some(self.parse_expression()?);
                    self.expect(TokenKind::RParen)?;
                }
                TokenKind::Ensures => {
                    self.advance();
                    self.expect(TokenKind::LParen)?;
                    spec.ensures = Some(self.parse_expression()?);
                    self.expect(TokenKind::RParen)?;
                }
                TokenKind::Exceptional => {
                    self.advance();
                    self.expect(TokenKind::LParen)?;
                    spec.exceptional = Some(self.parse_expression()?);
                    self.expect(TokenKind::RParen)?;
                }
                _ => break,
            }
        }
        Ok(spec)
    }

    fn parse_type(&mut self) -> ParseResult<Type> {
        if self.peek_kind() == &TokenKind::Void {
            self.advance();
            return Ok(Type::Void);
        }
        Ok(Type::NonVoid(self.parse_non_void_type()?))
    }

    fn parse_non_void_type(&mut self) -> ParseResult<NonVoidType> {
        let span = self.current_span();
        let mut ty = match self.peek_kind().clone() {
            TokenKind::Int => {
                self.advance();
                NonVoidType::Int(span)
            }
            TokenKind::Bool => {
                self.advance();
                NonVoidType::Bool(span)
            }
            TokenKind::Ident(name) => {
                self.advance();
                NonVoidType::Reference(name, span)
            }
            _ => return Err(self.expected("a type")),
        };
        while self.peek_kind() == &TokenKind::LBracket
            && self.peek_ahead_kind(1) == &TokenKind::RBracket
        {
            self.advance();
            self.advance();
            let span = ty.span().to(self.prev_span());
            ty = NonVoidType::Array(Box::new(ty), span);
        }
        Ok(ty)
    }

    /// Parse a name being declared, rejecting the reserved slots.
    fn parse_declared_name(&mut self) -> ParseResult<Identifier> {
        let span = self.current_span();
        let name = self.parse_ident()?;
        if name == RETVAL || name == THIS {
            return Err(ParseError::Invalid {
                message: format!("'{}' is a reserved name", name),
                span,
            });
        }
        Ok(name)
    }

    fn parse_block(&mut self) -> ParseResult<Statement> {
        let start = self.current_span();
        self.expect(TokenKind::LBrace)?;
        let mut body = Vec::new();
        while self.peek_kind() != &TokenKind::RBrace {
            self.parse_statement_into(&mut body)?;
        }
        self.expect(TokenKind::RBrace)?;
        let span = start.to(self.prev_span());
        Ok(Statement::Block { body, span })
    }

    /// Parse one statement. Declarations with initialisers push two
    /// statements, hence the out-vector.
    fn parse_statement_into(&mut self, out: &mut Vec<Statement>) -> ParseResult<()> {
        let start = self.current_span();
        match self.peek_kind().clone() {
            TokenKind::LBrace => {
                let block = self.parse_block()?;
                out.push(block);
            }
            TokenKind::Skip => {
                self.advance();
                self.expect(TokenKind::Semicolon)?;
                out.push(Statement::Skip {
                    span: start.to(self.prev_span()),
                });
            }
            TokenKind::Assert => {
                self.advance();
                let assertion = self.parse_expression()?;
                self.expect(TokenKind::Semicolon)?;
                out.push(Statement::Assert {
                    assertion,
                    span: start.to(self.prev_span()),
                });
            }
            TokenKind::Assume => {
                self.advance();
                let assumption = self.parse_expression()?;
                self.expect(TokenKind::Semicolon)?;
                out.push(Statement::Assume {
                    assumption,
                    span: start.to(self.prev_span()),
                });
            }
            TokenKind::While => {
                self.advance();
                self.expect(TokenKind::LParen)?;
                let guard = self.parse_expression()?;
                self.expect(TokenKind::RParen)?;
                let body = self.parse_single_statement()?;
                out.push(Statement::While {
                    guard,
                    body: Box::new(body),
                    span: start.to(self.prev_span()),
                });
            }
            TokenKind::If => {
                self.advance();
                self.expect(TokenKind::LParen)?;
                let guard = self.parse_expression()?;
                self.expect(TokenKind::RParen)?;
                let true_body = self.parse_single_statement()?;
                let false_body = if self.peek_kind() == &TokenKind::Else {
                    self.advance();
                    Some(Box::new(self.parse_single_statement()?))
                } else {
                    None
                };
                out.push(Statement::Ite {
                    guard,
                    true_body: Box::new(true_body),
                    false_body,
                    span: start.to(self.prev_span()),
                });
            }
            TokenKind::Continue => {
                self.advance();
                self.expect(TokenKind::Semicolon)?;
                out.push(Statement::Continue {
                    span: start.to(self.prev_span()),
                });
            }
            TokenKind::Break => {
                self.advance();
                self.expect(TokenKind::Semicolon)?;
                out.push(Statement::Break {
                    span: start.to(self.prev_span()),
                });
            }
            TokenKind::Return => {
                self.advance();
                let expression = if self.peek_kind() == &TokenKind::Semicolon {
                    None
                } else {
                    Some(self.parse_expression()?)
                };
                self.expect(TokenKind::Semicolon)?;
                out.push(Statement::Return {
                    expression,
                    span: start.to(self.prev_span()),
                });
            }
            TokenKind::Throw => {
                self.advance();
                let message = match self.peek_kind().clone() {
                    TokenKind::String(s) => {
                        self.advance();
                        s
                    }
                    _ => return Err(self.expected("a string literal")),
                };
                self.expect(TokenKind::Semicolon)?;
                out.push(Statement::Throw {
                    message,
                    span: start.to(self.prev_span()),
                });
            }
            TokenKind::Try => {
                self.advance();
                let try_body = self.parse_block()?;
                self.expect(TokenKind::Catch)?;
                let catch_body = self.parse_block()?;
                out.push(Statement::Try {
                    try_body: Box::new(try_body),
                    catch_body: Box::new(catch_body),
                    span: start.to(self.prev_span()),
                });
            }
            TokenKind::Lock => {
                self.advance();
                self.expect(TokenKind::LParen)?;
                let var = self.parse_ident()?;
                self.expect(TokenKind::RParen)?;
                let lock_span = start.to(self.prev_span());
                let body = self.parse_single_statement()?;
                let span = start.to(self.prev_span());
                // `lock (x) S` desugars to `Lock x; S; Unlock x`.
                out.push(Statement::Block {
                    body: vec![
                        Statement::Lock {
                            var: var.clone(),
                            span: lock_span,
                        },
                        body,
                        Statement::Unlock {
                            var,
                            span: lock_span,
                        },
                    ],
                    span,
                });
            }
            TokenKind::Fork => {
                self.advance();
                let invocation = self.parse_method_invocation()?;
                self.expect(TokenKind::Semicolon)?;
                out.push(Statement::Fork {
                    invocation,
                    span: start.to(self.prev_span()),
                });
            }
            TokenKind::Join => {
                self.advance();
                self.expect(TokenKind::Semicolon)?;
                out.push(Statement::Join {
                    span: start.to(self.prev_span()),
                });
            }
            TokenKind::Int | TokenKind::Bool => {
                self.parse_declaration_into(out)?;
            }
            TokenKind::Ident(_) => {
                // `C x;` / `C[] x;` declarations vs assignments vs calls.
                if self.starts_declaration() {
                    self.parse_declaration_into(out)?;
                } else {
                    self.parse_assign_or_call_into(out)?;
                }
            }
            _ => return Err(self.expected("a statement")),
        }
        Ok(())
    }

    /// A single (possibly block) statement used as a loop/branch body.
    fn parse_single_statement(&mut self) -> ParseResult<Statement> {
        let mut out = Vec::new();
        let start = self.current_span();
        self.parse_statement_into(&mut out)?;
        if out.len() == 1 {
            Ok(out.pop().expect("length checked"))
        } else {
            let span = start.to(self.prev_span());
            Ok(Statement::Block { body: out, span })
        }
    }

    /// Whether the upcoming tokens form a declaration when the current
    /// token is an identifier: `Ident Ident` or `Ident [ ] Ident`.
    fn starts_declaration(&self) -> bool {
        match self.peek_ahead_kind(1) {
            TokenKind::Ident(_) => true,
            TokenKind::LBracket => {
                self.peek_ahead_kind(2) == &TokenKind::RBracket
                    && matches!(self.peek_ahead_kind(3), TokenKind::Ident(_))
            }
            _ => false,
        }
    }

    fn parse_declaration_into(&mut self, out: &mut Vec<Statement>) -> ParseResult<()> {
        let start = self.current_span();
        let ty = self.parse_non_void_type()?;
        let var = self.parse_declared_name()?;
        let decl_span = start.to(self.prev_span());
        out.push(Statement::Declare {
            ty,
            var: var.clone(),
            span: decl_span,
        });

        // Optional initialiser: sugar for a following assignment.
        if self.peek_kind() == &TokenKind::Assign {
            let assign_start = self.current_span();
            self.advance();
            let rhs = self.parse_rhs()?;
            self.expect(TokenKind::Semicolon)?;
            out.push(Statement::Assign {
                lhs: Lhs::Var {
                    var,
                    span: decl_span,
                },
                rhs,
                span: assign_start.to(self.prev_span()),
            });
        } else {
            self.expect(TokenKind::Semicolon)?;
        }
        Ok(())
    }

    fn parse_assign_or_call_into(&mut self, out: &mut Vec<Statement>) -> ParseResult<()> {
        let start = self.current_span();
        let first = self.parse_ident()?;

        match self.peek_kind().clone() {
            // `x := rhs ;`
            TokenKind::Assign => {
                self.advance();
                let rhs = self.parse_rhs()?;
                self.expect(TokenKind::Semicolon)?;
                out.push(Statement::Assign {
                    lhs: Lhs::Var {
                        var: first,
                        span: start,
                    },
                    rhs,
                    span: start.to(self.prev_span()),
                });
            }
            // `x.f := rhs ;` or `x.m(..) ;`
            TokenKind::Dot => {
                self.advance();
                let second = self.parse_ident()?;
                if self.peek_kind() == &TokenKind::LParen {
                    let arguments = self.parse_arguments()?;
                    let span = start.to(self.prev_span());
                    self.expect(TokenKind::Semicolon)?;
                    out.push(Statement::Call {
                        invocation: Invocation::Method {
                            lhs: first,
                            rhs: second,
                            arguments,
                            span,
                        },
                        span: start.to(self.prev_span()),
                    });
                } else {
                    self.expect(TokenKind::Assign)?;
                    let rhs = self.parse_rhs()?;
                    self.expect(TokenKind::Semicolon)?;
                    out.push(Statement::Assign {
                        lhs: Lhs::Field {
                            var: first,
                            field: second,
                            span: start.to(self.prev_span()),
                        },
                        rhs,
                        span: start.to(self.prev_span()),
                    });
                }
            }
            // `a[i] := rhs ;`
            TokenKind::LBracket => {
                self.advance();
                let index = self.parse_expression()?;
                self.expect(TokenKind::RBracket)?;
                self.expect(TokenKind::Assign)?;
                let rhs = self.parse_rhs()?;
                self.expect(TokenKind::Semicolon)?;
                out.push(Statement::Assign {
                    lhs: Lhs::Elem {
                        var: first,
                        index,
                        span: start.to(self.prev_span()),
                    },
                    rhs,
                    span: start.to(self.prev_span()),
                });
            }
            _ => return Err(self.expected("':=', '.' or '['")),
        }
        Ok(())
    }

    fn parse_rhs(&mut self) -> ParseResult<Rhs> {
        let start = self.current_span();

        // `new C(..)` or `new T[e]`
        if self.peek_kind() == &TokenKind::New {
            self.advance();
            let element_type = self.parse_non_void_type()?;
            if self.peek_kind() == &TokenKind::LBracket {
                self.advance();
                let size = self.parse_expression()?;
                self.expect(TokenKind::RBracket)?;
                return Ok(Rhs::NewArray {
                    element_type,
                    size,
                    span: start.to(self.prev_span()),
                });
            }
            let class_name = match element_type {
                NonVoidType::Reference(name, _) => name,
                other => {
                    return Err(ParseError::Invalid {
                        message: format!("cannot construct a value of type {:?}", other),
                        span: start,
                    })
                }
            };
            let arguments = self.parse_arguments()?;
            return Ok(Rhs::Call {
                invocation: Invocation::Constructor {
                    class_name,
                    arguments,
                    span: start.to(self.prev_span()),
                },
                span: start.to(self.prev_span()),
            });
        }

        // `x.f`, `x.m(..)`, `a[e]` need lookahead before falling back to
        // a general expression.
        if let TokenKind::Ident(_) = self.peek_kind() {
            match self.peek_ahead_kind(1) {
                TokenKind::Dot => {
                    let var = self.parse_ident()?;
                    self.advance(); // dot
                    let second = self.parse_ident()?;
                    if self.peek_kind() == &TokenKind::LParen {
                        let arguments = self.parse_arguments()?;
                        let span = start.to(self.prev_span());
                        return Ok(Rhs::Call {
                            invocation: Invocation::Method {
                                lhs: var,
                                rhs: second,
                                arguments,
                                span,
                            },
                            span,
                        });
                    }
                    return Ok(Rhs::Field {
                        var,
                        field: second,
                        span: start.to(self.prev_span()),
                    });
                }
                TokenKind::LBracket => {
                    let var = self.parse_ident()?;
                    self.advance(); // [
                    let index = self.parse_expression()?;
                    self.expect(TokenKind::RBracket)?;
                    return Ok(Rhs::Elem {
                        var,
                        index,
                        span: start.to(self.prev_span()),
                    });
                }
                _ => {}
            }
        }

        let value = self.parse_expression()?;
        Ok(Rhs::Expression {
            value,
            span: start.to(self.prev_span()),
        })
    }

    fn parse_method_invocation(&mut self) -> ParseResult<Invocation> {
        let start = self.current_span();
        let lhs = self.parse_ident()?;
        self.expect(TokenKind::Dot)?;
        let rhs = self.parse_ident()?;
        let arguments = self.parse_arguments()?;
        Ok(Invocation::Method {
            lhs,
            rhs,
            arguments,
            span: start.to(self.prev_span()),
        })
    }

    fn parse_arguments(&mut self) -> ParseResult<Vec<Expression>> {
        self.expect(TokenKind::LParen)?;
        let mut args = Vec::new();
        if self.peek_kind() != &TokenKind::RParen {
            loop {
                args.push(self.parse_expression()?);
                if self.peek_kind() == &TokenKind::Comma {
                    self.advance();
                } else {
                    break;
                }
            }
        }
        self.expect(TokenKind::RParen)?;
        Ok(args)
    }

    // === Expressions ===

    pub fn parse_expression(&mut self) -> ParseResult<Expression> {
        self.parse_binary(0)
    }

    /// Precedence climbing.
    fn parse_binary(&mut self, min_prec: u8) -> ParseResult<Expression> {
        let mut left = self.parse_unary()?;

        while let Some(op) = self.peek_binop() {
            let prec = op.precedence();
            if prec < min_prec {
                break;
            }
            self.advance();
            let next_min = if op.is_right_assoc() { prec } else { prec + 1 };
            let right = self.parse_binary(next_min)?;
            let ty = binop_type(op);
            left = Expression::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
                ty,
            };
        }
        Ok(left)
    }

    fn peek_binop(&self) -> Option<BinOp> {
        let op = match self.peek_kind() {
            TokenKind::Implies => BinOp::Implies,
            TokenKind::AndAnd => BinOp::And,
            TokenKind::OrOr => BinOp::Or,
            TokenKind::Eq => BinOp::Eq,
            TokenKind::Ne => BinOp::Ne,
            TokenKind::Lt => BinOp::Lt,
            TokenKind::Le => BinOp::Le,
            TokenKind::Gt => BinOp::Gt,
            TokenKind::Ge => BinOp::Ge,
            TokenKind::Plus => BinOp::Add,
            TokenKind::Minus => BinOp::Sub,
            TokenKind::Star => BinOp::Mul,
            TokenKind::Slash => BinOp::Div,
            TokenKind::Percent => BinOp::Mod,
            _ => return None,
        };
        Some(op)
    }

    fn parse_unary(&mut self) -> ParseResult<Expression> {
        match self.peek_kind() {
            TokenKind::Bang => {
                self.advance();
                let operand = self.parse_unary()?;
                Ok(Expression::Unary {
                    op: UnOp::Not,
                    operand: Box::new(operand),
                    ty: RuntimeType::Bool,
                })
            }
            TokenKind::Minus => {
                self.advance();
                let operand = self.parse_unary()?;
                Ok(Expression::Unary {
                    op: UnOp::Neg,
                    operand: Box::new(operand),
                    ty: RuntimeType::Int,
                })
            }
            _ => self.parse_primary(),
        }
    }

    fn parse_primary(&mut self) -> ParseResult<Expression> {
        match self.peek_kind().clone() {
            TokenKind::Integer(n) => {
                self.advance();
                Ok(Expression::int(n))
            }
            TokenKind::True => {
                self.advance();
                Ok(Expression::bool(true))
            }
            TokenKind::False => {
                self.advance();
                Ok(Expression::bool(false))
            }
            TokenKind::Null => {
                self.advance();
                Ok(Expression::null())
            }
            TokenKind::Hash => {
                self.advance();
                let array = self.parse_ident()?;
                Ok(Expression::SizeOf {
                    array,
                    ty: RuntimeType::Int,
                })
            }
            TokenKind::LParen => {
                self.advance();
                let inner = self.parse_expression()?;
                self.expect(TokenKind::RParen)?;
                Ok(inner)
            }
            TokenKind::Forall => self.parse_quantifier(true),
            TokenKind::Exists => self.parse_quantifier(false),
            TokenKind::Ident(name) => {
                self.advance();
                Ok(Expression::Var {
                    name,
                    ty: RuntimeType::Unknown,
                })
            }
            _ => Err(self.expected("an expression")),
        }
    }

    /// `forall elem, index : array : body`
    fn parse_quantifier(&mut self, is_forall: bool) -> ParseResult<Expression> {
        self.advance();
        let elem = self.parse_ident()?;
        self.expect(TokenKind::Comma)?;
        let index = self.parse_ident()?;
        self.expect(TokenKind::Colon)?;
        let array = self.parse_ident()?;
        self.expect(TokenKind::Colon)?;
        let body = Box::new(self.parse_expression()?);
        let ty = RuntimeType::Bool;
        if is_forall {
            Ok(Expression::Forall {
                elem,
                index,
                array,
                body,
                ty,
            })
        } else {
            Ok(Expression::Exists {
                elem,
                index,
                array,
                body,
                ty,
            })
        }
    }

    // === Token plumbing ===

    fn parse_ident(&mut self) -> ParseResult<Identifier> {
        match self.peek_kind().clone() {
            TokenKind::Ident(name) => {
                self.advance();
                Ok(name)
            }
            _ => Err(self.expected("an identifier")),
        }
    }

    fn peek_kind(&self) -> &TokenKind {
        &self.tokens[self.pos.min(self.tokens.len() - 1)].kind
    }

    fn peek_ahead_kind(&self, offset: usize) -> &TokenKind {
        let idx = (self.pos + offset).min(self.tokens.len() - 1);
        &self.tokens[idx].kind
    }

    fn current_span(&self) -> Span {
        self.tokens[self.pos.min(self.tokens.len() - 1)].span
    }

    fn prev_span(&self) -> Span {
        if self.pos == 0 {
            return self.current_span();
        }
        self.tokens[(self.pos - 1).min(self.tokens.len() - 1)].span
    }

    fn advance(&mut self) {
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
    }

    fn is_at_end(&self) -> bool {
        self.peek_kind() == &TokenKind::Eof
    }

    fn expect(&mut self, kind: TokenKind) -> ParseResult<()> {
        if self.peek_kind() == &kind {
            self.advance();
            Ok(())
        } else {
            Err(self.expected(format!("'{}'", kind)))
        }
    }

    /// Error for the current token not matching what the grammar wants.
    /// Running out of input reports as its own variant.
    fn expected(&self, what: impl Into<String>) -> ParseError {
        if self.is_at_end() {
            ParseError::UnexpectedEnd {
                span: self.current_span(),
            }
        } else {
            ParseError::Expected {
                expected: what.into(),
                found: self.peek_kind().to_string(),
                span: self.current_span(),
            }
        }
    }
}

/// Result type of a binary operator.
fn binop_type(op: BinOp) -> RuntimeType {
    match op {
        BinOp::Implies
        | BinOp::And
        | BinOp::Or
        | BinOp::Eq
        | BinOp::Ne
        | BinOp::Lt
        | BinOp::Le
        | BinOp::Gt
        | BinOp::Ge => RuntimeType::Bool,
        BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod => RuntimeType::Int,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(source: &str) -> CompilationUnit {
        match parse(source) {
            Ok(unit) => unit,
            Err(e) => panic!("parse failed: {}", e),
        }
    }

    #[test]
    fn test_parse_minimal_class() {
        let unit = parse_ok(
            "class Main {
                static void main() {
                    skip;
                }
            }",
        );
        assert_eq!(unit.classes.len(), 1);
        assert_eq!(unit.classes[0].name, "Main");
    }

    #[test]
    fn test_parse_method_with_contract() {
        let unit = parse_ok(
            "class C {
                static int inc(int x)
                    requires(x >= 0)
                    ensures(retval > x)
                {
                    int y := x + 1;
                    return y;
                }
            }",
        );
        let DeclarationMember::Method {
            specification,
            params,
            ..
        } = &unit.classes[0].members[0]
        else {
            panic!("expected method");
        };
        assert!(specification.requires.is_some());
        assert!(specification.ensures.is_some());
        assert!(specification.exceptional.is_none());
        assert_eq!(params.len(), 1);
    }

    #[test]
    fn test_parse_fields_and_constructor() {
        let unit = parse_ok(
            "class Node {
                int value;
                Node next;
                Node(int v) {
                    this.value := v;
                    this.next := null;
                }
            }",
        );
        let class = &unit.classes[0];
        assert_eq!(class.fields().count(), 2);
        assert!(matches!(
            class.members[2],
            DeclarationMember::Constructor { .. }
        ));
    }

    #[test]
    fn test_parse_concurrency_statements() {
        let unit = parse_ok(
            "class Main {
                static void main() {
                    fork Main.work(1);
                    join;
                    lock (x) {
                        x.count := 0;
                    }
                }
                static void work(int n) {
                    skip;
                }
            }",
        );
        let DeclarationMember::Method { body, .. } = &unit.classes[0].members[0] else {
            panic!("expected method");
        };
        let Statement::Block { body, .. } = body else {
            panic!("expected block");
        };
        assert!(matches!(body[0], Statement::Fork { .. }));
        assert!(matches!(body[1], Statement::Join { .. }));
        // lock blocks desugar to Lock; body; Unlock
        let Statement::Block { body: lock_body, .. } = &body[2] else {
            panic!("expected desugared lock block");
        };
        assert!(matches!(lock_body[0], Statement::Lock { .. }));
        assert!(matches!(lock_body[2], Statement::Unlock { .. }));
    }

    #[test]
    fn test_parse_try_catch_throw() {
        let unit = parse_ok(
            "class Main {
                static void main() {
                    try {
                        throw \"boom\";
                    } catch {
                        skip;
                    }
                }
            }",
        );
        let DeclarationMember::Method { body, .. } = &unit.classes[0].members[0] else {
            panic!("expected method");
        };
        let Statement::Block { body, .. } = body else {
            panic!("expected block");
        };
        assert!(matches!(body[0], Statement::Try { .. }));
    }

    #[test]
    fn test_parse_array_declaration_and_access() {
        let unit = parse_ok(
            "class Main {
                static int sum(int[] a) {
                    int n := #a;
                    int x := a[0];
                    a[1] := x;
                    return n;
                }
            }",
        );
        let DeclarationMember::Method { params, .. } = &unit.classes[0].members[0] else {
            panic!("expected method");
        };
        assert!(matches!(params[0].ty, NonVoidType::Array(_, _)));
    }

    #[test]
    fn test_parse_quantifier() {
        let mut parser = Parser::new("forall v, i : a : v >= 0");
        let expr = parser.parse_expression().unwrap();
        assert!(matches!(expr, Expression::Forall { .. }));
    }

    #[test]
    fn test_implies_is_right_assoc() {
        let mut parser = Parser::new("a ==> b ==> c");
        let expr = parser.parse_expression().unwrap();
        let Expression::Binary {
            op: BinOp::Implies,
            right,
            ..
        } = expr
        else {
            panic!("expected implication");
        };
        assert!(matches!(
            *right,
            Expression::Binary {
                op: BinOp::Implies,
                ..
            }
        ));
    }

    #[test]
    fn test_reserved_names_rejected() {
        let err = parse(
            "class C {
                static void m() {
                    int retval;
                }
            }",
        )
        .unwrap_err();
        assert!(matches!(err, ParseError::Invalid { .. }));
    }

    #[test]
    fn test_unexpected_token_error() {
        let err = parse("class 42").unwrap_err();
        assert!(matches!(err, ParseError::Expected { .. }));
    }
}
