//! Pratt parser: expressions are parsed by precedence climbing, with one
//! prefix and one infix rule per token type. Statements get dedicated
//! parsers dispatched on their leading keyword.

use crate::ast::*;
use crate::compiler::CompileError;
use crate::lexer::{Token, TokenKind};

const PREC_ASSIGN: u8 = 1;
const PREC_COMPARE: u8 = 2;
const PREC_BITWISE: u8 = 3;
const PREC_ADDITIVE: u8 = 4;
const PREC_MULTIPLICATIVE: u8 = 5;
const PREC_PREFIX: u8 = 6;
const PREC_POSTFIX: u8 = 7;
const PREC_CALL: u8 = 8;

fn infix_precedence(kind: &TokenKind) -> u8 {
    use TokenKind::*;
    match kind {
        Assign | AddAssign | SubAssign | MulAssign | DivAssign => PREC_ASSIGN,
        EqEq | NotEq | Lt | Gt | LtE | GtE => PREC_COMPARE,
        Amp | Pipe | Caret | ShiftLeft | ShiftRight => PREC_BITWISE,
        Plus | Minus => PREC_ADDITIVE,
        Star | Slash | Percent => PREC_MULTIPLICATIVE,
        Increment | Decrement => PREC_POSTFIX,
        LParen | LBracket | Dot => PREC_CALL,
        _ => 0,
    }
}

fn binary_op(kind: &TokenKind) -> Option<BinOp> {
    use TokenKind::*;
    Some(match kind {
        Plus => BinOp::Add,
        Minus => BinOp::Sub,
        Star => BinOp::Mul,
        Slash => BinOp::Div,
        Percent => BinOp::Mod,
        Amp => BinOp::BitAnd,
        Pipe => BinOp::BitOr,
        Caret => BinOp::BitXor,
        ShiftLeft => BinOp::ShiftLeft,
        ShiftRight => BinOp::ShiftRight,
        EqEq => BinOp::Eq,
        NotEq => BinOp::NotEq,
        Lt => BinOp::Lt,
        Gt => BinOp::Gt,
        LtE => BinOp::LtE,
        GtE => BinOp::GtE,
        _ => return None,
    })
}

pub struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    file: &'a str,
}

/// Parse a token stream into the top-level statement block.
pub fn parse(tokens: Vec<Token>, file: &str) -> Result<Block, CompileError> {
    Parser::new(tokens, file).parse_all()
}

impl<'a> Parser<'a> {
    pub fn new(tokens: Vec<Token>, file: &'a str) -> Self {
        Parser { tokens, pos: 0, file }
    }

    fn peek(&self) -> Option<&TokenKind> {
        self.tokens.get(self.pos).map(|t| &t.kind)
    }

    fn peek_at(&self, offset: usize) -> Option<&TokenKind> {
        self.tokens.get(self.pos + offset).map(|t| &t.kind)
    }

    fn line(&self) -> u32 {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|t| t.line)
            .unwrap_or(1)
    }

    fn advance(&mut self) -> Option<TokenKind> {
        let tok = self.tokens.get(self.pos).map(|t| t.kind.clone());
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn check(&self, kind: &TokenKind) -> bool {
        self.peek() == Some(kind)
    }

    fn match_and_consume(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &TokenKind) -> Result<(), CompileError> {
        match self.peek() {
            Some(tok) if tok == kind => {
                self.pos += 1;
                Ok(())
            }
            Some(tok) => Err(self.error(format!("expected {:?}, got {:?}", kind, tok))),
            None => Err(self.error(format!("expected {:?}, got end of input", kind))),
        }
    }

    fn expect_name(&mut self) -> Result<String, CompileError> {
        match self.peek().cloned() {
            Some(TokenKind::Name(name)) => {
                self.pos += 1;
                Ok(name)
            }
            Some(tok) => Err(self.error(format!("expected identifier, got {:?}", tok))),
            None => Err(self.error("expected identifier, got end of input".into())),
        }
    }

    fn error(&self, message: String) -> CompileError {
        CompileError { file: self.file.to_string(), line: self.line(), message }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    // ---- Statements ----

    pub fn parse_all(&mut self) -> Result<Block, CompileError> {
        let mut stmts = Vec::new();
        while !self.at_end() {
            stmts.push(self.parse_statement(true)?);
        }
        Ok(Block { stmts })
    }

    fn parse_statement(&mut self, take_semicolon: bool) -> Result<Stmt, CompileError> {
        let line = self.line();
        match self.peek() {
            Some(TokenKind::If) => self.parse_if(line),
            Some(TokenKind::While) => self.parse_while(line),
            Some(TokenKind::For) => self.parse_for(line),
            Some(TokenKind::Return) => {
                let stmt = self.parse_return(line)?;
                if take_semicolon {
                    self.expect(&TokenKind::Semicolon)?;
                }
                Ok(stmt)
            }
            Some(TokenKind::Local) => {
                let stmt = self.parse_local(line)?;
                if take_semicolon {
                    self.expect(&TokenKind::Semicolon)?;
                }
                Ok(stmt)
            }
            Some(TokenKind::Const) => self.parse_const(),
            Some(TokenKind::Function) if matches!(self.peek_at(1), Some(TokenKind::Name(_))) => {
                self.parse_function_decl(line)
            }
            Some(TokenKind::LBrace) => Ok(Stmt::Block(self.parse_block(false)?)),
            Some(_) => {
                let expr = self.parse_expression(0)?;
                if take_semicolon {
                    self.expect(&TokenKind::Semicolon)?;
                }
                Ok(Stmt::Expr { expr, line })
            }
            None => Err(self.error("expected statement, got end of input".into())),
        }
    }

    /// `{ statements }`, or a single statement where the construct allows it.
    fn parse_block(&mut self, allow_single: bool) -> Result<Block, CompileError> {
        if allow_single && !self.check(&TokenKind::LBrace) {
            return Ok(Block { stmts: vec![self.parse_statement(true)?] });
        }
        self.expect(&TokenKind::LBrace)?;
        let mut stmts = Vec::new();
        while !self.check(&TokenKind::RBrace) {
            if self.at_end() {
                return Err(self.error("unterminated block, expected `}`".into()));
            }
            stmts.push(self.parse_statement(true)?);
        }
        self.expect(&TokenKind::RBrace)?;
        Ok(Block { stmts })
    }

    fn parse_if(&mut self, line: u32) -> Result<Stmt, CompileError> {
        self.expect(&TokenKind::If)?;
        self.expect(&TokenKind::LParen)?;
        let cond = self.parse_expression(0)?;
        self.expect(&TokenKind::RParen)?;
        let block = self.parse_block(true)?;

        let mut branches = vec![(cond, block)];
        let mut otherwise = None;
        while self.match_and_consume(&TokenKind::Else) {
            if self.match_and_consume(&TokenKind::If) {
                self.expect(&TokenKind::LParen)?;
                let cond = self.parse_expression(0)?;
                self.expect(&TokenKind::RParen)?;
                branches.push((cond, self.parse_block(true)?));
            } else {
                otherwise = Some(self.parse_block(true)?);
                break;
            }
        }
        Ok(Stmt::If { branches, otherwise, line })
    }

    fn parse_while(&mut self, line: u32) -> Result<Stmt, CompileError> {
        self.expect(&TokenKind::While)?;
        self.expect(&TokenKind::LParen)?;
        let cond = self.parse_expression(0)?;
        self.expect(&TokenKind::RParen)?;
        let body = self.parse_block(false)?;
        Ok(Stmt::While { cond, body, line })
    }

    /// Two shapes share the `for` keyword: `for (local k in container)` and
    /// the C-style `for (init; cond; step)`. Two-token lookahead picks.
    fn parse_for(&mut self, line: u32) -> Result<Stmt, CompileError> {
        self.expect(&TokenKind::For)?;
        self.expect(&TokenKind::LParen)?;

        if self.check(&TokenKind::Local)
            && matches!(self.peek_at(1), Some(TokenKind::Name(_)))
            && self.peek_at(2) == Some(&TokenKind::In)
        {
            self.expect(&TokenKind::Local)?;
            let name = self.expect_name()?;
            self.expect(&TokenKind::In)?;
            let container = self.parse_expression(0)?;
            self.expect(&TokenKind::RParen)?;
            let body = self.parse_block(false)?;
            return Ok(Stmt::ForEach { name, container, body, line });
        }

        let init = Box::new(self.parse_statement(true)?);
        let cond = self.parse_expression(0)?;
        self.expect(&TokenKind::Semicolon)?;
        let step = self.parse_expression(0)?;
        self.expect(&TokenKind::RParen)?;
        let body = self.parse_block(false)?;
        Ok(Stmt::For { init, cond, step, body, line })
    }

    fn parse_return(&mut self, line: u32) -> Result<Stmt, CompileError> {
        self.expect(&TokenKind::Return)?;
        let value = if self.check(&TokenKind::Semicolon) {
            None
        } else {
            Some(self.parse_expression(0)?)
        };
        Ok(Stmt::Return { value, line })
    }

    fn parse_local(&mut self, line: u32) -> Result<Stmt, CompileError> {
        self.expect(&TokenKind::Local)?;
        let mut names = vec![self.expect_name()?];
        while self.match_and_consume(&TokenKind::Comma) {
            names.push(self.expect_name()?);
        }
        self.expect(&TokenKind::Assign)?;
        let mut values = vec![self.parse_expression(0)?];
        while self.match_and_consume(&TokenKind::Comma) {
            values.push(self.parse_expression(0)?);
        }
        Ok(Stmt::Local { names, values, line })
    }

    /// `const` parses like `local` and is then rejected: the construct is
    /// recognized but not implemented.
    fn parse_const(&mut self) -> Result<Stmt, CompileError> {
        let err = self.error("const declarations are not implemented".into());
        self.expect(&TokenKind::Const)?;
        let _ = self.expect_name()?;
        while self.match_and_consume(&TokenKind::Comma) {
            let _ = self.expect_name()?;
        }
        self.expect(&TokenKind::Assign)?;
        let _ = self.parse_expression(0)?;
        Err(err)
    }

    fn parse_function_decl(&mut self, line: u32) -> Result<Stmt, CompileError> {
        self.expect(&TokenKind::Function)?;
        let name = self.expect_name()?;
        let (params, vararg) = self.parse_params()?;
        let body = self.parse_block(false)?;
        Ok(Stmt::Function(FunctionDef { name: Some(name), params, vararg, body, line }))
    }

    fn parse_params(&mut self) -> Result<(Vec<String>, Option<String>), CompileError> {
        self.expect(&TokenKind::LParen)?;
        let mut params = Vec::new();
        let mut vararg = None;
        if !self.check(&TokenKind::RParen) {
            loop {
                if self.match_and_consume(&TokenKind::Ellipsis) {
                    vararg = Some(self.expect_name()?);
                    break;
                }
                params.push(self.expect_name()?);
                if !self.match_and_consume(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(&TokenKind::RParen)?;
        Ok((params, vararg))
    }

    // ---- Expressions ----

    fn parse_expression(&mut self, min_prec: u8) -> Result<Expr, CompileError> {
        let tok = self
            .advance()
            .ok_or_else(|| self.error("expected expression, got end of input".into()))?;
        let mut left = self.parse_prefix(tok)?;

        while let Some(kind) = self.peek() {
            let prec = infix_precedence(kind);
            if prec == 0 || prec <= min_prec {
                break;
            }
            let tok = self
                .advance()
                .ok_or_else(|| self.error("expected operator, got end of input".into()))?;
            left = self.parse_infix(left, tok)?;
        }
        Ok(left)
    }

    fn parse_prefix(&mut self, tok: TokenKind) -> Result<Expr, CompileError> {
        use TokenKind::*;
        match tok {
            Number(n) => Ok(Expr::Number(n)),
            Str(s) => Ok(Expr::Str(s)),
            True => Ok(Expr::Bool(true)),
            False => Ok(Expr::Bool(false)),
            Null => Ok(Expr::Null),
            Name(s) => Ok(Expr::Name(s)),
            LParen => {
                let expr = self.parse_expression(0)?;
                self.expect(&RParen)?;
                Ok(expr)
            }
            LBracket => {
                let mut items = Vec::new();
                while !self.check(&RBracket) {
                    items.push(self.parse_expression(0)?);
                    if !self.match_and_consume(&Comma) {
                        break;
                    }
                }
                self.expect(&RBracket)?;
                Ok(Expr::Array(items))
            }
            LBrace => {
                let mut fields = Vec::new();
                if !self.match_and_consume(&RBrace) {
                    loop {
                        let key = match self.advance() {
                            Some(Name(s)) | Some(Str(s)) => s,
                            Some(Number(n)) => crate::vm::format_number(n),
                            other => {
                                return Err(self.error(format!(
                                    "expected field name, got {:?}",
                                    other
                                )));
                            }
                        };
                        self.expect(&Assign)?;
                        let value = self.parse_expression(0)?;
                        fields.push((key, value));
                        if !self.match_and_consume(&Comma) {
                            break;
                        }
                    }
                    self.expect(&RBrace)?;
                }
                Ok(Expr::Object(fields))
            }
            Minus => {
                let expr = self.parse_expression(PREC_PREFIX)?;
                Ok(Expr::Prefix { op: UnOp::Negate, expr: Box::new(expr) })
            }
            Tilde => {
                let expr = self.parse_expression(PREC_PREFIX)?;
                Ok(Expr::Prefix { op: UnOp::BitNot, expr: Box::new(expr) })
            }
            Increment => {
                let expr = self.parse_expression(PREC_PREFIX)?;
                Ok(Expr::Prefix { op: UnOp::Incr, expr: Box::new(expr) })
            }
            Decrement => {
                let expr = self.parse_expression(PREC_PREFIX)?;
                Ok(Expr::Prefix { op: UnOp::Decr, expr: Box::new(expr) })
            }
            Function => {
                let line = self.line();
                let (params, vararg) = self.parse_params()?;
                let body = self.parse_block(false)?;
                Ok(Expr::Lambda(Box::new(FunctionDef { name: None, params, vararg, body, line })))
            }
            other => Err(self.error(format!("expected expression, got {:?}", other))),
        }
    }

    fn parse_infix(&mut self, left: Expr, tok: TokenKind) -> Result<Expr, CompileError> {
        use TokenKind::*;
        match tok {
            Assign => {
                if !left.is_storable() {
                    return Err(self.error("left hand side must be a storable location".into()));
                }
                let value = self.parse_expression(PREC_ASSIGN - 1)?;
                Ok(Expr::Assign { target: Box::new(left), value: Box::new(value) })
            }
            AddAssign | SubAssign | MulAssign | DivAssign => {
                if !left.is_storable() {
                    return Err(self.error("left hand side must be a storable location".into()));
                }
                let op = match tok {
                    AddAssign => BinOp::Add,
                    SubAssign => BinOp::Sub,
                    MulAssign => BinOp::Mul,
                    _ => BinOp::Div,
                };
                let value = self.parse_expression(PREC_ASSIGN - 1)?;
                Ok(Expr::OpAssign { op, target: Box::new(left), value: Box::new(value) })
            }
            Increment => {
                if !left.is_storable() {
                    return Err(self.error("++ needs a storable location".into()));
                }
                Ok(Expr::Postfix { op: UnOp::Incr, expr: Box::new(left) })
            }
            Decrement => {
                if !left.is_storable() {
                    return Err(self.error("-- needs a storable location".into()));
                }
                Ok(Expr::Postfix { op: UnOp::Decr, expr: Box::new(left) })
            }
            LParen => {
                let mut args = Vec::new();
                if !self.match_and_consume(&RParen) {
                    loop {
                        args.push(self.parse_expression(0)?);
                        if !self.match_and_consume(&Comma) {
                            break;
                        }
                    }
                    self.expect(&RParen)?;
                }
                Ok(Expr::Call { callee: Box::new(left), args })
            }
            LBracket => {
                let index = self.parse_expression(0)?;
                self.expect(&RBracket)?;
                Ok(Expr::Index { object: Box::new(left), index: Box::new(index) })
            }
            Dot => {
                let name = self.expect_name()?;
                Ok(Expr::Index { object: Box::new(left), index: Box::new(Expr::Str(name)) })
            }
            other => {
                let op = binary_op(&other)
                    .ok_or_else(|| self.error(format!("unexpected operator {:?}", other)))?;
                let prec = infix_precedence(&other);
                let rhs = self.parse_expression(prec)?;
                Ok(Expr::Binary { op, lhs: Box::new(left), rhs: Box::new(rhs) })
            }
        }
    }
}
