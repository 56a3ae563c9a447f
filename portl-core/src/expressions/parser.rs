use serde_json::Value as JsonValue;

use super::ast::{BinaryOp, Expr, UnaryOp};
use super::lexer::{tokenize, Spanned, Token};
use super::{EvalLimits, TemplateError};

/// Parse a bare expression (no surrounding `{{ }}`).
pub fn parse_expression(input: &str, limits: &EvalLimits) -> Result<Expr, TemplateError> {
    if input.len() > limits.max_expr_len {
        return Err(TemplateError::LimitExceeded(format!(
            "expression is {} bytes, limit is {}",
            input.len(),
            limits.max_expr_len
        )));
    }
    if input.trim().is_empty() {
        return Err(TemplateError::Syntax {
            offset: 0,
            message: "empty expression".to_string(),
        });
    }

    let tokens = tokenize(input)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
        max_depth: limits.max_depth,
        end: input.len(),
    };
    let expr = parser.parse_expr()?;
    if let Some(tok) = parser.tokens.get(parser.pos) {
        return Err(TemplateError::Syntax {
            offset: tok.offset,
            message: format!("unexpected trailing token {:?}", tok.token),
        });
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    depth: usize,
    max_depth: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|s| &s.token)
    }

    fn peek_at(&self, ahead: usize) -> Option<&Token> {
        self.tokens.get(self.pos + ahead).map(|s| &s.token)
    }

    fn offset(&self) -> usize {
        self.tokens.get(self.pos).map(|s| s.offset).unwrap_or(self.end)
    }

    fn advance(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).map(|s| s.token.clone());
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_keyword(&mut self, kw: &str) -> bool {
        if matches!(self.peek(), Some(Token::Ident(name)) if name == kw) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: &Token, what: &str) -> Result<(), TemplateError> {
        if self.eat(expected) {
            Ok(())
        } else {
            Err(self.error(format!("expected {what}")))
        }
    }

    fn error(&self, message: impl Into<String>) -> TemplateError {
        TemplateError::Syntax {
            offset: self.offset(),
            message: message.into(),
        }
    }

    fn enter(&mut self) -> Result<(), TemplateError> {
        self.depth += 1;
        if self.depth > self.max_depth {
            return Err(TemplateError::LimitExceeded(format!(
                "expression nesting exceeds {}",
                self.max_depth
            )));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    fn parse_expr(&mut self) -> Result<Expr, TemplateError> {
        self.enter()?;
        let expr = self.parse_or();
        self.leave();
        expr
    }

    fn parse_or(&mut self) -> Result<Expr, TemplateError> {
        let mut lhs = self.parse_and()?;
        while self.eat_keyword("or") {
            let rhs = self.parse_and()?;
            lhs = Expr::Binary(BinaryOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, TemplateError> {
        let mut lhs = self.parse_not()?;
        while self.eat_keyword("and") {
            let rhs = self.parse_not()?;
            lhs = Expr::Binary(BinaryOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_not(&mut self) -> Result<Expr, TemplateError> {
        if self.eat_keyword("not") {
            self.enter()?;
            let inner = self.parse_not();
            self.leave();
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(inner?)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, TemplateError> {
        let lhs = self.parse_additive()?;
        let (op, width) = match self.peek() {
            Some(Token::Eq) => (BinaryOp::Eq, 1),
            Some(Token::Ne) => (BinaryOp::Ne, 1),
            Some(Token::Lt) => (BinaryOp::Lt, 1),
            Some(Token::Le) => (BinaryOp::Le, 1),
            Some(Token::Gt) => (BinaryOp::Gt, 1),
            Some(Token::Ge) => (BinaryOp::Ge, 1),
            Some(Token::Ident(kw)) if kw == "in" => (BinaryOp::In, 1),
            Some(Token::Ident(kw))
                if kw == "not" && matches!(self.peek_at(1), Some(Token::Ident(n)) if n == "in") =>
            {
                (BinaryOp::NotIn, 2)
            }
            _ => return Ok(lhs),
        };
        self.pos += width;
        let rhs = self.parse_additive()?;
        Ok(Expr::Binary(op, Box::new(lhs), Box::new(rhs)))
    }

    fn parse_additive(&mut self) -> Result<Expr, TemplateError> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                Some(Token::Tilde) => BinaryOp::Concat,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.parse_multiplicative()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, TemplateError> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                Some(Token::Percent) => BinaryOp::Rem,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.parse_unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, TemplateError> {
        if self.eat(&Token::Minus) {
            self.enter()?;
            let inner = self.parse_unary();
            self.leave();
            return Ok(match inner? {
                Expr::Literal(JsonValue::Number(n)) => Expr::Literal(negate_literal(&n)),
                other => Expr::Unary(UnaryOp::Neg, Box::new(other)),
            });
        }
        self.parse_filtered()
    }

    fn parse_filtered(&mut self) -> Result<Expr, TemplateError> {
        let mut subject = self.parse_postfix()?;
        while self.eat(&Token::Pipe) {
            let name = match self.advance() {
                Some(Token::Ident(name)) => name,
                _ => return Err(self.error("expected filter name after '|'")),
            };
            let mut args = vec![subject];
            if self.eat(&Token::LParen) {
                args.extend(self.parse_args()?);
            }
            subject = Expr::Call { name, args };
        }
        Ok(subject)
    }

    fn parse_postfix(&mut self) -> Result<Expr, TemplateError> {
        let mut expr = self.parse_primary()?;
        loop {
            if self.eat(&Token::Dot) {
                match self.advance() {
                    Some(Token::Ident(field)) => expr = Expr::Member(Box::new(expr), field),
                    Some(Token::Int(i)) => {
                        expr = Expr::Index(Box::new(expr), Box::new(Expr::Literal(i.into())))
                    }
                    _ => return Err(self.error("expected field name after '.'")),
                }
            } else if self.eat(&Token::LBracket) {
                let key = self.parse_expr()?;
                self.expect(&Token::RBracket, "']'")?;
                expr = Expr::Index(Box::new(expr), Box::new(key));
            } else if self.peek() == Some(&Token::LParen) {
                let name = match &expr {
                    Expr::Var(name) => name.clone(),
                    _ => return Err(self.error("only named functions can be called")),
                };
                self.pos += 1;
                let args = self.parse_args()?;
                expr = Expr::Call { name, args };
            } else {
                return Ok(expr);
            }
        }
    }

    /// Arguments after an opening `(`, consuming the closing `)`.
    fn parse_args(&mut self) -> Result<Vec<Expr>, TemplateError> {
        let mut args = Vec::new();
        if self.eat(&Token::RParen) {
            return Ok(args);
        }
        loop {
            args.push(self.parse_expr()?);
            if self.eat(&Token::RParen) {
                return Ok(args);
            }
            self.expect(&Token::Comma, "',' or ')'")?;
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, TemplateError> {
        let offset = self.offset();
        let tok = match self.advance() {
            Some(tok) => tok,
            None => return Err(self.error("unexpected end of expression")),
        };

        match tok {
            Token::Int(i) => Ok(Expr::Literal(i.into())),
            Token::Float(f) => serde_json::Number::from_f64(f)
                .map(|n| Expr::Literal(JsonValue::Number(n)))
                .ok_or_else(|| TemplateError::Syntax {
                    offset,
                    message: "non-finite number".to_string(),
                }),
            Token::Str(s) => Ok(Expr::Literal(JsonValue::String(s))),
            Token::Ident(name) => Ok(match name.as_str() {
                "true" | "True" => Expr::Literal(JsonValue::Bool(true)),
                "false" | "False" => Expr::Literal(JsonValue::Bool(false)),
                "null" | "none" | "None" => Expr::Literal(JsonValue::Null),
                "and" | "or" | "not" | "in" => {
                    return Err(TemplateError::Syntax {
                        offset,
                        message: format!("unexpected keyword '{name}'"),
                    })
                }
                _ => Expr::Var(name),
            }),
            Token::LParen => {
                let inner = self.parse_expr()?;
                self.expect(&Token::RParen, "')'")?;
                Ok(inner)
            }
            Token::LBracket => {
                let mut items = Vec::new();
                if self.eat(&Token::RBracket) {
                    return Ok(Expr::List(items));
                }
                loop {
                    items.push(self.parse_expr()?);
                    if self.eat(&Token::RBracket) {
                        return Ok(Expr::List(items));
                    }
                    self.expect(&Token::Comma, "',' or ']'")?;
                    // trailing comma
                    if self.eat(&Token::RBracket) {
                        return Ok(Expr::List(items));
                    }
                }
            }
            Token::LBrace => {
                let mut entries = Vec::new();
                if self.eat(&Token::RBrace) {
                    return Ok(Expr::Object(entries));
                }
                loop {
                    let key = match self.advance() {
                        Some(Token::Str(k)) | Some(Token::Ident(k)) => k,
                        _ => return Err(self.error("expected object key")),
                    };
                    self.expect(&Token::Colon, "':'")?;
                    entries.push((key, self.parse_expr()?));
                    if self.eat(&Token::RBrace) {
                        return Ok(Expr::Object(entries));
                    }
                    self.expect(&Token::Comma, "',' or '}'")?;
                    if self.eat(&Token::RBrace) {
                        return Ok(Expr::Object(entries));
                    }
                }
            }
            other => Err(TemplateError::Syntax {
                offset,
                message: format!("unexpected token {other:?}"),
            }),
        }
    }
}

fn negate_literal(n: &serde_json::Number) -> JsonValue {
    if let Some(i) = n.as_i64().and_then(|i| i.checked_neg()) {
        return i.into();
    }
    n.as_f64()
        .and_then(|f| serde_json::Number::from_f64(-f))
        .map(JsonValue::Number)
        .unwrap_or(JsonValue::Null)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(input: &str) -> Expr {
        parse_expression(input, &EvalLimits::default()).unwrap()
    }

    #[test]
    fn filter_desugars_into_call() {
        assert_eq!(
            parse("row | tojson"),
            Expr::Call {
                name: "tojson".into(),
                args: vec![Expr::Var("row".into())],
            }
        );
        assert_eq!(parse("x | default(1)").to_string(), "default(x, 1)");
    }

    #[test]
    fn path_with_brackets_and_dots() {
        assert_eq!(
            parse("steps.upsert.rows[idx][\"id\"]").to_string(),
            "steps.upsert.rows[idx][\"id\"]"
        );
    }

    #[test]
    fn precedence_binds_comparison_below_arithmetic() {
        assert_eq!(parse("a + 1 * 2 > 3 and not b").to_string(), "(((a + (1 * 2)) > 3) and not b)");
    }

    #[test]
    fn not_in_is_a_single_operator() {
        assert!(matches!(parse("a not in b"), Expr::Binary(BinaryOp::NotIn, _, _)));
    }

    #[test]
    fn trailing_tokens_are_rejected() {
        assert!(parse_expression("a b", &EvalLimits::default()).is_err());
    }

    #[test]
    fn nesting_is_bounded() {
        let limits = EvalLimits {
            max_depth: 8,
            ..EvalLimits::default()
        };
        let deep = format!("{}1{}", "(".repeat(20), ")".repeat(20));
        assert!(matches!(
            parse_expression(&deep, &limits),
            Err(TemplateError::LimitExceeded(_))
        ));
    }

    #[test]
    fn method_style_calls_are_rejected() {
        assert!(parse_expression("a.b(1)", &EvalLimits::default()).is_err());
    }
}
