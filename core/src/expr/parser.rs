//! Measure expression parser
//!
//! Precedence climbing over the shared token stream:
//!
//! ```text
//! expr     := term (('+' | '-') term)*
//! term     := unary (('*' | '/' | '%') unary)*
//! unary    := '-' unary | primary
//! primary  := number | string | ident ['.' ident] | call | '(' expr ')'
//!           | 'distinct' unary
//! call     := ident '(' [ '*' | ['distinct'] expr (',' expr)* ] ')'
//! ```

use serde::{Deserialize, Serialize};

use super::lexer::{tokenize, Token, TokenKind};
use super::SyntaxError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    #[serde(rename = "+")]
    Add,
    #[serde(rename = "-")]
    Sub,
    #[serde(rename = "*")]
    Mul,
    #[serde(rename = "/")]
    Div,
    #[serde(rename = "%")]
    Mod,
}

impl BinaryOp {
    fn binding_power(self) -> u8 {
        match self {
            Self::Add | Self::Sub => 1,
            Self::Mul | Self::Div | Self::Mod => 2,
        }
    }

    fn from_token(kind: &TokenKind) -> Option<Self> {
        match kind {
            TokenKind::Plus => Some(Self::Add),
            TokenKind::Minus => Some(Self::Sub),
            TokenKind::Star => Some(Self::Mul),
            TokenKind::Slash => Some(Self::Div),
            TokenKind::Percent => Some(Self::Mod),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LiteralValue {
    Number(f64),
    String(String),
}

/// Parsed expression tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Expr {
    Call {
        name: String,
        #[serde(default)]
        distinct: bool,
        args: Vec<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Unary {
        operand: Box<Expr>,
    },
    Identifier {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        qualifier: Option<String>,
    },
    Literal {
        value: LiteralValue,
    },
    /// `*` inside `count(*)`.
    Wildcard,
}

impl Expr {
    /// Column names in order of first appearance.
    pub fn referenced_columns(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.walk(&mut |e| {
            if let Expr::Identifier { name, .. } = e {
                if !out.contains(name) {
                    out.push(name.clone());
                }
            }
        });
        out
    }

    /// Pre-order traversal.
    pub fn walk<F: FnMut(&Expr)>(&self, f: &mut F) {
        f(self);
        match self {
            Expr::Call { args, .. } => args.iter().for_each(|a| a.walk(f)),
            Expr::Binary { left, right, .. } => {
                left.walk(f);
                right.walk(f);
            }
            Expr::Unary { operand } => operand.walk(f),
            Expr::Identifier { .. } | Expr::Literal { .. } | Expr::Wildcard => {}
        }
    }
}

/// Parse a measure expression.
pub fn parse_expression(source: &str) -> Result<Expr, SyntaxError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };

    if parser.peek().kind == TokenKind::Eof {
        return Err(SyntaxError::new("empty expression", "", 0));
    }

    let expr = parser.expression(0)?;
    let next = parser.peek();
    if next.kind != TokenKind::Eof {
        return Err(SyntaxError::unexpected(next));
    }
    Ok(expr)
}

/// Nesting limit for parentheses, prefix operators and calls.
const MAX_DEPTH: usize = 256;

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        // tokenize always ends with Eof, and Eof is never consumed.
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_at(&self, ahead: usize) -> &Token {
        &self.tokens[(self.pos + ahead).min(self.tokens.len() - 1)]
    }

    fn bump(&mut self) -> Token {
        let tok = self.peek().clone();
        if tok.kind != TokenKind::Eof {
            self.pos += 1;
        }
        tok
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> Result<Token, SyntaxError> {
        let tok = self.peek();
        if tok.kind == kind {
            Ok(self.bump())
        } else {
            Err(SyntaxError::new(
                format!("expected {what}"),
                tok.text.clone(),
                tok.offset,
            ))
        }
    }

    fn expression(&mut self, min_power: u8) -> Result<Expr, SyntaxError> {
        let mut left = self.unary()?;

        while let Some(op) = BinaryOp::from_token(&self.peek().kind) {
            let power = op.binding_power();
            if power <= min_power {
                break;
            }
            self.bump();
            let right = self.expression(power)?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }

        Ok(left)
    }

    // Every recursive path goes through here.
    fn unary(&mut self) -> Result<Expr, SyntaxError> {
        if self.depth >= MAX_DEPTH {
            let tok = self.peek();
            return Err(SyntaxError::new(
                "expression nested too deeply",
                tok.text.clone(),
                tok.offset,
            ));
        }
        self.depth += 1;
        let expr = self.unary_inner();
        self.depth -= 1;
        expr
    }

    fn unary_inner(&mut self) -> Result<Expr, SyntaxError> {
        if self.peek().kind == TokenKind::Minus {
            self.bump();
            let operand = self.unary()?;
            return Ok(Expr::Unary {
                operand: Box::new(operand),
            });
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, SyntaxError> {
        let tok = self.bump();
        match tok.kind {
            TokenKind::Number(n) => Ok(Expr::Literal {
                value: LiteralValue::Number(n),
            }),
            TokenKind::Str(s) => Ok(Expr::Literal {
                value: LiteralValue::String(s),
            }),
            TokenKind::LParen => {
                let inner = self.expression(0)?;
                self.expect(TokenKind::RParen, "')'")?;
                Ok(inner)
            }
            TokenKind::Ident(ref name) if name.eq_ignore_ascii_case("distinct") => {
                let operand = self.unary()?;
                Ok(Expr::Call {
                    name: "distinct".to_string(),
                    distinct: false,
                    args: vec![operand],
                })
            }
            TokenKind::Ident(name) => {
                if self.peek().kind == TokenKind::LParen {
                    self.bump();
                    return self.call(name);
                }
                self.identifier(name)
            }
            TokenKind::QuotedIdent(name) => self.identifier(name),
            TokenKind::Eof => Err(SyntaxError::new("unexpected end of expression", "", tok.offset)),
            _ => Err(SyntaxError::unexpected(&tok)),
        }
    }

    fn identifier(&mut self, name: String) -> Result<Expr, SyntaxError> {
        if self.peek().kind == TokenKind::Dot {
            if let Some(column) = self.peek_at(1).ident().map(str::to_string) {
                self.bump();
                self.bump();
                return Ok(Expr::Identifier {
                    name: column,
                    qualifier: Some(name),
                });
            }
            let dot = self.bump();
            return Err(SyntaxError::new("expected column after '.'", dot.text, dot.offset));
        }
        Ok(Expr::Identifier {
            name,
            qualifier: None,
        })
    }

    fn call(&mut self, name: String) -> Result<Expr, SyntaxError> {
        let name = name.to_ascii_lowercase();

        if self.peek().kind == TokenKind::RParen {
            self.bump();
            return Ok(Expr::Call {
                name,
                distinct: false,
                args: Vec::new(),
            });
        }

        if self.peek().kind == TokenKind::Star && self.peek_at(1).kind == TokenKind::RParen {
            self.bump();
            self.bump();
            return Ok(Expr::Call {
                name,
                distinct: false,
                args: vec![Expr::Wildcard],
            });
        }

        let distinct = self.peek().is_keyword("distinct");
        if distinct {
            self.bump();
        }

        let mut args = vec![self.expression(0)?];
        while self.peek().kind == TokenKind::Comma {
            self.bump();
            args.push(self.expression(0)?);
        }
        self.expect(TokenKind::RParen, "')' to close call")?;

        Ok(Expr::Call {
            name,
            distinct,
            args,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn ident(name: &str) -> Expr {
        Expr::Identifier {
            name: name.into(),
            qualifier: None,
        }
    }

    #[test]
    fn test_precedence() {
        let expr = parse_expression("a + b * 2").unwrap();
        assert_eq!(
            expr,
            Expr::Binary {
                op: BinaryOp::Add,
                left: Box::new(ident("a")),
                right: Box::new(Expr::Binary {
                    op: BinaryOp::Mul,
                    left: Box::new(ident("b")),
                    right: Box::new(Expr::Literal {
                        value: LiteralValue::Number(2.0)
                    }),
                }),
            }
        );
    }

    #[test]
    fn test_left_associative() {
        let expr = parse_expression("a - b - c").unwrap();
        let Expr::Binary { left, right, .. } = expr else {
            panic!("expected binary");
        };
        assert_eq!(*right, ident("c"));
        assert!(matches!(*left, Expr::Binary { op: BinaryOp::Sub, .. }));
    }

    #[test]
    fn test_count_forms() {
        assert_eq!(
            parse_expression("COUNT(*)").unwrap(),
            Expr::Call {
                name: "count".into(),
                distinct: false,
                args: vec![Expr::Wildcard],
            }
        );
        assert_eq!(
            parse_expression("count(distinct user_id)").unwrap(),
            Expr::Call {
                name: "count".into(),
                distinct: true,
                args: vec![ident("user_id")],
            }
        );
    }

    #[test]
    fn test_standalone_distinct() {
        assert_eq!(
            parse_expression("distinct x").unwrap(),
            Expr::Call {
                name: "distinct".into(),
                distinct: false,
                args: vec![ident("x")],
            }
        );
    }

    #[test]
    fn test_unary_and_parens() {
        let expr = parse_expression("-(sum(a) / 2)").unwrap();
        assert!(matches!(expr, Expr::Unary { .. }));
        assert_eq!(expr.referenced_columns(), vec!["a".to_string()]);
    }

    #[test]
    fn test_quoted_and_qualified_identifiers() {
        let expr = parse_expression(r#"sum("Unit Price") + max(o.qty)"#).unwrap();
        assert_eq!(
            expr.referenced_columns(),
            vec!["Unit Price".to_string(), "qty".to_string()]
        );
    }

    #[test]
    fn test_referenced_columns_first_appearance() {
        let expr = parse_expression("sum(b) / sum(a) + avg(b)").unwrap();
        assert_eq!(expr.referenced_columns(), vec!["b", "a"]);
    }

    #[test]
    fn test_syntax_errors_carry_offsets() {
        let err = parse_expression("sum(price").unwrap_err();
        assert_eq!(err.offset, 9);

        let err = parse_expression("sum(price) )").unwrap_err();
        assert_eq!(err.token, ")");
        assert_eq!(err.offset, 11);

        let err = parse_expression("a +").unwrap_err();
        assert_eq!(err.offset, 3);

        assert!(parse_expression("   ").is_err());
        assert!(parse_expression("a = b").is_err());
    }

    #[test]
    fn test_nesting_limit() {
        let nested = format!("{}sum(x){}", "(".repeat(100_000), ")".repeat(100_000));
        let err = parse_expression(&nested).unwrap_err();
        assert_eq!(err.message, "expression nested too deeply");
        assert_eq!(err.token, "(");

        let err = parse_expression(&format!("{}x", "- ".repeat(10_000))).unwrap_err();
        assert_eq!(err.message, "expression nested too deeply");

        let shallow = format!("{}sum(x){}", "(".repeat(100), ")".repeat(100));
        assert!(parse_expression(&shallow).is_ok());
    }

    #[test]
    fn test_tree_wire_shape() {
        let expr = parse_expression("sum(x)").unwrap();
        assert_eq!(
            serde_json::to_value(&expr).unwrap(),
            json!({
                "type": "call",
                "name": "sum",
                "distinct": false,
                "args": [{"type": "identifier", "name": "x"}],
            })
        );
    }
}
