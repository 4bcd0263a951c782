//! Recursive-descent parser for expressions.
//!
//! Precedence, lowest to highest:
//!
//! | Level | Operators |
//! |-------|-----------|
//! | ternary | `c ? a : b` (right-associative) |
//! | logical or | `or` |
//! | logical and | `and` |
//! | comparison | `== != < <= > >=` (non-chaining) |
//! | bitwise or / xor / and | `\|`, `^`, `&` |
//! | shift | `<< >>` |
//! | additive | `+ -` |
//! | multiplicative | `* / %` |
//! | unary | `-`, `not` |
//! | postfix | `expr[index]` |
//! | primary | literals, identifiers, calls, `( ... )` |

use super::lexer::{tokenize, Spanned, Token};
use super::{BinaryOp, Expr, ExprError, Expression, UnaryOp};

/// Parse text (optionally wrapped in `{...}`) into an [`Expression`].
pub fn parse(text: &str) -> Result<Expression, ExprError> {
    let trimmed = text.trim();
    let body = trimmed
        .strip_prefix('{')
        .and_then(|s| s.strip_suffix('}'))
        .unwrap_or(trimmed);
    let tokens = tokenize(body)?;
    let mut parser = Parser { tokens, pos: 0 };
    let root = parser.ternary()?;
    let next = parser.peek();
    if *next != Token::Eof {
        return Err(ExprError::Syntax(format!(
            "unexpected token '{}' at position {}",
            next.describe(),
            parser.tokens[parser.pos].pos
        )));
    }
    Ok(Expression {
        source: text.to_string(),
        root,
    })
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        // tokenize always ends with Eof and the parser never advances past it
        &self.tokens[self.pos.min(self.tokens.len() - 1)].token
    }

    fn advance(&mut self) -> Token {
        let tok = self.peek().clone();
        if tok != Token::Eof {
            self.pos += 1;
        }
        tok
    }

    fn expect(&mut self, want: Token) -> Result<(), ExprError> {
        if *self.peek() == want {
            self.advance();
            Ok(())
        } else {
            let at = self.tokens[self.pos.min(self.tokens.len() - 1)].pos;
            Err(ExprError::Syntax(format!(
                "expected '{}' but found '{}' at position {}",
                want.describe(),
                self.peek().describe(),
                at
            )))
        }
    }

    fn ternary(&mut self) -> Result<Expr, ExprError> {
        let cond = self.logical_or()?;
        if *self.peek() != Token::Question {
            return Ok(cond);
        }
        self.advance();
        let then = self.ternary()?;
        self.expect(Token::Colon)?;
        let otherwise = self.ternary()?;
        Ok(Expr::Ternary {
            cond: Box::new(cond),
            then: Box::new(then),
            otherwise: Box::new(otherwise),
        })
    }

    fn logical_or(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.logical_and()?;
        while *self.peek() == Token::Or {
            self.advance();
            let rhs = self.logical_and()?;
            lhs = binary(BinaryOp::Or, lhs, rhs);
        }
        Ok(lhs)
    }

    fn logical_and(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.comparison()?;
        while *self.peek() == Token::And {
            self.advance();
            let rhs = self.comparison()?;
            lhs = binary(BinaryOp::And, lhs, rhs);
        }
        Ok(lhs)
    }

    fn comparison(&mut self) -> Result<Expr, ExprError> {
        let lhs = self.bit_or()?;
        let op = match self.peek() {
            Token::EqEq => BinaryOp::Eq,
            Token::NotEq => BinaryOp::Ne,
            Token::Lt => BinaryOp::Lt,
            Token::Le => BinaryOp::Le,
            Token::Gt => BinaryOp::Gt,
            Token::Ge => BinaryOp::Ge,
            _ => return Ok(lhs),
        };
        self.advance();
        let rhs = self.bit_or()?;
        Ok(binary(op, lhs, rhs))
    }

    fn bit_or(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.bit_xor()?;
        while *self.peek() == Token::Pipe {
            self.advance();
            let rhs = self.bit_xor()?;
            lhs = binary(BinaryOp::BitOr, lhs, rhs);
        }
        Ok(lhs)
    }

    fn bit_xor(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.bit_and()?;
        while *self.peek() == Token::Caret {
            self.advance();
            let rhs = self.bit_and()?;
            lhs = binary(BinaryOp::BitXor, lhs, rhs);
        }
        Ok(lhs)
    }

    fn bit_and(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.shift()?;
        while *self.peek() == Token::Amp {
            self.advance();
            let rhs = self.shift()?;
            lhs = binary(BinaryOp::BitAnd, lhs, rhs);
        }
        Ok(lhs)
    }

    fn shift(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.additive()?;
        loop {
            let op = match self.peek() {
                Token::Shl => BinaryOp::Shl,
                Token::Shr => BinaryOp::Shr,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.additive()?;
            lhs = binary(op, lhs, rhs);
        }
    }

    fn additive(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Token::Plus => BinaryOp::Add,
                Token::Minus => BinaryOp::Sub,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.multiplicative()?;
            lhs = binary(op, lhs, rhs);
        }
    }

    fn multiplicative(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Token::Star => BinaryOp::Mul,
                Token::Slash => BinaryOp::Div,
                Token::Percent => BinaryOp::Mod,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.unary()?;
            lhs = binary(op, lhs, rhs);
        }
    }

    fn unary(&mut self) -> Result<Expr, ExprError> {
        let op = match self.peek() {
            Token::Minus => UnaryOp::Neg,
            Token::Not => UnaryOp::Not,
            _ => return self.postfix(),
        };
        self.advance();
        let operand = self.unary()?;
        Ok(Expr::Unary {
            op,
            operand: Box::new(operand),
        })
    }

    fn postfix(&mut self) -> Result<Expr, ExprError> {
        let mut expr = self.primary()?;
        while *self.peek() == Token::LBracket {
            self.advance();
            let index = self.ternary()?;
            self.expect(Token::RBracket)?;
            expr = Expr::Index {
                target: Box::new(expr),
                index: Box::new(index),
            };
        }
        Ok(expr)
    }

    fn primary(&mut self) -> Result<Expr, ExprError> {
        let at = self.tokens[self.pos.min(self.tokens.len() - 1)].pos;
        match self.advance() {
            Token::Int(v) => Ok(Expr::Int(v)),
            Token::Str(s) => Ok(Expr::Str(s)),
            Token::Ident(name) => {
                if *self.peek() != Token::LParen {
                    return Ok(Expr::Var(name));
                }
                self.advance();
                let mut args = Vec::new();
                if *self.peek() != Token::RParen {
                    loop {
                        args.push(self.ternary()?);
                        if *self.peek() == Token::Comma {
                            self.advance();
                        } else {
                            break;
                        }
                    }
                }
                self.expect(Token::RParen)?;
                Ok(Expr::Call { name, args })
            }
            Token::LParen => {
                let inner = self.ternary()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            other => Err(ExprError::Syntax(format!(
                "unexpected token '{}' at position {}",
                other.describe(),
                at
            ))),
        }
    }
}

fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
    Expr::Binary {
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root(text: &str) -> Expr {
        parse(text).unwrap().root
    }

    #[test]
    fn braces_are_stripped() {
        assert_eq!(root("{a + 1}"), root("a + 1"));
        assert_eq!(parse("{a + 1}").unwrap().source, "{a + 1}");
    }

    #[test]
    fn multiplication_binds_tighter() {
        assert_eq!(root("1 + 2 * 3").to_string(), "(1 + (2 * 3))");
    }

    #[test]
    fn ternary_is_right_associative() {
        assert_eq!(root("a ? 1 : b ? 2 : 3").to_string(), "(a ? 1 : (b ? 2 : 3))");
    }

    #[test]
    fn missing_colon() {
        let err = parse("a ? 1").unwrap_err();
        assert!(err.to_string().contains("expected ':'"), "{}", err);
    }

    #[test]
    fn comparisons_do_not_chain() {
        let err = parse("1 < 2 < 3").unwrap_err();
        assert!(err.to_string().contains("unexpected token '<'"), "{}", err);
    }

    #[test]
    fn bitwise_binds_tighter_than_comparison() {
        assert_eq!(root("f & 0x80 != 0").to_string(), "((f & 128) != 0)");
    }
}
