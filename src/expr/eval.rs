//! Evaluate expression ASTs against the variable frames of a [`DecodeContext`].

use super::{BinaryOp, Expr, ExprError, Expression, UnaryOp};
use crate::context::DecodeContext;
use crate::value::RuntimeValue;

/// Evaluate `expr` against the context's current frames.
pub fn evaluate(expr: &Expression, ctx: &DecodeContext<'_>) -> Result<RuntimeValue, ExprError> {
    eval_node(&expr.root, ctx)
}

/// Evaluate and coerce to an integer (bools become 0/1, integral floats truncate).
pub fn evaluate_as_long(expr: &Expression, ctx: &DecodeContext<'_>) -> Result<i64, ExprError> {
    let v = evaluate(expr, ctx)?;
    v.as_i64().ok_or_else(|| {
        ExprError::TypeMismatch(format!("expected integer from '{}', got {}", expr.source, v.kind()))
    })
}

/// Evaluate and coerce to a boolean using [`RuntimeValue::truthy`].
pub fn evaluate_as_bool(expr: &Expression, ctx: &DecodeContext<'_>) -> Result<bool, ExprError> {
    Ok(evaluate(expr, ctx)?.truthy())
}

fn eval_node(node: &Expr, ctx: &DecodeContext<'_>) -> Result<RuntimeValue, ExprError> {
    match node {
        Expr::Int(v) => Ok(RuntimeValue::Int(*v)),
        Expr::Str(s) => Ok(RuntimeValue::Str(s.clone())),
        Expr::Var(name) => ctx
            .get_variable(name)
            .cloned()
            .ok_or_else(|| ExprError::UndefinedVariable(name.clone())),
        Expr::Unary { op, operand } => {
            let v = eval_node(operand, ctx)?;
            match (op, v) {
                (UnaryOp::Neg, RuntimeValue::Int(x)) => x
                    .checked_neg()
                    .map(RuntimeValue::Int)
                    .ok_or_else(|| ExprError::Overflow("-".to_string())),
                (UnaryOp::Neg, RuntimeValue::Float(x)) => Ok(RuntimeValue::Float(-x)),
                (UnaryOp::Not, v @ (RuntimeValue::Bool(_) | RuntimeValue::Int(_))) => {
                    Ok(RuntimeValue::Bool(!v.truthy()))
                }
                (op, v) => Err(ExprError::TypeMismatch(format!(
                    "cannot apply {} to {}",
                    if *op == UnaryOp::Neg { "-" } else { "not" },
                    v.kind()
                ))),
            }
        }
        Expr::Binary { op: BinaryOp::And, lhs, rhs } => {
            if !eval_node(lhs, ctx)?.truthy() {
                return Ok(RuntimeValue::Bool(false));
            }
            Ok(RuntimeValue::Bool(eval_node(rhs, ctx)?.truthy()))
        }
        Expr::Binary { op: BinaryOp::Or, lhs, rhs } => {
            if eval_node(lhs, ctx)?.truthy() {
                return Ok(RuntimeValue::Bool(true));
            }
            Ok(RuntimeValue::Bool(eval_node(rhs, ctx)?.truthy()))
        }
        Expr::Binary { op, lhs, rhs } => {
            let l = eval_node(lhs, ctx)?;
            let r = eval_node(rhs, ctx)?;
            binary(*op, l, r)
        }
        Expr::Ternary { cond, then, otherwise } => {
            if eval_node(cond, ctx)?.truthy() {
                eval_node(then, ctx)
            } else {
                eval_node(otherwise, ctx)
            }
        }
        Expr::Index { target, index } => {
            let list = eval_node(target, ctx)?;
            let items = match &list {
                RuntimeValue::List(items) => items,
                other => return Err(ExprError::NotAnArray(format!("{} ({})", target, other.kind()))),
            };
            let i = eval_node(index, ctx)?;
            let i = i
                .as_i64()
                .ok_or_else(|| ExprError::TypeMismatch(format!("index must be integer, got {}", i.kind())))?;
            if i < 0 || i as usize >= items.len() {
                return Err(ExprError::IndexOutOfRange { index: i, len: items.len() });
            }
            Ok(items[i as usize].clone())
        }
        Expr::Call { name, args } => call(name, args, ctx),
    }
}

fn binary(op: BinaryOp, l: RuntimeValue, r: RuntimeValue) -> Result<RuntimeValue, ExprError> {
    use RuntimeValue::*;
    match op {
        BinaryOp::Eq => return Ok(Bool(values_equal(&l, &r))),
        BinaryOp::Ne => return Ok(Bool(!values_equal(&l, &r))),
        _ => {}
    }
    if let (Int(a), Int(b)) = (&l, &r) {
        let (a, b) = (*a, *b);
        let overflow = || ExprError::Overflow(op.symbol().to_string());
        return Ok(match op {
            BinaryOp::Add => Int(a.checked_add(b).ok_or_else(overflow)?),
            BinaryOp::Sub => Int(a.checked_sub(b).ok_or_else(overflow)?),
            BinaryOp::Mul => Int(a.checked_mul(b).ok_or_else(overflow)?),
            BinaryOp::Div => {
                if b == 0 {
                    return Err(ExprError::DivisionByZero);
                }
                Int(a.checked_div(b).ok_or_else(overflow)?)
            }
            BinaryOp::Mod => {
                if b == 0 {
                    return Err(ExprError::DivisionByZero);
                }
                Int(a.checked_rem(b).ok_or_else(overflow)?)
            }
            BinaryOp::Lt => Bool(a < b),
            BinaryOp::Le => Bool(a <= b),
            BinaryOp::Gt => Bool(a > b),
            BinaryOp::Ge => Bool(a >= b),
            BinaryOp::BitAnd => Int(a & b),
            BinaryOp::BitOr => Int(a | b),
            BinaryOp::BitXor => Int(a ^ b),
            BinaryOp::Shl | BinaryOp::Shr => {
                if !(0..64).contains(&b) {
                    return Err(ExprError::Overflow(format!("shift by {}", b)));
                }
                if op == BinaryOp::Shl {
                    Int(a << b)
                } else {
                    Int(a >> b)
                }
            }
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
        });
    }
    if l.is_numeric() && r.is_numeric() {
        let (a, b) = (l.as_f64().unwrap_or(0.0), r.as_f64().unwrap_or(0.0));
        let v = match op {
            BinaryOp::Add => Float(a + b),
            BinaryOp::Sub => Float(a - b),
            BinaryOp::Mul => Float(a * b),
            BinaryOp::Div => Float(a / b),
            BinaryOp::Mod => Float(a % b),
            BinaryOp::Lt => Bool(a < b),
            BinaryOp::Le => Bool(a <= b),
            BinaryOp::Gt => Bool(a > b),
            BinaryOp::Ge => Bool(a >= b),
            _ => {
                return Err(ExprError::TypeMismatch(format!(
                    "'{}' requires integer operands",
                    op.symbol()
                )))
            }
        };
        return Ok(v);
    }
    if let (BinaryOp::Add, Str(a), Str(b)) = (op, &l, &r) {
        return Ok(Str(format!("{}{}", a, b)));
    }
    Err(ExprError::TypeMismatch(format!(
        "cannot apply '{}' to {} and {}",
        op.symbol(),
        l.kind(),
        r.kind()
    )))
}

pub fn values_equal(l: &RuntimeValue, r: &RuntimeValue) -> bool {
    match (l, r) {
        (RuntimeValue::Int(a), RuntimeValue::Int(b)) => a == b,
        (a, b) if a.is_numeric() && b.is_numeric() => a.as_f64() == b.as_f64(),
        (RuntimeValue::Str(a), RuntimeValue::Str(b)) => a == b,
        (RuntimeValue::Bool(a), RuntimeValue::Bool(b)) => a == b,
        (RuntimeValue::List(a), RuntimeValue::List(b)) => a == b,
        _ => false,
    }
}

fn call(name: &str, args: &[Expr], ctx: &DecodeContext<'_>) -> Result<RuntimeValue, ExprError> {
    match name {
        "parse_int" => {
            if args.len() != 2 {
                return Err(ExprError::ArgumentCount {
                    function: name.to_string(),
                    message: format!("expected exactly 2 arguments, got {}", args.len()),
                });
            }
            let text = match eval_node(&args[0], ctx)? {
                RuntimeValue::Str(s) => s,
                RuntimeValue::Int(v) => v.to_string(),
                other => {
                    return Err(ExprError::TypeMismatch(format!(
                        "parse_int expects a string, got {}",
                        other.kind()
                    )))
                }
            };
            let base = eval_node(&args[1], ctx)?;
            let base = base
                .as_i64()
                .ok_or_else(|| ExprError::TypeMismatch(format!("base must be integer, got {}", base.kind())))?;
            Ok(RuntimeValue::Int(parse_int(&text, base)?))
        }
        "until_marker" => {
            if args.is_empty() {
                return Err(ExprError::ArgumentCount {
                    function: name.to_string(),
                    message: "requires at least 1 argument".to_string(),
                });
            }
            let mut marker = Vec::with_capacity(args.len());
            for a in args {
                let v = eval_node(a, ctx)?;
                match v.as_i64() {
                    Some(b @ 0..=255) => marker.push(b as u8),
                    _ => {
                        return Err(ExprError::TypeMismatch(format!(
                            "until_marker arguments must be bytes (0..=255), got {}",
                            v
                        )))
                    }
                }
            }
            let window = ctx.peek_remaining();
            let found = window.windows(marker.len()).position(|w| w == marker.as_slice());
            Ok(RuntimeValue::Int(found.unwrap_or(window.len()) as i64))
        }
        other => Err(ExprError::UnknownFunction(other.to_string())),
    }
}

/// Parse `text` in `base`, trimming NUL and whitespace padding. Empty or
/// unparseable text yields 0.
pub fn parse_int(text: &str, base: i64) -> Result<i64, ExprError> {
    if ![2, 8, 10, 16].contains(&base) {
        return Err(ExprError::InvalidBase(base));
    }
    let trimmed = text.trim_matches(|c: char| c == '\0' || c.is_whitespace());
    Ok(i64::from_str_radix(trimmed, base as u32).unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(text: &str) -> Result<RuntimeValue, ExprError> {
        let ctx = DecodeContext::new(&[], crate::schema::Endianness::Little);
        evaluate(&Expression::parse(text)?, &ctx)
    }

    #[test]
    fn arithmetic_and_precedence() {
        assert_eq!(eval("2 + 3 * 4").unwrap(), RuntimeValue::Int(14));
        assert_eq!(eval("(2 + 3) * 4").unwrap(), RuntimeValue::Int(20));
        assert_eq!(eval("1 << 4 | 1").unwrap(), RuntimeValue::Int(17));
        assert_eq!(eval("-7 % 3").unwrap(), RuntimeValue::Int(-1));
    }

    #[test]
    fn division_by_zero_is_an_error() {
        assert_eq!(eval("1 / 0"), Err(ExprError::DivisionByZero));
        assert_eq!(eval("1 % 0"), Err(ExprError::DivisionByZero));
    }

    #[test]
    fn string_equality() {
        assert_eq!(eval("'ab' == 'ab'").unwrap(), RuntimeValue::Bool(true));
        assert_eq!(eval("'ab' != 'ac'").unwrap(), RuntimeValue::Bool(true));
        assert_eq!(eval("'1' == 1").unwrap(), RuntimeValue::Bool(false));
    }

    #[test]
    fn parse_int_trims_padding() {
        assert_eq!(parse_int("  0755\0\0", 8).unwrap(), 0o755);
        assert_eq!(parse_int("", 10).unwrap(), 0);
        assert_eq!(parse_int("zz", 16).unwrap(), 0);
        assert_eq!(parse_int("ff", 16).unwrap(), 255);
        assert_eq!(parse_int("1", 3), Err(ExprError::InvalidBase(3)));
    }

    #[test]
    fn parse_int_is_idempotent() {
        for (s, b) in [("0755", 8), ("ff", 16), ("101", 2), ("  42 ", 10)] {
            let once = parse_int(s, b).unwrap();
            let formatted = match b {
                2 => format!("{:b}", once),
                8 => format!("{:o}", once),
                16 => format!("{:x}", once),
                _ => once.to_string(),
            };
            assert_eq!(parse_int(&formatted, b).unwrap(), once);
        }
    }

    #[test]
    fn not_and_negation() {
        assert_eq!(eval("not 0").unwrap(), RuntimeValue::Bool(true));
        assert_eq!(eval("not (1 == 1)").unwrap(), RuntimeValue::Bool(false));
        assert!(matches!(eval("-'x'"), Err(ExprError::TypeMismatch(_))));
    }
}
