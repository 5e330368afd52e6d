//! Operator semantics shared by the interpreter and the lowered-program
//! executor. Keeping these in one place is what makes the backend
//! equivalence property hold for arithmetic and comparisons.

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::nodes::{BinOpKind, CmpOp, UnOpKind};
use crate::value::Value;

pub fn binop(op: BinOpKind, left: &Value, right: &Value) -> Result<Value> {
    use BinOpKind::*;
    use Value::*;
    match (op, left, right) {
        (Add, Int(a), Int(b)) => int_result(op, a.checked_add(*b)),
        (Add, Str(a), Str(b)) => Ok(Str(format!("{}{}", a, b))),
        (Add, Markup(a), Markup(b)) => Ok(Markup(format!("{}{}", a, b))),
        (Add, Str(a) | Markup(a), Str(b) | Markup(b)) => Ok(Str(format!("{}{}", a, b))),
        (Add, List(a), List(b)) => {
            let mut out = a.clone();
            out.extend(b.iter().cloned());
            Ok(List(out))
        }
        (Add, Tuple(a), Tuple(b)) => {
            let mut out = a.clone();
            out.extend(b.iter().cloned());
            Ok(Tuple(out))
        }
        (Sub, Int(a), Int(b)) => int_result(op, a.checked_sub(*b)),
        (Mul, Int(a), Int(b)) => int_result(op, a.checked_mul(*b)),
        (Mul, Str(s), Int(n)) | (Mul, Int(n), Str(s)) => Ok(Str(repeat(s, *n))),
        (Mul, Markup(s), Int(n)) | (Mul, Int(n), Markup(s)) => Ok(Markup(repeat(s, *n))),
        (Mul, List(items), Int(n)) | (Mul, Int(n), List(items)) => {
            let count = (*n).max(0) as usize;
            let mut out = Vec::with_capacity(items.len() * count);
            for _ in 0..count {
                out.extend(items.iter().cloned());
            }
            Ok(List(out))
        }
        // true division always yields a float
        (Div, a, b) => {
            let (x, y) = numeric_pair(op, a, b)?;
            Ok(Float(x / y))
        }
        (FloorDiv, Int(a), Int(b)) => {
            if *b == 0 {
                type_bail!("integer division by zero");
            }
            Ok(Int(a.div_euclid(*b)))
        }
        (Mod, Int(a), Int(b)) => {
            if *b == 0 {
                type_bail!("integer modulo by zero");
            }
            Ok(Int(a.rem_euclid(*b)))
        }
        (Pow, Int(a), Int(b)) if *b >= 0 => {
            let exp = match u32::try_from(*b) {
                Ok(exp) => exp,
                Err(_) => type_bail!("exponent {} is too large", b),
            };
            int_result(op, a.checked_pow(exp))
        }
        (Add | Sub | Mul | FloorDiv | Mod | Pow, a, b) => {
            let (x, y) = numeric_pair(op, a, b)?;
            Ok(match op {
                Add => Float(x + y),
                Sub => Float(x - y),
                Mul => Float(x * y),
                FloorDiv => Float((x / y).floor()),
                Mod => Float(x % y),
                Pow => Float(x.powf(y)),
                Div => unreachable!(),
            })
        }
    }
}

fn repeat(s: &str, n: i64) -> String {
    s.repeat(n.max(0) as usize)
}

/// Integer arithmetic that overflowed is a type error, not an abort.
fn int_result(op: BinOpKind, value: Option<i64>) -> Result<Value> {
    match value {
        Some(v) => Ok(Value::Int(v)),
        None => Err(Error::Type(format!("integer overflow in {:?}", op))),
    }
}

fn numeric_pair(op: BinOpKind, left: &Value, right: &Value) -> Result<(f64, f64)> {
    match (as_number(left), as_number(right)) {
        (Some(x), Some(y)) => Ok((x, y)),
        _ => Err(Error::Type(format!(
            "unsupported operands for {:?}: {} and {}",
            op,
            left.type_name(),
            right.type_name()
        ))),
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Int(i) => Some(*i as f64),
        Value::Float(f) => Some(*f),
        _ => None,
    }
}

pub fn unop(op: UnOpKind, value: &Value) -> Result<Value> {
    match (op, value) {
        (UnOpKind::Not, v) => Ok(Value::Bool(!v.is_truthy())),
        (UnOpKind::Neg, Value::Int(i)) => match i.checked_neg() {
            Some(v) => Ok(Value::Int(v)),
            None => type_bail!("integer overflow in Neg"),
        },
        (UnOpKind::Neg, Value::Float(f)) => Ok(Value::Float(-f)),
        (UnOpKind::Pos, Value::Int(i)) => Ok(Value::Int(*i)),
        (UnOpKind::Pos, Value::Float(f)) => Ok(Value::Float(*f)),
        (op, v) => Err(Error::Type(format!(
            "unsupported operand for {:?}: {}",
            op,
            v.type_name()
        ))),
    }
}

/// One link of a (possibly chained) comparison.
pub fn compare(op: CmpOp, left: &Value, right: &Value) -> Result<bool> {
    use CmpOp::*;
    match op {
        Eq => Ok(left == right),
        Ne => Ok(left != right),
        Lt | LtEq | Gt | GtEq => {
            let ord = ordering(left, right)?;
            Ok(match op {
                Lt => ord == std::cmp::Ordering::Less,
                LtEq => ord != std::cmp::Ordering::Greater,
                Gt => ord == std::cmp::Ordering::Greater,
                GtEq => ord != std::cmp::Ordering::Less,
                _ => unreachable!(),
            })
        }
        In => contains(right, left),
        NotIn => contains(right, left).map(|b| !b),
    }
}

fn ordering(left: &Value, right: &Value) -> Result<std::cmp::Ordering> {
    if let (Some(x), Some(y)) = (as_number(left), as_number(right)) {
        return x.partial_cmp(&y).ok_or_else(|| {
            Error::Type("float comparison is undefined for NaN".to_string())
        });
    }
    if let (Some(a), Some(b)) = (left.as_str(), right.as_str()) {
        return Ok(a.cmp(b));
    }
    Err(Error::Type(format!(
        "{} and {} are not orderable",
        left.type_name(),
        right.type_name()
    )))
}

fn contains(container: &Value, item: &Value) -> Result<bool> {
    match container {
        Value::List(items) | Value::Tuple(items) => Ok(items.contains(item)),
        Value::Map(map) => Ok(map.contains_key(&item.as_key()?)),
        Value::Str(s) | Value::Markup(s) => match item.as_str() {
            Some(needle) => Ok(s.contains(needle)),
            None => Err(Error::Type(format!(
                "cannot search a string for {}",
                item.type_name()
            ))),
        },
        other => Err(Error::Type(format!(
            "{} is not a container",
            other.type_name()
        ))),
    }
}

/// Resolves the full argument set of a call-shaped node: explicit
/// positional and keyword arguments plus the dynamic spreads. Duplicate
/// keyword arguments are a type error, the same class of failure as a
/// wrong-arity call.
pub fn build_call_args(
    mut args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
    dyn_args: Option<Value>,
    dyn_kwargs: Option<Value>,
) -> Result<(Vec<Value>, BTreeMap<String, Value>)> {
    if let Some(extra) = dyn_args {
        match extra {
            Value::List(items) | Value::Tuple(items) => args.extend(items),
            other => {
                return Err(Error::Type(format!(
                    "argument spread requires a sequence, got {}",
                    other.type_name()
                )))
            }
        }
    }
    let mut kw = BTreeMap::new();
    for (key, value) in kwargs {
        if kw.insert(key.clone(), value).is_some() {
            return Err(Error::Type(format!(
                "got multiple values for keyword argument {:?}",
                key
            )));
        }
    }
    if let Some(extra) = dyn_kwargs {
        match extra {
            Value::Map(map) => {
                for (key, value) in map {
                    if kw.insert(key.clone(), value).is_some() {
                        return Err(Error::Type(format!(
                            "got multiple values for keyword argument {:?}",
                            key
                        )));
                    }
                }
            }
            other => {
                return Err(Error::Type(format!(
                    "keyword spread requires a map, got {}",
                    other.type_name()
                )))
            }
        }
    }
    Ok((args, kw))
}

/// Binds call arguments to a parameter list the way template-defined
/// functions do: positional first, then keywords, then defaults, and the
/// undefined sentinel for anything left unbound.
pub fn bind_params(
    params: &[String],
    defaults: &[Value],
    args: Vec<Value>,
    mut kwargs: BTreeMap<String, Value>,
) -> Result<BTreeMap<String, Value>> {
    if args.len() > params.len() {
        return Err(Error::Type(format!(
            "expected at most {} arguments, got {}",
            params.len(),
            args.len()
        )));
    }
    let defaults_start = params.len() - defaults.len().min(params.len());
    let mut bound = BTreeMap::new();
    let mut args = args.into_iter();
    for (idx, name) in params.iter().enumerate() {
        let value = match args.next() {
            Some(v) => {
                if kwargs.remove(name).is_some() {
                    return Err(Error::Type(format!(
                        "got multiple values for argument {:?}",
                        name
                    )));
                }
                v
            }
            None => match kwargs.remove(name) {
                Some(v) => v,
                None if idx >= defaults_start => defaults[idx - defaults_start].clone(),
                None => Value::undefined_for(name),
            },
        };
        bound.insert(name.clone(), value);
    }
    if let Some(key) = kwargs.keys().next() {
        return Err(Error::Type(format!(
            "unexpected keyword argument {:?}",
            key
        )));
    }
    Ok(bound)
}
