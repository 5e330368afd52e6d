//! Assignment-target unpacking shared by the interpreter and the lowered
//! program executor.
//!
//! The decision order is fixed: iterability of the value is checked
//! before cardinality. A non-iterable value is a type error unless the
//! config allows silent non-iterable unpacking, in which case every
//! target receives the configured undefined value. Cardinality mismatch
//! is then an unpack error under strict unpacking; otherwise targets and
//! items are zipped, missing targets receive the undefined value, and
//! excess items are dropped.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::value::Value;

/// The shape of an assignment target. `L` is the backend's binding
/// payload: the source-level name for the interpreter, the generated
/// identifier for lowered programs.
#[derive(Debug, Clone)]
pub enum Target<L> {
    Name { payload: L, source: String },
    Tuple(Vec<Target<L>>),
}

impl<L> Target<L> {
    pub fn name(payload: L, source: impl Into<String>) -> Target<L> {
        Target::Name {
            payload,
            source: source.into(),
        }
    }

    fn each_leaf(&self, f: &mut dyn FnMut(&L, &str)) {
        match self {
            Target::Name { payload, source } => f(payload, source),
            Target::Tuple(items) => {
                for item in items {
                    item.each_leaf(f);
                }
            }
        }
    }
}

/// Distributes `value` over `target`, returning `(payload, value)` pairs
/// in target order.
pub fn unpack<L: Clone>(
    config: &dyn Config,
    target: &Target<L>,
    value: Value,
) -> Result<Vec<(L, Value)>> {
    let mut out = Vec::new();
    unpack_into(config, target, value, &mut out)?;
    Ok(out)
}

fn unpack_into<L: Clone>(
    config: &dyn Config,
    target: &Target<L>,
    value: Value,
    out: &mut Vec<(L, Value)>,
) -> Result<()> {
    let items = match target {
        Target::Name { payload, .. } => {
            out.push((payload.clone(), value));
            return Ok(());
        }
        Target::Tuple(items) => items,
    };
    let values = match config.to_iter(&value) {
        Ok(values) => values,
        Err(err) => {
            if !config.allow_noniter_unpacking() {
                return Err(err);
            }
            target.each_leaf(&mut |payload, source| {
                out.push((payload.clone(), config.undefined_variable(source)));
            });
            return Ok(());
        }
    };
    if config.strict_tuple_unpacking() && values.len() != items.len() {
        return Err(Error::Unpack(format!(
            "tried to unpack {} values into {} targets",
            values.len(),
            items.len()
        )));
    }
    let mut values = values.into_iter();
    for item in items {
        match values.next() {
            Some(value) => unpack_into(config, item, value, out)?,
            None => item.each_leaf(&mut |payload, source| {
                out.push((payload.clone(), config.undefined_variable(source)));
            }),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DefaultConfig;
    use pretty_assertions::assert_eq;

    fn pair_target() -> Target<String> {
        Target::Tuple(vec![
            Target::name("a".to_string(), "a"),
            Target::name("b".to_string(), "b"),
        ])
    }

    fn list(values: &[i64]) -> Value {
        Value::List(values.iter().map(|&v| Value::Int(v)).collect())
    }

    #[test]
    fn test_exact_unpack() {
        let cfg = DefaultConfig::new();
        let bound = unpack(&cfg, &pair_target(), list(&[1, 2])).unwrap();
        assert_eq!(
            bound,
            vec![
                ("a".to_string(), Value::Int(1)),
                ("b".to_string(), Value::Int(2))
            ]
        );
    }

    #[test]
    fn test_strict_cardinality_mismatch() {
        let cfg = DefaultConfig::new();
        let err = unpack(&cfg, &pair_target(), list(&[1, 2, 3])).unwrap_err();
        assert!(matches!(err, Error::Unpack(_)));
    }

    #[test]
    fn test_lenient_zips_and_fills_with_undefined() {
        let mut cfg = DefaultConfig::new();
        cfg.strict_tuple_unpacking = false;
        let bound = unpack(&cfg, &pair_target(), list(&[1, 2, 3])).unwrap();
        assert_eq!(bound.len(), 2);
        assert_eq!(bound[1].1, Value::Int(2));
        let bound = unpack(&cfg, &pair_target(), list(&[1])).unwrap();
        assert_eq!(bound[0].1, Value::Int(1));
        assert!(bound[1].1.is_undefined());
    }

    #[test]
    fn test_noniterable_is_a_type_error() {
        let cfg = DefaultConfig::new();
        let err = unpack(&cfg, &pair_target(), Value::Int(1)).unwrap_err();
        assert!(matches!(err, Error::Type(_)));
    }

    #[test]
    fn test_noniterable_substitution_when_allowed() {
        let mut cfg = DefaultConfig::new();
        cfg.allow_noniter_unpacking = true;
        cfg.undefined = Some(std::rc::Rc::new(|_| Value::from("<item>")));
        let bound = unpack(&cfg, &pair_target(), Value::Int(1)).unwrap();
        assert_eq!(bound[0].1, Value::from("<item>"));
        assert_eq!(bound[1].1, Value::from("<item>"));
    }

    #[test]
    fn test_nested_tuple_targets() {
        let cfg = DefaultConfig::new();
        let target = Target::Tuple(vec![
            Target::name("a".to_string(), "a"),
            Target::Tuple(vec![
                Target::name("b".to_string(), "b"),
                Target::name("c".to_string(), "c"),
            ]),
        ]);
        let value = Value::List(vec![Value::Int(1), list(&[2, 3])]);
        let bound = unpack(&cfg, &target, value).unwrap();
        assert_eq!(
            bound,
            vec![
                ("a".to_string(), Value::Int(1)),
                ("b".to_string(), Value::Int(2)),
                ("c".to_string(), Value::Int(3)),
            ]
        );
    }
}
