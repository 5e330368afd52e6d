//! The runtime value model shared by every execution backend.

use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};

use crate::error::{Error, Result};

/// A value flowing through template execution.
///
/// `Markup` is a string that is already safe for the output channel and
/// must not be escaped again. `Undefined` is the sentinel produced for
/// unresolvable variables; it renders as the empty string and is falsy.
#[derive(Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Markup(String),
    List(Vec<Value>),
    Tuple(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Function(ValueFunction),
    Module(Rc<ValueModule>),
    Undefined { hint: Option<String> },
}

pub type CallableFn = dyn Fn(Vec<Value>, BTreeMap<String, Value>) -> Result<Value>;

/// A callable value: a template-defined function (macro), a callout body,
/// or a host-provided function.
#[derive(Clone)]
pub struct ValueFunction {
    pub name: Option<String>,
    f: Rc<CallableFn>,
}

impl ValueFunction {
    pub fn new(name: Option<String>, f: Rc<CallableFn>) -> ValueFunction {
        ValueFunction { name, f }
    }

    pub fn call(&self, args: Vec<Value>, kwargs: BTreeMap<String, Value>) -> Result<Value> {
        (self.f)(args, kwargs)
    }
}

/// The result of importing a template: its exported variables plus the
/// text its body rendered to.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueModule {
    pub name: String,
    pub exports: BTreeMap<String, Value>,
    pub body: String,
}

impl Value {
    pub fn undefined() -> Value {
        Value::Undefined { hint: None }
    }

    pub fn undefined_for(name: &str) -> Value {
        Value::Undefined {
            hint: Some(name.to_string()),
        }
    }

    pub fn function(
        name: Option<String>,
        f: impl Fn(Vec<Value>, BTreeMap<String, Value>) -> Result<Value> + 'static,
    ) -> Value {
        Value::Function(ValueFunction::new(name, Rc::new(f)))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "none",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Markup(_) => "markup",
            Value::List(_) => "list",
            Value::Tuple(_) => "tuple",
            Value::Map(_) => "map",
            Value::Function(_) => "function",
            Value::Module(_) => "module",
            Value::Undefined { .. } => "undefined",
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::None | Value::Undefined { .. } => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) | Value::Markup(s) => !s.is_empty(),
            Value::List(items) | Value::Tuple(items) => !items.is_empty(),
            Value::Map(map) => !map.is_empty(),
            Value::Function(_) | Value::Module(_) => true,
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined { .. })
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) | Value::Markup(s) => Some(s),
            _ => None,
        }
    }

    /// The string a value contributes when used as a map key.
    pub fn as_key(&self) -> Result<String> {
        match self {
            Value::Str(s) | Value::Markup(s) => Ok(s.clone()),
            Value::Int(i) => Ok(i.to_string()),
            Value::Bool(b) => Ok(b.to_string()),
            other => Err(Error::Type(format!(
                "{} is not usable as a map key",
                other.type_name()
            ))),
        }
    }

    /// Plain (unescaped) text rendering; the empty string for the
    /// undefined sentinel and for none.
    pub fn render_plain(&self) -> String {
        match self {
            Value::None | Value::Undefined { .. } => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => render_float(*f),
            Value::Str(s) | Value::Markup(s) => s.clone(),
            Value::List(items) => {
                let inner: Vec<String> = items.iter().map(Value::render_repr).collect();
                format!("[{}]", inner.join(", "))
            }
            Value::Tuple(items) => {
                let inner: Vec<String> = items.iter().map(Value::render_repr).collect();
                format!("({})", inner.join(", "))
            }
            Value::Map(map) => {
                let inner: Vec<String> = map
                    .iter()
                    .map(|(k, v)| format!("{:?}: {}", k, v.render_repr()))
                    .collect();
                format!("{{{}}}", inner.join(", "))
            }
            Value::Function(f) => match &f.name {
                Some(name) => format!("<function {}>", name),
                None => "<function>".to_string(),
            },
            Value::Module(m) => format!("<module {}>", m.name),
        }
    }

    /// Literal-ish rendering for program dumps and diagnostics.
    pub fn render_repr(&self) -> String {
        match self {
            Value::None => "none".to_string(),
            Value::Str(s) | Value::Markup(s) => format!("{:?}", s),
            other => other.render_plain(),
        }
    }

    /// JSON projection for constant emission in generated source.
    /// Functions and modules have no serializable form.
    pub fn to_json(&self) -> Result<serde_json::Value> {
        use serde_json::Value as Json;
        Ok(match self {
            Value::None | Value::Undefined { .. } => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Int(i) => Json::Number((*i).into()),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(Json::Number)
                .ok_or_else(|| Error::Type(format!("float {} has no JSON form", f)))?,
            Value::Str(s) | Value::Markup(s) => Json::String(s.clone()),
            Value::List(items) | Value::Tuple(items) => Json::Array(
                items
                    .iter()
                    .map(Value::to_json)
                    .collect::<Result<Vec<_>>>()?,
            ),
            Value::Map(map) => {
                let mut obj = serde_json::Map::new();
                for (k, v) in map {
                    obj.insert(k.clone(), v.to_json()?);
                }
                Json::Object(obj)
            }
            other => {
                return Err(Error::Type(format!(
                    "{} values cannot be serialized",
                    other.type_name()
                )))
            }
        })
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }
}

fn render_float(f: f64) -> String {
    if f.is_finite() && f.fract() == 0.0 {
        format!("{:.1}", f)
    } else {
        format!("{}", f)
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Undefined { .. }, Value::Undefined { .. }) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Str(a), Value::Str(b))
            | (Value::Markup(a), Value::Markup(b))
            | (Value::Str(a), Value::Markup(b))
            | (Value::Markup(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) | (Value::Tuple(a), Value::Tuple(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(&a.f, &b.f),
            (Value::Module(a), Value::Module(b)) => Rc::ptr_eq(a, b),
            // ints and floats compare numerically across kinds
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x == y,
                _ => false,
            },
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => write!(f, "None"),
            Value::Bool(b) => write!(f, "Bool({})", b),
            Value::Int(i) => write!(f, "Int({})", i),
            Value::Float(x) => write!(f, "Float({})", x),
            Value::Str(s) => write!(f, "Str({:?})", s),
            Value::Markup(s) => write!(f, "Markup({:?})", s),
            Value::List(items) => f.debug_tuple("List").field(items).finish(),
            Value::Tuple(items) => f.debug_tuple("Tuple").field(items).finish(),
            Value::Map(map) => f.debug_tuple("Map").field(map).finish(),
            Value::Function(func) => write!(f, "Function({:?})", func.name),
            Value::Module(m) => write!(f, "Module({:?})", m.name),
            Value::Undefined { hint } => write!(f, "Undefined({:?})", hint),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Value::None | Value::Undefined { .. } => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(i) => serializer.serialize_i64(*i),
            Value::Float(f) => serializer.serialize_f64(*f),
            Value::Str(s) | Value::Markup(s) => serializer.serialize_str(s),
            Value::List(items) | Value::Tuple(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Map(map) => {
                let mut m = serializer.serialize_map(Some(map.len()))?;
                for (k, v) in map {
                    m.serialize_entry(k, v)?;
                }
                m.end()
            }
            Value::Function(func) => {
                serializer.serialize_str(&Value::Function(func.clone()).render_plain())
            }
            Value::Module(module) => {
                serializer.serialize_str(&Value::Module(module.clone()).render_plain())
            }
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Value {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Value {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Value {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Value {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Value {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Value {
        Value::Str(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Value {
        Value::List(v)
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Value {
        Value::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_truthiness() {
        assert!(!Value::None.is_truthy());
        assert!(!Value::undefined().is_truthy());
        assert!(!Value::Str(String::new()).is_truthy());
        assert!(!Value::Int(0).is_truthy());
        assert!(!Value::List(vec![]).is_truthy());
        assert!(Value::Int(-1).is_truthy());
        assert!(Value::from("x").is_truthy());
        assert!(Value::List(vec![Value::None]).is_truthy());
    }

    #[test]
    fn test_numeric_equality_across_kinds() {
        assert_eq!(Value::Int(1), Value::Float(1.0));
        assert_ne!(Value::Int(1), Value::Float(1.5));
        assert_ne!(Value::Bool(true), Value::Int(1));
    }

    #[test]
    fn test_plain_rendering() {
        assert_eq!(Value::from(42).render_plain(), "42");
        assert_eq!(Value::Float(21.0).render_plain(), "21.0");
        assert_eq!(Value::Float(2.5).render_plain(), "2.5");
        assert_eq!(Value::None.render_plain(), "");
        assert_eq!(Value::undefined_for("x").render_plain(), "");
        assert_eq!(
            Value::List(vec![Value::from(1), Value::from("a")]).render_plain(),
            "[1, \"a\"]"
        );
    }

    #[test]
    fn test_markup_equals_plain_string() {
        assert_eq!(Value::Markup("x".into()), Value::Str("x".into()));
    }

    #[test]
    fn test_json_projection_rejects_functions() {
        let f = Value::function(Some("f".into()), |_, _| Ok(Value::None));
        assert!(f.to_json().is_err());
        assert_eq!(
            Value::from(vec![Value::from(1)]).to_json().unwrap(),
            serde_json::json!([1])
        );
    }
}
