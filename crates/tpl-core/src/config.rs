//! Execution policy. Everything behavior-shaping that is not part of the
//! template itself lives behind the [`Config`] trait: attribute and item
//! access, string conversion and escaping, the undefined sentinel, filter
//! and test registries, loop wrapping, unpacking strictness, and template
//! resolution for inheritance and imports.
//!
//! Both backends consult the same config object, so a policy override
//! holds across engines by construction.

use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::nodes::Template;
use crate::value::{Value, ValueModule};

/// A filter or test callable: `(value, args, kwargs) -> value`.
pub type FilterFn = Rc<dyn Fn(Value, Vec<Value>, BTreeMap<String, Value>) -> Result<Value>>;

pub trait Config {
    /// Attribute access (`foo.bar`). Returns the undefined sentinel when
    /// the attribute does not resolve.
    fn getattr(&self, obj: &Value, attr: &Value) -> Value {
        let key = match attr.as_key() {
            Ok(k) => k,
            Err(_) => return Value::undefined(),
        };
        match obj {
            Value::Map(map) => map.get(&key).cloned().unwrap_or_else(Value::undefined),
            Value::Module(module) => module
                .exports
                .get(&key)
                .cloned()
                .unwrap_or_else(Value::undefined),
            _ => Value::undefined(),
        }
    }

    /// Item access (`foo["bar"]`, `foo[0]`). Out-of-range and missing
    /// keys yield the undefined sentinel.
    fn getitem(&self, obj: &Value, key: &Value) -> Value {
        match (obj, key) {
            (Value::List(items) | Value::Tuple(items), Value::Int(idx)) => {
                index_sequence(items, *idx)
            }
            (Value::Str(s) | Value::Markup(s), Value::Int(idx)) => {
                let chars: Vec<char> = s.chars().collect();
                let len = chars.len() as i64;
                let i = if *idx < 0 { idx + len } else { *idx };
                if i >= 0 && i < len {
                    Value::Str(chars[i as usize].to_string())
                } else {
                    Value::undefined()
                }
            }
            _ => self.getattr(obj, key),
        }
    }

    /// Slice access (`foo[a:b:c]`). Start/stop/step follow sequence
    /// slicing semantics including negative indices and steps.
    fn getslice(
        &self,
        obj: &Value,
        start: Option<i64>,
        stop: Option<i64>,
        step: Option<i64>,
    ) -> Result<Value> {
        let step = step.unwrap_or(1);
        if step == 0 {
            return Err(Error::Type("slice step cannot be zero".to_string()));
        }
        match obj {
            Value::Str(s) | Value::Markup(s) => {
                let chars: Vec<char> = s.chars().collect();
                let picked = slice_indices(chars.len(), start, stop, step)
                    .into_iter()
                    .map(|i| chars[i])
                    .collect::<String>();
                Ok(Value::Str(picked))
            }
            Value::List(items) => Ok(Value::List(
                slice_indices(items.len(), start, stop, step)
                    .into_iter()
                    .map(|i| items[i].clone())
                    .collect(),
            )),
            Value::Tuple(items) => Ok(Value::Tuple(
                slice_indices(items.len(), start, stop, step)
                    .into_iter()
                    .map(|i| items[i].clone())
                    .collect(),
            )),
            other => Err(Error::Type(format!(
                "{} is not sliceable",
                other.type_name()
            ))),
        }
    }

    /// Output conversion: the final text a value contributes to the
    /// rendered document.
    fn finalize(&self, value: &Value, autoescape: bool) -> String {
        match value {
            Value::Markup(s) => s.clone(),
            other if autoescape => escape_html(&other.render_plain()),
            other => other.render_plain(),
        }
    }

    fn mark_safe(&self, value: Value) -> Value {
        match value {
            Value::Markup(s) => Value::Markup(s),
            other => Value::Markup(other.render_plain()),
        }
    }

    /// The value an unresolvable variable evaluates to.
    fn undefined_variable(&self, name: &str) -> Value {
        Value::undefined_for(name)
    }

    fn get_autoescape_default(&self, _template_name: Option<&str>) -> bool {
        false
    }

    fn get_filters(&self) -> HashMap<String, FilterFn> {
        HashMap::new()
    }

    fn get_tests(&self) -> HashMap<String, FilterFn> {
        HashMap::new()
    }

    /// Name under which the loop state is exposed inside a for body.
    fn forloop_accessor(&self) -> &str {
        "loop"
    }

    /// Whether a for body may reach the enclosing loop's state through
    /// `<accessor>.parent`.
    fn forloop_parent_access(&self) -> bool {
        true
    }

    /// Name the rendered body of a callout is bound to while its call
    /// expression is evaluated.
    fn callout_name(&self) -> &str {
        "caller"
    }

    fn strict_tuple_unpacking(&self) -> bool {
        true
    }

    fn allow_noniter_unpacking(&self) -> bool {
        false
    }

    /// Iteration order of a value, or a type error if it has none.
    fn to_iter(&self, value: &Value) -> Result<Vec<Value>> {
        match value {
            Value::List(items) | Value::Tuple(items) => Ok(items.clone()),
            Value::Str(s) | Value::Markup(s) => {
                Ok(s.chars().map(|c| Value::Str(c.to_string())).collect())
            }
            Value::Map(map) => Ok(map.keys().map(|k| Value::Str(k.clone())).collect()),
            other => Err(Error::Type(format!(
                "{} is not iterable",
                other.type_name()
            ))),
        }
    }

    /// Pairs every iteration item with its loop state. `parent` is the
    /// state of the enclosing loop, if any.
    fn wrap_loop(&self, iterable: &Value, parent: Option<Value>) -> Result<Vec<(Value, Value)>> {
        let items = self.to_iter(iterable)?;
        let len = items.len();
        let parent = parent.unwrap_or(Value::None);
        Ok(items
            .into_iter()
            .enumerate()
            .map(|(idx, item)| {
                let mut state = BTreeMap::new();
                state.insert("index".to_string(), Value::Int(idx as i64 + 1));
                state.insert("index0".to_string(), Value::Int(idx as i64));
                state.insert("revindex".to_string(), Value::Int((len - idx) as i64));
                state.insert("revindex0".to_string(), Value::Int((len - idx - 1) as i64));
                state.insert("first".to_string(), Value::Bool(idx == 0));
                state.insert("last".to_string(), Value::Bool(idx + 1 == len));
                state.insert("length".to_string(), Value::Int(len as i64));
                state.insert("parent".to_string(), parent.clone());
                (item, Value::Map(state))
            })
            .collect())
    }

    /// Template name resolution relative to a requesting template.
    fn join_path(&self, name: &str, _parent: Option<&str>) -> String {
        name.to_string()
    }

    fn get_template(&self, name: &str) -> Result<Rc<Template>> {
        Err(Error::TemplateNotFound {
            tried: vec![name.to_string()],
        })
    }

    /// First resolvable candidate; the error lists everything tried.
    fn select_template(&self, names: &[String]) -> Result<(String, Rc<Template>)> {
        let mut tried = Vec::new();
        for name in names {
            match self.get_template(name) {
                Ok(template) => return Ok((name.clone(), template)),
                Err(Error::TemplateNotFound { tried: t }) => tried.extend(t),
                Err(other) => return Err(other),
            }
        }
        Err(Error::TemplateNotFound { tried })
    }

    fn make_module(&self, name: &str, exports: BTreeMap<String, Value>, body: String) -> Value {
        Value::Module(Rc::new(ValueModule {
            name: name.to_string(),
            exports,
            body,
        }))
    }

    fn resolve_from_import(&self, module: &Value, name: &str) -> Result<Value> {
        match module {
            Value::Module(m) => m.exports.get(name).cloned().ok_or_else(|| {
                Error::Type(format!("module {:?} has no export {:?}", m.name, name))
            }),
            other => Err(Error::Type(format!(
                "cannot import from {}",
                other.type_name()
            ))),
        }
    }
}

fn index_sequence(items: &[Value], idx: i64) -> Value {
    let len = items.len() as i64;
    let i = if idx < 0 { idx + len } else { idx };
    if i >= 0 && i < len {
        items[i as usize].clone()
    } else {
        Value::undefined()
    }
}

fn slice_indices(len: usize, start: Option<i64>, stop: Option<i64>, step: i64) -> Vec<usize> {
    let len = len as i64;
    let clamp = |idx: i64, upper: i64| -> i64 {
        let idx = if idx < 0 { idx + len } else { idx };
        idx.clamp(if step < 0 { -1 } else { 0 }, upper)
    };
    let (default_start, default_stop) = if step < 0 { (len - 1, -1) } else { (0, len) };
    let start = start.map_or(default_start, |s| clamp(s, if step < 0 { len - 1 } else { len }));
    let stop = stop.map_or(default_stop, |s| clamp(s, if step < 0 { len - 1 } else { len }));
    let mut out = Vec::new();
    let mut i = start;
    while (step > 0 && i < stop) || (step < 0 && i > stop) {
        if i >= 0 && i < len {
            out.push(i as usize);
        }
        i += step;
    }
    out
}

pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}

/// A ready-to-use config backed by in-memory registries. Hosts with real
/// loaders or escaping rules implement [`Config`] themselves.
#[derive(Default)]
pub struct DefaultConfig {
    pub templates: HashMap<String, Rc<Template>>,
    pub filters: HashMap<String, FilterFn>,
    pub tests: HashMap<String, FilterFn>,
    pub autoescape: bool,
    pub strict_tuple_unpacking: bool,
    pub allow_noniter_unpacking: bool,
    pub forloop_parent_access: bool,
    pub undefined: Option<Rc<dyn Fn(&str) -> Value>>,
}

impl DefaultConfig {
    pub fn new() -> DefaultConfig {
        DefaultConfig {
            strict_tuple_unpacking: true,
            forloop_parent_access: true,
            ..DefaultConfig::default()
        }
    }

    pub fn add_template(&mut self, name: &str, template: Template) {
        self.templates.insert(name.to_string(), Rc::new(template));
    }

    pub fn add_filter(
        &mut self,
        name: &str,
        f: impl Fn(Value, Vec<Value>, BTreeMap<String, Value>) -> Result<Value> + 'static,
    ) {
        self.filters.insert(name.to_string(), Rc::new(f));
    }

    pub fn add_test(
        &mut self,
        name: &str,
        f: impl Fn(Value, Vec<Value>, BTreeMap<String, Value>) -> Result<Value> + 'static,
    ) {
        self.tests.insert(name.to_string(), Rc::new(f));
    }
}

impl Config for DefaultConfig {
    fn get_filters(&self) -> HashMap<String, FilterFn> {
        self.filters.clone()
    }

    fn get_tests(&self) -> HashMap<String, FilterFn> {
        self.tests.clone()
    }

    fn get_autoescape_default(&self, _template_name: Option<&str>) -> bool {
        self.autoescape
    }

    fn strict_tuple_unpacking(&self) -> bool {
        self.strict_tuple_unpacking
    }

    fn allow_noniter_unpacking(&self) -> bool {
        self.allow_noniter_unpacking
    }

    fn forloop_parent_access(&self) -> bool {
        self.forloop_parent_access
    }

    fn undefined_variable(&self, name: &str) -> Value {
        match &self.undefined {
            Some(make) => make(name),
            None => Value::undefined_for(name),
        }
    }

    fn get_template(&self, name: &str) -> Result<Rc<Template>> {
        self.templates.get(name).cloned().ok_or_else(|| {
            Error::TemplateNotFound {
                tried: vec![name.to_string()],
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    struct Plain;
    impl Config for Plain {}

    #[test]
    fn test_getitem_negative_index() {
        let cfg = Plain;
        let list = Value::List(vec![Value::from(1), Value::from(2), Value::from(3)]);
        assert_eq!(cfg.getitem(&list, &Value::from(-1)), Value::from(3));
        assert!(cfg.getitem(&list, &Value::from(3)).is_undefined());
    }

    #[test]
    fn test_slicing() {
        let cfg = Plain;
        let s = Value::from("Hello World");
        assert_eq!(
            cfg.getslice(&s, None, Some(5), None).unwrap(),
            Value::from("Hello")
        );
        assert_eq!(
            cfg.getslice(&s, Some(-5), None, None).unwrap(),
            Value::from("World")
        );
        assert_eq!(
            cfg.getslice(&s, None, None, Some(-1)).unwrap(),
            Value::from("dlroW olleH")
        );
        assert_eq!(
            cfg.getslice(&s, None, None, Some(2)).unwrap(),
            Value::from("HloWrd")
        );
    }

    #[test]
    fn test_finalize_escapes_unless_safe() {
        let cfg = Plain;
        let raw = Value::from("<b>&\"");
        assert_eq!(cfg.finalize(&raw, false), "<b>&\"");
        assert_eq!(cfg.finalize(&raw, true), "&lt;b&gt;&amp;&quot;");
        let safe = cfg.mark_safe(Value::from("<b>"));
        assert_eq!(cfg.finalize(&safe, true), "<b>");
    }

    #[test]
    fn test_select_template_aggregates_tried_names() {
        let cfg = DefaultConfig::new();
        let err = cfg
            .select_template(&["a.html".to_string(), "b.html".to_string()])
            .unwrap_err();
        match err {
            Error::TemplateNotFound { tried } => {
                assert_eq!(tried, vec!["a.html".to_string(), "b.html".to_string()])
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_loop_state() {
        let cfg = Plain;
        let wrapped = cfg
            .wrap_loop(&Value::List(vec![Value::from(7), Value::from(8)]), None)
            .unwrap();
        assert_eq!(wrapped.len(), 2);
        let (item, state) = &wrapped[0];
        assert_eq!(item, &Value::from(7));
        assert_eq!(cfg.getattr(state, &Value::from("index0")), Value::from(0));
        assert_eq!(cfg.getattr(state, &Value::from("last")), Value::from(false));
        let (_, state) = &wrapped[1];
        assert_eq!(cfg.getattr(state, &Value::from("revindex")), Value::from(1));
        assert_eq!(cfg.getattr(state, &Value::from("last")), Value::from(true));
    }
}
