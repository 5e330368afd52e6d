//! Per-render bookkeeping.
//!
//! [`RuntimeInfo`] travels with one render: the filter and test
//! registries snapshotted from the config, the block override chain that
//! template inheritance builds up, the exported variables of the
//! template, and the autoescape decision. It is generic over `X`, the
//! backend's block-executor handle, so the interpreter can register node
//! bodies while the lowered-program executor registers program slices.

use std::collections::{BTreeMap, HashMap};

use crate::config::{Config, FilterFn};
use crate::error::{Error, Result};
use crate::value::Value;

/// How a render of a template was entered. Extends-renders share the
/// caller's info (so child blocks stay visible to the parent); include
/// and import renders fork a fresh one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoBehavior {
    Root,
    Extends,
    Include,
    Import,
}

pub struct RuntimeInfo<X> {
    pub template_name: Option<String>,
    pub behavior: InfoBehavior,
    pub autoescape: bool,
    filters: HashMap<String, FilterFn>,
    tests: HashMap<String, FilterFn>,
    blocks: HashMap<String, Vec<X>>,
    pub exports: BTreeMap<String, Value>,
}

impl<X> RuntimeInfo<X> {
    pub fn new(config: &dyn Config, template_name: Option<&str>) -> RuntimeInfo<X> {
        RuntimeInfo {
            template_name: template_name.map(str::to_string),
            behavior: InfoBehavior::Root,
            autoescape: config.get_autoescape_default(template_name),
            filters: config.get_filters(),
            tests: config.get_tests(),
            blocks: HashMap::new(),
            exports: BTreeMap::new(),
        }
    }

    /// A fresh info for an include or import render. The registries are
    /// carried over; block chain and exports start empty.
    pub fn fork(&self, template_name: Option<&str>, behavior: InfoBehavior) -> RuntimeInfo<X> {
        RuntimeInfo {
            template_name: template_name.map(str::to_string),
            behavior,
            autoescape: self.autoescape,
            filters: self.filters.clone(),
            tests: self.tests.clone(),
            blocks: HashMap::new(),
            exports: BTreeMap::new(),
        }
    }

    /// Appends an executor to a block's override chain. Templates
    /// register their own blocks before rendering a parent, so position
    /// 0 is always the most derived implementation.
    pub fn register_block(&mut self, name: &str, executor: X) {
        self.blocks.entry(name.to_string()).or_default().push(executor);
    }

    /// The executor for `name` at `level` (1 = most derived).
    pub fn block_executor(&self, name: &str, level: usize) -> Result<&X> {
        let chain = self
            .blocks
            .get(name)
            .ok_or_else(|| Error::BlockNotFound(name.to_string()))?;
        if level == 0 || level > chain.len() {
            return Err(Error::BlockLevelOverflow {
                name: name.to_string(),
                level,
                depth: chain.len(),
            });
        }
        Ok(&chain[level - 1])
    }

    pub fn call_filter(
        &self,
        name: &str,
        value: Value,
        args: Vec<Value>,
        kwargs: BTreeMap<String, Value>,
    ) -> Result<Value> {
        let filter = self
            .filters
            .get(name)
            .ok_or_else(|| Error::FilterNotFound(name.to_string()))?;
        filter(value, args, kwargs)
    }

    pub fn call_test(
        &self,
        name: &str,
        value: Value,
        args: Vec<Value>,
        kwargs: BTreeMap<String, Value>,
    ) -> Result<Value> {
        let test = self
            .tests
            .get(name)
            .ok_or_else(|| Error::TestNotFound(name.to_string()))?;
        test(value, args, kwargs)
    }

    pub fn export_var(&mut self, name: &str, value: Value) {
        self.exports.insert(name.to_string(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DefaultConfig;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_block_chain_levels() {
        let cfg = DefaultConfig::new();
        let mut info: RuntimeInfo<&str> = RuntimeInfo::new(&cfg, Some("child.html"));
        info.register_block("body", "child impl");
        info.register_block("body", "parent impl");
        assert_eq!(*info.block_executor("body", 1).unwrap(), "child impl");
        assert_eq!(*info.block_executor("body", 2).unwrap(), "parent impl");
        assert!(matches!(
            info.block_executor("body", 3),
            Err(Error::BlockLevelOverflow { depth: 2, .. })
        ));
        assert!(matches!(
            info.block_executor("missing", 1),
            Err(Error::BlockNotFound(_))
        ));
    }

    #[test]
    fn test_fork_starts_with_empty_chain_and_exports() {
        let mut cfg = DefaultConfig::new();
        cfg.add_filter("upper", |v, _, _| {
            Ok(Value::from(v.render_plain().to_uppercase()))
        });
        let mut info: RuntimeInfo<&str> = RuntimeInfo::new(&cfg, None);
        info.register_block("body", "x");
        info.export_var("a", Value::from(1));
        let fork = info.fork(Some("inc.html"), InfoBehavior::Include);
        assert!(fork.block_executor("body", 1).is_err());
        assert!(fork.exports.is_empty());
        assert_eq!(
            fork.call_filter("upper", Value::from("hi"), vec![], BTreeMap::new())
                .unwrap(),
            Value::from("HI")
        );
    }

    #[test]
    fn test_missing_filter_and_test() {
        let cfg = DefaultConfig::new();
        let info: RuntimeInfo<()> = RuntimeInfo::new(&cfg, None);
        assert!(matches!(
            info.call_filter("nope", Value::None, vec![], BTreeMap::new()),
            Err(Error::FilterNotFound(_))
        ));
        assert!(matches!(
            info.call_test("nope", Value::None, vec![], BTreeMap::new()),
            Err(Error::TestNotFound(_))
        ));
    }
}
