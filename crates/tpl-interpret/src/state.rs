//! Execution state of one interpreted render: the scope stack plus the
//! shared per-render info.
//!
//! Scopes are shared maps (`Rc<RefCell<..>>`) rather than plain ones so
//! that template-defined functions can capture the live chain at
//! definition time; a later assignment in the defining scope is then
//! visible inside the function when it is finally called.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use tpl_core::config::Config;
use tpl_core::nodes::Stmt;
use tpl_core::runtime::RuntimeInfo;
use tpl_core::value::Value;

pub type ScopeMap = Rc<RefCell<BTreeMap<String, Value>>>;

/// Block-executor handle of this backend: the block's body.
#[derive(Clone)]
pub struct BlockExec {
    pub body: Rc<Vec<Stmt>>,
}

pub type SharedInfo = Rc<RefCell<RuntimeInfo<BlockExec>>>;

pub struct InterpreterState {
    pub config: Rc<dyn Config>,
    pub info: SharedInfo,
    scopes: Vec<ScopeMap>,
    /// Assignments landing directly in this scope are mirrored into the
    /// info's exports; `None` outside a template root.
    export_scope: Option<ScopeMap>,
}

impl InterpreterState {
    pub fn new(
        config: Rc<dyn Config>,
        template_name: Option<&str>,
        vars: BTreeMap<String, Value>,
    ) -> InterpreterState {
        let info = Rc::new(RefCell::new(RuntimeInfo::new(&*config, template_name)));
        InterpreterState::with_info(config, info, vars, true)
    }

    /// State for rendering a template under an existing info (extends,
    /// include, import, block bodies).
    pub fn with_info(
        config: Rc<dyn Config>,
        info: SharedInfo,
        vars: BTreeMap<String, Value>,
        exporting: bool,
    ) -> InterpreterState {
        let outer: ScopeMap = Rc::new(RefCell::new(vars));
        let top: ScopeMap = Rc::new(RefCell::new(BTreeMap::new()));
        InterpreterState {
            config,
            info,
            export_scope: exporting.then(|| top.clone()),
            scopes: vec![outer, top],
        }
    }

    /// State for a function call: the captured definition-time chain
    /// plus a fresh scope holding the bound parameters.
    pub fn for_call(
        config: Rc<dyn Config>,
        info: SharedInfo,
        captured: Vec<ScopeMap>,
        locals: BTreeMap<String, Value>,
    ) -> InterpreterState {
        let mut scopes = captured;
        scopes.push(Rc::new(RefCell::new(locals)));
        InterpreterState {
            config,
            info,
            scopes,
            export_scope: None,
        }
    }

    pub fn push_frame(&mut self) {
        self.scopes.push(Rc::new(RefCell::new(BTreeMap::new())));
    }

    pub fn pop_frame(&mut self) {
        self.scopes.pop();
        assert!(!self.scopes.is_empty(), "scope stack underflow");
    }

    /// A live handle on the current chain, for definition-time capture.
    pub fn capture(&self) -> Vec<ScopeMap> {
        self.scopes.clone()
    }

    pub fn assign(&mut self, name: &str, value: Value) {
        let top = match self.scopes.last() {
            Some(top) => top.clone(),
            None => unreachable!("scope stack is never empty"),
        };
        if let Some(export) = &self.export_scope {
            if Rc::ptr_eq(&top, export) {
                self.info.borrow_mut().export_var(name, value.clone());
            }
        }
        top.borrow_mut().insert(name.to_string(), value);
    }

    pub fn lookup(&self, name: &str) -> Option<Value> {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.borrow().get(name).cloned())
    }

    /// Resolution with the configured undefined fallback.
    pub fn resolve(&self, name: &str) -> Value {
        self.lookup(name)
            .unwrap_or_else(|| self.config.undefined_variable(name))
    }

    /// One flat view of everything visible, innermost binding winning.
    pub fn flatten(&self) -> BTreeMap<String, Value> {
        let mut out = BTreeMap::new();
        for scope in &self.scopes {
            for (name, value) in scope.borrow().iter() {
                out.insert(name.clone(), value.clone());
            }
        }
        out
    }
}
