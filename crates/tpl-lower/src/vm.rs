//! Executor for lowered programs.
//!
//! Locals live in a chain of shared scopes: one scope per activation
//! (template render or function call), with function values capturing
//! the live chain at definition time. Generated identifiers are unique
//! across a whole program, so compound statements inside one activation
//! share its scope; shadowing was already resolved into aliases by
//! lowering.
//!
//! Templates referenced at runtime (`extends`, `include`, imports) are
//! fetched from the config, lowered on first use and cached per
//! executor.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use tpl_core::config::Config;
use tpl_core::error::{Error, Result};
use tpl_core::idents::IdentManager;
use tpl_core::nodes::Template;
use tpl_core::ops;
use tpl_core::runtime::{InfoBehavior, RuntimeInfo};
use tpl_core::unpack;
use tpl_core::value::Value;

use crate::host::{CallArgs, Expr, Program, Stmt};
use crate::lower::{self, LowerOptions};

pub type Sink<'a> = &'a mut dyn FnMut(&str);

/// Block executor handle of this backend: a lowered statement list.
#[derive(Clone)]
pub struct ProgramBlock {
    pub body: Rc<Vec<Stmt>>,
}

type SharedInfo = Rc<RefCell<RuntimeInfo<ProgramBlock>>>;
type Scope = Rc<RefCell<BTreeMap<String, Value>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Normal,
    Break,
    Continue,
    Stop,
}

/// Lowers `template` and renders it with `vars` to a single string.
pub fn render(
    config: Rc<dyn Config>,
    template: &Template,
    vars: BTreeMap<String, Value>,
) -> Result<String> {
    let options = LowerOptions::from_config(&*config);
    let program = Rc::new(lower::lower(template, &options)?);
    run(config, program, vars)
}

/// Renders an already lowered program.
pub fn run(
    config: Rc<dyn Config>,
    program: Rc<Program>,
    vars: BTreeMap<String, Value>,
) -> Result<String> {
    let vm = Vm::new(config.clone());
    let info: SharedInfo = Rc::new(RefCell::new(RuntimeInfo::new(&*config, None)));
    let exec = Exec::new(config, info, Rc::new(vars), true);
    let mut out = String::new();
    vm.run_template(&program, &exec, &mut |chunk| out.push_str(chunk))?;
    Ok(out)
}

#[derive(Clone)]
pub struct Vm {
    config: Rc<dyn Config>,
    cache: Rc<RefCell<HashMap<String, Rc<Program>>>>,
}

/// One activation: the local scope chain plus the render-wide shared
/// pieces.
struct Exec {
    config: Rc<dyn Config>,
    info: SharedInfo,
    context: Rc<BTreeMap<String, Value>>,
    env: Vec<Scope>,
    exporting: bool,
}

impl Exec {
    fn new(
        config: Rc<dyn Config>,
        info: SharedInfo,
        context: Rc<BTreeMap<String, Value>>,
        exporting: bool,
    ) -> Exec {
        Exec {
            config,
            info,
            context,
            env: vec![Rc::new(RefCell::new(BTreeMap::new()))],
            exporting,
        }
    }

    fn set_local(&self, local: &str, value: Value) {
        let top = match self.env.last() {
            Some(scope) => scope,
            None => unreachable!("the scope chain is never empty"),
        };
        top.borrow_mut().insert(local.to_string(), value);
    }

    /// Reads a local, innermost scope first. A read before the defining
    /// instruction ran yields the configured undefined value, matching
    /// the hoisted-declaration semantics of generated code.
    fn get_local(&self, local: &str) -> Value {
        for scope in self.env.iter().rev() {
            if let Some(value) = scope.borrow().get(local) {
                return value.clone();
            }
        }
        match IdentManager::decode(local) {
            Some(name) => self.config.undefined_variable(name),
            None => Value::Undefined { hint: None },
        }
    }

    fn lookup_context(&self, name: &str) -> Value {
        match self.context.get(name) {
            Some(value) => value.clone(),
            None => self.config.undefined_variable(name),
        }
    }

    /// The context for a sub-render: the base context overlaid with the
    /// resolved `(name, local)` pairs, or empty for context-free passes.
    fn pass_context(&self, pairs: Option<&[(String, String)]>) -> BTreeMap<String, Value> {
        match pairs {
            None => BTreeMap::new(),
            Some(pairs) => {
                let mut out = (*self.context).clone();
                for (name, local) in pairs {
                    out.insert(name.clone(), self.get_local(local));
                }
                out
            }
        }
    }
}

impl Vm {
    pub fn new(config: Rc<dyn Config>) -> Vm {
        Vm {
            config,
            cache: Rc::new(RefCell::new(HashMap::new())),
        }
    }

    fn run_template(&self, program: &Program, exec: &Exec, sink: Sink<'_>) -> Result<()> {
        for (name, body) in &program.blocks {
            exec.info
                .borrow_mut()
                .register_block(name, ProgramBlock { body: body.clone() });
        }
        match self.run_block(&program.root, exec, sink)? {
            Flow::Normal | Flow::Stop => Ok(()),
            flow => panic!("loop control flow {:?} escaped the program root", flow),
        }
    }

    fn run_block(&self, stmts: &[Stmt], exec: &Exec, sink: Sink<'_>) -> Result<Flow> {
        // open buffers capture everything emitted until their EndBuffer
        let mut buffers: Vec<String> = Vec::new();
        for stmt in stmts {
            let flow = match stmt {
                Stmt::BeginBuffer => {
                    buffers.push(String::new());
                    Flow::Normal
                }
                Stmt::EndBuffer { local } => {
                    let buffer = match buffers.pop() {
                        Some(buffer) => buffer,
                        None => panic!("buffer end without a matching begin"),
                    };
                    exec.set_local(local, Value::Str(buffer));
                    Flow::Normal
                }
                other => match buffers.last_mut() {
                    Some(buffer) => {
                        self.exec_stmt(other, exec, &mut |chunk| buffer.push_str(chunk))?
                    }
                    None => self.exec_stmt(other, exec, sink)?,
                },
            };
            if flow != Flow::Normal {
                if !buffers.is_empty() {
                    panic!("control flow {:?} escaped a buffered region", flow);
                }
                return Ok(flow);
            }
        }
        if !buffers.is_empty() {
            panic!("buffer left open at the end of a statement list");
        }
        Ok(Flow::Normal)
    }

    fn exec_stmt(&self, stmt: &Stmt, exec: &Exec, sink: Sink<'_>) -> Result<Flow> {
        match stmt {
            Stmt::BeginBuffer | Stmt::EndBuffer { .. } => {
                unreachable!("buffer markers are handled by run_block")
            }
            Stmt::Alias { to, from } => {
                exec.set_local(to, exec.get_local(from));
                Ok(Flow::Normal)
            }
            Stmt::Lookup { local, name } => {
                exec.set_local(local, exec.lookup_context(name));
                Ok(Flow::Normal)
            }
            Stmt::Assign { local, value } => {
                let value = self.eval(value, exec)?;
                exec.set_local(local, value);
                Ok(Flow::Normal)
            }
            Stmt::Unpack { target, value } => {
                let value = self.eval(value, exec)?;
                for (local, value) in unpack::unpack(&*self.config, target, value)? {
                    exec.set_local(&local, value);
                }
                Ok(Flow::Normal)
            }
            Stmt::Export { name, value } => {
                if exec.exporting {
                    let value = self.eval(value, exec)?;
                    exec.info.borrow_mut().export_var(name, value);
                }
                Ok(Flow::Normal)
            }
            Stmt::Emit(value) => {
                let value = self.eval(value, exec)?;
                let autoescape = exec.info.borrow().autoescape;
                sink(&self.config.finalize(&value, autoescape));
                Ok(Flow::Normal)
            }
            Stmt::Discard(value) => {
                self.eval(value, exec)?;
                Ok(Flow::Normal)
            }
            Stmt::If { test, body, else_ } => {
                if self.eval(test, exec)?.is_truthy() {
                    self.run_block(body, exec, sink)
                } else {
                    self.run_block(else_, exec, sink)
                }
            }
            Stmt::ForEach {
                target,
                loop_local,
                parent,
                iter,
                body,
                else_,
            } => {
                let parent = match parent {
                    Some(expr) => {
                        let value = self.eval(expr, exec)?;
                        (!value.is_undefined()).then_some(value)
                    }
                    None => None,
                };
                let iterable = self.eval(iter, exec)?;
                let wrapped = self.config.wrap_loop(&iterable, parent)?;
                let mut iterated = false;
                for (item, loop_state) in wrapped {
                    iterated = true;
                    exec.set_local(loop_local, loop_state);
                    for (local, value) in unpack::unpack(&*self.config, target, item)? {
                        exec.set_local(&local, value);
                    }
                    match self.run_block(body, exec, sink)? {
                        Flow::Normal | Flow::Continue => {}
                        Flow::Break => return Ok(Flow::Normal),
                        Flow::Stop => return Ok(Flow::Stop),
                    }
                }
                if !iterated {
                    return self.run_block(else_, exec, sink);
                }
                Ok(Flow::Normal)
            }
            Stmt::Break => Ok(Flow::Break),
            Stmt::Continue => Ok(Flow::Continue),
            Stmt::DefineFunction {
                local,
                export,
                name,
                params,
                defaults,
                body,
            } => {
                let func = self.make_function(name.clone(), params, defaults, body.clone(), exec)?;
                exec.set_local(local, func.clone());
                if let Some(export_name) = export {
                    if exec.exporting {
                        exec.info.borrow_mut().export_var(export_name, func);
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::RenderBlock { name, context } => {
                let block = exec.info.borrow().block_executor(name, 1)?.clone();
                let context = exec.pass_context(Some(context.as_slice()));
                let sub = Exec::new(
                    self.config.clone(),
                    exec.info.clone(),
                    Rc::new(context),
                    false,
                );
                match self.run_block(&block.body, &sub, sink)? {
                    Flow::Normal => Ok(Flow::Normal),
                    flow => panic!("control flow {:?} escaped block {:?}", flow, name),
                }
            }
            Stmt::Extends { template, context } => {
                let value = self.eval(template, exec)?;
                let (name, parent) = self.load_program(&value, exec)?;
                let context = exec.pass_context(Some(context.as_slice()));
                let sub = Exec::new(
                    self.config.clone(),
                    exec.info.clone(),
                    Rc::new(context),
                    false,
                );
                tracing::debug!(parent = name.as_str(), "extending template");
                self.run_template(&parent, &sub, sink)?;
                Ok(Flow::Stop)
            }
            Stmt::Include {
                template,
                context,
                ignore_missing,
            } => {
                let value = self.eval(template, exec)?;
                let loaded = self.load_program(&value, exec);
                let (name, included) = match loaded {
                    Err(err) if *ignore_missing && err.is_template_not_found() => {
                        return Ok(Flow::Normal)
                    }
                    other => other?,
                };
                let info: SharedInfo = Rc::new(RefCell::new(
                    exec.info.borrow().fork(Some(&name), InfoBehavior::Include),
                ));
                let context = exec.pass_context(context.as_deref());
                let sub = Exec::new(self.config.clone(), info, Rc::new(context), false);
                self.run_template(&included, &sub, sink)?;
                Ok(Flow::Normal)
            }
            Stmt::Import {
                template,
                context,
                local,
                export,
            } => {
                let module = self.import_module(template, context.as_deref(), exec)?;
                exec.set_local(local, module.clone());
                if let Some(name) = export {
                    if exec.exporting {
                        exec.info.borrow_mut().export_var(name, module);
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::FromImport {
                template,
                context,
                names,
            } => {
                let module = self.import_module(template, context.as_deref(), exec)?;
                for binding in names {
                    let value = self.config.resolve_from_import(&module, &binding.name)?;
                    exec.set_local(&binding.local, value.clone());
                    if let Some(name) = &binding.export {
                        if exec.exporting {
                            exec.info.borrow_mut().export_var(name, value);
                        }
                    }
                }
                Ok(Flow::Normal)
            }
        }
    }

    /// Renders the named template as a module value.
    fn import_module(
        &self,
        template: &Expr,
        context: Option<&[(String, String)]>,
        exec: &Exec,
    ) -> Result<Value> {
        let value = self.eval(template, exec)?;
        let (name, program) = self.load_program(&value, exec)?;
        let info: SharedInfo = Rc::new(RefCell::new(
            exec.info.borrow().fork(Some(&name), InfoBehavior::Import),
        ));
        let context = exec.pass_context(context);
        let mut body = String::new();
        {
            let sub = Exec::new(self.config.clone(), info.clone(), Rc::new(context), true);
            self.run_template(&program, &sub, &mut |chunk| body.push_str(chunk))?;
        }
        let exports = info.borrow().exports.clone();
        Ok(self.config.make_module(&name, exports, body))
    }

    /// Resolves a template value to a lowered program, via the cache.
    fn load_program(&self, value: &Value, exec: &Exec) -> Result<(String, Rc<Program>)> {
        let parent = exec.info.borrow().template_name.clone();
        let (name, template) = match value {
            Value::Str(name) | Value::Markup(name) => {
                let path = self.config.join_path(name, parent.as_deref());
                let template = self.config.get_template(&path)?;
                (path, template)
            }
            Value::List(items) | Value::Tuple(items) => {
                let names = items
                    .iter()
                    .map(|item| match item.as_str() {
                        Some(s) => Ok(self.config.join_path(s, parent.as_deref())),
                        None => Err(Error::Type(format!(
                            "template names must be strings, got {}",
                            item.type_name()
                        ))),
                    })
                    .collect::<Result<Vec<_>>>()?;
                self.config.select_template(&names)?
            }
            other => {
                return Err(Error::Type(format!(
                    "cannot load a template from {}",
                    other.type_name()
                )))
            }
        };
        if let Some(program) = self.cache.borrow().get(&name) {
            return Ok((name, program.clone()));
        }
        let options = LowerOptions::from_config(&*self.config);
        let program = Rc::new(lower::lower(&template, &options)?);
        self.cache.borrow_mut().insert(name.clone(), program.clone());
        tracing::trace!(template = name.as_str(), "lowered and cached template");
        Ok((name, program))
    }

    fn make_function(
        &self,
        name: Option<String>,
        params: &[(String, String)],
        defaults: &[Expr],
        body: Rc<Vec<Stmt>>,
        exec: &Exec,
    ) -> Result<Value> {
        let sources: Vec<String> = params.iter().map(|(source, _)| source.clone()).collect();
        let locals: Vec<String> = params.iter().map(|(_, local)| local.clone()).collect();
        let mut default_values = Vec::new();
        for default in defaults {
            default_values.push(self.eval(default, exec)?);
        }
        let vm = self.clone();
        let config = self.config.clone();
        let info = exec.info.clone();
        let context = exec.context.clone();
        let captured = exec.env.clone();
        Ok(Value::function(name, move |args, kwargs| {
            let mut bound = ops::bind_params(&sources, &default_values, args, kwargs)?;
            let mut scope = BTreeMap::new();
            for (source, local) in sources.iter().zip(&locals) {
                if let Some(value) = bound.remove(source) {
                    scope.insert(local.clone(), value);
                }
            }
            let mut env = captured.clone();
            env.push(Rc::new(RefCell::new(scope)));
            let sub = Exec {
                config: config.clone(),
                info: info.clone(),
                context: context.clone(),
                env,
                exporting: false,
            };
            let mut out = String::new();
            let flow = vm.run_block(&body, &sub, &mut |chunk| out.push_str(chunk))?;
            if flow != Flow::Normal {
                panic!("control flow {:?} escaped a function body", flow);
            }
            Ok(config.mark_safe(Value::Str(out)))
        }))
    }

    fn eval(&self, expr: &Expr, exec: &Exec) -> Result<Value> {
        match expr {
            Expr::Local(local) => Ok(exec.get_local(local)),
            Expr::Const(value) => Ok(value.clone()),
            Expr::List(items) => Ok(Value::List(
                items
                    .iter()
                    .map(|item| self.eval(item, exec))
                    .collect::<Result<_>>()?,
            )),
            Expr::Tuple(items) => Ok(Value::Tuple(
                items
                    .iter()
                    .map(|item| self.eval(item, exec))
                    .collect::<Result<_>>()?,
            )),
            Expr::Map(items) => {
                let mut map = BTreeMap::new();
                for (key, value) in items {
                    let key = self.eval(key, exec)?.as_key()?;
                    map.insert(key, self.eval(value, exec)?);
                }
                Ok(Value::Map(map))
            }
            Expr::CondExpr { test, true_, false_ } => {
                if self.eval(test, exec)?.is_truthy() {
                    self.eval(true_, exec)
                } else {
                    self.eval(false_, exec)
                }
            }
            Expr::BinOp { op, left, right } => {
                let left = self.eval(left, exec)?;
                let right = self.eval(right, exec)?;
                ops::binop(*op, &left, &right)
            }
            Expr::And { left, right } => {
                let left = self.eval(left, exec)?;
                if left.is_truthy() {
                    self.eval(right, exec)
                } else {
                    Ok(left)
                }
            }
            Expr::Or { left, right } => {
                let left = self.eval(left, exec)?;
                if left.is_truthy() {
                    Ok(left)
                } else {
                    self.eval(right, exec)
                }
            }
            Expr::UnOp { op, node } => {
                let value = self.eval(node, exec)?;
                ops::unop(*op, &value)
            }
            Expr::Compare { expr, ops: chain } => {
                let mut left = self.eval(expr, exec)?;
                for (op, operand) in chain {
                    let right = self.eval(operand, exec)?;
                    if !ops::compare(*op, &left, &right)? {
                        return Ok(Value::Bool(false));
                    }
                    left = right;
                }
                Ok(Value::Bool(true))
            }
            Expr::Getattr { node, attr } => {
                let obj = self.eval(node, exec)?;
                let attr = self.eval(attr, exec)?;
                Ok(self.config.getattr(&obj, &attr))
            }
            Expr::Getitem { node, arg } => {
                let obj = self.eval(node, exec)?;
                if let Expr::Slice { start, stop, step } = arg.as_ref() {
                    let start = self.eval_slice_part(start, exec)?;
                    let stop = self.eval_slice_part(stop, exec)?;
                    let step = self.eval_slice_part(step, exec)?;
                    return self.config.getslice(&obj, start, stop, step);
                }
                let key = self.eval(arg, exec)?;
                Ok(self.config.getitem(&obj, &key))
            }
            Expr::Slice { .. } => panic!("slice node outside a subscript"),
            Expr::Call { node, args } => {
                let callee = self.eval(node, exec)?;
                let (args, kwargs) = self.eval_call_args(args, exec)?;
                match callee {
                    Value::Function(func) => func.call(args, kwargs),
                    other => Err(Error::Type(format!(
                        "{} is not callable",
                        other.type_name()
                    ))),
                }
            }
            Expr::Filter { node, name, args } => {
                let value = self.eval(node, exec)?;
                let (args, kwargs) = self.eval_call_args(args, exec)?;
                exec.info.borrow().call_filter(name, value, args, kwargs)
            }
            Expr::Test { node, name, args } => {
                let value = self.eval(node, exec)?;
                let (args, kwargs) = self.eval_call_args(args, exec)?;
                exec.info.borrow().call_test(name, value, args, kwargs)
            }
            Expr::Concat(items) => {
                let mut out = String::new();
                for item in items {
                    out.push_str(&self.eval(item, exec)?.render_plain());
                }
                Ok(Value::Str(out))
            }
            Expr::MarkSafe(node) => {
                let value = self.eval(node, exec)?;
                Ok(self.config.mark_safe(value))
            }
            Expr::MarkSafeIfAutoescape(node) => {
                let value = self.eval(node, exec)?;
                if exec.info.borrow().autoescape {
                    Ok(self.config.mark_safe(value))
                } else {
                    Ok(value)
                }
            }
        }
    }

    fn eval_slice_part(&self, part: &Option<Box<Expr>>, exec: &Exec) -> Result<Option<i64>> {
        match part {
            None => Ok(None),
            Some(expr) => match self.eval(expr, exec)? {
                Value::None | Value::Undefined { .. } => Ok(None),
                Value::Int(i) => Ok(Some(i)),
                other => Err(Error::Type(format!(
                    "slice bounds must be integers, got {}",
                    other.type_name()
                ))),
            },
        }
    }

    fn eval_call_args(
        &self,
        args: &CallArgs,
        exec: &Exec,
    ) -> Result<(Vec<Value>, BTreeMap<String, Value>)> {
        let positional = args
            .args
            .iter()
            .map(|arg| self.eval(arg, exec))
            .collect::<Result<Vec<_>>>()?;
        let keyword = args
            .kwargs
            .iter()
            .map(|(key, value)| Ok((key.clone(), self.eval(value, exec)?)))
            .collect::<Result<Vec<_>>>()?;
        let dyn_args = match &args.dyn_args {
            Some(expr) => Some(self.eval(expr, exec)?),
            None => None,
        };
        let dyn_kwargs = match &args.dyn_kwargs {
            Some(expr) => Some(self.eval(expr, exec)?),
            None => None,
        };
        ops::build_call_args(positional, keyword, dyn_args, dyn_kwargs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tpl_core::config::DefaultConfig;
    use tpl_core::nodes::{Expr as Ast, NameCtx, Stmt as AstStmt};

    fn render_default(template: &Template, vars: Vec<(&str, Value)>) -> String {
        let vars = vars
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        render(Rc::new(DefaultConfig::new()), template, vars).unwrap()
    }

    #[test]
    fn test_context_lookup_and_emit() {
        let template = Template::new(vec![AstStmt::Output {
            nodes: vec![
                Ast::name("a", NameCtx::Load),
                Ast::template_data("!"),
            ],
            lineno: 1,
        }]);
        assert_eq!(
            render_default(&template, vec![("a", Value::from(42))]),
            "42!"
        );
        assert_eq!(render_default(&template, vec![]), "!");
    }

    #[test]
    fn test_shadowing_keeps_the_outer_value() {
        let template = Template::new(vec![
            AstStmt::Output {
                nodes: vec![Ast::name("a", NameCtx::Load)],
                lineno: 1,
            },
            AstStmt::If {
                test: Ast::constant(true),
                body: vec![
                    AstStmt::Assign {
                        target: Ast::name("a", NameCtx::Store),
                        node: Ast::constant(23),
                        lineno: 1,
                    },
                    AstStmt::Output {
                        nodes: vec![Ast::name("a", NameCtx::Load)],
                        lineno: 1,
                    },
                ],
                else_: vec![],
                lineno: 1,
            },
            AstStmt::Output {
                nodes: vec![Ast::name("a", NameCtx::Load)],
                lineno: 1,
            },
        ]);
        assert_eq!(
            render_default(&template, vec![("a", Value::from(42))]),
            "422342"
        );
    }

    #[test]
    fn test_filter_block_buffers_output() {
        let mut config = DefaultConfig::new();
        config.add_filter("uppercase", |value, _, _| {
            Ok(Value::from(value.render_plain().to_uppercase()))
        });
        let template = Template::new(vec![AstStmt::FilterBlock {
            body: vec![AstStmt::Output {
                nodes: vec![Ast::template_data("hello "), Ast::name("a", NameCtx::Load)],
                lineno: 1,
            }],
            name: "uppercase".to_string(),
            args: vec![],
            kwargs: vec![],
            dyn_args: None,
            dyn_kwargs: None,
            lineno: 1,
        }]);
        let vars = vec![("a".to_string(), Value::from("world"))]
            .into_iter()
            .collect();
        assert_eq!(
            render(Rc::new(config), &template, vars).unwrap(),
            "HELLO WORLD"
        );
    }

    #[test]
    fn test_unbound_local_reads_as_undefined() {
        let exec = Exec::new(
            Rc::new(DefaultConfig::new()),
            Rc::new(RefCell::new(RuntimeInfo::new(&DefaultConfig::new(), None))),
            Rc::new(BTreeMap::new()),
            false,
        );
        assert!(exec.get_local("l_a_0").is_undefined());
        assert!(exec.get_local("t3").is_undefined());
    }
}
