//! The tree-walking evaluator.
//!
//! Statements push rendered chunks into a caller-supplied sink;
//! expressions return values. Loop control flow travels as a [`Flow`]
//! result from the statement visitors to the nearest enclosing loop; a
//! `Stop` (produced by `extends`) unwinds to the template root. A
//! `Break` or `Continue` reaching the root means the frontend emitted
//! loop controls outside a loop, which is a contract violation and
//! panics.

use std::collections::BTreeMap;
use std::rc::Rc;

use tpl_core::config::Config;
use tpl_core::error::{Error, Result};
use tpl_core::nodes::{Expr, Keyword, NameCtx, Stmt, Template};
use tpl_core::runtime::InfoBehavior;
use tpl_core::unpack::{self, Target};
use tpl_core::value::Value;
use tpl_core::{ops, tracing};

use crate::state::{BlockExec, InterpreterState, SharedInfo};

/// How statement execution continues after a visitor returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Normal,
    Break,
    Continue,
    /// Stop rendering the current template body (after `extends`).
    Stop,
}

pub type Sink<'a> = &'a mut dyn FnMut(&str);

/// Renders `template` with `vars` to a single string.
pub fn render(
    config: Rc<dyn Config>,
    template: &Template,
    vars: BTreeMap<String, Value>,
) -> Result<String> {
    let interpreter = Interpreter::new(config.clone());
    let mut state = InterpreterState::new(config, None, vars);
    let mut out = String::new();
    interpreter.evaluate(template, &mut state, &mut |chunk| out.push_str(chunk))?;
    Ok(out)
}

pub struct Interpreter {
    config: Rc<dyn Config>,
}

impl Interpreter {
    pub fn new(config: Rc<dyn Config>) -> Interpreter {
        Interpreter { config }
    }

    /// Renders a whole template into `sink`.
    pub fn evaluate(
        &self,
        template: &Template,
        state: &mut InterpreterState,
        sink: Sink<'_>,
    ) -> Result<()> {
        self.register_blocks(template, state);
        match self.visit_block(&template.body, state, sink)? {
            Flow::Normal | Flow::Stop => Ok(()),
            flow => panic!("loop control flow {:?} escaped the template root", flow),
        }
    }

    fn register_blocks(&self, template: &Template, state: &mut InterpreterState) {
        for (name, body) in template.find_blocks() {
            tracing::trace!(block = name, "registering block");
            state.info.borrow_mut().register_block(
                name,
                BlockExec {
                    body: Rc::new(body.to_vec()),
                },
            );
        }
    }

    fn visit_block(
        &self,
        stmts: &[Stmt],
        state: &mut InterpreterState,
        sink: Sink<'_>,
    ) -> Result<Flow> {
        for stmt in stmts {
            match self.visit_stmt(stmt, state, sink)? {
                Flow::Normal => {}
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Normal)
    }

    fn visit_stmt(
        &self,
        stmt: &Stmt,
        state: &mut InterpreterState,
        sink: Sink<'_>,
    ) -> Result<Flow> {
        match stmt {
            Stmt::Output { nodes, .. } => {
                let autoescape = state.info.borrow().autoescape;
                for node in nodes {
                    let value = self.eval(node, state)?;
                    sink(&self.config.finalize(&value, autoescape));
                }
                Ok(Flow::Normal)
            }
            Stmt::If {
                test, body, else_, ..
            } => {
                let branch = if self.eval(test, state)?.is_truthy() {
                    body
                } else {
                    else_
                };
                state.push_frame();
                let flow = self.visit_block(branch, state, sink);
                state.pop_frame();
                flow
            }
            Stmt::For {
                target,
                iter,
                body,
                else_,
                ..
            } => self.visit_for(target, iter, body, else_, state, sink),
            Stmt::Assign { target, node, .. } => {
                let value = self.eval(node, state)?;
                self.assign_target(target, value, state)?;
                Ok(Flow::Normal)
            }
            Stmt::ExprStmt { node, .. } => {
                self.eval(node, state)?;
                Ok(Flow::Normal)
            }
            Stmt::Scope { body, .. } => {
                state.push_frame();
                let flow = self.visit_block(body, state, sink);
                state.pop_frame();
                flow
            }
            Stmt::Block { name, .. } => {
                self.evaluate_block(name, 1, state, sink)?;
                Ok(Flow::Normal)
            }
            Stmt::Extends { template, .. } => {
                let value = self.eval(template, state)?;
                let (name, parent) = self.resolve_template(&value, state)?;
                let vars = state.flatten();
                let mut sub = InterpreterState::with_info(
                    self.config.clone(),
                    state.info.clone(),
                    vars,
                    false,
                );
                // parent blocks append behind the ones already
                // registered, keeping this template most derived
                self.register_blocks(&parent, &mut sub);
                tracing::debug!(parent = name.as_str(), "extending template");
                match self.visit_block(&parent.body, &mut sub, sink)? {
                    Flow::Normal | Flow::Stop => {}
                    flow => panic!("loop control flow {:?} escaped a template root", flow),
                }
                Ok(Flow::Stop)
            }
            Stmt::Include {
                template,
                with_context,
                ignore_missing,
                ..
            } => {
                let value = self.eval(template, state)?;
                let resolved = self.resolve_template(&value, state);
                let (name, included) = match resolved {
                    Err(err) if *ignore_missing && err.is_template_not_found() => {
                        return Ok(Flow::Normal)
                    }
                    other => other?,
                };
                let info: SharedInfo = Rc::new(std::cell::RefCell::new(
                    state.info.borrow().fork(Some(&name), InfoBehavior::Include),
                ));
                let vars = if *with_context {
                    state.flatten()
                } else {
                    BTreeMap::new()
                };
                let mut sub =
                    InterpreterState::with_info(self.config.clone(), info, vars, false);
                self.register_blocks(&included, &mut sub);
                match self.visit_block(&included.body, &mut sub, sink)? {
                    Flow::Normal | Flow::Stop => Ok(Flow::Normal),
                    flow => panic!("loop control flow {:?} escaped a template root", flow),
                }
            }
            Stmt::Import {
                template,
                target,
                with_context,
                ..
            } => {
                let module = self.import_module(template, *with_context, state)?;
                self.assign_target(target, module, state)?;
                Ok(Flow::Normal)
            }
            Stmt::FromImport {
                template,
                names,
                with_context,
                ..
            } => {
                let module = self.import_module(template, *with_context, state)?;
                for entry in names {
                    let value = self.config.resolve_from_import(&module, &entry.name)?;
                    let bound = entry.alias.as_deref().unwrap_or(&entry.name);
                    state.assign(bound, value);
                }
                Ok(Flow::Normal)
            }
            Stmt::Function {
                target,
                args,
                defaults,
                body,
                ..
            } => {
                let name = match target {
                    Expr::Name { name, .. } => name.clone(),
                    other => panic!("cannot bind a function to a {} node", other.kind_name()),
                };
                let func = self.make_function(Some(name.clone()), args, defaults, body, state)?;
                state.assign(&name, func);
                Ok(Flow::Normal)
            }
            Stmt::FilterBlock {
                body,
                name,
                args,
                kwargs,
                dyn_args,
                dyn_kwargs,
                ..
            } => {
                state.push_frame();
                let result = (|| {
                    let mut buffer = String::new();
                    let flow =
                        self.visit_block(body, state, &mut |chunk| buffer.push_str(chunk))?;
                    if flow != Flow::Normal {
                        panic!("control flow {:?} escaped a filter block", flow);
                    }
                    let (args, kwargs) =
                        self.call_args(args, kwargs, dyn_args.as_ref(), dyn_kwargs.as_ref(), state)?;
                    state
                        .info
                        .borrow()
                        .call_filter(name, Value::Str(buffer), args, kwargs)
                })();
                state.pop_frame();
                let value = result?;
                let autoescape = state.info.borrow().autoescape;
                sink(&self.config.finalize(&value, autoescape));
                Ok(Flow::Normal)
            }
            Stmt::CallOut { call, body, .. } => {
                state.push_frame();
                let result = (|| {
                    let caller = self.make_function(None, &[], &[], body, state)?;
                    state.assign(self.config.callout_name(), caller);
                    self.eval(call, state)
                })();
                state.pop_frame();
                let value = result?;
                let autoescape = state.info.borrow().autoescape;
                sink(&self.config.finalize(&value, autoescape));
                Ok(Flow::Normal)
            }
            Stmt::Continue { .. } => Ok(Flow::Continue),
            Stmt::Break { .. } => Ok(Flow::Break),
        }
    }

    fn visit_for(
        &self,
        target: &Expr,
        iter: &Expr,
        body: &[Stmt],
        else_: &[Stmt],
        state: &mut InterpreterState,
        sink: Sink<'_>,
    ) -> Result<Flow> {
        let accessor = self.config.forloop_accessor().to_string();
        let parent = if self.config.forloop_parent_access() {
            state.lookup(&accessor)
        } else {
            None
        };
        let iterable = self.eval(iter, state)?;
        let wrapped = self.config.wrap_loop(&iterable, parent)?;
        let shape = target_shape(target);
        let mut iterated = false;
        for (item, loop_state) in wrapped {
            iterated = true;
            state.push_frame();
            let flow = (|| {
                state.assign(&accessor, loop_state);
                for (name, value) in unpack::unpack(&*self.config, &shape, item)? {
                    state.assign(&name, value);
                }
                self.visit_block(body, state, sink)
            })();
            state.pop_frame();
            match flow? {
                Flow::Normal | Flow::Continue => {}
                Flow::Break => return Ok(Flow::Normal),
                Flow::Stop => return Ok(Flow::Stop),
            }
        }
        if !iterated && !else_.is_empty() {
            state.push_frame();
            let flow = self.visit_block(else_, state, sink);
            state.pop_frame();
            return flow;
        }
        Ok(Flow::Normal)
    }

    /// Runs the block executor registered for `name` at `level` with a
    /// read-only view of the currently visible variables.
    fn evaluate_block(
        &self,
        name: &str,
        level: usize,
        state: &mut InterpreterState,
        sink: Sink<'_>,
    ) -> Result<()> {
        let exec = state.info.borrow().block_executor(name, level)?.clone();
        let vars = state.flatten();
        let mut sub =
            InterpreterState::with_info(self.config.clone(), state.info.clone(), vars, false);
        match self.visit_block(&exec.body, &mut sub, sink)? {
            Flow::Normal => Ok(()),
            flow => panic!("control flow {:?} escaped block {:?}", flow, name),
        }
    }

    /// Renders the named template as a module value.
    fn import_module(
        &self,
        template: &Expr,
        with_context: bool,
        state: &mut InterpreterState,
    ) -> Result<Value> {
        let value = self.eval(template, state)?;
        let (name, imported) = self.resolve_template(&value, state)?;
        let info: SharedInfo = Rc::new(std::cell::RefCell::new(
            state.info.borrow().fork(Some(&name), InfoBehavior::Import),
        ));
        let vars = if with_context {
            state.flatten()
        } else {
            BTreeMap::new()
        };
        let mut body = String::new();
        {
            let mut sub =
                InterpreterState::with_info(self.config.clone(), info.clone(), vars, true);
            self.register_blocks(&imported, &mut sub);
            match self.visit_block(&imported.body, &mut sub, &mut |chunk| {
                body.push_str(chunk)
            })? {
                Flow::Normal | Flow::Stop => {}
                flow => panic!("loop control flow {:?} escaped a template root", flow),
            }
        }
        let exports = info.borrow().exports.clone();
        Ok(self.config.make_module(&name, exports, body))
    }

    fn resolve_template(
        &self,
        value: &Value,
        state: &InterpreterState,
    ) -> Result<(String, Rc<Template>)> {
        let parent = state.info.borrow().template_name.clone();
        match value {
            Value::Str(name) | Value::Markup(name) => {
                let path = self.config.join_path(name, parent.as_deref());
                Ok((path.clone(), self.config.get_template(&path)?))
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
                self.config.select_template(&names)
            }
            other => Err(Error::Type(format!(
                "cannot load a template from {}",
                other.type_name()
            ))),
        }
    }

    fn make_function(
        &self,
        name: Option<String>,
        args: &[Expr],
        defaults: &[Expr],
        body: &[Stmt],
        state: &mut InterpreterState,
    ) -> Result<Value> {
        let params: Vec<String> = args
            .iter()
            .map(|arg| match arg {
                Expr::Name {
                    name,
                    ctx: NameCtx::Param,
                    ..
                } => name.clone(),
                other => panic!("function parameters must be param names, got {}", other.kind_name()),
            })
            .collect();
        let defaults: Vec<Value> = defaults
            .iter()
            .map(|d| self.eval(d, state))
            .collect::<Result<_>>()?;
        let body = Rc::new(body.to_vec());
        let captured = state.capture();
        let config = self.config.clone();
        let info = state.info.clone();
        Ok(Value::function(name, move |call_args, call_kwargs| {
            let locals = ops::bind_params(&params, &defaults, call_args, call_kwargs)?;
            let interpreter = Interpreter::new(config.clone());
            let mut sub = InterpreterState::for_call(
                config.clone(),
                info.clone(),
                captured.clone(),
                locals,
            );
            let mut out = String::new();
            let flow =
                interpreter.visit_block(&body, &mut sub, &mut |chunk| out.push_str(chunk))?;
            if flow != Flow::Normal {
                panic!("control flow {:?} escaped a function body", flow);
            }
            Ok(config.mark_safe(Value::Str(out)))
        }))
    }

    fn assign_target(
        &self,
        target: &Expr,
        value: Value,
        state: &mut InterpreterState,
    ) -> Result<()> {
        match target {
            Expr::Name { name, .. } => {
                state.assign(name, value);
                Ok(())
            }
            Expr::Tuple { .. } => {
                let shape = target_shape(target);
                for (name, value) in unpack::unpack(&*self.config, &shape, value)? {
                    state.assign(&name, value);
                }
                Ok(())
            }
            other => panic!("cannot assign to a {} node", other.kind_name()),
        }
    }

    fn eval(&self, expr: &Expr, state: &mut InterpreterState) -> Result<Value> {
        match expr {
            Expr::Name { name, ctx, .. } => {
                assert!(
                    *ctx == NameCtx::Load,
                    "evaluated a {:?}-context name as an expression",
                    ctx
                );
                Ok(state.resolve(name))
            }
            Expr::Const { value, .. } => Ok(value.clone()),
            Expr::TemplateData { data, .. } => Ok(Value::Markup(data.clone())),
            Expr::Tuple { items, .. } => Ok(Value::Tuple(
                items
                    .iter()
                    .map(|item| self.eval(item, state))
                    .collect::<Result<_>>()?,
            )),
            Expr::List { items, .. } => Ok(Value::List(
                items
                    .iter()
                    .map(|item| self.eval(item, state))
                    .collect::<Result<_>>()?,
            )),
            Expr::Dict { items, .. } => {
                let mut map = BTreeMap::new();
                for pair in items {
                    let key = self.eval(&pair.key, state)?.as_key()?;
                    let value = self.eval(&pair.value, state)?;
                    map.insert(key, value);
                }
                Ok(Value::Map(map))
            }
            Expr::CondExpr {
                test, true_, false_, ..
            } => {
                if self.eval(test, state)?.is_truthy() {
                    self.eval(true_, state)
                } else {
                    self.eval(false_, state)
                }
            }
            Expr::Filter {
                node,
                name,
                args,
                kwargs,
                dyn_args,
                dyn_kwargs,
                ..
            } => {
                let value = self.eval(node, state)?;
                let (args, kwargs) = self.call_args(args, kwargs, dyn_args.as_deref(), dyn_kwargs.as_deref(), state)?;
                state.info.borrow().call_filter(name, value, args, kwargs)
            }
            Expr::Test {
                node,
                name,
                args,
                kwargs,
                dyn_args,
                dyn_kwargs,
                ..
            } => {
                let value = self.eval(node, state)?;
                let (args, kwargs) = self.call_args(args, kwargs, dyn_args.as_deref(), dyn_kwargs.as_deref(), state)?;
                state.info.borrow().call_test(name, value, args, kwargs)
            }
            Expr::Call {
                node,
                args,
                kwargs,
                dyn_args,
                dyn_kwargs,
                ..
            } => {
                let callee = self.eval(node, state)?;
                let (args, kwargs) = self.call_args(args, kwargs, dyn_args.as_deref(), dyn_kwargs.as_deref(), state)?;
                match callee {
                    Value::Function(func) => func.call(args, kwargs),
                    other => Err(Error::Type(format!(
                        "{} is not callable",
                        other.type_name()
                    ))),
                }
            }
            Expr::Getattr { node, attr, .. } => {
                let obj = self.eval(node, state)?;
                let attr = self.eval(attr, state)?;
                Ok(self.config.getattr(&obj, &attr))
            }
            Expr::Getitem { node, arg, .. } => {
                let obj = self.eval(node, state)?;
                if let Expr::Slice {
                    start, stop, step, ..
                } = arg.as_ref()
                {
                    let start = self.eval_slice_part(start, state)?;
                    let stop = self.eval_slice_part(stop, state)?;
                    let step = self.eval_slice_part(step, state)?;
                    return self.config.getslice(&obj, start, stop, step);
                }
                let key = self.eval(arg, state)?;
                Ok(self.config.getitem(&obj, &key))
            }
            Expr::Slice { .. } => panic!("slice node outside a subscript"),
            Expr::Concat { nodes, .. } => {
                let mut out = String::new();
                for node in nodes {
                    out.push_str(&self.eval(node, state)?.render_plain());
                }
                Ok(Value::Str(out))
            }
            Expr::Compare { expr, ops: chain, .. } => {
                let mut left = self.eval(expr, state)?;
                for operand in chain {
                    let right = self.eval(&operand.expr, state)?;
                    if !ops::compare(operand.op, &left, &right)? {
                        return Ok(Value::Bool(false));
                    }
                    left = right;
                }
                Ok(Value::Bool(true))
            }
            Expr::BinOp {
                op, left, right, ..
            } => {
                let left = self.eval(left, state)?;
                let right = self.eval(right, state)?;
                ops::binop(*op, &left, &right)
            }
            Expr::And { left, right, .. } => {
                let left = self.eval(left, state)?;
                if left.is_truthy() {
                    self.eval(right, state)
                } else {
                    Ok(left)
                }
            }
            Expr::Or { left, right, .. } => {
                let left = self.eval(left, state)?;
                if left.is_truthy() {
                    Ok(left)
                } else {
                    self.eval(right, state)
                }
            }
            Expr::UnOp { op, node, .. } => {
                let value = self.eval(node, state)?;
                ops::unop(*op, &value)
            }
            Expr::MarkSafe { expr, .. } => {
                let value = self.eval(expr, state)?;
                Ok(self.config.mark_safe(value))
            }
            Expr::MarkSafeIfAutoescape { expr, .. } => {
                let value = self.eval(expr, state)?;
                if state.info.borrow().autoescape {
                    Ok(self.config.mark_safe(value))
                } else {
                    Ok(value)
                }
            }
        }
    }

    fn eval_slice_part(
        &self,
        part: &Option<Box<Expr>>,
        state: &mut InterpreterState,
    ) -> Result<Option<i64>> {
        match part {
            None => Ok(None),
            Some(expr) => match self.eval(expr, state)? {
                Value::None | Value::Undefined { .. } => Ok(None),
                Value::Int(i) => Ok(Some(i)),
                other => Err(Error::Type(format!(
                    "slice bounds must be integers, got {}",
                    other.type_name()
                ))),
            },
        }
    }

    fn call_args(
        &self,
        args: &[Expr],
        kwargs: &[Keyword],
        dyn_args: Option<&Expr>,
        dyn_kwargs: Option<&Expr>,
        state: &mut InterpreterState,
    ) -> Result<(Vec<Value>, BTreeMap<String, Value>)> {
        let args = args
            .iter()
            .map(|arg| self.eval(arg, state))
            .collect::<Result<Vec<_>>>()?;
        let kwargs = kwargs
            .iter()
            .map(|kw| Ok((kw.key.clone(), self.eval(&kw.value, state)?)))
            .collect::<Result<Vec<_>>>()?;
        let dyn_args = match dyn_args {
            Some(expr) => Some(self.eval(expr, state)?),
            None => None,
        };
        let dyn_kwargs = match dyn_kwargs {
            Some(expr) => Some(self.eval(expr, state)?),
            None => None,
        };
        ops::build_call_args(args, kwargs, dyn_args, dyn_kwargs)
    }
}

/// The unpack shape of an assignment or loop target. Payloads are the
/// source names themselves; this backend has no identifier rewriting.
fn target_shape(target: &Expr) -> Target<String> {
    match target {
        Expr::Name { name, .. } => Target::name(name.clone(), name.clone()),
        Expr::Tuple { items, .. } => Target::Tuple(items.iter().map(target_shape).collect()),
        other => panic!("cannot assign to a {} node", other.kind_name()),
    }
}
