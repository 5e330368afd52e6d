//! Template-to-program lowering.
//!
//! Lowering runs in two passes over one [`FrameArena`]. The setup pass
//! builds the frame tree: it analyzes every statement list into its
//! frame and records which frames belong to which compound statement
//! (loop bodies and function bodies get their targets and parameters
//! declared up front). The emit pass then produces host statements; at
//! each frame boundary it injects the frame's prologue in the fixed
//! order entry aliases, hoisted function definitions, context lookups.
//!
//! Block bodies are lowered as hard-scoped statement lists of their own
//! and collected into [`Program::blocks`]; the block's site becomes a
//! `RenderBlock` instruction carrying the variables visible there.

use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use tpl_core::config::Config;
use tpl_core::error::Result;
use tpl_core::fstate::{FrameArena, FrameId, ScopeKind};
use tpl_core::idtracking::TrackerOptions;
use tpl_core::nodes::{Expr as Ast, Keyword, NameCtx, Stmt as AstStmt, Template};
use tpl_core::unpack::Target;
use tpl_core::value::Value;

use crate::host::{self, CallArgs, ImportBinding, Program};

#[derive(Debug, Clone)]
pub struct LowerOptions {
    pub tracker: TrackerOptions,
    pub callout_name: String,
    /// Mint `l<n>` locals instead of `l_<name>_<n>`.
    pub short_ids: bool,
}

impl Default for LowerOptions {
    fn default() -> LowerOptions {
        LowerOptions {
            tracker: TrackerOptions::default(),
            callout_name: "caller".to_string(),
            short_ids: false,
        }
    }
}

impl LowerOptions {
    pub fn from_config(config: &dyn Config) -> LowerOptions {
        LowerOptions {
            tracker: TrackerOptions {
                forloop_accessor: config.forloop_accessor().to_string(),
                forloop_parent_access: config.forloop_parent_access(),
            },
            callout_name: config.callout_name().to_string(),
            short_ids: false,
        }
    }
}

/// Lowers one template into an executable program.
pub fn lower(template: &Template, options: &LowerOptions) -> Result<Program> {
    let mut lowerer = Lowerer {
        frames: FrameArena::new(options.tracker.clone(), options.short_ids),
        blocks: BTreeMap::new(),
        subframes: HashMap::new(),
        accessor: options.tracker.forloop_accessor.clone(),
        parent_access: options.tracker.forloop_parent_access,
        callout_name: options.callout_name.clone(),
    };
    let root = lowerer.frames.root_frame();
    lowerer.setup(root, &template.body);
    let body = lowerer.emit_frame(root, &template.body, true)?;
    tracing::debug!(
        stmts = body.len(),
        blocks = lowerer.blocks.len(),
        "lowered template"
    );
    Ok(Program {
        root: body,
        blocks: lowerer.blocks,
    })
}

/// The frames created for a compound statement's nested bodies.
#[derive(Clone, Copy)]
struct SubFrames {
    body: FrameId,
    else_: Option<FrameId>,
}

struct Lowerer<'ast> {
    frames: FrameArena<'ast>,
    blocks: BTreeMap<String, Rc<Vec<host::Stmt>>>,
    subframes: HashMap<*const AstStmt, SubFrames>,
    accessor: String,
    parent_access: bool,
    callout_name: String,
}

impl<'ast> Lowerer<'ast> {
    fn setup(&mut self, frame: FrameId, stmts: &'ast [AstStmt]) {
        self.frames.analyze(frame, stmts);
        for stmt in stmts {
            let key = stmt as *const AstStmt;
            match stmt {
                AstStmt::If { body, else_, .. } => {
                    let body_frame = self.frames.derive(frame, ScopeKind::Soft);
                    self.setup(body_frame, body);
                    let else_frame = self.frames.derive(frame, ScopeKind::Soft);
                    self.setup(else_frame, else_);
                    self.subframes.insert(
                        key,
                        SubFrames {
                            body: body_frame,
                            else_: Some(else_frame),
                        },
                    );
                }
                AstStmt::For {
                    target, body, else_, ..
                } => {
                    let loop_frame = self.frames.derive(frame, ScopeKind::Soft);
                    self.declare_target(loop_frame, target);
                    let accessor = self.accessor.clone();
                    self.frames.declare_param(loop_frame, &accessor);
                    self.setup(loop_frame, body);
                    let else_frame = self.frames.derive(frame, ScopeKind::Soft);
                    self.setup(else_frame, else_);
                    self.subframes.insert(
                        key,
                        SubFrames {
                            body: loop_frame,
                            else_: Some(else_frame),
                        },
                    );
                }
                AstStmt::Scope { body, .. }
                | AstStmt::FilterBlock { body, .. }
                | AstStmt::CallOut { body, .. } => {
                    let body_frame = self.frames.derive(frame, ScopeKind::Soft);
                    self.setup(body_frame, body);
                    self.subframes.insert(
                        key,
                        SubFrames {
                            body: body_frame,
                            else_: None,
                        },
                    );
                }
                AstStmt::Block { body, .. } => {
                    let block_frame = self.frames.derive(frame, ScopeKind::Hard);
                    self.setup(block_frame, body);
                    self.subframes.insert(
                        key,
                        SubFrames {
                            body: block_frame,
                            else_: None,
                        },
                    );
                }
                AstStmt::Function { args, body, .. } => {
                    let fn_frame = self.frames.derive(frame, ScopeKind::Soft);
                    for arg in args {
                        match arg {
                            Ast::Name {
                                name,
                                ctx: NameCtx::Param,
                                ..
                            } => {
                                self.frames.declare_param(fn_frame, name);
                            }
                            other => panic!(
                                "function parameters must be param names, got {}",
                                other.kind_name()
                            ),
                        }
                    }
                    self.setup(fn_frame, body);
                    self.subframes.insert(
                        key,
                        SubFrames {
                            body: fn_frame,
                            else_: None,
                        },
                    );
                }
                _ => {}
            }
        }
    }

    fn declare_target(&mut self, frame: FrameId, target: &'ast Ast) {
        match target {
            Ast::Name { name, .. } => {
                self.frames.declare_param(frame, name);
            }
            Ast::Tuple { items, .. } => {
                for item in items {
                    self.declare_target(frame, item);
                }
            }
            other => panic!("cannot assign to a {} node", other.kind_name()),
        }
    }

    fn sub(&self, stmt: &AstStmt) -> SubFrames {
        self.subframes[&(stmt as *const AstStmt)]
    }

    /// The prologue of `frame` followed by its lowered statements.
    fn emit_frame(
        &mut self,
        frame: FrameId,
        stmts: &'ast [AstStmt],
        export: bool,
    ) -> Result<Vec<host::Stmt>> {
        let mut out = Vec::new();
        let scope_code = self.frames.scope_code(frame);
        for (to, from) in scope_code.aliases {
            out.push(host::Stmt::Alias { to, from });
        }
        for stmt in stmts {
            if matches!(stmt, AstStmt::Function { .. }) {
                self.emit_function_def(frame, stmt, export, &mut out)?;
            }
        }
        for (local, name) in scope_code.lookups {
            out.push(host::Stmt::Lookup { local, name });
        }
        for stmt in stmts {
            self.emit_stmt(frame, stmt, export, &mut out)?;
        }
        Ok(out)
    }

    fn emit_function_def(
        &mut self,
        frame: FrameId,
        stmt: &'ast AstStmt,
        export: bool,
        out: &mut Vec<host::Stmt>,
    ) -> Result<()> {
        let (target, args, defaults, body) = match stmt {
            AstStmt::Function {
                target,
                args,
                defaults,
                body,
                ..
            } => (target, args, defaults, body),
            _ => unreachable!("emit_function_def on a non-function statement"),
        };
        let name = match target {
            Ast::Name { name, .. } => name.clone(),
            other => panic!("cannot bind a function to a {} node", other.kind_name()),
        };
        let sub = self.sub(stmt);
        let mut params = Vec::new();
        for arg in args {
            match arg {
                Ast::Name {
                    name,
                    ctx: NameCtx::Param,
                    ..
                } => params.push((name.clone(), self.frames.lookup_name(sub.body, name))),
                other => panic!(
                    "function parameters must be param names, got {}",
                    other.kind_name()
                ),
            }
        }
        let mut lowered_defaults = Vec::new();
        for default in defaults {
            lowered_defaults.push(self.emit_expr(frame, default)?);
        }
        let lowered_body = Rc::new(self.emit_frame(sub.body, body, false)?);
        out.push(host::Stmt::DefineFunction {
            local: self.frames.lookup_name(frame, &name),
            export: export.then(|| name.clone()),
            name: Some(name),
            params,
            defaults: lowered_defaults,
            body: lowered_body,
        });
        Ok(())
    }

    fn emit_stmt(
        &mut self,
        frame: FrameId,
        stmt: &'ast AstStmt,
        export: bool,
        out: &mut Vec<host::Stmt>,
    ) -> Result<()> {
        match stmt {
            // hoisted into the prologue
            AstStmt::Function { .. } => {}
            AstStmt::Output { nodes, .. } => {
                for node in nodes {
                    let value = self.emit_expr(frame, node)?;
                    out.push(host::Stmt::Emit(value));
                }
            }
            AstStmt::If {
                test, body, else_, ..
            } => {
                let sub = self.sub(stmt);
                let else_frame = match sub.else_ {
                    Some(id) => id,
                    None => unreachable!("if statement without an else frame"),
                };
                let test = self.emit_expr(frame, test)?;
                let body = self.emit_frame(sub.body, body, false)?;
                let else_ = self.emit_frame(else_frame, else_, false)?;
                out.push(host::Stmt::If { test, body, else_ });
            }
            AstStmt::For {
                target,
                iter,
                body,
                else_,
                ..
            } => {
                let sub = self.sub(stmt);
                let else_frame = match sub.else_ {
                    Some(id) => id,
                    None => unreachable!("for statement without an else frame"),
                };
                let parent = if self.parent_access {
                    let accessor = self.accessor.clone();
                    Some(host::Expr::Local(self.frames.lookup_name(frame, &accessor)))
                } else {
                    None
                };
                let iter = self.emit_expr(frame, iter)?;
                let shape = self.target_shape(sub.body, target);
                let accessor = self.accessor.clone();
                let loop_local = self.frames.lookup_name(sub.body, &accessor);
                let body = self.emit_frame(sub.body, body, false)?;
                let else_ = self.emit_frame(else_frame, else_, false)?;
                out.push(host::Stmt::ForEach {
                    target: shape,
                    loop_local,
                    parent,
                    iter,
                    body,
                    else_,
                });
            }
            AstStmt::Assign { target, node, .. } => {
                let value = self.emit_expr(frame, node)?;
                match target {
                    Ast::Name { name, .. } => {
                        let local = self.frames.lookup_name(frame, name);
                        out.push(host::Stmt::Assign {
                            local: local.clone(),
                            value,
                        });
                        if export {
                            out.push(host::Stmt::Export {
                                name: name.clone(),
                                value: host::Expr::Local(local),
                            });
                        }
                    }
                    Ast::Tuple { .. } => {
                        let shape = self.target_shape(frame, target);
                        out.push(host::Stmt::Unpack {
                            target: shape.clone(),
                            value,
                        });
                        if export {
                            for_each_leaf(&shape, &mut |local, source| {
                                out.push(host::Stmt::Export {
                                    name: source.to_string(),
                                    value: host::Expr::Local(local.to_string()),
                                });
                            });
                        }
                    }
                    other => panic!("cannot assign to a {} node", other.kind_name()),
                }
            }
            AstStmt::ExprStmt { node, .. } => {
                let value = self.emit_expr(frame, node)?;
                out.push(host::Stmt::Discard(value));
            }
            AstStmt::Scope { body, .. } => {
                // soft scope: locals are unique, so the frame inlines
                let sub = self.sub(stmt);
                out.extend(self.emit_frame(sub.body, body, false)?);
            }
            AstStmt::Block { name, body, .. } => {
                let sub = self.sub(stmt);
                let lowered = Rc::new(self.emit_frame(sub.body, body, false)?);
                self.blocks.insert(name.clone(), lowered);
                out.push(host::Stmt::RenderBlock {
                    name: name.clone(),
                    context: self.frames.iter_vars(frame, Some(stmt)),
                });
            }
            AstStmt::Extends { template, .. } => {
                let template = self.emit_expr(frame, template)?;
                out.push(host::Stmt::Extends {
                    template,
                    context: self.frames.iter_vars(frame, Some(stmt)),
                });
            }
            AstStmt::Include {
                template,
                with_context,
                ignore_missing,
                ..
            } => {
                let template = self.emit_expr(frame, template)?;
                let context = with_context.then(|| self.frames.iter_vars(frame, Some(stmt)));
                out.push(host::Stmt::Include {
                    template,
                    context,
                    ignore_missing: *ignore_missing,
                });
            }
            AstStmt::Import {
                template,
                target,
                with_context,
                ..
            } => {
                let name = match target {
                    Ast::Name { name, .. } => name.clone(),
                    other => panic!("cannot assign a module to a {} node", other.kind_name()),
                };
                let template = self.emit_expr(frame, template)?;
                let context = with_context.then(|| self.frames.iter_vars(frame, Some(stmt)));
                out.push(host::Stmt::Import {
                    template,
                    context,
                    local: self.frames.lookup_name(frame, &name),
                    export: export.then(|| name),
                });
            }
            AstStmt::FromImport {
                template,
                names,
                with_context,
                ..
            } => {
                let template = self.emit_expr(frame, template)?;
                let context = with_context.then(|| self.frames.iter_vars(frame, Some(stmt)));
                let mut bindings = Vec::new();
                for entry in names {
                    let bound = entry.alias.clone().unwrap_or_else(|| entry.name.clone());
                    bindings.push(ImportBinding {
                        name: entry.name.clone(),
                        local: self.frames.lookup_name(frame, &bound),
                        export: export.then(|| bound),
                    });
                }
                out.push(host::Stmt::FromImport {
                    template,
                    context,
                    names: bindings,
                });
            }
            AstStmt::FilterBlock {
                body,
                name,
                args,
                kwargs,
                dyn_args,
                dyn_kwargs,
                ..
            } => {
                let sub = self.sub(stmt);
                out.push(host::Stmt::BeginBuffer);
                out.extend(self.emit_frame(sub.body, body, false)?);
                let temp = self.frames.idents.temporary();
                out.push(host::Stmt::EndBuffer {
                    local: temp.clone(),
                });
                let args =
                    self.emit_call_args(frame, args, kwargs, dyn_args.as_ref(), dyn_kwargs.as_ref())?;
                out.push(host::Stmt::Emit(host::Expr::Filter {
                    node: Box::new(host::Expr::Local(temp)),
                    name: name.clone(),
                    args,
                }));
            }
            AstStmt::CallOut { call, body, .. } => {
                let sub = self.sub(stmt);
                let callout = self.callout_name.clone();
                let mut referenced = false;
                call.walk(&mut |node| {
                    if let Ast::Name {
                        name,
                        ctx: NameCtx::Load,
                        ..
                    } = node
                    {
                        if *name == callout {
                            referenced = true;
                        }
                    }
                });
                let local = if referenced {
                    self.frames.lookup_name(frame, &callout)
                } else {
                    self.frames.idents.temporary()
                };
                let lowered_body = Rc::new(self.emit_frame(sub.body, body, false)?);
                out.push(host::Stmt::DefineFunction {
                    local,
                    export: None,
                    name: None,
                    params: vec![],
                    defaults: vec![],
                    body: lowered_body,
                });
                let call = self.emit_expr(frame, call)?;
                out.push(host::Stmt::Emit(call));
            }
            AstStmt::Break { .. } => out.push(host::Stmt::Break),
            AstStmt::Continue { .. } => out.push(host::Stmt::Continue),
        }
        Ok(())
    }

    fn target_shape(&self, frame: FrameId, target: &Ast) -> Target<String> {
        match target {
            Ast::Name { name, .. } => {
                Target::name(self.frames.lookup_name(frame, name), name.clone())
            }
            Ast::Tuple { items, .. } => Target::Tuple(
                items
                    .iter()
                    .map(|item| self.target_shape(frame, item))
                    .collect(),
            ),
            other => panic!("cannot assign to a {} node", other.kind_name()),
        }
    }

    fn emit_call_args(
        &mut self,
        frame: FrameId,
        args: &[Ast],
        kwargs: &[Keyword],
        dyn_args: Option<&Ast>,
        dyn_kwargs: Option<&Ast>,
    ) -> Result<CallArgs> {
        let mut lowered = CallArgs::default();
        for arg in args {
            lowered.args.push(self.emit_expr(frame, arg)?);
        }
        for kw in kwargs {
            lowered
                .kwargs
                .push((kw.key.clone(), self.emit_expr(frame, &kw.value)?));
        }
        if let Some(expr) = dyn_args {
            lowered.dyn_args = Some(Box::new(self.emit_expr(frame, expr)?));
        }
        if let Some(expr) = dyn_kwargs {
            lowered.dyn_kwargs = Some(Box::new(self.emit_expr(frame, expr)?));
        }
        Ok(lowered)
    }

    fn emit_expr(&mut self, frame: FrameId, expr: &Ast) -> Result<host::Expr> {
        Ok(match expr {
            Ast::Name { name, ctx, .. } => {
                assert!(
                    *ctx == NameCtx::Load,
                    "lowered a {:?}-context name as an expression",
                    ctx
                );
                host::Expr::Local(self.frames.lookup_name(frame, name))
            }
            Ast::Const { value, .. } => host::Expr::Const(value.clone()),
            Ast::TemplateData { data, .. } => host::Expr::Const(Value::Markup(data.clone())),
            Ast::Tuple { items, .. } => {
                let mut lowered = Vec::new();
                for item in items {
                    lowered.push(self.emit_expr(frame, item)?);
                }
                host::Expr::Tuple(lowered)
            }
            Ast::List { items, .. } => {
                let mut lowered = Vec::new();
                for item in items {
                    lowered.push(self.emit_expr(frame, item)?);
                }
                host::Expr::List(lowered)
            }
            Ast::Dict { items, .. } => {
                let mut lowered = Vec::new();
                for pair in items {
                    lowered.push((
                        self.emit_expr(frame, &pair.key)?,
                        self.emit_expr(frame, &pair.value)?,
                    ));
                }
                host::Expr::Map(lowered)
            }
            Ast::CondExpr {
                test, true_, false_, ..
            } => host::Expr::CondExpr {
                test: Box::new(self.emit_expr(frame, test)?),
                true_: Box::new(self.emit_expr(frame, true_)?),
                false_: Box::new(self.emit_expr(frame, false_)?),
            },
            Ast::Filter {
                node,
                name,
                args,
                kwargs,
                dyn_args,
                dyn_kwargs,
                ..
            } => host::Expr::Filter {
                node: Box::new(self.emit_expr(frame, node)?),
                name: name.clone(),
                args: self.emit_call_args(
                    frame,
                    args,
                    kwargs,
                    dyn_args.as_deref(),
                    dyn_kwargs.as_deref(),
                )?,
            },
            Ast::Test {
                node,
                name,
                args,
                kwargs,
                dyn_args,
                dyn_kwargs,
                ..
            } => host::Expr::Test {
                node: Box::new(self.emit_expr(frame, node)?),
                name: name.clone(),
                args: self.emit_call_args(
                    frame,
                    args,
                    kwargs,
                    dyn_args.as_deref(),
                    dyn_kwargs.as_deref(),
                )?,
            },
            Ast::Call {
                node,
                args,
                kwargs,
                dyn_args,
                dyn_kwargs,
                ..
            } => host::Expr::Call {
                node: Box::new(self.emit_expr(frame, node)?),
                args: self.emit_call_args(
                    frame,
                    args,
                    kwargs,
                    dyn_args.as_deref(),
                    dyn_kwargs.as_deref(),
                )?,
            },
            Ast::Getattr { node, attr, .. } => host::Expr::Getattr {
                node: Box::new(self.emit_expr(frame, node)?),
                attr: Box::new(self.emit_expr(frame, attr)?),
            },
            Ast::Getitem { node, arg, .. } => host::Expr::Getitem {
                node: Box::new(self.emit_expr(frame, node)?),
                arg: Box::new(self.emit_expr(frame, arg)?),
            },
            Ast::Slice {
                start, stop, step, ..
            } => host::Expr::Slice {
                start: self.emit_slice_part(frame, start)?,
                stop: self.emit_slice_part(frame, stop)?,
                step: self.emit_slice_part(frame, step)?,
            },
            Ast::Concat { nodes, .. } => {
                let mut lowered = Vec::new();
                for node in nodes {
                    lowered.push(self.emit_expr(frame, node)?);
                }
                host::Expr::Concat(lowered)
            }
            Ast::Compare { expr, ops, .. } => {
                let mut chain = Vec::new();
                for operand in ops {
                    chain.push((operand.op, self.emit_expr(frame, &operand.expr)?));
                }
                host::Expr::Compare {
                    expr: Box::new(self.emit_expr(frame, expr)?),
                    ops: chain,
                }
            }
            Ast::BinOp {
                op, left, right, ..
            } => host::Expr::BinOp {
                op: *op,
                left: Box::new(self.emit_expr(frame, left)?),
                right: Box::new(self.emit_expr(frame, right)?),
            },
            Ast::And { left, right, .. } => host::Expr::And {
                left: Box::new(self.emit_expr(frame, left)?),
                right: Box::new(self.emit_expr(frame, right)?),
            },
            Ast::Or { left, right, .. } => host::Expr::Or {
                left: Box::new(self.emit_expr(frame, left)?),
                right: Box::new(self.emit_expr(frame, right)?),
            },
            Ast::UnOp { op, node, .. } => host::Expr::UnOp {
                op: *op,
                node: Box::new(self.emit_expr(frame, node)?),
            },
            Ast::MarkSafe { expr, .. } => {
                host::Expr::MarkSafe(Box::new(self.emit_expr(frame, expr)?))
            }
            Ast::MarkSafeIfAutoescape { expr, .. } => {
                host::Expr::MarkSafeIfAutoescape(Box::new(self.emit_expr(frame, expr)?))
            }
        })
    }

    fn emit_slice_part(
        &mut self,
        frame: FrameId,
        part: &Option<Box<Ast>>,
    ) -> Result<Option<Box<host::Expr>>> {
        Ok(match part {
            Some(expr) => Some(Box::new(self.emit_expr(frame, expr)?)),
            None => None,
        })
    }
}

fn for_each_leaf(target: &Target<String>, f: &mut dyn FnMut(&str, &str)) {
    match target {
        Target::Name { payload, source } => f(payload, source),
        Target::Tuple(items) => {
            for item in items {
                for_each_leaf(item, f);
            }
        }
    }
}
