//! Renders a lowered program as JavaScript source.
//!
//! The emitted module has the shape
//!
//! ```text
//! (function(rt) {
//!   function root(rtstate) { ... }
//!   function setup(rtstate) { ... }
//!   function block_NAME(rtstate) { ... }
//!   var blocks = {"NAME": block_NAME};
//!   return rt.makeTemplate(root, setup, blocks);
//! })
//! ```
//!
//! Every template function takes an `rtstate` and writes through
//! `w = rtstate.write`. Value semantics live entirely in the `rt`
//! runtime object: operators go through `rt.op`, truth tests through
//! `rt.truthy`, loops through `rt.wrapLoop`, so the generated code
//! never has to second-guess JavaScript coercion rules.
//!
//! Locals are declared in a single `var` line per function. The body
//! is buffered first and the declaration line is written once the set
//! of locals is known.

use std::collections::BTreeSet;

use itertools::Itertools;
use tpl_core::config::Config;
use tpl_core::error::{Error, Result};
use tpl_core::nodes::{BinOpKind, CmpOp, Template, UnOpKind};
use tpl_core::unpack::Target;
use tpl_core::value::Value;
use tpl_lower::host::{CallArgs, Expr, Program, Stmt};
use tpl_lower::{lower, LowerOptions};

use crate::writer::JsWriter;

/// Lower `template` and generate JavaScript for it.
pub fn generate(template: &Template, config: &dyn Config) -> Result<String> {
    let program = lower(template, &LowerOptions::from_config(config))?;
    generate_program(&program)
}

/// Generate JavaScript for an already lowered program.
pub fn generate_program(program: &Program) -> Result<String> {
    tracing::debug!(blocks = program.blocks.len(), "generating javascript");
    let mut generator = Generator {
        writer: JsWriter::new(),
        declared: Vec::new(),
        temporaries: 0,
    };
    generator.emit_program(program)?;
    Ok(generator.writer.finish())
}

fn unsupported(node: &'static str) -> Error {
    Error::UnsupportedNode {
        backend: "javascript",
        node,
    }
}

fn quoted(text: &str) -> String {
    serde_json::Value::String(text.to_string()).to_string()
}

fn binop_name(op: BinOpKind) -> &'static str {
    match op {
        BinOpKind::Add => "add",
        BinOpKind::Sub => "sub",
        BinOpKind::Mul => "mul",
        BinOpKind::Div => "div",
        BinOpKind::FloorDiv => "floordiv",
        BinOpKind::Mod => "mod",
        BinOpKind::Pow => "pow",
    }
}

fn unop_name(op: UnOpKind) -> &'static str {
    match op {
        UnOpKind::Not => "not",
        UnOpKind::Neg => "neg",
        UnOpKind::Pos => "pos",
    }
}

fn cmp_name(op: CmpOp) -> &'static str {
    match op {
        CmpOp::Eq => "eq",
        CmpOp::Ne => "ne",
        CmpOp::Lt => "lt",
        CmpOp::LtEq => "lteq",
        CmpOp::Gt => "gt",
        CmpOp::GtEq => "gteq",
        CmpOp::In => "in",
        CmpOp::NotIn => "notin",
    }
}

struct Generator {
    writer: JsWriter,
    /// One set of locals per template function being emitted; the
    /// innermost set becomes that function's `var` line.
    declared: Vec<BTreeSet<String>>,
    temporaries: usize,
}

impl Generator {
    fn emit_program(&mut self, program: &Program) -> Result<()> {
        self.writer.write("(function(rt) {");
        self.writer.indent();

        self.emit_template_func("root", &program.root)?;

        self.writer.write_line("function setup(rtstate) {");
        self.writer.indent();
        self.writer
            .write_line("rt.registerBlockMapping(rtstate.info, blocks);");
        self.writer.outdent();
        self.writer.write_line("}");

        for (name, body) in &program.blocks {
            self.emit_template_func(&format!("block_{}", name), body)?;
        }

        let mapping = program
            .blocks
            .keys()
            .map(|name| format!("{}: block_{}", quoted(name), name))
            .join(", ");
        self.writer.write_line(&format!("var blocks = {{{}}};", mapping));
        self.writer
            .write_line("return rt.makeTemplate(root, setup, blocks);");

        self.writer.outdent();
        self.writer.write_line("})");
        Ok(())
    }

    /// Emit one `function NAME(rtstate) { ... }`. The body is buffered
    /// so the `var` line can be written above it afterwards.
    fn emit_template_func(&mut self, name: &str, body: &[Stmt]) -> Result<()> {
        self.writer
            .write_line(&format!("function {}(rtstate) {{", name));
        self.writer.indent();
        self.writer.write_line("var w = rtstate.write;");
        self.emit_scoped_body(body)?;
        self.writer.outdent();
        self.writer.write_line("}");
        Ok(())
    }

    fn emit_scoped_body(&mut self, body: &[Stmt]) -> Result<()> {
        self.declared.push(BTreeSet::new());
        self.writer.start_buffering();
        let outcome: Result<()> = body.iter().try_for_each(|stmt| self.emit_stmt(stmt));
        let buffered = self.writer.end_buffering();
        let declared = match self.declared.pop() {
            Some(set) => set,
            None => unreachable!("scope stack underflow"),
        };
        outcome?;
        if !declared.is_empty() {
            self.writer
                .write_line(&format!("var {};", declared.iter().join(", ")));
        }
        self.writer.write_buffered(&buffered);
        Ok(())
    }

    fn declare(&mut self, local: &str) {
        if let Some(scope) = self.declared.last_mut() {
            scope.insert(local.to_string());
        }
    }

    /// Generator-private temporary; the `t_` form keeps these disjoint
    /// from the `t<n>` temporaries a lowered program may already carry.
    fn temporary(&mut self) -> String {
        let ident = format!("t_{}", self.temporaries);
        self.temporaries += 1;
        self.declare(&ident);
        ident
    }

    fn emit_stmt(&mut self, stmt: &Stmt) -> Result<()> {
        match stmt {
            Stmt::Alias { to, from } => {
                self.declare(to);
                self.writer.write_line(&format!("{} = {};", to, from));
            }
            Stmt::Lookup { local, name } => {
                self.declare(local);
                self.writer.write_line(&format!(
                    "{} = rtstate.lookup_var({});",
                    local,
                    quoted(name)
                ));
            }
            Stmt::Assign { local, value } => {
                self.declare(local);
                let value = self.expr_source(value)?;
                self.writer.write_line(&format!("{} = {};", local, value));
            }
            Stmt::Unpack { .. } => return Err(unsupported("tuple unpacking")),
            Stmt::Export { name, value } => {
                let value = self.expr_source(value)?;
                self.writer.write_line(&format!(
                    "rtstate.export_var({}, {});",
                    quoted(name),
                    value
                ));
            }
            Stmt::Emit(value) => {
                let value = self.expr_source(value)?;
                self.writer.write_line(&format!("w({});", value));
            }
            Stmt::Discard(value) => {
                let value = self.expr_source(value)?;
                self.writer.write_line(&format!("{};", value));
            }
            Stmt::If { test, body, else_ } => {
                let test = self.expr_source(test)?;
                self.writer
                    .write_line(&format!("if (rt.truthy({})) {{", test));
                self.writer.indent();
                body.iter().try_for_each(|stmt| self.emit_stmt(stmt))?;
                self.writer.outdent();
                if else_.is_empty() {
                    self.writer.write_line("}");
                } else {
                    self.writer.write_line("} else {");
                    self.writer.indent();
                    else_.iter().try_for_each(|stmt| self.emit_stmt(stmt))?;
                    self.writer.outdent();
                    self.writer.write_line("}");
                }
            }
            Stmt::ForEach {
                target,
                loop_local,
                parent,
                iter,
                body,
                else_,
            } => self.emit_for_each(target, loop_local, parent, iter, body, else_)?,
            Stmt::Break => self.writer.write_line("break;"),
            Stmt::Continue => self.writer.write_line("continue;"),
            Stmt::BeginBuffer => self.writer.write_line("rtstate.beginBuffer();"),
            Stmt::EndBuffer { local } => {
                self.declare(local);
                self.writer
                    .write_line(&format!("{} = rtstate.endBuffer();", local));
            }
            Stmt::DefineFunction {
                local,
                export,
                name,
                params,
                defaults,
                body,
            } => {
                self.declare(local);
                let js_name = match name {
                    Some(name) => quoted(name),
                    None => "null".to_string(),
                };
                let sources = params
                    .iter()
                    .map(|(source, _)| quoted(source))
                    .join(", ");
                let defaults = defaults
                    .iter()
                    .map(|d| self.expr_source(d))
                    .collect::<Result<Vec<_>>>()?
                    .join(", ");
                let locals = params.iter().map(|(_, local)| local.as_str()).join(", ");
                self.writer.write_line(&format!(
                    "{} = rt.wrapFunction(rtstate, {}, [{}], [{}], function({}) {{",
                    local, js_name, sources, defaults, locals
                ));
                self.writer.indent();
                self.emit_scoped_body(body)?;
                self.writer.outdent();
                self.writer.write_line("});");
                if let Some(export) = export {
                    self.writer.write_line(&format!(
                        "rtstate.export_var({}, {});",
                        quoted(export),
                        local
                    ));
                }
            }
            Stmt::RenderBlock { name, context } => {
                self.writer.write_line(&format!(
                    "rt.evaluateBlock(rtstate, {}, {});",
                    quoted(name),
                    context_object(context)
                ));
            }
            Stmt::Extends { template, context } => {
                let template = self.expr_source(template)?;
                self.writer.write_line(&format!(
                    "rt.extendTemplate(rtstate, {}, {});",
                    template,
                    context_object(context)
                ));
                // the rest of root belongs to the parent template
                self.writer.write_line("return;");
            }
            Stmt::Include {
                template,
                context,
                ignore_missing,
            } => {
                let template = self.expr_source(template)?;
                self.writer.write_line(&format!(
                    "rt.includeTemplate(rtstate, {}, {}, {});",
                    template,
                    optional_context(context),
                    ignore_missing
                ));
            }
            Stmt::Import {
                template,
                context,
                local,
                export,
            } => {
                self.declare(local);
                let template = self.expr_source(template)?;
                self.writer.write_line(&format!(
                    "{} = rt.importTemplate(rtstate, {}, {});",
                    local,
                    template,
                    optional_context(context)
                ));
                if let Some(export) = export {
                    self.writer.write_line(&format!(
                        "rtstate.export_var({}, {});",
                        quoted(export),
                        local
                    ));
                }
            }
            Stmt::FromImport {
                template,
                context,
                names,
            } => {
                let module = self.temporary();
                let template = self.expr_source(template)?;
                self.writer.write_line(&format!(
                    "{} = rt.importTemplate(rtstate, {}, {});",
                    module,
                    template,
                    optional_context(context)
                ));
                for binding in names {
                    self.declare(&binding.local);
                    self.writer.write_line(&format!(
                        "{} = rt.resolveImport(rtstate, {}, {});",
                        binding.local,
                        module,
                        quoted(&binding.name)
                    ));
                    if let Some(export) = &binding.export {
                        self.writer.write_line(&format!(
                            "rtstate.export_var({}, {});",
                            quoted(export),
                            binding.local
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    fn emit_for_each(
        &mut self,
        target: &Target<String>,
        loop_local: &str,
        parent: &Option<Expr>,
        iter: &Expr,
        body: &[Stmt],
        else_: &[Stmt],
    ) -> Result<()> {
        let item = match target {
            Target::Name { payload, .. } => payload.clone(),
            Target::Tuple(_) => return Err(unsupported("tuple loop target")),
        };
        self.declare(&item);
        self.declare(loop_local);
        let parent = match parent {
            Some(parent) => self.expr_source(parent)?,
            None => "null".to_string(),
        };
        let iter = self.expr_source(iter)?;
        let pairs = self.temporary();
        let index = self.temporary();
        let iterated = if else_.is_empty() {
            None
        } else {
            Some(self.temporary())
        };

        self.writer.write_line(&format!(
            "{} = rt.wrapLoop(rtstate, {}, {});",
            pairs, iter, parent
        ));
        if let Some(iterated) = &iterated {
            self.writer.write_line(&format!("{} = false;", iterated));
        }
        self.writer.write_line(&format!(
            "for ({i} = 0; {i} < {p}.length; {i}++) {{",
            i = index,
            p = pairs
        ));
        self.writer.indent();
        if let Some(iterated) = &iterated {
            self.writer.write_line(&format!("{} = true;", iterated));
        }
        self.writer
            .write_line(&format!("{} = {}[{}][0];", item, pairs, index));
        self.writer
            .write_line(&format!("{} = {}[{}][1];", loop_local, pairs, index));
        body.iter().try_for_each(|stmt| self.emit_stmt(stmt))?;
        self.writer.outdent();
        self.writer.write_line("}");
        if let Some(iterated) = &iterated {
            self.writer
                .write_line(&format!("if (!{}) {{", iterated));
            self.writer.indent();
            else_.iter().try_for_each(|stmt| self.emit_stmt(stmt))?;
            self.writer.outdent();
            self.writer.write_line("}");
        }
        Ok(())
    }

    fn expr_source(&mut self, expr: &Expr) -> Result<String> {
        Ok(match expr {
            Expr::Local(local) => local.clone(),
            Expr::Const(value) => const_source(value)?,
            Expr::List(items) => format!("[{}]", self.expr_list(items)?),
            Expr::Tuple(_) => return Err(unsupported("tuple literal")),
            Expr::Map(items) => {
                let pairs = items
                    .iter()
                    .map(|(key, value)| {
                        Ok(format!(
                            "[{}, {}]",
                            self.expr_source(key)?,
                            self.expr_source(value)?
                        ))
                    })
                    .collect::<Result<Vec<_>>>()?
                    .join(", ");
                format!("rt.makeMap([{}])", pairs)
            }
            Expr::CondExpr { test, true_, false_ } => format!(
                "(rt.truthy({}) ? {} : {})",
                self.expr_source(test)?,
                self.expr_source(true_)?,
                self.expr_source(false_)?
            ),
            Expr::BinOp { op, left, right } => format!(
                "rt.op(rtstate, {}, {}, {})",
                quoted(binop_name(*op)),
                self.expr_source(left)?,
                self.expr_source(right)?
            ),
            Expr::And { left, right } => format!(
                "rt.and(function() {{ return {}; }}, function() {{ return {}; }})",
                self.expr_source(left)?,
                self.expr_source(right)?
            ),
            Expr::Or { left, right } => format!(
                "rt.or(function() {{ return {}; }}, function() {{ return {}; }})",
                self.expr_source(left)?,
                self.expr_source(right)?
            ),
            Expr::UnOp { op, node } => format!(
                "rt.unop(rtstate, {}, {})",
                quoted(unop_name(*op)),
                self.expr_source(node)?
            ),
            Expr::Compare { expr, ops } => {
                let chain = ops
                    .iter()
                    .map(|(op, operand)| {
                        Ok(format!(
                            "[{}, function() {{ return {}; }}]",
                            quoted(cmp_name(*op)),
                            self.expr_source(operand)?
                        ))
                    })
                    .collect::<Result<Vec<_>>>()?
                    .join(", ");
                format!(
                    "rt.compareChain(rtstate, {}, [{}])",
                    self.expr_source(expr)?,
                    chain
                )
            }
            Expr::Getattr { node, attr } => format!(
                "rt.getAttr(rtstate, {}, {})",
                self.expr_source(node)?,
                self.expr_source(attr)?
            ),
            Expr::Getitem { node, arg } => {
                if matches!(**arg, Expr::Slice { .. }) {
                    return Err(unsupported("slice"));
                }
                format!(
                    "rt.getItem(rtstate, {}, {})",
                    self.expr_source(node)?,
                    self.expr_source(arg)?
                )
            }
            Expr::Slice { .. } => return Err(unsupported("slice")),
            Expr::Call { node, args } => format!(
                "rt.call(rtstate, {}, {})",
                self.expr_source(node)?,
                self.call_args_source(args)?
            ),
            Expr::Filter { node, name, args } => format!(
                "rt.callFilter(rtstate, {}, {}, {})",
                quoted(name),
                self.expr_source(node)?,
                self.call_args_source(args)?
            ),
            Expr::Test { node, name, args } => format!(
                "rt.callTest(rtstate, {}, {}, {})",
                quoted(name),
                self.expr_source(node)?,
                self.call_args_source(args)?
            ),
            Expr::Concat(items) => format!("rt.concat(rtstate, [{}])", self.expr_list(items)?),
            Expr::MarkSafe(node) => format!("rt.markSafe({})", self.expr_source(node)?),
            Expr::MarkSafeIfAutoescape(node) => format!(
                "rt.markSafeIfAutoescape(rtstate, {})",
                self.expr_source(node)?
            ),
        })
    }

    fn expr_list(&mut self, items: &[Expr]) -> Result<String> {
        Ok(items
            .iter()
            .map(|item| self.expr_source(item))
            .collect::<Result<Vec<_>>>()?
            .join(", "))
    }

    /// Positional args as an array, keyword args as an object.
    fn call_args_source(&mut self, args: &CallArgs) -> Result<String> {
        if args.dyn_args.is_some() || args.dyn_kwargs.is_some() {
            return Err(unsupported("splatted call arguments"));
        }
        let positional = self.expr_list(&args.args)?;
        let keyword = args
            .kwargs
            .iter()
            .map(|(name, value)| Ok(format!("{}: {}", quoted(name), self.expr_source(value)?)))
            .collect::<Result<Vec<_>>>()?
            .join(", ");
        Ok(format!("[{}], {{{}}}", positional, keyword))
    }
}

fn const_source(value: &Value) -> Result<String> {
    let json = value.to_json()?.to_string();
    Ok(match value {
        Value::Markup(_) => format!("rt.markSafe({})", json),
        _ => json,
    })
}

fn context_object(pairs: &[(String, String)]) -> String {
    let body = pairs
        .iter()
        .map(|(name, local)| format!("{}: {}", quoted(name), local))
        .join(", ");
    format!("{{{}}}", body)
}

fn optional_context(context: &Option<Vec<(String, String)>>) -> String {
    match context {
        Some(pairs) => context_object(pairs),
        None => "null".to_string(),
    }
}
