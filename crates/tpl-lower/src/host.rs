//! The host program representation lowering produces.
//!
//! Statements operate on generated locals only; the source-level names
//! survive solely in `Lookup` and `Export` instructions and in unpack
//! targets (for undefined hints). `Display` renders a program as
//! indented pseudo-code, which the lowering tests match against.

use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use itertools::Itertools;
use tpl_core::nodes::{BinOpKind, CmpOp, UnOpKind};
use tpl_core::unpack::Target;
use tpl_core::value::Value;

/// One lowered template: the root statement list plus the lowered body
/// of every block it declares.
pub struct Program {
    pub root: Vec<Stmt>,
    pub blocks: BTreeMap<String, Rc<Vec<Stmt>>>,
}

/// Positional, keyword and splatted arguments of a call-shaped node.
#[derive(Debug, Clone, Default)]
pub struct CallArgs {
    pub args: Vec<Expr>,
    pub kwargs: Vec<(String, Expr)>,
    pub dyn_args: Option<Box<Expr>>,
    pub dyn_kwargs: Option<Box<Expr>>,
}

/// A name imported by a `FromImport` statement: which export to fetch,
/// the local it lands in, and the name it is re-exported under when the
/// import happens at template root.
#[derive(Debug, Clone)]
pub struct ImportBinding {
    pub name: String,
    pub local: String,
    pub export: Option<String>,
}

#[derive(Debug, Clone)]
pub enum Stmt {
    /// Copy an outer local into a fresh shadowing local on scope entry.
    Alias { to: String, from: String },
    /// Fetch a name from the render context into a local.
    Lookup { local: String, name: String },
    Assign {
        local: String,
        value: Expr,
    },
    Unpack {
        target: Target<String>,
        value: Expr,
    },
    /// Publish a value under its source name in the render's exports.
    Export {
        name: String,
        value: Expr,
    },
    /// Finalize a value and write it to the output.
    Emit(Expr),
    /// Evaluate for effect, discard the result.
    Discard(Expr),
    If {
        test: Expr,
        body: Vec<Stmt>,
        else_: Vec<Stmt>,
    },
    ForEach {
        target: Target<String>,
        /// Local receiving the per-iteration loop state.
        loop_local: String,
        /// The enclosing loop state, when parent access is enabled.
        parent: Option<Expr>,
        iter: Expr,
        body: Vec<Stmt>,
        else_: Vec<Stmt>,
    },
    Break,
    Continue,
    /// Redirect emitted output into a fresh buffer.
    BeginBuffer,
    /// Close the innermost buffer and store its contents as a string.
    EndBuffer { local: String },
    DefineFunction {
        local: String,
        /// Export name when the definition happens at template root.
        export: Option<String>,
        name: Option<String>,
        /// `(source name, local)` per parameter.
        params: Vec<(String, String)>,
        defaults: Vec<Expr>,
        body: Rc<Vec<Stmt>>,
    },
    /// Run the most derived executor of a named block.
    RenderBlock {
        name: String,
        context: Vec<(String, String)>,
    },
    Extends {
        template: Expr,
        context: Vec<(String, String)>,
    },
    Include {
        template: Expr,
        /// `None` renders the included template without context.
        context: Option<Vec<(String, String)>>,
        ignore_missing: bool,
    },
    Import {
        template: Expr,
        context: Option<Vec<(String, String)>>,
        local: String,
        export: Option<String>,
    },
    FromImport {
        template: Expr,
        context: Option<Vec<(String, String)>>,
        names: Vec<ImportBinding>,
    },
}

#[derive(Debug, Clone)]
pub enum Expr {
    Local(String),
    Const(Value),
    List(Vec<Expr>),
    Tuple(Vec<Expr>),
    Map(Vec<(Expr, Expr)>),
    CondExpr {
        test: Box<Expr>,
        true_: Box<Expr>,
        false_: Box<Expr>,
    },
    BinOp {
        op: BinOpKind,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    And {
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Or {
        left: Box<Expr>,
        right: Box<Expr>,
    },
    UnOp {
        op: UnOpKind,
        node: Box<Expr>,
    },
    Compare {
        expr: Box<Expr>,
        ops: Vec<(CmpOp, Expr)>,
    },
    Getattr {
        node: Box<Expr>,
        attr: Box<Expr>,
    },
    Getitem {
        node: Box<Expr>,
        arg: Box<Expr>,
    },
    Slice {
        start: Option<Box<Expr>>,
        stop: Option<Box<Expr>>,
        step: Option<Box<Expr>>,
    },
    Call {
        node: Box<Expr>,
        args: CallArgs,
    },
    Filter {
        node: Box<Expr>,
        name: String,
        args: CallArgs,
    },
    Test {
        node: Box<Expr>,
        name: String,
        args: CallArgs,
    },
    Concat(Vec<Expr>),
    MarkSafe(Box<Expr>),
    MarkSafeIfAutoescape(Box<Expr>),
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "root:")?;
        write_body(f, &self.root, 1)?;
        for (name, body) in &self.blocks {
            writeln!(f, "block {}:", name)?;
            write_body(f, body, 1)?;
        }
        Ok(())
    }
}

fn write_body(f: &mut fmt::Formatter<'_>, stmts: &[Stmt], depth: usize) -> fmt::Result {
    for stmt in stmts {
        stmt.write(f, depth)?;
    }
    Ok(())
}

fn indent(f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
    write!(f, "{}", "  ".repeat(depth))
}

fn target_str(target: &Target<String>) -> String {
    match target {
        Target::Name { payload, .. } => payload.clone(),
        Target::Tuple(items) => format!("({})", items.iter().map(target_str).join(", ")),
    }
}

fn context_str(pairs: &[(String, String)]) -> String {
    pairs
        .iter()
        .map(|(name, local)| format!("{}={}", name, local))
        .join(", ")
}

impl Stmt {
    fn write(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        indent(f, depth)?;
        match self {
            Stmt::Alias { to, from } => writeln!(f, "alias {} = {}", to, from),
            Stmt::Lookup { local, name } => writeln!(f, "lookup {} = context[{:?}]", local, name),
            Stmt::Assign { local, value } => writeln!(f, "{} = {}", local, value),
            Stmt::Unpack { target, value } => {
                writeln!(f, "unpack {} = {}", target_str(target), value)
            }
            Stmt::Export { name, value } => writeln!(f, "export {:?} = {}", name, value),
            Stmt::Emit(value) => writeln!(f, "emit {}", value),
            Stmt::Discard(value) => writeln!(f, "discard {}", value),
            Stmt::If { test, body, else_ } => {
                writeln!(f, "if {}:", test)?;
                write_body(f, body, depth + 1)?;
                if !else_.is_empty() {
                    indent(f, depth)?;
                    writeln!(f, "else:")?;
                    write_body(f, else_, depth + 1)?;
                }
                Ok(())
            }
            Stmt::ForEach {
                target,
                loop_local,
                iter,
                body,
                else_,
                ..
            } => {
                writeln!(
                    f,
                    "for {} [{}] in {}:",
                    target_str(target),
                    loop_local,
                    iter
                )?;
                write_body(f, body, depth + 1)?;
                if !else_.is_empty() {
                    indent(f, depth)?;
                    writeln!(f, "else:")?;
                    write_body(f, else_, depth + 1)?;
                }
                Ok(())
            }
            Stmt::Break => writeln!(f, "break"),
            Stmt::Continue => writeln!(f, "continue"),
            Stmt::BeginBuffer => writeln!(f, "begin buffer"),
            Stmt::EndBuffer { local } => writeln!(f, "end buffer -> {}", local),
            Stmt::DefineFunction {
                local,
                export,
                params,
                body,
                ..
            } => {
                write!(
                    f,
                    "def {}({})",
                    local,
                    params.iter().map(|(_, local)| local.as_str()).join(", ")
                )?;
                if let Some(name) = export {
                    write!(f, " export {:?}", name)?;
                }
                writeln!(f, ":")?;
                write_body(f, body, depth + 1)
            }
            Stmt::RenderBlock { name, context } => {
                writeln!(f, "render block {} with {{{}}}", name, context_str(context))
            }
            Stmt::Extends { template, context } => {
                writeln!(f, "extends {} with {{{}}}", template, context_str(context))
            }
            Stmt::Include {
                template,
                context,
                ignore_missing,
            } => {
                write!(f, "include {}", template)?;
                if *ignore_missing {
                    write!(f, " ignore missing")?;
                }
                match context {
                    Some(pairs) => writeln!(f, " with {{{}}}", context_str(pairs)),
                    None => writeln!(f, " without context"),
                }
            }
            Stmt::Import {
                template, local, ..
            } => writeln!(f, "import {} as {}", template, local),
            Stmt::FromImport {
                template, names, ..
            } => writeln!(
                f,
                "from {} import {}",
                template,
                names
                    .iter()
                    .map(|b| format!("{} as {}", b.name, b.local))
                    .join(", ")
            ),
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Local(local) => write!(f, "{}", local),
            Expr::Const(value) => write!(f, "{}", value.render_repr()),
            Expr::List(items) => write!(f, "[{}]", items.iter().join(", ")),
            Expr::Tuple(items) => write!(f, "({})", items.iter().join(", ")),
            Expr::Map(items) => write!(
                f,
                "{{{}}}",
                items
                    .iter()
                    .map(|(k, v)| format!("{}: {}", k, v))
                    .join(", ")
            ),
            Expr::CondExpr { test, true_, false_ } => {
                write!(f, "({} if {} else {})", true_, test, false_)
            }
            Expr::BinOp { op, left, right } => write!(f, "({} {:?} {})", left, op, right),
            Expr::And { left, right } => write!(f, "({} and {})", left, right),
            Expr::Or { left, right } => write!(f, "({} or {})", left, right),
            Expr::UnOp { op, node } => write!(f, "({:?} {})", op, node),
            Expr::Compare { expr, ops } => {
                write!(f, "({}", expr)?;
                for (op, operand) in ops {
                    write!(f, " {:?} {}", op, operand)?;
                }
                write!(f, ")")
            }
            Expr::Getattr { node, attr } => write!(f, "{}.[{}]", node, attr),
            Expr::Getitem { node, arg } => write!(f, "{}[{}]", node, arg),
            Expr::Slice { start, stop, step } => {
                if let Some(start) = start {
                    write!(f, "{}", start)?;
                }
                write!(f, ":")?;
                if let Some(stop) = stop {
                    write!(f, "{}", stop)?;
                }
                if let Some(step) = step {
                    write!(f, ":{}", step)?;
                }
                Ok(())
            }
            Expr::Call { node, args } => write!(f, "{}({})", node, args),
            Expr::Filter { node, name, args } => write!(f, "filter[{}]({}, {})", name, node, args),
            Expr::Test { node, name, args } => write!(f, "test[{}]({}, {})", name, node, args),
            Expr::Concat(items) => write!(f, "concat({})", items.iter().join(", ")),
            Expr::MarkSafe(node) => write!(f, "safe({})", node),
            Expr::MarkSafeIfAutoescape(node) => write!(f, "safe_if_autoescape({})", node),
        }
    }
}

impl fmt::Display for CallArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<String> = self.args.iter().map(|a| a.to_string()).collect();
        parts.extend(self.kwargs.iter().map(|(k, v)| format!("{}={}", k, v)));
        if let Some(d) = &self.dyn_args {
            parts.push(format!("*{}", d));
        }
        if let Some(d) = &self.dyn_kwargs {
            parts.push(format!("**{}", d));
        }
        write!(f, "{}", parts.join(", "))
    }
}
