//! The abstract template syntax tree (ATST).
//!
//! Frontends produce this tree, the identifier tracker analyzes it, and the
//! backends (interpreter, host lowering, JavaScript generator) consume it.
//! The node set is closed: backends dispatch exhaustively and adding a node
//! kind is a breaking change for every backend.

use serde::Serialize;

use crate::value::Value;

pub type Lineno = u32;

/// Access context of a [`Expr::Name`] (and of tuple targets).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NameCtx {
    Load,
    Store,
    Param,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BinOpKind {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnOpKind {
    Not,
    Neg,
    Pos,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    LtEq,
    Gt,
    GtEq,
    In,
    NotIn,
}

/// A named argument in a call-shaped node.
#[derive(Debug, Clone, Serialize)]
pub struct Keyword {
    pub key: String,
    pub value: Expr,
}

/// A key/value entry of a dict literal.
#[derive(Debug, Clone, Serialize)]
pub struct Pair {
    pub key: Expr,
    pub value: Expr,
}

/// One link of a chained comparison: `op rhs`.
#[derive(Debug, Clone, Serialize)]
pub struct Operand {
    pub op: CmpOp,
    pub expr: Expr,
}

/// A `from x import name [as alias]` entry.
#[derive(Debug, Clone, Serialize)]
pub struct ImportName {
    pub name: String,
    pub alias: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Template {
    pub body: Vec<Stmt>,
    pub lineno: Lineno,
}

impl Template {
    pub fn new(body: Vec<Stmt>) -> Template {
        Template { body, lineno: 1 }
    }

    /// All block statements anywhere in the tree, in document order.
    /// Block names are template-unique by frontend contract, so the
    /// result is usable as a registry.
    pub fn find_blocks(&self) -> Vec<(&str, &[Stmt])> {
        let mut found = Vec::new();
        fn walk<'a>(stmts: &'a [Stmt], found: &mut Vec<(&'a str, &'a [Stmt])>) {
            for stmt in stmts {
                if let Stmt::Block { name, body, .. } = stmt {
                    found.push((name.as_str(), body.as_slice()));
                }
                for body in stmt.child_bodies() {
                    walk(body, found);
                }
            }
        }
        walk(&self.body, &mut found);
        found
    }
}

#[derive(Debug, Clone, Serialize)]
pub enum Stmt {
    Output {
        nodes: Vec<Expr>,
        lineno: Lineno,
    },
    For {
        target: Expr,
        iter: Expr,
        body: Vec<Stmt>,
        else_: Vec<Stmt>,
        lineno: Lineno,
    },
    If {
        test: Expr,
        body: Vec<Stmt>,
        else_: Vec<Stmt>,
        lineno: Lineno,
    },
    Assign {
        target: Expr,
        node: Expr,
        lineno: Lineno,
    },
    ExprStmt {
        node: Expr,
        lineno: Lineno,
    },
    /// An explicit soft scope with no other semantics.
    Scope {
        body: Vec<Stmt>,
        lineno: Lineno,
    },
    /// An overridable named region (template inheritance).
    Block {
        name: String,
        body: Vec<Stmt>,
        lineno: Lineno,
    },
    Extends {
        template: Expr,
        lineno: Lineno,
    },
    Include {
        template: Expr,
        with_context: bool,
        ignore_missing: bool,
        lineno: Lineno,
    },
    Import {
        template: Expr,
        target: Expr,
        with_context: bool,
        lineno: Lineno,
    },
    FromImport {
        template: Expr,
        names: Vec<ImportName>,
        with_context: bool,
        lineno: Lineno,
    },
    /// A template-defined function (macro). `args` are param-context
    /// names; `defaults` align with the trailing params.
    Function {
        target: Expr,
        args: Vec<Expr>,
        defaults: Vec<Expr>,
        body: Vec<Stmt>,
        lineno: Lineno,
    },
    /// Applies a filter to the rendered output of its body.
    FilterBlock {
        body: Vec<Stmt>,
        name: String,
        args: Vec<Expr>,
        kwargs: Vec<Keyword>,
        dyn_args: Option<Expr>,
        dyn_kwargs: Option<Expr>,
        lineno: Lineno,
    },
    /// `{% call f(...) %}body{% endcall %}`: the body becomes a callable
    /// bound under the configured callout name while `call` is evaluated.
    CallOut {
        call: Expr,
        body: Vec<Stmt>,
        lineno: Lineno,
    },
    Continue {
        lineno: Lineno,
    },
    Break {
        lineno: Lineno,
    },
}

#[derive(Debug, Clone, Serialize)]
pub enum Expr {
    Name {
        name: String,
        ctx: NameCtx,
        lineno: Lineno,
    },
    Const {
        value: Value,
        lineno: Lineno,
    },
    /// Literal template text. Always emitted markup-safe.
    TemplateData {
        data: String,
        lineno: Lineno,
    },
    Tuple {
        items: Vec<Expr>,
        ctx: NameCtx,
        lineno: Lineno,
    },
    List {
        items: Vec<Expr>,
        lineno: Lineno,
    },
    Dict {
        items: Vec<Pair>,
        lineno: Lineno,
    },
    CondExpr {
        test: Box<Expr>,
        true_: Box<Expr>,
        false_: Box<Expr>,
        lineno: Lineno,
    },
    Filter {
        node: Box<Expr>,
        name: String,
        args: Vec<Expr>,
        kwargs: Vec<Keyword>,
        dyn_args: Option<Box<Expr>>,
        dyn_kwargs: Option<Box<Expr>>,
        lineno: Lineno,
    },
    Test {
        node: Box<Expr>,
        name: String,
        args: Vec<Expr>,
        kwargs: Vec<Keyword>,
        dyn_args: Option<Box<Expr>>,
        dyn_kwargs: Option<Box<Expr>>,
        lineno: Lineno,
    },
    Call {
        node: Box<Expr>,
        args: Vec<Expr>,
        kwargs: Vec<Keyword>,
        dyn_args: Option<Box<Expr>>,
        dyn_kwargs: Option<Box<Expr>>,
        lineno: Lineno,
    },
    Getattr {
        node: Box<Expr>,
        attr: Box<Expr>,
        lineno: Lineno,
    },
    Getitem {
        node: Box<Expr>,
        arg: Box<Expr>,
        lineno: Lineno,
    },
    /// Only valid as the argument of a [`Expr::Getitem`].
    Slice {
        start: Option<Box<Expr>>,
        stop: Option<Box<Expr>>,
        step: Option<Box<Expr>>,
        lineno: Lineno,
    },
    Concat {
        nodes: Vec<Expr>,
        lineno: Lineno,
    },
    Compare {
        expr: Box<Expr>,
        ops: Vec<Operand>,
        lineno: Lineno,
    },
    BinOp {
        op: BinOpKind,
        left: Box<Expr>,
        right: Box<Expr>,
        lineno: Lineno,
    },
    And {
        left: Box<Expr>,
        right: Box<Expr>,
        lineno: Lineno,
    },
    Or {
        left: Box<Expr>,
        right: Box<Expr>,
        lineno: Lineno,
    },
    UnOp {
        op: UnOpKind,
        node: Box<Expr>,
        lineno: Lineno,
    },
    MarkSafe {
        expr: Box<Expr>,
        lineno: Lineno,
    },
    MarkSafeIfAutoescape {
        expr: Box<Expr>,
        lineno: Lineno,
    },
}

impl Stmt {
    pub fn lineno(&self) -> Lineno {
        match self {
            Stmt::Output { lineno, .. }
            | Stmt::For { lineno, .. }
            | Stmt::If { lineno, .. }
            | Stmt::Assign { lineno, .. }
            | Stmt::ExprStmt { lineno, .. }
            | Stmt::Scope { lineno, .. }
            | Stmt::Block { lineno, .. }
            | Stmt::Extends { lineno, .. }
            | Stmt::Include { lineno, .. }
            | Stmt::Import { lineno, .. }
            | Stmt::FromImport { lineno, .. }
            | Stmt::Function { lineno, .. }
            | Stmt::FilterBlock { lineno, .. }
            | Stmt::CallOut { lineno, .. }
            | Stmt::Continue { lineno }
            | Stmt::Break { lineno } => *lineno,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Stmt::Output { .. } => "Output",
            Stmt::For { .. } => "For",
            Stmt::If { .. } => "If",
            Stmt::Assign { .. } => "Assign",
            Stmt::ExprStmt { .. } => "ExprStmt",
            Stmt::Scope { .. } => "Scope",
            Stmt::Block { .. } => "Block",
            Stmt::Extends { .. } => "Extends",
            Stmt::Include { .. } => "Include",
            Stmt::Import { .. } => "Import",
            Stmt::FromImport { .. } => "FromImport",
            Stmt::Function { .. } => "Function",
            Stmt::FilterBlock { .. } => "FilterBlock",
            Stmt::CallOut { .. } => "CallOut",
            Stmt::Continue { .. } => "Continue",
            Stmt::Break { .. } => "Break",
        }
    }

    /// Direct expression children, without descending into nested
    /// statement bodies.
    pub fn direct_exprs(&self) -> Vec<&Expr> {
        match self {
            Stmt::Output { nodes, .. } => nodes.iter().collect(),
            Stmt::For { target, iter, .. } => vec![target, iter],
            Stmt::If { test, .. } => vec![test],
            Stmt::Assign { target, node, .. } => vec![target, node],
            Stmt::ExprStmt { node, .. } => vec![node],
            Stmt::Scope { .. } | Stmt::Block { .. } => Vec::new(),
            Stmt::Extends { template, .. } => vec![template],
            Stmt::Include { template, .. } => vec![template],
            Stmt::Import {
                template, target, ..
            } => vec![template, target],
            Stmt::FromImport { template, .. } => vec![template],
            Stmt::Function {
                target,
                args,
                defaults,
                ..
            } => {
                let mut out = vec![target];
                out.extend(args.iter());
                out.extend(defaults.iter());
                out
            }
            Stmt::FilterBlock {
                args,
                kwargs,
                dyn_args,
                dyn_kwargs,
                ..
            } => {
                let mut out: Vec<&Expr> = args.iter().collect();
                out.extend(kwargs.iter().map(|kw| &kw.value));
                out.extend(dyn_args.iter());
                out.extend(dyn_kwargs.iter());
                out
            }
            Stmt::CallOut { call, .. } => vec![call],
            Stmt::Continue { .. } | Stmt::Break { .. } => Vec::new(),
        }
    }

    /// Nested statement bodies, for deep walks like [`Template::find_blocks`].
    pub fn child_bodies(&self) -> Vec<&[Stmt]> {
        match self {
            Stmt::For { body, else_, .. } | Stmt::If { body, else_, .. } => {
                vec![body.as_slice(), else_.as_slice()]
            }
            Stmt::Scope { body, .. }
            | Stmt::Block { body, .. }
            | Stmt::Function { body, .. }
            | Stmt::FilterBlock { body, .. }
            | Stmt::CallOut { body, .. } => vec![body.as_slice()],
            _ => Vec::new(),
        }
    }
}

impl Expr {
    pub fn lineno(&self) -> Lineno {
        match self {
            Expr::Name { lineno, .. }
            | Expr::Const { lineno, .. }
            | Expr::TemplateData { lineno, .. }
            | Expr::Tuple { lineno, .. }
            | Expr::List { lineno, .. }
            | Expr::Dict { lineno, .. }
            | Expr::CondExpr { lineno, .. }
            | Expr::Filter { lineno, .. }
            | Expr::Test { lineno, .. }
            | Expr::Call { lineno, .. }
            | Expr::Getattr { lineno, .. }
            | Expr::Getitem { lineno, .. }
            | Expr::Slice { lineno, .. }
            | Expr::Concat { lineno, .. }
            | Expr::Compare { lineno, .. }
            | Expr::BinOp { lineno, .. }
            | Expr::And { lineno, .. }
            | Expr::Or { lineno, .. }
            | Expr::UnOp { lineno, .. }
            | Expr::MarkSafe { lineno, .. }
            | Expr::MarkSafeIfAutoescape { lineno, .. } => *lineno,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Expr::Name { .. } => "Name",
            Expr::Const { .. } => "Const",
            Expr::TemplateData { .. } => "TemplateData",
            Expr::Tuple { .. } => "Tuple",
            Expr::List { .. } => "List",
            Expr::Dict { .. } => "Dict",
            Expr::CondExpr { .. } => "CondExpr",
            Expr::Filter { .. } => "Filter",
            Expr::Test { .. } => "Test",
            Expr::Call { .. } => "Call",
            Expr::Getattr { .. } => "Getattr",
            Expr::Getitem { .. } => "Getitem",
            Expr::Slice { .. } => "Slice",
            Expr::Concat { .. } => "Concat",
            Expr::Compare { .. } => "Compare",
            Expr::BinOp { .. } => "BinOp",
            Expr::And { .. } => "And",
            Expr::Or { .. } => "Or",
            Expr::UnOp { .. } => "UnOp",
            Expr::MarkSafe { .. } => "MarkSafe",
            Expr::MarkSafeIfAutoescape { .. } => "MarkSafeIfAutoescape",
        }
    }

    /// Whether the node can be the target of an assignment or loop.
    pub fn can_assign(&self) -> bool {
        match self {
            Expr::Name { .. } => true,
            Expr::Tuple { items, .. } => items.iter().all(Expr::can_assign),
            _ => false,
        }
    }

    /// Recursive pre-order walk over this expression subtree.
    pub fn walk<'a>(&'a self, f: &mut dyn FnMut(&'a Expr)) {
        f(self);
        match self {
            Expr::Name { .. } | Expr::Const { .. } | Expr::TemplateData { .. } => {}
            Expr::Tuple { items, .. } | Expr::List { items, .. } | Expr::Concat { nodes: items, .. } => {
                for item in items {
                    item.walk(f);
                }
            }
            Expr::Dict { items, .. } => {
                for pair in items {
                    pair.key.walk(f);
                    pair.value.walk(f);
                }
            }
            Expr::CondExpr {
                test, true_, false_, ..
            } => {
                test.walk(f);
                true_.walk(f);
                false_.walk(f);
            }
            Expr::Filter {
                node,
                args,
                kwargs,
                dyn_args,
                dyn_kwargs,
                ..
            }
            | Expr::Test {
                node,
                args,
                kwargs,
                dyn_args,
                dyn_kwargs,
                ..
            }
            | Expr::Call {
                node,
                args,
                kwargs,
                dyn_args,
                dyn_kwargs,
                ..
            } => {
                node.walk(f);
                for arg in args {
                    arg.walk(f);
                }
                for kw in kwargs {
                    kw.value.walk(f);
                }
                if let Some(d) = dyn_args {
                    d.walk(f);
                }
                if let Some(d) = dyn_kwargs {
                    d.walk(f);
                }
            }
            Expr::Getattr { node, attr, .. } | Expr::Getitem { node, arg: attr, .. } => {
                node.walk(f);
                attr.walk(f);
            }
            Expr::Slice {
                start, stop, step, ..
            } => {
                for part in [start, stop, step].into_iter().flatten() {
                    part.walk(f);
                }
            }
            Expr::Compare { expr, ops, .. } => {
                expr.walk(f);
                for op in ops {
                    op.expr.walk(f);
                }
            }
            Expr::BinOp { left, right, .. }
            | Expr::And { left, right, .. }
            | Expr::Or { left, right, .. } => {
                left.walk(f);
                right.walk(f);
            }
            Expr::UnOp { node, .. } => node.walk(f),
            Expr::MarkSafe { expr, .. } | Expr::MarkSafeIfAutoescape { expr, .. } => expr.walk(f),
        }
    }

    pub fn name(name: impl Into<String>, ctx: NameCtx) -> Expr {
        Expr::Name {
            name: name.into(),
            ctx,
            lineno: 0,
        }
    }

    pub fn constant(value: impl Into<Value>) -> Expr {
        Expr::Const {
            value: value.into(),
            lineno: 0,
        }
    }

    pub fn template_data(data: impl Into<String>) -> Expr {
        Expr::TemplateData {
            data: data.into(),
            lineno: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(name: &str, body: Vec<Stmt>) -> Stmt {
        Stmt::Block {
            name: name.to_string(),
            body,
            lineno: 1,
        }
    }

    #[test]
    fn test_can_assign() {
        assert!(Expr::name("a", NameCtx::Store).can_assign());
        assert!(Expr::Tuple {
            items: vec![Expr::name("a", NameCtx::Store), Expr::name("b", NameCtx::Store)],
            ctx: NameCtx::Store,
            lineno: 1,
        }
        .can_assign());
        assert!(!Expr::constant(42).can_assign());
        assert!(!Expr::Tuple {
            items: vec![Expr::name("a", NameCtx::Store), Expr::constant(1)],
            ctx: NameCtx::Store,
            lineno: 1,
        }
        .can_assign());
    }

    #[test]
    fn test_find_blocks_is_deep() {
        let t = Template::new(vec![
            block("top", vec![]),
            Stmt::If {
                test: Expr::constant(true),
                body: vec![block("nested", vec![])],
                else_: vec![block("alternative", vec![])],
                lineno: 1,
            },
        ]);
        let names: Vec<&str> = t.find_blocks().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["top", "nested", "alternative"]);
    }

    #[test]
    fn test_function_direct_exprs_cover_name_and_defaults() {
        let stmt = Stmt::Function {
            target: Expr::name("m", NameCtx::Store),
            args: vec![Expr::name("x", NameCtx::Param)],
            defaults: vec![Expr::constant(1)],
            body: vec![Stmt::Output {
                nodes: vec![Expr::name("x", NameCtx::Load)],
                lineno: 1,
            }],
            lineno: 1,
        };
        // The body stays out of the direct children; it belongs to the
        // function's own frame.
        assert_eq!(stmt.direct_exprs().len(), 3);
    }
}
