//! The lowered-program executor must agree with the tree-walking
//! interpreter on every construct both support.

use std::collections::BTreeMap;
use std::rc::Rc;

use pretty_assertions::assert_eq;
use tpl_core::config::{Config, DefaultConfig};
use tpl_core::nodes::{
    BinOpKind, CmpOp, Expr, ImportName, NameCtx, Operand, Stmt, Template,
};
use tpl_core::value::Value;

fn n(name: &str) -> Expr {
    Expr::name(name, NameCtx::Load)
}

fn s(name: &str) -> Expr {
    Expr::name(name, NameCtx::Store)
}

fn c(value: impl Into<Value>) -> Expr {
    Expr::constant(value)
}

fn data(text: &str) -> Expr {
    Expr::template_data(text)
}

fn out(nodes: Vec<Expr>) -> Stmt {
    Stmt::Output { nodes, lineno: 1 }
}

fn assign(name: &str, node: Expr) -> Stmt {
    Stmt::Assign {
        target: s(name),
        node,
        lineno: 1,
    }
}

fn if_(test: Expr, body: Vec<Stmt>, else_: Vec<Stmt>) -> Stmt {
    Stmt::If {
        test,
        body,
        else_,
        lineno: 1,
    }
}

fn for_(target: Expr, iter: Expr, body: Vec<Stmt>, else_: Vec<Stmt>) -> Stmt {
    Stmt::For {
        target,
        iter,
        body,
        else_,
        lineno: 1,
    }
}

fn call(node: Expr, args: Vec<Expr>) -> Expr {
    Expr::Call {
        node: Box::new(node),
        args,
        kwargs: vec![],
        dyn_args: None,
        dyn_kwargs: None,
        lineno: 1,
    }
}

fn getattr(node: Expr, attr: &str) -> Expr {
    Expr::Getattr {
        node: Box::new(node),
        attr: Box::new(c(attr)),
        lineno: 1,
    }
}

fn ints(values: &[i64]) -> Value {
    Value::List(values.iter().map(|&v| Value::Int(v)).collect())
}

fn ctx(pairs: Vec<(&str, Value)>) -> BTreeMap<String, Value> {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

/// Renders `template` through both backends and asserts identical
/// output (or, on failure, the same error variant).
fn assert_equivalent(config: Rc<dyn Config>, template: &Template, vars: Vec<(&str, Value)>) {
    let walked = tpl_interpret::render(config.clone(), template, ctx(vars.clone()));
    let lowered = tpl_lower::render(config, template, ctx(vars));
    match (walked, lowered) {
        (Ok(expected), Ok(actual)) => assert_eq!(expected, actual),
        (Err(expected), Err(actual)) => assert_eq!(
            std::mem::discriminant(&expected),
            std::mem::discriminant(&actual),
            "different error kinds: {} vs {}",
            expected,
            actual
        ),
        (walked, lowered) => {
            panic!("backends disagree: {:?} vs {:?}", walked.err(), lowered.err())
        }
    }
}

fn assert_equivalent_default(template: &Template, vars: Vec<(&str, Value)>) {
    assert_equivalent(Rc::new(DefaultConfig::new()), template, vars);
}

#[test]
fn test_if_shadowing() {
    let template = Template::new(vec![
        out(vec![n("a"), c(";")]),
        if_(
            c(true),
            vec![assign("a", c(23)), out(vec![n("a"), c(";")])],
            vec![],
        ),
        out(vec![n("a")]),
    ]);
    assert_equivalent_default(&template, vec![("a", Value::from(42))]);
}

#[test]
fn test_if_else_branches() {
    let template = Template::new(vec![if_(
        n("flag"),
        vec![out(vec![c("yes")])],
        vec![out(vec![c("no")])],
    )]);
    assert_equivalent_default(&template, vec![("flag", Value::from(true))]);
    assert_equivalent_default(&template, vec![("flag", Value::from(false))]);
    assert_equivalent_default(&template, vec![]);
}

#[test]
fn test_scope_statement() {
    let template = Template::new(vec![
        out(vec![n("a"), c(";")]),
        Stmt::Scope {
            body: vec![assign("a", c(23)), out(vec![n("a"), c(";")])],
            lineno: 1,
        },
        out(vec![n("a"), c(";")]),
    ]);
    assert_equivalent_default(&template, vec![("a", Value::from(42))]);
}

#[test]
fn test_loop_with_accessor() {
    let template = Template::new(vec![for_(
        s("item"),
        n("seq"),
        vec![out(vec![
            n("item"),
            c(":"),
            getattr(n("loop"), "index0"),
            c("/"),
            getattr(n("loop"), "revindex"),
            c(";"),
        ])],
        vec![],
    )]);
    assert_equivalent_default(&template, vec![("seq", ints(&[1, 2, 3, 4]))]);
}

#[test]
fn test_nested_loop_parent_access() {
    let inner = for_(
        s("y"),
        n("inner"),
        vec![out(vec![
            getattr(getattr(n("loop"), "parent"), "index"),
            c(":"),
            n("y"),
            c(";"),
        ])],
        vec![],
    );
    let template = Template::new(vec![for_(s("x"), n("outer"), vec![inner], vec![])]);
    assert_equivalent_default(
        &template,
        vec![("outer", ints(&[1, 2])), ("inner", ints(&[7, 9]))],
    );
}

#[test]
fn test_loop_else() {
    let template = Template::new(vec![for_(
        s("item"),
        n("seq"),
        vec![out(vec![n("item")])],
        vec![out(vec![c("!")])],
    )]);
    assert_equivalent_default(&template, vec![("seq", ints(&[]))]);
    assert_equivalent_default(&template, vec![("seq", ints(&[5]))]);
}

#[test]
fn test_break_and_continue() {
    let eq = |op: CmpOp, stop: i64, ctrl: Stmt| {
        Template::new(vec![for_(
            s("item"),
            n("seq"),
            vec![
                if_(
                    Expr::Compare {
                        expr: Box::new(n("item")),
                        ops: vec![Operand {
                            op,
                            expr: c(stop),
                        }],
                        lineno: 1,
                    },
                    vec![ctrl],
                    vec![],
                ),
                out(vec![n("item"), c(";")]),
            ],
            vec![],
        )])
    };
    assert_equivalent_default(
        &eq(CmpOp::Eq, 3, Stmt::Break { lineno: 1 }),
        vec![("seq", ints(&[1, 2, 3, 4]))],
    );
    assert_equivalent_default(
        &eq(CmpOp::Eq, 2, Stmt::Continue { lineno: 1 }),
        vec![("seq", ints(&[1, 2, 3]))],
    );
}

#[test]
fn test_loop_tuple_unpacking() {
    let template = Template::new(vec![for_(
        Expr::Tuple {
            items: vec![s("a"), s("b")],
            ctx: NameCtx::Store,
            lineno: 1,
        },
        n("seq"),
        vec![out(vec![n("a"), c("|"), n("b"), c(";")])],
        vec![],
    )]);
    let seq = Value::List(vec![ints(&[1, 2]), ints(&[3, 4])]);
    assert_equivalent_default(&template, vec![("seq", seq)]);
}

#[test]
fn test_strict_unpack_mismatch_errors_alike() {
    let template = Template::new(vec![Stmt::Assign {
        target: Expr::Tuple {
            items: vec![s("a"), s("b")],
            ctx: NameCtx::Store,
            lineno: 1,
        },
        node: n("value"),
        lineno: 1,
    }]);
    assert_equivalent_default(&template, vec![("value", ints(&[1, 2, 3]))]);
}

#[test]
fn test_lenient_unpacking() {
    let template = Template::new(vec![
        Stmt::Assign {
            target: Expr::Tuple {
                items: vec![s("a"), s("b")],
                ctx: NameCtx::Store,
                lineno: 1,
            },
            node: n("value"),
            lineno: 1,
        },
        out(vec![n("a"), c(";"), n("b")]),
    ]);
    let mut config = DefaultConfig::new();
    config.strict_tuple_unpacking = false;
    let config: Rc<dyn Config> = Rc::new(config);
    assert_equivalent(config.clone(), &template, vec![("value", ints(&[1, 2, 3]))]);
    assert_equivalent(config, &template, vec![("value", ints(&[1]))]);
}

fn uppercase_config() -> DefaultConfig {
    let mut config = DefaultConfig::new();
    config.add_filter("uppercase", |value, _, _| {
        Ok(Value::from(value.render_plain().to_uppercase()))
    });
    config
}

#[test]
fn test_filter_block() {
    let template = Template::new(vec![Stmt::FilterBlock {
        body: vec![out(vec![data("hello "), n("a")])],
        name: "uppercase".to_string(),
        args: vec![],
        kwargs: vec![],
        dyn_args: None,
        dyn_kwargs: None,
        lineno: 1,
    }]);
    assert_equivalent(
        Rc::new(uppercase_config()),
        &template,
        vec![("a", Value::from("world"))],
    );
}

#[test]
fn test_filter_expression_and_missing_filter() {
    let template = Template::new(vec![out(vec![Expr::Filter {
        node: Box::new(n("a")),
        name: "uppercase".to_string(),
        args: vec![],
        kwargs: vec![],
        dyn_args: None,
        dyn_kwargs: None,
        lineno: 1,
    }])]);
    assert_equivalent(
        Rc::new(uppercase_config()),
        &template,
        vec![("a", Value::from("hi"))],
    );
    // both backends surface the missing filter the same way
    assert_equivalent_default(&template, vec![("a", Value::from("hi"))]);
}

fn function(name: &str, params: &[&str], defaults: Vec<Expr>, body: Vec<Stmt>) -> Stmt {
    Stmt::Function {
        target: s(name),
        args: params
            .iter()
            .map(|p| Expr::name(*p, NameCtx::Param))
            .collect(),
        defaults,
        body,
        lineno: 1,
    }
}

#[test]
fn test_template_function_with_defaults() {
    let template = Template::new(vec![
        function(
            "m",
            &["x", "y"],
            vec![c(42)],
            vec![out(vec![n("x"), c("|"), n("y"), c(";")])],
        ),
        out(vec![
            call(n("m"), vec![c(1), c(2)]),
            call(n("m"), vec![c(7)]),
        ]),
    ]);
    assert_equivalent_default(&template, vec![]);
}

#[test]
fn test_function_sees_later_assignment() {
    let template = Template::new(vec![
        function("m", &[], vec![], vec![out(vec![n("a")])]),
        assign("a", c(42)),
        out(vec![call(n("m"), vec![])]),
    ]);
    assert_equivalent_default(&template, vec![]);
}

#[test]
fn test_callout() {
    let template = Template::new(vec![
        function(
            "wrap",
            &["cb"],
            vec![],
            vec![out(vec![data("["), call(n("cb"), vec![]), data("]")])],
        ),
        Stmt::CallOut {
            call: call(n("wrap"), vec![n("caller")]),
            body: vec![out(vec![data("X"), n("a")])],
            lineno: 1,
        },
    ]);
    assert_equivalent_default(&template, vec![("a", Value::from(7))]);
}

fn inheritance_config() -> DefaultConfig {
    let mut config = DefaultConfig::new();
    config.add_template(
        "layout.html",
        Template::new(vec![
            out(vec![data("before;")]),
            Stmt::Block {
                name: "body".to_string(),
                body: vec![out(vec![data("default")])],
                lineno: 1,
            },
            out(vec![data(";after:"), n("title")]),
        ]),
    );
    config
}

#[test]
fn test_inheritance_with_override() {
    let child = Template::new(vec![
        assign("title", c("T")),
        Stmt::Extends {
            template: c("layout.html"),
            lineno: 1,
        },
        Stmt::Block {
            name: "body".to_string(),
            body: vec![out(vec![data("child body")])],
            lineno: 1,
        },
    ]);
    assert_equivalent(Rc::new(inheritance_config()), &child, vec![]);
}

#[test]
fn test_inheritance_without_override() {
    let child = Template::new(vec![Stmt::Extends {
        template: c("layout.html"),
        lineno: 1,
    }]);
    assert_equivalent(
        Rc::new(inheritance_config()),
        &child,
        vec![("title", Value::from("t"))],
    );
}

#[test]
fn test_include_modes() {
    let mut config = DefaultConfig::new();
    config.add_template("inc.html", Template::new(vec![out(vec![n("a"), data("!")])]));
    let config: Rc<dyn Config> = Rc::new(config);
    for with_context in [true, false] {
        let template = Template::new(vec![
            assign("a", c(1)),
            Stmt::Include {
                template: c("inc.html"),
                with_context,
                ignore_missing: false,
                lineno: 1,
            },
        ]);
        assert_equivalent(config.clone(), &template, vec![]);
    }
}

#[test]
fn test_include_missing() {
    for ignore_missing in [true, false] {
        let template = Template::new(vec![Stmt::Include {
            template: c("missing.html"),
            with_context: true,
            ignore_missing,
            lineno: 1,
        }]);
        assert_equivalent_default(&template, vec![]);
    }
}

#[test]
fn test_include_template_choice() {
    let mut config = DefaultConfig::new();
    config.add_template("b.html", Template::new(vec![out(vec![data("B")])]));
    let template = Template::new(vec![Stmt::Include {
        template: c(Value::List(vec![
            Value::from("a.html"),
            Value::from("b.html"),
        ])),
        with_context: true,
        ignore_missing: false,
        lineno: 1,
    }]);
    assert_equivalent(Rc::new(config), &template, vec![]);
}

#[test]
fn test_import_and_from_import() {
    let mut config = DefaultConfig::new();
    config.add_template(
        "mod.html",
        Template::new(vec![assign("foo", c(42)), assign("bar", c(23))]),
    );
    let config: Rc<dyn Config> = Rc::new(config);
    let import = Template::new(vec![
        Stmt::Import {
            template: c("mod.html"),
            target: s("helpers"),
            with_context: false,
            lineno: 1,
        },
        out(vec![getattr(n("helpers"), "foo")]),
    ]);
    assert_equivalent(config.clone(), &import, vec![]);
    let from_import = Template::new(vec![
        Stmt::FromImport {
            template: c("mod.html"),
            names: vec![
                ImportName {
                    name: "foo".to_string(),
                    alias: None,
                },
                ImportName {
                    name: "bar".to_string(),
                    alias: Some("b".to_string()),
                },
            ],
            with_context: false,
            lineno: 1,
        },
        out(vec![n("foo"), c("|"), n("b")]),
    ]);
    assert_equivalent(config, &from_import, vec![]);
}

#[test]
fn test_autoescape_and_marksafe() {
    let mut config = DefaultConfig::new();
    config.autoescape = true;
    let template = Template::new(vec![out(vec![
        n("a"),
        data("<i>"),
        Expr::MarkSafe {
            expr: Box::new(c("<b>")),
            lineno: 1,
        },
        Expr::MarkSafeIfAutoescape {
            expr: Box::new(c("<u>")),
            lineno: 1,
        },
    ])]);
    assert_equivalent(Rc::new(config), &template, vec![("a", Value::from("<x>"))]);
}

#[test]
fn test_expression_grabbag() {
    let binop = |op: BinOpKind, left: Expr, right: Expr| Expr::BinOp {
        op,
        left: Box::new(left),
        right: Box::new(right),
        lineno: 1,
    };
    let template = Template::new(vec![out(vec![
        binop(BinOpKind::Div, c(42), c(2)),
        c(";"),
        binop(BinOpKind::Mul, c("ab"), c(3)),
        c(";"),
        Expr::Compare {
            expr: Box::new(c(1)),
            ops: vec![
                Operand {
                    op: CmpOp::Lt,
                    expr: c(2),
                },
                Operand {
                    op: CmpOp::Lt,
                    expr: c(3),
                },
            ],
            lineno: 1,
        },
        c(";"),
        Expr::CondExpr {
            test: Box::new(n("missing")),
            true_: Box::new(c("t")),
            false_: Box::new(c("f")),
            lineno: 1,
        },
        c(";"),
        Expr::Concat {
            nodes: vec![c("x"), c(1), n("a")],
            lineno: 1,
        },
        c(";"),
        Expr::Getitem {
            node: Box::new(c("Hello World")),
            arg: Box::new(Expr::Slice {
                start: None,
                stop: Some(Box::new(c(5))),
                step: None,
                lineno: 1,
            }),
            lineno: 1,
        },
        c(";"),
        Expr::Or {
            left: Box::new(c(0)),
            right: Box::new(c("fallback")),
            lineno: 1,
        },
    ])]);
    assert_equivalent_default(&template, vec![("a", Value::from("z"))]);
}

#[test]
fn test_inner_read_before_outer_store() {
    // the conditional body reads `a` before the document-level store
    // binds it; both backends must fall through to the context value
    let template = Template::new(vec![
        if_(c(true), vec![out(vec![n("a")])], vec![]),
        assign("a", c(1)),
        out(vec![c(";"), n("a")]),
    ]);
    assert_equivalent_default(&template, vec![("a", Value::from(5))]);
}
