//! Shape checks on the generated JavaScript and rejection of the
//! constructs this backend cannot express.

use tpl_core::config::DefaultConfig;
use tpl_core::error::Error;
use tpl_core::nodes::{Expr, NameCtx, Stmt, Template};
use tpl_core::value::Value;
use tpl_javascript::generate;

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

fn for_(target: Expr, iter: Expr, body: Vec<Stmt>, else_: Vec<Stmt>) -> Stmt {
    Stmt::For {
        target,
        iter,
        body,
        else_,
        lineno: 1,
    }
}

fn source_of(template: &Template) -> String {
    match generate(template, &DefaultConfig::new()) {
        Ok(source) => source,
        Err(err) => panic!("generation failed: {}", err),
    }
}

fn assert_contains(source: &str, needle: &str) {
    assert!(
        source.contains(needle),
        "expected {:?} in generated source:\n{}",
        needle,
        source
    );
}

#[test]
fn test_module_shape() {
    let template = Template::new(vec![out(vec![data("Hello "), n("name")])]);
    let source = source_of(&template);
    assert!(source.starts_with("(function(rt) {"));
    assert_contains(&source, "function root(rtstate) {");
    assert_contains(&source, "var w = rtstate.write;");
    assert_contains(&source, "function setup(rtstate) {");
    assert_contains(&source, "rt.registerBlockMapping(rtstate.info, blocks);");
    assert_contains(&source, "var blocks = {};");
    assert_contains(&source, "return rt.makeTemplate(root, setup, blocks);");
    assert!(source.trim_end().ends_with("})"));
}

#[test]
fn test_lookup_and_output() {
    let template = Template::new(vec![out(vec![data("Hello "), n("name")])]);
    let source = source_of(&template);
    assert_contains(&source, "var l_name_0;");
    assert_contains(&source, "l_name_0 = rtstate.lookup_var(\"name\");");
    assert_contains(&source, "w(rt.markSafe(\"Hello \"));");
    assert_contains(&source, "w(l_name_0);");
}

#[test]
fn test_root_assignment_exports() {
    let template = Template::new(vec![assign("title", c("up"))]);
    let source = source_of(&template);
    assert_contains(&source, "l_title_0 = \"up\";");
    assert_contains(&source, "rtstate.export_var(\"title\", l_title_0);");
}

#[test]
fn test_blocks_become_functions() {
    let template = Template::new(vec![Stmt::Block {
        name: "header".to_string(),
        body: vec![out(vec![n("title")])],
        lineno: 1,
    }]);
    let source = source_of(&template);
    assert_contains(&source, "function block_header(rtstate) {");
    assert_contains(&source, "var blocks = {\"header\": block_header};");
    assert_contains(&source, "rt.evaluateBlock(rtstate, \"header\", {");
}

#[test]
fn test_loop_emission() {
    let template = Template::new(vec![for_(
        s("item"),
        n("seq"),
        vec![out(vec![n("item")])],
        vec![out(vec![data("empty")])],
    )]);
    let source = source_of(&template);
    assert_contains(&source, "t_0 = rt.wrapLoop(rtstate, l_seq_");
    assert_contains(&source, "for (t_1 = 0; t_1 < t_0.length; t_1++) {");
    assert_contains(&source, "[t_1][0];");
    assert_contains(&source, "[t_1][1];");
    assert_contains(&source, "if (!t_2) {");
}

#[test]
fn test_shadowing_alias_assignment() {
    let template = Template::new(vec![
        Stmt::If {
            test: c(true),
            body: vec![assign("a", c(1)), out(vec![n("a")])],
            else_: vec![],
            lineno: 1,
        },
        out(vec![n("a")]),
    ]);
    let source = source_of(&template);
    assert_contains(&source, "if (rt.truthy(true)) {");
    assert_contains(&source, "l_a_1 = l_a_0;");
}

#[test]
fn test_extends_stops_root() {
    let template = Template::new(vec![
        Stmt::Extends {
            template: c("base.html"),
            lineno: 1,
        },
        Stmt::Block {
            name: "body".to_string(),
            body: vec![out(vec![data("hi")])],
            lineno: 2,
        },
    ]);
    let source = source_of(&template);
    assert_contains(&source, "rt.extendTemplate(rtstate, \"base.html\", {");
    assert_contains(&source, "return;");
    assert_contains(&source, "function block_body(rtstate) {");
}

#[test]
fn test_function_wrapping() {
    let template = Template::new(vec![
        Stmt::Function {
            target: s("greet"),
            args: vec![Expr::name("who", NameCtx::Param)],
            defaults: vec![c("world")],
            body: vec![out(vec![data("hi "), n("who")])],
            lineno: 1,
        },
        out(vec![Expr::Call {
            node: Box::new(n("greet")),
            args: vec![],
            kwargs: vec![],
            dyn_args: None,
            dyn_kwargs: None,
            lineno: 2,
        }]),
    ]);
    let source = source_of(&template);
    assert_contains(
        &source,
        "l_greet_0 = rt.wrapFunction(rtstate, \"greet\", [\"who\"], [\"world\"], function(l_who_",
    );
    assert_contains(&source, "rtstate.export_var(\"greet\", l_greet_0);");
    assert_contains(&source, "w(rt.call(rtstate, l_greet_0, [], {}));");
}

#[test]
fn test_filters_and_operators() {
    let template = Template::new(vec![out(vec![
        Expr::Filter {
            node: Box::new(n("name")),
            name: "upper".to_string(),
            args: vec![],
            kwargs: vec![],
            dyn_args: None,
            dyn_kwargs: None,
            lineno: 1,
        },
        Expr::BinOp {
            op: tpl_core::nodes::BinOpKind::Add,
            left: Box::new(c(1)),
            right: Box::new(c(2)),
            lineno: 1,
        },
    ])]);
    let source = source_of(&template);
    assert_contains(&source, "rt.callFilter(rtstate, \"upper\", l_name_0, [], {})");
    assert_contains(&source, "rt.op(rtstate, \"add\", 1, 2)");
}

#[test]
fn test_tuple_target_is_rejected() {
    let template = Template::new(vec![for_(
        Expr::Tuple {
            items: vec![s("a"), s("b")],
            ctx: NameCtx::Store,
            lineno: 1,
        },
        n("pairs"),
        vec![out(vec![n("a")])],
        vec![],
    )]);
    let err = match generate(&template, &DefaultConfig::new()) {
        Ok(source) => panic!("tuple target generated:\n{}", source),
        Err(err) => err,
    };
    assert!(matches!(
        err,
        Error::UnsupportedNode {
            backend: "javascript",
            ..
        }
    ));
}

#[test]
fn test_splatted_arguments_are_rejected() {
    let template = Template::new(vec![out(vec![Expr::Call {
        node: Box::new(n("f")),
        args: vec![],
        kwargs: vec![],
        dyn_args: Some(Box::new(n("rest"))),
        dyn_kwargs: None,
        lineno: 1,
    }])]);
    assert!(matches!(
        generate(&template, &DefaultConfig::new()),
        Err(Error::UnsupportedNode { .. })
    ));
}

#[test]
fn test_slice_is_rejected() {
    let template = Template::new(vec![out(vec![Expr::Getitem {
        node: Box::new(n("s")),
        arg: Box::new(Expr::Slice {
            start: Some(Box::new(c(1))),
            stop: None,
            step: None,
            lineno: 1,
        }),
        lineno: 1,
    }])]);
    assert!(matches!(
        generate(&template, &DefaultConfig::new()),
        Err(Error::UnsupportedNode { .. })
    ));
}
