//! Identifier tracking.
//!
//! One pass per frame, run before any code is generated for it. For
//! every name the frame's own statements touch, the tracker decides one
//! of four outcomes:
//!
//! * already bound here: reuse the binding,
//! * bound in a visible outer frame and read: reference it and note the
//!   name as inherited,
//! * bound in a visible outer frame and written: mint a fresh
//!   shadowing identifier and record an entry alias so the outer value
//!   is still readable before the first write,
//! * bound nowhere: mint an identifier; a read additionally demands a
//!   context lookup in the frame's prologue.
//!
//! Traversal deliberately stops at scope seams: a `for` contributes only
//! its iterable here (target and body belong to the loop frame), an `if`
//! only its condition, a function its name and default expressions,
//! filter blocks and callouts their arguments, and block statements
//! nothing at all.

use crate::fstate::{FrameArena, FrameId};
use crate::nodes::{Expr, NameCtx, Stmt};

/// Frontend-independent knobs the tracker needs from the config.
#[derive(Debug, Clone)]
pub struct TrackerOptions {
    pub forloop_accessor: String,
    pub forloop_parent_access: bool,
}

impl Default for TrackerOptions {
    fn default() -> TrackerOptions {
        TrackerOptions {
            forloop_accessor: "loop".to_string(),
            forloop_parent_access: true,
        }
    }
}

pub(crate) fn track<'ast>(arena: &mut FrameArena<'ast>, frame: FrameId, stmts: &'ast [Stmt]) {
    for stmt in stmts {
        arena.frame_mut(frame).nodes.push(stmt);
        visit_stmt(arena, frame, stmt);
    }
}

fn visit_stmt<'ast>(arena: &mut FrameArena<'ast>, frame: FrameId, stmt: &'ast Stmt) {
    match stmt {
        Stmt::Output { nodes, .. } => {
            for node in nodes {
                visit_expr(arena, frame, node);
            }
        }
        Stmt::For { iter, .. } => {
            visit_expr(arena, frame, iter);
            // the body may reach this frame's loop state through
            // `<accessor>.parent`; make the accessor resolvable here
            if arena.options.forloop_parent_access {
                let accessor = arena.options.forloop_accessor.clone();
                track_name(arena, frame, &accessor, NameCtx::Load, None);
            }
        }
        Stmt::If { test, .. } => visit_expr(arena, frame, test),
        Stmt::Assign { target, node, .. } => {
            visit_expr(arena, frame, target);
            visit_expr(arena, frame, node);
        }
        Stmt::ExprStmt { node, .. } => visit_expr(arena, frame, node),
        Stmt::Scope { .. } | Stmt::Block { .. } | Stmt::Continue { .. } | Stmt::Break { .. } => {}
        Stmt::Extends { template, .. } | Stmt::Include { template, .. } => {
            visit_expr(arena, frame, template)
        }
        Stmt::Import {
            template, target, ..
        } => {
            visit_expr(arena, frame, template);
            visit_expr(arena, frame, target);
        }
        Stmt::FromImport {
            template, names, ..
        } => {
            visit_expr(arena, frame, template);
            for entry in names {
                let bound = entry.alias.as_deref().unwrap_or(&entry.name);
                track_name(arena, frame, bound, NameCtx::Store, None);
            }
        }
        Stmt::Function {
            target, defaults, ..
        } => {
            // params and body belong to the function's own frame;
            // defaults are evaluated at definition time in this one
            visit_expr(arena, frame, target);
            for default in defaults {
                visit_expr(arena, frame, default);
            }
        }
        Stmt::FilterBlock {
            args,
            kwargs,
            dyn_args,
            dyn_kwargs,
            ..
        } => {
            for arg in args {
                visit_expr(arena, frame, arg);
            }
            for kw in kwargs {
                visit_expr(arena, frame, &kw.value);
            }
            if let Some(d) = dyn_args {
                visit_expr(arena, frame, d);
            }
            if let Some(d) = dyn_kwargs {
                visit_expr(arena, frame, d);
            }
        }
        Stmt::CallOut { call, .. } => visit_expr(arena, frame, call),
    }
}

fn visit_expr<'ast>(arena: &mut FrameArena<'ast>, frame: FrameId, expr: &'ast Expr) {
    expr.walk(&mut |node| {
        if let Expr::Name { name, ctx, .. } = node {
            track_name(arena, frame, name, *ctx, Some(node));
        }
    });
}

fn track_name<'ast>(
    arena: &mut FrameArena<'ast>,
    frame: FrameId,
    name: &str,
    ctx: NameCtx,
    node: Option<&'ast Expr>,
) {
    let found = arena.find_binding(frame, name);
    let ident = match ctx {
        NameCtx::Load => match found {
            Some((owner, ident)) => {
                if owner != frame {
                    arena
                        .frame_mut(frame)
                        .from_outer_scope
                        .insert(name.to_string());
                }
                ident
            }
            None => {
                let ident = arena.idents.encode(name);
                let state = arena.frame_mut(frame);
                state
                    .local_identifiers
                    .insert(name.to_string(), ident.clone());
                state
                    .requires_lookup
                    .insert(ident.clone(), name.to_string());
                state.unassigned_until.entry(name.to_string()).or_insert(None);
                ident
            }
        },
        NameCtx::Store | NameCtx::Param => {
            let ident = match found {
                Some((owner, outer_ident)) if owner != frame => {
                    let fresh = arena.idents.override_ident(name);
                    let state = arena.frame_mut(frame);
                    state.from_outer_scope.insert(name.to_string());
                    state.required_aliases.insert(fresh.clone(), outer_ident);
                    state
                        .local_identifiers
                        .insert(name.to_string(), fresh.clone());
                    fresh
                }
                Some((_, ident)) => ident,
                None => {
                    let ident = arena.idents.encode(name);
                    arena
                        .frame_mut(frame)
                        .local_identifiers
                        .insert(name.to_string(), ident.clone());
                    ident
                }
            };
            let assigned_at = match ctx {
                NameCtx::Param => None,
                _ => node,
            };
            arena
                .frame_mut(frame)
                .unassigned_until
                .entry(name.to_string())
                .or_insert(assigned_at);
            ident
        }
    };
    arena
        .frame_mut(frame)
        .referenced_identifiers
        .insert(name.to_string(), ident);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fstate::{FrameArena, ScopeKind};
    use crate::nodes::ImportName;
    use pretty_assertions::assert_eq;

    fn output(name: &str) -> Stmt {
        Stmt::Output {
            nodes: vec![Expr::name(name, NameCtx::Load)],
            lineno: 1,
        }
    }

    fn assign(name: &str, value: i64) -> Stmt {
        Stmt::Assign {
            target: Expr::name(name, NameCtx::Store),
            node: Expr::constant(value),
            lineno: 1,
        }
    }

    #[test]
    fn test_store_over_outer_binding_mints_an_alias() {
        // a; if 1: (a = 23; a); a  -- the classic shadowing shape
        let root_body = vec![
            output("a"),
            Stmt::If {
                test: Expr::constant(1),
                body: vec![assign("a", 23), output("a")],
                else_: vec![],
                lineno: 1,
            },
            output("a"),
        ];
        let inner_body = match &root_body[1] {
            Stmt::If { body, .. } => body.as_slice(),
            _ => unreachable!(),
        };
        let mut arena = FrameArena::new(TrackerOptions::default(), false);
        let root = arena.root_frame();
        arena.analyze(root, &root_body);
        let child = arena.derive(root, ScopeKind::Soft);
        arena.analyze(child, inner_body);

        let root_state = arena.frame(root);
        assert_eq!(
            root_state.requires_lookup.get("l_a_0").map(String::as_str),
            Some("a")
        );
        let child_state = arena.frame(child);
        assert_eq!(
            child_state.required_aliases.get("l_a_1").map(String::as_str),
            Some("l_a_0")
        );
        assert!(child_state.from_outer_scope.contains("a"));
        assert_eq!(
            child_state
                .referenced_identifiers
                .get("a")
                .map(String::as_str),
            Some("l_a_1")
        );
        // the write stays invisible to the outer frame
        assert_eq!(
            root_state
                .referenced_identifiers
                .get("a")
                .map(String::as_str),
            Some("l_a_0")
        );
    }

    #[test]
    fn test_param_over_an_outer_binding_is_aliased() {
        let root_body = vec![assign("x", 1)];
        let mut arena = FrameArena::new(TrackerOptions::default(), false);
        let root = arena.root_frame();
        arena.analyze(root, &root_body);
        let child = arena.derive(root, ScopeKind::Soft);
        track_name(&mut arena, child, "x", NameCtx::Param, None);
        let child_state = arena.frame(child);
        assert!(child_state.from_outer_scope.contains("x"));
        assert_eq!(
            child_state.required_aliases.values().next().map(String::as_str),
            Some("l_x_0")
        );
        // params still count as assigned from frame entry
        assert!(matches!(child_state.unassigned_until.get("x"), Some(None)));
    }

    #[test]
    fn test_read_from_outer_does_not_alias() {
        let root_body = vec![assign("a", 1)];
        let inner_body = vec![output("a")];
        let mut arena = FrameArena::new(TrackerOptions::default(), false);
        let root = arena.root_frame();
        arena.analyze(root, &root_body);
        let child = arena.derive(root, ScopeKind::Soft);
        arena.analyze(child, &inner_body);
        let child_state = arena.frame(child);
        assert!(child_state.from_outer_scope.contains("a"));
        assert!(child_state.required_aliases.is_empty());
        assert!(child_state.local_identifiers.is_empty());
        assert_eq!(arena.lookup_name(child, "a"), arena.lookup_name(root, "a"));
    }

    #[test]
    fn test_plain_store_stays_local_without_lookup() {
        let body = vec![assign("a", 1), output("a")];
        let mut arena = FrameArena::new(TrackerOptions::default(), false);
        let root = arena.root_frame();
        arena.analyze(root, &body);
        let state = arena.frame(root);
        assert!(state.requires_lookup.is_empty());
        assert!(state.required_aliases.is_empty());
        assert_eq!(state.local_identifiers.len(), 1);
        // assigned only from the store node on
        assert!(matches!(state.unassigned_until.get("a"), Some(Some(_))));
    }

    #[test]
    fn test_load_mint_is_assigned_from_entry() {
        let body = vec![output("a")];
        let mut arena = FrameArena::new(TrackerOptions::default(), false);
        let root = arena.root_frame();
        arena.analyze(root, &body);
        assert!(matches!(
            arena.frame(root).unassigned_until.get("a"),
            Some(None)
        ));
    }

    #[test]
    fn test_first_store_wins_for_assignment_position() {
        let body = vec![assign("a", 1), assign("a", 2)];
        let mut arena = FrameArena::new(TrackerOptions::default(), false);
        let root = arena.root_frame();
        arena.analyze(root, &body);
        let state = arena.frame(root);
        let node = state.unassigned_until["a"].unwrap();
        let first_target = match &body[0] {
            Stmt::Assign { target, .. } => target,
            _ => unreachable!(),
        };
        assert!(std::ptr::eq(node, first_target));
    }

    #[test]
    fn test_from_import_binds_aliases() {
        let body = vec![Stmt::FromImport {
            template: Expr::constant("helpers.html"),
            names: vec![
                ImportName {
                    name: "foo".to_string(),
                    alias: None,
                },
                ImportName {
                    name: "bar".to_string(),
                    alias: Some("baz".to_string()),
                },
            ],
            with_context: false,
            lineno: 1,
        }];
        let mut arena = FrameArena::new(TrackerOptions::default(), false);
        let root = arena.root_frame();
        arena.analyze(root, &body);
        let state = arena.frame(root);
        assert!(state.local_identifiers.contains_key("foo"));
        assert!(state.local_identifiers.contains_key("baz"));
        assert!(!state.local_identifiers.contains_key("bar"));
    }

    #[test]
    fn test_for_tracks_only_iterable_and_accessor() {
        let body = vec![Stmt::For {
            target: Expr::name("item", NameCtx::Store),
            iter: Expr::name("seq", NameCtx::Load),
            body: vec![output("item")],
            else_: vec![],
            lineno: 1,
        }];
        let mut arena = FrameArena::new(TrackerOptions::default(), false);
        let root = arena.root_frame();
        arena.analyze(root, &body);
        let state = arena.frame(root);
        assert!(state.referenced_identifiers.contains_key("seq"));
        assert!(state.referenced_identifiers.contains_key("loop"));
        assert!(!state.referenced_identifiers.contains_key("item"));

        let mut no_parent = FrameArena::new(
            TrackerOptions {
                forloop_parent_access: false,
                ..TrackerOptions::default()
            },
            false,
        );
        let root = no_parent.root_frame();
        no_parent.analyze(root, &body);
        assert!(!no_parent.frame(root).referenced_identifiers.contains_key("loop"));
    }
}
