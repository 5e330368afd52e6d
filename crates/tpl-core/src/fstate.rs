//! Frame state: one record per lexical scope of a template.
//!
//! Frames form a tree owned by a [`FrameArena`] and indexed by
//! [`FrameId`]; a frame derived `Soft` can see its ancestors' bindings,
//! a `Hard` frame stops the search at itself (block bodies). The tracker
//! in [`crate::idtracking`] fills each frame with the per-name facts the
//! code generators need: which names are bound locally, which shadow an
//! outer binding and need an entry alias, which must be fetched from the
//! runtime context, and from which node on a name actually has a value.
//!
//! All per-frame maps are ordered so that analyzing the same tree twice
//! yields byte-identical scope code.

use std::collections::{BTreeMap, BTreeSet};

use crate::idents::IdentManager;
use crate::idtracking::{self, TrackerOptions};
use crate::nodes::{Expr, Stmt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Soft,
    Hard,
}

/// Index of a frame within its arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameId(usize);

#[derive(Debug)]
pub struct FrameState<'ast> {
    pub parent: Option<FrameId>,
    pub scope: ScopeKind,
    pub root: bool,
    /// Names bound in this frame -> generated identifier.
    pub local_identifiers: BTreeMap<String, String>,
    /// Names this frame touches that resolve to an ancestor's binding.
    pub from_outer_scope: BTreeSet<String>,
    /// Every name this frame's own code touches -> the identifier it
    /// resolves to (local or inherited).
    pub referenced_identifiers: BTreeMap<String, String>,
    /// Shadowing identifier -> the outer identifier whose value must be
    /// copied into it on frame entry.
    pub required_aliases: BTreeMap<String, String>,
    /// Generated identifier -> source name that must be fetched from the
    /// runtime context in this frame's prologue.
    pub requires_lookup: BTreeMap<String, String>,
    /// Name -> the store node from which on it has a value; `None` means
    /// it has one from frame entry (params, context lookups).
    pub unassigned_until: BTreeMap<String, Option<&'ast Expr>>,
    pub inner_frames: Vec<FrameId>,
    /// The statements analyzed into this frame, in document order.
    pub nodes: Vec<&'ast Stmt>,
}

/// Entry aliases and context lookups a frame's prologue must perform,
/// in emission order.
#[derive(Debug, Default, PartialEq)]
pub struct ScopeCode {
    /// `(shadowing identifier, outer identifier)`
    pub aliases: Vec<(String, String)>,
    /// `(identifier, source name)`
    pub lookups: Vec<(String, String)>,
}

pub struct FrameArena<'ast> {
    frames: Vec<FrameState<'ast>>,
    pub idents: IdentManager,
    pub options: TrackerOptions,
}

impl<'ast> FrameArena<'ast> {
    pub fn new(options: TrackerOptions, short_ids: bool) -> FrameArena<'ast> {
        FrameArena {
            frames: Vec::new(),
            idents: IdentManager::new(short_ids),
            options,
        }
    }

    pub fn root_frame(&mut self) -> FrameId {
        self.push_frame(None, ScopeKind::Soft, true)
    }

    /// A child frame. `Hard` cuts visibility of everything above it.
    pub fn derive(&mut self, parent: FrameId, scope: ScopeKind) -> FrameId {
        let id = self.push_frame(Some(parent), scope, false);
        self.frames[parent.0].inner_frames.push(id);
        id
    }

    fn push_frame(&mut self, parent: Option<FrameId>, scope: ScopeKind, root: bool) -> FrameId {
        let id = FrameId(self.frames.len());
        self.frames.push(FrameState {
            parent,
            scope,
            root,
            local_identifiers: BTreeMap::new(),
            from_outer_scope: BTreeSet::new(),
            referenced_identifiers: BTreeMap::new(),
            required_aliases: BTreeMap::new(),
            requires_lookup: BTreeMap::new(),
            unassigned_until: BTreeMap::new(),
            inner_frames: Vec::new(),
            nodes: Vec::new(),
        });
        id
    }

    pub fn frame(&self, id: FrameId) -> &FrameState<'ast> {
        &self.frames[id.0]
    }

    pub(crate) fn frame_mut(&mut self, id: FrameId) -> &mut FrameState<'ast> {
        &mut self.frames[id.0]
    }

    /// Runs identifier tracking for `stmts` in `frame`. May be called
    /// more than once per frame; statements accumulate in order.
    pub fn analyze(&mut self, frame: FrameId, stmts: &'ast [Stmt]) {
        idtracking::track(self, frame, stmts);
    }

    /// Binds `name` as a parameter of `frame`: unconditionally local,
    /// assigned from frame entry, never aliased from an outer binding
    /// (the caller provides the value before the prologue runs).
    pub fn declare_param(&mut self, frame: FrameId, name: &str) -> String {
        let ident = self.idents.encode(name);
        let state = self.frame_mut(frame);
        state.local_identifiers.insert(name.to_string(), ident.clone());
        state
            .referenced_identifiers
            .insert(name.to_string(), ident.clone());
        state.unassigned_until.entry(name.to_string()).or_insert(None);
        ident
    }

    /// The generated identifier a tracked name resolves to from `frame`.
    ///
    /// Panics when the name was never tracked; evaluating a node whose
    /// frame was not analyzed is a contract violation, not a runtime
    /// condition.
    pub fn lookup_name(&self, frame: FrameId, name: &str) -> String {
        let mut cursor = Some(frame);
        while let Some(id) = cursor {
            let state = self.frame(id);
            if let Some(ident) = state.referenced_identifiers.get(name) {
                return ident.clone();
            }
            if state.scope == ScopeKind::Hard {
                break;
            }
            cursor = state.parent;
        }
        panic!(
            "identifier {:?} was never tracked in this frame tree",
            name
        );
    }

    /// Walks the identifier maps visible from `frame`, innermost first,
    /// stopping after the first hard frame.
    pub(crate) fn find_binding(&self, frame: FrameId, name: &str) -> Option<(FrameId, String)> {
        let mut cursor = Some(frame);
        while let Some(id) = cursor {
            let state = self.frame(id);
            if let Some(ident) = state.local_identifiers.get(name) {
                return Some((id, ident.clone()));
            }
            if state.scope == ScopeKind::Hard {
                break;
            }
            cursor = state.parent;
        }
        None
    }

    /// Every `(name, identifier)` visible from `frame`, innermost
    /// binding winning. With a reference node, names that have no value
    /// yet at that point in the document are filtered out.
    pub fn iter_vars(&self, frame: FrameId, reference: Option<&'ast Stmt>) -> Vec<(String, String)> {
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        let mut cursor = Some(frame);
        while let Some(id) = cursor {
            let state = self.frame(id);
            for (name, ident) in &state.local_identifiers {
                if !seen.insert(name.clone()) {
                    continue;
                }
                if let Some(reference) = reference {
                    if self.var_unassigned(id, name, reference) {
                        continue;
                    }
                }
                out.push((name.clone(), ident.clone()));
            }
            if state.scope == ScopeKind::Hard {
                break;
            }
            cursor = state.parent;
        }
        out
    }

    /// Whether `name`, bound in `owner`, still has no value when
    /// execution reaches `reference`.
    fn var_unassigned(&self, owner: FrameId, name: &str, reference: &'ast Stmt) -> bool {
        let state = self.frame(owner);
        let assign_node = match state.unassigned_until.get(name) {
            Some(Some(node)) => *node,
            // assigned from frame entry, or not constrained
            Some(None) | None => return false,
        };
        for stmt in &state.nodes {
            match first_hit(stmt, assign_node, reference) {
                Some(Hit::Assignment) => return false,
                Some(Hit::Reference) => return true,
                None => {}
            }
        }
        false
    }

    /// Inherited names referenced by direct inner frames, with shadowing
    /// aliases normalized back to the outer identifier they copy from.
    pub fn inner_referenced_vars(&self, frame: FrameId) -> Vec<(String, String)> {
        let mut out = Vec::new();
        for &inner in &self.frame(frame).inner_frames {
            out.extend(self.referenced_from_outer(inner));
        }
        out
    }

    fn referenced_from_outer(&self, inner: FrameId) -> Vec<(String, String)> {
        let state = self.frame(inner);
        let mut out = Vec::new();
        for (name, ident) in &state.referenced_identifiers {
            if !state.from_outer_scope.contains(name) {
                continue;
            }
            let ident = state.required_aliases.get(ident).unwrap_or(ident);
            out.push((ident.clone(), name.clone()));
        }
        out
    }

    /// Every context fetch this frame's prologue must perform: its own
    /// direct requirements plus requirements bubbled up from inner
    /// frames that no binding between here and there resolves.
    pub fn iter_required_lookups(&self, frame: FrameId) -> BTreeMap<String, String> {
        let mut out = self.frame(frame).requires_lookup.clone();
        for &inner in &self.frame(frame).inner_frames {
            let reference = self.frame(inner).nodes.first().copied();
            for (ident, name) in self.referenced_from_outer(inner) {
                if out.contains_key(&ident) {
                    continue;
                }
                // a binding on the chain only makes the fetch redundant
                // if it has a value by the time the inner frame runs; a
                // store that happens after the inner frame's statements
                // must not shadow the context value they read
                if self.binding_assigned_before(frame, &name, reference) {
                    continue;
                }
                out.insert(ident, name);
            }
        }
        out
    }

    /// Whether the binding `name` resolves to from `frame` already has a
    /// value when execution reaches `reference`.
    fn binding_assigned_before(
        &self,
        frame: FrameId,
        name: &str,
        reference: Option<&'ast Stmt>,
    ) -> bool {
        let owner = match self.find_binding(frame, name) {
            Some((owner, _)) => owner,
            None => return false,
        };
        match reference {
            Some(reference) => !self.var_unassigned(owner, name, reference),
            // an empty inner frame references nothing anyway
            None => true,
        }
    }

    /// The prologue of `frame`: aliases first, then context lookups.
    /// Deferred function definitions are emitted by the backends between
    /// the two.
    pub fn scope_code(&self, frame: FrameId) -> ScopeCode {
        ScopeCode {
            aliases: self
                .frame(frame)
                .required_aliases
                .iter()
                .map(|(new, old)| (new.clone(), old.clone()))
                .collect(),
            lookups: self
                .iter_required_lookups(frame)
                .into_iter()
                .collect(),
        }
    }

    /// All generated identifiers that belong to `frame`, for backends
    /// that need explicit declarations.
    pub fn declared_idents(&self, frame: FrameId) -> Vec<String> {
        self.frame(frame).local_identifiers.values().cloned().collect()
    }
}

enum Hit {
    Assignment,
    Reference,
}

/// First of the two interesting nodes reached in a document-order walk
/// of `stmt`, if either occurs inside it.
fn first_hit<'ast>(stmt: &'ast Stmt, assign_node: &'ast Expr, reference: &'ast Stmt) -> Option<Hit> {
    if std::ptr::eq(stmt, reference) {
        return Some(Hit::Reference);
    }
    for expr in stmt.direct_exprs() {
        let mut found = None;
        expr.walk(&mut |e| {
            if found.is_none() && std::ptr::eq(e, assign_node) {
                found = Some(Hit::Assignment);
            }
        });
        if found.is_some() {
            return found;
        }
    }
    for body in stmt.child_bodies() {
        for inner in body {
            if let Some(hit) = first_hit(inner, assign_node, reference) {
                return Some(hit);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::{Expr, NameCtx, Stmt};
    use pretty_assertions::assert_eq;

    fn arena<'ast>() -> FrameArena<'ast> {
        FrameArena::new(TrackerOptions::default(), false)
    }

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
    fn test_hard_scope_cuts_binding_search() {
        let body = vec![assign("a", 1)];
        let inner = vec![output("a")];
        let mut arena = arena();
        let root = arena.root_frame();
        arena.analyze(root, &body);
        let hard = arena.derive(root, ScopeKind::Hard);
        arena.analyze(hard, &inner);
        // the hard frame cannot see root's binding and fetches its own
        let state = arena.frame(hard);
        assert!(state.from_outer_scope.is_empty());
        assert_eq!(state.requires_lookup.len(), 1);
        let soft = arena.derive(root, ScopeKind::Soft);
        arena.analyze(soft, &inner);
        let state = arena.frame(soft);
        assert!(state.from_outer_scope.contains("a"));
        assert!(state.requires_lookup.is_empty());
    }

    #[test]
    fn test_iter_vars_filters_not_yet_assigned_names() {
        // a = 1; <reference>; b = 2
        let body = vec![
            assign("a", 1),
            Stmt::Include {
                template: Expr::constant("x.html"),
                with_context: true,
                ignore_missing: false,
                lineno: 1,
            },
            assign("b", 2),
        ];
        let mut arena = arena();
        let root = arena.root_frame();
        arena.analyze(root, &body);
        let names: Vec<String> = arena
            .iter_vars(root, Some(&body[1]))
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(names, vec!["a".to_string()]);
        // without a reference node both are visible
        assert_eq!(arena.iter_vars(root, None).len(), 2);
    }

    #[test]
    fn test_scope_code_is_deterministic() {
        let build = || {
            vec![
                output("b"),
                output("a"),
                Stmt::If {
                    test: Expr::constant(true),
                    body: vec![assign("a", 23), output("a")],
                    else_: vec![],
                    lineno: 1,
                },
            ]
        };
        let body_one = build();
        let body_two = build();
        let mut first = arena();
        let root = first.root_frame();
        first.analyze(root, &body_one);
        let mut second = arena();
        let root_two = second.root_frame();
        second.analyze(root_two, &body_two);
        assert_eq!(first.scope_code(root), second.scope_code(root_two));
    }

    #[test]
    fn test_bubbled_lookup_is_suppressed_by_a_real_binding() {
        // root assigns a; the inner frame reads it from outside. The
        // inner reference must not force a context fetch in root.
        let body = vec![
            assign("a", 1),
            Stmt::If {
                test: Expr::constant(true),
                body: vec![output("a")],
                else_: vec![],
                lineno: 1,
            },
        ];
        let inner_body = match &body[1] {
            Stmt::If { body, .. } => body.as_slice(),
            _ => unreachable!(),
        };
        let mut arena = arena();
        let root = arena.root_frame();
        arena.analyze(root, &body);
        let inner = arena.derive(root, ScopeKind::Soft);
        arena.analyze(inner, inner_body);
        assert_eq!(arena.inner_referenced_vars(root).len(), 1);
        assert!(arena.iter_required_lookups(root).is_empty());
    }

    #[test]
    fn test_store_after_the_inner_read_still_fetches() {
        // if true: (a); a = 1 -- the inner frame reads the context value
        // before root's store gives the binding one
        let body = vec![
            Stmt::If {
                test: Expr::constant(true),
                body: vec![output("a")],
                else_: vec![],
                lineno: 1,
            },
            assign("a", 1),
        ];
        let inner_body = match &body[0] {
            Stmt::If { body, .. } => body.as_slice(),
            _ => unreachable!(),
        };
        let mut arena = arena();
        let root = arena.root_frame();
        arena.analyze(root, &body);
        let inner = arena.derive(root, ScopeKind::Soft);
        arena.analyze(inner, inner_body);
        let lookups = arena.iter_required_lookups(root);
        assert_eq!(
            lookups.values().map(String::as_str).collect::<Vec<_>>(),
            vec!["a"]
        );
    }

    #[test]
    fn test_declare_param_shadows_without_alias() {
        let body = vec![assign("x", 1)];
        let mut arena = arena();
        let root = arena.root_frame();
        arena.analyze(root, &body);
        let child = arena.derive(root, ScopeKind::Soft);
        let ident = arena.declare_param(child, "x");
        assert_ne!(ident, arena.lookup_name(root, "x"));
        assert!(arena.frame(child).required_aliases.is_empty());
        assert_eq!(arena.lookup_name(child, "x"), ident);
    }
}
