//! KV-cache region ownership, with prefix-sharing forks (spec.md §3, §4.5).
//!
//! Contexts live in an arena and reference their parent by index rather than
//! by owning pointer (spec.md §9 Design Notes), so the fork tree can be
//! walked and torn down without `Rc`/`Weak` bookkeeping.

use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(usize);

impl ContextId {
    pub fn raw(self) -> usize {
        self.0
    }

    /// Build an id directly, bypassing the arena. Only meant for tests that
    /// need a stable id without constructing a full `ContextArena`.
    pub fn raw_for_test(raw: usize) -> Self {
        ContextId(raw)
    }
}

/// Whether a context is torn down when its last referring session finishes,
/// or kept alive until explicit user teardown (spec.md §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextLifetime {
    Temporary,
    Shared,
}

pub struct Context {
    parent: Option<ContextId>,
    lifetime: ContextLifetime,
    /// Engines that have materialized this context (i.e. a session ran a
    /// `fill`/`generate` against it on that engine).
    cached_engines: HashSet<String>,
    /// Sessions currently referring to this context; decremented as
    /// sessions terminate. The context is freed once this reaches zero
    /// (for temporary contexts only).
    ref_count: usize,
    freed: bool,
}

/// Arena owning every live `Context`. Destruction walks children-first so a
/// parent is never torn down while a fork still references it.
#[derive(Default)]
pub struct ContextArena {
    slots: Vec<Option<Context>>,
}

impl ContextArena {
    pub fn new() -> Self {
        Self { slots: Vec::new() }
    }

    pub fn create_root(&mut self, lifetime: ContextLifetime) -> ContextId {
        self.insert(Context {
            parent: None,
            lifetime,
            cached_engines: HashSet::new(),
            ref_count: 0,
            freed: false,
        })
    }

    /// Fork a child context whose parent is `parent`. A child may only be
    /// executed on an engine that also hosts its parent chain (spec.md §3).
    pub fn fork(&mut self, parent: ContextId, lifetime: ContextLifetime) -> ContextId {
        assert!(
            self.get(parent).is_some(),
            "forking from a freed or unknown context"
        );
        self.insert(Context {
            parent: Some(parent),
            lifetime,
            cached_engines: HashSet::new(),
            ref_count: 0,
            freed: false,
        })
    }

    fn insert(&mut self, ctx: Context) -> ContextId {
        self.slots.push(Some(ctx));
        ContextId(self.slots.len() - 1)
    }

    pub fn get(&self, id: ContextId) -> Option<&Context> {
        self.slots.get(id.0).and_then(|s| s.as_ref())
    }

    fn get_mut(&mut self, id: ContextId) -> Option<&mut Context> {
        self.slots.get_mut(id.0).and_then(|s| s.as_mut())
    }

    pub fn parent_of(&self, id: ContextId) -> Option<ContextId> {
        self.get(id).and_then(|c| c.parent)
    }

    /// Walk from `id` up through every ancestor, root last.
    pub fn ancestry(&self, id: ContextId) -> Vec<ContextId> {
        let mut chain = vec![id];
        let mut current = id;
        while let Some(parent) = self.parent_of(current) {
            chain.push(parent);
            current = parent;
        }
        chain
    }

    /// True if an engine hosting `id` would also have every ancestor in its
    /// chain materialized on that same engine.
    pub fn engine_hosts_chain(&self, id: ContextId, engine_id: &str) -> bool {
        self.ancestry(id).iter().all(|ctx_id| {
            self.get(*ctx_id)
                .map(|c| c.cached_engines.contains(engine_id))
                .unwrap_or(false)
        })
    }

    pub fn mark_materialized(&mut self, id: ContextId, engine_id: impl Into<String>) {
        if let Some(ctx) = self.get_mut(id) {
            ctx.cached_engines.insert(engine_id.into());
        }
    }

    pub fn cached_engines(&self, id: ContextId) -> Vec<String> {
        self.get(id)
            .map(|c| c.cached_engines.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn retain(&mut self, id: ContextId) {
        if let Some(ctx) = self.get_mut(id) {
            ctx.ref_count += 1;
        }
    }

    pub fn lifetime(&self, id: ContextId) -> Option<ContextLifetime> {
        self.get(id).map(|c| c.lifetime)
    }

    pub fn is_freed(&self, id: ContextId) -> bool {
        self.get(id).map(|c| c.freed).unwrap_or(true)
    }

    /// A session referring to `id` has terminated. Returns the set of
    /// engines to issue `free_context` against if this was the last
    /// referrer of a temporary context (spec.md invariant 4).
    pub fn release(&mut self, id: ContextId) -> Option<Vec<String>> {
        let should_free = {
            let ctx = self.get_mut(id)?;
            ctx.ref_count = ctx.ref_count.saturating_sub(1);
            ctx.lifetime == ContextLifetime::Temporary && ctx.ref_count == 0 && !ctx.freed
        };
        if should_free {
            let engines = self.cached_engines(id);
            if let Some(ctx) = self.get_mut(id) {
                ctx.freed = true;
            }
            Some(engines)
        } else {
            None
        }
    }

    /// Explicit teardown for a context `release` won't touch on its own —
    /// `Shared` contexts live until a caller says otherwise (spec.md §4.5).
    /// Idempotent; returns the engines to issue `free_context` against, or
    /// `None` if already freed.
    pub fn force_free(&mut self, id: ContextId) -> Option<Vec<String>> {
        if self.is_freed(id) {
            return None;
        }
        let engines = self.cached_engines(id);
        if let Some(ctx) = self.get_mut(id) {
            ctx.freed = true;
        }
        Some(engines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fork_chain_tracks_ancestry_root_last() {
        let mut arena = ContextArena::new();
        let root = arena.create_root(ContextLifetime::Shared);
        let child = arena.fork(root, ContextLifetime::Temporary);
        let grandchild = arena.fork(child, ContextLifetime::Temporary);

        let chain = arena.ancestry(grandchild);
        assert_eq!(chain, vec![grandchild, child, root]);
    }

    #[test]
    fn engine_hosts_chain_requires_every_ancestor_materialized() {
        let mut arena = ContextArena::new();
        let root = arena.create_root(ContextLifetime::Shared);
        let child = arena.fork(root, ContextLifetime::Temporary);

        assert!(!arena.engine_hosts_chain(child, "e0"));

        arena.mark_materialized(root, "e0");
        assert!(!arena.engine_hosts_chain(child, "e0"));

        arena.mark_materialized(child, "e0");
        assert!(arena.engine_hosts_chain(child, "e0"));
    }

    #[test]
    fn temporary_context_freed_exactly_once_after_last_release() {
        let mut arena = ContextArena::new();
        let ctx = arena.create_root(ContextLifetime::Temporary);
        arena.mark_materialized(ctx, "e0");
        arena.retain(ctx);
        arena.retain(ctx);

        assert!(arena.release(ctx).is_none());
        let freed = arena.release(ctx);
        assert_eq!(freed, Some(vec!["e0".to_string()]));

        // A further release must not free again.
        arena.retain(ctx);
        assert!(arena.release(ctx).is_none());
    }

    #[test]
    fn shared_context_is_never_freed_by_release() {
        let mut arena = ContextArena::new();
        let ctx = arena.create_root(ContextLifetime::Shared);
        arena.retain(ctx);
        assert!(arena.release(ctx).is_none());
        assert!(!arena.is_freed(ctx));
    }

    #[test]
    fn force_free_tears_down_a_shared_context_exactly_once() {
        let mut arena = ContextArena::new();
        let ctx = arena.create_root(ContextLifetime::Shared);
        arena.mark_materialized(ctx, "e0");
        arena.retain(ctx);

        let engines = arena.force_free(ctx);
        assert_eq!(engines, Some(vec!["e0".to_string()]));
        assert!(arena.is_freed(ctx));
        assert!(arena.force_free(ctx).is_none());
    }
}
