//! Reactive selections.
//!
//! A selection is an ordered collection of [`Clause`]s — at most one per
//! source — plus a [`Resolver`] policy and two observable events:
//!
//! - `value`: the resolved predicate changed
//! - `activate`: a preview/prefetch hint, no predicate applied yet
//!
//! Both events ride `tokio::sync::watch` channels: a single slot with
//! latest-value-wins replacement. A listener still processing one emission
//! simply observes the most recent state on its next wakeup — emissions
//! are coalesced, never queued, so listeners cannot fall behind and are
//! never re-entered.

pub mod clause;
pub mod resolver;

use std::sync::Arc;

use parking_lot::Mutex;
use sqlparser::ast::Expr;
use tokio::sync::watch;

pub use clause::{BinPolicy, Clause, ClauseMeta, ClauseValue, ResetHook, Scalar, Scale, ScaleKind};
pub use resolver::Resolver;

use crate::client::ClientId;

/// Identity of a selection, derived from its shared allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SelectionId(usize);

struct SelectionState {
    clauses: Vec<Clause>,
    active: Option<Clause>,
    last_activation: Option<Clause>,
    generation: u64,
    activation_generation: u64,
}

struct SelectionInner {
    resolver: Resolver,
    state: Mutex<SelectionState>,
    value_tx: watch::Sender<u64>,
    activate_tx: watch::Sender<u64>,
}

/// A shared, reactive filter selection. Cheap to clone; all clones view
/// the same state.
#[derive(Clone)]
pub struct Selection {
    inner: Arc<SelectionInner>,
}

impl Selection {
    /// Creates a selection with the given resolver.
    #[must_use]
    pub fn new(resolver: Resolver) -> Self {
        let (value_tx, _) = watch::channel(0);
        let (activate_tx, _) = watch::channel(0);
        Self {
            inner: Arc::new(SelectionInner {
                resolver,
                state: Mutex::new(SelectionState {
                    clauses: Vec::new(),
                    active: None,
                    last_activation: None,
                    generation: 0,
                    activation_generation: 0,
                }),
                value_tx,
                activate_tx,
            }),
        }
    }

    /// Conjunction of all clauses (the default policy).
    #[must_use]
    pub fn intersect() -> Self {
        Self::new(Resolver::Intersect)
    }

    /// Disjunction of all clauses.
    #[must_use]
    pub fn union() -> Self {
        Self::new(Resolver::Union)
    }

    /// One active clause at a time.
    #[must_use]
    pub fn single() -> Self {
        Self::new(Resolver::Single)
    }

    /// Intersection, but clients are never filtered by their own clauses.
    #[must_use]
    pub fn crossfilter() -> Self {
        Self::new(Resolver::Crossfilter)
    }

    /// This selection's identity.
    #[must_use]
    pub fn id(&self) -> SelectionId {
        SelectionId(Arc::as_ptr(&self.inner) as usize)
    }

    /// The resolution policy.
    #[must_use]
    pub fn resolver(&self) -> Resolver {
        self.inner.resolver
    }

    /// Folds a clause into the selection and emits a `value` event.
    ///
    /// Under the `single` resolver, every displaced source's reset hook is
    /// invoked (outside the selection's internal lock).
    pub fn update(&self, clause: Clause) {
        let (generation, displaced) = {
            let mut state = self.inner.state.lock();
            state.active = Some(clause.clone());
            let displaced = self.inner.resolver.resolve(&mut state.clauses, clause);
            state.generation += 1;
            (state.generation, displaced)
        };
        for clause in displaced {
            if let Some(reset) = &clause.reset {
                reset();
            }
        }
        self.inner.value_tx.send_replace(generation);
    }

    /// Emits an `activate` hint for the clause without applying it.
    ///
    /// Interactors fire this when an interaction is about to begin (e.g.
    /// pointer-down on a brush) so acceleration state can be prepared
    /// before the first `value` event.
    pub fn activate(&self, clause: Clause) {
        let generation = {
            let mut state = self.inner.state.lock();
            state.last_activation = Some(clause);
            state.activation_generation += 1;
            state.activation_generation
        };
        self.inner.activate_tx.send_replace(generation);
    }

    /// Removes all clauses and emits a `value` event.
    pub fn clear(&self) {
        let generation = {
            let mut state = self.inner.state.lock();
            state.clauses.clear();
            state.active = None;
            state.generation += 1;
            state.generation
        };
        self.inner.value_tx.send_replace(generation);
    }

    /// The most recently updated clause, independent of resolver.
    #[must_use]
    pub fn active(&self) -> Option<Clause> {
        self.inner.state.lock().active.clone()
    }

    /// The most recently updated clause's value, independent of resolver.
    #[must_use]
    pub fn value(&self) -> Option<ClauseValue> {
        self.inner
            .state
            .lock()
            .active
            .as_ref()
            .and_then(|clause| clause.value.clone())
    }

    /// The clause hinted by the last `activate` event.
    #[must_use]
    pub fn last_activation(&self) -> Option<Clause> {
        self.inner.state.lock().last_activation.clone()
    }

    /// Snapshot of the retained clauses, in update order.
    #[must_use]
    pub fn clauses(&self) -> Vec<Clause> {
        self.inner.state.lock().clauses.clone()
    }

    /// Resolves the selection into a conjunction list for `client`.
    ///
    /// `None` — distinct from an empty list — means "no update needed":
    /// under crossfilter the client is the active clause's own source.
    #[must_use]
    pub fn predicate(&self, client: Option<ClientId>) -> Option<Vec<Expr>> {
        let state = self.inner.state.lock();
        self.inner
            .resolver
            .predicate(&state.clauses, state.active.as_ref(), client)
    }

    /// True if `client` must not be filtered by `clause`.
    #[must_use]
    pub fn skip(&self, client: ClientId, clause: &Clause) -> bool {
        self.inner.resolver.skip(client, clause)
    }

    /// A derived selection with `source`'s clause stripped.
    ///
    /// Used when temporarily excluding the currently-dragging source from
    /// acceleration. The derived selection shares no listeners or events
    /// with the original.
    #[must_use]
    pub fn remove(&self, source: &str) -> Selection {
        let derived = Selection::new(self.inner.resolver);
        {
            let state = self.inner.state.lock();
            let mut derived_state = derived.inner.state.lock();
            derived_state.clauses = state
                .clauses
                .iter()
                .filter(|clause| clause.source != source)
                .cloned()
                .collect();
            derived_state.active = state
                .active
                .as_ref()
                .filter(|clause| clause.source != source)
                .cloned();
        }
        derived
    }

    /// Subscribes to `value` events. The receiver observes the latest
    /// generation only — intermediate values are coalesced away.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.value_tx.subscribe()
    }

    /// Subscribes to `activate` hints.
    #[must_use]
    pub fn subscribe_activation(&self) -> watch::Receiver<u64> {
        self.inner.activate_tx.subscribe()
    }
}

impl PartialEq for Selection {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for Selection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Selection")
            .field("resolver", &self.inner.resolver)
            .field("clauses", &state.clauses.len())
            .field("active", &state.active.as_ref().map(|c| &c.source))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::parse_expr;

    fn clause(source: &str, predicate: &str) -> Clause {
        Clause::new(source).with_predicate(parse_expr(predicate).unwrap())
    }

    #[test]
    fn test_value_tracks_most_recent_update() {
        let selection = Selection::union();
        selection.update(
            Clause::new("a").with_value(ClauseValue::Scalar(Scalar::Int(1))),
        );
        selection.update(
            Clause::new("b").with_value(ClauseValue::Scalar(Scalar::Int(2))),
        );
        assert_eq!(selection.value(), Some(ClauseValue::Scalar(Scalar::Int(2))));
        assert_eq!(selection.active().unwrap().source, "b");
        assert_eq!(selection.clauses().len(), 2);
    }

    #[test]
    fn test_remove_derives_without_source() {
        let selection = Selection::intersect();
        selection.update(clause("a", "x > 1"));
        selection.update(clause("b", "y > 2"));

        let derived = selection.remove("b");
        let preds = derived.predicate(None).unwrap();
        assert_eq!(preds.len(), 1);
        assert_eq!(preds[0].to_string(), "x > 1");
        // Active clause was from "b": stripped in the derived selection.
        assert!(derived.active().is_none());
        // The original is untouched.
        assert_eq!(selection.clauses().len(), 2);
    }

    #[tokio::test]
    async fn test_value_events_coalesce_to_latest() {
        let selection = Selection::intersect();
        let mut rx = selection.subscribe();
        let seen_at_start = *rx.borrow();

        // Three rapid updates while nobody is polling.
        selection.update(clause("a", "x > 1"));
        selection.update(clause("a", "x > 2"));
        selection.update(clause("a", "x > 3"));

        rx.changed().await.unwrap();
        let seen = *rx.borrow_and_update();
        assert_eq!(seen, seen_at_start + 3);
        // No queued backlog: the channel reports no further change.
        assert!(!rx.has_changed().unwrap());
        assert_eq!(
            selection.clauses()[0].predicate.as_ref().unwrap().to_string(),
            "x > 3"
        );
    }

    #[tokio::test]
    async fn test_activate_is_separate_from_value() {
        let selection = Selection::crossfilter();
        let mut value_rx = selection.subscribe();
        let mut activate_rx = selection.subscribe_activation();

        selection.activate(Clause::new("brush"));
        activate_rx.changed().await.unwrap();
        assert_eq!(selection.last_activation().unwrap().source, "brush");
        // No value event was emitted.
        assert!(!value_rx.has_changed().unwrap());
        assert!(selection.active().is_none());
        let _ = value_rx.borrow_and_update();
    }

    #[test]
    fn test_single_selection_keeps_one_clause_and_resets_displaced() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let resets = Arc::new(AtomicUsize::new(0));
        let hook = {
            let resets = Arc::clone(&resets);
            Arc::new(move || {
                resets.fetch_add(1, Ordering::Relaxed);
            }) as ResetHook
        };

        let selection = Selection::single();
        for source in ["a", "b", "c", "d"] {
            selection.update(clause(source, "x > 1").with_reset(Arc::clone(&hook)));
        }

        // Exactly one clause remains; every displaced source was reset.
        assert_eq!(selection.clauses().len(), 1);
        assert_eq!(selection.clauses()[0].source, "d");
        assert_eq!(resets.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn test_selection_identity() {
        let a = Selection::intersect();
        let b = a.clone();
        let c = Selection::intersect();
        assert_eq!(a, b);
        assert_eq!(a.id(), b.id());
        assert_ne!(a, c);
    }
}
