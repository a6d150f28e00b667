//! Clause resolution policies.
//!
//! A resolver decides how an incoming clause combines with the clauses a
//! selection already holds, which clauses a given client may skip, and how
//! the retained predicates combine into one filter. The variants are a
//! closed set so they stay enumerable and exhaustively testable.

use sqlparser::ast::{BinaryOperator, Expr};

use super::clause::Clause;
use crate::client::ClientId;

/// Policy applied to the clause list on each update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Resolver {
    /// Conjunction of all clause predicates (default).
    #[default]
    Intersect,
    /// Disjunction when more than one predicate is present.
    Union,
    /// Only the incoming clause is retained; displaced sources are
    /// notified through their reset hooks.
    Single,
    /// Like intersect, but a client is never filtered by a clause it
    /// itself produced.
    Crossfilter,
}

impl Resolver {
    /// Folds the incoming clause into the clause list.
    ///
    /// All policies replace any prior clause from the same source; `Single`
    /// additionally drops every other source. Returns the clauses of
    /// displaced *other* sources so their reset hooks can be fired outside
    /// any lock.
    #[must_use]
    pub(super) fn resolve(self, clauses: &mut Vec<Clause>, incoming: Clause) -> Vec<Clause> {
        match self {
            Self::Single => {
                let displaced = clauses
                    .drain(..)
                    .filter(|clause| clause.source != incoming.source)
                    .collect();
                clauses.push(incoming);
                displaced
            }
            Self::Intersect | Self::Union | Self::Crossfilter => {
                clauses.retain(|clause| clause.source != incoming.source);
                clauses.push(incoming);
                Vec::new()
            }
        }
    }

    /// True if `client` must not be filtered by `clause`.
    #[must_use]
    pub fn skip(self, client: ClientId, clause: &Clause) -> bool {
        self == Self::Crossfilter && clause.clients.contains(&client)
    }

    /// Resolves the retained clauses into a conjunction list for `client`.
    ///
    /// Returns `None` — "no update needed" — only under crossfilter, when
    /// the client is the active clause's own source. An empty list means
    /// unfiltered.
    #[must_use]
    pub fn predicate(
        self,
        clauses: &[Clause],
        active: Option<&Clause>,
        client: Option<ClientId>,
    ) -> Option<Vec<Expr>> {
        if self == Self::Crossfilter {
            if let (Some(client), Some(active)) = (client, active) {
                if active.clients.contains(&client) {
                    return None;
                }
            }
        }

        let applicable: Vec<&Expr> = clauses
            .iter()
            .filter(|clause| client.is_none_or(|c| !self.skip(c, clause)))
            .filter_map(|clause| clause.predicate.as_ref())
            .collect();

        if self == Self::Union && applicable.len() > 1 {
            let disjunction = applicable
                .into_iter()
                .cloned()
                .reduce(|left, right| Expr::BinaryOp {
                    left: Box::new(left),
                    op: BinaryOperator::Or,
                    right: Box::new(right),
                })
                .map(|expr| Expr::Nested(Box::new(expr)));
            return Some(disjunction.into_iter().collect());
        }

        Some(applicable.into_iter().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selection::clause::ClauseValue;
    use crate::selection::Scalar;
    use crate::sql::parse_expr;

    fn clause(source: &str, predicate: &str) -> Clause {
        Clause::new(source).with_predicate(parse_expr(predicate).unwrap())
    }

    fn texts(exprs: &[Expr]) -> Vec<String> {
        exprs.iter().map(ToString::to_string).collect()
    }

    // -- retention --

    #[test]
    fn test_same_source_replaces() {
        let mut clauses = Vec::new();
        let _ = Resolver::Intersect.resolve(&mut clauses, clause("a", "x > 1"));
        let _ = Resolver::Intersect.resolve(&mut clauses, clause("b", "y > 2"));
        let displaced = Resolver::Intersect.resolve(&mut clauses, clause("a", "x > 3"));
        assert!(displaced.is_empty());
        assert_eq!(clauses.len(), 2);
        assert_eq!(clauses[1].source, "a");
        assert_eq!(clauses[1].predicate.as_ref().unwrap().to_string(), "x > 3");
    }

    #[test]
    fn test_single_retains_only_incoming_and_reports_displaced() {
        let mut clauses = Vec::new();
        let mut displaced_sources = Vec::new();
        for source in ["a", "b", "c"] {
            let displaced = Resolver::Single.resolve(&mut clauses, clause(source, "x > 1"));
            displaced_sources.extend(displaced.into_iter().map(|c| c.source));
        }
        assert_eq!(clauses.len(), 1);
        assert_eq!(clauses[0].source, "c");
        // a displaced by b, then b displaced by c.
        assert_eq!(displaced_sources, vec!["a", "b"]);
    }

    #[test]
    fn test_single_same_source_is_not_displaced() {
        let mut clauses = Vec::new();
        let _ = Resolver::Single.resolve(&mut clauses, clause("a", "x > 1"));
        let displaced = Resolver::Single.resolve(&mut clauses, clause("a", "x > 2"));
        assert!(displaced.is_empty());
        assert_eq!(clauses[0].predicate.as_ref().unwrap().to_string(), "x > 2");
    }

    // -- predicate resolution --

    #[test]
    fn test_intersect_conjunction_list() {
        let clauses = vec![clause("a", "x > 1"), clause("b", "y > 2")];
        let preds = Resolver::Intersect
            .predicate(&clauses, clauses.last(), None)
            .unwrap();
        assert_eq!(texts(&preds), vec!["x > 1", "y > 2"]);
    }

    #[test]
    fn test_union_disjunction() {
        let clauses = vec![clause("a", "x > 1"), clause("b", "y > 2")];
        let preds = Resolver::Union
            .predicate(&clauses, clauses.last(), None)
            .unwrap();
        assert_eq!(texts(&preds), vec!["(x > 1 OR y > 2)"]);

        // A lone clause stays bare.
        let one = vec![clause("a", "x > 1")];
        let preds = Resolver::Union.predicate(&one, one.last(), None).unwrap();
        assert_eq!(texts(&preds), vec!["x > 1"]);
    }

    #[test]
    fn test_empty_predicates_mean_unfiltered() {
        let clauses = vec![Clause::new("a").with_value(ClauseValue::Scalar(Scalar::Null))];
        let preds = Resolver::Intersect
            .predicate(&clauses, clauses.last(), None)
            .unwrap();
        assert!(preds.is_empty());
    }

    // -- crossfilter skip invariant --

    #[test]
    fn test_crossfilter_skips_own_clause() {
        let c1 = ClientId::from_raw(1);
        let c2 = ClientId::from_raw(2);
        let clauses = vec![
            clause("brush-a", "a BETWEEN 1 AND 5").with_client(c1),
            clause("brush-b", "b BETWEEN 2 AND 6").with_client(c2),
        ];
        let active = clauses.last();

        // c2 is the active clause's source: no update needed.
        assert!(Resolver::Crossfilter
            .predicate(&clauses, active, Some(c2))
            .is_none());

        // c1 sees every clause it did not produce.
        let preds = Resolver::Crossfilter
            .predicate(&clauses, active, Some(c1))
            .unwrap();
        assert_eq!(texts(&preds), vec!["b BETWEEN 2 AND 6"]);

        // An unrelated client sees both.
        let preds = Resolver::Crossfilter
            .predicate(&clauses, active, Some(ClientId::from_raw(9)))
            .unwrap();
        assert_eq!(preds.len(), 2);
    }

    #[test]
    fn test_crossfilter_roles_invert_with_active_clause() {
        let c1 = ClientId::from_raw(1);
        let c2 = ClientId::from_raw(2);
        let mut clauses = vec![
            clause("brush-b", "b BETWEEN 2 AND 6").with_client(c2),
            clause("brush-a", "a BETWEEN 1 AND 5").with_client(c1),
        ];
        // brush-a is now active: c1 skips, c2 filters by a.
        let active = clauses.last().cloned();
        assert!(Resolver::Crossfilter
            .predicate(&clauses, active.as_ref(), Some(c1))
            .is_none());
        let preds = Resolver::Crossfilter
            .predicate(&clauses, active.as_ref(), Some(c2))
            .unwrap();
        assert_eq!(texts(&preds), vec!["a BETWEEN 1 AND 5"]);

        // c2 publishes again: roles invert.
        let _ = Resolver::Crossfilter
            .resolve(&mut clauses, clause("brush-b", "b BETWEEN 3 AND 7").with_client(c2));
        let active = clauses.last().cloned();
        assert!(Resolver::Crossfilter
            .predicate(&clauses, active.as_ref(), Some(c2))
            .is_none());
        let preds = Resolver::Crossfilter
            .predicate(&clauses, active.as_ref(), Some(c1))
            .unwrap();
        assert_eq!(texts(&preds), vec!["b BETWEEN 3 AND 7"]);
    }
}
