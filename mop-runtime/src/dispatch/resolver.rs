//! Multimethod overload selection.
//!
//! Given the runtime types of the arguments and the candidates one
//! resolution layer offers, pick the unique most specific candidate:
//!
//! 1. **Filter applicable**: same arity, every argument's runtime type
//!    assignable to the declared parameter type.
//! 2. **Find maximal**: drop every candidate some other candidate dominates
//!    (all parameters at least as specific, one strictly more).
//! 3. **Rank by distance**: among the maximal ones, compare per-parameter
//!    inheritance distances left to right; smaller wins, exact is 0.
//! 4. Still tied: ambiguous.

use std::cmp::Ordering;

use crate::registry::TypeRegistry;
use crate::table::{EntryOrigin, Implementation, MethodEntry, Signature};
use crate::value::TypeId;

/// A method offered by one layer.
#[derive(Debug, Clone)]
pub struct MethodCandidate {
    pub signature: Signature,
    pub implementation: Implementation,
    /// Type (or fragment receiver constraint) whose table holds the entry.
    pub declaring_type: TypeId,
    pub origin: EntryOrigin,
}

impl MethodCandidate {
    pub fn from_entry(entry: &MethodEntry, declaring_type: TypeId) -> Self {
        Self {
            signature: entry.signature.clone(),
            implementation: entry.implementation.clone(),
            declaring_type,
            origin: entry.origin,
        }
    }
}

/// Outcome of overload selection within one layer.
#[derive(Debug)]
pub enum DispatchResult {
    /// A unique method was found.
    Resolved(MethodCandidate),
    /// No candidate is applicable; the layer does not match.
    NoMatch,
    /// The tied, equally specific candidates.
    Ambiguous(Vec<MethodCandidate>),
}

pub struct OverloadResolver<'a> {
    registry: &'a TypeRegistry,
}

impl<'a> OverloadResolver<'a> {
    pub fn new(registry: &'a TypeRegistry) -> Self {
        Self { registry }
    }

    /// Select among `candidates` for arguments of the given runtime types.
    pub fn resolve(&self, arg_types: &[TypeId], candidates: Vec<MethodCandidate>) -> DispatchResult {
        let mut applicable: Vec<_> = candidates
            .into_iter()
            .filter(|m| self.is_applicable(m, arg_types))
            .collect();

        if applicable.is_empty() {
            return DispatchResult::NoMatch;
        }
        if applicable.len() == 1 {
            return DispatchResult::Resolved(applicable.remove(0));
        }

        let mut maximal = self.find_maximal(applicable);
        if maximal.len() == 1 {
            return DispatchResult::Resolved(maximal.remove(0));
        }

        let mut ranked: Vec<(Vec<u32>, MethodCandidate)> = maximal
            .into_iter()
            .map(|m| (self.distances(&m, arg_types), m))
            .collect();
        ranked.sort_by(|(a, _), (b, _)| compare_distances(a, b));

        let best = ranked[0].0.clone();
        let mut tied: Vec<_> = ranked
            .into_iter()
            .take_while(|(d, _)| compare_distances(d, &best) == Ordering::Equal)
            .map(|(_, m)| m)
            .collect();

        if tied.len() == 1 {
            DispatchResult::Resolved(tied.remove(0))
        } else {
            DispatchResult::Ambiguous(tied)
        }
    }

    /// Same arity, and every argument assignable to its parameter.
    pub fn is_applicable(&self, method: &MethodCandidate, arg_types: &[TypeId]) -> bool {
        if method.signature.arity() != arg_types.len() {
            return false;
        }
        arg_types
            .iter()
            .zip(&method.signature.params)
            .all(|(arg, param)| self.registry.is_assignable(*arg, *param))
    }

    /// Whether `m1` dominates `m2`: every parameter of `m1` is a subtype of
    /// the matching parameter of `m2`, and at least one strictly.
    pub fn is_more_specific(&self, m1: &MethodCandidate, m2: &MethodCandidate) -> bool {
        if m1.signature.arity() != m2.signature.arity() {
            return false;
        }

        let mut some_strictly = false;
        for (p1, p2) in m1.signature.params.iter().zip(&m2.signature.params) {
            if !self.registry.is_assignable(*p1, *p2) {
                return false;
            }
            if !self.registry.is_assignable(*p2, *p1) {
                some_strictly = true;
            }
        }
        some_strictly
    }

    fn find_maximal(&self, applicable: Vec<MethodCandidate>) -> Vec<MethodCandidate> {
        let keep: Vec<bool> = applicable
            .iter()
            .enumerate()
            .map(|(i, m)| {
                !applicable
                    .iter()
                    .enumerate()
                    .any(|(j, other)| i != j && self.is_more_specific(other, m))
            })
            .collect();

        applicable
            .into_iter()
            .zip(keep)
            .filter_map(|(m, keep)| keep.then_some(m))
            .collect()
    }

    /// Per-parameter inheritance distance from argument to parameter.
    fn distances(&self, method: &MethodCandidate, arg_types: &[TypeId]) -> Vec<u32> {
        arg_types
            .iter()
            .zip(&method.signature.params)
            .map(|(arg, param)| self.registry.distance(*arg, *param).unwrap_or(u32::MAX))
            .collect()
    }
}

/// Left-to-right comparison by parameter position; the first differing
/// position decides.
fn compare_distances(a: &[u32], b: &[u32]) -> Ordering {
    a.iter()
        .zip(b)
        .map(|(x, y)| x.cmp(y))
        .find(|o| *o != Ordering::Equal)
        .unwrap_or(Ordering::Equal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn make_candidate(name: &str, params: Vec<TypeId>, tag: i64) -> MethodCandidate {
        MethodCandidate {
            signature: Signature::new(name, params),
            implementation: Implementation::constant(tag),
            declaring_type: TypeId::OBJECT,
            origin: EntryOrigin::Native,
        }
    }

    fn params_of(result: &DispatchResult) -> Vec<TypeId> {
        match result {
            DispatchResult::Resolved(m) => m.signature.params.clone(),
            other => panic!("Expected Resolved, got {:?}", other),
        }
    }

    #[test]
    fn test_exact_match() {
        let registry = TypeRegistry::new();
        let resolver = OverloadResolver::new(&registry);

        let candidates = vec![
            make_candidate("sum", vec![TypeId::INT, TypeId::INT], 1),
            make_candidate("sum", vec![TypeId::NUMBER, TypeId::NUMBER], 2),
        ];

        let result = resolver.resolve(&[TypeId::INT, TypeId::INT], candidates.clone());
        assert_eq!(params_of(&result), vec![TypeId::INT, TypeId::INT]);

        let result = resolver.resolve(&[TypeId::DOUBLE, TypeId::DOUBLE], candidates);
        assert_eq!(params_of(&result), vec![TypeId::NUMBER, TypeId::NUMBER]);
    }

    #[test]
    fn test_no_match() {
        let registry = TypeRegistry::new();
        let resolver = OverloadResolver::new(&registry);

        let candidates = vec![make_candidate("sum", vec![TypeId::INT, TypeId::INT], 1)];

        let result = resolver.resolve(&[TypeId::STRING, TypeId::INT], candidates);
        assert!(matches!(result, DispatchResult::NoMatch));
    }

    #[test]
    fn test_arity_mismatch() {
        let registry = TypeRegistry::new();
        let resolver = OverloadResolver::new(&registry);

        let candidates = vec![make_candidate("sum", vec![TypeId::INT, TypeId::INT], 1)];

        let result = resolver.resolve(&[TypeId::INT], candidates);
        assert!(matches!(result, DispatchResult::NoMatch));
    }

    #[test]
    fn test_object_vs_string() {
        let registry = TypeRegistry::new();
        let resolver = OverloadResolver::new(&registry);

        let candidates = vec![
            make_candidate("f", vec![TypeId::OBJECT], 1),
            make_candidate("f", vec![TypeId::STRING], 2),
        ];

        let result = resolver.resolve(&[TypeId::STRING], candidates);
        assert_eq!(params_of(&result), vec![TypeId::STRING]);
    }

    #[test]
    fn test_left_to_right_tie_break() {
        let registry = TypeRegistry::new();
        let resolver = OverloadResolver::new(&registry);

        // Neither dominates; the first parameter decides.
        let candidates = vec![
            make_candidate("g", vec![TypeId::NUMBER, TypeId::INT], 1),
            make_candidate("g", vec![TypeId::INT, TypeId::NUMBER], 2),
        ];

        let result = resolver.resolve(&[TypeId::INT, TypeId::INT], candidates);
        assert_eq!(params_of(&result), vec![TypeId::INT, TypeId::NUMBER]);
    }

    #[test]
    fn test_ambiguous_siblings() {
        let registry = TypeRegistry::new();
        let animal = registry.declare("Animal", &[]).unwrap();
        let pet = registry.declare("Pet", &[]).unwrap();
        let dog = registry.declare("Dog", &[animal, pet]).unwrap();
        let resolver = OverloadResolver::new(&registry);

        let candidates = vec![
            make_candidate("greet", vec![animal], 1),
            make_candidate("greet", vec![pet], 2),
        ];

        match resolver.resolve(&[dog], candidates) {
            DispatchResult::Ambiguous(tied) => assert_eq!(tied.len(), 2),
            other => panic!("Expected Ambiguous, got {:?}", other),
        }
    }

    #[test]
    fn test_null_argument_matches_any_reference_param() {
        let registry = TypeRegistry::new();
        let resolver = OverloadResolver::new(&registry);

        let candidates = vec![
            make_candidate("h", vec![TypeId::STRING], 1),
            make_candidate("h", vec![TypeId::OBJECT], 2),
        ];

        // String dominates Object even though both are at null distance.
        let result = resolver.resolve(&[TypeId::NULL], candidates);
        assert_eq!(params_of(&result), vec![TypeId::STRING]);
    }

    #[test]
    fn test_is_more_specific() {
        let registry = TypeRegistry::new();
        let resolver = OverloadResolver::new(&registry);

        let specific = make_candidate("f", vec![TypeId::INT, TypeId::NUMBER], 1);
        let general = make_candidate("f", vec![TypeId::NUMBER, TypeId::NUMBER], 2);

        assert!(resolver.is_more_specific(&specific, &general));
        assert!(!resolver.is_more_specific(&general, &specific));
        assert!(!resolver.is_more_specific(&general, &general));
    }

    fn builtin() -> impl Strategy<Value = TypeId> {
        prop::sample::select(vec![
            TypeId::OBJECT,
            TypeId::BOOLEAN,
            TypeId::NUMBER,
            TypeId::INT,
            TypeId::DOUBLE,
            TypeId::STRING,
        ])
    }

    proptest! {
        #[test]
        fn test_resolved_is_applicable_and_undominated(
            arg_types in prop::collection::vec(builtin(), 1..3),
            param_sets in prop::collection::vec(prop::collection::vec(builtin(), 1..3), 1..6),
        ) {
            let registry = TypeRegistry::new();
            let resolver = OverloadResolver::new(&registry);

            let mut seen = std::collections::HashSet::new();
            let candidates: Vec<_> = param_sets
                .into_iter()
                .filter(|p| seen.insert(p.clone()))
                .enumerate()
                .map(|(i, p)| make_candidate("f", p, i as i64))
                .collect();

            if let DispatchResult::Resolved(winner) = resolver.resolve(&arg_types, candidates.clone()) {
                prop_assert!(resolver.is_applicable(&winner, &arg_types));
                for other in candidates.iter().filter(|c| resolver.is_applicable(c, &arg_types)) {
                    prop_assert!(!resolver.is_more_specific(other, &winner));
                }
            }
        }

        #[test]
        fn test_exact_signature_always_wins(arg_types in prop::collection::vec(builtin(), 1..4)) {
            prop_assume!(arg_types.iter().any(|t| *t != TypeId::OBJECT));
            let registry = TypeRegistry::new();
            let resolver = OverloadResolver::new(&registry);

            let candidates = vec![
                make_candidate("f", vec![TypeId::OBJECT; arg_types.len()], 0),
                make_candidate("f", arg_types.clone(), 1),
            ];

            let result = resolver.resolve(&arg_types, candidates);
            prop_assert_eq!(params_of(&result), arg_types);
        }
    }
}
