//! Property-based tests for cache keys, matchers and the pagination coordinator.
//!
//! # Properties Tested
//!
//! 1. **Order Property**: parameter insertion order never changes key identity
//! 2. **Sentinel Property**: `0` and `""` parameters never change key identity
//! 3. **Matcher Property**: a matcher selects keys by prefix and parameter subset
//! 4. **Reset Property**: any filter change sends the coordinator to page 1

use proptest::prelude::*;
use query_kit::{CacheKey, KeyMatcher, PaginationFilter, ParamValue, QueryParams};
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

fn hash_of(key: &CacheKey) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

// ============================================================================
// Strategies
// ============================================================================

fn arb_prefix() -> impl Strategy<Value = String> {
    "[a-z][a-zA-Z]{0,12}"
}

fn arb_value() -> impl Strategy<Value = ParamValue> {
    prop_oneof![
        any::<bool>().prop_map(ParamValue::Bool),
        any::<i64>().prop_map(ParamValue::Int),
        "[a-z0-9 ]{0,8}".prop_map(ParamValue::Str),
    ]
}

fn arb_active_value() -> impl Strategy<Value = ParamValue> {
    arb_value().prop_filter("active values only", ParamValue::is_active)
}

/// Distinct parameter names with arbitrary values
fn arb_params() -> impl Strategy<Value = Vec<(String, ParamValue)>> {
    prop::collection::btree_map("[a-z]{1,6}", arb_value(), 0..6)
        .prop_map(|map| map.into_iter().collect())
}

// ============================================================================
// Property 1: Order Property
// ============================================================================

proptest! {
    /// Property: keys built from the same pairs in any order are equal and hash equally
    #[test]
    fn prop_key_order_independent(prefix in arb_prefix(), pairs in arb_params()) {
        let forward = CacheKey::with_params(prefix.clone(), pairs.iter().cloned().collect());
        let backward = CacheKey::with_params(prefix, pairs.iter().rev().cloned().collect());

        prop_assert_eq!(&forward, &backward);
        prop_assert_eq!(hash_of(&forward), hash_of(&backward));
        prop_assert_eq!(forward.to_string(), backward.to_string());
    }

    /// Property: the builder and the map constructor agree
    #[test]
    fn prop_key_builder_matches_params(prefix in arb_prefix(), pairs in arb_params()) {
        let built = pairs
            .iter()
            .fold(CacheKey::new(prefix.clone()), |key, (name, value)| {
                key.param(name.clone(), value.clone())
            });
        let mapped = CacheKey::with_params(prefix, pairs.into_iter().collect());

        prop_assert_eq!(built, mapped);
    }
}

// ============================================================================
// Property 2: Sentinel Property
// ============================================================================

proptest! {
    /// Property: adding "no filter" sentinels leaves the key unchanged
    #[test]
    fn prop_inactive_params_dropped(
        prefix in arb_prefix(),
        pairs in arb_params(),
        sentinel in "[A-Z]{1,6}",
        empty in any::<bool>(),
    ) {
        let params: QueryParams = pairs.iter().cloned().collect();
        let padded = params.clone().with(
            sentinel,
            if empty { ParamValue::Str(String::new()) } else { ParamValue::Int(0) },
        );

        prop_assert_eq!(
            CacheKey::with_params(prefix.clone(), params),
            CacheKey::with_params(prefix, padded)
        );
    }

    /// Property: a key never carries an inactive parameter
    #[test]
    fn prop_key_params_all_active(prefix in arb_prefix(), pairs in arb_params()) {
        let key = CacheKey::with_params(prefix, pairs.into_iter().collect());
        prop_assert!(key.params().iter().all(|(_, value)| value.is_active()));
    }
}

// ============================================================================
// Property 3: Matcher Property
// ============================================================================

proptest! {
    /// Property: a bare prefix matcher selects every key of its prefix and no other
    #[test]
    fn prop_prefix_matcher(
        prefix in arb_prefix(),
        other in arb_prefix(),
        pairs in arb_params(),
    ) {
        let key = CacheKey::with_params(prefix.clone(), pairs.into_iter().collect());

        prop_assert!(KeyMatcher::prefix(prefix.clone()).matches(&key));
        prop_assert!(key.matcher().matches(&key));
        prop_assert_eq!(KeyMatcher::prefix(other.clone()).matches(&key), other == prefix);
    }

    /// Property: a narrowed matcher selects a key iff the key carries the parameter
    #[test]
    fn prop_param_matcher(
        prefix in arb_prefix(),
        pairs in arb_params(),
        name in "[a-z]{1,6}",
        value in arb_active_value(),
    ) {
        let params: BTreeMap<String, ParamValue> = pairs.into_iter().collect();
        let key = CacheKey::with_params(prefix.clone(), params.clone().into_iter().collect());
        let matcher = KeyMatcher::prefix(prefix).param(name.clone(), value.clone());

        let carries = key.params().get(&name) == Some(&value);
        prop_assert_eq!(matcher.matches(&key), carries);
    }
}

// ============================================================================
// Property 4: Reset Property
// ============================================================================

proptest! {
    /// Property: replacing the filters always lands on page 1 and keeps the size
    #[test]
    fn prop_filter_change_resets_page(
        page in 1u32..500,
        size in 1u32..100,
        filters in arb_params(),
    ) {
        let mut coordinator = PaginationFilter::new(page, size, Vec::<(String, i64)>::new())
            .expect("Valid page and size");
        coordinator.set_filters(filters);

        prop_assert_eq!(coordinator.page(), 1);
        prop_assert_eq!(coordinator.size(), size);
    }

    /// Property: the coordinator's key always carries its page and size
    #[test]
    fn prop_coordinator_key_has_paging(page in 1u32..500, size in 1u32..100) {
        let coordinator = PaginationFilter::new(page, size, Vec::<(String, i64)>::new())
            .expect("Valid page and size");
        let key = coordinator.key("annDiscounts");

        prop_assert_eq!(key.params().get("page"), Some(&ParamValue::from(page)));
        prop_assert_eq!(key.params().get("size"), Some(&ParamValue::from(size)));
    }
}
