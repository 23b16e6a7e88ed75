//! Routing filters
//!
//! Composable predicates over `NetworkMember` plus random peer selection.
//! Every send path goes through `select_peers`, which guarantees the
//! recipient set is a subset of the current membership matching the filter.

use rand::seq::SliceRandom;
use skein_model::NetworkMember;
use std::sync::Arc;

/// Predicate deciding whether a member is a routing candidate.
pub type RoutingFilter = Arc<dyn Fn(&NetworkMember) -> bool + Send + Sync>;

/// Filter matching every member.
pub fn select_all() -> RoutingFilter {
    Arc::new(|_| true)
}

/// Conjunction of two filters.
pub fn combine(a: RoutingFilter, b: RoutingFilter) -> RoutingFilter {
    Arc::new(move |member| a(member) && b(member))
}

/// Up to `k` members matching the filter, chosen uniformly at random
/// without replacement.
pub fn select_peers(k: usize, members: &[NetworkMember], filter: &RoutingFilter) -> Vec<NetworkMember> {
    let mut candidates: Vec<NetworkMember> = members
        .iter()
        .filter(|member| filter(member))
        .cloned()
        .collect();
    let mut rng = rand::thread_rng();
    candidates.shuffle(&mut rng);
    candidates.truncate(k);
    candidates
}
