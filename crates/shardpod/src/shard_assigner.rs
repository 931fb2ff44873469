use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::manager_state::ShardManagerState;
use crate::types::{PodAddress, ShardId};

/// A shard only moves when its new owner ends up holding at least this many
/// shards fewer than the old owner held before the move.
pub const MIN_REBALANCE_GAIN: usize = 2;

/// Which shards a rebalance pass considers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AssignmentMode {
    /// Place every unowned shard. No per-pass cap.
    UnassignedFirst,
    /// Move shards off pods holding more than the average. At most
    /// `floor(total_shards * rebalance_rate)` shards move per pass.
    Balance { rebalance_rate: f64 },
}

/// Shard moves computed by one pass, grouped per pod.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebalanceDecision {
    pub assignments: BTreeMap<PodAddress, BTreeSet<ShardId>>,
    pub unassignments: BTreeMap<PodAddress, BTreeSet<ShardId>>,
}

impl RebalanceDecision {
    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty() && self.unassignments.is_empty()
    }

    pub fn moved_shards(&self) -> usize {
        self.assignments.values().map(BTreeSet::len).sum()
    }
}

/// Computes shard reassignments for a [`ShardManagerState`]. Pure, no I/O.
pub struct ShardAssigner;

impl ShardAssigner {
    pub fn decide(state: &ShardManagerState, mode: AssignmentMode) -> RebalanceDecision {
        match mode {
            AssignmentMode::UnassignedFirst => {
                let candidates: Vec<ShardId> = state.unassigned_shards().iter().copied().collect();
                pick_new_pods(state, &candidates, None)
            }
            AssignmentMode::Balance { rebalance_rate } => {
                // No regular rebalancing in the middle of a rolling upgrade.
                if !state.all_pods_have_max_version() {
                    tracing::debug!("skipping balance pass, pods report mixed versions");
                    return RebalanceDecision::default();
                }
                let cap = (state.shards().len() as f64 * rebalance_rate).floor() as usize;
                let candidates = excess_shards(state);
                pick_new_pods(state, &candidates, Some(cap))
            }
        }
    }
}

/// Shards held above the average, ordered by owner: most loaded pod first,
/// then oldest registration, then address. Within a pod the highest shard
/// ids are taken, so low shards (and shard 1 with the singletons) stay put
/// where possible.
fn excess_shards(state: &ShardManagerState) -> Vec<ShardId> {
    let average = state.average_shards_per_pod();
    let mut overloaded: Vec<(&PodAddress, &BTreeSet<ShardId>)> = state
        .shards_per_pod()
        .iter()
        .filter(|(_, shards)| shards.len() > average)
        .collect();
    overloaded.sort_by_key(|(pod, shards)| {
        let registered = state.pods().get(*pod).map(|p| p.registered);
        (Reverse(shards.len()), registered, *pod)
    });

    overloaded
        .into_iter()
        .flat_map(|(_, shards)| shards.iter().rev().take(shards.len() - average).copied())
        .collect()
}

fn pick_new_pods(
    state: &ShardManagerState,
    candidates: &[ShardId],
    cap: Option<usize>,
) -> RebalanceDecision {
    let mut counts: HashMap<&PodAddress, usize> = state
        .shards_per_pod()
        .iter()
        .map(|(pod, shards)| (pod, shards.len()))
        .collect();
    let eligible = state.pods_at_max_version();
    let mut losers: HashSet<&PodAddress> = HashSet::new();
    let mut received: HashMap<&PodAddress, usize> = HashMap::new();
    let mut decision = RebalanceDecision::default();
    let mut moved = 0usize;

    for &shard in candidates {
        if cap.is_some_and(|cap| moved >= cap) {
            break;
        }

        let target = eligible
            .iter()
            .copied()
            .filter(|pod| !losers.contains(pod))
            .filter(|pod| cap.map_or(true, |cap| received.get(pod).copied().unwrap_or(0) < cap))
            .min_by(|a, b| {
                let count_a = counts.get(a).copied().unwrap_or(0);
                let count_b = counts.get(b).copied().unwrap_or(0);
                count_a.cmp(&count_b).then_with(|| a.cmp(b))
            });
        let Some(target) = target else {
            continue;
        };

        let old = state.owner(shard);
        if old == Some(target) {
            continue;
        }
        let target_count = counts.get(target).copied().unwrap_or(0);
        let old_count = old
            .map(|pod| counts.get(pod).copied().unwrap_or(0))
            .unwrap_or(usize::MAX);
        if target_count.saturating_add(MIN_REBALANCE_GAIN) > old_count {
            continue;
        }

        *counts.entry(target).or_insert(0) += 1;
        *received.entry(target).or_insert(0) += 1;
        decision
            .assignments
            .entry(target.clone())
            .or_default()
            .insert(shard);
        if let Some(old) = old {
            if let Some(count) = counts.get_mut(old) {
                *count = count.saturating_sub(1);
            }
            losers.insert(old);
            decision
                .unassignments
                .entry(old.clone())
                .or_default()
                .insert(shard);
        }
        moved += 1;
    }

    decision
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pod::{Pod, PodWithMetadata};
    use chrono::{Duration, Utc};

    fn addr(port: u16) -> PodAddress {
        PodAddress::new("localhost", port)
    }

    fn state_with(number_of_shards: u32, pods: &[(u16, &str)]) -> ShardManagerState {
        let base = Utc::now();
        pods.iter()
            .enumerate()
            .fold(ShardManagerState::empty(number_of_shards), |state, (i, (port, version))| {
                state.with_pod(PodWithMetadata::new(
                    Pod::new(addr(*port), *version),
                    base + Duration::seconds(i as i64),
                ))
            })
    }

    fn assign_range(state: ShardManagerState, port: u16, shards: std::ops::RangeInclusive<u32>) -> ShardManagerState {
        let ids: Vec<ShardId> = shards.map(ShardId).collect();
        state.with_shards(&ids, Some(&addr(port)))
    }

    fn apply(state: &ShardManagerState, decision: &RebalanceDecision) -> ShardManagerState {
        let mut next = state.clone();
        for shards in decision.unassignments.values() {
            next = next.with_shards(shards, None);
        }
        for (pod, shards) in &decision.assignments {
            next = next.with_shards(shards, Some(pod));
        }
        next
    }

    #[test]
    fn unassigned_shards_are_spread_evenly() {
        let state = state_with(10, &[(1, "1.0.0"), (2, "1.0.0")]);
        let decision = ShardAssigner::decide(&state, AssignmentMode::UnassignedFirst);
        assert!(decision.unassignments.is_empty());
        assert_eq!(decision.assignments[&addr(1)].len(), 5);
        assert_eq!(decision.assignments[&addr(2)].len(), 5);
    }

    #[test]
    fn unassigned_mode_ignores_rebalance_cap() {
        let state = state_with(300, &[(1, "1.0.0")]);
        let decision = ShardAssigner::decide(&state, AssignmentMode::UnassignedFirst);
        assert_eq!(decision.moved_shards(), 300);
    }

    #[test]
    fn no_pods_no_assignments() {
        let state = ShardManagerState::empty(10);
        assert!(ShardAssigner::decide(&state, AssignmentMode::UnassignedFirst).is_empty());
        assert!(ShardAssigner::decide(&state, AssignmentMode::Balance { rebalance_rate: 1.0 }).is_empty());
    }

    #[test]
    fn balance_moves_excess_to_new_pod() {
        let state = state_with(10, &[(1, "1.0.0"), (2, "1.0.0")]);
        let state = assign_range(state, 1, 1..=10);
        let decision = ShardAssigner::decide(&state, AssignmentMode::Balance { rebalance_rate: 1.0 });
        assert_eq!(decision.unassignments[&addr(1)].len(), 5);
        assert_eq!(decision.assignments[&addr(2)], decision.unassignments[&addr(1)]);
        // highest shards move first
        assert!(decision.assignments[&addr(2)].contains(&ShardId(10)));
        assert!(!decision.assignments[&addr(2)].contains(&ShardId(1)));
    }

    #[test]
    fn balance_respects_rebalance_rate() {
        let state = state_with(100, &[(1, "1.0.0"), (2, "1.0.0")]);
        let state = assign_range(state, 1, 1..=100);
        let decision = ShardAssigner::decide(&state, AssignmentMode::Balance { rebalance_rate: 0.1 });
        assert_eq!(decision.moved_shards(), 10);
    }

    #[test]
    fn balance_skips_low_value_moves() {
        // 6 vs 5: moving one shard would only swap the imbalance.
        let state = state_with(11, &[(1, "1.0.0"), (2, "1.0.0")]);
        let state = assign_range(state, 1, 1..=6);
        let state = assign_range(state, 2, 7..=11);
        let decision = ShardAssigner::decide(&state, AssignmentMode::Balance { rebalance_rate: 1.0 });
        assert!(decision.is_empty(), "{decision:?}");
    }

    #[test]
    fn mixed_versions_block_balancing() {
        let state = state_with(10, &[(1, "1.0.0"), (2, "1.1.0")]);
        let state = assign_range(state, 1, 1..=10);
        let decision = ShardAssigner::decide(&state, AssignmentMode::Balance { rebalance_rate: 1.0 });
        assert!(decision.is_empty());
    }

    #[test]
    fn unassigned_shards_go_to_max_version_pods_only() {
        let state = state_with(6, &[(1, "1.0.0"), (2, "2.0.0")]);
        let decision = ShardAssigner::decide(&state, AssignmentMode::UnassignedFirst);
        assert_eq!(decision.assignments.len(), 1);
        assert_eq!(decision.assignments[&addr(2)].len(), 6);
    }

    #[test]
    fn pod_losing_a_shard_does_not_gain_in_same_pass() {
        let state = state_with(9, &[(1, "1"), (2, "1"), (3, "1")]);
        let state = assign_range(state, 1, 1..=5);
        let state = assign_range(state, 2, 6..=9);
        let decision = ShardAssigner::decide(&state, AssignmentMode::Balance { rebalance_rate: 1.0 });
        for pod in decision.unassignments.keys() {
            assert!(!decision.assignments.contains_key(pod), "{decision:?}");
        }
        assert!(decision.assignments.contains_key(&addr(3)));
    }

    #[test]
    fn ties_break_by_address() {
        let state = state_with(1, &[(3, "1"), (1, "1"), (2, "1")]);
        let decision = ShardAssigner::decide(&state, AssignmentMode::UnassignedFirst);
        assert_eq!(decision.assignments[&addr(1)], BTreeSet::from([ShardId(1)]));
    }

    #[test]
    fn decisions_are_deterministic() {
        let state = state_with(50, &[(1, "1"), (2, "1"), (3, "1"), (4, "1")]);
        let state = assign_range(state, 1, 1..=30);
        let state = assign_range(state, 2, 31..=50);
        let mode = AssignmentMode::Balance { rebalance_rate: 1.0 };
        assert_eq!(ShardAssigner::decide(&state, mode), ShardAssigner::decide(&state, mode));
    }

    #[test]
    fn applied_decision_keeps_single_owner_per_shard() {
        let state = state_with(30, &[(1, "1"), (2, "1"), (3, "1")]);
        let state = assign_range(state, 1, 1..=20);
        let decision = ShardAssigner::decide(&state, AssignmentMode::Balance { rebalance_rate: 1.0 });
        let next = apply(&state, &decision);
        let owned: usize = next.shards_per_pod().values().map(BTreeSet::len).sum();
        assert_eq!(owned + next.unassigned_shards().len(), 30);
    }
}
