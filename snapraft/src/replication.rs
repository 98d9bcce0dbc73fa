use crate::message::ReplicaID;
use std::collections::BTreeMap;

// Progress of a single follower as seen by the leader.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Progress {
    // Index of the next log entry to send to the follower.
    pub next_index: u64,
    // Index of the highest log entry known to be replicated on the follower.
    pub match_index: u64,
}

// ReplicationManager tracks per-follower progress while the replica leads.
// Replies may arrive reordered or duplicated, so match_index only moves
// forward and next_index never drops to or below match_index.
//
// A follower whose removal committed is kept as a retiring target until it
// acknowledges the removal entry, so that it learns it is out of the
// cluster instead of timing out and campaigning.
#[derive(Default)]
pub struct ReplicationManager {
    progress: BTreeMap<ReplicaID, Progress>,
    // Retiring follower -> index of the entry that removed it.
    retiring: BTreeMap<ReplicaID, u64>,
}

impl ReplicationManager {
    pub fn new() -> ReplicationManager {
        ReplicationManager::default()
    }

    // Start over after winning an election.
    pub fn reset(&mut self, targets: &[ReplicaID], next_index: u64) {
        self.clear();
        self.sync_targets(targets, next_index);
    }

    pub fn clear(&mut self) {
        self.progress.clear();
        self.retiring.clear();
    }

    // Add newly joined targets and forget removed ones. Retiring targets stay
    // until they catch up or are forgotten.
    pub fn sync_targets(&mut self, targets: &[ReplicaID], next_index: u64) {
        self.retiring.retain(|id, _| !targets.contains(id));
        let retiring = &self.retiring;
        self.progress
            .retain(|id, _| targets.contains(id) || retiring.contains_key(id));
        for id in targets {
            self.progress.entry(*id).or_insert(Progress {
                next_index,
                match_index: 0,
            });
        }
    }

    // Keep replicating to `id` until its match index reaches `index`.
    pub fn retire(&mut self, id: ReplicaID, index: u64) {
        if self.progress.contains_key(&id) {
            self.retiring.insert(id, index);
        }
    }

    pub fn is_retiring(&self, id: ReplicaID) -> bool {
        self.retiring.contains_key(&id)
    }

    pub fn forget(&mut self, id: ReplicaID) {
        self.progress.remove(&id);
        self.retiring.remove(&id);
    }

    pub fn targets(&self) -> Vec<ReplicaID> {
        self.progress.keys().copied().collect()
    }

    pub fn progress(&self, id: ReplicaID) -> Option<Progress> {
        self.progress.get(&id).copied()
    }

    // Returns true if the follower's match index moved.
    pub fn record_success(&mut self, id: ReplicaID, match_index: u64) -> bool {
        let (advanced, matched) = match self.progress.get_mut(&id) {
            Some(progress) => {
                let advanced = match_index > progress.match_index;
                progress.match_index = progress.match_index.max(match_index);
                progress.next_index = progress.next_index.max(progress.match_index + 1);
                (advanced, progress.match_index)
            }
            None => return false,
        };

        if self.retiring.get(&id).map_or(false, |index| matched >= *index) {
            self.forget(id);
        }
        advanced
    }

    // Back off after a failed consistency check, jumping straight to the
    // follower's hint when it is lower than a one-step decrement.
    pub fn record_failure(&mut self, id: ReplicaID, hint: u64) {
        if let Some(progress) = self.progress.get_mut(&id) {
            let next = hint.min(progress.next_index.saturating_sub(1)).max(1);
            progress.next_index = next.max(progress.match_index + 1);
        }
    }

    // Highest index replicated on a majority of `voters`. The leader's own
    // log counts with `leader_last_index` when it is itself a voter.
    pub fn quorum_match_index(&self, voters: &[ReplicaID], leader_id: ReplicaID, leader_last_index: u64) -> u64 {
        if voters.is_empty() {
            return 0;
        }

        let mut matched: Vec<u64> = voters
            .iter()
            .map(|id| {
                if *id == leader_id {
                    leader_last_index
                } else {
                    self.progress.get(id).map_or(0, |p| p.match_index)
                }
            })
            .collect();
        matched.sort_unstable_by(|a, b| b.cmp(a));

        matched[voters.len() / 2]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_advances_and_ignores_stale_replies() {
        let mut replication = ReplicationManager::new();
        replication.reset(&[2, 3], 5);

        assert!(replication.record_success(2, 7));
        assert!(!replication.record_success(2, 6));
        assert_eq!(
            replication.progress(2),
            Some(Progress {
                next_index: 8,
                match_index: 7
            })
        );
    }

    #[test]
    fn failure_backs_off_to_hint_but_not_below_match() {
        let mut replication = ReplicationManager::new();
        replication.reset(&[2], 10);

        replication.record_failure(2, 4);
        assert_eq!(replication.progress(2).unwrap().next_index, 4);

        replication.record_failure(2, 100);
        assert_eq!(replication.progress(2).unwrap().next_index, 3);

        replication.record_success(2, 2);
        replication.record_failure(2, 1);
        assert_eq!(replication.progress(2).unwrap().next_index, 3);
    }

    #[test]
    fn quorum_match_index_takes_majority() {
        let mut replication = ReplicationManager::new();
        replication.reset(&[2, 3, 4, 5], 1);
        replication.record_success(2, 8);
        replication.record_success(3, 5);
        replication.record_success(4, 3);

        assert_eq!(replication.quorum_match_index(&[1, 2, 3, 4, 5], 1, 10), 5);
        // a joining target is replicated to but not counted
        assert_eq!(replication.quorum_match_index(&[1, 4, 5], 1, 10), 3);
    }

    #[test]
    fn retiring_target_stays_until_it_matches() {
        let mut replication = ReplicationManager::new();
        replication.reset(&[2, 3], 5);
        replication.retire(3, 6);
        replication.sync_targets(&[2], 7);

        assert_eq!(replication.targets(), vec![2, 3]);
        assert!(replication.is_retiring(3));
        // never counted once removed
        assert_eq!(replication.quorum_match_index(&[1, 2], 1, 6), 0);

        replication.record_success(3, 5);
        assert!(replication.is_retiring(3));
        replication.record_success(3, 6);
        assert!(replication.progress(3).is_none());
        assert!(!replication.is_retiring(3));
    }

    #[test]
    fn re_added_target_is_no_longer_retiring() {
        let mut replication = ReplicationManager::new();
        replication.reset(&[2, 3], 5);
        replication.retire(3, 6);
        replication.sync_targets(&[2, 3], 8);

        assert!(!replication.is_retiring(3));
        replication.record_success(3, 7);
        assert_eq!(replication.progress(3).map(|p| p.match_index), Some(7));
    }

    #[test]
    fn sync_targets_adds_and_removes() {
        let mut replication = ReplicationManager::new();
        replication.reset(&[2, 3], 4);
        replication.record_success(2, 3);
        replication.sync_targets(&[2, 4], 6);

        assert_eq!(replication.targets(), vec![2, 4]);
        assert_eq!(replication.progress(2).unwrap().match_index, 3);
        assert_eq!(replication.progress(4).unwrap().next_index, 6);
    }
}
