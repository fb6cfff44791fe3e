//! Decides when to ask for (or force) a snapshot, and truncates the log
//! once one is installed, per section 4.7.
//!
//! Grounded on the teacher crate's `log::Log::register_callback`
//! size-change hook, generalized from "truncate when count crosses a
//! fixed constant" to the ratio-based ask/force logic this protocol
//! specifies. The benchmark shortcut the original used (an unconditional
//! truncation once the log crosses a fixed byte count) is deliberately
//! not reproduced here — see DESIGN.md.

use crate::paxos::log::{Log, Snapshot};
use crate::paxos::ordering::InstanceId;

/// Parameters governing when `SnapshotMaintainer` asks for, or forces, a
/// new snapshot.
#[derive(Debug, Clone, Copy)]
pub struct SnapshotConfig {
    pub min_log_size: usize,
    pub ask_ratio: f64,
    pub force_ratio: f64,
    pub min_sampling_instances: usize,
    pub first_estimate_bytes: usize,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            min_log_size: 64 * 1024,
            ask_ratio: 2.0,
            force_ratio: 4.0,
            min_sampling_instances: 16,
            first_estimate_bytes: 4096,
        }
    }
}

/// What the maintainer wants the dispatcher to do, if anything, after a
/// log size change.
pub enum SnapshotAction {
    None,
    Ask(InstanceId),
    Force(InstanceId),
}

/// Decides when to ask for or force a snapshot, tracking a moving
/// average of snapshot byte size to judge the log/snapshot size ratio.
pub struct SnapshotMaintainer {
    config: SnapshotConfig,
    estimate: f64,
    last_snapshot_instance_id: InstanceId,
    last_sampling_id: InstanceId,
    asked: bool,
    forced: bool,
}

const ESTIMATE_SMOOTHING: f64 = 0.75;

impl SnapshotMaintainer {
    pub fn new(config: SnapshotConfig) -> Self {
        let estimate = config.first_estimate_bytes as f64;
        Self {
            config,
            estimate,
            last_snapshot_instance_id: InstanceId::ZERO,
            last_sampling_id: InstanceId::ZERO,
            asked: false,
            forced: false,
        }
    }

    /// Called whenever the log's approximate size changes; decides
    /// whether to ask for or force a snapshot at `first_uncommitted`.
    ///
    /// Gated by the sampling rate: the ratio check itself (computing
    /// `byte_size_between`, an O(log) scan) only runs once at least
    /// `min_sampling_instances` have been appended since the last time it
    /// ran, so a busy log is not re-measured on every single append.
    pub fn on_log_size_changed(&mut self, log: &Log) -> SnapshotAction {
        let next_id = log.get_next_id();
        if i64::from(next_id) - i64::from(self.last_sampling_id) < self.config.min_sampling_instances as i64 {
            return SnapshotAction::None;
        }
        self.last_sampling_id = next_id;

        let log_bytes = log.byte_size_between(self.last_snapshot_instance_id, log.get_first_uncommitted());
        if log_bytes < self.config.min_log_size {
            return SnapshotAction::None;
        }

        let ratio = log_bytes as f64 / self.estimate.max(1.0);

        if !self.asked && ratio >= self.config.ask_ratio {
            self.asked = true;
            return SnapshotAction::Ask(self.last_snapshot_instance_id);
        }

        if self.asked && !self.forced && ratio >= self.config.force_ratio {
            self.forced = true;
            return SnapshotAction::Force(self.last_snapshot_instance_id);
        }

        SnapshotAction::None
    }

    /// Called once a new snapshot has been produced (locally or
    /// installed from a peer). Drops snapshots that do not advance
    /// `next_instance_id`, truncates the log below the previous
    /// watermark otherwise, and updates the moving-average estimate.
    pub fn on_snapshot_made(&mut self, snapshot: &Snapshot, log: &mut Log) {
        if snapshot.next_instance_id <= self.last_snapshot_instance_id {
            return;
        }

        let previous = self.last_snapshot_instance_id;
        self.last_snapshot_instance_id = snapshot.next_instance_id;
        log.truncate_below(previous.max(snapshot.next_instance_id));

        self.estimate = ESTIMATE_SMOOTHING * self.estimate + (1.0 - ESTIMATE_SMOOTHING) * snapshot.byte_size() as f64;
        self.asked = false;
        self.forced = false;
    }

    pub fn last_snapshot_instance_id(&self) -> InstanceId {
        self.last_snapshot_instance_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paxos::collections;
    use crate::paxos::ordering::View;

    fn config() -> SnapshotConfig {
        SnapshotConfig { min_log_size: 10, ask_ratio: 2.0, force_ratio: 4.0, min_sampling_instances: 1, first_estimate_bytes: 10 }
    }

    #[test]
    fn asks_once_ratio_crosses_threshold_then_forces() {
        let mut maintainer = SnapshotMaintainer::new(config());
        let mut log = Log::new();
        for _ in 0..10 {
            let id = log.append(View::ZERO, vec![0u8; 16]);
            log.set_decided(id, View::ZERO, vec![0u8; 16]).unwrap();
        }

        match maintainer.on_log_size_changed(&log) {
            SnapshotAction::Ask(_) => {}
            _ => panic!("expected an ask"),
        }

        for _ in 0..10 {
            let id = log.append(View::ZERO, vec![0u8; 16]);
            log.set_decided(id, View::ZERO, vec![0u8; 16]).unwrap();
        }

        match maintainer.on_log_size_changed(&log) {
            SnapshotAction::Force(_) => {}
            other => panic!("expected a force, got a different action: {}", matches!(other, SnapshotAction::None)),
        }
    }

    #[test]
    fn sampling_gate_suppresses_the_ratio_check_between_rounds() {
        let config = SnapshotConfig { min_sampling_instances: 5, ..config() };
        let mut maintainer = SnapshotMaintainer::new(config);
        let mut log = Log::new();
        for _ in 0..4 {
            let id = log.append(View::ZERO, vec![0u8; 16]);
            log.set_decided(id, View::ZERO, vec![0u8; 16]).unwrap();
        }
        assert!(matches!(maintainer.on_log_size_changed(&log), SnapshotAction::None));

        let id = log.append(View::ZERO, vec![0u8; 16]);
        log.set_decided(id, View::ZERO, vec![0u8; 16]).unwrap();
        match maintainer.on_log_size_changed(&log) {
            SnapshotAction::Ask(_) => {}
            _ => panic!("expected the gate to open at the 5th instance"),
        }
    }

    #[test]
    fn installing_a_snapshot_truncates_and_resets_flags() {
        let mut maintainer = SnapshotMaintainer::new(config());
        let mut log = Log::new();
        log.append(View::ZERO, vec![0u8; 4]);
        let snapshot = Snapshot { next_instance_id: InstanceId::from(1i64), last_replies: collections::hash_map(), value: vec![0u8; 4] };
        maintainer.on_snapshot_made(&snapshot, &mut log);
        assert_eq!(maintainer.last_snapshot_instance_id(), InstanceId::from(1i64));
        assert!(log.is_truncated(InstanceId::ZERO));
    }
}
