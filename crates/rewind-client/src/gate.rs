use tracing::warn;

/// Whether the app is showing its newest state or a historical one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GateState {
    Live,
    Historical,
}

/// Version counters deciding whether new local changes may happen.
///
/// Invariant: `current <= latest`. Not synchronized on its own; the owner
/// keeps it behind the same lock it uses to order outbound notifications.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SequenceGate {
    current: u64,
    latest: u64,
}

impl SequenceGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> u64 {
        self.current
    }

    pub fn latest(&self) -> u64 {
        self.latest
    }

    pub fn may_proceed(&self) -> bool {
        self.current == self.latest
    }

    pub fn state(&self) -> GateState {
        if self.may_proceed() {
            GateState::Live
        } else {
            GateState::Historical
        }
    }

    /// Account for one accepted change. Always leaves the gate live.
    pub fn record_change(&mut self) {
        self.latest += 1;
        self.current = self.latest;
    }

    /// View version `target`. Jumping to `latest` returns to live.
    ///
    /// Targets past `latest` are clamped; versions that were never produced
    /// cannot be viewed.
    pub fn jump_to(&mut self, target: u64) {
        if target > self.latest {
            warn!(target, latest = self.latest, "jump target beyond latest version, clamping");
        }
        self.current = target.min(self.latest);
    }

    /// Fork history at the viewed version. Everything after `current` is
    /// forgotten and the gate is live again.
    pub fn commit(&mut self) {
        self.latest = self.current;
    }
}
