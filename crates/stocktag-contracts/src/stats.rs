use serde::{Deserialize, Serialize};

/// Outcome counts for one batch run. Created empty, incremented once per
/// item, handed back to the menu layer for display, never persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchStats {
    pub total: u64,
    pub success: u64,
    pub failed: u64,
}

impl BatchStats {
    pub fn record_success(&mut self) {
        self.success += 1;
    }

    pub fn record_failure(&mut self) {
        self.failed += 1;
    }
}
