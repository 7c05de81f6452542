//! Ambient context threaded through every engine instead of global state
//! (teacher precedent: `BackupOrchestrator` already holds all managers
//! behind one struct; this generalizes the same shape to cooperative
//! cancellation).

use tokio_util::sync::CancellationToken;

#[derive(Clone, Default)]
pub struct Context {
    pub cancel: CancellationToken,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
