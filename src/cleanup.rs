use anyhow::Result;
use tracing::{debug, warn};

type CleanupAction = Box<dyn FnOnce() -> Result<()> + Send>;

/// Deterministic teardown of ephemeral resources. Actions run LIFO, each at
/// most once; a failing action is logged and never blocks the rest.
#[derive(Default)]
pub struct CleanupStack {
    actions: Vec<(String, CleanupAction)>,
}

impl CleanupStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        label: impl Into<String>,
        action: impl FnOnce() -> Result<()> + Send + 'static,
    ) {
        let label = label.into();
        debug!(cleanup = %label, "Registered cleanup action");
        self.actions.push((label, Box::new(action)));
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Drain and run every registered action. Draining makes a second call a
    /// no-op, so each teardown is attempted exactly once.
    pub fn run_all(&mut self) {
        for (label, action) in self.actions.drain(..).rev() {
            match action() {
                Ok(()) => debug!(cleanup = %label, "Cleanup action finished"),
                Err(err) => warn!(cleanup = %label, error = %err, "Cleanup action failed"),
            }
        }
    }
}
