//! Cooperative interruption of a running step.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Shared flag raised by the Ctrl-C handler and polled by step loops.
///
/// Workers already running are not cancelled; the orchestrator notices the
/// flag between outcomes and stops scheduling new work.
#[derive(Debug, Clone, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_the_flag() {
        let interrupt = Interrupt::new();
        let handler = interrupt.clone();
        assert!(!interrupt.is_set());

        handler.trigger();
        assert!(interrupt.is_set());
        assert!(handler.is_set());
        assert!(!Interrupt::new().is_set());
    }
}
