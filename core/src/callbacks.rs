//! Hooks fired on state transitions
//!
//! Only the caller whose compare-and-swap applied a transition fires the
//! hook, so each transition is reported once across every process sharing
//! the key.

use crate::CircuitState;
use std::sync::Arc;

/// A transition that this process applied to the shared record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange<'a> {
    pub circuit: &'a str,
    pub from: CircuitState,
    pub to: CircuitState,
    /// Milliseconds since the UNIX epoch
    pub at: u64,
}

pub type Hook = Arc<dyn Fn(&StateChange<'_>) + Send + Sync>;

pub(crate) fn hook<F>(f: F) -> Hook
where
    F: Fn(&StateChange<'_>) + Send + Sync + 'static,
{
    Arc::new(f)
}

#[derive(Clone, Default)]
pub struct Callbacks {
    pub on_open: Option<Hook>,
    pub on_close: Option<Hook>,
    pub on_half_open: Option<Hook>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn fire(&self, change: &StateChange<'_>) {
        tracing::info!(
            circuit = change.circuit,
            from = %change.from,
            to = %change.to,
            "circuit state changed"
        );

        let selected = match change.to {
            CircuitState::Open => &self.on_open,
            CircuitState::Closed => &self.on_close,
            CircuitState::HalfOpen => &self.on_half_open,
        };
        if let Some(callback) = selected {
            callback(change);
        }
    }
}

impl std::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_open", &self.on_open.is_some())
            .field("on_close", &self.on_close.is_some())
            .field("on_half_open", &self.on_half_open.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_fire_dispatches_by_target_state() {
        let opens = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));

        let opens_hook = opens.clone();
        let closes_hook = closes.clone();
        let callbacks = Callbacks {
            on_open: Some(hook(move |change| {
                assert_eq!(change.circuit, "api");
                opens_hook.fetch_add(1, Ordering::SeqCst);
            })),
            on_close: Some(hook(move |_| {
                closes_hook.fetch_add(1, Ordering::SeqCst);
            })),
            on_half_open: None,
        };

        let change = StateChange {
            circuit: "api",
            from: CircuitState::Closed,
            to: CircuitState::Open,
            at: 0,
        };
        callbacks.fire(&change);
        callbacks.fire(&StateChange {
            from: CircuitState::Open,
            to: CircuitState::HalfOpen,
            ..change
        });

        assert_eq!(opens.load(Ordering::SeqCst), 1);
        assert_eq!(closes.load(Ordering::SeqCst), 0);
    }
}
