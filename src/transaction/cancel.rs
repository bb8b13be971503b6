//! Cancellation signals and the bridge the coordinator races against.
//!
//! [`AbortController`] / [`AbortSignal`] are the external signal: whoever
//! owns the controller may fire it at any time, from any task. A
//! [`CancellationBridge`] adapts one signal to the single frame it was
//! attached to.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

#[derive(Debug, Default)]
struct SignalState {
    aborted: AtomicBool,
    notify: Notify,
}

/// Read side of an abort signal. Cheap to clone; all clones observe the same
/// state.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    state: Arc<SignalState>,
}

impl AbortSignal {
    /// A signal that has already fired.
    pub fn already_aborted() -> Self {
        let signal = Self::default();
        signal.fire();
        signal
    }

    /// A signal that fires once `duration` has elapsed.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn timeout(duration: Duration) -> Self {
        let controller = AbortController::new();
        controller.abort_after(duration);
        controller.signal()
    }

    /// Whether the signal has fired. Once true, stays true.
    pub fn is_aborted(&self) -> bool {
        self.state.aborted.load(Ordering::Acquire)
    }

    /// Resolve once the signal has fired.
    pub async fn aborted(&self) {
        let notified = self.state.notify.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a concurrent fire is not lost.
        notified.as_mut().enable();
        if self.is_aborted() {
            return;
        }
        notified.await;
    }

    fn fire(&self) -> bool {
        let first = !self.state.aborted.swap(true, Ordering::AcqRel);
        if first {
            self.state.notify.notify_waiters();
        }
        first
    }
}

/// Write side of an abort signal.
#[derive(Debug, Clone, Default)]
pub struct AbortController {
    signal: AbortSignal,
}

impl AbortController {
    pub fn new() -> Self {
        Self::default()
    }

    /// The signal fired by this controller.
    pub fn signal(&self) -> AbortSignal {
        self.signal.clone()
    }

    /// Fire the signal. Returns `false` if it had already fired.
    pub fn abort(&self) -> bool {
        self.signal.fire()
    }

    /// Fire the signal after `duration`, from a background task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn abort_after(&self, duration: Duration) {
        let signal = self.signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            signal.fire();
        });
    }

    pub fn is_aborted(&self) -> bool {
        self.signal.is_aborted()
    }
}

/// One-shot cancellation token bound to exactly one frame.
///
/// Whether the signal had already fired is captured when the bridge is made,
/// so a pre-fired signal can be refused before any statement is issued.
#[derive(Debug, Clone)]
pub struct CancellationBridge {
    signal: AbortSignal,
    aborted_at_creation: bool,
}

impl CancellationBridge {
    pub fn new(signal: AbortSignal) -> Self {
        let aborted_at_creation = signal.is_aborted();
        Self {
            signal,
            aborted_at_creation,
        }
    }

    /// Whether the signal had fired when the bridge was created.
    pub fn aborted_at_creation(&self) -> bool {
        self.aborted_at_creation
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted_at_creation || self.signal.is_aborted()
    }

    /// Resolve once the signal has fired.
    pub async fn aborted(&self) {
        if self.aborted_at_creation {
            return;
        }
        self.signal.aborted().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abort_is_monotonic() {
        let controller = AbortController::new();
        let signal = controller.signal();
        assert!(!signal.is_aborted());
        assert!(controller.abort());
        assert!(!controller.abort());
        assert!(signal.is_aborted());
    }

    #[test]
    fn test_bridge_snapshots_prefired_signal() {
        let bridge = CancellationBridge::new(AbortSignal::already_aborted());
        assert!(bridge.aborted_at_creation());
        assert!(bridge.is_aborted());

        let controller = AbortController::new();
        let bridge = CancellationBridge::new(controller.signal());
        assert!(!bridge.aborted_at_creation());
        controller.abort();
        assert!(bridge.is_aborted());
        assert!(!bridge.aborted_at_creation());
    }

    #[tokio::test]
    async fn test_aborted_resolves_for_waiters() {
        let controller = AbortController::new();
        let bridge = CancellationBridge::new(controller.signal());
        let waiter = tokio::spawn({
            let bridge = bridge.clone();
            async move { bridge.aborted().await }
        });
        tokio::task::yield_now().await;
        controller.abort();
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_aborted_resolves_immediately_when_fired() {
        let signal = AbortSignal::already_aborted();
        signal.aborted().await;
        CancellationBridge::new(signal).aborted().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_signal() {
        let signal = AbortSignal::timeout(Duration::from_millis(500));
        assert!(!signal.is_aborted());
        tokio::time::sleep(Duration::from_millis(499)).await;
        assert!(!signal.is_aborted());
        signal.aborted().await;
        assert!(signal.is_aborted());
    }
}
