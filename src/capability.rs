//! The Task Capability interface: what every external task adapter
//! implements. The engine never inspects what a task actually *does* — it
//! only calls `start`/`request_cancel` and waits for exactly one `done`
//! emission, delivered back onto the driver context through an
//! [`AdapterHandle`].

use crate::runtime::NodeId;
use tokio::sync::mpsc::UnboundedSender;

/// The outcome an adapter reports for itself. Distinct from [`crate::recipe::DoneWith`]:
/// an adapter cannot report `Cancel` — cancellation is the engine's decision,
/// made independently of (and overriding) whatever the adapter eventually emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterOutcome {
    Success,
    Error,
}

/// An external task adapter. Implementations are driven entirely by the
/// engine: `start` is called at most once, `request_cancel` at most once,
/// and the adapter must eventually call [`AdapterHandle::done`] exactly once
/// (even if `request_cancel` was invoked — the engine honors a late
/// emission as the cancellation acknowledgement rather than a second
/// outcome).
pub trait TaskAdapter: Send {
    /// Begin work. May call `handle.done(..)` synchronously if the work is
    /// already complete, or stash the handle and call it later from any
    /// thread.
    fn start(&mut self, handle: AdapterHandle);

    /// Request cooperative cancellation. The adapter is expected to wind
    /// down promptly and still call `handle.done(..)` exactly once.
    fn request_cancel(&mut self);
}

/// Handle an adapter uses to report completion back onto the driver
/// context. Cloneable so it can be moved into a spawned task, but the
/// engine only honors the first `done` call for a given node.
#[derive(Clone)]
pub struct AdapterHandle {
    pub(crate) node: NodeId,
    pub(crate) sender: UnboundedSender<crate::scheduler::DriverEvent>,
}

impl AdapterHandle {
    pub fn done(&self, outcome: AdapterOutcome) {
        let _ = self
            .sender
            .send(crate::scheduler::DriverEvent::TaskDone {
                node: self.node,
                outcome,
            });
    }
}

/// A task adapter that never starts any real work and completes
/// immediately with a fixed outcome. Exists purely so the engine is
/// exercisable end-to-end without a host-provided adapter, the same role
/// `MemoryStore` plays for `bpmn-lite-core`'s own test suite.
pub struct NoopAdapter {
    outcome: AdapterOutcome,
}

impl NoopAdapter {
    pub fn new(outcome: AdapterOutcome) -> Self {
        NoopAdapter { outcome }
    }
}

impl TaskAdapter for NoopAdapter {
    fn start(&mut self, handle: AdapterHandle) {
        handle.done(self.outcome);
    }

    fn request_cancel(&mut self) {
        // Nothing in flight to cancel; `done` was already sent from `start`.
    }
}
