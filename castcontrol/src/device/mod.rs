//! The per-renderer device session: cached state, the serialized command
//! queue, the poll timer and event reconciliation.

mod poller;
mod queue;
mod reconcile;
mod session;
mod volume;

pub use poller::DeadlineTimer;
pub use queue::{CommandQueue, SessionCommand};
pub use session::{RendererSession, SessionCallbacks, SessionTuning};
pub use volume::VolumeRange;

#[cfg(test)]
pub(crate) use session::test_support;
