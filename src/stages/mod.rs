//! Pipeline stage loops.
//!
//! Each stage is plain data plus a `run` method meant to be handed to a
//! `Service`. Stages never block without a timeout path back to their stop
//! flag, so cancellation latency is bounded by one cycle.

pub mod capture;
pub mod detection;
pub mod persistence;

pub use capture::{BackpressurePolicy, CaptureOutcome, CaptureReport, CaptureStage};
pub use detection::{DetectionReport, DetectionStage};
pub use persistence::{PersistenceReport, PersistenceStage};

use std::time::Duration;

use crate::channel::{Priority, SendError, Sender};
use crate::service::StopFlag;

/// Timed receive used by the consuming stages.
pub const DEFAULT_RECV_TIMEOUT: Duration = Duration::from_secs(1);
/// Camera readiness wait per capture cycle.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(2);
/// How long a blocked send waits before re-checking the stop flag.
const SEND_POLL: Duration = Duration::from_millis(100);

/// What happened to a message handed to `forward`.
pub(crate) enum Forward<T> {
    Sent,
    /// Not enqueued: the channel stayed full (non-blocking send, or a stop
    /// arrived while blocked). The message comes back to the caller.
    Full(T),
    /// The receiver is gone.
    Closed(T),
}

/// Send `msg`, either blocking until space frees up or failing at once.
///
/// A blocking send still wakes every `SEND_POLL` to honour `stop`.
pub(crate) fn forward<T>(
    tx: &Sender<T>,
    msg: T,
    priority: Priority,
    block: bool,
    stop: &StopFlag,
) -> Forward<T> {
    if !block {
        return match tx.try_send(msg, priority) {
            Ok(()) => Forward::Sent,
            Err(SendError::Full(msg)) => Forward::Full(msg),
            Err(SendError::Closed(msg)) => Forward::Closed(msg),
        };
    }
    let mut msg = msg;
    loop {
        match tx.send_timeout(msg, priority, SEND_POLL) {
            Ok(()) => return Forward::Sent,
            Err(SendError::Closed(back)) => return Forward::Closed(back),
            Err(SendError::Full(back)) => {
                if stop.requested() {
                    return Forward::Full(back);
                }
                msg = back;
            }
        }
    }
}
