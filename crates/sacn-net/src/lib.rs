//! Network side of the sACN toolkit: the transmitter and receiver tasks,
//! the discovered-source registry, and the UDP transport they run on.

pub mod error;
pub mod receiver;
pub mod registry;
pub mod sequence;
pub mod transmitter;
pub mod transport;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use error::NetError;
pub use receiver::{Receiver, ReceiverHandle};
pub use registry::{Source, SourceRegistry};
pub use sequence::{SequenceStatus, SequenceTracker};
pub use transmitter::Transmitter;
pub use transport::{DatagramSink, DatagramSource, SocketOptions};

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
