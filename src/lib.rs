//! Lock-free MPMC FIFO queues from the Scalable Circular Queue family
//! (paper: arXiv:1908.04511).
//!
//! - [`Ncq`]: naive bounded ring over unsigned integers, the didactic
//!   baseline.
//! - [`Scq`]: bounded ring with the safe bit and dynamic threshold that fix
//!   NCQ's liveness hazard.
//! - [`Scqp`]: pointer-valued SCQ; stores pointers directly in the 16-byte
//!   slot when the CPU has a native double-word CAS, otherwise falls back to
//!   an index ring plus a side pointer array.
//! - [`Lscq`]: unbounded queue chaining SCQP nodes, with drained nodes
//!   recycled through an internal [`ObjectPool`].
//! - [`MsQueue`] / [`MutexQueue`]: comparison baselines.
//!
//! The 16-byte slot CAS lives in [`cas2`]; [`ebr`] holds the legacy
//! epoch-based reclamation kept for source compatibility.

pub mod cas2;
pub mod ebr;
pub mod mpmc;
pub mod pool;

pub use cas2::{cas2, has_cas2_support, Entry};
pub use ebr::{EbrManager, EpochGuard};
pub use mpmc::{IndexType, Lscq, MsQueue, MutexQueue, Ncq, Scq, Scqp};
pub use pool::ObjectPool;

/// Project-wide default sizes.
pub mod config {
    /// Default ring size (in slots) for the SCQ-family queues.
    pub const DEFAULT_SCQSIZE: usize = 65536;

    /// Default capacity for generic queue-like components; kept separate
    /// from [`DEFAULT_SCQSIZE`] so the two can be tuned independently.
    pub const DEFAULT_QSIZE: usize = 32768;
}

/// Common interface for the integer-valued rings ([`Ncq`], [`Scq`]) so tests
/// and benchmarks can be generic over them.
pub trait IndexQueue<T: IndexType>: Send + Sync + 'static {
    /// Enqueue a value; false when the value is rejected (reserved
    /// sentinel / out of range).
    fn enqueue(&self, value: T) -> bool;

    /// Dequeue a value, or [`IndexType::EMPTY`] when the queue is empty.
    fn dequeue(&self) -> T;

    /// Best-effort emptiness snapshot.
    fn is_empty(&self) -> bool;
}
