//! Cooperative concurrency kernel.
//!
//! Three primitives for long-running stateful services on tokio:
//!
//! - [`FairLock`]: FIFO async mutex. Queued callers time out; holders that overstay
//!   their timeout are force-released with a warning.
//! - [`CancellationSignal`]: one-shot cancellation trees. Parents cancel children,
//!   never the other way round, and optional deadlines cancel on their own.
//! - [`BoundedOperation`]: retries a fallible async call with backoff, racing every
//!   attempt against its signal.
//!
//! ```ignore
//! let lock = FairLock::new("session", Duration::from_secs(30));
//! let root = CancellationSignal::new();
//!
//! lock.with_lock("start", None, || async {
//!     BoundedOperation::new("capture.start")
//!         .with_timeout(Duration::from_secs(10))
//!         .with_signal(&root)
//!         .execute(|signal| capture.start(signal))
//!         .await
//! })
//! .await?;
//! ```

pub mod backoff;
pub mod bounded;
pub mod error;
pub mod lock;
pub mod signal;

pub use backoff::{Backoff, BackoffStrategy};
pub use bounded::BoundedOperation;
pub use error::{CancelOrigin, Cancelled, LockTimeout, OperationError};
pub use lock::{FairLock, HolderInfo, LockGuard, LockStats};
pub use signal::{CancellationSignal, Registration, SignalBuilder, SignalWatcher};
