//! Reel - a recording session controller.
//!
//! [`SessionController`] owns one [`CaptureService`] and drives it through
//! initialize, start, pause/resume, stop and shutdown. Operations are serialized
//! through a `turnstile::FairLock`, each collaborator call is bounded by a timeout
//! with retries, and a session's max duration is enforced by a cancellation signal
//! that stops it automatically.
//!
//! ```no_run
//! use std::sync::Arc;
//! use reel::{CaptureOptions, SessionController, SimulatedCapture};
//!
//! # async fn demo() -> Result<(), reel::SessionError> {
//! let config = reelconf::ReelConfig::default();
//! let controller = SessionController::builder(config, Arc::new(SimulatedCapture::new())).build()?;
//!
//! controller.initialize().await?;
//! controller.start(CaptureOptions::default()).await?;
//! let result = controller.stop().await?;
//! println!("{} frames", result.frame_count);
//! controller.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod capture;
pub mod controller;
pub mod error;
pub mod observer;
pub mod session;
pub mod state;
pub mod store;
pub mod telemetry;

pub use capture::{CaptureHandle, CaptureOptions, CaptureService, CaptureSummary, SimulatedCapture};
pub use controller::{ControllerInfo, SessionController, SessionControllerBuilder};
pub use error::SessionError;
pub use observer::{EventLog, SessionEvent, SessionObserver, TracingObserver};
pub use session::{EndReason, PauseInterval, SessionId, SessionInfo, SessionRecord, StopResult};
pub use state::ControllerState;
pub use store::{JsonFileStore, MemoryStore, MetadataStore};
