//! The core, UI-agnostic library for the `blkdup` imaging utility.
//!
//! `blkdup-core` copies a whole block device into a raw image file
//! ("capture") or an image file onto a whole block device ("restore"), and
//! then proves the two sides are byte-for-byte identical by hashing each of
//! them independently. It is designed to be used by any front-end, whether a
//! command-line interface (like `blkdup`) or a graphical one: it never prints,
//! it emits structured events and returns structured outcomes.
//!
//! The library is structured into several key modules:
//! - [`device`]: device and image references, and the discovered [`Device`].
//! - [`platform`]: platform-specific discovery and mount control.
//! - [`hash`]: streaming SHA-256 digests over files and raw devices.
//! - [`mod@copy`]: the raw block copier.
//! - [`gate`]: the mount-state gate in front of raw device access.
//! - [`verify`]: digest comparison with a bounded retry for devices that are
//!   not yet readable after a write.
//! - [`workflow`]: the state machine tying all of the above together.
//!
//! The primary entry point is [`DuplicationWorkflow::run`]. It blocks until the
//! run is over; callers that need a responsive UI run it on a worker thread and
//! forward [`WorkflowEvent`]s to the UI thread.
//!
//! ## Example: Restoring an Image with Progress Reporting
//!
//! ```rust,no_run
//! use blkdup_core::{CancelToken, DeviceRef, DupConfig, ImageRef};
//! use blkdup_core::workflow::{DuplicationWorkflow, WorkflowEvent, WorkflowRequest};
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = DupConfig::load(None)?;
//!     let device = DeviceRef::parse("/dev/sdb")?;
//!     let image = ImageRef::new("path/to/image.img");
//!
//!     // A shared flag to allow for graceful cancellation.
//!     let cancel = CancelToken::new();
//!
//!     let request = WorkflowRequest::restore(image, device).with_remount(config.remount);
//!     let workflow = DuplicationWorkflow::new(config, cancel.clone());
//!
//!     let outcome = workflow.run(&request, |event| match event {
//!         WorkflowEvent::CopyProgress { bytes } => println!("{bytes} bytes written"),
//!         WorkflowEvent::Warning(message) => eprintln!("warning: {message}"),
//!         _ => {}
//!     });
//!
//!     println!("{} ({} bytes)", outcome.disposition(), outcome.bytes_transferred());
//!     Ok(())
//! }
//! ```

pub mod cancel;
pub mod config;
pub mod copy;
pub mod device;
pub mod error;
pub mod gate;
pub mod hash;
pub mod lock;
mod os_options;
pub mod platform;
pub mod verify;
pub mod workflow;

pub use cancel::CancelToken;
pub use config::DupConfig;
pub use copy::{CopyOptions, CopyResult};
pub use device::{Device, DeviceNaming, DeviceRef, ImageFormat, ImageRef};
pub use error::{BusyCause, DupError};
pub use hash::{Digest, DigestSpec, SourceKind};
pub use verify::VerificationVerdict;
pub use workflow::{
    Direction, Disposition, DuplicationWorkflow, Phase, WorkflowEvent, WorkflowOutcome,
    WorkflowRequest,
};
