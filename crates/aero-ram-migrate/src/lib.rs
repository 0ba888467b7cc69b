//! Sender/receiver state machine for live guest-RAM migration: dirty-page
//! scanning, zero-elision, XBZRLE delta encoding, deflate compression, and
//! the post-copy urgent request queue, tied together by a self-describing
//! binary wire format.
//!
//! The engine owns no guest memory or transport itself -- it is driven by
//! an embedding application through the [`MemorySubsystem`] and
//! [`Transport`] traits, and exposed as one explicit [`Engine`] /
//! [`ReceiverEngine`] pair rather than process-global state.

/// Size, in bytes, of one target page. Fixed at compile time, matching
/// the original's `TARGET_PAGE_SIZE` being a build-time constant rather
/// than something negotiated at runtime.
pub const TARGET_PAGE_SIZE: u64 = 4096;

pub mod bitmap;
pub mod compress;
pub mod config;
pub mod counters;
pub mod delta;
pub mod error;
pub mod lifecycle;
pub mod observers;
pub mod page_cache;
pub mod receiver;
pub mod region;
pub mod request_queue;
pub mod scanner;
pub mod transport;
pub mod wire;

pub use config::Config;
pub use error::{MigrateError, ProtocolError, Result};
pub use lifecycle::{Engine, ReceiverEngine, ThrottleSignal, ThrottleTracker};
pub use region::{MemorySubsystem, Region, RegionId};
pub use request_queue::RequestSpec;
pub use scanner::{ScanOutcome, PACING_CHECK_STRIDE};
pub use transport::{MemTransport, Transport};
pub use wire::PROTOCOL_VERSION;
