//! Reads Android A/B OTA update payloads (the CrAU format produced by the
//! Chrome OS / Android update_engine) and extracts partition images from
//! them.
//!
//! The entry points are [`payload::Payload::open`] to locate and parse a
//! payload from a local file, local ZIP, or HTTP(S) URL, and
//! [`scheduler::extract`] to drive parallel extraction of the selected
//! partitions.

pub mod error;
pub mod extent;
pub mod operation;
pub mod payload;
pub mod progress;
pub mod scheduler;
pub mod source;
pub mod zip;

// Generated from `update_metadata.proto` by `prost-build`, see build.rs.
pub mod chromeos_update_engine {
    include!(concat!(env!("OUT_DIR"), "/chromeos_update_engine.rs"));
}

pub use error::{Error, Result};
pub use payload::Payload;
pub use source::Source;
