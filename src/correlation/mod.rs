//! Request correlation - pending requests, checksum pairing, staging.
//!
//! Provides:
//! - [`CorrelationRegistry`] - issues ids and completes each request once
//! - [`BinaryStaging`] - holds binary payloads that arrive before their request
//! - [`Checksum`] - content hash used to pair the two

mod checksum;
mod registry;
mod staging;

pub use checksum::Checksum;
pub use registry::{
    BinaryDisposition, CorrelationRegistry, Failure, PendingReply, Reply, DEFAULT_TIMEOUT,
    RESERVED_ID_FLOOR,
};
pub use staging::BinaryStaging;
