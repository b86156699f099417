//! # imgwire
//!
//! Request/response link between an image viewer and its native compute
//! module, running either in a remote process (socket) or a background
//! worker (message channel).
//!
//! A JSON control message and the raw binary payload it describes may
//! arrive as two separate frames, in either order. The link pairs them up
//! by content checksum, completes each request exactly once, and enforces
//! per-request timeouts.
//!
//! ## Architecture
//!
//! - **Protocol**: length-prefixed frames, optionally XOR-masked
//! - **Codec**: `{type, payload}` JSON envelopes and raw binary frames
//! - **Correlation**: request ids, checksum promises, binary staging
//! - **Link / Connection**: routing surface and an async stream driver
//!
//! ## Example
//!
//! ```ignore
//! use imgwire::{codec::Role, Connection, Link};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> imgwire::Result<()> {
//!     let stream = tokio::net::TcpStream::connect("127.0.0.1:7000").await?;
//!     let conn = Connection::spawn(stream, Link::new(Role::Client));
//!
//!     let volume = conn
//!         .handle()
//!         .request("loadImage", &json!({"path": "t1.nii"}))
//!         .await?;
//!     println!("{:?}", volume.as_bytes().map(|b| b.len()));
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod correlation;
pub mod error;
pub mod protocol;

mod connection;
mod link;

pub use connection::{
    Connection, ConnectionHandle, DEFAULT_CHANNEL_CAPACITY, DEFAULT_EVENT_CAPACITY,
};
pub use error::{LinkError, Result};
pub use link::{Link, LinkBuilder};
