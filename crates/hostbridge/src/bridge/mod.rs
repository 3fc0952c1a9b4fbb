//! Wire layer shared by the relay and the worker.
//!
//! - **codec**: length-prefixed and line-delimited JSON framing
//! - **protocol**: request classification and reply messages

pub mod codec;
pub mod protocol;

pub use codec::{DecodeError, Framing, FramingError, JsonCodec};
pub use protocol::{Reply, Request, RequestError};
