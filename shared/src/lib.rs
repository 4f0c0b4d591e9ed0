//! RevTun Shared Library
//!
//! Envelope types and the wire codec spoken between the agent and the broker.

pub mod codec;
pub mod error;
pub mod protocol;

pub use codec::{decode, encode, normalize_body};
pub use error::{DecodeError, Error, Result};
pub use protocol::{
    HeaderValue, Headers, RequestBody, RequestEnvelope, ResponseEnvelope, TunnelEnvelope,
};
