//! Porthole Shared Library
//!
//! Wire protocol and common types used by both the relay and the client agent.

pub mod protocol;
pub mod error;

pub use error::{Error, Result};
pub use protocol::{Message, RequestFrame, ResponseFrame};
