//! TFS Protocol - wire messages and service definitions
//!
//! This crate contains the request/response messages exchanged with the
//! name server and data servers, the async service traits both sides
//! implement, and the length-prefixed frame codec used over TCP.

pub mod codec;
pub mod error;
pub mod messages;
pub mod service;

pub use codec::{
    FRAME_HEADER_SIZE, FrameHeader, MAX_FRAME_SIZE, encode_frame, read_frame, write_frame,
};
pub use error::ProtoError;
pub use messages::*;
pub use service::{Connector, DataService, NameService, dispatch};
