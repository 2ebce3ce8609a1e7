//! # Recognition Wire Protocol
//!
//! The binary framing spoken with the streaming recognition service. Pure and
//! stateless: [`frame`] packs and unpacks frames, [`compression`] handles the gzip
//! payload encoding.

pub mod compression;
pub mod frame;

pub use frame::{flags, Compression, Frame, MessageType, Serialization};
