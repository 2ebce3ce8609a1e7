//! # Audio Module
//!
//! Everything that touches the raw PCM stream before it leaves the process.
//!
//! ## Key Components:
//! - **format**: PCM format description, chunk sizing, WAV wrapping
//! - **buffer**: bounded per-session byte buffer
//! - **session**: per-connection session manager and lifecycle state
//! - **chunker**: splits a finalized buffer into streaming chunks
//!
//! ## Audio Format Requirements:
//! - **Sample Rate**: 16kHz
//! - **Bit Depth**: 16-bit PCM, little-endian
//! - **Channels**: Mono

pub mod buffer;
pub mod chunker;
pub mod format;
pub mod session;

pub use format::AudioFormat;
pub use session::{FinalizedSession, SessionManager, SessionState};
