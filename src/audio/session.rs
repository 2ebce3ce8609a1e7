//! # Audio Session Management
//!
//! Tracks the audio sessions open on one WebSocket connection. Each session is a
//! bounded byte buffer that grows while the client streams PCM and is handed off,
//! whole, when the client ends it.
//!
//! ## Session Lifecycle:
//! 1. **Open**: created by `audio_start`, receiving binary chunks
//! 2. **Finalizing**: removed from the manager by `audio_end`; its audio is being
//!    stored and recognized
//! 3. **Closed**: both the storage and the recognition outcome have been reported
//!
//! ## Current session pointer
//! Raw binary frames carry no session id, so the manager remembers which session
//! was started most recently and routes binary data there. Starting a second
//! session moves the pointer; ending the pointed-at session clears it.
//!
//! ## Thread Safety:
//! The map and the pointer sit behind one `Mutex`, so "remove from the map" and
//! "clear the pointer" happen atomically and an append can never land in a session
//! that is already being finalized.

use crate::audio::buffer::SessionBuffer;
use crate::error::{EngineError, EngineResult};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Finalizing,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Open => "open",
            SessionState::Finalizing => "finalizing",
            SessionState::Closed => "closed",
        }
    }
}

/// An open session inside the manager.
#[derive(Debug)]
struct AudioSession {
    buffer: SessionBuffer,
    started_at: DateTime<Utc>,
    state: SessionState,
}

/// Owned snapshot of a session taken at `audio_end`.
#[derive(Debug)]
pub struct FinalizedSession {
    pub session_id: String,

    /// Every byte appended while the session was open, in receipt order
    pub audio: Vec<u8>,

    /// Number of binary chunks that were accepted
    pub chunks: u32,

    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub state: SessionState,
}

impl FinalizedSession {
    /// Time between `audio_start` and `audio_end`.
    pub fn duration(&self) -> chrono::Duration {
        self.ended_at - self.started_at
    }
}

#[derive(Debug, Default)]
struct SessionTable {
    sessions: HashMap<String, AudioSession>,
    current: Option<String>,
}

/// Per-connection registry of open sessions.
#[derive(Debug)]
pub struct SessionManager {
    table: Mutex<SessionTable>,

    /// Maximum number of sessions open at once
    max_concurrent_sessions: usize,

    /// Byte limit applied to every session buffer
    max_buffer_bytes: usize,
}

impl SessionManager {
    pub fn new(max_concurrent_sessions: usize, max_buffer_bytes: usize) -> Self {
        Self {
            table: Mutex::new(SessionTable::default()),
            max_concurrent_sessions,
            max_buffer_bytes,
        }
    }

    fn table(&self) -> MutexGuard<'_, SessionTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a new session and make it the target for binary frames.
    ///
    /// A duplicate id is rejected and leaves the existing session untouched.
    pub fn start_session(&self, session_id: &str) -> EngineResult<()> {
        let mut table = self.table();

        if table.sessions.contains_key(session_id) {
            return Err(EngineError::SessionAlreadyExists(session_id.to_string()));
        }
        if table.sessions.len() >= self.max_concurrent_sessions {
            return Err(EngineError::SessionLimitReached(self.max_concurrent_sessions));
        }

        table.sessions.insert(
            session_id.to_string(),
            AudioSession {
                buffer: SessionBuffer::new(self.max_buffer_bytes),
                started_at: Utc::now(),
                state: SessionState::Open,
            },
        );

        if let Some(previous) = table.current.replace(session_id.to_string()) {
            debug!(session_id, previous = %previous, "current session pointer moved");
        }

        info!(session_id, open_sessions = table.sessions.len(), "audio session started");
        Ok(())
    }

    /// Append to an open session. Returns the number of bytes buffered so far.
    pub fn append_audio(&self, session_id: &str, bytes: &[u8]) -> EngineResult<usize> {
        let mut table = self.table();
        let session = table
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))?;

        session
            .buffer
            .append(bytes)
            .map_err(|exceeded| EngineError::BufferLimitExceeded {
                session_id: session_id.to_string(),
                limit: exceeded.limit,
            })?;
        Ok(session.buffer.len())
    }

    /// Append to whichever session the current pointer names.
    ///
    /// Returns the id the bytes were routed to and its buffered size.
    pub fn append_to_current(&self, bytes: &[u8]) -> EngineResult<(String, usize)> {
        let session_id = self
            .current_session()
            .ok_or_else(|| EngineError::SessionNotFound("<no active session>".to_string()))?;

        let buffered = self.append_audio(&session_id, bytes)?;
        Ok((session_id, buffered))
    }

    /// Remove the session and return its audio for finalization.
    pub fn end_session(&self, session_id: &str) -> EngineResult<FinalizedSession> {
        let mut table = self.table();

        let session = table
            .sessions
            .remove(session_id)
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))?;

        if table.current.as_deref() == Some(session_id) {
            table.current = None;
        }

        if session.buffer.is_empty() {
            warn!(session_id, "session ended without audio");
        }

        let chunks = session.buffer.appends();
        let audio = session.buffer.into_bytes();
        let state = SessionState::Finalizing;
        info!(
            session_id,
            bytes = audio.len(),
            chunks,
            from = session.state.as_str(),
            to = state.as_str(),
            "audio session ended"
        );

        Ok(FinalizedSession {
            session_id: session_id.to_string(),
            audio,
            chunks,
            started_at: session.started_at,
            ended_at: Utc::now(),
            state,
        })
    }

    /// Drop every open session; used when the connection goes away.
    ///
    /// Returns the ids that were discarded without being ended.
    pub fn close_all(&self) -> Vec<String> {
        let mut table = self.table();
        table.current = None;
        table.sessions.drain().map(|(id, _)| id).collect()
    }

    pub fn current_session(&self) -> Option<String> {
        self.table().current.clone()
    }

    #[cfg(test)]
    pub fn open_sessions(&self) -> usize {
        self.table().sessions.len()
    }
}
