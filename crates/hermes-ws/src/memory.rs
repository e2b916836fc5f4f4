//! In-memory [`ClientConnection`] implementation.
//!
//! Records every outbound message and close instead of writing to a socket.
//! Used to drive the registry and server core without a network, and to
//! inject send failures.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::connection::{ClientConnection, ConnectionState};
use crate::error::{CloseCode, WsError, WsResult};

/// A connection that keeps its traffic in memory.
#[derive(Debug)]
pub struct MemoryConnection {
    state: AtomicU8,
    fail_sends: AtomicBool,
    sent: Mutex<Vec<String>>,
    closes: Mutex<Vec<(CloseCode, String)>>,
}

impl MemoryConnection {
    /// Create an open connection.
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(ConnectionState::Open as u8),
            fail_sends: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
            closes: Mutex::new(Vec::new()),
        }
    }

    /// Create an open connection whose sends always fail.
    pub fn failing() -> Self {
        let conn = Self::new();
        conn.set_fail_sends(true);
        conn
    }

    /// Make subsequent sends fail (or succeed again).
    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Force the observed state, as if the peer had acted.
    pub fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Texts delivered so far, in send order.
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    /// Close calls that actually changed state, in order.
    pub fn closes(&self) -> Vec<(CloseCode, String)> {
        self.closes.lock().clone()
    }
}

impl Default for MemoryConnection {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClientConnection for MemoryConnection {
    fn state(&self) -> ConnectionState {
        match self.state.load(Ordering::SeqCst) {
            0 => ConnectionState::Open,
            1 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }

    async fn send_text(&self, text: &str) -> WsResult<()> {
        if self.state() != ConnectionState::Open {
            return Err(WsError::connection_closed(None, "connection is not open"));
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(WsError::send_failed("transport reset"));
        }
        self.sent.lock().push(text.to_string());
        Ok(())
    }

    async fn close(&self, code: CloseCode, reason: &str) -> WsResult<()> {
        let previous = self
            .state
            .swap(ConnectionState::Closed as u8, Ordering::SeqCst);
        if previous != ConnectionState::Closed as u8 {
            self.closes.lock().push((code, reason.to_string()));
        }
        Ok(())
    }
}
