//! Connection Adapter (C8, §4.8): bridges a transport-specific connection to
//! the abstract interface the hub actually needs.
//!
//! The hub never touches a WebSocket directly — only this trait — so it can
//! be driven by axum in production and by an in-memory double in tests
//! (see `tests/integration/hub_collaboration.rs`).

use crate::auth::Identity;

/// What the hub needs from a live connection: send, close, liveness, and the
/// identity resolved at handshake time. Frame-size gating against
/// `MAX_MESSAGE_SIZE` happens one layer up, in the code that reads frames off
/// the transport and hands them to [`crate::codec::decode_client_message`]
/// before the hub ever sees them.
pub trait Connection: Send + Sync {
    /// Sends an already-encoded frame. Implementations must not block the
    /// caller on a slow peer; a full/slow send queue should drop the frame
    /// and let [`Connection::is_open`] eventually reflect the dead peer.
    fn send(&self, frame: &[u8]);
    /// Closes the connection with a WebSocket close code and reason.
    fn close(&self, code: u16, reason: &str);
    /// Whether the transport still considers this connection open.
    fn is_open(&self) -> bool;
    /// The identity resolved from the handshake token (§6.1).
    fn identity(&self) -> Identity;
}

/// Normal-closure WebSocket code used on graceful shutdown (§6.1).
pub const NORMAL_CLOSURE_CODE: u16 = 1001;

#[cfg(any(test, feature = "test-util"))]
pub mod test_double {
    //! An in-memory [`Connection`] double: records every frame sent to it and
    //! lets tests flip its open/closed state, grounded on the same
    //! test-double pattern the storage layer uses for `Storage::open_in_memory_for_tests`.

    use super::Connection;
    use crate::auth::Identity;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    pub struct RecordingConnection {
        identity: Identity,
        open: AtomicBool,
        pub sent: Mutex<Vec<Vec<u8>>>,
        pub closes: Mutex<Vec<(u16, String)>>,
    }

    impl RecordingConnection {
        pub fn new(identity: Identity) -> Self {
            Self { identity, open: AtomicBool::new(true), sent: Mutex::new(Vec::new()), closes: Mutex::new(Vec::new()) }
        }

        pub fn set_open(&self, open: bool) {
            self.open.store(open, Ordering::Release);
        }

        pub fn sent_messages(&self) -> Vec<String> {
            self.sent.lock().iter().map(|b| String::from_utf8_lossy(b).into_owned()).collect()
        }
    }

    impl Connection for RecordingConnection {
        fn send(&self, frame: &[u8]) {
            self.sent.lock().push(frame.to_vec());
        }

        fn close(&self, code: u16, reason: &str) {
            self.open.store(false, Ordering::Release);
            self.closes.lock().push((code, reason.to_string()));
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::Acquire)
        }

        fn identity(&self) -> Identity {
            self.identity.clone()
        }
    }
}
