//! Transport and monitor seams
//!
//! The client does not own the wire: it hands framed messages to a transport
//! that provides reliable, ordered delivery per daemon, and it learns about
//! newer osd maps from a monitor client. Both arrive here as trait objects.
//!
//! Inbound control flow goes the other way: a transport implementation calls
//! `OSDClient::handle_reply`, `handle_map`, `handle_reset` and
//! `prepare_read_pages` from its receive path.

use bytes::Bytes;
use std::sync::{Arc, Mutex};

use crate::error::Result;
use crate::types::{EntityAddr, Pages};

/// A framed wire message, shared between the request record that built it and
/// the transport delivering it.
///
/// The page vector rides outside the front and is guarded by the per-message
/// page lock so an abort can revoke it while the transport is (or is about
/// to be) moving data.
#[derive(Debug)]
pub struct Message {
    pub msg_type: u16,
    pub tid: u64,
    pub front: Bytes,
    /// Bytes carried outside the front: write payload on the way out,
    /// received data length on the way in.
    pub data_len: u32,
    pages: Mutex<Option<Pages>>,
}

impl Message {
    pub fn new(msg_type: u16, tid: u64, front: Bytes, data_len: u32) -> Arc<Self> {
        Arc::new(Self {
            msg_type,
            tid,
            front,
            data_len,
            pages: Mutex::new(None),
        })
    }

    pub fn attach_pages(&self, pages: Pages) {
        *self.pages.lock().expect("message page lock poisoned") = Some(pages);
    }

    /// Take the page vector away; a transport that duplicated this handle
    /// will find no data to move.
    pub fn revoke_pages(&self) {
        *self.pages.lock().expect("message page lock poisoned") = None;
    }

    pub fn pages(&self) -> Option<Pages> {
        self.pages.lock().expect("message page lock poisoned").clone()
    }
}

/// One established channel to a daemon. Dropping the last handle closes it.
pub trait Connection: Send + Sync {
    /// Queue a message for delivery. Never blocks; the transport owns the
    /// handed-in message reference from here on.
    fn send(&self, msg: Arc<Message>) -> Result<()>;

    fn peer_addr(&self) -> EntityAddr;
}

/// Message transport: reliable, ordered, peer-keyed delivery.
pub trait Transport: Send + Sync {
    fn connect(&self, osd: i32, addr: EntityAddr) -> Result<Arc<dyn Connection>>;

    /// Keepalive probe for a daemon whose requests sit unanswered, so a dead
    /// channel is noticed and reset.
    fn ping(&self, osd: i32, addr: EntityAddr);
}

/// Monitor client: the source of newer osd maps.
pub trait MonitorClient: Send + Sync {
    /// Ask for a map at least as new as `want_epoch`. May be throttled by the
    /// implementation; calling it repeatedly is fine.
    fn request_map(&self, want_epoch: u32);

    /// Report that the client is now at `epoch`.
    fn got_map(&self, epoch: u32);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_revocation() {
        let msg = Message::new(crate::messages::MSG_OSD_OP, 1, Bytes::new(), 0);
        assert!(msg.pages().is_none());

        let pages: Pages = Arc::new(vec![Bytes::from_static(b"xyz")]);
        msg.attach_pages(Arc::clone(&pages));
        assert!(msg.pages().is_some());

        msg.revoke_pages();
        assert!(msg.pages().is_none());
        // The caller's handle is unaffected.
        assert_eq!(pages.len(), 1);
    }
}
