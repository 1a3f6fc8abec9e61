//! Daemon sessions
//!
//! One session per daemon the client currently talks to: the open transport
//! connection and the set of requests routed there. A session exists exactly
//! as long as at least one registered request is routed to its daemon;
//! removing the last request destroys the session, and dropping the
//! connection handle tears the channel down.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::transport::Connection;
use crate::types::EntityAddr;

pub struct OSDSession {
    pub osd: i32,
    pub addr: EntityAddr,
    pub conn: Arc<dyn Connection>,
    /// Tids of the requests routed here; emptiness bounds the lifetime.
    pub requests: BTreeSet<u64>,
}

impl OSDSession {
    pub fn new(osd: i32, addr: EntityAddr, conn: Arc<dyn Connection>) -> Self {
        Self {
            osd,
            addr,
            conn,
            requests: BTreeSet::new(),
        }
    }
}

impl std::fmt::Debug for OSDSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OSDSession")
            .field("osd", &self.osd)
            .field("addr", &self.addr)
            .field("requests", &self.requests)
            .finish()
    }
}
