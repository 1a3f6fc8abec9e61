//! Core types for OSD client operations

use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;

// ============= Request flags =============

bitflags::bitflags! {
    /// Request flag bits carried in the request head (cluster ABI).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OsdFlags: u32 {
        /// Read operation
        const READ = 0x0001;
        /// Write operation
        const WRITE = 0x0002;
        /// Request a second, durability-indicating response
        const ONDISK = 0x0004;
        /// Resend of a previously submitted request
        const RETRY = 0x0008;
        /// Request acknowledgement
        const ACK = 0x0010;
    }
}

// ============= Operation codes =============

/// Operation codes for the per-op entries of a request (cluster ABI).
pub const OSD_OP_READ: u16 = 1;
pub const OSD_OP_WRITE: u16 = 2;
/// Mask returned data below a truncate boundary (read-side truncate op).
pub const OSD_OP_MASKTRUNC: u16 = 3;
/// Record a new truncate boundary on the object (write-side truncate op).
pub const OSD_OP_SETTRUNC: u16 = 4;
/// Ask the daemon to flush the object promptly.
pub const OSD_OP_STARTSYNC: u16 = 5;

// ============= File identity and layout =============

/// Snapshot id of the live ("head") revision of a file.
pub const NOSNAP: u64 = u64::MAX - 1;

/// File identity: inode number plus the snapshot it is viewed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vino {
    pub ino: u64,
    pub snap: u64,
}

/// Striping policy for file data across objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileLayout {
    /// Bytes of one stripe unit.
    pub stripe_unit: u32,
    /// Stripe units per stripe.
    pub stripe_count: u32,
    /// Bytes of one object.
    pub object_size: u32,
}

impl FileLayout {
    /// Layout that places each `object_size` span of the file in one object.
    pub fn whole_object(object_size: u32) -> Self {
        Self {
            stripe_unit: object_size,
            stripe_count: 1,
            object_size,
        }
    }
}

/// The set of snapshots a write must remain visible in. Shared between the
/// caller and every request built from it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SnapContext {
    pub seq: u64,
    pub snaps: Vec<u64>,
}

// ============= Wire-adjacent scalar types =============

/// Wall-clock timestamp carried in the request head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UTime {
    pub sec: u32,
    pub nsec: u32,
}

impl UTime {
    pub fn zero() -> Self {
        Self::default()
    }

    pub fn now() -> Self {
        match std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH) {
            Ok(d) => Self {
                sec: d.as_secs() as u32,
                nsec: d.subsec_nanos(),
            },
            Err(_) => Self::zero(),
        }
    }
}

/// Daemon-side version token, echoed back on retry so a replayed write stays
/// idempotent at the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EVersion {
    pub epoch: u32,
    pub version: u64,
}

/// Placement-group identifier derived from the object name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PgId(pub u32);

/// Network identity of a daemon: socket address plus an incarnation nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityAddr {
    pub addr: SocketAddr,
    pub nonce: u32,
}

impl EntityAddr {
    pub fn new(addr: SocketAddr, nonce: u32) -> Self {
        Self { addr, nonce }
    }
}

// ============= Page vectors =============

/// Page size used when sizing page vectors for file extents.
pub const PAGE_SIZE: u64 = 4096;

/// A contiguous page vector, shared between the caller, a request, and the
/// messages carrying its data.
pub type Pages = Arc<Vec<Bytes>>;

/// Number of pages the extent `off..off+len` touches.
pub fn calc_pages_for(off: u64, len: u64) -> usize {
    if len == 0 {
        return 0;
    }
    (((off + len).div_ceil(PAGE_SIZE)) - off / PAGE_SIZE) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calc_pages_for() {
        assert_eq!(calc_pages_for(0, 0), 0);
        assert_eq!(calc_pages_for(0, 1), 1);
        assert_eq!(calc_pages_for(0, PAGE_SIZE), 1);
        assert_eq!(calc_pages_for(0, PAGE_SIZE + 1), 2);
        // A short extent straddling a page boundary still needs two pages.
        assert_eq!(calc_pages_for(PAGE_SIZE - 1, 2), 2);
        assert_eq!(calc_pages_for(3 * PAGE_SIZE, 2 * PAGE_SIZE), 2);
    }

    #[test]
    fn test_flag_bits() {
        assert_eq!(OsdFlags::READ.bits(), 1);
        assert_eq!(OsdFlags::WRITE.bits(), 2);
        let f = OsdFlags::WRITE | OsdFlags::ONDISK;
        assert!(f.contains(OsdFlags::ONDISK));
        assert!(!f.contains(OsdFlags::READ));
    }
}
