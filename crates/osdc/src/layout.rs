//! Placement engine
//!
//! Pure calculations that turn a file extent into an object extent and pick
//! the daemon responsible for it against a given osd map. Extents that cross
//! a stripe-unit boundary are shortened so that a single request always
//! targets a single object.

use crate::osdmap::OSDMap;
use crate::types::{FileLayout, PgId, Vino};

/// Result of placing a file extent against the current map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub oid: String,
    /// Extent inside the object.
    pub obj_off: u64,
    pub obj_len: u64,
    pub pgid: PgId,
    /// Primary daemon ordinal, negative when the pg has no up member.
    pub primary: i32,
}

/// Map a file extent onto one object. `plen` is shortened in place when the
/// extent crosses into the next stripe unit; the returned tuple is
/// `(object_no, obj_off)` with the final extent length left in `*plen`.
pub fn file_extent_to_object(layout: &FileLayout, off: u64, plen: &mut u64) -> (u64, u64) {
    let su = layout.stripe_unit.max(1) as u64;
    let sc = layout.stripe_count.max(1) as u64;
    let su_per_object = (layout.object_size as u64 / su).max(1);

    let block_no = off / su;
    let stripe_no = block_no / sc;
    let stripe_pos = block_no % sc;
    let obj_set_no = stripe_no / su_per_object;
    let obj_no = obj_set_no * sc + stripe_pos;

    let block_off = off % su;
    let obj_off = (stripe_no % su_per_object) * su + block_off;

    let max = su - block_off;
    if *plen > max {
        tracing::debug!(
            "file extent {}~{} shortened to {} at stripe-unit boundary",
            off,
            *plen,
            max
        );
        *plen = max;
    }

    (obj_no, obj_off)
}

/// Canonical object name for a file block.
pub fn object_name(ino: u64, obj_no: u64) -> String {
    format!("{:x}.{:08x}", ino, obj_no)
}

/// Place a file extent: object extent, pg, and primary daemon. `plen` is
/// shortened exactly as in [`file_extent_to_object`].
pub fn place(
    layout: &FileLayout,
    vino: Vino,
    off: u64,
    plen: &mut u64,
    map: &OSDMap,
) -> Placement {
    let (obj_no, obj_off) = file_extent_to_object(layout, off, plen);
    let oid = object_name(vino.ino, obj_no);
    let pgid = map.pg_for_object(&oid);
    let primary = map.pg_primary(pgid);
    Placement {
        oid,
        obj_off,
        obj_len: *plen,
        pgid,
        primary,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: u64 = 1 << 20;

    #[test]
    fn test_extent_within_object() {
        let layout = FileLayout::whole_object(4 * MB as u32);
        let mut plen = 8192;
        let (obj_no, obj_off) = file_extent_to_object(&layout, 2 * MB, &mut plen);
        assert_eq!(obj_no, 0);
        assert_eq!(obj_off, 2 * MB);
        assert_eq!(plen, 8192);
    }

    #[test]
    fn test_extent_shortened_at_object_boundary() {
        // 8 KiB read starting 4 KiB before the end of the first 4 MiB object
        // only covers the 4 KiB left in that object.
        let layout = FileLayout::whole_object(4 * MB as u32);
        let mut plen = 8192;
        let (obj_no, obj_off) = file_extent_to_object(&layout, 4 * MB - 4096, &mut plen);
        assert_eq!(obj_no, 0);
        assert_eq!(obj_off, 4 * MB - 4096);
        assert_eq!(plen, 4096);
    }

    #[test]
    fn test_second_object() {
        let layout = FileLayout::whole_object(4 * MB as u32);
        let mut plen = 4096;
        let (obj_no, obj_off) = file_extent_to_object(&layout, 4 * MB + 12288, &mut plen);
        assert_eq!(obj_no, 1);
        assert_eq!(obj_off, 12288);
        assert_eq!(plen, 4096);
    }

    #[test]
    fn test_striped_layout() {
        // 1 MiB stripe units, two-way striping, 4 MiB objects: the fifth
        // stripe unit lands back on object 0, two stripe units in.
        let layout = FileLayout {
            stripe_unit: MB as u32,
            stripe_count: 2,
            object_size: 4 * MB as u32,
        };
        let mut plen = 4096;
        let (obj_no, obj_off) = file_extent_to_object(&layout, 4 * MB, &mut plen);
        assert_eq!(obj_no, 0);
        assert_eq!(obj_off, 2 * MB);
        assert_eq!(plen, 4096);
    }

    #[test]
    fn test_object_name_format() {
        assert_eq!(object_name(0x12345, 7), "12345.00000007");
        assert_eq!(object_name(0xdeadbeef, 0x1a2), "deadbeef.000001a2");
    }
}
