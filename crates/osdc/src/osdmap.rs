//! Versioned snapshot of cluster membership and data placement
//!
//! The map carries, per epoch: which daemons exist and are up, their
//! addresses, and the acting set of every placement group. Objects hash onto
//! placement groups; the first up member of a pg's acting set is its primary
//! and receives all client I/O for that pg.
//!
//! Topology changes arrive either as full maps or as incrementals that apply
//! on top of the epoch they succeed.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::error::{OSDClientError, Result};
use crate::types::{EntityAddr, PgId};

/// Cluster-unique filesystem identifier.
pub type Fsid = [u8; 16];

const HASH_SEED: u32 = 1315423911;

// Old Jenkins mix, kept for stable placement across releases.
#[inline]
fn hashmix(a: &mut u32, b: &mut u32, c: &mut u32) {
    *a = a.wrapping_sub(*b).wrapping_sub(*c);
    *a ^= *c >> 13;
    *b = b.wrapping_sub(*c).wrapping_sub(*a);
    *b ^= *a << 8;
    *c = c.wrapping_sub(*a).wrapping_sub(*b);
    *c ^= *b >> 13;
    *a = a.wrapping_sub(*b).wrapping_sub(*c);
    *a ^= *c >> 12;
    *b = b.wrapping_sub(*c).wrapping_sub(*a);
    *b ^= *a << 16;
    *c = c.wrapping_sub(*a).wrapping_sub(*b);
    *c ^= *b >> 5;
    *a = a.wrapping_sub(*b).wrapping_sub(*c);
    *a ^= *c >> 3;
    *b = b.wrapping_sub(*c).wrapping_sub(*a);
    *b ^= *a << 10;
    *c = c.wrapping_sub(*a).wrapping_sub(*b);
    *c ^= *b >> 15;
}

/// Stable string hash used to spread object names over placement groups.
pub fn str_hash(key: &[u8]) -> u32 {
    let mut hash = HASH_SEED;
    let mut x: u32 = 231232;
    let mut y: u32 = 1232;
    for chunk in key.chunks(4) {
        let mut word = [0u8; 4];
        word[..chunk.len()].copy_from_slice(chunk);
        let mut a = u32::from_le_bytes(word);
        hashmix(&mut a, &mut x, &mut hash);
        hashmix(&mut y, &mut a, &mut hash);
    }
    hash
}

/// One epoch of cluster topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OSDMap {
    pub fsid: Fsid,
    pub epoch: u32,
    /// Number of placement groups the object namespace is sharded into.
    pub pg_num: u32,
    pub osd_addrs: BTreeMap<i32, EntityAddr>,
    pub osd_up: BTreeSet<i32>,
    /// Acting set per placement group, primary candidates first.
    pub pg_acting: BTreeMap<PgId, Vec<i32>>,
}

impl OSDMap {
    pub fn new(fsid: Fsid, epoch: u32, pg_num: u32) -> Self {
        Self {
            fsid,
            epoch,
            pg_num,
            osd_addrs: BTreeMap::new(),
            osd_up: BTreeSet::new(),
            pg_acting: BTreeMap::new(),
        }
    }

    /// Placement group an object name hashes onto.
    pub fn pg_for_object(&self, oid: &str) -> PgId {
        PgId(str_hash(oid.as_bytes()) % self.pg_num.max(1))
    }

    /// First up member of the pg's acting set, or -1 when the pg currently
    /// has no up member.
    pub fn pg_primary(&self, pgid: PgId) -> i32 {
        match self.pg_acting.get(&pgid) {
            Some(acting) => acting
                .iter()
                .copied()
                .find(|osd| self.osd_up.contains(osd))
                .unwrap_or(-1),
            None => -1,
        }
    }

    pub fn osd_addr(&self, osd: i32) -> Option<EntityAddr> {
        self.osd_addrs.get(&osd).copied()
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.fsid);
        buf.put_u32_le(self.epoch);
        buf.put_u32_le(self.pg_num);
        buf.put_u32_le(self.osd_addrs.len() as u32);
        for (osd, addr) in &self.osd_addrs {
            buf.put_i32_le(*osd);
            buf.put_u8(u8::from(self.osd_up.contains(osd)));
            encode_addr(addr, buf);
        }
        buf.put_u32_le(self.pg_acting.len() as u32);
        for (pgid, acting) in &self.pg_acting {
            buf.put_u32_le(pgid.0);
            buf.put_u32_le(acting.len() as u32);
            for osd in acting {
                buf.put_i32_le(*osd);
            }
        }
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self> {
        let fsid = decode_fsid(buf)?;
        need(buf, 8, "osd map header")?;
        let epoch = buf.get_u32_le();
        let pg_num = buf.get_u32_le();
        let mut map = Self::new(fsid, epoch, pg_num);

        need(buf, 4, "osd count")?;
        let num_osds = buf.get_u32_le();
        for _ in 0..num_osds {
            need(buf, 5, "osd entry")?;
            let osd = buf.get_i32_le();
            let up = buf.get_u8() != 0;
            let addr = decode_addr(buf)?;
            map.osd_addrs.insert(osd, addr);
            if up {
                map.osd_up.insert(osd);
            }
        }

        need(buf, 4, "pg count")?;
        let num_pgs = buf.get_u32_le();
        for _ in 0..num_pgs {
            need(buf, 8, "pg entry")?;
            let pgid = PgId(buf.get_u32_le());
            let len = buf.get_u32_le() as usize;
            need(buf, len * 4, "acting set")?;
            let mut acting = Vec::with_capacity(len);
            for _ in 0..len {
                acting.push(buf.get_i32_le());
            }
            map.pg_acting.insert(pgid, acting);
        }
        Ok(map)
    }
}

/// Difference between one epoch and the next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OSDMapIncremental {
    pub fsid: Fsid,
    /// Epoch this incremental produces when applied to its predecessor.
    pub epoch: u32,
    pub new_up: Vec<(i32, EntityAddr)>,
    pub new_down: Vec<i32>,
    pub new_acting: Vec<(PgId, Vec<i32>)>,
}

impl OSDMapIncremental {
    pub fn new(fsid: Fsid, epoch: u32) -> Self {
        Self {
            fsid,
            epoch,
            new_up: Vec::new(),
            new_down: Vec::new(),
            new_acting: Vec::new(),
        }
    }

    /// Apply on top of `base`, producing the map for `self.epoch`.
    pub fn apply(&self, base: &OSDMap) -> OSDMap {
        debug_assert_eq!(base.epoch + 1, self.epoch);
        let mut map = base.clone();
        map.epoch = self.epoch;
        for (osd, addr) in &self.new_up {
            map.osd_addrs.insert(*osd, *addr);
            map.osd_up.insert(*osd);
        }
        for osd in &self.new_down {
            map.osd_up.remove(osd);
        }
        for (pgid, acting) in &self.new_acting {
            map.pg_acting.insert(*pgid, acting.clone());
        }
        map
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.fsid);
        buf.put_u32_le(self.epoch);
        buf.put_u32_le(self.new_up.len() as u32);
        for (osd, addr) in &self.new_up {
            buf.put_i32_le(*osd);
            encode_addr(addr, buf);
        }
        buf.put_u32_le(self.new_down.len() as u32);
        for osd in &self.new_down {
            buf.put_i32_le(*osd);
        }
        buf.put_u32_le(self.new_acting.len() as u32);
        for (pgid, acting) in &self.new_acting {
            buf.put_u32_le(pgid.0);
            buf.put_u32_le(acting.len() as u32);
            for osd in acting {
                buf.put_i32_le(*osd);
            }
        }
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self> {
        let fsid = decode_fsid(buf)?;
        need(buf, 4, "incremental epoch")?;
        let epoch = buf.get_u32_le();
        let mut inc = Self::new(fsid, epoch);

        need(buf, 4, "new_up count")?;
        let n = buf.get_u32_le();
        for _ in 0..n {
            need(buf, 4, "new_up entry")?;
            let osd = buf.get_i32_le();
            let addr = decode_addr(buf)?;
            inc.new_up.push((osd, addr));
        }

        need(buf, 4, "new_down count")?;
        let n = buf.get_u32_le();
        need(buf, n as usize * 4, "new_down entries")?;
        for _ in 0..n {
            inc.new_down.push(buf.get_i32_le());
        }

        need(buf, 4, "new_acting count")?;
        let n = buf.get_u32_le();
        for _ in 0..n {
            need(buf, 8, "new_acting entry")?;
            let pgid = PgId(buf.get_u32_le());
            let len = buf.get_u32_le() as usize;
            need(buf, len * 4, "new_acting set")?;
            let mut acting = Vec::with_capacity(len);
            for _ in 0..len {
                acting.push(buf.get_i32_le());
            }
            inc.new_acting.push((pgid, acting));
        }
        Ok(inc)
    }
}

/// Frame a map message: fsid, then length-prefixed incrementals, then
/// length-prefixed full maps.
pub fn encode_map_message(
    fsid: &Fsid,
    incrementals: &[OSDMapIncremental],
    full_maps: &[OSDMap],
) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_slice(fsid);
    buf.put_u32_le(incrementals.len() as u32);
    for inc in incrementals {
        let mut body = BytesMut::new();
        inc.encode(&mut body);
        buf.put_u32_le(inc.epoch);
        buf.put_u32_le(body.len() as u32);
        buf.put_slice(&body);
    }
    buf.put_u32_le(full_maps.len() as u32);
    for map in full_maps {
        let mut body = BytesMut::new();
        map.encode(&mut body);
        buf.put_u32_le(map.epoch);
        buf.put_u32_le(body.len() as u32);
        buf.put_slice(&body);
    }
    buf.freeze()
}

pub(crate) fn decode_fsid(buf: &mut impl Buf) -> Result<Fsid> {
    need(buf, 16, "fsid")?;
    let mut fsid = [0u8; 16];
    buf.copy_to_slice(&mut fsid);
    Ok(fsid)
}

pub(crate) fn need(buf: &impl Buf, n: usize, what: &str) -> Result<()> {
    if buf.remaining() < n {
        return Err(OSDClientError::CorruptMap(format!(
            "truncated {}: need {} bytes, have {}",
            what,
            n,
            buf.remaining()
        )));
    }
    Ok(())
}

fn encode_addr(addr: &EntityAddr, buf: &mut BytesMut) {
    match addr.addr.ip() {
        IpAddr::V4(ip) => {
            buf.put_u8(4);
            buf.put_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            buf.put_u8(6);
            buf.put_slice(&ip.octets());
        }
    }
    buf.put_u16_le(addr.addr.port());
    buf.put_u32_le(addr.nonce);
}

fn decode_addr(buf: &mut impl Buf) -> Result<EntityAddr> {
    need(buf, 1, "address family")?;
    let ip = match buf.get_u8() {
        4 => {
            need(buf, 4, "v4 address")?;
            let mut octets = [0u8; 4];
            buf.copy_to_slice(&mut octets);
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        6 => {
            need(buf, 16, "v6 address")?;
            let mut octets = [0u8; 16];
            buf.copy_to_slice(&mut octets);
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        other => {
            return Err(OSDClientError::CorruptMap(format!(
                "unknown address family {}",
                other
            )))
        }
    };
    need(buf, 6, "address tail")?;
    let port = buf.get_u16_le();
    let nonce = buf.get_u32_le();
    Ok(EntityAddr::new(SocketAddr::new(ip, port), nonce))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> EntityAddr {
        EntityAddr::new(SocketAddr::from(([127, 0, 0, 1], port)), port as u32)
    }

    fn base_map() -> OSDMap {
        let mut map = OSDMap::new([1; 16], 1, 8);
        for osd in 0..3 {
            map.osd_addrs.insert(osd, addr(6800 + osd as u16));
            map.osd_up.insert(osd);
        }
        map.pg_acting.insert(PgId(0), vec![0, 1]);
        map.pg_acting.insert(PgId(1), vec![2, 0]);
        map
    }

    #[test]
    fn test_primary_skips_down_osds() {
        let mut map = base_map();
        assert_eq!(map.pg_primary(PgId(0)), 0);
        map.osd_up.remove(&0);
        assert_eq!(map.pg_primary(PgId(0)), 1);
        map.osd_up.remove(&1);
        assert_eq!(map.pg_primary(PgId(0)), -1);
        // A pg with no acting set has no route at all.
        assert_eq!(map.pg_primary(PgId(7)), -1);
    }

    #[test]
    fn test_pg_for_object_is_stable() {
        let map = base_map();
        let pg = map.pg_for_object("12345.00000007");
        assert_eq!(pg, map.pg_for_object("12345.00000007"));
        assert!(pg.0 < map.pg_num);
    }

    #[test]
    fn test_full_map_round_trip() {
        let map = base_map();
        let mut buf = BytesMut::new();
        map.encode(&mut buf);
        let decoded = OSDMap::decode(&mut buf.freeze()).unwrap();
        assert_eq!(decoded, map);
    }

    #[test]
    fn test_incremental_round_trip() {
        let mut inc = OSDMapIncremental::new([1; 16], 2);
        inc.new_up.push((5, addr(6805)));
        inc.new_down.push(1);
        inc.new_acting.push((PgId(0), vec![5, 2]));
        let mut buf = BytesMut::new();
        inc.encode(&mut buf);
        let decoded = OSDMapIncremental::decode(&mut buf.freeze()).unwrap();
        assert_eq!(decoded, inc);
    }

    #[test]
    fn test_incrementals_match_equivalent_full_map() {
        // Applying a contiguous run of incrementals must land on the same
        // topology as decoding the equivalent full map.
        let base = base_map();

        let mut inc2 = OSDMapIncremental::new([1; 16], 2);
        inc2.new_up.push((5, addr(6805)));
        inc2.new_acting.push((PgId(0), vec![5, 1]));

        let mut inc3 = OSDMapIncremental::new([1; 16], 3);
        inc3.new_down.push(2);
        inc3.new_acting.push((PgId(1), vec![0]));

        let stepped = inc3.apply(&inc2.apply(&base));

        let mut full = base.clone();
        full.epoch = 3;
        full.osd_addrs.insert(5, addr(6805));
        full.osd_up.insert(5);
        full.osd_up.remove(&2);
        full.pg_acting.insert(PgId(0), vec![5, 1]);
        full.pg_acting.insert(PgId(1), vec![0]);

        assert_eq!(stepped, full);
    }

    #[test]
    fn test_truncated_map_is_rejected() {
        let map = base_map();
        let mut buf = BytesMut::new();
        map.encode(&mut buf);
        let truncated = buf.freeze().slice(..20);
        assert!(matches!(
            OSDMap::decode(&mut truncated.clone()),
            Err(OSDClientError::CorruptMap(_))
        ));
    }
}
