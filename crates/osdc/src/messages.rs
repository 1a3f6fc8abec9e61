//! Wire encoding and decoding for object requests and replies
//!
//! All integers are little-endian on the wire. The outbound front is sized
//! exactly at build time; `encode_request` checks that accounting when it
//! serializes.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{OSDClientError, Result};
use crate::types::{EVersion, UTime, OSD_OP_MASKTRUNC, OSD_OP_READ, OSD_OP_SETTRUNC,
    OSD_OP_STARTSYNC, OSD_OP_WRITE};

/// Message type for object requests (client to daemon).
pub const MSG_OSD_OP: u16 = 42;
/// Message type for object replies (daemon to client).
pub const MSG_OSD_OPREPLY: u16 = 43;
/// Message type for osd map updates.
pub const MSG_OSD_MAP: u16 = 41;

/// Fixed-size head of an outbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RequestHead {
    pub client_inc: u32,
    pub tid: u64,
    /// Placement-group routing for the object, filled in when the request is
    /// mapped against the current osd map.
    pub pgid: u64,
    pub snapid: u64,
    pub snap_seq: u64,
    pub num_snaps: u32,
    pub object_len: u32,
    pub ticket_len: u32,
    pub osdmap_epoch: u32,
    pub flags: u32,
    pub mtime: UTime,
    pub reassert_version: EVersion,
    pub num_ops: u16,
}

pub const REQUEST_HEAD_SIZE: usize = 78;

impl RequestHead {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.client_inc);
        buf.put_u64_le(self.tid);
        buf.put_u64_le(self.pgid);
        buf.put_u64_le(self.snapid);
        buf.put_u64_le(self.snap_seq);
        buf.put_u32_le(self.num_snaps);
        buf.put_u32_le(self.object_len);
        buf.put_u32_le(self.ticket_len);
        buf.put_u32_le(self.osdmap_epoch);
        buf.put_u32_le(self.flags);
        buf.put_u32_le(self.mtime.sec);
        buf.put_u32_le(self.mtime.nsec);
        buf.put_u32_le(self.reassert_version.epoch);
        buf.put_u64_le(self.reassert_version.version);
        buf.put_u16_le(self.num_ops);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < REQUEST_HEAD_SIZE {
            return Err(OSDClientError::CorruptReply(format!(
                "short request head: {} < {}",
                buf.remaining(),
                REQUEST_HEAD_SIZE
            )));
        }
        Ok(Self {
            client_inc: buf.get_u32_le(),
            tid: buf.get_u64_le(),
            pgid: buf.get_u64_le(),
            snapid: buf.get_u64_le(),
            snap_seq: buf.get_u64_le(),
            num_snaps: buf.get_u32_le(),
            object_len: buf.get_u32_le(),
            ticket_len: buf.get_u32_le(),
            osdmap_epoch: buf.get_u32_le(),
            flags: buf.get_u32_le(),
            mtime: UTime {
                sec: buf.get_u32_le(),
                nsec: buf.get_u32_le(),
            },
            reassert_version: EVersion {
                epoch: buf.get_u32_le(),
                version: buf.get_u64_le(),
            },
            num_ops: buf.get_u16_le(),
        })
    }
}

/// One operation entry of a request or reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OSDOp {
    pub op: u16,
    pub offset: u64,
    pub length: u64,
    pub payload_len: u32,
    pub truncate_seq: u32,
    pub truncate_size: u64,
}

pub const OSD_OP_SIZE: usize = 34;

impl OSDOp {
    pub fn read(offset: u64, length: u64) -> Self {
        Self {
            op: OSD_OP_READ,
            offset,
            length,
            ..Default::default()
        }
    }

    pub fn write(offset: u64, length: u64) -> Self {
        Self {
            op: OSD_OP_WRITE,
            offset,
            length,
            payload_len: length as u32,
            ..Default::default()
        }
    }

    pub fn masktrunc(truncate_seq: u32, truncate_size: u64) -> Self {
        Self {
            op: OSD_OP_MASKTRUNC,
            truncate_seq,
            truncate_size,
            ..Default::default()
        }
    }

    pub fn settrunc(truncate_seq: u32, truncate_size: u64) -> Self {
        Self {
            op: OSD_OP_SETTRUNC,
            truncate_seq,
            truncate_size,
            ..Default::default()
        }
    }

    pub fn startsync() -> Self {
        Self {
            op: OSD_OP_STARTSYNC,
            ..Default::default()
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16_le(self.op);
        buf.put_u64_le(self.offset);
        buf.put_u64_le(self.length);
        buf.put_u32_le(self.payload_len);
        buf.put_u32_le(self.truncate_seq);
        buf.put_u64_le(self.truncate_size);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < OSD_OP_SIZE {
            return Err(OSDClientError::CorruptReply(format!(
                "short osd op: {} < {}",
                buf.remaining(),
                OSD_OP_SIZE
            )));
        }
        Ok(Self {
            op: buf.get_u16_le(),
            offset: buf.get_u64_le(),
            length: buf.get_u64_le(),
            payload_len: buf.get_u32_le(),
            truncate_seq: buf.get_u32_le(),
            truncate_size: buf.get_u64_le(),
        })
    }
}

/// Exact front size of a request with the given variable parts.
pub fn request_front_size(
    num_ops: usize,
    oid_len: usize,
    ticket_len: usize,
    num_snaps: usize,
) -> usize {
    REQUEST_HEAD_SIZE + num_ops * OSD_OP_SIZE + oid_len + ticket_len + num_snaps * 8
}

/// Serialize a request front: head, op entries, oid bytes, ticket bytes,
/// snapshot ids.
pub fn encode_request(
    head: &RequestHead,
    ops: &[OSDOp],
    oid: &str,
    ticket: &[u8],
    snaps: &[u64],
) -> Bytes {
    let size = request_front_size(ops.len(), oid.len(), ticket.len(), snaps.len());
    let mut buf = BytesMut::with_capacity(size);
    head.encode(&mut buf);
    for op in ops {
        op.encode(&mut buf);
    }
    buf.put_slice(oid.as_bytes());
    buf.put_slice(ticket);
    for snap in snaps {
        buf.put_u64_le(*snap);
    }
    debug_assert_eq!(buf.len(), size, "request front size accounting is off");
    buf.freeze()
}

/// A request front parsed back into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedRequest {
    pub head: RequestHead,
    pub ops: Vec<OSDOp>,
    pub oid: String,
    pub ticket: Bytes,
    pub snaps: Vec<u64>,
}

/// Parse a request front (the daemon-side view of [`encode_request`]).
pub fn decode_request(front: &[u8]) -> Result<DecodedRequest> {
    let mut buf = front;
    let head = RequestHead::decode(&mut buf)?;
    let mut ops = Vec::with_capacity(head.num_ops as usize);
    for _ in 0..head.num_ops {
        ops.push(OSDOp::decode(&mut buf)?);
    }
    let tail = head.object_len as usize + head.ticket_len as usize + head.num_snaps as usize * 8;
    if buf.remaining() != tail {
        return Err(OSDClientError::CorruptReply(format!(
            "request tail is {} bytes, expected {}",
            buf.remaining(),
            tail
        )));
    }
    let oid = String::from_utf8(buf.copy_to_bytes(head.object_len as usize).to_vec())
        .map_err(|_| OSDClientError::CorruptReply("object name is not utf-8".into()))?;
    let ticket = buf.copy_to_bytes(head.ticket_len as usize);
    let mut snaps = Vec::with_capacity(head.num_snaps as usize);
    for _ in 0..head.num_snaps {
        snaps.push(buf.get_u64_le());
    }
    Ok(DecodedRequest {
        head,
        ops,
        oid,
        ticket,
        snaps,
    })
}

/// Fixed-size head of an inbound reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReplyHead {
    pub tid: u64,
    pub flags: u32,
    /// Zero on success, negative errno on failure.
    pub result: i32,
    pub object_len: u32,
    pub num_ops: u32,
    pub reassert_version: EVersion,
}

pub const REPLY_HEAD_SIZE: usize = 36;

impl ReplyHead {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.tid);
        buf.put_u32_le(self.flags);
        buf.put_i32_le(self.result);
        buf.put_u32_le(self.object_len);
        buf.put_u32_le(self.num_ops);
        buf.put_u32_le(self.reassert_version.epoch);
        buf.put_u64_le(self.reassert_version.version);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < REPLY_HEAD_SIZE {
            return Err(OSDClientError::CorruptReply(format!(
                "short reply head: {} < {}",
                buf.remaining(),
                REPLY_HEAD_SIZE
            )));
        }
        Ok(Self {
            tid: buf.get_u64_le(),
            flags: buf.get_u32_le(),
            result: buf.get_i32_le(),
            object_len: buf.get_u32_le(),
            num_ops: buf.get_u32_le(),
            reassert_version: EVersion {
                epoch: buf.get_u32_le(),
                version: buf.get_u64_le(),
            },
        })
    }
}

/// Serialize a reply front (head, op entries, oid bytes).
pub fn encode_reply(head: &ReplyHead, ops: &[OSDOp], oid: &str) -> Bytes {
    let mut buf =
        BytesMut::with_capacity(REPLY_HEAD_SIZE + ops.len() * OSD_OP_SIZE + oid.len());
    head.encode(&mut buf);
    for op in ops {
        op.encode(&mut buf);
    }
    buf.put_slice(oid.as_bytes());
    buf.freeze()
}

/// Parse and validate a reply front. The front must be at least a head, and
/// its total length must match the head's own accounting exactly.
pub fn decode_reply(front: &[u8]) -> Result<(ReplyHead, Vec<OSDOp>)> {
    let mut buf = front;
    let head = ReplyHead::decode(&mut buf)?;
    let expected =
        REPLY_HEAD_SIZE + head.object_len as usize + head.num_ops as usize * OSD_OP_SIZE;
    if front.len() != expected {
        return Err(OSDClientError::CorruptReply(format!(
            "reply front is {} bytes, expected {}",
            front.len(),
            expected
        )));
    }
    let mut ops = Vec::with_capacity(head.num_ops as usize);
    for _ in 0..head.num_ops {
        ops.push(OSDOp::decode(&mut buf)?);
    }
    Ok((head, ops))
}
