//! In-flight request record
//!
//! One record per pending object operation. The record owns the structured
//! request body (re-encoded on every send attempt), the caller's page vector,
//! both completion signals, and the routing state that ties it to a daemon
//! session. Records are shared via `Arc`: the request index holds one handle
//! on the record's behalf while it is registered, callers hold their own, and
//! every wire message built from the record keeps it alive through the send.

use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::completion::Completion;
use crate::layout::{file_extent_to_object, object_name};
use crate::messages::{encode_request, request_front_size, OSDOp, RequestHead};
use crate::pool::PoolPermit;
use crate::transport::Message;
use crate::types::{
    calc_pages_for, EVersion, EntityAddr, FileLayout, OsdFlags, Pages, SnapContext, UTime, Vino,
    OSD_OP_READ,
};

/// Callback invoked instead of the completion signal when set.
pub type RequestCallback = Box<dyn Fn(&OSDRequest) + Send + Sync>;

pub struct OSDRequest {
    tid: AtomicU64,
    pub oid: String,
    pub file_layout: FileLayout,
    pub snapc: Option<Arc<SnapContext>>,
    pub ops: Vec<OSDOp>,
    ticket: Bytes,
    snaps: Vec<u64>,

    head: Mutex<RequestHead>,
    flags: AtomicU32,

    pages: Mutex<Option<Pages>>,
    num_pages: AtomicUsize,

    result: AtomicI32,
    reassert_version: Mutex<EVersion>,
    timeout_stamp: Mutex<Instant>,

    /// Ordinal of the session this request is routed to, -1 when unrouted.
    /// Only mutated under the client's request-state lock.
    routed_osd: AtomicI32,
    /// Address of the last daemon this request was routed to; survives
    /// session teardown so reset matching and timeout pings keep working.
    last_addr: Mutex<Option<EntityAddr>>,

    got_reply: AtomicBool,
    aborted: AtomicBool,
    resend: AtomicBool,
    prepared_pages: AtomicBool,

    request_msg: Mutex<Option<Arc<Message>>>,
    reply_msg: Mutex<Option<Arc<Message>>>,

    /// Fires on the first response.
    pub done: Completion,
    /// Fires when the daemon reports the write durable.
    pub safe: Completion,
    callback: Mutex<Option<RequestCallback>>,
    safe_callback: Mutex<Option<RequestCallback>>,

    _pool_permit: Option<PoolPermit>,
}

impl OSDRequest {
    /// Build a request record and its on-wire body; shorten the extent as
    /// needed if it crosses an object boundary.
    ///
    /// If the file was recently truncated, a truncate op rides along so the
    /// daemon can update the object: masking returned data for reads, and
    /// recording the new boundary for writes. The boundary is rebased by the
    /// gap between the file offset and the object offset so the daemon sees
    /// it in object-relative units. With `do_sync`, a startsync op asks the
    /// daemon to flush promptly.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn build(
        layout: &FileLayout,
        vino: Vino,
        off: u64,
        plen: &mut u64,
        opcode: u16,
        flags: OsdFlags,
        snapc: Option<Arc<SnapContext>>,
        do_sync: bool,
        truncate_seq: u32,
        truncate_size: u64,
        mtime: UTime,
        client_inc: u32,
        ticket: Bytes,
        pool_permit: Option<PoolPermit>,
    ) -> Arc<OSDRequest> {
        assert!(
            flags.intersects(OsdFlags::READ | OsdFlags::WRITE),
            "request is neither read nor write"
        );

        // The truncate check must see the caller's full extent, not the
        // boundary-shortened one.
        let orig_len = *plen;
        let (obj_no, obj_off) = file_extent_to_object(layout, off, plen);
        let oid = object_name(vino.ino, obj_no);

        let is_write = flags.contains(OsdFlags::WRITE);
        let mut ops = Vec::with_capacity(3);
        ops.push(if is_write {
            OSDOp::write(obj_off, *plen)
        } else {
            OSDOp::read(obj_off, *plen)
        });
        ops[0].op = opcode;

        let do_trunc = truncate_seq != 0 && off + orig_len > truncate_size;
        if do_trunc {
            // Rebase the truncate boundary into object-relative units
            // matching the primary op's offset.
            let biased = truncate_size.wrapping_sub(off - obj_off);
            ops.push(if opcode == OSD_OP_READ {
                OSDOp::masktrunc(truncate_seq, biased)
            } else {
                OSDOp::settrunc(truncate_seq, biased)
            });
        }
        if do_sync {
            ops.push(OSDOp::startsync());
        }

        let head = RequestHead {
            client_inc,
            tid: 0,
            pgid: 0,
            snapid: vino.snap,
            snap_seq: snapc.as_ref().map_or(0, |s| s.seq),
            num_snaps: snapc.as_ref().map_or(0, |s| s.snaps.len() as u32),
            object_len: oid.len() as u32,
            ticket_len: ticket.len() as u32,
            osdmap_epoch: 0,
            flags: flags.bits(),
            mtime: if is_write { mtime } else { UTime::zero() },
            reassert_version: EVersion::default(),
            num_ops: ops.len() as u16,
        };
        let snaps = snapc.as_ref().map_or_else(Vec::new, |s| s.snaps.clone());

        // The body must encode to exactly the size the head accounts for.
        debug_assert_eq!(
            encode_request(&head, &ops, &oid, &ticket, &snaps).len(),
            request_front_size(ops.len(), oid.len(), ticket.len(), snaps.len())
        );

        let num_pages = calc_pages_for(off, *plen);
        tracing::debug!(
            "built request for {} ({}~{}, {} ops, {} pages)",
            oid,
            obj_off,
            *plen,
            ops.len(),
            num_pages
        );

        Arc::new(OSDRequest {
            tid: AtomicU64::new(0),
            oid,
            file_layout: *layout,
            snapc,
            ops,
            ticket,
            snaps,
            head: Mutex::new(head),
            flags: AtomicU32::new(flags.bits()),
            pages: Mutex::new(None),
            num_pages: AtomicUsize::new(num_pages),
            result: AtomicI32::new(0),
            reassert_version: Mutex::new(EVersion::default()),
            timeout_stamp: Mutex::new(Instant::now()),
            routed_osd: AtomicI32::new(-1),
            last_addr: Mutex::new(None),
            got_reply: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            resend: AtomicBool::new(false),
            prepared_pages: AtomicBool::new(false),
            request_msg: Mutex::new(None),
            reply_msg: Mutex::new(None),
            done: Completion::new(),
            safe: Completion::new(),
            callback: Mutex::new(None),
            safe_callback: Mutex::new(None),
            _pool_permit: pool_permit,
        })
    }

    pub fn tid(&self) -> u64 {
        self.tid.load(Ordering::SeqCst)
    }

    pub(crate) fn set_tid(&self, tid: u64) {
        self.tid.store(tid, Ordering::SeqCst);
        self.head.lock().expect("head lock poisoned").tid = tid;
    }

    pub fn flags(&self) -> OsdFlags {
        OsdFlags::from_bits_truncate(self.flags.load(Ordering::SeqCst))
    }

    pub(crate) fn add_flags(&self, flags: OsdFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::SeqCst);
    }

    pub fn is_write(&self) -> bool {
        self.flags().contains(OsdFlags::WRITE)
    }

    pub fn result(&self) -> i32 {
        self.result.load(Ordering::SeqCst)
    }

    pub(crate) fn set_result(&self, result: i32) {
        self.result.store(result, Ordering::SeqCst);
    }

    pub fn reassert_version(&self) -> EVersion {
        *self.reassert_version.lock().expect("reassert lock poisoned")
    }

    pub(crate) fn set_reassert_version(&self, v: EVersion) {
        *self.reassert_version.lock().expect("reassert lock poisoned") = v;
    }

    /// True on the first call only; later responses are acks or commits.
    pub(crate) fn mark_got_reply(&self) -> bool {
        !self.got_reply.swap(true, Ordering::SeqCst)
    }

    pub fn got_reply(&self) -> bool {
        self.got_reply.load(Ordering::SeqCst)
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    pub(crate) fn set_aborted(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    pub fn needs_resend(&self) -> bool {
        self.resend.load(Ordering::SeqCst)
    }

    pub(crate) fn set_resend(&self, v: bool) {
        self.resend.store(v, Ordering::SeqCst);
    }

    pub(crate) fn prepared_pages(&self) -> bool {
        self.prepared_pages.load(Ordering::SeqCst)
    }

    pub(crate) fn set_prepared_pages(&self) {
        self.prepared_pages.store(true, Ordering::SeqCst);
    }

    pub fn routed_osd(&self) -> i32 {
        self.routed_osd.load(Ordering::SeqCst)
    }

    pub(crate) fn set_routed_osd(&self, osd: i32) {
        self.routed_osd.store(osd, Ordering::SeqCst);
    }

    pub fn last_addr(&self) -> Option<EntityAddr> {
        *self.last_addr.lock().expect("addr lock poisoned")
    }

    pub(crate) fn set_last_addr(&self, addr: Option<EntityAddr>) {
        *self.last_addr.lock().expect("addr lock poisoned") = addr;
    }

    pub(crate) fn timeout_stamp(&self) -> Instant {
        *self.timeout_stamp.lock().expect("stamp lock poisoned")
    }

    pub(crate) fn set_timeout_stamp(&self, at: Instant) {
        *self.timeout_stamp.lock().expect("stamp lock poisoned") = at;
    }

    /// Attach the caller's page vector; `num_pages` must cover the (possibly
    /// shortened) extent.
    pub fn set_pages(&self, pages: Pages, num_pages: usize) {
        *self.pages.lock().expect("pages lock poisoned") = Some(pages);
        self.num_pages.store(num_pages, Ordering::SeqCst);
    }

    pub fn pages(&self) -> Option<Pages> {
        self.pages.lock().expect("pages lock poisoned").clone()
    }

    pub fn num_pages(&self) -> usize {
        self.num_pages.load(Ordering::SeqCst)
    }

    pub(crate) fn set_request_msg(&self, msg: Arc<Message>) {
        *self.request_msg.lock().expect("msg lock poisoned") = Some(msg);
    }

    pub fn request_msg(&self) -> Option<Arc<Message>> {
        self.request_msg.lock().expect("msg lock poisoned").clone()
    }

    pub(crate) fn set_reply_msg(&self, msg: Arc<Message>) {
        *self.reply_msg.lock().expect("msg lock poisoned") = Some(msg);
    }

    pub(crate) fn take_reply_msg(&self) -> Option<Arc<Message>> {
        self.reply_msg.lock().expect("msg lock poisoned").take()
    }

    pub fn set_callback(&self, cb: RequestCallback) {
        *self.callback.lock().expect("callback lock poisoned") = Some(cb);
    }

    pub fn set_safe_callback(&self, cb: RequestCallback) {
        *self.safe_callback.lock().expect("callback lock poisoned") = Some(cb);
    }

    /// First-response notification: the per-request callback when set,
    /// otherwise the `done` signal.
    pub(crate) fn notify_done(&self) {
        let cb = self.callback.lock().expect("callback lock poisoned");
        match &*cb {
            Some(cb) => cb(self),
            None => {
                self.done.complete();
            }
        }
    }

    /// Commit notification: optional safe callback, then the `safe` signal.
    pub(crate) fn notify_safe(&self) {
        if let Some(cb) = &*self.safe_callback.lock().expect("callback lock poisoned") {
            cb(self);
        }
        self.safe.complete();
    }

    /// Bytes riding outside the front: the write payload length.
    pub(crate) fn data_len(&self) -> u32 {
        if self.is_write() {
            self.ops[0].payload_len
        } else {
            0
        }
    }

    /// Stamp the per-send head fields and serialize the front.
    pub(crate) fn encode_front(&self, osdmap_epoch: u32) -> Bytes {
        let mut head = self.head.lock().expect("head lock poisoned");
        head.osdmap_epoch = osdmap_epoch;
        head.flags |= self.flags.load(Ordering::SeqCst);
        head.reassert_version = self.reassert_version();
        encode_request(&head, &self.ops, &self.oid, &self.ticket, &self.snaps)
    }

    pub(crate) fn set_pgid(&self, pgid: u64) {
        self.head.lock().expect("head lock poisoned").pgid = pgid;
    }
}

impl std::fmt::Debug for OSDRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OSDRequest")
            .field("tid", &self.tid())
            .field("oid", &self.oid)
            .field("flags", &self.flags())
            .field("routed_osd", &self.routed_osd())
            .field("got_reply", &self.got_reply())
            .field("aborted", &self.is_aborted())
            .finish()
    }
}
