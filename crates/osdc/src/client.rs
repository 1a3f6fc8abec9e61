//! OSD client
//!
//! Owns the table of pending requests and the sessions to the daemons they
//! are routed to, dispatches new requests against the current osd map,
//! resubmits them when the topology changes or a transport channel resets,
//! and drives completion from daemon replies.
//!
//! # Locking
//!
//! Two ordered locks protect the shared state, acquired strictly in this
//! order, with the per-message page lock last:
//!
//! 1. `map` — read for anything that consults the osd map (sending,
//!    kicking), write only while swapping in a new map.
//! 2. `inflight` — the request index, the daemon registry, the tid counter,
//!    the live-count, and the timeout anchor.
//!
//! The only suspension points while a request is pending are the completion
//! waits in the facade; both locks are released across them.

use bytes::{Buf, Bytes};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{OSDClientError, Result};
use crate::messages::{decode_reply, MSG_OSD_OP, MSG_OSD_OPREPLY};
use crate::osdmap::{self, OSDMap, OSDMapIncremental};
use crate::pool::{RequestPool, POOL_SIZE};
use crate::request::OSDRequest;
use crate::session::OSDSession;
use crate::transport::{Message, MonitorClient, Transport};
use crate::types::{
    calc_pages_for, EntityAddr, FileLayout, OsdFlags, Pages, SnapContext, UTime, Vino, NOSNAP,
    OSD_OP_READ, OSD_OP_WRITE,
};

/// Configuration for the OSD client
#[derive(Debug, Clone)]
pub struct OSDClientConfig {
    /// How long a request may sit unanswered before its daemon is pinged;
    /// also the cadence of the timeout worker.
    pub osd_timeout: Duration,
    /// Client incarnation, stamped into every request head.
    pub client_inc: u32,
    /// Expected cluster filesystem id; maps for other clusters are dropped.
    pub fsid: osdmap::Fsid,
    /// Opaque authentication ticket carried in every request.
    pub ticket: Bytes,
    /// Slots in the nofail request pool.
    pub pool_size: usize,
}

impl Default for OSDClientConfig {
    fn default() -> Self {
        Self {
            osd_timeout: Duration::from_secs(60),
            client_inc: 1,
            fsid: [0; 16],
            ticket: Bytes::new(),
            pool_size: POOL_SIZE,
        }
    }
}

/// Everything guarded by the request-state lock.
#[derive(Default)]
struct Inflight {
    last_tid: u64,
    /// Pending requests, ordered by tid.
    requests: BTreeMap<u64, Arc<OSDRequest>>,
    /// Open daemon sessions, keyed by ordinal.
    osds: BTreeMap<i32, OSDSession>,
    num_requests: usize,
    /// Tid the armed timeout worker was anchored on.
    timeout_tid: u64,
}

/// Outcome of mapping a request against the current osd map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MapResult {
    Unchanged,
    Changed,
    NoPrimary,
}

pub struct OSDClient {
    config: OSDClientConfig,
    transport: Arc<dyn Transport>,
    monitor: Arc<dyn MonitorClient>,
    map: RwLock<Option<Arc<OSDMap>>>,
    inflight: Mutex<Inflight>,
    pool: RequestPool,
    timeout_task: StdMutex<Option<JoinHandle<()>>>,
    self_weak: Weak<OSDClient>,
}

impl OSDClient {
    pub fn new(
        config: OSDClientConfig,
        transport: Arc<dyn Transport>,
        monitor: Arc<dyn MonitorClient>,
    ) -> Arc<Self> {
        info!("creating osd client, timeout {:?}", config.osd_timeout);
        let pool = RequestPool::new(config.pool_size.max(1));
        Arc::new_cyclic(|weak| Self {
            config,
            transport,
            monitor,
            map: RwLock::new(None),
            inflight: Mutex::new(Inflight::default()),
            pool,
            timeout_task: StdMutex::new(None),
            self_weak: weak.clone(),
        })
    }

    pub fn config(&self) -> &OSDClientConfig {
        &self.config
    }

    /// Build a request record, shortening `plen` at an object boundary.
    /// With `use_pool`, a pool slot is held for the request's lifetime; the
    /// call waits if the pool is drained.
    #[allow(clippy::too_many_arguments)]
    pub async fn new_request(
        &self,
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
        use_pool: bool,
    ) -> Arc<OSDRequest> {
        let permit = if use_pool {
            Some(self.pool.acquire().await)
        } else {
            None
        };
        OSDRequest::build(
            layout,
            vino,
            off,
            plen,
            opcode,
            flags,
            snapc,
            do_sync,
            truncate_seq,
            truncate_size,
            mtime,
            self.config.client_inc,
            self.config.ticket.clone(),
            permit,
        )
    }

    // =======================================================================
    // Registration
    // =======================================================================

    /// Assign the next tid and enter the request into the index. The index
    /// holds one reference on the request's behalf until unregistration. The
    /// first registered request arms the timeout worker.
    async fn register_request(&self, req: &Arc<OSDRequest>) {
        let mut inflight = self.inflight.lock().await;
        inflight.last_tid += 1;
        let tid = inflight.last_tid;
        req.set_tid(tid);

        debug!("register tid {} ({})", tid, req.oid);
        let prev = inflight.requests.insert(tid, Arc::clone(req));
        assert!(prev.is_none(), "tid {} already registered", tid);
        inflight.num_requests += 1;
        req.set_timeout_stamp(Instant::now() + self.config.osd_timeout);

        if inflight.num_requests == 1 {
            inflight.timeout_tid = tid;
            debug!("arming timeout worker on tid {}", tid);
            self.arm_timeout_worker();
        }
    }

    /// Remove a request from the index and its session. Caller holds the
    /// request-state lock.
    fn unregister_request(&self, inflight: &mut Inflight, req: &Arc<OSDRequest>) {
        let tid = req.tid();
        if inflight.requests.remove(&tid).is_none() {
            return;
        }
        debug!("unregister tid {}", tid);
        inflight.num_requests -= 1;
        Self::detach_session(inflight, req);

        if tid == inflight.timeout_tid {
            if inflight.num_requests == 0 {
                debug!("no requests left, cancelling timeout worker");
                inflight.timeout_tid = 0;
                self.cancel_timeout_worker();
            } else {
                let first = *inflight.requests.keys().next().expect("index not empty");
                inflight.timeout_tid = first;
            }
        }
    }

    /// Leave the routed session, destroying it if this was its last request.
    /// Membership and the back-pointer change in one critical section.
    fn detach_session(inflight: &mut Inflight, req: &Arc<OSDRequest>) {
        let osd = req.routed_osd();
        if osd < 0 {
            return;
        }
        req.set_routed_osd(-1);
        if let Some(session) = inflight.osds.get_mut(&osd) {
            session.requests.remove(&req.tid());
            if session.requests.is_empty() {
                debug!("closing idle session to osd{}", osd);
                inflight.osds.remove(&osd);
            }
        }
    }

    // =======================================================================
    // Dispatch
    // =======================================================================

    /// Route a request to the primary of its placement group, moving it
    /// between sessions as needed. Caller holds the map lock for read and
    /// the request-state lock.
    fn map_osds(
        &self,
        map: &OSDMap,
        inflight: &mut Inflight,
        req: &Arc<OSDRequest>,
    ) -> Result<MapResult> {
        let pgid = map.pg_for_object(&req.oid);
        let primary = map.pg_primary(pgid);
        req.set_pgid(pgid.0 as u64);

        let current = req.routed_osd();
        if current >= 0 && current == primary {
            return Ok(MapResult::Unchanged);
        }
        debug!(
            "map_osds tid {} pg {} -> osd{} (was osd{})",
            req.tid(),
            pgid.0,
            primary,
            current
        );

        Self::detach_session(inflight, req);
        if primary < 0 {
            return Ok(MapResult::NoPrimary);
        }

        if !inflight.osds.contains_key(&primary) {
            let addr = map
                .osd_addr(primary)
                .ok_or(OSDClientError::NoAddress(primary))?;
            let conn = self.transport.connect(primary, addr)?;
            info!("opened session to osd{} at {}", primary, addr.addr);
            inflight
                .osds
                .insert(primary, OSDSession::new(primary, addr, conn));
        }
        let session = inflight.osds.get_mut(&primary).expect("session ensured");
        session.requests.insert(req.tid());
        req.set_routed_osd(primary);
        req.set_last_addr(Some(session.addr));
        Ok(MapResult::Changed)
    }

    /// Stamp the per-send head fields and hand the request to the transport.
    /// With no up primary, a newer map is requested and the request stays
    /// registered to be kicked when it arrives. Caller holds the map lock
    /// for read and the request-state lock.
    fn send_request(
        &self,
        map: &OSDMap,
        inflight: &mut Inflight,
        req: &Arc<OSDRequest>,
    ) -> Result<()> {
        if let MapResult::NoPrimary = self.map_osds(map, inflight, req)? {
            debug!("tid {} has no up osd in its pg", req.tid());
            self.monitor.request_map(map.epoch + 1);
            return Ok(());
        }

        let osd = req.routed_osd();
        let conn = inflight
            .osds
            .get(&osd)
            .map(|s| Arc::clone(&s.conn))
            .ok_or_else(|| OSDClientError::Transport(format!("no session for osd{}", osd)))?;

        debug!(
            "send tid {} to osd{} flags {:?}",
            req.tid(),
            osd,
            req.flags()
        );
        let front = req.encode_front(map.epoch);
        let msg = Message::new(MSG_OSD_OP, req.tid(), front, req.data_len());
        if let Some(pages) = req.pages() {
            msg.attach_pages(pages);
        }
        req.set_request_msg(Arc::clone(&msg));
        req.set_timeout_stamp(Instant::now() + self.config.osd_timeout);

        // An abort may have raced the rebuild of the message; it must win
        // against this send too.
        if req.is_aborted() {
            msg.revoke_pages();
            debug!("tid {} aborted, dropping send", req.tid());
            return Ok(());
        }
        conn.send(msg)
    }

    /// Register a request and make the initial send attempt.
    ///
    /// With `nofail`, a failed send leaves the request registered and marked
    /// for resend; the timeout worker retries it. Otherwise the request is
    /// unregistered and the error returned.
    pub async fn start_request(&self, req: &Arc<OSDRequest>, nofail: bool) -> Result<()> {
        self.register_request(req).await;

        let map_guard = self.map.read().await;
        let Some(map) = map_guard.as_ref() else {
            // No topology yet. Leave the request registered; the first map
            // to arrive kicks it out.
            debug!("tid {} started before any osd map", req.tid());
            self.monitor.request_map(1);
            return Ok(());
        };

        let mut inflight = self.inflight.lock().await;
        match self.send_request(map, &mut inflight, req) {
            Ok(()) => Ok(()),
            Err(e) if nofail => {
                debug!("tid {} failed to send, marking for resend: {}", req.tid(), e);
                req.set_resend(true);
                Ok(())
            }
            Err(e) => {
                self.unregister_request(&mut inflight, req);
                Err(e)
            }
        }
    }

    // =======================================================================
    // Kick protocol
    // =======================================================================

    /// Resubmit requests whose daemon or route has changed. With `who`, also
    /// force-resend everything last routed to that address (transport
    /// reset). Requests that map to no up daemon are counted and a newer map
    /// requested once at the end.
    pub async fn kick_requests(&self, who: Option<EntityAddr>) {
        let map_guard = self.map.read().await;
        if let Some(map) = map_guard.as_ref() {
            self.kick_locked(map, who).await;
        }
    }

    async fn kick_locked(&self, map: &OSDMap, who: Option<EntityAddr>) {
        let mut needmap = 0;
        let mut next_tid = 0u64;
        loop {
            // Iteration restarts from the next tid each pass, so it stays
            // valid across concurrent registration and completion.
            let mut inflight = self.inflight.lock().await;
            let Some((tid, req)) = inflight
                .requests
                .range(next_tid..)
                .next()
                .map(|(t, r)| (*t, Arc::clone(r)))
            else {
                break;
            };
            next_tid = tid + 1;

            let force = req.needs_resend()
                || who.is_some_and(|addr| req.last_addr() == Some(addr));
            if !force {
                match self.map_osds(map, &mut inflight, &req) {
                    Ok(MapResult::Unchanged) => continue,
                    Ok(MapResult::NoPrimary) => {
                        debug!("tid {} maps to no up osd", tid);
                        needmap += 1;
                        req.set_last_addr(None);
                        continue;
                    }
                    Ok(MapResult::Changed) => {}
                    Err(e) => {
                        warn!("tid {} cannot be rerouted: {}", tid, e);
                        req.set_resend(true);
                        continue;
                    }
                }
            }

            // The Arc pins the record across the lock release.
            drop(inflight);
            if req.is_aborted() {
                continue;
            }
            req.add_flags(OsdFlags::RETRY);
            debug!("kicking tid {} to osd{}", tid, req.routed_osd());

            let mut inflight = self.inflight.lock().await;
            if !inflight.requests.contains_key(&tid) {
                continue; // completed while unlocked
            }
            if let Err(e) = self.send_request(map, &mut inflight, &req) {
                debug!("kick of tid {} failed, marking for resend: {}", tid, e);
                req.set_resend(true);
            }
        }

        if needmap > 0 {
            debug!("{} requests for down pgs, requesting newer map", needmap);
            self.monitor.request_map(map.epoch + 1);
        }
    }

    /// Transport channel to a daemon reset: the daemon may have dropped
    /// replies on the floor, so resubmit everything routed to it.
    pub async fn handle_reset(&self, addr: EntityAddr) {
        info!("transport reset for {}, resubmitting", addr.addr);
        self.kick_requests(Some(addr)).await;
    }

    // =======================================================================
    // Reply handling
    // =======================================================================

    /// Handle an object reply: either invoke the request's callback or wake
    /// the waiting task. Reads complete on their single response; writes get
    /// a fast ack and later a commit carrying ONDISK.
    pub async fn handle_reply(&self, msg: &Message) {
        let (head, _ops) = match decode_reply(&msg.front) {
            Ok(v) => v,
            Err(e) => {
                error!("corrupt osd_op_reply: {}", e);
                return;
            }
        };
        let flags = OsdFlags::from_bits_truncate(head.flags);
        debug!("handle_reply tid {} flags {:?}", head.tid, flags);

        let mut inflight = self.inflight.lock().await;
        let Some(req) = inflight.requests.get(&head.tid).cloned() else {
            // Routine: the request was aborted or already committed.
            debug!("reply for unknown tid {}", head.tid);
            return;
        };

        // The pinned reply handle was only needed while data was being read
        // into the page vector.
        drop(req.take_reply_msg());

        if req.is_aborted() {
            debug!("reply for aborted tid {}", head.tid);
            return;
        }

        if req.mark_got_reply() {
            let result = if head.result < 0 {
                head.result
            } else {
                msg.data_len as i32
            };
            debug!("tid {} first response, result {}", head.tid, result);
            req.set_result(result);
            // Kept in case this write has to be replayed.
            req.set_reassert_version(head.reassert_version);
        } else if !flags.contains(OsdFlags::ONDISK) {
            debug!("tid {} duplicate ack", head.tid);
            return;
        }

        // Either this is a read, or the commit arrived.
        if flags.contains(OsdFlags::ONDISK) || !req.is_write() {
            self.unregister_request(&mut inflight, &req);
        }
        drop(inflight);

        req.notify_done();
        if flags.contains(OsdFlags::ONDISK) {
            req.notify_safe();
        }
    }

    /// Expose a read request's page vector to the inbound reply before its
    /// data phase. The reply handle is pinned on the request for the
    /// duration so an abort can still revoke the pages mid-read.
    pub async fn prepare_read_pages(&self, msg: &Arc<Message>, want: usize) -> bool {
        if msg.msg_type != MSG_OSD_OPREPLY {
            return false;
        }
        let mut front = &msg.front[..];
        if front.len() < 8 {
            return false;
        }
        let tid = front.get_u64_le();

        let inflight = self.inflight.lock().await;
        let Some(req) = inflight.requests.get(&tid) else {
            debug!("prepare_read_pages for unknown tid {}", tid);
            return false;
        };
        debug!(
            "prepare_read_pages tid {} has {} pages, want {}",
            tid,
            req.num_pages(),
            want
        );
        if req.num_pages() < want || req.prepared_pages() || req.is_aborted() {
            return false;
        }
        let Some(pages) = req.pages() else {
            return false;
        };
        msg.attach_pages(pages);
        req.set_reply_msg(Arc::clone(msg));
        req.set_prepared_pages();
        true
    }

    // =======================================================================
    // Map handling
    // =======================================================================

    /// Process an osd map message: any number of incrementals followed by
    /// any number of full maps. Kicks pending requests when the map changed.
    /// Malformed payloads are dropped and the current map kept.
    pub async fn handle_map(&self, payload: &[u8]) {
        let mut buf = payload;
        let fsid = match osdmap::decode_fsid(&mut buf) {
            Ok(fsid) => fsid,
            Err(e) => {
                warn!("corrupt msg: {}", e);
                return;
            }
        };
        if fsid != self.config.fsid {
            warn!("got osd map with wrong fsid, ignoring");
            return;
        }

        let mut changed = false;
        {
            let mut map_guard = self.map.write().await;
            debug!(
                "handle_map, have {}",
                map_guard.as_ref().map(|m| m.epoch).unwrap_or(0)
            );
            if let Err(e) = Self::apply_map_payload(&mut map_guard, buf, &mut changed) {
                warn!("corrupt msg: {}", e);
                return;
            }
        }

        let map_guard = self.map.read().await;
        if let Some(map) = map_guard.as_ref() {
            self.monitor.got_map(map.epoch);
            if changed {
                info!("osd map now at epoch {}", map.epoch);
                self.kick_locked(map, None).await;
            }
        }
    }

    fn apply_map_payload(
        current: &mut Option<Arc<OSDMap>>,
        mut buf: &[u8],
        changed: &mut bool,
    ) -> Result<()> {
        // Incremental maps apply only in epoch order on top of what we have.
        osdmap::need(&buf, 4, "incremental count")?;
        let nr_inc = buf.get_u32_le();
        debug!(" {} incremental maps", nr_inc);
        for _ in 0..nr_inc {
            osdmap::need(&buf, 8, "incremental frame")?;
            let epoch = buf.get_u32_le();
            let len = buf.get_u32_le() as usize;
            osdmap::need(&buf, len, "incremental body")?;
            let (body, rest) = buf.split_at(len);
            buf = rest;

            let have = current.as_ref().map(|m| m.epoch).unwrap_or(0);
            if current.is_some() && have + 1 == epoch {
                debug!("applying incremental map {} len {}", epoch, len);
                let inc = OSDMapIncremental::decode(&mut &body[..])?;
                let next = inc.apply(current.as_ref().expect("map present"));
                *current = Some(Arc::new(next));
                *changed = true;
            } else {
                debug!("ignoring incremental map {} len {}", epoch, len);
            }
        }
        if *changed {
            return Ok(());
        }

        // Full maps: only the last can matter, and only if it is newer.
        osdmap::need(&buf, 4, "full map count")?;
        let nr_full = buf.get_u32_le();
        debug!(" {} full maps", nr_full);
        for i in 0..nr_full {
            osdmap::need(&buf, 8, "full map frame")?;
            let epoch = buf.get_u32_le();
            let len = buf.get_u32_le() as usize;
            osdmap::need(&buf, len, "full map body")?;
            let (body, rest) = buf.split_at(len);
            buf = rest;

            let have = current.as_ref().map(|m| m.epoch).unwrap_or(0);
            if i + 1 < nr_full {
                debug!("skipping non-latest full map {} len {}", epoch, len);
            } else if epoch <= have {
                debug!("skipping full map {}, older than our {}", epoch, have);
            } else {
                debug!("taking full map {} len {}", epoch, len);
                let map = OSDMap::decode(&mut &body[..])?;
                *current = Some(Arc::new(map));
                *changed = true;
            }
        }
        Ok(())
    }

    // =======================================================================
    // Timeout worker
    // =======================================================================

    fn arm_timeout_worker(&self) {
        let weak = self.self_weak.clone();
        let period = self.config.osd_timeout;
        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                let Some(client) = weak.upgrade() else { return };
                if !client.handle_timeout().await {
                    return;
                }
            }
        });
        let mut slot = self.timeout_task.lock().expect("timeout task lock poisoned");
        if let Some(old) = slot.replace(task) {
            old.abort();
        }
    }

    fn cancel_timeout_worker(&self) {
        if let Some(task) = self
            .timeout_task
            .lock()
            .expect("timeout task lock poisoned")
            .take()
        {
            task.abort();
        }
    }

    /// One sweep of the timeout worker. Retries requests whose last send
    /// failed, and pings the daemon of every request that has sat unanswered
    /// past its stamp, at most one ping per daemon per sweep. Returns whether
    /// any request remains (and the worker should run again).
    async fn handle_timeout(&self) -> bool {
        debug!("timeout sweep");
        let map_guard = self.map.read().await;
        let epoch = map_guard.as_ref().map(|m| m.epoch).unwrap_or(0);
        // Unconditional; the monitor client throttles on its side.
        self.monitor.request_map(epoch + 1);

        let mut inflight = self.inflight.lock().await;
        let now = Instant::now();
        let next = now + self.config.osd_timeout;
        let mut pinged: HashSet<i32> = HashSet::new();

        let requests: Vec<Arc<OSDRequest>> = inflight.requests.values().cloned().collect();
        for req in requests {
            if req.needs_resend() {
                debug!("resending previously failed tid {}", req.tid());
                if let Some(map) = map_guard.as_ref() {
                    match self.send_request(map, &mut inflight, &req) {
                        Ok(()) => req.set_resend(false),
                        Err(e) => debug!("tid {} failed again: {}", req.tid(), e),
                    }
                }
                continue;
            }
            if req.timeout_stamp() > now {
                continue;
            }
            req.set_timeout_stamp(next);
            let osd = req.routed_osd();
            if osd >= 0 && pinged.insert(osd) {
                if let Some(addr) = req.last_addr() {
                    debug!("tid {} (at least) timed out on osd{}, pinging", req.tid(), osd);
                    self.transport.ping(osd, addr);
                }
            }
        }

        inflight.num_requests > 0
    }

    // =======================================================================
    // Facade
    // =======================================================================

    /// Read some contiguous pages. If the extent crosses an object boundary,
    /// `*plen` is shortened and the read is short. Returns bytes read.
    pub async fn readpages(
        &self,
        vino: Vino,
        layout: &FileLayout,
        off: u64,
        plen: &mut u64,
        truncate_seq: u32,
        truncate_size: u64,
        pages: Pages,
    ) -> Result<u32> {
        debug!(
            "readpages ino {:x} snap {:x} {}~{}",
            vino.ino, vino.snap, off, *plen
        );
        let req = self
            .new_request(
                layout,
                vino,
                off,
                plen,
                OSD_OP_READ,
                OsdFlags::READ,
                None,
                false,
                truncate_seq,
                truncate_size,
                UTime::zero(),
                false,
            )
            .await;
        req.set_pages(pages, calc_pages_for(off, *plen));

        self.start_request(&req, false).await?;
        let got = self.wait_request(&req).await?;
        debug!("readpages result {}", got);
        Ok(got as u32)
    }

    /// Write contiguous pages synchronously, waiting for the first response
    /// (not durability; see [`OSDClient::sync`]). Returns the written length,
    /// shortened if the extent crossed an object boundary.
    #[allow(clippy::too_many_arguments)]
    pub async fn writepages(
        &self,
        vino: Vino,
        layout: &FileLayout,
        snapc: Option<Arc<SnapContext>>,
        off: u64,
        len: u64,
        truncate_seq: u32,
        truncate_size: u64,
        mtime: UTime,
        pages: Pages,
        flags: OsdFlags,
        do_sync: bool,
        nofail: bool,
    ) -> Result<u64> {
        assert_eq!(vino.snap, NOSNAP, "writes only target the head revision");
        let mut plen = len;
        let req = self
            .new_request(
                layout,
                vino,
                off,
                &mut plen,
                OSD_OP_WRITE,
                flags | OsdFlags::ONDISK | OsdFlags::WRITE,
                snapc,
                do_sync,
                truncate_seq,
                truncate_size,
                mtime,
                nofail,
            )
            .await;
        req.set_pages(pages, calc_pages_for(off, plen));
        debug!("writepages {}~{} ({} pages)", off, plen, req.num_pages());

        self.start_request(&req, nofail).await?;
        self.wait_request(&req).await?;
        Ok(plen)
    }

    /// Wait for a request's first response. A caller that gives up should
    /// drop this future and call [`OSDClient::abort_request`].
    pub async fn wait_request(&self, req: &Arc<OSDRequest>) -> Result<i32> {
        req.done.wait().await;
        let result = req.result();
        debug!("wait_request tid {} result {}", req.tid(), result);
        if result < 0 {
            Err(OSDClientError::Osd { code: result })
        } else {
            Ok(result)
        }
    }

    /// Wait until every write issued so far is durable. New writes get
    /// higher tids, so the scan cannot starve.
    pub async fn sync(&self) {
        let mut inflight = self.inflight.lock().await;
        let last_tid = inflight.last_tid;
        let mut next_tid = 0u64;
        loop {
            let Some((tid, req)) = inflight
                .requests
                .range(next_tid..)
                .next()
                .map(|(t, r)| (*t, Arc::clone(r)))
            else {
                break;
            };
            if tid > last_tid {
                break;
            }
            next_tid = tid + 1;
            if !req.is_write() {
                continue;
            }

            drop(inflight);
            debug!("sync waiting on tid {} (last is {})", tid, last_tid);
            req.safe.wait().await;
            inflight = self.inflight.lock().await;
        }
        drop(inflight);
        debug!("sync done through tid {}", last_tid);
    }

    /// Abort an in-progress request by taking the pages away from its
    /// outbound and inbound messages. Later replies for it are acknowledged
    /// but produce no side effects.
    pub fn abort_request(&self, req: &OSDRequest) {
        info!("abort tid {}, revoking pages", req.tid());
        // Aborted must be visible before the pages go, so a racing kicker
        // that duplicated the message handle sees the flag and skips the
        // send.
        req.set_aborted();
        if let Some(msg) = req.request_msg() {
            msg.revoke_pages();
        }
        if let Some(reply) = req.take_reply_msg() {
            reply.revoke_pages();
        }
    }

    /// Cancel the timeout worker and drop the map. Outstanding requests are
    /// the caller's to drain or abort first.
    pub async fn stop(&self) {
        let task = self
            .timeout_task
            .lock()
            .expect("timeout task lock poisoned")
            .take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
        *self.map.write().await = None;
        info!("osd client stopped");
    }

    // =======================================================================
    // Introspection
    // =======================================================================

    /// The current osd map, if one has been received yet.
    pub async fn get_osdmap(&self) -> Result<Arc<OSDMap>> {
        self.map.read().await.clone().ok_or(OSDClientError::NoMap)
    }

    pub async fn osdmap_epoch(&self) -> Option<u32> {
        self.map.read().await.as_ref().map(|m| m.epoch)
    }

    pub async fn num_requests(&self) -> usize {
        self.inflight.lock().await.num_requests
    }

    pub async fn last_tid(&self) -> u64 {
        self.inflight.lock().await.last_tid
    }

    pub async fn request(&self, tid: u64) -> Option<Arc<OSDRequest>> {
        self.inflight.lock().await.requests.get(&tid).cloned()
    }

    /// Ordinals of the daemons with an open session.
    pub async fn session_osds(&self) -> Vec<i32> {
        self.inflight.lock().await.osds.keys().copied().collect()
    }
}
