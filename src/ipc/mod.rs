//! Inter-process coordination.
//!
//! The control plane owns one request ring per channel; a data plane
//! claims a channel at mount and talks to the control plane through
//! fixed-size message records. Requests block until the matching
//! completion lands on the channel's receive ring; per-kind round-trip
//! latency is accumulated in [`PerfStatIpc`].
//!
//! Containers (block groups) are leased through `CONTAINER_ALLOC_REQ`:
//! `Allocated` replays groups still owned by the application from an
//! earlier run, `New` carves a fresh group out of the global free pool.
//! `CONTAINER_RELEASE_REQ` returns an empty group. The control plane also
//! arbitrates a global buffer budget through the `BUFFER_*` kinds.

use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytemuck::{bytes_of, pod_read_unaligned, Pod, Zeroable};
use log::{debug, info, warn};
use spin::Mutex;

use crate::err::{CanFail, FsError, IoResult};
use crate::fs::buffer::{BhMode, BufType, InsertPos};
use crate::fs::layout::{
    AppSuperblock, SuperblockCommon, APP_NAME_SIZE, BD_INO, MAX_APPS,
};
use crate::fs::{FileSystem, ProcessRole};

/// Fixed size of one message record.
pub const IPC_MSG_SIZE: usize = 4096;
pub const IPC_BODY_SIZE: usize = IPC_MSG_SIZE - 4;
/// Capacity of each ring.
pub const IPC_RING_DEPTH: usize = 64;
/// Channels offered by the control plane; one per data plane.
pub const MAX_CHANNELS: usize = MAX_APPS;

/// Round-trips of one health-check burst.
pub const HEALTH_CHECK_BURST: u32 = 100;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum IpcKind {
    AppRegisterReq = 1,
    AppRegisterCpl = 2,
    AppUnregisterReq = 3,
    AppUnregisterCpl = 4,
    SuperblockCopyReq = 5,
    SuperblockCopyCpl = 6,
    ContainerAllocReq = 7,
    ContainerAllocCpl = 8,
    ContainerReleaseReq = 9,
    ContainerReleaseCpl = 10,
    BufferAllocReq = 11,
    BufferAllocCpl = 12,
    BufferFreeReq = 13,
    BufferFreeCpl = 14,
    HealthCheckReq = 15,
    HealthCheckCpl = 16,
}

pub const IPC_KIND_NUM: usize = 17;

impl IpcKind {
    fn completion(self) -> IpcKind {
        match self {
            IpcKind::AppRegisterReq => IpcKind::AppRegisterCpl,
            IpcKind::AppUnregisterReq => IpcKind::AppUnregisterCpl,
            IpcKind::SuperblockCopyReq => IpcKind::SuperblockCopyCpl,
            IpcKind::ContainerAllocReq => IpcKind::ContainerAllocCpl,
            IpcKind::ContainerReleaseReq => IpcKind::ContainerReleaseCpl,
            IpcKind::BufferAllocReq => IpcKind::BufferAllocCpl,
            IpcKind::BufferFreeReq => IpcKind::BufferFreeCpl,
            IpcKind::HealthCheckReq => IpcKind::HealthCheckCpl,
            other => other,
        }
    }

    fn from_u16(raw: u16) -> Option<IpcKind> {
        if (1..IPC_KIND_NUM as u16).contains(&raw) {
            // SAFETY: repr(u16) with contiguous discriminants 1..17.
            Some(unsafe { core::mem::transmute::<u16, IpcKind>(raw) })
        } else {
            None
        }
    }
}

/// One fixed-size message record.
#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct IpcMsg {
    pub chan_id: u16,
    pub kind: u16,
    pub body: [u8; IPC_BODY_SIZE],
}

const _: () = assert!(core::mem::size_of::<IpcMsg>() == IPC_MSG_SIZE);

impl IpcMsg {
    pub fn new(chan_id: u16, kind: IpcKind) -> Self {
        let mut msg: IpcMsg = Zeroable::zeroed();
        msg.chan_id = chan_id;
        msg.kind = kind as u16;
        msg
    }

    pub fn set_body<T: Pod>(&mut self, body: &T) {
        let bytes = bytes_of(body);
        self.body[..bytes.len()].copy_from_slice(bytes);
    }

    pub fn body_as<T: Pod>(&self) -> T {
        pod_read_unaligned(&self.body[..core::mem::size_of::<T>()])
    }
}

#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct AppRegisterReq {
    pub name: [u8; APP_NAME_SIZE],
}

#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct AppRegisterCpl {
    pub ret: i32,
    pub app_id: u32,
    pub root_bg: u32,
}

#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct AppUnregisterReq {
    pub name: [u8; APP_NAME_SIZE],
    pub keep_containers: u32,
}

#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct SuperblockCopyReq {
    pub name: [u8; APP_NAME_SIZE],
}

#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct SuperblockCopyCpl {
    pub ret: i32,
    pub reserved: u32,
    pub common: SuperblockCommon,
    pub asb: AppSuperblock,
}

/// Container lease flavors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContainerAllocKind {
    /// Carve a fresh group from the global free pool.
    New,
    /// Replay a group already reserved by this application.
    Allocated,
}

#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct ContainerAllocReq {
    pub alloc_type: u32,
}

#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct ContainerAllocCpl {
    pub ret: i32,
    /// 0 when nothing could be granted.
    pub container_id: u32,
}

#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct ContainerReleaseReq {
    pub container_id: u32,
}

#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct BufferCountReq {
    pub count: u32,
}

#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct RetCpl {
    pub ret: i32,
}

pub(crate) fn name_bytes(name: &str) -> [u8; APP_NAME_SIZE] {
    let mut bytes = [0u8; APP_NAME_SIZE];
    let len = name.len().min(APP_NAME_SIZE - 1);
    bytes[..len].copy_from_slice(&name.as_bytes()[..len]);
    bytes
}

pub(crate) fn name_from_bytes(bytes: &[u8; APP_NAME_SIZE]) -> &str {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    core::str::from_utf8(&bytes[..end]).unwrap_or("")
}

struct RingInner {
    slots: Vec<IpcMsg>,
    head: usize,
    len: usize,
}

/// Fixed-capacity message ring; producers are serialized by the lock.
pub struct MsgRing {
    inner: Mutex<RingInner>,
}

impl MsgRing {
    fn new(depth: usize) -> Self {
        Self {
            inner: Mutex::new(RingInner {
                slots: vec![Zeroable::zeroed(); depth],
                head: 0,
                len: 0,
            }),
        }
    }

    pub fn enqueue(&self, msg: IpcMsg) -> bool {
        let mut ring = self.inner.lock();
        if ring.len == ring.slots.len() {
            return false;
        }
        let tail = (ring.head + ring.len) % ring.slots.len();
        ring.slots[tail] = msg;
        ring.len += 1;
        true
    }

    pub fn dequeue(&self) -> Option<IpcMsg> {
        let mut ring = self.inner.lock();
        if ring.len == 0 {
            return None;
        }
        let msg = ring.slots[ring.head];
        ring.head = (ring.head + 1) % ring.slots.len();
        ring.len -= 1;
        Some(msg)
    }
}

struct IpcChannel {
    /// Data plane -> control plane.
    send: MsgRing,
    /// Control plane -> data plane.
    recv: MsgRing,
    claimed: AtomicBool,
}

/// The shared ring fabric: one channel per data plane.
pub struct IpcHub {
    channels: Vec<IpcChannel>,
}

impl IpcHub {
    pub fn new() -> Arc<Self> {
        let channels = (0..MAX_CHANNELS)
            .map(|_| IpcChannel {
                send: MsgRing::new(IPC_RING_DEPTH),
                recv: MsgRing::new(IPC_RING_DEPTH),
                claimed: AtomicBool::new(false),
            })
            .collect();
        Arc::new(Self { channels })
    }

    /// Claims the first free channel.
    pub fn claim_channel(&self) -> Option<u16> {
        for (id, chan) in self.channels.iter().enumerate() {
            if chan
                .claimed
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(id as u16);
            }
        }
        None
    }

    pub fn release_channel(&self, id: u16) {
        self.channels[id as usize].claimed.store(false, Ordering::Release);
    }

    fn channel(&self, id: u16) -> &IpcChannel {
        &self.channels[id as usize]
    }
}

/// Per-kind request latency accounting.
#[derive(Clone, Copy)]
pub struct PerfStatIpc {
    pub total_ns: [u64; IPC_KIND_NUM],
    pub count: [u64; IPC_KIND_NUM],
}

impl PerfStatIpc {
    pub fn new() -> Self {
        Self {
            total_ns: [0; IPC_KIND_NUM],
            count: [0; IPC_KIND_NUM],
        }
    }

    fn record(&mut self, kind: IpcKind, elapsed: Duration) {
        self.total_ns[kind as usize] += elapsed.as_nanos() as u64;
        self.count[kind as usize] += 1;
    }

    pub fn requests(&self, kind: IpcKind) -> u64 {
        self.count[kind as usize]
    }

    pub fn average_us(&self, kind: IpcKind) -> f64 {
        let count = self.count[kind as usize];
        if count == 0 {
            return 0.0;
        }
        self.total_ns[kind as usize] as f64 / count as f64 / 1000.0
    }
}

impl Default for PerfStatIpc {
    fn default() -> Self {
        Self::new()
    }
}

/// Control-plane bookkeeping behind the request handlers.
pub struct ControlState {
    /// `owners[bg]` is the owning app id, 0 for the free pool, and
    /// [`ControlState::CONTROL_OWNER`] for block group 0.
    owners: Vec<u32>,
    /// Channel -> app id binding established at registration.
    chan_app: [u32; MAX_CHANNELS],
    /// Replay progress per channel for `Allocated` leases.
    replay_pos: [u32; MAX_CHANNELS],
    /// Buffers left in the global budget.
    buffer_budget: u32,
}

impl ControlState {
    const CONTROL_OWNER: u32 = u32::MAX;

    /// Default global buffer budget, in clusters.
    pub const DEFAULT_BUFFER_BUDGET: u32 = 1 << 16;

    pub(crate) fn new(bd_owners: &[u32]) -> Self {
        let mut owners: Vec<u32> = bd_owners.to_vec();
        if let Some(first) = owners.first_mut() {
            *first = Self::CONTROL_OWNER;
        }
        Self {
            owners,
            chan_app: [0; MAX_CHANNELS],
            replay_pos: [0; MAX_CHANNELS],
            buffer_budget: Self::DEFAULT_BUFFER_BUDGET,
        }
    }

    fn find_free_container(&self) -> Option<u32> {
        self.owners
            .iter()
            .enumerate()
            .skip(1)
            .find(|(_, &owner)| owner == 0)
            .map(|(bg, _)| bg as u32)
    }
}

impl FileSystem {
    fn hub(&self) -> IoResult<Arc<IpcHub>> {
        self.hub.clone().ok_or(FsError::Ipc("no channel fabric attached"))
    }

    /// One blocking request/response round trip on this process's
    /// channel.
    fn ipc_call(&mut self, kind: IpcKind, mut msg: IpcMsg) -> IoResult<IpcMsg> {
        let hub = self.hub()?;
        let chan = hub.channel(self.chan_id);
        msg.chan_id = self.chan_id;
        msg.kind = kind as u16;

        let start = Instant::now();
        if !chan.send.enqueue(msg) {
            return Err(FsError::Ipc("request ring full"));
        }

        let reply = loop {
            if let Some(reply) = chan.recv.dequeue() {
                break reply;
            }
            std::thread::yield_now();
        };

        self.perf.record(kind, start.elapsed());

        if reply.kind != kind.completion() as u16 {
            return Err(FsError::Ipc("mismatched completion kind"));
        }
        Ok(reply)
    }

    /// Registers this application with the control plane; returns the app
    /// id and the root container.
    pub(crate) fn register_app(&mut self) -> IoResult<(u32, u32)> {
        let mut msg = IpcMsg::new(self.chan_id, IpcKind::AppRegisterReq);
        msg.set_body(&AppRegisterReq {
            name: name_bytes(&self.params.appname),
        });
        let reply = self.ipc_call(IpcKind::AppRegisterReq, msg)?;
        let cpl: AppRegisterCpl = reply.body_as();
        if cpl.ret != 0 {
            return Err(FsError::Ipc("registration refused"));
        }
        Ok((cpl.app_id, cpl.root_bg))
    }

    pub(crate) fn unregister_app(&mut self, keep_containers: bool) -> CanFail {
        let mut msg = IpcMsg::new(self.chan_id, IpcKind::AppUnregisterReq);
        msg.set_body(&AppUnregisterReq {
            name: name_bytes(&self.params.appname),
            keep_containers: keep_containers as u32,
        });
        let reply = self.ipc_call(IpcKind::AppUnregisterReq, msg)?;
        let cpl: RetCpl = reply.body_as();
        if cpl.ret != 0 {
            return Err(FsError::Ipc("unregistration refused"));
        }
        Ok(())
    }

    /// Fetches the control plane's superblock snapshot.
    pub(crate) fn superblock_copy(&mut self) -> IoResult<(SuperblockCommon, AppSuperblock)> {
        let mut msg = IpcMsg::new(self.chan_id, IpcKind::SuperblockCopyReq);
        msg.set_body(&SuperblockCopyReq {
            name: name_bytes(&self.params.appname),
        });
        let reply = self.ipc_call(IpcKind::SuperblockCopyReq, msg)?;
        let cpl: SuperblockCopyCpl = reply.body_as();
        if cpl.ret != 0 {
            return Err(FsError::Ipc("superblock copy refused"));
        }
        Ok((cpl.common, cpl.asb))
    }

    /// Leases a container; 0 means none was available.
    pub(crate) fn alloc_container(&mut self, kind: ContainerAllocKind) -> IoResult<u32> {
        let mut msg = IpcMsg::new(self.chan_id, IpcKind::ContainerAllocReq);
        msg.set_body(&ContainerAllocReq {
            alloc_type: match kind {
                ContainerAllocKind::New => 0,
                ContainerAllocKind::Allocated => 1,
            },
        });
        let reply = self.ipc_call(IpcKind::ContainerAllocReq, msg)?;
        let cpl: ContainerAllocCpl = reply.body_as();
        if cpl.ret != 0 {
            return Err(FsError::Ipc("container allocation refused"));
        }
        Ok(cpl.container_id)
    }

    pub(crate) fn release_container(&mut self, bg_id: u32) -> CanFail {
        let mut msg = IpcMsg::new(self.chan_id, IpcKind::ContainerReleaseReq);
        msg.set_body(&ContainerReleaseReq { container_id: bg_id });
        let reply = self.ipc_call(IpcKind::ContainerReleaseReq, msg)?;
        let cpl: RetCpl = reply.body_as();
        if cpl.ret != 0 {
            return Err(FsError::Ipc("container release refused"));
        }
        Ok(())
    }

    /// Asks for `count` more buffers from the global budget.
    pub(crate) fn request_buffers(&mut self, count: u32) -> IoResult<bool> {
        let mut msg = IpcMsg::new(self.chan_id, IpcKind::BufferAllocReq);
        msg.set_body(&BufferCountReq { count });
        let reply = self.ipc_call(IpcKind::BufferAllocReq, msg)?;
        let cpl: RetCpl = reply.body_as();
        Ok(cpl.ret == 0)
    }

    pub(crate) fn return_buffers(&mut self, count: u32) -> CanFail {
        let mut msg = IpcMsg::new(self.chan_id, IpcKind::BufferFreeReq);
        msg.set_body(&BufferCountReq { count });
        let reply = self.ipc_call(IpcKind::BufferFreeReq, msg)?;
        let cpl: RetCpl = reply.body_as();
        if cpl.ret != 0 {
            return Err(FsError::Ipc("buffer return refused"));
        }
        Ok(())
    }

    /// Measures request/response latency with a burst of no-op requests.
    pub fn health_check(&mut self) -> IoResult<Duration> {
        let start = Instant::now();
        for _ in 0..HEALTH_CHECK_BURST {
            let msg = IpcMsg::new(self.chan_id, IpcKind::HealthCheckReq);
            self.ipc_call(IpcKind::HealthCheckReq, msg)?;
        }
        let avg = start.elapsed() / HEALTH_CHECK_BURST;
        info!(target: "ipc", "health check round trip = {avg:?}");
        Ok(avg)
    }

    /// Control plane: drains every claimed channel's request ring,
    /// handling each request and posting the completion. Returns how many
    /// requests were served.
    pub fn poll_ipc(&mut self) -> IoResult<u32> {
        assert_eq!(
            self.params.role,
            ProcessRole::Control,
            "only the control plane serves requests"
        );
        let hub = self.hub()?;

        let mut served = 0;
        for chan_id in 0..MAX_CHANNELS as u16 {
            let chan = hub.channel(chan_id);
            if !chan.claimed.load(Ordering::Acquire) {
                continue;
            }
            while let Some(msg) = chan.send.dequeue() {
                let reply = self.handle_request(chan_id, &msg)?;
                chan.recv.enqueue(reply);
                served += 1;
            }
        }

        if served > 0 {
            self.check_flush_dirty(crate::fs::flush::FlushMode::Force)?;
        }
        Ok(served)
    }

    /// Runs the control-plane service loop until `stop` is raised.
    pub fn serve(&mut self, stop: &AtomicBool) -> CanFail {
        while !stop.load(Ordering::Acquire) {
            if self.poll_ipc()? == 0 {
                std::thread::yield_now();
            }
        }
        // Late requests racing the stop flag.
        self.poll_ipc()?;
        Ok(())
    }

    fn handle_request(&mut self, chan_id: u16, msg: &IpcMsg) -> IoResult<IpcMsg> {
        let Some(kind) = IpcKind::from_u16(msg.kind) else {
            warn!(target: "ipc", "unknown request kind {}", msg.kind);
            let mut reply = IpcMsg::new(chan_id, IpcKind::HealthCheckCpl);
            reply.set_body(&RetCpl { ret: -1 });
            return Ok(reply);
        };

        let mut reply = IpcMsg::new(chan_id, kind.completion());
        match kind {
            IpcKind::AppRegisterReq => {
                let req: AppRegisterReq = msg.body_as();
                let cpl = self.handle_register(chan_id, &req)?;
                reply.set_body(&cpl);
            }
            IpcKind::AppUnregisterReq => {
                let req: AppUnregisterReq = msg.body_as();
                let ret = self.handle_unregister(chan_id, &req)?;
                reply.set_body(&RetCpl { ret });
            }
            IpcKind::SuperblockCopyReq => {
                let req: SuperblockCopyReq = msg.body_as();
                let cpl = self.handle_superblock_copy(&req);
                reply.set_body(&cpl);
            }
            IpcKind::ContainerAllocReq => {
                let req: ContainerAllocReq = msg.body_as();
                let cpl = self.handle_container_alloc(chan_id, req.alloc_type)?;
                reply.set_body(&cpl);
            }
            IpcKind::ContainerReleaseReq => {
                let req: ContainerReleaseReq = msg.body_as();
                let ret = self.handle_container_release(chan_id, req.container_id)?;
                reply.set_body(&RetCpl { ret });
            }
            IpcKind::BufferAllocReq => {
                let req: BufferCountReq = msg.body_as();
                let ctrl = self.ctrl.as_mut().expect("control state");
                let ret = if ctrl.buffer_budget >= req.count {
                    ctrl.buffer_budget -= req.count;
                    0
                } else {
                    -1
                };
                reply.set_body(&RetCpl { ret });
            }
            IpcKind::BufferFreeReq => {
                let req: BufferCountReq = msg.body_as();
                let ctrl = self.ctrl.as_mut().expect("control state");
                ctrl.buffer_budget += req.count;
                reply.set_body(&RetCpl { ret: 0 });
            }
            IpcKind::HealthCheckReq => {
                reply.set_body(&RetCpl { ret: 0 });
            }
            completion => {
                warn!(target: "ipc", "completion kind {completion:?} on the request ring");
                reply.set_body(&RetCpl { ret: -1 });
            }
        }
        Ok(reply)
    }

    fn handle_register(&mut self, chan_id: u16, req: &AppRegisterReq) -> IoResult<AppRegisterCpl> {
        let name = name_from_bytes(&req.name);
        if name.is_empty() {
            return Ok(AppRegisterCpl {
                ret: -1,
                app_id: 0,
                root_bg: 0,
            });
        }

        let slot = self
            .apps
            .iter()
            .position(|app| app.registered != 0 && name_from_bytes(&app.name) == name)
            .or_else(|| self.apps.iter().position(|app| app.registered == 0));
        let Some(slot) = slot else {
            warn!(target: "ipc", "application table full, refusing {name}");
            return Ok(AppRegisterCpl {
                ret: -1,
                app_id: 0,
                root_bg: 0,
            });
        };

        let app_id = slot as u32 + 1;
        self.apps[slot].name = req.name;
        self.apps[slot].registered = 1;

        if self.apps[slot].root_bg == 0 {
            let ctrl = self.ctrl.as_mut().expect("control state");
            let Some(root_bg) = ctrl.find_free_container() else {
                return Ok(AppRegisterCpl {
                    ret: -1,
                    app_id: 0,
                    root_bg: 0,
                });
            };
            ctrl.owners[root_bg as usize] = app_id;
            self.apps[slot].root_bg = root_bg;
            info!(target: "ipc", "granted root container {root_bg} to {name} (app {app_id})");
        }

        let ctrl = self.ctrl.as_mut().expect("control state");
        ctrl.chan_app[chan_id as usize] = app_id;
        ctrl.replay_pos[chan_id as usize] = 0;

        Ok(AppRegisterCpl {
            ret: 0,
            app_id,
            root_bg: self.apps[slot].root_bg,
        })
    }

    fn handle_unregister(&mut self, chan_id: u16, req: &AppUnregisterReq) -> IoResult<i32> {
        let name = name_from_bytes(&req.name);
        let Some(slot) = self
            .apps
            .iter()
            .position(|app| app.registered != 0 && name_from_bytes(&app.name) == name)
        else {
            return Ok(-1);
        };
        let app_id = slot as u32 + 1;

        if req.keep_containers == 0 {
            let owned: Vec<u32> = {
                let ctrl = self.ctrl.as_mut().expect("control state");
                let owned = ctrl
                    .owners
                    .iter()
                    .enumerate()
                    .filter(|(_, &owner)| owner == app_id)
                    .map(|(bg, _)| bg as u32)
                    .collect();
                owned
            };
            for bg in owned {
                self.reclaim_container(bg)?;
            }
            self.apps[slot].registered = 0;
            self.apps[slot].root_bg = 0;
            self.apps[slot].name = [0; APP_NAME_SIZE];
        }

        let ctrl = self.ctrl.as_mut().expect("control state");
        ctrl.chan_app[chan_id as usize] = 0;
        debug!(target: "ipc", "unregistered {name} (keep = {})", req.keep_containers != 0);
        Ok(0)
    }

    fn handle_superblock_copy(&mut self, req: &SuperblockCopyReq) -> SuperblockCopyCpl {
        let name = name_from_bytes(&req.name);
        let slot = self
            .apps
            .iter()
            .position(|app| app.registered != 0 && name_from_bytes(&app.name) == name);
        let Some(slot) = slot else {
            return SuperblockCopyCpl {
                ret: -1,
                reserved: 0,
                common: SuperblockCommon::default(),
                asb: AppSuperblock::default(),
            };
        };

        SuperblockCopyCpl {
            ret: 0,
            reserved: 0,
            common: self.sb,
            asb: AppSuperblock {
                asb_core_id: slot as u32 + 1,
                asb_root_bg_id: self.apps[slot].root_bg,
                ..AppSuperblock::default()
            },
        }
    }

    fn handle_container_alloc(
        &mut self,
        chan_id: u16,
        alloc_type: u32,
    ) -> IoResult<ContainerAllocCpl> {
        let ctrl = self.ctrl.as_mut().expect("control state");
        let app_id = ctrl.chan_app[chan_id as usize];
        if app_id == 0 {
            return Ok(ContainerAllocCpl {
                ret: -1,
                container_id: 0,
            });
        }

        if alloc_type == 1 {
            // Replay: the root container first, then every other group
            // still stamped with this application.
            let root_bg = self.apps[app_id as usize - 1].root_bg;
            let pos = &mut ctrl.replay_pos[chan_id as usize];
            if *pos == 0 {
                *pos = 1;
                return Ok(ContainerAllocCpl {
                    ret: 0,
                    container_id: root_bg,
                });
            }
            let start = (*pos).max(1);
            for bg in start..ctrl.owners.len() as u32 {
                if ctrl.owners[bg as usize] == app_id && bg != root_bg {
                    *pos = bg + 1;
                    return Ok(ContainerAllocCpl {
                        ret: 0,
                        container_id: bg,
                    });
                }
            }
            *pos = ctrl.owners.len() as u32;
            return Ok(ContainerAllocCpl {
                ret: 0,
                container_id: 0,
            });
        }

        let Some(bg) = ctrl.find_free_container() else {
            warn!(target: "ipc", "free pool exhausted for app {app_id}");
            return Ok(ContainerAllocCpl {
                ret: 0,
                container_id: 0,
            });
        };
        ctrl.owners[bg as usize] = app_id;
        debug!(target: "ipc", "granted container {bg} to app {app_id}");
        Ok(ContainerAllocCpl {
            ret: 0,
            container_id: bg,
        })
    }

    fn handle_container_release(&mut self, chan_id: u16, bg_id: u32) -> IoResult<i32> {
        let ctrl = self.ctrl.as_mut().expect("control state");
        let app_id = ctrl.chan_app[chan_id as usize];
        if bg_id == 0
            || bg_id as usize >= ctrl.owners.len()
            || ctrl.owners[bg_id as usize] != app_id
        {
            warn!(target: "ipc", "refusing release of container {bg_id} by app {app_id}");
            return Ok(-1);
        }
        self.reclaim_container(bg_id)?;
        Ok(0)
    }

    /// Returns a container to the free pool and clears its on-disk owner
    /// stamp. Ownership has passed back to the control plane at this
    /// point, so the write is ours to make.
    fn reclaim_container(&mut self, bg_id: u32) -> CanFail {
        let ctrl = self.ctrl.as_mut().expect("control state");
        ctrl.owners[bg_id as usize] = 0;

        let bh = self.get_bh(None, BD_INO, bg_id, BhMode::Read, BufType::Meta)?;
        let mut bd = self.bd_from_bh(bh);
        bd.bd_owner = 0;
        self.write_bd(bh, &bd);
        self.release_bh(bh, InsertPos::Head, true);
        debug!(target: "ipc", "container {bg_id} back in the free pool");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::ram::RamDisk;
    use crate::fs::layout::FormatParams;
    use crate::fs::mount::format;
    use crate::fs::MountParams;
    use std::thread::JoinHandle;

    fn fabric() -> (RamDisk, Arc<IpcHub>) {
        let mut disk = RamDisk::new(4 * 256);
        let geometry = FormatParams {
            clusters_per_bg: 256,
            inodes_per_bg: 64,
        };
        format(&mut disk, &geometry).unwrap();
        (disk, IpcHub::new())
    }

    fn spawn_control(
        disk: &RamDisk,
        hub: &Arc<IpcHub>,
        stop: &Arc<AtomicBool>,
    ) -> JoinHandle<FileSystem> {
        let params = MountParams {
            buffer_clusters: Some(128),
            ..MountParams::control()
        };
        let mut control =
            FileSystem::mount(Box::new(disk.open_shared()), params, Some(hub.clone())).unwrap();
        let stop = stop.clone();
        std::thread::spawn(move || {
            control.serve(&stop).unwrap();
            control
        })
    }

    fn mount_data(disk: &RamDisk, hub: &Arc<IpcHub>, appname: &str) -> FileSystem {
        let params = MountParams {
            buffer_clusters: Some(128),
            ..MountParams::data(appname)
        };
        FileSystem::mount(Box::new(disk.open_shared()), params, Some(hub.clone())).unwrap()
    }

    #[test]
    fn data_plane_leases_containers_on_demand() {
        let (disk, hub) = fabric();
        let stop = Arc::new(AtomicBool::new(false));
        let control = spawn_control(&disk, &hub, &stop);

        let mut data = mount_data(&disk, &hub, "worker");
        assert_eq!(data.sb.sb_bg_num, 4);
        assert!(!data.bg_list.contains(0), "block group 0 leased to a data plane");
        assert_eq!(data.bg_list.len(), 1);

        // The root container holds 64 inodes; the directory and its index
        // take two, 62 files fill the rest without any further lease.
        data.mkdir("/w", 0o755).unwrap();
        let base = data.perf.requests(IpcKind::ContainerAllocReq);
        for i in 0..62 {
            data.create_file(&format!("/w/f{i}"), 0o644).unwrap();
        }
        assert_eq!(data.perf.requests(IpcKind::ContainerAllocReq), base);

        // The 63rd create exhausts the group: exactly one fresh lease.
        data.create_file("/w/spill", 0o644).unwrap();
        assert_eq!(data.perf.requests(IpcKind::ContainerAllocReq), base + 1);
        assert_eq!(data.bg_list.len(), 2);

        // Every owned group carries this process's owner stamp.
        let owned: Vec<u32> = data.bg_list.ids().to_vec();
        for bg_id in owned {
            let bh = data
                .get_bh(
                    None,
                    crate::fs::layout::BD_INO,
                    bg_id,
                    crate::fs::buffer::BhMode::Read,
                    crate::fs::buffer::BufType::Meta,
                )
                .unwrap();
            let bd = data.bd_from_bh(bh);
            data.release_bh(bh, crate::fs::buffer::InsertPos::Head, false);
            assert_eq!(bd.bd_owner, data.asb.asb_core_id);
        }

        // Emptying the spill group hands it straight back.
        data.unlink("/w/spill").unwrap();
        assert!(data.perf.requests(IpcKind::ContainerReleaseReq) >= 1);
        assert_eq!(data.bg_list.len(), 1);

        data.health_check().unwrap();
        data.umount().unwrap();

        stop.store(true, Ordering::Release);
        let mut control = control.join().unwrap();
        control.umount().unwrap();
    }

    #[test]
    fn containers_replay_for_a_returning_app() {
        let (disk, hub) = fabric();
        let stop = Arc::new(AtomicBool::new(false));
        let control = spawn_control(&disk, &hub, &stop);

        let mut data = mount_data(&disk, &hub, "repeat");
        data.mkdir("/r", 0o755).unwrap();
        data.create_file("/r/keep", 0o644).unwrap();
        let root_bg = data.asb.asb_root_bg_id;
        data.umount().unwrap();

        // Unregistration kept the containers; the same name gets them
        // back.
        let mut data = mount_data(&disk, &hub, "repeat");
        assert_eq!(data.asb.asb_root_bg_id, root_bg);
        assert!(data.bg_list.contains(root_bg));
        assert_eq!(data.stat("/r/keep").unwrap().links, 1);
        data.umount().unwrap();

        stop.store(true, Ordering::Release);
        let mut control = control.join().unwrap();
        control.umount().unwrap();
    }

    #[test]
    fn two_data_planes_hold_disjoint_groups() {
        let (disk, hub) = fabric();
        let stop = Arc::new(AtomicBool::new(false));
        let control = spawn_control(&disk, &hub, &stop);

        let mut left = mount_data(&disk, &hub, "left");
        let mut right = mount_data(&disk, &hub, "right");

        let left_root = left.asb.asb_root_bg_id;
        let right_root = right.asb.asb_root_bg_id;
        assert_ne!(left_root, right_root);
        assert_ne!(left.asb.asb_core_id, right.asb.asb_core_id);

        left.mkdir("/left", 0o755).unwrap();
        right.mkdir("/right", 0o755).unwrap();

        right.umount().unwrap();
        left.umount().unwrap();

        stop.store(true, Ordering::Release);
        let mut control = control.join().unwrap();
        control.umount().unwrap();
    }

    #[test]
    fn rings_are_fifo_and_bounded() {
        let ring = MsgRing::new(2);
        assert!(ring.enqueue(IpcMsg::new(0, IpcKind::HealthCheckReq)));
        assert!(ring.enqueue(IpcMsg::new(1, IpcKind::HealthCheckReq)));
        assert!(!ring.enqueue(IpcMsg::new(2, IpcKind::HealthCheckReq)));

        assert_eq!(ring.dequeue().unwrap().chan_id, 0);
        assert_eq!(ring.dequeue().unwrap().chan_id, 1);
        assert!(ring.dequeue().is_none());
    }

    #[test]
    fn channel_claims_are_exclusive() {
        let hub = IpcHub::new();
        let first = hub.claim_channel().unwrap();
        let second = hub.claim_channel().unwrap();
        assert_ne!(first, second);

        hub.release_channel(first);
        assert_eq!(hub.claim_channel(), Some(first));
    }

    #[test]
    fn bodies_round_trip_through_the_record() {
        let mut msg = IpcMsg::new(3, IpcKind::ContainerAllocReq);
        msg.set_body(&ContainerAllocReq { alloc_type: 1 });
        let req: ContainerAllocReq = msg.body_as();
        assert_eq!(req.alloc_type, 1);
        assert_eq!(msg.kind, IpcKind::ContainerAllocReq as u16);
    }

    #[test]
    fn request_kinds_pair_with_their_completions() {
        assert_eq!(
            IpcKind::AppRegisterReq.completion(),
            IpcKind::AppRegisterCpl
        );
        assert_eq!(
            IpcKind::ContainerAllocReq.completion(),
            IpcKind::ContainerAllocCpl
        );
        assert_eq!(IpcKind::from_u16(15), Some(IpcKind::HealthCheckReq));
        assert_eq!(IpcKind::from_u16(99), None);
    }
}
