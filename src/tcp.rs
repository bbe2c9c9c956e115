use super::ctx::{self, Ctx, Mode};
use super::epollref::{self, ERef, ListenRef, RefType};
use super::flow::{self, Flow, FlowCommon, FlowSide, FlowTable, Pif,
                  SOCKSIDE, TAPSIDE};
use super::fwd;
use super::inany::InAny;
use super::nat;
use super::netns;
use super::packet;
use super::siphash::SipFeed;
use super::tcp_buf::{self, FrameMeta, FramePool, FL_ACK, FL_FIN, FL_PSH,
                     FL_RST, FL_SYN};
use super::util;

use std::io;
use std::mem;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

// TCP ENGINE
//
// Tracks each connection as a pair of half-flows (tap side, socket
// side) and mirrors the TCP dynamics observed on one side onto the
// other: window, MSS, window scaling, ACK progress. The kernels on
// both sides do congestion control and retransmission on the wire; the
// engine only translates and re-times. Data read from a socket is
// PEEKed, framed, and acknowledged to the kernel only once the guest
// has acknowledged it; data from the tap is pushed into the socket and
// acknowledged back by watching the kernel's own progress.
//
//   TcpCtx - engine state: port config, socket pools, frame pools
//   listen_handler - accept for host-originated connections
//   tap_handler - batched segments from the guest
//   sock_handler - socket readiness (connect completion, data, FIN)
//   timer_handler - per-connection timerfd deadlines
//   flow_defer / defer_handler - deferred retirement and pool refill

pub const SYN_TIMEOUT: Duration = Duration::from_secs(10);
pub const ACK_TIMEOUT: Duration = Duration::from_secs(2);
pub const ACK_INTERVAL: Duration = Duration::from_millis(10);
pub const FIN_TIMEOUT: Duration = Duration::from_secs(60);
pub const ACT_TIMEOUT: Duration = Duration::from_secs(7200);
pub const MAX_RETRANS: u8 = 3;

pub const WINDOW_DEFAULT: u16 = 14600;
pub const MAX_WS: u8 = 8;
pub const MAX_WINDOW: u32 = 16 << 20;
const SNDBUF_SMALL: u32 = 128 * 1024;

pub const TCP_SOCK_POOL_SIZE: usize = 32;
const LOW_RTT_TABLE_SIZE: usize = 8;
const LOW_RTT_THRESHOLD_US: u32 = 10;

pub const DISCARD_BYTES: usize = 16 << 20;

// Connection events. The three state bits are mutually exclusive;
// setting one clears the others. The remaining bits are observations
// that accumulate until CLOSED.
pub const SOCK_ACCEPTED: u16 = 1 << 0;
pub const TAP_SYN_RCVD: u16 = 1 << 1;
pub const ESTABLISHED: u16 = 1 << 2;
pub const CONN_STATE_BITS: u16 = SOCK_ACCEPTED | TAP_SYN_RCVD | ESTABLISHED;
pub const TAP_SYN_ACK_SENT: u16 = 1 << 3;
pub const SOCK_FIN_RCVD: u16 = 1 << 4;
pub const SOCK_FIN_SENT: u16 = 1 << 5;
pub const TAP_FIN_RCVD: u16 = 1 << 6;
pub const TAP_FIN_SENT: u16 = 1 << 7;
pub const TAP_FIN_ACKED: u16 = 1 << 8;
pub const CLOSED: u16 = 1 << 9;

// Connection flags.
pub const STALLED: u8 = 1 << 0;
pub const LOCAL: u8 = 1 << 1;
pub const ACTIVE_CLOSE: u8 = 1 << 2;
pub const ACK_TO_TAP_DUE: u8 = 1 << 3;
pub const ACK_FROM_TAP_DUE: u8 = 1 << 4;

// Wrap-safe sequence comparisons, valid over the +/- 2^31 window.
pub fn seq_lt(a: u32, b: u32) -> bool { (a.wrapping_sub(b) as i32) < 0 }
pub fn seq_le(a: u32, b: u32) -> bool { (a.wrapping_sub(b) as i32) <= 0 }
pub fn seq_gt(a: u32, b: u32) -> bool { (a.wrapping_sub(b) as i32) > 0 }
pub fn seq_ge(a: u32, b: u32) -> bool { (a.wrapping_sub(b) as i32) >= 0 }

#[derive(Clone, Copy)]
pub struct TcpConn {
    pub sock: i32,
    pub timer: i32,
    pub events: u16,
    pub flags: u8,
    pub retrans: u8,
    pub ws_from_tap: u8,
    pub ws_to_tap: u8,
    pub seq_dup_ack_approx: u8,
    pub v6: bool,
    pub in_epoll: bool,
    pub mss: u16,
    pub wnd_from_tap: u16,
    pub wnd_to_tap: u16,
    pub sndbuf: u32,
    pub seq_to_tap: u32,
    pub seq_ack_from_tap: u32,
    pub seq_from_tap: u32,
    pub seq_ack_to_tap: u32,
    pub seq_init_from_tap: u32,
    pub seq_init_to_tap: u32,
}

impl Default for TcpConn {
    fn default() -> TcpConn {
        TcpConn {
            sock: -1,
            timer: -1,
            events: 0,
            flags: 0,
            retrans: 0,
            ws_from_tap: 0,
            ws_to_tap: 0,
            seq_dup_ack_approx: 0,
            v6: false,
            in_epoll: false,
            mss: 536,
            wnd_from_tap: WINDOW_DEFAULT,
            wnd_to_tap: WINDOW_DEFAULT,
            sndbuf: 0,
            seq_to_tap: 0,
            seq_ack_from_tap: 0,
            seq_from_tap: 0,
            seq_ack_to_tap: 0,
            seq_init_from_tap: 0,
            seq_init_to_tap: 0,
        }
    }
}

#[derive(Default)]
pub struct TcpFlow {
    pub common: FlowCommon,
    pub conn: TcpConn,
}

impl TcpFlow {
    pub fn faddr(&self) -> InAny { self.common.side[TAPSIDE].faddr }
    pub fn oaddr(&self) -> InAny { self.common.side[TAPSIDE].eaddr }
    pub fn eport(&self) -> u16 { self.common.side[TAPSIDE].eport }
    pub fn fport(&self) -> u16 { self.common.side[TAPSIDE].fport }
}

// Namespace-to-namespace loopback connection, relayed without L2
// frames. Only the flow-table intersection of the spliced path lives
// here: a PEEK-and-consume relay between the two sockets.
pub struct SpliceFlow {
    pub common: FlowCommon,
    pub sock: [i32; 2],
    pub closing: bool,
}

impl Default for SpliceFlow {
    fn default() -> SpliceFlow {
        SpliceFlow {
            common: FlowCommon::default(),
            sock: [-1, -1],
            closing: false,
        }
    }
}

pub struct TcpCtx {
    pub fwd_in: fwd::FwdPorts,
    pub fwd_out: fwd::FwdPorts,
    pub listen_socks: [Box<[i32]>; 2],
    pool: [[i32; TCP_SOCK_POOL_SIZE]; 2],
    pub bufs4: FramePool,
    pub bufs6: FramePool,
    pub flags4: FramePool,
    pub flags6: FramePool,
    pub discard: Box<[u8]>,
    low_rtt: [InAny; LOW_RTT_TABLE_SIZE],
    low_rtt_cur: usize,
}

impl TcpCtx {
    pub fn new() -> TcpCtx {
        TcpCtx {
            fwd_in: fwd::FwdPorts::new(),
            fwd_out: fwd::FwdPorts::new(),
            listen_socks: [vec![-1; 65536].into_boxed_slice(),
                           vec![-1; 65536].into_boxed_slice()],
            pool: [[-1; TCP_SOCK_POOL_SIZE]; 2],
            bufs4: FramePool::new(false, false),
            bufs6: FramePool::new(true, false),
            flags4: FramePool::new(false, true),
            flags6: FramePool::new(true, true),
            discard: vec![0u8; DISCARD_BYTES].into_boxed_slice(),
            low_rtt: [InAny::default(); LOW_RTT_TABLE_SIZE],
            low_rtt_cur: 0,
        }
    }

    pub fn update_l2(&mut self, our_mac: &[u8; 6], guest_mac: &[u8; 6]) {
        self.bufs4.update_l2(our_mac, guest_mac);
        self.bufs6.update_l2(our_mac, guest_mac);
        self.flags4.update_l2(our_mac, guest_mac);
        self.flags6.update_l2(our_mac, guest_mac);
    }

    fn low_rtt_has(&self, addr: &InAny) -> bool {
        self.low_rtt.iter().any(|a| a == addr)
    }

    fn low_rtt_note(&mut self, addr: &InAny, min_rtt_us: u32) {
        if min_rtt_us >= LOW_RTT_THRESHOLD_US || self.low_rtt_has(addr) {
            return;
        }
        // Unspecified entries are sentinel holes; otherwise replace
        // round-robin.
        self.low_rtt[self.low_rtt_cur] = *addr;
        self.low_rtt_cur = (self.low_rtt_cur + 1) % LOW_RTT_TABLE_SIZE;
    }
}

// Linux tcp_info, declared locally so the fields past the libc
// definition (up to tcpi_snd_wnd, Linux 5.4) are reachable. The kernel
// reports how many bytes it filled; anything past that is unavailable.
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct TcpInfo {
    pub state: u8,
    pub ca_state: u8,
    pub retransmits: u8,
    pub probes: u8,
    pub backoff: u8,
    pub options: u8,
    pub wscale: u8, // snd_wscale:4, rcv_wscale:4
    pub flags: u8,  // delivery_rate_app_limited:1, fastopen_client_fail:2
    pub rto: u32,
    pub ato: u32,
    pub snd_mss: u32,
    pub rcv_mss: u32,
    pub unacked: u32,
    pub sacked: u32,
    pub lost: u32,
    pub retrans: u32,
    pub fackets: u32,
    pub last_data_sent: u32,
    pub last_ack_sent: u32,
    pub last_data_recv: u32,
    pub last_ack_recv: u32,
    pub pmtu: u32,
    pub rcv_ssthresh: u32,
    pub rtt: u32,
    pub rttvar: u32,
    pub snd_ssthresh: u32,
    pub snd_cwnd: u32,
    pub advmss: u32,
    pub reordering: u32,
    pub rcv_rtt: u32,
    pub rcv_space: u32,
    pub total_retrans: u32,
    pub pacing_rate: u64,
    pub max_pacing_rate: u64,
    pub bytes_acked: u64,
    pub bytes_received: u64,
    pub segs_out: u32,
    pub segs_in: u32,
    pub notsent_bytes: u32,
    pub min_rtt: u32,
    pub data_segs_in: u32,
    pub data_segs_out: u32,
    pub delivery_rate: u64,
    pub busy_time: u64,
    pub rwnd_limited: u64,
    pub sndbuf_limited: u64,
    pub delivered: u32,
    pub delivered_ce: u32,
    pub bytes_sent: u64,
    pub bytes_retrans: u64,
    pub dsack_dups: u32,
    pub reord_seen: u32,
    pub rcv_ooopack: u32,
    pub snd_wnd: u32,
}

const TI_BYTES_ACKED_END: usize = 128;
const TI_MIN_RTT_END: usize = 152;
const TI_SND_WND_END: usize = 232;

#[derive(Clone, Copy)]
pub struct TcpInfoCap {
    pub info: TcpInfo,
    pub len: usize,
}

impl TcpInfoCap {
    pub fn has_bytes_acked(&self) -> bool {
        self.len >= TI_BYTES_ACKED_END && self.info.bytes_acked != 0
    }
    pub fn has_min_rtt(&self) -> bool {
        self.len >= TI_MIN_RTT_END
    }
    pub fn has_snd_wnd(&self) -> bool {
        self.len >= TI_SND_WND_END
    }
}

pub fn tcp_info(sock: i32) -> Option<TcpInfoCap> {
    let mut info = TcpInfo::default();
    let mut len = mem::size_of::<TcpInfo>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(sock, libc::IPPROTO_TCP, libc::TCP_INFO,
                         &mut info as *mut _ as *mut libc::c_void,
                         &mut len)
    };
    if ret == -1 {
        return None;
    }
    Some(TcpInfoCap { info, len: len as usize })
}

// Segment accessors over the raw L4 slice (header plus payload).
fn th_seq(s: &[u8]) -> u32 {
    u32::from_be_bytes([s[4], s[5], s[6], s[7]])
}
fn th_ack(s: &[u8]) -> u32 {
    u32::from_be_bytes([s[8], s[9], s[10], s[11]])
}
fn th_doff(s: &[u8]) -> usize {
    ((s[12] >> 4) as usize).max(5) * 4
}
fn th_flags(s: &[u8]) -> u8 {
    s[13]
}
fn th_wnd(s: &[u8]) -> u16 {
    u16::from_be_bytes([s[14], s[15]])
}
fn th_payload(s: &[u8]) -> &[u8] {
    let doff = th_doff(s).min(s.len());
    &s[doff..]
}

const OPT_MSS: u8 = 2;
const OPT_WS: u8 = 3;

// Walk TCP options in a SYN; returns the value of the requested kind.
fn opt_get(s: &[u8], kind: u8) -> Option<u32> {
    let doff = th_doff(s).min(s.len());
    let mut opts = &s[20.min(doff)..doff];
    while let Some(&k) = opts.first() {
        match k {
            0 => return None,
            1 => { opts = &opts[1..]; }
            _ => {
                let len = *opts.get(1)? as usize;
                if len < 2 || len > opts.len() {
                    return None;
                }
                if k == kind {
                    return match len - 2 {
                        1 => Some(opts[2] as u32),
                        2 => Some(u16::from_be_bytes([opts[2], opts[3]])
                                  as u32),
                        4 => Some(u32::from_be_bytes([opts[2], opts[3],
                                                      opts[4], opts[5]])),
                        _ => None,
                    };
                }
                opts = &opts[len..];
            }
        }
    }
    None
}

// Approximate TCP state for logging, derived from the event bits.
pub fn state_name(events: u16) -> &'static str {
    if events & CLOSED != 0 { return "CLOSED"; }
    if events & ESTABLISHED != 0 {
        if events & TAP_FIN_SENT != 0 && events & TAP_FIN_ACKED != 0 {
            return "TIME_WAIT";
        }
        if events & TAP_FIN_RCVD != 0 && events & SOCK_FIN_SENT != 0 {
            return "LAST_ACK";
        }
        if events & TAP_FIN_RCVD != 0 { return "CLOSE_WAIT"; }
        if events & TAP_FIN_SENT != 0 { return "FIN_WAIT_1"; }
        if events & SOCK_FIN_RCVD != 0 { return "CLOSE_WAIT"; }
        return "ESTABLISHED";
    }
    if events & TAP_SYN_RCVD != 0 { return "SYN_SENT"; }
    if events & SOCK_ACCEPTED != 0 { return "SYN_RCVD"; }
    "LISTEN"
}

// Pure event transition: state bits displace each other, observer bits
// accumulate.
pub fn event_set(conn: &mut TcpConn, event: u16) {
    if event & CONN_STATE_BITS != 0 {
        conn.events &= !CONN_STATE_BITS;
    }
    conn.events |= event;
}

fn conn_mut(flows: &mut FlowTable, idx: usize) -> Option<&mut TcpFlow> {
    match &mut flows.entries[idx] {
        Flow::Tcp(f) => Some(f),
        _ => None,
    }
}

fn conn_snapshot(flows: &FlowTable, idx: usize) -> Option<TcpConn> {
    match &flows.entries[idx] {
        Flow::Tcp(f) => Some(f.conn),
        _ => None,
    }
}

fn conn_event(ctx: &mut Ctx, idx: usize, event: u16) {
    let closed = {
        let f = match conn_mut(&mut ctx.flows, idx) {
            Some(f) => f,
            None => return,
        };
        event_set(&mut f.conn, event);
        trace!("flow {}: {}", idx, state_name(f.conn.events));
        f.conn.events & CLOSED != 0
    };
    if closed {
        let secret = ctx.hash_secret;
        ctx.flows.hash_remove(&secret, flow::sidx(idx, TAPSIDE));
        return;
    }
    timer_ctl(ctx, idx);
    epoll_ctl_conn(ctx, idx);
}

fn conn_flag(ctx: &mut Ctx, idx: usize, flag: u8, set: bool) {
    {
        let f = match conn_mut(&mut ctx.flows, idx) {
            Some(f) => f,
            None => return,
        };
        let had = f.conn.flags & flag != 0;
        if had == set {
            return;
        }
        if set { f.conn.flags |= flag; } else { f.conn.flags &= !flag; }
    }
    timer_ctl(ctx, idx);
    if flag & STALLED != 0 {
        epoll_ctl_conn(ctx, idx);
    }
}

// Epoll interest per state: stalled connections watch for write space
// edge-triggered; a connection whose FIN we already forwarded only
// keeps an edge-triggered placeholder.
fn conn_epoll_events(events: u16, flags: u8) -> u32 {
    if events & CLOSED != 0 {
        return 0;
    }
    if events & ESTABLISHED != 0 {
        if flags & STALLED != 0 {
            return (libc::EPOLLIN | libc::EPOLLOUT | libc::EPOLLRDHUP
                    | libc::EPOLLET) as u32;
        }
        if events & TAP_FIN_SENT != 0 {
            return libc::EPOLLET as u32;
        }
        return (libc::EPOLLIN | libc::EPOLLRDHUP) as u32;
    }
    if events & TAP_SYN_RCVD != 0 {
        // connect() in flight
        return (libc::EPOLLOUT | libc::EPOLLRDHUP | libc::EPOLLET) as u32;
    }
    (libc::EPOLLRDHUP) as u32
}

fn epoll_ctl_conn(ctx: &mut Ctx, idx: usize) {
    let (sock, events, flags, in_epoll) = {
        let f = match conn_mut(&mut ctx.flows, idx) {
            Some(f) => f,
            None => return,
        };
        (f.conn.sock, f.conn.events, f.conn.flags, f.conn.in_epoll)
    };
    if sock < 0 || events & CLOSED != 0 {
        return;
    }
    let mask = conn_epoll_events(events, flags);
    let r = ERef::new(RefType::Tcp, sock, idx as u32);
    let res = if in_epoll {
        epollref::epoll_mod(ctx.epfd, mask, r)
    } else {
        epollref::epoll_add(ctx.epfd, mask, r)
    };
    if res.is_ok() {
        if let Some(f) = conn_mut(&mut ctx.flows, idx) {
            f.conn.in_epoll = true;
        }
    }
}

// Deadline selection. A single timerfd per connection is re-armed
// whenever events or flags change.
fn timer_duration(events: u16, flags: u8) -> Duration {
    if flags & ACK_TO_TAP_DUE != 0 {
        ACK_INTERVAL
    } else if flags & ACK_FROM_TAP_DUE != 0 {
        if events & ESTABLISHED == 0 { SYN_TIMEOUT } else { ACK_TIMEOUT }
    } else if events & SOCK_FIN_SENT != 0 && events & TAP_FIN_ACKED != 0 {
        FIN_TIMEOUT
    } else {
        ACT_TIMEOUT
    }
}

fn timer_ctl(ctx: &mut Ctx, idx: usize) {
    let (timer, events, flags) = {
        let f = match conn_mut(&mut ctx.flows, idx) {
            Some(f) => f,
            None => return,
        };
        (f.conn.timer, f.conn.events, f.conn.flags)
    };
    if events & CLOSED != 0 {
        return;
    }
    let timer = if timer >= 0 {
        timer
    } else {
        let fd = unsafe {
            libc::timerfd_create(libc::CLOCK_MONOTONIC,
                                 libc::TFD_NONBLOCK | libc::TFD_CLOEXEC)
        };
        let fd = match epollref::fd_guard(fd) {
            Ok(fd) => fd,
            Err(_) => return,
        };
        let r = ERef::new(RefType::TcpTimer, fd, idx as u32);
        if epollref::epoll_add(ctx.epfd, libc::EPOLLIN as u32, r).is_err() {
            unsafe { libc::close(fd) };
            return;
        }
        if let Some(f) = conn_mut(&mut ctx.flows, idx) {
            f.conn.timer = fd;
        }
        fd
    };
    let d = timer_duration(events, flags);
    let spec = libc::itimerspec {
        it_interval: libc::timespec { tv_sec: 0, tv_nsec: 0 },
        it_value: libc::timespec {
            tv_sec: d.as_secs() as libc::time_t,
            tv_nsec: d.subsec_nanos() as libc::c_long,
        },
    };
    unsafe {
        libc::timerfd_settime(timer, 0, &spec, std::ptr::null_mut());
    }
}

// Initial sequence, RFC 6528 flavored: keyed hash of the connection
// tuple folded to 32 bits, plus a tick counter off the monotonic clock.
fn isn(ctx: &Ctx, faddr: &InAny, oaddr: &InAny, eport: u16, fport: u16,
       now: Instant) -> u32 {
    let mut feed = SipFeed::new(&ctx.hash_secret);
    feed.feed_bytes(&faddr.0)
        .feed_bytes(&oaddr.0)
        .feed((fport as u64) << 16 | eport as u64);
    let h = feed.finish();
    let folded = ((h >> 32) ^ h) as u32;
    let tick = (now.duration_since(ctx.start).as_nanos() >> 5) as u32;
    folded.wrapping_add(tick)
}

// SOCKET POOLS
//
// Pre-opened non-blocking stream sockets per family, so the SYN path
// never pays socket(2) latency.

fn sock_open(v6: bool) -> io::Result<i32> {
    let af = if v6 { libc::AF_INET6 } else { libc::AF_INET };
    let fd = unsafe {
        libc::socket(af,
                     libc::SOCK_STREAM | libc::SOCK_NONBLOCK
                     | libc::SOCK_CLOEXEC, 0)
    };
    epollref::fd_guard(fd)
}

pub fn sock_pool_refill(ctx: &mut Ctx) {
    for (v, pool) in ctx.tcp.pool.iter_mut().enumerate() {
        for slot in pool.iter_mut() {
            if *slot >= 0 {
                continue;
            }
            match sock_open(v == 1) {
                Ok(fd) => *slot = fd,
                Err(_) => return,
            }
        }
    }
}

fn sock_from_pool(ctx: &mut Ctx, v6: bool) -> Option<i32> {
    let pool = &mut ctx.tcp.pool[v6 as usize];
    for slot in pool.iter_mut() {
        if *slot >= 0 {
            let fd = *slot;
            *slot = -1;
            return Some(fd);
        }
    }
    sock_open(v6).ok()
}

// Refill pools when half-drained; called from the periodic tick.
pub fn defer_handler(ctx: &mut Ctx) {
    for v in 0..2 {
        let empty = ctx.tcp.pool[v].iter().filter(|&&s| s < 0).count();
        if empty > TCP_SOCK_POOL_SIZE / 2 {
            sock_pool_refill(ctx);
            return;
        }
    }
}

// LISTENING SOCKETS (forwarded inbound ports)

pub fn listen_sock_init(ctx: &mut Ctx, v6: bool, port: u16)
                        -> ctx::Result<()> {
    let fd = sock_open(v6)?;
    let one: libc::c_int = 1;
    unsafe {
        libc::setsockopt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR,
                         &one as *const _ as *const libc::c_void,
                         mem::size_of::<libc::c_int>() as libc::socklen_t);
        if v6 {
            libc::setsockopt(fd, libc::IPPROTO_IPV6, libc::IPV6_V6ONLY,
                             &one as *const _ as *const libc::c_void,
                             mem::size_of::<libc::c_int>()
                             as libc::socklen_t);
        }
    }
    let any = if v6 {
        InAny::from_v6(std::net::Ipv6Addr::UNSPECIFIED)
    } else {
        InAny::from_v4(std::net::Ipv4Addr::UNSPECIFIED)
    };
    let (sa, salen) = any.to_sockaddr(port);
    let ret = unsafe {
        libc::bind(fd, &sa as *const _ as *const libc::sockaddr, salen)
    };
    if ret == -1 || unsafe { libc::listen(fd, 128) } == -1 {
        let e = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(ctx::Error::Sys(e));
    }
    let lref = ListenRef { v6, pif: Pif::Host as u8, port };
    epollref::epoll_add(ctx.epfd, libc::EPOLLIN as u32,
                        ERef::new(RefType::TcpListen, fd, lref.pack()))?;
    ctx.tcp.listen_socks[v6 as usize][port as usize] = fd;
    Ok(())
}

pub fn listen_sock_close(ctx: &mut Ctx, v6: bool, port: u16) {
    let fd = ctx.tcp.listen_socks[v6 as usize][port as usize];
    if fd >= 0 {
        let _ = epollref::epoll_del(ctx.epfd, fd);
        unsafe { libc::close(fd) };
        ctx.tcp.listen_socks[v6 as usize][port as usize] = -1;
    }
}

// CONNECTION SETUP, HOST SIDE (guest is the server)

pub fn listen_handler(ctx: &mut Ctx, eref: ERef, now: Instant) {
    let lref = ListenRef::unpack(eref.data);
    loop {
        let mut ss: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut sl = mem::size_of::<libc::sockaddr_storage>()
            as libc::socklen_t;
        let sock = unsafe {
            libc::accept4(eref.fd, &mut ss as *mut _ as *mut libc::sockaddr,
                          &mut sl,
                          libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC)
        };
        let sock = match epollref::fd_guard(sock) {
            Ok(fd) => fd,
            Err(_) => return,
        };
        let (peer, pport) = match InAny::from_sockaddr(&ss) {
            Some(p) => p,
            None => { unsafe { libc::close(sock) }; continue; }
        };
        if peer.is_unspecified() || peer.is_multicast()
            || peer.is_broadcast() || pport == 0
        {
            unsafe { libc::close(sock) };
            continue;
        }
        if ctx.mode == Mode::Ns && peer.is_loopback() {
            splice_conn_from_sock(ctx, sock, &lref);
            continue;
        }
        conn_from_sock(ctx, sock, peer, pport, &lref, now);
    }
}

fn conn_from_sock(ctx: &mut Ctx, sock: i32, peer: InAny, pport: u16,
                  lref: &ListenRef, now: Instant) {
    let oaddr = if lref.v6 {
        match ctx.ip6.addr {
            Some(a) => InAny::from_v6(a),
            None => { unsafe { libc::close(sock) }; return; }
        }
    } else {
        match ctx.ip4.addr {
            Some(a) => InAny::from_v4(a),
            None => { unsafe { libc::close(sock) }; return; }
        }
    };
    let idx = match ctx.flows.alloc() {
        Some(i) => i,
        None => {
            ctx.cnt.flow_full_drops += 1;
            unsafe { libc::close(sock) };
            return;
        }
    };
    ctx::sock_set_bufs(sock, ctx.low_buf_limit);
    let faddr = nat::snat_inbound(ctx, peer);
    let eport = ctx.tcp.fwd_in.mapped(lref.port);
    let fport = pport;

    let mut f = TcpFlow::default();
    f.common.side[SOCKSIDE] = FlowSide {
        pif: Pif::Host,
        eaddr: peer,
        eport: pport,
        faddr: InAny::default(),
        fport: lref.port,
    };
    f.common.side[TAPSIDE] = FlowSide {
        pif: Pif::Tap,
        eaddr: oaddr,
        eport,
        faddr,
        fport,
    };
    let seq = isn(ctx, &faddr, &oaddr, eport, fport, now);
    f.conn.sock = sock;
    f.conn.v6 = lref.v6;
    f.conn.seq_init_to_tap = seq;
    f.conn.seq_to_tap = seq;
    f.conn.seq_ack_from_tap = seq;
    f.conn.wnd_from_tap = WINDOW_DEFAULT;
    f.conn.ws_to_tap = MAX_WS;
    let mss_limit = (if lref.v6 { tcp_buf::MSS6 } else { tcp_buf::MSS4 })
        as u32;
    if let Some(ti) = tcp_info(sock) {
        if ti.info.snd_mss > 0 {
            f.conn.mss = ti.info.snd_mss.min(mss_limit) as u16;
        }
    }
    let mut sndbuf: libc::c_int = 0;
    let mut slen = mem::size_of::<libc::c_int>() as libc::socklen_t;
    unsafe {
        libc::getsockopt(sock, libc::SOL_SOCKET, libc::SO_SNDBUF,
                         &mut sndbuf as *mut _ as *mut libc::c_void,
                         &mut slen);
    }
    f.conn.sndbuf = sndbuf.max(0) as u32;
    ctx.flows.entries[idx] = Flow::Tcp(f);
    let secret = ctx.hash_secret;
    ctx.flows.hash_insert(&secret, flow::sidx(idx, TAPSIDE));
    ctx.cnt.tcp_conns += 1;

    conn_event(ctx, idx, SOCK_ACCEPTED);
    send_flag(ctx, idx, FlagKind::Syn);
    conn_flag(ctx, idx, ACK_FROM_TAP_DUE, true);
}

// CONNECTION SETUP, TAP SIDE (guest is the client)

fn conn_from_tap(ctx: &mut Ctx, v6: bool, saddr: InAny, daddr: InAny,
                 seg: &[u8], now: Instant) {
    let sport = u16::from_be_bytes([seg[0], seg[1]]);
    let dport = u16::from_be_bytes([seg[2], seg[3]]);
    if sport == 0 || dport == 0 || daddr.is_unspecified()
        || daddr.is_multicast() || daddr.is_broadcast()
    {
        ctx.cnt.proto_drops += 1;
        return;
    }
    let idx = match ctx.flows.alloc() {
        Some(i) => i,
        None => {
            ctx.cnt.flow_full_drops += 1;
            return;
        }
    };
    let sock = match sock_from_pool(ctx, v6) {
        Some(s) => s,
        None => {
            ctx.flows.alloc_cancel(idx);
            return;
        }
    };
    ctx::sock_set_bufs(sock, ctx.low_buf_limit);

    // Where the connection actually goes: DNS redirect first, then the
    // gateway becomes the host's loopback.
    let dport_sock = ctx.tcp.fwd_out.mapped(dport);
    let daddr_sock = nat::tap_dst(ctx, &daddr, dport);

    let mss_limit = (if v6 { tcp_buf::MSS6 } else { tcp_buf::MSS4 }) as u32;
    let mss = opt_get(seg, OPT_MSS).unwrap_or(536).min(mss_limit) as u16;
    let ws = opt_get(seg, OPT_WS)
        .map(|w| (w as u8).min(MAX_WS))
        .unwrap_or(0);
    let seq_init = th_seq(seg);

    let mut f = TcpFlow::default();
    f.common.side[TAPSIDE] = FlowSide {
        pif: Pif::Tap,
        eaddr: saddr,
        eport: sport,
        faddr: daddr,
        fport: dport,
    };
    f.common.side[SOCKSIDE] = FlowSide {
        pif: Pif::Host,
        eaddr: daddr_sock,
        eport: dport_sock,
        faddr: InAny::default(),
        fport: 0,
    };
    let seq_ours = isn(ctx, &daddr, &saddr, sport, dport, now);
    f.conn.sock = sock;
    f.conn.v6 = v6;
    f.conn.mss = mss;
    f.conn.ws_from_tap = ws;
    f.conn.ws_to_tap = MAX_WS;
    f.conn.wnd_from_tap = th_wnd(seg).max(1); // SYN window is unscaled
    f.conn.seq_init_from_tap = seq_init;
    f.conn.seq_from_tap = seq_init.wrapping_add(1);
    f.conn.seq_ack_to_tap = seq_init.wrapping_add(1);
    f.conn.seq_init_to_tap = seq_ours;
    f.conn.seq_to_tap = seq_ours;
    f.conn.seq_ack_from_tap = seq_ours;
    if daddr_sock.is_loopback() {
        f.conn.flags |= LOCAL;
    }
    ctx.flows.entries[idx] = Flow::Tcp(f);
    let secret = ctx.hash_secret;
    ctx.flows.hash_insert(&secret, flow::sidx(idx, TAPSIDE));
    ctx.cnt.tcp_conns += 1;

    bind_outbound(ctx, sock, v6, &daddr_sock);

    let (sa, salen) = daddr_sock.to_sockaddr(dport_sock);
    let ret = unsafe {
        libc::connect(sock, &sa as *const _ as *const libc::sockaddr, salen)
    };
    if ret == 0 {
        conn_event(ctx, idx, TAP_SYN_RCVD);
        send_flag(ctx, idx, FlagKind::SynAck);
        conn_flag(ctx, idx, ACK_FROM_TAP_DUE, true);
    } else if util::errno() == libc::EINPROGRESS {
        conn_event(ctx, idx, TAP_SYN_RCVD);
        conn_flag(ctx, idx, ACK_FROM_TAP_DUE, true);
    } else {
        debug!("connect failed: {}", io::Error::last_os_error());
        rst(ctx, idx);
    }
}

// For IPv6 link-local destinations, the socket must carry our
// link-local source with the right scope; for other non-loopback
// destinations, honor the configured outbound address and interface.
fn bind_outbound(ctx: &Ctx, sock: i32, v6: bool, dst: &InAny) {
    if dst.is_loopback() {
        return;
    }
    if v6 && dst.is_linklocal() {
        let mut sa6: libc::sockaddr_in6 = unsafe { mem::zeroed() };
        sa6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
        sa6.sin6_addr.s6_addr = ctx.ip6.addr_ll.octets();
        if let Some(ifname) = &ctx.ifname_out {
            sa6.sin6_scope_id = unsafe {
                libc::if_nametoindex(util::cstr(ifname).as_ptr())
            };
        }
        unsafe {
            libc::bind(sock, &sa6 as *const _ as *const libc::sockaddr,
                       mem::size_of::<libc::sockaddr_in6>()
                       as libc::socklen_t);
        }
        return;
    }
    let addr_out = if v6 {
        ctx.ip6.addr_out.map(InAny::from_v6)
    } else {
        ctx.ip4.addr_out.map(InAny::from_v4)
    };
    if let Some(a) = addr_out {
        let (sa, salen) = a.to_sockaddr(0);
        unsafe {
            libc::bind(sock, &sa as *const _ as *const libc::sockaddr,
                       salen);
        }
    }
    if let Some(ifname) = &ctx.ifname_out {
        let name = util::cstr(ifname);
        unsafe {
            libc::setsockopt(sock, libc::SOL_SOCKET, libc::SO_BINDTODEVICE,
                             name.as_ptr() as *const libc::c_void,
                             ifname.len() as libc::socklen_t);
        }
    }
}

// FLAG FRAMES

#[derive(Clone, Copy, PartialEq)]
pub enum FlagKind {
    Syn,
    SynAck,
    Ack,
    FinAck,
    Rst,
    DupAck,
}

fn syn_opts(mss: u16, ws: u8, buf: &mut [u8; 8]) -> usize {
    buf[0] = OPT_MSS;
    buf[1] = 4;
    buf[2..4].copy_from_slice(&mss.to_be_bytes());
    buf[4] = 1; // NOP
    buf[5] = OPT_WS;
    buf[6] = 3;
    buf[7] = ws;
    8
}

fn send_flag(ctx: &mut Ctx, idx: usize, kind: FlagKind) {
    // Refresh what we advertise before emitting anything ACK-bearing.
    if kind != FlagKind::Syn {
        update_seqack_wnd(ctx, idx, false, None);
    }
    let (v6, meta0, opts_len, opts_buf, consume_seq) = {
        let f = match conn_mut(&mut ctx.flows, idx) {
            Some(f) => f,
            None => return,
        };
        let c = &f.conn;
        let mut opts_buf = [0u8; 8];
        let (flags, seq, opts_len, consume) = match kind {
            FlagKind::Syn => {
                let l = syn_opts(advertised_mss(c), c.ws_to_tap,
                                 &mut opts_buf);
                (FL_SYN, c.seq_init_to_tap, l, true)
            }
            FlagKind::SynAck => {
                let l = syn_opts(advertised_mss(c), c.ws_to_tap,
                                 &mut opts_buf);
                (FL_SYN | FL_ACK, c.seq_init_to_tap, l, true)
            }
            FlagKind::Ack | FlagKind::DupAck => {
                (FL_ACK, c.seq_to_tap, 0, false)
            }
            FlagKind::FinAck => {
                (FL_FIN | FL_ACK, c.seq_to_tap, 0, true)
            }
            FlagKind::Rst => (FL_RST | FL_ACK, c.seq_to_tap, 0, false),
        };
        let side = &f.common.side[TAPSIDE];
        let meta = FrameMeta {
            saddr: side.faddr,
            daddr: side.eaddr,
            sport: side.fport,
            dport: side.eport,
            seq,
            ack: if flags == FL_SYN { 0 } else { c.seq_ack_to_tap },
            wnd: c.wnd_to_tap.max(if flags & FL_SYN != 0
                                  { WINDOW_DEFAULT } else { 1 }),
            flags,
            // window in SYN segments is unscaled; everything later is
            // already stored shifted down by ws_to_tap
        };
        (c.v6, meta, opts_len, opts_buf, consume)
    };
    let count = if kind == FlagKind::DupAck { 2 } else { 1 };
    {
        let pool = if v6 { &mut ctx.tcp.flags6 } else { &mut ctx.tcp.flags4 };
        if pool.space() < count {
            tcp_buf::flush(ctx);
        }
    }
    let pool = if v6 { &mut ctx.tcp.flags6 } else { &mut ctx.tcp.flags4 };
    for _ in 0..count {
        let i = tcp_buf::TCP_FRAMES - pool.space();
        pool.commit(i, &meta0, &opts_buf[..opts_len], 0);
    }
    if consume_seq {
        if let Some(f) = conn_mut(&mut ctx.flows, idx) {
            // SYN and FIN occupy one unit of sequence space.
            f.conn.seq_to_tap = f.conn.seq_to_tap.wrapping_add(1);
            if kind == FlagKind::Syn || kind == FlagKind::SynAck {
                f.conn.seq_to_tap = f.conn.seq_init_to_tap.wrapping_add(1);
                f.conn.seq_ack_from_tap = f.conn.seq_to_tap;
            }
        }
    }
    if kind == FlagKind::SynAck {
        conn_event(ctx, idx, TAP_SYN_ACK_SENT);
    }
}

fn advertised_mss(c: &TcpConn) -> u16 {
    let limit = if c.v6 { tcp_buf::MSS6 } else { tcp_buf::MSS4 };
    c.mss.min(limit as u16)
}

fn rst(ctx: &mut Ctx, idx: usize) {
    send_flag(ctx, idx, FlagKind::Rst);
    conn_event(ctx, idx, CLOSED);
}

// RST for a segment that matches no flow (and is not itself an RST).
fn rst_no_conn(ctx: &mut Ctx, v6: bool, saddr: InAny, daddr: InAny,
               seg: &[u8]) {
    let sport = u16::from_be_bytes([seg[0], seg[1]]);
    let dport = u16::from_be_bytes([seg[2], seg[3]]);
    let flags = th_flags(seg);
    let plen = th_payload(seg).len() as u32;
    let ack = th_seq(seg)
        .wrapping_add(plen)
        .wrapping_add((flags & FL_SYN != 0) as u32)
        .wrapping_add((flags & FL_FIN != 0) as u32);
    let meta = FrameMeta {
        saddr: daddr,
        daddr: saddr,
        sport: dport,
        dport: sport,
        seq: th_ack(seg),
        ack,
        wnd: 0,
        flags: FL_RST | FL_ACK,
    };
    {
        let pool = if v6 { &mut ctx.tcp.flags6 } else { &mut ctx.tcp.flags4 };
        if pool.space() < 1 {
            tcp_buf::flush(ctx);
        }
    }
    let pool = if v6 { &mut ctx.tcp.flags6 } else { &mut ctx.tcp.flags4 };
    let i = tcp_buf::TCP_FRAMES - pool.space();
    pool.commit(i, &meta, &[], 0);
}

// ACK/WINDOW MIRRORING (socket progress -> tap)

fn update_seqack_wnd(ctx: &mut Ctx, idx: usize, force_ack: bool,
                     ti: Option<TcpInfoCap>) -> bool {
    let snapshot = match conn_snapshot(&ctx.flows, idx) {
        Some(c) => c,
        None => return false,
    };
    if snapshot.events & CLOSED != 0 {
        return false;
    }
    let faddr = match &ctx.flows.entries[idx] {
        Flow::Tcp(f) => f.faddr(),
        _ => return false,
    };
    let closing = snapshot.events
        & (SOCK_FIN_RCVD | TAP_FIN_SENT | TAP_FIN_RCVD) != 0;
    let low_rtt = ctx.tcp.low_rtt_has(&faddr);
    let ti = ti.or_else(|| tcp_info(snapshot.sock));

    let mut new_ack = snapshot.seq_ack_to_tap;
    if snapshot.sndbuf < SNDBUF_SMALL || low_rtt || closing || force_ack
        || snapshot.flags & LOCAL != 0
    {
        // Bytes sitting in our send buffer are considered safe.
        new_ack = snapshot.seq_from_tap;
    } else if let Some(cap) = ti {
        if cap.has_bytes_acked() {
            let acked = snapshot.seq_init_from_tap
                .wrapping_add(cap.info.bytes_acked as u32)
                .wrapping_add(1); // SYN
            if seq_gt(acked, new_ack) {
                new_ack = acked;
            }
        } else {
            new_ack = snapshot.seq_from_tap;
        }
    } else {
        new_ack = snapshot.seq_from_tap;
    }
    if seq_lt(new_ack, snapshot.seq_ack_to_tap) {
        new_ack = snapshot.seq_ack_to_tap; // never decrease
    }

    let mut wnd = snapshot.sndbuf.max(WINDOW_DEFAULT as u32);
    if let Some(cap) = ti {
        if cap.has_min_rtt() {
            let tcpctx = &mut ctx.tcp;
            tcpctx.low_rtt_note(&faddr, cap.info.min_rtt);
        }
        if cap.has_snd_wnd() && !low_rtt {
            wnd = wnd.min(cap.info.snd_wnd);
        } else if cap.has_snd_wnd() {
            wnd = cap.info.snd_wnd;
        }
    }
    wnd = wnd.min(MAX_WINDOW);
    if snapshot.events & ESTABLISHED == 0 {
        // Never advertise less than the default during handshake.
        wnd = wnd.max(WINDOW_DEFAULT as u32);
    }
    let wnd_scaled = (wnd >> snapshot.ws_to_tap).min(u16::MAX as u32) as u16;

    let f = match conn_mut(&mut ctx.flows, idx) {
        Some(f) => f,
        None => return false,
    };
    let changed = new_ack != f.conn.seq_ack_to_tap
        || wnd_scaled != f.conn.wnd_to_tap;
    f.conn.seq_ack_to_tap = new_ack;
    f.conn.wnd_to_tap = wnd_scaled;
    if wnd_scaled == 0 {
        conn_flag(ctx, idx, ACK_TO_TAP_DUE, true);
    }
    changed
}

// Discard n newly acknowledged bytes from the kernel's receive queue;
// MSG_PEEK reads left them in place until the guest confirmed them.
fn sock_consume(sock: i32, n: u32) {
    if n == 0 {
        return;
    }
    unsafe {
        libc::recv(sock, std::ptr::null_mut(), n as usize,
                   libc::MSG_DONTWAIT | libc::MSG_TRUNC);
    }
}

// DATA, SOCKET -> TAP

fn data_from_sock(ctx: &mut Ctx, idx: usize, _now: Instant) {
    // Pending data frames carry not-yet-committed sequence numbers;
    // flush them first so already_sent below is computed against the
    // real send position.
    if ctx.tcp.bufs4.used() > 0 || ctx.tcp.bufs6.used() > 0 {
        tcp_buf::flush(ctx);
    }
    let snapshot = match conn_snapshot(&ctx.flows, idx) {
        Some(c) => c,
        None => return,
    };
    if snapshot.events & ESTABLISHED == 0 || snapshot.events & CLOSED != 0 {
        return;
    }
    let wnd = ((snapshot.wnd_from_tap as u32) << snapshot.ws_from_tap)
        .min(MAX_WINDOW);
    let already_sent = snapshot.seq_to_tap
        .wrapping_sub(snapshot.seq_ack_from_tap);
    if wnd == 0 || already_sent >= wnd {
        conn_flag(ctx, idx, STALLED, true);
        conn_flag(ctx, idx, ACK_FROM_TAP_DUE, true);
        return;
    }
    let send_cap = (wnd - already_sent) as usize;
    let mss = snapshot.mss.max(1) as usize;

    // Scatter list: slot 0 absorbs the already-sent prefix into the
    // shared discard region, the rest lands in frame payload areas.
    let (n, nframes, frame_base) = {
        let tcp = &mut ctx.tcp;
        let pool = if snapshot.v6 { &mut tcp.bufs6 } else { &mut tcp.bufs4 };
        let frame_base = tcp_buf::TCP_FRAMES - pool.space();
        let nframes = pool.space()
            .min((send_cap + mss - 1) / mss);
        if nframes == 0 {
            return;
        }
        let mut iov: [libc::iovec; tcp_buf::TCP_FRAMES + 1] =
            unsafe { mem::zeroed() };
        iov[0] = libc::iovec {
            iov_base: tcp.discard.as_mut_ptr() as *mut libc::c_void,
            iov_len: (already_sent as usize).min(tcp.discard.len()),
        };
        let mut left = send_cap;
        let pool = if snapshot.v6 { &mut tcp.bufs6 } else { &mut tcp.bufs4 };
        for i in 0..nframes {
            let len = left.min(mss);
            iov[1 + i] = libc::iovec {
                iov_base: pool.payload_ptr(frame_base + i)
                    as *mut libc::c_void,
                iov_len: len,
            };
            left -= len;
        }
        let mut mh: libc::msghdr = unsafe { mem::zeroed() };
        mh.msg_iov = iov.as_mut_ptr();
        mh.msg_iovlen = (1 + nframes) as _;
        let n = unsafe {
            libc::recvmsg(snapshot.sock, &mut mh,
                          libc::MSG_PEEK | libc::MSG_DONTWAIT)
        };
        (n, nframes, frame_base)
    };

    if n < 0 {
        match util::errno() {
            libc::EAGAIN | libc::EINTR => return,
            _ => { rst(ctx, idx); return; }
        }
    }
    let n = n as usize;
    if n as u32 <= already_sent {
        // Nothing new; a zero-length read after the socket-side FIN
        // means the stream is done and the guest gets our FIN.
        if snapshot.events & SOCK_FIN_RCVD != 0
            && snapshot.events & TAP_FIN_SENT == 0
        {
            send_flag(ctx, idx, FlagKind::FinAck);
            conn_event(ctx, idx, TAP_FIN_SENT);
        }
        return;
    }
    let new_bytes = n - already_sent as usize;
    update_seqack_wnd(ctx, idx, false, None);
    let snapshot = match conn_snapshot(&ctx.flows, idx) {
        Some(c) => c,
        None => return,
    };
    let side = match &ctx.flows.entries[idx] {
        Flow::Tcp(f) => f.common.side[TAPSIDE],
        _ => return,
    };

    let pool = if snapshot.v6 { &mut ctx.tcp.bufs6 } else
               { &mut ctx.tcp.bufs4 };
    let mut seq = snapshot.seq_to_tap;
    let mut left = new_bytes;
    let mut used = 0;
    for i in 0..nframes {
        if left == 0 {
            break;
        }
        let len = left.min(mss);
        left -= len;
        let meta = FrameMeta {
            saddr: side.faddr,
            daddr: side.eaddr,
            sport: side.fport,
            dport: side.eport,
            seq,
            ack: snapshot.seq_ack_to_tap,
            wnd: snapshot.wnd_to_tap.max(1),
            flags: FL_ACK | if left == 0 { FL_PSH } else { 0 },
        };
        seq = seq.wrapping_add(len as u32);
        pool.commit(frame_base + i, &meta, &[], len);
        pool.set_seq_update(frame_base + i, idx, seq);
        used += 1;
    }
    trace!("flow {}: {} bytes in {} frames to tap", idx, new_bytes, used);
}

// DATA, TAP -> SOCKET

#[allow(clippy::too_many_arguments)]
pub fn tap_handler(ctx: &mut Ctx, v6: bool, saddr: InAny, daddr: InAny,
                   sport: u16, dport: u16, buf: &[u8],
                   segs: &packet::Pool, now: Instant) {
    let secret = ctx.hash_secret;
    let idx = match ctx.flows.hash_lookup(&secret, &daddr, sport, dport) {
        Some(i) => i,
        None => {
            let seg0 = match segs.get(buf, 0) {
                Some(s) if s.len() >= 20 => s,
                _ => return,
            };
            let flags = th_flags(seg0);
            if flags & (FL_SYN | FL_ACK | FL_RST | FL_FIN) == FL_SYN {
                conn_from_tap(ctx, v6, saddr, daddr, seg0, now);
            } else if flags & FL_RST == 0 {
                rst_no_conn(ctx, v6, saddr, daddr, seg0);
            }
            return;
        }
    };

    // Handshake steps first.
    let snapshot = match conn_snapshot(&ctx.flows, idx) {
        Some(c) => c,
        None => return,
    };
    if snapshot.events & ESTABLISHED == 0 {
        handshake_from_tap(ctx, idx, buf, segs, now);
        return;
    }

    data_from_tap(ctx, idx, buf, segs, now);
}

fn handshake_from_tap(ctx: &mut Ctx, idx: usize, buf: &[u8],
                      segs: &packet::Pool, now: Instant) {
    let seg = match segs.get(buf, 0) {
        Some(s) if s.len() >= 20 => s,
        _ => return,
    };
    let flags = th_flags(seg);
    if flags & FL_RST != 0 {
        conn_event(ctx, idx, CLOSED);
        return;
    }
    let snapshot = match conn_snapshot(&ctx.flows, idx) {
        Some(c) => c,
        None => return,
    };
    if snapshot.events & SOCK_ACCEPTED != 0 {
        // We sent SYN; the guest answers SYN|ACK.
        if flags & (FL_SYN | FL_ACK) == FL_SYN | FL_ACK {
            let mss_limit =
                if snapshot.v6 { tcp_buf::MSS6 } else { tcp_buf::MSS4 };
            let seq = th_seq(seg);
            {
                let f = match conn_mut(&mut ctx.flows, idx) {
                    Some(f) => f,
                    None => return,
                };
                if let Some(m) = opt_get(seg, OPT_MSS) {
                    f.conn.mss = m.min(mss_limit as u32) as u16;
                }
                f.conn.ws_from_tap = opt_get(seg, OPT_WS)
                    .map(|w| (w as u8).min(MAX_WS))
                    .unwrap_or(0);
                f.conn.wnd_from_tap = th_wnd(seg).max(1);
                f.conn.seq_init_from_tap = seq;
                f.conn.seq_from_tap = seq.wrapping_add(1);
                f.conn.seq_ack_to_tap = seq.wrapping_add(1);
            }
            conn_event(ctx, idx, ESTABLISHED);
            conn_flag(ctx, idx, ACK_FROM_TAP_DUE, false);
            send_flag(ctx, idx, FlagKind::Ack);
            data_from_sock(ctx, idx, now);
        }
        return;
    }
    if snapshot.events & TAP_SYN_ACK_SENT != 0 && flags & FL_ACK != 0 {
        // Guest acknowledged our SYN|ACK.
        if th_ack(seg) == snapshot.seq_init_to_tap.wrapping_add(1) {
            conn_event(ctx, idx, ESTABLISHED);
            conn_flag(ctx, idx, ACK_FROM_TAP_DUE, false);
            data_from_tap(ctx, idx, buf, segs, now);
        } else {
            rst(ctx, idx);
        }
    }
}

fn data_from_tap(ctx: &mut Ctx, idx: usize, buf: &[u8],
                 segs: &packet::Pool, now: Instant) {
    let snapshot = match conn_snapshot(&ctx.flows, idx) {
        Some(c) => c,
        None => return,
    };
    let mut max_ack_seq = snapshot.seq_ack_from_tap;
    let mut ack_seen = false;
    let mut dup_ack = false;
    let mut last_wnd = snapshot.wnd_from_tap;
    let mut fin_at: Option<u32> = None;
    let mut cursor = snapshot.seq_from_tap;

    let mut iov: [libc::iovec; packet::POOL_FRAMES] =
        unsafe { mem::zeroed() };
    let mut iovcnt = 0;
    let mut queued = 0usize;
    let mut keep: [usize; packet::POOL_FRAMES] = [0; packet::POOL_FRAMES];
    let mut nkeep = 0;

    let mut consider = |si: usize,
                        iov: &mut [libc::iovec; packet::POOL_FRAMES],
                        iovcnt: &mut usize, queued: &mut usize,
                        cursor: &mut u32| -> bool {
        // returns true when the segment advanced the cursor
        let seg = match segs.get(buf, si) {
            Some(s) if s.len() >= 20 => s,
            _ => return false,
        };
        let payload = th_payload(seg);
        if payload.is_empty() {
            return false;
        }
        let seq = th_seq(seg);
        let seg_end = seq.wrapping_add(payload.len() as u32);
        if seq_ge(*cursor, seg_end) {
            return false; // entirely before the cursor: drop
        }
        if seq_gt(seq, *cursor) {
            return false; // future: caller keeps it for a second pass
        }
        let off = cursor.wrapping_sub(seq) as usize;
        let useful = &payload[off..];
        if *iovcnt < iov.len() {
            iov[*iovcnt] = libc::iovec {
                iov_base: useful.as_ptr() as *mut libc::c_void,
                iov_len: useful.len(),
            };
            *iovcnt += 1;
            *queued += useful.len();
            *cursor = cursor.wrapping_add(useful.len() as u32);
            return true;
        }
        false
    };

    for si in 0..segs.len() {
        let seg = match segs.get(buf, si) {
            Some(s) if s.len() >= 20 => s,
            _ => continue,
        };
        let flags = th_flags(seg);
        if flags & FL_RST != 0 {
            conn_event(ctx, idx, CLOSED);
            return;
        }
        if flags & FL_SYN != 0 {
            rst(ctx, idx);
            return;
        }
        let payload = th_payload(seg);
        let wnd = th_wnd(seg).max(1);
        if flags & FL_ACK != 0 {
            let ack = th_ack(seg);
            if ack_seen && ack == max_ack_seq && payload.is_empty()
                && wnd == last_wnd && flags & FL_FIN == 0
            {
                dup_ack = true;
            }
            if !ack_seen || seq_gt(ack, max_ack_seq) {
                max_ack_seq = ack;
            }
            ack_seen = true;
        }
        last_wnd = wnd;
        if flags & FL_FIN != 0 {
            fin_at = Some(th_seq(seg)
                          .wrapping_add(payload.len() as u32));
        }
        let advanced = consider(si, &mut iov, &mut iovcnt, &mut queued,
                                &mut cursor);
        if !advanced && !payload.is_empty() {
            let seq = th_seq(seg);
            if seq_gt(seq.wrapping_add(payload.len() as u32), cursor)
                && nkeep < keep.len()
            {
                keep[nkeep] = si;
                nkeep += 1;
            }
        }
    }

    // One revisit pass: segments that were ahead of the cursor may be
    // in order now that a straddling segment advanced it.
    let mut progressed = true;
    while progressed && nkeep > 0 {
        progressed = false;
        let mut i = 0;
        while i < nkeep {
            if consider(keep[i], &mut iov, &mut iovcnt, &mut queued,
                        &mut cursor) {
                keep.copy_within(i + 1..nkeep, i);
                nkeep -= 1;
                progressed = true;
            } else {
                i += 1;
            }
        }
    }

    // Window first; the send below may want it.
    {
        let f = match conn_mut(&mut ctx.flows, idx) {
            Some(f) => f,
            None => return,
        };
        f.conn.wnd_from_tap = last_wnd;
    }

    let mut sent = 0usize;
    if queued > 0 {
        let mut mh: libc::msghdr = unsafe { mem::zeroed() };
        mh.msg_iov = iov.as_mut_ptr();
        mh.msg_iovlen = iovcnt as _;
        let n = unsafe {
            libc::sendmsg(snapshot.sock, &mh,
                          libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL)
        };
        if n < 0 {
            match util::errno() {
                libc::EAGAIN | libc::EINTR => {}
                _ => { rst(ctx, idx); return; }
            }
        } else {
            sent = n as usize;
        }
        let f = match conn_mut(&mut ctx.flows, idx) {
            Some(f) => f,
            None => return,
        };
        f.conn.seq_from_tap = snapshot.seq_from_tap
            .wrapping_add(sent as u32);
    }

    // ACK progress from the guest releases kernel buffer via the
    // deferred consume, resets retransmission state, and may complete a
    // FIN handshake.
    if ack_seen && seq_gt(max_ack_seq, snapshot.seq_ack_from_tap) {
        let newly = max_ack_seq.wrapping_sub(snapshot.seq_ack_from_tap);
        let fin_acked = snapshot.events & TAP_FIN_SENT != 0
            && max_ack_seq == snapshot.seq_to_tap;
        // Data bytes only; our FIN consumed one unit of sequence space.
        sock_consume(snapshot.sock, newly - fin_acked as u32);
        {
            let f = match conn_mut(&mut ctx.flows, idx) {
                Some(f) => f,
                None => return,
            };
            f.conn.seq_ack_from_tap = max_ack_seq;
            f.conn.retrans = 0;
        }
        if max_ack_seq == snapshot.seq_to_tap {
            conn_flag(ctx, idx, ACK_FROM_TAP_DUE, false);
        }
        if fin_acked {
            conn_event(ctx, idx, TAP_FIN_ACKED);
            let ev = conn_snapshot(&ctx.flows, idx)
                .map(|c| c.events).unwrap_or(0);
            if ev & TAP_FIN_RCVD != 0 {
                conn_event(ctx, idx, CLOSED);
                return;
            }
        }
    }

    // Guest signalling loss of our data: retransmit from its ACK, and
    // emit exactly one duplicate-ACK frame pair per approximation
    // window.
    if dup_ack {
        let approx = max_ack_seq as u8;
        let again = {
            let f = match conn_mut(&mut ctx.flows, idx) {
                Some(f) => f,
                None => return,
            };
            if f.conn.seq_dup_ack_approx != approx {
                f.conn.seq_dup_ack_approx = approx;
                f.conn.seq_to_tap = max_ack_seq;
                true
            } else {
                false
            }
        };
        if again {
            send_flag(ctx, idx, FlagKind::DupAck);
            data_from_sock(ctx, idx, now);
        }
    }

    // A stall clears once the window reopens.
    if snapshot.flags & STALLED != 0 {
        let c = match conn_snapshot(&ctx.flows, idx) {
            Some(c) => c,
            None => return,
        };
        let wnd = ((c.wnd_from_tap as u32) << c.ws_from_tap)
            .min(MAX_WINDOW);
        if wnd > c.seq_to_tap.wrapping_sub(c.seq_ack_from_tap) {
            conn_flag(ctx, idx, STALLED, false);
            data_from_sock(ctx, idx, now);
        }
    }

    let c = match conn_snapshot(&ctx.flows, idx) {
        Some(c) => c,
        None => return,
    };
    if let Some(fin_seq) = fin_at {
        if c.seq_from_tap == fin_seq && queued == sent {
            // All data delivered; forward the close to the socket side.
            if c.events & SOCK_FIN_RCVD == 0 {
                conn_flag(ctx, idx, ACTIVE_CLOSE, true);
            }
            {
                let f = match conn_mut(&mut ctx.flows, idx) {
                    Some(f) => f,
                    None => return,
                };
                f.conn.seq_from_tap = f.conn.seq_from_tap.wrapping_add(1);
            }
            conn_event(ctx, idx, TAP_FIN_RCVD);
            unsafe { libc::shutdown(c.sock, libc::SHUT_WR) };
            conn_event(ctx, idx, SOCK_FIN_SENT);
            update_seqack_wnd(ctx, idx, true, None);
            send_flag(ctx, idx, FlagKind::Ack);
            return;
        }
    }
    if queued > sent {
        // Partial delivery into the socket: acknowledge exactly the
        // progress made so the guest resends the tail.
        update_seqack_wnd(ctx, idx, true, None);
        send_flag(ctx, idx, FlagKind::Ack);
    } else if c.seq_ack_to_tap != c.seq_from_tap {
        update_seqack_wnd(ctx, idx, false, None);
        send_flag(ctx, idx, FlagKind::Ack);
    }
}

// SOCKET READINESS

pub fn sock_handler(ctx: &mut Ctx, eref: ERef, events: u32, now: Instant) {
    let idx = eref.data as usize;
    let snapshot = match conn_snapshot(&ctx.flows, idx) {
        Some(c) => c,
        None => return,
    };
    if snapshot.sock != eref.fd || snapshot.events & CLOSED != 0 {
        return;
    }
    if events & libc::EPOLLERR as u32 != 0 {
        rst(ctx, idx);
        return;
    }
    if snapshot.events & CONN_STATE_BITS == TAP_SYN_RCVD
        && snapshot.events & TAP_SYN_ACK_SENT == 0
    {
        if events & libc::EPOLLOUT as u32 != 0 {
            // connect() completed one way or the other.
            let mut err: libc::c_int = 0;
            let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
            unsafe {
                libc::getsockopt(snapshot.sock, libc::SOL_SOCKET,
                                 libc::SO_ERROR,
                                 &mut err as *mut _ as *mut libc::c_void,
                                 &mut len);
            }
            if err == 0 {
                send_flag(ctx, idx, FlagKind::SynAck);
            } else {
                rst(ctx, idx);
            }
        }
        return;
    }
    if snapshot.events & ESTABLISHED == 0 {
        if events & (libc::EPOLLHUP | libc::EPOLLRDHUP) as u32 != 0 {
            rst(ctx, idx);
        }
        return;
    }
    if events & libc::EPOLLIN as u32 != 0 {
        data_from_sock(ctx, idx, now);
    }
    if events & libc::EPOLLRDHUP as u32 != 0
        && snapshot.events & SOCK_FIN_RCVD == 0
    {
        conn_event(ctx, idx, SOCK_FIN_RCVD);
        // Drain whatever remains, then pass the FIN along.
        data_from_sock(ctx, idx, now);
        let c = match conn_snapshot(&ctx.flows, idx) {
            Some(c) => c,
            None => return,
        };
        if c.events & TAP_FIN_SENT == 0
            && c.seq_to_tap == c.seq_ack_from_tap
        {
            send_flag(ctx, idx, FlagKind::FinAck);
            conn_event(ctx, idx, TAP_FIN_SENT);
        }
    }
}

// TIMERS

pub fn timer_handler(ctx: &mut Ctx, eref: ERef, now: Instant) {
    let idx = eref.data as usize;
    let snapshot = match conn_snapshot(&ctx.flows, idx) {
        Some(c) => c,
        None => return,
    };
    if snapshot.timer != eref.fd {
        return;
    }
    // Confirm the deadline: a re-armed timer reads EAGAIN here and the
    // earlier expiry is spurious.
    let mut expirations: u64 = 0;
    let n = unsafe {
        libc::read(eref.fd, &mut expirations as *mut _ as *mut libc::c_void,
                   8)
    };
    if n != 8 {
        return;
    }
    if snapshot.flags & ACK_TO_TAP_DUE != 0 {
        update_seqack_wnd(ctx, idx, true, None);
        send_flag(ctx, idx, FlagKind::Ack);
        conn_flag(ctx, idx, ACK_TO_TAP_DUE, false);
        return;
    }
    if snapshot.flags & ACK_FROM_TAP_DUE != 0 {
        if snapshot.events & ESTABLISHED == 0 {
            debug!("flow {}: handshake timeout", idx);
            rst(ctx, idx);
            return;
        }
        if snapshot.events & SOCK_FIN_SENT != 0
            && snapshot.events & TAP_FIN_ACKED != 0
        {
            rst(ctx, idx);
            return;
        }
        if snapshot.retrans >= MAX_RETRANS {
            debug!("flow {}: retransmission limit", idx);
            rst(ctx, idx);
            return;
        }
        {
            let f = match conn_mut(&mut ctx.flows, idx) {
                Some(f) => f,
                None => return,
            };
            f.conn.retrans += 1;
            f.conn.seq_to_tap = f.conn.seq_ack_from_tap;
        }
        timer_ctl(ctx, idx);
        data_from_sock(ctx, idx, now);
        return;
    }
    if snapshot.events & SOCK_FIN_SENT != 0
        && snapshot.events & TAP_FIN_ACKED != 0
    {
        // FIN-wait ran out; the flow is done.
        conn_event(ctx, idx, CLOSED);
        return;
    }
    // Activity timeout.
    debug!("flow {}: activity timeout in {}", idx,
           state_name(snapshot.events));
    rst(ctx, idx);
}

// DEFERRED RETIREMENT

pub fn flow_defer(ctx: &mut Ctx, idx: usize) -> bool {
    let (closed, sock, timer) = match &ctx.flows.entries[idx] {
        Flow::Tcp(f) => (f.conn.events & CLOSED != 0, f.conn.sock,
                         f.conn.timer),
        _ => return false,
    };
    if !closed {
        return false;
    }
    if sock >= 0 {
        let _ = epollref::epoll_del(ctx.epfd, sock);
        unsafe { libc::close(sock) };
    }
    if timer >= 0 {
        let _ = epollref::epoll_del(ctx.epfd, timer);
        unsafe { libc::close(timer) };
    }
    true
}

// SPLICED CONNECTIONS (loopback shortcut, NS mode)
//
// Only sketched to the extent it intersects the flow table: a peeked
// relay between an accepted loopback socket and its counterpart in the
// other namespace.

fn splice_conn_from_sock(ctx: &mut Ctx, sock_a: i32, lref: &ListenRef) {
    let idx = match ctx.flows.alloc() {
        Some(i) => i,
        None => {
            ctx.cnt.flow_full_drops += 1;
            unsafe { libc::close(sock_a) };
            return;
        }
    };
    let port = ctx.tcp.fwd_in.mapped(lref.port);
    let v6 = lref.v6;
    let sock_b = netns::ns_call(&ctx.netns, &mut || {
        let af = if v6 { libc::AF_INET6 } else { libc::AF_INET };
        let fd = unsafe {
            libc::socket(af, libc::SOCK_STREAM | libc::SOCK_NONBLOCK
                         | libc::SOCK_CLOEXEC, 0)
        };
        if fd < 0 {
            return -util::errno();
        }
        let lo = if v6 {
            InAny::from_v6(std::net::Ipv6Addr::LOCALHOST)
        } else {
            InAny::from_v4(std::net::Ipv4Addr::LOCALHOST)
        };
        let (sa, salen) = lo.to_sockaddr(port);
        let ret = unsafe {
            libc::connect(fd, &sa as *const _ as *const libc::sockaddr,
                          salen)
        };
        if ret == -1 && util::errno() != libc::EINPROGRESS {
            let e = util::errno();
            unsafe { libc::close(fd) };
            return -e;
        }
        fd
    }).unwrap_or(-1);
    let sock_b = if sock_b < 0 { Err(()) } else {
        epollref::fd_guard(sock_b).map_err(|_| ())
    };
    let sock_b = match sock_b {
        Ok(fd) => fd,
        Err(()) => {
            ctx.flows.alloc_cancel(idx);
            unsafe { libc::close(sock_a) };
            return;
        }
    };
    let mut f = SpliceFlow::default();
    f.common.side[0].pif = Pif::Host;
    f.common.side[1].pif = Pif::Splice;
    f.sock = [sock_a, sock_b];
    ctx.flows.entries[idx] = Flow::TcpSplice(f);
    for side in 0..2 {
        let sock = match &ctx.flows.entries[idx] {
            Flow::TcpSplice(f) => f.sock[side],
            _ => return,
        };
        let r = ERef::new(RefType::TcpSplice, sock,
                          flow::sidx(idx, side));
        let _ = epollref::epoll_add(ctx.epfd,
                                    (libc::EPOLLIN | libc::EPOLLRDHUP)
                                    as u32, r);
    }
}

pub fn splice_sock_handler(ctx: &mut Ctx, eref: ERef, events: u32) {
    let idx = flow::sidx_flow(eref.data);
    let side = (eref.data & 1) as usize;
    let (from, to, closing) = match &ctx.flows.entries[idx] {
        Flow::TcpSplice(f) => (f.sock[side], f.sock[1 - side], f.closing),
        _ => return,
    };
    if closing || from != eref.fd {
        return;
    }
    let mut done = events & (libc::EPOLLHUP | libc::EPOLLERR) as u32 != 0;
    loop {
        // Peek, forward what fits, consume exactly that much.
        let n = unsafe {
            libc::recv(from,
                       ctx.tcp.discard.as_mut_ptr() as *mut libc::c_void,
                       65536, libc::MSG_PEEK | libc::MSG_DONTWAIT)
        };
        if n < 0 {
            if util::errno() != libc::EAGAIN
                && util::errno() != libc::EINTR
            {
                done = true;
            }
            break;
        }
        if n == 0 {
            done = true;
            break;
        }
        let written = unsafe {
            libc::send(to, ctx.tcp.discard.as_ptr() as *const libc::c_void,
                       n as usize,
                       libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL)
        };
        if written <= 0 {
            break;
        }
        sock_consume(from, written as u32);
        if written < n {
            break;
        }
    }
    if done || events & libc::EPOLLRDHUP as u32 != 0 {
        unsafe { libc::shutdown(to, libc::SHUT_WR) };
        if let Flow::TcpSplice(f) = &mut ctx.flows.entries[idx] {
            if done {
                f.closing = true;
            }
        }
    }
}

pub fn splice_flow_defer(ctx: &mut Ctx, idx: usize) -> bool {
    let (closing, socks) = match &ctx.flows.entries[idx] {
        Flow::TcpSplice(f) => (f.closing, f.sock),
        _ => return false,
    };
    if !closing {
        return false;
    }
    for s in socks {
        if s >= 0 {
            let _ = epollref::epoll_del(ctx.epfd, s);
            unsafe { libc::close(s) };
        }
    }
    true
}

#[cfg(test)]
mod selftest {
    use super::*;

    #[test]
    fn seq_compare_wraps() {
        assert!(seq_lt(0xffff_fff0, 0x0000_0010));
        assert!(seq_gt(0x0000_0010, 0xffff_fff0));
        assert!(seq_le(5, 5) && seq_ge(5, 5));
        assert!(!seq_lt(5, 5));
        // agreement with plain arithmetic inside +/- 2^31
        for (a, b) in [(0u32, 1u32), (100, 50), (u32::MAX, 0)] {
            assert_eq!(seq_lt(a, b), (a.wrapping_sub(b) as i32) < 0);
        }
    }

    #[test]
    fn event_bits_exclusive() {
        let mut c = TcpConn::default();
        event_set(&mut c, SOCK_ACCEPTED);
        assert_eq!(c.events & CONN_STATE_BITS, SOCK_ACCEPTED);
        event_set(&mut c, ESTABLISHED);
        assert_eq!(c.events & CONN_STATE_BITS, ESTABLISHED);
        event_set(&mut c, SOCK_FIN_RCVD);
        event_set(&mut c, TAP_FIN_SENT);
        // observer bits accumulate, state bit remains
        assert_eq!(c.events & CONN_STATE_BITS, ESTABLISHED);
        assert!(c.events & SOCK_FIN_RCVD != 0);
        assert!(c.events & TAP_FIN_SENT != 0);
    }

    #[test]
    fn state_names() {
        let mut c = TcpConn::default();
        event_set(&mut c, SOCK_ACCEPTED);
        assert_eq!(state_name(c.events), "SYN_RCVD");
        event_set(&mut c, TAP_SYN_RCVD);
        assert_eq!(state_name(c.events), "SYN_SENT");
        event_set(&mut c, ESTABLISHED);
        assert_eq!(state_name(c.events), "ESTABLISHED");
        event_set(&mut c, SOCK_FIN_RCVD);
        assert_eq!(state_name(c.events), "CLOSE_WAIT");
        event_set(&mut c, CLOSED);
        assert_eq!(state_name(c.events), "CLOSED");
    }

    #[test]
    fn option_parsing() {
        // 20-byte header + MSS(1460) + NOP + WS(7)
        let mut seg = vec![0u8; 32];
        seg[12] = 8 << 4; // doff 8 words
        seg[20] = OPT_MSS;
        seg[21] = 4;
        seg[22..24].copy_from_slice(&1460u16.to_be_bytes());
        seg[24] = 1;
        seg[25] = OPT_WS;
        seg[26] = 3;
        seg[27] = 7;
        assert_eq!(opt_get(&seg, OPT_MSS), Some(1460));
        assert_eq!(opt_get(&seg, OPT_WS), Some(7));
        assert_eq!(opt_get(&seg, 8), None);
        // no options
        let mut plain = vec![0u8; 20];
        plain[12] = 5 << 4;
        assert_eq!(opt_get(&plain, OPT_MSS), None);
        // truncated option list must not panic
        let mut bad = vec![0u8; 22];
        bad[12] = 6 << 4;
        bad[20] = OPT_MSS;
        bad[21] = 200;
        assert_eq!(opt_get(&bad, OPT_MSS), None);
    }

    #[test]
    fn timer_deadlines() {
        assert_eq!(timer_duration(0, ACK_TO_TAP_DUE), ACK_INTERVAL);
        assert_eq!(timer_duration(0, ACK_FROM_TAP_DUE), SYN_TIMEOUT);
        assert_eq!(timer_duration(ESTABLISHED, ACK_FROM_TAP_DUE),
                   ACK_TIMEOUT);
        assert_eq!(timer_duration(SOCK_FIN_SENT | TAP_FIN_ACKED, 0),
                   FIN_TIMEOUT);
        assert_eq!(timer_duration(ESTABLISHED, 0), ACT_TIMEOUT);
    }

    #[test]
    fn epoll_masks() {
        let stalled = conn_epoll_events(ESTABLISHED, STALLED);
        assert_eq!(stalled,
                   (libc::EPOLLIN | libc::EPOLLOUT | libc::EPOLLRDHUP
                    | libc::EPOLLET) as u32);
        let fin_sent = conn_epoll_events(ESTABLISHED | TAP_FIN_SENT, 0);
        assert_eq!(fin_sent, libc::EPOLLET as u32);
        let normal = conn_epoll_events(ESTABLISHED, 0);
        assert_eq!(normal, (libc::EPOLLIN | libc::EPOLLRDHUP) as u32);
    }

    #[test]
    fn tcp_info_layout() {
        assert_eq!(mem::size_of::<TcpInfo>(), TI_SND_WND_END);
        let ti = TcpInfo::default();
        let base = &ti as *const _ as usize;
        assert_eq!(&ti.bytes_acked as *const _ as usize - base + 8,
                   TI_BYTES_ACKED_END);
        assert_eq!(&ti.min_rtt as *const _ as usize - base + 4,
                   TI_MIN_RTT_END);
        assert_eq!(&ti.snd_wnd as *const _ as usize - base + 4,
                   TI_SND_WND_END);
    }

    #[test]
    fn low_rtt_table() {
        let mut t = TcpCtx::new();
        let a = InAny::from_v4(std::net::Ipv4Addr::new(127, 0, 0, 1));
        assert!(!t.low_rtt_has(&a));
        t.low_rtt_note(&a, 5);
        assert!(t.low_rtt_has(&a));
        // above threshold: not recorded
        let b = InAny::from_v4(std::net::Ipv4Addr::new(192, 0, 2, 1));
        t.low_rtt_note(&b, 500);
        assert!(!t.low_rtt_has(&b));
        // round-robin replacement keeps the table at 8 entries
        for i in 0..10u8 {
            let x = InAny::from_v4(std::net::Ipv4Addr::new(10, 0, 0, i));
            t.low_rtt_note(&x, 1);
        }
        assert!(t.low_rtt.iter().filter(|e| !e.is_unspecified()).count()
                <= LOW_RTT_TABLE_SIZE);
    }

    #[test]
    fn syn_option_encoding() {
        let mut buf = [0u8; 8];
        let len = syn_opts(1460, 7, &mut buf);
        assert_eq!(len, 8);
        let mut seg = vec![0u8; 28];
        seg[12] = 7 << 4;
        seg[20..28].copy_from_slice(&buf);
        assert_eq!(opt_get(&seg, OPT_MSS), Some(1460));
        assert_eq!(opt_get(&seg, OPT_WS), Some(7));
    }
}
