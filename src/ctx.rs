use super::ethernet::{self, MacAddress};
use super::flow::FlowTable;
use super::fwd;
use super::icmp;
use super::netns;
use super::tap;
use super::tcp;
use super::udp;
use super::util;

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::{Duration, Instant};

// EXECUTION CONTEXT
//
// Process-wide state, created once at startup and passed by mutable
// reference into every handler. There is exactly one thread; the
// context is the whole data model.
//
//   Ctx - the context
//   Ip4Ctx, Ip6Ctx - per-family address configuration
//   Counters - drop and activity counters for the periodic report
//   Error, Result - error kinds surfaced by the core
//   sock_set_bufs(fd, low_limit) - force large socket buffers
//   probe_buf_limits() -> bool - detect constrained kernel defaults

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("file descriptor above reference limit")]
    FdExhausted,
    #[error("flow table full")]
    FlowTableFull,
    #[error("peer reset")]
    PeerReset,
    #[error("short send: {sent} of {len} bytes")]
    SendPartial { sent: usize, len: usize },
    #[error("invalid packet: {0}")]
    ProtocolInvalid(&'static str),
    #[error("network namespace is gone")]
    NamespaceGone,
    #[error("tap channel disconnected")]
    TapDisconnected,
    #[error(transparent)]
    Sys(#[from] io::Error),
    #[error("configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Mode {
    Stream,
    Ns,
}

#[derive(Default)]
pub struct Counters {
    pub frag_drops: u64,
    pub proto_drops: u64,
    pub flow_full_drops: u64,
    pub arp_drops: u64,
    pub tap_disconnects: u64,
    pub tcp_conns: u64,
    pub udp_binds: u64,
    pub icmp_flows: u64,
}

pub struct Ip4Ctx {
    pub addr: Option<Ipv4Addr>, // guest address; None disables IPv4
    pub addr_seen: Ipv4Addr,    // last source seen from the guest
    pub gw: Ipv4Addr,
    pub map_gw: bool,
    pub dns: Vec<Ipv4Addr>,
    pub dns_match: Option<Ipv4Addr>,
    pub dns_host: Option<Ipv4Addr>,
    pub addr_out: Option<Ipv4Addr>,
}

impl Default for Ip4Ctx {
    fn default() -> Ip4Ctx {
        Ip4Ctx {
            addr: None,
            addr_seen: Ipv4Addr::UNSPECIFIED,
            gw: Ipv4Addr::UNSPECIFIED,
            map_gw: true,
            dns: Vec::new(),
            dns_match: None,
            dns_host: None,
            addr_out: None,
        }
    }
}

pub struct Ip6Ctx {
    pub addr: Option<Ipv6Addr>,
    pub addr_seen: Ipv6Addr,
    pub addr_ll: Ipv6Addr,      // our link-local on the tap link
    pub addr_ll_seen: Ipv6Addr, // guest's link-local, learned
    pub gw: Ipv6Addr,
    pub map_gw: bool,
    pub dns: Vec<Ipv6Addr>,
    pub dns_match: Option<Ipv6Addr>,
    pub dns_host: Option<Ipv6Addr>,
    pub addr_out: Option<Ipv6Addr>,
}

impl Default for Ip6Ctx {
    fn default() -> Ip6Ctx {
        Ip6Ctx {
            addr: None,
            addr_seen: Ipv6Addr::UNSPECIFIED,
            addr_ll: Ipv6Addr::UNSPECIFIED,
            addr_ll_seen: Ipv6Addr::UNSPECIFIED,
            gw: Ipv6Addr::UNSPECIFIED,
            map_gw: true,
            dns: Vec::new(),
            dns_match: None,
            dns_host: None,
            addr_out: None,
        }
    }
}

pub struct Ctx {
    pub mode: Mode,
    pub one_off: bool,
    pub epfd: i32,
    pub start: Instant,
    pub tap: tap::Tap,
    pub our_mac: MacAddress,
    pub guest_mac: MacAddress,
    pub mtu: u16,
    pub hash_secret: [u8; 16],
    pub ip4: Ip4Ctx,
    pub ip6: Ip6Ctx,
    pub ifname_out: Option<String>,
    pub low_buf_limit: bool,
    pub flows: FlowTable,
    pub tcp: tcp::TcpCtx,
    pub udp: udp::UdpCtx,
    pub icmp: icmp::IcmpCtx,
    pub fwd: fwd::FwdCtx,
    pub netns: netns::NsCtx,
    pub cnt: Counters,
    pub frag_rl: util::Ratelimit,
}

// Suppression window for IPv4 fragment diagnostics.
pub const FRAGMENT_MSG_RATE: Duration = Duration::from_secs(10);

impl Ctx {
    pub fn new(mode: Mode, ip4: Ip4Ctx, ip6: Ip6Ctx, mtu: u16) -> Ctx {
        let mut hash_secret = [0u8; 16];
        util::random_bytes(&mut hash_secret, 16);
        Ctx {
            mode,
            one_off: false,
            epfd: -1,
            start: Instant::now(),
            tap: tap::Tap::new(),
            our_mac: ethernet::MAC_OUR_DEFAULT,
            guest_mac: ethernet::MAC_ZERO,
            mtu,
            hash_secret,
            ip4,
            ip6,
            ifname_out: None,
            low_buf_limit: probe_buf_limits(),
            flows: FlowTable::new(),
            tcp: tcp::TcpCtx::new(),
            udp: udp::UdpCtx::new(),
            icmp: icmp::IcmpCtx::new(),
            fwd: fwd::FwdCtx::new(),
            netns: netns::NsCtx::new(),
            cnt: Counters::default(),
            frag_rl: util::Ratelimit::new(FRAGMENT_MSG_RATE),
        }
    }

    // Guest-facing L2 buffers must be re-cooked when the guest MAC is
    // learned or changes.
    pub fn update_l2_bufs(&mut self) {
        let our_mac = self.our_mac;
        let guest_mac = self.guest_mac;
        self.tcp.update_l2(&our_mac, &guest_mac);
        self.udp.update_l2(&our_mac, &guest_mac);
    }
}

// Ask for generous socket buffers unless the startup probe found the
// kernel limits low, in which case forcing them only wastes syscalls.
pub fn sock_set_bufs(fd: i32, low_limit: bool) {
    if low_limit {
        return;
    }
    let v: libc::c_int = i32::MAX / 2;
    unsafe {
        libc::setsockopt(fd, libc::SOL_SOCKET, libc::SO_RCVBUF,
                         &v as *const _ as *const libc::c_void,
                         std::mem::size_of::<libc::c_int>() as libc::socklen_t);
        libc::setsockopt(fd, libc::SOL_SOCKET, libc::SO_SNDBUF,
                         &v as *const _ as *const libc::c_void,
                         std::mem::size_of::<libc::c_int>() as libc::socklen_t);
    }
}

const RMEM_MAX: &str = "/proc/sys/net/core/rmem_max";
const WMEM_MAX: &str = "/proc/sys/net/core/wmem_max";
const BUF_LIMIT_LOW: u64 = 4 * 1024 * 1024;

pub fn probe_buf_limits() -> bool {
    let read = |path| -> Option<u64> {
        std::fs::read_to_string(path).ok()?.trim().parse().ok()
    };
    match (read(RMEM_MAX), read(WMEM_MAX)) {
        (Some(r), Some(w)) => r < BUF_LIMIT_LOW || w < BUF_LIMIT_LOW,
        _ => true,
    }
}

#[cfg(test)]
mod selftest {
    use super::*;

    #[test]
    fn context_defaults() {
        let ctx = Ctx::new(Mode::Stream, Ip4Ctx::default(),
                           Ip6Ctx::default(), 1500);
        assert_eq!(ctx.mode, Mode::Stream);
        assert_eq!(ctx.guest_mac, ethernet::MAC_ZERO);
        assert!(ctx.ip4.addr.is_none());
        assert_ne!(ctx.hash_secret, [0u8; 16]);
    }

    #[test]
    fn error_display() {
        let e = Error::SendPartial { sent: 3, len: 10 };
        assert_eq!(format!("{}", e), "short send: 3 of 10 bytes");
        assert_eq!(format!("{}", Error::FlowTableFull), "flow table full");
    }
}
