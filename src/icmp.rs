use super::checksum;
use super::ctx::Ctx;
use super::epollref::{self, ERef, RefType};
use super::ethernet::{self, Ethernet};
use super::flow::{self, Flow, FlowCommon, FlowSide, Pif, SOCKSIDE,
                  TAPSIDE};
use super::header;
use super::inany::InAny;
use super::ipv4::{self, IPv4};
use super::ipv6::{self, IPv6};
use super::nat;
use super::tap;

use std::time::{Duration, Instant};

use tracing::{debug, trace};

// ICMP ENGINE
//
// Echo only. Each (remote address, echo id) pair the guest pings gets
// one Linux dgram "ping" socket; the kernel rewrites the id on the
// wire, so replies read back from the socket get the guest's original
// id restored before the frame goes to the tap. Flows live in the flow
// table keyed by (remote, id, id) and expire after a quiet minute.
//
//   PingFlow - per-exchange state
//   tap_handler - echo requests from the guest
//   sock_handler - replies from the ping socket
//   flow_defer - periodic expiry

pub const ECHO_TIMEOUT: Duration = Duration::from_secs(60);

const ECHO_REQUEST_V4: u8 = 8;
const ECHO_REPLY_V4: u8 = 0;
const ECHO_REQUEST_V6: u8 = 128;
const ECHO_REPLY_V6: u8 = 129;

pub struct PingFlow {
    pub common: FlowCommon,
    pub sock: i32,
    pub id: u16,
    pub seq_last_sent: u16,
    pub ts: Option<Instant>,
}

impl Default for PingFlow {
    fn default() -> PingFlow {
        PingFlow {
            common: FlowCommon::default(),
            sock: -1,
            id: 0,
            seq_last_sent: 0,
            ts: None,
        }
    }
}

const SCRATCH_BYTES: usize = tap::VNET_LEN + 14 + 40 + 65536;

pub struct IcmpCtx {
    scratch: Box<[u8]>,
}

impl IcmpCtx {
    pub fn new() -> IcmpCtx {
        IcmpCtx { scratch: vec![0u8; SCRATCH_BYTES].into_boxed_slice() }
    }
}

fn ping_sock(v6: bool) -> Option<i32> {
    let (af, proto) = if v6 {
        (libc::AF_INET6, libc::IPPROTO_ICMPV6)
    } else {
        (libc::AF_INET, libc::IPPROTO_ICMP)
    };
    let fd = unsafe {
        libc::socket(af, libc::SOCK_DGRAM | libc::SOCK_NONBLOCK
                     | libc::SOCK_CLOEXEC, proto)
    };
    epollref::fd_guard(fd).ok()
}

pub fn tap_handler(ctx: &mut Ctx, v6: bool, saddr: InAny, daddr: InAny,
                   l4: &[u8], now: Instant) {
    if l4.len() < 8 {
        return;
    }
    let want = if v6 { ECHO_REQUEST_V6 } else { ECHO_REQUEST_V4 };
    if l4[0] != want || l4[1] != 0 {
        // Everything except echo requests is dropped; the responders
        // for errors live in the kernels on either side.
        ctx.cnt.proto_drops += 1;
        return;
    }
    let id = u16::from_be_bytes([l4[4], l4[5]]);
    let seq = u16::from_be_bytes([l4[6], l4[7]]);
    let secret = ctx.hash_secret;
    let idx = match ctx.flows.hash_lookup(&secret, &daddr, id, id) {
        Some(i) => i,
        None => {
            let idx = match ctx.flows.alloc() {
                Some(i) => i,
                None => {
                    ctx.cnt.flow_full_drops += 1;
                    return;
                }
            };
            let sock = match ping_sock(v6) {
                Some(s) => s,
                None => {
                    ctx.flows.alloc_cancel(idx);
                    debug!("cannot open ping socket \
                            (net.ipv4.ping_group_range?)");
                    return;
                }
            };
            let dst = nat::tap_dst(ctx, &daddr, 0);
            let mut f = PingFlow::default();
            f.common.side[TAPSIDE] = FlowSide {
                pif: Pif::Tap,
                eaddr: saddr,
                eport: id,
                faddr: daddr,
                fport: id,
            };
            f.common.side[SOCKSIDE] = FlowSide {
                pif: Pif::Host,
                eaddr: dst,
                eport: id,
                faddr: InAny::default(),
                fport: 0,
            };
            f.sock = sock;
            f.id = id;
            let r = ERef::new(RefType::Ping, sock, idx as u32);
            if epollref::epoll_add(ctx.epfd, libc::EPOLLIN as u32, r)
                .is_err()
            {
                unsafe { libc::close(sock) };
                ctx.flows.alloc_cancel(idx);
                return;
            }
            ctx.flows.entries[idx] = if v6 {
                Flow::Ping6(f)
            } else {
                Flow::Ping4(f)
            };
            ctx.flows.hash_insert(&secret, flow::sidx(idx, TAPSIDE));
            ctx.cnt.icmp_flows += 1;
            trace!("new ping flow {} id {} to {}", idx, id, daddr);
            idx
        }
    };
    let (sock, dst) = match &mut ctx.flows.entries[idx] {
        Flow::Ping4(f) | Flow::Ping6(f) => {
            f.seq_last_sent = seq;
            f.ts = Some(now);
            (f.sock, f.common.side[SOCKSIDE].eaddr)
        }
        _ => return,
    };
    let (sa, salen) = dst.to_sockaddr(0);
    // The kernel rewrites id and checksum on dgram ping sockets.
    unsafe {
        libc::sendto(sock, l4.as_ptr() as *const libc::c_void, l4.len(),
                     libc::MSG_DONTWAIT,
                     &sa as *const _ as *const libc::sockaddr, salen);
    }
}

pub fn sock_handler(ctx: &mut Ctx, eref: ERef, now: Instant) {
    let idx = eref.data as usize;
    let (v6, sock, id, guest, shown_src) = match &ctx.flows.entries[idx] {
        Flow::Ping4(f) => (false, f.sock, f.id,
                           f.common.side[TAPSIDE].eaddr,
                           f.common.side[TAPSIDE].faddr),
        Flow::Ping6(f) => (true, f.sock, f.id,
                           f.common.side[TAPSIDE].eaddr,
                           f.common.side[TAPSIDE].faddr),
        _ => return,
    };
    if sock != eref.fd {
        return;
    }
    loop {
        let eth_hlen = 14;
        let ip_hlen = if v6 { 40 } else { 20 };
        let icmp_off = tap::VNET_LEN + eth_hlen + ip_hlen;
        // The reply has to fit one L2 frame behind its headers.
        let cap = tap::MAX_L2_FRAME - eth_hlen - ip_hlen;
        let n = {
            let scratch = &mut ctx.icmp.scratch;
            unsafe {
                libc::recv(sock,
                           scratch[icmp_off..].as_mut_ptr()
                               as *mut libc::c_void,
                           cap, libc::MSG_DONTWAIT)
            }
        };
        if n < 8 {
            break;
        }
        let n = n as usize;
        {
            let our_mac = ctx.our_mac;
            let guest_mac = ctx.guest_mac;
            let scratch = &mut ctx.icmp.scratch;
            let msg = &mut scratch[icmp_off..icmp_off + n];
            let expect = if v6 { ECHO_REPLY_V6 } else { ECHO_REPLY_V4 };
            if msg[0] != expect {
                continue;
            }
            // Restore the id the guest chose; the kernel stamped its
            // own on the way out. The sequence number passes through.
            msg[4..6].copy_from_slice(&id.to_be_bytes());
            if v6 {
                let pseudo = ipv6::pseudo_checksum_parts(
                    shown_src.v6(), guest.v6(), ipv6::NEXT_ICMPV6,
                    n as u32);
                msg[2..4].copy_from_slice(&[0, 0]);
                let sum = checksum::ipsum(msg, n, !pseudo);
                msg[2..4].copy_from_slice(&sum.to_be_bytes());
            } else {
                msg[2..4].copy_from_slice(&[0, 0]);
                let sum = checksum::ipsum(msg, n, 0);
                msg[2..4].copy_from_slice(&sum.to_be_bytes());
            }
            let mut eth = header::from_mem::<Ethernet>(
                &mut scratch[tap::VNET_LEN..]);
            eth.set_dst(&guest_mac);
            eth.set_src(&our_mac);
            eth.set_ethertype(if v6 { ethernet::TYPE_IPV6 }
                              else { ethernet::TYPE_IPV4 });
            if v6 {
                let mut ip = header::from_mem::<IPv6>(
                    &mut scratch[tap::VNET_LEN + eth_hlen..]);
                ip.init(ipv6::NEXT_ICMPV6);
                ip.set_payload_length(n as u16);
                ip.set_src(shown_src.v6());
                ip.set_dst(guest.v6());
            } else {
                let mut ip = header::from_mem::<IPv4>(
                    &mut scratch[tap::VNET_LEN + eth_hlen..]);
                ip.init(ipv4::PROTOCOL_ICMP);
                ip.set_total_length((ip_hlen + n) as u16);
                ip.set_src(shown_src.v4()
                           .unwrap_or(std::net::Ipv4Addr::UNSPECIFIED));
                ip.set_dst(guest.v4()
                           .unwrap_or(std::net::Ipv4Addr::UNSPECIFIED));
                ip.checksum_compute();
            }
            let total = icmp_off + n;
            tap::frame_prefix(&mut scratch[..total]);
        }
        let total = icmp_off + n;
        {
            let Ctx { tap: tap_state, mode, icmp, .. } = ctx;
            let frame = &icmp.scratch[..total];
            tap::send_one(tap_state, *mode, frame);
        }
        if let Flow::Ping4(f) | Flow::Ping6(f) =
            &mut ctx.flows.entries[idx]
        {
            f.ts = Some(now);
        }
    }
}

// Periodic expiry: a minute of silence retires the flow.
pub fn flow_defer(ctx: &mut Ctx, idx: usize, now: Instant,
                  run_timers: bool) -> bool {
    if !run_timers {
        return false;
    }
    let (sock, stale) = match &ctx.flows.entries[idx] {
        Flow::Ping4(f) | Flow::Ping6(f) => {
            let stale = match f.ts {
                Some(ts) => now.duration_since(ts) > ECHO_TIMEOUT,
                None => true,
            };
            (f.sock, stale)
        }
        _ => return false,
    };
    if !stale {
        return false;
    }
    let secret = ctx.hash_secret;
    ctx.flows.hash_remove(&secret, flow::sidx(idx, TAPSIDE));
    if sock >= 0 {
        let _ = epollref::epoll_del(ctx.epfd, sock);
        unsafe { libc::close(sock) };
    }
    true
}

#[cfg(test)]
mod selftest {
    use super::*;

    #[test]
    fn echo_classification() {
        // Only echo requests with code 0 proceed; this is implicit in
        // tap_handler, checked here through the byte predicates.
        let req = [ECHO_REQUEST_V4, 0, 0, 0, 0x12, 0x34, 0, 1];
        assert_eq!(req[0], 8);
        assert_eq!(u16::from_be_bytes([req[4], req[5]]), 0x1234);
        let reply = [ECHO_REPLY_V4, 0, 0, 0, 0, 0, 0, 0];
        assert_ne!(reply[0], ECHO_REQUEST_V4);
    }

    #[test]
    fn v4_reply_checksum_roundtrip() {
        let mut msg = vec![ECHO_REPLY_V4, 0, 0, 0, 0xab, 0xcd, 0, 7,
                           1, 2, 3, 4, 5];
        msg[2..4].copy_from_slice(&[0, 0]);
        let sum = checksum::ipsum(&msg, msg.len(), 0);
        msg[2..4].copy_from_slice(&sum.to_be_bytes());
        // Verifying with the embedded checksum yields zero.
        assert_eq!(checksum::ipsum(&msg, msg.len(), 0), 0);
    }

    #[test]
    fn ping_flow_defaults() {
        let f = PingFlow::default();
        assert_eq!(f.sock, -1);
        assert!(f.ts.is_none());
    }
}
