use super::checksum;
use super::ctx::{self, Ctx, Mode};
use super::epollref::{self, ERef, RefType, UdpRef};
use super::ethernet::{self, Ethernet, MacAddress};
use super::flow::Pif;
use super::header;
use super::inany::InAny;
use super::ipv4::{self, IPv4};
use super::ipv6::{self, IPv6};
use super::nat;
use super::netns;
use super::packet;
use super::tap;
use super::util;

use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::{Duration, Instant};

use tracing::trace;

// UDP ENGINE
//
// No connections, only bindings. The first datagram the guest sends
// from a given source port opens a socket bound to that port, so
// replies arrive there and can be relayed back; bindings expire after
// 180 seconds of inactivity, tracked through per-category activity
// bitmaps scanned on the periodic timer.
//
// In NS mode, when both endpoints of an exchange are loopback across
// the two namespaces, the splice path short-circuits L2 entirely:
// sockets bound on loopback in each namespace relay datagrams with
// recvmmsg/sendmmsg and no frame is ever built.
//
//   UdpCtx - port tables, activity maps, frame pools
//   tap_handler - batched datagrams from the guest
//   sock_handler - socket readiness: tap emission or splice relay
//   bound_sock_init / ns_bound_sock_init - forwarded-port bindings
//   timer_handler - activity expiry scan

pub const UDP_MAX_FRAMES: usize = 32;
pub const UDP_TIMEOUT: Duration = Duration::from_secs(180);

pub const PORT_LOCAL: u8 = 1 << 0;
pub const PORT_LOOPBACK: u8 = 1 << 1;
pub const PORT_GUA: u8 = 1 << 2;
pub const PORT_DNS_FWD: u8 = 1 << 3;
pub const PORT_ORIG: u8 = 1 << 4;

#[derive(Clone, Copy)]
struct PortState {
    sock: i32,
    flags: u8,
    ts: Option<Instant>,
}

impl Default for PortState {
    fn default() -> PortState {
        PortState { sock: -1, flags: 0, ts: None }
    }
}

// Loopback socket in one of the two namespaces. Entries created at
// rebind time (ts None) persist; reply sockets created per exchange
// carry a timestamp and expire.
#[derive(Clone, Copy)]
struct SpliceState {
    sock: i32,
    orig_port: u16,
    ts: Option<Instant>,
}

impl Default for SpliceState {
    fn default() -> SpliceState {
        SpliceState { sock: -1, orig_port: 0, ts: None }
    }
}

pub struct UdpCtx {
    pub fwd_in: super::fwd::FwdPorts,
    pub fwd_out: super::fwd::FwdPorts,
    tap_map: [Vec<PortState>; 2],
    splice_init: [Vec<SpliceState>; 2],
    splice_ns: [Vec<SpliceState>; 2],
    act_tap: [super::bitmap::PortBitmap; 2],
    act_init: [super::bitmap::PortBitmap; 2],
    act_ns: [super::bitmap::PortBitmap; 2],
    bufs4: UdpFramePool,
    bufs6: UdpFramePool,
}

impl UdpCtx {
    pub fn new() -> UdpCtx {
        UdpCtx {
            fwd_in: super::fwd::FwdPorts::new(),
            fwd_out: super::fwd::FwdPorts::new(),
            tap_map: [vec![PortState::default(); 65536],
                      vec![PortState::default(); 65536]],
            splice_init: [vec![SpliceState::default(); 65536],
                          vec![SpliceState::default(); 65536]],
            splice_ns: [vec![SpliceState::default(); 65536],
                        vec![SpliceState::default(); 65536]],
            act_tap: [super::bitmap::PortBitmap::new(),
                      super::bitmap::PortBitmap::new()],
            act_init: [super::bitmap::PortBitmap::new(),
                       super::bitmap::PortBitmap::new()],
            act_ns: [super::bitmap::PortBitmap::new(),
                     super::bitmap::PortBitmap::new()],
            bufs4: UdpFramePool::new(false),
            bufs6: UdpFramePool::new(true),
        }
    }

    pub fn update_l2(&mut self, our_mac: &MacAddress,
                     guest_mac: &MacAddress) {
        self.bufs4.update_l2(our_mac, guest_mac);
        self.bufs6.update_l2(our_mac, guest_mac);
    }
}

// PRE-COOKED FRAMES, SOCKET -> TAP

const VNET_OFF: usize = 0;
const ETH_OFF: usize = tap::VNET_LEN;
const IP_OFF: usize = ETH_OFF + 14;
const UDP_STRIDE: usize = tap::VNET_LEN + 14 + 40 + 8 + 65536 + 8;

struct UdpFramePool {
    v6: bool,
    bufs: Box<[u8]>,
    lens: [u32; UDP_MAX_FRAMES],
}

impl UdpFramePool {
    fn new(v6: bool) -> UdpFramePool {
        let mut pool = UdpFramePool {
            v6,
            bufs: vec![0u8; UDP_STRIDE * UDP_MAX_FRAMES].into_boxed_slice(),
            lens: [0; UDP_MAX_FRAMES],
        };
        pool.init_l2(&ethernet::MAC_OUR_DEFAULT, &ethernet::MAC_ZERO);
        pool
    }

    fn init_l2(&mut self, our_mac: &MacAddress, guest_mac: &MacAddress) {
        let v6 = self.v6;
        for i in 0..UDP_MAX_FRAMES {
            let frame = &mut self.bufs[i * UDP_STRIDE..(i + 1) * UDP_STRIDE];
            let mut eth = header::from_mem::<Ethernet>(&mut frame[ETH_OFF..]);
            eth.set_dst(guest_mac);
            eth.set_src(our_mac);
            eth.set_ethertype(if v6 { ethernet::TYPE_IPV6 }
                              else { ethernet::TYPE_IPV4 });
            if v6 {
                let mut ip = header::from_mem::<IPv6>(&mut frame[IP_OFF..]);
                ip.init(ipv6::NEXT_UDP);
            } else {
                let mut ip = header::from_mem::<IPv4>(&mut frame[IP_OFF..]);
                ip.init(ipv4::PROTOCOL_UDP);
            }
        }
    }

    fn update_l2(&mut self, our_mac: &MacAddress, guest_mac: &MacAddress) {
        for i in 0..UDP_MAX_FRAMES {
            let frame = &mut self.bufs[i * UDP_STRIDE..(i + 1) * UDP_STRIDE];
            let mut eth = header::from_mem::<Ethernet>(&mut frame[ETH_OFF..]);
            eth.set_dst(guest_mac);
            eth.set_src(our_mac);
        }
    }

    fn ip_hlen(&self) -> usize {
        if self.v6 { 40 } else { 20 }
    }

    fn payload_off(&self) -> usize {
        IP_OFF + self.ip_hlen() + 8
    }

    fn payload_ptr(&mut self, i: usize) -> *mut u8 {
        let off = self.payload_off();
        self.bufs[i * UDP_STRIDE + off..].as_mut_ptr()
    }

    // Ethernet, IP and UDP headers must still fit one L2 frame, so
    // oversized datagrams are truncated at receive time.
    fn payload_cap(&self) -> usize {
        tap::MAX_L2_FRAME - 14 - self.ip_hlen() - 8
    }

    fn commit(&mut self, i: usize, saddr: &InAny, daddr: &InAny,
              sport: u16, dport: u16, payload_len: usize) {
        let v6 = self.v6;
        let udp_off = IP_OFF + self.ip_hlen();
        let l4_len = 8 + payload_len;
        let frame_len = udp_off + l4_len - tap::VNET_LEN;
        let pseudo = if v6 {
            let s = saddr.v6();
            let d = daddr.v6();
            let frame = &mut self.bufs[i * UDP_STRIDE..(i + 1) * UDP_STRIDE];
            let mut ip = header::from_mem::<IPv6>(&mut frame[IP_OFF..]);
            ip.set_payload_length(l4_len as u16);
            ip.set_src(s);
            ip.set_dst(d);
            ipv6::pseudo_checksum_parts(s, d, ipv6::NEXT_UDP, l4_len as u32)
        } else {
            let s = saddr.v4().unwrap_or(Ipv4Addr::UNSPECIFIED);
            let d = daddr.v4().unwrap_or(Ipv4Addr::UNSPECIFIED);
            let frame = &mut self.bufs[i * UDP_STRIDE..(i + 1) * UDP_STRIDE];
            let mut ip = header::from_mem::<IPv4>(&mut frame[IP_OFF..]);
            ip.set_total_length((20 + l4_len) as u16);
            ip.set_src(s);
            ip.set_dst(d);
            ip.checksum_compute();
            ipv4::pseudo_checksum_parts(s, d, ipv4::PROTOCOL_UDP,
                                        l4_len as u16)
        };
        {
            let frame = &mut self.bufs[i * UDP_STRIDE..(i + 1) * UDP_STRIDE];
            let uh = &mut frame[udp_off..];
            uh[0..2].copy_from_slice(&sport.to_be_bytes());
            uh[2..4].copy_from_slice(&dport.to_be_bytes());
            uh[4..6].copy_from_slice(&(l4_len as u16).to_be_bytes());
            uh[6..8].copy_from_slice(&[0, 0]);
        }
        let sum = {
            let frame = &self.bufs[i * UDP_STRIDE..(i + 1) * UDP_STRIDE];
            let s = checksum::ipsum(&frame[udp_off..udp_off + l4_len],
                                    l4_len, !pseudo);
            if s == 0 { 0xffff } else { s }
        };
        let frame = &mut self.bufs[i * UDP_STRIDE..(i + 1) * UDP_STRIDE];
        frame[udp_off + 6..udp_off + 8].copy_from_slice(&sum.to_be_bytes());
        tap::frame_prefix(&mut frame[VNET_OFF..tap::VNET_LEN + frame_len]);
        self.lens[i] = (tap::VNET_LEN + frame_len) as u32;
    }

    fn frame(&self, i: usize) -> &[u8] {
        &self.bufs[i * UDP_STRIDE..i * UDP_STRIDE + self.lens[i] as usize]
    }
}

// SOCKET CREATION

fn dgram_sock(v6: bool) -> io::Result<i32> {
    let af = if v6 { libc::AF_INET6 } else { libc::AF_INET };
    let fd = unsafe {
        libc::socket(af, libc::SOCK_DGRAM | libc::SOCK_NONBLOCK
                     | libc::SOCK_CLOEXEC, 0)
    };
    epollref::fd_guard(fd)
}

fn bind_port(fd: i32, v6: bool, addr: Option<InAny>, port: u16) -> bool {
    let a = addr.unwrap_or(if v6 {
        InAny::from_v6(Ipv6Addr::UNSPECIFIED)
    } else {
        InAny::from_v4(Ipv4Addr::UNSPECIFIED)
    });
    let (sa, salen) = a.to_sockaddr(port);
    let ret = unsafe {
        libc::bind(fd, &sa as *const _ as *const libc::sockaddr, salen)
    };
    ret == 0
}

// The socket carrying traffic for a guest source port: reused when it
// exists, bound fresh otherwise.
fn tap_sock(ctx: &mut Ctx, v6: bool, sport: u16, dst: &InAny,
            now: Instant) -> Option<i32> {
    let v = v6 as usize;
    let e = ctx.udp.tap_map[v][sport as usize];
    if e.sock >= 0 {
        ctx.udp.tap_map[v][sport as usize].ts = Some(now);
        return Some(e.sock);
    }
    let fd = dgram_sock(v6).ok()?;
    if v6 && dst.is_linklocal() {
        let mut sa6: libc::sockaddr_in6 = unsafe { mem::zeroed() };
        sa6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
        sa6.sin6_addr.s6_addr = ctx.ip6.addr_ll.octets();
        sa6.sin6_port = util::htons(sport);
        if let Some(ifname) = &ctx.ifname_out {
            sa6.sin6_scope_id = unsafe {
                libc::if_nametoindex(util::cstr(ifname).as_ptr())
            };
        }
        unsafe {
            libc::bind(fd, &sa6 as *const _ as *const libc::sockaddr,
                       mem::size_of::<libc::sockaddr_in6>()
                       as libc::socklen_t);
        }
    } else {
        let addr_out = if v6 {
            ctx.ip6.addr_out.map(InAny::from_v6)
        } else {
            ctx.ip4.addr_out.map(InAny::from_v4)
        };
        if !bind_port(fd, v6, addr_out, sport) {
            // The exact port is taken; an ephemeral port still carries
            // the traffic out, replies just lose the shortcut.
            bind_port(fd, v6, addr_out, 0);
        }
        if !dst.is_loopback() {
            if let Some(ifname) = &ctx.ifname_out {
                let name = util::cstr(ifname);
                unsafe {
                    libc::setsockopt(fd, libc::SOL_SOCKET,
                                     libc::SO_BINDTODEVICE,
                                     name.as_ptr() as *const libc::c_void,
                                     ifname.len() as libc::socklen_t);
                }
            }
        }
    }
    let uref = UdpRef {
        v6,
        splice: false,
        orig: false,
        pif: Pif::Host as u8,
        port: sport,
    };
    let r = ERef::new(RefType::Udp, fd, uref.pack());
    if epollref::epoll_add(ctx.epfd, libc::EPOLLIN as u32, r).is_err() {
        unsafe { libc::close(fd) };
        return None;
    }
    ctx.udp.tap_map[v][sport as usize] = PortState {
        sock: fd,
        flags: 0,
        ts: Some(now),
    };
    ctx.udp.act_tap[v].set(sport);
    ctx.cnt.udp_binds += 1;
    Some(fd)
}

// Forwarded-port binding in the initial namespace.
pub fn bound_sock_init(ctx: &mut Ctx, v6: bool, port: u16)
                       -> ctx::Result<()> {
    let v = v6 as usize;
    if ctx.udp.splice_init[v][port as usize].sock >= 0 {
        return Ok(());
    }
    let fd = dgram_sock(v6)?;
    if v6 {
        let one: libc::c_int = 1;
        unsafe {
            libc::setsockopt(fd, libc::IPPROTO_IPV6, libc::IPV6_V6ONLY,
                             &one as *const _ as *const libc::c_void,
                             mem::size_of::<libc::c_int>()
                             as libc::socklen_t);
        }
    }
    if !bind_port(fd, v6, None, port) {
        let e = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(ctx::Error::Sys(e));
    }
    let uref = UdpRef {
        v6,
        splice: ctx.mode == Mode::Ns,
        orig: true,
        pif: Pif::Host as u8,
        port,
    };
    epollref::epoll_add(ctx.epfd, libc::EPOLLIN as u32,
                        ERef::new(RefType::Udp, fd, uref.pack()))?;
    ctx.udp.splice_init[v][port as usize] = SpliceState {
        sock: fd,
        orig_port: port,
        ts: None,
    };
    Ok(())
}

// Outbound forwarded-port binding inside the peer namespace (NS mode):
// lets traffic originated in the namespace toward its own loopback
// reach initial-namespace servers over the splice path.
pub fn ns_bound_sock_init(ctx: &mut Ctx, v6: bool, port: u16)
                          -> ctx::Result<()> {
    let v = v6 as usize;
    if ctx.udp.splice_ns[v][port as usize].sock >= 0 {
        return Ok(());
    }
    let fd = netns::ns_call(&ctx.netns, &mut || {
        let af = if v6 { libc::AF_INET6 } else { libc::AF_INET };
        let fd = unsafe {
            libc::socket(af, libc::SOCK_DGRAM | libc::SOCK_NONBLOCK
                         | libc::SOCK_CLOEXEC, 0)
        };
        if fd < 0 {
            return -util::errno();
        }
        let lo = if v6 {
            InAny::from_v6(Ipv6Addr::LOCALHOST)
        } else {
            InAny::from_v4(Ipv4Addr::LOCALHOST)
        };
        let (sa, salen) = lo.to_sockaddr(port);
        if unsafe {
            libc::bind(fd, &sa as *const _ as *const libc::sockaddr, salen)
        } != 0 {
            let e = util::errno();
            unsafe { libc::close(fd) };
            return -e;
        }
        fd
    })?;
    if fd < 0 {
        return Err(ctx::Error::Sys(io::Error::from_raw_os_error(-fd)));
    }
    let fd = epollref::fd_guard(fd)?;
    let uref = UdpRef {
        v6,
        splice: true,
        orig: true,
        pif: Pif::Splice as u8,
        port,
    };
    epollref::epoll_add(ctx.epfd, libc::EPOLLIN as u32,
                        ERef::new(RefType::Udp, fd, uref.pack()))?;
    ctx.udp.splice_ns[v][port as usize] = SpliceState {
        sock: fd,
        orig_port: port,
        ts: None,
    };
    Ok(())
}

pub fn bound_sock_close(ctx: &mut Ctx, v6: bool, port: u16) {
    let v = v6 as usize;
    let e = ctx.udp.splice_init[v][port as usize];
    if e.sock >= 0 && e.ts.is_none() {
        let _ = epollref::epoll_del(ctx.epfd, e.sock);
        unsafe { libc::close(e.sock) };
        ctx.udp.splice_init[v][port as usize] = SpliceState::default();
    }
}

// TAP -> SOCKET

// Where a guest datagram actually goes. DNS redirect first; the
// gateway maps to loopback, unless this binding has a history of
// talking to a local-but-not-loopback service, in which case the
// host's own address (shared with the guest in NS mode) is the target.
fn tap_dst_udp(ctx: &Ctx, v6: bool, sport: u16, daddr: &InAny,
               dport: u16) -> InAny {
    if let Some(r) = nat::dns_redirect(ctx, daddr, dport) {
        return r;
    }
    let mapped = nat::tap_dst(ctx, daddr, dport);
    if mapped.is_loopback() && mapped != *daddr {
        let flags = ctx.udp.tap_map[v6 as usize][sport as usize].flags;
        if flags & PORT_LOCAL != 0 && flags & PORT_LOOPBACK == 0 {
            return if v6 {
                if flags & PORT_GUA != 0 {
                    InAny::from_v6(ctx.ip6.addr.unwrap_or(ctx.ip6.addr_seen))
                } else {
                    InAny::from_v6(ctx.ip6.addr_seen)
                }
            } else {
                InAny::from_v4(ctx.ip4.addr_seen)
            };
        }
    }
    mapped
}

#[allow(clippy::too_many_arguments)]
pub fn tap_handler(ctx: &mut Ctx, v6: bool, _saddr: InAny, daddr: InAny,
                   sport: u16, dport: u16, buf: &[u8],
                   segs: &packet::Pool, now: Instant) {
    let dst = tap_dst_udp(ctx, v6, sport, &daddr, dport);
    let dns_fwd = nat::dns_redirect(ctx, &daddr, dport).is_some();
    let dport_real = ctx.udp.fwd_out.mapped(dport);
    let sock = match tap_sock(ctx, v6, sport, &dst, now) {
        Some(s) => s,
        None => return,
    };
    if dns_fwd {
        ctx.udp.tap_map[v6 as usize][sport as usize].flags |= PORT_DNS_FWD;
    }
    let (sa, salen) = dst.to_sockaddr(dport_real);
    let mut msgs: [libc::mmsghdr; packet::POOL_FRAMES] =
        unsafe { mem::zeroed() };
    let mut iovs: [libc::iovec; packet::POOL_FRAMES] =
        unsafe { mem::zeroed() };
    let mut n = 0;
    for si in 0..segs.len() {
        let seg = match segs.get(buf, si) {
            Some(s) if s.len() >= 8 => s,
            _ => continue,
        };
        let udp_len = u16::from_be_bytes([seg[4], seg[5]]) as usize;
        let payload = &seg[8..udp_len.min(seg.len())];
        iovs[n] = libc::iovec {
            iov_base: payload.as_ptr() as *mut libc::c_void,
            iov_len: payload.len(),
        };
        msgs[n].msg_hdr.msg_name = &sa as *const _ as *mut libc::c_void;
        msgs[n].msg_hdr.msg_namelen = salen;
        msgs[n].msg_hdr.msg_iov = &mut iovs[n];
        msgs[n].msg_hdr.msg_iovlen = 1;
        n += 1;
    }
    if n == 0 {
        return;
    }
    let sent = unsafe {
        libc::sendmmsg(sock, msgs.as_mut_ptr(), n as libc::c_uint,
                       libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL)
    };
    if sent < 0 {
        trace!("udp sendmmsg: {}", io::Error::last_os_error());
    }
    ctx.udp.tap_map[v6 as usize][sport as usize].ts = Some(now);
    ctx.udp.act_tap[v6 as usize].set(sport);
}

// SOCKET -> TAP / SPLICE

// Rewrite the source a reply presents to the guest, mirroring the
// request-path policy, and note what this binding talked to.
fn sock_src_rewrite(ctx: &mut Ctx, uref: &UdpRef, src: InAny,
                    sport: u16) -> (InAny, u16) {
    let v = uref.v6 as usize;
    let e_flags = ctx.udp.tap_map[v][uref.port as usize].flags;
    if e_flags & PORT_DNS_FWD != 0 && sport == 53 {
        let is_dns_host = match src.v4() {
            Some(a) => Some(a) == ctx.ip4.dns_host,
            None => Some(src.v6()) == ctx.ip6.dns_host,
        };
        if is_dns_host {
            let shown = match src.v4() {
                Some(_) => ctx.ip4.dns_match.map(InAny::from_v4),
                None => ctx.ip6.dns_match.map(InAny::from_v6),
            };
            if let Some(shown) = shown {
                return (shown, 53);
            }
        }
    }
    let snat = nat::snat_inbound(ctx, src);
    if snat != src {
        let flags = &mut ctx.udp.tap_map[v][uref.port as usize].flags;
        *flags |= PORT_LOCAL;
        if src.is_loopback() {
            *flags |= PORT_LOOPBACK;
        }
        if src.is_gua() {
            *flags |= PORT_GUA;
        }
    }
    (snat, ctx.udp.fwd_out.reverse(sport))
}

// Create (or reuse) the reply socket for a spliced exchange, bound on
// loopback in the namespace opposite to where the datagram arrived.
fn splice_reply_sock(ctx: &mut Ctx, uref: &UdpRef, src_port: u16,
                     now: Instant) -> Option<i32> {
    let v = uref.v6 as usize;
    let v6 = uref.v6;
    let to_ns = uref.pif == Pif::Host as u8;
    let table = if to_ns {
        &mut ctx.udp.splice_ns[v]
    } else {
        &mut ctx.udp.splice_init[v]
    };
    let e = table[src_port as usize];
    if e.sock >= 0 {
        table[src_port as usize].ts = e.ts.map(|_| now);
        return Some(e.sock);
    }
    let fd = if to_ns {
        let port = src_port;
        netns::ns_call(&ctx.netns, &mut || {
            let af = if v6 { libc::AF_INET6 } else { libc::AF_INET };
            let fd = unsafe {
                libc::socket(af, libc::SOCK_DGRAM | libc::SOCK_NONBLOCK
                             | libc::SOCK_CLOEXEC, 0)
            };
            if fd < 0 {
                return -util::errno();
            }
            let lo = if v6 {
                InAny::from_v6(Ipv6Addr::LOCALHOST)
            } else {
                InAny::from_v4(Ipv4Addr::LOCALHOST)
            };
            let (sa, salen) = lo.to_sockaddr(port);
            if unsafe {
                libc::bind(fd, &sa as *const _ as *const libc::sockaddr,
                           salen)
            } != 0 {
                let e = util::errno();
                unsafe { libc::close(fd) };
                return -e;
            }
            fd
        }).ok().filter(|fd| *fd >= 0)?
    } else {
        let fd = dgram_sock(v6).ok()?;
        let lo = if v6 {
            InAny::from_v6(Ipv6Addr::LOCALHOST)
        } else {
            InAny::from_v4(Ipv4Addr::LOCALHOST)
        };
        let (sa, salen) = lo.to_sockaddr(src_port);
        if unsafe {
            libc::bind(fd, &sa as *const _ as *const libc::sockaddr, salen)
        } != 0 {
            unsafe { libc::close(fd) };
            return None;
        }
        fd
    };
    let fd = epollref::fd_guard(fd).ok()?;
    let reply_ref = UdpRef {
        v6,
        splice: true,
        orig: false,
        pif: if to_ns { Pif::Splice as u8 } else { Pif::Host as u8 },
        port: src_port,
    };
    if epollref::epoll_add(ctx.epfd, libc::EPOLLIN as u32,
                           ERef::new(RefType::Udp, fd, reply_ref.pack()))
        .is_err()
    {
        unsafe { libc::close(fd) };
        return None;
    }
    let table = if to_ns {
        &mut ctx.udp.splice_ns[v]
    } else {
        &mut ctx.udp.splice_init[v]
    };
    table[src_port as usize] = SpliceState {
        sock: fd,
        orig_port: uref.port,
        ts: Some(now),
    };
    let act = if to_ns {
        &mut ctx.udp.act_ns[v]
    } else {
        &mut ctx.udp.act_init[v]
    };
    act.set(src_port);
    Some(fd)
}

fn splice_forward(ctx: &mut Ctx, uref: &UdpRef, src_port: u16,
                  payload: *const u8, len: usize, now: Instant) {
    let v = uref.v6 as usize;
    let lo = if uref.v6 {
        InAny::from_v6(Ipv6Addr::LOCALHOST)
    } else {
        InAny::from_v4(Ipv4Addr::LOCALHOST)
    };
    let (sock, dst_port) = if uref.orig {
        // Fresh exchange on a bound port: relay into the opposite
        // namespace from a reply socket bound to the sender's port.
        let dst_port = if uref.pif == Pif::Host as u8 {
            ctx.udp.fwd_in.mapped(uref.port)
        } else {
            ctx.udp.fwd_out.mapped(uref.port)
        };
        match splice_reply_sock(ctx, uref, src_port, now) {
            Some(s) => (s, dst_port),
            None => return,
        }
    } else {
        // Reply on an ephemeral socket: exit through the bound socket
        // in the other namespace, so the source port matches what the
        // original sender expects.
        let near = if uref.pif == Pif::Splice as u8 {
            &ctx.udp.splice_init[v]
        } else {
            &ctx.udp.splice_ns[v]
        };
        let e = near[ctx.udp_reply_orig_port(uref, v) as usize];
        if e.sock < 0 {
            return;
        }
        (e.sock, uref.port)
    };
    let (sa, salen) = lo.to_sockaddr(dst_port);
    unsafe {
        libc::sendto(sock, payload as *const libc::c_void, len,
                     libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL,
                     &sa as *const _ as *const libc::sockaddr, salen);
    }
    // keep the ephemeral side alive
    let table = if uref.pif == Pif::Host as u8 {
        &mut ctx.udp.splice_init[v]
    } else {
        &mut ctx.udp.splice_ns[v]
    };
    if let Some(e) = table.get_mut(uref.port as usize) {
        if e.ts.is_some() {
            e.ts = Some(now);
        }
    }
}

impl Ctx {
    // The bound port a reply socket relays back through.
    fn udp_reply_orig_port(&self, uref: &UdpRef, v: usize) -> u16 {
        let table = if uref.pif == Pif::Splice as u8 {
            &self.udp.splice_ns[v]
        } else {
            &self.udp.splice_init[v]
        };
        table[uref.port as usize].orig_port
    }
}

pub fn sock_handler(ctx: &mut Ctx, eref: ERef, events: u32, now: Instant) {
    if events & libc::EPOLLIN as u32 == 0 {
        return;
    }
    let uref = UdpRef::unpack(eref.data);
    // One datagram at a time in NS mode; full batches over the stream.
    let vlen = if ctx.mode == Mode::Stream { UDP_MAX_FRAMES } else { 1 };
    loop {
        let mut names: [libc::sockaddr_storage; UDP_MAX_FRAMES] =
            unsafe { mem::zeroed() };
        let mut iovs: [libc::iovec; UDP_MAX_FRAMES] =
            unsafe { mem::zeroed() };
        let mut msgs: [libc::mmsghdr; UDP_MAX_FRAMES] =
            unsafe { mem::zeroed() };
        {
            let pool = if uref.v6 { &mut ctx.udp.bufs6 }
                       else { &mut ctx.udp.bufs4 };
            let cap = pool.payload_cap();
            for i in 0..vlen {
                iovs[i] = libc::iovec {
                    iov_base: pool.payload_ptr(i) as *mut libc::c_void,
                    iov_len: cap,
                };
                msgs[i].msg_hdr.msg_name =
                    &mut names[i] as *mut _ as *mut libc::c_void;
                msgs[i].msg_hdr.msg_namelen =
                    mem::size_of::<libc::sockaddr_storage>()
                    as libc::socklen_t;
                msgs[i].msg_hdr.msg_iov = &mut iovs[i];
                msgs[i].msg_hdr.msg_iovlen = 1;
            }
        }
        let n = unsafe {
            libc::recvmmsg(eref.fd, msgs.as_mut_ptr(), vlen as libc::c_uint,
                           libc::MSG_DONTWAIT, std::ptr::null_mut())
        };
        if n <= 0 {
            return;
        }
        let n = n as usize;
        let mut out: [usize; UDP_MAX_FRAMES] = [0; UDP_MAX_FRAMES];
        let mut nout = 0;
        for i in 0..n {
            let (src, sport) = match InAny::from_sockaddr(&names[i]) {
                Some(p) => p,
                None => continue,
            };
            let len = msgs[i].msg_len as usize;
            if uref.splice && src.is_loopback() {
                let payload = {
                    let pool = if uref.v6 { &mut ctx.udp.bufs6 }
                               else { &mut ctx.udp.bufs4 };
                    pool.payload_ptr(i) as *const u8
                };
                splice_forward(ctx, &uref, sport, payload, len, now);
                continue;
            }
            if uref.pif == Pif::Splice as u8 {
                // Namespace-side sockets never emit to the tap.
                continue;
            }
            let (shown, shown_port) = sock_src_rewrite(ctx, &uref, src,
                                                       sport);
            let daddr = if uref.v6 {
                InAny::from_v6(if ctx.ip6.addr_seen
                               == Ipv6Addr::UNSPECIFIED
                               { ctx.ip6.addr.unwrap_or(Ipv6Addr::UNSPECIFIED) }
                               else { ctx.ip6.addr_seen })
            } else {
                InAny::from_v4(if ctx.ip4.addr_seen.is_unspecified()
                               { ctx.ip4.addr.unwrap_or(Ipv4Addr::UNSPECIFIED) }
                               else { ctx.ip4.addr_seen })
            };
            let dport_guest = if uref.orig {
                ctx.udp.fwd_in.mapped(uref.port)
            } else {
                uref.port
            };
            if uref.orig {
                // Route guest replies back out of this bound socket.
                let v = uref.v6 as usize;
                let e = &mut ctx.udp.tap_map[v][dport_guest as usize];
                if e.sock < 0 {
                    e.sock = eref.fd;
                    e.flags |= PORT_ORIG;
                }
                e.ts = Some(now);
                ctx.udp.act_tap[v].set(dport_guest);
            }
            let pool = if uref.v6 { &mut ctx.udp.bufs6 }
                       else { &mut ctx.udp.bufs4 };
            pool.commit(i, &shown, &daddr, shown_port, dport_guest, len);
            out[nout] = i;
            nout += 1;
        }
        if nout > 0 {
            let Ctx { tap: tap_state, mode, udp, .. } = ctx;
            let pool = if uref.v6 { &udp.bufs6 } else { &udp.bufs4 };
            let mut frames: [&[u8]; UDP_MAX_FRAMES] =
                [&[]; UDP_MAX_FRAMES];
            for (k, &i) in out[..nout].iter().enumerate() {
                frames[k] = pool.frame(i);
            }
            tap::send_frames(tap_state, *mode, &frames[..nout]);
        }
        if n < vlen {
            return;
        }
    }
}

// EXPIRY

fn expire_tap(ctx: &mut Ctx, now: Instant) {
    for v in 0..2 {
        let ports: Vec<u16> = ctx.udp.act_tap[v].iter().collect();
        for port in ports {
            let e = ctx.udp.tap_map[v][port as usize];
            let stale = match e.ts {
                Some(ts) => now.duration_since(ts) > UDP_TIMEOUT,
                None => true,
            };
            if !stale {
                continue;
            }
            if e.flags & PORT_ORIG == 0 && e.sock >= 0 {
                let _ = epollref::epoll_del(ctx.epfd, e.sock);
                unsafe { libc::close(e.sock) };
            }
            ctx.udp.tap_map[v][port as usize] = PortState::default();
            ctx.udp.act_tap[v].clear(port);
            trace!("expired UDP binding for port {}", port);
        }
    }
}

fn expire_splice(ctx: &mut Ctx, now: Instant, ns_side: bool) {
    for v in 0..2 {
        let ports: Vec<u16> = if ns_side {
            ctx.udp.act_ns[v].iter().collect()
        } else {
            ctx.udp.act_init[v].iter().collect()
        };
        for port in ports {
            let table = if ns_side {
                &mut ctx.udp.splice_ns[v]
            } else {
                &mut ctx.udp.splice_init[v]
            };
            let e = table[port as usize];
            let stale = match e.ts {
                Some(ts) => now.duration_since(ts) > UDP_TIMEOUT,
                None => false, // bound at rebind time; not ours to expire
            };
            if !stale {
                continue;
            }
            if e.sock >= 0 {
                let _ = epollref::epoll_del(ctx.epfd, e.sock);
                unsafe { libc::close(e.sock) };
            }
            table[port as usize] = SpliceState::default();
            if ns_side {
                ctx.udp.act_ns[v].clear(port);
            } else {
                ctx.udp.act_init[v].clear(port);
            }
        }
    }
}

pub fn timer_handler(ctx: &mut Ctx, now: Instant) {
    expire_tap(ctx, now);
    expire_splice(ctx, now, false);
    expire_splice(ctx, now, true);
}

#[cfg(test)]
mod selftest {
    use super::*;
    use super::super::ctx::{Ip4Ctx, Ip6Ctx};

    fn test_ctx() -> Ctx {
        let mut ip4 = Ip4Ctx::default();
        ip4.addr = Some(Ipv4Addr::new(10, 0, 2, 15));
        ip4.addr_seen = Ipv4Addr::new(10, 0, 2, 15);
        ip4.gw = Ipv4Addr::new(10, 0, 2, 2);
        ip4.dns_match = Some(Ipv4Addr::new(10, 0, 2, 3));
        ip4.dns_host = Some(Ipv4Addr::new(1, 1, 1, 1));
        Ctx::new(Mode::Stream, ip4, Ip6Ctx::default(), 1500)
    }

    #[test]
    fn frame_pool_builds_valid_udp() {
        let mut pool = UdpFramePool::new(false);
        let payload = b"reply data";
        unsafe {
            std::ptr::copy_nonoverlapping(payload.as_ptr(),
                                          pool.payload_ptr(0),
                                          payload.len());
        }
        let src = InAny::from_v4(Ipv4Addr::new(203, 0, 113, 1));
        let dst = InAny::from_v4(Ipv4Addr::new(10, 0, 2, 15));
        pool.commit(0, &src, &dst, 53, 55000, payload.len());
        let frame = pool.frame(0);
        // length prefix, Ethernet, IP checksum
        assert_eq!(&frame[..4],
                   &((frame.len() - 4) as u32).to_be_bytes());
        let ip = &frame[ETH_OFF + 14..];
        assert_eq!(checksum::ipsum(&ip[..20], 20, 0), 0);
        assert_eq!(ip[9], ipv4::PROTOCOL_UDP);
        // UDP checksum over pseudo-header verifies
        let l4len = u16::from_be_bytes([ip[24], ip[25]]) as usize;
        assert_eq!(l4len, 8 + payload.len());
        let l4 = &ip[20..20 + l4len];
        let pseudo = ipv4::pseudo_checksum_parts(
            Ipv4Addr::new(203, 0, 113, 1), Ipv4Addr::new(10, 0, 2, 15),
            ipv4::PROTOCOL_UDP, l4len as u16);
        assert_eq!(checksum::ipsum(l4, l4len, !pseudo), 0);
        assert_eq!(&l4[8..8 + payload.len()], payload);
    }

    #[test]
    fn dns_reply_rewritten_back() {
        let mut ctx = test_ctx();
        let uref = UdpRef { v6: false, splice: false, orig: false,
                            pif: Pif::Host as u8, port: 55000 };
        ctx.udp.tap_map[0][55000].flags |= PORT_DNS_FWD;
        let src = InAny::from_v4(Ipv4Addr::new(1, 1, 1, 1));
        let (shown, port) = sock_src_rewrite(&mut ctx, &uref, src, 53);
        assert_eq!(shown.v4(), Some(Ipv4Addr::new(10, 0, 2, 3)));
        assert_eq!(port, 53);
    }

    #[test]
    fn loopback_reply_reflected_to_gateway() {
        let mut ctx = test_ctx();
        let uref = UdpRef { v6: false, splice: false, orig: false,
                            pif: Pif::Host as u8, port: 40000 };
        let src = InAny::from_v4(Ipv4Addr::LOCALHOST);
        let (shown, _) = sock_src_rewrite(&mut ctx, &uref, src, 8080);
        assert_eq!(shown.v4(), Some(Ipv4Addr::new(10, 0, 2, 2)));
        let flags = ctx.udp.tap_map[0][40000].flags;
        assert!(flags & PORT_LOCAL != 0);
        assert!(flags & PORT_LOOPBACK != 0);
    }

    #[test]
    fn gateway_dst_honors_local_history() {
        let mut ctx = test_ctx();
        let gw = InAny::from_v4(Ipv4Addr::new(10, 0, 2, 2));
        // no history: loopback
        assert_eq!(tap_dst_udp(&ctx, false, 40000, &gw, 8080).v4(),
                   Some(Ipv4Addr::LOCALHOST));
        // local-but-not-loopback history: the seen address
        ctx.udp.tap_map[0][40000].flags = PORT_LOCAL;
        assert_eq!(tap_dst_udp(&ctx, false, 40000, &gw, 8080).v4(),
                   Some(Ipv4Addr::new(10, 0, 2, 15)));
        // loopback history keeps the loopback mapping
        ctx.udp.tap_map[0][40000].flags = PORT_LOCAL | PORT_LOOPBACK;
        assert_eq!(tap_dst_udp(&ctx, false, 40000, &gw, 8080).v4(),
                   Some(Ipv4Addr::LOCALHOST));
    }

    #[test]
    fn expiry_closes_idle_bindings() {
        let mut ctx = test_ctx();
        let start = Instant::now();
        ctx.udp.tap_map[0][55000] = PortState {
            sock: -1, // nothing real to close in the test
            flags: 0,
            ts: Some(start),
        };
        ctx.udp.act_tap[0].set(55000);
        ctx.udp.tap_map[0][55001] = PortState {
            sock: -1,
            flags: 0,
            ts: Some(start + Duration::from_secs(190)),
        };
        ctx.udp.act_tap[0].set(55001);
        expire_tap(&mut ctx, start + Duration::from_secs(200));
        assert!(!ctx.udp.act_tap[0].get(55000));
        assert!(ctx.udp.act_tap[0].get(55001));
        assert_eq!(ctx.udp.tap_map[0][55001].sock, -1);
        assert!(ctx.udp.tap_map[0][55001].ts.is_some());
    }
}
