use super::ctx::Ctx;
use super::ethernet;
use super::icmp;
use super::inany::InAny;
use super::ipv4;
use super::ipv6;
use super::packet;
use super::tap::ETH_HLEN;
use super::tcp;
use super::udp;

use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Instant;

use tracing::{debug, trace};

// L2/L3 DEMULTIPLEXER
//
// Walks the frames of one tap read batch: learns the guest MAC, parses
// Ethernet/IPv4/IPv6, drops what the translator does not handle
// (fragments, ARP, extension headers, loopback sources), and groups
// contiguous packets sharing an L4 5-tuple into one call per group into
// the TCP and UDP engines. ICMP goes to its handler one packet at a
// time.
//
//   classify(frame) -> Classified - pure per-frame L2/L3 parse
//   tap_handler(ctx, buf, pool, now) - batch entry point from the tap

#[derive(Debug, PartialEq)]
pub enum Classified {
    Short,
    Arp,
    UnknownEthertype(u16),
    BadHeader,
    V4Fragment,
    LoopbackSource,
    L4 {
        proto: u8,
        v6: bool,
        saddr: InAny,
        daddr: InAny,
        sport: u16,
        dport: u16,
        l4_off: usize,
        l4_len: usize,
    },
}

fn port_at(frame: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([frame[off], frame[off + 1]])
}

pub fn classify(frame: &[u8]) -> Classified {
    if frame.len() < ETH_HLEN {
        return Classified::Short;
    }
    match port_at(frame, 12) {
        ethernet::TYPE_IPV4 => classify_v4(frame),
        ethernet::TYPE_ARP => Classified::Arp,
        ethernet::TYPE_IPV6 => classify_v6(frame),
        other => Classified::UnknownEthertype(other),
    }
}

fn classify_v4(frame: &[u8]) -> Classified {
    let ip = &frame[ETH_HLEN..];
    if ip.len() < 20 {
        return Classified::Short;
    }
    if ip[0] >> 4 != 4 {
        return Classified::BadHeader;
    }
    let ihl = (ip[0] & 0xf) as usize * 4;
    let total = u16::from_be_bytes([ip[2], ip[3]]) as usize;
    if ihl < 20 || total < ihl || total > ip.len() {
        return Classified::BadHeader;
    }
    if u16::from_be_bytes([ip[6], ip[7]]) & 0x3fff != 0 {
        return Classified::V4Fragment;
    }
    let saddr = Ipv4Addr::new(ip[12], ip[13], ip[14], ip[15]);
    let daddr = Ipv4Addr::new(ip[16], ip[17], ip[18], ip[19]);
    if saddr.is_loopback() || daddr.is_loopback() {
        return Classified::LoopbackSource;
    }
    let proto = ip[9];
    let l4_off = ETH_HLEN + ihl;
    let l4_len = total - ihl;
    match proto {
        ipv4::PROTOCOL_TCP | ipv4::PROTOCOL_UDP => {
            if l4_len < 8 || frame.len() < l4_off + 4 {
                return Classified::Short;
            }
            Classified::L4 {
                proto,
                v6: false,
                saddr: InAny::from_v4(saddr),
                daddr: InAny::from_v4(daddr),
                sport: port_at(frame, l4_off),
                dport: port_at(frame, l4_off + 2),
                l4_off,
                l4_len,
            }
        }
        ipv4::PROTOCOL_ICMP => {
            if l4_len < 8 {
                return Classified::Short;
            }
            Classified::L4 {
                proto,
                v6: false,
                saddr: InAny::from_v4(saddr),
                daddr: InAny::from_v4(daddr),
                sport: 0,
                dport: 0,
                l4_off,
                l4_len,
            }
        }
        _ => Classified::BadHeader,
    }
}

fn classify_v6(frame: &[u8]) -> Classified {
    let ip = &frame[ETH_HLEN..];
    if ip.len() < 40 {
        return Classified::Short;
    }
    if ip[0] >> 4 != 6 {
        return Classified::BadHeader;
    }
    let payload = u16::from_be_bytes([ip[4], ip[5]]) as usize;
    if payload + 40 > ip.len() {
        return Classified::BadHeader;
    }
    let mut src = [0u8; 16];
    let mut dst = [0u8; 16];
    src.copy_from_slice(&ip[8..24]);
    dst.copy_from_slice(&ip[24..40]);
    let saddr = Ipv6Addr::from(src);
    let daddr = Ipv6Addr::from(dst);
    if saddr == Ipv6Addr::LOCALHOST || daddr == Ipv6Addr::LOCALHOST {
        return Classified::LoopbackSource;
    }
    // Extension headers are not walked; frames carrying them are not
    // produced by the guests this translator serves.
    let proto = ip[6];
    let l4_off = ETH_HLEN + 40;
    match proto {
        ipv6::NEXT_TCP | ipv6::NEXT_UDP => {
            if payload < 8 {
                return Classified::Short;
            }
            Classified::L4 {
                proto,
                v6: true,
                saddr: InAny::from_v6(saddr),
                daddr: InAny::from_v6(daddr),
                sport: port_at(frame, l4_off),
                dport: port_at(frame, l4_off + 2),
                l4_off,
                l4_len: payload,
            }
        }
        ipv6::NEXT_ICMPV6 => {
            if payload < 8 {
                return Classified::Short;
            }
            Classified::L4 {
                proto,
                v6: true,
                saddr: InAny::from_v6(saddr),
                daddr: InAny::from_v6(daddr),
                sport: 0,
                dport: 0,
                l4_off,
                l4_len: payload,
            }
        }
        _ => Classified::BadHeader,
    }
}

struct Batch {
    proto: u8,
    v6: bool,
    saddr: InAny,
    daddr: InAny,
    sport: u16,
    dport: u16,
    segs: packet::Pool,
}

fn batch_flush(ctx: &mut Ctx, buf: &[u8], b: &Batch, now: Instant) {
    if b.segs.is_empty() {
        return;
    }
    match b.proto {
        ipv4::PROTOCOL_TCP => {
            tcp::tap_handler(ctx, b.v6, b.saddr, b.daddr, b.sport, b.dport,
                             buf, &b.segs, now);
        }
        ipv4::PROTOCOL_UDP => {
            udp::tap_handler(ctx, b.v6, b.saddr, b.daddr, b.sport, b.dport,
                             buf, &b.segs, now);
        }
        _ => {}
    }
}

fn learn_guest_mac(ctx: &mut Ctx, frame: &[u8]) {
    let mut src = [0u8; 6];
    src.copy_from_slice(&frame[6..12]);
    if src != ctx.guest_mac
        && src != ethernet::MAC_ZERO
        && src != ethernet::MAC_BROADCAST
    {
        debug!("guest MAC now {}", ethernet::ntop(&src));
        ctx.guest_mac = src;
        ctx.update_l2_bufs();
    }
}

fn note_addr_seen(ctx: &mut Ctx, v6: bool, saddr: &InAny) {
    if !v6 {
        if let Some(a) = saddr.v4() {
            if !a.is_unspecified() {
                ctx.ip4.addr_seen = a;
            }
        }
    } else if saddr.is_linklocal() {
        ctx.ip6.addr_ll_seen = saddr.v6();
    } else if !saddr.is_unspecified() {
        ctx.ip6.addr_seen = saddr.v6();
    }
}

pub fn tap_handler(ctx: &mut Ctx, buf: &[u8], pool: &packet::Pool,
                   now: Instant) {
    let mut batch: Option<Batch> = None;
    for idx in 0..pool.len() {
        let frame = match pool.get(buf, idx) {
            Some(f) => f,
            None => continue,
        };
        let desc = pool.desc(idx).unwrap();
        if frame.len() >= ETH_HLEN {
            learn_guest_mac(ctx, frame);
        }
        match classify(frame) {
            Classified::L4 { proto, v6, saddr, daddr, sport, dport,
                             l4_off, l4_len } => {
                note_addr_seen(ctx, v6, &saddr);
                if proto == ipv4::PROTOCOL_ICMP && !v6 {
                    if let Some(b) = batch.take() {
                        batch_flush(ctx, buf, &b, now);
                    }
                    icmp::tap_handler(ctx, false, saddr, daddr,
                                      &frame[l4_off..l4_off + l4_len], now);
                    continue;
                }
                if proto == ipv6::NEXT_ICMPV6 && v6 {
                    if let Some(b) = batch.take() {
                        batch_flush(ctx, buf, &b, now);
                    }
                    icmp::tap_handler(ctx, true, saddr, daddr,
                                      &frame[l4_off..l4_off + l4_len], now);
                    continue;
                }
                let same = matches!(&batch, Some(b) if b.proto == proto
                    && b.v6 == v6 && b.saddr == saddr && b.daddr == daddr
                    && b.sport == sport && b.dport == dport
                    && !b.segs.is_full());
                if !same {
                    if let Some(b) = batch.take() {
                        batch_flush(ctx, buf, &b, now);
                    }
                    batch = Some(Batch {
                        proto, v6, saddr, daddr, sport, dport,
                        segs: packet::Pool::new(),
                    });
                }
                if let Some(b) = &mut batch {
                    b.segs.add(buf.len(),
                               desc.offset as usize + l4_off, l4_len);
                }
            }
            Classified::V4Fragment => {
                ctx.cnt.frag_drops += 1;
                if ctx.frag_rl.check(now) {
                    debug!("dropping IPv4 fragment from tap \
                            ({} dropped so far)", ctx.cnt.frag_drops);
                }
            }
            Classified::Arp => {
                ctx.cnt.arp_drops += 1;
                trace!("ARP from tap ignored");
            }
            other => {
                ctx.cnt.proto_drops += 1;
                trace!("dropping tap frame: {:?}", other);
            }
        }
    }
    if let Some(b) = batch.take() {
        batch_flush(ctx, buf, &b, now);
    }
}

#[cfg(test)]
mod selftest {
    use super::*;

    fn eth(ethertype: u16) -> Vec<u8> {
        let mut f = vec![0u8; ETH_HLEN];
        f[0..6].copy_from_slice(&[0x9a; 6]);
        f[6..12].copy_from_slice(&[0x52, 0x54, 0, 1, 1, 1]);
        f[12..14].copy_from_slice(&ethertype.to_be_bytes());
        f
    }

    fn v4_frame(proto: u8, src: [u8; 4], dst: [u8; 4],
                sport: u16, dport: u16, payload: usize) -> Vec<u8> {
        let mut f = eth(ethernet::TYPE_IPV4);
        let l4 = 8 + payload;
        let total = 20 + l4;
        let mut ip = vec![0u8; 20];
        ip[0] = 0x45;
        ip[2..4].copy_from_slice(&(total as u16).to_be_bytes());
        ip[8] = 64;
        ip[9] = proto;
        ip[12..16].copy_from_slice(&src);
        ip[16..20].copy_from_slice(&dst);
        f.extend_from_slice(&ip);
        let mut l4b = vec![0u8; l4];
        l4b[0..2].copy_from_slice(&sport.to_be_bytes());
        l4b[2..4].copy_from_slice(&dport.to_be_bytes());
        f.extend_from_slice(&l4b);
        f
    }

    #[test]
    fn classify_udp_v4() {
        let f = v4_frame(ipv4::PROTOCOL_UDP, [10, 0, 0, 1], [203, 0, 113, 1],
                         55000, 53, 12);
        match classify(&f) {
            Classified::L4 { proto, v6, sport, dport, l4_len, .. } => {
                assert_eq!(proto, ipv4::PROTOCOL_UDP);
                assert!(!v6);
                assert_eq!(sport, 55000);
                assert_eq!(dport, 53);
                assert_eq!(l4_len, 20);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn classify_fragment() {
        let mut f = v4_frame(ipv4::PROTOCOL_UDP, [10, 0, 0, 1],
                             [203, 0, 113, 1], 1, 2, 8);
        // MF flag
        f[ETH_HLEN + 6] = 0x20;
        assert_eq!(classify(&f), Classified::V4Fragment);
        // Non-zero offset
        f[ETH_HLEN + 6] = 0;
        f[ETH_HLEN + 7] = 0x10;
        assert_eq!(classify(&f), Classified::V4Fragment);
        // DF is not a fragment
        f[ETH_HLEN + 6] = 0x40;
        f[ETH_HLEN + 7] = 0;
        assert!(matches!(classify(&f), Classified::L4 { .. }));
    }

    #[test]
    fn classify_loopback_guard() {
        let f = v4_frame(ipv4::PROTOCOL_TCP, [127, 0, 0, 1],
                         [203, 0, 113, 1], 1, 2, 0);
        assert_eq!(classify(&f), Classified::LoopbackSource);
    }

    #[test]
    fn classify_arp_and_unknown() {
        assert_eq!(classify(&eth(ethernet::TYPE_ARP)), Classified::Arp);
        assert_eq!(classify(&eth(0x88cc)),
                   Classified::UnknownEthertype(0x88cc));
        assert_eq!(classify(&[0u8; 4]), Classified::Short);
    }

    #[test]
    fn classify_v6_tcp() {
        let mut f = eth(ethernet::TYPE_IPV6);
        let mut ip = vec![0u8; 40];
        ip[0] = 0x60;
        ip[4..6].copy_from_slice(&20u16.to_be_bytes());
        ip[6] = ipv6::NEXT_TCP;
        ip[7] = 64;
        ip[8..24].copy_from_slice(
            &"fe80::2".parse::<Ipv6Addr>().unwrap().octets());
        ip[24..40].copy_from_slice(
            &"2001:db8::1".parse::<Ipv6Addr>().unwrap().octets());
        f.extend_from_slice(&ip);
        let mut th = vec![0u8; 20];
        th[0..2].copy_from_slice(&40000u16.to_be_bytes());
        th[2..4].copy_from_slice(&443u16.to_be_bytes());
        f.extend_from_slice(&th);
        match classify(&f) {
            Classified::L4 { proto, v6, sport, dport, .. } => {
                assert_eq!(proto, ipv6::NEXT_TCP);
                assert!(v6);
                assert_eq!(sport, 40000);
                assert_eq!(dport, 443);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
