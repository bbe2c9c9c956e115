use super::ctx::Ctx;
use super::checksum;
use super::ethernet::{self, Ethernet, MacAddress};
use super::flow::Flow;
use super::header;
use super::inany::InAny;
use super::ipv4::{self, IPv4};
use super::ipv6::{self, IPv6};
use super::tap;

// TCP FRAME POOLS
//
// Pre-cooked buffers for frames headed to the tap. Each frame carries a
// 4-byte length-prefix slot, an Ethernet header, an IPv4 or IPv6
// header, and a TCP header, all scaffolded at startup; per packet only
// the variable fields (lengths, addresses, ports, sequence numbers,
// window, checksums) are overwritten. Separate "data" and "flags" pools
// exist per address family; data frames carry a seq-update sidecar so
// the owning connection's seq_to_tap advances only once the batched
// write to the tap has succeeded for that frame.
//
//   FramePool - TCP_FRAMES pre-cooked frames plus the sidecar
//   FramePool.commit(i, meta, opts, payload_len) - finish one frame
//   FramePool.payload_ptr(i) - payload region for scatter receive
//   flush(ctx) - deferred flush of all four pools, batch-ordered

pub const TCP_FRAMES: usize = 32;

const VNET_OFF: usize = 0;
const ETH_OFF: usize = tap::VNET_LEN;
const IP_OFF: usize = ETH_OFF + 14;

// Largest payload a single frame can carry, per family.
pub const MSS4: usize = 65535 - 14 - 20 - 20;
pub const MSS6: usize = 65535 - 14 - 40 - 20;

const DATA_STRIDE: usize = tap::VNET_LEN + 14 + 40 + 20 + MSS6 + 8;
const FLAGS_STRIDE: usize = 128;
const OPTS_MAX: usize = 32;

pub const FL_FIN: u8 = 0x01;
pub const FL_SYN: u8 = 0x02;
pub const FL_RST: u8 = 0x04;
pub const FL_PSH: u8 = 0x08;
pub const FL_ACK: u8 = 0x10;

// Everything a frame needs beyond its payload bytes.
pub struct FrameMeta {
    pub saddr: InAny,
    pub daddr: InAny,
    pub sport: u16,
    pub dport: u16,
    pub seq: u32,
    pub ack: u32,
    pub wnd: u16,
    pub flags: u8,
}

const NO_FLOW: u32 = u32::MAX;

pub struct FramePool {
    v6: bool,
    stride: usize,
    bufs: Box<[u8]>,
    used: usize,
    lens: [u32; TCP_FRAMES],
    seq_update: [(u32, u32); TCP_FRAMES],
    // IPv4 header checksum cache for runs of same-size frames.
    csum_cache: Option<(u16, InAny, InAny, u16)>,
}

impl FramePool {
    pub fn new(v6: bool, flags_pool: bool) -> FramePool {
        let stride = if flags_pool { FLAGS_STRIDE } else { DATA_STRIDE };
        let mut pool = FramePool {
            v6,
            stride,
            bufs: vec![0u8; stride * TCP_FRAMES].into_boxed_slice(),
            used: 0,
            lens: [0; TCP_FRAMES],
            seq_update: [(NO_FLOW, 0); TCP_FRAMES],
            csum_cache: None,
        };
        pool.init_l2(&ethernet::MAC_OUR_DEFAULT, &ethernet::MAC_ZERO);
        pool
    }

    fn ip_hlen(&self) -> usize {
        if self.v6 { 40 } else { 20 }
    }

    fn th_off(&self) -> usize {
        IP_OFF + self.ip_hlen()
    }

    pub fn payload_off(&self) -> usize {
        self.th_off() + 20
    }

    pub fn mss_limit(&self) -> usize {
        if self.v6 { MSS6 } else { MSS4 }
    }

    fn frame_mut(&mut self, i: usize) -> &mut [u8] {
        &mut self.bufs[i * self.stride..(i + 1) * self.stride]
    }

    pub fn init_l2(&mut self, our_mac: &MacAddress, guest_mac: &MacAddress) {
        let v6 = self.v6;
        for i in 0..TCP_FRAMES {
            let frame = self.frame_mut(i);
            let mut eth = header::from_mem::<Ethernet>(&mut frame[ETH_OFF..]);
            eth.set_dst(guest_mac);
            eth.set_src(our_mac);
            eth.set_ethertype(if v6 { ethernet::TYPE_IPV6 }
                              else { ethernet::TYPE_IPV4 });
            if v6 {
                let mut ip = header::from_mem::<IPv6>(&mut frame[IP_OFF..]);
                ip.init(ipv6::NEXT_TCP);
            } else {
                let mut ip = header::from_mem::<IPv4>(&mut frame[IP_OFF..]);
                ip.init(ipv4::PROTOCOL_TCP);
            }
        }
    }

    pub fn update_l2(&mut self, our_mac: &MacAddress,
                     guest_mac: &MacAddress) {
        for i in 0..TCP_FRAMES {
            let frame = self.frame_mut(i);
            let mut eth = header::from_mem::<Ethernet>(&mut frame[ETH_OFF..]);
            eth.set_dst(guest_mac);
            eth.set_src(our_mac);
        }
    }

    pub fn space(&self) -> usize {
        TCP_FRAMES - self.used
    }

    pub fn used(&self) -> usize {
        self.used
    }

    // Raw pointer into frame i's payload region, for building the
    // scatter list a single recvmsg() fills across many frames.
    pub fn payload_ptr(&mut self, i: usize) -> *mut u8 {
        let off = self.payload_off();
        self.frame_mut(i)[off..].as_mut_ptr()
    }

    fn ip4_checksum(&mut self, i: usize, total_len: u16,
                    saddr: InAny, daddr: InAny) {
        if let Some((tl, s, d, sum)) = self.csum_cache {
            if tl == total_len && s == saddr && d == daddr {
                let frame = self.frame_mut(i);
                frame[IP_OFF + 10..IP_OFF + 12]
                    .copy_from_slice(&sum.to_be_bytes());
                return;
            }
        }
        let frame = self.frame_mut(i);
        let mut ip = header::from_mem::<IPv4>(&mut frame[IP_OFF..]);
        ip.checksum_compute();
        let sum = u16::from_be_bytes([frame[IP_OFF + 10],
                                      frame[IP_OFF + 11]]);
        self.csum_cache = Some((total_len, saddr, daddr, sum));
    }

    // Fill the variable header fields of frame i: the payload (if any)
    // must already sit at payload_off() + opts.len() shifted region for
    // data frames (data frames carry no options, so payload sits right
    // after the 20-byte TCP header).
    pub fn commit(&mut self, i: usize, m: &FrameMeta, opts: &[u8],
                  payload_len: usize) {
        assert!(i < TCP_FRAMES && opts.len() <= OPTS_MAX);
        assert!(opts.len() % 4 == 0);
        let v6 = self.v6;
        let th_off = self.th_off();
        let l4_len = 20 + opts.len() + payload_len;
        let frame_len = th_off + l4_len - tap::VNET_LEN;

        let (pseudo, ip_total) = if v6 {
            let s = m.saddr.v6();
            let d = m.daddr.v6();
            {
                let frame = self.frame_mut(i);
                let mut ip = header::from_mem::<IPv6>(&mut frame[IP_OFF..]);
                ip.set_payload_length(l4_len as u16);
                ip.set_src(s);
                ip.set_dst(d);
            }
            (ipv6::pseudo_checksum_parts(s, d, ipv6::NEXT_TCP,
                                         l4_len as u32), 0u16)
        } else {
            let s = m.saddr.v4().unwrap_or(std::net::Ipv4Addr::UNSPECIFIED);
            let d = m.daddr.v4().unwrap_or(std::net::Ipv4Addr::UNSPECIFIED);
            let total = (20 + l4_len) as u16;
            {
                let frame = self.frame_mut(i);
                let mut ip = header::from_mem::<IPv4>(&mut frame[IP_OFF..]);
                ip.set_total_length(total);
                ip.set_src(s);
                ip.set_dst(d);
            }
            (ipv4::pseudo_checksum_parts(s, d, ipv4::PROTOCOL_TCP,
                                         l4_len as u16), total)
        };
        if !v6 {
            self.ip4_checksum(i, ip_total, m.saddr, m.daddr);
        }

        {
            let frame = self.frame_mut(i);
            let th = &mut frame[th_off..];
            th[0..2].copy_from_slice(&m.sport.to_be_bytes());
            th[2..4].copy_from_slice(&m.dport.to_be_bytes());
            th[4..8].copy_from_slice(&m.seq.to_be_bytes());
            th[8..12].copy_from_slice(&m.ack.to_be_bytes());
            th[12] = (((20 + opts.len()) / 4) as u8) << 4;
            th[13] = m.flags;
            th[14..16].copy_from_slice(&m.wnd.to_be_bytes());
            th[16..18].copy_from_slice(&[0, 0]); // checksum
            th[18..20].copy_from_slice(&[0, 0]); // urgent pointer
            th[20..20 + opts.len()].copy_from_slice(opts);
        }
        let sum = {
            let frame = self.frame_mut(i);
            checksum::ipsum(&frame[th_off..th_off + l4_len], l4_len, !pseudo)
        };
        let frame = self.frame_mut(i);
        frame[th_off + 16..th_off + 18]
            .copy_from_slice(&sum.to_be_bytes());
        tap::frame_prefix(&mut frame[VNET_OFF..tap::VNET_LEN + frame_len]);

        self.lens[i] = (tap::VNET_LEN + frame_len) as u32;
        self.seq_update[i] = (NO_FLOW, 0);
        if i >= self.used {
            self.used = i + 1;
        }
    }

    // Record that the connection's seq_to_tap becomes seq_next once
    // frame i reaches the tap.
    pub fn set_seq_update(&mut self, i: usize, flow_idx: usize,
                          seq_next: u32) {
        self.seq_update[i] = (flow_idx as u32, seq_next);
    }

    #[cfg(test)]
    pub fn frame(&self, i: usize) -> &[u8] {
        &self.bufs[i * self.stride..i * self.stride + self.lens[i] as usize]
    }
}

// Deferred flush: flags frames first (handshake and ACKs ahead of bulk
// data), then data frames, per family. Partially-sent batches leave
// seq_to_tap untouched for the unsent frames; the kernel still holds
// that data thanks to MSG_PEEK, so the next socket wakeup rebuilds it.
pub fn flush(ctx: &mut Ctx) {
    let Ctx { tap, mode, tcp, flows, .. } = ctx;
    let mode = *mode;
    for pool in [&mut tcp.flags4, &mut tcp.flags6,
                 &mut tcp.bufs4, &mut tcp.bufs6] {
        if pool.used == 0 {
            continue;
        }
        let sent = {
            let mut frames: [&[u8]; TCP_FRAMES] = [&[]; TCP_FRAMES];
            for i in 0..pool.used {
                frames[i] = &pool.bufs[i * pool.stride
                                       ..i * pool.stride
                                       + pool.lens[i] as usize];
            }
            tap::send_frames(tap, mode, &frames[..pool.used])
        };
        for i in 0..sent {
            let (flow_idx, seq_next) = pool.seq_update[i];
            if flow_idx == NO_FLOW {
                continue;
            }
            if let Flow::Tcp(f) = &mut flows.entries[flow_idx as usize] {
                f.conn.seq_to_tap = seq_next;
            }
        }
        pool.used = 0;
        pool.csum_cache = None;
    }
}

#[cfg(test)]
mod selftest {
    use super::*;
    use std::net::Ipv4Addr;

    fn meta4() -> FrameMeta {
        FrameMeta {
            saddr: InAny::from_v4(Ipv4Addr::new(10, 0, 2, 2)),
            daddr: InAny::from_v4(Ipv4Addr::new(10, 0, 2, 15)),
            sport: 80,
            dport: 40000,
            seq: 0x1000_0000,
            ack: 0x2000_0000,
            wnd: 14600,
            flags: FL_ACK,
        }
    }

    fn verify_v4(frame: &[u8]) {
        // Skip the length prefix; validate IP and TCP checksums.
        let ip = &frame[ETH_OFF + 14..];
        assert_eq!(checksum::ipsum(&ip[..20], 20, 0), 0, "IP checksum");
        let total = u16::from_be_bytes([ip[2], ip[3]]) as usize;
        let l4 = &ip[20..total];
        let src = Ipv4Addr::new(ip[12], ip[13], ip[14], ip[15]);
        let dst = Ipv4Addr::new(ip[16], ip[17], ip[18], ip[19]);
        let pseudo = ipv4::pseudo_checksum_parts(
            src, dst, ipv4::PROTOCOL_TCP, (total - 20) as u16);
        assert_eq!(checksum::ipsum(l4, l4.len(), !pseudo), 0,
                   "TCP checksum");
    }

    #[test]
    fn flags_frame_checksums() {
        let mut pool = FramePool::new(false, true);
        let opts = [2u8, 4, 0x05, 0xb4]; // MSS 1460
        pool.commit(0, &meta4(), &opts, 0);
        assert_eq!(pool.used(), 1);
        let frame = pool.frame(0);
        assert_eq!(&frame[..4],
                   &((frame.len() - 4) as u32).to_be_bytes());
        verify_v4(frame);
        // Data offset includes the options.
        let th = &frame[ETH_OFF + 14 + 20..];
        assert_eq!(th[12] >> 4, 6);
        assert_eq!(th[13], FL_ACK);
    }

    #[test]
    fn data_frame_checksums() {
        let mut pool = FramePool::new(false, false);
        let payload = b"hello from the socket side";
        unsafe {
            std::ptr::copy_nonoverlapping(payload.as_ptr(),
                                          pool.payload_ptr(0),
                                          payload.len());
        }
        let mut m = meta4();
        m.flags = FL_ACK | FL_PSH;
        pool.commit(0, &m, &[], payload.len());
        pool.set_seq_update(0, 7, m.seq.wrapping_add(payload.len() as u32));
        let frame = pool.frame(0);
        verify_v4(frame);
        let th = &frame[ETH_OFF + 14 + 20..];
        assert_eq!(&th[20..20 + payload.len()], payload);
        assert_eq!(pool.seq_update[0],
                   (7, m.seq.wrapping_add(payload.len() as u32)));
    }

    #[test]
    fn ip_checksum_cache_consistent() {
        let mut pool = FramePool::new(false, false);
        let m = meta4();
        for i in 0..3 {
            unsafe {
                std::ptr::write_bytes(pool.payload_ptr(i), i as u8, 100);
            }
            let mut mm = meta4();
            mm.seq = m.seq.wrapping_add(i as u32 * 100);
            pool.commit(i, &mm, &[], 100);
        }
        // Same size, same addresses: all three share a correct checksum.
        for i in 0..3 {
            verify_v4(pool.frame(i));
        }
        // A different size must not reuse the cached sum.
        pool.commit(3, &meta4(), &[], 0);
        verify_v4(pool.frame(3));
    }

    #[test]
    fn v6_frame_checksums() {
        let mut pool = FramePool::new(true, true);
        let m = FrameMeta {
            saddr: InAny::from_v6("2001:db8::1".parse().unwrap()),
            daddr: InAny::from_v6("2001:db8::2".parse().unwrap()),
            sport: 443,
            dport: 50000,
            seq: 1,
            ack: 2,
            wnd: 1000,
            flags: FL_SYN | FL_ACK,
        };
        pool.commit(0, &m, &[], 0);
        let frame = pool.frame(0);
        let ip = &frame[ETH_OFF + 14..];
        assert_eq!(ip[0] >> 4, 6);
        let plen = u16::from_be_bytes([ip[4], ip[5]]) as usize;
        assert_eq!(plen, 20);
        let l4 = &ip[40..40 + plen];
        let pseudo = ipv6::pseudo_checksum_parts(
            m.saddr.v6(), m.daddr.v6(), ipv6::NEXT_TCP, plen as u32);
        assert_eq!(checksum::ipsum(l4, plen, !pseudo), 0);
    }

    #[test]
    fn l2_update_rewrites_all_frames() {
        let mut pool = FramePool::new(false, true);
        let guest = [0x52, 0x54, 0, 9, 9, 9];
        let ours = [0x9a, 0x55, 0, 1, 2, 3];
        pool.update_l2(&ours, &guest);
        pool.commit(0, &meta4(), &[], 0);
        let frame = pool.frame(0);
        assert_eq!(&frame[4..10], &guest);
        assert_eq!(&frame[10..16], &ours);
    }
}
