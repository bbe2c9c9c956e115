#![allow(dead_code)]

mod util;
mod bitmap;
mod siphash;
mod checksum;
mod inany;
mod header;
mod ethernet;
mod ipv4;
mod ipv6;
mod packet;
mod epollref;
mod engine;
mod tap;
mod demux;
mod flow;
mod tcp;
mod tcp_buf;
mod udp;
mod icmp;
mod fwd;
mod nat;
mod netns;
mod ctx;

mod translator;

fn main() {
    translator::main();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    // A frame synthesized by the TCP frame pool must come back out of
    // the demultiplexer's classifier with the same 5-tuple.
    #[test]
    fn synthesized_frame_roundtrip() {
        let mut pool = tcp_buf::FramePool::new(false, true);
        let meta = tcp_buf::FrameMeta {
            saddr: inany::InAny::from_v4(Ipv4Addr::new(10, 0, 2, 2)),
            daddr: inany::InAny::from_v4(Ipv4Addr::new(10, 0, 2, 15)),
            sport: 22,
            dport: 40000,
            seq: 1,
            ack: 2,
            wnd: tcp::WINDOW_DEFAULT,
            flags: tcp_buf::FL_SYN,
        };
        pool.commit(0, &meta, &[], 0);
        // Skip the length prefix: the classifier sees the raw frame.
        let frame = &pool.frame(0)[tap::VNET_LEN..];
        match demux::classify(frame) {
            demux::Classified::L4 { proto, v6, saddr, daddr, sport,
                                    dport, .. } => {
                assert_eq!(proto, ipv4::PROTOCOL_TCP);
                assert!(!v6);
                assert_eq!(saddr.v4(), Some(Ipv4Addr::new(10, 0, 2, 2)));
                assert_eq!(daddr.v4(), Some(Ipv4Addr::new(10, 0, 2, 15)));
                assert_eq!(sport, 22);
                assert_eq!(dport, 40000);
            }
            other => panic!("classifier returned {:?}", other),
        }
    }
}
