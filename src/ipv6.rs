use super::util;
use super::header;
use super::checksum;

use std::mem;
use std::net::Ipv6Addr;
use std::slice;

// IPv6
//
// IPv6 header definition, mirroring the IPv4 module. Extension headers
// other than the fixed header are not walked: frames carrying them are
// not produced by the guests this translator serves, and are dropped by
// the demultiplexer.
//
//   IPv6 - struct for IPv6 headers
//   Header<IPv6>.init(next_header) - set version and hop limit
//   Header<IPv6>.payload_length()/next_header()/src()/dst() ...
//   Header<IPv6>.pseudo_checksum(u8, u32) -> u16
//   pseudo_checksum_parts(src, dst, protocol, len)

#[repr(C, packed)]
#[derive(Default)]
pub struct IPv6 {
    vtc_flow: u32, // version:4, traffic class:8, flow label:20
    payload_length: u16,
    next_header: u8,
    hop_limit: u8,
    src: [u8; 16],
    dst: [u8; 16],
}

#[repr(C, packed)]
struct PseudoHeader {
    src: [u8; 16],
    dst: [u8; 16],
    ulp_len: u32,
    zero: [u8; 3],
    ulp_protocol: u8,
}

impl header::Header<IPv6> {

    pub fn init(&mut self, next_header: u8) {
        let h = self.header_mut();
        h.vtc_flow = util::htonl(6 << 28);
        h.next_header = next_header;
        h.hop_limit = 255;
    }

    pub fn version(&self) -> u8 {
        (util::ntohl(self.header_ref().vtc_flow) >> 28) as u8
    }

    pub fn payload_length(&self) -> u16 {
        util::ntohs(self.header_ref().payload_length)
    }

    pub fn set_payload_length(&mut self, len: u16) {
        self.header_mut().payload_length = util::htons(len);
    }

    pub fn next_header(&self) -> u8 {
        self.header_ref().next_header
    }

    pub fn hop_limit(&self) -> u8 {
        self.header_ref().hop_limit
    }

    pub fn src(&self) -> Ipv6Addr {
        Ipv6Addr::from(self.header_ref().src)
    }

    pub fn set_src(&mut self, address: Ipv6Addr) {
        self.header_mut().src = address.octets();
    }

    pub fn dst(&self) -> Ipv6Addr {
        Ipv6Addr::from(self.header_ref().dst)
    }

    pub fn set_dst(&mut self, address: Ipv6Addr) {
        self.header_mut().dst = address.octets();
    }

    pub fn pseudo_checksum(&self, protocol: u8, len: u32) -> u16 {
        pseudo_checksum_parts(self.src(), self.dst(), protocol, len)
    }

}

pub fn pseudo_checksum_parts(src: Ipv6Addr, dst: Ipv6Addr,
                             protocol: u8, len: u32) -> u16 {
    let ph = PseudoHeader {
        src: src.octets(),
        dst: dst.octets(),
        ulp_len: util::htonl(len),
        zero: [0; 3],
        ulp_protocol: protocol,
    };
    let ptr = &ph as *const PseudoHeader as *const u8;
    let size = mem::size_of::<PseudoHeader>();
    let s = unsafe { slice::from_raw_parts(ptr, size) };
    checksum::ipsum(s, size, 0)
}

pub const NEXT_TCP: u8 = 6;
pub const NEXT_UDP: u8 = 17;
pub const NEXT_ICMPV6: u8 = 58;

#[cfg(test)]
mod selftest {
    use super::*;

    #[test]
    fn ipv6() {
        let mut mem = [0u8; 40];
        let mut ip = header::from_mem::<IPv6>(&mut mem);
        ip.init(NEXT_TCP);
        ip.set_payload_length(20);
        ip.set_src("fe80::1".parse().unwrap());
        ip.set_dst("2001:db8::1".parse().unwrap());
        assert_eq!(ip.version(), 6);
        assert_eq!(ip.payload_length(), 20);
        assert_eq!(ip.next_header(), NEXT_TCP);
        assert_eq!(ip.hop_limit(), 255);
        assert_eq!(ip.src(), "fe80::1".parse::<Ipv6Addr>().unwrap());
        assert_eq!(header::size_of::<IPv6>(), 40);
    }

    #[test]
    fn pseudo_header_differs_by_protocol() {
        let src: Ipv6Addr = "2001:db8::1".parse().unwrap();
        let dst: Ipv6Addr = "2001:db8::2".parse().unwrap();
        let t = pseudo_checksum_parts(src, dst, NEXT_TCP, 20);
        let u = pseudo_checksum_parts(src, dst, NEXT_UDP, 20);
        assert_ne!(t, u);
    }
}
