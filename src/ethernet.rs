use super::util;
use super::header;

use std::mem;

// ETHERNET
//
// This module contains an Ethernet header definition, a type for Ethernet
// (MAC) addresses, and some related utilities.
//
//   MacAddress - six bytes
//   ntop(&MacAddress) -> String - return string representation of MAC
//   pton(&str) -> Option<MacAddress> - parse MAC address from string
//   Ethernet - struct for Ethernet headers
//   Header<Ethernet>.dst()/set_dst(), src()/set_src()
//   Header<Ethernet>.ethertype()/set_ethertype()
//   TYPE_IPV4, TYPE_IPV6, TYPE_ARP - ethertype identifiers

pub type MacAddress = [u8; 6];

pub const MAC_ZERO: MacAddress = [0; 6];
pub const MAC_BROADCAST: MacAddress = [0xff; 6];

// Locally-administered address the translator answers as.
pub const MAC_OUR_DEFAULT: MacAddress = [0x9a, 0x55, 0x9a, 0x55, 0x9a, 0x55];

pub fn ntop(address: &MacAddress) -> String {
    format!("{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            address[0], address[1], address[2],
            address[3], address[4], address[5])
}

pub fn pton(string: &str) -> Option<MacAddress> {
    let mut address: MacAddress = [0; 6];
    let mut parts = string.split(':');
    for byte in address.iter_mut() {
        *byte = u8::from_str_radix(parts.next()?, 16).ok()?;
    }
    if parts.next().is_some() { return None; }
    Some(address)
}

#[repr(C, packed)]
#[derive(Default)]
pub struct Ethernet {
    dst: MacAddress,
    src: MacAddress,
    ethertype: u16,
}

impl header::Header<Ethernet> {

    pub fn dst(&self) -> &MacAddress {
        &self.header_ref().dst
    }

    pub fn set_dst(&mut self, address: &MacAddress) {
        let h = self.header_mut();
        util::copy(&mut h.dst, address, mem::size_of::<MacAddress>());
    }

    pub fn src(&self) -> &MacAddress {
        &self.header_ref().src
    }

    pub fn set_src(&mut self, address: &MacAddress) {
        let h = self.header_mut();
        util::copy(&mut h.src, address, mem::size_of::<MacAddress>());
    }

    pub fn ethertype(&self) -> u16 {
        util::ntohs(self.header_ref().ethertype)
    }

    pub fn set_ethertype(&mut self, ethertype: u16) {
        self.header_mut().ethertype = util::htons(ethertype);
    }

}

pub const TYPE_IPV4: u16 = 0x0800;
pub const TYPE_ARP: u16 = 0x0806;
pub const TYPE_IPV6: u16 = 0x86dd;

#[cfg(test)]
mod selftest {
    use super::*;

    #[test]
    fn ethernet() {
        let mut mem = [0u8; 14];
        let mut eth = header::from_mem::<Ethernet>(&mut mem);
        eth.set_src(&pton("42:42:42:42:42:42").unwrap());
        eth.set_dst(&pton("01:02:03:04:05:06").unwrap());
        eth.set_ethertype(TYPE_IPV6);
        assert_eq!(eth.src(), &[0x42; 6]);
        assert_eq!(eth.dst(), &[1, 2, 3, 4, 5, 6]);
        assert_eq!(eth.ethertype(), 0x86dd);
        assert_eq!(ntop(eth.dst()), "01:02:03:04:05:06");
        assert_eq!(header::size_of::<Ethernet>(), 14);
    }

    #[test]
    fn pton_rejects_garbage() {
        assert!(pton("not a mac").is_none());
        assert!(pton("01:02:03:04:05").is_none());
        assert!(pton("01:02:03:04:05:06:07").is_none());
        assert!(pton("zz:02:03:04:05:06").is_none());
    }
}
