use super::util;

use std::fmt;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

// ADDRESS UNION
//
// A 16-byte address carrying either an IPv4-mapped IPv6 address or a
// native IPv6 address, so flow keys and rewrite policy share storage
// across families.
//
//   InAny - 16 bytes, network order
//   InAny::from_v4/from_v6/from_ip - construct from std addresses
//   InAny.v4() -> Option<Ipv4Addr> - embedded IPv4 if v4-mapped
//   InAny.v6() -> Ipv6Addr - view as IPv6
//   InAny.is_loopback/is_unspecified/is_multicast/is_linklocal/is_gua
//   sockaddr conversion for bind/connect/accept/recvfrom

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct InAny(pub [u8; 16]);

pub const V4_MAPPED_PREFIX: [u8; 12] =
    [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff];

impl InAny {
    pub fn from_v4(addr: Ipv4Addr) -> InAny {
        let mut bytes = [0u8; 16];
        bytes[..12].copy_from_slice(&V4_MAPPED_PREFIX);
        bytes[12..].copy_from_slice(&addr.octets());
        InAny(bytes)
    }

    pub fn from_v6(addr: Ipv6Addr) -> InAny {
        InAny(addr.octets())
    }

    pub fn from_ip(addr: IpAddr) -> InAny {
        match addr {
            IpAddr::V4(a) => InAny::from_v4(a),
            IpAddr::V6(a) => InAny::from_v6(a),
        }
    }

    pub fn v4(&self) -> Option<Ipv4Addr> {
        if self.0[..12] == V4_MAPPED_PREFIX {
            Some(Ipv4Addr::new(self.0[12], self.0[13], self.0[14], self.0[15]))
        } else {
            None
        }
    }

    pub fn v6(&self) -> Ipv6Addr {
        Ipv6Addr::from(self.0)
    }

    pub fn is_v4(&self) -> bool {
        self.0[..12] == V4_MAPPED_PREFIX
    }

    pub fn is_loopback(&self) -> bool {
        match self.v4() {
            Some(a) => a.is_loopback(),
            None => self.v6() == Ipv6Addr::LOCALHOST,
        }
    }

    pub fn is_unspecified(&self) -> bool {
        match self.v4() {
            Some(a) => a.is_unspecified(),
            None => self.v6().is_unspecified(),
        }
    }

    pub fn is_multicast(&self) -> bool {
        match self.v4() {
            Some(a) => a.is_multicast(),
            None => self.0[0] == 0xff,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.v4().map(|a| a.is_broadcast()).unwrap_or(false)
    }

    // fe80::/10
    pub fn is_linklocal(&self) -> bool {
        !self.is_v4() && self.0[0] == 0xfe && self.0[1] & 0xc0 == 0x80
    }

    // IPv6 global unicast, 2000::/3
    pub fn is_gua(&self) -> bool {
        !self.is_v4() && self.0[0] & 0xe0 == 0x20
    }

    // sockaddr_storage holding this address and port, for bind/connect.
    pub fn to_sockaddr(&self, port: u16)
                       -> (libc::sockaddr_storage, libc::socklen_t) {
        let mut ss: libc::sockaddr_storage = unsafe { mem::zeroed() };
        match self.v4() {
            Some(a) => {
                let sin = &mut ss as *mut _ as *mut libc::sockaddr_in;
                unsafe {
                    (*sin).sin_family = libc::AF_INET as libc::sa_family_t;
                    (*sin).sin_port = util::htons(port);
                    (*sin).sin_addr.s_addr = u32::from_ne_bytes(a.octets());
                }
                (ss, mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
            }
            None => {
                let sin6 = &mut ss as *mut _ as *mut libc::sockaddr_in6;
                unsafe {
                    (*sin6).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                    (*sin6).sin6_port = util::htons(port);
                    (*sin6).sin6_addr.s6_addr = self.0;
                }
                (ss, mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
            }
        }
    }

    pub fn from_sockaddr(ss: &libc::sockaddr_storage) -> Option<(InAny, u16)> {
        match ss.ss_family as i32 {
            libc::AF_INET => {
                let sin = ss as *const _ as *const libc::sockaddr_in;
                let (addr, port) = unsafe {
                    ((*sin).sin_addr.s_addr, (*sin).sin_port)
                };
                Some((InAny::from_v4(Ipv4Addr::from(addr.to_ne_bytes())),
                      util::ntohs(port)))
            }
            libc::AF_INET6 => {
                let sin6 = ss as *const _ as *const libc::sockaddr_in6;
                let (addr, port) = unsafe {
                    ((*sin6).sin6_addr.s6_addr, (*sin6).sin6_port)
                };
                Some((InAny(addr), util::ntohs(port)))
            }
            _ => None,
        }
    }
}

impl fmt::Display for InAny {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.v4() {
            Some(a) => write!(f, "{}", a),
            None => write!(f, "{}", self.v6()),
        }
    }
}

impl fmt::Debug for InAny {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

#[cfg(test)]
mod selftest {
    use super::*;

    #[test]
    fn v4_mapping() {
        let a = InAny::from_v4(Ipv4Addr::new(10, 0, 2, 15));
        assert!(a.is_v4());
        assert_eq!(a.v4(), Some(Ipv4Addr::new(10, 0, 2, 15)));
        assert_eq!(format!("{}", a), "10.0.2.15");
        let b = InAny::from_v6("2001:db8::1".parse().unwrap());
        assert!(!b.is_v4());
        assert_eq!(b.v4(), None);
    }

    #[test]
    fn classification() {
        assert!(InAny::from_v4(Ipv4Addr::LOCALHOST).is_loopback());
        assert!(InAny::from_v6(Ipv6Addr::LOCALHOST).is_loopback());
        assert!(InAny::from_v4(Ipv4Addr::UNSPECIFIED).is_unspecified());
        assert!(InAny::from_v4(Ipv4Addr::new(224, 0, 0, 1)).is_multicast());
        assert!(InAny::from_v4(Ipv4Addr::new(255, 255, 255, 255)).is_broadcast());
        assert!(InAny::from_v6("fe80::1".parse().unwrap()).is_linklocal());
        assert!(!InAny::from_v6("fec0::1".parse().unwrap()).is_linklocal());
        assert!(InAny::from_v6("2001:db8::1".parse().unwrap()).is_gua());
        assert!(!InAny::from_v6("fe80::1".parse().unwrap()).is_gua());
        // v4-mapped addresses are never link-local or GUA
        assert!(!InAny::from_v4(Ipv4Addr::LOCALHOST).is_linklocal());
        assert!(!InAny::from_v4(Ipv4Addr::new(32, 1, 2, 3)).is_gua());
    }

    #[test]
    fn sockaddr_roundtrip() {
        let cases = [
            (InAny::from_v4(Ipv4Addr::new(192, 0, 2, 5)), 40000u16),
            (InAny::from_v6("2001:db8::42".parse().unwrap()), 443u16),
        ];
        for (addr, port) in cases {
            let (ss, _len) = addr.to_sockaddr(port);
            let (back, bport) = InAny::from_sockaddr(&ss).unwrap();
            assert_eq!(back, addr);
            assert_eq!(bport, port);
        }
    }
}
