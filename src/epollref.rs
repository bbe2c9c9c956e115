use std::io;
use std::mem;

// TYPED EPOLL REFERENCES
//
// Every file descriptor registered with the event loop carries a packed
// 64-bit reference identifying the handler that owns it:
//
//    bits  0..8   handler type (RefType)
//    bits  8..32  file descriptor (hence the 2^24 fd ceiling)
//    bits 32..64  type-specific payload (flow index, port, UDP bits)
//
//   RefType - handler type enum
//   ERef - unpacked reference { ty, fd, data }
//   ERef.pack() -> u64 / ERef::unpack(u64) - wire conversion
//   UdpRef, ListenRef - payload layouts for UDP and listening sockets
//   fd_guard(fd) -> io::Result<i32> - enforce the 24-bit fd ceiling
//   epoll_add/epoll_mod/epoll_del - epoll_ctl wrappers taking an ERef

pub const FD_REF_MAX: i32 = (1 << 24) - 1;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum RefType {
    Tcp = 0,
    TcpSplice = 1,
    TcpListen = 2,
    TcpTimer = 3,
    Udp = 4,
    Ping = 5,
    NsQuitInotify = 6,
    NsQuitTimer = 7,
    TapNs = 8,
    TapStream = 9,
    TapListen = 10,
}

impl RefType {
    fn from_u8(v: u8) -> Option<RefType> {
        match v {
            0 => Some(RefType::Tcp),
            1 => Some(RefType::TcpSplice),
            2 => Some(RefType::TcpListen),
            3 => Some(RefType::TcpTimer),
            4 => Some(RefType::Udp),
            5 => Some(RefType::Ping),
            6 => Some(RefType::NsQuitInotify),
            7 => Some(RefType::NsQuitTimer),
            8 => Some(RefType::TapNs),
            9 => Some(RefType::TapStream),
            10 => Some(RefType::TapListen),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Debug)]
pub struct ERef {
    pub ty: RefType,
    pub fd: i32,
    pub data: u32,
}

impl ERef {
    pub fn new(ty: RefType, fd: i32, data: u32) -> ERef {
        debug_assert!(fd >= 0 && fd <= FD_REF_MAX);
        ERef { ty, fd, data }
    }

    pub fn pack(&self) -> u64 {
        (self.ty as u64)
            | ((self.fd as u64 & 0xff_ffff) << 8)
            | ((self.data as u64) << 32)
    }

    pub fn unpack(v: u64) -> Option<ERef> {
        Some(ERef {
            ty: RefType::from_u8(v as u8)?,
            fd: ((v >> 8) & 0xff_ffff) as i32,
            data: (v >> 32) as u32,
        })
    }
}

// UDP socket payload: address family, splice/orig roles, the namespace
// the socket was created in, and the port it is bound to.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct UdpRef {
    pub v6: bool,
    pub splice: bool,
    pub orig: bool,
    pub pif: u8, // flow::Pif as raw value
    pub port: u16,
}

impl UdpRef {
    pub fn pack(&self) -> u32 {
        (self.v6 as u32)
            | ((self.splice as u32) << 1)
            | ((self.orig as u32) << 2)
            | ((self.pif as u32 & 0x7) << 3)
            | ((self.port as u32) << 16)
    }

    pub fn unpack(data: u32) -> UdpRef {
        UdpRef {
            v6: data & 1 != 0,
            splice: data & 2 != 0,
            orig: data & 4 != 0,
            pif: ((data >> 3) & 0x7) as u8,
            port: (data >> 16) as u16,
        }
    }
}

// Listening TCP socket payload: bound port and creating namespace.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct ListenRef {
    pub v6: bool,
    pub pif: u8,
    pub port: u16,
}

impl ListenRef {
    pub fn pack(&self) -> u32 {
        (self.v6 as u32)
            | ((self.pif as u32 & 0x7) << 1)
            | ((self.port as u32) << 16)
    }

    pub fn unpack(data: u32) -> ListenRef {
        ListenRef {
            v6: data & 1 != 0,
            pif: ((data >> 1) & 0x7) as u8,
            port: (data >> 16) as u16,
        }
    }
}

// Any fd above the 24-bit ceiling cannot be carried in a reference:
// close it and fail, so the caller drops the flow.
pub fn fd_guard(fd: i32) -> io::Result<i32> {
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    if fd > FD_REF_MAX {
        unsafe { libc::close(fd) };
        return Err(io::Error::from_raw_os_error(libc::EIO));
    }
    Ok(fd)
}

fn epoll_ctl(epfd: i32, op: i32, fd: i32, events: u32, r: ERef)
             -> io::Result<()> {
    let mut ev = libc::epoll_event { events, u64: r.pack() };
    let ret = unsafe { libc::epoll_ctl(epfd, op, fd, &mut ev) };
    if ret == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub fn epoll_add(epfd: i32, events: u32, r: ERef) -> io::Result<()> {
    epoll_ctl(epfd, libc::EPOLL_CTL_ADD, r.fd, events, r)
}

pub fn epoll_mod(epfd: i32, events: u32, r: ERef) -> io::Result<()> {
    epoll_ctl(epfd, libc::EPOLL_CTL_MOD, r.fd, events, r)
}

pub fn epoll_del(epfd: i32, fd: i32) -> io::Result<()> {
    let ret = unsafe {
        libc::epoll_ctl(epfd, libc::EPOLL_CTL_DEL, fd,
                        std::ptr::null_mut())
    };
    if ret == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

// Size of the ready-event batch the loop drains per wakeup.
pub const EPOLL_EVENTS_MAX: usize = 8;

pub fn event_buf() -> [libc::epoll_event; EPOLL_EVENTS_MAX] {
    unsafe { mem::zeroed() }
}

#[cfg(test)]
mod selftest {
    use super::*;

    #[test]
    fn pack_roundtrip() {
        let cases = [
            ERef::new(RefType::Tcp, 0, 0),
            ERef::new(RefType::Tcp, FD_REF_MAX, u32::MAX),
            ERef::new(RefType::TapListen, 17, 0xdead_beef),
            ERef::new(RefType::NsQuitTimer, 1 << 20, 42),
        ];
        for r in cases {
            assert_eq!(ERef::unpack(r.pack()), Some(r));
        }
        assert_eq!(ERef::unpack(0xff), None);
    }

    #[test]
    fn udp_ref_roundtrip() {
        let cases = [
            UdpRef { v6: false, splice: false, orig: false, pif: 0, port: 0 },
            UdpRef { v6: true, splice: true, orig: true, pif: 3, port: 65535 },
            UdpRef { v6: false, splice: true, orig: false, pif: 2, port: 53 },
        ];
        for u in cases {
            assert_eq!(UdpRef::unpack(u.pack()), u);
        }
    }

    #[test]
    fn listen_ref_roundtrip() {
        let l = ListenRef { v6: true, pif: 1, port: 8080 };
        assert_eq!(ListenRef::unpack(l.pack()), l);
    }

    #[test]
    fn guard_rejects_high_fd() {
        // A closed high number: guard must fail without touching real fds.
        assert!(fd_guard(FD_REF_MAX + 1).is_err());
        assert!(fd_guard(-1).is_err());
    }
}
