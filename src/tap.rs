use super::ctx::{Ctx, Error, Mode, Result};
use super::demux;
use super::epollref::{self, ERef, RefType};
use super::netns;
use super::packet;
use super::util;

use std::io;
use std::mem;
use std::time::Instant;

use byteorder::{BigEndian, ByteOrder};
use tracing::{debug, info, warn};

// TAP TRANSPORT
//
// The host-facing channel carrying L2 frames. Two transports:
//
//   STREAM - a Unix stream socket accepted from a hypervisor; frames
//            are preceded by a 32-bit big-endian length. Reads must
//            reassemble frames split across recv() boundaries; exactly
//            one partial frame may trail any read.
//   NS     - a tuntap character device opened inside the peer network
//            namespace; raw Ethernet frames, no length prefix.
//
// Outgoing frames always carry a 4-byte length-prefix slot so one
// pre-cooked buffer serves both transports: STREAM sends the slot, NS
// skips it. STREAM batches many frames into one sendmsg(); NS writes
// one frame per write, as the device requires.
//
//   Tap - transport fds
//   TapRx - shared receive buffer plus partial-frame state
//   sock_unix_init(ctx, path) - probe, bind and listen on a Unix path
//   ns_tun_init(ctx, ifname) - open the tuntap device in the peer ns
//   listen_handler / handler_stream / handler_ns - epoll handlers
//   send_frames(tap, mode, frames) -> usize - batched transmit
//   frame_prefix(&mut [u8]) - write the length prefix slot

pub const TAP_BUF_BYTES: usize = 256 * 1024;
pub const ETH_HLEN: usize = 14;
pub const MAX_L2_FRAME: usize = 65535;
pub const VNET_LEN: usize = 4;

const SEND_IOV_MAX: usize = 64;

pub struct Tap {
    pub fd: i32,
    pub listen_fd: i32,
    pub sock_path: Option<String>,
}

impl Tap {
    pub fn new() -> Tap {
        Tap { fd: -1, listen_fd: -1, sock_path: None }
    }
}

pub struct TapRx {
    pub buf: Box<[u8]>,
    pub partial: usize,
}

impl TapRx {
    pub fn new() -> TapRx {
        TapRx { buf: vec![0u8; TAP_BUF_BYTES].into_boxed_slice(), partial: 0 }
    }
}

// Fill the 4-byte slot preceding the Ethernet header with the frame
// length, big-endian, excluding the slot itself.
pub fn frame_prefix(frame: &mut [u8]) {
    let len = (frame.len() - VNET_LEN) as u32;
    BigEndian::write_u32(&mut frame[..VNET_LEN], len);
}

fn sockaddr_un(path: &str) -> (libc::sockaddr_un, libc::socklen_t) {
    let mut sa: libc::sockaddr_un = unsafe { mem::zeroed() };
    sa.sun_family = libc::AF_UNIX as libc::sa_family_t;
    let bytes = path.as_bytes();
    assert!(bytes.len() < sa.sun_path.len(), "socket path too long");
    for (i, b) in bytes.iter().enumerate() {
        sa.sun_path[i] = *b as libc::c_char;
    }
    let len = mem::size_of::<libc::sa_family_t>() + bytes.len() + 1;
    (sa, len as libc::socklen_t)
}

// A path is free when a probe connect() fails with ENOENT, ECONNREFUSED
// or EACCES; anything else means a live peer owns it.
fn unix_path_free(path: &str) -> bool {
    let sock = unsafe {
        libc::socket(libc::AF_UNIX,
                     libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0)
    };
    if sock == -1 {
        return false;
    }
    let (sa, len) = sockaddr_un(path);
    let ret = unsafe {
        libc::connect(sock, &sa as *const _ as *const libc::sockaddr, len)
    };
    let err = util::errno();
    unsafe { libc::close(sock) };
    ret == -1 && matches!(err, libc::ENOENT | libc::ECONNREFUSED
                               | libc::EACCES)
}

pub fn sock_unix_init(ctx: &mut Ctx, path: Option<&str>) -> Result<String> {
    let path = match path {
        Some(p) => {
            if !unix_path_free(p) {
                return Err(Error::Config(format!("socket {} is in use", p)));
            }
            p.to_string()
        }
        None => {
            let mut found = None;
            for n in 1..=100 {
                let p = format!("/tmp/tapnat_{}.socket", n);
                if unix_path_free(&p) {
                    found = Some(p);
                    break;
                }
            }
            found.ok_or_else(|| {
                Error::Config("no free socket path under /tmp".to_string())
            })?
        }
    };
    unsafe { libc::unlink(util::cstr(&path).as_ptr()) };
    let fd = epollref::fd_guard(unsafe {
        libc::socket(libc::AF_UNIX,
                     libc::SOCK_STREAM | libc::SOCK_NONBLOCK
                     | libc::SOCK_CLOEXEC, 0)
    })?;
    let (sa, len) = sockaddr_un(&path);
    let ret = unsafe {
        libc::bind(fd, &sa as *const _ as *const libc::sockaddr, len)
    };
    if ret == -1 {
        let e = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(Error::Sys(e));
    }
    if unsafe { libc::listen(fd, 1) } == -1 {
        let e = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(Error::Sys(e));
    }
    epollref::epoll_add(ctx.epfd, libc::EPOLLIN as u32,
                        ERef::new(RefType::TapListen, fd, 0))?;
    ctx.tap.listen_fd = fd;
    ctx.tap.sock_path = Some(path.clone());
    info!("listening on {}", path);
    Ok(path)
}

const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
const IFF_TAP: libc::c_short = 0x0002;
const IFF_NO_PI: libc::c_short = 0x1000;

#[repr(C)]
struct IfReqTun {
    name: [u8; libc::IFNAMSIZ],
    flags: libc::c_short,
    pad: [u8; 22],
}

// Open /dev/net/tun inside the peer namespace. CLONE_FILES makes the
// descriptor opened by the child visible here.
pub fn ns_tun_init(ctx: &mut Ctx, ifname: &str) -> Result<()> {
    let mut ifr = IfReqTun {
        name: [0; libc::IFNAMSIZ],
        flags: IFF_TAP | IFF_NO_PI,
        pad: [0; 22],
    };
    let name = ifname.as_bytes();
    if name.len() >= libc::IFNAMSIZ {
        return Err(Error::Config(format!("interface name {} too long",
                                         ifname)));
    }
    ifr.name[..name.len()].copy_from_slice(name);
    let dev = util::cstr("/dev/net/tun");
    let fd = netns::ns_call(&ctx.netns, &mut || {
        let fd = unsafe {
            libc::open(dev.as_ptr(), libc::O_RDWR | libc::O_NONBLOCK)
        };
        if fd < 0 {
            return -util::errno();
        }
        if unsafe { libc::ioctl(fd, TUNSETIFF, &mut ifr) } < 0 {
            let e = util::errno();
            unsafe { libc::close(fd) };
            return -e;
        }
        fd
    })?;
    if fd < 0 {
        return Err(Error::Sys(io::Error::from_raw_os_error(-fd)));
    }
    let fd = epollref::fd_guard(fd)?;
    epollref::epoll_add(ctx.epfd,
                        (libc::EPOLLIN | libc::EPOLLRDHUP) as u32,
                        ERef::new(RefType::TapNs, fd, 0))?;
    ctx.tap.fd = fd;
    info!("tap device {} ready in peer namespace", ifname);
    Ok(())
}

pub fn listen_handler(ctx: &mut Ctx, _now: Instant) -> Result<()> {
    let fd = unsafe {
        libc::accept4(ctx.tap.listen_fd, std::ptr::null_mut(),
                      std::ptr::null_mut(),
                      libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC)
    };
    let fd = epollref::fd_guard(fd)?;
    if ctx.tap.fd != -1 {
        // One hypervisor connection at a time.
        warn!("rejecting second tap connection");
        unsafe { libc::close(fd) };
        return Ok(());
    }
    epollref::epoll_add(ctx.epfd,
                        (libc::EPOLLIN | libc::EPOLLRDHUP) as u32,
                        ERef::new(RefType::TapStream, fd, 0))?;
    ctx.tap.fd = fd;
    info!("tap connection accepted");
    Ok(())
}

fn disconnect(ctx: &mut Ctx, rx: &mut TapRx) -> Result<()> {
    if ctx.tap.fd != -1 {
        let _ = epollref::epoll_del(ctx.epfd, ctx.tap.fd);
        unsafe { libc::close(ctx.tap.fd) };
        ctx.tap.fd = -1;
    }
    rx.partial = 0;
    ctx.cnt.tap_disconnects += 1;
    if ctx.mode == Mode::Ns || ctx.one_off {
        return Err(Error::TapDisconnected);
    }
    info!("tap disconnected, waiting for next connection");
    Ok(())
}

// Scan length-prefixed frames in buf[start..total] into the pool, until
// the pool fills or a partial frame remains. Returns bytes consumed;
// Err when the prefix is out of range, which means framing is lost.
pub fn stream_scan(buf: &[u8], start: usize, total: usize,
                   pool: &mut packet::Pool)
                   -> std::result::Result<usize, ()> {
    let mut pos = start;
    while pos + VNET_LEN <= total && !pool.is_full() {
        let len = BigEndian::read_u32(&buf[pos..pos + VNET_LEN]) as usize;
        if !(ETH_HLEN..=MAX_L2_FRAME).contains(&len) {
            return Err(());
        }
        if pos + VNET_LEN + len > total {
            break;
        }
        pool.add(buf.len(), pos + VNET_LEN, len);
        pos += VNET_LEN + len;
    }
    Ok(pos)
}

pub fn handler_stream(ctx: &mut Ctx, rx: &mut TapRx, events: u32,
                      now: Instant) -> Result<()> {
    if events & (libc::EPOLLHUP | libc::EPOLLERR) as u32 != 0 {
        return disconnect(ctx, rx);
    }
    loop {
        let n = unsafe {
            libc::recv(ctx.tap.fd,
                       rx.buf[rx.partial..].as_mut_ptr()
                           as *mut libc::c_void,
                       rx.buf.len() - rx.partial, libc::MSG_DONTWAIT)
        };
        if n == 0 {
            return disconnect(ctx, rx);
        }
        if n < 0 {
            match util::errno() {
                libc::EAGAIN => break,
                libc::EINTR => continue,
                _ => return disconnect(ctx, rx),
            }
        }
        let total = rx.partial + n as usize;
        let mut start = 0;
        loop {
            let mut pool = packet::Pool::new();
            start = match stream_scan(&rx.buf, start, total, &mut pool) {
                Ok(pos) => pos,
                Err(()) => {
                    debug!("tap frame length out of range, resetting");
                    return disconnect(ctx, rx);
                }
            };
            let full = pool.is_full();
            if !pool.is_empty() {
                demux::tap_handler(ctx, &rx.buf, &pool, now);
            }
            if !full {
                break;
            }
        }
        rx.buf.copy_within(start..total, 0);
        rx.partial = total - start;
    }
    Ok(())
}

pub fn handler_ns(ctx: &mut Ctx, rx: &mut TapRx, _events: u32,
                  now: Instant) -> Result<()> {
    loop {
        let mut pool = packet::Pool::new();
        let mut offset = 0;
        let mut drained = false;
        while !pool.is_full() && offset + MAX_L2_FRAME <= rx.buf.len() {
            let n = unsafe {
                libc::read(ctx.tap.fd,
                           rx.buf[offset..].as_mut_ptr()
                               as *mut libc::c_void,
                           MAX_L2_FRAME)
            };
            if n < 0 {
                match util::errno() {
                    libc::EAGAIN => { drained = true; break; }
                    libc::EINTR => continue,
                    _ => return Err(Error::TapDisconnected),
                }
            }
            if n == 0 {
                return Err(Error::TapDisconnected);
            }
            if (n as usize) < ETH_HLEN {
                continue;
            }
            pool.add(rx.buf.len(), offset, n as usize);
            offset += util::align(n as usize, 4);
        }
        if !pool.is_empty() {
            demux::tap_handler(ctx, &rx.buf, &pool, now);
        }
        if drained {
            break;
        }
    }
    Ok(())
}

// Complete the partial write of one frame; giving up mid-frame would
// desynchronize STREAM framing, so this retries through EAGAIN with a
// bounded poll.
fn write_remainder(fd: i32, mut rest: &[u8]) -> bool {
    let mut retries = 10;
    while !rest.is_empty() {
        let n = unsafe {
            libc::send(fd, rest.as_ptr() as *const libc::c_void,
                       rest.len(),
                       libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL)
        };
        if n > 0 {
            rest = &rest[n as usize..];
            continue;
        }
        match util::errno() {
            libc::EINTR => continue,
            libc::EAGAIN if retries > 0 => {
                retries -= 1;
                let mut pfd = libc::pollfd {
                    fd,
                    events: libc::POLLOUT,
                    revents: 0,
                };
                unsafe { libc::poll(&mut pfd, 1, 1000) };
            }
            _ => return false,
        }
    }
    true
}

// Transmit a batch. Each slice starts with its 4-byte length prefix;
// the count of frames fully handed to the kernel is returned, and the
// callers advance sequence state for those frames only.
pub fn send_frames(tap: &mut Tap, mode: Mode, frames: &[&[u8]]) -> usize {
    if tap.fd < 0 || frames.is_empty() {
        return 0;
    }
    match mode {
        Mode::Stream => send_frames_stream(tap, frames),
        Mode::Ns => send_frames_ns(tap, frames),
    }
}

fn tap_tx_reset(tap: &mut Tap) {
    unsafe { libc::close(tap.fd) };
    tap.fd = -1;
}

fn send_frames_stream(tap: &mut Tap, frames: &[&[u8]]) -> usize {
    let mut sent = 0;
    for chunk in frames.chunks(SEND_IOV_MAX) {
        let mut iov: [libc::iovec; SEND_IOV_MAX] = unsafe { mem::zeroed() };
        let mut total = 0;
        for (i, f) in chunk.iter().enumerate() {
            iov[i] = libc::iovec {
                iov_base: f.as_ptr() as *mut libc::c_void,
                iov_len: f.len(),
            };
            total += f.len();
        }
        let mut mh: libc::msghdr = unsafe { mem::zeroed() };
        mh.msg_iov = iov.as_mut_ptr();
        mh.msg_iovlen = chunk.len() as _;
        let n = unsafe {
            libc::sendmsg(tap.fd, &mh,
                          libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL)
        };
        if n < 0 {
            match util::errno() {
                libc::EAGAIN | libc::EINTR => return sent,
                _ => { tap_tx_reset(tap); return sent; }
            }
        }
        let mut left = n as usize;
        for f in chunk {
            if left >= f.len() {
                left -= f.len();
                sent += 1;
            } else if left > 0 {
                // Frame boundary inside a partial write.
                if write_remainder(tap.fd, &f[left..]) {
                    sent += 1;
                } else {
                    tap_tx_reset(tap);
                }
                return sent;
            } else {
                return sent;
            }
        }
        if (n as usize) < total {
            return sent;
        }
    }
    sent
}

fn send_frames_ns(tap: &mut Tap, frames: &[&[u8]]) -> usize {
    let mut sent = 0;
    for f in frames {
        let payload = &f[VNET_LEN..];
        let n = unsafe {
            libc::write(tap.fd, payload.as_ptr() as *const libc::c_void,
                        payload.len())
        };
        if n < 0 {
            match util::errno() {
                libc::EINTR => continue,
                _ => return sent,
            }
        }
        sent += 1;
    }
    sent
}

pub fn send_one(tap: &mut Tap, mode: Mode, frame: &[u8]) -> bool {
    send_frames(tap, mode, &[frame]) == 1
}

#[cfg(test)]
mod selftest {
    use super::*;

    fn framed(payloads: &[&[u8]]) -> Vec<u8> {
        let mut buf = Vec::new();
        for p in payloads {
            let mut len = [0u8; 4];
            BigEndian::write_u32(&mut len, p.len() as u32);
            buf.extend_from_slice(&len);
            buf.extend_from_slice(p);
        }
        buf
    }

    #[test]
    fn scan_whole_frames() {
        let f1 = [1u8; 14];
        let f2 = [2u8; 60];
        let buf = framed(&[&f1, &f2]);
        let mut pool = packet::Pool::new();
        let consumed = stream_scan(&buf, 0, buf.len(), &mut pool).unwrap();
        assert_eq!(consumed, buf.len());
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.get(&buf, 0).unwrap(), &f1[..]);
        assert_eq!(pool.get(&buf, 1).unwrap(), &f2[..]);
    }

    #[test]
    fn scan_partial_frame_trails() {
        let f1 = [1u8; 20];
        let f2 = [2u8; 40];
        let buf = framed(&[&f1, &f2]);
        // Cut mid-way through the second frame.
        let cut = 4 + 20 + 4 + 10;
        let mut pool = packet::Pool::new();
        let consumed = stream_scan(&buf, 0, cut, &mut pool).unwrap();
        assert_eq!(consumed, 4 + 20);
        assert_eq!(pool.len(), 1);
        // The remainder plus the rest completes the frame.
        let consumed2 =
            stream_scan(&buf, consumed, buf.len(), &mut pool).unwrap();
        assert_eq!(consumed2, buf.len());
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn scan_partial_prefix_trails() {
        let f1 = [3u8; 14];
        let buf = framed(&[&f1]);
        let mut pool = packet::Pool::new();
        // Only 2 bytes of the length prefix arrived.
        let consumed = stream_scan(&buf, 0, 2, &mut pool).unwrap();
        assert_eq!(consumed, 0);
        assert_eq!(pool.len(), 0);
    }

    #[test]
    fn scan_rejects_bad_length() {
        let mut buf = vec![0u8; 8];
        BigEndian::write_u32(&mut buf, (MAX_L2_FRAME + 1) as u32);
        let mut pool = packet::Pool::new();
        assert!(stream_scan(&buf, 0, buf.len(), &mut pool).is_err());
        BigEndian::write_u32(&mut buf, 5); // shorter than an L2 header
        assert!(stream_scan(&buf, 0, buf.len(), &mut pool).is_err());
    }

    #[test]
    fn prefix_write() {
        let mut frame = vec![0u8; 4 + 60];
        frame_prefix(&mut frame);
        assert_eq!(BigEndian::read_u32(&frame[..4]), 60);
    }
}
