use super::bitmap::PortBitmap;
use super::ctx::{Ctx, Mode};

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::os::unix::io::FromRawFd;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};

// PORT FORWARDING
//
// Which ports cross the boundary, and under what name. Four
// independent directions exist (TCP/UDP x inbound/outbound), each with
// a mode, a port bitmap, and signed remap deltas:
//
//   delta[port]  - offset applied to the destination port on forward
//   rdelta[port] - precomputed inverse, so return traffic maps back:
//                  rdelta[p + delta[p]] = (65536 - delta[p]) mod 65536
//
// AUTO mode scans /proc/net/{tcp,tcp6,udp,udp6} (per namespace, with
// cached descriptors) for listening or unconnected-bound sockets and
// rebinds: newly-set ports open sockets, newly-cleared ports close
// them. The opposite direction's map acts as an exclusion so a port
// the translator itself bound is not re-forwarded into a loop.
//
//   FwdMode, FwdPorts - configuration model
//   FwdPorts.set_spec(port, mapped) - SPEC mode entry
//   FwdPorts.mapped(port) -> u16 - forward-direction port translation
//   FwdPorts.reverse(port) -> u16 - return-direction translation
//   scan_listening(fd_cached, map, exclude) - one procfs pass
//   timer_handler(ctx) - periodic rescan and rebind

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FwdMode {
    None,
    Spec,
    Auto,
    All,
}

pub struct FwdPorts {
    pub mode: FwdMode,
    pub map: PortBitmap,
    delta: Box<[u16]>,
    rdelta: Box<[u16]>,
}

impl FwdPorts {
    pub fn new() -> FwdPorts {
        FwdPorts {
            mode: FwdMode::None,
            map: PortBitmap::new(),
            delta: vec![0u16; 65536].into_boxed_slice(),
            rdelta: vec![0u16; 65536].into_boxed_slice(),
        }
    }

    pub fn set_all(&mut self) {
        self.mode = FwdMode::All;
        for port in 1..=65535u16 {
            self.map.set(port);
        }
    }

    // SPEC mode: forward `port`, delivered locally as `mapped`.
    pub fn set_spec(&mut self, port: u16, mapped: Option<u16>) {
        self.mode = FwdMode::Spec;
        self.map.set(port);
        let delta = mapped
            .map(|m| m.wrapping_sub(port))
            .unwrap_or(0);
        self.delta[port as usize] = delta;
        self.rdelta[port.wrapping_add(delta) as usize] = 0u16.wrapping_sub(delta);
    }

    pub fn mapped(&self, port: u16) -> u16 {
        port.wrapping_add(self.delta[port as usize])
    }

    pub fn reverse(&self, port: u16) -> u16 {
        port.wrapping_add(self.rdelta[port as usize])
    }
}

// /proc/net/tcp lines:
//   sl  local_address rem_address   st ...
//    0: 0100007F:1F90 00000000:0000 0A ...
// The local port and state are all the scanner needs.
static PROC_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^ *\d+: [0-9A-Fa-f]{8,32}:([0-9A-Fa-f]{4}) [0-9A-Fa-f]{8,32}:[0-9A-Fa-f]{4} ([0-9A-Fa-f]{2})"
    ).unwrap()
});

const TCP_LISTEN: u8 = 0x0a;
const UDP_UNCONNECTED: u8 = 0x07;

pub fn parse_proc_line(line: &str, want_state: u8) -> Option<u16> {
    let cap = PROC_LINE.captures(line)?;
    let state = u8::from_str_radix(&cap[2], 16).ok()?;
    if state != want_state {
        return None;
    }
    u16::from_str_radix(&cap[1], 16).ok()
}

// One pass over a cached /proc/net file: set bits for bound ports,
// except those in the exclusion map.
fn scan_file(file: &mut File, want_state: u8, map: &mut PortBitmap,
             exclude: &PortBitmap) {
    if file.seek(SeekFrom::Start(0)).is_err() {
        return;
    }
    let mut contents = String::new();
    if file.read_to_string(&mut contents).is_err() {
        return;
    }
    for line in contents.lines().skip(1) {
        if let Some(port) = parse_proc_line(line, want_state) {
            if !exclude.get(port) {
                map.set(port);
            }
        }
    }
}

// Cached descriptors for the scan files; the namespace's files are
// opened once via ns_call (the shared descriptor table makes them
// usable from the loop thread).
pub struct FwdCtx {
    pub scan_tcp: [Option<File>; 2],  // v4, v6
    pub scan_udp: [Option<File>; 2],
}

impl FwdCtx {
    pub fn new() -> FwdCtx {
        FwdCtx {
            scan_tcp: [None, None],
            scan_udp: [None, None],
        }
    }

    pub fn open_scan_fd(&mut self, tcp: bool, v6: bool, raw_fd: i32) {
        if raw_fd < 0 {
            return;
        }
        let file = unsafe { File::from_raw_fd(raw_fd) };
        if tcp {
            self.scan_tcp[v6 as usize] = Some(file);
        } else {
            self.scan_udp[v6 as usize] = Some(file);
        }
    }
}

// Periodic AUTO rescan: compute the target map, then rebind the
// difference against what is currently open.
pub fn timer_handler(ctx: &mut Ctx) {
    if ctx.tcp.fwd_in.mode == FwdMode::Auto {
        rescan_rebind_tcp(ctx);
    }
    if ctx.udp.fwd_in.mode == FwdMode::Auto {
        rescan_rebind_udp(ctx);
    }
}

fn rescan_rebind_tcp(ctx: &mut Ctx) {
    let mut target = PortBitmap::new();
    for v6 in [false, true] {
        if let Some(f) = &mut ctx.fwd.scan_tcp[v6 as usize] {
            scan_file(f, TCP_LISTEN, &mut target, &ctx.tcp.fwd_out.map);
        }
    }
    let current = ctx.tcp.fwd_in.map.clone();
    for port in target.iter() {
        if !current.get(port) {
            ctx.tcp.fwd_in.map.set(port);
            tcp_rebind_open(ctx, port);
        }
    }
    for port in current.iter() {
        if !target.get(port) {
            ctx.tcp.fwd_in.map.clear(port);
            super::tcp::listen_sock_close(ctx, false, port);
            super::tcp::listen_sock_close(ctx, true, port);
            debug!("closed forward for TCP port {}", port);
        }
    }
}

fn tcp_rebind_open(ctx: &mut Ctx, port: u16) {
    for v6 in [false, true] {
        if v6 && ctx.ip6.addr.is_none() {
            continue;
        }
        if !v6 && ctx.ip4.addr.is_none() {
            continue;
        }
        if let Err(e) = super::tcp::listen_sock_init(ctx, v6, port) {
            warn!("cannot forward TCP port {} (v6={}): {}", port, v6, e);
        }
    }
}

fn rescan_rebind_udp(ctx: &mut Ctx) {
    let mut target = PortBitmap::new();
    for v6 in [false, true] {
        if let Some(f) = &mut ctx.fwd.scan_udp[v6 as usize] {
            scan_file(f, UDP_UNCONNECTED, &mut target,
                      &ctx.udp.fwd_out.map);
        }
    }
    let current = ctx.udp.fwd_in.map.clone();
    for port in target.iter() {
        if !current.get(port) {
            ctx.udp.fwd_in.map.set(port);
            udp_rebind_open(ctx, port);
        }
    }
    for port in current.iter() {
        if !target.get(port) {
            ctx.udp.fwd_in.map.clear(port);
            super::udp::bound_sock_close(ctx, false, port);
            super::udp::bound_sock_close(ctx, true, port);
            debug!("closed forward for UDP port {}", port);
        }
    }
}

fn udp_rebind_open(ctx: &mut Ctx, port: u16) {
    for v6 in [false, true] {
        if v6 && ctx.ip6.addr.is_none() {
            continue;
        }
        if !v6 && ctx.ip4.addr.is_none() {
            continue;
        }
        if let Err(e) = super::udp::bound_sock_init(ctx, v6, port) {
            warn!("cannot forward UDP port {} (v6={}): {}", port, v6, e);
        }
    }
}

// Initial binding pass at startup, for SPEC/ALL modes (AUTO waits for
// its first scan).
pub fn init_bind(ctx: &mut Ctx) {
    let tcp_ports: Vec<u16> = match ctx.tcp.fwd_in.mode {
        FwdMode::Spec | FwdMode::All => ctx.tcp.fwd_in.map.iter().collect(),
        _ => Vec::new(),
    };
    for port in tcp_ports {
        tcp_rebind_open(ctx, port);
    }
    let udp_ports: Vec<u16> = match ctx.udp.fwd_in.mode {
        FwdMode::Spec | FwdMode::All => ctx.udp.fwd_in.map.iter().collect(),
        _ => Vec::new(),
    };
    for port in udp_ports {
        udp_rebind_open(ctx, port);
    }
    // NS mode: outbound forwarded ports bind inside the peer namespace
    // so namespace-local loopback servers are reachable from the host
    // side without L2 round trips.
    if ctx.mode == Mode::Ns {
        let out_ports: Vec<u16> = match ctx.udp.fwd_out.mode {
            FwdMode::Spec | FwdMode::All =>
                ctx.udp.fwd_out.map.iter().collect(),
            _ => Vec::new(),
        };
        for port in out_ports {
            for v6 in [false, true] {
                if let Err(e) = super::udp::ns_bound_sock_init(ctx, v6, port)
                {
                    warn!("cannot bind UDP port {} in namespace: {}",
                          port, e);
                }
            }
        }
    }
}

#[cfg(test)]
mod selftest {
    use super::*;

    #[test]
    fn proc_line_parsing() {
        let listen =
            "   0: 0100007F:1F90 00000000:0000 0A 00000000:00000000 \
             00:00000000 00000000  1000        0 12345 1 0000000000000000";
        assert_eq!(parse_proc_line(listen, TCP_LISTEN), Some(0x1f90));
        assert_eq!(parse_proc_line(listen, UDP_UNCONNECTED), None);
        let v6 = "   3: 00000000000000000000000000000000:0035 \
                  00000000000000000000000000000000:0000 07 00000000:00000000 \
                  00:00000000 00000000   101        0 2222 2";
        assert_eq!(parse_proc_line(v6, UDP_UNCONNECTED), Some(53));
        assert_eq!(parse_proc_line("sl local rem st", TCP_LISTEN), None);
    }

    #[test]
    fn rdelta_involution() {
        let mut f = FwdPorts::new();
        f.set_spec(8080, Some(80));
        f.set_spec(2222, Some(22));
        f.set_spec(53, None);
        for port in f.map.iter() {
            let fwd = f.mapped(port);
            assert_eq!(f.reverse(fwd), port,
                       "reverse(mapped({})) != identity", port);
        }
        assert_eq!(f.mapped(8080), 80);
        assert_eq!(f.reverse(80), 8080);
        assert_eq!(f.mapped(53), 53);
    }

    #[test]
    fn rdelta_invariant_explicit() {
        // rdelta[p + delta[p]] = (65536 - delta[p]) mod 65536
        let mut f = FwdPorts::new();
        f.set_spec(8080, Some(80));
        let d = 80u16.wrapping_sub(8080);
        assert_eq!(f.delta[8080], d);
        assert_eq!(f.rdelta[80], 0u16.wrapping_sub(d));
    }

    #[test]
    fn all_mode_excludes_port_zero() {
        let mut f = FwdPorts::new();
        f.set_all();
        assert!(!f.map.get(0));
        assert!(f.map.get(1));
        assert!(f.map.get(65535));
        assert_eq!(f.map.count(), 65535);
    }
}
