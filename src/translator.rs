use super::ctx::{Ctx, Error, Ip4Ctx, Ip6Ctx, Mode};
use super::engine;
use super::epollref;
use super::fwd::{self, FwdPorts};
use super::netns;
use super::tap;
use super::tcp;
use super::util;

use std::env;
use std::error;
use std::fs::File;
use std::io::BufReader;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::process;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde::Serialize;
use signal_hook::consts::signal::*;
use signal_hook::flag as signal_flag;
use tracing::{error, info};

// STARTUP AND WIRING
//
// Reads the JSON spec, builds the context, opens the tap transport for
// the requested mode, binds forwarded ports, and hands control to the
// event loop. Exits cleanly on SIGTERM/SIGINT, on the peer namespace
// disappearing, and (in one-off stream mode) on tap disconnect.

pub fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() != 2 {
        println!("Invalid number of arguments.");
        print_usage(&args[0]);
        process::exit(1);
    }
    let spec = match read_spec(&args[1]) {
        Ok(spec) => spec,
        Err(e) => {
            error!("failed to read {}: {}", &args[1], e);
            process::exit(1);
        }
    };
    match run(&spec) {
        Ok(()) => process::exit(0),
        Err(e) => {
            error!("{}", e);
            process::exit(1);
        }
    }
}

fn run(spec: &Spec) -> Result<(), Error> {
    let mode = match spec.mode.as_str() {
        "stream" => Mode::Stream,
        "ns" => Mode::Ns,
        other => {
            return Err(Error::Config(format!("unknown mode {:?}", other)));
        }
    };
    let mut ctx = Ctx::new(mode, ip4_ctx(spec), ip6_ctx(spec), spec.mtu);
    ctx.one_off = spec.one_off;
    ctx.ifname_out = spec.outbound_interface.clone();

    ctx.epfd = epollref::fd_guard(unsafe {
        libc::epoll_create1(libc::EPOLL_CLOEXEC)
    })?;

    parse_ports(&spec.tcp_ports_in, &mut ctx.tcp.fwd_in)?;
    parse_ports(&spec.tcp_ports_out, &mut ctx.tcp.fwd_out)?;
    parse_ports(&spec.udp_ports_in, &mut ctx.udp.fwd_in)?;
    parse_ports(&spec.udp_ports_out, &mut ctx.udp.fwd_out)?;

    match mode {
        Mode::Stream => {
            tap::sock_unix_init(&mut ctx, spec.socket_path.as_deref())?;
        }
        Mode::Ns => {
            let target = spec.netns.as_deref().ok_or_else(|| {
                Error::Config("ns mode needs a netns pid or path".into())
            })?;
            netns::open_ns(&mut ctx.netns, target, spec.netns_only)?;
            let ifname = spec.tap_interface.as_deref().unwrap_or("lo");
            tap::ns_tun_init(&mut ctx, ifname)?;
            netns::quit_watch_init(&mut ctx)?;
            open_scan_fds(&mut ctx);
        }
    }

    tcp::sock_pool_refill(&mut ctx);
    ctx.update_l2_bufs();
    fwd::init_bind(&mut ctx);

    let pid_file = spec.pid_file.clone();
    if let Some(path) = &pid_file {
        std::fs::write(path, format!("{}\n", process::id()))
            .map_err(Error::Sys)?;
    }

    let quit = Arc::new(AtomicBool::new(false));
    for sig in [SIGTERM, SIGINT] {
        signal_flag::register(sig, Arc::clone(&quit))
            .map_err(Error::Sys)?;
    }

    info!("ready in {:?} mode", mode);
    let mut rx = tap::TapRx::new();
    let result = engine::run(&mut ctx, &mut rx, &quit);
    if let Some(path) = &pid_file {
        let _ = std::fs::remove_file(path);
    }
    result
}

// AUTO port discovery scans the peer namespace's /proc. The files are
// opened inside the namespace once; the shared descriptor table makes
// them readable (and rewindable) from the loop.
fn open_scan_fds(ctx: &mut Ctx) {
    let auto_tcp = ctx.tcp.fwd_in.mode == fwd::FwdMode::Auto;
    let auto_udp = ctx.udp.fwd_in.mode == fwd::FwdMode::Auto;
    if !auto_tcp && !auto_udp {
        return;
    }
    let paths = [
        (true, false, "/proc/net/tcp"),
        (true, true, "/proc/net/tcp6"),
        (false, false, "/proc/net/udp"),
        (false, true, "/proc/net/udp6"),
    ];
    for (is_tcp, v6, path) in paths {
        if (is_tcp && !auto_tcp) || (!is_tcp && !auto_udp) {
            continue;
        }
        let cpath = util::cstr(path);
        let fd = netns::ns_call(&ctx.netns, &mut || {
            let fd = unsafe {
                libc::open(cpath.as_ptr(),
                           libc::O_RDONLY | libc::O_CLOEXEC)
            };
            if fd < 0 { -util::errno() } else { fd }
        }).unwrap_or(-1);
        if fd >= 0 {
            ctx.fwd.open_scan_fd(is_tcp, v6, fd);
        }
    }
}

fn ip4_ctx(spec: &Spec) -> Ip4Ctx {
    let mut ip4 = Ip4Ctx::default();
    if let Some(s) = &spec.ipv4 {
        ip4.addr = Some(s.address);
        ip4.addr_seen = s.address;
        ip4.gw = s.gateway;
        ip4.dns = s.dns.clone();
        ip4.dns_match = s.dns_match;
        ip4.dns_host = s.dns_host;
        ip4.addr_out = s.outbound;
        ip4.map_gw = !s.no_map_gw;
    }
    ip4
}

fn ip6_ctx(spec: &Spec) -> Ip6Ctx {
    let mut ip6 = Ip6Ctx::default();
    if let Some(s) = &spec.ipv6 {
        ip6.addr = Some(s.address);
        ip6.addr_seen = s.address;
        ip6.gw = s.gateway;
        ip6.addr_ll = s.link_local;
        ip6.dns = s.dns.clone();
        ip6.dns_match = s.dns_match;
        ip6.dns_host = s.dns_host;
        ip6.addr_out = s.outbound;
        ip6.map_gw = !s.no_map_gw;
    }
    ip6
}

// Port specifications: "none", "auto", "all", or entries of the form
// "80", "2000-2010", "8080:80" (forwarded port, delivered locally on a
// different one).
static PORT_SYNTAX: Lazy<Regex> = Lazy::new(
    || Regex::new(r"^(\d+)(?:-(\d+))?(?::(\d+))?$").unwrap());

fn parse_ports(specs: &[String], fwd: &mut FwdPorts) -> Result<(), Error> {
    for s in specs {
        match s.as_str() {
            "none" => {}
            "auto" => { fwd.mode = fwd::FwdMode::Auto; }
            "all" => { fwd.set_all(); }
            _ => {
                let cap = PORT_SYNTAX.captures(s).ok_or_else(|| {
                    Error::Config(format!("bad port spec {:?}", s))
                })?;
                let parse = |m: &regex::Match| -> Result<u16, Error> {
                    m.as_str().parse().map_err(|_| {
                        Error::Config(format!("bad port in {:?}", s))
                    })
                };
                let start = parse(&cap.get(1).unwrap())?;
                let end = match cap.get(2) {
                    Some(m) => parse(&m)?,
                    None => start,
                };
                let mapped = match cap.get(3) {
                    Some(m) => Some(parse(&m)?),
                    None => None,
                };
                if end < start {
                    return Err(Error::Config(
                        format!("bad port range {:?}", s)));
                }
                for (i, port) in (start..=end).enumerate() {
                    fwd.set_spec(port,
                                 mapped.map(|m| m.wrapping_add(i as u16)));
                }
            }
        }
    }
    Ok(())
}

// CONFIGURATION FORMAT

fn default_mtu() -> u16 { 1500 }

#[derive(Serialize, Deserialize)]
pub struct Spec {
    pub mode: String,
    #[serde(default)]
    pub socket_path: Option<String>,
    #[serde(default)]
    pub tap_interface: Option<String>,
    #[serde(default)]
    pub netns: Option<String>,
    #[serde(default)]
    pub netns_only: bool,
    #[serde(default)]
    pub one_off: bool,
    #[serde(default)]
    pub pid_file: Option<String>,
    #[serde(default = "default_mtu")]
    pub mtu: u16,
    #[serde(default)]
    pub ipv4: Option<SpecV4>,
    #[serde(default)]
    pub ipv6: Option<SpecV6>,
    #[serde(default)]
    pub outbound_interface: Option<String>,
    #[serde(default)]
    pub tcp_ports_in: Vec<String>,
    #[serde(default)]
    pub tcp_ports_out: Vec<String>,
    #[serde(default)]
    pub udp_ports_in: Vec<String>,
    #[serde(default)]
    pub udp_ports_out: Vec<String>,
}

#[derive(Serialize, Deserialize)]
pub struct SpecV4 {
    pub address: Ipv4Addr,
    pub gateway: Ipv4Addr,
    #[serde(default)]
    pub dns: Vec<Ipv4Addr>,
    #[serde(default)]
    pub dns_match: Option<Ipv4Addr>,
    #[serde(default)]
    pub dns_host: Option<Ipv4Addr>,
    #[serde(default)]
    pub outbound: Option<Ipv4Addr>,
    #[serde(default)]
    pub no_map_gw: bool,
}

#[derive(Serialize, Deserialize)]
pub struct SpecV6 {
    pub address: Ipv6Addr,
    pub gateway: Ipv6Addr,
    pub link_local: Ipv6Addr,
    #[serde(default)]
    pub dns: Vec<Ipv6Addr>,
    #[serde(default)]
    pub dns_match: Option<Ipv6Addr>,
    #[serde(default)]
    pub dns_host: Option<Ipv6Addr>,
    #[serde(default)]
    pub outbound: Option<Ipv6Addr>,
    #[serde(default)]
    pub no_map_gw: bool,
}

fn read_spec(path: &str) -> Result<Spec, Box<dyn error::Error>> {
    let file = File::open(path)?;
    let spec = serde_json::from_reader(BufReader::new(file))?;
    Ok(spec)
}

fn print_usage(exe: &str) {
    println!("Usage: {} <spec.json>", exe);
    let spec = Spec {
        mode: "stream".to_string(),
        socket_path: None,
        tap_interface: None,
        netns: None,
        netns_only: false,
        one_off: false,
        pid_file: Some("/run/tapnat.pid".to_string()),
        mtu: 1500,
        ipv4: Some(SpecV4 {
            address: Ipv4Addr::new(10, 0, 2, 15),
            gateway: Ipv4Addr::new(10, 0, 2, 2),
            dns: vec![Ipv4Addr::new(10, 0, 2, 3)],
            dns_match: Some(Ipv4Addr::new(10, 0, 2, 3)),
            dns_host: Some(Ipv4Addr::new(1, 1, 1, 1)),
            outbound: None,
            no_map_gw: false,
        }),
        ipv6: None,
        outbound_interface: None,
        tcp_ports_in: vec!["22".to_string(), "8080:80".to_string()],
        tcp_ports_out: vec!["none".to_string()],
        udp_ports_in: vec!["auto".to_string()],
        udp_ports_out: vec!["none".to_string()],
    };
    println!("Example config for <spec.json>: {}",
             serde_json::to_string_pretty(&spec).unwrap());
}

#[cfg(test)]
mod selftest {
    use super::*;

    #[test]
    fn port_spec_parsing() {
        let mut f = FwdPorts::new();
        parse_ports(&["22".to_string(), "8080:80".to_string(),
                      "2000-2002".to_string()], &mut f).unwrap();
        assert!(f.map.get(22) && f.map.get(8080));
        assert!(f.map.get(2000) && f.map.get(2001) && f.map.get(2002));
        assert_eq!(f.mapped(8080), 80);
        assert_eq!(f.mapped(22), 22);
        assert!(parse_ports(&["nonsense".to_string()],
                            &mut FwdPorts::new()).is_err());
        assert!(parse_ports(&["9-5".to_string()],
                            &mut FwdPorts::new()).is_err());
    }

    #[test]
    fn range_with_remap() {
        let mut f = FwdPorts::new();
        parse_ports(&["2000-2002:3000".to_string()], &mut f).unwrap();
        assert_eq!(f.mapped(2000), 3000);
        assert_eq!(f.mapped(2001), 3001);
        assert_eq!(f.mapped(2002), 3002);
        assert_eq!(f.reverse(3001), 2001);
    }

    #[test]
    fn spec_roundtrip() {
        let json = r#"{
            "mode": "ns",
            "netns": "/run/netns/peer",
            "tap_interface": "lo",
            "ipv4": {
                "address": "192.168.1.10",
                "gateway": "192.168.1.1"
            },
            "tcp_ports_in": ["auto"],
            "udp_ports_in": ["auto"]
        }"#;
        let spec: Spec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.mode, "ns");
        assert_eq!(spec.mtu, 1500);
        assert!(!spec.one_off);
        let v4 = spec.ipv4.unwrap();
        assert_eq!(v4.address, Ipv4Addr::new(192, 168, 1, 10));
        assert!(v4.dns.is_empty());
    }
}
