use super::ctx::{Ctx, Error, Mode, Result};
use super::epollref::{self, ERef, RefType};
use super::flow;
use super::fwd;
use super::icmp;
use super::netns;
use super::tap;
use super::tcp;
use super::tcp_buf;
use super::udp;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

// EVENT LOOP
//
// One epoll set drives the whole translator. Each wakeup:
//
//   1. drain up to EPOLL_EVENTS_MAX ready descriptors, dispatching each
//      strictly by the type tag of its packed reference;
//   2. run the deferred handlers: flush batched TCP frames to the tap,
//      then the per-flow deferred pass (retire closed flows, merge free
//      clusters) and, when FLOW_TIMER_INTERVAL has elapsed, the
//      periodic timers (UDP binding expiry, socket pool refill,
//      forwarded-port rescan);
//   3. advance coarse time once per iteration.
//
// Handlers receive (ctx, ref, events, now) and never re-enter the loop;
// epoll ADD/MOD/DEL calls are the only coordination between them.
//
//   run(&mut Ctx, &mut TapRx, &quit) - run until quit, error, or exit
//   FLOW_TIMER_INTERVAL - periodic timer granularity

pub const FLOW_TIMER_INTERVAL: Duration = Duration::from_millis(1000);

pub fn run(ctx: &mut Ctx, rx: &mut tap::TapRx, quit: &Arc<AtomicBool>)
           -> Result<()> {
    let mut events = epollref::event_buf();
    let mut last_timer = Instant::now();
    loop {
        if quit.load(Ordering::Relaxed) {
            debug!("quit requested, exiting loop");
            return Ok(());
        }
        let nready = unsafe {
            libc::epoll_wait(ctx.epfd, events.as_mut_ptr(),
                             epollref::EPOLL_EVENTS_MAX as i32,
                             FLOW_TIMER_INTERVAL.as_millis() as i32)
        };
        if nready == -1 {
            if super::util::errno() == libc::EINTR {
                continue;
            }
            return Err(Error::Sys(std::io::Error::last_os_error()));
        }
        let now = Instant::now();
        for ev in events.iter().take(nready as usize) {
            let eref = match ERef::unpack(ev.u64) {
                Some(r) => r,
                None => {
                    warn!("dropping event with invalid reference");
                    continue;
                }
            };
            match dispatch(ctx, rx, eref, ev.events, now) {
                Ok(()) => {}
                Err(Error::NamespaceGone) => {
                    debug!("peer namespace gone, exiting");
                    return Ok(());
                }
                Err(Error::TapDisconnected)
                    if ctx.mode == Mode::Ns || ctx.one_off =>
                {
                    return Err(Error::TapDisconnected);
                }
                Err(e) => {
                    // Data-path errors recover locally; the offending
                    // flow is gone, the loop continues.
                    trace!("handler error: {}", e);
                }
            }
        }
        tcp_buf::flush(ctx);
        let timers_due = now.duration_since(last_timer) >= FLOW_TIMER_INTERVAL;
        flow::defer_handler(ctx, now, timers_due);
        if timers_due {
            udp::timer_handler(ctx, now);
            tcp::defer_handler(ctx);
            fwd::timer_handler(ctx);
            report(ctx);
            last_timer = now;
        }
    }
}

fn dispatch(ctx: &mut Ctx, rx: &mut tap::TapRx, eref: ERef, events: u32,
            now: Instant) -> Result<()> {
    match eref.ty {
        RefType::Tcp => { tcp::sock_handler(ctx, eref, events, now); Ok(()) }
        RefType::TcpSplice => {
            tcp::splice_sock_handler(ctx, eref, events);
            Ok(())
        }
        RefType::TcpListen => { tcp::listen_handler(ctx, eref, now); Ok(()) }
        RefType::TcpTimer => { tcp::timer_handler(ctx, eref, now); Ok(()) }
        RefType::Udp => { udp::sock_handler(ctx, eref, events, now); Ok(()) }
        RefType::Ping => { icmp::sock_handler(ctx, eref, now); Ok(()) }
        RefType::NsQuitInotify => netns::quit_inotify_handler(ctx),
        RefType::NsQuitTimer => netns::quit_timer_handler(ctx),
        RefType::TapNs => tap::handler_ns(ctx, rx, events, now),
        RefType::TapStream => tap::handler_stream(ctx, rx, events, now),
        RefType::TapListen => tap::listen_handler(ctx, now),
    }
}

// Periodic activity summary, visible with debug logging enabled.
fn report(ctx: &Ctx) {
    debug!(
        flows = ctx.flows.active(),
        tcp_conns = ctx.cnt.tcp_conns,
        udp_binds = ctx.cnt.udp_binds,
        icmp_flows = ctx.cnt.icmp_flows,
        frag_drops = ctx.cnt.frag_drops,
        proto_drops = ctx.cnt.proto_drops,
        flow_full_drops = ctx.cnt.flow_full_drops,
        "engine tick"
    );
}

#[cfg(test)]
mod selftest {
    use super::*;

    #[test]
    fn timer_interval_is_one_second() {
        assert_eq!(FLOW_TIMER_INTERVAL, Duration::from_millis(1000));
    }
}
