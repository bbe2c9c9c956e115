use super::ctx::{Ctx, Error, Result};
use super::epollref::{self, ERef, RefType};
use super::util;

use std::io;
use std::mem;

use tracing::{debug, info};

// NAMESPACE ENTRY
//
// setns(2) is thread-affine and the loop thread must stay in the
// initial namespace, so every namespace-bound operation runs in a
// short-lived child created with clone(CLONE_VM | CLONE_VFORK |
// CLONE_FILES | SIGCHLD): the child enters the user and network
// namespaces, runs the callback, and exits; CLONE_VFORK blocks the
// parent until then, and the shared descriptor table makes any
// descriptor the callback opened usable from the loop.
//
// The peer namespace disappearing is a clean shutdown: an inotify
// watch on the directory holding the namespace file (with a timerfd
// stat fallback) turns the unlink into a quit event.
//
//   NsCtx - namespace descriptors and watch state
//   open_ns(ctx, pid_or_path, userns, netns_only) - attach
//   ns_call(ns, f) -> Result<i32> - run f() inside the peer namespace
//   quit_watch_init(ctx) - arm the unlink watch
//   quit_inotify_handler / quit_timer_handler - loop handlers

const NS_FN_STACK_SIZE: usize = 64 * 1024;

pub struct NsCtx {
    pub netns_fd: i32,
    pub userns_fd: i32,
    pub netns_only: bool,
    pub ns_path: Option<String>,
    inotify_fd: i32,
    quit_timer_fd: i32,
}

impl NsCtx {
    pub fn new() -> NsCtx {
        NsCtx {
            netns_fd: -1,
            userns_fd: -1,
            netns_only: false,
            ns_path: None,
            inotify_fd: -1,
            quit_timer_fd: -1,
        }
    }
}

// Attach to the peer namespace: a PID means /proc/<pid>/ns/net (and
// /proc/<pid>/ns/user first, unless netns-only), anything else is used
// as a path (e.g. /run/netns/<name>).
pub fn open_ns(ns: &mut NsCtx, target: &str, netns_only: bool)
               -> Result<()> {
    ns.netns_only = netns_only;
    let (net_path, user_path) = match target.parse::<u32>() {
        Ok(pid) => (format!("/proc/{}/ns/net", pid),
                    Some(format!("/proc/{}/ns/user", pid))),
        Err(_) => (target.to_string(), None),
    };
    let fd = unsafe {
        libc::open(util::cstr(&net_path).as_ptr(),
                   libc::O_RDONLY | libc::O_CLOEXEC)
    };
    ns.netns_fd = epollref::fd_guard(fd)?;
    if !netns_only {
        if let Some(up) = user_path {
            let fd = unsafe {
                libc::open(util::cstr(&up).as_ptr(),
                           libc::O_RDONLY | libc::O_CLOEXEC)
            };
            if fd >= 0 {
                ns.userns_fd = epollref::fd_guard(fd)?;
            }
        }
    }
    ns.ns_path = Some(net_path);
    Ok(())
}

struct NsCallArg<'a> {
    ns: &'a NsCtx,
    f: &'a mut dyn FnMut() -> i32,
    ret: i32,
}

extern "C" fn ns_call_trampoline(arg: *mut libc::c_void) -> libc::c_int {
    let arg = unsafe { &mut *(arg as *mut NsCallArg) };
    unsafe {
        if !arg.ns.netns_only && arg.ns.userns_fd >= 0 {
            libc::setns(arg.ns.userns_fd, libc::CLONE_NEWUSER);
        }
        if libc::setns(arg.ns.netns_fd, libc::CLONE_NEWNET) != 0 {
            arg.ret = -util::errno();
            return 0;
        }
    }
    arg.ret = (arg.f)();
    0
}

// Run f() with the calling process's namespaces swapped for the
// peer's, without moving the loop thread. The i32 the callback returns
// travels back through the shared address space.
pub fn ns_call(ns: &NsCtx, f: &mut dyn FnMut() -> i32) -> Result<i32> {
    if ns.netns_fd < 0 {
        return Err(Error::Sys(io::Error::from_raw_os_error(libc::EBADF)));
    }
    let mut arg = NsCallArg { ns, f, ret: i32::MIN };
    let mut stack = vec![0u8; NS_FN_STACK_SIZE];
    let top = unsafe {
        let raw = stack.as_mut_ptr().add(NS_FN_STACK_SIZE);
        raw.sub(raw as usize % 16)
    };
    let pid = unsafe {
        libc::clone(ns_call_trampoline, top as *mut libc::c_void,
                    libc::CLONE_VM | libc::CLONE_VFORK | libc::CLONE_FILES
                    | libc::SIGCHLD,
                    &mut arg as *mut _ as *mut libc::c_void)
    };
    if pid == -1 {
        return Err(Error::Sys(io::Error::last_os_error()));
    }
    let mut status = 0;
    unsafe { libc::waitpid(pid, &mut status, 0) };
    if arg.ret == i32::MIN {
        return Err(Error::Sys(io::Error::from_raw_os_error(libc::EIO)));
    }
    Ok(arg.ret)
}

// Watch for the namespace file being unlinked. inotify on the parent
// directory is the primary signal; where the path has no usable parent
// (e.g. /proc/<pid>/ns/net), a one-second stat timer stands in.
pub fn quit_watch_init(ctx: &mut Ctx) -> Result<()> {
    let path = match &ctx.netns.ns_path {
        Some(p) => p.clone(),
        None => return Ok(()),
    };
    if !path.starts_with("/proc/") {
        if let Some(dir) = std::path::Path::new(&path).parent() {
            let ifd = unsafe {
                libc::inotify_init1(libc::IN_NONBLOCK | libc::IN_CLOEXEC)
            };
            if let Ok(ifd) = epollref::fd_guard(ifd) {
                let wd = unsafe {
                    libc::inotify_add_watch(
                        ifd,
                        util::cstr(&dir.to_string_lossy()).as_ptr(),
                        libc::IN_DELETE | libc::IN_DELETE_SELF)
                };
                if wd >= 0 {
                    epollref::epoll_add(
                        ctx.epfd, libc::EPOLLIN as u32,
                        ERef::new(RefType::NsQuitInotify, ifd, 0))?;
                    ctx.netns.inotify_fd = ifd;
                    debug!("watching {} for namespace removal",
                           dir.display());
                    return Ok(());
                }
            }
        }
    }
    // stat fallback
    let tfd = unsafe {
        libc::timerfd_create(libc::CLOCK_MONOTONIC,
                             libc::TFD_NONBLOCK | libc::TFD_CLOEXEC)
    };
    let tfd = epollref::fd_guard(tfd)?;
    let spec = libc::itimerspec {
        it_interval: libc::timespec { tv_sec: 1, tv_nsec: 0 },
        it_value: libc::timespec { tv_sec: 1, tv_nsec: 0 },
    };
    unsafe { libc::timerfd_settime(tfd, 0, &spec, std::ptr::null_mut()) };
    epollref::epoll_add(ctx.epfd, libc::EPOLLIN as u32,
                        ERef::new(RefType::NsQuitTimer, tfd, 0))?;
    ctx.netns.quit_timer_fd = tfd;
    Ok(())
}

pub fn quit_inotify_handler(ctx: &mut Ctx) -> Result<()> {
    let name = match &ctx.netns.ns_path {
        Some(p) => std::path::Path::new(p)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        None => return Ok(()),
    };
    let mut buf = [0u8; 4096];
    let n = unsafe {
        libc::read(ctx.netns.inotify_fd,
                   buf.as_mut_ptr() as *mut libc::c_void, buf.len())
    };
    if n <= 0 {
        return Ok(());
    }
    let mut off = 0usize;
    while off + mem::size_of::<libc::inotify_event>() <= n as usize {
        let ev = unsafe {
            &*(buf[off..].as_ptr() as *const libc::inotify_event)
        };
        let name_off = off + mem::size_of::<libc::inotify_event>();
        let name_len = ev.len as usize;
        if ev.mask & libc::IN_DELETE_SELF != 0 {
            info!("namespace directory gone, exiting");
            return Err(Error::NamespaceGone);
        }
        if name_len > 0 && name_off + name_len <= n as usize {
            let raw = &buf[name_off..name_off + name_len];
            let end = raw.iter().position(|&b| b == 0).unwrap_or(name_len);
            if raw[..end] == *name.as_bytes() {
                info!("namespace {} gone, exiting", name);
                return Err(Error::NamespaceGone);
            }
        }
        off = name_off + name_len;
    }
    Ok(())
}

pub fn quit_timer_handler(ctx: &mut Ctx) -> Result<()> {
    let mut expirations: u64 = 0;
    unsafe {
        libc::read(ctx.netns.quit_timer_fd,
                   &mut expirations as *mut _ as *mut libc::c_void, 8);
    }
    if let Some(path) = &ctx.netns.ns_path {
        let mut st: libc::stat = unsafe { mem::zeroed() };
        let ret = unsafe {
            libc::stat(util::cstr(path).as_ptr(), &mut st)
        };
        if ret == -1 && util::errno() == libc::ENOENT {
            info!("namespace {} gone, exiting", path);
            return Err(Error::NamespaceGone);
        }
    }
    Ok(())
}

#[cfg(test)]
mod selftest {
    use super::*;

    // Validates the trampoline, stack handling and result passing with
    // our own network namespace as the setns target. Unprivileged
    // processes cannot setns even into their own namespace; the child
    // then reports EPERM through the shared return slot, which still
    // exercises the clone machinery.
    #[test]
    fn ns_call_runs_callback() {
        let mut ns = NsCtx::new();
        let fd = unsafe {
            libc::open(util::cstr("/proc/self/ns/net").as_ptr(),
                       libc::O_RDONLY | libc::O_CLOEXEC)
        };
        if fd < 0 {
            // No /proc in this environment; nothing to validate.
            return;
        }
        ns.netns_fd = fd;
        ns.netns_only = true;
        let mut x = 0;
        let ret = ns_call(&ns, &mut || { x += 42; 7 }).unwrap();
        if ret == 7 {
            assert_eq!(x, 42);
        } else {
            assert_eq!(ret, -libc::EPERM);
            assert_eq!(x, 0);
        }
        unsafe { libc::close(fd) };
    }

    #[test]
    fn ns_call_without_fd_fails() {
        let ns = NsCtx::new();
        assert!(ns_call(&ns, &mut || 0).is_err());
    }
}
