use super::ctx::Ctx;
use super::inany::InAny;
use super::icmp;
use super::siphash::SipFeed;
use super::tcp;

use std::time::Instant;

// FLOW TABLE
//
// Fixed-size table of flows (TCP connections, spliced connections, ICMP
// echo exchanges), addressed by compact indices that fit in an epoll
// reference payload. Free slots form clusters: a maximal run of unused
// adjacent slots stores its length and the index of the next cluster in
// the slot at its lowest index, and cluster indices strictly increase
// along the chain, which terminates at FLOW_MAX. Allocation is O(1) off
// the chain head; freeing happens in the deferred scan, which merges
// adjacent clusters as it rebuilds the chain.
//
// A linear-probing hash index keyed by {remote address, local port,
// remote port} maps incoming tap packets to flow sides. Probing steps
// downward; removal back-shifts displaced entries so probe sequences
// stay unbroken.
//
//   FlowTable - table, free chain, hash index
//   FlowTable.alloc() -> Option<usize> - take the slot at the chain head
//   FlowTable.alloc_cancel(idx) - undo the allocation just made
//   FlowTable.hash_insert/hash_lookup/hash_remove - index operations
//   FlowTable.rebuild_free_chain() - merge clusters, restore invariant
//   defer_handler(ctx, now, run_timers) - per-variant defer hooks + GC

pub const FLOW_MAX: usize = 8192;
// >= FLOW_MAX * 100 / 70, kept power-of-two so bucket math is a mask.
pub const HASH_SIZE: usize = 16384;

const SIDX_NONE: u32 = u32::MAX;

pub const SOCKSIDE: usize = 0;
pub const TAPSIDE: usize = 1;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum Pif {
    None = 0,
    Tap = 1,
    Host = 2,
    Splice = 3,
}

impl Default for Pif {
    fn default() -> Pif { Pif::None }
}

impl Pif {
    pub fn from_u8(v: u8) -> Pif {
        match v {
            1 => Pif::Tap,
            2 => Pif::Host,
            3 => Pif::Splice,
            _ => Pif::None,
        }
    }
}

// One side of a flow: the endpoint we exchange packets with, and the
// address/port we present on the other side of the translation.
#[derive(Clone, Copy, Default)]
pub struct FlowSide {
    pub pif: Pif,
    pub eaddr: InAny,
    pub eport: u16,
    pub faddr: InAny,
    pub fport: u16,
}

#[derive(Clone, Copy, Default)]
pub struct FlowCommon {
    pub side: [FlowSide; 2],
}

pub enum Flow {
    Free { n: u32, next: u32 },
    Tcp(tcp::TcpFlow),
    TcpSplice(tcp::SpliceFlow),
    Ping4(icmp::PingFlow),
    Ping6(icmp::PingFlow),
}

#[derive(Clone, Copy, PartialEq, Debug)]
pub enum Kind {
    Free,
    Tcp,
    TcpSplice,
    Ping,
}

impl Flow {
    pub fn kind(&self) -> Kind {
        match self {
            Flow::Free { .. } => Kind::Free,
            Flow::Tcp(_) => Kind::Tcp,
            Flow::TcpSplice(_) => Kind::TcpSplice,
            Flow::Ping4(_) | Flow::Ping6(_) => Kind::Ping,
        }
    }

    pub fn common(&self) -> Option<&FlowCommon> {
        match self {
            Flow::Free { .. } => None,
            Flow::Tcp(f) => Some(&f.common),
            Flow::TcpSplice(f) => Some(&f.common),
            Flow::Ping4(f) | Flow::Ping6(f) => Some(&f.common),
        }
    }

    // Key the hash index sees for this flow: the tap-side view, since
    // lookups happen on packets arriving from the tap.
    pub fn hash_key(&self) -> Option<(InAny, u16, u16)> {
        match self {
            Flow::Tcp(f) => {
                let s = &f.common.side[TAPSIDE];
                Some((s.faddr, s.eport, s.fport))
            }
            Flow::Ping4(f) | Flow::Ping6(f) => {
                let s = &f.common.side[TAPSIDE];
                Some((s.faddr, s.eport, s.fport))
            }
            _ => None,
        }
    }
}

pub fn sidx(flow: usize, side: usize) -> u32 {
    (flow as u32) << 1 | side as u32
}

pub fn sidx_flow(sidx: u32) -> usize {
    (sidx >> 1) as usize
}

pub struct FlowTable {
    pub entries: Vec<Flow>,
    pub first_free: u32,
    hash: Vec<u32>,
}

impl FlowTable {
    pub fn new() -> FlowTable {
        let mut entries = Vec::with_capacity(FLOW_MAX);
        entries.push(Flow::Free { n: FLOW_MAX as u32, next: FLOW_MAX as u32 });
        for _ in 1..FLOW_MAX {
            entries.push(Flow::Free { n: 0, next: FLOW_MAX as u32 });
        }
        FlowTable {
            entries,
            first_free: 0,
            hash: vec![SIDX_NONE; HASH_SIZE],
        }
    }

    pub fn kind(&self, idx: usize) -> Kind {
        self.entries[idx].kind()
    }

    pub fn active(&self) -> usize {
        self.entries.iter()
            .filter(|e| !matches!(e, Flow::Free { .. }))
            .count()
    }

    // Take the slot at the head of the free chain. The caller must
    // write a variant into the returned slot before the loop re-enters,
    // or call alloc_cancel() on it.
    pub fn alloc(&mut self) -> Option<usize> {
        let idx = self.first_free as usize;
        if idx >= FLOW_MAX {
            return None;
        }
        let (n, next) = match self.entries[idx] {
            Flow::Free { n, next } => (n, next),
            _ => panic!("flow table corruption: head {} not free", idx),
        };
        if n > 1 {
            self.entries[idx + 1] = Flow::Free { n: n - 1, next };
            self.first_free = idx as u32 + 1;
        } else {
            self.first_free = next;
        }
        Some(idx)
    }

    // Undo the allocation just made: the slot becomes a one-slot
    // cluster ahead of the current head, which keeps the chain
    // strictly ascending because alloc() only ever moves the head up.
    pub fn alloc_cancel(&mut self, idx: usize) {
        debug_assert!((idx as u32) < self.first_free);
        self.entries[idx] = Flow::Free { n: 1, next: self.first_free };
        self.first_free = idx as u32;
    }

    fn hash_bucket(&self, secret: &[u8; 16],
                   faddr: &InAny, eport: u16, fport: u16) -> usize {
        let mut feed = SipFeed::new(secret);
        feed.feed_bytes(&faddr.0)
            .feed((eport as u64) << 16 | fport as u64);
        (feed.finish() % HASH_SIZE as u64) as usize
    }

    fn entry_matches(&self, sidx: u32,
                     faddr: &InAny, eport: u16, fport: u16) -> bool {
        match self.entries[sidx_flow(sidx)].hash_key() {
            Some((a, e, f)) => a == *faddr && e == eport && f == fport,
            None => false,
        }
    }

    fn mod_sub(a: usize, b: usize) -> usize {
        (a + HASH_SIZE - b) % HASH_SIZE
    }

    // x within the half-open cyclic interval [s, b), walking upward.
    fn mod_between(x: usize, s: usize, b: usize) -> bool {
        Self::mod_sub(x, s) < Self::mod_sub(b, s)
    }

    // Find the key, or the bucket where it would be inserted.
    pub fn hash_probe(&self, secret: &[u8; 16],
                      faddr: &InAny, eport: u16, fport: u16)
                      -> Result<u32, usize> {
        let mut b = self.hash_bucket(secret, faddr, eport, fport);
        loop {
            let s = self.hash[b];
            if s == SIDX_NONE {
                return Err(b);
            }
            if self.entry_matches(s, faddr, eport, fport) {
                return Ok(s);
            }
            b = Self::mod_sub(b, 1);
        }
    }

    pub fn hash_lookup(&self, secret: &[u8; 16],
                       faddr: &InAny, eport: u16, fport: u16)
                       -> Option<usize> {
        self.hash_probe(secret, faddr, eport, fport)
            .ok()
            .map(sidx_flow)
    }

    pub fn hash_insert(&mut self, secret: &[u8; 16], sidx: u32) {
        let (faddr, eport, fport) = match self.entries[sidx_flow(sidx)]
            .hash_key()
        {
            Some(k) => k,
            None => return,
        };
        if let Err(b) = self.hash_probe(secret, &faddr, eport, fport) {
            self.hash[b] = sidx;
        }
    }

    // Robin-Hood back-shift: after clearing the slot, walk down the
    // probe direction and pull up any entry whose ideal bucket cannot
    // reach it past the new hole.
    pub fn hash_remove(&mut self, secret: &[u8; 16], sidx: u32) {
        let (faddr, eport, fport) = match self.entries[sidx_flow(sidx)]
            .hash_key()
        {
            Some(k) => k,
            None => return,
        };
        let mut b = match self.hash_probe(secret, &faddr, eport, fport) {
            Ok(found) if found == sidx => {
                // probe again for the bucket index
                let mut bb = self.hash_bucket(secret, &faddr, eport, fport);
                while self.hash[bb] != sidx {
                    bb = Self::mod_sub(bb, 1);
                }
                bb
            }
            _ => return,
        };
        self.hash[b] = SIDX_NONE;
        let mut s = Self::mod_sub(b, 1);
        while self.hash[s] != SIDX_NONE {
            let moved = self.hash[s];
            let (fa, ep, fp) = match self.entries[sidx_flow(moved)]
                .hash_key()
            {
                Some(k) => k,
                None => break,
            };
            let h = self.hash_bucket(secret, &fa, ep, fp);
            if !Self::mod_between(h, s, b) {
                self.hash[b] = moved;
                self.hash[s] = SIDX_NONE;
                b = s;
            }
            s = Self::mod_sub(s, 1);
        }
    }

    // Rewrite the free chain in one linear pass: adjacent free slots
    // collapse into single clusters, cluster heads carry (length, next),
    // and next links strictly ascend, terminating at FLOW_MAX.
    pub fn rebuild_free_chain(&mut self) {
        let mut first_free = FLOW_MAX as u32;
        let mut prev_head: Option<usize> = None;
        let mut run_start: Option<usize> = None;
        for idx in 0..=FLOW_MAX {
            let free = idx < FLOW_MAX
                && matches!(self.entries[idx], Flow::Free { .. });
            if free {
                if run_start.is_none() {
                    run_start = Some(idx);
                }
            } else if let Some(start) = run_start.take() {
                self.entries[start] = Flow::Free {
                    n: (idx - start) as u32,
                    next: FLOW_MAX as u32,
                };
                match prev_head {
                    Some(p) => {
                        if let Flow::Free { next, .. } = &mut self.entries[p] {
                            *next = start as u32;
                        }
                    }
                    None => first_free = start as u32,
                }
                prev_head = Some(start);
            }
        }
        self.first_free = first_free;
    }

    // Free-chain consistency: ascending clusters, lengths in range,
    // and lengths plus active entries covering the table.
    #[cfg(test)]
    fn check_free_chain(&self) {
        let mut idx = self.first_free as usize;
        let mut prev = None;
        let mut free_total = 0;
        while idx < FLOW_MAX {
            if let Some(p) = prev {
                assert!(idx > p, "free chain not ascending");
            }
            let (n, next) = match self.entries[idx] {
                Flow::Free { n, next } => (n as usize, next as usize),
                _ => panic!("free chain head {} not free", idx),
            };
            assert!(n >= 1 && idx + n <= FLOW_MAX);
            free_total += n;
            prev = Some(idx);
            idx = next;
        }
        assert_eq!(idx, FLOW_MAX, "chain must terminate at FLOW_MAX");
        assert_eq!(free_total + self.active(), FLOW_MAX);
    }
}

// Deferred per-flow pass, run once per loop iteration after dispatch:
// per-variant defer hooks retire closed flows, then the chain rebuild
// merges the freed slots. Periodic per-flow timers (ICMP expiry) only
// run when the flow timer interval has elapsed.
pub fn defer_handler(ctx: &mut Ctx, now: Instant, run_timers: bool) {
    let mut freed_any = false;
    for idx in 0..FLOW_MAX {
        let closed = match ctx.flows.kind(idx) {
            Kind::Free => continue,
            Kind::Tcp => tcp::flow_defer(ctx, idx),
            Kind::TcpSplice => tcp::splice_flow_defer(ctx, idx),
            Kind::Ping => icmp::flow_defer(ctx, idx, now, run_timers),
        };
        if closed {
            ctx.flows.entries[idx] = Flow::Free {
                n: 1,
                next: FLOW_MAX as u32,
            };
            freed_any = true;
        }
    }
    if freed_any {
        ctx.flows.rebuild_free_chain();
    }
}

#[cfg(test)]
mod selftest {
    use super::*;
    use std::net::Ipv4Addr;

    fn dummy_tcp(faddr: InAny, eport: u16, fport: u16) -> Flow {
        let mut f = tcp::TcpFlow::default();
        f.common.side[TAPSIDE].pif = Pif::Tap;
        f.common.side[TAPSIDE].faddr = faddr;
        f.common.side[TAPSIDE].eport = eport;
        f.common.side[TAPSIDE].fport = fport;
        Flow::Tcp(f)
    }

    fn addr(last: u8) -> InAny {
        InAny::from_v4(Ipv4Addr::new(192, 0, 2, last))
    }

    #[test]
    fn alloc_returns_head() {
        let mut t = FlowTable::new();
        assert_eq!(t.alloc(), Some(0));
        t.entries[0] = dummy_tcp(addr(1), 1, 1);
        assert_eq!(t.alloc(), Some(1));
        t.entries[1] = dummy_tcp(addr(2), 2, 2);
        assert_eq!(t.first_free, 2);
        t.check_free_chain();
    }

    #[test]
    fn alloc_cancel_restores_invariant() {
        let mut t = FlowTable::new();
        let a = t.alloc().unwrap();
        t.entries[a] = dummy_tcp(addr(1), 1, 1);
        let b = t.alloc().unwrap();
        t.alloc_cancel(b);
        assert_eq!(t.first_free as usize, b);
        t.check_free_chain();
        assert_eq!(t.alloc(), Some(b));
        t.entries[b] = dummy_tcp(addr(2), 2, 2);
        t.check_free_chain();
    }

    #[test]
    fn gc_merges_clusters() {
        let mut t = FlowTable::new();
        // Allocate flows A-E in slots 0..5.
        for i in 0..5 {
            let idx = t.alloc().unwrap();
            assert_eq!(idx, i);
            t.entries[idx] = dummy_tcp(addr(i as u8), i as u16, 80);
        }
        // Close B and D.
        t.entries[1] = Flow::Free { n: 1, next: FLOW_MAX as u32 };
        t.entries[3] = Flow::Free { n: 1, next: FLOW_MAX as u32 };
        t.rebuild_free_chain();
        t.check_free_chain();
        // Chain is [B, D, tail from E+1]: next alloc returns B.
        assert_eq!(t.first_free, 1);
        assert_eq!(t.alloc(), Some(1));
        t.entries[1] = dummy_tcp(addr(9), 9, 80);
        assert_eq!(t.alloc(), Some(3));
        t.entries[3] = dummy_tcp(addr(10), 10, 80);
        assert_eq!(t.alloc(), Some(5));
        t.alloc_cancel(5);
        t.check_free_chain();
    }

    #[test]
    fn gc_merges_adjacent_runs() {
        let mut t = FlowTable::new();
        for i in 0..6 {
            let idx = t.alloc().unwrap();
            t.entries[idx] = dummy_tcp(addr(i as u8), i as u16, 80);
        }
        // Free 1, 2, 3: they must merge into one cluster of length 3.
        for i in 1..4 {
            t.entries[i] = Flow::Free { n: 1, next: FLOW_MAX as u32 };
        }
        t.rebuild_free_chain();
        t.check_free_chain();
        match t.entries[1] {
            Flow::Free { n, next } => {
                assert_eq!(n, 3);
                assert_eq!(next, 6);
            }
            _ => panic!("slot 1 must head a free cluster"),
        }
    }

    #[test]
    fn hash_insert_lookup_remove() {
        let secret = [3u8; 16];
        let mut t = FlowTable::new();
        for i in 0..32u16 {
            let idx = t.alloc().unwrap();
            t.entries[idx] = dummy_tcp(addr(1), 1000 + i, 80);
            t.hash_insert(&secret, sidx(idx, TAPSIDE));
        }
        for i in 0..32u16 {
            let found = t.hash_lookup(&secret, &addr(1), 1000 + i, 80);
            assert_eq!(found, Some(i as usize));
        }
        assert_eq!(t.hash_lookup(&secret, &addr(1), 2000, 80), None);
        assert_eq!(t.hash_lookup(&secret, &addr(2), 1000, 80), None);
        // Remove half, the rest must stay reachable.
        for i in (0..32usize).step_by(2) {
            t.hash_remove(&secret, sidx(i, TAPSIDE));
        }
        for i in 0..32u16 {
            let found = t.hash_lookup(&secret, &addr(1), 1000 + i, 80);
            if i % 2 == 0 {
                assert_eq!(found, None);
            } else {
                assert_eq!(found, Some(i as usize));
            }
        }
    }

    #[test]
    fn hash_remove_insert_is_identity() {
        let secret = [7u8; 16];
        let mut t = FlowTable::new();
        for i in 0..8u16 {
            let idx = t.alloc().unwrap();
            t.entries[idx] = dummy_tcp(addr(5), 100 + i, 443);
            t.hash_insert(&secret, sidx(idx, TAPSIDE));
        }
        let before: Vec<u32> = t.hash.clone();
        t.hash_remove(&secret, sidx(3, TAPSIDE));
        t.hash_insert(&secret, sidx(3, TAPSIDE));
        // Table state identical modulo position of the re-added entry
        // within its own cluster: every key still resolves.
        for i in 0..8u16 {
            assert_eq!(t.hash_lookup(&secret, &addr(5), 100 + i, 443),
                       Some(i as usize));
        }
        assert_eq!(t.hash.iter().filter(|&&s| s != SIDX_NONE).count(),
                   before.iter().filter(|&&s| s != SIDX_NONE).count());
    }

    #[test]
    fn table_full() {
        let mut t = FlowTable::new();
        for i in 0..FLOW_MAX {
            let idx = t.alloc().unwrap();
            assert_eq!(idx, i);
            t.entries[idx] = dummy_tcp(addr(1), i as u16, 80);
        }
        assert_eq!(t.alloc(), None);
    }
}
