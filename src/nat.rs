use super::ctx::Ctx;
use super::inany::InAny;

use std::net::{Ipv4Addr, Ipv6Addr};

// ADDRESS REWRITING POLICY
//
// Every packet crossing the boundary passes through these rewrites:
//
//   Inbound SNAT: remote addresses that are loopback, or the address
//   the host knows the guest by, are presented to the guest as the
//   gateway, so host-originated traffic appears to come from the
//   router rather than from an address the guest considers its own.
//
//   Gateway mapping: the guest addressing the gateway reaches the
//   host's loopback, so host services answer.
//
//   DNS redirect: a configured match address is substituted with the
//   real resolver on the way out; replies are substituted back by the
//   UDP engine.
//
// Applying any of these twice is a no-op.
//
//   snat_inbound(ctx, addr) -> InAny
//   tap_dst(ctx, dst, dport) -> InAny - combined outbound rewrite
//   dns_redirect(ctx, dst, dport) -> Option<InAny>

pub fn snat_inbound(ctx: &Ctx, addr: InAny) -> InAny {
    match addr.v4() {
        Some(a) => {
            if a.is_loopback() || a == ctx.ip4.addr_seen
                || Some(a) == ctx.ip4.addr
            {
                InAny::from_v4(ctx.ip4.gw)
            } else {
                addr
            }
        }
        None => {
            let a = addr.v6();
            if a == Ipv6Addr::LOCALHOST || a == ctx.ip6.addr_seen
                || Some(a) == ctx.ip6.addr
            {
                // Present the router: the gateway when it is itself
                // link-local, our link-local otherwise.
                if InAny::from_v6(ctx.ip6.gw).is_linklocal() {
                    InAny::from_v6(ctx.ip6.gw)
                } else {
                    InAny::from_v6(ctx.ip6.addr_ll)
                }
            } else {
                addr
            }
        }
    }
}

pub fn dns_redirect(ctx: &Ctx, dst: &InAny, dport: u16) -> Option<InAny> {
    if dport != 53 {
        return None;
    }
    match dst.v4() {
        Some(a) => {
            if Some(a) == ctx.ip4.dns_match {
                ctx.ip4.dns_host.map(InAny::from_v4)
            } else {
                None
            }
        }
        None => {
            if Some(dst.v6()) == ctx.ip6.dns_match {
                ctx.ip6.dns_host.map(InAny::from_v6)
            } else {
                None
            }
        }
    }
}

fn is_gw(ctx: &Ctx, dst: &InAny) -> bool {
    match dst.v4() {
        Some(a) => !ctx.ip4.gw.is_unspecified() && a == ctx.ip4.gw,
        None => {
            let a = dst.v6();
            (!ctx.ip6.gw.is_unspecified() && a == ctx.ip6.gw)
                || (a == ctx.ip6.addr_ll
                    && a != Ipv6Addr::UNSPECIFIED)
        }
    }
}

// Outbound destination rewrite for connections and datagrams leaving
// the guest: DNS redirect wins, then gateway-to-loopback mapping.
pub fn tap_dst(ctx: &Ctx, dst: &InAny, dport: u16) -> InAny {
    if let Some(redirected) = dns_redirect(ctx, dst, dport) {
        return redirected;
    }
    if is_gw(ctx, dst) {
        let map = if dst.is_v4() { ctx.ip4.map_gw } else { ctx.ip6.map_gw };
        if map {
            return if dst.is_v4() {
                InAny::from_v4(Ipv4Addr::LOCALHOST)
            } else {
                InAny::from_v6(Ipv6Addr::LOCALHOST)
            };
        }
    }
    *dst
}

#[cfg(test)]
mod selftest {
    use super::*;
    use super::super::ctx::{Ip4Ctx, Ip6Ctx, Mode};

    fn test_ctx() -> Ctx {
        let mut ip4 = Ip4Ctx::default();
        ip4.addr = Some(Ipv4Addr::new(10, 0, 2, 15));
        ip4.addr_seen = Ipv4Addr::new(10, 0, 2, 15);
        ip4.gw = Ipv4Addr::new(10, 0, 2, 2);
        ip4.dns_match = Some(Ipv4Addr::new(10, 0, 2, 3));
        ip4.dns_host = Some(Ipv4Addr::new(1, 1, 1, 1));
        let mut ip6 = Ip6Ctx::default();
        ip6.addr = Some("2001:db8::15".parse().unwrap());
        ip6.addr_seen = "2001:db8::15".parse().unwrap();
        ip6.gw = "fe80::1".parse().unwrap();
        ip6.addr_ll = "fe80::1".parse().unwrap();
        Ctx::new(Mode::Stream, ip4, ip6, 1500)
    }

    #[test]
    fn snat_loopback_becomes_gateway() {
        let ctx = test_ctx();
        let lo = InAny::from_v4(Ipv4Addr::LOCALHOST);
        let snat = snat_inbound(&ctx, lo);
        assert_eq!(snat.v4(), Some(Ipv4Addr::new(10, 0, 2, 2)));
        // addr_seen is also reflected
        let seen = InAny::from_v4(Ipv4Addr::new(10, 0, 2, 15));
        assert_eq!(snat_inbound(&ctx, seen).v4(),
                   Some(Ipv4Addr::new(10, 0, 2, 2)));
        // an unrelated remote is untouched
        let remote = InAny::from_v4(Ipv4Addr::new(192, 0, 2, 5));
        assert_eq!(snat_inbound(&ctx, remote), remote);
    }

    #[test]
    fn snat_is_idempotent() {
        let ctx = test_ctx();
        for addr in [
            InAny::from_v4(Ipv4Addr::LOCALHOST),
            InAny::from_v4(Ipv4Addr::new(10, 0, 2, 15)),
            InAny::from_v4(Ipv4Addr::new(192, 0, 2, 5)),
            InAny::from_v6(Ipv6Addr::LOCALHOST),
        ] {
            let once = snat_inbound(&ctx, addr);
            let twice = snat_inbound(&ctx, once);
            assert_eq!(once, twice, "SNAT must be idempotent for {}", addr);
        }
    }

    #[test]
    fn snat_v6_linklocal_gateway() {
        let ctx = test_ctx();
        let lo = InAny::from_v6(Ipv6Addr::LOCALHOST);
        // gw is link-local here, so the gateway itself is presented
        assert_eq!(snat_inbound(&ctx, lo).v6(),
                   "fe80::1".parse::<Ipv6Addr>().unwrap());
    }

    #[test]
    fn gateway_maps_to_loopback() {
        let ctx = test_ctx();
        let gw = InAny::from_v4(Ipv4Addr::new(10, 0, 2, 2));
        assert_eq!(tap_dst(&ctx, &gw, 80).v4(), Some(Ipv4Addr::LOCALHOST));
        let mut ctx2 = test_ctx();
        ctx2.ip4.map_gw = false;
        assert_eq!(tap_dst(&ctx2, &gw, 80), gw);
    }

    #[test]
    fn dns_redirect_applies() {
        let ctx = test_ctx();
        let dns = InAny::from_v4(Ipv4Addr::new(10, 0, 2, 3));
        assert_eq!(tap_dst(&ctx, &dns, 53).v4(),
                   Some(Ipv4Addr::new(1, 1, 1, 1)));
        // only on port 53
        assert_eq!(tap_dst(&ctx, &dns, 80), dns);
        // unrelated destinations pass through
        let other = InAny::from_v4(Ipv4Addr::new(8, 8, 8, 8));
        assert_eq!(tap_dst(&ctx, &other, 53), other);
    }
}
