//! # Route Table Backend
//!
//! A `SingleVarBackend` over an in-memory route, the shape every routing
//! table hands to the filter: destination prefix, next hop, metric and the
//! policy tags attached by earlier filters. Only the policy tags are
//! writable.

use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::element::{ElemSet, ElemType, Element};
use crate::net::{Ipv4Net, Ipv6Net};
use crate::single_varrw::{SingleVarBackend, SingleVarRW, VarInit};
use crate::varrw::VarId;

/// Destination prefix of a route
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteNet {
    V4(Ipv4Net),
    V6(Ipv6Net),
}

/// One route as stored by a routing table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteEntry {
    pub net: RouteNet,
    pub nexthop: IpAddr,
    pub metric: u32,
    #[serde(default)]
    pub policytags: BTreeSet<u32>,
}

impl RouteEntry {
    pub fn v4(net: Ipv4Net, nexthop: Ipv4Addr, metric: u32) -> Self {
        Self {
            net: RouteNet::V4(net),
            nexthop: IpAddr::V4(nexthop),
            metric,
            policytags: BTreeSet::new(),
        }
    }

    pub fn v6(net: Ipv6Net, nexthop: Ipv6Addr, metric: u32) -> Self {
        Self {
            net: RouteNet::V6(net),
            nexthop: IpAddr::V6(nexthop),
            metric,
            policytags: BTreeSet::new(),
        }
    }

    /// Adds policy tags (builder style)
    pub fn with_tags(mut self, tags: impl IntoIterator<Item = u32>) -> Self {
        self.policytags.extend(tags);
        self
    }

    fn tags_element(&self) -> Option<Element> {
        let tags = self.policytags.iter().map(|t| Element::U32(*t));
        ElemSet::from_elements(ElemType::U32, tags).ok().map(Element::Set)
    }
}

/// Route variables beyond the reserved ids
pub mod var {
    use crate::varrw::VarId;

    pub const NETWORK4: VarId = VarId::protocol(0);
    pub const NEXTHOP4: VarId = VarId::protocol(1);
    pub const NETWORK6: VarId = VarId::protocol(2);
    pub const NEXTHOP6: VarId = VarId::protocol(3);
    pub const METRIC: VarId = VarId::protocol(4);
}

/// Backend exposing one `RouteEntry` to the filter
#[derive(Debug, Clone)]
pub struct RouteBackend {
    route: RouteEntry,
    trace: bool,
    commits: usize,
}

/// VarRW over a single route
pub type RouteVarRW = SingleVarRW<RouteBackend>;

impl RouteBackend {
    pub fn new(route: RouteEntry) -> Self {
        Self {
            route,
            trace: true,
            commits: 0,
        }
    }

    /// Allows or vetoes tracing for this route
    pub fn with_trace(mut self, allowed: bool) -> Self {
        self.trace = allowed;
        self
    }

    pub fn route(&self) -> &RouteEntry {
        &self.route
    }

    /// Points the backend at another route
    pub fn set_route(&mut self, route: RouteEntry) {
        self.route = route;
    }

    /// Number of write batches applied to the route
    pub fn commits(&self) -> usize {
        self.commits
    }
}

impl SingleVarBackend for RouteBackend {
    fn start_read(&mut self, init: &mut VarInit<'_>) {
        init.initialize(VarId::POLICYTAGS, self.route.tags_element());
        init.initialize(var::METRIC, Some(Element::U32(self.route.metric)));
    }

    fn single_read(&mut self, id: VarId) -> Option<Element> {
        match (id, self.route.net, self.route.nexthop) {
            (var::NETWORK4, RouteNet::V4(net), _) => Some(Element::Ipv4Net(net)),
            (var::NETWORK6, RouteNet::V6(net), _) => Some(Element::Ipv6Net(net)),
            (var::NEXTHOP4, _, IpAddr::V4(addr)) => Some(Element::Ipv4(addr)),
            (var::NEXTHOP6, _, IpAddr::V6(addr)) => Some(Element::Ipv6(addr)),
            _ => None,
        }
    }

    fn single_write(&mut self, id: VarId, value: &Element) {
        if id != VarId::POLICYTAGS {
            warn!("Ignoring write to read-only route variable {}", id);
            return;
        }

        match value.as_set() {
            Some(set) if set.member_type() == ElemType::U32 => {
                self.route.policytags = set.iter().filter_map(Element::as_u32).collect();
            }
            _ => warn!(
                "Ignoring policy tags of type {}, expected set_u32",
                value.type_name()
            ),
        }
    }

    fn end_write(&mut self) {
        self.commits += 1;
    }

    fn trace_allowed(&self) -> bool {
        self.trace
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::varrw::VarRW;

    fn v4_route() -> RouteEntry {
        RouteEntry::v4("10.0.0.0/8".parse().unwrap(), Ipv4Addr::new(192, 0, 2, 1), 3)
            .with_tags([1, 2])
    }

    #[test]
    fn reads_route_attributes() {
        let mut rw = RouteVarRW::new(RouteBackend::new(v4_route()));
        assert_eq!(rw.read(var::METRIC), Element::U32(3));
        assert_eq!(rw.read(var::NETWORK4).str(), "10.0.0.0/8");
        assert_eq!(rw.read(var::NEXTHOP4).str(), "192.0.2.1");
        assert_eq!(rw.read(VarId::POLICYTAGS).str(), "1,2");
        assert_eq!(rw.read(var::NETWORK6), Element::Null);
        assert_eq!(rw.read(var::NEXTHOP6), Element::Null);
    }

    #[test]
    fn ipv6_route_hides_ipv4_variables() {
        let route = RouteEntry::v6("2001:db8::/32".parse().unwrap(), "fe80::1".parse().unwrap(), 1);
        let mut rw = RouteVarRW::new(RouteBackend::new(route));
        assert_eq!(rw.read(var::NETWORK4), Element::Null);
        assert_eq!(rw.read(var::NETWORK6).type_name(), "ipv6net");
        assert_eq!(rw.read(VarId::POLICYTAGS).type_name(), "set_u32");
    }

    #[test]
    fn only_policy_tags_are_written() {
        let mut rw = RouteVarRW::new(RouteBackend::new(v4_route()));
        let tags = ElemSet::from_elements(ElemType::U32, [Element::U32(7)]).unwrap();
        rw.write(VarId::POLICYTAGS, Element::Set(tags));
        rw.write(var::METRIC, Element::U32(100));
        rw.sync();

        let backend = rw.backend();
        assert_eq!(backend.commits(), 1);
        assert_eq!(backend.route().policytags, BTreeSet::from([7]));
        assert_eq!(backend.route().metric, 3);
    }

    #[test]
    fn trace_veto() {
        let rw = RouteVarRW::new(RouteBackend::new(v4_route()).with_trace(false));
        assert!(!rw.trace_allowed());
    }

    #[test]
    fn route_json() {
        let json = serde_json::to_string(&v4_route()).unwrap();
        let back: RouteEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, v4_route());
    }
}
