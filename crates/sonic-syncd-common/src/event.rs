//! Typed kernel events produced by the netlink event source
//!
//! The event source only decodes; interpretation belongs to the daemon
//! handlers registered with the [`Dispatcher`](crate::dispatcher::Dispatcher).

use std::net::IpAddr;

/// Dispatch key of a kernel message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// RTM_NEWLINK (notification or dump reply)
    NewLink,
    /// RTM_DELLINK
    DelLink,
    /// IPCTNL_MSG_CT_NEW (new, update or dump reply)
    ConntrackNew,
    /// IPCTNL_MSG_CT_DELETE
    ConntrackDelete,
    /// NLMSG_DONE closing a dump
    DumpDone,
}

/// Decoded kernel notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelEvent {
    NewLink(LinkEvent),
    DelLink(LinkEvent),
    ConntrackNew(ConntrackEvent),
    ConntrackDelete(ConntrackEvent),
    /// End of the dump answering request `sequence`.
    DumpDone { sequence: u32 },
}

impl KernelEvent {
    /// Dispatch key of this event.
    pub fn kind(&self) -> EventKind {
        match self {
            KernelEvent::NewLink(_) => EventKind::NewLink,
            KernelEvent::DelLink(_) => EventKind::DelLink,
            KernelEvent::ConntrackNew(_) => EventKind::ConntrackNew,
            KernelEvent::ConntrackDelete(_) => EventKind::ConntrackDelete,
            KernelEvent::DumpDone { .. } => EventKind::DumpDone,
        }
    }
}

/// Link attributes carried by RTM_NEWLINK/RTM_DELLINK.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkEvent {
    pub ifindex: u32,
    pub ifname: String,
    /// IFLA_INFO_KIND (e.g. "team", "bond", "vlan")
    pub kind: Option<String>,
    /// IFLA_MASTER
    pub master: Option<u32>,
    /// IFF_UP
    pub admin_up: bool,
    /// IFF_LOWER_UP or IFF_RUNNING
    pub oper_up: bool,
    pub mtu: Option<u32>,
}

impl LinkEvent {
    /// Convenience constructor used by tests and fakes.
    pub fn new(ifindex: u32, ifname: impl Into<String>) -> Self {
        Self {
            ifindex,
            ifname: ifname.into(),
            ..Default::default()
        }
    }

    pub fn is_team(&self) -> bool {
        self.kind.as_deref() == Some("team")
    }
}

/// Connection tracking status bits (linux/netfilter/nf_conntrack_common.h)
pub mod ct_status {
    pub const IPS_EXPECTED: u32 = 1 << 0;
    pub const IPS_SEEN_REPLY: u32 = 1 << 1;
    pub const IPS_ASSURED: u32 = 1 << 2;
    pub const IPS_CONFIRMED: u32 = 1 << 3;
    pub const IPS_SRC_NAT: u32 = 1 << 4;
    pub const IPS_DST_NAT: u32 = 1 << 5;
    pub const IPS_SRC_NAT_DONE: u32 = 1 << 7;
    pub const IPS_DST_NAT_DONE: u32 = 1 << 8;
    pub const IPS_DYING: u32 = 1 << 9;
}

/// IP protocol numbers understood by the NAT projection.
pub mod ip_proto {
    pub const ICMP: u8 = 1;
    pub const TCP: u8 = 6;
    pub const UDP: u8 = 17;
}

/// One direction of a conntrack entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConntrackTuple {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
}

/// Conntrack entry carried by IPCTNL_MSG_CT_NEW/IPCTNL_MSG_CT_DELETE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConntrackEvent {
    pub protocol: u8,
    pub orig: ConntrackTuple,
    pub reply: ConntrackTuple,
    pub status: u32,
    pub id: Option<u32>,
}

impl ConntrackEvent {
    pub fn has_status(&self, bits: u32) -> bool {
        self.status & bits == bits
    }

    pub fn is_snat(&self) -> bool {
        self.has_status(ct_status::IPS_SRC_NAT)
    }

    pub fn is_dnat(&self) -> bool {
        self.has_status(ct_status::IPS_DST_NAT)
    }
}

/// Netlink multicast groups a daemon may subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetlinkGroup {
    /// RTNLGRP_LINK
    Link,
    /// NFNLGRP_CONNTRACK_NEW
    ConntrackNew,
    /// NFNLGRP_CONNTRACK_UPDATE
    ConntrackUpdate,
    /// NFNLGRP_CONNTRACK_DESTROY
    ConntrackDestroy,
}

impl NetlinkGroup {
    /// Group number passed to NETLINK_ADD_MEMBERSHIP.
    pub fn id(&self) -> u32 {
        match self {
            NetlinkGroup::Link => 1,
            NetlinkGroup::ConntrackNew => 1,
            NetlinkGroup::ConntrackUpdate => 2,
            NetlinkGroup::ConntrackDestroy => 3,
        }
    }
}

/// Full-state dump a daemon can request from the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpKind {
    /// RTM_GETLINK
    Links,
    /// IPCTNL_MSG_CT_GET
    Conntrack,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tuple(src: &str, sport: u16, dst: &str, dport: u16) -> ConntrackTuple {
        ConntrackTuple {
            src: src.parse().unwrap(),
            dst: dst.parse().unwrap(),
            src_port: Some(sport),
            dst_port: Some(dport),
        }
    }

    #[test]
    fn test_event_kind() {
        let link = LinkEvent::new(5, "PortChannel1");
        assert_eq!(KernelEvent::NewLink(link.clone()).kind(), EventKind::NewLink);
        assert_eq!(KernelEvent::DelLink(link).kind(), EventKind::DelLink);
        assert_eq!(
            KernelEvent::DumpDone { sequence: 7 }.kind(),
            EventKind::DumpDone
        );
    }

    #[test]
    fn test_conntrack_nat_flags() {
        let ev = ConntrackEvent {
            protocol: ip_proto::TCP,
            orig: tuple("192.168.1.10", 4000, "8.8.8.8", 53),
            reply: tuple("8.8.8.8", 53, "65.55.42.1", 1024),
            status: ct_status::IPS_SRC_NAT | ct_status::IPS_CONFIRMED,
            id: None,
        };
        assert!(ev.is_snat());
        assert!(!ev.is_dnat());
        assert!(ev.has_status(ct_status::IPS_CONFIRMED));
    }

    #[test]
    fn test_group_ids() {
        assert_eq!(NetlinkGroup::Link.id(), 1);
        assert_eq!(NetlinkGroup::ConntrackDestroy.id(), 3);
    }
}
