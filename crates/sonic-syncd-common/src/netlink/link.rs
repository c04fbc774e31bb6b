//! RTM_NEWLINK / RTM_DELLINK decoding (Linux only)

use super::frame::Frame;
use crate::error::{Result, SyncError};
use crate::event::{KernelEvent, LinkEvent};
use netlink_packet_core::{NetlinkMessage, NetlinkPayload};
use netlink_packet_route::RouteNetlinkMessage;
use netlink_packet_route::link::{InfoKind, LinkAttribute, LinkFlags, LinkInfo, LinkMessage};

pub const RTM_NEWLINK: u16 = 16;
pub const RTM_DELLINK: u16 = 17;
pub const RTM_GETLINK: u16 = 18;

/// `struct ifinfomsg` is 16 bytes; an all-zero one dumps every link.
const IFINFOMSG_LEN: usize = 16;

/// Decode one NETLINK_ROUTE frame.
///
/// Returns `Ok(None)` for route messages other than link add/remove.
pub fn decode(frame: &Frame<'_>) -> Result<Option<KernelEvent>> {
    if !matches!(frame.header.message_type, RTM_NEWLINK | RTM_DELLINK) {
        return Ok(None);
    }

    let msg = NetlinkMessage::<RouteNetlinkMessage>::deserialize(frame.bytes)
        .map_err(|e| SyncError::decode("link message", e.to_string()))?;

    match msg.payload {
        NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewLink(link)) => {
            Ok(Some(KernelEvent::NewLink(link_event(link))))
        }
        NetlinkPayload::InnerMessage(RouteNetlinkMessage::DelLink(link)) => {
            Ok(Some(KernelEvent::DelLink(link_event(link))))
        }
        _ => Ok(None),
    }
}

fn link_event(link: LinkMessage) -> LinkEvent {
    let flags = link.header.flags;
    let mut event = LinkEvent {
        ifindex: link.header.index,
        admin_up: flags.contains(LinkFlags::Up),
        oper_up: flags.contains(LinkFlags::LowerUp) || flags.contains(LinkFlags::Running),
        ..Default::default()
    };

    for attr in link.attributes {
        match attr {
            LinkAttribute::IfName(name) => event.ifname = name,
            LinkAttribute::Mtu(mtu) => event.mtu = Some(mtu),
            LinkAttribute::Controller(master) => event.master = Some(master),
            LinkAttribute::LinkInfo(infos) => {
                for info in infos {
                    if let LinkInfo::Kind(kind) = info {
                        event.kind = Some(kind_name(&kind));
                    }
                }
            }
            _ => {}
        }
    }
    event
}

fn kind_name(kind: &InfoKind) -> String {
    match kind {
        InfoKind::Bond => "bond".to_string(),
        InfoKind::Bridge => "bridge".to_string(),
        InfoKind::Vlan => "vlan".to_string(),
        InfoKind::Other(name) => name.clone(),
        other => format!("{:?}", other).to_lowercase(),
    }
}

/// Link table dump request.
pub fn dump_request(sequence: u32) -> Vec<u8> {
    super::frame::encode_request(
        RTM_GETLINK,
        super::frame::NLM_F_REQUEST | super::frame::NLM_F_DUMP,
        sequence,
        &[0u8; IFINFOMSG_LEN],
    )
}
