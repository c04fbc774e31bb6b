//! ctnetlink message decoding
//!
//! Conntrack notifications arrive on NETLINK_NETFILTER as
//! `nlmsghdr | nfgenmsg | attributes`. Only the attributes the NAT
//! projection needs are decoded: both tuples, the status word and the id.

use super::frame::{self, Attr, Attrs, Frame, NLM_F_DUMP, NLM_F_REQUEST};
use crate::error::{Result, SyncError};
use crate::event::{ConntrackEvent, ConntrackTuple, KernelEvent};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

pub const NFNL_SUBSYS_CTNETLINK: u16 = 1;

pub const IPCTNL_MSG_CT_NEW: u16 = 0;
pub const IPCTNL_MSG_CT_GET: u16 = 1;
pub const IPCTNL_MSG_CT_DELETE: u16 = 2;

const NFGENMSG_LEN: usize = 4;
const NFNETLINK_V0: u8 = 0;

const CTA_TUPLE_ORIG: u16 = 1;
const CTA_TUPLE_REPLY: u16 = 2;
const CTA_STATUS: u16 = 3;
const CTA_ID: u16 = 12;

const CTA_TUPLE_IP: u16 = 1;
const CTA_TUPLE_PROTO: u16 = 2;

const CTA_IP_V4_SRC: u16 = 1;
const CTA_IP_V4_DST: u16 = 2;
const CTA_IP_V6_SRC: u16 = 3;
const CTA_IP_V6_DST: u16 = 4;

const CTA_PROTO_NUM: u16 = 1;
const CTA_PROTO_SRC_PORT: u16 = 2;
const CTA_PROTO_DST_PORT: u16 = 3;

/// Netlink message type of a ctnetlink message.
pub fn message_type(msg: u16) -> u16 {
    (NFNL_SUBSYS_CTNETLINK << 8) | msg
}

/// Decode one NETLINK_NETFILTER frame.
///
/// Returns `Ok(None)` for other subsystems and for ctnetlink messages that
/// are not new/update/delete notifications.
pub fn decode(frame: &Frame<'_>) -> Result<Option<KernelEvent>> {
    let message_type = frame.header.message_type;
    if message_type >> 8 != NFNL_SUBSYS_CTNETLINK {
        return Ok(None);
    }

    let is_delete = match message_type & 0xff {
        IPCTNL_MSG_CT_NEW => false,
        IPCTNL_MSG_CT_DELETE => true,
        _ => return Ok(None),
    };

    let attrs = frame
        .payload
        .get(NFGENMSG_LEN..)
        .ok_or_else(|| SyncError::decode("conntrack", "missing nfgenmsg"))?;
    let event = parse_entry(attrs)?;

    Ok(Some(if is_delete {
        KernelEvent::ConntrackDelete(event)
    } else {
        KernelEvent::ConntrackNew(event)
    }))
}

fn parse_entry(buf: &[u8]) -> Result<ConntrackEvent> {
    let mut orig = None;
    let mut reply = None;
    let mut status = 0;
    let mut id = None;

    for attr in Attrs::new(buf) {
        let attr = attr?;
        match attr.kind {
            CTA_TUPLE_ORIG => orig = Some(parse_tuple(&attr)?),
            CTA_TUPLE_REPLY => reply = Some(parse_tuple(&attr)?),
            CTA_STATUS => status = attr.be_u32()?,
            CTA_ID => id = Some(attr.be_u32()?),
            _ => {}
        }
    }

    let (orig_proto, orig) = orig.ok_or_else(|| SyncError::decode("conntrack", "no original tuple"))?;
    let (_, reply) = reply.ok_or_else(|| SyncError::decode("conntrack", "no reply tuple"))?;

    Ok(ConntrackEvent {
        protocol: orig_proto,
        orig,
        reply,
        status,
        id,
    })
}

fn parse_tuple(attr: &Attr<'_>) -> Result<(u8, ConntrackTuple)> {
    let mut src = None;
    let mut dst = None;
    let mut protocol = None;
    let mut src_port = None;
    let mut dst_port = None;

    for child in attr.attrs() {
        let child = child?;
        match child.kind {
            CTA_TUPLE_IP => {
                for ip in child.attrs() {
                    let ip = ip?;
                    match ip.kind {
                        CTA_IP_V4_SRC => src = Some(parse_addr(&ip)?),
                        CTA_IP_V4_DST => dst = Some(parse_addr(&ip)?),
                        CTA_IP_V6_SRC => src = Some(parse_addr(&ip)?),
                        CTA_IP_V6_DST => dst = Some(parse_addr(&ip)?),
                        _ => {}
                    }
                }
            }
            CTA_TUPLE_PROTO => {
                for proto in child.attrs() {
                    let proto = proto?;
                    match proto.kind {
                        CTA_PROTO_NUM => protocol = Some(proto.u8()?),
                        CTA_PROTO_SRC_PORT => src_port = Some(proto.be_u16()?),
                        CTA_PROTO_DST_PORT => dst_port = Some(proto.be_u16()?),
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }

    match (src, dst, protocol) {
        (Some(src), Some(dst), Some(protocol)) => Ok((
            protocol,
            ConntrackTuple {
                src,
                dst,
                src_port,
                dst_port,
            },
        )),
        _ => Err(SyncError::decode("conntrack tuple", "incomplete tuple")),
    }
}

fn parse_addr(attr: &Attr<'_>) -> Result<IpAddr> {
    match attr.value.len() {
        4 => {
            let mut octets = [0u8; 4];
            octets.copy_from_slice(attr.value);
            Ok(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(attr.value);
            Ok(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        len => Err(SyncError::decode(
            "conntrack address",
            format!("unexpected length {}", len),
        )),
    }
}

/// IPv4 conntrack table dump request.
pub fn dump_request(sequence: u32) -> Vec<u8> {
    let nfgenmsg = [libc::AF_INET as u8, NFNETLINK_V0, 0, 0];
    frame::encode_request(
        message_type(IPCTNL_MSG_CT_GET),
        NLM_F_REQUEST | NLM_F_DUMP,
        sequence,
        &nfgenmsg,
    )
}
