//! The `/aoo` address grammar.
//!
//! ```text
//! /aoo/src/<id>/{start,stop,data,ping,pong,invite,uninvite,message}
//! /aoo/sink/<id>/{start,stop,data,ping,pong,uninvite,message}
//! /aoo/peer/{ping,pong,message,ack}
//! /aoo/client/...
//! /aoo/server/...
//! /aoo/relay
//! ```

use crate::{Id, WireError, ID_INVALID, MSG_DOMAIN};

/// The addressee class of an AOO message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    Source,
    Sink,
    Peer,
    Client,
    Server,
    Relay,
}

pub const MSG_SOURCE: &str = "/src";
pub const MSG_SINK: &str = "/sink";
pub const MSG_PEER: &str = "/peer";
pub const MSG_CLIENT: &str = "/client";
pub const MSG_SERVER: &str = "/server";
pub const MSG_RELAY: &str = "/relay";

// streaming messages
pub const MSG_START: &str = "/start";
pub const MSG_STOP: &str = "/stop";
pub const MSG_DATA: &str = "/data";
pub const MSG_PING: &str = "/ping";
pub const MSG_PONG: &str = "/pong";
pub const MSG_INVITE: &str = "/invite";
pub const MSG_UNINVITE: &str = "/uninvite";
pub const MSG_MESSAGE: &str = "/message";

// session messages
pub const MSG_LOGIN: &str = "/login";
pub const MSG_QUERY: &str = "/query";
pub const MSG_REQUEST: &str = "/request";
pub const MSG_GROUP_JOIN: &str = "/group/join";
pub const MSG_GROUP_LEAVE: &str = "/group/leave";
pub const MSG_GROUP_UPDATE: &str = "/group/update";
pub const MSG_GROUP_CHANGED: &str = "/group/changed";
pub const MSG_GROUP_EJECT: &str = "/group/eject";
pub const MSG_USER_UPDATE: &str = "/user/update";
pub const MSG_USER_CHANGED: &str = "/user/changed";
pub const MSG_PEER_JOIN: &str = "/peer/join";
pub const MSG_PEER_LEAVE: &str = "/peer/leave";
pub const MSG_PEER_CHANGED: &str = "/peer/changed";

/// Parse the leading address pattern of an AOO message.
///
/// Returns the addressee type, the target id (`ID_INVALID` for types
/// without an id slot) and the byte offset of the remaining pattern, e.g.
/// `/aoo/src/10/data` yields `(Source, 10, 12)` so that `&addr[12..]` is
/// `"/data"`.
pub fn parse_pattern(addr: &str) -> Result<(MsgType, Id, usize), WireError> {
    let rest = addr
        .strip_prefix(MSG_DOMAIN)
        .ok_or(WireError::Malformed("not an AOO message"))?;
    let mut offset = MSG_DOMAIN.len();

    let (msg_type, rest, with_id) = if let Some(r) = rest.strip_prefix(MSG_SOURCE) {
        offset += MSG_SOURCE.len();
        (MsgType::Source, r, true)
    } else if let Some(r) = rest.strip_prefix(MSG_SINK) {
        offset += MSG_SINK.len();
        (MsgType::Sink, r, true)
    } else if let Some(r) = rest.strip_prefix(MSG_PEER) {
        offset += MSG_PEER.len();
        (MsgType::Peer, r, false)
    } else if let Some(r) = rest.strip_prefix(MSG_CLIENT) {
        offset += MSG_CLIENT.len();
        (MsgType::Client, r, false)
    } else if let Some(r) = rest.strip_prefix(MSG_SERVER) {
        offset += MSG_SERVER.len();
        (MsgType::Server, r, false)
    } else if rest.strip_prefix(MSG_RELAY).is_some() {
        offset += MSG_RELAY.len();
        return Ok((MsgType::Relay, ID_INVALID, offset));
    } else {
        return Err(WireError::Malformed("unknown AOO message type"));
    };

    if !with_id {
        return Ok((msg_type, ID_INVALID, offset));
    }

    // parse "/<id>"
    let rest = rest
        .strip_prefix('/')
        .ok_or(WireError::Malformed("missing id"))?;
    offset += 1;
    let digits = rest
        .find(|c: char| !c.is_ascii_digit() && c != '-')
        .unwrap_or(rest.len());
    if digits == 0 {
        return Err(WireError::Malformed("missing id"));
    }
    let id: Id = rest[..digits]
        .parse()
        .map_err(|_| WireError::Malformed("bad id"))?;
    offset += digits;

    Ok((msg_type, id, offset))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_source_sink() {
        let (t, id, offset) = parse_pattern("/aoo/src/10/data").unwrap();
        assert_eq!(t, MsgType::Source);
        assert_eq!(id, 10);
        assert_eq!(&"/aoo/src/10/data"[offset..], "/data");

        let (t, id, offset) = parse_pattern("/aoo/sink/-2/start").unwrap();
        assert_eq!(t, MsgType::Sink);
        assert_eq!(id, -2);
        assert_eq!(&"/aoo/sink/-2/start"[offset..], "/start");
    }

    #[test]
    fn test_parse_without_id() {
        let (t, id, offset) = parse_pattern("/aoo/server/group/join").unwrap();
        assert_eq!(t, MsgType::Server);
        assert_eq!(id, ID_INVALID);
        assert_eq!(&"/aoo/server/group/join"[offset..], MSG_GROUP_JOIN);

        let (t, _, offset) = parse_pattern("/aoo/client/peer/join").unwrap();
        assert_eq!(t, MsgType::Client);
        assert_eq!(&"/aoo/client/peer/join"[offset..], MSG_PEER_JOIN);

        let (t, _, _) = parse_pattern("/aoo/peer/ping").unwrap();
        assert_eq!(t, MsgType::Peer);

        let (t, _, offset) = parse_pattern("/aoo/relay").unwrap();
        assert_eq!(t, MsgType::Relay);
        assert_eq!(offset, "/aoo/relay".len());
    }

    #[test]
    fn test_parse_rejects_foreign() {
        assert!(parse_pattern("/foo/src/1/data").is_err());
        assert!(parse_pattern("/aoo/bogus").is_err());
        assert!(parse_pattern("/aoo/src/x/data").is_err());
        assert!(parse_pattern("/aoo/src").is_err());
    }
}
