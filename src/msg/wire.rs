//! Version-tagged wire bodies and the bridge entry points.
//!
//! A connection transmits [`WireFrame`]s: the decoded header plus a
//! body in the connection's protocol version. The embedder-provided
//! codec seam (XDR in classic deployments) is stood in for by a
//! length-prefixed serde frame; the version bridge is unaffected by
//! the byte-level encoding.

use serde::{Deserialize, Serialize};

use ndmp_api_types::{NdmpError, NdmpResult, NDMP2VER, NDMP3VER, NDMP4VER};

use super::{v2, v3, v4, Header, ReplyBody, RequestBody};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireBody {
    V2Request(v2::RequestBody),
    V2Reply(v2::ReplyBody),
    V3Request(RequestBody),
    V3Reply(ReplyBody),
    V4Request(RequestBody),
    V4Reply(ReplyBody),
}

impl WireBody {
    pub fn protocol_version(&self) -> u16 {
        match self {
            WireBody::V2Request(_) | WireBody::V2Reply(_) => NDMP2VER,
            WireBody::V3Request(_) | WireBody::V3Reply(_) => NDMP3VER,
            WireBody::V4Request(_) | WireBody::V4Reply(_) => NDMP4VER,
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(
            self,
            WireBody::V2Request(_) | WireBody::V3Request(_) | WireBody::V4Request(_)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireFrame {
    pub header: Header,
    pub body: WireBody,
}

/// Bridge a wire request into the canonical form.
pub fn request_to_canonical(body: WireBody) -> NdmpResult<RequestBody> {
    match body {
        WireBody::V2Request(b) => v2::request_to_v9(b),
        WireBody::V3Request(b) => v3::request_to_v9(b),
        WireBody::V4Request(b) => v4::request_to_v9(b),
        _ => Err(NdmpError::Undefined),
    }
}

/// Bridge a canonical request onto a connection's wire version.
pub fn request_from_canonical(version: u16, body: &RequestBody) -> NdmpResult<WireBody> {
    match version {
        NDMP2VER => Ok(WireBody::V2Request(v2::request_from_v9(body)?)),
        NDMP3VER => Ok(WireBody::V3Request(v3::request_from_v9(body)?)),
        NDMP4VER => Ok(WireBody::V4Request(v4::request_from_v9(body)?)),
        _ => Err(NdmpError::VersionNotSupported),
    }
}

/// Bridge a wire reply into the canonical form.
pub fn reply_to_canonical(body: WireBody) -> NdmpResult<ReplyBody> {
    match body {
        WireBody::V2Reply(b) => v2::reply_to_v9(b),
        WireBody::V3Reply(b) => v3::reply_to_v9(b),
        WireBody::V4Reply(b) => v4::reply_to_v9(b),
        _ => Err(NdmpError::Undefined),
    }
}

/// Bridge a canonical reply onto a connection's wire version.
pub fn reply_from_canonical(version: u16, body: &ReplyBody) -> NdmpResult<WireBody> {
    match version {
        NDMP2VER => Ok(WireBody::V2Reply(v2::reply_from_v9(body)?)),
        NDMP3VER => Ok(WireBody::V3Reply(v3::reply_from_v9(body)?)),
        NDMP4VER => Ok(WireBody::V4Reply(v4::reply_from_v9(body)?)),
        _ => Err(NdmpError::VersionNotSupported),
    }
}

#[cfg(test)]
mod test {
    use super::super::*;
    use super::*;
    use ndmp_api_types::*;

    #[test]
    fn test_v3_mover_listen_round_trip() {
        // a v3 reply carrying a TCP address survives x -> 9 -> x
        // unchanged in all semantically significant fields
        let reply = ReplyBody::Addr(AddrReply {
            error: NdmpError::NoErr,
            data_connection_addr: DataAddr::Tcp(TcpAddr::new(0x0A000001, 10501)),
        });

        let wire = reply_from_canonical(NDMP3VER, &reply).unwrap();
        let canonical = reply_to_canonical(wire.clone()).unwrap();
        let wire2 = reply_from_canonical(NDMP3VER, &canonical).unwrap();
        assert_eq!(wire, wire2);

        match canonical {
            ReplyBody::Addr(r) => match r.data_connection_addr {
                DataAddr::Tcp(tcp) => {
                    assert_eq!(tcp.ip_addr, 0x0A000001);
                    assert_eq!(tcp.port, 10501);
                }
                other => panic!("unexpected addr {:?}", other),
            },
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[test]
    fn test_v2_request_round_trip() {
        let request = RequestBody::DataStartBackup(DataStartBackupRequest {
            addr: DataAddr::Tcp(TcpAddr::new(0x7F000001, 2021)),
            bu_type: "dump".into(),
            env: vec![Pval::new("FILESYSTEM", "/src")],
        });

        let wire = request_from_canonical(NDMP2VER, &request).unwrap();
        let back = request_to_canonical(wire).unwrap();
        assert_eq!(request, back);
    }

    #[test]
    fn test_v2_degrades_eow() {
        let reply = ReplyBody::MoverGetState(MoverGetStateReply {
            state: MoverState::Paused,
            pause_reason: MoverPauseReason::Eow,
            ..Default::default()
        });

        match reply_from_canonical(NDMP2VER, &reply).unwrap() {
            WireBody::V2Reply(v2::ReplyBody::MoverGetState(r)) => {
                assert_eq!(r.pause_reason, MoverPauseReason::Eof);
            }
            other => panic!("unexpected wire body {:?}", other),
        }
    }

    #[test]
    fn test_v2_rejects_v34_messages() {
        let request = RequestBody::DataConnect(DataConnectRequest {
            addr: DataAddr::Local,
        });
        assert_eq!(
            request_from_canonical(NDMP2VER, &request),
            Err(NdmpError::NotSupported)
        );
    }

    #[test]
    fn test_v4_identity() {
        let request = RequestBody::MoverListen(MoverListenRequest {
            mode: MoverMode::Read,
            addr_type: AddrType::Tcp,
        });
        let wire = request_from_canonical(NDMP4VER, &request).unwrap();
        assert_eq!(request_to_canonical(wire).unwrap(), request);
    }
}
