//! NDMPv3 wire forms.
//!
//! Version 3 is shaped like the canonical form except that TCP
//! addresses carry no environment list; the bridge normalizes
//! addresses in both directions. The v4-only gate differences
//! (window setting in IDLE, zero-length tape I/O) are behavioral and
//! enforced in the handlers, not here.

use ndmp_api_types::{DataAddr, NdmpResult};

use super::{ReplyBody, RequestBody};

fn strip_addr(addr: &mut DataAddr) {
    if let DataAddr::Tcp(tcp) = addr {
        tcp.addr_env.clear();
    }
}

fn normalize_request(mut body: RequestBody) -> RequestBody {
    match &mut body {
        RequestBody::DataStartBackup(r) => strip_addr(&mut r.addr),
        RequestBody::DataStartRecover(r) | RequestBody::DataStartRecoverFilehist(r) => {
            strip_addr(&mut r.addr)
        }
        RequestBody::DataConnect(r) => strip_addr(&mut r.addr),
        RequestBody::MoverConnect(r) => strip_addr(&mut r.addr),
        _ => {}
    }
    body
}

fn normalize_reply(mut body: ReplyBody) -> ReplyBody {
    match &mut body {
        ReplyBody::DataGetState(r) => strip_addr(&mut r.data_connection_addr),
        ReplyBody::MoverGetState(r) => strip_addr(&mut r.data_connection_addr),
        ReplyBody::Addr(r) => strip_addr(&mut r.data_connection_addr),
        _ => {}
    }
    body
}

pub fn request_to_v9(body: RequestBody) -> NdmpResult<RequestBody> {
    Ok(normalize_request(body))
}

pub fn request_from_v9(body: &RequestBody) -> NdmpResult<RequestBody> {
    Ok(normalize_request(body.clone()))
}

pub fn reply_to_v9(body: ReplyBody) -> NdmpResult<ReplyBody> {
    Ok(normalize_reply(body))
}

pub fn reply_from_v9(body: &ReplyBody) -> NdmpResult<ReplyBody> {
    Ok(normalize_reply(body.clone()))
}
