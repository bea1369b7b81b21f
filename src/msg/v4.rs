//! NDMPv4 wire forms.
//!
//! Version 4 is the model for the canonical form, so the bridge is
//! the identity. The v4 behavioral refinements (window must be set
//! in IDLE, zero-length tape I/O succeeds, EOM reported past the
//! last filemark) live in the request handlers, gated on the
//! connection's protocol version.

use ndmp_api_types::NdmpResult;

use super::{ReplyBody, RequestBody};

pub fn request_to_v9(body: RequestBody) -> NdmpResult<RequestBody> {
    Ok(body)
}

pub fn request_from_v9(body: &RequestBody) -> NdmpResult<RequestBody> {
    Ok(body.clone())
}

pub fn reply_to_v9(body: ReplyBody) -> NdmpResult<ReplyBody> {
    Ok(body)
}

pub fn reply_from_v9(body: &ReplyBody) -> NdmpResult<ReplyBody> {
    Ok(body.clone())
}
