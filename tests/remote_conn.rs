//! Remote control connection: version negotiation, permission
//! gating and authentication against a server session running the
//! DATA/TAPE/ROBOT roles.

mod util;

use std::net::TcpListener;

use ndmp_api_types::{NdmpError, NDMP3VER};

use ndmp_agent::conn::Conn;
use ndmp_agent::msg::{
    reply_to_canonical, AuthData, ConnectClientAuthRequest, ConnectOpenRequest, ReplyBody,
    RequestBody,
};
use ndmp_agent::session::{server_session, AuthCallbacks, Session, SessionParam};

struct TestAuth;

impl AuthCallbacks for TestAuth {
    fn validate_password(&self, name: &str, pass: &str) -> bool {
        name == "operator" && pass == "secret"
    }
    fn validate_md5(&self, _name: &str, _digest: &[u8; 16], _challenge: &[u8; 64]) -> bool {
        false
    }
}

fn call(conn: &mut Conn, body: RequestBody) -> (NdmpError, ReplyBody) {
    let frame = conn.call_remote(&body).expect("call failed");
    let header_error = frame.header.error;
    let reply = reply_to_canonical(frame.body).unwrap_or(ReplyBody::None);
    (header_error, reply)
}

#[test]
fn test_v3_negotiation_and_auth_gating() {
    util::init_logging();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server = std::thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let mut sess = Session::new(SessionParam {
            log_tag: "SRV".into(),
            log_level: 2,
            hostname: "localhost".into(),
        });
        sess.cbs.auth = Some(Box::new(TestAuth));
        server_session(&mut sess, stream.into()).unwrap();
    });

    let mut conn = Conn::connect(addr, "#C").unwrap();

    // downgrade to NDMPv3 before opening
    conn.protocol_version = NDMP3VER;
    let (err, _) = call(
        &mut conn,
        RequestBody::ConnectOpen(ConnectOpenRequest {
            protocol_version: NDMP3VER,
        }),
    );
    assert_eq!(err, NdmpError::NoErr);

    // open but not authorized: semantic requests are refused
    let (err, _) = call(
        &mut conn,
        RequestBody::TapeOpen(ndmp_agent::msg::TapeOpenRequest {
            device: "none".into(),
            mode: ndmp_api_types::TapeOpenMode::Read,
        }),
    );
    assert_eq!(err, NdmpError::NotAuthorized);

    // wrong credentials
    let (err, reply) = call(
        &mut conn,
        RequestBody::ConnectClientAuth(ConnectClientAuthRequest {
            auth_data: AuthData::Text {
                auth_id: "operator".into(),
                auth_password: "wrong".into(),
            },
        }),
    );
    assert_eq!(err, NdmpError::NoErr);
    assert_eq!(reply.body_error(), NdmpError::NotAuthorized);

    // right credentials
    let (err, reply) = call(
        &mut conn,
        RequestBody::ConnectClientAuth(ConnectClientAuthRequest {
            auth_data: AuthData::Text {
                auth_id: "operator".into(),
                auth_password: "secret".into(),
            },
        }),
    );
    assert_eq!(err, NdmpError::NoErr);
    assert_eq!(reply.body_error(), NdmpError::NoErr);

    // now the TAPE agent answers; no drive is open yet
    let (err, reply) = call(&mut conn, RequestBody::TapeGetState);
    assert_eq!(err, NdmpError::NoErr);
    match reply {
        ReplyBody::TapeGetState(state) => {
            assert_eq!(state.error, NdmpError::DevNotOpen);
            assert_eq!(state.state, ndmp_api_types::TapeState::Idle);
        }
        other => panic!("unexpected reply {:?}", other),
    }

    // polite shutdown: the server leaves its quantum loop on EOF
    let _ = conn.send_request_frame(&RequestBody::ConnectClose);
    drop(conn);
    server.join().unwrap();
}
