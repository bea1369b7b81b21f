//! NDMP multi-role backup agent framework.
//!
//! A single process can embody any subset of four roles — CONTROL,
//! DATA, TAPE (hosting the MOVER) and ROBOT — linked by NDMP control
//! connections and one bulk image-stream connection. The session
//! kernel runs them on a single-threaded cooperative event loop.
//!
//! ```text
//!  CONTROL ──control conns──▶ DATA, TAPE, ROBOT
//!                 │
//!                 ├─ DATA_START_BACKUP / MOVER_LISTEN / DATA_CONNECT
//!                 ▼
//!  DATA ──(formatter pipe)──▶ image-stream ──▶ MOVER ──▶ tape
//!                              │
//!                              └─ LOCAL (shared buf) or TCP
//! ```
//!
//! Wire protocol versions 2, 3 and 4 interoperate through a
//! canonical internal form ("version 9") that never reaches the
//! wire.

pub mod chan;
pub mod conn;
pub mod msg;
pub mod notify;

pub mod image_stream;

pub mod data;
pub mod robot;
pub mod tape_agent;

pub mod dispatch;
pub mod session;

pub mod control;

pub use session::{
    client_session, daemon_session, server_session, Callbacks, ConnRef, PlumbSlot, RoleSet,
    Session, SessionParam,
};
