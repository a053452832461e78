//! The wire-protocol core of a small authoritative DNS server.
//!
//! This library parses and encodes DNS messages, serves them over UDP and
//! TCP from one non-blocking event loop, and hands every parsed request to
//! a [RequestHandler] that decides the answer.
//!
//! A request flows through the server like this:
//!```text
//!  client            DnsServer (reactor)              RequestHandler
//!    | -- UDP datagram -->|                                 |
//!    |                    | Message::parse                  |
//!    |                    | ------- Request --------------> |
//!    |                    | <------ Option<Response> ------ |
//!    | <-- UDP datagram --| Message::encode                 |
//!    |                    |                                 |
//!    | -- TCP len+msg --> | FrameReader, then as above      |
//!    | <-- TCP len+msg -- | FrameWriter, then close         |
//!```
//! The building blocks are usable on their own: [Buffer] is an owned byte
//! region, [Rope] an append-only log of buffers that can be sliced or
//! flattened, and [encode_label] / [decode_label] convert between dotted
//! names and the length-prefixed wire form.
//!
//! # Usage
//!
//! Load records into a [MemoryStore], wrap it in an [Authority] and open
//! ports on a [DnsServer]. Then either call [DnsServer::run] on the current
//! thread, or move the server to its own thread with [ServerDaemon::spawn].
//!
//! ```rust
//! use authdns::{Authority, DnsServer, MemoryStore, ServerConfig, ServerDaemon};
//! use std::sync::Arc;
//!
//! let records = "www 1 1 300 127.0.0.1\n";
//! let store = Arc::new(MemoryStore::load(records.as_bytes()).expect("bad records"));
//!
//! let mut server = DnsServer::new(ServerConfig::new()).expect("failed to create server");
//! let addr = "127.0.0.1:0".parse().unwrap();
//! server.open_udp(addr, Authority::new(store.clone())).expect("failed to open UDP");
//! server.open_tcp(addr, Authority::new(store)).expect("failed to open TCP");
//!
//! let daemon = ServerDaemon::spawn(server).expect("failed to spawn");
//! let receiver = daemon.shutdown().expect("failed to shutdown");
//! let _ = receiver.recv();
//! ```
//!
//! # Limitations
//!
//! Names are never compressed on output and compression pointers are not
//! followed on input. Record TTLs are written as zero.

#![forbid(unsafe_code)]
#![allow(clippy::single_component_path_imports)]

// log for logging (optional).
#[cfg(feature = "logging")]
use log;

#[cfg(not(feature = "logging"))]
#[macro_use]
mod log {
    macro_rules! trace {
        ($($arg:expr),* $(,)?) => {
            {
                let _ = ($(&$arg),*); // avoid warnings about unused variables.
            }
        };
    }

    macro_rules! debug {
        ($($arg:expr),* $(,)?) => {
            {
                let _ = ($(&$arg),*);
            }
        };
    }

    macro_rules! warn {
        ($($arg:expr),* $(,)?) => {
            {
                let _ = ($(&$arg),*);
            }
        };
    }

    macro_rules! error {
        ($($arg:expr),* $(,)?) => {
            {
                let _ = ($(&$arg),*);
            }
        };
    }
}

mod buffer;
mod dns_message;
mod dns_parser;
mod dns_server;
mod error;
mod label;
mod port;
mod record_store;
mod request;
mod rope;

pub use buffer::Buffer;
pub use dns_message::{
    Message, QueryClass, QueryType, Question, ResourceRecord, FLAGS_AA, FLAGS_QR_RESPONSE,
    FLAGS_RA, FLAGS_RD, FLAGS_TC,
};
pub use dns_server::{
    DaemonStatus, DnsServer, ServerConfig, ServerDaemon, ServerStatus, MAX_UDP_PACKET_DEFAULT,
    MIN_UDP_PACKET_DEFAULT, TCP_TIMEOUT_DEFAULT,
};
pub use error::{Error, Result};
pub use label::{decode_label, encode_label, validate_name, MAX_LABEL_LENGTH, MAX_NAME_LENGTH};
pub use port::{
    new_tcp_listener, new_udp_socket, FrameReader, FrameWriter, PortId, TcpRequestState,
    TCP_LENGTH_PREFIX,
};
pub use record_store::{Authority, MemoryStore, RecordStore};
pub use request::{ConnectionId, Origin, Request, RequestHandler, Response};
pub use rope::Rope;

/// Re-export from `flume`.
pub use flume::Receiver;
