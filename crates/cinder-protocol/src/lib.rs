//! cinder-protocol: RESP wire protocol implementation.
//!
//! Provides incremental parsing and direct-to-buffer serialization of
//! the RESP protocol used between clients, peers, and the append-only
//! file. Requests are arrays of bulk strings; an inline form is accepted
//! for interactive use.
//!
//! # quick start
//!
//! ```
//! use bytes::BytesMut;
//! use cinder_protocol::{Frame, parse_frame};
//!
//! let input = b"+OK\r\n";
//! let (frame, consumed) = parse_frame(input).unwrap().unwrap();
//! assert_eq!(frame, Frame::Simple("OK".into()));
//!
//! let mut buf = BytesMut::new();
//! frame.serialize(&mut buf);
//! assert_eq!(&buf[..], b"+OK\r\n");
//! ```

pub mod error;
pub mod parse;
mod serialize;
pub mod types;

pub use error::ProtocolError;
pub use parse::{parse_command, parse_frame, parse_rdb_payload};
pub use types::{cmd_name, cmdline, CmdLine, Frame};
