//! Transparent TCP-splitting middlebox.
//!
//! Outbound TCP/443 packets are intercepted from the OS stack through a
//! platform capture adapter, reassembled per flow until a full TLS
//! `ClientHello` record is contiguous, and re-emitted as two or more TCP
//! segments whose first segment carries only a short prefix of the record.
//! On-path DPI that matches the first bytes of the SNI then sees a split
//! hello, while the peer sees a byte-identical stream.
//!
//! Every failure path fails open: a packet the interceptor cannot or will
//! not split is released to the network unchanged.

pub mod adapter;
pub mod cli;
pub mod engine;
pub mod error;
pub mod flow;
pub mod packet;
pub mod reassembly;
pub mod runtime;
pub mod tls;
