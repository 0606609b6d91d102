//! Remote-side RPC server for editor-integrated remote file access.
//!
//! A single long-running process that multiplexes file I/O, directory
//! enumeration, process execution (with and without PTYs), filesystem
//! change notification, and request pipelining over one bidirectional
//! byte stream — normally the stdio of a secure-shell session. See
//! [`server::serve`] for the connection loop and [`rpc`] for the wire
//! format.

pub mod config;
pub mod encoding;
pub mod ops;
pub mod rpc;
pub mod server;
