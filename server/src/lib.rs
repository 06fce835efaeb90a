//! The live server: a threaded RTMP front end over the routing directory,
//! with outbound lifecycle notifications and per-stream recorders.

pub mod config;
pub mod connection;
pub mod notify;
pub mod router;
pub mod server;
