//! Core library for the cyberchat mesh node: discovery, peer lifecycle,
//! message pipeline, event bus, persistence, and the HTTP/TLS surface that
//! fronts them. `main.rs` is a thin CLI wrapper around [`server::Server`].

pub mod config;
pub mod crypto;
pub mod db;
pub mod discovery;
pub mod error;
pub mod events;
pub mod files;
pub mod identity;
pub mod peers;
pub mod pipeline;
pub mod server;
pub mod tls;
pub mod web;

pub use error::{CoreError, CoreResult};
pub use server::Server;
