//! Protocol adapters
//!
//! Bridges external surfaces to fraudnet. Currently an HTTP ingest server
//! that feeds alert drafts to a node's publisher or a relay.

pub mod http_server;

pub use http_server::{build_router, AppState, HttpServer, ServerConfig};
