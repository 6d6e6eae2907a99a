//! HTTP surface: REST API, WebDAV server and reverse-proxy endpoints.

pub mod http;

pub use http::{AppState, router};
