//! ComfyUI client library: HTTP API wrappers, WebSocket event stream,
//! typed message parsing, atomic output downloads, and the two-tier
//! completion waiter (stream first, history polling as fallback).

pub mod api;
pub mod base_url;
pub mod client;
pub mod download;
pub mod error;
pub mod messages;
pub mod wait;

pub use api::{ComfyApi, ImageRef};
pub use base_url::BaseUrl;
pub use client::ComfyClient;
pub use error::{ClientError, ErrorKind};
