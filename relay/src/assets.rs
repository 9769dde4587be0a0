//! Embedded browser-bundle assets, served with an SPA fallback to
//! `index.html` by `axum_embed::ServeEmbed` in `main.rs`.
//!
//! The bundle itself is built and populated by the browser client's own
//! tooling; this just embeds whatever lands in `static/` at compile time.

use rust_embed::RustEmbed;

#[derive(RustEmbed)]
#[folder = "static/"]
pub struct Assets;
