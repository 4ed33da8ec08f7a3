#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]
// Allow acronyms like KMS
#![allow(clippy::upper_case_acronyms)]

//! # kms-compositor: video compositing on KMS writeback connectors
//!
//! This crate composites several video streams into one by letting the display controller do the
//! work. Every input stream is bound to a hardware plane, the planes are scanned out to a CRTC
//! driving a writeback connector, and the connector writes the blended result back into memory.
//! No GPU and no CPU blending is involved.
//!
//! ## Structure of the crate
//!
//! - [`backend`] contains the device level pieces: the [`KmsDevice`](backend::drm::KmsDevice)
//!   abstraction over a drm node, atomic requests, framebuffer memory and buffer pools.
//! - [`video`] contains the media side: formats, frame layouts, caps negotiation and buffers.
//! - [`compositor`] ties both together in [`KmsCompositor`](compositor::KmsCompositor), which
//!   produces one composited frame per atomic commit.
//!
//! ### Logging
//!
//! kms-compositor makes extensive use of [`tracing`] for its internal logging.
//!
//! For release builds it is recommended to limit the log level during compile time.
//! This can be done by adding a dependency to [`tracing`] and enabling the corresponding features.
//! For example to enable `trace` messages for debug builds, but limit release builds to `debug` add
//! the following in your binary crate `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! tracing = { version = "0.1", features = ["max_level_trace", "release_max_level_debug"] }
//! ```
//!
//! Every commit is logged at `trace` level. Set `KMS_COMPOSITOR_DEBUG_COMMIT=1` to additionally
//! dump the full request of a failed commit.

pub mod backend;
pub mod compositor;
pub mod utils;
pub mod video;
