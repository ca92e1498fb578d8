//! # Agentation
//!
//! Visual UI annotations with a way back to the code.
//!
//! Agentation has two halves. At build time the [`locator`] tags every
//! JSX element with a `data-agentation-location="file:line:column"`
//! attribute. At run time a small HTTP [`server`] stores the annotations a
//! developer attaches to rendered elements in a JSON file, and tells the
//! in-page toolbar which base URL to use, including a public [`tunnel`]
//! URL when one is configured.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   tagged JSX    ┌─────────────┐
//! │  locator   │───────────────▶│ running app │
//! │ (tree-sit) │                 │  + toolbar  │
//! └────────────┘                 └──────┬──────┘
//!                                       │ client / fetch
//!                                       ▼
//! ┌────────────┐   base URL     ┌──────────────┐   read/modify/write
//! │   tunnel   │──────────────▶│    server    │──────────────────▶ annotations.json
//! └────────────┘                └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! agentation serve                       # API on 127.0.0.1:5173/api
//! agentation tag src --out-dir .tagged   # instrument a source tree
//! agentation annotations list
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`locator`] | JSX source-location tagging |
//! | [`tag`] | CLI driver for the locator |
//! | [`json_store`] | File-backed annotation store |
//! | [`server`] | Annotation HTTP API |
//! | [`tunnel`] | Public tunnel and base-URL discovery |
//! | [`client`] | Client for the annotation API |

pub mod client;
pub mod config;
pub mod json_store;
pub mod locator;
pub mod server;
pub mod tag;
pub mod tunnel;

pub use agentation_core::{event, models, store};
