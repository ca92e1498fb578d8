//! # Agentation Core
//!
//! Shared, I/O-free logic for Agentation: the annotation data model, the
//! event envelope accepted by the annotation API, and the store
//! abstraction with an in-memory backend.
//!
//! This crate contains no tokio, filesystem, or network dependencies.

pub mod event;
pub mod models;
pub mod store;
