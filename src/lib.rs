//! Respond first, process later.
//!
//! A full-page response cache for axum applications. Repeat requests are
//! answered from the entry store without running the handler; stale entries
//! are still sent immediately while the handler regenerates the page for the
//! next visitor.

pub mod cache;
pub mod config;
pub mod error;
pub mod infra;
