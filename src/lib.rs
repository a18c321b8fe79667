//! freshet - resource availability crawler and change detection for data
//! catalogs.
//!
//! Given a catalog of external resource URLs, freshet periodically probes
//! each one, detects whether the remote content changed through a layered
//! cascade (harvest metadata, Last-Modified, Content-Length, downloaded
//! checksum), downloads changed resources to compute content metadata,
//! mirrors tabular payloads into per-resource SQL tables and notifies the
//! upstream catalog over a webhook.

pub mod analysis;
pub mod cli;
pub mod config;
pub mod crawl;
pub mod models;
pub mod queue;
pub mod repository;
pub mod schemas;
pub mod server;
pub mod utils;
pub mod webhook;
