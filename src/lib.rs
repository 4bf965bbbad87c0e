//! rollupd: a debounced, coalescing dispatcher that keeps per-project
//! analytics rollups fresh without recomputing on every event.

pub mod agent;
pub mod config;
pub mod dispatch;
pub mod export;
pub mod ingest;
pub mod rollup;
