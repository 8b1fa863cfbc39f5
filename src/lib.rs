//! Windowed event counting with live queries and push updates.

pub mod agent;
pub mod api;
pub mod config;
pub mod event;
pub mod export;
pub mod fanout;
pub mod ingest;
pub mod query;
pub mod store;
pub mod topology;
pub mod window;
