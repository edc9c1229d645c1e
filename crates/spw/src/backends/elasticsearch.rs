//! 📡 Elasticsearch backend: the one sink that talks to something real.
//!
//! One sealed batch becomes one `POST /_bulk` request. Every record body is a
//! source line, preceded by an `index` action line naming the (possibly
//! rotated) target index and, for clusters old enough to care, a document type.
//!
//! 🧠 Knowledge graph:
//! - `rotation`: which index a write goes to *right now* (`logs` → `logs-2024-03-07`).
//! - `elasticsearch_sink`: the HTTP part. Pure I/O, no retries. The pipeline retries.
//!
//! 🦆

mod elasticsearch_sink;
mod rotation;

pub use elasticsearch_sink::ElasticsearchSinkConfig;
pub(crate) use elasticsearch_sink::ElasticsearchSink;
pub use rotation::IndexRotation;
