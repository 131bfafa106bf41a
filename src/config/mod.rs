pub mod pipeline;

pub use pipeline::{FeedEndpoint, LedgerPolicy, PipelineConfig};
