pub mod catalog;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod models;
pub mod pipeline;
pub mod policy;
pub mod progress;
pub mod sink;
pub mod throttle;
pub mod traits;
pub mod worklist;

#[doc(hidden)]
pub mod testutil;

pub use catalog::{CatalogFormat, DEFAULT_KEY_FIELD, FileCatalog, load_catalog};
pub use config::HarvestConfig;
pub use error::AppError;
pub use fetcher::{FetcherConfig, KeyFetcher, ResponseShape};
pub use models::{ApiResponse, FailureReason, Record, RunStatus, RunSummary, WorkKey};
pub use pipeline::HarvestPipeline;
pub use progress::{HarvestEvent, HarvestReporter, TracingReporter};
pub use sink::JsonlSink;
pub use throttle::{Throttle, ThrottleConfig};
pub use traits::{CatalogSource, RecordSink, SearchApi};
pub use worklist::{Worklist, load_completed};
