//! Attribution aggregation: merges fragments published asynchronously by
//! several sources into one canonical, transport-safe record.

pub mod aggregator;
pub mod metrics_defs;
pub mod value;

pub use aggregator::{
    AttributionAggregator, AttributionEvent, AttributionRecord, FragmentSource, INSTALL_ID_KEY,
};
pub use value::{Payload, RawValue, sanitize};
