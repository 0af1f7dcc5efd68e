pub mod agg;
pub mod error;
pub mod key;
pub mod metrics;
pub mod registry;
pub mod tags;

pub use error::{Error, Result};
pub use key::KeyId;
pub use metrics::{
    MetricHandle, MetricKind, MetricSeriesSummary, MetricValue, RateSummary,
    TREND_SIGNIFICANT_DIGITS, TrendSummary,
};
pub use registry::{MetricId, Registry};
pub use tags::TagSet;
