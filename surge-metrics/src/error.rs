use crate::metrics::MetricKind;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("metric `{name}` is already registered as {registered}, not {requested}")]
    KindMismatch {
        name: String,
        registered: MetricKind,
        requested: MetricKind,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
