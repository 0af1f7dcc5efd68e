use hdrhistogram::Histogram;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Trend values are stored with microsecond resolution (value in ms * 1000).
const TREND_SCALE: f64 = 1000.0;

/// Upper bound of the trend histogram: one hour, in trend units.
const TREND_MAX_SCALED: u64 = 3_600_000_000;

/// Significant decimal digits kept by the trend histogram. Three digits bound the
/// relative error of any percentile to 0.1%.
pub const TREND_SIGNIFICANT_DIGITS: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum MetricKind {
    /// Monotonic sum.
    Counter,
    /// Last value.
    Gauge,
    /// Fraction of samples that were hits.
    Rate,
    /// Distribution with percentile queries.
    Trend,
}

#[derive(Debug, Clone)]
pub struct MetricSeriesSummary {
    pub name: String,
    pub kind: MetricKind,
    pub tags: Vec<(String, String)>,
    pub value: MetricValue,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MetricValue {
    Counter(u64),
    Gauge(i64),
    Rate(RateSummary),
    Trend(TrendSummary),
}

impl MetricValue {
    /// Value of a series that has not received any sample yet.
    pub fn empty(kind: MetricKind) -> Self {
        match kind {
            MetricKind::Counter => Self::Counter(0),
            MetricKind::Gauge => Self::Gauge(0),
            MetricKind::Rate => Self::Rate(RateSummary::default()),
            MetricKind::Trend => Self::Trend(TrendSummary::default()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RateSummary {
    pub total: u64,
    pub hits: u64,
    /// `hits / total`, `None` until the first sample.
    pub rate: Option<f64>,
}

impl RateSummary {
    pub fn new(total: u64, hits: u64) -> Self {
        let rate = (total > 0).then(|| hits as f64 / total as f64);
        Self { total, hits, rate }
    }
}

/// Trend statistics in the unit the values were recorded in (milliseconds for
/// every built-in trend).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TrendSummary {
    pub count: u64,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub avg: Option<f64>,
    pub med: Option<f64>,
    pub p90: Option<f64>,
    pub p95: Option<f64>,
    pub p99: Option<f64>,
}

#[derive(Debug, Clone)]
pub(crate) struct TrendData {
    hist: Histogram<u64>,
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
}

impl TrendData {
    pub(crate) fn new() -> Self {
        let hist = match Histogram::<u64>::new_with_bounds(
            1,
            TREND_MAX_SCALED,
            TREND_SIGNIFICANT_DIGITS,
        ) {
            Ok(h) => h,
            // Constant bounds; creation can only fail if they are changed to something invalid.
            Err(err) => panic!("failed to create trend histogram: {err}"),
        };

        Self {
            hist,
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    fn record(&mut self, value: f64) {
        if !value.is_finite() || value < 0.0 {
            return;
        }

        let scaled = (value * TREND_SCALE).round().max(1.0) as u64;
        self.hist.saturating_record(scaled);
        self.count = self.count.saturating_add(1);
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    pub(crate) fn merge(&mut self, other: &TrendData) {
        if other.count == 0 {
            return;
        }
        // Both sides share the same bounds, so the addition cannot fail.
        let _ = self.hist.add(&other.hist);
        self.count = self.count.saturating_add(other.count);
        self.sum += other.sum;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    /// Smallest recorded value such that at least `p` percent of the samples are
    /// less than or equal to it. `p` is clamped into `(0, 100]`.
    pub(crate) fn percentile(&self, p: f64) -> Option<f64> {
        if self.count == 0 || !p.is_finite() {
            return None;
        }
        let q = (p / 100.0).clamp(f64::MIN_POSITIVE, 1.0);
        let v = self.hist.value_at_quantile(q) as f64 / TREND_SCALE;

        // The histogram reports the upper edge of a bucket; never report outside
        // the exact observed range.
        Some(v.clamp(self.min, self.max))
    }

    pub(crate) fn summary(&self) -> TrendSummary {
        if self.count == 0 {
            return TrendSummary::default();
        }

        TrendSummary {
            count: self.count,
            min: Some(self.min),
            max: Some(self.max),
            avg: Some(self.sum / self.count as f64),
            med: self.percentile(50.0),
            p90: self.percentile(90.0),
            p95: self.percentile(95.0),
            p99: self.percentile(99.0),
        }
    }
}

#[derive(Debug, Default)]
pub struct Rate {
    total: AtomicU64,
    hits: AtomicU64,
}

impl Rate {
    pub(crate) fn summary(&self) -> RateSummary {
        RateSummary::new(
            self.total.load(Ordering::Relaxed),
            self.hits.load(Ordering::Relaxed),
        )
    }
}

#[derive(Debug)]
pub struct Trend {
    data: Mutex<TrendData>,
}

impl Trend {
    fn new() -> Self {
        Self {
            data: Mutex::new(TrendData::new()),
        }
    }

    pub(crate) fn with_data<R>(&self, f: impl FnOnce(&TrendData) -> R) -> R {
        f(&self.data.lock())
    }
}

/// Shared write/read handle for one metric series. Cloning is cheap and every
/// clone points at the same storage.
#[derive(Debug, Clone)]
pub enum MetricHandle {
    Counter(Arc<AtomicU64>),
    Gauge(Arc<AtomicI64>),
    Rate(Arc<Rate>),
    Trend(Arc<Trend>),
}

impl MetricHandle {
    pub(crate) fn new(kind: MetricKind) -> Self {
        match kind {
            MetricKind::Counter => Self::Counter(Arc::new(AtomicU64::new(0))),
            MetricKind::Gauge => Self::Gauge(Arc::new(AtomicI64::new(0))),
            MetricKind::Rate => Self::Rate(Arc::new(Rate::default())),
            MetricKind::Trend => Self::Trend(Arc::new(Trend::new())),
        }
    }

    pub fn kind(&self) -> MetricKind {
        match self {
            Self::Counter(_) => MetricKind::Counter,
            Self::Gauge(_) => MetricKind::Gauge,
            Self::Rate(_) => MetricKind::Rate,
            Self::Trend(_) => MetricKind::Trend,
        }
    }

    #[inline]
    pub fn increment(&self, value: u64) {
        if let Self::Counter(c) = self {
            c.fetch_add(value, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn set_gauge(&self, value: i64) {
        if let Self::Gauge(g) = self {
            g.store(value, Ordering::Relaxed);
        }
    }

    /// Raises the gauge to `value` if it is currently lower.
    #[inline]
    pub fn max_gauge(&self, value: i64) {
        if let Self::Gauge(g) = self {
            g.fetch_max(value, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn add_rate(&self, hit: bool) {
        if let Self::Rate(r) = self {
            r.total.fetch_add(1, Ordering::Relaxed);
            if hit {
                r.hits.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    #[inline]
    pub fn observe(&self, value: f64) {
        if let Self::Trend(t) = self {
            t.data.lock().record(value);
        }
    }

    pub fn value(&self) -> MetricValue {
        match self {
            Self::Counter(c) => MetricValue::Counter(c.load(Ordering::Relaxed)),
            Self::Gauge(g) => MetricValue::Gauge(g.load(Ordering::Relaxed)),
            Self::Rate(r) => MetricValue::Rate(r.summary()),
            Self::Trend(t) => MetricValue::Trend(t.with_data(TrendData::summary)),
        }
    }
}
