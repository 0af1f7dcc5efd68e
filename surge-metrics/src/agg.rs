use std::collections::HashMap;

use smallvec::SmallVec;

use crate::key::KeyId;
use crate::metrics::{MetricHandle, RateSummary, TrendData, TrendSummary};
use crate::registry::{MetricId, Registry};
use crate::tags::TagSet;

#[derive(Debug, Clone, Copy)]
enum TagFilter {
    Eq(KeyId, KeyId),
    Has(KeyId),
    Missing(KeyId),
}

impl TagFilter {
    fn matches(&self, tags: &TagSet) -> bool {
        match *self {
            TagFilter::Eq(k, v) => tags.get(k) == Some(v),
            TagFilter::Has(k) => tags.get(k).is_some(),
            TagFilter::Missing(k) => tags.get(k).is_none(),
        }
    }
}

/// Filtered, grouped fold over the tagged series of one metric.
#[derive(Debug, Clone)]
pub struct Query<'a> {
    registry: &'a Registry,
    metric: MetricId,
    filters: SmallVec<[TagFilter; 4]>,
    group_keys: SmallVec<[KeyId; 4]>,
}

impl<'a> Query<'a> {
    pub(crate) fn new(registry: &'a Registry, metric: MetricId) -> Self {
        Self {
            registry,
            metric,
            filters: SmallVec::new(),
            group_keys: SmallVec::new(),
        }
    }

    #[must_use]
    pub fn where_eq(mut self, key: KeyId, value: KeyId) -> Self {
        self.filters.push(TagFilter::Eq(key, value));
        self
    }

    #[must_use]
    pub fn where_has(mut self, key: KeyId) -> Self {
        self.filters.push(TagFilter::Has(key));
        self
    }

    #[must_use]
    pub fn where_missing(mut self, key: KeyId) -> Self {
        self.filters.push(TagFilter::Missing(key));
        self
    }

    #[must_use]
    pub fn group_by(mut self, keys: impl IntoIterator<Item = KeyId>) -> Self {
        self.group_keys = keys.into_iter().collect();
        self.group_keys.sort_unstable();
        self.group_keys.dedup();
        self
    }

    fn fold<T: Default>(self, mut f: impl FnMut(&mut T, &MetricHandle)) -> HashMap<TagSet, T> {
        let mut out: HashMap<TagSet, T> = HashMap::new();

        self.registry.visit_series(self.metric, |tags, handle| {
            if !self.filters.iter().all(|flt| flt.matches(tags)) {
                return;
            }
            let acc = out.entry(tags.project(&self.group_keys)).or_default();
            f(acc, handle);
        });

        out
    }

    pub fn sum_counter(self) -> HashMap<TagSet, u64> {
        self.fold(|acc: &mut u64, handle| {
            if let MetricHandle::Counter(c) = handle {
                *acc = acc.saturating_add(c.load(std::sync::atomic::Ordering::Relaxed));
            }
        })
    }

    pub fn sum_counter_total(self) -> u64 {
        self.sum_counter().values().copied().sum()
    }

    pub fn sum_rate(self) -> HashMap<TagSet, RateSummary> {
        self.fold(|acc: &mut RateSummary, handle| {
            if let MetricHandle::Rate(r) = handle {
                let s = r.summary();
                *acc = RateSummary::new(
                    acc.total.saturating_add(s.total),
                    acc.hits.saturating_add(s.hits),
                );
            }
        })
    }

    pub fn merge_trend(self) -> HashMap<TagSet, TrendSummary> {
        let merged: HashMap<TagSet, MergedTrend> = self.fold(|acc: &mut MergedTrend, handle| {
            if let MetricHandle::Trend(t) = handle {
                t.with_data(|d| acc.0.merge(d));
            }
        });

        merged
            .into_iter()
            .map(|(k, t)| (k, t.0.summary()))
            .collect()
    }
}

struct MergedTrend(TrendData);

impl Default for MergedTrend {
    fn default() -> Self {
        Self(TrendData::new())
    }
}

#[cfg(test)]
mod tests {
    use crate::metrics::MetricKind;
    use crate::registry::Registry;

    #[test]
    fn sum_rate_groups_by_check_name() {
        let reg = Registry::default();
        let checks = reg
            .register("checks", MetricKind::Rate)
            .unwrap_or_else(|e| panic!("{e}"));
        let check_k = reg.resolve_key("check");

        let ok = reg.resolve_tags([("check", "status is 200")]);
        let body = reg.resolve_tags([("check", "body not empty")]);
        for (tags, hit) in [(ok.clone(), false), (ok, true), (body, false)] {
            if let Some(h) = reg.handle(checks, tags) {
                h.add_rate(hit);
            }
        }
        if let Some(h) = reg.base(checks) {
            h.add_rate(true);
        }

        let grouped = reg
            .query(checks)
            .where_has(check_k)
            .group_by([check_k])
            .sum_rate();
        assert_eq!(grouped.len(), 2);

        let status = reg.resolve_tags([("check", "status is 200")]);
        let s = grouped
            .get(&status)
            .unwrap_or_else(|| panic!("missing group"));
        assert_eq!((s.total, s.hits), (2, 1));
        assert_eq!(s.rate, Some(0.5));
    }

    #[test]
    fn counter_filters_and_missing_keys() {
        let reg = Registry::default();
        let reqs = reg
            .register("http_reqs", MetricKind::Counter)
            .unwrap_or_else(|e| panic!("{e}"));
        let status_k = reg.resolve_key("status");
        let s200 = reg.resolve_key("200");

        for (tags, n) in [
            (reg.resolve_tags([("status", "200")]), 5),
            (reg.resolve_tags([("status", "500")]), 2),
            (crate::tags::TagSet::default(), 7),
        ] {
            if let Some(h) = reg.handle(reqs, tags) {
                h.increment(n);
            }
        }

        assert_eq!(reg.query(reqs).where_eq(status_k, s200).sum_counter_total(), 5);
        assert_eq!(reg.query(reqs).where_missing(status_k).sum_counter_total(), 7);
        assert_eq!(reg.query(reqs).where_has(status_k).sum_counter_total(), 7);
    }

    #[test]
    fn merge_trend_combines_series() {
        let reg = Registry::default();
        let dur = reg
            .register("http_req_duration", MetricKind::Trend)
            .unwrap_or_else(|e| panic!("{e}"));
        let name_k = reg.resolve_key("name");

        for (name, v) in [("a", 10.0), ("a", 30.0), ("b", 20.0)] {
            if let Some(h) = reg.handle(dur, reg.resolve_tags([("name", name)])) {
                h.observe(v);
            }
        }

        let all = reg.query(dur).where_has(name_k).merge_trend();
        assert_eq!(all.len(), 1);
        let s = all
            .values()
            .next()
            .unwrap_or_else(|| panic!("expected one group"));
        assert_eq!(s.count, 3);
        assert_eq!(s.min, Some(10.0));
        assert_eq!(s.max, Some(30.0));
        assert_eq!(s.avg, Some(20.0));
    }
}
