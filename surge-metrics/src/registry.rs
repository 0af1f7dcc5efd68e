use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::agg::Query;
use crate::error::{Error, Result};
use crate::key::{Interner, KeyId};
use crate::metrics::{MetricHandle, MetricKind, MetricSeriesSummary, MetricValue};
use crate::tags::TagSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MetricId(u32);

#[derive(Debug)]
struct MetricDef {
    name: KeyId,
    kind: MetricKind,
}

/// Named, typed metric store. Each metric owns any number of tagged series; the
/// series with the empty tag set is the metric's base series.
#[derive(Debug, Default)]
pub struct Registry {
    interner: Interner,
    defs: RwLock<Vec<MetricDef>>,
    series: DashMap<MetricId, DashMap<TagSet, MetricHandle>>,
}

impl Registry {
    /// Registers `name` with `kind`. Registering an existing name with the same kind
    /// returns the existing id.
    pub fn register(&self, name: &str, kind: MetricKind) -> Result<MetricId> {
        let name_id = self.interner.get_or_intern(name);

        let mut defs = self.defs.write();
        if let Some((idx, def)) = defs.iter().enumerate().find(|(_, d)| d.name == name_id) {
            if def.kind != kind {
                return Err(Error::KindMismatch {
                    name: name.to_string(),
                    registered: def.kind,
                    requested: kind,
                });
            }
            return Ok(MetricId(idx as u32));
        }

        let id = MetricId(defs.len() as u32);
        defs.push(MetricDef {
            name: name_id,
            kind,
        });
        self.series.insert(id, DashMap::new());
        Ok(id)
    }

    pub fn lookup(&self, name: &str) -> Option<(MetricId, MetricKind)> {
        let name_id = self.interner.get(name)?;
        let defs = self.defs.read();
        defs.iter()
            .enumerate()
            .find(|(_, d)| d.name == name_id)
            .map(|(idx, d)| (MetricId(idx as u32), d.kind))
    }

    pub fn kind(&self, metric: MetricId) -> Option<MetricKind> {
        self.defs.read().get(metric.0 as usize).map(|d| d.kind)
    }

    pub fn name(&self, metric: MetricId) -> Option<Arc<str>> {
        let name = self.defs.read().get(metric.0 as usize)?.name;
        self.interner.resolve(name)
    }

    pub fn resolve_key(&self, key: &str) -> KeyId {
        self.interner.get_or_intern(key)
    }

    /// Like [`Registry::resolve_key`] but never interns.
    pub fn lookup_key(&self, key: &str) -> Option<KeyId> {
        self.interner.get(key)
    }

    pub fn key_name(&self, key: KeyId) -> Option<Arc<str>> {
        self.interner.resolve(key)
    }

    pub fn resolve_tags<'a>(&self, tags: impl IntoIterator<Item = (&'a str, &'a str)>) -> TagSet {
        let mut resolved: Vec<(KeyId, KeyId)> = tags
            .into_iter()
            .map(|(k, v)| (self.resolve_key(k), self.resolve_key(v)))
            .collect();
        resolved.sort_unstable();
        resolved.dedup_by_key(|(k, _)| *k);
        TagSet::from_sorted_iter(resolved)
    }

    pub fn tag_names(&self, tags: &TagSet) -> Vec<(String, String)> {
        tags.iter()
            .map(|(k, v)| {
                (
                    self.key_name(k).map(|s| s.to_string()).unwrap_or_default(),
                    self.key_name(v).map(|s| s.to_string()).unwrap_or_default(),
                )
            })
            .collect()
    }

    /// Returns the handle for one series, creating the series on first use.
    pub fn handle(&self, metric: MetricId, tags: TagSet) -> Option<MetricHandle> {
        let series_map = self.series.get(&metric)?;

        if let Some(handle) = series_map.get(&tags) {
            return Some(handle.value().clone());
        }

        let kind = self.kind(metric)?;
        let handle = series_map
            .entry(tags)
            .or_insert_with(|| MetricHandle::new(kind))
            .value()
            .clone();
        Some(handle)
    }

    pub fn base(&self, metric: MetricId) -> Option<MetricHandle> {
        self.handle(metric, TagSet::default())
    }

    /// Current value of the base series. Reading never creates a series.
    pub fn base_value(&self, metric: MetricId) -> Option<MetricValue> {
        let series_map = self.series.get(&metric)?;
        let handle = series_map.get(&TagSet::default())?;
        Some(handle.value().value())
    }

    /// Percentile `p` (0..=100) of a trend's base series.
    pub fn trend_percentile(&self, metric: MetricId, p: f64) -> Option<f64> {
        let series_map = self.series.get(&metric)?;
        let handle = series_map.get(&TagSet::default())?;
        match handle.value() {
            MetricHandle::Trend(t) => t.with_data(|d| d.percentile(p)),
            _ => None,
        }
    }

    pub fn visit_series(&self, metric: MetricId, mut f: impl FnMut(&TagSet, &MetricHandle)) {
        let Some(series_map) = self.series.get(&metric) else {
            return;
        };
        for series in series_map.iter() {
            f(series.key(), series.value());
        }
    }

    pub fn query(&self, metric: MetricId) -> Query<'_> {
        Query::new(self, metric)
    }

    /// Base-series value of every registered metric in registration order. Metrics
    /// without samples report [`MetricValue::empty`].
    pub fn base_values(&self) -> Vec<(String, MetricKind, MetricValue)> {
        let defs: Vec<(MetricId, KeyId, MetricKind)> = self
            .defs
            .read()
            .iter()
            .enumerate()
            .map(|(idx, d)| (MetricId(idx as u32), d.name, d.kind))
            .collect();

        defs.into_iter()
            .map(|(id, name, kind)| {
                let name = self.key_name(name).map(|s| s.to_string()).unwrap_or_default();
                let value = self
                    .base_value(id)
                    .unwrap_or_else(|| MetricValue::empty(kind));
                (name, kind, value)
            })
            .collect()
    }

    /// Every series of every metric, sorted by metric name and then by tags.
    pub fn summarize(&self) -> Vec<MetricSeriesSummary> {
        let defs: Vec<(MetricId, KeyId, MetricKind)> = self
            .defs
            .read()
            .iter()
            .enumerate()
            .map(|(idx, d)| (MetricId(idx as u32), d.name, d.kind))
            .collect();

        let mut out = Vec::new();
        for (id, name, kind) in defs {
            let name = self.key_name(name).map(|s| s.to_string()).unwrap_or_default();
            self.visit_series(id, |tags, handle| {
                out.push(MetricSeriesSummary {
                    name: name.clone(),
                    kind,
                    tags: self.tag_names(tags),
                    value: handle.value(),
                });
            });
        }

        out.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.tags.cmp(&b.tags)));
        out
    }
}
