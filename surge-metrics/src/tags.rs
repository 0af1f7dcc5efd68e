use crate::key::KeyId;
use smallvec::SmallVec;

/// Sorted set of interned `(key, value)` pairs identifying one series of a metric.
///
/// The empty set identifies the base series that every sample is recorded into.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct TagSet {
    // Tag sets are small (observation tags plus one or two built-ins).
    pub(crate) tags: SmallVec<[(KeyId, KeyId); 4]>,
}

impl TagSet {
    /// Builds a tag set from pairs already sorted by key.
    pub fn from_sorted_iter(iter: impl IntoIterator<Item = (KeyId, KeyId)>) -> Self {
        Self {
            tags: iter.into_iter().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (KeyId, KeyId)> + '_ {
        self.tags.iter().copied()
    }

    pub fn get(&self, key: KeyId) -> Option<KeyId> {
        let slice: &[(KeyId, KeyId)] = &self.tags;
        let idx = slice.partition_point(|(k, _)| *k < key);
        slice.get(idx).and_then(|(k, v)| (*k == key).then_some(*v))
    }

    /// Keeps only the given keys (used for `group_by`).
    pub fn project(&self, keys: &[KeyId]) -> TagSet {
        let mut out = SmallVec::<[(KeyId, KeyId); 4]>::new();
        for key in keys {
            if let Some(value) = self.get(*key) {
                out.push((*key, value));
            }
        }
        out.sort_unstable();
        TagSet { tags: out }
    }
}
