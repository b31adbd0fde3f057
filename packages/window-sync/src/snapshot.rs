//! Conversion between live store state and wire snapshots.
//!
//! `project` is what the primary broadcasts; `restore` is what a secondary
//! writes back. The codec never fails: anything it cannot make sense of in a
//! cache payload is skipped and logged, leaving at worst an empty cache.

use std::num::NonZeroUsize;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::protocol::{StateSnapshot, SyncConfig, DEFAULT_CACHE_CAPACITY, MAX_CACHE_CAPACITY};
use crate::store::{CacheFieldSpec, CachedEntries, FieldValue, StatePatch, StateSchema, StateStore, StoreState};

/// Projects and restores state according to a store's [`StateSchema`].
///
/// The schema is captured once per store; every projection reuses it.
#[derive(Debug, Clone)]
pub struct SnapshotCodec {
    schema: Arc<StateSchema>,
    default_capacity: NonZeroUsize,
}

impl SnapshotCodec {
    pub fn new(schema: Arc<StateSchema>, default_capacity: usize) -> Self {
        Self {
            schema,
            default_capacity: NonZeroUsize::new(default_capacity)
                .or(NonZeroUsize::new(DEFAULT_CACHE_CAPACITY))
                .unwrap_or(NonZeroUsize::MIN),
        }
    }

    pub fn for_store<S: StateStore>(store: &S, config: &SyncConfig) -> Self {
        Self::new(store.schema(), config.default_cache_capacity)
    }

    pub fn schema(&self) -> &StateSchema {
        &self.schema
    }

    /// Wire projection of `state`: actions and local-only fields removed,
    /// caches flattened to `{id: value}` maps.
    pub fn project(&self, state: &StoreState) -> StateSnapshot {
        let mut snapshot = Map::new();
        for (name, value) in state.iter() {
            if !self.schema.is_synced(name) {
                continue;
            }
            let wire = match value {
                FieldValue::Data(value) => value.clone(),
                FieldValue::Cache(cache) => encode_cache(cache),
            };
            snapshot.insert(name.to_string(), wire);
        }
        snapshot
    }

    /// Turn an incoming snapshot into a patch for a store currently holding
    /// `current`.
    ///
    /// Cache capacity comes from the snapshot's hint field, else the
    /// receiver's hint field, else the configured default.
    pub fn restore(&self, snapshot: &StateSnapshot, current: &StoreState) -> StatePatch {
        let mut patch = StatePatch::new();
        for (name, value) in snapshot {
            if !self.schema.is_synced(name) {
                debug!(field = %name, "dropping unsynced field from incoming snapshot");
                continue;
            }
            match self.schema.cache_spec(name) {
                Some(spec) => {
                    let capacity = self.capacity_for(spec, snapshot, current);
                    patch.set(name.clone(), decode_cache(name, value, capacity));
                }
                None => patch.set(name.clone(), value.clone()),
            }
        }
        patch
    }

    fn capacity_for(
        &self,
        spec: &CacheFieldSpec,
        snapshot: &StateSnapshot,
        current: &StoreState,
    ) -> NonZeroUsize {
        let Some(hint) = spec.capacity_hint.as_deref() else {
            return self.default_capacity;
        };
        snapshot
            .get(hint)
            .and_then(capacity_from)
            .or_else(|| current.data(hint).and_then(capacity_from))
            .unwrap_or(self.default_capacity)
    }
}

/// Flatten a cache into `{"<id>": value}`.
pub fn encode_cache(cache: &CachedEntries) -> Value {
    let map: Map<String, Value> = cache
        .iter()
        .map(|(id, value)| (id.to_string(), value.clone()))
        .collect();
    Value::Object(map)
}

/// Rebuild a cache from `{"<id>": value}`, inserting in ascending id order.
///
/// Entries with non-numeric ids are skipped; a non-object payload yields an
/// empty cache.
pub fn decode_cache(field: &str, wire: &Value, capacity: NonZeroUsize) -> CachedEntries {
    let map = match wire {
        Value::Object(map) => map,
        Value::Null => return CachedEntries::new(capacity),
        other => {
            warn!(field, kind = json_kind(other), "cache payload is not an object, using empty cache");
            return CachedEntries::new(capacity);
        }
    };

    let mut entries: Vec<(u64, Value)> = Vec::with_capacity(map.len());
    for (key, value) in map {
        match key.parse::<u64>() {
            Ok(id) => entries.push((id, value.clone())),
            Err(_) => warn!(field, key = %key, "skipping cache entry with non-numeric id"),
        }
    }
    entries.sort_by_key(|(id, _)| *id);

    CachedEntries::from_entries(entries, capacity)
}

/// Reads a positive integral hint, clamped to [`MAX_CACHE_CAPACITY`].
fn capacity_from(value: &Value) -> Option<NonZeroUsize> {
    let n = match value.as_u64() {
        Some(n) => usize::try_from(n).unwrap_or(usize::MAX),
        None => {
            let f = value.as_f64()?;
            if !f.is_finite() || f < 1.0 || f.fract() != 0.0 {
                return None;
            }
            if f >= MAX_CACHE_CAPACITY as f64 {
                MAX_CACHE_CAPACITY
            } else {
                f as usize
            }
        }
    };
    NonZeroUsize::new(n.min(MAX_CACHE_CAPACITY))
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{RemoteApply, Store};
    use serde_json::json;

    fn cap(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).unwrap()
    }

    fn store() -> Store {
        Store::builder()
            .field("volume", json!(0.7))
            .field("windowSize", json!(3))
            .cache_field_with_hint("cachedSongs", cap(3), "windowSize")
            .cache_field("artwork", cap(2))
            .local_field("outputDevice", json!("speakers"))
            .action("play", |_store, _args| async move { Ok(()) })
            .build()
            .unwrap()
    }

    fn codec(store: &Store) -> SnapshotCodec {
        SnapshotCodec::for_store(store, &SyncConfig::default())
    }

    #[test]
    fn test_project_strips_actions_and_local_fields() {
        let store = store();
        store.mutate(|state| {
            if let Some(cache) = state.cache_mut("cachedSongs") {
                cache.insert(12, json!({ "title": "B" }));
                cache.insert(4, json!({ "title": "A" }));
            }
        });

        let snapshot = codec(&store).project(&store.state());

        assert!(!snapshot.contains_key("play"));
        assert!(!snapshot.contains_key("outputDevice"));
        assert_eq!(snapshot["volume"], json!(0.7));
        assert_eq!(
            snapshot["cachedSongs"],
            json!({ "4": { "title": "A" }, "12": { "title": "B" } })
        );
        assert_eq!(snapshot["artwork"], json!({}));
    }

    #[test]
    fn test_cache_round_trip_keeps_keys_and_values() {
        let original =
            CachedEntries::from_entries((1..=5).map(|id| (id * 10, json!(format!("song-{id}")))), cap(8));

        let restored = decode_cache("cachedSongs", &encode_cache(&original), cap(8));

        assert_eq!(restored, original);
        let mut keys: Vec<u64> = restored.keys().copied().collect();
        keys.sort_unstable();
        assert_eq!(keys, vec![10, 20, 30, 40, 50]);
    }

    #[test]
    fn test_capacity_prefers_incoming_hint() {
        let store = store();
        let snapshot: StateSnapshot = serde_json::from_value(json!({
            "windowSize": 2,
            "cachedSongs": { "1": "a", "2": "b", "3": "c" }
        }))
        .unwrap();

        let patch = codec(&store).restore(&snapshot, &store.state());
        let cache = patch.get("cachedSongs").and_then(FieldValue::as_cache).unwrap();

        assert_eq!(cache.capacity().get(), 2);
        assert_eq!(cache.keys().copied().collect::<Vec<_>>(), vec![2, 3]);
    }

    #[test]
    fn test_capacity_falls_back_to_receiver_hint_then_default() {
        let store = store();
        let snapshot: StateSnapshot =
            serde_json::from_value(json!({ "cachedSongs": { "1": "a" } })).unwrap();

        let patch = codec(&store).restore(&snapshot, &store.state());
        let cache = patch.get("cachedSongs").and_then(FieldValue::as_cache).unwrap();
        assert_eq!(cache.capacity().get(), 3);

        // A zero hint is not a capacity.
        store.apply_remote(StatePatch::new().with("windowSize", json!(0)));
        let patch = codec(&store).restore(&snapshot, &store.state());
        let cache = patch.get("cachedSongs").and_then(FieldValue::as_cache).unwrap();
        assert_eq!(cache.capacity().get(), DEFAULT_CACHE_CAPACITY);
    }

    #[test]
    fn test_cache_without_hint_uses_default_capacity() {
        let store = store();
        let snapshot: StateSnapshot =
            serde_json::from_value(json!({ "artwork": { "9": "cover.png" } })).unwrap();

        let patch = codec(&store).restore(&snapshot, &store.state());
        let cache = patch.get("artwork").and_then(FieldValue::as_cache).unwrap();
        assert_eq!(cache.capacity().get(), DEFAULT_CACHE_CAPACITY);
        assert_eq!(cache.get(&9), Some(&json!("cover.png")));
    }

    #[test]
    fn test_restore_drops_unsynced_names() {
        let store = store();
        let snapshot: StateSnapshot = serde_json::from_value(json!({
            "play": "not a function",
            "outputDevice": "headphones",
            "volume": 0.2
        }))
        .unwrap();

        let patch = codec(&store).restore(&snapshot, &store.state());

        assert_eq!(patch.len(), 1);
        assert_eq!(patch.get("volume"), Some(&FieldValue::Data(json!(0.2))));
    }

    #[test]
    fn test_malformed_cache_payload_degrades_to_empty() {
        let cache = decode_cache("cachedSongs", &json!([1, 2, 3]), cap(5));
        assert!(cache.is_empty());

        let cache = decode_cache("cachedSongs", &json!("oops"), cap(5));
        assert!(cache.is_empty());

        let cache = decode_cache("cachedSongs", &Value::Null, cap(5));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_non_numeric_ids_are_skipped() {
        let cache = decode_cache(
            "cachedSongs",
            &json!({ "3": "keep", "abc": "drop", "-1": "drop" }),
            cap(5),
        );
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&3), Some(&json!("keep")));
    }

    #[test]
    fn test_capacity_from_number_shapes() {
        assert_eq!(capacity_from(&json!(25)), Some(cap(25)));
        assert_eq!(capacity_from(&json!(25.0)), Some(cap(25)));
        assert_eq!(capacity_from(&json!(2.5)), None);
        assert_eq!(capacity_from(&json!(0)), None);
        assert_eq!(capacity_from(&json!(-4)), None);
        assert_eq!(capacity_from(&json!("25")), None);
    }

    #[test]
    fn test_capacity_from_clamps_huge_hints() {
        let ceiling = Some(cap(MAX_CACHE_CAPACITY));
        assert_eq!(capacity_from(&json!(1e300)), ceiling);
        assert_eq!(capacity_from(&json!(u64::MAX)), ceiling);
        assert_eq!(capacity_from(&json!(MAX_CACHE_CAPACITY + 1)), ceiling);
        assert_eq!(capacity_from(&json!(MAX_CACHE_CAPACITY)), ceiling);
    }
}
