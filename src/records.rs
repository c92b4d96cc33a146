use crate::forum;
use crate::storage::{KeyValueStore, StoreStatus};
use crate::types::{AvatarRecord, DEFAULT_CATEGORY, RecordDraft, RecordPatch, Snapshot};
use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;

const RECORDS_KEY: &str = "records";

#[derive(Serialize)]
struct SnapshotView<'a> {
    records: &'a [AvatarRecord],
    counter: u64,
}

/// Avatar metadata held in memory and written through to one blob on every
/// mutation. Lookups are linear scans; the collection is small.
pub struct RecordStore<B: KeyValueStore> {
    backend: B,
    records: Vec<AvatarRecord>,
    counter: u64,
    status: StoreStatus,
}

impl<B: KeyValueStore> RecordStore<B> {
    /// Loads the persisted blob. Missing data starts empty; unreadable data
    /// starts empty too and is reported through [`RecordStore::status`].
    pub fn open(backend: B) -> Self {
        let (snapshot, status) = Self::load_snapshot(&backend);
        crate::debug_log!(
            "[records] loaded count={} counter={} degraded={}",
            snapshot.records.len(),
            snapshot.counter,
            status.is_degraded()
        );
        Self {
            backend,
            records: snapshot.records,
            counter: snapshot.counter,
            status,
        }
    }

    fn load_snapshot(backend: &B) -> (Snapshot, StoreStatus) {
        let empty = Snapshot {
            records: Vec::new(),
            counter: 0,
        };
        let raw = match backend.get(RECORDS_KEY) {
            Ok(Some(raw)) => raw,
            Ok(None) => return (empty, StoreStatus::Clean),
            Err(err) => {
                crate::debug_log!("[records] read failed: {:#}", err);
                return (empty, StoreStatus::degraded(format!("{err:#}")));
            }
        };

        match decode_blob(&raw) {
            Some(snapshot) => (snapshot, StoreStatus::Clean),
            None => {
                crate::debug_log!("[records] stored blob is corrupt, starting empty");
                (empty, StoreStatus::degraded("corrupt record blob"))
            }
        }
    }

    fn persist(&mut self) {
        let result = self.write_blob();
        if let Err(err) = result.as_ref() {
            crate::debug_log!("[records] persist failed: {:#}", err);
        }
        self.status = StoreStatus::from_result(&result);
    }

    fn write_blob(&self) -> Result<()> {
        let value = serde_json::to_vec(&SnapshotView {
            records: &self.records,
            counter: self.counter,
        })
        .context("encode records")?;
        self.backend.insert(RECORDS_KEY, &value)?;
        self.backend.flush()
    }

    /// Outcome of the most recent load or write-through.
    pub fn status(&self) -> &StoreStatus {
        &self.status
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Assigns the next id, applies creation defaults and writes through.
    pub fn add(&mut self, draft: RecordDraft) -> AvatarRecord {
        self.counter = self.counter.saturating_add(1);

        let category = draft
            .category
            .filter(|category| !category.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_CATEGORY.to_string());
        let thumb = draft
            .thumb
            .filter(|thumb| !thumb.is_empty())
            .unwrap_or_else(|| draft.url.clone());
        let forum = draft
            .forum
            .unwrap_or_else(|| forum::image_embed(&draft.url));

        let record = AvatarRecord {
            id: self.counter,
            category,
            url: draft.url,
            thumb,
            delete_url: draft.delete_url,
            time: draft.time,
            forum,
        };
        self.records.push(record.clone());
        self.persist();
        record
    }

    /// Unknown ids return `None` and leave storage untouched.
    pub fn update(&mut self, id: u64, patch: RecordPatch) -> Option<AvatarRecord> {
        let record = self.records.iter_mut().find(|record| record.id == id)?;
        patch.apply(record);
        let updated = record.clone();
        self.persist();
        Some(updated)
    }

    /// Writes through even when nothing matched.
    pub fn remove(&mut self, id: u64) {
        self.records.retain(|record| record.id != id);
        self.persist();
    }

    pub fn get(&self, id: u64) -> Option<AvatarRecord> {
        self.records.iter().find(|record| record.id == id).cloned()
    }

    pub fn all(&self) -> Vec<AvatarRecord> {
        self.records.clone()
    }

    /// Distinct categories of the current records in first-seen order.
    pub fn categories(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.records
            .iter()
            .filter(|record| seen.insert(record.category.as_str()))
            .map(|record| record.category.clone())
            .collect()
    }

    pub fn export(&self) -> Snapshot {
        Snapshot {
            records: self.records.clone(),
            counter: self.counter,
        }
    }

    pub fn export_json(&self) -> Result<String> {
        serde_json::to_string_pretty(&SnapshotView {
            records: &self.records,
            counter: self.counter,
        })
        .context("encode export")
    }

    /// Replaces the whole collection. Returns `false` and changes nothing when
    /// `records` is not an array of valid records with unique ids.
    pub fn import(&mut self, data: &Value) -> bool {
        let Some(snapshot) = snapshot_from_value(data) else {
            crate::debug_log!("[records] import rejected: malformed snapshot");
            return false;
        };
        self.import_snapshot(snapshot)
    }

    pub fn import_snapshot(&mut self, snapshot: Snapshot) -> bool {
        let Some(snapshot) = normalize_snapshot(snapshot) else {
            crate::debug_log!("[records] import rejected: duplicate ids");
            return false;
        };
        crate::debug_log!(
            "[records] import count={} counter={}",
            snapshot.records.len(),
            snapshot.counter
        );
        self.records = snapshot.records;
        self.counter = snapshot.counter;
        self.persist();
        true
    }

    /// Parses an export file; malformed JSON is ignored like a malformed snapshot.
    pub fn import_json(&mut self, raw: &str) -> bool {
        match serde_json::from_str::<Value>(raw) {
            Ok(value) => self.import(&value),
            Err(err) => {
                crate::debug_log!("[records] import rejected: {}", err);
                false
            }
        }
    }
}

fn max_id(records: &[AvatarRecord]) -> u64 {
    records.iter().map(|record| record.id).max().unwrap_or(0)
}

fn snapshot_from_value(data: &Value) -> Option<Snapshot> {
    let records = data.get("records").filter(|records| records.is_array())?;
    let records = serde_json::from_value::<Vec<AvatarRecord>>(records.clone()).ok()?;
    let counter = data.get("counter").and_then(Value::as_u64).unwrap_or(0);
    Some(Snapshot { records, counter })
}

/// Rejects duplicate ids and lifts the counter to at least the highest id.
fn normalize_snapshot(snapshot: Snapshot) -> Option<Snapshot> {
    let mut ids = HashSet::with_capacity(snapshot.records.len());
    if !snapshot.records.iter().all(|record| ids.insert(record.id)) {
        return None;
    }
    let counter = snapshot.counter.max(max_id(&snapshot.records));
    Some(Snapshot {
        records: snapshot.records,
        counter,
    })
}

fn decode_blob(raw: &[u8]) -> Option<Snapshot> {
    let value = serde_json::from_slice::<Value>(raw).ok()?;
    let snapshot = if value.is_array() {
        // Older blobs stored the bare record list without a counter.
        Snapshot {
            records: serde_json::from_value(value).ok()?,
            counter: 0,
        }
    } else {
        snapshot_from_value(&value)?
    };
    normalize_snapshot(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use proptest::prelude::*;
    use serde_json::json;
    use std::sync::Arc;

    fn draft(category: &str, url: &str, time: i64) -> RecordDraft {
        RecordDraft {
            category: Some(category.to_string()),
            url: url.to_string(),
            time,
            ..Default::default()
        }
    }

    fn memory_store() -> (Arc<MemoryStore>, RecordStore<Arc<MemoryStore>>) {
        let backend = Arc::new(MemoryStore::new());
        let store = RecordStore::open(backend.clone());
        (backend, store)
    }

    #[test]
    fn add_assigns_ids_and_defaults() {
        let (_, mut store) = memory_store();

        let first = store.add(draft("Pets", "https://x/1.png", 100));
        assert_eq!(first.id, 1);
        assert_eq!(first.category, "Pets");
        assert_eq!(first.url, "https://x/1.png");
        assert_eq!(first.thumb, "https://x/1.png");
        assert_eq!(first.forum, "[img]https://x/1.png[/img]");
        assert_eq!(first.time, 100);

        let second = store.add(RecordDraft {
            url: "https://x/2.png".into(),
            thumb: Some("https://x/2_t.png".into()),
            ..Default::default()
        });
        assert_eq!(second.id, 2);
        assert_eq!(second.category, DEFAULT_CATEGORY);
        assert_eq!(second.thumb, "https://x/2_t.png");
    }

    #[test]
    fn removed_category_disappears() {
        let (_, mut store) = memory_store();
        store.add(draft("Pets", "https://x/1.png", 100));
        store.add(draft("Games", "https://x/2.png", 200));
        assert_eq!(store.categories(), vec!["Pets", "Games"]);

        store.remove(1);
        assert_eq!(store.categories(), vec!["Games"]);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn categories_are_distinct_in_first_seen_order() {
        let (_, mut store) = memory_store();
        for (category, url) in [("B", "1"), ("A", "2"), ("B", "3"), ("C", "4"), ("A", "5")] {
            store.add(draft(category, url, 0));
        }
        assert_eq!(store.categories(), vec!["B", "A", "C"]);
    }

    #[test]
    fn ids_are_not_reused_after_remove() {
        let (_, mut store) = memory_store();
        store.add(draft("A", "1", 0));
        let second = store.add(draft("A", "2", 0));
        store.remove(second.id);

        let third = store.add(draft("A", "3", 0));
        assert_eq!(third.id, 3);
    }

    #[test]
    fn update_preserves_id_and_delete_url() {
        let (_, mut store) = memory_store();
        let record = store.add(RecordDraft {
            delete_url: "https://ibb.co/del".into(),
            ..draft("Pets", "https://x/1.png", 100)
        });

        let updated = store
            .update(
                record.id,
                RecordPatch {
                    url: Some("https://x/1b.png".into()),
                    time: Some(300),
                    ..Default::default()
                },
            )
            .unwrap();

        assert_eq!(updated.id, record.id);
        assert_eq!(updated.url, "https://x/1b.png");
        assert_eq!(updated.delete_url, "https://ibb.co/del");
        assert_eq!(store.get(record.id), Some(updated));
    }

    #[test]
    fn update_unknown_id_changes_nothing() {
        let (backend, mut store) = memory_store();
        store.add(draft("Pets", "https://x/1.png", 100));
        let before = store.all();
        let blob_before = backend.get(RECORDS_KEY).unwrap();

        let result = store.update(
            42,
            RecordPatch {
                category: Some("Other".into()),
                ..Default::default()
            },
        );

        assert!(result.is_none());
        assert_eq!(store.all(), before);
        assert_eq!(backend.get(RECORDS_KEY).unwrap(), blob_before);
    }

    #[test]
    fn all_returns_a_detached_copy() {
        let (_, mut store) = memory_store();
        store.add(draft("Pets", "https://x/1.png", 100));

        let mut copy = store.all();
        copy[0].category = "Mutated".into();
        copy.clear();

        assert_eq!(store.len(), 1);
        assert_eq!(store.get(1).unwrap().category, "Pets");
    }

    #[test]
    fn remove_unknown_id_still_writes_through() {
        let (backend, mut store) = memory_store();
        store.remove(7);
        assert!(backend.get(RECORDS_KEY).unwrap().is_some());
        assert_eq!(store.status(), &StoreStatus::Clean);
    }

    #[test]
    fn export_import_round_trip() {
        let (_, mut source) = memory_store();
        source.add(draft("Pets", "https://x/1.png", 100));
        source.add(draft("Games", "https://x/2.png", 200));
        source.add(draft("Pets", "https://x/3.png", 300));
        source.remove(3);
        let exported = source.export_json().unwrap();

        let (_, mut target) = memory_store();
        assert!(target.import_json(&exported));

        assert_eq!(target.export(), source.export());
        assert_eq!(target.counter(), 3);
        assert_eq!(target.export_json().unwrap(), exported);
        assert_eq!(target.add(draft("New", "https://x/4.png", 400)).id, 4);
    }

    #[test]
    fn import_rejects_non_array_records() {
        let (backend, mut store) = memory_store();
        store.add(draft("Pets", "https://x/1.png", 100));
        let before = store.export();
        let blob_before = backend.get(RECORDS_KEY).unwrap();

        for bad in [
            json!({ "records": "nope", "counter": 5 }),
            json!({ "records": { "0": {} } }),
            json!({ "counter": 5 }),
            json!(null),
            json!([{ "id": 1 }]),
        ] {
            assert!(!store.import(&bad), "accepted {bad}");
        }

        assert_eq!(store.export(), before);
        assert_eq!(backend.get(RECORDS_KEY).unwrap(), blob_before);
    }

    #[test]
    fn import_is_all_or_nothing_for_bad_elements() {
        let (_, mut store) = memory_store();
        store.add(draft("Pets", "https://x/1.png", 100));
        let before = store.export();

        let bad_element = json!({ "records": [{ "id": 1, "url": "a" }, { "url": "no id" }] });
        let duplicate_ids = json!({ "records": [{ "id": 2 }, { "id": 2 }] });
        assert!(!store.import(&bad_element));
        assert!(!store.import(&duplicate_ids));
        assert!(!store.import_json("{ not json"));
        assert_eq!(store.export(), before);
    }

    #[test]
    fn import_recomputes_counter_when_absent() {
        let (_, mut store) = memory_store();
        let data = json!({
            "records": [
                { "id": 4, "category": "A", "url": "u4" },
                { "id": 9, "category": "B", "url": "u9" }
            ]
        });
        assert!(store.import(&data));
        assert_eq!(store.counter(), 9);

        assert!(store.import(&json!({ "records": [] })));
        assert_eq!(store.counter(), 0);
        assert!(store.is_empty());
    }

    #[test]
    fn import_keeps_counter_at_or_above_max_id() {
        let (_, mut store) = memory_store();
        assert!(store.import(&json!({ "records": [{ "id": 5 }], "counter": 12 })));
        assert_eq!(store.counter(), 12);

        assert!(store.import(&json!({ "records": [{ "id": 5 }], "counter": 2 })));
        assert_eq!(store.counter(), 5);
    }

    #[test]
    fn corrupt_blob_loads_empty_and_degraded() {
        let backend = Arc::new(MemoryStore::new());
        backend.insert(RECORDS_KEY, b"{ this is not json").unwrap();

        let mut store = RecordStore::open(backend.clone());
        assert!(store.is_empty());
        assert_eq!(store.counter(), 0);
        assert!(store.status().is_degraded());

        store.add(draft("Pets", "https://x/1.png", 100));
        assert_eq!(store.status(), &StoreStatus::Clean);
    }

    #[test]
    fn legacy_array_blob_recomputes_counter() {
        let backend = Arc::new(MemoryStore::new());
        backend
            .insert(
                RECORDS_KEY,
                br#"[{"id":2,"category":"A","url":"u2"},{"id":6,"category":"B","url":"u6"}]"#,
            )
            .unwrap();

        let store = RecordStore::open(backend);
        assert_eq!(store.len(), 2);
        assert_eq!(store.counter(), 6);
        assert_eq!(store.status(), &StoreStatus::Clean);
    }

    #[test]
    fn failed_write_is_reported_not_raised() {
        let (backend, mut store) = memory_store();
        backend.set_fail_writes(true);

        let record = store.add(draft("Pets", "https://x/1.png", 100));
        assert_eq!(record.id, 1);
        assert_eq!(store.len(), 1);
        assert!(store.status().is_degraded());
    }

    #[test]
    fn counter_survives_reopen_on_sled() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let tree = db.open_tree(crate::storage::RECORDS_TREE).unwrap();

        let mut store = RecordStore::open(tree.clone());
        store.add(draft("A", "1", 0));
        let second = store.add(draft("B", "2", 0));
        store.remove(second.id);
        drop(store);

        let mut reopened = RecordStore::open(tree);
        assert_eq!(reopened.len(), 1);
        assert_eq!(reopened.counter(), 2);
        assert_eq!(reopened.add(draft("C", "3", 0)).id, 3);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Add(String),
        Remove(u64),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            "[A-C]".prop_map(Op::Add),
            (1u64..20).prop_map(Op::Remove),
        ]
    }

    proptest! {
        #[test]
        fn assigned_ids_strictly_increase(ops in proptest::collection::vec(op_strategy(), 1..40)) {
            let (_, mut store) = memory_store();
            let mut last_id = 0;
            let mut issued = HashSet::new();

            for op in ops {
                match op {
                    Op::Add(category) => {
                        let record = store.add(draft(&category, "u", 0));
                        prop_assert!(record.id > last_id);
                        prop_assert!(issued.insert(record.id));
                        last_id = record.id;
                    }
                    Op::Remove(id) => store.remove(id),
                }
                prop_assert!(store.counter() >= max_id(&store.all()));
            }

            let categories = store.categories();
            let unique: HashSet<_> = categories.iter().collect();
            prop_assert_eq!(unique.len(), categories.len());
        }
    }
}
