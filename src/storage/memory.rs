use std::collections::HashMap;

use crate::broker::job::JobHandle;
use crate::storage::{JobRecord, JobStore, StoreResult};

/// In-process backend: jobs survive broker reconstruction within the same
/// process (replay works), nothing survives the process itself.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: HashMap<JobHandle, JobRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl JobStore for MemoryStore {
    fn add(&mut self, record: &JobRecord) -> StoreResult<()> {
        self.records.insert(record.handle.clone(), record.clone());
        Ok(())
    }

    fn flush(&mut self) -> StoreResult<()> {
        Ok(())
    }

    fn done(&mut self, handle: &JobHandle) -> StoreResult<()> {
        self.records.remove(handle);
        Ok(())
    }

    fn replay(&mut self, callback: &mut dyn FnMut(JobRecord)) -> StoreResult<()> {
        // Replay in arrival order so FIFO within a priority tier survives
        // a restart.
        let mut records: Vec<&JobRecord> = self.records.values().collect();
        records.sort_by(|a, b| (a.created_at, &a.handle).cmp(&(b.created_at, &b.handle)));
        for record in records {
            callback(record.clone());
        }
        Ok(())
    }

    fn exists_by_unique(&mut self, function_name: &str, unique_key: &str) -> StoreResult<bool> {
        Ok(self
            .records
            .values()
            .any(|r| r.function_name == function_name && r.unique_key == unique_key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::job::Priority;

    fn record(seq: u64, function: &str, unique: &str) -> JobRecord {
        JobRecord {
            handle: JobHandle(format!("H:test:{}", seq)),
            function_name: function.to_string(),
            unique_key: unique.to_string(),
            payload: b"payload".to_vec(),
            priority: Priority::Normal,
            created_at: chrono::Utc::now(),
            run_at: None,
        }
    }

    #[test]
    fn add_done_roundtrip() {
        let mut store = MemoryStore::new();
        let r = record(1, "resize", "");
        store.add(&r).unwrap();
        assert_eq!(store.len(), 1);
        store.done(&r.handle).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn replay_streams_all_records() {
        let mut store = MemoryStore::new();
        store.add(&record(1, "resize", "")).unwrap();
        store.add(&record(2, "thumbnail", "")).unwrap();

        let mut seen = Vec::new();
        store.replay(&mut |r| seen.push(r.handle.clone())).unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], JobHandle("H:test:1".to_string()));
        assert_eq!(seen[1], JobHandle("H:test:2".to_string()));
    }

    // A file-backed backend would persist records as JSON lines; make
    // sure the record's shape actually supports that.
    #[test]
    fn record_survives_json() {
        let r = record(7, "resize", "img-7");
        let line = serde_json::to_string(&r).unwrap();
        let back: JobRecord = serde_json::from_str(&line).unwrap();
        assert_eq!(back.handle, r.handle);
        assert_eq!(back.unique_key, r.unique_key);
        assert_eq!(back.created_at, r.created_at);
    }

    #[test]
    fn exists_by_unique_matches_function_and_key() {
        let mut store = MemoryStore::new();
        store.add(&record(1, "resize", "img-42")).unwrap();

        assert!(store.exists_by_unique("resize", "img-42").unwrap());
        assert!(!store.exists_by_unique("resize", "img-43").unwrap());
        assert!(!store.exists_by_unique("thumbnail", "img-42").unwrap());
    }
}
