//! In-process `Store` used by `--store memory` dev mode and by the
//! scenario tests in `tests/`, which need many simulated workers sharing
//! one store without a real Postgres instance.

use super::{ExpectedCounter, PutOutcome, Store, StoredRow};
use crate::error::Result;
use crate::model::RowId;
use std::collections::BTreeMap;
use std::sync::Mutex;

#[derive(Default)]
pub struct InMemoryStore {
    rows: Mutex<BTreeMap<RowId, (u64, serde_json::Value)>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl Store for InMemoryStore {
    async fn get(&self, row_id: &RowId) -> Result<Option<StoredRow>> {
        let rows = self.rows.lock().unwrap();
        Ok(rows.get(row_id).map(|(counter, payload)| StoredRow {
            row_id: row_id.clone(),
            counter: *counter,
            payload: payload.clone(),
        }))
    }

    async fn conditional_put(
        &self,
        row_id: &RowId,
        expected: ExpectedCounter,
        payload: serde_json::Value,
    ) -> Result<PutOutcome> {
        let mut rows = self.rows.lock().unwrap();
        let current = rows.get(row_id).map(|(counter, _)| *counter);

        let matches = match (expected, current) {
            (ExpectedCounter::Absent, None) => true,
            (ExpectedCounter::Is(expected), Some(actual)) => expected == actual,
            _ => false,
        };
        if !matches {
            return Ok(PutOutcome::Conflict);
        }

        let next_counter = current.map(|c| c + 1).unwrap_or(1);
        rows.insert(row_id.clone(), (next_counter, payload));
        Ok(PutOutcome::Written(next_counter))
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<StoredRow>> {
        let rows = self.rows.lock().unwrap();
        Ok(rows
            .iter()
            .filter(|(row_id, _)| row_id.as_str().starts_with(prefix))
            .map(|(row_id, (counter, payload))| StoredRow {
                row_id: row_id.clone(),
                counter: *counter,
                payload: payload.clone(),
            })
            .collect())
    }

    async fn delete(&self, row_id: &RowId, expected_counter: u64) -> Result<PutOutcome> {
        let mut rows = self.rows.lock().unwrap();
        match rows.get(row_id) {
            Some((counter, _)) if *counter == expected_counter => {
                rows.remove(row_id);
                Ok(PutOutcome::Written(expected_counter + 1))
            }
            _ => Ok(PutOutcome::Conflict),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn create_then_conflict_on_recreate() {
        let store = InMemoryStore::new();
        let row_id = RowId::lease("s-1");

        let outcome = store
            .conditional_put(&row_id, ExpectedCounter::Absent, json!({"n": 1}))
            .await
            .unwrap();
        assert_eq!(outcome, PutOutcome::Written(1));

        let outcome = store
            .conditional_put(&row_id, ExpectedCounter::Absent, json!({"n": 2}))
            .await
            .unwrap();
        assert_eq!(outcome, PutOutcome::Conflict);
    }

    #[tokio::test]
    async fn conditional_update_requires_current_counter() {
        let store = InMemoryStore::new();
        let row_id = RowId::lease("s-1");
        store
            .conditional_put(&row_id, ExpectedCounter::Absent, json!({"n": 1}))
            .await
            .unwrap();

        let stale = store
            .conditional_put(&row_id, ExpectedCounter::Is(99), json!({"n": 2}))
            .await
            .unwrap();
        assert_eq!(stale, PutOutcome::Conflict);

        let fresh = store
            .conditional_put(&row_id, ExpectedCounter::Is(1), json!({"n": 2}))
            .await
            .unwrap();
        assert_eq!(fresh, PutOutcome::Written(2));
    }

    #[tokio::test]
    async fn scan_filters_by_prefix() {
        let store = InMemoryStore::new();
        store
            .conditional_put(&RowId::lease("s-1"), ExpectedCounter::Absent, json!({}))
            .await
            .unwrap();
        store
            .conditional_put(&RowId::cap("app"), ExpectedCounter::Absent, json!({}))
            .await
            .unwrap();

        let leases = store.scan("lease/").await.unwrap();
        assert_eq!(leases.len(), 1);
        assert_eq!(leases[0].row_id, RowId::lease("s-1"));
    }

    #[tokio::test]
    async fn delete_requires_matching_counter() {
        let store = InMemoryStore::new();
        let row_id = RowId::lease("s-1");
        store
            .conditional_put(&row_id, ExpectedCounter::Absent, json!({}))
            .await
            .unwrap();

        assert_eq!(store.delete(&row_id, 0).await.unwrap(), PutOutcome::Conflict);
        assert!(matches!(
            store.delete(&row_id, 1).await.unwrap(),
            PutOutcome::Written(_)
        ));
        assert!(store.get(&row_id).await.unwrap().is_none());
    }
}
