use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use lectern::admin::{AdminData, AdminResource, Row, SourceError, TableSource};
use lectern::cache::{CacheConfig, CacheError, QueryClient, QueryState};
use serde_json::{Value, json};
use tokio::time::Instant;

/// Table source backed by in-memory maps, counting reads per table.
#[derive(Default)]
struct MemorySource {
    tables: Mutex<HashMap<String, Vec<Row>>>,
    reads: Mutex<HashMap<String, usize>>,
    writes: AtomicUsize,
    reject_writes: bool,
}

impl MemorySource {
    fn with_rows(table: &str, rows: Vec<Row>) -> Self {
        let source = Self::default();
        source
            .tables
            .lock()
            .expect("tables lock")
            .insert(table.to_string(), rows);
        source
    }

    fn reads(&self, table: &str) -> usize {
        self.reads
            .lock()
            .expect("reads lock")
            .get(table)
            .copied()
            .unwrap_or(0)
    }

    fn record_read(&self, table: &str) {
        *self
            .reads
            .lock()
            .expect("reads lock")
            .entry(table.to_string())
            .or_default() += 1;
    }

    fn check_write(&self) -> Result<(), SourceError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if self.reject_writes {
            return Err(SourceError::rejected("row level security"));
        }
        Ok(())
    }
}

fn row_id(row: &Row) -> Option<&str> {
    row.get("id").and_then(Value::as_str)
}

#[async_trait]
impl TableSource for MemorySource {
    async fn select_all(&self, table: &str) -> Result<Vec<Row>, SourceError> {
        self.record_read(table);
        let tables = self.tables.lock().expect("tables lock");
        Ok(tables.get(table).cloned().unwrap_or_default())
    }

    async fn select_one(&self, table: &str, id: &str) -> Result<Row, SourceError> {
        self.record_read(table);
        let tables = self.tables.lock().expect("tables lock");
        tables
            .get(table)
            .and_then(|rows| rows.iter().find(|row| row_id(row) == Some(id)))
            .cloned()
            .ok_or_else(|| SourceError::not_found(table, id))
    }

    async fn insert(&self, table: &str, row: Row) -> Result<Row, SourceError> {
        self.check_write()?;
        let mut tables = self.tables.lock().expect("tables lock");
        tables.entry(table.to_string()).or_default().push(row.clone());
        Ok(row)
    }

    async fn update(&self, table: &str, id: &str, patch: Row) -> Result<Row, SourceError> {
        self.check_write()?;
        let mut tables = self.tables.lock().expect("tables lock");
        let row = tables
            .get_mut(table)
            .and_then(|rows| rows.iter_mut().find(|row| row_id(row) == Some(id)))
            .ok_or_else(|| SourceError::not_found(table, id))?;
        if let (Some(target), Some(fields)) = (row.as_object_mut(), patch.as_object()) {
            for (name, value) in fields {
                target.insert(name.clone(), value.clone());
            }
        }
        Ok(row.clone())
    }

    async fn delete(&self, table: &str, id: &str) -> Result<(), SourceError> {
        self.check_write()?;
        let mut tables = self.tables.lock().expect("tables lock");
        if let Some(rows) = tables.get_mut(table) {
            rows.retain(|row| row_id(row) != Some(id));
        }
        Ok(())
    }
}

fn admin(source: &Arc<MemorySource>) -> AdminData {
    let client = QueryClient::new(CacheConfig {
        stale_time_ms: 60_000,
        retry_count: 0,
        ..Default::default()
    });
    AdminData::new(client, Arc::clone(source) as Arc<dyn TableSource>)
}

fn list_len(state: &QueryState<Value>) -> usize {
    state
        .value()
        .and_then(|value| value.as_array())
        .map(Vec::len)
        .unwrap_or_default()
}

#[tokio::test(start_paused = true)]
async fn lists_are_cached_until_a_write() {
    let source = Arc::new(MemorySource::with_rows(
        "articles",
        vec![json!({ "id": "a1", "title": "Sécurité incendie" })],
    ));
    let admin = admin(&source);

    let first = admin.list(AdminResource::Articles).await;
    let second = admin.list(AdminResource::Articles).await;
    assert_eq!(list_len(&first), 1);
    assert!(second.is_from_cache());
    assert_eq!(source.reads("articles"), 1);

    admin
        .create(
            AdminResource::Articles,
            json!({ "id": "a2", "title": "Gestes et postures" }),
        )
        .await
        .expect("insert article");

    let showing = admin.list(AdminResource::Articles).await;
    assert!(matches!(showing, QueryState::StaleButShowing(_)));
    assert_eq!(list_len(&showing), 1);

    tokio::time::sleep(Duration::from_millis(10)).await;
    let refreshed = admin.list(AdminResource::Articles).await;
    assert!(refreshed.is_from_cache());
    assert_eq!(list_len(&refreshed), 2);
    assert_eq!(source.reads("articles"), 2);
}

#[tokio::test(start_paused = true)]
async fn category_update_invalidates_embedding_resources() {
    let source = Arc::new(MemorySource::with_rows(
        "categories",
        vec![json!({ "id": "c1", "name": "Santé" })],
    ));
    source
        .tables
        .lock()
        .expect("tables lock")
        .insert("articles".into(), vec![json!({ "id": "a1", "category_id": "c1" })]);
    let admin = admin(&source);

    admin.list(AdminResource::Articles).await;
    admin.list(AdminResource::Contacts).await;
    admin.detail(AdminResource::Categories, "c1").await;

    let updated = admin
        .update(AdminResource::Categories, "c1", json!({ "name": "Santé au travail" }))
        .await
        .expect("update category");
    assert_eq!(updated["name"], "Santé au travail");

    let store = admin.client().store();
    let now = Instant::now();
    let stale = |resource: AdminResource| {
        store
            .get(&resource.list_key())
            .is_some_and(|entry| entry.is_stale_at(now))
    };
    assert!(stale(AdminResource::Articles));
    assert!(!stale(AdminResource::Contacts));
    assert!(
        store
            .get(&AdminResource::Categories.detail_key("c1"))
            .is_some_and(|entry| entry.is_stale_at(now))
    );
}

#[tokio::test(start_paused = true)]
async fn rejected_write_keeps_cached_rows() {
    let source = Arc::new(MemorySource {
        reject_writes: true,
        ..MemorySource::with_rows("sessions", vec![json!({ "id": "s1" })])
    });
    let admin = admin(&source);

    admin.list(AdminResource::Sessions).await;
    let err = admin
        .delete(AdminResource::Sessions, "s1")
        .await
        .expect_err("write rejected");
    assert!(matches!(err, CacheError::NetworkFailure(_)));
    assert!(err.to_string().contains("row level security"));
    assert_eq!(source.writes.load(Ordering::SeqCst), 1);

    let state = admin.list(AdminResource::Sessions).await;
    assert!(state.is_from_cache());
    assert_eq!(list_len(&state), 1);
    assert_eq!(source.reads("sessions"), 1);
}

#[tokio::test(start_paused = true)]
async fn missing_row_surfaces_as_query_error() {
    let source = Arc::new(MemorySource::default());
    let admin = admin(&source);

    let state = admin.detail(AdminResource::Formations, "missing").await;
    let Some(error) = state.error() else {
        panic!("expected an error state, got {state:?}");
    };
    assert!(error.to_string().contains("missing"));
    assert!(
        admin
            .client()
            .store()
            .get(&AdminResource::Formations.detail_key("missing"))
            .is_none()
    );

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(source.reads("formations"), 1);
}
