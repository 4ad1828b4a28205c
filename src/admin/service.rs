use std::sync::Arc;

use serde_json::Value;
use tracing::instrument;

use crate::cache::{CacheError, QueryClient, QueryState};

use super::resources::AdminResource;
use super::source::{Row, TableSource};

/// Cached reads and invalidating writes for the back office.
#[derive(Clone)]
pub struct AdminData {
    client: QueryClient<Value>,
    source: Arc<dyn TableSource>,
}

impl AdminData {
    pub fn new(client: QueryClient<Value>, source: Arc<dyn TableSource>) -> Self {
        Self { client, source }
    }

    pub fn client(&self) -> &QueryClient<Value> {
        &self.client
    }

    /// All rows of `resource`, as a JSON array.
    #[instrument(skip(self))]
    pub async fn list(&self, resource: AdminResource) -> QueryState<Value> {
        let source = Arc::clone(&self.source);
        self.client
            .query(&resource.list_key(), move || {
                let source = Arc::clone(&source);
                async move { source.select_all(resource.table()).await.map(Value::Array) }
            })
            .await
    }

    #[instrument(skip(self))]
    pub async fn detail(&self, resource: AdminResource, id: &str) -> QueryState<Value> {
        let source = Arc::clone(&self.source);
        let row_id = id.to_string();
        self.client
            .query(&resource.detail_key(id), move || {
                let source = Arc::clone(&source);
                let row_id = row_id.clone();
                async move { source.select_one(resource.table(), &row_id).await }
            })
            .await
    }

    #[instrument(skip(self, row))]
    pub async fn create(&self, resource: AdminResource, row: Row) -> Result<Row, CacheError> {
        self.client
            .mutate(
                || self.source.insert(resource.table(), row),
                &resource.invalidation_keys(),
            )
            .await
    }

    #[instrument(skip(self, patch))]
    pub async fn update(
        &self,
        resource: AdminResource,
        id: &str,
        patch: Row,
    ) -> Result<Row, CacheError> {
        self.client
            .mutate(
                || self.source.update(resource.table(), id, patch),
                &resource.invalidation_keys(),
            )
            .await
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, resource: AdminResource, id: &str) -> Result<(), CacheError> {
        self.client
            .mutate(
                || self.source.delete(resource.table(), id),
                &resource.invalidation_keys(),
            )
            .await
    }
}
