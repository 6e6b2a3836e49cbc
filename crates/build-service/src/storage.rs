//! Build request storage
//!
//! Requests are kept in memory by default, or in Redis when the daemon is
//! given a `REDIS_URL`. Finished requests stay in the store as build history.

use async_trait::async_trait;
use fatbuildr_common::{Error, Result};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::models::BuildRequest;

/// Persistence of build requests
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert or replace a request
    async fn save(&self, request: &BuildRequest) -> Result<()>;

    async fn get(&self, id: Uuid) -> Result<Option<BuildRequest>>;

    /// Every known request, newest first
    async fn list(&self) -> Result<Vec<BuildRequest>>;
}

fn newest_first(requests: &mut [BuildRequest]) {
    requests.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at));
}

/// In-memory store
#[derive(Default)]
pub struct MemoryJobStore {
    requests: RwLock<HashMap<Uuid, BuildRequest>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn save(&self, request: &BuildRequest) -> Result<()> {
        self.requests
            .write()
            .await
            .insert(request.id, request.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<BuildRequest>> {
        Ok(self.requests.read().await.get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<BuildRequest>> {
        let mut requests: Vec<BuildRequest> =
            self.requests.read().await.values().cloned().collect();
        newest_first(&mut requests);
        Ok(requests)
    }
}

/// Redis store
pub struct RedisJobStore {
    conn: ConnectionManager,
}

fn storage_error(err: redis::RedisError) -> Error {
    Error::Storage(err.to_string())
}

impl RedisJobStore {
    /// Create a new storage instance
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).map_err(|e| {
            Error::Configuration(format!("invalid Redis URL {}: {}", redis_url, e))
        })?;

        let conn = ConnectionManager::new(client).await.map_err(storage_error)?;

        info!("Connected to Redis at {}", redis_url);

        Ok(Self { conn })
    }
}

#[async_trait]
impl JobStore for RedisJobStore {
    async fn save(&self, request: &BuildRequest) -> Result<()> {
        let key = format!("build:job:{}", request.id);
        let json = serde_json::to_string(request)?;

        let mut conn = self.conn.clone();
        let _: () = conn.set(&key, json).await.map_err(storage_error)?;
        let _: () = conn
            .sadd("build:all", request.id.to_string())
            .await
            .map_err(storage_error)?;

        debug!("Saved build {} state: {}", request.id, request.state);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<BuildRequest>> {
        let key = format!("build:job:{}", id);

        let mut conn = self.conn.clone();
        let json: Option<String> = conn.get(&key).await.map_err(storage_error)?;

        match json {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    async fn list(&self) -> Result<Vec<BuildRequest>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.smembers("build:all").await.map_err(storage_error)?;

        let mut requests = Vec::with_capacity(ids.len());
        for id in ids {
            let Ok(id) = id.parse::<Uuid>() else { continue };
            if let Some(request) = self.get(id).await? {
                requests.push(request);
            }
        }
        newest_first(&mut requests);
        Ok(requests)
    }
}
