//! API handlers for the Fatbuildr daemon

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use fatbuildr_common::{EnvKey, Error, PackageFormat};
use fatbuildr_registry::{IssuedToken, RegistryEntry, TokenRecord};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::images::EnvironmentStatus;
use crate::models::{
    BuildRequest, BuildTrigger, CreateKeyRequest, IssueTokenRequest, PublicKey, SubmitResponse,
};
use crate::patches::PatchSet;
use crate::worker::BuildService;

/// Shared application state
pub struct AppState {
    pub service: Arc<BuildService>,
}

/// API Error type
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message
        });

        (self.status, Json(body)).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::Authorization(_) => StatusCode::FORBIDDEN,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::InvalidState(_) | Error::KeyExists(_) => StatusCode::CONFLICT,
            Error::InvalidDefinition(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError {
            status,
            message: err.to_string(),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: err.to_string(),
        }
    }
}

/// Token given as `Authorization: Bearer <token>`
fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

fn require_token(headers: &HeaderMap) -> Result<&str, ApiError> {
    bearer(headers).ok_or_else(|| ApiError {
        status: StatusCode::UNAUTHORIZED,
        message: "missing bearer token".to_string(),
    })
}

fn parse_format(format: &str) -> Result<PackageFormat, ApiError> {
    Ok(format.parse::<PackageFormat>()?)
}

#[derive(Debug, Deserialize)]
pub struct VersionQuery {
    pub version: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct OffsetQuery {
    #[serde(default)]
    pub offset: u64,
}

#[derive(Debug, Deserialize)]
pub struct KeyQuery {
    pub distribution: Option<String>,
}

/// Health check
pub async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "fatbuildrd"
    }))
}

/// Get service stats
pub async fn get_stats_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let stats = state.service.stats().await?;
    let queue_len = state.service.queue_length().await;

    Ok(Json(serde_json::json!({
        "service": "fatbuildrd",
        "queue_length": queue_len,
        "stats": stats
    })))
}

/// Trigger a build
pub async fn submit_build_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<BuildTrigger>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let token = require_token(&headers)?;
    info!(
        "Build trigger for {} on {}",
        payload.artifact, payload.distribution
    );
    let response = state.service.submit(token, payload).await?;
    Ok((StatusCode::ACCEPTED, Json(response)))
}

/// List builds, newest first
pub async fn list_builds_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<BuildRequest>>, ApiError> {
    let token = require_token(&headers)?;
    Ok(Json(state.service.list(token).await?))
}

pub async fn get_build_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<BuildRequest>, ApiError> {
    let token = require_token(&headers)?;
    Ok(Json(state.service.get(token, id).await?))
}

/// Log chunk from `offset`
pub async fn get_build_log_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Query(query): Query<OffsetQuery>,
) -> Result<Response, ApiError> {
    let token = require_token(&headers)?;
    let chunk = state.service.log_chunk(token, id, query.offset).await?;

    Ok((
        [
            (
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/plain; charset=utf-8"),
            ),
            (
                header::HeaderName::from_static("x-log-offset"),
                HeaderValue::from(chunk.next_offset),
            ),
            (
                header::HeaderName::from_static("x-log-complete"),
                HeaderValue::from_static(if chunk.complete { "true" } else { "false" }),
            ),
        ],
        chunk.data,
    )
        .into_response())
}

/// Stream the log until the build ends
pub async fn stream_build_log_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let token = require_token(&headers)?;
    let follower = state.service.follow_log(token, id).await?;

    let stream = futures::stream::unfold(follower, move |mut follower| async move {
        match follower.next_chunk().await {
            Ok(Some(chunk)) => Some((Ok::<_, std::io::Error>(chunk), follower)),
            Ok(None) => None,
            Err(e) => {
                warn!("Log stream of build {} interrupted: {}", id, e);
                None
            }
        }
    });

    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        Body::from_stream(stream),
    )
        .into_response())
}

pub async fn cancel_build_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<BuildRequest>, ApiError> {
    let token = require_token(&headers)?;
    Ok(Json(state.service.cancel(token, id).await?))
}

/// Retry the publication of a succeeded build
pub async fn publish_build_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<RegistryEntry>), ApiError> {
    let token = require_token(&headers)?;
    let entry = state.service.publish(token, id).await?;
    Ok((StatusCode::CREATED, Json(entry)))
}

/// Published entries of an artifact, newest first
pub async fn registry_lookup_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((format, distribution, artifact)): Path<(String, String, String)>,
    Query(query): Query<VersionQuery>,
) -> Result<Json<Vec<RegistryEntry>>, ApiError> {
    let format = parse_format(&format)?;
    let entries = state
        .service
        .registry_lookup(
            bearer(&headers),
            format,
            &distribution,
            &artifact,
            query.version.as_deref(),
        )
        .await?;
    Ok(Json(entries))
}

/// Download a file of a registry entry
pub async fn registry_file_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((format, distribution, artifact, version, entry, file)): Path<(
        String,
        String,
        String,
        String,
        Uuid,
        String,
    )>,
) -> Result<Response, ApiError> {
    let format = parse_format(&format)?;
    let path = state
        .service
        .registry_file(
            bearer(&headers),
            format,
            &distribution,
            &artifact,
            &version,
            entry,
            &file,
        )
        .await?;
    let content = tokio::fs::read(&path).await.map_err(Error::from)?;

    let content_type = if file.ends_with(".asc") || file == "MANIFEST" {
        "text/plain; charset=utf-8"
    } else {
        "application/octet-stream"
    };
    Ok((
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", file),
            ),
        ],
        content,
    )
        .into_response())
}

/// Patch queue of an artifact
pub async fn list_patches_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(artifact): Path<String>,
    Query(query): Query<VersionQuery>,
) -> Result<Json<PatchSet>, ApiError> {
    let token = require_token(&headers)?;
    let set = state
        .service
        .patches(token, &artifact, query.version.as_deref())
        .await?;
    Ok(Json(set))
}

/// Download the patch queue as a tarball
pub async fn patches_archive_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(artifact): Path<String>,
    Query(query): Query<VersionQuery>,
) -> Result<Response, ApiError> {
    let token = require_token(&headers)?;
    let (name, bytes) = state
        .service
        .patches_archive(token, &artifact, query.version.as_deref())
        .await?;
    info!("Exported patch queue {} ({} bytes)", name, bytes.len());

    Ok((
        [
            (header::CONTENT_TYPE, "application/gzip".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", name),
            ),
        ],
        bytes,
    )
        .into_response())
}

pub async fn issue_token_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<IssueTokenRequest>,
) -> Result<(StatusCode, Json<IssuedToken>), ApiError> {
    let token = require_token(&headers)?;
    let issued = state.service.issue_token(token, payload).await?;
    Ok((StatusCode::CREATED, Json(issued)))
}

pub async fn list_tokens_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<TokenRecord>>, ApiError> {
    let token = require_token(&headers)?;
    Ok(Json(state.service.list_tokens(token).await?))
}

pub async fn revoke_token_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let token = require_token(&headers)?;
    state.service.revoke_token(token, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_environments_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<EnvironmentStatus>>, ApiError> {
    let token = require_token(&headers)?;
    Ok(Json(state.service.environments(token).await?))
}

pub async fn remove_environment_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((distribution, architecture)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    let token = require_token(&headers)?;
    let key = EnvKey::new(distribution, architecture).map_err(|e| ApiError {
        status: StatusCode::BAD_REQUEST,
        message: e.to_string(),
    })?;
    state.service.remove_environment(token, &key).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Public signing key
pub async fn get_keyring_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<KeyQuery>,
) -> Result<Json<PublicKey>, ApiError> {
    let token = require_token(&headers)?;
    let key = state
        .service
        .public_key(token, query.distribution.as_deref())
        .await?;
    Ok(Json(key))
}

pub async fn create_key_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<CreateKeyRequest>,
) -> Result<(StatusCode, Json<PublicKey>), ApiError> {
    let token = require_token(&headers)?;
    let key = state.service.create_key(token, payload).await?;
    Ok((StatusCode::CREATED, Json(key)))
}
