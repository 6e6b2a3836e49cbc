//! Build service and workers
//!
//! `BuildService` accepts build triggers, keeps their records in the job
//! store and feeds the dispatcher. Workers take dispatched requests and run
//! the pipeline: source, patches, environment, toolchain, publication.

use chrono::Duration as TtlDuration;
use fatbuildr_common::{
    ArtifactDefinition, BuildState, EnvKey, Error, PackageFormat, Result, TokenScope,
};
use fatbuildr_keyring::{KeyParams, KeyringManager};
use fatbuildr_registry::{
    BuildResult, IssuedToken, Publisher, RegistryEntry, TokenRecord, TokenStore,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cancel::{CancelReason, CancelSignal};
use crate::config::Settings;
use crate::dispatcher::{Assignment, Dispatcher};
use crate::executor::{BuildExecutor, BuildPlace};
use crate::images::{EnvironmentStatus, Provisioner};
use crate::logstream::{read_chunk, BuildLog, LogFollower};
use crate::models::{
    BuildRequest, BuildStats, BuildTrigger, CreateKeyRequest, IssueTokenRequest, LogChunk,
    PublicKey, SubmitResponse,
};
use crate::patches::{PatchQueue, PatchSet};
use crate::source::SourceFetcher;
use crate::storage::JobStore;

const LOG_FILE: &str = "build.log";
const PLACE_DIR: &str = "place";
const PRISTINE_DIR: &str = "pristine";
const LOG_CHUNK_BYTES: u64 = 64 * 1024;

/// Build not finished yet
struct ActiveBuild {
    cancel: CancelSignal,
    log: Arc<BuildLog>,
}

/// Collaborators of the build service
pub struct ServiceParts {
    pub settings: Settings,
    pub store: Arc<dyn JobStore>,
    pub dispatcher: Dispatcher,
    pub provisioner: Arc<Provisioner>,
    pub fetcher: SourceFetcher,
    pub executor: BuildExecutor,
    pub publisher: Publisher,
    pub tokens: TokenStore,
    /// `None` when the daemon runs without signing keys management
    pub keyring: Option<Arc<KeyringManager>>,
}

pub struct BuildService {
    settings: Settings,
    store: Arc<dyn JobStore>,
    dispatcher: Dispatcher,
    provisioner: Arc<Provisioner>,
    fetcher: SourceFetcher,
    executor: BuildExecutor,
    publisher: Publisher,
    tokens: TokenStore,
    keyring: Option<Arc<KeyringManager>>,
    active: Mutex<HashMap<Uuid, ActiveBuild>>,
    /// Held while a build is being published
    publications: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

/// Write a daemon line in the build log. The build outcome does not depend
/// on it.
async fn note(log: &BuildLog, message: &str) {
    if let Err(e) = log.line(message).await {
        warn!("Unable to write in {}: {}", log.path().display(), e);
    }
}

fn is_segment(value: &str) -> bool {
    !value.is_empty() && !value.contains('/') && !value.starts_with('.')
}

impl BuildService {
    pub fn new(parts: ServiceParts) -> Arc<Self> {
        Arc::new(Self {
            settings: parts.settings,
            store: parts.store,
            dispatcher: parts.dispatcher,
            provisioner: parts.provisioner,
            fetcher: parts.fetcher,
            executor: parts.executor,
            publisher: parts.publisher,
            tokens: parts.tokens,
            keyring: parts.keyring,
            active: Mutex::new(HashMap::new()),
            publications: Mutex::new(HashMap::new()),
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn tokens(&self) -> &TokenStore {
        &self.tokens
    }

    fn build_dir(&self, id: Uuid) -> PathBuf {
        self.settings.dirs.build.join(id.to_string())
    }

    fn definition_dir(&self, artifact: &str) -> Result<PathBuf> {
        if !is_segment(artifact) {
            return Err(Error::InvalidDefinition(format!(
                "invalid artifact name '{}'",
                artifact
            )));
        }
        Ok(self.settings.dirs.definitions.join(artifact))
    }

    fn load_definition(&self, artifact: &str) -> Result<ArtifactDefinition> {
        ArtifactDefinition::load(&self.definition_dir(artifact)?)
    }

    async fn request(&self, id: Uuid) -> Result<BuildRequest> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("build {}", id)))
    }

    /// Queue a build. Nothing is created unless `token` grants build triggers.
    pub async fn submit(&self, token: &str, trigger: BuildTrigger) -> Result<SubmitResponse> {
        let record = self.tokens.authorize(token, TokenScope::BuildTrigger).await?;

        let artifact = self.load_definition(&trigger.artifact)?;
        if !artifact.supports_distribution(&trigger.distribution) {
            return Err(Error::InvalidDefinition(format!(
                "{} is not built for distribution {}",
                artifact.name, trigger.distribution
            )));
        }
        let architecture = trigger
            .architecture
            .unwrap_or_else(|| artifact.default_architecture());
        if !artifact.supports_architecture(&architecture) {
            return Err(Error::InvalidDefinition(format!(
                "{} is not built for architecture {}",
                artifact.name, architecture
            )));
        }
        let key = EnvKey::new(&trigger.distribution, &architecture)
            .map_err(|e| Error::InvalidDefinition(e.to_string()))?;

        let request = BuildRequest::new(
            artifact,
            key,
            trigger.force_refresh,
            record.label.clone(),
            trigger.message,
        );
        self.enqueue(&request).await?;
        info!(
            "Build {} of {} for {} submitted by {}",
            request.id, request.artifact.name, request.key, record.label
        );

        Ok(SubmitResponse {
            build_id: request.id,
            state: request.state,
        })
    }

    async fn enqueue(&self, request: &BuildRequest) -> Result<()> {
        let log = BuildLog::create(self.build_dir(request.id).join(LOG_FILE)).await?;
        self.store.save(request).await?;
        self.active.lock().await.insert(
            request.id,
            ActiveBuild {
                cancel: CancelSignal::new(),
                log,
            },
        );
        self.dispatcher.push(request.id, request.key.clone()).await;
        Ok(())
    }

    /// Requeue builds left queued by a previous run and close the ones it
    /// left running
    pub async fn recover(&self) -> Result<()> {
        let mut requests = self.store.list().await?;
        requests.reverse();
        for mut request in requests {
            match request.state {
                BuildState::Queued => {
                    info!("Requeueing build {}", request.id);
                    self.enqueue(&request).await?;
                }
                BuildState::Running => {
                    warn!("Build {} was interrupted by a daemon restart", request.id);
                    request.mark_cancelled("interrupted by daemon restart");
                    self.store.save(&request).await?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub async fn get(&self, token: &str, id: Uuid) -> Result<BuildRequest> {
        self.tokens.authorize(token, TokenScope::Read).await?;
        self.request(id).await
    }

    pub async fn list(&self, token: &str) -> Result<Vec<BuildRequest>> {
        self.tokens.authorize(token, TokenScope::Read).await?;
        self.store.list().await
    }

    pub async fn stats(&self) -> Result<BuildStats> {
        let mut stats = BuildStats::default();
        for request in self.store.list().await? {
            stats.count(request.state);
        }
        Ok(stats)
    }

    pub async fn queue_length(&self) -> usize {
        self.dispatcher.len().await
    }

    /// Cancel a queued or running build
    pub async fn cancel(&self, token: &str, id: Uuid) -> Result<BuildRequest> {
        let record = self.tokens.authorize(token, TokenScope::BuildTrigger).await?;
        let request = self.request(id).await?;
        if request.state.is_terminal() {
            return Err(Error::InvalidState(format!(
                "build {} is already {}",
                id, request.state
            )));
        }

        let signal = self
            .active
            .lock()
            .await
            .get(&id)
            .map(|active| active.cancel.clone());
        info!("Build {} cancellation requested by {}", id, record.label);

        if self.dispatcher.remove(id).await {
            let mut request = request;
            request.mark_cancelled(&CancelReason::Requested.to_string());
            self.store.save(&request).await?;
            if let Some(active) = self.active.lock().await.remove(&id) {
                note(&active.log, "build cancelled before start").await;
                active.log.close();
            }
            return Ok(request);
        }

        match signal {
            Some(signal) => signal.cancel(CancelReason::Requested),
            None => warn!("Build {} has no cancellation handle", id),
        }
        self.request(id).await
    }

    async fn publication_lock(&self, id: Uuid) -> Arc<Mutex<()>> {
        self.publications
            .lock()
            .await
            .entry(id)
            .or_default()
            .clone()
    }

    /// Publish a succeeded build whose publication failed or was skipped
    pub async fn publish(&self, token: &str, id: Uuid) -> Result<RegistryEntry> {
        self.tokens.authorize(token, TokenScope::BuildTrigger).await?;
        let _publication = self.publication_lock(id).await.lock_owned().await;
        let mut request = self.request(id).await?;
        if !request.can_publish() {
            return Err(Error::InvalidState(format!(
                "build {} is {} and {}",
                id,
                request.state,
                if request.published.is_some() {
                    "already published"
                } else {
                    "cannot be published"
                }
            )));
        }
        let result = self.publish_request(&mut request).await;
        self.store.save(&request).await?;
        result
    }

    async fn publish_request(&self, request: &mut BuildRequest) -> Result<RegistryEntry> {
        let result = BuildResult {
            build_id: request.id,
            state: request.state,
            format: request.artifact.format,
            distribution: request.key.distribution.clone(),
            artifact: request.artifact.name.clone(),
            version: request.artifact.full_version(),
            artifacts: request.artifacts.clone(),
        };
        match self.publisher.publish(&result).await {
            Ok(entry) => {
                info!("Build {} published as entry {}", request.id, entry.id);
                request.mark_published(entry.id);
                Ok(entry)
            }
            Err(e) => {
                error!("Publication of build {} failed: {}", request.id, e);
                request.mark_publish_failed(&e);
                Err(e)
            }
        }
    }

    /// Part of the log of a build from `offset`
    pub async fn log_chunk(&self, token: &str, id: Uuid, offset: u64) -> Result<LogChunk> {
        self.tokens.authorize(token, TokenScope::Read).await?;
        let request = self.request(id).await?;
        let path = self.build_dir(id).join(LOG_FILE);

        let (data, next_offset) = match read_chunk(&path, offset, LOG_CHUNK_BYTES).await {
            Ok(chunk) => chunk,
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                if request.state.is_terminal() {
                    return Err(Error::NotFound(format!("log of build {}", id)));
                }
                (Vec::new(), offset)
            }
            Err(e) => return Err(e),
        };
        let len = tokio::fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0);

        Ok(LogChunk {
            complete: request.state.is_terminal() && next_offset >= len,
            data,
            next_offset,
        })
    }

    /// Follow the log of a build until it ends
    pub async fn follow_log(&self, token: &str, id: Uuid) -> Result<LogFollower> {
        self.tokens.authorize(token, TokenScope::Read).await?;
        if let Some(active) = self.active.lock().await.get(&id) {
            return Ok(active.log.follow());
        }
        self.request(id).await?;
        LogFollower::finished(self.build_dir(id).join(LOG_FILE))
            .await
            .map_err(|_| Error::NotFound(format!("log of build {}", id)))
    }

    pub async fn issue_token(&self, token: &str, request: IssueTokenRequest) -> Result<IssuedToken> {
        self.tokens.authorize(token, TokenScope::Admin).await?;
        let ttl = match request.ttl {
            Some(secs) if secs <= 0 => {
                return Err(Error::InvalidState("token ttl must be positive".to_string()))
            }
            Some(secs) => Some(TtlDuration::seconds(secs)),
            None => None,
        };
        self.tokens.issue(request.scope, request.label, ttl).await
    }

    pub async fn revoke_token(&self, token: &str, id: Uuid) -> Result<()> {
        self.tokens.authorize(token, TokenScope::Admin).await?;
        if !self.tokens.revoke(id).await? {
            return Err(Error::NotFound(format!("token {}", id)));
        }
        Ok(())
    }

    pub async fn list_tokens(&self, token: &str) -> Result<Vec<TokenRecord>> {
        self.tokens.authorize(token, TokenScope::Admin).await?;
        Ok(self.tokens.list().await)
    }

    pub async fn environments(&self, token: &str) -> Result<Vec<EnvironmentStatus>> {
        self.tokens.authorize(token, TokenScope::Admin).await?;
        Ok(self.provisioner.list().await)
    }

    pub async fn remove_environment(&self, token: &str, key: &EnvKey) -> Result<()> {
        self.tokens.authorize(token, TokenScope::Admin).await?;
        self.provisioner.remove(key).await
    }

    fn keyring(&self) -> Result<&Arc<KeyringManager>> {
        self.keyring
            .as_ref()
            .ok_or_else(|| Error::KeyUnavailable("no keyring configured".to_string()))
    }

    pub async fn public_key(&self, token: &str, distribution: Option<&str>) -> Result<PublicKey> {
        self.tokens.authorize(token, TokenScope::Read).await?;
        let keyring = self.keyring()?;
        let scope = match distribution {
            Some(distribution) => keyring.scope_for(distribution),
            None => keyring.instance_scope(),
        };
        let handle = keyring.key(&scope).await?;
        let armored = keyring.export_public(&handle).await?;
        Ok(PublicKey {
            key: handle.info,
            armored,
        })
    }

    pub async fn create_key(&self, token: &str, request: CreateKeyRequest) -> Result<PublicKey> {
        self.tokens.authorize(token, TokenScope::Admin).await?;
        let keyring = self.keyring()?;
        let userid = if request.userid.trim().is_empty() {
            self.settings.keyring.userid.clone()
        } else {
            request.userid
        };
        let scope = match request.distribution.as_deref() {
            Some(distribution) => keyring.scope_for(distribution),
            None => keyring.instance_scope(),
        };
        let handle = keyring
            .create_key(KeyParams {
                scope,
                userid,
                force: request.force,
            })
            .await?;
        let armored = keyring.export_public(&handle).await?;
        Ok(PublicKey {
            key: handle.info,
            armored,
        })
    }

    pub async fn registry_lookup(
        &self,
        token: Option<&str>,
        format: PackageFormat,
        distribution: &str,
        artifact: &str,
        version: Option<&str>,
    ) -> Result<Vec<RegistryEntry>> {
        self.tokens
            .authorize_registry(self.settings.registry.access, token)
            .await?;
        self.publisher
            .lookup(format, distribution, artifact, version)
            .await
    }

    /// Path of one file of a registry entry
    #[allow(clippy::too_many_arguments)]
    pub async fn registry_file(
        &self,
        token: Option<&str>,
        format: PackageFormat,
        distribution: &str,
        artifact: &str,
        version: &str,
        entry: Uuid,
        file: &str,
    ) -> Result<PathBuf> {
        self.tokens
            .authorize_registry(self.settings.registry.access, token)
            .await?;
        let entry = self
            .publisher
            .entry(format, distribution, artifact, version, entry)
            .await?;
        self.publisher.open_file(&entry, file).await
    }

    async fn patch_set(&self, artifact: &str, version: Option<&str>) -> Result<PatchSet> {
        let dir = self.definition_dir(artifact)?;
        let version = match version {
            Some(version) => version.to_string(),
            None => ArtifactDefinition::load(&dir)?.version,
        };
        if !is_segment(&version) {
            return Err(Error::InvalidDefinition(format!("invalid version '{}'", version)));
        }
        tokio::task::spawn_blocking(move || PatchSet::load(&dir, &version))
            .await
            .map_err(|e| Error::Other(e.into()))?
    }

    /// Patch queue of an artifact version
    pub async fn patches(&self, token: &str, artifact: &str, version: Option<&str>) -> Result<PatchSet> {
        self.tokens.authorize(token, TokenScope::Read).await?;
        self.patch_set(artifact, version).await
    }

    /// Patch queue as a `.tar.gz` archive
    pub async fn patches_archive(
        &self,
        token: &str,
        artifact: &str,
        version: Option<&str>,
    ) -> Result<(String, Vec<u8>)> {
        self.tokens.authorize(token, TokenScope::Read).await?;
        let set = self.patch_set(artifact, version).await?;
        let name = format!("{}-{}-patches.tar.gz", artifact, set.version);
        let bytes = tokio::task::spawn_blocking(move || PatchQueue::export_archive(&set))
            .await
            .map_err(|e| Error::Other(e.into()))??;
        Ok((name, bytes))
    }

    /// Start the build workers
    pub fn spawn_workers(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        (0..self.settings.builds.workers)
            .map(|n| {
                let service = Arc::clone(self);
                tokio::spawn(async move {
                    info!("Build worker {} started", n);
                    loop {
                        let assignment = service.dispatcher.next().await;
                        service.process(assignment).await;
                    }
                })
            })
            .collect()
    }

    async fn process(&self, assignment: Assignment) {
        let id = assignment.id;
        if let Err(e) = self.run_build(assignment).await {
            error!("Build {} could not be processed: {}", id, e);
            self.abandon(id, &e).await;
        }
        if let Some(active) = self.active.lock().await.remove(&id) {
            active.log.close();
        }
    }

    /// Give a terminal state to a build whose processing broke off
    async fn abandon(&self, id: Uuid, error: &Error) {
        let mut request = match self.request(id).await {
            Ok(request) if !request.state.is_terminal() => request,
            Ok(_) => return,
            Err(e) => {
                error!("Build {} cannot be marked failed: {}", id, e);
                return;
            }
        };
        request.mark_failed(error);
        match self.store.save(&request).await {
            Ok(()) => warn!("Build {} marked failed", id),
            Err(e) => error!("Build {} cannot be marked failed: {}", id, e),
        }
    }

    async fn run_build(&self, assignment: Assignment) -> Result<()> {
        let id = assignment.id;
        let mut request = self.request(id).await?;
        if request.state != BuildState::Queued {
            debug!("Skipping build {} in state {}", id, request.state);
            return Ok(());
        }

        let (cancel, log) = {
            let active = self.active.lock().await;
            match active.get(&id) {
                Some(active) => (active.cancel.clone(), active.log.clone()),
                None => {
                    return Err(Error::InvalidState(format!(
                        "build {} is not tracked",
                        id
                    )))
                }
            }
        };

        if let Some(reason) = cancel.reason() {
            request.mark_cancelled(&reason.to_string());
            return self.store.save(&request).await;
        }

        request.isolation = Some(self.settings.policy_for(&request.key));
        request.mark_running();
        self.store.save(&request).await?;
        info!("Build {} of {} started on {}", id, request.artifact.name, request.key);
        note(
            &log,
            &format!(
                "build {} of {} {} for {}, submitted by {}",
                id,
                request.artifact.name,
                request.artifact.full_version(),
                request.key,
                request.submitted_by
            ),
        )
        .await;

        let timer = self.settings.build_timeout().map(|timeout| {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                cancel.cancel(CancelReason::Timeout);
            })
        });
        let outcome = self.execute(&request, &log, &cancel).await;
        if let Some(timer) = timer {
            timer.abort();
        }
        // environment no longer needed
        drop(assignment.slot);

        // kept until the publication outcome is saved
        let mut _publication = None;
        match outcome {
            Ok(result) if result.state == BuildState::Succeeded => {
                _publication = Some(self.publication_lock(id).await.lock_owned().await);
                request.mark_succeeded(result.artifacts);
                self.store.save(&request).await?;
                note(&log, "publishing artifacts").await;
                match self.publish_request(&mut request).await {
                    Ok(entry) => note(&log, &format!("published as entry {}", entry.id)).await,
                    Err(e) => note(&log, &format!("publication failed: {}", e)).await,
                }
            }
            Ok(_) => {
                let reason = cancel.reason().unwrap_or(CancelReason::Requested);
                info!("Build {} cancelled: {}", id, reason);
                request.mark_cancelled(&reason.to_string());
            }
            Err(Error::Cancelled(reason)) => {
                info!("Build {} cancelled: {}", id, reason);
                note(&log, &format!("build {}", reason)).await;
                request.mark_cancelled(&reason);
            }
            Err(e) => {
                warn!("Build {} failed: {}", id, e);
                note(&log, &format!("build failed: {}", e)).await;
                request.mark_failed(&e);
            }
        }
        self.store.save(&request).await
    }

    /// Prepare the source and the environment, then run the toolchain
    async fn execute(
        &self,
        request: &BuildRequest,
        log: &BuildLog,
        cancel: &CancelSignal,
    ) -> Result<BuildResult> {
        let artifact = &request.artifact;
        let build_dir = self.build_dir(request.id);
        let place = build_dir.join(PLACE_DIR);
        let definition_dir = self.definition_dir(&artifact.name)?;
        let policy = request
            .isolation
            .unwrap_or_else(|| self.settings.policy_for(&request.key));

        let prepare = async {
            log.line("preparing source").await?;
            let pristine = self
                .fetcher
                .prepare(artifact, &definition_dir, &build_dir.join(PRISTINE_DIR))
                .await?;
            let patched = self
                .apply_patches(artifact, &definition_dir, &pristine, &place, log)
                .await?;

            log.line(&format!("ensuring environment {} ({})", request.key, policy))
                .await?;
            let environment = self
                .provisioner
                .ensure(&request.key, artifact.format, policy, request.force_refresh)
                .await?;
            Ok::<_, Error>((patched, environment))
        };

        let (source, environment) = tokio::select! {
            prepared = prepare => prepared?,
            reason = cancel.cancelled() => return Err(Error::Cancelled(reason.to_string())),
        };

        self.executor
            .run(
                request,
                &environment,
                &BuildPlace { place, source },
                log,
                cancel,
            )
            .await
    }

    async fn apply_patches(
        &self,
        artifact: &ArtifactDefinition,
        definition_dir: &Path,
        pristine: &Path,
        place: &Path,
        log: &BuildLog,
    ) -> Result<crate::patches::PatchedSource> {
        let (dir, version) = (definition_dir.to_path_buf(), artifact.version.clone());
        let set = tokio::task::spawn_blocking(move || PatchSet::load(&dir, &version))
            .await
            .map_err(|e| Error::Other(e.into()))??;
        log.line(&format!("applying {} patch(es)", set.len())).await?;

        let source = pristine.to_path_buf();
        let destination = place.join(format!("{}-{}", artifact.name, artifact.version));
        let patched = tokio::task::spawn_blocking(move || {
            PatchQueue::apply(&source, &set, &destination)
        })
        .await
        .map_err(|e| Error::Other(e.into()))??;
        for name in &patched.applied {
            log.line(&format!("applied {}", name)).await?;
        }
        Ok(patched)
    }
}
