//! Integration tests for the Fatbuildr daemon API
//!
//! Builds run with the host runtime and a fake signing backend.

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use build_service::config::RuntimeKind;
use build_service::container::HostRuntime;
use build_service::dispatcher::{Dispatcher, KeySlots};
use build_service::executor::BuildExecutor;
use build_service::images::{CommandEnvironmentBuilder, Provisioner};
use build_service::source::SourceFetcher;
use build_service::{
    create_router, AppState, BuildRequest, BuildService, JobStore, MemoryJobStore, ServiceParts,
    Settings,
};
use chrono::Utc;
use fatbuildr_common::{ArtifactDefinition, BuildState, EnvKey, Error, Result, TokenScope};
use fatbuildr_keyring::{
    KeyBackend, KeyInfo, KeyParams, KeySpec, KeyringConfig, KeyringManager, KeyringSigner,
    NoopSeeder, Passphrase,
};
use fatbuildr_registry::{Publisher, TokenStore};
use serde_json::json;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt; // for `oneshot`

const ARTIFACT: &str = r#"
name = "hello"
version = "1.0"
release = "1"
format = "deb"
distributions = ["bookworm", "trixie"]
architectures = ["x86_64"]
"#;

const BUMP_VERSION: &str = "\
Description: mark the version as patched
---
--- a/VERSION
+++ b/VERSION
@@ -1 +1 @@
-1.0
+1.0-fatbuildr
";

/// Keeps key metadata in the key home and signs with a fixed marker
#[derive(Default)]
struct FakeBackend {
    signing_fails: Arc<AtomicBool>,
}

#[async_trait]
impl KeyBackend for FakeBackend {
    async fn generate(&self, home: &Path, spec: &KeySpec, _passphrase: &Passphrase) -> Result<KeyInfo> {
        let info = KeyInfo {
            userid: spec.userid.clone(),
            fingerprint: "0123456789ABCDEF".to_string(),
            subkey_fingerprint: "FEDCBA9876543210".to_string(),
            keygrip: "GRIP".to_string(),
            algorithm: spec.algorithm.clone(),
            created_at: Utc::now(),
            expires_at: None,
        };
        tokio::fs::write(home.join("key.json"), serde_json::to_vec(&info)?).await?;
        Ok(info)
    }

    async fn inspect(&self, home: &Path) -> Result<Option<KeyInfo>> {
        match tokio::fs::read(home.join("key.json")).await {
            Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn sign(&self, _home: &Path, key: &KeyInfo, _passphrase: &Passphrase, blob: &[u8]) -> Result<String> {
        if self.signing_fails.load(Ordering::SeqCst) {
            return Err(Error::KeyUnavailable("signing agent is gone".to_string()));
        }
        Ok(format!(
            "-----BEGIN PGP SIGNATURE-----\n{} {}\n-----END PGP SIGNATURE-----\n",
            key.subkey_fingerprint,
            blob.len()
        ))
    }

    async fn export_public(&self, _home: &Path, key: &KeyInfo) -> Result<String> {
        Ok(format!(
            "-----BEGIN PGP PUBLIC KEY BLOCK-----\n{}\n-----END PGP PUBLIC KEY BLOCK-----\n",
            key.fingerprint
        ))
    }
}

struct TestDaemon {
    dir: tempfile::TempDir,
    service: Arc<BuildService>,
    app: Router,
    admin: String,
    builder: String,
    reader: String,
    /// Makes every signature fail while set
    signing_fails: Arc<AtomicBool>,
}

/// Daemon with the `hello` artifact and the given build command
async fn create_test_daemon(build_cmd: &str, patches: &[(&str, &str)]) -> TestDaemon {
    create_test_daemon_with(build_cmd, patches, Arc::new(MemoryJobStore::new()), None).await
}

async fn create_test_daemon_with(
    build_cmd: &str,
    patches: &[(&str, &str)],
    store: Arc<dyn JobStore>,
    timeout: Option<u64>,
) -> TestDaemon {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();

    let definition = root.join("artifacts/hello");
    std::fs::create_dir_all(definition.join("src")).unwrap();
    std::fs::create_dir_all(definition.join("deb")).unwrap();
    std::fs::write(definition.join("artifact.toml"), ARTIFACT).unwrap();
    std::fs::write(definition.join("src/VERSION"), "1.0\n").unwrap();
    for (name, content) in patches {
        let path = definition.join("patches").join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    let mut settings = Settings::default();
    settings.dirs.definitions = root.join("artifacts");
    settings.dirs.build = root.join("builds");
    settings.dirs.cache = root.join("cache");
    settings.dirs.images = root.join("images");
    settings.containers.runtime = RuntimeKind::Host;
    settings.images.create_cmd = "mkdir -p {rootfs}".to_string();
    settings.formats.deb.init_cmd = String::new();
    settings.formats.deb.update_cmds = String::new();
    settings.formats.deb.build_cmd = build_cmd.to_string();
    settings.formats.deb.artifact_extensions = vec!["deb".to_string()];
    settings.registry.root = root.join("registry");
    settings.tokens.path = root.join("tokens.json");
    settings.keyring.storage = root.join("keyring");
    settings.builds.workers = 2;
    settings.builds.timeout = timeout;

    let backend = FakeBackend::default();
    let signing_fails = backend.signing_fails.clone();

    let keyring = Arc::new(
        KeyringManager::init(
            KeyringConfig::new(root.join("keyring")),
            "default",
            Arc::new(backend),
            Arc::new(NoopSeeder),
        )
        .await
        .unwrap(),
    );
    keyring
        .create_key(KeyParams {
            scope: keyring.instance_scope(),
            userid: "Fatbuildr <builder@example.org>".to_string(),
            force: false,
        })
        .await
        .unwrap();

    let tokens = TokenStore::open(root.join("tokens.json")).await.unwrap();
    let admin = tokens.issue(TokenScope::Admin, "admin", None).await.unwrap().secret;
    let builder = tokens
        .issue(TokenScope::BuildTrigger, "ci", None)
        .await
        .unwrap()
        .secret;
    let reader = tokens.issue(TokenScope::Read, "viewer", None).await.unwrap().secret;

    let runtime = Arc::new(HostRuntime);
    let key_slots = Arc::new(KeySlots::new());
    let provisioner = Provisioner::open(
        root.join("images"),
        Arc::new(CommandEnvironmentBuilder::new(
            runtime.clone(),
            settings.images.create_cmd.clone(),
            settings.formats.clone(),
        )),
        None,
        key_slots.clone(),
    )
    .await
    .unwrap();

    let service = BuildService::new(ServiceParts {
        store,
        dispatcher: Dispatcher::new(key_slots),
        provisioner,
        fetcher: SourceFetcher::new(root.join("cache")),
        executor: BuildExecutor::new(
            runtime,
            settings.formats.clone(),
            root.join("artifacts"),
            root.join("cache"),
        ),
        publisher: Publisher::open(
            root.join("registry"),
            Arc::new(KeyringSigner::new(keyring.clone())),
        )
        .await
        .unwrap(),
        tokens,
        keyring: Some(keyring),
        settings,
    });
    service.spawn_workers();

    let app = create_router(AppState {
        service: service.clone(),
    });

    TestDaemon {
        dir,
        service,
        app,
        admin,
        builder,
        reader,
        signing_fails,
    }
}

fn request(method: &str, uri: &str, token: Option<&str>, body: Option<serde_json::Value>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {}", token));
    }
    match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_string(&body).unwrap()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

fn trigger() -> serde_json::Value {
    json!({ "artifact": "hello", "distribution": "bookworm" })
}

async fn submit(daemon: &TestDaemon) -> uuid::Uuid {
    submit_for(daemon, "bookworm").await
}

async fn submit_for(daemon: &TestDaemon, distribution: &str) -> uuid::Uuid {
    let response = daemon
        .app
        .clone()
        .oneshot(request(
            "POST",
            "/api/builds",
            Some(&daemon.builder),
            Some(json!({ "artifact": "hello", "distribution": distribution })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let json = body_json(response).await;
    assert_eq!(json["state"], "queued");
    json["build_id"].as_str().unwrap().parse().unwrap()
}

/// Wait until the build is over, publication included
async fn wait_finished(daemon: &TestDaemon, id: uuid::Uuid) -> BuildRequest {
    for _ in 0..300 {
        let request = daemon.service.get(&daemon.reader, id).await.unwrap();
        let published = request.state != BuildState::Succeeded
            || request.published.is_some()
            || request.publish_error.is_some();
        if request.state.is_terminal() && published {
            return request;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("build {} did not finish", id);
}

async fn wait_state(daemon: &TestDaemon, id: uuid::Uuid, state: BuildState) {
    for _ in 0..300 {
        if daemon.service.get(&daemon.reader, id).await.unwrap().state == state {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("build {} never reached {}", id, state);
}

const PACKAGE_CMD: &str = "cat {source}/VERSION && echo pkg > {place}/{name}_{version}-{release}_amd64.deb";

#[tokio::test]
async fn test_health_check() {
    let daemon = create_test_daemon(PACKAGE_CMD, &[]).await;

    let response = daemon
        .app
        .clone()
        .oneshot(request("GET", "/health", None, None))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["service"], "fatbuildrd");
}

#[tokio::test]
async fn test_trigger_requires_build_scope() {
    let daemon = create_test_daemon(PACKAGE_CMD, &[]).await;

    let response = daemon
        .app
        .clone()
        .oneshot(request("POST", "/api/builds", None, Some(trigger())))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = daemon
        .app
        .clone()
        .oneshot(request("POST", "/api/builds", Some(&daemon.reader), Some(trigger())))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    // no request was created
    let response = daemon
        .app
        .clone()
        .oneshot(request("GET", "/api/builds", Some(&daemon.admin), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, json!([]));
    assert_eq!(daemon.service.stats().await.unwrap().queued, 0);
}

#[tokio::test]
async fn test_unknown_distribution_is_rejected() {
    let daemon = create_test_daemon(PACKAGE_CMD, &[]).await;

    let response = daemon
        .app
        .clone()
        .oneshot(request(
            "POST",
            "/api/builds",
            Some(&daemon.builder),
            Some(json!({ "artifact": "hello", "distribution": "el8" })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = daemon
        .app
        .clone()
        .oneshot(request(
            "POST",
            "/api/builds",
            Some(&daemon.builder),
            Some(json!({ "artifact": "missing", "distribution": "bookworm" })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_build_is_patched_signed_and_published() {
    let daemon = create_test_daemon(
        PACKAGE_CMD,
        &[("generic/0001-bump-version.patch", BUMP_VERSION)],
    )
    .await;

    let id = submit(&daemon).await;
    let finished = wait_finished(&daemon, id).await;
    assert_eq!(finished.state, BuildState::Succeeded, "{:?}", finished.error);
    assert_eq!(finished.artifacts.len(), 1);
    assert!(finished.isolation.unwrap().seccomp);
    let entry_id = finished.published.expect("build published");

    // log shows the patched source
    let response = daemon
        .app
        .clone()
        .oneshot(request(
            "GET",
            &format!("/api/builds/{}/log?offset=0", id),
            Some(&daemon.reader),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-log-complete"], "true");
    let log = String::from_utf8(body_bytes(response).await).unwrap();
    assert!(log.contains("applied 0001-bump-version.patch"));
    assert!(log.contains("1.0-fatbuildr"));

    // registry lookup and download
    let response = daemon
        .app
        .clone()
        .oneshot(request("GET", "/api/registry/deb/bookworm/hello", None, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let entries = body_json(response).await;
    assert_eq!(entries.as_array().unwrap().len(), 1);
    assert_eq!(entries[0]["id"], entry_id.to_string());
    assert_eq!(entries[0]["key_fingerprint"], "0123456789ABCDEF");

    let file = entries[0]["files"][0]["name"].as_str().unwrap().to_string();
    assert_eq!(file, "hello_1.0-1_amd64.deb");
    let response = daemon
        .app
        .clone()
        .oneshot(request(
            "GET",
            &format!(
                "/api/registry/deb/bookworm/hello/1.0-1/{}/{}",
                entry_id, file
            ),
            None,
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, b"pkg\n");

    // publishing twice is refused
    let response = daemon
        .app
        .clone()
        .oneshot(request(
            "POST",
            &format!("/api/builds/{}/publish", id),
            Some(&daemon.builder),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_failing_patch_fails_build() {
    let broken = "--- a/VERSION\n+++ b/VERSION\n@@ -1 +1 @@\n-2.0\n+3.0\n";
    let daemon = create_test_daemon(PACKAGE_CMD, &[("1.0/0001-broken.patch", broken)]).await;

    let id = submit(&daemon).await;
    let finished = wait_finished(&daemon, id).await;

    assert_eq!(finished.state, BuildState::Failed);
    assert_eq!(finished.error.unwrap().category, "patch_apply");
    assert!(finished.published.is_none());
    // source of the definition untouched
    assert_eq!(
        std::fs::read_to_string(daemon.dir.path().join("artifacts/hello/src/VERSION")).unwrap(),
        "1.0\n"
    );
}

#[tokio::test]
async fn test_cancelled_build_is_never_published() {
    let daemon = create_test_daemon(
        "echo partial > {place}/{name}_{version}-{release}_amd64.deb && sleep 30",
        &[],
    )
    .await;

    let id = submit(&daemon).await;
    wait_state(&daemon, id, BuildState::Running).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let response = daemon
        .app
        .clone()
        .oneshot(request(
            "POST",
            &format!("/api/builds/{}/cancel", id),
            Some(&daemon.builder),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let finished = wait_finished(&daemon, id).await;
    assert_eq!(finished.state, BuildState::Cancelled);
    assert!(finished.artifacts.is_empty());
    assert!(finished.published.is_none());

    let response = daemon
        .app
        .clone()
        .oneshot(request("GET", "/api/registry/deb/bookworm/hello", None, None))
        .await
        .unwrap();
    assert_eq!(body_json(response).await, json!([]));

    let response = daemon
        .app
        .clone()
        .oneshot(request(
            "POST",
            &format!("/api/builds/{}/publish", id),
            Some(&daemon.builder),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_builds_of_one_key_never_overlap() {
    let trace = tempfile::tempdir().unwrap();
    let trace_file = trace.path().join("trace");
    let daemon = create_test_daemon(
        &format!(
            "echo start >> {trace} && sleep 0.5 && echo end >> {trace} && \
             echo pkg > {{place}}/{{name}}_{{version}}-{{release}}_amd64.deb",
            trace = trace_file.display()
        ),
        &[],
    )
    .await;

    let first = submit(&daemon).await;
    let second = submit(&daemon).await;
    let first = wait_finished(&daemon, first).await;
    let second = wait_finished(&daemon, second).await;

    assert_eq!(first.state, BuildState::Succeeded);
    assert_eq!(second.state, BuildState::Succeeded);
    assert_eq!(
        std::fs::read_to_string(&trace_file).unwrap(),
        "start\nend\nstart\nend\n"
    );

    // both publications kept
    let entries = daemon
        .service
        .registry_lookup(None, fatbuildr_common::PackageFormat::Deb, "bookworm", "hello", None)
        .await
        .unwrap();
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().any(|entry| entry.build_id == first.id));
    assert!(entries.iter().any(|entry| entry.build_id == second.id));
}

#[tokio::test]
async fn test_patch_export() {
    let daemon = create_test_daemon(
        PACKAGE_CMD,
        &[("generic/0007-bump-version.patch", BUMP_VERSION)],
    )
    .await;

    let response = daemon
        .app
        .clone()
        .oneshot(request("GET", "/api/patches/hello", Some(&daemon.reader), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["version"], "1.0");
    assert_eq!(json["patches"][0]["title"], "bump-version");
    assert_eq!(json["patches"][0]["scope"], "generic");

    let response = daemon
        .app
        .clone()
        .oneshot(request(
            "GET",
            "/api/patches/hello/archive?version=1.0",
            Some(&daemon.reader),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "application/gzip");

    let bytes = body_bytes(response).await;
    let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(bytes.as_slice()));
    let names: Vec<String> = archive
        .entries()
        .unwrap()
        .map(|entry| entry.unwrap().path().unwrap().display().to_string())
        .collect();
    assert!(names.contains(&"patches/series".to_string()));
    assert!(names.contains(&"patches/generic/0001-bump-version.patch".to_string()));

    // no environment was touched
    assert!(!daemon.dir.path().join("images/bookworm/x86_64").exists());
}

#[tokio::test]
async fn test_administration_requires_admin_scope() {
    let daemon = create_test_daemon(PACKAGE_CMD, &[]).await;

    let response = daemon
        .app
        .clone()
        .oneshot(request(
            "POST",
            "/api/tokens",
            Some(&daemon.builder),
            Some(json!({ "scope": "read", "label": "dashboard" })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = daemon
        .app
        .clone()
        .oneshot(request(
            "POST",
            "/api/tokens",
            Some(&daemon.admin),
            Some(json!({ "scope": "read", "label": "dashboard", "ttl": 3600 })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let issued = body_json(response).await;
    let secret = issued["secret"].as_str().unwrap().to_string();
    let token_id = issued["record"]["id"].as_str().unwrap().to_string();

    let response = daemon
        .app
        .clone()
        .oneshot(request("GET", "/api/keyring", Some(&secret), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let key = body_json(response).await;
    assert_eq!(key["key"]["fingerprint"], "0123456789ABCDEF");
    assert!(key["armored"]
        .as_str()
        .unwrap()
        .starts_with("-----BEGIN PGP PUBLIC KEY BLOCK-----"));

    let response = daemon
        .app
        .clone()
        .oneshot(request(
            "DELETE",
            &format!("/api/tokens/{}", token_id),
            Some(&daemon.admin),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = daemon
        .app
        .clone()
        .oneshot(request("GET", "/api/keyring", Some(&secret), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    // existing key is kept unless forced
    let response = daemon
        .app
        .clone()
        .oneshot(request(
            "POST",
            "/api/keyring",
            Some(&daemon.admin),
            Some(json!({ "userid": "Other <other@example.org>" })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_environment_administration() {
    let daemon = create_test_daemon(PACKAGE_CMD, &[]).await;
    let id = submit(&daemon).await;
    assert_eq!(wait_finished(&daemon, id).await.state, BuildState::Succeeded);

    let response = daemon
        .app
        .clone()
        .oneshot(request("GET", "/api/environments", Some(&daemon.admin), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let environments = body_json(response).await;
    assert_eq!(environments[0]["key"]["distribution"], "bookworm");
    assert_eq!(environments[0]["state"], "ready");

    let response = daemon
        .app
        .clone()
        .oneshot(request(
            "DELETE",
            "/api/environments/bookworm/x86_64",
            Some(&daemon.reader),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = daemon
        .app
        .clone()
        .oneshot(request(
            "DELETE",
            "/api/environments/bookworm/x86_64",
            Some(&daemon.admin),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(!daemon.dir.path().join("images/bookworm/x86_64").exists());
}

#[tokio::test]
async fn test_log_stream_follows_until_build_ends() {
    let daemon = create_test_daemon(
        "echo first && sleep 0.3 && echo second && echo pkg > {place}/{name}_{version}-{release}_amd64.deb",
        &[],
    )
    .await;
    let id = submit(&daemon).await;

    let response = daemon
        .app
        .clone()
        .oneshot(request(
            "GET",
            &format!("/api/builds/{}/log/stream", id),
            Some(&daemon.reader),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let log = String::from_utf8(body_bytes(response).await).unwrap();
    assert!(log.contains("first\n"));
    assert!(log.contains("second\n"));
    assert!(log.contains("published as entry"));
}

/// Memory store losing the first save of a succeeded build
#[derive(Default)]
struct FlakyStore {
    inner: MemoryJobStore,
    failed: AtomicBool,
}

#[async_trait]
impl JobStore for FlakyStore {
    async fn save(&self, request: &BuildRequest) -> Result<()> {
        if request.state == BuildState::Succeeded && !self.failed.swap(true, Ordering::SeqCst) {
            return Err(Error::Storage("connection reset by peer".to_string()));
        }
        self.inner.save(request).await
    }

    async fn get(&self, id: uuid::Uuid) -> Result<Option<BuildRequest>> {
        self.inner.get(id).await
    }

    async fn list(&self) -> Result<Vec<BuildRequest>> {
        self.inner.list().await
    }
}

#[tokio::test]
async fn test_storage_failure_ends_build() {
    let daemon =
        create_test_daemon_with(PACKAGE_CMD, &[], Arc::new(FlakyStore::default()), None).await;

    let id = submit(&daemon).await;
    let finished = wait_finished(&daemon, id).await;
    assert_eq!(finished.state, BuildState::Failed);
    assert_eq!(finished.error.unwrap().category, "storage");
    assert!(finished.published.is_none());

    let response = daemon
        .app
        .clone()
        .oneshot(request(
            "GET",
            &format!("/api/builds/{}/log?offset=0", id),
            Some(&daemon.reader),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.headers()["x-log-complete"], "true");

    // the key is free for the next build
    let next = submit(&daemon).await;
    assert_eq!(wait_finished(&daemon, next).await.state, BuildState::Succeeded);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_publish_retries_publish_once() {
    let daemon = create_test_daemon(PACKAGE_CMD, &[]).await;
    daemon.signing_fails.store(true, Ordering::SeqCst);

    let id = submit(&daemon).await;
    let finished = wait_finished(&daemon, id).await;
    assert_eq!(finished.state, BuildState::Succeeded);
    assert!(finished.published.is_none());
    assert_eq!(finished.publish_error.unwrap().category, "key_unavailable");

    daemon.signing_fails.store(false, Ordering::SeqCst);
    let retries: Vec<_> = (0..4)
        .map(|_| {
            let app = daemon.app.clone();
            let token = daemon.builder.clone();
            tokio::spawn(async move {
                app.oneshot(request(
                    "POST",
                    &format!("/api/builds/{}/publish", id),
                    Some(&token),
                    None,
                ))
                .await
                .unwrap()
                .status()
            })
        })
        .collect();
    let mut statuses = Vec::new();
    for retry in retries {
        statuses.push(retry.await.unwrap());
    }
    assert_eq!(
        statuses.iter().filter(|status| **status == StatusCode::CREATED).count(),
        1
    );
    assert_eq!(
        statuses.iter().filter(|status| **status == StatusCode::CONFLICT).count(),
        3
    );

    let entries = daemon
        .service
        .registry_lookup(None, fatbuildr_common::PackageFormat::Deb, "bookworm", "hello", None)
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
    let request = daemon.service.get(&daemon.reader, id).await.unwrap();
    assert_eq!(request.published, Some(entries[0].id));
    assert!(request.publish_error.is_none());
}

#[tokio::test]
async fn test_timeout_cancels_build() {
    let daemon = create_test_daemon_with(
        "echo partial > {place}/{name}_{version}-{release}_amd64.deb && sleep 30",
        &[],
        Arc::new(MemoryJobStore::new()),
        Some(1),
    )
    .await;

    let id = submit(&daemon).await;
    let finished = wait_finished(&daemon, id).await;
    assert_eq!(finished.state, BuildState::Cancelled);
    let error = finished.error.unwrap();
    assert_eq!(error.category, "cancelled");
    assert_eq!(error.message, "build timeout reached");
    assert!(finished.artifacts.is_empty());
    assert!(finished.published.is_none());
}

#[tokio::test]
async fn test_recover_requeues_queued_and_closes_running() {
    let store = Arc::new(MemoryJobStore::new());
    let daemon = create_test_daemon_with(PACKAGE_CMD, &[], store.clone(), None).await;

    let artifact = ArtifactDefinition::from_toml(ARTIFACT).unwrap();
    let key = EnvKey::new("bookworm", "x86_64").unwrap();
    let queued = BuildRequest::new(artifact.clone(), key.clone(), false, "ci".to_string(), None);
    let mut running = BuildRequest::new(artifact, key, false, "ci".to_string(), None);
    running.mark_running();
    store.save(&queued).await.unwrap();
    store.save(&running).await.unwrap();

    daemon.service.recover().await.unwrap();

    let interrupted = daemon.service.get(&daemon.reader, running.id).await.unwrap();
    assert_eq!(interrupted.state, BuildState::Cancelled);
    assert_eq!(interrupted.error.unwrap().message, "interrupted by daemon restart");
    assert!(interrupted.finished_at.is_some());

    let rebuilt = wait_finished(&daemon, queued.id).await;
    assert_eq!(rebuilt.state, BuildState::Succeeded, "{:?}", rebuilt.error);
    assert!(rebuilt.published.is_some());
}

#[tokio::test]
async fn test_builds_of_distinct_keys_run_in_parallel() {
    let trace = tempfile::tempdir().unwrap();
    let trace_file = trace.path().join("trace");
    let daemon = create_test_daemon(
        &format!(
            "echo start >> {trace} && sleep 1 && echo end >> {trace} && \
             echo pkg > {{place}}/{{name}}_{{version}}-{{release}}_amd64.deb",
            trace = trace_file.display()
        ),
        &[],
    )
    .await;

    let bookworm = submit_for(&daemon, "bookworm").await;
    let trixie = submit_for(&daemon, "trixie").await;
    assert_eq!(wait_finished(&daemon, bookworm).await.state, BuildState::Succeeded);
    assert_eq!(wait_finished(&daemon, trixie).await.state, BuildState::Succeeded);

    // both started before either ended
    assert_eq!(
        std::fs::read_to_string(&trace_file).unwrap(),
        "start\nstart\nend\nend\n"
    );

    let entries = daemon
        .service
        .registry_lookup(None, fatbuildr_common::PackageFormat::Deb, "trixie", "hello", None)
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].build_id, trixie);
}
