//! Fatbuildr daemon
//!
//! REST API for build triggers and registry access, plus the background
//! workers running the builds.

use anyhow::{Context, Result};
use build_service::config::RuntimeKind;
use build_service::container::{ContainerRuntime, HostRuntime, NspawnRuntime};
use build_service::dispatcher::{Dispatcher, KeySlots};
use build_service::executor::BuildExecutor;
use build_service::images::{CommandEnvironmentBuilder, Provisioner};
use build_service::source::SourceFetcher;
use build_service::{
    create_router, AppState, BuildService, Config, JobStore, MemoryJobStore, RedisJobStore,
    ServiceParts,
};
use fatbuildr_common::TokenScope;
use fatbuildr_keyring::{
    CommandSeeder, GnupgBackend, KeyringManager, KeyringSigner, NoopSeeder, PassphraseSeeder,
};
use fatbuildr_registry::{Publisher, TokenStore};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Issue a first admin token when the store is empty. Its secret is written
/// next to the token store, readable by the daemon user only.
async fn bootstrap_admin_token(tokens: &TokenStore, tokens_path: &Path) -> Result<()> {
    if !tokens.list().await.is_empty() {
        return Ok(());
    }
    let issued = tokens
        .issue(TokenScope::Admin, "bootstrap", None)
        .await
        .context("Failed to issue bootstrap admin token")?;
    let path = tokens_path.with_file_name("admin.token");
    tokio::fs::write(&path, format!("{}\n", issued.secret))
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).await?;
    warn!("No API token found, bootstrap admin token written to {}", path.display());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "fatbuildrd=info,build_service=debug,fatbuildr_registry=info,\
                 fatbuildr_keyring=info,tower_http=debug"
                    .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().context("Failed to load configuration")?;
    let settings = config.settings.clone();

    info!("Starting Fatbuildr daemon for instance {}", settings.instance.name);
    info!("Settings file: {}", config.settings_path.display());
    info!("Artifact definitions: {}", settings.dirs.definitions.display());

    for dir in [&settings.dirs.build, &settings.dirs.cache] {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create directory {}", dir.display()))?;
    }

    // Job store
    let store: Arc<dyn JobStore> = match &config.redis_url {
        Some(url) => {
            info!("Redis URL: {}", url);
            Arc::new(
                RedisJobStore::new(url)
                    .await
                    .context("Failed to initialize job store")?,
            )
        }
        None => {
            info!("No REDIS_URL set, build history is kept in memory");
            Arc::new(MemoryJobStore::new())
        }
    };

    // Keyring
    let seeder: Arc<dyn PassphraseSeeder> = match &settings.keyring.seeder {
        Some(seeder) => Arc::new(CommandSeeder::new(seeder.program.clone(), seeder.args.clone())),
        None => Arc::new(NoopSeeder),
    };
    let keyring = Arc::new(
        KeyringManager::init(
            settings.keyring.keyring_config(),
            settings.instance.name.clone(),
            Arc::new(GnupgBackend::new(
                settings.keyring.gpg_program.clone(),
                settings.keyring.gpgconf_program.clone(),
            )),
            seeder,
        )
        .await
        .context("Failed to initialize keyring")?,
    );

    // Registry and tokens
    let publisher = Publisher::open(
        settings.registry.root.clone(),
        Arc::new(KeyringSigner::new(keyring.clone())),
    )
    .await
    .context("Failed to open registry")?;
    let tokens = TokenStore::open(settings.tokens.path.clone())
        .await
        .context("Failed to open token store")?;
    bootstrap_admin_token(&tokens, &settings.tokens.path).await?;

    // Environments and builds
    let runtime: Arc<dyn ContainerRuntime> = match settings.containers.runtime {
        RuntimeKind::Nspawn => Arc::new(NspawnRuntime::new(settings.containers.clone())),
        RuntimeKind::Host => {
            warn!("Builds run directly on the host, without isolation");
            Arc::new(HostRuntime)
        }
    };
    info!("Container runtime: {}", runtime.name());

    let key_slots = Arc::new(KeySlots::new());
    let provisioner = Provisioner::open(
        settings.dirs.images.clone(),
        Arc::new(CommandEnvironmentBuilder::new(
            runtime.clone(),
            settings.images.create_cmd.clone(),
            settings.formats.clone(),
        )),
        settings.refresh_interval(),
        key_slots.clone(),
    )
    .await
    .context("Failed to open build environments")?;
    let executor = BuildExecutor::new(
        runtime,
        settings.formats.clone(),
        settings.dirs.definitions.clone(),
        settings.dirs.cache.clone(),
    );

    let service = BuildService::new(ServiceParts {
        fetcher: SourceFetcher::new(settings.dirs.cache.clone()),
        dispatcher: Dispatcher::new(key_slots),
        settings,
        store,
        provisioner,
        executor,
        publisher,
        tokens,
        keyring: Some(keyring.clone()),
    });
    service
        .recover()
        .await
        .context("Failed to recover pending builds")?;
    let workers = service.spawn_workers();
    info!("{} build worker(s) started", workers.len());

    // Create router
    let app = create_router(AppState {
        service: service.clone(),
    });

    // Start API server
    let addr = config.api_address();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    info!("Fatbuildr API running on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await
        .context("Server error")?;

    for worker in workers {
        worker.abort();
    }
    service.tokens().flush().await?;
    keyring.shutdown().await?;

    Ok(())
}
