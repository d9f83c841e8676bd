mod parser;
mod render;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;
use veld_diff::{DiffError, Plan};
use veld_engine::{ApplyReport, Engine, EngineError, EngineOptions};
use veld_graph::{build, BuildError};
use veld_provider::ProviderClient;
use veld_schedule::{schedule, ScheduleError};
use veld_state::{SecretCipher, StateError, StateStore};

pub use crate::parser::{load_definitions, ParseError};
pub use crate::render::{render_plan, render_report};

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error(transparent)]
    Diff(#[from] DiffError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl AppError {
    /// Structural errors abort before any execution and exit 2; an
    /// executor fault exits 1 like a failed resource.
    pub fn exit_code(&self) -> i32 {
        match self {
            AppError::Engine(_) => 1,
            _ => 2,
        }
    }
}

/// Where the state file lives and how its secrets are keyed.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub path: PathBuf,
    pub passphrase: String,
}

impl StoreOptions {
    async fn open(&self) -> Result<StateStore, StateError> {
        StateStore::open(&self.path, SecretCipher::from_passphrase(&self.passphrase)).await
    }
}

/// Compute the plan without executing anything.
#[tracing::instrument(skip_all)]
pub async fn preview(
    definitions: &Path,
    store: &StoreOptions,
    provider: &dyn ProviderClient,
) -> Result<Plan, AppError> {
    let definitions = load_definitions(definitions).await?;
    let graph = build(definitions)?;
    let waves = schedule(&graph)?;

    let store = store.open().await?;
    let snapshot = store.snapshot()?;
    Ok(veld_diff::plan(&graph, &waves, &snapshot, provider)?)
}

/// Compute the plan and converge recorded state to it.
#[tracing::instrument(skip_all)]
pub async fn up(
    definitions: &Path,
    store: &StoreOptions,
    provider: Arc<dyn ProviderClient>,
    options: EngineOptions,
    cancel: CancellationToken,
) -> Result<(Plan, ApplyReport), AppError> {
    let definitions = load_definitions(definitions).await?;
    let graph = build(definitions)?;
    let waves = schedule(&graph)?;

    let store = store.open().await?;
    let snapshot = store.snapshot()?;
    let plan = veld_diff::plan(&graph, &waves, &snapshot, provider.as_ref())?;
    if plan.is_noop() {
        info!("nothing to do");
    }

    let engine = Engine::new(provider, options, cancel);
    let store = Arc::new(Mutex::new(store));
    let report = engine.apply(plan.clone(), snapshot, store).await?;
    Ok((plan, report))
}

/// Delete every recorded resource, dependents first.
#[tracing::instrument(skip_all)]
pub async fn destroy(
    store: &StoreOptions,
    provider: Arc<dyn ProviderClient>,
    options: EngineOptions,
    cancel: CancellationToken,
) -> Result<ApplyReport, AppError> {
    let store = store.open().await?;
    let snapshot = store.snapshot()?;
    let plan = veld_diff::destroy_plan(&snapshot)?;

    let engine = Engine::new(provider, options, cancel);
    let store = Arc::new(Mutex::new(store));
    Ok(engine.apply(plan, snapshot, store).await?)
}

#[cfg(test)]
mod tests {
    use veld_engine::RetryPolicy;
    use veld_provider::MemoryProvider;

    use super::*;

    fn store_options(dir: &tempfile::TempDir) -> StoreOptions {
        StoreOptions {
            path: dir.path().join("veld.state.json"),
            passphrase: "test passphrase".to_string(),
        }
    }

    fn engine_options() -> EngineOptions {
        EngineOptions {
            parallelism: 4,
            retry: RetryPolicy::immediate(2),
        }
    }

    async fn write_definitions(dir: &tempfile::TempDir) -> PathBuf {
        let path = dir.path().join("definitions.json");
        let doc = serde_json::json!({
            "resources": [
                {
                    "type": "test:resource-group",
                    "name": "rg",
                    "inputs": { "name": "rg-prod" }
                },
                {
                    "type": "test:storage",
                    "name": "blob",
                    "inputs": { "group": { "$ref": "test:resource-group::rg.name" } }
                },
                {
                    "type": "test:web-app",
                    "name": "web",
                    "inputs": {
                        "url": { "$concat": [
                            "https://",
                            { "$ref": "test:storage::blob.group" },
                            ".example.net"
                        ]},
                        "password": { "$secret": "hunter2" }
                    }
                }
            ]
        });
        tokio::fs::write(&path, serde_json::to_vec_pretty(&doc).unwrap())
            .await
            .unwrap();
        path
    }

    #[tokio::test]
    async fn up_then_preview_is_a_no_op_then_destroy_empties_everything() {
        let dir = tempfile::tempdir().unwrap();
        let definitions = write_definitions(&dir).await;
        let store = store_options(&dir);
        let provider = Arc::new(MemoryProvider::new());

        let (plan, report) = up(
            &definitions,
            &store,
            provider.clone(),
            engine_options(),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(!plan.is_noop());
        assert!(report.all_succeeded(), "{report:?}");
        assert_eq!(provider.live().len(), 3);

        // The interpolated url reached the provider fully joined.
        let web_inputs = provider
            .live()
            .into_iter()
            .find_map(|(_, _, inputs)| inputs.contains_key("url").then_some(inputs))
            .unwrap();
        assert_eq!(
            web_inputs.get("url"),
            Some(&serde_json::json!("https://rg-prod.example.net"))
        );

        let plan = preview(&definitions, &store, provider.as_ref())
            .await
            .unwrap();
        assert!(plan.is_noop(), "{plan:?}");

        let report = destroy(
            &store,
            provider.clone(),
            engine_options(),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(report.all_succeeded());
        assert!(provider.live().is_empty());
    }

    #[tokio::test]
    async fn preview_renders_secrets_redacted() {
        let dir = tempfile::tempdir().unwrap();
        let definitions = write_definitions(&dir).await;
        let store = store_options(&dir);
        let provider = MemoryProvider::new();

        let plan = preview(&definitions, &store, &provider).await.unwrap();
        let rendered = render_plan(&plan);
        assert!(rendered.contains("+ test:web-app::web"));
        assert!(rendered.contains("password: [secret]"));
        assert!(!rendered.contains("hunter2"));
    }

    #[tokio::test]
    async fn concurrent_runs_against_one_store_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let definitions = write_definitions(&dir).await;
        let store = store_options(&dir);

        let held = store.open().await.unwrap();
        let provider = MemoryProvider::new();
        let result = preview(&definitions, &store, &provider).await;
        assert!(matches!(
            result,
            Err(AppError::State(StateError::ConcurrentRun { .. }))
        ));
        assert_eq!(result.unwrap_err().exit_code(), 2);
        drop(held);
    }
}
