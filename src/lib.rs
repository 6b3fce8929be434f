pub mod backend;
pub mod config;
pub mod cooldown;
pub mod db;
pub mod errors;
pub mod event_bus;
pub mod ledger;
pub mod models;
pub mod mutation;
pub mod pipeline;
pub mod sync;

use crate::backend::command::CommandAnalysisService;
use crate::backend::sqlite::SqliteDataService;
use crate::backend::{AnalysisService, AttemptJournal, CreditService, IdeaStore};
use crate::config::DashboardConfig;
use crate::cooldown::ActionGuard;
use crate::db::Database;
use crate::errors::{AppError, AppResult, Notifier, TracingNotifier};
use crate::event_bus::{EventBus, LanguageChanged};
use crate::ledger::CreditLedger;
use crate::models::{Analysis, IdeaScope, Tag};
use crate::mutation::{AutoConfirm, ConfirmGate, MutationExecutor, MutationOutcome};
use crate::pipeline::{AnalysisKind, AnalysisPipeline, ReconciliationReport};
use crate::sync::ViewSynchronizer;
use std::path::Path;
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

/// Installs the JSON file logger. `IDEAGATE_LOG` wins over the configured `logFilter`.
pub fn init_tracing(log_dir: &Path, config: &DashboardConfig) -> AppResult<()> {
    std::fs::create_dir_all(log_dir)?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "ideagate.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(config.effective_log_filter()))
        .json()
        .with_writer(non_blocking)
        .try_init()
        .map_err(|error| AppError::Internal(error.to_string()))
}

/// One user session: a bus, the credit ledger, the analysis pipeline and the
/// mutation executor, all sharing the same data service.
///
/// Separate `Dashboard`s (tabs) share nothing but the data service.
#[derive(Clone)]
pub struct Dashboard {
    config: DashboardConfig,
    user_id: String,
    store: Arc<dyn IdeaStore>,
    journal: Arc<dyn AttemptJournal>,
    analysis: Arc<dyn AnalysisService>,
    notifier: Arc<dyn Notifier>,
    confirm: Arc<dyn ConfirmGate>,
    bus: EventBus,
    ledger: CreditLedger,
    pipeline: AnalysisPipeline,
    executor: MutationExecutor,
}

impl Dashboard {
    pub fn new<S>(
        config: DashboardConfig,
        user_id: impl Into<String>,
        data: Arc<S>,
        analysis: Arc<dyn AnalysisService>,
    ) -> AppResult<Self>
    where
        S: CreditService + IdeaStore + AttemptJournal + 'static,
    {
        config.validate()?;
        let user_id = user_id.into();
        let credits: Arc<dyn CreditService> = data.clone();
        let store: Arc<dyn IdeaStore> = data.clone();
        let journal: Arc<dyn AttemptJournal> = data;
        let bus = EventBus::new();
        let ledger = CreditLedger::new(credits, user_id.clone(), &config);
        let notifier: Arc<dyn Notifier> = Arc::new(TracingNotifier);
        let confirm: Arc<dyn ConfirmGate> = Arc::new(AutoConfirm);
        let (pipeline, executor) = assemble(
            &config,
            &user_id,
            &ledger,
            &store,
            &journal,
            &analysis,
            &bus,
            &notifier,
            &confirm,
        );

        tracing::info!(
            user_id = %user_id,
            refund_policy = ?config.refund_policy,
            cooldown_ms = config.action_cooldown_ms,
            "dashboard session started"
        );
        Ok(Self {
            config,
            user_id,
            store,
            journal,
            analysis,
            notifier,
            confirm,
            bus,
            ledger,
            pipeline,
            executor,
        })
    }

    /// Session backed by the configured SQLite file and analysis command.
    pub fn open(config: DashboardConfig, user_id: impl Into<String>) -> AppResult<Self> {
        let database_path = config
            .database_path
            .clone()
            .ok_or_else(|| AppError::InvalidInput("databasePath is not configured".to_string()))?;
        let command = config
            .analysis_command
            .as_ref()
            .map(CommandAnalysisService::from_config)
            .ok_or_else(|| AppError::InvalidInput("analysisCommand is not configured".to_string()))?;
        let db = Arc::new(Database::new(&database_path)?);
        Self::new(config, user_id, Arc::new(SqliteDataService::new(db)), Arc::new(command))
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self.rebuild();
        self
    }

    pub fn with_confirm_gate(mut self, confirm: Arc<dyn ConfirmGate>) -> Self {
        self.confirm = confirm;
        self.rebuild();
        self
    }

    fn rebuild(&mut self) {
        let (pipeline, executor) = assemble(
            &self.config,
            &self.user_id,
            &self.ledger,
            &self.store,
            &self.journal,
            &self.analysis,
            &self.bus,
            &self.notifier,
            &self.confirm,
        );
        self.pipeline = pipeline;
        self.executor = executor;
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn config(&self) -> &DashboardConfig {
        &self.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn executor(&self) -> &MutationExecutor {
        &self.executor
    }

    pub fn pipeline(&self) -> &AnalysisPipeline {
        &self.pipeline
    }

    pub async fn mount_view(&self, name: &str, scope: IdeaScope) -> AppResult<ViewSynchronizer> {
        ViewSynchronizer::mount(name, &self.user_id, scope, self.store.as_ref(), &self.bus).await
    }

    pub async fn toggle_favorite(&self, view: &ViewSynchronizer, idea_id: &str) -> AppResult<MutationOutcome> {
        self.executor.toggle_favorite(&view.handle(), idea_id).await
    }

    pub async fn set_favorite(
        &self,
        view: &ViewSynchronizer,
        idea_id: &str,
        is_favorite: bool,
    ) -> AppResult<MutationOutcome> {
        self.executor.set_favorite(&view.handle(), idea_id, is_favorite).await
    }

    pub async fn set_tags(&self, view: &ViewSynchronizer, idea_id: &str, tags: Vec<Tag>) -> AppResult<MutationOutcome> {
        self.executor.set_tags(&view.handle(), idea_id, tags).await
    }

    pub async fn delete_idea(&self, view: &ViewSynchronizer, idea_id: &str) -> AppResult<MutationOutcome> {
        self.executor.delete_idea(&view.handle(), idea_id).await
    }

    /// `Ok(None)` when the tap was dropped by the cooldown.
    pub async fn reanalyze(&self, idea_id: &str) -> AppResult<Option<Analysis>> {
        self.executor.reanalyze(idea_id).await
    }

    pub async fn analyze(&self, idea_id: &str, kind: AnalysisKind) -> AppResult<Analysis> {
        self.pipeline.run(idea_id, kind).await
    }

    pub fn change_language(&self, language: &str) -> usize {
        self.bus.language_changed().publish(&LanguageChanged {
            language: language.to_string(),
        })
    }

    pub fn balance_hint(&self) -> Option<i64> {
        self.ledger.balance_hint()
    }

    pub async fn refresh_balance(&self) -> AppResult<i64> {
        self.ledger.refresh_balance().await
    }

    pub async fn reconcile(&self) -> AppResult<ReconciliationReport> {
        self.pipeline.reconcile().await
    }
}

impl std::fmt::Debug for Dashboard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dashboard")
            .field("user_id", &self.user_id)
            .field("config", &self.config)
            .finish()
    }
}

#[allow(clippy::too_many_arguments)]
fn assemble(
    config: &DashboardConfig,
    user_id: &str,
    ledger: &CreditLedger,
    store: &Arc<dyn IdeaStore>,
    journal: &Arc<dyn AttemptJournal>,
    analysis: &Arc<dyn AnalysisService>,
    bus: &EventBus,
    notifier: &Arc<dyn Notifier>,
    confirm: &Arc<dyn ConfirmGate>,
) -> (AnalysisPipeline, MutationExecutor) {
    let pipeline = AnalysisPipeline::new(
        ledger.clone(),
        analysis.clone(),
        store.clone(),
        journal.clone(),
        bus.clone(),
        notifier.clone(),
        config.refund_policy,
        config.analysis_timeout(),
    );
    let executor = MutationExecutor::new(
        user_id,
        store.clone(),
        bus.clone(),
        ActionGuard::new(config.action_cooldown()),
        notifier.clone(),
        confirm.clone(),
        pipeline.clone(),
    );
    (pipeline, executor)
}

#[cfg(test)]
mod tests {
    use super::{init_tracing, Dashboard};
    use crate::config::{AnalysisCommandConfig, DashboardConfig};
    use crate::errors::AppError;

    #[test]
    fn open_requires_database_and_command() {
        let error = Dashboard::open(DashboardConfig::default(), "user-1").expect_err("no database");
        assert!(matches!(error, AppError::InvalidInput(ref message) if message.contains("databasePath")));

        let dir = tempfile::tempdir().expect("tempdir");
        let config = DashboardConfig {
            database_path: Some(dir.path().join("ideas.db")),
            ..DashboardConfig::default()
        };
        let error = Dashboard::open(config, "user-1").expect_err("no command");
        assert!(matches!(error, AppError::InvalidInput(ref message) if message.contains("analysisCommand")));
    }

    #[test]
    fn init_tracing_creates_log_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log_dir = dir.path().join("logs");
        init_tracing(&log_dir, &DashboardConfig::default()).expect("tracing");
        assert!(log_dir.is_dir());
        tracing::info!("ideagate test log line");
    }

    #[test]
    fn open_rejects_invalid_config() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = DashboardConfig {
            analysis_timeout_secs: 0,
            database_path: Some(dir.path().join("ideas.db")),
            analysis_command: Some(AnalysisCommandConfig {
                program: "cat".to_string(),
                args: Vec::new(),
            }),
            ..DashboardConfig::default()
        };
        assert!(matches!(
            Dashboard::open(config, "user-1"),
            Err(AppError::InvalidInput(_))
        ));
    }
}
