//! Charge → invoke → persist → broadcast, as a per-idea state machine.

use crate::backend::{AnalysisService, AttemptJournal, IdeaStore};
use crate::config::RefundPolicy;
use crate::errors::{AppError, AppResult, Notice, Notifier};
use crate::event_bus::{AnalysisUpdated, EventBus};
use crate::ledger::CreditLedger;
use crate::models::{Analysis, AnalysisAttempt, AnalysisRequest, AttemptStatus, ChargeReceipt, FeatureKey};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailedStage {
    Charging,
    Invoking,
    Persisting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case", tag = "stage")]
pub enum AnalysisStage {
    Idle,
    Charging,
    Invoking,
    Persisting,
    Done,
    Failed { at: FailedStage, charged: bool },
}

impl AnalysisStage {
    pub fn is_running(self) -> bool {
        matches!(self, Self::Charging | Self::Invoking | Self::Persisting)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Charging => "charging",
            Self::Invoking => "invoking",
            Self::Persisting => "persisting",
            Self::Done => "done",
            Self::Failed { .. } => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AnalysisKind {
    Initial,
    Reanalysis,
    Advanced,
}

impl AnalysisKind {
    pub fn feature(self) -> FeatureKey {
        match self {
            Self::Initial => FeatureKey::InitialAnalysis,
            Self::Reanalysis => FeatureKey::Reanalysis,
            Self::Advanced => FeatureKey::AdvancedAnalysis,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationReport {
    pub consumed: usize,
    pub refunded: usize,
    pub credits_returned: i64,
    pub errors: Vec<String>,
}

type StageMap = HashMap<String, watch::Sender<AnalysisStage>>;

fn lock_stages(stages: &Mutex<StageMap>) -> MutexGuard<'_, StageMap> {
    stages.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Clone)]
pub struct AnalysisPipeline {
    owner_id: String,
    ledger: CreditLedger,
    service: Arc<dyn AnalysisService>,
    store: Arc<dyn IdeaStore>,
    journal: Arc<dyn AttemptJournal>,
    bus: EventBus,
    notifier: Arc<dyn Notifier>,
    refund_policy: RefundPolicy,
    timeout: Duration,
    stages: Arc<Mutex<StageMap>>,
}

impl AnalysisPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ledger: CreditLedger,
        service: Arc<dyn AnalysisService>,
        store: Arc<dyn IdeaStore>,
        journal: Arc<dyn AttemptJournal>,
        bus: EventBus,
        notifier: Arc<dyn Notifier>,
        refund_policy: RefundPolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            owner_id: ledger.user_id().to_string(),
            ledger,
            service,
            store,
            journal,
            bus,
            notifier,
            refund_policy,
            timeout,
            stages: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn stage(&self, idea_id: &str) -> AnalysisStage {
        lock_stages(&self.stages)
            .get(idea_id)
            .map(|sender| *sender.borrow())
            .unwrap_or(AnalysisStage::Idle)
    }

    /// Stage updates for one idea, for progress indicators.
    pub fn watch(&self, idea_id: &str) -> watch::Receiver<AnalysisStage> {
        lock_stages(&self.stages)
            .entry(idea_id.to_string())
            .or_insert_with(|| watch::channel(AnalysisStage::Idle).0)
            .subscribe()
    }

    fn set_stage(&self, idea_id: &str, stage: AnalysisStage) {
        if let Some(sender) = lock_stages(&self.stages).get(idea_id) {
            sender.send_replace(stage);
        }
        tracing::info!(idea_id = %idea_id, stage = stage.as_str(), "analysis stage");
    }

    /// Marks the idea as charging unless a run is already in flight for it.
    fn claim(&self, idea_id: &str) -> AppResult<()> {
        let mut stages = lock_stages(&self.stages);
        let sender = stages
            .entry(idea_id.to_string())
            .or_insert_with(|| watch::channel(AnalysisStage::Idle).0);
        if sender.borrow().is_running() {
            return Err(AppError::AnalysisInProgress(format!("idea {}", idea_id)));
        }
        sender.send_replace(AnalysisStage::Charging);
        Ok(())
    }

    /// Runs the whole state machine for one idea.
    ///
    /// The work runs on its own task: dropping the returned future (the user
    /// navigated away) does not strand the idea mid-run, the run still settles
    /// and publishes. Errors are also forwarded to the notifier.
    pub async fn run(&self, idea_id: &str, kind: AnalysisKind) -> AppResult<Analysis> {
        if let Err(error) = self.claim(idea_id) {
            self.notifier.notify(Notice::from_error(&error));
            return Err(error);
        }
        tracing::info!(idea_id = %idea_id, stage = "charging", kind = ?kind, "analysis stage");

        let pipeline = self.clone();
        let owned_id = idea_id.to_string();
        let task = tokio::spawn(async move {
            let result = pipeline.run_claimed(&owned_id, kind).await;
            if let Err(error) = &result {
                pipeline.notifier.notify(Notice::from_error(error));
            }
            result
        });

        match task.await {
            Ok(result) => result,
            Err(join_error) => {
                let error = AppError::Internal(format!("analysis task failed: {}", join_error));
                self.notifier.notify(Notice::from_error(&error));
                Err(self.fail(idea_id, FailedStage::Invoking, false, error))
            }
        }
    }

    async fn run_claimed(&self, idea_id: &str, kind: AnalysisKind) -> AppResult<Analysis> {
        let idea = match self.store.get_idea(&self.owner_id, idea_id).await {
            Ok(idea) => idea,
            Err(error) => return Err(self.fail(idea_id, FailedStage::Charging, false, error)),
        };

        let feature = kind.feature();
        let receipt = match self.ledger.charge_feature(feature, Some(idea_id)).await {
            Ok(receipt) => receipt,
            Err(error) => return Err(self.fail(idea_id, FailedStage::Charging, false, error)),
        };
        let charged = receipt.amount > 0;
        let attempt = if charged {
            self.open_attempt(idea_id, feature, &receipt).await
        } else {
            None
        };

        self.set_stage(idea_id, AnalysisStage::Invoking);
        let is_reanalysis = match kind {
            AnalysisKind::Initial => false,
            AnalysisKind::Reanalysis => true,
            AnalysisKind::Advanced => idea.analysis.is_some(),
        };
        let request = AnalysisRequest::from_idea(&idea, is_reanalysis);
        let invoked = match tokio::time::timeout(self.timeout, self.service.analyze(&request)).await {
            Ok(result) => result,
            Err(_) => Err(AppError::AnalysisService(format!(
                "analysis timed out after {}s",
                self.timeout.as_secs()
            ))),
        };
        let mut analysis = match invoked {
            Ok(analysis) => analysis,
            Err(error) => {
                let error = match error {
                    AppError::AnalysisService(_) => error,
                    other => AppError::AnalysisService(other.to_string()),
                };
                self.settle_failure(idea_id, attempt.as_ref(), &receipt, &error).await;
                return Err(self.fail(idea_id, FailedStage::Invoking, charged, error));
            }
        };

        self.set_stage(idea_id, AnalysisStage::Persisting);
        analysis.idea_id = idea_id.to_string();
        if let Err(error) = self.store.replace_analysis(&self.owner_id, &analysis).await {
            self.settle_failure(idea_id, attempt.as_ref(), &receipt, &error).await;
            return Err(self.fail(idea_id, FailedStage::Persisting, charged, error));
        }

        if let Some(attempt) = &attempt {
            self.transition(&attempt.id, AttemptStatus::InFlight, AttemptStatus::Completed, None)
                .await;
        }

        self.set_stage(idea_id, AnalysisStage::Done);
        let delivered = self.bus.analysis_updated().publish(&AnalysisUpdated {
            idea_id: idea_id.to_string(),
            analysis: analysis.clone(),
        });
        tracing::info!(idea_id = %idea_id, score = analysis.score, delivered, "analysis completed");
        Ok(analysis)
    }

    fn fail(&self, idea_id: &str, at: FailedStage, charged: bool, error: AppError) -> AppError {
        self.set_stage(idea_id, AnalysisStage::Failed { at, charged });
        tracing::warn!(idea_id = %idea_id, at = ?at, charged, error = %error, "analysis failed");
        error
    }

    async fn open_attempt(&self, idea_id: &str, feature: FeatureKey, receipt: &ChargeReceipt) -> Option<AnalysisAttempt> {
        match self
            .journal
            .open_attempt(
                &self.owner_id,
                idea_id,
                feature,
                receipt.amount,
                receipt.transaction_id.as_deref(),
            )
            .await
        {
            Ok(attempt) => Some(attempt),
            Err(error) => {
                tracing::warn!(idea_id = %idea_id, error = %error, "failed to journal analysis attempt");
                None
            }
        }
    }

    /// Journal transition whose failure is only logged; the run's outcome stands.
    async fn transition(&self, attempt_id: &str, from: AttemptStatus, to: AttemptStatus, reason: Option<&str>) -> bool {
        match self.journal.transition_attempt(attempt_id, from, to, reason).await {
            Ok(changed) => {
                if !changed {
                    tracing::debug!(
                        attempt_id = %attempt_id,
                        from = from.as_str(),
                        to = to.as_str(),
                        "analysis attempt already moved on"
                    );
                }
                changed
            }
            Err(error) => {
                tracing::warn!(attempt_id = %attempt_id, to = to.as_str(), error = %error, "analysis attempt transition failed");
                false
            }
        }
    }

    /// Applies the refund policy to a run that failed after charging.
    async fn settle_failure(
        &self,
        idea_id: &str,
        attempt: Option<&AnalysisAttempt>,
        receipt: &ChargeReceipt,
        error: &AppError,
    ) {
        if receipt.amount <= 0 {
            return;
        }
        let reason = error.to_string();
        match (self.refund_policy, attempt) {
            (RefundPolicy::ConsumeOnAttempt, Some(attempt)) => {
                self.transition(&attempt.id, AttemptStatus::InFlight, AttemptStatus::Failed, Some(&reason))
                    .await;
            }
            (RefundPolicy::ConsumeOnAttempt, None) => {}
            (RefundPolicy::RefundOnFailure, Some(attempt)) => {
                if self
                    .transition(&attempt.id, AttemptStatus::InFlight, AttemptStatus::Settling, Some(&reason))
                    .await
                {
                    let _ = self.refund_attempt(attempt).await;
                }
            }
            (RefundPolicy::RefundOnFailure, None) => {
                if let Err(refund_error) = self
                    .ledger
                    .refund(receipt.amount, Some(idea_id), "Refund for failed analysis")
                    .await
                {
                    tracing::warn!(idea_id = %idea_id, error = %refund_error, "refund after failed analysis did not go through");
                }
            }
        }
    }

    /// Refunds an attempt this pipeline has moved to `settling`. On a failed
    /// refund the attempt goes back to `failed` for the next reconciliation.
    async fn refund_attempt(&self, attempt: &AnalysisAttempt) -> AppResult<()> {
        match self
            .ledger
            .refund(attempt.amount, Some(&attempt.idea_id), "Refund for failed analysis")
            .await
        {
            Ok(_) => {
                self.transition(&attempt.id, AttemptStatus::Settling, AttemptStatus::Refunded, None)
                    .await;
                Ok(())
            }
            Err(error) => {
                tracing::warn!(attempt_id = %attempt.id, error = %error, "refund after failed analysis did not go through");
                self.transition(&attempt.id, AttemptStatus::Settling, AttemptStatus::Failed, None)
                    .await;
                Err(error)
            }
        }
    }

    /// Settles charged runs that never completed: failed attempts, plus
    /// in-flight attempts older than twice the timeout (abandoned sessions).
    ///
    /// Each attempt is claimed with a compare-and-set before any credit moves,
    /// so concurrent reconciliations from several tabs settle it once.
    pub async fn reconcile(&self) -> AppResult<ReconciliationReport> {
        let stale_before = Utc::now()
            - chrono::Duration::from_std(self.timeout * 2).unwrap_or_else(|_| chrono::Duration::minutes(30));
        let mut candidates = self.journal.list_attempts(&self.owner_id, Some(AttemptStatus::Failed)).await?;
        candidates.extend(
            self.journal
                .list_attempts(&self.owner_id, Some(AttemptStatus::InFlight))
                .await?
                .into_iter()
                .filter(|attempt| attempt.updated_at < stale_before && !self.stage(&attempt.idea_id).is_running()),
        );

        let mut report = ReconciliationReport::default();
        for attempt in candidates {
            let outcome = match self.refund_policy {
                RefundPolicy::ConsumeOnAttempt => self
                    .journal
                    .transition_attempt(&attempt.id, attempt.status, AttemptStatus::Consumed, None)
                    .await
                    .map(|claimed| {
                        if claimed {
                            report.consumed += 1;
                        }
                    }),
                RefundPolicy::RefundOnFailure => {
                    match self
                        .journal
                        .transition_attempt(&attempt.id, attempt.status, AttemptStatus::Settling, None)
                        .await
                    {
                        Ok(true) => self.refund_attempt(&attempt).await.map(|_| {
                            report.refunded += 1;
                            report.credits_returned += attempt.amount;
                        }),
                        Ok(false) => Ok(()),
                        Err(error) => Err(error),
                    }
                }
            };
            if let Err(error) = outcome {
                tracing::warn!(attempt_id = %attempt.id, error = %error, "reconciliation step failed");
                report.errors.push(format!("{}: {}", attempt.id, error));
            }
        }
        tracing::info!(
            user_id = %self.owner_id,
            consumed = report.consumed,
            refunded = report.refunded,
            credits_returned = report.credits_returned,
            "analysis attempts reconciled"
        );
        Ok(report)
    }
}

impl std::fmt::Debug for AnalysisPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalysisPipeline")
            .field("owner_id", &self.owner_id)
            .field("refund_policy", &self.refund_policy)
            .field("timeout", &self.timeout)
            .finish()
    }
}
