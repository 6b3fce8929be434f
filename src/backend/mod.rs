//! Seams to the remote collaborators: the data service (ledger, entity storage,
//! attempt journal) and the analysis service.

pub mod command;
pub mod sqlite;
pub mod structured_output;

use crate::errors::AppResult;
use crate::models::{
    Analysis, AnalysisAttempt, AnalysisRequest, AttemptStatus, ChargeReceipt, ChargeRequest, FeatureKey, Idea,
    IdeaScope, Tag,
};

/// Charge-and-log endpoint. Check, decrement and ledger append happen server-side
/// in one transaction. There is no dedup key: repeating a call charges twice.
#[async_trait::async_trait]
pub trait CreditService: Send + Sync {
    async fn charge_and_log(&self, request: ChargeRequest) -> AppResult<ChargeReceipt>;

    async fn refund(
        &self,
        user_id: &str,
        amount: i64,
        item_id: Option<&str>,
        description: &str,
    ) -> AppResult<ChargeReceipt>;

    async fn balance(&self, user_id: &str) -> AppResult<i64>;
}

/// Owner-scoped entity storage. Ids owned by someone else behave like missing ids.
#[async_trait::async_trait]
pub trait IdeaStore: Send + Sync {
    async fn list_ideas(&self, owner_id: &str, scope: &IdeaScope) -> AppResult<Vec<Idea>>;

    async fn get_idea(&self, owner_id: &str, idea_id: &str) -> AppResult<Idea>;

    async fn set_favorite(&self, owner_id: &str, idea_id: &str, is_favorite: bool) -> AppResult<()>;

    async fn set_idea_tags(&self, owner_id: &str, idea_id: &str, tag_ids: &[String]) -> AppResult<Vec<Tag>>;

    async fn delete_idea(&self, owner_id: &str, idea_id: &str) -> AppResult<()>;

    async fn replace_analysis(&self, owner_id: &str, analysis: &Analysis) -> AppResult<()>;
}

/// Journal of charged analysis runs, used to reconcile "charged but incomplete" runs.
#[async_trait::async_trait]
pub trait AttemptJournal: Send + Sync {
    async fn open_attempt(
        &self,
        user_id: &str,
        idea_id: &str,
        feature: FeatureKey,
        amount: i64,
        transaction_id: Option<&str>,
    ) -> AppResult<AnalysisAttempt>;

    /// Compare-and-set on the attempt status; `Ok(false)` when another settler got there first.
    async fn transition_attempt(
        &self,
        attempt_id: &str,
        from: AttemptStatus,
        to: AttemptStatus,
        reason: Option<&str>,
    ) -> AppResult<bool>;

    async fn list_attempts(&self, user_id: &str, status: Option<AttemptStatus>) -> AppResult<Vec<AnalysisAttempt>>;
}

#[async_trait::async_trait]
pub trait AnalysisService: Send + Sync {
    async fn analyze(&self, request: &AnalysisRequest) -> AppResult<Analysis>;
}
