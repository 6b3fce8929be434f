use super::{AttemptJournal, CreditService, IdeaStore};
use crate::db::Database;
use crate::errors::AppResult;
use crate::models::{
    Analysis, AnalysisAttempt, AttemptStatus, ChargeReceipt, ChargeRequest, FeatureKey, Idea, IdeaScope, Tag,
};
use std::sync::Arc;

/// Data service backed by the local SQLite database.
#[derive(Debug, Clone)]
pub struct SqliteDataService {
    db: Arc<Database>,
}

impl SqliteDataService {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }
}

#[async_trait::async_trait]
impl CreditService for SqliteDataService {
    async fn charge_and_log(&self, request: ChargeRequest) -> AppResult<ChargeReceipt> {
        self.db.charge_and_log(&request)
    }

    async fn refund(
        &self,
        user_id: &str,
        amount: i64,
        item_id: Option<&str>,
        description: &str,
    ) -> AppResult<ChargeReceipt> {
        self.db.refund_and_log(user_id, amount, item_id, description)
    }

    async fn balance(&self, user_id: &str) -> AppResult<i64> {
        Ok(self.db.get_user(user_id)?.credits)
    }
}

#[async_trait::async_trait]
impl IdeaStore for SqliteDataService {
    async fn list_ideas(&self, owner_id: &str, scope: &IdeaScope) -> AppResult<Vec<Idea>> {
        self.db.list_ideas(owner_id, scope)
    }

    async fn get_idea(&self, owner_id: &str, idea_id: &str) -> AppResult<Idea> {
        self.db.get_idea(owner_id, idea_id)
    }

    async fn set_favorite(&self, owner_id: &str, idea_id: &str, is_favorite: bool) -> AppResult<()> {
        self.db.set_favorite(owner_id, idea_id, is_favorite)
    }

    async fn set_idea_tags(&self, owner_id: &str, idea_id: &str, tag_ids: &[String]) -> AppResult<Vec<Tag>> {
        self.db.set_idea_tags(owner_id, idea_id, tag_ids)
    }

    async fn delete_idea(&self, owner_id: &str, idea_id: &str) -> AppResult<()> {
        self.db.delete_idea(owner_id, idea_id)
    }

    async fn replace_analysis(&self, owner_id: &str, analysis: &Analysis) -> AppResult<()> {
        self.db.replace_analysis(owner_id, analysis)
    }
}

#[async_trait::async_trait]
impl AttemptJournal for SqliteDataService {
    async fn open_attempt(
        &self,
        user_id: &str,
        idea_id: &str,
        feature: FeatureKey,
        amount: i64,
        transaction_id: Option<&str>,
    ) -> AppResult<AnalysisAttempt> {
        self.db.insert_attempt(user_id, idea_id, feature, amount, transaction_id)
    }

    async fn transition_attempt(
        &self,
        attempt_id: &str,
        from: AttemptStatus,
        to: AttemptStatus,
        reason: Option<&str>,
    ) -> AppResult<bool> {
        self.db.transition_attempt(attempt_id, from, to, reason)
    }

    async fn list_attempts(&self, user_id: &str, status: Option<AttemptStatus>) -> AppResult<Vec<AnalysisAttempt>> {
        self.db.list_attempts(user_id, status)
    }
}

#[cfg(test)]
mod tests {
    use super::SqliteDataService;
    use crate::backend::{CreditService, IdeaStore};
    use crate::db::Database;
    use crate::models::{ChargeRequest, FeatureKey, IdeaScope, NewIdea, PlanTier};
    use std::sync::Arc;

    #[tokio::test]
    async fn concurrent_charges_cannot_overdraw() {
        let db = Arc::new(Database::open_in_memory().expect("db"));
        let user = db.create_user("a@example.com", PlanTier::Free, 1).expect("user");
        let service = SqliteDataService::new(db.clone());

        let request = || ChargeRequest {
            user_id: user.id.clone(),
            amount: 1,
            feature: FeatureKey::Reanalysis,
            item_id: None,
            description: "Reanalysis".to_string(),
        };
        let (first, second) = tokio::join!(service.charge_and_log(request()), service.charge_and_log(request()));

        assert_eq!([first.is_ok(), second.is_ok()].iter().filter(|ok| **ok).count(), 1);
        assert_eq!(service.balance(&user.id).await.expect("balance"), 0);
        assert_eq!(db.list_transactions(&user.id).expect("tx").len(), 1);
    }

    #[tokio::test]
    async fn store_reads_back_what_it_wrote() {
        let db = Arc::new(Database::open_in_memory().expect("db"));
        let user = db.create_user("a@example.com", PlanTier::Free, 0).expect("user");
        let idea = db
            .create_idea(
                &user.id,
                &NewIdea {
                    title: "Meal kits for climbers".to_string(),
                    ..NewIdea::default()
                },
            )
            .expect("idea");
        let service = SqliteDataService::new(db);

        service.set_favorite(&user.id, &idea.id, true).await.expect("favorite");
        let ideas = service.list_ideas(&user.id, &IdeaScope::Favorites).await.expect("list");
        assert_eq!(ideas.len(), 1);
        assert!(ideas[0].is_favorite);
    }
}
