use crate::backend::CreditService;
use crate::config::DashboardConfig;
use crate::errors::{AppError, AppResult};
use crate::models::{ChargeReceipt, ChargeRequest, FeatureKey};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

const UNKNOWN_BALANCE: i64 = -1;

/// Client-side gateway to the charge-and-log endpoint.
///
/// The cached balance is a display hint refreshed from receipts; the server-side
/// conditional decrement is the only thing that decides whether a charge passes.
#[derive(Clone)]
pub struct CreditLedger {
    service: Arc<dyn CreditService>,
    user_id: String,
    prices: BTreeMap<FeatureKey, i64>,
    balance_hint: Arc<AtomicI64>,
}

impl CreditLedger {
    pub fn new(service: Arc<dyn CreditService>, user_id: impl Into<String>, config: &DashboardConfig) -> Self {
        Self {
            service,
            user_id: user_id.into(),
            prices: config.feature_costs.clone(),
            balance_hint: Arc::new(AtomicI64::new(UNKNOWN_BALANCE)),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn price_of(&self, feature: FeatureKey) -> i64 {
        self.prices.get(&feature).copied().unwrap_or(0)
    }

    /// Last balance seen from the service, if any.
    pub fn balance_hint(&self) -> Option<i64> {
        match self.balance_hint.load(Ordering::SeqCst) {
            UNKNOWN_BALANCE => None,
            balance => Some(balance),
        }
    }

    pub async fn refresh_balance(&self) -> AppResult<i64> {
        let balance = self.service.balance(&self.user_id).await?;
        self.balance_hint.store(balance, Ordering::SeqCst);
        Ok(balance)
    }

    /// Charges the configured price of `feature`.
    pub async fn charge_feature(&self, feature: FeatureKey, item_id: Option<&str>) -> AppResult<ChargeReceipt> {
        self.charge(feature, self.price_of(feature), item_id).await
    }

    /// One atomic remote charge. A zero amount is free and skips the charge;
    /// its receipt carries the known balance, fetched if none is cached.
    pub async fn charge(&self, feature: FeatureKey, amount: i64, item_id: Option<&str>) -> AppResult<ChargeReceipt> {
        if amount < 0 {
            return Err(AppError::InvalidInput(format!("charge amount cannot be negative ({})", amount)));
        }
        if amount == 0 {
            let new_balance = match self.balance_hint() {
                Some(balance) => balance,
                None => self.refresh_balance().await?,
            };
            return Ok(ChargeReceipt {
                transaction_id: None,
                amount: 0,
                new_balance,
            });
        }

        let request = ChargeRequest {
            user_id: self.user_id.clone(),
            amount,
            feature,
            item_id: item_id.map(ToString::to_string),
            description: describe(feature, item_id),
        };

        match self.service.charge_and_log(request).await {
            Ok(receipt) => {
                self.balance_hint.store(receipt.new_balance, Ordering::SeqCst);
                tracing::info!(
                    user_id = %self.user_id,
                    feature = feature.as_str(),
                    amount,
                    new_balance = receipt.new_balance,
                    "credits charged"
                );
                Ok(receipt)
            }
            Err(error) => {
                if let AppError::InsufficientCredits { balance, .. } = &error {
                    self.balance_hint.store(*balance, Ordering::SeqCst);
                }
                tracing::warn!(
                    user_id = %self.user_id,
                    feature = feature.as_str(),
                    amount,
                    error = %error,
                    "credit charge rejected"
                );
                Err(error)
            }
        }
    }

    pub async fn refund(&self, amount: i64, item_id: Option<&str>, reason: &str) -> AppResult<ChargeReceipt> {
        let receipt = self.service.refund(&self.user_id, amount, item_id, reason).await?;
        self.balance_hint.store(receipt.new_balance, Ordering::SeqCst);
        tracing::info!(user_id = %self.user_id, amount, new_balance = receipt.new_balance, "credits refunded");
        Ok(receipt)
    }
}

fn describe(feature: FeatureKey, item_id: Option<&str>) -> String {
    let label = match feature {
        FeatureKey::InitialAnalysis => "Idea analysis",
        FeatureKey::Reanalysis => "Idea reanalysis",
        FeatureKey::AdvancedAnalysis => "Advanced idea analysis",
        FeatureKey::Refund => "Credit refund",
    };
    match item_id {
        Some(item_id) => format!("{} ({})", label, item_id),
        None => label.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::CreditLedger;
    use crate::backend::sqlite::SqliteDataService;
    use crate::config::DashboardConfig;
    use crate::db::Database;
    use crate::errors::AppError;
    use crate::models::{FeatureKey, PlanTier};
    use std::sync::Arc;

    fn ledger_with_balance(credits: i64) -> (Arc<Database>, CreditLedger) {
        let db = Arc::new(Database::open_in_memory().expect("db"));
        let user = db.create_user("a@example.com", PlanTier::Free, credits).expect("user");
        let service = Arc::new(SqliteDataService::new(db.clone()));
        let ledger = CreditLedger::new(service, user.id, &DashboardConfig::default());
        (db, ledger)
    }

    #[tokio::test]
    async fn charge_updates_hint_from_receipt() {
        let (db, ledger) = ledger_with_balance(1);
        assert_eq!(ledger.balance_hint(), None);

        let receipt = ledger
            .charge_feature(FeatureKey::Reanalysis, Some("idea-1"))
            .await
            .expect("charge");
        assert_eq!(receipt.new_balance, 0);
        assert_eq!(ledger.balance_hint(), Some(0));

        let transactions = db.list_transactions(ledger.user_id()).expect("tx");
        assert_eq!(transactions.len(), 1);
        assert_eq!(transactions[0].description, "Idea reanalysis (idea-1)");
    }

    #[tokio::test]
    async fn insufficient_credits_leaves_balance_alone() {
        let (db, ledger) = ledger_with_balance(0);
        let error = ledger
            .charge_feature(FeatureKey::Reanalysis, Some("idea-1"))
            .await
            .expect_err("insufficient");
        assert!(matches!(error, AppError::InsufficientCredits { required: 1, balance: 0, .. }));
        assert_eq!(ledger.balance_hint(), Some(0));
        assert!(db.list_transactions(ledger.user_id()).expect("tx").is_empty());
    }

    #[tokio::test]
    async fn stale_hint_does_not_gate_charges() {
        let (db, ledger) = ledger_with_balance(0);
        ledger.refresh_balance().await.expect("refresh");
        assert_eq!(ledger.balance_hint(), Some(0));

        // credits bought in another tab
        db.refund_and_log(ledger.user_id(), 2, None, "purchase").expect("top up");
        let receipt = ledger.charge(FeatureKey::Reanalysis, 1, None).await.expect("charge");
        assert_eq!(receipt.new_balance, 1);
    }

    #[tokio::test]
    async fn free_features_skip_the_ledger() {
        let (db, ledger) = ledger_with_balance(0);
        let receipt = ledger
            .charge_feature(FeatureKey::InitialAnalysis, Some("idea-1"))
            .await
            .expect("free");
        assert!(receipt.transaction_id.is_none());
        assert!(db.list_transactions(ledger.user_id()).expect("tx").is_empty());
    }

    #[tokio::test]
    async fn free_receipt_reports_real_balance_when_hint_is_unknown() {
        let (db, ledger) = ledger_with_balance(7);
        let receipt = ledger
            .charge_feature(FeatureKey::InitialAnalysis, Some("idea-1"))
            .await
            .expect("free");
        assert_eq!(receipt.new_balance, 7);
        assert_eq!(ledger.balance_hint(), Some(7));
        assert!(db.list_transactions(ledger.user_id()).expect("tx").is_empty());
    }

    #[tokio::test]
    async fn refund_credits_back() {
        let (_db, ledger) = ledger_with_balance(3);
        ledger.charge(FeatureKey::AdvancedAnalysis, 3, None).await.expect("charge");
        let receipt = ledger.refund(3, None, "analysis failed").await.expect("refund");
        assert_eq!(receipt.new_balance, 3);
        assert_eq!(ledger.balance_hint(), Some(3));
    }
}
