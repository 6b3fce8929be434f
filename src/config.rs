use crate::errors::{AppError, AppResult};
use crate::models::FeatureKey;
use anyhow::Context;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_ACTION_COOLDOWN_MS: u64 = 500;
const DEFAULT_ANALYSIS_TIMEOUT_SECS: u64 = 90;
const MAX_ANALYSIS_TIMEOUT_SECS: u64 = 900;
pub const LOG_FILTER_ENV: &str = "IDEAGATE_LOG";

/// What happens to credits when an analysis fails after the charge went through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RefundPolicy {
    #[default]
    ConsumeOnAttempt,
    RefundOnFailure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisCommandConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DashboardConfig {
    pub action_cooldown_ms: u64,
    pub analysis_timeout_secs: u64,
    #[serde(deserialize_with = "merge_feature_costs")]
    pub feature_costs: BTreeMap<FeatureKey, i64>,
    pub refund_policy: RefundPolicy,
    pub log_filter: String,
    pub database_path: Option<PathBuf>,
    pub analysis_command: Option<AnalysisCommandConfig>,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            action_cooldown_ms: DEFAULT_ACTION_COOLDOWN_MS,
            analysis_timeout_secs: DEFAULT_ANALYSIS_TIMEOUT_SECS,
            feature_costs: default_feature_costs(),
            refund_policy: RefundPolicy::default(),
            log_filter: "info".to_string(),
            database_path: None,
            analysis_command: None,
        }
    }
}

fn default_feature_costs() -> BTreeMap<FeatureKey, i64> {
    [
        (FeatureKey::InitialAnalysis, 0),
        (FeatureKey::Reanalysis, 1),
        (FeatureKey::AdvancedAnalysis, 3),
    ]
    .into_iter()
    .collect()
}

/// A `featureCosts` map overrides the default prices key by key.
fn merge_feature_costs<'de, D>(deserializer: D) -> Result<BTreeMap<FeatureKey, i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let overrides = BTreeMap::<FeatureKey, i64>::deserialize(deserializer)?;
    let mut costs = default_feature_costs();
    costs.extend(overrides);
    Ok(costs)
}

impl DashboardConfig {
    pub fn load(path: &Path) -> AppResult<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> AppResult<Self> {
        let config: Self = if raw.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(raw)?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.analysis_timeout_secs == 0 || self.analysis_timeout_secs > MAX_ANALYSIS_TIMEOUT_SECS {
            return Err(AppError::InvalidInput(format!(
                "analysisTimeoutSecs must be between 1 and {}",
                MAX_ANALYSIS_TIMEOUT_SECS
            )));
        }
        if let Some((feature, cost)) = self.feature_costs.iter().find(|(_, cost)| **cost < 0) {
            return Err(AppError::InvalidInput(format!(
                "feature cost for {} cannot be negative ({})",
                feature.as_str(),
                cost
            )));
        }
        if self.feature_costs.contains_key(&FeatureKey::Refund) {
            return Err(AppError::InvalidInput("refund is not a billable feature".to_string()));
        }
        if let Some(command) = &self.analysis_command {
            if command.program.trim().is_empty() {
                return Err(AppError::InvalidInput("analysisCommand.program cannot be empty".to_string()));
            }
        }
        Ok(())
    }

    pub fn action_cooldown(&self) -> Duration {
        Duration::from_millis(self.action_cooldown_ms)
    }

    pub fn analysis_timeout(&self) -> Duration {
        Duration::from_secs(self.analysis_timeout_secs)
    }

    /// Unlisted features are free.
    pub fn cost_of(&self, feature: FeatureKey) -> i64 {
        self.feature_costs.get(&feature).copied().unwrap_or(0)
    }

    pub fn effective_log_filter(&self) -> String {
        std::env::var(LOG_FILTER_ENV)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| self.log_filter.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::{DashboardConfig, RefundPolicy, LOG_FILTER_ENV};
    use crate::models::FeatureKey;

    #[test]
    fn empty_yaml_yields_defaults() {
        let config = DashboardConfig::from_yaml("").expect("config");
        assert_eq!(config, DashboardConfig::default());
        assert_eq!(config.action_cooldown().as_millis(), 500);
        assert_eq!(config.cost_of(FeatureKey::Reanalysis), 1);
        assert_eq!(config.refund_policy, RefundPolicy::ConsumeOnAttempt);
    }

    #[test]
    fn partial_yaml_overrides_only_given_fields() {
        let config = DashboardConfig::from_yaml(
            "actionCooldownMs: 250\nrefundPolicy: refund-on-failure\nfeatureCosts:\n  reanalysis: 2\n",
        )
        .expect("config");
        assert_eq!(config.action_cooldown_ms, 250);
        assert_eq!(config.refund_policy, RefundPolicy::RefundOnFailure);
        assert_eq!(config.cost_of(FeatureKey::Reanalysis), 2);
        assert_eq!(config.cost_of(FeatureKey::AdvancedAnalysis), 3);
        assert_eq!(config.cost_of(FeatureKey::InitialAnalysis), 0);
        assert_eq!(config.analysis_timeout_secs, 90);
    }

    #[test]
    fn feature_cost_overrides_keep_unlisted_defaults() {
        let config = DashboardConfig::from_yaml("featureCosts:\n  initial-analysis: 1\n").expect("config");
        assert_eq!(config.cost_of(FeatureKey::InitialAnalysis), 1);
        assert_eq!(config.cost_of(FeatureKey::Reanalysis), 1);
        assert_eq!(config.cost_of(FeatureKey::AdvancedAnalysis), 3);
    }

    #[test]
    fn log_filter_env_wins_over_configured_filter() {
        let config = DashboardConfig::from_yaml("logFilter: ideagate=debug\n").expect("config");
        std::env::remove_var(LOG_FILTER_ENV);
        assert_eq!(config.effective_log_filter(), "ideagate=debug");
        std::env::set_var(LOG_FILTER_ENV, "warn");
        assert_eq!(config.effective_log_filter(), "warn");
        std::env::remove_var(LOG_FILTER_ENV);
    }

    #[test]
    fn rejects_negative_costs_and_zero_timeout() {
        assert!(DashboardConfig::from_yaml("featureCosts:\n  reanalysis: -1\n").is_err());
        assert!(DashboardConfig::from_yaml("analysisTimeoutSecs: 0\n").is_err());
    }

    #[test]
    fn load_reads_file_from_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ideagate.yaml");
        std::fs::write(&path, "analysisCommand:\n  program: analyze-idea\n  args: [\"--json\"]\n").expect("write");
        let config = DashboardConfig::load(&path).expect("load");
        let command = config.analysis_command.expect("command");
        assert_eq!(command.program, "analyze-idea");
        assert_eq!(command.args, vec!["--json".to_string()]);
    }

    #[test]
    fn missing_file_is_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let error = DashboardConfig::load(&dir.path().join("absent.yaml")).expect_err("missing");
        assert!(error.to_string().contains("failed to read config"));
    }
}
