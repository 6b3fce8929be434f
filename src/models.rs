use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlanTier {
    Free,
    Starter,
    Pro,
}

impl PlanTier {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Starter => "starter",
            Self::Pro => "pro",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "free" => Some(Self::Free),
            "starter" => Some(Self::Starter),
            "pro" => Some(Self::Pro),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub email: String,
    pub credits: i64,
    pub plan: PlanTier,
}

/// Metered features that consume credits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FeatureKey {
    InitialAnalysis,
    Reanalysis,
    AdvancedAnalysis,
    Refund,
}

impl FeatureKey {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InitialAnalysis => "initial-analysis",
            Self::Reanalysis => "reanalysis",
            Self::AdvancedAnalysis => "advanced-analysis",
            Self::Refund => "refund",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "initial-analysis" => Some(Self::InitialAnalysis),
            "reanalysis" => Some(Self::Reanalysis),
            "advanced-analysis" => Some(Self::AdvancedAnalysis),
            "refund" => Some(Self::Refund),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AnalysisStatus {
    Viable,
    Moderate,
    NotViable,
}

impl AnalysisStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Viable => "viable",
            Self::Moderate => "moderate",
            Self::NotViable => "not-viable",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "viable" => Some(Self::Viable),
            "moderate" => Some(Self::Moderate),
            "not-viable" => Some(Self::NotViable),
            _ => None,
        }
    }

    pub fn from_score(score: u8) -> Self {
        match score {
            70..=u8::MAX => Self::Viable,
            40..=69 => Self::Moderate,
            _ => Self::NotViable,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AnalysisSections {
    pub strengths: Vec<String>,
    pub weaknesses: Vec<String>,
    pub market: String,
    pub financials: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Analysis {
    pub idea_id: String,
    pub score: u8,
    pub status: AnalysisStatus,
    pub sections: AnalysisSections,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tag {
    pub id: String,
    pub name: String,
    pub color: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Idea {
    pub id: String,
    pub owner_id: String,
    pub title: String,
    pub description: String,
    pub audience: String,
    pub problem: String,
    pub has_competitors: bool,
    pub monetization: String,
    pub budget: String,
    pub location: String,
    pub is_favorite: bool,
    pub tags: Vec<Tag>,
    pub analysis: Option<Analysis>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NewIdea {
    pub title: String,
    pub description: String,
    pub audience: String,
    pub problem: String,
    pub has_competitors: bool,
    pub monetization: String,
    pub budget: String,
    pub location: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditTransaction {
    pub id: String,
    pub user_id: String,
    pub amount: i64,
    pub feature: FeatureKey,
    pub item_id: Option<String>,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargeRequest {
    pub user_id: String,
    pub amount: i64,
    pub feature: FeatureKey,
    pub item_id: Option<String>,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargeReceipt {
    /// `None` when the feature was free and nothing was logged.
    pub transaction_id: Option<String>,
    pub amount: i64,
    pub new_balance: i64,
}

/// Payload sent to the external analysis service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisRequest {
    pub idea_id: String,
    pub title: String,
    pub description: String,
    pub audience: String,
    pub problem: String,
    pub has_competitors: bool,
    pub monetization: String,
    pub budget: String,
    pub location: String,
    pub is_reanalysis: bool,
}

impl AnalysisRequest {
    pub fn from_idea(idea: &Idea, is_reanalysis: bool) -> Self {
        Self {
            idea_id: idea.id.clone(),
            title: idea.title.clone(),
            description: idea.description.clone(),
            audience: idea.audience.clone(),
            problem: idea.problem.clone(),
            has_competitors: idea.has_competitors,
            monetization: idea.monetization.clone(),
            budget: idea.budget.clone(),
            location: idea.location.clone(),
            is_reanalysis,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttemptStatus {
    InFlight,
    Completed,
    Failed,
    /// Claimed by one settler; the refund is in progress.
    Settling,
    Refunded,
    Consumed,
}

impl AttemptStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InFlight => "in-flight",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Settling => "settling",
            Self::Refunded => "refunded",
            Self::Consumed => "consumed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "in-flight" => Some(Self::InFlight),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "settling" => Some(Self::Settling),
            "refunded" => Some(Self::Refunded),
            "consumed" => Some(Self::Consumed),
            _ => None,
        }
    }
}

/// Journal row for an analysis run that consumed credits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisAttempt {
    pub id: String,
    pub user_id: String,
    pub idea_id: String,
    pub feature: FeatureKey,
    pub amount: i64,
    pub transaction_id: Option<String>,
    pub status: AttemptStatus,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Guarded user action kinds; the cooldown key is `(idea id, ActionKind)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionKind {
    Favorite,
    Tags,
    Delete,
    Analyze,
}

impl ActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Favorite => "favorite",
            Self::Tags => "tags",
            Self::Delete => "delete",
            Self::Analyze => "analyze",
        }
    }
}

/// Which ideas a view holds locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "kind", content = "ideaId")]
pub enum IdeaScope {
    All,
    Favorites,
    Single(String),
}
