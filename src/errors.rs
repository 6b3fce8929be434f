use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("INSUFFICIENT_CREDITS: {feature} costs {required}, balance is {balance}")]
    InsufficientCredits {
        feature: String,
        required: i64,
        balance: i64,
    },
    #[error("REMOTE_WRITE: {0}")]
    RemoteWrite(String),
    #[error("ANALYSIS_SERVICE: {0}")]
    AnalysisService(String),
    #[error("NOT_FOUND: {0}")]
    NotFound(String),
    #[error("ANALYSIS_IN_PROGRESS: {0}")]
    AnalysisInProgress(String),
    #[error("INVALID_INPUT: {0}")]
    InvalidInput(String),
    #[error("IO_FAILURE: {0}")]
    Io(String),
    #[error("INTERNAL: {0}")]
    Internal(String),
}

impl AppError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InsufficientCredits { .. } => "INSUFFICIENT_CREDITS",
            Self::RemoteWrite(_) => "REMOTE_WRITE",
            Self::AnalysisService(_) => "ANALYSIS_SERVICE",
            Self::NotFound(_) => "NOT_FOUND",
            Self::AnalysisInProgress(_) => "ANALYSIS_IN_PROGRESS",
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::Io(_) => "IO_FAILURE",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// Whether re-invoking the same action can succeed without user changes.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RemoteWrite(_) | Self::AnalysisService(_) | Self::Io(_)
        )
    }
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(value: rusqlite::Error) -> Self {
        match value {
            rusqlite::Error::QueryReturnedNoRows => Self::NotFound("no matching row".to_string()),
            other => Self::RemoteWrite(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(value: serde_json::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<serde_yaml::Error> for AppError {
    fn from(value: serde_yaml::Error) -> Self {
        Self::InvalidInput(value.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(value: anyhow::Error) -> Self {
        Self::Internal(format!("{:#}", value))
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

/// Follow-up offered next to a notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum NoticeAction {
    BuyCredits,
    Retry,
    BackToList,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notice {
    pub level: NoticeLevel,
    pub code: String,
    pub message: String,
    pub action: Option<NoticeAction>,
}

impl Notice {
    pub fn from_error(error: &AppError) -> Self {
        let (level, message, action) = match error {
            AppError::InsufficientCredits { required, balance, .. } => (
                NoticeLevel::Warning,
                format!(
                    "This action needs {} credit(s) and you have {}. Top up or upgrade your plan to continue.",
                    required, balance
                ),
                Some(NoticeAction::BuyCredits),
            ),
            AppError::RemoteWrite(_) | AppError::Io(_) => (
                NoticeLevel::Error,
                "Your change could not be saved. Please try again.".to_string(),
                Some(NoticeAction::Retry),
            ),
            AppError::AnalysisService(_) => (
                NoticeLevel::Error,
                "The analysis could not be completed. Please try again in a moment.".to_string(),
                Some(NoticeAction::Retry),
            ),
            AppError::NotFound(_) => (
                NoticeLevel::Warning,
                "This idea no longer exists or you do not have access to it.".to_string(),
                Some(NoticeAction::BackToList),
            ),
            AppError::AnalysisInProgress(_) => (
                NoticeLevel::Info,
                "An analysis for this idea is already running.".to_string(),
                None,
            ),
            AppError::InvalidInput(detail) => (NoticeLevel::Warning, detail.clone(), None),
            AppError::Internal(_) => (
                NoticeLevel::Error,
                "Something went wrong. Please reload the page.".to_string(),
                None,
            ),
        };
        Self {
            level,
            code: error.code().to_string(),
            message,
            action,
        }
    }
}

/// Sink for user-visible notices (toasts, banners).
pub trait Notifier: Send + Sync {
    fn notify(&self, notice: Notice);
}

/// Notifier that only logs; used when no UI sink is attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, notice: Notice) {
        match notice.level {
            NoticeLevel::Error => tracing::error!(code = %notice.code, message = %notice.message, "user notice"),
            NoticeLevel::Warning => tracing::warn!(code = %notice.code, message = %notice.message, "user notice"),
            NoticeLevel::Info => tracing::info!(code = %notice.code, message = %notice.message, "user notice"),
        }
    }
}
