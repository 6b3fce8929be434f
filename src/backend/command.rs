use super::structured_output::parse_analysis_output;
use super::AnalysisService;
use crate::config::AnalysisCommandConfig;
use crate::errors::{AppError, AppResult};
use crate::models::{Analysis, AnalysisRequest};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

const MAX_STDERR_SUMMARY_CHARS: usize = 400;

/// Analysis service that runs an external program: the request JSON goes to
/// stdin and the analysis JSON document is read from stdout.
#[derive(Debug, Clone)]
pub struct CommandAnalysisService {
    program: String,
    args: Vec<String>,
}

impl CommandAnalysisService {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn from_config(config: &AnalysisCommandConfig) -> Self {
        Self::new(config.program.clone(), config.args.clone())
    }
}

#[async_trait::async_trait]
impl AnalysisService for CommandAnalysisService {
    async fn analyze(&self, request: &AnalysisRequest) -> AppResult<Analysis> {
        let payload = serde_json::to_vec(request)?;

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // a pipeline timeout drops this future; the child must not outlive it
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|error| AppError::AnalysisService(format!("failed to spawn {}: {}", self.program, error)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&payload)
                .await
                .map_err(|error| AppError::AnalysisService(format!("failed to write request: {}", error)))?;
            let _ = stdin.shutdown().await;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|error| AppError::AnalysisService(format!("analysis process failed: {}", error)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let summary: String = stderr.trim().chars().take(MAX_STDERR_SUMMARY_CHARS).collect();
            tracing::warn!(
                idea_id = %request.idea_id,
                exit_code = ?output.status.code(),
                stderr = %summary,
                "analysis command exited unsuccessfully"
            );
            return Err(AppError::AnalysisService(format!(
                "analysis command exited with {:?}: {}",
                output.status.code(),
                summary
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_analysis_output(&request.idea_id, &stdout)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::CommandAnalysisService;
    use crate::backend::AnalysisService;
    use crate::errors::AppError;
    use crate::models::{AnalysisRequest, AnalysisStatus};

    fn request() -> AnalysisRequest {
        AnalysisRequest {
            idea_id: "idea-7".to_string(),
            title: "Bike repair subscriptions".to_string(),
            description: "Monthly tune-ups for commuters".to_string(),
            audience: "Urban commuters".to_string(),
            problem: "Bikes break at bad times".to_string(),
            has_competitors: true,
            monetization: "Subscription".to_string(),
            budget: "5k".to_string(),
            location: "Berlin".to_string(),
            is_reanalysis: false,
        }
    }

    fn shell(script: &str) -> CommandAnalysisService {
        CommandAnalysisService::new("sh", vec!["-c".to_string(), script.to_string()])
    }

    #[tokio::test]
    async fn parses_analysis_printed_by_command() {
        let service = shell("cat > /dev/null; echo 'progress: scoring'; echo '{\"score\": 55, \"weaknesses\": [\"Churn\"]}'");
        let analysis = service.analyze(&request()).await.expect("analysis");
        assert_eq!(analysis.idea_id, "idea-7");
        assert_eq!(analysis.score, 55);
        assert_eq!(analysis.status, AnalysisStatus::Moderate);
        assert_eq!(analysis.sections.weaknesses, vec!["Churn".to_string()]);
    }

    #[tokio::test]
    async fn request_is_written_to_stdin_as_json() {
        let service = shell("grep -q '\"isReanalysis\":false' && echo '{\"score\": 90}'");
        let analysis = service.analyze(&request()).await.expect("analysis");
        assert_eq!(analysis.score, 90);
    }

    #[tokio::test]
    async fn nonzero_exit_is_a_service_error() {
        let service = shell("cat > /dev/null; echo 'model overloaded' >&2; exit 3");
        let error = service.analyze(&request()).await.expect_err("failure");
        assert!(matches!(error, AppError::AnalysisService(message) if message.contains("model overloaded")));
    }

    #[tokio::test]
    async fn missing_program_is_a_service_error() {
        let service = CommandAnalysisService::new("/nonexistent/analyze-idea", Vec::new());
        assert!(matches!(
            service.analyze(&request()).await,
            Err(AppError::AnalysisService(_))
        ));
    }
}
