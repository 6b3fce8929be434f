use crate::errors::{AppError, AppResult};
use crate::models::{Analysis, AnalysisSections, AnalysisStatus};
use chrono::Utc;
use once_cell::sync::Lazy;
use serde::Deserialize;
use serde_json::Value;

static ANALYSIS_SCHEMA: Lazy<Value> = Lazy::new(|| {
    serde_json::json!({
        "type": "object",
        "properties": {
            "score": { "type": "integer", "minimum": 0, "maximum": 100 },
            "status": { "type": "string", "enum": ["viable", "moderate", "not-viable"] },
            "strengths": { "type": "array", "items": { "type": "string" } },
            "weaknesses": { "type": "array", "items": { "type": "string" } },
            "market": { "type": "string" },
            "financials": { "type": "string" }
        },
        "required": ["score"]
    })
});

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnalysisOutput {
    score: u8,
    status: Option<AnalysisStatus>,
    #[serde(default)]
    strengths: Vec<String>,
    #[serde(default)]
    weaknesses: Vec<String>,
    #[serde(default)]
    market: String,
    #[serde(default)]
    financials: String,
}

/// Picks the last line of `raw` that parses as a JSON object, so services may
/// print progress lines before the final document.
pub fn resolve_structured_output(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }
    trimmed
        .lines()
        .rev()
        .filter_map(|line| serde_json::from_str::<Value>(line.trim()).ok())
        .find(Value::is_object)
}

pub fn validate_analysis_output(value: &Value) -> Vec<String> {
    let compiled = match jsonschema::JSONSchema::compile(&ANALYSIS_SCHEMA) {
        Ok(compiled) => compiled,
        Err(error) => return vec![format!("Failed to compile analysis schema: {}", error)],
    };

    compiled
        .validate(value)
        .err()
        .map(|errors| {
            errors
                .map(|error| {
                    let path = error.instance_path.to_string();
                    if path.is_empty() {
                        error.to_string()
                    } else {
                        format!("{}: {}", path, error)
                    }
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default()
}

/// Turns raw service output into an [`Analysis`] for `idea_id`.
pub fn parse_analysis_output(idea_id: &str, raw: &str) -> AppResult<Analysis> {
    let value = resolve_structured_output(raw)
        .ok_or_else(|| AppError::AnalysisService("analysis output is missing or invalid JSON".to_string()))?;

    let errors = validate_analysis_output(&value);
    if !errors.is_empty() {
        return Err(AppError::AnalysisService(format!(
            "analysis output did not match schema: {}",
            errors.join("; ")
        )));
    }

    let output: AnalysisOutput =
        serde_json::from_value(value).map_err(|error| AppError::AnalysisService(error.to_string()))?;

    Ok(Analysis {
        idea_id: idea_id.to_string(),
        score: output.score,
        status: output.status.unwrap_or_else(|| AnalysisStatus::from_score(output.score)),
        sections: AnalysisSections {
            strengths: output.strengths,
            weaknesses: output.weaknesses,
            market: output.market,
            financials: output.financials,
        },
        created_at: Utc::now(),
    })
}
