use crate::errors::{AppError, AppResult};
use crate::models::{
    Analysis, AnalysisAttempt, AnalysisSections, AnalysisStatus, AttemptStatus, ChargeReceipt, ChargeRequest,
    CreditTransaction, FeatureKey, Idea, IdeaScope, NewIdea, PlanTier, Tag, User,
};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

const SCHEMA_SQL: &str = include_str!("schema.sql");
const MAX_TAG_NAME_LENGTH: usize = 32;

static TAG_COLOR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^#[0-9A-Fa-f]{6}$").expect("valid tag color regex"));

const IDEA_COLUMNS: &str = "id, owner_id, title, description, audience, problem, has_competitors,
    monetization, budget, location, is_favorite, created_at, updated_at";

/// SQLite-backed source of truth for users, ideas, tags, analyses and the credit ledger.
#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn new(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| AppError::Io(err.to_string()))?;
        }
        let conn = Connection::open(path).map_err(AppError::from)?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> AppResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> AppResult<Self> {
        conn.execute_batch(SCHEMA_SQL).map_err(AppError::from)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn lock(&self) -> AppResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))
    }

    pub fn create_user(&self, email: &str, plan: PlanTier, credits: i64) -> AppResult<User> {
        if credits < 0 {
            return Err(AppError::InvalidInput("initial credits cannot be negative".to_string()));
        }
        let id = Uuid::new_v4().to_string();
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO users (id, email, credits, plan, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, email, credits, plan.as_str(), Utc::now().to_rfc3339()],
        )?;
        Ok(User {
            id,
            email: email.to_string(),
            credits,
            plan,
        })
    }

    pub fn get_user(&self, user_id: &str) -> AppResult<User> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, email, credits, plan FROM users WHERE id = ?1",
            [user_id],
            |row| {
                Ok(User {
                    id: row.get(0)?,
                    email: row.get(1)?,
                    credits: row.get(2)?,
                    plan: parse_plan(&row.get::<_, String>(3)?)?,
                })
            },
        )
        .optional()?
        .ok_or_else(|| AppError::NotFound(format!("user {}", user_id)))
    }

    /// Decrements the balance and appends the ledger row in one transaction.
    ///
    /// The conditional update is the only balance gate: a concurrent charge that
    /// would take the balance below zero matches no row and is rejected.
    pub fn charge_and_log(&self, request: &ChargeRequest) -> AppResult<ChargeReceipt> {
        if request.amount <= 0 {
            return Err(AppError::InvalidInput(format!(
                "charge amount must be positive, got {}",
                request.amount
            )));
        }
        let now = Utc::now().to_rfc3339();
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let changed = tx.execute(
            "UPDATE users SET credits = credits - ?1 WHERE id = ?2 AND credits >= ?1",
            params![request.amount, request.user_id],
        )?;
        if changed == 0 {
            let balance: Option<i64> = tx
                .query_row("SELECT credits FROM users WHERE id = ?1", [&request.user_id], |row| row.get(0))
                .optional()?;
            return match balance {
                Some(balance) => Err(AppError::InsufficientCredits {
                    feature: request.feature.as_str().to_string(),
                    required: request.amount,
                    balance,
                }),
                None => Err(AppError::NotFound(format!("user {}", request.user_id))),
            };
        }

        let transaction_id = Uuid::new_v4().to_string();
        tx.execute(
            "INSERT INTO credit_transactions (id, user_id, amount, feature, item_id, description, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                transaction_id,
                request.user_id,
                request.amount,
                request.feature.as_str(),
                request.item_id,
                request.description,
                now,
            ],
        )?;
        let new_balance: i64 =
            tx.query_row("SELECT credits FROM users WHERE id = ?1", [&request.user_id], |row| row.get(0))?;
        tx.commit()?;

        Ok(ChargeReceipt {
            transaction_id: Some(transaction_id),
            amount: request.amount,
            new_balance,
        })
    }

    /// Compensating credit; logged as a negative-amount ledger row.
    pub fn refund_and_log(
        &self,
        user_id: &str,
        amount: i64,
        item_id: Option<&str>,
        description: &str,
    ) -> AppResult<ChargeReceipt> {
        if amount <= 0 {
            return Err(AppError::InvalidInput(format!("refund amount must be positive, got {}", amount)));
        }
        let now = Utc::now().to_rfc3339();
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE users SET credits = credits + ?1 WHERE id = ?2",
            params![amount, user_id],
        )?;
        if changed == 0 {
            return Err(AppError::NotFound(format!("user {}", user_id)));
        }
        let transaction_id = Uuid::new_v4().to_string();
        tx.execute(
            "INSERT INTO credit_transactions (id, user_id, amount, feature, item_id, description, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                transaction_id,
                user_id,
                -amount,
                FeatureKey::Refund.as_str(),
                item_id,
                description,
                now
            ],
        )?;
        let new_balance: i64 = tx.query_row("SELECT credits FROM users WHERE id = ?1", [user_id], |row| row.get(0))?;
        tx.commit()?;
        Ok(ChargeReceipt {
            transaction_id: Some(transaction_id),
            amount: -amount,
            new_balance,
        })
    }

    pub fn list_transactions(&self, user_id: &str) -> AppResult<Vec<CreditTransaction>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, user_id, amount, feature, item_id, description, created_at
             FROM credit_transactions WHERE user_id = ?1 ORDER BY created_at ASC, rowid ASC",
        )?;
        let rows = stmt.query_map([user_id], |row| {
            Ok(CreditTransaction {
                id: row.get(0)?,
                user_id: row.get(1)?,
                amount: row.get(2)?,
                feature: parse_feature(&row.get::<_, String>(3)?)?,
                item_id: row.get(4)?,
                description: row.get(5)?,
                created_at: parse_time(&row.get::<_, String>(6)?)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(AppError::from)
    }

    pub fn create_idea(&self, owner_id: &str, payload: &NewIdea) -> AppResult<Idea> {
        let title = payload.title.trim();
        if title.is_empty() {
            return Err(AppError::InvalidInput("idea title cannot be empty".to_string()));
        }
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO ideas (
               id, owner_id, title, description, audience, problem, has_competitors,
               monetization, budget, location, is_favorite, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0, ?11, ?11)",
            params![
                id,
                owner_id,
                title,
                payload.description,
                payload.audience,
                payload.problem,
                payload.has_competitors,
                payload.monetization,
                payload.budget,
                payload.location,
                now.to_rfc3339(),
            ],
        )?;
        load_idea(&conn, owner_id, &id)
    }

    pub fn update_idea(&self, owner_id: &str, idea_id: &str, payload: &NewIdea) -> AppResult<Idea> {
        let title = payload.title.trim();
        if title.is_empty() {
            return Err(AppError::InvalidInput("idea title cannot be empty".to_string()));
        }
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE ideas SET title = ?1, description = ?2, audience = ?3, problem = ?4,
               has_competitors = ?5, monetization = ?6, budget = ?7, location = ?8, updated_at = ?9
             WHERE id = ?10 AND owner_id = ?11",
            params![
                title,
                payload.description,
                payload.audience,
                payload.problem,
                payload.has_competitors,
                payload.monetization,
                payload.budget,
                payload.location,
                Utc::now().to_rfc3339(),
                idea_id,
                owner_id,
            ],
        )?;
        if changed == 0 {
            return Err(idea_not_found(idea_id));
        }
        load_idea(&conn, owner_id, idea_id)
    }

    pub fn get_idea(&self, owner_id: &str, idea_id: &str) -> AppResult<Idea> {
        let conn = self.lock()?;
        load_idea(&conn, owner_id, idea_id)
    }

    pub fn list_ideas(&self, owner_id: &str, scope: &IdeaScope) -> AppResult<Vec<Idea>> {
        let conn = self.lock()?;
        let (filter, scoped_id) = match scope {
            IdeaScope::All => ("", None),
            IdeaScope::Favorites => (" AND is_favorite = 1", None),
            IdeaScope::Single(idea_id) => (" AND id = ?2", Some(idea_id.as_str())),
        };
        let sql = format!(
            "SELECT {} FROM ideas WHERE owner_id = ?1{} ORDER BY created_at DESC, rowid DESC",
            IDEA_COLUMNS, filter
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = match scoped_id {
            Some(idea_id) => stmt.query_map(params![owner_id, idea_id], parse_idea_row)?,
            None => stmt.query_map(params![owner_id], parse_idea_row)?,
        };
        let mut ideas = rows.collect::<Result<Vec<_>, _>>()?;
        for idea in &mut ideas {
            idea.tags = load_tags(&conn, &idea.id)?;
            idea.analysis = load_analysis(&conn, &idea.id)?;
        }
        Ok(ideas)
    }

    pub fn set_favorite(&self, owner_id: &str, idea_id: &str, is_favorite: bool) -> AppResult<()> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE ideas SET is_favorite = ?1, updated_at = ?2 WHERE id = ?3 AND owner_id = ?4",
            params![is_favorite, Utc::now().to_rfc3339(), idea_id, owner_id],
        )?;
        if changed == 0 {
            return Err(idea_not_found(idea_id));
        }
        Ok(())
    }

    /// Replaces the idea's tag set. Tags must belong to the same owner.
    pub fn set_idea_tags(&self, owner_id: &str, idea_id: &str, tag_ids: &[String]) -> AppResult<Vec<Tag>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        if !idea_owned_by(&tx, owner_id, idea_id)? {
            return Err(idea_not_found(idea_id));
        }
        for tag_id in tag_ids {
            let owned: i64 = tx.query_row(
                "SELECT COUNT(1) FROM tags WHERE id = ?1 AND owner_id = ?2",
                params![tag_id, owner_id],
                |row| row.get(0),
            )?;
            if owned == 0 {
                return Err(AppError::NotFound(format!("tag {}", tag_id)));
            }
        }
        tx.execute("DELETE FROM idea_tags WHERE idea_id = ?1", [idea_id])?;
        for tag_id in tag_ids {
            tx.execute(
                "INSERT OR IGNORE INTO idea_tags (idea_id, tag_id) VALUES (?1, ?2)",
                params![idea_id, tag_id],
            )?;
        }
        tx.execute(
            "UPDATE ideas SET updated_at = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), idea_id],
        )?;
        let tags = load_tags(&tx, idea_id)?;
        tx.commit()?;
        Ok(tags)
    }

    pub fn delete_idea(&self, owner_id: &str, idea_id: &str) -> AppResult<()> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "DELETE FROM ideas WHERE id = ?1 AND owner_id = ?2",
            params![idea_id, owner_id],
        )?;
        if changed == 0 {
            return Err(idea_not_found(idea_id));
        }
        Ok(())
    }

    /// Stores `analysis` as the idea's only analysis, replacing any prior one.
    pub fn replace_analysis(&self, owner_id: &str, analysis: &Analysis) -> AppResult<()> {
        if analysis.score > 100 {
            return Err(AppError::InvalidInput(format!("analysis score {} is out of range", analysis.score)));
        }
        let sections_json = serde_json::to_string(&analysis.sections)?;
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        if !idea_owned_by(&tx, owner_id, &analysis.idea_id)? {
            return Err(idea_not_found(&analysis.idea_id));
        }
        tx.execute(
            "INSERT INTO analyses (idea_id, score, status, sections_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(idea_id) DO UPDATE SET
               score = excluded.score,
               status = excluded.status,
               sections_json = excluded.sections_json,
               created_at = excluded.created_at",
            params![
                analysis.idea_id,
                analysis.score,
                analysis.status.as_str(),
                sections_json,
                analysis.created_at.to_rfc3339(),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn create_tag(&self, owner_id: &str, name: &str, color: &str) -> AppResult<Tag> {
        let name = name.trim();
        if name.is_empty() || name.chars().count() > MAX_TAG_NAME_LENGTH {
            return Err(AppError::InvalidInput(format!(
                "tag name must be 1 to {} characters",
                MAX_TAG_NAME_LENGTH
            )));
        }
        if !TAG_COLOR_RE.is_match(color) {
            return Err(AppError::InvalidInput(format!("tag color '{}' must look like #RRGGBB", color)));
        }
        let conn = self.lock()?;
        let duplicate: i64 = conn.query_row(
            "SELECT COUNT(1) FROM tags WHERE owner_id = ?1 AND name = ?2",
            params![owner_id, name],
            |row| row.get(0),
        )?;
        if duplicate > 0 {
            return Err(AppError::InvalidInput(format!("tag '{}' already exists", name)));
        }
        let id = Uuid::new_v4().to_string();
        let color = color.to_ascii_lowercase();
        conn.execute(
            "INSERT INTO tags (id, owner_id, name, color, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, owner_id, name, color, Utc::now().to_rfc3339()],
        )?;
        Ok(Tag {
            id,
            name: name.to_string(),
            color,
        })
    }

    pub fn list_tags(&self, owner_id: &str) -> AppResult<Vec<Tag>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT id, name, color FROM tags WHERE owner_id = ?1 ORDER BY name ASC")?;
        let rows = stmt.query_map([owner_id], parse_tag_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(AppError::from)
    }

    pub fn insert_attempt(
        &self,
        user_id: &str,
        idea_id: &str,
        feature: FeatureKey,
        amount: i64,
        transaction_id: Option<&str>,
    ) -> AppResult<AnalysisAttempt> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO analysis_attempts (
               id, user_id, idea_id, feature, amount, transaction_id, status, failure_reason, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL, ?8, ?8)",
            params![
                id,
                user_id,
                idea_id,
                feature.as_str(),
                amount,
                transaction_id,
                AttemptStatus::InFlight.as_str(),
                now.to_rfc3339(),
            ],
        )?;
        Ok(AnalysisAttempt {
            id,
            user_id: user_id.to_string(),
            idea_id: idea_id.to_string(),
            feature,
            amount,
            transaction_id: transaction_id.map(ToString::to_string),
            status: AttemptStatus::InFlight,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Moves an attempt from `from` to `to`. Returns `false` when the attempt is
    /// no longer in `from`, so concurrent settlers cannot both act on it.
    pub fn transition_attempt(
        &self,
        attempt_id: &str,
        from: AttemptStatus,
        to: AttemptStatus,
        failure_reason: Option<&str>,
    ) -> AppResult<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE analysis_attempts
             SET status = ?1, failure_reason = COALESCE(?2, failure_reason), updated_at = ?3
             WHERE id = ?4 AND status = ?5",
            params![to.as_str(), failure_reason, Utc::now().to_rfc3339(), attempt_id, from.as_str()],
        )?;
        if changed > 0 {
            return Ok(true);
        }
        let exists: i64 = conn.query_row(
            "SELECT COUNT(1) FROM analysis_attempts WHERE id = ?1",
            [attempt_id],
            |row| row.get(0),
        )?;
        if exists == 0 {
            return Err(AppError::NotFound(format!("analysis attempt {}", attempt_id)));
        }
        Ok(false)
    }

    pub fn list_attempts(&self, user_id: &str, status: Option<AttemptStatus>) -> AppResult<Vec<AnalysisAttempt>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, user_id, idea_id, feature, amount, transaction_id, status, failure_reason, created_at, updated_at
             FROM analysis_attempts
             WHERE user_id = ?1 AND (?2 IS NULL OR status = ?2)
             ORDER BY created_at ASC, rowid ASC",
        )?;
        let rows = stmt.query_map(params![user_id, status.map(AttemptStatus::as_str)], |row| {
            Ok(AnalysisAttempt {
                id: row.get(0)?,
                user_id: row.get(1)?,
                idea_id: row.get(2)?,
                feature: parse_feature(&row.get::<_, String>(3)?)?,
                amount: row.get(4)?,
                transaction_id: row.get(5)?,
                status: parse_attempt_status(&row.get::<_, String>(6)?)?,
                failure_reason: row.get(7)?,
                created_at: parse_time(&row.get::<_, String>(8)?)?,
                updated_at: parse_time(&row.get::<_, String>(9)?)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(AppError::from)
    }
}

fn idea_not_found(idea_id: &str) -> AppError {
    AppError::NotFound(format!("idea {}", idea_id))
}

fn idea_owned_by(conn: &Connection, owner_id: &str, idea_id: &str) -> AppResult<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(1) FROM ideas WHERE id = ?1 AND owner_id = ?2",
        params![idea_id, owner_id],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn load_idea(conn: &Connection, owner_id: &str, idea_id: &str) -> AppResult<Idea> {
    let sql = format!("SELECT {} FROM ideas WHERE id = ?1 AND owner_id = ?2", IDEA_COLUMNS);
    let mut idea = conn
        .query_row(&sql, params![idea_id, owner_id], parse_idea_row)
        .optional()?
        .ok_or_else(|| idea_not_found(idea_id))?;
    idea.tags = load_tags(conn, idea_id)?;
    idea.analysis = load_analysis(conn, idea_id)?;
    Ok(idea)
}

fn load_tags(conn: &Connection, idea_id: &str) -> AppResult<Vec<Tag>> {
    let mut stmt = conn.prepare(
        "SELECT t.id, t.name, t.color FROM tags t
         JOIN idea_tags it ON it.tag_id = t.id
         WHERE it.idea_id = ?1 ORDER BY t.name ASC",
    )?;
    let rows = stmt.query_map([idea_id], parse_tag_row)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(AppError::from)
}

fn load_analysis(conn: &Connection, idea_id: &str) -> AppResult<Option<Analysis>> {
    conn.query_row(
        "SELECT idea_id, score, status, sections_json, created_at FROM analyses WHERE idea_id = ?1",
        [idea_id],
        |row| {
            Ok(Analysis {
                idea_id: row.get(0)?,
                score: row.get(1)?,
                status: parse_analysis_status(&row.get::<_, String>(2)?)?,
                sections: parse_sections(&row.get::<_, String>(3)?)?,
                created_at: parse_time(&row.get::<_, String>(4)?)?,
            })
        },
    )
    .optional()
    .map_err(AppError::from)
}

fn parse_idea_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Idea> {
    Ok(Idea {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        audience: row.get(4)?,
        problem: row.get(5)?,
        has_competitors: row.get(6)?,
        monetization: row.get(7)?,
        budget: row.get(8)?,
        location: row.get(9)?,
        is_favorite: row.get(10)?,
        tags: Vec::new(),
        analysis: None,
        created_at: parse_time(&row.get::<_, String>(11)?)?,
        updated_at: parse_time(&row.get::<_, String>(12)?)?,
    })
}

fn parse_tag_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Tag> {
    Ok(Tag {
        id: row.get(0)?,
        name: row.get(1)?,
        color: row.get(2)?,
    })
}

fn conversion_error(message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn parse_plan(raw: &str) -> rusqlite::Result<PlanTier> {
    PlanTier::parse(raw).ok_or_else(|| conversion_error(format!("Unknown plan '{}'", raw)))
}

fn parse_feature(raw: &str) -> rusqlite::Result<FeatureKey> {
    FeatureKey::parse(raw).ok_or_else(|| conversion_error(format!("Unknown feature '{}'", raw)))
}

fn parse_analysis_status(raw: &str) -> rusqlite::Result<AnalysisStatus> {
    AnalysisStatus::parse(raw).ok_or_else(|| conversion_error(format!("Unknown analysis status '{}'", raw)))
}

fn parse_sections(raw: &str) -> rusqlite::Result<AnalysisSections> {
    serde_json::from_str(raw).map_err(|error| conversion_error(format!("Invalid analysis sections: {}", error)))
}

fn parse_attempt_status(raw: &str) -> rusqlite::Result<AttemptStatus> {
    AttemptStatus::parse(raw).ok_or_else(|| conversion_error(format!("Unknown attempt status '{}'", raw)))
}

fn parse_time(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|error| conversion_error(error.to_string()))
}

#[cfg(test)]
mod tests {
    use super::Database;
    use crate::errors::AppError;
    use crate::models::{
        Analysis, AnalysisSections, AnalysisStatus, AttemptStatus, ChargeRequest, FeatureKey, IdeaScope, NewIdea,
        PlanTier,
    };
    use chrono::Utc;

    fn new_idea(title: &str) -> NewIdea {
        NewIdea {
            title: title.to_string(),
            description: "A marketplace for second-hand climbing gear".to_string(),
            ..NewIdea::default()
        }
    }

    fn charge(user_id: &str, amount: i64) -> ChargeRequest {
        ChargeRequest {
            user_id: user_id.to_string(),
            amount,
            feature: FeatureKey::Reanalysis,
            item_id: Some("idea-1".to_string()),
            description: "Reanalysis".to_string(),
        }
    }

    #[test]
    fn database_persists_to_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db_path = dir.path().join("nested").join("state.sqlite");
        let user_id = {
            let db = Database::new(&db_path).expect("db");
            db.create_user("a@example.com", PlanTier::Pro, 5).expect("user").id
        };
        let reopened = Database::new(&db_path).expect("reopen");
        assert_eq!(reopened.get_user(&user_id).expect("user").credits, 5);
    }

    #[test]
    fn charge_decrements_and_logs_exactly_one_row() {
        let db = Database::open_in_memory().expect("db");
        let user = db.create_user("a@example.com", PlanTier::Free, 1).expect("user");

        let receipt = db.charge_and_log(&charge(&user.id, 1)).expect("charge");
        assert_eq!(receipt.new_balance, 0);
        assert!(receipt.transaction_id.is_some());

        let transactions = db.list_transactions(&user.id).expect("transactions");
        assert_eq!(transactions.len(), 1);
        assert_eq!(transactions[0].amount, 1);
        assert_eq!(transactions[0].feature, FeatureKey::Reanalysis);
        assert_eq!(transactions[0].item_id.as_deref(), Some("idea-1"));
    }

    #[test]
    fn failed_charge_leaves_balance_and_ledger_untouched() {
        let db = Database::open_in_memory().expect("db");
        let user = db.create_user("a@example.com", PlanTier::Free, 2).expect("user");

        let error = db.charge_and_log(&charge(&user.id, 3)).expect_err("insufficient");
        assert!(matches!(
            error,
            AppError::InsufficientCredits { required: 3, balance: 2, .. }
        ));
        assert_eq!(db.get_user(&user.id).expect("user").credits, 2);
        assert!(db.list_transactions(&user.id).expect("transactions").is_empty());
    }

    #[test]
    fn balance_never_goes_negative_across_charge_sequences() {
        let db = Database::open_in_memory().expect("db");
        let user = db.create_user("a@example.com", PlanTier::Starter, 7).expect("user");
        let mut successes = 0;
        for amount in [3, 3, 3, 1, 2, 1] {
            if db.charge_and_log(&charge(&user.id, amount)).is_ok() {
                successes += 1;
            }
            assert!(db.get_user(&user.id).expect("user").credits >= 0);
        }
        let spent: i64 = db.list_transactions(&user.id).expect("tx").iter().map(|tx| tx.amount).sum();
        assert_eq!(db.list_transactions(&user.id).expect("tx").len(), successes);
        assert_eq!(db.get_user(&user.id).expect("user").credits, 7 - spent);
    }

    #[test]
    fn charging_unknown_user_is_not_found() {
        let db = Database::open_in_memory().expect("db");
        let error = db.charge_and_log(&charge("ghost", 1)).expect_err("missing user");
        assert!(matches!(error, AppError::NotFound(_)));
    }

    #[test]
    fn refund_restores_balance_with_negative_row() {
        let db = Database::open_in_memory().expect("db");
        let user = db.create_user("a@example.com", PlanTier::Free, 1).expect("user");
        db.charge_and_log(&charge(&user.id, 1)).expect("charge");
        let receipt = db
            .refund_and_log(&user.id, 1, Some("idea-1"), "Analysis failed")
            .expect("refund");
        assert_eq!(receipt.new_balance, 1);
        let transactions = db.list_transactions(&user.id).expect("tx");
        assert_eq!(transactions.len(), 2);
        assert_eq!(transactions[1].amount, -1);
        assert_eq!(transactions[1].feature, FeatureKey::Refund);
    }

    #[test]
    fn ideas_are_scoped_to_their_owner() {
        let db = Database::open_in_memory().expect("db");
        let alice = db.create_user("alice@example.com", PlanTier::Free, 0).expect("alice");
        let bob = db.create_user("bob@example.com", PlanTier::Free, 0).expect("bob");
        let idea = db.create_idea(&alice.id, &new_idea("Gear swap")).expect("idea");

        assert!(matches!(db.get_idea(&bob.id, &idea.id), Err(AppError::NotFound(_))));
        assert!(matches!(db.set_favorite(&bob.id, &idea.id, true), Err(AppError::NotFound(_))));
        assert!(matches!(db.delete_idea(&bob.id, &idea.id), Err(AppError::NotFound(_))));
        assert!(db.list_ideas(&bob.id, &IdeaScope::All).expect("list").is_empty());
    }

    #[test]
    fn list_scopes_filter_favorites_and_single() {
        let db = Database::open_in_memory().expect("db");
        let user = db.create_user("a@example.com", PlanTier::Free, 0).expect("user");
        let first = db.create_idea(&user.id, &new_idea("First")).expect("first");
        let second = db.create_idea(&user.id, &new_idea("Second")).expect("second");
        db.set_favorite(&user.id, &second.id, true).expect("favorite");

        assert_eq!(db.list_ideas(&user.id, &IdeaScope::All).expect("all").len(), 2);
        let favorites = db.list_ideas(&user.id, &IdeaScope::Favorites).expect("favorites");
        assert_eq!(favorites.len(), 1);
        assert_eq!(favorites[0].id, second.id);
        let single = db
            .list_ideas(&user.id, &IdeaScope::Single(first.id.clone()))
            .expect("single");
        assert_eq!(single.len(), 1);
        assert_eq!(single[0].id, first.id);
    }

    #[test]
    fn tag_sets_replace_and_reject_foreign_tags() {
        let db = Database::open_in_memory().expect("db");
        let alice = db.create_user("alice@example.com", PlanTier::Free, 0).expect("alice");
        let bob = db.create_user("bob@example.com", PlanTier::Free, 0).expect("bob");
        let idea = db.create_idea(&alice.id, &new_idea("Gear swap")).expect("idea");
        let b2b = db.create_tag(&alice.id, "b2b", "#00AAFF").expect("tag");
        let saas = db.create_tag(&alice.id, "saas", "#112233").expect("tag");
        let foreign = db.create_tag(&bob.id, "mine", "#445566").expect("tag");

        let tags = db
            .set_idea_tags(&alice.id, &idea.id, &[saas.id.clone(), b2b.id.clone()])
            .expect("set tags");
        assert_eq!(tags.iter().map(|tag| tag.name.as_str()).collect::<Vec<_>>(), vec!["b2b", "saas"]);
        assert_eq!(tags[0].color, "#00aaff");

        let tags = db.set_idea_tags(&alice.id, &idea.id, &[saas.id.clone()]).expect("replace");
        assert_eq!(tags.len(), 1);

        let error = db
            .set_idea_tags(&alice.id, &idea.id, &[foreign.id])
            .expect_err("foreign tag");
        assert!(matches!(error, AppError::NotFound(_)));
        assert_eq!(db.get_idea(&alice.id, &idea.id).expect("idea").tags.len(), 1);
    }

    #[test]
    fn tag_validation_rejects_bad_colors_and_duplicates() {
        let db = Database::open_in_memory().expect("db");
        let user = db.create_user("a@example.com", PlanTier::Free, 0).expect("user");
        assert!(db.create_tag(&user.id, "fintech", "blue").is_err());
        assert!(db.create_tag(&user.id, "  ", "#000000").is_err());
        db.create_tag(&user.id, "fintech", "#000000").expect("tag");
        assert!(db.create_tag(&user.id, "fintech", "#ffffff").is_err());
    }

    #[test]
    fn reanalysis_replaces_prior_analysis() {
        let db = Database::open_in_memory().expect("db");
        let user = db.create_user("a@example.com", PlanTier::Free, 0).expect("user");
        let idea = db.create_idea(&user.id, &new_idea("Gear swap")).expect("idea");
        for score in [35_u8, 82] {
            db.replace_analysis(
                &user.id,
                &Analysis {
                    idea_id: idea.id.clone(),
                    score,
                    status: AnalysisStatus::from_score(score),
                    sections: AnalysisSections {
                        strengths: vec!["Niche community".to_string()],
                        ..AnalysisSections::default()
                    },
                    created_at: Utc::now(),
                },
            )
            .expect("save analysis");
        }
        let analysis = db.get_idea(&user.id, &idea.id).expect("idea").analysis.expect("analysis");
        assert_eq!(analysis.score, 82);
        assert_eq!(analysis.status, AnalysisStatus::Viable);
        assert_eq!(analysis.sections.strengths, vec!["Niche community".to_string()]);
    }

    #[test]
    fn deleting_idea_cascades_tags_and_analysis() {
        let db = Database::open_in_memory().expect("db");
        let user = db.create_user("a@example.com", PlanTier::Free, 0).expect("user");
        let idea = db.create_idea(&user.id, &new_idea("Gear swap")).expect("idea");
        let tag = db.create_tag(&user.id, "b2c", "#abcdef").expect("tag");
        db.set_idea_tags(&user.id, &idea.id, &[tag.id]).expect("tags");
        db.delete_idea(&user.id, &idea.id).expect("delete");
        assert!(matches!(db.get_idea(&user.id, &idea.id), Err(AppError::NotFound(_))));
        assert_eq!(db.list_tags(&user.id).expect("tags").len(), 1);
    }

    #[test]
    fn attempts_are_journaled_and_filtered_by_status() {
        let db = Database::open_in_memory().expect("db");
        let user = db.create_user("a@example.com", PlanTier::Free, 3).expect("user");
        let first = db
            .insert_attempt(&user.id, "idea-1", FeatureKey::Reanalysis, 1, Some("tx-1"))
            .expect("attempt");
        let second = db
            .insert_attempt(&user.id, "idea-2", FeatureKey::Reanalysis, 1, Some("tx-2"))
            .expect("attempt");
        assert!(db
            .transition_attempt(&first.id, AttemptStatus::InFlight, AttemptStatus::Completed, None)
            .expect("complete"));
        assert!(db
            .transition_attempt(&second.id, AttemptStatus::InFlight, AttemptStatus::Failed, Some("timeout"))
            .expect("fail"));

        let failed = db.list_attempts(&user.id, Some(AttemptStatus::Failed)).expect("failed");
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].idea_id, "idea-2");
        assert_eq!(failed[0].failure_reason.as_deref(), Some("timeout"));
        assert_eq!(db.list_attempts(&user.id, None).expect("all").len(), 2);
    }

    #[test]
    fn attempt_transition_only_succeeds_from_expected_status() {
        let db = Database::open_in_memory().expect("db");
        let user = db.create_user("a@example.com", PlanTier::Free, 3).expect("user");
        let attempt = db
            .insert_attempt(&user.id, "idea-1", FeatureKey::Reanalysis, 1, Some("tx-1"))
            .expect("attempt");
        db.transition_attempt(&attempt.id, AttemptStatus::InFlight, AttemptStatus::Failed, Some("timeout"))
            .expect("fail");

        assert!(db
            .transition_attempt(&attempt.id, AttemptStatus::Failed, AttemptStatus::Settling, None)
            .expect("first settler"));
        assert!(!db
            .transition_attempt(&attempt.id, AttemptStatus::Failed, AttemptStatus::Settling, None)
            .expect("second settler"));
        assert!(matches!(
            db.transition_attempt("missing", AttemptStatus::Failed, AttemptStatus::Settling, None),
            Err(AppError::NotFound(_))
        ));
    }

    #[test]
    fn corrupt_analysis_sections_are_an_error() {
        let db = Database::open_in_memory().expect("db");
        let user = db.create_user("a@example.com", PlanTier::Free, 0).expect("user");
        let idea = db.create_idea(&user.id, &new_idea("Kayak rentals")).expect("idea");
        db.replace_analysis(
            &user.id,
            &Analysis {
                idea_id: idea.id.clone(),
                score: 55,
                status: AnalysisStatus::Moderate,
                sections: AnalysisSections::default(),
                created_at: Utc::now(),
            },
        )
        .expect("analysis");
        db.lock()
            .expect("conn")
            .execute("UPDATE analyses SET sections_json = '{not json' WHERE idea_id = ?1", [&idea.id])
            .expect("corrupt");

        assert!(db.get_idea(&user.id, &idea.id).is_err());
    }

    #[test]
    fn update_idea_rewrites_fields_for_owner_only() {
        let db = Database::open_in_memory().expect("db");
        let owner = db.create_user("a@example.com", PlanTier::Free, 0).expect("user");
        let other = db.create_user("b@example.com", PlanTier::Free, 0).expect("user");
        let idea = db.create_idea(&owner.id, &new_idea("Food truck")).expect("idea");

        let mut edit = new_idea("Food truck fleet");
        edit.budget = "50k".to_string();
        let updated = db.update_idea(&owner.id, &idea.id, &edit).expect("update");
        assert_eq!(updated.title, "Food truck fleet");
        assert_eq!(updated.budget, "50k");

        assert!(matches!(
            db.update_idea(&other.id, &idea.id, &edit),
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(
            db.update_idea(&owner.id, &idea.id, &new_idea("   ")),
            Err(AppError::InvalidInput(_))
        ));
    }
}
