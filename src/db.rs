use crate::error::{PredictError, Result};
use crate::storage::Storage;
use crate::types::{NewQuestion, Outcome, Question, QuestionStatus, ServedQuestion, User};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

const SCHEMA: &str = r#"
    PRAGMA journal_mode=WAL;
    PRAGMA foreign_keys=ON;
    CREATE TABLE IF NOT EXISTS users (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        username    TEXT NOT NULL UNIQUE,
        interests   TEXT NOT NULL DEFAULT '[]',
        created_at  TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS questions (
        id               INTEGER PRIMARY KEY AUTOINCREMENT,
        question_text    TEXT NOT NULL,
        interest         TEXT NOT NULL,
        source_articles  TEXT NOT NULL DEFAULT '[]',
        created_at       TEXT NOT NULL,
        resolution_date  TEXT NOT NULL,
        status           TEXT NOT NULL DEFAULT 'pending',
        outcome          TEXT,
        resolution_note  TEXT,
        resolved_at      TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_questions_interest_status
        ON questions (interest, status);
    CREATE TABLE IF NOT EXISTS user_questions (
        user_id      INTEGER NOT NULL REFERENCES users(id),
        question_id  INTEGER NOT NULL REFERENCES questions(id),
        viewed_at    TEXT NOT NULL,
        PRIMARY KEY (user_id, question_id)
    );
"#;

const QUESTION_COLUMNS: &str = "q.id, q.question_text, q.interest, q.source_articles, \
     q.created_at, q.resolution_date, q.status, q.outcome, q.resolution_note, q.resolved_at";

// Only pending questions can be served; an existing view is left untouched.
const MARK_VIEWED_SQL: &str = "INSERT OR IGNORE INTO user_questions (user_id, question_id, viewed_at)
     SELECT ?1, id, ?3 FROM questions WHERE id = ?2 AND status = 'pending'";

// Fixed-width UTC text so lexical order in SQL matches time order.
fn to_db_time(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn from_db_time(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| PredictError::internal(format!("invalid timestamp '{raw}' in database: {e}")))
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(err, rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation)
}

struct UserRow {
    id: i64,
    username: String,
    interests: String,
    created_at: String,
}

impl UserRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            username: row.get(1)?,
            interests: row.get(2)?,
            created_at: row.get(3)?,
        })
    }

    fn into_user(self) -> Result<User> {
        Ok(User {
            id: self.id,
            username: self.username,
            interests: serde_json::from_str(&self.interests)?,
            created_at: from_db_time(&self.created_at)?,
        })
    }
}

struct QuestionRow {
    id: i64,
    question: String,
    interest: String,
    source_articles: String,
    created_at: String,
    resolution_date: String,
    status: String,
    outcome: Option<String>,
    resolution_note: Option<String>,
    resolved_at: Option<String>,
}

impl QuestionRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            question: row.get(1)?,
            interest: row.get(2)?,
            source_articles: row.get(3)?,
            created_at: row.get(4)?,
            resolution_date: row.get(5)?,
            status: row.get(6)?,
            outcome: row.get(7)?,
            resolution_note: row.get(8)?,
            resolved_at: row.get(9)?,
        })
    }

    fn into_question(self) -> Result<Question> {
        let result = self
            .outcome
            .as_deref()
            .map(|o| {
                o.parse::<Outcome>()
                    .map_err(|_| PredictError::internal(format!("invalid outcome '{o}' in database")))
            })
            .transpose()?;
        let resolved_at = self.resolved_at.as_deref().map(from_db_time).transpose()?;

        Ok(Question {
            id: self.id,
            question: self.question,
            interest: self.interest,
            source_articles: serde_json::from_str(&self.source_articles)?,
            created_at: from_db_time(&self.created_at)?,
            resolution_date: from_db_time(&self.resolution_date)?,
            status: self.status.parse::<QuestionStatus>()?,
            result,
            resolution_note: self.resolution_note,
            resolved_at,
        })
    }
}

fn served_from_row(row: &Row<'_>) -> rusqlite::Result<(QuestionRow, String)> {
    Ok((QuestionRow::from_row(row)?, row.get(10)?))
}

fn into_served(rows: Vec<(QuestionRow, String)>) -> Result<Vec<ServedQuestion>> {
    rows.into_iter()
        .map(|(question, viewed_at)| {
            Ok(ServedQuestion {
                question: question.into_question()?,
                viewed_at: from_db_time(&viewed_at)?,
            })
        })
        .collect()
}

fn select_question(conn: &Connection, question_id: i64) -> Result<Option<Question>> {
    let sql = format!("SELECT {QUESTION_COLUMNS} FROM questions q WHERE q.id = ?1");
    conn.query_row(&sql, params![question_id], QuestionRow::from_row)
        .optional()?
        .map(QuestionRow::into_question)
        .transpose()
}

fn select_user(conn: &Connection, user_id: i64) -> Result<Option<User>> {
    conn.query_row(
        "SELECT id, username, interests, created_at FROM users WHERE id = ?1",
        params![user_id],
        UserRow::from_row,
    )
    .optional()?
    .map(UserRow::into_user)
    .transpose()
}

/// SQLite-backed storage. All statements run on the blocking thread pool.
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    /// Open (creating if needed) the database file and apply the schema
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let storage = Self::from_connection(Connection::open(path)?)?;
        info!(path = %path.display(), "SQLite schema ready");
        Ok(storage)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| PredictError::internal("SQLite connection lock poisoned"))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| PredictError::internal(format!("database task failed: {e}")))?
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn create_user(
        &self,
        username: &str,
        interests: &[String],
        created_at: DateTime<Utc>,
    ) -> Result<User> {
        let username = username.to_string();
        let interests_json = serde_json::to_string(interests)?;
        let created = to_db_time(created_at);

        self.with_conn(move |conn| {
            let inserted = conn.execute(
                "INSERT INTO users (username, interests, created_at) VALUES (?1, ?2, ?3)",
                params![username, interests_json, created],
            );
            match inserted {
                Ok(_) => {}
                Err(e) if is_unique_violation(&e) => {
                    return Err(PredictError::UsernameTaken(username));
                }
                Err(e) => return Err(e.into()),
            }

            let id = conn.last_insert_rowid();
            debug!("Created user: {} with id {}", username, id);
            select_user(conn, id)?
                .ok_or_else(|| PredictError::internal(format!("user {id} vanished after insert")))
        })
        .await
    }

    async fn get_user_by_username(&self, username: &str) -> Result<Option<User>> {
        let username = username.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT id, username, interests, created_at FROM users WHERE username = ?1",
                params![username],
                UserRow::from_row,
            )
            .optional()?
            .map(UserRow::into_user)
            .transpose()
        })
        .await
    }

    async fn update_user_interests(&self, user_id: i64, interests: &[String]) -> Result<User> {
        let interests_json = serde_json::to_string(interests)?;
        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE users SET interests = ?2 WHERE id = ?1",
                params![user_id, interests_json],
            )?;
            if updated == 0 {
                return Err(PredictError::UserNotFound(user_id.to_string()));
            }
            debug!("Updated interests for user {}", user_id);
            select_user(conn, user_id)?.ok_or_else(|| PredictError::UserNotFound(user_id.to_string()))
        })
        .await
    }

    async fn create_question(&self, new: &NewQuestion) -> Result<Question> {
        let question = new.question.clone();
        let interest = new.interest.clone();
        let articles = serde_json::to_string(&new.source_articles)?;
        let created = to_db_time(new.created_at);
        let resolution = to_db_time(new.resolution_date);

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO questions (question_text, interest, source_articles, created_at, resolution_date, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'pending')",
                params![question, interest, articles, created, resolution],
            )?;
            let id = conn.last_insert_rowid();
            debug!("Created question {} for interest {}", id, interest);
            select_question(conn, id)?
                .ok_or_else(|| PredictError::internal(format!("question {id} vanished after insert")))
        })
        .await
    }

    async fn get_question(&self, question_id: i64) -> Result<Option<Question>> {
        self.with_conn(move |conn| select_question(conn, question_id)).await
    }

    async fn resolve_question(
        &self,
        question_id: i64,
        outcome: Outcome,
        note: Option<&str>,
        resolved_at: DateTime<Utc>,
    ) -> Result<Question> {
        let note = note.map(str::to_string);
        let resolved = to_db_time(resolved_at);

        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let updated = tx.execute(
                "UPDATE questions
                 SET status = 'resolved', outcome = ?2, resolution_note = ?3, resolved_at = ?4
                 WHERE id = ?1 AND status = 'pending'",
                params![question_id, outcome.as_str(), note, resolved],
            )?;

            if updated == 0 {
                return match select_question(&tx, question_id)? {
                    Some(_) => Err(PredictError::AlreadyResolved(question_id)),
                    None => Err(PredictError::QuestionNotFound(question_id)),
                };
            }

            let question = select_question(&tx, question_id)?
                .ok_or(PredictError::QuestionNotFound(question_id))?;
            tx.commit()?;
            debug!("Resolved question {} as {}", question_id, outcome);
            Ok(question)
        })
        .await
    }

    async fn get_unseen_questions(
        &self,
        user_id: i64,
        interests: &[String],
    ) -> Result<Vec<Question>> {
        let interests_json = serde_json::to_string(interests)?;
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {QUESTION_COLUMNS} FROM questions q
                 WHERE q.status = 'pending'
                   AND q.interest IN (SELECT value FROM json_each(?2))
                   AND NOT EXISTS (
                       SELECT 1 FROM user_questions uq
                       WHERE uq.user_id = ?1 AND uq.question_id = q.id
                   )
                 ORDER BY q.id"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![user_id, interests_json], QuestionRow::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter().map(QuestionRow::into_question).collect()
        })
        .await
    }

    async fn mark_question_viewed(
        &self,
        user_id: i64,
        question_id: i64,
        viewed_at: DateTime<Utc>,
    ) -> Result<bool> {
        let viewed = to_db_time(viewed_at);
        self.with_conn(move |conn| {
            let exists: bool = conn.query_row(
                "SELECT EXISTS (SELECT 1 FROM questions WHERE id = ?1)",
                params![question_id],
                |row| row.get(0),
            )?;
            if !exists {
                return Err(PredictError::QuestionNotFound(question_id));
            }

            let inserted = conn.execute(MARK_VIEWED_SQL, params![user_id, question_id, viewed])?;
            Ok(inserted == 1)
        })
        .await
    }

    async fn mark_questions_viewed(
        &self,
        user_id: i64,
        question_ids: &[i64],
        limit: usize,
        viewed_at: DateTime<Utc>,
    ) -> Result<Vec<i64>> {
        let question_ids = question_ids.to_vec();
        let viewed = to_db_time(viewed_at);
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let mut marked = Vec::with_capacity(limit.min(question_ids.len()));
            {
                let mut stmt = tx.prepare(MARK_VIEWED_SQL)?;
                for question_id in question_ids {
                    if marked.len() == limit {
                        break;
                    }
                    if stmt.execute(params![user_id, question_id, viewed])? == 1 {
                        marked.push(question_id);
                    }
                }
            }
            tx.commit()?;
            debug!("Marked {} questions viewed for user {}", marked.len(), user_id);
            Ok(marked)
        })
        .await
    }

    async fn get_question_history(
        &self,
        user_id: i64,
        interest: Option<&str>,
    ) -> Result<Vec<ServedQuestion>> {
        let interest = interest.map(str::to_string);
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {QUESTION_COLUMNS}, uq.viewed_at
                 FROM user_questions uq
                 JOIN questions q ON q.id = uq.question_id
                 WHERE uq.user_id = ?1 AND (?2 IS NULL OR q.interest = ?2)
                 ORDER BY uq.viewed_at DESC, q.id DESC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![user_id, interest], served_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            into_served(rows)
        })
        .await
    }

    async fn get_pending_questions(&self, user_id: i64) -> Result<Vec<ServedQuestion>> {
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {QUESTION_COLUMNS}, uq.viewed_at
                 FROM user_questions uq
                 JOIN questions q ON q.id = uq.question_id
                 WHERE uq.user_id = ?1 AND q.status = 'pending'
                 ORDER BY q.resolution_date ASC, q.id ASC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![user_id], served_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            into_served(rows)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn test_db_time_round_trips_and_sorts() {
        let early = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        let late = early + Duration::microseconds(1500);

        assert_eq!(from_db_time(&to_db_time(early)).unwrap(), early);
        assert_eq!(from_db_time(&to_db_time(late)).unwrap(), late);
        assert!(to_db_time(early) < to_db_time(late));
    }

    async fn pending_question(storage: &SqliteStorage, text: &str) -> Question {
        let now = Utc::now();
        storage
            .create_question(&NewQuestion {
                question: text.to_string(),
                interest: "cricket".to_string(),
                source_articles: vec![],
                created_at: now,
                resolution_date: now + Duration::days(7),
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_resolved_question_is_not_marked_viewed() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let user = storage.create_user("john", &[], Utc::now()).await.unwrap();
        let resolved = pending_question(&storage, "Will India win the series?").await;
        let open = pending_question(&storage, "Will Australia win the toss?").await;
        storage
            .resolve_question(resolved.id, Outcome::No, None, Utc::now())
            .await
            .unwrap();

        assert!(!storage.mark_question_viewed(user.id, resolved.id, Utc::now()).await.unwrap());
        let marked = storage
            .mark_questions_viewed(user.id, &[resolved.id, open.id], 10, Utc::now())
            .await
            .unwrap();
        assert_eq!(marked, vec![open.id]);

        let history = storage.get_question_history(user.id, None).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].question.id, open.id);
    }

    #[tokio::test]
    async fn test_batch_mark_rolls_back_on_error() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let user = storage.create_user("john", &[], Utc::now()).await.unwrap();
        let first = pending_question(&storage, "Will India win the series?").await;
        let second = pending_question(&storage, "Will Australia win the toss?").await;

        let trigger = format!(
            "CREATE TRIGGER fail_second_view BEFORE INSERT ON user_questions
             WHEN NEW.question_id = {} BEGIN SELECT RAISE(ABORT, 'view rejected'); END;",
            second.id
        );
        storage.conn.lock().unwrap().execute_batch(&trigger).unwrap();

        let result = storage
            .mark_questions_viewed(user.id, &[first.id, second.id], 10, Utc::now())
            .await;
        assert!(result.is_err());
        assert!(storage.get_pending_questions(user.id).await.unwrap().is_empty());

        let marked = storage
            .mark_questions_viewed(user.id, &[first.id, second.id], 1, Utc::now())
            .await
            .unwrap();
        assert_eq!(marked, vec![first.id]);
    }

    #[tokio::test]
    async fn test_resolve_is_checked_in_one_transaction() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let now = Utc::now();
        let q = storage
            .create_question(&NewQuestion {
                question: "Will India win the series?".to_string(),
                interest: "cricket".to_string(),
                source_articles: vec![],
                created_at: now,
                resolution_date: now,
            })
            .await
            .unwrap();

        storage.resolve_question(q.id, Outcome::Yes, Some("3-1"), now).await.unwrap();
        let err = storage.resolve_question(q.id, Outcome::No, None, now).await.unwrap_err();
        assert!(matches!(err, PredictError::AlreadyResolved(_)));

        let err = storage.resolve_question(999, Outcome::No, None, now).await.unwrap_err();
        assert!(matches!(err, PredictError::QuestionNotFound(999)));
    }
}
