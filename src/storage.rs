use crate::config::{DatabaseConfig, StorageBackend};
use crate::db::SqliteStorage;
use crate::error::{PredictError, Result};
use crate::types::{NewQuestion, Outcome, Question, QuestionStatus, ServedQuestion, User};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Storage trait for persisting users, questions and which user has seen which question
#[async_trait]
pub trait Storage: Send + Sync {
    // User operations
    async fn create_user(
        &self,
        username: &str,
        interests: &[String],
        created_at: DateTime<Utc>,
    ) -> Result<User>;
    async fn get_user_by_username(&self, username: &str) -> Result<Option<User>>;
    async fn update_user_interests(&self, user_id: i64, interests: &[String]) -> Result<User>;

    // Question operations
    async fn create_question(&self, question: &NewQuestion) -> Result<Question>;
    async fn get_question(&self, question_id: i64) -> Result<Option<Question>>;
    /// Fails with `QuestionNotFound` or `AlreadyResolved`; never overwrites a resolution.
    async fn resolve_question(
        &self,
        question_id: i64,
        outcome: Outcome,
        note: Option<&str>,
        resolved_at: DateTime<Utc>,
    ) -> Result<Question>;

    // View operations
    /// Pending questions in any of `interests` that `user_id` has not been served.
    async fn get_unseen_questions(&self, user_id: i64, interests: &[String])
        -> Result<Vec<Question>>;
    /// Returns false when the view already existed or the question is no longer pending.
    async fn mark_question_viewed(
        &self,
        user_id: i64,
        question_id: i64,
        viewed_at: DateTime<Utc>,
    ) -> Result<bool>;
    /// Mark up to `limit` of `question_ids`, in order, as viewed in one atomic step.
    /// Questions already viewed, resolved or missing are skipped. Returns the ids marked;
    /// on error nothing is marked.
    async fn mark_questions_viewed(
        &self,
        user_id: i64,
        question_ids: &[i64],
        limit: usize,
        viewed_at: DateTime<Utc>,
    ) -> Result<Vec<i64>>;
    /// Newest view first.
    async fn get_question_history(
        &self,
        user_id: i64,
        interest: Option<&str>,
    ) -> Result<Vec<ServedQuestion>>;
    /// Served but unresolved, earliest resolution date first.
    async fn get_pending_questions(&self, user_id: i64) -> Result<Vec<ServedQuestion>>;
}

/// Build the storage backend selected in configuration
pub fn open_storage(config: &DatabaseConfig) -> Result<Arc<dyn Storage>> {
    match config.backend {
        StorageBackend::Memory => {
            info!("Using in-memory storage");
            Ok(Arc::new(InMemoryStorage::new()))
        }
        StorageBackend::Sqlite => {
            info!(path = %config.path.display(), "Using SQLite storage");
            Ok(Arc::new(SqliteStorage::open(&config.path)?))
        }
    }
}

#[derive(Default)]
struct MemoryState {
    users: HashMap<i64, User>,
    user_ids: HashMap<String, i64>,
    questions: BTreeMap<i64, Question>,
    // user id -> question id -> viewed at
    views: HashMap<i64, BTreeMap<i64, DateTime<Utc>>>,
    next_user_id: i64,
    next_question_id: i64,
}

impl MemoryState {
    fn served(&self, user_id: i64) -> Vec<ServedQuestion> {
        let Some(views) = self.views.get(&user_id) else {
            return Vec::new();
        };
        views
            .iter()
            .filter_map(|(question_id, viewed_at)| {
                self.questions.get(question_id).map(|q| ServedQuestion {
                    question: q.clone(),
                    viewed_at: *viewed_at,
                })
            })
            .collect()
    }
}

/// In-memory storage implementation for development/testing
pub struct InMemoryStorage {
    state: RwLock<MemoryState>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
        }
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn create_user(
        &self,
        username: &str,
        interests: &[String],
        created_at: DateTime<Utc>,
    ) -> Result<User> {
        let mut state = self.state.write().await;
        if state.user_ids.contains_key(username) {
            return Err(PredictError::UsernameTaken(username.to_string()));
        }

        state.next_user_id += 1;
        let user = User {
            id: state.next_user_id,
            username: username.to_string(),
            interests: interests.to_vec(),
            created_at,
        };
        state.user_ids.insert(user.username.clone(), user.id);
        state.users.insert(user.id, user.clone());

        debug!("Created user: {} with id {}", user.username, user.id);
        Ok(user)
    }

    async fn get_user_by_username(&self, username: &str) -> Result<Option<User>> {
        let state = self.state.read().await;
        Ok(state
            .user_ids
            .get(username)
            .and_then(|id| state.users.get(id))
            .cloned())
    }

    async fn update_user_interests(&self, user_id: i64, interests: &[String]) -> Result<User> {
        let mut state = self.state.write().await;
        let user = state
            .users
            .get_mut(&user_id)
            .ok_or_else(|| PredictError::UserNotFound(user_id.to_string()))?;
        user.interests = interests.to_vec();

        debug!("Updated interests for user {}", user_id);
        Ok(user.clone())
    }

    async fn create_question(&self, new: &NewQuestion) -> Result<Question> {
        let mut state = self.state.write().await;
        state.next_question_id += 1;
        let question = Question {
            id: state.next_question_id,
            question: new.question.clone(),
            interest: new.interest.clone(),
            source_articles: new.source_articles.clone(),
            created_at: new.created_at,
            resolution_date: new.resolution_date,
            status: QuestionStatus::Pending,
            result: None,
            resolution_note: None,
            resolved_at: None,
        };
        state.questions.insert(question.id, question.clone());

        debug!("Created question {} for interest {}", question.id, question.interest);
        Ok(question)
    }

    async fn get_question(&self, question_id: i64) -> Result<Option<Question>> {
        Ok(self.state.read().await.questions.get(&question_id).cloned())
    }

    async fn resolve_question(
        &self,
        question_id: i64,
        outcome: Outcome,
        note: Option<&str>,
        resolved_at: DateTime<Utc>,
    ) -> Result<Question> {
        let mut state = self.state.write().await;
        let question = state
            .questions
            .get_mut(&question_id)
            .ok_or(PredictError::QuestionNotFound(question_id))?;
        if question.is_resolved() {
            return Err(PredictError::AlreadyResolved(question_id));
        }

        question.status = QuestionStatus::Resolved;
        question.result = Some(outcome);
        question.resolution_note = note.map(str::to_string);
        question.resolved_at = Some(resolved_at);

        debug!("Resolved question {} as {}", question_id, outcome);
        Ok(question.clone())
    }

    async fn get_unseen_questions(
        &self,
        user_id: i64,
        interests: &[String],
    ) -> Result<Vec<Question>> {
        let state = self.state.read().await;
        let seen = state.views.get(&user_id);
        Ok(state
            .questions
            .values()
            .filter(|q| !q.is_resolved())
            .filter(|q| interests.contains(&q.interest))
            .filter(|q| seen.map_or(true, |views| !views.contains_key(&q.id)))
            .cloned()
            .collect())
    }

    async fn mark_question_viewed(
        &self,
        user_id: i64,
        question_id: i64,
        viewed_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.write().await;
        match state.questions.get(&question_id) {
            None => return Err(PredictError::QuestionNotFound(question_id)),
            Some(q) if q.is_resolved() => return Ok(false),
            Some(_) => {}
        }
        let views = state.views.entry(user_id).or_default();
        if views.contains_key(&question_id) {
            return Ok(false);
        }
        views.insert(question_id, viewed_at);
        Ok(true)
    }

    async fn mark_questions_viewed(
        &self,
        user_id: i64,
        question_ids: &[i64],
        limit: usize,
        viewed_at: DateTime<Utc>,
    ) -> Result<Vec<i64>> {
        let mut state = self.state.write().await;
        let MemoryState {
            questions, views, ..
        } = &mut *state;
        let views = views.entry(user_id).or_default();

        let mut marked = Vec::with_capacity(limit.min(question_ids.len()));
        for &question_id in question_ids {
            if marked.len() == limit {
                break;
            }
            let pending = questions.get(&question_id).map_or(false, |q| !q.is_resolved());
            if pending && !views.contains_key(&question_id) {
                views.insert(question_id, viewed_at);
                marked.push(question_id);
            }
        }
        Ok(marked)
    }

    async fn get_question_history(
        &self,
        user_id: i64,
        interest: Option<&str>,
    ) -> Result<Vec<ServedQuestion>> {
        let state = self.state.read().await;
        let mut history: Vec<ServedQuestion> = state
            .served(user_id)
            .into_iter()
            .filter(|s| interest.map_or(true, |i| s.question.interest == i))
            .collect();
        history.sort_by(|a, b| {
            b.viewed_at
                .cmp(&a.viewed_at)
                .then_with(|| b.question.id.cmp(&a.question.id))
        });
        Ok(history)
    }

    async fn get_pending_questions(&self, user_id: i64) -> Result<Vec<ServedQuestion>> {
        let state = self.state.read().await;
        let mut pending: Vec<ServedQuestion> = state
            .served(user_id)
            .into_iter()
            .filter(|s| !s.question.is_resolved())
            .collect();
        pending.sort_by(|a, b| {
            a.question
                .resolution_date
                .cmp(&b.question.resolution_date)
                .then_with(|| a.question.id.cmp(&b.question.id))
        });
        Ok(pending)
    }
}
