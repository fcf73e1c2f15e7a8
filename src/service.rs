use crate::config::QuestionLimits;
use crate::deadline::resolution_date_for;
use crate::error::{PredictError, Result};
use crate::metrics;
use crate::storage::Storage;
use crate::types::{
    NewQuestion, Outcome, Question, Registration, RegistrationStatus, ServedQuestion, User,
};
use crate::validation::{
    normalize_interest, normalize_interests, normalize_username, validate_question_text,
};
use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// A question as submitted over HTTP or in a seed file
#[derive(Debug, Clone, Deserialize)]
pub struct QuestionDraft {
    pub question: String,
    pub interest: String,
    #[serde(default)]
    pub source_articles: Vec<String>,
    #[serde(default)]
    pub resolution_date: Option<DateTime<Utc>>,
}

/// User registration, question serving and resolution on top of a `Storage`
pub struct PredictionService {
    storage: Arc<dyn Storage>,
    limits: QuestionLimits,
}

impl PredictionService {
    pub fn new(storage: Arc<dyn Storage>, limits: QuestionLimits) -> Self {
        Self { storage, limits }
    }

    pub fn limits(&self) -> QuestionLimits {
        self.limits
    }

    async fn require_user(&self, username: &str) -> Result<User> {
        let username = normalize_username(username)?;
        self.storage
            .get_user_by_username(&username)
            .await?
            .ok_or(PredictError::UserNotFound(username))
    }

    /// Create the user, or replace an existing user's interests when `interests` is non-empty
    #[instrument(skip(self, interests))]
    pub async fn register_user(&self, username: &str, interests: &[String]) -> Result<Registration> {
        let username = normalize_username(username)?;
        let interests = normalize_interests(interests);

        if let Some(existing) = self.storage.get_user_by_username(&username).await? {
            return self.refresh_interests(existing, &interests).await;
        }

        match self.storage.create_user(&username, &interests, Utc::now()).await {
            Ok(user) => {
                info!(user_id = user.id, "User created");
                metrics::record_user_registered(RegistrationStatus::Created);
                Ok(Registration {
                    user,
                    status: RegistrationStatus::Created,
                })
            }
            // Lost a race with a concurrent registration of the same name
            Err(PredictError::UsernameTaken(_)) => {
                let existing = self.require_user(&username).await?;
                self.refresh_interests(existing, &interests).await
            }
            Err(e) => Err(e),
        }
    }

    async fn refresh_interests(&self, user: User, interests: &[String]) -> Result<Registration> {
        let user = if interests.is_empty() {
            user
        } else {
            self.storage.update_user_interests(user.id, interests).await?
        };
        info!(user_id = user.id, "User already exists");
        metrics::record_user_registered(RegistrationStatus::Existing);
        Ok(Registration {
            user,
            status: RegistrationStatus::Existing,
        })
    }

    pub async fn get_user(&self, username: &str) -> Result<User> {
        self.require_user(username).await
    }

    fn resolve_count(&self, requested: Option<u32>) -> Result<usize> {
        let count = requested.unwrap_or(self.limits.default_count);
        if count < self.limits.min_count || count > self.limits.max_count {
            return Err(PredictError::Validation(format!(
                "count must be between {} and {}",
                self.limits.min_count, self.limits.max_count
            )));
        }
        Ok(count as usize)
    }

    /// Serve up to `count` random questions the user has not seen, marking each as viewed
    #[instrument(skip(self))]
    pub async fn fresh_questions(&self, username: &str, count: Option<u32>) -> Result<Vec<Question>> {
        let count = self.resolve_count(count)?;
        let user = self.require_user(username).await?;
        if user.interests.is_empty() {
            return Err(PredictError::NoInterests);
        }

        let mut candidates = self
            .storage
            .get_unseen_questions(user.id, &user.interests)
            .await?;
        candidates.shuffle(&mut rand::thread_rng());

        // Marking re-checks each candidate, so ones served by a concurrent request
        // or resolved since listing are dropped here.
        let ids: Vec<i64> = candidates.iter().map(|q| q.id).collect();
        let marked: HashSet<i64> = self
            .storage
            .mark_questions_viewed(user.id, &ids, count, Utc::now())
            .await?
            .into_iter()
            .collect();
        debug!(candidates = ids.len(), marked = marked.len(), "Marked fresh questions viewed");
        let served: Vec<Question> = candidates
            .into_iter()
            .filter(|q| marked.contains(&q.id))
            .collect();

        info!(user_id = user.id, served = served.len(), "Served fresh questions");
        metrics::record_questions_served(served.len());
        Ok(served)
    }

    #[instrument(skip(self))]
    pub async fn question_history(
        &self,
        username: &str,
        interest: Option<&str>,
    ) -> Result<Vec<ServedQuestion>> {
        let user = self.require_user(username).await?;
        let interest = interest.and_then(normalize_interest);
        self.storage
            .get_question_history(user.id, interest.as_deref())
            .await
    }

    /// Served, unresolved questions; with `due_only` just those past their resolution date
    #[instrument(skip(self))]
    pub async fn pending_resolutions(
        &self,
        username: &str,
        due_only: bool,
    ) -> Result<Vec<ServedQuestion>> {
        let user = self.require_user(username).await?;
        let mut pending = self.storage.get_pending_questions(user.id).await?;
        if due_only {
            let now = Utc::now();
            pending.retain(|s| s.question.resolution_date <= now);
        }
        Ok(pending)
    }

    #[instrument(skip(self, note))]
    pub async fn resolve_question(
        &self,
        username: &str,
        question_id: i64,
        result: &str,
        note: Option<&str>,
    ) -> Result<Question> {
        let user = self.require_user(username).await?;
        let outcome: Outcome = result.parse()?;
        let note = note.map(str::trim).filter(|n| !n.is_empty());

        let question = self
            .storage
            .resolve_question(question_id, outcome, note, Utc::now())
            .await?;

        info!(question_id, user_id = user.id, %outcome, "Question resolved");
        metrics::record_question_resolved(outcome);
        Ok(question)
    }

    /// Validate and store a new question, deriving its resolution date when none is given
    #[instrument(skip(self, draft), fields(interest = %draft.interest))]
    pub async fn add_question(&self, draft: QuestionDraft) -> Result<Question> {
        let question = validate_question_text(&draft.question)?;
        let interest = normalize_interest(&draft.interest)
            .ok_or_else(|| PredictError::Validation("interest must not be empty".to_string()))?;

        let now = Utc::now();
        let resolution_date = draft
            .resolution_date
            .unwrap_or_else(|| resolution_date_for(&question, now));
        let source_articles = draft
            .source_articles
            .iter()
            .map(|a| a.trim())
            .filter(|a| !a.is_empty())
            .map(str::to_string)
            .collect();

        let created = self
            .storage
            .create_question(&NewQuestion {
                question,
                interest,
                source_articles,
                created_at: now,
                resolution_date,
            })
            .await?;

        info!(question_id = created.id, "Question created");
        metrics::record_question_created();
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorage;
    use crate::types::QuestionStatus;
    use async_trait::async_trait;
    use chrono::Duration;

    fn service() -> PredictionService {
        PredictionService::new(Arc::new(InMemoryStorage::new()), QuestionLimits::default())
    }

    fn draft(text: &str, interest: &str) -> QuestionDraft {
        QuestionDraft {
            question: text.to_string(),
            interest: interest.to_string(),
            source_articles: vec!["  Some headline ".to_string(), "".to_string()],
            resolution_date: None,
        }
    }

    fn interests(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    /// What a concurrent request does behind the service's back
    #[derive(Clone, Copy, PartialEq)]
    enum Interference {
        UsernameTaken,
        ResolvedAfterListing,
        ServedAfterListing,
        MarkingFails,
    }

    struct RacingStorage {
        inner: InMemoryStorage,
        interference: Interference,
    }

    #[async_trait]
    impl Storage for RacingStorage {
        async fn create_user(
            &self,
            username: &str,
            interests: &[String],
            created_at: DateTime<Utc>,
        ) -> Result<User> {
            let user = self.inner.create_user(username, interests, created_at).await?;
            if self.interference == Interference::UsernameTaken {
                return Err(PredictError::UsernameTaken(user.username));
            }
            Ok(user)
        }

        async fn get_user_by_username(&self, username: &str) -> Result<Option<User>> {
            self.inner.get_user_by_username(username).await
        }

        async fn update_user_interests(&self, user_id: i64, interests: &[String]) -> Result<User> {
            self.inner.update_user_interests(user_id, interests).await
        }

        async fn create_question(&self, question: &NewQuestion) -> Result<Question> {
            self.inner.create_question(question).await
        }

        async fn get_question(&self, question_id: i64) -> Result<Option<Question>> {
            self.inner.get_question(question_id).await
        }

        async fn resolve_question(
            &self,
            question_id: i64,
            outcome: Outcome,
            note: Option<&str>,
            resolved_at: DateTime<Utc>,
        ) -> Result<Question> {
            self.inner.resolve_question(question_id, outcome, note, resolved_at).await
        }

        async fn get_unseen_questions(
            &self,
            user_id: i64,
            interests: &[String],
        ) -> Result<Vec<Question>> {
            let listed = self.inner.get_unseen_questions(user_id, interests).await?;
            match self.interference {
                Interference::ResolvedAfterListing => {
                    for q in &listed {
                        self.inner.resolve_question(q.id, Outcome::No, None, Utc::now()).await?;
                    }
                }
                Interference::ServedAfterListing => {
                    if let Some(first) = listed.iter().min_by_key(|q| q.id) {
                        self.inner.mark_question_viewed(user_id, first.id, Utc::now()).await?;
                    }
                }
                _ => {}
            }
            Ok(listed)
        }

        async fn mark_question_viewed(
            &self,
            user_id: i64,
            question_id: i64,
            viewed_at: DateTime<Utc>,
        ) -> Result<bool> {
            self.inner.mark_question_viewed(user_id, question_id, viewed_at).await
        }

        async fn mark_questions_viewed(
            &self,
            user_id: i64,
            question_ids: &[i64],
            limit: usize,
            viewed_at: DateTime<Utc>,
        ) -> Result<Vec<i64>> {
            if self.interference == Interference::MarkingFails {
                return Err(PredictError::internal("disk full"));
            }
            self.inner
                .mark_questions_viewed(user_id, question_ids, limit, viewed_at)
                .await
        }

        async fn get_question_history(
            &self,
            user_id: i64,
            interest: Option<&str>,
        ) -> Result<Vec<ServedQuestion>> {
            self.inner.get_question_history(user_id, interest).await
        }

        async fn get_pending_questions(&self, user_id: i64) -> Result<Vec<ServedQuestion>> {
            self.inner.get_pending_questions(user_id).await
        }
    }

    fn racing_service(interference: Interference) -> PredictionService {
        let storage = RacingStorage {
            inner: InMemoryStorage::new(),
            interference,
        };
        PredictionService::new(Arc::new(storage), QuestionLimits::default())
    }

    async fn seed_cricket(svc: &PredictionService, n: usize) {
        for i in 0..n {
            svc.add_question(draft(&format!("Will India score over {} runs today?", 200 + i), "cricket"))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_registration_race_falls_back_to_existing() {
        let svc = racing_service(Interference::UsernameTaken);

        let registration = svc.register_user("john", &interests(&["Cricket"])).await.unwrap();
        assert_eq!(registration.status, RegistrationStatus::Existing);
        assert_eq!(registration.user.username, "john");
        assert_eq!(registration.user.interests, interests(&["cricket"]));
    }

    #[tokio::test]
    async fn test_questions_resolved_after_listing_are_not_served() {
        let svc = racing_service(Interference::ResolvedAfterListing);
        svc.register_user("john", &interests(&["cricket"])).await.unwrap();
        seed_cricket(&svc, 2).await;

        let served = svc.fresh_questions("john", None).await.unwrap();
        assert!(served.is_empty());
        assert!(svc.question_history("john", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_questions_served_concurrently_are_skipped() {
        let svc = racing_service(Interference::ServedAfterListing);
        svc.register_user("john", &interests(&["cricket"])).await.unwrap();
        seed_cricket(&svc, 3).await;

        let served = svc.fresh_questions("john", None).await.unwrap();
        let ids: HashSet<i64> = served.iter().map(|q| q.id).collect();
        assert_eq!(ids, HashSet::from([2, 3]));
        assert_eq!(svc.question_history("john", None).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_failed_marking_records_no_views() {
        let svc = racing_service(Interference::MarkingFails);
        svc.register_user("john", &interests(&["cricket"])).await.unwrap();
        seed_cricket(&svc, 2).await;

        assert!(svc.fresh_questions("john", None).await.is_err());
        assert!(svc.pending_resolutions("john", false).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_register_then_reregister() {
        let svc = service();

        let created = svc.register_user("john", &interests(&["Cricket", "football"])).await.unwrap();
        assert_eq!(created.status, RegistrationStatus::Created);
        assert_eq!(created.user.interests, interests(&["cricket", "football"]));

        let unchanged = svc.register_user(" john ", &[]).await.unwrap();
        assert_eq!(unchanged.status, RegistrationStatus::Existing);
        assert_eq!(unchanged.user.id, created.user.id);
        assert_eq!(unchanged.user.interests, interests(&["cricket", "football"]));

        let replaced = svc.register_user("john", &interests(&["tennis"])).await.unwrap();
        assert_eq!(replaced.status, RegistrationStatus::Existing);
        assert_eq!(replaced.user.interests, interests(&["tennis"]));
    }

    #[tokio::test]
    async fn test_fresh_questions_never_repeat() {
        let svc = service();
        svc.register_user("john", &interests(&["cricket"])).await.unwrap();
        for i in 0..5 {
            svc.add_question(draft(&format!("Will India score over {} runs today?", 200 + i), "cricket"))
                .await
                .unwrap();
        }
        svc.add_question(draft("Will City win the derby on Sunday?", "football"))
            .await
            .unwrap();

        let first = svc.fresh_questions("john", Some(3)).await.unwrap();
        let second = svc.fresh_questions("john", Some(3)).await.unwrap();
        let third = svc.fresh_questions("john", None).await.unwrap();

        assert_eq!(first.len(), 3);
        assert_eq!(second.len(), 2);
        assert!(third.is_empty());

        let ids: HashSet<i64> = first.iter().chain(second.iter()).map(|q| q.id).collect();
        assert_eq!(ids.len(), 5);
        assert!(first.iter().chain(second.iter()).all(|q| q.interest == "cricket"));
    }

    #[tokio::test]
    async fn test_fresh_questions_errors() {
        let svc = service();
        svc.register_user("nobody-cares", &[]).await.unwrap();

        assert!(matches!(
            svc.fresh_questions("nobody-cares", None).await.unwrap_err(),
            PredictError::NoInterests
        ));
        assert!(matches!(
            svc.fresh_questions("ghost", None).await.unwrap_err(),
            PredictError::UserNotFound(_)
        ));
        assert!(matches!(
            svc.fresh_questions("nobody-cares", Some(0)).await.unwrap_err(),
            PredictError::Validation(_)
        ));
        assert!(matches!(
            svc.fresh_questions("nobody-cares", Some(11)).await.unwrap_err(),
            PredictError::Validation(_)
        ));
    }

    #[tokio::test]
    async fn test_pending_due_only() {
        let svc = service();
        svc.register_user("john", &interests(&["cricket"])).await.unwrap();

        let mut overdue = draft("Will India win the first test match?", "cricket");
        overdue.resolution_date = Some(Utc::now() - Duration::days(1));
        let overdue = svc.add_question(overdue).await.unwrap();
        let later = svc
            .add_question(draft("Will India win the second test match?", "cricket"))
            .await
            .unwrap();

        svc.fresh_questions("john", None).await.unwrap();

        let all = svc.pending_resolutions("john", false).await.unwrap();
        assert_eq!(
            all.iter().map(|s| s.question.id).collect::<Vec<_>>(),
            vec![overdue.id, later.id]
        );

        let due = svc.pending_resolutions("john", true).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].question.id, overdue.id);
    }

    #[tokio::test]
    async fn test_resolve_moves_question_out_of_pending() {
        let svc = service();
        svc.register_user("john", &interests(&["cricket"])).await.unwrap();
        let q = svc
            .add_question(draft("Will India win the match tomorrow?", "cricket"))
            .await
            .unwrap();
        svc.fresh_questions("john", None).await.unwrap();

        let resolved = svc
            .resolve_question("john", q.id, "YES", Some("  Team won the match "))
            .await
            .unwrap();
        assert_eq!(resolved.status, QuestionStatus::Resolved);
        assert_eq!(resolved.result, Some(Outcome::Yes));
        assert_eq!(resolved.resolution_note.as_deref(), Some("Team won the match"));

        assert!(svc.pending_resolutions("john", false).await.unwrap().is_empty());
        let history = svc.question_history("john", Some("CRICKET")).await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].question.is_resolved());
    }

    #[tokio::test]
    async fn test_add_question_derives_resolution_date() {
        let svc = service();
        let before = Utc::now();
        let q = svc
            .add_question(draft("Will India win the match tomorrow?", " Cricket "))
            .await
            .unwrap();

        assert_eq!(q.interest, "cricket");
        assert_eq!(q.source_articles, vec!["Some headline".to_string()]);
        assert!(q.resolution_date >= before + Duration::days(1));
        assert!(q.resolution_date < before + Duration::days(2));

        let err = svc.add_question(draft("Will India win the match?", "  ")).await.unwrap_err();
        assert!(matches!(err, PredictError::Validation(_)));
    }
}
