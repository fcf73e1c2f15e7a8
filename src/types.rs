use crate::error::PredictError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A registered user and the interest tags they follow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub interests: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Global lifecycle state of a question
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuestionStatus {
    Pending,
    Resolved,
}

impl QuestionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuestionStatus::Pending => "pending",
            QuestionStatus::Resolved => "resolved",
        }
    }
}

impl FromStr for QuestionStatus {
    type Err = PredictError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(QuestionStatus::Pending),
            "resolved" => Ok(QuestionStatus::Resolved),
            other => Err(PredictError::internal(format!(
                "unknown question status '{other}'"
            ))),
        }
    }
}

/// Outcome recorded when a question is resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Yes,
    No,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Yes => "yes",
            Outcome::No => "no",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Outcome {
    type Err = PredictError;

    /// Accepts `yes`/`no` in any letter case, surrounding whitespace ignored
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "yes" => Ok(Outcome::Yes),
            "no" => Ok(Outcome::No),
            _ => Err(PredictError::Validation(format!(
                "result must be 'yes' or 'no', got '{}'",
                s.trim()
            ))),
        }
    }
}

/// A yes/no prediction question
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    pub id: i64,
    pub question: String,
    pub interest: String,
    pub source_articles: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub resolution_date: DateTime<Utc>,
    pub status: QuestionStatus,
    pub result: Option<Outcome>,
    pub resolution_note: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Question {
    pub fn is_resolved(&self) -> bool {
        self.status == QuestionStatus::Resolved
    }
}

/// Fields needed to insert a question; storage assigns the id
#[derive(Debug, Clone)]
pub struct NewQuestion {
    pub question: String,
    pub interest: String,
    pub source_articles: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub resolution_date: DateTime<Utc>,
}

/// A question as seen by one user: the question plus when it was served
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServedQuestion {
    #[serde(flatten)]
    pub question: Question,
    pub viewed_at: DateTime<Utc>,
}

/// Whether registration created a new user or updated an existing one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistrationStatus {
    Created,
    Existing,
}

#[derive(Debug, Clone)]
pub struct Registration {
    pub user: User,
    pub status: RegistrationStatus,
}
