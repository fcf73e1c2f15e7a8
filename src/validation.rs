use crate::error::{PredictError, Result};
use std::collections::BTreeSet;

pub const MAX_USERNAME_LEN: usize = 50;
pub const MIN_QUESTION_LEN: usize = 20;

/// Words a well-formed yes/no question may start with
pub const QUESTION_PREFIXES: &[&str] = &[
    "Will ", "Do ", "Does ", "Is ", "Are ", "Can ", "Could ", "Should ", "Has ",
];

pub fn normalize_username(raw: &str) -> Result<String> {
    let username = raw.trim();
    if username.is_empty() {
        return Err(PredictError::Validation("username must not be empty".to_string()));
    }
    if username.chars().count() > MAX_USERNAME_LEN {
        return Err(PredictError::Validation(format!(
            "username must be at most {MAX_USERNAME_LEN} characters"
        )));
    }
    // It travels in an HTTP header on every later request
    if !username.chars().all(|c| c == ' ' || c.is_ascii_graphic()) {
        return Err(PredictError::Validation(
            "username must contain only printable ASCII characters".to_string(),
        ));
    }
    Ok(username.to_string())
}

pub fn normalize_interest(raw: &str) -> Option<String> {
    let interest = raw.trim().to_lowercase();
    (!interest.is_empty()).then_some(interest)
}

/// Lower-cased, de-duplicated and sorted; blank entries are dropped.
pub fn normalize_interests<S: AsRef<str>>(raw: &[S]) -> Vec<String> {
    raw.iter()
        .filter_map(|i| normalize_interest(i.as_ref()))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

pub fn validate_question_text(raw: &str) -> Result<String> {
    let question = raw.trim();

    if question.chars().count() < MIN_QUESTION_LEN {
        return Err(PredictError::Validation(format!(
            "question must be at least {MIN_QUESTION_LEN} characters"
        )));
    }
    if !QUESTION_PREFIXES.iter().any(|p| question.starts_with(p)) {
        return Err(PredictError::Validation(
            "question must start with one of: Will, Do, Does, Is, Are, Can, Could, Should, Has"
                .to_string(),
        ));
    }

    Ok(question.to_string())
}
