//! Loading questions into storage from a TOML file.
//!
//! ```toml
//! [[questions]]
//! question = "Will India win the second test against Australia?"
//! interest = "cricket"
//! source_articles = ["India level series after day-five collapse"]
//! resolution_date = "2026-11-01T00:00:00Z"   # optional, quoted RFC 3339
//! ```

use crate::error::{PredictError, Result};
use crate::service::{PredictionService, QuestionDraft};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
struct SeedFile {
    #[serde(default)]
    questions: Vec<QuestionDraft>,
}

#[derive(Debug, Default)]
pub struct SeedSummary {
    pub created: usize,
    /// Question text and reason for every draft that failed validation
    pub skipped: Vec<(String, String)>,
}

pub fn load_seed_file(path: &Path) -> Result<Vec<QuestionDraft>> {
    let content = fs::read_to_string(path)?;
    let seed: SeedFile = toml::from_str(&content)?;
    Ok(seed.questions)
}

/// Insert every valid draft; invalid ones are skipped, storage errors abort.
pub async fn seed_questions(
    service: &PredictionService,
    drafts: Vec<QuestionDraft>,
) -> Result<SeedSummary> {
    let mut summary = SeedSummary::default();

    for draft in drafts {
        let text = draft.question.clone();
        match service.add_question(draft).await {
            Ok(_) => summary.created += 1,
            Err(PredictError::Validation(reason)) => {
                warn!("Skipping seed question '{}': {}", text, reason);
                summary.skipped.push((text, reason));
            }
            Err(e) => return Err(e),
        }
    }

    info!(
        created = summary.created,
        skipped = summary.skipped.len(),
        "Seeding finished"
    );
    Ok(summary)
}
