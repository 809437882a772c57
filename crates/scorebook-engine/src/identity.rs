//! Deterministic score identity.

use scorebook_core::{DryScore, UserId};
use sha2::{Digest, Sha256};

/// Content-addressed ID: `R` followed by the SHA-256 of the user, chart and the four
/// score-defining fields. Hit data, timestamps and comments do not participate, so a
/// re-import of the same play collides on purpose.
///
/// Each field is length-prefixed so no field value can bleed into its neighbour. An
/// absent percent hashes as its own marker, distinct from every supplied percent.
pub fn create_score_id(user_id: UserId, dry: &DryScore, chart_id: &str) -> String {
    let data = &dry.score_data;
    let mut hasher = Sha256::new();
    let mut field = |value: Option<&str>| match value {
        Some(value) => {
            hasher.update((value.len() as u64).to_be_bytes());
            hasher.update(value.as_bytes());
        }
        None => hasher.update(u64::MAX.to_be_bytes()),
    };

    field(Some(user_id.to_string().as_str()));
    field(Some(chart_id));
    field(Some(data.lamp.as_str()));
    field(Some(data.grade.as_str()));
    field(Some(data.score.to_string().as_str()));
    field(data.percent.map(|p| p.to_string()).as_deref());

    format!("R{}", hex::encode(hasher.finalize()))
}
