use thiserror::Error;
use uuid::Uuid;

// Missing pieces are all "no match", not errors; the only match-specific
// failure is a join key hitting more than one stored clinical row.
#[derive(Debug, Error)]
pub enum MatchError {
    #[error("{count} clinical rows match identifier {identifier_id} on key {key}; expected at most one")]
    MultipleClinicalRows {
        identifier_id: Uuid,
        key: String,
        count: usize,
    },

    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("failed to decode a stored clinical row: {0}")]
    Decode(anyhow::Error),
}

impl From<anyhow::Error> for MatchError {
    fn from(err: anyhow::Error) -> Self {
        MatchError::Decode(err)
    }
}
