use scorebook_core::{Game, Playtype};
use scorebook_storage::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("unknown goal metric key {0}")]
    UnknownMetricKey(String),
    #[error("goal {goal_id} is invalid: {reason}")]
    InvalidGoal { goal_id: String, reason: String },
    #[error("milestone {milestone_id} is invalid: {reason}")]
    InvalidMilestone { milestone_id: String, reason: String },
    #[error("no configuration for {0} {1}")]
    UnsupportedPlaytype(Game, Playtype),
    #[error("chart {0} does not exist")]
    ChartNotFound(String),
    #[error("chart {chart_id} belongs to {game} {playtype}, not the score's game")]
    ChartMismatch {
        chart_id: String,
        game: Game,
        playtype: Playtype,
    },
    #[error("score on chart {0} has no percent and none can be derived")]
    MissingPercent(String),
    #[error("song {0} does not exist")]
    SongNotFound(u64),
    #[error("invalid {field} '{value}' for {game} {playtype}")]
    InvalidEnum {
        field: &'static str,
        value: String,
        game: Game,
        playtype: Playtype,
    },
    #[error("folder {0} does not exist")]
    FolderNotFound(String),
    #[error("background task failed: {0}")]
    Task(String),
}
