//! Score ingestion and derivation engine: identity, PB merging, ranking, ratings,
//! classes, goals, milestones, folder lookups and the import pipeline that drives them.

pub mod calculated;
pub mod classes;
pub mod error;
pub mod events;
pub mod folders;
pub mod goals;
pub mod identity;
pub mod milestones;
pub mod pb;
pub mod pipeline;
pub mod ranking;
pub mod rating;
pub mod registry;

pub use classes::{
    merge_class_maps, return_class_if_greater, update_user_game_stats, ClassComparison,
    ClassHandler, NoopClassHandler,
};
pub use error::EngineError;
pub use events::{BroadcastEventSink, EngineEvent, EventError, EventSink, NoopEventSink};
pub use folders::{
    create_folder_chart_lookup, get_folder_chart_ids, initialise_folder_chart_lookup,
    resolve_folder_to_charts,
};
pub use goals::{evaluate_goal_for_user, process_goal, GoalDelta, GoalEvaluation};
pub use identity::create_score_id;
pub use milestones::{evaluate_milestone_for_user, MilestoneDelta, MilestoneEvaluation};
pub use pb::{create_pb_doc, merge_scores, MergeContext, MergeHook, MergeHooks, MergeVerdict};
pub use pipeline::{
    hydrate_score, Catalog, ConvertedScore, EngineConfig, ImportCapabilities, ImportPipeline,
    ImportSummary, ScoreImportError,
};
pub use ranking::{get_ranking_info, refresh_pb_ranking, update_chart_ranking, RankingInfo};
pub use rating::{NamedRating, RatingStrategy};
pub use registry::{GptStrategies, StaticClassFn, StrategyRegistry};

pub const CRATE_NAME: &str = "scorebook-engine";

#[cfg(test)]
pub(crate) mod test_support {
    use chrono::{TimeZone, Utc};
    use scorebook_core::{
        Chart, ComposedFrom, Game, PbScore, Playtype, Score, ScoreData, UserId,
    };

    pub fn mk_score(user_id: UserId, chart_id: &str, percent: f64, lamp: &str, lamp_index: usize) -> Score {
        Score {
            score_id: format!("R{user_id}-{chart_id}-{percent}-{lamp}"),
            user_id,
            chart_id: chart_id.to_string(),
            song_id: 1,
            game: Game::Iidx,
            playtype: Playtype::Sp,
            service: "test".into(),
            import_type: None,
            is_primary: true,
            highlight: false,
            comment: None,
            time_achieved: None,
            time_added: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
            score_data: ScoreData {
                score: percent * 10.0,
                percent,
                grade: "AA".into(),
                grade_index: 6,
                lamp: lamp.into(),
                lamp_index,
                hit_data: Default::default(),
                hit_meta: Default::default(),
            },
            score_meta: Default::default(),
            calculated_data: Default::default(),
        }
    }

    pub fn mk_chart(chart_id: &str, game: Game, playtype: Playtype, level_num: f64) -> Chart {
        Chart {
            chart_id: chart_id.to_string(),
            song_id: 1,
            game,
            playtype,
            difficulty: "ANOTHER".into(),
            level: level_num.to_string(),
            level_num,
            is_primary: true,
            flags: Default::default(),
            data: Default::default(),
        }
    }

    pub fn mk_pb(user_id: UserId, chart_id: &str, percent: f64) -> PbScore {
        let score = mk_score(user_id, chart_id, percent, "CLEAR", 4);
        PbScore {
            user_id,
            chart_id: chart_id.to_string(),
            song_id: score.song_id,
            game: score.game,
            playtype: score.playtype,
            is_primary: true,
            highlight: false,
            time_achieved: None,
            comments: Vec::new(),
            composed_from: ComposedFrom {
                score_pb: score.score_id.clone(),
                lamp_pb: score.score_id.clone(),
                other: Vec::new(),
            },
            score_data: score.score_data,
            calculated_data: Default::default(),
            ranking: 0,
            out_of: 0,
        }
    }
}
