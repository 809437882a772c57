//! Personal-best merging.
//!
//! A PB combines the user's best-by-percent score with their best-by-lamp score on the
//! same chart, then lets a per-game [`MergeHook`] splice in further metrics.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use scorebook_core::{
    Chart, ComposedFrom, ComposedOther, Game, PbScore, Score, UserId,
};
use scorebook_storage::{Database, Filter, FindOptions};
use tracing::{debug, error};

use crate::calculated::vf6;
use crate::error::EngineError;
use crate::ranking::get_ranking_info;

/// Everything a merge hook may inspect. All scores belong to one (user, chart) pair.
pub struct MergeContext<'a> {
    pub user_id: UserId,
    pub chart: Option<&'a Chart>,
    pub scores: &'a [Score],
    pub score_pb: &'a Score,
    pub lamp_pb: &'a Score,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeVerdict {
    Keep,
    /// Drop the PB entirely; nothing is written for this pair.
    Veto(String),
}

pub trait MergeHook: Send + Sync {
    fn merge(&self, pb: &mut PbScore, ctx: &MergeContext<'_>) -> MergeVerdict;
}

/// Among scores sharing the PB's lamp, picks the lowest miss count (`hitMeta.bp`).
#[derive(Default)]
pub struct BestBpHook;

impl MergeHook for BestBpHook {
    fn merge(&self, pb: &mut PbScore, ctx: &MergeContext<'_>) -> MergeVerdict {
        let provenance_rank = |s: &Score| {
            if s.score_id == ctx.score_pb.score_id {
                0
            } else if s.score_id == ctx.lamp_pb.score_id {
                1
            } else {
                2
            }
        };

        let best = ctx
            .scores
            .iter()
            .filter(|s| s.score_data.lamp_index == pb.score_data.lamp_index)
            .filter_map(|s| s.score_data.hit_meta.get("bp").map(|bp| (*bp, s)))
            .min_by(|(bp_a, a), (bp_b, b)| {
                bp_a.total_cmp(bp_b)
                    .then_with(|| provenance_rank(a).cmp(&provenance_rank(b)))
                    .then_with(|| a.score_id.cmp(&b.score_id))
            });

        let Some((bp, holder)) = best else {
            return MergeVerdict::Keep;
        };

        if holder.score_id == ctx.score_pb.score_id {
            return MergeVerdict::Keep;
        }

        pb.score_data.hit_meta.insert("bp".to_string(), bp);
        if holder.score_id != ctx.lamp_pb.score_id {
            pb.composed_from.other.push(ComposedOther {
                name: "Best BP".to_string(),
                score_id: holder.score_id.clone(),
            });
        }
        MergeVerdict::Keep
    }
}

/// Volforce depends on both grade and lamp, so it is recomputed for the merged PB.
/// The best EX score is tracked separately.
#[derive(Default)]
pub struct VolforceHook;

impl MergeHook for VolforceHook {
    fn merge(&self, pb: &mut PbScore, ctx: &MergeContext<'_>) -> MergeVerdict {
        let Some(chart) = ctx.chart.filter(|c| c.level_num > 0.0) else {
            return MergeVerdict::Veto(format!("chart {} has no usable level", pb.chart_id));
        };

        match vf6(
            &pb.score_data.grade,
            &pb.score_data.lamp,
            pb.score_data.percent,
            chart.level_num,
        ) {
            Some(value) => {
                pb.calculated_data.insert("VF6".to_string(), value);
            }
            None => {
                pb.calculated_data.remove("VF6");
            }
        }

        let best_ex = ctx
            .scores
            .iter()
            .filter_map(|s| s.score_data.hit_meta.get("exScore").map(|ex| (*ex, s)))
            .max_by(|(a, sa), (b, sb)| a.total_cmp(b).then_with(|| sb.score_id.cmp(&sa.score_id)));

        if let Some((ex, holder)) = best_ex {
            let current = pb.score_data.hit_meta.get("exScore").copied();
            if holder.score_id != ctx.score_pb.score_id && current.map_or(true, |c| ex > c) {
                pb.score_data.hit_meta.insert("exScore".to_string(), ex);
                pb.composed_from.other.push(ComposedOther {
                    name: "exScorePB".to_string(),
                    score_id: holder.score_id.clone(),
                });
            }
        }

        MergeVerdict::Keep
    }
}

/// Merge hooks keyed by game, resolved once per import.
#[derive(Clone, Default)]
pub struct MergeHooks {
    hooks: HashMap<Game, Arc<dyn MergeHook>>,
}

impl MergeHooks {
    pub fn builtin() -> Self {
        let best_bp: Arc<dyn MergeHook> = Arc::new(BestBpHook);
        let volforce: Arc<dyn MergeHook> = Arc::new(VolforceHook);
        Self::default()
            .with(Game::Iidx, best_bp.clone())
            .with(Game::Bms, best_bp)
            .with(Game::Sdvx, volforce.clone())
            .with(Game::Usc, volforce)
    }

    pub fn with(mut self, game: Game, hook: Arc<dyn MergeHook>) -> Self {
        self.hooks.insert(game, hook);
        self
    }

    pub fn get(&self, game: Game) -> Option<&dyn MergeHook> {
        self.hooks.get(&game).map(|h| h.as_ref())
    }
}

fn percent_order(a: &Score, b: &Score) -> Ordering {
    b.score_data
        .percent
        .total_cmp(&a.score_data.percent)
        .then_with(|| earliest_first(a, b))
}

fn lamp_order(a: &Score, b: &Score) -> Ordering {
    b.score_data
        .lamp_index
        .cmp(&a.score_data.lamp_index)
        .then_with(|| b.score_data.percent.total_cmp(&a.score_data.percent))
        .then_with(|| earliest_first(a, b))
}

// Undated scores sort after dated ones; score ID breaks any remaining tie.
fn earliest_first(a: &Score, b: &Score) -> Ordering {
    match (a.time_achieved, b.time_achieved) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
    .then_with(|| a.score_id.cmp(&b.score_id))
}

/// Builds the PB document for one (user, chart) from the scores alone, without ranking.
pub fn merge_scores(
    user_id: UserId,
    chart: Option<&Chart>,
    scores: &[Score],
    hook: Option<&dyn MergeHook>,
) -> Option<PbScore> {
    let score_pb = scores.iter().min_by(|a, b| percent_order(a, b))?;
    let lamp_pb = scores.iter().min_by(|a, b| lamp_order(a, b))?;

    let mut score_data = score_pb.score_data.clone();
    score_data.lamp = lamp_pb.score_data.lamp.clone();
    score_data.lamp_index = lamp_pb.score_data.lamp_index;

    let mut comments: Vec<String> = score_pb.comment.iter().cloned().collect();
    if lamp_pb.score_id != score_pb.score_id {
        comments.extend(lamp_pb.comment.iter().cloned());
    }

    let mut pb = PbScore {
        user_id,
        chart_id: score_pb.chart_id.clone(),
        song_id: score_pb.song_id,
        game: score_pb.game,
        playtype: score_pb.playtype,
        is_primary: score_pb.is_primary,
        highlight: score_pb.highlight || lamp_pb.highlight,
        time_achieved: score_pb.time_achieved.max(lamp_pb.time_achieved),
        comments,
        score_data,
        calculated_data: score_pb.calculated_data.clone(),
        composed_from: ComposedFrom {
            score_pb: score_pb.score_id.clone(),
            lamp_pb: lamp_pb.score_id.clone(),
            other: Vec::new(),
        },
        ranking: 0,
        out_of: 0,
    };

    if let Some(hook) = hook {
        let ctx = MergeContext {
            user_id,
            chart,
            scores,
            score_pb,
            lamp_pb,
        };
        if let MergeVerdict::Veto(reason) = hook.merge(&mut pb, &ctx) {
            error!(user_id, chart_id = %pb.chart_id, %reason, "merge hook vetoed PB creation");
            return None;
        }
    }

    Some(pb)
}

/// Recomputes the PB for (user, chart) and pre-fills its ranking fields.
///
/// `Ok(None)` means there is nothing to write: either the user has no scores on the
/// chart or the game's merge hook vetoed the merge.
pub async fn create_pb_doc(
    db: &Database,
    hooks: &MergeHooks,
    user_id: UserId,
    chart_id: &str,
) -> Result<Option<PbScore>, EngineError> {
    let scores = db
        .scores
        .find(
            &Filter::new().eq("userId", user_id).eq("chartId", chart_id),
            &FindOptions::default(),
        )
        .await?;

    let Some(first) = scores.first() else {
        error!(user_id, chart_id, "attempted to create a PB for a chart with no scores");
        return Ok(None);
    };

    let chart = db
        .charts
        .find_one(&Filter::new().eq("chartId", chart_id), &FindOptions::default())
        .await?;

    let Some(mut pb) = merge_scores(user_id, chart.as_ref(), &scores, hooks.get(first.game)) else {
        return Ok(None);
    };

    let info = get_ranking_info(db, chart_id, user_id, pb.score_data.percent).await?;
    pb.ranking = info.ranking;
    pb.out_of = info.out_of;

    debug!(user_id, chart_id, score_pb = %pb.composed_from.score_pb, lamp_pb = %pb.composed_from.lamp_pb, "merged PB");
    Ok(Some(pb))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{mk_chart, mk_score};
    use scorebook_core::Playtype;

    #[tokio::test]
    async fn score_and_lamp_come_from_different_scores() {
        let db = Database::in_memory();
        let mut a = mk_score(1, "c1", 95.0, "CLEAR", 4);
        a.comment = Some("high percent".into());
        let mut b = mk_score(1, "c1", 80.0, "HARD CLEAR", 5);
        b.highlight = true;
        b.comment = Some("survived".into());
        db.scores.bulk_upsert(vec![a.clone(), b.clone()]).await;

        let pb = create_pb_doc(&db, &MergeHooks::default(), 1, "c1")
            .await
            .expect("merge")
            .expect("pb");

        assert_eq!(pb.score_data.percent, 95.0);
        assert_eq!(pb.score_data.score, a.score_data.score);
        assert_eq!(pb.score_data.grade, a.score_data.grade);
        assert_eq!(pb.score_data.lamp, "HARD CLEAR");
        assert_eq!(pb.score_data.lamp_index, 5);
        assert!(pb.highlight);
        assert_eq!(pb.comments.len(), 2);
        assert_eq!(pb.composed_from.score_pb, a.score_id);
        assert_eq!(pb.composed_from.lamp_pb, b.score_id);
        assert_eq!((pb.ranking, pb.out_of), (1, 1));
    }

    #[tokio::test]
    async fn no_scores_yields_nothing() {
        let db = Database::in_memory();
        let pb = create_pb_doc(&db, &MergeHooks::builtin(), 1, "missing")
            .await
            .expect("merge");
        assert!(pb.is_none());
    }

    #[test]
    fn best_bp_from_a_third_score_is_recorded_as_other() {
        let mut score_pb = mk_score(1, "c1", 95.0, "HARD CLEAR", 5);
        score_pb.score_data.hit_meta.insert("bp".into(), 20.0);
        let mut lamp_pb = mk_score(1, "c1", 90.0, "HARD CLEAR", 5);
        lamp_pb.score_data.hit_meta.insert("bp".into(), 15.0);
        let mut low_bp = mk_score(1, "c1", 85.0, "HARD CLEAR", 5);
        low_bp.score_data.hit_meta.insert("bp".into(), 4.0);
        let mut cleared_worse = mk_score(1, "c1", 60.0, "CLEAR", 4);
        cleared_worse.score_data.hit_meta.insert("bp".into(), 1.0);

        let scores = vec![score_pb.clone(), lamp_pb, low_bp.clone(), cleared_worse];
        let pb = merge_scores(1, None, &scores, Some(&BestBpHook)).expect("pb");

        assert_eq!(pb.score_data.hit_meta["bp"], 4.0);
        assert_eq!(
            pb.composed_from.other,
            vec![ComposedOther {
                name: "Best BP".into(),
                score_id: low_bp.score_id,
            }]
        );
    }

    #[test]
    fn best_bp_on_lamp_pb_is_copied_without_provenance() {
        let mut score_pb = mk_score(1, "c1", 95.0, "CLEAR", 4);
        score_pb.score_data.hit_meta.insert("bp".into(), 30.0);
        let mut lamp_pb = mk_score(1, "c1", 70.0, "EX HARD CLEAR", 6);
        lamp_pb.score_data.hit_meta.insert("bp".into(), 12.0);

        let pb = merge_scores(1, None, &[score_pb, lamp_pb], Some(&BestBpHook)).expect("pb");
        assert_eq!(pb.score_data.hit_meta["bp"], 12.0);
        assert!(pb.composed_from.other.is_empty());
    }

    #[test]
    fn volforce_hook_vetoes_without_chart() {
        let mut score = mk_score(1, "c1", 95.0, "CLEAR", 1);
        score.game = Game::Sdvx;
        score.playtype = Playtype::Single;
        score.score_data.grade = "AAA".into();
        assert!(merge_scores(1, None, &[score], Some(&VolforceHook)).is_none());
    }

    #[test]
    fn volforce_hook_recomputes_from_merged_lamp() {
        let chart = mk_chart("c1", Game::Sdvx, Playtype::Single, 18.0);
        let mut best_score = mk_score(1, "c1", 99.0, "CLEAR", 1);
        best_score.score_data.grade = "S".into();
        best_score.score_data.hit_meta.insert("exScore".into(), 3000.0);
        let mut best_lamp = mk_score(1, "c1", 97.0, "ULTIMATE CHAIN", 3);
        best_lamp.score_data.grade = "AAA+".into();
        best_lamp.score_data.hit_meta.insert("exScore".into(), 3100.0);

        let pb = merge_scores(
            1,
            Some(&chart),
            &[best_score, best_lamp.clone()],
            Some(&VolforceHook),
        )
        .expect("pb");

        assert_eq!(pb.calculated_data["VF6"], vf6("S", "ULTIMATE CHAIN", 99.0, 18.0).expect("vf"));
        assert_eq!(pb.score_data.hit_meta["exScore"], 3100.0);
        assert_eq!(pb.composed_from.other[0].score_id, best_lamp.score_id);
    }

    #[tokio::test]
    async fn merging_twice_is_identical() {
        let db = Database::in_memory();
        db.scores
            .bulk_upsert(vec![
                mk_score(1, "c1", 91.0, "CLEAR", 4),
                mk_score(1, "c1", 91.0, "EASY CLEAR", 3),
                mk_score(2, "c1", 50.0, "FAILED", 1),
            ])
            .await;

        let hooks = MergeHooks::builtin();
        let first = create_pb_doc(&db, &hooks, 1, "c1").await.expect("merge");
        let second = create_pb_doc(&db, &hooks, 1, "c1").await.expect("merge");
        assert_eq!(first, second);
    }
}
