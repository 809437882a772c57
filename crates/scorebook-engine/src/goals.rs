//! Goal evaluation and subscription updates.

use std::collections::{BTreeSet, HashMap};

use chrono::Utc;
use futures::future::join_all;
use scorebook_core::{gpt_config, Game, Goal, GoalCharts, GoalMode, PbScore, Playtype, UserGoal, UserId};
use scorebook_storage::{Database, Document, Filter, FindOptions, SortOrder};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::error::EngineError;
use crate::events::{emit_logged, EngineEvent, EventSink};
use crate::folders::get_folder_chart_ids;

const GOAL_KEYS: [&str; 4] = [
    "scoreData.gradeIndex",
    "scoreData.lampIndex",
    "scoreData.percent",
    "scoreData.score",
];

/// Snapshot of where a user stands on a goal.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GoalEvaluation {
    pub achieved: bool,
    pub progress: Option<f64>,
    pub out_of: f64,
    pub progress_human: String,
    pub out_of_human: String,
}

impl GoalEvaluation {
    fn of_subscription(sub: &UserGoal) -> Self {
        Self {
            achieved: sub.achieved,
            progress: sub.progress,
            out_of: sub.out_of,
            progress_human: sub.progress_human.clone(),
            out_of_human: sub.out_of_human.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GoalDelta {
    pub goal_id: String,
    pub playtype: Playtype,
    pub old: GoalEvaluation,
    pub new: GoalEvaluation,
}

impl GoalDelta {
    pub fn newly_achieved(&self) -> bool {
        self.new.achieved && !self.old.achieved
    }
}

fn check_key(key: &str) -> Result<(), EngineError> {
    if GOAL_KEYS.contains(&key) {
        Ok(())
    } else {
        error!(key, "goal uses an unknown metric key");
        Err(EngineError::UnknownMetricKey(key.to_string()))
    }
}

/// `None` stands for every chart of the goal's game and playtype.
pub async fn resolve_goal_charts(db: &Database, goal: &Goal) -> Result<Option<Vec<String>>, EngineError> {
    Ok(match &goal.charts {
        GoalCharts::Single(chart_id) => Some(vec![chart_id.clone()]),
        GoalCharts::Multi(chart_ids) => Some(chart_ids.clone()),
        GoalCharts::Folder(folder_id) => Some(get_folder_chart_ids(db, folder_id).await?),
        GoalCharts::Any => None,
    })
}

/// Renders a goal metric for display. `pb` adds the miss count to IIDX/BMS lamps.
pub fn humanise_goal_progress(
    game: Game,
    playtype: Playtype,
    key: &str,
    value: f64,
    pb: Option<&PbScore>,
) -> Result<String, EngineError> {
    let config = gpt_config(game, playtype).ok_or(EngineError::UnsupportedPlaytype(game, playtype))?;
    let index = value.max(0.0) as usize;

    Ok(match key {
        "scoreData.gradeIndex" => config.grade_name(index).unwrap_or("?").to_string(),
        "scoreData.lampIndex" => {
            let lamp = config.lamp_name(index).unwrap_or("?");
            match pb {
                Some(pb) if matches!(game, Game::Iidx | Game::Bms) => {
                    let bp = pb
                        .score_data
                        .hit_meta
                        .get("bp")
                        .map(|bp| bp.to_string())
                        .unwrap_or_else(|| "N/A".to_string());
                    format!("{lamp} (BP: {bp})")
                }
                _ => lamp.to_string(),
            }
        }
        "scoreData.percent" => format!("{value:.2}%"),
        "scoreData.score" => value.to_string(),
        other => return Err(EngineError::UnknownMetricKey(other.to_string())),
    })
}

fn pb_metric(pb: &PbScore, key: &str) -> Option<f64> {
    let data = &pb.score_data;
    match key {
        "scoreData.gradeIndex" => Some(data.grade_index as f64),
        "scoreData.lampIndex" => Some(data.lamp_index as f64),
        "scoreData.percent" => Some(data.percent),
        "scoreData.score" => Some(data.score),
        _ => None,
    }
}

pub async fn evaluate_goal_for_user(
    db: &Database,
    goal: &Goal,
    user_id: UserId,
) -> Result<GoalEvaluation, EngineError> {
    let criteria = &goal.criteria;
    check_key(&criteria.key)?;

    let chart_ids = resolve_goal_charts(db, goal).await?;

    let mut base = Filter::new()
        .eq("userId", user_id)
        .eq("game", goal.game.as_str())
        .eq("playtype", goal.playtype.as_str());
    if let Some(ids) = &chart_ids {
        base = base.is_in("chartId", ids.iter().cloned());
    }
    let meeting = base.clone().gte(criteria.key.clone(), criteria.value);

    match criteria.mode {
        GoalMode::Single => {
            let out_of_human =
                humanise_goal_progress(goal.game, goal.playtype, &criteria.key, criteria.value, None)?;

            let achieving = db
                .personal_bests
                .find_one(&meeting, &FindOptions::default())
                .await?;
            let (achieved, best) = match achieving {
                Some(pb) => (true, Some(pb)),
                None => {
                    let next_best = db
                        .personal_bests
                        .find_one(
                            &base,
                            &FindOptions::default().sort_by(criteria.key.clone(), SortOrder::Desc),
                        )
                        .await?;
                    (false, next_best)
                }
            };

            let Some(pb) = best else {
                return Ok(GoalEvaluation {
                    achieved: false,
                    progress: None,
                    out_of: criteria.value,
                    progress_human: "NO DATA".to_string(),
                    out_of_human,
                });
            };

            let progress = pb_metric(&pb, &criteria.key);
            let progress_human = match progress {
                Some(value) => {
                    humanise_goal_progress(goal.game, goal.playtype, &criteria.key, value, Some(&pb))?
                }
                None => "NO DATA".to_string(),
            };
            Ok(GoalEvaluation {
                achieved,
                progress,
                out_of: criteria.value,
                progress_human,
                out_of_human,
            })
        }
        GoalMode::Abs | GoalMode::Proportion => {
            let count_num = criteria.count_num.ok_or_else(|| EngineError::InvalidGoal {
                goal_id: goal.goal_id.clone(),
                reason: "countNum is required for abs and proportion goals".to_string(),
            })?;

            let out_of = if criteria.mode == GoalMode::Abs {
                count_num
            } else {
                let total = match &chart_ids {
                    Some(ids) => ids.len() as u64,
                    None => {
                        db.charts
                            .count(
                                &Filter::new()
                                    .eq("game", goal.game.as_str())
                                    .eq("playtype", goal.playtype.as_str()),
                            )
                            .await?
                    }
                };
                (count_num * total as f64).floor()
            };

            let user_count = db.personal_bests.count(&meeting).await? as f64;
            Ok(GoalEvaluation {
                achieved: user_count >= out_of,
                progress: Some(user_count),
                out_of,
                progress_human: user_count.to_string(),
                out_of_human: out_of.to_string(),
            })
        }
    }
}

/// Re-evaluates one subscription. `None` when nothing changed since the last snapshot.
pub async fn process_goal(
    db: &Database,
    goal: &Goal,
    sub: &UserGoal,
    user_id: UserId,
) -> Result<Option<(UserGoal, GoalDelta)>, EngineError> {
    let evaluation = evaluate_goal_for_user(db, goal, user_id).await?;

    if sub.progress == evaluation.progress
        && sub.out_of == evaluation.out_of
        && sub.achieved == evaluation.achieved
    {
        return Ok(None);
    }

    if sub.achieved && !evaluation.achieved {
        info!(user_id, goal_id = %goal.goal_id, "user lost achieved status on goal");
    }

    let now = Utc::now();
    let updated = UserGoal {
        achieved: evaluation.achieved,
        progress: evaluation.progress,
        out_of: evaluation.out_of,
        progress_human: evaluation.progress_human.clone(),
        out_of_human: evaluation.out_of_human.clone(),
        time_achieved: match (evaluation.achieved, sub.achieved) {
            (true, true) => sub.time_achieved.or(Some(now)),
            (true, false) => Some(now),
            (false, _) => None,
        },
        last_interaction: Some(now),
        ..sub.clone()
    };

    let delta = GoalDelta {
        goal_id: goal.goal_id.clone(),
        playtype: goal.playtype,
        old: GoalEvaluation::of_subscription(sub),
        new: evaluation,
    };
    Ok(Some((updated, delta)))
}

/// The user's subscribed goals for `game` whose chart set could contain a touched chart.
pub async fn get_relevant_goals(
    db: &Database,
    game: Game,
    user_id: UserId,
    touched: &BTreeSet<String>,
) -> Result<Vec<(Goal, UserGoal)>, EngineError> {
    let subs = db
        .goal_subs
        .find(
            &Filter::new().eq("userId", user_id).eq("game", game.as_str()),
            &FindOptions::default(),
        )
        .await?;
    if subs.is_empty() {
        return Ok(Vec::new());
    }

    let goals = db
        .goals
        .find(
            &Filter::new().is_in("goalId", subs.iter().map(|s| s.goal_id.clone())),
            &FindOptions::default(),
        )
        .await?;

    let touched_folders: BTreeSet<String> = db
        .folder_chart_lookup
        .find(
            &Filter::new().is_in("chartId", touched.iter().cloned()),
            &FindOptions::default(),
        )
        .await?
        .into_iter()
        .map(|l| l.folder_id)
        .collect();

    let mut subs_by_goal: HashMap<String, UserGoal> =
        subs.into_iter().map(|s| (s.goal_id.clone(), s)).collect();

    let relevant = goals
        .into_iter()
        .filter(|goal| match &goal.charts {
            GoalCharts::Single(chart_id) => touched.contains(chart_id),
            GoalCharts::Multi(chart_ids) => chart_ids.iter().any(|c| touched.contains(c)),
            GoalCharts::Folder(folder_id) => touched_folders.contains(folder_id),
            GoalCharts::Any => true,
        })
        .filter_map(|goal| {
            let sub = subs_by_goal.remove(&goal.goal_id)?;
            Some((goal, sub))
        })
        .collect();
    Ok(relevant)
}

/// Evaluates every pair concurrently, writes the changed subscriptions and announces
/// newly achieved goals. A goal that fails to evaluate is skipped.
pub async fn update_goals_for_user(
    db: &Database,
    sink: &dyn EventSink,
    pairs: &[(Goal, UserGoal)],
    user_id: UserId,
) -> Result<Vec<GoalDelta>, EngineError> {
    let results = join_all(
        pairs
            .iter()
            .map(|(goal, sub)| process_goal(db, goal, sub, user_id)),
    )
    .await;

    let mut writes = Vec::new();
    let mut deltas = Vec::new();
    let mut announcements = Vec::new();
    for ((goal, _), result) in pairs.iter().zip(results) {
        match result {
            Ok(Some((updated, delta))) => {
                if delta.newly_achieved() {
                    announcements.push((
                        updated.key(),
                        EngineEvent::GoalAchieved {
                            user_id,
                            goal_id: goal.goal_id.clone(),
                            game: goal.game,
                            playtype: goal.playtype,
                        },
                    ));
                }
                writes.push(updated);
                deltas.push(delta);
            }
            Ok(None) => {}
            Err(err) => {
                warn!(user_id, goal_id = %goal.goal_id, name = %goal.name, error = %err, "failed to process goal, skipping");
            }
        }
    }

    if writes.is_empty() {
        return Ok(deltas);
    }

    let report = db.goal_subs.bulk_upsert(writes).await;
    if !report.failed.is_empty() {
        warn!(user_id, failed = report.failed.len(), "some goal subscriptions were not written");
    }
    for (key, event) in announcements {
        if report.failed.iter().all(|(failed, _)| *failed != key) {
            emit_logged(sink, event);
        }
    }

    Ok(deltas)
}

pub async fn get_and_update_users_goals(
    db: &Database,
    sink: &dyn EventSink,
    game: Game,
    user_id: UserId,
    touched: &BTreeSet<String>,
) -> Result<Vec<GoalDelta>, EngineError> {
    let pairs = get_relevant_goals(db, game, user_id, touched).await?;
    if pairs.is_empty() {
        return Ok(Vec::new());
    }
    debug!(user_id, %game, goals = pairs.len(), "found relevant goals");
    update_goals_for_user(db, sink, &pairs, user_id).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{mk_chart, mk_pb};
    use scorebook_core::{FolderChartLookup, GoalCriteria};

    fn mk_goal(goal_id: &str, charts: GoalCharts, mode: GoalMode, key: &str, value: f64) -> Goal {
        Goal {
            goal_id: goal_id.to_string(),
            game: Game::Iidx,
            playtype: Playtype::Sp,
            name: goal_id.to_string(),
            charts,
            criteria: GoalCriteria {
                mode,
                key: key.to_string(),
                value,
                count_num: None,
            },
        }
    }

    fn lamp_pb(user_id: UserId, chart_id: &str, lamp_index: usize, lamp: &str) -> PbScore {
        let mut pb = mk_pb(user_id, chart_id, 80.0);
        pb.score_data.lamp_index = lamp_index;
        pb.score_data.lamp = lamp.to_string();
        pb
    }

    #[tokio::test]
    async fn single_goal_reports_threshold_below_and_no_data() {
        let db = Database::in_memory();
        let goal = mk_goal(
            "hc",
            GoalCharts::Single("c1".into()),
            GoalMode::Single,
            "scoreData.lampIndex",
            5.0,
        );

        let none = evaluate_goal_for_user(&db, &goal, 1).await.expect("eval");
        assert!(!none.achieved);
        assert_eq!(none.progress, None);
        assert_eq!(none.progress_human, "NO DATA");
        assert_eq!(none.out_of_human, "HARD CLEAR");

        let mut below = lamp_pb(1, "c1", 4, "CLEAR");
        below.score_data.hit_meta.insert("bp".into(), 12.0);
        db.personal_bests.upsert(below).await.expect("upsert");
        let eval = evaluate_goal_for_user(&db, &goal, 1).await.expect("eval");
        assert!(!eval.achieved);
        assert_eq!(eval.progress, Some(4.0));
        assert_eq!(eval.progress_human, "CLEAR (BP: 12)");

        db.personal_bests
            .upsert(lamp_pb(1, "c1", 5, "HARD CLEAR"))
            .await
            .expect("upsert");
        let eval = evaluate_goal_for_user(&db, &goal, 1).await.expect("eval");
        assert!(eval.achieved);
        assert_eq!(eval.progress, Some(5.0));
        assert_eq!(eval.out_of, 5.0);
        assert_eq!(eval.progress_human, "HARD CLEAR (BP: N/A)");
    }

    #[tokio::test]
    async fn proportion_on_any_tracks_the_catalogue() {
        let db = Database::in_memory();
        let mut goal = mk_goal("half", GoalCharts::Any, GoalMode::Proportion, "scoreData.percent", 70.0);
        goal.criteria.count_num = Some(0.5);

        db.charts
            .bulk_upsert(vec![
                mk_chart("c1", Game::Iidx, Playtype::Sp, 10.0),
                mk_chart("c2", Game::Iidx, Playtype::Sp, 11.0),
            ])
            .await;
        db.personal_bests.upsert(mk_pb(1, "c1", 80.0)).await.expect("upsert");

        let eval = evaluate_goal_for_user(&db, &goal, 1).await.expect("eval");
        assert_eq!((eval.progress, eval.out_of, eval.achieved), (Some(1.0), 1.0, true));

        db.charts
            .bulk_upsert(vec![
                mk_chart("c3", Game::Iidx, Playtype::Sp, 12.0),
                mk_chart("c4", Game::Iidx, Playtype::Sp, 12.0),
                mk_chart("other", Game::Iidx, Playtype::Dp, 12.0),
            ])
            .await;
        let eval = evaluate_goal_for_user(&db, &goal, 1).await.expect("eval");
        assert_eq!((eval.progress, eval.out_of, eval.achieved), (Some(1.0), 2.0, false));
        assert_eq!(eval.out_of_human, "2");
    }

    #[tokio::test]
    async fn abs_goal_on_a_folder() {
        let db = Database::in_memory();
        let mut goal = mk_goal(
            "folder-aaa",
            GoalCharts::Folder("f1".into()),
            GoalMode::Abs,
            "scoreData.percent",
            88.8,
        );
        goal.criteria.count_num = Some(2.0);
        db.folder_chart_lookup
            .bulk_upsert(vec![
                FolderChartLookup { folder_id: "f1".into(), chart_id: "c1".into() },
                FolderChartLookup { folder_id: "f1".into(), chart_id: "c2".into() },
            ])
            .await;
        db.personal_bests
            .bulk_upsert(vec![mk_pb(1, "c1", 90.0), mk_pb(1, "c2", 95.0), mk_pb(1, "c3", 99.0)])
            .await;

        let eval = evaluate_goal_for_user(&db, &goal, 1).await.expect("eval");
        assert!(eval.achieved);
        assert_eq!(eval.progress, Some(2.0));
    }

    #[tokio::test]
    async fn multi_goal_counts_only_its_charts() {
        let db = Database::in_memory();
        let mut goal = mk_goal(
            "pair",
            GoalCharts::Multi(vec!["c1".into(), "c2".into()]),
            GoalMode::Abs,
            "scoreData.percent",
            85.0,
        );
        goal.criteria.count_num = Some(2.0);
        db.goals.upsert(goal.clone()).await.expect("goal");
        db.goal_subs.upsert(UserGoal::fresh(1, &goal)).await.expect("sub");
        db.personal_bests
            .bulk_upsert(vec![mk_pb(1, "c1", 90.0), mk_pb(1, "c2", 80.0), mk_pb(1, "c3", 99.0)])
            .await;

        assert_eq!(
            resolve_goal_charts(&db, &goal).await.expect("charts"),
            Some(vec!["c1".to_string(), "c2".to_string()])
        );
        let eval = evaluate_goal_for_user(&db, &goal, 1).await.expect("eval");
        assert_eq!((eval.progress, eval.out_of, eval.achieved), (Some(1.0), 2.0, false));

        let touched = BTreeSet::from(["c2".to_string()]);
        let pairs = get_relevant_goals(&db, Game::Iidx, 1, &touched).await.expect("relevant");
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].0.goal_id, "pair");

        let elsewhere = BTreeSet::from(["c3".to_string()]);
        assert!(get_relevant_goals(&db, Game::Iidx, 1, &elsewhere)
            .await
            .expect("relevant")
            .is_empty());
    }

    #[tokio::test]
    async fn proportion_floors_against_the_chart_set_size() {
        let db = Database::in_memory();
        db.personal_bests
            .bulk_upsert(vec![mk_pb(1, "c1", 90.0), mk_pb(1, "c2", 91.0), mk_pb(1, "c4", 92.0)])
            .await;

        let mut multi = mk_goal(
            "most",
            GoalCharts::Multi(vec!["c1".into(), "c2".into(), "c3".into()]),
            GoalMode::Proportion,
            "scoreData.percent",
            85.0,
        );
        multi.criteria.count_num = Some(0.7);
        let eval = evaluate_goal_for_user(&db, &multi, 1).await.expect("eval");
        assert_eq!((eval.progress, eval.out_of, eval.achieved), (Some(2.0), 2.0, true));
        assert_eq!(eval.out_of_human, "2");

        db.folder_chart_lookup
            .bulk_upsert(
                ["c1", "c2", "c3", "c4", "c5"]
                    .into_iter()
                    .map(|chart_id| FolderChartLookup {
                        folder_id: "f1".into(),
                        chart_id: chart_id.into(),
                    })
                    .collect(),
            )
            .await;
        let mut folder = mk_goal(
            "folder-half",
            GoalCharts::Folder("f1".into()),
            GoalMode::Proportion,
            "scoreData.percent",
            91.0,
        );
        folder.criteria.count_num = Some(0.5);
        let eval = evaluate_goal_for_user(&db, &folder, 1).await.expect("eval");
        assert_eq!((eval.progress, eval.out_of, eval.achieved), (Some(2.0), 2.0, true));
    }

    #[tokio::test]
    async fn unknown_key_and_missing_count_are_errors() {
        let db = Database::in_memory();
        let goal = mk_goal("bad", GoalCharts::Any, GoalMode::Single, "scoreData.hitMeta.bp", 1.0);
        assert!(matches!(
            evaluate_goal_for_user(&db, &goal, 1).await,
            Err(EngineError::UnknownMetricKey(_))
        ));

        let goal = mk_goal("bad-abs", GoalCharts::Any, GoalMode::Abs, "scoreData.score", 1.0);
        assert!(matches!(
            evaluate_goal_for_user(&db, &goal, 1).await,
            Err(EngineError::InvalidGoal { .. })
        ));
    }

    #[test]
    fn percent_and_grade_humanise() {
        assert_eq!(
            humanise_goal_progress(Game::Iidx, Playtype::Sp, "scoreData.percent", 88.888, None)
                .expect("human"),
            "88.89%"
        );
        assert_eq!(
            humanise_goal_progress(Game::Iidx, Playtype::Sp, "scoreData.gradeIndex", 7.0, None)
                .expect("human"),
            "AAA"
        );
        assert_eq!(
            humanise_goal_progress(Game::Sdvx, Playtype::Single, "scoreData.score", 9_900_000.0, None)
                .expect("human"),
            "9900000"
        );
    }

    #[tokio::test]
    async fn unchanged_goal_is_a_no_op() {
        let db = Database::in_memory();
        let sink = crate::events::NoopEventSink;
        let goal = mk_goal(
            "pct",
            GoalCharts::Single("c1".into()),
            GoalMode::Single,
            "scoreData.percent",
            90.0,
        );
        db.goals.upsert(goal.clone()).await.expect("goal");
        db.goal_subs.upsert(UserGoal::fresh(1, &goal)).await.expect("sub");
        db.personal_bests.upsert(mk_pb(1, "c1", 95.0)).await.expect("pb");

        let touched = BTreeSet::from(["c1".to_string()]);
        let first = get_and_update_users_goals(&db, &sink, Game::Iidx, 1, &touched)
            .await
            .expect("goals");
        assert_eq!(first.len(), 1);
        assert!(first[0].newly_achieved());

        let stored = db
            .goal_subs
            .find_one(&Filter::new().eq("goalId", "pct"), &FindOptions::default())
            .await
            .expect("find")
            .expect("sub");
        assert!(stored.achieved);
        assert!(stored.time_achieved.is_some());

        let second = get_and_update_users_goals(&db, &sink, Game::Iidx, 1, &touched)
            .await
            .expect("goals");
        assert!(second.is_empty());

        let unrelated = BTreeSet::from(["c9".to_string()]);
        let pairs = get_relevant_goals(&db, Game::Iidx, 1, &unrelated).await.expect("relevant");
        assert!(pairs.is_empty());
    }
}
