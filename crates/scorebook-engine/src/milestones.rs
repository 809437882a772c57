//! Milestones: groups of goals completed once enough of them are achieved.

use std::collections::BTreeSet;

use chrono::Utc;
use scorebook_core::{Milestone, MilestoneMode, Playtype, UserId, UserMilestone};
use scorebook_storage::{Database, Document, Filter, FindOptions};
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::events::{emit_logged, EngineEvent, EventSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MilestoneEvaluation {
    pub achieved: bool,
    pub progress: u64,
    pub out_of: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MilestoneDelta {
    pub milestone_id: String,
    pub playtype: Playtype,
    pub old_progress: u64,
    pub new_progress: u64,
    pub achieved: bool,
}

/// How many of the milestone's goals must be achieved.
pub fn milestone_out_of(milestone: &Milestone) -> Result<u64, EngineError> {
    let goal_count = milestone.goal_ids().count() as u64;
    let value = || {
        milestone.criteria.value.ok_or_else(|| EngineError::InvalidMilestone {
            milestone_id: milestone.milestone_id.clone(),
            reason: "criteria value is required for abs and proportion".to_string(),
        })
    };

    Ok(match milestone.criteria.mode {
        MilestoneMode::All => goal_count,
        MilestoneMode::Abs => value()?.max(0.0) as u64,
        MilestoneMode::Proportion => (value()? * goal_count as f64).floor().max(0.0) as u64,
    })
}

/// Counts achieved goal subscriptions among the milestone's goals.
pub async fn evaluate_milestone_for_user(
    db: &Database,
    milestone: &Milestone,
    user_id: UserId,
) -> Result<MilestoneEvaluation, EngineError> {
    let out_of = milestone_out_of(milestone)?;
    let progress = db
        .goal_subs
        .count(
            &Filter::new()
                .eq("userId", user_id)
                .eq("achieved", true)
                .is_in("goalId", milestone.goal_ids().cloned()),
        )
        .await?;

    Ok(MilestoneEvaluation {
        achieved: progress >= out_of,
        progress,
        out_of,
    })
}

/// Re-evaluates the user's milestone subscriptions that contain any of `goal_ids`.
pub async fn update_users_milestones(
    db: &Database,
    sink: &dyn EventSink,
    user_id: UserId,
    goal_ids: &BTreeSet<String>,
) -> Result<Vec<MilestoneDelta>, EngineError> {
    if goal_ids.is_empty() {
        return Ok(Vec::new());
    }

    let subs = db
        .milestone_subs
        .find(&Filter::new().eq("userId", user_id), &FindOptions::default())
        .await?;
    if subs.is_empty() {
        return Ok(Vec::new());
    }

    let milestones: Vec<Milestone> = db
        .milestones
        .find(
            &Filter::new().is_in("milestoneId", subs.iter().map(|s| s.milestone_id.clone())),
            &FindOptions::default(),
        )
        .await?
        .into_iter()
        .filter(|m| m.goal_ids().any(|id| goal_ids.contains(id)))
        .collect();
    debug!(user_id, milestones = milestones.len(), "found relevant milestones");

    let now = Utc::now();
    let mut writes: Vec<UserMilestone> = Vec::new();
    let mut deltas = Vec::new();
    let mut announcements = Vec::new();
    for milestone in &milestones {
        let Some(sub) = subs.iter().find(|s| s.milestone_id == milestone.milestone_id) else {
            continue;
        };
        let evaluation = match evaluate_milestone_for_user(db, milestone, user_id).await {
            Ok(evaluation) => evaluation,
            Err(err) => {
                warn!(user_id, milestone_id = %milestone.milestone_id, error = %err, "failed to evaluate milestone, skipping");
                continue;
            }
        };

        if evaluation.progress == sub.progress && evaluation.achieved == sub.achieved {
            continue;
        }

        deltas.push(MilestoneDelta {
            milestone_id: milestone.milestone_id.clone(),
            playtype: milestone.playtype,
            old_progress: sub.progress,
            new_progress: evaluation.progress,
            achieved: evaluation.achieved,
        });
        let updated = UserMilestone {
            achieved: evaluation.achieved,
            progress: evaluation.progress,
            time_achieved: if evaluation.achieved {
                sub.time_achieved.or(Some(now))
            } else {
                None
            },
            last_interaction: Some(now),
            ..sub.clone()
        };
        if evaluation.achieved && !sub.achieved {
            announcements.push((
                updated.key(),
                EngineEvent::MilestoneAchieved {
                    user_id,
                    milestone_id: milestone.milestone_id.clone(),
                    game: milestone.game,
                    playtype: milestone.playtype,
                },
            ));
        }
        writes.push(updated);
    }

    if writes.is_empty() {
        return Ok(deltas);
    }

    // Only announce achievements that were actually stored.
    let report = db.milestone_subs.bulk_upsert(writes).await;
    if !report.failed.is_empty() {
        warn!(user_id, failed = report.failed.len(), "some milestone subscriptions were not written");
    }
    for (key, event) in announcements {
        if report.failed.iter().all(|(failed, _)| *failed != key) {
            emit_logged(sink, event);
        }
    }
    Ok(deltas)
}
