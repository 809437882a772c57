//! Chart rankings for personal bests.

use scorebook_core::UserId;
use scorebook_storage::{Accumulator, Database, Filter, FindOptions, SortOrder};
use serde::Serialize;
use serde_json::json;
use tracing::debug;

use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RankingInfo {
    pub out_of: u64,
    pub ranking: u64,
}

/// Where a PB with `percent` would sit among every other user's PB on the chart.
///
/// The requester is excluded so the result is the same whether or not they already
/// have a PB here. Other users' PBs tied with the candidate count against it, except
/// that tying the chart's best score still ranks first.
pub async fn get_ranking_info(
    db: &Database,
    chart_id: &str,
    exclude_user_id: UserId,
    percent: f64,
) -> Result<RankingInfo, EngineError> {
    let aggregated = db
        .personal_bests
        .aggregate(
            &Filter::new()
                .eq("chartId", chart_id)
                .ne("userId", exclude_user_id),
            &[
                Accumulator::Count,
                Accumulator::CountWhere(Filter::new().gte("scoreData.percent", percent)),
                Accumulator::Max("scoreData.percent".into()),
            ],
        )
        .await?;

    let Some(values) = aggregated else {
        return Ok(RankingInfo { out_of: 1, ranking: 1 });
    };
    let out_of = values.first().copied().unwrap_or(0.0) as u64;
    let at_or_above = values.get(1).copied().unwrap_or(0.0) as u64;
    let best = values.get(2).copied().unwrap_or(f64::NAN);

    let ranking = if best.is_nan() || percent >= best {
        1
    } else {
        at_or_above + 1
    };
    Ok(RankingInfo {
        out_of: out_of + 1,
        ranking,
    })
}

/// Second phase of a PB write: recomputes and stores the ranking of an existing PB.
/// Returns `None` when the PB does not exist.
pub async fn refresh_pb_ranking(
    db: &Database,
    user_id: UserId,
    chart_id: &str,
) -> Result<Option<RankingInfo>, EngineError> {
    let pb_filter = Filter::new().eq("userId", user_id).eq("chartId", chart_id);
    let Some(pb) = db
        .personal_bests
        .find_one(&pb_filter, &FindOptions::default())
        .await?
    else {
        return Ok(None);
    };

    let info = get_ranking_info(db, chart_id, user_id, pb.score_data.percent).await?;
    if pb.ranking != info.ranking || pb.out_of != info.out_of {
        db.personal_bests
            .update_many(
                &pb_filter,
                &[
                    ("ranking".to_string(), json!(info.ranking)),
                    ("outOf".to_string(), json!(info.out_of)),
                ],
            )
            .await?;
    }
    Ok(Some(info))
}

/// Re-ranks every PB on a chart by percent, newest first among ties.
/// Returns how many PBs changed.
pub async fn update_chart_ranking(db: &Database, chart_id: &str) -> Result<usize, EngineError> {
    let pbs = db
        .personal_bests
        .find(
            &Filter::new().eq("chartId", chart_id),
            &FindOptions::default()
                .sort_by("scoreData.percent", SortOrder::Desc)
                .sort_by("timeAchieved", SortOrder::Desc),
        )
        .await?;

    let out_of = pbs.len() as u64;
    let changed: Vec<_> = pbs
        .into_iter()
        .enumerate()
        .filter_map(|(i, mut pb)| {
            let ranking = i as u64 + 1;
            if pb.ranking == ranking && pb.out_of == out_of {
                return None;
            }
            pb.ranking = ranking;
            pb.out_of = out_of;
            Some(pb)
        })
        .collect();

    let count = changed.len();
    if count > 0 {
        let report = db.personal_bests.bulk_upsert(changed).await;
        debug!(chart_id, updated = report.upserted, failed = report.failed.len(), "re-ranked chart");
    }
    Ok(count)
}
