//! Profile-level ratings aggregated over a user's primary PBs.

use futures::future::try_join_all;
use scorebook_core::{Chart, Game, PbScore, Playtype, Ratings, UserId};
use scorebook_storage::{Accumulator, Database, Filter, FindOptions, SortOrder};
use tracing::debug;

use crate::error::EngineError;

#[derive(Debug, Clone, PartialEq)]
pub enum RatingStrategy {
    /// Mean of the best `n` values. Always divides by `n`, so a short profile is
    /// dragged down as if the missing slots were zero.
    MeanBestN { metric: &'static str, n: usize },
    SumBestN { metric: &'static str, n: usize },
    SumAll { metric: &'static str },
    /// Best `hot_n` among charts carrying `hot_flag` plus best `cold_n` among the rest.
    PartitionedPool {
        metric: &'static str,
        hot_flag: &'static str,
        hot_n: usize,
        cold_n: usize,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct NamedRating {
    pub name: &'static str,
    pub strategy: RatingStrategy,
}

impl NamedRating {
    pub const fn new(name: &'static str, strategy: RatingStrategy) -> Self {
        Self { name, strategy }
    }
}

pub fn mean_best_n(values: &[f64], n: usize) -> f64 {
    if n == 0 {
        return 0.0;
    }
    sum_best_n(values, n) / n as f64
}

pub fn sum_best_n(values: &[f64], n: usize) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| b.total_cmp(a));
    sorted.into_iter().take(n).sum()
}

fn metric_path(metric: &str) -> String {
    format!("calculatedData.{metric}")
}

fn primary_pbs(user_id: UserId, game: Game, playtype: Playtype, metric: &str) -> Filter {
    Filter::new()
        .eq("userId", user_id)
        .eq("game", game.as_str())
        .eq("playtype", playtype.as_str())
        .eq("isPrimary", true)
        .is_number(metric_path(metric))
}

async fn best_values(
    db: &Database,
    filter: &Filter,
    metric: &str,
    limit: usize,
) -> Result<Vec<f64>, EngineError> {
    let pbs: Vec<PbScore> = db
        .personal_bests
        .find(
            filter,
            &FindOptions::default()
                .sort_by(metric_path(metric), SortOrder::Desc)
                .limit(limit),
        )
        .await?;
    Ok(pbs
        .iter()
        .filter_map(|pb| pb.calculated_data.get(metric).copied())
        .collect())
}

impl RatingStrategy {
    pub async fn evaluate(
        &self,
        db: &Database,
        user_id: UserId,
        game: Game,
        playtype: Playtype,
    ) -> Result<f64, EngineError> {
        match self {
            RatingStrategy::MeanBestN { metric, n } => {
                let filter = primary_pbs(user_id, game, playtype, metric);
                let values = best_values(db, &filter, metric, *n).await?;
                Ok(mean_best_n(&values, *n))
            }
            RatingStrategy::SumBestN { metric, n } => {
                let filter = primary_pbs(user_id, game, playtype, metric);
                let values = best_values(db, &filter, metric, *n).await?;
                Ok(sum_best_n(&values, *n))
            }
            RatingStrategy::SumAll { metric } => {
                let filter = primary_pbs(user_id, game, playtype, metric);
                let sum = db
                    .personal_bests
                    .aggregate(&filter, &[Accumulator::Sum(metric_path(metric))])
                    .await?
                    .and_then(|values| values.first().copied())
                    .unwrap_or(0.0);
                Ok(sum)
            }
            RatingStrategy::PartitionedPool {
                metric,
                hot_flag,
                hot_n,
                cold_n,
            } => {
                let hot_charts: Vec<Chart> = db
                    .charts
                    .find(
                        &Filter::new()
                            .eq("game", game.as_str())
                            .eq("playtype", playtype.as_str())
                            .eq(format!("flags.{hot_flag}"), true),
                        &FindOptions::default(),
                    )
                    .await?;
                let hot_ids: Vec<String> = hot_charts.into_iter().map(|c| c.chart_id).collect();

                let base = primary_pbs(user_id, game, playtype, metric);
                let hot = best_values(
                    db,
                    &base.clone().is_in("chartId", hot_ids.iter().cloned()),
                    metric,
                    *hot_n,
                )
                .await?;
                let cold = best_values(db, &base.not_in("chartId", hot_ids), metric, *cold_n).await?;

                Ok(sum_best_n(&hot, *hot_n) + sum_best_n(&cold, *cold_n))
            }
        }
    }
}

/// Evaluates every named rating for one (user, game, playtype) concurrently.
pub async fn compute_ratings(
    db: &Database,
    ratings: &[NamedRating],
    user_id: UserId,
    game: Game,
    playtype: Playtype,
) -> Result<Ratings, EngineError> {
    let values = try_join_all(
        ratings
            .iter()
            .map(|r| r.strategy.evaluate(db, user_id, game, playtype)),
    )
    .await?;

    let out: Ratings = ratings
        .iter()
        .zip(values)
        .map(|(r, value)| (r.name.to_string(), value))
        .collect();
    debug!(user_id, %game, %playtype, ?out, "computed ratings");
    Ok(out)
}
