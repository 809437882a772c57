//! Import orchestration: hydrate and insert scores, then recompute everything derived
//! from them.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use scorebook_core::{
    gpt_config, Chart, ClassDelta, DryScore, Folder, Game, Goal, Milestone, PbScore, Playtype,
    Score, ScoreData, Song, UserGoal, UserId, UserMilestone,
};
use scorebook_storage::{
    Database, Filter, FindOptions, InsertOutcome, SnapshotStore, StoredSnapshot,
};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::calculated::{calculate_score_data, derive_percent};
use crate::classes::{update_user_game_stats, ClassHandler};
use crate::error::EngineError;
use crate::events::{EventSink, NoopEventSink};
use crate::folders::initialise_folder_chart_lookup;
use crate::goals::{get_and_update_users_goals, GoalDelta};
use crate::identity::create_score_id;
use crate::milestones::{update_users_milestones, MilestoneDelta};
use crate::pb::{create_pb_doc, MergeHooks};
use crate::ranking::{refresh_pb_ranking, update_chart_ranking};
use crate::registry::StrategyRegistry;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub workspace_root: PathBuf,
    pub state_path: PathBuf,
    pub reports_dir: PathBuf,
    /// Re-rank every PB on a touched chart instead of only the importing user's.
    pub rerank_whole_chart: bool,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let workspace_root = std::env::var("SCOREBOOK_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        Self {
            state_path: std::env::var("SCOREBOOK_STATE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| workspace_root.join("state").join("scorebook.json")),
            reports_dir: std::env::var("SCOREBOOK_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| workspace_root.join("reports")),
            rerank_whole_chart: std::env::var("SCOREBOOK_RERANK_WHOLE_CHART")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            workspace_root,
        }
    }

    /// Everything under one directory; used by tests and throwaway runs.
    pub fn rooted_at(root: impl Into<PathBuf>) -> Self {
        let workspace_root = root.into();
        Self {
            state_path: workspace_root.join("state").join("scorebook.json"),
            reports_dir: workspace_root.join("reports"),
            rerank_whole_chart: false,
            workspace_root,
        }
    }
}

/// Reference data plus subscriptions, as loaded from a YAML catalogue.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Catalog {
    #[serde(default)]
    pub songs: Vec<Song>,
    #[serde(default)]
    pub charts: Vec<Chart>,
    #[serde(default)]
    pub folders: Vec<Folder>,
    #[serde(default)]
    pub goals: Vec<Goal>,
    #[serde(default)]
    pub milestones: Vec<Milestone>,
    #[serde(default)]
    pub subscriptions: Vec<CatalogSubscription>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogSubscription {
    pub user_id: UserId,
    #[serde(default)]
    pub goals: Vec<String>,
    /// Subscribing to a milestone also subscribes to each of its goals.
    #[serde(default)]
    pub milestones: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogLoadReport {
    pub charts: usize,
    pub songs: usize,
    pub folders: usize,
    pub goals: usize,
    pub milestones: usize,
    pub new_subscriptions: usize,
    pub folder_lookup_rows: usize,
}

impl Catalog {
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        serde_yaml::from_str(raw).context("parsing catalogue yaml")
    }

    pub async fn from_yaml_path(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&raw).with_context(|| format!("loading catalogue {}", path.display()))
    }

    /// Upserts reference data, adds missing subscriptions (existing snapshots are kept)
    /// and rebuilds the folder lookup.
    pub async fn load_into(&self, db: &Database) -> Result<CatalogLoadReport> {
        let mut report = CatalogLoadReport {
            songs: db.songs.bulk_upsert(self.songs.clone()).await.upserted,
            charts: db.charts.bulk_upsert(self.charts.clone()).await.upserted,
            folders: db.folders.bulk_upsert(self.folders.clone()).await.upserted,
            goals: db.goals.bulk_upsert(self.goals.clone()).await.upserted,
            milestones: db.milestones.bulk_upsert(self.milestones.clone()).await.upserted,
            ..Default::default()
        };

        for sub in &self.subscriptions {
            let mut goal_ids: BTreeSet<&String> = sub.goals.iter().collect();
            for milestone_id in &sub.milestones {
                let milestone = self
                    .milestones
                    .iter()
                    .find(|m| &m.milestone_id == milestone_id)
                    .with_context(|| format!("subscription to unknown milestone {milestone_id}"))?;
                goal_ids.extend(milestone.goal_ids());

                let outcome = db
                    .milestone_subs
                    .insert(UserMilestone {
                        user_id: sub.user_id,
                        milestone_id: milestone.milestone_id.clone(),
                        game: milestone.game,
                        playtype: milestone.playtype,
                        achieved: false,
                        progress: 0,
                        time_achieved: None,
                        last_interaction: None,
                    })
                    .await?;
                if outcome == InsertOutcome::Inserted {
                    report.new_subscriptions += 1;
                }
            }

            for goal_id in goal_ids {
                let goal = self
                    .goals
                    .iter()
                    .find(|g| &g.goal_id == goal_id)
                    .with_context(|| format!("subscription to unknown goal {goal_id}"))?;
                if db.goal_subs.insert(UserGoal::fresh(sub.user_id, goal)).await? == InsertOutcome::Inserted {
                    report.new_subscriptions += 1;
                }
            }
        }

        report.folder_lookup_rows = initialise_folder_chart_lookup(db).await?;
        Ok(report)
    }
}

/// One converter output: the normalized score and the chart it was matched to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConvertedScore {
    pub chart_id: String,
    pub dry_score: DryScore,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreImportError {
    pub chart_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportTimings {
    pub insert_ms: u64,
    pub pb_ms: u64,
    pub ranking_ms: u64,
    pub stats_ms: u64,
    pub goals_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSummary {
    pub import_id: Uuid,
    pub user_id: UserId,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub inserted: Vec<String>,
    pub duplicates: Vec<String>,
    pub errors: Vec<ScoreImportError>,
    pub personal_bests: usize,
    pub class_deltas: Vec<ClassDelta>,
    pub goal_deltas: Vec<GoalDelta>,
    pub milestone_deltas: Vec<MilestoneDelta>,
    pub timings: ImportTimings,
}

/// Turns a converter's output into a storable score.
pub fn hydrate_score(
    user_id: UserId,
    dry: &DryScore,
    chart: &Chart,
    song: &Song,
) -> Result<Score, EngineError> {
    if chart.game != dry.game || chart.playtype != dry.playtype {
        return Err(EngineError::ChartMismatch {
            chart_id: chart.chart_id.clone(),
            game: chart.game,
            playtype: chart.playtype,
        });
    }
    if song.song_id != chart.song_id {
        return Err(EngineError::SongNotFound(chart.song_id));
    }

    let config = gpt_config(dry.game, dry.playtype)
        .ok_or(EngineError::UnsupportedPlaytype(dry.game, dry.playtype))?;
    let invalid = |field: &'static str, value: &str| EngineError::InvalidEnum {
        field,
        value: value.to_string(),
        game: dry.game,
        playtype: dry.playtype,
    };
    let data = &dry.score_data;
    let grade_index = config
        .grade_index(&data.grade)
        .ok_or_else(|| invalid("grade", &data.grade))?;
    let lamp_index = config
        .lamp_index(&data.lamp)
        .ok_or_else(|| invalid("lamp", &data.lamp))?;

    let percent = data
        .percent
        .or_else(|| derive_percent(dry.game, chart, data.score))
        .ok_or_else(|| EngineError::MissingPercent(chart.chart_id.clone()))?;
    let score_data = ScoreData {
        score: data.score,
        percent,
        grade: data.grade.clone(),
        grade_index,
        lamp: data.lamp.clone(),
        lamp_index,
        hit_data: data.hit_data.clone(),
        hit_meta: data.hit_meta.clone(),
    };

    Ok(Score {
        score_id: create_score_id(user_id, dry, &chart.chart_id),
        user_id,
        chart_id: chart.chart_id.clone(),
        song_id: chart.song_id,
        game: dry.game,
        playtype: dry.playtype,
        service: dry.service.clone(),
        import_type: dry.import_type.clone(),
        is_primary: chart.is_primary,
        highlight: false,
        comment: dry.comment.clone(),
        time_achieved: dry.time_achieved,
        time_added: Utc::now(),
        calculated_data: calculate_score_data(dry.game, chart, &score_data),
        score_data,
        score_meta: dry.score_meta.clone(),
    })
}

/// Collaborators handed to the pipeline once, at construction.
pub struct ImportCapabilities {
    pub merge_hooks: MergeHooks,
    pub registry: StrategyRegistry,
    pub class_handler: Option<Arc<dyn ClassHandler>>,
    pub sink: Arc<dyn EventSink>,
}

impl Default for ImportCapabilities {
    fn default() -> Self {
        Self {
            merge_hooks: MergeHooks::builtin(),
            registry: StrategyRegistry::builtin(),
            class_handler: None,
            sink: Arc::new(NoopEventSink),
        }
    }
}

impl ImportCapabilities {
    pub fn with_class_handler(mut self, handler: Arc<dyn ClassHandler>) -> Self {
        self.class_handler = Some(handler);
        self
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_merge_hooks(mut self, hooks: MergeHooks) -> Self {
        self.merge_hooks = hooks;
        self
    }
}

pub struct ImportPipeline {
    config: EngineConfig,
    db: Database,
    caps: Arc<ImportCapabilities>,
}

// Awaits every spawned task; a task that panicked or was cancelled is logged and dropped.
async fn join_spawned<T>(what: &str, handles: Vec<(String, JoinHandle<Result<T, EngineError>>)>) -> Vec<T> {
    let (keys, handles): (Vec<_>, Vec<_>) = handles.into_iter().unzip();
    let mut out = Vec::with_capacity(keys.len());
    for (key, joined) in keys.into_iter().zip(join_all(handles).await) {
        match joined.map_err(|err| EngineError::Task(err.to_string())).and_then(|r| r) {
            Ok(value) => out.push(value),
            Err(err) => warn!(%key, error = %err, "{what} failed"),
        }
    }
    out
}

impl ImportPipeline {
    pub fn new(config: EngineConfig, db: Database) -> Self {
        Self {
            config,
            db,
            caps: Arc::new(ImportCapabilities::default()),
        }
    }

    pub fn with_capabilities(mut self, caps: ImportCapabilities) -> Self {
        self.caps = Arc::new(caps);
        self
    }

    /// Opens the store persisted at `config.state_path`, or an empty one.
    pub async fn open(config: EngineConfig) -> Result<Self> {
        let db = Database::in_memory();
        let store = SnapshotStore::new(config.state_path.clone());
        if let Some(snapshot) = store.load().await? {
            let report = db.restore(snapshot).await;
            info!(path = %store.path().display(), restored = report.upserted, failed = report.failed.len(), "restored state");
        }
        Ok(Self::new(config, db))
    }

    pub async fn save_state(&self) -> Result<StoredSnapshot> {
        let snapshot = self.db.snapshot().await.context("snapshotting database")?;
        SnapshotStore::new(self.config.state_path.clone())
            .save(&snapshot)
            .await
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub async fn import_batch(&self, user_id: UserId, batch: Vec<ConvertedScore>) -> Result<ImportSummary> {
        let import_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("import", %import_id, user_id);
        async move {
            info!(scores = batch.len(), "starting import");
            let mut timings = ImportTimings::default();

            let clock = Instant::now();
            let (inserted, duplicates, errors) = self.insert_scores(user_id, batch).await?;
            timings.insert_ms = clock.elapsed().as_millis() as u64;

            let touched: BTreeSet<String> = inserted.iter().map(|s| s.chart_id.clone()).collect();
            let pairs: BTreeSet<(Game, Playtype)> =
                inserted.iter().map(|s| (s.game, s.playtype)).collect();

            let clock = Instant::now();
            let personal_bests = self.update_personal_bests(user_id, &touched).await;
            timings.pb_ms = clock.elapsed().as_millis() as u64;

            let clock = Instant::now();
            self.refresh_rankings(user_id, &touched).await;
            timings.ranking_ms = clock.elapsed().as_millis() as u64;

            let clock = Instant::now();
            let class_deltas = self.update_game_stats(user_id, &pairs).await;
            timings.stats_ms = clock.elapsed().as_millis() as u64;

            let clock = Instant::now();
            let games: BTreeSet<Game> = pairs.iter().map(|(game, _)| *game).collect();
            let mut goal_deltas = Vec::new();
            for game in games {
                match get_and_update_users_goals(&self.db, self.caps.sink.as_ref(), game, user_id, &touched).await {
                    Ok(deltas) => goal_deltas.extend(deltas),
                    Err(err) => warn!(%game, error = %err, "goal update failed"),
                }
            }
            let changed_goals: BTreeSet<String> = goal_deltas.iter().map(|d| d.goal_id.clone()).collect();
            let milestone_deltas =
                match update_users_milestones(&self.db, self.caps.sink.as_ref(), user_id, &changed_goals).await {
                    Ok(deltas) => deltas,
                    Err(err) => {
                        warn!(error = %err, "milestone update failed");
                        Vec::new()
                    }
                };
            timings.goals_ms = clock.elapsed().as_millis() as u64;

            let summary = ImportSummary {
                import_id,
                user_id,
                started_at,
                finished_at: Utc::now(),
                inserted: inserted.into_iter().map(|s| s.score_id).collect(),
                duplicates,
                errors,
                personal_bests,
                class_deltas,
                goal_deltas,
                milestone_deltas,
                timings,
            };
            info!(
                inserted = summary.inserted.len(),
                duplicates = summary.duplicates.len(),
                errors = summary.errors.len(),
                personal_bests = summary.personal_bests,
                "import complete"
            );
            Ok::<_, anyhow::Error>(summary)
        }
        .instrument(span)
        .await
    }

    async fn insert_scores(
        &self,
        user_id: UserId,
        batch: Vec<ConvertedScore>,
    ) -> Result<(Vec<Score>, Vec<String>, Vec<ScoreImportError>)> {
        let mut inserted = Vec::new();
        let mut duplicates = Vec::new();
        let mut errors = Vec::new();
        let mut charts: BTreeMap<String, Option<(Chart, Option<Song>)>> = BTreeMap::new();

        for converted in batch {
            if !charts.contains_key(&converted.chart_id) {
                let resolved = self.load_chart_and_song(&converted.chart_id).await?;
                charts.insert(converted.chart_id.clone(), resolved);
            }

            let hydrated = match charts.get(&converted.chart_id) {
                Some(Some((chart, Some(song)))) => hydrate_score(user_id, &converted.dry_score, chart, song),
                Some(Some((chart, None))) => Err(EngineError::SongNotFound(chart.song_id)),
                _ => Err(EngineError::ChartNotFound(converted.chart_id.clone())),
            };

            let score = match hydrated {
                Ok(score) => score,
                Err(err) => {
                    warn!(chart_id = %converted.chart_id, error = %err, "failed to hydrate score");
                    errors.push(ScoreImportError {
                        chart_id: converted.chart_id,
                        message: err.to_string(),
                    });
                    continue;
                }
            };

            match self.db.scores.insert(score.clone()).await? {
                InsertOutcome::Inserted => inserted.push(score),
                InsertOutcome::Duplicate => {
                    debug!(score_id = %score.score_id, "score already imported");
                    duplicates.push(score.score_id);
                }
            }
        }
        Ok((inserted, duplicates, errors))
    }

    async fn load_chart_and_song(&self, chart_id: &str) -> Result<Option<(Chart, Option<Song>)>> {
        let Some(chart) = self
            .db
            .charts
            .find_one(&Filter::new().eq("chartId", chart_id), &FindOptions::default())
            .await?
        else {
            return Ok(None);
        };
        let song = self
            .db
            .songs
            .find_one(
                &Filter::new()
                    .eq("songId", chart.song_id)
                    .eq("game", chart.game.as_str()),
                &FindOptions::default(),
            )
            .await?;
        Ok(Some((chart, song)))
    }

    async fn update_personal_bests(&self, user_id: UserId, touched: &BTreeSet<String>) -> usize {
        let handles = touched
            .iter()
            .map(|chart_id| {
                let db = self.db.clone();
                let caps = self.caps.clone();
                let chart = chart_id.clone();
                let span = info_span!("pb", chart_id = %chart);
                let handle = tokio::spawn(
                    async move { create_pb_doc(&db, &caps.merge_hooks, user_id, &chart).await }
                        .instrument(span),
                );
                (chart_id.clone(), handle)
            })
            .collect();

        let pbs: Vec<PbScore> = join_spawned("PB recompute", handles)
            .await
            .into_iter()
            .flatten()
            .collect();
        if pbs.is_empty() {
            if !touched.is_empty() {
                warn!(user_id, charts = touched.len(), "no PBs were produced for this import");
            }
            return 0;
        }

        let report = self.db.personal_bests.bulk_upsert(pbs).await;
        for (key, err) in &report.failed {
            warn!(%key, error = %err, "PB write failed");
        }
        report.upserted
    }

    async fn refresh_rankings(&self, user_id: UserId, touched: &BTreeSet<String>) {
        let whole_chart = self.config.rerank_whole_chart;
        let handles = touched
            .iter()
            .map(|chart_id| {
                let db = self.db.clone();
                let chart = chart_id.clone();
                let handle = tokio::spawn(async move {
                    if whole_chart {
                        update_chart_ranking(&db, &chart).await.map(|_| ())
                    } else {
                        refresh_pb_ranking(&db, user_id, &chart).await.map(|_| ())
                    }
                });
                (chart_id.clone(), handle)
            })
            .collect();
        join_spawned("ranking refresh", handles).await;
    }

    async fn update_game_stats(&self, user_id: UserId, pairs: &BTreeSet<(Game, Playtype)>) -> Vec<ClassDelta> {
        let handles = pairs
            .iter()
            .map(|&(game, playtype)| {
                let db = self.db.clone();
                let caps = self.caps.clone();
                let handle = tokio::spawn(async move {
                    update_user_game_stats(
                        &db,
                        &caps.registry,
                        caps.class_handler.as_deref(),
                        caps.sink.as_ref(),
                        user_id,
                        game,
                        playtype,
                    )
                    .await
                });
                (format!("{game}:{playtype}"), handle)
            })
            .collect();

        join_spawned("game stats update", handles)
            .await
            .into_iter()
            .flatten()
            .collect()
    }

    /// Writes `import_summary.json` under `<reports_dir>/<import_id>/`.
    pub async fn write_reports(&self, summary: &ImportSummary) -> Result<PathBuf> {
        let reports_dir = self.config.reports_dir.join(summary.import_id.to_string());
        fs::create_dir_all(&reports_dir)
            .await
            .with_context(|| format!("creating {}", reports_dir.display()))?;

        let bytes = serde_json::to_vec_pretty(summary).context("serializing import summary")?;
        let path = reports_dir.join("import_summary.json");
        fs::write(&path, bytes)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(path)
    }
}
