//! Whole-database JSON snapshots with hash-stamped atomic writes.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use scorebook_core::{
    Chart, ClassAchievement, Folder, FolderChartLookup, Goal, Milestone, PbScore, Score, Song,
    UserGameStats, UserGoal, UserMilestone,
};

use crate::{BulkWriteReport, Database, Filter, FindOptions, StoreError};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseSnapshot {
    #[serde(default)]
    pub scores: Vec<Score>,
    #[serde(default)]
    pub personal_bests: Vec<PbScore>,
    #[serde(default)]
    pub charts: Vec<Chart>,
    #[serde(default)]
    pub songs: Vec<Song>,
    #[serde(default)]
    pub folders: Vec<Folder>,
    #[serde(default)]
    pub folder_chart_lookup: Vec<FolderChartLookup>,
    #[serde(default)]
    pub goals: Vec<Goal>,
    #[serde(default)]
    pub goal_subs: Vec<UserGoal>,
    #[serde(default)]
    pub milestones: Vec<Milestone>,
    #[serde(default)]
    pub milestone_subs: Vec<UserMilestone>,
    #[serde(default)]
    pub game_stats: Vec<UserGameStats>,
    #[serde(default)]
    pub class_achievements: Vec<ClassAchievement>,
}

impl Database {
    pub async fn snapshot(&self) -> Result<DatabaseSnapshot, StoreError> {
        let all = Filter::new();
        let opts = FindOptions::default();
        Ok(DatabaseSnapshot {
            scores: self.scores.find(&all, &opts).await?,
            personal_bests: self.personal_bests.find(&all, &opts).await?,
            charts: self.charts.find(&all, &opts).await?,
            songs: self.songs.find(&all, &opts).await?,
            folders: self.folders.find(&all, &opts).await?,
            folder_chart_lookup: self.folder_chart_lookup.find(&all, &opts).await?,
            goals: self.goals.find(&all, &opts).await?,
            goal_subs: self.goal_subs.find(&all, &opts).await?,
            milestones: self.milestones.find(&all, &opts).await?,
            milestone_subs: self.milestone_subs.find(&all, &opts).await?,
            game_stats: self.game_stats.find(&all, &opts).await?,
            class_achievements: self.class_achievements.find(&all, &opts).await?,
        })
    }

    /// Upserts every document of the snapshot; returns the combined write report.
    pub async fn restore(&self, snapshot: DatabaseSnapshot) -> BulkWriteReport {
        let reports = [
            self.scores.bulk_upsert(snapshot.scores).await,
            self.personal_bests.bulk_upsert(snapshot.personal_bests).await,
            self.charts.bulk_upsert(snapshot.charts).await,
            self.songs.bulk_upsert(snapshot.songs).await,
            self.folders.bulk_upsert(snapshot.folders).await,
            self.folder_chart_lookup
                .bulk_upsert(snapshot.folder_chart_lookup)
                .await,
            self.goals.bulk_upsert(snapshot.goals).await,
            self.goal_subs.bulk_upsert(snapshot.goal_subs).await,
            self.milestones.bulk_upsert(snapshot.milestones).await,
            self.milestone_subs.bulk_upsert(snapshot.milestone_subs).await,
            self.game_stats.bulk_upsert(snapshot.game_stats).await,
            self.class_achievements
                .bulk_upsert(snapshot.class_achievements)
                .await,
        ];

        reports
            .into_iter()
            .fold(BulkWriteReport::default(), |mut acc, report| {
                acc.upserted += report.upserted;
                acc.failed.extend(report.failed);
                acc
            })
    }
}

#[derive(Debug, Clone)]
pub struct StoredSnapshot {
    pub content_hash: String,
    pub path: PathBuf,
    pub byte_size: usize,
}

/// File-backed snapshot location. Writes go to a temp file and are renamed into place.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub async fn load(&self) -> anyhow::Result<Option<DatabaseSnapshot>> {
        if !fs::try_exists(&self.path)
            .await
            .with_context(|| format!("checking snapshot path {}", self.path.display()))?
        {
            return Ok(None);
        }

        let bytes = fs::read(&self.path)
            .await
            .with_context(|| format!("reading snapshot {}", self.path.display()))?;
        let snapshot = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing snapshot {}", self.path.display()))?;
        Ok(Some(snapshot))
    }

    pub async fn save(&self, snapshot: &DatabaseSnapshot) -> anyhow::Result<StoredSnapshot> {
        let bytes = serde_json::to_vec_pretty(snapshot).context("serializing snapshot")?;
        let content_hash = Self::sha256_hex(&bytes);

        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating snapshot directory {}", parent.display()))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp snapshot file {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp snapshot file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp snapshot file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp snapshot {} -> {}",
                    temp_path.display(),
                    self.path.display()
                )
            });
        }

        tracing::info!(path = %self.path.display(), %content_hash, "snapshot saved");
        Ok(StoredSnapshot {
            content_hash,
            path: self.path.clone(),
            byte_size: bytes.len(),
        })
    }
}
