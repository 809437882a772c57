//! Document-store abstraction, in-memory engine and snapshot persistence for Scorebook.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;

use scorebook_core::{
    Chart, ClassAchievement, Folder, FolderChartLookup, Goal, Milestone, PbScore, Score, Song,
    UserGameStats, UserGoal, UserMilestone,
};

pub mod filter;
pub mod snapshot;

pub use filter::{Accumulator, Filter, FindOptions, Predicate, SortOrder};
pub use snapshot::{DatabaseSnapshot, SnapshotStore, StoredSnapshot};

pub const CRATE_NAME: &str = "scorebook-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("invalid query: {0}")]
    InvalidQuery(String),
}

/// A document with a natural unique key inside its collection.
pub trait Document: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const COLLECTION: &'static str;

    fn key(&self) -> String;
}

impl Document for Score {
    const COLLECTION: &'static str = "scores";

    fn key(&self) -> String {
        self.score_id.clone()
    }
}

impl Document for PbScore {
    const COLLECTION: &'static str = "personal-bests";

    fn key(&self) -> String {
        format!("{}:{}", self.user_id, self.chart_id)
    }
}

impl Document for Chart {
    const COLLECTION: &'static str = "charts";

    fn key(&self) -> String {
        self.chart_id.clone()
    }
}

impl Document for Song {
    const COLLECTION: &'static str = "songs";

    fn key(&self) -> String {
        format!("{}:{}", self.game, self.song_id)
    }
}

impl Document for Folder {
    const COLLECTION: &'static str = "folders";

    fn key(&self) -> String {
        self.folder_id.clone()
    }
}

impl Document for FolderChartLookup {
    const COLLECTION: &'static str = "folder-chart-lookup";

    fn key(&self) -> String {
        format!("{}:{}", self.folder_id, self.chart_id)
    }
}

impl Document for Goal {
    const COLLECTION: &'static str = "goals";

    fn key(&self) -> String {
        self.goal_id.clone()
    }
}

impl Document for UserGoal {
    const COLLECTION: &'static str = "goal-subs";

    fn key(&self) -> String {
        format!("{}:{}", self.user_id, self.goal_id)
    }
}

impl Document for Milestone {
    const COLLECTION: &'static str = "milestones";

    fn key(&self) -> String {
        self.milestone_id.clone()
    }
}

impl Document for UserMilestone {
    const COLLECTION: &'static str = "milestone-subs";

    fn key(&self) -> String {
        format!("{}:{}", self.user_id, self.milestone_id)
    }
}

impl Document for UserGameStats {
    const COLLECTION: &'static str = "game-stats";

    fn key(&self) -> String {
        format!("{}:{}:{}", self.user_id, self.game, self.playtype)
    }
}

impl Document for ClassAchievement {
    const COLLECTION: &'static str = "class-achievements";

    fn key(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}",
            self.user_id, self.game, self.playtype, self.class_set, self.class_value
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A document with the same key already exists; nothing was written.
    Duplicate,
}

/// Result of an unordered bulk write: failures never block sibling documents.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkWriteReport {
    pub upserted: usize,
    pub failed: Vec<(String, String)>,
}

#[async_trait]
pub trait Collection<T: Document>: Send + Sync {
    async fn find(&self, filter: &Filter, options: &FindOptions) -> Result<Vec<T>, StoreError>;

    async fn find_one(&self, filter: &Filter, options: &FindOptions) -> Result<Option<T>, StoreError> {
        let options = options.clone().limit(1);
        Ok(self.find(filter, &options).await?.into_iter().next())
    }

    async fn insert(&self, doc: T) -> Result<InsertOutcome, StoreError>;

    /// Inserts or replaces the document with the same key.
    async fn upsert(&self, doc: T) -> Result<(), StoreError>;

    async fn bulk_upsert(&self, docs: Vec<T>) -> BulkWriteReport;

    /// `$set` of dotted paths on every matching document; returns the number updated.
    async fn update_many(&self, filter: &Filter, set: &[(String, Value)]) -> Result<u64, StoreError>;

    async fn delete_many(&self, filter: &Filter) -> Result<u64, StoreError>;

    async fn count(&self, filter: &Filter) -> Result<u64, StoreError>;

    /// `$match` + `$group: { _id: null }`. `None` when nothing matched.
    async fn aggregate(
        &self,
        filter: &Filter,
        accumulators: &[Accumulator],
    ) -> Result<Option<Vec<f64>>, StoreError>;
}

struct Stored<T> {
    doc: T,
    json: Value,
}

/// Collection held in process memory, ordered by document key.
pub struct MemoryCollection<T> {
    docs: RwLock<BTreeMap<String, Stored<T>>>,
}

impl<T> Default for MemoryCollection<T> {
    fn default() -> Self {
        Self {
            docs: RwLock::new(BTreeMap::new()),
        }
    }
}

impl<T: Document> MemoryCollection<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn stored(doc: T) -> Result<(String, Stored<T>), StoreError> {
        let json = serde_json::to_value(&doc)?;
        Ok((doc.key(), Stored { doc, json }))
    }
}

#[async_trait]
impl<T: Document> Collection<T> for MemoryCollection<T> {
    async fn find(&self, filter: &Filter, options: &FindOptions) -> Result<Vec<T>, StoreError> {
        let docs = self.docs.read().await;
        let mut hits: Vec<&Stored<T>> = docs.values().filter(|s| filter.matches(&s.json)).collect();
        if !options.sort.is_empty() {
            hits.sort_by(|a, b| options.ordering(&a.json, &b.json));
        }
        let limit = options.limit.unwrap_or(usize::MAX);
        Ok(hits.into_iter().take(limit).map(|s| s.doc.clone()).collect())
    }

    async fn insert(&self, doc: T) -> Result<InsertOutcome, StoreError> {
        let (key, stored) = Self::stored(doc)?;
        let mut docs = self.docs.write().await;
        if docs.contains_key(&key) {
            return Ok(InsertOutcome::Duplicate);
        }
        docs.insert(key, stored);
        Ok(InsertOutcome::Inserted)
    }

    async fn upsert(&self, doc: T) -> Result<(), StoreError> {
        let (key, stored) = Self::stored(doc)?;
        self.docs.write().await.insert(key, stored);
        Ok(())
    }

    async fn bulk_upsert(&self, docs: Vec<T>) -> BulkWriteReport {
        let mut report = BulkWriteReport::default();
        let mut prepared = Vec::with_capacity(docs.len());
        for doc in docs {
            let key = doc.key();
            match Self::stored(doc) {
                Ok(entry) => prepared.push(entry),
                Err(err) => {
                    tracing::warn!(collection = T::COLLECTION, %key, error = %err, "bulk write entry failed");
                    report.failed.push((key, err.to_string()));
                }
            }
        }

        let mut store = self.docs.write().await;
        for (key, stored) in prepared {
            store.insert(key, stored);
            report.upserted += 1;
        }
        report
    }

    async fn update_many(&self, filter: &Filter, set: &[(String, Value)]) -> Result<u64, StoreError> {
        let mut docs = self.docs.write().await;
        let mut updated = 0u64;
        for stored in docs.values_mut().filter(|s| filter.matches(&s.json)) {
            let mut json = stored.json.clone();
            for (path, value) in set {
                filter::assign(&mut json, path, value.clone())?;
            }
            let doc: T = serde_json::from_value(json.clone())?;
            *stored = Stored { doc, json };
            updated += 1;
        }
        Ok(updated)
    }

    async fn delete_many(&self, filter: &Filter) -> Result<u64, StoreError> {
        let mut docs = self.docs.write().await;
        let before = docs.len();
        docs.retain(|_, s| !filter.matches(&s.json));
        Ok((before - docs.len()) as u64)
    }

    async fn count(&self, filter: &Filter) -> Result<u64, StoreError> {
        let docs = self.docs.read().await;
        Ok(docs.values().filter(|s| filter.matches(&s.json)).count() as u64)
    }

    async fn aggregate(
        &self,
        filter: &Filter,
        accumulators: &[Accumulator],
    ) -> Result<Option<Vec<f64>>, StoreError> {
        let docs = self.docs.read().await;
        let matched: Vec<&Value> = docs
            .values()
            .map(|s| &s.json)
            .filter(|json| filter.matches(json))
            .collect();
        if matched.is_empty() {
            return Ok(None);
        }

        let numbers = |path: &str| -> Vec<f64> {
            matched
                .iter()
                .filter_map(|json| filter::lookup(json, path).and_then(Value::as_f64))
                .collect()
        };

        let results = accumulators
            .iter()
            .map(|acc| match acc {
                Accumulator::Count => matched.len() as f64,
                Accumulator::CountWhere(cond) => {
                    matched.iter().filter(|json| cond.matches(json)).count() as f64
                }
                Accumulator::Sum(path) => numbers(path).iter().sum(),
                Accumulator::Max(path) => numbers(path).into_iter().fold(f64::NAN, f64::max),
            })
            .collect();
        Ok(Some(results))
    }
}

/// Every collection the engine reads or writes.
#[derive(Clone)]
pub struct Database {
    pub scores: Arc<dyn Collection<Score>>,
    pub personal_bests: Arc<dyn Collection<PbScore>>,
    pub charts: Arc<dyn Collection<Chart>>,
    pub songs: Arc<dyn Collection<Song>>,
    pub folders: Arc<dyn Collection<Folder>>,
    pub folder_chart_lookup: Arc<dyn Collection<FolderChartLookup>>,
    pub goals: Arc<dyn Collection<Goal>>,
    pub goal_subs: Arc<dyn Collection<UserGoal>>,
    pub milestones: Arc<dyn Collection<Milestone>>,
    pub milestone_subs: Arc<dyn Collection<UserMilestone>>,
    pub game_stats: Arc<dyn Collection<UserGameStats>>,
    pub class_achievements: Arc<dyn Collection<ClassAchievement>>,
}

impl Database {
    pub fn in_memory() -> Self {
        Self {
            scores: Arc::new(MemoryCollection::<Score>::new()),
            personal_bests: Arc::new(MemoryCollection::<PbScore>::new()),
            charts: Arc::new(MemoryCollection::<Chart>::new()),
            songs: Arc::new(MemoryCollection::<Song>::new()),
            folders: Arc::new(MemoryCollection::<Folder>::new()),
            folder_chart_lookup: Arc::new(MemoryCollection::<FolderChartLookup>::new()),
            goals: Arc::new(MemoryCollection::<Goal>::new()),
            goal_subs: Arc::new(MemoryCollection::<UserGoal>::new()),
            milestones: Arc::new(MemoryCollection::<Milestone>::new()),
            milestone_subs: Arc::new(MemoryCollection::<UserMilestone>::new()),
            game_stats: Arc::new(MemoryCollection::<UserGameStats>::new()),
            class_achievements: Arc::new(MemoryCollection::<ClassAchievement>::new()),
        }
    }
}
