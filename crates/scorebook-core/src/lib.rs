//! Core domain model for Scorebook: scores, personal bests, catalogue and goal documents.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub mod game;

pub use game::{gpt_config, playtypes_for, ClassDerivation, ClassLadder, GptConfig};

pub const CRATE_NAME: &str = "scorebook-core";

pub type UserId = u64;
pub type SongId = u64;

/// Per-score or per-PB derived numbers, keyed by metric name (e.g. `BPI`, `VF6`).
pub type CalculatedData = BTreeMap<String, f64>;

/// Ordinal rung per class set (e.g. `dan -> 9`).
pub type ClassMap = BTreeMap<String, u32>;

pub type Ratings = BTreeMap<String, f64>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Game {
    Iidx,
    Bms,
    Sdvx,
    Usc,
    Ddr,
    Gitadora,
    Chunithm,
}

impl Game {
    pub fn as_str(&self) -> &'static str {
        match self {
            Game::Iidx => "iidx",
            Game::Bms => "bms",
            Game::Sdvx => "sdvx",
            Game::Usc => "usc",
            Game::Ddr => "ddr",
            Game::Gitadora => "gitadora",
            Game::Chunithm => "chunithm",
        }
    }
}

impl fmt::Display for Game {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Playtype {
    #[serde(rename = "SP")]
    Sp,
    #[serde(rename = "DP")]
    Dp,
    #[serde(rename = "7K")]
    SevenKey,
    #[serde(rename = "14K")]
    FourteenKey,
    Single,
    Controller,
    Keyboard,
    Gita,
    Dora,
}

impl Playtype {
    pub fn as_str(&self) -> &'static str {
        match self {
            Playtype::Sp => "SP",
            Playtype::Dp => "DP",
            Playtype::SevenKey => "7K",
            Playtype::FourteenKey => "14K",
            Playtype::Single => "Single",
            Playtype::Controller => "Controller",
            Playtype::Keyboard => "Keyboard",
            Playtype::Gita => "Gita",
            Playtype::Dora => "Dora",
        }
    }
}

impl fmt::Display for Playtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Score payload as handed over by a converter, before grade/lamp indices are resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DryScoreData {
    pub score: f64,
    /// Absent when the converter cannot tell; derived from the chart at hydration.
    #[serde(default)]
    pub percent: Option<f64>,
    pub grade: String,
    pub lamp: String,
    #[serde(default)]
    pub hit_data: BTreeMap<String, u64>,
    #[serde(default)]
    pub hit_meta: BTreeMap<String, f64>,
}

/// Canonical, not-yet-identified score produced by a source-specific converter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DryScore {
    pub game: Game,
    pub playtype: Playtype,
    pub service: String,
    #[serde(default)]
    pub import_type: Option<String>,
    #[serde(default)]
    pub time_achieved: Option<DateTime<Utc>>,
    #[serde(default)]
    pub comment: Option<String>,
    pub score_data: DryScoreData,
    #[serde(default)]
    pub score_meta: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreData {
    pub score: f64,
    pub percent: f64,
    pub grade: String,
    pub grade_index: usize,
    pub lamp: String,
    pub lamp_index: usize,
    #[serde(default)]
    pub hit_data: BTreeMap<String, u64>,
    #[serde(default)]
    pub hit_meta: BTreeMap<String, f64>,
}

/// An identified, append-only score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Score {
    pub score_id: String,
    pub user_id: UserId,
    pub chart_id: String,
    pub song_id: SongId,
    pub game: Game,
    pub playtype: Playtype,
    pub service: String,
    #[serde(default)]
    pub import_type: Option<String>,
    pub is_primary: bool,
    #[serde(default)]
    pub highlight: bool,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub time_achieved: Option<DateTime<Utc>>,
    pub time_added: DateTime<Utc>,
    pub score_data: ScoreData,
    #[serde(default)]
    pub score_meta: Map<String, Value>,
    #[serde(default)]
    pub calculated_data: CalculatedData,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComposedOther {
    pub name: String,
    pub score_id: String,
}

/// Provenance of a merged personal best.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComposedFrom {
    #[serde(rename = "scorePB")]
    pub score_pb: String,
    #[serde(rename = "lampPB")]
    pub lamp_pb: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub other: Vec<ComposedOther>,
}

/// The single canonical best record per (user, chart).
///
/// `ranking`/`out_of` may briefly hold stale values between the PB write and the
/// ranking refresh; readers treat zero as "not yet ranked".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PbScore {
    pub user_id: UserId,
    pub chart_id: String,
    pub song_id: SongId,
    pub game: Game,
    pub playtype: Playtype,
    pub is_primary: bool,
    pub highlight: bool,
    pub time_achieved: Option<DateTime<Utc>>,
    #[serde(default)]
    pub comments: Vec<String>,
    pub score_data: ScoreData,
    #[serde(default)]
    pub calculated_data: CalculatedData,
    pub composed_from: ComposedFrom,
    #[serde(default)]
    pub ranking: u64,
    #[serde(default)]
    pub out_of: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chart {
    pub chart_id: String,
    pub song_id: SongId,
    pub game: Game,
    pub playtype: Playtype,
    pub difficulty: String,
    pub level: String,
    pub level_num: f64,
    #[serde(default = "default_true")]
    pub is_primary: bool,
    #[serde(default)]
    pub flags: BTreeMap<String, bool>,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl Chart {
    pub fn data_f64(&self, key: &str) -> Option<f64> {
        self.data.get(key).and_then(Value::as_f64)
    }

    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.get(flag).copied().unwrap_or(false)
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Song {
    pub song_id: SongId,
    pub game: Game,
    pub title: String,
    pub artist: String,
    #[serde(default)]
    pub search_terms: Vec<String>,
    #[serde(default)]
    pub data: Map<String, Value>,
}

/// How a folder selects its charts. `Charts` queries may use `¬` in field names to
/// stand in for the nested-field separator `.`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum FolderKind {
    Static(Vec<String>),
    Songs(Map<String, Value>),
    Charts(Map<String, Value>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Folder {
    pub folder_id: String,
    pub game: Game,
    pub playtype: Playtype,
    pub title: String,
    #[serde(default)]
    pub inactive: bool,
    #[serde(flatten)]
    pub kind: FolderKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderChartLookup {
    pub folder_id: String,
    pub chart_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum GoalCharts {
    Single(String),
    Multi(Vec<String>),
    Folder(String),
    Any,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GoalMode {
    Single,
    Abs,
    Proportion,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoalCriteria {
    pub mode: GoalMode,
    /// Dotted PB path such as `scoreData.lampIndex`.
    pub key: String,
    pub value: f64,
    #[serde(default)]
    pub count_num: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Goal {
    pub goal_id: String,
    pub game: Game,
    pub playtype: Playtype,
    pub name: String,
    pub charts: GoalCharts,
    pub criteria: GoalCriteria,
}

/// A user's subscription to a goal, holding the last evaluated snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserGoal {
    pub user_id: UserId,
    pub goal_id: String,
    pub game: Game,
    pub playtype: Playtype,
    pub achieved: bool,
    pub progress: Option<f64>,
    pub out_of: f64,
    pub progress_human: String,
    pub out_of_human: String,
    #[serde(default)]
    pub time_achieved: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_interaction: Option<DateTime<Utc>>,
}

impl UserGoal {
    /// A subscription that has never been evaluated.
    pub fn fresh(user_id: UserId, goal: &Goal) -> Self {
        Self {
            user_id,
            goal_id: goal.goal_id.clone(),
            game: goal.game,
            playtype: goal.playtype,
            achieved: false,
            progress: None,
            out_of: 0.0,
            progress_human: String::new(),
            out_of_human: String::new(),
            time_achieved: None,
            last_interaction: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MilestoneMode {
    All,
    Abs,
    Proportion,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MilestoneCriteria {
    pub mode: MilestoneMode,
    #[serde(default)]
    pub value: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MilestoneGroup {
    pub title: String,
    pub goal_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Milestone {
    pub milestone_id: String,
    pub game: Game,
    pub playtype: Playtype,
    pub name: String,
    pub criteria: MilestoneCriteria,
    pub milestone_data: Vec<MilestoneGroup>,
}

impl Milestone {
    pub fn goal_ids(&self) -> impl Iterator<Item = &String> {
        self.milestone_data.iter().flat_map(|g| g.goal_ids.iter())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserMilestone {
    pub user_id: UserId,
    pub milestone_id: String,
    pub game: Game,
    pub playtype: Playtype,
    pub achieved: bool,
    pub progress: u64,
    #[serde(default)]
    pub time_achieved: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_interaction: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserGameStats {
    pub user_id: UserId,
    pub game: Game,
    pub playtype: Playtype,
    #[serde(default)]
    pub ratings: Ratings,
    #[serde(default)]
    pub classes: ClassMap,
}

/// One accepted class improvement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassDelta {
    pub game: Game,
    pub set: String,
    pub playtype: Playtype,
    pub old: Option<u32>,
    pub new: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassAchievement {
    pub user_id: UserId,
    pub game: Game,
    pub playtype: Playtype,
    pub class_set: String,
    pub class_old_value: Option<u32>,
    pub class_value: u32,
    pub time_achieved: DateTime<Utc>,
}
