//! Static per-(game, playtype) tables: grade ladders, lamp ladders and class ladders.

use crate::{Game, Playtype};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassDerivation {
    /// Mechanically derived from the user's ratings.
    Static,
    /// Only known at the score source; supplied by the importer.
    Dynamic,
}

#[derive(Debug)]
pub struct ClassLadder {
    pub name: &'static str,
    pub derivation: ClassDerivation,
    pub rungs: &'static [&'static str],
}

#[derive(Debug)]
pub struct GptConfig {
    pub game: Game,
    pub playtype: Playtype,
    pub grades: &'static [&'static str],
    pub lamps: &'static [&'static str],
    pub class_ladders: &'static [ClassLadder],
}

impl GptConfig {
    pub fn grade_index(&self, grade: &str) -> Option<usize> {
        self.grades.iter().position(|g| *g == grade)
    }

    pub fn lamp_index(&self, lamp: &str) -> Option<usize> {
        self.lamps.iter().position(|l| *l == lamp)
    }

    pub fn grade_name(&self, index: usize) -> Option<&'static str> {
        self.grades.get(index).copied()
    }

    pub fn lamp_name(&self, index: usize) -> Option<&'static str> {
        self.lamps.get(index).copied()
    }

    pub fn ladder(&self, name: &str) -> Option<&ClassLadder> {
        self.class_ladders.iter().find(|l| l.name == name)
    }
}

const IIDX_GRADES: &[&str] = &["F", "E", "D", "C", "B", "A", "AA", "AAA", "MAX-", "MAX"];
const IIDX_LAMPS: &[&str] = &[
    "NO PLAY",
    "FAILED",
    "ASSIST CLEAR",
    "EASY CLEAR",
    "CLEAR",
    "HARD CLEAR",
    "EX HARD CLEAR",
    "FULL COMBO",
];

const SDVX_GRADES: &[&str] = &["D", "C", "B", "A", "A+", "AA", "AA+", "AAA", "AAA+", "S"];
const SDVX_LAMPS: &[&str] = &[
    "FAILED",
    "CLEAR",
    "EXCESSIVE CLEAR",
    "ULTIMATE CHAIN",
    "PERFECT ULTIMATE CHAIN",
];

const DDR_GRADES: &[&str] = &[
    "D", "D+", "C-", "C", "C+", "B-", "B", "B+", "A-", "A", "A+", "AA-", "AA", "AA+", "AAA",
];
const DDR_LAMPS: &[&str] = &[
    "FAILED",
    "CLEAR",
    "LIFE4",
    "FULL COMBO",
    "GREAT FULL COMBO",
    "PERFECT FULL COMBO",
    "MARVELOUS FULL COMBO",
];

const GITADORA_GRADES: &[&str] = &["C", "B", "A", "S", "SS", "MAX"];
const GITADORA_LAMPS: &[&str] = &["FAILED", "CLEAR", "FULL COMBO", "EXCELLENT"];

const CHUNITHM_GRADES: &[&str] = &["D", "C", "B", "BB", "BBB", "A", "AA", "AAA", "S", "SS", "SSS"];
const CHUNITHM_LAMPS: &[&str] = &[
    "FAILED",
    "CLEAR",
    "FULL COMBO",
    "ALL JUSTICE",
    "ALL JUSTICE CRITICAL",
];

const IIDX_DANS: &[&str] = &[
    "KYU_7", "KYU_6", "KYU_5", "KYU_4", "KYU_3", "KYU_2", "KYU_1", "DAN_1", "DAN_2", "DAN_3",
    "DAN_4", "DAN_5", "DAN_6", "DAN_7", "DAN_8", "DAN_9", "DAN_10", "CHUUDEN", "KAIDEN",
];

const SDVX_DANS: &[&str] = &[
    "DAN_1", "DAN_2", "DAN_3", "DAN_4", "DAN_5", "DAN_6", "DAN_7", "DAN_8", "DAN_9", "DAN_10",
    "DAN_11", "INF",
];

pub const SDVX_VF_CLASSES: &[&str] = &[
    "SIENNA_I", "SIENNA_II", "SIENNA_III", "SIENNA_IV",
    "COBALT_I", "COBALT_II", "COBALT_III", "COBALT_IV",
    "DANDELION_I", "DANDELION_II", "DANDELION_III", "DANDELION_IV",
    "CYAN_I", "CYAN_II", "CYAN_III", "CYAN_IV",
    "SCARLET_I", "SCARLET_II", "SCARLET_III", "SCARLET_IV",
    "CORAL_I", "CORAL_II", "CORAL_III", "CORAL_IV",
    "ARGENTO_I", "ARGENTO_II", "ARGENTO_III", "ARGENTO_IV",
    "ELDORA_I", "ELDORA_II", "ELDORA_III", "ELDORA_IV",
    "CRIMSON_I", "CRIMSON_II", "CRIMSON_III", "CRIMSON_IV",
    "IMPERIAL_I", "IMPERIAL_II", "IMPERIAL_III", "IMPERIAL_IV",
];

pub const GITADORA_COLOURS: &[&str] = &[
    "WHITE", "ORANGE", "ORANGE_GRD", "YELLOW", "YELLOW_GRD", "GREEN", "GREEN_GRD", "BLUE",
    "BLUE_GRD", "PURPLE", "PURPLE_GRD", "RED", "RED_GRD", "BRONZE", "SILVER", "GOLD", "RAINBOW",
];

pub const CHUNITHM_COLOURS: &[&str] = &[
    "BLUE", "GREEN", "ORANGE", "RED", "PURPLE", "COPPER", "SILVER", "GOLD", "PLATINUM", "RAINBOW",
];

const IIDX_LADDERS: &[ClassLadder] = &[ClassLadder {
    name: "dan",
    derivation: ClassDerivation::Dynamic,
    rungs: IIDX_DANS,
}];

const SDVX_LADDERS: &[ClassLadder] = &[
    ClassLadder {
        name: "dan",
        derivation: ClassDerivation::Dynamic,
        rungs: SDVX_DANS,
    },
    ClassLadder {
        name: "vfClass",
        derivation: ClassDerivation::Static,
        rungs: SDVX_VF_CLASSES,
    },
];

const GITADORA_LADDERS: &[ClassLadder] = &[ClassLadder {
    name: "colour",
    derivation: ClassDerivation::Static,
    rungs: GITADORA_COLOURS,
}];

const CHUNITHM_LADDERS: &[ClassLadder] = &[ClassLadder {
    name: "colour",
    derivation: ClassDerivation::Static,
    rungs: CHUNITHM_COLOURS,
}];

static CONFIGS: &[GptConfig] = &[
    GptConfig {
        game: Game::Iidx,
        playtype: Playtype::Sp,
        grades: IIDX_GRADES,
        lamps: IIDX_LAMPS,
        class_ladders: IIDX_LADDERS,
    },
    GptConfig {
        game: Game::Iidx,
        playtype: Playtype::Dp,
        grades: IIDX_GRADES,
        lamps: IIDX_LAMPS,
        class_ladders: IIDX_LADDERS,
    },
    GptConfig {
        game: Game::Bms,
        playtype: Playtype::SevenKey,
        grades: IIDX_GRADES,
        lamps: IIDX_LAMPS,
        class_ladders: &[],
    },
    GptConfig {
        game: Game::Bms,
        playtype: Playtype::FourteenKey,
        grades: IIDX_GRADES,
        lamps: IIDX_LAMPS,
        class_ladders: &[],
    },
    GptConfig {
        game: Game::Sdvx,
        playtype: Playtype::Single,
        grades: SDVX_GRADES,
        lamps: SDVX_LAMPS,
        class_ladders: SDVX_LADDERS,
    },
    GptConfig {
        game: Game::Usc,
        playtype: Playtype::Controller,
        grades: SDVX_GRADES,
        lamps: SDVX_LAMPS,
        class_ladders: &[],
    },
    GptConfig {
        game: Game::Usc,
        playtype: Playtype::Keyboard,
        grades: SDVX_GRADES,
        lamps: SDVX_LAMPS,
        class_ladders: &[],
    },
    GptConfig {
        game: Game::Ddr,
        playtype: Playtype::Sp,
        grades: DDR_GRADES,
        lamps: DDR_LAMPS,
        class_ladders: &[],
    },
    GptConfig {
        game: Game::Ddr,
        playtype: Playtype::Dp,
        grades: DDR_GRADES,
        lamps: DDR_LAMPS,
        class_ladders: &[],
    },
    GptConfig {
        game: Game::Gitadora,
        playtype: Playtype::Gita,
        grades: GITADORA_GRADES,
        lamps: GITADORA_LAMPS,
        class_ladders: GITADORA_LADDERS,
    },
    GptConfig {
        game: Game::Gitadora,
        playtype: Playtype::Dora,
        grades: GITADORA_GRADES,
        lamps: GITADORA_LAMPS,
        class_ladders: GITADORA_LADDERS,
    },
    GptConfig {
        game: Game::Chunithm,
        playtype: Playtype::Single,
        grades: CHUNITHM_GRADES,
        lamps: CHUNITHM_LAMPS,
        class_ladders: CHUNITHM_LADDERS,
    },
];

/// Looks up the tables for a (game, playtype) pair. `None` for unsupported pairs.
pub fn gpt_config(game: Game, playtype: Playtype) -> Option<&'static GptConfig> {
    CONFIGS
        .iter()
        .find(|c| c.game == game && c.playtype == playtype)
}

pub fn playtypes_for(game: Game) -> Vec<Playtype> {
    CONFIGS
        .iter()
        .filter(|c| c.game == game)
        .map(|c| c.playtype)
        .collect()
}
