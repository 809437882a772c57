//! Per-(game, playtype) strategy table, resolved once and shared by every import.

use std::collections::HashMap;

use scorebook_core::{ClassMap, Game, Playtype, Ratings};

use crate::classes::{chunithm_colour, gitadora_colour, sdvx_vf_class};
use crate::rating::{NamedRating, RatingStrategy};

/// Derives classes from freshly computed ratings without outside input.
pub type StaticClassFn = fn(&Ratings) -> ClassMap;

#[derive(Debug, Clone, Default)]
pub struct GptStrategies {
    pub ratings: Vec<NamedRating>,
    pub static_classes: Option<StaticClassFn>,
}

impl GptStrategies {
    pub fn rated(ratings: Vec<NamedRating>) -> Self {
        Self {
            ratings,
            static_classes: None,
        }
    }

    pub fn with_static_classes(mut self, handler: StaticClassFn) -> Self {
        self.static_classes = Some(handler);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct StrategyRegistry {
    entries: HashMap<(Game, Playtype), GptStrategies>,
}

impl StrategyRegistry {
    pub fn builtin() -> Self {
        let bpi = || {
            GptStrategies::rated(vec![NamedRating::new(
                "BPI",
                RatingStrategy::MeanBestN { metric: "BPI", n: 20 },
            )])
        };
        let volforce = || {
            GptStrategies::rated(vec![NamedRating::new(
                "VF6",
                RatingStrategy::SumBestN { metric: "VF6", n: 50 },
            )])
        };
        let mfcp = || {
            GptStrategies::rated(vec![NamedRating::new(
                "MFCP",
                RatingStrategy::SumAll { metric: "MFCP" },
            )])
        };
        let skill = || {
            GptStrategies::rated(vec![
                NamedRating::new(
                    "skill",
                    RatingStrategy::PartitionedPool {
                        metric: "skill",
                        hot_flag: "HOT N-1",
                        hot_n: 25,
                        cold_n: 25,
                    },
                ),
                NamedRating::new("naiveSkill", RatingStrategy::SumBestN { metric: "skill", n: 50 }),
            ])
            .with_static_classes(gitadora_colour)
        };

        Self::default()
            .with(Game::Iidx, Playtype::Sp, bpi())
            .with(Game::Iidx, Playtype::Dp, bpi())
            .with(Game::Bms, Playtype::SevenKey, GptStrategies::default())
            .with(Game::Bms, Playtype::FourteenKey, GptStrategies::default())
            .with(
                Game::Sdvx,
                Playtype::Single,
                volforce().with_static_classes(sdvx_vf_class),
            )
            .with(Game::Usc, Playtype::Controller, volforce())
            .with(Game::Usc, Playtype::Keyboard, volforce())
            .with(Game::Ddr, Playtype::Sp, mfcp())
            .with(Game::Ddr, Playtype::Dp, mfcp())
            .with(Game::Gitadora, Playtype::Gita, skill())
            .with(Game::Gitadora, Playtype::Dora, skill())
            .with(
                Game::Chunithm,
                Playtype::Single,
                GptStrategies::rated(vec![NamedRating::new(
                    "naiveRating",
                    RatingStrategy::MeanBestN { metric: "rating", n: 20 },
                )])
                .with_static_classes(chunithm_colour),
            )
    }

    pub fn with(mut self, game: Game, playtype: Playtype, strategies: GptStrategies) -> Self {
        self.entries.insert((game, playtype), strategies);
        self
    }

    pub fn get(&self, game: Game, playtype: Playtype) -> Option<&GptStrategies> {
        self.entries.get(&(game, playtype))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scorebook_core::{gpt_config, playtypes_for};

    const GAMES: [Game; 7] = [
        Game::Iidx,
        Game::Bms,
        Game::Sdvx,
        Game::Usc,
        Game::Ddr,
        Game::Gitadora,
        Game::Chunithm,
    ];

    #[test]
    fn every_configured_playtype_has_strategies() {
        let registry = StrategyRegistry::builtin();
        for game in GAMES {
            for playtype in playtypes_for(game) {
                assert!(registry.get(game, playtype).is_some(), "{game} {playtype}");
            }
        }
    }

    #[test]
    fn gitadora_has_pooled_and_naive_skill() {
        let registry = StrategyRegistry::builtin();
        let gita = registry.get(Game::Gitadora, Playtype::Gita).expect("gita");
        let names: Vec<_> = gita.ratings.iter().map(|r| r.name).collect();
        assert_eq!(names, ["skill", "naiveSkill"]);
        assert!(gita.static_classes.is_some());
        assert!(registry
            .get(Game::Iidx, Playtype::Sp)
            .expect("iidx")
            .static_classes
            .is_none());
    }

    #[test]
    fn static_classes_land_on_configured_ladders() {
        let registry = StrategyRegistry::builtin();
        for game in GAMES {
            for playtype in playtypes_for(game) {
                let Some(strategies) = registry.get(game, playtype) else {
                    continue;
                };
                let Some(derive) = strategies.static_classes else {
                    continue;
                };
                let config = gpt_config(game, playtype).expect("config");
                for value in [0.0, 12.5, 1_000.0, 1_000_000.0] {
                    let ratings: Ratings = strategies
                        .ratings
                        .iter()
                        .map(|r| (r.name.to_string(), value))
                        .collect();
                    let classes = derive(&ratings);
                    assert!(!classes.is_empty(), "{game} {playtype} derived nothing");
                    for (set, rung) in classes {
                        let ladder = config
                            .ladder(&set)
                            .unwrap_or_else(|| panic!("{game} {playtype} has no {set} ladder"));
                        assert!((rung as usize) < ladder.rungs.len(), "{game} {playtype} {set}={rung}");
                    }
                }
            }
        }
    }
}
