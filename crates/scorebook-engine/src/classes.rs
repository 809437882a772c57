//! Class ladders: derivation from ratings, merging with importer-supplied values and
//! monotonic updates of a user's game stats.

use async_trait::async_trait;
use chrono::Utc;
use scorebook_core::{
    gpt_config, ClassAchievement, ClassDelta, ClassMap, Game, Playtype, Ratings, UserGameStats,
    UserId,
};
use scorebook_storage::{Database, Filter, FindOptions};
use tracing::{debug, error, info, warn};

use crate::error::EngineError;
use crate::events::{emit_logged, EngineEvent, EventSink};
use crate::rating::compute_ratings;
use crate::registry::StrategyRegistry;

/// Classes that only the score source knows (dans, for instance). Supplied once per
/// import by the caller.
#[async_trait]
pub trait ClassHandler: Send + Sync {
    async fn classes(
        &self,
        game: Game,
        playtype: Playtype,
        user_id: UserId,
        ratings: &Ratings,
    ) -> Result<ClassMap, EngineError>;
}

#[derive(Default)]
pub struct NoopClassHandler;

#[async_trait]
impl ClassHandler for NoopClassHandler {
    async fn classes(
        &self,
        _game: Game,
        _playtype: Playtype,
        _user_id: UserId,
        _ratings: &Ratings,
    ) -> Result<ClassMap, EngineError> {
        Ok(ClassMap::new())
    }
}

const IMPERIAL_IV: u32 = 39;

/// Index into the 40 Volforce bands. Bands are 2.5 wide below 10, 0.5 wide up to 14,
/// 0.25 wide up to 20 and 1 wide for Imperial.
pub fn sdvx_vf6_to_class(vf: f64) -> u32 {
    if vf >= 24.0 {
        warn!(vf, "excessive VF6, defaulting to IMPERIAL_IV");
        IMPERIAL_IV
    } else if vf >= 20.0 {
        36 + (vf - 20.0).floor() as u32
    } else if vf >= 14.0 {
        12 + (4.0 * (vf - 14.0)).floor() as u32
    } else if vf >= 10.0 {
        4 + (2.0 * (vf - 10.0)).floor() as u32
    } else {
        (vf / 2.5).floor().max(0.0) as u32
    }
}

pub fn gitadora_skill_to_colour(skill: f64) -> u32 {
    if skill < 1000.0 {
        return 0;
    }
    (((skill - 1000.0) / 500.0).floor() as u32 + 1).min(16)
}

pub fn chunithm_rating_to_colour(rating: f64) -> u32 {
    const BOUNDS: [f64; 9] = [2.0, 4.0, 7.0, 10.0, 12.0, 13.0, 14.0, 14.5, 15.0];
    BOUNDS.iter().filter(|bound| rating >= **bound).count() as u32
}

pub fn sdvx_vf_class(ratings: &Ratings) -> ClassMap {
    ratings
        .get("VF6")
        .map(|vf| ClassMap::from([("vfClass".to_string(), sdvx_vf6_to_class(*vf))]))
        .unwrap_or_default()
}

pub fn gitadora_colour(ratings: &Ratings) -> ClassMap {
    ratings
        .get("skill")
        .map(|sk| ClassMap::from([("colour".to_string(), gitadora_skill_to_colour(*sk))]))
        .unwrap_or_default()
}

pub fn chunithm_colour(ratings: &Ratings) -> ClassMap {
    ratings
        .get("naiveRating")
        .map(|r| ClassMap::from([("colour".to_string(), chunithm_rating_to_colour(*r))]))
        .unwrap_or_default()
}

/// Later maps win: `custom` overrides `derived` set by set.
pub fn merge_class_maps(derived: ClassMap, custom: ClassMap) -> ClassMap {
    let mut merged = derived;
    merged.extend(custom);
    merged
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassComparison {
    /// The user had no value for this set.
    Fresh,
    Reject,
    Accept,
}

pub fn return_class_if_greater(
    class_set: &str,
    value: u32,
    stats: Option<&UserGameStats>,
) -> ClassComparison {
    match stats.and_then(|s| s.classes.get(class_set)) {
        None => ClassComparison::Fresh,
        Some(current) if value > *current => ClassComparison::Accept,
        Some(_) => ClassComparison::Reject,
    }
}

/// Applies `candidate` onto the stored classes. Returns the resulting class map and one
/// delta per fresh or improved set; lower values never replace higher ones.
pub fn process_class_deltas(
    game: Game,
    playtype: Playtype,
    candidate: &ClassMap,
    existing: Option<&UserGameStats>,
) -> (ClassMap, Vec<ClassDelta>) {
    let mut classes = existing.map(|s| s.classes.clone()).unwrap_or_default();
    let mut deltas = Vec::new();
    let config = gpt_config(game, playtype);

    for (set, raw) in candidate {
        let Some(ladder) = config.and_then(|c| c.ladder(set)) else {
            warn!(%game, %playtype, class_set = %set, "skipping class set with no ladder");
            continue;
        };
        let top = ladder.rungs.len().saturating_sub(1) as u32;
        let value = if *raw > top {
            warn!(%game, %playtype, class_set = %set, value = raw, top, "class out of range, clamping to top");
            top
        } else {
            *raw
        };

        let old = match return_class_if_greater(set, value, existing) {
            ClassComparison::Reject => continue,
            ClassComparison::Fresh => None,
            ClassComparison::Accept => classes.get(set).copied(),
        };
        classes.insert(set.clone(), value);
        deltas.push(ClassDelta {
            game,
            set: set.clone(),
            playtype,
            old,
            new: value,
        });
    }

    (classes, deltas)
}

/// Recomputes ratings and classes for one (user, game, playtype), persists the stats,
/// records achievements and broadcasts every class improvement.
pub async fn update_user_game_stats(
    db: &Database,
    registry: &StrategyRegistry,
    class_handler: Option<&dyn ClassHandler>,
    sink: &dyn EventSink,
    user_id: UserId,
    game: Game,
    playtype: Playtype,
) -> Result<Vec<ClassDelta>, EngineError> {
    let strategies = registry
        .get(game, playtype)
        .ok_or(EngineError::UnsupportedPlaytype(game, playtype))?;

    let ratings = compute_ratings(db, &strategies.ratings, user_id, game, playtype).await?;

    let derived = strategies
        .static_classes
        .map(|derive| derive(&ratings))
        .unwrap_or_default();
    let custom = match class_handler {
        Some(handler) => {
            debug!(user_id, %game, %playtype, "calling custom class handler");
            match handler.classes(game, playtype, user_id, &ratings).await {
                Ok(classes) => classes,
                Err(err) => {
                    error!(user_id, %game, %playtype, error = %err, "custom class handler failed");
                    ClassMap::new()
                }
            }
        }
        None => ClassMap::new(),
    };
    let candidate = merge_class_maps(derived, custom);

    let stats_filter = Filter::new()
        .eq("userId", user_id)
        .eq("game", game.as_str())
        .eq("playtype", playtype.as_str());
    let existing = db
        .game_stats
        .find_one(&stats_filter, &FindOptions::default())
        .await?;

    let (classes, deltas) = process_class_deltas(game, playtype, &candidate, existing.as_ref());

    db.game_stats
        .upsert(UserGameStats {
            user_id,
            game,
            playtype,
            ratings,
            classes,
        })
        .await?;

    if !deltas.is_empty() {
        let now = Utc::now();
        let achievements = deltas
            .iter()
            .map(|d| ClassAchievement {
                user_id,
                game,
                playtype,
                class_set: d.set.clone(),
                class_old_value: d.old,
                class_value: d.new,
                time_achieved: now,
            })
            .collect();
        let report = db.class_achievements.bulk_upsert(achievements).await;
        if !report.failed.is_empty() {
            warn!(user_id, failed = report.failed.len(), "some class achievements were not recorded");
        }

        for delta in &deltas {
            info!(user_id, %game, %playtype, class_set = %delta.set, old = ?delta.old, new = delta.new, "class improved");
            emit_logged(
                sink,
                EngineEvent::ClassUpdate {
                    user_id,
                    delta: delta.clone(),
                },
            );
        }
    }

    Ok(deltas)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{BroadcastEventSink, NoopEventSink};
    use crate::test_support::mk_pb;

    struct FixedClasses(ClassMap);

    #[async_trait]
    impl ClassHandler for FixedClasses {
        async fn classes(
            &self,
            _game: Game,
            _playtype: Playtype,
            _user_id: UserId,
            _ratings: &Ratings,
        ) -> Result<ClassMap, EngineError> {
            Ok(self.0.clone())
        }
    }

    struct FailingClasses;

    #[async_trait]
    impl ClassHandler for FailingClasses {
        async fn classes(
            &self,
            _game: Game,
            _playtype: Playtype,
            _user_id: UserId,
            _ratings: &Ratings,
        ) -> Result<ClassMap, EngineError> {
            Err(EngineError::Task("service unavailable".into()))
        }
    }

    fn dan(value: u32) -> FixedClasses {
        FixedClasses(ClassMap::from([("dan".to_string(), value)]))
    }

    #[test]
    fn volforce_bands() {
        assert_eq!(sdvx_vf6_to_class(0.0), 0);
        assert_eq!(sdvx_vf6_to_class(7.6), 3);
        assert_eq!(sdvx_vf6_to_class(10.0), 4);
        assert_eq!(sdvx_vf6_to_class(13.9), 11);
        assert_eq!(sdvx_vf6_to_class(14.0), 12);
        assert_eq!(sdvx_vf6_to_class(17.3), 25);
        assert_eq!(sdvx_vf6_to_class(19.99), 35);
        assert_eq!(sdvx_vf6_to_class(20.0), 36);
        assert_eq!(sdvx_vf6_to_class(23.5), 39);
        assert_eq!(sdvx_vf6_to_class(30.0), 39);
    }

    #[test]
    fn gitadora_and_chunithm_colours() {
        assert_eq!(gitadora_skill_to_colour(999.0), 0);
        assert_eq!(gitadora_skill_to_colour(1000.0), 1);
        assert_eq!(gitadora_skill_to_colour(6250.0), 11);
        assert_eq!(gitadora_skill_to_colour(8500.0), 16);
        assert_eq!(gitadora_skill_to_colour(9999.0), 16);

        assert_eq!(chunithm_rating_to_colour(1.0), 0);
        assert_eq!(chunithm_rating_to_colour(12.5), 5);
        assert_eq!(chunithm_rating_to_colour(14.5), 8);
        assert_eq!(chunithm_rating_to_colour(16.0), 9);
    }

    #[test]
    fn static_handlers_need_their_rating() {
        assert!(sdvx_vf_class(&Ratings::new()).is_empty());
        let ratings = Ratings::from([("VF6".to_string(), 20.5)]);
        assert_eq!(sdvx_vf_class(&ratings)["vfClass"], 36);
    }

    #[test]
    fn custom_classes_win_the_merge() {
        let derived = ClassMap::from([("colour".to_string(), 3), ("vfClass".to_string(), 10)]);
        let custom = ClassMap::from([("colour".to_string(), 5), ("dan".to_string(), 2)]);
        let merged = merge_class_maps(derived, custom);
        assert_eq!(merged["colour"], 5);
        assert_eq!(merged["vfClass"], 10);
        assert_eq!(merged["dan"], 2);
    }

    #[test]
    fn out_of_range_classes_clamp_to_the_top_rung() {
        let candidate = ClassMap::from([("dan".to_string(), 99), ("bogus".to_string(), 1)]);
        let (classes, deltas) = process_class_deltas(Game::Iidx, Playtype::Sp, &candidate, None);
        assert_eq!(classes["dan"], 18);
        assert!(!classes.contains_key("bogus"));
        assert_eq!(deltas.len(), 1);
    }

    #[tokio::test]
    async fn classes_only_ever_improve() {
        let db = Database::in_memory();
        let registry = StrategyRegistry::builtin();
        let sink = BroadcastEventSink::new(8);
        let mut rx = sink.subscribe();

        let first = update_user_game_stats(&db, &registry, Some(&dan(9)), &sink, 1, Game::Iidx, Playtype::Sp)
            .await
            .expect("ugs");
        assert_eq!(first[0].old, None);
        assert_eq!(first[0].new, 9);
        assert!(matches!(rx.recv().await.expect("event"), EngineEvent::ClassUpdate { .. }));

        let worse = update_user_game_stats(&db, &registry, Some(&dan(8)), &sink, 1, Game::Iidx, Playtype::Sp)
            .await
            .expect("ugs");
        assert!(worse.is_empty());

        let better = update_user_game_stats(&db, &registry, Some(&dan(10)), &sink, 1, Game::Iidx, Playtype::Sp)
            .await
            .expect("ugs");
        assert_eq!(
            better,
            vec![ClassDelta {
                game: Game::Iidx,
                set: "dan".into(),
                playtype: Playtype::Sp,
                old: Some(9),
                new: 10,
            }]
        );

        let stats = db
            .game_stats
            .find_one(&Filter::new().eq("userId", 1), &FindOptions::default())
            .await
            .expect("find")
            .expect("stats");
        assert_eq!(stats.classes["dan"], 10);
        assert_eq!(db.class_achievements.count(&Filter::new()).await.expect("count"), 2);
    }

    #[tokio::test]
    async fn failing_class_handler_only_loses_custom_classes() {
        let db = Database::in_memory();
        let mut pb = mk_pb(1, "c1", 90.0);
        pb.game = Game::Sdvx;
        pb.playtype = Playtype::Single;
        pb.calculated_data.insert("VF6".into(), 0.4);
        db.personal_bests.upsert(pb).await.expect("upsert");

        let deltas = update_user_game_stats(
            &db,
            &StrategyRegistry::builtin(),
            Some(&FailingClasses),
            &NoopEventSink,
            1,
            Game::Sdvx,
            Playtype::Single,
        )
        .await
        .expect("ugs");

        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].set, "vfClass");
        assert_eq!(deltas[0].new, 0);
    }

    #[tokio::test]
    async fn unsupported_playtype_is_an_error() {
        let db = Database::in_memory();
        let err = update_user_game_stats(
            &db,
            &StrategyRegistry::default(),
            None,
            &NoopEventSink,
            1,
            Game::Iidx,
            Playtype::Sp,
        )
        .await
        .expect_err("unsupported");
        assert!(matches!(err, EngineError::UnsupportedPlaytype(Game::Iidx, Playtype::Sp)));
    }
}
