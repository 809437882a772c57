//! Per-score derived numbers. Each formula follows the community definition exactly,
//! including its clamps and rounding, so values stay comparable with other trackers.

use scorebook_core::{CalculatedData, Chart, Game, ScoreData};
use tracing::warn;

/// The "great function" used by BPI. `score == max` is its singular point; the
/// published formula substitutes `max * 0.8` there.
fn pika_great(score: f64, max: f64) -> f64 {
    if score == max {
        max * 0.8
    } else {
        1.0 + (score / max - 0.5) / (1.0 - score / max)
    }
}

/// Beat Performance Index of an IIDX EX score. Floors at -15, which also catches the
/// negative infinity produced below kaiden when the world record equals the kaiden
/// average. `None` when the index is otherwise undefined.
pub fn bpi(kaiden_ex: f64, wr_ex: f64, your_ex: f64, max: f64, pow_coef: Option<f64>) -> Option<f64> {
    let pow_coef = pow_coef.unwrap_or(1.175);
    let kaiden_pgf = pika_great(kaiden_ex, max);
    let s = pika_great(your_ex, max) / kaiden_pgf;
    let z = pika_great(wr_ex, max) / kaiden_pgf;

    let better = your_ex >= kaiden_ex;
    let (sign, log_s) = if better { (100.0, s.ln()) } else { (-100.0, -s.ln()) };
    let raw = sign * (log_s / z.ln()).powf(pow_coef) * 100.0;
    if raw == f64::NEG_INFINITY {
        return Some(-15.0);
    }
    if !raw.is_finite() {
        return None;
    }

    // Math.round semantics: halves round towards positive infinity.
    Some(((raw + 0.5).floor() / 100.0).max(-15.0))
}

pub fn chunithm_rating(score: f64, level_num: f64) -> f64 {
    let level_base = level_num * 100.0;

    let val = if score >= 1_007_500.0 {
        level_base + 200.0
    } else if score >= 1_005_000.0 {
        level_base + 150.0 + ((score - 1_005_000.0) * 10.0) / 500.0
    } else if score >= 1_000_000.0 {
        level_base + 100.0 + ((score - 1_000_000.0) * 5.0) / 500.0
    } else if score >= 975_000.0 {
        level_base + ((score - 975_000.0) * 2.0) / 500.0
    } else if score >= 925_000.0 {
        level_base - 300.0 + ((score - 925_000.0) * 3.0) / 500.0
    } else if score >= 900_000.0 {
        level_base - 500.0 + ((score - 900_000.0) * 4.0) / 500.0
    } else if score >= 800_000.0 {
        (level_base - 500.0) / 2.0 + ((score - 800_000.0) * ((level_base - 500.0) / 2.0)) / 100_000.0
    } else {
        0.0
    };

    (val.floor() / 100.0).max(0.0)
}

pub fn gitadora_skill(percent: f64, level_num: f64) -> f64 {
    let true_rating = (percent / 100.0) * level_num * 20.0;
    (true_rating * 100.0).floor() / 100.0
}

/// Marvelous Full Combo Points (LIFE4). Only MFCs on DIFFICULT and above earn points.
pub fn mfcp(lamp: &str, difficulty: &str, level_num: f64) -> Option<f64> {
    if lamp != "MARVELOUS FULL COMBO" {
        return None;
    }
    if difficulty == "BEGINNER" || difficulty == "BASIC" {
        return None;
    }

    let points = if level_num < 8.0 {
        return None;
    } else if level_num <= 10.0 {
        1.0
    } else if level_num <= 12.0 {
        2.0
    } else if level_num == 13.0 {
        4.0
    } else if level_num == 14.0 {
        8.0
    } else if level_num == 15.0 {
        15.0
    } else if level_num >= 16.0 {
        25.0
    } else {
        warn!(level_num, "invalid level passed to MFCP");
        return None;
    };
    Some(points)
}

pub fn vf_grade_coefficient(grade: &str) -> Option<f64> {
    Some(match grade {
        "S" => 1.05,
        "AAA+" => 1.02,
        "AAA" => 1.0,
        "AA+" => 0.97,
        "AA" => 0.94,
        "A+" => 0.91,
        "A" => 0.88,
        "B" => 0.85,
        "C" => 0.82,
        "D" => 0.8,
        _ => return None,
    })
}

pub fn vf_lamp_coefficient(lamp: &str) -> Option<f64> {
    Some(match lamp {
        "PERFECT ULTIMATE CHAIN" => 1.1,
        "ULTIMATE CHAIN" => 1.05,
        "EXCESSIVE CLEAR" => 1.02,
        "CLEAR" => 1.0,
        "FAILED" => 0.5,
        _ => return None,
    })
}

/// SDVX Volforce of a single play, floored to three decimal places.
pub fn vf6(grade: &str, lamp: &str, percent: f64, level_num: f64) -> Option<f64> {
    let Some(lamp_coef) = vf_lamp_coefficient(lamp) else {
        warn!(lamp, "invalid lamp passed to VF6");
        return None;
    };
    let Some(grade_coef) = vf_grade_coefficient(grade) else {
        warn!(grade, "invalid grade passed to VF6");
        return None;
    };

    let percent = percent / 100.0;
    if level_num == 0.0 || percent == 0.0 {
        return Some(0.0);
    }

    let real = (level_num * 2.0 * percent * grade_coef * lamp_coef) / 100.0;
    Some((real * 1000.0).floor() / 1000.0)
}

/// Percent implied by a raw score when the converter did not supply one. `None` for
/// games whose percent cannot be recovered from the score alone.
pub fn derive_percent(game: Game, chart: &Chart, score: f64) -> Option<f64> {
    let max = match game {
        Game::Iidx | Game::Bms => chart.data_f64("notecount").map(|n| n * 2.0)?,
        Game::Sdvx | Game::Usc => 10_000_000.0,
        Game::Ddr | Game::Chunithm => 1_000_000.0,
        Game::Gitadora => return None,
    };
    if max <= 0.0 {
        return None;
    }
    Some(score * 100.0 / max)
}

/// Everything derivable from one score and its chart.
pub fn calculate_score_data(game: Game, chart: &Chart, data: &ScoreData) -> CalculatedData {
    let mut out = CalculatedData::new();
    let mut put = |key: &str, value: Option<f64>| {
        if let Some(value) = value {
            out.insert(key.to_string(), value);
        }
    };

    match game {
        Game::Iidx => {
            let reference = (
                chart.data_f64("kaidenAverage"),
                chart.data_f64("worldRecord"),
                chart.data_f64("notecount"),
            );
            if let (Some(kaiden), Some(wr), Some(notecount)) = reference {
                put(
                    "BPI",
                    bpi(kaiden, wr, data.score, notecount * 2.0, chart.data_f64("bpiCoefficient")),
                );
            }
        }
        Game::Sdvx | Game::Usc => {
            put("VF6", vf6(&data.grade, &data.lamp, data.percent, chart.level_num));
        }
        Game::Gitadora => put("skill", Some(gitadora_skill(data.percent, chart.level_num))),
        Game::Chunithm => put("rating", Some(chunithm_rating(data.score, chart.level_num))),
        Game::Ddr => put("MFCP", mfcp(&data.lamp, &chart.difficulty, chart.level_num)),
        Game::Bms => {}
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::mk_chart;
    use scorebook_core::Playtype;

    const WR_AA: f64 = 3650.0;
    const KAVG_AA: f64 = 3204.0;
    const MAX_AA: f64 = 1834.0 * 2.0;
    const COEF_AA: Option<f64> = Some(1.25945);

    fn aa_bpi(ex: f64) -> f64 {
        bpi(KAVG_AA, WR_AA, ex, MAX_AA, COEF_AA).expect("defined")
    }

    #[test]
    fn bpi_anchors_at_kaiden_and_world_record() {
        assert_eq!(aa_bpi(KAVG_AA), 0.0);
        assert_eq!(aa_bpi(WR_AA), 100.0);
        assert_eq!(aa_bpi(3393.0), 10.02);
        assert_eq!(aa_bpi(3041.0), -5.0);
    }

    #[test]
    fn bpi_floors_at_minus_fifteen_and_handles_max_score() {
        assert_eq!(aa_bpi(0.0), -15.0);
        assert_eq!(aa_bpi(MAX_AA), 244.56);
    }

    #[test]
    fn bpi_is_undefined_when_world_record_equals_kaiden() {
        assert!(bpi(3000.0, 3000.0, 3100.0, 3600.0, None).is_none());
        assert!(bpi(3000.0, 3000.0, 3000.0, 3600.0, None).is_none());
        assert_eq!(bpi(3000.0, 3000.0, 2900.0, 3600.0, None), Some(-15.0));
    }

    #[test]
    fn percent_is_derived_from_score_and_chart() {
        let mut chart = mk_chart("c", Game::Iidx, Playtype::Sp, 12.0);
        assert_eq!(derive_percent(Game::Iidx, &chart, 1500.0), None);

        chart.data.insert("notecount".into(), 1000.into());
        assert_eq!(derive_percent(Game::Iidx, &chart, 1500.0), Some(75.0));
        assert_eq!(derive_percent(Game::Sdvx, &chart, 9_500_000.0), Some(95.0));
        assert_eq!(derive_percent(Game::Gitadora, &chart, 80.0), None);
    }

    #[test]
    fn chunithm_rating_follows_band_table() {
        assert_eq!(chunithm_rating(1_008_000.0, 13.5), 15.5);
        assert_eq!(chunithm_rating(1_002_500.0, 13.0), 14.25);
        assert_eq!(chunithm_rating(950_000.0, 12.0), 10.5);
        assert_eq!(chunithm_rating(850_000.0, 10.0), 3.75);
        assert_eq!(chunithm_rating(500_000.0, 14.0), 0.0);
    }

    #[test]
    fn gitadora_skill_floors_to_two_places() {
        assert_eq!(gitadora_skill(85.5, 6.5), 111.15);
    }

    #[test]
    fn mfcp_levels() {
        assert_eq!(mfcp("FAILED", "EXPERT", 10.0), None);
        assert_eq!(mfcp("MARVELOUS FULL COMBO", "BASIC", 10.0), None);
        assert_eq!(mfcp("MARVELOUS FULL COMBO", "EXPERT", 7.0), None);
        assert_eq!(mfcp("MARVELOUS FULL COMBO", "EXPERT", 9.0), Some(1.0));
        assert_eq!(mfcp("MARVELOUS FULL COMBO", "EXPERT", 12.0), Some(2.0));
        assert_eq!(mfcp("MARVELOUS FULL COMBO", "EXPERT", 13.0), Some(4.0));
        assert_eq!(mfcp("MARVELOUS FULL COMBO", "EXPERT", 14.0), Some(8.0));
        assert_eq!(mfcp("MARVELOUS FULL COMBO", "EXPERT", 15.0), Some(15.0));
        assert_eq!(mfcp("MARVELOUS FULL COMBO", "CHALLENGE", 19.0), Some(25.0));
        assert_eq!(mfcp("MARVELOUS FULL COMBO", "EXPERT", f64::NAN), None);
    }

    #[test]
    fn vf6_uses_grade_and_lamp_coefficients() {
        assert_eq!(vf6("AAA+", "EXCESSIVE CLEAR", 98.5, 17.0), Some(0.358));
        assert_eq!(vf6("S", "PERFECT ULTIMATE CHAIN", 100.0, 20.0), Some(0.462));
        assert_eq!(vf6("S", "CLEAR", 0.0, 20.0), Some(0.0));
        assert_eq!(vf6("Z", "CLEAR", 90.0, 20.0), None);
    }
}
