//! Overall score aggregation.

use eval_state::AgentKind;

use crate::pipeline::Pipeline;

pub const MIN_SCORE: f64 = 0.0;
pub const MAX_SCORE: f64 = 100.0;

/// Clamp to the score range; non-finite values count as the minimum.
pub fn clamp_score(score: f64) -> f64 {
    if score.is_finite() {
        score.clamp(MIN_SCORE, MAX_SCORE)
    } else {
        MIN_SCORE
    }
}

fn round_hundredths(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Weight-normalised mean of the succeeded kinds' scores, rounded to 0.01.
///
/// When every succeeded kind has zero weight the plain mean is used instead.
/// Returns `None` for an empty input.
pub fn overall_score(pipeline: &Pipeline, succeeded: &[(AgentKind, f64)]) -> Option<f64> {
    if succeeded.is_empty() {
        return None;
    }

    let total_weight: f64 = succeeded.iter().map(|(k, _)| pipeline.weight(*k)).sum();
    let mean = if total_weight > 0.0 {
        succeeded
            .iter()
            .map(|(k, s)| clamp_score(*s) * pipeline.weight(*k))
            .sum::<f64>()
            / total_weight
    } else {
        succeeded.iter().map(|(_, s)| clamp_score(*s)).sum::<f64>() / succeeded.len() as f64
    };

    Some(clamp_score(round_hundredths(mean)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{Stage, StageAgent};

    #[test]
    fn weighted_mean_over_succeeded_kinds_only() {
        let pipeline = Pipeline::default();
        // crawl 0.12, llm_test 0.15
        let score = overall_score(
            &pipeline,
            &[(AgentKind::Crawl, 80.0), (AgentKind::LlmTest, 60.0)],
        )
        .unwrap();
        // (80*0.12 + 60*0.15) / 0.27 = 68.888...
        assert_eq!(score, 68.89);
    }

    #[test]
    fn all_succeeded_with_same_score() {
        let pipeline = Pipeline::default();
        let all: Vec<_> = pipeline.kinds().into_iter().map(|k| (k, 42.0)).collect();
        assert_eq!(overall_score(&pipeline, &all), Some(42.0));
    }

    #[test]
    fn out_of_range_scores_are_clamped() {
        let pipeline = Pipeline::default();
        assert_eq!(
            overall_score(&pipeline, &[(AgentKind::Crawl, 250.0)]),
            Some(100.0)
        );
        assert_eq!(
            overall_score(&pipeline, &[(AgentKind::Crawl, -5.0)]),
            Some(0.0)
        );
    }

    #[test]
    fn zero_weights_fall_back_to_plain_mean() {
        let pipeline = Pipeline {
            stages: vec![Stage {
                agents: vec![
                    StageAgent::new(AgentKind::Crawl, true, 0.0),
                    StageAgent::new(AgentKind::Commerce, false, 0.0),
                ],
            }],
        };
        let score = overall_score(
            &pipeline,
            &[(AgentKind::Crawl, 50.0), (AgentKind::Commerce, 71.0)],
        );
        assert_eq!(score, Some(60.5));
    }

    #[test]
    fn nothing_succeeded_has_no_score() {
        assert_eq!(overall_score(&Pipeline::default(), &[]), None);
    }
}
