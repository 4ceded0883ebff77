//! Signal cross-validation.
//!
//! A pure post-hoc audit over structured agent signals: detects direction
//! conflicts, scores agreement, and proposes a resolution. No I/O, no
//! cache; agreement scoring is symmetric in input order (the resolution's
//! primary signal falls back to listing order only on exact priority and
//! confidence ties).

use serde::Serialize;

use crate::models::{AgentSignal, Direction, SignalType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    SameDomainDisagreement,
    TechnicalVsSentiment,
    QuantitativeVsSentiment,
    QuantitativeVsTechnical,
    GeneralDisagreement,
}

#[derive(Debug, Clone, Serialize)]
pub struct SignalConflict {
    pub agents: [String; 2],
    pub directions: [Direction; 2],
    pub confidences: [f64; 2],
    #[serde(rename = "type")]
    pub conflict_type: ConflictType,
}

#[derive(Debug, Clone, Serialize)]
pub struct CrossValidationResult {
    pub agents_agree: bool,
    /// 0.0 (total disagreement) to 1.0 (full agreement).
    pub agreement_score: f64,
    pub conflicts: Vec<SignalConflict>,
    pub resolution: String,
    pub signals: Vec<AgentSignal>,
}

/// Cross-validate a set of agent signals.
///
/// Fewer than two signals agree trivially with score 1.0. Full agreement is
/// scored from mean confidence shaved by the confidence spread; a split is
/// scored from the majority fraction, capped at 0.6.
pub fn cross_validate(signals: &[AgentSignal]) -> CrossValidationResult {
    if signals.len() < 2 {
        return CrossValidationResult {
            agents_agree: true,
            agreement_score: 1.0,
            conflicts: Vec::new(),
            resolution: "Only one signal provided".to_string(),
            signals: signals.to_vec(),
        };
    }

    let all_agree = signals.iter().all(|s| s.direction == signals[0].direction);

    let agreement_score = if all_agree {
        let confidences: Vec<f64> = signals.iter().map(|s| s.confidence).collect();
        let avg = confidences.iter().sum::<f64>() / confidences.len() as f64;
        let spread = confidences.iter().cloned().fold(f64::MIN, f64::max)
            - confidences.iter().cloned().fold(f64::MAX, f64::min);
        avg * (1.0 - spread * 0.5)
    } else {
        let majority = majority_count(signals);
        majority as f64 / signals.len() as f64 * 0.6
    };
    let agreement_score = (agreement_score * 1000.0).round() / 1000.0;

    let mut conflicts = Vec::new();
    for (i, first) in signals.iter().enumerate() {
        for second in &signals[i + 1..] {
            if first.direction != second.direction {
                conflicts.push(SignalConflict {
                    agents: [first.agent.clone(), second.agent.clone()],
                    directions: [first.direction, second.direction],
                    confidences: [first.confidence, second.confidence],
                    conflict_type: classify_conflict(first.signal_type, second.signal_type),
                });
            }
        }
    }

    let resolution = resolve_conflicts(signals, &conflicts);

    CrossValidationResult {
        agents_agree: all_agree,
        agreement_score,
        conflicts,
        resolution,
        signals: signals.to_vec(),
    }
}

fn classify_conflict(a: SignalType, b: SignalType) -> ConflictType {
    use SignalType::*;
    if a == b {
        return ConflictType::SameDomainDisagreement;
    }
    match (a, b) {
        (Technical, Sentiment) | (Sentiment, Technical) => ConflictType::TechnicalVsSentiment,
        (Quantitative, Sentiment) | (Sentiment, Quantitative) => ConflictType::QuantitativeVsSentiment,
        (Quantitative, Technical) | (Technical, Quantitative) => ConflictType::QuantitativeVsTechnical,
        _ => ConflictType::GeneralDisagreement,
    }
}

fn majority_count(signals: &[AgentSignal]) -> usize {
    [Direction::Bullish, Direction::Bearish, Direction::Neutral]
        .iter()
        .map(|d| signals.iter().filter(|s| s.direction == *d).count())
        .max()
        .unwrap_or(0)
}

fn majority_direction(signals: &[AgentSignal]) -> (Direction, usize) {
    [Direction::Bullish, Direction::Bearish, Direction::Neutral]
        .iter()
        .map(|d| (*d, signals.iter().filter(|s| s.direction == *d).count()))
        .max_by_key(|(_, count)| *count)
        .unwrap_or((Direction::Neutral, 0))
}

/// Priority rule: quantitative > technical > sentiment. With a majority,
/// recommend following it at reduced size; without one, defer to the
/// highest-priority signal, also at reduced size.
fn resolve_conflicts(signals: &[AgentSignal], conflicts: &[SignalConflict]) -> String {
    if conflicts.is_empty() {
        return "No conflicts detected: agents agree".to_string();
    }

    // Conflicts exist, so there are at least two signals. Ties on
    // (priority, confidence) keep the earliest signal.
    let mut best = &signals[0];
    for signal in &signals[1..] {
        let ordering = (signal.signal_type.priority(), signal.confidence)
            .partial_cmp(&(best.signal_type.priority(), best.confidence))
            .unwrap_or(std::cmp::Ordering::Equal);
        if ordering == std::cmp::Ordering::Greater {
            best = signal;
        }
    }

    let (majority_dir, majority) = majority_direction(signals);

    if majority * 2 > signals.len() {
        format!(
            "Majority ({}/{}) favors {}. Primary signal from {} ({}). \
             Recommended: follow majority with adjusted position size.",
            majority,
            signals.len(),
            majority_dir,
            best.agent,
            best.signal_type,
        )
    } else {
        format!(
            "No clear majority. Highest-priority signal from {} ({}, conf={:.0}%) suggests {}. \
             Recommended: reduce position size due to agent disagreement.",
            best.agent,
            best.signal_type,
            best.confidence * 100.0,
            best.direction,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal(agent: &str, st: SignalType, dir: Direction, conf: f64) -> AgentSignal {
        AgentSignal::new(agent, st, dir, conf, format!("{agent} reasoning"))
    }

    #[test]
    fn single_signal_agrees_trivially() {
        let signals = vec![signal("deepseek", SignalType::Quantitative, Direction::Bullish, 0.9)];
        let result = cross_validate(&signals);
        assert!(result.agents_agree);
        assert_eq!(result.agreement_score, 1.0);
        assert!(result.conflicts.is_empty());

        let empty = cross_validate(&[]);
        assert!(empty.agents_agree);
        assert_eq!(empty.agreement_score, 1.0);
    }

    #[test]
    fn full_agreement_scored_from_confidence_spread() {
        let signals = vec![
            signal("deepseek", SignalType::Quantitative, Direction::Bullish, 0.8),
            signal("qwen", SignalType::Technical, Direction::Bullish, 0.9),
            signal("perplexity", SignalType::Sentiment, Direction::Bullish, 0.7),
        ];
        let result = cross_validate(&signals);
        assert!(result.agents_agree);
        // avg 0.8, spread 0.2 -> 0.8 * 0.9 = 0.72
        assert!((result.agreement_score - 0.72).abs() < 1e-9);
        assert!(result.conflicts.is_empty());
        assert_eq!(result.resolution, "No conflicts detected: agents agree");
    }

    #[test]
    fn two_vs_one_conflict_resolution() {
        let signals = vec![
            signal("deepseek", SignalType::Quantitative, Direction::Bearish, 0.82),
            signal("qwen", SignalType::Technical, Direction::Bullish, 0.71),
            signal("perplexity", SignalType::Sentiment, Direction::Bearish, 0.65),
        ];
        let result = cross_validate(&signals);

        assert!(!result.agents_agree);
        assert!((result.agreement_score - 0.4).abs() < 1e-9);
        assert_eq!(result.conflicts.len(), 2);

        let types: Vec<ConflictType> = result.conflicts.iter().map(|c| c.conflict_type).collect();
        assert!(types.contains(&ConflictType::QuantitativeVsTechnical));
        assert!(types.contains(&ConflictType::TechnicalVsSentiment));

        assert!(result.resolution.contains("Majority (2/3) favors bearish"));
        assert!(result.resolution.contains("deepseek (quantitative)"));
        assert!(result.resolution.contains("adjusted position size"));
    }

    #[test]
    fn no_majority_defers_to_priority() {
        let signals = vec![
            signal("deepseek", SignalType::Quantitative, Direction::Bearish, 0.6),
            signal("qwen", SignalType::Technical, Direction::Bullish, 0.9),
        ];
        let result = cross_validate(&signals);
        assert!(!result.agents_agree);
        assert!(result.resolution.contains("No clear majority"));
        assert!(result.resolution.contains("deepseek (quantitative"));
        assert!(result.resolution.contains("suggests bearish"));
        assert!(result.resolution.contains("reduce position size"));
    }

    #[test]
    fn same_domain_disagreement_classified() {
        let signals = vec![
            signal("qwen", SignalType::Technical, Direction::Bullish, 0.7),
            signal("qwen-b", SignalType::Technical, Direction::Bearish, 0.6),
        ];
        let result = cross_validate(&signals);
        assert_eq!(result.conflicts[0].conflict_type, ConflictType::SameDomainDisagreement);
    }

    #[test]
    fn priority_tie_keeps_earliest_signal() {
        // Same signal type, same confidence: the first listed signal is
        // named as primary in the resolution.
        let signals = vec![
            signal("qwen-a", SignalType::Technical, Direction::Bullish, 0.7),
            signal("qwen-b", SignalType::Technical, Direction::Bearish, 0.7),
        ];
        let result = cross_validate(&signals);
        assert!(result.resolution.contains("qwen-a"));
        assert!(!result.resolution.contains("qwen-b"));

        let reversed = vec![signals[1].clone(), signals[0].clone()];
        let result = cross_validate(&reversed);
        assert!(result.resolution.contains("qwen-b"));
    }

    #[test]
    fn symmetric_in_input_order() {
        let a = signal("deepseek", SignalType::Quantitative, Direction::Bearish, 0.82);
        let b = signal("qwen", SignalType::Technical, Direction::Bullish, 0.71);
        let c = signal("perplexity", SignalType::Sentiment, Direction::Bearish, 0.65);

        let orderings = [
            vec![a.clone(), b.clone(), c.clone()],
            vec![c.clone(), b.clone(), a.clone()],
            vec![b.clone(), a.clone(), c.clone()],
        ];
        let results: Vec<CrossValidationResult> = orderings.iter().map(|o| cross_validate(o)).collect();
        for result in &results[1..] {
            assert_eq!(result.agents_agree, results[0].agents_agree);
            assert!((result.agreement_score - results[0].agreement_score).abs() < 1e-9);
            assert_eq!(result.conflicts.len(), results[0].conflicts.len());
            assert_eq!(result.resolution, results[0].resolution);
        }
    }
}
