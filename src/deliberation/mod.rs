//! Multi-agent deliberation engine.
//!
//! Runs a bounded multi-round protocol across the provider agents: each
//! round fans the question (plus peer opinions from the previous round) out
//! in parallel, opinions are parsed into structured verdicts, and a
//! convergence score decides whether the panel exits early. Final-round
//! opinions are voted on and cross-validated.

pub mod crossval;

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::enrichment::ContextEnricher;
use crate::invoker::ProviderInvoker;
use crate::models::{AgentRequest, AgentSignal, Direction, Provider};

pub use crossval::{cross_validate, ConflictType, CrossValidationResult, SignalConflict};

/// Convergence at or above this marks consensus as emerging.
pub const CONSENSUS_THRESHOLD: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VotingStrategy {
    /// Decision only if every agent agrees.
    Unanimous,
    /// Plurality wins; ties broken by summed confidence.
    Majority,
    /// Winner needs at least two thirds of the agents.
    Supermajority,
    /// Confidence weighted by signal-type priority.
    Weighted,
}

/// Symbol/strategy pair the engine enriches round-1 prompts with.
#[derive(Debug, Clone)]
pub struct EnrichmentTarget {
    pub symbol: String,
    pub strategy_type: String,
}

#[derive(Debug, Clone)]
pub struct DeliberationOptions {
    pub max_rounds: usize,
    pub min_confidence: f64,
    pub voting_strategy: VotingStrategy,
    /// Wall-clock budget for the whole deliberation.
    pub deadline: Option<Duration>,
    pub enrichment: Option<EnrichmentTarget>,
}

impl Default for DeliberationOptions {
    fn default() -> Self {
        Self {
            max_rounds: 3,
            min_confidence: 0.7,
            voting_strategy: VotingStrategy::Majority,
            deadline: None,
            enrichment: None,
        }
    }
}

/// One agent's structured verdict within a round.
#[derive(Debug, Clone, Serialize)]
pub struct AgentOpinion {
    pub provider: Provider,
    pub direction: Direction,
    pub confidence: f64,
    pub position: String,
    pub reasoning: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeliberationRound {
    pub round_number: usize,
    pub opinions: Vec<AgentOpinion>,
    pub convergence_score: f64,
    pub consensus_emerging: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct FinalVote {
    pub agent: String,
    pub confidence: f64,
    pub position: String,
    pub reasoning: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeliberationResult {
    pub decision: String,
    pub confidence: f64,
    pub rounds: Vec<DeliberationRound>,
    pub final_votes: Vec<FinalVote>,
    pub dissenting_opinions: Vec<FinalVote>,
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DeliberationStats {
    pub total_deliberations: u64,
    pub rounds_executed: u64,
    pub early_exits: u64,
    pub timeouts: u64,
}

pub struct DeliberationEngine {
    invoker: Arc<dyn ProviderInvoker>,
    enricher: Arc<ContextEnricher>,
    stats: Mutex<DeliberationStats>,
}

impl DeliberationEngine {
    pub fn new(invoker: Arc<dyn ProviderInvoker>, enricher: Arc<ContextEnricher>) -> Self {
        Self {
            invoker,
            enricher,
            stats: Mutex::new(DeliberationStats::default()),
        }
    }

    /// Run the deliberation protocol and return a voted decision.
    ///
    /// Failed agents are treated as absent for the round; a deadline
    /// returns a partial result flagged as timed out.
    pub async fn deliberate(
        &self,
        question: &str,
        agents: &[Provider],
        options: DeliberationOptions,
    ) -> DeliberationResult {
        self.stats.lock().total_deliberations += 1;
        let start = Instant::now();

        info!(
            "Deliberation started: {} agents, max {} rounds",
            agents.len(),
            options.max_rounds
        );

        let market_context = self.maybe_enrich(question, &options).await;

        let mut rounds: Vec<DeliberationRound> = Vec::new();
        let mut timed_out = false;
        let mut timed_out_agents: Vec<String> = Vec::new();

        for round_number in 1..=options.max_rounds.max(1) {
            let remaining = match options.deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_sub(start.elapsed());
                    if remaining.is_zero() {
                        timed_out = true;
                        break;
                    }
                    Some(remaining)
                }
                None => None,
            };

            let previous = rounds.last().map(|r: &DeliberationRound| r.opinions.as_slice());
            let opinions = self
                .run_round(
                    question,
                    agents,
                    round_number,
                    previous,
                    market_context.as_ref(),
                    remaining,
                    &mut timed_out_agents,
                )
                .await;

            if !timed_out_agents.is_empty() {
                timed_out = true;
            }

            let convergence_score = convergence_score(&opinions);
            let consensus_emerging = convergence_score >= CONSENSUS_THRESHOLD;
            let mean_confidence = mean_confidence(&opinions);

            debug!(
                "Round {}: {} opinions, convergence {:.2}, mean confidence {:.2}",
                round_number,
                opinions.len(),
                convergence_score,
                mean_confidence
            );

            rounds.push(DeliberationRound {
                round_number,
                opinions,
                convergence_score,
                consensus_emerging,
            });
            self.stats.lock().rounds_executed += 1;

            if consensus_emerging && mean_confidence >= options.min_confidence {
                if round_number < options.max_rounds {
                    self.stats.lock().early_exits += 1;
                    info!("Consensus emerged in round {}, exiting early", round_number);
                }
                break;
            }
            if timed_out {
                break;
            }
        }

        if timed_out {
            self.stats.lock().timeouts += 1;
        }

        self.tally(
            question,
            rounds,
            options.voting_strategy,
            timed_out,
            timed_out_agents,
            market_context,
        )
    }

    pub fn stats(&self) -> DeliberationStats {
        self.stats.lock().clone()
    }

    // ------------------------------------------------------------------
    // Rounds
    // ------------------------------------------------------------------

    async fn maybe_enrich(&self, question: &str, options: &DeliberationOptions) -> Option<Value> {
        let target = options.enrichment.as_ref()?;
        if !self.enricher.should_consult(question) {
            debug!("Enrichment skipped for this deliberation");
            return None;
        }
        let enriched = self
            .enricher
            .enrich(&target.symbol, &target.strategy_type, &Map::new())
            .await;
        enriched.get("market_context").cloned()
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_round(
        &self,
        question: &str,
        agents: &[Provider],
        round_number: usize,
        previous: Option<&[AgentOpinion]>,
        market_context: Option<&Value>,
        remaining: Option<Duration>,
        timed_out_agents: &mut Vec<String>,
    ) -> Vec<AgentOpinion> {
        let requests: Vec<(Provider, AgentRequest)> = agents
            .iter()
            .map(|&agent| {
                let prompt = match previous {
                    None => self.round_one_prompt(agent, question, market_context),
                    Some(opinions) => cross_examination_prompt(agent, question, round_number, opinions),
                };
                (agent, AgentRequest::new(agent, "deliberation", prompt))
            })
            .collect();

        // Each dispatch is independent: one agent failing or timing out
        // must not cancel the others.
        let futures = requests.into_iter().map(|(agent, request)| {
            let invoker = self.invoker.clone();
            async move {
                let outcome = match remaining {
                    Some(window) => tokio::time::timeout(window, invoker.invoke(request))
                        .await
                        .map_err(|_| ()),
                    None => Ok(invoker.invoke(request).await),
                };
                (agent, outcome)
            }
        });

        let mut opinions = Vec::new();
        for (agent, outcome) in join_all(futures).await {
            match outcome {
                Err(()) => {
                    warn!("Agent {} timed out in round {}", agent, round_number);
                    timed_out_agents.push(agent.as_str().to_string());
                }
                Ok(response) if !response.success => {
                    warn!(
                        "Agent {} absent from round {}: {}",
                        agent,
                        round_number,
                        response.error.as_deref().unwrap_or("unknown failure")
                    );
                }
                Ok(response) => opinions.push(parse_opinion(agent, &response.content)),
            }
        }
        opinions
    }

    fn round_one_prompt(&self, agent: Provider, question: &str, market_context: Option<&Value>) -> String {
        let base = format!("{question}\n\n{VERDICT_BLOCK}");
        self.enricher.build_enriched_prompt(agent, &base, market_context, &[])
    }

    // ------------------------------------------------------------------
    // Tally
    // ------------------------------------------------------------------

    fn tally(
        &self,
        question: &str,
        rounds: Vec<DeliberationRound>,
        strategy: VotingStrategy,
        timed_out: bool,
        timed_out_agents: Vec<String>,
        market_context: Option<Value>,
    ) -> DeliberationResult {
        let final_opinions: &[AgentOpinion] = rounds.last().map(|r| r.opinions.as_slice()).unwrap_or(&[]);
        let final_convergence = rounds.last().map(|r| r.convergence_score).unwrap_or(0.0);

        let winner = apply_voting(strategy, final_opinions);

        let (decision, confidence, dissenting) = match winner {
            Some(direction) => {
                let winning: Vec<&AgentOpinion> =
                    final_opinions.iter().filter(|o| o.direction == direction).collect();
                let mean = winning.iter().map(|o| o.confidence).sum::<f64>() / winning.len().max(1) as f64;
                let confidence = (mean * final_convergence).clamp(0.0, 1.0);
                let dissenting = final_opinions
                    .iter()
                    .filter(|o| o.direction != direction)
                    .map(to_vote)
                    .collect();
                (direction.as_str().to_string(), confidence, dissenting)
            }
            None => ("no consensus".to_string(), 0.0, final_opinions.iter().map(to_vote).collect()),
        };

        let signals: Vec<AgentSignal> = final_opinions
            .iter()
            .map(|o| {
                AgentSignal::new(
                    o.provider.as_str(),
                    o.provider.signal_type(),
                    o.direction,
                    o.confidence,
                    o.reasoning.clone(),
                )
            })
            .collect();
        let cross_validation = cross_validate(&signals);

        let mut metadata = Map::new();
        metadata.insert("deliberation_id".into(), json!(uuid::Uuid::new_v4().to_string()));
        metadata.insert("question".into(), json!(question));
        metadata.insert(
            "cross_validation".into(),
            serde_json::to_value(&cross_validation).unwrap_or(Value::Null),
        );
        metadata.insert("timed_out".into(), json!(timed_out));
        metadata.insert("timed_out_agents".into(), json!(timed_out_agents));
        metadata.insert("market_context_attached".into(), json!(market_context.is_some()));
        metadata.insert(
            "integration_stats".into(),
            serde_json::to_value(self.enricher.stats()).unwrap_or(Value::Null),
        );

        info!(
            "Deliberation finished: decision={}, confidence={:.2}, rounds={}",
            decision,
            confidence,
            rounds.len()
        );

        DeliberationResult {
            decision,
            confidence,
            final_votes: final_opinions.iter().map(to_vote).collect(),
            dissenting_opinions: dissenting,
            rounds,
            metadata,
        }
    }
}

const VERDICT_BLOCK: &str = "Respond with your assessment in exactly this format:\n\
DIRECTION: bullish|bearish|neutral\n\
CONFIDENCE: 0.00-1.00\n\
POSITION: one-sentence position\n\
REASONING: key arguments supporting your position";

/// Round r>1 prompt: peers from round r-1 plus an instruction to critique,
/// agree, or refine.
fn cross_examination_prompt(
    agent: Provider,
    question: &str,
    round_number: usize,
    previous: &[AgentOpinion],
) -> String {
    let peers: Vec<String> = previous
        .iter()
        .filter(|o| o.provider != agent)
        .map(|o| {
            let signal = AgentSignal::new(
                o.provider.as_str(),
                o.provider.signal_type(),
                o.direction,
                o.confidence,
                o.position.clone(),
            );
            signal.to_compact()
        })
        .collect();

    format!(
        "Deliberation round {round_number} on the question:\n{question}\n\n\
Peer opinions from the previous round:\n{}\n\n\
Critique these opinions where you disagree, acknowledge where you agree, \
and refine your own position accordingly.\n\n{VERDICT_BLOCK}",
        if peers.is_empty() {
            "(no peer opinions available)".to_string()
        } else {
            peers.join("\n")
        }
    )
}

/// Parse an agent's reply into a structured opinion. Lenient: missing
/// fields fall back to a neutral 0.5-confidence verdict built from the
/// raw content.
pub fn parse_opinion(provider: Provider, content: &str) -> AgentOpinion {
    let mut direction = None;
    let mut confidence = None;
    let mut position = None;
    let mut reasoning = None;

    for line in content.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim().to_ascii_uppercase().as_str() {
            "DIRECTION" => direction = Direction::parse(value),
            "CONFIDENCE" => confidence = parse_confidence(value),
            "POSITION" => {
                if !value.is_empty() {
                    position = Some(value.to_string());
                }
            }
            "REASONING" => {
                if !value.is_empty() {
                    reasoning = Some(value.to_string());
                }
            }
            _ => {}
        }
    }

    // Fallback: scan the body for a direction word.
    let direction = direction.or_else(|| scan_direction(content)).unwrap_or(Direction::Neutral);

    let first_line = content.lines().find(|l| !l.trim().is_empty()).unwrap_or("").trim();
    AgentOpinion {
        provider,
        direction,
        confidence: confidence.unwrap_or(0.5).clamp(0.0, 1.0),
        position: position.unwrap_or_else(|| first_line.chars().take(200).collect()),
        reasoning: reasoning.unwrap_or_else(|| content.trim().chars().take(500).collect()),
    }
}

fn parse_confidence(value: &str) -> Option<f64> {
    let trimmed = value.trim();
    let (number, percent) = match trimmed.strip_suffix('%') {
        Some(stripped) => (stripped.trim(), true),
        None => (trimmed, false),
    };
    let parsed = number.parse::<f64>().ok()?;
    if !parsed.is_finite() {
        return None;
    }
    Some(if percent || parsed > 1.0 { parsed / 100.0 } else { parsed })
}

fn scan_direction(content: &str) -> Option<Direction> {
    let text = content.to_lowercase();
    for (word, direction) in [
        ("bullish", Direction::Bullish),
        ("bearish", Direction::Bearish),
        ("neutral", Direction::Neutral),
    ] {
        if text.contains(word) {
            return Some(direction);
        }
    }
    None
}

/// Pairwise agreement on direction weighted by confidence, normalized to
/// [0, 1]. Zero or one opinion scores 1.0.
pub fn convergence_score(opinions: &[AgentOpinion]) -> f64 {
    if opinions.len() <= 1 {
        return 1.0;
    }

    let mut agreeing = 0.0;
    let mut total = 0.0;
    for (i, a) in opinions.iter().enumerate() {
        for b in &opinions[i + 1..] {
            let weight = (a.confidence + b.confidence) / 2.0;
            total += weight;
            if a.direction == b.direction {
                agreeing += weight;
            }
        }
    }

    if total > 0.0 {
        (agreeing / total).clamp(0.0, 1.0)
    } else {
        1.0
    }
}

fn mean_confidence(opinions: &[AgentOpinion]) -> f64 {
    if opinions.is_empty() {
        return 0.0;
    }
    opinions.iter().map(|o| o.confidence).sum::<f64>() / opinions.len() as f64
}

fn to_vote(opinion: &AgentOpinion) -> FinalVote {
    FinalVote {
        agent: opinion.provider.as_str().to_string(),
        confidence: opinion.confidence,
        position: opinion.position.clone(),
        reasoning: opinion.reasoning.clone(),
    }
}

/// Apply a voting strategy over final-round opinions. `None` means no
/// consensus under the strategy's rules.
pub fn apply_voting(strategy: VotingStrategy, opinions: &[AgentOpinion]) -> Option<Direction> {
    if opinions.is_empty() {
        return None;
    }

    let tally = |direction: Direction| -> (usize, f64) {
        let matching: Vec<&AgentOpinion> = opinions.iter().filter(|o| o.direction == direction).collect();
        (matching.len(), matching.iter().map(|o| o.confidence).sum())
    };
    let directions = [Direction::Bullish, Direction::Bearish, Direction::Neutral];

    match strategy {
        VotingStrategy::Unanimous => {
            let first = opinions[0].direction;
            opinions.iter().all(|o| o.direction == first).then_some(first)
        }
        VotingStrategy::Majority => directions
            .iter()
            .map(|&d| (d, tally(d)))
            .filter(|(_, (count, _))| *count > 0)
            .max_by(|(_, (ac, aconf)), (_, (bc, bconf))| {
                ac.cmp(bc).then(aconf.partial_cmp(bconf).unwrap_or(std::cmp::Ordering::Equal))
            })
            .map(|(d, _)| d),
        VotingStrategy::Supermajority => {
            let winner = apply_voting(VotingStrategy::Majority, opinions)?;
            let (count, _) = tally(winner);
            let needed = (2 * opinions.len() + 2) / 3;
            (count >= needed).then_some(winner)
        }
        VotingStrategy::Weighted => directions
            .iter()
            .map(|&d| {
                let weight: f64 = opinions
                    .iter()
                    .filter(|o| o.direction == d)
                    .map(|o| o.confidence * o.provider.signal_type().priority() as f64)
                    .sum();
                (d, weight)
            })
            .filter(|(_, w)| *w > 0.0)
            .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(d, _)| d),
    }
}
