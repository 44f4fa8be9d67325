//! The three-stage deliberation engine.
//!
//! Grounded in the original's `council.py`: Stage 1 fans the query out to the
//! roster, Stage 2 blind-ranks the anonymized replies, Stage 3 has the
//! chairman synthesize. Every piece of free-form model text is treated as a
//! noisy oracle — parsing never panics, it degrades to an empty or fallback
//! value.

use std::collections::HashMap;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::fanout::fanout;
use crate::model_client::{ModelClient, ModelReply, Turn};

pub const ERROR_MODEL_ID: &str = "error";
pub const CHAIRMAN_FAILED_MESSAGE: &str = "Error: Unable to generate final synthesis.";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ranking {
    pub model_id: String,
    pub raw_text: String,
    pub parsed_order: Vec<String>,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Synthesis {
    pub chairman_id: String,
    pub content: String,
    pub primary_source: Option<String>,
    pub top_ranked_model: Option<String>,
    pub confidence: u8,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateRanking {
    pub model_id: String,
    pub average_rank: f64,
    pub rankings_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Metadata {
    pub label_to_model: HashMap<String, String>,
    pub aggregate_rankings: Vec<AggregateRanking>,
    pub total_prompt_tokens: u64,
    pub total_completion_tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouncilResult {
    pub stage1: Vec<ModelReply>,
    pub stage2: Vec<Ranking>,
    pub stage3: Synthesis,
    pub metadata: Metadata,
}

const SOLUTION_PROMPT_GUIDANCE: &str = "\
RESPONSE GUIDANCE:
- Answer directly. Lead with the answer, not preamble or restatement of the question.
- Use plain text unless the user explicitly asks for code.
- If code is explicitly requested, provide only the code without extra commentary.
- Keep responses concise. Use bullet points for lists, short paragraphs for prose.
- Make reasonable assumptions if details are missing.
- Do NOT ask questions or request clarification.
- Do NOT add disclaimers, caveats, or offers of further help.
- Do NOT reference tools, files, or the deliberation process.";

const RANKING_RUBRIC: &str = "\
Rank the responses below from best to worst. Pick the criteria set that fits the request.

PLAIN TEXT CRITERIA: Correctness 45%, Completeness 20%, Clarity 15%, Safety/Security 10%, Practicality 10%.
CODE CRITERIA: Correctness 40%, Security 20%, Code Quality 15%, Performance 10%, Maintainability 10%, Standard Practices 5%.

End your answer with a line `FINAL RANKING:` followed by a numbered list of labels, for example:
FINAL RANKING:
1. Response X
2. Response Y
3. Response Z";

const SYNTHESIS_RULES: &str = "\
SYNTHESIS RULES:
- Prioritize correctness and security over style.
- Prefer the position the responses agree on.
- Synthesize the best aspects of multiple responses rather than picking just one verbatim.
- Use plain text unless the user explicitly asked for code.
- Do NOT add meta-commentary, restate the question, or add disclaimers.
- Be concise.

End your response with exactly these two lines:
# Primary source: <model name, or \"Synthesized from multiple models\" if combining>
# Confidence: <0-100>% (your confidence that this response is correct)";

/// Runs the three-stage deliberation for one user query against a captured
/// [`Config`] snapshot. The snapshot is taken once by the caller and used
/// for the whole run, so a concurrent roster update never changes the
/// members mid-flight (spec §4.C concurrency note).
pub struct CouncilEngine {
    client: ModelClient,
}

impl CouncilEngine {
    pub fn new(client: ModelClient) -> Self {
        Self { client }
    }

    pub async fn run(&self, config: &Config, user_query: &str) -> CouncilResult {
        let timeout = config.model_timeout;

        let stage1 = self.stage1(config, user_query, timeout).await;
        if stage1.is_empty() {
            return CouncilResult {
                stage1: Vec::new(),
                stage2: Vec::new(),
                stage3: error_synthesis(),
                metadata: Metadata::default(),
            };
        }

        let labels = assign_labels(&stage1);
        let label_to_model: HashMap<String, String> = labels
            .iter()
            .zip(stage1.iter())
            .map(|(label, reply)| (label.clone(), reply.model_id.clone()))
            .collect();

        let stage2 = self
            .stage2(config, user_query, &stage1, &labels, timeout)
            .await;

        let stage1_order: Vec<String> = stage1.iter().map(|r| r.model_id.clone()).collect();
        let aggregate = aggregate_rankings(&stage2, &label_to_model, &stage1_order);

        let stage3 = self
            .stage3(config, user_query, &stage1, &stage2, &aggregate, timeout)
            .await;

        let total_prompt_tokens: u64 = stage1.iter().map(|r| r.prompt_tokens).sum::<u64>()
            + stage2.iter().map(|r| r.prompt_tokens).sum::<u64>()
            + stage3.prompt_tokens;
        let total_completion_tokens: u64 = stage1.iter().map(|r| r.completion_tokens).sum::<u64>()
            + stage2.iter().map(|r| r.completion_tokens).sum::<u64>()
            + stage3.completion_tokens;

        CouncilResult {
            stage1,
            stage2,
            stage3,
            metadata: Metadata {
                label_to_model,
                aggregate_rankings: aggregate,
                total_prompt_tokens,
                total_completion_tokens,
            },
        }
    }

    async fn stage1(&self, config: &Config, user_query: &str, timeout: Duration) -> Vec<ModelReply> {
        let messages = vec![
            Turn {
                role: "user".to_string(),
                content: format!("{user_query}\n\n{SOLUTION_PROMPT_GUIDANCE}"),
            },
        ];

        let results = fanout(&self.client, &config.council_models, &messages, timeout).await;

        let mut replies = Vec::new();
        for model_id in &config.council_models {
            match results.get(model_id) {
                Some(Ok(reply)) if !reply.content.is_empty() => replies.push(reply.clone()),
                Some(Ok(_)) => {
                    tracing::warn!(model_id, "council member returned empty content; dropped")
                }
                Some(Err(e)) => {
                    tracing::warn!(model_id, error = %e, "council member failed stage 1; dropped")
                }
                None => tracing::warn!(model_id, "missing fanout entry for council member"),
            }
        }
        replies
    }

    async fn stage2(
        &self,
        config: &Config,
        user_query: &str,
        stage1: &[ModelReply],
        labels: &[String],
        timeout: Duration,
    ) -> Vec<Ranking> {
        let mut prompt = format!("Original question:\n{user_query}\n\nResponses:\n");
        for (label, reply) in labels.iter().zip(stage1.iter()) {
            prompt.push_str(&format!("\n{label}:\n{}\n", reply.content));
        }
        prompt.push_str(&format!("\n{RANKING_RUBRIC}"));

        let messages = vec![Turn {
            role: "user".to_string(),
            content: prompt,
        }];

        let results = fanout(&self.client, &config.council_models, &messages, timeout).await;

        let mut rankings = Vec::new();
        for model_id in &config.council_models {
            if let Some(Ok(reply)) = results.get(model_id) {
                let parsed_order = parse_ranking_from_text(&reply.content);
                rankings.push(Ranking {
                    model_id: model_id.clone(),
                    raw_text: reply.content.clone(),
                    parsed_order,
                    prompt_tokens: reply.prompt_tokens,
                    completion_tokens: reply.completion_tokens,
                });
            } else {
                tracing::warn!(model_id, "council member failed stage 2; dropped");
            }
        }
        rankings
    }

    async fn stage3(
        &self,
        config: &Config,
        user_query: &str,
        stage1: &[ModelReply],
        stage2: &[Ranking],
        aggregate: &[AggregateRanking],
        timeout: Duration,
    ) -> Synthesis {
        let mut prompt = format!("Original question:\n{user_query}\n\nStage 1 responses:\n");
        for reply in stage1 {
            prompt.push_str(&format!("\nModel: {}\nResponse: {}\n", reply.model_id, reply.content));
        }
        prompt.push_str("\nStage 2 rankings:\n");
        for ranking in stage2 {
            prompt.push_str(&format!(
                "\nModel: {}\nRanking: {}\n",
                ranking.model_id, ranking.raw_text
            ));
        }
        prompt.push_str(&format!("\n{SYNTHESIS_RULES}"));

        let messages = vec![Turn {
            role: "user".to_string(),
            content: prompt,
        }];

        let top_model = aggregate.first().map(|a| a.model_id.clone());

        match self
            .client
            .query(&config.chairman_model, &messages, timeout)
            .await
        {
            Ok(reply) => parse_chairman_reply(&config.chairman_model, reply, top_model, aggregate),
            Err(e) => {
                tracing::warn!(chairman = %config.chairman_model, error = %e, "chairman call failed");
                Synthesis {
                    chairman_id: config.chairman_model.clone(),
                    content: CHAIRMAN_FAILED_MESSAGE.to_string(),
                    primary_source: None,
                    top_ranked_model: top_model,
                    confidence: consensus_confidence(aggregate),
                    prompt_tokens: 0,
                    completion_tokens: 0,
                }
            }
        }
    }
}

fn assign_labels(stage1: &[ModelReply]) -> Vec<String> {
    (0..stage1.len())
        .map(|i| format!("Response {}", (b'A' + i as u8) as char))
        .collect()
}

fn error_synthesis() -> Synthesis {
    Synthesis {
        chairman_id: ERROR_MODEL_ID.to_string(),
        content: "All council members failed to respond.".to_string(),
        primary_source: None,
        top_ranked_model: None,
        confidence: 0,
        prompt_tokens: 0,
        completion_tokens: 0,
    }
}

/// Two-cascade deterministic rule (spec §4.D): scan the suffix after
/// `FINAL RANKING:` for numbered labels first, then fall back to an
/// unanchored scan over the raw text.
pub fn parse_ranking_from_text(text: &str) -> Vec<String> {
    let numbered_re = Regex::new(r"\d+\.\s*Response [A-Z]").unwrap();
    let label_re = Regex::new(r"Response [A-Z]").unwrap();

    if let Some(idx) = text.find("FINAL RANKING:") {
        let section = &text[idx + "FINAL RANKING:".len()..];
        let numbered: Vec<String> = numbered_re
            .find_iter(section)
            .filter_map(|m| label_re.find(m.as_str()).map(|l| l.as_str().to_string()))
            .collect();
        if !numbered.is_empty() {
            return numbered;
        }
        return label_re
            .find_iter(section)
            .map(|m| m.as_str().to_string())
            .collect();
    }

    label_re.find_iter(text).map(|m| m.as_str().to_string()).collect()
}

/// `average_rank(M) = mean(positions)`, sorted ascending with ties broken by
/// insertion order (a stable sort preserves this automatically).
pub fn aggregate_rankings(
    stage2: &[Ranking],
    label_to_model: &HashMap<String, String>,
    stage1_order: &[String],
) -> Vec<AggregateRanking> {
    let mut positions: HashMap<String, Vec<u32>> = HashMap::new();

    for ranking in stage2 {
        for (idx, label) in ranking.parsed_order.iter().enumerate() {
            if let Some(model_id) = label_to_model.get(label) {
                positions.entry(model_id.clone()).or_default().push(idx as u32 + 1);
            }
        }
    }

    // Iterate in Stage 1 order so the subsequent stable sort breaks ties by
    // that order rather than by arbitrary hash-map iteration order.
    let mut aggregate: Vec<AggregateRanking> = stage1_order
        .iter()
        .filter_map(|model_id| positions.remove(model_id).map(|ranks| (model_id.clone(), ranks)))
        .map(|(model_id, ranks)| {
            let count = ranks.len() as u32;
            let average_rank = ranks.iter().sum::<u32>() as f64 / count as f64;
            AggregateRanking {
                model_id,
                average_rank: (average_rank * 100.0).round() / 100.0,
                rankings_count: count,
            }
        })
        .collect();

    aggregate.sort_by(|a, b| a.average_rank.partial_cmp(&b.average_rank).unwrap());
    aggregate
}

fn parse_chairman_reply(
    chairman_id: &str,
    reply: ModelReply,
    top_model: Option<String>,
    aggregate: &[AggregateRanking],
) -> Synthesis {
    let primary_source_re = Regex::new(r"(?m)^.*# Primary source:(.*)$").unwrap();
    let confidence_re = Regex::new(r"(?m)^.*# Confidence:(.*)$").unwrap();
    let percent_re = Regex::new(r"(\d+)%").unwrap();

    let self_reported_source = primary_source_re
        .captures(&reply.content)
        .map(|c| c[1].trim().to_string())
        .filter(|s| !s.is_empty());

    let self_reported_confidence = confidence_re
        .captures(&reply.content)
        .and_then(|c| {
            percent_re
                .captures(&c[1])
                .and_then(|c2| c2[1].parse::<u32>().ok())
        })
        .map(|v| v.min(100) as u8);

    let primary_source = self_reported_source
        .or_else(|| top_model.clone())
        .or_else(|| Some(chairman_id.to_string()));

    let confidence = self_reported_confidence.unwrap_or_else(|| consensus_confidence(aggregate));

    Synthesis {
        chairman_id: chairman_id.to_string(),
        content: reply.content,
        primary_source,
        top_ranked_model: top_model,
        confidence,
        prompt_tokens: reply.prompt_tokens,
        completion_tokens: reply.completion_tokens,
    }
}

/// `clamp(60, 90, 70 + 10 * (rank2 - rank1))` with 2+ aggregate entries;
/// 75 with exactly 1; 70 with none.
fn consensus_confidence(aggregate: &[AggregateRanking]) -> u8 {
    match aggregate.len() {
        0 => 70,
        1 => 75,
        _ => {
            let gap = aggregate[1].average_rank - aggregate[0].average_rank;
            let raw = 70.0 + 10.0 * gap;
            raw.clamp(60.0, 90.0) as u8
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(id: &str, content: &str) -> ModelReply {
        ModelReply {
            model_id: id.to_string(),
            content: content.to_string(),
            prompt_tokens: 0,
            completion_tokens: 0,
        }
    }

    #[test]
    fn parses_ranking_after_sentinel() {
        let text = "A is best. B ok. C worst.\n\nFINAL RANKING:\n1. Response A\n2. Response C\n2. Response B";
        let parsed = parse_ranking_from_text(text);
        assert_eq!(parsed, vec!["Response A", "Response C", "Response B"]);
    }

    #[test]
    fn falls_back_to_full_text_scan_without_sentinel() {
        let text = "I'd rank them Response B then Response A.";
        let parsed = parse_ranking_from_text(text);
        assert_eq!(parsed, vec!["Response B", "Response A"]);
    }

    #[test]
    fn unparseable_text_yields_empty_order() {
        assert!(parse_ranking_from_text("no labels here at all").is_empty());
    }

    #[test]
    fn aggregate_ranks_lie_in_valid_range_and_sort_ascending() {
        let mut label_to_model = HashMap::new();
        label_to_model.insert("Response A".to_string(), "m1".to_string());
        label_to_model.insert("Response B".to_string(), "m2".to_string());

        let stage2 = vec![
            Ranking {
                model_id: "m1".into(),
                raw_text: String::new(),
                parsed_order: vec!["Response A".into(), "Response B".into()],
                prompt_tokens: 0,
                completion_tokens: 0,
            },
            Ranking {
                model_id: "m2".into(),
                raw_text: String::new(),
                parsed_order: vec!["Response B".into(), "Response A".into()],
                prompt_tokens: 0,
                completion_tokens: 0,
            },
        ];

        let order = vec!["m1".to_string(), "m2".to_string()];
        let aggregate = aggregate_rankings(&stage2, &label_to_model, &order);
        assert_eq!(aggregate.len(), 2);
        for a in &aggregate {
            assert!(a.average_rank >= 1.0 && a.average_rank <= 2.0);
        }
        assert!(aggregate[0].average_rank <= aggregate[1].average_rank);
    }

    #[test]
    fn single_stage1_success_yields_trivial_aggregate() {
        let mut label_to_model = HashMap::new();
        label_to_model.insert("Response A".to_string(), "m1".to_string());
        let stage2 = vec![Ranking {
            model_id: "m1".into(),
            raw_text: String::new(),
            parsed_order: vec!["Response A".into()],
            prompt_tokens: 0,
            completion_tokens: 0,
        }];
        let order = vec!["m1".to_string()];
        let aggregate = aggregate_rankings(&stage2, &label_to_model, &order);
        assert_eq!(aggregate.len(), 1);
        assert_eq!(aggregate[0].average_rank, 1.0);
    }

    #[test]
    fn confidence_fallback_matches_consensus_rule() {
        assert_eq!(consensus_confidence(&[]), 70);
        assert_eq!(
            consensus_confidence(&[AggregateRanking {
                model_id: "m1".into(),
                average_rank: 1.0,
                rankings_count: 1
            }]),
            75
        );
        let two = vec![
            AggregateRanking { model_id: "m1".into(), average_rank: 1.0, rankings_count: 2 },
            AggregateRanking { model_id: "m2".into(), average_rank: 3.0, rankings_count: 2 },
        ];
        // gap = 2.0 -> 70 + 20 = 90, clamped to 90
        assert_eq!(consensus_confidence(&two), 90);
    }

    #[test]
    fn chairman_reply_without_metadata_falls_back_to_top_model() {
        let r = reply("chairman", "Just an answer, no metadata lines.");
        let synth = parse_chairman_reply("chairman", r, Some("m1".to_string()), &[]);
        assert_eq!(synth.primary_source, Some("m1".to_string()));
        assert_eq!(synth.confidence, 70);
    }

    #[test]
    fn chairman_reply_with_metadata_is_parsed() {
        let r = reply(
            "chairman",
            "The answer is 4.\n# Primary source: m2\n# Confidence: 88%",
        );
        let synth = parse_chairman_reply("chairman", r, None, &[]);
        assert_eq!(synth.primary_source, Some("m2".to_string()));
        assert_eq!(synth.confidence, 88);
    }
}
