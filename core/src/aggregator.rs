//! Consensus ("mean") and best-answer synthesis over a fan-out result.
//!
//! Synthesis goes through one designated provider. When that provider is
//! missing or fails, the aggregator falls back to deterministic text: a
//! numeric mean when every answer is a bare number, otherwise the labelled
//! answers concatenated.

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::agents::{ChatMessage, ProviderGateway, ProviderResponse, SendOptions};

pub const ALL_FAILED: &str = "All AI providers failed to respond.";
pub const NO_RESPONSES: &str = "No responses available.";

const SUMMARY_CHARS: usize = 120;

const MEAN_INSTRUCTION: &str = "You combine answers from several AI assistants into one consensus answer. \
Reproduce this structure exactly:\n\
1. For every assistant, a heading with its name followed by its response copied verbatim \
(for assistants that failed, write the error instead).\n\
2. A line containing only ---\n\
3. A consolidated block:\n\
**Answer:** the consensus answer in one or two sentences.\n\
**Key details:** the important supporting points the assistants agree on.\n\
**Note:** any disagreements, uncertainty or failed assistants worth mentioning.";

const BEST_INSTRUCTION: &str = "You are judging answers from several AI assistants. \
Pick the single best response, or improve on it, judging by accuracy, completeness, clarity and relevance \
to the user's question. Reply with the final answer only, without mentioning the assistants or the judging.";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedResult {
    pub responses: Vec<ProviderResponse>,
    pub summaries: BTreeMap<String, String>,
    pub mean_answer: Option<String>,
    pub best_answer: Option<String>,
    pub timestamp: i64,
}

impl AggregatedResult {
    pub fn new(responses: Vec<ProviderResponse>) -> Self {
        Self {
            responses,
            summaries: BTreeMap::new(),
            mean_answer: None,
            best_answer: None,
            timestamp: OffsetDateTime::now_utc().unix_timestamp(),
        }
    }

    pub fn valid_responses(&self) -> Vec<&ProviderResponse> {
        self.responses.iter().filter(|r| r.is_valid()).collect()
    }
}

pub struct ResponseAggregator {
    synthesizer: Option<Arc<dyn ProviderGateway>>,
}

impl ResponseAggregator {
    pub fn new(synthesizer: Option<Arc<dyn ProviderGateway>>) -> Self {
        Self { synthesizer }
    }

    pub async fn analyze_responses(
        &self,
        mut result: AggregatedResult,
        original_question: &str,
    ) -> AggregatedResult {
        result.summaries = result
            .responses
            .iter()
            .map(|r| (r.provider.id.clone(), short_summary(r)))
            .collect();

        let valid_count = result.valid_responses().len();
        match valid_count {
            0 => {
                result.mean_answer = Some(ALL_FAILED.to_string());
                result.best_answer = Some(NO_RESPONSES.to_string());
            }
            1 => {
                let only = result.valid_responses()[0].content.clone();
                result.mean_answer = Some(self.mean_answer(&result, original_question).await);
                result.best_answer = Some(only);
            }
            _ => {
                let (mean, best) = tokio::join!(
                    self.mean_answer(&result, original_question),
                    self.best_answer(&result, original_question)
                );
                result.mean_answer = Some(mean);
                result.best_answer = Some(best);
            }
        }
        result.timestamp = OffsetDateTime::now_utc().unix_timestamp();
        result
    }

    async fn synthesize(&self, instruction: &str, prompt: String) -> Option<String> {
        let synthesizer = self.synthesizer.as_ref()?;
        let request = vec![ChatMessage::system(instruction), ChatMessage::user(prompt)];
        let options = SendOptions {
            temperature: 0.3,
            max_tokens: 2048,
            stream: false,
        };
        let response = synthesizer.send_message(&request, &options).await;
        if response.is_valid() {
            Some(response.content.trim().to_string())
        } else {
            tracing::warn!(
                "synthesis via {} failed: {}",
                response.provider.id,
                response.error.as_deref().unwrap_or("empty response")
            );
            None
        }
    }

    async fn mean_answer(&self, result: &AggregatedResult, question: &str) -> String {
        let mut prompt = format!("User question:\n{question}\n\nAssistant responses:\n");
        for response in &result.responses {
            match &response.error {
                Some(error) => prompt.push_str(&format!(
                    "\n### {}\n[failed to respond: {error}]\n",
                    response.provider.display_name
                )),
                None => prompt.push_str(&format!(
                    "\n### {}\n{}\n",
                    response.provider.display_name, response.content
                )),
            }
        }
        match self.synthesize(MEAN_INSTRUCTION, prompt).await {
            Some(mean) => mean,
            None => fallback_mean(&result.valid_responses()),
        }
    }

    async fn best_answer(&self, result: &AggregatedResult, question: &str) -> String {
        let valid = result.valid_responses();
        let mut prompt = format!("User question:\n{question}\n\nCandidate responses:\n");
        for (idx, response) in valid.iter().enumerate() {
            prompt.push_str(&format!(
                "\nResponse {} ({}):\n{}\n",
                idx + 1,
                response.provider.display_name,
                response.content
            ));
        }
        match self.synthesize(BEST_INSTRUCTION, prompt).await {
            Some(best) => best,
            None => valid
                .first()
                .map(|r| r.content.clone())
                .unwrap_or_else(|| NO_RESPONSES.to_string()),
        }
    }
}

fn short_summary(response: &ProviderResponse) -> String {
    if let Some(error) = &response.error {
        return format!("Error: {error}");
    }
    let first_line = response
        .content
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("");
    let mut summary: String = first_line.chars().take(SUMMARY_CHARS).collect();
    if first_line.chars().count() > SUMMARY_CHARS {
        summary.push_str("...");
    }
    summary
}

fn bare_number() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*([$€£¥])?\s*-?\d+(?:,\d{3})*(?:\.\d+)?\s*$").expect("valid regex")
    })
}

fn numeric_token() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"-?\d+(?:,\d{3})*(?:\.\d+)?").expect("valid regex"))
}

/// The whole content, or every non-empty line of it, is a bare number.
fn is_numeric_answer(content: &str) -> bool {
    if bare_number().is_match(content) {
        return true;
    }
    let mut lines = content.lines().filter(|l| !l.trim().is_empty()).peekable();
    lines.peek().is_some() && lines.all(|line| bare_number().is_match(line))
}

fn first_number(content: &str) -> Option<f64> {
    numeric_token()
        .find(content)
        .and_then(|m| m.as_str().replace(',', "").parse::<f64>().ok())
}

fn currency_symbol(content: &str) -> Option<String> {
    bare_number()
        .captures(content.lines().find(|l| !l.trim().is_empty())?)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

fn fallback_mean(valid: &[&ProviderResponse]) -> String {
    if valid.is_empty() {
        return ALL_FAILED.to_string();
    }
    if valid.iter().all(|r| is_numeric_answer(&r.content)) {
        let values: Vec<f64> = valid.iter().filter_map(|r| first_number(&r.content)).collect();
        if values.len() == valid.len() {
            let mean = values.iter().sum::<f64>() / values.len() as f64;
            let symbol = valid
                .iter()
                .find_map(|r| currency_symbol(&r.content))
                .unwrap_or_else(|| "$".to_string());
            return format!("Mean value: {symbol}{mean:.2}");
        }
    }
    valid
        .iter()
        .map(|r| format!("**{}:** {}", r.provider.display_name, r.content.trim()))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Render the result for the chat channel. Deterministic for a given input.
pub fn create_formatted_response(result: &AggregatedResult) -> String {
    let mut out = String::new();
    for response in &result.responses {
        out.push_str(&format!("### {}\n", response.provider.display_name));
        match &response.error {
            Some(error) => out.push_str(&format!("_Error: {error}_\n\n")),
            None if response.content.trim().is_empty() => out.push_str("_No response_\n\n"),
            None => out.push_str(&format!("{}\n\n", response.content.trim())),
        }
    }
    out.push_str("---\n\n");
    let mean = result.mean_answer.as_deref().unwrap_or(NO_RESPONSES);
    out.push_str(&format!("### Mean Answer\n{}\n", mean.trim()));
    if let Some(best) = &result.best_answer {
        if best.trim() != mean.trim() {
            out.push_str(&format!("\n### Best Answer\n{}\n", best.trim()));
        }
    }
    out
}
