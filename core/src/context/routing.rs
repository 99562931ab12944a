//! Per-message routing verdict.
//!
//! The classifier is asked for one strict JSON object. Anything that does not
//! decode into [`ClassifierVerdict`] fails closed into the keyword fallback.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::agents::{ChatMessage, ProviderGateway, SendOptions};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub should_forward: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub providers: Option<Vec<String>>,
    pub reason: String,
}

impl RoutingDecision {
    pub fn first_message() -> Self {
        Self {
            should_forward: true,
            providers: None,
            reason: "first message in conversation".into(),
        }
    }
}

/// One line of a conversation's routing history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingLogEntry {
    pub message: String,
    pub decision: RoutingDecision,
    pub timestamp: i64,
}

impl RoutingLogEntry {
    pub fn new(message: &str, decision: &RoutingDecision) -> Self {
        Self {
            message: message.chars().take(100).collect(),
            decision: decision.clone(),
            timestamp: OffsetDateTime::now_utc().unix_timestamp(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
enum Verdict {
    #[serde(rename = "forward to all")]
    ForwardAll,
    #[serde(rename = "forward to specific")]
    ForwardSpecific,
    #[serde(rename = "direct reply")]
    DirectReply,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ClassifierVerdict {
    decision: Verdict,
    #[serde(default)]
    providers: Option<Vec<String>>,
    reason: String,
}

/// Decode the classifier reply. A single fenced block is tolerated; any other
/// deviation from the schema is rejected.
fn decode_verdict(raw: &str, available: &[String]) -> Result<RoutingDecision, String> {
    let trimmed = raw.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();
    let verdict: ClassifierVerdict =
        serde_json::from_str(body).map_err(|err| format!("unparseable verdict: {err}"))?;

    match verdict.decision {
        Verdict::DirectReply => Ok(RoutingDecision {
            should_forward: false,
            providers: None,
            reason: verdict.reason,
        }),
        Verdict::ForwardAll => Ok(RoutingDecision {
            should_forward: true,
            providers: None,
            reason: verdict.reason,
        }),
        Verdict::ForwardSpecific => {
            let requested = verdict
                .providers
                .ok_or_else(|| "specific forward without providers".to_string())?;
            let known: Vec<String> = requested
                .into_iter()
                .map(|p| p.trim().to_lowercase())
                .filter(|p| available.contains(p))
                .collect();
            if known.is_empty() {
                return Err("specific forward names no available provider".into());
            }
            Ok(RoutingDecision {
                should_forward: true,
                providers: Some(known),
                reason: verdict.reason,
            })
        }
    }
}

/// Asks a fast provider whether a message needs the whole panel.
pub struct RoutingClassifier {
    gateway: Arc<dyn ProviderGateway>,
    orchestrator_name: String,
    temperature: f32,
}

impl RoutingClassifier {
    pub fn new(gateway: Arc<dyn ProviderGateway>, orchestrator_name: &str, temperature: f32) -> Self {
        Self {
            gateway,
            orchestrator_name: orchestrator_name.to_string(),
            temperature,
        }
    }

    fn instruction(&self, available: &[String]) -> String {
        format!(
            "You are the routing component of {name}, an orchestrator that forwards user \
             questions to several AI assistants ({providers}) and summarises their answers.\n\
             Decide how the latest user message should be handled. Choose exactly one verdict:\n\
             1. \"forward to all\" - a new question every assistant should answer.\n\
             2. \"forward to specific\" - only the named assistants should answer; list their ids in \"providers\".\n\
             3. \"direct reply\" - {name} can answer alone, e.g. a follow-up about previous answers, \
             the mean or best answer, or a question about {name} itself.\n\
             Reply with a single JSON object and nothing else: \
             {{\"decision\": \"forward to all\" | \"forward to specific\" | \"direct reply\", \
             \"providers\": [\"id\", ...], \"reason\": \"short explanation\"}}",
            name = self.orchestrator_name,
            providers = available.join(", "),
        )
    }

    pub async fn classify(
        &self,
        recent: &[ChatMessage],
        message: &str,
        available: &[String],
    ) -> Result<RoutingDecision, String> {
        let mut transcript = String::new();
        for msg in recent {
            transcript.push_str(&format!("{}: {}\n", msg.role.as_str(), msg.content.trim()));
        }
        let request = vec![
            ChatMessage::system(self.instruction(available)),
            ChatMessage::user(format!(
                "Recent conversation:\n{transcript}\nLatest user message:\n{message}"
            )),
        ];
        let options = SendOptions {
            temperature: self.temperature,
            max_tokens: 200,
            stream: false,
        };
        let response = self.gateway.send_message(&request, &options).await;
        if let Some(error) = response.error {
            return Err(format!("classifier call failed: {error}"));
        }
        decode_verdict(&response.content, available)
    }
}

/// Static rule used when the classifier is unavailable.
pub fn keyword_fallback(message: &str, keywords: &[String], failure: &str) -> RoutingDecision {
    let lowered = message.to_lowercase();
    match keywords
        .iter()
        .find(|k| !k.is_empty() && lowered.contains(&k.to_lowercase()))
    {
        Some(keyword) => RoutingDecision {
            should_forward: false,
            providers: None,
            reason: format!("fallback ({failure}): message refers to \"{keyword}\""),
        },
        None => RoutingDecision {
            should_forward: true,
            providers: None,
            reason: format!("fallback ({failure}): forwarding by default"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::mock::{MockGateway, MockReply};

    fn available() -> Vec<String> {
        vec!["openai".into(), "anthropic".into(), "google".into()]
    }

    #[test]
    fn decodes_each_verdict() {
        let direct = decode_verdict(
            r#"{"decision": "direct reply", "reason": "follow-up"}"#,
            &available(),
        )
        .unwrap();
        assert!(!direct.should_forward);

        let all = decode_verdict(
            r#"{"decision": "forward to all", "reason": "new topic"}"#,
            &available(),
        )
        .unwrap();
        assert!(all.should_forward);
        assert!(all.providers.is_none());

        let specific = decode_verdict(
            r#"{"decision": "forward to specific", "providers": ["Anthropic", "mistral"], "reason": "asked for Claude"}"#,
            &available(),
        )
        .unwrap();
        assert_eq!(specific.providers, Some(vec!["anthropic".to_string()]));
    }

    #[test]
    fn fenced_json_is_accepted() {
        let raw = "```json\n{\"decision\": \"direct reply\", \"reason\": \"x\"}\n```";
        assert!(!decode_verdict(raw, &available()).unwrap().should_forward);
    }

    #[test]
    fn shape_mismatches_fail_closed() {
        let cases = [
            "Sure! I think we should forward.",
            r#"{"decision": "maybe", "reason": "x"}"#,
            r#"{"decision": "direct reply"}"#,
            r#"{"decision": "direct reply", "reason": "x", "confidence": 0.9}"#,
            r#"{"decision": "forward to specific", "reason": "x"}"#,
            r#"{"decision": "forward to specific", "providers": ["grok"], "reason": "x"}"#,
        ];
        for raw in cases {
            assert!(decode_verdict(raw, &available()).is_err(), "accepted: {raw}");
        }
    }

    #[test]
    fn fallback_respects_self_reference() {
        let keywords = vec!["chorus".to_string(), "mean value".to_string()];
        let direct = keyword_fallback("What about the mean value?", &keywords, "timeout");
        assert!(!direct.should_forward);
        let named = keyword_fallback("Hey CHORUS, who are you?", &keywords, "timeout");
        assert!(!named.should_forward);
        let forward = keyword_fallback("Explain photosynthesis", &keywords, "timeout");
        assert!(forward.should_forward);
    }

    #[tokio::test]
    async fn classifier_uses_low_temperature_request() {
        let gateway = Arc::new(MockGateway::new(
            "openai",
            vec![MockReply::text(r#"{"decision": "direct reply", "reason": "follow-up"}"#)],
        ));
        let settings = crate::agents::OrchestratorSettings::default();
        let classifier =
            RoutingClassifier::new(gateway.clone(), &settings.name, settings.classifier_temperature);
        let decision = classifier
            .classify(&[ChatMessage::user("hi")], "and the mean?", &available())
            .await
            .unwrap();
        assert!(!decision.should_forward);
        assert_eq!(gateway.call_count(), 1);
        let request = &gateway.requests()[0];
        assert!(request[0].content.contains("direct reply"));
        assert!(request[1].content.contains("and the mean?"));

        let options = &gateway.options()[0];
        assert!(options.temperature <= 0.1, "temperature {}", options.temperature);
        assert_eq!(options.max_tokens, 200);
        assert!(!options.stream);
    }

    #[tokio::test]
    async fn classifier_failure_is_reported() {
        let classifier =
            RoutingClassifier::new(MockGateway::failing("openai", "timeout"), "Chorus", 0.1);
        let err = classifier
            .classify(&[], "hello", &available())
            .await
            .unwrap_err();
        assert!(err.contains("timeout"));
    }
}
