//! Top-level turn coordinator.
//!
//! One call to [`Router::process_message`] is one user turn: append to the
//! master transcript, ask for a routing decision, then either answer directly
//! through the default provider or fan out and aggregate. Turns on the same
//! conversation id are serialized.

use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use serde_json::json;
use tokio::sync::Mutex;

use crate::agents::{ChatMessage, Orchestrator, OrchestratorSettings, ProviderResponse, SendOptions};
use crate::aggregator::{create_formatted_response, AggregatedResult, ResponseAggregator};
use crate::context::routing::RoutingDecision;
use crate::context::ContextManager;
use crate::db::DbPool;
use crate::errors::ChorusError;
use crate::logging::spawn_log_event;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Received,
    Routing,
    DirectAnswering,
    Forwarding,
    Aggregating,
    Persisted,
}

#[derive(Debug, Clone, Serialize)]
pub struct TurnOutcome {
    pub response: String,
    pub conversation_id: String,
    pub routing: RoutingDecision,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregated: Option<AggregatedResult>,
}

struct Turn<'a> {
    conversation_id: &'a str,
    state: TurnState,
}

impl<'a> Turn<'a> {
    fn new(conversation_id: &'a str) -> Self {
        tracing::debug!("turn {conversation_id}: {:?}", TurnState::Received);
        Self {
            conversation_id,
            state: TurnState::Received,
        }
    }

    fn advance(&mut self, next: TurnState) {
        tracing::debug!(
            "turn {}: {:?} -> {:?}",
            self.conversation_id,
            self.state,
            next
        );
        self.state = next;
    }
}

pub struct Router {
    contexts: Arc<ContextManager>,
    orchestrator: Arc<Orchestrator>,
    aggregator: ResponseAggregator,
    events: Option<DbPool>,
    turn_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl Router {
    pub fn new(
        contexts: Arc<ContextManager>,
        orchestrator: Arc<Orchestrator>,
        aggregator: ResponseAggregator,
        events: Option<DbPool>,
    ) -> Self {
        Self {
            contexts,
            orchestrator,
            aggregator,
            events,
            turn_locks: DashMap::new(),
        }
    }

    pub fn contexts(&self) -> &Arc<ContextManager> {
        &self.contexts
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    fn settings(&self) -> &OrchestratorSettings {
        self.contexts.settings()
    }

    fn turn_lock(&self, conversation_id: &str) -> Arc<Mutex<()>> {
        self.turn_locks
            .entry(conversation_id.to_string())
            .or_default()
            .clone()
    }

    pub async fn process_message(
        &self,
        conversation_id: Option<&str>,
        user_message: &str,
    ) -> Result<TurnOutcome, ChorusError> {
        let text = user_message.trim();
        if text.is_empty() {
            return Err(ChorusError::InvalidInput("message must not be empty".into()));
        }

        let id = self.contexts.ensure_conversation(conversation_id).await?;
        let lock = self.turn_lock(&id);
        let outcome = {
            let _guard = lock.lock().await;
            self.run_turn(&id, text).await
        };
        drop(lock);
        self.release_turn_lock(&id);
        outcome
    }

    /// Evict the lock once no other turn holds or awaits it. Clones are only
    /// taken under the map's shard lock, so the count check cannot race them.
    fn release_turn_lock(&self, conversation_id: &str) {
        self.turn_locks
            .remove_if(conversation_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    async fn run_turn(&self, id: &str, text: &str) -> Result<TurnOutcome, ChorusError> {
        let mut turn = Turn::new(id);

        self.contexts.add_message(&id, ChatMessage::user(text)).await?;

        turn.advance(TurnState::Routing);
        let routing = self.contexts.should_forward_to_ais(&id, text).await?;
        self.contexts.record_routing(&id, text, &routing).await?;
        self.log_routing(&id, &routing);

        let outcome = if routing.should_forward {
            turn.advance(TurnState::Forwarding);
            self.forward(&mut turn, &id, text, routing).await?
        } else {
            turn.advance(TurnState::DirectAnswering);
            self.answer_directly(&id, routing).await?
        };
        turn.advance(TurnState::Persisted);
        Ok(outcome)
    }

    async fn answer_directly(
        &self,
        id: &str,
        routing: RoutingDecision,
    ) -> Result<TurnOutcome, ChorusError> {
        let context = self.contexts.get_master_context(id).await?;
        let available = self.orchestrator.available_providers();
        let settings = self.settings();

        let response = match settings.resolve_provider(&settings.default_provider, &available) {
            Some(provider_id) => {
                let reply = self
                    .orchestrator
                    .query_single(provider_id, &context, &SendOptions::default())
                    .await;
                if reply.is_valid() {
                    reply.content
                } else {
                    format!(
                        "{}: I could not answer that directly because {} failed ({}).",
                        settings.name,
                        reply.provider.display_name,
                        reply.error.as_deref().unwrap_or("empty response")
                    )
                }
            }
            None => format!(
                "{}: I could not answer that directly because no AI provider is configured.",
                settings.name
            ),
        };

        self.contexts
            .add_message(id, ChatMessage::assistant(response.clone()))
            .await?;
        Ok(TurnOutcome {
            response,
            conversation_id: id.to_string(),
            routing,
            aggregated: None,
        })
    }

    async fn forward(
        &self,
        turn: &mut Turn<'_>,
        id: &str,
        text: &str,
        routing: RoutingDecision,
    ) -> Result<TurnOutcome, ChorusError> {
        let targets = self.resolve_targets(&routing);

        let mut request = match targets.first() {
            Some(primary) => self.contexts.get_context_for_provider(id, primary, true).await?,
            None => Vec::new(),
        };
        request.push(ChatMessage::user(text));

        let responses = self
            .orchestrator
            .query_all(&request, &targets, &SendOptions::default())
            .await;

        for response in &responses {
            let provider_id = &response.provider.id;
            self.contexts
                .add_provider_message(id, provider_id, ChatMessage::user(text))
                .await?;
            if response.is_valid() {
                self.contexts
                    .add_provider_message(id, provider_id, ChatMessage::assistant(response.content.clone()))
                    .await?;
            }
        }
        self.log_fanout(id, &targets, &responses);

        turn.advance(TurnState::Aggregating);
        let aggregated = self
            .aggregator
            .analyze_responses(AggregatedResult::new(responses), text)
            .await;
        let response = create_formatted_response(&aggregated);

        self.contexts
            .add_message(id, ChatMessage::assistant(response.clone()))
            .await?;
        Ok(TurnOutcome {
            response,
            conversation_id: id.to_string(),
            routing,
            aggregated: Some(aggregated),
        })
    }

    /// Requested subset filtered to available providers, or all of them.
    fn resolve_targets(&self, routing: &RoutingDecision) -> Vec<String> {
        let available = self.orchestrator.available_providers();
        let subset: Vec<String> = routing
            .providers
            .iter()
            .flatten()
            .filter(|id| available.contains(id))
            .cloned()
            .collect();
        if subset.is_empty() {
            available
        } else {
            subset
        }
    }

    fn log_routing(&self, id: &str, routing: &RoutingDecision) {
        tracing::info!(
            target: "chorus.routing",
            "conversation {id}: forward={} ({})",
            routing.should_forward,
            routing.reason
        );
        if let Some(pool) = &self.events {
            spawn_log_event(
                pool,
                "info",
                "RTE-0001",
                "chorus.routing",
                "Routing decision recorded",
                json!({
                    "conversationId": id,
                    "shouldForward": routing.should_forward,
                    "providers": routing.providers,
                    "reason": routing.reason,
                }),
            );
        }
    }

    fn log_fanout(&self, id: &str, targets: &[String], responses: &[ProviderResponse]) {
        let failed: Vec<&str> = responses
            .iter()
            .filter(|r| !r.is_valid())
            .map(|r| r.provider.id.as_str())
            .collect();
        if let Some(pool) = &self.events {
            spawn_log_event(
                pool,
                if failed.is_empty() { "info" } else { "warn" },
                "AI-0201",
                "chorus.fanout",
                "Fan-out settled",
                json!({
                    "conversationId": id,
                    "providers": targets,
                    "failed": failed,
                }),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::mock::{as_gateways, MockGateway, MockReply};
    use crate::agents::ProviderGateway;
    use crate::context::routing::RoutingClassifier;

    fn router_with(mocks: &[Arc<MockGateway>], synthesizer: Option<Arc<dyn ProviderGateway>>) -> Router {
        let contexts = Arc::new(ContextManager::new(OrchestratorSettings::default()));
        let orchestrator = Arc::new(Orchestrator::new(as_gateways(mocks)));
        Router::new(contexts, orchestrator, ResponseAggregator::new(synthesizer), None)
    }

    #[tokio::test]
    async fn first_message_fans_out_to_every_provider() {
        let router = router_with(
            &[
                MockGateway::always("openai", "Paris"),
                MockGateway::always("anthropic", "Paris"),
                MockGateway::always("google", "Paris"),
            ],
            Some(MockGateway::always("synth", "**Answer:** Paris")),
        );
        let outcome = router
            .process_message(None, "What is the capital of France?")
            .await
            .unwrap();

        assert!(outcome.routing.should_forward);
        assert!(outcome.routing.reason.contains("first message"));
        let aggregated = outcome.aggregated.unwrap();
        assert_eq!(aggregated.responses.len(), 3);
        for heading in ["### Openai", "### Anthropic", "### Google", "### Mean Answer"] {
            assert!(outcome.response.contains(heading), "missing {heading}");
        }
        let transcript = router
            .contexts()
            .transcript(&outcome.conversation_id)
            .await
            .unwrap();
        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript[1].content, outcome.response);
    }

    #[tokio::test]
    async fn follow_up_about_mean_value_is_answered_directly() {
        let openai = Arc::new(MockGateway::new(
            "openai",
            vec![
                MockReply::text("$10"),
                MockReply::text("The mean value across the assistants was $15.00."),
            ],
        ));
        let google = MockGateway::always("google", "$20");
        let router = router_with(&[openai.clone(), google.clone()], None);

        let first = router.process_message(None, "How much is it?").await.unwrap();
        assert!(first.response.contains("Mean Answer"));
        let id = first.conversation_id;

        let second = router
            .process_message(Some(&id), "What about the mean value?")
            .await
            .unwrap();
        assert!(!second.routing.should_forward);
        assert!(second.aggregated.is_none());
        assert_eq!(second.response, "The mean value across the assistants was $15.00.");
        assert!(!second.response.contains("###"));
        assert_eq!(google.call_count(), 1);

        let direct_request = openai.requests().last().cloned().unwrap();
        assert!(direct_request[0].content.contains("Chorus"));
        assert_eq!(
            direct_request.last().map(|m| m.content.as_str()),
            Some("What about the mean value?")
        );
        // provider histories only hold the forwarded turn
        let history = router.contexts().provider_transcript(&id, "openai").await.unwrap();
        assert_eq!(history.len(), 2);
    }

    #[tokio::test]
    async fn every_provider_failing_yields_fixed_strings() {
        let router = router_with(
            &[
                MockGateway::failing("openai", "network unreachable"),
                MockGateway::failing("google", "network unreachable"),
            ],
            None,
        );
        let outcome = router.process_message(None, "Hello?").await.unwrap();
        let aggregated = outcome.aggregated.unwrap();
        assert_eq!(
            aggregated.mean_answer.as_deref(),
            Some("All AI providers failed to respond.")
        );
        assert_eq!(aggregated.best_answer.as_deref(), Some("No responses available."));

        let history = router
            .contexts()
            .provider_transcript(&outcome.conversation_id, "google")
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "Hello?");
    }

    #[tokio::test]
    async fn single_configured_provider_receives_every_forward() {
        let only = MockGateway::always("anthropic", "Answer");
        let router = router_with(&[only.clone()], None);
        assert_eq!(router.orchestrator().available_providers(), vec!["anthropic"]);

        let outcome = router.process_message(None, "Question").await.unwrap();
        let aggregated = outcome.aggregated.unwrap();
        assert_eq!(aggregated.responses.len(), 1);
        assert_eq!(aggregated.responses[0].provider.id, "anthropic");
        assert_eq!(only.call_count(), 1);
    }

    #[tokio::test]
    async fn numeric_answers_average_without_synthesis() {
        let router = router_with(
            &[MockGateway::always("openai", "$100"), MockGateway::always("google", "$200")],
            Some(MockGateway::failing("synth", "synthesis unavailable")),
        );
        let outcome = router.process_message(None, "Price?").await.unwrap();
        let aggregated = outcome.aggregated.unwrap();
        assert_eq!(aggregated.mean_answer.as_deref(), Some("Mean value: $150.00"));
        assert!(outcome.response.contains("### Mean Answer\nMean value: $150.00"));
    }

    #[tokio::test]
    async fn forwarded_turns_grow_transcript_by_two() {
        let router = router_with(&[MockGateway::always("openai", "ok")], None);
        let mut id = None;
        for n in 1..=4 {
            let outcome = router
                .process_message(id.as_deref(), &format!("question {n}"))
                .await
                .unwrap();
            assert!(outcome.routing.should_forward);
            id = Some(outcome.conversation_id);
            let transcript = router.contexts().transcript(id.as_deref().unwrap()).await.unwrap();
            assert_eq!(transcript.len(), 2 * n);
        }
    }

    #[tokio::test]
    async fn classifier_subset_limits_fanout() {
        let openai = MockGateway::always("openai", "A");
        let google = MockGateway::always("google", "B");
        let classifier = MockGateway::always(
            "router",
            r#"{"decision": "forward to specific", "providers": ["google"], "reason": "needs search"}"#,
        );
        let available = vec!["openai".to_string(), "google".to_string()];
        let contexts = Arc::new(
            ContextManager::new(OrchestratorSettings::default())
                .with_classifier(RoutingClassifier::new(classifier, "Chorus", 0.1), available),
        );
        let router = Router::new(
            contexts,
            Arc::new(Orchestrator::new(as_gateways(&[openai.clone(), google.clone()]))),
            ResponseAggregator::new(None),
            None,
        );

        let first = router.process_message(None, "Start").await.unwrap();
        let second = router
            .process_message(Some(&first.conversation_id), "Latest news?")
            .await
            .unwrap();
        assert_eq!(second.routing.providers, Some(vec!["google".to_string()]));
        assert_eq!(second.aggregated.unwrap().responses.len(), 1);
        assert_eq!(openai.call_count(), 1);
        assert_eq!(google.call_count(), 2);

        // google's second request is seeded from its own history only
        let request = google.requests().last().cloned().unwrap();
        let contents: Vec<_> = request.iter().skip(1).map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["Start", "B", "Latest news?"]);
    }

    #[tokio::test]
    async fn direct_reply_failure_is_a_notice() {
        let openai = Arc::new(MockGateway::new(
            "openai",
            vec![MockReply::text("first"), MockReply::error("HTTP 500: boom")],
        ));
        let router = router_with(&[openai], None);
        let first = router.process_message(None, "Hi").await.unwrap();
        let outcome = router
            .process_message(Some(&first.conversation_id), "What was the best answer?")
            .await
            .unwrap();
        assert!(!outcome.routing.should_forward);
        assert!(outcome.response.starts_with("Chorus:"));
        assert!(outcome.response.contains("HTTP 500: boom"));
    }

    #[tokio::test]
    async fn empty_message_is_rejected() {
        let router = router_with(&[MockGateway::always("openai", "x")], None);
        let err = router.process_message(None, "   ").await.unwrap_err();
        assert!(matches!(err, ChorusError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn concurrent_turns_on_one_conversation_are_serialized() {
        let slow = Arc::new(MockGateway::new(
            "openai",
            vec![MockReply::delayed(
                std::time::Duration::from_millis(50),
                MockReply::text("ok"),
            )],
        ));
        let router = Arc::new(router_with(&[slow], None));
        let id = router.contexts().ensure_conversation(None).await.unwrap();

        let a = {
            let router = router.clone();
            let id = id.clone();
            tokio::spawn(async move { router.process_message(Some(&id), "one").await })
        };
        let b = {
            let router = router.clone();
            let id = id.clone();
            tokio::spawn(async move { router.process_message(Some(&id), "two").await })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        let transcript = router.contexts().transcript(&id).await.unwrap();
        assert_eq!(transcript.len(), 4);
        assert_eq!(transcript[0].role, crate::agents::Role::User);
        assert_eq!(transcript[1].role, crate::agents::Role::Assistant);
        assert_eq!(transcript[2].role, crate::agents::Role::User);
        assert_eq!(transcript[3].role, crate::agents::Role::Assistant);
    }

    #[tokio::test]
    async fn turn_locks_are_released_after_each_turn() {
        let router = Arc::new(router_with(&[MockGateway::always("openai", "ok")], None));
        let mut ids = Vec::new();
        for i in 0..5 {
            let outcome = router.process_message(None, &format!("question {i}")).await.unwrap();
            ids.push(outcome.conversation_id);
        }
        router.process_message(Some(&ids[0]), "again").await.unwrap();
        assert!(router.turn_locks.is_empty());

        let (a, b) = tokio::join!(
            router.process_message(Some(&ids[1]), "one"),
            router.process_message(Some(&ids[1]), "two"),
        );
        a.unwrap();
        b.unwrap();
        assert!(router.turn_locks.is_empty());
    }
}
