use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::gateway::{
    ChatMessage, ProviderDescriptor, ProviderGateway, ProviderResponse, SendOptions,
};

/// Pre-programmed replies for deterministic tests without network calls.
#[derive(Clone, Debug)]
pub enum MockReply {
    Text(String),
    Error(String),
    Delay(Duration, Box<MockReply>),
}

impl MockReply {
    pub fn text(text: &str) -> Self {
        Self::Text(text.to_string())
    }

    pub fn error(error: &str) -> Self {
        Self::Error(error.to_string())
    }

    pub fn delayed(delay: Duration, inner: MockReply) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Gateway returning scripted replies in sequence. Once the script runs out
/// the last reply repeats.
pub struct MockGateway {
    descriptor: ProviderDescriptor,
    replies: Vec<MockReply>,
    call_count: AtomicUsize,
    requests: Mutex<Vec<(Vec<ChatMessage>, SendOptions)>>,
}

impl MockGateway {
    pub fn new(id: &str, replies: Vec<MockReply>) -> Self {
        Self {
            descriptor: ProviderDescriptor {
                id: id.to_string(),
                display_name: display_name(id),
                model: format!("{id}-mock"),
            },
            replies,
            call_count: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn always(id: &str, text: &str) -> Arc<Self> {
        Arc::new(Self::new(id, vec![MockReply::text(text)]))
    }

    pub fn failing(id: &str, error: &str) -> Arc<Self> {
        Arc::new(Self::new(id, vec![MockReply::error(error)]))
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<Vec<ChatMessage>> {
        self.requests.lock().iter().map(|(m, _)| m.clone()).collect()
    }

    /// Options of every call, in call order.
    pub fn options(&self) -> Vec<SendOptions> {
        self.requests.lock().iter().map(|(_, o)| o.clone()).collect()
    }
}

fn display_name(id: &str) -> String {
    let mut chars = id.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[async_trait]
impl ProviderGateway for MockGateway {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    async fn send_message(
        &self,
        messages: &[ChatMessage],
        options: &SendOptions,
    ) -> ProviderResponse {
        let idx = self.call_count.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push((messages.to_vec(), options.clone()));
        let Some(reply) = self.replies.get(idx).or_else(|| self.replies.last()) else {
            return ProviderResponse::failure(
                self.descriptor.clone(),
                format!("MockGateway: no reply configured for call {idx}"),
            );
        };

        let mut current = reply;
        loop {
            match current {
                MockReply::Text(text) => {
                    return ProviderResponse::success(self.descriptor.clone(), text.clone(), None)
                }
                MockReply::Error(error) => {
                    return ProviderResponse::failure(self.descriptor.clone(), error.clone())
                }
                MockReply::Delay(delay, inner) => {
                    tokio::time::sleep(*delay).await;
                    current = inner;
                }
            }
        }
    }
}

pub fn as_gateways(mocks: &[Arc<MockGateway>]) -> Vec<Arc<dyn ProviderGateway>> {
    mocks
        .iter()
        .map(|m| m.clone() as Arc<dyn ProviderGateway>)
        .collect()
}
