use async_trait::async_trait;
use kora_shared::{ContentUnit, Generation, GenerationRequest, Generator, Originator, ProposedToolCall, Usage};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Respond = Box<dyn Fn(&GenerationRequest) -> anyhow::Result<Generation> + Send + Sync>;

/// Generator double: answers through a closure and records every request.
pub struct MockGenerator {
    respond: Respond,
    delay: Duration,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl MockGenerator {
    pub fn from_fn<F>(respond: F) -> Self
    where
        F: Fn(&GenerationRequest) -> anyhow::Result<Generation> + Send + Sync + 'static,
    {
        Self {
            respond: Box::new(respond),
            delay: Duration::ZERO,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Replies `echo: <text>` with no tool calls.
    pub fn echo() -> Arc<Self> {
        Arc::new(Self::from_fn(echo_reply))
    }

    /// Replies with fixed text and proposes the given tool calls every time.
    pub fn with_tool_calls(calls: Vec<ProposedToolCall>) -> Arc<Self> {
        Arc::new(Self::from_fn(move |_| Ok(reply("working on it", calls.clone()))))
    }

    pub fn failing(message: &'static str) -> Arc<Self> {
        Arc::new(Self::from_fn(move |_| Err(anyhow::anyhow!(message))))
    }

    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn last_request(&self) -> Option<GenerationRequest> {
        self.requests.lock().unwrap().last().cloned()
    }
}

pub fn echo_reply(request: &GenerationRequest) -> anyhow::Result<Generation> {
    let text: Vec<&str> = request.content.iter().filter_map(ContentUnit::as_text).collect();
    Ok(reply(&format!("echo: {}", text.join(" ")), Vec::new()))
}

pub fn reply(text: &str, tool_calls: Vec<ProposedToolCall>) -> Generation {
    Generation {
        content: vec![ContentUnit::text(text, Originator::Agent)],
        tool_calls,
        usage: Usage {
            prompt_tokens: 12,
            completion_tokens: 4,
        },
        model: Some("mock-model".to_string()),
    }
}

#[async_trait]
impl Generator for MockGenerator {
    fn name(&self) -> &str {
        "mock"
    }

    async fn generate(&self, request: GenerationRequest) -> anyhow::Result<Generation> {
        self.requests.lock().unwrap().push(request.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        (self.respond)(&request)
    }
}
