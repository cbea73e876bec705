//! Scripted model doubles for unit tests.

use super::client::{ChatModel, ChatRequest, LlmResponse};
use super::embeddings::EmbeddingModel;
use super::models::{ModelFamily, Usage};
use futures::future::{BoxFuture, FutureExt};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Replies with queued responses in order; once the queue is drained the last
/// reply repeats. Records every request it sees.
pub(crate) struct ScriptedModel {
    family: ModelFamily,
    replies: Mutex<VecDeque<String>>,
    last: Mutex<Option<String>>,
    requests: Mutex<Vec<ChatRequest>>,
    calls: AtomicUsize,
    fail: bool,
}

impl ScriptedModel {
    pub const TOKENS_PER_CALL: u32 = 10;

    pub fn new<I, S>(family: ModelFamily, replies: I) -> Arc<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Arc::new(Self {
            family,
            replies: Mutex::new(replies.into_iter().map(Into::into).collect()),
            last: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            fail: false,
        })
    }

    /// A model whose every call fails at the transport level.
    pub fn failing(family: ModelFamily) -> Arc<Self> {
        Arc::new(Self {
            family,
            replies: Mutex::new(VecDeque::new()),
            last: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            fail: true,
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn next_reply(&self) -> String {
        let mut replies = self.replies.lock().unwrap();
        let mut last = self.last.lock().unwrap();
        match replies.pop_front() {
            Some(reply) => {
                *last = Some(reply.clone());
                reply
            }
            None => last.clone().unwrap_or_default(),
        }
    }
}

impl ChatModel for ScriptedModel {
    fn family(&self) -> ModelFamily {
        self.family
    }

    fn complete<'a>(&'a self, request: &'a ChatRequest) -> BoxFuture<'a, anyhow::Result<LlmResponse>> {
        async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().unwrap().push(request.clone());
            if self.fail {
                anyhow::bail!("connection refused");
            }
            Ok(LlmResponse {
                content: self.next_reply(),
                usage: Some(Usage {
                    prompt_tokens: Self::TOKENS_PER_CALL / 2,
                    completion_tokens: Self::TOKENS_PER_CALL / 2,
                    total_tokens: Self::TOKENS_PER_CALL,
                }),
                model: "scripted".to_string(),
            })
        }
        .boxed()
    }
}

/// Routes each request to a reply by the first marker its system prompt contains.
pub(crate) struct RoutedModel {
    routes: Vec<(&'static str, Arc<ScriptedModel>)>,
    family: ModelFamily,
}

impl RoutedModel {
    pub fn new(family: ModelFamily, routes: Vec<(&'static str, Arc<ScriptedModel>)>) -> Arc<Self> {
        Arc::new(Self { routes, family })
    }
}

impl ChatModel for RoutedModel {
    fn family(&self) -> ModelFamily {
        self.family
    }

    fn complete<'a>(&'a self, request: &'a ChatRequest) -> BoxFuture<'a, anyhow::Result<LlmResponse>> {
        match self
            .routes
            .iter()
            .find(|(marker, _)| request.system.contains(marker))
        {
            Some((_, model)) => model.complete(request),
            None => async move {
                anyhow::bail!("no scripted route for prompt: {}", request.system.lines().next().unwrap_or(""))
            }
            .boxed(),
        }
    }
}

/// Deterministic bag-of-words embedding: hashes tokens into fixed buckets.
pub(crate) struct HashingEmbedder {
    dimensions: usize,
    pub calls: AtomicUsize,
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Arc<Self> {
        Arc::new(Self {
            dimensions,
            calls: AtomicUsize::new(0),
        })
    }

    fn bucket(term: &str, dims: usize) -> usize {
        let mut h: u64 = 0xcbf29ce484222325;
        for b in term.as_bytes() {
            h ^= *b as u64;
            h = h.wrapping_mul(0x100000001b3);
        }
        (h as usize) % dims
    }

    fn vector(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dimensions];
        for token in text
            .split(|c: char| !c.is_alphanumeric() && c != '_')
            .filter(|t| t.len() >= 2)
        {
            v[Self::bucket(&token.to_lowercase(), self.dimensions)] += 1.0;
        }
        v
    }
}

impl EmbeddingModel for HashingEmbedder {
    fn embed<'a>(&'a self, texts: &'a [String]) -> BoxFuture<'a, anyhow::Result<Vec<Vec<f32>>>> {
        async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(texts.iter().map(|t| self.vector(t)).collect())
        }
        .boxed()
    }
}
