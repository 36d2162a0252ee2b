//! The orchestration graph
//!
//! A run walks a fixed sequence of nodes over one [`ConversationState`]:
//!
//! ```text
//! Prepare -> FetchKnownTerms -> AskNeededTerms -> FetchMeanings -> GenerateAnswer
//!                                     ^                                  |
//!                                     +------ needs more context --------+
//!                                                                        |
//!            Finalize <- Persist <- ExtractNewKnowledge <- FinalAnswer <-+
//! ```
//!
//! The graph itself is an immutable definition shared by every run; the
//! state is the only mutable piece and belongs to exactly one run.

use std::sync::Arc;

use async_stream::stream;
use futures::StreamExt;
use glossa_ai::{
    ChatRequest, DeltaEvent, LlmProvider, Message, Providers, StructuredSchema, TextAccumulator,
};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::channel::{TokenEvent, TokenSender, token_channel};
use crate::error::{Error, Result};
use crate::events::{RunStream, StreamEvent};
use crate::knowledge::{KnowledgeStore, NewKnowledge};
use crate::prompts::{self, Assessment, NeededTerms};
use crate::resolve::{ModelDefaults, resolve_target};
use crate::state::{ConversationState, RunOutput};

pub const DEFAULT_ESCALATION_STEP: u32 = 500;
pub const DEFAULT_MAX_SIMPLICITY_TIER: u32 = 1000;
pub const DEFAULT_BASE_SIMPLICITY_TIER: u32 = 0;
pub const DEFAULT_MAX_NEEDED_TERMS: usize = 32;

/// Escalation parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GraphConfig {
    /// Tier increase per loop iteration
    pub escalation_step: u32,
    /// Tier ceiling; the loop stops once reached
    pub max_simplicity_tier: u32,
    /// Starting tier, also the tier new terms are stored at
    pub base_simplicity_tier: u32,
    /// Cap on titles requested in one iteration
    pub max_needed_terms: usize,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            escalation_step: DEFAULT_ESCALATION_STEP,
            max_simplicity_tier: DEFAULT_MAX_SIMPLICITY_TIER,
            base_simplicity_tier: DEFAULT_BASE_SIMPLICITY_TIER,
            max_needed_terms: DEFAULT_MAX_NEEDED_TERMS,
        }
    }
}

impl GraphConfig {
    pub fn validate(&self) -> Result<()> {
        if self.escalation_step == 0 {
            return Err(Error::Configuration(
                "escalation step must be positive".into(),
            ));
        }
        if self.base_simplicity_tier > self.max_simplicity_tier {
            return Err(Error::Configuration(
                "base simplicity tier exceeds the maximum".into(),
            ));
        }
        Ok(())
    }

    /// Upper bound on assessments in one run
    pub fn max_iterations(&self) -> u32 {
        let span = self
            .max_simplicity_tier
            .saturating_sub(self.base_simplicity_tier);
        span.div_ceil(self.escalation_step) + 1
    }
}

/// Nodes of the graph
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Node {
    Prepare,
    FetchKnownTerms,
    AskNeededTerms,
    FetchMeanings,
    GenerateAnswer,
    FinalAnswer,
    ExtractNewKnowledge,
    Persist,
    Finalize,
}

impl Node {
    pub fn name(&self) -> &'static str {
        match self {
            Node::Prepare => "prepare",
            Node::FetchKnownTerms => "fetch_known_terms",
            Node::AskNeededTerms => "ask_needed_terms",
            Node::FetchMeanings => "fetch_meanings",
            Node::GenerateAnswer => "generate_answer",
            Node::FinalAnswer => "final_answer",
            Node::ExtractNewKnowledge => "extract_new_knowledge",
            Node::Persist => "persist",
            Node::Finalize => "finalize",
        }
    }
}

/// A caller's request for one run
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    /// Model id, optionally `provider:model`
    pub model: Option<String>,
    /// Explicit provider tag
    pub provider: Option<String>,
    pub messages: Vec<Message>,
    pub temperature: Option<f32>,
}

impl RunRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

struct GraphInner {
    providers: Providers,
    store: Arc<dyn KnowledgeStore>,
    config: GraphConfig,
    defaults: ModelDefaults,
}

/// Per-run collaborators that are not part of the conversation state
struct RunContext {
    provider: Arc<dyn LlmProvider>,
    tokens: Option<TokenSender>,
    cancel: CancellationToken,
}

/// Immutable graph definition, built once and shared by all runs
#[derive(Clone)]
pub struct KnowledgeGraph {
    inner: Arc<GraphInner>,
}

impl KnowledgeGraph {
    pub fn new(
        providers: Providers,
        store: Arc<dyn KnowledgeStore>,
        config: GraphConfig,
        defaults: ModelDefaults,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(GraphInner {
                providers,
                store,
                config,
                defaults,
            }),
        })
    }

    pub fn config(&self) -> &GraphConfig {
        &self.inner.config
    }

    /// Run the graph to completion and return its summary
    pub async fn run_blocking(&self, request: RunRequest) -> Result<RunOutput> {
        let (mut state, provider) = self.admit(request, false)?;
        let mut ctx = RunContext {
            provider,
            tokens: None,
            cancel: CancellationToken::new(),
        };
        self.drive(&mut state, &mut ctx).await?;
        Ok(state.into_output())
    }

    /// Run the graph, yielding answer deltas as they are generated.
    ///
    /// Configuration and request errors are returned before anything runs.
    /// The stream ends with exactly one [`StreamEvent::Done`] or
    /// [`StreamEvent::Error`]. Dropping it cancels the run, which stops the
    /// backend stream and skips persistence.
    pub fn run_streaming(&self, request: RunRequest) -> Result<RunStream> {
        let (mut state, provider) = self.admit(request, true)?;
        let cancel = CancellationToken::new();
        let (tx, mut rx) = token_channel(cancel.clone());

        let graph = self.clone();
        let run_cancel = cancel.clone();
        let mut handle = tokio::spawn(async move {
            let mut ctx = RunContext {
                provider,
                tokens: Some(tx),
                cancel: run_cancel,
            };
            let result = graph.drive(&mut state, &mut ctx).await;
            if let (Err(e), Some(tokens)) = (&result, ctx.tokens.take()) {
                tokens.fail(e.to_string()).await;
            }
            result.map(|_| state.into_output())
        });

        // Armed before the first poll, so dropping an unpolled stream cancels too.
        let guard = cancel.drop_guard();

        Ok(Box::pin(stream! {
            let _guard = guard;

            loop {
                match rx.next_event().await {
                    Ok(Some(token)) => yield StreamEvent::Delta { text: token.delta_text },
                    Ok(None) => break,
                    Err(e) => {
                        // Prefer the run's own error over the channel's view of it.
                        let message = match (&mut handle).await {
                            Ok(Err(run_error)) => run_error.to_string(),
                            _ => e.to_string(),
                        };
                        yield StreamEvent::Error { message };
                        return;
                    }
                }
            }

            match (&mut handle).await {
                Ok(Ok(output)) => yield StreamEvent::Done { output },
                Ok(Err(e)) => yield StreamEvent::Error { message: e.to_string() },
                Err(e) => yield StreamEvent::Error {
                    message: format!("run task failed: {e}"),
                },
            }
        }))
    }

    /// Resolve the target and build the initial state. Nothing has run yet.
    fn admit(
        &self,
        request: RunRequest,
        stream: bool,
    ) -> Result<(ConversationState, Arc<dyn LlmProvider>)> {
        if request.messages.is_empty() {
            return Err(Error::InvalidRequest("messages must not be empty".into()));
        }
        let (provider, model) = resolve_target(
            request.model.as_deref(),
            request.provider.as_deref(),
            &self.inner.defaults,
        )?;
        let backend = self.inner.providers.get(provider)?;
        let state = ConversationState::new(
            provider,
            model,
            request.messages,
            request.temperature,
            stream,
            self.inner.config.base_simplicity_tier,
        );
        Ok((state, backend))
    }

    async fn drive(&self, state: &mut ConversationState, ctx: &mut RunContext) -> Result<()> {
        let mut node = Node::Prepare;
        loop {
            if ctx.cancel.is_cancelled() {
                tracing::debug!(run_id = %state.run_id, node = node.name(), "run cancelled");
                return Err(Error::StreamClosed);
            }
            tracing::debug!(
                run_id = %state.run_id,
                node = node.name(),
                tier = state.simplicity_tier,
                "entering node"
            );

            let step = match node {
                Node::Prepare => {
                    state.normalize();
                    Ok(Node::FetchKnownTerms)
                }
                Node::FetchKnownTerms => self
                    .refresh_known_terms(state)
                    .await
                    .map(|_| Node::AskNeededTerms),
                Node::AskNeededTerms => self
                    .ask_needed_terms(state, ctx)
                    .await
                    .map(|_| Node::FetchMeanings),
                Node::FetchMeanings => self
                    .fetch_meanings(state)
                    .await
                    .map(|_| Node::GenerateAnswer),
                Node::GenerateAnswer => self
                    .generate_answer(state, ctx)
                    .await
                    .map(|_| self.decide(state)),
                Node::FinalAnswer => self
                    .final_answer(state, ctx)
                    .await
                    .map(|_| Node::ExtractNewKnowledge),
                Node::ExtractNewKnowledge => {
                    state.new_terms = state.unresolved_terms();
                    Ok(Node::Persist)
                }
                Node::Persist => {
                    self.persist(state, ctx).await;
                    Ok(Node::Finalize)
                }
                Node::Finalize => {
                    tracing::info!(
                        run_id = %state.run_id,
                        provider = %state.provider,
                        model = %state.model,
                        tier = state.simplicity_tier,
                        iterations = state.iterations,
                        resolved = state.resolved_meanings.len(),
                        new_terms = state.new_terms.len(),
                        "run finished"
                    );
                    return Ok(());
                }
            };

            node = match step {
                Ok(next) => next,
                Err(e) => {
                    if !e.is_cancellation() {
                        tracing::warn!(
                            run_id = %state.run_id,
                            node = node.name(),
                            error = %e,
                            "run aborted"
                        );
                    }
                    state.error = Some(e.to_string());
                    return Err(e);
                }
            };
        }
    }

    /// Conditional edge after GenerateAnswer
    fn decide(&self, state: &mut ConversationState) -> Node {
        let config = &self.inner.config;
        if state.needs_more_context && state.simplicity_tier < config.max_simplicity_tier {
            state.escalate(config.escalation_step, config.max_simplicity_tier);
            tracing::debug!(
                run_id = %state.run_id,
                tier = state.simplicity_tier,
                "escalating simplicity tier"
            );
            Node::AskNeededTerms
        } else {
            Node::FinalAnswer
        }
    }

    async fn refresh_known_terms(&self, state: &mut ConversationState) -> Result<()> {
        if !state.known_terms_stale() {
            return Ok(());
        }
        state.known_terms = self.inner.store.list_titles(state.simplicity_tier).await?;
        state.known_terms_tier = Some(state.simplicity_tier);
        Ok(())
    }

    async fn ask_needed_terms(&self, state: &mut ConversationState, ctx: &RunContext) -> Result<()> {
        self.refresh_known_terms(state).await?;

        // Terms the previous assessment asked for are carried into this round.
        let carried = std::mem::take(&mut state.needed_terms);

        let requested = if state.known_terms.is_empty() {
            tracing::debug!(run_id = %state.run_id, "no known terms, skipping question");
            Vec::new()
        } else {
            let hint = prompts::known_terms_hint(&state.known_terms);
            let schema = prompts::needed_terms_schema();
            match self
                .structured::<NeededTerms>(state, ctx, Some(hint), &schema)
                .await
            {
                Ok(reply) => reply.terms,
                Err(e) if e.is_cancellation() => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        run_id = %state.run_id,
                        error = %e,
                        "needed-terms reply unusable, treating as none"
                    );
                    Vec::new()
                }
            }
        };

        state.request_terms(
            requested.iter().chain(carried.iter()),
            self.inner.config.max_needed_terms,
        );
        Ok(())
    }

    async fn fetch_meanings(&self, state: &mut ConversationState) -> Result<()> {
        if state.needed_terms.is_empty() {
            return Ok(());
        }
        let found = self
            .inner
            .store
            .fetch_definitions(&state.needed_terms, state.simplicity_tier)
            .await?;
        let merged = state.resolve(found);
        tracing::debug!(run_id = %state.run_id, merged, "resolved meanings");
        Ok(())
    }

    async fn generate_answer(&self, state: &mut ConversationState, ctx: &RunContext) -> Result<()> {
        state.iterations += 1;
        let prompt = prompts::assessment_prompt(&state.resolved_meanings);
        let schema = prompts::assessment_schema();

        let assessment = match self
            .structured::<Assessment>(state, ctx, Some(prompt), &schema)
            .await
        {
            Ok(assessment) => assessment,
            Err(e) if e.is_cancellation() => return Err(e),
            Err(e) => {
                tracing::warn!(
                    run_id = %state.run_id,
                    error = %e,
                    "assessment unusable, assuming no more context needed"
                );
                Assessment::default()
            }
        };

        state.needs_more_context = assessment.needs_more_context;
        state.request_terms(
            &assessment.needed_terms,
            self.inner.config.max_needed_terms,
        );
        Ok(())
    }

    async fn final_answer(&self, state: &mut ConversationState, ctx: &mut RunContext) -> Result<()> {
        let messages = state.with_context(prompts::meanings_block(&state.resolved_meanings));
        let request = ChatRequest::new(state.model.clone(), messages)
            .with_temperature(state.temperature);

        let Some(tokens) = ctx.tokens.take() else {
            let answer = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => return Err(Error::StreamClosed),
                answer = ctx.provider.complete(&request, None) => answer?,
            };
            state.answer = answer;
            return Ok(());
        };

        match stream_answer(state, ctx, &request, &tokens).await {
            Ok(answer) => {
                tokens.finish().await?;
                state.answer = answer;
                Ok(())
            }
            Err(e) => {
                if !e.is_cancellation() {
                    tokens.fail(e.to_string()).await;
                }
                Err(e)
            }
        }
    }

    async fn persist(&self, state: &mut ConversationState, ctx: &RunContext) {
        if ctx.cancel.is_cancelled() {
            tracing::debug!(run_id = %state.run_id, "cancelled, not persisting");
            return;
        }
        if state.new_terms.is_empty() {
            return;
        }

        let tier = self.inner.config.base_simplicity_tier;
        let batch: Vec<NewKnowledge> = state
            .new_terms
            .iter()
            .map(|title| NewKnowledge::title_only(title.clone(), tier))
            .collect();

        let result = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                tracing::debug!(run_id = %state.run_id, "cancelled while persisting");
                return;
            }
            result = self.inner.store.upsert_if_absent(&batch) => result,
        };

        match result {
            Ok(inserted) => {
                tracing::debug!(run_id = %state.run_id, inserted, "persisted new terms");
            }
            Err(e) => {
                tracing::warn!(run_id = %state.run_id, error = %e, "persisting new terms failed");
                state.error = Some(format!("persisting new terms failed: {e}"));
            }
        }
    }

    /// One structured call with `context` appended, decoded into `T`
    async fn structured<T: DeserializeOwned>(
        &self,
        state: &ConversationState,
        ctx: &RunContext,
        context: Option<String>,
        schema: &StructuredSchema,
    ) -> Result<T> {
        let request = ChatRequest::new(state.model.clone(), state.with_context(context))
            .with_temperature(state.temperature);

        let value = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(Error::StreamClosed),
            value = ctx.provider.complete_structured(&request, schema) => value?,
        };
        serde_json::from_value(value).map_err(|e| Error::SchemaValidation(e.to_string()))
    }
}

/// Pump the provider stream into the token channel, returning the full answer
async fn stream_answer(
    state: &ConversationState,
    ctx: &RunContext,
    request: &ChatRequest,
    tokens: &TokenSender,
) -> Result<String> {
    let mut deltas = tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => return Err(Error::StreamClosed),
        deltas = ctx.provider.stream(request) => deltas?,
    };
    let mut accumulated = TextAccumulator::new();

    loop {
        let event = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(Error::StreamClosed),
            event = deltas.next() => event,
        };

        match event {
            Some(DeltaEvent::Delta { text }) => {
                let cumulative = accumulated.push(&text).to_string();
                tokens
                    .send(TokenEvent {
                        delta_text: text,
                        cumulative_text: cumulative,
                        provider: state.provider,
                        model: state.model.clone(),
                    })
                    .await?;
            }
            Some(DeltaEvent::Done { .. }) => {
                tracing::debug!(
                    run_id = %state.run_id,
                    deltas = accumulated.delta_count(),
                    "answer stream complete"
                );
                return Ok(accumulated.into_text());
            }
            Some(DeltaEvent::Error { message }) => {
                return Err(Error::AdapterCall(glossa_ai::Error::api(
                    "stream_error",
                    message,
                )));
            }
            None => {
                return Err(Error::AdapterCall(glossa_ai::Error::api(
                    "stream_error",
                    "stream ended without a terminal event",
                )));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use glossa_ai::{DeltaStream, Provider, Usage};
    use parking_lot::Mutex;

    use crate::knowledge::{InMemoryKnowledgeStore, KnowledgeError};
    use crate::prompts::{ASSESSMENT_SCHEMA, NEEDED_TERMS_SCHEMA};

    /// A provider that replays canned replies per call kind.
    struct ScriptedProvider {
        kind: Provider,
        needed: Mutex<VecDeque<std::result::Result<String, String>>>,
        assessments: Mutex<VecDeque<std::result::Result<String, String>>>,
        answer_chunks: Vec<String>,
        fail_answer: bool,
        endless_stream: bool,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedProvider {
        fn new(answer_chunks: &[&str]) -> Self {
            Self {
                kind: Provider::Local,
                needed: Mutex::new(VecDeque::new()),
                assessments: Mutex::new(VecDeque::new()),
                answer_chunks: answer_chunks.iter().map(|s| s.to_string()).collect(),
                fail_answer: false,
                endless_stream: false,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn needed(self, reply: &str) -> Self {
            self.needed.lock().push_back(Ok(reply.to_string()));
            self
        }

        fn needed_failure(self) -> Self {
            self.needed.lock().push_back(Err("backend down".to_string()));
            self
        }

        fn assess(self, needs_more: bool, terms: &[&str]) -> Self {
            let reply = serde_json::json!({
                "needs_more_context": needs_more,
                "needed_terms": terms,
            })
            .to_string();
            self.assessments.lock().push_back(Ok(reply));
            self
        }

        fn assess_failure(self) -> Self {
            self.assessments
                .lock()
                .push_back(Err("backend down".to_string()));
            self
        }

        fn calls_of(&self, name: &str) -> usize {
            self.calls.lock().iter().filter(|c| *c == name).count()
        }

        fn answer(&self) -> String {
            self.answer_chunks.concat()
        }
    }

    fn pop(queue: &Mutex<VecDeque<std::result::Result<String, String>>>, default: &str) -> glossa_ai::Result<String> {
        match queue.lock().pop_front() {
            Some(Ok(reply)) => Ok(reply),
            Some(Err(message)) => Err(glossa_ai::Error::api("server_error", message)),
            None => Ok(default.to_string()),
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        fn kind(&self) -> Provider {
            self.kind
        }

        async fn complete(
            &self,
            _request: &ChatRequest,
            schema: Option<&StructuredSchema>,
        ) -> glossa_ai::Result<String> {
            match schema.map(|s| s.name.as_str()) {
                Some(NEEDED_TERMS_SCHEMA) => {
                    self.calls.lock().push(NEEDED_TERMS_SCHEMA.into());
                    pop(&self.needed, r#"{"terms": []}"#)
                }
                Some(ASSESSMENT_SCHEMA) => {
                    self.calls.lock().push(ASSESSMENT_SCHEMA.into());
                    pop(
                        &self.assessments,
                        r#"{"needs_more_context": false, "needed_terms": []}"#,
                    )
                }
                _ => {
                    self.calls.lock().push("complete".into());
                    if self.fail_answer {
                        Err(glossa_ai::Error::api("server_error", "answer failed"))
                    } else {
                        Ok(self.answer())
                    }
                }
            }
        }

        async fn stream(&self, _request: &ChatRequest) -> glossa_ai::Result<DeltaStream> {
            self.calls.lock().push("stream".into());
            let chunks = self.answer_chunks.clone();
            let fail = self.fail_answer;
            let endless = self.endless_stream;
            Ok(Box::pin(async_stream::stream! {
                let mut text = String::new();
                for chunk in chunks {
                    text.push_str(&chunk);
                    yield DeltaEvent::Delta { text: chunk };
                }
                if endless {
                    loop {
                        tokio::time::sleep(Duration::from_millis(2)).await;
                        yield DeltaEvent::Delta { text: "more ".into() };
                    }
                }
                if fail {
                    yield DeltaEvent::Error { message: "connection reset".into() };
                } else {
                    yield DeltaEvent::Done { text, usage: Usage::default() };
                }
            }))
        }

        async fn list_models(&self) -> glossa_ai::Result<Vec<String>> {
            Ok(vec!["scripted".into()])
        }
    }

    /// Wraps the in-memory store, counting calls and injecting faults.
    #[derive(Default)]
    struct RecordingStore {
        inner: InMemoryKnowledgeStore,
        list_calls: AtomicUsize,
        fetch_calls: AtomicUsize,
        upsert_calls: AtomicUsize,
        fail_reads: bool,
        fail_upsert: bool,
        list_tiers: Mutex<Vec<u32>>,
    }

    impl RecordingStore {
        fn with(entries: &[(&str, &str, u32)]) -> Self {
            let store = Self::default();
            for (title, content, simplicity) in entries {
                store.inner.insert(*title, *content, *simplicity);
            }
            store
        }
    }

    #[async_trait]
    impl KnowledgeStore for RecordingStore {
        async fn list_titles(&self, max: u32) -> std::result::Result<Vec<String>, KnowledgeError> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            self.list_tiers.lock().push(max);
            if self.fail_reads {
                return Err(KnowledgeError::Backend("disk on fire".into()));
            }
            self.inner.list_titles(max).await
        }

        async fn fetch_definitions(
            &self,
            titles: &[String],
            max: u32,
        ) -> std::result::Result<BTreeMap<String, String>, KnowledgeError> {
            self.fetch_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_reads {
                return Err(KnowledgeError::Backend("disk on fire".into()));
            }
            self.inner.fetch_definitions(titles, max).await
        }

        async fn upsert_if_absent(
            &self,
            batch: &[NewKnowledge],
        ) -> std::result::Result<usize, KnowledgeError> {
            self.upsert_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_upsert {
                return Err(KnowledgeError::Transaction("constraint violated".into()));
            }
            self.inner.upsert_if_absent(batch).await
        }
    }

    fn graph(provider: Arc<ScriptedProvider>, store: Arc<RecordingStore>) -> KnowledgeGraph {
        KnowledgeGraph::new(
            Providers::new().with(provider),
            store,
            GraphConfig::default(),
            ModelDefaults::default(),
        )
        .unwrap()
    }

    fn request() -> RunRequest {
        RunRequest::new(vec![Message::user("Explain foo and bar.")])
    }

    async fn collect(stream: RunStream) -> (String, Option<StreamEvent>) {
        let events: Vec<StreamEvent> = stream.collect().await;
        let mut text = String::new();
        let mut terminal = None;
        for event in events {
            match event {
                StreamEvent::Delta { text: delta } => {
                    assert!(terminal.is_none(), "delta after terminal event");
                    text.push_str(&delta);
                }
                other => terminal = Some(other),
            }
        }
        (text, terminal)
    }

    #[tokio::test]
    async fn test_empty_store_skips_needed_terms_question() {
        let provider = Arc::new(ScriptedProvider::new(&["Hello ", "there."]));
        let store = Arc::new(RecordingStore::default());
        let output = graph(provider.clone(), store.clone())
            .run_blocking(request().with_temperature(0.3))
            .await
            .unwrap();

        assert_eq!(output.answer, "Hello there.");
        assert_eq!(output.provider, Provider::Local);
        assert_eq!(output.model, "llama3.1");
        assert_eq!(provider.calls_of(NEEDED_TERMS_SCHEMA), 0);
        assert_eq!(provider.calls_of(ASSESSMENT_SCHEMA), 1);
        assert_eq!(store.fetch_calls.load(Ordering::SeqCst), 0);
        assert_eq!(store.upsert_calls.load(Ordering::SeqCst), 0);
        assert!(output.new_terms.is_empty());
    }

    #[tokio::test]
    async fn test_unresolved_terms_become_new_knowledge() {
        let provider = Arc::new(
            ScriptedProvider::new(&["answer"]).needed(r#"{"terms": ["foo", "bar"]}"#),
        );
        let store = Arc::new(RecordingStore::with(&[("foo", "a foo", 0)]));
        let output = graph(provider.clone(), store.clone())
            .run_blocking(request())
            .await
            .unwrap();

        assert_eq!(output.resolved_terms, vec!["foo"]);
        assert_eq!(output.new_terms, vec!["bar"]);
        assert!(output.error.is_none());
        assert_eq!(store.upsert_calls.load(Ordering::SeqCst), 1);

        let stored = store.inner.get("bar").unwrap();
        assert_eq!(stored.content, "");
        assert_eq!(stored.simplicity, DEFAULT_BASE_SIMPLICITY_TIER);
        assert_eq!(store.inner.get("foo").unwrap().content, "a foo");
    }

    #[tokio::test]
    async fn test_escalation_stops_at_max_tier() {
        let provider = Arc::new(
            ScriptedProvider::new(&["answer"])
                .assess(true, &[])
                .assess(true, &[])
                .assess(true, &[]),
        );
        let store = Arc::new(RecordingStore::with(&[("foo", "a foo", 0)]));
        let g = graph(provider.clone(), store.clone());
        let output = g.run_blocking(request()).await.unwrap();

        assert_eq!(output.simplicity_tier, 1000);
        assert_eq!(provider.calls_of(ASSESSMENT_SCHEMA), 3);
        assert!(provider.calls_of(ASSESSMENT_SCHEMA) as u32 <= g.config().max_iterations());
        assert_eq!(*store.list_tiers.lock(), vec![0, 500, 1000]);
        assert_eq!(output.answer, "answer");
    }

    #[tokio::test]
    async fn test_known_terms_fetched_once_per_tier() {
        let provider = Arc::new(ScriptedProvider::new(&["answer"]).assess(false, &[]));
        let store = Arc::new(RecordingStore::with(&[("foo", "a foo", 0)]));
        graph(provider, store.clone())
            .run_blocking(request())
            .await
            .unwrap();
        assert_eq!(store.list_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_tier_gates_definitions() {
        // "tensor" only becomes visible after one escalation.
        let provider = Arc::new(
            ScriptedProvider::new(&["answer"])
                .needed(r#"{"terms": ["tensor"]}"#)
                .assess(true, &["tensor"])
                .needed(r#"{"terms": []}"#)
                .assess(false, &[]),
        );
        let store = Arc::new(RecordingStore::with(&[
            ("vector", "an arrow", 0),
            ("tensor", "a multilinear map", 500),
        ]));
        let output = graph(provider, store)
            .run_blocking(request())
            .await
            .unwrap();

        assert_eq!(output.simplicity_tier, 500);
        assert_eq!(output.resolved_terms, vec!["tensor"]);
        assert!(output.new_terms.is_empty());
    }

    #[tokio::test]
    async fn test_persist_failure_keeps_answer() {
        let provider = Arc::new(
            ScriptedProvider::new(&["still ", "answered"]).needed(r#"{"terms": ["bar"]}"#),
        );
        let store = Arc::new(RecordingStore {
            fail_upsert: true,
            ..RecordingStore::with(&[("foo", "a foo", 0)])
        });
        let output = graph(provider, store.clone())
            .run_blocking(request())
            .await
            .unwrap();

        assert_eq!(output.answer, "still answered");
        assert_eq!(output.new_terms, vec!["bar"]);
        assert!(output.error.unwrap().contains("constraint violated"));
        assert_eq!(store.upsert_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_malformed_needed_terms_treated_as_empty() {
        let provider = Arc::new(ScriptedProvider::new(&["ok"]).needed("not json at all"));
        let store = Arc::new(RecordingStore::with(&[("foo", "a foo", 0)]));
        let output = graph(provider.clone(), store.clone())
            .run_blocking(request())
            .await
            .unwrap();

        assert_eq!(output.answer, "ok");
        assert!(output.resolved_terms.is_empty());
        assert_eq!(store.fetch_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_adapter_failures_before_answer_are_recovered() {
        let provider = Arc::new(
            ScriptedProvider::new(&["ok"])
                .needed_failure()
                .assess_failure(),
        );
        let store = Arc::new(RecordingStore::with(&[("foo", "a foo", 0)]));
        let output = graph(provider.clone(), store)
            .run_blocking(request())
            .await
            .unwrap();

        assert_eq!(output.answer, "ok");
        assert_eq!(output.simplicity_tier, 0);
        assert_eq!(provider.calls_of(ASSESSMENT_SCHEMA), 1);
    }

    #[tokio::test]
    async fn test_final_answer_failure_is_fatal() {
        let provider = Arc::new(ScriptedProvider {
            fail_answer: true,
            ..ScriptedProvider::new(&["x"]).needed(r#"{"terms": ["bar"]}"#)
        });
        let store = Arc::new(RecordingStore::with(&[("foo", "a foo", 0)]));
        let result = graph(provider, store.clone()).run_blocking(request()).await;

        assert!(matches!(result, Err(Error::AdapterCall(_))));
        assert_eq!(store.upsert_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_store_read_failure_is_fatal() {
        let provider = Arc::new(ScriptedProvider::new(&["x"]));
        let store = Arc::new(RecordingStore {
            fail_reads: true,
            ..Default::default()
        });
        let result = graph(provider.clone(), store).run_blocking(request()).await;

        assert!(matches!(result, Err(Error::KnowledgeStore(_))));
        assert!(provider.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_hosted_without_key_is_configuration_error() {
        let provider = Arc::new(ScriptedProvider::new(&["x"]));
        let store = Arc::new(RecordingStore::default());
        let g = graph(provider.clone(), store.clone());

        let blocking = g
            .run_blocking(request().with_model("openai:gpt-4o-mini"))
            .await;
        assert!(matches!(blocking, Err(Error::Configuration(_))));

        let streaming = g.run_streaming(request().with_provider("openai"));
        assert!(matches!(streaming, Err(Error::Configuration(_))));

        assert!(provider.calls.lock().is_empty());
        assert_eq!(store.list_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_messages_rejected() {
        let provider = Arc::new(ScriptedProvider::new(&["x"]));
        let g = graph(provider, Arc::new(RecordingStore::default()));
        assert!(matches!(
            g.run_blocking(RunRequest::new(vec![])).await,
            Err(Error::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_streaming_matches_blocking() {
        let make = || {
            Arc::new(
                ScriptedProvider::new(&["The ", "answer ", "is ", "42."])
                    .needed(r#"{"terms": ["foo", "bar"]}"#),
            )
        };

        let blocking = graph(
            make(),
            Arc::new(RecordingStore::with(&[("foo", "a foo", 0)])),
        )
        .run_blocking(request())
        .await
        .unwrap();

        let provider = make();
        let stream = graph(
            provider.clone(),
            Arc::new(RecordingStore::with(&[("foo", "a foo", 0)])),
        )
        .run_streaming(request())
        .unwrap();
        let (text, terminal) = collect(stream).await;

        assert_eq!(text, blocking.answer);
        assert_eq!(provider.calls_of("stream"), 1);
        assert_eq!(provider.calls_of("complete"), 0);
        match terminal {
            Some(StreamEvent::Done { output }) => {
                assert_eq!(output.answer, blocking.answer);
                assert_eq!(output.new_terms, blocking.new_terms);
            }
            other => panic!("unexpected terminal event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stream_failure_ends_with_error_event() {
        let provider = Arc::new(ScriptedProvider {
            fail_answer: true,
            ..ScriptedProvider::new(&["partial ", "text"])
        });
        let store = Arc::new(RecordingStore::default());
        let stream = graph(provider, store.clone())
            .run_streaming(request())
            .unwrap();
        let (text, terminal) = collect(stream).await;

        assert_eq!(text, "partial text");
        match terminal {
            Some(StreamEvent::Error { message }) => assert!(message.contains("connection reset")),
            other => panic!("unexpected terminal event: {other:?}"),
        }
        assert_eq!(store.upsert_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_store_failure_surfaces_in_stream() {
        let provider = Arc::new(ScriptedProvider::new(&["x"]));
        let store = Arc::new(RecordingStore {
            fail_reads: true,
            ..Default::default()
        });
        let stream = graph(provider, store).run_streaming(request()).unwrap();
        let (text, terminal) = collect(stream).await;

        assert!(text.is_empty());
        match terminal {
            Some(StreamEvent::Error { message }) => assert!(message.contains("disk on fire")),
            other => panic!("unexpected terminal event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancelled_stream_persists_nothing() {
        let provider = Arc::new(ScriptedProvider {
            endless_stream: true,
            ..ScriptedProvider::new(&["one ", "two "]).needed(r#"{"terms": ["bar"]}"#)
        });
        let store = Arc::new(RecordingStore::with(&[("foo", "a foo", 0)]));
        let mut stream = graph(provider, store.clone())
            .run_streaming(request())
            .unwrap();

        for _ in 0..3 {
            match stream.next().await {
                Some(StreamEvent::Delta { .. }) => {}
                other => panic!("expected a delta, got {other:?}"),
            }
        }
        drop(stream);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.upsert_calls.load(Ordering::SeqCst), 0);
        assert!(store.inner.get("bar").is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_drop_after_last_delta_persists_nothing() {
        for _ in 0..50 {
            let provider = Arc::new(
                ScriptedProvider::new(&["a ", "b"]).needed(r#"{"terms": ["bar"]}"#),
            );
            let store = Arc::new(RecordingStore::with(&[("foo", "a foo", 0)]));
            let mut stream = graph(provider, store.clone())
                .run_streaming(request())
                .unwrap();

            for _ in 0..2 {
                match stream.next().await {
                    Some(StreamEvent::Delta { .. }) => {}
                    other => panic!("expected a delta, got {other:?}"),
                }
            }
            drop(stream);

            tokio::time::sleep(Duration::from_millis(20)).await;
            assert_eq!(store.upsert_calls.load(Ordering::SeqCst), 0);
            assert!(store.inner.get("bar").is_none());
        }
    }

    #[tokio::test]
    async fn test_dropping_unpolled_stream_cancels_run() {
        let provider = Arc::new(ScriptedProvider::new(&["x"]).needed(r#"{"terms": ["bar"]}"#));
        let store = Arc::new(RecordingStore::with(&[("foo", "a foo", 0)]));
        let stream = graph(provider.clone(), store.clone())
            .run_streaming(request())
            .unwrap();
        drop(stream);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(provider.calls.lock().is_empty());
        assert_eq!(store.upsert_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_needed_terms_are_capped() {
        let terms: Vec<String> = (0..40).map(|i| format!("term{i}")).collect();
        let reply = serde_json::json!({ "terms": terms }).to_string();
        let provider = Arc::new(ScriptedProvider::new(&["ok"]).needed(&reply));
        let store = Arc::new(RecordingStore::with(&[("foo", "a foo", 0)]));
        let output = graph(provider, store)
            .run_blocking(request())
            .await
            .unwrap();
        assert_eq!(output.new_terms.len(), DEFAULT_MAX_NEEDED_TERMS);
    }

    #[test]
    fn test_config_validation_and_bound() {
        let config = GraphConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_iterations(), 3);

        let bad = GraphConfig {
            escalation_step: 0,
            ..Default::default()
        };
        assert!(matches!(bad.validate(), Err(Error::Configuration(_))));

        let uneven = GraphConfig {
            escalation_step: 300,
            ..Default::default()
        };
        assert_eq!(uneven.max_iterations(), 5);

        let inverted = GraphConfig {
            base_simplicity_tier: 2000,
            ..Default::default()
        };
        assert!(inverted.validate().is_err());
        assert_eq!(inverted.max_iterations(), 1);
    }
}
