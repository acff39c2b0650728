//! Chat orchestrator: drives one turn through the state machine and persists
//! the session at the end.
//!
//! Turns on the same session are serialized by a per-session lock; turns on
//! different sessions run concurrently. Collaborator failures degrade the
//! turn and are recorded on it. Only caller errors and Session Store
//! failures are returned as [`ChatError`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use tracing::{error, info, warn};

use prodlens_core::config::{ConversationConfig, ProdLensConfig};
use prodlens_core::error::ProdLensError;
use prodlens_core::prompts::PromptLibrary;
use prodlens_core::services::{
    DecisionGenerator, EmbeddingService, PassageSearch, QueryTranslator, StatementExecutor,
    TextGenerator,
};
use prodlens_core::types::{
    ContentFilter, ConversationState, HistoryEntry, Route, SessionId, TabularResult,
};
use prodlens_storage::{SessionStore, SessionSummary};

use crate::classifier::ContentClassifier;
use crate::error::{ChatError, TurnError};
use crate::executor::{RetrievalScope, SemanticRetrievalExecutor, StructuredQueryExecutor};
use crate::graph::{self, Node};
use crate::resolver::{EntityResolver, ResolverContext};
use crate::rewriter::QueryRewriter;
use crate::router::{IntentRouter, RoutingPolicy};
use crate::small_talk::SmallTalkResponder;
use crate::synthesizer::{AnswerSynthesizer, ExecutionOutcome};
use crate::turn::{QueryResponse, TurnRequest};

/// Injected collaborator handles.
pub struct Collaborators {
    /// Free-text generation for query rewriting.
    pub rewriter: Arc<dyn TextGenerator>,
    /// Free-text generation for small talk and answer synthesis.
    pub responder: Arc<dyn TextGenerator>,
    pub decisions: Arc<dyn DecisionGenerator>,
    pub translator: Arc<dyn QueryTranslator>,
    pub statements: Arc<dyn StatementExecutor>,
    pub embeddings: Arc<dyn EmbeddingService>,
    pub search: Arc<dyn PassageSearch>,
    pub sessions: Arc<dyn SessionStore>,
    pub prompts: Arc<PromptLibrary>,
    /// Handed to the translator with every question.
    pub schema_description: String,
}

type SessionLocks = Mutex<HashMap<SessionId, Arc<tokio::sync::Mutex<()>>>>;

/// Exclusive hold on one session. On drop the session is unlocked and its
/// map entry removed unless another call holds or awaits it.
struct SessionGuard<'a> {
    locks: &'a SessionLocks,
    session_id: SessionId,
    guard: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        self.guard.take();
        if locks
            .get(&self.session_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.session_id);
        }
    }
}

/// Values carried between nodes that are not part of the turn record.
#[derive(Default)]
struct Scratch {
    outcome: Option<ExecutionOutcome>,
    lookup_result: Option<TabularResult>,
}

pub struct ChatOrchestrator {
    rewriter: QueryRewriter,
    router: IntentRouter,
    classifier: ContentClassifier,
    resolver: EntityResolver,
    structured: Arc<StructuredQueryExecutor>,
    retrieval: SemanticRetrievalExecutor,
    small_talk: SmallTalkResponder,
    synthesizer: AnswerSynthesizer,
    sessions: Arc<dyn SessionStore>,
    locks: SessionLocks,
    conversation: ConversationConfig,
}

impl ChatOrchestrator {
    pub fn new(config: &ProdLensConfig, collaborators: Collaborators) -> Self {
        let timeout = config.conversation.node_timeout_secs;
        let prompts = collaborators.prompts;
        let structured = Arc::new(StructuredQueryExecutor::new(
            collaborators.translator,
            collaborators.statements,
            collaborators.schema_description,
            timeout,
        ));

        Self {
            rewriter: QueryRewriter::new(collaborators.rewriter, prompts.clone(), timeout),
            router: IntentRouter::new(
                collaborators.decisions.clone(),
                prompts.clone(),
                RoutingPolicy::from(&config.routing),
                timeout,
            ),
            classifier: ContentClassifier::new(
                collaborators.decisions.clone(),
                prompts.clone(),
                timeout,
            ),
            resolver: EntityResolver::new(
                collaborators.decisions,
                structured.clone(),
                prompts.clone(),
                config.resolver.min_context_confidence,
                timeout,
            ),
            structured,
            retrieval: SemanticRetrievalExecutor::new(
                collaborators.embeddings,
                collaborators.search,
                config.retrieval.clone(),
                timeout,
            ),
            small_talk: SmallTalkResponder::new(
                collaborators.responder.clone(),
                prompts.clone(),
                timeout,
            ),
            synthesizer: AnswerSynthesizer::new(collaborators.responder, prompts, timeout),
            sessions: collaborators.sessions,
            locks: Mutex::new(HashMap::new()),
            conversation: config.conversation.clone(),
        }
    }

    /// Answer one message.
    ///
    /// Without a session id a new session is allocated; an unknown id starts
    /// a new conversation under that id.
    pub async fn query(
        &self,
        message: &str,
        session_id: Option<&str>,
    ) -> Result<QueryResponse, ChatError> {
        if message.trim().is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        if message.chars().count() > self.conversation.max_message_chars {
            return Err(ChatError::MessageTooLong(self.conversation.max_message_chars));
        }
        let session_id = match session_id {
            Some(raw) => parse_session_id(raw)?,
            None => SessionId::new(),
        };

        let _session = self.lock_session(&session_id).await;
        let started = Instant::now();

        let mut state = self
            .sessions
            .load(&session_id)
            .await
            .map_err(|e| store_failure(&session_id, e))?
            .unwrap_or_else(|| ConversationState::new(session_id.clone()));

        let (turn, scratch) = self.run_turn(message, &state).await;

        if let Some(rows) = turn.structured_result.as_ref().filter(|r| !r.is_empty()) {
            state.last_structured_result = Some(rows.clone());
        }
        if let Some(rows) = scratch.lookup_result.filter(|r| !r.is_empty()) {
            state.last_structured_result = Some(rows);
        }
        if let Some(id) = turn.resolved_entity_id {
            state.last_entity_id = Some(id);
        }
        state.append_exchange(
            HistoryEntry::user(message),
            HistoryEntry::assistant(turn.final_answer.as_str()),
            self.conversation.max_history_messages,
        );
        self.sessions
            .save(&state)
            .await
            .map_err(|e| store_failure(&session_id, e))?;

        let route = turn.route.unwrap_or(self.router.policy().fallback);
        info!(
            session_id = %session_id,
            route = %route,
            errors = turn.errors.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Turn complete"
        );
        Ok(QueryResponse::from_turn(session_id, route, turn))
    }

    /// Start a conversation with empty state.
    ///
    /// With an id, that session's state is reset; without one, a fresh id is
    /// allocated.
    pub async fn new_conversation(&self, session_id: Option<&str>) -> Result<SessionId, ChatError> {
        let session_id = match session_id {
            Some(raw) => parse_session_id(raw)?,
            None => SessionId::new(),
        };
        let _session = self.lock_session(&session_id).await;
        self.sessions
            .save(&ConversationState::new(session_id.clone()))
            .await
            .map_err(|e| store_failure(&session_id, e))?;
        info!(session_id = %session_id, "New conversation");
        Ok(session_id)
    }

    /// Delete a session and its history. Returns whether it existed.
    pub async fn delete_conversation(&self, session_id: &str) -> Result<bool, ChatError> {
        let session_id = parse_session_id(session_id)?;
        let _session = self.lock_session(&session_id).await;
        let removed = self
            .sessions
            .remove(&session_id)
            .await
            .map_err(|e| store_failure(&session_id, e))?;
        if removed {
            info!(session_id = %session_id, "Conversation deleted");
        }
        Ok(removed)
    }

    /// Stored sessions, most recently updated first.
    pub async fn list_conversations(&self) -> Result<Vec<SessionSummary>, ChatError> {
        self.sessions.list().await.map_err(|e| {
            error!(error = %e, "Listing sessions failed");
            ChatError::SessionStore(e.to_string())
        })
    }

    /// Full stored history, oldest first. Unknown sessions have none.
    pub async fn history(&self, session_id: &str) -> Result<Vec<HistoryEntry>, ChatError> {
        Ok(self
            .conversation_state(session_id)
            .await?
            .map(|state| state.history)
            .unwrap_or_default())
    }

    pub async fn conversation_state(
        &self,
        session_id: &str,
    ) -> Result<Option<ConversationState>, ChatError> {
        let session_id = parse_session_id(session_id)?;
        self.sessions
            .load(&session_id)
            .await
            .map_err(|e| store_failure(&session_id, e))
    }

    /// Remove sessions idle for longer than the configured TTL.
    pub async fn evict_idle(&self, now: DateTime<Utc>) -> Result<usize, ChatError> {
        let ttl = self.conversation.session_ttl_minutes;
        if ttl == 0 {
            return Ok(0);
        }
        let cutoff = now - Duration::minutes(ttl as i64);
        let evicted = self.sessions.evict_idle(cutoff).await.map_err(|e| {
            error!(error = %e, "Session eviction failed");
            ChatError::SessionStore(e.to_string())
        })?;

        if evicted > 0 {
            info!(evicted, "Evicted idle sessions");
        }
        Ok(evicted)
    }

    /// Mermaid diagram of the turn graph as configured.
    pub fn graph_mermaid(&self) -> String {
        graph::mermaid(self.router.policy().small_talk_enabled)
    }

    /// Wait for exclusive use of `session_id`.
    async fn lock_session(&self, session_id: &SessionId) -> SessionGuard<'_> {
        let lock = self
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(session_id.clone())
            .or_default()
            .clone();
        SessionGuard {
            locks: &self.locks,
            session_id: session_id.clone(),
            guard: Some(lock.lock_owned().await),
        }
    }

    async fn run_turn(&self, message: &str, state: &ConversationState) -> (TurnRequest, Scratch) {
        let mut turn = TurnRequest::new(message);
        let mut scratch = Scratch::default();
        let mut node = Node::Start;
        loop {
            debug_assert!(!turn.path.contains(&node), "node {} re-entered", node);
            turn.path.push(node);
            if node == Node::End {
                break;
            }
            node = self.step(node, &mut turn, state, &mut scratch).await;
        }
        (turn, scratch)
    }

    /// Execute `node` and return the next one.
    async fn step(
        &self,
        node: Node,
        turn: &mut TurnRequest,
        state: &ConversationState,
        scratch: &mut Scratch,
    ) -> Node {
        let history = state.recent(self.conversation.context_messages);
        match node {
            Node::Start => Node::Rewrite,
            Node::Rewrite => {
                let rewrite = self.rewriter.rewrite(&turn.raw_query, history).await;
                turn.standalone_query = rewrite.standalone_query;
                turn.record(rewrite.error);
                Node::Route
            }
            Node::Route => {
                let decision = self.router.route(&turn.standalone_query).await;
                turn.route = Some(decision.route);
                turn.reasoning = decision.reasoning;
                turn.record(decision.error);
                match decision.route {
                    Route::StructuredLookup => Node::StructuredLookup,
                    Route::SemanticRetrieval => Node::ClassifyContent,
                    Route::SmallTalk => Node::Respond,
                }
            }
            Node::StructuredLookup => {
                scratch.outcome = Some(match self.structured.run(&turn.standalone_query).await {
                    Ok(rows) => {
                        turn.structured_result = Some(rows.clone());
                        ExecutionOutcome::Structured(rows)
                    }
                    Err(e) => execution_failed(turn, e),
                });
                Node::Synthesize
            }
            Node::ClassifyContent => {
                let decision = self.classifier.classify(&turn.standalone_query).await;
                turn.content_filter = Some(decision.filter);
                turn.content_reasoning = Some(decision.reasoning);
                turn.record(decision.error);
                match decision.filter {
                    ContentFilter::UserOpinion => Node::ResolveEntity,
                    ContentFilter::ReferenceMaterial => Node::Retrieve,
                }
            }
            Node::ResolveEntity => {
                let ctx = ResolverContext {
                    last_structured_result: state.last_structured_result.as_ref(),
                    last_entity_id: state.last_entity_id,
                    history,
                };
                let resolution = self.resolver.resolve(&turn.standalone_query, ctx).await;
                turn.resolved_entity_id = resolution.entity_id;
                turn.entity_id_source = Some(resolution.source);
                turn.errors.extend(resolution.errors);
                scratch.lookup_result = resolution.lookup_result;
                match resolution.entity_id {
                    Some(_) => Node::Retrieve,
                    None => {
                        scratch.outcome = Some(ExecutionOutcome::UnresolvedEntity);
                        Node::Synthesize
                    }
                }
            }
            Node::Retrieve => {
                let scope = match (turn.content_filter, turn.resolved_entity_id) {
                    (Some(ContentFilter::UserOpinion), Some(entity_id)) => {
                        RetrievalScope::Opinions { entity_id }
                    }
                    (Some(ContentFilter::UserOpinion), None) => {
                        debug_assert!(false, "opinion retrieval without an entity id");
                        scratch.outcome = Some(ExecutionOutcome::UnresolvedEntity);
                        return Node::Synthesize;
                    }
                    (Some(ContentFilter::ReferenceMaterial) | None, _) => RetrievalScope::Reference,
                };
                scratch.outcome = Some(
                    match self.retrieval.retrieve(&turn.standalone_query, scope).await {
                        Ok(result) => {
                            turn.retrieval_result = Some(result.clone());
                            ExecutionOutcome::Retrieved(result)
                        }
                        Err(e) => execution_failed(turn, e),
                    },
                );
                Node::Synthesize
            }
            Node::Respond => {
                let reply = self.small_talk.respond(&turn.standalone_query, history).await;
                turn.record(reply.error);
                scratch.outcome = Some(ExecutionOutcome::SmallTalk(reply.text));
                Node::Synthesize
            }
            Node::Synthesize => {
                let outcome = scratch.outcome.take().unwrap_or(ExecutionOutcome::Failed {
                    hint: "an internal error occurred",
                });
                let synthesis = self
                    .synthesizer
                    .synthesize(&turn.standalone_query, &outcome)
                    .await;
                turn.final_answer = synthesis.answer;
                turn.record(synthesis.error);
                Node::End
            }
            Node::End => Node::End,
        }
    }
}

fn execution_failed(turn: &mut TurnRequest, err: ProdLensError) -> ExecutionOutcome {
    warn!(error = %err, "Execution failed");
    let hint = err.user_hint();
    turn.record(Some(TurnError::Execution(err.to_string())));
    ExecutionOutcome::Failed { hint }
}

fn parse_session_id(raw: &str) -> Result<SessionId, ChatError> {
    SessionId::parse(raw).ok_or_else(|| ChatError::InvalidSessionId(raw.to_string()))
}

fn store_failure(session_id: &SessionId, err: ProdLensError) -> ChatError {
    error!(session_id = %session_id, error = %err, "Session store failure");
    ChatError::SessionStore(err.to_string())
}
