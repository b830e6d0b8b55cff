//! Turn Orchestrator — runs one complete interaction cycle for a lead.
//!
//! Sequences Policy Gate → Context Assembler → provider call → Policy Gate
//! (post-gen) → transactional persistence → Memory Refresher trigger, as an
//! explicit state machine. `run_turn` is the sole entry point, invoked by
//! inbound-message handling and by the Due Dispatcher.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::assembler::{self, AssemblerInput};
use crate::config::EngineConfig;
use crate::crm::{LeadTag, PolicyDecision, ReasonCode};
use crate::error::{DatabaseError, Error, Result};
use crate::knowledge::KnowledgeStore;
use crate::llm::{ChatMessage, ChatRequest, LlmProvider};
use crate::memory::MemoryRefresher;
use crate::policy::{PolicyGate, TurnSnapshot};
use crate::store::Database;

/// Prompt appended for scheduler-originated turns, where there is no fresh
/// inbound text to respond to.
const FOLLOWUP_KICKOFF: &str = "Compose the next outbound follow-up message for this lead.";

/// Candidate documents fetched per turn; the assembler packs the top 3.
const KNOWLEDGE_CANDIDATE_LIMIT: usize = 20;

/// States of one turn. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Start,
    PreSendCheck,
    Blocked,
    ContextBuild,
    Generate,
    PostGenCheck,
    Persist,
    Progress,
    Done,
}

impl TurnState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: TurnState) -> bool {
        use TurnState::*;

        matches!(
            (self, target),
            (Start, PreSendCheck)
                | (PreSendCheck, Blocked)
                | (PreSendCheck, ContextBuild)
                | (ContextBuild, Generate)
                | (Generate, PostGenCheck)
                | (PostGenCheck, Blocked)
                | (PostGenCheck, Persist)
                | (Persist, Progress)
                | (Progress, Done)
        )
    }

    /// Terminal states: the turn is over.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Blocked | Self::Done)
    }
}

/// Result of one turn, reported to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// The message passed both gates and was persisted.
    Sent { content: String },
    /// A gate blocked the turn; `reason` names the first-triggered rule.
    Blocked { reason: ReasonCode },
    /// The provider call failed or timed out. Nothing was persisted; retry
    /// is deferred to the next scheduler pass.
    ProviderError { detail: String },
}

/// Per-lead mutual exclusion. Turns for different leads run concurrently;
/// turns for the same lead are serialized for the duration of one turn.
#[derive(Default)]
struct LeadLocks {
    locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl LeadLocks {
    async fn acquire(&self, lead_id: Uuid) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            Arc::clone(locks.entry(lead_id).or_default())
        };
        lock.lock_owned().await
    }
}

/// Orchestrates single-lead turns.
pub struct TurnOrchestrator {
    store: Arc<dyn Database>,
    provider: Arc<dyn LlmProvider>,
    knowledge: Arc<dyn KnowledgeStore>,
    gate: PolicyGate,
    refresher: Arc<MemoryRefresher>,
    config: EngineConfig,
    locks: LeadLocks,
}

impl TurnOrchestrator {
    pub fn new(
        store: Arc<dyn Database>,
        provider: Arc<dyn LlmProvider>,
        knowledge: Arc<dyn KnowledgeStore>,
        config: EngineConfig,
    ) -> Self {
        let gate = PolicyGate::new(config.policy.clone());
        let refresher = Arc::new(MemoryRefresher::new(
            Arc::clone(&store),
            Arc::clone(&provider),
            config.history_limit,
        ));
        Self {
            store,
            provider,
            knowledge,
            gate,
            refresher,
            config,
            locks: LeadLocks::default(),
        }
    }

    /// Run one complete turn for a lead.
    ///
    /// `user_message` is the most recent inbound text when the turn is a
    /// reply; `None` for scheduled follow-ups. The inbound message itself is
    /// recorded by the inbound handler via `Database::record_inbound`, not
    /// here.
    pub async fn run_turn(
        &self,
        lead_id: Uuid,
        workspace_id: Uuid,
        user_message: Option<&str>,
    ) -> Result<TurnOutcome> {
        let _guard = self.locks.acquire(lead_id).await;

        let mut state = TurnState::Start;
        advance(&mut state, TurnState::PreSendCheck);

        // Snapshot the lead, workspace, and thread tail. Missing records
        // are data-integrity errors, never an implicit ALLOW.
        let lead = self
            .store
            .get_lead(workspace_id, lead_id)
            .await?
            .ok_or_else(|| {
                Error::Database(DatabaseError::NotFound {
                    entity: "lead".into(),
                    id: lead_id.to_string(),
                })
            })?;
        let workspace = self
            .store
            .get_workspace(workspace_id)
            .await?
            .ok_or_else(|| {
                Error::Database(DatabaseError::NotFound {
                    entity: "workspace".into(),
                    id: workspace_id.to_string(),
                })
            })?;
        let recent_messages = self
            .store
            .list_recent_messages(lead_id, self.config.history_limit)
            .await?;

        let snapshot = TurnSnapshot {
            lead,
            workspace,
            recent_messages,
            now: Utc::now(),
        };

        let decision = self.gate.evaluate_pre_send(&snapshot);
        self.store
            .append_policy_decision(&PolicyDecision::pre_send(
                lead_id,
                workspace_id,
                decision.outcome,
                decision.reason,
            ))
            .await?;

        if decision.is_block() {
            advance(&mut state, TurnState::Blocked);
            info!(
                lead_id = %lead_id,
                reason = decision.reason.as_str(),
                "Turn blocked pre-send"
            );
            return Ok(TurnOutcome::Blocked {
                reason: decision.reason,
            });
        }

        advance(&mut state, TurnState::ContextBuild);

        let strategy = self.store.get_active_strategy(workspace_id).await?;
        let memory = self.store.get_lead_memory(lead_id).await?;
        let knowledge = if snapshot.workspace.budget_tier != crate::crm::BudgetTier::Red
            && user_message.is_some()
        {
            self.knowledge
                .lookup(
                    workspace_id,
                    &snapshot.workspace.agent_id,
                    KNOWLEDGE_CANDIDATE_LIMIT,
                )
                .await?
        } else {
            Vec::new()
        };

        let context = assembler::assemble(&AssemblerInput {
            workspace: &snapshot.workspace,
            strategy: strategy.as_ref(),
            memory: memory.as_ref(),
            knowledge: &knowledge,
            query: user_message,
        });

        advance(&mut state, TurnState::Generate);

        let mut messages: Vec<ChatMessage> = snapshot
            .recent_messages
            .iter()
            .map(|m| ChatMessage {
                role: m.role,
                content: m.content.clone(),
            })
            .collect();
        match user_message {
            Some(text) => messages.push(ChatMessage::user(text)),
            None => messages.push(ChatMessage::user(FOLLOWUP_KICKOFF)),
        }

        let request = ChatRequest::new(messages, context.settings)?
            .with_system(context.system_instruction)
            .with_tools(context.tools_enabled);

        let response =
            match tokio::time::timeout(self.config.provider_timeout, self.provider.chat(request))
                .await
            {
                Err(_) => {
                    error!(
                        lead_id = %lead_id,
                        timeout = ?self.config.provider_timeout,
                        "Provider call timed out"
                    );
                    return Ok(TurnOutcome::ProviderError {
                        detail: format!(
                            "provider timed out after {:?}",
                            self.config.provider_timeout
                        ),
                    });
                }
                Ok(Err(e)) => {
                    error!(lead_id = %lead_id, error = %e, "Provider call failed");
                    return Ok(TurnOutcome::ProviderError {
                        detail: e.to_string(),
                    });
                }
                Ok(Ok(response)) => response,
            };

        if response.content.trim().is_empty() {
            error!(lead_id = %lead_id, "Provider returned empty content");
            return Ok(TurnOutcome::ProviderError {
                detail: "provider returned empty content".into(),
            });
        }

        advance(&mut state, TurnState::PostGenCheck);

        let decision = self
            .gate
            .evaluate_post_gen(&response.content, response.confidence);
        let draft = if decision.is_block() {
            Some(response.content.clone())
        } else {
            None
        };
        self.store
            .append_policy_decision(&PolicyDecision::post_gen(
                lead_id,
                workspace_id,
                decision.outcome,
                decision.reason,
                draft,
            ))
            .await?;

        if decision.is_block() {
            advance(&mut state, TurnState::Blocked);
            self.store
                .add_lead_tag(workspace_id, lead_id, LeadTag::StrategyReviewRequired)
                .await?;
            warn!(
                lead_id = %lead_id,
                reason = decision.reason.as_str(),
                "Draft blocked post-generation, lead flagged for strategy review"
            );
            return Ok(TurnOutcome::Blocked {
                reason: decision.reason,
            });
        }

        advance(&mut state, TurnState::Persist);

        self.store
            .persist_outbound_turn(workspace_id, lead_id, &response.content, Utc::now())
            .await?;

        advance(&mut state, TurnState::Progress);
        self.refresher.spawn_refresh(lead_id);

        advance(&mut state, TurnState::Done);
        debug!(
            lead_id = %lead_id,
            tokens = response.usage.total(),
            "Turn completed"
        );
        Ok(TurnOutcome::Sent {
            content: response.content,
        })
    }
}

/// Move the turn forward one state. Transitions are fixed at compile time;
/// a violation is a programming error, not a runtime condition.
fn advance(state: &mut TurnState, next: TurnState) {
    debug_assert!(
        state.can_transition_to(next),
        "invalid turn transition {state:?} -> {next:?}"
    );
    *state = next;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PolicyConfig;
    use crate::crm::{DecisionOutcome, DecisionPoint, Lead, LeadStage, MessageRole, Workspace};
    use crate::error::ProviderError;
    use crate::knowledge::InMemoryKnowledgeStore;
    use crate::llm::{ChatResponse, ExtractionRequest, ProviderInfo, TokenUsage};
    use crate::store::LibSqlBackend;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    /// Provider double that replays scripted chat responses. Extraction
    /// calls (from the detached memory refresher) always succeed.
    struct ScriptedProvider {
        responses: StdMutex<VecDeque<std::result::Result<ChatResponse, ProviderError>>>,
        requests: StdMutex<Vec<ChatRequest>>,
    }

    impl ScriptedProvider {
        fn new(
            responses: Vec<std::result::Result<ChatResponse, ProviderError>>,
        ) -> Arc<Self> {
            Arc::new(Self {
                responses: StdMutex::new(responses.into()),
                requests: StdMutex::new(Vec::new()),
            })
        }

        fn reply(content: &str, confidence: f32) -> ChatResponse {
            ChatResponse {
                content: content.to_string(),
                confidence: Some(confidence),
                usage: TokenUsage {
                    input_tokens: 100,
                    output_tokens: 30,
                },
                provider_info: ProviderInfo {
                    provider: "scripted".into(),
                    model: "test-model".into(),
                },
            }
        }

        fn chat_calls(&self) -> usize {
            self.requests.lock().unwrap().len()
        }

        fn last_request(&self) -> Option<ChatRequest> {
            self.requests.lock().unwrap().last().cloned()
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        fn model_name(&self) -> &str {
            "test-model"
        }

        async fn chat(&self, request: ChatRequest) -> std::result::Result<ChatResponse, ProviderError> {
            self.requests.lock().unwrap().push(request);
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| {
                    Err(ProviderError::RequestFailed {
                        provider: "scripted".into(),
                        reason: "script exhausted".into(),
                    })
                })
        }

        async fn extract(
            &self,
            _request: ExtractionRequest,
        ) -> std::result::Result<serde_json::Value, ProviderError> {
            Ok(serde_json::json!({
                "summary": "Two sentences. About the lead.",
                "facts": ["scripted fact"]
            }))
        }
    }

    /// Quiet hours disabled (equal bounds) so the suite does not depend on
    /// the wall clock.
    fn test_config() -> EngineConfig {
        EngineConfig {
            policy: PolicyConfig {
                quiet_start_hour: 9,
                quiet_end_hour: 9,
                ..PolicyConfig::default()
            },
            ..EngineConfig::default()
        }
    }

    async fn fixture(
        provider: Arc<ScriptedProvider>,
    ) -> (TurnOrchestrator, Arc<LibSqlBackend>, Workspace, Lead) {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let workspace = Workspace::new("Acme", "agent-1");
        store.upsert_workspace(&workspace).await.unwrap();
        let lead = Lead::new(workspace.id, "Ada", "UTC");
        store.insert_lead(&lead).await.unwrap();

        let orchestrator = TurnOrchestrator::new(
            store.clone() as Arc<dyn Database>,
            provider,
            Arc::new(InMemoryKnowledgeStore::new()),
            test_config(),
        );
        (orchestrator, store, workspace, lead)
    }

    #[test]
    fn turn_state_transitions_valid() {
        assert!(TurnState::Start.can_transition_to(TurnState::PreSendCheck));
        assert!(TurnState::PreSendCheck.can_transition_to(TurnState::Blocked));
        assert!(TurnState::PreSendCheck.can_transition_to(TurnState::ContextBuild));
        assert!(TurnState::ContextBuild.can_transition_to(TurnState::Generate));
        assert!(TurnState::Generate.can_transition_to(TurnState::PostGenCheck));
        assert!(TurnState::PostGenCheck.can_transition_to(TurnState::Persist));
        assert!(TurnState::PostGenCheck.can_transition_to(TurnState::Blocked));
        assert!(TurnState::Persist.can_transition_to(TurnState::Progress));
        assert!(TurnState::Progress.can_transition_to(TurnState::Done));
    }

    #[test]
    fn turn_state_transitions_invalid() {
        assert!(!TurnState::Blocked.can_transition_to(TurnState::ContextBuild));
        assert!(!TurnState::Done.can_transition_to(TurnState::Start));
        assert!(!TurnState::Generate.can_transition_to(TurnState::Persist));
        assert!(!TurnState::PreSendCheck.can_transition_to(TurnState::Generate));
        assert!(TurnState::Blocked.is_terminal());
        assert!(TurnState::Done.is_terminal());
        assert!(!TurnState::Generate.is_terminal());
    }

    #[tokio::test]
    async fn happy_path_sends_and_advances_stage() {
        let provider = ScriptedProvider::new(vec![Ok(ScriptedProvider::reply(
            "Hi Ada, do you have 15 minutes this week?",
            0.92,
        ))]);
        let (orchestrator, store, workspace, lead) = fixture(provider.clone()).await;

        let outcome = orchestrator
            .run_turn(lead.id, workspace.id, Some("Hi"))
            .await
            .unwrap();

        match outcome {
            TurnOutcome::Sent { content } => assert!(content.contains("15 minutes")),
            other => panic!("expected Sent, got {other:?}"),
        }

        let loaded = store.get_lead(workspace.id, lead.id).await.unwrap().unwrap();
        assert_eq!(loaded.stage, LeadStage::Contacted);
        assert!(loaded.last_followup_at.is_some());

        let decisions = store.list_policy_decisions(lead.id).await.unwrap();
        assert_eq!(decisions.len(), 2);
        assert_eq!(decisions[0].point, DecisionPoint::PreSend);
        assert_eq!(decisions[0].reason, ReasonCode::AllChecksPassed);
        assert_eq!(decisions[1].point, DecisionPoint::PostGen);
        assert_eq!(decisions[1].outcome, DecisionOutcome::Pass);
    }

    #[tokio::test]
    async fn second_turn_in_cap_window_blocks_without_provider_call() {
        let provider = ScriptedProvider::new(vec![
            Ok(ScriptedProvider::reply("First message.", 0.9)),
            Ok(ScriptedProvider::reply("Should never be used.", 0.9)),
        ]);
        let (orchestrator, _store, workspace, lead) = fixture(provider.clone()).await;

        let first = orchestrator
            .run_turn(lead.id, workspace.id, Some("Hi"))
            .await
            .unwrap();
        assert!(matches!(first, TurnOutcome::Sent { .. }));

        let second = orchestrator
            .run_turn(lead.id, workspace.id, Some("still interested"))
            .await
            .unwrap();
        assert_eq!(
            second,
            TurnOutcome::Blocked {
                reason: ReasonCode::OutboundCap24h
            }
        );
        // The second turn must not reach the provider.
        assert_eq!(provider.chat_calls(), 1);
    }

    #[tokio::test]
    async fn low_confidence_blocks_tags_and_persists_nothing() {
        let provider = ScriptedProvider::new(vec![Ok(ScriptedProvider::reply(
            "Uncertain draft.",
            0.3,
        ))]);
        let (orchestrator, store, workspace, lead) = fixture(provider).await;

        let outcome = orchestrator
            .run_turn(lead.id, workspace.id, Some("Hi"))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            TurnOutcome::Blocked {
                reason: ReasonCode::LowConfidenceBlock
            }
        );

        let loaded = store.get_lead(workspace.id, lead.id).await.unwrap().unwrap();
        assert!(loaded.has_tag(LeadTag::StrategyReviewRequired));
        assert_eq!(loaded.stage, LeadStage::New);
        assert!(loaded.last_followup_at.is_none());

        let messages = store.list_recent_messages(lead.id, 10).await.unwrap();
        assert!(messages.is_empty());

        // Pre-send PASS stays on the record; the block is a second,
        // independent decision carrying the draft.
        let decisions = store.list_policy_decisions(lead.id).await.unwrap();
        assert_eq!(decisions.len(), 2);
        assert_eq!(decisions[0].outcome, DecisionOutcome::Pass);
        assert_eq!(decisions[1].outcome, DecisionOutcome::Block);
        assert_eq!(decisions[1].draft.as_deref(), Some("Uncertain draft."));
    }

    #[tokio::test]
    async fn risky_content_blocks() {
        let provider = ScriptedProvider::new(vec![Ok(ScriptedProvider::reply(
            "This is definitely not spam.",
            0.95,
        ))]);
        let (orchestrator, store, workspace, lead) = fixture(provider).await;

        let outcome = orchestrator
            .run_turn(lead.id, workspace.id, Some("Hi"))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            TurnOutcome::Blocked {
                reason: ReasonCode::RiskyContentBlock
            }
        );
        let loaded = store.get_lead(workspace.id, lead.id).await.unwrap().unwrap();
        assert!(loaded.has_tag(LeadTag::StrategyReviewRequired));
    }

    #[tokio::test]
    async fn provider_failure_surfaces_without_persistence() {
        let provider = ScriptedProvider::new(vec![Err(ProviderError::RequestFailed {
            provider: "scripted".into(),
            reason: "connection reset".into(),
        })]);
        let (orchestrator, store, workspace, lead) = fixture(provider).await;

        let outcome = orchestrator
            .run_turn(lead.id, workspace.id, Some("Hi"))
            .await
            .unwrap();
        match outcome {
            TurnOutcome::ProviderError { detail } => {
                assert!(detail.contains("connection reset"));
            }
            other => panic!("expected ProviderError, got {other:?}"),
        }

        let loaded = store.get_lead(workspace.id, lead.id).await.unwrap().unwrap();
        assert_eq!(loaded.stage, LeadStage::New);
        assert!(store.list_recent_messages(lead.id, 10).await.unwrap().is_empty());
        // Only the pre-send PASS decision exists; there was nothing to
        // evaluate post-gen.
        let decisions = store.list_policy_decisions(lead.id).await.unwrap();
        assert_eq!(decisions.len(), 1);
    }

    #[tokio::test]
    async fn missing_lead_is_a_data_integrity_error() {
        let provider = ScriptedProvider::new(vec![]);
        let (orchestrator, _store, workspace, _lead) = fixture(provider).await;

        let err = orchestrator
            .run_turn(Uuid::new_v4(), workspace.id, None)
            .await
            .unwrap_err();
        assert!(err.is_data_integrity());
    }

    #[tokio::test]
    async fn scheduled_turn_uses_kickoff_prompt() {
        let provider = ScriptedProvider::new(vec![Ok(ScriptedProvider::reply(
            "Just checking in!",
            0.9,
        ))]);
        let (orchestrator, _store, workspace, lead) = fixture(provider.clone()).await;

        let outcome = orchestrator
            .run_turn(lead.id, workspace.id, None)
            .await
            .unwrap();
        assert!(matches!(outcome, TurnOutcome::Sent { .. }));

        let request = provider.last_request().unwrap();
        let last = request.messages.last().unwrap();
        assert_eq!(last.role, MessageRole::User);
        assert!(last.content.contains("follow-up"));
    }

    #[tokio::test]
    async fn red_tier_caps_tokens_and_drops_context() {
        let provider = ScriptedProvider::new(vec![Ok(ScriptedProvider::reply("Short.", 0.9))]);
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let mut workspace = Workspace::new("Acme", "agent-1");
        workspace.budget_tier = crate::crm::BudgetTier::Red;
        store.upsert_workspace(&workspace).await.unwrap();
        let lead = Lead::new(workspace.id, "Ada", "UTC");
        store.insert_lead(&lead).await.unwrap();

        let orchestrator = TurnOrchestrator::new(
            store.clone() as Arc<dyn Database>,
            provider.clone(),
            Arc::new(InMemoryKnowledgeStore::new()),
            test_config(),
        );

        orchestrator
            .run_turn(lead.id, workspace.id, Some("pricing?"))
            .await
            .unwrap();

        let request = provider.last_request().unwrap();
        assert_eq!(request.settings.max_tokens, 512);
        assert!(!request.tools_enabled);
        let system = request.system_instruction.unwrap();
        assert!(!system.contains("Relevant knowledge"));
        assert!(!system.contains("Lead memory"));
    }
}
