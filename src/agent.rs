//! LLM tool-calling orchestrator.
//!
//! Drives the model ↔ retrieval round-trip for one chat turn: the model
//! either answers directly or requests the `search_knowledge_base` tool;
//! tool results are fed back as observations and the loop continues. At
//! most [`MAX_TOOL_CALLS`] tool invocations are allowed per turn — past
//! that, the model is asked for a best-effort answer from the observations
//! it has collected. A failed tool call becomes an observation the model
//! can react to rather than aborting the turn.
//!
//! All model and tool invocations within one `chat` call are strictly
//! sequential. Cancellation is cooperative: dropping the future stops the
//! loop at the next suspension point and discards the partial answer.
//!
//! Every step emits a flow event correlated by the per-turn session UUID.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::flowlog::{FlowEvent, FlowEventKind, FlowLogger, FlowStatus};
use crate::llm::{
    system_message, tool_message, user_message, ChatMessage, ChatRequest, LlmProvider,
    ToolDefinition,
};
use crate::models::SearchHit;

/// Tool invocation bound per turn.
pub const SEARCH_TOOL_NAME: &str = "search_knowledge_base";

/// Upper bound on tool calls per chat turn.
const MAX_TOOL_CALLS: usize = 5;

/// History messages passed to the model.
const MAX_HISTORY: usize = 20;

const SYSTEM_PROMPT: &str = "\
You are a knowledgeable assistant answering questions over a private \
document collection.

Rules:
- When the user's question may be answered by the documents, call the \
search_knowledge_base tool. Reformulate vague questions into precise, \
self-contained search queries before calling it.
- Ground every claim in the returned snippets and mention the source file \
of the snippets you used.
- If retrieval returns nothing relevant, say plainly that the documents do \
not cover the question; do not invent content.
- Answer in the language of the user's question.";

/// Retrieval bound to the agent by tool name; the engine never learns about
/// the agent, keeping the dependency one-way.
#[async_trait]
pub trait KnowledgeSearch: Send + Sync {
    async fn search(&self, kb_id: &str, query: &str) -> Result<Vec<SearchHit>>;
}

pub struct Agent {
    llm: Arc<dyn LlmProvider>,
    search: Arc<dyn KnowledgeSearch>,
    flow: Arc<FlowLogger>,
    max_query_length: usize,
}

impl Agent {
    pub fn new(
        llm: Arc<dyn LlmProvider>,
        search: Arc<dyn KnowledgeSearch>,
        flow: Arc<FlowLogger>,
        max_query_length: usize,
    ) -> Self {
        Self {
            llm,
            search,
            flow,
            max_query_length,
        }
    }

    /// Answer one user query, optionally grounded in a knowledge base.
    pub async fn chat(
        &self,
        query: &str,
        history: &[ChatMessage],
        kb_id: Option<&str>,
    ) -> Result<String> {
        if query.trim().is_empty() {
            return Err(Error::Validation("query must not be empty".to_string()));
        }
        if query.chars().count() > self.max_query_length {
            return Err(Error::Validation(format!(
                "query length {} exceeds limit {}",
                query.chars().count(),
                self.max_query_length
            )));
        }

        let session_id = Uuid::new_v4().to_string();
        let started = Instant::now();
        let elapsed = |started: &Instant| started.elapsed().as_millis() as u64;

        self.flow.emit(
            FlowEvent::new(&session_id, FlowEventKind::QueryStart, FlowStatus::InProgress)
                .meta("query", query)
                .meta("kb_id", kb_id.unwrap_or("")),
        );

        let result = self
            .run_turn(query, history, kb_id, &session_id, &started)
            .await;

        match &result {
            Ok(_) => self.flow.emit(
                FlowEvent::new(&session_id, FlowEventKind::QueryComplete, FlowStatus::Success)
                    .elapsed(elapsed(&started))
                    .duration(elapsed(&started)),
            ),
            Err(e) => {
                self.flow.emit(
                    FlowEvent::new(&session_id, FlowEventKind::Error, FlowStatus::Error)
                        .elapsed(elapsed(&started))
                        .meta("error", e.to_string()),
                );
                self.flow.emit(
                    FlowEvent::new(&session_id, FlowEventKind::QueryComplete, FlowStatus::Error)
                        .elapsed(elapsed(&started))
                        .duration(elapsed(&started)),
                );
            }
        }

        result
    }

    async fn run_turn(
        &self,
        query: &str,
        history: &[ChatMessage],
        kb_id: Option<&str>,
        session_id: &str,
        started: &Instant,
    ) -> Result<String> {
        let elapsed = |started: &Instant| started.elapsed().as_millis() as u64;

        let mut messages = Vec::with_capacity(history.len().min(MAX_HISTORY) + 2);
        messages.push(system_message(SYSTEM_PROMPT));
        let tail_start = history.len().saturating_sub(MAX_HISTORY);
        messages.extend_from_slice(&history[tail_start..]);
        messages.push(user_message(query));

        let tools = if kb_id.is_some() {
            vec![search_tool_definition()]
        } else {
            Vec::new()
        };

        let mut tool_calls_used = 0usize;
        let mut first_response = true;

        loop {
            let request = ChatRequest {
                messages: messages.clone(),
                tools: tools.clone(),
            };

            let llm_started = Instant::now();
            let outcome = self.llm.chat(&request).await;
            let llm_ms = llm_started.elapsed().as_millis() as u64;

            let outcome = match outcome {
                Ok(outcome) => {
                    self.flow.emit(
                        FlowEvent::new(session_id, FlowEventKind::LlmCall, FlowStatus::Success)
                            .elapsed(elapsed(started))
                            .duration(llm_ms),
                    );
                    outcome
                }
                Err(e) => {
                    self.flow.emit(
                        FlowEvent::new(session_id, FlowEventKind::LlmCall, FlowStatus::Error)
                            .elapsed(elapsed(started))
                            .duration(llm_ms)
                            .meta("error", e.to_string()),
                    );
                    return Err(e);
                }
            };

            if first_response {
                first_response = false;
                self.flow.emit(
                    FlowEvent::new(
                        session_id,
                        FlowEventKind::QueryAnalysis,
                        FlowStatus::Success,
                    )
                    .elapsed(elapsed(started))
                    .meta("planned_tool_calls", outcome.tool_calls.len()),
                );
            }

            if outcome.tool_calls.is_empty() {
                return Ok(outcome.content);
            }

            messages.push(crate::llm::assistant_message(
                &outcome.content,
                outcome.tool_calls.clone(),
            ));

            for call in &outcome.tool_calls {
                if tool_calls_used >= MAX_TOOL_CALLS {
                    // Out of budget: drop the pending call and ask for a
                    // best-effort synthesis from what was observed.
                    tracing::warn!(session_id, "tool call budget exhausted");
                    return self
                        .best_effort_answer(messages, session_id, started)
                        .await;
                }
                tool_calls_used += 1;

                self.flow.emit(
                    FlowEvent::new(
                        session_id,
                        FlowEventKind::ToolSelection,
                        FlowStatus::InProgress,
                    )
                    .elapsed(elapsed(started))
                    .meta("tool", call.name.clone())
                    .meta("arguments", call.arguments.clone()),
                );

                let observation = self
                    .execute_tool(&call.name, &call.arguments, query, kb_id, session_id, started)
                    .await;
                messages.push(tool_message(&observation));
            }
        }
    }

    /// Run one tool call; failures come back as observation text.
    async fn execute_tool(
        &self,
        name: &str,
        arguments: &str,
        original_query: &str,
        kb_id: Option<&str>,
        session_id: &str,
        started: &Instant,
    ) -> String {
        let elapsed = started.elapsed().as_millis() as u64;

        if name != SEARCH_TOOL_NAME {
            self.flow.emit(
                FlowEvent::new(session_id, FlowEventKind::ToolExecution, FlowStatus::Error)
                    .elapsed(elapsed)
                    .meta("tool", name)
                    .meta("error", "unknown tool"),
            );
            return serde_json::json!({"error": format!("unknown tool '{name}'")}).to_string();
        }

        let Some(kb_id) = kb_id else {
            self.flow.emit(
                FlowEvent::new(session_id, FlowEventKind::ToolExecution, FlowStatus::Error)
                    .elapsed(elapsed)
                    .meta("tool", name)
                    .meta("error", "no knowledge base bound"),
            );
            return serde_json::json!({"error": "no knowledge base selected"}).to_string();
        };

        let search_query = serde_json::from_str::<serde_json::Value>(arguments)
            .ok()
            .and_then(|v| v.get("query").and_then(|q| q.as_str()).map(String::from))
            .unwrap_or_else(|| original_query.to_string());

        let tool_started = Instant::now();
        let result = self.search.search(kb_id, &search_query).await;
        let tool_ms = tool_started.elapsed().as_millis() as u64;

        match result {
            Ok(hits) => {
                self.flow.emit(
                    FlowEvent::new(session_id, FlowEventKind::ToolExecution, FlowStatus::Success)
                        .elapsed(started.elapsed().as_millis() as u64)
                        .duration(tool_ms)
                        .meta("tool", SEARCH_TOOL_NAME)
                        .meta("query", search_query.clone())
                        .meta("hits", hits.len()),
                );
                serde_json::json!({
                    "hits": hits.iter().map(|h| serde_json::json!({
                        "score": h.score,
                        "content": h.content,
                        "source": h.source,
                    })).collect::<Vec<_>>()
                })
                .to_string()
            }
            Err(e) => {
                self.flow.emit(
                    FlowEvent::new(session_id, FlowEventKind::ToolExecution, FlowStatus::Error)
                        .elapsed(started.elapsed().as_millis() as u64)
                        .duration(tool_ms)
                        .meta("tool", SEARCH_TOOL_NAME)
                        .meta("query", search_query)
                        .meta("error", e.to_string()),
                );
                serde_json::json!({
                    "error": format!("retrieval failed: {e}. Answer from what you already know \
                                      about the documents, or say the service is unavailable.")
                })
                .to_string()
            }
        }
    }

    /// Final synthesis when the tool budget ran out: same conversation, no
    /// tools offered.
    async fn best_effort_answer(
        &self,
        mut messages: Vec<ChatMessage>,
        session_id: &str,
        started: &Instant,
    ) -> Result<String> {
        messages.push(user_message(
            "Stop searching. Give the best answer you can from the observations above.",
        ));

        let llm_started = Instant::now();
        let outcome = self
            .llm
            .chat(&ChatRequest {
                messages,
                tools: Vec::new(),
            })
            .await;

        let status = if outcome.is_ok() {
            FlowStatus::Success
        } else {
            FlowStatus::Error
        };
        self.flow.emit(
            FlowEvent::new(session_id, FlowEventKind::LlmCall, status)
                .elapsed(started.elapsed().as_millis() as u64)
                .duration(llm_started.elapsed().as_millis() as u64)
                .meta("best_effort", true),
        );

        outcome.map(|o| o.content)
    }
}

fn search_tool_definition() -> ToolDefinition {
    ToolDefinition {
        name: SEARCH_TOOL_NAME.to_string(),
        description: "Search the selected knowledge base for text snippets relevant \
                      to a query. Returns scored snippets with their source files."
            .to_string(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Self-contained search query."
                }
            },
            "required": ["query"]
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flowlog::{analyzer::FlowAnalyzer, DetailLevel};
    use crate::llm::{ChatOutcome, ToolCall};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Provider that requests the search tool until a tool observation is
    /// present, then answers from it.
    struct ScriptedProvider {
        calls: AtomicUsize,
        request_sizes: Mutex<Vec<usize>>,
    }

    impl ScriptedProvider {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                request_sizes: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        fn model_name(&self) -> &str {
            "scripted"
        }

        async fn chat(&self, request: &ChatRequest) -> Result<ChatOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.request_sizes
                .lock()
                .unwrap()
                .push(request.messages.len());

            let observation = request
                .messages
                .iter()
                .find(|m| m.role == crate::llm::Role::Tool)
                .map(|m| m.content.clone());

            match observation {
                Some(obs) if obs.contains("error") => Ok(ChatOutcome {
                    content: "The knowledge service had trouble, but based on earlier \
                              context I cannot answer reliably."
                        .to_string(),
                    tool_calls: Vec::new(),
                }),
                Some(obs) => {
                    let grounded = if obs.contains("Zhang San") {
                        "Lee Xiaoyong partnered with Zhang San to invest in ABC Tech Co. \
                         (see corpus.txt)."
                    } else {
                        "The documents do not cover this."
                    };
                    Ok(ChatOutcome {
                        content: grounded.to_string(),
                        tool_calls: Vec::new(),
                    })
                }
                None => Ok(ChatOutcome {
                    content: String::new(),
                    tool_calls: vec![ToolCall {
                        id: "call_0".to_string(),
                        name: SEARCH_TOOL_NAME.to_string(),
                        arguments: "{\"query\":\"Lee Xiaoyong partner\"}".to_string(),
                    }],
                }),
            }
        }

        async fn check_available(&self) -> bool {
            true
        }
    }

    /// Provider that never stops asking for tools (until tools are removed).
    struct GreedyProvider;

    #[async_trait]
    impl LlmProvider for GreedyProvider {
        fn model_name(&self) -> &str {
            "greedy"
        }
        async fn chat(&self, request: &ChatRequest) -> Result<ChatOutcome> {
            if request.tools.is_empty() {
                return Ok(ChatOutcome {
                    content: "Best effort summary of everything observed so far.".to_string(),
                    tool_calls: Vec::new(),
                });
            }
            Ok(ChatOutcome {
                content: String::new(),
                tool_calls: vec![ToolCall {
                    id: "call_n".to_string(),
                    name: SEARCH_TOOL_NAME.to_string(),
                    arguments: "{\"query\":\"more\"}".to_string(),
                }],
            })
        }
        async fn check_available(&self) -> bool {
            true
        }
    }

    struct StaticSearch {
        hits: Vec<SearchHit>,
        fail: bool,
        calls: AtomicUsize,
    }

    impl StaticSearch {
        fn with_hits(hits: Vec<SearchHit>) -> Self {
            Self {
                hits,
                fail: false,
                calls: AtomicUsize::new(0),
            }
        }
        fn failing() -> Self {
            Self {
                hits: Vec::new(),
                fail: true,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl KnowledgeSearch for StaticSearch {
        async fn search(&self, _kb_id: &str, _query: &str) -> Result<Vec<SearchHit>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(Error::VectorStore("collection unreachable".to_string()))
            } else {
                Ok(self.hits.clone())
            }
        }
    }

    fn hit(content: &str) -> SearchHit {
        SearchHit {
            score: 0.87,
            content: content.to_string(),
            source: "corpus.txt".to_string(),
            chunk_index: 0,
            id: "p1".to_string(),
            metadata: serde_json::Map::new(),
        }
    }

    fn flow_logger(dir: &TempDir) -> Arc<FlowLogger> {
        Arc::new(FlowLogger::start(&dir.path().join("flow.log"), DetailLevel::Verbose).unwrap())
    }

    #[tokio::test]
    async fn happy_path_answer_grounded_in_retrieval() {
        let dir = TempDir::new().unwrap();
        let flow = flow_logger(&dir);
        let agent = Agent::new(
            Arc::new(ScriptedProvider::new()),
            Arc::new(StaticSearch::with_hits(vec![hit(
                "Lee Xiaoyong partnered with Zhang San to invest in ABC Tech Co.",
            )])),
            Arc::clone(&flow),
            2000,
        );

        let answer = agent
            .chat("Who did Lee Xiaoyong partner with?", &[], Some("kb1"))
            .await
            .unwrap();
        assert!(answer.contains("Zhang San"));
        assert!(answer.contains("ABC Tech Co."));

        flow.flush().await;
        let analyzer = FlowAnalyzer::from_file(flow.path()).unwrap();
        let executions: Vec<_> = analyzer
            .events()
            .iter()
            .filter(|e| e.kind == FlowEventKind::ToolExecution)
            .collect();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].status, FlowStatus::Success);
        assert!(executions[0].metadata["hits"].as_u64().unwrap() >= 1);

        let completes: Vec<_> = analyzer
            .events()
            .iter()
            .filter(|e| e.kind == FlowEventKind::QueryComplete)
            .collect();
        assert_eq!(completes.len(), 1);
        assert_eq!(completes[0].status, FlowStatus::Success);
    }

    #[tokio::test]
    async fn tool_budget_caps_runaway_loops() {
        let dir = TempDir::new().unwrap();
        let flow = flow_logger(&dir);
        let search = Arc::new(StaticSearch::with_hits(vec![hit("snippet")]));
        let agent = Agent::new(
            Arc::new(GreedyProvider),
            Arc::clone(&search) as Arc<dyn KnowledgeSearch>,
            Arc::clone(&flow),
            2000,
        );

        let answer = agent.chat("keep digging", &[], Some("kb1")).await.unwrap();
        assert!(answer.contains("Best effort"));
        assert_eq!(search.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn failed_tool_becomes_observation_not_abort() {
        let dir = TempDir::new().unwrap();
        let flow = flow_logger(&dir);
        let agent = Agent::new(
            Arc::new(ScriptedProvider::new()),
            Arc::new(StaticSearch::failing()),
            Arc::clone(&flow),
            2000,
        );

        let answer = agent.chat("anything indexed?", &[], Some("kb1")).await.unwrap();
        assert!(!answer.is_empty());

        flow.flush().await;
        let analyzer = FlowAnalyzer::from_file(flow.path()).unwrap();
        assert!(analyzer
            .events()
            .iter()
            .any(|e| e.kind == FlowEventKind::ToolExecution && e.status == FlowStatus::Error));
        // The turn still completed.
        assert!(analyzer
            .events()
            .iter()
            .any(|e| e.kind == FlowEventKind::QueryComplete && e.status == FlowStatus::Success));
    }

    #[tokio::test]
    async fn oversize_query_rejected_before_llm() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(ScriptedProvider::new());
        let agent = Agent::new(
            Arc::clone(&provider) as Arc<dyn LlmProvider>,
            Arc::new(StaticSearch::with_hits(Vec::new())),
            flow_logger(&dir),
            32,
        );

        let err = agent
            .chat(&"long ".repeat(20), &[], Some("kb1"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn history_is_truncated_to_window() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(ScriptedProvider::new());
        let agent = Agent::new(
            Arc::clone(&provider) as Arc<dyn LlmProvider>,
            Arc::new(StaticSearch::with_hits(vec![hit("Zhang San")])),
            flow_logger(&dir),
            2000,
        );

        let history: Vec<ChatMessage> = (0..40)
            .map(|i| user_message(&format!("old message {i}")))
            .collect();
        agent.chat("question", &history, Some("kb1")).await.unwrap();

        let sizes = provider.request_sizes.lock().unwrap();
        // First request: system + 20 history + user query.
        assert_eq!(sizes[0], 22);
    }

    #[tokio::test]
    async fn no_kb_means_no_tools() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(GreedyProvider);
        let search = Arc::new(StaticSearch::with_hits(vec![hit("unused")]));
        let agent = Agent::new(
            provider,
            Arc::clone(&search) as Arc<dyn KnowledgeSearch>,
            flow_logger(&dir),
            2000,
        );

        // GreedyProvider answers immediately when offered no tools.
        let answer = agent.chat("general question", &[], None).await.unwrap();
        assert!(answer.contains("Best effort"));
        assert_eq!(search.calls.load(Ordering::SeqCst), 0);
    }
}
