//! Agent Loop - the core of mcpquery.
//!
//! The Agent turns one user query into a bounded sequence of rounds:
//!
//! ```text
//! Query
//!   |
//!   v
//! +--------+  tool calls   +-------+  tools/call  +-------------+
//! |  LLM   |-------------->| Agent |------------->| Tool server |
//! +--------+<--------------+-------+<-------------+-------------+
//!   |        conversation            content chunks
//!   v
//! Answer
//! ```
//!
//! A round is one completion call plus the tool calls it requests. The
//! loop ends when the LLM returns a turn without tool calls, or when the
//! round limit is reached.

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::conversation::Conversation;
use crate::error::{ArgumentError, InvokeError, QueryError};
use crate::llm::LlmProvider;
use crate::tools::{ToolInvoker, ToolRegistry};
use crate::types::{ChatRequest, Message, TokenUsage, ToolCall};

/// Settings the loop needs from the configuration.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub model: String,
    pub max_tokens: u32,
    pub max_rounds: u32,
    pub system_prompt: Option<String>,
}

impl AgentSettings {
    pub fn from_config(config: &crate::config::AppConfig) -> Self {
        let prompt = config.agent.system_prompt.trim();
        Self {
            model: config.llm.model.clone(),
            max_tokens: config.llm.max_tokens,
            max_rounds: config.agent.max_rounds.max(1),
            system_prompt: (!prompt.is_empty()).then(|| prompt.to_string()),
        }
    }
}

/// How a query ended, when it did not fail outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    /// The LLM produced a final answer and every tool call went through
    Answered,
    /// The LLM produced a final answer, but some tool calls were skipped
    AnsweredWithSkips,
    /// The round limit was reached before a final answer
    DepthExceeded,
}

/// Why a tool call (or part of its result) was left out of the conversation.
#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    UnknownTool,
    MalformedArguments(String),
    SchemaViolation(Vec<String>),
    InvocationFailed(InvokeError),
    /// One result chunk could not be decoded or carried no text
    UnreadableContent(String),
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::UnknownTool => write!(f, "unknown tool"),
            SkipReason::MalformedArguments(e) => write!(f, "malformed arguments: {e}"),
            SkipReason::SchemaViolation(reasons) => {
                write!(f, "arguments rejected by schema: {}", reasons.join("; "))
            }
            SkipReason::InvocationFailed(e) => write!(f, "invocation failed: {e}"),
            SkipReason::UnreadableContent(e) => write!(f, "unreadable result chunk: {e}"),
        }
    }
}

impl From<ArgumentError> for SkipReason {
    fn from(err: ArgumentError) -> Self {
        match err {
            ArgumentError::UnknownTool(_) => SkipReason::UnknownTool,
            ArgumentError::SchemaViolation(reasons) => SkipReason::SchemaViolation(reasons),
            other => SkipReason::MalformedArguments(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SkippedCall {
    pub call_id: String,
    pub tool: String,
    pub reason: SkipReason,
}

/// Result of one query.
#[derive(Debug, Clone)]
pub struct QueryOutcome {
    /// Final answer, or the last assistant text seen when depth was exceeded
    pub answer: String,
    pub status: QueryStatus,
    /// Completion calls made
    pub rounds: u32,
    pub skipped: Vec<SkippedCall>,
    pub usage: TokenUsage,
    /// The full conversation, in order
    pub history: Vec<Message>,
}

/// The Agent holds the collaborators and runs queries.
///
/// It keeps no per-query state; every `run` builds its own
/// [`Conversation`].
pub struct Agent {
    llm: Box<dyn LlmProvider>,
    invoker: Box<dyn ToolInvoker>,
    tools: ToolRegistry,
    settings: AgentSettings,
}

impl Agent {
    pub fn new(
        llm: Box<dyn LlmProvider>,
        invoker: Box<dyn ToolInvoker>,
        tools: ToolRegistry,
        settings: AgentSettings,
    ) -> Self {
        Self {
            llm,
            invoker,
            tools,
            settings,
        }
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    /// Answer a query with a fresh conversation.
    pub async fn run(
        &self,
        query: &str,
        cancel: &CancellationToken,
    ) -> Result<QueryOutcome, QueryError> {
        self.drive(Conversation::new(query), cancel).await
    }

    /// Answer a query after an earlier history (multi-turn memory).
    pub async fn run_with_history(
        &self,
        history: Vec<Message>,
        query: &str,
        cancel: &CancellationToken,
    ) -> Result<QueryOutcome, QueryError> {
        self.drive(Conversation::resume(history, query)?, cancel).await
    }

    async fn drive(
        &self,
        conversation: Conversation,
        cancel: &CancellationToken,
    ) -> Result<QueryOutcome, QueryError> {
        let span = info_span!("query", provider = self.llm.name(), max_rounds = self.settings.max_rounds);
        self.run_loop(conversation, cancel).instrument(span).await
    }

    async fn run_loop(
        &self,
        mut conversation: Conversation,
        cancel: &CancellationToken,
    ) -> Result<QueryOutcome, QueryError> {
        let mut skipped = Vec::new();
        let mut usage = TokenUsage::default();
        let mut last_text = String::new();

        for round in 1..=self.settings.max_rounds {
            if cancel.is_cancelled() {
                return Err(QueryError::Cancelled);
            }

            let request = ChatRequest {
                model: self.settings.model.clone(),
                system: self.settings.system_prompt.clone(),
                messages: conversation.snapshot(),
                tools: self.tools.list().to_vec(),
                max_tokens: self.settings.max_tokens,
            };
            debug!(round, messages = request.messages.len(), "calling LLM");

            let response = tokio::select! {
                _ = cancel.cancelled() => return Err(QueryError::Cancelled),
                r = self.llm.chat_completion(&request) => r.map_err(QueryError::Completion)?,
            };
            if let Some(u) = response.usage {
                usage.add(u);
                debug!(round, input_tokens = u.input_tokens, output_tokens = u.output_tokens, "token usage");
            }

            if !response.has_tool_calls() {
                conversation.append(Message::assistant(&response.content))?;
                let status = if skipped.is_empty() {
                    QueryStatus::Answered
                } else {
                    QueryStatus::AnsweredWithSkips
                };
                info!(rounds = round, skipped = skipped.len(), "query answered");
                return Ok(QueryOutcome {
                    answer: response.content,
                    status,
                    rounds: round,
                    skipped,
                    usage,
                    history: conversation.into_messages(),
                });
            }

            last_text = response.content.clone();
            conversation.append(Message::assistant_with_tool_calls(
                response.content,
                response.tool_calls.clone(),
            ))?;

            for call in &response.tool_calls {
                self.execute_call(call, &mut conversation, &mut skipped).await?;
            }
        }

        warn!(max_rounds = self.settings.max_rounds, "round limit reached without a final answer");
        Ok(QueryOutcome {
            answer: last_text,
            status: QueryStatus::DepthExceeded,
            rounds: self.settings.max_rounds,
            skipped,
            usage,
            history: conversation.into_messages(),
        })
    }

    /// Run one tool call and append its text chunks to the conversation.
    ///
    /// Anything that goes wrong with the call is recorded in `skipped`;
    /// only a conversation invariant breach is returned as an error.
    async fn execute_call(
        &self,
        call: &ToolCall,
        conversation: &mut Conversation,
        skipped: &mut Vec<SkippedCall>,
    ) -> Result<(), QueryError> {
        let mut skip = |reason: SkipReason| {
            warn!(tool = %call.name, call_id = %call.id, %reason, "skipping tool call");
            skipped.push(SkippedCall {
                call_id: call.id.clone(),
                tool: call.name.clone(),
                reason,
            });
        };

        let arguments = match self.tools.validate(&call.name, &call.arguments) {
            Ok(arguments) => arguments,
            Err(e) => {
                skip(e.into());
                return Ok(());
            }
        };

        info!(tool = %call.name, call_id = %call.id, "calling tool");
        let output = match self.invoker.invoke(&call.name, &arguments).await {
            Ok(output) => output,
            Err(e) => {
                skip(SkipReason::InvocationFailed(e));
                return Ok(());
            }
        };

        let mut appended = 0usize;
        for chunk in output.chunks() {
            match chunk {
                Ok(content) => match content.as_text() {
                    Some(text) => {
                        conversation.append(Message::tool_result(&call.id, text))?;
                        appended += 1;
                    }
                    None => skip(SkipReason::UnreadableContent(format!(
                        "{} content has no text",
                        content.kind()
                    ))),
                },
                Err(e) => skip(SkipReason::UnreadableContent(e.to_string())),
            }
        }
        debug!(tool = %call.name, chunks = appended, "tool result appended");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::check_tool_references;
    use crate::types::{ChatResponse, Role, ToolDescriptor, ToolOutput};
    use anyhow::anyhow;
    use async_trait::async_trait;
    use serde_json::{json, Map, Value};
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// LLM that replays scripted turns and records every request.
    #[derive(Clone, Default)]
    struct ScriptedLlm {
        turns: Arc<Mutex<VecDeque<anyhow::Result<ChatResponse>>>>,
        requests: Arc<Mutex<Vec<ChatRequest>>>,
        /// Returned once the script runs out; `None` means fail
        fallback: Option<ChatResponse>,
    }

    impl ScriptedLlm {
        fn new(turns: Vec<ChatResponse>) -> Self {
            Self {
                turns: Arc::new(Mutex::new(turns.into_iter().map(Ok).collect())),
                ..Self::default()
            }
        }

        fn requests(&self) -> Vec<ChatRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedLlm {
        async fn chat_completion(&self, request: &ChatRequest) -> anyhow::Result<ChatResponse> {
            self.requests.lock().unwrap().push(request.clone());
            match self.turns.lock().unwrap().pop_front() {
                Some(turn) => turn,
                None => self.fallback.clone().ok_or_else(|| anyhow!("script exhausted")),
            }
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    /// Invoker with canned outputs per tool name; unknown names fail.
    #[derive(Clone, Default)]
    struct FakeInvoker {
        outputs: Arc<Mutex<Vec<(String, Result<ToolOutput, InvokeError>)>>>,
        calls: Arc<Mutex<Vec<(String, Map<String, Value>)>>>,
    }

    impl FakeInvoker {
        fn with(self, name: &str, output: Result<ToolOutput, InvokeError>) -> Self {
            self.outputs.lock().unwrap().push((name.to_string(), output));
            self
        }

        fn calls(&self) -> Vec<(String, Map<String, Value>)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ToolInvoker for FakeInvoker {
        async fn invoke(
            &self,
            name: &str,
            arguments: &Map<String, Value>,
        ) -> Result<ToolOutput, InvokeError> {
            self.calls
                .lock()
                .unwrap()
                .push((name.to_string(), arguments.clone()));
            self.outputs
                .lock()
                .unwrap()
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, out)| out.clone())
                .unwrap_or_else(|| Err(InvokeError::Transport("no such tool".into())))
        }
    }

    fn weather_tools() -> ToolRegistry {
        ToolRegistry::new(vec![
            ToolDescriptor {
                name: "get_alerts".into(),
                description: "Get active weather alerts for a given US state".into(),
                input_schema: json!({
                    "type": "object",
                    "properties": { "state": { "type": "string" } },
                    "required": ["state"]
                }),
            },
            ToolDescriptor {
                name: "get_forecast".into(),
                description: "Get weather forecast for a given location".into(),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "latitude": { "type": "number" },
                        "longitude": { "type": "number" }
                    },
                    "required": ["latitude", "longitude"]
                }),
            },
        ])
    }

    fn settings(max_rounds: u32) -> AgentSettings {
        AgentSettings {
            model: "test-model".into(),
            max_tokens: 256,
            max_rounds,
            system_prompt: Some("be helpful".into()),
        }
    }

    fn agent(llm: &ScriptedLlm, invoker: &FakeInvoker, max_rounds: u32) -> Agent {
        Agent::new(
            Box::new(llm.clone()),
            Box::new(invoker.clone()),
            weather_tools(),
            settings(max_rounds),
        )
    }

    fn text(content: &str) -> ChatResponse {
        ChatResponse {
            content: content.into(),
            ..ChatResponse::default()
        }
    }

    fn calls(content: &str, calls: &[(&str, &str, &str)]) -> ChatResponse {
        ChatResponse {
            content: content.into(),
            tool_calls: calls
                .iter()
                .map(|(id, name, args)| ToolCall {
                    id: id.to_string(),
                    name: name.to_string(),
                    arguments: args.to_string(),
                })
                .collect(),
            usage: Some(TokenUsage { input_tokens: 10, output_tokens: 2 }),
        }
    }

    fn assert_references_hold(outcome: &QueryOutcome) {
        check_tool_references(&outcome.history).expect("tool results must follow their calls");
    }

    #[tokio::test]
    async fn test_text_only_answer_needs_no_tools() {
        let llm = ScriptedLlm::new(vec![text("Hello there.")]);
        let invoker = FakeInvoker::default();

        let outcome = agent(&llm, &invoker, 8)
            .run("hi", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.answer, "Hello there.");
        assert_eq!(outcome.status, QueryStatus::Answered);
        assert_eq!(outcome.rounds, 1);
        assert!(invoker.calls().is_empty());
        assert_eq!(llm.requests().len(), 1);
        assert_eq!(llm.requests()[0].messages, vec![Message::user("hi")]);
        assert_eq!(llm.requests()[0].system.as_deref(), Some("be helpful"));
        assert_eq!(llm.requests()[0].tools.len(), 2);
        assert_references_hold(&outcome);
    }

    #[tokio::test]
    async fn test_alerts_end_to_end() {
        let llm = ScriptedLlm::new(vec![
            calls("", &[("call_1", "get_alerts", r#"{"state":"CA"}"#)]),
            text("There is a flood warning in CA."),
        ]);
        let invoker = FakeInvoker::default().with(
            "get_alerts",
            Ok(ToolOutput::text(["Event: Flood Warning || Area: ..."])),
        );

        let outcome = agent(&llm, &invoker, 8)
            .run("alerts for CA", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.answer, "There is a flood warning in CA.");
        assert_eq!(outcome.status, QueryStatus::Answered);
        assert_eq!(outcome.rounds, 2);

        let invoked = invoker.calls();
        assert_eq!(invoked.len(), 1);
        assert_eq!(invoked[0].0, "get_alerts");
        assert_eq!(invoked[0].1["state"], "CA");

        let second = &llm.requests()[1].messages;
        assert_eq!(second.len(), 3);
        assert_eq!(second[2].role, Role::Tool);
        assert_eq!(second[2].content, "Event: Flood Warning || Area: ...");
        assert_eq!(second[2].tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(outcome.usage.input_tokens, 10);
        assert_references_hold(&outcome);
    }

    #[tokio::test]
    async fn test_round_appends_assistant_then_results_in_order() {
        let llm = ScriptedLlm::new(vec![
            calls(
                "Looking up both.",
                &[
                    ("a", "get_alerts", r#"{"state":"WA"}"#),
                    ("b", "get_forecast", r#"{"latitude":47.6,"longitude":-122.3}"#),
                    ("c", "get_alerts", r#"{"state":"OR"}"#),
                ],
            ),
            text("done"),
        ]);
        let invoker = FakeInvoker::default()
            .with("get_alerts", Ok(ToolOutput::text(["no alerts"])))
            .with("get_forecast", Ok(ToolOutput::text(["rain"])));

        let outcome = agent(&llm, &invoker, 8)
            .run("weather in the PNW", &CancellationToken::new())
            .await
            .unwrap();

        let before_second_call = &llm.requests()[1].messages;
        // 1 user + 1 assistant + 3 tool results
        assert_eq!(before_second_call.len(), 5);
        assert_eq!(before_second_call[1].role, Role::Assistant);
        assert_eq!(before_second_call[1].content, "Looking up both.");
        assert_eq!(before_second_call[1].tool_calls.len(), 3);
        let ids: Vec<_> = before_second_call[2..]
            .iter()
            .map(|m| m.tool_call_id.clone().unwrap())
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);

        let order: Vec<_> = invoker.calls().into_iter().map(|(n, _)| n).collect();
        assert_eq!(order, vec!["get_alerts", "get_forecast", "get_alerts"]);
        assert_eq!(outcome.history.len(), 6);
        assert_references_hold(&outcome);
    }

    #[tokio::test]
    async fn test_multiple_chunks_share_call_id() {
        let llm = ScriptedLlm::new(vec![
            calls("", &[("x", "get_alerts", r#"{"state":"TX"}"#)]),
            text("two alerts"),
        ]);
        let invoker = FakeInvoker::default().with(
            "get_alerts",
            Ok(ToolOutput::text(["Event: Heat Advisory", "Event: Fire Weather Watch"])),
        );

        let outcome = agent(&llm, &invoker, 8)
            .run("alerts for TX", &CancellationToken::new())
            .await
            .unwrap();

        let tool_msgs: Vec<_> = outcome
            .history
            .iter()
            .filter(|m| m.role == Role::Tool)
            .collect();
        assert_eq!(tool_msgs.len(), 2);
        assert!(tool_msgs.iter().all(|m| m.tool_call_id.as_deref() == Some("x")));
        assert_references_hold(&outcome);
    }

    #[tokio::test]
    async fn test_invalid_json_arguments_are_skipped() {
        let llm = ScriptedLlm::new(vec![
            calls(
                "",
                &[
                    ("bad", "get_alerts", r#"{"state": "CA""#),
                    ("good", "get_alerts", r#"{"state":"NV"}"#),
                ],
            ),
            text("Only NV checked."),
        ]);
        let invoker =
            FakeInvoker::default().with("get_alerts", Ok(ToolOutput::text(["none in NV"])));

        let outcome = agent(&llm, &invoker, 8)
            .run("alerts for CA and NV", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.answer, "Only NV checked.");
        assert_eq!(outcome.status, QueryStatus::AnsweredWithSkips);
        assert_eq!(invoker.calls().len(), 1);
        assert_eq!(outcome.skipped.len(), 1);
        assert_eq!(outcome.skipped[0].call_id, "bad");
        assert!(matches!(outcome.skipped[0].reason, SkipReason::MalformedArguments(_)));
        assert!(!outcome
            .history
            .iter()
            .any(|m| m.tool_call_id.as_deref() == Some("bad")));
        assert_references_hold(&outcome);
    }

    #[tokio::test]
    async fn test_skipped_calls_are_answered_on_the_wire() {
        use crate::llm::anthropic::AnthropicProvider;
        use crate::llm::openai_compatible::OpenAiCompatibleProvider;
        use std::time::Duration;

        let llm = ScriptedLlm::new(vec![
            calls(
                "",
                &[
                    ("bad", "get_alerts", r#"{"state": "CA""#),
                    ("gone", "get_weather", "{}"),
                    ("good", "get_alerts", r#"{"state":"NV"}"#),
                ],
            ),
            text("Only NV checked."),
        ]);
        let invoker =
            FakeInvoker::default().with("get_alerts", Ok(ToolOutput::text(["none in NV"])));

        let outcome = agent(&llm, &invoker, 8)
            .run("alerts for CA and NV", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.skipped.len(), 2);
        let second = &llm.requests()[1];

        let openai = OpenAiCompatibleProvider::new("k".into(), None, Duration::from_secs(1)).unwrap();
        let body = serde_json::to_value(openai.build_api_request(second)).unwrap();
        let answered: Vec<&str> = body["messages"]
            .as_array()
            .unwrap()
            .iter()
            .filter(|m| m["role"] == "tool")
            .filter_map(|m| m["tool_call_id"].as_str())
            .collect();
        assert_eq!(answered, vec!["good", "bad", "gone"]);

        let anthropic = AnthropicProvider::new("k".into(), None, Duration::from_secs(1)).unwrap();
        let body = serde_json::to_value(anthropic.build_api_request(second)).unwrap();
        let results = body["messages"][2]["content"].as_array().unwrap();
        let answered: Vec<&str> = results
            .iter()
            .filter_map(|b| b["tool_use_id"].as_str())
            .collect();
        assert_eq!(answered, vec!["good", "bad", "gone"]);
        assert!(results[1..].iter().all(|b| b["is_error"] == true));
    }

    #[tokio::test]
    async fn test_schema_violation_and_unknown_tool_are_skipped() {
        let llm = ScriptedLlm::new(vec![
            calls(
                "",
                &[
                    ("f", "get_forecast", r#"{"latitude":"north"}"#),
                    ("w", "get_weather", r#"{}"#),
                ],
            ),
            text("sorry"),
        ]);
        let invoker = FakeInvoker::default();

        let outcome = agent(&llm, &invoker, 8)
            .run("forecast", &CancellationToken::new())
            .await
            .unwrap();

        assert!(invoker.calls().is_empty());
        assert!(matches!(outcome.skipped[0].reason, SkipReason::SchemaViolation(_)));
        assert_eq!(outcome.skipped[1].reason, SkipReason::UnknownTool);
        assert_eq!(outcome.status, QueryStatus::AnsweredWithSkips);
    }

    #[tokio::test]
    async fn test_invocation_failure_is_skipped_and_loop_continues() {
        let llm = ScriptedLlm::new(vec![
            calls("", &[("1", "get_alerts", r#"{"state":"CA"}"#)]),
            calls("", &[("2", "get_forecast", r#"{"latitude":1,"longitude":2}"#)]),
            text("Forecast only."),
        ]);
        let invoker = FakeInvoker::default()
            .with("get_alerts", Err(InvokeError::Timeout(std::time::Duration::from_secs(30))))
            .with("get_forecast", Ok(ToolOutput::text(["Sunny"])));

        let outcome = agent(&llm, &invoker, 8)
            .run("weather", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.answer, "Forecast only.");
        assert_eq!(outcome.rounds, 3);
        assert_eq!(
            outcome.skipped[0].reason,
            SkipReason::InvocationFailed(InvokeError::Timeout(std::time::Duration::from_secs(30)))
        );
        // The failed call leaves no tool message behind.
        let third = &llm.requests()[2].messages;
        assert_eq!(third.iter().filter(|m| m.role == Role::Tool).count(), 1);
        assert_references_hold(&outcome);
    }

    #[tokio::test]
    async fn test_unreadable_chunks_skipped_others_kept() {
        let llm = ScriptedLlm::new(vec![
            calls("", &[("m", "get_alerts", r#"{"state":"FL"}"#)]),
            text("ok"),
        ]);
        let output = ToolOutput {
            content: vec![
                json!({ "type": "text", "text": "Event: Hurricane Watch" }),
                json!({ "type": "hologram" }),
                json!({ "type": "image", "data": "aGk=", "mimeType": "image/png" }),
            ],
        };
        let invoker = FakeInvoker::default().with("get_alerts", Ok(output));

        let outcome = agent(&llm, &invoker, 8)
            .run("alerts for FL", &CancellationToken::new())
            .await
            .unwrap();

        let tool_msgs: Vec<_> = outcome
            .history
            .iter()
            .filter(|m| m.role == Role::Tool)
            .collect();
        assert_eq!(tool_msgs.len(), 1);
        assert_eq!(tool_msgs[0].content, "Event: Hurricane Watch");
        assert_eq!(outcome.skipped.len(), 2);
        assert!(outcome
            .skipped
            .iter()
            .all(|s| matches!(s.reason, SkipReason::UnreadableContent(_))));
    }

    #[tokio::test]
    async fn test_never_ending_tool_calls_hit_round_limit() {
        let llm = ScriptedLlm {
            fallback: Some(calls("still working", &[("loop", "get_alerts", r#"{"state":"CA"}"#)])),
            ..ScriptedLlm::default()
        };
        let invoker = FakeInvoker::default().with("get_alerts", Ok(ToolOutput::text(["again"])));

        let outcome = agent(&llm, &invoker, 3)
            .run("alerts forever", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.status, QueryStatus::DepthExceeded);
        assert_eq!(outcome.answer, "still working");
        assert_eq!(outcome.rounds, 3);
        assert_eq!(llm.requests().len(), 3);
        assert_eq!(invoker.calls().len(), 3);
        assert_references_hold(&outcome);
    }

    #[tokio::test]
    async fn test_completion_failure_is_fatal() {
        let llm = ScriptedLlm::default();
        let invoker = FakeInvoker::default();

        let err = agent(&llm, &invoker, 8)
            .run("hi", &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, QueryError::Completion(_)));
        assert!(err.to_string().contains("script exhausted"));
    }

    #[tokio::test]
    async fn test_cancelled_before_first_call() {
        let llm = ScriptedLlm::new(vec![text("never seen")]);
        let invoker = FakeInvoker::default();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = agent(&llm, &invoker, 8).run("hi", &cancel).await.unwrap_err();

        assert!(err.is_cancelled());
        assert!(llm.requests().is_empty());
    }

    /// Invoker that cancels the query while "running" a tool.
    struct CancellingInvoker(CancellationToken);

    #[async_trait]
    impl ToolInvoker for CancellingInvoker {
        async fn invoke(
            &self,
            _name: &str,
            _arguments: &Map<String, Value>,
        ) -> Result<ToolOutput, InvokeError> {
            self.0.cancel();
            Ok(ToolOutput::text(["finished anyway"]))
        }
    }

    #[tokio::test]
    async fn test_cancel_during_tool_stops_before_next_completion() {
        let llm = ScriptedLlm::new(vec![
            calls("", &[("1", "get_alerts", r#"{"state":"CA"}"#)]),
            text("never seen"),
        ]);
        let cancel = CancellationToken::new();
        let agent = Agent::new(
            Box::new(llm.clone()),
            Box::new(CancellingInvoker(cancel.clone())),
            weather_tools(),
            settings(8),
        );

        let err = agent.run("alerts", &cancel).await.unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(llm.requests().len(), 1);
    }

    /// LLM whose completion never returns.
    struct HangingLlm;

    #[async_trait]
    impl LlmProvider for HangingLlm {
        async fn chat_completion(&self, _request: &ChatRequest) -> anyhow::Result<ChatResponse> {
            std::future::pending().await
        }

        fn name(&self) -> &str {
            "hanging"
        }
    }

    #[tokio::test]
    async fn test_cancel_interrupts_pending_completion() {
        let agent = Agent::new(
            Box::new(HangingLlm),
            Box::new(FakeInvoker::default()),
            weather_tools(),
            settings(8),
        );
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let result = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            agent.run("alerts for CA", &cancel),
        )
        .await
        .expect("cancellation should end the pending completion");

        assert!(result.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_run_with_history_carries_memory() {
        let llm = ScriptedLlm::new(vec![
            calls("", &[("1", "get_alerts", r#"{"state":"CA"}"#)]),
            text("Flood warning in CA."),
            text("Yes, still the flood warning."),
        ]);
        let invoker =
            FakeInvoker::default().with("get_alerts", Ok(ToolOutput::text(["Flood Warning"])));
        let agent = agent(&llm, &invoker, 8);
        let cancel = CancellationToken::new();

        let first = agent.run("alerts for CA", &cancel).await.unwrap();
        let second = agent
            .run_with_history(first.history.clone(), "any updates?", &cancel)
            .await
            .unwrap();

        assert_eq!(second.answer, "Yes, still the flood warning.");
        let seen = &llm.requests()[2].messages;
        assert_eq!(seen.len(), first.history.len() + 1);
        assert_eq!(seen.last().unwrap().content, "any updates?");
        assert_references_hold(&second);
    }

    #[tokio::test]
    async fn test_run_with_broken_history_is_rejected() {
        let llm = ScriptedLlm::new(vec![text("unused")]);
        let invoker = FakeInvoker::default();

        let err = agent(&llm, &invoker, 8)
            .run_with_history(vec![Message::tool_result("ghost", "x")], "q", &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, QueryError::Conversation(_)));
        assert!(llm.requests().is_empty());
    }

    #[test]
    fn test_settings_from_config() {
        let mut config = crate::config::AppConfig::default();
        config.agent.system_prompt = "   ".into();
        config.agent.max_rounds = 4;
        let s = AgentSettings::from_config(&config);
        assert_eq!(s.max_rounds, 4);
        assert!(s.system_prompt.is_none());
        assert_eq!(s.model, "gpt-4");
    }
}
