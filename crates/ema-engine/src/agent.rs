use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};

use ema_core::client::{ClientError, LlmClient};
use ema_core::events::ActorEvent;
use ema_core::messages::{Message, ToolResult};
use ema_core::tools::{Reply, Tool, REPLY_TOOL_NAME};

use crate::bus::EventBus;
use crate::context::ContextManager;

/// Bounds for one agent run.
#[derive(Clone, Copy, Debug)]
pub struct AgentConfig {
    pub max_steps: u32,
    pub token_limit: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_steps: 20,
            token_limit: 100_000,
        }
    }
}

/// The resumable state of one run. Created when a run starts, discarded
/// on clean termination, and preserved across a preemptive abort when
/// no reply has been shown yet.
pub struct AgentState {
    pub system_prompt: String,
    pub messages: Vec<Message>,
    pub tools: Vec<Arc<dyn Tool>>,
}

/// The step-bounded LLM/tool loop that executes one run.
///
/// Every terminal condition — normal completion, client error,
/// cancellation, step exhaustion — is reported through `runFinished`;
/// the run itself never returns an error.
pub struct Agent {
    config: AgentConfig,
    llm: Arc<dyn LlmClient>,
    events: EventBus,
    cancel: Mutex<CancellationToken>,
}

impl Agent {
    pub fn new(config: AgentConfig, llm: Arc<dyn LlmClient>, events: EventBus) -> Self {
        Self {
            config,
            llm,
            events,
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    /// Signal the in-flight run to stop. The LLM call observes the
    /// token and fails fast; an executing tool finishes naturally.
    pub fn abort(&self) {
        self.cancel.lock().cancel();
    }

    /// Drive one run to termination, returning the (possibly mutated)
    /// state for the caller to preserve or discard.
    #[instrument(skip_all, fields(max_steps = self.config.max_steps))]
    pub async fn run_with_state(&self, state: AgentState) -> AgentState {
        let cancel = {
            let mut guard = self.cancel.lock();
            *guard = CancellationToken::new();
            guard.clone()
        };

        let AgentState {
            system_prompt,
            messages,
            tools,
        } = state;
        let mut context = ContextManager::new(messages, tools.clone(), self.config.token_limit);

        let mut finished = false;
        'steps: for step in 1..=self.config.max_steps {
            if cancel.is_cancelled() {
                self.finish_cancelled();
                finished = true;
                break;
            }

            context
                .summarize_if_needed(self.llm.as_ref(), &self.events, &cancel)
                .await;

            self.events.emit(ActorEvent::StepStarted {
                step,
                max_steps: self.config.max_steps,
            });

            let response = match self
                .llm
                .generate(
                    context.messages(),
                    &context.tool_definitions(),
                    &system_prompt,
                    &cancel,
                )
                .await
            {
                Ok(response) => response,
                Err(ClientError::Cancelled) => {
                    self.finish_cancelled();
                    finished = true;
                    break;
                }
                Err(e) => {
                    self.events.emit(ActorEvent::RunFinished {
                        ok: false,
                        msg: "llm_error".into(),
                        error: Some(e.to_string()),
                    });
                    finished = true;
                    break;
                }
            };

            context.update_api_tokens(&response);
            context.add_model(&response);
            self.events.emit(ActorEvent::LlmResponseReceived {
                response: response.clone(),
            });

            let calls = response.message.tool_calls.clone();
            if calls.is_empty() {
                self.events.emit(ActorEvent::RunFinished {
                    ok: true,
                    msg: response.finish_reason.clone(),
                    error: None,
                });
                finished = true;
                break;
            }

            for call in calls {
                self.events.emit(ActorEvent::ToolCallStarted {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    args: call.args.clone(),
                });

                let mut result = match context.tool(&call.name) {
                    None => ToolResult::err(format!("Unknown tool: {}", call.name)),
                    Some(tool) => {
                        match AssertUnwindSafe(tool.execute(call.args.clone()))
                            .catch_unwind()
                            .await
                        {
                            Ok(result) => result,
                            Err(panic) => ToolResult::err(format!(
                                "ToolExecutionError: {}",
                                panic_message(&panic)
                            )),
                        }
                    }
                };

                if call.name == REPLY_TOOL_NAME && result.success {
                    match result
                        .content
                        .as_deref()
                        .map(serde_json::from_str::<Reply>)
                    {
                        Some(Ok(reply)) => {
                            self.events.emit(ActorEvent::EmaReplyReceived { reply });
                            // Keep the payload out of the next prompt.
                            result.content = Some(String::new());
                        }
                        _ => {
                            warn!("reply tool succeeded with an unparseable payload");
                        }
                    }
                }

                self.events.emit(ActorEvent::ToolCallFinished {
                    ok: result.success,
                    id: call.id.clone(),
                    name: call.name.clone(),
                    result: result.clone(),
                });
                context.add_tool(result, call.name, call.id);

                if cancel.is_cancelled() {
                    self.finish_cancelled();
                    finished = true;
                    break 'steps;
                }
            }
        }

        if !finished {
            self.events.emit(ActorEvent::RunFinished {
                ok: false,
                msg: "max_steps".into(),
                error: Some(format!(
                    "Task couldn't be completed after {} steps",
                    self.config.max_steps
                )),
            });
        }

        AgentState {
            system_prompt,
            messages: context.into_messages(),
            tools,
        }
    }

    fn finish_cancelled(&self) {
        self.events.emit(ActorEvent::RunFinished {
            ok: false,
            msg: "cancelled".into(),
            error: None,
        });
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    panic
        .downcast_ref::<String>()
        .map(|s| s.as_str())
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ema_core::events::EventKind;
    use ema_core::ids::ToolCallId;
    use ema_core::messages::ToolCall;
    use ema_core::tools::EmaReplyTool;
    use ema_llm::{MockClient, MockReply};
    use serde_json::json;

    fn reply_call() -> ToolCall {
        ToolCall {
            id: Some(ToolCallId::generate()),
            name: REPLY_TOOL_NAME.into(),
            args: serde_json::from_value(json!({
                "think": "t",
                "expression": "e",
                "action": "a",
                "response": "hi"
            }))
            .unwrap(),
            thought_signature: None,
        }
    }

    fn state(tools: Vec<Arc<dyn Tool>>) -> AgentState {
        AgentState {
            system_prompt: "You are EMA.".into(),
            messages: vec![Message::user_text("hello")],
            tools,
        }
    }

    fn collect_kinds(bus: &EventBus) -> Arc<Mutex<Vec<&'static str>>> {
        let kinds = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&kinds);
        bus.subscribe_all(move |event| {
            sink.lock().push(event.kind().as_str());
        });
        kinds
    }

    struct PanicTool;

    #[async_trait]
    impl Tool for PanicTool {
        fn name(&self) -> &str {
            "panic_tool"
        }
        fn description(&self) -> &str {
            "always panics"
        }
        fn parameters(&self) -> serde_json::Value {
            json!({"type": "object", "properties": {}})
        }
        async fn execute(&self, _args: serde_json::Map<String, serde_json::Value>) -> ToolResult {
            panic!("tool exploded");
        }
    }

    #[tokio::test]
    async fn single_turn_reply_event_sequence() {
        let llm = Arc::new(MockClient::new(vec![
            MockReply::tool_calls("replying", vec![reply_call()]),
            MockReply::text("done"),
        ]));
        let bus = EventBus::default();
        let kinds = collect_kinds(&bus);

        let replies = Arc::new(Mutex::new(Vec::new()));
        {
            let replies = Arc::clone(&replies);
            bus.subscribe(EventKind::EmaReplyReceived, move |event| {
                if let ActorEvent::EmaReplyReceived { reply } = event {
                    replies.lock().push(reply.clone());
                }
            });
        }

        let agent = Agent::new(
            AgentConfig {
                max_steps: 5,
                token_limit: 10_000,
            },
            llm,
            bus,
        );
        let final_state = agent
            .run_with_state(state(vec![Arc::new(EmaReplyTool)]))
            .await;

        assert_eq!(
            *kinds.lock(),
            vec![
                "stepStarted",
                "llmResponseReceived",
                "toolCallStarted",
                "emaReplyReceived",
                "toolCallFinished",
                "stepStarted",
                "llmResponseReceived",
                "runFinished",
            ]
        );
        assert_eq!(replies.lock()[0].response, "hi");

        // Normal termination: final message is a model message with no
        // tool calls.
        match final_state.messages.last().unwrap() {
            Message::Model(m) => assert!(!m.has_tool_calls()),
            other => panic!("expected model message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn reply_content_cleared_before_append() {
        let call = reply_call();
        let call_id = call.id.clone().unwrap();
        let llm = Arc::new(MockClient::new(vec![
            MockReply::tool_calls("replying", vec![call]),
            MockReply::text("done"),
        ]));
        let agent = Agent::new(AgentConfig::default(), llm, EventBus::default());
        let final_state = agent
            .run_with_state(state(vec![Arc::new(EmaReplyTool)]))
            .await;

        let tool_msg = final_state
            .messages
            .iter()
            .find_map(|m| match m {
                Message::Tool(t) => Some(t),
                _ => None,
            })
            .expect("tool message appended");
        assert_eq!(tool_msg.id.as_ref(), Some(&call_id));
        assert_eq!(tool_msg.result.content.as_deref(), Some(""));
        assert!(tool_msg.result.success);
    }

    #[tokio::test]
    async fn unknown_tool_synthesizes_failure_and_continues() {
        let call = ToolCall {
            id: None,
            name: "does_not_exist".into(),
            args: serde_json::Map::new(),
            thought_signature: None,
        };
        let llm = Arc::new(MockClient::new(vec![
            MockReply::tool_calls("trying", vec![call]),
            MockReply::text("recovered"),
        ]));
        let bus = EventBus::default();
        let kinds = collect_kinds(&bus);
        let agent = Agent::new(AgentConfig::default(), llm, bus);

        let final_state = agent.run_with_state(state(vec![])).await;

        let tool_msg = final_state
            .messages
            .iter()
            .find_map(|m| match m {
                Message::Tool(t) => Some(t),
                _ => None,
            })
            .unwrap();
        assert!(!tool_msg.result.success);
        assert_eq!(
            tool_msg.result.error.as_deref(),
            Some("Unknown tool: does_not_exist")
        );
        // Loop continued to a second step and finished cleanly.
        assert_eq!(kinds.lock().last().copied(), Some("runFinished"));
        assert_eq!(
            kinds.lock().iter().filter(|k| **k == "stepStarted").count(),
            2
        );
    }

    #[tokio::test]
    async fn tool_panic_becomes_error_result() {
        let call = ToolCall {
            id: None,
            name: "panic_tool".into(),
            args: serde_json::Map::new(),
            thought_signature: None,
        };
        let llm = Arc::new(MockClient::new(vec![
            MockReply::tool_calls("trying", vec![call]),
            MockReply::text("recovered"),
        ]));
        let agent = Agent::new(AgentConfig::default(), llm, EventBus::default());

        let final_state = agent.run_with_state(state(vec![Arc::new(PanicTool)])).await;

        let tool_msg = final_state
            .messages
            .iter()
            .find_map(|m| match m {
                Message::Tool(t) => Some(t),
                _ => None,
            })
            .unwrap();
        assert!(!tool_msg.result.success);
        let error = tool_msg.result.error.as_deref().unwrap();
        assert!(error.contains("ToolExecutionError"));
        assert!(error.contains("tool exploded"));
    }

    #[tokio::test]
    async fn max_steps_exhaustion_reports_failure() {
        let call = ToolCall {
            id: None,
            name: "does_not_exist".into(),
            args: serde_json::Map::new(),
            thought_signature: None,
        };
        // Always tool-calling: the loop never terminates on its own.
        let replies: Vec<MockReply> = (0..3)
            .map(|_| MockReply::tool_calls("again", vec![call.clone()]))
            .collect();
        let llm = Arc::new(MockClient::new(replies));
        let bus = EventBus::default();
        let kinds = collect_kinds(&bus);

        let finished = Arc::new(Mutex::new(None));
        {
            let finished = Arc::clone(&finished);
            bus.subscribe(EventKind::RunFinished, move |event| {
                if let ActorEvent::RunFinished { ok, error, .. } = event {
                    *finished.lock() = Some((*ok, error.clone()));
                }
            });
        }

        let agent = Agent::new(
            AgentConfig {
                max_steps: 3,
                token_limit: 100_000,
            },
            llm,
            bus,
        );
        agent.run_with_state(state(vec![])).await;

        assert_eq!(
            kinds.lock().iter().filter(|k| **k == "stepStarted").count(),
            3
        );
        let (ok, error) = finished.lock().clone().unwrap();
        assert!(!ok);
        assert_eq!(
            error.as_deref(),
            Some("Task couldn't be completed after 3 steps")
        );
    }

    #[tokio::test]
    async fn zero_max_steps_finishes_without_llm_call() {
        let llm = Arc::new(MockClient::new(vec![]));
        let bus = EventBus::default();
        let kinds = collect_kinds(&bus);

        let agent = Agent::new(
            AgentConfig {
                max_steps: 0,
                token_limit: 100_000,
            },
            Arc::clone(&llm) as Arc<dyn LlmClient>,
            bus,
        );
        agent.run_with_state(state(vec![])).await;

        assert_eq!(llm.call_count(), 0);
        assert_eq!(*kinds.lock(), vec!["runFinished"]);
    }

    #[tokio::test]
    async fn abort_during_generate_terminates_cleanly() {
        let llm = Arc::new(MockClient::new(vec![MockReply::Hang]));
        let bus = EventBus::default();
        let kinds = collect_kinds(&bus);

        let agent = Arc::new(Agent::new(AgentConfig::default(), llm, bus));
        let task = {
            let agent = Arc::clone(&agent);
            tokio::spawn(async move { agent.run_with_state(state(vec![])).await })
        };

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        agent.abort();
        let final_state = task.await.unwrap();

        assert_eq!(kinds.lock().last().copied(), Some("runFinished"));
        // The hung call produced nothing; only the seed message remains.
        assert_eq!(final_state.messages.len(), 1);
    }

    #[tokio::test]
    async fn client_error_surfaces_in_run_finished() {
        let llm = Arc::new(MockClient::new(vec![MockReply::Error(
            ClientError::RetryExhausted {
                attempts: 4,
                last_error: "server error 500".into(),
            },
        )]));
        let bus = EventBus::default();

        let finished = Arc::new(Mutex::new(None));
        {
            let finished = Arc::clone(&finished);
            bus.subscribe(EventKind::RunFinished, move |event| {
                if let ActorEvent::RunFinished { ok, error, .. } = event {
                    *finished.lock() = Some((*ok, error.clone()));
                }
            });
        }

        let agent = Agent::new(AgentConfig::default(), llm, bus);
        agent.run_with_state(state(vec![])).await;

        let (ok, error) = finished.lock().clone().unwrap();
        assert!(!ok);
        assert!(error.unwrap().contains("retries exhausted"));
    }
}
