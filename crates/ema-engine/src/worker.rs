use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, instrument};

use ema_core::client::LlmClient;
use ema_core::errors::{ConfigurationError, InputValidationError};
use ema_core::events::{ActorEvent, EventKind};
use ema_core::messages::{BufferKind, BufferMessage, Content, Message, UserMessage};
use ema_core::stores::BufferStore;

use crate::agent::{Agent, AgentConfig, AgentState};
use crate::buffer::BufferChain;
use crate::bus::EventBus;
use crate::config::{ActorConfig, MEMORY_BUFFER_PLACEHOLDER, MEMORY_BUFFER_WINDOW};

/// Worker status. Strict transitions:
/// idle → preparing → running → idle, or running → preparing on
/// preemption.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActorStatus {
    Idle,
    Preparing,
    Running,
}

struct WorkerState {
    status: ActorStatus,
    queue: Vec<BufferMessage>,
    agent_state: Option<AgentState>,
    resume_after_abort: bool,
    processing: bool,
    /// Settled by the driver when the current run finishes; preempting
    /// callers subscribe and await it after aborting.
    run_done: Option<watch::Sender<bool>>,
    /// In-memory mirror of the buffer, newest last. The system prompt
    /// renders from here; the chain persists the same items.
    buffer: Vec<BufferMessage>,
}

struct WorkerInner {
    config: ActorConfig,
    agent: Agent,
    events: EventBus,
    chain: BufferChain,
    state: Mutex<WorkerState>,
    has_reply_this_run: AtomicBool,
}

/// Per-actor input-serialized work loop.
///
/// Inputs enqueue through `work`; a single-flight driver drains the
/// queue and runs the agent. New input during a run preempts it: the
/// in-flight conversation is resumed iff the user has not yet seen a
/// reply, otherwise a fresh run is seeded from the drained batch.
pub struct ActorWorker {
    inner: Arc<WorkerInner>,
}

impl ActorWorker {
    pub fn new(
        config: ActorConfig,
        llm: Arc<dyn LlmClient>,
        store: Arc<dyn BufferStore>,
        events: EventBus,
    ) -> Result<Self, ConfigurationError> {
        config.validate()?;

        let agent = Agent::new(
            AgentConfig {
                max_steps: config.max_steps,
                token_limit: config.token_limit,
            },
            llm,
            events.clone(),
        );
        let chain = BufferChain::new(config.actor_id.clone(), store);

        let inner = Arc::new(WorkerInner {
            config,
            agent,
            events: events.clone(),
            chain,
            state: Mutex::new(WorkerState {
                status: ActorStatus::Idle,
                queue: Vec::new(),
                agent_state: None,
                resume_after_abort: false,
                processing: false,
                run_done: None,
                buffer: Vec::new(),
            }),
            has_reply_this_run: AtomicBool::new(false),
        });

        // Reply interception: mark the run as replied *synchronously*
        // (the bus dispatches inline from the agent task) and chain the
        // actor's buffer entry.
        let weak = Arc::downgrade(&inner);
        events.subscribe(EventKind::EmaReplyReceived, move |event| {
            if let (Some(inner), ActorEvent::EmaReplyReceived { reply }) = (weak.upgrade(), event) {
                inner.has_reply_this_run.store(true, Ordering::SeqCst);
                let json = serde_json::to_string(reply).unwrap_or_default();
                let message = BufferMessage {
                    kind: BufferKind::Actor,
                    id: inner.config.actor_id.to_string(),
                    name: inner.config.actor_name.clone(),
                    contents: vec![Content::text(json)],
                    time: Utc::now(),
                };
                inner.state.lock().buffer.push(message.clone());
                inner.chain.push(message);
            }
        });

        Ok(Self { inner })
    }

    /// Submit a batch of user inputs.
    ///
    /// Validates, records the input in the buffer, and either starts
    /// the driver or preempts the in-flight run — in the latter case
    /// returning only after the aborted run has fully unwound. This is
    /// the only error surface of the worker; everything downstream
    /// reports via the event stream.
    #[instrument(skip_all, fields(actor_id = %self.inner.config.actor_id))]
    pub async fn work(&self, inputs: Vec<Content>) -> Result<(), InputValidationError> {
        if inputs.is_empty() {
            return Err(InputValidationError::Empty);
        }
        for content in &inputs {
            if !matches!(content, Content::Text { .. }) {
                return Err(InputValidationError::UnsupportedKind(
                    content.kind_name().into(),
                ));
            }
        }

        let message = BufferMessage {
            kind: BufferKind::User,
            id: self.inner.config.user_id.to_string(),
            name: self.inner.config.user_name.clone(),
            contents: inputs,
            time: Utc::now(),
        };

        enum NextStep {
            Preempt(Option<watch::Receiver<bool>>),
            Start,
            Noop,
        }

        let next = {
            let mut state = self.inner.state.lock();
            state.queue.push(message.clone());
            state.buffer.push(message.clone());
            self.inner.chain.push(message);

            if state.status != ActorStatus::Idle {
                // Resume the in-flight conversation only when the aborted
                // run has not shown the user a reply yet.
                state.resume_after_abort = !self.inner.has_reply_this_run.load(Ordering::SeqCst);
                let run_done = state.run_done.as_ref().map(watch::Sender::subscribe);
                NextStep::Preempt(run_done)
            } else if !state.processing {
                state.processing = true;
                state.status = ActorStatus::Preparing;
                NextStep::Start
            } else {
                NextStep::Noop
            }
        };

        match next {
            NextStep::Preempt(run_done) => {
                debug!("preempting in-flight run");
                self.inner.agent.abort();
                // Hand control back only once the aborted run's promise has
                // settled; the driver awaiting the same run resumes the
                // loop with the input just enqueued.
                if let Some(mut done) = run_done {
                    let _ = done.wait_for(|finished| *finished).await;
                }
            }
            NextStep::Start => {
                let inner = Arc::clone(&self.inner);
                tokio::spawn(async move {
                    WorkerInner::process_queue(inner).await;
                });
            }
            NextStep::Noop => {}
        }

        Ok(())
    }

    pub fn status(&self) -> ActorStatus {
        self.inner.state.lock().status
    }

    /// Abort the in-flight run without enqueueing new input.
    pub fn abort(&self) {
        self.inner.agent.abort();
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Wait until every buffer write enqueued so far has settled.
    pub async fn flush_buffer(&self) {
        self.inner.chain.flush().await;
    }
}

impl WorkerInner {
    /// Single-flight serial driver. Exactly one instance owns the loop
    /// at a time; `work` only enqueues (and aborts) while this runs.
    async fn process_queue(inner: Arc<WorkerInner>) {
        loop {
            let run_state = {
                let mut state = inner.state.lock();
                if state.queue.is_empty() {
                    state.processing = false;
                    state.status = ActorStatus::Idle;
                    break;
                }

                state.status = ActorStatus::Preparing;
                let batch: Vec<BufferMessage> = state.queue.drain(..).collect();

                let run_state = match state.agent_state.take() {
                    Some(mut preserved) if state.resume_after_abort => {
                        preserved
                            .messages
                            .extend(batch.iter().map(to_user_message));
                        preserved
                    }
                    _ => AgentState {
                        system_prompt: build_system_prompt(
                            &inner.config.system_prompt,
                            &state.buffer,
                        ),
                        messages: batch.iter().map(to_user_message).collect(),
                        tools: inner.config.base_tools.clone(),
                    },
                };

                state.resume_after_abort = false;
                inner.has_reply_this_run.store(false, Ordering::SeqCst);
                let (done_tx, _) = watch::channel(false);
                state.run_done = Some(done_tx);
                state.status = ActorStatus::Running;
                run_state
            };

            let finished_state = inner.agent.run_with_state(run_state).await;

            let mut state = inner.state.lock();
            if let Some(done) = state.run_done.take() {
                done.send_replace(true);
            }
            if state.resume_after_abort {
                // Preempted without a visible reply: keep the
                // conversation for the next iteration to extend.
                state.agent_state = Some(finished_state);
            } else {
                state.agent_state = None;
            }

            if state.queue.is_empty() && !state.resume_after_abort {
                state.processing = false;
                state.status = ActorStatus::Idle;
                break;
            }
            state.status = ActorStatus::Preparing;
        }
    }
}

fn to_user_message(message: &BufferMessage) -> Message {
    Message::User(UserMessage {
        contents: message.contents.clone(),
    })
}

/// Replace every `{MEMORY_BUFFER}` occurrence in the template with the
/// rendering of the last 10 buffer items, or `"None."` when empty.
pub fn build_system_prompt(template: &str, buffer: &[BufferMessage]) -> String {
    let rendered = if buffer.is_empty() {
        "None.".to_string()
    } else {
        let start = buffer.len().saturating_sub(MEMORY_BUFFER_WINDOW);
        buffer[start..]
            .iter()
            .map(BufferMessage::render_line)
            .collect::<Vec<_>>()
            .join("\n")
    };
    template.replace(MEMORY_BUFFER_PLACEHOLDER, &rendered)
}
