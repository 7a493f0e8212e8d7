//! Response assembly: reduces a dispatch outcome to one OpenAI-style choice.
//!
//! The last successful result wins. Fan-out results of one domain backend
//! are combined in call order. When the general model stood in for a domain
//! backend, or the budget cut the request short, a one-line note is appended
//! to the content. The streaming framer emits exactly the same text, so the
//! concatenated chunks equal the non-streamed message.

use chrono::Utc;
use uuid::Uuid;

use crate::backend_client::ReplyFinish;
use crate::orchestrator::DispatchOutcome;
use crate::protocol::{
    ChatCompletionChunk, ChatRequest, ChatResponse, Choice, ChunkChoice, Delta, FinishReason, Message, Role, Usage,
};
use crate::utils::TextUtils;

/// Content pieces of the final answer.
#[derive(Debug, Clone, PartialEq)]
pub struct Answer {
    /// What the backend(s) said, or the failure explanation.
    pub body: String,
    /// Routing and degradation notes appended after the body.
    pub notes: String,
    pub finish: FinishReason,
    /// Sum of backend-reported usage, if any backend reported it.
    pub reported_usage: Option<Usage>,
}

impl Answer {
    pub fn content(&self) -> String {
        format!("{}{}", self.body, self.notes)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ResponseAssembler;

impl ResponseAssembler {
    pub fn new() -> Self {
        Self
    }

    pub fn answer(&self, outcome: &DispatchOutcome) -> Answer {
        if outcome.all_failed() {
            return Self::failure_answer(outcome);
        }

        let successes: Vec<_> = outcome.successes().collect();
        let combined = successes.len() > 1 && successes.iter().all(|r| !r.is_fallback);
        let chosen: Vec<_> = if combined {
            successes
        } else {
            successes.into_iter().last().into_iter().collect()
        };

        let replies: Vec<_> = chosen.iter().filter_map(|r| r.reply.as_ref()).collect();
        let body = replies
            .iter()
            .map(|r| r.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        let finish = if replies.iter().any(|r| r.finish == ReplyFinish::Length) {
            FinishReason::Length
        } else {
            FinishReason::Stop
        };
        let reported_usage = replies
            .iter()
            .filter_map(|r| r.usage)
            .reduce(|a, b| a + b);

        let mut notes = String::new();
        if outcome.answered_by_fallback() {
            notes.push_str(&format!(
                "\n\n_Note: answered by the general scientific model because the {} was unavailable ({})._",
                outcome.primary_domain.label(),
                outcome.fallback_reason.as_deref().unwrap_or("no reason given")
            ));
        }
        if outcome.partial {
            let unfinished = outcome.results.iter().filter(|r| !r.success).count();
            let cause = if outcome.budget_exhausted() {
                format!("did not finish within the {:?} dispatch budget", outcome.budget)
            } else {
                "failed".to_string()
            };
            notes.push_str(&format!(
                "\n\n_Note: partial result; {} of {} backend calls {}._",
                unfinished,
                outcome.results.len(),
                cause
            ));
        }

        Answer {
            body,
            notes,
            finish,
            reported_usage,
        }
    }

    fn failure_answer(outcome: &DispatchOutcome) -> Answer {
        let reason = outcome
            .to_error()
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no backend produced an answer".to_string());

        if outcome.streamed {
            let received = outcome
                .results
                .iter()
                .rev()
                .find_map(|r| r.reply.as_ref())
                .map(|r| r.content.clone())
                .unwrap_or_default();
            return Answer {
                body: received,
                notes: format!("\n\n_Note: the response was interrupted ({})._", reason),
                finish: FinishReason::Error,
                reported_usage: None,
            };
        }

        Answer {
            body: format!(
                "Sorry, this request could not be answered. The {} and the general scientific model both failed: {}. Please try again later.",
                outcome.primary_domain.label(),
                reason
            ),
            notes: String::new(),
            finish: FinishReason::Error,
            reported_usage: None,
        }
    }

    pub fn usage(request: &ChatRequest, answer: &Answer) -> Usage {
        answer.reported_usage.unwrap_or_else(|| {
            let prompt = request
                .messages
                .iter()
                .map(|m| TextUtils::estimate_tokens(&m.content))
                .sum();
            Usage::new(prompt, TextUtils::estimate_tokens(&answer.content()))
        })
    }

    pub fn assemble(&self, request: &ChatRequest, outcome: &DispatchOutcome) -> ChatResponse {
        let answer = self.answer(outcome);
        let usage = Self::usage(request, &answer);
        ChatResponse {
            id: new_completion_id(),
            object: ChatResponse::OBJECT.to_string(),
            created: Utc::now().timestamp(),
            model: request.model.clone(),
            choices: vec![Choice {
                index: 0,
                message: Message::assistant(answer.content()),
                finish_reason: answer.finish,
            }],
            usage,
        }
    }
}

pub fn new_completion_id() -> String {
    format!("chatcmpl-{}", Uuid::new_v4().simple())
}

/// Frames one streamed completion into chunks sharing id and timestamp.
pub struct StreamFramer {
    id: String,
    created: i64,
    model: String,
    started: bool,
}

impl StreamFramer {
    pub fn new(request: &ChatRequest) -> Self {
        Self {
            id: new_completion_id(),
            created: Utc::now().timestamp(),
            model: request.model.clone(),
            started: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn chunk(&self, delta: Delta, finish_reason: Option<FinishReason>, usage: Option<Usage>) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: self.id.clone(),
            object: ChatCompletionChunk::OBJECT.to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
            usage,
        }
    }

    /// Content chunk. The first one also announces the assistant role.
    pub fn content(&mut self, text: &str) -> ChatCompletionChunk {
        let role = (!self.started).then_some(Role::Assistant);
        self.started = true;
        self.chunk(
            Delta {
                role,
                content: Some(text.to_string()),
            },
            None,
            None,
        )
    }

    /// Closing chunks once dispatch finished: any content not yet streamed,
    /// the notes, then an empty delta carrying finish reason and usage.
    pub fn finish(
        &mut self,
        assembler: &ResponseAssembler,
        request: &ChatRequest,
        outcome: &DispatchOutcome,
    ) -> Vec<ChatCompletionChunk> {
        let answer = assembler.answer(outcome);
        let mut tail = String::new();
        if !outcome.streamed {
            tail.push_str(&answer.body);
        }
        tail.push_str(&answer.notes);

        let mut chunks = Vec::with_capacity(2);
        if !tail.is_empty() || !self.started {
            chunks.push(self.content(&tail));
        }
        let usage = ResponseAssembler::usage(request, &answer);
        chunks.push(self.chunk(Delta::default(), Some(answer.finish), Some(usage)));
        chunks
    }
}
