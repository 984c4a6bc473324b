//! Interactive question prompt: one or more grouped questions, each with
//! labeled options plus an implicit "other" freeform option, numbered
//! globally across the whole prompt. Selections are toggled over multiple
//! replies and finalized with `submit`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tokio::sync::{oneshot, Mutex};

use agent_relay_error::RelayError;

use crate::chat::{ChatClient, Embed, InboundMessage, MessageRef, ThreadId};
use crate::runtime::{InteractiveRequest, QuestionSpec};

const OTHER_LABEL: &str = "Other";
const PROMPT_COLOR: u32 = 0x5865F2;

/// Resolved answers, keyed by question header.
pub type Answers = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotKind {
    Option(usize),
    Other,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    question: usize,
    kind: SlotKind,
}

#[derive(Debug)]
struct QuestionState {
    spec: QuestionSpec,
    selected: BTreeSet<usize>,
    other_selected: bool,
    other_text: Option<String>,
    /// Whether the user interacted with this question at all. Untouched
    /// questions default to their first option on submit.
    touched: bool,
}

/// Outcome of applying one free-text reply to the prompt state.
#[derive(Debug)]
pub enum ReplyOutcome {
    /// State changed; re-render. `freeform` is true when the reply carried
    /// text worth keeping visible in the conversation.
    Updated { freeform: bool },
    Submitted(Answers),
    /// Unrecognized input; no state change.
    Hint(String),
}

/// Pure prompt state machine; rendering and futures live in
/// [`PendingInteractive`].
#[derive(Debug)]
pub struct InteractivePrompt {
    questions: Vec<QuestionState>,
    slots: Vec<Slot>,
    awaiting_other: Option<usize>,
}

impl InteractivePrompt {
    pub fn new(request: &InteractiveRequest) -> Self {
        let questions = request
            .questions
            .iter()
            .map(|spec| QuestionState {
                spec: spec.clone(),
                selected: BTreeSet::new(),
                other_selected: false,
                other_text: None,
                touched: false,
            })
            .collect::<Vec<_>>();
        let mut slots = Vec::new();
        for (qi, question) in questions.iter().enumerate() {
            for oi in 0..question.spec.options.len() {
                slots.push(Slot {
                    question: qi,
                    kind: SlotKind::Option(oi),
                });
            }
            slots.push(Slot {
                question: qi,
                kind: SlotKind::Other,
            });
        }
        Self {
            questions,
            slots,
            awaiting_other: None,
        }
    }

    pub fn apply_reply(&mut self, text: &str) -> ReplyOutcome {
        let trimmed = text.trim();

        if let Some(qi) = self.awaiting_other.take() {
            let question = &mut self.questions[qi];
            question.other_text = Some(trimmed.to_string());
            question.other_selected = true;
            question.touched = true;
            return ReplyOutcome::Updated { freeform: true };
        }

        if matches!(
            trimmed.to_ascii_lowercase().as_str(),
            "submit" | "done" | "confirm"
        ) {
            return ReplyOutcome::Submitted(self.resolve());
        }

        // `<number> <free text>`: toggle that option and, for "other"
        // options, store the text in the same step.
        let mut words = trimmed.splitn(2, char::is_whitespace);
        if let (Some(first), Some(rest)) = (words.next(), words.next()) {
            if let Ok(number) = first.trim_end_matches(',').parse::<usize>() {
                let rest = rest.trim();
                let rest_is_numbers = rest
                    .chars()
                    .all(|c| c.is_ascii_digit() || c == ',' || c.is_whitespace());
                if !rest.is_empty() && !rest_is_numbers {
                    return match self.toggle(number, Some(rest)) {
                        Ok(freeform) => ReplyOutcome::Updated { freeform },
                        Err(hint) => ReplyOutcome::Hint(hint),
                    };
                }
            }
        }

        // One or more numbers, comma/space separated.
        let tokens = trimmed
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|token| !token.is_empty())
            .collect::<Vec<_>>();
        if !tokens.is_empty() && tokens.iter().all(|token| token.parse::<usize>().is_ok()) {
            for token in tokens {
                let number = token.parse::<usize>().expect("validated above");
                if let Err(hint) = self.toggle(number, None) {
                    return ReplyOutcome::Hint(hint);
                }
            }
            return ReplyOutcome::Updated { freeform: false };
        }

        ReplyOutcome::Hint(format!(
            "Reply with option numbers (1-{}), `<number> <text>` for a custom answer, or `submit`.",
            self.slots.len()
        ))
    }

    /// Toggle the globally-numbered option. Returns whether freeform text
    /// was stored, or a hint string for out-of-range numbers.
    fn toggle(&mut self, number: usize, other_text: Option<&str>) -> Result<bool, String> {
        let slot = *self
            .slots
            .get(number.wrapping_sub(1))
            .ok_or_else(|| format!("Option {number} does not exist."))?;
        let question = &mut self.questions[slot.question];
        question.touched = true;
        let single = !question.spec.multi_select;

        match slot.kind {
            SlotKind::Option(oi) => {
                if question.selected.contains(&oi) {
                    question.selected.remove(&oi);
                } else {
                    if single {
                        question.selected.clear();
                        question.other_selected = false;
                        question.other_text = None;
                    }
                    question.selected.insert(oi);
                }
                Ok(false)
            }
            SlotKind::Other => {
                if let Some(text) = other_text {
                    if single {
                        question.selected.clear();
                    }
                    question.other_selected = true;
                    question.other_text = Some(text.to_string());
                    Ok(true)
                } else if question.other_selected {
                    question.other_selected = false;
                    question.other_text = None;
                    if self.awaiting_other == Some(slot.question) {
                        self.awaiting_other = None;
                    }
                    Ok(false)
                } else {
                    if single {
                        question.selected.clear();
                    }
                    question.other_selected = true;
                    self.awaiting_other = Some(slot.question);
                    Ok(false)
                }
            }
        }
    }

    /// Final header → answer map. Untouched questions fall back to their
    /// first option; touched questions join their toggled labels and any
    /// stored freeform text.
    pub fn resolve(&self) -> Answers {
        let mut answers = Answers::new();
        for question in &self.questions {
            let answer = if !question.touched {
                question
                    .spec
                    .options
                    .first()
                    .cloned()
                    .unwrap_or_default()
            } else {
                let mut parts = question
                    .selected
                    .iter()
                    .filter_map(|&oi| question.spec.options.get(oi).cloned())
                    .collect::<Vec<_>>();
                if question.other_selected {
                    if let Some(text) = question
                        .other_text
                        .as_ref()
                        .filter(|text| !text.is_empty())
                    {
                        parts.push(text.clone());
                    }
                }
                parts.join(", ")
            };
            answers.insert(question.spec.header.clone(), answer);
        }
        answers
    }

    /// Render the prompt body with global numbering and selection markers.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let mut number = 0usize;
        for (qi, question) in self.questions.iter().enumerate() {
            if qi > 0 {
                out.push('\n');
            }
            out.push_str(&format!(
                "**{}** — {}{}\n",
                question.spec.header,
                question.spec.text,
                if question.spec.multi_select {
                    " (multiple allowed)"
                } else {
                    ""
                }
            ));
            for (oi, option) in question.spec.options.iter().enumerate() {
                number += 1;
                let marker = if question.selected.contains(&oi) {
                    "☑"
                } else {
                    "☐"
                };
                out.push_str(&format!("{marker} `{number}` {option}\n"));
            }
            number += 1;
            let marker = if question.other_selected { "☑" } else { "☐" };
            let other = match (&self.awaiting_other, &question.other_text) {
                (Some(awaiting), _) if *awaiting == qi => {
                    format!("{OTHER_LABEL} — reply with your answer")
                }
                (_, Some(text)) if question.other_selected => {
                    format!("{OTHER_LABEL}: {text}")
                }
                _ => OTHER_LABEL.to_string(),
            };
            out.push_str(&format!("{marker} `{number}` {other}\n"));
        }
        out.push_str("\nReply with numbers to toggle, then `submit`.");
        out
    }
}

/// Auto-resolution used for backgrounded sessions: every question answers
/// with its first option, no UI is rendered.
pub fn auto_answers(request: &InteractiveRequest) -> Answers {
    let mut answers = Answers::new();
    for question in &request.questions {
        answers.insert(
            question.header.clone(),
            question.options.first().cloned().unwrap_or_default(),
        );
    }
    answers
}

/// A rendered prompt awaiting user replies. Stored on the session as the
/// single pending interactive prompt; the gate callback awaits the paired
/// receiver.
pub struct PendingInteractive {
    chat: Arc<dyn ChatClient>,
    thread_id: ThreadId,
    state: Mutex<InteractivePrompt>,
    message: Mutex<Option<MessageRef>>,
    resolver: Mutex<Option<oneshot::Sender<Answers>>>,
}

impl PendingInteractive {
    pub async fn open(
        chat: Arc<dyn ChatClient>,
        thread_id: ThreadId,
        request: &InteractiveRequest,
    ) -> Result<(Arc<Self>, oneshot::Receiver<Answers>), RelayError> {
        let state = InteractivePrompt::new(request);
        let embed = Embed::new(state.render())
            .titled("The agent has a question");
        let embed = Embed {
            color: Some(PROMPT_COLOR),
            ..embed
        };
        let message = chat.send_embed(&thread_id, &embed, &[]).await?;
        let (tx, rx) = oneshot::channel();
        let pending = Arc::new(Self {
            chat,
            thread_id,
            state: Mutex::new(state),
            message: Mutex::new(Some(message)),
            resolver: Mutex::new(Some(tx)),
        });
        Ok((pending, rx))
    }

    /// Apply one user reply. Returns true once the prompt has resolved.
    pub async fn handle_reply(&self, reply: &InboundMessage) -> Result<bool, RelayError> {
        let outcome = self.state.lock().await.apply_reply(&reply.text);
        match outcome {
            ReplyOutcome::Hint(hint) => {
                let _ = self.chat.send_text(&self.thread_id, &hint).await;
                Ok(false)
            }
            ReplyOutcome::Updated { freeform } => {
                self.rerender().await;
                if !freeform {
                    // Selection-only replies are clutter; freeform answers
                    // stay visible for conversational context.
                    let _ = self
                        .chat
                        .delete_message(&self.thread_id, reply.message)
                        .await;
                }
                Ok(false)
            }
            ReplyOutcome::Submitted(answers) => {
                let _ = self
                    .chat
                    .delete_message(&self.thread_id, reply.message)
                    .await;
                self.finalize(&answers).await;
                if let Some(tx) = self.resolver.lock().await.take() {
                    let _ = tx.send(answers);
                }
                Ok(true)
            }
        }
    }

    async fn rerender(&self) {
        let body = self.state.lock().await.render();
        let embed = Embed {
            title: Some("The agent has a question".to_string()),
            description: body,
            color: Some(PROMPT_COLOR),
            footer: None,
        };
        if let Some(message) = *self.message.lock().await {
            let _ = self
                .chat
                .edit_embed(&self.thread_id, message, &embed, &[])
                .await;
        }
    }

    async fn finalize(&self, answers: &Answers) {
        let summary = answers
            .iter()
            .map(|(header, answer)| format!("**{header}**: {answer}"))
            .collect::<Vec<_>>()
            .join("\n");
        let embed = Embed {
            title: Some("Answers submitted".to_string()),
            description: summary,
            color: Some(PROMPT_COLOR),
            footer: None,
        };
        if let Some(message) = *self.message.lock().await {
            let _ = self
                .chat
                .edit_embed(&self.thread_id, message, &embed, &[])
                .await;
        }
    }
}
