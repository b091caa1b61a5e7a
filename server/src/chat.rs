//! Prompt assembly and reply streaming for the chat endpoint.

use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{error, warn};

use crate::llm::{ChatMessage, TextStream};
use crate::session::Session;
use crate::store::SessionStore;

/// Content of the most recent user message.
pub fn last_user_question(messages: &[ChatMessage]) -> Option<&str> {
    messages
        .iter()
        .rev()
        .find(|m| m.role == "user")
        .map(|m| m.content.as_str())
        .filter(|c| !c.trim().is_empty())
}

/// Renders a stored session as a system-side context block: its transcript
/// and final code, verbatim.
pub fn render_hidden_context(session: &Session) -> String {
    let mut out = String::new();
    out.push_str("The following is a previous conversation about a similar problem that you solved. ");
    out.push_str("Use it as background when it helps; do not mention it to the user.\n\n");
    out.push_str(&format!("Original question: {}\n", session.initial_question));
    for (i, turn) in session.question_chain.iter().enumerate() {
        out.push_str(&format!("\n[Turn {}]\nUser: {}\nAssistant: {}\n", i + 1, turn.q, turn.a));
    }
    if !session.final_code.trim().is_empty() {
        out.push_str("\nFinal code:\n```\n");
        out.push_str(&session.final_code);
        if !session.final_code.ends_with('\n') {
            out.push('\n');
        }
        out.push_str("```\n");
    }
    out
}

/// Upstream message list: the system prompt and meta-prompt share one system
/// message, the hidden context follows as its own, then the client messages.
pub fn compose_messages(
    system_prompt: Option<&str>,
    meta_prompt: &str,
    hidden_context: Option<&str>,
    messages: &[ChatMessage],
) -> Vec<ChatMessage> {
    let mut out = Vec::with_capacity(messages.len() + 2);
    let system_prompt = system_prompt.map(str::trim).filter(|s| !s.is_empty());
    let meta_prompt = meta_prompt.trim();
    match (system_prompt, meta_prompt.is_empty()) {
        (Some(sys), false) => out.push(ChatMessage::system(format!("{sys}\n\n{meta_prompt}"))),
        (Some(sys), true) => out.push(ChatMessage::system(sys)),
        (None, false) => out.push(ChatMessage::system(meta_prompt)),
        (None, true) => {}
    }
    if let Some(ctx) = hidden_context.filter(|c| !c.is_empty()) {
        out.push(ChatMessage::system(ctx));
    }
    out.extend(messages.iter().cloned());
    out
}

/// Where a finished reply is recorded.
pub struct TurnRecorder {
    pub store: Arc<AsyncMutex<SessionStore>>,
    pub session_id: String,
    pub question: String,
}

impl TurnRecorder {
    async fn record(self, answer: String) {
        let mut store = self.store.lock().await;
        if let Err(e) = store.record_turn(&self.session_id, &self.question, &answer) {
            warn!(session_id = %self.session_id, error = %e, "reply finished for a session that is no longer active");
        }
    }
}

/// Re-emits the upstream reply one character at a time with `delay` between
/// characters. The turn is recorded only once the upstream reply is complete;
/// an upstream error aborts the body and nothing is recorded.
pub fn char_stream(
    mut upstream: TextStream,
    delay: Duration,
    recorder: TurnRecorder,
) -> impl Stream<Item = Result<String, std::io::Error>> + Send + 'static {
    async_stream::stream! {
        let mut full = String::new();
        while let Some(chunk) = upstream.next().await {
            let text = match chunk {
                Ok(text) => text,
                Err(e) => {
                    error!(session_id = %recorder.session_id, error = %e, "upstream stream failed");
                    yield Err(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()));
                    return;
                }
            };
            for ch in text.chars() {
                full.push(ch);
                yield Ok(ch.to_string());
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
        }
        recorder.record(full).await;
    }
}
