//! Turns negative feedback into standing instructions.
//!
//! Each dissatisfied turn is sent to the model with an instruction-writing
//! prompt; the one-line answer is appended to a process-wide meta-prompt that
//! later chat calls receive as system context.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use crate::error::LlmResult;
use crate::llm::{ChatMessage, ChatProvider, CompletionRequest};

const INSTRUCTION_WRITER_PROMPT: &str = "\
You are an assistant tasked with taking in an instance of a user input and the \
corresponding assistant response where the user indicated they did not like the \
response. Think about the situation, determine what the problem was and what a \
better response would have been, then write an instruction that will make the \
AI respond better in the future.

IMPORTANT:
The instruction should be as concise as possible, ideally a simple one-liner. \
If the case needs more detail, provide it while staying concise.

Example: the user dislikes a response where the assistant uses JavaScript but \
the user prefers Python. You should write:
'- User prefers Python over JavaScript'

IMPORTANT:
The instruction is added to the user's meta prompt as is, so do not write any \
explanation. Your output must start with '- ' followed by the instruction and \
nothing else.

ONLY OUTPUT THE INSTRUCTION. START WITH THE DASH AND STOP IMMEDIATELY AFTER IT.";

pub struct MetaPromptAgent {
    client: Arc<dyn ChatProvider>,
    model: String,
    path: PathBuf,
    meta_prompt: AsyncMutex<String>,
}

impl MetaPromptAgent {
    pub fn new(client: Arc<dyn ChatProvider>, model: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self { client, model: model.into(), path: path.into(), meta_prompt: AsyncMutex::new(String::new()) }
    }

    /// Like [`MetaPromptAgent::new`], starting from the saved meta-prompt when the file exists.
    pub async fn open(client: Arc<dyn ChatProvider>, model: impl Into<String>, path: impl Into<PathBuf>) -> Result<Self> {
        let agent = Self::new(client, model, path);
        if agent.path.exists() {
            agent.load().await?;
            info!(path = %agent.path.display(), "meta prompt loaded");
        }
        Ok(agent)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn meta_prompt(&self) -> String {
        self.meta_prompt.lock().await.clone()
    }

    /// Asks the model for a corrective instruction, appends it to the
    /// meta-prompt and saves the file. Returns the instruction.
    pub async fn handle_feedback(&self, user_prompt: &str, assistant_response: &str, user_feedback: Option<&str>) -> Result<String> {
        let mut prompt = format!("User prompt: {user_prompt}\n\nAssistant response: {assistant_response}");
        if let Some(feedback) = user_feedback.filter(|f| !f.trim().is_empty()) {
            prompt.push_str(&format!("\n\nUser feedback: {feedback}"));
        }
        let instruction = self
            .ask(&prompt, Some(INSTRUCTION_WRITER_PROMPT))
            .await
            .context("instruction request failed")?;
        let instruction = instruction.trim().to_string();
        if instruction.is_empty() {
            warn!("model returned an empty instruction");
            return Ok(instruction);
        }
        {
            let mut meta = self.meta_prompt.lock().await;
            meta.push('\n');
            meta.push_str(&instruction);
        }
        self.save().await?;
        info!(%instruction, "meta prompt extended");
        Ok(instruction)
    }

    async fn ask(&self, prompt: &str, system: Option<&str>) -> LlmResult<String> {
        let mut messages = Vec::with_capacity(2);
        if let Some(s) = system {
            messages.push(ChatMessage::system(s));
        }
        messages.push(ChatMessage::user(prompt));
        let request = CompletionRequest { model: self.model.clone(), messages };
        self.client.complete(&request).await
    }

    pub async fn save(&self) -> Result<()> {
        let text = self.meta_prompt.lock().await.clone();
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, text)
            .await
            .with_context(|| format!("failed to write {}", self.path.display()))
    }

    pub async fn load(&self) -> Result<()> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        *self.meta_prompt.lock().await = text;
        Ok(())
    }
}
