use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;

/// Connection settings for one OpenAI-compatible endpoint.
#[derive(Clone, Debug)]
pub struct LlmEndpoint {
	pub base_url: String,
	pub api_key: String,
	pub model: String,
}

#[derive(Clone, Debug)]
pub struct Config {
	pub bind: SocketAddr,
	pub data_dir: PathBuf,
	pub memory_file: PathBuf,
	pub meta_prompt_file: PathBuf,
	pub seed_dataset: Option<PathBuf>,
	pub chat: LlmEndpoint,
	pub meta: LlmEndpoint,
	pub llm_timeout: Duration,
	pub stream_delay: Duration,
	pub feedback_threshold: f32,
	pub retrieval_top_k: usize,
	pub graph_link_threshold: f32,
	pub auto_meta_feedback: bool,
}

impl Config {
	pub fn load() -> anyhow::Result<Self> {
		let _ = dotenvy::dotenv();
		let port = std::env::var("PORT").ok().and_then(|p| p.parse::<u16>().ok());
		let bind = if let Some(p) = port { format!("127.0.0.1:{}", p) } else { std::env::var("HTTP_BIND").unwrap_or_else(|_| "127.0.0.1:8000".to_string()) };
		let bind: SocketAddr = bind.parse().with_context(|| format!("invalid bind address {bind}"))?;
		let data_dir = PathBuf::from(std::env::var("DATA_DIR").unwrap_or_else(|_| "./data".to_string()));
		Ok(Self::from_env(bind, data_dir))
	}

	/// Builds the config for an already-resolved bind address and data directory,
	/// reading every other knob from the environment.
	pub fn from_env(bind: SocketAddr, data_dir: PathBuf) -> Self {
		let memory_file = env_path("SESSION_MEMORY_FILE").unwrap_or_else(|| data_dir.join("session_memory.json"));
		let meta_prompt_file = env_path("META_PROMPT_FILE").unwrap_or_else(|| data_dir.join("meta_prompt.txt"));
		let chat_key = std::env::var("OPENAI_API_KEY").unwrap_or_default();
		let chat = LlmEndpoint {
			base_url: std::env::var("LLM_BASE_URL").unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
			api_key: chat_key.clone(),
			model: std::env::var("DEFAULT_MODEL").unwrap_or_else(|_| "gpt-3.5-turbo".to_string()),
		};
		let meta_key = std::env::var("META_LLM_API_KEY")
			.or_else(|_| std::env::var("LLAMA_API_KEY"))
			.unwrap_or(chat_key);
		let meta = LlmEndpoint {
			base_url: std::env::var("META_LLM_BASE_URL").unwrap_or_else(|_| "https://api.llama.com/compat/v1".to_string()),
			api_key: meta_key,
			model: std::env::var("META_MODEL").unwrap_or_else(|_| "Llama-4-Maverick-17B-128E-Instruct-FP8".to_string()),
		};
		Self {
			bind,
			memory_file,
			meta_prompt_file,
			seed_dataset: env_path("SEED_DATASET"),
			data_dir,
			chat,
			meta,
			llm_timeout: Duration::from_secs(env_parse("LLM_TIMEOUT_SECS").unwrap_or(120)),
			stream_delay: Duration::from_millis(env_parse("STREAM_DELAY_MS").unwrap_or(10)),
			feedback_threshold: env_parse("FEEDBACK_THRESHOLD").unwrap_or(crate::feedback::DEFAULT_THRESHOLD),
			retrieval_top_k: env_parse("RETRIEVAL_TOP_K").unwrap_or(5),
			graph_link_threshold: env_parse("GRAPH_LINK_THRESHOLD").unwrap_or(0.5),
			auto_meta_feedback: env_parse("AUTO_META_FEEDBACK").unwrap_or(false),
		}
	}

	pub fn ensure_dirs(&self) -> anyhow::Result<()> {
		std::fs::create_dir_all(&self.data_dir)
			.with_context(|| format!("failed to create data dir {}", self.data_dir.display()))?;
		for file in [&self.memory_file, &self.meta_prompt_file] {
			if let Some(parent) = file.parent().filter(|p| !p.as_os_str().is_empty()) {
				std::fs::create_dir_all(parent)?;
			}
		}
		Ok(())
	}
}

fn env_path(key: &str) -> Option<PathBuf> {
	std::env::var(key).ok().filter(|v| !v.trim().is_empty()).map(PathBuf::from)
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
	std::env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}
