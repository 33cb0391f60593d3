use std::path::PathBuf;

/// Runtime configuration, collected once at startup from environment
/// variables (a `.env` file is honored via dotenvy in `main`). Every knob
/// has a default so a bare `autocode serve` works out of the box.
#[derive(Debug, Clone)]
pub struct Config {
    pub api_host: String,
    pub api_port: u16,
    pub db_path: PathBuf,
    /// Base name for the durable task queues; each agent consumes
    /// `<queue_name>.<agent>`.
    pub queue_name: String,
    /// Redelivery budget before an envelope is dead-lettered.
    pub queue_max_attempts: u32,
    pub anthropic_api_key: Option<String>,
    pub anthropic_model: String,
    pub opencode_url: String,
    pub github_token: Option<String>,
    /// Origin allowed by CORS outside dev mode.
    pub frontend_url: String,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary lookup function. Unset or
    /// unparseable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        Self {
            api_host: get("AUTOCODE_API_HOST", "127.0.0.1"),
            api_port: lookup("AUTOCODE_API_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
            db_path: PathBuf::from(get("AUTOCODE_DB_PATH", ".autocode/autocode.db")),
            queue_name: get("AUTOCODE_QUEUE_NAME", "tickets"),
            queue_max_attempts: lookup("AUTOCODE_QUEUE_MAX_ATTEMPTS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            anthropic_api_key: lookup("ANTHROPIC_API_KEY").filter(|v| !v.is_empty()),
            anthropic_model: get("ANTHROPIC_MODEL", "claude-sonnet-4-20250514"),
            opencode_url: get("OPENCODE_URL", "http://localhost:4096"),
            github_token: lookup("GITHUB_TOKEN").filter(|v| !v.is_empty()),
            frontend_url: get("FRONTEND_URL", "http://localhost:3000"),
        }
    }

    pub fn claude_queue(&self) -> String {
        format!("{}.claude", self.queue_name)
    }

    pub fn opencode_queue(&self) -> String {
        format!("{}.opencode", self.queue_name)
    }
}
