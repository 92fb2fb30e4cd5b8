use std::path::PathBuf;
use std::time::Duration;

/// Agent configuration shared by the orchestrator and both transports
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub model: String,
    pub max_tokens: u32,
    /// Upper bound on turns per processed input, synthetic feedback
    /// turns included
    pub max_turns: u32,
    pub system_prompt: String,
    pub enable_thinking: bool,
    pub thinking_budget: u32,
    /// Base URL for the direct streaming API
    pub api_base_url: String,
    /// Explicit agent CLI binary; discovered when unset
    pub cli_path: Option<PathBuf>,
    pub permission_mode: String,
    /// Connection-establishment timeout
    pub connect_timeout: Duration,
    /// Per-read poll timeout inside the subprocess output loop
    pub read_timeout: Duration,
    /// Overall deadline for one send/receive exchange
    pub exchange_timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: "claude-sonnet-4".to_string(),
            max_tokens: 8192,
            max_turns: 10,
            system_prompt: String::new(),
            enable_thinking: false,
            thinking_budget: 4096,
            api_base_url: "https://api.anthropic.com".to_string(),
            cli_path: None,
            permission_mode: "bypassPermissions".to_string(),
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_millis(100),
            exchange_timeout: Duration::from_secs(300),
        }
    }
}

/// Assemble a system prompt by concatenating the given markdown files from
/// `dir`, separated by blank lines. Missing files are skipped.
pub fn load_system_prompt_dir(dir: &std::path::Path, files: &[&str]) -> String {
    let mut prompt = String::new();
    for name in files {
        let path = dir.join(name);
        match std::fs::read_to_string(&path) {
            Ok(content) => {
                if !prompt.is_empty() {
                    prompt.push_str("\n\n");
                }
                prompt.push_str(&content);
                log::debug!("loaded prompt file {} ({} chars)", path.display(), content.len());
            }
            Err(_) => {
                log::debug!("prompt file not found: {}", path.display());
            }
        }
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let config = AgentConfig::default();
        assert!(config.max_turns > 0);
        assert!(config.read_timeout < config.exchange_timeout);
        assert!(config.api_base_url.starts_with("https://"));
    }

    #[test]
    fn test_load_system_prompt_skips_missing_files() {
        let dir = std::env::temp_dir().join(format!("prompt-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("A.md"), "alpha").unwrap();
        std::fs::write(dir.join("C.md"), "gamma").unwrap();

        let prompt = load_system_prompt_dir(&dir, &["A.md", "B.md", "C.md"]);
        assert_eq!(prompt, "alpha\n\ngamma");

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
