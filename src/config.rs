/// Server-wide defaults, populated from environment variables.
///
/// Intentionally minimal: no TOML/YAML/dotenv parsing dependency is
/// introduced, matching the teacher's `CloudLLMConfig` philosophy of reading
/// the handful of settings this crate actually needs directly from the
/// process environment.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub default_model: Option<String>,
    pub default_temperature: f32,
    pub default_max_tokens: u32,
    pub default_top_p: f32,
    pub default_structured_output_model: Option<String>,
    pub skills_storage_dir: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            default_model: None,
            default_temperature: 0.7,
            default_max_tokens: 4096,
            default_top_p: 1.0,
            default_structured_output_model: None,
            skills_storage_dir: "./skills".to_string(),
        }
    }
}

impl ServerConfig {
    /// Reads `DEFAULT_MODEL`, `DEFAULT_TEMPERATURE`, `DEFAULT_MAX_TOKENS`,
    /// `DEFAULT_TOP_P`, `DEFAULT_STRUCTURED_OUTPUT_MODEL`, and
    /// `SKILLS_STORAGE_DIR` from the environment, falling back to defaults
    /// for anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = ServerConfig::default();
        ServerConfig {
            default_model: std::env::var("DEFAULT_MODEL").ok(),
            default_temperature: std::env::var("DEFAULT_TEMPERATURE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.default_temperature),
            default_max_tokens: std::env::var("DEFAULT_MAX_TOKENS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.default_max_tokens),
            default_top_p: std::env::var("DEFAULT_TOP_P")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.default_top_p),
            default_structured_output_model: std::env::var("DEFAULT_STRUCTURED_OUTPUT_MODEL").ok(),
            skills_storage_dir: std::env::var("SKILLS_STORAGE_DIR")
                .unwrap_or(defaults.skills_storage_dir),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_env_unset() {
        std::env::remove_var("DEFAULT_MODEL");
        std::env::remove_var("DEFAULT_TEMPERATURE");
        let cfg = ServerConfig::from_env();
        assert_eq!(cfg.default_temperature, 0.7);
        assert_eq!(cfg.skills_storage_dir, "./skills");
    }
}
