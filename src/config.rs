use crate::error::ConfigError;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_TOPIC_DESCRIPTION: &str =
    "Mahjong (the tile-based game), including strategy, rules, scoring, hand analysis and gameplay";

/// Which chat backend serves generation and classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Groq,
    Ollama,
}

impl FromStr for ProviderKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "groq" => Ok(ProviderKind::Groq),
            "ollama" => Ok(ProviderKind::Ollama),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GroqSettings {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
}

#[derive(Debug, Clone)]
pub struct OllamaSettings {
    pub base_url: String,
    pub model: String,
}

/// Process configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub server_host: String,
    pub server_port: u16,
    pub provider: ProviderKind,
    pub groq: Option<GroqSettings>,
    pub ollama: OllamaSettings,
    pub safety_model: String,
    pub relevance_model: String,
    pub max_requests_per_window: usize,
    pub rate_limit_window: Duration,
    pub blacklist_threshold: u32,
    pub classifier_timeout: Duration,
    pub generation_timeout: Duration,
    pub image_check_timeout: Duration,
    pub topic_name: String,
    pub topic_description: String,
    pub reference_doc_path: Option<String>,
    pub allowed_origins: Vec<String>,
    pub admin_api_enabled: bool,
    pub max_body_bytes: usize,
    pub log_json: bool,
}

impl Config {
    /// Load `.env` (if any) and read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let provider = match get("LLM_PROVIDER") {
            Some(raw) => raw.parse::<ProviderKind>().map_err(|_| ConfigError::Invalid {
                key: "LLM_PROVIDER",
                value: raw,
            })?,
            None => ProviderKind::Groq,
        };

        let ollama = OllamaSettings {
            base_url: get("OLLAMA_BASE_URL").unwrap_or_else(|| "http://localhost:11434".to_string()),
            model: get("OLLAMA_MODEL").unwrap_or_else(|| "minicpm-v:latest".to_string()),
        };

        let groq = match (provider, get("GROQ_API_KEY")) {
            (ProviderKind::Groq, None) => return Err(ConfigError::Missing("GROQ_API_KEY")),
            (_, Some(api_key)) => Some(GroqSettings {
                api_key,
                base_url: get("GROQ_BASE_URL")
                    .unwrap_or_else(|| "https://api.groq.com/openai/v1".to_string()),
                model: get("GROQ_MODEL").unwrap_or_else(|| {
                    "meta-llama/llama-4-scout-17b-16e-instruct".to_string()
                }),
            }),
            (ProviderKind::Ollama, None) => None,
        };

        let (default_safety, default_relevance) = match provider {
            ProviderKind::Groq => (
                "meta-llama/llama-prompt-guard-2-22m".to_string(),
                "llama-3.1-8b-instant".to_string(),
            ),
            ProviderKind::Ollama => (ollama.model.clone(), ollama.model.clone()),
        };

        let server_port = parse_or(&get, "SERVER_PORT", 8080u16)?;
        let allowed_origins = match get("ALLOWED_ORIGINS") {
            Some(raw) => raw
                .split(',')
                .map(|o| o.trim().to_string())
                .filter(|o| !o.is_empty())
                .collect(),
            None => vec![
                format!("http://localhost:{}", server_port),
                format!("http://127.0.0.1:{}", server_port),
            ],
        };

        Ok(Self {
            server_host: get("SERVER_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            server_port,
            provider,
            groq,
            ollama,
            safety_model: get("SAFETY_MODEL").unwrap_or(default_safety),
            relevance_model: get("RELEVANCE_MODEL").unwrap_or(default_relevance),
            max_requests_per_window: parse_or(&get, "MAX_REQUESTS_PER_MINUTE", 20usize)?,
            rate_limit_window: Duration::from_secs(parse_or(&get, "RATE_LIMIT_WINDOW", 60u64)?),
            blacklist_threshold: parse_or(&get, "BLACKLIST_THRESHOLD", 5u32)?,
            classifier_timeout: Duration::from_secs(parse_or(&get, "CLASSIFIER_TIMEOUT_SECS", 15u64)?),
            generation_timeout: Duration::from_secs(parse_or(&get, "GENERATION_TIMEOUT_SECS", 60u64)?),
            image_check_timeout: Duration::from_secs(parse_or(&get, "IMAGE_CHECK_TIMEOUT_SECS", 10u64)?),
            topic_name: get("TOPIC_NAME").unwrap_or_else(|| "Mahjong".to_string()),
            topic_description: get("TOPIC_DESCRIPTION")
                .unwrap_or_else(|| DEFAULT_TOPIC_DESCRIPTION.to_string()),
            reference_doc_path: get("REFERENCE_DOC_PATH"),
            allowed_origins,
            admin_api_enabled: parse_or(&get, "ADMIN_API_ENABLED", false)?,
            max_body_bytes: parse_or(&get, "MAX_BODY_BYTES", 16 * 1024 * 1024usize)?,
            log_json: get("LOG_FORMAT").is_some_and(|f| f.eq_ignore_ascii_case("json")),
        })
    }

    /// Read the optional reference document that parameterises the topic.
    pub fn load_reference_doc(&self) -> Result<Option<String>, ConfigError> {
        let Some(path) = &self.reference_doc_path else {
            return Ok(None);
        };
        std::fs::read_to_string(path)
            .map(Some)
            .map_err(|source| ConfigError::ReferenceDoc {
                path: path.clone(),
                source,
            })
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }
}

fn parse_or<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw.trim().parse::<T>().map_err(|_| ConfigError::Invalid { key, value: raw }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_with_groq_key() {
        let config = Config::from_lookup(lookup(&[("GROQ_API_KEY", "gsk_test")])).unwrap();

        assert_eq!(config.provider, ProviderKind::Groq);
        assert_eq!(config.max_requests_per_window, 20);
        assert_eq!(config.rate_limit_window, Duration::from_secs(60));
        assert_eq!(config.blacklist_threshold, 5);
        assert_eq!(config.generation_timeout, Duration::from_secs(60));
        assert_eq!(config.safety_model, "meta-llama/llama-prompt-guard-2-22m");
        assert_eq!(config.relevance_model, "llama-3.1-8b-instant");
        assert_eq!(config.bind_address(), "0.0.0.0:8080");
        assert!(!config.admin_api_enabled);
        assert_eq!(
            config.allowed_origins,
            vec!["http://localhost:8080", "http://127.0.0.1:8080"]
        );
    }

    #[test]
    fn test_missing_groq_key_is_fatal() {
        let err = Config::from_lookup(lookup(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("GROQ_API_KEY")));

        // blank counts as missing
        let err = Config::from_lookup(lookup(&[("GROQ_API_KEY", "  ")])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("GROQ_API_KEY")));
    }

    #[test]
    fn test_ollama_needs_no_key() {
        let config = Config::from_lookup(lookup(&[
            ("LLM_PROVIDER", "Ollama"),
            ("OLLAMA_MODEL", "llava:13b"),
        ]))
        .unwrap();

        assert_eq!(config.provider, ProviderKind::Ollama);
        assert!(config.groq.is_none());
        assert_eq!(config.safety_model, "llava:13b");
        assert_eq!(config.relevance_model, "llava:13b");
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let err = Config::from_lookup(lookup(&[
            ("GROQ_API_KEY", "k"),
            ("MAX_REQUESTS_PER_MINUTE", "twenty"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "MAX_REQUESTS_PER_MINUTE", .. }));

        let err = Config::from_lookup(lookup(&[("LLM_PROVIDER", "openai")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "LLM_PROVIDER", .. }));
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("GROQ_API_KEY", "k"),
            ("SERVER_PORT", "9000"),
            ("RATE_LIMIT_WINDOW", "30"),
            ("BLACKLIST_THRESHOLD", "3"),
            ("ALLOWED_ORIGINS", "https://a.example, https://b.example,"),
            ("ADMIN_API_ENABLED", "true"),
            ("LOG_FORMAT", "JSON"),
        ]))
        .unwrap();

        assert_eq!(config.server_port, 9000);
        assert_eq!(config.rate_limit_window, Duration::from_secs(30));
        assert_eq!(config.blacklist_threshold, 3);
        assert_eq!(config.allowed_origins, vec!["https://a.example", "https://b.example"]);
        assert!(config.admin_api_enabled);
        assert!(config.log_json);
    }

    #[test]
    fn test_missing_reference_doc_is_reported() {
        let config = Config::from_lookup(lookup(&[
            ("GROQ_API_KEY", "k"),
            ("REFERENCE_DOC_PATH", "/definitely/not/here.txt"),
        ]))
        .unwrap();
        assert!(matches!(
            config.load_reference_doc(),
            Err(ConfigError::ReferenceDoc { .. })
        ));
    }
}
