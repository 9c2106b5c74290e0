//! Credential and model resolution for text-generation providers.
//!
//! This is the only module that touches key files or provider environment
//! variables. Everything downstream receives already-resolved strings.
//!
//! Key lookup order: explicit override, provider env vars (in priority
//! order), then a single-line file in the user's home directory. Model lookup
//! order: explicit override, env override, single-line file, built-in default.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    OpenRouter,
    Gemini,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 2] = [ProviderKind::OpenRouter, ProviderKind::Gemini];

    pub fn name(&self) -> &'static str {
        match self {
            ProviderKind::OpenRouter => "openrouter",
            ProviderKind::Gemini => "gemini",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "openrouter" => Some(ProviderKind::OpenRouter),
            "gemini" | "google" => Some(ProviderKind::Gemini),
            _ => None,
        }
    }

    /// Environment variables holding the API key, highest priority first.
    pub fn key_env_vars(&self) -> &'static [&'static str] {
        match self {
            ProviderKind::OpenRouter => &["OPENROUTER_API_KEY"],
            ProviderKind::Gemini => &["GEMINI_API_KEY", "GOOGLE_API_KEY"],
        }
    }

    pub fn key_file_name(&self) -> &'static str {
        match self {
            ProviderKind::OpenRouter => ".api-openrouter",
            ProviderKind::Gemini => ".api-gemini",
        }
    }

    pub fn model_env_var(&self) -> &'static str {
        match self {
            ProviderKind::OpenRouter => "OPENROUTER_MODEL",
            ProviderKind::Gemini => "GEMINI_MODEL",
        }
    }

    pub fn model_file_name(&self) -> &'static str {
        match self {
            ProviderKind::OpenRouter => ".model-openrouter",
            ProviderKind::Gemini => ".model-gemini",
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            ProviderKind::OpenRouter => "openrouter/horizon-beta",
            ProviderKind::Gemini => "gemini-2.0-flash",
        }
    }

    pub fn base_url_env_var(&self) -> &'static str {
        match self {
            ProviderKind::OpenRouter => "OPENROUTER_BASE_URL",
            ProviderKind::Gemini => "GEMINI_BASE_URL",
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            ProviderKind::OpenRouter => "https://openrouter.ai/api/v1",
            ProviderKind::Gemini => "https://generativelanguage.googleapis.com/v1beta",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Where configuration values are read from. Swappable so the resolver can be
/// exercised without touching the real environment or home directory.
pub trait CredentialSource: Send + Sync {
    fn env(&self, key: &str) -> Option<String>;
    fn home_dir(&self) -> Option<PathBuf>;
    fn read_file(&self, path: &Path) -> Option<String>;
}

/// Process environment and real filesystem.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemSource;

impl CredentialSource for SystemSource {
    fn env(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }

    fn home_dir(&self) -> Option<PathBuf> {
        dirs::home_dir()
    }

    fn read_file(&self, path: &Path) -> Option<String> {
        std::fs::read_to_string(path).ok()
    }
}

/// Secret string that never prints its contents.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiKey(<redacted>)")
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KeySource {
    Explicit,
    Env(&'static str),
    File(PathBuf),
}

impl fmt::Display for KeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeySource::Explicit => f.write_str("config"),
            KeySource::Env(var) => write!(f, "env:{var}"),
            KeySource::File(path) => write!(f, "file:{}", path.display()),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ResolvedCredentials {
    pub provider: ProviderKind,
    pub api_key: ApiKey,
    pub model: String,
    pub key_source: KeySource,
}

/// Values set in configuration for one provider. They take precedence over
/// every other source.
#[derive(Clone, Debug, Default)]
pub struct ExplicitCredentials {
    pub api_key: Option<ApiKey>,
    pub model: Option<String>,
}

pub struct Resolver<S = SystemSource> {
    source: S,
    explicit: HashMap<ProviderKind, ExplicitCredentials>,
}

impl Resolver<SystemSource> {
    pub fn system() -> Self {
        Self::new(SystemSource)
    }
}

impl<S: CredentialSource> Resolver<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            explicit: HashMap::new(),
        }
    }

    /// Blank values are ignored, so an empty config entry falls through to
    /// the environment.
    pub fn with_explicit(mut self, provider: ProviderKind, explicit: ExplicitCredentials) -> Self {
        let explicit = ExplicitCredentials {
            api_key: explicit
                .api_key
                .and_then(|k| non_empty(k.0))
                .map(ApiKey::new),
            model: explicit.model.and_then(non_empty),
        };
        self.explicit.insert(provider, explicit);
        self
    }

    /// Returns `None` when no key is resolvable; the provider is then left out
    /// of dispatch entirely.
    pub fn resolve(&self, provider: ProviderKind) -> Option<ResolvedCredentials> {
        let (api_key, key_source) = self.resolve_key(provider)?;
        Some(ResolvedCredentials {
            provider,
            api_key,
            model: self.resolve_model(provider),
            key_source,
        })
    }

    pub fn resolve_model(&self, provider: ProviderKind) -> String {
        self.explicit
            .get(&provider)
            .and_then(|e| e.model.clone())
            .or_else(|| self.env_value(provider.model_env_var()))
            .or_else(|| self.file_value(provider.model_file_name()))
            .unwrap_or_else(|| provider.default_model().to_string())
    }

    pub fn base_url(&self, provider: ProviderKind) -> String {
        self.env_value(provider.base_url_env_var())
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|| provider.default_base_url().to_string())
    }

    fn resolve_key(&self, provider: ProviderKind) -> Option<(ApiKey, KeySource)> {
        if let Some(key) = self.explicit.get(&provider).and_then(|e| e.api_key.clone()) {
            return Some((key, KeySource::Explicit));
        }

        for var in provider.key_env_vars() {
            if let Some(v) = self.env_value(var) {
                return Some((ApiKey::new(v), KeySource::Env(var)));
            }
        }

        let path = self.source.home_dir()?.join(provider.key_file_name());
        let key = self.source.read_file(&path).and_then(non_empty)?;
        Some((ApiKey::new(key), KeySource::File(path)))
    }

    fn env_value(&self, key: &str) -> Option<String> {
        self.source.env(key).and_then(non_empty)
    }

    fn file_value(&self, file_name: &str) -> Option<String> {
        let path = self.source.home_dir()?.join(file_name);
        self.source.read_file(&path).and_then(non_empty)
    }
}

fn non_empty(raw: String) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
