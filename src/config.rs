use chrono_tz::Tz;
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};

/// Errors that can occur when loading configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to read the config file.
    ReadFile { path: PathBuf, source: std::io::Error },
    /// Failed to parse JSON.
    ParseJson { path: PathBuf, source: serde_json::Error },
    /// Validation error.
    Validation(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadFile { path, source } => {
                write!(f, "failed to read config file '{}': {}", path.display(), source)
            }
            Self::ParseJson { path, source } => {
                write!(f, "failed to parse config file '{}': {}", path.display(), source)
            }
            Self::Validation(msg) => write!(f, "config validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ReadFile { source, .. } => Some(source),
            Self::ParseJson { source, .. } => Some(source),
            Self::Validation(_) => None,
        }
    }
}

/// How the tarot card asset is delivered to the chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardMedia {
    Photo,
    Animation,
}

#[derive(Deserialize)]
struct ConfigFile {
    telegram_bot_token: String,
    openai_api_key: String,
    /// IANA timezone name used to evaluate the reveal day (e.g. "Asia/Bangkok").
    /// Falls back to host-local time when unset.
    timezone: Option<String>,
    /// Timeout for LLM API calls in seconds.
    #[serde(default = "default_request_timeout_secs")]
    request_timeout_secs: u64,
    /// "photo" or "animation" for the card asset.
    card_media: Option<String>,
    fallback_card_image: Option<String>,
    fallback_meme_image: Option<String>,
    /// Chat model used for text classification.
    text_model: Option<String>,
    /// Audio-capable chat model used for voice analysis.
    audio_model: Option<String>,
    /// Directory for state files (logs). Defaults to current directory.
    data_dir: Option<String>,
}

fn default_request_timeout_secs() -> u64 {
    30
}

const DEFAULT_CARD_IMAGE: &str =
    "https://res.cloudinary.com/dy0x2zlmm/image/upload/v1734619457/q0ijgklymbjpp3efplna.jpg";
const DEFAULT_MEME_IMAGE: &str =
    "https://media1.giphy.com/media/hECJDGJs4hQjjWLqRV/giphy.gif";

pub struct Config {
    pub telegram_bot_token: String,
    pub openai_api_key: String,
    /// Reveal-day reference zone; None means host-local.
    pub timezone: Option<Tz>,
    pub request_timeout_secs: u64,
    pub card_media: CardMedia,
    pub fallback_card_image: String,
    pub fallback_meme_image: String,
    pub text_model: String,
    pub audio_model: String,
    pub data_dir: PathBuf,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config_path = path.as_ref().to_path_buf();
        let content = std::fs::read_to_string(&config_path)
            .map_err(|e| ConfigError::ReadFile { path: config_path.clone(), source: e })?;
        let file: ConfigFile = serde_json::from_str(&content)
            .map_err(|e| ConfigError::ParseJson { path: config_path.clone(), source: e })?;

        if file.telegram_bot_token.is_empty() {
            return Err(ConfigError::Validation("telegram_bot_token is required".into()));
        }
        // Telegram tokens are formatted as {bot_id}:{secret} where bot_id is numeric
        let token_parts: Vec<&str> = file.telegram_bot_token.split(':').collect();
        if token_parts.len() != 2 || token_parts[0].parse::<u64>().is_err() || token_parts[1].is_empty() {
            return Err(ConfigError::Validation(
                "telegram_bot_token appears invalid (expected format: 123456789:ABCdefGHI...)".into(),
            ));
        }
        if file.openai_api_key.is_empty() {
            return Err(ConfigError::Validation("openai_api_key is required".into()));
        }

        let timezone = match file.timezone {
            Some(name) => Some(name.parse::<Tz>().map_err(|_| {
                ConfigError::Validation(format!("unknown timezone '{}'", name))
            })?),
            None => None,
        };

        let card_media = match file.card_media.as_deref() {
            None | Some("photo") => CardMedia::Photo,
            Some("animation") => CardMedia::Animation,
            Some(other) => {
                return Err(ConfigError::Validation(format!(
                    "card_media must be \"photo\" or \"animation\", got '{}'",
                    other
                )));
            }
        };

        if file.request_timeout_secs == 0 {
            return Err(ConfigError::Validation("request_timeout_secs must be positive".into()));
        }

        let data_dir = file
            .data_dir
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));

        Ok(Self {
            telegram_bot_token: file.telegram_bot_token,
            openai_api_key: file.openai_api_key,
            timezone,
            request_timeout_secs: file.request_timeout_secs,
            card_media,
            fallback_card_image: file
                .fallback_card_image
                .unwrap_or_else(|| DEFAULT_CARD_IMAGE.to_string()),
            fallback_meme_image: file
                .fallback_meme_image
                .unwrap_or_else(|| DEFAULT_MEME_IMAGE.to_string()),
            text_model: file.text_model.unwrap_or_else(|| "gpt-4o".to_string()),
            audio_model: file
                .audio_model
                .unwrap_or_else(|| "gpt-4o-audio-preview".to_string()),
            data_dir,
        })
    }
}
