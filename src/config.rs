use std::env;
use std::path::PathBuf;

use serenity::framework::standard::CommandError;

const DEFAULT_PREFIX: &str = "!";

pub struct Config {
    pub token: String,
    pub prefix: String,
    pub log_file: Option<PathBuf>,
    pub ytdlp_path: String,
    pub ffmpeg_path: String,
}

impl Config {
    /// Reads the settings from the environment, after loading `.env` if there is one.
    pub fn from_env() -> Result<Self, CommandError> {
        dotenvy::dotenv().ok();

        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, CommandError> {
        let non_empty = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let token = non_empty("DISCORD_TOKEN")
            .ok_or_else(|| CommandError::from("Expected DISCORD_TOKEN in the environment"))?;

        Ok(Self {
            token,
            prefix: non_empty("PREFIX").unwrap_or_else(|| DEFAULT_PREFIX.to_string()),
            log_file: non_empty("LOG_FILE").map(PathBuf::from),
            ytdlp_path: non_empty("YTDLP_PATH").unwrap_or_else(|| "yt-dlp".to_string()),
            ffmpeg_path: non_empty("FFMPEG_PATH").unwrap_or_else(|| "ffmpeg".to_string()),
        })
    }
}
