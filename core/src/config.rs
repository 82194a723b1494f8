use std::env;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Scheme and host every accepted link must start with.
    pub link_prefix: String,
    pub metadata_endpoint: String,
    pub user_agent: String,
    pub metadata_timeout: Duration,
    pub provider_timeout: Duration,
    pub download_timeout: Duration,
    pub canonical_extension: String,
    pub ytdlp_bin: String,
    pub search_results: u32,
    pub temp_dir: PathBuf,
    pub update_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            link_prefix: "https://open.spotify.com/".to_string(),
            metadata_endpoint: "https://spotipy-api.vercel.app/spotipy".to_string(),
            user_agent: "trackfetch/0.1".to_string(),
            metadata_timeout: Duration::from_secs(30),
            provider_timeout: Duration::from_secs(120),
            download_timeout: Duration::from_secs(600),
            canonical_extension: "mp3".to_string(),
            ytdlp_bin: "yt-dlp".to_string(),
            search_results: 5,
            temp_dir: env::temp_dir().join("trackfetch-thumbs"),
            update_interval: Duration::from_secs(60),
        }
    }
}

impl EngineConfig {
    /// Defaults overlaid with any `TRACKFETCH_*` variables present.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(value) = env::var("TRACKFETCH_LINK_PREFIX") {
            config.link_prefix = value;
        }
        if let Ok(value) = env::var("TRACKFETCH_METADATA_ENDPOINT") {
            config.metadata_endpoint = value;
        }
        if let Ok(value) = env::var("TRACKFETCH_YTDLP") {
            config.ytdlp_bin = value;
        }
        if let Ok(value) = env::var("TRACKFETCH_EXTENSION") {
            config.canonical_extension = value.trim_start_matches('.').to_string();
        }
        if let Ok(value) = env::var("TRACKFETCH_TEMP_DIR") {
            config.temp_dir = PathBuf::from(value);
        }
        if let Some(secs) = env_secs("TRACKFETCH_METADATA_TIMEOUT") {
            config.metadata_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_secs("TRACKFETCH_PROVIDER_TIMEOUT") {
            config.provider_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_secs("TRACKFETCH_DOWNLOAD_TIMEOUT") {
            config.download_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_secs("TRACKFETCH_UPDATE_INTERVAL") {
            config.update_interval = Duration::from_secs(secs.max(1));
        }
        config
    }
}

fn env_secs(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|value| value.trim().parse::<u64>().ok())
}
