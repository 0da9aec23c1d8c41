use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    pub port: u16,
    pub upload_dir: String,
    pub output_dir: String,
    pub max_file_size: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FfmpegConfig {
    pub preset: String,
    pub crf: u8,
    pub pixel_format: String,
    pub audio_codec: String,
    pub thumbnail_width: u32,
    #[serde(default)]
    pub threads: Option<usize>, // None = auto-detect
    #[serde(default)]
    pub max_concurrent_transcodes: Option<usize>, // None = auto-detect
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngagementConfig {
    pub fan_out_concurrency: usize,
    pub comment_max_chars: usize,
    pub max_replies: usize,
    pub dislike_estimate_ratio: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExternalConfig {
    pub api_base_url: String,
    #[serde(default)]
    pub api_key: String,
    pub page_size: u32,
    pub request_timeout_secs: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SeedConfig {
    #[serde(default)]
    pub reactor_tokens_path: Option<String>,
    /// JSON array of stream sessions provisioned outside this service.
    #[serde(default)]
    pub streams_path: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LimitsConfig {
    pub cleanup_interval_seconds: u64,
    pub cleanup_max_age_seconds: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConfigFile {
    pub server: ServerConfig,
    pub ffmpeg: Option<FfmpegConfig>,
    pub engagement: Option<EngagementConfig>,
    pub external: Option<ExternalConfig>,
    pub seed: Option<SeedConfig>,
    pub limits: Option<LimitsConfig>,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub upload_dir: PathBuf,
    pub output_dir: PathBuf,
    pub max_file_size: u64,
    pub ffmpeg: FfmpegConfig,
    pub engagement: EngagementConfig,
    pub external: ExternalConfig,
    pub seed: SeedConfig,
    pub limits: LimitsConfig,
}

impl Default for FfmpegConfig {
    fn default() -> Self {
        Self {
            preset: "veryfast".to_string(),
            crf: 23,
            pixel_format: "yuv420p".to_string(),
            audio_codec: "aac".to_string(),
            thumbnail_width: 1280,
            threads: None,
            max_concurrent_transcodes: None,
        }
    }
}

impl FfmpegConfig {
    pub fn effective_threads(&self) -> usize {
        self.threads
            .filter(|&t| t > 0)
            .unwrap_or_else(|| num_cpus::get().saturating_sub(1).clamp(1, 8))
    }

    /// Each transcode already runs multi-threaded, so only a few at once.
    pub fn effective_transcodes(&self) -> usize {
        self.max_concurrent_transcodes
            .filter(|&t| t > 0)
            .unwrap_or_else(|| (num_cpus::get() / 4).clamp(1, 4))
    }
}

impl Default for EngagementConfig {
    fn default() -> Self {
        Self {
            fan_out_concurrency: 50,
            comment_max_chars: 2000,
            max_replies: 30,
            dislike_estimate_ratio: 0.1,
        }
    }
}

impl Default for ExternalConfig {
    fn default() -> Self {
        Self {
            api_base_url: "https://www.googleapis.com/youtube/v3".to_string(),
            api_key: String::new(),
            page_size: 30,
            request_timeout_secs: 30,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            cleanup_interval_seconds: 600,
            cleanup_max_age_seconds: 3600,
        }
    }
}

fn resolve_dir(base_dir: &Path, dir: String) -> PathBuf {
    let path = PathBuf::from(&dir);
    if path.is_absolute() {
        path
    } else {
        base_dir.join(path)
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let base_dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));

        let config_path = base_dir.join("config.toml");
        let config_file = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            Some(toml::from_str::<ConfigFile>(&content)?)
        } else {
            None
        };

        Ok(Self::resolve(&base_dir, config_file, |key| std::env::var(key).ok()))
    }

    /// Layers `env` over `file` over defaults.
    pub fn resolve(
        base_dir: &Path,
        file: Option<ConfigFile>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Self {
        let defaults = Self::default_in(base_dir);

        let port = env("PORT")
            .and_then(|p| p.parse().ok())
            .or_else(|| file.as_ref().map(|c| c.server.port))
            .unwrap_or(defaults.port);

        let upload_dir = env("UPLOAD_DIR")
            .or_else(|| file.as_ref().map(|c| c.server.upload_dir.clone()))
            .map(|d| resolve_dir(base_dir, d))
            .unwrap_or(defaults.upload_dir);

        let output_dir = env("OUTPUT_DIR")
            .or_else(|| file.as_ref().map(|c| c.server.output_dir.clone()))
            .map(|d| resolve_dir(base_dir, d))
            .unwrap_or(defaults.output_dir);

        let max_file_size = env("MAX_FILE_SIZE")
            .and_then(|v| v.parse().ok())
            .or_else(|| file.as_ref().map(|c| c.server.max_file_size))
            .unwrap_or(defaults.max_file_size);

        let mut ffmpeg = file
            .as_ref()
            .and_then(|c| c.ffmpeg.clone())
            .unwrap_or(defaults.ffmpeg);
        if let Some(n) = env("MAX_CONCURRENT_TRANSCODES").and_then(|v| v.parse().ok()) {
            ffmpeg.max_concurrent_transcodes = Some(n);
        }

        let engagement = file
            .as_ref()
            .and_then(|c| c.engagement.clone())
            .unwrap_or(defaults.engagement);

        let mut external = file
            .as_ref()
            .and_then(|c| c.external.clone())
            .unwrap_or(defaults.external);
        if let Some(url) = env("YOUTUBE_API_BASE_URL") {
            external.api_base_url = url;
        }
        if let Some(key) = env("GOOGLE_API_KEY") {
            external.api_key = key;
        }

        let mut seed = file
            .as_ref()
            .and_then(|c| c.seed.clone())
            .unwrap_or(defaults.seed);
        if let Some(path) = env("SEED_TOKENS_PATH") {
            seed.reactor_tokens_path = Some(path);
        }
        if let Some(path) = env("STREAMS_PATH") {
            seed.streams_path = Some(path);
        }

        let limits = file
            .as_ref()
            .and_then(|c| c.limits.clone())
            .unwrap_or(defaults.limits);

        Self {
            port,
            upload_dir,
            output_dir,
            max_file_size,
            ffmpeg,
            engagement,
            external,
            seed,
            limits,
        }
    }

    pub fn from_env() -> Self {
        Self::load().unwrap_or_else(|e| {
            eprintln!("Warning: Failed to load config: {}. Using defaults.", e);
            Self::default()
        })
    }

    pub fn default_in(base_dir: &Path) -> Self {
        Self {
            port: 3000,
            upload_dir: base_dir.join("uploads"),
            output_dir: base_dir.join("media"),
            max_file_size: 500 * 1024 * 1024,
            ffmpeg: FfmpegConfig::default(),
            engagement: EngagementConfig::default(),
            external: ExternalConfig::default(),
            seed: SeedConfig::default(),
            limits: LimitsConfig::default(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let base_dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self::default_in(&base_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_without_file_or_env() {
        let config = Config::resolve(Path::new("/srv"), None, |_| None);
        assert_eq!(config.port, 3000);
        assert_eq!(config.upload_dir, PathBuf::from("/srv/uploads"));
        assert_eq!(config.output_dir, PathBuf::from("/srv/media"));
        assert_eq!(config.engagement.fan_out_concurrency, 50);
        assert_eq!(config.engagement.comment_max_chars, 2000);
        assert_eq!(config.engagement.max_replies, 30);
        assert_eq!(config.external.page_size, 30);
    }

    #[test]
    fn test_env_overrides_file() {
        let file: ConfigFile = toml::from_str(
            r#"
            [server]
            port = 8080
            upload_dir = "tmp/in"
            output_dir = "/var/media"
            max_file_size = 1024

            [external]
            api_base_url = "http://file.example"
            api_key = "file-key"
            page_size = 20
            request_timeout_secs = 5
            "#,
        )
        .unwrap();

        let env: HashMap<&str, &str> =
            HashMap::from([("PORT", "9000"), ("GOOGLE_API_KEY", "env-key")]);
        let config = Config::resolve(Path::new("/srv"), Some(file), |k| {
            env.get(k).map(|v| v.to_string())
        });

        assert_eq!(config.port, 9000);
        assert_eq!(config.upload_dir, PathBuf::from("/srv/tmp/in"));
        assert_eq!(config.output_dir, PathBuf::from("/var/media"));
        assert_eq!(config.max_file_size, 1024);
        assert_eq!(config.external.api_base_url, "http://file.example");
        assert_eq!(config.external.api_key, "env-key");
        assert_eq!(config.external.page_size, 20);
    }

    #[test]
    fn test_explicit_thread_count_wins() {
        let ffmpeg = FfmpegConfig {
            threads: Some(3),
            ..FfmpegConfig::default()
        };
        assert_eq!(ffmpeg.effective_threads(), 3);
        assert!(FfmpegConfig::default().effective_threads() >= 1);
    }

    #[test]
    fn test_transcode_slots() {
        let defaults = FfmpegConfig::default();
        assert!((1..=4).contains(&defaults.effective_transcodes()));

        let config = Config::resolve(Path::new("/srv"), None, |k| {
            (k == "MAX_CONCURRENT_TRANSCODES").then(|| "3".to_string())
        });
        assert_eq!(config.ffmpeg.effective_transcodes(), 3);

        let zero = FfmpegConfig {
            max_concurrent_transcodes: Some(0),
            ..FfmpegConfig::default()
        };
        assert!(zero.effective_transcodes() >= 1);
    }
}
