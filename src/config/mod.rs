use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Optional for worker processes.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Externally reachable base URL, used to build provider callback URLs.
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,

    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string for the job queue
    pub redis_url: String,

    /// Which generation provider the worker dispatches to ("gemini" or "kling")
    #[serde(default = "default_provider")]
    pub provider: String,

    /// Gemini API key (synchronous provider)
    #[serde(default)]
    pub gemini_api_key: String,

    #[serde(default = "default_gemini_base_url")]
    pub gemini_base_url: String,

    #[serde(default = "default_gemini_model")]
    pub gemini_model: String,

    /// Hard timeout for a synchronous generation call, in seconds.
    #[serde(default = "default_gemini_timeout_secs")]
    pub gemini_timeout_secs: u64,

    /// Kling API key (asynchronous provider)
    #[serde(default)]
    pub kling_api_key: String,

    #[serde(default = "default_kling_base_url")]
    pub kling_base_url: String,

    /// R2 bucket name
    pub r2_bucket: String,

    /// R2 access key ID (S3-compatible)
    pub r2_access_key: String,

    /// R2 secret access key (S3-compatible)
    pub r2_secret_key: String,

    /// R2 endpoint URL
    pub r2_endpoint: String,

    /// Simultaneous handler invocations per worker process.
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    /// Rolling-window rate limit shared across the whole pool.
    #[serde(default = "default_rate_limit_max")]
    pub rate_limit_max: usize,

    #[serde(default = "default_rate_limit_window_secs")]
    pub rate_limit_window_secs: u64,

    /// Retry budget per job.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i32,

    /// Base delay for exponential backoff, in milliseconds.
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Thumbnail edge sizes generated after a successful job.
    #[serde(default = "default_thumbnail_sizes")]
    pub thumbnail_sizes: Vec<u32>,

    /// Lease duration before an active queue entry is considered stalled.
    #[serde(default = "default_stall_timeout_secs")]
    pub stall_timeout_secs: u64,

    /// Age after which a job still `processing` is swept to failed.
    #[serde(default = "default_stuck_job_max_age_secs")]
    pub stuck_job_max_age_secs: u64,

    /// TTL for presigned artifact download URLs.
    #[serde(default = "default_download_url_ttl_secs")]
    pub download_url_ttl_secs: u32,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_public_base_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_provider() -> String {
    "gemini".to_string()
}

fn default_gemini_base_url() -> String {
    "https://generativelanguage.googleapis.com".to_string()
}

fn default_gemini_model() -> String {
    "gemini-2.0-flash-preview-image-generation".to_string()
}

fn default_gemini_timeout_secs() -> u64 {
    120
}

fn default_kling_base_url() -> String {
    "https://api.klingai.com".to_string()
}

fn default_worker_concurrency() -> usize {
    4
}

fn default_rate_limit_max() -> usize {
    10
}

fn default_rate_limit_window_secs() -> u64 {
    60
}

fn default_max_attempts() -> i32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    30_000
}

fn default_thumbnail_sizes() -> Vec<u32> {
    vec![256, 512]
}

fn default_stall_timeout_secs() -> u64 {
    120
}

fn default_stuck_job_max_age_secs() -> u64 {
    1800
}

fn default_download_url_ttl_secs() -> u32 {
    3600
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_fields_are_absent() {
        let cfg: AppConfig = envy::from_iter(vec![
            ("DATABASE_URL".to_string(), "postgres://localhost/x".to_string()),
            ("REDIS_URL".to_string(), "redis://localhost".to_string()),
            ("R2_BUCKET".to_string(), "bucket".to_string()),
            ("R2_ACCESS_KEY".to_string(), "ak".to_string()),
            ("R2_SECRET_KEY".to_string(), "sk".to_string()),
            ("R2_ENDPOINT".to_string(), "https://r2.example.com".to_string()),
        ])
        .expect("config should parse with only required fields");

        assert_eq!(cfg.bind_addr, "0.0.0.0:3000");
        assert_eq!(cfg.max_attempts, 3);
        assert_eq!(cfg.retry_base_delay_ms, 30_000);
        assert_eq!(cfg.thumbnail_sizes, vec![256, 512]);
        assert_eq!(cfg.provider, "gemini");
        assert_eq!(cfg.gemini_timeout_secs, 120);
    }

    #[test]
    fn thumbnail_sizes_parse_from_comma_list() {
        let cfg: AppConfig = envy::from_iter(vec![
            ("DATABASE_URL".to_string(), "postgres://localhost/x".to_string()),
            ("REDIS_URL".to_string(), "redis://localhost".to_string()),
            ("R2_BUCKET".to_string(), "bucket".to_string()),
            ("R2_ACCESS_KEY".to_string(), "ak".to_string()),
            ("R2_SECRET_KEY".to_string(), "sk".to_string()),
            ("R2_ENDPOINT".to_string(), "https://r2.example.com".to_string()),
            ("THUMBNAIL_SIZES".to_string(), "128,640".to_string()),
        ])
        .expect("config should parse");

        assert_eq!(cfg.thumbnail_sizes, vec![128, 640]);
    }
}
