use serde::Deserialize;

use crate::session::SessionType;

/// A protected backend service
#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    /// Service type, the second segment of the public path `/service/{index}/{type}`
    /// Example: "kontext", "treq"
    #[serde(rename = "type")]
    pub service_type: String,
    /// Base URL of the backend API
    /// Example: "http://127.0.0.1:9000/api"
    pub internal_url: String,
    /// Public URL of the service, used to rewrite redirects issued by the backend
    /// Default: None (redirects are passed through unchanged)
    #[serde(default)]
    pub external_url: Option<String>,
    /// Cookie used between API clients and the gateway
    /// Default: "" (frontend cookie disabled)
    #[serde(default)]
    pub external_session_cookie: String,
    /// Cookie used between the gateway and the backend (central authentication cookie)
    /// Default: "cnc_toolbar_sid"
    #[serde(default = "default_backend_cookie")]
    pub backend_session_cookie: String,
    /// Format of session cookie values
    /// Default: "cnc"
    #[serde(default)]
    pub session_type: SessionType,
    /// Send the session value to the backend as `X-Api-Key` instead of a cookie
    /// Default: false
    #[serde(default)]
    pub use_header_x_api_key: bool,
    /// Additional header carrying the resolved user id to the backend
    /// Default: None (only `X-Api-User` is sent)
    #[serde(default)]
    pub true_user_id_header: Option<String>,
    /// Per-client rate limits, only the first entry is applied
    /// Default: empty (no rate limiting)
    #[serde(default)]
    pub limits: Vec<Limit>,
    /// Backend request timeout in seconds
    /// Default: 60
    #[serde(default = "default_req_timeout")]
    pub req_timeout_secs: u64,
    /// Idle backend connection lifetime in seconds
    /// Default: 10
    #[serde(default = "default_idle_conn_timeout")]
    pub idle_conn_timeout_secs: u64,
    /// Include session cookies in the cache key
    /// Default: false
    #[serde(default)]
    pub caching_per_session: bool,
    /// Cache POST responses, keyed also by the request body
    /// Default: false
    #[serde(default)]
    pub cacheable_post: bool,
    /// Guard deciding request admission
    /// Default: null guard (admit everything)
    #[serde(default)]
    pub guard: GuardConfig,
    /// Central login endpoint, used for fallback re-authentication and login passthrough
    /// Default: None
    #[serde(default)]
    pub login: Option<LoginConfig>,
}

impl ServiceConfig {
    /// Public path prefix of the service.
    pub fn service_path(&self, index: usize) -> String {
        format!("/service/{index}/{}", self.service_type)
    }
}

/// Token bucket parameters
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct Limit {
    /// Number of requests allowed per checking interval
    pub req_per_time_threshold: u32,
    /// Length of the checking interval in seconds
    pub req_checking_interval_secs: u64,
    /// Maximum burst, 0 means the sustained per-second rate
    /// Default: 0
    #[serde(default)]
    pub burst_limit: u32,
}

/// Guard selection and guard specific parameters
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum GuardConfig {
    #[default]
    Null,
    /// Counting guard, delays clients exceeding a free request quota
    Default {
        /// Requests per IP served without delay within one cleanup interval
        /// Default: 10
        #[serde(default = "default_free_quota")]
        free_quota: u64,
        /// Interval after which request counters start over
        /// Default: 3600
        #[serde(default = "default_cleanup_interval")]
        cleanup_interval_secs: u64,
    },
    /// Session cookie lookup
    SessionMap {
        /// Admit requests whose session does not resolve to a user
        /// Default: false
        #[serde(default)]
        allow_anonymous: bool,
    },
    /// Central authentication cookie with fallback credentials
    CncAuth,
    /// Static API tokens
    Token {
        /// Header carrying the token
        /// Default: "X-Api-Key"
        #[serde(default = "default_token_header")]
        header: String,
        /// Accepted tokens
        tokens: Vec<TokenEntry>,
        /// Paths (relative to the service path) accessible without a token
        /// Default: empty
        #[serde(default)]
        excluded_paths: Vec<String>,
    },
    /// Statistical bot detection and IP bans
    Telemetry,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TokenEntry {
    /// SHA-256 hex digest of the token
    pub value: String,
    pub user_id: i64,
}

/// Central login endpoint accepting a form-encoded access token
#[derive(Debug, Deserialize, Clone)]
pub struct LoginConfig {
    pub url: String,
    /// Form field carrying the token
    /// Default: "personal_access_token"
    #[serde(default = "default_token_field")]
    pub token_field: String,
    /// Access token of the shared application account; requests rejected with 401
    /// are retried with the session obtained by it
    /// Default: None (no re-authentication)
    #[serde(default)]
    pub fallback_token: Option<String>,
    /// Expose the endpoint as `/service/{index}/{type}/login`, mapping the returned
    /// backend cookie to the frontend cookie name
    /// Default: false
    #[serde(default)]
    pub passthrough: bool,
}

fn default_backend_cookie() -> String {
    "cnc_toolbar_sid".to_string()
}

fn default_req_timeout() -> u64 {
    60
}

fn default_idle_conn_timeout() -> u64 {
    10
}

fn default_free_quota() -> u64 {
    10
}

fn default_cleanup_interval() -> u64 {
    3600
}

fn default_token_header() -> String {
    "X-Api-Key".to_string()
}

fn default_token_field() -> String {
    "personal_access_token".to_string()
}
