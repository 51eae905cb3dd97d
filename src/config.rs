use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::auth::SessionPolicy;

/// Upper bound for JWT_EXPIRES_MINUTES (one year)
const MAX_TOKEN_LIFETIME_MINUTES: u64 = 525_600;

/// Session Keeper - authenticated API client with silent token renewal
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Base URL of the API (login, refresh and proxied requests)
    #[arg(short = 'a', long, env = "API_URL", default_value = "http://localhost:4000")]
    pub api_url: String,

    /// Base URL of the log collection proxy (/api/errors, /api/info)
    #[arg(long, env = "LOG_PROXY_URL")]
    pub log_proxy_url: Option<String>,

    /// Also ship info messages to the log proxy
    #[arg(long, env = "VERBOSE", default_value_t = false, action = clap::ArgAction::Set)]
    pub verbose: bool,

    /// Seconds before expiry at which to refresh (or log out)
    #[arg(long, env = "JWT_AUTO_REFRESH_SECONDS", default_value = "60")]
    pub refresh_margin: u64,

    /// Renew silently before expiry; when false the session is ended instead
    #[arg(long, env = "JWT_AUTO_REFRESH", default_value_t = true, action = clap::ArgAction::Set)]
    pub auto_refresh: bool,

    /// Lifetime of tokens issued in mock mode, in minutes
    #[arg(long, env = "JWT_EXPIRES_MINUTES", default_value = "60")]
    pub token_lifetime: u64,

    /// Authenticate against a local mock instead of the API
    #[arg(long, env = "USE_MOCK_AUTH", default_value_t = false, action = clap::ArgAction::Set)]
    pub mock_auth: bool,

    /// Username accepted in mock mode
    #[arg(long, env = "AUTH_MOCK_USER")]
    pub mock_user: Option<String>,

    /// Password accepted in mock mode
    #[arg(long, env = "AUTH_MOCK_PASS", hide_env_values = true)]
    pub mock_pass: Option<String>,

    /// Username to log in with (prompted when missing)
    #[arg(short = 'u', long, env = "AUTH_USERNAME")]
    pub username: Option<String>,

    /// Password to log in with (prompted when missing)
    #[arg(long, env = "AUTH_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// SQLite file to persist tokens in (memory only when unset)
    #[arg(short = 's', long, env = "SESSION_STORE_FILE")]
    pub store_file: Option<String>,

    /// Path to GET through the gateway after login (repeatable)
    #[arg(short = 'f', long = "fetch")]
    pub fetch: Vec<String>,

    /// HTTP request timeout in seconds
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT", default_value = "30")]
    pub http_timeout: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, env = "LOG_JSON", default_value_t = false, action = clap::ArgAction::Set)]
    pub log_json: bool,
}

#[derive(Clone, Debug)]
pub struct Config {
    // Endpoints
    pub api_url: String,
    pub log_proxy_url: Option<String>,
    pub verbose: bool,

    // Session policy
    pub refresh_margin: u64,
    pub auto_renewal: bool,
    pub access_token_lifetime_minutes: u64,

    // Mock authentication
    pub mock_auth: bool,
    pub mock_user: Option<String>,
    pub mock_pass: Option<String>,

    // Login
    pub username: Option<String>,
    pub password: Option<String>,

    // Storage
    pub store_file: Option<PathBuf>,

    // Client
    pub fetch: Vec<String>,
    pub http_timeout: u64,
    pub log_level: String,
    pub log_json: bool,
}

impl Config {
    /// Load configuration from all sources with priority: CLI > ENV > defaults
    pub fn load() -> Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        Ok(Self::from_args(CliArgs::parse()))
    }

    pub fn from_args(args: CliArgs) -> Self {
        Config {
            api_url: args.api_url,
            log_proxy_url: args.log_proxy_url.filter(|s| !s.is_empty()),
            verbose: args.verbose,

            refresh_margin: args.refresh_margin,
            auto_renewal: args.auto_refresh,
            access_token_lifetime_minutes: args.token_lifetime,

            mock_auth: args.mock_auth,
            mock_user: args.mock_user,
            mock_pass: args.mock_pass,

            username: args.username,
            password: args.password,

            store_file: args.store_file.map(|s| expand_tilde(&s)),

            fetch: args.fetch,
            http_timeout: args.http_timeout,
            log_level: args.log_level,
            log_json: args.log_json,
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        reqwest::Url::parse(&self.api_url)
            .with_context(|| format!("API_URL is not a valid URL: {}", self.api_url))?;

        if let Some(ref proxy) = self.log_proxy_url {
            reqwest::Url::parse(proxy)
                .with_context(|| format!("LOG_PROXY_URL is not a valid URL: {}", proxy))?;
        }

        if self.mock_auth && (self.mock_user.is_none() || self.mock_pass.is_none()) {
            anyhow::bail!("USE_MOCK_AUTH requires AUTH_MOCK_USER and AUTH_MOCK_PASS");
        }

        if self.access_token_lifetime_minutes == 0 {
            anyhow::bail!("JWT_EXPIRES_MINUTES must be greater than zero");
        }

        if self.access_token_lifetime_minutes > MAX_TOKEN_LIFETIME_MINUTES {
            anyhow::bail!(
                "JWT_EXPIRES_MINUTES must be at most {}",
                MAX_TOKEN_LIFETIME_MINUTES
            );
        }

        if self.http_timeout == 0 {
            anyhow::bail!("HTTP_REQUEST_TIMEOUT must be greater than zero");
        }

        Ok(())
    }

    pub fn session_policy(&self) -> SessionPolicy {
        SessionPolicy {
            refresh_margin: self.refresh_margin,
            auto_renewal: self.auto_renewal,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout)
    }
}

/// Expand tilde (~) in file paths to user's home directory
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
