use anyhow::{Context, Result};
use dialoguer::{Input, Password};
use std::sync::Arc;
use std::time::Duration;

use session_keeper::auth::{
    format_remaining, AuthBackend, CredentialStore, HttpAuthBackend, MemoryStore,
    MockAuthBackend, SessionManager, SqliteStore, Timebase,
};
use session_keeper::config::Config;
use session_keeper::log_sink::{DiscardSink, HttpLogSink, LogSink};

/// How often the remaining session time is printed
const STATUS_INTERVAL_SECS: u64 = 30;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (for log level)
    let config = Config::load()?;
    config.validate()?;

    // Initialize logging with a configured level
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true);

    if config.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    tracing::info!("Session Keeper starting...");

    let client = reqwest::Client::builder()
        .timeout(config.request_timeout())
        .build()
        .context("Failed to create HTTP client")?;

    let timebase = Timebase::system();

    let store: Arc<dyn CredentialStore> = match config.store_file {
        Some(ref path) => Arc::new(
            SqliteStore::open(path)
                .with_context(|| format!("Failed to open credential store {}", path.display()))?,
        ),
        None => Arc::new(MemoryStore::new()),
    };

    let backend: Arc<dyn AuthBackend> = if config.mock_auth {
        tracing::info!("Using mock authentication");
        Arc::new(MockAuthBackend::new(
            config.mock_user.as_deref().unwrap_or_default(),
            config.mock_pass.as_deref().unwrap_or_default(),
            config.access_token_lifetime_minutes,
            timebase,
        ))
    } else {
        Arc::new(HttpAuthBackend::new(client.clone(), &config.api_url))
    };

    let sink: Arc<dyn LogSink> = match config.log_proxy_url {
        Some(ref url) => Arc::new(HttpLogSink::new(client.clone(), url, config.verbose)),
        None => Arc::new(DiscardSink),
    };

    let session = SessionManager::new(
        client,
        &config.api_url,
        config.session_policy(),
        timebase,
        store,
        backend,
        sink,
    );

    print_startup_banner(&config);

    // Resume a persisted session if there is one
    let restored = match session.restore() {
        Ok(snapshot) => snapshot,
        Err(e) => {
            tracing::warn!("Stored session discarded: {}", e);
            session.current_session()
        }
    };

    if restored.is_authenticated {
        tracing::info!(
            "✅ Resumed session for {} ({} remaining)",
            restored.subject.as_deref().unwrap_or_default(),
            format_remaining(restored.seconds_remaining)
        );
    } else {
        let (username, password) = prompt_credentials(&config)?;
        match session.login(&username, &password).await {
            Ok(snapshot) => {
                tracing::info!(
                    "✅ Logged in as {} ({} remaining)",
                    snapshot.subject.as_deref().unwrap_or_default(),
                    format_remaining(snapshot.seconds_remaining)
                );
            }
            Err(e) => {
                tracing::error!("❌ Login failed: {}", e);
                anyhow::bail!("Login failed: {}", e);
            }
        }
    }

    let _countdown = session.start_countdown();

    for path in &config.fetch {
        fetch(&session, path).await;
    }

    let mut status = tokio::time::interval(Duration::from_secs(STATUS_INTERVAL_SECS));
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = status.tick() => {
                let snapshot = session.current_session();
                if !snapshot.is_authenticated {
                    tracing::info!("Session ended");
                    break;
                }
                println!(
                    "  {}  session time remaining: {}",
                    snapshot.subject.as_deref().unwrap_or_default(),
                    format_remaining(snapshot.seconds_remaining)
                );
            }
        }
    }

    if config.store_file.is_none() {
        // Nothing outlives an in-memory store anyway
        session.logout();
    }

    tracing::info!("👋 Session Keeper stopped");
    Ok(())
}

/// GET a path through the gateway and print a short summary
async fn fetch(session: &SessionManager, path: &str) {
    let gateway = session.gateway();
    let request = match gateway.get(path).build() {
        Ok(request) => request,
        Err(e) => {
            tracing::error!("Invalid request for {}: {}", path, e);
            return;
        }
    };

    match gateway.send(request).await {
        Ok(response) => {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            println!("GET {} -> {} ({} bytes)", path, status, body.len());
        }
        Err(e) => {
            tracing::error!("GET {} failed: {}", path, e);
        }
    }
}

/// Username and password from config, prompting for whatever is missing
fn prompt_credentials(config: &Config) -> Result<(String, String)> {
    let username = match config.username {
        Some(ref username) => username.clone(),
        None => Input::new()
            .with_prompt("Username")
            .interact_text()
            .context("Failed to read username")?,
    };

    let password = match config.password {
        Some(ref password) => password.clone(),
        None => Password::new()
            .with_prompt("Password")
            .interact()
            .context("Failed to read password")?,
    };

    Ok((username, password))
}

/// Print startup banner
fn print_startup_banner(config: &Config) {
    println!();
    println!("  Session Keeper {}", env!("CARGO_PKG_VERSION"));
    println!("  API:            {}", config.api_url);
    println!(
        "  Auth:           {}",
        if config.mock_auth { "mock" } else { "remote" }
    );
    println!(
        "  Renewal:        {} ({}s before expiry)",
        if config.auto_renewal {
            "silent refresh"
        } else {
            "forced logout"
        },
        config.refresh_margin
    );
    println!(
        "  Store:          {}",
        config
            .store_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "memory".to_string())
    );
    println!();
}

/// Handle graceful shutdown signal
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal, shutting down...");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, shutting down...");
        },
    }
}
