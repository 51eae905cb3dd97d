// Remote log collection
// Fire-and-forget reporting of session errors and info events

use reqwest::Client;
use serde::Serialize;

use crate::error::SessionError;

/// Destination for error reports and verbose info messages.
///
/// Implementations must never block or fail the caller.
pub trait LogSink: Send + Sync {
    fn error(&self, error: &SessionError, context: &str);
    fn info(&self, message: &str);
}

/// Sink that drops everything
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardSink;

impl LogSink for DiscardSink {
    fn error(&self, _error: &SessionError, _context: &str) {}
    fn info(&self, _message: &str) {}
}

#[derive(Debug, Serialize)]
struct ErrorReport {
    message: String,
    stack: String,
    info: String,
    time: String,
}

#[derive(Debug, Serialize)]
struct InfoReport {
    message: String,
    info: String,
    time: String,
}

/// Posts reports to a log-collection proxy (`/api/errors`, `/api/info`)
pub struct HttpLogSink {
    client: Client,
    base_url: String,
    verbose: bool,
}

impl HttpLogSink {
    pub fn new(client: Client, base_url: &str, verbose: bool) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            verbose,
        }
    }

    fn post<T: Serialize + Send + 'static>(&self, path: &'static str, body: T) {
        // Reports raised outside a runtime are dropped
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::debug!(path, "No runtime available, dropping log report");
            return;
        };

        let client = self.client.clone();
        let url = format!("{}{}", self.base_url, path);
        handle.spawn(async move {
            match client.post(&url).json(&body).send().await {
                Ok(response) if !response.status().is_success() => {
                    tracing::debug!(url = %url, status = %response.status(), "Log proxy rejected report");
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(url = %url, error = %e, "Failed to deliver log report");
                }
            }
        });
    }
}

impl LogSink for HttpLogSink {
    fn error(&self, error: &SessionError, context: &str) {
        self.post(
            "/api/errors",
            ErrorReport {
                message: error.to_string(),
                stack: format!("{:?}", error),
                info: context.to_string(),
                time: chrono::Utc::now().to_rfc3339(),
            },
        );
    }

    fn info(&self, message: &str) {
        if !self.verbose {
            return;
        }
        self.post(
            "/api/info",
            InfoReport {
                message: message.to_string(),
                info: String::new(),
                time: chrono::Utc::now().to_rfc3339(),
            },
        );
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_post_without_runtime_is_dropped() {
        let sink = HttpLogSink::new(Client::new(), "http://127.0.0.1:9/", true);
        // Must not panic outside of a tokio runtime
        sink.error(&SessionError::MissingRefreshToken, "no runtime");
        sink.info("no runtime");
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let sink = HttpLogSink::new(Client::new(), "http://logs.local/", false);
        assert_eq!(sink.base_url, "http://logs.local");
    }

    #[test]
    fn test_error_report_shape() {
        let report = ErrorReport {
            message: "m".to_string(),
            stack: "s".to_string(),
            info: "i".to_string(),
            time: "t".to_string(),
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"message": "m", "stack": "s", "info": "i", "time": "t"})
        );
    }
}
