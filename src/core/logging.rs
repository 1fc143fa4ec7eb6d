//! Logging utilities with request and credential context.
//!
//! Task-local values let log lines deep inside the translation and selection
//! code carry the request id and the credential serving it without threading
//! them through every call.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

tokio::task_local! {
    /// Task-local storage for the current request ID.
    pub static REQUEST_ID: String;
}

tokio::task_local! {
    /// Task-local storage for the credential serving the current attempt.
    ///
    /// Set for the duration of one backend attempt by the failover loop.
    pub static CREDENTIAL_CONTEXT: String;
}

/// Get the current request ID from context, if set.
///
/// Returns an empty string if no request ID is set.
pub fn get_request_id() -> String {
    REQUEST_ID.try_with(|id| id.clone()).unwrap_or_default()
}

/// Get the current credential id from context, if set.
pub fn get_credential_context() -> String {
    CREDENTIAL_CONTEXT
        .try_with(|ctx| ctx.clone())
        .unwrap_or_default()
}

/// Generate a new unique request ID using UUID v4.
pub fn generate_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Custom time formatter that uses the local timezone (respects TZ).
struct LocalTime;

impl tracing_subscriber::fmt::time::FormatTime for LocalTime {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S"))
    }
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` selects the filter (default `info,llm_relay_rust=debug`); noisy
/// HTTP library logs are always capped at `warn`. `LOG_FORMAT=json` switches to
/// JSON lines and `NO_COLOR` disables ANSI colors.
pub fn init_tracing() {
    let base_filter =
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info,llm_relay_rust=debug".to_string());
    let filter = tracing_subscriber::EnvFilter::new(format!(
        "{},hyper=warn,hyper::proto=warn,h2=warn,reqwest=warn",
        base_filter
    ));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let no_color = std::env::var("NO_COLOR").is_ok();

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_timer(LocalTime))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_timer(LocalTime)
                    .with_ansi(!no_color),
            )
            .init();
    }
}

/// Execute an async block with the request id in scope.
///
/// ```ignore
/// with_request_context!(request_id, async {
///     // handler logic here
/// })
/// ```
#[macro_export]
macro_rules! with_request_context {
    ($request_id:expr, $body:expr) => {
        $crate::core::logging::REQUEST_ID
            .scope($request_id, $body)
            .await
    };
}
