//! Process-wide logging setup: `slog` fanned out through `slog-stdlog` so
//! that every dependency's `log` macros land in the same drain, in either
//! human-readable terminal format or MozLog-compatible JSON.
//!
//! Grounded on the teacher's `src/logging.rs`; `mozsvc_common::get_hostname`
//! isn't part of this workspace's dependency stack, so the hostname is
//! taken directly from the `hostname` crate the teacher already depends on
//! elsewhere (`syncstorage-settings::Settings::hostname`).

use std::io;

use slog::{slog_o, Drain};

/// Initializes the global `slog` logger. `json` selects MozLog-formatted
/// output (for production, piped to a log collector); otherwise a
/// human-readable terminal format is used (for local development).
pub fn init_logging(json: bool) -> Result<(), String> {
    let logger = if json {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .ok_or_else(|| "could not determine hostname".to_owned())?;

        let drain = slog_mozlog_json::MozLogJson::new(io::stdout())
            .logger_name(format!(
                "{}-{}",
                env!("CARGO_PKG_NAME"),
                env!("CARGO_PKG_VERSION")
            ))
            .msg_type(format!("{}:log", env!("CARGO_PKG_NAME")))
            .hostname(hostname)
            .build()
            .fuse();
        let drain = slog_envlogger::new(drain);
        let drain = slog_async::Async::new(drain).build().fuse();
        slog::Logger::root(drain, slog_o!())
    } else {
        let decorator = slog_term::TermDecorator::new().build();
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        let drain = slog_envlogger::new(drain);
        let drain = slog_async::Async::new(drain).build().fuse();
        slog::Logger::root(drain, slog_o!())
    };

    // cancel_reset: slog_scope panics on drop if the global logger was
    // never reset back to a no-op; reset_logging below does that
    // explicitly during shutdown, so the default panicking guard is
    // unwanted here.
    slog_scope::set_global_logger(logger).cancel_reset();
    slog_stdlog::init().map_err(|e| e.to_string())?;
    Ok(())
}

/// Restores a discarding root logger, used by tests and graceful shutdown
/// so the global logger doesn't outlive whatever set it up.
pub fn reset_logging() {
    let logger = slog::Logger::root(slog::Discard, slog_o!());
    slog_scope::set_global_logger(logger).cancel_reset();
}
