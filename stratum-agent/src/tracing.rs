//! Logging setup for the agent.
//!
//! `agentd` calls [`init_journald_or_stdout`] once at startup. Library code
//! logs through `use crate::tracing::prelude::*` and attaches the pool
//! address, sub-account and error as structured fields rather than
//! formatting them into the message.

use std::{env, fmt};
use time::OffsetDateTime;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::{
    filter::{EnvFilter, LevelFilter},
    fmt::{
        FmtContext, FormatEvent, FormatFields,
        format::{DefaultFields, Writer as FmtWriter},
        time::FormatTime,
    },
    prelude::*,
    registry::LookupSpan,
};

#[cfg(target_os = "linux")]
use std::{io, os::unix::io::AsRawFd};

pub mod prelude {
    #[allow(unused_imports)]
    pub use tracing::{debug, error, info, trace, warn};
}

use prelude::*;

const CRATE_PREFIX: &str = "stratum_agent::";

/// Check whether stderr really is the stream named by `JOURNAL_STREAM`.
///
/// systemd sets `JOURNAL_STREAM=device:inode`; comparing it against the
/// stat of stderr catches inherited variables after redirection.
#[cfg(target_os = "linux")]
fn stderr_is_journal_stream() -> bool {
    let Ok(journal_stream) = env::var("JOURNAL_STREAM") else {
        return false;
    };
    let Some((expected_dev, expected_ino)) = parse_journal_stream(&journal_stream) else {
        return false;
    };

    match nix::sys::stat::fstat(io::stderr().as_raw_fd()) {
        Ok(stat) => {
            u64::from(stat.st_dev) == expected_dev && u64::from(stat.st_ino) == expected_ino
        }
        Err(_) => false,
    }
}

fn parse_journal_stream(value: &str) -> Option<(u64, u64)> {
    let (dev, ino) = value.split_once(':')?;
    Some((dev.parse().ok()?, ino.parse().ok()?))
}

// RUST_LOG, defaulting to INFO rather than ERROR.
fn env_filter() -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var("RUST_LOG")
        .from_env_lossy()
}

/// Initialize logging.
///
/// Under systemd, log to the journal; otherwise to stdout.
pub fn init_journald_or_stdout() {
    #[cfg(target_os = "linux")]
    {
        if stderr_is_journal_stream() {
            match tracing_journald::layer() {
                Ok(layer) => {
                    tracing_subscriber::registry()
                        .with(env_filter())
                        .with(layer)
                        .init();
                    return;
                }
                Err(e) => {
                    use_stdout();
                    error!(error = %e, "Failed to initialize journald logging, using stdout");
                    return;
                }
            }
        }
    }

    use_stdout();
}

fn use_stdout() {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(
            tracing_subscriber::fmt::layer()
                .with_timer(LocalTimer)
                .with_target(true)
                .fmt_fields(DefaultFields::new())
                .event_format(CompactFormatter),
        )
        .init();
}

/// Event formatter: `time LEVEL target: message`, fields on a second line.
struct CompactFormatter;

#[derive(Default)]
struct FieldCollector {
    fields: Vec<(String, String)>,
    message: Option<String>,
}

impl Visit for FieldCollector {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.fields.push((field.name().to_string(), value.to_string()));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        let formatted = format!("{:?}", value);
        if field.name() == "message" {
            self.message = Some(formatted);
        } else {
            self.fields.push((field.name().to_string(), formatted));
        }
    }
}

/// Shorten an event target for display.
///
/// Our own modules drop the crate prefix. Events bridged from `log` carry
/// their real target in a `log.target` field.
fn display_target(target: &str, fields: &[(String, String)]) -> String {
    if let Some(stripped) = target.strip_prefix(CRATE_PREFIX) {
        return stripped.to_string();
    }
    if target == "log" {
        if let Some((_, value)) = fields.iter().find(|(k, _)| k == "log.target") {
            return value.clone();
        }
    }
    target.to_string()
}

impl<S, N> FormatEvent<S, N> for CompactFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: FmtWriter<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let mut visitor = FieldCollector::default();
        event.record(&mut visitor);

        LocalTimer.format_time(&mut writer)?;
        write!(writer, " ")?;

        let (level_color, level_text) = match *event.metadata().level() {
            Level::ERROR => ("\x1b[31m", "ERROR"),
            Level::WARN => ("\x1b[33m", "WARN "),
            Level::INFO => ("\x1b[32m", "INFO "),
            Level::DEBUG => ("\x1b[34m", "DEBUG"),
            Level::TRACE => ("\x1b[35m", "TRACE"),
        };
        write!(writer, "{}{}\x1b[0m ", level_color, level_text)?;

        let target = display_target(event.metadata().target(), &visitor.fields);
        write!(writer, "{}: ", target)?;

        if let Some(msg) = &visitor.message {
            write!(writer, "{}", msg)?;
        }

        let mut fields = visitor
            .fields
            .iter()
            .filter(|(k, _)| !k.starts_with("log."))
            .peekable();

        if fields.peek().is_some() {
            // Aligned under the target column
            write!(writer, "\n\x1b[90m               ")?;
            for (i, (key, value)) in fields.enumerate() {
                if i > 0 {
                    write!(writer, ", ")?;
                }
                write!(writer, "{}={}", key, value)?;
            }
            write!(writer, "\x1b[0m")?;
        }

        writeln!(writer)
    }
}

// Local time to the nearest second.
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut FmtWriter<'_>) -> fmt::Result {
        let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
        let formatted = now
            .format(time::macros::format_description!(
                "[hour]:[minute]:[second]"
            ))
            .map_err(|_| fmt::Error)?;
        write!(w, "{}", formatted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_journal_stream() {
        assert_eq!(parse_journal_stream("8:12345"), Some((8, 12345)));
        assert_eq!(parse_journal_stream("8"), None);
        assert_eq!(parse_journal_stream("8:x"), None);
        assert_eq!(parse_journal_stream(""), None);
    }

    #[test]
    fn test_display_target_strips_own_prefix() {
        assert_eq!(
            display_target("stratum_agent::upstream::session", &[]),
            "upstream::session"
        );
        assert_eq!(display_target("tokio::net", &[]), "tokio::net");
    }

    #[test]
    fn test_display_target_uses_log_target() {
        let fields = vec![("log.target".to_string(), "hyper::client".to_string())];
        assert_eq!(display_target("log", &fields), "hyper::client");
        assert_eq!(display_target("log", &[]), "log");
    }
}
