use anyhow::{Context, Result};
use chrono::Local;
use nu_ansi_term::{Color, Style};
use std::fmt;
use std::path::Path;
use tracing::{Event, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    filter::{EnvFilter, Targets},
    fmt::{format::Writer, FmtContext, FormatEvent, FormatFields},
    prelude::*,
    registry::LookupSpan,
    Layer,
};

/// Console default when `RUST_LOG` is unset: per-attempt results and
/// progress lines at INFO, everything else WARN and above.
const CONSOLE_DEFAULT: &str = "warn,attempt=info,progress=info,fanout=info,fanout_core=info";

/// Installs the global subscriber.
///
/// The console always gets the colourised compact format. When `log_dir` is
/// given, a daily-rotated plain-text file layer is added as well; the returned
/// guard must be held until shutdown or buffered lines are lost.
pub fn setup_logger(log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let console_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(CONSOLE_DEFAULT));
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(true)
        .event_format(TerminalFormatter)
        .with_filter(console_filter);

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let file_appender = tracing_appender::rolling::daily(dir, "fanout");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

            // Files keep the full INFO stream, including the session handshake
            let file_filter = Targets::new().with_default(tracing::Level::INFO);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .event_format(FileFormatter)
                .with_filter(file_filter);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to set global subscriber")?;

    Ok(guard)
}

// --- Formatters ---

struct MessageVisitor {
    message: String,
}

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        }
    }
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        }
    }
}

fn message_of(event: &Event<'_>) -> String {
    let mut visitor = MessageVisitor {
        message: String::new(),
    };
    event.record(&mut visitor);
    visitor.message
}

/// Highlights result keywords so a scrolling run is readable at a glance.
pub(crate) fn colorize(msg: &str) -> String {
    const KEYWORDS: [(&str, Color); 3] = [
        ("SUCCESS", Color::LightGreen),
        ("FAILED", Color::LightRed),
        ("RETRY", Color::LightYellow),
    ];
    let mut out = msg.to_string();
    for (word, color) in KEYWORDS {
        if out.contains(word) {
            let painted = Style::new().fg(color).bold().paint(word).to_string();
            out = out.replace(word, &painted);
        }
    }
    out
}

pub struct TerminalFormatter;

impl<S, N> FormatEvent<S, N> for TerminalFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let msg = message_of(event);
        let level = *event.metadata().level();
        if level <= tracing::Level::WARN && event.metadata().target() != "attempt" {
            let tag = if level == tracing::Level::ERROR {
                Color::Red.bold().paint("ERROR")
            } else {
                Color::Yellow.bold().paint("WARN")
            };
            write!(writer, "{} ", tag)?;
        }
        writeln!(writer, "{}", colorize(&msg))
    }
}

pub struct FileFormatter;

impl<S, N> FormatEvent<S, N> for FileFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let meta = event.metadata();
        write!(writer, "{} [{}] {}: ", timestamp, meta.level(), meta.target())?;
        writeln!(writer, "{}", message_of(event))
    }
}
