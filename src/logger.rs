//! Logging setup for applications embedding visopt.
//!
//! The library itself only emits `tracing` events; installing a subscriber
//! is left to the application. These helpers install one with a compact
//! bracketed format:
//!
//! ```text
//! [INFO 2025-01-01 12:00:00 calibration] calibrating 31 parameters from 4 views of 48 points
//! [DEBUG 2025-01-01 12:00:00 levenberg_marquardt.rs:412] ...
//! ```

use tracing::Level;

/// Install the subscriber with a default level of INFO.
///
/// `RUST_LOG` overrides the default, e.g. `RUST_LOG=visopt=debug` prints
/// the per-iteration tables. Does nothing if a global subscriber is already
/// set.
///
/// ```no_run
/// visopt::init_logger();
/// tracing::info!("calibration started");
/// ```
pub fn init_logger() {
    init_logger_with_level(Level::INFO)
}

/// Install the subscriber with a custom default level.
///
/// ```no_run
/// use tracing::Level;
///
/// visopt::init_logger_with_level(Level::DEBUG);
/// ```
pub fn init_logger_with_level(default_level: Level) {
    let installed = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(default_level.into())
                .from_env_lossy(),
        )
        .event_format(BracketFormatter)
        .try_init();

    if installed.is_err() {
        tracing::debug!("global subscriber already installed, keeping it");
    }
}

/// Last `::` segment of a module path
fn short_target(target: &str) -> &str {
    target.rsplit("::").next().unwrap_or(target)
}

/// File name without its directories
fn short_file(file: &str) -> &str {
    file.rsplit(['/', '\\']).next().unwrap_or(file)
}

fn colored_level(level: &Level) -> &'static str {
    match *level {
        Level::ERROR => "\x1b[31mERROR\x1b[0m",
        Level::WARN => "\x1b[33mWARN\x1b[0m",
        Level::INFO => "\x1b[32mINFO\x1b[0m",
        Level::DEBUG => "\x1b[34mDEBUG\x1b[0m",
        Level::TRACE => "\x1b[35mTRACE\x1b[0m",
    }
}

/// `[LEVEL timestamp module] message`, with `file:line` in place of the
/// module for DEBUG and TRACE.
struct BracketFormatter;

impl<S, N> tracing_subscriber::fmt::FormatEvent<S, N> for BracketFormatter
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    N: for<'a> tracing_subscriber::fmt::FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &tracing_subscriber::fmt::FmtContext<'_, S, N>,
        mut writer: tracing_subscriber::fmt::format::Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let metadata = event.metadata();
        let level = metadata.level();

        write!(
            writer,
            "[{} {} ",
            colored_level(level),
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
        )?;

        match (metadata.file(), metadata.line()) {
            (Some(file), Some(line)) if *level >= Level::DEBUG => {
                write!(writer, "{}:{}", short_file(file), line)?
            }
            _ => write!(writer, "{}", short_target(metadata.target()))?,
        }

        write!(writer, "] ")?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_names() {
        assert_eq!(short_target("visopt::optimizer::levenberg_marquardt"), "levenberg_marquardt");
        assert_eq!(short_target("visopt"), "visopt");
        assert_eq!(short_file("src/calibration/zhang99.rs"), "zhang99.rs");
        assert_eq!(short_file("src\\pose\\mod.rs"), "mod.rs");
    }

    #[test]
    fn test_init_twice_is_harmless() {
        init_logger();
        init_logger_with_level(Level::DEBUG);
    }
}
