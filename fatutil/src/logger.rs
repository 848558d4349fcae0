use std::fmt::Display;
use std::io::{self, IsTerminal, Write};
use std::sync::atomic::{AtomicBool, Ordering};

use log::{Level, LevelFilter, Log};
use owo_colors::OwoColorize;

/// Environment variable that overrides the `-v` flags, e.g. `FATUTIL_LOG=debug`.
pub const LOG_ENV: &str = "FATUTIL_LOG";

struct Inner<W> {
    writer: W,
    color: bool,
}

impl<W: Write> Inner<W> {
    fn write_with_color(&mut self, color: Color, string: impl Display) {
        let color = if self.color { color } else { Color::Default };
        let string: &dyn Display = match color {
            Color::Default => &string,
            Color::Gray => &string.dimmed(),
            Color::BrightRed => &string.bright_red(),
            Color::BrightYellow => &string.bright_yellow(),
            Color::BrightBlue => &string.bright_blue(),
            Color::BrightCyan => &string.bright_cyan(),
            Color::BrightMagenta => &string.bright_magenta(),
        };
        // Nowhere to report a failing stderr.
        let _ = write!(self.writer, "{string}");
    }

    fn write_record(&mut self, record: &log::Record) {
        let level = record.level();
        self.write_with_color(
            match level {
                Level::Error => Color::BrightRed,
                Level::Warn => Color::BrightYellow,
                Level::Info => Color::BrightBlue,
                Level::Debug => Color::BrightCyan,
                Level::Trace => Color::BrightMagenta,
            },
            format_args!("{level:5} "),
        );
        if level >= Level::Debug {
            self.write_with_color(Color::Gray, format_args!("[{}] ", record.target()));
        }
        self.write_with_color(Color::Default, record.args());
        self.write_with_color(Color::Default, "\n");
    }
}

struct StderrLogger {
    color: AtomicBool,
}

static LOGGER: StderrLogger = StderrLogger {
    color: AtomicBool::new(false),
};

impl Log for StderrLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut inner = Inner {
            writer: io::stderr().lock(),
            color: self.color.load(Ordering::Relaxed),
        };
        inner.write_record(record);
    }

    fn flush(&self) {
        let _ = io::stderr().flush();
    }
}

/// Install the stderr logger. `verbosity` counts `-v` flags; [`LOG_ENV`]
/// takes precedence when set to a valid level.
pub fn init(verbosity: u8) -> Result<(), log::SetLoggerError> {
    LOGGER.color.store(io::stderr().is_terminal(), Ordering::Relaxed);
    let env = std::env::var(LOG_ENV).ok();
    log::set_max_level(level_filter(verbosity, env.as_deref()));
    log::set_logger(&LOGGER)
}

fn level_filter(verbosity: u8, env: Option<&str>) -> LevelFilter {
    if let Some(level) = env.and_then(|s| s.trim().parse().ok()) {
        return level;
    }
    match verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

enum Color {
    Default,
    Gray,
    BrightRed,
    BrightYellow,
    BrightBlue,
    BrightCyan,
    BrightMagenta,
}
