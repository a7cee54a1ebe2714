use std::fmt;
use std::io::IsTerminal;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::{format::Writer, FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

/// ANSI color codes for console output
const COLOR_RESET: &str = "\x1b[0m";
const COLOR_CYAN: &str = "\x1b[36m";
const COLOR_GREEN: &str = "\x1b[32m";
const COLOR_BRIGHT_YELLOW: &str = "\x1b[93m";
const COLOR_BRIGHT_RED: &str = "\x1b[91m";
const COLOR_BRIGHT_GRAY: &str = "\x1b[90m";

/// Column widths shared with the other reDB services
const SERVICE_NAME_WIDTH: usize = 20;
const LOG_LEVEL_WIDTH: usize = 9;

/// Log line layout: `[timestamp] [service] [level] message`
pub struct RedbLogFormatter {
    service_name: String,
    color_enabled: bool,
}

/// Log at info level tagged with a component column
#[macro_export]
macro_rules! component_info {
    ($component:expr, $($arg:tt)*) => {
        tracing::info!(component = $component, $($arg)*)
    };
}

/// Log at warn level tagged with a component column
#[macro_export]
macro_rules! component_warn {
    ($component:expr, $($arg:tt)*) => {
        tracing::warn!(component = $component, $($arg)*)
    };
}

/// Log at debug level tagged with a component column
#[macro_export]
macro_rules! component_debug {
    ($component:expr, $($arg:tt)*) => {
        tracing::debug!(component = $component, $($arg)*)
    };
}

impl RedbLogFormatter {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            color_enabled: color_supported(),
        }
    }

    /// Service column, `conn-<component>` when the event names one
    fn service_column(&self, component: Option<&str>) -> String {
        let name = match component {
            Some(component) => format!("{}-{}", self.service_name, component),
            None => self.service_name.clone(),
        };
        fit_column(&name, SERVICE_NAME_WIDTH)
    }

    fn level_column(level: &Level) -> String {
        let label = match *level {
            Level::ERROR => "✗ ERROR",
            Level::WARN => "⚠ WARN",
            Level::INFO => "ℹ INFO",
            Level::DEBUG => "◦ DEBUG",
            Level::TRACE => "◦ TRACE",
        };
        format!("{:<width$}", label, width = LOG_LEVEL_WIDTH)
    }

    fn paint(&self, code: &'static str) -> &'static str {
        if self.color_enabled {
            code
        } else {
            ""
        }
    }

    fn level_color(&self, level: &Level) -> &'static str {
        self.paint(match *level {
            Level::ERROR => COLOR_BRIGHT_RED,
            Level::WARN => COLOR_BRIGHT_YELLOW,
            Level::INFO => COLOR_GREEN,
            Level::DEBUG | Level::TRACE => COLOR_BRIGHT_GRAY,
        })
    }
}

/// Pad or truncate `name` to exactly `width` characters
fn fit_column(name: &str, width: usize) -> String {
    if name.chars().count() > width {
        let truncated: String = name.chars().take(width - 1).collect();
        format!("{}…", truncated)
    } else {
        format!("{:<width$}", name, width = width)
    }
}

impl<S, N> FormatEvent<S, N> for RedbLogFormatter
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
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let level = event.metadata().level();

        let mut fields = EventFields::default();
        event.record(&mut fields);

        let reset = self.paint(COLOR_RESET);
        write!(
            writer,
            "{}[{}] [{}] [{}{}{}] ",
            self.paint(COLOR_CYAN),
            timestamp,
            self.service_column(fields.component.as_deref()),
            self.level_color(level),
            Self::level_column(level),
            reset
        )?;

        // Structured fields other than the message trail it as key=value
        write!(writer, "{}", fields.message)?;
        for (key, value) in &fields.extra {
            write!(writer, " {}={}", key, value)?;
        }
        writeln!(writer, "{}", reset)
    }
}

/// Collects the message, the optional component and any other fields
#[derive(Default)]
struct EventFields {
    message: String,
    component: Option<String>,
    extra: Vec<(&'static str, String)>,
}

impl Visit for EventFields {
    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message = value.to_string(),
            "component" => self.component = Some(value.to_string()),
            name => self.extra.push((name, value.to_string())),
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        let rendered = format!("{:?}", value);
        let unquoted = rendered
            .strip_prefix('"')
            .and_then(|s| s.strip_suffix('"'))
            .map(str::to_string)
            .unwrap_or(rendered);

        match field.name() {
            "message" => self.message = unquoted,
            "component" => self.component = Some(unquoted),
            name => self.extra.push((name, unquoted)),
        }
    }
}

/// Colors only on a real terminal that is not `TERM=dumb`
fn color_supported() -> bool {
    if std::env::var("TERM").map(|t| t == "dumb").unwrap_or(true) {
        return false;
    }
    std::io::stdout().is_terminal()
}
