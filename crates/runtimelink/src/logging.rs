use clap::ValueEnum;
use tracing::level_filters::LevelFilter;

/// Shape of diagnostic lines on stderr.
///
/// Nothing is ever logged to stdout: `serve --transport stdio` uses stdout
/// as the framed wire, and one stray line there desynchronizes the peer.
#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    /// One JSON object per line, for hosts that parse a child's stderr.
    Json,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_filter(self) -> LevelFilter {
        match self {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }

    /// At debug and below, per-message events from the transport, frame and
    /// peer crates interleave, so the target and the thread name (reader or
    /// dispatch) are worth printing.
    fn shows_origin(self) -> bool {
        self >= LogLevel::Debug
    }
}

pub fn init_logging(format: LogFormat, level: LogLevel) {
    let verbose = level.shows_origin();
    let builder = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(level.as_filter())
        .with_ansi(false)
        .with_target(verbose)
        .with_thread_names(verbose);

    // A second init (tests, embedding) keeps the first subscriber.
    match format {
        LogFormat::Text => {
            let _ = builder.try_init();
        }
        LogFormat::Json => {
            let _ = builder.json().try_init();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_map_to_filters() {
        assert_eq!(LogLevel::Warn.as_filter(), LevelFilter::WARN);
        assert_eq!(LogLevel::Trace.as_filter(), LevelFilter::TRACE);
    }

    #[test]
    fn origin_shown_only_when_verbose() {
        assert!(!LogLevel::Info.shows_origin());
        assert!(LogLevel::Debug.shows_origin());
        assert!(LogLevel::Trace.shows_origin());
    }
}
