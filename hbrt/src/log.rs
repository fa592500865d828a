//! The implementation of the `HB_LOG` environment variable, plus the fatal
//! abort path.
//!
//! `HB_LOG` is either `<level>` or `<path>:<level>`, where `<level>` is a
//! number matching a [Verbosity] variant and `<path>` is a file to append to
//! (`-` means stderr, which is also the default).

use std::{env, fmt, fs::File, io::Write, process, sync::LazyLock};
use strum::FromRepr;

/// How verbose should the detector's diagnostic output be?
#[repr(u8)]
#[derive(Copy, Clone, Debug, FromRepr, PartialEq, PartialOrd)]
pub(crate) enum Verbosity {
    /// Disable diagnostics entirely.
    Disabled,
    /// Log fatal conditions just before dying.
    Error,
    /// Log user-program misuse (e.g. unlocking an unknown mutex).
    Warning,
    /// Log thread and sync-object lifecycle events.
    Lifecycle,
    /// Log every instrumented memory access. Extremely noisy.
    Access,
}

pub(crate) struct Logger {
    level: Verbosity,
    /// `None` means stderr.
    path: Option<String>,
}

static LOGGER: LazyLock<Logger> = LazyLock::new(|| {
    if let Ok(x) = env::var("HB_LOG") {
        Logger::from_spec(&x)
    } else {
        Logger {
            level: Verbosity::Disabled,
            path: None,
        }
    }
});

impl Logger {
    /// Parse an `HB_LOG` value. Malformed specs are a startup error, not
    /// something to limp past.
    fn from_spec(spec: &str) -> Logger {
        let (path, level) = match spec.rsplit_once(':') {
            Some((p, l)) => (Some(p), l),
            None => (None, spec),
        };
        let level = level
            .parse::<u8>()
            .ok()
            .and_then(Verbosity::from_repr)
            .unwrap_or_else(|| panic!("HB_LOG must be of the format '[<path>:]<level>'"));
        let path = match path {
            Some("-") | None => None,
            Some(p) => {
                // Truncate any previous run's log so appends start clean.
                File::create(p).ok();
                Some(p.to_string())
            }
        };
        Logger { level, path }
    }

    fn enabled(&self, v: Verbosity) -> bool {
        self.level >= v
    }

    fn emit(&self, args: fmt::Arguments) {
        match self.path.as_deref() {
            None => eprintln!("hbrt: {args}"),
            Some(p) => {
                File::options()
                    .append(true)
                    .open(p)
                    .map(|mut f| writeln!(f, "hbrt: {args}"))
                    .ok();
            }
        }
    }
}

pub(crate) fn enabled(v: Verbosity) -> bool {
    LOGGER.enabled(v)
}

pub(crate) fn emit(args: fmt::Arguments) {
    LOGGER.emit(args)
}

/// The process is in a state the detector cannot reason about. Log and abort;
/// there is no partial recovery.
pub(crate) fn die_impl(args: fmt::Arguments) -> ! {
    if enabled(Verbosity::Error) {
        emit(format_args!("fatal: {args}"));
    }
    eprintln!("hbrt: fatal: {args}");
    process::abort();
}

/// Log at the given [Verbosity], formatting lazily.
macro_rules! diag {
    ($lvl:expr, $($arg:tt)*) => {
        if $crate::log::enabled($lvl) {
            $crate::log::emit(format_args!($($arg)*));
        }
    };
}
pub(crate) use diag;

/// Diverging fatal error.
macro_rules! die {
    ($($arg:tt)*) => {
        $crate::log::die_impl(format_args!($($arg)*))
    };
}
pub(crate) use die;

#[cfg(test)]
mod tests {
    use super::{Logger, Verbosity};
    use std::{fs, io::Read};

    #[test]
    fn level_only_spec() {
        let l = Logger::from_spec("2");
        assert!(l.enabled(Verbosity::Warning));
        assert!(!l.enabled(Verbosity::Lifecycle));
        assert!(l.path.is_none());
    }

    #[test]
    fn dash_means_stderr() {
        let l = Logger::from_spec("-:3");
        assert!(l.path.is_none());
        assert!(l.enabled(Verbosity::Lifecycle));
    }

    #[test]
    #[should_panic(expected = "HB_LOG must be")]
    fn malformed_spec_panics() {
        Logger::from_spec("chatty");
    }

    #[test]
    fn file_spec_appends() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("hb.log");
        fs::write(&p, "stale\n").unwrap();
        let l = Logger::from_spec(&format!("{}:1", p.display()));
        l.emit(format_args!("first"));
        l.emit(format_args!("second"));
        let mut buf = String::new();
        fs::File::open(&p).unwrap().read_to_string(&mut buf).unwrap();
        // The previous run's contents were truncated away.
        assert_eq!(buf, "hbrt: first\nhbrt: second\n");
    }
}
