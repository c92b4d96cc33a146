use std::ffi::OsString;
use std::fs::{create_dir_all, read_to_string, write};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};
use tklog::{Format, LEVEL, LOG};

const LOG_FILE_ENV: &str = "DEPOT_LOG_FILE";
const LOG_DIR_NAME: &str = "logs";
const LOG_FILE_NAME: &str = "debug.log";
const LOGGING_FLAG_FILE_NAME: &str = "logging_enabled";

static LOG_PATHS: OnceLock<LogPaths> = OnceLock::new();
static FILE_LOGGING_ENABLED: AtomicBool = AtomicBool::new(false);
static FILE_HANDLER_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Where one depot keeps its debug log and its logging on/off flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogPaths {
    pub log_file: PathBuf,
    pub flag_file: PathBuf,
}

impl LogPaths {
    /// Both files live under the state directory. `DEPOT_LOG_FILE` moves only
    /// the log file; the flag always stays with the depot it belongs to.
    pub fn for_state_dir(state_dir: &Path) -> Self {
        Self::resolve(state_dir, std::env::var_os(LOG_FILE_ENV))
    }

    fn resolve(state_dir: &Path, log_file_override: Option<OsString>) -> Self {
        let log_file = log_file_override
            .filter(|path| !path.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| state_dir.join(LOG_DIR_NAME).join(LOG_FILE_NAME));
        Self {
            log_file,
            flag_file: state_dir.join(LOGGING_FLAG_FILE_NAME),
        }
    }
}

fn parse_logging_flag(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn read_logging_flag(flag_file: &Path) -> bool {
    read_to_string(flag_file)
        .map(|raw| parse_logging_flag(&raw))
        .unwrap_or(false)
}

fn write_logging_flag(flag_file: &Path, enabled: bool) -> io::Result<()> {
    if let Some(parent) = flag_file.parent() {
        create_dir_all(parent)?;
    }
    write(flag_file, if enabled { "1" } else { "0" })
}

fn remember_choice(enabled: bool) {
    let Some(paths) = LOG_PATHS.get() else {
        return;
    };
    if let Err(err) = write_logging_flag(&paths.flag_file, enabled) {
        eprintln!(
            "[log] failed to save logging flag: {} | {}",
            paths.flag_file.display(),
            err
        );
    }
}

/// `None` until [`initialize`] has run.
pub fn log_file_path() -> Option<PathBuf> {
    LOG_PATHS.get().map(|paths| paths.log_file.clone())
}

pub fn file_logging_enabled() -> bool {
    FILE_LOGGING_ENABLED.load(Ordering::Relaxed)
}

/// Turns on the rotating file sink and remembers the choice in the state
/// directory for the next run.
pub fn enable_file_logging() -> bool {
    if file_logging_enabled() {
        return true;
    }

    let Some(path) = log_file_path() else {
        eprintln!("[log] cannot enable file logging before initialize");
        return false;
    };

    if let Some(parent) = path.parent()
        && let Err(err) = create_dir_all(parent)
    {
        eprintln!(
            "[log] failed to create log dir: {} | {}",
            parent.display(),
            err
        );
        return false;
    }

    if !FILE_HANDLER_INITIALIZED.swap(true, Ordering::Relaxed) {
        let path_string = path.to_string_lossy().to_string();
        LOG.set_cutmode_by_size(&path_string, 10 * 1024 * 1024, 5, true);
    }

    FILE_LOGGING_ENABLED.store(true, Ordering::Relaxed);
    remember_choice(true);
    true
}

pub fn disable_file_logging() {
    FILE_LOGGING_ENABLED.store(false, Ordering::Relaxed);
    remember_choice(false);
}

/// Configures console output and binds the log files to `state_dir`. Only the
/// first call in a process picks the directory.
pub fn initialize(state_dir: &Path) {
    LOG.set_level(LEVEL::Debug)
        .set_console(true)
        .set_format(Format::LevelFlag | Format::Date | Format::Time | Format::ShortFileName)
        .set_formatter("{level}{time} {file}:{message}\n");

    let paths = LOG_PATHS.get_or_init(|| LogPaths::for_state_dir(state_dir));
    if read_logging_flag(&paths.flag_file) {
        let _ = enable_file_logging();
    }
}

#[macro_export]
macro_rules! debug_log {
    ($($arg:tt)*) => {{
        if $crate::logger::file_logging_enabled() {
            tklog::debug!(format!($($arg)*));
        }
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logging_flag_accepts_common_truthy_values() {
        assert!(parse_logging_flag("1"));
        assert!(parse_logging_flag(" TRUE\n"));
        assert!(parse_logging_flag("on"));
        assert!(!parse_logging_flag("0"));
        assert!(!parse_logging_flag("off"));
        assert!(!parse_logging_flag(""));
    }

    #[test]
    fn paths_follow_the_state_dir() {
        let paths = LogPaths::resolve(Path::new("/data/depot-a"), None);
        assert_eq!(paths.log_file, PathBuf::from("/data/depot-a/logs/debug.log"));
        assert_eq!(paths.flag_file, PathBuf::from("/data/depot-a/logging_enabled"));

        let other = LogPaths::resolve(Path::new("/data/depot-b"), Some(OsString::new()));
        assert_ne!(other.flag_file, paths.flag_file);
        assert_eq!(other.log_file, PathBuf::from("/data/depot-b/logs/debug.log"));
    }

    #[test]
    fn log_file_override_keeps_flag_in_state_dir() {
        let paths = LogPaths::resolve(
            Path::new("/data/depot-a"),
            Some(OsString::from("/var/log/depot.log")),
        );
        assert_eq!(paths.log_file, PathBuf::from("/var/log/depot.log"));
        assert_eq!(paths.flag_file, PathBuf::from("/data/depot-a/logging_enabled"));
    }

    #[test]
    fn flag_is_stored_per_state_dir() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        let first_paths = LogPaths::resolve(first.path(), None);
        let second_paths = LogPaths::resolve(second.path(), None);

        assert!(!read_logging_flag(&first_paths.flag_file));
        write_logging_flag(&first_paths.flag_file, true).unwrap();
        assert!(read_logging_flag(&first_paths.flag_file));
        assert!(!read_logging_flag(&second_paths.flag_file));

        write_logging_flag(&first_paths.flag_file, false).unwrap();
        assert!(!read_logging_flag(&first_paths.flag_file));
    }
}
