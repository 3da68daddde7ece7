use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

/// Timeout applied to the compiled-module introspection helper.
pub const PROCESS_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub enum ProcessError {
    TimedOut,
    NonZeroExit(Option<i32>),
    Io(std::io::Error),
}

impl std::fmt::Display for ProcessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessError::TimedOut => f.write_str("process timed out"),
            ProcessError::NonZeroExit(code) => write!(f, "process exited with {code:?}"),
            ProcessError::Io(err) => write!(f, "process failed: {err}"),
        }
    }
}

impl std::error::Error for ProcessError {}

impl From<std::io::Error> for ProcessError {
    fn from(err: std::io::Error) -> Self {
        ProcessError::Io(err)
    }
}

/// The file system and process runner the analyzer sees. The host can
/// substitute an in-memory implementation.
pub trait System: Send + Sync {
    fn read_text(&self, path: &Path) -> std::io::Result<String>;

    fn exists(&self, path: &Path) -> bool;

    fn is_dir(&self, path: &Path) -> bool;

    /// Lists entries of `path` whose file name matches `pattern` (a name
    /// pattern with at most one `*`).
    fn list_entries(&self, path: &Path, pattern: &str, recursive: bool) -> Vec<PathBuf>;

    /// Runs `exe` and captures stdout. Used only for scraping the interface
    /// of compiled modules.
    fn run_process(
        &self,
        exe: &Path,
        args: &[String],
        working_dir: Option<&Path>,
        timeout: Duration,
    ) -> Result<String, ProcessError>;
}

/// Matches a file name against a pattern with at most one `*` wildcard.
pub(crate) fn name_matches(name: &str, pattern: &str) -> bool {
    match pattern.split_once('*') {
        Some((prefix, suffix)) => {
            name.len() >= prefix.len() + suffix.len()
                && name.starts_with(prefix)
                && name.ends_with(suffix)
        }
        None => name == pattern,
    }
}

#[derive(Debug, Default)]
pub struct OsSystem;

impl OsSystem {
    fn collect_entries(path: &Path, pattern: &str, recursive: bool, into: &mut Vec<PathBuf>) {
        let Ok(entries) = std::fs::read_dir(path) else {
            return;
        };

        for entry in entries.flatten() {
            let entry_path = entry.path();
            if let Some(name) = entry_path.file_name().and_then(|name| name.to_str()) {
                if name_matches(name, pattern) {
                    into.push(entry_path.clone());
                }
            }
            if recursive && entry_path.is_dir() {
                Self::collect_entries(&entry_path, pattern, recursive, into);
            }
        }
    }
}

impl System for OsSystem {
    fn read_text(&self, path: &Path) -> std::io::Result<String> {
        std::fs::read_to_string(path)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn list_entries(&self, path: &Path, pattern: &str, recursive: bool) -> Vec<PathBuf> {
        let mut entries = Vec::new();
        Self::collect_entries(path, pattern, recursive, &mut entries);
        entries.sort();
        entries
    }

    fn run_process(
        &self,
        exe: &Path,
        args: &[String],
        working_dir: Option<&Path>,
        timeout: Duration,
    ) -> Result<String, ProcessError> {
        let mut command = Command::new(exe);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        if let Some(working_dir) = working_dir {
            command.current_dir(working_dir);
        }

        let mut child = command.spawn()?;

        // Drain stdout on a separate thread so a chatty helper can't fill
        // the pipe and block before we observe its exit.
        let stdout = child.stdout.take().expect("stdout is piped");
        let (sender, receiver) = crossbeam_channel::bounded(1);
        std::thread::spawn(move || {
            let mut stdout = stdout;
            let mut buffer = String::new();
            let result = stdout.read_to_string(&mut buffer).map(|_| buffer);
            sender.send(result).ok();
        });

        let deadline = Instant::now() + timeout;
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if Instant::now() >= deadline {
                child.kill().ok();
                child.wait().ok();
                return Err(ProcessError::TimedOut);
            }
            std::thread::sleep(Duration::from_millis(10));
        };

        if !status.success() {
            return Err(ProcessError::NonZeroExit(status.code()));
        }

        match receiver.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(err)) => Err(ProcessError::Io(err)),
            Err(_) => Err(ProcessError::TimedOut),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::time::Duration;

    use super::{name_matches, OsSystem, ProcessError, System};

    #[test]
    fn pattern_matching() {
        assert!(name_matches("foo.py", "*.py"));
        assert!(name_matches("requests-2.31.0.dist-info", "requests-*.dist-info"));
        assert!(name_matches("foo.py", "foo.py"));
        assert!(!name_matches("foo.pyi", "*.py"));
        assert!(!name_matches("foo.txt", "bar.txt"));
    }

    #[test]
    fn list_entries_filters_by_pattern() -> std::io::Result<()> {
        let temp_dir = tempfile::tempdir()?;
        std::fs::write(temp_dir.path().join("a.py"), "")?;
        std::fs::write(temp_dir.path().join("b.pyi"), "")?;
        std::fs::write(temp_dir.path().join("c.py"), "")?;

        let system = OsSystem;
        let entries = system.list_entries(temp_dir.path(), "*.py", false);

        let names: Vec<_> = entries
            .iter()
            .filter_map(|path| path.file_name().and_then(|name| name.to_str()))
            .collect();
        assert_eq!(names, vec!["a.py", "c.py"]);

        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn run_process_captures_stdout() {
        let system = OsSystem;
        let output = system
            .run_process(
                Path::new("/bin/sh"),
                &["-c".to_string(), "echo scraped".to_string()],
                None,
                Duration::from_secs(5),
            )
            .unwrap();

        assert_eq!(output.trim(), "scraped");
    }

    #[cfg(unix)]
    #[test]
    fn run_process_reports_non_zero_exit() {
        let system = OsSystem;
        let result = system.run_process(
            Path::new("/bin/sh"),
            &["-c".to_string(), "exit 3".to_string()],
            None,
            Duration::from_secs(5),
        );

        assert!(matches!(result, Err(ProcessError::NonZeroExit(Some(3)))));
    }
}
