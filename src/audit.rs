use anyhow::{Context, Result};
use chrono::Local;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Append-only, timestamped record of what each batch pass did.
#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        AuditLog { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, text: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create log directory: {}", parent.display())
                })?;
            }
        }

        let line = format_line(&Local::now().format("%Y-%m-%d %H:%M:%S").to_string(), text);

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open log file: {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("Failed to write log file: {}", self.path.display()))?;

        log::info!("{text}");
        Ok(())
    }
}

fn format_line(timestamp: &str, text: &str) -> String {
    // One entry per line, whatever the header contained.
    let text = text.replace(['\r', '\n'], " ");
    format!("[{timestamp}] {text}\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;

    #[test]
    fn test_format_line() {
        assert_eq!(
            format_line("2024-01-02 03:04:05", "ACTION: keep email"),
            "[2024-01-02 03:04:05] ACTION: keep email\n"
        );
        assert_eq!(
            format_line("2024-01-02 03:04:05", "subject: a\r\nb"),
            "[2024-01-02 03:04:05] subject: a  b\n"
        );
    }

    #[test]
    fn test_append_creates_parent_and_appends() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path().join("logs").join("actions.log"));

        log.append("first").unwrap();
        log.append("second").unwrap();

        let content = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let re = Regex::new(r"^\[\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}\] (first|second)$").unwrap();
        assert!(lines.iter().all(|l| re.is_match(l)), "{content}");
        assert!(lines[0].ends_with("first"));
        assert!(lines[1].ends_with("second"));
    }
}
