//! Structured security telemetry.
//!
//! Every terminal branch of the decision pipeline appends exactly one JSON
//! line describing what was decided and why. Lines go to a size-rotated log
//! file when `LOG_FILE` is configured and are optionally mirrored to stdout
//! through `tracing`.

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};

use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;

use crate::identity::ClientIdentity;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        }
    }
}

#[derive(Debug, Serialize)]
struct SecurityEvent<'a> {
    timestamp: String,
    ip: &'a str,
    fingerprint: &'a str,
    event: &'a str,
    severity: Severity,
    details: serde_json::Value,
}

/// Size-based rotating writer keeping a short backup chain (`<path>.1` ..
/// `<path>.keep`), optionally gzipping the freshest backup.
pub struct RotatingWriter {
    path: PathBuf,
    file: fs::File,
    max_bytes: Option<u64>,
    keep: usize,
    compress: bool,
}

impl RotatingWriter {
    pub fn open(
        path: &str,
        max_bytes: Option<u64>,
        keep: usize,
        compress: bool,
    ) -> std::io::Result<Self> {
        let file = fs::OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: PathBuf::from(path),
            file,
            max_bytes,
            keep,
            compress,
        })
    }

    pub fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        if let Some(limit) = self.max_bytes {
            let over = self
                .path
                .metadata()
                .map(|meta| meta.len() >= limit)
                .unwrap_or(false);
            if over {
                self.rotate();
            }
        }
        writeln!(self.file, "{}", line)
    }

    fn rotate(&mut self) {
        if self.keep > 0 {
            for idx in (1..=self.keep).rev() {
                let old = if idx == 1 {
                    self.path.clone()
                } else {
                    self.path.with_extension(format!("{}", idx - 1))
                };
                if old.exists() {
                    let _ = fs::rename(&old, self.path.with_extension(format!("{}", idx)));
                }
            }
            if self.compress {
                self.compress_first_backup();
            }
        }
        if let Ok(fresh) = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)
        {
            self.file = fresh;
        }
    }

    fn compress_first_backup(&self) {
        let rotated = self.path.with_extension("1");
        if let Ok(data) = fs::read(&rotated) {
            let mut gz = GzEncoder::new(Vec::new(), Compression::default());
            if gz.write_all(&data).is_ok() {
                if let Ok(buf) = gz.finish() {
                    let _ = fs::write(rotated.with_extension("1.gz"), buf);
                    let _ = fs::remove_file(&rotated);
                }
            }
        }
    }
}

#[derive(Clone)]
pub struct TelemetrySink {
    writer: Option<Arc<Mutex<RotatingWriter>>>,
    log_stdout: bool,
    lines_total: Arc<AtomicU64>,
    write_errors_total: Arc<AtomicU64>,
}

impl TelemetrySink {
    pub fn new(writer: Option<Arc<Mutex<RotatingWriter>>>, log_stdout: bool) -> Self {
        Self {
            writer,
            log_stdout,
            lines_total: Arc::new(AtomicU64::new(0)),
            write_errors_total: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Append one event. `identity` is absent for process-level events such
    /// as a circuit breaker transition.
    pub fn emit(
        &self,
        severity: Severity,
        event: &str,
        identity: Option<&ClientIdentity>,
        details: serde_json::Value,
    ) {
        let (ip, fingerprint) = identity
            .map(|id| (id.addr.as_str(), id.fingerprint.as_str()))
            .unwrap_or(("unknown", "unknown"));
        let record = SecurityEvent {
            timestamp: chrono::Utc::now().to_rfc3339(),
            ip,
            fingerprint,
            event,
            severity,
            details,
        };
        let line = match serde_json::to_string(&record) {
            Ok(line) => line,
            Err(err) => {
                tracing::warn!(error=%err, "failed to serialize security event");
                return;
            }
        };
        if let Some(writer) = &self.writer {
            if let Ok(mut guard) = writer.lock() {
                match guard.write_line(&line) {
                    Ok(()) => {
                        self.lines_total.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(err) => {
                        tracing::warn!(error=%err, "failed to write security event line");
                        self.write_errors_total.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
        if self.log_stdout || self.writer.is_none() {
            match severity {
                Severity::Info => {
                    tracing::info!(target: "security", event, ip, fingerprint, severity = severity.as_str())
                }
                Severity::Warning => {
                    tracing::warn!(target: "security", event, ip, fingerprint, severity = severity.as_str())
                }
                Severity::Error | Severity::Critical => {
                    tracing::error!(target: "security", event, ip, fingerprint, severity = severity.as_str())
                }
            }
        }
    }

    pub fn lines_total(&self) -> u64 {
        self.lines_total.load(Ordering::Relaxed)
    }

    pub fn write_errors_total(&self) -> u64 {
        self.write_errors_total.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sink_for(path: &std::path::Path) -> TelemetrySink {
        let writer = RotatingWriter::open(path.to_str().unwrap(), None, 1, false).unwrap();
        TelemetrySink::new(Some(Arc::new(Mutex::new(writer))), false)
    }

    #[test]
    fn emits_one_json_line_per_event() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("security.log");
        let sink = sink_for(&path);
        let identity = ClientIdentity {
            addr: "198.51.100.7".into(),
            fingerprint: "abcdef0123456789".into(),
        };
        sink.emit(
            Severity::Error,
            "forbidden_origin",
            Some(&identity),
            serde_json::json!({"origin": "https://evil.example"}),
        );
        sink.emit(Severity::Info, "image_generated", Some(&identity), serde_json::json!({}));

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["event"], "forbidden_origin");
        assert_eq!(first["severity"], "error");
        assert_eq!(first["ip"], "198.51.100.7");
        assert_eq!(sink.lines_total(), 2);
    }

    #[test]
    fn rotates_when_over_the_size_limit() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("security.log");
        let mut writer =
            RotatingWriter::open(path.to_str().unwrap(), Some(64), 1, false).unwrap();
        for _ in 0..16 {
            writer
                .write_line(r#"{"event":"invalid_input","severity":"warning"}"#)
                .unwrap();
        }
        assert!(path.with_extension("1").exists());
    }

    #[test]
    fn compresses_the_rotated_backup() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("security.log");
        let mut writer = RotatingWriter::open(path.to_str().unwrap(), Some(32), 1, true).unwrap();
        for _ in 0..8 {
            writer
                .write_line(r#"{"event":"rate_limit_exceeded","severity":"warning"}"#)
                .unwrap();
        }
        assert!(path.with_extension("1.gz").exists());
        assert!(!path.with_extension("1").exists());
    }
}
