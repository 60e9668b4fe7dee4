//! Audit log: one timestamped line per notable tunnel event
//!
//! Lines go to stdout and, when configured, to an append-only file. Each
//! line is also mirrored to `tracing` under the `audit` target.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use time::OffsetDateTime;
use time::macros::format_description;
use tracing::warn;

type Sink = Box<dyn Write + Send>;

/// Clonable handle to the audit sink
#[derive(Clone)]
pub struct AuditLog {
    sinks: Arc<Mutex<Vec<Sink>>>,
    captured: Option<Arc<Mutex<Vec<String>>>>,
}

impl AuditLog {
    /// Audit to stdout, plus `path` when given.
    pub fn open(path: Option<&Path>) -> io::Result<Self> {
        let mut sinks: Vec<Sink> = vec![Box::new(io::stdout())];
        if let Some(path) = path {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            sinks.push(Box::new(file));
        }
        Ok(Self {
            sinks: Arc::new(Mutex::new(sinks)),
            captured: None,
        })
    }

    /// Like [`AuditLog::open`], but an unusable file only costs the file
    /// sink: auditing continues on stdout.
    pub fn open_or_stdout(path: Option<&Path>) -> Self {
        Self::open(path).unwrap_or_else(|e| {
            warn!(
                "Cannot open audit log {}: {}; auditing to stdout only",
                path.map(|p| p.display().to_string()).unwrap_or_default(),
                e
            );
            Self {
                sinks: Arc::new(Mutex::new(vec![Box::new(io::stdout())])),
                captured: None,
            }
        })
    }

    /// Drop every line.
    pub fn discard() -> Self {
        Self {
            sinks: Arc::new(Mutex::new(Vec::new())),
            captured: None,
        }
    }

    /// Keep lines in memory; read them back with [`AuditLog::lines`].
    pub fn memory() -> Self {
        Self {
            sinks: Arc::new(Mutex::new(Vec::new())),
            captured: Some(Arc::new(Mutex::new(Vec::new()))),
        }
    }

    /// Messages recorded so far by a [`AuditLog::memory`] sink
    pub fn lines(&self) -> Vec<String> {
        match &self.captured {
            Some(lines) => lines.lock().map(|l| l.clone()).unwrap_or_default(),
            None => Vec::new(),
        }
    }

    /// Append one line.
    pub fn record(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        tracing::info!(target: "audit", "{}", message);

        if let Some(captured) = &self.captured {
            if let Ok(mut lines) = captured.lock() {
                lines.push(message.to_string());
            }
        }

        let line = format_line(OffsetDateTime::now_utc(), message);
        let Ok(mut sinks) = self.sinks.lock() else {
            return;
        };
        for sink in sinks.iter_mut() {
            if let Err(e) = sink.write_all(line.as_bytes()).and_then(|()| sink.flush()) {
                warn!("Audit write failed: {}", e);
            }
        }
    }
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog").finish()
    }
}

fn format_line(at: OffsetDateTime, message: &str) -> String {
    let stamp = at
        .format(format_description!(
            "[year]/[month]/[day] [hour]:[minute]:[second]"
        ))
        .unwrap_or_default();
    format!("AUDIT: {stamp} {message}\n")
}
