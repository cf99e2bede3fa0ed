//! Out-of-band notifications.
//!
//! Notifications are fire-and-forget: a delivery failure is logged and never
//! changes the outcome of the run that triggered it.

use chrono::Local;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::Config;

pub trait Notifier: Send + Sync {
    fn notify(&self, subject: &str, body: &str);
}

/// Writes one plain-text message per notification into a spool directory,
/// for a local mail relay (or an operator) to pick up.
#[derive(Debug, Clone)]
pub struct MailSpoolNotifier {
    recipient: String,
    spool_dir: PathBuf,
    host: String,
}

impl MailSpoolNotifier {
    pub fn new(recipient: impl Into<String>, spool_dir: impl Into<PathBuf>) -> Self {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string());

        Self {
            recipient: recipient.into(),
            spool_dir: spool_dir.into(),
            host,
        }
    }

    pub fn spool_dir(&self) -> &Path {
        &self.spool_dir
    }

    fn deliver(&self, subject: &str, body: &str) -> std::io::Result<PathBuf> {
        std::fs::create_dir_all(&self.spool_dir)?;

        let now = Local::now();
        let file_name = format!("{}-{}.txt", now.format("%Y%m%d-%H%M%S"), uuid::Uuid::new_v4());
        let path = self.spool_dir.join(file_name);

        let mut file = std::fs::File::create(&path)?;
        writeln!(file, "To: {}", self.recipient)?;
        writeln!(file, "From: backup-rotator@{}", self.host)?;
        writeln!(file, "Subject: [backup-rotator@{}] {}", self.host, subject)?;
        writeln!(file, "Date: {}", now.to_rfc2822())?;
        writeln!(file)?;
        writeln!(file, "{}", body)?;
        file.sync_all()?;

        Ok(path)
    }
}

impl Notifier for MailSpoolNotifier {
    fn notify(&self, subject: &str, body: &str) {
        match self.deliver(subject, body) {
            Ok(path) => info!(recipient = %self.recipient, path = %path.display(), "Notification spooled: {}", subject),
            Err(e) => warn!(recipient = %self.recipient, error = %e, "Failed to spool notification: {}", subject),
        }
    }
}

/// Used when no recipient is configured
#[derive(Debug, Clone, Copy, Default)]
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn notify(&self, subject: &str, _body: &str) {
        debug!("Notification suppressed (no recipient): {}", subject);
    }
}

/// Notifier for a loaded configuration
pub fn from_config(config: &Config) -> Box<dyn Notifier> {
    match config.notify.recipient.as_deref().map(str::trim) {
        Some(recipient) if !recipient.is_empty() => Box::new(MailSpoolNotifier::new(
            recipient,
            config.notify.spool_dir.clone(),
        )),
        _ => Box::new(NullNotifier),
    }
}
