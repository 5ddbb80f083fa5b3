use crate::domain::Notification;
use crate::store::DeliverySink;
use std::io::{self, Write as _};
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::Mutex;

const MAX_TITLE_LENGTH: usize = 50;
const MAX_BODY_LENGTH: usize = 200;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PermissionDecision {
    Granted,
    Denied,
    /// The host has no notification capability. Treated identically to
    /// `Denied` for delivery purposes, never as an error.
    Unsupported,
}

/// Platform seam for out-of-band delivery: a capability probe plus a
/// fire-and-forget send. Implementations must not fail loudly.
pub trait DeliveryBackend: Send + Sync {
    fn probe(&self) -> PermissionDecision;
    fn deliver(&self, title: &str, body: &str);
}

/// Gates out-of-band delivery on a cached permission decision.
pub struct PermissionGate {
    backend: Box<dyn DeliveryBackend>,
    decision: Mutex<Option<PermissionDecision>>,
}

impl PermissionGate {
    pub fn new(backend: Box<dyn DeliveryBackend>) -> Self {
        Self {
            backend,
            decision: Mutex::new(None),
        }
    }

    /// Probe the backend once and cache the outcome. Subsequent calls return
    /// the existing decision without re-prompting.
    pub fn request_permission(&self) -> PermissionDecision {
        let mut decision = self
            .decision
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *decision.get_or_insert_with(|| self.backend.probe())
    }

    /// Record an explicit refusal without probing the platform.
    pub fn deny(&self) {
        let mut decision = self
            .decision
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *decision = Some(PermissionDecision::Denied);
    }

    pub fn decision(&self) -> Option<PermissionDecision> {
        *self
            .decision
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Deliver out-of-band only when the current decision is `Granted`;
    /// silent no-op otherwise (including before any decision was made).
    pub fn notify(&self, notification: &Notification) {
        if self.decision() != Some(PermissionDecision::Granted) {
            return;
        }
        self.backend.deliver(
            &truncate_chars(&notification.title, MAX_TITLE_LENGTH),
            &truncate_chars(&notification.message, MAX_BODY_LENGTH),
        );
    }
}

impl DeliverySink for PermissionGate {
    fn deliver(&self, notification: &Notification) {
        self.notify(notification);
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out = text.chars().take(max.saturating_sub(1)).collect::<String>();
    out.push('…');
    out
}

/// Delivers through the host desktop notifier. The probe stands in for the
/// permission prompt: a usable notifier binary means `Granted`, anything else
/// means `Unsupported`.
pub struct DesktopBackend;

impl DesktopBackend {
    fn notifier() -> Option<&'static str> {
        let candidates: &[&str] = if cfg!(target_os = "macos") {
            &["osascript"]
        } else {
            &["notify-send"]
        };
        candidates
            .iter()
            .copied()
            .find(|binary| find_in_path(binary))
    }
}

impl DeliveryBackend for DesktopBackend {
    fn probe(&self) -> PermissionDecision {
        match Self::notifier() {
            Some(_) => PermissionDecision::Granted,
            None => PermissionDecision::Unsupported,
        }
    }

    fn deliver(&self, title: &str, body: &str) {
        let Some(binary) = Self::notifier() else {
            return;
        };

        let mut command = Command::new(binary);
        if binary == "osascript" {
            command.arg("-e").arg(format!(
                "display notification \"{}\" with title \"{}\"",
                escape_applescript(body),
                escape_applescript(title),
            ));
        } else {
            command.arg(title).arg(body);
        }

        let spawned = command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        match spawned {
            Ok(mut child) => {
                // Reap off-thread; the notifier may outlive this call and the
                // caller must not block on it.
                std::thread::spawn(move || {
                    let _ = child.wait();
                });
            }
            Err(error) => {
                tracing::debug!(%error, "desktop notification delivery failed");
            }
        }
    }
}

fn escape_applescript(text: &str) -> String {
    text.replace('\\', "\\\\").replace('"', "\\\"")
}

fn find_in_path(binary: &str) -> bool {
    let Some(path) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path).any(|dir| is_executable_file(&dir.join(binary)))
}

#[cfg(unix)]
fn is_executable_file(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable_file(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|meta| meta.is_file())
        .unwrap_or(false)
}

/// Writes one tab-separated line per delivery to stdout. Used by the CLI so
/// arriving notifications are visible without a desktop notifier.
pub struct LineBackend;

impl DeliveryBackend for LineBackend {
    fn probe(&self) -> PermissionDecision {
        PermissionDecision::Granted
    }

    fn deliver(&self, title: &str, body: &str) {
        let mut out = io::stdout().lock();
        let _ = writeln!(out, "{title}\t{body}");
    }
}

/// No capability, no delivery.
pub struct NullBackend;

impl DeliveryBackend for NullBackend {
    fn probe(&self) -> PermissionDecision {
        PermissionDecision::Unsupported
    }

    fn deliver(&self, _title: &str, _body: &str) {}
}
