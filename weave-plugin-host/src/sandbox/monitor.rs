//! Per-plugin resource accounting
//!
//! Every sandboxed API call is recorded with its wall time. When a plugin
//! exceeds its call count or wall time ceiling within one window it is
//! flagged once, audited, and reported on the notifier channel. The
//! registry listens on that channel and disables the plugin; in-flight calls
//! are never interrupted.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use crate::audit::PermissionAuditor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub window: Duration,
    pub max_calls: u64,
    pub max_wall_time: Duration,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            max_calls: 10_000,
            max_wall_time: Duration::from_secs(30),
        }
    }
}

impl ResourceLimits {
    /// Effectively no ceiling
    pub fn unlimited() -> Self {
        Self {
            window: Duration::from_secs(60),
            max_calls: u64::MAX,
            max_wall_time: Duration::MAX,
        }
    }
}

/// Usage inside the current window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResourceUsage {
    pub calls: u64,
    pub wall_time: Duration,
}

/// Sent to the registry when a plugin trips a limit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceEvent {
    LimitExceeded { plugin_id: String, reason: String },
}

#[derive(Debug)]
struct PluginWindow {
    started: Instant,
    usage: ResourceUsage,
    flagged: bool,
}

impl PluginWindow {
    fn new(now: Instant) -> Self {
        Self {
            started: now,
            usage: ResourceUsage::default(),
            flagged: false,
        }
    }
}

#[derive(Clone)]
pub struct ResourceMonitor {
    limits: ResourceLimits,
    windows: Arc<Mutex<HashMap<String, PluginWindow>>>,
    auditor: PermissionAuditor,
    notifier: Option<mpsc::UnboundedSender<ResourceEvent>>,
}

impl ResourceMonitor {
    pub fn new(limits: ResourceLimits, auditor: PermissionAuditor) -> Self {
        Self {
            limits,
            windows: Arc::new(Mutex::new(HashMap::new())),
            auditor,
            notifier: None,
        }
    }

    /// Deliver breach events to `notifier`
    pub fn with_notifier(mut self, notifier: mpsc::UnboundedSender<ResourceEvent>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Record one call taking `elapsed`
    pub fn record(&self, plugin_id: &str, elapsed: Duration) {
        let now = Instant::now();
        let breach = {
            let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
            let window = windows
                .entry(plugin_id.to_string())
                .or_insert_with(|| PluginWindow::new(now));

            if now.duration_since(window.started) >= self.limits.window {
                // A new window keeps the flag; clearing is explicit
                window.started = now;
                window.usage = ResourceUsage::default();
            }

            window.usage.calls += 1;
            window.usage.wall_time = window.usage.wall_time.saturating_add(elapsed);

            let reason = if window.usage.calls > self.limits.max_calls {
                Some(format!(
                    "{} calls in {:?} exceeds limit of {}",
                    window.usage.calls, self.limits.window, self.limits.max_calls
                ))
            } else if window.usage.wall_time > self.limits.max_wall_time {
                Some(format!(
                    "{:?} wall time in {:?} exceeds limit of {:?}",
                    window.usage.wall_time, self.limits.window, self.limits.max_wall_time
                ))
            } else {
                None
            };

            match reason {
                Some(reason) if !window.flagged => {
                    window.flagged = true;
                    Some(reason)
                }
                _ => None,
            }
        };

        if let Some(reason) = breach {
            tracing::warn!(plugin = %plugin_id, reason = %reason, "Plugin exceeded resource limits");
            self.auditor.resource_limit(plugin_id, &reason);
            if let Some(notifier) = &self.notifier {
                let event = ResourceEvent::LimitExceeded {
                    plugin_id: plugin_id.to_string(),
                    reason,
                };
                if notifier.send(event).is_err() {
                    tracing::debug!(plugin = %plugin_id, "Resource event receiver dropped");
                }
            }
        }
    }

    pub fn is_flagged(&self, plugin_id: &str) -> bool {
        self.windows
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(plugin_id)
            .is_some_and(|w| w.flagged)
    }

    pub fn usage(&self, plugin_id: &str) -> ResourceUsage {
        self.windows
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(plugin_id)
            .map(|w| w.usage)
            .unwrap_or_default()
    }

    /// Forget a plugin's usage and flag (on enable or reload)
    pub fn clear(&self, plugin_id: &str) {
        self.windows
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(plugin_id);
    }
}

impl std::fmt::Debug for ResourceMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceMonitor")
            .field("limits", &self.limits)
            .field("notifier", &self.notifier.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditAction, MemoryAuditSink};

    fn limits(max_calls: u64) -> ResourceLimits {
        ResourceLimits {
            window: Duration::from_secs(60),
            max_calls,
            max_wall_time: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_records_usage() {
        let monitor = ResourceMonitor::new(limits(10), PermissionAuditor::null());
        monitor.record("demo", Duration::from_millis(10));
        monitor.record("demo", Duration::from_millis(15));

        let usage = monitor.usage("demo");
        assert_eq!(usage.calls, 2);
        assert_eq!(usage.wall_time, Duration::from_millis(25));
        assert!(!monitor.is_flagged("demo"));
    }

    #[test]
    fn test_call_limit_flags_once() {
        let sink = Arc::new(MemoryAuditSink::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let monitor = ResourceMonitor::new(limits(2), PermissionAuditor::new(sink.clone())).with_notifier(tx);

        for _ in 0..5 {
            monitor.record("demo", Duration::ZERO);
        }

        assert!(monitor.is_flagged("demo"));
        assert_eq!(sink.find_by_action(AuditAction::ResourceLimitExceeded).len(), 1);
        match rx.try_recv().unwrap() {
            ResourceEvent::LimitExceeded { plugin_id, .. } => assert_eq!(plugin_id, "demo"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_wall_time_limit() {
        let monitor = ResourceMonitor::new(limits(100), PermissionAuditor::null());
        monitor.record("slow", Duration::from_secs(3));
        assert!(!monitor.is_flagged("slow"));
        monitor.record("slow", Duration::from_secs(3));
        assert!(monitor.is_flagged("slow"));
        assert!(!monitor.is_flagged("other"));
    }

    #[test]
    fn test_clear_resets() {
        let monitor = ResourceMonitor::new(limits(0), PermissionAuditor::null());
        monitor.record("demo", Duration::ZERO);
        assert!(monitor.is_flagged("demo"));

        monitor.clear("demo");
        assert!(!monitor.is_flagged("demo"));
        assert_eq!(monitor.usage("demo"), ResourceUsage::default());
    }
}
