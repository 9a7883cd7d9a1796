//! Caller identity resolution.

use std::collections::HashSet;

use parking_lot::RwLock;

/// Resolves caller pids into application identities.
///
/// Platform applications (system settings, the device lock daemon) act
/// under the single configured platform identity; every other caller gets
/// a per-application identity derived from its pid by the platform's
/// permission oracle.
pub trait ApplicationPermissions: Send + Sync {
    /// True if the caller is classified as a platform application.
    fn application_is_platform_application(&self, caller_pid: u32) -> bool;

    /// The identity shared by all platform applications.
    fn platform_application_id(&self) -> String;

    /// The identity of a non-platform caller.
    fn application_id(&self, caller_pid: u32) -> String;
}

/// A static oracle for embedders and tests: a fixed set of platform pids,
/// everything else identified as `app:<pid>`.
#[derive(Default)]
pub struct StaticApplicationPermissions {
    platform_pids: RwLock<HashSet<u32>>,
}

impl StaticApplicationPermissions {
    /// Creates an oracle with no platform applications.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a pid as a platform application.
    pub fn add_platform_pid(&self, pid: u32) {
        self.platform_pids.write().insert(pid);
    }
}

impl ApplicationPermissions for StaticApplicationPermissions {
    fn application_is_platform_application(&self, caller_pid: u32) -> bool {
        self.platform_pids.read().contains(&caller_pid)
    }

    fn platform_application_id(&self) -> String {
        "platform".to_string()
    }

    fn application_id(&self, caller_pid: u32) -> String {
        format!("app:{caller_pid}")
    }
}
