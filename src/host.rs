//! The toolbar affordance the engine drives. Rendering lives in the host;
//! the engine only says what to show.

use parking_lot::Mutex;

pub const DEFAULT_ICON: &str = "icons/sso-mib.svg";

pub fn active_title(username: &str) -> String {
    format!("EntraID SSO: {username}")
}

pub fn disabled_title(user_active: bool) -> &'static str {
    if user_active {
        "EntraID SSO disabled (waiting for broker)."
    } else {
        "EntraID SSO disabled. Click to enable."
    }
}

pub trait HostUi: Send + Sync {
    fn enable(&self);
    fn disable(&self);
    fn set_title(&self, title: &str);
    fn set_default_icon(&self);
    /// Raw profile picture bytes; cropping is up to the host.
    fn set_avatar(&self, image: Vec<u8>);
}

/// Host for headless runs: every update becomes a log line.
#[derive(Debug, Default)]
pub struct TracingHost;

impl HostUi for TracingHost {
    fn enable(&self) {
        tracing::info!(target = "sso_bridge::host", "affordance enabled");
    }

    fn disable(&self) {
        tracing::info!(target = "sso_bridge::host", "affordance disabled");
    }

    fn set_title(&self, title: &str) {
        tracing::info!(target = "sso_bridge::host", title, "title changed");
    }

    fn set_default_icon(&self) {
        tracing::debug!(target = "sso_bridge::host", icon = DEFAULT_ICON, "icon reset");
    }

    fn set_avatar(&self, image: Vec<u8>) {
        tracing::info!(target = "sso_bridge::host", bytes = image.len(), "avatar updated");
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCall {
    Enable,
    Disable,
    Title(String),
    DefaultIcon,
    Avatar(Vec<u8>),
}

/// Records every call, for embedding hosts that poll and for tests.
#[derive(Debug, Default)]
pub struct MemoryHost {
    calls: Mutex<Vec<HostCall>>,
}

impl MemoryHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<HostCall> {
        self.calls.lock().clone()
    }

    pub fn last_title(&self) -> Option<String> {
        self.calls.lock().iter().rev().find_map(|call| match call {
            HostCall::Title(title) => Some(title.clone()),
            _ => None,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.calls
            .lock()
            .iter()
            .rev()
            .find_map(|call| match call {
                HostCall::Enable => Some(true),
                HostCall::Disable => Some(false),
                _ => None,
            })
            .unwrap_or(false)
    }
}

impl HostUi for MemoryHost {
    fn enable(&self) {
        self.calls.lock().push(HostCall::Enable);
    }

    fn disable(&self) {
        self.calls.lock().push(HostCall::Disable);
    }

    fn set_title(&self, title: &str) {
        self.calls.lock().push(HostCall::Title(title.to_string()));
    }

    fn set_default_icon(&self) {
        self.calls.lock().push(HostCall::DefaultIcon);
    }

    fn set_avatar(&self, image: Vec<u8>) {
        self.calls.lock().push(HostCall::Avatar(image));
    }
}
