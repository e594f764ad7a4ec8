use serde::Serialize;

use crate::protocol::BrokerState;

/// What the engine must do after a connectivity change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Broker came up while the user has SSO on: enable the affordance and
    /// reload accounts.
    GoOnline,
    /// User re-enabled SSO with the broker already up: reload accounts.
    Reload,
    /// Broker went away: disable the affordance and clear accounts.
    GoOffline,
    /// User switched SSO off, or on while the broker is down.
    Logout,
    Ignore,
}

/// Broker reachability crossed with the user's on/off switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectivityState {
    broker_online: bool,
    user_active: bool,
}

impl Default for ConnectivityState {
    fn default() -> Self {
        Self {
            broker_online: false,
            user_active: true,
        }
    }
}

impl ConnectivityState {
    pub fn broker_online(&self) -> bool {
        self.broker_online
    }

    pub fn user_active(&self) -> bool {
        self.user_active
    }

    pub fn sso_enabled(&self) -> bool {
        self.broker_online && self.user_active
    }

    pub fn on_broker_state(&mut self, state: BrokerState) -> Transition {
        match state {
            BrokerState::Online => {
                self.broker_online = true;
                if self.user_active {
                    Transition::GoOnline
                } else {
                    Transition::Ignore
                }
            }
            BrokerState::Offline => {
                if !self.user_active && !self.broker_online {
                    return Transition::Ignore;
                }
                self.broker_online = false;
                Transition::GoOffline
            }
        }
    }

    pub fn toggle_user(&mut self) -> Transition {
        self.user_active = !self.user_active;
        if self.user_active && self.broker_online {
            Transition::Reload
        } else {
            Transition::Logout
        }
    }
}
