//! Lifecycle controller: owns the SSO state and funnels every transition
//! (broker status, user toggle, account reloads) through one place.

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;

use crate::{
    accounts::{AccountRegistry, ReloadOutcome},
    connectivity::{ConnectivityState, Transition},
    error::{BridgeError, BridgeResult},
    events::EventEmitter,
    graph::PhotoClient,
    host::{active_title, disabled_title, HostUi},
    inject::{Header, HeaderInjector, InterceptedRequest, SsoContext},
    link::{BrokerLink, Disconnect, LinkEvent},
    pending::PendingResults,
    protocol::{
        Account, BrokerCommand, BrokerMessage, CommandKind, Inbound, PrtCookie, TokenResponse,
    },
};

#[derive(Clone)]
pub struct EngineOptions {
    pub injector: HeaderInjector,
    /// `None` waits for the broker as long as the link lives.
    pub request_timeout: Option<Duration>,
    /// Profile picture source; `None` skips the avatar.
    pub photo: Option<PhotoClient>,
    pub events: EventEmitter,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatus {
    pub broker_online: bool,
    pub user_active: bool,
    pub sso_enabled: bool,
    pub active_account: Option<String>,
    pub registered_accounts: usize,
    pub link_open: bool,
}

#[derive(Default)]
struct EngineState {
    connectivity: ConnectivityState,
    accounts: AccountRegistry,
    disconnect: Option<Disconnect>,
}

struct EngineInner {
    link: BrokerLink,
    pending: PendingResults,
    state: Mutex<EngineState>,
    host: Arc<dyn HostUi>,
    options: EngineOptions,
}

#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn new(link: BrokerLink, host: Arc<dyn HostUi>, options: EngineOptions) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                link,
                pending: PendingResults::new(),
                state: Mutex::new(EngineState::default()),
                host,
                options,
            }),
        }
    }

    pub fn status(&self) -> EngineStatus {
        let state = self.inner.state.lock();
        EngineStatus {
            broker_online: state.connectivity.broker_online(),
            user_active: state.connectivity.user_active(),
            sso_enabled: state.connectivity.sso_enabled(),
            active_account: state.accounts.active().map(|a| a.username.clone()),
            registered_accounts: state.accounts.registered().len(),
            link_open: state.disconnect.is_none(),
        }
    }

    pub fn active_account(&self) -> Option<Account> {
        self.inner.state.lock().accounts.active().cloned()
    }

    pub fn accounts(&self) -> Vec<Account> {
        self.inner.state.lock().accounts.registered().to_vec()
    }

    pub fn pending(&self) -> &PendingResults {
        &self.inner.pending
    }

    /// Drives the engine from link events until the link closes.
    pub async fn run(self, mut events: mpsc::Receiver<LinkEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                LinkEvent::Message(inbound) => self.handle_message(inbound),
                LinkEvent::Closed(disconnect) => {
                    self.handle_disconnect(disconnect);
                    return;
                }
            }
        }
        self.handle_disconnect(Disconnect::Error("link event stream ended".to_string()));
    }

    pub fn handle_message(&self, inbound: Inbound) {
        match inbound.message {
            BrokerMessage::StateChanged(broker_state) => {
                let transition = self
                    .inner
                    .state
                    .lock()
                    .connectivity
                    .on_broker_state(broker_state);
                if transition != Transition::Ignore {
                    self.inner
                        .options
                        .events
                        .emit("broker_state", json!({"state": broker_state}));
                }
                self.apply(transition);
            }
            message => {
                self.inner
                    .pending
                    .resolve(inbound.request_id.as_deref(), message);
            }
        }
    }

    fn handle_disconnect(&self, disconnect: Disconnect) {
        let description = disconnect.describe();
        {
            let mut state = self.inner.state.lock();
            if state.disconnect.is_some() {
                return;
            }
            state.disconnect = Some(disconnect.clone());
        }
        tracing::error!(target = "sso_bridge::controller", "{description}");
        self.inner.pending.close(description);
        self.inner.options.events.emit(
            "link_closed",
            json!({"clean": disconnect == Disconnect::Clean}),
        );
    }

    /// The click affordance: flips whether SSO is wanted at all.
    pub fn toggle(&self) -> EngineStatus {
        let transition = self.inner.state.lock().connectivity.toggle_user();
        self.apply(transition);
        self.status()
    }

    fn apply(&self, transition: Transition) {
        match transition {
            Transition::GoOnline => {
                tracing::info!(
                    target = "sso_bridge::controller",
                    "connection to broker restored"
                );
                self.inner.host.enable();
                self.spawn_reload();
            }
            Transition::Reload => self.spawn_reload(),
            Transition::GoOffline => {
                tracing::info!(target = "sso_bridge::controller", "lost connection to broker");
                self.inner.host.disable();
                self.logout();
            }
            Transition::Logout => self.logout(),
            Transition::Ignore => {}
        }
    }

    /// Clears the active account and resets the affordance.
    pub fn logout(&self) {
        let user_active = {
            let mut state = self.inner.state.lock();
            state.accounts.clear();
            state.connectivity.user_active()
        };
        self.inner.host.set_default_icon();
        self.inner.host.set_title(disabled_title(user_active));
    }

    fn spawn_reload(&self) {
        let engine = self.clone();
        tokio::spawn(async move {
            if let Err(error) = engine.reload_accounts().await {
                tracing::warn!(
                    target = "sso_bridge::controller",
                    error = %error,
                    "account reload failed"
                );
            }
        });
    }

    /// Queries the broker for accounts and selects the first as active.
    pub async fn reload_accounts(&self) -> BridgeResult<ReloadOutcome> {
        let ticket = self.inner.state.lock().accounts.begin_reload();
        let message = self.issue(BrokerCommand::GetAccounts).await?;
        let result = match message {
            BrokerMessage::Accounts(result) => result,
            other => return Err(unexpected(CommandKind::GetAccounts, &other)),
        };

        let outcome = self.inner.state.lock().accounts.apply_reload(ticket, result);
        match &outcome {
            ReloadOutcome::Selected(account) => {
                tracing::info!(
                    target = "sso_bridge::controller",
                    "active account: {}",
                    account.username
                );
                self.inner
                    .options
                    .events
                    .emit(
                        "active_account",
                        json!({
                            "username": account.username,
                            "accountId": account.identifier(),
                        }),
                    );
                self.inner.host.set_title(&active_title(&account.username));
                if self.inner.options.photo.is_some() {
                    self.load_avatar(ticket, account.clone()).await;
                }
            }
            ReloadOutcome::Empty => {
                tracing::info!(target = "sso_bridge::controller", "no accounts registered");
            }
            ReloadOutcome::Failed(reason) => {
                tracing::info!(
                    target = "sso_bridge::controller",
                    "could not get accounts: {reason}"
                );
            }
            ReloadOutcome::Superseded => {
                tracing::debug!(
                    target = "sso_bridge::controller",
                    "account reload superseded by logout"
                );
            }
        }
        Ok(outcome)
    }

    /// Token and photo round trips can outlive the selection; a logout in
    /// between leaves the default icon alone.
    async fn load_avatar(&self, ticket: u64, account: Account) {
        let Some(photo) = self.inner.options.photo.clone() else {
            return;
        };
        let token = match self.acquire_token_silently(account).await {
            Ok(token) => token,
            Err(error) => {
                tracing::info!(
                    target = "sso_bridge::controller",
                    "could not acquire token silently: {error}"
                );
                return;
            }
        };
        let Some(access_token) = token.access_token else {
            tracing::info!(
                target = "sso_bridge::controller",
                "broker token response carried no access token"
            );
            return;
        };
        tracing::info!(target = "sso_bridge::controller", "API token acquired");
        if !self.selection_is_current(ticket) {
            return;
        }

        match photo.fetch(&access_token).await {
            Ok(Some(image)) if self.selection_is_current(ticket) => {
                self.inner.host.set_avatar(image)
            }
            Ok(Some(_)) => {}
            Ok(None) => {
                tracing::info!(
                    target = "sso_bridge::controller",
                    "Warning: Could not get profile picture."
                );
            }
            Err(error) => {
                tracing::warn!(
                    target = "sso_bridge::controller",
                    error = %error,
                    "profile picture request failed"
                );
            }
        }
    }

    fn selection_is_current(&self, ticket: u64) -> bool {
        let current = self.inner.state.lock().accounts.is_current(ticket);
        if !current {
            tracing::debug!(
                target = "sso_bridge::controller",
                "account cleared; dropping profile picture"
            );
        }
        current
    }

    pub async fn acquire_token_silently(&self, account: Account) -> BridgeResult<TokenResponse> {
        let message = self
            .issue(BrokerCommand::AcquireTokenSilently { account })
            .await?;
        match message {
            BrokerMessage::Token(result) => result
                .map_err(|reason| BridgeError::command(CommandKind::AcquireTokenSilently, reason)),
            other => Err(unexpected(CommandKind::AcquireTokenSilently, &other)),
        }
    }

    pub async fn request_prt_cookie(
        &self,
        account: Account,
        sso_url: &str,
    ) -> BridgeResult<PrtCookie> {
        let message = self
            .issue(BrokerCommand::AcquirePrtSsoCookie {
                account,
                sso_url: sso_url.to_string(),
            })
            .await?;
        match message {
            BrokerMessage::PrtCookie(result) => result
                .map_err(|reason| BridgeError::command(CommandKind::AcquirePrtSsoCookie, reason)),
            other => Err(unexpected(CommandKind::AcquirePrtSsoCookie, &other)),
        }
    }

    /// Runs one request through the header injector.
    pub async fn intercept(&self, request: InterceptedRequest) -> Vec<Header> {
        let injector = self.inner.options.injector.clone();
        injector.on_before_send_headers(self, request).await
    }

    async fn issue(&self, command: BrokerCommand) -> BridgeResult<BrokerMessage> {
        self.inner
            .pending
            .issue(&self.inner.link, command, self.inner.options.request_timeout)
            .await
    }
}

impl SsoContext for Engine {
    fn sso_account(&self) -> Option<Account> {
        let state = self.inner.state.lock();
        if !state.connectivity.broker_online() {
            return None;
        }
        state.accounts.active().cloned()
    }

    async fn acquire_prt_cookie(
        &self,
        account: Account,
        sso_url: &str,
    ) -> BridgeResult<PrtCookie> {
        self.request_prt_cookie(account, sso_url).await
    }
}

fn unexpected(kind: CommandKind, message: &BrokerMessage) -> BridgeError {
    BridgeError::Protocol(format!("{kind} answered with {message:?}"))
}

#[derive(Clone)]
pub enum Startup {
    Started(Engine),
    AlreadyInitialized(Engine),
}

impl Startup {
    pub fn engine(&self) -> &Engine {
        match self {
            Startup::Started(engine) | Startup::AlreadyInitialized(engine) => engine,
        }
    }
}

/// One-shot startup guard. A second `start` hands back the running engine
/// without opening another channel.
#[derive(Default)]
pub struct Lifecycle {
    engine: Mutex<Option<Engine>>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start<F>(
        &self,
        connect: F,
        host: Arc<dyn HostUi>,
        options: EngineOptions,
    ) -> Result<Startup>
    where
        F: FnOnce() -> Result<(BrokerLink, mpsc::Receiver<LinkEvent>)>,
    {
        tracing::info!(target = "sso_bridge::controller", "start sso-mib");
        let mut slot = self.engine.lock();
        if let Some(engine) = slot.as_ref() {
            tracing::info!(target = "sso_bridge::controller", "sso-mib already initialized");
            return Ok(Startup::AlreadyInitialized(engine.clone()));
        }

        let (link, events) = connect()?;
        let engine = Engine::new(link, host, options);
        engine.inner.host.disable();
        engine.logout();
        tokio::spawn(engine.clone().run(events));

        *slot = Some(engine.clone());
        Ok(Startup::Started(engine))
    }
}
