use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{BridgeError, BridgeResult};

/// Native messaging host name the broker registers under.
pub const HOST_NAME: &str = "sso_mib";

/// Request/response command kinds. `brokerStateChanged` is broker-initiated
/// and never issued, so it has no kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CommandKind {
    GetAccounts,
    AcquireTokenSilently,
    AcquirePrtSsoCookie,
}

impl CommandKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CommandKind::GetAccounts => "getAccounts",
            CommandKind::AcquireTokenSilently => "acquireTokenSilently",
            CommandKind::AcquirePrtSsoCookie => "acquirePrtSsoCookie",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An identity registered with the broker. Kept verbatim so it can be echoed
/// back in later commands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub username: String,
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl Account {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            attributes: Map::new(),
        }
    }

    pub fn with_attribute(mut self, key: &str, value: Value) -> Self {
        self.attributes.insert(key.to_string(), value);
        self
    }

    /// Broker-side identifier, whichever field the broker populated.
    pub fn identifier(&self) -> Option<String> {
        ["homeAccountId", "localAccountId", "id"]
            .iter()
            .find_map(|key| self.attributes.get(*key))
            .map(|value| match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenResponse {
    #[serde(rename = "accessToken", default)]
    pub access_token: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrtCookie {
    pub cookie_name: String,
    pub cookie_content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "command", rename_all = "camelCase")]
pub enum BrokerCommand {
    GetAccounts,
    AcquireTokenSilently {
        account: Account,
    },
    #[serde(rename_all = "camelCase")]
    AcquirePrtSsoCookie {
        account: Account,
        sso_url: String,
    },
}

impl BrokerCommand {
    pub fn kind(&self) -> CommandKind {
        match self {
            BrokerCommand::GetAccounts => CommandKind::GetAccounts,
            BrokerCommand::AcquireTokenSilently { .. } => CommandKind::AcquireTokenSilently,
            BrokerCommand::AcquirePrtSsoCookie { .. } => CommandKind::AcquirePrtSsoCookie,
        }
    }
}

/// A command as it goes on the wire, tagged with a correlation id.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundFrame {
    #[serde(flatten)]
    pub command: BrokerCommand,
    pub request_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerState {
    Online,
    Offline,
}

/// Decoded broker message. Command errors stay inside the variant so the
/// waiting caller decides how to degrade.
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerMessage {
    Accounts(Result<Vec<Account>, String>),
    Token(Result<TokenResponse, String>),
    PrtCookie(Result<PrtCookie, String>),
    StateChanged(BrokerState),
}

impl BrokerMessage {
    pub fn kind(&self) -> Option<CommandKind> {
        match self {
            BrokerMessage::Accounts(_) => Some(CommandKind::GetAccounts),
            BrokerMessage::Token(_) => Some(CommandKind::AcquireTokenSilently),
            BrokerMessage::PrtCookie(_) => Some(CommandKind::AcquirePrtSsoCookie),
            BrokerMessage::StateChanged(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    pub request_id: Option<String>,
    pub message: BrokerMessage,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawInbound {
    command: String,
    #[serde(default)]
    message: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
    #[serde(default)]
    request_id: Option<String>,
}

#[derive(Deserialize)]
struct AccountsPayload {
    accounts: Vec<Account>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenPayload {
    broker_token_response: TokenResponse,
}

pub fn encode(frame: &OutboundFrame) -> BridgeResult<Vec<u8>> {
    serde_json::to_vec(frame).map_err(|error| BridgeError::Protocol(error.to_string()))
}

pub fn decode(bytes: &[u8]) -> BridgeResult<Inbound> {
    let raw: RawInbound =
        serde_json::from_slice(bytes).map_err(|error| BridgeError::Protocol(error.to_string()))?;

    // Errors arrive either beside `message` or nested inside it.
    let error = raw.error.clone().or_else(|| {
        raw.message
            .as_ref()
            .and_then(|message| message.get("error"))
            .cloned()
    });

    let message = match raw.command.as_str() {
        "getAccounts" => BrokerMessage::Accounts(
            payload::<AccountsPayload>(&raw, error).map(|payload| payload.accounts),
        ),
        "acquireTokenSilently" => BrokerMessage::Token(
            payload::<TokenPayload>(&raw, error).map(|payload| payload.broker_token_response),
        ),
        "acquirePrtSsoCookie" => BrokerMessage::PrtCookie(payload::<PrtCookie>(&raw, error)),
        "brokerStateChanged" => {
            let state = match raw.message.as_ref().and_then(Value::as_str) {
                Some("online") => BrokerState::Online,
                _ => BrokerState::Offline,
            };
            BrokerMessage::StateChanged(state)
        }
        other => return Err(BridgeError::Protocol(format!("unknown command: {other}"))),
    };

    Ok(Inbound {
        request_id: raw.request_id,
        message,
    })
}

fn payload<T: serde::de::DeserializeOwned>(
    raw: &RawInbound,
    error: Option<Value>,
) -> Result<T, String> {
    if let Some(error) = error {
        return Err(error_text(error));
    }
    let message = raw
        .message
        .clone()
        .ok_or_else(|| format!("{} response carried no message", raw.command))?;
    serde_json::from_value(message)
        .map_err(|error| format!("malformed {} payload: {error}", raw.command))
}

fn error_text(error: Value) -> String {
    match error {
        Value::String(text) => text,
        other => other.to_string(),
    }
}
