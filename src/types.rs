/// file: src/types.rs
/// description: inbound event and outbound message types for the pipe-delimited channel protocol
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

// The nested status record is produced by another service; accept nulls and
// the loose number/string typing it is known to send
mod lenient {
    use super::*;
    use serde_json::Value;

    pub fn string<'de, D>(deserializer: D) -> Result<String, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Value::deserialize(deserializer)? {
            Value::Null => Ok(String::new()),
            Value::String(s) => Ok(s),
            Value::Number(n) => Ok(n.to_string()),
            Value::Bool(b) => Ok(b.to_string()),
            other => Err(serde::de::Error::custom(format!(
                "expected string or number, got {other}"
            ))),
        }
    }

    pub fn integer<'de, D>(deserializer: D) -> Result<i64, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        let parsed = match &value {
            Value::Null => Some(0),
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        };
        parsed.ok_or_else(|| {
            serde::de::Error::custom(format!("expected an integer status, got {value}"))
        })
    }
}

/// The six event types the server can push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EventKind {
    BalanceRequested,
    InGameCurrencyDeposit,
    NftLinkStatusChanged,
    InGameCurrencyWithdrawal,
    RollbackWithdrawal,
    #[serde(rename = "ping")]
    Ping,
}

impl EventKind {
    pub const ALL: [EventKind; 6] = [
        EventKind::BalanceRequested,
        EventKind::InGameCurrencyDeposit,
        EventKind::NftLinkStatusChanged,
        EventKind::InGameCurrencyWithdrawal,
        EventKind::RollbackWithdrawal,
        EventKind::Ping,
    ];

    /// Tag as it appears in the first field of an inbound frame.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::BalanceRequested => "BalanceRequested",
            EventKind::InGameCurrencyDeposit => "InGameCurrencyDeposit",
            EventKind::NftLinkStatusChanged => "NftLinkStatusChanged",
            EventKind::InGameCurrencyWithdrawal => "InGameCurrencyWithdrawal",
            EventKind::RollbackWithdrawal => "RollbackWithdrawal",
            EventKind::Ping => "ping",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown event type: {s}"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceRequested {
    pub request_id: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InGameCurrencyDeposit {
    pub request_id: String,
    pub email: String,
    pub balance_increase: f64,
    pub tx_hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InGameCurrencyWithdrawal {
    pub request_id: String,
    pub email: String,
    pub balance_decrease: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackWithdrawal {
    pub request_id: String,
    pub email: String,
    pub balance_increase: f64,
    pub tx_hash: String,
}

/// Nested JSON record carried by `NftLinkStatusChanged`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NftLinkStatus {
    #[serde(default, deserialize_with = "lenient::string")]
    pub user_email: String,
    #[serde(default, deserialize_with = "lenient::string")]
    pub wallet_address: String,
    #[serde(default, deserialize_with = "lenient::string")]
    pub token_address: String,
    #[serde(default, deserialize_with = "lenient::integer")]
    pub status: i64,
    #[serde(default, deserialize_with = "lenient::string")]
    pub metadata: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NftLinkStatusChanged {
    pub request_id: String,
    pub status: NftLinkStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Ping {
    pub request_id: String,
}

/// One decoded inbound frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event")]
pub enum Event {
    BalanceRequested(BalanceRequested),
    InGameCurrencyDeposit(InGameCurrencyDeposit),
    NftLinkStatusChanged(NftLinkStatusChanged),
    InGameCurrencyWithdrawal(InGameCurrencyWithdrawal),
    RollbackWithdrawal(RollbackWithdrawal),
    #[serde(rename = "ping")]
    Ping(Ping),
    Unrecognized { tag: String },
}

impl Event {
    /// `None` for frames with a tag outside the known set.
    pub fn kind(&self) -> Option<EventKind> {
        match self {
            Event::BalanceRequested(_) => Some(EventKind::BalanceRequested),
            Event::InGameCurrencyDeposit(_) => Some(EventKind::InGameCurrencyDeposit),
            Event::NftLinkStatusChanged(_) => Some(EventKind::NftLinkStatusChanged),
            Event::InGameCurrencyWithdrawal(_) => Some(EventKind::InGameCurrencyWithdrawal),
            Event::RollbackWithdrawal(_) => Some(EventKind::RollbackWithdrawal),
            Event::Ping(_) => Some(EventKind::Ping),
            Event::Unrecognized { .. } => None,
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        match self {
            Event::BalanceRequested(e) => Some(&e.request_id),
            Event::InGameCurrencyDeposit(e) => Some(&e.request_id),
            Event::NftLinkStatusChanged(e) => Some(&e.request_id),
            Event::InGameCurrencyWithdrawal(e) => Some(&e.request_id),
            Event::RollbackWithdrawal(e) => Some(&e.request_id),
            Event::Ping(e) => Some(&e.request_id),
            Event::Unrecognized { .. } => None,
        }
    }
}

/// Client to server messages. The bearer token is not part of the message;
/// it is stamped on when the frame is encoded for the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    Connect,
    Accepted {
        request_id: String,
    },
    Balance {
        request_id: String,
        email: String,
        balance: f64,
    },
    /// Used for both withdrawal and rollback outcomes.
    WithdrawalResult {
        request_id: String,
        result: String,
    },
    Pong {
        request_id: String,
    },
}

impl OutboundMessage {
    pub fn tag(&self) -> &'static str {
        match self {
            OutboundMessage::Connect => "connect",
            OutboundMessage::Accepted { .. } => "accepted",
            OutboundMessage::Balance { .. } => "balance",
            OutboundMessage::WithdrawalResult { .. } => "withdrawal",
            OutboundMessage::Pong { .. } => "pong",
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        match self {
            OutboundMessage::Connect => None,
            OutboundMessage::Accepted { request_id }
            | OutboundMessage::Balance { request_id, .. }
            | OutboundMessage::WithdrawalResult { request_id, .. }
            | OutboundMessage::Pong { request_id } => Some(request_id),
        }
    }

    /// Checks the no-escaping precondition: text fields must not contain the
    /// separator or a line terminator, and the balance must be finite.
    pub fn validate(&self) -> Result<(), String> {
        let text_fields: Vec<&str> = match self {
            OutboundMessage::Connect => Vec::new(),
            OutboundMessage::Accepted { request_id } | OutboundMessage::Pong { request_id } => {
                vec![request_id.as_str()]
            }
            OutboundMessage::Balance {
                request_id,
                email,
                balance,
            } => {
                if !balance.is_finite() {
                    return Err(format!("balance {balance} is not finite"));
                }
                vec![request_id.as_str(), email.as_str()]
            }
            OutboundMessage::WithdrawalResult { request_id, result } => {
                vec![request_id.as_str(), result.as_str()]
            }
        };

        match text_fields
            .iter()
            .find(|field| field.contains(['|', '\r', '\n']))
        {
            Some(field) => Err(format!("field {field:?} contains a reserved character")),
            None => Ok(()),
        }
    }
}
