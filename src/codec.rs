//! Pipe-delimited frame encoding and decoding.
//!
//! Pure functions, no I/O. A frame is the tag followed by its fields, joined
//! with `|`:
//!
//! ```text
//! accepted|<token>|<requestId>
//! InGameCurrencyDeposit|<requestId>|<email>|<balanceIncrease>|<txHash>
//! ```
//!
//! No escaping is performed. Callers must not put `|` (or a line terminator)
//! inside a field value; [`OutboundMessage::validate`] checks this before a
//! message is sent.

use crate::error::ParseError;
use crate::types::{
    BalanceRequested, Event, EventKind, InGameCurrencyDeposit, InGameCurrencyWithdrawal,
    NftLinkStatusChanged, OutboundMessage, Ping, RollbackWithdrawal,
};

pub const SEPARATOR: &str = "|";

/// Encodes an outbound message, stamping `token` in the second field.
pub fn encode(message: &OutboundMessage, token: &str) -> String {
    let tag = message.tag();
    match message {
        OutboundMessage::Connect => [tag, token].join(SEPARATOR),
        OutboundMessage::Accepted { request_id } | OutboundMessage::Pong { request_id } => {
            [tag, token, request_id.as_str()].join(SEPARATOR)
        }
        OutboundMessage::Balance {
            request_id,
            email,
            balance,
        } => {
            let balance = balance.to_string();
            [tag, token, request_id.as_str(), email.as_str(), balance.as_str()].join(SEPARATOR)
        }
        OutboundMessage::WithdrawalResult { request_id, result } => {
            [tag, token, request_id.as_str(), result.as_str()].join(SEPARATOR)
        }
    }
}

/// Decodes one complete inbound frame (without its line terminator).
///
/// Unknown tags decode to [`Event::Unrecognized`] and never fail. Extra
/// trailing fields are ignored.
pub fn decode(frame: &str) -> Result<Event, ParseError> {
    let (tag, rest) = match frame.split_once(SEPARATOR) {
        Some((tag, rest)) => (tag, Some(rest)),
        None => (frame, None),
    };

    let Ok(kind) = tag.parse::<EventKind>() else {
        return Ok(Event::Unrecognized {
            tag: tag.to_string(),
        });
    };

    let mut fields = Fields {
        tag: kind.as_str(),
        rest,
    };

    let event = match kind {
        EventKind::BalanceRequested => Event::BalanceRequested(BalanceRequested {
            request_id: fields.text("requestId")?,
            email: fields.text("email")?,
        }),
        EventKind::InGameCurrencyDeposit => Event::InGameCurrencyDeposit(InGameCurrencyDeposit {
            request_id: fields.text("requestId")?,
            email: fields.text("email")?,
            balance_increase: fields.number("balanceIncrease")?,
            tx_hash: fields.text("txHash")?,
        }),
        EventKind::NftLinkStatusChanged => {
            let request_id = fields.text("requestId")?;
            // The JSON payload is the rest of the frame, pipes included.
            let payload = fields.remainder("payload")?;
            Event::NftLinkStatusChanged(NftLinkStatusChanged {
                request_id,
                status: serde_json::from_str(payload)?,
            })
        }
        EventKind::InGameCurrencyWithdrawal => {
            Event::InGameCurrencyWithdrawal(InGameCurrencyWithdrawal {
                request_id: fields.text("requestId")?,
                email: fields.text("email")?,
                balance_decrease: fields.number("balanceDecrease")?,
            })
        }
        EventKind::RollbackWithdrawal => Event::RollbackWithdrawal(RollbackWithdrawal {
            request_id: fields.text("requestId")?,
            email: fields.text("email")?,
            balance_increase: fields.number("balanceIncrease")?,
            tx_hash: fields.text("txHash")?,
        }),
        EventKind::Ping => Event::Ping(Ping {
            request_id: fields.text("requestId")?,
        }),
    };

    Ok(event)
}

/// Cursor over the fields following the tag.
struct Fields<'a> {
    tag: &'static str,
    rest: Option<&'a str>,
}

impl<'a> Fields<'a> {
    fn next(&mut self, field: &'static str) -> Result<&'a str, ParseError> {
        let rest = self.rest.ok_or(ParseError::MissingField {
            tag: self.tag,
            field,
        })?;
        match rest.split_once(SEPARATOR) {
            Some((head, tail)) => {
                self.rest = Some(tail);
                Ok(head)
            }
            None => {
                self.rest = None;
                Ok(rest)
            }
        }
    }

    fn text(&mut self, field: &'static str) -> Result<String, ParseError> {
        self.next(field).map(str::to_string)
    }

    fn number(&mut self, field: &'static str) -> Result<f64, ParseError> {
        let raw = self.next(field)?;
        match raw.trim().parse::<f64>() {
            Ok(value) if value.is_finite() => Ok(value),
            _ => Err(ParseError::InvalidNumber {
                field,
                value: raw.to_string(),
            }),
        }
    }

    fn remainder(&mut self, field: &'static str) -> Result<&'a str, ParseError> {
        self.rest.take().ok_or(ParseError::MissingField {
            tag: self.tag,
            field,
        })
    }
}
