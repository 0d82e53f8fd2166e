use crate::Action;
use offer_models::{OfferId, OrderId, PrincipalId};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::value::RawValue;
use snafu::Snafu;

/// Why an inbound frame could not be turned into a [`ClientCommand`].
///
/// All of these are recoverable: the connection answers with an error reply
/// and keeps reading.
#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum ProtocolError {
    #[snafu(display("frame is not a command envelope"))]
    InvalidFormat,

    #[snafu(display("unknown action '{}'", action))]
    UnknownAction { action: String },

    #[snafu(display("bad data for '{}': {}", action.as_str(), reason))]
    BadData { action: Action, reason: String },
}

impl ProtocolError {
    /// The action to echo back in the error reply, if one was recognized.
    #[must_use]
    pub fn action(&self) -> Option<Action> {
        match self {
            Self::BadData { action, .. } => Some(*action),
            _ => None,
        }
    }

    /// The client-facing error string.
    #[must_use]
    pub fn reply_text(&self) -> &'static str {
        match self {
            Self::InvalidFormat => crate::INVALID_FORMAT,
            Self::UnknownAction { .. } => crate::UNKNOWN_ACTION,
            Self::BadData { .. } => crate::BAD_DATA,
        }
    }
}

/// Only the action is decoded up front; the payload stays raw until the
/// action is known, so a bad payload is reported against its action.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    action: Option<String>,
    #[serde(default, alias = "payload")]
    data: Option<Box<RawValue>>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct OrderPayload {
    pub order_id: OrderId,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CreateOfferPayload {
    pub order_id: OrderId,
    #[serde(alias = "proposer_id")]
    pub master_id: PrincipalId,
    pub price: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UpdateOfferPayload {
    pub offer_id: OfferId,
    pub status: String,
}

/// A decoded and validated client command.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientCommand {
    Subscribe(OrderPayload),
    Unsubscribe(OrderPayload),
    CreateOffer(CreateOfferPayload),
    UpdateOffer(UpdateOfferPayload),
    ListOffers(OrderPayload),
}

impl ClientCommand {
    #[must_use]
    pub fn action(&self) -> Action {
        match self {
            Self::Subscribe(_) => Action::Subscribe,
            Self::Unsubscribe(_) => Action::Unsubscribe,
            Self::CreateOffer(_) => Action::CreateOffer,
            Self::UpdateOffer(_) => Action::UpdateOffer,
            Self::ListOffers(_) => Action::ListOffers,
        }
    }
}

/// Parse one inbound text frame.
pub fn parse_command(text: &str) -> Result<ClientCommand, ProtocolError> {
    let envelope: Envelope =
        serde_json::from_str(text).map_err(|_| ProtocolError::InvalidFormat)?;

    let name = envelope.action.unwrap_or_default();
    let action = Action::from_inbound(&name)
        .ok_or_else(|| ProtocolError::UnknownAction { action: name.clone() })?;

    let command = match action {
        Action::Subscribe => ClientCommand::Subscribe(order_payload(action, envelope.data)?),
        Action::Unsubscribe => ClientCommand::Unsubscribe(order_payload(action, envelope.data)?),
        Action::ListOffers => ClientCommand::ListOffers(order_payload(action, envelope.data)?),
        Action::CreateOffer => {
            let payload: CreateOfferPayload = decode(action, envelope.data)?;
            require_id(action, "order_id", payload.order_id.is_empty())?;
            require_id(action, "master_id", payload.master_id.is_empty())?;
            if !payload.price.is_finite() || payload.price <= 0.0 {
                return Err(bad_data(action, "price must be a positive number"));
            }
            ClientCommand::CreateOffer(payload)
        }
        Action::UpdateOffer => {
            let payload: UpdateOfferPayload = decode(action, envelope.data)?;
            require_id(action, "offer_id", payload.offer_id.is_empty())?;
            require_id(action, "status", payload.status.trim().is_empty())?;
            ClientCommand::UpdateOffer(payload)
        }
        Action::OfferCreated | Action::OfferUpdated => {
            return Err(ProtocolError::UnknownAction { action: name })
        }
    };

    Ok(command)
}

fn order_payload(
    action: Action,
    data: Option<Box<RawValue>>,
) -> Result<OrderPayload, ProtocolError> {
    let payload: OrderPayload = decode(action, data)?;
    require_id(action, "order_id", payload.order_id.is_empty())?;
    Ok(payload)
}

fn decode<T: DeserializeOwned>(
    action: Action,
    data: Option<Box<RawValue>>,
) -> Result<T, ProtocolError> {
    let raw = data.as_deref().map_or("null", RawValue::get);
    serde_json::from_str(raw).map_err(|e| bad_data(action, e.to_string()))
}

fn require_id(action: Action, field: &str, missing: bool) -> Result<(), ProtocolError> {
    if missing {
        return Err(bad_data(action, format!("{field} must not be empty")));
    }
    Ok(())
}

fn bad_data(action: Action, reason: impl Into<String>) -> ProtocolError {
    ProtocolError::BadData {
        action,
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_create_offer() {
        let command = parse_command(
            r#"{"action":"createOffer","data":{"order_id":"O1","master_id":"m-1","price":120}}"#,
        )
        .unwrap();

        assert_eq!(
            command,
            ClientCommand::CreateOffer(CreateOfferPayload {
                order_id: OrderId::from("O1"),
                master_id: PrincipalId::from("m-1"),
                price: 120.0,
            })
        );
    }

    #[test]
    fn test_payload_alias() {
        let command =
            parse_command(r#"{"action":"subscribe","payload":{"order_id":"O1"}}"#).unwrap();
        assert_eq!(command.action(), Action::Subscribe);
    }

    #[test]
    fn test_not_an_envelope() {
        assert_eq!(parse_command("hello"), Err(ProtocolError::InvalidFormat));
        assert_eq!(parse_command("[1,2]"), Err(ProtocolError::InvalidFormat));
        assert_eq!(
            parse_command(r#"{"action":7}"#),
            Err(ProtocolError::InvalidFormat)
        );
    }

    #[test]
    fn test_missing_action_is_unknown() {
        for text in [r#"{"data":{"order_id":"O1"}}"#, r#"{"action":null}"#, "{}"] {
            let err = parse_command(text).unwrap_err();
            assert_eq!(
                err,
                ProtocolError::UnknownAction {
                    action: String::new()
                }
            );
            assert_eq!(err.reply_text(), crate::UNKNOWN_ACTION);
        }
    }

    #[test]
    fn test_unrepresentable_payload_is_bad_data() {
        let err = parse_command(
            r#"{"action":"createOffer","data":{"order_id":"O1","master_id":"m","price":1e400}}"#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::BadData {
                action: Action::CreateOffer,
                ..
            }
        ));
        assert_eq!(err.reply_text(), crate::BAD_DATA);

        let err = parse_command(r#"{"action":"subscribe","data":null}"#).unwrap_err();
        assert_eq!(err.action(), Some(Action::Subscribe));
    }

    #[test]
    fn test_proposer_id_alias() {
        let command = parse_command(
            r#"{"action":"createOffer","data":{"order_id":"O1","proposer_id":"p-1","price":4.5}}"#,
        )
        .unwrap();

        match command {
            ClientCommand::CreateOffer(payload) => {
                assert_eq!(payload.master_id, PrincipalId::from("p-1"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_unknown_action() {
        let err = parse_command(r#"{"action":"deleteOrder","data":{}}"#).unwrap_err();
        assert_eq!(err.reply_text(), crate::UNKNOWN_ACTION);
        assert_eq!(err.action(), None);

        // broadcast-only actions cannot be injected by clients
        let err = parse_command(r#"{"action":"offerCreated","data":{}}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownAction { .. }));
    }

    #[test]
    fn test_bad_data_keeps_action() {
        let err = parse_command(r#"{"action":"updateOffer","data":{"offer_id":7}}"#).unwrap_err();
        assert_eq!(err.action(), Some(Action::UpdateOffer));
        assert_eq!(err.reply_text(), crate::BAD_DATA);

        let err = parse_command(r#"{"action":"listOffers"}"#).unwrap_err();
        assert_eq!(err.action(), Some(Action::ListOffers));
    }

    #[test]
    fn test_validation() {
        let err = parse_command(
            r#"{"action":"createOffer","data":{"order_id":"O1","master_id":"m-1","price":-3}}"#,
        )
        .unwrap_err();
        assert_eq!(err.action(), Some(Action::CreateOffer));

        let err = parse_command(r#"{"action":"subscribe","data":{"order_id":""}}"#).unwrap_err();
        assert_eq!(err.action(), Some(Action::Subscribe));

        let err = parse_command(r#"{"action":"updateOffer","data":{"offer_id":"X","status":" "}}"#)
            .unwrap_err();
        assert_eq!(err.reply_text(), crate::BAD_DATA);
    }
}
