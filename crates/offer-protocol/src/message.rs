use offer_models::{Offer, OrderId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Action {
    Subscribe,
    Unsubscribe,
    CreateOffer,
    UpdateOffer,
    ListOffers,
    /// Pushed to the other subscribers of an order after a successful create
    OfferCreated,
    /// Pushed to the other subscribers of an order after a successful update
    OfferUpdated,
}

impl Action {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
            Self::CreateOffer => "createOffer",
            Self::UpdateOffer => "updateOffer",
            Self::ListOffers => "listOffers",
            Self::OfferCreated => "offerCreated",
            Self::OfferUpdated => "offerUpdated",
        }
    }

    /// Actions a client may send. Broadcast-only actions are not accepted inbound.
    #[must_use]
    pub fn from_inbound(action: &str) -> Option<Self> {
        match action {
            "subscribe" => Some(Self::Subscribe),
            "unsubscribe" => Some(Self::Unsubscribe),
            "createOffer" => Some(Self::CreateOffer),
            "updateOffer" => Some(Self::UpdateOffer),
            "listOffers" => Some(Self::ListOffers),
            _ => None,
        }
    }
}

/// A frame sent from the gateway to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Offer { action: Action, offer: Offer },
    Offers { action: Action, offers: Vec<Offer> },
    Subscription { action: Action, order_id: OrderId },
    ActionError { action: Action, error: String },
    Error { error: String },
}

impl ServerMessage {
    pub fn offer(action: Action, offer: Offer) -> Self {
        Self::Offer { action, offer }
    }

    pub fn offers(action: Action, offers: Vec<Offer>) -> Self {
        Self::Offers { action, offers }
    }

    pub fn subscription(action: Action, order_id: OrderId) -> Self {
        Self::Subscription { action, order_id }
    }

    pub fn action_error(action: Action, error: impl Into<String>) -> Self {
        Self::ActionError {
            action,
            error: error.into(),
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self::Error {
            error: error.into(),
        }
    }

    #[must_use]
    pub fn action(&self) -> Option<Action> {
        match self {
            Self::Offer { action, .. }
            | Self::Offers { action, .. }
            | Self::Subscription { action, .. }
            | Self::ActionError { action, .. } => Some(*action),
            Self::Error { .. } => None,
        }
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(self, Self::ActionError { .. } | Self::Error { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use offer_models::{OfferId, PrincipalId};
    use serde_json::json;

    fn offer() -> Offer {
        Offer {
            id: OfferId::from("X"),
            order_id: OrderId::from("O1"),
            master_id: PrincipalId::from("m-1"),
            price: 100.0,
            status: "accepted".to_string(),
            created_at: None,
            updated_at: None,
        }
    }

    #[test]
    fn test_broadcast_shape() {
        let msg = ServerMessage::offer(Action::OfferUpdated, offer());
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["action"], "offerUpdated");
        assert_eq!(value["offer"]["status"], "accepted");
    }

    #[test]
    fn test_error_shapes() {
        let value = serde_json::to_value(ServerMessage::action_error(
            Action::CreateOffer,
            crate::BAD_DATA,
        ))
        .unwrap();
        assert_eq!(value, json!({"action": "createOffer", "error": "bad data"}));

        let value = serde_json::to_value(ServerMessage::error(crate::UNKNOWN_ACTION)).unwrap();
        assert_eq!(value, json!({"error": "unknown action"}));
    }

    #[test]
    fn test_client_side_decoding() {
        let parsed: ServerMessage =
            serde_json::from_value(json!({"action": "listOffers", "offers": []})).unwrap();
        assert_eq!(parsed, ServerMessage::offers(Action::ListOffers, vec![]));

        let parsed: ServerMessage =
            serde_json::from_value(json!({"action": "subscribe", "order_id": "O1"})).unwrap();
        assert_eq!(parsed.action(), Some(Action::Subscribe));
        assert!(!parsed.is_error());
    }

    #[test]
    fn test_broadcast_actions_are_not_inbound() {
        assert_eq!(Action::from_inbound("offerCreated"), None);
        assert_eq!(Action::from_inbound("createOffer"), Some(Action::CreateOffer));
    }
}
