//! Routes decoded client commands to the offer service and the registry.

use crate::{registry::SubscriptionRegistry, sender::ConnectionSender};
use offer_models::{Offer, PrincipalId};
use offer_protocol::{parse_command, Action, ClientCommand, ServerMessage};
use offer_service_client::{BackendError, CreateOfferRequest, OfferBackend, UpdateOfferRequest};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Shared by every session. Holds no per-connection state; the caller owns
/// ordering by awaiting one dispatch before reading the next frame.
pub struct Dispatcher {
    registry: Arc<SubscriptionRegistry>,
    backend: Arc<dyn OfferBackend>,
}

impl Dispatcher {
    pub fn new(registry: Arc<SubscriptionRegistry>, backend: Arc<dyn OfferBackend>) -> Self {
        Self { registry, backend }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// Handle one inbound text frame and return the reply for its sender.
    ///
    /// Exactly one reply is produced per frame. Mutations that succeed are
    /// also pushed to the other subscribers of the affected order before this
    /// returns.
    pub async fn dispatch(
        &self,
        principal: &PrincipalId,
        sender: &ConnectionSender,
        text: &str,
    ) -> ServerMessage {
        match parse_command(text) {
            Ok(command) => self.execute(principal, sender, command).await,
            Err(e) => {
                debug!(
                    connection_id = %sender.connection_id(),
                    error = %e,
                    "Rejected inbound frame"
                );
                match e.action() {
                    Some(action) => ServerMessage::action_error(action, e.reply_text()),
                    None => ServerMessage::error(e.reply_text()),
                }
            }
        }
    }

    pub async fn execute(
        &self,
        principal: &PrincipalId,
        sender: &ConnectionSender,
        command: ClientCommand,
    ) -> ServerMessage {
        let action = command.action();

        match command {
            ClientCommand::Subscribe(payload) => {
                self.registry.subscribe(&payload.order_id, sender);
                ServerMessage::subscription(action, payload.order_id)
            }
            ClientCommand::Unsubscribe(payload) => {
                self.registry
                    .unsubscribe(&payload.order_id, sender.connection_id());
                ServerMessage::subscription(action, payload.order_id)
            }
            ClientCommand::CreateOffer(payload) => {
                let request = CreateOfferRequest {
                    order_id: payload.order_id,
                    master_id: payload.master_id,
                    price: payload.price,
                };
                match self.backend.create_offer(request).await {
                    Ok(offer) => {
                        info!(
                            principal = %principal,
                            offer_id = %offer.id,
                            order_id = %offer.order_id,
                            "Offer created"
                        );
                        self.publish(Action::OfferCreated, &offer, sender).await;
                        ServerMessage::offer(action, offer)
                    }
                    Err(e) => backend_failure(action, principal, e),
                }
            }
            ClientCommand::UpdateOffer(payload) => {
                let request = UpdateOfferRequest {
                    offer_id: payload.offer_id,
                    status: payload.status,
                };
                match self.backend.update_offer(request).await {
                    Ok(offer) => {
                        info!(
                            principal = %principal,
                            offer_id = %offer.id,
                            order_id = %offer.order_id,
                            status = %offer.status,
                            "Offer updated"
                        );
                        self.publish(Action::OfferUpdated, &offer, sender).await;
                        ServerMessage::offer(action, offer)
                    }
                    Err(e) => backend_failure(action, principal, e),
                }
            }
            ClientCommand::ListOffers(payload) => {
                match self.backend.list_offers_for_order(&payload.order_id).await {
                    Ok(offers) => ServerMessage::offers(action, offers),
                    Err(e) => backend_failure(action, principal, e),
                }
            }
        }
    }

    /// Fan the new offer snapshot out to the order it belongs to, skipping
    /// the connection that caused it (it gets the direct reply instead).
    async fn publish(&self, action: Action, offer: &Offer, origin: &ConnectionSender) {
        let event = ServerMessage::offer(action, offer.clone());
        self.registry
            .broadcast_except(&offer.order_id, &event, origin.connection_id())
            .await;
    }
}

fn backend_failure(action: Action, principal: &PrincipalId, error: BackendError) -> ServerMessage {
    warn!(
        principal = %principal,
        action = action.as_str(),
        kind = error.kind(),
        error = %error,
        "Offer service call failed"
    );
    ServerMessage::action_error(action, error.message())
}
