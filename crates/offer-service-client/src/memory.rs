use crate::{BackendError, CreateOfferRequest, OfferBackend, Result, UpdateOfferRequest};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::{DashMap, DashSet};
use offer_models::{Offer, OfferId, OrderId};
use tracing::debug;
use uuid::Uuid;

/// Statuses an offer may be moved to.
pub const OFFER_STATUSES: [&str; 4] = ["pending", "accepted", "rejected", "cancelled"];

/// Offer service kept in process memory.
///
/// Backs the gateway's `--dev` mode and the test suites. Mirrors the
/// classification the real service uses: unknown offers are `NotFound`,
/// unknown statuses and closed orders are `InvalidArgument`.
#[derive(Debug, Default)]
pub struct InMemoryOfferBackend {
    offers: DashMap<OfferId, Offer>,
    closed_orders: DashSet<OrderId>,
}

impl InMemoryOfferBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject any further offers on `order_id`.
    pub fn close_order(&self, order_id: OrderId) {
        self.closed_orders.insert(order_id);
    }

    #[must_use]
    pub fn offer_count(&self) -> usize {
        self.offers.len()
    }
}

#[async_trait]
impl OfferBackend for InMemoryOfferBackend {
    async fn create_offer(&self, request: CreateOfferRequest) -> Result<Offer> {
        if self.closed_orders.contains(&request.order_id) {
            return Err(BackendError::InvalidArgument {
                message: format!("order {} is closed", request.order_id),
            });
        }

        let now = Utc::now();
        let offer = Offer {
            id: OfferId::new(Uuid::new_v4().to_string()),
            order_id: request.order_id,
            master_id: request.master_id,
            price: request.price,
            status: "pending".to_string(),
            created_at: Some(now),
            updated_at: Some(now),
        };

        debug!(offer_id = %offer.id, order_id = %offer.order_id, "Stored offer");
        self.offers.insert(offer.id.clone(), offer.clone());
        Ok(offer)
    }

    async fn update_offer(&self, request: UpdateOfferRequest) -> Result<Offer> {
        if !OFFER_STATUSES.contains(&request.status.as_str()) {
            return Err(BackendError::InvalidArgument {
                message: format!("unknown offer status '{}'", request.status),
            });
        }

        let mut offer =
            self.offers
                .get_mut(&request.offer_id)
                .ok_or_else(|| BackendError::NotFound {
                    message: "offer not found".to_string(),
                })?;

        offer.status = request.status;
        offer.updated_at = Some(Utc::now());
        Ok(offer.clone())
    }

    async fn list_offers_for_order(&self, order_id: &OrderId) -> Result<Vec<Offer>> {
        let mut offers: Vec<Offer> = self
            .offers
            .iter()
            .filter(|entry| &entry.order_id == order_id)
            .map(|entry| entry.value().clone())
            .collect();
        offers.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(offers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use offer_models::PrincipalId;

    fn create(order_id: &str) -> CreateOfferRequest {
        CreateOfferRequest {
            order_id: OrderId::from(order_id),
            master_id: PrincipalId::from("m-1"),
            price: 42.0,
        }
    }

    #[tokio::test]
    async fn test_create_update_list() {
        let backend = InMemoryOfferBackend::new();

        let offer = backend.create_offer(create("O1")).await.unwrap();
        backend.create_offer(create("O2")).await.unwrap();
        assert_eq!(offer.status, "pending");

        let updated = backend
            .update_offer(UpdateOfferRequest {
                offer_id: offer.id.clone(),
                status: "accepted".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(updated.status, "accepted");
        assert_eq!(updated.order_id, OrderId::from("O1"));

        let offers = backend
            .list_offers_for_order(&OrderId::from("O1"))
            .await
            .unwrap();
        assert_eq!(offers, vec![updated]);
        assert_eq!(backend.offer_count(), 2);
    }

    #[tokio::test]
    async fn test_errors() {
        let backend = InMemoryOfferBackend::new();

        let err = backend
            .update_offer(UpdateOfferRequest {
                offer_id: OfferId::from("nope"),
                status: "accepted".to_string(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");

        let offer = backend.create_offer(create("O1")).await.unwrap();
        let err = backend
            .update_offer(UpdateOfferRequest {
                offer_id: offer.id,
                status: "maybe".to_string(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_argument");

        backend.close_order(OrderId::from("O1"));
        let err = backend.create_offer(create("O1")).await.unwrap_err();
        assert_eq!(err.message(), "order O1 is closed");
    }
}
