//! Client side of the offer service.
//!
//! The gateway only talks to the offer service through [`OfferBackend`]:
//! three request/response calls that either return an [`Offer`] snapshot or a
//! classified [`BackendError`]. Retries, persistence and business rules live
//! behind this boundary.

mod client;
mod error;
mod memory;

pub use client::OfferServiceClient;
pub use error::{BackendError, Result};
pub use memory::{InMemoryOfferBackend, OFFER_STATUSES};

use async_trait::async_trait;
use offer_models::{Offer, OfferId, OrderId, PrincipalId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateOfferRequest {
    pub order_id: OrderId,
    pub master_id: PrincipalId,
    pub price: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateOfferRequest {
    pub offer_id: OfferId,
    pub status: String,
}

/// Facade over the offer service.
///
/// Implementations must be safe for unlimited concurrent use; the gateway
/// shares a single instance across every connection.
#[async_trait]
pub trait OfferBackend: Send + Sync + 'static {
    async fn create_offer(&self, request: CreateOfferRequest) -> Result<Offer>;

    async fn update_offer(&self, request: UpdateOfferRequest) -> Result<Offer>;

    async fn list_offers_for_order(&self, order_id: &OrderId) -> Result<Vec<Offer>>;
}
