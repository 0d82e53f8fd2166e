use crate::{OfferId, OrderId, PrincipalId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Snapshot of an offer as returned by the offer service.
///
/// The gateway never mutates offers; every create/update call yields a fresh
/// snapshot which is relayed to clients verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub id: OfferId,
    pub order_id: OrderId,
    /// The master (proposer) who placed the offer
    pub master_id: PrincipalId,
    pub price: f64,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}
