//! Value types shared by the offer gateway crates.

mod ids;
mod offer;

pub use ids::{ConnectionId, OfferId, OrderId, PrincipalId};
pub use offer::Offer;
