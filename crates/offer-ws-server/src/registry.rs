use crate::sender::{ConnectionSender, SendError};
use dashmap::DashMap;
use futures_util::future::join_all;
use offer_models::{ConnectionId, OrderId};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

/// Outcome of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Maps each order to the connections watching it.
///
/// Both maps are sharded, so operations on different orders do not contend.
/// No shard guard is ever held across an await: broadcast snapshots the
/// subscriber handles and releases the shard before writing.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    orders: DashMap<OrderId, HashMap<ConnectionId, ConnectionSender>>,
    memberships: DashMap<ConnectionId, HashSet<OrderId>>,
}

impl SubscriptionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `connection` to the subscribers of `order_id`.
    ///
    /// Returns false if it was already subscribed, in which case nothing changes.
    pub fn subscribe(&self, order_id: &OrderId, connection: &ConnectionSender) -> bool {
        let connection_id = connection.connection_id();

        // Record the membership first so unsubscribe_all always sees it.
        self.memberships
            .entry(connection_id)
            .or_default()
            .insert(order_id.clone());

        let added = self
            .orders
            .entry(order_id.clone())
            .or_default()
            .insert(connection_id, connection.clone())
            .is_none();

        if added {
            info!(
                order_id = %order_id,
                connection_id = %connection_id,
                "Subscribed connection to order"
            );
        }
        added
    }

    /// Remove `connection_id` from the subscribers of `order_id`.
    ///
    /// Returns false if it was not subscribed.
    pub fn unsubscribe(&self, order_id: &OrderId, connection_id: ConnectionId) -> bool {
        let removed = self.remove_from_order(order_id, connection_id);

        if let Some(mut orders) = self.memberships.get_mut(&connection_id) {
            orders.remove(order_id);
        }
        self.memberships
            .remove_if(&connection_id, |_, orders| orders.is_empty());

        if removed {
            info!(
                order_id = %order_id,
                connection_id = %connection_id,
                "Unsubscribed connection from order"
            );
        }
        removed
    }

    /// Remove `connection_id` from every order it is subscribed to.
    ///
    /// Called once per connection during teardown, after its read loop has
    /// stopped, so no subscribe for the same connection can race with it.
    /// Returns the number of orders it was removed from.
    pub fn unsubscribe_all(&self, connection_id: ConnectionId) -> usize {
        let Some((_, orders)) = self.memberships.remove(&connection_id) else {
            return 0;
        };

        let removed = orders
            .iter()
            .filter(|order_id| self.remove_from_order(order_id, connection_id))
            .count();

        info!(
            connection_id = %connection_id,
            orders = removed,
            "Removed connection from all orders"
        );
        removed
    }

    /// Deliver `message` to every subscriber of `order_id`.
    pub async fn broadcast<T: Serialize>(&self, order_id: &OrderId, message: &T) -> BroadcastReport {
        self.fan_out(order_id, message, None).await
    }

    /// Deliver `message` to every subscriber of `order_id` except `origin`.
    pub async fn broadcast_except<T: Serialize>(
        &self,
        order_id: &OrderId,
        message: &T,
        origin: ConnectionId,
    ) -> BroadcastReport {
        self.fan_out(order_id, message, Some(origin)).await
    }

    #[must_use]
    pub fn is_subscribed(&self, order_id: &OrderId, connection_id: ConnectionId) -> bool {
        self.orders
            .get(order_id)
            .is_some_and(|subscribers| subscribers.contains_key(&connection_id))
    }

    #[must_use]
    pub fn subscriber_count(&self, order_id: &OrderId) -> usize {
        self.orders
            .get(order_id)
            .map_or(0, |subscribers| subscribers.len())
    }

    /// Number of orders that currently have at least one subscriber.
    #[must_use]
    pub fn order_count(&self) -> usize {
        self.orders.len()
    }

    #[must_use]
    pub fn subscriptions_of(&self, connection_id: ConnectionId) -> Vec<OrderId> {
        self.memberships
            .get(&connection_id)
            .map(|orders| orders.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn remove_from_order(&self, order_id: &OrderId, connection_id: ConnectionId) -> bool {
        let removed = match self.orders.get_mut(order_id) {
            Some(mut subscribers) => subscribers.remove(&connection_id).is_some(),
            None => false,
        };

        // Re-checked under the shard lock, so a concurrent subscribe is never lost.
        self.orders
            .remove_if(order_id, |_, subscribers| subscribers.is_empty());

        removed
    }

    async fn fan_out<T: Serialize>(
        &self,
        order_id: &OrderId,
        message: &T,
        origin: Option<ConnectionId>,
    ) -> BroadcastReport {
        let targets: Vec<ConnectionSender> = match self.orders.get(order_id) {
            Some(subscribers) => subscribers
                .values()
                .filter(|sender| Some(sender.connection_id()) != origin)
                .cloned()
                .collect(),
            None => Vec::new(),
        };

        if targets.is_empty() {
            debug!(order_id = %order_id, "No subscribers to broadcast to");
            return BroadcastReport::default();
        }

        let json = match serde_json::to_string(message) {
            Ok(json) => json,
            Err(e) => {
                warn!(order_id = %order_id, error = %e, "Failed to serialize broadcast");
                return BroadcastReport {
                    delivered: 0,
                    failed: targets.len(),
                };
            }
        };

        let results = join_all(targets.iter().map(|sender| sender.send_json(json.clone()))).await;

        let mut report = BroadcastReport::default();
        for (sender, result) in targets.iter().zip(results) {
            match result {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    report.failed += 1;
                    log_delivery_failure(order_id, sender.connection_id(), &e);
                }
            }
        }

        info!(
            order_id = %order_id,
            delivered = report.delivered,
            failed = report.failed,
            "Broadcast to order subscribers"
        );
        report
    }
}

fn log_delivery_failure(order_id: &OrderId, connection_id: ConnectionId, error: &SendError) {
    warn!(
        order_id = %order_id,
        connection_id = %connection_id,
        error = %error,
        "Failed to deliver broadcast to subscriber"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sender::Outbound;
    use serde_json::json;
    use std::{sync::Arc, time::Duration};
    use tokio::sync::mpsc;

    fn connection() -> (ConnectionSender, mpsc::Receiver<Outbound>) {
        ConnectionSender::channel(ConnectionId::new(), 8, Duration::from_millis(50))
    }

    #[tokio::test]
    async fn test_subscribe_is_idempotent() {
        let registry = SubscriptionRegistry::new();
        let (conn, _rx) = connection();
        let order = OrderId::from("O1");

        assert!(registry.subscribe(&order, &conn));
        assert!(!registry.subscribe(&order, &conn));
        assert_eq!(registry.subscriber_count(&order), 1);

        assert!(registry.unsubscribe(&order, conn.connection_id()));
        assert!(!registry.unsubscribe(&order, conn.connection_id()));
        assert!(!registry.is_subscribed(&order, conn.connection_id()));
    }

    #[tokio::test]
    async fn test_membership_follows_net_effect() {
        let registry = SubscriptionRegistry::new();
        let (conn, _rx) = connection();
        let order = OrderId::from("O1");

        // (op, expected membership afterwards)
        let steps = [
            (true, true),
            (true, true),
            (false, false),
            (false, false),
            (true, true),
            (false, false),
            (true, true),
        ];

        for (subscribe, expected) in steps {
            if subscribe {
                registry.subscribe(&order, &conn);
            } else {
                registry.unsubscribe(&order, conn.connection_id());
            }
            assert_eq!(registry.is_subscribed(&order, conn.connection_id()), expected);
        }
    }

    #[tokio::test]
    async fn test_empty_sets_are_removed() {
        let registry = SubscriptionRegistry::new();
        let (a, _rx_a) = connection();
        let (b, _rx_b) = connection();
        let order = OrderId::from("O1");

        registry.subscribe(&order, &a);
        registry.subscribe(&order, &b);
        assert_eq!(registry.order_count(), 1);

        registry.unsubscribe(&order, a.connection_id());
        assert_eq!(registry.order_count(), 1);

        registry.unsubscribe(&order, b.connection_id());
        assert_eq!(registry.order_count(), 0);
        assert!(registry.subscriptions_of(b.connection_id()).is_empty());
    }

    #[tokio::test]
    async fn test_unsubscribe_all() {
        let registry = SubscriptionRegistry::new();
        let (a, _rx_a) = connection();
        let (b, _rx_b) = connection();

        for order in ["O1", "O2", "O3"] {
            registry.subscribe(&OrderId::from(order), &a);
        }
        registry.subscribe(&OrderId::from("O2"), &b);

        assert_eq!(registry.unsubscribe_all(a.connection_id()), 3);
        for order in ["O1", "O2", "O3"] {
            assert!(!registry.is_subscribed(&OrderId::from(order), a.connection_id()));
        }
        assert!(registry.is_subscribed(&OrderId::from("O2"), b.connection_id()));
        assert_eq!(registry.order_count(), 1);

        // second call has nothing left to remove
        assert_eq!(registry.unsubscribe_all(a.connection_id()), 0);
    }

    #[tokio::test]
    async fn test_broadcast_without_subscribers() {
        let registry = SubscriptionRegistry::new();
        let report = registry
            .broadcast(&OrderId::from("nobody"), &json!({"action": "offerCreated"}))
            .await;
        assert_eq!(report, BroadcastReport::default());
    }

    #[tokio::test]
    async fn test_broadcast_reaches_only_order_subscribers() {
        let registry = SubscriptionRegistry::new();
        let (a, mut rx_a) = connection();
        let (b, mut rx_b) = connection();
        let (c, mut rx_c) = connection();

        registry.subscribe(&OrderId::from("O1"), &a);
        registry.subscribe(&OrderId::from("O1"), &b);
        registry.subscribe(&OrderId::from("O2"), &c);

        let report = registry
            .broadcast_except(&OrderId::from("O1"), &json!({"n": 1}), b.connection_id())
            .await;
        assert_eq!(report.delivered, 1);

        assert_eq!(rx_a.try_recv().unwrap(), Outbound::Text(r#"{"n":1}"#.to_string()));
        assert!(rx_b.try_recv().is_err());
        assert!(rx_c.try_recv().is_err());

        let report = registry.broadcast(&OrderId::from("O1"), &json!({"n": 2})).await;
        assert_eq!(report.delivered, 2);
        assert!(rx_b.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_failed_delivery_does_not_stop_fan_out() {
        let registry = SubscriptionRegistry::new();
        let order = OrderId::from("O1");

        let (dead, dead_rx) = connection();
        drop(dead_rx);
        let (stalled, _stalled_rx) =
            ConnectionSender::channel(ConnectionId::new(), 1, Duration::from_millis(20));
        stalled.send_json("backlog".to_string()).await.unwrap();
        let (live, mut live_rx) = connection();

        registry.subscribe(&order, &dead);
        registry.subscribe(&order, &stalled);
        registry.subscribe(&order, &live);

        let report = tokio::time::timeout(
            Duration::from_secs(1),
            registry.broadcast(&order, &json!({"action": "offerUpdated"})),
        )
        .await
        .expect("stalled subscriber must not block the broadcast");

        assert_eq!(report, BroadcastReport { delivered: 1, failed: 2 });
        assert!(live_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_concurrent_subscribe_and_teardown() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let mut handles = Vec::new();

        for i in 0..32 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                let (conn, _rx) = connection();
                for order in 0..8 {
                    registry.subscribe(&OrderId::new(format!("O{}", (i + order) % 10)), &conn);
                }
                registry
                    .broadcast(&OrderId::new(format!("O{}", i % 10)), &json!({"i": i}))
                    .await;
                registry.unsubscribe_all(conn.connection_id());
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(registry.order_count(), 0);
    }
}
