use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::CoreError;
use crate::types::{AssetId, Side};

use super::{BookSnapshot, ClobRest, VenueOrder};

/// In-memory `ClobRest` fake for `DRY_RUN=true`. Orders are accepted
/// immediately and rest until explicitly cancelled; nothing here ever fills
/// on its own; fills are driven by whatever the caller feeds through the
/// user channel in dry-run mode (see orchestrator wiring).
#[derive(Default)]
pub struct DryRunClobRest {
    orders: Mutex<HashMap<String, VenueOrder>>,
    next_id: Mutex<u64>,
}

impl DryRunClobRest {
    pub fn new() -> Self {
        Self::default()
    }

    fn fresh_id(&self) -> String {
        let mut n = self.next_id.lock();
        *n += 1;
        format!("dry-run-{n}")
    }
}

#[async_trait]
impl ClobRest for DryRunClobRest {
    async fn post_limit_order(
        &self,
        asset: &AssetId,
        side: Side,
        price: f64,
        size: f64,
    ) -> Result<VenueOrder, CoreError> {
        let order = VenueOrder {
            order_id: self.fresh_id(),
            asset: asset.clone(),
            side,
            price,
            size,
            size_matched: 0.0,
        };
        self.orders.lock().insert(order.order_id.clone(), order.clone());
        Ok(order)
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), CoreError> {
        self.orders.lock().remove(order_id);
        Ok(())
    }

    async fn cancel_all(&self) -> Result<(), CoreError> {
        self.orders.lock().clear();
        Ok(())
    }

    async fn get_open_orders(&self, asset: &AssetId) -> Result<Vec<VenueOrder>, CoreError> {
        Ok(self
            .orders
            .lock()
            .values()
            .filter(|o| &o.asset == asset)
            .cloned()
            .collect())
    }

    async fn get_order_book(&self, _asset: &AssetId) -> Result<BookSnapshot, CoreError> {
        Ok(BookSnapshot::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn post_then_cancel_removes_order() {
        let venue = DryRunClobRest::new();
        let order = venue
            .post_limit_order(&"asset-1".to_string(), Side::Buy, 0.45, 10.0)
            .await
            .unwrap();
        assert_eq!(venue.get_open_orders(&"asset-1".to_string()).await.unwrap().len(), 1);
        venue.cancel_order(&order.order_id).await.unwrap();
        assert!(venue.get_open_orders(&"asset-1".to_string()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancel_all_clears_every_asset() {
        let venue = DryRunClobRest::new();
        venue
            .post_limit_order(&"a".to_string(), Side::Buy, 0.4, 1.0)
            .await
            .unwrap();
        venue
            .post_limit_order(&"b".to_string(), Side::Sell, 0.6, 1.0)
            .await
            .unwrap();
        venue.cancel_all().await.unwrap();
        assert!(venue.get_open_orders(&"a".to_string()).await.unwrap().is_empty());
        assert!(venue.get_open_orders(&"b".to_string()).await.unwrap().is_empty());
    }
}
