//! Shared cart state
//!
//! The cart is the one collection mutated from multiple concurrent UI
//! triggers, so every read-modify-write runs under the [`FairMutex`].
//! Items are unique by `(product_id, country)`; quantities must stay
//! within the stock available for the selected country, and violating
//! writes are rejected rather than clamped. The snapshot is mirrored to
//! storage after every successful mutation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::StorageBackend;
use crate::sync::FairMutex;

/// Fixed storage key for the cart snapshot
pub const CART_KEY: &str = "shopsync_cart";

/// Error types for cart operations
#[derive(Error, Debug)]
pub enum CartError {
    #[error("quantity must be at least 1")]
    InvalidQuantity,

    #[error("only {available} in stock for {country}")]
    OutOfStock { available: u32, country: String },

    #[error("product {0} is not in the cart")]
    NotInCart(String),
}

/// A product as the cart needs to see it
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Product {
    pub id: String,
    pub name: String,
    pub price: f64,
    /// Available stock per country code
    pub stock: HashMap<String, u32>,
    pub updated_at: DateTime<Utc>,
}

impl Product {
    /// Stock available for a country; unknown countries have none
    pub fn stock_for(&self, country: &str) -> u32 {
        self.stock.get(country).copied().unwrap_or(0)
    }
}

/// One cart line
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CartItem {
    pub product: Product,
    pub quantity: u32,
    pub selected_country: String,
}

/// The mutex-guarded, storage-mirrored cart
pub struct CartStore {
    lock: FairMutex,
    items: StdMutex<Vec<CartItem>>,
    storage: Arc<dyn StorageBackend>,
}

impl CartStore {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            lock: FairMutex::new(),
            items: StdMutex::new(Vec::new()),
            storage,
        }
    }

    /// Rehydrate the cart snapshot from storage
    pub async fn load(&self) -> Result<(), CartError> {
        let _guard = self.lock.acquire().await;
        match self.storage.get(CART_KEY).await {
            Ok(Some(blob)) => match serde_json::from_str::<Vec<CartItem>>(&blob) {
                Ok(items) => {
                    *self.items_mut() = items;
                }
                Err(e) => log::warn!("cart snapshot unreadable, starting empty: {}", e),
            },
            Ok(None) => {}
            Err(e) => log::warn!("cart load failed, starting empty: {}", e),
        }
        Ok(())
    }

    /// Add a product, or raise the quantity of an existing line
    pub async fn add(
        &self,
        product: Product,
        country: impl Into<String>,
        quantity: u32,
    ) -> Result<(), CartError> {
        let country = country.into();
        let _guard = self.lock.acquire().await;

        let new_quantity = {
            let items = self.items_mut();
            let existing = items
                .iter()
                .find(|i| i.product.id == product.id && i.selected_country == country)
                .map(|i| i.quantity)
                .unwrap_or(0);
            existing + quantity
        };
        validate_quantity(&product, &country, new_quantity)?;

        {
            let mut items = self.items_mut();
            match items
                .iter_mut()
                .find(|i| i.product.id == product.id && i.selected_country == country)
            {
                Some(line) => {
                    line.quantity = new_quantity;
                    line.product = product;
                }
                None => items.push(CartItem {
                    product,
                    quantity: new_quantity,
                    selected_country: country,
                }),
            }
        }
        self.persist().await;
        Ok(())
    }

    /// Set an existing line to an exact quantity
    pub async fn set_quantity(
        &self,
        product_id: &str,
        country: &str,
        quantity: u32,
    ) -> Result<(), CartError> {
        let _guard = self.lock.acquire().await;

        {
            let mut items = self.items_mut();
            let line = items
                .iter_mut()
                .find(|i| i.product.id == product_id && i.selected_country == country)
                .ok_or_else(|| CartError::NotInCart(product_id.to_string()))?;
            validate_quantity(&line.product, country, quantity)?;
            line.quantity = quantity;
        }
        self.persist().await;
        Ok(())
    }

    /// Remove a line entirely
    pub async fn remove(&self, product_id: &str, country: &str) -> Result<(), CartError> {
        let _guard = self.lock.acquire().await;

        {
            let mut items = self.items_mut();
            let before = items.len();
            items.retain(|i| !(i.product.id == product_id && i.selected_country == country));
            if items.len() == before {
                return Err(CartError::NotInCart(product_id.to_string()));
            }
        }
        self.persist().await;
        Ok(())
    }

    /// Empty the cart
    pub async fn clear(&self) {
        let _guard = self.lock.acquire().await;
        self.items_mut().clear();
        self.persist().await;
    }

    /// Snapshot of the current lines, in insertion order
    pub async fn items(&self) -> Vec<CartItem> {
        let _guard = self.lock.acquire().await;
        self.items_mut().clone()
    }

    /// Total units across all lines
    pub async fn total_quantity(&self) -> u32 {
        let _guard = self.lock.acquire().await;
        self.items_mut().iter().map(|i| i.quantity).sum()
    }

    fn items_mut(&self) -> std::sync::MutexGuard<'_, Vec<CartItem>> {
        match self.items.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Mirror the snapshot after a successful mutation; failures are
    /// logged, the in-memory state stands
    async fn persist(&self) {
        let blob = {
            let items = self.items_mut();
            match serde_json::to_string(&*items) {
                Ok(blob) => blob,
                Err(e) => {
                    log::warn!("cart serialization failed: {}", e);
                    return;
                }
            }
        };
        if let Err(e) = self.storage.set(CART_KEY, &blob).await {
            log::warn!("cart persist failed: {}", e);
        }
    }
}

fn validate_quantity(product: &Product, country: &str, quantity: u32) -> Result<(), CartError> {
    if quantity < 1 {
        return Err(CartError::InvalidQuantity);
    }
    let available = product.stock_for(country);
    if quantity > available {
        return Err(CartError::OutOfStock {
            available,
            country: country.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn mug(stock_us: u32) -> Product {
        Product {
            id: "p-mug".to_string(),
            name: "Mug".to_string(),
            price: 12.5,
            stock: HashMap::from([("US".to_string(), stock_us), ("DE".to_string(), 2)]),
            updated_at: Utc::now(),
        }
    }

    fn store() -> (MemoryStorage, Arc<CartStore>) {
        let storage = MemoryStorage::new();
        let cart = Arc::new(CartStore::new(Arc::new(storage.clone())));
        (storage, cart)
    }

    #[tokio::test]
    async fn test_add_and_increment() {
        let (_storage, cart) = store();
        cart.add(mug(5), "US", 1).await.unwrap();
        cart.add(mug(5), "US", 2).await.unwrap();

        let items = cart.items().await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].quantity, 3);
    }

    #[tokio::test]
    async fn test_lines_unique_by_product_and_country() {
        let (_storage, cart) = store();
        cart.add(mug(5), "US", 1).await.unwrap();
        cart.add(mug(5), "DE", 1).await.unwrap();

        assert_eq!(cart.items().await.len(), 2);
        assert_eq!(cart.total_quantity().await, 2);
    }

    #[tokio::test]
    async fn test_overstock_rejected_not_clamped() {
        let (_storage, cart) = store();
        cart.add(mug(2), "US", 2).await.unwrap();

        let err = cart.add(mug(2), "US", 1).await.unwrap_err();
        assert!(matches!(err, CartError::OutOfStock { available: 2, .. }));
        // The failed write must not have touched the line.
        assert_eq!(cart.items().await[0].quantity, 2);
    }

    #[tokio::test]
    async fn test_zero_quantity_rejected() {
        let (_storage, cart) = store();
        cart.add(mug(5), "US", 1).await.unwrap();
        let err = cart.set_quantity("p-mug", "US", 0).await.unwrap_err();
        assert!(matches!(err, CartError::InvalidQuantity));
    }

    #[tokio::test]
    async fn test_snapshot_survives_restart() {
        let (storage, cart) = store();
        cart.add(mug(5), "US", 2).await.unwrap();

        let revived = CartStore::new(Arc::new(storage));
        revived.load().await.unwrap();
        let items = revived.items().await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].quantity, 2);
        assert_eq!(items[0].selected_country, "US");
    }

    #[tokio::test]
    async fn test_concurrent_increments_are_not_lost() {
        let (_storage, cart) = store();
        cart.add(mug(50), "US", 1).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..20 {
            let cart = cart.clone();
            handles.push(tokio::spawn(async move {
                cart.add(mug(50), "US", 1).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(cart.items().await[0].quantity, 21);
    }

    #[tokio::test]
    async fn test_remove_missing_line_errors() {
        let (_storage, cart) = store();
        let err = cart.remove("p-none", "US").await.unwrap_err();
        assert!(matches!(err, CartError::NotInCart(_)));
    }
}
