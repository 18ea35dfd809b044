//! Catalog and address fixtures.

use crate::memory::InMemoryDatabase;
use storefront_core::store::ProductRecord;
use storefront_core::types::{AddressId, Money, ProductId, UserId};

/// Buyer that owns [`ADDRESS`].
pub const BUYER: UserId = UserId::new(1);

/// Another user, owns [`OTHER_ADDRESS`].
pub const OTHER_BUYER: UserId = UserId::new(2);

/// Address owned by [`BUYER`].
pub const ADDRESS: AddressId = AddressId::new(100);

/// Address owned by [`OTHER_BUYER`].
pub const OTHER_ADDRESS: AddressId = AddressId::new(200);

/// `widget`: 10.00, stock 10.
pub const WIDGET: ProductId = ProductId::new(1);

/// `gadget`: 5.00, stock 5.
pub const GADGET: ProductId = ProductId::new(2);

/// `relic`: 99.00, stock 3, not on sale.
pub const RELIC: ProductId = ProductId::new(3);

/// An on-sale product.
#[must_use]
pub fn product(id: i64, name: &str, price_cents: u64, stock: u32) -> ProductRecord {
    ProductRecord {
        id: ProductId::new(id),
        name: name.to_string(),
        image_url: format!("https://img.example.test/{name}.png"),
        price: Money::from_cents(price_cents),
        stock,
        on_sale: true,
    }
}

/// Seed [`WIDGET`], [`GADGET`], [`RELIC`] and both buyers' addresses.
pub async fn seed_catalog(db: &InMemoryDatabase) {
    db.put_product(product(WIDGET.get(), "widget", 1000, 10)).await;
    db.put_product(product(GADGET.get(), "gadget", 500, 5)).await;
    db.put_product(ProductRecord {
        on_sale: false,
        ..product(RELIC.get(), "relic", 9900, 3)
    })
    .await;
    db.put_address(ADDRESS, BUYER).await;
    db.put_address(OTHER_ADDRESS, OTHER_BUYER).await;
}
