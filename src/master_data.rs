//! Read-only lookups into master data owned by other systems.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::ServiceError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductRef {
    pub id: Uuid,
    pub sku: String,
    pub name: String,
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerRef {
    pub id: Uuid,
    pub name: String,
    pub is_active: bool,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MasterDataLookup: Send + Sync {
    async fn get_product(&self, id: Uuid) -> Result<Option<ProductRef>, ServiceError>;
    async fn get_customer(&self, id: Uuid) -> Result<Option<CustomerRef>, ServiceError>;
    /// Default pick location for a product when the batch carries none.
    async fn get_rack_location(&self, product_id: Uuid) -> Result<Option<String>, ServiceError>;
}

/// Resolves a product or fails with `NotFound`/`ValidationError` for inactive ones.
pub async fn require_product(
    lookup: &dyn MasterDataLookup,
    id: Uuid,
) -> Result<ProductRef, ServiceError> {
    let product = lookup
        .get_product(id)
        .await?
        .ok_or_else(|| ServiceError::not_found("Product", id))?;
    if !product.is_active {
        return Err(ServiceError::ValidationError(format!(
            "product {} is inactive",
            product.sku
        )));
    }
    Ok(product)
}

pub async fn require_customer(
    lookup: &dyn MasterDataLookup,
    id: Uuid,
) -> Result<CustomerRef, ServiceError> {
    let customer = lookup
        .get_customer(id)
        .await?
        .ok_or_else(|| ServiceError::not_found("Customer", id))?;
    if !customer.is_active {
        return Err(ServiceError::ValidationError(format!(
            "customer {} is inactive",
            customer.name
        )));
    }
    Ok(customer)
}

/// Concurrent in-process registry, seeded at bootstrap or by tests.
#[derive(Debug, Default)]
pub struct InMemoryMasterData {
    products: DashMap<Uuid, ProductRef>,
    customers: DashMap<Uuid, CustomerRef>,
    rack_locations: DashMap<Uuid, String>,
}

impl InMemoryMasterData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_product(&self, sku: &str, name: &str) -> ProductRef {
        let product = ProductRef {
            id: Uuid::new_v4(),
            sku: sku.to_string(),
            name: name.to_string(),
            is_active: true,
        };
        self.products.insert(product.id, product.clone());
        product
    }

    pub fn upsert_product(&self, product: ProductRef) {
        self.products.insert(product.id, product);
    }

    pub fn add_customer(&self, name: &str) -> CustomerRef {
        let customer = CustomerRef {
            id: Uuid::new_v4(),
            name: name.to_string(),
            is_active: true,
        };
        self.customers.insert(customer.id, customer.clone());
        customer
    }

    pub fn upsert_customer(&self, customer: CustomerRef) {
        self.customers.insert(customer.id, customer);
    }

    pub fn set_rack_location(&self, product_id: Uuid, location: impl Into<String>) {
        self.rack_locations.insert(product_id, location.into());
    }
}

#[async_trait]
impl MasterDataLookup for InMemoryMasterData {
    async fn get_product(&self, id: Uuid) -> Result<Option<ProductRef>, ServiceError> {
        Ok(self.products.get(&id).map(|p| p.value().clone()))
    }

    async fn get_customer(&self, id: Uuid) -> Result<Option<CustomerRef>, ServiceError> {
        Ok(self.customers.get(&id).map(|c| c.value().clone()))
    }

    async fn get_rack_location(&self, product_id: Uuid) -> Result<Option<String>, ServiceError> {
        Ok(self.rack_locations.get(&product_id).map(|l| l.value().clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn require_product_rejects_unknown_and_inactive() {
        let md = InMemoryMasterData::new();
        let product = md.add_product("AMX-500", "Amoxicillin 500mg");
        assert_eq!(require_product(&md, product.id).await.unwrap().sku, "AMX-500");

        assert_matches!(
            require_product(&md, Uuid::new_v4()).await,
            Err(ServiceError::NotFound(_))
        );

        md.upsert_product(ProductRef {
            is_active: false,
            ..product.clone()
        });
        assert_matches!(
            require_product(&md, product.id).await,
            Err(ServiceError::ValidationError(_))
        );
    }

    #[tokio::test]
    async fn rack_location_lookup() {
        let md = InMemoryMasterData::new();
        let product = md.add_product("PCM-1", "Paracetamol");
        assert_eq!(md.get_rack_location(product.id).await.unwrap(), None);
        md.set_rack_location(product.id, "A-01-03");
        assert_eq!(
            md.get_rack_location(product.id).await.unwrap().as_deref(),
            Some("A-01-03")
        );
    }

    #[tokio::test]
    async fn mocked_lookup_propagates_errors() {
        let mut mock = MockMasterDataLookup::new();
        mock.expect_get_customer()
            .returning(|_| Err(ServiceError::InternalError("erp offline".into())));
        assert_matches!(
            require_customer(&mock, Uuid::new_v4()).await,
            Err(ServiceError::InternalError(_))
        );
    }
}
