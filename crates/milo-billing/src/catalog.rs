//! Plan catalog: administrative upsert, listing and the default seed.

use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use milo_core::db::models::{BillingInterval, Product};
use milo_store::{StoreClient, Upserted};

use crate::error::BillingResult;
use crate::types::ProductInput;

#[derive(Debug, Clone)]
pub struct ProductCatalog {
    client: Arc<StoreClient>,
}

impl ProductCatalog {
    pub fn new(client: Arc<StoreClient>) -> Self {
        Self { client }
    }

    /// Insert or overwrite the catalog entry with `input.id`.
    pub async fn upsert_product(&self, input: ProductInput) -> BillingResult<Upserted<Product>> {
        let now = Utc::now();
        let product = Product {
            doc_id: String::new(),
            creation_time: 0,
            id: input.id,
            name: input.name,
            description: input.description.unwrap_or_default(),
            price: input.price,
            currency: input.currency,
            interval: input.interval,
            features: input.features,
            active: input.active,
            stripe_product_id: input.stripe_product_id,
            stripe_price_id: input.stripe_price_id,
            created_at: now,
            updated_at: now,
        };
        let outcome = self.client.products().upsert(&product).await?;
        info!(product_id = %outcome.record.id, created = outcome.created, "product upserted");
        Ok(outcome)
    }

    /// Active products only.
    pub async fn list_products(&self) -> BillingResult<Vec<Product>> {
        Ok(self.client.products().list_active().await?)
    }

    /// Insert the default plans when the catalog is empty. Returns the number
    /// of products inserted.
    pub async fn seed_default_products(&self) -> BillingResult<usize> {
        let existing = self.client.products().list_all().await?;
        if !existing.is_empty() {
            info!(count = existing.len(), "catalog already seeded");
            return Ok(0);
        }
        let mut inserted = 0;
        for input in default_products() {
            if self.upsert_product(input).await?.created {
                inserted += 1;
            }
        }
        info!(inserted, "seeded default products");
        Ok(inserted)
    }
}

fn plan(id: &str, name: &str, description: &str, price: f64, features: &[&str]) -> ProductInput {
    ProductInput {
        id: id.into(),
        name: name.into(),
        description: Some(description.into()),
        price,
        currency: "USD".into(),
        interval: BillingInterval::Month,
        features: features.iter().map(|f| f.to_string()).collect(),
        active: true,
        stripe_product_id: None,
        stripe_price_id: None,
    }
}

/// The three paid tiers.
pub fn default_products() -> Vec<ProductInput> {
    vec![
        plan(
            "foundation_plan",
            "Foundation Plan",
            "Build your fitness foundation with intelligent AI guidance",
            9.99,
            &[
                "Unlimited personalized workout programs",
                "Basic form guidance and injury prevention tips",
                "Progress tracking with weekly analytics",
                "15 grocery/fridge scans per month for meal planning",
                "5 personalized weekly meal plans",
                "Standard customer support",
            ],
        ),
        plan(
            "performance_plan",
            "Performance Plan",
            "Unlock advanced AI coaching for serious fitness growth",
            19.99,
            &[
                "Everything from Foundation Plan",
                "Advanced form correction with video tutorials and biomechanics feedback",
                "Unlimited detailed progress analytics with trend analysis",
                "Unlimited grocery/fridge scanning with meal countdown tracking",
                "Personalized nutrition recommendations based on training goals",
                "Priority customer support (24-hour response)",
            ],
        ),
        plan(
            "champion_plan",
            "Champion Plan",
            "Elite AI coaching that anticipates your every fitness need",
            29.99,
            &[
                "Everything from Performance Plan",
                "Real-time workout coaching with live form feedback",
                "AI training partner mode - conversational workout guidance",
                "Nutrition coaching conversations - ask Milo anything about your diet",
                "Monthly virtual coaching sessions",
                "VIP customer support (same-day response)",
            ],
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_seed_is_noop_on_populated_catalog() {
        let catalog = ProductCatalog::new(Arc::new(StoreClient::memory()));
        assert_eq!(catalog.seed_default_products().await.unwrap(), 3);
        assert_eq!(catalog.seed_default_products().await.unwrap(), 0);

        let products = catalog.list_products().await.unwrap();
        let ids: Vec<String> = products.into_iter().map(|p| p.id).collect();
        assert_eq!(ids, ["foundation_plan", "performance_plan", "champion_plan"]);
    }

    #[tokio::test]
    async fn test_inactive_products_are_not_listed() {
        let catalog = ProductCatalog::new(Arc::new(StoreClient::memory()));
        let mut retired = default_products().remove(0);
        retired.active = false;
        let outcome = catalog.upsert_product(retired).await.unwrap();
        assert!(outcome.created);
        assert!(catalog.list_products().await.unwrap().is_empty());
    }
}
