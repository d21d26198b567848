// The contract every supplier integration implements, and the registry the
// orchestrator builds its adapters from.

use crate::config::{SupplierConfig, GOGLOBAL, RATE_HAWK, TBO};
use crate::error::SupplierError;
use crate::lookup::{HotelIdLookup, MealCodes, MealMapper, MealMapping, RoomCategoryLookup};
use crate::models::{Offer, SearchCriteria};
use crate::session_pool::SessionPool;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::warn;

/// Raw supplier payload plus the request context `normalize` needs.
#[derive(Debug, Clone, Default)]
pub struct RawResponse {
    pub body: Bytes,
    // supplier hotel id -> canonical hotel name, as sent in the request
    pub hotel_names: HashMap<String, String>,
}

impl RawResponse {
    pub fn new(body: impl Into<Bytes>, hotel_names: HashMap<String, String>) -> Self {
        Self {
            body: body.into(),
            hotel_names,
        }
    }

    pub fn hotel_name(&self, supplier_hotel_id: &str) -> String {
        self.hotel_names
            .get(supplier_hotel_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Normalized {
    pub offers: Vec<Offer>,
    // Entries skipped for missing required fields
    pub dropped: usize,
}

impl Normalized {
    pub fn push(&mut self, offer: Option<Offer>) {
        match offer {
            Some(offer) => self.offers.push(offer),
            None => self.dropped += 1,
        }
    }
}

/// One supplier integration.
///
/// `search` performs the network exchange through a pooled session and
/// returns the raw body; `normalize` is pure and maps that body into
/// [`Offer`]s, skipping malformed entries. Neither touches the circuit
/// breaker or retries; the orchestrator owns both.
#[async_trait]
pub trait SupplierAdapter: Send + Sync {
    fn id(&self) -> &str;

    /// Supplier-specific copy of the criteria. The default is an unchanged
    /// clone; request-level meal filtering is applied here.
    fn prepare_request_criteria(&self, criteria: &SearchCriteria) -> SearchCriteria {
        criteria.clone()
    }

    async fn search(&self, criteria: &SearchCriteria) -> Result<RawResponse, SupplierError>;

    fn normalize(
        &self,
        raw: &RawResponse,
        criteria: &SearchCriteria,
    ) -> Result<Normalized, SupplierError>;
}

// Lookups shared by every adapter and by post-processing
#[derive(Clone)]
pub struct Services {
    pub hotel_ids: Arc<dyn HotelIdLookup>,
    pub meals: Arc<dyn MealMapping>,
    pub rooms: Arc<dyn RoomCategoryLookup>,
    meal_codes: Arc<dyn MealCodes>,
}

impl Services {
    /// Until `with_meal_strategies` is applied, no supplier filters meals.
    pub fn new(
        hotel_ids: Arc<dyn HotelIdLookup>,
        meal_codes: Arc<dyn MealCodes>,
        rooms: Arc<dyn RoomCategoryLookup>,
    ) -> Self {
        Self {
            hotel_ids,
            meals: Arc::new(MealMapper::new(meal_codes.clone())),
            rooms,
            meal_codes,
        }
    }

    /// Take each supplier's meal filtering strategy from its config.
    pub fn with_meal_strategies(mut self, suppliers: &[SupplierConfig]) -> Self {
        self.meals = Arc::new(MealMapper::for_suppliers(self.meal_codes.clone(), suppliers));
        self
    }

    /// Map canonical hotel names to this supplier's ids. Unmapped names are
    /// skipped; none mapped at all is an error.
    pub fn resolve_hotel_ids(
        &self,
        supplier: &str,
        hotel_names: &[String],
    ) -> Result<BTreeMap<String, String>, SupplierError> {
        let mut resolved = BTreeMap::new();
        for name in hotel_names {
            match self.hotel_ids.resolve_supplier_id(name, supplier) {
                Some(id) => {
                    resolved.insert(id, name.clone());
                }
                None => warn!(supplier, hotel = %name, "No supplier id for hotel"),
            }
        }

        if resolved.is_empty() {
            return Err(SupplierError::NoMappedHotels(format!(
                "none of {} hotels mapped for {}",
                hotel_names.len(),
                supplier
            )));
        }
        Ok(resolved)
    }
}

#[derive(Clone)]
pub struct AdapterContext {
    pub config: SupplierConfig,
    pub pool: Arc<SessionPool>,
    pub services: Services,
}

pub type AdapterFactory =
    Arc<dyn Fn(AdapterContext) -> anyhow::Result<Arc<dyn SupplierAdapter>> + Send + Sync>;

/// Supplier id -> factory. The orchestrator instantiates one adapter per
/// active configured supplier from here.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    factories: HashMap<String, AdapterFactory>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtin_suppliers() -> Self {
        let mut registry = Self::new();
        registry.register(RATE_HAWK, |ctx| {
            Ok(Arc::new(crate::suppliers::RateHawkAdapter::new(ctx)?) as Arc<dyn SupplierAdapter>)
        });
        registry.register(GOGLOBAL, |ctx| {
            Ok(Arc::new(crate::suppliers::GoGlobalAdapter::new(ctx)?) as Arc<dyn SupplierAdapter>)
        });
        registry.register(TBO, |ctx| {
            Ok(Arc::new(crate::suppliers::TboAdapter::new(ctx)?) as Arc<dyn SupplierAdapter>)
        });
        registry
    }

    pub fn register<F>(&mut self, id: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(AdapterContext) -> anyhow::Result<Arc<dyn SupplierAdapter>> + Send + Sync + 'static,
    {
        self.factories.insert(id.into(), Arc::new(factory));
        self
    }

    pub fn get(&self, id: &str) -> Option<&AdapterFactory> {
        self.factories.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.factories.contains_key(id)
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.factories.keys().cloned().collect();
        ids.sort();
        ids
    }
}
