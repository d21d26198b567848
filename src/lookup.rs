// Keyed lookups consumed by the adapters and the orchestrator: hotel name to
// supplier id, meal-plan code translation and room categories. Production
// deployments back these with a relational store; the table types below are
// in-memory versions loaded at startup.

use crate::config::SupplierConfig;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

pub trait HotelIdLookup: Send + Sync {
    // Supplier-specific id for a canonical hotel name
    fn resolve_supplier_id(&self, canonical_name: &str, supplier: &str) -> Option<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MealFilterStrategy {
    // Supplier filters natively when given its own code
    RequestLevel,
    // Offers are filtered after normalization
    ResponseLevel,
    NotSupported,
}

impl FromStr for MealFilterStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "request_level" => Ok(MealFilterStrategy::RequestLevel),
            "response_level" => Ok(MealFilterStrategy::ResponseLevel),
            "not_supported" => Ok(MealFilterStrategy::NotSupported),
            other => Err(format!("unknown meal filter strategy: {}", other)),
        }
    }
}

pub trait MealMapping: Send + Sync {
    fn should_filter_at_request_level(&self, supplier: &str, code: &str) -> bool;

    // Supplier-native code used in the request
    fn native_code_for(&self, supplier: &str, code: &str) -> Option<String>;

    // Values of the offer's meal_plan that satisfy `code`
    fn response_values_for(&self, supplier: &str, code: &str) -> Vec<String>;

    // Standard code for a supplier's meal_plan value
    fn standard_code_for(&self, supplier: &str, value: &str) -> Option<String>;
}

/// Raw code translation rows, independent of how a supplier filters.
pub trait MealCodes: Send + Sync {
    fn supplier_value(&self, supplier: &str, code: &str) -> Option<String>;

    fn standard_code_for(&self, supplier: &str, value: &str) -> Option<String>;
}

pub trait RoomCategoryLookup: Send + Sync {
    fn category_for(&self, room_name: &str) -> Option<String>;
}

#[derive(Debug, Clone, Default)]
pub struct StaticHotelIds {
    ids: HashMap<(String, String), String>,
}

impl StaticHotelIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        canonical_name: impl Into<String>,
        supplier: impl Into<String>,
        supplier_id: impl Into<String>,
    ) {
        self.ids
            .insert((canonical_name.into(), supplier.into()), supplier_id.into());
    }

    pub fn with(
        mut self,
        canonical_name: impl Into<String>,
        supplier: impl Into<String>,
        supplier_id: impl Into<String>,
    ) -> Self {
        self.insert(canonical_name, supplier, supplier_id);
        self
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

impl HotelIdLookup for StaticHotelIds {
    fn resolve_supplier_id(&self, canonical_name: &str, supplier: &str) -> Option<String> {
        self.ids
            .get(&(canonical_name.to_string(), supplier.to_string()))
            .cloned()
    }
}

/// Standard meal codes (`BB`, `HB`, `AI`, ...) and their per-supplier
/// values.
#[derive(Debug, Clone, Default)]
pub struct MealCodeTable {
    // standard code -> supplier -> supplier value
    rows: BTreeMap<String, HashMap<String, String>>,
}

impl MealCodeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, code: impl Into<String>, supplier: impl Into<String>, value: impl Into<String>) {
        let value = value.into();
        if value.trim().is_empty() {
            return;
        }
        self.rows
            .entry(code.into())
            .or_default()
            .insert(supplier.into(), value.trim().to_string());
    }

    pub fn with(mut self, code: impl Into<String>, supplier: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(code, supplier, value);
        self
    }

    pub fn is_supported(&self, supplier: &str, code: &str) -> bool {
        self.supplier_value(supplier, code).is_some()
    }

    pub fn codes(&self) -> Vec<String> {
        self.rows.keys().cloned().collect()
    }
}

impl MealCodes for MealCodeTable {
    fn supplier_value(&self, supplier: &str, code: &str) -> Option<String> {
        self.rows.get(code).and_then(|row| row.get(supplier)).cloned()
    }

    fn standard_code_for(&self, supplier: &str, value: &str) -> Option<String> {
        self.rows
            .iter()
            .find(|(_, row)| row.get(supplier).map_or(false, |v| v == value))
            .map(|(code, _)| code.clone())
    }
}

/// Meal translation as the suppliers are configured: the filtering strategy
/// comes from each `SupplierConfig`, the values from the code rows.
/// Suppliers without a configured strategy are `NotSupported`.
#[derive(Clone)]
pub struct MealMapper {
    strategies: HashMap<String, MealFilterStrategy>,
    codes: Arc<dyn MealCodes>,
}

impl MealMapper {
    pub fn new(codes: Arc<dyn MealCodes>) -> Self {
        Self {
            strategies: HashMap::new(),
            codes,
        }
    }

    pub fn for_suppliers(codes: Arc<dyn MealCodes>, suppliers: &[SupplierConfig]) -> Self {
        let mut mapper = Self::new(codes);
        for supplier in suppliers {
            mapper.strategies.insert(supplier.id.clone(), supplier.meal_strategy);
        }
        mapper
    }

    pub fn strategy(&self, supplier: &str) -> MealFilterStrategy {
        self.strategies
            .get(supplier)
            .copied()
            .unwrap_or(MealFilterStrategy::NotSupported)
    }
}

impl MealMapping for MealMapper {
    fn should_filter_at_request_level(&self, supplier: &str, code: &str) -> bool {
        let result = self.strategy(supplier) == MealFilterStrategy::RequestLevel
            && self.codes.supplier_value(supplier, code).is_some();
        debug!(supplier, code, result, "Request-level meal filtering check");
        result
    }

    fn native_code_for(&self, supplier: &str, code: &str) -> Option<String> {
        if self.strategy(supplier) != MealFilterStrategy::RequestLevel {
            return None;
        }
        self.codes.supplier_value(supplier, code)
    }

    fn response_values_for(&self, supplier: &str, code: &str) -> Vec<String> {
        if self.strategy(supplier) != MealFilterStrategy::ResponseLevel {
            return Vec::new();
        }
        self.codes.supplier_value(supplier, code).into_iter().collect()
    }

    fn standard_code_for(&self, supplier: &str, value: &str) -> Option<String> {
        self.codes.standard_code_for(supplier, value)
    }
}

// Room name -> category ("Standard", "Premium", ...), matched case-insensitively
#[derive(Debug, Clone, Default)]
pub struct RoomCategoryTable {
    categories: HashMap<String, String>,
}

impl RoomCategoryTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, room_name: &str, category: impl Into<String>) -> Self {
        self.categories
            .insert(room_name.trim().to_lowercase(), category.into());
        self
    }
}

impl RoomCategoryLookup for RoomCategoryTable {
    fn category_for(&self, room_name: &str) -> Option<String> {
        self.categories
            .get(&room_name.trim().to_lowercase())
            .cloned()
    }
}
