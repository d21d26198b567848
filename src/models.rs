// Request and result types shared by the orchestrator and the adapters

use crate::circuit_breaker::CircuitState;
use crate::config::{DEFAULT_CURRENCY, DEFAULT_NATIONALITY};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One client search. Adapters derive adjusted copies through
/// `prepare_request_criteria`; the original is never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchCriteria {
    pub hotel_names: Vec<String>,
    pub check_in: NaiveDate,
    pub check_out: NaiveDate,
    #[serde(default = "default_adults")]
    pub adults: u32,
    #[serde(default)]
    pub children_ages: Vec<u32>,
    #[serde(default)]
    pub rooms: Option<u32>,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default = "default_nationality")]
    pub nationality: String,
    // Explicit supplier subset; empty means all
    #[serde(default)]
    pub suppliers: Vec<String>,
    #[serde(default)]
    pub meal_types: Vec<String>,
    #[serde(default)]
    pub room_category: Option<String>,
    #[serde(default)]
    pub search_timeout_ms: Option<u64>,
    // Set only on an adapter's derived copy
    #[serde(skip)]
    pub native_meal_code: Option<String>,
}

fn default_adults() -> u32 {
    2
}

fn default_currency() -> String {
    DEFAULT_CURRENCY.to_string()
}

fn default_nationality() -> String {
    DEFAULT_NATIONALITY.to_string()
}

impl SearchCriteria {
    pub fn new(hotel_names: Vec<String>, check_in: NaiveDate, check_out: NaiveDate) -> Self {
        Self {
            hotel_names,
            check_in,
            check_out,
            adults: default_adults(),
            children_ages: Vec::new(),
            rooms: None,
            currency: default_currency(),
            nationality: default_nationality(),
            suppliers: Vec::new(),
            meal_types: Vec::new(),
            room_category: None,
            search_timeout_ms: None,
            native_meal_code: None,
        }
    }

    pub fn with_adults(mut self, adults: u32) -> Self {
        self.adults = adults;
        self
    }

    pub fn with_children_ages(mut self, ages: Vec<u32>) -> Self {
        self.children_ages = ages;
        self
    }

    pub fn with_suppliers(mut self, suppliers: &[&str]) -> Self {
        self.suppliers = suppliers.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_meal_types(mut self, meal_types: &[&str]) -> Self {
        self.meal_types = meal_types.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_room_category(mut self, category: impl Into<String>) -> Self {
        self.room_category = Some(category.into());
        self
    }

    pub fn with_search_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.search_timeout_ms = Some(timeout_ms);
        self
    }

    pub fn nights(&self) -> i64 {
        (self.check_out - self.check_in).num_days()
    }

    pub fn children(&self) -> usize {
        self.children_ages.len()
    }

    // Non-blank requested meal codes
    pub fn requested_meal_types(&self) -> impl Iterator<Item = &str> {
        self.meal_types
            .iter()
            .map(|m| m.trim())
            .filter(|m| !m.is_empty())
    }
}

/// A normalized room offer, identical in shape for every supplier.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Offer {
    pub provider: String,
    pub supplier_hotel_id: String,
    pub hotel_id: Option<String>,
    pub hotel_name: String,
    pub supplier_room_code: Option<String>,
    pub room_name: String,
    pub room_category: Option<String>,
    pub room_mapping_id: Option<String>,
    pub meal_plan: Option<String>,
    pub total_price: f64,
    pub currency: String,
    #[serde(default)]
    pub room_features: Vec<String>,
    #[serde(default)]
    pub amenities: Vec<String>,
    pub free_cancellation_until: Option<String>,
    pub offer_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Success,
    Error,
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SupplierOutcome {
    pub supplier: String,
    pub status: OutcomeStatus,
    pub offers: Vec<Offer>,
    pub error: Option<String>,
    pub attempts: u32,
    pub processing_time_ms: u64,
    pub circuit_breaker_state: Option<CircuitState>,
    // Malformed entries skipped during normalization
    pub dropped_entries: usize,
}

impl SupplierOutcome {
    pub fn success(supplier: &str, offers: Vec<Offer>, attempts: u32) -> Self {
        Self {
            supplier: supplier.to_string(),
            status: OutcomeStatus::Success,
            offers,
            error: None,
            attempts,
            processing_time_ms: 0,
            circuit_breaker_state: None,
            dropped_entries: 0,
        }
    }

    pub fn error(supplier: &str, error: impl Into<String>, attempts: u32) -> Self {
        Self {
            supplier: supplier.to_string(),
            status: OutcomeStatus::Error,
            offers: Vec::new(),
            error: Some(error.into()),
            attempts,
            processing_time_ms: 0,
            circuit_breaker_state: None,
            dropped_entries: 0,
        }
    }

    pub fn timeout(supplier: &str, deadline_ms: u64) -> Self {
        Self {
            supplier: supplier.to_string(),
            status: OutcomeStatus::Timeout,
            offers: Vec::new(),
            error: Some(format!("No response within the {}ms search deadline", deadline_ms)),
            attempts: 0,
            processing_time_ms: deadline_ms,
            circuit_breaker_state: None,
            dropped_entries: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Success
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchSummary {
    pub total_offers: usize,
    pub successful_suppliers: usize,
    pub error_suppliers: usize,
    pub timeout_suppliers: usize,
    pub processing_time_ms: u64,
    pub hotel_count: usize,
    pub hotels_searched: Vec<String>,
    pub search_timeout_ms: u64,
}

/// Result of one fan-out: exactly one outcome per selected supplier, and
/// the offers of every successful supplier in supplier order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregatedResult {
    pub suppliers: BTreeMap<String, SupplierOutcome>,
    pub offers: Vec<Offer>,
    pub summary: SearchSummary,
}

impl AggregatedResult {
    pub fn from_outcomes(
        outcomes: BTreeMap<String, SupplierOutcome>,
        criteria: &SearchCriteria,
        processing_time_ms: u64,
        search_timeout_ms: u64,
    ) -> Self {
        let offers: Vec<Offer> = outcomes
            .values()
            .filter(|o| o.is_success())
            .flat_map(|o| o.offers.iter().cloned())
            .collect();

        let count = |status: OutcomeStatus| outcomes.values().filter(|o| o.status == status).count();

        let summary = SearchSummary {
            total_offers: offers.len(),
            successful_suppliers: count(OutcomeStatus::Success),
            error_suppliers: count(OutcomeStatus::Error),
            timeout_suppliers: count(OutcomeStatus::Timeout),
            processing_time_ms,
            hotel_count: criteria.hotel_names.len(),
            hotels_searched: criteria.hotel_names.clone(),
            search_timeout_ms,
        };

        Self {
            suppliers: outcomes,
            offers,
            summary,
        }
    }

    pub fn outcome(&self, supplier: &str) -> Option<&SupplierOutcome> {
        self.suppliers.get(supplier)
    }
}
