//! Concurrent fan-out over every selected supplier under one deadline.
//!
//! Each supplier runs as its own task: `prepare_request_criteria`, then a
//! breaker-gated `search` + `normalize` with retry and exponential backoff,
//! then response-level post-processing. The coordinator collects finished
//! tasks until the deadline; whatever is still running is aborted and
//! reported as `timeout`. Every selected supplier ends up with exactly one
//! outcome, and no supplier's failure reaches the caller as an `Err`.

use crate::adapter::{AdapterContext, AdapterRegistry, Normalized, Services, SupplierAdapter};
use crate::circuit_breaker::{BreakerSnapshot, CircuitBreaker};
use crate::config::{AggregatorConfig, RetryConfig, SupplierConfig};
use crate::error::{ClientError, SupplierError};
use crate::models::{AggregatedResult, Offer, SearchCriteria, SupplierOutcome};
use crate::session_pool::{SessionPool, SessionStatsReport};
use anyhow::Context;
use futures::FutureExt;
use std::any::Any;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, error, info, warn};

const DEFAULT_ROOM_CATEGORY: &str = "Other";

struct SupplierSlot {
    adapter: Arc<dyn SupplierAdapter>,
    breaker: Arc<CircuitBreaker>,
}

// Everything one supplier task needs, owned so the task is 'static
struct SupplierUnit {
    id: String,
    adapter: Arc<dyn SupplierAdapter>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryConfig,
    services: Services,
    // Shared with the coordinator so a cancelled unit still reports its attempts
    attempts: Arc<AtomicU32>,
}

pub struct Orchestrator {
    suppliers: BTreeMap<String, SupplierSlot>,
    retry: RetryConfig,
    search_timeout_ms: u64,
    services: Services,
    pool: Arc<SessionPool>,
}

impl Orchestrator {
    /// Instantiate one adapter and one breaker per active configured
    /// supplier. A supplier that fails to load is logged and left out; only
    /// an empty result is an error.
    pub fn new(
        config: AggregatorConfig,
        registry: &AdapterRegistry,
        services: Services,
    ) -> Result<Self, ClientError> {
        if config.search_timeout_ms == 0 {
            return Err(ClientError::ConfigError(
                "search_timeout_ms must be positive".to_string(),
            ));
        }

        let services = services.with_meal_strategies(&config.suppliers);
        let pool = Arc::new(SessionPool::new(config.pool.clone()));
        let mut suppliers = BTreeMap::new();

        for supplier in &config.suppliers {
            if !supplier.active {
                debug!(supplier = %supplier.id, "Supplier inactive, skipping");
                continue;
            }
            if suppliers.contains_key(&supplier.id) {
                warn!(supplier = %supplier.id, "Duplicate supplier entry ignored");
                continue;
            }
            match load_supplier(supplier, registry, &pool, &services) {
                Ok(slot) => {
                    info!(supplier = %supplier.id, "Supplier loaded");
                    suppliers.insert(supplier.id.clone(), slot);
                }
                Err(e) => warn!(supplier = %supplier.id, error = %format!("{:#}", e), "Supplier excluded"),
            }
        }

        if suppliers.is_empty() {
            return Err(ClientError::InitError(
                "no supplier could be loaded".to_string(),
            ));
        }
        info!(count = suppliers.len(), "Orchestrator ready");

        Ok(Self {
            suppliers,
            retry: config.retry,
            search_timeout_ms: config.search_timeout_ms,
            services,
            pool,
        })
    }

    pub fn with_builtin_suppliers(
        config: AggregatorConfig,
        services: Services,
    ) -> Result<Self, ClientError> {
        Self::new(config, &AdapterRegistry::with_builtin_suppliers(), services)
    }

    pub fn available_suppliers(&self) -> Vec<String> {
        self.suppliers.keys().cloned().collect()
    }

    /// Known suppliers named in `requested`, or every supplier when the
    /// list is empty or names none we know.
    fn select_suppliers(&self, requested: &[String]) -> Vec<String> {
        if requested.is_empty() {
            return self.available_suppliers();
        }

        let mut seen = HashSet::new();
        let selected: Vec<String> = requested
            .iter()
            .map(|s| s.trim())
            .filter(|s| self.suppliers.contains_key(*s) && seen.insert(s.to_string()))
            .map(String::from)
            .collect();

        let unknown: Vec<&String> = requested
            .iter()
            .filter(|s| !self.suppliers.contains_key(s.trim()))
            .collect();
        if !unknown.is_empty() {
            warn!(unknown = ?unknown, "Ignoring unknown suppliers in request");
        }

        if selected.is_empty() {
            warn!(requested = ?requested, "No known supplier requested, falling back to all suppliers");
            return self.available_suppliers();
        }
        selected
    }

    pub async fn search_all(&self, criteria: &SearchCriteria) -> AggregatedResult {
        let started = Instant::now();
        let selected = self.select_suppliers(&criteria.suppliers);
        let deadline_ms = criteria.search_timeout_ms.unwrap_or(self.search_timeout_ms);

        info!(
            suppliers = ?selected,
            hotels = criteria.hotel_names.len(),
            check_in = %criteria.check_in,
            check_out = %criteria.check_out,
            deadline_ms,
            "Starting search"
        );

        let outcomes = self.fan_out(&selected, criteria, deadline_ms).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        let result = AggregatedResult::from_outcomes(outcomes, criteria, elapsed_ms, deadline_ms);

        info!(
            total_offers = result.summary.total_offers,
            successful = result.summary.successful_suppliers,
            errors = result.summary.error_suppliers,
            timeouts = result.summary.timeout_suppliers,
            elapsed_ms,
            "Search finished"
        );
        result
    }

    /// Run one supplier through the same pipeline as `search_all`.
    pub async fn search_single(&self, supplier: &str, criteria: &SearchCriteria) -> SupplierOutcome {
        if !self.suppliers.contains_key(supplier) {
            let err = SupplierError::NotConfigured(supplier.to_string());
            warn!(supplier, "Search for unknown supplier");
            return SupplierOutcome::error(supplier, err.to_string(), 0);
        }

        let deadline_ms = criteria.search_timeout_ms.unwrap_or(self.search_timeout_ms);
        let mut outcomes = self
            .fan_out(&[supplier.to_string()], criteria, deadline_ms)
            .await;
        outcomes
            .remove(supplier)
            .unwrap_or_else(|| SupplierOutcome::timeout(supplier, deadline_ms))
    }

    async fn fan_out(
        &self,
        selected: &[String],
        criteria: &SearchCriteria,
        deadline_ms: u64,
    ) -> BTreeMap<String, SupplierOutcome> {
        let criteria = Arc::new(criteria.clone());
        let deadline = Instant::now() + Duration::from_millis(deadline_ms);
        let mut set = JoinSet::new();
        let mut attempts = HashMap::new();

        for id in selected {
            let Some(unit) = self.unit(id) else { continue };
            attempts.insert(id.clone(), unit.attempts.clone());
            let criteria = criteria.clone();
            set.spawn(async move {
                let id = unit.id.clone();
                let attempts_made = unit.attempts.clone();
                let started = Instant::now();
                let outcome = AssertUnwindSafe(unit.run(criteria))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| {
                        let message = panic_message(panic.as_ref());
                        error!(supplier = %id, panic = %message, "Supplier task panicked");
                        let mut outcome = SupplierOutcome::error(
                            &id,
                            format!("supplier task panicked: {}", message),
                            attempts_made.load(Ordering::SeqCst),
                        );
                        outcome.processing_time_ms = started.elapsed().as_millis() as u64;
                        outcome
                    });
                (id, outcome)
            });
        }

        let mut outcomes = BTreeMap::new();
        let mut deadline_hit = false;
        loop {
            match timeout_at(deadline, set.join_next()).await {
                Ok(Some(Ok((id, outcome)))) => {
                    debug!(supplier = %id, status = ?outcome.status, "Supplier finished");
                    outcomes.insert(id, outcome);
                }
                Ok(Some(Err(e))) => error!(error = %e, "Supplier task failed"),
                Ok(None) => break,
                Err(_) => {
                    warn!(pending = set.len(), deadline_ms, "Search deadline reached, cancelling");
                    set.abort_all();
                    deadline_hit = true;
                    break;
                }
            }
        }

        for id in selected {
            if outcomes.contains_key(id) {
                continue;
            }
            let made = attempts
                .get(id)
                .map_or(0, |counter| counter.load(Ordering::SeqCst));
            let mut outcome = if deadline_hit {
                SupplierOutcome::timeout(id, deadline_ms)
            } else {
                SupplierOutcome::error(id, "supplier task ended without an outcome", 0)
            };
            outcome.attempts = made;
            outcome.circuit_breaker_state = self.suppliers.get(id).map(|s| s.breaker.state());
            outcomes.insert(id.clone(), outcome);
        }
        outcomes
    }

    fn unit(&self, id: &str) -> Option<SupplierUnit> {
        self.suppliers.get(id).map(|slot| SupplierUnit {
            id: id.to_string(),
            adapter: slot.adapter.clone(),
            breaker: slot.breaker.clone(),
            retry: self.retry.clone(),
            services: self.services.clone(),
            attempts: Arc::new(AtomicU32::new(0)),
        })
    }

    pub fn breaker_snapshot(&self, supplier: &str) -> Option<BreakerSnapshot> {
        self.suppliers.get(supplier).map(|s| s.breaker.snapshot())
    }

    pub fn breaker_snapshots(&self) -> Vec<BreakerSnapshot> {
        self.suppliers.values().map(|s| s.breaker.snapshot()).collect()
    }

    pub fn reset_breaker(&self, supplier: &str) -> Result<(), SupplierError> {
        let slot = self
            .suppliers
            .get(supplier)
            .ok_or_else(|| SupplierError::NotConfigured(supplier.to_string()))?;
        slot.breaker.reset();
        Ok(())
    }

    pub fn pool_stats(&self) -> SessionStatsReport {
        self.pool.stats()
    }

    /// Tear down every pooled client. Safe to call more than once; only the
    /// first call closes anything.
    pub fn close(&self) -> usize {
        self.pool.close()
    }
}

fn load_supplier(
    supplier: &SupplierConfig,
    registry: &AdapterRegistry,
    pool: &Arc<SessionPool>,
    services: &Services,
) -> anyhow::Result<SupplierSlot> {
    supplier.validate()?;
    let factory = registry
        .get(&supplier.id)
        .with_context(|| format!("no adapter registered for {}", supplier.id))?;
    let breaker = CircuitBreaker::new(supplier.id.clone(), &supplier.breaker_config())?;
    let adapter = factory(AdapterContext {
        config: supplier.clone(),
        pool: pool.clone(),
        services: services.clone(),
    })
    .with_context(|| format!("failed to build adapter for {}", supplier.id))?;

    Ok(SupplierSlot {
        adapter,
        breaker: Arc::new(breaker),
    })
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl SupplierUnit {
    async fn run(self, criteria: Arc<SearchCriteria>) -> SupplierOutcome {
        let started = Instant::now();
        let prepared = self.adapter.prepare_request_criteria(&criteria);

        let mut attempts: u32;
        let result = loop {
            attempts = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            match self.attempt(&prepared).await {
                Ok(normalized) => break Ok(normalized),
                Err(err) => {
                    let retries_used = attempts - 1;
                    if !err.is_retryable() || retries_used >= self.retry.max_retries {
                        break Err(err);
                    }
                    let delay = self.retry.delay_for_retry(attempts);
                    warn!(
                        supplier = %self.id,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Supplier call failed, retrying"
                    );
                    sleep(delay).await;
                }
            }
        };

        let mut outcome = match result {
            Ok(normalized) => {
                let offers = self.post_process(normalized.offers, &criteria);
                let mut outcome = SupplierOutcome::success(&self.id, offers, attempts);
                outcome.dropped_entries = normalized.dropped;
                outcome
            }
            Err(err) => {
                if err.is_circuit_open() {
                    info!(supplier = %self.id, "Skipped, circuit breaker open");
                } else {
                    warn!(supplier = %self.id, attempts, error = %err, "Supplier failed");
                }
                SupplierOutcome::error(&self.id, err.to_string(), attempts)
            }
        };
        outcome.processing_time_ms = started.elapsed().as_millis() as u64;
        outcome.circuit_breaker_state = Some(self.breaker.state());
        outcome
    }

    // One breaker-gated search + normalize. An unparseable response counts
    // against the breaker like any other failed call.
    async fn attempt(&self, prepared: &SearchCriteria) -> Result<Normalized, SupplierError> {
        let adapter = &self.adapter;
        self.breaker
            .call(async move {
                let raw = adapter.search(prepared).await?;
                adapter.normalize(&raw, prepared)
            })
            .await
    }

    fn post_process(&self, offers: Vec<Offer>, criteria: &SearchCriteria) -> Vec<Offer> {
        let meals = &self.services.meals;
        let before = offers.len();

        let allowed: HashSet<String> = criteria
            .requested_meal_types()
            .filter(|code| !meals.should_filter_at_request_level(&self.id, code))
            .flat_map(|code| meals.response_values_for(&self.id, code))
            .map(|value| value.to_lowercase())
            .collect();

        let wanted_category = criteria
            .room_category
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty());

        let offers: Vec<Offer> = offers
            .into_iter()
            .filter(|offer| {
                allowed.is_empty()
                    || offer
                        .meal_plan
                        .as_deref()
                        .map_or(false, |plan| allowed.contains(&plan.to_lowercase()))
            })
            .map(|mut offer| {
                let category = self
                    .services
                    .rooms
                    .category_for(&offer.room_name)
                    .unwrap_or_else(|| DEFAULT_ROOM_CATEGORY.to_string());
                offer.room_category = Some(category);
                offer
            })
            .filter(|offer| match wanted_category {
                Some(wanted) => offer
                    .room_category
                    .as_deref()
                    .map_or(false, |c| c.eq_ignore_ascii_case(wanted)),
                None => true,
            })
            .map(|mut offer| {
                if let Some(plan) = offer.meal_plan.as_deref() {
                    if let Some(code) = meals.standard_code_for(&self.id, plan) {
                        offer.meal_plan = Some(code);
                    }
                }
                offer
            })
            .collect();

        if offers.len() != before {
            debug!(supplier = %self.id, before, after = offers.len(), "Response filters applied");
        }
        offers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::RawResponse;
    use crate::circuit_breaker::CircuitState;
    use crate::config::CircuitBreakerConfig;
    use crate::lookup::{MealCodeTable, MealFilterStrategy, RoomCategoryTable, StaticHotelIds};
    use crate::models::OutcomeStatus;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone)]
    enum Step {
        Offers { after_ms: u64, offers: Vec<Offer> },
        Fail { after_ms: u64, error: SupplierError },
        Garbage,
        Hang,
        Panic,
    }

    // Plays back a script of responses, repeating the last step
    struct ScriptedAdapter {
        id: String,
        script: Mutex<VecDeque<Step>>,
        last: Mutex<Option<Step>>,
        calls: AtomicUsize,
    }

    impl ScriptedAdapter {
        fn new(id: &str, steps: Vec<Step>) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                script: Mutex::new(steps.into()),
                last: Mutex::new(None),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn next_step(&self) -> Step {
            let mut script = self.script.lock();
            let mut last = self.last.lock();
            if let Some(step) = script.pop_front() {
                *last = Some(step.clone());
                return step;
            }
            last.clone().unwrap_or(Step::Hang)
        }
    }

    #[async_trait]
    impl SupplierAdapter for ScriptedAdapter {
        fn id(&self) -> &str {
            &self.id
        }

        async fn search(&self, _criteria: &SearchCriteria) -> Result<RawResponse, SupplierError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.next_step() {
                Step::Offers { after_ms, offers } => {
                    sleep(Duration::from_millis(after_ms)).await;
                    let body = serde_json::to_vec(&offers).unwrap();
                    Ok(RawResponse::new(body, Default::default()))
                }
                Step::Fail { after_ms, error } => {
                    sleep(Duration::from_millis(after_ms)).await;
                    Err(error)
                }
                Step::Garbage => Ok(RawResponse::new("{not json", Default::default())),
                Step::Hang => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
                Step::Panic => panic!("adapter exploded"),
            }
        }

        fn normalize(&self, raw: &RawResponse, _criteria: &SearchCriteria) -> Result<Normalized, SupplierError> {
            let offers: Vec<Offer> = serde_json::from_slice(&raw.body)?;
            Ok(Normalized { offers, dropped: 0 })
        }
    }

    fn offer(provider: &str, room: &str, meal: &str) -> Offer {
        Offer {
            provider: provider.to_string(),
            room_name: room.to_string(),
            meal_plan: Some(meal.to_string()),
            total_price: 100.0,
            currency: "EUR".to_string(),
            ..Default::default()
        }
    }

    fn offers(provider: &str, count: usize) -> Vec<Offer> {
        (0..count).map(|_| offer(provider, "Twin Room", "room_only")).collect()
    }

    fn network_error() -> SupplierError {
        SupplierError::NetworkError("connection reset".to_string())
    }

    fn services() -> Services {
        let meals = MealCodeTable::new()
            .with("BB", "a", "breakfast")
            .with("RO", "a", "room_only")
            .with("BB", "b", "BB");
        let rooms = RoomCategoryTable::new()
            .with("Deluxe Pool Villa", "Premium")
            .with("Twin Room", "Standard");
        Services::new(Arc::new(StaticHotelIds::new()), Arc::new(meals), Arc::new(rooms))
    }

    fn meal_strategy(id: &str) -> MealFilterStrategy {
        match id {
            "a" => MealFilterStrategy::ResponseLevel,
            "b" => MealFilterStrategy::RequestLevel,
            _ => MealFilterStrategy::NotSupported,
        }
    }

    fn build(adapters: Vec<Arc<ScriptedAdapter>>) -> Orchestrator {
        build_with(adapters, meal_strategy)
    }

    fn build_with(
        adapters: Vec<Arc<ScriptedAdapter>>,
        strategy: fn(&str) -> MealFilterStrategy,
    ) -> Orchestrator {
        let mut registry = AdapterRegistry::new();
        let mut suppliers = Vec::new();
        for adapter in adapters {
            let mut supplier = SupplierConfig::new(adapter.id.clone(), "http://supplier.test");
            supplier.meal_strategy = strategy(&adapter.id);
            suppliers.push(supplier);
            let id = adapter.id.clone();
            registry.register(id, move |_ctx| Ok(adapter.clone() as Arc<dyn SupplierAdapter>));
        }
        let config = AggregatorConfig {
            suppliers,
            retry: RetryConfig {
                max_retries: 2,
                base_delay_ms: 1000,
            },
            search_timeout_ms: 5000,
            ..Default::default()
        };
        Orchestrator::new(config, &registry, services()).unwrap()
    }

    fn criteria() -> SearchCriteria {
        SearchCriteria::new(
            vec!["Banyan Tree Krabi".to_string()],
            NaiveDate::from_ymd_opt(2025, 8, 15).unwrap(),
            NaiveDate::from_ymd_opt(2025, 8, 18).unwrap(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_results_under_deadline() {
        let a = ScriptedAdapter::new("a", vec![Step::Offers { after_ms: 1000, offers: offers("a", 4) }]);
        let b = ScriptedAdapter::new(
            "b",
            vec![
                Step::Fail { after_ms: 0, error: network_error() },
                Step::Fail { after_ms: 0, error: network_error() },
                Step::Offers { after_ms: 0, offers: offers("b", 2) },
            ],
        );
        let c = ScriptedAdapter::new("c", vec![Step::Hang]);
        let orchestrator = build(vec![a.clone(), b.clone(), c.clone()]);

        let started = Instant::now();
        let result = orchestrator.search_all(&criteria()).await;
        assert_eq!(started.elapsed(), Duration::from_millis(5000));

        assert_eq!(result.suppliers.len(), 3);
        let outcome_a = result.outcome("a").unwrap();
        assert_eq!(outcome_a.status, OutcomeStatus::Success);
        assert_eq!(outcome_a.offers.len(), 4);
        assert_eq!(outcome_a.processing_time_ms, 1000);

        let outcome_b = result.outcome("b").unwrap();
        assert_eq!(outcome_b.status, OutcomeStatus::Success);
        assert_eq!(outcome_b.offers.len(), 2);
        assert_eq!(outcome_b.attempts, 3);
        // 1s + 2s of backoff
        assert_eq!(outcome_b.processing_time_ms, 3000);
        assert_eq!(outcome_b.circuit_breaker_state, Some(CircuitState::Closed));

        let outcome_c = result.outcome("c").unwrap();
        assert_eq!(outcome_c.status, OutcomeStatus::Timeout);
        assert!(outcome_c.offers.is_empty());
        assert_eq!(outcome_c.attempts, 1);

        assert_eq!(result.summary.total_offers, 6);
        assert_eq!(result.summary.successful_suppliers, 2);
        assert_eq!(result.summary.timeout_suppliers, 1);
        assert_eq!(b.calls(), 3);
        assert_eq!(orchestrator.breaker_snapshot("b").unwrap().failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_supplier_reported_once() {
        let a = ScriptedAdapter::new("a", vec![Step::Fail { after_ms: 0, error: SupplierError::invalid("bad dates") }]);
        let b = ScriptedAdapter::new("b", vec![Step::Hang]);
        let c = ScriptedAdapter::new("c", vec![Step::Offers { after_ms: 10, offers: vec![] }]);
        let orchestrator = build(vec![a.clone(), b, c]);

        let result = orchestrator.search_all(&criteria()).await;
        assert_eq!(result.suppliers.len(), 3);
        assert_eq!(result.outcome("a").unwrap().status, OutcomeStatus::Error);
        // Client-side errors are not retried
        assert_eq!(a.calls(), 1);
        assert_eq!(result.outcome("b").unwrap().status, OutcomeStatus::Timeout);
        assert_eq!(result.outcome("c").unwrap().status, OutcomeStatus::Success);
        assert_eq!(result.summary.total_offers, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_suppliers_time_out() {
        let a = ScriptedAdapter::new("a", vec![Step::Hang]);
        let b = ScriptedAdapter::new("b", vec![Step::Offers { after_ms: 60_000, offers: offers("b", 1) }]);
        let orchestrator = build(vec![a, b]);

        let result = orchestrator
            .search_all(&criteria().with_search_timeout_ms(250))
            .await;
        assert_eq!(result.summary.timeout_suppliers, 2);
        assert_eq!(result.summary.search_timeout_ms, 250);
        assert!(result.offers.is_empty());
        assert!(result
            .suppliers
            .values()
            .all(|o| o.error.as_deref() == Some("No response within the 250ms search deadline")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_reports_attempts_made() {
        // Two quick failures, then the third attempt never answers
        let x = ScriptedAdapter::new(
            "x",
            vec![
                Step::Fail { after_ms: 0, error: network_error() },
                Step::Fail { after_ms: 0, error: network_error() },
                Step::Hang,
            ],
        );
        let orchestrator = build(vec![x.clone()]);

        let outcome = orchestrator.search_single("x", &criteria()).await;
        assert_eq!(outcome.status, OutcomeStatus::Timeout);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(x.calls(), 3);
        assert_eq!(outcome.circuit_breaker_state, Some(CircuitState::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_opens_and_rejects_without_calls() {
        let x = ScriptedAdapter::new("x", vec![Step::Fail { after_ms: 0, error: network_error() }]);
        let orchestrator = build(vec![x.clone()]);

        let first = orchestrator.search_single("x", &criteria()).await;
        assert_eq!(first.status, OutcomeStatus::Error);
        assert_eq!(first.attempts, 3);
        assert_eq!(first.circuit_breaker_state, Some(CircuitState::Open));
        assert_eq!(x.calls(), 3);

        let second = orchestrator.search_single("x", &criteria()).await;
        assert_eq!(second.status, OutcomeStatus::Error);
        assert_eq!(second.attempts, 1);
        assert!(second.error.as_deref().unwrap().contains("Circuit breaker open"));
        assert_eq!(x.calls(), 3);

        // After reset_timeout the next call is a HalfOpen trial
        tokio::time::advance(Duration::from_millis(CircuitBreakerConfig::default().reset_timeout_ms)).await;
        assert_eq!(
            orchestrator.breaker_snapshot("x").unwrap().state,
            CircuitState::HalfOpen
        );
        let third = orchestrator.search_single("x", &criteria()).await;
        assert_eq!(x.calls(), 4);
        assert_eq!(third.circuit_breaker_state, Some(CircuitState::Open));
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_success_closes() {
        let x = ScriptedAdapter::new(
            "x",
            vec![
                Step::Fail { after_ms: 0, error: network_error() },
                Step::Fail { after_ms: 0, error: network_error() },
                Step::Fail { after_ms: 0, error: network_error() },
                Step::Offers { after_ms: 0, offers: offers("x", 1) },
            ],
        );
        let orchestrator = build(vec![x.clone()]);
        orchestrator.search_single("x", &criteria()).await;
        tokio::time::advance(Duration::from_secs(60)).await;

        let outcome = orchestrator.search_single("x", &criteria()).await;
        assert!(outcome.is_success());
        let snapshot = orchestrator.breaker_snapshot("x").unwrap();
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_backoff_is_exponential() {
        let x = ScriptedAdapter::new("x", vec![Step::Fail { after_ms: 0, error: network_error() }]);
        let orchestrator = build(vec![x.clone()]);

        let started = Instant::now();
        let outcome = orchestrator
            .search_single("x", &criteria().with_search_timeout_ms(60_000))
            .await;
        // 1000ms before retry 1, 2000ms before retry 2
        assert_eq!(started.elapsed(), Duration::from_millis(3000));
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.processing_time_ms, 3000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unparseable_response_counts_as_failure() {
        let x = ScriptedAdapter::new("x", vec![Step::Garbage]);
        let orchestrator = build(vec![x.clone()]);

        let outcome = orchestrator.search_single("x", &criteria()).await;
        assert_eq!(outcome.status, OutcomeStatus::Error);
        assert!(outcome.error.as_deref().unwrap().starts_with("Unparseable supplier response"));
        assert_eq!(x.calls(), 3);
        assert_eq!(orchestrator.breaker_snapshot("x").unwrap().state, CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panic_is_isolated() {
        let a = ScriptedAdapter::new("a", vec![Step::Panic]);
        let b = ScriptedAdapter::new("b", vec![Step::Offers { after_ms: 5, offers: offers("b", 2) }]);
        let orchestrator = build(vec![a, b]);

        let result = orchestrator.search_all(&criteria()).await;
        let outcome_a = result.outcome("a").unwrap();
        assert_eq!(outcome_a.status, OutcomeStatus::Error);
        assert!(outcome_a.error.as_deref().unwrap().contains("adapter exploded"));
        assert_eq!(result.outcome("b").unwrap().offers.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_supplier_subset_and_fallback() {
        let a = ScriptedAdapter::new("a", vec![Step::Offers { after_ms: 0, offers: offers("a", 1) }]);
        let b = ScriptedAdapter::new("b", vec![Step::Offers { after_ms: 0, offers: offers("b", 1) }]);
        let orchestrator = build(vec![a.clone(), b.clone()]);

        let result = orchestrator
            .search_all(&criteria().with_suppliers(&["b", "expedia"]))
            .await;
        assert_eq!(result.suppliers.keys().collect::<Vec<_>>(), vec!["b"]);
        assert_eq!(a.calls(), 0);

        let result = orchestrator
            .search_all(&criteria().with_suppliers(&["expedia"]))
            .await;
        assert_eq!(result.suppliers.len(), 2);
        assert_eq!(a.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_search_single_unknown_supplier() {
        let orchestrator = build(vec![ScriptedAdapter::new("a", vec![Step::Hang])]);
        let outcome = orchestrator.search_single("expedia", &criteria()).await;
        assert_eq!(outcome.status, OutcomeStatus::Error);
        assert_eq!(outcome.attempts, 0);
        assert_eq!(outcome.error.as_deref(), Some("Supplier not configured: expedia"));
        assert!(outcome.circuit_breaker_state.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_meal_and_room_filters() {
        let catalog = vec![
            offer("a", "Deluxe Pool Villa", "breakfast"),
            offer("a", "Deluxe Pool Villa", "Room_Only"),
            offer("a", "Twin Room", "BREAKFAST"),
            offer("a", "Jungle Hut", "breakfast"),
        ];
        let a = ScriptedAdapter::new("a", vec![Step::Offers { after_ms: 0, offers: catalog }]);
        let orchestrator = build(vec![a]);

        let result = orchestrator
            .search_all(&criteria().with_meal_types(&["BB"]))
            .await;
        let offers = &result.outcome("a").unwrap().offers;
        assert_eq!(offers.len(), 3);
        assert_eq!(offers[0].meal_plan.as_deref(), Some("BB"));
        // Values without a standard code stay as received
        assert_eq!(offers[1].meal_plan.as_deref(), Some("BREAKFAST"));
        let categories: Vec<&str> = offers.iter().filter_map(|o| o.room_category.as_deref()).collect();
        assert_eq!(categories, vec!["Premium", "Standard", "Other"]);

        let result = orchestrator
            .search_all(&criteria().with_meal_types(&["BB"]).with_room_category("premium"))
            .await;
        assert_eq!(result.summary.total_offers, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_configured_meal_strategy_controls_filtering() {
        let catalog = vec![offer("a", "Twin Room", "breakfast"), offer("a", "Twin Room", "room_only")];
        let a = ScriptedAdapter::new("a", vec![Step::Offers { after_ms: 0, offers: catalog }]);
        let criteria = criteria().with_meal_types(&["BB"]);

        let filtering = build(vec![a.clone()]);
        assert_eq!(filtering.search_all(&criteria).await.summary.total_offers, 1);

        // Same code rows, but the supplier is configured without meal support
        let unfiltered = build_with(vec![a], |_| MealFilterStrategy::NotSupported);
        let result = unfiltered.search_all(&criteria).await;
        assert_eq!(result.summary.total_offers, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_level_meal_codes_skip_response_filter() {
        let catalog = vec![offer("b", "Twin Room", "BB"), offer("b", "Twin Room", "HB")];
        let b = ScriptedAdapter::new("b", vec![Step::Offers { after_ms: 0, offers: catalog }]);
        let orchestrator = build(vec![b]);

        let result = orchestrator
            .search_all(&criteria().with_meal_types(&["BB"]))
            .await;
        assert_eq!(result.summary.total_offers, 2);
    }

    #[test]
    fn test_boot_excludes_broken_suppliers() {
        let mut registry = AdapterRegistry::new();
        let good = ScriptedAdapter::new("good", vec![Step::Hang]);
        registry.register("good", move |_ctx| Ok(good.clone() as Arc<dyn SupplierAdapter>));
        registry.register("broken", |_ctx| anyhow::bail!("missing credentials"));

        let mut inactive = SupplierConfig::new("good_but_off", "http://supplier.test");
        inactive.active = false;
        let mut bad_breaker = SupplierConfig::new("bad_breaker", "http://supplier.test");
        bad_breaker.breaker.failure_threshold = 0;

        let config = AggregatorConfig {
            suppliers: vec![
                SupplierConfig::new("good", "http://supplier.test"),
                SupplierConfig::new("broken", "http://supplier.test"),
                SupplierConfig::new("unregistered", "http://supplier.test"),
                inactive,
                bad_breaker,
            ],
            ..Default::default()
        };
        let orchestrator = Orchestrator::new(config, &registry, services()).unwrap();
        assert_eq!(orchestrator.available_suppliers(), vec!["good"]);
    }

    #[test]
    fn test_boot_fails_without_suppliers() {
        let config = AggregatorConfig {
            suppliers: vec![SupplierConfig::new("unregistered", "http://supplier.test")],
            ..Default::default()
        };
        let result = Orchestrator::new(config, &AdapterRegistry::new(), services());
        assert!(matches!(result, Err(ClientError::InitError(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_breaker_and_close() {
        let x = ScriptedAdapter::new("x", vec![Step::Fail { after_ms: 0, error: network_error() }]);
        let orchestrator = build(vec![x]);
        orchestrator.search_single("x", &criteria()).await;
        assert_eq!(orchestrator.breaker_snapshots()[0].state, CircuitState::Open);

        orchestrator.reset_breaker("x").unwrap();
        assert_eq!(orchestrator.breaker_snapshot("x").unwrap().state, CircuitState::Closed);
        assert!(orchestrator.reset_breaker("expedia").is_err());

        assert_eq!(orchestrator.close(), 0);
        assert_eq!(orchestrator.close(), 0);
        assert_eq!(orchestrator.pool_stats().active, 0);
    }
}
