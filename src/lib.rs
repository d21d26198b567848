// Main library file for the hotel rate aggregator

// Resilience building blocks
pub mod circuit_breaker;
pub mod session_pool;

// Supplier contract and the built-in integrations
pub mod adapter;
pub mod suppliers;

// Fan-out coordinator
pub mod orchestrator;

pub mod config;
pub mod error;
pub mod lookup;
pub mod models;

// Re-export key types for convenience
pub use adapter::{
    AdapterContext, AdapterFactory, AdapterRegistry, Normalized, RawResponse, Services,
    SupplierAdapter,
};
pub use circuit_breaker::{BreakerSnapshot, CircuitBreaker, CircuitState};
pub use config::{
    AggregatorConfig, AuthMode, CircuitBreakerConfig, ConfigProvider, EnvConfigProvider,
    MemoryConfigProvider, PoolConfig, RetryConfig, SupplierConfig,
};
pub use error::{ClientError, SupplierError};
pub use lookup::{
    HotelIdLookup, MealCodeTable, MealCodes, MealFilterStrategy, MealMapper, MealMapping,
    RoomCategoryLookup, RoomCategoryTable, StaticHotelIds,
};
pub use models::{
    AggregatedResult, Offer, OutcomeStatus, SearchCriteria, SearchSummary, SupplierOutcome,
};
pub use orchestrator::Orchestrator;
pub use session_pool::{PooledSession, SessionKey, SessionPool, SessionStatsReport};
