//! Long-lived HTTP clients shared by the supplier adapters.
//!
//! Suppliers authenticating with Basic credentials get a dedicated client
//! that carries the `Authorization` header; everyone else shares one
//! client. Clients are created on first use, recreated after being
//! invalidated, and torn down exactly once by [`SessionPool::close`].
//! Adapters borrow sessions and never close them.

use crate::config::{AuthMode, PoolConfig, SupplierConfig};
use crate::error::SupplierError;
use base64::Engine;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SessionKey {
    Shared,
    Dedicated(String),
}

impl SessionKey {
    pub fn for_supplier(supplier: &SupplierConfig) -> Self {
        if supplier.auth.needs_dedicated_session() {
            SessionKey::Dedicated(supplier.id.clone())
        } else {
            SessionKey::Shared
        }
    }
}

// Status and body of a completed exchange
#[derive(Debug, Clone)]
pub struct HttpReply {
    pub status: u16,
    pub body: Bytes,
}

impl HttpReply {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

pub struct PooledSession {
    key: SessionKey,
    client: reqwest::Client,
    permits: Semaphore,
    closed: AtomicBool,
    created_at: Instant,
}

impl PooledSession {
    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Send `request` and read the whole body, holding one of the
    /// session's connection permits for the duration.
    pub async fn execute(
        &self,
        request: reqwest::RequestBuilder,
        timeout: Duration,
    ) -> Result<HttpReply, SupplierError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| SupplierError::SessionPoolClosed)?;

        let response = request
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| self.request_error(e, timeout))?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| self.request_error(e, timeout))?;

        Ok(HttpReply { status, body })
    }

    fn request_error(&self, err: reqwest::Error, timeout: Duration) -> SupplierError {
        if err.is_timeout() {
            return SupplierError::Timeout(timeout.as_millis() as u64);
        }
        if err.is_connect() {
            // The pool rebuilds the client on the next borrow
            self.mark_closed();
            warn!(key = ?self.key, error = %err, "Connection failed, session invalidated");
        }
        SupplierError::from(err)
    }
}

#[derive(Debug, Default)]
pub struct SessionStats {
    pub created: AtomicUsize,
    pub reused: AtomicUsize,
    pub recreated: AtomicUsize,
    pub closed: AtomicUsize,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct SessionStatsReport {
    pub created: usize,
    pub reused: usize,
    pub recreated: usize,
    pub closed: usize,
    pub active: usize,
}

// Resolver shared by every pooled client; answers are kept for the TTL
#[derive(Debug)]
pub struct CachingResolver {
    ttl: Duration,
    cache: Arc<DashMap<String, (Instant, Vec<SocketAddr>)>>,
}

impl CachingResolver {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            cache: Arc::new(DashMap::new()),
        }
    }

    pub fn cached_hosts(&self) -> usize {
        self.cache.len()
    }
}

impl Resolve for CachingResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let host = name.as_str().to_string();
        let ttl = self.ttl;
        let cached = self.cache.get(&host).and_then(|entry| {
            let (resolved_at, addrs) = entry.value();
            (resolved_at.elapsed() < ttl).then(|| addrs.clone())
        });
        Box::pin(resolve_uncached(host, cached, self.cache.clone()))
    }
}

async fn resolve_uncached(
    host: String,
    cached: Option<Vec<SocketAddr>>,
    cache: Arc<DashMap<String, (Instant, Vec<SocketAddr>)>>,
) -> Result<Addrs, Box<dyn std::error::Error + Send + Sync>> {
    let addrs = match cached {
        Some(addrs) => addrs,
        None => {
            let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host.as_str(), 0)).await?.collect();
            debug!(host = %host, count = addrs.len(), "DNS answer cached");
            cache.insert(host, (Instant::now(), addrs.clone()));
            addrs
        }
    };
    Ok(Box::new(addrs.into_iter()))
}

pub struct SessionPool {
    config: PoolConfig,
    resolver: Arc<CachingResolver>,
    sessions: RwLock<HashMap<SessionKey, Arc<PooledSession>>>,
    closed: AtomicBool,
    stats: SessionStats,
}

impl SessionPool {
    pub fn new(config: PoolConfig) -> Self {
        let resolver = Arc::new(CachingResolver::new(Duration::from_secs(
            config.dns_cache_ttl_secs,
        )));
        Self {
            config,
            resolver,
            sessions: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
            stats: SessionStats::default(),
        }
    }

    /// Borrow the session for `supplier`, creating it on first use or if
    /// the previous one was invalidated.
    pub fn session(&self, supplier: &SupplierConfig) -> Result<Arc<PooledSession>, SupplierError> {
        if self.is_closed() {
            return Err(SupplierError::SessionPoolClosed);
        }
        let key = SessionKey::for_supplier(supplier);

        {
            let sessions = self.sessions.read();
            if let Some(session) = sessions.get(&key) {
                if !session.is_closed() {
                    self.stats.reused.fetch_add(1, Ordering::Relaxed);
                    return Ok(session.clone());
                }
            }
        }

        let mut sessions = self.sessions.write();
        // close() may have won the race for the lock
        if self.is_closed() {
            return Err(SupplierError::SessionPoolClosed);
        }
        match sessions.get(&key) {
            Some(session) if !session.is_closed() => {
                self.stats.reused.fetch_add(1, Ordering::Relaxed);
                return Ok(session.clone());
            }
            Some(_) => {
                self.stats.recreated.fetch_add(1, Ordering::Relaxed);
                info!(supplier = %supplier.id, key = ?key, "Recreating closed session");
            }
            None => {
                info!(supplier = %supplier.id, key = ?key, "Creating session");
            }
        }

        let session = Arc::new(self.build_session(key.clone(), supplier)?);
        self.stats.created.fetch_add(1, Ordering::Relaxed);
        sessions.insert(key, session.clone());
        Ok(session)
    }

    fn build_session(
        &self,
        key: SessionKey,
        supplier: &SupplierConfig,
    ) -> Result<PooledSession, SupplierError> {
        let keepalive = Duration::from_secs(self.config.keepalive_secs);
        let mut builder = reqwest::Client::builder()
            .pool_max_idle_per_host(self.config.max_connections_per_host)
            .pool_idle_timeout(keepalive)
            .tcp_keepalive(keepalive)
            .connect_timeout(Duration::from_millis(self.config.connect_timeout_ms))
            .dns_resolver(self.resolver.clone());

        if let AuthMode::Basic { username, password } = &supplier.auth {
            let token = base64::engine::general_purpose::STANDARD
                .encode(format!("{}:{}", username, password));
            let mut value = HeaderValue::from_str(&format!("Basic {}", token)).map_err(|e| {
                SupplierError::Other(format!("{}: invalid credentials header: {}", supplier.id, e))
            })?;
            value.set_sensitive(true);

            let mut headers = HeaderMap::new();
            headers.insert(AUTHORIZATION, value);
            builder = builder.default_headers(headers);
        }

        let client = builder.build().map_err(|e| {
            SupplierError::Other(format!("{}: failed to build HTTP client: {}", supplier.id, e))
        })?;

        Ok(PooledSession {
            key,
            client,
            permits: Semaphore::new(self.config.max_connections.max(1)),
            closed: AtomicBool::new(false),
            created_at: Instant::now(),
        })
    }

    /// Mark the supplier's session closed; the next borrow recreates it.
    pub fn invalidate(&self, supplier: &SupplierConfig) -> bool {
        let key = SessionKey::for_supplier(supplier);
        match self.sessions.read().get(&key) {
            Some(session) => {
                session.mark_closed();
                warn!(supplier = %supplier.id, key = ?key, "Session invalidated");
                true
            }
            None => false,
        }
    }

    /// Tear down every client. Returns how many were closed; later calls
    /// are no-ops returning 0.
    pub fn close(&self) -> usize {
        if self.closed.swap(true, Ordering::SeqCst) {
            return 0;
        }

        let drained: Vec<Arc<PooledSession>> = {
            let mut sessions = self.sessions.write();
            sessions.drain().map(|(_, session)| session).collect()
        };
        for session in &drained {
            session.mark_closed();
            session.permits.close();
        }

        self.stats.closed.fetch_add(drained.len(), Ordering::Relaxed);
        info!(count = drained.len(), "Session pool closed");
        drained.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn resolver(&self) -> &CachingResolver {
        &self.resolver
    }

    pub fn stats(&self) -> SessionStatsReport {
        SessionStatsReport {
            created: self.stats.created.load(Ordering::Relaxed),
            reused: self.stats.reused.load(Ordering::Relaxed),
            recreated: self.stats.recreated.load(Ordering::Relaxed),
            closed: self.stats.closed.load(Ordering::Relaxed),
            active: self.session_count(),
        }
    }
}

impl Default for SessionPool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}
