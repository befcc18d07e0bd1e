//! Keyed registry that composes breaker, retry and bulkhead
//!
//! Each [`OperationKey`] owns exactly one [`ResilienceUnit`] (a circuit breaker
//! and a bulkhead) for the lifetime of the pipeline. Every call made under the
//! same key shares that unit, whichever caller makes it. The first caller's
//! configuration builds the unit; later configs only contribute their retry
//! parameters, which are applied per call.
//!
//! Calls are always nested as `breaker( retry( bulkhead( task ) ) )`:
//! - an open breaker fails fast before any retry or queueing happens
//! - each retry attempt queues for a fresh bulkhead slot
//! - the breaker records one outcome per call, after retries are exhausted

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{info, instrument};

use crate::clock::{Clock, SystemClock};
use crate::config::ResilienceConfig;
use crate::error::{ConfigResult, ResilienceError, ResilienceResult};
use crate::observability::{SharedObserver, TracingObserver};
use crate::resilience::{
    Bulkhead, BulkheadStats, CircuitBreaker, CircuitBreakerMetrics, RetryPolicy,
};

/// Identity of a protected operation
///
/// Conventionally `Type::method`, see [`OperationKey::for_method`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationKey(Arc<str>);

impl OperationKey {
    pub fn new(key: impl AsRef<str>) -> Self {
        Self(Arc::from(key.as_ref()))
    }

    /// Key for `method` on type `T`, rendered as `TypeName::method`
    ///
    /// ```rust
    /// use resilia::OperationKey;
    ///
    /// struct UserService;
    ///
    /// let key = OperationKey::for_method::<UserService>("get_user_data");
    /// assert_eq!(key.as_str(), "UserService::get_user_data");
    /// ```
    pub fn for_method<T: ?Sized>(method: &str) -> Self {
        let full = std::any::type_name::<T>();
        let path = full.split('<').next().unwrap_or(full);
        let type_name = path.rsplit("::").next().unwrap_or(path);
        Self::new(format!("{type_name}::{method}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OperationKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for OperationKey {
    fn from(key: String) -> Self {
        Self(Arc::from(key))
    }
}

/// The breaker/bulkhead pair shared by every call under one key
#[derive(Debug)]
pub struct ResilienceUnit<C: Clock = SystemClock> {
    key: OperationKey,
    config: ResilienceConfig,
    breaker: CircuitBreaker<C>,
    bulkhead: Bulkhead,
}

impl<C: Clock> ResilienceUnit<C> {
    pub fn new(
        key: OperationKey,
        config: &ResilienceConfig,
        clock: C,
        observer: SharedObserver,
    ) -> ConfigResult<Self> {
        config.validate()?;
        let breaker =
            CircuitBreaker::from_config(key.as_str(), config, clock, Arc::clone(&observer))?;
        let bulkhead = Bulkhead::from_config(key.as_str(), config, observer)?;
        Ok(Self { key, config: config.clone(), breaker, bulkhead })
    }

    /// Run `task` as `breaker( retry( bulkhead( task ) ) )`
    ///
    /// `task` is invoked once per attempt, and only after a bulkhead slot has
    /// been granted.
    pub async fn execute<F, Fut, T, E>(&self, policy: RetryPolicy, task: F) -> ResilienceResult<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let task = Mutex::new(task);
        let task = &task;
        let bulkhead = &self.bulkhead;

        self.breaker
            .execute(move || async move {
                policy.run(move || bulkhead.run(move || (&mut *task.lock())())).await
            })
            .await
    }

    pub const fn key(&self) -> &OperationKey {
        &self.key
    }

    /// Config the unit was created with
    pub const fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    pub const fn breaker(&self) -> &CircuitBreaker<C> {
        &self.breaker
    }

    pub const fn bulkhead(&self) -> &Bulkhead {
        &self.bulkhead
    }
}

/// Registry of resilience units keyed by operation
///
/// # Examples
///
/// ```rust
/// use resilia::{OperationKey, ResilienceConfig, ResiliencePipeline};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let pipeline = ResiliencePipeline::new();
/// let config = ResilienceConfig::builder().concurrency_limit(4).max_retries(2).build()?;
///
/// let user = pipeline
///     .execute(&OperationKey::new("UserService::get_user_data"), &config, || async {
///         Ok::<_, std::io::Error>("Data Success")
///     })
///     .await?;
/// assert_eq!(user, "Data Success");
/// # Ok(())
/// # }
/// ```
pub struct ResiliencePipeline<C: Clock + Clone = SystemClock> {
    units: DashMap<OperationKey, Arc<ResilienceUnit<C>>>,
    clock: C,
    observer: SharedObserver,
}

impl<C: Clock + Clone> fmt::Debug for ResiliencePipeline<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResiliencePipeline")
            .field("operations", &self.units.len())
            .field("observer", &self.observer)
            .finish_non_exhaustive()
    }
}

impl Default for ResiliencePipeline<SystemClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl ResiliencePipeline<SystemClock> {
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }
}

impl<C: Clock + Clone> ResiliencePipeline<C> {
    /// Create a pipeline whose breakers read time from `clock`
    pub fn with_clock(clock: C) -> Self {
        Self { units: DashMap::new(), clock, observer: Arc::new(TracingObserver) }
    }

    /// Replace the observer handed to units created from now on
    #[must_use]
    pub fn with_observer(mut self, observer: SharedObserver) -> Self {
        self.observer = observer;
        self
    }

    /// Unit for `key`, built from `config` if this is the first request for it
    pub fn get_or_create(
        &self,
        key: &OperationKey,
        config: &ResilienceConfig,
    ) -> ConfigResult<Arc<ResilienceUnit<C>>> {
        if let Some(unit) = self.units.get(key) {
            return Ok(Arc::clone(unit.value()));
        }

        let unit = match self.units.entry(key.clone()) {
            Entry::Occupied(entry) => return Ok(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                let unit = Arc::new(ResilienceUnit::new(
                    key.clone(),
                    config,
                    self.clock.clone(),
                    Arc::clone(&self.observer),
                )?);
                entry.insert(Arc::clone(&unit));
                unit
            }
        };

        info!(
            operation = %key,
            concurrency_limit = config.concurrency_limit,
            queue_limit = config.queue_limit,
            error_threshold = config.error_threshold,
            sleep_window_ms = u64::try_from(config.sleep_window.as_millis()).unwrap_or(u64::MAX),
            worst_case_latency_ms =
                u64::try_from(config.worst_case_latency().as_millis()).unwrap_or(u64::MAX),
            "Resilience layer initialized"
        );
        Ok(unit)
    }

    /// Run `task` under the unit for `key` with `config`'s retry policy
    #[instrument(skip(self, config, task), fields(operation = %key))]
    pub async fn execute<F, Fut, T, E>(
        &self,
        key: &OperationKey,
        config: &ResilienceConfig,
        task: F,
    ) -> ResilienceResult<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let unit = self.get_or_create(key, config).map_err(ResilienceError::InvalidConfig)?;
        unit.execute(config.retry_policy(), task).await
    }

    /// Bind `key` and `config` into a reusable handle
    pub fn operation(
        &self,
        key: impl Into<OperationKey>,
        config: ResilienceConfig,
    ) -> ConfigResult<ResilientOperation<C>> {
        let key = key.into();
        let unit = self.get_or_create(&key, &config)?;
        Ok(ResilientOperation { unit, policy: config.retry_policy(), config })
    }

    /// Breaker snapshot for `key`, if the unit exists
    pub fn breaker(&self, key: &OperationKey) -> Option<CircuitBreakerMetrics> {
        self.units.get(key).map(|unit| unit.breaker().metrics())
    }

    /// Unit registered under `key`, if any call has created it
    pub fn unit(&self, key: &OperationKey) -> Option<Arc<ResilienceUnit<C>>> {
        self.units.get(key).map(|unit| Arc::clone(unit.value()))
    }

    /// Bulkhead occupancy for `key`, if the unit exists
    pub fn bulkhead(&self, key: &OperationKey) -> Option<BulkheadStats> {
        self.units.get(key).map(|unit| unit.bulkhead().stats())
    }

    /// Registered keys, sorted
    pub fn keys(&self) -> Vec<OperationKey> {
        let mut keys: Vec<_> = self.units.iter().map(|entry| entry.key().clone()).collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

/// A protected operation bound to its unit and retry policy
///
/// Cheap to clone; clones share the same breaker and bulkhead.
#[derive(Debug)]
pub struct ResilientOperation<C: Clock = SystemClock> {
    unit: Arc<ResilienceUnit<C>>,
    policy: RetryPolicy,
    config: ResilienceConfig,
}

impl<C: Clock> Clone for ResilientOperation<C> {
    fn clone(&self) -> Self {
        Self { unit: Arc::clone(&self.unit), policy: self.policy, config: self.config.clone() }
    }
}

impl<C: Clock> ResilientOperation<C> {
    /// Run one protected call
    pub async fn call<F, Fut, T, E>(&self, task: F) -> ResilienceResult<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        self.unit.execute(self.policy, task).await
    }

    pub fn key(&self) -> &OperationKey {
        self.unit.key()
    }

    /// Config this handle was bound with (its retry fields apply per call)
    pub const fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    pub fn stats(&self) -> BulkheadStats {
        self.unit.bulkhead().stats()
    }

    pub fn is_open(&self) -> bool {
        self.unit.breaker().is_open()
    }

    pub fn unit(&self) -> &ResilienceUnit<C> {
        &self.unit
    }
}
