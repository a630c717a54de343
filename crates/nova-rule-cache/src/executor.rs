//! Cross-build memoization of rule chains.
//!
//! [`CachingRuleExecutor::execute`] keys a chain of parameterized rules by the
//! content of its explicit inputs, reuses a stored result while the validity
//! policy accepts it and every implicit input recorded by the previous run is
//! still up to date, and otherwise runs the chain and replaces the entry.

use crate::any_value::{AnyValue, AnyValueCodec};
use crate::entry::{
    decode_entry, encode_entry, CachedEntry, ImplicitInput, Implicits, ResultSerializer,
};
use crate::error::{CacheError, ExecutionError};
use crate::hash::{ContentHash, Hasher};
use crate::policy::{EntryInfo, ValidityPolicy};
use crate::store::EntryStore;
use crate::util::now_millis;
use crate::value::{ToValueSnapshot, ValueSnapshot};
use lru::LruCache;
use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

/// A pure step that refines a details object in place.
///
/// Rules report anything they consulted beyond their explicit inputs through
/// the [`ImplicitInputRecorder`].
pub trait Rule<D, E>: Send + Sync {
    fn execute(&self, details: &mut D, implicits: &mut ImplicitInputRecorder) -> Result<(), E>;
}

impl<D, E, F> Rule<D, E> for F
where
    F: Fn(&mut D, &mut ImplicitInputRecorder) -> Result<(), E> + Send + Sync,
{
    fn execute(&self, details: &mut D, implicits: &mut ImplicitInputRecorder) -> Result<(), E> {
        self(details, implicits)
    }
}

/// A rule together with the identity that goes into the cache key: a stable
/// implementation id and a snapshot of its parameters.
pub struct ParameterizedRule<D, E> {
    implementation_id: Arc<str>,
    params: ValueSnapshot,
    rule: Arc<dyn Rule<D, E>>,
}

impl<D, E> ParameterizedRule<D, E> {
    /// `params` is snapshotted immediately; later mutation by the caller has
    /// no effect on the key.
    pub fn new<P>(implementation_id: &str, params: &P, rule: impl Rule<D, E> + 'static) -> Self
    where
        P: ToValueSnapshot + ?Sized,
    {
        Self {
            implementation_id: Arc::from(implementation_id),
            params: params.to_value_snapshot(),
            rule: Arc::new(rule),
        }
    }

    pub fn implementation_id(&self) -> &str {
        &self.implementation_id
    }

    pub fn params(&self) -> &ValueSnapshot {
        &self.params
    }
}

impl<D, E> Clone for ParameterizedRule<D, E> {
    fn clone(&self) -> Self {
        Self {
            implementation_id: Arc::clone(&self.implementation_id),
            params: self.params.clone(),
            rule: Arc::clone(&self.rule),
        }
    }
}

impl<D, E> fmt::Debug for ParameterizedRule<D, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParameterizedRule")
            .field("implementation_id", &self.implementation_id)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

/// Ordered rules applied to one details object.
pub struct RuleChain<D, E> {
    rules: Vec<ParameterizedRule<D, E>>,
    cacheable: bool,
}

impl<D, E> RuleChain<D, E> {
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            cacheable: true,
        }
    }

    pub fn then(mut self, rule: ParameterizedRule<D, E>) -> Self {
        self.rules.push(rule);
        self
    }

    /// Always execute this chain and never touch the cache, e.g. for rules
    /// whose behavior depends on configuration outside their parameters.
    pub fn non_cacheable(mut self) -> Self {
        self.cacheable = false;
        self
    }

    pub fn is_cacheable(&self) -> bool {
        self.cacheable
    }

    pub fn rules(&self) -> &[ParameterizedRule<D, E>] {
        &self.rules
    }

    fn run(&self, details: &mut D, implicits: &mut ImplicitInputRecorder) -> Result<(), E> {
        for rule in &self.rules {
            rule.rule.execute(details, implicits)?;
        }
        Ok(())
    }
}

impl<D, E> Default for RuleChain<D, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D, E> fmt::Debug for RuleChain<D, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuleChain")
            .field("rules", &self.rules)
            .field("cacheable", &self.cacheable)
            .finish()
    }
}

/// Collects the implicit inputs discovered while a chain runs.
#[derive(Debug, Default)]
pub struct ImplicitInputRecorder {
    implicits: Implicits,
}

impl ImplicitInputRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `service` answered `output` when asked `input`.
    pub fn record(
        &mut self,
        service: &str,
        input: impl Into<AnyValue>,
        output: impl Into<AnyValue>,
    ) {
        self.implicits
            .entry(service.to_string())
            .or_default()
            .push(ImplicitInput {
                input: input.into(),
                output: output.into(),
            });
    }

    pub fn is_empty(&self) -> bool {
        self.implicits.is_empty()
    }

    pub fn into_implicits(self) -> Implicits {
        self.implicits
    }
}

/// Re-checks an implicit input recorded by an earlier run.
pub trait ImplicitInputValidator: Send + Sync {
    fn is_up_to_date(&self, input: &AnyValue, output: &AnyValue) -> bool;
}

impl<F> ImplicitInputValidator for F
where
    F: Fn(&AnyValue, &AnyValue) -> bool + Send + Sync,
{
    fn is_up_to_date(&self, input: &AnyValue, output: &AnyValue) -> bool {
        self(input, output)
    }
}

/// Validators keyed by the service name used when recording.
#[derive(Clone, Default)]
pub struct ImplicitInputValidators {
    by_service: HashMap<String, Arc<dyn ImplicitInputValidator>>,
}

impl ImplicitInputValidators {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        mut self,
        service: impl Into<String>,
        validator: impl ImplicitInputValidator + 'static,
    ) -> Self {
        self.by_service.insert(service.into(), Arc::new(validator));
        self
    }

    pub fn get(&self, service: &str) -> Option<&dyn ImplicitInputValidator> {
        self.by_service.get(service).map(|validator| validator.as_ref())
    }
}

impl fmt::Debug for ImplicitInputValidators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut services: Vec<&str> = self.by_service.keys().map(String::as_str).collect();
        services.sort_unstable();
        f.debug_struct("ImplicitInputValidators")
            .field("services", &services)
            .finish()
    }
}

/// Hash of the explicit inputs of a chain: the snapshotted key, then each
/// rule's implementation id and parameters in chain order.
pub fn cache_key<K, D, E>(key: &K, rules: &RuleChain<D, E>) -> ContentHash
where
    K: ToValueSnapshot + ?Sized,
{
    let mut hasher = Hasher::new();
    key.to_value_snapshot().append_to(&mut hasher);
    for rule in rules.rules() {
        hasher.put_string(&rule.implementation_id);
        rule.params.append_to(&mut hasher);
    }
    hasher.finish()
}

type HotEntries<R> = Mutex<LruCache<ContentHash, Arc<CachedEntry<R>>>>;

/// Runs rule chains through an [`EntryStore`].
///
/// The executor is `Sync`; share it between threads rather than building one
/// executor per thread over the same store. Entries kept by
/// [`with_hot_entries`](Self::with_hot_entries) are private to this executor
/// and are not refreshed when another writer replaces the stored entry.
pub struct CachingRuleExecutor<R> {
    store: Arc<dyn EntryStore>,
    values: AnyValueCodec,
    results: Box<dyn ResultSerializer<R>>,
    validators: ImplicitInputValidators,
    hot: Option<HotEntries<R>>,
}

impl<R> fmt::Debug for CachingRuleExecutor<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachingRuleExecutor")
            .field("values", &self.values)
            .field("validators", &self.validators)
            .field("hot_entries", &self.hot.as_ref().map(|hot| lock_unpoison(hot).cap()))
            .finish_non_exhaustive()
    }
}

impl<R: Clone> CachingRuleExecutor<R> {
    pub fn new(store: Arc<dyn EntryStore>, results: impl ResultSerializer<R> + 'static) -> Self {
        Self {
            store,
            values: AnyValueCodec::new(),
            results: Box::new(results),
            validators: ImplicitInputValidators::new(),
            hot: None,
        }
    }

    /// Codec used for recorded implicit inputs; register extension types here.
    pub fn with_values(mut self, values: AnyValueCodec) -> Self {
        self.values = values;
        self
    }

    pub fn with_validators(mut self, validators: ImplicitInputValidators) -> Self {
        self.validators = validators;
        self
    }

    /// Keep up to `capacity` decoded entries in memory. Zero disables.
    ///
    /// Only enable this when the executor is the sole writer to its store.
    pub fn with_hot_entries(mut self, capacity: usize) -> Self {
        self.hot = NonZeroUsize::new(capacity).map(|cap| Mutex::new(LruCache::new(cap)));
        self
    }

    /// Produce the result of `rules` applied to the details built from `key`.
    ///
    /// Cache failures (store unavailable, corrupt entries, missing validators)
    /// are returned as [`ExecutionError::Cache`]; a failing rule's error is
    /// returned unchanged as [`ExecutionError::Rule`] and nothing is written.
    pub fn execute<K, D, E>(
        &self,
        key: &K,
        rules: &RuleChain<D, E>,
        details_from_key: impl FnOnce(&K) -> D,
        result_from_details: impl FnOnce(D) -> R,
        policy: &dyn ValidityPolicy,
    ) -> Result<R, ExecutionError<E>>
    where
        K: ToValueSnapshot + ?Sized,
    {
        if !rules.is_cacheable() {
            let mut details = details_from_key(key);
            rules
                .run(&mut details, &mut ImplicitInputRecorder::new())
                .map_err(ExecutionError::Rule)?;
            return Ok(result_from_details(details));
        }

        let entry_key = cache_key(key, rules);
        if let Some(entry) = self.lookup(&entry_key)? {
            if self.is_reusable(&entry_key, &entry, policy)? {
                tracing::debug!(target = "nova.rule_cache", key = %entry_key, "rule cache hit");
                return Ok(entry.result.clone());
            }
            tracing::debug!(
                target = "nova.rule_cache",
                key = %entry_key,
                "rule cache entry is stale"
            );
            if let Some(hot) = &self.hot {
                lock_unpoison(hot).pop(&entry_key);
            }
        } else {
            tracing::debug!(target = "nova.rule_cache", key = %entry_key, "rule cache miss");
        }

        let mut details = details_from_key(key);
        let mut recorder = ImplicitInputRecorder::new();
        rules
            .run(&mut details, &mut recorder)
            .map_err(ExecutionError::Rule)?;
        let result = result_from_details(details);

        let entry = CachedEntry {
            timestamp: now_millis(),
            implicits: recorder.into_implicits(),
            result,
        };
        let bytes = encode_entry(&entry, &self.values, self.results.as_ref())?;
        self.store.put(&entry_key, &bytes)?;
        tracing::debug!(
            target = "nova.rule_cache",
            key = %entry_key,
            bytes = bytes.len(),
            implicit_services = entry.implicits.len(),
            "stored rule result"
        );

        let result = entry.result.clone();
        if let Some(hot) = &self.hot {
            lock_unpoison(hot).put(entry_key, Arc::new(entry));
        }
        Ok(result)
    }

    fn lookup(&self, key: &ContentHash) -> Result<Option<Arc<CachedEntry<R>>>, CacheError> {
        if let Some(hot) = &self.hot {
            if let Some(entry) = lock_unpoison(hot).get(key) {
                return Ok(Some(Arc::clone(entry)));
            }
        }

        let Some(bytes) = self.store.get(key)? else {
            return Ok(None);
        };
        let entry = Arc::new(decode_entry(&bytes, &self.values, self.results.as_ref())?);
        if let Some(hot) = &self.hot {
            lock_unpoison(hot).put(*key, Arc::clone(&entry));
        }
        Ok(Some(entry))
    }

    fn is_reusable(
        &self,
        key: &ContentHash,
        entry: &CachedEntry<R>,
        policy: &dyn ValidityPolicy,
    ) -> Result<bool, CacheError> {
        if !policy.is_valid(&EntryInfo::new(key, entry.timestamp, now_millis())) {
            tracing::debug!(
                target = "nova.rule_cache",
                key = %key,
                "validity policy rejected entry"
            );
            return Ok(false);
        }

        for (service, inputs) in &entry.implicits {
            let validator = self.validators.get(service).ok_or_else(|| {
                CacheError::MissingImplicitInputProvider {
                    service: service.clone(),
                }
            })?;
            for implicit in inputs {
                let up_to_date = validator.is_up_to_date(&implicit.input, &implicit.output);
                tracing::trace!(
                    target = "nova.rule_cache",
                    key = %key,
                    service = %service,
                    input = ?implicit.input,
                    up_to_date,
                    "revalidated implicit input"
                );
                if !up_to_date {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }
}

fn lock_unpoison<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
