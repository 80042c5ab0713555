// =============================================================================
// Adapter registry — (user, venue) → live adapter instance
// =============================================================================
//
// The registry is the only place that maps venue names onto adapter
// constructors; everywhere else in the gateway branches on capabilities.
// Instances are cached in a bounded LRU keyed by (user, venue) and stamped
// with the credential record's `updated_at` — an edited credential is picked
// up on the next resolve because the fingerprint no longer matches.
// =============================================================================

use std::num::NonZeroUsize;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{GatewayError, GatewayResult};
use crate::store::{CredentialRecord, Store};
use crate::types::Environment;

use super::alpaca::AlpacaAdapter;
use super::aster::AsterAdapter;
use super::backpack::BackpackAdapter;
use super::kalshi::KalshiAdapter;
use super::oanda::OandaAdapter;
use super::schwab::SchwabAdapter;
use super::VenueAdapter;

/// Bounded cache size; evictions simply force a rebuild on next use.
const CACHE_CAPACITY: usize = 256;

/// What the executor and worker actually depend on: something that turns
/// `(user, venue)` into a live adapter. The registry is the production
/// implementation; tests substitute scripted venues.
#[async_trait::async_trait]
pub trait AdapterSource: Send + Sync {
    async fn adapter_for(
        &self,
        user_id: &str,
        venue: &str,
    ) -> GatewayResult<Arc<dyn VenueAdapter>>;
}

#[async_trait::async_trait]
impl AdapterSource for AdapterRegistry {
    async fn adapter_for(
        &self,
        user_id: &str,
        venue: &str,
    ) -> GatewayResult<Arc<dyn VenueAdapter>> {
        self.resolve(user_id, venue).await
    }
}

struct CachedAdapter {
    adapter: Arc<dyn VenueAdapter>,
    /// Credential fingerprint; a mismatch invalidates the entry.
    fingerprint: DateTime<Utc>,
}

/// Resolves and caches venue adapters per user.
pub struct AdapterRegistry {
    store: Arc<dyn Store>,
    cache: Mutex<LruCache<(String, String), CachedAdapter>>,
}

impl AdapterRegistry {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(CACHE_CAPACITY).expect("capacity is non-zero"),
            )),
        }
    }

    /// Resolve the adapter for `(user, venue)`, building it from the stored
    /// credential record on a cache miss or credential change.
    pub async fn resolve(
        &self,
        user_id: &str,
        venue: &str,
    ) -> GatewayResult<Arc<dyn VenueAdapter>> {
        let record = self
            .store
            .get_credentials(user_id, venue)
            .await?
            .ok_or_else(|| GatewayError::NoCredentials {
                venue: venue.to_string(),
            })?;

        let key = (user_id.to_string(), venue.to_string());
        {
            let mut cache = self.cache.lock();
            if let Some(cached) = cache.get(&key) {
                if cached.fingerprint == record.updated_at {
                    return Ok(cached.adapter.clone());
                }
                debug!(user_id, venue, "credential record changed — rebuilding adapter");
            }
        }

        let adapter = build_adapter(&record)?;
        self.cache.lock().put(
            key,
            CachedAdapter {
                adapter: adapter.clone(),
                fingerprint: record.updated_at,
            },
        );
        debug!(user_id, venue, "adapter instantiated");
        Ok(adapter)
    }

    /// Drop a cached instance (e.g. after a credential delete).
    pub fn invalidate(&self, user_id: &str, venue: &str) {
        self.cache
            .lock()
            .pop(&(user_id.to_string(), venue.to_string()));
    }

    /// Currently cached instances, for the health probe.
    pub fn cached(&self) -> Vec<((String, String), Arc<dyn VenueAdapter>)> {
        self.cache
            .lock()
            .iter()
            .map(|(key, cached)| (key.clone(), cached.adapter.clone()))
            .collect()
    }
}

/// Map a credential record onto its venue's constructor.
fn build_adapter(record: &CredentialRecord) -> GatewayResult<Arc<dyn VenueAdapter>> {
    let paper = record.environment == Environment::Paper;
    let field = |name: &str, value: &Option<String>| -> GatewayResult<String> {
        value.clone().ok_or_else(|| {
            GatewayError::input(
                name,
                format!("missing from '{}' credential record", record.venue),
            )
        })
    };

    let adapter: Arc<dyn VenueAdapter> = match record.venue.as_str() {
        "aster" => Arc::new(AsterAdapter::new(
            field("api_key", &record.api_key)?,
            field("api_secret", &record.api_secret)?,
            paper,
        )),
        "oanda" => Arc::new(OandaAdapter::new(
            field("api_key", &record.api_key)?,
            record.account_id.clone(),
            paper,
        )),
        "alpaca" => Arc::new(AlpacaAdapter::new(
            field("api_key", &record.api_key)?,
            field("api_secret", &record.api_secret)?,
            paper,
        )),
        "kalshi" => Arc::new(KalshiAdapter::new(
            field("email", &record.email)?,
            field("password", &record.password)?,
            paper,
        )),
        "schwab" => Arc::new(SchwabAdapter::new(
            field("refresh_token", &record.refresh_token)?,
            field("client_id", &record.client_id)?,
            field("client_secret", &record.client_secret)?,
        )),
        "backpack" => Arc::new(BackpackAdapter::new(&field(
            "private_key",
            &record.private_key,
        )?)?),
        other => {
            return Err(GatewayError::input(
                "exchange",
                format!("unknown venue '{other}'"),
            ))
        }
    };
    Ok(adapter)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn credentials(venue: &str, updated_at: DateTime<Utc>) -> CredentialRecord {
        CredentialRecord {
            user_id: "u1".to_string(),
            venue: venue.to_string(),
            environment: Environment::Paper,
            api_key: Some("key".to_string()),
            api_secret: Some("secret".to_string()),
            passphrase: None,
            refresh_token: Some("rt".to_string()),
            client_id: Some("cid".to_string()),
            client_secret: Some("cs".to_string()),
            email: Some("a@b.c".to_string()),
            password: Some("pw".to_string()),
            private_key: None,
            account_id: None,
            updated_at,
        }
    }

    #[tokio::test]
    async fn resolves_and_caches_by_fingerprint() {
        let store = Arc::new(MemoryStore::new());
        let stamp = Utc::now();
        store.seed_credentials(credentials("aster", stamp));
        let registry = AdapterRegistry::new(store.clone());

        let first = registry.resolve("u1", "aster").await.unwrap();
        let second = registry.resolve("u1", "aster").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second), "expected the cached instance");
        assert_eq!(first.name(), "aster");
    }

    #[tokio::test]
    async fn invalidation_forces_a_rebuild() {
        let store = Arc::new(MemoryStore::new());
        store.seed_credentials(credentials("aster", Utc::now()));
        let registry = AdapterRegistry::new(store.clone());
        let first = registry.resolve("u1", "aster").await.unwrap();

        registry.invalidate("u1", "aster");
        let second = registry.resolve("u1", "aster").await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn missing_credentials_surface_no_credentials() {
        let registry = AdapterRegistry::new(Arc::new(MemoryStore::new()));
        let err = registry.resolve("u1", "oanda").await.unwrap_err();
        assert!(matches!(err, GatewayError::NoCredentials { .. }));
    }

    #[tokio::test]
    async fn unknown_venue_rejected() {
        let store = Arc::new(MemoryStore::new());
        store.seed_credentials(credentials("mt5", Utc::now()));
        let registry = AdapterRegistry::new(store);
        let err = registry.resolve("u1", "mt5").await.unwrap_err();
        assert!(err.to_string().contains("unknown venue"));
    }

    #[tokio::test]
    async fn incomplete_record_names_the_missing_field() {
        let store = Arc::new(MemoryStore::new());
        let mut record = credentials("backpack", Utc::now());
        record.private_key = None;
        store.seed_credentials(record);
        let registry = AdapterRegistry::new(store);
        let err = registry.resolve("u1", "backpack").await.unwrap_err();
        assert!(err.to_string().contains("private_key"));
    }

    #[tokio::test]
    async fn every_known_venue_constructs() {
        let store = Arc::new(MemoryStore::new());
        let stamp = Utc::now();
        for venue in ["aster", "oanda", "alpaca", "kalshi", "schwab"] {
            store.seed_credentials(credentials(venue, stamp));
        }
        let registry = AdapterRegistry::new(store);
        for venue in ["aster", "oanda", "alpaca", "kalshi", "schwab"] {
            let adapter = registry.resolve("u1", venue).await.unwrap();
            assert_eq!(adapter.name(), venue);
        }
        assert_eq!(registry.cached().len(), 5);
    }
}
