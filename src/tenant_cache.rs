use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, error, info};
use tokio::sync::{OnceCell, RwLock};

use crate::error::DashReportError;
use crate::render::{RenderBackend, RendererFactory};
use crate::settings::Settings;
use crate::store::Store;

/// Where the cache loads settings from on a miss
pub trait SettingsSource: Send + Sync {
    fn load_settings(&self, org_id: i64) -> Result<Option<Settings>, DashReportError>;
}

impl SettingsSource for Store {
    fn load_settings(&self, org_id: i64) -> Result<Option<Settings>, DashReportError> {
        self.get_settings(org_id)
    }
}

/// Settings of one tenant, filled by the first caller that misses
type SettingsSlot = Arc<OnceCell<Arc<Settings>>>;

#[derive(Default)]
struct CacheState {
    settings: HashMap<i64, SettingsSlot>,
    renderers: HashMap<i64, Arc<dyn RenderBackend>>,
}

/// Per-tenant settings and warm renderer instances.
///
/// Both maps sit behind one lock so that `invalidate` clears them together.
/// Store reads happen outside that lock, in the tenant's own slot, so a slow
/// load only holds up callers of the same tenant. Entries live until
/// invalidated; the store stays the source of truth.
pub struct TenantCache {
    source: Arc<dyn SettingsSource>,
    factory: Arc<dyn RendererFactory>,
    state: RwLock<CacheState>,
}

impl TenantCache {
    pub fn new(source: Arc<dyn SettingsSource>, factory: Arc<dyn RendererFactory>) -> Self {
        TenantCache {
            source,
            factory,
            state: RwLock::new(CacheState::default()),
        }
    }

    fn load(&self, org_id: i64) -> Result<Arc<Settings>, DashReportError> {
        match self.source.load_settings(org_id)? {
            Some(settings) => {
                debug!("Loaded settings for org {} into cache", org_id);
                Ok(Arc::new(settings))
            }
            None => Err(DashReportError::Configuration(format!(
                "org {} has no settings; save the renderer settings before scheduling reports",
                org_id
            ))),
        }
    }

    async fn slot(&self, org_id: i64) -> SettingsSlot {
        if let Some(slot) = self.state.read().await.settings.get(&org_id) {
            return Arc::clone(slot);
        }
        let mut state = self.state.write().await;
        Arc::clone(state.settings.entry(org_id).or_default())
    }

    /// Resolve the tenant's slot and its settings. Concurrent misses wait on
    /// a single store read.
    async fn resolve(
        &self,
        org_id: i64,
    ) -> Result<(SettingsSlot, Arc<Settings>), DashReportError> {
        let slot = self.slot(org_id).await;
        match slot.get_or_try_init(|| async { self.load(org_id) }).await {
            Ok(settings) => {
                let settings = Arc::clone(settings);
                Ok((slot, settings))
            }
            Err(e) => {
                // Leave no empty slot behind for a tenant without settings
                let mut state = self.state.write().await;
                if state
                    .settings
                    .get(&org_id)
                    .is_some_and(|current| Arc::ptr_eq(current, &slot) && !slot.initialized())
                {
                    state.settings.remove(&org_id);
                }
                Err(e)
            }
        }
    }

    pub async fn get_settings(&self, org_id: i64) -> Result<Arc<Settings>, DashReportError> {
        self.resolve(org_id).await.map(|(_, settings)| settings)
    }

    /// The tenant's renderer, built from its current settings on first use
    pub async fn renderer_for(&self, org_id: i64) -> Result<Arc<dyn RenderBackend>, DashReportError> {
        loop {
            if let Some(renderer) = self.state.read().await.renderers.get(&org_id) {
                return Ok(Arc::clone(renderer));
            }

            let (slot, settings) = self.resolve(org_id).await?;

            let mut state = self.state.write().await;
            if let Some(renderer) = state.renderers.get(&org_id) {
                return Ok(Arc::clone(renderer));
            }
            // An invalidation between the load and this lock leaves the slot
            // orphaned; never cache a renderer built from it
            let current = state
                .settings
                .get(&org_id)
                .is_some_and(|entry| Arc::ptr_eq(entry, &slot));
            if !current {
                debug!("Settings for org {} changed while loading, retrying", org_id);
                continue;
            }

            let renderer = self.factory.create(&settings)?;
            info!("Created {} renderer for org {}", renderer.name(), org_id);
            state.renderers.insert(org_id, Arc::clone(&renderer));
            return Ok(renderer);
        }
    }

    /// Drop both entries for a tenant and close its renderer
    pub async fn invalidate(&self, org_id: i64) {
        let renderer = {
            let mut state = self.state.write().await;
            state.settings.remove(&org_id);
            state.renderers.remove(&org_id)
        };

        if let Some(renderer) = renderer {
            if let Err(e) = renderer.close().await {
                error!("Failed to close renderer for org {}: {}", org_id, e);
            }
        }
        info!("Cleared cached settings and renderer for org {}", org_id);
    }

    /// Close every live renderer. Errors are logged so one bad instance
    /// does not keep the rest open.
    pub async fn close_all(&self) {
        let renderers: Vec<(i64, Arc<dyn RenderBackend>)> = {
            let mut state = self.state.write().await;
            state.settings.clear();
            state.renderers.drain().collect()
        };

        for (org_id, renderer) in renderers {
            match renderer.close().await {
                Ok(()) => debug!("Closed renderer for org {}", org_id),
                Err(e) => error!("Failed to close renderer for org {}: {}", org_id, e),
            }
        }
    }

    #[cfg(test)]
    pub async fn cached_orgs(&self) -> (usize, usize) {
        let state = self.state.read().await;
        let settings = state.settings.values().filter(|s| s.initialized()).count();
        (settings, state.renderers.len())
    }
}


#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use super::test_support::*;
    use super::*;

    fn settings(org_id: i64, base_url: &str) -> Settings {
        let mut settings = Settings::defaults(org_id);
        settings.renderer_config.base_url = base_url.to_string();
        settings
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reads_load_once() {
        let source = Arc::new(CountingSource::with(settings(1, "http://grafana:3000")));
        let cache = Arc::new(TenantCache::new(
            source.clone(),
            Arc::new(StubFactory::default()),
        ));

        let mut handles = Vec::new();
        for _ in 0..32 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move { cache.get_settings(1).await }));
        }
        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap().unwrap());
        }

        assert_eq!(source.loads.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|s| Arc::ptr_eq(s, &results[0])));
    }

    /// Holds loads of one org until released
    struct GatedSource {
        inner: CountingSource,
        gated_org: i64,
        entered: tokio::sync::mpsc::UnboundedSender<()>,
        release: std::sync::Mutex<std::sync::mpsc::Receiver<()>>,
    }

    impl SettingsSource for GatedSource {
        fn load_settings(&self, org_id: i64) -> Result<Option<Settings>, DashReportError> {
            if org_id == self.gated_org {
                let _ = self.entered.send(());
                let _ = self.release.lock().unwrap().recv();
            }
            self.inner.load_settings(org_id)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_slow_load_does_not_block_other_tenants() {
        let inner = CountingSource::with(settings(1, "http://slow:3000"));
        inner
            .settings
            .lock()
            .unwrap()
            .insert(2, settings(2, "http://fast:3000"));
        let (entered_tx, mut entered_rx) = tokio::sync::mpsc::unbounded_channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel();
        let cache = Arc::new(TenantCache::new(
            Arc::new(GatedSource {
                inner,
                gated_org: 1,
                entered: entered_tx,
                release: std::sync::Mutex::new(release_rx),
            }),
            Arc::new(StubFactory::default()),
        ));

        let slow = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.renderer_for(1).await })
        };
        entered_rx.recv().await.unwrap();

        let fast = tokio::time::timeout(Duration::from_secs(5), cache.renderer_for(2))
            .await
            .expect("org 2 waited on org 1's load")
            .unwrap();
        assert_eq!(fast.name(), "stub");

        release_tx.send(()).unwrap();
        slow.await.unwrap().unwrap();
        assert_eq!(cache.cached_orgs().await, (2, 2));
    }

    #[tokio::test]
    async fn test_missing_settings_is_configuration_error() {
        let cache = TenantCache::new(
            Arc::new(CountingSource::default()),
            Arc::new(StubFactory::default()),
        );
        assert!(matches!(
            cache.get_settings(9).await,
            Err(DashReportError::Configuration(_))
        ));
        assert!(cache.renderer_for(9).await.is_err());
        assert_eq!(cache.cached_orgs().await, (0, 0));
    }

    #[tokio::test]
    async fn test_invalidate_replaces_renderer() {
        let source = Arc::new(CountingSource::with(settings(1, "http://old:3000")));
        let factory = Arc::new(StubFactory::default());
        let cache = TenantCache::new(source.clone(), factory.clone());

        let first = cache.renderer_for(1).await.unwrap();
        let again = cache.renderer_for(1).await.unwrap();
        assert!(Arc::ptr_eq(&first, &again));

        source
            .settings
            .lock()
            .unwrap()
            .insert(1, settings(1, "http://new:3000"));
        cache.invalidate(1).await;

        let second = cache.renderer_for(1).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));

        let created = factory.created.lock().unwrap();
        assert_eq!(created.len(), 2);
        assert!(created[0].closed.load(Ordering::SeqCst));
        assert!(!created[1].closed.load(Ordering::SeqCst));
        assert_eq!(created[1].base_url, "http://new:3000");
        drop(created);

        assert_eq!(
            cache.get_settings(1).await.unwrap().renderer_config.base_url,
            "http://new:3000"
        );
    }

    #[tokio::test]
    async fn test_close_all_survives_close_errors() {
        let source = CountingSource::with(settings(1, "http://a"));
        source
            .settings
            .lock()
            .unwrap()
            .insert(2, settings(2, "http://b"));
        let factory = Arc::new(StubFactory {
            fail_close: true,
            ..StubFactory::default()
        });
        let cache = TenantCache::new(Arc::new(source), factory.clone());

        cache.renderer_for(1).await.unwrap();
        cache.renderer_for(2).await.unwrap();
        cache.close_all().await;

        assert_eq!(cache.cached_orgs().await, (0, 0));
        assert!(factory
            .created
            .lock()
            .unwrap()
            .iter()
            .all(|r| r.closed.load(Ordering::SeqCst)));
    }
}
