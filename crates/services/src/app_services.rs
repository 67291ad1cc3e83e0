use std::sync::Arc;

use storage::http::HttpBackend;
use storage::repository::Storage;

use crate::Clock;
use crate::config::SyncConfig;
use crate::controller::SessionController;
use crate::error::AppServicesError;
use crate::saver::SessionObserver;

/// Assembles the session controller over configured storage.
#[derive(Clone)]
pub struct AppServices {
    config: SyncConfig,
    controller: Arc<SessionController>,
}

impl AppServices {
    /// Build services against the HTTP backend and the `SQLite` local store.
    ///
    /// # Errors
    ///
    /// Returns `AppServicesError` if the API URL is rejected or the local
    /// store cannot be opened.
    pub async fn connect(
        config: SyncConfig,
        clock: Clock,
        observer: Option<Arc<dyn SessionObserver>>,
    ) -> Result<Self, AppServicesError> {
        let http = HttpBackend::new(config.api_url.as_str())?;
        let storage = Storage::remote(http, &config.db_url).await?;
        Ok(Self::from_storage(storage, config, clock, observer))
    }

    /// Build services over already constructed storage.
    #[must_use]
    pub fn from_storage(
        storage: Storage,
        config: SyncConfig,
        clock: Clock,
        observer: Option<Arc<dyn SessionObserver>>,
    ) -> Self {
        let mut controller = SessionController::new(storage, clock, config.tracker);
        if let Some(observer) = observer {
            controller = controller.with_observer(observer);
        }
        Self {
            config,
            controller: Arc::new(controller),
        }
    }

    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    #[must_use]
    pub fn controller(&self) -> Arc<SessionController> {
        Arc::clone(&self.controller)
    }
}
