//! Provider factory: turns the `[providers.*]` config sections into adapters.

use std::sync::Arc;

use billsync_core::AdapterRegistry;
use billsync_provider_caldav::CalDavAdapter;
use billsync_provider_google::GoogleAdapter;
use billsync_provider_outlook::OutlookAdapter;

use crate::config::CliConfig;

/// Providers this build knows how to talk to.
pub const SUPPORTED: [&str; 3] = [
    billsync_provider_google::PROVIDER_NAME,
    billsync_provider_outlook::PROVIDER_NAME,
    billsync_provider_caldav::PROVIDER_NAME,
];

/// Register an adapter for every configured provider.
///
/// CalDAV needs no client registration, so it is always available; the
/// calendar URL can come from the stored credential instead.
pub fn build_registry(config: &CliConfig) -> AdapterRegistry {
    let mut registry = AdapterRegistry::new();

    if let Some(google) = &config.providers.google {
        registry.register(Arc::new(GoogleAdapter::new(
            &google.client_id,
            &google.client_secret,
        )));
    }

    if let Some(outlook) = &config.providers.outlook {
        let mut adapter = OutlookAdapter::new(&outlook.client_id);
        if let Some(secret) = &outlook.client_secret {
            adapter = adapter.with_client_secret(secret);
        }
        registry.register(Arc::new(adapter));
    }

    let mut caldav = CalDavAdapter::new();
    if let Some(url) = config
        .providers
        .caldav
        .as_ref()
        .and_then(|c| c.calendar_url.as_deref())
    {
        caldav = caldav.with_calendar_url(url);
    }
    registry.register(Arc::new(caldav));

    registry
}
