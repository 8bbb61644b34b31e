//! Installs a signal handler which stops the scheduler of a cache on CTRL+C or SIGHUP.
//!
//! Forks an async task which waits for either **CTRL+C** or **SIGHUP** and then invokes
//! [IntervalCache::stop](crate::cache::IntervalCache::stop) on the given cache. The task only
//! holds a weak reference, therefore it doesn't keep the cache alive.
use std::sync::Arc;

#[cfg(unix)]
use tokio::signal::unix::SignalKind;

use crate::cache::IntervalCache;

/// Installs a signal handler for the given cache which awaits either a **CTRL+C** or **SIGHUP**.
///
/// Note that this is automatically called by the [Builder](crate::builder::Builder) if signals
/// are enabled.
pub fn install<V: Clone + Send + Sync + 'static>(cache: &Arc<IntervalCache<V>>) {
    let cache = Arc::downgrade(cache);

    crate::spawn!(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        let hang_up = async {
            match tokio::signal::unix::signal(SignalKind::hangup()) {
                Ok(mut sig_hup) => {
                    let _ = sig_hup.recv().await;
                }
                Err(error) => {
                    log::warn!("Cannot listen for SIGHUP: {}", error);
                    std::future::pending::<()>().await
                }
            }
        };
        #[cfg(not(unix))]
        let hang_up = std::future::pending::<()>();

        tokio::select! {
            result = ctrl_c => {
                if let Err(error) = result {
                    log::warn!("Cannot listen for CTRL-C: {}", error);
                    return;
                }
                log::info!("Received CTRL-C. Stopping the cache scheduler...");
            },
            _ = hang_up => {
                log::info!("Received SIGHUP. Stopping the cache scheduler...");
            }
        }

        if let Some(cache) = cache.upgrade() {
            cache.stop();
        }
    });
}
