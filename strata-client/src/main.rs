//! `strata-sync` entry point.
//!
//! Opens the local store, runs a full sync, then keeps the cache fresh
//! through the push channel and a periodic delta sync until interrupted.

use std::sync::Arc;

use strata_cache::{CacheManager, SyncEngine, SyncSummary};
use strata_client::config::ClientConfig;
use strata_client::error::ClientError;
use strata_client::realtime::{ChannelConfig, ChannelEvent, ChannelHandle, PushChannel};
use strata_client::telemetry::init_tracing;
use strata_client::RestClient;
use strata_storage::LmdbStore;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), ClientError> {
    let config = ClientConfig::load()?;
    init_tracing(config.json_logs)?;

    let store = Arc::new(LmdbStore::open(&config.store.path, config.store.max_size_mb)?);
    let cache = CacheManager::open(store, config.cache_config()).await?;
    let remote = Arc::new(RestClient::new(&config)?);
    let engine = SyncEngine::new(cache.clone(), remote);

    let (event_tx, mut event_rx) = mpsc::channel::<ChannelEvent>(256);
    let channel = PushChannel::new(ChannelConfig::from_client(&config), cache.clone()).spawn(event_tx);

    log_summary(&engine.sync_all().await);
    subscribe_cached(&cache, &channel).await;

    let mut ticker = tokio::time::interval(config.sync_interval());
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                log_summary(&engine.sync_all().await);
                subscribe_cached(&cache, &channel).await;
            }
            Some(event) = event_rx.recv() => handle_event(&engine, event).await,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
        }
    }

    channel.shutdown().await;
    cache.close().await?;
    Ok(())
}

/// Once the channel stops, the periodic sync carries on alone.
async fn handle_event(engine: &SyncEngine, event: ChannelEvent) {
    match event {
        ChannelEvent::Connected => {
            // Changes made while disconnected never arrived over the channel.
            log_summary(&engine.sync_all().await);
        }
        ChannelEvent::Applied {
            message_type,
            applied,
            dropped,
            refetch,
        } => {
            info!(message_type, applied, dropped, refetch, "Push message applied");
            if refetch > 0 {
                log_summary(&engine.revalidate_stale().await);
            }
        }
        ChannelEvent::TokenExpiringSoon { expires_at } => {
            warn!(?expires_at, "Push channel token expiring soon");
        }
        ChannelEvent::AuthFailed { code } => {
            warn!(code, "Push channel stopped: credentials rejected");
        }
        ChannelEvent::GaveUp { attempts } => {
            warn!(attempts, "Push channel stopped after repeated failures");
        }
        ChannelEvent::Disconnected { .. }
        | ChannelEvent::Reconnecting { .. }
        | ChannelEvent::Stopped => {}
    }
}

async fn subscribe_cached(cache: &CacheManager, channel: &ChannelHandle) {
    for entity_type in cache.entity_types() {
        let ids = cache.cached_ids(&entity_type.code);
        if !ids.is_empty() {
            channel.subscribe(&entity_type.code, ids).await;
        }
    }
}

fn log_summary(summary: &SyncSummary) {
    let records: usize = summary.reports.iter().map(|r| r.records).sum();
    if summary.is_success() {
        info!(layers = summary.reports.len(), records, "Sync complete");
    } else {
        for (layer, error) in &summary.failures {
            warn!(%layer, error = %error, "Sync failed");
        }
    }
}
