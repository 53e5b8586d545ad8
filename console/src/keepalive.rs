//! Persistent trigger link with periodic poll responses
//!
//! Some PiMMS deployments keep the trigger connection open and expect a poll
//! response (opcode 0x07) at a fixed interval instead of a fresh connection
//! per message.

use std::future::Future;
use std::time::Duration;

use pimms_shared::config::NetworkConfig;
use pimms_shared::transport::ConnectionManager;
use pimms_shared::TriggerLink;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

/// Open the trigger link, answer polls until `shutdown` resolves, then close.
///
/// Returns false if a poll response could not be sent. A zero `period` is an
/// error and opens nothing.
pub async fn run<F>(network: &NetworkConfig, period: Duration, shutdown: F) -> anyhow::Result<bool>
where
    F: Future,
{
    anyhow::ensure!(!period.is_zero(), "keep-alive interval must be non-zero");

    let manager = ConnectionManager::from_config(network)?;
    let mut link = TriggerLink::open(&manager, &network.trigger_address).await?;
    info!("Sending poll responses every {:?}", period);

    let ok = keep_alive(&mut link, period, shutdown).await;
    link.close().await;
    Ok(ok)
}

/// Send a poll response every `period` until `shutdown` resolves or a send
/// fails.
///
/// A tick that comes due while a send is in flight is delayed, never run
/// alongside it.
pub async fn keep_alive<F>(link: &mut TriggerLink, period: Duration, shutdown: F) -> bool
where
    F: Future,
{
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Keep-alive stopped");
                return true;
            }
            _ = ticker.tick() => {
                if let Err(e) = link.send_poll_response().await {
                    error!("Poll response failed: {}", e);
                    return false;
                }
                debug!("Poll response sent");
            }
        }
    }
}
