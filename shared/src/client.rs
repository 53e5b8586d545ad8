//! PiMMS protocol client
//!
//! Two connection lifecycles coexist:
//!
//! - [`ProtocolClient`]: one connection per operation (connect, send, close).
//!   Used for ride starts and controller log ons.
//! - [`TriggerLink`]: one long-lived trigger connection opened and closed by
//!   the caller, carrying periodic poll responses between events.

use tokio::io::AsyncWrite;
use tracing::{error, info};

use crate::config::NetworkConfig;
use crate::error::{Error, Result};
use crate::protocol::{encode_log_on, encode_train_start, encode_trigger, LogOn, TriggerOpcode};
use crate::transport::{Connection, ConnectionManager};

/// Controller id reported with every ride start
const RIDE_CONTROLLER_INDEX: u32 = 0;

/// Zero-based PiMMS train id for a 1-based train number
fn train_index(train_number: u32) -> Result<u32> {
    train_number
        .checked_sub(1)
        .ok_or_else(|| Error::Other("train numbers start at 1".to_string()))
}

/// Send "train started" for zero-based `train`, then the trigger event, back
/// to back on one connection
async fn send_ride_start<S>(conn: &mut Connection<S>, train: u32) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    conn.send(&encode_train_start(train, RIDE_CONTROLLER_INDEX))
        .await?;
    conn.send(&encode_trigger(TriggerOpcode::Event.into())).await
}

/// Ride start on an acquired connection; the connection is released on
/// every path
async fn ride_start_on<S>(conn: &mut Connection<S>, train_number: u32, train: u32) -> bool
where
    S: AsyncWrite + Unpin,
{
    let result = send_ride_start(conn, train).await;
    conn.release().await;

    match result {
        Ok(()) => true,
        Err(e) => {
            error!("Train {} ride start failed: {}", train_number, e);
            false
        }
    }
}

/// Per-operation PiMMS client
#[derive(Debug)]
pub struct ProtocolClient {
    manager: ConnectionManager,
    log_on: LogOn,
}

impl ProtocolClient {
    pub fn new(manager: ConnectionManager, log_on: LogOn) -> Self {
        Self { manager, log_on }
    }

    /// Build a client from network configuration
    pub fn from_config(network: &NetworkConfig) -> Result<Self> {
        Ok(Self::new(
            ConnectionManager::from_config(network)?,
            LogOn::with_session_id(network.session_id.clone()),
        ))
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    /// Announce that train `train_number` (1-based) has started the ride.
    ///
    /// Sent from the trigger interface. Returns true only if both the
    /// train-start and the trigger event frames were written. An invalid
    /// train number is rejected before any connection is opened.
    pub async fn start_ride(&self, train_number: u32, local_ip: &str) -> bool {
        let train = match train_index(train_number) {
            Ok(train) => train,
            Err(e) => {
                error!("Train {} ride start rejected: {}", train_number, e);
                return false;
            }
        };

        info!("Sending train {} ride start from {}", train_number, local_ip);
        let mut conn = match self.manager.acquire(local_ip).await {
            Ok(conn) => conn,
            Err(e) => {
                error!("Train {} ride start failed: {}", train_number, e);
                return false;
            }
        };

        ride_start_on(&mut conn, train_number, train).await
    }

    /// Log a controller on at the end of a ride, once its clips are ready.
    ///
    /// PiMMS works out which train logged on from `local_ip`.
    pub async fn log_on(&self, local_ip: &str) -> bool {
        info!("Logging on from {}", local_ip);
        let mut conn = match self.manager.acquire(local_ip).await {
            Ok(conn) => conn,
            Err(e) => {
                error!("Log on from {} failed: {}", local_ip, e);
                return false;
            }
        };

        let result = conn.send(&encode_log_on(&self.log_on)).await;
        conn.release().await;

        match result {
            Ok(()) => true,
            Err(e) => {
                error!("Log on from {} failed: {}", local_ip, e);
                false
            }
        }
    }
}

/// Long-lived trigger connection
#[derive(Debug)]
pub struct TriggerLink {
    conn: Connection,
}

impl TriggerLink {
    /// Open the trigger connection from `local_ip`
    pub async fn open(manager: &ConnectionManager, local_ip: &str) -> Result<Self> {
        let conn = manager.acquire(local_ip).await?;
        info!(
            "Trigger link open {} -> {}",
            conn.local_addr(),
            conn.peer_addr()
        );
        Ok(Self { conn })
    }

    pub fn is_open(&self) -> bool {
        self.conn.is_open()
    }

    /// Answer the server's trigger poll
    pub async fn send_poll_response(&mut self) -> Result<()> {
        self.conn
            .send(&encode_trigger(TriggerOpcode::PollResponse.into()))
            .await
    }

    /// Send a bare trigger event
    pub async fn send_trigger_event(&mut self) -> Result<()> {
        self.conn
            .send(&encode_trigger(TriggerOpcode::Event.into()))
            .await
    }

    /// Send "train started" followed by the trigger event
    pub async fn send_ride_start(&mut self, train_number: u32) -> Result<()> {
        let train = train_index(train_number)?;
        send_ride_start(&mut self.conn, train).await
    }

    /// Close the link
    pub async fn close(mut self) {
        self.conn.release().await;
    }
}
