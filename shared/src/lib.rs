//! PimmsLink Shared Library
//!
//! Core of the ride photo/video rig's link to a PiMMS media server:
//! - PiMMS wire protocol (trigger, train start, log on frames)
//! - Source-bound TCP transport with local port rotation
//! - Protocol client (per-message and persistent trigger connections)
//! - Hot-folder staging for the PiMMS ingester
//! - Configuration and logging utilities

pub mod client;
pub mod config;
pub mod error;
pub mod hot_folder;
pub mod logging;
pub mod protocol;
pub mod transport;

pub use client::{ProtocolClient, TriggerLink};
pub use config::{Config, ServerEndpoint};
pub use error::{Error, Result};
pub use hot_folder::{HotFolderSync, ResetPolicy, SlotReport};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default PiMMS server port (SYSTEM_PARAMETERS/iTcpIpPort)
pub const DEFAULT_SERVER_PORT: u16 = 57343;

/// First local source port of the default rotation
pub const DEFAULT_LOCAL_PORT_START: u16 = 12345;

/// Last local source port of the default rotation
pub const DEFAULT_LOCAL_PORT_END: u16 = 12444;
