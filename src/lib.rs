//! # Tuyabell
//!
//! Asynchronous LAN client for Tuya video doorbells: local control and
//! event streaming over the device's native TCP protocol, without cloud
//! dependencies.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use futures_util::StreamExt;
//! use tuyabell::DeviceBuilder;
//!
//! # async fn run() {
//! let device = DeviceBuilder::new("DEVICE_ID", "DEVICE_KEY")
//!     .host("192.168.1.40")
//!     .build();
//!
//! let mut events = std::pin::pin!(device.events());
//! while let Some(event) = events.next().await {
//!     println!("{event:?}");
//! }
//! # }
//! ```
pub mod crypto;
pub mod device;
pub mod dps;
pub mod error;
pub mod protocol;
pub mod resolve;
pub mod session;

pub use device::{Device, DeviceBuilder, DeviceConfig, DeviceEvent};
pub use dps::{DatapointEvent, DpsMap, decode_media_value, extract_image_url};
pub use error::TuyaError;
pub use protocol::{CommandType, ProtocolVersion};
pub use resolve::{IpResolver, NullResolver, StaticResolver};
pub use session::{ConnectionState, SessionTuning};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn version() -> &'static str {
    VERSION
}
