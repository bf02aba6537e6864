//! Core types for the bridge.

mod config;
mod delivery;

pub use config::{ExchangeType, HandlerConfig, RecyclerConfig};
pub use delivery::{DeliveryInfo, HeaderValue, Headers, QueueStatus};
