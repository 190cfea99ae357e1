//! Async runtime of the support-desk sync layer.
//!
//! [`TransportClient`] keeps one push channel alive over any [`Connector`]
//! ([`WsConnector`] in production, [`memory::MemoryConnector`] in tests).
//! [`DashboardSync`] and [`TranscriptSync`] each own one client plus a
//! [`SupportApi`] and run a single task that merges push events, re-fetches
//! and timers into a `watch` snapshot.

mod api;
mod client;
mod dashboard;
pub mod memory;
#[cfg(test)]
mod testing;
mod transcript;
mod ws;

pub use api::{HttpSupportApi, SupportApi};
pub use client::{Connector, FrameConnection, TransportClient, TransportConfig, WireFrame};
pub use dashboard::{DashboardConfig, DashboardSnapshot, DashboardSync};
pub use transcript::{TranscriptConfig, TranscriptSnapshot, TranscriptSync};
pub use ws::{WsConnection, WsConnector};
