//! Test support for shoal controllers.
//!
//! - [`fixtures`]: campaign builders, repository lists and a [`Harness`]
//!   that wires both controllers to an in-memory store.
//! - [`substrate`]: [`SubstrateSimulator`] plays the execution substrate by
//!   writing execution status.
//! - [`faulty`]: [`FaultyStore`] injects create failures, version conflicts
//!   and outages into any store.
//! - [`recording`]: [`RecordingPublisher`] captures lifecycle events.

pub mod faulty;
pub mod fixtures;
pub mod recording;
pub mod substrate;

pub use faulty::FaultyStore;
pub use fixtures::{CampaignBuilder, Harness, NAMESPACE, repositories};
pub use recording::RecordingPublisher;
pub use substrate::SubstrateSimulator;
