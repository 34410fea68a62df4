//! Session broker and relay engine.
//!
//! Agents register, controllers pair sessions with them, and the broker
//! relays commands, results and file chunks between the two sides without
//! looking inside the payloads.

pub mod auth;
pub mod broker;
pub mod dispatch;
pub mod error;
pub mod liveness;
pub mod presence;
pub mod registry;
pub mod relay;
pub mod sessions;
pub mod status;
pub mod transport;

pub use auth::{AllowAll, TokenVerifier, Verifier};
pub use broker::{Broker, BROKER_VERSION};
pub use error::{BrokerError, Result};
pub use liveness::{LivenessMonitor, SweepReport};
pub use presence::{PresenceEvent, PresenceHub};
pub use relay::{ResultOutcome, MAX_STORED_COMMAND_BYTES, MAX_STORED_RESULT_BYTES};
pub use sessions::{SessionCounts, SessionRecord, SessionSummary};
pub use status::StatusSnapshot;
pub use transport::TransportId;
