//! Peer-to-peer media session engine.
//!
//! [`Orchestrator`] is the entry point: it owns one call's
//! [`negotiator::Negotiator`], ICE agent and [`transport::TransportSession`],
//! exchanges [`SignalMessage`]s with the remote side and reports
//! [`SessionEvent`]s to the application.

pub mod error;
pub mod events;
pub mod helpers;
pub mod ice;
pub mod mux;
pub mod negotiator;
pub mod orchestrator;
pub mod signaling;
pub mod state;
pub mod transport;
pub mod traversal;
pub mod types;

pub use error::{Result, SessionError};
pub use events::{EventStream, SessionEvent};
pub use orchestrator::{Orchestrator, SessionConfig};
pub use signaling::{channel_pair, SignalChannel, SignalingClient};
pub use state::{
    ConnectionState, IceConnectionState, IceGatheringState, SignalingState, TransportPhase,
};
pub use traversal::{Resolution, TraversalResolver};
pub use types::{SessionStats, TransportStats};

pub use tandem_common::{EngineSettings, MediaMode, MediaSettings, SignalMessage};
