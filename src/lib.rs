//! mqtt-exchange - MQTT 3.1/3.1.1/5.0 broker core
//!
//! The stateful heart of an MQTT broker, without the network layer:
//! - `codec`: binary wire codec for every packet kind and v5 properties
//! - `topic`: topic name/filter validation and wildcard matching
//! - `inflight`: QoS 1/2 acknowledgement tracking with timed re-sends
//! - `session`: negotiated v5 limits and the session handle abstraction
//! - `exchange`: subscriptions, retained messages, persistent sessions
//!
//! A connection layer decodes bytes with [`codec::Decoder`], feeds
//! SUBSCRIBE/PUBLISH into an [`Exchange`], and writes what arrives on its
//! session handle back out through [`codec::Encoder`].

pub mod codec;
pub mod config;
pub mod exchange;
pub mod inflight;
pub mod protocol;
pub mod session;
pub mod topic;

pub use config::Config;
pub use exchange::Exchange;
pub use inflight::InflightManager;
pub use protocol::{Packet, ProtocolVersion, Publish, QoS};
pub use session::{ChannelSession, SessionCapabilities, SessionHandle, SessionId};
