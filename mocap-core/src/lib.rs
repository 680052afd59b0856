//! # Mocap Core
//!
//! Platform-independent NatNet decoding and marker kinematics.
//!
//! This crate contains pure parsing, state and math with **zero I/O
//! dependencies**. Sockets, threads and files live in `mocap-tracker`.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  mocap-core (no sockets, no files, no threads)              │
//! │  ├── protocol/    (NatNet wire format parsing & requests)   │
//! │  ├── connection/  (session state machine, keep-alive)       │
//! │  └── kinematics/  (windowing, centroids, velocity, filter)  │
//! └─────────────────────────────────────────────────────────────┘
//!                              ▲
//!                 ┌────────────┴────────────┐
//!                 │  mocap-tracker          │
//!                 │  (UDP client, CSV sink) │
//!                 └─────────────────────────┘
//! ```
//!
//! ## Key Modules
//!
//! - [`protocol`] - NatNet message decoding and request formatting
//! - [`connection`] - Session state machine
//! - [`kinematics`] - Centroid position, velocity and distance queries
//!
//! ## Example: Decoding a Frame
//!
//! ```rust
//! use mocap_core::protocol::natnet::{self, FrameListeners, Message};
//!
//! let mut payload = Vec::new();
//! payload.extend_from_slice(&12i32.to_le_bytes()); // frame number
//! payload.extend_from_slice(&0i32.to_le_bytes()); // marker sets
//! payload.extend_from_slice(&0i32.to_le_bytes()); // rigid bodies
//!
//! let frame = natnet::decode_frame_of_data(&payload).unwrap();
//! assert_eq!(frame.frame_number, 12);
//!
//! let datagram = natnet::create_frame_of_data_message(&frame).unwrap();
//! match natnet::decode_message(&datagram, FrameListeners::none()) {
//!     Ok(Message::FrameOfData(summary)) => assert_eq!(summary.bytes_consumed, 12),
//!     other => panic!("unexpected {:?}", other),
//! }
//! ```

pub mod connection;
pub mod error;
pub mod kinematics;
pub mod protocol;

// Re-export commonly used types
pub use connection::{KeepAliveTimer, SessionManager, SessionState, TransitionError};
pub use error::{KinematicsError, ListenerError, ParseError};
pub use kinematics::{
    Axis, CentroidFrame, DisplacementSample, EngineConfig, FrameRing, FrameRow, FrameSource,
    InputMode, KinematicsEngine, SmoothingConfig,
};
pub use protocol::natnet::{
    FrameListeners, MarkerBatch, MarkerListener, RawMarkerSample, RigidBody, RigidBodyListener,
};
