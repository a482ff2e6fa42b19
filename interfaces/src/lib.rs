//! PHY Boundary Interfaces Library
//!
//! Wire messages exchanged with the physical layer and the ZeroMQ sockets
//! that carry them: slot results out, buffer status and HARQ feedback in.

pub mod message_types;
pub mod slot_publisher;

use thiserror::Error;

/// Interface errors
#[derive(Error, Debug)]
pub enum InterfaceError {
    #[error("ZMQ error: {0}")]
    ZmqError(#[from] zmq::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("Interface not initialized")]
    NotInitialized,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}
