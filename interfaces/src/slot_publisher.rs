//! ZeroMQ Slot Publisher
//!
//! Pushes one frame per slot to the PHY and pulls buffer-status and HARQ
//! feedback frames back. Both sockets are non-blocking so the slot loop never
//! waits on a slow or absent peer.

use crate::message_types::{decode, encode, PhyMessage, SchedulerMessage};
use crate::InterfaceError;
use common::utils::bytes_to_hex;
use layers::mac::{PhyEvent, SlotOutcome};
use tracing::{debug, info, warn};
use zmq::Context;

/// Publisher configuration
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Bind address of the PUSH socket carrying slot results
    pub publish_address: String,
    /// Bind address of the PULL socket receiving PHY messages
    pub feedback_address: Option<String>,
    /// High water mark for queued messages
    pub hwm: i32,
}

impl PublisherConfig {
    pub fn new(publish_address: impl Into<String>) -> Self {
        Self {
            publish_address: publish_address.into(),
            feedback_address: None,
            hwm: 1000,
        }
    }

    pub fn with_feedback(mut self, address: impl Into<String>) -> Self {
        self.feedback_address = Some(address.into());
        self
    }
}

/// Socket counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublisherStats {
    pub frames_sent: u64,
    /// Frames dropped because no peer was ready
    pub frames_dropped: u64,
    pub frames_received: u64,
    pub frames_invalid: u64,
}

/// ZMQ sockets towards the PHY
pub struct SlotPublisher {
    config: PublisherConfig,
    context: Context,
    push: Option<zmq::Socket>,
    pull: Option<zmq::Socket>,
    stats: PublisherStats,
}

impl SlotPublisher {
    /// Create a publisher; sockets are bound by [`SlotPublisher::initialize`]
    pub fn new(config: PublisherConfig) -> Result<Self, InterfaceError> {
        if config.publish_address.is_empty() {
            return Err(InterfaceError::InvalidConfig("empty publish address".into()));
        }
        if config.hwm < 0 {
            return Err(InterfaceError::InvalidConfig(format!("negative hwm {}", config.hwm)));
        }

        Ok(Self {
            config,
            context: Context::new(),
            push: None,
            pull: None,
            stats: PublisherStats::default(),
        })
    }

    /// Bind the sockets
    pub fn initialize(&mut self) -> Result<(), InterfaceError> {
        info!("Initializing slot publisher");

        let push = self.context.socket(zmq::PUSH)?;
        push.set_sndhwm(self.config.hwm)?;
        push.set_linger(0)?;
        push.bind(&self.config.publish_address)?;
        info!("ZMQ PUSH socket bound to {}", self.config.publish_address);

        if let Some(address) = &self.config.feedback_address {
            let pull = self.context.socket(zmq::PULL)?;
            pull.set_rcvhwm(self.config.hwm)?;
            pull.set_linger(0)?;
            pull.bind(address)?;
            info!("ZMQ PULL socket bound to {}", address);
            self.pull = Some(pull);
        }

        self.push = Some(push);
        Ok(())
    }

    /// ZMQ context, for in-process peers
    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn stats(&self) -> PublisherStats {
        self.stats
    }

    /// Send one slot's outcome; a frame no peer can take is dropped
    pub fn publish(&mut self, outcome: &SlotOutcome) -> Result<(), InterfaceError> {
        let socket = self.push.as_ref().ok_or(InterfaceError::NotInitialized)?;
        let message = SchedulerMessage::from_outcome(outcome);
        let frame = encode(&message)?;

        match socket.send(&frame, zmq::DONTWAIT) {
            Ok(()) => {
                self.stats.frames_sent += 1;
                debug!("Slot {}: sent {} bytes", message.slot(), frame.len());
                Ok(())
            }
            Err(zmq::Error::EAGAIN) => {
                self.stats.frames_dropped += 1;
                debug!("Slot {}: no PHY peer ready, frame dropped", message.slot());
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Drain every queued PHY message without blocking
    pub fn poll_events(&mut self) -> Result<Vec<PhyEvent>, InterfaceError> {
        let Some(socket) = self.pull.as_ref() else {
            return Ok(Vec::new());
        };

        let mut events = Vec::new();
        loop {
            let frame = match socket.recv_bytes(zmq::DONTWAIT) {
                Ok(frame) => frame,
                Err(zmq::Error::EAGAIN) => break,
                Err(e) => return Err(e.into()),
            };
            self.stats.frames_received += 1;
            match decode::<PhyMessage>(&frame) {
                Ok(message) => events.extend(message.into_event()),
                Err(e) => {
                    self.stats.frames_invalid += 1;
                    warn!(
                        "Discarding {} byte PHY frame [{}]: {}",
                        frame.len(),
                        bytes_to_hex(&frame[..frame.len().min(16)]),
                        e
                    );
                }
            }
        }
        Ok(events)
    }

    /// Close the sockets
    pub fn shutdown(&mut self) {
        info!("Shutting down slot publisher");
        self.push = None;
        self.pull = None;
    }
}
