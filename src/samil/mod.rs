//! Client for the binary protocol spoken by Samil Power (SolarLake TL-PM)
//! inverters on the local network.
//!
//! An [`InverterListener`] advertises itself by UDP broadcast and accepts the
//! TCP connection an inverter makes in response. The resulting [`Inverter`]
//! session serializes requests and keeps the connection alive while idle.

pub mod frame;
pub mod inverter;
pub mod listener;
pub mod reading;

pub use crate::error::Error;
pub use frame::{Frame, FrameCodec, MessageId, Request};
pub use inverter::{Inverter, ModelInfo, SessionOptions, Transport, KEEP_ALIVE};
pub use listener::{InverterListener, ListenerHandle, State, ADVERTISEMENT_PORT, LISTEN_PORT};
pub use reading::{interpret, OperatingMode, Reading};
