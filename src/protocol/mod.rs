//! Wire protocol for the device and dashboard websockets.

mod messages;

pub use messages::{
    CommandOutcome, DashboardEvent, DashboardMessage, DeviceCommand, DeviceInfo, DeviceMessage,
    DeviceResponse, OutboundFrame, ServerMessage,
};
