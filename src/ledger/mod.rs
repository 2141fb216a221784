//! Connection and request ledger shared by socket handlers and session loops.

mod connection;
mod registry;

pub use connection::{DashboardSubscriber, DeviceConnection, FrameSender};
pub use registry::{
    ConnectionLedger, LedgerConfig, LedgerError, DEFAULT_COMMAND_TIMEOUT,
    DEFAULT_MAX_DASHBOARDS_PER_ACCOUNT, DEFAULT_MAX_DEVICES_PER_ACCOUNT,
};
