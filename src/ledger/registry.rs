//! Connection and request ledger.
//!
//! One ledger is constructed per process and shared (behind an `Arc`) by every
//! socket handler and every session loop. It owns all live device and
//! dashboard connections and turns the fire-and-forget websocket into a
//! request/response primitive keyed by correlation id.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::connection::{DashboardSubscriber, DeviceConnection, FrameSender};
use crate::protocol::{DashboardEvent, DeviceCommand, DeviceResponse, OutboundFrame, ServerMessage};

/// Default deadline for a single device command.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Default cap on live devices per account.
pub const DEFAULT_MAX_DEVICES_PER_ACCOUNT: usize = 10;

/// Default cap on dashboard subscribers per account.
pub const DEFAULT_MAX_DASHBOARDS_PER_ACCOUNT: usize = 16;

/// Ledger errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LedgerError {
    #[error("Device not connected: {0}")]
    DeviceNotConnected(String),
    #[error("Command '{command}' to {device_id} timed out after {timeout_ms}ms")]
    CommandTimeout {
        device_id: String,
        command: &'static str,
        timeout_ms: u64,
    },
    #[error("Request id already pending: {0}")]
    DuplicateRequestId(String),
    #[error("Account {0} reached its device limit")]
    DeviceLimit(String),
    #[error("Account {0} reached its dashboard subscriber limit")]
    SubscriberLimit(String),
    #[error("Device id {0} belongs to another account")]
    DeviceIdInUse(String),
    #[error("Response channel closed")]
    ChannelClosed,
    #[error("Unexpected response to '{0}'")]
    UnexpectedResponse(&'static str),
}

/// Configuration for the ledger.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Deadline applied by [`ConnectionLedger::send_command`].
    pub command_timeout: Duration,
    pub max_devices_per_account: usize,
    pub max_dashboards_per_account: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            max_devices_per_account: DEFAULT_MAX_DEVICES_PER_ACCOUNT,
            max_dashboards_per_account: DEFAULT_MAX_DASHBOARDS_PER_ACCOUNT,
        }
    }
}

impl LedgerConfig {
    /// Set the default command timeout.
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Set the per-account device cap.
    pub fn with_max_devices(mut self, max: usize) -> Self {
        self.max_devices_per_account = max;
        self
    }

    /// Set the per-account dashboard cap.
    pub fn with_max_dashboards(mut self, max: usize) -> Self {
        self.max_dashboards_per_account = max;
        self
    }
}

struct PendingRequest {
    token: u64,
    device_id: String,
    command: &'static str,
    created_at: Instant,
    sender: oneshot::Sender<DeviceResponse>,
}

/// Removes a pending entry when the waiting future goes away early.
struct PendingCleanup<'a> {
    pending: &'a DashMap<String, PendingRequest>,
    request_id: &'a str,
    token: u64,
}

impl PendingCleanup<'_> {
    /// Remove the entry if it is still ours. True when it was.
    fn remove(&self) -> bool {
        let token = self.token;
        self.pending
            .remove_if(self.request_id, |_, p| p.token == token)
            .is_some()
    }
}

impl Drop for PendingCleanup<'_> {
    fn drop(&mut self) {
        self.remove();
    }
}

/// Registry of live connections and in-flight requests.
pub struct ConnectionLedger {
    config: LedgerConfig,
    /// Keyed by persistent device id.
    devices: DashMap<String, DeviceConnection>,
    /// Keyed by subscriber id.
    dashboards: DashMap<String, DashboardSubscriber>,
    /// Keyed by correlation id.
    pending: DashMap<String, PendingRequest>,
    /// Live devices per account. Registration holds the account's entry
    /// while it checks the cap and inserts.
    device_counts: DashMap<String, usize>,
    /// Live dashboards per account, guarded the same way.
    dashboard_counts: DashMap<String, usize>,
    next_token: AtomicU64,
}

impl Default for ConnectionLedger {
    fn default() -> Self {
        Self::new(LedgerConfig::default())
    }
}

impl ConnectionLedger {
    /// Create a new ledger.
    pub fn new(config: LedgerConfig) -> Self {
        Self {
            config,
            devices: DashMap::new(),
            dashboards: DashMap::new(),
            pending: DashMap::new(),
            device_counts: DashMap::new(),
            dashboard_counts: DashMap::new(),
            next_token: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    // ---------------------------------------------------------------------
    // Devices
    // ---------------------------------------------------------------------

    /// Register an authenticated device.
    ///
    /// A connection with the same persistent id and account replaces the
    /// previous one, which is told to close. Returns the replaced connection,
    /// if any. Registering the same ephemeral connection twice is a no-op. A
    /// persistent id held by another account is refused.
    pub fn register_device(
        &self,
        connection: DeviceConnection,
    ) -> Result<Option<DeviceConnection>, LedgerError> {
        let persistent_id = connection.persistent_id.clone();
        let ephemeral_id = connection.ephemeral_id.clone();
        let account_id = connection.account_id.clone();

        // Lock order: account counter, then device slot.
        let mut live = self.device_counts.entry(account_id.clone()).or_insert(0);
        let replaced = match self.devices.entry(persistent_id.clone()) {
            Entry::Occupied(mut slot) => {
                if slot.get().account_id != account_id {
                    warn!(
                        device_id = %persistent_id,
                        account_id = %account_id,
                        "Refusing device id owned by another account"
                    );
                    return Err(LedgerError::DeviceIdInUse(persistent_id));
                }
                Some(slot.insert(connection))
            }
            Entry::Vacant(slot) => {
                if *live >= self.config.max_devices_per_account {
                    warn!(
                        account_id = %account_id,
                        limit = self.config.max_devices_per_account,
                        "Refusing device registration over account limit"
                    );
                    return Err(LedgerError::DeviceLimit(account_id));
                }
                slot.insert(connection);
                *live += 1;
                None
            }
        };
        drop(live);

        match replaced {
            Some(old) if old.ephemeral_id != ephemeral_id => {
                info!(
                    device_id = %persistent_id,
                    old = %old.ephemeral_id,
                    new = %ephemeral_id,
                    "Device reconnected, replacing previous connection"
                );
                old.close();
                Ok(Some(old))
            }
            Some(_) => Ok(None),
            None => {
                info!(device_id = %persistent_id, connection = %ephemeral_id, "Device registered");
                Ok(None)
            }
        }
    }

    /// Remove a device connection by its ephemeral id.
    ///
    /// Unknown ids are ignored, and a connection that was already replaced by
    /// a reconnect never removes its successor.
    pub fn unregister_device(&self, ephemeral_id: &str) -> Option<DeviceConnection> {
        let persistent_id = self
            .devices
            .iter()
            .find(|d| d.ephemeral_id == ephemeral_id)
            .map(|d| d.key().clone())?;

        let removed = self
            .devices
            .remove_if(&persistent_id, |_, d| d.ephemeral_id == ephemeral_id)
            .map(|(_, d)| d);
        if let Some(device) = &removed {
            release(&self.device_counts, &device.account_id);
            info!(device_id = %persistent_id, connection = %ephemeral_id, "Device unregistered");
        }
        removed
    }

    /// Snapshot of a live device connection.
    pub fn device(&self, device_id: &str) -> Option<DeviceConnection> {
        self.devices.get(device_id).map(|d| d.clone())
    }

    pub fn is_connected(&self, device_id: &str) -> bool {
        self.devices.contains_key(device_id)
    }

    /// All live devices owned by an account.
    pub fn devices_for_account(&self, account_id: &str) -> Vec<DeviceConnection> {
        self.devices
            .iter()
            .filter(|d| d.account_id == account_id)
            .map(|d| d.clone())
            .collect()
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Last reported screen dimensions of a device.
    pub fn screen_size(&self, device_id: &str) -> Option<(u32, u32)> {
        self.devices.get(device_id).and_then(|d| d.screen_size())
    }

    /// Record liveness for a connection.
    pub fn touch(&self, device_id: &str) {
        if let Some(mut device) = self.devices.get_mut(device_id) {
            device.last_seen = Utc::now();
        }
    }

    /// Apply a heartbeat to the device metadata.
    pub fn update_device_status(
        &self,
        device_id: &str,
        battery_level: Option<u8>,
        is_charging: Option<bool>,
    ) -> bool {
        match self.devices.get_mut(device_id) {
            Some(mut device) => {
                if battery_level.is_some() {
                    device.info.battery_level = battery_level;
                }
                if is_charging.is_some() {
                    device.info.is_charging = is_charging;
                }
                device.last_seen = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Ephemeral ids of devices silent for longer than `max_silence`.
    pub fn stale_devices(&self, max_silence: Duration) -> Vec<String> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_silence).unwrap_or_else(|_| chrono::Duration::zero());
        self.devices
            .iter()
            .filter(|d| d.last_seen < cutoff)
            .map(|d| d.ephemeral_id.clone())
            .collect()
    }

    /// Send an uncorrelated message to a device.
    pub fn send_to_device(&self, device_id: &str, message: &ServerMessage) -> Result<(), LedgerError> {
        let device = self
            .devices
            .get(device_id)
            .ok_or_else(|| LedgerError::DeviceNotConnected(device_id.to_string()))?;
        device
            .tx
            .send(OutboundFrame::message(message))
            .map_err(|_| LedgerError::DeviceNotConnected(device_id.to_string()))
    }

    /// Ping every live device. Returns how many pings were queued.
    pub fn ping_devices(&self) -> usize {
        let frame = OutboundFrame::message(&ServerMessage::Ping);
        self.devices
            .iter()
            .filter(|d| d.tx.send(frame.clone()).is_ok())
            .count()
    }

    // ---------------------------------------------------------------------
    // Requests
    // ---------------------------------------------------------------------

    /// Allocate a random correlation id.
    pub fn next_request_id(&self) -> String {
        format!("req-{}", uuid::Uuid::new_v4().simple())
    }

    /// Number of requests currently awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Send a command with the default timeout and wait for its response.
    pub async fn send_command(
        &self,
        device_id: &str,
        command: DeviceCommand,
    ) -> Result<DeviceResponse, LedgerError> {
        self.send_command_with_timeout(device_id, command, self.config.command_timeout)
            .await
    }

    /// Send a command with an explicit timeout.
    pub async fn send_command_with_timeout(
        &self,
        device_id: &str,
        command: DeviceCommand,
        timeout: Duration,
    ) -> Result<DeviceResponse, LedgerError> {
        let request_id = self.next_request_id();
        self.send_command_with_id(device_id, request_id, command, timeout)
            .await
    }

    /// Send a command under a caller-chosen correlation id.
    ///
    /// The returned future settles exactly once: with the response delivered
    /// through [`resolve_request`](Self::resolve_request), or with
    /// [`LedgerError::CommandTimeout`]. The pending entry is gone in both cases.
    pub async fn send_command_with_id(
        &self,
        device_id: &str,
        request_id: String,
        command: DeviceCommand,
        timeout: Duration,
    ) -> Result<DeviceResponse, LedgerError> {
        let tx = self
            .devices
            .get(device_id)
            .map(|d| d.tx.clone())
            .ok_or_else(|| LedgerError::DeviceNotConnected(device_id.to_string()))?;

        let name = command.name();
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let (sender, mut receiver) = oneshot::channel();
        match self.pending.entry(request_id.clone()) {
            Entry::Occupied(_) => return Err(LedgerError::DuplicateRequestId(request_id)),
            Entry::Vacant(slot) => {
                slot.insert(PendingRequest {
                    token,
                    device_id: device_id.to_string(),
                    command: name,
                    created_at: Instant::now(),
                    sender,
                });
            }
        }
        let cleanup = PendingCleanup {
            pending: &self.pending,
            request_id: &request_id,
            token,
        };

        if tx.send(OutboundFrame::Json(command.to_frame(&request_id))).is_err() {
            return Err(LedgerError::DeviceNotConnected(device_id.to_string()));
        }
        debug!(device_id, request_id = %request_id, command = name, "Command sent");

        match tokio::time::timeout(timeout, &mut receiver).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(LedgerError::ChannelClosed),
            Err(_) => {
                if cleanup.remove() {
                    warn!(
                        device_id,
                        request_id = %request_id,
                        command = name,
                        timeout_ms = timeout.as_millis() as u64,
                        "Command timed out"
                    );
                    Err(LedgerError::CommandTimeout {
                        device_id: device_id.to_string(),
                        command: name,
                        timeout_ms: timeout.as_millis() as u64,
                    })
                } else {
                    // The response claimed the entry just as the deadline fired.
                    receiver.await.map_err(|_| LedgerError::ChannelClosed)
                }
            }
        }
    }

    /// Deliver a response from `responder` to whoever is waiting on `request_id`.
    ///
    /// Only the device the command was sent to can settle it. Returns false
    /// for unknown, already settled or timed-out ids, and for responses from
    /// any other device (the pending entry is left alone).
    pub fn resolve_request(
        &self,
        responder: &str,
        request_id: &str,
        response: DeviceResponse,
    ) -> bool {
        match self
            .pending
            .remove_if(request_id, |_, p| p.device_id == responder)
        {
            Some((_, pending)) => {
                debug!(
                    request_id,
                    device_id = %pending.device_id,
                    command = pending.command,
                    elapsed_ms = pending.created_at.elapsed().as_millis() as u64,
                    "Request resolved"
                );
                let _ = pending.sender.send(response);
                true
            }
            None => {
                if self.pending.contains_key(request_id) {
                    warn!(
                        request_id,
                        responder,
                        "Discarding response from a device the request was not sent to"
                    );
                } else {
                    debug!(request_id, "Discarding response with no pending request");
                }
                false
            }
        }
    }

    // ---------------------------------------------------------------------
    // Dashboards
    // ---------------------------------------------------------------------

    /// Subscribe a dashboard socket to an account's events.
    pub fn register_dashboard(
        &self,
        account_id: &str,
        tx: FrameSender,
    ) -> Result<String, LedgerError> {
        let mut live = self.dashboard_counts.entry(account_id.to_string()).or_insert(0);
        if *live >= self.config.max_dashboards_per_account {
            warn!(account_id, limit = self.config.max_dashboards_per_account, "Dashboard limit reached");
            return Err(LedgerError::SubscriberLimit(account_id.to_string()));
        }

        let subscriber = DashboardSubscriber::new(account_id, tx);
        let id = subscriber.id.clone();
        self.dashboards.insert(id.clone(), subscriber);
        *live += 1;
        drop(live);
        debug!(account_id, subscriber = %id, "Dashboard subscribed");
        Ok(id)
    }

    /// Remove a dashboard subscriber. Unknown ids are ignored.
    pub fn unregister_dashboard(&self, subscriber_id: &str) -> bool {
        match self.dashboards.remove(subscriber_id) {
            Some((_, subscriber)) => {
                release(&self.dashboard_counts, &subscriber.account_id);
                true
            }
            None => false,
        }
    }

    pub fn dashboard_count(&self, account_id: &str) -> usize {
        self.dashboard_counts.get(account_id).map_or(0, |n| *n)
    }

    /// Best-effort fan-out to every dashboard of an account.
    ///
    /// Returns the number of subscribers the event was queued for. Subscribers
    /// whose socket is gone are dropped after the fan-out.
    pub fn broadcast_to_account(&self, account_id: &str, event: &DashboardEvent) -> usize {
        let frame = OutboundFrame::message(event);
        let mut delivered = 0;
        let mut dead = Vec::new();

        for subscriber in self.dashboards.iter().filter(|s| s.account_id == account_id) {
            if subscriber.tx.send(frame.clone()).is_ok() {
                delivered += 1;
            } else {
                debug!(subscriber = %subscriber.id, "Dashboard send failed");
                dead.push(subscriber.id.clone());
            }
        }

        for id in dead {
            self.unregister_dashboard(&id);
        }
        delivered
    }
}

/// Decrement an account counter, dropping it at zero.
fn release(counts: &DashMap<String, usize>, account_id: &str) {
    if let Some(mut live) = counts.get_mut(account_id) {
        *live = live.saturating_sub(1);
    }
    counts.remove_if(account_id, |_, live| *live == 0);
}
