//! Live connection records held by the ledger.

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::protocol::{DeviceInfo, OutboundFrame};

/// Sender half feeding a connection's websocket writer task.
pub type FrameSender = mpsc::UnboundedSender<OutboundFrame>;

/// An authenticated device socket.
///
/// The ephemeral id lives for one transport lifetime; the persistent id
/// survives reconnects and is what sessions address commands to.
#[derive(Debug, Clone)]
pub struct DeviceConnection {
    pub ephemeral_id: String,
    pub persistent_id: String,
    pub account_id: String,
    pub info: DeviceInfo,
    pub connected_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub(crate) tx: FrameSender,
}

impl DeviceConnection {
    pub fn new(
        persistent_id: impl Into<String>,
        account_id: impl Into<String>,
        info: DeviceInfo,
        tx: FrameSender,
    ) -> Self {
        let now = Utc::now();
        Self {
            ephemeral_id: uuid::Uuid::new_v4().to_string(),
            persistent_id: persistent_id.into(),
            account_id: account_id.into(),
            info,
            connected_at: now,
            last_seen: now,
            tx,
        }
    }

    /// Resolve the persistent identity for a device that just authenticated.
    ///
    /// Identities are scoped to the account: `{account}:{deviceId}`. A device
    /// that reports no `deviceId` gets `{account}:{model}:{random}`, which is
    /// unique to this connection and does not survive a reconnect.
    pub fn persistent_id_for(account_id: &str, info: &DeviceInfo) -> String {
        match info.device_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => format!("{}:{}", account_id, id),
            _ => {
                let model = if info.model.trim().is_empty() {
                    "unknown"
                } else {
                    info.model.trim()
                };
                format!("{}:{}:{}", account_id, model, uuid::Uuid::new_v4().simple())
            }
        }
    }

    /// Reported screen size, if the device sent one.
    pub fn screen_size(&self) -> Option<(u32, u32)> {
        if self.info.screen_width > 0 && self.info.screen_height > 0 {
            Some((self.info.screen_width, self.info.screen_height))
        } else {
            None
        }
    }

    /// Ask the writer task to close the socket.
    pub fn close(&self) {
        let _ = self.tx.send(OutboundFrame::Close);
    }
}

/// A dashboard socket subscribed to one account's events. Write-only.
#[derive(Debug, Clone)]
pub struct DashboardSubscriber {
    pub id: String,
    pub account_id: String,
    pub connected_at: DateTime<Utc>,
    pub(crate) tx: FrameSender,
}

impl DashboardSubscriber {
    pub fn new(account_id: impl Into<String>, tx: FrameSender) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            account_id: account_id.into(),
            connected_at: Utc::now(),
            tx,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_persistent_id_is_scoped_to_account() {
        let info = DeviceInfo {
            device_id: Some(" serial-1 ".to_string()),
            model: "Pixel".to_string(),
            ..Default::default()
        };
        assert_eq!(DeviceConnection::persistent_id_for("acct", &info), "acct:serial-1");
        assert_eq!(DeviceConnection::persistent_id_for("other", &info), "other:serial-1");
    }

    #[test]
    fn test_same_model_without_device_id_never_collides() {
        let info = DeviceInfo {
            device_id: Some("  ".to_string()),
            model: "Pixel 8".to_string(),
            ..Default::default()
        };
        let first = DeviceConnection::persistent_id_for("acct", &info);
        let second = DeviceConnection::persistent_id_for("acct", &info);
        assert!(first.starts_with("acct:Pixel 8:"));
        assert_ne!(first, second);
        assert!(DeviceConnection::persistent_id_for("acct", &DeviceInfo::default())
            .starts_with("acct:unknown:"));
    }

    #[test]
    fn test_ephemeral_ids_are_unique() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let a = DeviceConnection::new("p", "acct", DeviceInfo::default(), tx.clone());
        let b = DeviceConnection::new("p", "acct", DeviceInfo::default(), tx);
        assert_ne!(a.ephemeral_id, b.ephemeral_id);
        assert!(a.screen_size().is_none());
    }
}
