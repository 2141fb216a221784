//! Command channel to a single device.

use std::sync::Arc;

use async_trait::async_trait;

use crate::ledger::{ConnectionLedger, LedgerError};
use crate::protocol::{CommandOutcome, DeviceCommand, DeviceResponse};
use crate::screen::ScreenSnapshot;

/// Anything that can execute primitive commands on one device.
#[async_trait]
pub trait DeviceLink: Send + Sync {
    /// Persistent id of the device behind this link.
    fn device_id(&self) -> &str;

    /// Send one command and wait for its correlated response.
    async fn execute(&self, command: DeviceCommand) -> Result<DeviceResponse, LedgerError>;

    /// Last reported screen dimensions.
    fn screen_size(&self) -> Option<(u32, u32)>;

    /// Fetch the current screen.
    async fn screen(&self, include_screenshot: bool) -> Result<ScreenSnapshot, LedgerError> {
        match self
            .execute(DeviceCommand::GetScreen { include_screenshot })
            .await?
        {
            DeviceResponse::Screen(snapshot) => Ok(snapshot),
            DeviceResponse::Result(_) => Err(LedgerError::UnexpectedResponse("get_screen")),
        }
    }

    /// Run an action command and return the device's outcome.
    async fn run(&self, command: DeviceCommand) -> Result<CommandOutcome, LedgerError> {
        let name = command.name();
        match self.execute(command).await? {
            DeviceResponse::Result(outcome) => Ok(outcome),
            DeviceResponse::Screen(_) => Err(LedgerError::UnexpectedResponse(name)),
        }
    }
}

/// [`DeviceLink`] backed by the shared connection ledger.
#[derive(Clone)]
pub struct LedgerDevice {
    ledger: Arc<ConnectionLedger>,
    device_id: String,
}

impl LedgerDevice {
    pub fn new(ledger: Arc<ConnectionLedger>, device_id: impl Into<String>) -> Self {
        Self {
            ledger,
            device_id: device_id.into(),
        }
    }
}

#[async_trait]
impl DeviceLink for LedgerDevice {
    fn device_id(&self) -> &str {
        &self.device_id
    }

    async fn execute(&self, command: DeviceCommand) -> Result<DeviceResponse, LedgerError> {
        self.ledger.send_command(&self.device_id, command).await
    }

    fn screen_size(&self) -> Option<(u32, u32)> {
        self.ledger.screen_size(&self.device_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{DeviceConnection, LedgerConfig};
    use crate::protocol::{DeviceInfo, OutboundFrame};
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_ledger_device_round_trip() {
        let ledger = Arc::new(ConnectionLedger::new(
            LedgerConfig::default().with_command_timeout(Duration::from_secs(2)),
        ));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let info = DeviceInfo {
            screen_width: 1080,
            screen_height: 2400,
            ..Default::default()
        };
        ledger
            .register_device(DeviceConnection::new("d1", "acct", info, tx))
            .unwrap();

        let responder = {
            let ledger = ledger.clone();
            tokio::spawn(async move {
                if let Some(OutboundFrame::Json(frame)) = rx.recv().await {
                    assert_eq!(frame["type"], "get_screen");
                    let id = frame["requestId"].as_str().unwrap().to_string();
                    ledger.resolve_request("d1", &id, DeviceResponse::Screen(ScreenSnapshot::default()));
                }
            })
        };

        let link = LedgerDevice::new(ledger, "d1");
        assert_eq!(link.screen_size(), Some((1080, 2400)));
        assert!(link.screen(false).await.unwrap().is_empty());
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_ledger_device_not_connected() {
        let link = LedgerDevice::new(Arc::new(ConnectionLedger::default()), "ghost");
        assert_eq!(
            link.run(DeviceCommand::Back).await,
            Err(LedgerError::DeviceNotConnected("ghost".to_string()))
        );
    }
}
