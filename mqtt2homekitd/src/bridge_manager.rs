use std::thread;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use anyhow::Result;
use crate::accessory::Accessory;
use crate::codec::CharValue;
use crate::config::LivenessConfig;
use crate::error::BridgeError;
use crate::mqtt::BusMessage;
use crate::registry::{Bridge, CharacteristicRef, SweepReport};

/// Commands sent to the bridge thread
pub enum BridgeCommand {
    Message(BusMessage, oneshot::Sender<Result<(), BridgeError>>),
    ControllerWrite {
        aid: u64,
        iid: u64,
        value: CharValue,
        reply: oneshot::Sender<Result<CharacteristicRef, BridgeError>>,
    },
    RemoveAccessory(String, oneshot::Sender<bool>),
    GetAll(oneshot::Sender<Vec<Accessory>>),
    GetOne(String, oneshot::Sender<Option<Accessory>>),
    Sweep {
        now: DateTime<Utc>,
        reply: oneshot::Sender<SweepReport>,
    },
    /// Persist a final snapshot, stop the accessory server, then reply
    Shutdown(oneshot::Sender<()>),
}

/// Handle to the thread that owns the registry
#[derive(Clone)]
pub struct BridgeHandle {
    tx: mpsc::Sender<BridgeCommand>,
}

impl BridgeHandle {
    /// Spawn the bridge thread. Every registry mutation runs there, one
    /// command at a time, and is followed by a snapshot if the topology moved.
    pub fn spawn(mut bridge: Bridge) -> Self {
        let (tx, mut rx) = mpsc::channel::<BridgeCommand>(256);

        thread::spawn(move || {
            while let Some(cmd) = rx.blocking_recv() {
                match cmd {
                    BridgeCommand::Message(message, reply) => {
                        let result = bridge.handle_message(&message.topic, &message.payload);
                        let _ = reply.send(result);
                    }
                    BridgeCommand::ControllerWrite { aid, iid, value, reply } => {
                        let result = bridge.controller_write(aid, iid, value);
                        let _ = reply.send(result);
                    }
                    BridgeCommand::RemoveAccessory(accessory_id, reply) => {
                        let removed = bridge.remove_accessory(&accessory_id);
                        let _ = reply.send(removed);
                    }
                    BridgeCommand::GetAll(reply) => {
                        let _ = reply.send(bridge.accessories().cloned().collect());
                    }
                    BridgeCommand::GetOne(accessory_id, reply) => {
                        let _ = reply.send(bridge.accessory(&accessory_id).cloned());
                    }
                    BridgeCommand::Sweep { now, reply } => {
                        let report = bridge.sweep(now);
                        let _ = reply.send(report);
                    }
                    BridgeCommand::Shutdown(reply) => {
                        tracing::info!("Bridge thread shutting down");
                        bridge.shutdown();
                        let _ = reply.send(());
                        return;
                    }
                }
                bridge.flush();
            }

            // every handle dropped without a shutdown
            bridge.shutdown();
        });

        Self { tx }
    }

    /// Route one bus message through the registry
    pub async fn message(&self, message: BusMessage) -> Result<(), BridgeError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(BridgeCommand::Message(message, reply))
            .await
            .map_err(|_| BridgeError::Stopped)?;
        rx.await.map_err(|_| BridgeError::Stopped)?
    }

    /// Apply a controller write and publish it to the bus
    pub async fn controller_write(&self, aid: u64, iid: u64, value: CharValue) -> Result<CharacteristicRef> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(BridgeCommand::ControllerWrite { aid, iid, value, reply })
            .await?;
        Ok(rx.await??)
    }

    /// Remove an accessory. Returns false if it did not exist.
    pub async fn remove_accessory(&self, accessory_id: String) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(BridgeCommand::RemoveAccessory(accessory_id, reply)).await?;
        Ok(rx.await?)
    }

    pub async fn get_all(&self) -> Result<Vec<Accessory>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(BridgeCommand::GetAll(reply)).await?;
        Ok(rx.await?)
    }

    pub async fn get_one(&self, accessory_id: String) -> Result<Option<Accessory>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(BridgeCommand::GetOne(accessory_id, reply)).await?;
        Ok(rx.await?)
    }

    /// Run the liveness sweep as of `now`
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(BridgeCommand::Sweep { now, reply }).await?;
        Ok(rx.await?)
    }

    /// Persist and stop the bridge thread. Returns once the snapshot is written.
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(BridgeCommand::Shutdown(reply)).await?;
        rx.await?;
        Ok(())
    }
}

/// Bridge manager event loop: feeds bus messages to the registry and runs the
/// periodic liveness sweep.
pub async fn run(
    bridge: BridgeHandle,
    mut rx: mpsc::Receiver<BusMessage>,
    config: LivenessConfig,
    cancel: CancellationToken,
) -> Result<()> {
    let mut sweep_interval = tokio::time::interval(
        std::time::Duration::from_secs(config.sweep_interval_secs)
    );

    loop {
        tokio::select! {
            Some(message) = rx.recv() => {
                let topic = message.topic.clone();
                match bridge.message(message).await {
                    Ok(()) => {}
                    Err(e) if e.is_message_error() => {
                        tracing::warn!(code = e.error_code(), "Dropping message on {}: {}", topic, e);
                    }
                    Err(e) => {
                        tracing::error!(code = e.error_code(), "Failed to handle message on {}: {}", topic, e);
                    }
                }
            }
            _ = sweep_interval.tick() => {
                match bridge.sweep(Utc::now()).await {
                    Ok(report) if report.flagged > 0 || report.removed > 0 => {
                        tracing::info!(
                            "Liveness sweep flagged {} and removed {} accessories",
                            report.flagged,
                            report.removed
                        );
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!("Failed to run liveness sweep: {}", e),
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!("Bridge manager shutting down");
                break;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::{test_bridge, ServerEvent};
    use crate::store::file::StateFile;
    use crate::store::snapshot;

    fn message(topic: &str, payload: &[u8]) -> BusMessage {
        BusMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
        }
    }

    #[tokio::test]
    async fn test_handle_round_trip() {
        let (bridge, recorder) = test_bridge();
        let handle = BridgeHandle::spawn(bridge);

        handle.message(message("HomeKit/desk/Lightbulb/On", b"1")).await.unwrap();
        let err = handle.message(message("HomeKit/desk", b"1")).await.unwrap_err();
        assert!(err.is_message_error());

        let all = handle.get_all().await.unwrap();
        assert_eq!(all.len(), 1);
        let desk = handle.get_one("desk".to_string()).await.unwrap().unwrap();
        let on = desk.service("Lightbulb", 0).unwrap().characteristic("On").unwrap().iid;

        handle.controller_write(2, on, CharValue::Bool(false)).await.unwrap();
        assert_eq!(
            recorder.published(),
            vec![("HomeKit/desk/Lightbulb/On".to_string(), "0".to_string())]
        );

        let err = handle.controller_write(7, on, CharValue::Bool(true)).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BridgeError>(),
            Some(BridgeError::UnknownAccessory(7))
        ));

        assert!(handle.remove_accessory("desk".to_string()).await.unwrap());
        assert!(!handle.remove_accessory("desk".to_string()).await.unwrap());
        assert!(handle.get_one("desk".to_string()).await.unwrap().is_none());

        handle.shutdown().await.unwrap();
        assert!(handle.get_all().await.is_err());
    }

    #[tokio::test]
    async fn test_sweep_through_handle() {
        let (bridge, recorder) = test_bridge();
        let handle = BridgeHandle::spawn(bridge);
        handle
            .message(message("HomeKit/thermo/TemperatureSensor/CurrentTemperature", b"20"))
            .await
            .unwrap();

        let report = handle.sweep(Utc::now() + chrono::Duration::days(30)).await.unwrap();
        assert_eq!(report.removed, 1);
        assert!(recorder.events().contains(&ServerEvent::Removed(2)));
        assert!(handle.get_all().await.unwrap().is_empty());

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_run_loop_feeds_registry() {
        let (bridge, _recorder) = test_bridge();
        let handle = BridgeHandle::spawn(bridge);
        let (tx, rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run(handle.clone(), rx, LivenessConfig::default(), cancel.clone()));

        tx.send(message("HomeKit/garage/GarageDoorOpener/1/CurrentDoorState", b"0")).await.unwrap();
        tx.send(message("HomeKit/garage/Toaster/On", b"1")).await.unwrap();

        let mut garage = None;
        for _ in 0..50 {
            garage = handle.get_one("garage".to_string()).await.unwrap();
            if garage.is_some() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(garage.unwrap().service_count("GarageDoorOpener"), 2);

        cancel.cancel();
        task.await.unwrap().unwrap();
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_leaves_loadable_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.state");
        let (bridge, _recorder) = test_bridge();
        let handle = BridgeHandle::spawn(bridge.with_store(StateFile::new(&path)));

        handle.message(message("HomeKit/desk/Lightbulb/On", b"1")).await.unwrap();
        assert!(handle.get_one("desk".to_string()).await.unwrap().is_some());
        std::fs::remove_file(&path).unwrap();

        handle.shutdown().await.unwrap();

        let saved = snapshot::decode(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(saved.accessories.len(), 1);
        assert_eq!(saved.accessories[0].accessory_id, "desk");
        assert_eq!(saved.accessories[0].aid, 2);
    }
}
