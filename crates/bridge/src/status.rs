use std::time::Duration;

use bridge_protocol::StatusMessage;
use tokio_util::sync::CancellationToken;

use crate::signaling::SignalingTransport;
use crate::source::SharedSource;

/// Publish an initial status ~1.5s after the transport connects, then every
/// `status_interval` seconds until cancelled. A zero interval disables the
/// heartbeat entirely; the caller should not spawn this task in that case.
pub(crate) async fn run(
    transport: &SignalingTransport,
    shared_source: &SharedSource,
    device_id: &str,
    status_interval: u64,
    cancel: CancellationToken,
) {
    if status_interval == 0 {
        return;
    }

    tokio::select! {
        _ = cancel.cancelled() => return,
        _ = tokio::time::sleep(Duration::from_millis(1500)) => {}
    }
    publish_alive(transport, shared_source, device_id).await;

    let interval = Duration::from_secs(status_interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
        publish_alive(transport, shared_source, device_id).await;
    }
}

async fn publish_alive(transport: &SignalingTransport, shared_source: &SharedSource, device_id: &str) {
    let msg = StatusMessage::alive(device_id, now_unix(), shared_source.is_ready());
    transport.publish_status(&msg).await;
}

/// Publish the one final `shutdown` status. Called unconditionally during
/// shutdown, even if heartbeats were disabled, so viewers observe the device
/// going offline.
pub(crate) async fn publish_shutdown(transport: &SignalingTransport, device_id: &str) {
    let msg = StatusMessage::shutdown(device_id, now_unix());
    transport.publish_status(&msg).await;
}

fn now_unix() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
