use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bridge_protocol::{IceMessage, MqttConfig, SdpMessage, StatusMessage};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS, Transport};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Callbacks invoked when an offer or ICE candidate arrives for a viewer.
///
/// Implementations must not run session logic inline: hand the payload to a
/// spawned task and return immediately, since these run on the MQTT client's
/// own poll loop.
pub(crate) type OfferCallback = Arc<dyn Fn(String, SdpMessage) + Send + Sync>;
pub(crate) type IceCallback = Arc<dyn Fn(String, IceMessage) + Send + Sync>;

pub(crate) struct SignalingTransport {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    device_id: String,
}

impl SignalingTransport {
    /// Connect to the broker and spawn the poll-loop task. Returns once the
    /// client handle exists; the connection itself happens asynchronously as
    /// rumqttc's event loop is driven.
    pub(crate) fn connect(
        config: &MqttConfig,
        device_id: &str,
        on_offer: OfferCallback,
        on_ice: IceCallback,
        cancel: CancellationToken,
    ) -> anyhow::Result<Self> {
        let client_id = format!("camera-bridge-{device_id}");
        let use_websockets = config.transport == "websockets";
        // rumqttc builds the websocket upgrade URL from the host string
        // directly, so the configured path has to be appended to it here;
        // there's no separate setter for it.
        let host = if use_websockets {
            format!("{}{}", config.host, config.ws_path)
        } else {
            config.host.clone()
        };
        let mut opts = MqttOptions::new(client_id, host, config.port);
        opts.set_keep_alive(Duration::from_secs(config.keepalive.max(1) as u64));
        if !config.username.is_empty() {
            opts.set_credentials(config.username.clone(), config.password.clone());
        }
        if use_websockets {
            // "websockets" also means TLS (matching the donor's
            // `tls_set()` + `ws_set_options(path=...)` pairing).
            opts.set_transport(Transport::wss_with_default_config());
        }

        let (client, eventloop) = AsyncClient::new(opts, 64);
        let connected = Arc::new(AtomicBool::new(false));

        tokio::spawn(poll_loop(
            eventloop,
            client.clone(),
            device_id.to_string(),
            connected.clone(),
            on_offer,
            on_ice,
            cancel,
        ));

        Ok(Self {
            client,
            connected,
            device_id: device_id.to_string(),
        })
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub(crate) async fn publish_answer(&self, viewer_id: &str, msg: &SdpMessage) {
        let topic = format!("{}/sdp/{}", self.device_id, viewer_id);
        self.publish(&topic, msg).await;
    }

    pub(crate) async fn publish_ice(&self, viewer_id: &str, msg: &IceMessage) {
        let topic = format!("{}/ice/{}", self.device_id, viewer_id);
        self.publish(&topic, msg).await;
    }

    pub(crate) async fn publish_status(&self, msg: &StatusMessage) {
        let topic = format!("device/{}/status", self.device_id);
        self.publish(&topic, msg).await;
    }

    async fn publish(&self, topic: &str, payload: &impl serde::Serialize) {
        if !self.is_connected() {
            warn!(topic, "publish skipped: not connected to broker");
            return;
        }
        let bytes = match serde_json::to_vec(payload) {
            Ok(b) => b,
            Err(e) => {
                warn!(topic, "failed to serialize payload: {e}");
                return;
            }
        };
        if let Err(e) = self
            .client
            .publish(topic, QoS::AtMostOnce, false, bytes)
            .await
        {
            warn!(topic, "publish failed: {e}");
        }
    }

    pub(crate) async fn close(&self) {
        let _ = self.client.disconnect().await;
    }
}

async fn poll_loop(
    mut eventloop: rumqttc::EventLoop,
    client: AsyncClient,
    device_id: String,
    connected: Arc<AtomicBool>,
    on_offer: OfferCallback,
    on_ice: IceCallback,
    cancel: CancellationToken,
) {
    let sdp_filter = format!("{device_id}/sdp/+/offer");
    let ice_filter = format!("{device_id}/ice/+/offer");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("signaling poll loop shutting down");
                return;
            }
            event = eventloop.poll() => {
                match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        connected.store(true, Ordering::Relaxed);
                        info!("connected to mqtt broker, resubscribing");
                        if let Err(e) = client.subscribe(&sdp_filter, QoS::AtMostOnce).await {
                            warn!("failed to subscribe to {sdp_filter}: {e}");
                        }
                        if let Err(e) = client.subscribe(&ice_filter, QoS::AtMostOnce).await {
                            warn!("failed to subscribe to {ice_filter}: {e}");
                        }
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        connected.store(false, Ordering::Relaxed);
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        handle_publish(&device_id, &publish.topic, &publish.payload, &on_offer, &on_ice);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        connected.store(false, Ordering::Relaxed);
                        warn!("mqtt event loop error: {e}, retrying");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
    }
}

fn handle_publish(
    device_id: &str,
    topic: &str,
    payload: &[u8],
    on_offer: &OfferCallback,
    on_ice: &IceCallback,
) {
    if let Some(viewer_id) = parse_viewer_id(topic, device_id, "sdp") {
        match serde_json::from_slice::<SdpMessage>(payload) {
            Ok(msg) => on_offer(viewer_id, msg),
            Err(e) => warn!(topic, "invalid offer payload: {e}"),
        }
        return;
    }
    if let Some(viewer_id) = parse_viewer_id(topic, device_id, "ice") {
        match serde_json::from_slice::<IceMessage>(payload) {
            Ok(msg) => on_ice(viewer_id, msg),
            Err(e) => warn!(topic, "invalid ice payload: {e}"),
        }
    }
}

/// Extract the viewer-id segment from `<device>/<kind>/<id>/offer`, where
/// `<id>` matches `[0-9A-Za-z_-]+`.
fn parse_viewer_id(topic: &str, device_id: &str, kind: &str) -> Option<String> {
    let prefix = format!("{device_id}/{kind}/");
    let rest = topic.strip_prefix(&prefix)?;
    let id = rest.strip_suffix("/offer")?;
    if !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        Some(id.to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sdp_offer_topic() {
        let id = parse_viewer_id("cam-1/sdp/viewer_A-2/offer", "cam-1", "sdp");
        assert_eq!(id.as_deref(), Some("viewer_A-2"));
    }

    #[test]
    fn parses_ice_offer_topic() {
        let id = parse_viewer_id("cam-1/ice/v1/offer", "cam-1", "ice");
        assert_eq!(id.as_deref(), Some("v1"));
    }

    #[test]
    fn rejects_topic_for_a_different_device() {
        let id = parse_viewer_id("cam-2/sdp/v1/offer", "cam-1", "sdp");
        assert!(id.is_none());
    }

    #[test]
    fn rejects_topic_missing_offer_suffix() {
        let id = parse_viewer_id("cam-1/sdp/v1", "cam-1", "sdp");
        assert!(id.is_none());
    }

    #[test]
    fn rejects_empty_viewer_id() {
        let id = parse_viewer_id("cam-1/sdp//offer", "cam-1", "sdp");
        assert!(id.is_none());
    }
}
