mod cli;
mod config;
mod device_id;
mod h264;
mod peer;
mod registry;
mod relay;
mod signaling;
mod source;
mod status;

use std::sync::{Arc, OnceLock};

use anyhow::Context;
use bridge_protocol::{EXIT_DEVICE_ID_FAILURE, EXIT_INVALID_CONFIG, IceMessage, SdpMessage};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use peer::PeerSession;
use registry::SessionRegistry;
use signaling::SignalingTransport;
use source::SharedSource;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = match cli::parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{e:#}");
            std::process::exit(EXIT_INVALID_CONFIG);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(args.log_level.clone())),
        )
        .init();

    gstreamer::init().context("failed to initialize GStreamer")?;

    let config_path = match config::resolve_path(args.config_path.as_deref()) {
        Ok(p) => p,
        Err(e) => {
            error!("failed to resolve config path: {e:#}");
            std::process::exit(EXIT_INVALID_CONFIG);
        }
    };
    let bridge_config = match config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            error!("{e:#}");
            std::process::exit(EXIT_INVALID_CONFIG);
        }
    };

    let device_id = device_id::derive_device_id(&args.rtsp_url);
    if device_id.len() != 16 {
        error!("failed to derive a device id from --rtsp-url");
        std::process::exit(EXIT_DEVICE_ID_FAILURE);
    }

    info!(
        device_id = %device_id,
        rtsp_url = %args.rtsp_url,
        use_relay = args.use_relay,
        force_h264 = args.force_h264,
        "starting camera-bridge"
    );

    let shared_source = SharedSource::new(
        args.rtsp_url.clone(),
        bridge_config.camera.clone(),
        device_id.clone(),
    );
    let registry = SessionRegistry::new(Arc::clone(&shared_source));
    let ice_servers = bridge_config.ice_servers();
    let cancel = CancellationToken::new();

    // `SignalingTransport::connect` needs the offer/ICE callbacks up front,
    // but those callbacks need a transport handle to publish answers back
    // through. This slot is filled in immediately after `connect` returns,
    // before any inbound message can reach the callbacks.
    let transport_slot: Arc<OnceLock<Arc<SignalingTransport>>> = Arc::new(OnceLock::new());

    let on_offer: signaling::OfferCallback = {
        let registry = Arc::clone(&registry);
        let shared_source = Arc::clone(&shared_source);
        let transport_slot = Arc::clone(&transport_slot);
        let device_id = device_id.clone();
        let use_relay = args.use_relay;
        let force_h264 = args.force_h264;
        Arc::new(move |viewer_id: String, offer: SdpMessage| {
            let registry = Arc::clone(&registry);
            let shared_source = Arc::clone(&shared_source);
            let transport_slot = Arc::clone(&transport_slot);
            let device_id = device_id.clone();
            let ice_servers = ice_servers.clone();
            tokio::spawn(async move {
                handle_offer(
                    registry,
                    shared_source,
                    transport_slot,
                    device_id,
                    ice_servers,
                    use_relay,
                    force_h264,
                    viewer_id,
                    offer,
                )
                .await;
            });
        })
    };

    let on_ice: signaling::IceCallback = {
        let registry = Arc::clone(&registry);
        Arc::new(move |viewer_id: String, msg: IceMessage| {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                registry.on_remote_ice(&viewer_id, msg).await;
            });
        })
    };

    let transport = SignalingTransport::connect(
        &bridge_config.mqtt,
        &device_id,
        on_offer,
        on_ice,
        cancel.clone(),
    )
    .context("failed to start mqtt signaling transport")?;
    let transport = Arc::new(transport);
    let _ = transport_slot.set(Arc::clone(&transport));

    let status_handle = tokio::spawn({
        let transport = Arc::clone(&transport);
        let shared_source = Arc::clone(&shared_source);
        let device_id = device_id.clone();
        let status_interval = args.status_interval;
        let cancel = cancel.clone();
        async move {
            status::run(&transport, &shared_source, &device_id, status_interval, cancel).await;
        }
    });

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("failed to install SIGTERM handler")?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            info!("received SIGTERM, shutting down");
        }
    }

    cancel.cancel();
    if let Err(e) = status_handle.await {
        warn!("status task panicked: {e:?}");
    }

    shared_source.shutdown().await;
    status::publish_shutdown(&transport, &device_id).await;
    registry.shutdown().await;
    transport.close().await;

    info!("camera-bridge shutdown complete");
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn handle_offer(
    registry: Arc<SessionRegistry>,
    shared_source: Arc<SharedSource>,
    transport_slot: Arc<OnceLock<Arc<SignalingTransport>>>,
    device_id: String,
    ice_servers: Vec<bridge_protocol::IceServerEntry>,
    use_relay: bool,
    force_h264: bool,
    viewer_id: String,
    offer: SdpMessage,
) {
    registry.supersede(&viewer_id).await;

    let Some(transport) = transport_slot.get().cloned() else {
        warn!(viewer_id, "offer arrived before signaling transport was ready, dropping");
        return;
    };

    // The answer must reach the viewer before any locally-gathered ICE
    // candidate for this session. `watch` carries the one false-to-true
    // transition without the missed-wakeup race a bare `Notify` would have
    // if a candidate's publish task starts waiting after the answer's
    // publish already completed.
    let (answer_published_tx, answer_published_rx) = tokio::sync::watch::channel(false);

    let answer_viewer = viewer_id.clone();
    let answer_transport = Arc::clone(&transport);
    let on_answer = move |msg: SdpMessage| {
        let transport = Arc::clone(&answer_transport);
        let viewer_id = answer_viewer.clone();
        let published = answer_published_tx.clone();
        tokio::spawn(async move {
            transport.publish_answer(&viewer_id, &msg).await;
            let _ = published.send(true);
        });
    };

    let ice_viewer = viewer_id.clone();
    let ice_transport = Arc::clone(&transport);
    let on_ice_candidate = move |msg: IceMessage| {
        let transport = Arc::clone(&ice_transport);
        let viewer_id = ice_viewer.clone();
        let mut answer_published = answer_published_rx.clone();
        tokio::spawn(async move {
            if !*answer_published.borrow() && answer_published.changed().await.is_err() {
                return;
            }
            transport.publish_ice(&viewer_id, &msg).await;
        });
    };

    let terminal_registry = Arc::clone(&registry);
    let terminal_viewer = viewer_id.clone();
    let on_terminal = move || {
        terminal_registry.spawn_teardown(terminal_viewer.clone());
    };

    match PeerSession::negotiate(
        device_id,
        viewer_id.clone(),
        offer,
        ice_servers,
        shared_source,
        use_relay,
        force_h264,
        on_answer,
        on_ice_candidate,
        on_terminal,
    )
    .await
    {
        Ok(session) => registry.insert(session).await,
        Err(e) => error!(viewer_id, "failed to negotiate peer session: {e:#}"),
    }
}
