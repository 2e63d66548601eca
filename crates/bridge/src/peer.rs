use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::Context;
use bridge_protocol::{IceMessage, IceServerEntry, SdpMessage};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_H264, MediaEngine};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::RTCPFeedback;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::source::SharedSource;

const H264_FMTP: &str = "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PeerState {
    New,
    Answering,
    Negotiated,
    Live,
    Terminal,
}

enum PendingIce {
    /// Remote description not set yet; candidates accumulate here.
    Waiting(Vec<RTCIceCandidateInit>),
    /// Remote description set; candidates are applied as they arrive.
    Applied,
}

/// One viewer's WebRTC session: the peer connection, its state, and the
/// background task forwarding frames from the shared source onto the
/// outgoing video track.
pub(crate) struct PeerSession {
    pub viewer_id: String,
    pub device_id: String,
    pc: Arc<RTCPeerConnection>,
    state: Arc<StdMutex<PeerState>>,
    pending_ice: Mutex<PendingIce>,
    forward_handle: Mutex<Option<JoinHandle<()>>>,
}

impl PeerSession {
    pub fn state(&self) -> PeerState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run the offer-handling procedure (steps 2-7): create the peer
    /// connection, apply the remote offer, attach the shared-source track,
    /// and publish the local answer. Superseding a prior session for the
    /// same viewer-id (step 1) is the registry's responsibility and must
    /// complete before this is called.
    #[allow(clippy::too_many_arguments)]
    pub async fn negotiate(
        device_id: String,
        viewer_id: String,
        offer: SdpMessage,
        ice_servers: Vec<IceServerEntry>,
        shared_source: Arc<SharedSource>,
        use_relay: bool,
        force_h264: bool,
        on_answer: impl Fn(SdpMessage) + Send + Sync + 'static,
        on_ice_candidate: impl Fn(IceMessage) + Send + Sync + 'static,
        on_terminal: impl Fn() + Send + Sync + 'static,
    ) -> anyhow::Result<Arc<PeerSession>> {
        let mut media_engine = MediaEngine::default();
        if force_h264 {
            // Register only H.264: register_default_codecs() pulls in VP8/VP9,
            // which risks the browser negotiating a codec our source never
            // produces.
            media_engine
                .register_codec(
                    RTCRtpCodecParameters {
                        capability: RTCRtpCodecCapability {
                            mime_type: MIME_TYPE_H264.to_string(),
                            clock_rate: 90000,
                            channels: 0,
                            sdp_fmtp_line: H264_FMTP.to_string(),
                            rtcp_feedback: h264_feedback(),
                        },
                        payload_type: 102,
                        ..Default::default()
                    },
                    RTPCodecType::Video,
                )
                .context("failed to register H.264 codec")?;
        } else {
            media_engine
                .register_default_codecs()
                .context("failed to register default codecs")?;
        }
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .context("failed to register interceptors")?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_ice_servers: Vec<RTCIceServer> = ice_servers
            .into_iter()
            .map(|s| RTCIceServer {
                urls: s.urls,
                username: s.username.unwrap_or_default(),
                credential: s.credential.unwrap_or_default(),
            })
            .collect();
        let config = RTCConfiguration {
            ice_servers: rtc_ice_servers,
            ..Default::default()
        };
        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .context("failed to create peer connection")?,
        );

        let video_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_string(),
                clock_rate: 90000,
                sdp_fmtp_line: H264_FMTP.to_string(),
                ..Default::default()
            },
            "video".to_string(),
            format!("camera-bridge-{device_id}"),
        ));
        let video_sender = pc
            .add_track(Arc::clone(&video_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .context("failed to add video track")?;

        let state = Arc::new(StdMutex::new(PeerState::New));

        let session = Arc::new(PeerSession {
            viewer_id: viewer_id.clone(),
            device_id: device_id.clone(),
            pc: Arc::clone(&pc),
            state: Arc::clone(&state),
            pending_ice: Mutex::new(PendingIce::Waiting(Vec::new())),
            forward_handle: Mutex::new(None),
        });

        {
            let state_cb = Arc::clone(&state);
            let viewer = viewer_id.clone();
            let on_terminal = Arc::new(on_terminal);
            pc.on_peer_connection_state_change(Box::new(move |s| {
                let mut guard = state_cb.lock().unwrap_or_else(|e| e.into_inner());
                match s {
                    RTCPeerConnectionState::Connected => {
                        if *guard == PeerState::Negotiated {
                            *guard = PeerState::Live;
                        }
                        tracing::info!(viewer_id = %viewer, "peer connection live");
                    }
                    RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed => {
                        let was_terminal = *guard == PeerState::Terminal;
                        *guard = PeerState::Terminal;
                        drop(guard);
                        tracing::info!(viewer_id = %viewer, ?s, "peer connection terminal");
                        if !was_terminal {
                            on_terminal();
                        }
                    }
                    _ => {
                        tracing::debug!(viewer_id = %viewer, ?s, "peer connection state changed");
                    }
                }
                Box::pin(async {})
            }));
        }
        {
            let viewer = viewer_id.clone();
            pc.on_ice_gathering_state_change(Box::new(move |s| {
                if s == RTCIceGathererState::Complete {
                    tracing::debug!(viewer_id = %viewer, "ice gathering complete");
                }
                Box::pin(async {})
            }));
        }
        {
            let ice_cb = Arc::new(on_ice_candidate);
            let gathering_done_cb = Arc::clone(&ice_cb);
            pc.on_ice_candidate(Box::new(move |candidate| {
                match candidate {
                    Some(c) => {
                        if let Ok(json) = c.to_json() {
                            ice_cb(IceMessage {
                                candidate: Some(json.candidate),
                                sdp_mid: json.sdp_mid,
                                sdp_mline_index: json.sdp_mline_index,
                            });
                        }
                    }
                    // `None` marks the end of local candidate gathering.
                    None => gathering_done_cb(IceMessage::end_of_candidates()),
                }
                Box::pin(async {})
            }));
        }

        start_rtcp_reader(Arc::clone(&video_sender), viewer_id.clone());

        // step 3: apply the remote offer
        *state.lock().unwrap_or_else(|e| e.into_inner()) = PeerState::Answering;
        let remote =
            RTCSessionDescription::offer(offer.sdp).context("failed to parse SDP offer")?;
        pc.set_remote_description(remote)
            .await
            .context("failed to set remote description")?;

        // step 4: flush any ICE candidates that arrived before this point
        {
            let mut pending = session.pending_ice.lock().await;
            if let PendingIce::Waiting(queued) = &mut *pending {
                for candidate in std::mem::take(queued) {
                    if let Err(e) = pc.add_ice_candidate(candidate).await {
                        tracing::warn!(viewer_id = %viewer_id, "failed to apply queued ice candidate: {e}");
                    }
                }
            }
            *pending = PendingIce::Applied;
        }

        // step 5: attach the shared-source track
        shared_source
            .add_client(&viewer_id)
            .await
            .context("failed to add client to shared source")?;
        let mut source_track = shared_source.get_track(use_relay);

        let forward_video = Arc::clone(&video_track);
        let forward_viewer = viewer_id.clone();
        let handle = tokio::spawn(async move {
            // `source_track` is owned by this task's stack; dropping it here
            // (by returning, or by the task being aborted from `close()`)
            // stops its pump, so no separate stop step is needed.
            loop {
                match source_track.recv().await {
                    Ok(frame) => {
                        if let Err(e) = forward_video
                            .write_sample(&webrtc::media::Sample {
                                data: frame.data,
                                duration: frame.pts,
                                ..Default::default()
                            })
                            .await
                        {
                            tracing::warn!(viewer_id = %forward_viewer, "failed to write video sample: {e}");
                        }
                    }
                    Err(_) => {
                        tracing::info!(viewer_id = %forward_viewer, "upstream track ended");
                        return;
                    }
                }
            }
        });
        *session.forward_handle.lock().await = Some(handle);

        // step 6: create and publish the local answer
        let answer = pc
            .create_answer(None)
            .await
            .context("failed to create answer")?;
        pc.set_local_description(answer.clone())
            .await
            .context("failed to set local description")?;
        *state.lock().unwrap_or_else(|e| e.into_inner()) = PeerState::Negotiated;
        on_answer(SdpMessage::answer(answer.sdp));

        Ok(session)
    }

    /// Apply a remote ICE candidate per the remote-ICE-handling rules: ignore
    /// the end-of-candidates sentinel, drop candidates once the connection is
    /// connected/closed/failed, otherwise queue or apply immediately
    /// depending on whether the remote description is set.
    pub async fn on_remote_ice(&self, msg: IceMessage) {
        if msg.is_end_of_candidates() {
            return;
        }

        let connection_state = self.pc.connection_state();
        let settled = matches!(
            connection_state,
            RTCPeerConnectionState::Connected
                | RTCPeerConnectionState::Closed
                | RTCPeerConnectionState::Failed
        );
        if settled || self.state() == PeerState::Terminal {
            *self.pending_ice.lock().await = PendingIce::Applied;
            return;
        }

        let raw_candidate = msg.candidate.unwrap_or_default();
        let candidate = raw_candidate
            .strip_prefix("a=")
            .unwrap_or(&raw_candidate)
            .to_string();
        let init = RTCIceCandidateInit {
            candidate,
            sdp_mid: msg.sdp_mid,
            sdp_mline_index: msg.sdp_mline_index,
            ..Default::default()
        };

        let mut pending = self.pending_ice.lock().await;
        match &mut *pending {
            PendingIce::Waiting(queue) => queue.push(init),
            PendingIce::Applied => {
                if let Err(e) = self.pc.add_ice_candidate(init).await {
                    tracing::warn!(viewer_id = %self.viewer_id, "failed to apply ice candidate: {e}");
                }
            }
        }
    }

    /// Steps 1-4 of the teardown procedure: stop the forwarding task/track,
    /// close the peer connection with a bounded timeout, and clear the
    /// pending-ICE queue. Steps 5-6 (`remove_client`, the settle delay) are
    /// the registry's job since they touch the shared source, not the peer
    /// connection.
    ///
    /// Aborting the forwarding task drops its `SourceTrack` along with
    /// everything else on its stack, which stops the track's pump task too
    /// (see `SourceTrack`'s `Drop` impl) — so this always stops the pump,
    /// not only on the path where the upstream track ends on its own.
    pub async fn close(&self) {
        if let Some(handle) = self.forward_handle.lock().await.take() {
            handle.abort();
        }

        match tokio::time::timeout(Duration::from_secs(2), self.pc.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(viewer_id = %self.viewer_id, "error closing peer connection: {e}")
            }
            Err(_) => {
                tracing::warn!(viewer_id = %self.viewer_id, "timed out closing peer connection")
            }
        }

        *self.pending_ice.lock().await = PendingIce::Applied;
    }
}

fn h264_feedback() -> Vec<RTCPFeedback> {
    vec![
        RTCPFeedback {
            typ: "goog-remb".into(),
            parameter: "".into(),
        },
        RTCPFeedback {
            typ: "ccm".into(),
            parameter: "fir".into(),
        },
        RTCPFeedback {
            typ: "nack".into(),
            parameter: "".into(),
        },
        RTCPFeedback {
            typ: "nack".into(),
            parameter: "pli".into(),
        },
    ]
}

/// Drain RTCP so PLI/FIR keyframe requests don't back up the sender; the
/// bridge forwards whatever the upstream produces, so there is no local
/// encoder to poke for a keyframe.
fn start_rtcp_reader(sender: Arc<RTCRtpSender>, viewer_id: String) {
    tokio::spawn(async move {
        while let Ok((packets, _)) = sender.read_rtcp().await {
            for pkt in &packets {
                let pkt_any = pkt.as_any();
                if pkt_any
                    .is::<rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication>()
                    || pkt_any.is::<rtcp::payload_feedbacks::full_intra_request::FullIntraRequest>()
                {
                    tracing::debug!(viewer_id = %viewer_id, "received PLI/FIR from viewer");
                }
            }
        }
    });
}
