use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::{Duration, Instant};

use anyhow::Context;
use bridge_protocol::CameraConfig;
use bytes::Bytes;
use gstreamer::prelude::*;
use gstreamer::{self as gst, ElementFactory};
use gstreamer_app::{AppSink, AppSinkCallbacks};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::relay::{Frame, NonBufferedTrack, RelayTrack, TrackError};

/// A track handed to one peer session. The relay variant is a plain
/// subscription; the non-buffered variant owns a background pump task.
/// Dropping a `SourceTrack` always stops that pump, so a session can simply
/// let its track fall out of scope (or abort the task that owns it) on
/// teardown without leaking the pump.
pub(crate) enum SourceTrack {
    Relay(crate::relay::RelaySubscription),
    NonBuffered {
        track: Arc<NonBufferedTrack>,
        pump: tokio::task::JoinHandle<()>,
    },
}

impl SourceTrack {
    pub async fn recv(&mut self) -> Result<Frame, TrackError> {
        match self {
            SourceTrack::Relay(sub) => sub.recv().await,
            SourceTrack::NonBuffered { track, .. } => track.recv().await,
        }
    }

    fn stop(&mut self) {
        if let SourceTrack::NonBuffered { pump, .. } = self {
            pump.abort();
        }
    }
}

impl Drop for SourceTrack {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Inner {
    pipeline: Option<gst::Pipeline>,
    active_clients: usize,
    watchdog: Option<tokio::task::JoinHandle<()>>,
    watchdog_cancel: Option<CancellationToken>,
}

/// One pull of the upstream camera URL, fanned out to every viewer currently
/// watching. Reference-counted by active client: the puller and watchdog
/// exist only while at least one viewer is attached.
pub(crate) struct SharedSource {
    url: String,
    camera: CameraConfig,
    device_id: String,
    inner: Mutex<Inner>,
    relay: Arc<RelayTrack>,
    ready: Arc<AtomicBool>,
    last_frame_time: Arc<StdMutex<Instant>>,
}

impl SharedSource {
    pub fn new(url: String, camera: CameraConfig, device_id: String) -> Arc<Self> {
        Arc::new(Self {
            url,
            camera,
            device_id,
            inner: Mutex::new(Inner {
                pipeline: None,
                active_clients: 0,
                watchdog: None,
                watchdog_cancel: None,
            }),
            relay: Arc::new(RelayTrack::new(32)),
            ready: Arc::new(AtomicBool::new(false)),
            last_frame_time: Arc::new(StdMutex::new(Instant::now())),
        })
    }

    pub async fn add_client(self: &Arc<Self>, viewer_id: &str) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.active_clients == 0 {
            self.start_locked(&mut inner)
                .await
                .with_context(|| format!("failed to start puller for {}", self.url))?;
        }
        inner.active_clients += 1;
        tracing::info!(
            viewer_id,
            active_clients = inner.active_clients,
            "camera client added"
        );
        Ok(())
    }

    pub async fn remove_client(self: &Arc<Self>, viewer_id: &str) {
        let mut inner = self.inner.lock().await;
        if inner.active_clients == 0 {
            return;
        }
        inner.active_clients -= 1;
        tracing::info!(
            viewer_id,
            active_clients = inner.active_clients,
            "camera client removed"
        );
        if inner.active_clients == 0 {
            self.stop_locked(&mut inner).await;
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    pub async fn shutdown(self: &Arc<Self>) {
        let mut inner = self.inner.lock().await;
        inner.active_clients = 0;
        self.stop_locked(&mut inner).await;
    }

    /// Hand out a track for a new peer session. The relay path returns a
    /// cheap subscription; the non-buffered path spawns a pump task that is
    /// aborted automatically when the returned `SourceTrack` is dropped.
    pub fn get_track(&self, use_relay: bool) -> SourceTrack {
        if use_relay {
            SourceTrack::Relay(self.relay.subscribe())
        } else {
            let track = Arc::new(NonBufferedTrack::new());
            let mut sub = self.relay.subscribe();
            let pump_track = Arc::clone(&track);
            let pump = tokio::spawn(async move {
                loop {
                    match sub.recv().await {
                        Ok(frame) => pump_track.set(frame).await,
                        Err(_) => {
                            pump_track.mark_ended();
                            return;
                        }
                    }
                }
            });
            SourceTrack::NonBuffered { track, pump }
        }
    }

    async fn start_locked(self: &Arc<Self>, inner: &mut Inner) -> anyhow::Result<()> {
        let pipeline = self.build_pipeline()?;
        pipeline
            .set_state(gst::State::Playing)
            .context("failed to set puller pipeline to Playing")?;
        inner.pipeline = Some(pipeline);

        if inner.watchdog.is_none() {
            let cancel = CancellationToken::new();
            let handle = tokio::spawn(watchdog_loop(Arc::downgrade(self), cancel.clone()));
            inner.watchdog = Some(handle);
            inner.watchdog_cancel = Some(cancel);
        }
        Ok(())
    }

    async fn stop_locked(&self, inner: &mut Inner) {
        if let Some(cancel) = inner.watchdog_cancel.take() {
            cancel.cancel();
        }
        if let Some(handle) = inner.watchdog.take() {
            let _ = handle.await;
        }
        destroy_pipeline(inner, &self.ready);
        // Let in-flight frame reads complete before the media resource is
        // fully released.
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    fn build_pipeline(&self) -> anyhow::Result<gst::Pipeline> {
        let relay = Arc::clone(&self.relay);
        let ready = Arc::clone(&self.ready);
        let last_frame_time = Arc::clone(&self.last_frame_time);
        let on_sample = move |data: Bytes, pts: Duration| {
            relay.publish(Frame { data, pts });
            ready.store(true, Ordering::Relaxed);
            if let Ok(mut t) = last_frame_time.lock() {
                *t = Instant::now();
            }
        };

        if self.url.starts_with("rtsp://") {
            build_rtsp_pipeline(&self.url, on_sample)
        } else if self.url.starts_with("/dev/video") {
            build_v4l2_pipeline(&self.url, &self.camera, on_sample)
        } else {
            build_uridecodebin_pipeline(&self.url, on_sample)
        }
    }
}

fn destroy_pipeline(inner: &mut Inner, ready: &AtomicBool) {
    if let Some(pipeline) = inner.pipeline.take() {
        let _ = pipeline.set_state(gst::State::Null);
    }
    ready.store(false, Ordering::Relaxed);
}

async fn watchdog_loop(source: Weak<SharedSource>, cancel: CancellationToken) {
    loop {
        let interval = match source.upgrade() {
            Some(s) => Duration::from_secs(s.camera.reconnect_interval),
            None => return,
        };
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }

        let Some(source) = source.upgrade() else {
            return;
        };

        log_vmrss(&source.device_id);

        let mut inner = source.inner.lock().await;
        if inner.active_clients == 0 || inner.pipeline.is_none() {
            continue;
        }
        if !source.ready.load(Ordering::Relaxed) {
            continue;
        }
        let stale = source
            .last_frame_time
            .lock()
            .map(|t| t.elapsed() > interval * 3)
            .unwrap_or(false);
        if stale {
            tracing::warn!(
                device_id = %source.device_id,
                "rtsp stream stale, destroying and recreating puller"
            );
            destroy_pipeline(&mut inner, &source.ready);
            match source.build_pipeline() {
                Ok(pipeline) => {
                    if let Err(e) = pipeline.set_state(gst::State::Playing) {
                        tracing::error!(device_id = %source.device_id, "failed to restart puller: {e}");
                    } else {
                        inner.pipeline = Some(pipeline);
                    }
                }
                Err(e) => {
                    tracing::error!(device_id = %source.device_id, "failed to rebuild puller: {e}");
                }
            }
        }
    }
}

fn log_vmrss(device_id: &str) {
    match std::fs::read_to_string("/proc/self/status") {
        Ok(contents) => match contents.lines().find(|l| l.starts_with("VmRSS:")) {
            Some(line) => {
                if let Some(kb) = line.split_whitespace().nth(1).and_then(|v| v.parse::<u64>().ok())
                {
                    tracing::info!(device_id, rss_mb = kb / 1024, "watchdog memory check");
                }
            }
            None => tracing::debug!(device_id, "VmRSS not found in /proc/self/status"),
        },
        Err(_) => tracing::debug!(device_id, "/proc/self/status unavailable, skipping rss check"),
    }
}

fn make_appsink(on_sample: impl Fn(Bytes, Duration) + Send + Sync + 'static) -> anyhow::Result<AppSink> {
    let appsink_elem = ElementFactory::make("appsink")
        .property("sync", false)
        .property("async", false)
        .property("emit-signals", true)
        .property("max-buffers", 1u32)
        .property("drop", true)
        .build()
        .context("failed to create appsink")?;
    let appsink = appsink_elem
        .dynamic_cast::<AppSink>()
        .map_err(|_| anyhow::anyhow!("failed to cast to AppSink"))?;

    appsink.set_callbacks(
        AppSinkCallbacks::builder()
            .new_sample(move |sink| {
                let sample = sink.pull_sample().map_err(|_| gst::FlowError::Eos)?;
                let buffer = sample.buffer().ok_or(gst::FlowError::Error)?;
                let map = buffer.map_readable().map_err(|_| gst::FlowError::Error)?;
                let pts = buffer.pts().map(|t| Duration::from_nanos(t.nseconds())).unwrap_or_default();
                on_sample(Bytes::copy_from_slice(&map), pts);
                Ok(gst::FlowSuccess::Ok)
            })
            .build(),
    );
    Ok(appsink)
}

fn h264_output_capsfilter() -> anyhow::Result<gst::Element> {
    let caps = gst::Caps::builder("video/x-h264")
        .field("stream-format", "byte-stream")
        .field("alignment", "au")
        .build();
    ElementFactory::make("capsfilter")
        .property("caps", &caps)
        .build()
        .context("failed to create h264 output capsfilter")
}

/// `rtsp://…` — depayload/parse the camera's own H.264 stream, no re-encode.
fn build_rtsp_pipeline(
    url: &str,
    on_sample: impl Fn(Bytes, Duration) + Send + Sync + 'static,
) -> anyhow::Result<gst::Pipeline> {
    let pipeline = gst::Pipeline::new();
    let src = ElementFactory::make("rtspsrc")
        .property("location", url)
        .property_from_str("protocols", "tcp")
        .build()
        .context("failed to create rtspsrc")?;
    let depay = ElementFactory::make("rtph264depay")
        .build()
        .context("failed to create rtph264depay")?;
    let parse = ElementFactory::make("h264parse")
        .property_from_str("config-interval", "-1")
        .build()
        .context("failed to create h264parse")?;
    let capsfilter = h264_output_capsfilter()?;
    let appsink = make_appsink(on_sample)?;

    pipeline
        .add_many([&src, &depay, &parse, &capsfilter, appsink.upcast_ref()])
        .context("failed to add rtsp pipeline elements")?;
    gst::Element::link_many([&depay, &parse, &capsfilter, appsink.upcast_ref()])
        .context("failed to link rtsp pipeline")?;

    let depay_sink = depay
        .static_pad("sink")
        .context("rtph264depay has no sink pad")?;
    src.connect_pad_added(move |_, pad| {
        if let Err(e) = pad.link(&depay_sink) {
            tracing::warn!("failed to link rtspsrc pad: {e:?}");
        }
    });

    Ok(pipeline)
}

/// `/dev/video…` — local camera, captured raw and encoded in software since
/// the device does not expose H.264 directly.
fn build_v4l2_pipeline(
    device: &str,
    camera: &CameraConfig,
    on_sample: impl Fn(Bytes, Duration) + Send + Sync + 'static,
) -> anyhow::Result<gst::Pipeline> {
    let pipeline = gst::Pipeline::new();
    let src = ElementFactory::make("v4l2src")
        .property("device", device)
        .build()
        .context("failed to create v4l2src")?;
    let mut raw_caps_builder = gst::Caps::builder("video/x-raw")
        .field("format", "I420")
        .field("framerate", gst::Fraction::new(camera.fps as i32, 1));
    if let Some(width) = camera.video_width {
        raw_caps_builder = raw_caps_builder.field("width", width as i32);
    }
    if let Some(height) = camera.video_height {
        raw_caps_builder = raw_caps_builder.field("height", height as i32);
    }
    let raw_caps = raw_caps_builder.build();
    let src_caps = ElementFactory::make("capsfilter")
        .property("caps", &raw_caps)
        .build()
        .context("failed to create v4l2 capsfilter")?;
    let convert = ElementFactory::make("videoconvert")
        .build()
        .context("failed to create videoconvert")?;
    let encoder = ElementFactory::make("x264enc")
        .property_from_str("tune", "zerolatency")
        .property_from_str("speed-preset", "ultrafast")
        .property("key-int-max", (camera.fps * 2).max(1))
        .build()
        .context("failed to create x264enc")?;
    let parse = ElementFactory::make("h264parse")
        .property_from_str("config-interval", "-1")
        .build()
        .context("failed to create h264parse")?;
    let capsfilter = h264_output_capsfilter()?;
    let appsink = make_appsink(on_sample)?;

    pipeline
        .add_many([
            &src,
            &src_caps,
            &convert,
            &encoder,
            &parse,
            &capsfilter,
            appsink.upcast_ref(),
        ])
        .context("failed to add v4l2 pipeline elements")?;
    gst::Element::link_many([
        &src,
        &src_caps,
        &convert,
        &encoder,
        &parse,
        &capsfilter,
        appsink.upcast_ref(),
    ])
    .context("failed to link v4l2 pipeline")?;

    Ok(pipeline)
}

/// Anything else — auto-detected via `uridecodebin`, then software-encoded.
fn build_uridecodebin_pipeline(
    uri: &str,
    on_sample: impl Fn(Bytes, Duration) + Send + Sync + 'static,
) -> anyhow::Result<gst::Pipeline> {
    let pipeline = gst::Pipeline::new();
    let src = ElementFactory::make("uridecodebin")
        .property("uri", uri)
        .build()
        .context("failed to create uridecodebin")?;
    let convert = ElementFactory::make("videoconvert")
        .build()
        .context("failed to create videoconvert")?;
    let encoder = ElementFactory::make("x264enc")
        .property_from_str("tune", "zerolatency")
        .property_from_str("speed-preset", "ultrafast")
        .build()
        .context("failed to create x264enc")?;
    let parse = ElementFactory::make("h264parse")
        .property_from_str("config-interval", "-1")
        .build()
        .context("failed to create h264parse")?;
    let capsfilter = h264_output_capsfilter()?;
    let appsink = make_appsink(on_sample)?;

    pipeline
        .add_many([
            &src,
            &convert,
            &encoder,
            &parse,
            &capsfilter,
            appsink.upcast_ref(),
        ])
        .context("failed to add uridecodebin pipeline elements")?;
    gst::Element::link_many([&convert, &encoder, &parse, &capsfilter, appsink.upcast_ref()])
        .context("failed to link uridecodebin pipeline")?;

    let convert_sink = convert
        .static_pad("sink")
        .context("videoconvert has no sink pad")?;
    src.connect_pad_added(move |_, pad| {
        if pad.current_caps().is_some_and(|c| {
            c.structure(0)
                .is_some_and(|s| s.name().starts_with("video/"))
        }) && pad.link(&convert_sink).is_err()
        {
            tracing::warn!("failed to link uridecodebin pad");
        }
    });

    Ok(pipeline)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn remove_client_on_zero_count_is_a_no_op() {
        let source = SharedSource::new(
            "rtsp://203.0.113.1/stream".to_string(),
            CameraConfig::default(),
            "devabc".to_string(),
        );
        // No add_client was called; this must not panic or underflow.
        source.remove_client("viewer-a").await;
        let inner = source.inner.lock().await;
        assert_eq!(inner.active_clients, 0);
    }
}
