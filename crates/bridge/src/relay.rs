use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{Mutex, Notify, broadcast};

use crate::h264::h264_contains_idr;

/// One H.264 Annex-B access unit pulled from the appsink.
#[derive(Debug, Clone)]
pub(crate) struct Frame {
    pub data: Bytes,
    pub pts: Duration,
}

#[derive(Debug, Error)]
pub(crate) enum TrackError {
    #[error("upstream track ended")]
    TrackEnded,
}

/// Fan-out point for the relay path: every subscriber gets an independent
/// receiver that drops frames under backpressure instead of blocking the
/// producer or accumulating a backlog.
pub(crate) struct RelayTrack {
    tx: broadcast::Sender<Frame>,
}

impl RelayTrack {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish a frame to every current subscriber. A send error just means
    /// there are no subscribers right now, which is expected between
    /// viewers.
    pub fn publish(&self, frame: Frame) {
        let _ = self.tx.send(frame);
    }

    pub fn subscribe(&self) -> RelaySubscription {
        RelaySubscription {
            rx: self.tx.subscribe(),
            seen_keyframe: false,
        }
    }
}

/// A single viewer's subscription to the relay. Waits for the next keyframe
/// boundary before forwarding its first frame so a late-joining viewer does
/// not start mid-GOP.
pub(crate) struct RelaySubscription {
    rx: broadcast::Receiver<Frame>,
    seen_keyframe: bool,
}

impl RelaySubscription {
    pub async fn recv(&mut self) -> Result<Frame, TrackError> {
        loop {
            match self.rx.recv().await {
                Ok(frame) => {
                    if !self.seen_keyframe {
                        if h264_contains_idr(&frame.data) {
                            self.seen_keyframe = true;
                        } else {
                            continue;
                        }
                    }
                    return Ok(frame);
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return Err(TrackError::TrackEnded),
            }
        }
    }
}

/// One-slot overwrite-on-write mailbox: a background task keeps the slot at
/// the latest frame, and `recv` always returns the current slot without
/// blocking on prior readers.
pub(crate) struct NonBufferedTrack {
    slot: Mutex<Option<Frame>>,
    notify: Notify,
    ended: AtomicBool,
}

impl NonBufferedTrack {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            notify: Notify::new(),
            ended: AtomicBool::new(false),
        }
    }

    pub async fn set(&self, frame: Frame) {
        *self.slot.lock().await = Some(frame);
        self.notify.notify_waiters();
    }

    pub fn mark_ended(&self) {
        self.ended.store(true, Ordering::Relaxed);
        self.notify.notify_waiters();
    }

    pub async fn recv(&self) -> Result<Frame, TrackError> {
        loop {
            // Register for the next notification before checking the slot,
            // so a set()/mark_ended() racing this check is never missed.
            let notified = self.notify.notified();
            if let Some(frame) = self.slot.lock().await.clone() {
                return Ok(frame);
            }
            if self.ended.load(Ordering::Relaxed) {
                return Err(TrackError::TrackEnded);
            }
            notified.await;
        }
    }
}

impl Default for NonBufferedTrack {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idr_frame() -> Frame {
        Frame {
            data: Bytes::from_static(&[0x00, 0x00, 0x00, 0x01, 0x65, 0xAB]),
            pts: Duration::from_millis(0),
        }
    }

    fn non_idr_frame() -> Frame {
        Frame {
            data: Bytes::from_static(&[0x00, 0x00, 0x00, 0x01, 0x61, 0xAB]),
            pts: Duration::from_millis(33),
        }
    }

    #[tokio::test]
    async fn non_buffered_recv_blocks_until_first_frame() {
        let track = NonBufferedTrack::new();
        let timed_out = tokio::time::timeout(Duration::from_millis(20), track.recv()).await;
        assert!(timed_out.is_err());
        track.set(idr_frame()).await;
        let frame = track.recv().await.unwrap();
        assert_eq!(frame.data.len(), 6);
    }

    #[tokio::test]
    async fn non_buffered_overwrites_older_frame() {
        let track = NonBufferedTrack::new();
        track.set(idr_frame()).await;
        track.set(non_idr_frame()).await;
        let frame = track.recv().await.unwrap();
        assert_eq!(frame.pts, Duration::from_millis(33));
    }

    #[tokio::test]
    async fn non_buffered_recv_fails_after_ended() {
        let track = NonBufferedTrack::new();
        track.mark_ended();
        assert!(matches!(track.recv().await, Err(TrackError::TrackEnded)));
    }

    #[tokio::test]
    async fn relay_subscriber_waits_for_first_keyframe() {
        let relay = RelayTrack::new(8);
        let mut sub = relay.subscribe();
        relay.publish(non_idr_frame());
        relay.publish(idr_frame());
        relay.publish(non_idr_frame());
        let first = sub.recv().await.unwrap();
        assert!(h264_contains_idr(&first.data));
        let second = sub.recv().await.unwrap();
        assert!(!h264_contains_idr(&second.data));
    }

    #[tokio::test]
    async fn relay_subscriber_sees_closed_after_all_senders_dropped() {
        let relay = RelayTrack::new(4);
        let mut sub = relay.subscribe();
        drop(relay);
        assert!(matches!(sub.recv().await, Err(TrackError::TrackEnded)));
    }
}
