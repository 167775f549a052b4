use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::info;

use super::error::NegotiationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// Ideal capture resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoConstraints {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: Option<VideoConstraints>,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: Some(VideoConstraints {
                width: 1280,
                height: 720,
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTrack {
    pub id: String,
    pub kind: TrackKind,
}

/// Granted local stream: the tracks to attach to the peer connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalMedia {
    pub stream_id: String,
    pub tracks: Vec<LocalTrack>,
}

impl LocalMedia {
    pub fn has(&self, kind: TrackKind) -> bool {
        self.tracks.iter().any(|t| t.kind == kind)
    }
}

/// One encoded frame, ready to packetize.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaFrame {
    pub data: Bytes,
    pub duration: Duration,
}

/// Paced feed of encoded frames for one local track.
#[async_trait]
pub trait FrameSource: Send {
    /// Next frame, once it is due. `None` ends the feed.
    async fn next_frame(&mut self) -> Option<MediaFrame>;
}

/// Source of local audio/video. Acquisition may suspend (permission prompt,
/// device start-up) and may be denied.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalMedia, NegotiationError>;

    /// Frames for a granted track. `None` attaches the track without samples,
    /// in which case the remote side never sees it.
    fn frames(&self, _track: &LocalTrack) -> Option<Box<dyn FrameSource>> {
        None
    }
}

/// Opus packet holding 20 ms of silence.
const OPUS_SILENCE: [u8; 3] = [0xf8, 0xff, 0xfe];

/// VP8 key frame header for a 2x2 picture with empty partitions.
const VP8_BLANK_KEY_FRAME: [u8; 10] = [0x10, 0x00, 0x00, 0x9d, 0x01, 0x2a, 0x02, 0x00, 0x02, 0x00];

/// Repeats one frame at its own duration.
pub struct PlaceholderFrames {
    frame: MediaFrame,
    ticker: Option<Interval>,
}

impl PlaceholderFrames {
    pub fn new(frame: MediaFrame) -> Self {
        Self {
            frame,
            ticker: None,
        }
    }

    /// Silence for audio, a blank picture at 30 fps for video.
    pub fn for_kind(kind: TrackKind) -> Self {
        let frame = match kind {
            TrackKind::Audio => MediaFrame {
                data: Bytes::from_static(&OPUS_SILENCE),
                duration: Duration::from_millis(20),
            },
            TrackKind::Video => MediaFrame {
                data: Bytes::from_static(&VP8_BLANK_KEY_FRAME),
                duration: Duration::from_millis(33),
            },
        };
        Self::new(frame)
    }
}

#[async_trait]
impl FrameSource for PlaceholderFrames {
    async fn next_frame(&mut self) -> Option<MediaFrame> {
        let period = self.frame.duration;
        let ticker = self.ticker.get_or_insert_with(|| {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker
        });
        ticker.tick().await;
        Some(self.frame.clone())
    }
}

/// Grants tracks for the device kinds present on this host and keeps them
/// fed with silence and blank video until a capture pipeline takes over.
#[derive(Debug, Clone)]
pub struct DeviceInventory {
    audio: bool,
    video: bool,
}

impl DeviceInventory {
    pub fn new(audio: bool, video: bool) -> Self {
        Self { audio, video }
    }
}

#[async_trait]
impl MediaSource for DeviceInventory {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalMedia, NegotiationError> {
        if !constraints.audio && constraints.video.is_none() {
            return Err(NegotiationError::MediaAcquisitionDenied(
                "no audio or video requested".to_string(),
            ));
        }
        if constraints.audio && !self.audio {
            return Err(NegotiationError::MediaAcquisitionDenied(
                "no audio input device".to_string(),
            ));
        }
        if constraints.video.is_some() && !self.video {
            return Err(NegotiationError::MediaAcquisitionDenied(
                "no video input device".to_string(),
            ));
        }

        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(LocalTrack {
                id: "audio".to_string(),
                kind: TrackKind::Audio,
            });
        }
        if let Some(video) = constraints.video {
            info!("Capturing video at {}x{}", video.width, video.height);
            tracks.push(LocalTrack {
                id: "video".to_string(),
                kind: TrackKind::Video,
            });
        }

        Ok(LocalMedia {
            stream_id: "duet".to_string(),
            tracks,
        })
    }

    fn frames(&self, track: &LocalTrack) -> Option<Box<dyn FrameSource>> {
        Some(Box::new(PlaceholderFrames::for_kind(track.kind)))
    }
}
