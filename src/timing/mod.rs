pub mod idr;
pub mod pdt_map;

use dashmap::DashMap;
use self::idr::IdrTimeline;
use self::pdt_map::PtsPdtMapper;
use std::sync::Arc;

/// Per-channel timing state: PTS↔PDT calibration plus the IDR timeline.
///
/// Both are fed by the segmenter contract (`POST /timeline/{channel}`) and
/// read by the rewrite pipeline. Access is serialized per channel with a
/// mutex; the feed and the playlist path touch it briefly.
#[derive(Default)]
pub struct ChannelTiming {
    pub mapper: PtsPdtMapper,
    pub idr: IdrTimeline,
}

/// Registry of per-channel timing state.
#[derive(Clone, Default)]
pub struct TimingRegistry {
    channels: Arc<DashMap<String, Arc<tokio::sync::Mutex<ChannelTiming>>>>,
}

impl TimingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the timing state for a channel.
    pub fn channel(&self, channel_id: &str) -> Arc<tokio::sync::Mutex<ChannelTiming>> {
        self.channels
            .entry(channel_id.to_string())
            .or_default()
            .clone()
    }
}
