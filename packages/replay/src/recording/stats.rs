// packages/replay/src/recording/stats.rs
//! Per-view replay statistics

use serde::Serialize;
use std::collections::VecDeque;

/// Only the most recent views are tracked
pub const MAX_TRACKED_VIEWS: usize = 10;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ViewReplayStats {
    pub segments_count: u32,
    pub records_count: u32,
    pub segments_total_raw_size: usize,
}

#[derive(Debug, Default)]
pub struct ReplayStats {
    views: VecDeque<(String, ViewReplayStats)>,
}

impl ReplayStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, view_id: &str) -> Option<ViewReplayStats> {
        self.views
            .iter()
            .find(|(id, _)| id == view_id)
            .map(|(_, stats)| *stats)
    }

    /// Segments started so far for the view; used as the next index in view
    pub fn segments_count(&self, view_id: &str) -> u32 {
        self.get(view_id).map_or(0, |stats| stats.segments_count)
    }

    pub fn add_segment(&mut self, view_id: &str) {
        self.entry(view_id).segments_count += 1;
    }

    pub fn add_record(&mut self, view_id: &str) {
        self.entry(view_id).records_count += 1;
    }

    pub fn add_wrote_data(&mut self, view_id: &str, additional_raw_bytes: usize) {
        self.entry(view_id).segments_total_raw_size += additional_raw_bytes;
    }

    pub fn tracked_views(&self) -> usize {
        self.views.len()
    }

    fn entry(&mut self, view_id: &str) -> &mut ViewReplayStats {
        let index = match self.views.iter().position(|(id, _)| id == view_id) {
            Some(index) => index,
            None => {
                self.views
                    .push_back((view_id.to_string(), ViewReplayStats::default()));
                if self.views.len() > MAX_TRACKED_VIEWS {
                    self.views.pop_front();
                }
                self.views.len() - 1
            }
        };

        &mut self.views[index].1
    }
}
