//! Candidate filtering and photo selection.

use rand::Rng;

use crate::config::{Config, SelectionPolicy};
use crate::photos::MediaItem;

/// Size and orientation constraints on wallpaper candidates.
///
/// Items whose dimensions are unknown always pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CandidateFilter {
    /// 0 disables the width check.
    pub minimum_width: u32,
    pub horizontal_only: bool,
}

impl CandidateFilter {
    pub fn from_config(config: &Config) -> Self {
        Self {
            minimum_width: config.minimum_picture_width,
            horizontal_only: config.horizontal_only,
        }
    }

    pub fn accepts(&self, item: &MediaItem) -> bool {
        if self.minimum_width > 0 {
            if let Some(width) = item.width {
                if width < self.minimum_width {
                    return false;
                }
            }
        }
        if self.horizontal_only {
            if let (Some(width), Some(height)) = (item.width, item.height) {
                if width < height {
                    return false;
                }
            }
        }
        true
    }

    /// Keeps the accepted items, preserving album order.
    pub fn apply(&self, items: Vec<MediaItem>) -> Vec<MediaItem> {
        items.into_iter().filter(|item| self.accepts(item)).collect()
    }
}

/// Outcome of picking from a candidate list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    /// Position in the filtered list.
    pub index: usize,
    /// New `last_picked_index` to persist; `None` for random picks.
    pub advance_to: Option<i64>,
}

/// Picks one of `count` filtered candidates, or `None` when there are none.
///
/// Sequential picks continue after `last_picked` and wrap around, so an
/// index left over from a larger album still lands in range.
pub fn select<R: Rng + ?Sized>(
    count: usize,
    policy: SelectionPolicy,
    last_picked: i64,
    rng: &mut R,
) -> Option<Selection> {
    if count == 0 {
        return None;
    }
    match policy {
        SelectionPolicy::Random => Some(Selection {
            index: rng.random_range(0..count),
            advance_to: None,
        }),
        SelectionPolicy::Sequential => {
            let next = last_picked.saturating_add(1).rem_euclid(count as i64);
            Some(Selection {
                index: next as usize,
                advance_to: Some(next),
            })
        }
    }
}
