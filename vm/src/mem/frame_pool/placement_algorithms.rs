//! Placement policies for the core map.

use super::CoreMapEntry;
use core::ops::Range;

/// Chooses which free frames an allocation receives.
pub trait PlacementAlgorithm: Default + Send {
    /// Returns the frame numbers to hand out, or `None` if no run of
    /// `frames_requested` free frames exists.
    fn place(&mut self, core_map: &[CoreMapEntry], frames_requested: usize)
        -> Option<Range<usize>>;
}

/// Length of the free run starting at `start`, capped at `limit`.
fn free_run(core_map: &[CoreMapEntry], start: usize, limit: usize) -> usize {
    core_map[start..]
        .iter()
        .take(limit)
        .take_while(|entry| !entry.allocated())
        .count()
}

/// Resumes searching where the previous allocation ended, which spreads
/// consecutive faults across the pool instead of hammering the low frames.
#[derive(Default)]
pub struct NextFit {
    position: usize,
}

#[derive(Default)]
pub struct FirstFit;

impl PlacementAlgorithm for NextFit {
    fn place(
        &mut self,
        core_map: &[CoreMapEntry],
        frames_requested: usize,
    ) -> Option<Range<usize>> {
        let total = core_map.len();
        if frames_requested == 0 || frames_requested > total {
            return None;
        }

        // Try every start position once, beginning at the saved position.
        let mut checked = 0;
        let mut start = self.position % total;
        while checked < total {
            if start + frames_requested > total {
                checked += total - start;
                start = 0;
                continue;
            }

            let run = free_run(core_map, start, frames_requested);
            if run == frames_requested {
                self.position = (start + run) % total;
                return Some(start..start + run);
            }
            checked += run + 1;
            start += run + 1;
        }

        None
    }
}

impl PlacementAlgorithm for FirstFit {
    fn place(
        &mut self,
        core_map: &[CoreMapEntry],
        frames_requested: usize,
    ) -> Option<Range<usize>> {
        if frames_requested == 0 {
            return None;
        }

        let mut start = 0;
        while start + frames_requested <= core_map.len() {
            let run = free_run(core_map, start, frames_requested);
            if run == frames_requested {
                return Some(start..start + run);
            }
            start += run + 1;
        }

        None
    }
}
