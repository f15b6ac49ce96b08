use super::frame_table::{Frame, FrameTable};
use alloc::sync::Arc;

pub trait PageReplacementPolicy: Send {
    /// Chooses a victim among the frames in `frames` and claims it for
    /// eviction. Returns `None` if no frame can be evicted.
    fn evict_page(&mut self, frames: &FrameTable) -> Option<Arc<Frame>>;
}

/// Second-chance replacement: the hand sweeps the frames in allocation order,
/// skipping pinned frames and clearing accessed bits, and evicts the first
/// frame none of whose pages were accessed since the last sweep.
#[derive(Debug, Default)]
pub struct Clock {
    /// Clock position of the next frame to inspect.
    hand: u64,
}

impl Clock {
    pub const fn new() -> Self {
        Self { hand: 0 }
    }
}

impl PageReplacementPolicy for Clock {
    fn evict_page(&mut self, frames: &FrameTable) -> Option<Arc<Frame>> {
        // Two full sweeps clear every accessed bit and then revisit every
        // frame, so anything not found by then is pinned.
        let budget = 2 * frames.len() + 1;

        for _ in 0..budget {
            let frame = frames.frame_at_or_after(self.hand)?;
            self.hand = frame.seq() + 1;

            if frame.is_pinned() || frame.is_evicting() {
                continue;
            }
            if frame.take_second_chance() {
                continue;
            }
            if frame.try_claim() {
                return Some(frame);
            }
        }

        None
    }
}
