// SPDX-License-Identifier: CEPL-1.0
//! Frames in flight.
//!
//! Each slot cycles `Idle -> Recording -> Submitted` and returns to `Idle`
//! once its fence is waited on at the top of the next `begin` that lands on
//! it, which gives exactly `MAX_FRAMES_IN_FLIGHT` frames of pipelining.

use ash::vk;
use tracing::{debug, warn};

use crate::error::VkResult;
use crate::gpu::{Acquire, Gpu, Present, SlotSync, SwapchainTargets};

pub const MAX_FRAMES_IN_FLIGHT: usize = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Recording,
    Submitted,
}

#[derive(Clone, Copy, Debug)]
struct FrameSlot {
    sync: SlotSync,
    state: SlotState,
    image_index: u32,
}

/// The frame currently being recorded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ActiveFrame {
    pub slot: usize,
    pub image_index: u32,
    pub cmd: vk::CommandBuffer,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Begin {
    Frame(ActiveFrame),
    /// The surface is out of date; rebuild and skip this frame.
    Stale,
    /// A frame is already being recorded.
    Busy,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum End {
    Presented,
    Stale,
    /// Nothing was being recorded.
    Idle,
}

#[derive(Default)]
pub struct FrameScheduler {
    slots: Vec<FrameSlot>,
    current: usize,
    images_in_flight: Vec<Option<vk::Fence>>,
    last_submitted: Option<usize>,
    frames: u64,
}

impl FrameScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create<G: Gpu>(&mut self, gpu: &mut G, image_count: usize) -> VkResult<()> {
        for _ in 0..MAX_FRAMES_IN_FLIGHT {
            let sync = gpu.create_frame_slot()?;
            self.slots.push(FrameSlot { sync, state: SlotState::Idle, image_index: 0 });
        }
        self.images_in_flight = vec![None; image_count];
        self.current = 0;
        self.last_submitted = None;
        Ok(())
    }

    /// Caller must have waited for the device to go idle.
    pub fn destroy<G: Gpu>(&mut self, gpu: &mut G) {
        for slot in self.slots.drain(..) {
            gpu.destroy_frame_slot(slot.sync);
        }
        self.images_in_flight.clear();
        self.last_submitted = None;
    }

    pub fn current_slot(&self) -> usize {
        self.current
    }

    pub fn slot_state(&self, slot: usize) -> Option<SlotState> {
        self.slots.get(slot).map(|s| s.state)
    }

    pub fn frames_submitted(&self) -> u64 {
        self.frames
    }

    pub fn active(&self) -> Option<ActiveFrame> {
        let slot = self.slots.get(self.current)?;
        (slot.state == SlotState::Recording).then_some(ActiveFrame {
            slot: self.current,
            image_index: slot.image_index,
            cmd: slot.sync.cmd,
        })
    }

    pub fn begin<G: Gpu>(&mut self, gpu: &mut G, targets: &SwapchainTargets) -> VkResult<Begin> {
        let Some(slot) = self.slots.get(self.current).copied() else {
            return Ok(Begin::Stale);
        };
        if slot.state == SlotState::Recording {
            warn!("begin_frame while slot {} is recording", self.current);
            return Ok(Begin::Busy);
        }

        let fence = slot.sync.in_flight;
        gpu.wait_fence(fence)?;
        self.slots[self.current].state = SlotState::Idle;

        let index = match gpu.acquire_next_image(targets.swapchain, slot.sync.image_available)? {
            Acquire::OutOfDate => {
                debug!("acquire: surface out of date");
                return Ok(Begin::Stale);
            }
            Acquire::Image { index, suboptimal } => {
                if suboptimal {
                    debug!("acquire: suboptimal image {index}");
                }
                index
            }
        };

        if let Some(owner) = self.images_in_flight.get(index as usize).copied().flatten() {
            if owner != fence {
                gpu.wait_fence(owner)?;
            }
        }
        if let Some(entry) = self.images_in_flight.get_mut(index as usize) {
            *entry = Some(fence);
        }

        gpu.reset_streams(self.current);
        if let Err(e) = gpu.begin_commands(slot.sync.cmd) {
            self.recover_slot(gpu);
            return Err(e);
        }

        let state = &mut self.slots[self.current];
        state.state = SlotState::Recording;
        state.image_index = index;
        Ok(Begin::Frame(ActiveFrame { slot: self.current, image_index: index, cmd: slot.sync.cmd }))
    }

    /// Ends, submits and presents the recording slot, then advances.
    pub fn end<G: Gpu>(&mut self, gpu: &mut G, targets: &SwapchainTargets) -> VkResult<End> {
        let Some(slot) = self.slots.get(self.current).copied() else {
            return Ok(End::Idle);
        };
        if slot.state != SlotState::Recording {
            warn!("end_frame without a recording slot");
            return Ok(End::Idle);
        }

        // The fence stays signalled until the submit that will signal it again.
        let submitted = gpu
            .end_commands(slot.sync.cmd)
            .and_then(|()| gpu.reset_fence(slot.sync.in_flight))
            .and_then(|()| gpu.submit(&slot.sync));
        if let Err(e) = submitted {
            self.recover_slot(gpu);
            return Err(e);
        }
        self.slots[self.current].state = SlotState::Submitted;
        self.last_submitted = Some(self.current);
        self.frames += 1;

        let presented = gpu.present(targets.swapchain, slot.image_index, slot.sync.render_finished)?;
        self.current = (self.current + 1) % self.slots.len();
        Ok(match presented {
            Present::Presented => End::Presented,
            Present::Stale => End::Stale,
        })
    }

    /// Returns the current slot to `Idle` after a failed begin or submit.
    ///
    /// The acquire semaphore was signalled with nothing waiting on it and the
    /// fence may be unsignalled, so the slot gets fresh sync objects. If that
    /// fails too the old objects are kept.
    fn recover_slot<G: Gpu>(&mut self, gpu: &mut G) {
        let Some(slot) = self.slots.get_mut(self.current) else {
            return;
        };
        slot.state = SlotState::Idle;
        let old = slot.sync;
        match gpu.create_frame_slot() {
            Ok(fresh) => {
                slot.sync = fresh;
                for entry in &mut self.images_in_flight {
                    if *entry == Some(old.in_flight) {
                        *entry = None;
                    }
                }
                if self.last_submitted == Some(self.current) {
                    self.last_submitted = None;
                }
                gpu.destroy_frame_slot(old);
                warn!("frame slot {} rebuilt after a failed recording or submit", self.current);
            }
            Err(e) => warn!("frame slot {} could not be rebuilt: {e}", self.current),
        }
    }

    /// True once the most recently submitted frame has finished on the GPU.
    pub fn video_sync<G: Gpu>(&self, gpu: &G) -> bool {
        let Some(slot) = self.last_submitted.and_then(|i| self.slots.get(i)) else {
            return true;
        };
        match gpu.fence_signaled(slot.sync.in_flight) {
            Ok(done) => done,
            Err(e) => {
                warn!("fence status query failed: {e}");
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swapchain::SwapchainManager;
    use crate::testing::MockGpu;

    fn setup() -> (MockGpu, SwapchainTargets, FrameScheduler) {
        let mut gpu = MockGpu::new();
        let mut sc = SwapchainManager::new(vk::Extent2D { width: 800, height: 600 }, 1);
        sc.create(&mut gpu).unwrap();
        let targets = sc.targets().cloned().unwrap();
        let mut frames = FrameScheduler::new();
        frames.create(&mut gpu, targets.images.len()).unwrap();
        (gpu, targets, frames)
    }

    fn run_frame(gpu: &mut MockGpu, t: &SwapchainTargets, f: &mut FrameScheduler) -> ActiveFrame {
        let Begin::Frame(active) = f.begin(gpu, t).unwrap() else { panic!("no frame") };
        assert_eq!(f.end(gpu, t).unwrap(), End::Presented);
        active
    }

    #[test]
    fn slots_rotate_and_block_on_reuse() {
        let (mut gpu, t, mut f) = setup();
        let a = run_frame(&mut gpu, &t, &mut f);
        let b = run_frame(&mut gpu, &t, &mut f);
        assert_ne!(a.slot, b.slot);
        assert_eq!(gpu.blocking_waits, 0);
        assert_eq!(f.slot_state(a.slot), Some(SlotState::Submitted));

        // Third frame lands on the first slot whose GPU work never finished.
        let c = run_frame(&mut gpu, &t, &mut f);
        assert_eq!(c.slot, a.slot);
        assert!(gpu.blocking_waits >= 1);
    }

    #[test]
    fn wait_precedes_recording() {
        let (mut gpu, t, mut f) = setup();
        run_frame(&mut gpu, &t, &mut f);
        run_frame(&mut gpu, &t, &mut f);
        gpu.calls.clear();
        run_frame(&mut gpu, &t, &mut f);
        let wait = gpu.position("wait_fence").unwrap();
        let begin = gpu.position("begin_commands").unwrap();
        let reset = gpu.position("reset_fence").unwrap();
        let submit = gpu.position("submit").unwrap();
        assert!(wait < begin && begin < reset && reset < submit);
    }

    #[test]
    fn failed_submit_leaves_the_scheduler_usable() {
        let (mut gpu, t, mut f) = setup();
        let Begin::Frame(first) = f.begin(&mut gpu, &t).unwrap() else { panic!("no frame") };
        gpu.fail_submit = true;
        assert!(f.end(&mut gpu, &t).is_err());
        gpu.fail_submit = false;

        assert_eq!(f.slot_state(first.slot), Some(SlotState::Idle));
        assert!(!gpu.is_live(first.cmd));
        assert!(f.video_sync(&gpu));
        let mut slots = Vec::new();
        for _ in 0..3 {
            slots.push(run_frame(&mut gpu, &t, &mut f).slot);
        }
        assert_eq!(slots[0], first.slot);
        assert_eq!(gpu.count("submit"), 4);
    }

    #[test]
    fn failed_begin_keeps_the_fence_signalled() {
        let (mut gpu, t, mut f) = setup();
        gpu.fail_begin_commands = true;
        assert!(f.begin(&mut gpu, &t).is_err());
        gpu.fail_begin_commands = false;
        assert_eq!(gpu.count("reset_fence"), 0);
        assert_eq!(f.slot_state(0), Some(SlotState::Idle));

        let active = run_frame(&mut gpu, &t, &mut f);
        assert_eq!(active.slot, 0);
        assert_eq!(gpu.blocking_waits, 0);
    }

    #[test]
    fn out_of_date_acquire_abandons_before_recording() {
        let (mut gpu, t, mut f) = setup();
        gpu.acquire_script.push_back(Acquire::OutOfDate);
        assert_eq!(f.begin(&mut gpu, &t).unwrap(), Begin::Stale);
        assert_eq!(gpu.count("begin_commands"), 0);
        assert_eq!(gpu.count("reset_fence"), 0);
        assert_eq!(f.slot_state(0), Some(SlotState::Idle));
        assert_eq!(f.end(&mut gpu, &t).unwrap(), End::Idle);
        assert_eq!(gpu.count("submit"), 0);
    }

    #[test]
    fn suboptimal_acquire_still_records() {
        let (mut gpu, t, mut f) = setup();
        gpu.acquire_script.push_back(Acquire::Image { index: 0, suboptimal: true });
        gpu.present_script.push_back(Present::Stale);
        assert!(matches!(f.begin(&mut gpu, &t).unwrap(), Begin::Frame(_)));
        assert_eq!(f.end(&mut gpu, &t).unwrap(), End::Stale);
    }

    #[test]
    fn image_owned_by_other_slot_is_waited_on() {
        let (mut gpu, t, mut f) = setup();
        gpu.acquire_script.push_back(Acquire::Image { index: 1, suboptimal: false });
        gpu.acquire_script.push_back(Acquire::Image { index: 1, suboptimal: false });
        run_frame(&mut gpu, &t, &mut f);
        gpu.calls.clear();
        run_frame(&mut gpu, &t, &mut f);
        // Own slot fence, then the fence of the slot that last used image 1.
        assert_eq!(gpu.count("wait_fence"), 2);
        assert_eq!(gpu.blocking_waits, 1);
    }

    #[test]
    fn double_begin_and_stray_end_are_ignored() {
        let (mut gpu, t, mut f) = setup();
        assert!(matches!(f.begin(&mut gpu, &t).unwrap(), Begin::Frame(_)));
        assert_eq!(f.begin(&mut gpu, &t).unwrap(), Begin::Busy);
        assert_eq!(f.end(&mut gpu, &t).unwrap(), End::Presented);
        assert_eq!(f.end(&mut gpu, &t).unwrap(), End::Idle);
        assert_eq!(gpu.count("submit"), 1);
    }

    #[test]
    fn video_sync_tracks_last_submission() {
        let (mut gpu, t, mut f) = setup();
        assert!(f.video_sync(&gpu));
        run_frame(&mut gpu, &t, &mut f);
        assert!(!f.video_sync(&gpu));
        gpu.complete_all();
        assert!(f.video_sync(&gpu));
    }

    #[test]
    fn destroy_releases_sync_objects() {
        let (mut gpu, t, mut f) = setup();
        let active = run_frame(&mut gpu, &t, &mut f);
        gpu.wait_idle();
        f.destroy(&mut gpu);
        assert!(!gpu.is_live(active.cmd));
        assert!(f.active().is_none());
    }
}
