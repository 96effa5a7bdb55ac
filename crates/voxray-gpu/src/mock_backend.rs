//! Recording [`PresentBackend`] for exercising the frame protocol without a GPU.
//!
//! Handles are fabricated integers. Submissions complete when their fence is
//! waited on, which is the earliest a real device could be observed to finish
//! them. Binary semaphores carry a signaled flag: a wait consumes the signal,
//! and waiting on an unsignaled semaphore or signaling a signaled one is a
//! mistake. Protocol mistakes are collected as violations instead of panicking
//! so tests can assert on them.

use crate::error::{GpuError, Result};
use crate::present::{PresentBackend, SwapchainConfig};
use crate::surface::SurfaceCapabilities;
use ash::vk::{self, Handle};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;

/// Scripted outcome for the next acquire, submit or present.
#[derive(Debug, Clone, Copy)]
pub enum MockResult {
    Suboptimal,
    Error(vk::Result),
}

#[derive(Debug)]
struct Submission {
    cmd: u64,
    fence: u64,
    completed: bool,
}

/// Shared state, reachable after the backend has been moved into a manager.
#[derive(Debug, Default)]
pub struct MockTracker {
    next_handle: u64,
    swapchains: HashSet<u64>,
    views: HashSet<u64>,
    /// Semaphore handle to signaled state.
    semaphores: HashMap<u64, bool>,
    /// Semaphore signaled by the latest submission for each image.
    image_signals: HashMap<u32, u64>,
    command_buffers: HashSet<u64>,
    /// Fence handle to signaled state.
    fences: HashMap<u64, bool>,
    submissions: Vec<Submission>,
    violations: Vec<String>,
}

impl MockTracker {
    fn fabricate(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn violation(&mut self, message: String) {
        self.violations.push(message);
    }

    fn signal_semaphore(&mut self, semaphore: vk::Semaphore, by: &str) {
        let raw = semaphore.as_raw();
        match self.semaphores.get(&raw).copied() {
            Some(true) => {
                self.violation(format!("{by} signaled {semaphore:?} which was already signaled"));
            }
            Some(false) => {
                self.semaphores.insert(raw, true);
            }
            None => self.violation(format!("{by} signaled unknown semaphore {semaphore:?}")),
        }
    }

    fn wait_semaphore(&mut self, semaphore: vk::Semaphore, by: &str) {
        let raw = semaphore.as_raw();
        match self.semaphores.get(&raw).copied() {
            Some(true) => {
                self.semaphores.insert(raw, false);
            }
            Some(false) => self.violation(format!("{by} waited on {semaphore:?} which nothing signaled")),
            None => self.violation(format!("{by} waited on unknown semaphore {semaphore:?}")),
        }
    }

    fn pending(&self, cmd: u64) -> bool {
        self.submissions.iter().any(|s| s.cmd == cmd && !s.completed)
    }

    pub fn live_objects(&self) -> usize {
        self.swapchains.len()
            + self.views.len()
            + self.semaphores.len()
            + self.command_buffers.len()
            + self.fences.len()
    }
}

pub struct MockBackend {
    tracker: Rc<RefCell<MockTracker>>,
    capabilities: SurfaceCapabilities,
    image_count: usize,
    acquire_order: Vec<u32>,
    acquire_cursor: usize,
    last_acquired: Option<u32>,
    acquire_results: VecDeque<MockResult>,
    submit_results: VecDeque<MockResult>,
    present_results: VecDeque<MockResult>,
}

impl MockBackend {
    pub fn new() -> Self {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 8,
            current_extent: vk::Extent2D {
                width: 800,
                height: 600,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
            ..Default::default()
        };

        Self {
            tracker: Rc::default(),
            capabilities: SurfaceCapabilities {
                capabilities,
                formats: vec![
                    vk::SurfaceFormatKHR {
                        format: vk::Format::B8G8R8A8_UNORM,
                        color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                    },
                    vk::SurfaceFormatKHR {
                        format: vk::Format::B8G8R8A8_SRGB,
                        color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                    },
                ],
                present_modes: vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX],
            },
            image_count: 3,
            acquire_order: Vec::new(),
            acquire_cursor: 0,
            last_acquired: None,
            acquire_results: VecDeque::new(),
            submit_results: VecDeque::new(),
            present_results: VecDeque::new(),
        }
    }

    pub fn with_image_count(mut self, count: usize) -> Self {
        self.set_image_count(count);
        self
    }

    /// Cycle through these image indices instead of round-robin.
    pub fn with_acquire_order(mut self, order: Vec<u32>) -> Self {
        self.acquire_order = order;
        self
    }

    pub fn with_current_extent(mut self, width: u32, height: u32) -> Self {
        self.set_current_extent(width, height);
        self
    }

    /// Surface lets the swapchain pick any extent in `[min, max]`.
    pub fn with_free_extent(mut self, min: vk::Extent2D, max: vk::Extent2D) -> Self {
        self.capabilities.capabilities.current_extent = vk::Extent2D {
            width: u32::MAX,
            height: u32::MAX,
        };
        self.capabilities.capabilities.min_image_extent = min;
        self.capabilities.capabilities.max_image_extent = max;
        self
    }

    pub fn set_image_count(&mut self, count: usize) {
        self.image_count = count;
    }

    pub fn set_current_extent(&mut self, width: u32, height: u32) {
        self.capabilities.capabilities.current_extent = vk::Extent2D { width, height };
    }

    pub fn push_acquire_result(&mut self, result: MockResult) {
        self.acquire_results.push_back(result);
    }

    pub fn push_submit_result(&mut self, result: MockResult) {
        self.submit_results.push_back(result);
    }

    pub fn push_present_result(&mut self, result: MockResult) {
        self.present_results.push_back(result);
    }

    pub fn tracker(&self) -> Rc<RefCell<MockTracker>> {
        Rc::clone(&self.tracker)
    }

    pub fn violations(&self) -> Vec<String> {
        self.tracker.borrow().violations.clone()
    }

    pub fn submissions(&self) -> usize {
        self.tracker.borrow().submissions.len()
    }

    pub fn live_objects(&self) -> usize {
        self.tracker.borrow().live_objects()
    }

    pub fn live_views(&self) -> usize {
        self.tracker.borrow().views.len()
    }

    pub fn live_semaphores(&self) -> usize {
        self.tracker.borrow().semaphores.len()
    }

    pub fn live_fences(&self) -> usize {
        self.tracker.borrow().fences.len()
    }

    pub fn live_command_buffers(&self) -> usize {
        self.tracker.borrow().command_buffers.len()
    }

    pub fn all_fences_signaled(&self) -> bool {
        self.tracker.borrow().fences.values().all(|&signaled| signaled)
    }
}

impl PresentBackend for MockBackend {
    fn surface_capabilities(&self) -> Result<SurfaceCapabilities> {
        Ok(self.capabilities.clone())
    }

    fn create_swapchain(
        &mut self,
        _config: &SwapchainConfig,
        _old: vk::SwapchainKHR,
    ) -> Result<vk::SwapchainKHR> {
        let mut tracker = self.tracker.borrow_mut();
        let handle = tracker.fabricate();
        tracker.swapchains.insert(handle);
        tracker.image_signals.clear();
        self.acquire_cursor = 0;
        self.last_acquired = None;
        Ok(vk::SwapchainKHR::from_raw(handle))
    }

    fn swapchain_images(&self, _swapchain: vk::SwapchainKHR) -> Result<Vec<vk::Image>> {
        let mut tracker = self.tracker.borrow_mut();
        Ok((0..self.image_count)
            .map(|_| vk::Image::from_raw(tracker.fabricate()))
            .collect())
    }

    fn destroy_swapchain(&mut self, swapchain: vk::SwapchainKHR) {
        let mut tracker = self.tracker.borrow_mut();
        if !tracker.swapchains.remove(&swapchain.as_raw()) {
            tracker.violation(format!("destroyed unknown swapchain {swapchain:?}"));
        }
    }

    fn create_image_view(&mut self, _image: vk::Image, _format: vk::Format) -> Result<vk::ImageView> {
        let mut tracker = self.tracker.borrow_mut();
        let handle = tracker.fabricate();
        tracker.views.insert(handle);
        Ok(vk::ImageView::from_raw(handle))
    }

    fn destroy_image_view(&mut self, view: vk::ImageView) {
        let mut tracker = self.tracker.borrow_mut();
        if !tracker.views.remove(&view.as_raw()) {
            tracker.violation(format!("destroyed unknown view {view:?}"));
        }
    }

    fn create_semaphore(&mut self) -> Result<vk::Semaphore> {
        let mut tracker = self.tracker.borrow_mut();
        let handle = tracker.fabricate();
        tracker.semaphores.insert(handle, false);
        Ok(vk::Semaphore::from_raw(handle))
    }

    fn destroy_semaphore(&mut self, semaphore: vk::Semaphore) {
        let mut tracker = self.tracker.borrow_mut();
        if tracker.semaphores.remove(&semaphore.as_raw()).is_none() {
            tracker.violation(format!("destroyed unknown semaphore {semaphore:?}"));
        }
    }

    fn create_fence(&mut self, signaled: bool) -> Result<vk::Fence> {
        let mut tracker = self.tracker.borrow_mut();
        let handle = tracker.fabricate();
        tracker.fences.insert(handle, signaled);
        Ok(vk::Fence::from_raw(handle))
    }

    fn destroy_fence(&mut self, fence: vk::Fence) {
        let mut tracker = self.tracker.borrow_mut();
        let raw = fence.as_raw();
        if tracker.submissions.iter().any(|s| s.fence == raw && !s.completed) {
            tracker.violation(format!("destroyed fence {fence:?} with pending work"));
        }
        if tracker.fences.remove(&raw).is_none() {
            tracker.violation(format!("destroyed unknown fence {fence:?}"));
        }
    }

    fn wait_for_fence(&mut self, fence: vk::Fence) -> Result<()> {
        let mut tracker = self.tracker.borrow_mut();
        let raw = fence.as_raw();
        let mut completed_any = false;
        for submission in tracker.submissions.iter_mut().filter(|s| s.fence == raw) {
            completed_any |= !submission.completed;
            submission.completed = true;
        }

        match tracker.fences.get(&raw).copied() {
            Some(true) => Ok(()),
            Some(false) if completed_any => {
                tracker.fences.insert(raw, true);
                Ok(())
            }
            Some(false) => {
                tracker.violation(format!("waited on fence {fence:?} that can never signal"));
                Err(GpuError::Vulkan(vk::Result::TIMEOUT))
            }
            None => {
                tracker.violation(format!("waited on unknown fence {fence:?}"));
                Err(GpuError::Vulkan(vk::Result::ERROR_UNKNOWN))
            }
        }
    }

    fn reset_fence(&mut self, fence: vk::Fence) -> Result<()> {
        let mut tracker = self.tracker.borrow_mut();
        let raw = fence.as_raw();
        if tracker.submissions.iter().any(|s| s.fence == raw && !s.completed) {
            tracker.violation(format!("reset fence {fence:?} with pending work"));
        }
        tracker.fences.insert(raw, false);
        Ok(())
    }

    fn allocate_command_buffers(&mut self, count: u32) -> Result<Vec<vk::CommandBuffer>> {
        let mut tracker = self.tracker.borrow_mut();
        Ok((0..count)
            .map(|_| {
                let handle = tracker.fabricate();
                tracker.command_buffers.insert(handle);
                vk::CommandBuffer::from_raw(handle)
            })
            .collect())
    }

    fn free_command_buffers(&mut self, buffers: &[vk::CommandBuffer]) {
        let mut tracker = self.tracker.borrow_mut();
        for cmd in buffers {
            let raw = cmd.as_raw();
            if tracker.pending(raw) {
                tracker.violation(format!("freed pending command buffer {cmd:?}"));
            }
            tracker.command_buffers.remove(&raw);
        }
    }

    fn begin_command_buffer(&mut self, cmd: vk::CommandBuffer) -> Result<()> {
        let mut tracker = self.tracker.borrow_mut();
        if tracker.pending(cmd.as_raw()) {
            tracker.violation(format!("reset command buffer {cmd:?} while pending"));
        }
        Ok(())
    }

    fn end_command_buffer(&mut self, _cmd: vk::CommandBuffer) -> Result<()> {
        Ok(())
    }

    fn acquire_next_image(
        &mut self,
        _swapchain: vk::SwapchainKHR,
        signal: vk::Semaphore,
    ) -> Result<(u32, bool)> {
        match self.acquire_results.pop_front() {
            Some(MockResult::Suboptimal) => {
                // A suboptimal acquire still hands out an image
                self.tracker.borrow_mut().signal_semaphore(signal, "acquire");
                self.last_acquired = Some(0);
                return Ok((0, true));
            }
            Some(MockResult::Error(code)) => return Err(GpuError::Vulkan(code)),
            None => {}
        }

        let index = if self.acquire_order.is_empty() {
            self.acquire_cursor % self.image_count
        } else {
            self.acquire_order[self.acquire_cursor % self.acquire_order.len()] as usize
        };
        self.acquire_cursor += 1;
        let index = u32::try_from(index).map_err(|_| GpuError::Vulkan(vk::Result::ERROR_UNKNOWN))?;
        self.tracker.borrow_mut().signal_semaphore(signal, "acquire");
        self.last_acquired = Some(index);
        Ok((index, false))
    }

    fn submit(
        &mut self,
        cmd: vk::CommandBuffer,
        wait: vk::Semaphore,
        signal: vk::Semaphore,
        fence: vk::Fence,
    ) -> Result<()> {
        if let Some(result) = self.submit_results.pop_front() {
            return match result {
                MockResult::Suboptimal => Ok(()),
                MockResult::Error(code) => Err(GpuError::Vulkan(code)),
            };
        }

        let mut tracker = self.tracker.borrow_mut();
        let raw_fence = fence.as_raw();
        if tracker.fences.get(&raw_fence).copied() != Some(false) {
            tracker.violation(format!("submitted with fence {fence:?} not reset"));
        }
        tracker.wait_semaphore(wait, "submit");
        tracker.signal_semaphore(signal, "submit");
        match self.last_acquired {
            Some(image) => {
                tracker.image_signals.insert(image, signal.as_raw());
            }
            None => tracker.violation("submitted before any image was acquired".to_string()),
        }
        tracker.submissions.push(Submission {
            cmd: cmd.as_raw(),
            fence: raw_fence,
            completed: false,
        });
        Ok(())
    }

    fn present(
        &mut self,
        _swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> Result<bool> {
        let mut tracker = self.tracker.borrow_mut();
        if tracker.image_signals.get(&image_index) != Some(&wait.as_raw()) {
            tracker.violation(format!(
                "present of image {image_index} waited on {wait:?}, not the semaphore its submission signaled"
            ));
        }

        let result = self.present_results.pop_front();
        // Out-of-date and surface-lost presents still execute their waits
        let waits = match result {
            None | Some(MockResult::Suboptimal) => true,
            Some(MockResult::Error(code)) => matches!(
                code,
                vk::Result::ERROR_OUT_OF_DATE_KHR | vk::Result::ERROR_SURFACE_LOST_KHR
            ),
        };
        if waits {
            tracker.wait_semaphore(wait, "present");
        }

        match result {
            Some(MockResult::Suboptimal) => Ok(true),
            Some(MockResult::Error(code)) => Err(GpuError::Vulkan(code)),
            None => Ok(false),
        }
    }

    fn wait_idle(&mut self) -> Result<()> {
        let mut tracker = self.tracker.borrow_mut();
        let mut signaled = Vec::new();
        for submission in &mut tracker.submissions {
            submission.completed = true;
            signaled.push(submission.fence);
        }
        for fence in signaled {
            if let Some(state) = tracker.fences.get_mut(&fence) {
                *state = true;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_swapped_submit_semaphores() {
        let mut backend = MockBackend::new();
        let swapchain = backend.create_swapchain(&dummy_config(), vk::SwapchainKHR::null()).unwrap();
        let acquired = backend.create_semaphore().unwrap();
        let render_finished = backend.create_semaphore().unwrap();
        let fence = backend.create_fence(false).unwrap();
        let cmd = backend.allocate_command_buffers(1).unwrap()[0];

        let (index, _) = backend.acquire_next_image(swapchain, acquired).unwrap();
        backend.submit(cmd, render_finished, acquired, fence).unwrap();
        backend.present(swapchain, index, render_finished).unwrap();

        let violations = backend.violations();
        assert!(violations.iter().any(|v| v.contains("nothing signaled")), "{violations:?}");
        assert!(violations.iter().any(|v| v.contains("already signaled")), "{violations:?}");
    }

    #[test]
    fn flags_present_waiting_on_wrong_semaphore() {
        let mut backend = MockBackend::new();
        let swapchain = backend.create_swapchain(&dummy_config(), vk::SwapchainKHR::null()).unwrap();
        let acquired = backend.create_semaphore().unwrap();
        let render_finished = backend.create_semaphore().unwrap();
        let other = backend.create_semaphore().unwrap();
        let fence = backend.create_fence(false).unwrap();
        let cmd = backend.allocate_command_buffers(1).unwrap()[0];

        let (index, _) = backend.acquire_next_image(swapchain, acquired).unwrap();
        backend.submit(cmd, acquired, render_finished, fence).unwrap();
        assert!(backend.violations().is_empty());

        backend.present(swapchain, index, other).unwrap();
        let violations = backend.violations();
        assert!(violations.iter().any(|v| v.contains("not the semaphore")), "{violations:?}");
    }

    #[test]
    fn correct_chain_has_no_violations() {
        let mut backend = MockBackend::new();
        let swapchain = backend.create_swapchain(&dummy_config(), vk::SwapchainKHR::null()).unwrap();
        let acquired = backend.create_semaphore().unwrap();
        let render_finished = backend.create_semaphore().unwrap();
        let fence = backend.create_fence(true).unwrap();
        let cmd = backend.allocate_command_buffers(1).unwrap()[0];

        for _ in 0..3 {
            backend.wait_for_fence(fence).unwrap();
            backend.reset_fence(fence).unwrap();
            let (index, _) = backend.acquire_next_image(swapchain, acquired).unwrap();
            backend.begin_command_buffer(cmd).unwrap();
            backend.submit(cmd, acquired, render_finished, fence).unwrap();
            backend.present(swapchain, index, render_finished).unwrap();
        }
        assert!(backend.violations().is_empty(), "{:?}", backend.violations());
    }

    fn dummy_config() -> SwapchainConfig {
        SwapchainConfig {
            surface_format: vk::SurfaceFormatKHR::default(),
            present_mode: vk::PresentModeKHR::FIFO,
            extent: vk::Extent2D { width: 800, height: 600 },
            image_count: 3,
            pre_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
        }
    }
}
