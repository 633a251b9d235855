use std::ffi::CString;
use std::mem::ManuallyDrop;
use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

use crate::allocator::Allocator;
use crate::config::EngineConfig;
use crate::deferred::DeferredQueue;
use crate::error::{Error, Result};
use crate::instance::{Instance, InstanceCreateInfo};
use crate::physical_device::{self, PhysicalDeviceInfo, QueueSelection, REQUIRED_DEVICE_EXTENSIONS};
use crate::surface::Surface;
use crate::swapchain::{AcquireOutcome, PresentOutcome, RetiredSwapchains, Swapchain, SwapchainOptions};
use crate::transfer::TransferEngine;

/// Per-image current layout. Shared (via `Arc`) between `Device` and
/// `TransferEngine`, which records its own layout transitions from the
/// background worker thread and is constructed before `Device` itself
/// exists, so it cannot simply borrow `Device`.
pub(crate) struct ImageLayoutTracker(Mutex<std::collections::HashMap<vk::Image, vk::ImageLayout>>);

impl ImageLayoutTracker {
    fn new() -> Self {
        Self(Mutex::new(std::collections::HashMap::new()))
    }

    pub(crate) fn get(&self, image: vk::Image) -> vk::ImageLayout {
        self.0.lock().get(&image).copied().unwrap_or(vk::ImageLayout::UNDEFINED)
    }

    pub(crate) fn set(&self, image: vk::Image, layout: vk::ImageLayout) {
        self.0.lock().insert(image, layout);
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SemaphoreType {
    Binary,
    Timeline,
}

/// Thin RAII wrapper over a `VkSemaphore`. Binary semaphores are used for
/// the acquire/present chain; one timeline semaphore paces frames-in-flight
/// so `Device` never waits on more GPU work than `in_flight_frames` allows.
pub struct Semaphore {
    device: ash::Device,
    pub raw: vk::Semaphore,
    pub semaphore_type: SemaphoreType,
}

impl Semaphore {
    fn new(device: ash::Device, semaphore_type: SemaphoreType) -> Result<Self> {
        let mut type_info = vk::SemaphoreTypeCreateInfo::default().semaphore_type(match semaphore_type {
            SemaphoreType::Binary => vk::SemaphoreType::BINARY,
            SemaphoreType::Timeline => vk::SemaphoreType::TIMELINE,
        });
        let info = vk::SemaphoreCreateInfo::default().push_next(&mut type_info);
        let raw = unsafe { device.create_semaphore(&info, None)? };
        Ok(Self { device, raw, semaphore_type })
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_semaphore(self.raw, None);
        }
    }
}

pub struct SemaphoreSubmit<'a> {
    pub semaphore: &'a Semaphore,
    pub stage_mask: vk::PipelineStageFlags2,
    pub value: Option<u64>,
}

/// One queue, plus the device handle needed to submit to it. All submission
/// to a given `VkQueue` must be externally synchronised, which is what the
/// `Mutex` on `Device::queue_graphics_present` provides — `Queue` itself is
/// cheap to clone and carries no lock.
#[derive(Clone)]
pub struct Queue {
    device: ash::Device,
    pub raw: vk::Queue,
    pub family_index: u32,
}

impl Queue {
    fn new(device: ash::Device, raw: vk::Queue, family_index: u32) -> Self {
        Self { device, raw, family_index }
    }

    pub fn submit2(
        &self,
        command_buffers: &[vk::CommandBuffer],
        wait: &[SemaphoreSubmit],
        signal: &[SemaphoreSubmit],
        fence: vk::Fence,
    ) -> Result<()> {
        let wait_infos: Vec<_> = wait
            .iter()
            .map(|w| {
                vk::SemaphoreSubmitInfo::default()
                    .semaphore(w.semaphore.raw)
                    .stage_mask(w.stage_mask)
                    .value(w.value.unwrap_or(0))
            })
            .collect();
        let signal_infos: Vec<_> = signal
            .iter()
            .map(|s| {
                vk::SemaphoreSubmitInfo::default()
                    .semaphore(s.semaphore.raw)
                    .stage_mask(s.stage_mask)
                    .value(s.value.unwrap_or(0))
            })
            .collect();
        let command_buffer_infos: Vec<_> = command_buffers
            .iter()
            .map(|cb| vk::CommandBufferSubmitInfo::default().command_buffer(*cb))
            .collect();

        let submit_info = vk::SubmitInfo2::default()
            .wait_semaphore_infos(&wait_infos)
            .signal_semaphore_infos(&signal_infos)
            .command_buffer_infos(&command_buffer_infos);

        unsafe {
            self.device
                .queue_submit2(self.raw, std::slice::from_ref(&submit_info), fence)?;
        }
        Ok(())
    }

    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.queue_wait_idle(self.raw)? };
        Ok(())
    }
}

struct FrameCounters {
    current: u64,
    absolute: u64,
}

/// Per-frame synchronisation slot: one command pool/buffer pair plus the
/// binary semaphores bracketing acquire and present, and a fence guarding
/// CPU reuse of the command buffer.
struct FrameSync {
    command_pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
    image_acquired: Semaphore,
    render_complete: Semaphore,
    in_flight_fence: vk::Fence,
}

/// Owns the logical device, the single graphics+present queue (and an
/// optional dedicated transfer queue), per-frame synchronisation slots, the
/// swapchain, the suballocator, and the deferred-release queue. Frame
/// pacing is driven by one timeline semaphore shared across all
/// frames-in-flight rather than per-frame fences alone, matching the
/// teacher's `semaphore_graphics_frame` scheme.
pub struct Device {
    pub(crate) raw: ash::Device,
    pub(crate) instance: Instance,
    pub(crate) surface: Surface,
    pub(crate) physical_device: PhysicalDeviceInfo,
    pub(crate) queue_families: QueueSelection,

    pub queue_graphics_present: Mutex<Queue>,
    pub queue_transfer: Option<Mutex<Queue>>,

    frame_timeline: Semaphore,
    frames: Vec<FrameSync>,
    frame_counters: Mutex<FrameCounters>,
    in_flight_frames: u64,

    pub swapchain: Mutex<Swapchain>,
    retired_swapchains: Mutex<RetiredSwapchains>,
    pub allocator: Arc<Allocator>,
    pub deferred: Arc<DeferredQueue>,
    /// Shared with `transfer` so its background worker can record its own
    /// layout transitions; see [`ImageLayoutTracker`].
    layout_tracker: Arc<ImageLayoutTracker>,
    /// Wrapped in `ManuallyDrop` so `Drop for Device` can tear it down
    /// (waiting on its queue, destroying its command pool) before
    /// `vkDestroyDevice` runs — ordinary field-drop order would destroy it
    /// afterward, against an already-destroyed device handle.
    pub transfer: ManuallyDrop<TransferEngine>,

    debug_utils_enabled: bool,
}

impl Device {
    pub fn new(
        window_handle: RawWindowHandle,
        display_handle: RawDisplayHandle,
        framebuffer_size: (u32, u32),
        config: &EngineConfig,
        app_name: &str,
    ) -> Result<Self> {
        let required_extensions = crate::instance::required_surface_extensions(display_handle)?;
        let instance = Instance::new(InstanceCreateInfo {
            required_extensions: &required_extensions,
            validation: config.validation,
            app_name,
        })?;

        let surface_raw = unsafe {
            ash_window::create_surface(instance.entry(), instance.raw(), display_handle, window_handle, None)
                .map_err(Error::SurfaceCreation)?
        };
        let surface = Surface::new(&instance, surface_raw);

        let surface_loader = ash::khr::surface::Instance::new(instance.entry(), instance.raw());
        let devices = unsafe { physical_device::enumerate(instance.raw(), &surface_loader, surface.raw)? };
        let selected = physical_device::select(
            &devices,
            REQUIRED_DEVICE_EXTENSIONS,
            config.preferred_device_name.as_deref(),
        )?
        .clone();
        log::info!("selected physical device: {}", selected.name);

        let queue_families = physical_device::select_queue_families(&selected, config.dedicated_transfer_queue)?;

        let raw = Self::create_logical_device(instance.raw(), &selected, &queue_families)?;

        let queue_graphics_present = unsafe { raw.get_device_queue(queue_families.graphics_present, 0) };
        let queue_graphics_present = Queue::new(raw.clone(), queue_graphics_present, queue_families.graphics_present);

        let queue_transfer = queue_families.dedicated_transfer.map(|family| {
            let queue = unsafe { raw.get_device_queue(family, 0) };
            Mutex::new(Queue::new(raw.clone(), queue, family))
        });

        let allocator = Arc::new(Allocator::new(instance.raw().clone(), raw.clone(), selected.raw)?);
        let deferred = Arc::new(DeferredQueue::new());
        let layout_tracker = Arc::new(ImageLayoutTracker::new());

        let (transfer_queue_raw, transfer_family) = match &queue_transfer {
            Some(queue) => (queue.lock().raw, queue.lock().family_index),
            None => (queue_graphics_present.raw, queue_families.graphics_present),
        };
        let transfer = TransferEngine::new(
            raw.clone(),
            allocator.clone(),
            transfer_queue_raw,
            transfer_family,
            &config.transfer_reserve,
            config.in_flight_frames,
            layout_tracker.clone(),
        )?;

        let swapchain = Swapchain::new(
            instance.raw(),
            raw.clone(),
            selected.raw,
            &surface,
            &SwapchainOptions {
                colour_format_preferences: config.colour_format_preferences.clone(),
                present_mode_preferences: config.present_mode_preferences.clone(),
                vsync: config.vsync,
            },
            framebuffer_size,
            None,
        )?;

        let frame_timeline = Semaphore::new(raw.clone(), SemaphoreType::Timeline)?;

        let mut frames = Vec::with_capacity(config.in_flight_frames as usize);
        for _ in 0..config.in_flight_frames {
            let pool_info = vk::CommandPoolCreateInfo::default()
                .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
                .queue_family_index(queue_families.graphics_present);
            let command_pool = unsafe { raw.create_command_pool(&pool_info, None)? };

            let alloc_info = vk::CommandBufferAllocateInfo::default()
                .command_pool(command_pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(1);
            let command_buffer = unsafe { raw.allocate_command_buffers(&alloc_info)?[0] };

            let fence_info = vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED);
            let in_flight_fence = unsafe { raw.create_fence(&fence_info, None)? };

            frames.push(FrameSync {
                command_pool,
                command_buffer,
                image_acquired: Semaphore::new(raw.clone(), SemaphoreType::Binary)?,
                render_complete: Semaphore::new(raw.clone(), SemaphoreType::Binary)?,
                in_flight_fence,
            });
        }

        Ok(Self {
            raw,
            instance,
            surface,
            physical_device: selected,
            queue_families,
            queue_graphics_present: Mutex::new(queue_graphics_present),
            queue_transfer,
            frame_timeline,
            frames,
            frame_counters: Mutex::new(FrameCounters { current: 0, absolute: 0 }),
            in_flight_frames: config.in_flight_frames as u64,
            swapchain: Mutex::new(swapchain),
            retired_swapchains: Mutex::new(RetiredSwapchains::new()),
            allocator,
            deferred,
            layout_tracker,
            transfer: ManuallyDrop::new(transfer),
            debug_utils_enabled: config.validation,
        })
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: &PhysicalDeviceInfo,
        queue_families: &QueueSelection,
    ) -> Result<ash::Device> {
        let mut family_indices = vec![queue_families.graphics_present];
        if let Some(transfer) = queue_families.dedicated_transfer {
            family_indices.push(transfer);
        }
        family_indices.sort_unstable();
        family_indices.dedup();

        let priorities = [1.0f32];
        let queue_create_infos: Vec<_> = family_indices
            .iter()
            .map(|&index| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(index)
                    .queue_priorities(&priorities)
            })
            .collect();

        let extension_names: Vec<CString> = REQUIRED_DEVICE_EXTENSIONS
            .iter()
            .map(|name| CString::new(*name).expect("extension name has no interior nul"))
            .collect();
        let extension_ptrs: Vec<*const i8> = extension_names.iter().map(|name| name.as_ptr()).collect();

        let mut vulkan12_features = vk::PhysicalDeviceVulkan12Features::default()
            .descriptor_indexing(true)
            .runtime_descriptor_array(true)
            .descriptor_binding_partially_bound(true)
            .descriptor_binding_variable_descriptor_count(true)
            .descriptor_binding_sampled_image_update_after_bind(true)
            .shader_sampled_image_array_non_uniform_indexing(true)
            .timeline_semaphore(true);
        let mut vulkan13_features = vk::PhysicalDeviceVulkan13Features::default()
            .dynamic_rendering(true)
            .synchronization2(true);

        let mut features2 = vk::PhysicalDeviceFeatures2::default();
        unsafe { instance.get_physical_device_features2(physical_device.raw, &mut features2) };
        let features2 = features2.push_next(&mut vulkan12_features).push_next(&mut vulkan13_features);

        let device_create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extension_ptrs)
            .push_next(&mut { features2 });

        Ok(unsafe { instance.create_device(physical_device.raw, &device_create_info, None)? })
    }

    fn current_frame_index(&self) -> usize {
        (self.frame_counters.lock().current % self.in_flight_frames) as usize
    }

    /// Waits for the frame sync slot about to be reused to finish its
    /// previous submission, resets its command pool, and acquires the next
    /// swapchain image. Handles OUT_OF_DATE by recreating the swapchain
    /// transparently and retrying once.
    pub fn frame_begin(&self, framebuffer_size: (u32, u32)) -> Result<AcquireOutcome> {
        let index = self.current_frame_index();
        let fence = self.frames[index].in_flight_fence;
        unsafe {
            self.raw.wait_for_fences(&[fence], true, u64::MAX)?;
            self.raw.reset_fences(&[fence])?;
            self.raw
                .reset_command_pool(self.frames[index].command_pool, vk::CommandPoolResetFlags::empty())?;
        }

        self.transfer.update()?;
        self.deferred.next_frame();
        self.retired_swapchains.lock().next_frame();

        let mut swapchain = self.swapchain.lock();
        let outcome = swapchain.acquire_next_image(self.frames[index].image_acquired.raw)?;

        match outcome {
            AcquireOutcome::OutOfDate => {
                self.recreate_swapchain(&mut swapchain, framebuffer_size)?;
                swapchain.acquire_next_image(self.frames[index].image_acquired.raw)
            }
            other => Ok(other),
        }
    }

    fn recreate_swapchain(&self, swapchain: &mut Swapchain, framebuffer_size: (u32, u32)) -> Result<()> {
        unsafe { self.raw.device_wait_idle()? };
        let options = SwapchainOptions {
            colour_format_preferences: Vec::new(),
            present_mode_preferences: Vec::new(),
            vsync: true,
        };
        let new_swapchain = Swapchain::new(
            self.instance.raw(),
            self.raw.clone(),
            self.physical_device.raw,
            &self.surface,
            &options,
            framebuffer_size,
            Some(&*swapchain),
        )?;
        let old = std::mem::replace(swapchain, new_swapchain);
        self.retired_swapchains.lock().retire(Arc::new(old));
        Ok(())
    }

    pub fn current_command_buffer(&self) -> vk::CommandBuffer {
        self.frames[self.current_frame_index()].command_buffer
    }

    pub fn submit_frame(&self, command_buffer: vk::CommandBuffer) -> Result<()> {
        let index = self.current_frame_index();
        let absolute_next = self.frame_counters.lock().absolute + 1;

        let wait = [SemaphoreSubmit {
            semaphore: &self.frames[index].image_acquired,
            stage_mask: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            value: None,
        }];
        let signal = [
            SemaphoreSubmit {
                semaphore: &self.frames[index].render_complete,
                stage_mask: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                value: None,
            },
            SemaphoreSubmit {
                semaphore: &self.frame_timeline,
                stage_mask: vk::PipelineStageFlags2::ALL_COMMANDS,
                value: Some(absolute_next),
            },
        ];

        self.queue_graphics_present
            .lock()
            .submit2(&[command_buffer], &wait, &signal, self.frames[index].in_flight_fence)
    }

    /// Presents the current image and advances frame counters. Recreation
    /// itself happens lazily on the next `frame_begin` that observes
    /// `OUT_OF_DATE`/`Suboptimal`; the deferred-release queue and the
    /// retired-swapchain grace period are ticked at the *start* of the next
    /// `frame_begin` instead of here, so a swapchain retired by this frame's
    /// recreate survives one full frame before its pop.
    pub fn frame_end(&self) -> Result<PresentOutcome> {
        let index = self.current_frame_index();
        let outcome = {
            let swapchain = self.swapchain.lock();
            swapchain.queue_present(
                self.queue_graphics_present.lock().raw,
                &[self.frames[index].render_complete.raw],
            )?
        };

        self.frame_counters.lock().advance();

        Ok(outcome)
    }

    /// Clones the underlying `ash::Device` handle for components (frame
    /// renderer, resource constructors) that need to issue their own Vulkan
    /// calls without borrowing `Device` itself. `ash::Device` is a thin
    /// `Arc`-backed wrapper, so cloning it is cheap.
    pub fn raw_handle(&self) -> ash::Device {
        self.raw.clone()
    }

    pub fn in_flight_frames(&self) -> u32 {
        self.in_flight_frames as u32
    }

    /// Upper bound on combined-image-sampler array capacity: the smaller of
    /// `maxDescriptorSetSamplers` and `maxPerStageDescriptorSamplers` for the
    /// selected physical device.
    pub fn max_sampler_count(&self) -> u32 {
        self.physical_device.max_sampler_count()
    }

    pub fn defer(&self, closure: impl FnOnce() + Send + 'static) {
        self.deferred.defer(self.in_flight_frames as u32, closure);
    }

    /// Tracked layout for `image`, or `UNDEFINED` if it has never passed
    /// through [`Device::record_image_layout`].
    pub fn image_layout(&self, image: vk::Image) -> vk::ImageLayout {
        self.layout_tracker.get(image)
    }

    /// Records `image`'s new layout. Called by the command-recording
    /// helpers right after they emit the barrier that performs the
    /// transition, so the map reflects what the next recorded barrier for
    /// this image will see as `old_layout`.
    pub(crate) fn record_image_layout(&self, image: vk::Image, layout: vk::ImageLayout) {
        self.layout_tracker.set(image, layout);
    }

    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.raw.device_wait_idle()? };
        Ok(())
    }

    /// Blocks until `future` resolves, driving `transfer.update()` in the
    /// meantime since nothing else ticks it outside the frame loop. Only
    /// meant for startup-time uploads (default textures, initial geometry)
    /// where no frame loop is running yet to drive that tick naturally.
    pub fn wait_transfer(&self, future: &crate::transfer::TransferFuture) -> Result<()> {
        while !future.is_ready() {
            self.transfer.update()?;
            if !future.is_ready() {
                std::thread::sleep(std::time::Duration::from_millis(1));
            }
        }
        Ok(())
    }

    /// Names a Vulkan object for validation/RenderDoc/Nsight, if debug-utils
    /// is active. A no-op otherwise — never fails the caller's operation.
    pub fn set_debug_name<T: vk::Handle>(&self, object: T, name: &str) {
        if !self.debug_utils_enabled {
            return;
        }
        let Some(debug_utils) = self.instance.debug_utils.as_ref() else {
            return;
        };
        let Ok(c_name) = CString::new(name) else {
            return;
        };
        let name_info = vk::DebugUtilsObjectNameInfoEXT::default()
            .object_handle(object)
            .object_name(&c_name);
        unsafe {
            let _ = debug_utils.set_debug_utils_object_name(&name_info);
        }
    }
}

impl FrameCounters {
    fn advance(&mut self) {
        self.current = self.current.wrapping_add(1);
        self.absolute += 1;
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        unsafe {
            let _ = self.raw.device_wait_idle();
        }
        // SAFETY: `transfer` is never accessed again after this point, and
        // `Device` is being dropped so nothing else can reach it through `self`.
        unsafe { ManuallyDrop::drop(&mut self.transfer) };
        self.deferred.flush();
        for frame in &self.frames {
            unsafe {
                self.raw.destroy_fence(frame.in_flight_fence, None);
                self.raw.destroy_command_pool(frame.command_pool, None);
            }
        }
        unsafe {
            self.raw.destroy_device(None);
        }
    }
}
