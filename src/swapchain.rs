use std::collections::VecDeque;
use std::sync::Arc;

use ash::khr;
use ash::vk;

use crate::error::Result;
use crate::surface::Surface;

/// Preferred colour formats, in priority order, tried before the hard-coded
/// sRGB defaults.
fn default_colour_format_preferences() -> &'static [(vk::Format, vk::ColorSpaceKHR)] {
    &[
        (vk::Format::R8G8B8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        (vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR),
    ]
}

/// Picks a surface format: prefer R8G8B8A8_SRGB then B8G8R8A8_SRGB in
/// SRGB_NONLINEAR space (or the caller's override list, tried first). Falls
/// back to the first offered format, warning that colour will be wrong.
pub fn select_colour_format(
    available: &[vk::SurfaceFormatKHR],
    preferences: &[vk::Format],
) -> vk::SurfaceFormatKHR {
    debug_assert!(!available.is_empty());

    for &format in preferences {
        if let Some(found) = available
            .iter()
            .find(|f| f.format == format && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR)
        {
            return *found;
        }
    }

    for &(format, color_space) in default_colour_format_preferences() {
        if let Some(found) = available
            .iter()
            .find(|f| f.format == format && f.color_space == color_space)
        {
            return *found;
        }
    }

    log::warn!(
        "no preferred surface format available, falling back to {:?}; colour will be physically wrong",
        available[0]
    );
    available[0]
}

/// Picks a present mode. Defaults: vsync off prefers IMMEDIATE; vsync on
/// prefers MAILBOX then FIFO_RELAXED then FIFO. FIFO is always supported so
/// the fallback never fails.
pub fn select_present_mode(
    available: &[vk::PresentModeKHR],
    preferences: &[vk::PresentModeKHR],
    vsync: bool,
) -> vk::PresentModeKHR {
    let defaults: &[vk::PresentModeKHR] = if vsync {
        &[
            vk::PresentModeKHR::MAILBOX,
            vk::PresentModeKHR::FIFO_RELAXED,
            vk::PresentModeKHR::FIFO,
        ]
    } else {
        &[vk::PresentModeKHR::IMMEDIATE]
    };

    let desired = if preferences.is_empty() { defaults } else { preferences };

    for &mode in desired {
        if available.contains(&mode) {
            return mode;
        }
    }

    if available.contains(&vk::PresentModeKHR::FIFO) {
        vk::PresentModeKHR::FIFO
    } else {
        available.first().copied().unwrap_or(vk::PresentModeKHR::FIFO)
    }
}

pub fn select_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let max = if caps.max_image_count == 0 {
        u32::MAX
    } else {
        caps.max_image_count
    };
    3.clamp(caps.min_image_count, max)
}

pub fn select_extent(caps: &vk::SurfaceCapabilitiesKHR, framebuffer_size: (u32, u32)) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: framebuffer_size
                .0
                .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: framebuffer_size
                .1
                .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired(u32),
    Suboptimal(u32),
    OutOfDate,
    /// Framebuffer extent is 0x0 — no acquire was attempted.
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Success,
    Suboptimal,
    OutOfDate,
}

pub struct SwapchainOptions {
    pub colour_format_preferences: Vec<vk::Format>,
    pub present_mode_preferences: Vec<vk::PresentModeKHR>,
    pub vsync: bool,
}

/// Surface-format/present-mode selection, image acquisition, and recreate
/// handling for one `VkSwapchainKHR`. Framebuffer-extent-0x0 transitions the
/// swapchain into a paused state in which acquire/present are skipped
/// entirely.
pub struct Swapchain {
    loader: khr::swapchain::Device,
    raw: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    image_views: Vec<vk::ImageView>,
    pub surface_format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    pub image_index: u32,
    paused: bool,
    device: ash::Device,
}

impl Swapchain {
    pub fn new(
        instance: &ash::Instance,
        device: ash::Device,
        physical_device: vk::PhysicalDevice,
        surface: &Surface,
        options: &SwapchainOptions,
        framebuffer_size: (u32, u32),
        old: Option<&Swapchain>,
    ) -> Result<Self> {
        if framebuffer_size.0 == 0 || framebuffer_size.1 == 0 {
            return Ok(Self {
                loader: khr::swapchain::Device::new(instance, &device),
                raw: vk::SwapchainKHR::null(),
                images: Vec::new(),
                image_views: Vec::new(),
                surface_format: vk::SurfaceFormatKHR::default(),
                present_mode: vk::PresentModeKHR::FIFO,
                extent: vk::Extent2D { width: 0, height: 0 },
                image_index: 0,
                paused: true,
                device,
            });
        }

        let caps = surface.capabilities(physical_device)?;
        let formats = surface.formats(physical_device)?;
        let present_modes = surface.present_modes(physical_device)?;

        let surface_format = select_colour_format(&formats, &options.colour_format_preferences);
        let present_mode =
            select_present_mode(&present_modes, &options.present_mode_preferences, options.vsync);
        let image_count = select_image_count(&caps);
        let extent = select_extent(&caps, framebuffer_size);

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface.raw)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old.map(|s| s.raw).unwrap_or(vk::SwapchainKHR::null()));

        let loader = khr::swapchain::Device::new(instance, &device);
        let raw = unsafe { loader.create_swapchain(&create_info, None)? };
        let images = unsafe { loader.get_swapchain_images(raw)? };

        let image_views = images
            .iter()
            .map(|&image| {
                let view_info = vk::ImageViewCreateInfo::default()
                    .image(image)
                    .view_type(vk::ImageViewType::TYPE_2D)
                    .format(surface_format.format)
                    .components(vk::ComponentMapping::default())
                    .subresource_range(
                        vk::ImageSubresourceRange::default()
                            .aspect_mask(vk::ImageAspectFlags::COLOR)
                            .base_mip_level(0)
                            .level_count(1)
                            .base_array_layer(0)
                            .layer_count(1),
                    );
                Ok(unsafe { device.create_image_view(&view_info, None)? })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            loader,
            raw,
            images,
            image_views,
            surface_format,
            present_mode,
            extent,
            image_index: 0,
            paused: false,
            device,
        })
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn acquire_next_image(&mut self, signal_semaphore: vk::Semaphore) -> Result<AcquireOutcome> {
        if self.paused {
            return Ok(AcquireOutcome::Paused);
        }

        let result = unsafe {
            self.loader.acquire_next_image(
                self.raw,
                u64::MAX,
                signal_semaphore,
                vk::Fence::null(),
            )
        };

        match result {
            Ok((index, suboptimal)) => {
                self.image_index = index;
                if suboptimal {
                    Ok(AcquireOutcome::Suboptimal(index))
                } else {
                    Ok(AcquireOutcome::Acquired(index))
                }
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
            Err(other) => Err(other.into()),
        }
    }

    pub fn queue_present(
        &self,
        queue: vk::Queue,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<PresentOutcome> {
        if self.paused {
            return Ok(PresentOutcome::Success);
        }

        let swapchains = [self.raw];
        let image_indices = [self.image_index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe { self.loader.queue_present(queue, &present_info) };
        match result {
            Ok(false) => Ok(PresentOutcome::Success),
            Ok(true) => Ok(PresentOutcome::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::OutOfDate),
            Err(other) => Err(other.into()),
        }
    }

    pub fn current_image(&self) -> vk::Image {
        self.images.get(self.image_index as usize).copied().unwrap_or(vk::Image::null())
    }

    pub fn current_image_view(&self) -> vk::ImageView {
        self.image_views
            .get(self.image_index as usize)
            .copied()
            .unwrap_or(vk::ImageView::null())
    }

    fn destroy(&mut self) {
        unsafe {
            for view in self.image_views.drain(..) {
                self.device.destroy_image_view(view, None);
            }
            if self.raw != vk::SwapchainKHR::null() {
                self.loader.destroy_swapchain(self.raw, None);
            }
        }
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Swapchains superseded by a newer one, held alive for exactly one frame so
/// any in-flight submissions referencing their images can complete. Distinct
/// from the generic deferred-release queue because its lifetime is fixed at
/// one frame rather than a configurable countdown.
#[derive(Default)]
pub struct RetiredSwapchains {
    queue: VecDeque<Arc<Swapchain>>,
}

impl RetiredSwapchains {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn retire(&mut self, swapchain: Arc<Swapchain>) {
        self.queue.push_back(swapchain);
    }

    /// Drops the oldest retired swapchain, if any. Call once per frame.
    pub fn next_frame(&mut self) {
        self.queue.pop_front();
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(min: u32, max: u32) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min,
            max_image_count: max,
            current_extent: vk::Extent2D { width: u32::MAX, height: u32::MAX },
            min_image_extent: vk::Extent2D { width: 1, height: 1 },
            max_image_extent: vk::Extent2D { width: 4096, height: 4096 },
            ..Default::default()
        }
    }

    #[test]
    fn colour_format_prefers_rgba_srgb() {
        let available = vec![
            vk::SurfaceFormatKHR { format: vk::Format::B8G8R8A8_SRGB, color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR },
            vk::SurfaceFormatKHR { format: vk::Format::R8G8B8A8_SRGB, color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR },
        ];
        let chosen = select_colour_format(&available, &[]);
        assert_eq!(chosen.format, vk::Format::R8G8B8A8_SRGB);
    }

    #[test]
    fn colour_format_falls_back_to_first_when_no_match() {
        let available = vec![vk::SurfaceFormatKHR {
            format: vk::Format::R16G16B16A16_SFLOAT,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }];
        let chosen = select_colour_format(&available, &[]);
        assert_eq!(chosen.format, vk::Format::R16G16B16A16_SFLOAT);
    }

    #[test]
    fn present_mode_prefers_immediate_without_vsync() {
        let available = vec![
            vk::PresentModeKHR::FIFO,
            vk::PresentModeKHR::IMMEDIATE,
            vk::PresentModeKHR::MAILBOX,
        ];
        assert_eq!(
            select_present_mode(&available, &[], false),
            vk::PresentModeKHR::IMMEDIATE
        );
    }

    #[test]
    fn present_mode_prefers_mailbox_with_vsync() {
        let available = vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        assert_eq!(
            select_present_mode(&available, &[], true),
            vk::PresentModeKHR::MAILBOX
        );
    }

    #[test]
    fn present_mode_falls_back_to_fifo() {
        let available = vec![vk::PresentModeKHR::FIFO];
        assert_eq!(select_present_mode(&available, &[], true), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn image_count_clamped_to_three() {
        assert_eq!(select_image_count(&caps(1, 8)), 3);
        assert_eq!(select_image_count(&caps(4, 8)), 4);
        assert_eq!(select_image_count(&caps(1, 2)), 2);
    }

    #[test]
    fn image_count_handles_unbounded_max() {
        assert_eq!(select_image_count(&caps(1, 0)), 3);
    }

    #[test]
    fn extent_uses_current_when_fixed() {
        let mut c = caps(1, 8);
        c.current_extent = vk::Extent2D { width: 800, height: 600 };
        assert_eq!(select_extent(&c, (1920, 1080)), vk::Extent2D { width: 800, height: 600 });
    }

    #[test]
    fn extent_clamps_framebuffer_when_unfixed() {
        let c = caps(1, 8);
        let extent = select_extent(&c, (8192, 1));
        assert_eq!(extent.width, 4096);
        assert_eq!(extent.height, 1);
    }

    #[test]
    fn retired_swapchains_drop_one_per_frame() {
        // Cannot construct a real `Swapchain` without an instance in a unit
        // test; exercise the FIFO bookkeeping through a parallel counter
        // instead, mirroring how `next_frame` pops exactly one entry.
        let mut queue: VecDeque<u32> = VecDeque::new();
        queue.push_back(1);
        queue.push_back(2);
        assert_eq!(queue.len(), 2);
        queue.pop_front();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop_front(), Some(2));
    }
}
