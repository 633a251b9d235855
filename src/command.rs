use ash::vk;

use crate::device::Device;
use crate::error::Result;
use crate::resource::{Buffer, DescriptorSet, Image, Pipeline};

/// Thin wrapper around a raw `VkCommandPool`. Frame sync slots and the
/// transfer engine each own one.
pub struct CommandPool {
    device: ash::Device,
    pub raw: vk::CommandPool,
}

impl CommandPool {
    pub fn new(device: ash::Device, queue_family_index: u32) -> Result<Self> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(queue_family_index);
        let raw = unsafe { device.create_command_pool(&create_info, None)? };
        Ok(Self { device, raw })
    }

    pub fn allocate(&self, level: vk::CommandBufferLevel, count: u32) -> Result<Vec<vk::CommandBuffer>> {
        let allocate_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.raw)
            .level(level)
            .command_buffer_count(count);
        Ok(unsafe { self.device.allocate_command_buffers(&allocate_info)? })
    }

    pub fn reset(&self) -> Result<()> {
        unsafe { self.device.reset_command_pool(self.raw, vk::CommandPoolResetFlags::empty())? };
        Ok(())
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        unsafe { self.device.destroy_command_pool(self.raw, None) };
    }
}

/// Records into one primary command buffer. Does not own the buffer's
/// lifetime — the owning pool destroys it when the pool itself is
/// destroyed — this is a recording handle, not a resource.
pub struct CommandBuffer {
    device: ash::Device,
    pub raw: vk::CommandBuffer,
    bound_pipeline: Option<vk::Pipeline>,
}

impl CommandBuffer {
    pub fn new(device: ash::Device, raw: vk::CommandBuffer) -> Self {
        Self { device, raw, bound_pipeline: None }
    }

    pub fn begin(&mut self) -> Result<()> {
        self.bound_pipeline = None;
        let begin_info = vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.device.begin_command_buffer(self.raw, &begin_info)? };
        Ok(())
    }

    pub fn end(&self) -> Result<()> {
        unsafe { self.device.end_command_buffer(self.raw)? };
        Ok(())
    }

    pub fn begin_rendering(
        &self,
        colour_attachments: &[vk::RenderingAttachmentInfo],
        depth_attachment: Option<&vk::RenderingAttachmentInfo>,
        render_area: vk::Rect2D,
    ) {
        let empty_depth = vk::RenderingAttachmentInfo::default();
        let rendering_info = vk::RenderingInfo::default()
            .color_attachments(colour_attachments)
            .depth_attachment(depth_attachment.unwrap_or(&empty_depth))
            .render_area(render_area)
            .layer_count(1);
        unsafe { self.device.cmd_begin_rendering(self.raw, &rendering_info) };
    }

    pub fn end_rendering(&self) {
        unsafe { self.device.cmd_end_rendering(self.raw) };
    }

    pub fn set_viewport(&self, viewport: vk::Viewport) {
        unsafe { self.device.cmd_set_viewport(self.raw, 0, std::slice::from_ref(&viewport)) };
    }

    pub fn set_scissor(&self, scissor: vk::Rect2D) {
        unsafe { self.device.cmd_set_scissor(self.raw, 0, std::slice::from_ref(&scissor)) };
    }

    pub fn pipeline_image_barrier(&self, barriers: &[vk::ImageMemoryBarrier2]) {
        let dependency_info = vk::DependencyInfo::default().image_memory_barriers(barriers);
        unsafe { self.device.cmd_pipeline_barrier2(self.raw, &dependency_info) };
    }

    /// Binds `pipeline` unless it is already bound — the frame renderer
    /// relies on this to skip redundant binds across consecutive drawables
    /// sharing a pipeline.
    pub fn bind_pipeline_graphics(&mut self, pipeline: &Pipeline) {
        if self.bound_pipeline == Some(pipeline.raw) {
            return;
        }
        unsafe {
            self.device.cmd_bind_pipeline(self.raw, vk::PipelineBindPoint::GRAPHICS, pipeline.raw);
        }
        self.bound_pipeline = Some(pipeline.raw);
    }

    pub fn bind_descriptor_sets_graphics(&self, pipeline: &Pipeline, sets: &[&DescriptorSet]) {
        let raw_sets: Vec<_> = sets.iter().map(|set| set.raw).collect();
        unsafe {
            self.device.cmd_bind_descriptor_sets(
                self.raw,
                vk::PipelineBindPoint::GRAPHICS,
                pipeline.layout,
                0,
                &raw_sets,
                &[],
            );
        }
    }

    pub fn bind_vertex_buffers(&self, first_binding: u32, buffers: &[&Buffer], offsets: &[u64]) {
        let raw_buffers: Vec<_> = buffers.iter().map(|buffer| buffer.raw).collect();
        unsafe {
            self.device.cmd_bind_vertex_buffers(self.raw, first_binding, &raw_buffers, offsets);
        }
    }

    pub fn bind_index_buffer(&self, buffer: &Buffer, offset: u64, index_type: vk::IndexType) {
        unsafe {
            self.device.cmd_bind_index_buffer(self.raw, buffer.raw, offset, index_type);
        }
    }

    /// Binds a vertex buffer by raw handle. Meshes referenced by a draw
    /// submission contract carry raw handles rather than owned `Buffer`s —
    /// the mesh cache backing them is an embedder concern, outside this
    /// crate.
    pub fn bind_vertex_buffer_raw(&self, first_binding: u32, buffer: vk::Buffer, offset: u64) {
        unsafe {
            self.device.cmd_bind_vertex_buffers(self.raw, first_binding, &[buffer], &[offset]);
        }
    }

    pub fn bind_index_buffer_raw(&self, buffer: vk::Buffer, offset: u64, index_type: vk::IndexType) {
        unsafe {
            self.device.cmd_bind_index_buffer(self.raw, buffer, offset, index_type);
        }
    }

    pub fn draw(&self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32) {
        unsafe {
            self.device.cmd_draw(self.raw, vertex_count, instance_count, first_vertex, first_instance);
        }
    }

    pub fn draw_indexed(
        &self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        unsafe {
            self.device
                .cmd_draw_indexed(self.raw, index_count, instance_count, first_index, vertex_offset, first_instance);
        }
    }

    /// Transitions `image`'s full colour subresource range from `old` to
    /// `new`, synchronising on `src`/`dst` stage and access masks, and
    /// records the transition into `device`'s layout-tracking map.
    #[allow(clippy::too_many_arguments)]
    pub fn transition_image(
        &self,
        device: &Device,
        image: &Image,
        old: vk::ImageLayout,
        new: vk::ImageLayout,
        src_stage: vk::PipelineStageFlags2,
        src_access: vk::AccessFlags2,
        dst_stage: vk::PipelineStageFlags2,
        dst_access: vk::AccessFlags2,
    ) {
        let aspect = if crate::resource::format_has_depth(image.format) {
            vk::ImageAspectFlags::DEPTH
        } else {
            vk::ImageAspectFlags::COLOR
        };
        let barrier = vk::ImageMemoryBarrier2::default()
            .src_stage_mask(src_stage)
            .src_access_mask(src_access)
            .dst_stage_mask(dst_stage)
            .dst_access_mask(dst_access)
            .old_layout(old)
            .new_layout(new)
            .image(image.raw)
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(aspect)
                    .base_mip_level(0)
                    .level_count(vk::REMAINING_MIP_LEVELS)
                    .base_array_layer(0)
                    .layer_count(vk::REMAINING_ARRAY_LAYERS),
            );
        self.pipeline_image_barrier(std::slice::from_ref(&barrier));
        device.record_image_layout(image.raw, new);
    }

    /// Transitions a raw swapchain image handle — swapchain images are not
    /// wrapped in `Image` since the swapchain, not the allocator, owns them
    /// — and records the transition into `device`'s layout-tracking map.
    #[allow(clippy::too_many_arguments)]
    pub fn transition_raw_image(
        &self,
        device: &Device,
        raw_image: vk::Image,
        old: vk::ImageLayout,
        new: vk::ImageLayout,
        src_stage: vk::PipelineStageFlags2,
        src_access: vk::AccessFlags2,
        dst_stage: vk::PipelineStageFlags2,
        dst_access: vk::AccessFlags2,
    ) {
        let barrier = vk::ImageMemoryBarrier2::default()
            .src_stage_mask(src_stage)
            .src_access_mask(src_access)
            .dst_stage_mask(dst_stage)
            .dst_access_mask(dst_access)
            .old_layout(old)
            .new_layout(new)
            .image(raw_image)
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .base_mip_level(0)
                    .level_count(1)
                    .base_array_layer(0)
                    .layer_count(1),
            );
        self.pipeline_image_barrier(std::slice::from_ref(&barrier));
        device.record_image_layout(raw_image, new);
    }
}
