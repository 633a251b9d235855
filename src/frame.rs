use std::sync::Arc;

use ash::vk;

use crate::command::CommandBuffer;
use crate::descriptor::{DescriptorProvisioner, DirLight, ObjectBlock, ViewBlock};
use crate::device::Device;
use crate::error::Result;
use crate::resource::{DescriptorSet, Image, ImageDescriptor, Pipeline};
use crate::swapchain::AcquireOutcome;

/// Mesh reference consumed by a drawable: vertex buffer, optional index
/// buffer, and how many indices/vertices to draw.
#[derive(Clone, Copy)]
pub struct Mesh {
    pub vertex_buffer: vk::Buffer,
    pub index_buffer: Option<vk::Buffer>,
    pub index_type: vk::IndexType,
    /// Index count if indexed, vertex count otherwise.
    pub count: u32,
}

pub struct Drawable {
    pub mesh: Mesh,
    pub pipeline: Arc<Pipeline>,
    /// This drawable's entry in the frame's object storage-buffer array.
    /// The array index it lands at (draw order within the frame) is passed
    /// to the shader as `gl_InstanceIndex` rather than via a descriptor
    /// rebind per drawable.
    pub object: ObjectBlock,
}

/// A viewport/scissor pair plus the drawables recorded under them. The
/// frame renderer binds each drawable's pipeline (skipping redundant binds
/// via the command buffer's pipeline cache) and issues its draw call.
pub struct Batch {
    pub viewport: vk::Viewport,
    pub scissor: vk::Rect2D,
    pub drawables: Vec<Drawable>,
    /// If present, prepended ahead of `drawables` and expected to carry a
    /// pipeline with depth-write disabled.
    pub skybox: Option<Drawable>,
}

/// A batch rendered with an orthographic projection and a depth range
/// independent of 3D batches — e.g. UI overlays.
pub struct UiBatch(pub Batch);

/// The built-in [`Subpass`]: records the scene layer's batch/drawable draw
/// submission contract (§4.5's "what the renderer consumes from the scene
/// layer") against the frame's shared descriptor set. Most callers use this
/// directly rather than implementing `Subpass` themselves; a caller with
/// genuinely different recording needs (e.g. a compute prepass) implements
/// `Subpass` on its own type instead.
pub struct SceneSubpass {
    pub batches: Vec<Batch>,
    pub ui_batches: Vec<UiBatch>,
}

impl SceneSubpass {
    pub fn new(batches: Vec<Batch>, ui_batches: Vec<UiBatch>) -> Self {
        Self { batches, ui_batches }
    }

    fn record_batch(command_buffer: &mut CommandBuffer, descriptor_set: &DescriptorSet, object_index: &mut u32, batch: &mut Batch) -> u32 {
        command_buffer.set_viewport(batch.viewport);
        command_buffer.set_scissor(batch.scissor);

        let mut count = 0u32;
        let drawables = batch.skybox.iter().chain(batch.drawables.iter());
        for drawable in drawables {
            command_buffer.bind_pipeline_graphics(&drawable.pipeline);
            command_buffer.bind_descriptor_sets_graphics(&drawable.pipeline, &[descriptor_set]);
            command_buffer.bind_vertex_buffer_raw(0, drawable.mesh.vertex_buffer, 0);

            // The object's slot in the frame's storage-buffer array is
            // passed as the instance base so the shader can index it via
            // `gl_InstanceIndex` without a descriptor rebind per drawable.
            if let Some(index_buffer) = drawable.mesh.index_buffer {
                command_buffer.bind_index_buffer_raw(index_buffer, 0, drawable.mesh.index_type);
                command_buffer.draw_indexed(drawable.mesh.count, 1, 0, 0, *object_index);
            } else {
                command_buffer.draw(drawable.mesh.count, 1, 0, *object_index);
            }

            *object_index += 1;
            count += 1;
        }
        count
    }
}

impl Subpass for SceneSubpass {
    fn setup(&mut self, _ctx: &mut SubpassContext) -> Result<Vec<ObjectBlock>> {
        let objects = self
            .batches
            .iter()
            .flat_map(|batch| batch.skybox.iter().chain(batch.drawables.iter()))
            .chain(self.ui_batches.iter().flat_map(|ui_batch| ui_batch.0.skybox.iter().chain(ui_batch.0.drawables.iter())))
            .map(|drawable| drawable.object)
            .collect();
        Ok(objects)
    }

    fn render(&mut self, command_buffer: &mut CommandBuffer, ctx: &SubpassContext) -> Result<u32> {
        let mut object_index = ctx.object_base;
        let mut draw_calls = 0u32;
        for batch in self.batches.iter_mut() {
            draw_calls += Self::record_batch(command_buffer, ctx.descriptor_set, &mut object_index, batch);
        }
        for ui_batch in self.ui_batches.iter_mut() {
            draw_calls += Self::record_batch(command_buffer, ctx.descriptor_set, &mut object_index, &mut ui_batch.0);
        }
        Ok(draw_calls)
    }
}

/// What the frame renderer observed this call. Every fallible Vulkan call
/// is folded into `Result`; this enum only distinguishes non-error
/// outcomes a caller may want to react to (e.g. counting draw calls, or
/// noticing a recreate happened).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// A frame was recorded, submitted and presented.
    Rendered { draw_calls: u32 },
    /// Framebuffer extent was zero; acquire was skipped entirely.
    Paused,
    /// The swapchain was recreated this call; no frame was rendered.
    Recreated,
}

/// Caller-supplied unit of draw-command recording. Not necessarily backed
/// by a Vulkan subpass object — a capability set standing in for the
/// polymorphic-subpass-via-inheritance pattern the original renderer used.
///
/// `setup` runs for every subpass before any of them records draw calls: it
/// allocates uniforms from the frame's scratch buffer cache and returns the
/// per-object entries this subpass wants written into the frame's object
/// storage-buffer array. `render` then records draw calls against
/// `ctx.descriptor_set`, indexing its own slice of the object array
/// starting at `ctx.object_base`.
pub trait Subpass {
    fn setup(&mut self, ctx: &mut SubpassContext) -> Result<Vec<ObjectBlock>>;

    /// Records draw calls into `command_buffer`. Called after the colour
    /// and depth attachments are bound and the render area is set.
    fn render(&mut self, command_buffer: &mut CommandBuffer, ctx: &SubpassContext) -> Result<u32>;
}

/// Context handed to a subpass's `setup`/`render`. `object_base` is this
/// subpass's starting offset into the frame's object storage-buffer array,
/// known only after every subpass's `setup` has run, so it is meaningless
/// during `setup` and only valid from `render` onward.
pub struct SubpassContext<'a> {
    pub frame_index: u32,
    pub extent: vk::Extent2D,
    pub scratch: &'a mut ScratchBufferCache,
    pub descriptor_set: &'a DescriptorSet,
    pub object_base: u32,
}

/// Ring of host-visible buffers for transient per-frame uniform writes.
/// `next_frame` resets the write cursor on the slot about to be reused,
/// avoiding a fresh allocation for every `write`.
pub struct ScratchBufferCache {
    buffers: Vec<crate::resource::Buffer>,
    cursor: Vec<vk::DeviceSize>,
    capacity: vk::DeviceSize,
    slot: usize,
}

impl ScratchBufferCache {
    pub fn new(device: ash::Device, allocator: Arc<crate::allocator::Allocator>, slots: u32, capacity: vk::DeviceSize) -> Result<Self> {
        let mut buffers = Vec::with_capacity(slots as usize);
        for _ in 0..slots {
            buffers.push(crate::resource::Buffer::new(
                device.clone(),
                allocator.clone(),
                crate::resource::BufferDescriptor {
                    size: capacity,
                    usage: vk::BufferUsageFlags::UNIFORM_BUFFER | vk::BufferUsageFlags::STORAGE_BUFFER,
                    memory_usage: crate::allocator::AllocationUsage::CpuToGpu,
                },
            )?);
        }
        Ok(Self { cursor: vec![0; slots as usize], buffers, capacity, slot: 0 })
    }

    /// Resets the write cursor for the slot about to be reused. Must be
    /// called exactly once per frame, before any `write` calls for that
    /// frame.
    pub fn next_frame(&mut self, slot: usize) {
        self.slot = slot;
        self.cursor[slot] = 0;
    }

    /// Writes `data` at the current cursor, 256-byte aligned (the common
    /// `minUniformBufferOffsetAlignment`), and advances the cursor. Returns
    /// the buffer and byte offset the write landed at.
    pub fn write<T: Copy>(&mut self, data: &[T]) -> Result<(vk::Buffer, vk::DeviceSize)> {
        const ALIGNMENT: vk::DeviceSize = 256;
        let size = (std::mem::size_of_val(data)) as vk::DeviceSize;
        let offset = (self.cursor[self.slot] + ALIGNMENT - 1) / ALIGNMENT * ALIGNMENT;
        if offset + size > self.capacity {
            return Err(crate::error::Error::Usage("scratch buffer cache exhausted for this frame".to_string()));
        }

        let buffer = &self.buffers[self.slot];
        let ptr = buffer
            .allocation_mapped_ptr()
            .ok_or_else(|| crate::error::Error::Usage("scratch buffer is not host-visible".to_string()))?;
        unsafe {
            let dst = ptr.as_ptr().add(offset as usize) as *mut T;
            std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len());
        }

        self.cursor[self.slot] = offset + size;
        Ok((buffer.raw, offset))
    }
}

/// Initial combined-image-sampler array capacity. Deliberately small: the
/// array only grows, and most scenes load far fewer textures than the
/// physical device's per-stage sampler limit, so starting near that limit
/// would just waste descriptor pool storage that is never written.
const INITIAL_TEXTURE_CAPACITY: u32 = 64;

/// Drives the per-frame algorithm: acquire, record, submit, present, and
/// the bookkeeping (deferred queue tick, retired-swapchain tick, scratch
/// cursor reset, depth image recreation) that brackets it. Holds the
/// caller-agnostic state; the caller supplies its subpasses each call.
pub struct FrameRenderer {
    device: Arc<Device>,
    depth_images: Vec<Option<Image>>,
    scratch: ScratchBufferCache,
    pub descriptor: DescriptorProvisioner,
}

impl FrameRenderer {
    pub fn new(device: Arc<Device>, scratch_capacity: vk::DeviceSize) -> Result<Self> {
        let in_flight = device.in_flight_frames();
        let scratch = ScratchBufferCache::new(device.raw_handle(), device.allocator.clone(), in_flight, scratch_capacity)?;
        let descriptor = DescriptorProvisioner::new(&device, INITIAL_TEXTURE_CAPACITY, device.max_sampler_count())?;
        Ok(Self { device, depth_images: (0..in_flight).map(|_| None).collect(), scratch, descriptor })
    }

    /// Runs steps 1-13 of the per-frame algorithm against the given
    /// subpasses. `framebuffer_size` is used only if a recreate is needed.
    /// `view` is written into this frame's view-block uniform and
    /// `dir_lights` into its directional-light storage buffer before any
    /// subpass records a draw call.
    ///
    /// Every subpass's `setup` runs first (collecting the object entries
    /// each wants in the frame's object storage buffer), then the frame's
    /// descriptor set is written once for the whole frame, then every
    /// subpass's `render` runs in order. This differs slightly from a
    /// strict per-subpass setup-then-render interleaving, but is
    /// observationally equivalent from each subpass's point of view and
    /// avoids writing the object storage buffer once per subpass.
    pub fn render(
        &mut self,
        framebuffer_size: (u32, u32),
        clear_colour: [f32; 4],
        view: ViewBlock,
        dir_lights: &[DirLight],
        subpasses: &mut [&mut dyn Subpass],
    ) -> Result<FrameOutcome> {
        if framebuffer_size.0 == 0 || framebuffer_size.1 == 0 {
            return Ok(FrameOutcome::Paused);
        }

        let outcome = self.device.frame_begin(framebuffer_size)?;
        let slot = match outcome {
            AcquireOutcome::Paused => return Ok(FrameOutcome::Paused),
            AcquireOutcome::OutOfDate => return Ok(FrameOutcome::Recreated),
            AcquireOutcome::Acquired(index) | AcquireOutcome::Suboptimal(index) => index,
        };

        let extent = self.device.swapchain.lock().extent;
        self.ensure_depth_image(slot as usize, extent)?;
        self.scratch.next_frame(slot as usize);

        let mut all_objects: Vec<ObjectBlock> = Vec::new();
        let mut object_bases = Vec::with_capacity(subpasses.len());
        for subpass in subpasses.iter_mut() {
            let descriptor_set = self.descriptor.set(slot as usize);
            let mut ctx = SubpassContext { frame_index: slot, extent, scratch: &mut self.scratch, descriptor_set, object_base: 0 };
            object_bases.push(all_objects.len() as u32);
            all_objects.extend(subpass.setup(&mut ctx)?);
        }
        self.descriptor.write_frame(&self.device, slot as usize, view, &all_objects, dir_lights)?;

        let raw_command_buffer = self.device.current_command_buffer();
        let mut command_buffer = CommandBuffer::new(self.device.raw_handle(), raw_command_buffer);
        command_buffer.begin()?;

        let current_image = self.device.swapchain.lock().current_image();
        command_buffer.transition_raw_image(
            &self.device,
            current_image,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::PipelineStageFlags2::TOP_OF_PIPE,
            vk::AccessFlags2::NONE,
            vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
        );

        let depth_image = self.depth_images[slot as usize]
            .as_ref()
            .expect("depth image created by ensure_depth_image");
        command_buffer.transition_image(
            &self.device,
            depth_image,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
            vk::PipelineStageFlags2::TOP_OF_PIPE,
            vk::AccessFlags2::NONE,
            vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS,
            vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
        );

        let current_image_view = self.device.swapchain.lock().current_image_view();
        let colour_attachment = vk::RenderingAttachmentInfo::default()
            .image_view(current_image_view)
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .clear_value(vk::ClearValue { color: vk::ClearColorValue { float32: clear_colour } });
        let depth_attachment = vk::RenderingAttachmentInfo::default()
            .image_view(depth_image.view)
            .image_layout(vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .clear_value(vk::ClearValue { depth_stencil: vk::ClearDepthStencilValue { depth: 1.0, stencil: 0 } });
        let render_area = vk::Rect2D { offset: vk::Offset2D { x: 0, y: 0 }, extent };

        command_buffer.begin_rendering(&[colour_attachment], Some(&depth_attachment), render_area);

        let mut draw_calls = 0u32;
        for (subpass, object_base) in subpasses.iter_mut().zip(object_bases) {
            let descriptor_set = self.descriptor.set(slot as usize);
            let ctx = SubpassContext { frame_index: slot, extent, scratch: &mut self.scratch, descriptor_set, object_base };
            draw_calls += subpass.render(&mut command_buffer, &ctx)?;
        }

        command_buffer.end_rendering();
        command_buffer.transition_raw_image(
            &self.device,
            current_image,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::PRESENT_SRC_KHR,
            vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
            vk::PipelineStageFlags2::BOTTOM_OF_PIPE,
            vk::AccessFlags2::NONE,
        );
        command_buffer.end()?;

        self.device.submit_frame(raw_command_buffer)?;
        let present_outcome = self.device.frame_end()?;

        match present_outcome {
            crate::swapchain::PresentOutcome::Success => Ok(FrameOutcome::Rendered { draw_calls }),
            crate::swapchain::PresentOutcome::Suboptimal | crate::swapchain::PresentOutcome::OutOfDate => {
                Ok(FrameOutcome::Recreated)
            }
        }
    }

    fn ensure_depth_image(&mut self, slot: usize, extent: vk::Extent2D) -> Result<()> {
        let needs_recreate = match &self.depth_images[slot] {
            Some(image) => image.extent.width != extent.width || image.extent.height != extent.height,
            None => true,
        };
        if !needs_recreate {
            return Ok(());
        }

        let image = Image::new(
            self.device.raw_handle(),
            self.device.allocator.clone(),
            ImageDescriptor::new_2d(extent.width, extent.height, vk::Format::D32_SFLOAT, vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT),
        )?;

        if let Some(old) = self.depth_images[slot].take() {
            self.device.defer(move || drop(old));
        }
        self.depth_images[slot] = Some(image);
        Ok(())
    }
}
