use std::ffi::CString;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::Arc;

use ash::vk;
use gpu_allocator::vulkan::Allocation;
use parking_lot::{Mutex, RwLock};

use crate::allocator::{AllocationKind, AllocationUsage, Allocator};
use crate::deferred::DeferredQueue;
use crate::error::{Error, Result};
use crate::types::{DescriptorSetLayoutBinding, PipelineDepthStencilState, PipelineRasterizationState};

pub struct BufferDescriptor {
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    pub memory_usage: AllocationUsage,
}

pub struct Buffer {
    device: ash::Device,
    allocator: Arc<Allocator>,
    pub raw: vk::Buffer,
    pub size: vk::DeviceSize,
    allocation: Option<Allocation>,
}

impl Buffer {
    pub fn new(device: ash::Device, allocator: Arc<Allocator>, desc: BufferDescriptor) -> Result<Self> {
        let create_info = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(desc.usage | vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST);
        let raw = unsafe { device.create_buffer(&create_info, None)? };
        let requirements = unsafe { device.get_buffer_memory_requirements(raw) };
        let (allocation, info) =
            allocator.allocate("buffer", AllocationKind::Buffer, requirements, desc.memory_usage)?;
        unsafe { device.bind_buffer_memory(raw, info.device_memory, info.offset)? };

        Ok(Self {
            device,
            allocator,
            raw,
            size: desc.size,
            allocation: Some(allocation),
        })
    }

    /// Writes `data` into a host-visible buffer at offset 0. Returns a usage
    /// error if the buffer's memory is not host-visible.
    pub fn write<T: Copy>(&self, data: &[T]) -> Result<()> {
        let ptr = self
            .allocation
            .as_ref()
            .and_then(|a| a.mapped_ptr())
            .ok_or_else(|| Error::Usage("buffer is not host-visible".to_string()))?
            .as_ptr();
        unsafe {
            let mut align = ash::util::Align::new(
                ptr,
                std::mem::align_of::<T>() as u64,
                std::mem::size_of_val(data) as u64,
            );
            align.copy_from_slice(data);
        }
        Ok(())
    }

    /// Writes `data` at a byte `offset` into a host-visible buffer. Used by
    /// the frame renderer's scratch buffer cache to pack several per-frame
    /// writes into one ring buffer instead of allocating one buffer per
    /// write.
    pub fn write_at<T: Copy>(&self, offset: vk::DeviceSize, data: &[T]) -> Result<()> {
        let ptr = self
            .allocation
            .as_ref()
            .and_then(|a| a.mapped_ptr())
            .ok_or_else(|| Error::Usage("buffer is not host-visible".to_string()))?
            .as_ptr();
        unsafe {
            let dst = (ptr as *mut u8).add(offset as usize) as *mut std::ffi::c_void;
            let mut align = ash::util::Align::new(
                dst,
                std::mem::align_of::<T>() as u64,
                std::mem::size_of_val(data) as u64,
            );
            align.copy_from_slice(data);
        }
        Ok(())
    }

    /// Raw mapped pointer for this buffer's allocation, if host-visible.
    /// Used by callers (the frame renderer's scratch buffer cache) that need
    /// to pack multiple sub-writes at caller-tracked offsets rather than go
    /// through [`Buffer::write_at`] once per write.
    pub fn allocation_mapped_ptr(&self) -> Option<std::ptr::NonNull<std::ffi::c_void>> {
        self.allocation.as_ref().and_then(|a| a.mapped_ptr())
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Some(allocation) = self.allocation.take() {
            unsafe { self.device.destroy_buffer(self.raw, None) };
            if let Err(err) = self.allocator.free(AllocationKind::Buffer, allocation) {
                log::warn!("failed to free buffer allocation: {err}");
            }
        }
    }
}

pub struct ImageDescriptor {
    pub width: u32,
    pub height: u32,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
    pub memory_usage: AllocationUsage,
    pub view_type: vk::ImageViewType,
    pub create_flags: vk::ImageCreateFlags,
}

impl ImageDescriptor {
    pub fn new_2d(width: u32, height: u32, format: vk::Format, usage: vk::ImageUsageFlags) -> Self {
        Self {
            width,
            height,
            mip_levels: 1,
            array_layers: 1,
            format,
            usage,
            memory_usage: AllocationUsage::GpuOnly,
            view_type: vk::ImageViewType::TYPE_2D,
            create_flags: vk::ImageCreateFlags::empty(),
        }
    }

    /// An array of 2D layers sampled as `texture2DArray` rather than one
    /// image per draw call.
    pub fn new_2d_array(width: u32, height: u32, layers: u32, format: vk::Format, usage: vk::ImageUsageFlags) -> Self {
        Self {
            array_layers: layers,
            view_type: vk::ImageViewType::TYPE_2D_ARRAY,
            ..Self::new_2d(width, height, format, usage)
        }
    }

    /// A 6-layer cube image, sampled as `samplerCube`. `width`/`height` give
    /// one face's extent.
    pub fn new_cube(width: u32, format: vk::Format, usage: vk::ImageUsageFlags) -> Self {
        Self {
            array_layers: 6,
            view_type: vk::ImageViewType::CUBE,
            create_flags: vk::ImageCreateFlags::CUBE_COMPATIBLE,
            ..Self::new_2d(width, width, format, usage)
        }
    }
}

pub(crate) fn format_has_depth(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D32_SFLOAT_S8_UINT
            | vk::Format::D32_SFLOAT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D16_UNORM_S8_UINT
            | vk::Format::D16_UNORM
    )
}

pub struct Image {
    device: ash::Device,
    allocator: Arc<Allocator>,
    pub raw: vk::Image,
    pub view: vk::ImageView,
    pub extent: vk::Extent3D,
    pub format: vk::Format,
    allocation: Option<Allocation>,
}

impl Image {
    pub fn new(device: ash::Device, allocator: Arc<Allocator>, desc: ImageDescriptor) -> Result<Self> {
        let extent = vk::Extent3D {
            width: desc.width,
            height: desc.height,
            depth: 1,
        };
        let create_info = vk::ImageCreateInfo::default()
            .flags(desc.create_flags)
            .image_type(vk::ImageType::TYPE_2D)
            .format(desc.format)
            .extent(extent)
            .mip_levels(desc.mip_levels)
            .array_layers(desc.array_layers)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let raw = unsafe { device.create_image(&create_info, None)? };
        let requirements = unsafe { device.get_image_memory_requirements(raw) };
        let (allocation, info) =
            allocator.allocate("image", AllocationKind::Image, requirements, desc.memory_usage)?;
        unsafe { device.bind_image_memory(raw, info.device_memory, info.offset)? };

        let aspect_mask = if format_has_depth(desc.format) {
            vk::ImageAspectFlags::DEPTH
        } else {
            vk::ImageAspectFlags::COLOR
        };
        let view_info = vk::ImageViewCreateInfo::default()
            .image(raw)
            .view_type(desc.view_type)
            .format(desc.format)
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(aspect_mask)
                    .base_mip_level(0)
                    .level_count(desc.mip_levels)
                    .base_array_layer(0)
                    .layer_count(desc.array_layers),
            );
        let view = unsafe { device.create_image_view(&view_info, None)? };

        Ok(Self {
            device,
            allocator,
            raw,
            view,
            extent,
            format: desc.format,
            allocation: Some(allocation),
        })
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        if let Some(allocation) = self.allocation.take() {
            unsafe {
                self.device.destroy_image_view(self.view, None);
                self.device.destroy_image(self.raw, None);
            }
            if let Err(err) = self.allocator.free(AllocationKind::Image, allocation) {
                log::warn!("failed to free image allocation: {err}");
            }
        }
    }
}

pub struct SamplerDescriptor {
    pub min_filter: vk::Filter,
    pub mag_filter: vk::Filter,
    pub mipmap_mode: vk::SamplerMipmapMode,
    pub address_mode: vk::SamplerAddressMode,
}

impl Default for SamplerDescriptor {
    fn default() -> Self {
        Self {
            min_filter: vk::Filter::LINEAR,
            mag_filter: vk::Filter::LINEAR,
            mipmap_mode: vk::SamplerMipmapMode::LINEAR,
            address_mode: vk::SamplerAddressMode::REPEAT,
        }
    }
}

pub struct Sampler {
    device: ash::Device,
    pub raw: vk::Sampler,
}

impl Sampler {
    pub fn new(device: ash::Device, desc: SamplerDescriptor) -> Result<Self> {
        let create_info = vk::SamplerCreateInfo::default()
            .min_filter(desc.min_filter)
            .mag_filter(desc.mag_filter)
            .mipmap_mode(desc.mipmap_mode)
            .address_mode_u(desc.address_mode)
            .address_mode_v(desc.address_mode)
            .address_mode_w(desc.address_mode)
            .max_lod(vk::LOD_CLAMP_NONE);
        let raw = unsafe { device.create_sampler(&create_info, None)? };
        Ok(Self { device, raw })
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        unsafe { self.device.destroy_sampler(self.raw, None) };
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Compute,
}

impl ShaderStage {
    pub(crate) fn to_vulkan(self) -> vk::ShaderStageFlags {
        match self {
            ShaderStage::Vertex => vk::ShaderStageFlags::VERTEX,
            ShaderStage::Fragment => vk::ShaderStageFlags::FRAGMENT,
            ShaderStage::Compute => vk::ShaderStageFlags::COMPUTE,
        }
    }
}

/// A shader module built directly from a compiled SPIR-V module. Shader
/// source compilation is out of scope here — callers supply binaries
/// produced by whatever offline pipeline they use.
pub struct ShaderModule {
    device: ash::Device,
    pub raw: vk::ShaderModule,
    pub stage: ShaderStage,
}

impl ShaderModule {
    pub fn from_spirv(device: ash::Device, spirv: &[u32], stage: ShaderStage) -> Result<Self> {
        let create_info = vk::ShaderModuleCreateInfo::default().code(spirv);
        let raw = unsafe { device.create_shader_module(&create_info, None)? };
        Ok(Self { device, raw, stage })
    }

    pub fn from_spirv_bytes(device: ash::Device, bytes: &[u8], stage: ShaderStage) -> Result<Self> {
        let mut cursor = std::io::Cursor::new(bytes);
        let code = ash::util::read_spv(&mut cursor)
            .map_err(|e| Error::ResourceCreation(format!("invalid SPIR-V module: {e}")))?;
        Self::from_spirv(device, &code, stage)
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        unsafe { self.device.destroy_shader_module(self.raw, None) };
    }
}

pub struct DescriptorSetLayoutDescriptor {
    pub bindings: Vec<DescriptorSetLayoutBinding>,
    pub flags: vk::DescriptorSetLayoutCreateFlags,
    pub binding_flags: Option<Vec<vk::DescriptorBindingFlags>>,
}

impl DescriptorSetLayoutDescriptor {
    pub fn new(bindings: Vec<DescriptorSetLayoutBinding>) -> Self {
        Self {
            bindings,
            flags: vk::DescriptorSetLayoutCreateFlags::empty(),
            binding_flags: None,
        }
    }

    /// Turns every binding into a monotonically-growable bindless binding:
    /// partially-bound plus update-after-bind, never shrunk once padded.
    pub fn bindless(mut self) -> Self {
        self.flags |= vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL;
        self.binding_flags = Some(vec![
            vk::DescriptorBindingFlags::PARTIALLY_BOUND
                | vk::DescriptorBindingFlags::UPDATE_AFTER_BIND;
            self.bindings.len()
        ]);
        self
    }
}

pub struct DescriptorSetLayout {
    device: ash::Device,
    pub raw: vk::DescriptorSetLayout,
    pub(crate) bindings: Vec<DescriptorSetLayoutBinding>,
}

impl DescriptorSetLayout {
    pub fn new(device: ash::Device, desc: DescriptorSetLayoutDescriptor) -> Result<Self> {
        let vk_bindings: Vec<_> = desc.bindings.iter().map(|b| b.to_vulkan_binding()).collect();
        let mut create_info = vk::DescriptorSetLayoutCreateInfo::default()
            .bindings(&vk_bindings)
            .flags(desc.flags);

        let mut binding_flags_info = vk::DescriptorSetLayoutBindingFlagsCreateInfo::default();
        if let Some(binding_flags) = &desc.binding_flags {
            binding_flags_info = binding_flags_info.binding_flags(binding_flags);
            create_info = create_info.push_next(&mut binding_flags_info);
        }

        let raw = unsafe { device.create_descriptor_set_layout(&create_info, None)? };
        Ok(Self {
            device,
            raw,
            bindings: desc.bindings,
        })
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        unsafe { self.device.destroy_descriptor_set_layout(self.raw, None) };
    }
}

pub struct DescriptorPool {
    device: ash::Device,
    pub raw: vk::DescriptorPool,
}

impl DescriptorPool {
    pub fn new(device: ash::Device, create_info: &vk::DescriptorPoolCreateInfo) -> Result<Self> {
        let raw = unsafe { device.create_descriptor_pool(create_info, None)? };
        Ok(Self { device, raw })
    }

    pub fn allocate(&self, layout: &DescriptorSetLayout) -> Result<DescriptorSet> {
        let layouts = [layout.raw];
        let allocate_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.raw)
            .set_layouts(&layouts);
        let raw = unsafe { self.device.allocate_descriptor_sets(&allocate_info)?[0] };
        Ok(DescriptorSet {
            raw,
            bindings: layout.bindings.clone(),
        })
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        unsafe { self.device.destroy_descriptor_pool(self.raw, None) };
    }
}

/// Allocated from a `DescriptorPool`; freed implicitly when the owning pool
/// is reset or destroyed, so this carries no `Drop` of its own.
pub struct DescriptorSet {
    pub raw: vk::DescriptorSet,
    bindings: Vec<DescriptorSetLayoutBinding>,
}

pub struct BufferWrite<'a> {
    pub binding: u32,
    pub buffer: &'a Buffer,
}

pub struct ImageWrite<'a> {
    pub binding: u32,
    pub array_element: u32,
    pub image: &'a Image,
    pub sampler: &'a Sampler,
}

impl DescriptorSet {
    fn binding(&self, index: u32) -> Result<&DescriptorSetLayoutBinding> {
        self.bindings
            .iter()
            .find(|b| b.binding == index)
            .ok_or_else(|| Error::Usage(format!("no descriptor set layout binding at index {index}")))
    }

    pub fn write_buffers(&self, device: &ash::Device, writes: &[BufferWrite]) -> Result<()> {
        let buffer_infos: Vec<_> = writes
            .iter()
            .map(|w| {
                vk::DescriptorBufferInfo::default()
                    .buffer(w.buffer.raw)
                    .offset(0)
                    .range(w.buffer.size)
            })
            .collect();

        let mut vk_writes = Vec::with_capacity(writes.len());
        for (write, buffer_info) in writes.iter().zip(buffer_infos.iter()) {
            let binding = self.binding(write.binding)?;
            vk_writes.push(
                vk::WriteDescriptorSet::default()
                    .dst_set(self.raw)
                    .dst_binding(binding.binding)
                    .dst_array_element(0)
                    .descriptor_type(binding.descriptor_type)
                    .buffer_info(std::slice::from_ref(buffer_info)),
            );
        }

        unsafe { device.update_descriptor_sets(&vk_writes, &[]) };
        Ok(())
    }

    pub fn write_images(&self, device: &ash::Device, writes: &[ImageWrite]) -> Result<()> {
        let image_infos: Vec<_> = writes
            .iter()
            .map(|w| {
                vk::DescriptorImageInfo::default()
                    .image_view(w.image.view)
                    .sampler(w.sampler.raw)
                    .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
            })
            .collect();

        let mut vk_writes = Vec::with_capacity(writes.len());
        for (write, image_info) in writes.iter().zip(image_infos.iter()) {
            let binding = self.binding(write.binding)?;
            vk_writes.push(
                vk::WriteDescriptorSet::default()
                    .dst_set(self.raw)
                    .dst_binding(binding.binding)
                    .dst_array_element(write.array_element)
                    .descriptor_type(binding.descriptor_type)
                    .image_info(std::slice::from_ref(image_info)),
            );
        }

        unsafe { device.update_descriptor_sets(&vk_writes, &[]) };
        Ok(())
    }
}

pub struct PipelineDescriptor<'a> {
    pub descriptor_set_layouts: &'a [&'a DescriptorSetLayout],
    pub shader_stages: &'a [&'a ShaderModule],
    pub vertex_bindings: &'a [vk::VertexInputBindingDescription],
    pub vertex_attributes: &'a [vk::VertexInputAttributeDescription],
    pub topology: vk::PrimitiveTopology,
    pub colour_attachment_formats: &'a [vk::Format],
    pub depth_attachment_format: vk::Format,
    pub colour_blend_attachments: &'a [vk::PipelineColorBlendAttachmentState],
    pub depth_stencil_state: PipelineDepthStencilState,
    pub rasterization_state: PipelineRasterizationState,
}

pub struct Pipeline {
    device: ash::Device,
    pub raw: vk::Pipeline,
    pub layout: vk::PipelineLayout,
}

impl Pipeline {
    pub fn new_graphics(device: ash::Device, desc: PipelineDescriptor) -> Result<Self> {
        let set_layouts: Vec<_> = desc.descriptor_set_layouts.iter().map(|l| l.raw).collect();
        let layout_info = vk::PipelineLayoutCreateInfo::default().set_layouts(&set_layouts);
        let layout = unsafe { device.create_pipeline_layout(&layout_info, None)? };

        let entry_point = CString::new("main").expect("entry point name has no interior nul");
        let stages: Vec<_> = desc
            .shader_stages
            .iter()
            .map(|module| {
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(module.stage.to_vulkan())
                    .module(module.raw)
                    .name(&entry_point)
            })
            .collect();

        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(desc.vertex_bindings)
            .vertex_attribute_descriptions(desc.vertex_attributes);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(desc.topology)
            .primitive_restart_enable(false);

        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);

        let colour_blend = vk::PipelineColorBlendStateCreateInfo::default()
            .logic_op_enable(false)
            .attachments(desc.colour_blend_attachments);

        let multisample = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let mut rendering_info = vk::PipelineRenderingCreateInfo::default()
            .color_attachment_formats(desc.colour_attachment_formats)
            .depth_attachment_format(desc.depth_attachment_format);

        let depth_stencil = desc.depth_stencil_state.to_vulkan_state();
        let rasterization = desc.rasterization_state.to_vulkan_state();

        let create_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&colour_blend)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .push_next(&mut rendering_info);

        let raw = unsafe {
            device
                .create_graphics_pipelines(vk::PipelineCache::null(), std::slice::from_ref(&create_info), None)
                .map_err(|(_, result)| Error::Vulkan(result))?[0]
        };

        Ok(Self { device, raw, layout })
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_pipeline(self.raw, None);
            self.device.destroy_pipeline_layout(self.layout, None);
        }
    }
}

/// Opaque (index, generation) reference into a `ResourceCache`. Cheap to
/// copy, carries no lifetime, and is invalidated the instant its slot is
/// unloaded — using a stale handle after that point returns `None` rather
/// than touching freed state.
pub struct Handle<T> {
    index: u32,
    generation: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for Handle<T> {}
impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}
impl<T> Eq for Handle<T> {}
impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.generation.hash(state);
    }
}
impl<T> std::fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("index", &self.index)
            .field("generation", &self.generation)
            .finish()
    }
}

struct Slot<T> {
    value: Option<T>,
    generation: u32,
}

/// Map from opaque handle to typed, owned resource. Insertion is by move;
/// `unload` hands the resource off to a `DeferredQueue` rather than
/// destroying it synchronously, so in-flight frames referencing it survive.
/// Reads take the shared lock; insert/unload take the exclusive one.
pub struct ResourceCache<T> {
    slots: RwLock<Vec<Slot<T>>>,
    free: Mutex<Vec<u32>>,
}

impl<T> Default for ResourceCache<T> {
    fn default() -> Self {
        Self {
            slots: RwLock::new(Vec::new()),
            free: Mutex::new(Vec::new()),
        }
    }
}

impl<T: Send + 'static> ResourceCache<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, value: T) -> Handle<T> {
        if let Some(index) = self.free.lock().pop() {
            let mut slots = self.slots.write();
            let slot = &mut slots[index as usize];
            slot.value = Some(value);
            return Handle {
                index,
                generation: slot.generation,
                _marker: PhantomData,
            };
        }

        let mut slots = self.slots.write();
        let index = slots.len() as u32;
        slots.push(Slot { value: Some(value), generation: 0 });
        Handle { index, generation: 0, _marker: PhantomData }
    }

    pub fn get<R>(&self, handle: Handle<T>, f: impl FnOnce(&T) -> R) -> Option<R> {
        let slots = self.slots.read();
        let slot = slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.value.as_ref().map(f)
    }

    /// Removes the resource behind `handle` and schedules its drop on
    /// `deferred` after `countdown` frames. Returns `false` if the handle
    /// was already stale.
    pub fn unload(&self, handle: Handle<T>, deferred: &DeferredQueue, countdown: u32) -> bool {
        let taken = {
            let mut slots = self.slots.write();
            let Some(slot) = slots.get_mut(handle.index as usize) else {
                return false;
            };
            if slot.generation != handle.generation {
                return false;
            }
            slot.generation = slot.generation.wrapping_add(1);
            slot.value.take()
        };

        self.free.lock().push(handle.index);

        if let Some(value) = taken {
            deferred.defer(countdown, move || drop(value));
            true
        } else {
            false
        }
    }

    pub fn len(&self) -> usize {
        self.slots.read().iter().filter(|s| s.value.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub type BufferCache = ResourceCache<Buffer>;
pub type ImageCache = ResourceCache<Image>;
pub type ShaderModuleCache = ResourceCache<ShaderModule>;
pub type PipelineCache = ResourceCache<Pipeline>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn insert_then_get_round_trips() {
        let cache: ResourceCache<u32> = ResourceCache::new();
        let handle = cache.insert(42);
        assert_eq!(cache.get(handle, |v| *v), Some(42));
    }

    #[test]
    fn unload_invalidates_the_handle() {
        let cache: ResourceCache<u32> = ResourceCache::new();
        let deferred = DeferredQueue::new();
        let handle = cache.insert(7);
        assert!(cache.unload(handle, &deferred, 1));
        assert_eq!(cache.get(handle, |v| *v), None);
    }

    #[test]
    fn stale_handle_after_slot_reuse_returns_none() {
        let cache: ResourceCache<u32> = ResourceCache::new();
        let deferred = DeferredQueue::new();
        let first = cache.insert(1);
        cache.unload(first, &deferred, 0);
        deferred.next_frame();
        let second = cache.insert(2);

        assert_eq!(first.index_for_test(), second.index_for_test());
        assert_ne!(first.generation, second.generation);
        assert_eq!(cache.get(first, |v| *v), None);
        assert_eq!(cache.get(second, |v| *v), Some(2));
    }

    #[test]
    fn unload_defers_the_drop_rather_than_running_it_immediately() {
        let cache: ResourceCache<DropCounter> = ResourceCache::new();
        let deferred = DeferredQueue::new();
        let dropped = Arc::new(AtomicUsize::new(0));
        let handle = cache.insert(DropCounter(dropped.clone()));

        cache.unload(handle, &deferred, 2);
        assert_eq!(dropped.load(Ordering::SeqCst), 0);
        deferred.next_frame();
        assert_eq!(dropped.load(Ordering::SeqCst), 0);
        deferred.next_frame();
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
    }

    struct DropCounter(Arc<AtomicUsize>);
    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl<T> Handle<T> {
        fn index_for_test(&self) -> u32 {
            self.index
        }
    }
}
