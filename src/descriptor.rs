use std::sync::Arc;

use ash::vk;
use nalgebra::{Matrix4, Vector4};

use crate::allocator::AllocationUsage;
use crate::device::Device;
use crate::error::{Error, Result};
use crate::resource::{
    Buffer, BufferDescriptor, BufferWrite, DescriptorPool, DescriptorSet, DescriptorSetLayout,
    DescriptorSetLayoutDescriptor, Image, ImageDescriptor, ImageWrite, Sampler, SamplerDescriptor,
};
use crate::types::DescriptorSetLayoutBinding;

pub const BINDING_VIEW: u32 = 0;
pub const BINDING_OBJECTS: u32 = 1;
pub const BINDING_DIR_LIGHTS: u32 = 2;
pub const BINDING_DIFFUSE: u32 = 3;
pub const BINDING_SPECULAR: u32 = 4;
pub const BINDING_CUBEMAP: u32 = 5;

const INITIAL_OBJECT_CAPACITY: u32 = 64;
const INITIAL_DIR_LIGHT_CAPACITY: u32 = 4;

/// Which bindless sampler array a texture write targets.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum TextureClass {
    Diffuse,
    Specular,
}

/// Per-frame view-block uniform contents: camera matrices and position.
/// Layout is matched by the subpass's shader, not interpreted here.
/// `nalgebra`'s column-major `Matrix4`/`Vector4` are `repr(C)` over a flat
/// `f32` array, so they map directly onto the GLSL `mat4`/`vec4` the shader
/// side expects without a conversion step.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct ViewBlock {
    pub view: Matrix4<f32>,
    pub projection: Matrix4<f32>,
    pub camera_position: Vector4<f32>,
}

/// Per-object entry written into the frame's storage-buffer array, one per
/// drawable. Layout matched by the subpass's shader, not interpreted here.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct ObjectBlock {
    pub model_matrix: Matrix4<f32>,
    pub normal_matrix: Matrix4<f32>,
    pub material: u32,
    pub tint: Vector4<f32>,
    pub flags: u32,
    _pad: [u32; 2],
}

impl ObjectBlock {
    pub fn new(model_matrix: Matrix4<f32>, normal_matrix: Matrix4<f32>, material: u32, tint: Vector4<f32>, flags: u32) -> Self {
        Self { model_matrix, normal_matrix, material, tint, flags, _pad: [0; 2] }
    }
}

/// One directional light's contribution, written into the frame's
/// directional-light storage-buffer array. Layout matched by the subpass's
/// shader, not interpreted here.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct DirLight {
    pub ambient: Vector4<f32>,
    pub diffuse: Vector4<f32>,
    pub specular: Vector4<f32>,
    pub direction: Vector4<f32>,
}

impl DirLight {
    pub fn new(ambient: Vector4<f32>, diffuse: Vector4<f32>, specular: Vector4<f32>, direction: Vector4<f32>) -> Self {
        Self { ambient, diffuse, specular, direction }
    }
}

struct FrameResources {
    view_buffer: Buffer,
    object_buffer: Buffer,
    object_capacity: u32,
    dir_light_buffer: Buffer,
    dir_light_capacity: u32,
    set: DescriptorSet,
}

/// Per-frame descriptor provisioning for the data model's binding classes: a
/// per-frame view uniform, a per-object storage buffer, a directional-light
/// storage buffer, and separate diffuse/specular combined-image-sampler
/// texture arrays plus a single cubemap slot. The diffuse and specular
/// arrays' capacities only grow across the process's lifetime — shrinking
/// them back down after textures are unloaded is not implemented, matching
/// the assumption that churn in the observed maximum is rare. Newly grown
/// slots are padded with a 1x1 default texture (white for diffuse, black for
/// specular) so no array element is ever read uninitialised. The cubemap
/// slot is left unwritten until [`DescriptorProvisioner::write_cubemap`] is
/// called — `PARTIALLY_BOUND` makes that safe to leave unread until then.
pub struct DescriptorProvisioner {
    layout: DescriptorSetLayout,
    #[allow(dead_code)]
    pool: DescriptorPool,
    frames: Vec<FrameResources>,
    diffuse_capacity: u32,
    specular_capacity: u32,
    max_diffuse: u32,
    max_specular: u32,
    default_white: Image,
    default_black: Image,
    sampler: Sampler,
}

impl DescriptorProvisioner {
    /// `initial_texture_capacity` pre-sizes the diffuse/specular arrays to
    /// avoid a write storm on the first few texture loads; `max_textures` is
    /// the physical device's per-stage sampler limit (from
    /// [`Device::max_sampler_count`]) and is split between the diffuse and
    /// specular arrays, one slot reserved for the cubemap binding —
    /// `(max_textures - 1) / 2` each, mirroring the original engine's
    /// `clampDiffSpecCount`.
    pub fn new(device: &Arc<Device>, initial_texture_capacity: u32, max_textures: u32) -> Result<Self> {
        let raw = device.raw_handle();
        let max_diffuse_specular = (max_textures.max(2) - 1) / 2;
        let max_diffuse = max_diffuse_specular.max(1);
        let max_specular = max_diffuse_specular.max(1);
        let diffuse_capacity = initial_texture_capacity.clamp(1, max_diffuse);
        let specular_capacity = initial_texture_capacity.clamp(1, max_specular);
        let in_flight = device.in_flight_frames();

        let layout = DescriptorSetLayout::new(
            raw.clone(),
            DescriptorSetLayoutDescriptor::new(vec![
                DescriptorSetLayoutBinding::new()
                    .binding(BINDING_VIEW)
                    .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT),
                DescriptorSetLayoutBinding::new()
                    .binding(BINDING_OBJECTS)
                    .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT),
                DescriptorSetLayoutBinding::new()
                    .binding(BINDING_DIR_LIGHTS)
                    .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT),
                DescriptorSetLayoutBinding::new()
                    .binding(BINDING_DIFFUSE)
                    .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                    .descriptor_count(max_diffuse)
                    .stage_flags(vk::ShaderStageFlags::FRAGMENT),
                DescriptorSetLayoutBinding::new()
                    .binding(BINDING_SPECULAR)
                    .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                    .descriptor_count(max_specular)
                    .stage_flags(vk::ShaderStageFlags::FRAGMENT),
                DescriptorSetLayoutBinding::new()
                    .binding(BINDING_CUBEMAP)
                    .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::FRAGMENT),
            ])
            .bindless(),
        )?;

        let pool_sizes = [
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::UNIFORM_BUFFER)
                .descriptor_count(in_flight),
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::STORAGE_BUFFER)
                .descriptor_count(in_flight * 2),
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .descriptor_count((max_diffuse + max_specular + 1) * in_flight),
        ];
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .flags(vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND_POOL)
            .max_sets(in_flight)
            .pool_sizes(&pool_sizes);
        let pool = DescriptorPool::new(raw.clone(), &pool_info)?;

        let sampler = Sampler::new(raw.clone(), SamplerDescriptor::default())?;
        let default_white = Self::make_default_texture(device, [255, 255, 255, 255])?;
        let default_black = Self::make_default_texture(device, [0, 0, 0, 255])?;

        let mut frames = Vec::with_capacity(in_flight as usize);
        for _ in 0..in_flight {
            let set = pool.allocate(&layout)?;

            let view_buffer = Buffer::new(
                raw.clone(),
                device.allocator.clone(),
                BufferDescriptor {
                    size: std::mem::size_of::<ViewBlock>() as vk::DeviceSize,
                    usage: vk::BufferUsageFlags::UNIFORM_BUFFER,
                    memory_usage: AllocationUsage::CpuToGpu,
                },
            )?;
            let object_buffer = Buffer::new(
                raw.clone(),
                device.allocator.clone(),
                BufferDescriptor {
                    size: (INITIAL_OBJECT_CAPACITY as vk::DeviceSize) * std::mem::size_of::<ObjectBlock>() as vk::DeviceSize,
                    usage: vk::BufferUsageFlags::STORAGE_BUFFER,
                    memory_usage: AllocationUsage::CpuToGpu,
                },
            )?;
            let dir_light_buffer = Buffer::new(
                raw.clone(),
                device.allocator.clone(),
                BufferDescriptor {
                    size: (INITIAL_DIR_LIGHT_CAPACITY as vk::DeviceSize) * std::mem::size_of::<DirLight>() as vk::DeviceSize,
                    usage: vk::BufferUsageFlags::STORAGE_BUFFER,
                    memory_usage: AllocationUsage::CpuToGpu,
                },
            )?;

            set.write_buffers(
                &raw,
                &[
                    BufferWrite { binding: BINDING_VIEW, buffer: &view_buffer },
                    BufferWrite { binding: BINDING_OBJECTS, buffer: &object_buffer },
                    BufferWrite { binding: BINDING_DIR_LIGHTS, buffer: &dir_light_buffer },
                ],
            )?;
            for slot in 0..diffuse_capacity {
                set.write_images(
                    &raw,
                    &[ImageWrite { binding: BINDING_DIFFUSE, array_element: slot, image: &default_white, sampler: &sampler }],
                )?;
            }
            for slot in 0..specular_capacity {
                set.write_images(
                    &raw,
                    &[ImageWrite { binding: BINDING_SPECULAR, array_element: slot, image: &default_black, sampler: &sampler }],
                )?;
            }

            frames.push(FrameResources {
                view_buffer,
                object_buffer,
                object_capacity: INITIAL_OBJECT_CAPACITY,
                dir_light_buffer,
                dir_light_capacity: INITIAL_DIR_LIGHT_CAPACITY,
                set,
            });
        }

        Ok(Self {
            layout,
            pool,
            frames,
            diffuse_capacity,
            specular_capacity,
            max_diffuse,
            max_specular,
            default_white,
            default_black,
            sampler,
        })
    }

    fn make_default_texture(device: &Arc<Device>, colour: [u8; 4]) -> Result<Image> {
        let image = Image::new(
            device.raw_handle(),
            device.allocator.clone(),
            ImageDescriptor::new_2d(1, 1, vk::Format::R8G8B8A8_UNORM, vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST),
        )?;
        let future = device.transfer.upload_image(
            image.raw,
            vk::Extent3D { width: 1, height: 1, depth: 1 },
            1,
            1,
            colour.to_vec(),
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        );
        device.wait_transfer(&future)?;
        Ok(image)
    }

    pub fn layout(&self) -> &DescriptorSetLayout {
        &self.layout
    }

    pub fn set(&self, slot: usize) -> &DescriptorSet {
        &self.frames[slot].set
    }

    pub fn default_white(&self) -> &Image {
        &self.default_white
    }

    pub fn default_black(&self) -> &Image {
        &self.default_black
    }

    /// Writes this frame's view block and directional-light list, and
    /// grows/rewrites the per-object and per-dir-light storage buffers if
    /// their slices no longer fit the slot's current capacity. A replaced
    /// buffer is handed to the deferred queue rather than dropped
    /// immediately — an in-flight command buffer from a previous frame
    /// sharing this slot's descriptor set index may still be executing
    /// against it.
    pub fn write_frame(
        &mut self,
        device: &Arc<Device>,
        slot: usize,
        view: ViewBlock,
        objects: &[ObjectBlock],
        dir_lights: &[DirLight],
    ) -> Result<()> {
        let raw = device.raw_handle();
        self.frames[slot].view_buffer.write(std::slice::from_ref(&view))?;

        if objects.len() as u32 > self.frames[slot].object_capacity {
            let new_capacity = (objects.len() as u32).next_power_of_two();
            let new_buffer = Buffer::new(
                raw.clone(),
                device.allocator.clone(),
                BufferDescriptor {
                    size: (new_capacity as vk::DeviceSize) * std::mem::size_of::<ObjectBlock>() as vk::DeviceSize,
                    usage: vk::BufferUsageFlags::STORAGE_BUFFER,
                    memory_usage: AllocationUsage::CpuToGpu,
                },
            )?;
            self.frames[slot]
                .set
                .write_buffers(&raw, &[BufferWrite { binding: BINDING_OBJECTS, buffer: &new_buffer }])?;
            let old = std::mem::replace(&mut self.frames[slot].object_buffer, new_buffer);
            self.frames[slot].object_capacity = new_capacity;
            device.defer(move || drop(old));
        }

        if !objects.is_empty() {
            self.frames[slot].object_buffer.write(objects)?;
        }

        if dir_lights.len() as u32 > self.frames[slot].dir_light_capacity {
            let new_capacity = (dir_lights.len() as u32).next_power_of_two();
            let new_buffer = Buffer::new(
                raw.clone(),
                device.allocator.clone(),
                BufferDescriptor {
                    size: (new_capacity as vk::DeviceSize) * std::mem::size_of::<DirLight>() as vk::DeviceSize,
                    usage: vk::BufferUsageFlags::STORAGE_BUFFER,
                    memory_usage: AllocationUsage::CpuToGpu,
                },
            )?;
            self.frames[slot]
                .set
                .write_buffers(&raw, &[BufferWrite { binding: BINDING_DIR_LIGHTS, buffer: &new_buffer }])?;
            let old = std::mem::replace(&mut self.frames[slot].dir_light_buffer, new_buffer);
            self.frames[slot].dir_light_capacity = new_capacity;
            device.defer(move || drop(old));
        }

        if !dir_lights.is_empty() {
            self.frames[slot].dir_light_buffer.write(dir_lights)?;
        }

        Ok(())
    }

    /// Writes `image` into every frame's diffuse or specular texture array
    /// at `index`, growing the array's observed capacity first if `index`
    /// has never been written before. Capacity only grows — unused slots up
    /// to the new capacity are left holding whatever was written there
    /// last, which is always the class's default (white for diffuse, black
    /// for specular) since capacity only ever grows one index past the
    /// previous maximum that callers are expected to fill contiguously from
    /// zero.
    pub fn write_texture(&mut self, device: &Arc<Device>, class: TextureClass, index: u32, image: &Image) -> Result<()> {
        let (binding, max, capacity) = match class {
            TextureClass::Diffuse => (BINDING_DIFFUSE, self.max_diffuse, &mut self.diffuse_capacity),
            TextureClass::Specular => (BINDING_SPECULAR, self.max_specular, &mut self.specular_capacity),
        };
        if index >= max {
            return Err(Error::Usage(format!(
                "texture index {index} exceeds this array's share of the physical device's per-stage sampler limit {max}"
            )));
        }
        *capacity = (*capacity).max(index + 1);

        let raw = device.raw_handle();
        for frame in &self.frames {
            frame.set.write_images(&raw, &[ImageWrite { binding, array_element: index, image, sampler: &self.sampler }])?;
        }
        Ok(())
    }

    /// Writes `image` into the single cubemap binding, shared by every
    /// frame's descriptor set. Left unwritten until this is called — the
    /// binding's `PARTIALLY_BOUND` flag makes that safe as long as no
    /// subpass samples it before a cubemap is loaded.
    pub fn write_cubemap(&self, device: &Arc<Device>, image: &Image) -> Result<()> {
        let raw = device.raw_handle();
        for frame in &self.frames {
            frame.set.write_images(
                &raw,
                &[ImageWrite { binding: BINDING_CUBEMAP, array_element: 0, image, sampler: &self.sampler }],
            )?;
        }
        Ok(())
    }

    pub fn diffuse_capacity(&self) -> u32 {
        self.diffuse_capacity
    }

    pub fn specular_capacity(&self) -> u32 {
        self.specular_capacity
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn object_block_size_is_16_byte_aligned() {
        assert_eq!(std::mem::size_of::<super::ObjectBlock>() % 16, 0);
    }

    #[test]
    fn dir_light_block_size_is_16_byte_aligned() {
        assert_eq!(std::mem::size_of::<super::DirLight>() % 16, 0);
    }
}
