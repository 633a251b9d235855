use std::sync::Arc;
use std::thread::JoinHandle;

use ash::vk;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};

use crate::allocator::{AllocationUsage, Allocator};
use crate::config::TransferReserve;
use crate::device::ImageLayoutTracker;
use crate::error::Result;
use crate::resource::{Buffer, BufferDescriptor};

/// Smallest power-of-two at least `size` bytes. Staging buffers are bucketed
/// to this granularity so a buffer freed by one upload can be reused by any
/// later upload of equal or smaller size without a fresh allocation.
pub fn ceil_pot(size: vk::DeviceSize) -> vk::DeviceSize {
    let mut ret: vk::DeviceSize = 2;
    while ret < size {
        ret <<= 1;
    }
    ret
}

struct Completion(Arc<(Mutex<bool>, Condvar)>);

impl Completion {
    fn signal(self) {
        let mut done = self.0 .0.lock();
        *done = true;
        self.0 .1.notify_all();
    }
}

/// Handle to a pending transfer. Resolves once the copy's batch fence has
/// been signalled and has survived its frame pad — i.e. once no in-flight
/// frame could still be racing the copy.
#[derive(Clone)]
pub struct TransferFuture {
    state: Arc<(Mutex<bool>, Condvar)>,
}

impl TransferFuture {
    fn new() -> (Self, Completion) {
        let state = Arc::new((Mutex::new(false), Condvar::new()));
        (Self { state: state.clone() }, Completion(state))
    }

    pub fn is_ready(&self) -> bool {
        *self.state.0.lock()
    }

    pub fn wait(&self) {
        let mut done = self.state.0.lock();
        if !*done {
            self.state.1.wait(&mut done);
        }
    }
}

struct StagingBuffer {
    buffer: Buffer,
    capacity: vk::DeviceSize,
}

/// Free list of staging buffers, bucketed by power-of-two capacity. A
/// request for `size` bytes first looks for a released buffer big enough
/// before allocating a new one — mirrors the original engine's staging
/// buffer reuse instead of allocating fresh storage per upload.
struct StagingPool {
    device: ash::Device,
    allocator: Arc<Allocator>,
    free: Mutex<Vec<StagingBuffer>>,
}

impl StagingPool {
    fn new(device: ash::Device, allocator: Arc<Allocator>, reserve: &[TransferReserve]) -> Result<Self> {
        let pool = Self {
            device: device.clone(),
            allocator: allocator.clone(),
            free: Mutex::new(Vec::new()),
        };
        for entry in reserve {
            for _ in 0..entry.count {
                let buffer = pool.create(entry.size)?;
                pool.free.lock().push(buffer);
            }
        }
        Ok(pool)
    }

    fn create(&self, size: vk::DeviceSize) -> Result<StagingBuffer> {
        let capacity = ceil_pot(size);
        let buffer = Buffer::new(
            self.device.clone(),
            self.allocator.clone(),
            BufferDescriptor {
                size: capacity,
                usage: vk::BufferUsageFlags::TRANSFER_SRC,
                memory_usage: AllocationUsage::CpuOnly,
            },
        )?;
        Ok(StagingBuffer { buffer, capacity })
    }

    fn acquire(&self, size: vk::DeviceSize) -> Result<StagingBuffer> {
        let mut free = self.free.lock();
        if let Some(pos) = free.iter().position(|b| b.capacity >= size) {
            return Ok(free.remove(pos));
        }
        drop(free);
        self.create(size)
    }

    fn release(&self, buffer: StagingBuffer) {
        self.free.lock().push(buffer);
    }
}

struct StageEntry {
    staging: StagingBuffer,
    command_buffer: vk::CommandBuffer,
    completion: Completion,
}

struct Batch {
    entries: Vec<StageEntry>,
    fence: vk::Fence,
    frame_pad: u32,
}

type Job = Box<dyn FnOnce() + Send>;

/// Asynchronous host-to-device transfer engine. A worker thread drains an
/// enqueued-job queue, recording each upload/copy into its own one-shot
/// command buffer against a dedicated staging buffer; `update()` (called
/// once per frame by the embedder) submits whatever accumulated since the
/// last call as one batch, and retires batches whose fence has signalled
/// and whose frame pad has elapsed.
pub struct TransferEngine {
    device: ash::Device,
    allocator: Arc<Allocator>,
    queue: Mutex<vk::Queue>,
    command_pool: vk::CommandPool,
    free_commands: Arc<Mutex<Vec<vk::CommandBuffer>>>,
    free_fences: Mutex<Vec<vk::Fence>>,
    staging: Arc<StagingPool>,
    active: Arc<Mutex<Vec<StageEntry>>>,
    submitted: Mutex<Vec<Batch>>,
    in_flight_frames: u32,
    jobs: Sender<Job>,
    worker: Mutex<Option<JoinHandle<()>>>,
    layout_tracker: Arc<ImageLayoutTracker>,
}

impl TransferEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        device: ash::Device,
        allocator: Arc<Allocator>,
        queue: vk::Queue,
        queue_family: u32,
        reserve: &[TransferReserve],
        in_flight_frames: u32,
        layout_tracker: Arc<ImageLayoutTracker>,
    ) -> Result<Self> {
        let pool_info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(queue_family);
        let command_pool = unsafe { device.create_command_pool(&pool_info, None)? };

        let staging = Arc::new(StagingPool::new(device.clone(), allocator.clone(), reserve)?);
        let active = Arc::new(Mutex::new(Vec::new()));
        let (jobs, receiver): (Sender<Job>, Receiver<Job>) = unbounded();

        let worker = std::thread::Builder::new()
            .name("vkcore-transfer".into())
            .spawn(move || {
                log::debug!("transfer worker thread started");
                while let Ok(job) = receiver.recv() {
                    job();
                }
                log::debug!("transfer worker thread terminated");
            })
            .expect("failed to spawn transfer worker thread");

        Ok(Self {
            device,
            allocator,
            queue: Mutex::new(queue),
            command_pool,
            free_commands: Arc::new(Mutex::new(Vec::new())),
            free_fences: Mutex::new(Vec::new()),
            staging,
            active,
            submitted: Mutex::new(Vec::new()),
            in_flight_frames,
            jobs,
            worker: Mutex::new(Some(worker)),
            layout_tracker,
        })
    }

    fn next_fence(&self) -> Result<vk::Fence> {
        if let Some(fence) = self.free_fences.lock().pop() {
            return Ok(fence);
        }
        let info = vk::FenceCreateInfo::default();
        Ok(unsafe { self.device.create_fence(&info, None)? })
    }

    /// Queues a host-to-device buffer upload. Returns immediately; the
    /// actual copy is recorded on the worker thread and submitted by the
    /// next `update()`.
    pub fn upload_buffer(&self, dst: vk::Buffer, data: Vec<u8>) -> TransferFuture {
        let (future, completion) = TransferFuture::new();
        let size = data.len() as vk::DeviceSize;

        let device = self.device.clone();
        let staging_pool = self.staging.clone();
        let active = self.active.clone();
        let command_pool = self.command_pool;
        let free_commands = self.free_commands.clone();

        self.submit_job(move || {
            let result = (|| -> Result<()> {
                let mut staging = staging_pool.acquire(size)?;
                staging.buffer.write(&data)?;

                let command_buffer = Self::acquire_command_buffer(&device, command_pool, &free_commands)?;
                let begin_info =
                    vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
                unsafe {
                    device.begin_command_buffer(command_buffer, &begin_info)?;
                    let region = vk::BufferCopy::default().size(size);
                    device.cmd_copy_buffer(command_buffer, staging.buffer.raw, dst, std::slice::from_ref(&region));
                    device.end_command_buffer(command_buffer)?;
                }

                active.lock().push(StageEntry { staging, command_buffer, completion });
                Ok(())
            })();

            if let Err(err) = result {
                log::error!("transfer upload_buffer failed: {err}");
            }
        });

        future
    }

    /// Queues a host-to-device image upload. `data` holds mip level 0 for
    /// every array layer, tightly packed layer after layer. Records, in one
    /// command buffer: a barrier to `TransferDstOptimal` across all layers,
    /// one `copyBufferToImage` region per layer, and — if the image has more
    /// than one mip level — a blit chain generating the remaining mips,
    /// leaving the final mip in `ShaderReadOnlyOptimal`. Single-mip images
    /// are left in `post_layout` instead.
    pub fn upload_image(
        &self,
        dst: vk::Image,
        extent: vk::Extent3D,
        mip_levels: u32,
        array_layers: u32,
        data: Vec<u8>,
        pre_layout: vk::ImageLayout,
        post_layout: vk::ImageLayout,
    ) -> TransferFuture {
        let (future, completion) = TransferFuture::new();
        let size = data.len() as vk::DeviceSize;

        let device = self.device.clone();
        let staging_pool = self.staging.clone();
        let active = self.active.clone();
        let command_pool = self.command_pool;
        let free_commands = self.free_commands.clone();
        let layout_tracker = self.layout_tracker.clone();

        self.submit_job(move || {
            let result = (|| -> Result<()> {
                let mut staging = staging_pool.acquire(size)?;
                staging.buffer.write(&data)?;

                let command_buffer = Self::acquire_command_buffer(&device, command_pool, &free_commands)?;
                let begin_info =
                    vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

                let layer_bytes = size / array_layers.max(1) as vk::DeviceSize;
                let all_mips = vk::ImageSubresourceRange::default()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .base_mip_level(0)
                    .level_count(mip_levels)
                    .base_array_layer(0)
                    .layer_count(array_layers);
                let mip_zero = vk::ImageSubresourceRange::default()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .base_mip_level(0)
                    .level_count(1)
                    .base_array_layer(0)
                    .layer_count(array_layers);

                unsafe {
                    device.begin_command_buffer(command_buffer, &begin_info)?;

                    let to_transfer_dst = vk::ImageMemoryBarrier2::default()
                        .src_stage_mask(vk::PipelineStageFlags2::TOP_OF_PIPE)
                        .dst_stage_mask(vk::PipelineStageFlags2::TRANSFER)
                        .dst_access_mask(vk::AccessFlags2::TRANSFER_WRITE)
                        .old_layout(pre_layout)
                        .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                        .image(dst)
                        .subresource_range(all_mips);
                    let dependency = vk::DependencyInfo::default()
                        .image_memory_barriers(std::slice::from_ref(&to_transfer_dst));
                    device.cmd_pipeline_barrier2(command_buffer, &dependency);

                    let regions: Vec<_> = (0..array_layers)
                        .map(|layer| {
                            vk::BufferImageCopy::default()
                                .buffer_offset(layer as vk::DeviceSize * layer_bytes)
                                .buffer_row_length(0)
                                .buffer_image_height(0)
                                .image_subresource(
                                    vk::ImageSubresourceLayers::default()
                                        .aspect_mask(vk::ImageAspectFlags::COLOR)
                                        .mip_level(0)
                                        .base_array_layer(layer)
                                        .layer_count(1),
                                )
                                .image_extent(extent)
                        })
                        .collect();
                    device.cmd_copy_buffer_to_image(
                        command_buffer,
                        staging.buffer.raw,
                        dst,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &regions,
                    );

                    if mip_levels > 1 {
                        Self::record_mip_chain(&device, command_buffer, dst, extent, mip_levels, array_layers);
                    } else {
                        let to_final = vk::ImageMemoryBarrier2::default()
                            .src_stage_mask(vk::PipelineStageFlags2::TRANSFER)
                            .src_access_mask(vk::AccessFlags2::TRANSFER_WRITE)
                            .dst_stage_mask(vk::PipelineStageFlags2::BOTTOM_OF_PIPE)
                            .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                            .new_layout(post_layout)
                            .image(dst)
                            .subresource_range(mip_zero);
                        let dependency = vk::DependencyInfo::default()
                            .image_memory_barriers(std::slice::from_ref(&to_final));
                        device.cmd_pipeline_barrier2(command_buffer, &dependency);
                    }

                    device.end_command_buffer(command_buffer)?;
                }

                // The mip-chain path always leaves every level shader-read,
                // regardless of `post_layout`; the single-mip path leaves
                // the image in exactly `post_layout`.
                let final_layout =
                    if mip_levels > 1 { vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL } else { post_layout };
                layout_tracker.set(dst, final_layout);

                active.lock().push(StageEntry { staging, command_buffer, completion });
                Ok(())
            })();

            if let Err(err) = result {
                log::error!("transfer upload_image failed: {err}");
            }
        });

        future
    }

    /// Generates mips 1..levels by blitting each level from its predecessor,
    /// alternating the source mip to `TransferSrcOptimal` once its own blit
    /// has completed. Leaves every mip in `ShaderReadOnlyOptimal`.
    unsafe fn record_mip_chain(
        device: &ash::Device,
        command_buffer: vk::CommandBuffer,
        image: vk::Image,
        extent: vk::Extent3D,
        mip_levels: u32,
        array_layers: u32,
    ) {
        let layer_range = |mip: u32| {
            vk::ImageSubresourceRange::default()
                .aspect_mask(vk::ImageAspectFlags::COLOR)
                .base_mip_level(mip)
                .level_count(1)
                .base_array_layer(0)
                .layer_count(array_layers)
        };

        let mut mip_width = extent.width.max(1);
        let mut mip_height = extent.height.max(1);

        for level in 1..mip_levels {
            let src_to_transfer_src = vk::ImageMemoryBarrier2::default()
                .src_stage_mask(vk::PipelineStageFlags2::TRANSFER)
                .src_access_mask(vk::AccessFlags2::TRANSFER_WRITE)
                .dst_stage_mask(vk::PipelineStageFlags2::TRANSFER)
                .dst_access_mask(vk::AccessFlags2::TRANSFER_READ)
                .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .new_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
                .image(image)
                .subresource_range(layer_range(level - 1));
            let dependency =
                vk::DependencyInfo::default().image_memory_barriers(std::slice::from_ref(&src_to_transfer_src));
            device.cmd_pipeline_barrier2(command_buffer, &dependency);

            let next_width = (mip_width / 2).max(1);
            let next_height = (mip_height / 2).max(1);
            let blit = vk::ImageBlit::default()
                .src_subresource(
                    vk::ImageSubresourceLayers::default()
                        .aspect_mask(vk::ImageAspectFlags::COLOR)
                        .mip_level(level - 1)
                        .base_array_layer(0)
                        .layer_count(array_layers),
                )
                .src_offsets([
                    vk::Offset3D::default(),
                    vk::Offset3D { x: mip_width as i32, y: mip_height as i32, z: 1 },
                ])
                .dst_subresource(
                    vk::ImageSubresourceLayers::default()
                        .aspect_mask(vk::ImageAspectFlags::COLOR)
                        .mip_level(level)
                        .base_array_layer(0)
                        .layer_count(array_layers),
                )
                .dst_offsets([
                    vk::Offset3D::default(),
                    vk::Offset3D { x: next_width as i32, y: next_height as i32, z: 1 },
                ]);
            device.cmd_blit_image(
                command_buffer,
                image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                std::slice::from_ref(&blit),
                vk::Filter::LINEAR,
            );

            let src_to_shader_read = vk::ImageMemoryBarrier2::default()
                .src_stage_mask(vk::PipelineStageFlags2::TRANSFER)
                .src_access_mask(vk::AccessFlags2::TRANSFER_READ)
                .dst_stage_mask(vk::PipelineStageFlags2::FRAGMENT_SHADER)
                .dst_access_mask(vk::AccessFlags2::SHADER_READ)
                .old_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
                .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                .image(image)
                .subresource_range(layer_range(level - 1));
            let dependency =
                vk::DependencyInfo::default().image_memory_barriers(std::slice::from_ref(&src_to_shader_read));
            device.cmd_pipeline_barrier2(command_buffer, &dependency);

            mip_width = next_width;
            mip_height = next_height;
        }

        let final_mip_to_shader_read = vk::ImageMemoryBarrier2::default()
            .src_stage_mask(vk::PipelineStageFlags2::TRANSFER)
            .src_access_mask(vk::AccessFlags2::TRANSFER_WRITE)
            .dst_stage_mask(vk::PipelineStageFlags2::FRAGMENT_SHADER)
            .dst_access_mask(vk::AccessFlags2::SHADER_READ)
            .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
            .image(image)
            .subresource_range(layer_range(mip_levels - 1));
        let dependency =
            vk::DependencyInfo::default().image_memory_barriers(std::slice::from_ref(&final_mip_to_shader_read));
        device.cmd_pipeline_barrier2(command_buffer, &dependency);
    }

    fn acquire_command_buffer(
        device: &ash::Device,
        pool: vk::CommandPool,
        free_commands: &Mutex<Vec<vk::CommandBuffer>>,
    ) -> Result<vk::CommandBuffer> {
        if let Some(cmd) = free_commands.lock().pop() {
            return Ok(cmd);
        }
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        Ok(unsafe { device.allocate_command_buffers(&alloc_info)?[0] })
    }

    fn submit_job(&self, job: impl FnOnce() + Send + 'static) {
        if self.jobs.send(Box::new(job)).is_err() {
            log::error!("transfer engine job queue is closed; dropping upload");
        }
    }

    /// Submits whatever has accumulated on `active` as one batch, and
    /// retires submitted batches whose fence is signalled and whose frame
    /// pad has elapsed. Call exactly once per frame.
    pub fn update(&self) -> Result<()> {
        {
            let mut submitted = self.submitted.lock();
            let mut still_pending = Vec::with_capacity(submitted.len());
            for mut batch in submitted.drain(..) {
                let signalled = unsafe { self.device.get_fence_status(batch.fence)? };
                if signalled {
                    if batch.frame_pad == 0 {
                        unsafe { self.device.reset_fences(&[batch.fence])? };
                        self.free_fences.lock().push(batch.fence);
                        for entry in batch.entries.drain(..) {
                            self.free_commands.lock().push(entry.command_buffer);
                            self.staging.release(entry.staging);
                            entry.completion.signal();
                        }
                        continue;
                    }
                    batch.frame_pad -= 1;
                }
                still_pending.push(batch);
            }
            *submitted = still_pending;
        }

        let mut active = self.active.lock();
        if active.is_empty() {
            return Ok(());
        }

        let entries = std::mem::take(&mut *active);
        drop(active);

        let command_buffers: Vec<_> = entries.iter().map(|e| e.command_buffer).collect();
        let fence = self.next_fence()?;
        let submit_info = vk::SubmitInfo::default().command_buffers(&command_buffers);
        unsafe {
            self.device
                .queue_submit(*self.queue.lock(), std::slice::from_ref(&submit_info), fence)?;
        }

        self.submitted.lock().push(Batch {
            entries,
            fence,
            frame_pad: self.in_flight_frames,
        });

        Ok(())
    }

    /// Stops accepting new work, lets the worker finish draining so every
    /// closure still runs and records its copy, submits whatever that leaves
    /// in the active batch, waits for the queue to drain, and then resolves
    /// every completion regardless of fence state. Only valid at shutdown;
    /// callers must not submit further uploads afterward. No promise is
    /// dropped unresolved — a waiting caller is guaranteed to wake.
    pub fn shutdown(&self) -> Result<()> {
        if let Some(worker) = self.worker.lock().take() {
            drop(self.jobs.clone());
            let _ = worker.join();
        }

        // The worker may have recorded further copies into `active` while
        // draining; fold them into one last batch so their completions are
        // resolved below rather than dropped silently.
        self.update()?;

        unsafe { self.device.queue_wait_idle(*self.queue.lock())? };

        let mut submitted = self.submitted.lock();
        for batch in submitted.drain(..) {
            for entry in batch.entries {
                self.free_commands.lock().push(entry.command_buffer);
                self.staging.release(entry.staging);
                entry.completion.signal();
            }
            unsafe { self.device.destroy_fence(batch.fence, None) };
        }
        drop(submitted);

        for fence in self.free_fences.lock().drain(..) {
            unsafe { self.device.destroy_fence(fence, None) };
        }

        Ok(())
    }
}

impl Drop for TransferEngine {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            log::warn!("error during transfer engine shutdown: {err}");
        }
        unsafe {
            self.device.destroy_command_pool(self.command_pool, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ceil_pot_rounds_up_to_power_of_two() {
        assert_eq!(ceil_pot(1), 2);
        assert_eq!(ceil_pot(2), 2);
        assert_eq!(ceil_pot(3), 4);
        assert_eq!(ceil_pot(1023), 1024);
        assert_eq!(ceil_pot(1024), 1024);
        assert_eq!(ceil_pot(1025), 2048);
    }

    #[test]
    fn transfer_future_wait_returns_after_signal() {
        let (future, completion) = TransferFuture::new();
        assert!(!future.is_ready());
        let waiter = future.clone();
        let handle = std::thread::spawn(move || {
            waiter.wait();
        });
        std::thread::sleep(std::time::Duration::from_millis(10));
        completion.signal();
        handle.join().unwrap();
        assert!(future.is_ready());
    }
}
