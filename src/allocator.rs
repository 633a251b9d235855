use std::sync::atomic::{AtomicU64, Ordering};

use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator as GpuAllocator,
    AllocatorCreateDesc,
};
use gpu_allocator::{AllocationSizes, AllocatorDebugSettings, MemoryLocation};
use parking_lot::Mutex;

use crate::error::Result;

/// Usage hint for a single allocation. Maps onto `gpu_allocator`'s
/// `MemoryLocation`; `CpuOnly` and `CpuToGpu` both resolve to `CpuToGpu`
/// since `gpu_allocator` does not distinguish a write-only host allocation
/// from one the GPU also reads — both are host-visible + host-coherent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationUsage {
    CpuOnly,
    CpuToGpu,
    GpuOnly,
    GpuToCpu,
}

impl AllocationUsage {
    fn to_memory_location(self) -> MemoryLocation {
        match self {
            AllocationUsage::CpuOnly | AllocationUsage::CpuToGpu => MemoryLocation::CpuToGpu,
            AllocationUsage::GpuOnly => MemoryLocation::GpuOnly,
            AllocationUsage::GpuToCpu => MemoryLocation::GpuToCpu,
        }
    }

    pub fn is_host_visible(self) -> bool {
        !matches!(self, AllocationUsage::GpuOnly)
    }
}

/// Informational triple returned alongside an allocation. Callers do not
/// bind memory manually; this is exposed for telemetry/debug logging only.
#[derive(Debug, Clone, Copy)]
pub struct AllocationInfo {
    pub device_memory: vk::DeviceMemory,
    pub offset: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationKind {
    Buffer,
    Image,
}

/// Thin facade over `gpu_allocator::vulkan::Allocator`. Tracks a running
/// total of live bytes per kind for telemetry/debug logging, and warns on
/// drop if anything was not freed — the allocation-accounting invariant
/// from spec.md §8 is meant to be checked by the embedder against these
/// counters after a final `device.wait_idle()` + deferred flush.
pub struct Allocator {
    inner: Mutex<GpuAllocator>,
    buffer_bytes: AtomicU64,
    image_bytes: AtomicU64,
}

impl Allocator {
    pub fn new(
        instance: ash::Instance,
        device: ash::Device,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Self> {
        let inner = GpuAllocator::new(&AllocatorCreateDesc {
            instance,
            device,
            physical_device,
            debug_settings: AllocatorDebugSettings {
                log_memory_information: true,
                log_leaks_on_shutdown: true,
                ..Default::default()
            },
            buffer_device_address: false,
            allocation_sizes: AllocationSizes::default(),
        })
        .map_err(|e| crate::error::Error::ResourceCreation(e.to_string()))?;

        Ok(Self {
            inner: Mutex::new(inner),
            buffer_bytes: AtomicU64::new(0),
            image_bytes: AtomicU64::new(0),
        })
    }

    pub fn allocate(
        &self,
        name: &str,
        kind: AllocationKind,
        requirements: vk::MemoryRequirements,
        usage: AllocationUsage,
    ) -> Result<(Allocation, AllocationInfo)> {
        let allocation = self
            .inner
            .lock()
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location: usage.to_memory_location(),
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| crate::error::Error::ResourceCreation(e.to_string()))?;

        let info = AllocationInfo {
            device_memory: allocation.memory(),
            offset: allocation.offset(),
            size: allocation.size(),
        };

        let counter = match kind {
            AllocationKind::Buffer => &self.buffer_bytes,
            AllocationKind::Image => &self.image_bytes,
        };
        counter.fetch_add(info.size, Ordering::Relaxed);

        Ok((allocation, info))
    }

    pub fn free(&self, kind: AllocationKind, allocation: Allocation) -> Result<()> {
        let size = allocation.size();
        self.inner
            .lock()
            .free(allocation)
            .map_err(|e| crate::error::Error::ResourceCreation(e.to_string()))?;

        let counter = match kind {
            AllocationKind::Buffer => &self.buffer_bytes,
            AllocationKind::Image => &self.image_bytes,
        };
        counter.fetch_sub(size, Ordering::Relaxed);

        Ok(())
    }

    pub fn buffer_bytes(&self) -> u64 {
        self.buffer_bytes.load(Ordering::Relaxed)
    }

    pub fn image_bytes(&self) -> u64 {
        self.image_bytes.load(Ordering::Relaxed)
    }
}

impl Drop for Allocator {
    fn drop(&mut self) {
        let buffer_bytes = self.buffer_bytes();
        let image_bytes = self.image_bytes();
        if buffer_bytes != 0 || image_bytes != 0 {
            log::warn!(
                "allocator dropped with outstanding allocations: {} buffer bytes, {} image bytes",
                buffer_bytes,
                image_bytes
            );
        }
    }
}
