use std::ffi::CStr;

use ash::vk;

use crate::error::{Error, Result};

pub const REQUIRED_DEVICE_EXTENSIONS: &[&str] = if cfg!(target_os = "macos") {
    &["VK_KHR_swapchain", "VK_KHR_portability_subset"]
} else {
    &["VK_KHR_swapchain"]
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamily {
    pub index: u32,
    pub queue_count: u32,
    pub graphics: bool,
    pub compute: bool,
    pub transfer: bool,
    pub present: bool,
}

/// Everything about a physical device needed to rank and select it, kept
/// separate from live `vk::PhysicalDevice` queries so the selection policy
/// itself is pure and testable without an instance.
#[derive(Debug, Clone)]
pub struct PhysicalDeviceInfo {
    pub raw: vk::PhysicalDevice,
    pub name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub properties: vk::PhysicalDeviceProperties,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub queue_families: Vec<QueueFamily>,
    pub extensions: Vec<String>,
}

impl PhysicalDeviceInfo {
    pub fn supports_extensions(&self, required: &[&str]) -> bool {
        required
            .iter()
            .all(|ext| self.extensions.iter().any(|have| have == ext))
    }

    fn score(&self) -> i32 {
        if self.device_type == vk::PhysicalDeviceType::DISCRETE_GPU {
            10
        } else {
            0
        }
    }

    pub fn max_sampler_count(&self) -> u32 {
        self.properties
            .limits
            .max_descriptor_set_samplers
            .min(self.properties.limits.max_per_stage_descriptor_samplers)
    }

    pub fn line_width_range(&self) -> [f32; 2] {
        self.properties.limits.line_width_range
    }
}

/// Enumerates physical devices and collects the information needed by
/// `select`. Requires a valid surface to query present support per family.
pub unsafe fn enumerate(
    instance: &ash::Instance,
    surface_loader: &ash::khr::surface::Instance,
    surface: vk::SurfaceKHR,
) -> Result<Vec<PhysicalDeviceInfo>> {
    let raw_devices = instance.enumerate_physical_devices()?;
    raw_devices
        .into_iter()
        .map(|raw| describe(instance, surface_loader, surface, raw))
        .collect()
}

unsafe fn describe(
    instance: &ash::Instance,
    surface_loader: &ash::khr::surface::Instance,
    surface: vk::SurfaceKHR,
    raw: vk::PhysicalDevice,
) -> Result<PhysicalDeviceInfo> {
    let properties = instance.get_physical_device_properties(raw);
    let memory_properties = instance.get_physical_device_memory_properties(raw);
    let name = CStr::from_ptr(properties.device_name.as_ptr())
        .to_string_lossy()
        .into_owned();

    let queue_family_properties = instance.get_physical_device_queue_family_properties(raw);
    let mut queue_families = Vec::with_capacity(queue_family_properties.len());
    for (index, props) in queue_family_properties.iter().enumerate() {
        let present = surface_loader.get_physical_device_surface_support(raw, index as u32, surface)?;
        queue_families.push(QueueFamily {
            index: index as u32,
            queue_count: props.queue_count,
            graphics: props.queue_flags.contains(vk::QueueFlags::GRAPHICS),
            compute: props.queue_flags.contains(vk::QueueFlags::COMPUTE),
            transfer: props.queue_flags.contains(vk::QueueFlags::TRANSFER),
            present,
        });
    }

    let extension_properties = instance.enumerate_device_extension_properties(raw)?;
    let extensions = extension_properties
        .iter()
        .map(|prop| {
            CStr::from_ptr(prop.extension_name.as_ptr())
                .to_string_lossy()
                .into_owned()
        })
        .collect();

    Ok(PhysicalDeviceInfo {
        raw,
        name,
        device_type: properties.device_type,
        properties,
        memory_properties,
        queue_families,
        extensions,
    })
}

/// Selection policy from the data model: enumerate devices supporting the
/// required extension set, score by (discrete GPU + 10), break ties by
/// first. A caller-supplied name overrides automatic selection outright.
pub fn select<'a>(
    devices: &'a [PhysicalDeviceInfo],
    required_extensions: &[&str],
    preferred_name: Option<&str>,
) -> Result<&'a PhysicalDeviceInfo> {
    let eligible: Vec<&PhysicalDeviceInfo> = devices
        .iter()
        .filter(|d| d.supports_extensions(required_extensions))
        .collect();

    if eligible.is_empty() {
        return Err(Error::NoSuitablePhysicalDevice);
    }

    if let Some(name) = preferred_name {
        if let Some(found) = eligible.iter().find(|d| d.name == name) {
            return Ok(found);
        }
        log::warn!(
            "preferred device '{}' not found among eligible devices; falling back to automatic selection",
            name
        );
    }

    let mut best = eligible[0];
    let mut best_score = best.score();
    for candidate in &eligible[1..] {
        let score = candidate.score();
        if score > best_score {
            best = candidate;
            best_score = score;
        }
    }
    Ok(best)
}

/// Picks one combined graphics+present queue family, and (if requested and
/// available) a separate transfer-only family for the transfer engine.
pub struct QueueSelection {
    pub graphics_present: u32,
    pub dedicated_transfer: Option<u32>,
}

pub fn select_queue_families(
    device: &PhysicalDeviceInfo,
    want_dedicated_transfer: bool,
) -> Result<QueueSelection> {
    let graphics_present = device
        .queue_families
        .iter()
        .find(|f| f.graphics && f.present && f.queue_count > 0)
        .map(|f| f.index)
        .ok_or(Error::NoSuitablePhysicalDevice)?;

    let dedicated_transfer = if want_dedicated_transfer {
        device
            .queue_families
            .iter()
            .find(|f| f.transfer && !f.graphics && f.index != graphics_present && f.queue_count > 0)
            .map(|f| f.index)
    } else {
        None
    };

    Ok(QueueSelection {
        graphics_present,
        dedicated_transfer,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Mirrors the app crates' `env_logger::init_from_env` setup so `cargo
    /// test -- --nocapture` shows scoring decisions; guarded by `Once` since
    /// the test binary runs every test in one process and `env_logger` can
    /// only be initialised once.
    fn init_test_logger() {
        static INIT: std::sync::Once = std::sync::Once::new();
        INIT.call_once(|| {
            let env = env_logger::Env::default().filter_or("VKCORE_LOG_LEVEL", "debug");
            let _ = env_logger::try_init_from_env(env);
        });
    }

    fn device(name: &str, device_type: vk::PhysicalDeviceType, extensions: &[&str]) -> PhysicalDeviceInfo {
        PhysicalDeviceInfo {
            raw: vk::PhysicalDevice::null(),
            name: name.to_string(),
            device_type,
            properties: vk::PhysicalDeviceProperties::default(),
            memory_properties: vk::PhysicalDeviceMemoryProperties::default(),
            queue_families: vec![QueueFamily {
                index: 0,
                queue_count: 1,
                graphics: true,
                compute: true,
                transfer: true,
                present: true,
            }],
            extensions: extensions.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn prefers_discrete_gpu_over_integrated() {
        init_test_logger();
        let devices = vec![
            device("integrated", vk::PhysicalDeviceType::INTEGRATED_GPU, &["VK_KHR_swapchain"]),
            device("discrete", vk::PhysicalDeviceType::DISCRETE_GPU, &["VK_KHR_swapchain"]),
        ];
        let selected = select(&devices, &["VK_KHR_swapchain"], None).unwrap();
        assert_eq!(selected.name, "discrete");
    }

    #[test]
    fn breaks_ties_by_first_occurrence() {
        let devices = vec![
            device("first", vk::PhysicalDeviceType::DISCRETE_GPU, &["VK_KHR_swapchain"]),
            device("second", vk::PhysicalDeviceType::DISCRETE_GPU, &["VK_KHR_swapchain"]),
        ];
        let selected = select(&devices, &["VK_KHR_swapchain"], None).unwrap();
        assert_eq!(selected.name, "first");
    }

    #[test]
    fn name_override_wins_over_scoring() {
        let devices = vec![
            device("discrete", vk::PhysicalDeviceType::DISCRETE_GPU, &["VK_KHR_swapchain"]),
            device("integrated", vk::PhysicalDeviceType::INTEGRATED_GPU, &["VK_KHR_swapchain"]),
        ];
        let selected = select(&devices, &["VK_KHR_swapchain"], Some("integrated")).unwrap();
        assert_eq!(selected.name, "integrated");
    }

    #[test]
    fn devices_missing_required_extensions_are_excluded() {
        let devices = vec![device("no-swapchain", vk::PhysicalDeviceType::DISCRETE_GPU, &[])];
        assert!(matches!(
            select(&devices, &["VK_KHR_swapchain"], None),
            Err(Error::NoSuitablePhysicalDevice)
        ));
    }
}
