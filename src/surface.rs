use ash::khr;
use ash::vk;

use crate::error::Result;
use crate::instance::Instance;

/// Owns the `VkSurfaceKHR` and the `khr::surface` function-pointer table
/// needed to query it. Surface creation failure is fatal — there is no
/// fallback path, per the error taxonomy in spec.md §7.
pub struct Surface {
    pub(crate) loader: khr::surface::Instance,
    pub(crate) raw: vk::SurfaceKHR,
}

impl Surface {
    pub fn new(instance: &Instance, raw: vk::SurfaceKHR) -> Self {
        let loader = khr::surface::Instance::new(instance.entry(), instance.raw());
        Self { loader, raw }
    }

    pub fn capabilities(&self, physical_device: vk::PhysicalDevice) -> Result<vk::SurfaceCapabilitiesKHR> {
        Ok(unsafe {
            self.loader
                .get_physical_device_surface_capabilities(physical_device, self.raw)?
        })
    }

    pub fn formats(&self, physical_device: vk::PhysicalDevice) -> Result<Vec<vk::SurfaceFormatKHR>> {
        Ok(unsafe {
            self.loader
                .get_physical_device_surface_formats(physical_device, self.raw)?
        })
    }

    pub fn present_modes(&self, physical_device: vk::PhysicalDevice) -> Result<Vec<vk::PresentModeKHR>> {
        Ok(unsafe {
            self.loader
                .get_physical_device_surface_present_modes(physical_device, self.raw)?
        })
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        unsafe {
            self.loader.destroy_surface(self.raw, None);
        }
    }
}
