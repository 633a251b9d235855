use std::ffi::{c_void, CStr, CString};

use ash::ext::debug_utils;
use ash::vk;
use raw_window_handle::RawDisplayHandle;

use crate::error::{Error, Result};

pub struct InstanceCreateInfo<'a> {
    /// Extra instance-level extensions required by the embedder (e.g. the
    /// platform surface extension). Debug-utils is always added when
    /// validation is requested.
    pub required_extensions: &'a [*const i8],
    pub validation: bool,
    pub app_name: &'a str,
}

pub struct Instance {
    pub(crate) entry: ash::Entry,
    pub(crate) raw: ash::Instance,
    pub(crate) debug_utils: Option<debug_utils::Instance>,
    debug_utils_messenger: vk::DebugUtilsMessengerEXT,
    pub(crate) validation_enabled: bool,
}

const VALIDATION_LAYER_NAME: &CStr = c"VK_LAYER_KHRONOS_validation";

impl Instance {
    pub fn new(info: InstanceCreateInfo) -> Result<Self> {
        let entry = unsafe { ash::Entry::load().map_err(Error::LoaderMissing)? };

        let app_name = CString::new(info.app_name).unwrap_or_else(|_| CString::new("app").unwrap());
        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name)
            .api_version(vk::API_VERSION_1_3);

        let mut extension_names = info.required_extensions.to_vec();
        if info.validation {
            extension_names.push(debug_utils::NAME.as_ptr());
        }

        // Validation layers fall back silently to no layers if unavailable —
        // init failure with a requested layer must never be fatal.
        let available_layers = unsafe { entry.enumerate_instance_layer_properties()? };
        let validation_available = available_layers.iter().any(|layer| {
            let name = unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) };
            name == VALIDATION_LAYER_NAME
        });
        let validation_enabled = info.validation && validation_available;
        if info.validation && !validation_available {
            log::warn!("validation requested but VK_LAYER_KHRONOS_validation is not available; continuing without it");
        }

        let layer_names: Vec<*const i8> = if validation_enabled {
            vec![VALIDATION_LAYER_NAME.as_ptr()]
        } else {
            Vec::new()
        };

        let instance_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extension_names)
            .enabled_layer_names(&layer_names);

        let raw = unsafe { entry.create_instance(&instance_info, None)? };

        let (debug_utils, debug_utils_messenger) = if validation_enabled {
            let debug_utils = debug_utils::Instance::new(&entry, &raw);
            let debug_utils_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
                .message_severity(
                    vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
                        | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                        | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
                )
                .message_type(
                    vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                        | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                        | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
                )
                .pfn_user_callback(Some(vulkan_debug_utils_callback));
            let messenger =
                unsafe { debug_utils.create_debug_utils_messenger(&debug_utils_info, None)? };
            (Some(debug_utils), messenger)
        } else {
            (None, vk::DebugUtilsMessengerEXT::null())
        };

        Ok(Self {
            entry,
            raw,
            debug_utils,
            debug_utils_messenger,
            validation_enabled,
        })
    }

    pub fn raw(&self) -> &ash::Instance {
        &self.raw
    }

    pub fn entry(&self) -> &ash::Entry {
        &self.entry
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        log::trace!("instance dropped");
        unsafe {
            if let Some(debug_utils) = &self.debug_utils {
                debug_utils.destroy_debug_utils_messenger(self.debug_utils_messenger, None);
            }
            self.raw.destroy_instance(None);
        }
    }
}

unsafe extern "system" fn vulkan_debug_utils_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message);

    // Validation errors are treated as usage errors with an assertion in
    // debug builds; everything else is just routed to the logger.
    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[vk][{:?}] {:?}", message_type, message);
            debug_assert!(
                std::env::var_os("VKCORE_NO_VALIDATION_ASSERT").is_some(),
                "validation error: {:?}",
                message
            );
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => log::warn!("[vk] {:?}", message),
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => log::info!("[vk] {:?}", message),
        _ => log::debug!("[vk] {:?}", message),
    }

    vk::FALSE
}

/// Which raw-display-handle the embedder's surface extension set derives
/// from. Exposed so the device layer can ask `ash_window` for the required
/// extension list without taking a hard platform dependency itself.
pub fn required_surface_extensions(display_handle: RawDisplayHandle) -> Result<Vec<*const i8>> {
    Ok(ash_window::enumerate_required_extensions(display_handle)?.to_vec())
}
