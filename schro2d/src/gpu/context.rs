//! Instance, surface, physical device selection and the logical device.

use std::{
    borrow::Cow,
    cmp::Reverse,
    ffi::{CStr, c_char, c_void},
};

use ash::vk;
use tracing::{debug, error, info, instrument, trace, warn};
use winit::raw_window_handle::{HasDisplayHandle, HasWindowHandle};

use crate::{
    config::FeatureToggles,
    error::{EngineError, EngineResult, VkResultExt},
    gpu::allocator::Allocator,
    teardown::OwnershipList,
};

const APPLICATION_NAME: &CStr = c"schro2d";

/// Everything the rest of the backend needs from the device.
pub struct DeviceContext {
    /// Loaded Vulkan entry points.
    pub entry: ash::Entry,
    /// The instance.
    pub instance: ash::Instance,
    /// Surface extension functions.
    pub surface_loader: ash::khr::surface::Instance,
    /// The window's surface.
    pub surface: vk::SurfaceKHR,
    /// The selected physical device.
    pub physical_device: vk::PhysicalDevice,
    /// The logical device.
    pub device: ash::Device,
    /// Queue family supporting graphics, compute and presentation.
    pub queue_family: u32,
    /// The single queue all work is submitted to.
    pub queue: vk::Queue,
}

impl DeviceContext {
    /// Creates the instance, surface and device for `window`.
    ///
    /// Every created object is registered in `owned`.
    #[instrument(level = "info", skip_all)]
    pub fn create<W>(
        window: &W,
        features: &FeatureToggles,
        owned: &mut OwnershipList,
    ) -> EngineResult<Self>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let entry = unsafe { ash::Entry::load()? };
        let display = window.display_handle()?.as_raw();
        let window_handle = window.window_handle()?.as_raw();

        let instance = create_instance(&entry, display, features)?;
        let keep_loaded = entry.clone();
        let destroy = instance.clone();
        owned.defer("instance", move || {
            unsafe { destroy.destroy_instance(None) };
            drop(keep_loaded);
        });

        if features.validation {
            install_messenger(&entry, &instance, owned)?;
        }

        let surface_loader = ash::khr::surface::Instance::new(&entry, &instance);
        let surface = unsafe {
            ash_window::create_surface(&entry, &instance, display, window_handle, None)
                .during("vkCreateSurfaceKHR")?
        };
        let destroy = surface_loader.clone();
        owned.adopt("surface", surface, move |surface| unsafe {
            destroy.destroy_surface(surface, None);
        });

        let (physical_device, queue_family) =
            select_device(&instance, &surface_loader, surface)?;

        let device = create_device(&instance, physical_device, queue_family, features)?;
        let destroy = device.clone();
        owned.defer("device", move || unsafe { destroy.destroy_device(None) });

        let queue = unsafe { device.get_device_queue(queue_family, 0) };

        Ok(Self {
            entry,
            instance,
            surface_loader,
            surface,
            physical_device,
            device,
            queue_family,
            queue,
        })
    }

    /// The resource allocator for this device. Only one should exist.
    pub fn allocator(&self, owned: &mut OwnershipList) -> EngineResult<Allocator> {
        Allocator::new(&self.instance, &self.device, self.physical_device, owned)
    }
}

fn create_instance(
    entry: &ash::Entry,
    display: winit::raw_window_handle::RawDisplayHandle,
    features: &FeatureToggles,
) -> EngineResult<ash::Instance> {
    let app_info = vk::ApplicationInfo::default()
        .application_name(APPLICATION_NAME)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(APPLICATION_NAME)
        .api_version(vk::API_VERSION_1_3);

    let available = unsafe {
        entry
            .enumerate_instance_extension_properties(None)
            .during("vkEnumerateInstanceExtensionProperties")?
    };
    let offers = |name: &CStr| {
        available
            .iter()
            .any(|ext| ext.extension_name_as_c_str() == Ok(name))
    };

    let mut extensions: Vec<*const c_char> = ash_window::enumerate_required_extensions(display)
        .during("vkEnumerateRequiredExtensions")?
        .to_vec();
    extensions.extend(features.instance_extensions().iter().map(|name| name.as_ptr()));
    if offers(ash::ext::swapchain_colorspace::NAME) {
        extensions.push(ash::ext::swapchain_colorspace::NAME.as_ptr());
    }
    let layers: Vec<*const c_char> = features
        .instance_layers()
        .iter()
        .map(|name| name.as_ptr())
        .collect();
    for layer in features.instance_layers() {
        info!("Enabling instance layer {layer:?}");
    }

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_layer_names(&layers)
        .enabled_extension_names(&extensions)
        .flags(features.instance_flags());
    unsafe {
        entry
            .create_instance(&create_info, None)
            .during("vkCreateInstance")
    }
}

fn install_messenger(
    entry: &ash::Entry,
    instance: &ash::Instance,
    owned: &mut OwnershipList,
) -> EngineResult<()> {
    let loader = ash::ext::debug_utils::Instance::new(entry, instance);
    let info = vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                | vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(forward_validation_message));
    let messenger = unsafe {
        loader
            .create_debug_utils_messenger(&info, None)
            .during("vkCreateDebugUtilsMessengerEXT")?
    };
    owned.adopt("debug messenger", messenger, move |messenger| unsafe {
        loader.destroy_debug_utils_messenger(messenger, None);
    });
    Ok(())
}

unsafe extern "system" fn forward_validation_message(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    kind: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user_data: *mut c_void,
) -> vk::Bool32 {
    let message = if data.is_null() || unsafe { (*data).p_message.is_null() } {
        Cow::Borrowed("<no message>")
    } else {
        unsafe { CStr::from_ptr((*data).p_message) }.to_string_lossy()
    };
    match severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => error!(?kind, "{message}"),
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => warn!(?kind, "{message}"),
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => debug!(?kind, "{message}"),
        _ => trace!(?kind, "{message}"),
    }
    vk::FALSE
}

fn select_device(
    instance: &ash::Instance,
    surface_loader: &ash::khr::surface::Instance,
    surface: vk::SurfaceKHR,
) -> EngineResult<(vk::PhysicalDevice, u32)> {
    let devices = unsafe {
        instance
            .enumerate_physical_devices()
            .during("vkEnumeratePhysicalDevices")?
    };
    if devices.is_empty() {
        return Err(EngineError::NoDevice);
    }

    let mut candidates = Vec::with_capacity(devices.len());
    for &device in &devices {
        let properties = unsafe { instance.get_physical_device_properties(device) };
        let families = unsafe { instance.get_physical_device_queue_family_properties(device) };
        let family = select_queue_family(&families, |index| unsafe {
            surface_loader
                .get_physical_device_surface_support(device, index, surface)
                .unwrap_or(false)
        });
        let name = properties
            .device_name_as_c_str()
            .map_or(Cow::Borrowed("<unnamed>"), CStr::to_string_lossy);
        debug!(
            "Found {name} ({:?}), usable queue family {family:?}",
            properties.device_type
        );
        candidates.push((properties.device_type, family));
    }

    let chosen = pick_device(&candidates).ok_or(EngineError::NoQueueFamily)?;
    let device = devices[chosen];
    let (device_type, family) = candidates[chosen];
    let family = family.ok_or(EngineError::NoQueueFamily)?;
    info!("Using {device_type:?} device {chosen}, queue family {family}");
    Ok((device, family))
}

/// First queue family with graphics and compute support that can present.
pub fn select_queue_family(
    families: &[vk::QueueFamilyProperties],
    mut can_present: impl FnMut(u32) -> bool,
) -> Option<u32> {
    let required = vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE;
    families
        .iter()
        .enumerate()
        .filter(|(_, family)| family.queue_count > 0 && family.queue_flags.contains(required))
        .map(|(index, _)| index as u32)
        .find(|&index| can_present(index))
}

/// Preference of a device type; larger is better.
#[must_use]
pub fn device_rank(kind: vk::PhysicalDeviceType) -> u8 {
    match kind {
        vk::PhysicalDeviceType::DISCRETE_GPU => 4,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 3,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 2,
        vk::PhysicalDeviceType::CPU => 1,
        _ => 0,
    }
}

/// Index of the best device that has a usable queue family. Ties keep
/// enumeration order.
#[must_use]
pub fn pick_device(candidates: &[(vk::PhysicalDeviceType, Option<u32>)]) -> Option<usize> {
    candidates
        .iter()
        .enumerate()
        .filter(|(_, (_, family))| family.is_some())
        .min_by_key(|(index, (kind, _))| (Reverse(device_rank(*kind)), *index))
        .map(|(index, _)| index)
}

fn create_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    queue_family: u32,
    features: &FeatureToggles,
) -> EngineResult<ash::Device> {
    let priorities = [1.0_f32];
    let queue_info = [vk::DeviceQueueCreateInfo::default()
        .queue_family_index(queue_family)
        .queue_priorities(&priorities)];

    let mut extensions = vec![ash::khr::swapchain::NAME.as_ptr()];
    extensions.extend(features.device_extensions().iter().map(|name| name.as_ptr()));

    let mut vulkan13 = vk::PhysicalDeviceVulkan13Features::default().synchronization2(true);
    let create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_info)
        .enabled_extension_names(&extensions)
        .push_next(&mut vulkan13);
    unsafe {
        instance
            .create_device(physical_device, &create_info, None)
            .during("vkCreateDevice")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    #[test]
    fn queue_family_needs_graphics_compute_and_present() {
        let families = [
            family(vk::QueueFlags::COMPUTE),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
        ];
        assert_eq!(select_queue_family(&families, |_| true), Some(1));
        assert_eq!(select_queue_family(&families, |index| index == 2), Some(2));
        assert_eq!(select_queue_family(&families, |index| index == 0), None);
        assert_eq!(select_queue_family(&families[..1], |_| true), None);
    }

    #[test]
    fn discrete_devices_win_and_ties_keep_order() {
        use vk::PhysicalDeviceType as Kind;
        let candidates = [
            (Kind::INTEGRATED_GPU, Some(0)),
            (Kind::DISCRETE_GPU, None),
            (Kind::DISCRETE_GPU, Some(1)),
            (Kind::DISCRETE_GPU, Some(0)),
        ];
        assert_eq!(pick_device(&candidates), Some(2));
        assert_eq!(pick_device(&candidates[..2]), Some(0));
        assert_eq!(pick_device(&[(Kind::CPU, None)]), None);
        assert!(device_rank(Kind::VIRTUAL_GPU) > device_rank(Kind::CPU));
    }
}
