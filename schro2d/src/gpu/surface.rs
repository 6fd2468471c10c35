//! The swapchain and its presentable images.
//!
//! Images are written directly by the compute program as storage images, so
//! only surface formats whose optimal tiling supports storage access are
//! considered. The surface is configured once; it is never recreated.

use ash::vk;
use tracing::{info, instrument, warn};

use crate::{
    error::{EngineError, EngineResult, SurfaceStatus, VkResultExt},
    field::Grid,
    gpu::context::DeviceContext,
    teardown::OwnershipList,
};

/// Number of presentable images requested before clamping.
pub const DESIRED_IMAGE_COUNT: u32 = 2;

/// One presentable image and its view.
#[derive(Debug, Clone, Copy)]
pub struct PresentableImage {
    /// The swapchain image.
    pub image: vk::Image,
    /// Storage view over the whole image.
    pub view: vk::ImageView,
}

/// The configured swapchain.
pub struct SurfaceChain {
    loader: ash::khr::swapchain::Device,
    swapchain: vk::SwapchainKHR,
    images: Vec<PresentableImage>,
    format: vk::SurfaceFormatKHR,
    extent: vk::Extent2D,
}

impl SurfaceChain {
    /// Configures the surface for storage writes at roughly `grid` size.
    #[instrument(level = "info", skip_all)]
    pub fn create(
        context: &DeviceContext,
        grid: Grid,
        owned: &mut OwnershipList,
    ) -> EngineResult<Self> {
        let surface_loader = &context.surface_loader;
        let (capabilities, formats) = unsafe {
            (
                surface_loader
                    .get_physical_device_surface_capabilities(
                        context.physical_device,
                        context.surface,
                    )
                    .during("vkGetPhysicalDeviceSurfaceCapabilitiesKHR")?,
                surface_loader
                    .get_physical_device_surface_formats(context.physical_device, context.surface)
                    .during("vkGetPhysicalDeviceSurfaceFormatsKHR")?,
            )
        };
        if !capabilities
            .supported_usage_flags
            .contains(vk::ImageUsageFlags::STORAGE)
        {
            return Err(EngineError::StorageUnsupported);
        }

        let format = choose_surface_format(&formats, |format| {
            let properties = unsafe {
                context
                    .instance
                    .get_physical_device_format_properties(context.physical_device, format)
            };
            properties
                .optimal_tiling_features
                .contains(vk::FormatFeatureFlags::STORAGE_IMAGE)
        })
        .ok_or(EngineError::NoSurfaceFormat {
            available: formats.len(),
        })?;
        let extent = choose_extent(&capabilities, grid);
        if extent.width != grid.width || extent.height != grid.height {
            warn!(
                "Surface extent {}x{} differs from the {}x{} simulation grid",
                extent.width, extent.height, grid.width, grid.height
            );
        }
        let image_count = choose_image_count(&capabilities, DESIRED_IMAGE_COUNT);
        info!(
            "Using surface format {:?} / {:?}, {image_count} images, FIFO presentation",
            format.format, format.color_space
        );

        let loader = ash::khr::swapchain::Device::new(&context.instance, &context.device);
        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(context.surface)
            .min_image_count(image_count)
            .image_format(format.format)
            .image_color_space(format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::STORAGE)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(vk::PresentModeKHR::FIFO)
            .clipped(true);
        let swapchain = unsafe {
            loader
                .create_swapchain(&create_info, None)
                .during("vkCreateSwapchainKHR")?
        };
        let destroy = loader.clone();
        owned.adopt("swapchain", swapchain, move |swapchain| unsafe {
            destroy.destroy_swapchain(swapchain, None);
        });

        let handles = unsafe {
            loader
                .get_swapchain_images(swapchain)
                .during("vkGetSwapchainImagesKHR")?
        };
        let images = handles
            .into_iter()
            .map(|image| {
                let view = create_view(&context.device, image, format.format)?;
                let destroy = context.device.clone();
                owned.adopt("image view", view, move |view| unsafe {
                    destroy.destroy_image_view(view, None);
                });
                Ok(PresentableImage { image, view })
            })
            .collect::<EngineResult<Vec<_>>>()?;

        Ok(Self {
            loader,
            swapchain,
            images,
            format,
            extent,
        })
    }

    /// The presentable images, indexed by image index.
    #[must_use]
    pub fn images(&self) -> &[PresentableImage] {
        &self.images
    }

    /// Negotiated format.
    #[must_use]
    pub fn format(&self) -> vk::SurfaceFormatKHR {
        self.format
    }

    /// Size of each presentable image.
    #[must_use]
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Blocks for a free image; `signal` fires once it may be written.
    pub fn acquire(&self, signal: vk::Semaphore) -> EngineResult<u32> {
        let result = unsafe {
            self.loader
                .acquire_next_image(self.swapchain, u64::MAX, signal, vk::Fence::null())
        };
        match result {
            Ok((index, false)) => Ok(index),
            Ok((_, true)) => Err(EngineError::SurfaceState(SurfaceStatus::Suboptimal)),
            Err(result) => Err(surface_error("vkAcquireNextImageKHR", result)),
        }
    }

    /// Queues `index` for presentation after `wait` fires.
    pub fn present(&self, queue: vk::Queue, wait: vk::Semaphore, index: u32) -> EngineResult<()> {
        let waits = [wait];
        let swapchains = [self.swapchain];
        let indices = [index];
        let info = vk::PresentInfoKHR::default()
            .wait_semaphores(&waits)
            .swapchains(&swapchains)
            .image_indices(&indices);
        match unsafe { self.loader.queue_present(queue, &info) } {
            Ok(false) => Ok(()),
            Ok(true) => Err(EngineError::SurfaceState(SurfaceStatus::Suboptimal)),
            Err(result) => Err(surface_error("vkQueuePresentKHR", result)),
        }
    }
}

fn surface_error(call: &'static str, result: vk::Result) -> EngineError {
    if result == vk::Result::ERROR_OUT_OF_DATE_KHR {
        EngineError::SurfaceState(SurfaceStatus::OutOfDate)
    } else {
        EngineError::Vulkan { call, result }
    }
}

fn create_view(
    device: &ash::Device,
    image: vk::Image,
    format: vk::Format,
) -> EngineResult<vk::ImageView> {
    let info = vk::ImageViewCreateInfo::default()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .subresource_range(color_range());
    unsafe {
        device
            .create_image_view(&info, None)
            .during("vkCreateImageView")
    }
}

/// The single color mip level and layer of a presentable image.
#[must_use]
pub fn color_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange::default()
        .aspect_mask(vk::ImageAspectFlags::COLOR)
        .level_count(1)
        .layer_count(1)
}

/// Picks the best offered format usable as a storage image.
///
/// Half-float HDR is preferred, then 8-bit UNORM in sRGB color space, then
/// 8-bit sRGB.
pub fn choose_surface_format(
    offered: &[vk::SurfaceFormatKHR],
    mut supports_storage: impl FnMut(vk::Format) -> bool,
) -> Option<vk::SurfaceFormatKHR> {
    let preferences = [
        (
            vk::Format::R16G16B16A16_SFLOAT,
            vk::ColorSpaceKHR::HDR10_HLG_EXT,
        ),
        (vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        (vk::Format::B8G8R8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        (vk::Format::R8G8B8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR),
    ];
    preferences.into_iter().find_map(|(format, color_space)| {
        offered
            .iter()
            .find(|candidate| candidate.format == format && candidate.color_space == color_space)
            .filter(|candidate| supports_storage(candidate.format))
            .copied()
    })
}

/// `desired` clamped to what the surface allows. A maximum of zero means
/// unbounded.
#[must_use]
pub fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR, desired: u32) -> u32 {
    let count = desired.max(capabilities.min_image_count);
    if capabilities.max_image_count > 0 {
        count.min(capabilities.max_image_count)
    } else {
        count
    }
}

/// The surface's fixed extent, or the grid size clamped to the allowed range
/// when the surface lets the swapchain decide.
#[must_use]
pub fn choose_extent(capabilities: &vk::SurfaceCapabilitiesKHR, grid: Grid) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }
    let (min, max) = (capabilities.min_image_extent, capabilities.max_image_extent);
    vk::Extent2D {
        width: grid.width.clamp(min.width, max.width),
        height: grid.height.clamp(min.height, max.height),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(format: vk::Format, color_space: vk::ColorSpaceKHR) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space,
        }
    }

    #[test]
    fn hdr_format_is_preferred_when_storable() {
        let offered = [
            format(vk::Format::B8G8R8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            format(
                vk::Format::R16G16B16A16_SFLOAT,
                vk::ColorSpaceKHR::HDR10_HLG_EXT,
            ),
        ];
        let chosen = choose_surface_format(&offered, |_| true).unwrap();
        assert_eq!(chosen.format, vk::Format::R16G16B16A16_SFLOAT);

        let chosen =
            choose_surface_format(&offered, |f| f != vk::Format::R16G16B16A16_SFLOAT).unwrap();
        assert_eq!(chosen.format, vk::Format::B8G8R8A8_UNORM);
    }

    #[test]
    fn color_space_must_match() {
        let offered = [format(
            vk::Format::R8G8B8A8_UNORM,
            vk::ColorSpaceKHR::DISPLAY_P3_NONLINEAR_EXT,
        )];
        assert!(choose_surface_format(&offered, |_| true).is_none());
    }

    #[test]
    fn no_storable_format_is_none() {
        let offered = [format(
            vk::Format::R8G8B8A8_SRGB,
            vk::ColorSpaceKHR::SRGB_NONLINEAR,
        )];
        assert!(choose_surface_format(&offered, |_| false).is_none());
        assert!(choose_surface_format(&[], |_| true).is_none());
    }

    #[test]
    fn image_count_is_clamped() {
        let mut caps = vk::SurfaceCapabilitiesKHR {
            min_image_count: 3,
            max_image_count: 0,
            ..Default::default()
        };
        assert_eq!(choose_image_count(&caps, 2), 3);
        caps.min_image_count = 1;
        assert_eq!(choose_image_count(&caps, 2), 2);
        caps.max_image_count = 1;
        assert_eq!(choose_image_count(&caps, 2), 1);
    }

    #[test]
    fn extent_follows_surface_unless_undefined() {
        let grid = Grid::new(1600, 1200).unwrap();
        let mut caps = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: 800,
                height: 600,
            },
            ..Default::default()
        };
        assert_eq!(choose_extent(&caps, grid).width, 800);

        caps.current_extent.width = u32::MAX;
        caps.min_image_extent = vk::Extent2D {
            width: 1,
            height: 1,
        };
        caps.max_image_extent = vk::Extent2D {
            width: 1024,
            height: 4096,
        };
        let extent = choose_extent(&caps, grid);
        assert_eq!((extent.width, extent.height), (1024, 1200));
    }
}
