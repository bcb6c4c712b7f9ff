//! Physical device (GPU) selection and capability queries.
//!
//! # Overview
//!
//! The physical device selection process involves:
//! 1. Enumerating all available GPUs
//! 2. Resolving graphics, compute, transfer and present queue families
//! 3. Verifying the swapchain extension and the required device features
//! 4. Scoring the candidates (preferring discrete GPUs)
//!
//! The module also answers the capability questions the frame graph asks
//! after selection: which depth format to use and how many samples the
//! render target may have.
//!
//! # Example
//!
//! ```no_run
//! use renderer_rhi::instance::Instance;
//! use renderer_rhi::physical_device::select_physical_device;
//! use ash::vk;
//!
//! # fn example(instance: &Instance, surface: vk::SurfaceKHR) -> Result<(), renderer_rhi::RhiError> {
//! let surface_loader = ash::khr::surface::Instance::new(instance.entry(), instance.handle());
//! let device_info = select_physical_device(instance.handle(), surface, &surface_loader)?;
//! println!("Selected GPU: {:?}", device_info.device_name());
//! # Ok(())
//! # }
//! ```

use ash::vk;
use tracing::{debug, info, warn};

use crate::error::{RhiError, RhiResult};

/// Depth formats in order of preference.
pub const DEPTH_FORMAT_PREFERENCE: [vk::Format; 6] = [
    vk::Format::D32_SFLOAT,
    vk::Format::D24_UNORM_S8_UINT,
    vk::Format::D16_UNORM,
    vk::Format::D16_UNORM_S8_UINT,
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::X8_D24_UNORM_PACK32,
];

/// Queue family indices for different queue types.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    /// Index of the queue family that supports graphics operations.
    pub graphics_family: Option<u32>,
    /// Index of the queue family that supports presentation to a surface.
    pub present_family: Option<u32>,
    /// Index of the queue family that supports compute operations.
    pub compute_family: Option<u32>,
    /// Index of the queue family used for uploads.
    pub transfer_family: Option<u32>,
}

impl QueueFamilyIndices {
    /// Checks if the families needed to render and present are available.
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.graphics_family.is_some() && self.present_family.is_some()
    }

    /// Returns the unique queue family indices, in a stable order.
    pub fn unique_families(&self) -> Vec<u32> {
        let mut families = Vec::with_capacity(4);
        for family in [
            self.graphics_family,
            self.present_family,
            self.compute_family,
            self.transfer_family,
        ]
        .into_iter()
        .flatten()
        {
            if !families.contains(&family) {
                families.push(family);
            }
        }
        families
    }
}

/// Information about a physical device (GPU).
#[derive(Clone)]
pub struct PhysicalDeviceInfo {
    /// Vulkan physical device handle.
    pub device: vk::PhysicalDevice,
    /// Device properties (name, limits, API version, etc.).
    pub properties: vk::PhysicalDeviceProperties,
    /// Supported device features.
    pub features: vk::PhysicalDeviceFeatures,
    /// Memory properties (heap sizes, memory types).
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    /// Queue family indices for different operations.
    pub queue_families: QueueFamilyIndices,
}

impl PhysicalDeviceInfo {
    /// Returns the device name as a string.
    pub fn device_name(&self) -> &str {
        self.properties
            .device_name_as_c_str()
            .ok()
            .and_then(|name| name.to_str().ok())
            .unwrap_or("Unknown Device")
    }

    /// Returns a human-readable string for the device type.
    pub fn device_type_name(&self) -> &'static str {
        match self.properties.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => "Discrete GPU",
            vk::PhysicalDeviceType::INTEGRATED_GPU => "Integrated GPU",
            vk::PhysicalDeviceType::VIRTUAL_GPU => "Virtual GPU",
            vk::PhysicalDeviceType::CPU => "CPU",
            _ => "Other",
        }
    }

    /// Returns the Vulkan API version supported by the device.
    pub fn api_version(&self) -> (u32, u32, u32) {
        let version = self.properties.api_version;
        (
            vk::api_version_major(version),
            vk::api_version_minor(version),
            vk::api_version_patch(version),
        )
    }

    /// Returns the total device local memory in bytes.
    pub fn device_local_memory(&self) -> u64 {
        self.memory_properties
            .memory_heaps
            .iter()
            .take(self.memory_properties.memory_heap_count as usize)
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size)
            .sum()
    }

    /// Returns the sample count the offscreen render target should use.
    ///
    /// Without multisampling this is always one sample.
    pub fn best_sample_count(&self, use_multisampling: bool) -> vk::SampleCountFlags {
        if !use_multisampling {
            return vk::SampleCountFlags::TYPE_1;
        }
        let limits = &self.properties.limits;
        highest_sample_count(
            limits.framebuffer_color_sample_counts & limits.framebuffer_depth_sample_counts,
        )
    }

    /// Picks the first depth format from [`DEPTH_FORMAT_PREFERENCE`] usable as
    /// an optimally tiled depth attachment.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::UnsupportedFormat`] if no candidate is supported.
    pub fn find_depth_format(&self, instance: &ash::Instance) -> RhiResult<vk::Format> {
        select_format(
            &DEPTH_FORMAT_PREFERENCE,
            vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
            |format| unsafe {
                instance
                    .get_physical_device_format_properties(self.device, format)
                    .optimal_tiling_features
            },
        )
        .ok_or_else(|| RhiError::UnsupportedFormat("no usable depth format".to_string()))
    }
}

impl std::fmt::Debug for PhysicalDeviceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (major, minor, patch) = self.api_version();
        f.debug_struct("PhysicalDeviceInfo")
            .field("name", &self.device_name())
            .field("type", &self.device_type_name())
            .field("api_version", &format!("{}.{}.{}", major, minor, patch))
            .field("queue_families", &self.queue_families)
            .finish()
    }
}

/// Returns the highest single sample count contained in `counts`.
pub fn highest_sample_count(counts: vk::SampleCountFlags) -> vk::SampleCountFlags {
    let raw = counts.as_raw();
    if raw == 0 {
        return vk::SampleCountFlags::TYPE_1;
    }
    vk::SampleCountFlags::from_raw(1 << (31 - raw.leading_zeros()))
}

/// Returns the first candidate whose features include `required`.
pub fn select_format(
    candidates: &[vk::Format],
    required: vk::FormatFeatureFlags,
    mut features_of: impl FnMut(vk::Format) -> vk::FormatFeatureFlags,
) -> Option<vk::Format> {
    candidates
        .iter()
        .copied()
        .find(|&format| features_of(format).contains(required))
}

/// Selects the most suitable physical device for rendering.
///
/// # Errors
///
/// Returns [`RhiError::NoSuitableGpu`] if no suitable GPU is found.
pub fn select_physical_device(
    instance: &ash::Instance,
    surface: vk::SurfaceKHR,
    surface_loader: &ash::khr::surface::Instance,
) -> Result<PhysicalDeviceInfo, RhiError> {
    let devices = unsafe { instance.enumerate_physical_devices()? };

    if devices.is_empty() {
        warn!("No Vulkan-capable GPUs found");
        return Err(RhiError::NoSuitableGpu);
    }

    info!("Found {} GPU(s)", devices.len());

    let selected = devices
        .into_iter()
        .filter_map(|device| check_device_suitability(instance, device, surface, surface_loader))
        .map(|info| {
            let score = rate_device(&info);
            debug!(
                "GPU '{}' ({}) - Score: {}",
                info.device_name(),
                info.device_type_name(),
                score
            );
            (info, score)
        })
        .max_by_key(|(_, score)| *score);

    let Some((selected, score)) = selected else {
        warn!("No suitable GPU found with required capabilities");
        return Err(RhiError::NoSuitableGpu);
    };

    let (major, minor, patch) = selected.api_version();
    info!(
        "Selected GPU: '{}' ({}) - Vulkan {}.{}.{}, Score: {}",
        selected.device_name(),
        selected.device_type_name(),
        major,
        minor,
        patch,
        score
    );

    Ok(selected)
}

/// Returns the names of required device features that are missing.
fn missing_features(features: &vk::PhysicalDeviceFeatures) -> Vec<&'static str> {
    [
        ("fill_mode_non_solid", features.fill_mode_non_solid),
        ("wide_lines", features.wide_lines),
        ("large_points", features.large_points),
        ("sampler_anisotropy", features.sampler_anisotropy),
    ]
    .into_iter()
    .filter(|(_, supported)| *supported == vk::FALSE)
    .map(|(name, _)| name)
    .collect()
}

fn check_device_suitability(
    instance: &ash::Instance,
    device: vk::PhysicalDevice,
    surface: vk::SurfaceKHR,
    surface_loader: &ash::khr::surface::Instance,
) -> Option<PhysicalDeviceInfo> {
    let properties = unsafe { instance.get_physical_device_properties(device) };
    let features = unsafe { instance.get_physical_device_features(device) };
    let memory_properties = unsafe { instance.get_physical_device_memory_properties(device) };

    let device_name = properties
        .device_name_as_c_str()
        .ok()
        .and_then(|name| name.to_str().ok())
        .unwrap_or("Unknown")
        .to_owned();

    if properties.api_version < crate::instance::API_VERSION {
        debug!(
            "GPU '{}' skipped: Vulkan 1.2 not supported (version: {}.{})",
            device_name,
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version)
        );
        return None;
    }

    let queue_families = find_queue_families(instance, device, surface, surface_loader);
    if !queue_families.is_complete() {
        debug!(
            "GPU '{}' skipped: missing required queue families (graphics={}, present={})",
            device_name,
            queue_families.graphics_family.is_some(),
            queue_families.present_family.is_some()
        );
        return None;
    }

    let missing = missing_features(&features);
    if !missing.is_empty() {
        debug!("GPU '{}' skipped: missing features {:?}", device_name, missing);
        return None;
    }

    if !supports_swapchain(instance, device) {
        debug!("GPU '{}' skipped: VK_KHR_swapchain not supported", device_name);
        return None;
    }

    Some(PhysicalDeviceInfo {
        device,
        properties,
        features,
        memory_properties,
        queue_families,
    })
}

fn supports_swapchain(instance: &ash::Instance, device: vk::PhysicalDevice) -> bool {
    let Ok(extensions) = (unsafe { instance.enumerate_device_extension_properties(device) }) else {
        return false;
    };
    extensions
        .iter()
        .any(|ext| ext.extension_name_as_c_str().ok() == Some(ash::khr::swapchain::NAME))
}

/// Resolves queue families from the per-family capability flags.
///
/// Compute and transfer prefer dedicated families. The present family is
/// searched among the transfer, compute and graphics families in that order,
/// then among every other family.
fn resolve_queue_families(
    families: &[vk::QueueFamilyProperties],
    mut supports_present: impl FnMut(u32) -> bool,
) -> QueueFamilyIndices {
    let mut indices = QueueFamilyIndices::default();
    let mut dedicated_compute = None;
    let mut dedicated_transfer = None;

    for (i, family) in families.iter().enumerate() {
        let i = i as u32;
        if family.queue_count == 0 {
            continue;
        }

        let has_graphics = family.queue_flags.contains(vk::QueueFlags::GRAPHICS);
        let has_compute = family.queue_flags.contains(vk::QueueFlags::COMPUTE);
        let has_transfer = family.queue_flags.contains(vk::QueueFlags::TRANSFER);

        if has_graphics && indices.graphics_family.is_none() {
            indices.graphics_family = Some(i);
        }
        if has_compute && !has_graphics && dedicated_compute.is_none() {
            dedicated_compute = Some(i);
        }
        if has_transfer && !has_graphics && !has_compute && dedicated_transfer.is_none() {
            dedicated_transfer = Some(i);
        }
    }

    indices.compute_family = dedicated_compute.or(indices.graphics_family);
    indices.transfer_family = dedicated_transfer.or(indices.compute_family);

    let preferred = [
        indices.transfer_family,
        indices.compute_family,
        indices.graphics_family,
    ];
    indices.present_family = preferred
        .into_iter()
        .flatten()
        .chain(0..families.len() as u32)
        .find(|&family| supports_present(family));

    indices
}

fn find_queue_families(
    instance: &ash::Instance,
    device: vk::PhysicalDevice,
    surface: vk::SurfaceKHR,
    surface_loader: &ash::khr::surface::Instance,
) -> QueueFamilyIndices {
    let families = unsafe { instance.get_physical_device_queue_family_properties(device) };
    resolve_queue_families(&families, |family| unsafe {
        surface_loader
            .get_physical_device_surface_support(device, family, surface)
            .unwrap_or(false)
    })
}

/// Rates a physical device based on its capabilities.
fn rate_device(info: &PhysicalDeviceInfo) -> u32 {
    let mut score = match info.properties.device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 10000,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 1000,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 100,
        vk::PhysicalDeviceType::CPU => 10,
        _ => 1,
    };

    score += info.properties.limits.max_image_dimension2_d;

    let vram_mb = (info.device_local_memory() / (1024 * 1024)) as u32;
    score += vram_mb.min(16000);

    if info.queue_families.transfer_family != info.queue_families.graphics_family {
        score += 100;
    }

    score
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
    fn test_queue_family_indices_default() {
        let indices = QueueFamilyIndices::default();
        assert!(!indices.is_complete());
        assert!(indices.unique_families().is_empty());
    }

    #[test]
    fn test_unique_families_with_duplicates() {
        let indices = QueueFamilyIndices {
            graphics_family: Some(0),
            present_family: Some(0),
            compute_family: Some(0),
            transfer_family: Some(1),
        };
        assert_eq!(indices.unique_families(), vec![0, 1]);
    }

    #[test]
    fn test_single_universal_family() {
        let families = [family(
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
        )];
        let indices = resolve_queue_families(&families, |_| true);
        assert_eq!(indices.graphics_family, Some(0));
        assert_eq!(indices.compute_family, Some(0));
        assert_eq!(indices.transfer_family, Some(0));
        assert_eq!(indices.present_family, Some(0));
    }

    #[test]
    fn test_dedicated_families_preferred() {
        let families = [
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::TRANSFER),
        ];
        let indices = resolve_queue_families(&families, |_| true);
        assert_eq!(indices.graphics_family, Some(0));
        assert_eq!(indices.compute_family, Some(1));
        assert_eq!(indices.transfer_family, Some(2));
        // Transfer is tried first for presentation
        assert_eq!(indices.present_family, Some(2));
    }

    #[test]
    fn test_present_falls_back_to_graphics() {
        let families = [
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::TRANSFER),
        ];
        let indices = resolve_queue_families(&families, |i| i == 0);
        assert_eq!(indices.transfer_family, Some(1));
        assert_eq!(indices.present_family, Some(0));
    }

    #[test]
    fn test_no_present_support() {
        let families = [family(vk::QueueFlags::GRAPHICS)];
        let indices = resolve_queue_families(&families, |_| false);
        assert!(!indices.is_complete());
    }

    #[test]
    fn test_highest_sample_count() {
        use vk::SampleCountFlags as S;
        assert_eq!(highest_sample_count(S::empty()), S::TYPE_1);
        assert_eq!(highest_sample_count(S::TYPE_1), S::TYPE_1);
        assert_eq!(
            highest_sample_count(S::TYPE_1 | S::TYPE_2 | S::TYPE_4 | S::TYPE_8),
            S::TYPE_8
        );
        assert_eq!(highest_sample_count(S::TYPE_1 | S::TYPE_4), S::TYPE_4);
    }

    #[test]
    fn test_select_format_in_preference_order() {
        let selected = select_format(
            &DEPTH_FORMAT_PREFERENCE,
            vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
            |format| match format {
                vk::Format::D16_UNORM | vk::Format::D32_SFLOAT_S8_UINT => {
                    vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT
                }
                _ => vk::FormatFeatureFlags::empty(),
            },
        );
        assert_eq!(selected, Some(vk::Format::D16_UNORM));
    }

    #[test]
    fn test_select_format_none_supported() {
        let selected = select_format(
            &DEPTH_FORMAT_PREFERENCE,
            vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
            |_| vk::FormatFeatureFlags::SAMPLED_IMAGE,
        );
        assert!(selected.is_none());
    }

    #[test]
    fn test_missing_features() {
        let mut features = vk::PhysicalDeviceFeatures::default();
        assert_eq!(missing_features(&features).len(), 4);
        features.fill_mode_non_solid = vk::TRUE;
        features.wide_lines = vk::TRUE;
        features.large_points = vk::TRUE;
        features.sampler_anisotropy = vk::TRUE;
        assert!(missing_features(&features).is_empty());
    }
}
