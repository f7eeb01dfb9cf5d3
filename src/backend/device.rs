// Vulkan context - instance, device selection, logical device, allocator
//
// Responsibilities:
// - Instance creation with optional validation layers
// - Candidate enumeration: one immutable capability snapshot per GPU
// - Selection policy: discrete GPU with the most device-local memory
// - Logical device + queue creation, memory allocator setup

use std::ffi::{c_char, CStr, CString};
use std::mem::ManuallyDrop;
use std::sync::Arc;

use anyhow::{Context, Result};
use ash::extensions::{ext, khr};
use ash::{vk, Entry};
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use parking_lot::{Mutex, MutexGuard};
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use winit::window::Window;

/// Capability snapshot of one physical device, captured once at startup.
///
/// `present_support[i]` records whether queue family `i` can present to the
/// target surface, so the selection policies below are plain functions over
/// this data.
pub struct DeviceCandidate {
    pub handle: vk::PhysicalDevice,
    pub properties: vk::PhysicalDeviceProperties,
    pub memory: vk::PhysicalDeviceMemoryProperties,
    pub queue_families: Vec<vk::QueueFamilyProperties>,
    pub present_support: Vec<bool>,
    pub surface_caps: vk::SurfaceCapabilitiesKHR,
    pub surface_formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl DeviceCandidate {
    pub fn name(&self) -> String {
        unsafe { CStr::from_ptr(self.properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned()
    }
}

/// Sum of all memory heaps flagged device-local, the VRAM proxy used for
/// device scoring.
pub fn device_local_vram(memory: &vk::PhysicalDeviceMemoryProperties) -> vk::DeviceSize {
    memory.memory_heaps[..memory.memory_heap_count as usize]
        .iter()
        .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
        .map(|heap| heap.size)
        .sum()
}

/// Pick the discrete GPU with the strictly greatest device-local memory.
///
/// Candidates that report no surface formats or no present modes cannot
/// present to the window and are skipped. Ties keep the first enumerated
/// device; a candidate with zero device-local memory never wins.
pub fn pick_physical_device(candidates: &[DeviceCandidate]) -> Option<usize> {
    let mut best = None;
    let mut best_vram = 0;

    for (index, candidate) in candidates.iter().enumerate() {
        if candidate.properties.device_type != vk::PhysicalDeviceType::DISCRETE_GPU {
            continue;
        }
        if candidate.surface_formats.is_empty() || candidate.present_modes.is_empty() {
            continue;
        }

        let vram = device_local_vram(&candidate.memory);
        if vram > best_vram {
            best_vram = vram;
            best = Some(index);
        }
    }

    best
}

/// Pick the largest queue family supporting both graphics and presentation.
/// Ties keep the first family found.
pub fn pick_queue_family(candidate: &DeviceCandidate) -> Option<u32> {
    let mut best = None;
    let mut best_count = 0;

    for (index, family) in candidate.queue_families.iter().enumerate() {
        if !family.queue_flags.contains(vk::QueueFlags::GRAPHICS) {
            continue;
        }
        if !candidate.present_support.get(index).copied().unwrap_or(false) {
            continue;
        }

        if family.queue_count > best_count {
            best_count = family.queue_count;
            best = Some(index as u32);
        }
    }

    best
}

/// Everything device-level the renderer components share, created once at
/// startup and passed around by `Arc`.
pub struct VulkanContext {
    // The allocator frees its pools against the device, so it is torn down
    // first in Drop; the remaining handles are destroyed in reverse creation
    // order there as well.
    allocator: Mutex<ManuallyDrop<Allocator>>,
    pub device: ash::Device,
    pub queue: vk::Queue,
    pub queue_family: u32,
    pub gpu: DeviceCandidate,
    pub surface: vk::SurfaceKHR,
    pub surface_loader: khr::Surface,
    debug_utils: Option<(ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,
    pub instance: ash::Instance,
    _entry: Entry,
}

impl VulkanContext {
    pub fn new(window: &Window, app_name: &str, enable_validation: bool) -> Result<Arc<Self>> {
        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        let instance = Self::create_instance(&entry, window, app_name, enable_validation)?;

        let debug_utils = if enable_validation {
            Some(Self::create_debug_messenger(&entry, &instance)?)
        } else {
            None
        };

        let surface = unsafe {
            ash_window::create_surface(
                &entry,
                &instance,
                window.raw_display_handle(),
                window.raw_window_handle(),
                None,
            )
        }
        .context("Failed to create window surface")?;
        let surface_loader = khr::Surface::new(&entry, &instance);

        let candidates = Self::enumerate_candidates(&instance, &surface_loader, surface)?;
        let selected = pick_physical_device(&candidates)
            .context("No suitable GPU found (discrete, presentable, with device-local memory)")?;
        let gpu = candidates.into_iter().nth(selected).unwrap();

        log::info!(
            "Selected GPU: {} ({} MiB device-local)",
            gpu.name(),
            device_local_vram(&gpu.memory) / (1024 * 1024)
        );

        let queue_family = pick_queue_family(&gpu)
            .context("No queue family supports both graphics and presentation")?;
        log::info!("Selected queue family: {}", queue_family);

        let device = Self::create_logical_device(&instance, gpu.handle, queue_family)?;
        let queue = unsafe { device.get_device_queue(queue_family, 0) };

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device: gpu.handle,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .context("Failed to create memory allocator")?;

        Ok(Arc::new(Self {
            allocator: Mutex::new(ManuallyDrop::new(allocator)),
            device,
            queue,
            queue_family,
            gpu,
            surface,
            surface_loader,
            debug_utils,
            instance,
            _entry: entry,
        }))
    }

    fn create_instance(
        entry: &Entry,
        window: &Window,
        app_name: &str,
        enable_validation: bool,
    ) -> Result<ash::Instance> {
        let app_name_cstr = CString::new(app_name)?;

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(&app_name_cstr)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_0);

        // Platform surface extensions, plus debug utils when validating
        let mut extensions =
            ash_window::enumerate_required_extensions(window.raw_display_handle())
                .context("No Vulkan surface support for this display")?
                .to_vec();

        let layers: Vec<*const c_char> = if enable_validation {
            extensions.push(ext::DebugUtils::name().as_ptr());
            vec![c"VK_LAYER_KHRONOS_validation".as_ptr()]
        } else {
            Vec::new()
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layers);

        unsafe { entry.create_instance(&create_info, None) }
            .context("Failed to create Vulkan instance")
    }

    fn create_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(ext::DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = ext::DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
            .context("Failed to create debug messenger")?;

        Ok((debug_utils, messenger))
    }

    /// Query every physical device into an immutable capability snapshot.
    fn enumerate_candidates(
        instance: &ash::Instance,
        surface_loader: &khr::Surface,
        surface: vk::SurfaceKHR,
    ) -> Result<Vec<DeviceCandidate>> {
        let devices = unsafe { instance.enumerate_physical_devices() }
            .context("Failed to enumerate physical devices")?;
        anyhow::ensure!(!devices.is_empty(), "No Vulkan-capable GPU found");

        devices
            .into_iter()
            .map(|handle| {
                let properties = unsafe { instance.get_physical_device_properties(handle) };
                let memory = unsafe { instance.get_physical_device_memory_properties(handle) };
                let queue_families =
                    unsafe { instance.get_physical_device_queue_family_properties(handle) };

                let present_support = (0..queue_families.len() as u32)
                    .map(|family| unsafe {
                        surface_loader
                            .get_physical_device_surface_support(handle, family, surface)
                            .unwrap_or(false)
                    })
                    .collect();

                let surface_caps = unsafe {
                    surface_loader.get_physical_device_surface_capabilities(handle, surface)
                }
                .context("Failed to query surface capabilities")?;
                let surface_formats = unsafe {
                    surface_loader.get_physical_device_surface_formats(handle, surface)
                }
                .unwrap_or_default();
                let present_modes = unsafe {
                    surface_loader.get_physical_device_surface_present_modes(handle, surface)
                }
                .unwrap_or_default();

                Ok(DeviceCandidate {
                    handle,
                    properties,
                    memory,
                    queue_families,
                    present_support,
                    surface_caps,
                    surface_formats,
                    present_modes,
                })
            })
            .collect()
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        queue_family: u32,
    ) -> Result<ash::Device> {
        let queue_priorities = [1.0];
        let queue_create_info = vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(queue_family)
            .queue_priorities(&queue_priorities)
            .build();

        let extensions = [khr::Swapchain::name().as_ptr()];

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(std::slice::from_ref(&queue_create_info))
            .enabled_extension_names(&extensions);

        unsafe { instance.create_device(physical_device, &create_info, None) }
            .context("Failed to create logical device")
    }

    /// Fresh surface capabilities; the swapchain re-queries these on every
    /// build because the current extent tracks the window.
    pub fn query_surface_caps(&self) -> Result<vk::SurfaceCapabilitiesKHR> {
        unsafe {
            self.surface_loader
                .get_physical_device_surface_capabilities(self.gpu.handle, self.surface)
        }
        .context("Failed to query surface capabilities")
    }

    pub fn allocator(&self) -> MutexGuard<'_, ManuallyDrop<Allocator>> {
        self.allocator.lock()
    }

    /// Wait for all outstanding GPU work to drain.
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }?;
        Ok(())
    }
}

impl Drop for VulkanContext {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan context");

        let _ = self.wait_idle();

        unsafe {
            // Allocator pools must be released while the device is alive
            ManuallyDrop::drop(&mut *self.allocator.lock());

            self.device.destroy_device(None);

            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.surface_loader.destroy_surface(self.surface, None);
            self.instance.destroy_instance(None);
        }
    }
}

// Validation layer messages routed into the logger
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heaps(sizes: &[(u64, bool)]) -> vk::PhysicalDeviceMemoryProperties {
        let mut memory = vk::PhysicalDeviceMemoryProperties::default();
        memory.memory_heap_count = sizes.len() as u32;
        for (i, &(size, device_local)) in sizes.iter().enumerate() {
            memory.memory_heaps[i] = vk::MemoryHeap {
                size,
                flags: if device_local {
                    vk::MemoryHeapFlags::DEVICE_LOCAL
                } else {
                    vk::MemoryHeapFlags::empty()
                },
            };
        }
        memory
    }

    fn candidate(
        device_type: vk::PhysicalDeviceType,
        memory: vk::PhysicalDeviceMemoryProperties,
    ) -> DeviceCandidate {
        DeviceCandidate {
            handle: vk::PhysicalDevice::null(),
            properties: vk::PhysicalDeviceProperties {
                device_type,
                ..Default::default()
            },
            memory,
            queue_families: Vec::new(),
            present_support: Vec::new(),
            surface_caps: vk::SurfaceCapabilitiesKHR::default(),
            surface_formats: vec![vk::SurfaceFormatKHR::default()],
            present_modes: vec![vk::PresentModeKHR::FIFO],
        }
    }

    fn queue_family(flags: vk::QueueFlags, count: u32) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: count,
            ..Default::default()
        }
    }

    #[test]
    fn vram_sums_only_device_local_heaps() {
        let memory = heaps(&[(4096, true), (8192, false), (1024, true)]);
        assert_eq!(device_local_vram(&memory), 5120);
    }

    #[test]
    fn picks_discrete_gpu_with_most_vram() {
        let candidates = vec![
            candidate(vk::PhysicalDeviceType::DISCRETE_GPU, heaps(&[(1024, true)])),
            candidate(vk::PhysicalDeviceType::DISCRETE_GPU, heaps(&[(4096, true)])),
            candidate(vk::PhysicalDeviceType::DISCRETE_GPU, heaps(&[(2048, true)])),
        ];
        assert_eq!(pick_physical_device(&candidates), Some(1));
    }

    #[test]
    fn selected_vram_dominates_all_eligible_candidates() {
        let candidates = vec![
            candidate(vk::PhysicalDeviceType::DISCRETE_GPU, heaps(&[(300, true)])),
            candidate(
                vk::PhysicalDeviceType::DISCRETE_GPU,
                heaps(&[(100, true), (250, true)]),
            ),
            candidate(vk::PhysicalDeviceType::DISCRETE_GPU, heaps(&[(200, true)])),
        ];
        let winner = pick_physical_device(&candidates).unwrap();
        let winner_vram = device_local_vram(&candidates[winner].memory);
        for other in &candidates {
            assert!(winner_vram >= device_local_vram(&other.memory));
        }
    }

    #[test]
    fn vram_tie_keeps_first_enumerated() {
        let candidates = vec![
            candidate(vk::PhysicalDeviceType::DISCRETE_GPU, heaps(&[(4096, true)])),
            candidate(vk::PhysicalDeviceType::DISCRETE_GPU, heaps(&[(4096, true)])),
        ];
        assert_eq!(pick_physical_device(&candidates), Some(0));
    }

    #[test]
    fn integrated_gpu_is_filtered_out() {
        let candidates = vec![
            candidate(vk::PhysicalDeviceType::INTEGRATED_GPU, heaps(&[(8192, true)])),
            candidate(vk::PhysicalDeviceType::DISCRETE_GPU, heaps(&[(1024, true)])),
        ];
        assert_eq!(pick_physical_device(&candidates), Some(1));
    }

    #[test]
    fn candidate_without_formats_or_modes_is_rejected() {
        let mut no_formats =
            candidate(vk::PhysicalDeviceType::DISCRETE_GPU, heaps(&[(8192, true)]));
        no_formats.surface_formats.clear();

        let mut no_modes = candidate(vk::PhysicalDeviceType::DISCRETE_GPU, heaps(&[(8192, true)]));
        no_modes.present_modes.clear();

        let ok = candidate(vk::PhysicalDeviceType::DISCRETE_GPU, heaps(&[(512, true)]));

        assert_eq!(pick_physical_device(&[no_formats, no_modes, ok]), Some(2));
    }

    #[test]
    fn no_eligible_candidate_yields_none() {
        let zero_vram = candidate(vk::PhysicalDeviceType::DISCRETE_GPU, heaps(&[(0, true)]));
        let host_only =
            candidate(vk::PhysicalDeviceType::DISCRETE_GPU, heaps(&[(8192, false)]));
        assert_eq!(pick_physical_device(&[zero_vram, host_only]), None);
        assert_eq!(pick_physical_device(&[]), None);
    }

    #[test]
    fn queue_family_needs_graphics_and_present() {
        let mut gpu = candidate(vk::PhysicalDeviceType::DISCRETE_GPU, heaps(&[(1024, true)]));
        gpu.queue_families = vec![
            queue_family(vk::QueueFlags::TRANSFER, 8),
            queue_family(vk::QueueFlags::GRAPHICS, 4),
            queue_family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE, 2),
        ];
        gpu.present_support = vec![true, false, true];

        assert_eq!(pick_queue_family(&gpu), Some(2));
    }

    #[test]
    fn queue_family_prefers_greatest_count_first_on_tie() {
        let mut gpu = candidate(vk::PhysicalDeviceType::DISCRETE_GPU, heaps(&[(1024, true)]));
        gpu.queue_families = vec![
            queue_family(vk::QueueFlags::GRAPHICS, 2),
            queue_family(vk::QueueFlags::GRAPHICS, 4),
            queue_family(vk::QueueFlags::GRAPHICS, 4),
        ];
        gpu.present_support = vec![true, true, true];

        assert_eq!(pick_queue_family(&gpu), Some(1));
    }

    #[test]
    fn queue_family_none_when_nothing_qualifies() {
        let mut gpu = candidate(vk::PhysicalDeviceType::DISCRETE_GPU, heaps(&[(1024, true)]));
        gpu.queue_families = vec![queue_family(vk::QueueFlags::GRAPHICS, 0)];
        gpu.present_support = vec![true];
        assert_eq!(pick_queue_family(&gpu), None);

        gpu.queue_families = vec![queue_family(vk::QueueFlags::GRAPHICS, 4)];
        gpu.present_support = vec![false];
        assert_eq!(pick_queue_family(&gpu), None);
    }
}
