//! Instance creation, validation-layer plumbing and physical-device selection

use std::ffi::{c_void, CStr, CString};
use std::sync::{Arc, Mutex};

use ash::extensions::ext::DebugUtils;
use ash::extensions::khr;
use ash::vk;

use crate::config::{ContextSettings, WindowHandles};
use crate::error::{VulkanError, VulkanResult};
use crate::logging::{LogLevel, LogSink};

const VALIDATION_LAYER: &CStr =
    unsafe { CStr::from_bytes_with_nul_unchecked(b"VK_LAYER_KHRONOS_validation\0") };

/// Pretty-printer registered for a debug-name tag; receives the address
/// encoded in the object name.
pub type DebugFn = fn(usize, &mut String);

/// Compose an object name carrying a typed back-reference: the validation
/// callback recognises the `" at "` marker, uses the 6 low bits of the next
/// character to select a registered pretty-printer and hands it the address.
pub fn object_debug_name(name: &str, identifier: char, address: usize) -> String {
    format!("{name} at {identifier}{address}")
}

/// Split an object name into its display part and the optional
/// `(tag index, address)` back-reference.
fn parse_object_name(name: &str) -> (&str, Option<(usize, usize)>) {
    match name.find(" at ") {
        None => (name, None),
        Some(pos) => {
            let tail = &name[pos + 4..];
            let mut chars = tail.chars();
            let reference = chars.next().and_then(|tag| {
                chars.as_str().parse::<usize>().ok().map(|addr| (tag as usize & 0x3f, addr))
            });
            (&name[..pos], reference)
        }
    }
}

/// Shared state of the validation callback.
pub struct DebugState {
    sink: Arc<LogSink>,
    funcs: Mutex<[Option<DebugFn>; 63]>,
}

impl DebugState {
    pub(crate) fn new(sink: Arc<LogSink>) -> Arc<Self> {
        Arc::new(Self {
            sink,
            funcs: Mutex::new([None; 63]),
        })
    }

    /// Register a pretty-printer. The identifier's ASCII code must lie in
    /// `0x40..=0x7e`.
    pub fn set_debug_function(&self, identifier: char, func: DebugFn) {
        self.funcs.lock().unwrap()[identifier as usize & 0x3f] = Some(func);
    }
}

unsafe fn cstr_or<'a>(ptr: *const i8, fallback: &'a str) -> std::borrow::Cow<'a, str> {
    if ptr.is_null() {
        std::borrow::Cow::Borrowed(fallback)
    } else {
        CStr::from_ptr(ptr).to_string_lossy()
    }
}

/// Validation-layer callback: stringify the message, dump queue and command
/// buffer labels and the object references, then route everything through the
/// log sink at LAYER level.
unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    user_data: *mut c_void,
) -> vk::Bool32 {
    let data = &*callback_data;
    let state = &*user_data.cast::<DebugState>();
    let id_name = cstr_or(data.p_message_id_name, "-");
    if severity == vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE && id_name == "Loader Message" {
        return vk::FALSE;
    }
    let mut out = format!("{severity:?}: {message_type:?}:\n");
    out.push_str(&format!("\tmessageIDName   = <{id_name}>\n"));
    out.push_str(&format!("\tmessageIdNumber = {}\n", data.message_id_number));
    out.push_str(&format!("\tmessage         = <{}>\n", cstr_or(data.p_message, "")));
    if data.queue_label_count > 0 {
        out.push_str("\tQueue Labels:\n");
        let labels = std::slice::from_raw_parts(data.p_queue_labels, data.queue_label_count as usize);
        for label in labels {
            out.push_str(&format!("\t\tlabelName = <{}>\n", cstr_or(label.p_label_name, "")));
        }
    }
    if data.cmd_buf_label_count > 0 {
        out.push_str("\tCommandBuffer Labels:\n");
        let labels =
            std::slice::from_raw_parts(data.p_cmd_buf_labels, data.cmd_buf_label_count as usize);
        for label in labels {
            out.push_str(&format!("\t\tlabelName = <{}>\n", cstr_or(label.p_label_name, "")));
        }
    }
    if data.object_count > 0 {
        out.push_str("\tObjects:\n");
        let objects = std::slice::from_raw_parts(data.p_objects, data.object_count as usize);
        for (i, object) in objects.iter().enumerate() {
            out.push_str(&format!("\t\tObject {i}\n"));
            out.push_str(&format!("\t\t\tobjectType   = {:?}\n", object.object_type));
            out.push_str(&format!("\t\t\tobjectHandle = {:#x}\n", object.object_handle));
            if !object.p_object_name.is_null() {
                let name = CStr::from_ptr(object.p_object_name).to_string_lossy();
                let (display, reference) = parse_object_name(&name);
                out.push_str(&format!("\t\t\tobjectName   = {display}\n"));
                if let Some((tag, address)) = reference {
                    if let Some(func) = state.funcs.lock().unwrap()[tag] {
                        func(address, &mut out);
                    }
                }
            }
        }
    }
    state.sink.put(&out, LogLevel::Layer);
    vk::FALSE
}

/// Instance plus the debug machinery that must outlive it.
pub struct InstanceCore {
    pub(crate) entry: ash::Entry,
    pub(crate) instance: ash::Instance,
    pub(crate) debug_utils: Option<DebugUtils>,
    pub(crate) messenger: vk::DebugUtilsMessengerEXT,
    pub(crate) debug_state: Arc<DebugState>,
    pub(crate) has_layer: bool,
}

impl InstanceCore {
    /// Create the instance, enabling the validation layer when asked and
    /// available, and install the debug messenger.
    pub(crate) fn new(
        settings: &ContextSettings,
        window: Option<&WindowHandles>,
        sink: &Arc<LogSink>,
    ) -> VulkanResult<Self> {
        let entry = unsafe {
            ash::Entry::load()
                .map_err(|e| VulkanError::InitializationFailed(format!("Failed to load Vulkan: {e}")))?
        };
        let app_name = CString::new(settings.application_name.as_str()).unwrap_or_default();
        let engine_name = CString::new("EntityCore").unwrap();
        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name)
            .application_version(settings.application_version)
            .engine_name(&engine_name)
            .engine_version(1)
            .api_version(settings.api_version());

        let mut extensions: Vec<*const i8> = vec![DebugUtils::name().as_ptr()];
        if let Some(window) = window {
            let required = ash_window::enumerate_required_extensions(window.display)
                .map_err(VulkanError::Api)?;
            extensions.extend_from_slice(required);
        }
        let layers = [VALIDATION_LAYER.as_ptr()];
        let has_layer = settings.enable_debug_layers;

        let debug_state = DebugState::new(Arc::clone(sink));
        let mut messenger_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
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
            .pfn_user_callback(Some(debug_callback))
            .user_data(Arc::as_ptr(&debug_state).cast_mut().cast());

        let mut info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions);
        if has_layer {
            info = info.enabled_layer_names(&layers).push_next(&mut messenger_info);
        }
        let (instance, has_layer) = unsafe {
            match entry.create_instance(&info, None) {
                Ok(instance) => (instance, has_layer),
                Err(vk::Result::ERROR_LAYER_NOT_PRESENT) => {
                    // Run without validation rather than fail
                    let info = vk::InstanceCreateInfo::builder()
                        .application_info(&app_info)
                        .enabled_extension_names(&extensions);
                    (
                        entry.create_instance(&info, None).map_err(VulkanError::Api)?,
                        false,
                    )
                }
                Err(e) => return Err(VulkanError::Api(e)),
            }
        };

        let (debug_utils, messenger) = if has_layer {
            let debug_utils = DebugUtils::new(&entry, &instance);
            let messenger = unsafe {
                debug_utils
                    .create_debug_utils_messenger(&messenger_info, None)
                    .map_err(VulkanError::Api)?
            };
            (Some(debug_utils), messenger)
        } else {
            (None, vk::DebugUtilsMessengerEXT::null())
        };

        Ok(Self {
            entry,
            instance,
            debug_utils,
            messenger,
            debug_state,
            has_layer,
        })
    }
}

impl Drop for InstanceCore {
    fn drop(&mut self) {
        unsafe {
            if let Some(debug_utils) = &self.debug_utils {
                debug_utils.destroy_debug_utils_messenger(self.messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// Device-level extensions probed at selection time.
pub(crate) struct ExtensionProbe {
    pub synchronization2: bool,
    pub memory_budget: bool,
    pub push_descriptor: bool,
}

pub(crate) fn probe_device_extensions(
    instance: &ash::Instance,
    device: vk::PhysicalDevice,
) -> ExtensionProbe {
    let available = unsafe {
        instance
            .enumerate_device_extension_properties(device)
            .unwrap_or_default()
    };
    let has = |name: &CStr| {
        available
            .iter()
            .any(|ext| unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) } == name)
    };
    ExtensionProbe {
        synchronization2: has(khr::Synchronization2::name()),
        memory_budget: has(vk::ExtMemoryBudgetFn::name()),
        push_descriptor: has(khr::PushDescriptor::name()),
    }
}

fn supports_extensions(
    instance: &ash::Instance,
    device: vk::PhysicalDevice,
    required: &[CString],
) -> bool {
    let available = unsafe {
        instance
            .enumerate_device_extension_properties(device)
            .unwrap_or_default()
    };
    required.iter().all(|req| {
        available
            .iter()
            .any(|ext| unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) } == req.as_c_str())
    })
}

fn swapchain_adequate(
    surface_loader: &khr::Surface,
    device: vk::PhysicalDevice,
    surface: vk::SurfaceKHR,
) -> bool {
    unsafe {
        let formats = surface_loader
            .get_physical_device_surface_formats(device, surface)
            .unwrap_or_default();
        let modes = surface_loader
            .get_physical_device_surface_present_modes(device, surface)
            .unwrap_or_default();
        !formats.is_empty() && !modes.is_empty()
    }
}

/// Pick a physical device: filter by extension support and (when presenting)
/// swap-chain adequacy, prefer the requested device type, fall back to the
/// suboptimal type, accept any suitable device otherwise.
pub(crate) fn select_physical_device(
    instance: &ash::Instance,
    surface: Option<(&khr::Surface, vk::SurfaceKHR)>,
    required_extensions: &[CString],
    prefer_integrated: bool,
    min_api_version: u32,
) -> Option<vk::PhysicalDevice> {
    let preferred_type = if prefer_integrated {
        vk::PhysicalDeviceType::INTEGRATED_GPU
    } else {
        vk::PhysicalDeviceType::DISCRETE_GPU
    };
    let suboptimal_type = if prefer_integrated {
        vk::PhysicalDeviceType::DISCRETE_GPU
    } else {
        vk::PhysicalDeviceType::INTEGRATED_GPU
    };
    let devices = unsafe { instance.enumerate_physical_devices().ok()? };
    let mut selected = None;
    let mut suboptimal_selected = false;
    for device in devices {
        let properties = unsafe { instance.get_physical_device_properties(device) };
        if properties.api_version < min_api_version
            || !supports_extensions(instance, device, required_extensions)
        {
            continue;
        }
        if let Some((loader, surface)) = surface {
            if !swapchain_adequate(loader, device, surface) {
                continue;
            }
        }
        if properties.device_type == preferred_type {
            return Some(device);
        }
        if !suboptimal_selected && properties.device_type == suboptimal_type {
            selected = Some(device);
            suboptimal_selected = true;
        } else if selected.is_none() {
            selected = Some(device);
        }
    }
    selected
}

/// Log the device banner: API and driver versions, vendor, name, type.
pub(crate) fn log_physical_device_info(sink: &LogSink, properties: &vk::PhysicalDeviceProperties) {
    let vendor = match properties.vendor_id {
        0x1002 => "AMD",
        0x1010 => "ImgTec",
        0x10DE => "NVIDIA",
        0x13B5 => "ARM",
        0x5143 => "Qualcomm",
        0x8086 => "INTEL",
        _ => "UNKNOWN",
    };
    let device_type = match properties.device_type {
        vk::PhysicalDeviceType::INTEGRATED_GPU => "Integrated GPU",
        vk::PhysicalDeviceType::DISCRETE_GPU => "Discrete GPU",
        vk::PhysicalDeviceType::VIRTUAL_GPU => "Virtual GPU",
        vk::PhysicalDeviceType::CPU => "CPU",
        _ => "Other",
    };
    let name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()).to_string_lossy() };
    let banner = format!(
        "===== Device info =====\n\
         API Version : {}.{}.{}\n\
         Driver Version : {}.{}.{}\n\
         Vendor : {vendor}\n\
         Device : {name} (id = {})\n\
         Device type : {device_type}",
        vk::api_version_major(properties.api_version),
        vk::api_version_minor(properties.api_version),
        vk::api_version_patch(properties.api_version),
        vk::api_version_major(properties.driver_version),
        vk::api_version_minor(properties.driver_version),
        vk::api_version_patch(properties.driver_version),
        properties.device_id,
    );
    sink.put(&banner, LogLevel::Layer);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_name_round_trip() {
        let name = object_debug_name("uniform buffer", 'B', 0x7f00_1234);
        let (display, reference) = parse_object_name(&name);
        assert_eq!(display, "uniform buffer");
        let (tag, address) = reference.unwrap();
        assert_eq!(tag, 'B' as usize & 0x3f);
        assert_eq!(address, 0x7f00_1234);
    }

    #[test]
    fn test_plain_names_have_no_reference() {
        let (display, reference) = parse_object_name("mainCmd of Default");
        assert_eq!(display, "mainCmd of Default");
        assert!(reference.is_none());
    }

    #[test]
    fn test_malformed_reference_is_ignored() {
        let (display, reference) = parse_object_name("thing at Xnot-a-number");
        assert_eq!(display, "thing");
        assert!(reference.is_none());
    }
}
