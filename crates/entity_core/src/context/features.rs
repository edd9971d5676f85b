//! Device-feature negotiation
//!
//! Two feature sets are supplied at construction: *required* (missing any of
//! them aborts initialization) and *preferred* (enabled when supported,
//! silently skipped otherwise). Negotiation ORs the required flags into the
//! preferred set, queries the physical device, prunes what the device
//! rejected, and produces the set actually passed to device creation,
//! together with a per-flag diagnostic listing.
//!
//! Every Vulkan feature struct involved here is a flat array of `VkBool32`
//! flags behind the usual `sType`/`pNext` header, which is what makes the
//! generic flag views below sound.

use ash::vk;

use crate::logging::{LogLevel, LogSink};

/// Number of `VkBool32` flags in `VkPhysicalDeviceFeatures`.
const CORE_FLAG_COUNT: usize = 55;
/// Byte offset of the first flag in an extension feature struct: the
/// `sType`/`pNext` header every chained struct starts with.
const EXT_HEADER_SIZE: usize = std::mem::size_of::<vk::BaseOutStructure>();

/// Marker for Vulkan version-feature structs: a 16-byte header followed by
/// exactly `FLAG_COUNT` consecutive `VkBool32` fields.
///
/// # Safety
///
/// Implementors must guarantee the layout above; the flag views read and
/// write `FLAG_COUNT * 4` bytes starting at offset 16.
pub unsafe trait VersionFeatures: Copy + Default {
    /// Number of feature flags in the struct
    const FLAG_COUNT: usize;
    /// Vulkan names of the flags, in declaration order
    const NAMES: &'static [&'static str];
}

unsafe impl VersionFeatures for vk::PhysicalDeviceVulkan11Features {
    const FLAG_COUNT: usize = 12;
    const NAMES: &'static [&'static str] = &[
        "storageBuffer16BitAccess",
        "uniformAndStorageBuffer16BitAccess",
        "storagePushConstant16",
        "storageInputOutput16",
        "multiview",
        "multiviewGeometryShader",
        "multiviewTessellationShader",
        "variablePointersStorageBuffer",
        "variablePointers",
        "protectedMemory",
        "samplerYcbcrConversion",
        "shaderDrawParameters",
    ];
}

unsafe impl VersionFeatures for vk::PhysicalDeviceVulkan12Features {
    const FLAG_COUNT: usize = 47;
    const NAMES: &'static [&'static str] = &[
        "samplerMirrorClampToEdge",
        "drawIndirectCount",
        "storageBuffer8BitAccess",
        "uniformAndStorageBuffer8BitAccess",
        "storagePushConstant8",
        "shaderBufferInt64Atomics",
        "shaderSharedInt64Atomics",
        "shaderFloat16",
        "shaderInt8",
        "descriptorIndexing",
        "shaderInputAttachmentArrayDynamicIndexing",
        "shaderUniformTexelBufferArrayDynamicIndexing",
        "shaderStorageTexelBufferArrayDynamicIndexing",
        "shaderUniformBufferArrayNonUniformIndexing",
        "shaderSampledImageArrayNonUniformIndexing",
        "shaderStorageBufferArrayNonUniformIndexing",
        "shaderStorageImageArrayNonUniformIndexing",
        "shaderInputAttachmentArrayNonUniformIndexing",
        "shaderUniformTexelBufferArrayNonUniformIndexing",
        "shaderStorageTexelBufferArrayNonUniformIndexing",
        "descriptorBindingUniformBufferUpdateAfterBind",
        "descriptorBindingSampledImageUpdateAfterBind",
        "descriptorBindingStorageImageUpdateAfterBind",
        "descriptorBindingStorageBufferUpdateAfterBind",
        "descriptorBindingUniformTexelBufferUpdateAfterBind",
        "descriptorBindingStorageTexelBufferUpdateAfterBind",
        "descriptorBindingUpdateUnusedWhilePending",
        "descriptorBindingPartiallyBound",
        "descriptorBindingVariableDescriptorCount",
        "runtimeDescriptorArray",
        "samplerFilterMinmax",
        "scalarBlockLayout",
        "imagelessFramebuffer",
        "uniformBufferStandardLayout",
        "shaderSubgroupExtendedTypes",
        "separateDepthStencilLayouts",
        "hostQueryReset",
        "timelineSemaphore",
        "bufferDeviceAddress",
        "bufferDeviceAddressCaptureReplay",
        "bufferDeviceAddressMultiDevice",
        "vulkanMemoryModel",
        "vulkanMemoryModelDeviceScope",
        "vulkanMemoryModelAvailabilityVisibilityChains",
        "shaderOutputViewportIndex",
        "shaderOutputLayer",
        "subgroupBroadcastDynamicId",
    ];
}

unsafe impl VersionFeatures for vk::PhysicalDeviceVulkan13Features {
    const FLAG_COUNT: usize = 15;
    const NAMES: &'static [&'static str] = &[
        "robustImageAccess",
        "inlineUniformBlock",
        "descriptorBindingInlineUniformBlockUpdateAfterBind",
        "pipelineCreationCacheControl",
        "privateData",
        "shaderDemoteToHelperInvocation",
        "shaderTerminateInvocation",
        "subgroupSizeControl",
        "computeFullSubgroups",
        "synchronization2",
        "textureCompressionASTC_HDR",
        "shaderZeroInitializeWorkgroupMemory",
        "dynamicRendering",
        "shaderIntegerDotProduct",
        "maintenance4",
    ];
}

const CORE_NAMES: [&str; CORE_FLAG_COUNT] = [
    "robustBufferAccess",
    "fullDrawIndexUint32",
    "imageCubeArray",
    "independentBlend",
    "geometryShader",
    "tessellationShader",
    "sampleRateShading",
    "dualSrcBlend",
    "logicOp",
    "multiDrawIndirect",
    "drawIndirectFirstInstance",
    "depthClamp",
    "depthBiasClamp",
    "fillModeNonSolid",
    "depthBounds",
    "wideLines",
    "largePoints",
    "alphaToOne",
    "multiViewport",
    "samplerAnisotropy",
    "textureCompressionETC2",
    "textureCompressionASTC_LDR",
    "textureCompressionBC",
    "occlusionQueryPrecise",
    "pipelineStatisticsQuery",
    "vertexPipelineStoresAndAtomics",
    "fragmentStoresAndAtomics",
    "shaderTessellationAndGeometryPointSize",
    "shaderImageGatherExtended",
    "shaderStorageImageExtendedFormats",
    "shaderStorageImageMultisample",
    "shaderStorageImageReadWithoutFormat",
    "shaderStorageImageWriteWithoutFormat",
    "shaderUniformBufferArrayDynamicIndexing",
    "shaderSampledImageArrayDynamicIndexing",
    "shaderStorageBufferArrayDynamicIndexing",
    "shaderStorageImageArrayDynamicIndexing",
    "shaderClipDistance",
    "shaderCullDistance",
    "shaderFloat64",
    "shaderInt64",
    "shaderInt16",
    "shaderResourceResidency",
    "shaderResourceMinLod",
    "sparseBinding",
    "sparseResidencyBuffer",
    "sparseResidencyImage2D",
    "sparseResidencyImage3D",
    "sparseResidency2Samples",
    "sparseResidency4Samples",
    "sparseResidency8Samples",
    "sparseResidency16Samples",
    "sparseResidencyAliased",
    "variableMultisampleRate",
    "inheritedQueries",
];

fn core_flags(f: &vk::PhysicalDeviceFeatures) -> &[vk::Bool32] {
    unsafe { std::slice::from_raw_parts((f as *const vk::PhysicalDeviceFeatures).cast(), CORE_FLAG_COUNT) }
}

fn core_flags_mut(f: &mut vk::PhysicalDeviceFeatures) -> &mut [vk::Bool32] {
    unsafe { std::slice::from_raw_parts_mut((f as *mut vk::PhysicalDeviceFeatures).cast(), CORE_FLAG_COUNT) }
}

fn ext_flags<T: VersionFeatures>(f: &T) -> &[vk::Bool32] {
    unsafe {
        std::slice::from_raw_parts(
            (f as *const T).cast::<u8>().add(EXT_HEADER_SIZE).cast(),
            T::FLAG_COUNT,
        )
    }
}

fn ext_flags_mut<T: VersionFeatures>(f: &mut T) -> &mut [vk::Bool32] {
    unsafe {
        std::slice::from_raw_parts_mut(
            (f as *mut T).cast::<u8>().add(EXT_HEADER_SIZE).cast(),
            T::FLAG_COUNT,
        )
    }
}

fn or_into(dst: &mut [vk::Bool32], src: &[vk::Bool32]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d |= *s;
    }
}

fn and_into(dst: &mut [vk::Bool32], src: &[vk::Bool32]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d &= *s;
    }
}

/// Typed feature chain: core 1.0 features plus the Vulkan 1.1/1.2/1.3
/// version structs actually in use.
#[derive(Clone, Copy, Default)]
pub struct FeatureSet {
    /// Vulkan 1.0 features
    pub core: vk::PhysicalDeviceFeatures,
    /// Vulkan 1.1 promoted features, when requested
    pub vulkan11: Option<vk::PhysicalDeviceVulkan11Features>,
    /// Vulkan 1.2 promoted features, when requested
    pub vulkan12: Option<vk::PhysicalDeviceVulkan12Features>,
    /// Vulkan 1.3 promoted features, when requested
    pub vulkan13: Option<vk::PhysicalDeviceVulkan13Features>,
}

// The chain pointers of the stored structs are always null; chains are
// assembled transiently at query and device-creation time.
unsafe impl Send for FeatureSet {}
unsafe impl Sync for FeatureSet {}

impl FeatureSet {
    /// OR every flag of `other` into `self`, materializing version structs
    /// that `other` uses and `self` does not.
    pub fn merge(&mut self, other: &FeatureSet) {
        or_into(core_flags_mut(&mut self.core), core_flags(&other.core));
        merge_ext(&mut self.vulkan11, &other.vulkan11);
        merge_ext(&mut self.vulkan12, &other.vulkan12);
        merge_ext(&mut self.vulkan13, &other.vulkan13);
    }

    /// AND every flag with what the device supports.
    pub fn prune(&mut self, supported: &FeatureSet) {
        and_into(core_flags_mut(&mut self.core), core_flags(&supported.core));
        prune_ext(&mut self.vulkan11, &supported.vulkan11);
        prune_ext(&mut self.vulkan12, &supported.vulkan12);
        prune_ext(&mut self.vulkan13, &supported.vulkan13);
    }

    /// Drop chain pointers carried over from user-built structs; the chain
    /// is reassembled from scratch wherever it is needed.
    fn clear_chain(&mut self) {
        if let Some(v11) = self.vulkan11.as_mut() {
            v11.p_next = std::ptr::null_mut();
        }
        if let Some(v12) = self.vulkan12.as_mut() {
            v12.p_next = std::ptr::null_mut();
        }
        if let Some(v13) = self.vulkan13.as_mut() {
            v13.p_next = std::ptr::null_mut();
        }
    }

    /// True when every flag of `required` is enabled in `self`.
    pub fn contains(&self, required: &FeatureSet) -> bool {
        flags_cover(core_flags(&self.core), core_flags(&required.core))
            && ext_covers(&self.vulkan11, &required.vulkan11)
            && ext_covers(&self.vulkan12, &required.vulkan12)
            && ext_covers(&self.vulkan13, &required.vulkan13)
    }
}

fn merge_ext<T: VersionFeatures>(dst: &mut Option<T>, src: &Option<T>) {
    if let Some(src) = src {
        let dst = dst.get_or_insert_with(T::default);
        or_into(ext_flags_mut(dst), ext_flags(src));
    }
}

fn prune_ext<T: VersionFeatures>(dst: &mut Option<T>, supported: &Option<T>) {
    if let Some(dst) = dst {
        match supported {
            Some(supported) => and_into(ext_flags_mut(dst), ext_flags(supported)),
            None => ext_flags_mut(dst).fill(0),
        }
    }
}

fn flags_cover(enabled: &[vk::Bool32], required: &[vk::Bool32]) -> bool {
    enabled.iter().zip(required).all(|(e, r)| *r == 0 || *e != 0)
}

fn ext_covers<T: VersionFeatures>(enabled: &Option<T>, required: &Option<T>) -> bool {
    match required {
        None => true,
        Some(required) => match enabled {
            Some(enabled) => flags_cover(ext_flags(enabled), ext_flags(required)),
            None => ext_flags(required).iter().all(|r| *r == 0),
        },
    }
}

/// Query device support for the structs present in `requested`.
pub fn query_supported(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    requested: &FeatureSet,
) -> FeatureSet {
    let mut supported = FeatureSet {
        core: vk::PhysicalDeviceFeatures::default(),
        vulkan11: requested.vulkan11.map(|_| vk::PhysicalDeviceVulkan11Features::default()),
        vulkan12: requested.vulkan12.map(|_| vk::PhysicalDeviceVulkan12Features::default()),
        vulkan13: requested.vulkan13.map(|_| vk::PhysicalDeviceVulkan13Features::default()),
    };
    let mut query = vk::PhysicalDeviceFeatures2::builder();
    if let Some(v11) = supported.vulkan11.as_mut() {
        query = query.push_next(v11);
    }
    if let Some(v12) = supported.vulkan12.as_mut() {
        query = query.push_next(v12);
    }
    if let Some(v13) = supported.vulkan13.as_mut() {
        query = query.push_next(v13);
    }
    let mut query = query.build();
    unsafe { instance.get_physical_device_features2(physical_device, &mut query) };
    supported.core = query.features;
    // The queried structs were written through the chain; clear the now
    // dangling pointers before the set is copied around.
    if let Some(v11) = supported.vulkan11.as_mut() {
        v11.p_next = std::ptr::null_mut();
    }
    if let Some(v12) = supported.vulkan12.as_mut() {
        v12.p_next = std::ptr::null_mut();
    }
    if let Some(v13) = supported.vulkan13.as_mut() {
        v13.p_next = std::ptr::null_mut();
    }
    supported
}

/// Negotiate: merge required into preferred, prune to device support and
/// verify the required subset survived.
///
/// Returns the enabled set and whether every required flag made it.
pub fn negotiate(
    preferred: &FeatureSet,
    required: &FeatureSet,
    supported: &FeatureSet,
) -> (FeatureSet, bool) {
    let mut enabled = *preferred;
    enabled.merge(required);
    enabled.prune(supported);
    enabled.clear_chain();
    let requirement_met = enabled.contains(required);
    (enabled, requirement_met)
}

fn report_flags(
    out: &mut String,
    names: &[&str],
    enabled: &[vk::Bool32],
    requested: &[vk::Bool32],
    required: &[vk::Bool32],
) {
    for (i, name) in names.iter().enumerate() {
        if requested[i] == 0 {
            continue;
        }
        let state = if enabled[i] != 0 {
            "enabled"
        } else if required[i] != 0 {
            "MISSING (required)"
        } else {
            "unavailable"
        };
        out.push_str(&format!("\t{name} : {state}\n"));
    }
}

fn ext_report<T: VersionFeatures>(
    out: &mut String,
    enabled: &Option<T>,
    requested: &Option<T>,
    required: &Option<T>,
) {
    if let Some(requested) = requested {
        let none = T::default();
        let enabled = enabled.as_ref().unwrap_or(&none);
        let required = required.as_ref().unwrap_or(&none);
        report_flags(
            out,
            T::NAMES,
            ext_flags(enabled),
            ext_flags(requested),
            ext_flags(required),
        );
    }
}

/// Write the enabled / unavailable / missing listing to the log sink.
pub fn log_feature_report(
    sink: &LogSink,
    enabled: &FeatureSet,
    requested: &FeatureSet,
    required: &FeatureSet,
) {
    let mut out = String::from("===== Used device features =====\n");
    report_flags(
        &mut out,
        &CORE_NAMES,
        core_flags(&enabled.core),
        core_flags(&requested.core),
        core_flags(&required.core),
    );
    ext_report(&mut out, &enabled.vulkan11, &requested.vulkan11, &required.vulkan11);
    ext_report(&mut out, &enabled.vulkan12, &requested.vulkan12, &required.vulkan12);
    ext_report(&mut out, &enabled.vulkan13, &requested.vulkan13, &required.vulkan13);
    sink.put(&out, LogLevel::Layer);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_flag_view_matches_fields() {
        let features = vk::PhysicalDeviceFeatures {
            geometry_shader: vk::TRUE,
            sampler_anisotropy: vk::TRUE,
            ..Default::default()
        };
        let flags = core_flags(&features);
        assert_eq!(flags.len(), CORE_NAMES.len());
        assert_eq!(flags[4], vk::TRUE); // geometryShader
        assert_eq!(flags[19], vk::TRUE); // samplerAnisotropy
        assert_eq!(flags.iter().filter(|f| **f != 0).count(), 2);
    }

    #[test]
    fn test_ext_flag_view_matches_fields() {
        let v13 = vk::PhysicalDeviceVulkan13Features {
            synchronization2: vk::TRUE,
            ..Default::default()
        };
        let flags = ext_flags(&v13);
        assert_eq!(flags.len(), 15);
        assert_eq!(flags[9], vk::TRUE); // synchronization2
    }

    #[test]
    fn test_negotiate_prunes_preferred_keeps_required() {
        let required = FeatureSet {
            core: vk::PhysicalDeviceFeatures {
                geometry_shader: vk::TRUE,
                ..Default::default()
            },
            ..Default::default()
        };
        let preferred = FeatureSet {
            core: vk::PhysicalDeviceFeatures {
                wide_lines: vk::TRUE,
                ..Default::default()
            },
            ..Default::default()
        };
        let supported = FeatureSet {
            core: vk::PhysicalDeviceFeatures {
                geometry_shader: vk::TRUE,
                sampler_anisotropy: vk::TRUE,
                ..Default::default()
            },
            ..Default::default()
        };
        let (enabled, met) = negotiate(&preferred, &required, &supported);
        assert!(met);
        assert_eq!(enabled.core.geometry_shader, vk::TRUE);
        // wideLines was preferred but unsupported, pruned without failing
        assert_eq!(enabled.core.wide_lines, vk::FALSE);
    }

    #[test]
    fn test_negotiate_detects_missing_required() {
        let required = FeatureSet {
            core: vk::PhysicalDeviceFeatures {
                shader_float64: vk::TRUE,
                ..Default::default()
            },
            ..Default::default()
        };
        let supported = FeatureSet::default();
        let (_, met) = negotiate(&FeatureSet::default(), &required, &supported);
        assert!(!met);
    }

    #[test]
    fn test_merge_materializes_version_structs() {
        let mut preferred = FeatureSet::default();
        let required = FeatureSet {
            vulkan12: Some(vk::PhysicalDeviceVulkan12Features {
                timeline_semaphore: vk::TRUE,
                ..Default::default()
            }),
            ..Default::default()
        };
        preferred.merge(&required);
        assert_eq!(preferred.vulkan12.unwrap().timeline_semaphore, vk::TRUE);
    }

    #[test]
    fn test_required_version_struct_without_support_fails() {
        let required = FeatureSet {
            vulkan13: Some(vk::PhysicalDeviceVulkan13Features {
                dynamic_rendering: vk::TRUE,
                ..Default::default()
            }),
            ..Default::default()
        };
        let supported = FeatureSet {
            vulkan13: Some(vk::PhysicalDeviceVulkan13Features::default()),
            ..Default::default()
        };
        let (_, met) = negotiate(&FeatureSet::default(), &required, &supported);
        assert!(!met);
    }
}
