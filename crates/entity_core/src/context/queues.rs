//! Queue-family carving
//!
//! At device creation the application's [`QueueRequirement`] is reconciled
//! against the physical device's queue families: a best-fit pass hands each
//! role to the family that matches it exactly, then a fallback pass fills the
//! remainder and splits an unsatisfied graphics-and-compute wish into
//! separate graphics and compute queues. Acquisition afterwards is monotonic;
//! queues are never returned to the pool.

use ash::vk;
use serde::{Deserialize, Serialize};

/// How many queues of each role the application wants carved out.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QueueRequirement {
    /// Queues with transfer capability, regardless of their other abilities
    pub transfer: u8,
    /// Graphics-only queues
    pub dedicated_graphic: u8,
    /// Compute-only queues
    pub dedicated_compute: u8,
    /// Combined graphics-and-compute queues; split into a graphics and a
    /// compute queue when no combined family is available
    pub dedicated_graphic_and_compute: u8,
    /// Transfer-only queues
    pub dedicated_transfer: u8,
}

impl Default for QueueRequirement {
    fn default() -> Self {
        Self {
            transfer: 1,
            dedicated_graphic: 1,
            dedicated_compute: 0,
            dedicated_graphic_and_compute: 0,
            dedicated_transfer: 0,
        }
    }
}

/// Role of a queue handed out by [`acquire`](crate::context::VulkanContext::acquire_queue).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueType {
    /// Graphics-capable queue
    Graphic,
    /// Compute-capable queue
    Compute,
    /// Queue capable of both graphics and compute
    GraphicCompute,
    /// Transfer queue
    Transfer,
}

/// One queue family, with the carving bookkeeping attached.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueFamily {
    /// Family index
    pub id: u32,
    /// Total number of queues the family exposes
    pub capacity: u8,
    /// Number of carved queues not yet acquired
    pub size: u8,
    /// Family supports graphics
    pub graphic: bool,
    /// Family supports compute
    pub compute: bool,
    /// Family supports transfer
    pub transfer: bool,
    /// Family supports presentation to the context's surface
    pub present: bool,
    /// Remaining queues reserved for the graphics-only role
    pub dedicated_graphic_count: u8,
    /// Remaining queues reserved for the compute-only role
    pub dedicated_compute_count: u8,
    /// Remaining queues reserved for the combined role
    pub dedicated_graphic_and_compute_count: u8,
    /// Remaining queues reserved for the transfer role
    pub dedicated_transfer_count: u8,
}

/// Capability snapshot of one family, before carving.
#[derive(Debug, Clone, Copy)]
pub struct FamilyCapability {
    /// Total queue count
    pub capacity: u8,
    /// Supports graphics
    pub graphic: bool,
    /// Supports compute
    pub compute: bool,
    /// Supports transfer
    pub transfer: bool,
    /// Supports presentation
    pub present: bool,
}

impl FamilyCapability {
    /// Read the capability bits out of Vulkan's family properties.
    pub fn from_properties(props: &vk::QueueFamilyProperties, present: bool) -> Self {
        Self {
            capacity: props.queue_count.min(u32::from(u8::MAX)) as u8,
            graphic: props.queue_flags.contains(vk::QueueFlags::GRAPHICS),
            compute: props.queue_flags.contains(vk::QueueFlags::COMPUTE),
            transfer: props.queue_flags.contains(vk::QueueFlags::TRANSFER),
            present,
        }
    }
}

/// Reconcile the requirement against the available families.
///
/// First pass: families that match a role exactly absorb as much of that
/// role's count as their capacity allows. Second pass: whatever remains of
/// the combined wish is split into separate graphics and compute wishes and
/// the leftover capacity of every family is drafted in. A final pass tops up
/// plain transfer capability if the `transfer` requirement is still unmet.
pub fn carve_families(capabilities: &[FamilyCapability], request: &QueueRequirement) -> Vec<QueueFamily> {
    let mut families: Vec<QueueFamily> = capabilities
        .iter()
        .enumerate()
        .map(|(i, cap)| QueueFamily {
            id: i as u32,
            capacity: cap.capacity,
            graphic: cap.graphic,
            compute: cap.compute,
            transfer: cap.transfer,
            present: cap.present,
            ..QueueFamily::default()
        })
        .collect();

    let mut graphic_and_compute = request.dedicated_graphic_and_compute;
    let mut graphic = request.dedicated_graphic;
    let mut compute = request.dedicated_compute;
    let mut transfer_only = request.dedicated_transfer;

    for q in &mut families {
        if q.graphic {
            if q.compute {
                q.size = graphic_and_compute.min(q.capacity);
                q.dedicated_graphic_and_compute_count = q.size;
                graphic_and_compute -= q.size;
            } else {
                q.size = graphic.min(q.capacity);
                q.dedicated_graphic_count = q.size;
                graphic -= q.size;
            }
        } else if q.compute {
            q.size = compute.min(q.capacity);
            q.dedicated_compute_count = q.size;
            compute -= q.size;
        } else if q.transfer {
            q.size = transfer_only.min(q.capacity);
            q.dedicated_transfer_count = q.size;
            transfer_only -= q.size;
        }
    }

    // An unsatisfiable combined wish degrades to one graphics and one compute
    // queue per missing pair.
    graphic = graphic.saturating_add(graphic_and_compute);
    compute = compute.saturating_add(graphic_and_compute);

    let mut transfer = i16::from(request.transfer);
    for q in &mut families {
        if q.capacity > q.size {
            if q.graphic {
                let extract = (q.capacity - q.size).min(graphic);
                q.size += extract;
                q.dedicated_graphic_count += extract;
                graphic -= extract;
            }
            if q.compute {
                let extract = (q.capacity - q.size).min(compute);
                q.size += extract;
                q.dedicated_compute_count += extract;
                compute -= extract;
            }
            if q.transfer {
                let extract = (q.capacity - q.size).min(transfer_only);
                q.size += extract;
                q.dedicated_transfer_count += extract;
                transfer_only -= extract;
            }
        }
        if q.transfer {
            transfer -= i16::from(q.size);
        }
    }
    if transfer > 0 {
        // Any transfer-capable capacity will do for the generic wish
        for q in &mut families {
            if q.transfer {
                let extract = (q.capacity - q.size).min(transfer.clamp(0, i16::from(u8::MAX)) as u8);
                q.size += extract;
                q.dedicated_transfer_count += extract;
                transfer -= i16::from(extract);
            }
        }
    }
    families
}

/// Build the `VkDeviceQueueCreateInfo` list for the carved families.
///
/// The returned priorities buffer must outlive device creation; every queue
/// gets the same neutral priority.
pub fn queue_create_infos(
    families: &[QueueFamily],
    priorities: &[f32; 16],
) -> Vec<vk::DeviceQueueCreateInfo> {
    families
        .iter()
        .filter(|q| q.size > 0)
        .map(|q| {
            vk::DeviceQueueCreateInfo::builder()
                .queue_family_index(q.id)
                .queue_priorities(&priorities[..usize::from(q.size.min(16))])
                .build()
        })
        .collect()
}

/// Take one queue slot of the requested role out of `families`.
///
/// Returns the family index within the slice and the local queue index to
/// pass to `vkGetDeviceQueue`. Allocation is monotonic by design.
pub fn take_queue(families: &mut [QueueFamily], role: QueueType) -> Option<(usize, u32)> {
    for (idx, q) in families.iter_mut().enumerate() {
        let reserved = match role {
            QueueType::Graphic => &mut q.dedicated_graphic_count,
            QueueType::Compute => &mut q.dedicated_compute_count,
            QueueType::GraphicCompute => &mut q.dedicated_graphic_and_compute_count,
            QueueType::Transfer => &mut q.dedicated_transfer_count,
        };
        if *reserved == 0 {
            continue;
        }
        *reserved -= 1;
        q.size -= 1;
        return Some((idx, u32::from(q.size)));
    }
    None
}

/// Non-consuming lookup of the family that would serve the next acquisition.
pub fn preview_family(families: &[QueueFamily], role: QueueType) -> Option<&QueueFamily> {
    families.iter().find(|q| match role {
        QueueType::Graphic => q.dedicated_graphic_count > 0,
        QueueType::Compute => q.dedicated_compute_count > 0,
        QueueType::GraphicCompute => q.dedicated_graphic_and_compute_count > 0,
        QueueType::Transfer => q.dedicated_transfer_count > 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(capacity: u8, graphic: bool, compute: bool, transfer: bool) -> FamilyCapability {
        FamilyCapability {
            capacity,
            graphic,
            compute,
            transfer,
            present: graphic,
        }
    }

    #[test]
    fn test_best_fit_assigns_matching_roles() {
        // Typical discrete GPU: combined family, compute family, transfer family
        let caps = [
            family(16, true, true, true),
            family(8, false, true, true),
            family(2, false, false, true),
        ];
        let req = QueueRequirement {
            transfer: 0,
            dedicated_graphic: 0,
            dedicated_compute: 2,
            dedicated_graphic_and_compute: 1,
            dedicated_transfer: 1,
        };
        let carved = carve_families(&caps, &req);
        assert_eq!(carved[0].dedicated_graphic_and_compute_count, 1);
        assert_eq!(carved[1].dedicated_compute_count, 2);
        assert_eq!(carved[2].dedicated_transfer_count, 1);
    }

    #[test]
    fn test_combined_wish_splits_when_unavailable() {
        // Graphics-only and compute-only families: a graphic+compute request
        // must degrade into one of each.
        let caps = [family(4, true, false, true), family(4, false, true, true)];
        let req = QueueRequirement {
            transfer: 0,
            dedicated_graphic: 0,
            dedicated_compute: 0,
            dedicated_graphic_and_compute: 1,
            dedicated_transfer: 0,
        };
        let carved = carve_families(&caps, &req);
        assert_eq!(carved[0].dedicated_graphic_count, 1);
        assert_eq!(carved[1].dedicated_compute_count, 1);
        assert_eq!(carved[0].dedicated_graphic_and_compute_count, 0);
    }

    #[test]
    fn test_transfer_requirement_reuses_existing_carving() {
        let caps = [family(4, true, true, true)];
        let req = QueueRequirement {
            transfer: 1,
            dedicated_graphic: 0,
            dedicated_compute: 0,
            dedicated_graphic_and_compute: 1,
            dedicated_transfer: 0,
        };
        // The combined queue already covers the generic transfer wish.
        let carved = carve_families(&caps, &req);
        assert_eq!(carved[0].size, 1);
        assert_eq!(carved[0].dedicated_transfer_count, 0);
    }

    #[test]
    fn test_transfer_topup_when_not_covered() {
        let caps = [family(4, true, false, false), family(2, false, false, true)];
        let req = QueueRequirement {
            transfer: 2,
            dedicated_graphic: 1,
            dedicated_compute: 0,
            dedicated_graphic_and_compute: 0,
            dedicated_transfer: 0,
        };
        let carved = carve_families(&caps, &req);
        assert_eq!(carved[0].dedicated_graphic_count, 1);
        assert_eq!(carved[1].dedicated_transfer_count, 2);
    }

    #[test]
    fn test_acquisition_is_monotonic() {
        let caps = [family(2, true, true, true)];
        let req = QueueRequirement {
            transfer: 0,
            dedicated_graphic: 0,
            dedicated_compute: 0,
            dedicated_graphic_and_compute: 2,
            dedicated_transfer: 0,
        };
        let mut carved = carve_families(&caps, &req);
        assert!(preview_family(&carved, QueueType::GraphicCompute).is_some());
        let first = take_queue(&mut carved, QueueType::GraphicCompute).unwrap();
        let second = take_queue(&mut carved, QueueType::GraphicCompute).unwrap();
        assert_ne!(first.1, second.1);
        assert!(take_queue(&mut carved, QueueType::GraphicCompute).is_none());
        assert!(preview_family(&carved, QueueType::GraphicCompute).is_none());
    }

    #[test]
    fn test_capacity_is_never_exceeded() {
        let caps = [family(1, true, true, true)];
        let req = QueueRequirement {
            transfer: 3,
            dedicated_graphic: 2,
            dedicated_compute: 2,
            dedicated_graphic_and_compute: 2,
            dedicated_transfer: 2,
        };
        let carved = carve_families(&caps, &req);
        assert!(carved[0].size <= carved[0].capacity);
    }
}
