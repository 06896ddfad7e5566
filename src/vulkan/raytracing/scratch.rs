use crate::config::DEFAULT_SCRATCH_ALIGNMENT;
use crate::error::Result;
use crate::vulkan::buffer::Buffer;
use crate::vulkan::raytracing::acceleration_structure::round_up;
use crate::vulkan::raytracing::geometry_build_descriptor::GeometryBuildDescriptor;
use crate::vulkan::raytracing::RaytracingDevice;
use erupt::vk;

/// How a scratch allocation is carved up for one batch of builds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScratchLayout {
    pub size: u64,
    pub offsets: Vec<u64>,
}

/// Falls back to `fallback` (or 128) when the device reports no alignment.
pub fn effective_alignment(reported: u64, fallback: u64) -> u64 {
    match (reported, fallback) {
        (0, 0) => DEFAULT_SCRATCH_ALIGNMENT,
        (0, fallback) => fallback,
        (reported, _) => reported,
    }
}

/// Lays out scratch regions for structures needing `scratch_sizes` bytes.
///
/// When the aligned sizes sum to less than `hint_budget` every structure
/// gets a private region. Otherwise `N` regions of the largest aligned size
/// are shared round-robin, `N = clamp(hint_budget / max, 1, len)`. A zero
/// requirement still occupies one alignment unit so the layout is never
/// empty.
pub fn scratch_layout(hint_budget: u64, scratch_sizes: &[u64], alignment: u64) -> ScratchLayout {
    assert!(alignment > 0);
    if scratch_sizes.is_empty() {
        return ScratchLayout {
            size: 0,
            offsets: Vec::new(),
        };
    }
    let aligned = scratch_sizes
        .iter()
        .map(|&size| round_up(size.max(1), alignment))
        .collect::<Vec<_>>();
    let max_scratch = aligned.iter().copied().max().unwrap_or(0);
    let total_scratch: u64 = aligned.iter().sum();

    if total_scratch < hint_budget {
        let offsets = aligned
            .iter()
            .scan(0, |offset, &size| {
                let current = *offset;
                *offset += size;
                Some(current)
            })
            .collect();
        ScratchLayout {
            size: total_scratch,
            offsets,
        }
    } else {
        let regions = (hint_budget / max_scratch).clamp(1, aligned.len() as u64);
        ScratchLayout {
            size: regions * max_scratch,
            offsets: (0..regions).map(|region| region * max_scratch).collect(),
        }
    }
}

fn build_scratch_sizes(build_data: &[GeometryBuildDescriptor]) -> Vec<u64> {
    build_data
        .iter()
        .map(|data| match data.size_info() {
            Some(size_info) => size_info.build_scratch_size,
            None => panic!("scratch sized before finalize"),
        })
        .collect()
}

pub fn scratch_size(
    hint_budget: u64,
    build_data: &[GeometryBuildDescriptor],
    alignment: u64,
) -> u64 {
    scratch_layout(hint_budget, &build_scratch_sizes(build_data), alignment).size
}

pub fn scratch_addresses(
    hint_budget: u64,
    build_data: &[GeometryBuildDescriptor],
    alignment: u64,
    base_address: vk::DeviceAddress,
) -> Vec<vk::DeviceAddress> {
    scratch_layout(hint_budget, &build_scratch_sizes(build_data), alignment)
        .offsets
        .into_iter()
        .map(|offset| base_address + offset)
        .collect()
}

/// Transient device memory for acceleration structure builds. The base
/// address is rounded up to the scratch alignment inside a slightly larger
/// allocation.
pub struct ScratchBuffer {
    buffer: Buffer,
    base_address: vk::DeviceAddress,
    size: u64,
}

impl ScratchBuffer {
    pub fn new(device: &impl RaytracingDevice, size: u64, alignment: u64) -> Result<Self> {
        let size = size.max(alignment);
        let buffer = device.create_buffer(
            size + alignment,
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            gpu_alloc::UsageFlags::FAST_DEVICE_ACCESS | gpu_alloc::UsageFlags::DEVICE_ADDRESS,
        )?;
        let base_address = round_up(buffer.get_device_address(), alignment);
        log::trace!("scratch buffer of {} bytes at {:#x}", size, base_address);

        Ok(ScratchBuffer {
            buffer,
            base_address,
            size,
        })
    }

    pub fn device_address(&self) -> vk::DeviceAddress {
        self.base_address
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn addresses(
        &self,
        hint_budget: u64,
        build_data: &[GeometryBuildDescriptor],
        alignment: u64,
    ) -> Vec<vk::DeviceAddress> {
        let addresses = scratch_addresses(hint_budget, build_data, alignment, self.base_address);
        debug_assert!(addresses
            .iter()
            .all(|&address| address < self.base_address + self.size));
        addresses
    }

    pub fn destroy(self, device: &impl RaytracingDevice) {
        device.destroy_buffer(self.buffer);
    }
}
