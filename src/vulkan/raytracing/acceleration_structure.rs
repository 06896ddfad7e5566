use crate::error::Result;
use crate::vulkan::buffer::Buffer;
use crate::vulkan::raytracing::RaytracingDevice;
use erupt::vk;

pub fn round_up(size: u64, granularity: u64) -> u64 {
    ((size + granularity - 1) / granularity) * granularity
}

/// A device acceleration structure together with the buffer holding it.
///
/// The pair is an unmanaged resource: it is released only through
/// [`AccelerationStructure::destroy`], and is not `Clone` so exactly one
/// owner can do that.
pub struct AccelerationStructure {
    handle: vk::AccelerationStructureKHR,
    buffer: Buffer,
    device_address: vk::DeviceAddress,
    kind: vk::AccelerationStructureTypeKHR,
}

impl AccelerationStructure {
    /// Allocates a storage buffer of exactly `create_info.size` bytes, creates
    /// the structure inside it and queries its device address.
    pub fn new(
        device: &impl RaytracingDevice,
        create_info: &vk::AccelerationStructureCreateInfoKHR,
    ) -> Result<Self> {
        let buffer = device.create_buffer(
            create_info.size,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            gpu_alloc::UsageFlags::FAST_DEVICE_ACCESS | gpu_alloc::UsageFlags::DEVICE_ADDRESS,
        )?;

        let create_info = vk::AccelerationStructureCreateInfoKHRBuilder::new()
            ._type(create_info._type)
            .size(create_info.size)
            .buffer(buffer.handle())
            .offset(0);

        let handle = match device.create_acceleration_structure(&create_info) {
            Ok(handle) => handle,
            Err(err) => {
                device.destroy_buffer(buffer);
                return Err(err);
            }
        };
        let device_address = device.acceleration_structure_address(handle);

        log::trace!(
            "created {:?} acceleration structure of {} bytes at {:#x}",
            create_info._type,
            create_info.size,
            device_address
        );

        Ok(AccelerationStructure {
            handle,
            buffer,
            device_address,
            kind: create_info._type,
        })
    }

    pub fn handle(&self) -> vk::AccelerationStructureKHR {
        self.handle
    }

    pub fn device_address(&self) -> vk::DeviceAddress {
        self.device_address
    }

    pub fn size(&self) -> u64 {
        self.buffer.size()
    }

    pub fn kind(&self) -> vk::AccelerationStructureTypeKHR {
        self.kind
    }

    pub fn destroy(self, device: &impl RaytracingDevice) {
        device.destroy_buffer(self.buffer);
        device.destroy_acceleration_structure(self.handle);
    }
}
