use erupt::vk;
use gpu_alloc::MemoryBlock;

/// Device buffer plus the memory block backing it. Buffers are created and
/// released through a [`RaytracingDevice`](crate::vulkan::raytracing::RaytracingDevice),
/// never dropped implicitly.
pub struct Buffer {
    handle: vk::Buffer,
    memory: Option<MemoryBlock<vk::DeviceMemory>>,
    size: u64,
    device_address: vk::DeviceAddress,
}

impl Buffer {
    pub fn new(
        handle: vk::Buffer,
        memory: Option<MemoryBlock<vk::DeviceMemory>>,
        size: u64,
        device_address: vk::DeviceAddress,
    ) -> Self {
        Buffer {
            handle,
            memory,
            size,
            device_address,
        }
    }

    pub fn handle(&self) -> vk::Buffer {
        self.handle
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn get_device_address(&self) -> vk::DeviceAddress {
        self.device_address
    }

    pub(crate) fn memory_mut(&mut self) -> Option<&mut MemoryBlock<vk::DeviceMemory>> {
        self.memory.as_mut()
    }

    pub(crate) fn into_parts(self) -> (vk::Buffer, Option<MemoryBlock<vk::DeviceMemory>>) {
        (self.handle, self.memory)
    }
}
