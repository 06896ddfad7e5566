use crate::vulkan::raytracing::RaytracingDevice;
use erupt::vk;

#[derive(Copy, Clone)]
pub struct CommandBuffer {
    handle: vk::CommandBuffer,
}

impl CommandBuffer {
    pub fn handle(&self) -> vk::CommandBuffer {
        self.handle
    }

    pub fn new(handle: vk::CommandBuffer) -> Self {
        CommandBuffer { handle }
    }

    pub fn build_acceleration_structures(
        &self,
        device: &impl RaytracingDevice,
        build_infos: &[vk::AccelerationStructureBuildGeometryInfoKHRBuilder],
        build_ranges: &[&[vk::AccelerationStructureBuildRangeInfoKHR]],
    ) {
        debug_assert_eq!(build_infos.len(), build_ranges.len());
        device.cmd_build_acceleration_structures(self.handle, build_infos, build_ranges);
    }

    /// Orders acceleration structure builds recorded before this call against
    /// builds (and scratch reuse) recorded after it.
    pub fn acceleration_structure_memory_barrier(&self, device: &impl RaytracingDevice) {
        device.cmd_memory_barrier(
            self.handle,
            vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
            vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
            vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR,
            vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR,
        );
    }

    /// Full read/write barrier between consecutive builds sharing scratch memory.
    pub fn acceleration_structure_full_barrier(&self, device: &impl RaytracingDevice) {
        let access = vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR
            | vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR;
        device.cmd_memory_barrier(
            self.handle,
            vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
            vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
            access,
            access,
        );
    }

    /// Makes transfer writes to build inputs visible to the build stage.
    /// Host writes are already visible once the command buffer is submitted.
    pub fn build_input_barrier(&self, device: &impl RaytracingDevice) {
        device.cmd_memory_barrier(
            self.handle,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
            vk::AccessFlags::TRANSFER_WRITE,
            vk::AccessFlags::SHADER_READ,
        );
    }

    pub fn write_compacted_sizes(
        &self,
        device: &impl RaytracingDevice,
        structures: &[vk::AccelerationStructureKHR],
        query_pool: vk::QueryPool,
        first_query: u32,
    ) {
        device.cmd_write_compacted_sizes(self.handle, structures, query_pool, first_query);
    }

    pub fn compact_acceleration_structure(
        &self,
        device: &impl RaytracingDevice,
        src: vk::AccelerationStructureKHR,
        dst: vk::AccelerationStructureKHR,
    ) {
        let copy_info = vk::CopyAccelerationStructureInfoKHRBuilder::new()
            .src(src)
            .dst(dst)
            .mode(vk::CopyAccelerationStructureModeKHR::COMPACT_KHR);
        device.cmd_copy_acceleration_structure(self.handle, &copy_info);
    }
}
