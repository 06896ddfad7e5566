use crate::error::Result;
use crate::vulkan::buffer::Buffer;
use crate::vulkan::command_buffer::CommandBuffer;
use erupt::vk;

/// Device entry points the acceleration structure builders depend on.
///
/// Builders receive an implementation explicitly instead of reaching for
/// loader state, which lets tests substitute a recording device.
pub trait RaytracingDevice {
    /// `minAccelerationStructureScratchOffsetAlignment`, or `0` when the
    /// device does not report one.
    fn min_scratch_alignment(&self) -> u64;

    fn build_sizes(
        &self,
        build_info: &vk::AccelerationStructureBuildGeometryInfoKHR,
        max_primitive_counts: &[u32],
    ) -> vk::AccelerationStructureBuildSizesInfoKHR;

    fn create_buffer(
        &self,
        size: u64,
        usage: vk::BufferUsageFlags,
        memory_usage: gpu_alloc::UsageFlags,
    ) -> Result<Buffer>;

    /// Copies `data` to the start of a host visible buffer.
    fn write_buffer(&self, buffer: &mut Buffer, data: &[u8]) -> Result<()>;

    fn destroy_buffer(&self, buffer: Buffer);

    fn create_acceleration_structure(
        &self,
        create_info: &vk::AccelerationStructureCreateInfoKHR,
    ) -> Result<vk::AccelerationStructureKHR>;

    fn destroy_acceleration_structure(&self, acceleration_structure: vk::AccelerationStructureKHR);

    fn acceleration_structure_address(
        &self,
        acceleration_structure: vk::AccelerationStructureKHR,
    ) -> vk::DeviceAddress;

    fn create_query_pool(&self, query_type: vk::QueryType, count: u32) -> Result<vk::QueryPool>;

    fn destroy_query_pool(&self, query_pool: vk::QueryPool);

    /// Host side reset of `[first, first + count)`.
    fn reset_query_pool(&self, query_pool: vk::QueryPool, first: u32, count: u32);

    /// Blocks until the compacted size queries `[first, first + count)` are available.
    fn compacted_sizes(
        &self,
        query_pool: vk::QueryPool,
        first: u32,
        count: u32,
    ) -> Result<Vec<vk::DeviceSize>>;

    fn cmd_build_acceleration_structures(
        &self,
        command_buffer: vk::CommandBuffer,
        build_infos: &[vk::AccelerationStructureBuildGeometryInfoKHRBuilder],
        build_ranges: &[&[vk::AccelerationStructureBuildRangeInfoKHR]],
    );

    fn cmd_memory_barrier(
        &self,
        command_buffer: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        src_access: vk::AccessFlags,
        dst_access: vk::AccessFlags,
    );

    fn cmd_write_compacted_sizes(
        &self,
        command_buffer: vk::CommandBuffer,
        acceleration_structures: &[vk::AccelerationStructureKHR],
        query_pool: vk::QueryPool,
        first_query: u32,
    );

    fn cmd_copy_acceleration_structure(
        &self,
        command_buffer: vk::CommandBuffer,
        copy_info: &vk::CopyAccelerationStructureInfoKHR,
    );

    /// Records into a fresh command buffer, submits it and waits for the
    /// queue to go idle before returning.
    fn single_time_submit<T>(
        &self,
        record: impl FnOnce(CommandBuffer) -> Result<T>,
    ) -> Result<T>;
}
