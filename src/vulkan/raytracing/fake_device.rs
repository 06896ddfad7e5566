//! Recording stand-in for [`RaytracingDevice`] used by the unit tests.
//!
//! Commands execute immediately at record time: build sizes are synthesized
//! from primitive counts, compacted size queries are answered from the
//! structure size and a configurable ratio.

use crate::error::{AccelError, Result};
use crate::vulkan::buffer::Buffer;
use crate::vulkan::command_buffer::CommandBuffer;
use crate::vulkan::raytracing::acceleration_structure::round_up;
use crate::vulkan::raytracing::RaytracingDevice;
use erupt::vk;
use std::cell::RefCell;
use std::collections::HashMap;

#[derive(Clone, Debug, PartialEq)]
pub struct BuildRecord {
    pub mode: vk::BuildAccelerationStructureModeKHR,
    pub kind: vk::AccelerationStructureTypeKHR,
    pub src: vk::AccelerationStructureKHR,
    pub dst: vk::AccelerationStructureKHR,
    pub scratch_address: vk::DeviceAddress,
    pub primitive_counts: Vec<u32>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    Build(Vec<BuildRecord>),
    Barrier {
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        src_access: vk::AccessFlags,
        dst_access: vk::AccessFlags,
    },
    WriteCompactedSizes {
        structures: Vec<vk::AccelerationStructureKHR>,
        first_query: u32,
    },
    Copy {
        src: vk::AccelerationStructureKHR,
        dst: vk::AccelerationStructureKHR,
        mode: vk::CopyAccelerationStructureModeKHR,
    },
    Submit,
}

struct State {
    next_handle: u64,
    next_address: vk::DeviceAddress,
    min_scratch_alignment: u64,
    bytes_per_primitive: u64,
    scratch_per_primitive: u64,
    compaction_percent: u64,
    fail_above: Option<u64>,
    buffers: HashMap<u64, Vec<u8>>,
    structures: HashMap<u64, u64>,
    query_pools: HashMap<u64, u32>,
    queries: HashMap<(u64, u32), u64>,
    structures_created: usize,
    commands: Vec<Command>,
}

pub struct FakeDevice {
    state: RefCell<State>,
}

impl FakeDevice {
    pub fn new() -> Self {
        FakeDevice {
            state: RefCell::new(State {
                next_handle: 1,
                next_address: 0x10_0000,
                min_scratch_alignment: 128,
                bytes_per_primitive: 64,
                scratch_per_primitive: 32,
                compaction_percent: 50,
                fail_above: None,
                buffers: HashMap::new(),
                structures: HashMap::new(),
                query_pools: HashMap::new(),
                queries: HashMap::new(),
                structures_created: 0,
                commands: Vec::new(),
            }),
        }
    }

    pub fn set_min_scratch_alignment(&self, alignment: u64) {
        self.state.borrow_mut().min_scratch_alignment = alignment;
    }

    pub fn set_bytes_per_primitive(&self, bytes: u64) {
        self.state.borrow_mut().bytes_per_primitive = bytes;
    }

    pub fn set_scratch_per_primitive(&self, bytes: u64) {
        self.state.borrow_mut().scratch_per_primitive = bytes;
    }

    /// Compacted size reported as a percentage of the original. `0` makes
    /// every query report zero.
    pub fn set_compaction_percent(&self, percent: u64) {
        self.state.borrow_mut().compaction_percent = percent;
    }

    pub fn fail_structure_creation_above(&self, size: u64) {
        self.state.borrow_mut().fail_above = Some(size);
    }

    pub fn live_buffers(&self) -> usize {
        self.state.borrow().buffers.len()
    }

    pub fn live_structures(&self) -> usize {
        self.state.borrow().structures.len()
    }

    pub fn live_query_pools(&self) -> usize {
        self.state.borrow().query_pools.len()
    }

    pub fn structures_created(&self) -> usize {
        self.state.borrow().structures_created
    }

    pub fn structure_size(&self, structure: vk::AccelerationStructureKHR) -> Option<u64> {
        self.state.borrow().structures.get(&structure.0).copied()
    }

    pub fn buffer_contents(&self, buffer: vk::Buffer) -> Vec<u8> {
        self.state
            .borrow()
            .buffers
            .get(&buffer.0)
            .cloned()
            .unwrap_or_default()
    }

    pub fn commands(&self) -> Vec<Command> {
        self.state.borrow().commands.clone()
    }

    pub fn builds(&self) -> Vec<Vec<BuildRecord>> {
        self.commands()
            .into_iter()
            .filter_map(|command| match command {
                Command::Build(records) => Some(records),
                _ => None,
            })
            .collect()
    }

    pub fn submit_count(&self) -> usize {
        self.commands()
            .iter()
            .filter(|command| **command == Command::Submit)
            .count()
    }

    pub fn clear_commands(&self) {
        self.state.borrow_mut().commands.clear();
    }

    fn next_handle(state: &mut State) -> u64 {
        let handle = state.next_handle;
        state.next_handle += 1;
        handle
    }
}

impl RaytracingDevice for FakeDevice {
    fn min_scratch_alignment(&self) -> u64 {
        self.state.borrow().min_scratch_alignment
    }

    fn build_sizes(
        &self,
        build_info: &vk::AccelerationStructureBuildGeometryInfoKHR,
        max_primitive_counts: &[u32],
    ) -> vk::AccelerationStructureBuildSizesInfoKHR {
        assert_eq!(build_info.geometry_count as usize, max_primitive_counts.len());
        let state = self.state.borrow();
        let primitives: u64 = max_primitive_counts.iter().map(|&count| count as u64).sum();
        let build_scratch_size = primitives * state.scratch_per_primitive;
        *vk::AccelerationStructureBuildSizesInfoKHRBuilder::new()
            .acceleration_structure_size((primitives * state.bytes_per_primitive).max(256))
            .build_scratch_size(build_scratch_size)
            .update_scratch_size(build_scratch_size / 2)
    }

    fn create_buffer(
        &self,
        size: u64,
        _usage: vk::BufferUsageFlags,
        _memory_usage: gpu_alloc::UsageFlags,
    ) -> Result<Buffer> {
        assert!(size > 0, "zero sized buffer");
        let mut state = self.state.borrow_mut();
        let handle = Self::next_handle(&mut state);
        let address = state.next_address;
        state.next_address += round_up(size, 256);
        state.buffers.insert(handle, Vec::new());
        Ok(Buffer::new(vk::Buffer(handle), None, size, address))
    }

    fn write_buffer(&self, buffer: &mut Buffer, data: &[u8]) -> Result<()> {
        let mut state = self.state.borrow_mut();
        let contents = state
            .buffers
            .get_mut(&buffer.handle().0)
            .ok_or(AccelError::Vulkan(vk::Result::ERROR_MEMORY_MAP_FAILED))?;
        assert!(data.len() as u64 <= buffer.size());
        if contents.len() < data.len() {
            contents.resize(data.len(), 0);
        }
        contents[..data.len()].copy_from_slice(data);
        Ok(())
    }

    fn destroy_buffer(&self, buffer: Buffer) {
        let removed = self.state.borrow_mut().buffers.remove(&buffer.handle().0);
        assert!(removed.is_some(), "buffer destroyed twice");
    }

    fn create_acceleration_structure(
        &self,
        create_info: &vk::AccelerationStructureCreateInfoKHR,
    ) -> Result<vk::AccelerationStructureKHR> {
        let mut state = self.state.borrow_mut();
        if matches!(state.fail_above, Some(limit) if create_info.size > limit) {
            return Err(AccelError::Vulkan(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY));
        }
        assert!(
            state.buffers.contains_key(&create_info.buffer.0),
            "structure created in a missing buffer"
        );
        let handle = Self::next_handle(&mut state);
        state.structures.insert(handle, create_info.size);
        state.structures_created += 1;
        Ok(vk::AccelerationStructureKHR(handle))
    }

    fn destroy_acceleration_structure(&self, acceleration_structure: vk::AccelerationStructureKHR) {
        let removed = self
            .state
            .borrow_mut()
            .structures
            .remove(&acceleration_structure.0);
        assert!(removed.is_some(), "acceleration structure destroyed twice");
    }

    fn acceleration_structure_address(
        &self,
        acceleration_structure: vk::AccelerationStructureKHR,
    ) -> vk::DeviceAddress {
        0xA000_0000 + acceleration_structure.0 * 0x1000
    }

    fn create_query_pool(&self, query_type: vk::QueryType, count: u32) -> Result<vk::QueryPool> {
        assert_eq!(
            query_type,
            vk::QueryType::ACCELERATION_STRUCTURE_COMPACTED_SIZE_KHR
        );
        let mut state = self.state.borrow_mut();
        let handle = Self::next_handle(&mut state);
        state.query_pools.insert(handle, count);
        Ok(vk::QueryPool(handle))
    }

    fn destroy_query_pool(&self, query_pool: vk::QueryPool) {
        let removed = self.state.borrow_mut().query_pools.remove(&query_pool.0);
        assert!(removed.is_some(), "query pool destroyed twice");
    }

    fn reset_query_pool(&self, query_pool: vk::QueryPool, first: u32, count: u32) {
        let mut state = self.state.borrow_mut();
        for slot in first..first + count {
            state.queries.remove(&(query_pool.0, slot));
        }
    }

    fn compacted_sizes(
        &self,
        query_pool: vk::QueryPool,
        first: u32,
        count: u32,
    ) -> Result<Vec<vk::DeviceSize>> {
        let state = self.state.borrow();
        (first..first + count)
            .map(|slot| {
                state
                    .queries
                    .get(&(query_pool.0, slot))
                    .copied()
                    .ok_or(AccelError::Vulkan(vk::Result::NOT_READY))
            })
            .collect()
    }

    fn cmd_build_acceleration_structures(
        &self,
        _command_buffer: vk::CommandBuffer,
        build_infos: &[vk::AccelerationStructureBuildGeometryInfoKHRBuilder],
        build_ranges: &[&[vk::AccelerationStructureBuildRangeInfoKHR]],
    ) {
        assert_eq!(build_infos.len(), build_ranges.len());
        let records = build_infos
            .iter()
            .zip(build_ranges)
            .map(|(info, ranges)| BuildRecord {
                mode: info.mode,
                kind: info._type,
                src: info.src_acceleration_structure,
                dst: info.dst_acceleration_structure,
                scratch_address: unsafe { info.scratch_data.device_address },
                primitive_counts: ranges.iter().map(|range| range.primitive_count).collect(),
            })
            .collect::<Vec<_>>();

        let state = self.state.borrow();
        for record in &records {
            assert!(
                state.structures.contains_key(&record.dst.0),
                "build into a missing structure"
            );
        }
        drop(state);
        self.state.borrow_mut().commands.push(Command::Build(records));
    }

    fn cmd_memory_barrier(
        &self,
        _command_buffer: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        src_access: vk::AccessFlags,
        dst_access: vk::AccessFlags,
    ) {
        self.state.borrow_mut().commands.push(Command::Barrier {
            src_stage,
            dst_stage,
            src_access,
            dst_access,
        });
    }

    fn cmd_write_compacted_sizes(
        &self,
        _command_buffer: vk::CommandBuffer,
        acceleration_structures: &[vk::AccelerationStructureKHR],
        query_pool: vk::QueryPool,
        first_query: u32,
    ) {
        let mut state = self.state.borrow_mut();
        let pool_size = state.query_pools[&query_pool.0];
        assert!(first_query as usize + acceleration_structures.len() <= pool_size as usize);
        for (slot, structure) in (first_query..).zip(acceleration_structures) {
            let size = state.structures[&structure.0];
            let compacted = size * state.compaction_percent / 100;
            state.queries.insert((query_pool.0, slot), compacted);
        }
        state.commands.push(Command::WriteCompactedSizes {
            structures: acceleration_structures.to_vec(),
            first_query,
        });
    }

    fn cmd_copy_acceleration_structure(
        &self,
        _command_buffer: vk::CommandBuffer,
        copy_info: &vk::CopyAccelerationStructureInfoKHR,
    ) {
        self.state.borrow_mut().commands.push(Command::Copy {
            src: copy_info.src,
            dst: copy_info.dst,
            mode: copy_info.mode,
        });
    }

    fn single_time_submit<T>(
        &self,
        record: impl FnOnce(CommandBuffer) -> Result<T>,
    ) -> Result<T> {
        let value = record(CommandBuffer::new(vk::CommandBuffer::null()))?;
        self.state.borrow_mut().commands.push(Command::Submit);
        Ok(value)
    }
}
