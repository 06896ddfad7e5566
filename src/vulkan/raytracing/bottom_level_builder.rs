use crate::error::Result;
use crate::vulkan::command_buffer::CommandBuffer;
use crate::vulkan::raytracing::acceleration_structure::AccelerationStructure;
use crate::vulkan::raytracing::geometry_build_descriptor::GeometryBuildDescriptor;
use crate::vulkan::raytracing::RaytracingDevice;
use erupt::vk;
use std::fmt;
use std::ops::Range;
use std::rc::Rc;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CompactionStats {
    pub original_size: u64,
    pub compacted_size: u64,
}

impl CompactionStats {
    pub fn saved(&self) -> u64 {
        self.original_size - self.compacted_size
    }
}

impl fmt::Display for CompactionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fraction = if self.original_size == 0 {
            0.0
        } else {
            self.saved() as f64 / self.original_size as f64 * 100.0
        };
        write!(
            f,
            "BLAS compaction: {} bytes -> {} bytes ({} bytes saved, {:.1}%)",
            self.original_size,
            self.compacted_size,
            self.saved(),
            fraction
        )
    }
}

/// Builds one bottom level acceleration structure per descriptor.
///
/// A builder is driven repeatedly with the same descriptor list until
/// [`cmd_create_parallel_blas`](Self::cmd_create_parallel_blas) returns
/// `true`; the cursors below persist between calls. Structures are pushed
/// onto the caller's vector so that `blas[i]` always belongs to
/// `build_data[i]`.
pub struct BlasBuilder<D: RaytracingDevice> {
    device: Rc<D>,
    query_pool: Option<vk::QueryPool>,
    query_pool_size: u32,
    current_blas: usize,
    current_query: usize,
    non_compacted: Vec<AccelerationStructure>,
    stats: CompactionStats,
}

impl<D: RaytracingDevice> BlasBuilder<D> {
    pub fn new(device: Rc<D>) -> Self {
        BlasBuilder {
            device,
            query_pool: None,
            query_pool_size: 0,
            current_blas: 0,
            current_query: 0,
            non_compacted: Vec::new(),
            stats: CompactionStats::default(),
        }
    }

    pub fn stats(&self) -> CompactionStats {
        self.stats
    }

    /// Number of compacted size queries in the pool, `0` until a descriptor
    /// asks for compaction.
    pub fn query_pool_size(&self) -> u32 {
        self.query_pool_size
    }

    pub fn built_count(&self) -> usize {
        self.current_blas
    }

    /// Serial variant sharing one scratch region between all structures.
    pub fn cmd_create_blas(
        &mut self,
        command_buffer: CommandBuffer,
        build_data: &mut [GeometryBuildDescriptor],
        blas: &mut Vec<AccelerationStructure>,
        scratch_address: vk::DeviceAddress,
        hint_max_budget: u64,
    ) -> Result<bool> {
        self.cmd_create_parallel_blas(
            command_buffer,
            build_data,
            blas,
            &[scratch_address],
            hint_max_budget,
        )
    }

    /// Records builds for as many remaining structures as `hint_max_budget`
    /// bytes of structure storage allow, at least one per call. Each batch
    /// holds up to `scratch_addresses.len()` structures built by a single
    /// command. Returns whether every descriptor has been built.
    ///
    /// On error nothing recorded by this call counts as built: the
    /// structures it created are destroyed and popped from `blas`.
    pub fn cmd_create_parallel_blas(
        &mut self,
        command_buffer: CommandBuffer,
        build_data: &mut [GeometryBuildDescriptor],
        blas: &mut Vec<AccelerationStructure>,
        scratch_addresses: &[vk::DeviceAddress],
        hint_max_budget: u64,
    ) -> Result<bool> {
        puffin::profile_function!();
        assert!(!scratch_addresses.is_empty(), "no scratch address");
        debug_assert_eq!(blas.len(), self.current_blas);

        self.initialize_query_pool_if_needed(build_data)?;

        let call_start = self.current_blas;
        let recorded = self.record_batches(
            command_buffer,
            build_data,
            blas,
            scratch_addresses,
            hint_max_budget,
        );
        if recorded.is_err() {
            for structure in blas.drain(call_start..) {
                structure.destroy(&*self.device);
            }
            self.current_blas = call_start;
        }
        recorded
    }

    fn record_batches(
        &mut self,
        command_buffer: CommandBuffer,
        build_data: &mut [GeometryBuildDescriptor],
        blas: &mut Vec<AccelerationStructure>,
        scratch_addresses: &[vk::DeviceAddress],
        hint_max_budget: u64,
    ) -> Result<bool> {
        let device = Rc::clone(&self.device);
        let mut budget_used = 0;
        loop {
            let first = self.current_blas;
            while self.current_blas < build_data.len()
                && self.current_blas - first < scratch_addresses.len()
                && (budget_used < hint_max_budget || self.current_blas == first)
            {
                let data = &mut build_data[self.current_blas];
                let structure = AccelerationStructure::new(&*device, &data.make_create_info())?;
                data.set_destination(structure.handle());
                budget_used += structure.size();
                blas.push(structure);
                self.current_blas += 1;
            }

            if self.current_blas == first {
                break;
            }

            let batch = &build_data[first..self.current_blas];
            let build_infos = batch
                .iter()
                .enumerate()
                .map(|(offset, data)| {
                    data.build_geometry_info(
                        vk::BuildAccelerationStructureModeKHR::BUILD_KHR,
                        vk::AccelerationStructureKHR::null(),
                        scratch_addresses[(first + offset) % scratch_addresses.len()],
                    )
                })
                .collect::<Vec<_>>();
            let build_ranges = batch
                .iter()
                .map(|data| data.build_ranges())
                .collect::<Vec<_>>();

            command_buffer.build_acceleration_structures(&*device, &build_infos, &build_ranges);
            command_buffer.acceleration_structure_memory_barrier(&*device);

            if let Some(query_pool) = self.query_pool {
                for run in compactable_runs(build_data, first..self.current_blas) {
                    let structures = blas[run.clone()]
                        .iter()
                        .map(|structure| structure.handle())
                        .collect::<Vec<_>>();
                    command_buffer.write_compacted_sizes(
                        &*device,
                        &structures,
                        query_pool,
                        run.start as u32,
                    );
                }
            }

            log::debug!(
                "recorded BLAS batch [{}, {}) of {}, {} bytes used",
                first,
                self.current_blas,
                build_data.len(),
                budget_used
            );

            if self.current_blas >= build_data.len() || budget_used >= hint_max_budget {
                break;
            }
        }

        Ok(self.current_blas >= build_data.len())
    }

    /// Replaces every structure built since the last call with a compacted
    /// copy when the device reports a smaller size. The queries are read
    /// with a blocking wait, so the build batch must have been submitted.
    pub fn cmd_compact_blas(
        &mut self,
        command_buffer: CommandBuffer,
        build_data: &mut [GeometryBuildDescriptor],
        blas: &mut [AccelerationStructure],
    ) -> Result<()> {
        puffin::profile_function!();
        let query_pool = match self.query_pool {
            Some(query_pool) => query_pool,
            None => {
                self.current_query = self.current_blas;
                return Ok(());
            }
        };

        let device = Rc::clone(&self.device);
        for run in compactable_runs(build_data, self.current_query..self.current_blas) {
            let compact_sizes =
                device.compacted_sizes(query_pool, run.start as u32, run.len() as u32)?;

            for (idx, compact_size) in run.zip(compact_sizes) {
                let original_size = blas[idx].size();
                if compact_size == 0 || compact_size >= original_size {
                    log::trace!("BLAS {} not compacted ({} bytes reported)", idx, compact_size);
                    continue;
                }

                let create_info = vk::AccelerationStructureCreateInfoKHRBuilder::new()
                    ._type(build_data[idx].kind())
                    .size(compact_size);
                let compacted = AccelerationStructure::new(&*device, &create_info)?;

                command_buffer.compact_acceleration_structure(
                    &*device,
                    blas[idx].handle(),
                    compacted.handle(),
                );
                build_data[idx].set_destination(compacted.handle());

                self.stats.original_size += original_size;
                self.stats.compacted_size += compact_size;
                self.non_compacted
                    .push(std::mem::replace(&mut blas[idx], compacted));
            }
        }

        self.current_query = self.current_blas;
        Ok(())
    }

    /// Releases the originals replaced by compaction. Only valid once the
    /// compaction copies have completed on the device.
    pub fn destroy_non_compacted_blas(&mut self) {
        for structure in self.non_compacted.drain(..) {
            structure.destroy(&*self.device);
        }
    }

    pub fn destroy(&mut self) {
        self.destroy_non_compacted_blas();
        if let Some(query_pool) = self.query_pool.take() {
            self.device.destroy_query_pool(query_pool);
            self.query_pool_size = 0;
        }
    }

    fn initialize_query_pool_if_needed(
        &mut self,
        build_data: &[GeometryBuildDescriptor],
    ) -> Result<()> {
        if self.query_pool.is_some() || !build_data.iter().any(|data| data.has_compact_flag()) {
            return Ok(());
        }

        let count = build_data.len() as u32;
        let query_pool = self.device.create_query_pool(
            vk::QueryType::ACCELERATION_STRUCTURE_COMPACTED_SIZE_KHR,
            count,
        )?;
        self.device.reset_query_pool(query_pool, 0, count);
        self.query_pool = Some(query_pool);
        self.query_pool_size = count;
        Ok(())
    }
}

/// Splits `range` into runs of consecutive descriptors that allow compaction.
fn compactable_runs(build_data: &[GeometryBuildDescriptor], range: Range<usize>) -> Vec<Range<usize>> {
    let mut runs: Vec<Range<usize>> = Vec::new();
    for idx in range {
        if !build_data[idx].has_compact_flag() {
            continue;
        }
        match runs.last_mut() {
            Some(run) if run.end == idx => run.end += 1,
            _ => runs.push(idx..idx + 1),
        }
    }
    runs
}
