use crate::config::{AnyHitMode, RaytracingConfig};
use crate::error::{AccelError, Result};
use crate::scene::Scene;
use crate::vulkan::raytracing::acceleration_structure::AccelerationStructure;
use crate::vulkan::raytracing::bottom_level_builder::{BlasBuilder, CompactionStats};
use crate::vulkan::raytracing::geometry_build_descriptor::GeometryBuildDescriptor;
use crate::vulkan::raytracing::scratch::{self, ScratchBuffer};
use crate::vulkan::raytracing::top_level_builder::{InstanceRecord, TlasBuilder};
use crate::vulkan::raytracing::RaytracingDevice;
use erupt::vk;
use rayon::prelude::*;
use std::rc::Rc;

/// Owns the acceleration structures of the loaded scene.
///
/// BLAS are built once per [`load_scene`](Self::load_scene) and stay
/// immutable until the next load; the TLAS follows the instance list
/// through [`update_instances`](Self::update_instances).
pub struct RaytracingCoordinator<D: RaytracingDevice> {
    device: Rc<D>,
    config: RaytracingConfig,
    blas_builder: BlasBuilder<D>,
    tlas_builder: TlasBuilder<D>,
    blas: Vec<AccelerationStructure>,
    instance_records: Vec<InstanceRecord>,
    scene_loaded: bool,
}

impl<D: RaytracingDevice> RaytracingCoordinator<D> {
    pub fn new(device: Rc<D>, config: RaytracingConfig) -> Self {
        RaytracingCoordinator {
            blas_builder: BlasBuilder::new(Rc::clone(&device)),
            tlas_builder: TlasBuilder::new(Rc::clone(&device), config.default_scratch_alignment),
            device,
            config,
            blas: Vec::new(),
            instance_records: Vec::new(),
            scene_loaded: false,
        }
    }

    pub fn config(&self) -> &RaytracingConfig {
        &self.config
    }

    fn geometry_flags(&self) -> vk::GeometryFlagsKHR {
        match self.config.any_hit_mode {
            AnyHitMode::Opaque => vk::GeometryFlagsKHR::OPAQUE_KHR,
            AnyHitMode::NoDuplicateAnyHit => {
                vk::GeometryFlagsKHR::NO_DUPLICATE_ANY_HIT_INVOCATION_KHR
            }
        }
    }

    fn blas_flags(&self) -> vk::BuildAccelerationStructureFlagsKHR {
        let mut flags = vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE_KHR;
        if self.config.compact_blas {
            flags |= vk::BuildAccelerationStructureFlagsKHR::ALLOW_COMPACTION_KHR;
        }
        flags
    }

    fn tlas_flags(&self) -> vk::BuildAccelerationStructureFlagsKHR {
        let mut flags = vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE_KHR;
        if self.config.tlas_allow_update {
            flags |= vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE_KHR;
        }
        flags
    }

    /// Builds one BLAS per mesh of `scene`, compacting them when enabled,
    /// then builds the TLAS for the scene's instances. Anything from a
    /// previously loaded scene is released first. A failed load leaves the
    /// coordinator empty.
    pub fn load_scene(&mut self, scene: &Scene) -> Result<()> {
        puffin::profile_function!();
        self.release_scene();

        let loaded = self.build_scene(scene);
        if let Err(err) = &loaded {
            log::error!("scene load failed: {}", err);
            self.release_scene();
        }
        loaded
    }

    fn build_scene(&mut self, scene: &Scene) -> Result<()> {
        let device = Rc::clone(&self.device);
        let geometry_flags = self.geometry_flags();
        let blas_flags = self.blas_flags();
        let mut build_data = scene
            .meshes()
            .iter()
            .map(|mesh| {
                let mut data =
                    GeometryBuildDescriptor::new(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL_KHR);
                data.add_triangles(mesh, geometry_flags);
                data.finalize_geometry(&*device, blas_flags);
                data
            })
            .collect::<Vec<_>>();

        if !build_data.is_empty() {
            self.build_blas(&mut build_data)?;
        }
        log::info!("built {} BLAS", self.blas.len());
        if self.config.compact_blas {
            log::info!("{}", self.blas_builder.stats());
        }

        self.scene_loaded = true;
        self.update_instances(scene)?;
        Ok(())
    }

    fn build_blas(&mut self, build_data: &mut [GeometryBuildDescriptor]) -> Result<()> {
        puffin::profile_scope!("build_blas");
        let device = Rc::clone(&self.device);
        let budget = self.config.blas_budget_bytes;
        let alignment = scratch::effective_alignment(
            device.min_scratch_alignment(),
            self.config.default_scratch_alignment,
        );

        let scratch_size = scratch::scratch_size(budget, build_data, alignment);
        let scratch = ScratchBuffer::new(&*device, scratch_size, alignment)?;
        let scratch_addresses = scratch.addresses(budget, build_data, alignment);
        log::debug!(
            "BLAS scratch: {} bytes in {} regions",
            scratch_size,
            scratch_addresses.len()
        );

        let built = self.build_blas_batches(build_data, &scratch_addresses, budget);
        scratch.destroy(&*device);
        built
    }

    fn build_blas_batches(
        &mut self,
        build_data: &mut [GeometryBuildDescriptor],
        scratch_addresses: &[vk::DeviceAddress],
        budget: u64,
    ) -> Result<()> {
        let device = Rc::clone(&self.device);
        let compact = self.config.compact_blas;
        let builder = &mut self.blas_builder;
        let blas = &mut self.blas;

        loop {
            let finished = device.single_time_submit(|command_buffer| {
                builder.cmd_create_parallel_blas(
                    command_buffer,
                    build_data,
                    blas,
                    scratch_addresses,
                    budget,
                )
            })?;

            if compact {
                device.single_time_submit(|command_buffer| {
                    builder.cmd_compact_blas(command_buffer, build_data, blas)
                })?;
                builder.destroy_non_compacted_blas();
            }

            if finished {
                return Ok(());
            }
        }
    }

    /// Flattens the scene's instances into TLAS records and rebuilds or
    /// refits the TLAS. Instances are grouped by material workflow, keeping
    /// insertion order within a workflow; the custom index is the instance's
    /// position in the scene and the SBT offset its workflow's hit group.
    ///
    /// Returns `false` when the records are unchanged and nothing was
    /// submitted, and [`AccelError::SceneNotLoaded`] before a successful
    /// [`load_scene`](Self::load_scene).
    pub fn update_instances(&mut self, scene: &Scene) -> Result<bool> {
        puffin::profile_function!();
        if !self.scene_loaded {
            return Err(AccelError::SceneNotLoaded);
        }
        let records = self.flatten_instances(scene);

        let has_tlas = self.tlas_builder.acceleration_structure().is_some();
        if has_tlas && records == self.instance_records {
            return Ok(false);
        }

        let is_update = has_tlas
            && self
                .tlas_builder
                .flags()
                .contains(vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE_KHR)
            && records.len() == self.instance_records.len()
            && records
                .iter()
                .zip(&self.instance_records)
                .all(|(new, old)| new.blas_reference == old.blas_reference);

        let flags = if is_update {
            self.tlas_builder.flags()
        } else {
            self.tlas_flags()
        };
        self.tlas_builder.build_tlas(&records, flags, is_update)?;
        self.instance_records = records;
        Ok(true)
    }

    fn flatten_instances(&self, scene: &Scene) -> Vec<InstanceRecord> {
        let instances = scene.instances();
        let blas_addresses = self
            .blas
            .iter()
            .map(AccelerationStructure::device_address)
            .collect::<Vec<_>>();

        let mut order = (0..instances.len()).collect::<Vec<_>>();
        order.sort_by_key(|&idx| instances[idx].workflow);

        order
            .par_iter()
            .map(|&idx| {
                let instance = &instances[idx];
                assert!(
                    instance.mesh_id < blas_addresses.len(),
                    "instance {} references mesh {} without a BLAS",
                    idx,
                    instance.mesh_id
                );
                InstanceRecord::new(
                    &instance.transform,
                    idx as u32,
                    0xFF,
                    instance.workflow.hit_group_offset(),
                    vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE_KHR,
                    blas_addresses[instance.mesh_id],
                )
            })
            .collect()
    }

    pub fn tlas(&self) -> Option<vk::AccelerationStructureKHR> {
        self.tlas_builder
            .acceleration_structure()
            .map(AccelerationStructure::handle)
    }

    pub fn blas(&self) -> &[AccelerationStructure] {
        &self.blas
    }

    pub fn blas_device_address(&self, mesh_id: usize) -> vk::DeviceAddress {
        self.blas[mesh_id].device_address()
    }

    pub fn stats(&self) -> CompactionStats {
        self.blas_builder.stats()
    }

    fn release_scene(&mut self) {
        self.tlas_builder.destroy();
        for structure in self.blas.drain(..) {
            structure.destroy(&*self.device);
        }
        self.blas_builder.destroy();
        self.blas_builder = BlasBuilder::new(Rc::clone(&self.device));
        self.instance_records.clear();
        self.scene_loaded = false;
    }

    pub fn destroy(&mut self) {
        self.release_scene();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{MaterialWorkflow, MeshGeometry, SceneInstance};
    use crate::vulkan::raytracing::fake_device::{Command, FakeDevice};
    use glam::{Mat4, Vec3};

    fn mesh(triangles: u32) -> MeshGeometry {
        MeshGeometry {
            vertex_address: 0x1000,
            index_address: 0x2000,
            vertex_count: triangles * 3,
            index_count: triangles * 3,
            vertex_stride: 12,
        }
    }

    fn scene() -> Scene {
        let mut scene = Scene::new();
        let cube = scene.add_mesh(mesh(12));
        let plane = scene.add_mesh(mesh(2));
        scene.add_instance(SceneInstance::new(
            Mat4::IDENTITY,
            plane,
            MaterialWorkflow::Lambertian,
        ));
        scene.add_instance(SceneInstance::new(
            Mat4::from_translation(Vec3::new(1.0, 2.0, 3.0)),
            cube,
            MaterialWorkflow::Pbr,
        ));
        scene.add_instance(SceneInstance::new(
            Mat4::from_translation(Vec3::X),
            cube,
            MaterialWorkflow::Lambertian,
        ));
        scene
    }

    #[test]
    fn load_builds_blas_and_tlas() {
        let device = Rc::new(FakeDevice::new());
        let mut coordinator = RaytracingCoordinator::new(Rc::clone(&device), RaytracingConfig::default());

        coordinator.load_scene(&scene()).unwrap();

        assert_eq!(coordinator.blas().len(), 2);
        assert!(coordinator.tlas().is_some());
        // BLAS build, compaction, TLAS build
        assert_eq!(device.submit_count(), 3);
        assert!(coordinator.stats().compacted_size < coordinator.stats().original_size);

        coordinator.destroy();
        assert_eq!(device.live_structures(), 0);
        assert_eq!(device.live_buffers(), 0);
        assert_eq!(device.live_query_pools(), 0);
    }

    #[test]
    fn records_are_grouped_by_workflow() {
        let device = Rc::new(FakeDevice::new());
        let mut coordinator = RaytracingCoordinator::new(Rc::clone(&device), RaytracingConfig::default());
        let scene = scene();
        coordinator.load_scene(&scene).unwrap();

        let records = &coordinator.instance_records;
        let custom_indices = records.iter().map(InstanceRecord::custom_index).collect::<Vec<_>>();
        assert_eq!(custom_indices, vec![1, 0, 2]);
        let offsets = records.iter().map(InstanceRecord::sbt_offset).collect::<Vec<_>>();
        assert_eq!(offsets, vec![0, 1, 1]);
        assert_eq!(records[0].blas_reference, coordinator.blas_device_address(0));
        assert_eq!(records[1].blas_reference, coordinator.blas_device_address(1));
        assert_eq!(records[0].transform[0][3], 1.0);
        assert_eq!(records[0].transform[2][3], 3.0);

        coordinator.destroy();
    }

    #[test]
    fn moved_instances_are_refit() {
        let device = Rc::new(FakeDevice::new());
        let mut coordinator = RaytracingCoordinator::new(Rc::clone(&device), RaytracingConfig::default());
        let mut scene = scene();
        coordinator.load_scene(&scene).unwrap();
        let tlas = coordinator.tlas();
        device.clear_commands();

        assert!(!coordinator.update_instances(&scene).unwrap());
        assert!(device.commands().is_empty());

        scene.instances_mut()[0].transform = Mat4::from_translation(Vec3::Y);
        assert!(coordinator.update_instances(&scene).unwrap());

        let builds = device.builds();
        assert_eq!(builds.len(), 1);
        assert_eq!(builds[0][0].mode, vk::BuildAccelerationStructureModeKHR::UPDATE_KHR);
        assert_eq!(coordinator.tlas(), tlas);

        coordinator.destroy();
    }

    #[test]
    fn added_instances_force_a_rebuild() {
        let device = Rc::new(FakeDevice::new());
        let mut coordinator = RaytracingCoordinator::new(Rc::clone(&device), RaytracingConfig::default());
        let mut scene = scene();
        coordinator.load_scene(&scene).unwrap();
        device.clear_commands();

        scene.add_instance(SceneInstance::new(Mat4::IDENTITY, 0, MaterialWorkflow::Pbr));
        coordinator.update_instances(&scene).unwrap();

        let builds = device.builds();
        assert_eq!(builds[0][0].mode, vk::BuildAccelerationStructureModeKHR::BUILD_KHR);
        assert_eq!(builds[0][0].primitive_counts, vec![4]);

        coordinator.destroy();
        assert_eq!(device.live_structures(), 0);
    }

    #[test]
    fn refit_disabled_always_rebuilds() {
        let device = Rc::new(FakeDevice::new());
        let config = RaytracingConfig {
            tlas_allow_update: false,
            ..Default::default()
        };
        let mut coordinator = RaytracingCoordinator::new(Rc::clone(&device), config);
        let mut scene = scene();
        coordinator.load_scene(&scene).unwrap();
        device.clear_commands();

        scene.instances_mut()[1].transform = Mat4::IDENTITY;
        coordinator.update_instances(&scene).unwrap();

        assert_eq!(
            device.builds()[0][0].mode,
            vk::BuildAccelerationStructureModeKHR::BUILD_KHR
        );
        coordinator.destroy();
    }

    #[test]
    fn tight_budget_loops_until_complete() {
        let device = Rc::new(FakeDevice::new());
        let config = RaytracingConfig {
            blas_budget_bytes: 1,
            ..Default::default()
        };
        let mut coordinator = RaytracingCoordinator::new(Rc::clone(&device), config);
        let mut scene = Scene::new();
        for triangles in [10, 20, 30, 40] {
            scene.add_mesh(mesh(triangles));
        }

        coordinator.load_scene(&scene).unwrap();

        assert_eq!(coordinator.blas().len(), 4);
        // one build and one compaction submit per structure, then the TLAS
        assert_eq!(device.submit_count(), 9);
        let write_queries = device
            .commands()
            .into_iter()
            .filter(|command| matches!(command, Command::WriteCompactedSizes { .. }))
            .count();
        assert_eq!(write_queries, 4);
        let stats = coordinator.stats();
        assert_eq!(stats.original_size, 768 + 1280 + 1920 + 2560);
        assert_eq!(stats.compacted_size, stats.original_size / 2);
        assert_eq!(device.live_structures(), 5);

        coordinator.destroy();
        assert_eq!(device.live_buffers(), 0);
    }

    #[test]
    fn failed_load_leaves_nothing_to_trace() {
        let device = Rc::new(FakeDevice::new());
        device.fail_structure_creation_above(10_000);
        let mut coordinator = RaytracingCoordinator::new(Rc::clone(&device), RaytracingConfig::default());
        let mut scene = Scene::new();
        let small = scene.add_mesh(mesh(10));
        let large = scene.add_mesh(mesh(1000));
        scene.add_instance(SceneInstance::new(Mat4::IDENTITY, small, MaterialWorkflow::Pbr));
        scene.add_instance(SceneInstance::new(Mat4::IDENTITY, large, MaterialWorkflow::Pbr));

        assert!(coordinator.load_scene(&scene).is_err());

        assert!(coordinator.blas().is_empty());
        assert!(coordinator.tlas().is_none());
        assert!(device.builds().is_empty());
        assert_eq!(device.live_structures(), 0);
        assert_eq!(device.live_buffers(), 0);
        assert_eq!(device.live_query_pools(), 0);
        assert!(matches!(
            coordinator.update_instances(&scene),
            Err(AccelError::SceneNotLoaded)
        ));
        assert!(coordinator.tlas().is_none());

        device.fail_structure_creation_above(u64::MAX);
        coordinator.load_scene(&scene).unwrap();
        assert_eq!(coordinator.blas().len(), 2);
        assert!(coordinator.tlas().is_some());

        coordinator.destroy();
        assert_eq!(device.live_structures(), 0);
    }

    #[test]
    fn without_compaction_no_queries_are_made() {
        let device = Rc::new(FakeDevice::new());
        let config = RaytracingConfig {
            compact_blas: false,
            any_hit_mode: AnyHitMode::NoDuplicateAnyHit,
            ..Default::default()
        };
        let mut coordinator = RaytracingCoordinator::new(Rc::clone(&device), config);

        coordinator.load_scene(&scene()).unwrap();

        assert_eq!(device.live_query_pools(), 0);
        assert_eq!(device.submit_count(), 2);
        assert_eq!(coordinator.stats(), CompactionStats::default());
        coordinator.destroy();
    }

    #[test]
    fn reloading_releases_the_previous_scene() {
        let device = Rc::new(FakeDevice::new());
        let mut coordinator = RaytracingCoordinator::new(Rc::clone(&device), RaytracingConfig::default());
        coordinator.load_scene(&scene()).unwrap();
        coordinator.load_scene(&scene()).unwrap();

        // two BLAS, their buffers, the TLAS, its buffer and the instance buffer
        assert_eq!(device.live_structures(), 3);
        assert_eq!(device.live_buffers(), 4);

        coordinator.destroy();
        assert_eq!(device.live_structures(), 0);
    }
}
