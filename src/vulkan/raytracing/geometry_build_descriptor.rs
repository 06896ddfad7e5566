use crate::scene::MeshGeometry;
use crate::vulkan::command_buffer::CommandBuffer;
use crate::vulkan::raytracing::acceleration_structure::round_up;
use crate::vulkan::raytracing::RaytracingDevice;
use erupt::vk;

const ACCELERATION_STRUCTURE_ALIGNMENT: u64 = 256;

/// Geometry of one acceleration structure plus the sizes the device needs
/// to build it.
///
/// Geometry entries and build ranges are kept in two parallel vectors that
/// always have the same length. Sizes are queried once by
/// [`finalize_geometry`](Self::finalize_geometry); after that the
/// descriptor only changes its destination structure.
pub struct GeometryBuildDescriptor {
    kind: vk::AccelerationStructureTypeKHR,
    geometry: Vec<vk::AccelerationStructureGeometryKHRBuilder<'static>>,
    build_ranges: Vec<vk::AccelerationStructureBuildRangeInfoKHR>,
    flags: vk::BuildAccelerationStructureFlagsKHR,
    size_info: Option<vk::AccelerationStructureBuildSizesInfoKHR>,
    destination: vk::AccelerationStructureKHR,
}

impl GeometryBuildDescriptor {
    pub fn new(kind: vk::AccelerationStructureTypeKHR) -> Self {
        GeometryBuildDescriptor {
            kind,
            geometry: Vec::new(),
            build_ranges: Vec::new(),
            flags: vk::BuildAccelerationStructureFlagsKHR::empty(),
            size_info: None,
            destination: vk::AccelerationStructureKHR::null(),
        }
    }

    pub fn kind(&self) -> vk::AccelerationStructureTypeKHR {
        self.kind
    }

    pub fn geometry(&self) -> &[vk::AccelerationStructureGeometryKHRBuilder<'static>] {
        &self.geometry
    }

    pub fn build_ranges(&self) -> &[vk::AccelerationStructureBuildRangeInfoKHR] {
        &self.build_ranges
    }

    pub fn flags(&self) -> vk::BuildAccelerationStructureFlagsKHR {
        self.flags
    }

    pub fn size_info(&self) -> Option<&vk::AccelerationStructureBuildSizesInfoKHR> {
        self.size_info.as_ref()
    }

    pub fn is_finalized(&self) -> bool {
        self.size_info.is_some()
    }

    pub fn destination(&self) -> vk::AccelerationStructureKHR {
        self.destination
    }

    pub fn set_destination(&mut self, destination: vk::AccelerationStructureKHR) {
        self.destination = destination;
    }

    pub fn has_compact_flag(&self) -> bool {
        self.flags
            .contains(vk::BuildAccelerationStructureFlagsKHR::ALLOW_COMPACTION_KHR)
    }

    pub fn add_geometry(
        &mut self,
        geometry: vk::AccelerationStructureGeometryKHRBuilder<'static>,
        build_range: vk::AccelerationStructureBuildRangeInfoKHR,
    ) {
        assert!(!self.is_finalized(), "geometry added after finalize");
        self.geometry.push(geometry);
        self.build_ranges.push(build_range);
    }

    /// Appends an indexed triangle list with `R32G32B32_SFLOAT` positions
    /// and 32-bit indices.
    pub fn add_triangles(&mut self, mesh: &MeshGeometry, flags: vk::GeometryFlagsKHR) {
        let triangles = vk::AccelerationStructureGeometryDataKHR {
            triangles: *vk::AccelerationStructureGeometryTrianglesDataKHRBuilder::new()
                .vertex_format(vk::Format::R32G32B32_SFLOAT)
                .vertex_data(vk::DeviceOrHostAddressConstKHR {
                    device_address: mesh.vertex_address,
                })
                .vertex_stride(mesh.vertex_stride)
                .max_vertex(mesh.vertex_count.saturating_sub(1))
                .index_type(vk::IndexType::UINT32)
                .index_data(vk::DeviceOrHostAddressConstKHR {
                    device_address: mesh.index_address,
                }),
        };

        let geometry = vk::AccelerationStructureGeometryKHRBuilder::new()
            .geometry_type(vk::GeometryTypeKHR::TRIANGLES_KHR)
            .geometry(triangles)
            .flags(flags);

        let build_range = vk::AccelerationStructureBuildRangeInfoKHRBuilder::new()
            .first_vertex(0)
            .primitive_offset(0)
            .primitive_count(mesh.primitive_count())
            .transform_offset(0);

        self.add_geometry(geometry, *build_range);
    }

    /// Single instances geometry reading `instance_count` tightly packed
    /// instance records from `instance_address`.
    pub fn make_instance_geometry(
        &mut self,
        instance_count: u32,
        instance_address: vk::DeviceAddress,
    ) {
        assert_eq!(
            self.kind,
            vk::AccelerationStructureTypeKHR::TOP_LEVEL_KHR,
            "instance geometry on a bottom level descriptor"
        );

        let instances = vk::AccelerationStructureGeometryInstancesDataKHRBuilder::new()
            .array_of_pointers(false)
            .data(vk::DeviceOrHostAddressConstKHR {
                device_address: instance_address,
            });

        let geometry = vk::AccelerationStructureGeometryKHRBuilder::new()
            .geometry_type(vk::GeometryTypeKHR::INSTANCES_KHR)
            .geometry(vk::AccelerationStructureGeometryDataKHR {
                instances: *instances,
            });

        let build_range = vk::AccelerationStructureBuildRangeInfoKHRBuilder::new()
            .primitive_count(instance_count)
            .build();

        self.add_geometry(geometry, build_range);
    }

    /// Queries structure and scratch sizes for the current geometry. The
    /// structure size is padded to 256 bytes so structures can share a
    /// buffer.
    pub fn finalize_geometry(
        &mut self,
        device: &impl RaytracingDevice,
        flags: vk::BuildAccelerationStructureFlagsKHR,
    ) -> vk::AccelerationStructureBuildSizesInfoKHR {
        assert!(!self.geometry.is_empty(), "finalize on empty geometry");
        assert!(!self.is_finalized(), "geometry finalized twice");

        self.flags = flags;
        let build_info = self.build_geometry_info(
            vk::BuildAccelerationStructureModeKHR::BUILD_KHR,
            vk::AccelerationStructureKHR::null(),
            0,
        );
        let max_primitive_counts = self
            .build_ranges
            .iter()
            .map(|range| range.primitive_count)
            .collect::<Vec<_>>();

        let mut size_info = device.build_sizes(&build_info, &max_primitive_counts);
        size_info.acceleration_structure_size = round_up(
            size_info.acceleration_structure_size,
            ACCELERATION_STRUCTURE_ALIGNMENT,
        );

        self.size_info = Some(size_info);
        size_info
    }

    pub fn make_create_info(&self) -> vk::AccelerationStructureCreateInfoKHRBuilder<'static> {
        let size = match &self.size_info {
            Some(size_info) => size_info.acceleration_structure_size,
            None => panic!("create info requested before finalize"),
        };
        vk::AccelerationStructureCreateInfoKHRBuilder::new()
            ._type(self.kind)
            .size(size)
    }

    /// Build info targeting the current destination.
    pub fn build_geometry_info(
        &self,
        mode: vk::BuildAccelerationStructureModeKHR,
        src: vk::AccelerationStructureKHR,
        scratch_address: vk::DeviceAddress,
    ) -> vk::AccelerationStructureBuildGeometryInfoKHRBuilder<'_> {
        vk::AccelerationStructureBuildGeometryInfoKHRBuilder::new()
            ._type(self.kind)
            .flags(self.flags)
            .mode(mode)
            .geometries(&self.geometry)
            .src_acceleration_structure(src)
            .dst_acceleration_structure(self.destination)
            .scratch_data(vk::DeviceOrHostAddressKHR {
                device_address: scratch_address,
            })
    }

    /// Records a full build into `target`, followed by a barrier so the next
    /// build can reuse the same scratch memory.
    pub fn cmd_build_acceleration_structure(
        &mut self,
        device: &impl RaytracingDevice,
        command_buffer: CommandBuffer,
        target: vk::AccelerationStructureKHR,
        scratch_address: vk::DeviceAddress,
    ) {
        assert!(self.is_finalized(), "build recorded before finalize");
        self.destination = target;
        let build_info = self.build_geometry_info(
            vk::BuildAccelerationStructureModeKHR::BUILD_KHR,
            vk::AccelerationStructureKHR::null(),
            scratch_address,
        );
        command_buffer.build_acceleration_structures(device, &[build_info], &[self.build_ranges.as_slice()]);
        command_buffer.acceleration_structure_full_barrier(device);
    }

    /// In-place refit of `target`.
    pub fn cmd_update_acceleration_structure(
        &mut self,
        device: &impl RaytracingDevice,
        command_buffer: CommandBuffer,
        target: vk::AccelerationStructureKHR,
        scratch_address: vk::DeviceAddress,
    ) {
        assert!(self.is_finalized(), "update recorded before finalize");
        self.destination = target;
        let build_info = self.build_geometry_info(
            vk::BuildAccelerationStructureModeKHR::UPDATE_KHR,
            target,
            scratch_address,
        );
        command_buffer.build_acceleration_structures(device, &[build_info], &[self.build_ranges.as_slice()]);
        command_buffer.acceleration_structure_full_barrier(device);
    }
}
