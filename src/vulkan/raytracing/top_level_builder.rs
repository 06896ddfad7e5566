use crate::error::Result;
use crate::vulkan::buffer::Buffer;
use crate::vulkan::raytracing::acceleration_structure::AccelerationStructure;
use crate::vulkan::raytracing::geometry_build_descriptor::GeometryBuildDescriptor;
use crate::vulkan::raytracing::scratch::{effective_alignment, ScratchBuffer};
use crate::vulkan::raytracing::RaytracingDevice;
use bytemuck::{Pod, Zeroable};
use erupt::vk;
use glam::Mat4;
use std::mem::size_of;
use std::rc::Rc;

const LOW_24_BITS: u32 = 0x00FF_FFFF;

/// Device layout of `VkAccelerationStructureInstanceKHR`.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct InstanceRecord {
    pub transform: [[f32; 4]; 3],
    custom_index_and_mask: u32,
    sbt_offset_and_flags: u32,
    pub blas_reference: vk::DeviceAddress,
}

impl InstanceRecord {
    /// `transform` is column major; the record stores the top three rows.
    pub fn new(
        transform: &Mat4,
        custom_index: u32,
        mask: u8,
        sbt_offset: u32,
        flags: vk::GeometryInstanceFlagsKHR,
        blas_reference: vk::DeviceAddress,
    ) -> Self {
        assert!(custom_index <= LOW_24_BITS, "custom index exceeds 24 bits");
        assert!(sbt_offset <= LOW_24_BITS, "sbt offset exceeds 24 bits");
        InstanceRecord {
            transform: [
                transform.row(0).to_array(),
                transform.row(1).to_array(),
                transform.row(2).to_array(),
            ],
            custom_index_and_mask: custom_index | (mask as u32) << 24,
            sbt_offset_and_flags: sbt_offset | (flags.bits() & 0xFF) << 24,
            blas_reference,
        }
    }

    pub fn custom_index(&self) -> u32 {
        self.custom_index_and_mask & LOW_24_BITS
    }

    pub fn mask(&self) -> u8 {
        (self.custom_index_and_mask >> 24) as u8
    }

    pub fn sbt_offset(&self) -> u32 {
        self.sbt_offset_and_flags & LOW_24_BITS
    }

    pub fn flags(&self) -> vk::GeometryInstanceFlagsKHR {
        vk::GeometryInstanceFlagsKHR::from_bits_truncate(self.sbt_offset_and_flags >> 24)
    }
}

/// Builds and refits the scene's single top level acceleration structure.
pub struct TlasBuilder<D: RaytracingDevice> {
    device: Rc<D>,
    tlas: Option<AccelerationStructure>,
    instance_buffer: Option<Buffer>,
    instance_count: u32,
    flags: vk::BuildAccelerationStructureFlagsKHR,
    fallback_scratch_alignment: u64,
}

impl<D: RaytracingDevice> TlasBuilder<D> {
    pub fn new(device: Rc<D>, fallback_scratch_alignment: u64) -> Self {
        TlasBuilder {
            device,
            tlas: None,
            instance_buffer: None,
            instance_count: 0,
            flags: vk::BuildAccelerationStructureFlagsKHR::empty(),
            fallback_scratch_alignment,
        }
    }

    pub fn acceleration_structure(&self) -> Option<&AccelerationStructure> {
        self.tlas.as_ref()
    }

    pub fn instance_count(&self) -> u32 {
        self.instance_count
    }

    pub fn flags(&self) -> vk::BuildAccelerationStructureFlagsKHR {
        self.flags
    }

    /// Uploads `instances` and builds the TLAS, or refits the existing one
    /// in place when `is_update` is set. A refit requires a previous build
    /// with `ALLOW_UPDATE` and the same instance count.
    ///
    /// Submits and waits; the caller still needs an acceleration structure
    /// read barrier before tracing against the result.
    pub fn build_tlas(
        &mut self,
        instances: &[InstanceRecord],
        flags: vk::BuildAccelerationStructureFlagsKHR,
        is_update: bool,
    ) -> Result<()> {
        puffin::profile_function!();
        let instance_count = instances.len() as u32;
        if is_update {
            assert!(self.tlas.is_some(), "TLAS update before build");
            assert_eq!(
                instance_count, self.instance_count,
                "TLAS update cannot change the instance count"
            );
            assert!(
                self.flags
                    .contains(vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE_KHR),
                "TLAS update without ALLOW_UPDATE"
            );
            assert_eq!(
                flags, self.flags,
                "TLAS update cannot change the build flags"
            );
        }

        let device = Rc::clone(&self.device);
        let instance_address = self.upload_instances(instances)?;

        let mut build_data =
            GeometryBuildDescriptor::new(vk::AccelerationStructureTypeKHR::TOP_LEVEL_KHR);
        build_data.make_instance_geometry(instance_count, instance_address);
        let size_info = build_data.finalize_geometry(&*device, flags);

        if !is_update {
            if let Some(old) = self.tlas.take() {
                old.destroy(&*device);
            }
            self.tlas = Some(AccelerationStructure::new(
                &*device,
                &build_data.make_create_info(),
            )?);
            self.flags = flags;
            self.instance_count = instance_count;
        }
        let target = match &self.tlas {
            Some(tlas) => tlas.handle(),
            None => unreachable!("TLAS created above"),
        };

        let scratch_size = if is_update {
            size_info.update_scratch_size
        } else {
            size_info.build_scratch_size
        };
        let alignment =
            effective_alignment(device.min_scratch_alignment(), self.fallback_scratch_alignment);
        let scratch = ScratchBuffer::new(&*device, scratch_size, alignment)?;
        let scratch_address = scratch.device_address();

        let submitted = device.single_time_submit(|command_buffer| {
            command_buffer.build_input_barrier(&*device);
            if is_update {
                build_data.cmd_update_acceleration_structure(
                    &*device,
                    command_buffer,
                    target,
                    scratch_address,
                );
            } else {
                build_data.cmd_build_acceleration_structure(
                    &*device,
                    command_buffer,
                    target,
                    scratch_address,
                );
            }
            Ok(())
        });
        scratch.destroy(&*device);
        submitted?;

        log::trace!(
            "{} TLAS with {} instances",
            if is_update { "refit" } else { "built" },
            instance_count
        );
        Ok(())
    }

    pub fn destroy(&mut self) {
        if let Some(tlas) = self.tlas.take() {
            tlas.destroy(&*self.device);
        }
        if let Some(buffer) = self.instance_buffer.take() {
            self.device.destroy_buffer(buffer);
        }
        self.instance_count = 0;
    }

    /// Copies `instances` into a host visible buffer, growing it when needed.
    fn upload_instances(&mut self, instances: &[InstanceRecord]) -> Result<vk::DeviceAddress> {
        let required = (instances.len().max(1) * size_of::<InstanceRecord>()) as u64;
        let mut buffer = match self.instance_buffer.take() {
            Some(buffer) if buffer.size() >= required => buffer,
            stale => {
                if let Some(buffer) = stale {
                    self.device.destroy_buffer(buffer);
                }
                self.device.create_buffer(
                    required,
                    vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
                        | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                    gpu_alloc::UsageFlags::HOST_ACCESS
                        | gpu_alloc::UsageFlags::UPLOAD
                        | gpu_alloc::UsageFlags::DEVICE_ADDRESS,
                )?
            }
        };

        let written = self
            .device
            .write_buffer(&mut buffer, bytemuck::cast_slice(instances));
        let address = buffer.get_device_address();
        self.instance_buffer = Some(buffer);
        written.map(|_| address)
    }
}
