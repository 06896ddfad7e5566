use erupt::{vk, ExtendableFrom, InstanceLoader};

#[derive(Copy, Clone)]
pub struct RaytracingProperties {
    acceleration_properties: vk::PhysicalDeviceAccelerationStructurePropertiesKHR,
    pipeline_properties: vk::PhysicalDeviceRayTracingPipelinePropertiesKHR,
}

impl RaytracingProperties {
    pub fn new(instance: &InstanceLoader, physical_device: vk::PhysicalDevice) -> Self {
        let mut acceleration_properties =
            vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
        let mut pipeline_properties = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
        let mut properties = vk::PhysicalDeviceProperties2Builder::new()
            .extend_from(&mut acceleration_properties)
            .extend_from(&mut pipeline_properties);

        *properties = unsafe {
            instance.get_physical_device_properties2(physical_device, Some(*properties))
        };

        RaytracingProperties {
            acceleration_properties,
            pipeline_properties,
        }
    }

    pub fn min_acceleration_structure_scratch_offset_alignment(&self) -> u32 {
        self.acceleration_properties
            .min_acceleration_structure_scratch_offset_alignment
    }

    pub fn max_instance_count(&self) -> u64 {
        self.acceleration_properties.max_instance_count
    }

    pub fn max_primitive_count(&self) -> u64 {
        self.acceleration_properties.max_primitive_count
    }

    pub fn shader_group_handle_size(&self) -> u32 {
        self.pipeline_properties.shader_group_handle_size
    }
}
