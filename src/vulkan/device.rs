use crate::error::{AccelError, Result};
use crate::vulkan::buffer::Buffer;
use crate::vulkan::command_buffer::CommandBuffer;
use crate::vulkan::raytracing::raytracing_properties::RaytracingProperties;
use crate::vulkan::raytracing::RaytracingDevice;
use erupt::{cstr, vk, DeviceLoader, EntryLoader, ExtendableFrom, InstanceLoader};
use gpu_alloc::GpuAllocator;
use gpu_alloc_erupt::EruptMemoryDevice;
use parking_lot::Mutex;
use std::ffi::{c_void, CStr, CString};
use std::mem::size_of;
use std::os::raw::c_char;

pub const VALIDATION_LAYER: *const c_char = cstr!("VK_LAYER_KHRONOS_validation");

const REQUIRED_DEVICE_EXTENSIONS: [*const c_char; 3] = [
    vk::KHR_ACCELERATION_STRUCTURE_EXTENSION_NAME,
    vk::KHR_RAY_TRACING_PIPELINE_EXTENSION_NAME,
    vk::KHR_DEFERRED_HOST_OPERATIONS_EXTENSION_NAME,
];

/// Headless logical device with the acceleration structure and ray tracing
/// pipeline extensions enabled.
pub struct Device {
    handle: DeviceLoader,
    allocator: Mutex<GpuAllocator<vk::DeviceMemory>>,
    instance: InstanceLoader,
    _entry: EntryLoader,
    raytracing_properties: RaytracingProperties,
    graphics_queue: vk::Queue,
    command_pool: vk::CommandPool,
}

impl Device {
    pub fn new() -> Result<Self> {
        let entry = EntryLoader::new().map_err(|e| AccelError::Loader(e.to_string()))?;
        let instance = create_instance(&entry)?;
        let physical_device = pick_physical_device(&instance)?;

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let device_name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) };
        log::info!("Using physical device {:?}", device_name);

        let queue_family_properties =
            unsafe { instance.get_physical_device_queue_family_properties(physical_device, None) };
        let graphics_family_index =
            get_queue_family_index(vk::QueueFlags::GRAPHICS, &queue_family_properties)?;

        let default_queue_priority = [1.0];
        let queue_create_infos = [vk::DeviceQueueCreateInfoBuilder::new()
            .queue_family_index(graphics_family_index)
            .queue_priorities(&default_queue_priority)];

        let enabled_features = vk::PhysicalDeviceFeatures::default();

        let mut device_layers = vec![];
        if cfg!(debug_assertions) {
            device_layers.push(VALIDATION_LAYER);
        }

        let mut buffer_device_address_features =
            vk::PhysicalDeviceBufferDeviceAddressFeaturesBuilder::new().buffer_device_address(true);
        let mut reset_query_features =
            vk::PhysicalDeviceHostQueryResetFeaturesBuilder::new().host_query_reset(true);
        let mut acceleration_structure_features =
            vk::PhysicalDeviceAccelerationStructureFeaturesKHRBuilder::new()
                .acceleration_structure(true);
        let mut ray_tracing_features =
            vk::PhysicalDeviceRayTracingPipelineFeaturesKHRBuilder::new()
                .ray_tracing_pipeline(true);

        let device_create_info = vk::DeviceCreateInfoBuilder::new()
            .queue_create_infos(&queue_create_infos)
            .enabled_features(&enabled_features)
            .enabled_extension_names(&REQUIRED_DEVICE_EXTENSIONS)
            .enabled_layer_names(&device_layers)
            .extend_from(&mut buffer_device_address_features)
            .extend_from(&mut reset_query_features)
            .extend_from(&mut acceleration_structure_features)
            .extend_from(&mut ray_tracing_features);

        let device = unsafe { DeviceLoader::new(&instance, physical_device, &device_create_info) }
            .map_err(|e| AccelError::Loader(e.to_string()))?;

        let command_pool = unsafe {
            device.create_command_pool(
                &vk::CommandPoolCreateInfoBuilder::new()
                    .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
                    .queue_family_index(graphics_family_index),
                None,
            )
        }
        .result()?;

        let graphics_queue = unsafe { device.get_device_queue(graphics_family_index, 0) };

        let allocator = Mutex::new(GpuAllocator::new(
            gpu_alloc::Config::i_am_prototyping(),
            unsafe { gpu_alloc_erupt::device_properties(&instance, physical_device) }?,
        ));

        let raytracing_properties = RaytracingProperties::new(&instance, physical_device);
        log::debug!(
            "scratch alignment {}, max instances {}, max primitives {}, shader group handle size {}",
            raytracing_properties.min_acceleration_structure_scratch_offset_alignment(),
            raytracing_properties.max_instance_count(),
            raytracing_properties.max_primitive_count(),
            raytracing_properties.shader_group_handle_size(),
        );

        Ok(Device {
            handle: device,
            allocator,
            instance,
            _entry: entry,
            raytracing_properties,
            graphics_queue,
            command_pool,
        })
    }

    pub fn wait_idle(&self) {
        unsafe {
            if let Err(err) = self.handle.device_wait_idle().result() {
                log::error!("device_wait_idle failed: {:?}", err);
            }
        }
    }
}

impl RaytracingDevice for Device {
    fn min_scratch_alignment(&self) -> u64 {
        self.raytracing_properties
            .min_acceleration_structure_scratch_offset_alignment() as u64
    }

    fn build_sizes(
        &self,
        build_info: &vk::AccelerationStructureBuildGeometryInfoKHR,
        max_primitive_counts: &[u32],
    ) -> vk::AccelerationStructureBuildSizesInfoKHR {
        unsafe {
            self.handle.get_acceleration_structure_build_sizes_khr(
                vk::AccelerationStructureBuildTypeKHR::DEVICE_KHR,
                build_info,
                max_primitive_counts,
            )
        }
    }

    fn create_buffer(
        &self,
        size: u64,
        usage: vk::BufferUsageFlags,
        memory_usage: gpu_alloc::UsageFlags,
    ) -> Result<Buffer> {
        let create_info = vk::BufferCreateInfoBuilder::new()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let handle = unsafe { self.handle.create_buffer(&create_info, None) }.result()?;

        let mem_reqs = unsafe { self.handle.get_buffer_memory_requirements(handle) };
        let allocation = unsafe {
            self.allocator.lock().alloc(
                EruptMemoryDevice::wrap(&self.handle),
                gpu_alloc::Request {
                    size: mem_reqs.size,
                    align_mask: mem_reqs.alignment - 1,
                    usage: memory_usage,
                    memory_types: mem_reqs.memory_type_bits,
                },
            )
        };
        let mem_block = match allocation {
            Ok(mem_block) => mem_block,
            Err(err) => {
                unsafe { self.handle.destroy_buffer(handle, None) };
                return Err(err.into());
            }
        };

        unsafe {
            self.handle
                .bind_buffer_memory(handle, *mem_block.memory(), mem_block.offset())
                .result()?;
        }

        let device_address = if usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS) {
            let info = vk::BufferDeviceAddressInfoBuilder::new().buffer(handle);
            unsafe { self.handle.get_buffer_device_address(&info) }
        } else {
            0
        };

        Ok(Buffer::new(handle, Some(mem_block), size, device_address))
    }

    fn write_buffer(&self, buffer: &mut Buffer, data: &[u8]) -> Result<()> {
        assert!(data.len() as u64 <= buffer.size());
        let mem_block = match buffer.memory_mut() {
            Some(mem_block) => mem_block,
            None => return Err(AccelError::Vulkan(vk::Result::ERROR_MEMORY_MAP_FAILED)),
        };
        unsafe { mem_block.write_bytes(EruptMemoryDevice::wrap(&self.handle), 0, data) }
            .map_err(|_| AccelError::Vulkan(vk::Result::ERROR_MEMORY_MAP_FAILED))
    }

    fn destroy_buffer(&self, buffer: Buffer) {
        let (handle, memory) = buffer.into_parts();
        unsafe {
            self.handle.destroy_buffer(handle, None);
        }
        if let Some(mem_block) = memory {
            unsafe {
                self.allocator
                    .lock()
                    .dealloc(EruptMemoryDevice::wrap(&self.handle), mem_block);
            }
        }
    }

    fn create_acceleration_structure(
        &self,
        create_info: &vk::AccelerationStructureCreateInfoKHR,
    ) -> Result<vk::AccelerationStructureKHR> {
        let handle = unsafe {
            self.handle
                .create_acceleration_structure_khr(create_info, None)
                .result()?
        };
        Ok(handle)
    }

    fn destroy_acceleration_structure(&self, acceleration_structure: vk::AccelerationStructureKHR) {
        unsafe {
            self.handle
                .destroy_acceleration_structure_khr(acceleration_structure, None);
        }
    }

    fn acceleration_structure_address(
        &self,
        acceleration_structure: vk::AccelerationStructureKHR,
    ) -> vk::DeviceAddress {
        let address_info = vk::AccelerationStructureDeviceAddressInfoKHRBuilder::new()
            .acceleration_structure(acceleration_structure);
        unsafe {
            self.handle
                .get_acceleration_structure_device_address_khr(&address_info)
        }
    }

    fn create_query_pool(&self, query_type: vk::QueryType, count: u32) -> Result<vk::QueryPool> {
        let create_info = vk::QueryPoolCreateInfoBuilder::new()
            .query_type(query_type)
            .query_count(count);
        let query_pool = unsafe { self.handle.create_query_pool(&create_info, None) }.result()?;
        Ok(query_pool)
    }

    fn destroy_query_pool(&self, query_pool: vk::QueryPool) {
        unsafe {
            self.handle.destroy_query_pool(query_pool, None);
        }
    }

    fn reset_query_pool(&self, query_pool: vk::QueryPool, first: u32, count: u32) {
        unsafe {
            self.handle.reset_query_pool(query_pool, first, count);
        }
    }

    fn compacted_sizes(
        &self,
        query_pool: vk::QueryPool,
        first: u32,
        count: u32,
    ) -> Result<Vec<vk::DeviceSize>> {
        let mut sizes = vec![0 as vk::DeviceSize; count as usize];
        unsafe {
            self.handle
                .get_query_pool_results(
                    query_pool,
                    first,
                    count,
                    sizes.len() * size_of::<vk::DeviceSize>(),
                    sizes.as_mut_ptr() as *mut c_void,
                    size_of::<vk::DeviceSize>() as vk::DeviceSize,
                    vk::QueryResultFlags::_64 | vk::QueryResultFlags::WAIT,
                )
                .result()?;
        }
        Ok(sizes)
    }

    fn cmd_build_acceleration_structures(
        &self,
        command_buffer: vk::CommandBuffer,
        build_infos: &[vk::AccelerationStructureBuildGeometryInfoKHRBuilder],
        build_ranges: &[&[vk::AccelerationStructureBuildRangeInfoKHR]],
    ) {
        let build_range_ptrs = build_ranges
            .iter()
            .map(|ranges| ranges.as_ptr())
            .collect::<Vec<_>>();
        unsafe {
            self.handle.cmd_build_acceleration_structures_khr(
                command_buffer,
                build_infos,
                &build_range_ptrs,
            );
        }
    }

    fn cmd_memory_barrier(
        &self,
        command_buffer: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        src_access: vk::AccessFlags,
        dst_access: vk::AccessFlags,
    ) {
        let memory_barrier = vk::MemoryBarrierBuilder::new()
            .src_access_mask(src_access)
            .dst_access_mask(dst_access);
        unsafe {
            self.handle.cmd_pipeline_barrier(
                command_buffer,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[memory_barrier],
                &[],
                &[],
            );
        }
    }

    fn cmd_write_compacted_sizes(
        &self,
        command_buffer: vk::CommandBuffer,
        acceleration_structures: &[vk::AccelerationStructureKHR],
        query_pool: vk::QueryPool,
        first_query: u32,
    ) {
        unsafe {
            self.handle
                .cmd_write_acceleration_structures_properties_khr(
                    command_buffer,
                    acceleration_structures,
                    vk::QueryType::ACCELERATION_STRUCTURE_COMPACTED_SIZE_KHR,
                    query_pool,
                    first_query,
                );
        }
    }

    fn cmd_copy_acceleration_structure(
        &self,
        command_buffer: vk::CommandBuffer,
        copy_info: &vk::CopyAccelerationStructureInfoKHR,
    ) {
        unsafe {
            self.handle
                .cmd_copy_acceleration_structure_khr(command_buffer, copy_info);
        }
    }

    fn single_time_submit<T>(
        &self,
        record: impl FnOnce(CommandBuffer) -> Result<T>,
    ) -> Result<T> {
        puffin::profile_function!();
        let alloc_info = vk::CommandBufferAllocateInfoBuilder::new()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let command_buffer =
            unsafe { self.handle.allocate_command_buffers(&alloc_info) }.result()?[0];

        let begin_info = vk::CommandBufferBeginInfoBuilder::new()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        let submitted = unsafe {
            self.handle
                .begin_command_buffer(command_buffer, &begin_info)
                .result()?;

            let recorded = record(CommandBuffer::new(command_buffer));

            self.handle.end_command_buffer(command_buffer).result()?;

            recorded.and_then(|value| {
                let submit_buffers = [command_buffer];
                let submit_info = vk::SubmitInfoBuilder::new().command_buffers(&submit_buffers);
                self.handle
                    .queue_submit(self.graphics_queue, &[submit_info], vk::Fence::null())
                    .result()?;
                self.handle.queue_wait_idle(self.graphics_queue).result()?;
                Ok(value)
            })
        };

        unsafe {
            self.handle
                .free_command_buffers(self.command_pool, &[command_buffer]);
        }

        submitted
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        log::debug!("Dropping device");
        unsafe {
            self.handle.destroy_command_pool(self.command_pool, None);
            self.allocator
                .lock()
                .cleanup(EruptMemoryDevice::wrap(&self.handle));
            self.handle.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

fn create_instance(entry: &EntryLoader) -> Result<InstanceLoader> {
    let app_name =
        CString::new("raytrace-accel").map_err(|e| AccelError::Loader(e.to_string()))?;
    let engine_name =
        CString::new("Vulkan Engine").map_err(|e| AccelError::Loader(e.to_string()))?;
    let app_info = vk::ApplicationInfoBuilder::new()
        .api_version(vk::API_VERSION_1_2)
        .application_version(vk::make_api_version(0, 1, 0, 0))
        .application_name(&app_name)
        .engine_version(vk::make_api_version(0, 1, 0, 0))
        .engine_name(&engine_name);

    let mut instance_layers = Vec::new();
    if cfg!(debug_assertions) {
        instance_layers.push(VALIDATION_LAYER);
    }

    let instance_info = vk::InstanceCreateInfoBuilder::new()
        .application_info(&app_info)
        .enabled_layer_names(&instance_layers);

    unsafe { InstanceLoader::new(entry, &instance_info) }
        .map_err(|e| AccelError::Loader(e.to_string()))
}

fn supports_raytracing(instance: &InstanceLoader, physical_device: vk::PhysicalDevice) -> bool {
    let supported_extensions = unsafe {
        instance.enumerate_device_extension_properties(physical_device, None, None)
    };
    let supported_extensions = match supported_extensions.result() {
        Ok(extensions) => extensions,
        Err(_) => return false,
    };

    REQUIRED_DEVICE_EXTENSIONS.iter().all(|required| {
        let required = unsafe { CStr::from_ptr(*required) };
        supported_extensions
            .iter()
            .any(|e| unsafe { CStr::from_ptr(e.extension_name.as_ptr()) } == required)
    })
}

fn pick_physical_device(instance: &InstanceLoader) -> Result<vk::PhysicalDevice> {
    let physical_devices = unsafe { instance.enumerate_physical_devices(None) }.result()?;
    physical_devices
        .iter()
        .copied()
        .find(|physical_device| supports_raytracing(instance, *physical_device))
        .ok_or(AccelError::NoPhysicalDevice)
}

fn get_queue_family_index(
    queue_flag: vk::QueueFlags,
    queue_family_properties: &[vk::QueueFamilyProperties],
) -> Result<u32> {
    queue_family_properties
        .iter()
        .position(|queue| queue.queue_flags.contains(queue_flag))
        .map(|index| index as u32)
        .ok_or(AccelError::NoQueueFamily(queue_flag))
}
