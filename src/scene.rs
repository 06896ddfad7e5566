use erupt::vk;
use glam::Mat4;
use strum_macros::{EnumCount, EnumIter};

/// Shading path of a material. The discriminant doubles as the hit-group
/// offset in the shader binding table, so the ray tracing pipeline must
/// declare its hit groups in this order.
#[derive(EnumIter, EnumCount, Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MaterialWorkflow {
    Pbr = 0,
    Lambertian = 1,
}

impl MaterialWorkflow {
    pub fn hit_group_offset(&self) -> u32 {
        *self as u32
    }
}

/// Triangle mesh already resident on the device.
#[derive(Copy, Clone, Debug)]
pub struct MeshGeometry {
    pub vertex_address: vk::DeviceAddress,
    pub index_address: vk::DeviceAddress,
    pub vertex_count: u32,
    pub index_count: u32,
    pub vertex_stride: u64,
}

impl MeshGeometry {
    pub fn primitive_count(&self) -> u32 {
        self.index_count / 3
    }
}

#[derive(Copy, Clone, Debug)]
pub struct SceneInstance {
    pub transform: Mat4,
    pub mesh_id: usize,
    pub workflow: MaterialWorkflow,
}

impl SceneInstance {
    pub fn new(transform: Mat4, mesh_id: usize, workflow: MaterialWorkflow) -> Self {
        SceneInstance {
            transform,
            mesh_id,
            workflow,
        }
    }
}

/// Meshes are addressed by their index in `meshes`.
#[derive(Default)]
pub struct Scene {
    meshes: Vec<MeshGeometry>,
    instances: Vec<SceneInstance>,
}

impl Scene {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn meshes(&self) -> &[MeshGeometry] {
        &self.meshes
    }

    pub fn instances(&self) -> &[SceneInstance] {
        &self.instances
    }

    pub fn instances_mut(&mut self) -> &mut [SceneInstance] {
        &mut self.instances
    }

    pub fn add_mesh(&mut self, mesh: MeshGeometry) -> usize {
        self.meshes.push(mesh);
        self.meshes.len() - 1
    }

    pub fn add_instance(&mut self, instance: SceneInstance) {
        assert!(
            instance.mesh_id < self.meshes.len(),
            "instance references unknown mesh {}",
            instance.mesh_id
        );
        self.instances.push(instance);
    }

    pub fn clear_instances(&mut self) {
        self.instances.clear();
    }
}
