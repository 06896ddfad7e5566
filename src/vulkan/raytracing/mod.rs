pub mod acceleration_structure;
pub mod bottom_level_builder;
pub mod coordinator;
#[cfg(test)]
pub mod fake_device;
pub mod geometry_build_descriptor;
pub mod raytracing_device;
pub mod raytracing_properties;
pub mod scratch;
pub mod top_level_builder;

pub use acceleration_structure::AccelerationStructure;
pub use bottom_level_builder::{BlasBuilder, CompactionStats};
pub use coordinator::RaytracingCoordinator;
pub use geometry_build_descriptor::GeometryBuildDescriptor;
pub use raytracing_device::RaytracingDevice;
pub use scratch::ScratchBuffer;
pub use top_level_builder::{InstanceRecord, TlasBuilder};
