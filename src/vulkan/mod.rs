pub mod buffer;
pub mod command_buffer;
pub mod device;
pub mod raytracing;
