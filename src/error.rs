use erupt::vk;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AccelError>;

#[derive(Debug, Error)]
pub enum AccelError {
    #[error("vulkan call failed: {0:?}")]
    Vulkan(vk::Result),

    #[error("device memory allocation failed: {0:?}")]
    Allocation(gpu_alloc::AllocationError),

    #[error("failed to load vulkan: {0}")]
    Loader(String),

    #[error("no vulkan physical device available")]
    NoPhysicalDevice,

    #[error("no queue family supports {0:?}")]
    NoQueueFamily(vk::QueueFlags),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("no scene is loaded")]
    SceneNotLoaded,
}

impl From<vk::Result> for AccelError {
    fn from(result: vk::Result) -> Self {
        AccelError::Vulkan(result)
    }
}

impl From<gpu_alloc::AllocationError> for AccelError {
    fn from(error: gpu_alloc::AllocationError) -> Self {
        AccelError::Allocation(error)
    }
}

impl From<serde_json::Error> for AccelError {
    fn from(error: serde_json::Error) -> Self {
        AccelError::Config(error.to_string())
    }
}

impl From<std::io::Error> for AccelError {
    fn from(error: std::io::Error) -> Self {
        AccelError::Config(error.to_string())
    }
}
