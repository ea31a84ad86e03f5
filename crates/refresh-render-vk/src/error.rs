// SPDX-License-Identifier: CEPL-1.0
use std::path::PathBuf;

use ash::vk;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VkError {
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    #[error("surface error: {0}")]
    Surface(String),

    #[error("no GPU exposes a graphics queue, a present queue and VK_KHR_swapchain")]
    NoSuitableDevice,

    #[error("swapchain error: {0}")]
    Swapchain(String),

    #[error("no memory type in {type_bits:#x} with {flags:?}")]
    NoMemoryType {
        type_bits: u32,
        flags: vk::MemoryPropertyFlags,
    },

    #[error("shader {path}: {source}")]
    Shader {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("pipeline error: {0}")]
    Pipeline(String),

    #[error("upload error: {0}")]
    Upload(String),
}

pub type VkResult<T> = std::result::Result<T, VkError>;
