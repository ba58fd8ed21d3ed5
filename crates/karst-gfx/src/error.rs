//! 资源层的错误类型
//!
//! 只有「致命且不可恢复」的情况才会以 `Result` 形式向上传播：
//! 显存耗尽、没有兼容的 memory type、描述符池耗尽等。
//! 调用方契约违反（空的描述符 payload、复用已提交的 command buffer 等）
//! 属于编程错误，直接 panic，不进入该枚举。

use ash::vk;

#[derive(Debug, thiserror::Error)]
pub enum GfxError {
    /// 设备显存耗尽，分配失败。不做重试
    #[error("out of device memory: requested {size} bytes (memory type {memory_type})")]
    OutOfDeviceMemory { size: vk::DeviceSize, memory_type: u32 },

    /// 找不到同时满足 memory type bits 和 property flags 的 memory type
    ///
    /// 注意：不会静默降级到更弱的 property flags
    #[error("no memory type satisfies bits {type_bits:#b} with properties {required:?}")]
    NoCompatibleMemoryType { type_bits: u32, required: vk::MemoryPropertyFlags },

    /// 描述符池容量耗尽
    #[error("descriptor pool exhausted: {0:?}")]
    DescriptorPoolExhausted(vk::Result),

    /// 其他 Vulkan 调用失败
    #[error("vulkan error: {0:?}")]
    Vulkan(#[from] vk::Result),
}

pub type GfxResult<T> = Result<T, GfxError>;
