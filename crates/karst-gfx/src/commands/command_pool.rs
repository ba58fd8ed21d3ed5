use std::sync::Arc;

use ash::vk;

use crate::{
    error::GfxResult,
    foundation::{debug_utils::DebugType, device::GfxDevice},
};

/// command pool 封装
///
/// command pool 不是线程安全的，每个录制线程持有自己的 pool。
/// pool 与 queue family 绑定，而不是与 queue 绑定
pub struct GfxCommandPool {
    handle: vk::CommandPool,
    queue_family_index: u32,

    device: Arc<GfxDevice>,
}

impl Drop for GfxCommandPool {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_command_pool(self.handle, None);
        }
    }
}

// init
impl GfxCommandPool {
    pub fn new(device: Arc<GfxDevice>, queue_family_index: u32, debug_name: impl AsRef<str>) -> GfxResult<Self> {
        let pool_ci = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family_index)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let handle = unsafe { device.create_command_pool(&pool_ci, None)? };

        let pool = Self {
            handle,
            queue_family_index,
            device,
        };
        pool.device.set_debug_name(&pool, debug_name);
        Ok(pool)
    }
}

// getter
impl GfxCommandPool {
    #[inline]
    pub fn handle(&self) -> vk::CommandPool {
        self.handle
    }

    #[inline]
    pub fn queue_family_index(&self) -> u32 {
        self.queue_family_index
    }
}

// tools
impl GfxCommandPool {
    /// 从 pool 中分配一个 primary command buffer
    pub fn alloc_command_buffer(&self, debug_name: impl AsRef<str>) -> GfxResult<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.handle)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers = unsafe { self.device.allocate_command_buffers(&alloc_info)? };

        self.device.set_object_debug_name(buffers[0], debug_name);
        Ok(buffers[0])
    }
}

impl DebugType for GfxCommandPool {
    fn debug_type_name() -> &'static str {
        "GfxCommandPool"
    }
    fn vk_handle(&self) -> impl vk::Handle {
        self.handle
    }
}
