use std::sync::Arc;

use ash::vk;

use crate::{
    error::GfxResult,
    foundation::{debug_utils::DebugType, device::GfxDevice},
};

/// fence 封装，用于 CPU 等待 GPU 完成
pub struct GfxFence {
    handle: vk::Fence,
    device: Arc<GfxDevice>,
}

impl Drop for GfxFence {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_fence(self.handle, None);
        }
    }
}

impl GfxFence {
    pub fn new(device: Arc<GfxDevice>, signaled: bool, debug_name: impl AsRef<str>) -> GfxResult<Self> {
        let flags = if signaled { vk::FenceCreateFlags::SIGNALED } else { vk::FenceCreateFlags::empty() };
        let fence_ci = vk::FenceCreateInfo::default().flags(flags);
        let handle = unsafe { device.create_fence(&fence_ci, None)? };

        let fence = Self { handle, device };
        fence.device.set_debug_name(&fence, debug_name);
        Ok(fence)
    }

    #[inline]
    pub fn handle(&self) -> vk::Fence {
        self.handle
    }

    /// 阻塞等待 fence 变为 signaled
    pub fn wait(&self) -> GfxResult<()> {
        unsafe {
            self.device.wait_for_fences(std::slice::from_ref(&self.handle), true, u64::MAX)?;
        }
        Ok(())
    }

    /// 非阻塞查询 fence 状态
    #[inline]
    pub fn is_signaled(&self) -> GfxResult<bool> {
        let signaled = unsafe { self.device.get_fence_status(self.handle)? };
        Ok(signaled)
    }

    pub fn reset(&self) -> GfxResult<()> {
        unsafe {
            self.device.reset_fences(std::slice::from_ref(&self.handle))?;
        }
        Ok(())
    }
}

impl DebugType for GfxFence {
    fn debug_type_name() -> &'static str {
        "GfxFence"
    }
    fn vk_handle(&self) -> impl vk::Handle {
        self.handle
    }
}

/// binary semaphore 封装，用于 queue 之间的同步
pub struct GfxSemaphore {
    handle: vk::Semaphore,
    device: Arc<GfxDevice>,
}

impl Drop for GfxSemaphore {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_semaphore(self.handle, None);
        }
    }
}

impl GfxSemaphore {
    pub fn new(device: Arc<GfxDevice>, debug_name: impl AsRef<str>) -> GfxResult<Self> {
        let semaphore_ci = vk::SemaphoreCreateInfo::default();
        let handle = unsafe { device.create_semaphore(&semaphore_ci, None)? };

        let semaphore = Self { handle, device };
        semaphore.device.set_debug_name(&semaphore, debug_name);
        Ok(semaphore)
    }

    #[inline]
    pub fn handle(&self) -> vk::Semaphore {
        self.handle
    }
}

impl DebugType for GfxSemaphore {
    fn debug_type_name() -> &'static str {
        "GfxSemaphore"
    }
    fn vk_handle(&self) -> impl vk::Handle {
        self.handle
    }
}
