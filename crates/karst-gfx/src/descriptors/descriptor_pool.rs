use std::sync::{Arc, Mutex};

use ash::vk;

use crate::{
    error::{GfxError, GfxResult},
    foundation::{debug_utils::DebugType, device::GfxDevice},
};

/// descriptor pool 封装
///
/// set 不单独释放，由 [`Self::reset`] 整体回收。
/// 分配计数用于在驱动报错之前就发现池耗尽。
pub struct GfxDescriptorPool {
    handle: vk::DescriptorPool,
    max_sets: u32,
    allocated: Mutex<u32>,

    device: Arc<GfxDevice>,
}

// init & destroy
impl GfxDescriptorPool {
    pub fn new(
        device: Arc<GfxDevice>,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
        debug_name: impl AsRef<str>,
    ) -> GfxResult<Self> {
        let pool_ci = vk::DescriptorPoolCreateInfo::default().max_sets(max_sets).pool_sizes(pool_sizes);
        let handle = unsafe { device.create_descriptor_pool(&pool_ci, None)? };

        let pool = Self {
            handle,
            max_sets,
            allocated: Mutex::new(0),
            device,
        };
        pool.device.set_debug_name(&pool, debug_name);
        Ok(pool)
    }

    pub fn destroy(self) {
        log::info!("destroying GfxDescriptorPool");
        unsafe {
            self.device.destroy_descriptor_pool(self.handle, None);
        }
    }
}

// tools
impl GfxDescriptorPool {
    /// 分配一个 descriptor set
    pub fn alloc_set(&self, layout: vk::DescriptorSetLayout) -> GfxResult<vk::DescriptorSet> {
        let mut allocated = self.allocated.lock().unwrap();
        if *allocated >= self.max_sets {
            return Err(GfxError::DescriptorPoolExhausted(vk::Result::ERROR_OUT_OF_POOL_MEMORY));
        }

        let layouts = [layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::default().descriptor_pool(self.handle).set_layouts(&layouts);
        let sets = unsafe {
            self.device.allocate_descriptor_sets(&alloc_info).map_err(|err| match err {
                vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL => {
                    GfxError::DescriptorPoolExhausted(err)
                }
                other => GfxError::Vulkan(other),
            })?
        };

        *allocated += 1;
        Ok(sets[0])
    }

    /// 回收所有已分配的 set
    pub fn reset(&self) -> GfxResult<()> {
        let mut allocated = self.allocated.lock().unwrap();
        unsafe {
            self.device.reset_descriptor_pool(self.handle, vk::DescriptorPoolResetFlags::empty())?;
        }
        *allocated = 0;
        Ok(())
    }
}

// getter
impl GfxDescriptorPool {
    #[inline]
    pub fn handle(&self) -> vk::DescriptorPool {
        self.handle
    }

    #[inline]
    pub fn allocated_count(&self) -> u32 {
        *self.allocated.lock().unwrap()
    }
}

impl DebugType for GfxDescriptorPool {
    fn debug_type_name() -> &'static str {
        "GfxDescriptorPool"
    }
    fn vk_handle(&self) -> impl vk::Handle {
        self.handle
    }
}
