use std::sync::Arc;

use ash::vk;

use crate::{
    error::GfxResult,
    foundation::{debug_utils::DebugType, device::GfxDevice},
};

/// descriptor set layout 中的一个 binding
///
/// 对 inline uniform block 来说，count 表示 byte 数
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct GfxDescriptorBinding {
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub count: u32,
    pub stages: vk::ShaderStageFlags,
}

/// descriptor set layout 封装
///
/// 保留 binding 表，供写入 descriptor 时做类型校验。
pub struct GfxDescriptorSetLayout {
    handle: vk::DescriptorSetLayout,
    bindings: Vec<GfxDescriptorBinding>,

    device: Arc<GfxDevice>,
}

impl Drop for GfxDescriptorSetLayout {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_descriptor_set_layout(self.handle, None);
        }
    }
}

impl GfxDescriptorSetLayout {
    pub fn new(
        device: Arc<GfxDevice>,
        bindings: Vec<GfxDescriptorBinding>,
        debug_name: impl AsRef<str>,
    ) -> GfxResult<Self> {
        let vk_bindings = bindings
            .iter()
            .map(|b| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(b.binding)
                    .descriptor_type(b.descriptor_type)
                    .descriptor_count(b.count)
                    .stage_flags(b.stages)
            })
            .collect::<Vec<_>>();
        let layout_ci = vk::DescriptorSetLayoutCreateInfo::default().bindings(&vk_bindings);
        let handle = unsafe { device.create_descriptor_set_layout(&layout_ci, None)? };

        let layout = Self {
            handle,
            bindings,
            device,
        };
        layout.device.set_debug_name(&layout, debug_name);
        Ok(layout)
    }
}

// getter
impl GfxDescriptorSetLayout {
    #[inline]
    pub fn handle(&self) -> vk::DescriptorSetLayout {
        self.handle
    }

    #[inline]
    pub fn bindings(&self) -> &[GfxDescriptorBinding] {
        &self.bindings
    }

    /// 查找某个 binding 的声明
    #[inline]
    pub fn find_binding(&self, binding: u32) -> Option<&GfxDescriptorBinding> {
        self.bindings.iter().find(|b| b.binding == binding)
    }
}

impl DebugType for GfxDescriptorSetLayout {
    fn debug_type_name() -> &'static str {
        "GfxDescriptorSetLayout"
    }
    fn vk_handle(&self) -> impl vk::Handle {
        self.handle
    }
}
