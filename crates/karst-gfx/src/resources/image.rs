use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use ash::vk;

use crate::{
    allocator::{GfxAllocation, GfxMemAllocator},
    error::GfxResult,
    foundation::{debug_utils::DebugType, device::GfxDevice},
    resources::image_state::GfxImageStateTracker,
};

/// image 的内存来源
///
/// 外部 image（例如 swapchain image）的 handle 和内存都不归本对象管理
enum GfxImageSource {
    Allocated {
        allocation: GfxAllocation,
        allocator: Arc<GfxMemAllocator>,
    },
    External,
}

/// image view 的缓存 key
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct GfxImageViewKey {
    pub base_mip: u32,
    pub mip_count: u32,
    pub base_layer: u32,
    pub layer_count: u32,
}

impl GfxImageViewKey {
    /// 覆盖整个 image 的 view
    pub fn full(mip_count: u32, layer_count: u32) -> Self {
        Self {
            base_mip: 0,
            mip_count,
            base_layer: 0,
            layer_count,
        }
    }
}

/// 2D image 封装
///
/// 持有 subresource 状态追踪器和按需创建的 view 缓存。
pub struct GfxImage {
    handle: vk::Image,
    source: GfxImageSource,

    format: vk::Format,
    extent: vk::Extent2D,
    mip_count: u32,
    layer_count: u32,
    usage: vk::ImageUsageFlags,

    /// 按 subresource 范围缓存 view，销毁时统一清理
    views: Mutex<HashMap<GfxImageViewKey, vk::ImageView>>,
    states: Mutex<GfxImageStateTracker>,

    debug_name: String,

    device: Arc<GfxDevice>,
}

impl Drop for GfxImage {
    fn drop(&mut self) {
        let views = self.views.lock().unwrap();
        unsafe {
            for view in views.values() {
                self.device.destroy_image_view(*view, None);
            }
        }
        if let GfxImageSource::Allocated { allocation, allocator } = &self.source {
            unsafe {
                self.device.destroy_image(self.handle, None);
            }
            allocator.free(allocation);
        }
    }
}

// init
impl GfxImage {
    pub fn new(
        device: Arc<GfxDevice>,
        allocator: Arc<GfxMemAllocator>,
        format: vk::Format,
        extent: vk::Extent2D,
        mip_count: u32,
        layer_count: u32,
        usage: vk::ImageUsageFlags,
        debug_name: impl AsRef<str>,
    ) -> GfxResult<Self> {
        debug_assert!(mip_count > 0 && layer_count > 0);

        let image_ci = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(mip_count)
            .array_layers(layer_count)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let handle = unsafe { device.create_image(&image_ci, None)? };

        let requirements = unsafe { device.get_image_memory_requirements(handle) };
        let allocation = match allocator.alloc(&requirements, vk::MemoryPropertyFlags::DEVICE_LOCAL, debug_name.as_ref())
        {
            Ok(allocation) => allocation,
            Err(err) => {
                unsafe { device.destroy_image(handle, None) };
                return Err(err);
            }
        };
        unsafe {
            device.bind_image_memory(handle, allocation.memory(), allocation.offset())?;
        }

        let image = Self {
            handle,
            source: GfxImageSource::Allocated { allocation, allocator },
            format,
            extent,
            mip_count,
            layer_count,
            usage,
            views: Mutex::new(HashMap::new()),
            states: Mutex::new(GfxImageStateTracker::new(mip_count, layer_count)),
            debug_name: debug_name.as_ref().to_string(),
            device,
        };
        image.device.set_debug_name(&image, debug_name);
        Ok(image)
    }

    /// 包装一个外部创建的 image（例如 swapchain image）
    ///
    /// handle 和内存的生命周期由外部负责，这里只追踪状态和 view
    pub fn new_external(
        device: Arc<GfxDevice>,
        handle: vk::Image,
        format: vk::Format,
        extent: vk::Extent2D,
        debug_name: impl AsRef<str>,
    ) -> Self {
        let image = Self {
            handle,
            source: GfxImageSource::External,
            format,
            extent,
            mip_count: 1,
            layer_count: 1,
            usage: vk::ImageUsageFlags::empty(),
            views: Mutex::new(HashMap::new()),
            states: Mutex::new(GfxImageStateTracker::new(1, 1)),
            debug_name: debug_name.as_ref().to_string(),
            device,
        };
        image.device.set_debug_name(&image, debug_name);
        image
    }
}

// getter
impl GfxImage {
    #[inline]
    pub fn handle(&self) -> vk::Image {
        self.handle
    }

    #[inline]
    pub fn format(&self) -> vk::Format {
        self.format
    }

    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    #[inline]
    pub fn mip_count(&self) -> u32 {
        self.mip_count
    }

    #[inline]
    pub fn layer_count(&self) -> u32 {
        self.layer_count
    }

    #[inline]
    pub fn usage(&self) -> vk::ImageUsageFlags {
        self.usage
    }

    #[inline]
    pub fn debug_name(&self) -> &str {
        &self.debug_name
    }

    #[inline]
    pub fn is_external(&self) -> bool {
        matches!(self.source, GfxImageSource::External)
    }

    #[inline]
    pub fn aspect_mask(&self) -> vk::ImageAspectFlags {
        format_aspect_mask(self.format)
    }

    #[inline]
    pub(crate) fn states(&self) -> MutexGuard<'_, GfxImageStateTracker> {
        self.states.lock().unwrap()
    }
}

// tools
impl GfxImage {
    /// 获取覆盖指定 subresource 范围的 view，按需创建并缓存
    pub fn get_view(&self, key: GfxImageViewKey) -> GfxResult<vk::ImageView> {
        assert!(key.mip_count > 0 && key.base_mip + key.mip_count <= self.mip_count, "view mip range out of bounds");
        assert!(
            key.layer_count > 0 && key.base_layer + key.layer_count <= self.layer_count,
            "view layer range out of bounds"
        );

        let mut views = self.views.lock().unwrap();
        if let Some(view) = views.get(&key) {
            return Ok(*view);
        }

        let view_type = if self.layer_count > 1 {
            vk::ImageViewType::TYPE_2D_ARRAY
        } else {
            vk::ImageViewType::TYPE_2D
        };
        let view_ci = vk::ImageViewCreateInfo::default()
            .image(self.handle)
            .view_type(view_type)
            .format(self.format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: self.aspect_mask(),
                base_mip_level: key.base_mip,
                level_count: key.mip_count,
                base_array_layer: key.base_layer,
                layer_count: key.layer_count,
            });
        let view = unsafe { self.device.create_image_view(&view_ci, None)? };
        self.device.set_object_debug_name(
            view,
            format!("{}-view-m{}+{}-l{}+{}", self.debug_name, key.base_mip, key.mip_count, key.base_layer, key.layer_count),
        );

        views.insert(key, view);
        Ok(view)
    }

    /// 覆盖整个 image 的 view
    #[inline]
    pub fn get_full_view(&self) -> GfxResult<vk::ImageView> {
        self.get_view(GfxImageViewKey::full(self.mip_count, self.layer_count))
    }
}

impl DebugType for GfxImage {
    fn debug_type_name() -> &'static str {
        "GfxImage"
    }
    fn vk_handle(&self) -> impl vk::Handle {
        self.handle
    }
}

/// 由 format 推断 aspect mask
pub fn format_aspect_mask(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM | vk::Format::D32_SFLOAT | vk::Format::X8_D24_UNORM_PACK32 => {
            vk::ImageAspectFlags::DEPTH
        }
        vk::Format::D16_UNORM_S8_UINT | vk::Format::D24_UNORM_S8_UINT | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
        _ => vk::ImageAspectFlags::COLOR,
    }
}

/// 完整 mip chain 的级数
#[inline]
pub fn full_mip_count(extent: vk::Extent2D) -> u32 {
    32 - extent.width.max(extent.height).max(1).leading_zeros()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_mip_count() {
        assert_eq!(full_mip_count(vk::Extent2D { width: 1, height: 1 }), 1);
        assert_eq!(full_mip_count(vk::Extent2D { width: 256, height: 256 }), 9);
        assert_eq!(full_mip_count(vk::Extent2D { width: 800, height: 600 }), 10);
        assert_eq!(full_mip_count(vk::Extent2D { width: 1024, height: 1 }), 11);
    }

    #[test]
    fn test_format_aspect_mask() {
        assert_eq!(format_aspect_mask(vk::Format::R8G8B8A8_UNORM), vk::ImageAspectFlags::COLOR);
        assert_eq!(format_aspect_mask(vk::Format::D32_SFLOAT), vk::ImageAspectFlags::DEPTH);
        assert_eq!(
            format_aspect_mask(vk::Format::D24_UNORM_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
    }
}
