use ash::vk;

use crate::resources::image_state::GfxImageState;

/// barrier 使用的 src 和 dst 访问 mask
#[derive(Copy, Clone)]
pub struct GfxBarrierMask {
    pub src_stage: vk::PipelineStageFlags2,
    pub dst_stage: vk::PipelineStageFlags2,
    pub src_access: vk::AccessFlags2,
    pub dst_access: vk::AccessFlags2,
}

/// 便捷创建 image memory barrier 的结构体
pub struct GfxImageBarrier {
    inner: vk::ImageMemoryBarrier2<'static>,
}

impl Default for GfxImageBarrier {
    fn default() -> Self {
        Self {
            inner: vk::ImageMemoryBarrier2 {
                old_layout: vk::ImageLayout::UNDEFINED,
                new_layout: vk::ImageLayout::UNDEFINED,
                src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
                dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
                subresource_range: vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::empty(),
                    base_array_layer: 0,
                    layer_count: 1,
                    base_mip_level: 0,
                    level_count: 1,
                },
                ..Default::default()
            },
        }
    }
}

impl GfxImageBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    /// 由状态追踪器给出的 src/dst 状态构造 barrier
    pub fn from_states(src: GfxImageState, dst: GfxImageState) -> Self {
        Self::new()
            .layout_transfer(src.layout, dst.layout)
            .src_mask(src.stage, src.access)
            .dst_mask(dst.stage, dst.access)
    }

    /// 返回的引用保持 `'static` 的结构体生命周期，方便解引用拷贝出去
    #[inline]
    pub fn inner(&self) -> &vk::ImageMemoryBarrier2<'static> {
        &self.inner
    }

    /// builder
    #[inline]
    pub fn queue_family_transfer(mut self, src_queue_family_index: u32, dst_queue_family_index: u32) -> Self {
        self.inner.src_queue_family_index = src_queue_family_index;
        self.inner.dst_queue_family_index = dst_queue_family_index;
        self
    }

    /// builder
    #[inline]
    pub fn layout_transfer(mut self, old_layout: vk::ImageLayout, new_layout: vk::ImageLayout) -> Self {
        self.inner.old_layout = old_layout;
        self.inner.new_layout = new_layout;
        self
    }

    /// builder
    #[inline]
    pub fn src_mask(mut self, src_stage_mask: vk::PipelineStageFlags2, src_access_mask: vk::AccessFlags2) -> Self {
        self.inner.src_stage_mask = src_stage_mask;
        self.inner.src_access_mask = src_access_mask;
        self
    }

    /// builder
    #[inline]
    pub fn dst_mask(mut self, dst_stage_mask: vk::PipelineStageFlags2, dst_access_mask: vk::AccessFlags2) -> Self {
        self.inner.dst_stage_mask = dst_stage_mask;
        self.inner.dst_access_mask = dst_access_mask;
        self
    }

    /// builder
    #[inline]
    pub fn subresource_range(
        mut self,
        aspect_mask: vk::ImageAspectFlags,
        base_mip: u32,
        mip_count: u32,
        base_layer: u32,
        layer_count: u32,
    ) -> Self {
        self.inner.subresource_range = vk::ImageSubresourceRange {
            aspect_mask,
            base_mip_level: base_mip,
            level_count: mip_count,
            base_array_layer: base_layer,
            layer_count,
        };
        self
    }

    /// builder
    /// layer 和 miplevel 都使用默认值
    #[inline]
    pub fn image_aspect_flag(mut self, aspect_mask: vk::ImageAspectFlags) -> Self {
        self.inner.subresource_range.aspect_mask = aspect_mask;
        self
    }

    /// builder
    #[inline]
    pub fn image(mut self, image: vk::Image) -> Self {
        self.inner.image = image;
        self
    }
}

pub struct GfxBufferBarrier {
    inner: vk::BufferMemoryBarrier2<'static>,
}

impl Default for GfxBufferBarrier {
    fn default() -> Self {
        Self {
            inner: vk::BufferMemoryBarrier2 {
                src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
                dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
                ..Default::default()
            },
        }
    }
}

impl GfxBufferBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn inner(&self) -> &vk::BufferMemoryBarrier2<'static> {
        &self.inner
    }

    #[inline]
    pub fn src_mask(mut self, src_stage_mask: vk::PipelineStageFlags2, src_access_mask: vk::AccessFlags2) -> Self {
        self.inner.src_stage_mask = src_stage_mask;
        self.inner.src_access_mask = src_access_mask;
        self
    }

    #[inline]
    pub fn dst_mask(mut self, dst_stage_mask: vk::PipelineStageFlags2, dst_access_mask: vk::AccessFlags2) -> Self {
        self.inner.dst_stage_mask = dst_stage_mask;
        self.inner.dst_access_mask = dst_access_mask;
        self
    }

    #[inline]
    pub fn mask(mut self, mask: GfxBarrierMask) -> Self {
        self.inner.src_stage_mask = mask.src_stage;
        self.inner.dst_stage_mask = mask.dst_stage;
        self.inner.src_access_mask = mask.src_access;
        self.inner.dst_access_mask = mask.dst_access;
        self
    }

    #[inline]
    pub fn buffer(mut self, buffer: vk::Buffer, offset: vk::DeviceSize, size: vk::DeviceSize) -> Self {
        self.inner.buffer = buffer;
        self.inner.offset = offset;
        self.inner.size = size;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vk::Handle;

    #[test]
    fn test_barrier_from_undefined_has_no_src_access() {
        let src = GfxImageState::for_layout(vk::ImageLayout::UNDEFINED);
        let dst = GfxImageState::for_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL);

        let barrier = GfxImageBarrier::from_states(src, dst);
        let inner = barrier.inner();
        assert_eq!(inner.old_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(inner.new_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(inner.src_access_mask, vk::AccessFlags2::empty());
        assert_eq!(inner.dst_stage_mask, vk::PipelineStageFlags2::TRANSFER);
        assert_eq!(inner.dst_access_mask, vk::AccessFlags2::TRANSFER_WRITE);
    }

    #[test]
    fn test_transfer_to_shader_read_barrier() {
        let src = GfxImageState::for_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        let dst = GfxImageState::for_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);

        let barrier = GfxImageBarrier::from_states(src, dst);
        let inner = barrier.inner();
        assert_eq!(inner.src_stage_mask, vk::PipelineStageFlags2::TRANSFER);
        assert_eq!(inner.src_access_mask, vk::AccessFlags2::TRANSFER_WRITE);
        assert_eq!(inner.dst_stage_mask, vk::PipelineStageFlags2::FRAGMENT_SHADER);
        assert_eq!(inner.dst_access_mask, vk::AccessFlags2::SHADER_READ);
    }

    #[test]
    fn test_barrier_copy_outlives_builder() {
        // cmd_pipeline_barrier2 需要按值收集 barrier，builder 在收集前就会销毁
        let inner = {
            let src = GfxImageState::for_layout(vk::ImageLayout::UNDEFINED);
            let dst = GfxImageState::for_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL);
            *GfxImageBarrier::from_states(src, dst).image(vk::Image::from_raw(1)).inner()
        };
        assert_eq!(inner.new_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(inner.image, vk::Image::from_raw(1));
    }

    #[test]
    fn test_buffer_barrier_after_transfer_write() {
        let mask = GfxBarrierMask {
            src_stage: vk::PipelineStageFlags2::TRANSFER,
            src_access: vk::AccessFlags2::TRANSFER_WRITE,
            dst_stage: vk::PipelineStageFlags2::ALL_COMMANDS,
            dst_access: vk::AccessFlags2::MEMORY_READ,
        };
        let inner = {
            let barrier = GfxBufferBarrier::new().mask(mask).buffer(vk::Buffer::from_raw(7), 0, vk::WHOLE_SIZE);
            *barrier.inner()
        };
        assert_eq!(inner.src_stage_mask, vk::PipelineStageFlags2::TRANSFER);
        assert_eq!(inner.src_access_mask, vk::AccessFlags2::TRANSFER_WRITE);
        assert_eq!(inner.dst_access_mask, vk::AccessFlags2::MEMORY_READ);
        assert_eq!(inner.buffer, vk::Buffer::from_raw(7));
        assert_eq!(inner.size, vk::WHOLE_SIZE);
    }

    #[test]
    fn test_subresource_range_builder() {
        let barrier = GfxImageBarrier::new().subresource_range(vk::ImageAspectFlags::COLOR, 2, 3, 1, 4);
        let range = barrier.inner().subresource_range;
        assert_eq!(range.base_mip_level, 2);
        assert_eq!(range.level_count, 3);
        assert_eq!(range.base_array_layer, 1);
        assert_eq!(range.layer_count, 4);
    }
}
