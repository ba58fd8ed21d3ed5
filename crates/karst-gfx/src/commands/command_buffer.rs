//! command buffer 的录制封装
//!
//! 记录三类信息：
//! - 生命周期阶段，保证 begin/end/submit/复用的调用顺序正确
//! - keep-alive 列表，保证录制中引用的资源活到 GPU 执行完毕
//! - 绑定缓存，省略重复的 bind 调用

use std::{collections::HashMap, sync::Arc};

use ash::vk;

use crate::{
    basic::color::LabelColor,
    commands::barrier::{GfxBarrierMask, GfxBufferBarrier, GfxImageBarrier},
    descriptors::descriptor_set::GfxDescriptorSet,
    error::GfxResult,
    foundation::{debug_utils::DebugType, device::GfxDevice},
    pool::GfxPoolKey,
    resources::{
        buffer::GfxBuffer,
        image::GfxImage,
        image_state::GfxImageState,
    },
};

/// command buffer 的生命周期阶段
///
/// Free -> Recording -> Executable -> Submitted -> Free。
/// abandon 从 Recording/Executable 直接回到 Free
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RecorderPhase {
    /// 可以开始新一轮录制
    Free,
    /// begin 和 end 之间
    Recording,
    /// 已 end，等待提交
    Executable,
    /// 已提交，等待 GPU 执行完毕
    Submitted,
}

impl RecorderPhase {
    #[inline]
    pub fn can_begin(self) -> bool {
        self == Self::Free
    }

    #[inline]
    pub fn can_record(self) -> bool {
        self == Self::Recording
    }

    #[inline]
    pub fn can_submit(self) -> bool {
        self == Self::Executable
    }

    #[inline]
    pub fn can_abandon(self) -> bool {
        matches!(self, Self::Recording | Self::Executable)
    }
}

/// 录制期间引用的资源，保证它们活到（或留在借出状态直到）GPU 执行完毕
pub enum GfxTracked {
    Buffer(Arc<GfxBuffer>),
    Image(Arc<GfxImage>),
    PooledBuffer(GfxPoolKey),
    PooledImage(GfxPoolKey),
    PooledDescriptorSet(GfxPoolKey),
}

pub struct GfxCommandBuffer {
    handle: vk::CommandBuffer,
    phase: RecorderPhase,

    /// GPU 执行完毕前必须存活的资源
    tracked: Vec<GfxTracked>,

    /// binding index -> 当前绑定的 vertex buffer
    bound_vertex: HashMap<u32, (vk::Buffer, vk::DeviceSize)>,
    bound_index: Option<(vk::Buffer, vk::DeviceSize, vk::IndexType)>,
    /// (pipeline layout, set index) -> 当前绑定的 descriptor set
    bound_sets: HashMap<(vk::PipelineLayout, u32), vk::DescriptorSet>,

    debug_name: String,

    device: Arc<GfxDevice>,
}

// init
impl GfxCommandBuffer {
    pub(crate) fn new(device: Arc<GfxDevice>, handle: vk::CommandBuffer, debug_name: impl AsRef<str>) -> Self {
        Self {
            handle,
            phase: RecorderPhase::Free,
            tracked: Vec::new(),
            bound_vertex: HashMap::new(),
            bound_index: None,
            bound_sets: HashMap::new(),
            debug_name: debug_name.as_ref().to_string(),
            device,
        }
    }

    /// 复用 recorder 时改用新调用方给的名字，vk 对象的 debug name 一并更新
    pub(crate) fn rename(&mut self, debug_name: impl AsRef<str>) {
        self.debug_name = debug_name.as_ref().to_string();
        self.device.set_debug_name(self, debug_name);
    }
}

// getter
impl GfxCommandBuffer {
    #[inline]
    pub fn handle(&self) -> vk::CommandBuffer {
        self.handle
    }

    #[inline]
    pub fn phase(&self) -> RecorderPhase {
        self.phase
    }

    #[inline]
    pub fn debug_name(&self) -> &str {
        &self.debug_name
    }
}

// 生命周期
impl GfxCommandBuffer {
    /// 开始录制，自动以 debug name 开启一个 debug label
    pub fn begin(&mut self, usage: vk::CommandBufferUsageFlags) -> GfxResult<()> {
        assert!(self.phase.can_begin(), "begin called in phase {:?}", self.phase);

        let begin_info = vk::CommandBufferBeginInfo::default().flags(usage);
        unsafe {
            self.device.begin_command_buffer(self.handle, &begin_info)?;
        }
        self.phase = RecorderPhase::Recording;
        self.begin_label(self.debug_name.clone(), LabelColor::COLOR_CMD);
        Ok(())
    }

    /// 结束录制，关闭 begin 开启的 debug label
    pub fn end(&mut self) -> GfxResult<()> {
        assert!(self.phase.can_record(), "end called in phase {:?}", self.phase);

        self.end_label();
        unsafe {
            self.device.end_command_buffer(self.handle)?;
        }
        self.phase = RecorderPhase::Executable;
        Ok(())
    }

    /// 放弃录制的内容，不提交
    ///
    /// GPU 从未见过这些命令，引用的资源可以立即归还。
    /// 实际的 reset 发生在下一次 begin
    pub fn abandon(&mut self) -> Vec<GfxTracked> {
        assert!(self.phase.can_abandon(), "abandon called in phase {:?}", self.phase);

        self.phase = RecorderPhase::Free;
        self.clear_bind_caches();
        std::mem::take(&mut self.tracked)
    }

    pub(crate) fn mark_submitted(&mut self) {
        assert!(self.phase.can_submit(), "submit in phase {:?}", self.phase);
        self.phase = RecorderPhase::Submitted;
    }

    /// fence 确认 GPU 执行完毕后调用，返回 keep-alive 列表供归还
    ///
    /// 不做 reset：command pool 不是线程安全的，reset 留给在
    /// 归属线程上执行的下一次 begin
    pub(crate) fn on_complete(&mut self) -> Vec<GfxTracked> {
        assert_eq!(self.phase, RecorderPhase::Submitted, "on_complete in phase {:?}", self.phase);

        self.phase = RecorderPhase::Free;
        self.clear_bind_caches();
        std::mem::take(&mut self.tracked)
    }

    fn clear_bind_caches(&mut self) {
        self.bound_vertex.clear();
        self.bound_index = None;
        self.bound_sets.clear();
    }

    /// 将资源加入 keep-alive 列表
    #[inline]
    pub fn track(&mut self, tracked: GfxTracked) {
        self.tracked.push(tracked);
    }
}

// debug label
impl GfxCommandBuffer {
    #[inline]
    pub fn begin_label(&self, label_name: impl AsRef<str>, label_color: glam::Vec4) {
        assert!(self.phase.can_record(), "begin_label in phase {:?}", self.phase);
        self.device.cmd_begin_debug_label(self.handle, label_name, label_color);
    }

    #[inline]
    pub fn end_label(&self) {
        assert!(self.phase.can_record(), "end_label in phase {:?}", self.phase);
        self.device.cmd_end_debug_label(self.handle);
    }

    #[inline]
    pub fn insert_label(&self, label_name: impl AsRef<str>, label_color: glam::Vec4) {
        assert!(self.phase.can_record(), "insert_label in phase {:?}", self.phase);
        self.device.cmd_insert_debug_label(self.handle, label_name, label_color);
    }
}

// barrier & layout 转换
impl GfxCommandBuffer {
    /// 将 image 的指定 subresource 范围转换到目标 layout
    ///
    /// src 状态来自 image 内部的状态追踪器；已处于目标状态的部分不产生 barrier
    pub fn transition_image(
        &mut self,
        image: &Arc<GfxImage>,
        base_mip: u32,
        mip_count: u32,
        base_layer: u32,
        layer_count: u32,
        dst_layout: vk::ImageLayout,
    ) {
        assert!(self.phase.can_record(), "transition_image in phase {:?}", self.phase);

        let dst = GfxImageState::for_layout(dst_layout);
        let transitions = image.states().transition(base_mip, mip_count, base_layer, layer_count, dst);
        if transitions.is_empty() {
            return;
        }

        let barriers = transitions
            .iter()
            .map(|t| {
                *GfxImageBarrier::from_states(t.src, dst)
                    .image(image.handle())
                    .subresource_range(image.aspect_mask(), t.base_mip, t.mip_count, t.base_layer, t.layer_count)
                    .inner()
            })
            .collect::<Vec<_>>();
        let dependency = vk::DependencyInfo::default().image_memory_barriers(&barriers);
        unsafe {
            self.device.cmd_pipeline_barrier2(self.handle, &dependency);
        }

        self.track(GfxTracked::Image(image.clone()));
    }

    /// 整张 image 的 layout 转换
    #[inline]
    pub fn transition_image_all(&mut self, image: &Arc<GfxImage>, dst_layout: vk::ImageLayout) {
        self.transition_image(image, 0, image.mip_count(), 0, image.layer_count(), dst_layout);
    }

    /// 在 buffer 的写入和后续访问之间插入 memory barrier
    ///
    /// buffer 没有状态追踪，src/dst mask 由调用方给出
    pub fn buffer_barrier(
        &mut self,
        buffer: &Arc<GfxBuffer>,
        mask: GfxBarrierMask,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) {
        assert!(self.phase.can_record(), "buffer_barrier in phase {:?}", self.phase);

        let barrier = *GfxBufferBarrier::new().mask(mask).buffer(buffer.handle(), offset, size).inner();
        let dependency = vk::DependencyInfo::default().buffer_memory_barriers(std::slice::from_ref(&barrier));
        unsafe {
            self.device.cmd_pipeline_barrier2(self.handle, &dependency);
        }

        self.track(GfxTracked::Buffer(buffer.clone()));
    }

    /// 不经过状态追踪的裸 layout 转换，用于外部管理状态的 image
    pub fn transition_external(
        &mut self,
        image: vk::Image,
        aspect_mask: vk::ImageAspectFlags,
        src: GfxImageState,
        dst: GfxImageState,
    ) {
        assert!(self.phase.can_record(), "transition_external in phase {:?}", self.phase);

        let barrier = *GfxImageBarrier::from_states(src, dst)
            .image(image)
            .subresource_range(aspect_mask, 0, vk::REMAINING_MIP_LEVELS, 0, vk::REMAINING_ARRAY_LAYERS)
            .inner();
        let dependency = vk::DependencyInfo::default().image_memory_barriers(std::slice::from_ref(&barrier));
        unsafe {
            self.device.cmd_pipeline_barrier2(self.handle, &dependency);
        }
    }

    /// 逐级 blit 生成完整的 mip chain
    ///
    /// 调用前 mip 0 应已包含图像数据。结束后整张 image 处于
    /// SHADER_READ_ONLY_OPTIMAL
    pub fn generate_mipmaps(&mut self, image: &Arc<GfxImage>) {
        assert!(self.phase.can_record(), "generate_mipmaps in phase {:?}", self.phase);
        assert!(image.mip_count() > 1, "image {} has no mip chain to generate", image.debug_name());

        let layer_count = image.layer_count();

        // mip 0 作为首个 blit 的源
        self.transition_image(image, 0, 1, 0, layer_count, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);

        for mip in 1..image.mip_count() {
            self.transition_image(image, mip, 1, 0, layer_count, vk::ImageLayout::TRANSFER_DST_OPTIMAL);

            let src_extent = mip_level_extent(image.extent(), mip - 1);
            let dst_extent = mip_level_extent(image.extent(), mip);
            let blit = vk::ImageBlit {
                src_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: image.aspect_mask(),
                    mip_level: mip - 1,
                    base_array_layer: 0,
                    layer_count,
                },
                src_offsets: [
                    vk::Offset3D { x: 0, y: 0, z: 0 },
                    vk::Offset3D {
                        x: src_extent.width as i32,
                        y: src_extent.height as i32,
                        z: 1,
                    },
                ],
                dst_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: image.aspect_mask(),
                    mip_level: mip,
                    base_array_layer: 0,
                    layer_count,
                },
                dst_offsets: [
                    vk::Offset3D { x: 0, y: 0, z: 0 },
                    vk::Offset3D {
                        x: dst_extent.width as i32,
                        y: dst_extent.height as i32,
                        z: 1,
                    },
                ],
            };
            unsafe {
                self.device.cmd_blit_image(
                    self.handle,
                    image.handle(),
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    image.handle(),
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    std::slice::from_ref(&blit),
                    vk::Filter::LINEAR,
                );
            }

            // 本级变为下一级 blit 的源
            self.transition_image(image, mip, 1, 0, layer_count, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
        }

        self.transition_image_all(image, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
    }
}

// transfer
impl GfxCommandBuffer {
    pub fn copy_buffer(&mut self, src: &Arc<GfxBuffer>, dst: &Arc<GfxBuffer>, regions: &[vk::BufferCopy]) {
        assert!(self.phase.can_record(), "copy_buffer in phase {:?}", self.phase);

        unsafe {
            self.device.cmd_copy_buffer(self.handle, src.handle(), dst.handle(), regions);
        }
        self.track(GfxTracked::Buffer(src.clone()));
        self.track(GfxTracked::Buffer(dst.clone()));
    }

    /// 将 buffer 内容拷贝到 image 的指定 mip。image 需要已处于 TRANSFER_DST
    pub fn copy_buffer_to_image(&mut self, src: &Arc<GfxBuffer>, dst: &Arc<GfxImage>, mip: u32) {
        assert!(self.phase.can_record(), "copy_buffer_to_image in phase {:?}", self.phase);

        let extent = mip_level_extent(dst.extent(), mip);
        let region = vk::BufferImageCopy {
            buffer_offset: 0,
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: dst.aspect_mask(),
                mip_level: mip,
                base_array_layer: 0,
                layer_count: dst.layer_count(),
            },
            image_offset: vk::Offset3D { x: 0, y: 0, z: 0 },
            image_extent: vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            },
        };
        unsafe {
            self.device.cmd_copy_buffer_to_image(
                self.handle,
                src.handle(),
                dst.handle(),
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                std::slice::from_ref(&region),
            );
        }
        self.track(GfxTracked::Buffer(src.clone()));
        self.track(GfxTracked::Image(dst.clone()));
    }
}

// bind & draw
impl GfxCommandBuffer {
    /// 绑定 vertex buffer，与当前绑定相同时省略调用
    pub fn bind_vertex_buffer(&mut self, binding: u32, buffer: &Arc<GfxBuffer>, offset: vk::DeviceSize) {
        assert!(self.phase.can_record(), "bind_vertex_buffer in phase {:?}", self.phase);

        if self.bound_vertex.get(&binding) == Some(&(buffer.handle(), offset)) {
            return;
        }
        unsafe {
            self.device.cmd_bind_vertex_buffers(self.handle, binding, &[buffer.handle()], &[offset]);
        }
        self.bound_vertex.insert(binding, (buffer.handle(), offset));
        self.track(GfxTracked::Buffer(buffer.clone()));
    }

    pub fn bind_index_buffer(&mut self, buffer: &Arc<GfxBuffer>, offset: vk::DeviceSize, index_type: vk::IndexType) {
        assert!(self.phase.can_record(), "bind_index_buffer in phase {:?}", self.phase);

        if self.bound_index == Some((buffer.handle(), offset, index_type)) {
            return;
        }
        unsafe {
            self.device.cmd_bind_index_buffer(self.handle, buffer.handle(), offset, index_type);
        }
        self.bound_index = Some((buffer.handle(), offset, index_type));
        self.track(GfxTracked::Buffer(buffer.clone()));
    }

    /// 绑定 descriptor set，与当前绑定相同时省略调用
    ///
    /// set 中积攒的写入需要调用方在提交前 flush
    pub fn bind_descriptor_set(
        &mut self,
        bind_point: vk::PipelineBindPoint,
        pipeline_layout: vk::PipelineLayout,
        set_index: u32,
        set: &GfxDescriptorSet,
    ) {
        assert!(self.phase.can_record(), "bind_descriptor_set in phase {:?}", self.phase);

        let key = (pipeline_layout, set_index);
        if self.bound_sets.get(&key) == Some(&set.handle()) {
            return;
        }
        unsafe {
            self.device.cmd_bind_descriptor_sets(
                self.handle,
                bind_point,
                pipeline_layout,
                set_index,
                &[set.handle()],
                &[],
            );
        }
        self.bound_sets.insert(key, set.handle());
    }

    #[inline]
    pub fn bind_pipeline(&mut self, bind_point: vk::PipelineBindPoint, pipeline: vk::Pipeline) {
        assert!(self.phase.can_record(), "bind_pipeline in phase {:?}", self.phase);
        unsafe {
            self.device.cmd_bind_pipeline(self.handle, bind_point, pipeline);
        }
    }

    #[inline]
    pub fn draw(&mut self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32) {
        assert!(self.phase.can_record(), "draw in phase {:?}", self.phase);
        unsafe {
            self.device.cmd_draw(self.handle, vertex_count, instance_count, first_vertex, first_instance);
        }
    }

    #[inline]
    pub fn draw_indexed(&mut self, index_count: u32, instance_count: u32, first_index: u32) {
        assert!(self.phase.can_record(), "draw_indexed in phase {:?}", self.phase);
        unsafe {
            self.device.cmd_draw_indexed(self.handle, index_count, instance_count, first_index, 0, 0);
        }
    }

    #[inline]
    pub fn dispatch(&mut self, group_count_x: u32, group_count_y: u32, group_count_z: u32) {
        assert!(self.phase.can_record(), "dispatch in phase {:?}", self.phase);
        unsafe {
            self.device.cmd_dispatch(self.handle, group_count_x, group_count_y, group_count_z);
        }
    }
}

impl DebugType for GfxCommandBuffer {
    fn debug_type_name() -> &'static str {
        "GfxCommandBuffer"
    }
    fn vk_handle(&self) -> impl vk::Handle {
        self.handle
    }
}

/// 某一级 mip 的尺寸，最小为 1x1
#[inline]
pub fn mip_level_extent(extent: vk::Extent2D, level: u32) -> vk::Extent2D {
    vk::Extent2D {
        width: (extent.width >> level).max(1),
        height: (extent.height >> level).max(1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_transitions() {
        assert!(RecorderPhase::Free.can_begin());
        assert!(!RecorderPhase::Free.can_record());
        assert!(!RecorderPhase::Free.can_abandon());

        assert!(RecorderPhase::Recording.can_record());
        assert!(RecorderPhase::Recording.can_abandon());
        assert!(!RecorderPhase::Recording.can_begin());
        assert!(!RecorderPhase::Recording.can_submit());

        assert!(RecorderPhase::Executable.can_submit());
        assert!(RecorderPhase::Executable.can_abandon());
        assert!(!RecorderPhase::Executable.can_record());

        assert!(!RecorderPhase::Submitted.can_begin());
        assert!(!RecorderPhase::Submitted.can_submit());
        assert!(!RecorderPhase::Submitted.can_abandon());
    }

    #[test]
    fn test_mip_level_extent() {
        let extent = vk::Extent2D { width: 800, height: 600 };
        assert_eq!(mip_level_extent(extent, 0), extent);
        assert_eq!(mip_level_extent(extent, 1), vk::Extent2D { width: 400, height: 300 });
        assert_eq!(mip_level_extent(extent, 3), vk::Extent2D { width: 100, height: 75 });

        // 不会缩小到 0
        assert_eq!(mip_level_extent(extent, 12), vk::Extent2D { width: 1, height: 1 });
    }
}
