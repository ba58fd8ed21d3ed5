//! descriptor set 的写入器
//!
//! 写入立即做合法性校验，实际的 `vkUpdateDescriptorSets` 延迟到 flush 时
//! 一次性提交。与已写入内容相同的写入会被去重。

use std::{collections::HashMap, sync::Mutex};

use ash::vk::{self, Handle};

use crate::{
    descriptors::layout::{GfxDescriptorBinding, GfxDescriptorSetLayout},
    foundation::device::GfxDevice,
};

/// 写入 descriptor 的具体内容
///
/// 只持有裸 handle；资源的存活由 command buffer 的 keep-alive 列表负责
#[derive(Clone, PartialEq, Debug)]
pub enum GfxDescriptorValue {
    UniformBuffer {
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        range: vk::DeviceSize,
    },
    StorageBuffer {
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        range: vk::DeviceSize,
    },
    SampledImage {
        view: vk::ImageView,
        layout: vk::ImageLayout,
    },
    StorageImage {
        view: vk::ImageView,
        layout: vk::ImageLayout,
    },
    CombinedImageSampler {
        view: vk::ImageView,
        layout: vk::ImageLayout,
        sampler: vk::Sampler,
    },
    Sampler {
        sampler: vk::Sampler,
    },
    InlineUniform {
        data: Vec<u8>,
    },
}

impl GfxDescriptorValue {
    /// 该 value 对应的 descriptor type
    pub fn descriptor_type(&self) -> vk::DescriptorType {
        match self {
            Self::UniformBuffer { .. } => vk::DescriptorType::UNIFORM_BUFFER,
            Self::StorageBuffer { .. } => vk::DescriptorType::STORAGE_BUFFER,
            Self::SampledImage { .. } => vk::DescriptorType::SAMPLED_IMAGE,
            Self::StorageImage { .. } => vk::DescriptorType::STORAGE_IMAGE,
            Self::CombinedImageSampler { .. } => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            Self::Sampler { .. } => vk::DescriptorType::SAMPLER,
            Self::InlineUniform { .. } => vk::DescriptorType::INLINE_UNIFORM_BLOCK,
        }
    }
}

struct WriterState {
    /// 已写入但尚未提交到 GPU 的内容
    pending: HashMap<(u32, u32), GfxDescriptorValue>,
    /// 已经提交到 GPU 的内容
    bound: HashMap<(u32, u32), GfxDescriptorValue>,
}

/// descriptor set 及其写入状态
pub struct GfxDescriptorSet {
    handle: vk::DescriptorSet,
    layout_handle: vk::DescriptorSetLayout,
    bindings: Vec<GfxDescriptorBinding>,

    state: Mutex<WriterState>,
}

// init
impl GfxDescriptorSet {
    pub fn new(handle: vk::DescriptorSet, layout: &GfxDescriptorSetLayout) -> Self {
        Self::from_bindings(handle, layout.handle(), layout.bindings().to_vec())
    }

    fn from_bindings(
        handle: vk::DescriptorSet,
        layout_handle: vk::DescriptorSetLayout,
        bindings: Vec<GfxDescriptorBinding>,
    ) -> Self {
        Self {
            handle,
            layout_handle,
            bindings,
            state: Mutex::new(WriterState {
                pending: HashMap::new(),
                bound: HashMap::new(),
            }),
        }
    }
}

// getter
impl GfxDescriptorSet {
    #[inline]
    pub fn handle(&self) -> vk::DescriptorSet {
        self.handle
    }

    #[inline]
    pub fn layout_handle(&self) -> vk::DescriptorSetLayout {
        self.layout_handle
    }

    #[inline]
    pub fn pending_count(&self) -> usize {
        self.state.lock().unwrap().pending.len()
    }
}

// tools
impl GfxDescriptorSet {
    /// 记录一次写入，立即校验合法性
    ///
    /// 与已提交内容相同的写入会被去重。类型不匹配、binding 不存在、
    /// array index 越界都属于调用方 bug，直接 panic
    pub fn write(&self, binding: u32, array_index: u32, value: GfxDescriptorValue) {
        let decl = self
            .bindings
            .iter()
            .find(|b| b.binding == binding)
            .unwrap_or_else(|| panic!("binding {} does not exist in layout", binding));
        assert_eq!(
            decl.descriptor_type,
            value.descriptor_type(),
            "binding {} expects {:?}, got {:?}",
            binding,
            decl.descriptor_type,
            value.descriptor_type()
        );
        // payload 里的 handle 必须有效，null 属于调用方 bug
        match &value {
            GfxDescriptorValue::UniformBuffer { buffer, .. } | GfxDescriptorValue::StorageBuffer { buffer, .. } => {
                assert!(!buffer.is_null(), "binding {} written with a null buffer", binding);
            }
            GfxDescriptorValue::SampledImage { view, .. } | GfxDescriptorValue::StorageImage { view, .. } => {
                assert!(!view.is_null(), "binding {} written with a null image view", binding);
            }
            GfxDescriptorValue::CombinedImageSampler { view, sampler, .. } => {
                assert!(!view.is_null(), "binding {} written with a null image view", binding);
                assert!(!sampler.is_null(), "binding {} written with a null sampler", binding);
            }
            GfxDescriptorValue::Sampler { sampler } => {
                assert!(!sampler.is_null(), "binding {} written with a null sampler", binding);
            }
            GfxDescriptorValue::InlineUniform { .. } => {}
        }
        match &value {
            GfxDescriptorValue::InlineUniform { data } => {
                // inline uniform block 的 count 是 byte 数，array_index 无意义
                assert_eq!(array_index, 0, "inline uniform write must use array index 0");
                assert!(
                    data.len() as u32 <= decl.count,
                    "inline uniform data ({} bytes) exceeds binding capacity ({} bytes)",
                    data.len(),
                    decl.count
                );
                assert_eq!(data.len() % 4, 0, "inline uniform data size must be a multiple of 4");
            }
            _ => {
                assert!(
                    array_index < decl.count,
                    "array index {} out of range for binding {} (count {})",
                    array_index,
                    binding,
                    decl.count
                );
            }
        }

        let mut state = self.state.lock().unwrap();
        let key = (binding, array_index);
        if state.pending.get(&key) == Some(&value) {
            return;
        }
        if !state.pending.contains_key(&key) && state.bound.get(&key) == Some(&value) {
            return;
        }
        state.pending.insert(key, value);
    }

    /// 取出所有待提交的写入（按 binding, array_index 排序），并记录为已提交
    pub fn drain_pending(&self) -> Vec<((u32, u32), GfxDescriptorValue)> {
        let mut state = self.state.lock().unwrap();
        let mut drained: Vec<_> = state.pending.drain().collect();
        drained.sort_by_key(|(key, _)| *key);
        for (key, value) in &drained {
            state.bound.insert(*key, value.clone());
        }
        drained
    }

    /// 将积攒的写入一次性提交到 GPU
    pub fn flush(&self, device: &GfxDevice) {
        let drained = self.drain_pending();
        if drained.is_empty() {
            return;
        }
        let _span = tracy_client::span!("GfxDescriptorSet::flush");

        // 先收集好所有 info，再构造引用它们的 WriteDescriptorSet
        let mut buffer_infos: Vec<vk::DescriptorBufferInfo> = Vec::new();
        let mut image_infos: Vec<vk::DescriptorImageInfo> = Vec::new();
        let mut inline_data: Vec<Vec<u8>> = Vec::new();

        enum Planned {
            Buffer(usize),
            Image(usize),
            Inline(usize),
        }
        let mut planned: Vec<(u32, u32, vk::DescriptorType, Planned)> = Vec::with_capacity(drained.len());

        for ((binding, array_index), value) in &drained {
            let ty = value.descriptor_type();
            let plan = match value {
                GfxDescriptorValue::UniformBuffer { buffer, offset, range }
                | GfxDescriptorValue::StorageBuffer { buffer, offset, range } => {
                    buffer_infos.push(vk::DescriptorBufferInfo {
                        buffer: *buffer,
                        offset: *offset,
                        range: *range,
                    });
                    Planned::Buffer(buffer_infos.len() - 1)
                }
                GfxDescriptorValue::SampledImage { view, layout }
                | GfxDescriptorValue::StorageImage { view, layout } => {
                    image_infos.push(vk::DescriptorImageInfo {
                        sampler: vk::Sampler::null(),
                        image_view: *view,
                        image_layout: *layout,
                    });
                    Planned::Image(image_infos.len() - 1)
                }
                GfxDescriptorValue::CombinedImageSampler { view, layout, sampler } => {
                    image_infos.push(vk::DescriptorImageInfo {
                        sampler: *sampler,
                        image_view: *view,
                        image_layout: *layout,
                    });
                    Planned::Image(image_infos.len() - 1)
                }
                GfxDescriptorValue::Sampler { sampler } => {
                    image_infos.push(vk::DescriptorImageInfo {
                        sampler: *sampler,
                        image_view: vk::ImageView::null(),
                        image_layout: vk::ImageLayout::UNDEFINED,
                    });
                    Planned::Image(image_infos.len() - 1)
                }
                GfxDescriptorValue::InlineUniform { data } => {
                    inline_data.push(data.clone());
                    Planned::Inline(inline_data.len() - 1)
                }
            };
            planned.push((*binding, *array_index, ty, plan));
        }

        let mut inline_blocks: Vec<vk::WriteDescriptorSetInlineUniformBlock> =
            inline_data.iter().map(|data| vk::WriteDescriptorSetInlineUniformBlock::default().data(data)).collect();
        let mut inline_iter = inline_blocks.iter_mut();

        let mut writes: Vec<vk::WriteDescriptorSet> = Vec::with_capacity(planned.len());
        for (binding, array_index, ty, plan) in &planned {
            let write = vk::WriteDescriptorSet::default()
                .dst_set(self.handle)
                .dst_binding(*binding)
                .dst_array_element(*array_index)
                .descriptor_type(*ty);
            let write = match plan {
                Planned::Buffer(index) => write.buffer_info(std::slice::from_ref(&buffer_infos[*index])),
                Planned::Image(index) => write.image_info(std::slice::from_ref(&image_infos[*index])),
                Planned::Inline(index) => {
                    // iter_mut 的顺序与 planned 中 inline 写入的顺序一致
                    let block = inline_iter.next().unwrap();
                    write.descriptor_count(inline_data[*index].len() as u32).push_next(block)
                }
            };
            writes.push(write);
        }

        unsafe {
            device.update_descriptor_sets(&writes, &[]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vk::Handle;

    fn test_set() -> GfxDescriptorSet {
        GfxDescriptorSet::from_bindings(
            vk::DescriptorSet::null(),
            vk::DescriptorSetLayout::null(),
            vec![
                GfxDescriptorBinding {
                    binding: 0,
                    descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
                    count: 1,
                    stages: vk::ShaderStageFlags::ALL,
                },
                GfxDescriptorBinding {
                    binding: 1,
                    descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                    count: 4,
                    stages: vk::ShaderStageFlags::FRAGMENT,
                },
                GfxDescriptorBinding {
                    binding: 2,
                    descriptor_type: vk::DescriptorType::INLINE_UNIFORM_BLOCK,
                    count: 64,
                    stages: vk::ShaderStageFlags::ALL,
                },
                GfxDescriptorBinding {
                    binding: 3,
                    descriptor_type: vk::DescriptorType::SAMPLER,
                    count: 1,
                    stages: vk::ShaderStageFlags::FRAGMENT,
                },
            ],
        )
    }

    fn uniform(raw: u64) -> GfxDescriptorValue {
        GfxDescriptorValue::UniformBuffer {
            buffer: vk::Buffer::from_raw(raw),
            offset: 0,
            range: vk::WHOLE_SIZE,
        }
    }

    #[test]
    fn test_writes_batch_until_drained() {
        let set = test_set();
        set.write(0, 0, uniform(1));
        set.write(1, 2, GfxDescriptorValue::CombinedImageSampler {
            view: vk::ImageView::from_raw(2),
            layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            sampler: vk::Sampler::from_raw(3),
        });
        assert_eq!(set.pending_count(), 2);

        let drained = set.drain_pending();
        assert_eq!(drained.len(), 2);
        // 按 (binding, array_index) 排序
        assert_eq!(drained[0].0, (0, 0));
        assert_eq!(drained[1].0, (1, 2));
        assert_eq!(set.pending_count(), 0);
    }

    #[test]
    fn test_rewrite_same_value_is_deduped() {
        let set = test_set();
        set.write(0, 0, uniform(1));
        set.drain_pending();

        // 与已提交内容相同，不应产生新的 pending
        set.write(0, 0, uniform(1));
        assert_eq!(set.pending_count(), 0);

        // 内容变化则重新记录
        set.write(0, 0, uniform(2));
        assert_eq!(set.pending_count(), 1);
    }

    #[test]
    fn test_pending_overwrite_keeps_latest() {
        let set = test_set();
        set.write(0, 0, uniform(1));
        set.write(0, 0, uniform(2));

        let drained = set.drain_pending();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].1, uniform(2));
    }

    #[test]
    #[should_panic(expected = "does not exist in layout")]
    fn test_unknown_binding_panics() {
        let set = test_set();
        set.write(7, 0, uniform(1));
    }

    #[test]
    #[should_panic(expected = "expects")]
    fn test_type_mismatch_panics() {
        let set = test_set();
        set.write(1, 0, uniform(1));
    }

    #[test]
    #[should_panic(expected = "array index 4 out of range")]
    fn test_array_index_out_of_range_panics() {
        let set = test_set();
        set.write(1, 4, GfxDescriptorValue::CombinedImageSampler {
            view: vk::ImageView::from_raw(2),
            layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            sampler: vk::Sampler::from_raw(3),
        });
    }

    #[test]
    #[should_panic(expected = "exceeds binding capacity")]
    fn test_oversized_inline_uniform_panics() {
        let set = test_set();
        set.write(2, 0, GfxDescriptorValue::InlineUniform { data: vec![0u8; 128] });
    }

    #[test]
    #[should_panic(expected = "null sampler")]
    fn test_null_sampler_payload_panics() {
        let set = test_set();
        set.write(3, 0, GfxDescriptorValue::Sampler { sampler: vk::Sampler::null() });
    }

    #[test]
    #[should_panic(expected = "null buffer")]
    fn test_null_buffer_payload_panics() {
        let set = test_set();
        set.write(0, 0, GfxDescriptorValue::UniformBuffer {
            buffer: vk::Buffer::null(),
            offset: 0,
            range: vk::WHOLE_SIZE,
        });
    }

    #[test]
    #[should_panic(expected = "null image view")]
    fn test_null_view_payload_panics() {
        let set = test_set();
        set.write(1, 0, GfxDescriptorValue::CombinedImageSampler {
            view: vk::ImageView::null(),
            layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            sampler: vk::Sampler::from_raw(3),
        });
    }

    #[test]
    fn test_inline_uniform_within_capacity() {
        let set = test_set();
        set.write(2, 0, GfxDescriptorValue::InlineUniform { data: vec![0u8; 64] });
        assert_eq!(set.pending_count(), 1);
    }
}
