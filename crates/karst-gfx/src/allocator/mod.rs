//! device memory 的子分配器
//!
//! 以大块 `vk::DeviceMemory` 为单位向驱动申请内存，内部用 free list 切分给
//! buffer/image 使用，避免大量小额的 `vkAllocateMemory` 调用。
//! block 创建后不会收缩，也不做 compaction；碎片化导致的分配失败直接向上报告。

use std::sync::{Arc, Mutex};

use ash::vk;

use crate::{
    error::{GfxError, GfxResult},
    foundation::device::GfxDevice,
};

mod free_list;

pub use free_list::FreeList;

/// 每个 memory block 的默认大小。单次分配超过该值时，block 按需放大
pub const DEFAULT_BLOCK_SIZE: vk::DeviceSize = 64 * 1024 * 1024;

/// 一次子分配的结果
///
/// 记录了所在 block 的 memory handle 以及在 block 内的偏移，
/// 足以用于 `vkBindBufferMemory`/`vkBindImageMemory`。
#[derive(Clone, Debug)]
pub struct GfxAllocation {
    memory: vk::DeviceMemory,
    offset: vk::DeviceSize,
    size: vk::DeviceSize,

    memory_type_index: u32,
    block_index: usize,

    /// block 整体 persistent map 之后，本分配对应的指针；非 host-visible 时为 null
    mapped_ptr: *mut u8,

    /// 诊断用途，标记这块内存属于哪个资源
    tag: String,
}

// mapped_ptr 指向的区间由本分配独占，跨线程传递是安全的
unsafe impl Send for GfxAllocation {}
unsafe impl Sync for GfxAllocation {}

impl GfxAllocation {
    #[inline]
    pub fn memory(&self) -> vk::DeviceMemory {
        self.memory
    }

    #[inline]
    pub fn offset(&self) -> vk::DeviceSize {
        self.offset
    }

    #[inline]
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    /// host-visible 内存的映射指针
    #[inline]
    pub fn mapped_ptr(&self) -> Option<*mut u8> {
        if self.mapped_ptr.is_null() { None } else { Some(self.mapped_ptr) }
    }

    #[inline]
    pub fn tag(&self) -> &str {
        &self.tag
    }
}

/// 一大块 `vk::DeviceMemory`
struct MemoryBlock {
    memory: vk::DeviceMemory,
    size: vk::DeviceSize,

    /// host-visible 的 block 在创建时整体映射，直到销毁才 unmap
    mapped_base: *mut u8,

    free_list: FreeList,
    allocation_count: u32,
}

unsafe impl Send for MemoryBlock {}

pub struct GfxMemAllocator {
    device: Arc<GfxDevice>,
    memory_props: vk::PhysicalDeviceMemoryProperties,

    default_block_size: vk::DeviceSize,

    /// 按 memory type index 分组的 block 列表。
    /// block 只增不减，因此 `GfxAllocation::block_index` 始终有效
    blocks: Mutex<Vec<Vec<MemoryBlock>>>,
}

// init & destroy
impl GfxMemAllocator {
    pub fn new(device: Arc<GfxDevice>, memory_props: vk::PhysicalDeviceMemoryProperties) -> Self {
        let type_count = memory_props.memory_type_count as usize;
        Self {
            device,
            memory_props,
            default_block_size: DEFAULT_BLOCK_SIZE,
            blocks: Mutex::new((0..type_count).map(|_| Vec::new()).collect()),
        }
    }

    /// 释放所有 block。存活的分配说明有资源泄漏，记录 warning
    pub fn destroy(self) {
        log::info!("destroying GfxMemAllocator");
        let blocks = self.blocks.into_inner().unwrap();
        for (type_index, type_blocks) in blocks.into_iter().enumerate() {
            for block in type_blocks {
                if block.allocation_count != 0 {
                    log::warn!(
                        "memory type {} still has {} live allocations at shutdown",
                        type_index,
                        block.allocation_count
                    );
                }
                unsafe {
                    if !block.mapped_base.is_null() {
                        self.device.unmap_memory(block.memory);
                    }
                    self.device.free_memory(block.memory, None);
                }
            }
        }
    }
}

// tools
impl GfxMemAllocator {
    /// 从满足 `memory_flags` 的 memory type 中切出一块满足 `requirements` 的内存
    pub fn alloc(
        &self,
        requirements: &vk::MemoryRequirements,
        memory_flags: vk::MemoryPropertyFlags,
        tag: impl AsRef<str>,
    ) -> GfxResult<GfxAllocation> {
        let _span = tracy_client::span!("GfxMemAllocator::alloc");

        let type_index = find_memory_type(&self.memory_props, requirements.memory_type_bits, memory_flags).ok_or(
            GfxError::NoCompatibleMemoryType {
                type_bits: requirements.memory_type_bits,
                required: memory_flags,
            },
        )?;

        let mut blocks = self.blocks.lock().unwrap();
        let type_blocks = &mut blocks[type_index as usize];

        // first-fit：遍历已有 block
        for (block_index, block) in type_blocks.iter_mut().enumerate() {
            if let Some(offset) = block.free_list.alloc(requirements.size, requirements.alignment) {
                block.allocation_count += 1;
                return Ok(self.make_allocation(block, block_index, type_index, offset, requirements.size, tag));
            }
        }

        // 现有 block 都放不下，新建一个
        let block_size = self.default_block_size.max(requirements.size);
        let mut block = self.create_block(type_index, block_size)?;
        let offset = block
            .free_list
            .alloc(requirements.size, requirements.alignment)
            .expect("fresh block cannot satisfy allocation");
        block.allocation_count += 1;

        let block_index = type_blocks.len();
        let allocation = self.make_allocation(&block, block_index, type_index, offset, requirements.size, tag);
        type_blocks.push(block);
        Ok(allocation)
    }

    /// 归还一次分配。由资源的 Drop 调用
    pub fn free(&self, allocation: &GfxAllocation) {
        let mut blocks = self.blocks.lock().unwrap();
        let block = &mut blocks[allocation.memory_type_index as usize][allocation.block_index];
        debug_assert_eq!(block.memory, allocation.memory);

        block.free_list.free(allocation.offset, allocation.size);
        block.allocation_count -= 1;
    }

    fn create_block(&self, type_index: u32, size: vk::DeviceSize) -> GfxResult<MemoryBlock> {
        let alloc_info = vk::MemoryAllocateInfo::default().allocation_size(size).memory_type_index(type_index);
        let memory = unsafe {
            self.device.allocate_memory(&alloc_info, None).map_err(|err| match err {
                vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
                    GfxError::OutOfDeviceMemory {
                        size,
                        memory_type: type_index,
                    }
                }
                other => GfxError::Vulkan(other),
            })?
        };

        // host-visible 的 block 整体做 persistent map
        let host_visible = self.memory_props.memory_types[type_index as usize]
            .property_flags
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE);
        let mapped_base = if host_visible {
            unsafe { self.device.map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())? as *mut u8 }
        } else {
            std::ptr::null_mut()
        };

        log::debug!("new memory block: type {}, size {}", type_index, size);

        Ok(MemoryBlock {
            memory,
            size,
            mapped_base,
            free_list: FreeList::new(size),
            allocation_count: 0,
        })
    }

    fn make_allocation(
        &self,
        block: &MemoryBlock,
        block_index: usize,
        type_index: u32,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
        tag: impl AsRef<str>,
    ) -> GfxAllocation {
        let mapped_ptr = if block.mapped_base.is_null() {
            std::ptr::null_mut()
        } else {
            unsafe { block.mapped_base.add(offset as usize) }
        };
        GfxAllocation {
            memory: block.memory,
            offset,
            size,
            memory_type_index: type_index,
            block_index,
            mapped_ptr,
            tag: tag.as_ref().to_string(),
        }
    }
}

// getter
impl GfxMemAllocator {
    /// 每种 memory type 下所有 block 的 (总容量, 空闲字节)
    pub fn memory_usage(&self) -> Vec<(u32, vk::DeviceSize, vk::DeviceSize)> {
        let blocks = self.blocks.lock().unwrap();
        blocks
            .iter()
            .enumerate()
            .filter(|(_, type_blocks)| !type_blocks.is_empty())
            .map(|(type_index, type_blocks)| {
                let capacity = type_blocks.iter().map(|b| b.size).sum();
                let free = type_blocks.iter().map(|b| b.free_list.total_free()).sum();
                (type_index as u32, capacity, free)
            })
            .collect()
    }
}

/// 找到同时满足 `type_bits` 和 `required` 属性的 memory type
pub(crate) fn find_memory_type(
    props: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
) -> Option<u32> {
    (0..props.memory_type_count).find(|&i| {
        let type_supported = type_bits & (1 << i) != 0;
        let flags_supported = props.memory_types[i as usize].property_flags.contains(required);
        type_supported && flags_supported
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_memory_props() -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties::default();
        props.memory_type_count = 3;
        props.memory_types[0] = vk::MemoryType {
            property_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
            heap_index: 0,
        };
        props.memory_types[1] = vk::MemoryType {
            property_flags: vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            heap_index: 1,
        };
        props.memory_types[2] = vk::MemoryType {
            property_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL
                | vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_COHERENT,
            heap_index: 0,
        };
        props
    }

    #[test]
    fn test_find_memory_type_picks_first_match() {
        let props = fake_memory_props();

        assert_eq!(find_memory_type(&props, 0b111, vk::MemoryPropertyFlags::DEVICE_LOCAL), Some(0));
        assert_eq!(find_memory_type(&props, 0b111, vk::MemoryPropertyFlags::HOST_VISIBLE), Some(1));
        assert_eq!(
            find_memory_type(
                &props,
                0b111,
                vk::MemoryPropertyFlags::DEVICE_LOCAL | vk::MemoryPropertyFlags::HOST_VISIBLE
            ),
            Some(2)
        );
    }

    #[test]
    fn test_find_memory_type_respects_type_bits() {
        let props = fake_memory_props();

        // type 0 被 type_bits 排除时，应该跳过
        assert_eq!(find_memory_type(&props, 0b110, vk::MemoryPropertyFlags::DEVICE_LOCAL), Some(2));
        assert_eq!(find_memory_type(&props, 0b001, vk::MemoryPropertyFlags::HOST_VISIBLE), None);
    }
}
