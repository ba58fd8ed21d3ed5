//! memory block 内部的空闲区间管理
//!
//! 纯粹的区间运算，不涉及任何 vulkan 调用。
//! 空闲区间按 offset 升序存放，且互不相邻：释放时立即与相邻区间合并
//! (merge-on-free)，保证碎片数量不会随 free 次数单调增长。

use ash::vk;

/// 一段空闲区间 `[offset, offset + size)`
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FreeRange {
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
}

pub struct FreeList {
    capacity: vk::DeviceSize,
    /// 按 offset 升序；任意两段之间都有已分配的空隙
    ranges: Vec<FreeRange>,
}

impl FreeList {
    pub fn new(capacity: vk::DeviceSize) -> Self {
        Self {
            capacity,
            ranges: vec![FreeRange { offset: 0, size: capacity }],
        }
    }

    /// first-fit 分配
    ///
    /// 找到第一段「对齐后仍能容纳 size」的空闲区间，切出 `[aligned, aligned + size)`。
    /// 对齐产生的前部空隙和切剩的尾部都留在 free list 中。
    ///
    /// 区间数量在实际场景中很小，O(n) 扫描足够
    pub fn alloc(&mut self, size: vk::DeviceSize, align: vk::DeviceSize) -> Option<vk::DeviceSize> {
        debug_assert!(size > 0);
        debug_assert!(align.is_power_of_two());

        for i in 0..self.ranges.len() {
            let range = self.ranges[i];
            let aligned = range.offset.next_multiple_of(align);
            let end = aligned.checked_add(size)?;
            if end > range.offset + range.size {
                continue;
            }

            // 切出 [aligned, end)，最多留下前后两段残余
            let mut remainders = Vec::with_capacity(2);
            if aligned > range.offset {
                remainders.push(FreeRange {
                    offset: range.offset,
                    size: aligned - range.offset,
                });
            }
            if end < range.offset + range.size {
                remainders.push(FreeRange {
                    offset: end,
                    size: range.offset + range.size - end,
                });
            }
            self.ranges.splice(i..=i, remainders);

            return Some(aligned);
        }
        None
    }

    /// 释放 `[offset, offset + size)`，立即与相邻空闲区间合并
    pub fn free(&mut self, offset: vk::DeviceSize, size: vk::DeviceSize) {
        debug_assert!(size > 0);
        debug_assert!(offset + size <= self.capacity);

        // 找到第一个 offset 更大的空闲区间
        let next = self.ranges.partition_point(|r| r.offset < offset);

        // 被释放的区间不应与任何空闲区间重叠
        debug_assert!(next == 0 || {
            let prev = self.ranges[next - 1];
            prev.offset + prev.size <= offset
        });
        debug_assert!(next == self.ranges.len() || offset + size <= self.ranges[next].offset);

        let merge_prev = next > 0 && {
            let prev = self.ranges[next - 1];
            prev.offset + prev.size == offset
        };
        let merge_next = next < self.ranges.len() && offset + size == self.ranges[next].offset;

        match (merge_prev, merge_next) {
            (true, true) => {
                self.ranges[next - 1].size += size + self.ranges[next].size;
                self.ranges.remove(next);
            }
            (true, false) => self.ranges[next - 1].size += size,
            (false, true) => {
                self.ranges[next].offset = offset;
                self.ranges[next].size += size;
            }
            (false, false) => self.ranges.insert(next, FreeRange { offset, size }),
        }
    }
}

// getter
impl FreeList {
    #[inline]
    pub fn capacity(&self) -> vk::DeviceSize {
        self.capacity
    }

    /// 空闲字节总数
    #[inline]
    pub fn total_free(&self) -> vk::DeviceSize {
        self.ranges.iter().map(|r| r.size).sum()
    }

    /// 整个 block 是否没有任何存活分配
    #[inline]
    pub fn is_fully_free(&self) -> bool {
        self.ranges.len() == 1 && self.ranges[0].size == self.capacity
    }

    /// 空闲区间数量（碎片程度的粗略指标）
    #[inline]
    pub fn fragment_count(&self) -> usize {
        self.ranges.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_carves_from_front() {
        let mut list = FreeList::new(1024);
        assert_eq!(list.alloc(256, 1), Some(0));
        assert_eq!(list.alloc(256, 1), Some(256));
        assert_eq!(list.total_free(), 512);
    }

    #[test]
    fn test_no_overlap_under_churn() {
        let mut list = FreeList::new(4096);
        let mut live: Vec<(u64, u64)> = Vec::new();

        // 交替分配和释放不同大小，检查存活分配两两不相交
        let sizes = [64, 192, 32, 256, 128, 96, 512, 48];
        for (i, &size) in sizes.iter().cycle().take(64).enumerate() {
            if i % 3 == 2 && !live.is_empty() {
                let (offset, size) = live.remove(i % live.len());
                list.free(offset, size);
            } else if let Some(offset) = list.alloc(size, 16) {
                live.push((offset, size));
            }

            for (i, a) in live.iter().enumerate() {
                for b in &live[i + 1..] {
                    let disjoint = a.0 + a.1 <= b.0 || b.0 + b.1 <= a.0;
                    assert!(disjoint, "live allocations overlap: {:?} vs {:?}", a, b);
                }
            }
        }
    }

    #[test]
    fn test_merge_on_free_coalesces_adjacent() {
        let mut list = FreeList::new(1024);
        let a = list.alloc(512, 1).unwrap();
        let b = list.alloc(512, 1).unwrap();
        assert_eq!(list.total_free(), 0);

        // 释放两段相邻区间之后，必须能一次性分配出合并后的大小
        list.free(a, 512);
        list.free(b, 512);
        assert_eq!(list.fragment_count(), 1);
        assert_eq!(list.alloc(1024, 1), Some(0));
    }

    #[test]
    fn test_merge_with_both_neighbors() {
        let mut list = FreeList::new(768);
        let a = list.alloc(256, 1).unwrap();
        let b = list.alloc(256, 1).unwrap();
        let c = list.alloc(256, 1).unwrap();

        list.free(a, 256);
        list.free(c, 256);
        assert_eq!(list.fragment_count(), 2);

        // 中间一段释放后三段合并为一段
        list.free(b, 256);
        assert!(list.is_fully_free());
    }

    #[test]
    fn test_alignment_keeps_leading_gap_free() {
        let mut list = FreeList::new(1024);
        let _a = list.alloc(10, 1).unwrap();

        // 对齐到 256，前部空隙 [10, 256) 应该留在 free list 中
        let b = list.alloc(256, 256).unwrap();
        assert_eq!(b, 256);
        assert_eq!(b % 256, 0);

        // 前部空隙仍然可用
        let c = list.alloc(128, 2).unwrap();
        assert!(c >= 10 && c + 128 <= 256);
    }

    #[test]
    fn test_exhaustion_returns_none() {
        let mut list = FreeList::new(256);
        assert_eq!(list.alloc(256, 1), Some(0));
        assert_eq!(list.alloc(1, 1), None);
    }

    #[test]
    fn test_fragmentation_blocks_large_alloc() {
        // 已知限制：不做 compaction，总空闲量足够但没有连续区间时分配失败
        let mut list = FreeList::new(1024);
        let a = list.alloc(256, 1).unwrap();
        let _b = list.alloc(256, 1).unwrap();
        let c = list.alloc(256, 1).unwrap();
        let _d = list.alloc(256, 1).unwrap();

        list.free(a, 256);
        list.free(c, 256);
        assert_eq!(list.total_free(), 512);
        assert_eq!(list.alloc(512, 1), None);
    }
}
