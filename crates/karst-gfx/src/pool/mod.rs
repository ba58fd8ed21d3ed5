//! signature 索引的资源池
//!
//! frame 之间复用临时的 buffer/image/descriptor set。
//! 资源通过 signature 精确匹配；借出的资源在 GPU 用完（fence 确认）之后
//! 才会回到空闲列表。

use std::{
    collections::HashMap,
    hash::Hash,
    sync::Arc,
};

use ash::vk;
use slotmap::SlotMap;

use crate::{
    descriptors::descriptor_set::GfxDescriptorSet,
    resources::{buffer::GfxBuffer, image::GfxImage},
};

slotmap::new_key_type! {
    /// 池内资源的带代数 handle；entry 被移除后旧 handle 会失效
    pub struct GfxPoolKey;
}

/// buffer 的复用签名。字段全部相等才能复用
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct GfxBufferSig {
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    pub memory_flags: vk::MemoryPropertyFlags,
}

/// image 的复用签名
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct GfxImageSig {
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub mip_count: u32,
    pub layer_count: u32,
    pub usage: vk::ImageUsageFlags,
}

/// descriptor set 的复用签名：layout 相同即可复用
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct GfxDescriptorSetSig {
    pub layout: vk::DescriptorSetLayout,
}

enum EntryState {
    /// 空闲，可以被 acquire；记录最后一次归还时的 frame 序号，用于老化淘汰
    Free { last_used_frame: u64 },
    /// 已借出，等待 give_back
    InUse,
}

struct PoolEntry<S, T> {
    sig: S,
    resource: Arc<T>,
    state: EntryState,
}

/// 通用的 signature 索引资源池
///
/// 同一 entry 同时只会借给一个使用者；归还与淘汰都以 handle 为凭证。
pub struct GfxResourcePool<S, T>
where
    S: Copy + Eq + Hash,
{
    entries: SlotMap<GfxPoolKey, PoolEntry<S, T>>,
    /// signature -> 空闲 entry 列表
    free: HashMap<S, Vec<GfxPoolKey>>,
}

pub type GfxBufferPool = GfxResourcePool<GfxBufferSig, GfxBuffer>;
pub type GfxImagePool = GfxResourcePool<GfxImageSig, GfxImage>;
pub type GfxDescriptorSetPool = GfxResourcePool<GfxDescriptorSetSig, GfxDescriptorSet>;

impl<S, T> Default for GfxResourcePool<S, T>
where
    S: Copy + Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<S, T> GfxResourcePool<S, T>
where
    S: Copy + Eq + Hash,
{
    pub fn new() -> Self {
        Self {
            entries: SlotMap::with_key(),
            free: HashMap::new(),
        }
    }

    /// 借出一个 signature 完全匹配的空闲资源
    ///
    /// 没有匹配的空闲资源时返回 None，由调用方新建并 [`Self::insert`]
    pub fn acquire(&mut self, sig: &S) -> Option<(GfxPoolKey, Arc<T>)> {
        let keys = self.free.get_mut(sig)?;
        let key = keys.pop()?;
        if keys.is_empty() {
            self.free.remove(sig);
        }

        let entry = &mut self.entries[key];
        debug_assert!(matches!(entry.state, EntryState::Free { .. }));
        entry.state = EntryState::InUse;
        Some((key, entry.resource.clone()))
    }

    /// 将新建的资源纳入池中，初始为借出状态
    pub fn insert(&mut self, sig: S, resource: Arc<T>) -> GfxPoolKey {
        self.entries.insert(PoolEntry {
            sig,
            resource,
            state: EntryState::InUse,
        })
    }

    /// 归还借出的资源
    ///
    /// 只能在 GPU 不再使用该资源之后调用（由 fence 确认）。
    /// 重复归还或使用失效的 handle 属于调用方 bug，直接 panic
    pub fn give_back(&mut self, key: GfxPoolKey, current_frame: u64) {
        let entry = self.entries.get_mut(key).expect("give_back with stale pool key");
        assert!(matches!(entry.state, EntryState::InUse), "resource returned twice");

        entry.state = EntryState::Free {
            last_used_frame: current_frame,
        };
        self.free.entry(entry.sig).or_default().push(key);
    }

    /// 淘汰长期未使用的空闲资源，返回被移除的资源（由调用方 drop 销毁）
    ///
    /// 借出中的资源不受影响
    pub fn purge(&mut self, current_frame: u64, max_age: u64) -> Vec<Arc<T>> {
        let mut evicted = Vec::new();
        self.entries.retain(|_, entry| match entry.state {
            EntryState::Free { last_used_frame } if current_frame.saturating_sub(last_used_frame) > max_age => {
                evicted.push(entry.resource.clone());
                false
            }
            _ => true,
        });

        if !evicted.is_empty() {
            let entries = &self.entries;
            for keys in self.free.values_mut() {
                keys.retain(|key| entries.contains_key(*key));
            }
            self.free.retain(|_, keys| !keys.is_empty());
            log::debug!("pool purge: evicted {} resources at frame {}", evicted.len(), current_frame);
        }
        evicted
    }

    /// 取出所有资源并清空池。shutdown 时使用
    pub fn drain(&mut self) -> Vec<Arc<T>> {
        self.free.clear();
        self.entries.drain().map(|(_, entry)| entry.resource).collect()
    }
}

// getter
impl<S, T> GfxResourcePool<S, T>
where
    S: Copy + Eq + Hash,
{
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    pub fn free_count(&self) -> usize {
        self.free.values().map(|keys| keys.len()).sum()
    }

    #[inline]
    pub fn contains(&self, key: GfxPoolKey) -> bool {
        self.entries.contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer_sig(size: vk::DeviceSize) -> GfxBufferSig {
        GfxBufferSig {
            size,
            usage: vk::BufferUsageFlags::UNIFORM_BUFFER,
            memory_flags: vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        }
    }

    #[test]
    fn test_miss_insert_give_back_hit() {
        let mut pool: GfxResourcePool<GfxBufferSig, String> = GfxResourcePool::new();
        let sig = buffer_sig(256);

        // 首次请求 miss
        assert!(pool.acquire(&sig).is_none());

        // 新建并入池，GPU 用完后归还
        let key = pool.insert(sig, Arc::new("staging-256".to_string()));
        pool.give_back(key, 3);

        // 之后的相同请求命中同一个资源
        let (hit_key, resource) = pool.acquire(&sig).unwrap();
        assert_eq!(hit_key, key);
        assert_eq!(resource.as_str(), "staging-256");
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_signature_must_match_exactly() {
        let mut pool: GfxResourcePool<GfxBufferSig, String> = GfxResourcePool::new();
        let key = pool.insert(buffer_sig(256), Arc::new("a".to_string()));
        pool.give_back(key, 0);

        // size 不同不能复用
        assert!(pool.acquire(&buffer_sig(512)).is_none());
        // usage 不同不能复用
        let mut other = buffer_sig(256);
        other.usage = vk::BufferUsageFlags::VERTEX_BUFFER;
        assert!(pool.acquire(&other).is_none());

        assert!(pool.acquire(&buffer_sig(256)).is_some());
    }

    #[test]
    fn test_entry_has_at_most_one_owner() {
        let mut pool: GfxResourcePool<GfxBufferSig, String> = GfxResourcePool::new();
        let sig = buffer_sig(64);
        let key = pool.insert(sig, Arc::new("a".to_string()));
        pool.give_back(key, 0);

        // 借出之后，同 signature 的第二次请求不能拿到同一个 entry
        let (first, _) = pool.acquire(&sig).unwrap();
        assert_eq!(first, key);
        assert!(pool.acquire(&sig).is_none());
    }

    #[test]
    #[should_panic(expected = "resource returned twice")]
    fn test_double_give_back_panics() {
        let mut pool: GfxResourcePool<GfxBufferSig, String> = GfxResourcePool::new();
        let key = pool.insert(buffer_sig(64), Arc::new("a".to_string()));
        pool.give_back(key, 0);
        pool.give_back(key, 0);
    }

    #[test]
    #[should_panic(expected = "stale pool key")]
    fn test_stale_key_detected_by_generation() {
        let mut pool: GfxResourcePool<GfxBufferSig, String> = GfxResourcePool::new();
        let sig = buffer_sig(64);
        let key = pool.insert(sig, Arc::new("a".to_string()));
        pool.give_back(key, 0);

        // purge 移除 entry 之后，旧 handle 必须失效
        pool.purge(100, 10);
        assert!(!pool.contains(key));
        pool.give_back(key, 100);
    }

    #[test]
    fn test_purge_evicts_only_old_free_entries() {
        let mut pool: GfxResourcePool<GfxBufferSig, String> = GfxResourcePool::new();

        let old = pool.insert(buffer_sig(64), Arc::new("old".to_string()));
        pool.give_back(old, 0);
        let fresh = pool.insert(buffer_sig(128), Arc::new("fresh".to_string()));
        pool.give_back(fresh, 9);
        let in_use = pool.insert(buffer_sig(256), Arc::new("in-use".to_string()));
        let _ = in_use;

        // max_age = 4：frame 0 归还的被淘汰，frame 9 的保留，借出中的不受影响
        let evicted = pool.purge(10, 4);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].as_str(), "old");
        assert_eq!(pool.len(), 2);
        assert!(!pool.contains(old));
        assert!(pool.contains(fresh));
        assert!(pool.contains(in_use));

        // 被保留的空闲 entry 仍然可以命中
        assert!(pool.acquire(&buffer_sig(128)).is_some());
    }

    #[test]
    fn test_drain_empties_pool() {
        let mut pool: GfxResourcePool<GfxBufferSig, String> = GfxResourcePool::new();
        let a = pool.insert(buffer_sig(64), Arc::new("a".to_string()));
        pool.give_back(a, 0);
        pool.insert(buffer_sig(128), Arc::new("b".to_string()));

        let drained = pool.drain();
        assert_eq!(drained.len(), 2);
        assert!(pool.is_empty());
        assert_eq!(pool.free_count(), 0);
    }
}
