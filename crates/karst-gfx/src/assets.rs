//! 长生命周期资源的注册表
//!
//! 按应用定义的 key 存放共享的 buffer/image。
//! 注册表归 [`crate::gfx::Gfx`] 所有，不是全局单例。

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use crate::resources::{buffer::GfxBuffer, image::GfxImage};

/// 注册表中的资源
#[derive(Clone)]
pub enum GfxAsset {
    Buffer(Arc<GfxBuffer>),
    Image(Arc<GfxImage>),
}

impl GfxAsset {
    /// 期望是 buffer；类型不符属于调用方 bug
    pub fn expect_buffer(&self) -> Arc<GfxBuffer> {
        match self {
            Self::Buffer(buffer) => buffer.clone(),
            Self::Image(image) => panic!("asset is an image ({}), not a buffer", image.debug_name()),
        }
    }

    pub fn expect_image(&self) -> Arc<GfxImage> {
        match self {
            Self::Image(image) => image.clone(),
            Self::Buffer(buffer) => panic!("asset is a buffer ({}), not an image", buffer.debug_name()),
        }
    }
}

#[derive(Default)]
pub struct GfxAssetRegistry {
    entries: Mutex<HashMap<u64, GfxAsset>>,
}

impl GfxAssetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: u64, asset: GfxAsset) {
        let old = self.entries.lock().unwrap().insert(key, asset);
        if old.is_some() {
            log::warn!("asset key {} was overwritten", key);
        }
    }

    pub fn get(&self, key: u64) -> Option<GfxAsset> {
        self.entries.lock().unwrap().get(&key).cloned()
    }

    /// 不存在时用 `create` 构造并登记
    pub fn get_or_insert_with<E>(&self, key: u64, create: impl FnOnce() -> Result<GfxAsset, E>) -> Result<GfxAsset, E> {
        let mut entries = self.entries.lock().unwrap();
        if let Some(asset) = entries.get(&key) {
            return Ok(asset.clone());
        }
        let asset = create()?;
        entries.insert(key, asset.clone());
        Ok(asset)
    }

    pub fn remove(&self, key: u64) -> Option<GfxAsset> {
        self.entries.lock().unwrap().remove(&key)
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }
}
