//! Vulkan GPU 资源层
//!
//! 提供显存子分配、buffer/image 封装、signature 索引的资源池、
//! descriptor 写入和 command buffer 录制与提交的统一管理。
//! 所有状态都归 [`gfx::Gfx`] 实例所有，没有全局单例。

pub mod allocator;
pub mod assets;
pub mod basic;
pub mod commands;
pub mod descriptors;
pub mod error;
pub mod foundation;
pub mod gfx;
pub mod pool;
pub mod resources;
