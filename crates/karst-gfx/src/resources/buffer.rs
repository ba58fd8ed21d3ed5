use std::{ffi::c_void, sync::Arc};

use ash::vk;

use crate::{
    allocator::{GfxAllocation, GfxMemAllocator},
    error::GfxResult,
    foundation::{debug_utils::DebugType, device::GfxDevice},
};

/// buffer 封装
///
/// 内存来自 [`GfxMemAllocator`] 的子分配；Drop 时销毁 handle 并归还内存。
pub struct GfxBuffer {
    handle: vk::Buffer,
    allocation: GfxAllocation,

    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    memory_flags: vk::MemoryPropertyFlags,

    debug_name: String,

    device: Arc<GfxDevice>,
    allocator: Arc<GfxMemAllocator>,
}

impl Drop for GfxBuffer {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_buffer(self.handle, None);
        }
        self.allocator.free(&self.allocation);
    }
}

// init
impl GfxBuffer {
    pub fn new(
        device: Arc<GfxDevice>,
        allocator: Arc<GfxMemAllocator>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        memory_flags: vk::MemoryPropertyFlags,
        debug_name: impl AsRef<str>,
    ) -> GfxResult<Self> {
        let buffer_ci = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let handle = unsafe { device.create_buffer(&buffer_ci, None)? };

        let requirements = unsafe { device.get_buffer_memory_requirements(handle) };
        let allocation = match allocator.alloc(&requirements, memory_flags, debug_name.as_ref()) {
            Ok(allocation) => allocation,
            Err(err) => {
                unsafe { device.destroy_buffer(handle, None) };
                return Err(err);
            }
        };
        unsafe {
            device.bind_buffer_memory(handle, allocation.memory(), allocation.offset())?;
        }

        let buffer = Self {
            handle,
            allocation,
            size,
            usage,
            memory_flags,
            debug_name: debug_name.as_ref().to_string(),
            device,
            allocator,
        };
        buffer.device.set_debug_name(&buffer, debug_name);
        Ok(buffer)
    }

    /// device local 的 buffer，数据需要通过 stage buffer 传入
    #[inline]
    pub fn new_device_buffer(
        device: Arc<GfxDevice>,
        allocator: Arc<GfxMemAllocator>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        debug_name: impl AsRef<str>,
    ) -> GfxResult<Self> {
        Self::new(
            device,
            allocator,
            size,
            usage | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            debug_name,
        )
    }

    #[inline]
    pub fn new_stage_buffer(
        device: Arc<GfxDevice>,
        allocator: Arc<GfxMemAllocator>,
        size: vk::DeviceSize,
        debug_name: impl AsRef<str>,
    ) -> GfxResult<Self> {
        Self::new(
            device,
            allocator,
            size,
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            debug_name,
        )
    }

    #[inline]
    pub fn new_vertex_buffer(
        device: Arc<GfxDevice>,
        allocator: Arc<GfxMemAllocator>,
        size: vk::DeviceSize,
        debug_name: impl AsRef<str>,
    ) -> GfxResult<Self> {
        Self::new_device_buffer(device, allocator, size, vk::BufferUsageFlags::VERTEX_BUFFER, debug_name)
    }

    #[inline]
    pub fn new_index_buffer(
        device: Arc<GfxDevice>,
        allocator: Arc<GfxMemAllocator>,
        size: vk::DeviceSize,
        debug_name: impl AsRef<str>,
    ) -> GfxResult<Self> {
        Self::new_device_buffer(device, allocator, size, vk::BufferUsageFlags::INDEX_BUFFER, debug_name)
    }

    /// host-visible 的 uniform buffer，可以直接 map 写入
    #[inline]
    pub fn new_uniform_buffer(
        device: Arc<GfxDevice>,
        allocator: Arc<GfxMemAllocator>,
        size: vk::DeviceSize,
        debug_name: impl AsRef<str>,
    ) -> GfxResult<Self> {
        Self::new(
            device,
            allocator,
            size,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            debug_name,
        )
    }
}

// getter
impl GfxBuffer {
    #[inline]
    pub fn handle(&self) -> vk::Buffer {
        self.handle
    }

    #[inline]
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    #[inline]
    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    #[inline]
    pub fn memory_flags(&self) -> vk::MemoryPropertyFlags {
        self.memory_flags
    }

    #[inline]
    pub fn debug_name(&self) -> &str {
        &self.debug_name
    }

    /// host-visible buffer 的持久映射指针
    #[inline]
    pub fn mapped_ptr(&self) -> *mut u8 {
        self.allocation
            .mapped_ptr()
            .unwrap_or_else(|| panic!("buffer {} is not host-visible, cannot be mapped", self.debug_name))
    }
}

// tools
impl GfxBuffer {
    /// 通过持久映射直接写入数据。仅限 host-visible 的 buffer
    ///
    /// 注：确保 buffer 内存的对齐方式和 T 保持一致
    pub fn write_data<T>(&mut self, data: &[T])
    where
        T: bytemuck::Pod,
    {
        let data_size = size_of_val(data) as vk::DeviceSize;
        assert!(data_size <= self.size, "data ({} bytes) exceeds buffer size ({} bytes)", data_size, self.size);

        unsafe {
            let mut slice = ash::util::Align::new(self.mapped_ptr() as *mut c_void, align_of::<T>() as u64, self.size);
            slice.copy_from_slice(data);
        }
    }
}

impl DebugType for GfxBuffer {
    fn debug_type_name() -> &'static str {
        "GfxBuffer"
    }
    fn vk_handle(&self) -> impl vk::Handle {
        self.handle
    }
}
