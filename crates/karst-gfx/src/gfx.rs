//! GPU 资源层的入口
//!
//! [`Gfx`] 持有 instance/device/allocator/各类资源池，所有状态都归它所有，
//! 没有全局单例。多线程录制时每个线程使用自己的 command pool，
//! 提交通过内部的 queue 锁串行化。

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    thread::ThreadId,
};

use ash::vk;

use crate::{
    assets::GfxAssetRegistry,
    commands::{
        barrier::GfxBarrierMask,
        command_buffer::{GfxCommandBuffer, GfxTracked},
        command_pool::GfxCommandPool,
        fence::{GfxFence, GfxSemaphore},
    },
    descriptors::{
        descriptor_pool::GfxDescriptorPool,
        descriptor_set::GfxDescriptorSet,
        layout::GfxDescriptorSetLayout,
    },
    error::GfxResult,
    foundation::{
        debug_utils::GfxDebugUtils,
        device::GfxDevice,
        instance::GfxInstance,
        physical_device::GfxPhysicalDevice,
    },
    allocator::GfxMemAllocator,
    pool::{
        GfxBufferPool, GfxBufferSig, GfxDescriptorSetPool, GfxDescriptorSetSig, GfxImagePool, GfxImageSig, GfxPoolKey,
    },
    resources::{buffer::GfxBuffer, image::GfxImage},
};

/// 池中空闲资源超过这个帧数没有被使用就会被淘汰
const POOL_MAX_AGE: u64 = 60;

/// descriptor pool 的容量配置
const MAX_DESCRIPTOR_SETS: u32 = 1024;

/// 已提交、等待 GPU 执行完毕的一次 submission
struct GfxInFlight {
    recorder: GfxCommandBuffer,
    /// execute 的调用方也持有一份，用于单次 submission 的等待
    fence: Arc<GfxFence>,
    /// recorder 所属的录制线程，归还时放回该线程的空闲列表
    origin_thread: ThreadId,
}

pub struct Gfx {
    /// entry 持有 vulkan loader，必须活得比 instance 久
    _vk_entry: ash::Entry,
    instance: GfxInstance,
    debug_utils: GfxDebugUtils,
    physical_device: GfxPhysicalDevice,
    device: Arc<GfxDevice>,
    allocator: Arc<GfxMemAllocator>,

    /// graphics queue。提交通过锁串行化
    queue: Mutex<vk::Queue>,

    buffer_pool: Mutex<GfxBufferPool>,
    image_pool: Mutex<GfxImagePool>,
    descriptor_set_pool: Mutex<GfxDescriptorSetPool>,
    descriptor_pool: GfxDescriptorPool,

    /// 每个录制线程自己的 command pool
    command_pools: Mutex<HashMap<ThreadId, Arc<GfxCommandPool>>>,
    /// 每个线程可复用的空闲 recorder
    free_recorders: Mutex<HashMap<ThreadId, Vec<GfxCommandBuffer>>>,

    in_flight: Mutex<Vec<GfxInFlight>>,

    frame_index: AtomicU64,

    assets: GfxAssetRegistry,
}

// init & destroy
impl Gfx {
    pub fn new(app_name: impl AsRef<str>) -> GfxResult<Self> {
        let vk_entry = unsafe { ash::Entry::load() }.expect("Failed to load vulkan entry");
        let instance = GfxInstance::new(&vk_entry, app_name.as_ref().to_string(), "karst".to_string());
        let debug_utils = GfxDebugUtils::new(&vk_entry, instance.ash_instance());
        let physical_device = GfxPhysicalDevice::new_discrete_physical_device(instance.ash_instance());
        let device = Arc::new(GfxDevice::new(instance.ash_instance(), &physical_device));
        let allocator = Arc::new(GfxMemAllocator::new(device.clone(), physical_device.memory_properties));

        let queue = unsafe { device.get_device_queue(device.graphics_queue_family_index(), 0) };
        device.set_object_debug_name(queue, "graphics-queue");

        let pool_sizes = [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: 2048,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_BUFFER,
                descriptor_count: 2048,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                descriptor_count: 4096,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::SAMPLED_IMAGE,
                descriptor_count: 2048,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_IMAGE,
                descriptor_count: 1024,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::SAMPLER,
                descriptor_count: 256,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::INLINE_UNIFORM_BLOCK,
                descriptor_count: 64 * 1024,
            },
        ];
        let descriptor_pool = GfxDescriptorPool::new(device.clone(), MAX_DESCRIPTOR_SETS, &pool_sizes, "gfx")?;

        log::info!("Gfx initialized: {}", app_name.as_ref());

        Ok(Self {
            _vk_entry: vk_entry,
            instance,
            debug_utils,
            physical_device,
            device,
            allocator,
            queue: Mutex::new(queue),
            buffer_pool: Mutex::new(GfxBufferPool::new()),
            image_pool: Mutex::new(GfxImagePool::new()),
            descriptor_set_pool: Mutex::new(GfxDescriptorSetPool::new()),
            descriptor_pool,
            command_pools: Mutex::new(HashMap::new()),
            free_recorders: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(Vec::new()),
            frame_index: AtomicU64::new(0),
            assets: GfxAssetRegistry::new(),
        })
    }

    /// 按依赖的反序销毁所有对象
    ///
    /// 会先等待所有已提交的 submission 完成
    pub fn destroy(self) -> GfxResult<()> {
        self.wait_all()?;

        self.assets.clear();
        self.buffer_pool.lock().unwrap().drain();
        self.image_pool.lock().unwrap().drain();
        self.descriptor_set_pool.lock().unwrap().drain();
        self.free_recorders.lock().unwrap().clear();
        self.command_pools.lock().unwrap().clear();
        self.descriptor_pool.destroy();

        let allocator = Arc::into_inner(self.allocator).expect("allocator still referenced at shutdown");
        allocator.destroy();
        let device = Arc::into_inner(self.device).expect("device still referenced at shutdown");
        device.destroy();
        self.debug_utils.destroy();
        self.instance.destroy();
        Ok(())
    }
}

// getter
impl Gfx {
    #[inline]
    pub fn device(&self) -> &Arc<GfxDevice> {
        &self.device
    }

    #[inline]
    pub fn physical_device(&self) -> &GfxPhysicalDevice {
        &self.physical_device
    }

    #[inline]
    pub fn allocator(&self) -> &Arc<GfxMemAllocator> {
        &self.allocator
    }

    #[inline]
    pub fn assets(&self) -> &GfxAssetRegistry {
        &self.assets
    }

    #[inline]
    pub fn current_frame(&self) -> u64 {
        self.frame_index.load(Ordering::Relaxed)
    }
}

// frame 管理
impl Gfx {
    /// 推进 frame 序号，回收完成的 submission，淘汰池中老化的资源
    pub fn begin_frame(&self) -> GfxResult<()> {
        let _span = tracy_client::span!("Gfx::begin_frame");

        let frame = self.frame_index.fetch_add(1, Ordering::Relaxed) + 1;
        self.poll_completed()?;

        let evicted_buffers = self.buffer_pool.lock().unwrap().purge(frame, POOL_MAX_AGE);
        let evicted_images = self.image_pool.lock().unwrap().purge(frame, POOL_MAX_AGE);
        // descriptor set 不占显存，不做老化淘汰
        drop(evicted_buffers);
        drop(evicted_images);
        Ok(())
    }
}

// 资源池
impl Gfx {
    /// 从池中借出（或新建）一个 buffer
    pub fn acquire_buffer(&self, sig: GfxBufferSig, debug_name: impl AsRef<str>) -> GfxResult<(GfxPoolKey, Arc<GfxBuffer>)> {
        if let Some(hit) = self.buffer_pool.lock().unwrap().acquire(&sig) {
            return Ok(hit);
        }

        // 池中没有匹配的，新建一个。创建不在池锁内进行
        let buffer = Arc::new(GfxBuffer::new(
            self.device.clone(),
            self.allocator.clone(),
            sig.size,
            sig.usage,
            sig.memory_flags,
            debug_name,
        )?);
        let key = self.buffer_pool.lock().unwrap().insert(sig, buffer.clone());
        Ok((key, buffer))
    }

    /// 从池中借出（或新建）一个 image
    pub fn acquire_image(&self, sig: GfxImageSig, debug_name: impl AsRef<str>) -> GfxResult<(GfxPoolKey, Arc<GfxImage>)> {
        if let Some(hit) = self.image_pool.lock().unwrap().acquire(&sig) {
            return Ok(hit);
        }

        let image = Arc::new(GfxImage::new(
            self.device.clone(),
            self.allocator.clone(),
            sig.format,
            sig.extent,
            sig.mip_count,
            sig.layer_count,
            sig.usage,
            debug_name,
        )?);
        let key = self.image_pool.lock().unwrap().insert(sig, image.clone());
        Ok((key, image))
    }

    /// 从池中借出（或新分配）一个 descriptor set
    pub fn acquire_descriptor_set(
        &self,
        layout: &GfxDescriptorSetLayout,
    ) -> GfxResult<(GfxPoolKey, Arc<GfxDescriptorSet>)> {
        let sig = GfxDescriptorSetSig { layout: layout.handle() };
        if let Some(hit) = self.descriptor_set_pool.lock().unwrap().acquire(&sig) {
            return Ok(hit);
        }

        let handle = self.descriptor_pool.alloc_set(layout.handle())?;
        let set = Arc::new(GfxDescriptorSet::new(handle, layout));
        let key = self.descriptor_set_pool.lock().unwrap().insert(sig, set.clone());
        Ok((key, set))
    }
}

// command buffer 与提交
impl Gfx {
    /// 取得一个可录制的 command buffer
    ///
    /// 优先复用当前线程已回收的 recorder，否则从当前线程的 pool 分配
    pub fn get_command_buffer(&self, debug_name: impl AsRef<str>) -> GfxResult<GfxCommandBuffer> {
        let thread = std::thread::current().id();
        if let Some(mut recorder) = self.free_recorders.lock().unwrap().get_mut(&thread).and_then(Vec::pop) {
            recorder.rename(debug_name);
            return Ok(recorder);
        }

        let pool = self.thread_command_pool(thread)?;
        let handle = pool.alloc_command_buffer(debug_name.as_ref())?;
        Ok(GfxCommandBuffer::new(self.device.clone(), handle, debug_name))
    }

    fn thread_command_pool(&self, thread: ThreadId) -> GfxResult<Arc<GfxCommandPool>> {
        let mut pools = self.command_pools.lock().unwrap();
        if let Some(pool) = pools.get(&thread) {
            return Ok(pool.clone());
        }

        let pool = Arc::new(GfxCommandPool::new(
            self.device.clone(),
            self.device.graphics_queue_family_index(),
            format!("cmd-pool-{:?}", thread),
        )?);
        pools.insert(thread, pool.clone());
        Ok(pool)
    }

    /// 提交已录制完成的 recorder，返回这一次 submission 的 fence
    ///
    /// recorder 引用的资源会保持存活（池资源保持借出），直到 fence
    /// 确认 GPU 执行完毕
    pub fn execute(
        &self,
        mut recorder: GfxCommandBuffer,
        waits: &[(&GfxSemaphore, vk::PipelineStageFlags2)],
        signals: &[&GfxSemaphore],
    ) -> GfxResult<Arc<GfxFence>> {
        let _span = tracy_client::span!("Gfx::execute");

        recorder.mark_submitted();
        let fence = Arc::new(GfxFence::new(self.device.clone(), false, format!("{}-done", recorder.debug_name()))?);

        let cb_info = vk::CommandBufferSubmitInfo::default().command_buffer(recorder.handle());
        let wait_infos = waits
            .iter()
            .map(|(semaphore, stage)| {
                vk::SemaphoreSubmitInfo::default().semaphore(semaphore.handle()).stage_mask(*stage)
            })
            .collect::<Vec<_>>();
        let signal_infos = signals
            .iter()
            .map(|semaphore| {
                vk::SemaphoreSubmitInfo::default()
                    .semaphore(semaphore.handle())
                    .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
            })
            .collect::<Vec<_>>();
        let submit_info = vk::SubmitInfo2::default()
            .command_buffer_infos(std::slice::from_ref(&cb_info))
            .wait_semaphore_infos(&wait_infos)
            .signal_semaphore_infos(&signal_infos);

        {
            let queue = self.queue.lock().unwrap();
            unsafe {
                self.device.queue_submit2(*queue, std::slice::from_ref(&submit_info), fence.handle())?;
            }
        }

        self.in_flight.lock().unwrap().push(GfxInFlight {
            recorder,
            fence: fence.clone(),
            origin_thread: std::thread::current().id(),
        });
        Ok(fence)
    }

    /// 阻塞等待单次 submission 完成并回收
    ///
    /// 只等待 [`Self::execute`] 返回的那一个 fence，其他线程在途的
    /// submission 不受影响
    pub fn wait_submission(&self, fence: &GfxFence) -> GfxResult<()> {
        fence.wait()?;
        self.poll_completed()
    }

    /// 放弃一个未提交的 recorder，立即归还它引用的池资源
    pub fn abandon(&self, mut recorder: GfxCommandBuffer) {
        let tracked = recorder.abandon();
        self.give_back_tracked(tracked, self.current_frame());

        let thread = std::thread::current().id();
        self.free_recorders.lock().unwrap().entry(thread).or_default().push(recorder);
    }

    /// 回收所有 fence 已经 signaled 的 submission。非阻塞
    pub fn poll_completed(&self) -> GfxResult<()> {
        let frame = self.current_frame();
        let mut in_flight = self.in_flight.lock().unwrap();

        let mut i = 0;
        while i < in_flight.len() {
            if in_flight[i].fence.is_signaled()? {
                let entry = in_flight.swap_remove(i);
                self.reclaim(entry, frame);
            } else {
                i += 1;
            }
        }
        Ok(())
    }

    /// 阻塞等待所有已提交的 submission 完成并回收
    pub fn wait_all(&self) -> GfxResult<()> {
        let frame = self.current_frame();
        let mut in_flight = self.in_flight.lock().unwrap();

        for entry in in_flight.drain(..) {
            entry.fence.wait()?;
            self.reclaim(entry, frame);
        }
        Ok(())
    }

    fn reclaim(&self, mut entry: GfxInFlight, frame: u64) {
        let tracked = entry.recorder.on_complete();
        self.give_back_tracked(tracked, frame);
        self.free_recorders.lock().unwrap().entry(entry.origin_thread).or_default().push(entry.recorder);
    }

    /// 池资源回到空闲列表；Arc 资源的引用计数减一
    fn give_back_tracked(&self, tracked: Vec<GfxTracked>, frame: u64) {
        for item in tracked {
            match item {
                GfxTracked::PooledBuffer(key) => self.buffer_pool.lock().unwrap().give_back(key, frame),
                GfxTracked::PooledImage(key) => self.image_pool.lock().unwrap().give_back(key, frame),
                GfxTracked::PooledDescriptorSet(key) => {
                    self.descriptor_set_pool.lock().unwrap().give_back(key, frame)
                }
                GfxTracked::Buffer(_) | GfxTracked::Image(_) => {}
            }
        }
    }

    /// 录制并立即提交执行，阻塞到这一次 submission 完成
    pub fn one_time_exec(
        &self,
        debug_name: impl AsRef<str>,
        record: impl FnOnce(&mut GfxCommandBuffer),
    ) -> GfxResult<()> {
        let mut recorder = self.get_command_buffer(debug_name)?;
        recorder.begin(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
        record(&mut recorder);
        recorder.end()?;
        let fence = self.execute(recorder, &[], &[])?;
        self.wait_submission(&fence)
    }
}

// 数据上传
impl Gfx {
    /// 经由 stage buffer 将数据同步上传到 device local 的 buffer
    pub fn upload_to_buffer<T: bytemuck::Pod>(&self, dst: &Arc<GfxBuffer>, data: &[T]) -> GfxResult<()> {
        let mut stage = GfxBuffer::new_stage_buffer(
            self.device.clone(),
            self.allocator.clone(),
            size_of_val(data) as vk::DeviceSize,
            format!("{}-stage", dst.debug_name()),
        )?;
        stage.write_data(data);
        let stage = Arc::new(stage);

        self.one_time_exec(format!("{}-upload", dst.debug_name()), |cmd| {
            cmd.copy_buffer(&stage, dst, &[vk::BufferCopy {
                src_offset: 0,
                dst_offset: 0,
                size: size_of_val(data) as vk::DeviceSize,
            }]);
            // transfer 写入对后续的任何读取可见
            cmd.buffer_barrier(
                dst,
                GfxBarrierMask {
                    src_stage: vk::PipelineStageFlags2::TRANSFER,
                    src_access: vk::AccessFlags2::TRANSFER_WRITE,
                    dst_stage: vk::PipelineStageFlags2::ALL_COMMANDS,
                    dst_access: vk::AccessFlags2::MEMORY_READ,
                },
                0,
                vk::WHOLE_SIZE,
            );
        })
    }

    /// 将像素数据同步上传到 image 的 mip 0，可选生成完整 mip chain
    ///
    /// 结束后整张 image 处于 SHADER_READ_ONLY_OPTIMAL
    pub fn upload_to_image(&self, dst: &Arc<GfxImage>, data: &[u8], generate_mips: bool) -> GfxResult<()> {
        let mut stage = GfxBuffer::new_stage_buffer(
            self.device.clone(),
            self.allocator.clone(),
            data.len() as vk::DeviceSize,
            format!("{}-stage", dst.debug_name()),
        )?;
        stage.write_data(data);
        let stage = Arc::new(stage);

        self.one_time_exec(format!("{}-upload", dst.debug_name()), |cmd| {
            cmd.transition_image_all(dst, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
            cmd.copy_buffer_to_image(&stage, dst, 0);
            if generate_mips && dst.mip_count() > 1 {
                cmd.generate_mipmaps(dst);
            } else {
                cmd.transition_image_all(dst, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
            }
        })
    }
}
