use std::{
    ffi::CStr,
    ops::Deref,
};

use ash::vk;
use itertools::Itertools;

use crate::foundation::{debug_utils::DebugType, physical_device::GfxPhysicalDevice};

/// 逻辑设备封装
///
/// 持有 ash 的设备函数指针集合以及 debug utils 的 device 侧函数。
/// 函数指针在整个应用生命周期中保持不变，可以安全地在多个线程间共享。
pub struct GfxDevice {
    pub(crate) device: ash::Device,
    /// 调试工具扩展 API（device 侧）
    pub(crate) debug_utils: ash::ext::debug_utils::Device,

    pub(crate) graphics_queue_family_index: u32,
}

// 构造与销毁
impl GfxDevice {
    pub fn new(instance: &ash::Instance, pdevice: &GfxPhysicalDevice) -> Self {
        let graphics_queue_family_index = pdevice
            .find_queue_family_index(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER)
            .expect("no queue family supports graphics + compute + transfer");

        let queue_priorities = [1.0_f32];
        let queue_create_info = [vk::DeviceQueueCreateInfo::default()
            .queue_family_index(graphics_queue_family_index)
            .queue_priorities(&queue_priorities)];

        // device 所需的所有 extension
        let device_exts = Self::basic_device_exts().iter().map(|e| e.as_ptr()).collect_vec();
        let mut exts_str = String::new();
        for ext in &device_exts {
            exts_str.push_str(&format!("\n\t{:?}", unsafe { CStr::from_ptr(*ext) }));
        }
        log::info!("device exts: {}", exts_str);

        let basic_features = vk::PhysicalDeviceFeatures::default().sampler_anisotropy(true);
        let mut sync2_features = vk::PhysicalDeviceSynchronization2Features::default().synchronization2(true);
        let mut inline_uniform_features =
            vk::PhysicalDeviceInlineUniformBlockFeatures::default().inline_uniform_block(true);
        let mut all_features = vk::PhysicalDeviceFeatures2::default()
            .features(basic_features)
            .push_next(&mut sync2_features)
            .push_next(&mut inline_uniform_features);

        let device_create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_info)
            .enabled_extension_names(&device_exts)
            .push_next(&mut all_features);

        let device = unsafe { instance.create_device(pdevice.handle, &device_create_info, None).unwrap() };
        let debug_utils = ash::ext::debug_utils::Device::new(instance, &device);

        Self {
            device,
            debug_utils,
            graphics_queue_family_index,
        }
    }

    pub fn destroy(self) {
        log::info!("destroying GfxDevice");
        unsafe {
            self.device.destroy_device(None);
        }
    }

    /// 必要的 device extensions
    fn basic_device_exts() -> Vec<&'static CStr> {
        vec![ash::khr::synchronization2::NAME]
    }
}

// getter
impl GfxDevice {
    #[inline]
    pub fn ash_handle(&self) -> &ash::Device {
        &self.device
    }

    #[inline]
    pub fn vk_handle(&self) -> vk::Device {
        self.device.handle()
    }

    #[inline]
    pub fn graphics_queue_family_index(&self) -> u32 {
        self.graphics_queue_family_index
    }
}

// tools
impl GfxDevice {
    #[inline]
    pub fn set_object_debug_name<T: vk::Handle>(&self, handle: T, name: impl AsRef<str>) {
        let name = std::ffi::CString::new(name.as_ref()).unwrap();
        unsafe {
            self.debug_utils
                .set_debug_utils_object_name(
                    &vk::DebugUtilsObjectNameInfoEXT::default().object_name(name.as_c_str()).object_handle(handle),
                )
                .unwrap();
        }
    }

    pub fn set_debug_name<T: DebugType>(&self, handle: &T, name: impl AsRef<str>) {
        let debug_name = format!("{}::{}", T::debug_type_name(), name.as_ref());
        self.set_object_debug_name(handle.vk_handle(), debug_name);
    }

    #[inline]
    pub fn cmd_begin_debug_label(&self, command_buffer: vk::CommandBuffer, label_name: impl AsRef<str>, label_color: glam::Vec4) {
        let name = std::ffi::CString::new(label_name.as_ref()).unwrap();
        unsafe {
            self.debug_utils.cmd_begin_debug_utils_label(
                command_buffer,
                &vk::DebugUtilsLabelEXT::default().label_name(name.as_c_str()).color(label_color.into()),
            );
        }
    }

    #[inline]
    pub fn cmd_end_debug_label(&self, command_buffer: vk::CommandBuffer) {
        unsafe {
            self.debug_utils.cmd_end_debug_utils_label(command_buffer);
        }
    }

    #[inline]
    pub fn cmd_insert_debug_label(&self, command_buffer: vk::CommandBuffer, label_name: impl AsRef<str>, label_color: glam::Vec4) {
        let name = std::ffi::CString::new(label_name.as_ref()).unwrap();
        unsafe {
            self.debug_utils.cmd_insert_debug_utils_label(
                command_buffer,
                &vk::DebugUtilsLabelEXT::default().label_name(name.as_c_str()).color(label_color.into()),
            );
        }
    }
}

impl Deref for GfxDevice {
    type Target = ash::Device;
    fn deref(&self) -> &Self::Target {
        &self.device
    }
}

impl DebugType for GfxDevice {
    fn debug_type_name() -> &'static str {
        "GfxDevice"
    }
    fn vk_handle(&self) -> impl vk::Handle {
        self.device.handle()
    }
}
