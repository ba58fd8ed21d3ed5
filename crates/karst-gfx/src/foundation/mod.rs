pub mod debug_utils;
pub mod device;
pub mod instance;
pub mod physical_device;
