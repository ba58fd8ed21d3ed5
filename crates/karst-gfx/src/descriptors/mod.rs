pub mod descriptor_pool;
pub mod descriptor_set;
pub mod layout;
