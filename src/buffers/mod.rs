pub mod buffer;
pub mod composite_buffer;
