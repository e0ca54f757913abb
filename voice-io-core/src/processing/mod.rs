pub mod levels;
pub mod ring_buffer;
pub mod sample_format;
