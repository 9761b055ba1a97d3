pub mod fs_atomic;
pub mod ids;
