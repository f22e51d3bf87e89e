pub mod objcopy;
pub mod package;
pub mod simulate;
