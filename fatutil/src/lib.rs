// Library crate root: the binary in main.rs and the tests under tests/ both
// drive the tool through these modules.

pub mod command;
pub mod fat32;
pub mod human;
pub mod logger;
pub mod ops;
