pub mod ram_disk;

pub use self::ram_disk::RamDisk;
