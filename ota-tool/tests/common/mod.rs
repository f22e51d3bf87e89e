#![allow(dead_code)]

use std::path::Path;

use ota_tool::Config;

/// A 256 KiB device with 64 KiB application, download and backup partitions.
pub const CONFIG: &str = r#"
[[device]]
name = "spi0"
capacity = 0x40000
erase_size = 4096

[[partition]]
name = "bootloader"
device = "spi0"
offset = 0x0
len = 0x8000

[[partition]]
name = "app"
device = "spi0"
offset = 0x8000
len = 0x10000

[[partition]]
name = "download"
device = "spi0"
offset = 0x18000
len = 0x10000

[[partition]]
name = "backup"
device = "spi0"
offset = 0x28000
len = 0x10000

[[partition]]
name = "bootloader_crc"
device = "spi0"
offset = 0x38000
len = 0x1000

[[partition]]
name = "ota_record"
device = "spi0"
offset = 0x39000
len = 0x2000
"#;

pub const CAPACITY: usize = 0x40000;
pub const APP: usize = 0x8000;
pub const APP_LEN: usize = 0x10000;
pub const BACKUP: usize = 0x28000;

pub fn config() -> Config {
    Config::parse(CONFIG).unwrap()
}

/// Deterministic pseudo random bytes.
pub fn pattern(seed: u32, len: usize) -> Vec<u8> {
    let mut state = seed.wrapping_mul(0x9e37_79b9) | 1;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state as u8
        })
        .collect()
}

/// The application every test starts from.
pub fn legacy_app() -> Vec<u8> {
    pattern(2, APP_LEN)
}

/// Write a dump of `spi0` holding the legacy application into `dir`.
pub fn write_dump(dir: &Path) {
    let mut data = vec![0xFF; CAPACITY];
    data[APP..APP + APP_LEN].copy_from_slice(&legacy_app());
    std::fs::write(dir.join("spi0.bin"), data).unwrap();
}
