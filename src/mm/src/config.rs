use std::path::Path;

use anyhow::{bail, Context};
use mem::{is_page_aligned, AddrRange};
use pgcache::PageCacheOpts;
use platform::Platform;
use serde::{Deserialize, Serialize};

/// Tunables of the memory subsystem. Every field is optional in the JSON
/// form; missing ones take their default.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MmConfig {
    /// Capacity of the host frame pool.
    pub frames: u64,
    /// Reclaim unmapped regions immediately instead of leaving them for an
    /// explicit scavenge.
    pub eager_scavenge: bool,
    pub evict_batch: usize,
    pub lru_high_watermark: usize,
    /// `[lower, upper)` of user address spaces.
    pub user_bounds: (u64, u64),
    pub kernel_bounds: (u64, u64),
}

impl Default for MmConfig {
    fn default() -> Self {
        let platform = Platform::Soft;
        let user = platform.user_range();
        let kernel = platform.kernel_range();
        let cache = PageCacheOpts::default();
        Self {
            frames: 4096,
            eager_scavenge: true,
            evict_batch: cache.evict_batch,
            lru_high_watermark: cache.lru_high_watermark,
            user_bounds: (user.start, user.end),
            kernel_bounds: (kernel.start, kernel.end),
        }
    }
}

impl MmConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)
            .with_context(|| format!("failed to open config {:?}", path))?;
        let config: Self = serde_json::from_reader(&file)
            .with_context(|| format!("Failed to load MmConfig from {:?}", path))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.frames == 0 {
            bail!("frames must be positive");
        }
        if self.evict_batch == 0 {
            bail!("evictBatch must be positive");
        }
        for (name, range) in [("user", self.user_range()), ("kernel", self.kernel_range())] {
            if range.is_empty() || !range.is_well_formed() {
                bail!("{} bounds {:?} are invalid", name, range);
            }
            if !is_page_aligned(range.start) || !is_page_aligned(range.end) {
                bail!("{} bounds {:?} are not page aligned", name, range);
            }
        }
        Ok(())
    }

    pub fn user_range(&self) -> AddrRange {
        AddrRange {
            start: self.user_bounds.0,
            end: self.user_bounds.1,
        }
    }

    pub fn kernel_range(&self) -> AddrRange {
        AddrRange {
            start: self.kernel_bounds.0,
            end: self.kernel_bounds.1,
        }
    }

    pub fn page_cache_opts(&self) -> PageCacheOpts {
        PageCacheOpts {
            evict_batch: self.evict_batch,
            lru_high_watermark: self.lru_high_watermark,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn write_config(name: &str, body: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("mm-config-{}-{}", name, std::process::id()));
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(body.as_bytes()).unwrap();
        path
    }

    #[test]
    fn defaults() {
        let c = MmConfig::default();
        assert_eq!(c.frames, 4096);
        assert!(c.eager_scavenge);
        assert_eq!(c.evict_batch, 32);
        assert_eq!(c.lru_high_watermark, 1024);
        assert_eq!(c.user_bounds.1, 0x7ffffffff000);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn load_fills_missing_fields() {
        let path = write_config(
            "partial",
            r#"{ "frames": 64, "eagerScavenge": false, "userBounds": [4096, 65536] }"#,
        );
        let c = MmConfig::load(&path).expect("failed to load config");
        std::fs::remove_file(&path).unwrap();
        assert_eq!(c.frames, 64);
        assert!(!c.eager_scavenge);
        assert_eq!(
            c.user_range(),
            AddrRange {
                start: 0x1000,
                end: 0x10000
            }
        );
        assert_eq!(c.evict_batch, MmConfig::default().evict_batch);
    }

    #[test]
    fn load_rejects_bad_values() {
        for (name, body) in &[
            ("zero-frames", r#"{ "frames": 0 }"#),
            ("unaligned", r#"{ "userBounds": [4097, 65536] }"#),
            ("inverted", r#"{ "kernelBounds": [65536, 4096] }"#),
            ("garbage", "not json"),
        ] {
            let path = write_config(name, body);
            assert!(MmConfig::load(&path).is_err(), "{} accepted", name);
            std::fs::remove_file(&path).unwrap();
        }
        assert!(MmConfig::load("/nonexistent/mm-config.json").is_err());
    }
}
