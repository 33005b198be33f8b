// file: src/system/entropy.rs
// version: 1.0.0
// guid: 6f7a8b9c-0d1e-4f2a-8b3c-4d5e6f7a8b9c

//! Kernel entropy pool seeding

use crate::Result;
use rand::rngs::OsRng;
use rand::RngCore;
use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const MAX_ROUNDS: usize = 16;
const BLOCK_SIZE: usize = 4096;

/// Feeds the kernel entropy pool and persists seeds across boots
pub struct EntropySeeder {
    root: PathBuf,
    seed_size: usize,
}

impl EntropySeeder {
    pub fn new<P: Into<PathBuf>>(root: P, seed_size: usize) -> Self {
        Self {
            root: root.into(),
            seed_size,
        }
    }

    fn proc_value(&self, name: &str) -> Option<u64> {
        let path = self.root.join("proc/sys/kernel/random").join(name);
        std::fs::read_to_string(path).ok()?.trim().parse().ok()
    }

    fn satisfied(&self) -> bool {
        match (
            self.proc_value("entropy_avail"),
            self.proc_value("read_wakeup_threshold"),
        ) {
            (Some(avail), Some(threshold)) => avail >= threshold,
            // Kernels without the threshold knob block only until init
            _ => true,
        }
    }

    fn feed(&self, data: &[u8]) -> Result<()> {
        for dev in ["dev/random", "dev/urandom"] {
            let path = self.root.join(dev);
            let mut file = OpenOptions::new().append(true).open(&path)?;
            file.write_all(data)?;
        }
        Ok(())
    }

    /// Write the saved seed (if any) into the kernel pool, then top it up
    /// from the OS RNG for a bounded number of rounds
    pub fn seed_from(&self, seed_file: Option<&Path>) -> Result<()> {
        if let Some(path) = seed_file {
            match std::fs::read(path) {
                Ok(seed) => {
                    self.feed(&seed)?;
                    info!("entropy seeded from {} ({} bytes)", path.display(), seed.len());
                }
                Err(e) => warn!("cannot read seed file {}: {}", path.display(), e),
            }
        }

        let mut block = vec![0u8; BLOCK_SIZE];
        for round in 0..MAX_ROUNDS {
            if self.satisfied() {
                debug!("entropy pool satisfied after {} round(s)", round);
                return Ok(());
            }
            OsRng.fill_bytes(&mut block);
            self.feed(&block)?;
        }
        warn!("entropy pool still below wakeup threshold");
        Ok(())
    }

    /// Persist a fresh seed readable only by root
    pub fn write_seed(&self, path: &Path) -> Result<()> {
        let mut seed = vec![0u8; self.seed_size];
        OsRng.fill_bytes(&mut seed);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)?;
        file.write_all(&seed)?;
        file.sync_all()?;
        info!("random seed written to {}", path.display());
        Ok(())
    }
}
