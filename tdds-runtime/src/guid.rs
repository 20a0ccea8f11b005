//! Process-unique GUID prefix.

use rand::Rng;
use std::fmt;
use tdds_kernel::time::now_time;

/// Vendor byte carried in the first prefix position.
const VENDOR_BYTE: u8 = 0x01;

/// The 12-byte GUID prefix shared by every entity of this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GuidPrefix(pub [u8; 12]);

impl GuidPrefix {
    /// Derive a prefix from the process id, startup time and fresh
    /// entropy. Unique per process with overwhelming probability.
    pub fn generate() -> GuidPrefix {
        let mut p = [0u8; 12];
        let pid = std::process::id();
        let secs = now_time().seconds as u32;
        let noise: u32 = rand::thread_rng().gen();
        p[0] = VENDOR_BYTE;
        p[1..4].copy_from_slice(&pid.to_be_bytes()[1..]);
        p[4..8].copy_from_slice(&secs.to_be_bytes());
        p[8..12].copy_from_slice(&noise.to_be_bytes());
        GuidPrefix(p)
    }
}

impl fmt::Display for GuidPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, b) in self.0.iter().enumerate() {
            if i > 0 && i % 4 == 0 {
                write!(f, ":")?;
            }
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}
