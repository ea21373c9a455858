//! Statistics Module
//!
//! Tracks read/write hit and miss counts and the number of spilled elements.

use std::io;

use bytes::{Buf, BufMut};
use serde::Serialize;

use super::wire;

// == Statistics ==
/// Plain accumulators kept per table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Statistics {
    /// Reads served from a live element
    pub read_hits: u64,
    /// Reads that found nothing usable
    pub read_misses: u64,
    /// Writes that replaced an existing element
    pub write_hits: u64,
    /// Writes that created a new key
    pub write_misses: u64,
    /// Elements whose value currently lives in secondary storage
    pub on_disk: u64,
}

impl Statistics {
    // == Constructor ==
    /// Creates a new Statistics with all counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    // == Ratios ==
    /// Returns read_hits / (read_hits + read_misses), or 0.0 with no reads.
    pub fn read_hit_ratio(&self) -> f64 {
        ratio(self.read_hits, self.read_misses)
    }

    /// Returns write_hits / (write_hits + write_misses), or 0.0 with no writes.
    pub fn write_hit_ratio(&self) -> f64 {
        ratio(self.write_hits, self.write_misses)
    }

    pub fn record_read_hit(&mut self) {
        self.read_hits += 1;
    }

    pub fn record_read_miss(&mut self) {
        self.read_misses += 1;
    }

    pub fn record_write_hit(&mut self) {
        self.write_hits += 1;
    }

    pub fn record_write_miss(&mut self) {
        self.write_misses += 1;
    }

    pub fn record_stored(&mut self) {
        self.on_disk += 1;
    }

    pub fn record_restored(&mut self) {
        self.on_disk = self.on_disk.saturating_sub(1);
    }

    /// Zeroes every counter.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    // == Wire ==
    /// Writes the five counters in fixed order.
    pub fn write_wire(&self, buf: &mut impl BufMut) {
        buf.put_u64(self.read_hits);
        buf.put_u64(self.read_misses);
        buf.put_u64(self.write_hits);
        buf.put_u64(self.write_misses);
        buf.put_u64(self.on_disk);
    }

    pub fn read_wire(buf: &mut impl Buf) -> io::Result<Self> {
        Ok(Self {
            read_hits: read_count(buf)?,
            read_misses: read_count(buf)?,
            write_hits: read_count(buf)?,
            write_misses: read_count(buf)?,
            on_disk: read_count(buf)?,
        })
    }
}

fn read_count(buf: &mut impl Buf) -> io::Result<u64> {
    let raw = wire::get_i64(buf)?;
    u64::try_from(raw)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, format!("negative counter {}", raw)))
}

fn ratio(hits: u64, misses: u64) -> f64 {
    let total = hits + misses;
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64
    }
}
