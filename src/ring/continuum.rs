//! Continuum Points and Lookup
//!
//! The continuum is a sorted array of `(hash, server index)` points. Each
//! server contributes a number of points proportional to its weight, placed
//! at `SHA1("<name>:<idx>")`. A key is hashed with CRC32 and owned by the
//! largest point whose hash does not exceed the key hash.

use sha1::{Digest, Sha1};

/// A single point on the continuum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
    pub hash: u32,
    /// Index into the ring's server list
    pub server: usize,
}

/// Sorted continuum points, read-only after construction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Continuum {
    entries: Vec<Entry>,
}

impl Continuum {
    /// Builds the continuum from `(name, weight)` pairs in server order.
    ///
    /// Each server receives
    /// `floor(points_per_server * servers * weight / total_weight)` points.
    pub fn build<'a, I>(servers: I, points_per_server: usize) -> Self
    where
        I: IntoIterator<Item = (&'a str, u32)>,
    {
        let servers: Vec<(&str, u32)> = servers.into_iter().collect();
        let total_weight: u64 = servers.iter().map(|&(_, w)| u64::from(w)).sum();
        if total_weight == 0 {
            return Self::default();
        }

        let count = servers.len() as u64;
        let per_server = points_per_server as u64;
        let mut entries = Vec::with_capacity(points_per_server * servers.len());

        for (server, &(name, weight)) in servers.iter().enumerate() {
            let points = per_server * count * u64::from(weight) / total_weight;
            for idx in 0..points {
                entries.push(Entry {
                    hash: point_hash(name, idx),
                    server,
                });
            }
        }

        // stable, so equal hashes keep server order
        entries.sort_by_key(|e| e.hash);
        Self { entries }
    }

    /// Returns the position of the largest entry with `hash <= target`,
    /// wrapping to the last entry when `target` is below every point.
    /// Returns `None` for an empty continuum.
    pub fn search(&self, target: u32) -> Option<usize> {
        if self.entries.is_empty() {
            return None;
        }

        let upper = self.entries.partition_point(|e| e.hash <= target);
        Some(match upper {
            0 => self.entries.len() - 1,
            n => n - 1,
        })
    }

    /// Returns the server owning `target`.
    pub fn server_for(&self, target: u32) -> Option<usize> {
        self.search(target).map(|pos| self.entries[pos].server)
    }

    /// Returns all points in ascending hash order.
    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// First 32 bits (big-endian) of `SHA1("<name>:<idx>")`.
pub fn point_hash(name: &str, idx: u64) -> u32 {
    let digest = Sha1::digest(format!("{}:{}", name, idx).as_bytes());
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// CRC32 of a key, as used for continuum lookups.
#[inline]
pub fn key_hash(key: &[u8]) -> u32 {
    crc32fast::hash(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear_search(entries: &[Entry], target: u32) -> usize {
        entries
            .iter()
            .rposition(|e| e.hash <= target)
            .unwrap_or(entries.len() - 1)
    }

    #[test]
    fn test_key_hash_is_crc32() {
        // standard CRC-32 check value
        assert_eq!(key_hash(b"123456789"), 0xCBF4_3926);
        assert_eq!(key_hash(b""), 0);
    }

    #[test]
    fn test_point_hash_is_sha1_prefix() {
        // SHA1("abc") = a9993e36...
        let digest = Sha1::digest(b"abc");
        assert_eq!(&digest[..4], &[0xa9, 0x99, 0x3e, 0x36]);

        assert_eq!(point_hash("a:11211", 0), point_hash("a:11211", 0));
        assert_ne!(point_hash("a:11211", 0), point_hash("a:11211", 1));
    }

    #[test]
    fn test_build_point_counts() {
        let continuum = Continuum::build([("a:1", 1), ("b:1", 1), ("c:1", 2)], 160);
        let mut counts = [0usize; 3];
        for e in continuum.entries() {
            counts[e.server] += 1;
        }
        // floor(160 * 3 * w / 4)
        assert_eq!(counts, [120, 120, 240]);
        assert!(continuum.entries().windows(2).all(|w| w[0].hash <= w[1].hash));
    }

    #[test]
    fn test_build_empty() {
        let continuum = Continuum::build(std::iter::empty(), 160);
        assert!(continuum.is_empty());
        assert_eq!(continuum.search(42), None);
    }

    #[test]
    fn test_search_wraps() {
        let continuum = Continuum {
            entries: vec![
                Entry { hash: 10, server: 0 },
                Entry { hash: 20, server: 1 },
                Entry { hash: 30, server: 2 },
            ],
        };

        assert_eq!(continuum.search(5), Some(2));
        assert_eq!(continuum.search(10), Some(0));
        assert_eq!(continuum.search(15), Some(0));
        assert_eq!(continuum.search(20), Some(1));
        assert_eq!(continuum.search(u32::MAX), Some(2));
        assert_eq!(continuum.server_for(0), Some(2));
    }

    #[test]
    fn test_search_ties_pick_last_equal() {
        let continuum = Continuum {
            entries: vec![
                Entry { hash: 10, server: 0 },
                Entry { hash: 20, server: 1 },
                Entry { hash: 20, server: 2 },
                Entry { hash: 30, server: 0 },
            ],
        };
        assert_eq!(continuum.search(20), Some(2));
        assert_eq!(continuum.search(25), Some(2));
    }

    #[test]
    fn test_search_matches_linear_scan() {
        let continuum = Continuum::build([("a:11211", 1), ("b:11211", 3), ("c:11211", 2)], 160);
        let entries = continuum.entries();

        let mut targets = vec![0, 1, u32::MAX, u32::MAX - 1];
        targets.push(entries[0].hash);
        targets.push(entries[0].hash.wrapping_sub(1));
        targets.push(entries[entries.len() - 1].hash);
        for e in entries.iter().step_by(7) {
            targets.push(e.hash);
            targets.push(e.hash.wrapping_add(1));
        }
        for i in 0..2000u32 {
            targets.push(key_hash(format!("key-{}", i).as_bytes()));
        }

        for target in targets {
            assert_eq!(
                continuum.search(target),
                Some(linear_search(entries, target)),
                "target {}",
                target
            );
        }
    }
}
