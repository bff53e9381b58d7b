//! Virtual to physical partition mapping
//!
//! Virtual partitions are packed into physical partitions in contiguous blocks
//! of `R = V / P`:
//!
//! ```text
//! V = 100, P = 10, R = 10
//!
//! virtual   0..=9   -> physical 0
//! virtual  10..=19  -> physical 1
//! ...
//! virtual  90..=99  -> physical 9
//! ```
//!
//! The mapping is a pure function of `(V, P)`. Every proxy replica computes the
//! same assignment without coordination, and restarting a replica never moves a
//! virtual partition.

use std::ops::Range;

use crate::error::{Error, Result};

/// Physical partition that owns `virtual_partition` for the given ratio.
pub fn physical_partition_for(virtual_partition: i32, ratio: i32) -> i32 {
    virtual_partition / ratio
}

/// Virtual partitions packed into `physical_partition` for the given ratio.
pub fn virtual_partitions_for(physical_partition: i32, ratio: i32) -> Range<i32> {
    let first = physical_partition * ratio;
    first..first + ratio
}

/// Validated `(V, P)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PartitionMapping {
    virtual_partitions: i32,
    physical_partitions: i32,
}

impl PartitionMapping {
    /// Build a mapping, rejecting counts where `P` does not divide `V`.
    pub fn new(virtual_partitions: i32, physical_partitions: i32) -> Result<Self> {
        if physical_partitions <= 0 {
            return Err(Error::ConfigInvariantViolation(format!(
                "physical partition count must be positive, got {}",
                physical_partitions
            )));
        }
        if virtual_partitions <= 0 {
            return Err(Error::ConfigInvariantViolation(format!(
                "virtual partition count must be positive, got {}",
                virtual_partitions
            )));
        }
        if virtual_partitions % physical_partitions != 0 {
            return Err(Error::ConfigInvariantViolation(format!(
                "virtual partition count {} is not divisible by physical partition count {}",
                virtual_partitions, physical_partitions
            )));
        }

        Ok(Self {
            virtual_partitions,
            physical_partitions,
        })
    }

    pub fn virtual_partitions(&self) -> i32 {
        self.virtual_partitions
    }

    pub fn physical_partitions(&self) -> i32 {
        self.physical_partitions
    }

    /// Number of virtual partitions sharing one physical partition.
    pub fn ratio(&self) -> i32 {
        self.virtual_partitions / self.physical_partitions
    }

    pub fn contains_virtual(&self, virtual_partition: i32) -> bool {
        (0..self.virtual_partitions).contains(&virtual_partition)
    }

    pub fn physical_partition_for(&self, virtual_partition: i32) -> Result<i32> {
        if !self.contains_virtual(virtual_partition) {
            return Err(Error::InvalidPartition {
                partition: virtual_partition,
                limit: self.virtual_partitions,
            });
        }
        Ok(physical_partition_for(virtual_partition, self.ratio()))
    }

    pub fn virtual_partitions_for(&self, physical_partition: i32) -> Result<Range<i32>> {
        if !(0..self.physical_partitions).contains(&physical_partition) {
            return Err(Error::InvalidPartition {
                partition: physical_partition,
                limit: self.physical_partitions,
            });
        }
        Ok(virtual_partitions_for(physical_partition, self.ratio()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ratio_and_blocks() {
        let mapping = PartitionMapping::new(100, 10).unwrap();
        assert_eq!(mapping.ratio(), 10);

        for physical in 0..10 {
            let block = mapping.virtual_partitions_for(physical).unwrap();
            assert_eq!(block.len(), 10);
            assert_eq!(block.start, physical * 10);
            for v in block {
                assert_eq!(mapping.physical_partition_for(v).unwrap(), physical);
            }
        }

        assert_eq!(mapping.virtual_partitions_for(0).unwrap(), 0..10);
        assert_eq!(mapping.virtual_partitions_for(9).unwrap(), 90..100);
    }

    #[test]
    fn test_independent_mappings_agree() {
        let a = PartitionMapping::new(100, 10).unwrap();
        let b = PartitionMapping::new(100, 10).unwrap();
        assert_eq!(a.physical_partition_for(55).unwrap(), 5);
        assert_eq!(b.physical_partition_for(55).unwrap(), 5);
        for v in 0..100 {
            assert_eq!(
                a.physical_partition_for(v).unwrap(),
                b.physical_partition_for(v).unwrap()
            );
        }
    }

    #[test]
    fn test_out_of_range_virtual_partition() {
        let mapping = PartitionMapping::new(100, 10).unwrap();
        assert!(matches!(
            mapping.physical_partition_for(100),
            Err(Error::InvalidPartition {
                partition: 100,
                limit: 100
            })
        ));
        assert!(mapping.physical_partition_for(-1).is_err());
        assert!(mapping.virtual_partitions_for(10).is_err());
    }

    #[test]
    fn test_not_divisible_is_rejected() {
        let err = PartitionMapping::new(100, 7).unwrap_err();
        assert!(matches!(err, Error::ConfigInvariantViolation(_)));
        assert!(err.to_string().contains("not divisible"));
    }

    #[test]
    fn test_non_positive_counts_are_rejected() {
        assert!(PartitionMapping::new(10, 0).is_err());
        assert!(PartitionMapping::new(0, 10).is_err());
        assert!(PartitionMapping::new(-10, 5).is_err());
    }

    #[test]
    fn test_identity_ratio() {
        let mapping = PartitionMapping::new(6, 6).unwrap();
        assert_eq!(mapping.ratio(), 1);
        assert_eq!(mapping.physical_partition_for(4).unwrap(), 4);
        assert_eq!(mapping.virtual_partitions_for(4).unwrap(), 4..5);
    }

    #[test]
    fn test_free_functions() {
        assert_eq!(physical_partition_for(42, 10), 4);
        assert_eq!(virtual_partitions_for(4, 10), 40..50);
    }
}
