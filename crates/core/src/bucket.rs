//! Bucket allocation planning.
//!
//! Decides where the next range of an isolation group goes. The caller is
//! responsible for reading the latest group instance and its usage, and for
//! persisting the plan under a lock on the group name; see the allocator in
//! `hatch-engine`.
//!
//! Ranges are packed left to right within the latest instance. A request
//! that does not fit pages over to a fresh instance starting at offset 0.
//!
//! This does not account for collisions between *different* isolation
//! groups that hash the same randomization unit. Only non-overlap within a
//! single group instance is guaranteed.

use crate::types::{BucketRange, IsolationGroup, RandomizationUnit};

/// Size of the hash space of a newly created group instance.
pub const DEFAULT_TOTAL_CAPACITY: u32 = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BucketError {
    #[error("requested {count} buckets but a group instance only holds {capacity}")]
    ExceedsCapacity { count: u32, capacity: u32 },

    #[error("group {name}-{instance} reports {used} buckets used, above its capacity {capacity}")]
    CorruptUsage {
        name: String,
        instance: u32,
        used: u32,
        capacity: u32,
    },
}

/// Where a new range goes, and whether its group instance must be created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationPlan {
    pub group: IsolationGroup,
    pub create_group: bool,
    pub start: u32,
    pub count: u32,
}

impl AllocationPlan {
    pub fn into_range(self, experiment: impl Into<String>) -> (IsolationGroup, BucketRange) {
        let range = BucketRange {
            group_name: self.group.name.clone(),
            group_instance: self.group.instance,
            start: self.start,
            count: self.count,
            experiment: experiment.into(),
        };
        (self.group, range)
    }
}

/// Number of buckets for a population percentage.
pub fn requested_count(population_fraction: f64, total_capacity: u32) -> u32 {
    let raw = (population_fraction / 100.0 * f64::from(total_capacity)).round();
    raw.clamp(0.0, f64::from(total_capacity)) as u32
}

/// Total buckets already taken in one group instance.
pub fn used_buckets(ranges: &[BucketRange]) -> u32 {
    ranges.iter().map(|r| r.count).sum()
}

/// Plan a range of `count` buckets.
///
/// `latest` is the highest-numbered instance of the group together with the
/// buckets already used in it, or `None` if the group does not exist yet.
pub fn plan_allocation(
    name: &str,
    randomization_unit: RandomizationUnit,
    total_capacity: u32,
    latest: Option<(&IsolationGroup, u32)>,
    count: u32,
) -> Result<AllocationPlan, BucketError> {
    let Some((group, used)) = latest else {
        check_fits(count, total_capacity)?;
        return Ok(AllocationPlan {
            group: IsolationGroup {
                name: name.to_string(),
                instance: 1,
                total_capacity,
                randomization_unit,
            },
            create_group: true,
            start: 0,
            count,
        });
    };

    if used > group.total_capacity {
        return Err(BucketError::CorruptUsage {
            name: group.name.clone(),
            instance: group.instance,
            used,
            capacity: group.total_capacity,
        });
    }

    if count <= group.total_capacity - used {
        return Ok(AllocationPlan {
            group: group.clone(),
            create_group: false,
            start: used,
            count,
        });
    }

    check_fits(count, total_capacity)?;
    Ok(AllocationPlan {
        group: IsolationGroup {
            name: group.name.clone(),
            instance: group.instance + 1,
            total_capacity,
            randomization_unit: group.randomization_unit,
        },
        create_group: true,
        start: 0,
        count,
    })
}

fn check_fits(count: u32, capacity: u32) -> Result<(), BucketError> {
    if count > capacity {
        Err(BucketError::ExceedsCapacity { count, capacity })
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn apply(
        groups: &mut Vec<(IsolationGroup, Vec<BucketRange>)>,
        plan: AllocationPlan,
        experiment: &str,
    ) -> BucketRange {
        let create = plan.create_group;
        let (group, range) = plan.into_range(experiment);
        if create {
            groups.push((group, Vec::new()));
        }
        let slot = groups
            .iter_mut()
            .find(|(g, _)| g.instance == range.group_instance)
            .expect("group exists");
        slot.1.push(range.clone());
        range
    }

    fn allocate(
        groups: &mut Vec<(IsolationGroup, Vec<BucketRange>)>,
        count: u32,
        experiment: &str,
    ) -> Result<BucketRange, BucketError> {
        let latest = groups
            .iter()
            .max_by_key(|(g, _)| g.instance)
            .map(|(g, ranges)| (g, used_buckets(ranges)));
        let plan = plan_allocation(
            "exp-a",
            RandomizationUnit::NormandyId,
            DEFAULT_TOTAL_CAPACITY,
            latest,
            count,
        )?;
        Ok(apply(groups, plan, experiment))
    }

    #[test]
    fn first_allocation_creates_instance_one() {
        let plan = plan_allocation("exp-a", RandomizationUnit::UserId, 10_000, None, 7000).unwrap();
        assert!(plan.create_group);
        assert_eq!(plan.group.instance, 1);
        assert_eq!(plan.start, 0);
        assert_eq!(plan.group.namespace(), "exp-a-1");
    }

    #[test]
    fn overflow_pages_to_next_instance() {
        let mut groups = Vec::new();
        let first = allocate(&mut groups, 7000, "a").unwrap();
        assert_eq!((first.group_instance, first.start, first.end()), (1, 0, 6999));

        let second = allocate(&mut groups, 4000, "b").unwrap();
        assert_eq!((second.group_instance, second.start, second.end()), (2, 0, 3999));

        // Instance 1 still has 3000 free, but only the latest instance is packed.
        let third = allocate(&mut groups, 3000, "c").unwrap();
        assert_eq!((third.group_instance, third.start), (2, 4000));
    }

    #[test]
    fn exact_fit_stays_in_instance() {
        let mut groups = Vec::new();
        allocate(&mut groups, 6000, "a").unwrap();
        let second = allocate(&mut groups, 4000, "b").unwrap();
        assert_eq!((second.group_instance, second.start), (1, 6000));
    }

    #[test]
    fn oversized_request_rejected() {
        assert_eq!(
            plan_allocation("g", RandomizationUnit::NimbusId, 10_000, None, 10_001),
            Err(BucketError::ExceedsCapacity {
                count: 10_001,
                capacity: 10_000
            })
        );
    }

    #[test]
    fn requested_count_rounds() {
        assert_eq!(requested_count(50.0, 10_000), 5000);
        assert_eq!(requested_count(0.01, 10_000), 1);
        assert_eq!(requested_count(0.004, 10_000), 0);
        assert_eq!(requested_count(100.0, 10_000), 10_000);
        assert_eq!(requested_count(33.333, 1000), 333);
    }

    proptest! {
        #[test]
        fn ranges_never_overlap(counts in proptest::collection::vec(0u32..=10_000, 1..40)) {
            let mut groups = Vec::new();
            for (i, count) in counts.iter().enumerate() {
                allocate(&mut groups, *count, &format!("exp-{i}")).unwrap();
            }

            for (group, ranges) in &groups {
                prop_assert!(used_buckets(ranges) <= group.total_capacity);
                for (i, a) in ranges.iter().enumerate() {
                    prop_assert!(a.start + a.count <= group.total_capacity);
                    for b in &ranges[i + 1..] {
                        prop_assert!(!a.overlaps(b), "{a:?} overlaps {b:?}");
                    }
                }
            }

            // Instances are numbered 1..=n without gaps, and every new instance
            // opens at offset 0.
            for (idx, (group, ranges)) in groups.iter().enumerate() {
                prop_assert_eq!(group.instance as usize, idx + 1);
                prop_assert_eq!(ranges[0].start, 0);
            }
        }
    }
}
