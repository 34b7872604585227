//! Spreads a pool-level replica count evenly over availability zones.

/// Per-zone autoscaling bounds.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ZoneBounds {
    pub min: i32,
    pub max: i32,
}

/// Splits `total` into `buckets` shares that differ by at most one, with the
/// first `total % buckets` shares getting the larger value.
pub fn apportion(total: i32, buckets: usize) -> Vec<i32> {
    if buckets == 0 {
        return Vec::new();
    }
    let buckets_i = buckets as i32;
    let base = total / buckets_i;
    let remainder = (total % buckets_i) as usize;
    (0..buckets)
        .map(|i| if i < remainder { base + 1 } else { base })
        .collect()
}

/// Apportions autoscaling bounds independently per zone. A skewed remainder
/// can hand a zone a larger minimum share than its maximum share; the
/// maximum is clamped up so every zone satisfies `min <= max`.
pub fn zone_bounds(min_total: i32, max_total: i32, zones: usize) -> Vec<ZoneBounds> {
    let mins = apportion(min_total, zones);
    let maxes = apportion(max_total, zones);
    mins.into_iter()
        .zip(maxes)
        .map(|(min, max)| ZoneBounds {
            min,
            max: max.max(min),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(5, 3, vec![2, 2, 1])]
    #[case(6, 3, vec![2, 2, 2])]
    #[case(1, 3, vec![1, 0, 0])]
    #[case(0, 3, vec![0, 0, 0])]
    #[case(7, 1, vec![7])]
    #[case(4, 6, vec![1, 1, 1, 1, 0, 0])]
    fn shares_sum_and_differ_by_at_most_one(
        #[case] total: i32,
        #[case] buckets: usize,
        #[case] expected: Vec<i32>,
    ) {
        let shares = apportion(total, buckets);
        assert_eq!(shares, expected);
        assert_eq!(shares.iter().sum::<i32>(), total);
        let max = shares.iter().max().unwrap();
        let min = shares.iter().min().unwrap();
        assert!(max - min <= 1);
    }

    #[test]
    fn zero_buckets_yields_nothing() {
        assert!(apportion(5, 0).is_empty());
    }

    #[test]
    fn bounds_are_apportioned_independently() {
        let bounds = zone_bounds(4, 7, 3);
        assert_eq!(
            bounds,
            vec![
                ZoneBounds { min: 2, max: 3 },
                ZoneBounds { min: 1, max: 2 },
                ZoneBounds { min: 1, max: 2 },
            ]
        );
    }

    #[test]
    fn skewed_remainder_never_inverts_a_zone() {
        // min 3 over 2 zones gives [2, 1], max 2 gives [1, 1]; the first
        // zone's max must be lifted to its min.
        let bounds = zone_bounds(3, 2, 2);
        assert_eq!(
            bounds,
            vec![ZoneBounds { min: 2, max: 2 }, ZoneBounds { min: 1, max: 1 }]
        );
        for b in bounds {
            assert!(b.min <= b.max);
        }
    }
}
