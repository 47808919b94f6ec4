use crate::log::LogPartition;

/// Spreads the partitions of each stream over `runners` runners: partition `p` goes to runner
/// `p % runners`. Runners left without partition are spare runners.
pub fn round_robin(runners: u16, streams: &[(String, u16)]) -> Vec<Vec<LogPartition>> {
    let runners = usize::from(runners);
    let mut assignments = vec![Vec::new(); runners];
    if runners == 0 {
        return assignments;
    }
    for (stream, partitions) in streams {
        for partition in 0..*partitions {
            if let Some(assignment) = assignments.get_mut(usize::from(partition) % runners) {
                assignment.push(LogPartition::of(stream.as_str(), partition));
            }
        }
    }
    assignments
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_robin() {
        let streams = vec![("s1".to_string(), 5), ("s2".to_string(), 2)];
        let assignments = round_robin(2, &streams);
        assert_eq!(
            assignments[0],
            vec![
                LogPartition::of("s1", 0),
                LogPartition::of("s1", 2),
                LogPartition::of("s1", 4),
                LogPartition::of("s2", 0),
            ]
        );
        assert_eq!(
            assignments[1],
            vec![
                LogPartition::of("s1", 1),
                LogPartition::of("s1", 3),
                LogPartition::of("s2", 1),
            ]
        );
    }

    #[test]
    fn test_spare_and_sources() {
        let assignments = round_robin(3, &[("s1".to_string(), 2)]);
        assert_eq!(assignments.len(), 3);
        assert!(assignments[2].is_empty());

        // a source gets one empty assignment per runner
        let source = round_robin(2, &[]);
        assert_eq!(source, vec![Vec::<LogPartition>::new(); 2]);
        assert!(round_robin(0, &[("s1".to_string(), 2)]).is_empty());
    }
}
