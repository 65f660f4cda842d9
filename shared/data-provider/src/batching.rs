use itertools::Itertools;

/// One prompt ready for generation, tied back to its dataset instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchRecord {
    pub input: String,
    pub instance_id: String,
}

/// Chunk records into fixed-size batches. `num_instances > 0` keeps only the
/// first `num_instances` records; 0 means all. The last batch may be short.
pub fn batch_records(
    records: Vec<BatchRecord>,
    batch_size: usize,
    num_instances: usize,
) -> Vec<Vec<BatchRecord>> {
    let take = if num_instances > 0 {
        num_instances
    } else {
        records.len()
    };
    records
        .into_iter()
        .take(take)
        .chunks(batch_size.max(1))
        .into_iter()
        .map(|chunk| chunk.collect())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn records(n: usize) -> Vec<BatchRecord> {
        (0..n)
            .map(|i| BatchRecord {
                input: format!("prompt {i}"),
                instance_id: format!("id{i}"),
            })
            .collect()
    }

    #[test]
    fn chunks_with_short_tail() {
        let batches = batch_records(records(5), 2, 0);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].len(), 2);
        assert_eq!(batches[2].len(), 1);
    }

    #[test]
    fn instance_limit_keeps_prefix() {
        let batches = batch_records(records(10), 4, 3);
        let total: usize = batches.iter().map(Vec::len).sum();
        assert_eq!(total, 3);
        assert_eq!(batches[0][0].instance_id, "id0");
    }

    #[test]
    fn zero_limit_means_all() {
        let batches = batch_records(records(4), 4, 0);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 4);
    }
}
