use std::{collections::HashMap, sync::Mutex};

#[derive(Debug, Default)]
struct Entry {
    sum: f64,
    count: u64,
}

/// Named running averages, shareable across threads behind an `Arc`.
///
/// Values are accumulated with [`push`](Self::push); [`sample`](Self::sample)
/// returns the current average for one entry and
/// [`get_all_averages`](Self::get_all_averages) snapshots every entry.
/// An entry that has never seen a value averages to `None`.
#[derive(Debug, Default)]
pub struct RunningAverage {
    entries: Mutex<HashMap<String, Entry>>,
}

impl RunningAverage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, name: &str, value: f64) {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.entry(name.to_owned()).or_default();
        entry.sum += value;
        entry.count += 1;
    }

    pub fn sample(&self, name: &str) -> Option<f64> {
        let entries = self.entries.lock().unwrap();
        entries
            .get(name)
            .filter(|e| e.count > 0)
            .map(|e| e.sum / e.count as f64)
    }

    pub fn get_all_averages(&self) -> HashMap<String, Option<f64>> {
        let entries = self.entries.lock().unwrap();
        entries
            .iter()
            .map(|(name, e)| {
                let avg = (e.count > 0).then(|| e.sum / e.count as f64);
                (name.clone(), avg)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn averages_accumulate() {
        let avg = RunningAverage::new();
        avg.push("acc", 1.0);
        avg.push("acc", 0.0);
        avg.push("acc", 1.0);
        let sampled = avg.sample("acc").unwrap();
        assert!((sampled - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn missing_entry_is_none() {
        let avg = RunningAverage::new();
        assert_eq!(avg.sample("nope"), None);
    }

    #[test]
    fn snapshot_contains_all_entries() {
        let avg = RunningAverage::new();
        avg.push("a", 2.0);
        avg.push("b", 4.0);
        avg.push("b", 6.0);
        let all = avg.get_all_averages();
        assert_eq!(all.len(), 2);
        assert_eq!(all["a"], Some(2.0));
        assert_eq!(all["b"], Some(5.0));
    }
}
