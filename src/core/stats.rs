use std::collections::BTreeMap;
use serde::{Serialize, Deserialize};
use crate::search::aggs::{AggState, merge_states};

/// Backend call statistics.
///
/// Durations are in milliseconds, data rates in MB/sec.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    pub matches: u64,
    pub total_bytes: u64,
    pub duration: u64,              // total processing time
    pub fabric_duration: u64,       // time spent in the search fabric
    pub data_rate: f64,
    pub fabric_data_rate: f64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub host: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<Statistics>,   // per-step or per-node statistics
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub aggregations: BTreeMap<String, AggState>,
}

fn rate(bytes: u64, millis: u64) -> f64 {
    if millis == 0 {
        return 0.0;
    }
    let mb = bytes as f64 / 1024.0 / 1024.0;
    let sec = millis as f64 / 1000.0;
    mb / sec
}

impl Statistics {
    pub fn new(matches: u64, total_bytes: u64, duration: u64, fabric_duration: u64) -> Self {
        let mut stat = Statistics {
            matches,
            total_bytes,
            duration,
            fabric_duration,
            ..Statistics::default()
        };
        stat.update_rates();
        stat
    }

    /// Recompute data rates, zero duration gives zero rate
    pub fn update_rates(&mut self) {
        self.data_rate = rate(self.total_bytes, self.duration);
        self.fabric_data_rate = rate(self.total_bytes, self.fabric_duration);
    }

    /// Merge another call: matches, bytes and durations are summed
    pub fn combine(&mut self, other: &Statistics) {
        self.matches += other.matches;
        self.total_bytes += other.total_bytes;
        self.duration += other.duration;
        self.fabric_duration += other.fabric_duration;
        self.update_rates();
        merge_states(&mut self.aggregations, &other.aggregations);
        self.details.push(other.clone());
    }

    /// Merge a chained step, only the last step's matches count
    pub fn chain(&mut self, step: &Statistics) {
        self.combine(step);
        self.matches = step.matches;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rates() {
        let s = Statistics::new(1, 2 * 1024 * 1024, 500, 0);
        assert_eq!(s.data_rate, 4.0);
        assert_eq!(s.fabric_data_rate, 0.0);
    }

    #[test]
    fn test_combine_and_chain() {
        let mut total = Statistics::default();
        total.combine(&Statistics::new(5, 100, 10, 5));
        total.combine(&Statistics::new(3, 100, 10, 5));
        assert_eq!(total.matches, 8);
        assert_eq!(total.total_bytes, 200);
        assert_eq!(total.duration, 20);
        assert_eq!(total.details.len(), 2);
        assert!(total.aggregations.is_empty());

        let mut and = Statistics::default();
        and.chain(&Statistics::new(5, 100, 10, 5));
        and.chain(&Statistics::new(2, 50, 10, 5));
        assert_eq!(and.matches, 2);
        assert_eq!(and.total_bytes, 150);
        assert_eq!(and.fabric_duration, 10);
    }

    #[test]
    fn test_combine_aggregations() {
        let mut a = AggState::default();
        a.add(1.0);
        let mut b = AggState::default();
        b.add(5.0);
        b.add(3.0);

        let mut node1 = Statistics::new(1, 0, 0, 0);
        node1.aggregations.insert("stat.x".to_string(), a);
        let mut node2 = Statistics::new(2, 0, 0, 0);
        node2.aggregations.insert("stat.x".to_string(), b);

        let mut total = Statistics::default();
        total.combine(&node1);
        total.combine(&node2);
        let x = total.aggregations["stat.x"];
        assert_eq!((x.count, x.sum, x.sum2, x.min, x.max), (3, 9.0, 35.0, 1.0, 5.0));

        let text = serde_json::to_string(&Statistics::default()).unwrap();
        assert!(!text.contains("aggregations"));
    }
}
