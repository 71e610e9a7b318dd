//! Engine profiling traces in Chrome trace-event form.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Result;

/// Events the engine emits for its own bookkeeping rather than model work.
pub const SESSION_OVERHEAD_EVENTS: [&str; 4] = [
    "model_loading_from_uri",
    "session_initialization",
    "model_run",
    "SequentialExecutor::Execute",
];

/// One profiling event.
///
/// `ts` and `dur` are microseconds relative to the profiling start;
/// `start_ns` and `end_ns` are absolute wall-clock nanoseconds filled in by
/// [`Trace::parse`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    #[serde(rename = "cat", default, skip_serializing_if = "String::is_empty")]
    pub category: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(rename = "ph", default, skip_serializing_if = "String::is_empty")]
    pub phase: String,
    #[serde(rename = "ts", default)]
    pub timestamp_us: i64,
    #[serde(rename = "dur", default)]
    pub duration_us: i64,
    #[serde(rename = "pid", default)]
    pub process_id: i64,
    #[serde(rename = "tid", default)]
    pub thread_id: i64,
    #[serde(rename = "args", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub arguments: BTreeMap<String, serde_json::Value>,
    #[serde(skip)]
    pub start_ns: i64,
    #[serde(skip)]
    pub end_ns: i64,
}

impl TraceEvent {
    /// Identifier that is unique per operator and thread.
    pub fn id(&self) -> String {
        format!("{}/{}", self.name, self.thread_id)
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_nanos(self.start_ns)
    }

    pub fn end_time(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_nanos(self.end_ns)
    }

    pub fn is_session_overhead(&self) -> bool {
        SESSION_OVERHEAD_EVENTS.contains(&self.name.as_str())
    }
}

/// A set of events anchored at a wall-clock start time.
#[derive(Debug, Clone, PartialEq)]
pub struct Trace {
    pub start_ns: i64,
    pub events: Vec<TraceEvent>,
}

impl Trace {
    /// Parse the engine's JSON event array, anchoring relative timestamps at
    /// `start_ns`. Events come back sorted by start time.
    pub fn parse(data: &str, start_ns: i64) -> Result<Self> {
        let mut events: Vec<TraceEvent> = serde_json::from_str(data)?;

        for event in &mut events {
            event.start_ns = start_ns + event.timestamp_us * 1000;
            event.end_ns = event.start_ns + event.duration_us * 1000;
        }
        events.sort_by_key(|e| e.start_ns);

        Ok(Self { start_ns, events })
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_nanos(self.start_ns)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Events describing model work, without session bookkeeping.
    pub fn operator_events(&self) -> impl Iterator<Item = &TraceEvent> {
        self.events.iter().filter(|e| !e.is_session_overhead())
    }

    /// Partition events into one trace per run window.
    ///
    /// An event belongs to window `i` when it starts no earlier than
    /// `run_starts[i]` and ends no later than `run_ends[i]`. Unpaired
    /// trailing bounds are ignored.
    pub fn split(&self, run_starts: &[i64], run_ends: &[i64]) -> Vec<Trace> {
        run_starts
            .iter()
            .zip(run_ends)
            .map(|(&start, &end)| Trace {
                start_ns: start,
                events: self
                    .events
                    .iter()
                    .filter(|e| e.start_ns >= start && e.end_ns <= end)
                    .cloned()
                    .collect(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const PROFILE: &str = r#"[
        {"cat":"Session","pid":7,"tid":1,"dur":120,"ts":3,"ph":"X","name":"model_loading_from_uri","args":{}},
        {"cat":"Node","pid":7,"tid":1,"dur":40,"ts":500,"ph":"X","name":"conv_kernel_time","args":{"op_name":"Conv","thread_scheduling_stats":{"main_thread":{"block_size":1}}}},
        {"cat":"Node","pid":7,"tid":2,"dur":5,"ts":200,"ph":"X","name":"relu_kernel_time","args":{"op_name":"Relu"}},
        {"cat":"Session","pid":7,"tid":1,"dur":300,"ts":190,"ph":"X","name":"model_run","args":{}}
    ]"#;

    #[test]
    fn test_parse_anchors_and_sorts() {
        let trace = Trace::parse(PROFILE, 1_000_000).unwrap();
        assert_eq!(trace.len(), 4);

        let names: Vec<&str> = trace.events.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["model_loading_from_uri", "model_run", "relu_kernel_time", "conv_kernel_time"]
        );

        let relu = &trace.events[2];
        assert_eq!(relu.start_ns, 1_000_000 + 200_000);
        assert_eq!(relu.end_ns, 1_000_000 + 205_000);
        assert_eq!(relu.id(), "relu_kernel_time/2");
        assert_eq!(relu.arguments["op_name"], serde_json::json!("Relu"));
    }

    #[test]
    fn test_operator_events_skip_session_overhead() {
        let trace = Trace::parse(PROFILE, 0).unwrap();
        let ops: Vec<&str> = trace.operator_events().map(|e| e.name.as_str()).collect();
        assert_eq!(ops, vec!["relu_kernel_time", "conv_kernel_time"]);
    }

    #[test]
    fn test_split_by_run_window() {
        let trace = Trace::parse(PROFILE, 0).unwrap();
        let runs = trace.split(&[150_000, 450_000], &[210_000, 600_000]);

        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].start_ns, 150_000);
        let first: Vec<&str> = runs[0].events.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(first, vec!["relu_kernel_time"]);
        let second: Vec<&str> = runs[1].events.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(second, vec!["conv_kernel_time"]);
    }

    #[test]
    fn test_split_ignores_unpaired_bounds() {
        let trace = Trace::parse(PROFILE, 0).unwrap();
        assert_eq!(trace.split(&[0, 10], &[1_000_000]).len(), 1);
        assert!(trace.split(&[], &[]).is_empty());
    }

    #[test]
    fn test_malformed_trace() {
        assert!(Trace::parse("", 0).is_err());
        assert!(Trace::parse("{\"not\":\"an array\"}", 0).is_err());
        assert!(Trace::parse("[]", 0).unwrap().is_empty());
    }

    #[test]
    fn test_event_times() {
        let trace = Trace::parse(PROFILE, 1_700_000_000_000_000_000).unwrap();
        let event = &trace.events[0];
        assert_eq!(event.start_time().timestamp_nanos_opt(), Some(event.start_ns));
        assert!(event.end_time() > event.start_time());
        assert_eq!(trace.start_time().timestamp(), 1_700_000_000);
    }
}
