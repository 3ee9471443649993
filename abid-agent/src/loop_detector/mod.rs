//! Heuristic detection of an agent repeating itself.

use serde_json::{Map, Value};
use std::collections::{BTreeSet, VecDeque};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoopDetectorConfig {
    pub window: usize,
    pub repeat_threshold: usize,
    pub similarity_threshold: f64,
    /// Texts shorter than this are too generic to compare.
    pub min_text_len: usize,
}

impl Default for LoopDetectorConfig {
    fn default() -> Self {
        Self {
            window: 5,
            repeat_threshold: 3,
            similarity_threshold: 0.9,
            min_text_len: 20,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoopDetector {
    config: LoopDetectorConfig,
    actions: VecDeque<String>,
    texts: VecDeque<String>,
}

impl Default for LoopDetector {
    fn default() -> Self {
        Self::new(LoopDetectorConfig::default())
    }
}

impl LoopDetector {
    pub fn new(config: LoopDetectorConfig) -> Self {
        Self {
            config,
            actions: VecDeque::with_capacity(config.window),
            texts: VecDeque::with_capacity(config.window),
        }
    }

    pub fn record_tool_call(&mut self, name: &str, arguments: &Map<String, Value>) {
        let mut signature = String::from(name);
        signature.push(':');
        write_canonical(&Value::Object(arguments.clone()), &mut signature);
        push_bounded(&mut self.actions, signature, self.config.window);
    }

    pub fn record_text(&mut self, text: &str) {
        let text = text.trim();
        if text.chars().count() < self.config.min_text_len {
            return;
        }
        push_bounded(&mut self.texts, text.to_lowercase(), self.config.window);
    }

    /// Describes the loop if one is present in the current window.
    pub fn check(&self) -> Option<String> {
        for signature in &self.actions {
            let repeats = self.actions.iter().filter(|s| *s == signature).count();
            if repeats >= self.config.repeat_threshold {
                let name = signature.split(':').next().unwrap_or_default();
                debug!(tool = name, repeats, "repeated tool call detected");
                return Some(format!(
                    "The tool '{name}' was called {repeats} times with identical arguments."
                ));
            }
        }

        let mut recent = self.texts.iter().rev();
        if let (Some(last), Some(previous)) = (recent.next(), recent.next()) {
            let similarity = jaccard(last, previous);
            if similarity >= self.config.similarity_threshold {
                debug!(similarity, "repeated response detected");
                return Some(format!(
                    "The last two responses are {:.0}% similar.",
                    similarity * 100.0
                ));
            }
        }
        None
    }

    pub fn clear(&mut self) {
        self.actions.clear();
        self.texts.clear();
    }
}

fn push_bounded(queue: &mut VecDeque<String>, item: String, window: usize) {
    if window == 0 {
        return;
    }
    while queue.len() >= window {
        queue.pop_front();
    }
    queue.push_back(item);
}

/// Serializes with object keys sorted at every level, so argument order never
/// changes a signature.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

fn jaccard(a: &str, b: &str) -> f64 {
    let left: BTreeSet<&str> = a.split_whitespace().collect();
    let right: BTreeSet<&str> = b.split_whitespace().collect();
    let union = left.union(&right).count();
    if union == 0 {
        return 0.0;
    }
    left.intersection(&right).count() as f64 / union as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_three_identical_calls_trigger() {
        let mut detector = LoopDetector::default();
        let path = args(json!({"path": "."}));
        detector.record_tool_call("list_dir", &path);
        detector.record_tool_call("list_dir", &path);
        assert!(detector.check().is_none());
        detector.record_tool_call("list_dir", &path);
        let description = detector.check().unwrap();
        assert!(description.contains("list_dir"));

        detector.clear();
        detector.record_tool_call("list_dir", &path);
        assert!(detector.check().is_none());
    }

    #[test]
    fn test_key_order_does_not_matter() {
        let mut detector = LoopDetector::default();
        for arguments in [
            json!({"pattern": "fn", "opts": {"b": 1, "a": 2}}),
            json!({"opts": {"a": 2, "b": 1}, "pattern": "fn"}),
            json!({"pattern": "fn", "opts": {"a": 2, "b": 1}}),
        ] {
            detector.record_tool_call("grep", &args(arguments));
        }
        assert!(detector.check().is_some());
    }

    #[test]
    fn test_different_arguments_do_not_trigger() {
        let mut detector = LoopDetector::default();
        for path in ["a", "b", "c", "d"] {
            detector.record_tool_call("read_file", &args(json!({ "path": path })));
        }
        assert!(detector.check().is_none());
    }

    #[test]
    fn test_window_evicts_old_calls() {
        let mut detector = LoopDetector::new(LoopDetectorConfig {
            window: 3,
            ..LoopDetectorConfig::default()
        });
        let same = args(json!({"path": "."}));
        detector.record_tool_call("list_dir", &same);
        detector.record_tool_call("list_dir", &same);
        detector.record_tool_call("grep", &args(json!({"pattern": "x"})));
        detector.record_tool_call("read_file", &args(json!({"path": "y"})));
        detector.record_tool_call("list_dir", &same);
        assert!(detector.check().is_none());
    }

    #[test]
    fn test_similar_texts_trigger() {
        let mut detector = LoopDetector::default();
        detector.record_text("I will now read the configuration file to find the port.");
        detector.record_text("I will now read the configuration file to find the port.");
        assert!(detector.check().unwrap().contains("similar"));
    }

    #[test]
    fn test_short_or_different_texts_ignored() {
        let mut detector = LoopDetector::default();
        detector.record_text("Done.");
        detector.record_text("Done.");
        assert!(detector.check().is_none());

        detector.record_text("Reading the configuration file for the port setting.");
        detector.record_text("All tests pass now and the build is green again.");
        assert!(detector.check().is_none());
    }

    #[test]
    fn test_jaccard() {
        assert_eq!(jaccard("a b c", "a b c"), 1.0);
        assert_eq!(jaccard("a b", "c d"), 0.0);
        assert_eq!(jaccard("", ""), 0.0);
        assert!((jaccard("a b c d", "a b c e") - 0.6).abs() < 1e-9);
    }
}
