use regex::Regex;
use std::sync::OnceLock;

use crate::app::models::DeviceInfo;

/// Extracts key/value facts from single output lines.
///
/// Classifiers are registered per operation and run on the dispatcher thread,
/// against stream lines as they arrive and against collected stdout at exit.
pub trait LineClassifier: Send + Sync {
    fn name(&self) -> &'static str;

    fn classify(&self, line: &str) -> Vec<(String, String)>;
}

/// Feeds one line through every classifier; the first value seen for a key wins.
pub fn apply_classifiers(
    classifiers: &[std::sync::Arc<dyn LineClassifier>],
    line: &str,
    table: &mut DeviceInfo,
) -> usize {
    let mut inserted = 0;
    for classifier in classifiers {
        for (key, value) in classifier.classify(line) {
            if value.is_empty() || table.contains_key(&key) {
                continue;
            }
            table.insert(key, value);
            inserted += 1;
        }
    }
    inserted
}

const DEVICE_PATTERNS: &[(&str, &str)] = &[
    ("chipset", r"(?i)HW Chipset:\s*(\S+)|Chipset:\s*(\S+)"),
    ("hw_ver", r"(?i)HW Version:\s*(\S+)"),
    ("sw_ver", r"(?i)SW Version:\s*(\S+)"),
    ("board", r"(?i)Board:\s*(\S+)"),
    ("manufacturer", r"(?i)Manufacturer:\s*(\S+)"),
    ("model", r"(?i)Model:\s*(\S+)"),
    ("brand", r"(?i)Brand:\s*(\S+)"),
    ("android", r"(?i)Android version:\s*(\S+)"),
    ("meid", r"(?i)MEID:\s*(\S+)"),
    ("socid", r"(?i)SOC ID:\s*([0-9a-fA-F]+)"),
];

fn device_patterns() -> &'static [(&'static str, Regex)] {
    static PATTERNS: OnceLock<Vec<(&'static str, Regex)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        DEVICE_PATTERNS
            .iter()
            .filter_map(|(key, pattern)| Regex::new(pattern).ok().map(|re| (*key, re)))
            .collect()
    })
}

/// Device properties printed by the MediaTek client while it handshakes
/// (`HW Chipset: MT6765`, `SOC ID: 0A1B...`).
#[derive(Debug, Default, Clone, Copy)]
pub struct DevicePropertyClassifier;

impl LineClassifier for DevicePropertyClassifier {
    fn name(&self) -> &'static str {
        "device_property"
    }

    fn classify(&self, line: &str) -> Vec<(String, String)> {
        // One fact per line: the first matching pattern claims it.
        for (key, re) in device_patterns() {
            let Some(caps) = re.captures(line) else {
                continue;
            };
            let value = caps
                .iter()
                .skip(1)
                .flatten()
                .map(|m| m.as_str().to_string())
                .next();
            if let Some(value) = value {
                return vec![(key.to_string(), value)];
            }
        }
        Vec::new()
    }
}

/// `adb shell getprop` lines: `[ro.product.model]: [Pixel 7]`.
#[derive(Debug, Default, Clone, Copy)]
pub struct GetpropClassifier;

impl LineClassifier for GetpropClassifier {
    fn name(&self) -> &'static str {
        "getprop"
    }

    fn classify(&self, line: &str) -> Vec<(String, String)> {
        let trimmed = line.trim();
        if !trimmed.starts_with('[') {
            return Vec::new();
        }
        let Some((key_part, value_part)) = trimmed.split_once("]: [") else {
            return Vec::new();
        };
        let key = key_part.trim_start_matches('[').trim();
        let value = value_part.trim_end_matches(']').trim();
        if key.is_empty() {
            return Vec::new();
        }
        vec![(key.to_string(), value.to_string())]
    }
}

const PARTITION_HEADER_WORDS: &[&str] = &[
    "gpt",
    "idx",
    "name",
    "partition_name",
    "sgpt",
    "size",
    "start",
    "end",
    "addr",
    "type",
    "guid",
    "attributes",
];

fn partition_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^\s*(?:\d+\.\s*)?([a-zA-Z0-9_-]+)\s*(?:[:(]|$)").ok())
        .as_ref()
}

/// Partition names from GPT listings (`0. preloader: 0x0 - 0x80000`) and
/// scatter files (`partition_name: boot`). Keys are `partition.<name>`.
#[derive(Debug, Default, Clone, Copy)]
pub struct PartitionClassifier;

impl LineClassifier for PartitionClassifier {
    fn name(&self) -> &'static str {
        "partition"
    }

    fn classify(&self, line: &str) -> Vec<(String, String)> {
        let trimmed = line.trim();
        if let Some(rest) = strip_prefix_ignore_case(trimmed, "partition_name:") {
            let name = rest.trim();
            if name.is_empty() {
                return Vec::new();
            }
            return vec![(format!("partition.{name}"), name.to_string())];
        }
        let Some(re) = partition_pattern() else {
            return Vec::new();
        };
        let Some(caps) = re.captures(trimmed) else {
            return Vec::new();
        };
        let name = &caps[1];
        if PARTITION_HEADER_WORDS.contains(&name.to_lowercase().as_str()) {
            return Vec::new();
        }
        vec![(format!("partition.{name}"), name.to_string())]
    }
}

fn strip_prefix_ignore_case<'a>(value: &'a str, prefix: &str) -> Option<&'a str> {
    let head = value.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        value.get(prefix.len()..)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn extracts_mtk_device_properties() {
        let classifier = DevicePropertyClassifier;
        assert_eq!(
            classifier.classify("Preloader - HW Chipset: MT6765"),
            vec![("chipset".to_string(), "MT6765".to_string())]
        );
        assert_eq!(
            classifier.classify("Preloader - SOC ID: 0a1B2c"),
            vec![("socid".to_string(), "0a1B2c".to_string())]
        );
        assert_eq!(
            classifier.classify("android VERSION: 12"),
            vec![("android".to_string(), "12".to_string())]
        );
        assert!(classifier.classify("Waiting for device").is_empty());
    }

    #[test]
    fn first_value_for_a_key_wins() {
        let classifiers: Vec<Arc<dyn LineClassifier>> = vec![Arc::new(DevicePropertyClassifier)];
        let mut table = DeviceInfo::new();
        assert_eq!(apply_classifiers(&classifiers, "Chipset: MT6765", &mut table), 1);
        assert_eq!(apply_classifiers(&classifiers, "Chipset: MT6789", &mut table), 0);
        assert_eq!(table.get("chipset").map(String::as_str), Some("MT6765"));
    }

    #[test]
    fn parses_getprop_lines() {
        let classifier = GetpropClassifier;
        assert_eq!(
            classifier.classify("[ro.product.model]: [Pixel 7]"),
            vec![("ro.product.model".to_string(), "Pixel 7".to_string())]
        );
        assert!(classifier.classify("garbage").is_empty());
        assert!(classifier.classify("[]: [x]").is_empty());
    }

    #[test]
    fn finds_partition_names_and_skips_headers() {
        let classifier = PartitionClassifier;
        assert_eq!(
            classifier.classify("0. preloader: 0x0 - 0x80000 (512 KiB)"),
            vec![("partition.preloader".to_string(), "preloader".to_string())]
        );
        assert_eq!(
            classifier.classify("  partition_name: boot_a"),
            vec![("partition.boot_a".to_string(), "boot_a".to_string())]
        );
        assert!(classifier.classify("GPT:").is_empty());
        assert!(classifier.classify("Reading from 0x0 to 0x100 now").is_empty());
    }
}
