use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::provider::StreamInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BitrateTier {
    Kbps160,
    Kbps128,
    Kbps70,
    Kbps50,
    Kbps48,
}

impl BitrateTier {
    /// Descending preference; traversal order never changes.
    pub const LADDER: [BitrateTier; 5] = [
        BitrateTier::Kbps160,
        BitrateTier::Kbps128,
        BitrateTier::Kbps70,
        BitrateTier::Kbps50,
        BitrateTier::Kbps48,
    ];

    pub fn kbps(&self) -> u32 {
        match self {
            BitrateTier::Kbps160 => 160,
            BitrateTier::Kbps128 => 128,
            BitrateTier::Kbps70 => 70,
            BitrateTier::Kbps50 => 50,
            BitrateTier::Kbps48 => 48,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BitrateTier::Kbps160 => "160kbps",
            BitrateTier::Kbps128 => "128kbps",
            BitrateTier::Kbps70 => "70kbps",
            BitrateTier::Kbps50 => "50kbps",
            BitrateTier::Kbps48 => "48kbps",
        }
    }

    /// Only the five exact labels are recognized; every other bitrate is
    /// invisible to the ladder.
    pub fn from_label(value: &str) -> Option<Self> {
        match value {
            "160kbps" => Some(BitrateTier::Kbps160),
            "128kbps" => Some(BitrateTier::Kbps128),
            "70kbps" => Some(BitrateTier::Kbps70),
            "50kbps" => Some(BitrateTier::Kbps50),
            "48kbps" => Some(BitrateTier::Kbps48),
            _ => None,
        }
    }
}

impl fmt::Display for BitrateTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamCandidate {
    pub tier: BitrateTier,
    pub stream: StreamInfo,
}

#[derive(Debug, Default)]
pub struct QualityLadder {
    buckets: HashMap<BitrateTier, Vec<StreamInfo>>,
}

impl QualityLadder {
    pub fn from_streams(streams: Vec<StreamInfo>) -> Self {
        let mut buckets: HashMap<BitrateTier, Vec<StreamInfo>> = HashMap::new();
        for stream in streams {
            let Some(tier) = stream.abr.as_deref().and_then(BitrateTier::from_label) else {
                continue;
            };
            buckets.entry(tier).or_default().push(stream);
        }
        Self { buckets }
    }

    pub fn bucket(&self, tier: BitrateTier) -> &[StreamInfo] {
        self.buckets.get(&tier).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.values().all(Vec::is_empty)
    }

    /// The one candidate per present tier, in ladder order.
    pub fn candidates(&self) -> Vec<StreamCandidate> {
        BitrateTier::LADDER
            .iter()
            .filter_map(|tier| {
                self.bucket(*tier).first().map(|stream| StreamCandidate {
                    tier: *tier,
                    stream: stream.clone(),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(id: &str, abr: Option<&str>) -> StreamInfo {
        StreamInfo {
            id: id.to_string(),
            abr: abr.map(str::to_string),
            ext: "webm".to_string(),
            filesize: None,
        }
    }

    #[test]
    fn candidates_follow_fixed_order() {
        let ladder = QualityLadder::from_streams(vec![
            stream("a", Some("48kbps")),
            stream("b", Some("128kbps")),
            stream("c", Some("160kbps")),
            stream("d", Some("70kbps")),
            stream("e", Some("50kbps")),
        ]);
        let tiers: Vec<u32> = ladder.candidates().iter().map(|c| c.tier.kbps()).collect();
        assert_eq!(tiers, vec![160, 128, 70, 50, 48]);
    }

    #[test]
    fn only_first_candidate_of_a_tier_is_offered() {
        let ladder = QualityLadder::from_streams(vec![
            stream("first", Some("128kbps")),
            stream("second", Some("128kbps")),
        ]);
        assert_eq!(ladder.bucket(BitrateTier::Kbps128).len(), 2);
        let candidates = ladder.candidates();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].stream.id, "first");
    }

    #[test]
    fn unknown_labels_are_invisible() {
        let ladder = QualityLadder::from_streams(vec![
            stream("x", Some("256kbps")),
            stream("y", None),
            stream("z", Some("160 kbps")),
        ]);
        assert!(ladder.is_empty());
        assert!(ladder.candidates().is_empty());
    }

    #[test]
    fn absent_tiers_are_skipped() {
        let ladder = QualityLadder::from_streams(vec![
            stream("B", Some("50kbps")),
            stream("A", Some("128kbps")),
        ]);
        let ids: Vec<String> = ladder.candidates().into_iter().map(|c| c.stream.id).collect();
        assert_eq!(ids, vec!["A".to_string(), "B".to_string()]);
    }
}
