use serde::{Deserialize, Serialize};

use crate::error::{MemoryError, Result};

/// What kind of memory this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryKind {
    Fact,
    Preference,
    Relationship,
    Event,
}

impl std::fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fact => write!(f, "fact"),
            Self::Preference => write!(f, "preference"),
            Self::Relationship => write!(f, "relationship"),
            Self::Event => write!(f, "event"),
        }
    }
}

impl std::str::FromStr for MemoryKind {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "fact" => Ok(Self::Fact),
            "preference" => Ok(Self::Preference),
            "relationship" => Ok(Self::Relationship),
            "event" => Ok(Self::Event),
            other => Err(format!("unknown memory kind: {other}")),
        }
    }
}

/// A stored memory row.
#[derive(Debug, Clone, Serialize)]
pub struct AgentMemory {
    pub id: String,
    pub agent_id: String,
    pub kind: MemoryKind,
    pub content: String,
    pub confidence: f64,
    pub source_message_id: String,
    pub created_at: String,
}

/// A candidate memory as produced by the extraction model, before admission.
#[derive(Debug, Clone, Deserialize)]
pub struct ExtractedMemory {
    pub kind: MemoryKind,
    pub content: String,
    pub confidence: f64,
}

/// Parse the extraction model's output: a JSON array of candidates, possibly
/// wrapped in markdown fences. Unknown kinds fail the whole payload — a
/// model drifting off-schema should be visible, not silently partial.
pub fn parse_extraction(raw: &str) -> Result<Vec<ExtractedMemory>> {
    let trimmed = raw.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|s| s.strip_suffix("```"))
        .unwrap_or(trimmed);
    serde_json::from_str(body.trim()).map_err(|e| MemoryError::Parse(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trip() {
        for kind in [
            MemoryKind::Fact,
            MemoryKind::Preference,
            MemoryKind::Relationship,
            MemoryKind::Event,
        ] {
            assert_eq!(kind.to_string().parse::<MemoryKind>().unwrap(), kind);
        }
    }

    #[test]
    fn parse_plain_array() {
        let items = parse_extraction(
            r#"[{"kind":"fact","content":"User lives in Lisbon","confidence":0.9}]"#,
        )
        .unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].kind, MemoryKind::Fact);
    }

    #[test]
    fn parse_fenced_array() {
        let items = parse_extraction(
            "```json\n[{\"kind\":\"preference\",\"content\":\"prefers terse replies\",\"confidence\":0.7}]\n```",
        )
        .unwrap();
        assert_eq!(items[0].kind, MemoryKind::Preference);
    }

    #[test]
    fn parse_rejects_unknown_kind() {
        assert!(parse_extraction(r#"[{"kind":"mood","content":"x","confidence":0.9}]"#).is_err());
    }
}
