use serde::{Deserialize, Serialize};

/// Privacy class attached to knowledge and conversation context.
/// Retrieval never crosses layers: a caller only sees layers unlocked by
/// their relationship to the agent's owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layer {
    Public,
    Friends,
    Intimate,
}

impl Layer {
    pub const ALL: [Layer; 3] = [Layer::Public, Layer::Friends, Layer::Intimate];
}

impl std::fmt::Display for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Public => write!(f, "public"),
            Self::Friends => write!(f, "friends"),
            Self::Intimate => write!(f, "intimate"),
        }
    }
}

impl std::str::FromStr for Layer {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "public" => Ok(Self::Public),
            "friends" => Ok(Self::Friends),
            "intimate" => Ok(Self::Intimate),
            other => Err(format!("unknown layer: {other}")),
        }
    }
}

/// Caller's relationship tier towards an agent's owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserTier {
    Free,
    Follower,
    Paid,
}

impl UserTier {
    /// Layers this tier may read. The agent owner is handled separately and
    /// always sees all three.
    pub fn allowed_layers(&self) -> &'static [Layer] {
        match self {
            UserTier::Free => &[Layer::Public],
            UserTier::Follower | UserTier::Paid => &[Layer::Public, Layer::Friends],
        }
    }
}

impl std::fmt::Display for UserTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Free => write!(f, "free"),
            Self::Follower => write!(f, "follower"),
            Self::Paid => write!(f, "paid"),
        }
    }
}

impl std::str::FromStr for UserTier {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "free" => Ok(Self::Free),
            "follower" => Ok(Self::Follower),
            "paid" => Ok(Self::Paid),
            other => Err(format!("unknown user tier: {other}")),
        }
    }
}

/// The six outcomes of the policy engine.
///
/// A = autonomous RAG answer, B = clarify, C = canonical reuse,
/// D = escalation offer, E = escalation enqueue, F = refusal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DecisionPath {
    A,
    B,
    C,
    D,
    E,
    F,
}

impl std::fmt::Display for DecisionPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let c = match self {
            Self::A => 'A',
            Self::B => 'B',
            Self::C => 'C',
            Self::D => 'D',
            Self::E => 'E',
            Self::F => 'F',
        };
        write!(f, "{c}")
    }
}

impl std::str::FromStr for DecisionPath {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "A" => Ok(Self::A),
            "B" => Ok(Self::B),
            "C" => Ok(Self::C),
            "D" => Ok(Self::D),
            "E" => Ok(Self::E),
            "F" => Ok(Self::F),
            other => Err(format!("unknown decision path: {other}")),
        }
    }
}

/// Layers a caller may read from an agent's knowledge. The owner sees all
/// three; everyone else is gated by tier.
pub fn allowed_layers(is_owner: bool, tier: UserTier) -> Vec<Layer> {
    if is_owner {
        Layer::ALL.to_vec()
    } else {
        tier.allowed_layers().to_vec()
    }
}

/// Rough token estimate: ~4 chars per token. Used for context budgeting and
/// chunk sizing; never for billing.
pub fn approx_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Whitespace word split. The complexity heuristic and the short-message
/// clarification rule both count tokens this way.
pub fn word_tokens(text: &str) -> Vec<&str> {
    text.split_whitespace().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn layer_round_trip() {
        for layer in Layer::ALL {
            assert_eq!(Layer::from_str(&layer.to_string()).unwrap(), layer);
        }
    }

    #[test]
    fn tier_layer_access() {
        assert_eq!(UserTier::Free.allowed_layers(), &[Layer::Public]);
        assert!(UserTier::Follower.allowed_layers().contains(&Layer::Friends));
        assert!(!UserTier::Paid.allowed_layers().contains(&Layer::Intimate));
    }

    #[test]
    fn path_round_trip() {
        for p in [
            DecisionPath::A,
            DecisionPath::B,
            DecisionPath::C,
            DecisionPath::D,
            DecisionPath::E,
            DecisionPath::F,
        ] {
            assert_eq!(DecisionPath::from_str(&p.to_string()).unwrap(), p);
        }
    }

    #[test]
    fn token_estimate() {
        assert_eq!(approx_tokens(""), 0);
        assert_eq!(approx_tokens("abcd"), 1);
        assert_eq!(approx_tokens("abcde"), 2);
        assert_eq!(word_tokens("what's your refund policy?").len(), 4);
    }
}
