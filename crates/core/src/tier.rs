//! Relay node staking tiers

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::MumbleChatError;

/// Decimals of the staking token
pub const TOKEN_DECIMALS: u32 = 18;

/// Staking tier of a relay node.
///
/// | Tier     | Min stake | Storage         | Rewards |
/// |----------|-----------|-----------------|---------|
/// | Bronze   | 100 MCT   | 1 GB – <2 GB    | 1.0x    |
/// | Silver   | 200 MCT   | 2 GB – <4 GB    | 1.5x    |
/// | Gold     | 300 MCT   | 4 GB – <8 GB    | 2.0x    |
/// | Platinum | 400 MCT   | 8 GB and above  | 3.0x    |
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Tier {
    Bronze,
    Silver,
    Gold,
    Platinum,
}

impl Tier {
    /// All tiers, smallest first
    pub const ALL: [Tier; 4] = [Tier::Bronze, Tier::Silver, Tier::Gold, Tier::Platinum];

    /// Minimum stake in whole tokens
    pub fn min_stake_tokens(&self) -> u64 {
        match self {
            Tier::Bronze => 100,
            Tier::Silver => 200,
            Tier::Gold => 300,
            Tier::Platinum => 400,
        }
    }

    /// Minimum stake in base units (18 decimals)
    pub fn min_stake_units(&self) -> u128 {
        self.min_stake_tokens() as u128 * 10u128.pow(TOKEN_DECIMALS)
    }

    /// Smallest storage allocation that qualifies for this tier
    pub fn min_storage_mb(&self) -> u64 {
        match self {
            Tier::Bronze => 1024,
            Tier::Silver => 2048,
            Tier::Gold => 4096,
            Tier::Platinum => 8192,
        }
    }

    pub fn reward_multiplier(&self) -> f64 {
        match self {
            Tier::Bronze => 1.0,
            Tier::Silver => 1.5,
            Tier::Gold => 2.0,
            Tier::Platinum => 3.0,
        }
    }

    /// Largest tier whose storage requirement fits into `available_mb`
    pub fn recommended_for(available_mb: u64) -> Option<Tier> {
        Self::ALL
            .iter()
            .rev()
            .find(|tier| available_mb >= tier.min_storage_mb())
            .copied()
    }

    /// Tier for an on-chain tier index
    pub fn from_u8(value: u8) -> Option<Tier> {
        match value {
            0 => Some(Tier::Bronze),
            1 => Some(Tier::Silver),
            2 => Some(Tier::Gold),
            3 => Some(Tier::Platinum),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Tier::Bronze => "BRONZE",
            Tier::Silver => "SILVER",
            Tier::Gold => "GOLD",
            Tier::Platinum => "PLATINUM",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Tier {
    type Err = MumbleChatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "BRONZE" => Ok(Tier::Bronze),
            "SILVER" => Ok(Tier::Silver),
            "GOLD" => Ok(Tier::Gold),
            "PLATINUM" => Ok(Tier::Platinum),
            _ => Err(MumbleChatError::InvalidTier(s.to_string())),
        }
    }
}
