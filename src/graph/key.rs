//! Variable keys: one letter plus an integer index.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A variable key in the smoother.
///
/// The variant order defines the column ordering of the linear system
/// (`b < e < v < x`), mirroring the alphabetical symbol ordering of the
/// underlying solver keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Key {
    /// IMU bias at an endpoint
    B(usize),
    /// IMU pose at an endpoint
    E(usize),
    /// World-frame IMU velocity at an endpoint
    V(usize),
    /// Submap-origin pose
    X(usize),
}

impl Key {
    /// The single-letter symbol of this key.
    pub fn chr(&self) -> char {
        match self {
            Key::B(_) => 'b',
            Key::E(_) => 'e',
            Key::V(_) => 'v',
            Key::X(_) => 'x',
        }
    }

    /// The integer index of this key.
    pub fn index(&self) -> usize {
        match self {
            Key::B(i) | Key::E(i) | Key::V(i) | Key::X(i) => *i,
        }
    }

    pub fn is_pose(&self) -> bool {
        matches!(self, Key::X(_))
    }

    /// The submap this key belongs to. Endpoint keys indexed `n` belong to
    /// submap `n / 2`.
    pub fn submap(&self) -> usize {
        match self {
            Key::X(i) => *i,
            Key::B(i) | Key::E(i) | Key::V(i) => *i / 2,
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.chr(), self.index())
    }
}

impl FromStr for Key {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut chars = s.chars();
        let chr = chars.next().ok_or_else(|| "empty key".to_string())?;
        let index: usize = chars
            .as_str()
            .parse()
            .map_err(|_| format!("invalid key index in '{s}'"))?;
        match chr {
            'b' => Ok(Key::B(index)),
            'e' => Ok(Key::E(index)),
            'v' => Ok(Key::V(index)),
            'x' => Ok(Key::X(index)),
            _ => Err(format!("unknown key symbol '{chr}'")),
        }
    }
}
