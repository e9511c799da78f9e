// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipOp {
    Join,
    Leave,
}

impl MembershipOp {
    fn code(self) -> char {
        match self {
            MembershipOp::Join => 'J',
            MembershipOp::Leave => 'L',
        }
    }
}

/// A membership change published under the event key, encoded as `J<rank>` or `L<rank>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MembershipEvent {
    pub op: MembershipOp,
    pub rank: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EventParseError {
    #[error("empty event")]
    Empty,

    #[error("unknown event opcode {0:?}")]
    UnknownOp(char),

    #[error("invalid rank in event {0:?}")]
    InvalidRank(String),

    #[error("invalid exit status {0:?}")]
    InvalidStatus(String),
}

impl MembershipEvent {
    pub fn join(rank: u32) -> Self {
        Self {
            op: MembershipOp::Join,
            rank,
        }
    }

    pub fn leave(rank: u32) -> Self {
        Self {
            op: MembershipOp::Leave,
            rank,
        }
    }
}

impl fmt::Display for MembershipEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.op.code(), self.rank)
    }
}

impl FromStr for MembershipEvent {
    type Err = EventParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut chars = s.chars();
        let op = match chars.next() {
            None => return Err(EventParseError::Empty),
            Some('J') => MembershipOp::Join,
            Some('L') => MembershipOp::Leave,
            Some(other) => return Err(EventParseError::UnknownOp(other)),
        };
        let digits = chars.as_str();
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(EventParseError::InvalidRank(s.to_string()));
        }
        let rank = digits
            .parse::<u32>()
            .map_err(|_| EventParseError::InvalidRank(s.to_string()))?;
        Ok(Self { op, rank })
    }
}

/// Decode the decimal status written under the exit key.
pub fn parse_exit_status(raw: &[u8]) -> Result<i32, EventParseError> {
    let text = String::from_utf8_lossy(raw);
    text.trim()
        .parse::<i32>()
        .map_err(|_| EventParseError::InvalidStatus(text.into_owned()))
}
