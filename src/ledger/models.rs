use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Income entity - one expected payment for a subtask
///
/// Natural key used by batch matching: (payer_address, subtask_id)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Income {
    pub id: i64,
    /// Peer that performed the work (informational)
    pub sender_node: String,
    pub subtask_id: String,
    pub payer_address: String,

    /// Smallest currency unit
    #[serde(with = "amount_string")]
    pub value_expected: u128,
    #[serde(with = "amount_string")]
    pub value_received: u128,

    /// Paying transaction hash, without the `0x` prefix
    pub transaction_ref: Option<String>,

    /// Unix seconds
    pub accepted_ts: Option<i64>,
    pub settled_ts: Option<i64>,

    pub overdue: bool,
    pub created_ts: DateTime<Utc>,
}

impl Income {
    /// Amount still owed
    pub fn outstanding(&self) -> u128 {
        self.value_expected.saturating_sub(self.value_received)
    }

    pub fn is_paid_in_full(&self) -> bool {
        self.outstanding() == 0
    }

    /// Not yet accepted and not overdue, i.e. still withdrawable
    pub fn is_pending(&self) -> bool {
        self.accepted_ts.is_none() && !self.overdue
    }

    /// Eligible for a batch transfer from `payer` closed at `closure_time`
    pub fn awaits_batch(&self, payer: &str, closure_time: i64) -> bool {
        self.payer_address == payer
            && self.accepted_ts.map_or(false, |ts| ts <= closure_time)
            && self.transaction_ref.is_none()
            && self.settled_ts.is_none()
    }

    /// Unpaid past the deadline, counted from acceptance or else from creation
    pub fn is_overdue_at(&self, now: DateTime<Utc>, deadline_secs: i64) -> bool {
        if self.overdue || self.transaction_ref.is_some() {
            return false;
        }
        match self.accepted_ts {
            Some(accepted) => now.timestamp().saturating_sub(accepted) > deadline_secs,
            None => {
                (now - self.created_ts).num_milliseconds() > deadline_secs.saturating_mul(1000)
            }
        }
    }
}

impl fmt::Display for Income {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Income(subtask={}, payer={}, expected={}, received={})",
            self.subtask_id, self.payer_address, self.value_expected, self.value_received
        )
    }
}

/// Fields supplied when a new expectation is recorded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewIncome {
    pub sender_node: String,
    pub subtask_id: String,
    pub payer_address: String,
    pub value_expected: u128,
}

/// Transaction hashes arrive as `0x…`; the ledger stores them bare.
pub fn normalize_tx_ref(tx_ref: &str) -> String {
    tx_ref
        .strip_prefix("0x")
        .or_else(|| tx_ref.strip_prefix("0X"))
        .unwrap_or(tx_ref)
        .to_string()
}

/// u128 amounts as decimal strings on the wire
pub mod amount_string {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(D::Error::custom)
    }
}
