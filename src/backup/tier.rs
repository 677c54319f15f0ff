//! Retention tiers

use chrono::{Datelike, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

/// Retention class of an artifact, fixed at creation time.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Display,
    EnumString,
    AsRefStr,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Daily,
    Weekly,
    Monthly,
}

impl Tier {
    /// Every tier, in pruning order.
    pub const ALL: [Tier; 3] = [Tier::Daily, Tier::Weekly, Tier::Monthly];

    /// Classify a creation date.
    ///
    /// The 1st of the month is `Monthly`; otherwise the last day of the
    /// week is `Weekly`; anything else is `Daily`.
    pub fn classify(date: NaiveDate, week_ends_on: Weekday) -> Tier {
        if date.day() == 1 {
            Tier::Monthly
        } else if date.weekday() == week_ends_on {
            Tier::Weekly
        } else {
            Tier::Daily
        }
    }
}
