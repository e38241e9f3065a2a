use chrono::Utc;
use serde::{Deserialize, Serialize};

/// A confirmed fall. Handed to the alert dispatcher exactly once.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub id: u64,
    pub unstable_since: f64, // frame clock, seconds
    pub confirmed_at: f64,   // frame clock, seconds
    pub time_to_confirm: f64,
    pub message: String,
    pub wall_clock: String, // RFC 3339
}

impl Incident {
    pub fn new(id: u64, unstable_since: f64, confirmed_at: f64, message: &str) -> Self {
        Self {
            id,
            unstable_since,
            confirmed_at,
            time_to_confirm: confirmed_at - unstable_since,
            message: message.to_string(),
            wall_clock: Utc::now().to_rfc3339(),
        }
    }
}
