use super::ids::MedicationId;
use serde::{Deserialize, Serialize};

/// Controlled substance schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Schedule {
    II,
    III,
    IV,
    V,
}

impl Schedule {
    pub fn as_str(&self) -> &'static str {
        match self {
            Schedule::II => "II",
            Schedule::III => "III",
            Schedule::IV => "IV",
            Schedule::V => "V",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().trim_start_matches("C-").to_ascii_uppercase().as_str() {
            "II" | "2" => Some(Schedule::II),
            "III" | "3" => Some(Schedule::III),
            "IV" | "4" => Some(Schedule::IV),
            "V" | "5" => Some(Schedule::V),
            _ => None,
        }
    }
}

/// Read-only catalog view of a medication
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MedicationInfo {
    pub id: MedicationId,
    pub name: String,
    pub schedule: Schedule,
    pub default_unit: Option<String>,
    pub ndc: Option<String>,
    pub form: Option<String>,
    pub strength: Option<String>,
    /// Stocked only as patient-specific supply, never as lots
    pub patient_inventory_only: bool,
    pub is_active: bool,
}
