use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The account owner's profile (single-slot entity)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub id: Option<String>,
  pub display_name: String,
  pub email: String,
  #[serde(default)]
  pub bio: Option<String>,
}

/// Free-form note (append-only list entity)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
  /// Assigned by the server; absent for notes created offline
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub id: Option<String>,
  pub title: String,
  pub body: String,
  pub created_at: DateTime<Utc>,
}

/// A single location trace sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationPoint {
  pub recorded_at: DateTime<Utc>,
  pub latitude: f64,
  pub longitude: f64,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub accuracy_m: Option<f64>,
}
