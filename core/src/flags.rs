use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Review-status marker a user puts on a question. Two colors only; the
/// meaning of each is a UI convention (blue = revisit, red = problem).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum FlagColor {
    Blue,
    Red,
}

impl FlagColor {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlagColor::Blue => "blue",
            FlagColor::Red => "red",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "blue" => Some(FlagColor::Blue),
            "red" => Some(FlagColor::Red),
            _ => None,
        }
    }
}

/// A flag on one concrete question version. At most one per
/// (user_id, question_id); questions and users are platform-owned numeric ids.
///
/// The same logical question can exist as several versioned copies sharing a
/// question_bank_entry_id. Flags are kept consistent across those copies by
/// the reconciliation engine (and eagerly by the toggle endpoint).
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Flag {
    pub id: i64,
    pub user_id: i64,
    pub question_id: i64,
    pub color: FlagColor,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::FlagColor;

    #[test]
    fn color_round_trips_through_str() {
        for color in [FlagColor::Blue, FlagColor::Red] {
            assert_eq!(FlagColor::parse(color.as_str()), Some(color));
        }
        assert_eq!(FlagColor::parse("green"), None);
    }

    #[test]
    fn color_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&FlagColor::Blue).unwrap(),
            "\"blue\""
        );
    }
}
