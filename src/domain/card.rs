//! Card definitions as delivered inside a deck detail payload.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Upstream identifier of a card definition
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CardId(String);

impl CardId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CardId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// A card definition. One definition is shared by every deck that contains it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CardRecord {
    pub id: CardId,
    #[serde(default)]
    pub card_title: Option<String>,
    #[serde(default)]
    pub house: Option<String>,
    #[serde(default)]
    pub card_type: Option<String>,
    #[serde(default)]
    pub front_image: Option<String>,
    #[serde(default)]
    pub card_text: Option<String>,
    #[serde(default)]
    pub traits: Option<String>,
    #[serde(default, deserialize_with = "lenient_int")]
    pub amber: Option<i64>,
    #[serde(default, deserialize_with = "lenient_int")]
    pub power: Option<i64>,
    #[serde(default, deserialize_with = "lenient_int")]
    pub armor: Option<i64>,
    #[serde(default)]
    pub rarity: Option<String>,
    #[serde(default)]
    pub flavor_text: Option<String>,
    /// Collector number; the vault sometimes prefixes it with a set marker (`"A123"`)
    #[serde(default, deserialize_with = "card_number")]
    pub card_number: Option<i64>,
    pub expansion: i64,
    #[serde(default)]
    pub is_maverick: bool,
    #[serde(default)]
    pub is_anomaly: bool,
    #[serde(default)]
    pub is_enhanced: bool,
    #[serde(default)]
    pub is_non_deck: bool,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrText {
    Number(i64),
    Text(String),
    Other(serde_json::Value),
}

/// Accepts integers and numeric strings; anything else (`"X"`, null) becomes `None`.
fn lenient_int<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<NumberOrText>::deserialize(deserializer)? {
        Some(NumberOrText::Number(n)) => Some(n),
        Some(NumberOrText::Text(s)) => s.trim().parse().ok(),
        Some(NumberOrText::Other(_)) | None => None,
    })
}

fn card_number<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<NumberOrText>::deserialize(deserializer)? {
        Some(NumberOrText::Number(n)) => Some(n),
        Some(NumberOrText::Text(s)) => parse_card_number(&s),
        Some(NumberOrText::Other(_)) | None => None,
    })
}

/// Parses a collector number, dropping a leading marker character when the
/// text is not numeric as a whole.
#[must_use]
pub fn parse_card_number(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    if let Ok(n) = raw.parse() {
        return Some(n);
    }
    let mut chars = raw.chars();
    chars.next()?;
    chars.as_str().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn card_number_accepts_numbers_and_prefixed_text() {
        assert_eq!(parse_card_number("123"), Some(123));
        assert_eq!(parse_card_number("A123"), Some(123));
        assert_eq!(parse_card_number("~"), None);
        assert_eq!(parse_card_number(""), None);
    }

    #[test]
    fn card_record_tolerates_loose_stat_fields() {
        let card: CardRecord = serde_json::from_str(
            r#"{
                "id": "c-1",
                "card_title": "Ancient Bear",
                "house": "Untamed",
                "card_type": "Creature",
                "power": "5",
                "armor": null,
                "amber": 0,
                "card_number": "S041",
                "expansion": 341,
                "is_maverick": false
            }"#,
        )
        .unwrap();

        assert_eq!(card.id, CardId::new("c-1"));
        assert_eq!(card.power, Some(5));
        assert_eq!(card.armor, None);
        assert_eq!(card.amber, Some(0));
        assert_eq!(card.card_number, Some(41));
        assert_eq!(card.expansion, 341);
        assert!(!card.is_non_deck);
    }
}
