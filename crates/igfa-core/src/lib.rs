//! Core domain model for IGFA: festival records, enrichment sub-documents,
//! Steam-feature history, and sync audit entries.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "igfa-core";

/// Named subset of the source data, reconciled independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Partition {
    #[serde(rename = "curated")]
    Curated,
    #[serde(rename = "underConsideration")]
    UnderConsideration,
}

impl Partition {
    pub const ALL: [Partition; 2] = [Partition::Curated, Partition::UnderConsideration];

    pub fn as_str(&self) -> &'static str {
        match self {
            Partition::Curated => "curated",
            Partition::UnderConsideration => "underConsideration",
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown partition: {0}")]
pub struct ParsePartitionError(String);

impl FromStr for Partition {
    type Err = ParsePartitionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "curated" => Ok(Partition::Curated),
            "underConsideration" => Ok(Partition::UnderConsideration),
            other => Err(ParsePartitionError(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationStatus {
    Pending,
    Verified,
    Failed,
    Outdated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AiStatus {
    Pending,
    Enriched,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Success,
    Partial,
    Failed,
}

/// Scrape-derived enrichment sub-document. Owned exclusively by the
/// enrichment runner; a sync pass never writes these fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrapeEnrichment {
    pub image_url: Option<String>,
    pub logo_url: Option<String>,
    pub description: Option<String>,
    pub twitter: Option<String>,
    pub discord: Option<String>,
    pub location: Option<String>,
    pub organizer: Option<String>,
    pub status: VerificationStatus,
    pub verified_at: Option<DateTime<Utc>>,
    pub last_checked_at: Option<DateTime<Utc>>,
}

impl ScrapeEnrichment {
    pub fn pending() -> Self {
        Self {
            image_url: None,
            logo_url: None,
            description: None,
            twitter: None,
            discord: None,
            location: None,
            organizer: None,
            status: VerificationStatus::Pending,
            verified_at: None,
            last_checked_at: None,
        }
    }
}

/// Partial scrape result: a strategy fills whatever it could find and the
/// runner merges the populated fields into the stored sub-document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrapeFields {
    pub image_url: Option<String>,
    pub logo_url: Option<String>,
    pub description: Option<String>,
    pub twitter: Option<String>,
    pub discord: Option<String>,
    pub location: Option<String>,
    pub organizer: Option<String>,
}

impl ScrapeFields {
    pub fn is_empty(&self) -> bool {
        self.image_url.is_none()
            && self.logo_url.is_none()
            && self.description.is_none()
            && self.twitter.is_none()
            && self.discord.is_none()
            && self.location.is_none()
            && self.organizer.is_none()
    }

    /// Merge populated fields from `other` into fields still unset here.
    pub fn merge(&mut self, other: ScrapeFields) {
        fn take(dst: &mut Option<String>, src: Option<String>) {
            if dst.is_none() {
                *dst = src;
            }
        }
        take(&mut self.image_url, other.image_url);
        take(&mut self.logo_url, other.logo_url);
        take(&mut self.description, other.description);
        take(&mut self.twitter, other.twitter);
        take(&mut self.discord, other.discord);
        take(&mut self.location, other.location);
        take(&mut self.organizer, other.organizer);
    }
}

/// Structured payload returned by the generative lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiProfile {
    #[serde(default)]
    pub entity: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub overview: String,
    #[serde(default)]
    pub event_details: String,
    #[serde(default)]
    pub participants: String,
    #[serde(default)]
    pub industry_context: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiEnrichment {
    pub profile: Option<AiProfile>,
    /// Monotonically increasing payload version; records below the current
    /// version are candidates for re-enrichment.
    pub version: i64,
    pub status: AiStatus,
    pub enriched_at: Option<DateTime<Utc>>,
}

/// Canonical descriptive fields produced by row normalization. This is the
/// handoff contract from the source adapter into the reconciler; identity is
/// `(name, partition)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DescriptiveFields {
    pub name: String,
    pub partition: Partition,
    pub festival_type: String,
    pub when_text: String,
    pub deadline: Option<String>,
    pub submission_open: bool,
    pub price: String,
    pub worth_it: String,
    pub comments: String,
    pub official_page: String,
    pub steam_page: String,
    pub days_to_submit: Option<i64>,
}

/// Persisted festival record: descriptive fields stamped by the reconciler
/// plus enrichment sub-documents owned by the enrichment runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FestivalRecord {
    pub id: Uuid,
    pub slug: String,
    pub name: String,
    pub partition: Partition,
    pub festival_type: String,
    pub when_text: String,
    pub deadline: Option<String>,
    pub submission_open: bool,
    pub price: String,
    pub worth_it: String,
    pub comments: String,
    pub official_page: String,
    pub steam_page: String,
    pub days_to_submit: Option<i64>,
    /// Epoch of the sync pass that last confirmed this record in the source.
    /// None means created out-of-band, never confirmed.
    pub last_synced_epoch: Option<DateTime<Utc>>,
    pub enrichment: Option<ScrapeEnrichment>,
    pub ai_enrichment: Option<AiEnrichment>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Steam-featuring years carried by the source sheet. Fixed set; anything
/// else is rejected rather than mapped to a synthesized field name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SteamYear {
    #[serde(rename = "2023")]
    Y2023,
    #[serde(rename = "2024")]
    Y2024,
    #[serde(rename = "2025")]
    Y2025,
}

impl SteamYear {
    pub const ALL: [SteamYear; 3] = [SteamYear::Y2023, SteamYear::Y2024, SteamYear::Y2025];

    pub fn as_u16(&self) -> u16 {
        match self {
            SteamYear::Y2023 => 2023,
            SteamYear::Y2024 => 2024,
            SteamYear::Y2025 => 2025,
        }
    }
}

#[derive(Debug, Error)]
#[error("unsupported steam-feature year: {0}")]
pub struct UnsupportedYearError(pub u16);

impl TryFrom<u16> for SteamYear {
    type Error = UnsupportedYearError;

    fn try_from(year: u16) -> Result<Self, Self::Error> {
        match year {
            2023 => Ok(SteamYear::Y2023),
            2024 => Ok(SteamYear::Y2024),
            2025 => Ok(SteamYear::Y2025),
            other => Err(UnsupportedYearError(other)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct YearSlot {
    pub status: String,
    pub detail: String,
}

/// One event's Steam-featuring history, keyed by festival name. Upserted on
/// every sync pass, never deleted by staleness logic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SteamFeatureRecord {
    pub name: String,
    pub year_2023: YearSlot,
    pub year_2024: YearSlot,
    pub year_2025: YearSlot,
    pub updated_at: DateTime<Utc>,
}

impl SteamFeatureRecord {
    pub fn slot(&self, year: SteamYear) -> &YearSlot {
        match year {
            SteamYear::Y2023 => &self.year_2023,
            SteamYear::Y2024 => &self.year_2024,
            SteamYear::Y2025 => &self.year_2025,
        }
    }

    pub fn slot_mut(&mut self, year: SteamYear) -> &mut YearSlot {
        match year {
            SteamYear::Y2023 => &mut self.year_2023,
            SteamYear::Y2024 => &mut self.year_2024,
            SteamYear::Y2025 => &mut self.year_2025,
        }
    }
}

/// Immutable record of one sync pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncAuditEntry {
    pub id: Uuid,
    pub ran_at: DateTime<Utc>,
    pub partitions: Vec<Partition>,
    pub festivals_synced: u64,
    pub steam_features_synced: u64,
    pub deleted: u64,
    pub status: SyncStatus,
    pub errors: Vec<String>,
}

/// Derive the URL-safe base slug for a festival name: lowercased,
/// punctuation stripped, whitespace collapsed to single hyphens.
/// Uniqueness (numeric suffixing) is handled at insert time by the store.
pub fn derive_slug(name: &str) -> String {
    name.to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_strips_punctuation_and_hyphenates() {
        assert_eq!(derive_slug("Indie Live Expo!"), "indie-live-expo");
        assert_eq!(derive_slug("  A  Maze. / Berlin  "), "a-maze-berlin");
        assert_eq!(derive_slug("PAX West 2025"), "pax-west-2025");
    }

    #[test]
    fn partition_round_trips_through_str() {
        for p in Partition::ALL {
            assert_eq!(p.as_str().parse::<Partition>().unwrap(), p);
        }
        assert!("steam".parse::<Partition>().is_err());
    }

    #[test]
    fn steam_year_rejects_unsupported_values() {
        assert!(SteamYear::try_from(2023).is_ok());
        assert!(SteamYear::try_from(2022).is_err());
        assert!(SteamYear::try_from(2026).is_err());
    }

    #[test]
    fn scrape_fields_merge_keeps_existing_values() {
        let mut a = ScrapeFields {
            image_url: Some("https://a.example/banner.png".into()),
            ..Default::default()
        };
        a.merge(ScrapeFields {
            image_url: Some("https://b.example/other.png".into()),
            description: Some("an indie showcase".into()),
            ..Default::default()
        });
        assert_eq!(a.image_url.as_deref(), Some("https://a.example/banner.png"));
        assert_eq!(a.description.as_deref(), Some("an indie showcase"));
    }
}
