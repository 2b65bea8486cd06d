//! Object records: the persisted metadata row for one stored object.
//!
//! Each field can be read on its own without touching the payload, which is
//! what the request layer uses to answer single-field metadata queries.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::hash::Digest;
use crate::sniff;

/// Default rendering for timestamp fields.
pub const DEFAULT_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Stable, externally addressable object identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(pub i64);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ObjectId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(ObjectId)
    }
}

/// Metadata for one distinct piece of content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRecord {
    pub id: ObjectId,
    pub digest: Digest,
    pub media_type: String,
    pub size: u64,
    pub reference_count: u64,
    pub created_at: DateTime<Utc>,
    pub last_access_at: Option<DateTime<Utc>>,
    pub access_count: u64,
}

impl ObjectRecord {
    /// File extension for the media type, including the leading dot.
    ///
    /// Empty when the media type has no known extension.
    pub fn suffix(&self) -> String {
        sniff::suffix_for(&self.media_type)
    }

    /// Unique file name built from the digest and suffix.
    pub fn filename(&self) -> String {
        format!("{}{}", self.digest, self.suffix())
    }

    /// Render a single metadata field.
    pub fn field(&self, field: MetaField, time_format: &str) -> String {
        match field {
            MetaField::Digest => self.digest.to_string(),
            MetaField::Size => self.size.to_string(),
            MetaField::ReferenceCount => self.reference_count.to_string(),
            MetaField::MediaType => self.media_type.clone(),
            MetaField::AccessCount => self.access_count.to_string(),
            MetaField::LastAccess => match self.last_access_at {
                Some(at) => at.format(time_format).to_string(),
                None => "never".to_string(),
            },
            MetaField::Created => self.created_at.format(time_format).to_string(),
        }
    }
}

/// A single queryable metadata field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaField {
    Digest,
    Size,
    ReferenceCount,
    MediaType,
    AccessCount,
    LastAccess,
    Created,
}

impl MetaField {
    pub const ALL: [MetaField; 7] = [
        MetaField::Digest,
        MetaField::Size,
        MetaField::ReferenceCount,
        MetaField::MediaType,
        MetaField::AccessCount,
        MetaField::LastAccess,
        MetaField::Created,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetaField::Digest => "digest",
            MetaField::Size => "size",
            MetaField::ReferenceCount => "reference_count",
            MetaField::MediaType => "media_type",
            MetaField::AccessCount => "access_count",
            MetaField::LastAccess => "last_access",
            MetaField::Created => "created",
        }
    }
}

impl fmt::Display for MetaField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unknown metadata field name.
#[derive(Debug, thiserror::Error)]
#[error("invalid metadata field: {0}")]
pub struct UnknownField(pub String);

impl FromStr for MetaField {
    type Err = UnknownField;

    // Legacy names from older clients are still accepted.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "digest" | "sha256sum" => Ok(MetaField::Digest),
            "size" => Ok(MetaField::Size),
            "reference_count" | "hardlinks" => Ok(MetaField::ReferenceCount),
            "media_type" | "mimetype" => Ok(MetaField::MediaType),
            "access_count" | "accessed" => Ok(MetaField::AccessCount),
            "last_access" => Ok(MetaField::LastAccess),
            "created" => Ok(MetaField::Created),
            other => Err(UnknownField(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> ObjectRecord {
        ObjectRecord {
            id: ObjectId(7),
            digest: Digest::of(b"sample"),
            media_type: "image/png".to_string(),
            size: 6,
            reference_count: 2,
            created_at: Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap(),
            last_access_at: None,
            access_count: 0,
        }
    }

    #[test]
    fn test_field_rendering() {
        let record = sample();
        assert_eq!(record.field(MetaField::Size, DEFAULT_TIME_FORMAT), "6");
        assert_eq!(record.field(MetaField::ReferenceCount, DEFAULT_TIME_FORMAT), "2");
        assert_eq!(record.field(MetaField::LastAccess, DEFAULT_TIME_FORMAT), "never");
        assert_eq!(
            record.field(MetaField::Created, DEFAULT_TIME_FORMAT),
            "2024-03-01T12:30:00"
        );
        assert_eq!(record.field(MetaField::Created, "%Y"), "2024");
    }

    #[test]
    fn test_field_names() {
        for field in MetaField::ALL {
            assert_eq!(field.as_str().parse::<MetaField>().unwrap(), field);
        }
        assert_eq!("hardlinks".parse::<MetaField>().unwrap(), MetaField::ReferenceCount);
        assert_eq!("sha256sum".parse::<MetaField>().unwrap(), MetaField::Digest);
        assert!("times".parse::<MetaField>().is_err());
    }

    #[test]
    fn test_filename_uses_suffix() {
        let record = sample();
        assert_eq!(record.suffix(), ".png");
        assert_eq!(record.filename(), format!("{}.png", record.digest));
    }

    #[test]
    fn test_object_id_parse() {
        assert_eq!(" 42 ".parse::<ObjectId>().unwrap(), ObjectId(42));
        assert!("abc".parse::<ObjectId>().is_err());
    }
}
