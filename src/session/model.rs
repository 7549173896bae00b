//! Session data model: speakers, assets and the per-session asset manifest

use crate::error::ResolutionMiss;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::warn;
use url::Url;

/// Who produced a transcript fragment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    /// The server historically calls the agent "bot"
    #[serde(alias = "bot")]
    Agent,
}

impl fmt::Display for Speaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Speaker::User => write!(f, "user"),
            Speaker::Agent => write!(f, "agent"),
        }
    }
}

/// Kind of displayable asset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetKind {
    Image,
    Video,
}

/// Playback range in seconds. Either bound may be open.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ClipRange {
    pub start: Option<f64>,
    pub end: Option<f64>,
}

impl ClipRange {
    /// Build a range, returning None when neither bound is set
    pub fn from_bounds(start: Option<f64>, end: Option<f64>) -> Option<Self> {
        if start.is_none() && end.is_none() {
            None
        } else {
            Some(Self { start, end })
        }
    }

    /// Check that bounds are finite, non-negative and ordered
    pub fn validate(&self) -> Result<(), String> {
        for bound in [self.start, self.end].into_iter().flatten() {
            if !bound.is_finite() || bound < 0.0 {
                return Err(format!("clip bound {} must be a finite value >= 0", bound));
            }
        }
        if let (Some(start), Some(end)) = (self.start, self.end) {
            if end <= start {
                return Err(format!("clip end {} must be after start {}", end, start));
            }
        }
        Ok(())
    }
}

/// A displayable image or video. Immutable once the session is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    #[serde(rename = "asset_id")]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(rename = "type")]
    pub kind: AssetKind,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poster_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_sec: Option<f64>,
    /// Default clip start for videos, in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<f64>,
    /// Default clip end for videos, in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<f64>,
}

impl Asset {
    /// The asset's own default clip, if it has one
    pub fn default_clip(&self) -> Option<ClipRange> {
        ClipRange::from_bounds(self.start_time, self.end_time)
    }

    /// Resolve server-relative locations ("/storage/...") against the server base URL
    pub(crate) fn resolve_locations(&mut self, base: &Url) {
        if let Ok(resolved) = base.join(&self.url) {
            self.url = resolved.to_string();
        }
        if let Some(poster) = self.poster_url.as_mut() {
            if let Ok(resolved) = base.join(poster) {
                *poster = resolved.to_string();
            }
        }
    }
}

/// Asset manifest validation errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ManifestError {
    #[error("Duplicate asset id: {0}")]
    DuplicateId(String),

    #[error("Asset {id} has an invalid default clip: {reason}")]
    InvalidClip { id: String, reason: String },

    #[error("Asset with an empty id")]
    EmptyId,
}

/// Ordered, immutable set of assets available to a session
#[derive(Debug, Clone, Default)]
pub struct AssetManifest {
    assets: Vec<Arc<Asset>>,
    /// Server base URL that relative asset locations are resolved against
    base: Option<Url>,
}

impl AssetManifest {
    /// Validate and freeze the assets supplied at session creation
    pub fn new(assets: Vec<Asset>) -> Result<Self, ManifestError> {
        let mut seen = HashSet::new();
        for asset in &assets {
            if asset.id.is_empty() {
                return Err(ManifestError::EmptyId);
            }
            if !seen.insert(asset.id.as_str()) {
                return Err(ManifestError::DuplicateId(asset.id.clone()));
            }
            if let Some(clip) = asset.default_clip() {
                clip.validate().map_err(|reason| ManifestError::InvalidClip {
                    id: asset.id.clone(),
                    reason,
                })?;
            }
        }
        Ok(Self {
            assets: assets.into_iter().map(Arc::new).collect(),
            base: None,
        })
    }

    /// Validate the assets, resolving their locations against `base`
    pub fn with_base(assets: Vec<Asset>, base: &Url) -> Result<Self, ManifestError> {
        let assets = assets
            .into_iter()
            .map(|mut asset| {
                asset.resolve_locations(base);
                asset
            })
            .collect();
        let mut manifest = Self::new(assets)?;
        manifest.base = Some(base.clone());
        Ok(manifest)
    }

    /// Prepare an asset delivered inside a display event the same way manifest
    /// assets are: locations resolved, and an invalid default clip dropped.
    pub fn adopt(&self, mut asset: Asset) -> Arc<Asset> {
        if let Some(base) = &self.base {
            asset.resolve_locations(base);
        }
        if let Some(clip) = asset.default_clip() {
            if let Err(reason) = clip.validate() {
                warn!(asset_id = %asset.id, "Ignoring default clip of inline asset: {}", reason);
                asset.start_time = None;
                asset.end_time = None;
            }
        }
        Arc::new(asset)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Asset>> {
        self.assets.iter().find(|a| a.id == id).cloned()
    }

    pub fn resolve(&self, id: &str) -> Result<Arc<Asset>, ResolutionMiss> {
        self.get(id).ok_or_else(|| ResolutionMiss(id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }
}

/// Session creation response, as returned by the server and saved for `join`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDescriptor {
    pub session_id: String,
    /// Server-relative path of the audio negotiation endpoint
    pub webrtc_url: String,
    #[serde(default)]
    pub asset_manifest: Vec<Asset>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frontend_link: Option<String>,
}

/// One interview run
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub negotiation_path: String,
    pub assets: AssetManifest,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Session {
    /// Build a session from a creation response, resolving asset locations against `base`
    pub fn from_descriptor(descriptor: SessionDescriptor, base: &Url) -> Result<Self, ManifestError> {
        Ok(Self {
            id: descriptor.session_id,
            negotiation_path: descriptor.webrtc_url,
            assets: AssetManifest::with_base(descriptor.asset_manifest, base)?,
            created_at: Utc::now(),
            ended_at: None,
        })
    }
}

#[cfg(test)]
pub(crate) fn image(id: &str) -> Asset {
    Asset {
        id: id.to_string(),
        title: format!("Slide {}", id),
        kind: AssetKind::Image,
        url: format!("/storage/{}.png", id),
        poster_url: None,
        duration_sec: None,
        start_time: None,
        end_time: None,
    }
}

#[cfg(test)]
pub(crate) fn video(id: &str, start: Option<f64>, end: Option<f64>) -> Asset {
    Asset {
        id: id.to_string(),
        title: format!("Clip {}", id),
        kind: AssetKind::Video,
        url: format!("/storage/{}.mp4", id),
        poster_url: Some(format!("/storage/{}.jpg", id)),
        duration_sec: Some(60.0),
        start_time: start,
        end_time: end,
    }
}
