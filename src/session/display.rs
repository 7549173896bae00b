//! Display state: which single asset, if any, is on screen

use super::model::{Asset, AssetManifest, ClipRange};
use std::sync::Arc;
use tracing::{debug, warn};

/// What the render layer should show
#[derive(Debug, Clone, Default)]
pub enum DisplayState {
    #[default]
    Empty,
    Showing {
        asset: Arc<Asset>,
        /// Clip supplied at display time; takes precedence over the asset's default
        clip_override: Option<ClipRange>,
    },
}

impl PartialEq for DisplayState {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (DisplayState::Empty, DisplayState::Empty) => true,
            (
                DisplayState::Showing {
                    asset: a,
                    clip_override: ca,
                },
                DisplayState::Showing {
                    asset: b,
                    clip_override: cb,
                },
            ) => (Arc::ptr_eq(a, b) || a == b) && ca == cb,
            _ => false,
        }
    }
}

impl DisplayState {
    pub fn asset(&self) -> Option<&Arc<Asset>> {
        match self {
            DisplayState::Empty => None,
            DisplayState::Showing { asset, .. } => Some(asset),
        }
    }

    /// The clip to play: the override when present, else the asset's default
    pub fn effective_clip(&self) -> Option<ClipRange> {
        match self {
            DisplayState::Empty => None,
            DisplayState::Showing {
                asset,
                clip_override,
            } => clip_override.or_else(|| asset.default_clip()),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, DisplayState::Empty)
    }
}

/// Tracks the displayed asset for one session
#[derive(Debug, Default)]
pub struct Display {
    state: DisplayState,
}

impl Display {
    pub fn state(&self) -> &DisplayState {
        &self.state
    }

    /// Replace the display. Returns true when the visible state changed.
    ///
    /// An inline asset is prepared by the manifest (locations resolved, invalid
    /// default clip dropped) and takes precedence; otherwise `asset_id` is looked up
    /// in the manifest and a miss clears the display.
    pub fn show(
        &mut self,
        manifest: &AssetManifest,
        asset_id: &str,
        inline: Option<Asset>,
        start: Option<f64>,
        end: Option<f64>,
    ) -> bool {
        let asset = match inline {
            Some(asset) => Ok(manifest.adopt(asset)),
            None => manifest.resolve(asset_id),
        };

        let next = match asset {
            Ok(asset) => DisplayState::Showing {
                clip_override: sanitize_override(&asset.id, start, end),
                asset,
            },
            Err(miss) => {
                debug!("{}, clearing display", miss);
                DisplayState::Empty
            }
        };

        self.replace(next)
    }

    /// Clear the display. Returns true when something was showing.
    pub fn hide(&mut self) -> bool {
        self.replace(DisplayState::Empty)
    }

    fn replace(&mut self, next: DisplayState) -> bool {
        if self.state == next {
            return false;
        }
        self.state = next;
        true
    }
}

fn sanitize_override(asset_id: &str, start: Option<f64>, end: Option<f64>) -> Option<ClipRange> {
    let clip = ClipRange::from_bounds(start, end)?;
    match clip.validate() {
        Ok(()) => Some(clip),
        Err(reason) => {
            warn!(asset_id = %asset_id, "Ignoring clip override: {}", reason);
            None
        }
    }
}
