//! Presentation tracking
//!
//! Turns successive registry snapshots into the texture work a compositor
//! has to do: import new buffers, release dead ones, and upload freshly
//! committed shared-memory halves of visible images.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::registry::{ImageContent, ImageView};

/// Work for the renderer, in image id order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentAction {
    /// Create GPU resources for a new image (or a re-created id)
    Import { id: u8 },
    /// Drop GPU resources of an image that is gone or replaced
    Release { id: u8 },
    /// Copy half `half` of a shared-memory image into its texture
    Upload { id: u8, half: u8 },
}

#[derive(Debug, Clone, Copy)]
struct Tracked {
    serial: u64,
    uploaded: Option<u64>,
}

/// Remembers what the renderer already holds for each image
#[derive(Debug, Default)]
pub struct PresentTracker {
    tracked: HashMap<u8, Tracked>,
}

impl PresentTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of images with imported resources
    pub fn len(&self) -> usize {
        self.tracked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracked.is_empty()
    }

    /// Diff `snapshot` against the last one
    pub fn update(
        &mut self,
        snapshot: &BTreeMap<u8, ImageView<'_>>,
        no_display: bool,
    ) -> Vec<PresentAction> {
        let ids: BTreeSet<u8> = self
            .tracked
            .keys()
            .chain(snapshot.keys())
            .copied()
            .collect();

        let mut actions = Vec::new();
        for id in ids {
            let Some(view) = snapshot.get(&id) else {
                self.tracked.remove(&id);
                actions.push(PresentAction::Release { id });
                continue;
            };

            let tracked = match self.tracked.get(&id) {
                Some(t) if t.serial == view.serial => *t,
                previous => {
                    if previous.is_some() {
                        actions.push(PresentAction::Release { id });
                    }
                    actions.push(PresentAction::Import { id });
                    Tracked { serial: view.serial, uploaded: None }
                }
            };

            let mut uploaded = tracked.uploaded;
            if no_display || !view.visible {
                // Force a fresh upload once it is shown again
                uploaded = None;
            } else if let ImageContent::SharedMemory { committed_half: Some(half), pixels: Some(_) } =
                view.content
            {
                if uploaded != Some(view.commit_serial) {
                    actions.push(PresentAction::Upload { id, half });
                    uploaded = Some(view.commit_serial);
                }
            }

            self.tracked.insert(id, Tracked { uploaded, ..tracked });
        }

        actions
    }
}

/// Visible images that have something to draw, in id order
pub fn drawable<'s, 'a>(
    snapshot: &'s BTreeMap<u8, ImageView<'a>>,
    no_display: bool,
) -> Vec<&'s ImageView<'a>> {
    if no_display {
        return Vec::new();
    }
    snapshot
        .values()
        .filter(|view| view.visible)
        .filter(|view| match view.content {
            ImageContent::SharedMemory { committed_half, .. } => committed_half.is_some(),
            ImageContent::DmaBuf { .. } => true,
        })
        .collect()
}
