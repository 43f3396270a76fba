use crate::error::PlaylistError;
use crate::playlist::{parse_manifest, render_manifest, window_size, SegmentEntry};
use crate::source::CameraSource;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, warn};

/// How many windows worth of segments the group manifest retains
const RETAIN_WINDOWS: usize = 3;

/// What one scheduling tick did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// A fragment from the named member index was stitched in
    Stitched { member: usize, appended: usize },
    /// No member was reachable, or the active member's manifest was
    /// unavailable; the previous manifest stays valid
    Skipped,
    /// The active member's manifest parsed to zero entries
    NoNewData,
}

/// Stitches fragments from a ring of rotating member sources into one
/// cumulative group manifest.
///
/// Each tick advances round-robin to the next reachable member, unless a
/// member reports motion, in which case the nearest motion source (scanning
/// forward, wrapping once) takes priority. The chosen member's manifest is
/// windowed, its segment URIs are prefixed with the member index so
/// identically named segment files from different sources never collide,
/// and the fragment is appended behind a discontinuity marker.
/// `media_sequence` and `discontinuity_sequence` never decrease.
pub struct GroupStitcher {
    name: String,
    target_secs: f64,
    members: Vec<Arc<dyn CameraSource>>,
    active_index: usize,
    media_sequence: u64,
    discontinuity_sequence: u64,
    segments: VecDeque<SegmentEntry>,
    rendered: String,
}

impl GroupStitcher {
    /// Create a stitcher over the given member ring. An empty ring or a
    /// non-positive target duration is a configuration error; the group
    /// stays inactive rather than crashing the process.
    pub fn new(
        name: impl Into<String>,
        target_secs: f64,
        members: Vec<Arc<dyn CameraSource>>,
    ) -> Result<Self, PlaylistError> {
        if members.is_empty() {
            return Err(PlaylistError::EmptyGroup);
        }
        if target_secs <= 0.0 {
            return Err(PlaylistError::InvalidTarget(target_secs));
        }
        let rendered = render_manifest(std::iter::empty(), 0, 0);
        Ok(Self {
            name: name.into(),
            target_secs,
            // First advance lands on member 0
            active_index: members.len() - 1,
            members,
            media_sequence: 0,
            discontinuity_sequence: 0,
            segments: VecDeque::new(),
            rendered,
        })
    }

    /// Round-robin advance to the next reachable member, then let any
    /// member reporting motion override the choice. Returns None when no
    /// member is reachable at all.
    async fn pick_active(&mut self) -> Option<usize> {
        let count = self.members.len();

        let mut chosen = None;
        for step in 1..=count {
            let index = (self.active_index + step) % count;
            if self.members[index].is_reachable().await {
                chosen = Some(index);
                break;
            }
        }
        let mut active = chosen?;

        // Nearest motion source wins, scanning forward and wrapping once
        for step in 0..count {
            let index = (active + step) % count;
            if self.members[index].motion_active().await && self.members[index].is_reachable().await
            {
                if index != active {
                    debug!(
                        "Group {}: motion on member {} overrides rotation choice {}",
                        self.name, index, active
                    );
                }
                active = index;
                break;
            }
        }

        self.active_index = active;
        Some(active)
    }

    /// Run one scheduling tick. Failures never corrupt state: an
    /// unavailable member or malformed manifest leaves the previously
    /// rendered manifest served unchanged and both counters untouched.
    pub async fn tick(&mut self) -> Result<TickOutcome, PlaylistError> {
        let Some(active) = self.pick_active().await else {
            warn!("Group {}: no member reachable, skipping tick", self.name);
            return Ok(TickOutcome::Skipped);
        };

        let manifest = match self.members[active].fetch_manifest().await {
            Ok(text) => text,
            Err(e) => {
                // Source offline or just rotated in; previous manifest
                // remains valid until the next successful tick
                debug!("Group {}: member {} manifest unavailable: {}", self.name, active, e);
                return Ok(TickOutcome::Skipped);
            }
        };

        let entries = parse_manifest(&manifest)?;
        if entries.is_empty() {
            debug!("Group {}: member {} manifest has no segments", self.name, active);
            return Ok(TickOutcome::NoNewData);
        }

        let window = window_size(&entries, self.target_secs);
        for (offset, entry) in entries[entries.len() - window..].iter().enumerate() {
            self.segments.push_back(SegmentEntry {
                duration: entry.duration,
                uri: format!("{}/{}", active, entry.uri),
                discontinuity: offset == 0,
            });
        }
        self.discontinuity_sequence += 1;

        let bound = window * RETAIN_WINDOWS;
        while self.segments.len() > bound {
            self.segments.pop_front();
            self.media_sequence += 1;
        }

        self.rendered = render_manifest(
            self.segments.iter(),
            self.media_sequence,
            self.discontinuity_sequence,
        );

        Ok(TickOutcome::Stitched {
            member: active,
            appended: window,
        })
    }

    /// The most recently rendered group manifest; stays valid across
    /// skipped ticks
    pub fn manifest(&self) -> &str {
        &self.rendered
    }

    /// Drop a member from the rotation ring (source disposed). The active
    /// index is clamped so rotation continues from the same neighborhood.
    pub fn remove_member(&mut self, name: &str) -> bool {
        let Some(position) = self.members.iter().position(|m| m.name() == name) else {
            return false;
        };
        self.members.remove(position);
        if self.members.is_empty() {
            self.active_index = 0;
        } else {
            if position < self.active_index {
                self.active_index -= 1;
            }
            self.active_index %= self.members.len();
        }
        debug!("Group {}: removed member {}", self.name, name);
        true
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn active_index(&self) -> usize {
        self.active_index
    }

    pub fn media_sequence(&self) -> u64 {
        self.media_sequence
    }

    pub fn discontinuity_sequence(&self) -> u64 {
        self.discontinuity_sequence
    }

    pub fn retained(&self) -> usize {
        self.segments.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MockSource;

    fn simple_manifest() -> &'static str {
        "#EXTM3U\n#EXTINF:2,\nA.ts\n#EXTINF:2,\nB.ts\n#EXTINF:2,\nC.ts\n"
    }

    fn three_member_group() -> (GroupStitcher, Vec<Arc<MockSource>>) {
        let sources: Vec<Arc<MockSource>> = ["cam0", "cam1", "cam2"]
            .iter()
            .map(|name| {
                let source = MockSource::new(*name);
                source.set_manifest(Some(simple_manifest()));
                source
            })
            .collect();
        let members: Vec<Arc<dyn CameraSource>> = sources
            .iter()
            .map(|s| Arc::clone(s) as Arc<dyn CameraSource>)
            .collect();
        let stitcher = GroupStitcher::new("backyard", 4.0, members).unwrap();
        (stitcher, sources)
    }

    #[test]
    fn test_empty_group_rejected_at_setup() {
        assert!(matches!(
            GroupStitcher::new("empty", 4.0, Vec::new()),
            Err(PlaylistError::EmptyGroup)
        ));
    }

    #[tokio::test]
    async fn test_round_robin_rotation() {
        let (mut stitcher, _sources) = three_member_group();

        for expected in [0, 1, 2, 0, 1] {
            let outcome = stitcher.tick().await.unwrap();
            assert_eq!(
                outcome,
                TickOutcome::Stitched {
                    member: expected,
                    appended: 2
                }
            );
            assert_eq!(stitcher.active_index(), expected);
        }
    }

    #[tokio::test]
    async fn test_motion_overrides_rotation() {
        let (mut stitcher, sources) = three_member_group();

        // First tick rotates to member 0
        stitcher.tick().await.unwrap();
        assert_eq!(stitcher.active_index(), 0);

        // Rotation would pick member 1 next, but member 2 reports motion
        sources[2].motion_flag().set(true);
        let outcome = stitcher.tick().await.unwrap();
        assert!(matches!(outcome, TickOutcome::Stitched { member: 2, .. }));
        assert_eq!(stitcher.active_index(), 2);

        // Motion holds the ring on that member until it clears
        stitcher.tick().await.unwrap();
        assert_eq!(stitcher.active_index(), 2);

        sources[2].motion_flag().set(false);
        stitcher.tick().await.unwrap();
        assert_eq!(stitcher.active_index(), 0);
    }

    #[tokio::test]
    async fn test_uris_tagged_with_member_index() {
        let (mut stitcher, _sources) = three_member_group();
        stitcher.tick().await.unwrap();
        stitcher.tick().await.unwrap();

        let manifest = stitcher.manifest();
        assert!(manifest.contains("0/B.ts"));
        assert!(manifest.contains("0/C.ts"));
        assert!(manifest.contains("1/B.ts"));
        assert!(manifest.contains("1/C.ts"));
    }

    #[tokio::test]
    async fn test_discontinuity_per_stitch() {
        let (mut stitcher, _sources) = three_member_group();
        stitcher.tick().await.unwrap();
        stitcher.tick().await.unwrap();
        stitcher.tick().await.unwrap();

        assert_eq!(stitcher.discontinuity_sequence(), 3);
        let manifest = stitcher.manifest();
        assert!(manifest.contains("#EXT-X-DISCONTINUITY-SEQUENCE:3"));
        assert_eq!(manifest.matches("#EXT-X-DISCONTINUITY\n").count(), 3);
    }

    #[tokio::test]
    async fn test_unavailable_member_skips_tick_counters_hold() {
        let (mut stitcher, sources) = three_member_group();
        stitcher.tick().await.unwrap();
        let manifest_before = stitcher.manifest().to_string();
        let disc_before = stitcher.discontinuity_sequence();
        let media_before = stitcher.media_sequence();

        // Member 1 is reachable but its manifest file is gone
        sources[1].set_manifest(None);
        assert_eq!(stitcher.tick().await.unwrap(), TickOutcome::Skipped);

        assert_eq!(stitcher.manifest(), manifest_before);
        assert_eq!(stitcher.discontinuity_sequence(), disc_before);
        assert_eq!(stitcher.media_sequence(), media_before);

        // Next tick moves on to member 2 and stitches again
        let outcome = stitcher.tick().await.unwrap();
        assert!(matches!(outcome, TickOutcome::Stitched { member: 2, .. }));
        assert_eq!(stitcher.discontinuity_sequence(), disc_before + 1);
    }

    #[tokio::test]
    async fn test_unreachable_members_skipped_in_rotation() {
        let (mut stitcher, sources) = three_member_group();
        sources[0].set_reachable(false);

        let outcome = stitcher.tick().await.unwrap();
        assert!(matches!(outcome, TickOutcome::Stitched { member: 1, .. }));

        // Nobody reachable: tick skips, manifest unchanged
        for source in &sources {
            source.set_reachable(false);
        }
        let manifest_before = stitcher.manifest().to_string();
        assert_eq!(stitcher.tick().await.unwrap(), TickOutcome::Skipped);
        assert_eq!(stitcher.manifest(), manifest_before);
    }

    #[tokio::test]
    async fn test_front_eviction_and_media_sequence() {
        let (mut stitcher, _sources) = three_member_group();

        let mut last_media = 0;
        for _ in 0..8 {
            stitcher.tick().await.unwrap();
            // Window of 2, bound of 6
            assert!(stitcher.retained() <= 6);
            assert!(stitcher.media_sequence() >= last_media);
            last_media = stitcher.media_sequence();
        }
        // 8 ticks x 2 appended, 6 retained: 10 evicted
        assert_eq!(stitcher.media_sequence(), 10);
        assert!(stitcher
            .manifest()
            .contains("#EXT-X-MEDIA-SEQUENCE:10"));
    }

    #[tokio::test]
    async fn test_remove_member_from_ring() {
        let (mut stitcher, _sources) = three_member_group();
        stitcher.tick().await.unwrap();

        assert!(stitcher.remove_member("cam1"));
        assert!(!stitcher.remove_member("cam1"));
        assert_eq!(stitcher.member_count(), 2);

        // Rotation continues over the remaining members: cam0, cam2
        let outcome = stitcher.tick().await.unwrap();
        assert!(matches!(outcome, TickOutcome::Stitched { member: 1, .. }));
    }

    #[tokio::test]
    async fn test_malformed_manifest_aborts_tick_state_retained() {
        let (mut stitcher, sources) = three_member_group();
        stitcher.tick().await.unwrap();
        let manifest_before = stitcher.manifest().to_string();
        let disc_before = stitcher.discontinuity_sequence();

        sources[1].set_manifest(Some("#EXTINF:garbage,\nX.ts\n"));
        assert!(stitcher.tick().await.is_err());

        assert_eq!(stitcher.manifest(), manifest_before);
        assert_eq!(stitcher.discontinuity_sequence(), disc_before);
    }
}
