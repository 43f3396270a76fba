use crate::error::PlaylistError;
use std::collections::VecDeque;
use tracing::{debug, trace};

/// How many windows worth of segments a playlist retains before the front
/// is evicted
const RETAIN_WINDOWS: usize = 3;

/// One manifest line pair: segment duration in seconds plus its URI.
/// Immutable once parsed from a manifest snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentEntry {
    /// Segment duration in seconds
    pub duration: f64,
    /// Segment file URI as it appeared in the manifest
    pub uri: String,
    /// True when a discontinuity marker precedes this segment
    pub discontinuity: bool,
}

impl SegmentEntry {
    pub fn new(duration: f64, uri: impl Into<String>) -> Self {
        Self {
            duration,
            uri: uri.into(),
            discontinuity: false,
        }
    }
}

/// Tokenizing line parser for vendor-produced segment manifests.
///
/// Recognizes `#EXTINF:<duration>,` tags followed by a URI line, and
/// `#EXT-X-DISCONTINUITY` markers which flag the next segment. Header and
/// unknown comment lines are skipped. A manifest with no segment tags at
/// all parses to an empty list; a tag with an unparseable duration or a
/// missing URI line is an error and the caller keeps its previous state.
pub fn parse_manifest(text: &str) -> Result<Vec<SegmentEntry>, PlaylistError> {
    let mut entries = Vec::new();
    let mut pending_discontinuity = false;
    let mut lines = text.lines().peekable();

    while let Some(line) = lines.next() {
        let line = line.trim();
        if line == "#EXT-X-DISCONTINUITY" {
            pending_discontinuity = true;
            continue;
        }
        let Some(tag_value) = line.strip_prefix("#EXTINF:") else {
            continue;
        };
        let duration_text = tag_value.split(',').next().unwrap_or("").trim();
        let duration: f64 = duration_text
            .parse()
            .map_err(|_| PlaylistError::BadDuration {
                value: duration_text.to_string(),
            })?;

        // The URI is the next line that is neither blank nor a comment
        let mut uri = None;
        while let Some(candidate) = lines.peek() {
            let candidate = candidate.trim();
            if candidate.is_empty() {
                lines.next();
                continue;
            }
            if candidate == "#EXT-X-DISCONTINUITY" {
                // A marker between a tag and its URI means the tag had none
                break;
            }
            if candidate.starts_with('#') {
                lines.next();
                continue;
            }
            uri = Some(candidate.to_string());
            lines.next();
            break;
        }
        let uri = uri.ok_or(PlaylistError::MissingUri)?;

        entries.push(SegmentEntry {
            duration,
            uri,
            discontinuity: std::mem::take(&mut pending_discontinuity),
        });
    }

    trace!("Parsed {} segment entries", entries.len());
    Ok(entries)
}

/// Walk backward from the most recent entry, accumulating durations until
/// the running total reaches the target. The count visited is the window
/// size. A manifest too short to cover the target yields all entries with
/// a diagnostic, not an error.
pub fn window_size(entries: &[SegmentEntry], target_secs: f64) -> usize {
    let mut total = 0.0;
    let mut count = 0;
    for entry in entries.iter().rev() {
        total += entry.duration;
        count += 1;
        if total >= target_secs {
            return count;
        }
    }
    if count > 0 {
        debug!(
            "Manifest covers only {:.1}s of the {:.1}s target, taking all {} entries",
            total, target_secs, count
        );
    }
    count
}

/// Render a manifest from its segment entries and sequence counters. The
/// discontinuity sequence stays at 0 for single-source manifests and only
/// advances for stitched group manifests.
pub fn render_manifest<'a, I>(
    segments: I,
    media_sequence: u64,
    discontinuity_sequence: u64,
) -> String
where
    I: IntoIterator<Item = &'a SegmentEntry>,
{
    let segments: Vec<&SegmentEntry> = segments.into_iter().collect();
    let target = segments
        .iter()
        .map(|entry| entry.duration)
        .fold(0.0f64, f64::max)
        .ceil()
        .max(1.0) as u64;

    let mut out = String::new();
    out.push_str("#EXTM3U\n");
    out.push_str("#EXT-X-VERSION:3\n");
    out.push_str("#EXT-X-ALLOW-CACHE:NO\n");
    out.push_str(&format!("#EXT-X-TARGETDURATION:{}\n", target));
    out.push_str(&format!(
        "#EXT-X-DISCONTINUITY-SEQUENCE:{}\n",
        discontinuity_sequence
    ));
    out.push_str(&format!("#EXT-X-MEDIA-SEQUENCE:{}\n", media_sequence));
    out.push_str("#EXT-X-INDEPENDENT-SEGMENTS\n");
    for entry in segments {
        if entry.discontinuity {
            out.push_str("#EXT-X-DISCONTINUITY\n");
        }
        out.push_str(&format!("#EXTINF:{},\n{}\n", entry.duration, entry.uri));
    }
    out
}

/// Rolling window over one source's segment manifest.
///
/// Each poll tick feeds the freshly read manifest through
/// [`apply_manifest`](Self::apply_manifest): the trailing window covering
/// the target duration is appended to the retained segments, then the front
/// is evicted down to three windows, advancing `media_sequence` by one per
/// evicted entry. `media_sequence` never decreases.
pub struct PlaylistWindow {
    target_secs: f64,
    segments: VecDeque<SegmentEntry>,
    media_sequence: u64,
}

impl PlaylistWindow {
    /// Create a window targeting the given duration per tick. A
    /// non-positive target is a configuration error surfaced once at
    /// setup; the component stays inactive rather than crashing.
    pub fn new(target_secs: f64) -> Result<Self, PlaylistError> {
        if target_secs <= 0.0 {
            return Err(PlaylistError::InvalidTarget(target_secs));
        }
        Ok(Self {
            target_secs,
            segments: VecDeque::new(),
            media_sequence: 0,
        })
    }

    /// Apply one freshly read manifest snapshot. Returns the number of
    /// entries appended. An empty manifest means "no new data this tick"
    /// and leaves all state unchanged; a malformed manifest is an error
    /// and likewise leaves state untouched.
    pub fn apply_manifest(&mut self, text: &str) -> Result<usize, PlaylistError> {
        let entries = parse_manifest(text)?;
        if entries.is_empty() {
            debug!("Manifest has no segment entries, no new data this tick");
            return Ok(0);
        }

        let window = window_size(&entries, self.target_secs);
        for entry in &entries[entries.len() - window..] {
            self.segments.push_back(entry.clone());
        }

        let bound = window * RETAIN_WINDOWS;
        if self.segments.len() > bound {
            let excess = self.segments.len() - bound;
            self.remove_from_start(excess);
        }
        Ok(window)
    }

    /// Evict up to `count` entries from the front, advancing
    /// `media_sequence` by one per evicted entry. Returns the number
    /// actually evicted.
    pub fn remove_from_start(&mut self, count: usize) -> usize {
        let evicted = count.min(self.segments.len());
        for _ in 0..evicted {
            self.segments.pop_front();
        }
        self.media_sequence += evicted as u64;
        if evicted > 0 {
            trace!(
                "Evicted {} entries, media sequence now {}",
                evicted,
                self.media_sequence
            );
        }
        evicted
    }

    /// Render the current window as a single-source manifest
    pub fn render(&self) -> String {
        render_manifest(self.segments.iter(), self.media_sequence, 0)
    }

    pub fn media_sequence(&self) -> u64 {
        self.media_sequence
    }

    /// Number of entries currently retained
    pub fn retained(&self) -> usize {
        self.segments.len()
    }

    pub fn target_secs(&self) -> f64 {
        self.target_secs
    }

    pub fn segments(&self) -> impl Iterator<Item = &SegmentEntry> {
        self.segments.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(count: usize, duration: f64) -> String {
        let mut out = String::from("#EXTM3U\n#EXT-X-VERSION:3\n");
        for i in 0..count {
            out.push_str(&format!("#EXTINF:{},\nseg{}.ts\n", duration, i));
        }
        out
    }

    #[test]
    fn test_parse_basic_manifest() {
        let entries = parse_manifest("#EXTINF:2,\nA\n#EXTINF:2.5,\nB\n").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], SegmentEntry::new(2.0, "A"));
        assert_eq!(entries[1].duration, 2.5);
        assert_eq!(entries[1].uri, "B");
    }

    #[test]
    fn test_parse_skips_headers_and_blanks() {
        let text = "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-MEDIA-SEQUENCE:7\n\n#EXTINF:6,\n\nchunk.ts\n";
        let entries = parse_manifest(text).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].uri, "chunk.ts");
    }

    #[test]
    fn test_parse_discontinuity_marks_next_entry() {
        let text = "#EXTINF:2,\nA\n#EXT-X-DISCONTINUITY\n#EXTINF:2,\nB\n";
        let entries = parse_manifest(text).unwrap();
        assert!(!entries[0].discontinuity);
        assert!(entries[1].discontinuity);
    }

    #[test]
    fn test_parse_no_segments_is_empty_not_error() {
        assert!(parse_manifest("#EXTM3U\n#EXT-X-VERSION:3\n").unwrap().is_empty());
        assert!(parse_manifest("").unwrap().is_empty());
    }

    #[test]
    fn test_parse_bad_duration_is_error() {
        let result = parse_manifest("#EXTINF:abc,\nA\n");
        assert!(matches!(result, Err(PlaylistError::BadDuration { .. })));
    }

    #[test]
    fn test_parse_missing_uri_is_error() {
        let result = parse_manifest("#EXTINF:2,\n");
        assert!(matches!(result, Err(PlaylistError::MissingUri)));
    }

    #[test]
    fn test_window_size_reaches_target() {
        // Three 2s entries, 4s target: walking back from C reaches 4s at B
        let entries = parse_manifest("#EXTINF:2,\nA\n#EXTINF:2,\nB\n#EXTINF:2,\nC\n").unwrap();
        assert_eq!(window_size(&entries, 4.0), 2);

        let tail: Vec<_> = entries[entries.len() - 2..].to_vec();
        assert_eq!(tail[0].uri, "B");
        assert_eq!(tail[1].uri, "C");
        let total: f64 = tail.iter().map(|entry| entry.duration).sum();
        assert!(total >= 4.0);
    }

    #[test]
    fn test_window_size_short_manifest_takes_all() {
        let entries = parse_manifest("#EXTINF:2,\nA\n").unwrap();
        assert_eq!(window_size(&entries, 6.0), 1);
        assert_eq!(window_size(&[], 6.0), 0);
    }

    #[test]
    fn test_apply_manifest_appends_window() {
        let mut window = PlaylistWindow::new(4.0).unwrap();
        let appended = window.apply_manifest(&manifest(3, 2.0)).unwrap();
        assert_eq!(appended, 2);
        assert_eq!(window.retained(), 2);
        assert_eq!(window.media_sequence(), 0);
    }

    #[test]
    fn test_remove_from_start_scenario() {
        // Accumulate a 7 entry state, then evict one from the front
        let mut window = PlaylistWindow::new(14.0).unwrap();
        window.apply_manifest(&manifest(7, 2.0)).unwrap();
        assert_eq!(window.retained(), 7);

        let evicted = window.remove_from_start(1);
        assert_eq!(evicted, 1);
        assert_eq!(window.retained(), 6);
        assert_eq!(window.media_sequence(), 1);

        let rendered = window.render();
        assert_eq!(rendered.matches("#EXTINF:").count(), 6);
        assert!(rendered.contains("#EXT-X-MEDIA-SEQUENCE:1"));
    }

    #[test]
    fn test_front_eviction_converges_to_bound() {
        let mut window = PlaylistWindow::new(4.0).unwrap();
        for _ in 0..10 {
            window.apply_manifest(&manifest(3, 2.0)).unwrap();
            // Never above 3x the window size after an apply, never below
            // the window size itself
            assert!(window.retained() <= 6);
            assert!(window.retained() >= 2);
        }
        // 10 ticks x 2 appended, 6 retained: 14 were evicted
        assert_eq!(window.media_sequence(), 14);
    }

    #[test]
    fn test_media_sequence_counts_evictions_exactly() {
        let mut window = PlaylistWindow::new(4.0).unwrap();
        window.apply_manifest(&manifest(3, 2.0)).unwrap();
        window.apply_manifest(&manifest(3, 2.0)).unwrap();
        window.apply_manifest(&manifest(3, 2.0)).unwrap();
        assert_eq!(window.media_sequence(), 0);
        let before = window.retained();

        window.apply_manifest(&manifest(3, 2.0)).unwrap();
        let evicted = before + 2 - window.retained();
        assert_eq!(window.media_sequence(), evicted as u64);
    }

    #[test]
    fn test_empty_manifest_leaves_state_unchanged() {
        let mut window = PlaylistWindow::new(4.0).unwrap();
        window.apply_manifest(&manifest(3, 2.0)).unwrap();
        let retained = window.retained();
        let sequence = window.media_sequence();

        assert_eq!(window.apply_manifest("#EXTM3U\n").unwrap(), 0);
        assert_eq!(window.retained(), retained);
        assert_eq!(window.media_sequence(), sequence);
    }

    #[test]
    fn test_malformed_manifest_leaves_state_unchanged() {
        let mut window = PlaylistWindow::new(4.0).unwrap();
        window.apply_manifest(&manifest(3, 2.0)).unwrap();
        let retained = window.retained();

        assert!(window.apply_manifest("#EXTINF:oops,\nA\n").is_err());
        assert_eq!(window.retained(), retained);
    }

    #[test]
    fn test_invalid_target_rejected_at_setup() {
        assert!(matches!(
            PlaylistWindow::new(0.0),
            Err(PlaylistError::InvalidTarget(_))
        ));
        assert!(matches!(
            PlaylistWindow::new(-2.0),
            Err(PlaylistError::InvalidTarget(_))
        ));
    }

    #[test]
    fn test_keep_last_roundtrip_reparses_to_window() {
        let entries = parse_manifest(&manifest(5, 2.0)).unwrap();
        let window = window_size(&entries, 4.0);
        let fragment = render_manifest(entries[entries.len() - window..].iter(), 0, 0);

        let reparsed = parse_manifest(&fragment).unwrap();
        assert_eq!(reparsed.len(), window);
        let total: f64 = reparsed.iter().map(|entry| entry.duration).sum();
        assert!(total >= 4.0);
    }

    #[test]
    fn test_render_header_block() {
        let mut window = PlaylistWindow::new(4.0).unwrap();
        window.apply_manifest(&manifest(3, 2.0)).unwrap();
        let rendered = window.render();

        assert!(rendered.starts_with("#EXTM3U\n"));
        assert!(rendered.contains("#EXT-X-VERSION:3\n"));
        assert!(rendered.contains("#EXT-X-ALLOW-CACHE:NO\n"));
        assert!(rendered.contains("#EXT-X-TARGETDURATION:2\n"));
        assert!(rendered.contains("#EXT-X-MEDIA-SEQUENCE:0\n"));
        assert!(rendered.contains("#EXT-X-INDEPENDENT-SEGMENTS\n"));
        // A source that never stitches stays at discontinuity sequence 0
        assert!(rendered.contains("#EXT-X-DISCONTINUITY-SEQUENCE:0\n"));
    }
}
