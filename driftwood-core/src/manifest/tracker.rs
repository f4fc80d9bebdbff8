//! Shared segment bookkeeping over the most recently parsed manifest.
//!
//! One tracker exists per session and is shared by every retrieval task of
//! that session. The manifest document is swapped atomically on refresh;
//! per-representation cursors survive the swap so sequence numbers never
//! move backwards under a concurrent reload.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dash_mpd::{AdaptationSet, MPD, Representation, SegmentTemplate};
use parking_lot::RwLock;

use super::RepresentationId;
use super::template::{self, TemplateVars};
use crate::session::{SessionError, StreamType, TrackKind};

/// Monotonic per-representation position.
///
/// `sequence` is the last segment number handed out; `first_segment` is the
/// manifest's start number, latched once; `last_segment` trails the highest
/// successfully retrieved number.
#[derive(Debug, Default)]
pub struct SegmentCursor {
    sequence: AtomicU64,
    first_segment: AtomicU64,
    last_segment: AtomicU64,
}

impl SegmentCursor {
    /// Latches the manifest start number. Only the first caller wins; a
    /// refreshed manifest never rewinds an in-flight cursor.
    fn seed(&self, start_number: u64) {
        if self
            .first_segment
            .compare_exchange(0, start_number, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            // Seed one below the start so the first advance yields it.
            self.sequence
                .store(start_number.saturating_sub(1), Ordering::Release);
        }
    }

    fn advance(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::AcqRel) + 1
    }
}

/// Tracks the parsed manifest and segment cursors for one session.
pub struct SegmentTracker {
    mpd: RwLock<Option<MPD>>,
    cursors: RwLock<HashMap<RepresentationId, Arc<SegmentCursor>>>,
}

impl Default for SegmentTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl SegmentTracker {
    pub fn new() -> Self {
        Self {
            mpd: RwLock::new(None),
            cursors: RwLock::new(HashMap::new()),
        }
    }

    /// Parses manifest text and swaps it in as the current document.
    ///
    /// Cursors for representations already seen are kept untouched.
    ///
    /// # Errors
    /// - `SessionError::ManifestParse` - document is not a usable MPD
    pub fn load(&self, xml: &str) -> Result<(), SessionError> {
        let mpd = dash_mpd::parse(xml).map_err(|e| SessionError::ManifestParse {
            reason: e.to_string(),
        })?;

        {
            let mut cursors = self.cursors.write();
            for (_, representation) in all_representations(&mpd) {
                if let Some(id) = &representation.id {
                    cursors
                        .entry(RepresentationId::new(id.clone()))
                        .or_default();
                }
            }
        }

        *self.mpd.write() = Some(mpd);
        Ok(())
    }

    /// Reads and parses a manifest file from disk.
    pub fn load_file(&self, path: &Path) -> Result<(), SessionError> {
        let xml = std::fs::read_to_string(path)?;
        self.load(&xml)
    }

    /// Whether a manifest has been loaded yet.
    pub fn is_loaded(&self) -> bool {
        self.mpd.read().is_some()
    }

    /// Structural sanity check on the current document.
    ///
    /// Accepts a manifest when it has at least one period, every adaptation
    /// carries an identified representation, and every representation can
    /// produce media segment names.
    pub fn validate(&self) -> bool {
        let guard = self.mpd.read();
        let Some(mpd) = guard.as_ref() else {
            return false;
        };
        if mpd.periods.is_empty() {
            return false;
        }
        let mut seen_any = false;
        for period in &mpd.periods {
            for adaptation in &period.adaptations {
                if adaptation.representations.is_empty() {
                    return false;
                }
                for representation in &adaptation.representations {
                    if representation.id.is_none() {
                        return false;
                    }
                    let template = representation
                        .SegmentTemplate
                        .as_ref()
                        .or(adaptation.SegmentTemplate.as_ref());
                    if !template.is_some_and(|t| t.media.is_some()) {
                        return false;
                    }
                    seen_any = true;
                }
            }
        }
        seen_any
    }

    /// LIVE when the document declares itself dynamic, STATIC otherwise.
    pub fn stream_type(&self) -> Option<StreamType> {
        self.mpd.read().as_ref().map(|mpd| {
            if mpd.mpdtype.as_deref() == Some("dynamic") {
                StreamType::Live
            } else {
                StreamType::Static
            }
        })
    }

    /// All representations of the given track kind, in manifest order.
    ///
    /// Empty when the manifest has no track of that kind (or none is loaded).
    pub fn representations_for(&self, kind: TrackKind) -> Vec<RepresentationId> {
        let guard = self.mpd.read();
        let Some(mpd) = guard.as_ref() else {
            return Vec::new();
        };
        all_representations(mpd)
            .into_iter()
            .filter(|(adaptation, representation)| {
                track_kind_of(adaptation, representation) == Some(kind)
            })
            .filter_map(|(_, representation)| representation.id.clone())
            .map(RepresentationId::new)
            .collect()
    }

    /// Seeds every cursor with the manifest's start number.
    ///
    /// Idempotent across refreshes: a cursor already seeded keeps its
    /// position.
    pub fn seed_start_numbers(&self) {
        let guard = self.mpd.read();
        let Some(mpd) = guard.as_ref() else { return };
        let cursors = self.cursors.read();
        for (adaptation, representation) in all_representations(mpd) {
            let Some(id) = &representation.id else { continue };
            let start_number = representation
                .SegmentTemplate
                .as_ref()
                .or(adaptation.SegmentTemplate.as_ref())
                .and_then(|t| t.startNumber)
                .unwrap_or(1);
            if let Some(cursor) = cursors.get(&RepresentationId::new(id.clone())) {
                cursor.seed(start_number);
            }
        }
    }

    /// Advances the cursor and returns the new segment number.
    pub fn next_sequence(&self, representation: &RepresentationId) -> u64 {
        self.cursor(representation).advance()
    }

    /// The last segment number handed out, without advancing.
    pub fn current_sequence(&self, representation: &RepresentationId) -> u64 {
        self.cursor(representation).sequence.load(Ordering::Acquire)
    }

    /// The latched manifest start number, 0 before seeding.
    pub fn first_segment_number(&self, representation: &RepresentationId) -> u64 {
        self.cursor(representation)
            .first_segment
            .load(Ordering::Acquire)
    }

    /// Records a successfully retrieved segment number.
    pub fn record_retrieved(&self, representation: &RepresentationId, number: u64) {
        self.cursor(representation)
            .last_segment
            .fetch_max(number, Ordering::AcqRel);
    }

    /// Highest successfully retrieved segment number, 0 before any success.
    pub fn last_segment_number(&self, representation: &RepresentationId) -> u64 {
        self.cursor(representation)
            .last_segment
            .load(Ordering::Acquire)
    }

    /// Resolves the media-segment name for the given segment number.
    ///
    /// # Errors
    /// - `SessionError::SegmentNameUndefined` - no media template in scope
    pub fn segment_name(
        &self,
        representation: &RepresentationId,
        number: u64,
    ) -> Result<String, SessionError> {
        self.with_template(representation, |template, rep| {
            template.media.as_ref().map(|pattern| {
                let vars = TemplateVars::for_segment(
                    rep.id.as_deref().unwrap_or_default(),
                    number,
                    rep.bandwidth,
                );
                template::resolve(pattern, &vars)
            })
        })
        .flatten()
        .ok_or_else(|| SessionError::SegmentNameUndefined {
            representation: representation.to_string(),
        })
    }

    /// Resolves the initialization-segment name.
    ///
    /// # Errors
    /// - `SessionError::SegmentNameUndefined` - no initialization template
    pub fn init_segment_name(
        &self,
        representation: &RepresentationId,
    ) -> Result<String, SessionError> {
        self.with_template(representation, |template, rep| {
            template.initialization.as_ref().map(|pattern| {
                let vars =
                    TemplateVars::for_init(rep.id.as_deref().unwrap_or_default(), rep.bandwidth);
                template::resolve(pattern, &vars)
            })
        })
        .flatten()
        .ok_or_else(|| SessionError::SegmentNameUndefined {
            representation: representation.to_string(),
        })
    }

    /// Nominal segment duration in microseconds, 0 when undeclared.
    pub fn segment_duration_micros(&self, representation: &RepresentationId) -> u64 {
        self.with_template(representation, |template, _| {
            let duration = template.duration.unwrap_or(0.0);
            let timescale = template.timescale.unwrap_or(1).max(1);
            (duration / timescale as f64 * 1_000_000.0) as u64
        })
        .unwrap_or(0)
    }

    /// Declared availability time offset in microseconds, 0 when absent.
    pub fn availability_offset_micros(&self, representation: &RepresentationId) -> u64 {
        self.with_template(representation, |template, _| {
            (template.availabilityTimeOffset.unwrap_or(0.0) * 1_000_000.0) as u64
        })
        .unwrap_or(0)
    }

    /// `mediaPresentationDuration` from the current document.
    pub fn media_presentation_duration(&self) -> Option<Duration> {
        self.mpd
            .read()
            .as_ref()
            .and_then(|mpd| mpd.mediaPresentationDuration)
    }

    /// `minBufferTime` from the current document.
    pub fn min_buffer_time(&self) -> Option<Duration> {
        self.mpd.read().as_ref().and_then(|mpd| mpd.minBufferTime)
    }

    /// How long to wait before re-fetching the manifest.
    ///
    /// A declared positive presentation duration drives the refresh; an
    /// absent or zero duration (PT0S is common on live sources) falls back
    /// to the configured default window.
    pub fn refresh_window(&self, default: Duration) -> Duration {
        match self.media_presentation_duration() {
            Some(duration) if !duration.is_zero() => duration,
            _ => default,
        }
    }

    fn cursor(&self, representation: &RepresentationId) -> Arc<SegmentCursor> {
        if let Some(cursor) = self.cursors.read().get(representation) {
            return Arc::clone(cursor);
        }
        Arc::clone(self.cursors.write().entry(representation.clone()).or_default())
    }

    fn with_template<R>(
        &self,
        representation: &RepresentationId,
        f: impl FnOnce(&SegmentTemplate, &Representation) -> R,
    ) -> Option<R> {
        let guard = self.mpd.read();
        let mpd = guard.as_ref()?;
        for (adaptation, rep) in all_representations(mpd) {
            if rep.id.as_deref() == Some(representation.as_str()) {
                let template = rep
                    .SegmentTemplate
                    .as_ref()
                    .or(adaptation.SegmentTemplate.as_ref())?;
                return Some(f(template, rep));
            }
        }
        None
    }
}

fn all_representations(mpd: &MPD) -> Vec<(&AdaptationSet, &Representation)> {
    mpd.periods
        .iter()
        .flat_map(|period| &period.adaptations)
        .flat_map(|adaptation| {
            adaptation
                .representations
                .iter()
                .map(move |representation| (adaptation, representation))
        })
        .collect()
}

fn track_kind_of(adaptation: &AdaptationSet, representation: &Representation) -> Option<TrackKind> {
    let mime = representation
        .mimeType
        .as_deref()
        .or(representation.contentType.as_deref())
        .or(adaptation.contentType.as_deref())
        .or(adaptation.mimeType.as_deref())
        .unwrap_or_default();
    if mime.starts_with("audio") {
        Some(TrackKind::Audio)
    } else if mime.starts_with("video") {
        Some(TrackKind::Video)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIVE_MANIFEST: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" type="dynamic"
     minBufferTime="PT2S" mediaPresentationDuration="PT30S">
  <Period>
    <AdaptationSet contentType="video" mimeType="video/mp4">
      <SegmentTemplate timescale="1000" duration="2000" startNumber="5"
          initialization="$RepresentationID$-init.m4s"
          media="$RepresentationID$-$Number%05d$.m4s"/>
      <Representation id="video-1" bandwidth="800000"/>
    </AdaptationSet>
    <AdaptationSet contentType="audio" mimeType="audio/mp4">
      <SegmentTemplate timescale="48000" duration="96000" startNumber="5"
          initialization="$RepresentationID$-init.m4s"
          media="$RepresentationID$-$Number$.m4s"/>
      <Representation id="audio-en" bandwidth="128000"/>
    </AdaptationSet>
  </Period>
</MPD>"#;

    const STATIC_NO_DURATION: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" type="static" minBufferTime="PT2S">
  <Period>
    <AdaptationSet contentType="video" mimeType="video/mp4">
      <SegmentTemplate timescale="1000" duration="4000"
          initialization="init.m4s" media="seg-$Number$.m4s"/>
      <Representation id="v" bandwidth="1000"/>
    </AdaptationSet>
  </Period>
</MPD>"#;

    fn loaded(xml: &str) -> SegmentTracker {
        let tracker = SegmentTracker::new();
        tracker.load(xml).unwrap();
        tracker
    }

    #[test]
    fn test_load_and_classify_live() {
        let tracker = loaded(LIVE_MANIFEST);
        assert!(tracker.is_loaded());
        assert!(tracker.validate());
        assert_eq!(tracker.stream_type(), Some(StreamType::Live));
        assert_eq!(tracker.min_buffer_time(), Some(Duration::from_secs(2)));
        assert_eq!(
            tracker.media_presentation_duration(),
            Some(Duration::from_secs(30))
        );
    }

    #[test]
    fn test_garbage_manifest_fails_parse() {
        let tracker = SegmentTracker::new();
        let result = tracker.load("not an mpd");
        assert!(matches!(result, Err(SessionError::ManifestParse { .. })));
        assert!(!tracker.is_loaded());
    }

    #[test]
    fn test_representation_lookup_by_track_kind() {
        let tracker = loaded(LIVE_MANIFEST);
        assert_eq!(
            tracker.representations_for(TrackKind::Video),
            vec![RepresentationId::new("video-1")]
        );
        assert_eq!(
            tracker.representations_for(TrackKind::Audio),
            vec![RepresentationId::new("audio-en")]
        );
    }

    #[test]
    fn test_representations_enumerated_in_manifest_order() {
        // A second bitrate in the same adaptation set.
        let xml = LIVE_MANIFEST.replace(
            r#"<Representation id="video-1" bandwidth="800000"/>"#,
            r#"<Representation id="video-1" bandwidth="800000"/>
      <Representation id="video-2" bandwidth="1600000"/>"#,
        );
        let tracker = loaded(&xml);

        assert_eq!(
            tracker.representations_for(TrackKind::Video),
            vec![
                RepresentationId::new("video-1"),
                RepresentationId::new("video-2"),
            ]
        );
        assert_eq!(
            tracker.representations_for(TrackKind::Audio),
            vec![RepresentationId::new("audio-en")]
        );
    }

    #[test]
    fn test_representations_empty_for_absent_track_kind() {
        let tracker = loaded(STATIC_NO_DURATION);
        assert!(tracker.representations_for(TrackKind::Audio).is_empty());
    }

    #[test]
    fn test_start_number_seeds_first_advance() {
        let tracker = loaded(LIVE_MANIFEST);
        tracker.seed_start_numbers();
        let rep = RepresentationId::new("video-1");

        assert_eq!(tracker.first_segment_number(&rep), 5);
        assert_eq!(tracker.next_sequence(&rep), 5);
        assert_eq!(tracker.next_sequence(&rep), 6);
        assert_eq!(tracker.current_sequence(&rep), 6);
    }

    #[test]
    fn test_reseed_never_rewinds_cursor() {
        let tracker = loaded(LIVE_MANIFEST);
        tracker.seed_start_numbers();
        let rep = RepresentationId::new("video-1");
        tracker.next_sequence(&rep);
        tracker.next_sequence(&rep);

        // Manifest refresh re-parses and re-seeds.
        tracker.load(LIVE_MANIFEST).unwrap();
        tracker.seed_start_numbers();

        assert_eq!(tracker.next_sequence(&rep), 7);
    }

    #[test]
    fn test_segment_name_resolution() {
        let tracker = loaded(LIVE_MANIFEST);
        tracker.seed_start_numbers();
        let rep = RepresentationId::new("video-1");

        let number = tracker.next_sequence(&rep);
        assert_eq!(
            tracker.segment_name(&rep, number).unwrap(),
            "video-1-00005.m4s"
        );
        assert_eq!(
            tracker.init_segment_name(&rep).unwrap(),
            "video-1-init.m4s"
        );
    }

    #[test]
    fn test_segment_name_undefined_without_media_template() {
        let xml = r#"<?xml version="1.0" encoding="utf-8"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" type="static">
  <Period>
    <AdaptationSet contentType="video">
      <Representation id="v" bandwidth="1"/>
    </AdaptationSet>
  </Period>
</MPD>"#;
        let tracker = loaded(xml);
        assert!(!tracker.validate());

        let result = tracker.segment_name(&RepresentationId::new("v"), 1);
        assert!(matches!(
            result,
            Err(SessionError::SegmentNameUndefined { .. })
        ));
    }

    #[test]
    fn test_segment_duration_micros() {
        let tracker = loaded(LIVE_MANIFEST);
        // 2000 / 1000 and 96000 / 48000 are both two seconds.
        assert_eq!(
            tracker.segment_duration_micros(&RepresentationId::new("video-1")),
            2_000_000
        );
        assert_eq!(
            tracker.segment_duration_micros(&RepresentationId::new("audio-en")),
            2_000_000
        );
    }

    #[test]
    fn test_refresh_window_falls_back_without_duration() {
        let fallback = Duration::from_secs(30);

        let tracker = loaded(LIVE_MANIFEST);
        assert_eq!(tracker.refresh_window(fallback), Duration::from_secs(30));

        let tracker = loaded(STATIC_NO_DURATION);
        assert_eq!(tracker.stream_type(), Some(StreamType::Static));
        assert_eq!(tracker.refresh_window(fallback), fallback);

        // PT0S is common on live sources and must never yield a zero-delay
        // refresh loop.
        let zero = STATIC_NO_DURATION.replace(
            r#"minBufferTime="PT2S""#,
            r#"minBufferTime="PT2S" mediaPresentationDuration="PT0S""#,
        );
        let tracker = loaded(&zero);
        assert_eq!(tracker.media_presentation_duration(), Some(Duration::ZERO));
        assert_eq!(tracker.refresh_window(fallback), fallback);
    }

    #[test]
    fn test_default_start_number_is_one() {
        let tracker = loaded(STATIC_NO_DURATION);
        tracker.seed_start_numbers();
        let rep = RepresentationId::new("v");

        assert_eq!(tracker.next_sequence(&rep), 1);
        assert_eq!(tracker.segment_name(&rep, 1).unwrap(), "seg-1.m4s");
    }

    #[test]
    fn test_record_retrieved_tracks_high_water() {
        let tracker = loaded(LIVE_MANIFEST);
        let rep = RepresentationId::new("video-1");

        tracker.record_retrieved(&rep, 5);
        tracker.record_retrieved(&rep, 7);
        tracker.record_retrieved(&rep, 6);
        assert_eq!(tracker.last_segment_number(&rep), 7);
    }
}
