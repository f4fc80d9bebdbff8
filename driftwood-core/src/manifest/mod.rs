//! Manifest bookkeeping for one relay session.
//!
//! The manifest document itself is produced by the external DASH parser and
//! treated as opaque beyond a small set of accessors. This module owns the
//! per-representation segment cursors, segment-name derivation from the
//! manifest's segment template, and the timing lookups the retrieval engine
//! paces itself with.

pub mod template;
pub mod tracker;

use std::fmt;

pub use tracker::SegmentTracker;

/// Identifier of one encoded variant (bitrate/resolution) of a track.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepresentationId(String);

impl RepresentationId {
    /// Creates a representation id from the manifest's `id` attribute.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the underlying id string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RepresentationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
