use serde::Serialize;
use shared::domain::{Segment, SessionId};
use tracing::{debug, warn};

use crate::session::SessionTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentIssue {
    /// `start_time > end_time`.
    InvertedRange,
    /// Starts before the previous segment ended.
    OverlapsPrevious,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptSegment {
    pub segment: Segment,
    pub session: SessionId,
    pub issue: Option<SegmentIssue>,
}

impl TranscriptSegment {
    pub fn is_valid(&self) -> bool {
        self.issue.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Appended(usize),
    Rewritten(usize),
    /// An update with no open tail, applied as a create.
    Promoted(usize),
    /// Tagged with a generation that is no longer current; nothing changed.
    Stale,
}

impl ApplyOutcome {
    pub fn index(self) -> Option<usize> {
        match self {
            Self::Appended(index) | Self::Rewritten(index) | Self::Promoted(index) => Some(index),
            Self::Stale => None,
        }
    }
}

/// Ordered transcript built from create/update events in arrival order.
///
/// Only the tail may change, and only while it is open: a create or the end
/// of the owning session freezes it. Updates never look segments up by time.
pub struct SegmentReconciler {
    sessions: SessionTracker,
    segments: Vec<TranscriptSegment>,
    tail_open: bool,
}

impl SegmentReconciler {
    pub fn new(sessions: SessionTracker) -> Self {
        Self {
            sessions,
            segments: Vec::new(),
            tail_open: false,
        }
    }

    pub fn apply_create(&mut self, session: SessionId, segment: Segment) -> ApplyOutcome {
        if !self.sessions.is_current(session) {
            debug!(session = session.0, "dropping segment creation from stale session");
            return ApplyOutcome::Stale;
        }
        ApplyOutcome::Appended(self.append(session, segment))
    }

    pub fn apply_update(&mut self, session: SessionId, segment: Segment) -> ApplyOutcome {
        if !self.sessions.is_current(session) {
            debug!(session = session.0, "dropping segment update from stale session");
            return ApplyOutcome::Stale;
        }

        let writable_tail = self.tail_open
            && self
                .segments
                .last()
                .is_some_and(|tail| tail.session == session);
        if !writable_tail {
            debug!(
                session = session.0,
                segments = self.segments.len(),
                "segment update without an open tail; applying as creation"
            );
            return ApplyOutcome::Promoted(self.append(session, segment));
        }

        let index = self.segments.len() - 1;
        let issue = self.check(index, &segment);
        self.segments[index] = TranscriptSegment {
            segment,
            session,
            issue,
        };
        ApplyOutcome::Rewritten(index)
    }

    /// Closes the tail so later updates cannot rewrite it.
    pub fn freeze(&mut self) {
        self.tail_open = false;
    }

    pub fn reset(&mut self) {
        self.segments.clear();
        self.tail_open = false;
    }

    pub fn segments(&self) -> &[TranscriptSegment] {
        &self.segments
    }

    pub fn tail(&self) -> Option<&TranscriptSegment> {
        self.segments.last()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&TranscriptSegment> {
        self.segments.get(index)
    }

    fn append(&mut self, session: SessionId, segment: Segment) -> usize {
        let index = self.segments.len();
        let issue = self.check(index, &segment);
        self.segments.push(TranscriptSegment {
            segment,
            session,
            issue,
        });
        self.tail_open = true;
        index
    }

    fn check(&self, index: usize, segment: &Segment) -> Option<SegmentIssue> {
        let issue = if segment.has_inverted_range() {
            Some(SegmentIssue::InvertedRange)
        } else if index > 0
            && self
                .segments
                .get(index - 1)
                .is_some_and(|prev| segment.start_time < prev.segment.end_time)
        {
            Some(SegmentIssue::OverlapsPrevious)
        } else {
            None
        };

        if let Some(issue) = issue {
            warn!(
                index,
                start = segment.start_time,
                end = segment.end_time,
                ?issue,
                "accepting segment with malformed timing"
            );
        }
        issue
    }
}
