//! Deduplication tracker: which images are done and which are in flight.
//!
//! Keyed by [`ImageIdentity`], so an element that is re-inserted into the
//! page is still recognised. Every operation takes the internal lock for one
//! synchronous step and never across an await, which makes each call atomic
//! with respect to every other caller.
//!
//! An optional element index maps live [`ElementKey`]s to their identity so
//! repeated checks on the same element skip re-hashing. A cached identity is
//! only trusted while the element still reports the locator and size it was
//! hashed from; a swapped `src` is re-hashed. The index is bounded: when
//! full, the least recently used entry is evicted, and hosts release entries
//! explicitly when elements leave the page.

use crate::candidate::CandidateImage;
use crate::identity::{ElementKey, ImageIdentity};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

/// A successfully described image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedRecord {
    pub description: String,
    pub completed_at: DateTime<Utc>,
}

/// Snapshot of tracker sizes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TrackerStats {
    pub processed_count: usize,
    pub in_flight_count: usize,
}

/// Cached identity for one element, with the inputs it was derived from.
#[derive(Debug)]
struct IndexedElement {
    identity: ImageIdentity,
    locator: String,
    size: (u32, u32),
    stamp: u64,
}

impl IndexedElement {
    fn describes(&self, image: &dyn CandidateImage) -> bool {
        self.size == image.natural_size() && self.locator == image.locator()
    }
}

/// LRU map from element key to identity. Recency is kept as an ordered
/// stamp map so touch and eviction are logarithmic.
#[derive(Debug)]
struct ElementIndex {
    capacity: usize,
    next_stamp: u64,
    entries: HashMap<ElementKey, IndexedElement>,
    recency: BTreeMap<u64, ElementKey>,
}

impl ElementIndex {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            next_stamp: 0,
            entries: HashMap::new(),
            recency: BTreeMap::new(),
        }
    }

    /// The cached identity, only if the element still shows the same image.
    fn get(&mut self, key: ElementKey, image: &dyn CandidateImage) -> Option<ImageIdentity> {
        let entry = self.entries.get(&key)?;
        if !entry.describes(image) {
            return None;
        }
        let identity = entry.identity;
        self.touch(key);
        Some(identity)
    }

    fn insert(&mut self, key: ElementKey, image: &dyn CandidateImage, identity: ImageIdentity) {
        if self.capacity == 0 {
            return;
        }
        let stamp = self.bump();
        let entry = IndexedElement {
            identity,
            locator: image.locator().to_string(),
            size: image.natural_size(),
            stamp,
        };
        if let Some(old) = self.entries.insert(key, entry) {
            self.recency.remove(&old.stamp);
        }
        self.recency.insert(stamp, key);
        while self.entries.len() > self.capacity {
            match self.recency.pop_first() {
                Some((_, oldest)) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }
    }

    fn remove(&mut self, key: ElementKey) -> bool {
        match self.entries.remove(&key) {
            Some(old) => {
                self.recency.remove(&old.stamp);
                true
            }
            None => false,
        }
    }

    fn touch(&mut self, key: ElementKey) {
        let stamp = self.bump();
        if let Some(entry) = self.entries.get_mut(&key) {
            self.recency.remove(&entry.stamp);
            entry.stamp = stamp;
            self.recency.insert(stamp, key);
        }
    }

    fn bump(&mut self) -> u64 {
        self.next_stamp += 1;
        self.next_stamp
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.recency.clear();
    }
}

#[derive(Debug)]
struct TrackingState {
    processed: HashMap<ImageIdentity, ProcessedRecord>,
    in_flight: HashSet<ImageIdentity>,
    elements: ElementIndex,
}

/// Processed / in-flight bookkeeping for one page.
#[derive(Debug)]
pub struct DedupTracker {
    state: Mutex<TrackingState>,
}

impl Default for DedupTracker {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl DedupTracker {
    /// Create a tracker whose element index holds at most `element_capacity` keys.
    pub fn new(element_capacity: usize) -> Self {
        Self {
            state: Mutex::new(TrackingState {
                processed: HashMap::new(),
                in_flight: HashSet::new(),
                elements: ElementIndex::new(element_capacity),
            }),
        }
    }

    pub fn is_processed(&self, image: &dyn CandidateImage) -> bool {
        let mut state = self.lock();
        let id = resolve(&mut state, image);
        state.processed.contains_key(&id)
    }

    pub fn is_in_flight(&self, image: &dyn CandidateImage) -> bool {
        let mut state = self.lock();
        let id = resolve(&mut state, image);
        state.in_flight.contains(&id)
    }

    pub fn mark_in_flight(&self, image: &dyn CandidateImage) {
        let mut state = self.lock();
        let id = resolve(&mut state, image);
        state.in_flight.insert(id);
    }

    /// Mark in flight unless already processed or in flight.
    ///
    /// Returns whether the caller now owns the image.
    pub fn try_mark_in_flight(&self, image: &dyn CandidateImage) -> bool {
        let mut state = self.lock();
        let id = resolve(&mut state, image);
        if state.processed.contains_key(&id) {
            return false;
        }
        state.in_flight.insert(id)
    }

    pub fn clear_in_flight(&self, image: &dyn CandidateImage) {
        let mut state = self.lock();
        let id = resolve(&mut state, image);
        state.in_flight.remove(&id);
    }

    /// Record a description and release the in-flight claim.
    pub fn mark_processed(&self, image: &dyn CandidateImage, description: &str) {
        let mut state = self.lock();
        let id = resolve(&mut state, image);
        record_processed(&mut state, id, description);
    }

    /// Release a claim by identity, for owners that outlive the element borrow.
    pub(crate) fn clear_in_flight_identity(&self, id: ImageIdentity) {
        self.lock().in_flight.remove(&id);
    }

    pub(crate) fn mark_processed_identity(&self, id: ImageIdentity, description: &str) {
        record_processed(&mut self.lock(), id, description);
    }

    /// True when no record exists or the alt text no longer matches it.
    pub fn should_reprocess(&self, image: &dyn CandidateImage) -> bool {
        let mut state = self.lock();
        let id = resolve(&mut state, image);
        match state.processed.get(&id) {
            Some(record) => image.alt_text().as_deref() != Some(record.description.as_str()),
            None => true,
        }
    }

    pub fn processed_record(&self, image: &dyn CandidateImage) -> Option<ProcessedRecord> {
        let mut state = self.lock();
        let id = resolve(&mut state, image);
        state.processed.get(&id).cloned()
    }

    /// The stored description, if the image was processed.
    pub fn processed_description(&self, image: &dyn CandidateImage) -> Option<String> {
        self.processed_record(image).map(|record| record.description)
    }

    pub fn get_stats(&self) -> TrackerStats {
        let state = self.lock();
        TrackerStats {
            processed_count: state.processed.len(),
            in_flight_count: state.in_flight.len(),
        }
    }

    /// Drop the element index entry for an element that left the page.
    pub fn release_element(&self, key: ElementKey) -> bool {
        self.lock().elements.remove(key)
    }

    /// Drop every element index entry whose element is no longer live.
    pub fn sweep(&self, is_live: impl Fn(ElementKey) -> bool) -> usize {
        let mut state = self.lock();
        let dead: Vec<ElementKey> = state
            .elements
            .entries
            .keys()
            .copied()
            .filter(|k| !is_live(*k))
            .collect();
        for key in &dead {
            state.elements.remove(*key);
        }
        dead.len()
    }

    /// Number of keys currently held by the element index.
    pub fn indexed_elements(&self) -> usize {
        self.lock().elements.entries.len()
    }

    /// Reset everything. Test and debug use only.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.processed.clear();
        state.in_flight.clear();
        state.elements.clear();
    }

    fn lock(&self) -> MutexGuard<'_, TrackingState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn record_processed(state: &mut TrackingState, id: ImageIdentity, description: &str) {
    state.in_flight.remove(&id);
    state
        .processed
        .entry(id)
        .or_insert_with(|| ProcessedRecord {
            description: description.to_string(),
            completed_at: Utc::now(),
        });
    debug!("Marked {} processed", id.short());
}

/// Identity for `image`, through the element index when the image has a key.
fn resolve(state: &mut TrackingState, image: &dyn CandidateImage) -> ImageIdentity {
    let Some(key) = image.element_key() else {
        return image.identity();
    };
    if let Some(id) = state.elements.get(key, image) {
        return id;
    }
    let id = image.identity();
    state.elements.insert(key, image, id);
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::PageImage;
    use crate::identity::ElementArena;

    fn img(src: &str) -> PageImage {
        PageImage::new(src, 100, 80)
    }

    #[test]
    fn in_flight_then_processed() {
        let t = DedupTracker::default();
        let a = img("https://example.com/a.png");

        t.mark_in_flight(&a);
        assert!(t.is_in_flight(&a));
        assert!(!t.is_processed(&a));

        t.mark_processed(&a, "a cat");
        assert!(!t.is_in_flight(&a));
        assert!(t.is_processed(&a));
        assert_eq!(
            t.get_stats(),
            TrackerStats {
                processed_count: 1,
                in_flight_count: 0
            }
        );
    }

    #[test]
    fn try_mark_excludes_second_claim() {
        let t = DedupTracker::default();
        let a = img("https://example.com/a.png");
        let twin = img("https://example.com/a.png");

        assert!(t.try_mark_in_flight(&a));
        assert!(!t.try_mark_in_flight(&twin));
        t.clear_in_flight(&a);
        assert!(t.try_mark_in_flight(&twin));
    }

    #[test]
    fn try_mark_refuses_processed_images() {
        let t = DedupTracker::default();
        let a = img("https://example.com/a.png");
        t.mark_processed(&a, "desc");
        assert!(!t.try_mark_in_flight(&a));
        assert!(!t.is_in_flight(&a));
    }

    #[test]
    fn mark_and_clear_are_idempotent() {
        let t = DedupTracker::default();
        let a = img("https://example.com/a.png");
        t.mark_in_flight(&a);
        t.mark_in_flight(&a);
        assert_eq!(t.get_stats().in_flight_count, 1);
        t.clear_in_flight(&a);
        t.clear_in_flight(&a);
        assert_eq!(t.get_stats().in_flight_count, 0);

        t.mark_processed(&a, "first");
        t.mark_processed(&a, "second");
        assert_eq!(t.processed_description(&a).as_deref(), Some("first"));
    }

    #[test]
    fn should_reprocess_tracks_external_alt_changes() {
        let t = DedupTracker::default();
        let a = img("https://example.com/a.png");
        assert!(t.should_reprocess(&a));

        a.write_description("a dog");
        t.mark_processed(&a, "a dog");
        assert!(!t.should_reprocess(&a));

        a.set_alt(Some("edited by page script".into()));
        assert!(t.should_reprocess(&a));
    }

    #[test]
    fn element_index_is_bounded() {
        let t = DedupTracker::new(2);
        let mut arena = ElementArena::new();
        let images: Vec<PageImage> = (0..3)
            .map(|i| img(&format!("https://example.com/{i}.png")).with_element_key(arena.insert()))
            .collect();

        for image in &images {
            t.mark_in_flight(image);
        }
        assert_eq!(t.indexed_elements(), 2);
        // Eviction only drops the accelerator entry, never tracking state.
        assert!(t.is_in_flight(&images[0]));
    }

    #[test]
    fn reused_element_key_with_new_src_is_rehashed() {
        let t = DedupTracker::default();
        let mut arena = ElementArena::new();
        let key = arena.insert();
        let placeholder = img("https://example.com/placeholder.gif").with_element_key(key);
        t.mark_processed(&placeholder, "grey placeholder");

        // Lazy loader swaps the src on the same element.
        let real = img("https://example.com/real-photo.jpg").with_element_key(key);
        assert!(!t.is_processed(&real));
        assert_eq!(t.processed_description(&real), None);
        assert!(t.try_mark_in_flight(&real));
        assert_eq!(t.indexed_elements(), 1);

        // Same src, new natural size is a different image too.
        let resized =
            PageImage::new("https://example.com/placeholder.gif", 1, 1).with_element_key(key);
        assert!(!t.is_processed(&resized));
        assert!(t.is_processed(&placeholder));
    }

    #[test]
    fn element_index_evicts_least_recently_used() {
        let t = DedupTracker::new(2);
        let mut arena = ElementArena::new();
        let images: Vec<PageImage> = (0..3)
            .map(|i| img(&format!("https://example.com/{i}.png")).with_element_key(arena.insert()))
            .collect();

        t.mark_in_flight(&images[0]);
        t.mark_in_flight(&images[1]);
        // Touch 0 so 1 becomes the oldest.
        assert!(t.is_in_flight(&images[0]));
        t.mark_in_flight(&images[2]);

        let state = t.lock();
        let held = |i: usize| {
            let key = images[i].element_key().unwrap();
            state.elements.entries.contains_key(&key)
        };
        assert!(held(0));
        assert!(!held(1));
        assert!(held(2));
        assert_eq!(state.elements.recency.len(), 2);
    }

    #[test]
    fn sweep_drops_dead_elements() {
        let t = DedupTracker::default();
        let mut arena = ElementArena::new();
        let live = img("https://example.com/live.png").with_element_key(arena.insert());
        let gone_key = arena.insert();
        let gone = img("https://example.com/gone.png").with_element_key(gone_key);

        t.mark_in_flight(&live);
        t.mark_in_flight(&gone);
        arena.remove(gone_key);

        let swept = t.sweep(|k| arena.contains(k));
        assert_eq!(swept, 1);
        assert_eq!(t.indexed_elements(), 1);
        assert!(t.release_element(live.element_key().unwrap()));
        assert_eq!(t.indexed_elements(), 0);
    }

    #[test]
    fn clear_resets_everything() {
        let t = DedupTracker::default();
        let a = img("https://example.com/a.png");
        let b = img("https://example.com/b.png");
        t.mark_processed(&a, "x");
        t.mark_in_flight(&b);
        t.clear();
        assert_eq!(t.get_stats(), TrackerStats::default());
    }
}
