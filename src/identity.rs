//! Image identity and element keys.
//!
//! [`ImageIdentity`] is the durable deduplication key: a digest of the
//! locator plus natural dimensions, so an element that is removed and
//! re-inserted into the page still maps to the same logical image.
//!
//! [`ElementKey`] identifies a live page element. Keys come from an
//! [`ElementArena`]; freeing a slot bumps its generation, so a key held
//! after its element was removed can never alias whatever reuses the slot.

use std::fmt;

/// Deduplication key derived from `(locator, width, height)`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageIdentity(blake3::Hash);

impl ImageIdentity {
    pub fn new(locator: &str, width: u32, height: u32) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(locator.as_bytes());
        hasher.update(b"|");
        hasher.update(format!("{width}x{height}").as_bytes());
        Self(hasher.finalize())
    }

    /// Short hex form for log lines.
    pub fn short(&self) -> String {
        self.0.to_hex()[..12].to_string()
    }
}

impl fmt::Debug for ImageIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ImageIdentity({})", self.short())
    }
}

impl fmt::Display for ImageIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.to_hex())
    }
}

/// Generation-counted handle to a live page element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ElementKey {
    pub slot: u32,
    pub generation: u32,
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    occupied: bool,
}

/// Allocator for [`ElementKey`]s with slot reuse.
#[derive(Debug, Default)]
pub struct ElementArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl ElementArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a key for a newly observed element.
    pub fn insert(&mut self) -> ElementKey {
        if let Some(slot) = self.free.pop() {
            let entry = &mut self.slots[slot as usize];
            entry.occupied = true;
            return ElementKey {
                slot,
                generation: entry.generation,
            };
        }
        let slot = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            occupied: true,
        });
        ElementKey {
            slot,
            generation: 0,
        }
    }

    /// Free the element's slot. Returns false for stale or unknown keys.
    pub fn remove(&mut self, key: ElementKey) -> bool {
        if !self.contains(key) {
            return false;
        }
        let entry = &mut self.slots[key.slot as usize];
        entry.occupied = false;
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(key.slot);
        true
    }

    pub fn contains(&self, key: ElementKey) -> bool {
        self.slots
            .get(key.slot as usize)
            .is_some_and(|s| s.occupied && s.generation == key.generation)
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.occupied).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
