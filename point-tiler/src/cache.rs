//! Thread-safe owner of in-flight point buffers.
//!
//! Buffers waiting to be processed live in a slot arena addressed by
//! integer handles; one mutex guards registration and drain, processing
//! always happens outside the lock on the moved-out buffer. The arena
//! also tracks the resident byte estimate that drives the tiler's memory
//! bound.

use point_data::PointBuffer;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(usize);

#[derive(Debug, Default)]
struct CacheInner {
    slots: Vec<Option<PointBuffer>>,
    free: Vec<usize>,
    resident_bytes: usize,
}

#[derive(Debug, Default)]
pub struct PointsCache {
    inner: Mutex<CacheInner>,
}

impl PointsCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a buffer and returns its handle.
    pub fn insert(&self, buffer: PointBuffer) -> BufferHandle {
        let mut inner = self.inner.lock().expect("points cache poisoned");
        inner.resident_bytes += buffer.memory_usage();
        match inner.free.pop() {
            Some(slot) => {
                inner.slots[slot] = Some(buffer);
                BufferHandle(slot)
            }
            None => {
                inner.slots.push(Some(buffer));
                BufferHandle(inner.slots.len() - 1)
            }
        }
    }

    /// Moves a buffer out of the cache. A handle is valid exactly once.
    pub fn take(&self, handle: BufferHandle) -> PointBuffer {
        let mut inner = self.inner.lock().expect("points cache poisoned");
        let buffer = inner.slots[handle.0]
            .take()
            .expect("buffer handle already taken");
        inner.resident_bytes -= buffer.memory_usage();
        inner.free.push(handle.0);
        buffer
    }

    /// Estimated bytes of all resident buffers.
    pub fn resident_bytes(&self) -> usize {
        self.inner
            .lock()
            .expect("points cache poisoned")
            .resident_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.inner
            .lock()
            .expect("points cache poisoned")
            .slots
            .iter()
            .all(|slot| slot.is_none())
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("points cache poisoned");
        inner.slots.clear();
        inner.free.clear();
        inner.resident_bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use point_data::attributes::AttributeSchema;
    use point_data::buffer::Point;

    fn buffer_with(count: usize) -> PointBuffer {
        let mut buffer = PointBuffer::new(AttributeSchema::position_only());
        for i in 0..count {
            buffer.push(Point {
                position: [i as f64, 0.0, 0.0],
                ..Point::default()
            });
        }
        buffer
    }

    #[test]
    fn insert_take_round_trips_ownership() {
        let cache = PointsCache::new();
        let handle = cache.insert(buffer_with(10));
        assert!(!cache.is_empty());
        let buffer = cache.take(handle);
        assert_eq!(buffer.len(), 10);
        assert!(cache.is_empty());
        assert_eq!(cache.resident_bytes(), 0);
    }

    #[test]
    fn resident_bytes_track_contents() {
        let cache = PointsCache::new();
        let small = cache.insert(buffer_with(1));
        let bytes_one = cache.resident_bytes();
        let big = cache.insert(buffer_with(1000));
        assert!(cache.resident_bytes() > bytes_one);
        cache.take(big);
        assert_eq!(cache.resident_bytes(), bytes_one);
        cache.take(small);
    }

    #[test]
    fn slots_are_reused() {
        let cache = PointsCache::new();
        let first = cache.insert(buffer_with(1));
        cache.take(first);
        let second = cache.insert(buffer_with(1));
        assert_eq!(first, second);
        cache.take(second);
    }
}
