//! Named user shared buffers.
//!
//! A database handle hands out process-shared byte buffers keyed by name,
//! created from caller-supplied defaults on first request. Any holder may
//! `notify` the buffer, waking every registered callback; the payload, if
//! any, travels with the notification.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

/// Invoked on every `notify` of the owning buffer.
pub type BufferCallback = Arc<dyn Fn(Option<&[u8]>) + Send + Sync>;

/// A shared, named byte buffer.
pub struct SharedBuffer {
    name: String,
    data: Mutex<Vec<u8>>,
    callbacks: Mutex<Vec<BufferCallback>>,
}

impl std::fmt::Debug for SharedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedBuffer")
            .field("name", &self.name)
            .field("len", &self.data.lock().len())
            .finish()
    }
}

impl SharedBuffer {
    fn new(name: String, contents: Vec<u8>) -> Self {
        Self {
            name,
            data: Mutex::new(contents),
            callbacks: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.lock().is_empty()
    }

    /// A copy of the current contents.
    pub fn read(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    /// Replaces the contents.
    pub fn write(&self, bytes: &[u8]) {
        let mut data = self.data.lock();
        data.clear();
        data.extend_from_slice(bytes);
    }

    /// Overwrites a range, growing the buffer if needed.
    pub fn write_at(&self, offset: usize, bytes: &[u8]) {
        let mut data = self.data.lock();
        let end = offset + bytes.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[offset..end].copy_from_slice(bytes);
    }

    /// Registers `callback` to fire on every `notify`.
    pub fn subscribe(&self, callback: BufferCallback) {
        self.callbacks.lock().push(callback);
    }

    /// Wakes all registered callbacks. Returns how many fired.
    pub fn notify(&self, bytes: Option<&[u8]>) -> usize {
        let callbacks = self.callbacks.lock().clone();
        trace!(buffer = self.name, listeners = callbacks.len(), "notify");
        for callback in &callbacks {
            callback(bytes);
        }
        callbacks.len()
    }
}

/// The per-database registry of named buffers.
#[derive(Default)]
pub(crate) struct BufferRegistry {
    buffers: Mutex<HashMap<String, Arc<SharedBuffer>>>,
}

impl std::fmt::Debug for BufferRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferRegistry")
            .field("count", &self.buffers.lock().len())
            .finish()
    }
}

impl BufferRegistry {
    /// Returns the buffer named `name`, creating it with `default`
    /// contents on first request. `callback`, if given, is subscribed
    /// either way.
    pub fn get_or_create(
        &self,
        name: &str,
        default: &[u8],
        callback: Option<BufferCallback>,
    ) -> Arc<SharedBuffer> {
        let mut buffers = self.buffers.lock();
        let buffer = buffers
            .entry(name.to_owned())
            .or_insert_with(|| Arc::new(SharedBuffer::new(name.to_owned(), default.to_vec())));
        if let Some(callback) = callback {
            buffer.subscribe(callback);
        }
        Arc::clone(buffer)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn first_request_seeds_the_default() {
        let registry = BufferRegistry::default();
        let a = registry.get_or_create("buf", b"seed", None);
        assert_eq!(a.read(), b"seed");
        // A second request ignores its default.
        let b = registry.get_or_create("buf", b"other", None);
        assert_eq!(b.read(), b"seed");
        a.write(b"changed");
        assert_eq!(b.read(), b"changed");
    }

    #[test]
    fn notify_reaches_all_subscribers() {
        let registry = BufferRegistry::default();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let count = Arc::clone(&count);
            let _ = registry.get_or_create(
                "buf",
                b"",
                Some(Arc::new(move |bytes: Option<&[u8]>| {
                    assert_eq!(bytes, Some(b"ping".as_slice()));
                    let _ = count.fetch_add(1, Ordering::SeqCst);
                })),
            );
        }
        let buffer = registry.get_or_create("buf", b"", None);
        assert_eq!(buffer.notify(Some(b"ping")), 2);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn write_at_grows_the_buffer() {
        let buffer = SharedBuffer::new("b".into(), vec![1, 2]);
        buffer.write_at(4, &[9, 9]);
        assert_eq!(buffer.read(), vec![1, 2, 0, 0, 9, 9]);
    }
}
