//! One-shot wait/wake gate, used by `stop_the_world`'s `stopped` note and
//! each worker's `havenextg` note.
//!
//! A `Mutex`-protected flag plus a `Condvar` to park/wake waiters, rather
//! than a spin loop, since workers parking between dispatches should yield
//! the OS thread instead of burning a core.

use std::sync::{Condvar, Mutex};

#[derive(Default)]
pub struct Note {
    fired: Mutex<bool>,
    condvar: Condvar,
}

impl Note {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset to the unfired state, so the note can be reused before parking
    /// again.
    pub fn clear(&self) {
        *self.fired.lock().unwrap() = false;
    }

    /// Block until [`Note::wakeup`] is called (or was already called since
    /// the last [`Note::clear`]).
    pub fn sleep(&self) {
        let mut fired = self.fired.lock().unwrap();
        while !*fired {
            fired = self.condvar.wait(fired).unwrap();
        }
    }

    /// Fire the note, waking any current or future `sleep` until the next
    /// `clear`.
    pub fn wakeup(&self) {
        *self.fired.lock().unwrap() = true;
        self.condvar.notify_all();
    }

    pub fn is_fired(&self) -> bool {
        *self.fired.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn wakeup_before_sleep_is_not_lost() {
        let note = Note::new();
        note.wakeup();
        note.sleep(); // must not block
    }

    #[test]
    fn sleep_blocks_until_woken_from_another_thread() {
        let note = Arc::new(Note::new());
        let n = note.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            n.wakeup();
        });
        note.sleep();
        handle.join().unwrap();
    }

    #[test]
    fn clear_allows_reuse() {
        let note = Note::new();
        note.wakeup();
        assert!(note.is_fired());
        note.clear();
        assert!(!note.is_fired());
    }
}
