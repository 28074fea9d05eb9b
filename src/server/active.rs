//! Active-session arbitration
//!
//! The current/previous pair is the only cross-session state mutated
//! outside a session thread. One short lock serialises transitions; it is
//! never held across I/O. Readers sample the pair from shared memory, where
//! it is a single packed atomic.

use std::sync::{Mutex, MutexGuard};

use log::info;

use super::arena::SessionArena;
use crate::error::IpcError;
use crate::ipc::protocol::{ClientFlags, Event};
use crate::shm::{ActivePair, GlobalWriter};

const SHOWN: ClientFlags = ClientFlags::VISIBLE
    .union(ClientFlags::FOCUSED)
    .union(ClientFlags::PRIMARY);

struct ActiveInner {
    pair: ActivePair,
    writer: GlobalWriter,
}

pub struct ActiveSessions {
    inner: Mutex<ActiveInner>,
}

impl ActiveSessions {
    pub fn new(writer: GlobalWriter) -> Self {
        Self {
            inner: Mutex::new(ActiveInner {
                pair: ActivePair::NONE,
                writer,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ActiveInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn pair(&self) -> ActivePair {
        self.lock().pair
    }

    /// Make `id` the active session
    ///
    /// The session must be occupied and have begun its session.
    pub fn set_active(&self, id: u32, arena: &SessionArena) -> Result<(), IpcError> {
        let shared = arena.shared(id).ok_or(IpcError::NotFound)?;
        // Checked under the lock so it is serialised with SessionEnd.
        let mut inner = self.lock();
        if !shared.is_running() {
            return Err(IpcError::InvalidState("session has not begun"));
        }
        let previous = inner.pair.current;
        if previous != Some(id) {
            switch(&mut inner, Some(id), previous, arena);
        }
        Ok(())
    }

    /// A session began; it takes over if nothing is active
    pub fn on_session_begin(&self, id: u32, arena: &SessionArena) {
        let mut inner = self.lock();
        if inner.pair.current.is_none() {
            let previous = inner.pair.previous;
            switch(&mut inner, Some(id), previous, arena);
        }
    }

    /// A session ended or is going away; hand the role to a fallback
    ///
    /// Idempotent. The fallback is the previous session if it is still
    /// running, else the lowest-index running session, else none.
    pub fn deactivate(&self, id: u32, arena: &SessionArena) {
        let mut inner = self.lock();
        let pair = inner.pair;

        if pair.current != Some(id) {
            if pair.previous == Some(id) {
                // Its ring is about to be recycled; never fall back to it.
                let current = pair.current;
                switch(&mut inner, current, None, arena);
            }
            return;
        }

        let running = |candidate: u32| {
            candidate != id && arena.shared(candidate).is_some_and(|s| s.is_running())
        };
        let fallback = pair
            .previous
            .filter(|&p| running(p))
            .or_else(|| arena.occupied_ids().into_iter().find(|&c| running(c)));
        switch(&mut inner, fallback, None, arena);
    }
}

/// Publish a new pair and tell both sides of the switch
fn switch(
    inner: &mut ActiveInner,
    current: Option<u32>,
    previous: Option<u32>,
    arena: &SessionArena,
) {
    let demoted = inner.pair.current.filter(|&old| Some(old) != current);
    let promoted = current.filter(|&new| Some(new) != inner.pair.current);

    // Frames published before this point do not count as the new
    // session's first frame.
    let mark = current.map_or(0, |id| inner.writer.reader().published(id as usize));
    let pair = ActivePair { current, previous };
    inner.writer.write(pair, mark);
    inner.pair = pair;

    if let Some(old) = demoted.and_then(|id| arena.shared(id)) {
        old.update_flags(ClientFlags::empty(), SHOWN);
        old.post(Event::StateChange {
            visible: false,
            focused: false,
        });
    }
    if let Some(new) = promoted.and_then(|id| arena.shared(id)) {
        new.update_flags(SHOWN, ClientFlags::empty());
        new.post(Event::StateChange {
            visible: true,
            focused: true,
        });
    }
    if demoted.is_some() || promoted.is_some() {
        info!(
            "Active session: {:?} (previous {:?})",
            pair.current, pair.previous
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::channel::MessageChannel;
    use crate::session::SessionShared;
    use crate::shm::SharedMemory;
    use std::os::unix::net::UnixStream;
    use std::sync::Arc;

    struct Fixture {
        shm: Arc<SharedMemory>,
        arena: SessionArena,
        active: ActiveSessions,
        _peers: Vec<UnixStream>,
    }

    fn fixture(sessions: u32) -> Fixture {
        let (shm, writers) = SharedMemory::create(sessions as usize).unwrap();
        let arena = SessionArena::new(sessions as usize);
        let mut peers = Vec::new();
        for _ in 0..sessions {
            let id = arena.claim().unwrap();
            let (a, b) = UnixStream::pair().unwrap();
            let closer = MessageChannel::new(a).closer().unwrap();
            arena.install(id, Arc::new(SessionShared::new(id, 8)), closer);
            peers.push(b);
        }
        Fixture {
            shm,
            arena,
            active: ActiveSessions::new(writers.global),
            _peers: peers,
        }
    }

    fn begin(f: &Fixture, id: u32) {
        f.arena
            .shared(id)
            .unwrap()
            .update_flags(ClientFlags::SESSION_ACTIVE, ClientFlags::empty());
        f.active.on_session_begin(id, &f.arena);
    }

    fn end(f: &Fixture, id: u32) {
        f.arena
            .shared(id)
            .unwrap()
            .update_flags(ClientFlags::empty(), ClientFlags::SESSION_ACTIVE);
        f.active.deactivate(id, &f.arena);
    }

    #[test]
    fn test_first_session_becomes_active() {
        let f = fixture(2);
        begin(&f, 0);
        begin(&f, 1);
        assert_eq!(f.active.pair().current, Some(0));
        assert_eq!(f.shm.reader().active().current, Some(0));
        let flags = f.arena.shared(0).unwrap().flags();
        assert!(flags.contains(ClientFlags::VISIBLE | ClientFlags::PRIMARY));
        assert!(!f.arena.shared(1).unwrap().flags().contains(ClientFlags::VISIBLE));
    }

    #[test]
    fn test_switch_notifies_both_sides() {
        let f = fixture(2);
        begin(&f, 0);
        begin(&f, 1);
        f.arena.shared(0).unwrap().events().drain();

        f.active.set_active(1, &f.arena).unwrap();
        let pair = f.shm.reader().active();
        assert_eq!(pair.current, Some(1));
        assert_eq!(pair.previous, Some(0));

        let old = f.arena.shared(0).unwrap().events().drain();
        assert_eq!(
            old.last().map(|e| e.event),
            Some(Event::StateChange {
                visible: false,
                focused: false
            })
        );
        let new = f.arena.shared(1).unwrap().events().drain();
        assert_eq!(
            new.last().map(|e| e.event),
            Some(Event::StateChange {
                visible: true,
                focused: true
            })
        );
    }

    #[test]
    fn test_set_active_validation() {
        let f = fixture(2);
        assert!(matches!(
            f.active.set_active(1, &f.arena),
            Err(IpcError::InvalidState(_))
        ));
        assert!(matches!(
            f.active.set_active(5, &f.arena),
            Err(IpcError::NotFound)
        ));
        begin(&f, 1);
        f.active.set_active(1, &f.arena).unwrap();
        // Re-selecting the active session changes nothing.
        f.arena.shared(1).unwrap().events().drain();
        f.active.set_active(1, &f.arena).unwrap();
        assert!(f.arena.shared(1).unwrap().events().is_empty());
    }

    #[test]
    fn test_ended_session_never_stays_active() {
        let f = Arc::new(fixture(2));
        begin(&f, 0);

        let toggler = {
            let f = f.clone();
            std::thread::spawn(move || {
                for _ in 0..2_000 {
                    begin(&f, 1);
                    end(&f, 1);
                }
            })
        };
        let selector = {
            let f = f.clone();
            std::thread::spawn(move || {
                while !toggler.is_finished() {
                    let _ = f.active.set_active(1, &f.arena);
                }
                toggler.join().unwrap();
            })
        };
        selector.join().unwrap();

        assert!(!f.arena.shared(1).unwrap().is_running());
        assert_ne!(f.active.pair().current, Some(1));
        assert_ne!(f.shm.reader().active().current, Some(1));
        assert!(matches!(
            f.active.set_active(1, &f.arena),
            Err(IpcError::InvalidState(_))
        ));
    }

    #[test]
    fn test_fallback_prefers_previous() {
        let f = fixture(3);
        begin(&f, 0);
        begin(&f, 1);
        begin(&f, 2);
        f.active.set_active(2, &f.arena).unwrap();
        assert_eq!(f.active.pair().previous, Some(0));

        end(&f, 2);
        assert_eq!(f.active.pair().current, Some(0));
        assert_eq!(f.active.pair().previous, None);
    }

    #[test]
    fn test_fallback_lowest_running_then_none() {
        let f = fixture(3);
        begin(&f, 1);
        begin(&f, 2);
        f.active.set_active(2, &f.arena).unwrap();
        end(&f, 1);
        // The previous session left, so it is no longer a fallback.
        assert_eq!(f.active.pair().previous, None);
        assert_eq!(f.active.pair().current, Some(2));

        begin(&f, 0);
        end(&f, 2);
        assert_eq!(f.active.pair().current, Some(0));

        end(&f, 0);
        assert_eq!(f.active.pair(), ActivePair::NONE);
        // Repeating a deactivation is harmless.
        f.active.deactivate(0, &f.arena);
        assert_eq!(f.shm.reader().active(), ActivePair::NONE);
    }

    #[test]
    fn test_readers_only_see_prior_or_new_pair() {
        let f = Arc::new(fixture(2));
        begin(&f, 0);
        begin(&f, 1);
        let a = ActivePair {
            current: Some(0),
            previous: Some(1),
        };
        let b = ActivePair {
            current: Some(1),
            previous: Some(0),
        };

        let switcher = {
            let f = f.clone();
            std::thread::spawn(move || {
                for i in 0..5_000 {
                    f.active.set_active(i % 2, &f.arena).unwrap();
                }
            })
        };
        let reader = f.shm.reader();
        while !switcher.is_finished() {
            let pair = reader.active();
            assert!(
                pair == a || pair == b || pair.current == Some(0),
                "unexpected pair {:?}",
                pair
            );
        }
        switcher.join().unwrap();
    }
}
