//! Readiness-based event loop: epoll on Linux, kqueue on macOS.
//!
//! Grounded on `ae/io_event.rs` (the dual-backend `ApiState`) and `ae.rs`
//! (the old self-contained `EventLoop`), but reworked per spec Design Notes
//! section 9: no global singleton, no time-event machinery (this core has
//! no timers), and callbacks take an explicit `&mut Server` instead of
//! reaching for process-wide state.

use std::collections::HashMap;

use crate::net::Fd;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mask(u8);

impl Mask {
    pub const NONE: Mask = Mask(0);
    pub const READABLE: Mask = Mask(1);
    pub const WRITABLE: Mask = Mask(2);

    pub fn contains(self, other: Mask) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    pub fn remove(self, other: Mask) -> Mask {
        Mask(self.0 & !other.0)
    }
}

impl std::ops::BitOr for Mask {
    type Output = Mask;
    fn bitor(self, rhs: Mask) -> Mask {
        Mask(self.0 | rhs.0)
    }
}

struct FileEvent {
    mask: Mask,
}

/// One fd that came back ready from the last `poll`.
#[derive(Debug, Clone, Copy)]
pub struct FiredEvent {
    pub fd: Fd,
    pub mask: Mask,
}

pub struct EventLoop {
    events: HashMap<Fd, FileEvent>,
    backend: Backend,
    stop: bool,
}

impl EventLoop {
    pub fn new() -> Result<Self, String> {
        Ok(EventLoop {
            events: HashMap::new(),
            backend: Backend::create()?,
            stop: false,
        })
    }

    pub fn stop(&mut self) {
        self.stop = true;
    }

    pub fn should_stop(&self) -> bool {
        self.stop
    }

    pub fn create_file_event(&mut self, fd: Fd, mask: Mask) -> Result<(), String> {
        let old = self.events.get(&fd).map(|e| e.mask).unwrap_or(Mask::NONE);
        let new = old | mask;
        self.backend.add_event(fd, old, new)?;
        self.events.insert(fd, FileEvent { mask: new });
        Ok(())
    }

    pub fn delete_file_event(&mut self, fd: Fd, mask: Mask) {
        let Some(entry) = self.events.get(&fd) else { return };
        let old = entry.mask;
        let new = old.remove(mask);
        if self.backend.del_event(fd, old, new).is_err() {
            // best effort: fd may already be gone (closed underneath us)
        }
        if new.is_none() {
            self.events.remove(&fd);
        } else {
            self.events.insert(fd, FileEvent { mask: new });
        }
    }

    /// Block for up to `timeout_us` microseconds (`None` = forever) waiting
    /// for readiness, returning the fds that fired.
    pub fn poll(&mut self, timeout_us: Option<i64>) -> Result<Vec<FiredEvent>, String> {
        self.backend.poll(timeout_us)
    }
}

#[cfg(target_os = "linux")]
mod backend_impl {
    use super::{Fd, FiredEvent, Mask};
    use libc::{
        close, epoll_create, epoll_ctl, epoll_event, epoll_wait, EPOLLIN, EPOLLOUT, EPOLL_CTL_ADD,
        EPOLL_CTL_DEL, EPOLL_CTL_MOD,
    };

    pub struct Backend {
        epfd: i32,
    }

    fn mask_to_events(mask: Mask) -> u32 {
        let mut ev = 0u32;
        if mask.contains(Mask::READABLE) {
            ev |= EPOLLIN as u32;
        }
        if mask.contains(Mask::WRITABLE) {
            ev |= EPOLLOUT as u32;
        }
        ev
    }

    impl Backend {
        pub fn create() -> Result<Self, String> {
            let epfd = unsafe { epoll_create(1024) };
            if epfd == -1 {
                return Err(format!("epoll_create: {}", crate::util::last_os_error_message()));
            }
            Ok(Backend { epfd })
        }

        pub fn add_event(&mut self, fd: Fd, old: Mask, new: Mask) -> Result<(), String> {
            let op = if old.is_none() { EPOLL_CTL_ADD } else { EPOLL_CTL_MOD };
            let mut ev: epoll_event = unsafe { std::mem::zeroed() };
            ev.events = mask_to_events(new);
            ev.u64 = fd as u64;
            if unsafe { epoll_ctl(self.epfd, op, fd, &mut ev) } == -1 {
                return Err(format!("epoll_ctl: {}", crate::util::last_os_error_message()));
            }
            Ok(())
        }

        pub fn del_event(&mut self, fd: Fd, _old: Mask, new: Mask) -> Result<(), String> {
            if new.is_none() {
                if unsafe { epoll_ctl(self.epfd, EPOLL_CTL_DEL, fd, std::ptr::null_mut()) } == -1 {
                    return Err(format!("epoll_ctl(DEL): {}", crate::util::last_os_error_message()));
                }
            } else {
                let mut ev: epoll_event = unsafe { std::mem::zeroed() };
                ev.events = mask_to_events(new);
                ev.u64 = fd as u64;
                if unsafe { epoll_ctl(self.epfd, EPOLL_CTL_MOD, fd, &mut ev) } == -1 {
                    return Err(format!("epoll_ctl(MOD): {}", crate::util::last_os_error_message()));
                }
            }
            Ok(())
        }

        pub fn poll(&mut self, timeout_us: Option<i64>) -> Result<Vec<FiredEvent>, String> {
            let timeout_ms = match timeout_us {
                None => -1,
                Some(us) => (us / 1000) as i32,
            };
            let mut evs: [epoll_event; 128] = unsafe { std::mem::zeroed() };
            let n = unsafe { epoll_wait(self.epfd, evs.as_mut_ptr(), evs.len() as i32, timeout_ms) };
            if n == -1 {
                if crate::util::errno() == libc::EINTR {
                    return Ok(Vec::new());
                }
                return Err(format!("epoll_wait: {}", crate::util::last_os_error_message()));
            }
            let mut fired = Vec::with_capacity(n as usize);
            for ev in &evs[..n as usize] {
                let mut mask = Mask::NONE;
                if ev.events & (EPOLLIN as u32) != 0 {
                    mask = mask | Mask::READABLE;
                }
                if ev.events & (EPOLLOUT as u32) != 0 {
                    mask = mask | Mask::WRITABLE;
                }
                fired.push(FiredEvent { fd: ev.u64 as Fd, mask });
            }
            Ok(fired)
        }
    }

    impl Drop for Backend {
        fn drop(&mut self) {
            unsafe {
                close(self.epfd);
            }
        }
    }
}

#[cfg(target_os = "macos")]
mod backend_impl {
    use super::{Fd, FiredEvent, Mask};
    use libc::{close, kevent, kqueue, timespec, EVFILT_READ, EVFILT_WRITE, EV_ADD, EV_DELETE};

    pub struct Backend {
        kqfd: i32,
    }

    impl Backend {
        pub fn create() -> Result<Self, String> {
            let kqfd = unsafe { kqueue() };
            if kqfd == -1 {
                return Err(format!("kqueue: {}", crate::util::last_os_error_message()));
            }
            Ok(Backend { kqfd })
        }

        fn change(&mut self, fd: Fd, filter: i16, flags: u16) -> Result<(), String> {
            let mut kev: libc::kevent = unsafe { std::mem::zeroed() };
            kev.ident = fd as usize;
            kev.filter = filter;
            kev.flags = flags;
            let rc = unsafe { kevent(self.kqfd, &kev, 1, std::ptr::null_mut(), 0, std::ptr::null()) };
            if rc == -1 {
                return Err(format!("kevent: {}", crate::util::last_os_error_message()));
            }
            Ok(())
        }

        pub fn add_event(&mut self, fd: Fd, old: Mask, new: Mask) -> Result<(), String> {
            if new.contains(Mask::READABLE) && !old.contains(Mask::READABLE) {
                self.change(fd, EVFILT_READ, EV_ADD)?;
            }
            if new.contains(Mask::WRITABLE) && !old.contains(Mask::WRITABLE) {
                self.change(fd, EVFILT_WRITE, EV_ADD)?;
            }
            Ok(())
        }

        pub fn del_event(&mut self, fd: Fd, old: Mask, new: Mask) -> Result<(), String> {
            if old.contains(Mask::READABLE) && !new.contains(Mask::READABLE) {
                self.change(fd, EVFILT_READ, EV_DELETE)?;
            }
            if old.contains(Mask::WRITABLE) && !new.contains(Mask::WRITABLE) {
                self.change(fd, EVFILT_WRITE, EV_DELETE)?;
            }
            Ok(())
        }

        pub fn poll(&mut self, timeout_us: Option<i64>) -> Result<Vec<FiredEvent>, String> {
            let ts = timeout_us.map(|us| timespec {
                tv_sec: (us / 1_000_000) as i64,
                tv_nsec: ((us % 1_000_000) * 1000) as i64,
            });
            let ts_ptr = ts.as_ref().map(|t| t as *const timespec).unwrap_or(std::ptr::null());
            let mut out: [libc::kevent; 128] = unsafe { std::mem::zeroed() };
            let n = unsafe {
                kevent(self.kqfd, std::ptr::null(), 0, out.as_mut_ptr(), out.len() as i32, ts_ptr)
            };
            if n == -1 {
                if crate::util::errno() == libc::EINTR {
                    return Ok(Vec::new());
                }
                return Err(format!("kevent(poll): {}", crate::util::last_os_error_message()));
            }
            let mut fired: Vec<FiredEvent> = Vec::new();
            for kev in &out[..n as usize] {
                let fd = kev.ident as Fd;
                let mask = if kev.filter == EVFILT_READ {
                    Mask::READABLE
                } else {
                    Mask::WRITABLE
                };
                if let Some(existing) = fired.iter_mut().find(|f: &&mut FiredEvent| f.fd == fd) {
                    existing.mask = existing.mask | mask;
                } else {
                    fired.push(FiredEvent { fd, mask });
                }
            }
            Ok(fired)
        }
    }

    impl Drop for Backend {
        fn drop(&mut self) {
            unsafe {
                close(self.kqfd);
            }
        }
    }
}

use backend_impl::Backend;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_bitor_and_contains() {
        let m = Mask::READABLE | Mask::WRITABLE;
        assert!(m.contains(Mask::READABLE));
        assert!(m.contains(Mask::WRITABLE));
        assert!(!Mask::READABLE.contains(Mask::WRITABLE));
    }

    #[test]
    fn mask_remove() {
        let m = Mask::READABLE | Mask::WRITABLE;
        let m2 = m.remove(Mask::WRITABLE);
        assert!(m2.contains(Mask::READABLE));
        assert!(!m2.contains(Mask::WRITABLE));
    }

    #[test]
    fn create_file_event_then_remove_drops_tracking() {
        let mut el = EventLoop::new().expect("event loop backend available in test environment");
        // Use stdin's fd (0) purely to exercise the bookkeeping path; this
        // test only checks internal state transitions, not real readiness.
        el.create_file_event(0, Mask::READABLE).unwrap();
        assert!(el.events.contains_key(&0));
        el.delete_file_event(0, Mask::READABLE);
        assert!(!el.events.contains_key(&0));
    }
}
