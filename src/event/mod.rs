//! Single-threaded readiness event loop
//!
//! The scheduler of the whole server: one thread alternates between a
//! blocking readiness wait (epoll on Linux, poll elsewhere, chosen at
//! build time) and dispatching whatever fired — file events first, then
//! due timers from an unsorted list. Handlers run to completion; nothing
//! preempts them.
//!
//! Handlers are `Rc` closures over a caller-supplied context `C` (the
//! server), so a handler can freely register and unregister events on the
//! loop that is calling it.

use crate::clock::wall_ms;
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use tracing::{debug, warn};

#[cfg(target_os = "linux")]
mod epoll;
#[cfg(target_os = "linux")]
use epoll::{Backend, BACKEND_NAME};

#[cfg(not(target_os = "linux"))]
mod poll;
#[cfg(not(target_os = "linux"))]
use poll::{Backend, BACKEND_NAME};

pub type Mask = u8;
pub const NONE: Mask = 0;
pub const READABLE: Mask = 1 << 0;
pub const WRITABLE: Mask = 1 << 1;
/// When both directions fire in one tick, run writable before readable.
/// Lets a handler flush pending output before accepting more work.
pub const BARRIER: Mask = 1 << 2;

pub const FILE_EVENTS: u8 = 1 << 0;
pub const TIME_EVENTS: u8 = 1 << 1;
pub const ALL_EVENTS: u8 = FILE_EVENTS | TIME_EVENTS;
pub const DONT_WAIT: u8 = 1 << 2;

/// What a timer handler wants next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerNext {
    /// One-shot: mark deleted, finalizer runs at the next sweep.
    Stop,
    /// Re-arm this many milliseconds after *now*.
    AfterMs(u64),
}

pub type FileProc<C> = Rc<dyn Fn(&mut C, &mut EventLoop<C>, RawFd, Mask)>;
pub type TimeProc<C> = Rc<dyn Fn(&mut C, &mut EventLoop<C>, u64) -> TimerNext>;
pub type EventFinalizer<C> = Rc<dyn Fn(&mut C, &mut EventLoop<C>)>;
pub type SleepHook<C> = Rc<dyn Fn(&mut C, &mut EventLoop<C>)>;

struct FileEvent<C> {
    mask: Mask,
    rfile: Option<FileProc<C>>,
    wfile: Option<FileProc<C>>,
}

impl<C> FileEvent<C> {
    fn empty() -> Self {
        Self { mask: NONE, rfile: None, wfile: None }
    }
}

struct TimeEvent<C> {
    id: u64,
    when_sec: u64,
    when_ms: u64,
    proc_: TimeProc<C>,
    finalizer: Option<EventFinalizer<C>>,
    deleted: bool,
}

impl<C> TimeEvent<C> {
    fn when(&self) -> u64 {
        self.when_sec * 1000 + self.when_ms
    }

    fn set_when(&mut self, ms: u64) {
        self.when_sec = ms / 1000;
        self.when_ms = ms % 1000;
    }
}

pub struct EventLoop<C> {
    backend: Backend,
    events: Vec<FileEvent<C>>,
    time_events: Vec<TimeEvent<C>>,
    time_next_id: u64,
    /// Wall seconds at the last timer pass; detects backward clock jumps.
    last_time: u64,
    before_sleep: Option<SleepHook<C>>,
    after_sleep: Option<SleepHook<C>>,
    stop: bool,
}

impl<C> EventLoop<C> {
    pub fn new(setsize: usize) -> io::Result<Self> {
        let backend = Backend::new(setsize)?;
        debug!("event loop using {BACKEND_NAME} backend, setsize {setsize}");
        let mut events = Vec::with_capacity(setsize);
        events.resize_with(setsize, FileEvent::empty);
        Ok(Self {
            backend,
            events,
            time_events: Vec::new(),
            time_next_id: 0,
            last_time: wall_ms() / 1000,
            before_sleep: None,
            after_sleep: None,
            stop: false,
        })
    }

    pub fn backend_name(&self) -> &'static str {
        BACKEND_NAME
    }

    pub fn set_before_sleep(&mut self, hook: SleepHook<C>) {
        self.before_sleep = Some(hook);
    }

    pub fn set_after_sleep(&mut self, hook: SleepHook<C>) {
        self.after_sleep = Some(hook);
    }

    pub fn stop(&mut self) {
        self.stop = true;
    }

    // ---- file events ----

    /// Register a handler for `mask` on `fd`. The handler may mutate the
    /// loop, including removing its own registration.
    pub fn create_file_event(
        &mut self,
        fd: RawFd,
        mask: Mask,
        proc_: FileProc<C>,
    ) -> io::Result<()> {
        let idx = fd as usize;
        if idx >= self.events.len() {
            self.events.resize_with(idx + 1, FileEvent::empty);
        }
        self.backend.add(fd, self.events[idx].mask, mask & (READABLE | WRITABLE))?;
        let fe = &mut self.events[idx];
        fe.mask |= mask;
        if mask & READABLE != 0 {
            fe.rfile = Some(proc_.clone());
        }
        if mask & WRITABLE != 0 {
            fe.wfile = Some(proc_);
        }
        Ok(())
    }

    pub fn delete_file_event(&mut self, fd: RawFd, mask: Mask) {
        let idx = fd as usize;
        if idx >= self.events.len() || self.events[idx].mask == NONE {
            return;
        }
        // Dropping the writable side also clears the barrier bit.
        let mask = if mask & WRITABLE != 0 { mask | BARRIER } else { mask };
        self.backend.del(fd, self.events[idx].mask, mask & (READABLE | WRITABLE));
        let fe = &mut self.events[idx];
        fe.mask &= !mask;
        if mask & READABLE != 0 {
            fe.rfile = None;
        }
        if mask & WRITABLE != 0 {
            fe.wfile = None;
        }
    }

    pub fn file_event_mask(&self, fd: RawFd) -> Mask {
        self.events
            .get(fd as usize)
            .map(|fe| fe.mask)
            .unwrap_or(NONE)
    }

    // ---- time events ----

    /// Arm a timer `after_ms` from now. Returns its id.
    pub fn create_time_event(
        &mut self,
        after_ms: u64,
        proc_: TimeProc<C>,
        finalizer: Option<EventFinalizer<C>>,
    ) -> u64 {
        let id = self.time_next_id;
        self.time_next_id += 1;
        let mut te = TimeEvent {
            id,
            when_sec: 0,
            when_ms: 0,
            proc_,
            finalizer,
            deleted: false,
        };
        te.set_when(wall_ms() + after_ms);
        self.time_events.push(te);
        id
    }

    /// Logical deletion; the event is swept (and its finalizer runs) on
    /// the next timer pass.
    pub fn delete_time_event(&mut self, id: u64) -> bool {
        match self.time_events.iter_mut().find(|te| te.id == id) {
            Some(te) => {
                te.deleted = true;
                true
            }
            None => false,
        }
    }

    fn nearest_timer_ms(&self) -> Option<u64> {
        self.time_events
            .iter()
            .filter(|te| !te.deleted)
            .map(|te| te.when())
            .min()
    }

    // ---- dispatch ----

    /// One loop tick. Returns the number of events dispatched.
    pub fn process_events(&mut self, ctx: &mut C, flags: u8) -> usize {
        let mut processed = 0;
        if flags & ALL_EVENTS == 0 {
            return 0;
        }

        let timeout = if flags & DONT_WAIT != 0 {
            Some(0)
        } else if flags & TIME_EVENTS != 0 {
            match self.nearest_timer_ms() {
                Some(when) => Some(when.saturating_sub(wall_ms())),
                None => None,
            }
        } else {
            None
        };

        let fired = self.backend.poll(timeout);

        if let Some(hook) = self.after_sleep.clone() {
            if flags & FILE_EVENTS != 0 {
                hook(ctx, self);
            }
        }

        if flags & FILE_EVENTS != 0 {
            for (fd, fired_mask) in fired {
                let idx = fd as usize;
                if idx >= self.events.len() {
                    continue;
                }
                let mask = self.events[idx].mask;
                let invert = mask & BARRIER != 0;
                let mut fired_read = false;
                let mut fired_write = false;

                if !invert && mask & fired_mask & READABLE != 0 {
                    if let Some(f) = self.current_handler(idx, READABLE) {
                        f(ctx, self, fd, fired_mask);
                        fired_read = true;
                    }
                }
                if mask & fired_mask & WRITABLE != 0 {
                    // Re-read: the first handler may have deregistered or
                    // replaced the other direction.
                    if let Some(f) = self.current_handler(idx, WRITABLE) {
                        let same = fired_read
                            && self
                                .current_handler(idx, READABLE)
                                .is_some_and(|r| Rc::ptr_eq(&r, &f));
                        if !same {
                            f(ctx, self, fd, fired_mask);
                            fired_write = true;
                        }
                    }
                }
                if invert && mask & fired_mask & READABLE != 0 {
                    if let Some(f) = self.current_handler(idx, READABLE) {
                        let same = fired_write
                            && self
                                .current_handler(idx, WRITABLE)
                                .is_some_and(|w| Rc::ptr_eq(&w, &f));
                        if !same {
                            f(ctx, self, fd, fired_mask);
                        }
                    }
                }
                processed += 1;
            }
        }

        if flags & TIME_EVENTS != 0 {
            processed += self.process_time_events(ctx);
        }
        processed
    }

    fn current_handler(&self, idx: usize, direction: Mask) -> Option<FileProc<C>> {
        let fe = self.events.get(idx)?;
        if fe.mask & direction == 0 {
            return None;
        }
        if direction == READABLE {
            fe.rfile.clone()
        } else {
            fe.wfile.clone()
        }
    }

    fn process_time_events(&mut self, ctx: &mut C) -> usize {
        let mut processed = 0;
        let now_ms = wall_ms();
        let now_sec = now_ms / 1000;
        if now_sec < self.last_time {
            // The wall clock moved backward. Better to fire every timer
            // early once than to strand them in the future.
            warn!("clock moved backwards, forcing all timers due");
            for te in &mut self.time_events {
                te.when_sec = 0;
            }
        }
        self.last_time = now_sec;

        // Sweep logically-deleted events, running finalizers.
        let mut i = 0;
        while i < self.time_events.len() {
            if self.time_events[i].deleted {
                let te = self.time_events.remove(i);
                if let Some(f) = &te.finalizer {
                    f(ctx, self);
                }
            } else {
                i += 1;
            }
        }

        // Events registered while firing are skipped until the next pass.
        let max_id = self.time_next_id;
        let mut i = 0;
        while i < self.time_events.len() {
            let (id, due, proc_) = {
                let te = &self.time_events[i];
                (te.id, !te.deleted && te.when() <= now_ms, te.proc_.clone())
            };
            if id < max_id && due {
                let ret = proc_(ctx, self, id);
                processed += 1;
                if let Some(te) = self.time_events.iter_mut().find(|t| t.id == id) {
                    match ret {
                        TimerNext::AfterMs(ms) => te.set_when(wall_ms() + ms),
                        TimerNext::Stop => te.deleted = true,
                    }
                }
            }
            i += 1;
        }
        processed
    }

    /// Run until [`stop`](Self::stop) is called.
    pub fn run(&mut self, ctx: &mut C) {
        self.stop = false;
        while !self.stop {
            if let Some(hook) = self.before_sleep.clone() {
                hook(ctx, self);
            }
            self.process_events(ctx, ALL_EVENTS);
        }
    }

    #[cfg(test)]
    fn force_last_time(&mut self, secs: u64) {
        self.last_time = secs;
    }

    #[cfg(test)]
    fn timer_when(&self, id: u64) -> Option<u64> {
        self.time_events.iter().find(|t| t.id == id).map(|t| t.when())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[derive(Default)]
    struct Ctx {
        log: Vec<String>,
        counter: u64,
    }

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(rc, 0);
        (fds[0], fds[1])
    }

    fn close(fd: RawFd) {
        unsafe {
            libc::close(fd);
        }
    }

    fn write_byte(fd: RawFd) {
        let b = [1u8];
        unsafe {
            libc::write(fd, b.as_ptr() as *const libc::c_void, 1);
        }
    }

    #[test]
    fn test_readable_event_fires() {
        let mut el: EventLoop<Ctx> = EventLoop::new(64).unwrap();
        let mut ctx = Ctx::default();
        let (r, w) = pipe();
        el.create_file_event(
            r,
            READABLE,
            Rc::new(|ctx: &mut Ctx, _el: &mut EventLoop<Ctx>, _fd, _mask| {
                ctx.log.push("read".into());
            }),
        )
        .unwrap();
        write_byte(w);
        let n = el.process_events(&mut ctx, FILE_EVENTS | DONT_WAIT);
        assert_eq!(n, 1);
        assert_eq!(ctx.log, vec!["read"]);
        close(r);
        close(w);
    }

    #[test]
    fn test_no_event_without_readiness() {
        let mut el: EventLoop<Ctx> = EventLoop::new(64).unwrap();
        let mut ctx = Ctx::default();
        let (r, w) = pipe();
        el.create_file_event(
            r,
            READABLE,
            Rc::new(|ctx: &mut Ctx, _, _, _| ctx.log.push("read".into())),
        )
        .unwrap();
        let n = el.process_events(&mut ctx, FILE_EVENTS | DONT_WAIT);
        assert_eq!(n, 0);
        assert!(ctx.log.is_empty());
        close(r);
        close(w);
    }

    #[test]
    fn test_barrier_inverts_order() {
        let mut el: EventLoop<Ctx> = EventLoop::new(64).unwrap();
        let mut ctx = Ctx::default();
        // A pipe write end is always writable; to get both directions on
        // one fd use a socketpair with pending input.
        let mut fds = [0 as RawFd; 2];
        let rc = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
        };
        assert_eq!(rc, 0);
        let (a, b) = (fds[0], fds[1]);
        write_byte(b);

        el.create_file_event(
            a,
            READABLE,
            Rc::new(|ctx: &mut Ctx, _, _, _| ctx.log.push("read".into())),
        )
        .unwrap();
        el.create_file_event(
            a,
            WRITABLE | BARRIER,
            Rc::new(|ctx: &mut Ctx, _, _, _| ctx.log.push("write".into())),
        )
        .unwrap();
        el.process_events(&mut ctx, FILE_EVENTS | DONT_WAIT);
        assert_eq!(ctx.log, vec!["write", "read"]);

        // Without the barrier, readable runs first.
        ctx.log.clear();
        el.delete_file_event(a, WRITABLE | BARRIER);
        el.create_file_event(
            a,
            WRITABLE,
            Rc::new(|ctx: &mut Ctx, _, _, _| ctx.log.push("write".into())),
        )
        .unwrap();
        el.process_events(&mut ctx, FILE_EVENTS | DONT_WAIT);
        assert_eq!(ctx.log, vec!["read", "write"]);
        close(a);
        close(b);
    }

    #[test]
    fn test_handler_removes_own_fd() {
        let mut el: EventLoop<Ctx> = EventLoop::new(64).unwrap();
        let mut ctx = Ctx::default();
        let (r, w) = pipe();
        el.create_file_event(
            r,
            READABLE,
            Rc::new(move |ctx: &mut Ctx, el: &mut EventLoop<Ctx>, fd, _| {
                ctx.counter += 1;
                el.delete_file_event(fd, READABLE);
            }),
        )
        .unwrap();
        write_byte(w);
        el.process_events(&mut ctx, FILE_EVENTS | DONT_WAIT);
        // Still readable, but no longer registered.
        el.process_events(&mut ctx, FILE_EVENTS | DONT_WAIT);
        assert_eq!(ctx.counter, 1);
        assert_eq!(el.file_event_mask(r), NONE);
        close(r);
        close(w);
    }

    #[test]
    fn test_oneshot_timer() {
        let mut el: EventLoop<Ctx> = EventLoop::new(8).unwrap();
        let mut ctx = Ctx::default();
        let finalized = Rc::new(RefCell::new(false));
        let fin = finalized.clone();
        el.create_time_event(
            0,
            Rc::new(|ctx: &mut Ctx, _el: &mut EventLoop<Ctx>, _id| {
                ctx.counter += 1;
                TimerNext::Stop
            }),
            Some(Rc::new(move |_ctx: &mut Ctx, _el: &mut EventLoop<Ctx>| {
                *fin.borrow_mut() = true;
            })),
        );
        el.process_events(&mut ctx, TIME_EVENTS | DONT_WAIT);
        assert_eq!(ctx.counter, 1);
        // Second pass: sweep runs the finalizer, no re-fire.
        el.process_events(&mut ctx, TIME_EVENTS | DONT_WAIT);
        assert_eq!(ctx.counter, 1);
        assert!(*finalized.borrow());
    }

    #[test]
    fn test_periodic_timer_reschedules() {
        let mut el: EventLoop<Ctx> = EventLoop::new(8).unwrap();
        let mut ctx = Ctx::default();
        let id = el.create_time_event(
            0,
            Rc::new(|ctx: &mut Ctx, _el: &mut EventLoop<Ctx>, _id| {
                ctx.counter += 1;
                TimerNext::AfterMs(60_000)
            }),
            None,
        );
        el.process_events(&mut ctx, TIME_EVENTS | DONT_WAIT);
        assert_eq!(ctx.counter, 1);
        // Re-armed a minute out; must not fire again now.
        el.process_events(&mut ctx, TIME_EVENTS | DONT_WAIT);
        assert_eq!(ctx.counter, 1);
        assert!(el.timer_when(id).unwrap() > wall_ms() + 30_000);
        assert!(el.delete_time_event(id));
        assert!(!el.delete_time_event(id + 999));
    }

    #[test]
    fn test_clock_skew_fires_timers() {
        let mut el: EventLoop<Ctx> = EventLoop::new(8).unwrap();
        let mut ctx = Ctx::default();
        el.create_time_event(
            3_600_000,
            Rc::new(|ctx: &mut Ctx, _el: &mut EventLoop<Ctx>, _id| {
                ctx.counter += 1;
                TimerNext::Stop
            }),
            None,
        );
        // Not due for an hour.
        el.process_events(&mut ctx, TIME_EVENTS | DONT_WAIT);
        assert_eq!(ctx.counter, 0);
        // Pretend the last tick saw a much later clock: to the loop the
        // wall just jumped backward, so every timer is forced due.
        el.force_last_time(wall_ms() / 1000 + 7_200);
        el.process_events(&mut ctx, TIME_EVENTS | DONT_WAIT);
        assert_eq!(ctx.counter, 1);
    }

    #[test]
    fn test_timer_registered_during_fire_waits_one_pass() {
        let mut el: EventLoop<Ctx> = EventLoop::new(8).unwrap();
        let mut ctx = Ctx::default();
        el.create_time_event(
            0,
            Rc::new(|ctx: &mut Ctx, el: &mut EventLoop<Ctx>, _id| {
                ctx.counter += 1;
                el.create_time_event(
                    0,
                    Rc::new(|ctx: &mut Ctx, _: &mut EventLoop<Ctx>, _| {
                        ctx.counter += 100;
                        TimerNext::Stop
                    }),
                    None,
                );
                TimerNext::Stop
            }),
            None,
        );
        el.process_events(&mut ctx, TIME_EVENTS | DONT_WAIT);
        assert_eq!(ctx.counter, 1, "nested timer must wait for the next pass");
        el.process_events(&mut ctx, TIME_EVENTS | DONT_WAIT);
        assert_eq!(ctx.counter, 101);
    }
}
