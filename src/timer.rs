//! Slotted timer wheel.
//!
//! `S` slots, each swept once per tick `T`. A timer lives in exactly one slot;
//! the slot is only a coarse bucket and the timer's own due timestamp decides
//! whether a sweep fires it or pushes it further ahead. A timer whose due time is
//! within `deviation` of the sweep time counts as due.
//!
//! ```text
//!              current
//!                 v
//!   [ 0 ][ 1 ][ 2 ][ 3 ] ... [S-1]
//!                 |
//!        run_once: sweep slot 2, fire due timers, re-slot the rest, advance
//! ```
//!
//! Timers are slab records addressed by a generation-tagged [`TimerId`], so a stale
//! id never reaches a timer that reused the same slot in the arena.
//!
//! The wheel is generic over the payload each timer carries. The standalone wheel
//! uses [`TimerFn`]; a loop uses its own callback type so callbacks see the loop.

use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use slab::Slab;

use crate::error::{Error, Result};

/// Millisecond time source for a wheel.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// Milliseconds since the clock was created, from `Instant`.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    start: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

/// Clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set(&self, ms: u64) {
        self.now.store(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId {
    key: usize,
    generation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Fires once, then is destroyed.
    Once,
    /// Fires every interval until stopped.
    Periodic,
    /// Fires a fixed number of times, then is destroyed.
    Counted,
}

struct Timer<T> {
    generation: u64,
    kind: TimerKind,
    interval: u64,
    due: u64,
    remaining: u32,
    scheduled: bool,
    stopped: bool,
    payload: Option<T>,
}

pub struct TimerWheel<T> {
    timers: Slab<Timer<T>>,
    slots: Vec<Vec<TimerId>>,
    current: usize,
    tick: u64,
    deviation: u64,
    last_tick: u64,
    next_generation: u64,
    clock: Arc<dyn Clock>,
    exit: Arc<AtomicBool>,
}

impl<T> TimerWheel<T> {
    pub fn new(tick_ms: u64, slots: usize) -> Result<Self> {
        Self::with_clock(tick_ms, slots, Arc::new(MonotonicClock::new()))
    }

    pub fn with_clock(tick_ms: u64, slots: usize, clock: Arc<dyn Clock>) -> Result<Self> {
        if tick_ms == 0 {
            return Err(Error::InvalidParameters("timer tick must be non-zero"));
        }
        if slots == 0 {
            return Err(Error::InvalidParameters("timer wheel needs at least one slot"));
        }
        let last_tick = clock.now_ms();
        Ok(Self {
            timers: Slab::new(),
            slots: vec![Vec::new(); slots],
            current: 0,
            tick: tick_ms,
            deviation: tick_ms / 100,
            last_tick,
            next_generation: 0,
            clock,
            exit: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Allocates an unscheduled timer.
    pub fn create_timer(&mut self) -> TimerId {
        let generation = self.next_generation;
        self.next_generation += 1;
        let key = self.timers.insert(Timer {
            generation,
            kind: TimerKind::Once,
            interval: 0,
            due: 0,
            remaining: 0,
            scheduled: false,
            stopped: false,
            payload: None,
        });
        TimerId { key, generation }
    }

    pub fn start_once(&mut self, id: TimerId, delay_ms: u64, payload: T) -> Result<()> {
        self.start(id, TimerKind::Once, delay_ms, 1, payload)
    }

    pub fn start_periodic(&mut self, id: TimerId, interval_ms: u64, payload: T) -> Result<()> {
        self.start(id, TimerKind::Periodic, interval_ms, 0, payload)
    }

    pub fn start_counted(
        &mut self,
        id: TimerId,
        interval_ms: u64,
        max_fires: u32,
        payload: T,
    ) -> Result<()> {
        if max_fires == 0 {
            return Err(Error::InvalidParameters("counted timer needs at least one fire"));
        }
        self.start(id, TimerKind::Counted, interval_ms, max_fires, payload)
    }

    fn start(
        &mut self,
        id: TimerId,
        kind: TimerKind,
        delay_ms: u64,
        fires: u32,
        payload: T,
    ) -> Result<()> {
        if delay_ms == 0 {
            return Err(Error::InvalidParameters("timer delay must be non-zero"));
        }
        let now = self.clock.now_ms();
        let timer = self.get_mut(id).ok_or(Error::InvalidTimer)?;
        if timer.scheduled {
            return Err(Error::TimerAlreadyStarted);
        }
        timer.kind = kind;
        timer.interval = delay_ms;
        timer.due = now + delay_ms;
        timer.remaining = fires;
        timer.scheduled = true;
        timer.payload = Some(payload);

        let ahead = delay_ms / self.tick;
        self.place(id, ahead);
        Ok(())
    }

    /// Stops a timer.
    ///
    /// A timer that was never started is destroyed right away. A scheduled timer
    /// is only flagged and gets destroyed by the next sweep of its slot, which
    /// makes stopping from inside its own callback safe.
    pub fn stop(&mut self, id: TimerId) -> Result<()> {
        let timer = self.get_mut(id).ok_or(Error::InvalidTimer)?;
        if timer.scheduled {
            timer.stopped = true;
        } else {
            self.timers.remove(id.key);
        }
        Ok(())
    }

    pub fn is_scheduled(&self, id: TimerId) -> bool {
        self.get(id).is_some_and(|t| t.scheduled && !t.stopped)
    }

    /// Live timers, including unscheduled ones and stopped ones awaiting their sweep.
    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    /// Current reading of the wheel's clock.
    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick)
    }

    pub fn deviation(&self) -> u64 {
        self.deviation
    }

    pub fn set_deviation(&mut self, deviation_ms: u64) {
        self.deviation = deviation_ms;
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn exit(&self) {
        self.exit.store(true, Ordering::SeqCst);
    }

    pub fn exit_handle(&self) -> ExitHandle {
        ExitHandle(Arc::clone(&self.exit))
    }

    /// Sweeps the current slot if a tick has elapsed, invoking `fire` for each due
    /// timer. Returns the number of timers fired.
    ///
    /// The payload is moved out of the arena for the duration of `fire`, so the
    /// callback may freely create, start and stop timers, its own included.
    pub fn run_once_with<F>(&mut self, mut fire: F) -> usize
    where
        F: FnMut(&mut Self, TimerId, &mut T),
    {
        let now = self.clock.now_ms();
        let elapsed = now.saturating_sub(self.last_tick);
        if elapsed + self.deviation < self.tick {
            return 0;
        }

        let swept = self.current;
        self.current = (self.current + 1) % self.slots.len();
        self.last_tick = now;
        let due_ids = mem::take(&mut self.slots[swept]);

        let mut fired = 0;
        for id in due_ids {
            let (tick, deviation) = (self.tick, self.deviation);
            let Some(timer) = self.get_mut(id) else {
                continue;
            };
            if timer.stopped {
                self.timers.remove(id.key);
                continue;
            }
            if timer.due > now + deviation {
                let ahead = (timer.due - now - deviation).div_ceil(tick).max(1);
                self.place(id, ahead - 1);
                continue;
            }

            let mut payload = timer.payload.take();
            if let Some(payload) = payload.as_mut() {
                fire(self, id, payload);
                fired += 1;
            }

            let Some(timer) = self.get_mut(id) else {
                continue;
            };
            timer.payload = payload;
            let finished = match timer.kind {
                TimerKind::Once => true,
                TimerKind::Periodic => false,
                TimerKind::Counted => {
                    timer.remaining = timer.remaining.saturating_sub(1);
                    timer.remaining == 0
                }
            };
            if timer.stopped || finished {
                self.timers.remove(id.key);
                continue;
            }
            timer.due = now + timer.interval;
            let ahead = timer.interval.saturating_sub(deviation).div_ceil(tick).max(1);
            self.place(id, ahead - 1);
        }
        fired
    }

    // `ahead` counts from the slot the next sweep visits.
    fn place(&mut self, id: TimerId, ahead: u64) {
        let len = self.slots.len();
        let index = (self.current + (ahead % len as u64) as usize) % len;
        self.slots[index].push(id);
    }

    fn get(&self, id: TimerId) -> Option<&Timer<T>> {
        self.timers
            .get(id.key)
            .filter(|timer| timer.generation == id.generation)
    }

    fn get_mut(&mut self, id: TimerId) -> Option<&mut Timer<T>> {
        self.timers
            .get_mut(id.key)
            .filter(|timer| timer.generation == id.generation)
    }
}

impl<T> fmt::Debug for TimerWheel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerWheel")
            .field("timers", &self.timers.len())
            .field("slots", &self.slots.len())
            .field("current", &self.current)
            .field("tick", &self.tick)
            .field("deviation", &self.deviation)
            .finish()
    }
}

/// Stops a running [`TimerWheel::run`] from another thread.
#[derive(Debug, Clone)]
pub struct ExitHandle(Arc<AtomicBool>);

impl ExitHandle {
    pub fn exit(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Callback of a standalone wheel.
pub struct TimerFn(Box<dyn FnMut(&mut TimerWheel<TimerFn>, TimerId) + Send>);

impl TimerFn {
    pub fn new<F>(f: F) -> Self
    where
        F: FnMut(&mut TimerWheel<TimerFn>, TimerId) + Send + 'static,
    {
        TimerFn(Box::new(f))
    }
}

impl TimerWheel<TimerFn> {
    pub fn run_once(&mut self) -> usize {
        self.run_once_with(|wheel, id, callback| (callback.0)(wheel, id))
    }

    /// Sleeps one tick and sweeps, until [`exit`](Self::exit) is called.
    pub fn run(&mut self) {
        let tick = self.tick_interval();
        while !self.exit.load(Ordering::SeqCst) {
            thread::sleep(tick);
            self.run_once();
        }
        self.exit.store(false, Ordering::SeqCst);
    }

    pub fn schedule_once<F>(&mut self, delay_ms: u64, f: F) -> Result<TimerId>
    where
        F: FnMut(&mut TimerWheel<TimerFn>, TimerId) + Send + 'static,
    {
        let id = self.create_timer();
        if let Err(e) = self.start_once(id, delay_ms, TimerFn::new(f)) {
            let _ = self.stop(id);
            return Err(e);
        }
        Ok(id)
    }

    pub fn schedule_periodic<F>(&mut self, interval_ms: u64, f: F) -> Result<TimerId>
    where
        F: FnMut(&mut TimerWheel<TimerFn>, TimerId) + Send + 'static,
    {
        let id = self.create_timer();
        if let Err(e) = self.start_periodic(id, interval_ms, TimerFn::new(f)) {
            let _ = self.stop(id);
            return Err(e);
        }
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    fn manual_wheel(tick: u64, slots: usize) -> (TimerWheel<TimerFn>, ManualClock) {
        let clock = ManualClock::new();
        let wheel = TimerWheel::with_clock(tick, slots, Arc::new(clock.clone())).unwrap();
        (wheel, clock)
    }

    fn counter() -> (Arc<AtomicUsize>, impl FnMut(&mut TimerWheel<TimerFn>, TimerId) + Send) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        (count, move |_: &mut TimerWheel<TimerFn>, _: TimerId| {
            c.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_invalid_parameters() {
        assert!(matches!(
            TimerWheel::<TimerFn>::new(0, 8),
            Err(Error::InvalidParameters(_))
        ));
        assert!(matches!(
            TimerWheel::<TimerFn>::new(10, 0),
            Err(Error::InvalidParameters(_))
        ));

        let (mut wheel, _) = manual_wheel(10, 8);
        let id = wheel.create_timer();
        let (_, cb) = counter();
        assert!(matches!(
            wheel.start_once(id, 0, TimerFn::new(cb)),
            Err(Error::InvalidParameters(_))
        ));
        let (_, cb) = counter();
        assert!(matches!(
            wheel.start_counted(id, 10, 0, TimerFn::new(cb)),
            Err(Error::InvalidParameters(_))
        ));
    }

    #[test]
    fn test_counted_timer_fires_exactly_max_times() {
        let (mut wheel, clock) = manual_wheel(10, 16);
        let (count, cb) = counter();
        let id = wheel.create_timer();
        wheel.start_counted(id, 10, 3, TimerFn::new(cb)).unwrap();

        for _ in 0..10 {
            clock.advance(10);
            wheel.run_once();
        }
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert!(wheel.is_empty());
        assert!(matches!(wheel.stop(id), Err(Error::InvalidTimer)));
    }

    #[test]
    fn test_run_once_waits_for_tick() {
        let (mut wheel, clock) = manual_wheel(10, 4);
        let (count, cb) = counter();
        wheel.schedule_once(5, cb).unwrap();

        clock.advance(5);
        assert_eq!(wheel.run_once(), 0);
        clock.advance(5);
        assert_eq!(wheel.run_once(), 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_firing_window() {
        for delay in [10u64, 25, 40, 95, 170] {
            let (mut wheel, clock) = manual_wheel(10, 8);
            let fired_at = Arc::new(Mutex::new(None));
            let (f, c) = (Arc::clone(&fired_at), clock.clone());
            wheel
                .schedule_once(delay, move |_, _| {
                    *f.lock().unwrap() = Some(c.now_ms());
                })
                .unwrap();

            while fired_at.lock().unwrap().is_none() {
                clock.advance(1);
                wheel.run_once();
                assert!(clock.now_ms() < delay + 100, "timer never fired");
            }
            let at = fired_at.lock().unwrap().unwrap();
            let dev = wheel.deviation();
            assert!(at + dev >= delay, "delay {delay} fired early at {at}");
            assert!(at <= delay + 10 + dev, "delay {delay} fired late at {at}");
        }
    }

    #[test]
    fn test_periodic_fire_count() {
        let (mut wheel, clock) = manual_wheel(10, 8);
        let (count, cb) = counter();
        wheel.schedule_periodic(20, cb).unwrap();

        for _ in 0..20 {
            clock.advance(10);
            wheel.run_once();
        }
        let fired = count.load(Ordering::SeqCst);
        assert!((9..=11).contains(&fired), "fired {fired} times in 200ms");
    }

    #[test]
    fn test_stop_unscheduled_destroys_immediately() {
        let (mut wheel, _) = manual_wheel(10, 4);
        let id = wheel.create_timer();
        assert_eq!(wheel.len(), 1);
        wheel.stop(id).unwrap();
        assert!(wheel.is_empty());
        assert!(matches!(wheel.stop(id), Err(Error::InvalidTimer)));
    }

    #[test]
    fn test_stop_scheduled_is_deferred() {
        let (mut wheel, clock) = manual_wheel(10, 4);
        let (count, cb) = counter();
        let id = wheel.schedule_once(10, cb).unwrap();
        wheel.stop(id).unwrap();
        assert_eq!(wheel.len(), 1);
        assert!(!wheel.is_scheduled(id));

        for _ in 0..4 {
            clock.advance(10);
            wheel.run_once();
        }
        assert!(wheel.is_empty());
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_stop_from_own_callback() {
        let (mut wheel, clock) = manual_wheel(10, 4);
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        wheel
            .schedule_periodic(10, move |wheel, id| {
                c.fetch_add(1, Ordering::SeqCst);
                wheel.stop(id).unwrap();
            })
            .unwrap();

        for _ in 0..6 {
            clock.advance(10);
            wheel.run_once();
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(wheel.is_empty());
    }

    #[test]
    fn test_double_start_rejected() {
        let (mut wheel, _) = manual_wheel(10, 4);
        let (_, cb) = counter();
        let id = wheel.schedule_once(30, cb).unwrap();
        let (_, cb) = counter();
        assert!(matches!(
            wheel.start_once(id, 10, TimerFn::new(cb)),
            Err(Error::TimerAlreadyStarted)
        ));
    }

    #[test]
    fn test_stale_id_does_not_reach_new_timer() {
        let (mut wheel, _) = manual_wheel(10, 4);
        let old = wheel.create_timer();
        wheel.stop(old).unwrap();
        let new = wheel.create_timer();
        assert!(matches!(wheel.stop(old), Err(Error::InvalidTimer)));
        assert_eq!(wheel.len(), 1);
        wheel.stop(new).unwrap();
    }

    #[test]
    fn test_timer_longer_than_one_rotation() {
        let (mut wheel, clock) = manual_wheel(10, 4);
        let (count, cb) = counter();
        wheel.schedule_once(95, cb).unwrap();

        for _ in 0..9 {
            clock.advance(10);
            wheel.run_once();
        }
        assert_eq!(count.load(Ordering::SeqCst), 0);
        clock.advance(10);
        wheel.run_once();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_run_until_exit() {
        let mut wheel = TimerWheel::<TimerFn>::new(2, 8).unwrap();
        let (count, mut cb) = counter();
        wheel
            .schedule_periodic(2, move |wheel, id| {
                cb(wheel, id);
                wheel.exit();
            })
            .unwrap();
        wheel.run();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_exit_handle_from_other_thread() {
        let mut wheel = TimerWheel::<TimerFn>::new(2, 8).unwrap();
        let handle = wheel.exit_handle();
        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            handle.exit();
        });
        wheel.run();
        stopper.join().unwrap();
    }
}
