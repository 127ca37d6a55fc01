//! Multi-threaded orchestration: one raiser loop plus N worker loops.
//!
//! ```text
//!                       ┌──────────────┐
//!   acceptors ────────> │ raiser loop  │  accepts / connects
//!   connectors          └──────┬───────┘
//!                              │ LoadBalancer::select (round robin)
//!              ┌───────────────┼───────────────┐
//!              v               v               v
//!        ┌──────────┐    ┌──────────┐    ┌──────────┐
//!        │ worker 0 │    │ worker 1 │    │ worker N │   own their channels,
//!        └──────────┘    └──────────┘    └──────────┘   run the handlers
//! ```
//!
//! Each loop runs on its own named thread. Channels move from the raiser to a
//! worker through the worker's hand-off queue and are never touched by any other
//! thread afterwards.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::thread::{Builder, JoinHandle};

use crate::balancer::LoadBalancer;
use crate::config::{AcceptorConfig, ConnectorConfig, FrameworkConfig, LoopConfig};
use crate::error::{Error, Result};
use crate::logger::LogLevel;
use crate::reactor::{current_loop_id, Loop, LoopContext, LoopHandle};
use crate::timer::{TimerId, TimerKind};

struct Loops {
    raiser: LoopHandle,
    workers: Vec<LoopHandle>,
    balancer: Arc<LoadBalancer>,
}

#[derive(Default)]
struct Endpoints {
    acceptors: Vec<AcceptorConfig>,
    connectors: Vec<ConnectorConfig>,
}

pub struct Framework {
    loop_config: LoopConfig,
    worker_count: usize,
    endpoints: Mutex<Endpoints>,
    started: AtomicBool,
    loops: OnceLock<Loops>,
    threads: Mutex<Vec<JoinHandle<Result<()>>>>,
}

impl Framework {
    pub fn new(config: FrameworkConfig) -> Self {
        Self {
            worker_count: config.workers.max(1),
            loop_config: config.loop_config,
            endpoints: Mutex::new(Endpoints {
                acceptors: config.acceptors,
                connectors: config.connectors,
            }),
            started: AtomicBool::new(false),
            loops: OnceLock::new(),
            threads: Mutex::new(Vec::new()),
        }
    }

    /// Adds a listening endpoint. Before `start` it is opened during start (and a
    /// bind failure fails `start`); afterwards it is sent to the raiser loop.
    pub fn acceptor(&self, acceptor: AcceptorConfig) -> Result<()> {
        match self.loops.get() {
            Some(loops) => loops.raiser.listen(acceptor),
            None => {
                lock(&self.endpoints).acceptors.push(acceptor);
                Ok(())
            }
        }
    }

    pub fn connector(&self, connector: ConnectorConfig) -> Result<()> {
        match self.loops.get() {
            Some(loops) => loops.raiser.connect(connector),
            None => {
                lock(&self.endpoints).connectors.push(connector);
                Ok(())
            }
        }
    }

    /// Builds the raiser and worker loops, opens the configured endpoints and
    /// spawns one thread per loop. A failed start keeps the endpoints, so `start`
    /// can be retried.
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyStarted);
        }
        match self.spawn_loops() {
            Ok((loops, threads)) => {
                *lock(&self.endpoints) = Endpoints::default();
                *lock(&self.threads) = threads;
                // `started` guards this path, so the cell is still empty
                let _ = self.loops.set(loops);
                Ok(())
            }
            Err(e) => {
                self.started.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    fn spawn_loops(&self) -> Result<(Loops, Vec<JoinHandle<Result<()>>>)> {
        let mut workers = Vec::with_capacity(self.worker_count);
        let mut balancer = LoadBalancer::new();
        for _ in 0..self.worker_count {
            let worker = Loop::new(self.loop_config.clone())?;
            balancer.attach(worker.handle())?;
            workers.push(worker);
        }
        let balancer = Arc::new(balancer);
        let mut raiser = Loop::with_balancer(self.loop_config.clone(), Arc::clone(&balancer))?;

        let (acceptors, connectors) = {
            let endpoints = lock(&self.endpoints);
            (endpoints.acceptors.clone(), endpoints.connectors.clone())
        };
        for acceptor in acceptors {
            raiser.listen(acceptor)?;
        }
        for connector in connectors {
            raiser.connect(connector)?;
        }

        let loops = Loops {
            raiser: raiser.handle(),
            workers: workers.iter().map(Loop::handle).collect(),
            balancer,
        };

        let mut threads = Vec::with_capacity(self.worker_count + 1);
        let named = workers
            .into_iter()
            .enumerate()
            .map(|(i, worker)| (format!("millrace-worker-{i}"), worker))
            .chain(std::iter::once(("millrace-raiser".to_string(), raiser)));
        for (name, event_loop) in named {
            match spawn_loop(name, event_loop) {
                Ok(thread) => threads.push(thread),
                Err(e) => {
                    loops.raiser.stop();
                    loops.workers.iter().for_each(LoopHandle::stop);
                    for thread in threads {
                        let _ = thread.join();
                    }
                    return Err(e);
                }
            }
        }

        self.loop_config.logger.log(
            LogLevel::Info,
            &format!("framework started with {} workers", self.worker_count),
        );
        Ok((loops, threads))
    }

    /// Signals every loop to stop. Returns immediately; see [`wait_for_stop`](Self::wait_for_stop).
    pub fn stop(&self) -> Result<()> {
        let loops = self.loops.get().ok_or(Error::NotStarted)?;
        loops.raiser.stop();
        for worker in &loops.workers {
            worker.stop();
        }
        Ok(())
    }

    /// Joins every loop thread and returns the first loop error.
    pub fn wait_for_stop(&self) -> Result<()> {
        let threads = std::mem::take(&mut *lock(&self.threads));
        let mut first_error = None;
        for thread in threads {
            let result = thread.join().unwrap_or(Err(Error::LoopGone));
            if let Err(e) = result {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Starts and blocks until the loops stop.
    pub fn start_wait(&self) -> Result<()> {
        self.start()?;
        self.wait_for_stop()
    }

    /// Starts a timer on the worker loop the caller is running on.
    ///
    /// Only valid from a worker thread of this framework, typically from inside a
    /// handler; any other thread gets [`Error::NotWorkerThread`]. `max_fires` only
    /// matters for [`TimerKind::Counted`].
    pub fn create_worker_timer<F>(
        &self,
        kind: TimerKind,
        interval_ms: u64,
        max_fires: u32,
        f: F,
    ) -> Result<()>
    where
        F: FnMut(&mut LoopContext<'_>, TimerId) + Send + 'static,
    {
        let loops = self.loops.get().ok_or(Error::NotStarted)?;
        let current = current_loop_id().ok_or(Error::NotWorkerThread)?;
        let worker = loops
            .workers
            .iter()
            .find(|worker| worker.id() == current)
            .ok_or(Error::NotWorkerThread)?;
        worker.schedule(kind, interval_ms, max_fires, f)
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn balancer(&self) -> Option<Arc<LoadBalancer>> {
        self.loops.get().map(|loops| Arc::clone(&loops.balancer))
    }

    pub fn raiser(&self) -> Option<LoopHandle> {
        self.loops.get().map(|loops| loops.raiser.clone())
    }

    pub fn workers(&self) -> &[LoopHandle] {
        self.loops
            .get()
            .map(|loops| loops.workers.as_slice())
            .unwrap_or(&[])
    }
}

impl Drop for Framework {
    fn drop(&mut self) {
        if self.stop().is_ok() {
            let _ = self.wait_for_stop();
        }
    }
}

impl std::fmt::Debug for Framework {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Framework")
            .field("worker_count", &self.worker_count)
            .field("started", &self.is_started())
            .finish()
    }
}

fn spawn_loop(name: String, mut event_loop: Loop) -> Result<JoinHandle<Result<()>>> {
    Builder::new()
        .name(name)
        .spawn(move || event_loop.run())
        .map_err(Error::ThreadStart)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelRef;
    use crate::event::ChannelEvents;
    use crate::logger::NoOpLogger;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    fn config(workers: usize) -> FrameworkConfig {
        FrameworkConfig::builder()
            .workers(workers)
            .loop_config(LoopConfig::builder().logger(Arc::new(NoOpLogger)).build())
            .build()
    }

    fn wait_for(mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() {
            assert!(Instant::now() < deadline, "condition not reached");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_start_twice() {
        let framework = Framework::new(config(2));
        framework.start().unwrap();
        assert!(matches!(framework.start(), Err(Error::AlreadyStarted)));
        framework.stop().unwrap();
        framework.wait_for_stop().unwrap();
    }

    #[test]
    fn test_stop_before_start() {
        let framework = Framework::new(config(1));
        assert!(matches!(framework.stop(), Err(Error::NotStarted)));
    }

    #[test]
    fn test_loops_run_on_named_threads() {
        let framework = Framework::new(config(2));
        framework.start().unwrap();
        assert_eq!(framework.workers().len(), 2);
        assert_eq!(framework.balancer().unwrap().len(), 2);

        wait_for(|| framework.workers().iter().all(LoopHandle::is_running));
        assert!(framework.raiser().unwrap().is_running());

        framework.stop().unwrap();
        framework.wait_for_stop().unwrap();
        assert!(!framework.raiser().unwrap().is_running());
    }

    #[test]
    fn test_worker_timer_rejected_off_worker() {
        let framework = Framework::new(config(1));
        assert!(matches!(
            framework.create_worker_timer(TimerKind::Once, 10, 1, |_, _| {}),
            Err(Error::NotStarted)
        ));
        framework.start().unwrap();
        assert!(matches!(
            framework.create_worker_timer(TimerKind::Once, 10, 1, |_, _| {}),
            Err(Error::NotWorkerThread)
        ));
    }

    #[test]
    fn test_worker_timer_from_worker() {
        let framework = Arc::new(Framework::new(config(1)));
        framework.start().unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let (fw, f) = (Arc::downgrade(&framework), Arc::clone(&fired));
        framework.workers()[0]
            .schedule_once(5, move |_, _| {
                let fw = fw.upgrade().unwrap();
                let f = Arc::clone(&f);
                fw.create_worker_timer(TimerKind::Counted, 5, 2, move |_, _| {
                    f.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
            })
            .unwrap();

        wait_for(|| fired.load(Ordering::SeqCst) == 2);
        framework.stop().unwrap();
        framework.wait_for_stop().unwrap();
    }

    #[test]
    fn test_accepted_channels_spread_over_workers() {
        let accepted_on = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&accepted_on);
        let free = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = free.local_addr().unwrap();
        drop(free);

        let framework = Framework::new(config(2));
        framework
            .acceptor(AcceptorConfig::new(
                addr,
                move |ctx: &mut LoopContext<'_>, _: ChannelRef, events: ChannelEvents| -> Result<()> {
                    if events.contains(ChannelEvents::ACCEPT) {
                        seen.lock().unwrap().push(ctx.loop_id());
                    }
                    Ok(())
                },
            ))
            .unwrap();
        framework.start().unwrap();

        let clients: Vec<_> = (0..4)
            .map(|_| std::net::TcpStream::connect(addr).unwrap())
            .collect();
        wait_for(|| accepted_on.lock().unwrap().len() == 4);

        let ids = accepted_on.lock().unwrap().clone();
        for worker in framework.workers() {
            assert_eq!(ids.iter().filter(|&&id| id == worker.id()).count(), 2);
        }
        drop(clients);
    }

    #[test]
    fn test_failed_start_keeps_endpoints() {
        let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = blocker.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&accepted);

        let framework = Framework::new(config(1));
        framework
            .acceptor(AcceptorConfig::new(
                addr,
                move |_: &mut LoopContext<'_>, _: ChannelRef, events: ChannelEvents| -> Result<()> {
                    if events.contains(ChannelEvents::ACCEPT) {
                        seen.fetch_add(1, Ordering::SeqCst);
                    }
                    Ok(())
                },
            ))
            .unwrap();
        assert!(matches!(framework.start(), Err(Error::BindFailed(_))));
        assert!(framework.raiser().is_none());

        drop(blocker);
        framework.start().unwrap();
        let _client = std::net::TcpStream::connect(addr).unwrap();
        wait_for(|| accepted.load(Ordering::SeqCst) == 1);

        framework.stop().unwrap();
        framework.wait_for_stop().unwrap();
    }
}
