//! Round-robin placement of channels onto worker loops.
//!
//! The raiser loop asks the balancer which worker should own a freshly accepted
//! channel ([`Direction::Inbound`]) or a freshly connected one
//! ([`Direction::Outbound`]). Each direction keeps its own cursor, so a burst of
//! accepts does not skew where outbound connections land.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{Error, Result};
use crate::reactor::LoopHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    fn index(self) -> usize {
        match self {
            Direction::Inbound => 0,
            Direction::Outbound => 1,
        }
    }
}

#[derive(Default)]
pub struct LoadBalancer {
    loops: Vec<LoopHandle>,
    cursors: [AtomicUsize; 2],
}

impl LoadBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&mut self, handle: LoopHandle) -> Result<()> {
        if self.loops.iter().any(|l| l.id() == handle.id()) {
            return Err(Error::LoopAttached(handle.id()));
        }
        self.loops.push(handle);
        Ok(())
    }

    pub fn detach(&mut self, loop_id: usize) -> Result<LoopHandle> {
        let index = self
            .loops
            .iter()
            .position(|l| l.id() == loop_id)
            .ok_or(Error::LoopNotFound)?;
        Ok(self.loops.remove(index))
    }

    /// Next loop for `direction`. Over `n` calls with `n` attached loops every
    /// loop is returned exactly once.
    pub fn select(&self, direction: Direction) -> Result<LoopHandle> {
        if self.loops.is_empty() {
            return Err(Error::LoopNotFound);
        }
        let turn = self.cursors[direction.index()].fetch_add(1, Ordering::Relaxed);
        Ok(self.loops[turn % self.loops.len()].clone())
    }

    pub fn len(&self) -> usize {
        self.loops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    pub fn loops(&self) -> &[LoopHandle] {
        &self.loops
    }
}

impl std::fmt::Debug for LoadBalancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadBalancer")
            .field("loops", &self.loops.iter().map(LoopHandle::id).collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoopConfig;
    use crate::reactor::Loop;
    use std::collections::HashSet;

    fn loops(n: usize) -> Vec<Loop> {
        (0..n)
            .map(|_| Loop::new(LoopConfig::default()).unwrap())
            .collect()
    }

    #[test]
    fn test_empty_balancer() {
        let balancer = LoadBalancer::new();
        assert!(matches!(
            balancer.select(Direction::Inbound),
            Err(Error::LoopNotFound)
        ));
    }

    #[test]
    fn test_round_robin_visits_each_loop_once() {
        let loops = loops(3);
        let mut balancer = LoadBalancer::new();
        for l in &loops {
            balancer.attach(l.handle()).unwrap();
        }

        for _ in 0..2 {
            let seen: HashSet<usize> = (0..3)
                .map(|_| balancer.select(Direction::Inbound).unwrap().id())
                .collect();
            assert_eq!(seen.len(), 3);
        }
    }

    #[test]
    fn test_directions_have_separate_cursors() {
        let loops = loops(2);
        let mut balancer = LoadBalancer::new();
        for l in &loops {
            balancer.attach(l.handle()).unwrap();
        }

        let first_in = balancer.select(Direction::Inbound).unwrap().id();
        let first_out = balancer.select(Direction::Outbound).unwrap().id();
        assert_eq!(first_in, first_out);
        assert_ne!(balancer.select(Direction::Inbound).unwrap().id(), first_in);
    }

    #[test]
    fn test_attach_twice_and_detach() {
        let loops = loops(1);
        let mut balancer = LoadBalancer::new();
        balancer.attach(loops[0].handle()).unwrap();
        assert!(matches!(
            balancer.attach(loops[0].handle()),
            Err(Error::LoopAttached(id)) if id == loops[0].id()
        ));

        balancer.detach(loops[0].id()).unwrap();
        assert!(balancer.is_empty());
        assert!(matches!(
            balancer.detach(loops[0].id()),
            Err(Error::LoopNotFound)
        ));
    }
}
