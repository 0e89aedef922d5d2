//! Execution contexts and wait-for graph deadlock detection.
//!
//! Every caller of the cache acts on behalf of an [`ExecContext`]. A context
//! that blocks records the edge it waits on ([`WaitForSubgraph`]); a search
//! started by the blocking context walks those edges with a
//! [`WaitForGraphVisitor`] looking for a path back to itself.
//!
//! # Graph
//!
//! ```text
//! node  = ExecContext
//! edge  = "waits for" (ctx -> owner of the resource it waits on)
//! cycle = deadlock; the node with the lowest weight is the victim
//! ```
//!
//! The cache contributes one edge kind: a context waiting for a flushed
//! descriptor to go away waits on every context that still uses a handle
//! of that descriptor. Other lock managers can add their own edges through
//! [`ExecContext::will_wait_for`].

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

/// Searches deeper than this are reported as deadlocks.
pub const MAX_SEARCH_DEPTH: usize = 32;

/// State of a context's wait slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// Not inside a wait.
    Idle,
    /// Blocked, nothing has answered yet.
    Waiting,
    /// The awaited condition happened.
    Granted,
    /// Chosen as deadlock victim.
    Victim,
    /// Deadline passed.
    Timeout,
}

/// An edge of the wait-for graph.
pub trait WaitForSubgraph: Send + Sync {
    /// Walk the part of the graph reachable through this edge.
    ///
    /// Returns true if a deadlock was found; the victim is in the visitor.
    fn accept_visitor(&self, visitor: &mut dyn WaitForGraphVisitor) -> bool;

    /// Weight of the waiting context; lighter contexts are preferred victims.
    fn deadlock_weight(&self) -> u32;
}

/// Visitor driven over the wait-for graph.
pub trait WaitForGraphVisitor {
    /// Enter a node. Returns true to abort the search (depth exceeded).
    fn enter_node(&mut self, node: &Arc<ExecContext>) -> bool;

    /// Leave a node entered with `enter_node`.
    fn leave_node(&mut self, node: &Arc<ExecContext>);

    /// Inspect an edge to `dest`. Returns true if it closes a cycle.
    fn inspect_edge(&mut self, dest: &Arc<ExecContext>) -> bool;
}

/// A connection/session acting on the cache.
pub struct ExecContext {
    id: u64,
    status: Mutex<WaitStatus>,
    wakeup: Condvar,
    waiting_for: Mutex<Option<Arc<dyn WaitForSubgraph>>>,
}

impl ExecContext {
    /// Create a context. The id also picks the context's accounting instance.
    pub fn new(id: u64) -> Arc<Self> {
        Arc::new(Self {
            id,
            status: Mutex::new(WaitStatus::Idle),
            wakeup: Condvar::new(),
            waiting_for: Mutex::new(None),
        })
    }

    /// Get the context id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current state of the wait slot.
    pub fn wait_status(&self) -> WaitStatus {
        *self.status.lock()
    }

    /// Arm the wait slot before publishing a wait edge.
    pub fn reset_wait_status(&self) {
        *self.status.lock() = WaitStatus::Waiting;
    }

    /// Answer a pending wait.
    ///
    /// Returns true if the slot was already answered (or not waiting), in
    /// which case nothing changes.
    pub fn set_wait_status(&self, status: WaitStatus) -> bool {
        let mut current = self.status.lock();
        if *current != WaitStatus::Waiting {
            return true;
        }
        *current = status;
        self.wakeup.notify_all();
        false
    }

    /// Block until the slot is answered or `deadline` passes.
    pub fn timed_wait(&self, deadline: Instant) -> WaitStatus {
        let mut status = self.status.lock();
        while *status == WaitStatus::Waiting {
            if self.wakeup.wait_until(&mut status, deadline).timed_out() {
                if *status == WaitStatus::Waiting {
                    *status = WaitStatus::Timeout;
                }
                break;
            }
        }
        *status
    }

    /// Publish the edge this context is about to wait on.
    pub fn will_wait_for(&self, edge: Arc<dyn WaitForSubgraph>) {
        *self.waiting_for.lock() = Some(edge);
    }

    /// Withdraw the published edge.
    pub fn done_waiting_for(&self) {
        self.waiting_for.lock().take();
    }

    /// Deadlock weight of the current wait, 0 when not waiting.
    pub fn deadlock_weight(&self) -> u32 {
        self.waiting_for
            .lock()
            .as_ref()
            .map(|edge| edge.deadlock_weight())
            .unwrap_or(0)
    }

    /// Follow this context's outgoing edge.
    ///
    /// A context whose wait was already answered contributes no edge: it is
    /// about to stop waiting.
    pub fn visit_subgraph(&self, visitor: &mut dyn WaitForGraphVisitor) -> bool {
        if self.wait_status() != WaitStatus::Waiting {
            return false;
        }
        let edge = self.waiting_for.lock().clone();
        match edge {
            Some(edge) => edge.accept_visitor(visitor),
            None => false,
        }
    }

    /// Search for cycles through this context and break them.
    ///
    /// Repeats until no cycle remains: removing a victim other than `self`
    /// may leave another loop created by the new edge. Returns true if this
    /// context itself was chosen as a victim.
    pub fn find_deadlock(self: &Arc<Self>) -> bool {
        loop {
            let mut detector = DeadlockDetector::new(Arc::clone(self));
            if !self.visit_subgraph(&mut detector) {
                return false;
            }

            let victim = match detector.into_victim() {
                Some(victim) => victim,
                None => return false,
            };

            tracing::debug!(ctx = self.id, victim = victim.id, "deadlock detected");
            victim.set_wait_status(WaitStatus::Victim);
            if Arc::ptr_eq(&victim, self) {
                return true;
            }
        }
    }
}

impl fmt::Debug for ExecContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecContext")
            .field("id", &self.id)
            .field("status", &self.wait_status())
            .finish()
    }
}

/// Visitor that searches for a cycle through its start node.
pub struct DeadlockDetector {
    start: Arc<ExecContext>,
    victim: Option<Arc<ExecContext>>,
    depth: usize,
    found: bool,
}

impl DeadlockDetector {
    /// Create a detector for a search started by `start`.
    pub fn new(start: Arc<ExecContext>) -> Self {
        Self {
            start,
            victim: None,
            depth: 0,
            found: false,
        }
    }

    /// Victim chosen by the last search.
    pub fn into_victim(self) -> Option<Arc<ExecContext>> {
        self.victim
    }

    fn change_victim_to(&mut self, candidate: &Arc<ExecContext>) {
        let replace = match &self.victim {
            None => true,
            Some(current) => current.deadlock_weight() >= candidate.deadlock_weight(),
        };
        if replace {
            self.victim = Some(Arc::clone(candidate));
        }
    }
}

impl WaitForGraphVisitor for DeadlockDetector {
    fn enter_node(&mut self, node: &Arc<ExecContext>) -> bool {
        self.depth += 1;
        self.found = self.depth >= MAX_SEARCH_DEPTH;
        if self.found {
            self.change_victim_to(node);
        }
        self.found
    }

    fn leave_node(&mut self, node: &Arc<ExecContext>) {
        self.depth -= 1;
        if self.found {
            self.change_victim_to(node);
        }
    }

    fn inspect_edge(&mut self, dest: &Arc<ExecContext>) -> bool {
        self.found = Arc::ptr_eq(dest, &self.start);
        self.found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    /// Edge "waiter waits for owner".
    struct WaitsOn {
        waiter: Arc<ExecContext>,
        owner: Arc<ExecContext>,
        weight: u32,
    }

    impl WaitForSubgraph for WaitsOn {
        fn accept_visitor(&self, visitor: &mut dyn WaitForGraphVisitor) -> bool {
            if visitor.enter_node(&self.waiter) {
                return true;
            }
            let found = visitor.inspect_edge(&self.owner) || self.owner.visit_subgraph(visitor);
            visitor.leave_node(&self.waiter);
            found
        }

        fn deadlock_weight(&self) -> u32 {
            self.weight
        }
    }

    fn wait_on(waiter: &Arc<ExecContext>, owner: &Arc<ExecContext>, weight: u32) {
        waiter.reset_wait_status();
        waiter.will_wait_for(Arc::new(WaitsOn {
            waiter: Arc::clone(waiter),
            owner: Arc::clone(owner),
            weight,
        }));
    }

    #[test]
    fn test_wait_slot_granted() {
        let ctx = ExecContext::new(1);
        ctx.reset_wait_status();

        let waker = Arc::clone(&ctx);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            waker.set_wait_status(WaitStatus::Granted);
        });

        let status = ctx.timed_wait(Instant::now() + Duration::from_secs(5));
        handle.join().unwrap();
        assert_eq!(status, WaitStatus::Granted);
    }

    #[test]
    fn test_wait_slot_timeout() {
        let ctx = ExecContext::new(1);
        ctx.reset_wait_status();
        let status = ctx.timed_wait(Instant::now() + Duration::from_millis(10));
        assert_eq!(status, WaitStatus::Timeout);

        // A late answer does not overwrite the timeout.
        assert!(ctx.set_wait_status(WaitStatus::Granted));
        assert_eq!(ctx.wait_status(), WaitStatus::Timeout);
    }

    #[test]
    fn test_no_cycle() {
        let a = ExecContext::new(1);
        let b = ExecContext::new(2);
        wait_on(&a, &b, 1);

        assert!(!a.find_deadlock());
        assert_eq!(a.wait_status(), WaitStatus::Waiting);
    }

    #[test]
    fn test_two_node_cycle_picks_lighter_victim() {
        let a = ExecContext::new(1);
        let b = ExecContext::new(2);
        wait_on(&b, &a, 1);
        wait_on(&a, &b, 10);

        // a closes the cycle; b is lighter and gets killed.
        assert!(!a.find_deadlock());
        assert_eq!(b.wait_status(), WaitStatus::Victim);
        assert_eq!(a.wait_status(), WaitStatus::Waiting);
    }

    #[test]
    fn test_initiator_can_be_victim() {
        let a = ExecContext::new(1);
        let b = ExecContext::new(2);
        wait_on(&b, &a, 10);
        wait_on(&a, &b, 1);

        assert!(a.find_deadlock());
        assert_eq!(a.wait_status(), WaitStatus::Victim);
        assert_eq!(b.wait_status(), WaitStatus::Waiting);
    }

    #[test]
    fn test_depth_limit_counts_as_deadlock() {
        let chain: Vec<_> = (0..(MAX_SEARCH_DEPTH as u64 + 4))
            .map(ExecContext::new)
            .collect();
        for pair in chain.windows(2) {
            wait_on(&pair[0], &pair[1], 1);
        }

        // Equal weights: the victim ends up being the initiator.
        assert!(chain[0].find_deadlock());
        assert_eq!(chain[0].wait_status(), WaitStatus::Victim);
    }
}
