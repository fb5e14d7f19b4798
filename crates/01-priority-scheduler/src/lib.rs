// ============================================================
//  Priority scheduler with ageing and priority inheritance.
//
//  One virtual CPU, decisions only at slot boundaries. The
//  scheduler scans its run queue for the first runnable process
//  with the highest effective priority, moves it to the tail
//  (round robin among equals) and hands it the next slot.
//
//  Two forces act on a process's effective priority:
//    - Ageing: every 8th slot a process runs, its effective
//      priority drops by one (floor 0), so a long-running
//      high-priority process cannot starve the rest.
//    - Priority inheritance: when a process blocks on a held
//      resource, the holder is boosted to the waiter's declared
//      priority, so a low-priority holder cannot be preempted
//      into starving a high-priority waiter. This is the fix
//      for the 1997 Mars Pathfinder system resets.
//
//  Resources are a fixed namespace of 32 ids. A process that
//  fails to take a lock records it in a per-process bitset and
//  becomes unschedulable until every requested resource is free;
//  when it is next scheduled it takes the whole set at once.
//
//  The caller drives everything: start/exit/renice/locked/
//  unlocked describe the workload, schedule() picks one pid per
//  slot. Malformed calls (double start, unlock by a non-holder)
//  are contract violations and panic - the scheduler prefers to
//  crash loudly rather than corrupt its tables.
// ============================================================

use std::collections::{HashMap, VecDeque};

/// Highest priority a caller may assign. Valid priorities are 0..=2.
pub const MAX_PRIORITY: u8 = 2;

/// Size of the resource namespace; ids are 0..32.
pub const MAX_RESOURCES: usize = 32;

/// A process's effective priority decays by one every this many slots run.
const AGE_PERIOD: u64 = 8;

/// Caller-supplied process identifier. Opaque to the scheduler; unique while live.
pub type Pid = u32;

// ── Resource bitset ──────────────────────────────────────────

/// Set of resource ids, one bit per resource.
///
/// Membership tests and updates are single mask operations; the whole set
/// fits in one word because the resource namespace is fixed at 32.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceSet(u32);

impl ResourceSet {
    pub const EMPTY: ResourceSet = ResourceSet(0);

    pub fn insert(&mut self, res: usize) {
        debug_assert!(res < MAX_RESOURCES);
        self.0 |= 1 << res;
    }

    pub fn remove(&mut self, res: usize) {
        debug_assert!(res < MAX_RESOURCES);
        self.0 &= !(1 << res);
    }

    pub fn contains(&self, res: usize) -> bool {
        self.0 & (1 << res) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    /// Iterate over the ids in the set, ascending.
    pub fn iter(self) -> impl Iterator<Item = usize> {
        (0..MAX_RESOURCES).filter(move |&res| self.contains(res))
    }
}

// ── Process pool ─────────────────────────────────────────────

/// Stable reference to a pooled process descriptor.
///
/// The generation counter detects reuse of a vacated slot: a handle kept
/// across an exit never aliases the next process in the same slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Handle {
    index: u32,
    generation: u32,
}

struct Slot {
    generation: u32,
    proc: Option<Process>,
}

/// Densely packed descriptor pool with a free list.
///
/// Descriptors never move, so a Handle stays valid for the process's whole
/// life regardless of how many others start and exit around it.
#[derive(Default)]
struct Pool {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl Pool {
    fn insert(&mut self, proc: Process) -> Handle {
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                debug_assert!(slot.proc.is_none());
                slot.proc = Some(proc);
                Handle { index, generation: slot.generation }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot { generation: 0, proc: Some(proc) });
                Handle { index, generation: 0 }
            }
        }
    }

    fn remove(&mut self, handle: Handle) -> Process {
        let slot = &mut self.slots[handle.index as usize];
        assert_eq!(slot.generation, handle.generation, "stale process handle");
        let proc = slot.proc.take().expect("process slot already vacated");
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        proc
    }

    fn get(&self, handle: Handle) -> &Process {
        let slot = &self.slots[handle.index as usize];
        assert_eq!(slot.generation, handle.generation, "stale process handle");
        slot.proc.as_ref().expect("process slot vacated")
    }

    fn get_mut(&mut self, handle: Handle) -> &mut Process {
        let slot = &mut self.slots[handle.index as usize];
        assert_eq!(slot.generation, handle.generation, "stale process handle");
        slot.proc.as_mut().expect("process slot vacated")
    }
}

// ── Process descriptor ───────────────────────────────────────

/// Bookkeeping for one live process. Created on `start`, destroyed on `exit`.
#[derive(Debug, Clone)]
pub struct Process {
    pid: Pid,
    /// Priority last assigned by `start` or `renice`.
    declared_priority: u8,
    /// Priority the selection policy sees; moved by ageing and inheritance.
    effective_priority: u8,
    /// Slots this process has been chosen to run.
    slots_run: u64,
    /// Resources the process is waiting to acquire. Never contains a
    /// resource the process already holds.
    requested_locks: ResourceSet,
}

impl Process {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn declared_priority(&self) -> u8 {
        self.declared_priority
    }

    pub fn effective_priority(&self) -> u8 {
        self.effective_priority
    }

    pub fn slots_run(&self) -> u64 {
        self.slots_run
    }

    pub fn requested_locks(&self) -> ResourceSet {
        self.requested_locks
    }
}

// ── Scheduler ────────────────────────────────────────────────

/// The scheduler: run queue, descriptor pool, lock table.
///
/// Single-threaded by construction; every operation runs to completion.
/// There are no per-resource waiter queues - waiters are rediscovered by
/// scanning `requested_locks` on every `schedule()`, which keeps lock and
/// unlock O(1) and allocation-free.
pub struct Scheduler {
    pool: Pool,
    by_pid: HashMap<Pid, Handle>,
    /// Scan order for selection. New processes enter at the front; the
    /// chosen process rotates to the back.
    run_queue: VecDeque<Handle>,
    /// Holder of each resource; None means free.
    locktable: [Option<Pid>; MAX_RESOURCES],
    current: Option<Pid>,
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler {
            pool: Pool::default(),
            by_pid: HashMap::new(),
            run_queue: VecDeque::new(),
            locktable: [None; MAX_RESOURCES],
            current: None,
        }
    }

    /// Pid chosen by the last `schedule()`, or None if the CPU idled.
    pub fn current(&self) -> Option<Pid> {
        self.current
    }

    pub fn is_live(&self, pid: Pid) -> bool {
        self.by_pid.contains_key(&pid)
    }

    pub fn live_count(&self) -> usize {
        self.by_pid.len()
    }

    /// Descriptor of a live process, for inspection.
    pub fn process(&self, pid: Pid) -> Option<&Process> {
        self.by_pid.get(&pid).map(|&handle| self.pool.get(handle))
    }

    /// Pid currently holding `res`, or None if the resource is free.
    pub fn holder(&self, res: usize) -> Option<Pid> {
        assert!(res < MAX_RESOURCES, "resource {res} out of range");
        self.locktable[res]
    }

    /// Admit a new process at the front of the run queue.
    ///
    /// Panics if `pid` is already live or `priority` exceeds MAX_PRIORITY.
    pub fn start(&mut self, pid: Pid, priority: u8) {
        assert!(
            priority <= MAX_PRIORITY,
            "priority {priority} exceeds maximum {MAX_PRIORITY}"
        );
        assert!(!self.by_pid.contains_key(&pid), "process {pid} already live");

        let handle = self.pool.insert(Process {
            pid,
            declared_priority: priority,
            effective_priority: priority,
            slots_run: 0,
            requested_locks: ResourceSet::EMPTY,
        });
        self.by_pid.insert(pid, handle);
        self.run_queue.push_front(handle);
    }

    /// Remove a finished process, releasing every lock it still holds.
    ///
    /// Panics if `pid` is not live.
    pub fn exit(&mut self, pid: Pid) {
        let handle = match self.by_pid.remove(&pid) {
            Some(handle) => handle,
            None => panic!("exit of unknown process {pid}"),
        };

        for entry in self.locktable.iter_mut() {
            if *entry == Some(pid) {
                *entry = None;
            }
        }

        let pos = self
            .run_queue
            .iter()
            .position(|&queued| queued == handle)
            .expect("live process missing from run queue");
        self.run_queue.remove(pos);
        self.pool.remove(handle);

        // whoever was running, the slot owner must be re-chosen
        self.current = None;
    }

    /// Reassign a live process's priority. Overwrites both the declared and
    /// the effective priority, so an active inheritance boost is lost.
    pub fn renice(&mut self, pid: Pid, priority: u8) {
        assert!(
            priority <= MAX_PRIORITY,
            "priority {priority} exceeds maximum {MAX_PRIORITY}"
        );
        let handle = self.handle(pid);
        let proc = self.pool.get_mut(handle);
        proc.declared_priority = priority;
        proc.effective_priority = priority;
    }

    /// Process `pid` asks for resource `res`.
    ///
    /// Returns true if the resource was free and is now held by `pid`.
    /// Otherwise records the request, boosts the holder's effective priority
    /// to at least the requester's declared priority, and returns false; the
    /// requester stays unschedulable until all its requests are free.
    pub fn locked(&mut self, pid: Pid, res: usize) -> bool {
        assert!(res < MAX_RESOURCES, "resource {res} out of range");
        let handle = self.handle(pid);

        match self.locktable[res] {
            None => {
                self.pool.get_mut(handle).requested_locks.remove(res);
                self.locktable[res] = Some(pid);
                true
            }
            Some(holder_pid) => {
                // Inheritance works on declared priorities: an aged holder
                // is boosted back up, but a boost never stacks on a boost.
                let requester_declared = self.pool.get(handle).declared_priority;
                let holder_handle = self.handle(holder_pid);
                let holder = self.pool.get_mut(holder_handle);
                let boost = holder.declared_priority.max(requester_declared);
                holder.effective_priority = holder.effective_priority.max(boost);

                self.pool.get_mut(handle).requested_locks.insert(res);
                false
            }
        }
    }

    /// Process `pid` releases resource `res`.
    ///
    /// Panics unless `pid` currently holds `res`. The holder's effective
    /// priority is not restored; ageing is the only downward force.
    pub fn unlocked(&mut self, pid: Pid, res: usize) {
        assert!(res < MAX_RESOURCES, "resource {res} out of range");
        let _ = self.handle(pid);
        assert!(
            self.locktable[res] == Some(pid),
            "process {pid} does not hold resource {res}"
        );
        self.locktable[res] = None;
    }

    /// Pick the process for the next slot, or None if nothing is runnable.
    ///
    /// Linear scan in queue order; a later candidate replaces the best only
    /// with a strictly greater effective priority, so equal-priority
    /// processes round-robin (the winner rotates to the tail). The winner
    /// atomically acquires everything in its requested set, gets its slot
    /// counted, and ages if this was a multiple of the age period.
    pub fn schedule(&mut self) -> Option<Pid> {
        self.current = None;

        let mut best: Option<(usize, Handle)> = None;
        for (pos, &handle) in self.run_queue.iter().enumerate() {
            if !self.is_runnable(self.pool.get(handle)) {
                continue;
            }
            let replace = match best {
                None => true,
                Some((_, best_handle)) => {
                    self.pool.get(handle).effective_priority
                        > self.pool.get(best_handle).effective_priority
                }
            };
            if replace {
                best = Some((pos, handle));
            }
        }

        let (pos, handle) = best?;
        self.acquire_requested(handle);
        self.run_queue.remove(pos);
        self.run_queue.push_back(handle);

        let proc = self.pool.get_mut(handle);
        proc.slots_run += 1;
        if proc.slots_run % AGE_PERIOD == 0 {
            proc.effective_priority = proc.effective_priority.saturating_sub(1);
        }

        self.current = Some(proc.pid);
        self.current
    }

    fn handle(&self, pid: Pid) -> Handle {
        match self.by_pid.get(&pid) {
            Some(&handle) => handle,
            None => panic!("no live process with pid {pid}"),
        }
    }

    /// A process is runnable iff every resource it waits for is free.
    fn is_runnable(&self, proc: &Process) -> bool {
        proc.requested_locks
            .iter()
            .all(|res| self.locktable[res].is_none())
    }

    /// Grant the whole requested set at once. Only called for the process
    /// just selected, whose set was verified free by `is_runnable`.
    fn acquire_requested(&mut self, handle: Handle) {
        let proc = self.pool.get(handle);
        let pid = proc.pid;
        let requested = proc.requested_locks;
        for res in requested.iter() {
            debug_assert!(self.locktable[res].is_none());
            self.locktable[res] = Some(pid);
        }
        self.pool.get_mut(handle).requested_locks = ResourceSet::EMPTY;
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================
//  TESTS
// ============================================================
