// ============================================================
//  Replay harness for the priority scheduler.
//
//  The harness owns wall-clock time. Each tick it:
//    1. admits processes whose start time has arrived,
//    2. delivers pending events to every admitted process -
//       against the process's own run time, not the wall clock,
//       so a blocked process's timeline freezes with it,
//    3. asks the scheduler for the next process and credits the
//       slot (or the idle counter).
//
//  The event log is a plain text file, one event per line:
//
//    0  start  1  20  2     # admit pid 1, lifetime 20, prio 2
//    4  lock   1   6  0     # at process time 4, hold res 0 for 6
//    9  renice 1   0  1     # at process time 9, set prio to 1
//
//  `start` carries an implicit exit after `duration` slots of
//  process time; `lock` expands into a lock and a matching
//  unlock `duration` later. The replay is fully deterministic:
//  the same log produces the same per-tick trace, which is also
//  exactly what the tests assert against.
// ============================================================

use std::collections::HashMap;
use std::fmt;

use priority_scheduler::{Pid, Scheduler, MAX_PRIORITY, MAX_RESOURCES};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;

// ── Event log parsing ────────────────────────────────────────

/// Rejection reasons for a malformed event log. Carries the 1-based line
/// number so the diagnostic points at the offending input.
#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    #[error("line {line}: expected 5 fields, got {got}")]
    FieldCount { line: usize, got: usize },
    #[error("line {line}: {field} is not a number")]
    InvalidNumber { line: usize, field: &'static str },
    #[error("line {line}: unknown event '{event}'")]
    UnknownEvent { line: usize, event: String },
    #[error("line {line}: illegal priority {prio}")]
    IllegalPriority { line: usize, prio: u64 },
    #[error("line {line}: resource {res} does not exist")]
    NoSuchResource { line: usize, res: u64 },
    #[error("line {line}: process {pid} already exists")]
    DuplicateStart { line: usize, pid: Pid },
    #[error("line {line}: event for non-existing process {pid}")]
    UnknownProcess { line: usize, pid: Pid },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventKind {
    Stop,
    Lock(usize),
    Unlock(usize),
    Renice(u8),
}

/// One scheduled event, timestamped in *process* time.
#[derive(Debug, Clone, Copy)]
struct ProcEvent {
    at: u64,
    kind: EventKind,
}

/// Replay state for one process: its event stream plus the metrics the
/// report is built from.
#[derive(Debug)]
pub struct SimProcess {
    pub pid: Pid,
    pub priority: u8,
    pub start_time: u64,
    events: Vec<ProcEvent>,
    /// Cursor into `events`; the restartable "next event" sequence.
    cursor: usize,
    /// Slots of CPU this process has received so far.
    pub run_time: u64,
    /// Wall tick of first scheduling minus start time.
    pub response_time: Option<u64>,
    /// Wall tick of completion minus start time.
    pub turnaround_time: Option<u64>,
    /// Total ticks spent blocked on resources.
    pub wait_time: u64,
    /// Wall tick at which the open waiting interval began.
    wait_since: Option<u64>,
}

impl SimProcess {
    fn new(pid: Pid, priority: u8, start_time: u64) -> Self {
        SimProcess {
            pid,
            priority,
            start_time,
            events: Vec::new(),
            cursor: 0,
            run_time: 0,
            response_time: None,
            turnaround_time: None,
            wait_time: 0,
            wait_since: None,
        }
    }

    fn finished(&self) -> bool {
        self.cursor >= self.events.len()
    }
}

/// A parsed event log: every process with its sorted event stream,
/// ordered by start time.
#[derive(Debug)]
pub struct Workload {
    procs: Vec<SimProcess>,
}

impl Workload {
    /// Parse an event log. Returns the first problem found; a workload
    /// that parses is safe to hand to the scheduler.
    pub fn parse(input: &str) -> Result<Workload, ParseError> {
        let mut procs: Vec<SimProcess> = Vec::new();
        let mut by_pid: HashMap<Pid, usize> = HashMap::new();

        for (idx, raw) in input.lines().enumerate() {
            let line = idx + 1;
            if raw.trim().is_empty() {
                continue;
            }
            let fields: Vec<&str> = raw.split_whitespace().collect();
            if fields.len() != 5 {
                return Err(ParseError::FieldCount { line, got: fields.len() });
            }

            let time = parse_num(fields[0], line, "time")?;
            let event = fields[1];
            let id: Pid = fields[2]
                .parse()
                .map_err(|_| ParseError::InvalidNumber { line, field: "id" })?;
            let duration = parse_num(fields[3], line, "duration")?;
            let arg = parse_num(fields[4], line, "arg")?;

            match event {
                "start" => {
                    if by_pid.contains_key(&id) {
                        return Err(ParseError::DuplicateStart { line, pid: id });
                    }
                    if arg > MAX_PRIORITY as u64 {
                        return Err(ParseError::IllegalPriority { line, prio: arg });
                    }
                    let mut proc = SimProcess::new(id, arg as u8, time);
                    proc.events.push(ProcEvent { at: duration, kind: EventKind::Stop });
                    by_pid.insert(id, procs.len());
                    procs.push(proc);
                }
                "lock" => {
                    let proc = lookup(&mut procs, &by_pid, id, line)?;
                    if arg >= MAX_RESOURCES as u64 {
                        return Err(ParseError::NoSuchResource { line, res: arg });
                    }
                    let res = arg as usize;
                    proc.events.push(ProcEvent { at: time, kind: EventKind::Lock(res) });
                    proc.events.push(ProcEvent {
                        at: time + duration,
                        kind: EventKind::Unlock(res),
                    });
                }
                "renice" => {
                    let proc = lookup(&mut procs, &by_pid, id, line)?;
                    if arg > MAX_PRIORITY as u64 {
                        return Err(ParseError::IllegalPriority { line, prio: arg });
                    }
                    proc.events.push(ProcEvent { at: time, kind: EventKind::Renice(arg as u8) });
                }
                _ => {
                    return Err(ParseError::UnknownEvent { line, event: event.to_string() });
                }
            }
        }

        // Stable sorts: same-tick starts keep input order, and a lock's
        // unlock stays behind any later lock at the same process time.
        procs.sort_by_key(|proc| proc.start_time);
        for proc in &mut procs {
            proc.events.sort_by_key(|event| event.at);
        }

        Ok(Workload { procs })
    }

    pub fn len(&self) -> usize {
        self.procs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.procs.is_empty()
    }
}

fn parse_num(text: &str, line: usize, field: &'static str) -> Result<u64, ParseError> {
    text.parse()
        .map_err(|_| ParseError::InvalidNumber { line, field })
}

fn lookup<'a>(
    procs: &'a mut [SimProcess],
    by_pid: &HashMap<Pid, usize>,
    pid: Pid,
    line: usize,
) -> Result<&'a mut SimProcess, ParseError> {
    match by_pid.get(&pid) {
        Some(&index) => Ok(&mut procs[index]),
        None => Err(ParseError::UnknownProcess { line, pid }),
    }
}

// ── Replay driver ────────────────────────────────────────────

/// The replay loop: drives one `Scheduler` over a workload, one time unit
/// per iteration, recording the decision trace and per-process metrics.
pub struct Simulation {
    procs: Vec<SimProcess>,
    index_of: HashMap<Pid, usize>,
    sched: Scheduler,
    wct: u64,
    idle_time: u64,
    next_start: usize,
    trace: Vec<Option<Pid>>,
}

impl Simulation {
    pub fn new(workload: Workload) -> Self {
        let index_of = workload
            .procs
            .iter()
            .enumerate()
            .map(|(index, proc)| (proc.pid, index))
            .collect();
        Simulation {
            procs: workload.procs,
            index_of,
            sched: Scheduler::new(),
            wct: 0,
            idle_time: 0,
            next_start: 0,
            trace: Vec::new(),
        }
    }

    /// Run the replay to completion: until every process has consumed all
    /// of its events.
    pub fn run(&mut self) {
        loop {
            self.admit();
            self.deliver();
            if self.close_finished() {
                break;
            }
            self.advance();
        }
    }

    /// Admit every process whose start time has arrived. Processes starting
    /// on the same tick are started newest-line-first: `start` inserts at
    /// the queue front, so the batch ends up scanned in input order.
    fn admit(&mut self) {
        let batch_start = self.next_start;
        while self.next_start < self.procs.len()
            && self.procs[self.next_start].start_time <= self.wct
        {
            self.next_start += 1;
        }
        for index in (batch_start..self.next_start).rev() {
            let proc = &self.procs[index];
            self.sched.start(proc.pid, proc.priority);
        }
    }

    /// Deliver every event that has come due, per process, in process-time
    /// order. A process that is not being scheduled does not advance its
    /// run time, so its pending events stay pending.
    fn deliver(&mut self) {
        for index in 0..self.next_start {
            loop {
                let proc = &self.procs[index];
                if proc.finished() || proc.events[proc.cursor].at > proc.run_time {
                    break;
                }
                let event = proc.events[proc.cursor];
                let pid = proc.pid;
                match event.kind {
                    EventKind::Stop => {
                        self.sched.exit(pid);
                        self.procs[index].cursor = self.procs[index].events.len();
                        continue;
                    }
                    EventKind::Lock(res) => {
                        let acquired = self.sched.locked(pid, res);
                        let proc = &mut self.procs[index];
                        if !acquired && proc.wait_since.is_none() {
                            proc.wait_since = Some(self.wct);
                        }
                    }
                    EventKind::Unlock(res) => {
                        self.sched.unlocked(pid, res);
                    }
                    EventKind::Renice(priority) => {
                        self.procs[index].priority = priority;
                        self.sched.renice(pid, priority);
                    }
                }
                self.procs[index].cursor += 1;
            }
        }
    }

    /// Fix the turnaround time of every process that has just consumed its
    /// last event. Returns true once all processes are done.
    fn close_finished(&mut self) -> bool {
        let mut all_done = true;
        for proc in &mut self.procs {
            if !proc.finished() {
                all_done = false;
            } else if proc.turnaround_time.is_none() {
                proc.turnaround_time = Some(self.wct - proc.start_time);
            }
        }
        all_done
    }

    /// One scheduling decision plus its accounting.
    fn advance(&mut self) {
        match self.sched.schedule() {
            None => self.idle_time += 1,
            Some(pid) => {
                let index = self.index_of[&pid];
                let proc = &mut self.procs[index];
                proc.run_time += 1;
                if proc.response_time.is_none() {
                    proc.response_time = Some(self.wct - proc.start_time);
                }
                if let Some(since) = proc.wait_since.take() {
                    proc.wait_time += self.wct - since;
                }
            }
        }
        self.trace.push(self.sched.current());
        self.wct += 1;
    }

    /// The decision made at every elapsed tick; None entries are idle slots.
    pub fn trace(&self) -> &[Option<Pid>] {
        &self.trace
    }

    pub fn processes(&self) -> &[SimProcess] {
        &self.procs
    }

    pub fn elapsed(&self) -> u64 {
        self.wct
    }

    pub fn idle_time(&self) -> u64 {
        self.idle_time
    }

    /// Aggregate metrics over the finished replay.
    pub fn stats(&self) -> Stats {
        let n = self.procs.len();
        let mut response = 0.0;
        let mut turnaround = 0.0;
        let mut waiting = 0.0;
        for proc in &self.procs {
            response += proc.response_time.unwrap_or(0) as f64;
            turnaround += proc.turnaround_time.unwrap_or(0) as f64;
            waiting += proc.wait_time as f64;
        }
        let count = n.max(1) as f64;
        Stats {
            processes: n,
            simulation_time: self.wct,
            avg_response_time: response / count,
            avg_turnaround_time: turnaround / count,
            avg_waiting_time: waiting / count,
            cpu_utilization: if self.wct == 0 {
                0.0
            } else {
                1.0 - self.idle_time as f64 / self.wct as f64
            },
        }
    }
}

/// Aggregate report; `Display` renders the human-readable block the
/// driver prints.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Stats {
    pub processes: usize,
    pub simulation_time: u64,
    pub avg_response_time: f64,
    pub avg_turnaround_time: f64,
    pub avg_waiting_time: f64,
    /// Fraction in [0, 1]; rendered as a percentage.
    pub cpu_utilization: f64,
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f)?;
        writeln!(f, "Statistics")?;
        writeln!(f, "============")?;
        writeln!(f)?;
        writeln!(f, "# processes:\t\t{}", self.processes)?;
        writeln!(f, "simulation time:\t{} time units", self.simulation_time)?;
        writeln!(f)?;
        writeln!(f, "av response time:\t{:.1}", self.avg_response_time)?;
        writeln!(f, "av turnaround time:\t{:.1}", self.avg_turnaround_time)?;
        writeln!(f, "av waiting time:\t{:.1}", self.avg_waiting_time)?;
        writeln!(f, "CPU utilization:\t{:.2}%", self.cpu_utilization * 100.0)
    }
}

// ── Workload generator ───────────────────────────────────────

/// Generate a random but well-formed event log: per process, lock
/// intervals never overlap, so no schedule it produces can deadlock
/// (a process never holds one resource while requesting another).
/// Deterministic in the seed; used by the invariant tests.
pub fn random_workload(seed: u64, processes: usize) -> String {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut lines = Vec::new();
    for pid in 0..processes as Pid {
        let start = rng.gen_range(0..20u64);
        let duration = rng.gen_range(1..40u64);
        let priority = rng.gen_range(0..=MAX_PRIORITY);
        lines.push(format!("{start} start {pid} {duration} {priority}"));

        let mut t = 0u64;
        while t < duration {
            match rng.gen_range(0..4u32) {
                0 => {
                    let hold = rng.gen_range(1..6u64).min(duration - t);
                    let res = rng.gen_range(0..MAX_RESOURCES);
                    lines.push(format!("{t} lock {pid} {hold} {res}"));
                    t += hold;
                }
                1 => {
                    let priority = rng.gen_range(0..=MAX_PRIORITY);
                    lines.push(format!("{t} renice {pid} 0 {priority}"));
                    t += rng.gen_range(1..5u64);
                }
                _ => t += rng.gen_range(1..8u64),
            }
        }
    }
    lines.join("\n")
}

// ============================================================
//  TESTS
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn replay(input: &str) -> Simulation {
        let workload = Workload::parse(input).expect("workload should parse");
        let mut sim = Simulation::new(workload);
        sim.run();
        sim
    }

    fn proc_by_pid(sim: &Simulation, pid: Pid) -> &SimProcess {
        sim.processes()
            .iter()
            .find(|proc| proc.pid == pid)
            .expect("pid present")
    }

    mod parsing {
        use super::*;

        #[test]
        fn blank_lines_are_ignored() {
            let workload = Workload::parse("\n0 start 1 5 0\n\n").unwrap();
            assert_eq!(workload.len(), 1);
        }

        #[test]
        fn wrong_field_count_is_rejected() {
            let err = Workload::parse("0 start 1 5").unwrap_err();
            assert_eq!(err, ParseError::FieldCount { line: 1, got: 4 });
        }

        #[test]
        fn non_numeric_time_is_rejected() {
            let err = Workload::parse("soon start 1 5 0").unwrap_err();
            assert_eq!(err, ParseError::InvalidNumber { line: 1, field: "time" });
        }

        #[test]
        fn unknown_event_is_rejected() {
            let err = Workload::parse("0 sleep 1 5 0").unwrap_err();
            assert_eq!(
                err,
                ParseError::UnknownEvent { line: 1, event: "sleep".into() }
            );
        }

        #[test]
        fn out_of_range_priority_is_rejected() {
            let err = Workload::parse("0 start 1 5 3").unwrap_err();
            assert_eq!(err, ParseError::IllegalPriority { line: 1, prio: 3 });
        }

        #[test]
        fn out_of_range_resource_is_rejected() {
            let input = "0 start 1 5 0\n1 lock 1 2 32";
            let err = Workload::parse(input).unwrap_err();
            assert_eq!(err, ParseError::NoSuchResource { line: 2, res: 32 });
        }

        #[test]
        fn duplicate_start_is_rejected() {
            let input = "0 start 1 5 0\n2 start 1 5 0";
            let err = Workload::parse(input).unwrap_err();
            assert_eq!(err, ParseError::DuplicateStart { line: 2, pid: 1 });
        }

        #[test]
        fn event_for_unknown_process_is_rejected() {
            let err = Workload::parse("0 lock 7 2 0").unwrap_err();
            assert_eq!(err, ParseError::UnknownProcess { line: 1, pid: 7 });
        }
    }

    mod round_robin {
        use super::*;

        #[test]
        fn equal_priorities_alternate_in_input_order() {
            let sim = replay("0 start 1 4 1\n0 start 2 4 1");
            let expected: Vec<Option<Pid>> =
                [1, 2, 1, 2, 1, 2, 1, 2].iter().map(|&pid| Some(pid)).collect();
            assert_eq!(sim.trace(), &expected[..]);
        }

        #[test]
        fn round_robin_metrics() {
            let sim = replay("0 start 1 4 1\n0 start 2 4 1");
            let first = proc_by_pid(&sim, 1);
            let second = proc_by_pid(&sim, 2);
            assert_eq!(first.response_time, Some(0));
            assert_eq!(second.response_time, Some(1));
            assert_eq!(first.turnaround_time, Some(7));
            assert_eq!(second.turnaround_time, Some(8));
            assert_eq!(sim.idle_time(), 0);
        }
    }

    mod strict_priority {
        use super::*;

        #[test]
        fn higher_priority_runs_to_completion_first() {
            let sim = replay("0 start 1 3 0\n0 start 2 3 2");
            let expected: Vec<Option<Pid>> =
                [2, 2, 2, 1, 1, 1].iter().map(|&pid| Some(pid)).collect();
            assert_eq!(sim.trace(), &expected[..]);
        }

        #[test]
        fn preempted_process_pays_in_response_time() {
            let sim = replay("0 start 1 3 0\n0 start 2 3 2");
            assert_eq!(proc_by_pid(&sim, 1).response_time, Some(3));
            assert_eq!(proc_by_pid(&sim, 2).response_time, Some(0));
        }
    }

    mod ageing {
        use super::*;

        #[test]
        fn long_running_high_priority_process_cannot_starve_a_low_one() {
            // H's effective priority ages 2 -> 1 -> 0 over 16 slots; at the
            // first tick where they tie, queue order puts L first.
            let sim = replay("0 start 1 20 2\n0 start 2 4 0");
            let trace = sim.trace();
            assert!(trace[..16].iter().all(|&slot| slot == Some(1)));
            assert_eq!(trace[16], Some(2), "L must first run at tick 16");
        }
    }

    mod priority_inversion {
        use super::*;

        const INPUT: &str = "\
0 start 1 10 0
0 lock 1 6 0
1 start 2 4 2
1 lock 2 1 0";

        #[test]
        fn boosted_holder_runs_while_high_priority_waits() {
            let sim = replay(INPUT);
            let trace = sim.trace();
            assert_eq!(trace[0], Some(1));
            assert_eq!(trace[1], Some(2), "H runs its first slot before blocking");
            // H blocks on res 0 at tick 2; the boosted holder keeps the CPU
            // until its unlock comes due at process time 6.
            assert!(trace[2..7].iter().all(|&slot| slot == Some(1)));
            assert_eq!(trace[7], Some(2), "H resumes as soon as the lock frees");
        }

        #[test]
        fn waiting_interval_spans_block_to_reschedule() {
            let sim = replay(INPUT);
            let high = proc_by_pid(&sim, 2);
            // blocked at tick 2, rescheduled at tick 7
            assert_eq!(high.wait_time, 5);
            assert_eq!(high.response_time, Some(0));
            let low = proc_by_pid(&sim, 1);
            assert_eq!(low.wait_time, 0);
        }
    }

    mod accounting {
        use super::*;

        #[test]
        fn uncontended_lock_costs_no_waiting_time() {
            let sim = replay("0 start 1 6 1\n1 lock 1 2 4");
            assert_eq!(proc_by_pid(&sim, 1).wait_time, 0);
        }

        #[test]
        fn gap_before_late_start_counts_as_idle() {
            let sim = replay("3 start 1 2 0");
            assert_eq!(sim.idle_time(), 3);
            assert_eq!(&sim.trace()[..3], [None, None, None]);
            let stats = sim.stats();
            assert_eq!(stats.simulation_time, 5);
            assert!((stats.cpu_utilization - 0.4).abs() < 1e-9);
        }

        #[test]
        fn stats_average_over_all_processes() {
            let sim = replay("0 start 1 4 1\n0 start 2 4 1");
            let stats = sim.stats();
            assert_eq!(stats.processes, 2);
            assert_eq!(stats.simulation_time, 8);
            assert!((stats.avg_response_time - 0.5).abs() < 1e-9);
            assert!((stats.avg_turnaround_time - 7.5).abs() < 1e-9);
            assert!((stats.cpu_utilization - 1.0).abs() < 1e-9);
        }

        #[test]
        fn report_renders_one_line_per_metric() {
            let sim = replay("0 start 1 4 1");
            let report = sim.stats().to_string();
            assert!(report.contains("# processes:\t\t1"));
            assert!(report.contains("simulation time:\t4 time units"));
            assert!(report.contains("av response time:\t0.0"));
            assert!(report.contains("CPU utilization:\t100.00%"));
        }
    }

    mod invariants {
        use super::*;

        #[test]
        fn run_time_plus_idle_equals_elapsed_time() {
            for seed in 0..20 {
                let input = random_workload(seed, 6);
                let sim = replay(&input);
                let total_run: u64 = sim.processes().iter().map(|proc| proc.run_time).sum();
                assert_eq!(
                    total_run + sim.idle_time(),
                    sim.elapsed(),
                    "accounting identity broken for seed {seed}"
                );
            }
        }

        #[test]
        fn trace_has_exactly_one_entry_per_tick() {
            for seed in 0..20 {
                let input = random_workload(seed, 5);
                let sim = replay(&input);
                assert_eq!(sim.trace().len() as u64, sim.elapsed());
            }
        }

        #[test]
        fn every_process_eventually_finishes() {
            for seed in 0..20 {
                let input = random_workload(seed, 8);
                let sim = replay(&input);
                for proc in sim.processes() {
                    assert!(
                        proc.turnaround_time.is_some(),
                        "process {} never finished (seed {seed})",
                        proc.pid
                    );
                }
            }
        }

        #[test]
        fn empty_workload_produces_an_empty_run() {
            let sim = replay("");
            assert_eq!(sim.elapsed(), 0);
            assert_eq!(sim.stats().processes, 0);
        }
    }
}
