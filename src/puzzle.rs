//! Client puzzles: the DoS-resistance precondition of the connect handshake.
//!
//! The host hands every challenger a puzzle of tunable difficulty `k`: find a
//! 32-bit `solution` such that `SHA-256(solution ‖ client_identity ‖
//! initiator_nonce ‖ server_nonce)` starts with `k` zero bits. Verification is
//! one hash; solving is brute force, so a host under load can price
//! connections in CPU without holding any per-challenger state.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use byteorder::{ByteOrder, LittleEndian};
use fnv::FnvHashSet;
use rand::RngCore;
use ring::digest;

/// Outcome of verifying a submitted puzzle solution.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SolutionCheck {
    Success,
    InvalidSolution,
    InvalidServerNonce,
    /// The initiator nonce was already used against this server nonce.
    InvalidClientNonce,
    InvalidDifficulty,
}

/// Tests one candidate solution against the leading-zero-bit constraint.
pub fn check_one_solution(
    solution: u32,
    client_identity: u32,
    initiator_nonce: u64,
    server_nonce: u64,
    difficulty: u32,
) -> bool {
    let mut buffer = [0; 24];
    LittleEndian::write_u32(&mut buffer[0..4], solution);
    LittleEndian::write_u32(&mut buffer[4..8], client_identity);
    LittleEndian::write_u64(&mut buffer[8..16], initiator_nonce);
    LittleEndian::write_u64(&mut buffer[16..24], server_nonce);
    let hash = digest::digest(&digest::SHA256, &buffer);
    let hash = hash.as_ref();

    if difficulty == 0 {
        return true;
    }
    let mut index = 0;
    let mut remaining = difficulty;
    while remaining > 8 {
        if hash[index] != 0 {
            return false;
        }
        index += 1;
        remaining -= 8;
    }
    let mask = 0xffu8 << (8 - remaining);
    mask & hash[index] == 0
}

/// Host-side puzzle issue and verification state.
///
/// Two server nonces are live at any time: the current one handed to new
/// challengers, and the previous one still accepted so a challenger caught by
/// a rotation does not have to restart. Each live nonce carries the set of
/// initiator nonces already redeemed against it, which is what makes a
/// replayed connect request fail.
pub struct PuzzleManager {
    difficulty: u32,
    max_difficulty: u32,
    refresh_interval: u64,
    last_refresh: u64,
    current_nonce: u64,
    previous_nonce: u64,
    current_seen: FnvHashSet<u64>,
    previous_seen: FnvHashSet<u64>,
}

impl PuzzleManager {
    pub fn new<R: RngCore>(
        rng: &mut R,
        difficulty: u32,
        max_difficulty: u32,
        refresh_interval: u64,
    ) -> Self {
        Self {
            difficulty,
            max_difficulty,
            refresh_interval,
            last_refresh: 0,
            current_nonce: rng.next_u64(),
            previous_nonce: rng.next_u64(),
            current_seen: FnvHashSet::default(),
            previous_seen: FnvHashSet::default(),
        }
    }

    pub fn current_nonce(&self) -> u64 {
        self.current_nonce
    }

    pub fn difficulty(&self) -> u32 {
        self.difficulty
    }

    pub fn set_difficulty(&mut self, difficulty: u32) {
        self.difficulty = difficulty.min(self.max_difficulty);
    }

    /// Rotates the server nonce once the refresh interval has elapsed,
    /// discarding the oldest redeemed-nonce set with it.
    pub fn tick<R: RngCore>(&mut self, now: u64, rng: &mut R) {
        if now.saturating_sub(self.last_refresh) < self.refresh_interval {
            return;
        }
        self.last_refresh = now;
        self.previous_nonce = self.current_nonce;
        ::std::mem::swap(&mut self.previous_seen, &mut self.current_seen);
        self.current_seen.clear();
        self.current_nonce = rng.next_u64();
    }

    pub fn check_solution(
        &mut self,
        solution: u32,
        initiator_nonce: u64,
        server_nonce: u64,
        difficulty: u32,
        client_identity: u32,
    ) -> SolutionCheck {
        if difficulty != self.difficulty {
            return SolutionCheck::InvalidDifficulty;
        }
        let seen = if server_nonce == self.current_nonce {
            &mut self.current_seen
        } else if server_nonce == self.previous_nonce {
            &mut self.previous_seen
        } else {
            return SolutionCheck::InvalidServerNonce;
        };
        if !check_one_solution(
            solution,
            client_identity,
            initiator_nonce,
            server_nonce,
            difficulty,
        ) {
            return SolutionCheck::InvalidSolution;
        }
        if !seen.insert(initiator_nonce) {
            return SolutionCheck::InvalidClientNonce;
        }
        SolutionCheck::Success
    }
}

/// A puzzle handed to the background solver.
#[derive(Debug, Copy, Clone)]
pub struct PuzzleJob {
    pub index: u32,
    pub initiator_nonce: u64,
    pub server_nonce: u64,
    pub difficulty: u32,
    pub client_identity: u32,
}

struct SolverState {
    jobs: VecDeque<PuzzleJob>,
    results: Vec<(u32, u32)>,
    cancelled: FnvHashSet<u32>,
    shutdown: bool,
}

struct SolverShared {
    state: Mutex<SolverState>,
    work: Condvar,
}

/// How many hash attempts the worker makes between cancellation checks.
const CANCEL_CHECK_INTERVAL: u32 = 1024;

/// Client-side puzzle solver: one dedicated worker thread fed over a
/// mutex-protected job queue. The socket never blocks on it; finished
/// solutions are drained during the scheduling tick and matched back to
/// pending connections by job index.
pub struct PuzzleSolver {
    shared: Arc<SolverShared>,
    worker: Option<thread::JoinHandle<()>>,
}

impl PuzzleSolver {
    pub fn new() -> Self {
        let shared = Arc::new(SolverShared {
            state: Mutex::new(SolverState {
                jobs: VecDeque::new(),
                results: Vec::new(),
                cancelled: FnvHashSet::default(),
                shutdown: false,
            }),
            work: Condvar::new(),
        });
        let worker_shared = shared.clone();
        let worker = thread::Builder::new()
            .name("puzzle-solver".into())
            .spawn(move || solver_main(&worker_shared))
            .expect("failed to spawn puzzle solver thread");
        Self {
            shared,
            worker: Some(worker),
        }
    }

    pub fn post(&self, job: PuzzleJob) {
        let mut state = self.shared.state.lock().unwrap();
        state.jobs.push_back(job);
        self.shared.work.notify_one();
    }

    /// Marks a queued or in-flight job cancelled; the worker abandons it at
    /// its next check and produces no result for it.
    pub fn cancel(&self, index: u32) {
        let mut state = self.shared.state.lock().unwrap();
        state.jobs.retain(|job| job.index != index);
        state.cancelled.insert(index);
    }

    pub fn next_result(&self) -> Option<(u32, u32)> {
        let mut state = self.shared.state.lock().unwrap();
        if state.results.is_empty() {
            None
        } else {
            Some(state.results.remove(0))
        }
    }
}

impl Drop for PuzzleSolver {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.shutdown = true;
            self.shared.work.notify_one();
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn solver_main(shared: &SolverShared) {
    loop {
        let job = {
            let mut state = shared.state.lock().unwrap();
            loop {
                if state.shutdown {
                    return;
                }
                if let Some(job) = state.jobs.pop_front() {
                    break job;
                }
                state = shared.work.wait(state).unwrap();
            }
        };
        if let Some(solution) = solve(shared, &job) {
            let mut state = shared.state.lock().unwrap();
            if !state.cancelled.remove(&job.index) {
                state.results.push((job.index, solution));
            }
        }
    }
}

fn solve(shared: &SolverShared, job: &PuzzleJob) -> Option<u32> {
    let mut solution: u32 = 0;
    loop {
        for _ in 0..CANCEL_CHECK_INTERVAL {
            if check_one_solution(
                solution,
                job.client_identity,
                job.initiator_nonce,
                job.server_nonce,
                job.difficulty,
            ) {
                return Some(solution);
            }
            if solution == u32::max_value() {
                // Exhausted the space without a hit; the pending connection
                // will time out.
                return None;
            }
            solution = solution.wrapping_add(1);
        }
        let state = shared.state.lock().unwrap();
        if state.shutdown || state.cancelled.contains(&job.index) {
            return None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    fn solve_directly(
        client_identity: u32,
        initiator_nonce: u64,
        server_nonce: u64,
        difficulty: u32,
    ) -> u32 {
        (0u32..).find(|&solution| {
            check_one_solution(solution, client_identity, initiator_nonce, server_nonce, difficulty)
        })
        .unwrap()
    }

    #[test]
    fn accepts_valid_solution_once() {
        let mut manager = PuzzleManager::new(&mut OsRng, 4, 26, 30_000);
        let nonce = manager.current_nonce();
        let solution = solve_directly(0x1234, 77, nonce, 4);
        assert_eq!(
            manager.check_solution(solution, 77, nonce, 4, 0x1234),
            SolutionCheck::Success
        );
        // The same initiator nonce cannot be redeemed twice.
        assert_eq!(
            manager.check_solution(solution, 77, nonce, 4, 0x1234),
            SolutionCheck::InvalidClientNonce
        );
    }

    #[test]
    fn rejects_wrong_difficulty() {
        let mut manager = PuzzleManager::new(&mut OsRng, 4, 26, 30_000);
        let nonce = manager.current_nonce();
        assert_eq!(
            manager.check_solution(0, 1, nonce, 5, 0),
            SolutionCheck::InvalidDifficulty
        );
    }

    #[test]
    fn rejects_bad_solution() {
        let mut manager = PuzzleManager::new(&mut OsRng, 20, 26, 30_000);
        let nonce = manager.current_nonce();
        // Difficulty 20 makes an arbitrary guess all but certainly wrong.
        assert_eq!(
            manager.check_solution(0xdeadbeef, 1, nonce, 20, 0),
            SolutionCheck::InvalidSolution
        );
    }

    #[test]
    fn previous_nonce_survives_one_rotation() {
        let mut manager = PuzzleManager::new(&mut OsRng, 4, 26, 30_000);
        let first = manager.current_nonce();
        manager.tick(30_000, &mut OsRng);
        assert_ne!(manager.current_nonce(), first);
        let solution = solve_directly(9, 42, first, 4);
        assert_eq!(
            manager.check_solution(solution, 42, first, 4, 9),
            SolutionCheck::Success
        );
        manager.tick(60_000, &mut OsRng);
        let solution = solve_directly(9, 43, first, 4);
        assert_eq!(
            manager.check_solution(solution, 43, first, 4, 9),
            SolutionCheck::InvalidServerNonce
        );
    }

    #[test]
    fn difficulty_is_clamped() {
        let mut manager = PuzzleManager::new(&mut OsRng, 17, 26, 30_000);
        manager.set_difficulty(30);
        assert_eq!(manager.difficulty(), 26);
    }

    #[test]
    fn solver_round_trip() {
        let solver = PuzzleSolver::new();
        let job = PuzzleJob {
            index: 3,
            initiator_nonce: 11,
            server_nonce: 22,
            difficulty: 8,
            client_identity: 33,
        };
        solver.post(job);
        let (index, solution) = loop {
            if let Some(result) = solver.next_result() {
                break result;
            }
            thread::yield_now();
        };
        assert_eq!(index, 3);
        assert!(check_one_solution(solution, 33, 11, 22, 8));
    }

    #[test]
    fn cancelled_job_produces_no_result() {
        let solver = PuzzleSolver::new();
        solver.cancel(5);
        solver.post(PuzzleJob {
            index: 5,
            initiator_nonce: 1,
            server_nonce: 2,
            difficulty: 4,
            client_identity: 3,
        });
        solver.post(PuzzleJob {
            index: 6,
            initiator_nonce: 1,
            server_nonce: 2,
            difficulty: 4,
            client_identity: 3,
        });
        let (index, _) = loop {
            if let Some(result) = solver.next_result() {
                break result;
            }
            thread::yield_now();
        };
        assert_eq!(index, 6);
    }
}
