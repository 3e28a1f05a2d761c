//! Per-round operation choices and the sources that produce them

use crate::error::HarnessError;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Number of real API operations a worker picks from
pub const NUM_API_CALLS: u8 = 3;

/// One round's operation
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Choice {
    /// `EventLoop::stop`
    Stop,
    /// `EventLoop::current_clock_time`
    QueryClock,
    /// `EventLoop::subscribe` on the worker's private handle
    Subscribe,
    /// Do nothing this round
    Noop,
}

impl Choice {
    /// Every choice, in index order
    pub const ALL: [Choice; 4] = [Choice::Stop, Choice::QueryClock, Choice::Subscribe, Choice::Noop];

    /// Map an index to a choice; anything past the API calls is a no-op
    pub fn from_index(index: u8) -> Choice {
        match index {
            0 => Choice::Stop,
            1 => Choice::QueryClock,
            2 => Choice::Subscribe,
            _ => Choice::Noop,
        }
    }

    /// Map a uniformly random byte onto `0..=NUM_API_CALLS` with equal weight
    pub fn from_random_byte(byte: u8) -> Choice {
        Choice::from_index(byte / (u8::MAX / (NUM_API_CALLS + 1) + 1))
    }

    /// Index of this choice
    pub fn index(self) -> u8 {
        match self {
            Choice::Stop => 0,
            Choice::QueryClock => 1,
            Choice::Subscribe => 2,
            Choice::Noop => NUM_API_CALLS,
        }
    }
}

/// Choices for every worker of one run, indexed by worker
pub type Plan = Vec<Vec<Choice>>;

/// Produces the choice array for each worker.
///
/// Injected into the harness so the same driver serves random stress runs,
/// fixed scenarios, and exhaustive enumeration.
pub trait ChoiceSource {
    /// Choices for `worker` over `rounds` rounds
    fn choices(&mut self, worker: usize, rounds: usize) -> Vec<Choice>;

    /// A full plan for `workers` workers
    fn plan(&mut self, workers: usize, rounds: usize) -> Plan {
        (0..workers).map(|w| self.choices(w, rounds)).collect()
    }
}

/// Uniformly random choices from a seedable generator
#[derive(Debug)]
pub struct RandomChoices {
    rng: StdRng,
}

impl RandomChoices {
    /// Deterministic sequence for `seed`
    pub fn from_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Sequence seeded from OS entropy
    pub fn from_entropy() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }
}

impl ChoiceSource for RandomChoices {
    fn choices(&mut self, _worker: usize, rounds: usize) -> Vec<Choice> {
        (0..rounds)
            .map(|_| Choice::from_random_byte(self.rng.gen()))
            .collect()
    }
}

/// A fixed plan. Missing workers or rounds are filled with no-ops.
#[derive(Debug, Clone)]
pub struct ScriptedChoices {
    plan: Plan,
}

impl ScriptedChoices {
    /// Wrap a plan
    pub fn new(plan: Plan) -> Self {
        Self { plan }
    }
}

impl ChoiceSource for ScriptedChoices {
    fn choices(&mut self, worker: usize, rounds: usize) -> Vec<Choice> {
        let script = self.plan.get(worker).map(Vec::as_slice).unwrap_or(&[]);
        (0..rounds)
            .map(|r| script.get(r).copied().unwrap_or(Choice::Noop))
            .collect()
    }
}

/// Every plan for `workers × rounds` over all four choices, in order
#[derive(Debug, Clone)]
pub struct ExhaustivePlans {
    workers: usize,
    rounds: usize,
    next: u64,
    total: u64,
}

impl ExhaustivePlans {
    /// Enumerator over `4^(workers * rounds)` plans. Fails when that count
    /// does not fit in a `u64`.
    pub fn new(workers: usize, rounds: usize) -> Result<Self, HarnessError> {
        let too_large = || HarnessError::PlanSpaceTooLarge {
            threads: workers,
            rounds,
        };
        let base = Choice::ALL.len() as u64;
        let total = workers
            .checked_mul(rounds)
            .and_then(|slots| u32::try_from(slots).ok())
            .and_then(|slots| base.checked_pow(slots))
            .ok_or_else(too_large)?;
        Ok(Self {
            workers,
            rounds,
            next: 0,
            total,
        })
    }

    /// Number of plans the enumerator yields in total
    pub fn total(&self) -> u64 {
        self.total
    }
}

impl Iterator for ExhaustivePlans {
    type Item = Plan;

    fn next(&mut self) -> Option<Plan> {
        if self.next >= self.total {
            return None;
        }
        let base = Choice::ALL.len() as u64;
        let mut code = self.next;
        self.next += 1;

        let mut plan = Vec::with_capacity(self.workers);
        for _ in 0..self.workers {
            let mut choices = Vec::with_capacity(self.rounds);
            for _ in 0..self.rounds {
                choices.push(Choice::ALL[(code % base) as usize]);
                code /= base;
            }
            plan.push(choices);
        }
        Some(plan)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = usize::try_from(self.total - self.next).unwrap_or(usize::MAX);
        (left, Some(left))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_random_byte_buckets() {
        assert_eq!(Choice::from_random_byte(0), Choice::Stop);
        assert_eq!(Choice::from_random_byte(63), Choice::Stop);
        assert_eq!(Choice::from_random_byte(64), Choice::QueryClock);
        assert_eq!(Choice::from_random_byte(128), Choice::Subscribe);
        assert_eq!(Choice::from_random_byte(192), Choice::Noop);
        assert_eq!(Choice::from_random_byte(255), Choice::Noop);
    }

    #[test]
    fn test_index_roundtrip() {
        for choice in Choice::ALL {
            assert_eq!(Choice::from_index(choice.index()), choice);
        }
    }

    #[test]
    fn test_seeded_choices_repeat() {
        let a = RandomChoices::from_seed(42).plan(3, 5);
        let b = RandomChoices::from_seed(42).plan(3, 5);
        assert_eq!(a, b);
        assert_eq!(a.len(), 3);
        assert!(a.iter().all(|w| w.len() == 5));
    }

    #[test]
    fn test_scripted_pads_with_noop() {
        let mut script = ScriptedChoices::new(vec![vec![Choice::Subscribe]]);
        assert_eq!(script.choices(0, 2), vec![Choice::Subscribe, Choice::Noop]);
        assert_eq!(script.choices(1, 2), vec![Choice::Noop, Choice::Noop]);
    }

    #[test]
    fn test_exhaustive_covers_every_plan_once() {
        let plans = ExhaustivePlans::new(2, 2).unwrap();
        assert_eq!(plans.total(), 256);
        let all: Vec<Plan> = plans.collect();
        assert_eq!(all.len(), 256);
        let unique: HashSet<Plan> = all.iter().cloned().collect();
        assert_eq!(unique.len(), 256);
        assert!(all.contains(&vec![
            vec![Choice::Subscribe, Choice::Stop],
            vec![Choice::Stop, Choice::QueryClock],
        ]));
    }

    #[test]
    fn test_exhaustive_empty_shape() {
        let mut plans = ExhaustivePlans::new(0, 3).unwrap();
        assert_eq!(plans.total(), 1);
        assert_eq!(plans.next(), Some(vec![]));
        assert_eq!(plans.next(), None);
    }

    #[test]
    fn test_exhaustive_rejects_overflowing_grid() {
        // 4^31 still fits, 4^32 does not
        assert_eq!(ExhaustivePlans::new(31, 1).unwrap().total(), 1 << 62);
        assert!(matches!(
            ExhaustivePlans::new(8, 4),
            Err(HarnessError::PlanSpaceTooLarge { threads: 8, rounds: 4 })
        ));
        assert!(ExhaustivePlans::new(8, 8).is_err());
        assert!(ExhaustivePlans::new(usize::MAX, 2).is_err());
    }
}
