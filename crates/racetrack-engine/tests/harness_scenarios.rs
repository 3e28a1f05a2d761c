//! End-to-end harness runs: scripted races, exhaustive exploration, and
//! randomized plans.
//!
//! # Running Tests
//! ```bash
//! cargo test --test harness_scenarios
//! ```

use proptest::prelude::*;
use racetrack_engine::HarnessError;
use racetrack_engine::harness::{
    Choice, CleanupOutcome, Harness, HarnessConfig, RandomChoices, ScriptedChoices, WorkerState,
    NUM_API_CALLS,
};

fn harness(threads: usize, rounds: usize) -> Harness {
    Harness::new(HarnessConfig {
        threads,
        rounds,
        ..HarnessConfig::default()
    })
}

#[test]
fn test_stop_and_subscribe_race() {
    // A: subscribe then stop. B: stop then read the clock.
    for _ in 0..50 {
        let report = harness(2, 2)
            .run_plan(&[
                vec![Choice::Subscribe, Choice::Stop],
                vec![Choice::Stop, Choice::QueryClock],
            ])
            .unwrap();

        let a = &report.workers[0];
        let b = &report.workers[1];
        assert_eq!(a.stops, 1);
        assert_eq!(b.stops, 1);
        assert_eq!(b.clock_reads.len(), 1);
        assert!(a.subscribed || a.subscribe_rejected);
        if a.subscribed {
            assert!(!matches!(a.cleanup, CleanupOutcome::NotNeeded));
        }
        assert!(report
            .workers
            .iter()
            .all(|w| w.final_state == WorkerState::Done));
    }
}

#[test]
fn test_every_worker_stops_at_once() {
    for _ in 0..20 {
        let report = harness(4, 1)
            .run_plan(&vec![vec![Choice::Stop]; 4])
            .unwrap();
        assert_eq!(report.destroy.stats.stop_requests, 4);
        assert_eq!(report.destroy.handles_reclaimed, 0);
    }
}

#[test]
fn test_subscribe_then_join_schedules_cleanup() {
    let report = harness(1, 1)
        .run_plan(&[vec![Choice::Subscribe]])
        .unwrap();
    let worker = &report.workers[0];
    assert!(worker.subscribed);
    match &worker.cleanup {
        CleanupOutcome::Scheduled(task) => assert!(task.status().is_terminal()),
        other => panic!("cleanup should have been accepted, got {other:?}"),
    }
    // cleanup ran (ready or canceled) so nothing was left for destroy
    assert_eq!(report.destroy.handles_reclaimed, 0);
    assert_eq!(report.destroy.stats.unsubscribes, 1);
}

#[test]
fn test_all_workers_subscribe_with_poke() {
    for _ in 0..20 {
        let report = harness(4, 2)
            .run_plan(&vec![vec![Choice::Subscribe, Choice::QueryClock]; 4])
            .unwrap();
        assert!(report.workers.iter().all(|w| w.subscribed));
        assert_eq!(report.destroy.stats.subscribes, 4);
        assert_eq!(report.destroy.handles_reclaimed, 0);
    }
}

#[test]
fn test_subscribers_race_stoppers() {
    for _ in 0..30 {
        let report = harness(4, 2)
            .run_plan(&[
                vec![Choice::Subscribe, Choice::Noop],
                vec![Choice::Stop, Choice::Stop],
                vec![Choice::QueryClock, Choice::Subscribe],
                vec![Choice::Subscribe, Choice::Stop],
            ])
            .unwrap();
        let refused = report
            .workers
            .iter()
            .filter(|w| matches!(w.cleanup, CleanupOutcome::LoopStopped))
            .count();
        assert_eq!(refused, report.destroy.handles_reclaimed);
    }
}

#[test]
fn test_exhaustive_two_by_two_is_clean() {
    let summary = harness(2, 2).run_exhaustive().unwrap();
    let per_worker = (NUM_API_CALLS as u64 + 1).pow(2);
    assert_eq!(summary.runs, per_worker * per_worker);
    assert_eq!(
        summary.cleanups_scheduled + summary.cleanups_refused,
        summary.subscribes
    );
}

#[test]
fn test_exhaustive_rejects_grid_too_large_to_enumerate() {
    let err = harness(8, 8).run_exhaustive().unwrap_err();
    assert!(matches!(
        err,
        HarnessError::PlanSpaceTooLarge {
            threads: 8,
            rounds: 8
        }
    ));
}

#[test]
fn test_seeded_runs_pick_identical_plans() {
    let config = HarnessConfig {
        threads: 3,
        rounds: 4,
        seed: Some(7),
        ..HarnessConfig::default()
    };
    let harness = Harness::new(config);
    let first = harness.run(&mut RandomChoices::from_seed(7)).unwrap();
    let second = harness.run(&mut RandomChoices::from_seed(7)).unwrap();
    assert_eq!(first.plan, second.plan);
}

fn choice_strategy() -> impl Strategy<Value = Choice> {
    (0..=NUM_API_CALLS).prop_map(Choice::from_index)
}

fn plan_strategy() -> impl Strategy<Value = Vec<Vec<Choice>>> {
    (1usize..=4, 1usize..=4).prop_flat_map(|(threads, rounds)| {
        prop::collection::vec(prop::collection::vec(choice_strategy(), rounds), threads)
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_random_plans_leave_nothing_behind(plan in plan_strategy()) {
        let threads = plan.len();
        let rounds = plan[0].len();
        let harness = harness(threads, rounds);
        let report = harness.run(&mut ScriptedChoices::new(plan.clone())).unwrap();

        prop_assert_eq!(&report.plan, &plan);
        for worker in &report.workers {
            prop_assert_eq!(worker.final_state, WorkerState::Done);
            prop_assert_eq!(
                worker.stops,
                worker.choices.iter().filter(|c| **c == Choice::Stop).count()
            );
            if let CleanupOutcome::Scheduled(task) = &worker.cleanup {
                prop_assert!(task.status().is_terminal());
            }
        }
    }
}
