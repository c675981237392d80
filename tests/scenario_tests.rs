//! End-to-end scenarios for the inline cache, execution counter and watchpoints

mod common;
use common::shaped_object;
use pretty_assertions::assert_eq;
use quicksilver_jit::ic::{next_state, AccessObservation, StubKind, StubState};
use quicksilver_jit::profile::{ExecutionCounter, ExitKind, ExitProfile, FrequentExitSite, MemoryPressure};
use quicksilver_jit::structure::StructureTable;
use quicksilver_jit::watchpoint::{Watchpoint, WatchpointSet};
use std::cell::Cell;
use std::rc::Rc;

mod inline_cache {
    use super::*;
    use pretty_assertions::assert_eq;

    const MAX: usize = 8;

    #[test]
    fn test_self_single_list_then_generic() {
        let mut table = StructureTable::new();
        let shapes: Vec<_> = (1..=9).map(|id| shaped_object(&mut table, id)).collect();

        let s1 = next_state(&StubState::Unset, &AccessObservation::for_get(&shapes[0], "x"), MAX);
        assert_eq!(s1.kind(), StubKind::SelfSingle);
        assert_eq!(s1.case_count(), 1);
        assert_eq!(s1.try_get(&shapes[0]), shapes[0].get("x"));

        let mut state = next_state(&s1, &AccessObservation::for_get(&shapes[1], "x"), MAX);
        assert_eq!(state.kind(), StubKind::SelfList);
        assert_eq!(state.case_count(), 2);

        // S3..S7 keep growing the list
        for (i, object) in shapes[2..7].iter().enumerate() {
            state = next_state(&state, &AccessObservation::for_get(object, "x"), MAX);
            assert_eq!(state.kind(), StubKind::SelfList);
            assert_eq!(state.case_count(), i + 3);
        }

        // The 8th distinct shape overflows the list
        state = next_state(&state, &AccessObservation::for_get(&shapes[7], "x"), MAX);
        assert_eq!(state.kind(), StubKind::Generic);

        for object in &shapes {
            state = next_state(&state, &AccessObservation::for_get(object, "x"), MAX);
            assert_eq!(state.kind(), StubKind::Generic);
        }
    }

    #[test]
    fn test_repeated_shape_is_stable() {
        let mut table = StructureTable::new();
        let object = shaped_object(&mut table, 1);
        let observation = AccessObservation::for_get(&object, "x");
        let s1 = next_state(&StubState::Unset, &observation, MAX);
        assert_eq!(next_state(&s1, &observation, MAX), s1);
    }
}

mod execution_counter {
    use super::*;
    use pretty_assertions::assert_eq;

    fn increments_until_crossed(counter: &mut ExecutionCounter, pressure: &MemoryPressure, limit: u32) -> Option<u32> {
        for i in 1..=limit {
            if counter.tick() && counter.check_if_threshold_crossed_and_set(pressure) {
                return Some(i);
            }
        }
        None
    }

    #[test]
    fn test_threshold_without_pressure() {
        let pressure = MemoryPressure::new(1.0, 1000);
        let mut counter = ExecutionCounter::new();
        counter.set_new_threshold(1000, &pressure);
        assert_eq!(increments_until_crossed(&mut counter, &pressure, 5000), Some(1000));
    }

    #[test]
    fn test_double_pressure_doubles_the_wait() {
        let pressure = MemoryPressure::new(2.0, 1000);
        let mut counter = ExecutionCounter::new();
        counter.set_new_threshold(1000, &pressure);

        for _ in 0..999 {
            assert!(!counter.tick());
        }
        assert!(counter.tick());
        assert!(!counter.check_if_threshold_crossed_and_set(&pressure));

        let extra = increments_until_crossed(&mut counter, &pressure, 5000).unwrap();
        let total = 1000 + extra;
        // Slack is half of min(threshold, checkpoint cap)
        assert!((1500..=2000).contains(&total), "crossed after {}", total);
    }
}

mod watchpoints {
    use super::*;
    use pretty_assertions::assert_eq;

    struct Observer {
        fired: Cell<u32>,
    }

    impl Watchpoint for Observer {
        fn fire(&self) {
            self.fired.set(self.fired.get() + 1);
        }
    }

    fn observer() -> Rc<Observer> {
        Rc::new(Observer { fired: Cell::new(0) })
    }

    #[test]
    fn test_three_observers_fire_once_and_late_add_fires_immediately() {
        let mut set = WatchpointSet::new();
        let observers: Vec<_> = (0..3).map(|_| observer()).collect();
        for o in &observers {
            set.add(o.clone());
        }
        assert!(set.is_watched());

        assert_eq!(set.notify_write(), 3);
        assert!(set.has_fired());
        for o in &observers {
            assert_eq!(o.fired.get(), 1);
        }

        let late = observer();
        set.add(late.clone());
        assert_eq!(late.fired.get(), 1);
        assert!(set.is_empty());

        assert_eq!(set.notify_write(), 0);
        for o in observers.iter().chain(std::iter::once(&late)) {
            assert_eq!(o.fired.get(), 1);
        }
    }

    #[test]
    fn test_start_watching_without_observers() {
        let mut set = WatchpointSet::new();
        set.notify_write();
        assert!(!set.has_fired());
        set.start_watching();
        set.notify_write();
        assert!(set.has_fired());
    }
}

mod exit_profile {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_add_dedups_and_membership_is_idempotent() {
        let mut profile = ExitProfile::new();
        let site = FrequentExitSite::new(12, ExitKind::BadCache);
        assert!(profile.add(site));
        assert!(!profile.add(site));
        assert!(profile.has_exit_site(site));
        assert!(!profile.has_exit_site(FrequentExitSite::new(12, ExitKind::Overflow)));
        assert_eq!(profile.len(), 1);
    }
}
