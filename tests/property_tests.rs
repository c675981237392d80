//! Randomised properties of the JIT core, driven by seeded `StdRng`s

mod common;
use common::shaped_object;
use quicksilver_jit::assembler::isa::decode_branch;
use quicksilver_jit::assembler::{CodeBuffer, Condition, Instruction, JitCompilationEffort, Label, Linker};
use quicksilver_jit::executable::{CodeOwner, ExecutablePool};
use quicksilver_jit::ic::{next_state, AccessObservation, StubKind, StubState};
use quicksilver_jit::profile::{ExecutionCounter, MemoryPressure};
use quicksilver_jit::structure::StructureTable;
use quicksilver_jit::watchpoint::{Watchpoint, WatchpointSet};
use quicksilver_jit::JitOptions;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cell::Cell;
use std::rc::Rc;

const SEEDS: u64 = 32;

mod branch_compaction {
    use super::*;

    struct Emitted {
        site: Label,
        target: Label,
        cond: Condition,
    }

    fn random_code(rng: &mut StdRng) -> (CodeBuffer, Vec<Emitted>) {
        let mut buffer = CodeBuffer::new();
        let labels: Vec<Label> = (0..rng.gen_range(1..24)).map(|_| buffer.new_label()).collect();
        let mut bound = vec![false; labels.len()];
        let mut emitted = Vec::new();

        for _ in 0..rng.gen_range(1..80) {
            let padding = if rng.gen_bool(0.1) {
                rng.gen_range(120..600)
            } else {
                rng.gen_range(0..12)
            };
            for _ in 0..padding {
                buffer.emit(Instruction::Nop);
            }

            let target = labels[rng.gen_range(0..labels.len())];
            let cond = match rng.gen_range(0..3) {
                0 => Condition::Always,
                1 => Condition::Equal,
                _ => Condition::Below,
            };
            let site = if rng.gen_bool(0.1) {
                buffer.patchable_branch(cond, target).unwrap()
            } else {
                let site = buffer.here();
                buffer.branch(cond, target).unwrap();
                site
            };
            emitted.push(Emitted { site, target, cond });

            if rng.gen_bool(0.4) {
                let free: Vec<usize> = (0..labels.len()).filter(|&i| !bound[i]).collect();
                if let Some(&i) = free.get(rng.gen_range(0..free.len().max(1))) {
                    buffer.bind(labels[i]);
                    bound[i] = true;
                }
            }
        }
        for (i, label) in labels.iter().enumerate() {
            if !bound[i] {
                buffer.bind(*label);
            }
        }
        buffer.emit(Instruction::Return);
        (buffer, emitted)
    }

    #[test]
    fn test_every_branch_reaches_its_label() {
        let pool = ExecutablePool::new(&JitOptions::default());
        let linker = Linker::new(&pool);
        for seed in 0..SEEDS {
            let mut rng = StdRng::seed_from_u64(seed);
            let (buffer, emitted) = random_code(&mut rng);
            let code = linker
                .finalize(buffer, CodeOwner::Thunk, JitCompilationEffort::MustSucceed)
                .unwrap()
                .unwrap();
            assert!(code.size() <= code.unlinked_size());

            let bytes = code.region().bytes();
            for branch in &emitted {
                let offset = code.offset_of(branch.site).unwrap();
                let decoded = decode_branch(&bytes[offset..])
                    .unwrap_or_else(|| panic!("seed {}: no branch at {:#x}", seed, offset));
                assert_eq!(decoded.cond, branch.cond, "seed {}", seed);
                let address = code.address_of(branch.site).unwrap() as u64;
                let expected = code.address_of(branch.target).unwrap() as u64;
                assert_eq!(decoded.resolve(address), expected, "seed {} branch at {:#x}", seed, offset);
            }
        }
    }

    #[test]
    fn test_compaction_never_grows_code() {
        let pool = ExecutablePool::new(&JitOptions::default());
        for seed in 0..SEEDS {
            let mut rng = StdRng::seed_from_u64(seed ^ 0xC0DE);
            let (buffer, _) = random_code(&mut rng);
            let plain = buffer.clone();
            let compacted = Linker::new(&pool)
                .finalize(buffer, CodeOwner::Thunk, JitCompilationEffort::MustSucceed)
                .unwrap()
                .unwrap();
            let uncompacted = Linker::new(&pool)
                .with_compaction(false)
                .finalize(plain, CodeOwner::Thunk, JitCompilationEffort::MustSucceed)
                .unwrap()
                .unwrap();
            assert!(compacted.size() <= uncompacted.size(), "seed {}", seed);
        }
    }
}

mod watchpoint_firing {
    use super::*;

    struct Observer {
        fired: Cell<u32>,
    }

    impl Watchpoint for Observer {
        fn fire(&self) {
            self.fired.set(self.fired.get() + 1);
        }
    }

    #[test]
    fn test_every_observer_fires_at_most_once() {
        for seed in 0..SEEDS {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut set = WatchpointSet::new();
            let mut observers: Vec<Rc<Observer>> = Vec::new();
            let mut fired = false;

            for _ in 0..rng.gen_range(1..60) {
                match rng.gen_range(0..10) {
                    0..=5 => {
                        let observer = Rc::new(Observer { fired: Cell::new(0) });
                        set.add(observer.clone());
                        if fired {
                            // Late observers are notified synchronously
                            assert_eq!(observer.fired.get(), 1, "seed {}", seed);
                        }
                        observers.push(observer);
                    }
                    6 => set.start_watching(),
                    _ => {
                        let was_watched = set.is_watched();
                        set.notify_write();
                        fired |= was_watched;
                    }
                }
                for observer in &observers {
                    assert!(observer.fired.get() <= 1, "seed {}", seed);
                }
            }

            set.start_watching();
            set.notify_write();
            for observer in &observers {
                assert_eq!(observer.fired.get(), 1, "seed {}", seed);
            }
        }
    }
}

mod ic_ratchet {
    use super::*;

    #[test]
    fn test_never_returns_to_unset_and_generic_is_terminal() {
        for seed in 0..SEEDS {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut table = StructureTable::new();
            let objects: Vec<_> = (0..rng.gen_range(1..12))
                .map(|id| shaped_object(&mut table, id))
                .collect();
            let max = rng.gen_range(2..8);

            let mut state = StubState::Unset;
            let mut left_unset = false;
            let mut generic = false;
            for _ in 0..100 {
                let object = &objects[rng.gen_range(0..objects.len())];
                // Occasionally read a missing property
                let name = if rng.gen_bool(0.05) { "missing" } else { "x" };
                state = next_state(&state, &AccessObservation::for_get(object, name), max);

                let kind = state.kind();
                if left_unset {
                    assert_ne!(kind, StubKind::Unset, "seed {}", seed);
                }
                if generic {
                    assert_eq!(kind, StubKind::Generic, "seed {}", seed);
                }
                left_unset |= kind != StubKind::Unset;
                generic |= kind == StubKind::Generic;
                assert!(state.case_count() < max, "seed {}", seed);
            }
        }
    }
}

mod counter_convergence {
    use super::*;

    #[test]
    fn test_threshold_always_reached_with_bounded_overshoot() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let threshold = rng.gen_range(1..20_000);
            let multiplier = rng.gen_range(1.0..6.0);
            let cap = rng.gen_range(1..2_000);
            let pressure = MemoryPressure::new(multiplier, cap);

            let mut counter = ExecutionCounter::new();
            counter.set_new_threshold(threshold, &pressure);
            let limit = (threshold as f64 * multiplier) as u64 + cap as u64 + 1;
            let mut crossed_after = None;
            for i in 1..=limit {
                if counter.tick() && counter.check_if_threshold_crossed_and_set(&pressure) {
                    crossed_after = Some(i);
                    break;
                }
            }
            let crossed_after = crossed_after
                .unwrap_or_else(|| panic!("threshold {} x{} cap {} never crossed", threshold, multiplier, cap));
            assert!(crossed_after <= limit);
        }
    }
}
