mod common;

use std::time::{Duration, Instant};

use serde_json::json;

use bauklank_engine::scheduler::{CONFIG_DEBOUNCE, LEAD_SECS, RAMP_SECS};
use bauklank_engine::{
    ConfigValues, ControlError, ControlValues, EngineOp, EngineParam, EngineScheduler, ParamValue,
    Schedule, StoredControls, TestEngine,
};

use common::{loaded_scheduler, loaded_scheduler_with_capacity, settle, slot, MemoryStore};

#[test]
fn volume_percent_clamps_and_garbage_leaves_it_alone() {
    let (mut scheduler, engine) = loaded_scheduler("A", 1.0, 30.0);
    let now = Instant::now();

    assert_eq!(scheduler.apply_incoming_set("volumePercent", &json!(20), now), Ok(true));
    assert_eq!(scheduler.controls().volume, 0.2);
    assert_eq!(scheduler.apply_incoming_set("volumePercent", &json!(150), now), Ok(true));
    assert_eq!(scheduler.controls().volume, 1.0);

    assert!(matches!(
        scheduler.apply_incoming_set("volumePercent", &json!("abc"), now),
        Err(ControlError::NotFinite { .. })
    ));
    assert_eq!(scheduler.controls().volume, 1.0);

    settle(&scheduler);
    assert_eq!(engine.schedules().len(), 2);
}

#[test]
fn tone_alias_clamps_and_schedules_once() {
    let (mut scheduler, engine) = loaded_scheduler("A", 2.0, 30.0);

    assert_eq!(scheduler.apply_incoming_set("tone", &json!(30), Instant::now()), Ok(true));
    assert_eq!(scheduler.controls().semitones, 24);

    settle(&scheduler);
    assert_eq!(
        engine.operations(),
        vec![EngineOp::Schedule(Schedule::At {
            param: EngineParam::Semitones,
            value: ParamValue::Scalar(24.0),
            time: 2.0 + LEAD_SECS,
        })]
    );
}

#[test]
fn repeated_value_schedules_nothing() {
    let (mut scheduler, engine) = loaded_scheduler("A", 0.0, 30.0);
    let now = Instant::now();
    assert_eq!(scheduler.apply_incoming_set("rate", &json!(0.5), now), Ok(true));
    assert_eq!(scheduler.apply_incoming_set("rate", &json!("0.5"), now), Ok(false));
    settle(&scheduler);
    assert_eq!(engine.schedules().len(), 1);
}

#[test]
fn loop_bounds_are_clamped_and_swapped() {
    let (mut scheduler, engine) = loaded_scheduler("A", 0.0, 10.0);
    assert_eq!(
        (scheduler.controls().loop_start, scheduler.controls().loop_end),
        (0.0, 10.0)
    );
    let now = Instant::now();

    scheduler.apply_incoming_set("loopStart", &json!(5), now).unwrap();
    scheduler.apply_incoming_set("loopEnd", &json!(2), now).unwrap();
    assert_eq!(
        (scheduler.controls().loop_start, scheduler.controls().loop_end),
        (2.0, 5.0)
    );

    scheduler.apply_incoming_set("loopEnd", &json!(400), now).unwrap();
    assert_eq!(scheduler.controls().loop_end, 10.0);

    settle(&scheduler);
    let last = engine.schedules().pop().unwrap();
    assert_eq!(
        last,
        Schedule::At {
            param: EngineParam::Loop,
            value: ParamValue::Region { start: 2.0, end: 10.0 },
            time: LEAD_SECS,
        }
    );
}

#[test]
fn shorter_source_pulls_the_loop_in() {
    let (mut scheduler, engine) = loaded_scheduler("A", 0.0, 10.0);
    scheduler.apply_incoming_set("loopStart", &json!(6), Instant::now()).unwrap();
    settle(&scheduler);
    engine.clear();

    scheduler.set_duration(4.0);
    assert_eq!(
        (scheduler.controls().loop_start, scheduler.controls().loop_end),
        (4.0, 4.0)
    );
    settle(&scheduler);
    assert_eq!(engine.schedules().len(), 1);

    scheduler.set_duration(8.0);
    settle(&scheduler);
    assert_eq!(engine.schedules().len(), 1, "loop already fits");
}

#[test]
fn volume_ramps_from_the_sounding_value() {
    let (mut scheduler, engine) = loaded_scheduler("A", 10.0, 30.0);
    let now = Instant::now();

    scheduler.apply_incoming_set("volume", &json!(50), now).unwrap();
    settle(&scheduler);
    assert_eq!(
        engine.schedules(),
        vec![Schedule::Ramp {
            param: EngineParam::Volume,
            from: 1.0,
            to: 0.5,
            start_time: 10.0,
            end_time: 10.0 + RAMP_SECS,
        }]
    );

    // Halfway through the ramp the engine is at 0.75.
    engine.set_time(10.0 + RAMP_SECS / 2.0);
    settle(&scheduler);
    scheduler.apply_incoming_set("volume", &json!(0), now).unwrap();
    settle(&scheduler);

    match engine.schedules().last().unwrap() {
        Schedule::Ramp { from, to, .. } => {
            assert!((from - 0.75).abs() < 1e-9, "ramp started at {}", from);
            assert_eq!(*to, 0.0);
        }
        other => panic!("expected a ramp, got {:?}", other),
    }
}

#[test]
fn pan_ramps_and_other_controls_lead() {
    let (mut scheduler, engine) = loaded_scheduler("A", 5.0, 30.0);
    let now = Instant::now();
    scheduler.apply_incoming_set("pan", &json!(75), now).unwrap();
    scheduler.apply_incoming_set("active", &json!(0), now).unwrap();
    settle(&scheduler);

    let schedules = engine.schedules();
    assert!(matches!(
        schedules[0],
        Schedule::Ramp { param: EngineParam::Pan, from, to, .. } if from == 0.0 && to == 0.5
    ));
    assert_eq!(
        schedules[1],
        Schedule::At {
            param: EngineParam::Active,
            value: ParamValue::Flag(false),
            time: 5.0 + LEAD_SECS,
        }
    );
}

#[test]
fn config_changes_are_coalesced() {
    let (mut scheduler, engine) = loaded_scheduler("A", 0.0, 30.0);
    let t0 = Instant::now();

    scheduler.apply_incoming_set("blockMs", &json!(64), t0).unwrap();
    scheduler
        .apply_incoming_set("overlap", &json!(2), t0 + Duration::from_millis(10))
        .unwrap();
    let last = t0 + Duration::from_millis(20);
    scheduler.apply_incoming_set("blockMs", &json!(80), last).unwrap();
    assert!(scheduler.config_pending());

    assert!(!scheduler.poll(t0 + CONFIG_DEBOUNCE));
    assert!(scheduler.poll(last + CONFIG_DEBOUNCE));
    assert!(!scheduler.poll(last + CONFIG_DEBOUNCE * 4));

    settle(&scheduler);
    assert_eq!(
        engine.configures(),
        vec![ConfigValues {
            block_ms: 80,
            overlap: 2,
            split_computation: false,
        }]
    );
    assert!(engine.schedules().is_empty());
}

#[test]
fn loading_a_source_retires_the_previous_engine_first() {
    let (mut scheduler, old) = loaded_scheduler("A", 0.0, 30.0);
    scheduler.apply_incoming_set("rate", &json!(0.5), Instant::now()).unwrap();
    assert_eq!(scheduler.generation(), 1);

    let new = TestEngine::new();
    new.set_time(0.25);
    assert!(scheduler.load_source(Box::new(new.clone()), 12.0));
    assert_eq!(scheduler.generation(), 2);
    settle(&scheduler);

    let old_ops = old.operations();
    assert_eq!(&old_ops[old_ops.len() - 2..], &[EngineOp::Stop, EngineOp::Disconnect]);

    // The replacement gets the whole slot state before anything else.
    let new_ops = new.operations();
    assert_eq!(new_ops[0], EngineOp::Configure(ConfigValues::default()));
    assert_eq!(new.schedules().len(), EngineParam::ALL.len());
    assert!(new.schedules().contains(&Schedule::At {
        param: EngineParam::Rate,
        value: ParamValue::Scalar(0.5),
        time: 0.25,
    }));
    assert!(new.schedules().contains(&Schedule::At {
        param: EngineParam::Loop,
        value: ParamValue::Region { start: 0.0, end: 12.0 },
        time: 0.25,
    }));
}

#[test]
fn sets_before_a_source_are_kept_for_it() {
    let mut scheduler = EngineScheduler::new(slot("B")).unwrap();
    assert!(!scheduler.is_loaded());
    scheduler
        .apply_incoming_set("formantBaseHz", &json!(5000), Instant::now())
        .unwrap();
    assert_eq!(scheduler.controls().formant_base_hz, 2000.0);

    let engine = TestEngine::new();
    scheduler.load_source(Box::new(engine.clone()), 3.0);
    settle(&scheduler);
    assert!(engine.schedules().contains(&Schedule::At {
        param: EngineParam::FormantBaseHz,
        value: ParamValue::Scalar(2000.0),
        time: 0.0,
    }));
}

#[test]
fn unload_stops_the_engine_and_later_loads_still_work() {
    let (mut scheduler, first) = loaded_scheduler("A", 0.0, 30.0);
    assert!(scheduler.unload());
    assert!(!scheduler.unload());
    scheduler.apply_incoming_set("rate", &json!(1.5), Instant::now()).unwrap();
    settle(&scheduler);
    assert_eq!(first.operations(), vec![EngineOp::Stop, EngineOp::Disconnect]);

    let second = TestEngine::new();
    assert!(scheduler.load_source(Box::new(second.clone()), 30.0));
    settle(&scheduler);
    assert!(second.schedules().contains(&Schedule::At {
        param: EngineParam::Rate,
        value: ParamValue::Scalar(1.5),
        time: 0.0,
    }));
    assert_eq!(scheduler.worker().stale(), 0);
}

#[test]
fn stored_state_is_sanitized_and_kept_current() {
    let store = MemoryStore::with(
        slot("A"),
        StoredControls {
            controls: ControlValues {
                rate: 0.5,
                volume: 7.0,
                ..ControlValues::default()
            },
            config: ConfigValues::default(),
        },
    );
    let mut scheduler = EngineScheduler::with_store(slot("A"), Box::new(store.clone())).unwrap();
    assert_eq!(scheduler.controls().rate, 0.5);
    assert_eq!(scheduler.controls().volume, 1.0);

    scheduler.apply_incoming_set("semitones", &json!(-7), Instant::now()).unwrap();
    scheduler.apply_incoming_set("nonsense", &json!(1), Instant::now()).unwrap_err();
    assert_eq!(store.saves(), 1);
    assert_eq!(store.get(slot("A")).unwrap().controls.semitones, -7);
}

#[test]
fn load_lands_even_when_the_queue_is_full() {
    let (mut scheduler, old) = loaded_scheduler_with_capacity("A", 4, 0.0, 30.0);
    old.set_delay(Duration::from_millis(40));
    let now = Instant::now();
    for i in 0..20 {
        scheduler
            .apply_incoming_set("rate", &json!(0.5 + i as f64 * 0.01), now)
            .unwrap();
    }
    assert!(scheduler.worker().dropped() > 0);

    let new = TestEngine::new();
    assert!(scheduler.load_source(Box::new(new.clone()), 30.0));
    assert_eq!(scheduler.generation(), 2);
    settle(&scheduler);

    let old_ops = old.operations();
    assert_eq!(&old_ops[old_ops.len() - 2..], &[EngineOp::Stop, EngineOp::Disconnect]);
    assert_eq!(new.configures().len(), 1);
    assert_eq!(new.schedules().len(), EngineParam::ALL.len());

    scheduler.apply_incoming_set("semitones", &json!(2), now).unwrap();
    settle(&scheduler);
    assert_eq!(new.schedules().len(), EngineParam::ALL.len() + 1);
}

#[test]
fn dropped_volume_ramp_does_not_move_the_sounding_value() {
    let (mut scheduler, engine) = loaded_scheduler_with_capacity("A", 1, 0.0, 30.0);
    engine.set_delay(Duration::from_millis(100));
    let now = Instant::now();

    // The first rate occupies the worker, the second fills the queue.
    scheduler.apply_incoming_set("rate", &json!(0.5), now).unwrap();
    scheduler.apply_incoming_set("rate", &json!(0.75), now).unwrap();
    scheduler.apply_incoming_set("volume", &json!(50), now).unwrap();
    assert!(scheduler.worker().dropped() >= 1);
    assert_eq!(scheduler.controls().volume, 0.5);

    settle(&scheduler);
    engine.set_delay(Duration::ZERO);
    engine.clear();

    scheduler.apply_incoming_set("volume", &json!(20), now).unwrap();
    settle(&scheduler);
    match engine.schedules().last().unwrap() {
        Schedule::Ramp { from, to, .. } => {
            assert_eq!(*from, 1.0);
            assert_eq!(*to, 0.2);
        }
        other => panic!("expected a ramp, got {:?}", other),
    }
}

#[test]
fn ramps_before_a_source_start_from_the_stored_value() {
    let mut scheduler = EngineScheduler::new(slot("A")).unwrap();
    scheduler.apply_incoming_set("pan", &json!(-1), Instant::now()).unwrap();

    let engine = TestEngine::new();
    scheduler.load_source(Box::new(engine.clone()), 10.0);
    settle(&scheduler);
    engine.clear();

    scheduler.apply_incoming_set("pan", &json!(0.5), Instant::now()).unwrap();
    settle(&scheduler);
    assert!(matches!(
        engine.schedules()[0],
        Schedule::Ramp { param: EngineParam::Pan, from, to, .. } if from == -1.0 && to == 0.5
    ));
}
