//! End-to-end conversion of synthetic captures.

use std::collections::BTreeMap;

use opstats::{
    ConvertOptions, EventMetadata, ExecutorConfig, HOST_THREADS_PLANE_NAME, HardwareKind,
    IDLE_OP_NAME, ModuleInfo, OpStats, StatValue, Stats, TraceEvent, TraceLine, TracePlane,
    TfFunctionCompiler, TfFunctionExecutionMode, TraceSpace, XLA_MODULE_LINE_NAME,
    XLA_OP_LINE_NAME, convert_trace_space_to_op_stats, find_capture_files, stat,
};

const STEP_META: u64 = 1;
const OP_META: u64 = 2;
const MODULE_META: u64 = 3;

fn metadata_table(op_name: &str) -> BTreeMap<u64, EventMetadata> {
    let entry = |id: u64, name: &str, stats: Stats| {
        (
            id,
            EventMetadata {
                id,
                name: name.to_string(),
                display_name: None,
                stats,
                child_ids: Vec::new(),
            },
        )
    };
    BTreeMap::from([
        entry(STEP_META, "train_step", Stats::new()),
        entry(
            OP_META,
            op_name,
            Stats::from([
                (stat::PROGRAM_ID.to_string(), StatValue::Int(1)),
                (stat::SYMBOL_ID.to_string(), StatValue::Int(1)),
                (stat::HLO_CATEGORY.to_string(), StatValue::Str("convolution".to_string())),
            ]),
        ),
        entry(MODULE_META, "jit_train", Stats::new()),
    ])
}

fn event(metadata_id: u64, offset_ps: u64, duration_ps: u64, group_id: Option<i64>) -> TraceEvent {
    let mut stats = Stats::new();
    if let Some(group_id) = group_id {
        stats.insert(stat::GROUP_ID.to_string(), StatValue::Int(group_id));
    }
    TraceEvent {
        metadata_id,
        offset_ps,
        duration_ps,
        num_occurrences: None,
        stats,
    }
}

fn line(id: u64, name: &str, events: Vec<TraceEvent>) -> TraceLine {
    TraceLine {
        id,
        name: name.to_string(),
        timestamp_ns: 0,
        events,
    }
}

/// A TensorCore plane with one 100 ps step per group id, starting at
/// `group_id * 100`, each holding one 50 ps op.
fn tpu_plane(id: u32, device: u32, group_ids: &[i64], core_details: Option<&str>) -> TracePlane {
    let mut stats = Stats::new();
    if let Some(details) = core_details {
        stats.insert(stat::CORE_DETAILS.to_string(), StatValue::Str(details.to_string()));
    }
    let begin = |g: i64| g as u64 * 100;
    let steps = group_ids.iter().map(|g| event(STEP_META, begin(*g), 100, Some(*g))).collect();
    let ops = group_ids
        .iter()
        .map(|g| event(OP_META, begin(*g) + 10, 50, Some(*g)))
        .collect();
    let module_span = match (group_ids.first(), group_ids.last()) {
        (Some(first), Some(last)) => {
            let span_ps = begin(*last) + 100 - begin(*first);
            vec![event(MODULE_META, begin(*first), span_ps, None)]
        }
        _ => Vec::new(),
    };
    TracePlane {
        id,
        name: format!("/device:TPU:{device}"),
        stats,
        event_metadata: metadata_table("fusion.1"),
        lines: vec![
            line(0, "Steps", steps),
            line(1, XLA_MODULE_LINE_NAME, module_span),
            line(2, XLA_OP_LINE_NAME, ops),
        ],
    }
}

fn convert(space: &TraceSpace, worker_threads: usize) -> OpStats {
    let executor = ExecutorConfig {
        worker_threads: Some(worker_threads),
        ..ExecutorConfig::default()
    };
    convert_trace_space_to_op_stats(space, &ConvertOptions::default(), &executor).expect("convert")
}

fn step_nums(stats: &OpStats) -> Vec<i64> {
    stats.step_db.step_sequence.iter().map(|s| s.step_num).collect()
}

fn tpu_space() -> TraceSpace {
    TraceSpace {
        hostnames: vec!["tpu-host".to_string()],
        planes: vec![
            tpu_plane(1, 0, &[1, 2], Some(r#"{"local_chip_id":0,"core_num":0}"#)),
            tpu_plane(2, 1, &[2, 3], Some(r#"{"local_chip_id":0,"core_num":1}"#)),
        ],
        modules: vec![ModuleInfo {
            program_id: 1,
            name: "jit_train".to_string(),
            instructions: Vec::new(),
        }],
        ..TraceSpace::default()
    }
}

#[test]
fn tpu_steps_intersect_across_cores() {
    let stats = convert(&tpu_space(), 2);
    assert_eq!(stats.run_environment.hardware_kind, Some(HardwareKind::Tpu));
    assert_eq!(step_nums(&stats), vec![2]);

    let step = &stats.step_db.step_sequence[0];
    assert_eq!(step.begin_ps, 200);
    assert_eq!(step.duration_ps, 100);
    assert_eq!(step.core_ids, vec![1, 2]);

    let complete = stats
        .hlo_metrics_db_complete_steps_only
        .find(1, "fusion.1")
        .expect("op in complete steps");
    assert_eq!(complete.occurrences, 2);
    assert_eq!(complete.num_cores, 2);
    assert_eq!(stats.program_id_to_name_map.get(&1).map(String::as_str), Some("jit_train"));
}

#[test]
fn tpu_device_table_and_duty_cycle() {
    let stats = convert(&tpu_space(), 2);
    let device = &stats.device_op_metrics_db;
    let op = device.find(1, "fusion.1").expect("op");
    assert_eq!(op.occurrences, 4);
    assert_eq!(op.time_ps, 200);
    assert_eq!(op.category_str(), "convolution");
    // Each plane spans 150 ps of ops with 100 ps attributed.
    assert_eq!(device.total_time_ps, 300);
    assert_eq!(device.total_op_time_ps, 200);
    assert_eq!(device.find(0, IDLE_OP_NAME).expect("idle").time_ps, 100);

    // Both cores sit on chip 0: ops cover [110,160), [210,260) and [310,360)
    // of the module span [100,400).
    assert_eq!(device.duty_cycle_busy_ps, 150);
    assert_eq!(device.duty_cycle_idle_ps, 150);
    assert_eq!(stats.core_id_to_details.len(), 2);
    assert_eq!(stats.core_id_to_details[&2].hostname, "tpu-host");
    assert!(stats.diagnostics.warnings.is_empty());
}

#[test]
fn missing_core_details_degrade_to_chip_totals() {
    let space = TraceSpace {
        planes: vec![
            tpu_plane(1, 0, &[1, 2], Some(r#"{"local_chip_id":0}"#)),
            tpu_plane(2, 1, &[1, 2], None),
        ],
        ..TraceSpace::default()
    };
    let stats = convert(&space, 2);
    assert_eq!(stats.diagnostics.warnings.len(), 1);
    assert!(
        stats
            .diagnostics
            .warnings
            .iter()
            .any(|w| w.contains("/device:TPU:1"))
    );
    assert_eq!(stats.core_id_to_details.len(), 1);
    // Chip-level fallback adds the second plane's totals instead of unioning.
    assert_eq!(stats.device_op_metrics_db.duty_cycle_busy_ps, 200);
    assert_eq!(step_nums(&stats), vec![1, 2]);
}

#[test]
fn empty_device_plane_yields_empty_tables() {
    let space = TraceSpace {
        planes: vec![TracePlane {
            id: 1,
            name: "/device:TPU:0".to_string(),
            ..TracePlane::default()
        }],
        ..TraceSpace::default()
    };
    let stats = convert(&space, 1);
    assert!(stats.device_op_metrics_db.is_empty());
    assert!(stats.step_db.is_empty());
    assert_eq!(stats.run_environment.device_core_count, 1);
}

const SGEMM_LAUNCH: &str = "regs:64 static_shared:0 dynamic_shared:0 grid:4,1,1 block:256,1,1";

fn gpu_plane(id: u32, groups: &[(i64, u64)]) -> TracePlane {
    let kernel = EventMetadata {
        id: 1,
        name: "ampere_sgemm_128x64".to_string(),
        display_name: None,
        stats: Stats::from([(
            stat::KERNEL_DETAILS.to_string(),
            StatValue::Str(SGEMM_LAUNCH.to_string()),
        )]),
        child_ids: Vec::new(),
    };
    let events = groups
        .iter()
        .map(|(group_id, begin)| {
            let mut e = event(1, *begin, 50_000, Some(*group_id));
            e.stats
                .insert(stat::TF_OP.to_string(), StatValue::Str("dense/MatMul:MatMul".to_string()));
            e
        })
        .collect();
    TracePlane {
        id,
        name: format!("/device:GPU:{id}"),
        stats: Stats::from([(
            stat::DEV_CAP_GPU_MODEL.to_string(),
            StatValue::Str("NVIDIA A100".to_string()),
        )]),
        event_metadata: BTreeMap::from([(1, kernel)]),
        lines: vec![line(0, "Stream #1", events)],
    }
}

#[test]
fn gpu_steps_union_across_devices() {
    let space = TraceSpace {
        hostnames: vec!["gpu-host".to_string()],
        planes: vec![
            gpu_plane(0, &[(1, 0), (2, 100_000)]),
            gpu_plane(1, &[(2, 120_000), (3, 200_000)]),
        ],
        ..TraceSpace::default()
    };
    let stats = convert(&space, 2);
    assert_eq!(stats.run_environment.device_type, "NVIDIA A100");
    assert_eq!(stats.run_environment.device_core_count, 2);
    assert_eq!(step_nums(&stats), vec![1, 2, 3]);
    assert_eq!(stats.step_db.step_sequence[1].duration_ps, 70_000);

    let reports = &stats.kernel_stats_db.reports;
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].occurrences, 4);
    assert_eq!(reports[0].total_duration_ns, 200);
    assert_eq!(reports[0].key.op_name, "dense/MatMul:MatMul");
    assert!(reports[0].is_op_tensor_core_eligible);

    let matmul = stats.device_op_metrics_db.find(0, "dense/MatMul").expect("matmul");
    assert_eq!(matmul.occurrences, 4);
    assert_eq!(stats.device_op_metrics_db.precision_stats.compute_32bit_ps, 200_000);
    assert!(stats.core_id_to_details.contains_key(&0));
}

#[test]
fn overlapping_gpu_streams_keep_their_op_metrics() {
    let mut plane = gpu_plane(0, &[(1, 0), (2, 100_000)]);
    let overlapping = plane.lines[0].events.clone();
    plane.lines.push(line(1, "Stream #2", overlapping));
    let space = TraceSpace {
        hostnames: vec!["gpu-host".to_string()],
        planes: vec![plane],
        ..TraceSpace::default()
    };
    let stats = convert(&space, 2);
    assert!(stats.diagnostics.errors.is_empty(), "{:?}", stats.diagnostics.errors);

    let device = &stats.device_op_metrics_db;
    let matmul = device.find(0, "dense/MatMul").expect("matmul");
    assert_eq!(matmul.occurrences, 4);
    assert_eq!(matmul.time_ps, 200_000);
    // Each stream spans 150 ns.
    assert_eq!(device.total_time_ps, 300_000);
    assert_eq!(device.total_op_time_ps, 200_000);
    assert_eq!(stats.kernel_stats_db.reports[0].occurrences, 4);
}

#[test]
fn host_only_capture_takes_steps_from_host() {
    let names = BTreeMap::from([
        (
            1,
            EventMetadata {
                id: 1,
                name: "TraceContext".to_string(),
                ..EventMetadata::default()
            },
        ),
        (
            2,
            EventMetadata {
                id: 2,
                name: "model/dense/MatMul:MatMul".to_string(),
                ..EventMetadata::default()
            },
        ),
    ]);
    let host = TracePlane {
        id: 0,
        name: HOST_THREADS_PLANE_NAME.to_string(),
        stats: Stats::from([(
            stat::MATRIX_UNIT_UTILIZATION_PERCENT.to_string(),
            StatValue::Double(42.5),
        )]),
        event_metadata: names,
        lines: vec![line(
            0,
            "main",
            vec![
                event(1, 0, 100, Some(1)),
                event(2, 10, 30, Some(1)),
                event(1, 100, 100, Some(2)),
            ],
        )],
    };
    let space = TraceSpace {
        planes: vec![host],
        ..TraceSpace::default()
    };
    let stats = convert(&space, 1);
    assert_eq!(stats.run_environment.device_type, "CPU");
    assert_eq!(step_nums(&stats), vec![1, 2]);
    assert_eq!(stats.matrix_unit_utilization_percent, Some(42.5));
    let matmul = stats.host_op_metrics_db.find(0, "model/dense/MatMul").expect("matmul");
    assert_eq!(matmul.self_time_ps, 30);
    assert_eq!(stats.host_op_metrics_db.total_time_ps, 200);
}

fn function_call(offset_ps: u64, duration_ps: u64, mode: &str) -> TraceEvent {
    let mut e = event(1, offset_ps, duration_ps, None);
    e.stats
        .insert(stat::TF_FUNCTION_CALL.to_string(), StatValue::Str(mode.to_string()));
    e.stats
        .insert(stat::TF_FUNCTION_TRACING_COUNT.to_string(), StatValue::Int(1));
    e
}

#[test]
fn function_calls_and_framework_rollup_reach_the_report() {
    let host = TracePlane {
        id: 0,
        name: HOST_THREADS_PLANE_NAME.to_string(),
        stats: Stats::new(),
        event_metadata: BTreeMap::from([(
            1,
            EventMetadata {
                id: 1,
                name: "train_step".to_string(),
                ..EventMetadata::default()
            },
        )]),
        lines: vec![
            line(0, "python", vec![function_call(0, 100, "traced-xla")]),
            line(1, "python-2", vec![function_call(0, 300, "notTraced-nonXla")]),
        ],
    };
    let space = TraceSpace {
        hostnames: vec!["gpu-host".to_string()],
        planes: vec![gpu_plane(0, &[(1, 0), (2, 100_000)]), host],
        ..TraceSpace::default()
    };
    let stats = convert(&space, 2);

    let train = &stats.tf_function_db.functions["train_step"];
    assert_eq!(train.compiler, TfFunctionCompiler::Mixed);
    assert_eq!(train.metrics[&TfFunctionExecutionMode::Traced].self_time_ps, 100);
    assert_eq!(train.metrics[&TfFunctionExecutionMode::NotTraced].count, 1);
    assert!((train.expensive_call_percent - 25.0).abs() < 1e-9);

    let framework = &stats.framework_op_metrics_db;
    let matmul = framework.find(0, "dense/MatMul").expect("framework matmul");
    assert_eq!(matmul.category_str(), "MatMul");
    assert_eq!(matmul.occurrences, 2);
    assert_eq!(matmul.time_ps, 100_000);
    assert!(framework.find(0, IDLE_OP_NAME).is_some());
    assert_eq!(framework.total_time_ps, stats.device_op_metrics_db.total_time_ps);
}

#[test]
fn reports_are_reproducible() {
    let space = tpu_space();
    let first = convert(&space, 1);
    let second = convert(&space, 4);
    assert_eq!(first.fingerprint().expect("fp"), second.fingerprint().expect("fp"));
    assert_eq!(first.to_json().expect("json"), second.to_json().expect("json"));
}

#[test]
fn captures_round_trip_through_disk() {
    let dir = std::env::temp_dir().join(format!("opstats-pipeline-{}", uuid::Uuid::new_v4()));
    let space = tpu_space();
    space
        .write_json(&dir.join("run.xspace.json"))
        .expect("write capture");

    let found = find_capture_files(&[dir.to_string_lossy().to_string()]).expect("find");
    assert_eq!(found.len(), 1);
    let loaded = TraceSpace::read_json(&found[0]).expect("read capture");
    assert_eq!(
        convert(&loaded, 2).fingerprint().expect("fp"),
        convert(&space, 2).fingerprint().expect("fp")
    );
    let _ = std::fs::remove_dir_all(&dir);
}
