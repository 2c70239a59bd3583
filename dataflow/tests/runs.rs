//! End-to-end runs over a scripted process runner.
//!
//! Programs are written as pipeline documents; the scripted runner records
//! every request and creates (or withholds) the expected outputs.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use dataflow::core::program::Program;
use dataflow::core::value::Value;
use dataflow::engine::{RunReport, TaskStatus, VarState};
use dataflow::io::config::EngineConfig;
use dataflow::test_support::{Script, ScriptedRunner, scripted_engine, test_config};
use serde_json::json;

fn program(doc: serde_json::Value) -> Program {
    serde_json::from_value(doc).expect("program")
}

/// App `name` with one file output and optional file input, passing both
/// paths on its command line.
fn app(name: &str, input: Option<&str>) -> serde_json::Value {
    let mut inputs = Vec::new();
    let mut arguments = vec![json!({"str": name})];
    if let Some(input) = input {
        inputs.push(json!({"name": "in", "type": input}));
        arguments.push(json!({"var": "in"}));
    }
    arguments.push(json!({"filename": "out"}));
    json!({
        "name": name,
        "outputs": [{"name": "out", "type": "txt"}],
        "inputs": inputs,
        "body": {"app": {"executable": name, "arguments": arguments}}
    })
}

fn call(output: &str, procedure: &str, args: &[&str]) -> serde_json::Value {
    let args: Vec<_> = args.iter().map(|arg| json!({"value": {"var": arg}})).collect();
    json!({"call": {"outputs": [{"name": output}], "procedure": procedure, "args": args}})
}

fn declare(name: &str, ty: &str) -> serde_json::Value {
    json!({"declare": {"name": name, "type": ty}})
}

fn run_with(config: EngineConfig, runner: &Arc<ScriptedRunner>, doc: serde_json::Value) -> RunReport {
    scripted_engine(config, Arc::clone(runner))
        .run(&program(doc), &BTreeMap::new())
        .expect("run")
}

fn run(work_dir: &Path, runner: &Arc<ScriptedRunner>, doc: serde_json::Value) -> RunReport {
    run_with(test_config(work_dir), runner, doc)
}

fn status<'a>(report: &'a RunReport, label: &'a str) -> &'a TaskStatus {
    &report
        .tasks_labelled(label)
        .next()
        .unwrap_or_else(|| panic!("no task labelled {label}"))
        .status
}

fn chain() -> serde_json::Value {
    json!({
        "types": ["txt"],
        "procedures": [app("align", None), app("count", Some("txt")), app("report", Some("txt"))],
        "main": [
            declare("aligned", "txt"),
            declare("counts", "txt"),
            declare("summary", "txt"),
            call("summary", "report", &["counts"]),
            call("counts", "count", &["aligned"]),
            call("aligned", "align", &[])
        ]
    })
}

#[test]
fn chained_apps_run_in_dependency_order() {
    let temp = tempfile::tempdir().expect("tempdir");
    let runner = Arc::new(ScriptedRunner::new());
    let report = run(temp.path(), &runner, chain());

    assert!(report.succeeded(), "{:?}", report.failure);
    let order: Vec<String> = runner.requests().into_iter().map(|r| r.task).collect();
    assert_eq!(order, vec!["align", "count", "report"]);

    let summary = report.value("summary").expect("summary resolved");
    let Value::File(path) = summary else {
        panic!("summary is not a file: {summary:?}");
    };
    let contents = fs::read_to_string(path).expect("read summary");
    assert!(contents.starts_with("report "));
}

#[test]
fn no_task_starts_before_its_inputs_settle() {
    let temp = tempfile::tempdir().expect("tempdir");
    let runner = Arc::new(ScriptedRunner::new().script("count", Script::Sleep(Duration::from_millis(30))));
    let report = run(temp.path(), &runner, chain());

    assert!(report.succeeded());
    for task in &report.tasks {
        for input in &task.inputs {
            let settled = report.var(*input).settled.expect("input settled");
            assert!(
                settled <= task.started,
                "{} started at {:?} before {} settled at {settled:?}",
                task.label,
                task.started,
                report.var(*input).name
            );
        }
    }
}

#[test]
fn failure_propagates_to_every_downstream_variable() {
    let temp = tempfile::tempdir().expect("tempdir");
    let runner = Arc::new(ScriptedRunner::new().script("align", Script::Fail("exit status 3".into())));
    let config = EngineConfig {
        fail_fast: false,
        ..test_config(temp.path())
    };
    let report = run_with(config, &runner, chain());

    assert!(!report.succeeded());
    assert_eq!(report.failure.as_ref().map(|e| e.kind()), Some("process_failure"));
    assert_eq!(runner.requests().len(), 1);
    assert!(matches!(status(&report, "align"), TaskStatus::Failed(_)));
    assert!(matches!(status(&report, "count"), TaskStatus::UpstreamFailed(_)));
    for name in ["aligned", "counts", "summary"] {
        let var = report.variable(name).expect("variable");
        assert!(
            matches!(&var.state, VarState::Failed(err) if err.kind() == "process_failure"),
            "{name}: {:?}",
            var.state
        );
    }
}

#[test]
fn missing_expected_output_fails_the_task() {
    let temp = tempfile::tempdir().expect("tempdir");
    let runner = Arc::new(ScriptedRunner::new().script("align", Script::SkipOutputs));
    let report = run(temp.path(), &runner, chain());

    match status(&report, "align") {
        TaskStatus::Failed(err) => assert!(err.to_string().contains("was not created"), "{err}"),
        other => panic!("expected failure, got {other:?}"),
    }
}

fn independent_pair() -> serde_json::Value {
    json!({
        "types": ["txt"],
        "procedures": [app("bad", None), app("slow", None)],
        "main": [
            declare("a", "txt"),
            declare("b", "txt"),
            call("a", "bad", &[]),
            call("b", "slow", &[])
        ]
    })
}

#[test]
fn fail_fast_cancels_running_siblings() {
    let temp = tempfile::tempdir().expect("tempdir");
    let runner = Arc::new(
        ScriptedRunner::new()
            .script("bad", Script::Fail("boom".into()))
            .script("slow", Script::Sleep(Duration::from_secs(30))),
    );
    let report = run(temp.path(), &runner, independent_pair());

    assert!(report.elapsed < Duration::from_secs(10));
    assert!(matches!(status(&report, "bad"), TaskStatus::Failed(_)));
    assert_eq!(status(&report, "slow"), &TaskStatus::Cancelled);
    let b = report.variable("b").expect("b");
    assert_eq!(b.state, VarState::Failed(dataflow::error::EngineError::Cancelled));
}

#[test]
fn keep_going_finishes_independent_work() {
    let temp = tempfile::tempdir().expect("tempdir");
    let runner = Arc::new(
        ScriptedRunner::new()
            .script("bad", Script::Fail("boom".into()))
            .script("slow", Script::Sleep(Duration::from_millis(50))),
    );
    let config = EngineConfig {
        fail_fast: false,
        ..test_config(temp.path())
    };
    let report = run_with(config, &runner, independent_pair());

    assert!(!report.succeeded());
    assert_eq!(status(&report, "slow"), &TaskStatus::Succeeded);
    assert!(matches!(report.value("b"), Some(Value::File(_))));
}

#[test]
fn task_timeout_settles_outputs_as_timed_out() {
    let temp = tempfile::tempdir().expect("tempdir");
    let runner = Arc::new(ScriptedRunner::new().script("align", Script::Sleep(Duration::from_secs(30))));
    let config = EngineConfig {
        task_timeout_secs: 1,
        ..test_config(temp.path())
    };
    let report = run_with(config, &runner, chain());

    assert!(report.elapsed < Duration::from_secs(10));
    assert_eq!(report.failure.as_ref().map(|e| e.kind()), Some("timed_out"));
    assert!(matches!(
        &report.variable("aligned").expect("aligned").state,
        VarState::Failed(err) if err.kind() == "timed_out"
    ));
}

#[test]
fn untaken_guard_contributes_no_tasks() {
    let temp = tempfile::tempdir().expect("tempdir");
    let runner = Arc::new(ScriptedRunner::new());
    let doc = json!({
        "types": ["txt"],
        "procedures": [app("align", None)],
        "main": [
            {"foreach": {"var": "adjustBias", "over": {"array": [{"str": "true"}]}, "body": [
                {"foreach": {"var": "useWeights", "over": {"array": [{"str": "false"}]}, "body": [
                    {"if": {
                        "cond": {"not": {"and": [
                            {"eq": [{"var": "adjustBias"}, {"str": "true"}]},
                            {"ne": [{"var": "useWeights"}, {"str": "gc"}]}
                        ]}},
                        "then": [declare("stats", "txt"), call("stats", "align", &[])]
                    }}
                ]}}
            ]}}
        ]
    });
    let report = run(temp.path(), &runner, doc);

    assert!(report.succeeded());
    assert!(report.tasks.is_empty(), "{:?}", report.tasks);
    assert!(runner.requests().is_empty());
}

#[test]
fn deferred_guard_runs_only_the_taken_branch() {
    let temp = tempfile::tempdir().expect("tempdir");
    let runner = Arc::new(ScriptedRunner::new());
    let doc = json!({
        "types": ["txt"],
        "procedures": [app("align", None), app("skip", None)],
        "main": [
            {"declare": {"name": "flag", "type": "string", "init": {"read_data": {"write_data": {"str": "gc"}}}}},
            {"if": {
                "cond": {"eq": [{"var": "flag"}, {"str": "gc"}]},
                "then": [declare("a", "txt"), call("a", "align", &[])],
                "else": [declare("b", "txt"), call("b", "skip", &[])]
            }}
        ]
    });
    let report = run(temp.path(), &runner, doc);

    assert!(report.succeeded(), "{:?}", report.failure);
    assert_eq!(runner.requests_for("align").len(), 1);
    assert!(runner.requests_for("skip").is_empty());
    assert_eq!(report.tasks_labelled("if").count(), 1);
}

#[test]
fn deferred_foreach_fills_an_array_element_by_element() {
    let temp = tempfile::tempdir().expect("tempdir");
    let runner = Arc::new(ScriptedRunner::new());
    let doc = json!({
        "main": [
            {"declare": {"name": "names", "type": "string", "init": {"read_data": {"write_data": {"str": "a b c"}}}}},
            {"declare": {"name": "entries", "type": "string[]", "init": {"strsplit": {"text": {"var": "names"}, "pattern": {"str": "\\s"}}}}},
            declare("full", "string[]"),
            {"foreach": {"var": "entry", "index": "i", "over": {"var": "entries"}, "body": [
                {"assign": {
                    "target": {"name": "full", "index": {"var": "i"}},
                    "value": {"strcat": [{"str": "/data/"}, {"var": "entry"}]}
                }}
            ]}},
            {"trace": {"args": [{"join": {"array": {"var": "full"}, "separator": {"str": ","}}}]}}
        ]
    });
    let report = run(temp.path(), &runner, doc);

    assert!(report.succeeded(), "{:?}", report.failure);
    assert_eq!(
        report.value("full"),
        Some(&Value::Array(vec![
            Value::str("/data/a"),
            Value::str("/data/b"),
            Value::str("/data/c"),
        ]))
    );
    assert_eq!(report.traces, vec!["/data/a,/data/b,/data/c"]);
    assert_eq!(report.tasks_labelled("foreach").count(), 1);
}

#[test]
fn foreach_instances_keep_their_own_causal_order() {
    let temp = tempfile::tempdir().expect("tempdir");
    let runner = Arc::new(ScriptedRunner::new().script("align", Script::Sleep(Duration::from_millis(10))));
    let doc = json!({
        "types": ["txt"],
        "procedures": [app("align", None), app("count", Some("txt"))],
        "main": [
            declare("counts", "txt[]"),
            {"foreach": {"var": "sample", "index": "i", "over": {"array": [{"int": 1}, {"int": 2}, {"int": 3}, {"int": 4}]}, "body": [
                declare("aligned", "txt"),
                call("aligned", "align", &[]),
                {"call": {
                    "outputs": [{"name": "counts", "index": {"var": "i"}}],
                    "procedure": "count",
                    "args": [{"value": {"var": "aligned"}}]
                }}
            ]}}
        ]
    });
    let report = run(temp.path(), &runner, doc);

    assert!(report.succeeded(), "{:?}", report.failure);
    let aligns: Vec<_> = report.tasks_labelled("align").collect();
    let counts: Vec<_> = report.tasks_labelled("count").collect();
    assert_eq!((aligns.len(), counts.len()), (4, 4));
    for count in &counts {
        let producer = aligns
            .iter()
            .find(|align| align.outputs == count.inputs)
            .expect("each count reads one align output");
        assert!(producer.finished <= count.started);
    }
    let Some(Value::Array(items)) = report.value("counts") else {
        panic!("counts did not resolve");
    };
    assert_eq!(items.len(), 4);
}

#[test]
fn concurrent_mapping_never_collides() {
    let temp = tempfile::tempdir().expect("tempdir");
    let runner = Arc::new(ScriptedRunner::new());
    let items: Vec<_> = (0..100).map(|i| json!({"int": i})).collect();
    let doc = json!({
        "types": ["tsv"],
        "procedures": [{
            "name": "stats",
            "outputs": [{"name": "out", "type": "tsv"}],
            "body": {"app": {"executable": "goby", "arguments": [{"filename": "out"}]}}
        }],
        "main": [
            {"foreach": {"var": "k", "over": {"array": items}, "body": [
                {"declare": {
                    "name": "part",
                    "type": "tsv",
                    "mapping": {"concurrent": {"prefix": {"str": "part"}, "suffix": {"str": ".tsv"}}}
                }},
                call("part", "stats", &[])
            ]}}
        ]
    });
    let report = run(temp.path(), &runner, doc);

    assert!(report.succeeded(), "{:?}", report.failure);
    let paths: HashSet<_> = runner
        .requests()
        .into_iter()
        .flat_map(|request| request.expected_outputs)
        .collect();
    assert_eq!(paths.len(), 100);
    assert!(paths.iter().all(|path| path.starts_with(&report.run_dir)));
}

#[test]
fn two_live_fixed_mappings_of_one_path_collide() {
    let temp = tempfile::tempdir().expect("tempdir");
    let runner = Arc::new(ScriptedRunner::new());
    let doc = json!({
        "types": ["txt"],
        "procedures": [app("align", None)],
        "main": [
            {"declare": {"name": "a", "type": "txt", "mapping": {"fixed": {"name": {"str": "out.txt"}}}}},
            {"declare": {"name": "b", "type": "txt", "mapping": {"fixed": {"name": {"str": "out.txt"}}}}},
            call("a", "align", &[]),
            call("b", "align", &[])
        ]
    });
    let err = scripted_engine(test_config(temp.path()), Arc::clone(&runner))
        .run(&program(doc), &BTreeMap::new())
        .unwrap_err();

    assert_eq!(err.kind(), "mapping_collision");
    assert!(runner.requests().is_empty());
}

#[test]
fn stale_fixed_output_is_removed_before_the_producer_runs() {
    let temp = tempfile::tempdir().expect("tempdir");
    fs::write(temp.path().join("out.txt"), "stale").expect("write stale");
    let runner = Arc::new(ScriptedRunner::new().script("align", Script::SkipOutputs));
    let doc = json!({
        "types": ["txt"],
        "procedures": [app("align", None)],
        "main": [
            {"declare": {"name": "a", "type": "txt", "mapping": {"fixed": {"name": {"str": "out.txt"}}}}},
            call("a", "align", &[])
        ]
    });
    let report = run(temp.path(), &runner, doc);

    assert!(matches!(status(&report, "align"), TaskStatus::Failed(_)));
    assert!(!temp.path().join("out.txt").exists());
}

#[test]
fn weighted_tasks_share_the_memory_budget() {
    let temp = tempfile::tempdir().expect("tempdir");
    let runner = Arc::new(ScriptedRunner::new().script("heavy", Script::Sleep(Duration::from_millis(40))));
    let doc = json!({
        "types": ["txt"],
        "procedures": [{
            "name": "heavy",
            "outputs": [{"name": "out", "type": "txt"}],
            "body": {"app": {"executable": "goby", "arguments": [{"filename": "out"}], "resource": "3g"}}
        }],
        "main": [
            {"foreach": {"var": "k", "over": {"array": [{"int": 1}, {"int": 2}, {"int": 3}, {"int": 4}]}, "body": [
                declare("out", "txt"),
                call("out", "heavy", &[])
            ]}}
        ]
    });
    let config = EngineConfig {
        memory_budget: "4g".to_string(),
        ..test_config(temp.path())
    };
    let report = run_with(config, &runner, doc);

    assert!(report.succeeded());
    let tasks: Vec<_> = report.tasks_labelled("heavy").collect();
    for a in &tasks {
        let overlapping = tasks
            .iter()
            .filter(|b| b.id != a.id && b.started < a.finished && a.started < b.finished)
            .count();
        assert_eq!(overlapping, 0, "{} overlapped another heavy task", a.id);
    }
}

#[test]
fn parameters_come_from_values_and_defaults() {
    let temp = tempfile::tempdir().expect("tempdir");
    let runner = Arc::new(ScriptedRunner::new());
    let doc = json!({
        "params": [
            {"name": "group", "type": "string"},
            {"name": "mode", "type": "string", "default": {"str": "gc"}}
        ],
        "main": [
            {"declare": {"name": "label", "type": "string", "init": {"strcat": [{"var": "group"}, {"str": "-"}, {"var": "mode"}]}}}
        ]
    });
    let engine = scripted_engine(test_config(temp.path()), Arc::clone(&runner));
    let params = BTreeMap::from([("group".to_string(), "HBR".to_string())]);
    let report = engine.run(&program(doc.clone()), &params).expect("run");
    assert_eq!(report.value("label"), Some(&Value::str("HBR-gc")));

    let err = engine.run(&program(doc.clone()), &BTreeMap::new()).unwrap_err();
    assert_eq!(err.kind(), "invalid_program");
    let unknown = BTreeMap::from([
        ("group".to_string(), "HBR".to_string()),
        ("grop".to_string(), "x".to_string()),
    ]);
    assert!(engine.run(&program(doc), &unknown).is_err());
}

#[test]
fn conditional_producer_read_outside_its_branch_is_rejected() {
    let temp = tempfile::tempdir().expect("tempdir");
    let runner = Arc::new(ScriptedRunner::new());
    let doc = json!({
        "params": [{"name": "flag", "type": "boolean"}],
        "main": [
            declare("x", "string"),
            {"if": {"cond": {"var": "flag"}, "then": [{"assign": {"target": {"name": "x"}, "value": {"str": "y"}}}]}},
            {"trace": {"args": [{"var": "x"}]}}
        ]
    });
    let params = BTreeMap::from([("flag".to_string(), "false".to_string())]);
    let err = scripted_engine(test_config(temp.path()), runner)
        .run(&program(doc), &params)
        .unwrap_err();

    assert_eq!(err.kind(), "dependency");
    assert!(err.to_string().contains("conditional"));
}
