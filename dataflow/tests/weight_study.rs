//! The weight-study pipeline: real `tr` for string replacement, a scripted
//! stand-in for the genomics tool.
#![cfg(unix)]

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dataflow::engine::Engine;
use dataflow::error::EngineError;
use dataflow::io::config::EngineConfig;
use dataflow::io::invoker::{ProcessRequest, ProcessRunner, SystemRunner};
use dataflow::io::pipeline::load_pipeline;
use dataflow::test_support::{Script, ScriptedRunner, test_config};

struct MixedRunner {
    system: SystemRunner,
    goby: ScriptedRunner,
}

impl ProcessRunner for MixedRunner {
    fn run(
        &self,
        request: &ProcessRequest,
        is_cancelled: &dyn Fn() -> bool,
    ) -> Result<(), EngineError> {
        if request.program == "tr" {
            self.system.run(request, is_cancelled)
        } else {
            self.goby.run(request, is_cancelled)
        }
    }
}

fn pipeline_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../pipelines/weight-study.json")
}

#[test]
fn weight_study_runs_every_combination() {
    let temp = tempfile::tempdir().expect("tempdir");
    let program = load_pipeline(&pipeline_path()).expect("load pipeline");
    let runner = Arc::new(MixedRunner {
        system: SystemRunner::default(),
        goby: ScriptedRunner::new().script(
            "alignment_to_annotation_counts",
            Script::Sleep(Duration::from_millis(20)),
        ),
    });
    let config = EngineConfig {
        memory_budget: "8g".to_string(),
        ..test_config(temp.path())
    };
    let engine = Engine::new(config)
        .with_runner(Arc::clone(&runner) as Arc<dyn ProcessRunner>)
        .with_trace_sink(Arc::new(|_: &str| {}));

    let report = engine.run(&program, &BTreeMap::new()).expect("run");
    assert!(report.succeeded(), "{:?}", report.failure);

    let requests = runner.goby.requests_for("alignment_to_annotation_counts");
    assert_eq!(requests.len(), 8);
    for request in &requests {
        assert!(
            request
                .args
                .contains(&"/data/helicos-ILM-SOLID/DLTTEJH-Bullard-HBR-SRR037439.entries".to_string()),
            "{:?}",
            request.args
        );
        assert!(request.args.contains(&"/data/helicos-ILM-SOLID/UMTVLVQ-helicos-brain.entries".to_string()));
        assert!(request.args.contains(&"Bullard-ILM-HBR/Helicos-HBR".to_string()));
    }
    let combos: HashSet<(String, String)> = requests
        .iter()
        .map(|request| {
            let after = |flag: &str| {
                let at = request.args.iter().position(|arg| arg == flag).expect("flag");
                request.args[at + 1].clone()
            };
            (after("--use-weights"), after("--adjust-gc-bias"))
        })
        .collect();
    assert_eq!(combos.len(), 8);

    // One trace per combination, naming the concurrent-mapped stats file.
    assert_eq!(report.traces.len(), 8);
    let traced: HashSet<&String> = report.traces.iter().collect();
    assert_eq!(traced.len(), 8);
    assert!(
        report
            .traces
            .iter()
            .any(|line| line.contains("Bullard-ILM-HBR-Helicos-HBR-gc-formula2-") && line.ends_with(".tsv"))
    );

    // 3g each within an 8g budget: never more than two at once.
    let heavy: Vec<_> = report.tasks_labelled("alignment_to_annotation_counts").collect();
    for task in &heavy {
        let running = heavy
            .iter()
            .filter(|other| other.started <= task.started && task.started < other.finished)
            .count();
        assert!(running <= 2, "{} started with {running} heavy tasks running", task.id);
    }
}
