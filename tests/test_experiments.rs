use funnelab::experiments::{
    assignment, ExperimentUpdate, NewExperiment, NewVariant, OptimizationGoal,
};
use funnelab::{
    ExperimentError, ExperimentRepository, ExperimentService, ExperimentStatus,
    FileExperimentRepository,
};
use std::sync::Arc;
use tempfile::TempDir;

const FUNNEL: &str = "spring-sale";

fn file_service(tmp: &TempDir) -> ExperimentService<FileExperimentRepository> {
    ExperimentService::new(FileExperimentRepository::new(tmp.path()).unwrap())
}

fn new_experiment(name: &str) -> NewExperiment {
    NewExperiment {
        name: name.to_string(),
        original_step_id: "landing-v1".to_string(),
        goal: Some(OptimizationGoal::Conversion),
        ..Default::default()
    }
}

fn new_variant(name: &str, step: &str) -> NewVariant {
    NewVariant {
        name: name.to_string(),
        step_id: step.to_string(),
        weight: None,
    }
}

fn running(svc: &ExperimentService<FileExperimentRepository>, id: &str) {
    svc.update_experiment(
        FUNNEL,
        id,
        ExperimentUpdate {
            status: Some(ExperimentStatus::Running),
            ..Default::default()
        },
    )
    .unwrap();
}

#[test]
fn add_variant_then_get_round_trips_through_file_store() {
    let tmp = TempDir::new().unwrap();
    let svc = file_service(&tmp);
    let exp = svc.create_experiment(FUNNEL, new_experiment("Hero")).unwrap();
    let before = svc.get_experiment(FUNNEL, &exp.id).unwrap();

    svc.add_variant(FUNNEL, &exp.id, new_variant("B", "landing-v2"))
        .unwrap();

    // A fresh repository instance reads the same document back.
    let reopened = file_service(&tmp);
    let after = reopened.get_experiment(FUNNEL, &exp.id).unwrap();
    assert_eq!(after.variants.len(), before.variants.len() + 1);
    assert_eq!(after.total_weight(), 100);
    assert_eq!(after.variants[1].step_id, "landing-v2");
}

#[test]
fn full_lifecycle_auto_detects_winner_then_operator_completes() {
    let tmp = TempDir::new().unwrap();
    let svc = file_service(&tmp);
    let exp = svc
        .create_experiment(
            FUNNEL,
            NewExperiment {
                minimum_sample_size: Some(500),
                ..new_experiment("Checkout copy")
            },
        )
        .unwrap();
    let exp = svc
        .add_variant(FUNNEL, &exp.id, new_variant("B", "landing-v2"))
        .unwrap();
    running(&svc, &exp.id);
    let (control, b) = (exp.variants[0].id.clone(), exp.variants[1].id.clone());

    for i in 0..1000 {
        svc.record_impression(FUNNEL, &exp.id, &control).unwrap();
        svc.record_impression(FUNNEL, &exp.id, &b).unwrap();
        if i < 100 {
            svc.record_conversion(FUNNEL, &exp.id, &control, Some(10.0))
                .unwrap();
        }
        if i < 140 {
            svc.record_conversion(FUNNEL, &exp.id, &b, Some(10.0))
                .unwrap();
        }
    }

    let results = svc.get_results(FUNNEL, &exp.id).unwrap();
    assert_eq!(results.total_impressions, 2000);
    assert_eq!(results.total_conversions, 240);
    assert!((results.overall_conversion_rate - 12.0).abs() < 1e-9);
    let winner = results.winner().expect("variant B should win");
    assert_eq!(winner.variant_id, b);
    assert_eq!(winner.confidence, 99);
    assert!((winner.improvement - 40.0).abs() < 1e-9);
    assert!((winner.revenue_per_visitor - 1.4).abs() < 1e-9);

    let done = svc.declare_winner(FUNNEL, &exp.id, &b).unwrap();
    assert_eq!(done.status, ExperimentStatus::Completed);
    assert!(done.start_date.is_some());
    assert!(done.end_date.unwrap() >= done.start_date.unwrap());
}

#[test]
fn manual_winner_ignores_statistics() {
    let tmp = TempDir::new().unwrap();
    let svc = file_service(&tmp);
    let exp = svc.create_experiment(FUNNEL, new_experiment("Tiny")).unwrap();
    let exp = svc
        .add_variant(FUNNEL, &exp.id, new_variant("B", "landing-v2"))
        .unwrap();
    let b = exp.variants[1].id.clone();
    svc.record_impression(FUNNEL, &exp.id, &b).unwrap();

    let done = svc.declare_winner(FUNNEL, &exp.id, &b).unwrap();
    assert_eq!(done.status, ExperimentStatus::Completed);
    assert_eq!(done.winner_variant_id, Some(b));
    assert!(svc.get_results(FUNNEL, &exp.id).unwrap().winner().is_none());
}

#[test]
fn traffic_on_deleted_experiment_never_errors() {
    let tmp = TempDir::new().unwrap();
    let svc = file_service(&tmp);
    let exp = svc.create_experiment(FUNNEL, new_experiment("Gone")).unwrap();
    let control = exp.variants[0].id.clone();
    assert!(svc.delete_experiment(FUNNEL, &exp.id).unwrap());

    assert!(!svc.record_impression(FUNNEL, &exp.id, &control).unwrap());
    assert!(!svc
        .record_conversion(FUNNEL, &exp.id, &control, Some(99.0))
        .unwrap());
    assert!(svc.assign_visitor(FUNNEL, &exp.id).unwrap().is_none());
    assert!(matches!(
        svc.get_results(FUNNEL, &exp.id),
        Err(ExperimentError::NotFound(_))
    ));
}

#[test]
fn weighted_routing_follows_configured_split() {
    let tmp = TempDir::new().unwrap();
    let svc = file_service(&tmp);
    let exp = svc.create_experiment(FUNNEL, new_experiment("Split")).unwrap();
    let exp = svc
        .add_variant(FUNNEL, &exp.id, new_variant("B", "landing-v2"))
        .unwrap();
    let (a, b) = (exp.variants[0].id.clone(), exp.variants[1].id.clone());
    let exp = svc
        .set_variant_weights(FUNNEL, &exp.id, &[(a.clone(), 30), (b, 70)])
        .unwrap();

    let n = 10_000;
    let hits = (0..n)
        .filter(|_| assignment::select_variant(&exp).map(|v| v.id.as_str()) == Some(a.as_str()))
        .count();
    let ratio = hits as f64 / n as f64;
    assert!((0.27..=0.33).contains(&ratio), "ratio was {}", ratio);
}

#[test]
fn experiments_are_isolated_per_funnel() {
    let tmp = TempDir::new().unwrap();
    let svc = file_service(&tmp);
    svc.create_experiment("funnel-a", new_experiment("A")).unwrap();
    svc.create_experiment("funnel-b", new_experiment("B")).unwrap();
    svc.create_experiment("funnel-b", new_experiment("B2")).unwrap();
    assert_eq!(svc.list_experiments("funnel-a", None).unwrap().len(), 1);
    assert_eq!(svc.list_experiments("funnel-b", None).unwrap().len(), 2);
    assert_eq!(
        svc.repository().funnel_ids().unwrap(),
        vec!["funnel-a".to_string(), "funnel-b".to_string()]
    );
}

#[test]
fn concurrent_writers_on_file_store_keep_every_increment() {
    let tmp = TempDir::new().unwrap();
    let svc = Arc::new(file_service(&tmp));
    let exp = svc.create_experiment(FUNNEL, new_experiment("Busy")).unwrap();
    let control = exp.variants[0].id.clone();

    std::thread::scope(|s| {
        for _ in 0..4 {
            let svc = Arc::clone(&svc);
            let (exp_id, control) = (exp.id.clone(), control.clone());
            s.spawn(move || {
                for _ in 0..25 {
                    // A lost race is retried; an exhausted retry budget surfaces as Conflict.
                    loop {
                        match svc.record_impression(FUNNEL, &exp_id, &control) {
                            Ok(_) => break,
                            Err(ExperimentError::Conflict(_)) => continue,
                            Err(e) => panic!("unexpected error: {}", e),
                        }
                    }
                }
            });
        }
    });

    let stored = svc.repository().load_experiments(FUNNEL).unwrap();
    assert_eq!(stored.experiments[0].variants[0].impressions, 100);
}

#[test]
fn separate_repositories_on_one_directory_keep_every_increment() {
    let tmp = TempDir::new().unwrap();
    let exp = file_service(&tmp)
        .create_experiment(FUNNEL, new_experiment("Shared dir"))
        .unwrap();
    let control = exp.variants[0].id.clone();
    let per_writer = 200;

    let acknowledged: usize = std::thread::scope(|s| {
        let handles: Vec<_> = (0..2)
            .map(|_| {
                // Each writer opens its own repository, like a second process would.
                let svc = file_service(&tmp);
                let (exp_id, control) = (exp.id.clone(), control.clone());
                s.spawn(move || {
                    let mut ok = 0usize;
                    for _ in 0..per_writer {
                        loop {
                            match svc.record_impression(FUNNEL, &exp_id, &control) {
                                Ok(true) => {
                                    ok += 1;
                                    break;
                                }
                                Ok(false) => panic!("experiment vanished"),
                                Err(ExperimentError::Conflict(_)) => continue,
                                Err(e) => panic!("unexpected error: {}", e),
                            }
                        }
                    }
                    ok
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).sum()
    });

    assert_eq!(acknowledged, 2 * per_writer);
    let stored = file_service(&tmp).get_experiment(FUNNEL, &exp.id).unwrap();
    assert_eq!(stored.variants[0].impressions, acknowledged as u64);
}
