//! End-to-end propagation through the scheduler boundary.

use std::sync::{Arc, Barrier};
use std::thread;

use assert_matches::assert_matches;
use labelscope_core::{Capability, ContextId, LabelError, LabelValue, Lookup, Override};
use labelscope_runtime::{
    ContextHooks, HostCapabilities, LabeledTask, Registry, RegistryConfig, RunNotifications,
};

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn bound() -> Registry {
    let reg = Registry::new(RegistryConfig::default());
    assert!(reg.bind_host(HostCapabilities::full()));
    reg
}

fn text(reg: &Registry, key: &str) -> Option<String> {
    reg.cur_labels()
        .unwrap()
        .get(key)
        .value()
        .and_then(LabelValue::as_str)
        .map(str::to_owned)
}

/// Run `work` as context `ctx`, bracketed the way the bundled adapters do.
fn run_as<R>(reg: &Registry, ctx: ContextId, work: impl FnOnce() -> R) -> R {
    reg.on_before_run(ctx);
    let out = work();
    reg.on_after_run(ctx);
    out
}

/// Create a context from whatever is running now.
fn spawn(reg: &Registry) -> ContextId {
    let child = reg.next_context_id();
    reg.on_create(child, reg.current_context());
    child
}

// ─────────────────────────────────────────────────────────────────────────────
// Scoped application
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn single_scope_applies_then_restores() {
    let reg = bound();
    reg.with_labels([("a", "1")], || {
        assert_eq!(text(&reg, "a").as_deref(), Some("1"));
        assert_eq!(reg.cur_labels().unwrap().len(), 1);
    })
    .unwrap();
    assert!(reg.cur_labels().unwrap().is_empty());
}

#[test]
fn nested_scope_shadows_then_unwinds() {
    let reg = bound();
    reg.with_labels([("a", "1")], || {
        reg.with_labels([("a", "2")], || {
            assert_eq!(text(&reg, "a").as_deref(), Some("2"));
        })
        .unwrap();
        assert_eq!(text(&reg, "a").as_deref(), Some("1"));
    })
    .unwrap();
}

#[test]
fn missing_capability_leaves_other_registries_alone() {
    let working = bound();
    let before = working
        .with_label("a", "1", || working.cur_labels().unwrap())
        .unwrap();

    let broken = Registry::new(RegistryConfig::default());
    let err = broken.with_labels([("a", "1")], || ()).unwrap_err();
    assert_matches!(
        err,
        LabelError::CapabilityMissing {
            capability: Capability::ContextTracking,
            ..
        }
    );

    assert_eq!(before.get("a").value(), Some(&LabelValue::from("1")));
    assert!(working.cur_labels().unwrap().is_empty());
}

#[test]
fn absent_and_unset_are_distinct() {
    let reg = bound();
    reg.with_labels([("gone", Override::Delete)], || {
        let labels = reg.cur_labels().unwrap();
        assert_eq!(labels.get("gone"), Lookup::Absent);
        assert_eq!(labels.get("never"), Lookup::Unset);
        assert!(labels.materialize().is_empty());
    })
    .unwrap();
}

// ─────────────────────────────────────────────────────────────────────────────
// Inheritance
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn child_snapshots_labels_at_creation() {
    let reg = bound();
    let parent = spawn(&reg);
    let child = run_as(&reg, parent, || {
        reg.with_label("req", "r1", || spawn(&reg)).unwrap()
    });

    // The parent's scope has ended, the child still carries the snapshot.
    assert!(reg.labels_of(parent).unwrap().is_empty());
    run_as(&reg, child, || {
        assert_eq!(text(&reg, "req").as_deref(), Some("r1"));
    });

    // Later changes in the parent do not reach an existing child.
    run_as(&reg, parent, || {
        reg.with_label("req", "r2", || {
            run_as(&reg, child, || assert_eq!(text(&reg, "req").as_deref(), Some("r1")));
        })
        .unwrap();
    });
}

#[test]
fn siblings_are_isolated() {
    let reg = bound();
    let a = spawn(&reg);
    let b = spawn(&reg);
    run_as(&reg, a, || {
        reg.with_label("who", "a", || {
            run_as(&reg, b, || {
                assert_eq!(reg.cur_labels().unwrap().get("who"), Lookup::Unset);
            });
            assert_eq!(text(&reg, "who").as_deref(), Some("a"));
        })
        .unwrap();
    });
}

#[test]
fn deleted_key_stays_absent_in_descendants() {
    let reg = bound();
    let parent = spawn(&reg);
    let child = run_as(&reg, parent, || {
        reg.with_label("tenant", "acme", || {
            reg.with_labels([("tenant", Override::Delete)], || spawn(&reg))
                .unwrap()
        })
        .unwrap()
    });
    assert_eq!(reg.labels_of(child).unwrap().get("tenant"), Lookup::Absent);
}

#[test]
fn before_each_resume_hosts_switch_contexts() {
    let reg = Registry::new(RegistryConfig::default());
    assert!(reg.bind_host(HostCapabilities {
        context_tracking: true,
        run_notifications: RunNotifications::BeforeEachResume,
    }));
    let a = spawn(&reg);
    let b = spawn(&reg);
    reg.on_before_run(a);
    reg.with_label("k", "a", || ()).unwrap();
    reg.on_before_run(b);
    assert_eq!(reg.current_context(), b);
    assert!(reg.cur_labels().unwrap().is_empty());
    reg.on_before_run(a);
    assert!(reg.cur_labels().unwrap().is_empty());
    assert_eq!(reg.stats().stale_events, 0);
}

#[test]
fn tasks_polled_on_different_threads_do_not_see_each_others_scopes() {
    let reg = Arc::new(bound());
    let paused = Barrier::new(2);
    let checked = Barrier::new(2);

    let inner = Arc::clone(&reg);
    let task_a = LabeledTask::new(Arc::clone(&reg), async {
        inner
            .with_label("who", "task-a", || {
                paused.wait();
                checked.wait();
                text(&inner, "who")
            })
            .unwrap()
    });
    let inner = Arc::clone(&reg);
    let task_b = LabeledTask::new(Arc::clone(&reg), async {
        paused.wait();
        let seen = Box::leak(Box::new(inner.cur_labels().unwrap())).get("who");
        checked.wait();
        seen
    });

    let (a_saw, b_saw) = thread::scope(|s| {
        let a = s.spawn(|| futures::executor::block_on(task_a));
        let b = s.spawn(|| futures::executor::block_on(task_b));
        (a.join().unwrap(), b.join().unwrap())
    });
    assert_eq!(a_saw.as_deref(), Some("task-a"));
    assert_eq!(b_saw, Lookup::Unset);
    assert_eq!(reg.stats().stale_events, 0);
    assert!(reg.labels_of(ContextId::ROOT).unwrap().is_empty());
}

// ─────────────────────────────────────────────────────────────────────────────
// Resources
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn create_destroy_cycles_do_not_leak() {
    let reg = bound();
    let baseline = reg.stats();
    let parent = spawn(&reg);
    run_as(&reg, parent, || {
        reg.with_label("job", "batch", || {
            for _ in 0..10_000 {
                let child = spawn(&reg);
                run_as(&reg, child, || {
                    reg.with_label("step", 1, || ()).unwrap();
                });
                reg.on_destroy(child);
            }
        })
        .unwrap();
    });
    reg.on_destroy(parent);

    let stats = reg.stats();
    assert_eq!(stats.live, baseline.live);
    assert_eq!(stats.published, baseline.published);
    assert_eq!(stats.created, 10_001);
    assert_eq!(stats.destroyed, 10_001);
    assert_eq!(stats.stale_events, 0);
    assert!(stats.retired <= reg.config().retire_depth);
}

#[test]
fn dedup_shares_identical_scopes() {
    let reg = bound();
    let first = reg.with_label("k", "v", || reg.cur_labels().unwrap()).unwrap();
    let second = reg.with_label("k", "v", || reg.cur_labels().unwrap()).unwrap();
    assert!(first.ptr_eq(&second));
    assert!(reg.stats().interned >= 1);
}

#[test]
fn snapshot_lists_live_contexts() {
    let reg = bound();
    let child = spawn(&reg);
    run_as(&reg, child, || {
        reg.with_labels([("tenant", LabelValue::from("acme")), ("retry", LabelValue::from(2))], || {
            insta::assert_json_snapshot!(reg.snapshot(), @r#"
            [
              {
                "context": 1,
                "parent": null,
                "published": true,
                "labels": {}
              },
              {
                "context": 2,
                "parent": 1,
                "published": true,
                "labels": {
                  "retry": 2.0,
                  "tenant": "acme"
                }
              }
            ]
            "#);
        })
        .unwrap();
    });
}

// ─────────────────────────────────────────────────────────────────────────────
// Adapters
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn spawned_tasks_carry_labels_from_spawn_site() {
    let reg = Arc::new(bound());
    let handles: Vec<_> = ["eu", "us"]
        .into_iter()
        .map(|region| {
            let inner = Arc::clone(&reg);
            let task = reg
                .with_label("region", region, || {
                    LabeledTask::new(Arc::clone(&reg), async move {
                        tokio::task::yield_now().await;
                        inner.cur_labels().unwrap()
                    })
                })
                .unwrap();
            tokio::spawn(task)
        })
        .collect();

    let mut regions = Vec::new();
    for handle in handles {
        let labels = handle.await.unwrap();
        regions.push(labels.get("region").value().cloned());
    }
    assert_eq!(
        regions,
        [Some(LabelValue::from("eu")), Some(LabelValue::from("us"))]
    );
    assert_eq!(reg.stats().live, 1);
}

#[tokio::test]
async fn async_scope_wraps_each_poll() {
    let reg = Arc::new(bound());
    let inner = Arc::clone(&reg);
    let seen = labelscope_runtime::asynchronous::with_label(
        Arc::clone(&reg),
        "phase",
        "io",
        async move {
            tokio::task::yield_now().await;
            inner.cur_labels().unwrap()
        },
    )
    .await
    .unwrap();
    assert_eq!(seen.get("phase").value(), Some(&LabelValue::from("io")));
    assert!(reg.cur_labels().unwrap().is_empty());
}

// ─────────────────────────────────────────────────────────────────────────────
// External reader
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(target_os = "linux")]
mod surface {
    use labelscope_runtime::{ProcMemory, SurfaceReader};

    use super::*;

    #[test]
    fn reader_sees_running_context_labels() {
        let reg = bound();
        let ctx = spawn(&reg);
        run_as(&reg, ctx, || {
            reg.with_labels([("tenant", "acme"), ("route", "/orders")], || {
                let reader =
                    SurfaceReader::attach(ProcMemory::current().unwrap(), reg.header_addr()).unwrap();

                let current = reader.current().unwrap();
                assert_eq!(current.context, Some(ctx));
                let keys: Vec<&str> = current.labels.iter().map(|l| &*l.key).collect();
                assert_eq!(keys, ["route", "tenant"]);

                let by_id = reader.labels_for(ctx).unwrap();
                assert_eq!(by_id, current.labels);

                let ids: Vec<ContextId> = reader.contexts().unwrap().into_iter().map(|(id, _)| id).collect();
                assert!(ids.contains(&ContextId::ROOT));
                assert!(ids.contains(&ctx));
            })
            .unwrap();
        });
    }

    #[test]
    fn reader_misses_destroyed_context() {
        let reg = bound();
        let ctx = spawn(&reg);
        reg.on_destroy(ctx);
        let reader = SurfaceReader::attach(ProcMemory::current().unwrap(), reg.header_addr()).unwrap();
        assert_matches!(
            reader.labels_for(ctx),
            Err(labelscope_core::SurfaceError::NotFound(id)) if id == ctx
        );
    }
}
