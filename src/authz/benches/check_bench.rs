//! Authorization check benchmarks
//!
//! Set `RUST_LOG=rbac_authz=debug` to trace the pipeline while profiling.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rbac_authz::{
    AuthEngine, CheckRequest, Condition, EngineConfig, InMemoryStorage, Operator, Permission, Resource, Role,
    User,
};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// Chain of `depth` roles, each granting one plain and one owner-conditioned permission
fn build_engine(config: EngineConfig, depth: usize) -> AuthEngine {
    let engine = AuthEngine::new(config, Arc::new(InMemoryStorage::new())).unwrap();
    let owner_only = Condition::builder()
        .when("resource.owner_id", Operator::Eq, "{{user.id}}")
        .build()
        .unwrap();

    for i in 0..depth {
        let plain = format!("doc:action-{}", i);
        let owned = format!("doc:owned-{}", i);
        engine
            .create_permission(Permission::new(plain.as_str(), format!("action{}", i), "doc"))
            .unwrap();
        engine
            .create_permission(
                Permission::new(owned.as_str(), format!("owned{}", i), "doc").with_conditions(owner_only.clone()),
            )
            .unwrap();

        let mut role = Role::new(format!("level-{}", i), format!("Level {}", i))
            .with_permission(plain)
            .with_permission(owned);
        if i > 0 {
            role = role.with_parent(format!("level-{}", i - 1));
        }
        engine.create_role(role).unwrap();
    }

    engine.create_user(User::new("alice")).unwrap();
    engine
        .assign_role("alice", &format!("level-{}", depth - 1), None, None)
        .unwrap();
    engine
}

fn bench_check(c: &mut Criterion) {
    init_tracing();

    let mut group = c.benchmark_group("check_permission");
    let doc = Resource::new("doc:1").with_attribute("owner_id", "alice");

    for depth in [1, 5, 20] {
        let uncached = build_engine(
            EngineConfig {
                enable_audit: false,
                ..EngineConfig::default().without_cache()
            },
            depth,
        );
        group.bench_with_input(BenchmarkId::new("uncached", depth), &depth, |b, _| {
            // Farthest ancestor's conditioned permission
            b.iter(|| black_box(uncached.check_permission("alice", "owned0", black_box(&doc), None)))
        });

        let cached = build_engine(
            EngineConfig {
                enable_audit: false,
                ..EngineConfig::default()
            },
            depth,
        );
        group.bench_with_input(BenchmarkId::new("cached", depth), &depth, |b, _| {
            b.iter(|| black_box(cached.check_permission("alice", "owned0", black_box(&doc), None)))
        });
    }

    group.finish();
}

fn bench_batch(c: &mut Criterion) {
    init_tracing();

    let engine = build_engine(EngineConfig::default().without_cache(), 10);
    let requests: Vec<CheckRequest> = (0..256)
        .map(|i| {
            CheckRequest::new(
                "alice",
                format!("action{}", i % 12),
                Resource::new(format!("doc:{}", i)).with_attribute("owner_id", "alice"),
            )
        })
        .collect();

    c.bench_function("batch_check_256", |b| {
        b.iter(|| black_box(engine.batch_check(black_box(&requests))))
    });
}

criterion_group!(benches, bench_check, bench_batch);
criterion_main!(benches);
