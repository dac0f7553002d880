use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use mdm_core::*;
use std::sync::Arc;
use tempfile::TempDir;

fn patient(i: usize) -> Resource {
    Resource::new(ResourceType::new("patient").unwrap())
        .with_attribute("family_name", &format!("Family{}", i % 200))
        .with_attribute("given_name", &format!("Given{}", i))
        .with_attribute("birth_date", &format!("19{:02}-01-{:02}", i % 100, i % 28 + 1))
        .with_attribute("email", &format!("person{}@example.com", i))
}

fn create_service() -> (
    LinkService<RedbStorage, InMemoryRepository>,
    Arc<InMemoryRepository>,
    TempDir,
) {
    let temp_dir = TempDir::new().unwrap();
    let repository = Arc::new(InMemoryRepository::new());
    let service = LinkService::open(
        temp_dir.path().join("bench.redb"),
        repository.clone(),
        LinkServiceConfig::default(),
    )
    .unwrap();
    (service, repository, temp_dir)
}

fn seeded_service(count: usize) -> (
    LinkService<RedbStorage, InMemoryRepository>,
    Arc<InMemoryRepository>,
    TempDir,
) {
    let (service, repository, temp_dir) = create_service();
    let ctx = TransactionContext::generate(ReasonCode::Batch);
    for i in 0..count {
        let resource = patient(i);
        repository.put(resource.clone()).unwrap();
        service.process_candidate(&resource, &ctx).unwrap();
    }
    (service, repository, temp_dir)
}

fn bench_match_engine(c: &mut Criterion) {
    let engine = MatchEngine::new(MatchConfig::default()).unwrap();
    let target = patient(1);
    let golden = GoldenRecord::from_target(&patient(2));

    c.bench_function("match engine evaluate", |b| {
        b.iter(|| engine.evaluate(&target, &golden).unwrap());
    });
}

fn bench_process_new_target(c: &mut Criterion) {
    c.bench_function("process candidate (new entity)", |b| {
        b.iter_batched(
            create_service,
            |(service, repository, _temp)| {
                let resource = patient(0);
                repository.put(resource.clone()).unwrap();
                service
                    .process_candidate(&resource, &TransactionContext::generate(ReasonCode::CreateResource))
                    .unwrap();
            },
            BatchSize::SmallInput,
        );
    });
}

fn bench_rescore_existing(c: &mut Criterion) {
    let (service, _repository, _temp) = seeded_service(500);
    let target = patient(250);
    let ctx = TransactionContext::generate(ReasonCode::UpdateResource);

    c.bench_function("process candidate (500 goldens, rescore)", |b| {
        b.iter(|| service.process_candidate(&target, &ctx).unwrap());
    });
}

criterion_group!(
    benches,
    bench_match_engine,
    bench_process_new_target,
    bench_rescore_existing
);
criterion_main!(benches);
