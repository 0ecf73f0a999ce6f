use criterion::{criterion_group, criterion_main, Criterion};
use covis_collab::protocol::SyncMessage;
use covis_collab::registry::SubscriberRegistry;
use covis_collab::store::SceneStore;
use covis_core::merge::merge_syncable;
use covis_core::model::{Container, Syncable, Update, Vec3, Vec4};
use std::hint::black_box;
use tokio::sync::mpsc;

fn avatar(i: usize) -> Container {
    Container::new(format!("container-{i}"))
        .with_name(format!("Avatar {i}"))
        .with_model("avatar.glb")
        .with_syncable("head", Syncable::new(format!("head-{i}")).with_position(Vec3::ZERO))
        .with_syncable("left", Syncable::new(format!("left-{i}")).with_rotation(Vec4::IDENTITY))
        .with_syncable("right", Syncable::new(format!("right-{i}")).with_rotation(Vec4::IDENTITY))
}

fn bench_update_encode(c: &mut Criterion) {
    let update = Update::container(avatar(0));

    c.bench_function("update_encode_container", |b| {
        b.iter(|| {
            let msg = SyncMessage::update(black_box(&update)).unwrap();
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_update_decode(c: &mut Criterion) {
    let encoded = SyncMessage::update(&Update::container(avatar(0)))
        .unwrap()
        .encode()
        .unwrap();

    c.bench_function("update_decode_container", |b| {
        b.iter(|| {
            let msg = SyncMessage::decode(black_box(&encoded)).unwrap();
            black_box(msg.to_update().unwrap());
        })
    });
}

fn bench_merge_syncable(c: &mut Criterion) {
    let old = Syncable::new("s1").with_position(Vec3::ZERO).with_rotation(Vec4::IDENTITY);
    let incoming = Syncable::new("s1").with_position(Vec3::new(1.0, 2.0, 3.0));

    c.bench_function("merge_syncable_position", |b| {
        b.iter(|| {
            black_box(merge_syncable(black_box(&old), black_box(&incoming)).unwrap());
        })
    });
}

fn bench_store_container_upsert(c: &mut Criterion) {
    c.bench_function("store_upsert_1000_containers", |b| {
        b.iter(|| {
            let mut store = SceneStore::new();
            for i in 0..1000 {
                store.apply_container_upsert(&avatar(i), "subscriber").unwrap();
            }
            black_box(store.index_len());
        })
    });
}

fn bench_store_syncable_upsert(c: &mut Criterion) {
    let mut store = SceneStore::new();
    for i in 0..1000 {
        store.apply_container_upsert(&avatar(i), "subscriber").unwrap();
    }

    c.bench_function("store_upsert_syncable_1000_containers", |b| {
        let mut i = 0usize;
        b.iter(|| {
            let update = Syncable::new(format!("head-{}", i % 1000))
                .with_position(Vec3::new(i as f64, 0.0, 0.0));
            store.apply_syncable_upsert(black_box(&update), "subscriber").unwrap();
            i += 1;
        })
    });
}

fn bench_store_list_all(c: &mut Criterion) {
    let mut store = SceneStore::new();
    for i in 0..1000 {
        store.apply_container_upsert(&avatar(i), &format!("subscriber-{}", i % 10)).unwrap();
    }

    c.bench_function("store_list_all_1000", |b| {
        b.iter(|| black_box(store.list_all()))
    });
}

fn bench_broadcast_100_subscribers(c: &mut Criterion) {
    let registry = SubscriberRegistry::new();
    let mut receivers = Vec::new();
    for i in 0..100 {
        let (tx, rx) = mpsc::unbounded_channel();
        registry.register(format!("subscriber-{i}"), tx);
        receivers.push(rx);
    }
    let update = Update::syncable(Syncable::new("head-0").with_position(Vec3::ZERO));

    c.bench_function("broadcast_except_100_subscribers", |b| {
        b.iter(|| {
            let count = registry.broadcast_except("subscriber-0", black_box(&update)).unwrap();
            black_box(count);
            for rx in receivers.iter_mut() {
                while rx.try_recv().is_ok() {}
            }
        })
    });
}

criterion_group!(
    benches,
    bench_update_encode,
    bench_update_decode,
    bench_merge_syncable,
    bench_store_container_upsert,
    bench_store_syncable_upsert,
    bench_store_list_all,
    bench_broadcast_100_subscribers,
);
criterion_main!(benches);
