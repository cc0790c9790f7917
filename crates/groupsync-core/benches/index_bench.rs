//! Benchmarks for metadata replay and message decryption
//!
//! Run with: cargo bench -p groupsync-core

use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use groupsync_core::invitation::{sign_initial_member, sign_member_device};
use groupsync_core::metadata::{InitialMemberAnnounced, MemberDeviceAdded};
use groupsync_core::{
    DeviceChainKey, EventEmitter, Group, GroupLogBinding, GroupMetadataEvent, Invitation, LogEntry,
    LogKind, MemoryLog, MessageKeys, MetadataStoreIndex, OwnMemberDevice, PrivKey,
    SignedEntryKeyStore,
};

struct Setup {
    group: Arc<Group>,
    group_key: PrivKey,
    binding: Arc<GroupLogBinding>,
    own: Arc<OwnMemberDevice>,
}

fn setup() -> Setup {
    let (group, group_key) = Group::generate();
    let group = Arc::new(group);
    let binding = Arc::new(
        GroupLogBinding::new(
            &group,
            LogKind::Metadata,
            Arc::new(MemoryLog::new()),
            Arc::new(SignedEntryKeyStore::new()),
            Duration::from_secs(5),
        )
        .unwrap(),
    );
    Setup {
        group,
        group_key,
        binding,
        own: Arc::new(OwnMemberDevice::generate()),
    }
}

/// The creator's announcement followed by `count` invited members.
fn join_entries(s: &Setup, count: usize) -> Vec<LogEntry> {
    let group_id = s.group.id();
    let creator = PrivKey::generate();
    let creator_device = PrivKey::generate();
    let seal = |device: &PrivKey, event: &GroupMetadataEvent, position: usize| {
        let bytes = s.binding.seal_entry(device, &event.encode().unwrap()).unwrap();
        LogEntry::new(position as u64, bytes)
    };

    let announce = GroupMetadataEvent::InitialMemberAnnounced(InitialMemberAnnounced {
        member_pk: creator.public().to_bytes(),
        device_pk: creator_device.public().to_bytes(),
        member_sig: sign_member_device(&group_id, &creator, &creator_device.public()),
        group_sig: sign_initial_member(&s.group_key, &creator.public()),
    });
    let mut entries = vec![seal(&creator_device, &announce, 0)];

    for position in 1..=count {
        let member = PrivKey::generate();
        let device = PrivKey::generate();
        let invitation = Invitation::new(&creator, &s.group);
        let event = GroupMetadataEvent::MemberDeviceAdded(MemberDeviceAdded {
            member_pk: member.public().to_bytes(),
            device_pk: device.public().to_bytes(),
            member_sig: sign_member_device(&group_id, &member, &device.public()),
            invitation: Some(invitation.redeem(&member, &device.public()).unwrap()),
        });
        entries.push(seal(&device, &event, position));
    }
    entries
}

fn fresh_index(s: &Setup) -> MetadataStoreIndex {
    MetadataStoreIndex::new(
        s.group.clone(),
        s.binding.clone(),
        s.own.clone(),
        Arc::new(MessageKeys::new(s.own.device().public(), 64)),
        EventEmitter::new(16),
    )
}

// ============================================================================
// Metadata Replay Benchmarks
// ============================================================================

fn bench_update_index(c: &mut Criterion) {
    let mut group = c.benchmark_group("update_index");
    let s = setup();

    for count in [10, 100, 500] {
        let entries = join_entries(&s, count);
        group.throughput(Throughput::Elements(count as u64));

        group.bench_with_input(BenchmarkId::new("fresh", count), &entries, |b, entries| {
            b.iter_batched(
                || fresh_index(&s),
                |index| black_box(index.update_index(entries)),
                criterion::BatchSize::SmallInput,
            )
        });

        // every entry already handled
        group.bench_with_input(BenchmarkId::new("replay", count), &entries, |b, entries| {
            let index = fresh_index(&s);
            index.update_index(entries);
            b.iter(|| black_box(index.update_index(entries)))
        });
    }

    group.finish();
}

// ============================================================================
// Ratchet Benchmarks
// ============================================================================

fn bench_message_keys(c: &mut Criterion) {
    let mut group = c.benchmark_group("message_keys");

    group.bench_function("next_own_message_key", |b| {
        let keys = MessageKeys::new(PrivKey::generate().public(), 1024);
        b.iter(|| black_box(keys.next_own_message_key().unwrap()))
    });

    group.bench_function("skip_100", |b| {
        b.iter_batched(
            || {
                let device = PrivKey::generate().public();
                let keys = MessageKeys::new(PrivKey::generate().public(), 1024);
                let chain = DeviceChainKey::generate();
                let chain_id = chain.chain_id();
                keys.register_chain_key_for_device(device, chain);
                (keys, device, chain_id)
            },
            |(keys, device, chain_id)| black_box(keys.message_key(&device, chain_id, 100).unwrap()),
            criterion::BatchSize::SmallInput,
        )
    });

    // history below the furthest derived position, rebuilt from checkpoints
    group.bench_function("rederive_history", |b| {
        let device = PrivKey::generate().public();
        let keys = MessageKeys::new(PrivKey::generate().public(), 1024);
        let chain = DeviceChainKey::generate();
        let chain_id = chain.chain_id();
        keys.register_chain_key_for_device(device, chain);
        keys.message_key(&device, chain_id, 1000).unwrap();
        b.iter(|| black_box(keys.message_key(&device, chain_id, 500).unwrap()))
    });

    group.finish();
}

criterion_group!(benches, bench_update_index, bench_message_keys);
criterion_main!(benches);
