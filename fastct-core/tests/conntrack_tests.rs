//! End-to-end tests driving the tracker with real frames.

use bytes::Bytes;
use fastct_core::packet::builder::FrameBuilder;
use fastct_core::{
    dump_lines, ConnTable, Conntrack, ConntrackConfig, CtDpif, CtState, ExecuteOptions,
    FormatOptions, L3Type, ManualClock, Masked, Packet, PacketMetadata, TcpFlags, TimeoutPolicy,
};
use proptest::prelude::*;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const A: [u8; 4] = [192, 168, 1, 10];
const B: [u8; 4] = [192, 168, 1, 20];
const ROUTER: [u8; 4] = [192, 168, 1, 1];

fn table(limit: u32) -> (Arc<ConnTable>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(0));
    let config = ConntrackConfig {
        max_connections: limit,
        hash_seed: Some(0x5eed),
        ..ConntrackConfig::default()
    };
    let table = Arc::new(ConnTable::new(&config, clock.clone()).unwrap());
    (table, clock)
}

fn run(table: &ConnTable, frame: Bytes, opts: &ExecuteOptions) -> PacketMetadata {
    let mut batch = [Packet::from_ethernet(frame)];
    table.execute(&mut batch, L3Type::Ipv4, opts);
    batch[0].md
}

fn udp(src: [u8; 4], dst: [u8; 4], sport: u16, dport: u16) -> Bytes {
    FrameBuilder::udp4(src, dst, sport, dport).payload(32).build()
}

const NEW: CtState = CtState::NEW.union(CtState::TRACKED);
const EST: CtState = CtState::ESTABLISHED.union(CtState::TRACKED);
const EST_RPL: CtState = EST.union(CtState::REPLY_DIR);
const INV: CtState = CtState::INVALID.union(CtState::TRACKED);

// ===== Verdicts =====

#[test]
fn test_udp_new_then_reply() {
    let (t, _clock) = table(100);
    let opts = ExecuteOptions::commit(0);
    assert_eq!(run(&t, udp(A, B, 1000, 53), &opts).ct_state, NEW);
    assert_eq!(run(&t, udp(A, B, 1000, 53), &opts).ct_state, EST);
    assert_eq!(run(&t, udp(B, A, 53, 1000), &opts).ct_state, EST_RPL);
    assert_eq!(t.n_conns(), 1);
}

#[test]
fn test_ipv6_tracking() {
    let (t, _clock) = table(100);
    let opts = ExecuteOptions::commit(0);
    let mut a = [0u8; 16];
    a[0] = 0xfd;
    a[15] = 1;
    let mut b = a;
    b[15] = 2;

    let mut batch = [
        Packet::from_ethernet(FrameBuilder::udp6(a, b, 5000, 443).build()),
        Packet::from_ethernet(FrameBuilder::udp6(b, a, 443, 5000).build()),
    ];
    let report = t.execute(&mut batch, L3Type::Ipv6, &opts);
    assert_eq!(report.new, 1);
    assert_eq!(report.established, 1);
    assert_eq!(batch[1].md.ct_state, EST_RPL);

    // Wrong L3 type for the frame is untrackable.
    let mut wrong = [Packet::from_ethernet(FrameBuilder::udp6(a, b, 1, 2).build())];
    assert_eq!(t.execute(&mut wrong, L3Type::Ipv4, &opts).untrackable, 1);
}

#[test]
fn test_icmp_echo_pairs_with_reply() {
    let (t, _clock) = table(100);
    let opts = ExecuteOptions::commit(0);
    let req = FrameBuilder::icmp4_echo(A, B, 77, false).build();
    let rep = FrameBuilder::icmp4_echo(B, A, 77, true).build();
    assert_eq!(run(&t, req, &opts).ct_state, NEW);
    assert_eq!(run(&t, rep, &opts).ct_state, EST_RPL);
}

#[test]
fn test_icmp_error_is_related() {
    let (t, _clock) = table(100);
    let opts = ExecuteOptions::commit(0).with_mark(Masked::<u32>::exact(42));
    run(&t, udp(A, B, 1000, 53), &opts);

    let quoted = FrameBuilder::udp4(A, B, 1000, 53).payload(32).build_l3();
    let unreachable = FrameBuilder::icmp4_error(ROUTER, A, 3, 3, quoted).build();
    let md = run(&t, unreachable, &ExecuteOptions::commit(0));
    assert_eq!(
        md.ct_state,
        CtState::RELATED | CtState::REPLY_DIR | CtState::TRACKED
    );
    assert_eq!(md.ct_mark, 42);
    assert_eq!(t.n_conns(), 1);

    let stray = FrameBuilder::udp4(A, B, 9999, 53).build_l3();
    let orphan = FrameBuilder::icmp4_error(ROUTER, A, 3, 3, stray).build();
    assert_eq!(run(&t, orphan, &ExecuteOptions::commit(0)).ct_state, INV);
}

#[test]
fn test_untrackable_packets_marked_invalid() {
    let (t, _clock) = table(100);
    let opts = ExecuteOptions::commit(0);
    let mut batch = [
        Packet::from_ethernet(FrameBuilder::udp4(A, B, 1, 2).fragment().build()),
        Packet::from_ethernet(FrameBuilder::udp4(A, B, 1, 2).bad_checksum().build()),
        Packet::from_ethernet(Bytes::from_static(&[0u8; 10])),
    ];
    let report = t.execute(&mut batch, L3Type::Ipv4, &opts);
    assert_eq!(report.untrackable, 3);
    assert!(batch.iter().all(|p| p.md.ct_state == INV));
    assert_eq!(t.n_conns(), 0);
    assert_eq!(t.stats().untrackable, 3);
}

#[test]
fn test_vlan_tagged_frames_tracked() {
    let (t, _clock) = table(100);
    let opts = ExecuteOptions::commit(0);
    let tagged = FrameBuilder::udp4(A, B, 1000, 53).vlan(100).build();
    assert_eq!(run(&t, tagged, &opts).ct_state, NEW);
    // Same connection without the tag.
    assert_eq!(run(&t, udp(B, A, 53, 1000), &opts).ct_state, EST_RPL);
}

#[test]
fn test_tcp_handshake_and_strict_refusal() {
    let (t, _clock) = table(100);
    let opts = ExecuteOptions::commit(0);
    let syn = FrameBuilder::tcp4(A, B, 40000, 80, TcpFlags::SYN).build();
    let syn_ack = FrameBuilder::tcp4(B, A, 80, 40000, TcpFlags::SYN | TcpFlags::ACK).build();
    let ack = FrameBuilder::tcp4(A, B, 40000, 80, TcpFlags::ACK).build();
    assert_eq!(run(&t, syn, &opts).ct_state, NEW);
    assert_eq!(run(&t, syn_ack, &opts).ct_state, EST_RPL);
    assert_eq!(run(&t, ack, &opts).ct_state, EST);

    // A SYN+ACK cannot open a connection.
    let stray = FrameBuilder::tcp4(A, B, 40001, 80, TcpFlags::SYN | TcpFlags::ACK).build();
    assert_eq!(run(&t, stray, &opts).ct_state, INV);
    assert_eq!(t.n_conns(), 1);

    let lines = dump_lines(t.as_ref(), None, FormatOptions::default()).unwrap();
    assert_eq!(lines.len(), 1);
    assert!(lines[0].starts_with("tcp,orig=(src=192.168.1.10,dst=192.168.1.20,sport=40000,dport=80)"));
    assert!(lines[0].ends_with("protoinfo=(state=ESTABLISHED)"));
}

#[test]
fn test_lookup_only_never_creates() {
    let (t, _clock) = table(100);
    let md = run(&t, udp(A, B, 1, 2), &ExecuteOptions::lookup(0));
    assert_eq!(md.ct_state, NEW);
    assert_eq!(t.n_conns(), 0);
}

#[test]
fn test_helper_is_flagged_unsupported() {
    let (t, _clock) = table(100);
    let opts = ExecuteOptions::commit(0).with_helper("ftp");
    let mut batch = [Packet::from_ethernet(udp(A, B, 2121, 21))];
    let report = t.execute(&mut batch, L3Type::Ipv4, &opts);
    assert!(report.helper_unsupported);
    assert_eq!(report.new, 1);

    let entry = t.dump_start(None).next().unwrap();
    assert_eq!(entry.helper.as_deref(), Some("ftp"));
}

// ===== Admission and flush =====

#[test]
fn test_limit_one_then_flush_readmits() {
    let (t, _clock) = table(1);
    let opts = ExecuteOptions::commit(0).with_mark(Masked::<u32>::exact(7));

    let first = run(&t, udp(A, B, 1000, 53), &opts);
    assert_eq!(first.ct_state, NEW);
    assert_eq!(first.ct_mark, 7);

    let refused = run(&t, udp(A, B, 2000, 53), &opts);
    assert_eq!(refused.ct_state, NEW);
    assert_eq!(refused.ct_mark, 0);
    assert_eq!(t.n_conns(), 1);

    assert_eq!(t.ct_flush(Some(0)).unwrap(), 1);
    assert_eq!(run(&t, udp(A, B, 2000, 53), &opts).ct_state, NEW);
    assert_eq!(t.n_conns(), 1);
    assert_eq!(run(&t, udp(A, B, 2000, 53), &opts).ct_state, EST);
}

#[test]
fn test_zone_flush_leaves_other_zones() {
    let (t, _clock) = table(100);
    for (zone, sport) in [(1u16, 1000u16), (2, 1001), (2, 1002)] {
        run(&t, udp(A, B, sport, 53), &ExecuteOptions::commit(zone));
    }
    assert_eq!(t.n_conns(), 3);
    assert_eq!(t.flush(Some(2)), 2);
    assert_eq!(t.n_conns(), 1);
    assert_eq!(t.dump_start(Some(1)).count(), 1);
    assert_eq!(t.dump_start(Some(2)).count(), 0);
}

#[test]
fn test_same_tuple_in_two_zones() {
    let (t, _clock) = table(100);
    assert_eq!(run(&t, udp(A, B, 1, 2), &ExecuteOptions::commit(1)).ct_state, NEW);
    assert_eq!(run(&t, udp(A, B, 1, 2), &ExecuteOptions::commit(2)).ct_state, NEW);
    assert_eq!(run(&t, udp(B, A, 2, 1), &ExecuteOptions::commit(1)).ct_state, EST_RPL);
    assert_eq!(t.n_conns(), 2);
}

// ===== Expiration =====

#[test]
fn test_other_protocol_timeline() {
    let (t, clock) = table(100);
    let opts = ExecuteOptions::commit(0);

    run(&t, udp(A, B, 1000, 53), &opts);
    clock.set(10_000);
    run(&t, udp(A, B, 1000, 53), &opts);
    clock.set(20_000);
    assert_eq!(run(&t, udp(B, A, 53, 1000), &opts).ct_state, EST_RPL);

    let entry = t.dump_start(None).next().unwrap();
    assert!(entry.to_string().contains("protoinfo=(state=BIDIR)"));

    // Bidir timeout is 30s from t=20s.
    assert_eq!(t.clean(49_000).evicted, 0);
    assert_eq!(t.n_conns(), 1);
    assert_eq!(t.clean(51_000).evicted, 1);
    assert_eq!(t.n_conns(), 0);
}

#[test]
fn test_repeated_reply_is_idempotent() {
    let (t, clock) = table(100);
    let opts = ExecuteOptions::commit(0);
    run(&t, udp(A, B, 1000, 53), &opts);
    run(&t, udp(B, A, 53, 1000), &opts);
    clock.set(5_000);
    run(&t, udp(B, A, 53, 1000), &opts);
    run(&t, udp(B, A, 53, 1000), &opts);

    let entries: Vec<_> = t.dump_start(None).collect();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].timeout_secs, 30);
    assert_eq!(entries[0].counters_reply.packets, 3);
    assert_eq!(t.clean(35_000).evicted, 1);
}

proptest! {
    #[test]
    fn test_other_state_never_regresses(dirs in proptest::collection::vec(any::<bool>(), 1..40)) {
        let (t, _clock) = table(100);
        let opts = ExecuteOptions::commit(0);
        run(&t, udp(A, B, 1000, 53), &opts);
        let mut seen_reply = false;
        for reply in dirs {
            let frame = if reply { udp(B, A, 53, 1000) } else { udp(A, B, 1000, 53) };
            run(&t, frame, &opts);
            seen_reply |= reply;
            let line = t.dump_start(None).next().unwrap().to_string();
            if seen_reply {
                prop_assert!(line.contains("state=BIDIR"));
            } else {
                prop_assert!(line.contains("state=MULTIPLE"));
            }
        }
        prop_assert_eq!(t.n_conns(), 1);
    }
}

// ===== Concurrency and lifecycle =====

#[test]
fn test_parallel_workers_share_table() {
    let (t, _clock) = table(100_000);
    let handles: Vec<_> = (0..4u16)
        .map(|worker| {
            let t = Arc::clone(&t);
            thread::spawn(move || {
                let opts = ExecuteOptions::commit(0);
                let mut batch: Vec<Packet> = (0..1000u16)
                    .map(|i| Packet::from_ethernet(udp(A, B, worker * 1000 + i, 53)))
                    .collect();
                t.execute(&mut batch, L3Type::Ipv4, &opts).new
            })
        })
        .collect();

    let created: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(created, 4000);
    assert_eq!(t.n_conns(), 4000);
    assert_eq!(t.dump_start(None).count(), 4000);
}

#[test]
fn test_cleanup_thread_expires_connections() {
    let timeouts = TimeoutPolicy {
        other_first: 1,
        ..TimeoutPolicy::default()
    };
    let config = ConntrackConfig {
        timeouts,
        clean_interval_ms: 50,
        clean_retry_ms: 10,
        ..ConntrackConfig::default()
    };
    let ct = Conntrack::new(&config).unwrap();
    let mut batch = [Packet::from_ethernet(udp(A, B, 1000, 53))];
    ct.execute(&mut batch, L3Type::Ipv4, &ExecuteOptions::commit(0));
    assert_eq!(ct.n_conns(), 1);

    let mut waited = 0;
    while ct.n_conns() != 0 && waited < 5_000 {
        thread::sleep(Duration::from_millis(50));
        waited += 50;
    }
    assert_eq!(ct.n_conns(), 0);
    assert_eq!(ct.stats().expired, 1);
    ct.shutdown();
}

#[test]
fn test_shutdown_releases_connections() {
    let ct = Conntrack::new(&ConntrackConfig::default()).unwrap();
    let table = Arc::clone(ct.table());
    let mut batch = [Packet::from_ethernet(udp(A, B, 1, 2))];
    ct.execute(&mut batch, L3Type::Ipv4, &ExecuteOptions::commit(0));
    assert_eq!(table.n_conns(), 1);
    ct.shutdown();
    assert_eq!(table.n_conns(), 0);
}
