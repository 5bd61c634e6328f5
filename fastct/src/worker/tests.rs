//! # Ingress Worker Test Suite
//!
//! Frames are sent over loopback UDP to live workers and the resulting
//! table contents and echoed verdicts are checked.

use super::*;
use fastct_core::packet::builder::FrameBuilder;
use fastct_core::{ConntrackConfig, CtState, ManualClock, Masked};
use std::time::{Duration, Instant};

fn table() -> Arc<ConnTable> {
    let config = ConntrackConfig {
        hash_seed: Some(7),
        ..ConntrackConfig::default()
    };
    Arc::new(ConnTable::new(&config, Arc::new(ManualClock::new(0))).unwrap())
}

fn netio() -> NetIoConfig {
    NetIoConfig {
        poll_timeout_ms: 10,
        ..NetIoConfig::default()
    }
}

fn pipeline(name: &str, opts: ExecuteOptions, echo: bool) -> Pipeline {
    Pipeline {
        name: Arc::from(name),
        port: 0,
        l3: L3Type::Ipv4,
        opts,
        echo_verdicts: echo,
    }
}

fn loopback() -> IpAddr {
    "127.0.0.1".parse().unwrap()
}

fn client() -> UdpSocket {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    socket
}

fn exchange(client: &UdpSocket, to: SocketAddr, frame: &[u8]) -> fastct_core::PacketMetadata {
    client.send_to(frame, to).unwrap();
    let mut buf = [0u8; 64];
    let (n, _) = client.recv_from(&mut buf).unwrap();
    verdict::decode(&buf[..n]).unwrap()
}

fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

// ============================================================================
// Pipeline resolution
// ============================================================================

#[test]
fn test_pipeline_from_config() {
    let config = PipelineConfig {
        port: 9100,
        zone: 2,
        l3: "ipv6".to_string(),
        echo_verdicts: true,
        ..PipelineConfig::default()
    };
    let p = Pipeline::from_config("lan", &config).unwrap();
    assert_eq!(&*p.name, "lan");
    assert_eq!(p.l3, L3Type::Ipv6);
    assert_eq!(p.opts, ExecuteOptions::commit(2));
    assert!(p.echo_verdicts);
}

#[test]
fn test_pipeline_from_bad_config() {
    let config = PipelineConfig {
        mark: Some("x".to_string()),
        ..PipelineConfig::default()
    };
    let err = Pipeline::from_config("bad", &config).unwrap_err();
    assert!(err.to_string().contains("bad"));
}

// ============================================================================
// Live workers
// ============================================================================

#[test]
fn test_frames_are_tracked() {
    let table = table();
    let handle = spawn(
        loopback(),
        vec![pipeline("p", ExecuteOptions::commit(0), false)],
        netio(),
        Arc::clone(&table),
    )
    .unwrap();
    let addr = handle.local_addr("p").unwrap();
    assert_eq!(handle.worker_count(), 1);

    let client = client();
    for sport in 0..3u16 {
        let frame = FrameBuilder::udp4([10, 0, 0, 1], [10, 0, 0, 2], 2000 + sport, 53).build();
        client.send_to(&frame, addr).unwrap();
    }

    assert!(wait_for(|| table.n_conns() == 3));
    handle.shutdown();
}

#[test]
fn test_verdicts_are_echoed() {
    let table = table();
    let opts = ExecuteOptions::commit(5).with_mark(Masked::<u32>::exact(0x99));
    let handle = spawn(
        loopback(),
        vec![pipeline("echo", opts, true)],
        netio(),
        Arc::clone(&table),
    )
    .unwrap();
    let addr = handle.local_addr("echo").unwrap();
    let client = client();

    let fwd = FrameBuilder::udp4([10, 0, 0, 1], [10, 0, 0, 2], 4000, 53).build();
    let md = exchange(&client, addr, &fwd);
    assert_eq!(md.ct_state, CtState::NEW | CtState::TRACKED);
    assert_eq!(md.ct_zone, 5);
    assert_eq!(md.ct_mark, 0x99);

    let rev = FrameBuilder::udp4([10, 0, 0, 2], [10, 0, 0, 1], 53, 4000).build();
    let md = exchange(&client, addr, &rev);
    assert_eq!(
        md.ct_state,
        CtState::ESTABLISHED | CtState::REPLY_DIR | CtState::TRACKED
    );

    let junk = [0u8; 10];
    let md = exchange(&client, addr, &junk);
    assert_eq!(md.ct_state, CtState::INVALID | CtState::TRACKED);

    assert_eq!(table.n_conns(), 1);
    handle.shutdown();
}

#[test]
fn test_pipelines_track_in_their_zones() {
    let table = table();
    let handle = spawn(
        loopback(),
        vec![
            pipeline("a", ExecuteOptions::commit(1), true),
            pipeline("b", ExecuteOptions::commit(2), true),
        ],
        netio(),
        Arc::clone(&table),
    )
    .unwrap();
    assert_eq!(handle.local_addrs().len(), 2);
    let client = client();
    let frame = FrameBuilder::udp4([10, 0, 0, 1], [10, 0, 0, 2], 4000, 53).build();

    for name in ["a", "b"] {
        let md = exchange(&client, handle.local_addr(name).unwrap(), &frame);
        assert!(md.ct_state.contains(CtState::NEW));
    }

    assert_eq!(table.n_conns(), 2);
    assert_eq!(table.dump_start(Some(1)).count(), 1);
    assert_eq!(table.dump_start(Some(2)).count(), 1);
    handle.shutdown();
}

#[test]
fn test_workers_share_port() {
    let table = table();
    let config = NetIoConfig {
        workers: 3,
        ..netio()
    };
    let handle = spawn(
        loopback(),
        vec![pipeline("p", ExecuteOptions::commit(0), false)],
        config,
        Arc::clone(&table),
    )
    .unwrap();
    assert_eq!(handle.worker_count(), 3);
    assert_eq!(handle.local_addrs().len(), 1);
    handle.shutdown();
}

#[test]
fn test_lookup_pipeline_leaves_table_empty() {
    let table = table();
    let handle = spawn(
        loopback(),
        vec![pipeline("ro", ExecuteOptions::lookup(0), true)],
        netio(),
        Arc::clone(&table),
    )
    .unwrap();
    let client = client();
    let frame = FrameBuilder::udp4([10, 0, 0, 1], [10, 0, 0, 2], 4000, 53).build();

    let md = exchange(&client, handle.local_addr("ro").unwrap(), &frame);
    assert_eq!(md.ct_state, CtState::NEW | CtState::TRACKED);
    assert_eq!(table.n_conns(), 0);
    handle.shutdown();
}

#[test]
fn test_zero_workers_rejected() {
    let config = NetIoConfig {
        workers: 0,
        ..netio()
    };
    assert!(spawn(loopback(), Vec::new(), config, table()).is_err());
}
