//! pigpio backend against an in-process fake of the daemon socket.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use microbeam_core::DacPoint;
use microbeam_hw::pigpio::{cmd, script_status};
use microbeam_hw::{HardwareError, PigpioBackend, PigpioConfig, TriggerBackend, PI_BAD_SCRIPT_ID};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Fake daemon
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
struct Request {
    cmd: u32,
    p1: u32,
    p2: u32,
    ext: Vec<u8>,
}

/// Reply word plus optional extension bytes.
struct Reply {
    res: i32,
    ext: Vec<u8>,
}

impl Reply {
    fn ok(res: i32) -> Self {
        Self { res, ext: Vec::new() }
    }

    /// Script status with the remaining count `p0` and the tick `p9`.
    fn status(status: i32, p0: i32, p9: i32) -> Self {
        let mut ext = Vec::new();
        ext.extend_from_slice(&status.to_le_bytes());
        for i in 0..10 {
            let value = match i {
                0 => p0,
                9 => p9,
                _ => 0,
            };
            ext.extend_from_slice(&value.to_le_bytes());
        }
        Self {
            res: ext.len() as i32,
            ext,
        }
    }
}

/// Scripted daemon state.
#[derive(Default)]
struct Daemon {
    log: Vec<Request>,
    /// Queued PROCP replies; when empty the script reports HALTED
    procp: VecDeque<Reply>,
    /// Replaces the queued PROCP replies once the script is stopped
    on_stop: Option<Reply>,
    next_script_id: u32,
}

impl Daemon {
    fn handle(&mut self, request: Request) -> Reply {
        let reply = match request.cmd {
            cmd::SPIO => Reply::ok(3),
            cmd::PROC => {
                let id = self.next_script_id;
                self.next_script_id += 1;
                Reply::ok(id as i32)
            }
            cmd::PROCP => self
                .procp
                .pop_front()
                .unwrap_or_else(|| Reply::status(script_status::HALTED, 0, 0)),
            cmd::PROCS => {
                if let Some(reply) = self.on_stop.take() {
                    self.procp.clear();
                    self.procp.push_back(reply);
                }
                Reply::ok(0)
            }
            cmd::TICK => Reply::ok(-5),
            _ => Reply::ok(0),
        };
        self.log.push(request);
        reply
    }
}

async fn spawn_daemon(daemon: Arc<Mutex<Daemon>>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        loop {
            let mut header = [0u8; 16];
            if stream.read_exact(&mut header).await.is_err() {
                return;
            }
            let word = |i: usize| u32::from_le_bytes(header[i * 4..i * 4 + 4].try_into().unwrap());
            let (command, p1, p2, p3) = (word(0), word(1), word(2), word(3));
            let mut ext = vec![0u8; p3 as usize];
            stream.read_exact(&mut ext).await.unwrap();

            let reply = daemon.lock().unwrap().handle(Request {
                cmd: command,
                p1,
                p2,
                ext,
            });

            let mut frame = Vec::new();
            for w in [command, p1, p2] {
                frame.extend_from_slice(&w.to_le_bytes());
            }
            frame.extend_from_slice(&reply.res.to_le_bytes());
            frame.extend_from_slice(&reply.ext);
            stream.write_all(&frame).await.unwrap();
        }
    });

    addr
}

async fn connect(daemon: &Arc<Mutex<Daemon>>) -> PigpioBackend {
    let addr = spawn_daemon(Arc::clone(daemon)).await;
    PigpioBackend::connect(PigpioConfig {
        addr,
        ..PigpioConfig::default()
    })
    .await
    .unwrap()
}

fn commands(daemon: &Arc<Mutex<Daemon>>) -> Vec<u32> {
    daemon.lock().unwrap().log.iter().map(|r| r.cmd).collect()
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_connect_configures_lines() {
    let daemon = Arc::new(Mutex::new(Daemon::default()));
    let _backend = connect(&daemon).await;

    let log = daemon.lock().unwrap().log.clone();
    let expected = vec![
        (cmd::MODES, 27, 0),
        (cmd::MODES, 17, 1),
        (cmd::WRITE, 17, 1),
        (cmd::SPIO, 0, 1_300_000),
        (cmd::MODES, 25, 1),
    ];
    let got: Vec<(u32, u32, u32)> = log.iter().map(|r| (r.cmd, r.p1, r.p2)).collect();
    assert_eq!(got, expected);
    assert_eq!(log[3].ext, 1u32.to_le_bytes().to_vec());
}

#[tokio::test]
async fn test_connect_failure_is_reported() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);

    let result = PigpioBackend::connect(PigpioConfig {
        addr,
        ..PigpioConfig::default()
    })
    .await;
    assert!(matches!(result, Err(HardwareError::Connect { .. })));
}

#[tokio::test]
async fn test_set_position_latches_both_axes() {
    let daemon = Arc::new(Mutex::new(Daemon::default()));
    let backend = connect(&daemon).await;
    daemon.lock().unwrap().log.clear();

    backend
        .set_position(DacPoint::new(-100, 0x1234))
        .await
        .unwrap();

    let log = daemon.lock().unwrap().log.clone();
    assert_eq!(log.len(), 4);
    assert_eq!((log[0].cmd, log[0].p1, log[0].p2), (cmd::WRITE, 25, 1));
    assert_eq!((log[1].cmd, log[1].p1), (cmd::SPIW, 3));
    assert_eq!(log[1].ext, vec![0b0001_0000, 0xff, 0x9c]);
    assert_eq!(log[2].ext, vec![0b0001_0001, 0x12, 0x34]);
    assert_eq!((log[3].cmd, log[3].p1, log[3].p2), (cmd::WRITE, 25, 0));
    assert_eq!(backend.position(), DacPoint::new(-100, 0x1234));
}

#[tokio::test]
async fn test_prepare_uploads_script_and_waits_for_init() {
    let daemon = Arc::new(Mutex::new(Daemon::default()));
    let backend = connect(&daemon).await;
    {
        let mut d = daemon.lock().unwrap();
        d.log.clear();
        d.procp.push_back(Reply::status(script_status::INITING, 0, 0));
    }

    backend.prepare(4).await.unwrap();

    let log = daemon.lock().unwrap().log.clone();
    assert_eq!(log[0].cmd, cmd::PROC);
    let script = String::from_utf8(log[0].ext.clone()).unwrap();
    assert!(script.starts_with("w 17 0 tag 0 wait 134217728 r 27 jnz 0 dcr p0"));
    assert_eq!(commands(&daemon)[1..], [cmd::PROCP, cmd::PROCP]);
}

#[tokio::test]
async fn test_arm_runs_and_polls_until_halted() {
    let daemon = Arc::new(Mutex::new(Daemon::default()));
    let backend = connect(&daemon).await;
    backend.prepare(4).await.unwrap();
    backend.set_position(DacPoint::new(7, 8)).await.unwrap();
    {
        let mut d = daemon.lock().unwrap();
        d.log.clear();
        d.procp.push_back(Reply::status(script_status::RUNNING, 4, 0));
        d.procp.push_back(Reply::status(script_status::WAITING, 3, 0));
        d.procp.push_back(Reply::status(script_status::HALTED, 0, 123_456));
    }

    let batch = tokio::time::timeout(
        Duration::from_secs(5),
        backend.arm_and_wait(&CancellationToken::new()),
    )
    .await
    .unwrap()
    .unwrap()
    .unwrap();

    assert_eq!(batch.hw_timestamp_us, 123_456);
    assert_eq!(batch.count, 4);
    assert_eq!(batch.position, DacPoint::new(7, 8));

    let log = daemon.lock().unwrap().log.clone();
    assert_eq!(log[0].cmd, cmd::PROCR);
    assert_eq!(log[0].ext, 4u32.to_le_bytes().to_vec());
    assert_eq!(
        commands(&daemon)[1..],
        [cmd::PROCP, cmd::PROCP, cmd::PROCP]
    );
}

#[tokio::test]
async fn test_deleted_script_is_retried() {
    let daemon = Arc::new(Mutex::new(Daemon::default()));
    let backend = connect(&daemon).await;
    backend.prepare(1).await.unwrap();
    {
        let mut d = daemon.lock().unwrap();
        d.log.clear();
        d.procp.push_back(Reply::ok(PI_BAD_SCRIPT_ID));
    }

    let first = backend
        .arm_and_wait(&CancellationToken::new())
        .await
        .unwrap();
    assert!(first.is_none());

    // next arm uploads the program again
    let second = backend
        .arm_and_wait(&CancellationToken::new())
        .await
        .unwrap();
    assert!(second.is_some());

    let cmds = commands(&daemon);
    assert_eq!(cmds[..2], [cmd::PROCR, cmd::PROCP]);
    assert!(cmds[2..].contains(&cmd::PROC));
}

#[tokio::test]
async fn test_cancel_stops_script_and_closes_shutter() {
    let daemon = Arc::new(Mutex::new(Daemon::default()));
    let backend = connect(&daemon).await;
    backend.prepare(1).await.unwrap();
    {
        let mut d = daemon.lock().unwrap();
        d.log.clear();
        for _ in 0..10_000 {
            d.procp.push_back(Reply::status(script_status::WAITING, 1, 0));
        }
    }

    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        canceller.cancel();
    });

    let result = tokio::time::timeout(Duration::from_secs(5), backend.arm_and_wait(&cancel))
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_none());

    // nothing counted, so the status check after the stop finds no hits
    let log = daemon.lock().unwrap().log.clone();
    let tail: Vec<(u32, u32, u32)> = log
        .iter()
        .rev()
        .take(3)
        .map(|r| (r.cmd, r.p1, r.p2))
        .collect();
    assert_eq!(
        tail,
        vec![(cmd::PROCP, 0, 0), (cmd::WRITE, 17, 1), (cmd::PROCS, 0, 0)]
    );
}

/// Arms, cancels after a short while and returns the result of the arm.
async fn arm_then_cancel(backend: &PigpioBackend) -> Option<microbeam_core::HitBatch> {
    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        canceller.cancel();
    });

    tokio::time::timeout(Duration::from_secs(5), backend.arm_and_wait(&cancel))
        .await
        .unwrap()
        .unwrap()
}

#[tokio::test]
async fn test_edge_counted_as_the_step_is_cancelled_is_kept() {
    let daemon = Arc::new(Mutex::new(Daemon::default()));
    let backend = connect(&daemon).await;
    backend.prepare(1).await.unwrap();
    backend.set_position(DacPoint::new(-3, 9)).await.unwrap();
    {
        let mut d = daemon.lock().unwrap();
        d.log.clear();
        for _ in 0..10_000 {
            d.procp.push_back(Reply::status(script_status::WAITING, 1, 0));
        }
        // the edge arrives between the last poll and the stop
        d.on_stop = Some(Reply::status(script_status::HALTED, 0, 99));
    }

    let batch = arm_then_cancel(&backend).await.expect("counted edge reported");
    assert_eq!(batch.count, 1);
    assert_eq!(batch.position, DacPoint::new(-3, 9));

    let cmds = commands(&daemon);
    let tail: Vec<u32> = cmds.iter().rev().take(4).copied().collect();
    assert_eq!(tail, vec![cmd::TICK, cmd::PROCP, cmd::WRITE, cmd::PROCS]);
}

#[tokio::test]
async fn test_stopped_n_edges_reports_partial_count() {
    let daemon = Arc::new(Mutex::new(Daemon::default()));
    let backend = connect(&daemon).await;
    backend.prepare(5).await.unwrap();
    {
        let mut d = daemon.lock().unwrap();
        d.log.clear();
        for _ in 0..10_000 {
            d.procp.push_back(Reply::status(script_status::WAITING, 5, 0));
        }
        d.on_stop = Some(Reply::status(script_status::HALTED, 2, 0));
    }

    let batch = arm_then_cancel(&backend).await.expect("partial batch reported");
    assert_eq!(batch.count, 3);
    assert_eq!(batch.hw_timestamp_us, -5i32 as u32);
}
