//! Full scan through the real mirror link and ODMR client against fake
//! devices: an in-memory serial port and a local TCP board.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use hardware::mirror::{CalibrationTable, MirrorLink, VoltageCodec};
use hardware::odmr::{AcquisitionClient, ClientSettings, OdmrMsg, RequestSettings};
use prost::Message;
use raster::{ScanConfig, ScanEngine, ScanStatus};

const CALIBRATION_CSV: &str = "\
Реальное напряжение,Коэффициент заполнения ШИМ
8,0.4
12,0.6
";

struct FakePort {
    written: Arc<Mutex<Vec<u8>>>,
}

impl Read for FakePort {
    fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
        Err(std::io::ErrorKind::TimedOut.into())
    }
}

impl Write for FakePort {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.written.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Board that answers every poll with the next integer, starting at 1.
///
/// With `drop_first_poll` the first session is closed when its first poll
/// arrives, and counting continues on the next session.
fn spawn_counting_board(
    drop_first_poll: bool,
) -> (SocketAddr, Arc<Mutex<Vec<OdmrMsg>>>, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let received = Arc::new(Mutex::new(Vec::new()));
    let log = received.clone();
    let sessions = if drop_first_poll { 2 } else { 1 };

    let handle = std::thread::spawn(move || {
        let mut next = 1;
        for session in 0..sessions {
            let (mut sock, _) = listener.accept().unwrap();
            let mut buf = [0u8; 4096];
            loop {
                let n = match sock.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                let mut msg = OdmrMsg::decode(&buf[..n]).unwrap();
                log.lock().unwrap().push(msg.clone());
                if !msg.rw {
                    if drop_first_poll && session == 0 {
                        break;
                    }
                    let ch = msg.tx_ch.as_mut().unwrap();
                    ch.photon_cnt_val = vec![next];
                    ch.photon_cnt_len = 1;
                    next += 1;
                }
                if sock.write_all(&msg.encode_to_vec()).is_err() {
                    break;
                }
            }
        }
    });

    (addr, received, handle)
}

fn two_by_two() -> ScanConfig {
    ScanConfig {
        x_start: 0.0,
        x_stop: 2.0,
        x_step: 1.0,
        y_start: 0.0,
        y_stop: 2.0,
        y_step: 1.0,
        volts_per_micron: 0.4,
        integration_seconds: 0.005,
    }
}

#[test]
fn test_two_by_two_scan_end_to_end() {
    let calibration = Arc::new(CalibrationTable::from_reader(CALIBRATION_CSV.as_bytes()).unwrap());
    let written = Arc::new(Mutex::new(Vec::new()));
    let port = FakePort {
        written: written.clone(),
    };
    let mirror = MirrorLink::from_port("fake", Box::new(port), calibration);

    let (addr, received, board) = spawn_counting_board(false);
    let settings = ClientSettings {
        poll_delay: Duration::ZERO,
        ..ClientSettings::default()
    };
    let counter = AcquisitionClient::connect(addr, settings).unwrap();

    let config = two_by_two();
    let engine = ScanEngine::new(
        mirror,
        counter,
        VoltageCodec::default(),
        RequestSettings::default(),
    );
    let report = engine.run(&config).unwrap();

    // The engine closes the client, which ends the board's session
    board.join().unwrap();

    assert_eq!(report.status, ScanStatus::Complete);
    assert_eq!(report.invalid_points, 0);

    let counts = report.matrix.counts();
    assert_eq!(counts.shape(), &[2, 2]);
    assert_eq!(counts[[0, 0]], 1);
    assert_eq!(counts[[0, 1]], 2);
    assert_eq!(counts[[1, 0]], 3);
    assert_eq!(counts[[1, 1]], 4);

    // 0 V and 0.4 V centred to 10 V and 10.4 V
    let frames = String::from_utf8(written.lock().unwrap().clone()).unwrap();
    assert_eq!(frames, "0.500|0.500F0.500|0.520F0.520|0.500F0.520|0.520F");

    // One start and one poll per point, in that order
    let received = received.lock().unwrap();
    assert_eq!(received.len(), 8);
    for pair in received.chunks(2) {
        assert!(pair[0].rw);
        assert!(!pair[1].rw);
        assert_eq!(pair[0].tx_ch.as_ref().unwrap().pulse_width_us, 5_000);
    }

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["status"]["status"], "complete");
    assert_eq!(json["matrix"]["x_labels"], serde_json::json!([0.0, 1.0]));
}

#[test]
fn test_scan_resumes_after_dropped_session() {
    let calibration = Arc::new(CalibrationTable::from_reader(CALIBRATION_CSV.as_bytes()).unwrap());
    let port = FakePort {
        written: Arc::new(Mutex::new(Vec::new())),
    };
    let mirror = MirrorLink::from_port("fake", Box::new(port), calibration);

    let (addr, received, board) = spawn_counting_board(true);
    let settings = ClientSettings {
        poll_delay: Duration::ZERO,
        ..ClientSettings::default()
    };
    let counter = AcquisitionClient::connect(addr, settings).unwrap();

    let report = ScanEngine::new(
        mirror,
        counter,
        VoltageCodec::default(),
        RequestSettings::default(),
    )
    .run(&two_by_two())
    .unwrap();
    board.join().unwrap();

    assert_eq!(report.status, ScanStatus::Complete);
    assert_eq!(report.invalid_points, 1);

    let m = &report.matrix;
    assert!(m.is_complete());
    assert!(!m.get(0, 0).unwrap().valid);
    assert_eq!(m.get(0, 0).unwrap().photon_count, 0);

    // The next point runs on a fresh session and lines up with its cell
    let cell = m.cell(0, 1).unwrap();
    assert!(cell.result.valid);
    assert_eq!(cell.result.photon_count, 1);
    assert_eq!((cell.coordinate.x, cell.coordinate.y), (0.0, 1.0));
    assert_eq!(m.get(1, 0).unwrap().photon_count, 2);
    assert_eq!(m.get(1, 1).unwrap().photon_count, 3);

    // Dropped session saw start + poll, the new one three full cycles
    assert_eq!(received.lock().unwrap().len(), 8);
}
