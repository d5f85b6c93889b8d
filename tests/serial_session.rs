mod common;

use std::sync::Arc;
use std::time::Duration;

use _core::{
    AxonSerial, BoardId, DriverError, HandshakeState, MemoryCatalog, SerialHandshakeManager,
    SerialParams, Transport, SERIAL_STOP_BYTE,
};
use common::*;

const INIT_PACKET: &[u8] = b"\nAXON 2 2\r";

fn ready_link() -> MockLink {
    let link = MockLink::new();
    link.reply("p", INIT_PACKET);
    link
}

fn manager(link: &MockLink) -> SerialHandshakeManager<MockOpener> {
    SerialHandshakeManager::new(MockOpener::new(link.clone()), fast_serial_config())
}

#[test]
fn handshake_derives_layout_from_init_packet() {
    let link = ready_link();
    let mut manager = manager(&link);

    let layout = manager.prepare("/dev/ttyUSB0", 2).unwrap();

    assert_eq!(manager.state(), HandshakeState::Ready);
    assert_eq!(layout.channel_count, 16);
    assert_eq!(layout.total_row_count, 20);
    assert!(link.written().starts_with("cp"));
}

#[test]
fn prepare_is_a_no_op_when_ready() {
    let link = ready_link();
    let mut manager = manager(&link);
    manager.prepare("/dev/ttyUSB0", 2).unwrap();
    let written = link.written();

    let layout = manager.prepare("/dev/ttyUSB0", 2).unwrap();
    assert_eq!(layout.channel_count, 16);
    assert_eq!(link.written(), written);
}

#[test]
fn silent_board_fails_with_board_not_ready() {
    let link = MockLink::new();
    let mut manager = manager(&link);

    let err = manager.prepare("/dev/ttyUSB0", 1).unwrap_err();

    assert!(matches!(err, DriverError::BoardNotReady(_)));
    assert_eq!(manager.state(), HandshakeState::Failed);
    let written = link.written();
    // the init request is repeated while waiting, and the board is reset on failure
    assert!(written.matches('p').count() >= 2, "written: {written:?}");
    assert!(written.ends_with('c'));
}

#[test]
fn init_packet_without_start_byte_is_malformed() {
    let link = MockLink::new();
    link.reply("p", b"AXON 2 2\r");
    let mut manager = manager(&link);

    let err = manager.prepare("/dev/ttyUSB0", 1).unwrap_err();
    assert!(matches!(err, DriverError::MalformedInitPacket(_)));
    assert_eq!(manager.state(), HandshakeState::Failed);
}

#[test]
fn open_failures_are_classified() {
    let mut opener = MockOpener::new(MockLink::new());
    opener.outcome = OpenOutcome::Busy;
    let mut manager = SerialHandshakeManager::new(opener, fast_serial_config());
    assert!(matches!(
        manager.prepare("/dev/ttyUSB0", 1),
        Err(DriverError::PortAlreadyOpen(_))
    ));

    let mut opener = MockOpener::new(MockLink::new());
    opener.outcome = OpenOutcome::Missing;
    let mut manager = SerialHandshakeManager::new(opener, fast_serial_config());
    assert!(matches!(
        manager.prepare("/dev/ttyUSB9", 1),
        Err(DriverError::UnableToOpen { .. })
    ));
    assert_eq!(manager.state(), HandshakeState::Failed);

    let mut manager =
        SerialHandshakeManager::new(MockOpener::new(MockLink::new()), fast_serial_config());
    assert!(matches!(
        manager.prepare("", 1),
        Err(DriverError::InvalidArgument(_))
    ));
}

#[test]
fn settings_failure_resets_board() {
    let link = ready_link();
    link.fail_settings();
    let mut manager = manager(&link);

    let err = manager.prepare("/dev/ttyUSB0", 1).unwrap_err();
    assert!(matches!(err, DriverError::SetPortError(_)));
    assert_eq!(link.written(), "c");
}

#[test]
fn commands_require_a_prepared_session() {
    let link = ready_link();
    let mut manager = manager(&link);
    let (sink, _) = collecting_sink();

    assert!(matches!(
        manager.send_command("v", true),
        Err(DriverError::NotReady(_))
    ));
    assert!(matches!(
        manager.start_streaming(Arc::clone(&sink)),
        Err(DriverError::NotReady(_))
    ));
    assert!(matches!(
        manager.stop_streaming(),
        Err(DriverError::StreamNotRunning)
    ));
}

#[test]
fn send_command_returns_board_reply() {
    let link = ready_link();
    link.reply("v", b"AXON fw 1.4\r\n");
    let mut manager = manager(&link);
    manager.prepare("/dev/ttyUSB0", 2).unwrap();

    assert_eq!(manager.send_command("v", true).unwrap(), "AXON fw 1.4\r\n");
    assert_eq!(manager.send_command("v", false).unwrap(), "");
}

#[test]
fn streaming_decodes_frames_and_resyncs_after_noise() {
    let link = ready_link();
    let good = data_frame(16, 0x0102, 87, SERIAL_STOP_BYTE);
    let mut corrupt = good.clone();
    *corrupt.last_mut().unwrap() = 0x0D;

    let mut stream = vec![0x55];
    stream.extend_from_slice(&good);
    stream.extend_from_slice(&corrupt);
    stream.extend_from_slice(&good);
    link.reply_once("b", &stream);

    let mut manager = manager(&link);
    let layout = manager.prepare("/dev/ttyUSB0", 2).unwrap();
    let (sink, records) = collecting_sink();
    manager.start_streaming(sink).unwrap();
    assert_eq!(manager.state(), HandshakeState::Streaming);

    assert!(wait_for_records(&records, 2, Duration::from_secs(5)));
    manager.stop_streaming().unwrap();
    assert_eq!(manager.state(), HandshakeState::Ready);

    let records = records.lock().unwrap();
    assert_eq!(records.len(), 2);
    for record in records.iter() {
        assert_eq!(record.len(), 20);
        assert_eq!(record[0], 1.0);
        assert_eq!(record[15], 16.0);
        assert_eq!(record[layout.status_channel_index], 258.0);
        assert_eq!(record[layout.battery_channel_index], 87.0);
        assert!(record[layout.timestamp_channel_index.unwrap()] > 0.0);
        assert_eq!(record[layout.marker_channel_index.unwrap()], 0.0);
    }

    let stats = manager.stats().unwrap();
    assert_eq!(stats.accepted(), 2);
    // the corrupt frame carries a start byte inside its samples, so more
    // than one candidate can be rejected before the next good frame
    assert!(stats.dropped() >= 1);
    assert_eq!(stats.resync_bytes(), 1);
    assert!(link.written().ends_with("bbh"));
}

#[test]
fn stray_start_byte_does_not_swallow_the_next_frame() {
    let link = ready_link();
    let good = data_frame(16, 0x0102, 87, SERIAL_STOP_BYTE);
    let mut stream = vec![0x0A];
    stream.extend_from_slice(&good);
    stream.extend_from_slice(&good);
    link.reply_once("b", &stream);

    let mut manager = manager(&link);
    let layout = manager.prepare("/dev/ttyUSB0", 2).unwrap();
    let (sink, records) = collecting_sink();
    manager.start_streaming(sink).unwrap();

    assert!(wait_for_records(&records, 2, Duration::from_secs(5)));
    manager.stop_streaming().unwrap();

    let records = records.lock().unwrap();
    assert_eq!(records.len(), 2);
    for record in records.iter() {
        assert_eq!(record[0], 1.0);
        assert_eq!(record[15], 16.0);
        assert_eq!(record[layout.battery_channel_index], 87.0);
    }
    let stats = manager.stats().unwrap();
    assert_eq!(stats.accepted(), 2);
    assert_eq!(stats.dropped(), 1);
    assert_eq!(stats.resync_bytes(), 0);
}

#[test]
fn start_twice_is_rejected() {
    let link = ready_link();
    let mut manager = manager(&link);
    manager.prepare("/dev/ttyUSB0", 2).unwrap();
    let (sink, _) = collecting_sink();

    manager.start_streaming(Arc::clone(&sink)).unwrap();
    assert!(matches!(
        manager.start_streaming(sink),
        Err(DriverError::StreamAlreadyRunning)
    ));
    manager.stop_streaming().unwrap();
}

#[test]
fn release_is_idempotent() {
    let link = ready_link();
    let mut manager = manager(&link);
    manager.prepare("/dev/ttyUSB0", 2).unwrap();
    let (sink, _) = collecting_sink();
    manager.start_streaming(sink).unwrap();

    manager.release();
    assert_eq!(manager.state(), HandshakeState::Released);
    let written = link.written();
    assert!(written.ends_with("hc"), "written: {written:?}");

    manager.release();
    assert_eq!(link.written(), written);
    assert!(manager.layout().is_none());
}

#[test]
fn release_before_prepare_touches_nothing() {
    let link = ready_link();
    let mut manager = manager(&link);

    manager.release();
    manager.release();

    assert_eq!(manager.state(), HandshakeState::Released);
    assert_eq!(link.written(), "");
    assert!(manager.layout().is_none());
    assert!(manager.stats().is_none());
}

#[test]
fn release_after_failed_prepare_is_safe() {
    let link = MockLink::new();
    let mut manager = manager(&link);
    manager.prepare("/dev/ttyUSB0", 1).unwrap_err();
    let written = link.written();

    manager.release();
    manager.release();

    assert_eq!(manager.state(), HandshakeState::Released);
    assert_eq!(link.written(), written);
}

#[test]
fn transport_publishes_serial_descriptor() {
    let link = ready_link();
    let catalog = Arc::new(MemoryCatalog::new());
    let (sink, _) = collecting_sink();
    let mut board = AxonSerial::new(
        MockOpener::new(link.clone()),
        fast_serial_config(),
        SerialParams {
            port_name: "/dev/ttyUSB0".into(),
            timeout_secs: 2,
        },
        sink,
        Some(catalog.clone()),
    );

    assert_eq!(board.board_id(), BoardId::AxonSerial);
    board.prepare_session().unwrap();
    let descr = catalog.get(BoardId::AxonSerial).unwrap();
    assert_eq!(descr.num_rows, 20);
    assert_eq!(descr.eeg_channels, (0..16).collect::<Vec<_>>());
    assert_eq!(board.layout().unwrap().channel_count, 16);

    board.release_session();
    board.release_session();
    assert!(matches!(
        board.start_stream(),
        Err(DriverError::NotReady(_))
    ));
}
