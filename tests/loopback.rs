use buffered_spi::sim::{EchoPeer, ScriptedPeer, SimBus, SimPin};
use buffered_spi::{BufferConfig, BufferedSpi, Error, IrqType, OutputPin};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn config(buf_size: usize, tx_multiple: usize, blocking: bool) -> BufferConfig {
    BufferConfig {
        buf_size,
        tx_multiple,
        blocking,
        name: Some("loopback".to_string()),
        ..BufferConfig::default()
    }
}

fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn test_blocking_write_larger_than_buffer_keeps_order() {
    let bus = Arc::new(SimBus::threaded(ScriptedPeer::new(0xFF)));
    let nss = Arc::new(SimPin::new(true));
    let spi = BufferedSpi::new(
        Arc::clone(&bus),
        Arc::clone(&nss),
        SimPin::new(false),
        &config(8, 1, true),
    )
    .unwrap();

    let payload: Vec<u8> = (0..200u32).map(|i| (i % 250) as u8 + 1).collect();
    assert_eq!(spi.write(&payload), Ok(payload.len()));

    wait_until(|| spi.tx_pending() == 0 && !spi.is_active());
    assert_eq!(bus.with_peer(|peer| peer.received().to_vec()), payload);
    assert!(!nss.is_set_low());
    assert_eq!(spi.stats().tx_bytes, 200);
}

#[test]
fn test_blocking_read_waits_for_peer() {
    let bus = Arc::new(SimBus::threaded(ScriptedPeer::new(0xFF)));
    let ready = bus.data_ready_line();
    let spi = Arc::new(
        BufferedSpi::new(Arc::clone(&bus), SimPin::new(true), ready, &config(16, 1, true)).unwrap(),
    );

    let reader_spi = Arc::clone(&spi);
    let reader = thread::spawn(move || {
        let mut buf = [0u8; 16];
        let n = reader_spi.read(&mut buf).unwrap();
        buf[..n].to_vec()
    });

    thread::sleep(Duration::from_millis(20));
    bus.with_peer(|peer| peer.queue(b"+OK"));

    let mut received = reader.join().unwrap();
    // The first read returns as soon as anything arrived; collect the rest.
    wait_until(|| received.len() + spi.available() >= 3);
    let mut rest = [0u8; 16];
    spi.set_blocking(false);
    if let Ok(n) = spi.read(&mut rest) {
        received.extend_from_slice(&rest[..n]);
    }
    assert_eq!(received, b"+OK".to_vec());
}

#[test]
fn test_echo_roundtrip_with_callbacks() {
    let bus = Arc::new(SimBus::threaded(EchoPeer::new(0)));
    let ready = bus.data_ready_line();
    let spi = BufferedSpi::new(Arc::clone(&bus), SimPin::new(true), ready, &config(64, 4, false))
        .unwrap();

    let drained = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&drained);
    spi.attach(
        Some(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })),
        IrqType::Tx,
    );

    assert_eq!(spi.puts("AT+VER"), Ok(7));
    wait_until(|| !spi.is_active() && drained.load(Ordering::SeqCst) > 0);

    let mut out = Vec::new();
    let mut buf = [0u8; 64];
    loop {
        match spi.read(&mut buf) {
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(Error::WouldBlock) => break,
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
    let text: Vec<u8> = out.into_iter().filter(|&b| b != 0).collect();
    assert_eq!(text, b"AT+VER\n".to_vec());
}

#[test]
fn test_drop_while_interrupts_running() {
    let bus = Arc::new(SimBus::threaded(EchoPeer::new(0)));
    let ready = bus.data_ready_line();
    let spi = BufferedSpi::new(Arc::clone(&bus), SimPin::new(true), ready, &config(16, 4, false))
        .unwrap();
    spi.write(&[1u8; 64]).unwrap();
    drop(spi);
    // Nothing is bound any more; the bus keeps working on its own.
    thread::sleep(Duration::from_millis(10));
    assert!(!bus.is_busy());
}

#[test]
fn test_small_nonblocking_writes_never_strand_bytes() {
    let bus = Arc::new(SimBus::threaded(ScriptedPeer::new(0xFF)));
    let nss = Arc::new(SimPin::new(true));
    let spi = BufferedSpi::new(
        Arc::clone(&bus),
        Arc::clone(&nss),
        SimPin::new(false),
        &config(4, 1, false),
    )
    .unwrap();

    // One byte at a time keeps hitting the window where the interrupt side goes idle.
    let mut sent = Vec::new();
    for i in 0..5_000u32 {
        let byte = (i % 251) as u8;
        loop {
            match spi.write(&[byte]) {
                Ok(1) => break,
                Err(Error::WouldBlock) => thread::yield_now(),
                other => panic!("unexpected write result: {:?}", other),
            }
        }
        sent.push(byte);
        if i % 7 == 0 {
            wait_until(|| spi.tx_pending() == 0 && !spi.is_active());
        }
    }

    // Every queued byte goes out without another write to kick the bus.
    wait_until(|| spi.tx_pending() == 0 && !spi.is_active());
    assert_eq!(bus.with_peer(|peer| peer.received().to_vec()), sent);
    assert!(!nss.is_set_low());
}
