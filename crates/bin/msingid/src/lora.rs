//! LoRa ingress
//!
//! Owns the serial port exclusively. One task drives the port through
//! `Closed -> Opening -> Configuring -> Ready -> Draining -> Closed`,
//! parsing unsolicited `+RCV=` lines into typed packets. Parsed packets
//! land on a bounded queue; when the verifier falls behind, the oldest
//! packet is dropped first.
//!
//! The loop is generic over the transport, so a replay of captured
//! lines exercises the identical parse path as the hardware port.

use crate::config::LoraCfg;
use crate::counters::Counters;
use crate::error::IngressError;
use crate::events::{EventHub, EventKind};
use msingi_core::packet::{decode_frame, parse_rcv_line, LoraPacket};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{watch, Notify};
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info, warn};

/// per-command response deadline during configuration
pub const CMD_TIMEOUT_MS: u64 = 2_000;

/// parsed packets buffered ahead of the verifier
pub const INGRESS_QUEUE_CAP: usize = 256;

/// delay before reopening a failed port
pub const RECONNECT_BACKOFF_S: u64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    Closed,
    Opening,
    Configuring,
    Ready,
    Draining,
}

/// bounded single-consumer packet queue, drop-oldest on overflow
pub struct IngressQueue {
    buf: Mutex<VecDeque<LoraPacket>>,
    notify: Notify,
    cap: usize,
}

impl IngressQueue {
    pub fn new(cap: usize) -> Self {
        Self {
            buf: Mutex::new(VecDeque::with_capacity(cap)),
            notify: Notify::new(),
            cap,
        }
    }

    /// returns true when an old packet was evicted to make room
    pub fn push(&self, packet: LoraPacket) -> bool {
        let mut buf = self.buf.lock().unwrap();
        let evicted = if buf.len() >= self.cap {
            buf.pop_front();
            true
        } else {
            false
        };
        buf.push_back(packet);
        drop(buf);
        self.notify.notify_one();
        evicted
    }

    pub async fn pop(&self) -> LoraPacket {
        loop {
            if let Some(packet) = self.buf.lock().unwrap().pop_front() {
                return packet;
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.buf.lock().unwrap().len()
    }
}

/// map bandwidth in kHz to the transceiver's AT parameter code
fn bw_code(bw_khz: u32) -> u32 {
    match bw_khz {
        125 => 7,
        250 => 8,
        500 => 9,
        // config validation rejects anything else before we get here
        other => unreachable!("unvalidated bandwidth {}", other),
    }
}

/// startup configuration batch, in send order
fn config_commands(cfg: &LoraCfg) -> Vec<String> {
    vec![
        format!("AT+NETWORKID={}", cfg.network_id),
        format!("AT+ADDRESS={}", cfg.address),
        format!("AT+BAND={}", cfg.freq_hz),
        format!("AT+PARAMETER={},{},1,12", cfg.sf, bw_code(cfg.bw_khz)),
        format!("AT+CRFOP={}", cfg.tx_power_dbm),
    ]
}

pub struct Ingress {
    cfg: LoraCfg,
    queue: Arc<IngressQueue>,
    counters: Arc<Counters>,
    hub: EventHub,
    /// exposed through /health
    ready: Arc<AtomicBool>,
}

impl Ingress {
    pub fn new(
        cfg: LoraCfg,
        queue: Arc<IngressQueue>,
        counters: Arc<Counters>,
        hub: EventHub,
        ready: Arc<AtomicBool>,
    ) -> Self {
        Self {
            cfg,
            queue,
            counters,
            hub,
            ready,
        }
    }

    /// open the serial device and keep it alive until shutdown
    pub async fn run_serial(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }
            info!("opening serial port {} @ {}", self.cfg.port, self.cfg.baud);
            match tokio_serial::new(&self.cfg.port, self.cfg.baud).open_native_async() {
                Ok(stream) => {
                    if let Err(e) = self.run_port(stream, &mut shutdown).await {
                        warn!("ingress stopped: {}", e);
                    }
                }
                Err(e) => warn!("serial open failed: {}", e),
            }
            debug!("port state: {:?}", PortState::Closed);
            self.ready.store(false, Ordering::Release);
            if *shutdown.borrow() {
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(RECONNECT_BACKOFF_S)) => {}
                _ = shutdown.changed() => return,
            }
        }
    }

    /// drive one opened transport through configure + receive
    pub async fn run_port<T>(
        &self,
        transport: T,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), IngressError>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut state = PortState::Opening;
        debug!("port state: {:?}", state);
        let (read_half, mut write_half) = tokio::io::split(transport);
        let mut reader = BufReader::new(read_half);

        state = PortState::Configuring;
        debug!("port state: {:?}", state);
        for cmd in config_commands(&self.cfg) {
            write_half
                .write_all(format!("{}\r\n", cmd).as_bytes())
                .await?;
            let response = self.await_response(&mut reader, &cmd).await?;
            if !response.starts_with("+OK") {
                return Err(IngressError::CommandRejected {
                    cmd,
                    response,
                });
            }
        }

        state = PortState::Ready;
        debug!("port state: {:?}", state);
        info!("lora port configured, receiving");
        self.ready.store(true, Ordering::Release);

        let mut line = String::new();
        loop {
            line.clear();
            tokio::select! {
                read = reader.read_line(&mut line) => {
                    match read? {
                        0 => return Err(IngressError::Eof),
                        _ => self.handle_line(line.trim_end()),
                    }
                }
                _ = shutdown.changed() => {
                    state = PortState::Draining;
                    debug!("port state: {:?}", state);
                    return Ok(());
                }
            }
        }
    }

    /// wait for a command response, skipping interleaved receive lines
    async fn await_response<R>(
        &self,
        reader: &mut BufReader<R>,
        cmd: &str,
    ) -> Result<String, IngressError>
    where
        R: AsyncRead + Unpin,
    {
        let deadline = Duration::from_millis(CMD_TIMEOUT_MS);
        let mut line = String::new();
        loop {
            line.clear();
            let read = tokio::time::timeout(deadline, reader.read_line(&mut line))
                .await
                .map_err(|_| IngressError::CommandTimeout {
                    cmd: cmd.to_string(),
                    timeout_ms: CMD_TIMEOUT_MS,
                })??;
            if read == 0 {
                return Err(IngressError::Eof);
            }
            let trimmed = line.trim_end();
            if trimmed.is_empty() {
                continue;
            }
            // data can arrive while we are still configuring
            if trimmed.starts_with("+RCV=") {
                self.handle_line(trimmed);
                continue;
            }
            return Ok(trimmed.to_string());
        }
    }

    fn handle_line(&self, line: &str) {
        if !line.starts_with("+RCV=") {
            // module chatter (+READY, echoes); nothing to do
            return;
        }
        let rcv = match parse_rcv_line(line) {
            Ok(rcv) => rcv,
            Err(e) => {
                self.counters
                    .packets_dropped
                    .fetch_add(1, Ordering::Relaxed);
                self.hub.publish(EventKind::PacketInvalid {
                    reason: "frame".into(),
                });
                debug!("unparseable receive line: {}", e);
                return;
            }
        };
        let packet = match decode_frame(&rcv) {
            Ok(packet) => packet,
            Err(e) => {
                self.counters
                    .packets_dropped
                    .fetch_add(1, Ordering::Relaxed);
                self.hub.publish(EventKind::PacketInvalid {
                    reason: "frame".into(),
                });
                debug!("undecodable frame from {}: {}", rcv.src_addr, e);
                return;
            }
        };

        self.counters
            .packets_received
            .fetch_add(1, Ordering::Relaxed);
        self.counters.record_rssi(packet.rssi);
        if self.queue.push(packet) {
            self.counters
                .packets_dropped
                .fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// in-memory transport replaying a capture of `+RCV=` lines
///
/// Answers `+OK` to every AT command, then streams the capture and
/// holds the pipe open. Byte-identical to the hardware path from the
/// ingress loop's point of view.
pub fn replay_transport(capture: Vec<String>) -> tokio::io::DuplexStream {
    let (near, far) = tokio::io::duplex(64 * 1024);
    tokio::spawn(async move {
        let (read_half, mut write_half) = tokio::io::split(far);
        let mut lines = BufReader::new(read_half).lines();
        let config_batch = config_commands(&LoraCfg::default()).len();
        let mut answered = 0usize;
        while answered < config_batch {
            match lines.next_line().await {
                Ok(Some(cmd)) if cmd.trim_start().starts_with("AT") => {
                    if write_half.write_all(b"+OK\r\n").await.is_err() {
                        return;
                    }
                    answered += 1;
                }
                Ok(Some(_)) => continue,
                _ => return,
            }
        }
        for line in capture {
            if write_half
                .write_all(format!("{}\r\n", line.trim_end()).as_bytes())
                .await
                .is_err()
            {
                return;
            }
        }
        // keep the port open; EOF would look like a transport failure
        std::future::pending::<()>().await;
    });
    near
}

/// read a capture file, one `+RCV=` line per row
pub fn load_capture(path: &std::path::Path) -> std::io::Result<Vec<String>> {
    let content = std::fs::read_to_string(path)?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use msingi_core::packet::FRAME_MIN_LEN;

    fn test_ingress() -> (Ingress, Arc<IngressQueue>, Arc<Counters>) {
        let queue = Arc::new(IngressQueue::new(8));
        let counters = Arc::new(Counters::default());
        let hub = EventHub::new(Clock::manual(0, 86_400));
        let ingress = Ingress::new(
            LoraCfg::default(),
            queue.clone(),
            counters.clone(),
            hub,
            Arc::new(AtomicBool::new(false)),
        );
        (ingress, queue, counters)
    }

    fn frame_line(commitment_byte: u8, timestamp_s: u32, rssi: i16) -> String {
        let mut frame = Vec::with_capacity(FRAME_MIN_LEN);
        frame.extend_from_slice(&[commitment_byte; 32]);
        frame.extend_from_slice(&25.0_f32.to_le_bytes());
        frame.extend_from_slice(&50.0_f32.to_le_bytes());
        frame.extend_from_slice(&1000.0_f32.to_le_bytes());
        frame.extend_from_slice(&40.0_f32.to_le_bytes());
        frame.extend_from_slice(&[0x5a; 64]);
        frame.extend_from_slice(&timestamp_s.to_le_bytes());
        format!("+RCV=7,{},{},{},10", frame.len(), hex::encode(&frame), rssi)
    }

    #[test]
    fn bandwidth_codes() {
        assert_eq!(bw_code(125), 7);
        assert_eq!(bw_code(250), 8);
        assert_eq!(bw_code(500), 9);
    }

    #[test]
    fn config_batch_shape() {
        let cmds = config_commands(&LoraCfg::default());
        assert_eq!(cmds.len(), 5);
        assert_eq!(cmds[0], "AT+NETWORKID=18");
        assert_eq!(cmds[1], "AT+ADDRESS=1");
        assert_eq!(cmds[2], "AT+BAND=868000000");
        assert_eq!(cmds[3], "AT+PARAMETER=9,7,1,12");
        assert_eq!(cmds[4], "AT+CRFOP=14");
    }

    #[test]
    fn queue_drops_oldest() {
        let queue = IngressQueue::new(2);
        let packet = |b: u8| {
            let rcv = parse_rcv_line(&frame_line(b, 0, -40)).unwrap();
            decode_frame(&rcv).unwrap()
        };
        assert!(!queue.push(packet(1)));
        assert!(!queue.push(packet(2)));
        assert!(queue.push(packet(3)));
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn replay_configures_then_delivers() {
        let (ingress, queue, counters) = test_ingress();
        let capture = vec![frame_line(0x01, 1_700_000_000, -42)];
        let transport = replay_transport(capture);

        let (_tx, mut shutdown) = watch::channel(false);
        let run = tokio::spawn(async move { ingress.run_port(transport, &mut shutdown).await });

        let packet = queue.pop().await;
        assert_eq!(packet.commitment.to_bytes(), [0x01; 32]);
        assert_eq!(packet.rssi, -42);
        assert_eq!(
            counters.packets_received.load(Ordering::Relaxed),
            1
        );
        run.abort();
    }

    #[tokio::test]
    async fn short_frames_counted_as_dropped() {
        let (ingress, queue, counters) = test_ingress();
        let short = format!("+RCV=7,4,{},-40,10", hex::encode([0u8; 4]));
        let capture = vec![short, frame_line(0x02, 5, -40)];
        let transport = replay_transport(capture);

        let (_tx, mut shutdown) = watch::channel(false);
        let run = tokio::spawn(async move { ingress.run_port(transport, &mut shutdown).await });

        // the good packet arrives; the short one only bumped the counter
        let packet = queue.pop().await;
        assert_eq!(packet.commitment.to_bytes(), [0x02; 32]);
        assert_eq!(counters.packets_dropped.load(Ordering::Relaxed), 1);
        assert_eq!(counters.packets_received.load(Ordering::Relaxed), 1);
        run.abort();
    }

    #[tokio::test]
    async fn silent_transport_times_out_configuration() {
        let (ingress, _, _) = test_ingress();
        // a pipe with nobody answering
        let (near, _far) = tokio::io::duplex(1024);

        let (_tx, mut shutdown) = watch::channel(false);
        let result = ingress.run_port(near, &mut shutdown).await;
        assert!(matches!(
            result,
            Err(IngressError::CommandTimeout { .. })
        ));
    }

    #[tokio::test]
    async fn command_rejection_aborts_configuration() {
        let (ingress, _, _) = test_ingress();
        let (near, far) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            let (read_half, mut write_half) = tokio::io::split(far);
            let mut lines = BufReader::new(read_half).lines();
            if let Ok(Some(_)) = lines.next_line().await {
                let _ = write_half.write_all(b"+ERR=17\r\n").await;
            }
            std::future::pending::<()>().await;
        });

        let (_tx, mut shutdown) = watch::channel(false);
        let result = ingress.run_port(near, &mut shutdown).await;
        assert!(matches!(
            result,
            Err(IngressError::CommandRejected { .. })
        ));
    }

    #[tokio::test]
    async fn ewma_rssi_updates_per_packet() {
        let (ingress, queue, counters) = test_ingress();
        let capture = vec![frame_line(1, 0, -40), frame_line(2, 0, -60)];
        let transport = replay_transport(capture);

        let (_tx, mut shutdown) = watch::channel(false);
        let run = tokio::spawn(async move { ingress.run_port(transport, &mut shutdown).await });

        queue.pop().await;
        queue.pop().await;
        let avg = counters.avg_rssi().unwrap();
        assert!((avg - (-40.0 * 0.9 + -60.0 * 0.1)).abs() < 1e-9);
        run.abort();
    }
}
