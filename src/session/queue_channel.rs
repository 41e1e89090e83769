use crate::channel::Channel;
use crate::error::Result;
use crate::log::LogLevel::{LogDebug, LogPacket};
use crate::message_queue::MessageQueue;
use crate::session::packet::{PacketCodec, PacketEvent};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

/// What the session thread sees when it asks for the next event.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SessionEvent {
    Packet(Vec<u8>),
    Interrupt,
    /// Undecoded channel bytes, delivered only by a raw-mode channel.
    Raw(Vec<u8>),
    Closed,
}

/// Buffers a channel behind a reader worker so the session can consume
/// events synchronously while bytes keep arriving. Outbound packets are
/// serialized through a mutex.
///
/// Cooked construction (`new`) decodes inbound bytes in the worker: whole
/// packets are enqueued, `+`/`-` acknowledgement traffic is answered from
/// the worker, and 0x03 is promoted to an Interrupt event (plus the
/// out-of-band hook). Raw construction (`new_raw`, platform sessions,
/// which drive no inferior) enqueues the bytes untouched and leaves all
/// framing to the consumer.
pub struct QueueChannel {
    channel: Arc<Channel>,
    queue: Arc<MessageQueue<SessionEvent>>,
    codec: Arc<Mutex<PacketCodec>>,
    last_sent: Arc<Mutex<Vec<u8>>>,
    interrupt_hook: Arc<Mutex<Option<Box<dyn Fn() + Send>>>>,
    reader: Option<JoinHandle<()>>,
}

impl QueueChannel {
    pub fn new(channel: Channel) -> QueueChannel {
        QueueChannel::with_mode(channel, false)
    }

    /// A channel whose reader performs no decoding; `receive` yields
    /// `SessionEvent::Raw`.
    pub fn new_raw(channel: Channel) -> QueueChannel {
        QueueChannel::with_mode(channel, true)
    }

    fn with_mode(channel: Channel, raw: bool) -> QueueChannel {
        let channel = Arc::new(channel);
        let queue = Arc::new(MessageQueue::new());
        let codec = Arc::new(Mutex::new(PacketCodec::new()));
        let last_sent: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        let interrupt_hook: Arc<Mutex<Option<Box<dyn Fn() + Send>>>> = Arc::new(Mutex::new(None));

        let reader = {
            let channel = Arc::clone(&channel);
            let queue = Arc::clone(&queue);
            let codec = Arc::clone(&codec);
            let last_sent = Arc::clone(&last_sent);
            let interrupt_hook = Arc::clone(&interrupt_hook);
            thread::spawn(move || {
                reader_loop(&channel, &queue, &codec, &last_sent, &interrupt_hook, raw)
            })
        };

        QueueChannel {
            channel,
            queue,
            codec,
            last_sent,
            interrupt_hook,
            reader: Some(reader),
        }
    }

    /// Called from the reader thread when 0x03 arrives. The hook must be
    /// cheap and must not touch session-owned state: it exists to unblock a
    /// session thread parked in waitpid (SIGSTOP + wait-interrupt arm).
    pub fn set_interrupt_hook(&self, hook: Box<dyn Fn() + Send>) {
        *self.interrupt_hook.lock().unwrap() = Some(hook);
    }

    pub fn clear_interrupt_hook(&self) {
        *self.interrupt_hook.lock().unwrap() = None;
    }

    pub fn set_no_ack_mode(&self, enabled: bool) {
        self.codec.lock().unwrap().set_no_ack_mode(enabled);
    }

    /// Frame and transmit one packet.
    pub fn send_packet(&self, payload: &[u8]) -> Result<()> {
        let frame = PacketCodec::encode(payload);
        log!(LogPacket, "send: {}", String::from_utf8_lossy(payload));
        let mut last = self.last_sent.lock().unwrap();
        self.channel.send(&frame)?;
        *last = frame;
        Ok(())
    }

    /// Unframed write, for acknowledgement bytes emitted by a raw-mode
    /// consumer doing its own framing.
    pub fn send_bytes(&self, bytes: &[u8]) -> Result<()> {
        self.channel.send(bytes)
    }

    /// Retransmit the most recent packet (`-` from the peer).
    pub fn resend_last(&self) -> Result<()> {
        let last = self.last_sent.lock().unwrap();
        if last.is_empty() {
            return Ok(());
        }
        self.channel.send(&last)
    }

    /// Next event, blocking. In cooked mode interrupts are delivered as
    /// events; raw bytes only appear on a raw-mode channel.
    pub fn receive(&self, cooked: bool) -> SessionEvent {
        loop {
            match self.queue.get(-1) {
                Some(SessionEvent::Interrupt) if !cooked => continue,
                Some(event) => return event,
                None => return SessionEvent::Closed,
            }
        }
    }

    /// Non-blocking variant used to drain stale events.
    pub fn try_receive(&self) -> Option<SessionEvent> {
        self.queue.get(0)
    }

    pub fn close(&self) {
        self.channel.close();
    }
}

impl Drop for QueueChannel {
    fn drop(&mut self) {
        self.close();
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

fn reader_loop(
    channel: &Channel,
    queue: &MessageQueue<SessionEvent>,
    codec: &Mutex<PacketCodec>,
    last_sent: &Mutex<Vec<u8>>,
    interrupt_hook: &Mutex<Option<Box<dyn Fn() + Send>>>,
    raw: bool,
) {
    let mut buf = [0u8; 8192];
    loop {
        let n = match channel.receive(&mut buf) {
            Ok(0) | Err(_) => {
                queue.put(SessionEvent::Closed);
                return;
            }
            Ok(n) => n,
        };
        if raw {
            queue.put(SessionEvent::Raw(buf[..n].to_vec()));
            continue;
        }
        let (events, ack) = {
            let mut codec = codec.lock().unwrap();
            (codec.feed(&buf[..n]), !codec.no_ack_mode())
        };
        for event in events {
            match event {
                PacketEvent::Packet(payload) => {
                    if ack {
                        let _ = channel.send(b"+");
                    }
                    log!(LogPacket, "recv: {}", String::from_utf8_lossy(&payload));
                    queue.put(SessionEvent::Packet(payload));
                }
                PacketEvent::ChecksumError => {
                    log!(LogDebug, "received frame with bad checksum");
                    if ack {
                        let _ = channel.send(b"-");
                    }
                }
                PacketEvent::Ack => {}
                PacketEvent::Nak => {
                    // Peer wants the last packet again.
                    let last = last_sent.lock().unwrap();
                    if !last.is_empty() {
                        let _ = channel.send(&last);
                    }
                }
                PacketEvent::Interrupt => {
                    log!(LogDebug, "interrupt request from debugger");
                    if let Some(hook) = interrupt_hook.lock().unwrap().as_ref() {
                        hook();
                    }
                    queue.put(SessionEvent::Interrupt);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn socketpair() -> (Channel, Channel) {
        let mut fds = [0; 2];
        let rc =
            unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
        assert_eq!(rc, 0);
        (Channel::from_fd(fds[0]), Channel::from_fd(fds[1]))
    }

    fn read_some(peer: &Channel) -> Vec<u8> {
        let mut buf = [0u8; 256];
        assert!(peer.wait(2000));
        let n = peer.receive(&mut buf).unwrap();
        buf[..n].to_vec()
    }

    #[test]
    fn packets_flow_through_the_queue() {
        let (local, peer) = socketpair();
        let qc = QueueChannel::new(local);
        peer.send(b"$qSupported#37").unwrap();
        assert_eq!(
            qc.receive(true),
            SessionEvent::Packet(b"qSupported".to_vec())
        );
        // The worker acknowledged on our behalf.
        assert_eq!(read_some(&peer), b"+");
    }

    #[test]
    fn bad_checksum_is_nacked() {
        let (local, peer) = socketpair();
        let _qc = QueueChannel::new(local);
        peer.send(b"$qSupported#00").unwrap();
        assert_eq!(read_some(&peer), b"-");
    }

    #[test]
    fn interrupt_fires_hook_and_event() {
        use std::sync::atomic::{AtomicBool, Ordering};
        let fired = Arc::new(AtomicBool::new(false));
        let (local, peer) = socketpair();
        let qc = QueueChannel::new(local);
        let flag = Arc::clone(&fired);
        qc.set_interrupt_hook(Box::new(move || flag.store(true, Ordering::SeqCst)));
        peer.send(&[0x03]).unwrap();
        assert_eq!(qc.receive(true), SessionEvent::Interrupt);
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn raw_mode_delivers_undecoded_bytes() {
        let (local, peer) = socketpair();
        let qc = QueueChannel::new_raw(local);
        // One write: an interrupt byte and a frame, neither interpreted.
        let mut bytes = vec![0x03];
        bytes.extend_from_slice(b"$qC#b4");
        peer.send(&bytes).unwrap();
        assert_eq!(qc.receive(false), SessionEvent::Raw(bytes));
        // No acknowledgement came back: the worker did not decode.
        assert!(!peer.wait(100));
    }

    #[test]
    fn peer_close_ends_the_session() {
        let (local, peer) = socketpair();
        let qc = QueueChannel::new(local);
        peer.close();
        assert_eq!(qc.receive(true), SessionEvent::Closed);
    }

    #[test]
    fn nak_triggers_retransmission() {
        let (local, peer) = socketpair();
        let qc = QueueChannel::new(local);
        qc.send_packet(b"OK").unwrap();
        let first = read_some(&peer);
        assert_eq!(first, PacketCodec::encode(b"OK"));
        peer.send(b"-").unwrap();
        let again = read_some(&peer);
        assert_eq!(again, PacketCodec::encode(b"OK"));
    }

    #[test]
    fn resend_last_repeats_the_packet() {
        let (local, peer) = socketpair();
        let qc = QueueChannel::new_raw(local);
        qc.resend_last().unwrap();
        qc.send_packet(b"OK").unwrap();
        assert_eq!(read_some(&peer), PacketCodec::encode(b"OK"));
        qc.resend_last().unwrap();
        assert_eq!(read_some(&peer), PacketCodec::encode(b"OK"));
    }
}
