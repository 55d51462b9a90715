//! In-process loopback transport.
//!
//! Connects a client channel to a data server task through two bounded byte
//! pipes, encoding every frame through the wire codec so the loopback
//! exercises exactly what a socket transport would. Flow control is real:
//! the client's inbound pump only drains while autoread is on, and the
//! server blocks once the bounded server-to-client pipe fills.

use super::{
    ChannelPool, FrameReceiver, FrameSender, FrameServer, InboundHandler, PacketChannel,
    TransportError,
};
use crate::protocol::Frame;
use async_trait::async_trait;
use bytes::BytesMut;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Default bound, in frames, of each direction of a loopback connection.
/// This is the peer's send window: once full, sends block until the other
/// side drains.
const DEFAULT_WINDOW: usize = 16;

/// Client half of one loopback connection.
pub struct LoopbackChannel {
    outbound: Mutex<Option<mpsc::Sender<bytes::Bytes>>>,
    handler: Mutex<Option<Arc<dyn InboundHandler>>>,
    autoread: watch::Sender<bool>,
    open: AtomicBool,
    shutdown: CancellationToken,
}

impl LoopbackChannel {
    /// Dial `server`, spawning its serving task and the inbound pump.
    pub fn connect(server: Arc<dyn FrameServer>, window: usize) -> Arc<Self> {
        let (c2s_tx, c2s_rx) = mpsc::channel::<bytes::Bytes>(window);
        let (s2c_tx, s2c_rx) = mpsc::channel::<bytes::Bytes>(window);
        let (autoread_tx, autoread_rx) = watch::channel(true);

        let channel = Arc::new(Self {
            outbound: Mutex::new(Some(c2s_tx)),
            handler: Mutex::new(None),
            autoread: autoread_tx,
            open: AtomicBool::new(true),
            shutdown: CancellationToken::new(),
        });

        let inbound = FrameReceiver::new(c2s_rx);
        let outbound = FrameSender::new(s2c_tx);
        tokio::spawn(async move {
            server.serve(inbound, outbound).await;
        });

        tokio::spawn(pump(
            Arc::downgrade(&channel),
            s2c_rx,
            autoread_rx,
            channel.shutdown.clone(),
        ));

        channel
    }

    /// Current autoread state. Test hook for observing flow control.
    pub fn autoread(&self) -> bool {
        *self.autoread.borrow()
    }

    /// Feed one frame into the client's inbound path, as if the peer had
    /// sent it. Test hook.
    pub fn push_inbound(&self, frame: Frame) {
        let handler = self.handler.lock().unwrap().clone();
        match (handler, frame) {
            (Some(h), Frame::Response(resp)) => h.on_response(resp),
            (Some(h), other) => {
                trace!(?other, "dropping non-response frame pushed to client");
                drop(h);
            }
            (None, _) => trace!("no handler attached, dropping pushed frame"),
        }
    }

    /// Report a transport failure to the attached handler and close the
    /// channel. Test hook.
    pub fn fail(&self, error: TransportError) {
        if let Some(handler) = self.handler.lock().unwrap().clone() {
            handler.on_failure(error);
        }
        self.close();
    }

    /// Simulate the peer hanging up without an error frame. Test hook.
    pub fn hang_up(&self) {
        let was_open = self.open.swap(false, Ordering::SeqCst);
        self.shutdown.cancel();
        *self.outbound.lock().unwrap() = None;
        if was_open {
            if let Some(handler) = self.handler.lock().unwrap().clone() {
                handler.on_closed();
            }
        }
    }

    fn mark_closed(&self) {
        self.open.store(false, Ordering::SeqCst);
        *self.outbound.lock().unwrap() = None;
    }
}

#[async_trait]
impl PacketChannel for LoopbackChannel {
    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        let sender = match self.outbound.lock().unwrap().clone() {
            Some(sender) if self.is_open() => sender,
            _ => return Err(TransportError::Closed),
        };
        let mut buf = BytesMut::new();
        frame.encode(&mut buf);
        if sender.send(buf.freeze()).await.is_err() {
            // Close on write failure so the channel is never half-dead.
            self.close();
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    fn set_autoread(&self, enabled: bool) {
        self.autoread.send_replace(enabled);
    }

    fn attach(&self, handler: Arc<dyn InboundHandler>) {
        *self.handler.lock().unwrap() = Some(handler);
    }

    fn detach(&self) {
        *self.handler.lock().unwrap() = None;
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            debug!("loopback channel closed");
        }
        self.shutdown.cancel();
        *self.outbound.lock().unwrap() = None;
        *self.handler.lock().unwrap() = None;
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

/// Inbound pump: decodes server-to-client bytes and delivers responses to
/// the attached handler, honouring the autoread gate between frames.
async fn pump(
    channel: Weak<LoopbackChannel>,
    mut rx: mpsc::Receiver<bytes::Bytes>,
    mut autoread: watch::Receiver<bool>,
    shutdown: CancellationToken,
) {
    let mut buf = BytesMut::new();
    loop {
        // Hold delivery while autoread is off.
        while !*autoread.borrow() {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                changed = autoread.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }

        match Frame::decode(&mut buf) {
            Ok(Some(frame)) => {
                let Some(channel) = channel.upgrade() else {
                    return;
                };
                let handler = channel.handler.lock().unwrap().clone();
                match (handler, frame) {
                    (Some(h), Frame::Response(resp)) => h.on_response(resp),
                    (Some(h), other) => {
                        warn!(?other, "unexpected frame type on client channel");
                        h.on_failure(TransportError::Protocol(
                            crate::protocol::ProtocolError::Io(
                                "unexpected frame type on client channel".into(),
                            ),
                        ));
                        channel.close();
                        return;
                    }
                    (None, _) => trace!("no handler attached, dropping inbound frame"),
                }
                continue;
            }
            Ok(None) => {}
            Err(e) => {
                if let Some(channel) = channel.upgrade() {
                    if let Some(h) = channel.handler.lock().unwrap().clone() {
                        h.on_failure(TransportError::Protocol(e));
                    }
                    channel.close();
                }
                return;
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => return,
            chunk = rx.recv() => match chunk {
                Some(bytes) => buf.extend_from_slice(&bytes),
                None => {
                    // Peer hung up without an error frame.
                    if let Some(channel) = channel.upgrade() {
                        let was_open = channel.open.swap(false, Ordering::SeqCst);
                        channel.mark_closed();
                        if was_open {
                            if let Some(h) = channel.handler.lock().unwrap().clone() {
                                h.on_closed();
                            }
                        }
                    }
                    return;
                }
            }
        }
    }
}

/// Channel pool over the loopback transport.
///
/// Every acquired channel talks to its own spawned serving task of the same
/// injected [`FrameServer`]. Released channels are kept for reuse while
/// open.
pub struct LoopbackTransport {
    server: Arc<dyn FrameServer>,
    window: usize,
    idle: Mutex<Vec<Arc<dyn PacketChannel>>>,
}

impl LoopbackTransport {
    /// Create a transport serving connections with `server`.
    pub fn new(server: Arc<dyn FrameServer>) -> Self {
        Self::with_window(server, DEFAULT_WINDOW)
    }

    /// Create a transport with a custom per-direction frame window.
    pub fn with_window(server: Arc<dyn FrameServer>, window: usize) -> Self {
        assert!(window > 0, "window must be > 0");
        Self {
            server,
            window,
            idle: Mutex::new(Vec::new()),
        }
    }

    /// Number of idle pooled channels. Test hook.
    pub fn idle_count(&self) -> usize {
        self.idle.lock().unwrap().len()
    }
}

#[async_trait]
impl ChannelPool for LoopbackTransport {
    async fn acquire(&self) -> Result<Arc<dyn PacketChannel>, TransportError> {
        loop {
            let reused = self.idle.lock().unwrap().pop();
            match reused {
                Some(channel) if channel.is_open() => return Ok(channel),
                Some(_) => continue,
                None => break,
            }
        }
        Ok(LoopbackChannel::connect(self.server.clone(), self.window))
    }

    fn release(&self, channel: Arc<dyn PacketChannel>) {
        if channel.is_open() {
            self.idle.lock().unwrap().push(channel);
        }
    }
}
