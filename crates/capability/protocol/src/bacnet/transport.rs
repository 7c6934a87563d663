//! BACnet/IP I/O 线程
//!
//! 一条线程独占 UDP 套接字：从有界请求队列中逐个取出确认型请求，
//! 负责 invoke id 分配、超时与重发；收到的非应答报文按服务号查分发表处理。

use super::codec::{Apdu, decode_frame, encode_frame, reject_reason};
use crate::error::{BacnetError, CodecError};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// 套接字读超时，也是队列与停止标志的检查周期
const RECV_POLL: Duration = Duration::from_millis(20);
const MAX_DATAGRAM: usize = 1500;
const REQUEST_QUEUE_DEPTH: usize = 64;
/// 超时无法表示为时间点时使用的等待上限
const FAR_FUTURE: Duration = Duration::from_secs(365 * 24 * 3600);

/// 主动上报处理器；返回 `Err(reason)` 时对确认型请求回复 Reject。
type Handler = Box<dyn Fn(SocketAddr, &[u8]) -> Result<(), u8> + Send>;

/// 按服务号注册的分发表，每个驱动实例一份。
#[derive(Default)]
pub(crate) struct Dispatcher {
    confirmed: HashMap<u8, Handler>,
    unconfirmed: HashMap<u8, Handler>,
}

impl Dispatcher {
    pub fn on_confirmed<F>(&mut self, service: u8, handler: F)
    where
        F: Fn(SocketAddr, &[u8]) -> Result<(), u8> + Send + 'static,
    {
        self.confirmed.insert(service, Box::new(handler));
    }

    pub fn on_unconfirmed<F>(&mut self, service: u8, handler: F)
    where
        F: Fn(SocketAddr, &[u8]) -> Result<(), u8> + Send + 'static,
    {
        self.unconfirmed.insert(service, Box::new(handler));
    }
}

#[derive(Debug, Clone)]
pub(crate) struct TransportConfig {
    pub local: SocketAddr,
    pub timeout: Duration,
    pub retries: u32,
    pub max_apdu: u16,
}

enum Command {
    Confirmed {
        destination: SocketAddr,
        service: u8,
        data: Bytes,
        reply: Sender<Result<Apdu, BacnetError>>,
    },
    Unconfirmed {
        destination: SocketAddr,
        broadcast: bool,
        frame: Bytes,
        reply: Sender<Result<(), BacnetError>>,
    },
}

pub(crate) struct Transport {
    commands: SyncSender<Command>,
    local: SocketAddr,
    timeout: Duration,
    retries: u32,
    stop: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Transport {
    /// 绑定本地端口并启动 I/O 线程。
    pub fn bind(
        config: TransportConfig,
        dispatcher: Dispatcher,
        name: &str,
    ) -> Result<Self, BacnetError> {
        let socket = UdpSocket::bind(config.local)?;
        socket.set_broadcast(true)?;
        socket.set_read_timeout(Some(RECV_POLL))?;
        let local = socket.local_addr()?;

        let (commands, queue) = mpsc::sync_channel(REQUEST_QUEUE_DEPTH);
        let stop = Arc::new(AtomicBool::new(false));
        let closed = Arc::new(AtomicBool::new(false));
        let pump = Pump {
            socket,
            queue,
            dispatcher,
            timeout: config.timeout,
            retries: config.retries,
            max_apdu: config.max_apdu,
            next_invoke_id: 0,
            pending: None,
            stop: Arc::clone(&stop),
            closed: Arc::clone(&closed),
        };
        let worker = thread::Builder::new()
            .name(format!("bacnet-io-{}", name))
            .spawn(move || pump.run())?;
        debug!(target: "collector.bacnet", local = %local, "bacnet socket bound");

        Ok(Self {
            commands,
            local,
            timeout: config.timeout,
            retries: config.retries,
            stop,
            closed,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// I/O 线程已退出（停止或套接字错误）
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// 确认型请求：阻塞到收到应答、重发耗尽或 I/O 线程退出。
    pub fn request(
        &self,
        destination: SocketAddr,
        service: u8,
        data: Bytes,
    ) -> Result<Apdu, BacnetError> {
        let (reply, response) = mpsc::channel();
        self.commands
            .send(Command::Confirmed {
                destination,
                service,
                data,
                reply,
            })
            .map_err(|_| BacnetError::Closed)?;

        // 截止时间由 I/O 线程负责，这里只防止等待一个已失效的线程
        let attempts = self.retries.saturating_add(1);
        match response.recv_timeout(reply_guard(self.timeout, attempts)) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(BacnetError::Timeout { attempts }),
            Err(RecvTimeoutError::Disconnected) => Err(BacnetError::Closed),
        }
    }

    /// 非确认型请求（单播或广播），发送完成即返回。
    pub fn send_unconfirmed(
        &self,
        destination: SocketAddr,
        broadcast: bool,
        apdu: &Apdu,
    ) -> Result<(), BacnetError> {
        let (reply, response) = mpsc::channel();
        self.commands
            .send(Command::Unconfirmed {
                destination,
                broadcast,
                frame: encode_frame(&apdu.encode(), broadcast, false),
                reply,
            })
            .map_err(|_| BacnetError::Closed)?;
        response.recv().map_err(|_| BacnetError::Closed)?
    }

    /// 停止 I/O 线程；排队中的请求以 `Closed` 结束。
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.worker.lock().take()
            && handle.thread().id() != thread::current().id()
        {
            let _ = handle.join();
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Pending {
    invoke_id: u8,
    destination: SocketAddr,
    frame: Bytes,
    attempts: u32,
    deadline: Instant,
    reply: Sender<Result<Apdu, BacnetError>>,
}

struct Pump {
    socket: UdpSocket,
    queue: Receiver<Command>,
    dispatcher: Dispatcher,
    timeout: Duration,
    retries: u32,
    max_apdu: u16,
    next_invoke_id: u8,
    pending: Option<Pending>,
    stop: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
}

impl Pump {
    fn run(mut self) {
        let mut buf = [0u8; MAX_DATAGRAM];
        let outcome = loop {
            if self.stop.load(Ordering::Acquire) {
                break Ok(());
            }
            if self.pending.is_none() {
                match self.queue.try_recv() {
                    Ok(command) => {
                        if let Err(err) = self.start(command) {
                            break Err(err);
                        }
                    }
                    Err(TryRecvError::Empty) => {}
                    Err(TryRecvError::Disconnected) => break Ok(()),
                }
            }
            match self.socket.recv_from(&mut buf) {
                Ok((len, source)) => {
                    if let Err(err) = self.handle_datagram(&buf[..len], source) {
                        break Err(err);
                    }
                }
                Err(err) if is_transient(&err) => {}
                Err(err) => break Err(err),
            }
            if let Err(err) = self.check_deadline() {
                break Err(err);
            }
        };

        self.closed.store(true, Ordering::Release);
        let failure = match outcome {
            Ok(()) => BacnetError::Closed,
            Err(err) => {
                warn!(target: "collector.bacnet", error = %err, "bacnet i/o thread stopped on socket error");
                BacnetError::Socket(err)
            }
        };
        if let Some(pending) = self.pending.take() {
            let _ = pending.reply.send(Err(failure));
        }
    }

    fn start(&mut self, command: Command) -> io::Result<()> {
        match command {
            Command::Confirmed {
                destination,
                service,
                data,
                reply,
            } => {
                let invoke_id = self.next_invoke_id;
                self.next_invoke_id = self.next_invoke_id.wrapping_add(1);
                let apdu = Apdu::ConfirmedRequest {
                    invoke_id,
                    service,
                    max_apdu: self.max_apdu,
                    data,
                };
                let frame = encode_frame(&apdu.encode(), false, true);
                self.pending = Some(Pending {
                    invoke_id,
                    destination,
                    frame: frame.clone(),
                    attempts: 1,
                    deadline: deadline_after(Instant::now(), self.timeout),
                    reply,
                });
                self.socket.send_to(&frame, destination)?;
            }
            Command::Unconfirmed {
                destination,
                broadcast,
                frame,
                reply,
            } => {
                if let Err(err) = self.socket.send_to(&frame, destination) {
                    let copy = io::Error::new(err.kind(), err.to_string());
                    let _ = reply.send(Err(BacnetError::Socket(copy)));
                    return Err(err);
                }
                debug!(target: "collector.bacnet", destination = %destination, broadcast, "unconfirmed request sent");
                let _ = reply.send(Ok(()));
            }
        }
        Ok(())
    }

    fn handle_datagram(&mut self, datagram: &[u8], source: SocketAddr) -> io::Result<()> {
        let apdu = match decode_frame(datagram) {
            Ok(Some(apdu)) => apdu,
            Ok(None) => return Ok(()),
            Err(err) => {
                debug!(target: "collector.bacnet", source = %source, error = %err, "dropping undecodable frame");
                return Ok(());
            }
        };

        match apdu {
            Apdu::ConfirmedRequest {
                invoke_id,
                service,
                ref data,
                ..
            } => {
                let response = match self.dispatcher.confirmed.get(&service) {
                    Some(handler) => match handler(source, &data[..]) {
                        Ok(()) => Apdu::SimpleAck { invoke_id, service },
                        Err(reason) => Apdu::Reject { invoke_id, reason },
                    },
                    None => Apdu::Reject {
                        invoke_id,
                        reason: reject_reason::UNRECOGNIZED_SERVICE,
                    },
                };
                self.socket
                    .send_to(&encode_frame(&response.encode(), false, false), source)?;
            }
            Apdu::UnconfirmedRequest { service, ref data } => {
                if let Some(handler) = self.dispatcher.unconfirmed.get(&service) {
                    let _ = handler(source, &data[..]);
                }
            }
            response => {
                let matches = self.pending.as_ref().is_some_and(|pending| {
                    response.invoke_id() == Some(pending.invoke_id)
                        && source.ip() == pending.destination.ip()
                });
                if !matches {
                    debug!(target: "collector.bacnet", source = %source, "ignoring unmatched response");
                    return Ok(());
                }
                if let Some(pending) = self.pending.take() {
                    let result = match response {
                        Apdu::SegmentAck { .. } => {
                            Err(BacnetError::Codec(CodecError::Segmented))
                        }
                        other => Ok(other),
                    };
                    let _ = pending.reply.send(result);
                }
            }
        }
        Ok(())
    }

    /// 超时重发；共发送 1 + retries 次后以超时结束。
    fn check_deadline(&mut self) -> io::Result<()> {
        let now = Instant::now();
        let Some(pending) = self.pending.as_mut() else {
            return Ok(());
        };
        if now < pending.deadline {
            return Ok(());
        }
        if pending.attempts <= self.retries {
            pending.attempts += 1;
            pending.deadline = deadline_after(now, self.timeout);
            debug!(
                target: "collector.bacnet",
                invoke_id = pending.invoke_id,
                attempt = pending.attempts,
                "retrying confirmed request"
            );
            self.socket.send_to(&pending.frame, pending.destination)?;
            return Ok(());
        }
        if let Some(pending) = self.pending.take() {
            let _ = pending.reply.send(Err(BacnetError::Timeout {
                attempts: pending.attempts,
            }));
        }
        Ok(())
    }
}

/// 调用方等待应答的上限：全部重发耗时再加一秒余量。
fn reply_guard(timeout: Duration, attempts: u32) -> Duration {
    timeout
        .saturating_mul(attempts)
        .saturating_add(Duration::from_secs(1))
}

fn deadline_after(now: Instant, timeout: Duration) -> Instant {
    now.checked_add(timeout)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

/// 读超时与对端不可达（ICMP）不视为套接字故障
fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
            | io::ErrorKind::Interrupted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bacnet::codec::service;

    fn config(timeout_ms: u64, retries: u32) -> TransportConfig {
        TransportConfig {
            local: "127.0.0.1:0".parse().expect("addr"),
            timeout: Duration::from_millis(timeout_ms),
            retries,
            max_apdu: 1476,
        }
    }

    #[test]
    fn silent_peer_times_out_after_all_attempts() {
        let peer = UdpSocket::bind("127.0.0.1:0").expect("bind peer");
        peer.set_read_timeout(Some(Duration::from_millis(500)))
            .expect("timeout");
        let transport = Transport::bind(config(50, 2), Dispatcher::default(), "test").expect("bind");

        let err = transport
            .request(
                peer.local_addr().expect("addr"),
                service::READ_PROPERTY,
                Bytes::from_static(&[0x0C, 0, 0, 0, 1, 0x19, 0x55]),
            )
            .expect_err("no answer");
        assert!(matches!(err, BacnetError::Timeout { attempts: 3 }));

        let mut buf = [0u8; 64];
        let mut received = 0;
        while peer.recv_from(&mut buf).is_ok() {
            received += 1;
        }
        assert_eq!(received, 3);
    }

    #[test]
    fn oversized_timeouts_saturate() {
        let now = Instant::now();
        assert_eq!(
            deadline_after(now, Duration::from_millis(10)),
            now + Duration::from_millis(10)
        );
        assert!(deadline_after(now, Duration::MAX) > now);

        assert_eq!(
            reply_guard(Duration::from_millis(100), 3),
            Duration::from_millis(1300)
        );
        assert_eq!(reply_guard(Duration::MAX, u32::MAX), Duration::MAX);
    }

    #[test]
    fn unknown_confirmed_service_is_rejected() {
        let peer = UdpSocket::bind("127.0.0.1:0").expect("bind peer");
        peer.set_read_timeout(Some(Duration::from_secs(2)))
            .expect("timeout");
        let transport = Transport::bind(config(100, 0), Dispatcher::default(), "test").expect("bind");

        let request = Apdu::ConfirmedRequest {
            invoke_id: 7,
            service: 30,
            max_apdu: 1476,
            data: Bytes::new(),
        };
        peer.send_to(&encode_frame(&request.encode(), false, true), transport.local_addr())
            .expect("send");
        let mut buf = [0u8; 64];
        let (len, _) = peer.recv_from(&mut buf).expect("reply");
        assert_eq!(
            decode_frame(&buf[..len]).expect("decode"),
            Some(Apdu::Reject {
                invoke_id: 7,
                reason: reject_reason::UNRECOGNIZED_SERVICE
            })
        );

        transport.shutdown();
        assert!(transport.is_closed());
    }
}
