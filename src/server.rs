//! 多事件循环的传输层
//!
//! 接受线程按 `Balance` 策略把新连接分给N个事件循环线程。每个事件循环是一个单线程tokio运行时，
//! 连接状态只在所属线程上被访问。传输层只负责读写字节和执行 `Action`，
//! 命令语义全部在 `Connection` 里。除了TCP端口，还可以同时监听一个unix socket。

use crate::config::Balance;
use crate::conn::{Action, Closer, CommandConn, DataHandler, Detacher};
use crate::connection::{Connection, Services};
use crate::error::SlicedResult;
use rand::Rng;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::select;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinSet, LocalSet};
use tracing::{debug, info, warn};

const READ_BUFFER: usize = 16 * 1024;

pub struct Server {
    listener: TcpListener,
    unix: Option<(UnixListener, PathBuf)>,
    services: Services,
    loops: usize,
    balance: Balance,
}

impl Server {
    pub async fn bind(addr: &str, services: Services, loops: usize) -> SlicedResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            unix: None,
            services,
            loops: loops.max(1),
            balance: Balance::default(),
        })
    }

    pub fn with_balance(mut self, balance: Balance) -> Self {
        self.balance = balance;
        self
    }

    /// 同时在unix socket上接受连接，已存在的旧socket文件会被删除
    pub fn listen_unix(mut self, path: impl AsRef<Path>) -> SlicedResult<Self> {
        let path = path.as_ref().to_path_buf();
        match std::fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "removed stale unix socket"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        let listener = UnixListener::bind(&path)?;
        self.unix = Some((listener, path));
        Ok(self)
    }

    pub fn local_addr(&self) -> SlicedResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// 运行直到 `shutdown` 完成或某个连接发出 `SHUTDOWN`
    pub async fn run_until<F>(self, shutdown: F) -> SlicedResult<()>
    where
        F: Future<Output = ()>,
    {
        let Server {
            listener,
            unix,
            services,
            loops,
            balance,
        } = self;
        tokio::pin!(shutdown);

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let stop_tx = Arc::new(stop_tx);

        let mut placement = Placement {
            inboxes: Vec::with_capacity(loops),
            live: Vec::with_capacity(loops),
            balance,
            next: 0,
        };
        let mut handles = Vec::with_capacity(loops);
        for index in 0..loops {
            let (tx, rx) = mpsc::unbounded_channel();
            handles.push(spawn_loop(index, rx, services.clone(), stop_tx.clone())?);
            placement.inboxes.push(tx);
            placement.live.push(Arc::new(AtomicUsize::new(0)));
        }
        info!(
            addr = %listener.local_addr()?,
            unix = ?unix.as_ref().map(|(_, path)| path.display().to_string()),
            loops,
            ?balance,
            "server started"
        );

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
                _ = stop_rx.changed() => {
                    info!("shutdown command received");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let registered = stream
                            .set_nodelay(true)
                            .and_then(|()| stream.into_std());
                        match registered {
                            Ok(stream) => placement.place(Incoming::Tcp(stream)),
                            Err(err) => warn!(peer = %peer, error = ?err, "failed to hand off connection"),
                        }
                    }
                    Err(err) => warn!(error = ?err, "failed to accept connection"),
                },
                accepted = accept_unix(unix.as_ref().map(|(listener, _)| listener)) => {
                    match accepted.and_then(|stream| stream.into_std()) {
                        Ok(stream) => placement.place(Incoming::Unix(stream)),
                        Err(err) => warn!(error = ?err, "failed to accept unix connection"),
                    }
                }
            }
        }

        stop_tx.send_replace(true);
        drop(placement);
        let joined = tokio::task::spawn_blocking(move || {
            for handle in handles {
                if handle.join().is_err() {
                    warn!("event loop panicked");
                }
            }
        })
        .await;
        if let Err(err) = joined {
            warn!(error = ?err, "failed to join event loops");
        }
        if let Some((listener, path)) = unix {
            drop(listener);
            if let Err(err) = std::fs::remove_file(&path) {
                debug!(path = %path.display(), error = ?err, "failed to remove unix socket");
            }
        }
        info!("server stopped");
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> SlicedResult<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

async fn accept_unix(listener: Option<&UnixListener>) -> io::Result<UnixStream> {
    match listener {
        Some(listener) => listener.accept().await.map(|(stream, _)| stream),
        None => std::future::pending().await,
    }
}

/// 从接受线程的运行时上注销的连接，由事件循环重新注册
enum Incoming {
    Tcp(std::net::TcpStream),
    Unix(std::os::unix::net::UnixStream),
}

struct Accepted {
    stream: Incoming,
    live: Live,
}

/// 事件循环上的一个活跃连接，释放时计数减一
struct Live(Arc<AtomicUsize>);

impl Live {
    fn enter(count: Arc<AtomicUsize>) -> Self {
        count.fetch_add(1, Ordering::Relaxed);
        Live(count)
    }
}

impl Drop for Live {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// 接受线程持有的事件循环入口和各循环的活跃连接数
struct Placement {
    inboxes: Vec<mpsc::UnboundedSender<Accepted>>,
    live: Vec<Arc<AtomicUsize>>,
    balance: Balance,
    next: usize,
}

impl Placement {
    fn place(&mut self, stream: Incoming) {
        let counts: Vec<usize> = self
            .live
            .iter()
            .map(|count| count.load(Ordering::Relaxed))
            .collect();
        let index = pick_loop(self.balance, &counts, &mut self.next);
        let live = Live::enter(self.live[index].clone());
        if self.inboxes[index].send(Accepted { stream, live }).is_err() {
            warn!(index, "event loop is gone, dropping connection");
        }
    }
}

/// 按策略选出事件循环的下标，`live` 是各循环当前的连接数
fn pick_loop(balance: Balance, live: &[usize], next: &mut usize) -> usize {
    match balance {
        Balance::Random => rand::thread_rng().gen_range(0..live.len()),
        Balance::RoundRobin => {
            let index = *next % live.len();
            *next = next.wrapping_add(1);
            index
        }
        Balance::LeastConnections => live
            .iter()
            .enumerate()
            .min_by_key(|(_, count)| **count)
            .map_or(0, |(index, _)| index),
    }
}

fn spawn_loop(
    index: usize,
    inbox: mpsc::UnboundedReceiver<Accepted>,
    services: Services,
    stop: Arc<watch::Sender<bool>>,
) -> SlicedResult<JoinHandle<()>> {
    let handle = thread::Builder::new()
        .name(format!("sliced-loop-{}", index))
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(err) => {
                    warn!(index, error = ?err, "failed to build event loop runtime");
                    return;
                }
            };
            let local = LocalSet::new();
            local.block_on(&runtime, event_loop(index, inbox, services, stop));
        })?;
    Ok(handle)
}

async fn event_loop(
    index: usize,
    mut inbox: mpsc::UnboundedReceiver<Accepted>,
    services: Services,
    stop: Arc<watch::Sender<bool>>,
) {
    debug!(index, "event loop started");
    let mut stopped = stop.subscribe();
    let mut tasks = JoinSet::new();

    loop {
        select! {
            _ = stopped.wait_for(|s| *s) => break,
            incoming = inbox.recv() => {
                let Some(Accepted { stream, live }) = incoming else { break };
                match stream {
                    Incoming::Tcp(stream) => match TcpStream::from_std(stream) {
                        Ok(stream) => {
                            let peer = stream
                                .peer_addr()
                                .map_or_else(|_| "unknown".to_string(), |a| a.to_string());
                            let conn = services.accept();
                            tasks.spawn_local(serve(stream, peer, conn, stop.clone(), live));
                        }
                        Err(err) => warn!(index, error = ?err, "failed to register connection"),
                    },
                    Incoming::Unix(stream) => match UnixStream::from_std(stream) {
                        Ok(stream) => {
                            let conn = services.accept();
                            tasks.spawn_local(serve(stream, "unix".to_string(), conn, stop.clone(), live));
                        }
                        Err(err) => warn!(index, error = ?err, "failed to register unix connection"),
                    },
                }
            }
            Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
        }
    }

    while tasks.join_next().await.is_some() {}
    debug!(index, "event loop stopped");
}

/// 单个连接的读写循环；工作线程回复或订阅消息到达时由 `waker` 唤醒
async fn serve<S>(
    mut stream: S,
    peer: String,
    mut conn: Connection,
    stop: Arc<watch::Sender<bool>>,
    _live: Live,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    debug!(conn = conn.id(), peer = %peer, "connection accepted");

    let mut stopped = stop.subscribe();
    let wake = conn.waker();
    let mut buf = vec![0u8; READ_BUFFER];

    loop {
        let (out, action) = select! {
            read = stream.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => conn.on_data(&buf[..n]),
                Err(err) => {
                    debug!(conn = conn.id(), error = ?err, "read failed");
                    break;
                }
            },
            _ = wake.notified() => conn.on_data(&[]),
            _ = stopped.wait_for(|s| *s) => break,
        };

        if !out.is_empty() {
            if let Err(err) = stream.write_all(&out).await {
                debug!(conn = conn.id(), error = ?err, "write failed");
                break;
            }
        }

        match action {
            Action::None => {}
            Action::Close => break,
            Action::Shutdown => {
                info!(conn = conn.id(), peer = %peer, "shutdown requested by client");
                stop.send_replace(true);
                break;
            }
            Action::Detach => match conn.detach() {
                Ok(()) => {
                    conn.on_detach(Box::new(stream));
                    return;
                }
                Err(err) => {
                    warn!(conn = conn.id(), error = %err, "detach refused");
                    break;
                }
            },
        }
    }

    if let Err(err) = conn.close() {
        debug!(conn = conn.id(), error = %err, "close refused");
    }
    let _ = stream.shutdown().await;
    conn.on_closed();
}
