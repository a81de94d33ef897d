//! 命令连接 - 分发契约的具体实现
//!
//! 每个连接独占一个解码器，部分到达的帧在多次 `on_data` 之间保留。
//! 连接级命令（PING、QUIT、订阅、模式切换等）在本地应答，
//! 其余命令按连接类型交给Raft服务或后端执行器。
//!
//! 交给工作线程的命令不会阻塞 `on_data`：它之后的回复先排在发件箱里，
//! 回复按序号到达后再一起写出，所以流水线命令的回复顺序不变。
//! 回复到达或订阅消息投递时，`waker()` 返回的 `Notify` 被通知，
//! 事件循环随后用空输入调用 `on_data` 取走输出。

use crate::conn::{
    Action, BoxStream, Classify, Closer, CommandConn, ConnId, ConnKind, DataHandler, Detacher,
    DrainOwner, Durability, Handoff, StreamOwner,
};
use crate::decoder::{Decoder, Limits};
use crate::error::{SlicedError, SlicedResult};
use crate::executor::{Backend, Request, Route, Submitted};
use crate::fastlane::{self, Received};
use crate::http::{self, Sniff};
use crate::pubsub::{Hub, Subscriber};
use crate::raft::RaftService;
use crate::value::{self, Value};
use bytes::{Bytes, BytesMut};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// 所有连接共享的服务，接受连接时用它创建 `Connection`
#[derive(Clone)]
pub struct Services {
    pub backend: Backend,
    pub hub: Hub,
    pub raft: Option<Arc<dyn RaftService>>,
    pub owner: Arc<dyn StreamOwner>,
    pub durability: Durability,
    pub limits: Limits,
    next_id: Arc<AtomicU64>,
}

impl Services {
    pub fn new(backend: Backend) -> Self {
        Self {
            backend,
            hub: Hub::new(),
            raft: None,
            owner: Arc::new(DrainOwner),
            durability: Durability::default(),
            limits: Limits::default(),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn with_raft(mut self, raft: Arc<dyn RaftService>) -> Self {
        self.raft = Some(raft);
        self
    }

    pub fn with_owner(mut self, owner: Arc<dyn StreamOwner>) -> Self {
        self.owner = owner;
        self
    }

    pub fn with_durability(mut self, durability: Durability) -> Self {
        self.durability = durability;
        self
    }

    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    /// 为新接受的连接创建状态
    pub fn accept(&self) -> Connection {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let wake = Arc::new(Notify::new());
        Connection {
            id,
            kind: ConnKind::Command,
            state: State::Open,
            decoder: Decoder::with_limits(self.limits),
            durability: self.durability,
            raft: self.raft.clone(),
            raft_session: false,
            route: self.backend.connect(wake.clone()),
            wake,
            outbox: VecDeque::new(),
            replies: HashMap::new(),
            deferred: None,
            hub: self.hub.clone(),
            owner: self.owner.clone(),
            topics: BTreeSet::new(),
            mailbox: None,
            preface: Bytes::new(),
            served: 0,
            released: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Open,
    Closing,
    Closed,
    Detaching,
    Detached,
}

struct Mailbox {
    tx: fastlane::Sender<Value>,
    rx: fastlane::Receiver<Value>,
}

/// 发件箱中的一段输出
enum Outgoing {
    Ready(BytesMut),
    /// 等待工作线程带着这个序号回复
    Waiting(u64),
}

pub struct Connection {
    id: ConnId,
    kind: ConnKind,
    state: State,
    decoder: Decoder,
    durability: Durability,
    raft: Option<Arc<dyn RaftService>>,
    raft_session: bool,
    route: Route,
    wake: Arc<Notify>,
    /// 排在未完成回复之后的输出
    outbox: VecDeque<Outgoing>,
    replies: HashMap<u64, Value>,
    /// 要等发件箱清空后才返回的动作
    deferred: Option<Action>,
    hub: Hub,
    owner: Arc<dyn StreamOwner>,
    topics: BTreeSet<Bytes>,
    mailbox: Option<Mailbox>,
    /// 移交时一并交出的未处理字节
    preface: Bytes,
    served: u64,
    released: bool,
}

impl Connection {
    pub fn is_detached(&self) -> bool {
        matches!(self.state, State::Detaching | State::Detached)
    }

    pub fn subscriptions(&self) -> usize {
        self.topics.len()
    }

    /// 有输出可取时被通知，事件循环等待它之后调用 `on_data(&[])`
    pub fn waker(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    /// 是否还有工作线程的回复没有到达
    pub fn has_pending(&self) -> bool {
        !self.outbox.is_empty()
    }

    /// 处理一条命令，回复写入 `out`
    fn dispatch(&mut self, command: Value, out: &mut BytesMut) -> Action {
        self.served += 1;

        let args: Option<Vec<Bytes>> = match command {
            Value::Array(items) => items.into_iter().map(Value::into_bytes).collect(),
            _ => None,
        };
        let Some(args) = args.filter(|a| !a.is_empty()) else {
            Value::error("ERR Protocol error: expected a non-empty array of bulk strings")
                .encode(out);
            return Action::None;
        };

        let name = String::from_utf8_lossy(&args[0]).to_ascii_uppercase();
        debug!(conn = self.id, kind = %self.kind, command = %name, "dispatch");

        if self.kind == ConnKind::PubSub
            && !matches!(name.as_str(), "SUBSCRIBE" | "UNSUBSCRIBE" | "PING" | "QUIT")
        {
            Value::error(format!(
                "ERR Can't execute '{}': only (UN)SUBSCRIBE / PING / QUIT are allowed in this context",
                name.to_ascii_lowercase()
            ))
            .encode(out);
            return Action::None;
        }

        match name.as_str() {
            "PING" => match (self.kind, args.len()) {
                // 订阅模式下按推送格式回复
                (ConnKind::PubSub, 1 | 2) => Value::Array(vec![
                    Value::bulk("pong"),
                    Value::BulkString(args.get(1).cloned().unwrap_or_default()),
                ])
                .encode(out),
                (_, 1) => value::PONG.encode(out),
                (_, 2) => Value::BulkString(args[1].clone()).encode(out),
                _ => wrong_arity(&args[0]).encode(out),
            },

            "ECHO" => match args.len() {
                2 => Value::BulkString(args[1].clone()).encode(out),
                _ => wrong_arity(&args[0]).encode(out),
            },

            "QUIT" => {
                value::OK.encode(out);
                return Action::Close;
            }

            "SHUTDOWN" => {
                value::OK.encode(out);
                return Action::Shutdown;
            }

            "SUBSCRIBE" => {
                if args.len() < 2 {
                    wrong_arity(&args[0]).encode(out);
                } else {
                    self.subscribe(&args[1..], out);
                }
            }

            "UNSUBSCRIBE" => self.unsubscribe(&args[1..], out),

            "PUBLISH" => {
                if args.len() != 3 {
                    wrong_arity(&args[0]).encode(out);
                } else {
                    let receivers = self.hub.publish(&args[1], &args[2]);
                    Value::Integer(receivers as i64).encode(out);
                }
            }

            "RAFT" => self.enter_raft(out),

            "QUEUE" => {
                self.set_kind(ConnKind::Queue);
                value::OK.encode(out);
            }

            "INSTALL" => {
                self.set_kind(ConnKind::Install);
                value::OK.encode(out);
                return Action::Detach;
            }

            _ => self.forward(args, out),
        }

        Action::None
    }

    /// 非本地命令：Raft模式交给Raft服务，其他交给后端执行器
    fn forward(&mut self, args: Vec<Bytes>, out: &mut BytesMut) {
        let submitted = if self.kind == ConnKind::Raft {
            Submitted::Done(match &self.raft {
                Some(raft) => raft.apply(self.id, args, self.durability),
                None => Value::Error(SlicedError::Unavailable("raft").to_reply_text()),
            })
        } else {
            self.route.submit(Request {
                args,
                kind: self.kind,
                durability: self.durability,
            })
        };

        match submitted {
            Submitted::Done(reply) => reply.encode(out),
            Submitted::Pending(seq) => {
                self.outbox.push_back(Outgoing::Ready(out.split()));
                self.outbox.push_back(Outgoing::Waiting(seq));
            }
        }
    }

    /// 解码并分发缓冲区中的命令，直到需要更多数据或出现非 `None` 的动作
    fn process(&mut self, out: &mut BytesMut) -> Action {
        loop {
            if self.kind == ConnKind::Command && self.served == 0 {
                match self.sniff_http(out) {
                    Some(Action::None) => return Action::None,
                    Some(verdict) => return verdict,
                    None => {}
                }
            }

            let command = match self.decoder.next_command() {
                Ok(Some(command)) => command,
                Ok(None) => return Action::None,
                Err(e) => {
                    warn!(conn = self.id, error = %e, "protocol error");
                    Value::Error(SlicedError::from(e).to_reply_text()).encode(out);
                    return Action::Close;
                }
            };
            let action = self.dispatch(command, out);
            if action != Action::None {
                return action;
            }
        }
    }

    /// 把已到达的工作线程回复放进发件箱，返回现在可以写出的字节
    fn flush(&mut self, out: BytesMut) -> BytesMut {
        while let Some((seq, reply)) = self.route.try_reply() {
            self.replies.insert(seq, reply);
        }
        if self.outbox.is_empty() {
            return out;
        }
        if !out.is_empty() {
            self.outbox.push_back(Outgoing::Ready(out));
        }

        let mut ready = BytesMut::new();
        while let Some(next) = self.outbox.pop_front() {
            match next {
                Outgoing::Ready(bytes) => ready.extend_from_slice(&bytes),
                Outgoing::Waiting(seq) => match self.replies.remove(&seq) {
                    Some(reply) => reply.encode(&mut ready),
                    None => {
                        self.outbox.push_front(Outgoing::Waiting(seq));
                        break;
                    }
                },
            }
        }
        ready
    }

    fn subscribe(&mut self, topics: &[Bytes], out: &mut BytesMut) {
        let mailbox = self.mailbox.get_or_insert_with(|| {
            let (tx, rx) = fastlane::channel();
            Mailbox { tx, rx }
        });
        for topic in topics {
            if self.topics.insert(topic.clone()) {
                let subscriber = Subscriber {
                    mailbox: mailbox.tx.clone(),
                    wake: self.wake.clone(),
                };
                self.hub.subscribe(topic.clone(), self.id, &subscriber);
            }
            Value::Array(vec![
                Value::bulk("subscribe"),
                Value::BulkString(topic.clone()),
                Value::Integer(self.topics.len() as i64),
            ])
            .encode(out);
        }
        self.set_kind(ConnKind::PubSub);
    }

    fn unsubscribe(&mut self, topics: &[Bytes], out: &mut BytesMut) {
        let targets: Vec<Bytes> = if topics.is_empty() {
            self.topics.iter().cloned().collect()
        } else {
            topics.to_vec()
        };

        if targets.is_empty() {
            Value::Array(vec![Value::bulk("unsubscribe"), value::NIL, Value::Integer(0)])
                .encode(out);
        }
        for topic in targets {
            if self.topics.remove(&topic) {
                self.hub.unsubscribe(&topic, self.id);
            }
            Value::Array(vec![
                Value::bulk("unsubscribe"),
                Value::BulkString(topic),
                Value::Integer(self.topics.len() as i64),
            ])
            .encode(out);
        }

        if self.topics.is_empty() && self.kind == ConnKind::PubSub {
            self.set_kind(ConnKind::Command);
        }
    }

    fn enter_raft(&mut self, out: &mut BytesMut) {
        let Some(raft) = self.raft.clone() else {
            Value::Error(SlicedError::Unavailable("raft").to_reply_text()).encode(out);
            return;
        };
        if !self.raft_session {
            if let Err(e) = raft.open_session(self.id) {
                Value::Error(e.to_reply_text()).encode(out);
                return;
            }
            self.raft_session = true;
        }
        self.set_kind(ConnKind::Raft);
        value::OK.encode(out);
    }

    /// 把邮箱中待发送的消息写入 `out`
    fn drain_mailbox(&mut self, out: &mut BytesMut) {
        if let Some(mailbox) = self.mailbox.as_mut() {
            while let Some(Received::Value(message)) = mailbox.rx.try_recv() {
                message.encode(out);
            }
        }
    }

    /// 处理HTTP请求行，返回 `None` 表示不是HTTP或还需要更多数据
    fn sniff_http(&mut self, out: &mut BytesMut) -> Option<Action> {
        match http::sniff(self.decoder.buffered()) {
            Sniff::NotHttp => None,
            Sniff::Incomplete => Some(Action::None),
            Sniff::Request(req) => {
                self.served += 1;
                if req.is_websocket_upgrade() {
                    self.set_kind(ConnKind::WebSocket);
                    Some(Action::Detach)
                } else {
                    self.set_kind(ConnKind::Http);
                    self.decoder.consume(req.head_len);
                    out.extend_from_slice(&http::respond(&req));
                    Some(Action::Close)
                }
            }
        }
    }

    /// 释放订阅和Raft会话，只执行一次
    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        for topic in std::mem::take(&mut self.topics) {
            self.hub.unsubscribe(&topic, self.id);
        }
        if self.raft_session {
            if let Some(raft) = &self.raft {
                raft.release_session(self.id);
            }
            self.raft_session = false;
        }
    }
}

impl Classify for Connection {
    fn kind(&self) -> ConnKind {
        self.kind
    }

    fn set_kind(&mut self, kind: ConnKind) {
        if self.kind != kind {
            debug!(conn = self.id, from = %self.kind, to = %kind, "connection kind changed");
            self.kind = kind;
        }
    }
}

impl DataHandler for Connection {
    fn on_data(&mut self, input: &[u8]) -> (BytesMut, Action) {
        let mut out = BytesMut::new();
        match self.state {
            State::Open => {}
            State::Closing | State::Closed => return (out, Action::Close),
            State::Detaching | State::Detached => {
                warn!(conn = self.id, "on_data after detach ignored");
                return (out, Action::None);
            }
        }

        self.decoder.feed(input);
        self.drain_mailbox(&mut out);

        // 上一个动作还没返回时不再解码新命令，后到的字节留在缓冲区
        if self.deferred.is_none() {
            let action = self.process(&mut out);
            if action != Action::None {
                self.deferred = Some(action);
            }
        }

        let out = self.flush(out);
        if self.has_pending() {
            return (out, Action::None);
        }
        (out, self.deferred.take().unwrap_or(Action::None))
    }
}

impl Closer for Connection {
    fn close(&mut self) -> SlicedResult<()> {
        match self.state {
            State::Open => {
                self.state = State::Closing;
                Ok(())
            }
            State::Closing | State::Closed => Ok(()),
            State::Detaching | State::Detached => Err(SlicedError::Detached),
        }
    }

    fn on_closed(&mut self) {
        if matches!(self.state, State::Closed | State::Detaching | State::Detached) {
            return;
        }
        self.state = State::Closed;
        self.release();
        debug!(conn = self.id, kind = %self.kind, served = self.served, "connection closed");
    }
}

impl Detacher for Connection {
    fn detach(&mut self) -> SlicedResult<()> {
        match self.state {
            State::Open => {
                self.state = State::Detaching;
                self.preface = self.decoder.take_buffered();
                Ok(())
            }
            State::Detaching | State::Detached => Err(SlicedError::Detached),
            State::Closing | State::Closed => Err(SlicedError::Closed),
        }
    }

    fn on_detach(&mut self, stream: BoxStream) {
        if self.state != State::Detaching {
            warn!(conn = self.id, state = ?self.state, "unexpected detach, dropping stream");
            return;
        }
        self.state = State::Detached;
        self.release();
        debug!(conn = self.id, kind = %self.kind, "stream detached");
        self.owner.adopt(Handoff {
            conn: self.id,
            kind: self.kind,
            preface: std::mem::take(&mut self.preface),
            stream,
        });
    }
}

impl CommandConn for Connection {
    fn id(&self) -> ConnId {
        self.id
    }

    fn durability(&self) -> Durability {
        self.durability
    }

    fn raft(&self) -> Option<Arc<dyn RaftService>> {
        self.raft.clone()
    }

    fn set_raft(&mut self, raft: Arc<dyn RaftService>) {
        if self.raft_session {
            if let Some(old) = &self.raft {
                old.release_session(self.id);
            }
            self.raft_session = false;
        }
        self.raft = Some(raft);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.release();
    }
}

fn wrong_arity(name: &Bytes) -> Value {
    Value::Error(
        SlicedError::WrongNumberOfArguments(String::from_utf8_lossy(name).to_ascii_lowercase())
            .to_reply_text(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{Executor, StoreExecutor, Worker};
    use crate::raft::SingleNode;
    use rand::Rng;
    use std::sync::Mutex;
    use std::thread;
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct Recorder {
        adopted: Mutex<Vec<(ConnKind, Bytes)>>,
    }

    impl StreamOwner for Recorder {
        fn adopt(&self, handoff: Handoff) {
            self.adopted
                .lock()
                .unwrap()
                .push((handoff.kind, handoff.preface));
        }
    }

    #[derive(Default)]
    struct CountingRaft {
        released: Mutex<Vec<ConnId>>,
    }

    impl RaftService for CountingRaft {
        fn open_session(&self, _conn: ConnId) -> SlicedResult<()> {
            Ok(())
        }

        fn apply(&self, _conn: ConnId, args: Vec<Bytes>, durability: Durability) -> Value {
            Value::Array(vec![
                Value::BulkString(args[0].clone()),
                Value::simple(durability.as_str()),
            ])
        }

        fn release_session(&self, conn: ConnId) {
            self.released.lock().unwrap().push(conn);
        }
    }

    fn services() -> Services {
        Services::new(Backend::inline(StoreExecutor::default()))
    }

    fn run(conn: &mut Connection, input: &[u8]) -> (Vec<u8>, Action) {
        let (out, action) = conn.on_data(input);
        (out.to_vec(), action)
    }

    /// SLOW 命令先睡一会儿再回复，其余命令交给内存存储
    #[derive(Default)]
    struct SlowExecutor {
        inner: StoreExecutor,
    }

    impl Executor for SlowExecutor {
        fn execute(&self, request: Request) -> Value {
            if request.args[0].eq_ignore_ascii_case(b"SLOW") {
                thread::sleep(Duration::from_millis(200));
                return Value::bulk("slow");
            }
            self.inner.execute(request)
        }
    }

    /// 反复用空输入轮询，直到工作线程的回复全部写出
    fn settle(conn: &mut Connection, input: &[u8]) -> (Vec<u8>, Action) {
        let deadline = Instant::now() + Duration::from_secs(5);
        let (mut out, mut action) = run(conn, input);
        while conn.has_pending() {
            assert!(Instant::now() < deadline, "worker reply missing");
            thread::sleep(Duration::from_millis(1));
            let (more, next) = run(conn, b"");
            out.extend_from_slice(&more);
            action = next;
        }
        (out, action)
    }

    fn stream() -> BoxStream {
        let (a, _b) = tokio::io::duplex(64);
        Box::new(a)
    }

    #[test]
    fn test_partial_frame_waits() {
        let mut conn = services().accept();
        assert_eq!(run(&mut conn, b"*1\r\n$4\r\nPI"), (vec![], Action::None));
        assert_eq!(run(&mut conn, b"NG\r\n"), (b"+PONG\r\n".to_vec(), Action::None));
    }

    #[test]
    fn test_pipelined_inline_and_multibulk() {
        let mut conn = services().accept();
        let (out, action) = run(
            &mut conn,
            b"PING\r\n*2\r\n$4\r\nECHO\r\n$2\r\nhi\r\nSET k v\r\nGET k\r\n",
        );
        assert_eq!(out, b"+PONG\r\n$2\r\nhi\r\n+OK\r\n$1\r\nv\r\n".to_vec());
        assert_eq!(action, Action::None);
    }

    #[test]
    fn test_protocol_error_closes() {
        let mut conn = services().accept();
        let (out, action) = run(&mut conn, b"*1\r\n$x\r\n");
        assert_eq!(out, b"-ERR Protocol error: illegal bytes in length\r\n".to_vec());
        assert_eq!(action, Action::Close);
    }

    #[test]
    fn test_quit_and_shutdown() {
        let mut conn = services().accept();
        assert_eq!(run(&mut conn, b"QUIT\r\nPING\r\n"), (b"+OK\r\n".to_vec(), Action::Close));

        let mut conn = services().accept();
        assert_eq!(run(&mut conn, b"shutdown\r\n"), (b"+OK\r\n".to_vec(), Action::Shutdown));
    }

    #[test]
    fn test_wrong_arity() {
        let mut conn = services().accept();
        let (out, _) = run(&mut conn, b"ECHO\r\n");
        assert_eq!(out, b"-ERR wrong number of arguments for 'echo' command\r\n".to_vec());
    }

    #[test]
    fn test_fragmented_pipeline() {
        let mut rng = rand::thread_rng();
        let mut wire = BytesMut::new();
        let mut expected = BytesMut::new();
        for i in 0..30 {
            let msg = format!("message-{}", i);
            Value::Array(vec![Value::bulk("ECHO"), Value::bulk(msg.clone())]).encode(&mut wire);
            Value::bulk(msg).encode(&mut expected);
        }

        let mut conn = services().accept();
        let mut out = Vec::new();
        let mut pos = 0;
        while pos < wire.len() {
            let step = rng.gen_range(1..=11).min(wire.len() - pos);
            let (chunk, action) = run(&mut conn, &wire[pos..pos + step]);
            assert_eq!(action, Action::None);
            out.extend_from_slice(&chunk);
            pos += step;
        }
        assert_eq!(out, expected.to_vec());
    }

    #[test]
    fn test_pubsub_flow() {
        let services = services();
        let mut sub = services.accept();
        let mut publisher = services.accept();

        let (out, _) = run(&mut sub, b"SUBSCRIBE news\r\n");
        assert_eq!(out, b"*3\r\n$9\r\nsubscribe\r\n$4\r\nnews\r\n:1\r\n".to_vec());
        assert_eq!(sub.kind(), ConnKind::PubSub);

        let (out, _) = run(&mut publisher, b"PUBLISH news hello\r\n");
        assert_eq!(out, b":1\r\n".to_vec());

        let (out, _) = run(&mut sub, b"");
        assert_eq!(
            out,
            b"*3\r\n$7\r\nmessage\r\n$4\r\nnews\r\n$5\r\nhello\r\n".to_vec()
        );

        let (out, _) = run(&mut sub, b"GET k\r\n");
        assert!(out.starts_with(b"-ERR Can't execute 'get'"));

        let (out, _) = run(&mut sub, b"PING\r\nPING hi\r\n");
        assert_eq!(
            out,
            b"*2\r\n$4\r\npong\r\n$0\r\n\r\n*2\r\n$4\r\npong\r\n$2\r\nhi\r\n".to_vec()
        );

        let (out, _) = run(&mut sub, b"UNSUBSCRIBE\r\n");
        assert_eq!(out, b"*3\r\n$11\r\nunsubscribe\r\n$4\r\nnews\r\n:0\r\n".to_vec());
        assert_eq!(sub.kind(), ConnKind::Command);
        assert_eq!(run(&mut sub, b"PING\r\n").0, b"+PONG\r\n".to_vec());
    }

    #[test]
    fn test_on_closed_unsubscribes_once() {
        let services = services();
        let mut sub = services.accept();
        let mut publisher = services.accept();
        run(&mut sub, b"SUBSCRIBE a b\r\n");
        assert_eq!(sub.subscriptions(), 2);

        sub.close().unwrap();
        sub.close().unwrap();
        assert_eq!(run(&mut sub, b"PING\r\n"), (vec![], Action::Close));
        sub.on_closed();
        sub.on_closed();

        assert_eq!(run(&mut publisher, b"PUBLISH a x\r\n").0, b":0\r\n".to_vec());
        assert_eq!(services.hub.topic_count(), 0);
    }

    #[test]
    fn test_install_detaches_exactly_once() {
        let recorder = Arc::new(Recorder::default());
        let services = services().with_owner(recorder.clone());
        let mut conn = services.accept();

        let (out, action) = run(&mut conn, b"INSTALL\r\nsnapshot-bytes");
        assert_eq!(out, b"+OK\r\n".to_vec());
        assert_eq!(action, Action::Detach);
        assert_eq!(conn.kind(), ConnKind::Install);

        conn.detach().unwrap();
        conn.on_detach(stream());
        assert!(conn.is_detached());

        let adopted = recorder.adopted.lock().unwrap().clone();
        assert_eq!(
            adopted,
            vec![(ConnKind::Install, Bytes::from_static(b"snapshot-bytes"))]
        );

        assert_eq!(run(&mut conn, b"PING\r\n"), (vec![], Action::None));
        assert!(matches!(conn.close(), Err(SlicedError::Detached)));
        assert!(matches!(conn.detach(), Err(SlicedError::Detached)));
        conn.on_detach(stream());
        assert_eq!(recorder.adopted.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_detach_after_close_is_rejected() {
        let mut conn = services().accept();
        conn.close().unwrap();
        assert!(matches!(conn.detach(), Err(SlicedError::Closed)));
    }

    #[test]
    fn test_raft_mode() {
        let mut conn = services().accept();
        let (out, _) = run(&mut conn, b"RAFT\r\n");
        assert_eq!(out, b"-ERR raft unavailable\r\n".to_vec());
        assert_eq!(conn.kind(), ConnKind::Command);

        let executor = Arc::new(StoreExecutor::default());
        let raft = Arc::new(SingleNode::new(executor.clone()));
        let services = services()
            .with_raft(raft.clone())
            .with_durability(Durability::High);
        let mut conn = services.accept();
        assert_eq!(run(&mut conn, b"RAFT\r\n").0, b"+OK\r\n".to_vec());
        assert_eq!(conn.kind(), ConnKind::Raft);
        assert_eq!(run(&mut conn, b"SET k v\r\n").0, b"+OK\r\n".to_vec());
        assert_eq!(raft.commit_index(), 1);
        assert_eq!(executor.store().get(b"k"), Some(Bytes::from_static(b"v")));

        conn.close().unwrap();
        conn.on_closed();
        assert_eq!(raft.session_count(), 0);
    }

    #[test]
    fn test_raft_receives_durability() {
        let raft = Arc::new(CountingRaft::default());
        let services = services()
            .with_raft(raft.clone())
            .with_durability(Durability::Low);
        let mut conn = services.accept();
        run(&mut conn, b"RAFT\r\n");
        let (out, _) = run(&mut conn, b"INCR x\r\n");
        assert_eq!(out, b"*2\r\n$4\r\nINCR\r\n+low\r\n".to_vec());

        let id = conn.id();
        drop(conn);
        assert_eq!(*raft.released.lock().unwrap(), vec![id]);
    }

    #[test]
    fn test_set_raft_releases_old_session() {
        let old = Arc::new(CountingRaft::default());
        let mut conn = services().with_raft(old.clone()).accept();
        run(&mut conn, b"RAFT\r\n");

        let new = Arc::new(CountingRaft::default());
        conn.set_raft(new.clone());
        assert_eq!(*old.released.lock().unwrap(), vec![conn.id()]);
        assert!(conn.raft().is_some());

        // 换了服务之后需要重新打开会话
        run(&mut conn, b"RAFT\r\n");
        drop(conn);
        assert_eq!(new.released.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_queue_kind_passes_through() {
        let mut conn = services().accept();
        assert_eq!(run(&mut conn, b"QUEUE\r\n").0, b"+OK\r\n".to_vec());
        assert_eq!(conn.kind(), ConnKind::Queue);
        let (out, _) = run(&mut conn, b"INFO\r\n");
        assert!(String::from_utf8_lossy(&out).contains("kind:queue"));
    }

    #[test]
    fn test_http_request() {
        let mut conn = services().accept();
        let (out, action) = run(&mut conn, b"GET /health HTTP/1.1\r\nHost: x\r\n\r\n");
        assert!(out.starts_with(b"HTTP/1.1 200 OK\r\n"));
        assert_eq!(action, Action::Close);
        assert_eq!(conn.kind(), ConnKind::Http);
    }

    #[test]
    fn test_http_request_in_pieces() {
        let mut conn = services().accept();
        assert_eq!(run(&mut conn, b"GET / HT"), (vec![], Action::None));
        assert_eq!(run(&mut conn, b"TP/1.1\r\n"), (vec![], Action::None));
        let (out, action) = run(&mut conn, b"\r\n");
        assert!(out.starts_with(b"HTTP/1.1 200 OK"));
        assert_eq!(action, Action::Close);
    }

    #[test]
    fn test_websocket_upgrade_detaches() {
        let recorder = Arc::new(Recorder::default());
        let mut conn = services().with_owner(recorder.clone()).accept();
        let request: &[u8] = b"GET /ws HTTP/1.1\r\nUpgrade: websocket\r\n\r\n";
        let (out, action) = run(&mut conn, request);
        assert!(out.is_empty());
        assert_eq!(action, Action::Detach);
        assert_eq!(conn.kind(), ConnKind::WebSocket);

        conn.detach().unwrap();
        conn.on_detach(stream());
        let adopted = recorder.adopted.lock().unwrap().clone();
        assert_eq!(adopted, vec![(ConnKind::WebSocket, Bytes::from_static(request))]);
    }

    #[test]
    fn test_inline_get_is_a_command() {
        let mut conn = services().accept();
        assert_eq!(run(&mut conn, b"GET missing\r\n").0, b"$-1\r\n".to_vec());
        assert_eq!(conn.kind(), ConnKind::Command);
    }

    #[test]
    fn test_worker_backend() {
        let worker = Worker::spawn(Arc::new(StoreExecutor::default())).unwrap();
        let services = Services::new(worker.backend());
        let mut a = services.accept();
        let mut b = services.accept();
        assert_eq!(settle(&mut a, b"SET shared 1\r\n").0, b"+OK\r\n".to_vec());
        assert_eq!(settle(&mut b, b"INCR shared\r\n").0, b":2\r\n".to_vec());
        drop(a);
        drop(b);
        worker.shutdown();
    }

    #[test]
    fn test_worker_replies_keep_pipeline_order() {
        let worker = Worker::spawn(Arc::new(SlowExecutor::default())).unwrap();
        let mut conn = Services::new(worker.backend()).accept();

        // SLOW还在执行，后面的本地回复和QUIT都要排在它后面
        let (out, action) = run(&mut conn, b"SLOW\r\nPING\r\nQUIT\r\n");
        assert!(out.is_empty());
        assert_eq!(action, Action::None);
        assert!(conn.has_pending());

        let (out, action) = settle(&mut conn, b"");
        assert_eq!(out, b"$4\r\nslow\r\n+PONG\r\n+OK\r\n".to_vec());
        assert_eq!(action, Action::Close);
        drop(conn);
        worker.shutdown();
    }

    #[tokio::test]
    async fn test_worker_reply_notifies_waker() {
        let worker = Worker::spawn(Arc::new(StoreExecutor::default())).unwrap();
        let mut conn = Services::new(worker.backend()).accept();
        let wake = conn.waker();

        let (out, _) = run(&mut conn, b"SET k v\r\nGET k\r\n");
        assert!(out.is_empty());
        let mut got = Vec::new();
        while got.len() < 12 {
            tokio::time::timeout(Duration::from_secs(5), wake.notified())
                .await
                .unwrap();
            got.extend_from_slice(&run(&mut conn, b"").0);
        }
        assert_eq!(got, b"+OK\r\n$1\r\nv\r\n".to_vec());
        assert!(!conn.has_pending());
        drop(conn);
        worker.shutdown();
    }

    #[tokio::test]
    async fn test_publish_notifies_subscriber_waker() {
        let services = services();
        let mut sub = services.accept();
        let mut publisher = services.accept();
        run(&mut sub, b"SUBSCRIBE t\r\n");

        run(&mut publisher, b"PUBLISH t m\r\n");
        tokio::time::timeout(Duration::from_secs(1), sub.waker().notified())
            .await
            .unwrap();
        assert_eq!(
            run(&mut sub, b"").0,
            b"*3\r\n$7\r\nmessage\r\n$1\r\nt\r\n$1\r\nm\r\n".to_vec()
        );
    }
}
