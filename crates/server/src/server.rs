//! Server state and the TCP accept loop

use crate::config::Config;
use crate::connection::Connection;
use crate::executor;
use crate::perflog::PerfLog;
use crate::slowlog::SlowLog;
use crate::stats::Stats;
use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use storage::Storage;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{error, info, warn};

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

pub struct Server {
    pub storage: Arc<Storage>,
    pub config: RwLock<Config>,
    pub stats: Stats,
    pub slowlog: SlowLog,
    pub perf_log: PerfLog,
    loading: AtomicBool,
    is_slave: AtomicBool,
    executing_commands: AtomicU64,
    monitor_txs: Mutex<Vec<UnboundedSender<Vec<u8>>>>,
    random_key_cursor: Mutex<Vec<u8>>,
}

impl Server {
    pub fn new(config: Config, storage: Arc<Storage>) -> Arc<Self> {
        let slowlog = SlowLog::new(config.slowlog_log_slower_than, config.slowlog_max_len);
        let perf_log = PerfLog::new(config.profiling.sample_record_max_len);
        Arc::new(Self {
            storage,
            config: RwLock::new(config),
            stats: Stats::new(),
            slowlog,
            perf_log,
            loading: AtomicBool::new(false),
            is_slave: AtomicBool::new(false),
            executing_commands: AtomicU64::new(0),
            monitor_txs: Mutex::new(Vec::new()),
            random_key_cursor: Mutex::new(Vec::new()),
        })
    }

    /// Accept loop; runs until the task is cancelled
    pub async fn serve(self: Arc<Self>) -> anyhow::Result<()> {
        let addr = {
            let config = self.config.read();
            format!("{}:{}", config.bind, config.port)
        };
        let listener = TcpListener::bind(&addr).await?;
        info!("[server] listening on {}", addr);

        let maintenance = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
            loop {
                ticker.tick().await;
                if let Err(e) = maintenance.storage.check_db_size_limit() {
                    warn!("[server] size limit check failed: {}", e);
                }
            }
        });

        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let srv = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(srv, stream, addr).await {
                            warn!("[server] connection {} closed with error: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("[server] failed to accept connection: {}", e);
                }
            }
        }
    }

    pub fn is_loading(&self) -> bool {
        self.loading.load(Ordering::Relaxed)
    }

    pub fn set_loading(&self, loading: bool) {
        self.loading.store(loading, Ordering::Relaxed);
    }

    pub fn is_slave(&self) -> bool {
        self.is_slave.load(Ordering::Relaxed)
    }

    pub fn set_slave(&self, slave: bool) {
        self.is_slave.store(slave, Ordering::Relaxed);
    }

    pub fn incr_executing_commands(&self) {
        self.executing_commands.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decr_executing_commands(&self) {
        self.executing_commands.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn executing_command_num(&self) -> u64 {
        self.executing_commands.load(Ordering::Relaxed)
    }

    /// Restore the latest backup; command traffic is gated on the loading
    /// flag for the duration
    pub fn restore_from_backup(&self) -> storage::Result<()> {
        self.set_loading(true);
        let result = self.storage.restore_from_backup();
        self.set_loading(false);
        result
    }

    pub fn register_monitor(&self) -> UnboundedReceiver<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.monitor_txs.lock().push(tx);
        rx
    }

    /// Send the raw tokens of an executed command to every monitor
    pub fn feed_monitor_conns(&self, conn: &Connection, tokens: &[Bytes]) {
        let mut txs = self.monitor_txs.lock();
        if txs.is_empty() {
            return;
        }
        let now = chrono::Utc::now();
        let mut line = format!(
            "+{}.{:06} [{}]",
            now.timestamp(),
            now.timestamp_subsec_micros(),
            conn.addr()
        );
        for token in tokens {
            line.push_str(&format!(" \"{}\"", String::from_utf8_lossy(token)));
        }
        line.push_str("\r\n");
        txs.retain(|tx| tx.send(line.clone().into_bytes()).is_ok());
    }

    pub fn slowlog_push_entry_if_needed(&self, args: &[Bytes], duration_us: u64) {
        self.slowlog.push_entry_if_needed(args, duration_us);
    }

    pub fn random_key_cursor(&self) -> Vec<u8> {
        self.random_key_cursor.lock().clone()
    }

    pub fn set_random_key_cursor(&self, cursor: Vec<u8>) {
        *self.random_key_cursor.lock() = cursor;
    }
}

async fn handle_connection(
    srv: Arc<Server>,
    stream: TcpStream,
    addr: SocketAddr,
) -> anyhow::Result<()> {
    let (mut reader, mut writer) = stream.into_split();
    let cluster_enabled = srv.storage.config().cluster_enabled;
    let mut request = resp::Request::new(cluster_enabled);
    let mut conn = Connection::new(addr.to_string());
    let mut buf = BytesMut::with_capacity(16 * 1024);

    loop {
        let n = reader.read_buf(&mut buf).await?;
        if n == 0 {
            break;
        }

        let tokenized = request.tokenize(&mut buf);
        srv.stats.incr_inbound_bytes(request.take_inbound_bytes());

        // commands completed before a protocol error still execute; the
        // error reply goes out last and the connection closes
        executor::execute_commands(&srv, &mut conn, request.take_commands());
        if let Err(e) = tokenized {
            warn!("[server] protocol error from {}: {}", addr, e);
            conn.reply(resp::error(&e.to_string()));
            conn.enable_close_after_reply();
        }

        let reply = conn.take_reply();
        if !reply.is_empty() {
            srv.stats.incr_outbound_bytes(reply.len() as u64);
            writer.write_all(&reply).await?;
        }
        if conn.is_close_after_reply() {
            break;
        }
        if let Some(mut monitor_rx) = conn.take_monitor() {
            while let Some(line) = monitor_rx.recv().await {
                writer.write_all(&line).await?;
            }
            break;
        }
    }
    Ok(())
}
