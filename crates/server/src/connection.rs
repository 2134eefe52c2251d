//! Per-connection state
//!
//! The executor reads the connection's namespace and flags and appends
//! replies to its buffer; the connection task flushes the buffer to the
//! socket after each batch of commands.

use tokio::sync::mpsc::UnboundedReceiver;

pub struct Connection {
    addr: String,
    namespace: Option<String>,
    is_admin: bool,
    close_after_reply: bool,
    last_cmd: String,
    reply_buf: Vec<u8>,
    monitor_rx: Option<UnboundedReceiver<Vec<u8>>>,
}

impl Connection {
    pub fn new(addr: String) -> Self {
        Self {
            addr,
            namespace: None,
            is_admin: false,
            close_after_reply: false,
            last_cmd: String::new(),
            reply_buf: Vec::new(),
            monitor_rx: None,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn reply(&mut self, bytes: Vec<u8>) {
        self.reply_buf.extend_from_slice(&bytes);
    }

    pub fn take_reply(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.reply_buf)
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn namespace_or_default(&self) -> &str {
        self.namespace.as_deref().unwrap_or(storage::DEFAULT_NAMESPACE)
    }

    pub fn set_namespace(&mut self, namespace: &str) {
        self.namespace = Some(namespace.to_string());
    }

    pub fn become_admin(&mut self) {
        self.is_admin = true;
    }

    pub fn become_user(&mut self) {
        self.is_admin = false;
    }

    pub fn is_admin(&self) -> bool {
        self.is_admin
    }

    pub fn enable_close_after_reply(&mut self) {
        self.close_after_reply = true;
    }

    pub fn is_close_after_reply(&self) -> bool {
        self.close_after_reply
    }

    pub fn set_last_cmd(&mut self, cmd_name: &str) {
        self.last_cmd = cmd_name.to_string();
    }

    pub fn last_cmd(&self) -> &str {
        &self.last_cmd
    }

    pub fn set_monitor(&mut self, rx: UnboundedReceiver<Vec<u8>>) {
        self.monitor_rx = Some(rx);
    }

    pub fn take_monitor(&mut self) -> Option<UnboundedReceiver<Vec<u8>>> {
        self.monitor_rx.take()
    }
}
