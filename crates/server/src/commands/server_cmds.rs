//! Connection and management commands

use super::{parse_int, Commander};
use crate::connection::Connection;
use crate::server::Server;
use bytes::Bytes;
use std::sync::Arc;
use storage::{Database, DEFAULT_NAMESPACE};
use tracing::warn;

#[derive(Default)]
pub struct CommandAuth {
    token: String,
}

impl Commander for CommandAuth {
    fn name(&self) -> &'static str {
        "auth"
    }

    fn arity(&self) -> i32 {
        2
    }

    fn parse(&mut self, args: &[Bytes]) -> Result<(), String> {
        self.token = String::from_utf8_lossy(&args[1]).into_owned();
        Ok(())
    }

    fn execute(&mut self, srv: &Arc<Server>, conn: &mut Connection) -> Result<Vec<u8>, String> {
        let config = srv.config.read();
        if let Some(namespace) = config.tokens.get(&self.token) {
            let namespace = namespace.clone();
            drop(config);
            conn.set_namespace(&namespace);
            conn.become_user();
            return Ok(resp::simple_string("OK"));
        }
        let requirepass = config.requirepass.clone();
        drop(config);

        if !requirepass.is_empty() && self.token != requirepass {
            return Ok(resp::error("ERR invalid password"));
        }
        conn.set_namespace(DEFAULT_NAMESPACE);
        conn.become_admin();
        if requirepass.is_empty() {
            Ok(resp::error("ERR Client sent AUTH, but no password is set"))
        } else {
            Ok(resp::simple_string("OK"))
        }
    }
}

#[derive(Default)]
pub struct CommandPing {
    message: Option<Bytes>,
}

impl Commander for CommandPing {
    fn name(&self) -> &'static str {
        "ping"
    }

    fn arity(&self) -> i32 {
        -1
    }

    fn parse(&mut self, args: &[Bytes]) -> Result<(), String> {
        match args.len() {
            1 => Ok(()),
            2 => {
                self.message = Some(args[1].clone());
                Ok(())
            }
            _ => Err("wrong number of arguments".to_string()),
        }
    }

    fn execute(&mut self, _srv: &Arc<Server>, _conn: &mut Connection) -> Result<Vec<u8>, String> {
        match &self.message {
            Some(message) => Ok(resp::bulk_string(message)),
            None => Ok(resp::simple_string("PONG")),
        }
    }
}

#[derive(Default)]
pub struct CommandEcho {
    message: Bytes,
}

impl Commander for CommandEcho {
    fn name(&self) -> &'static str {
        "echo"
    }

    fn arity(&self) -> i32 {
        2
    }

    fn parse(&mut self, args: &[Bytes]) -> Result<(), String> {
        self.message = args[1].clone();
        Ok(())
    }

    fn execute(&mut self, _srv: &Arc<Server>, _conn: &mut Connection) -> Result<Vec<u8>, String> {
        Ok(resp::bulk_string(&self.message))
    }
}

#[derive(Default)]
pub struct CommandMonitor;

impl Commander for CommandMonitor {
    fn name(&self) -> &'static str {
        "monitor"
    }

    fn arity(&self) -> i32 {
        1
    }

    fn execute(&mut self, srv: &Arc<Server>, conn: &mut Connection) -> Result<Vec<u8>, String> {
        conn.set_monitor(srv.register_monitor());
        Ok(resp::simple_string("OK"))
    }
}

/// NAMESPACE GET <ns>|* / SET <ns> <token> / ADD <ns> <token> / DEL <ns>
#[derive(Default)]
pub struct CommandNamespace {
    args: Vec<String>,
}

impl Commander for CommandNamespace {
    fn name(&self) -> &'static str {
        "namespace"
    }

    fn arity(&self) -> i32 {
        -3
    }

    fn parse(&mut self, args: &[Bytes]) -> Result<(), String> {
        self.args = args
            .iter()
            .map(|a| String::from_utf8_lossy(a).into_owned())
            .collect();
        Ok(())
    }

    fn execute(&mut self, srv: &Arc<Server>, conn: &mut Connection) -> Result<Vec<u8>, String> {
        if !conn.is_admin() {
            return Ok(resp::error(
                "ERR only administrator can use namespace command",
            ));
        }
        let subcommand = self.args[1].to_lowercase();
        match (subcommand.as_str(), self.args.len()) {
            ("get", 3) => {
                if self.args[2] == "*" {
                    let config = srv.config.read();
                    let mut pairs = Vec::new();
                    for (token, namespace) in &config.tokens {
                        pairs.push(namespace.clone());
                        pairs.push(token.clone());
                    }
                    Ok(resp::multi_bulk(pairs))
                } else {
                    match srv.config.read().token_of_namespace(&self.args[2]) {
                        Some(token) => Ok(resp::bulk_string(token.as_bytes())),
                        None => Ok(resp::null_bulk()),
                    }
                }
            }
            ("set", 4) => {
                let result = srv.config.write().set_namespace(&self.args[2], &self.args[3]);
                warn!(
                    "[server] updated namespace: {}, addr: {}, result: {:?}",
                    self.args[2],
                    conn.addr(),
                    result
                );
                match result {
                    Ok(()) => Ok(resp::simple_string("OK")),
                    Err(msg) => Ok(resp::error(&format!("ERR {}", msg))),
                }
            }
            ("add", 4) => {
                let result = srv.config.write().add_namespace(&self.args[2], &self.args[3]);
                warn!(
                    "[server] new namespace: {}, addr: {}, result: {:?}",
                    self.args[2],
                    conn.addr(),
                    result
                );
                match result {
                    Ok(()) => Ok(resp::simple_string("OK")),
                    Err(msg) => Ok(resp::error(&format!("ERR {}", msg))),
                }
            }
            ("del", 3) => {
                let result = srv.config.write().del_namespace(&self.args[2]);
                warn!(
                    "[server] deleted namespace: {}, addr: {}, result: {:?}",
                    self.args[2],
                    conn.addr(),
                    result
                );
                match result {
                    Ok(()) => Ok(resp::simple_string("OK")),
                    Err(msg) => Ok(resp::error(&format!("ERR {}", msg))),
                }
            }
            _ => Ok(resp::error(
                "ERR NAMESPACE subcommand must be one of GET, SET, DEL, ADD",
            )),
        }
    }
}

#[derive(Default)]
pub struct CommandDbSize;

impl Commander for CommandDbSize {
    fn name(&self) -> &'static str {
        "dbsize"
    }

    fn arity(&self) -> i32 {
        1
    }

    fn execute(&mut self, srv: &Arc<Server>, conn: &mut Connection) -> Result<Vec<u8>, String> {
        let db = Database::new(srv.storage.clone(), conn.namespace_or_default());
        let stats = db.get_key_num_stats(b"").map_err(|e| e.to_string())?;
        Ok(resp::integer(stats.n_key as i64))
    }
}

#[derive(Default)]
pub struct CommandCompact;

impl Commander for CommandCompact {
    fn name(&self) -> &'static str {
        "compact"
    }

    fn arity(&self) -> i32 {
        1
    }

    fn execute(&mut self, srv: &Arc<Server>, _conn: &mut Connection) -> Result<Vec<u8>, String> {
        srv.storage.compact(None, None).map_err(|e| e.to_string())?;
        Ok(resp::simple_string("OK"))
    }
}

#[derive(Default)]
pub struct CommandBgSave;

impl Commander for CommandBgSave {
    fn name(&self) -> &'static str {
        "bgsave"
    }

    fn arity(&self) -> i32 {
        1
    }

    fn execute(&mut self, srv: &Arc<Server>, _conn: &mut Connection) -> Result<Vec<u8>, String> {
        srv.storage.create_backup().map_err(|e| e.to_string())?;
        let config = srv.config.read();
        srv.storage
            .purge_old_backups(config.max_backup_to_keep, config.max_backup_keep_hours);
        Ok(resp::simple_string("OK"))
    }
}

/// SLOWLOG GET [n] / RESET / LEN
#[derive(Default)]
pub struct CommandSlowlog {
    subcommand: String,
    count: usize,
}

impl Commander for CommandSlowlog {
    fn name(&self) -> &'static str {
        "slowlog"
    }

    fn arity(&self) -> i32 {
        -2
    }

    fn parse(&mut self, args: &[Bytes]) -> Result<(), String> {
        self.subcommand = String::from_utf8_lossy(&args[1]).to_lowercase();
        self.count = 10;
        if args.len() > 2 {
            self.count = parse_int(&args[2])?.max(0) as usize;
        }
        Ok(())
    }

    fn execute(&mut self, srv: &Arc<Server>, _conn: &mut Connection) -> Result<Vec<u8>, String> {
        match self.subcommand.as_str() {
            "reset" => {
                srv.slowlog.reset();
                Ok(resp::simple_string("OK"))
            }
            "len" => Ok(resp::integer(srv.slowlog.len() as i64)),
            "get" => {
                let entries = srv.slowlog.latest(self.count);
                let mut out = resp::array_header(entries.len());
                for entry in entries {
                    out.extend_from_slice(&resp::array_header(4));
                    out.extend_from_slice(&resp::integer(entry.id as i64));
                    out.extend_from_slice(&resp::integer(entry.timestamp));
                    out.extend_from_slice(&resp::integer(entry.duration_us as i64));
                    out.extend_from_slice(&resp::multi_bulk(entry.args));
                }
                Ok(out)
            }
            _ => Ok(resp::error(
                "ERR Unknown SLOWLOG subcommand or wrong number of arguments",
            )),
        }
    }
}
