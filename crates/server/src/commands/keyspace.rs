//! Generic key commands built on the database facade

use super::{parse_int, Commander};
use crate::connection::Connection;
use crate::server::Server;
use bytes::Bytes;
use std::sync::Arc;
use storage::metadata::now_secs;
use storage::{Database, Error};

fn database(srv: &Arc<Server>, conn: &Connection) -> Database {
    Database::new(srv.storage.clone(), conn.namespace_or_default())
}

/// Strip the pattern down to a literal prefix; only prefix matches are
/// supported
fn prefix_of_pattern(pattern: &str) -> Result<Vec<u8>, String> {
    if pattern == "*" {
        return Ok(Vec::new());
    }
    match pattern.strip_suffix('*') {
        Some(prefix) if !prefix.contains('*') => Ok(prefix.as_bytes().to_vec()),
        _ => Err("only keys prefix match was supported".to_string()),
    }
}

#[derive(Default)]
pub struct CommandDel {
    keys: Vec<Bytes>,
}

impl Commander for CommandDel {
    fn name(&self) -> &'static str {
        "del"
    }

    fn arity(&self) -> i32 {
        -2
    }

    fn is_write(&self) -> bool {
        true
    }

    fn parse(&mut self, args: &[Bytes]) -> Result<(), String> {
        self.keys = args[1..].to_vec();
        Ok(())
    }

    fn execute(&mut self, srv: &Arc<Server>, conn: &mut Connection) -> Result<Vec<u8>, String> {
        let db = database(srv, conn);
        let mut deleted = 0;
        for key in &self.keys {
            match db.del(key) {
                Ok(()) => deleted += 1,
                Err(Error::NotFound) => {}
                Err(e) => return Err(e.to_string()),
            }
        }
        Ok(resp::integer(deleted))
    }
}

#[derive(Default)]
pub struct CommandExists {
    keys: Vec<Bytes>,
}

impl Commander for CommandExists {
    fn name(&self) -> &'static str {
        "exists"
    }

    fn arity(&self) -> i32 {
        -2
    }

    fn parse(&mut self, args: &[Bytes]) -> Result<(), String> {
        self.keys = args[1..].to_vec();
        Ok(())
    }

    fn execute(&mut self, srv: &Arc<Server>, conn: &mut Connection) -> Result<Vec<u8>, String> {
        let db = database(srv, conn);
        let keys: Vec<&[u8]> = self.keys.iter().map(|k| k.as_ref()).collect();
        let count = db.exists(&keys).map_err(|e| e.to_string())?;
        Ok(resp::integer(count as i64))
    }
}

#[derive(Default)]
pub struct CommandTtl {
    key: Bytes,
}

impl Commander for CommandTtl {
    fn name(&self) -> &'static str {
        "ttl"
    }

    fn arity(&self) -> i32 {
        2
    }

    fn parse(&mut self, args: &[Bytes]) -> Result<(), String> {
        self.key = args[1].clone();
        Ok(())
    }

    fn execute(&mut self, srv: &Arc<Server>, conn: &mut Connection) -> Result<Vec<u8>, String> {
        let ttl = database(srv, conn)
            .ttl(&self.key)
            .map_err(|e| e.to_string())?;
        Ok(resp::integer(ttl))
    }
}

#[derive(Default)]
pub struct CommandExpire {
    key: Bytes,
    seconds: i64,
}

impl Commander for CommandExpire {
    fn name(&self) -> &'static str {
        "expire"
    }

    fn arity(&self) -> i32 {
        3
    }

    fn is_write(&self) -> bool {
        true
    }

    fn parse(&mut self, args: &[Bytes]) -> Result<(), String> {
        self.key = args[1].clone();
        self.seconds = parse_int(&args[2])?;
        Ok(())
    }

    fn execute(&mut self, srv: &Arc<Server>, conn: &mut Connection) -> Result<Vec<u8>, String> {
        let db = database(srv, conn);
        // a non-positive timeout deletes the key, like Redis
        let result = if self.seconds <= 0 {
            db.del(&self.key)
        } else {
            let seconds = u32::try_from(self.seconds).unwrap_or(u32::MAX);
            db.expire(&self.key, now_secs().saturating_add(seconds))
        };
        match result {
            Ok(()) => Ok(resp::integer(1)),
            Err(Error::NotFound) => Ok(resp::integer(0)),
            Err(e) => Err(e.to_string()),
        }
    }
}

#[derive(Default)]
pub struct CommandType {
    key: Bytes,
}

impl Commander for CommandType {
    fn name(&self) -> &'static str {
        "type"
    }

    fn arity(&self) -> i32 {
        2
    }

    fn parse(&mut self, args: &[Bytes]) -> Result<(), String> {
        self.key = args[1].clone();
        Ok(())
    }

    fn execute(&mut self, srv: &Arc<Server>, conn: &mut Connection) -> Result<Vec<u8>, String> {
        let redis_type = database(srv, conn)
            .type_of(&self.key)
            .map_err(|e| e.to_string())?;
        Ok(resp::simple_string(redis_type.name()))
    }
}

#[derive(Default)]
pub struct CommandKeys {
    prefix: Vec<u8>,
}

impl Commander for CommandKeys {
    fn name(&self) -> &'static str {
        "keys"
    }

    fn arity(&self) -> i32 {
        2
    }

    fn parse(&mut self, args: &[Bytes]) -> Result<(), String> {
        self.prefix = prefix_of_pattern(&String::from_utf8_lossy(&args[1]))?;
        Ok(())
    }

    fn execute(&mut self, srv: &Arc<Server>, conn: &mut Connection) -> Result<Vec<u8>, String> {
        let keys = database(srv, conn)
            .keys(&self.prefix)
            .map_err(|e| e.to_string())?;
        Ok(resp::multi_bulk(keys))
    }
}

/// SCAN cursor [MATCH pattern] [COUNT count]
#[derive(Default)]
pub struct CommandScan {
    cursor: Vec<u8>,
    prefix: Vec<u8>,
    count: u64,
}

impl Commander for CommandScan {
    fn name(&self) -> &'static str {
        "scan"
    }

    fn arity(&self) -> i32 {
        -2
    }

    fn parse(&mut self, args: &[Bytes]) -> Result<(), String> {
        self.cursor = if args[1].as_ref() == b"0" {
            Vec::new()
        } else {
            args[1].to_vec()
        };
        self.count = 20;
        let mut i = 2;
        while i < args.len() {
            let option = String::from_utf8_lossy(&args[i]).to_lowercase();
            match option.as_str() {
                "match" if i + 1 < args.len() => {
                    self.prefix = prefix_of_pattern(&String::from_utf8_lossy(&args[i + 1]))?;
                    i += 2;
                }
                "count" if i + 1 < args.len() => {
                    let count = parse_int(&args[i + 1])?;
                    if count <= 0 {
                        return Err("syntax error".to_string());
                    }
                    self.count = count as u64;
                    i += 2;
                }
                _ => return Err("syntax error".to_string()),
            }
        }
        Ok(())
    }

    fn execute(&mut self, srv: &Arc<Server>, conn: &mut Connection) -> Result<Vec<u8>, String> {
        let keys = database(srv, conn)
            .scan(&self.cursor, self.count, &self.prefix)
            .map_err(|e| e.to_string())?;
        let next_cursor: &[u8] = match keys.last() {
            Some(last) if keys.len() as u64 >= self.count => last,
            _ => b"0",
        };
        let mut out = resp::array_header(2);
        out.extend_from_slice(&resp::bulk_string(next_cursor));
        out.extend_from_slice(&resp::multi_bulk(keys.iter()));
        Ok(out)
    }
}

#[derive(Default)]
pub struct CommandRandomKey;

impl Commander for CommandRandomKey {
    fn name(&self) -> &'static str {
        "randomkey"
    }

    fn arity(&self) -> i32 {
        1
    }

    fn execute(&mut self, srv: &Arc<Server>, conn: &mut Connection) -> Result<Vec<u8>, String> {
        let cursor = srv.random_key_cursor();
        let key = database(srv, conn)
            .random_key(&cursor)
            .map_err(|e| e.to_string())?;
        match key {
            Some(key) => {
                srv.set_random_key_cursor(key.clone());
                Ok(resp::bulk_string(&key))
            }
            None => {
                srv.set_random_key_cursor(Vec::new());
                Ok(resp::null_bulk())
            }
        }
    }
}

#[derive(Default)]
pub struct CommandDump {
    key: Bytes,
}

impl Commander for CommandDump {
    fn name(&self) -> &'static str {
        "dump"
    }

    fn arity(&self) -> i32 {
        2
    }

    fn parse(&mut self, args: &[Bytes]) -> Result<(), String> {
        self.key = args[1].clone();
        Ok(())
    }

    fn execute(&mut self, srv: &Arc<Server>, conn: &mut Connection) -> Result<Vec<u8>, String> {
        let infos = database(srv, conn)
            .dump(&self.key)
            .map_err(|e| e.to_string())?;
        Ok(resp::multi_bulk(infos))
    }
}

#[derive(Default)]
pub struct CommandFlushDb;

impl Commander for CommandFlushDb {
    fn name(&self) -> &'static str {
        "flushdb"
    }

    fn arity(&self) -> i32 {
        1
    }

    fn is_write(&self) -> bool {
        true
    }

    fn execute(&mut self, srv: &Arc<Server>, conn: &mut Connection) -> Result<Vec<u8>, String> {
        database(srv, conn).flush_db().map_err(|e| e.to_string())?;
        Ok(resp::simple_string("OK"))
    }
}

#[derive(Default)]
pub struct CommandFlushAll;

impl Commander for CommandFlushAll {
    fn name(&self) -> &'static str {
        "flushall"
    }

    fn arity(&self) -> i32 {
        1
    }

    fn is_write(&self) -> bool {
        true
    }

    fn execute(&mut self, srv: &Arc<Server>, conn: &mut Connection) -> Result<Vec<u8>, String> {
        database(srv, conn).flush_all().map_err(|e| e.to_string())?;
        Ok(resp::simple_string("OK"))
    }
}
