//! Command registry
//!
//! Each command is a small object produced by a factory in the table:
//! declared name and arity, a parse step over the raw tokens, and an
//! execute step against the server. Lookup is case-insensitive.

mod bitmap_cmds;
mod keyspace;
mod server_cmds;
mod string_cmds;

use crate::connection::Connection;
use crate::server::Server;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

pub trait Commander: Send {
    fn name(&self) -> &'static str;

    /// Positive arity means exact token count, negative means a minimum
    fn arity(&self) -> i32;

    fn is_write(&self) -> bool {
        false
    }

    fn parse(&mut self, _args: &[Bytes]) -> Result<(), String> {
        Ok(())
    }

    /// Returns the encoded reply; an empty reply writes nothing
    fn execute(&mut self, srv: &Arc<Server>, conn: &mut Connection) -> Result<Vec<u8>, String>;
}

pub type CommandFactory = fn() -> Box<dyn Commander>;

static COMMAND_TABLE: OnceLock<HashMap<&'static str, CommandFactory>> = OnceLock::new();

fn command_table() -> &'static HashMap<&'static str, CommandFactory> {
    COMMAND_TABLE.get_or_init(|| {
        let mut table: HashMap<&'static str, CommandFactory> = HashMap::new();
        // connection and management commands
        table.insert("auth", || Box::<server_cmds::CommandAuth>::default());
        table.insert("ping", || Box::<server_cmds::CommandPing>::default());
        table.insert("echo", || Box::<server_cmds::CommandEcho>::default());
        table.insert("monitor", || Box::<server_cmds::CommandMonitor>::default());
        table.insert("namespace", || {
            Box::<server_cmds::CommandNamespace>::default()
        });
        table.insert("dbsize", || Box::<server_cmds::CommandDbSize>::default());
        table.insert("compact", || Box::<server_cmds::CommandCompact>::default());
        table.insert("bgsave", || Box::<server_cmds::CommandBgSave>::default());
        table.insert("slowlog", || Box::<server_cmds::CommandSlowlog>::default());
        // generic key commands
        table.insert("del", || Box::<keyspace::CommandDel>::default());
        table.insert("exists", || Box::<keyspace::CommandExists>::default());
        table.insert("ttl", || Box::<keyspace::CommandTtl>::default());
        table.insert("expire", || Box::<keyspace::CommandExpire>::default());
        table.insert("type", || Box::<keyspace::CommandType>::default());
        table.insert("keys", || Box::<keyspace::CommandKeys>::default());
        table.insert("scan", || Box::<keyspace::CommandScan>::default());
        table.insert("randomkey", || Box::<keyspace::CommandRandomKey>::default());
        table.insert("dump", || Box::<keyspace::CommandDump>::default());
        table.insert("flushdb", || Box::<keyspace::CommandFlushDb>::default());
        table.insert("flushall", || Box::<keyspace::CommandFlushAll>::default());
        // string commands
        table.insert("get", || Box::<string_cmds::CommandGet>::default());
        table.insert("set", || Box::<string_cmds::CommandSet>::default());
        // bitmap commands
        table.insert("getbit", || Box::<bitmap_cmds::CommandGetBit>::default());
        table.insert("setbit", || Box::<bitmap_cmds::CommandSetBit>::default());
        table.insert("bitcount", || Box::<bitmap_cmds::CommandBitCount>::default());
        table.insert("bitpos", || Box::<bitmap_cmds::CommandBitPos>::default());
        table
    })
}

/// Resolve a command name (any case) to a fresh command object
pub fn lookup_command(cmd_name: &str) -> Option<Box<dyn Commander>> {
    command_table()
        .get(cmd_name.to_lowercase().as_str())
        .map(|factory| factory())
}

pub fn command_list() -> Vec<&'static str> {
    let mut names: Vec<_> = command_table().keys().copied().collect();
    names.sort_unstable();
    names
}

pub(crate) fn parse_int(arg: &Bytes) -> Result<i64, String> {
    std::str::from_utf8(arg)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| "value is not an integer or out of range".to_string())
}

pub(crate) fn parse_bit_offset(arg: &Bytes) -> Result<u32, String> {
    std::str::from_utf8(arg)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| "bit offset is not an integer or out of range".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_is_case_insensitive() {
        assert!(lookup_command("PING").is_some());
        assert!(lookup_command("ping").is_some());
        assert!(lookup_command("SetBit").is_some());
        assert!(lookup_command("nosuch").is_none());
    }

    #[test]
    fn test_command_list_contains_core_commands() {
        let list = command_list();
        for name in ["auth", "get", "setbit", "flushall", "scan"] {
            assert!(list.contains(&name), "missing {}", name);
        }
    }

    #[test]
    fn test_parse_int() {
        assert_eq!(parse_int(&Bytes::from("-3")), Ok(-3));
        assert!(parse_int(&Bytes::from("abc")).is_err());
        assert!(parse_bit_offset(&Bytes::from("-1")).is_err());
        assert_eq!(parse_bit_offset(&Bytes::from("7")), Ok(7));
    }
}
