//! The command table (spec component C / section 6).
//!
//! Grounded on `redis/cmd.rs`'s `CMD_TABLE: Lazy<HashMap<...>>` shape, but
//! trimmed to the two built-ins the spec actually wants: `test` (an inert
//! status reply, useful for exercising the whole pipeline end to end) and
//! `command` (introspection over the table itself). No data-type commands
//! live here — the command table is scoped to what the dispatcher needs to
//! prove the I/O core works, not a key-value store.

use std::collections::HashMap;

use once_cell::sync::Lazy;

use crate::client::Client;
use crate::reply;

/// Positive arity is an exact argument count (including the command name
/// itself); negative is a minimum, Redis-style (`-1` means "at least 1").
pub struct Command {
    pub name: &'static str,
    pub arity: i32,
    pub handler: fn(&mut Client, &[Vec<u8>]),
}

pub static COMMAND_TABLE: Lazy<HashMap<&'static str, Command>> = Lazy::new(|| {
    let mut table = HashMap::new();
    for cmd in [
        Command { name: "test", arity: 1, handler: cmd_test },
        Command { name: "command", arity: -1, handler: cmd_command },
    ] {
        table.insert(cmd.name, cmd);
    }
    table
});

pub fn lookup_command(name: &str) -> Option<&'static Command> {
    COMMAND_TABLE.get(name.to_ascii_lowercase().as_str())
}

/// Checks the parsed argument count against a command's arity, per the
/// positive-exact/negative-minimum convention above.
pub fn arity_ok(cmd: &Command, argc: usize) -> bool {
    if cmd.arity >= 0 {
        argc as i32 == cmd.arity
    } else {
        argc as i32 >= -cmd.arity
    }
}

/// Argument echo in the unknown-command error is capped at this many bytes
/// total (spec section 4.I); the command name itself is never truncated.
const ERROR_ARG_ECHO_LIMIT: usize = 128;

/// Builds the "unknown command" error text. Grounded on `processCommand`'s
/// `unknown command \`%s\`, with args beginning with: %s.` in
/// `original_source/src/server.c`: the command name (`argv[0]`) is quoted
/// whole, and the *arguments* (`argv[1..]`), not the command name, are
/// backtick-wrapped and echoed up to a combined 128-byte budget.
pub fn unknown_command_message(argv: &[Vec<u8>]) -> String {
    let name = String::from_utf8_lossy(&argv[0]);
    let mut args = String::new();
    for arg in argv.iter().skip(1) {
        if args.len() >= ERROR_ARG_ECHO_LIMIT {
            break;
        }
        let budget = ERROR_ARG_ECHO_LIMIT - args.len();
        let text = String::from_utf8_lossy(arg);
        let truncated: String = text.chars().take(budget).collect();
        args.push('`');
        args.push_str(&truncated);
        args.push_str("`, ");
    }
    format!("unknown command `{name}`, with args beginning with: {args}")
}

fn cmd_test(client: &mut Client, _argv: &[Vec<u8>]) {
    reply::add_reply_status(client, "OK");
}

fn cmd_command(client: &mut Client, argv: &[Vec<u8>]) {
    if argv.len() == 1 {
        let names: Vec<&str> = COMMAND_TABLE.keys().copied().collect();
        reply::add_reply_array_of_bulk_strings(client, &names);
        return;
    }
    if argv.len() == 2 && argv[1].eq_ignore_ascii_case(b"count") {
        reply::add_reply_integer(client, COMMAND_TABLE.len() as i64);
        return;
    }
    reply::add_reply_error(client, "unknown COMMAND subcommand");
}
