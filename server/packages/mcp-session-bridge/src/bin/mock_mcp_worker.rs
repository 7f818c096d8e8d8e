//! Line-delimited JSON-RPC worker used by the integration tests.
//!
//! Methods:
//! - `initialize`: capabilities without a `protocolVersion`
//! - `tools/list`: an empty tool list
//! - `tools/call` with `params.name == "hang"`: never answers
//! - `mock/slow`: answers after `params.delay_ms`
//! - `mock/split`: writes its response in two separately flushed chunks
//! - `mock/exit`: exits with code 3 without answering
//! - `mock/notify`: emits `mock/event` first, then answers
//! - `mock/garbage`: emits a non-JSON line first, then answers
//! - `mock/env`: reports `MCP_TOOL_TIMEOUT`
//! - anything else with an id: echoes method and params

use std::io::{self, BufRead, Write};
use std::thread;
use std::time::Duration;

use serde_json::{json, Value};

fn main() -> io::Result<()> {
    let stdin = io::stdin();
    let mut stdout = io::stdout().lock();

    for line in stdin.lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let message: Value = match serde_json::from_str(&line) {
            Ok(message) => message,
            Err(err) => {
                eprintln!("mock-mcp-worker: bad input: {err}");
                continue;
            }
        };
        let method = message
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let Some(id) = message.get("id").cloned() else {
            eprintln!("mock-mcp-worker: notification {method}");
            continue;
        };
        let params = message.get("params").cloned().unwrap_or(Value::Null);

        let result = match method.as_str() {
            "initialize" => json!({
                "capabilities": {"tools": {"listChanged": true}},
                "serverInfo": {"name": "mock-mcp-worker", "version": "0.0.0"}
            }),
            "tools/list" => json!({"tools": []}),
            "tools/call" if params["name"] == "hang" => continue,
            "mock/slow" => {
                let delay = params["delay_ms"].as_u64().unwrap_or(100);
                thread::sleep(Duration::from_millis(delay));
                json!({"slept_ms": delay})
            }
            "mock/split" => {
                let response = json!({"jsonrpc": "2.0", "id": id, "result": {"split": true}});
                let encoded = format!("{response}\n");
                let (head, tail) = encoded.split_at(encoded.len() / 2);
                stdout.write_all(head.as_bytes())?;
                stdout.flush()?;
                thread::sleep(Duration::from_millis(50));
                stdout.write_all(tail.as_bytes())?;
                stdout.flush()?;
                continue;
            }
            "mock/exit" => std::process::exit(3),
            "mock/notify" => {
                write_line(
                    &mut stdout,
                    &json!({"jsonrpc": "2.0", "method": "mock/event", "params": params}),
                )?;
                json!({"notified": true})
            }
            "mock/garbage" => {
                writeln!(stdout, "this is not json")?;
                stdout.flush()?;
                json!({"after_garbage": true})
            }
            "mock/env" => json!({
                "MCP_TOOL_TIMEOUT": std::env::var("MCP_TOOL_TIMEOUT").ok(),
                "MCP_TIMEOUT": std::env::var("MCP_TIMEOUT").ok(),
            }),
            _ => json!({"echoed": {"method": method, "params": params}}),
        };

        write_line(&mut stdout, &json!({"jsonrpc": "2.0", "id": id, "result": result}))?;
    }
    Ok(())
}

fn write_line(out: &mut impl Write, message: &Value) -> io::Result<()> {
    writeln!(out, "{message}")?;
    out.flush()
}
