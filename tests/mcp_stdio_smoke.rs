use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::process::{Command, Stdio};

#[test]
fn mcp_stdio_smoke() {
    let bin = env!("CARGO_BIN_EXE_semantic-code-search");

    let workspace = tempfile::tempdir().expect("tempdir");
    std::fs::write(
        workspace.path().join("lib.rs"),
        "fn add(a: i32, b: i32) -> i32 {\n    let sum = a + b;\n    sum\n}\n",
    )
    .unwrap();

    let mut child = Command::new(bin)
        .arg("serve")
        .arg("--root")
        .arg(workspace.path())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn semantic-code-search serve");

    {
        let stdin = child.stdin.as_mut().expect("child stdin");

        // Keep each JSON-RPC message on one line (the server reads by lines()).
        writeln!(
            stdin,
            "{}",
            serde_json::json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": "initialize",
                "params": { "protocolVersion": "2024-11-05" }
            })
        )
        .unwrap();

        writeln!(
            stdin,
            "{}",
            serde_json::json!({
                "jsonrpc": "2.0",
                "id": 2,
                "method": "tools/list"
            })
        )
        .unwrap();

        writeln!(
            stdin,
            "{}",
            serde_json::json!({
                "jsonrpc": "2.0",
                "id": 3,
                "method": "tools/call",
                "params": {
                    "name": "semantic_search",
                    "arguments": { "query": "add two numbers", "limit": 5 }
                }
            })
        )
        .unwrap();
    }

    // Close stdin so the server loop can exit.
    drop(child.stdin.take());

    let stdout = child.stdout.take().expect("child stdout");
    let reader = BufReader::new(stdout);

    let mut replies_by_id: HashMap<i64, serde_json::Value> = HashMap::new();

    for line in reader.lines() {
        let line = line.expect("read stdout line");
        if line.trim().is_empty() {
            continue;
        }
        let v: serde_json::Value = serde_json::from_str(&line).expect("stdout is json");
        let id = v
            .get("id")
            .and_then(|x| x.as_i64())
            .expect("json-rpc response id");
        replies_by_id.insert(id, v);
        if replies_by_id.len() >= 3 {
            break;
        }
    }

    let status = child.wait().expect("wait child");
    assert!(status.success(), "serve process should exit cleanly");

    // initialize
    {
        let v = replies_by_id.get(&1).expect("initialize reply");
        assert_eq!(v.get("jsonrpc").and_then(|x| x.as_str()), Some("2.0"));
        let result = v.get("result").expect("initialize result");
        assert!(result.get("capabilities").is_some());
    }

    // tools/list
    {
        let v = replies_by_id.get(&2).expect("tools/list reply");
        let tools = v
            .get("result")
            .and_then(|r| r.get("tools"))
            .and_then(|t| t.as_array())
            .expect("tools array");
        let names: std::collections::HashSet<&str> = tools
            .iter()
            .filter_map(|t| t.get("name").and_then(|n| n.as_str()))
            .collect();
        assert!(names.contains("semantic_search"), "missing tool: semantic_search");
    }

    // tools/call — the embedder may be unreachable in this environment (no
    // network access to fetch model weights), so we only assert a well-formed
    // JSON-RPC envelope comes back, not that the search itself succeeded.
    {
        let v = replies_by_id.get(&3).expect("tools/call reply");
        assert_eq!(v.get("jsonrpc").and_then(|x| x.as_str()), Some("2.0"));
        assert!(
            v.get("result").is_some() || v.get("error").is_some(),
            "tools/call should return either a result or an error"
        );
        if let Some(error) = v.get("error") {
            assert!(error.get("code").and_then(|c| c.as_i64()).is_some());
            assert!(error.get("data").and_then(|d| d.get("kind")).is_some());
        }
    }
}
