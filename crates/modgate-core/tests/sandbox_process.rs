//! Process sandbox against a real interpreter. Skipped when `python3` is absent.
//!
//! These runs use best-effort isolation so they also work on hosts without
//! namespaces; confinement assertions only apply when the result reports it.

use std::path::Path;
use std::process::Command;
use std::time::{Duration, Instant};

use modgate_core::sandbox::{SandboxError, SandboxErrorKind};
use modgate_core::{
    ExecutionState, IsolationMode, ProcessSandbox, ProcessSandboxConfig, ResourceLimits,
    SandboxInvocation, SandboxRunner,
};
use serde_json::json;

fn python_available() -> bool {
    Command::new("python3")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn sandbox() -> ProcessSandbox {
    ProcessSandbox::new(ProcessSandboxConfig {
        use_cgroups: false,
        isolation: IsolationMode::BestEffort,
        ..ProcessSandboxConfig::default()
    })
}

fn write(dir: &Path, name: &str, source: &str) {
    std::fs::write(dir.join(name), source).unwrap();
}

#[tokio::test]
async fn execute_returns_the_structured_result() {
    if !python_available() {
        eprintln!("python3 not installed; skipping");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "m.py",
        "def execute(payload):\n    print('noise before the record')\n    return {'seen': payload.get('n', 0) * 2}\n",
    );
    let inv = SandboxInvocation::new(dir.path(), "m.py", "execute").with_payload(json!({"n": 21}));
    let result = sandbox().run(inv).await.unwrap();

    assert!(result.ok, "{}", result.summary());
    assert_eq!(result.state, ExecutionState::Completed);
    assert_eq!(result.result, Some(json!({"seen": 42})));
    assert_eq!(result.exit_code, Some(0));
    assert!(result.stdout.contains("noise before the record"));
}

#[tokio::test]
async fn zero_argument_entry_points_are_supported() {
    if !python_available() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "m.py", "def execute():\n    return 'no args'\n");
    let result = sandbox()
        .run(SandboxInvocation::new(dir.path(), "m.py", "execute"))
        .await
        .unwrap();
    assert!(result.ok);
    assert_eq!(result.result, Some(json!("no args")));
}

#[tokio::test]
async fn exceptions_are_runtime_errors() {
    if !python_available() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "m.py", "def execute(payload):\n    return 1 / 0\n");
    let result = sandbox()
        .run(SandboxInvocation::new(dir.path(), "m.py", "execute"))
        .await
        .unwrap();

    assert!(!result.ok);
    assert_eq!(result.state, ExecutionState::Completed);
    assert_eq!(result.error, Some(SandboxErrorKind::RuntimeError));
    assert!(result.message.as_deref().unwrap().contains("ZeroDivisionError"));
    assert!(result.stderr.contains("Traceback"));
}

#[tokio::test]
async fn missing_entry_point_fails_validation() {
    if !python_available() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "m.py", "def init():\n    return None\n");
    let result = sandbox()
        .run(SandboxInvocation::new(dir.path(), "m.py", "execute"))
        .await
        .unwrap();
    assert!(!result.ok);
    assert_eq!(result.error, Some(SandboxErrorKind::ValidationFailed));
}

#[tokio::test]
async fn runaway_loop_is_killed_at_the_timeout() {
    if !python_available() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "m.py",
        "import time\n\ndef execute(payload):\n    while True:\n        time.sleep(0.05)\n",
    );
    let inv = SandboxInvocation::new(dir.path(), "m.py", "execute")
        .with_timeout(Duration::from_millis(700));
    let started = Instant::now();
    let result = sandbox().run(inv).await.unwrap();

    assert!(!result.ok);
    assert_eq!(result.state, ExecutionState::TimedOut);
    assert_eq!(result.error, Some(SandboxErrorKind::Timeout));
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn memory_hog_hits_the_limit() {
    if !python_available() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "m.py",
        "def execute(payload):\n    block = bytearray(2 * 1024 * 1024 * 1024)\n    return len(block)\n",
    );
    let limits = ResourceLimits {
        memory_mb: 256,
        ..ResourceLimits::default()
    };
    let inv = SandboxInvocation::new(dir.path(), "m.py", "execute").with_limits(limits);
    let result = sandbox().run(inv).await.unwrap();

    assert!(!result.ok);
    assert_eq!(result.state, ExecutionState::LimitExceeded);
    assert_eq!(result.error, Some(SandboxErrorKind::ResourceLimit));
}

#[tokio::test]
async fn output_is_capped() {
    if !python_available() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "m.py",
        "def execute(payload):\n    print('x' * 200000)\n    return 'done'\n",
    );
    let limits = ResourceLimits {
        max_output_bytes: 4096,
        ..ResourceLimits::default()
    };
    let inv = SandboxInvocation::new(dir.path(), "m.py", "execute").with_limits(limits);
    let result = sandbox().run(inv).await.unwrap();
    assert!(result.output_truncated);
    assert!(result.stdout.len() <= 4096);
}

#[tokio::test]
async fn environment_is_scrubbed() {
    if !python_available() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "m.py",
        "import os\n\ndef execute(payload):\n    return sorted(os.environ.keys())\n",
    );
    let result = sandbox()
        .run(SandboxInvocation::new(dir.path(), "m.py", "execute"))
        .await
        .unwrap();
    assert!(result.ok, "{}", result.summary());
    let keys = result.result.unwrap();
    let keys: Vec<&str> = keys
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|k| k.as_str())
        .collect();
    assert!(keys.contains(&"PATH"));
    assert!(!keys.iter().any(|k| k.starts_with("CARGO")));
}

#[tokio::test]
async fn loopback_connections_are_refused_without_network() {
    if !python_available() {
        return;
    }
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.set_nonblocking(true).unwrap();
    let port = listener.local_addr().unwrap().port();

    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "m.py",
        &format!(
            "import socket\n\ndef execute(payload):\n    try:\n        socket.create_connection(('127.0.0.1', {port}), timeout=2).close()\n        return 'connected'\n    except OSError as e:\n        return type(e).__name__\n"
        ),
    );
    let result = sandbox()
        .run(SandboxInvocation::new(dir.path(), "m.py", "execute"))
        .await
        .unwrap();
    assert!(result.ok, "{}", result.summary());

    if result.isolation.network_isolated {
        assert_ne!(result.result, Some(json!("connected")));
        match listener.accept() {
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            other => panic!("expected no pending connection, got {:?}", other),
        }
    } else {
        eprintln!("network namespaces unavailable; only the run itself was checked");
    }
}

#[tokio::test]
async fn writes_outside_the_candidate_never_land() {
    if !python_available() {
        return;
    }
    let outside = tempfile::tempdir().unwrap();
    let target = outside.path().join("escape.txt");
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "m.py",
        &format!(
            "from pathlib import Path\n\ndef execute(payload):\n    try:\n        Path({target:?}).write_text('escaped')\n        return 'written'\n    except OSError as e:\n        return type(e).__name__\n",
            target = target.display().to_string()
        ),
    );
    let result = sandbox()
        .run(SandboxInvocation::new(dir.path(), "m.py", "execute"))
        .await
        .unwrap();
    assert!(result.ok, "{}", result.summary());

    if result.isolation.filesystem_confined {
        assert!(!target.exists(), "candidate wrote {}", target.display());
        assert_ne!(result.result, Some(json!("written")));
    }
}

#[tokio::test]
async fn confined_candidates_cannot_rewrite_themselves() {
    if !python_available() {
        return;
    }
    let source = "from pathlib import Path\n\ndef execute(payload):\n    me = Path(__file__)\n    try:\n        me.chmod(0o644)\n        me.write_text('import subprocess\\n')\n        return 'rewritten'\n    except OSError as e:\n        return type(e).__name__\n";
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "m.py", source);
    let result = sandbox()
        .run(SandboxInvocation::new(dir.path(), "m.py", "execute"))
        .await
        .unwrap();
    assert!(result.ok, "{}", result.summary());

    if result.isolation.filesystem_confined {
        assert_ne!(result.result, Some(json!("rewritten")));
        assert_eq!(std::fs::read_to_string(dir.path().join("m.py")).unwrap(), source);
    }
}

#[tokio::test]
async fn required_isolation_never_runs_unconfined() {
    if !python_available() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "m.py", "def execute(payload):\n    return 1\n");
    let required = ProcessSandbox::new(ProcessSandboxConfig {
        use_cgroups: false,
        ..ProcessSandboxConfig::default()
    });
    match required.run(SandboxInvocation::new(dir.path(), "m.py", "execute")).await {
        Ok(result) => {
            assert!(result.ok, "{}", result.summary());
            assert!(result.isolation.satisfies(false), "{:?}", result.isolation);
        }
        Err(SandboxError::CrashedOnLaunch { reason }) => {
            assert!(reason.contains("isolation") || reason.contains("jail"), "{reason}");
        }
        other => panic!("expected a confined run or a launch failure, got {:?}", other),
    }
}
