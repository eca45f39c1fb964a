//! Harness script run by the interpreter inside the sandbox.
//!
//! The harness is passed with `-c`, so nothing is written next to the
//! candidate. It loads the entry file by path, reads the JSON payload from
//! stdin, calls the entry point and prints exactly one structured record as
//! the last line of stdout.

use serde::Deserialize;

pub const HARNESS_SCRIPT: &str = r#"import importlib.util
import inspect
import json
import os
import sys
import traceback


def emit(record):
    sys.stdout.write("\n" + json.dumps(record, default=repr) + "\n")
    sys.stdout.flush()


def fail(kind, message, code):
    emit({"ok": False, "error": message, "kind": kind})
    return code


def main():
    entry_file, entry_point = sys.argv[1], sys.argv[2]
    try:
        raw = sys.stdin.read()
        payload = json.loads(raw) if raw.strip() else {}
    except ValueError as exc:
        return fail("validation_failed", "invalid payload: %s" % exc, 2)

    sys.path.insert(0, os.path.dirname(os.path.abspath(entry_file)))
    try:
        spec = importlib.util.spec_from_file_location("candidate", entry_file)
        if spec is None or spec.loader is None:
            return fail("validation_failed", "cannot load %s" % entry_file, 2)
        module = importlib.util.module_from_spec(spec)
        spec.loader.exec_module(module)
    except MemoryError:
        return fail("resource_limit", "MemoryError while importing candidate", 1)
    except BaseException as exc:
        traceback.print_exc()
        return fail("runtime_error", "import failed: %s: %s" % (type(exc).__name__, exc), 1)

    func = getattr(module, entry_point, None)
    if not callable(func):
        return fail("validation_failed", "entry point %s is not defined" % entry_point, 2)

    try:
        try:
            takes_args = len(inspect.signature(func).parameters) > 0
        except (TypeError, ValueError):
            takes_args = True
        result = func(payload) if takes_args else func()
    except MemoryError:
        return fail("resource_limit", "MemoryError", 1)
    except BaseException as exc:
        traceback.print_exc()
        return fail("runtime_error", "%s: %s" % (type(exc).__name__, exc), 1)

    emit({"ok": True, "result": result})
    return 0


if __name__ == "__main__":
    sys.exit(main())
"#;

/// The structured `{ok, result | error, kind}` record.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HarnessRecord {
    pub ok: bool,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,
}

impl HarnessRecord {
    /// Parse the last non-empty line of `stdout`, if it is a record.
    pub fn parse_last_line(stdout: &str) -> Option<Self> {
        let line = stdout.lines().rev().find(|l| !l.trim().is_empty())?;
        serde_json::from_str(line.trim()).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_last_line_only() {
        let out = "{\"ok\": false}\nprogress...\n{\"ok\": true, \"result\": [1, 2]}\n\n";
        let rec = HarnessRecord::parse_last_line(out).unwrap();
        assert!(rec.ok);
        assert_eq!(rec.result, Some(serde_json::json!([1, 2])));
    }

    #[test]
    fn non_record_last_line_is_none() {
        assert!(HarnessRecord::parse_last_line("{\"ok\": true}\ndone").is_none());
        assert!(HarnessRecord::parse_last_line("").is_none());
        assert!(HarnessRecord::parse_last_line("[1, 2]").is_none());
    }

    #[test]
    fn script_emits_every_failure_kind() {
        for kind in ["validation_failed", "resource_limit", "runtime_error"] {
            assert!(HARNESS_SCRIPT.contains(kind));
        }
    }
}
