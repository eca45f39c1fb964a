//! Directory-level inspection of candidates.

use std::fs;

use modgate_core::{InspectError, Inspector, IssueCategory};

#[test]
fn entry_points_may_span_files() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("a_init.py"), "def init(config=None):\n    return {}\n").unwrap();
    fs::write(
        dir.path().join("b_execute.py"),
        "def execute(payload=None):\n    return payload\n",
    )
    .unwrap();
    fs::create_dir_all(dir.path().join("pkg")).unwrap();
    fs::write(dir.path().join("pkg/c.py"), "def cleanup():\n    pass\n").unwrap();
    fs::write(dir.path().join("notes.md"), "import subprocess").unwrap();

    let report = Inspector::default().inspect(dir.path()).unwrap();
    assert!(report.ok, "{:?}", report.issues);
    assert_eq!(report.files, vec!["a_init.py", "b_execute.py", "pkg/c.py"]);
    assert_eq!(report.entry_file(), Some("b_execute.py"));
    assert_eq!(report.entry_points["cleanup"], "pkg/c.py");
}

#[test]
fn issue_in_any_file_fails_the_candidate() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        dir.path().join("main.py"),
        "def init():\n    pass\n\ndef execute(p):\n    return p\n\ndef cleanup():\n    pass\n",
    )
    .unwrap();
    fs::write(
        dir.path().join("helper.py"),
        "import socket\n\ndef dial(host):\n    return socket.create_connection((host, 80))\n",
    )
    .unwrap();

    let report = Inspector::default().inspect(dir.path()).unwrap();
    assert!(!report.ok);
    let socket = report
        .issues
        .iter()
        .find(|i| i.category == IssueCategory::RawSocket)
        .unwrap();
    assert_eq!(socket.file, "helper.py");
    assert_eq!(socket.line, 1);
}

#[test]
fn single_file_can_be_inspected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("solo.py");
    fs::write(&path, "def init():\n    pass\n\ndef execute(p):\n    return eval(p)\n\ndef cleanup():\n    pass\n").unwrap();
    let report = Inspector::default().inspect(&path).unwrap();
    assert!(!report.ok);
    assert!(report
        .issues
        .iter()
        .any(|i| i.category == IssueCategory::DynamicEval));
}

#[test]
fn directory_without_python_is_no_sources() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("README"), "hello").unwrap();
    match Inspector::default().inspect(dir.path()) {
        Err(InspectError::NoSources(p)) => assert_eq!(p, dir.path()),
        other => panic!("expected NoSources, got {:?}", other),
    }
}

#[test]
fn missing_path_is_an_io_error() {
    let dir = tempfile::tempdir().unwrap();
    assert!(matches!(
        Inspector::default().inspect(&dir.path().join("absent")),
        Err(InspectError::Io { .. })
    ));
}

#[test]
fn inspecting_twice_gives_the_same_report() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        dir.path().join("m.py"),
        "import os\n\ndef init(config=None):\n    return {}\n\ndef execute(payload):\n    # TODO tidy\n    return open('out.txt', 'w')\n",
    )
    .unwrap();
    fs::write(dir.path().join("helpers.py"), "def cleanup():\n    pass\n").unwrap();

    let inspector = Inspector::default();
    let first = inspector.inspect(dir.path()).unwrap();
    let second = inspector.inspect(dir.path()).unwrap();
    assert!(!first.ok);
    assert_eq!(first.ok, second.ok);
    assert_eq!(first.issues, second.issues);
    assert_eq!(first.metrics, second.metrics);
    assert_eq!(first, second);
}
