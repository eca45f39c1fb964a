//! Denylist of capability-escalating constructs and their fixed severities.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueCategory {
    ProcessSpawn,
    RawSocket,
    DynamicEval,
    Filesystem,
    Deserialization,
    NativeCode,
    Introspection,
    Network,
    Secret,
    Quality,
    Syntax,
    Structure,
}

impl IssueCategory {
    pub fn label(&self) -> &'static str {
        match self {
            IssueCategory::ProcessSpawn => "process spawning",
            IssueCategory::RawSocket => "raw socket access",
            IssueCategory::DynamicEval => "dynamic code evaluation",
            IssueCategory::Filesystem => "filesystem access",
            IssueCategory::Deserialization => "untrusted deserialization",
            IssueCategory::NativeCode => "native code loading",
            IssueCategory::Introspection => "interpreter introspection",
            IssueCategory::Network => "network access",
            IssueCategory::Secret => "hardcoded secret",
            IssueCategory::Quality => "code quality",
            IssueCategory::Syntax => "syntax",
            IssueCategory::Structure => "structure",
        }
    }
}

/// What a rule compares against.
#[derive(Debug, Clone, Copy)]
pub enum Matcher {
    /// Imported module names; `os` also matches `os.path`.
    Import(&'static [&'static str]),
    /// Any reference to a resolved dotted name, called or not.
    Reference(&'static [&'static str]),
    /// Only call sites.
    Call(&'static [&'static str]),
}

#[derive(Debug, Clone, Copy)]
pub struct Rule {
    pub id: &'static str,
    pub matcher: Matcher,
    pub severity: u8,
    pub category: IssueCategory,
}

/// Rules in priority order; a reference reports only its first match.
pub const RULES: &[Rule] = &[
    // imports
    Rule {
        id: "subprocess_import",
        matcher: Matcher::Import(&["subprocess"]),
        severity: 10,
        category: IssueCategory::ProcessSpawn,
    },
    Rule {
        id: "pty_import",
        matcher: Matcher::Import(&["pty"]),
        severity: 9,
        category: IssueCategory::ProcessSpawn,
    },
    Rule {
        id: "ctypes_import",
        matcher: Matcher::Import(&["ctypes", "cffi"]),
        severity: 9,
        category: IssueCategory::NativeCode,
    },
    Rule {
        id: "os_import",
        matcher: Matcher::Import(&["os", "posix", "nt"]),
        severity: 8,
        category: IssueCategory::ProcessSpawn,
    },
    Rule {
        id: "multiprocessing_import",
        matcher: Matcher::Import(&["multiprocessing"]),
        severity: 8,
        category: IssueCategory::ProcessSpawn,
    },
    Rule {
        id: "importlib_import",
        matcher: Matcher::Import(&["importlib", "imp"]),
        severity: 8,
        category: IssueCategory::DynamicEval,
    },
    Rule {
        id: "builtins_import",
        matcher: Matcher::Import(&["builtins", "__builtin__"]),
        severity: 8,
        category: IssueCategory::Introspection,
    },
    Rule {
        id: "socket_import",
        matcher: Matcher::Import(&["socket", "ssl"]),
        severity: 7,
        category: IssueCategory::RawSocket,
    },
    Rule {
        id: "shutil_import",
        matcher: Matcher::Import(&["shutil"]),
        severity: 7,
        category: IssueCategory::Filesystem,
    },
    Rule {
        id: "sys_import",
        matcher: Matcher::Import(&["sys"]),
        severity: 6,
        category: IssueCategory::Introspection,
    },
    Rule {
        id: "network_import",
        matcher: Matcher::Import(&[
            "urllib", "http", "requests", "httpx", "ftplib", "smtplib", "telnetlib",
        ]),
        severity: 7,
        category: IssueCategory::Network,
    },
    // references
    Rule {
        id: "os_process",
        matcher: Matcher::Reference(&[
            "os.system",
            "os.popen",
            "os.exec*",
            "os.spawn*",
            "os.fork",
            "os.forkpty",
            "os.posix_spawn*",
            "os.kill",
        ]),
        severity: 10,
        category: IssueCategory::ProcessSpawn,
    },
    Rule {
        id: "subprocess_use",
        matcher: Matcher::Reference(&["subprocess.*"]),
        severity: 9,
        category: IssueCategory::ProcessSpawn,
    },
    Rule {
        id: "eval_exec",
        matcher: Matcher::Reference(&["eval", "exec"]),
        severity: 9,
        category: IssueCategory::DynamicEval,
    },
    Rule {
        id: "dynamic_import",
        matcher: Matcher::Reference(&["__import__", "importlib.*"]),
        severity: 8,
        category: IssueCategory::DynamicEval,
    },
    Rule {
        id: "compile_call",
        matcher: Matcher::Reference(&["compile"]),
        severity: 8,
        category: IssueCategory::DynamicEval,
    },
    Rule {
        id: "unsafe_deserialization",
        matcher: Matcher::Reference(&[
            "pickle.load*",
            "pickle.Unpickler",
            "marshal.load*",
            "shelve.open",
            "dill.load*",
            "yaml.load",
            "yaml.unsafe_load",
        ]),
        severity: 8,
        category: IssueCategory::Deserialization,
    },
    Rule {
        id: "file_delete",
        matcher: Matcher::Reference(&[
            "os.remove",
            "os.unlink",
            "os.rmdir",
            "os.removedirs",
            "shutil.rmtree",
            "shutil.move",
            "*.unlink",
            "*.rmtree",
            "*.rm",
        ]),
        severity: 8,
        category: IssueCategory::Filesystem,
    },
    Rule {
        id: "file_mutation",
        matcher: Matcher::Reference(&[
            "os.chmod",
            "os.lchmod",
            "os.chown",
            "os.rename",
            "os.renames",
            "os.replace",
            "os.link",
            "os.symlink",
            "os.truncate",
            "os.open",
            "shutil.copy*",
            "*.write_text",
            "*.write_bytes",
            "*.chmod",
            "*.lchmod",
            "*.chown",
            "*.rename",
            "*.touch",
            "*.symlink_to",
            "*.hardlink_to",
        ]),
        severity: 7,
        category: IssueCategory::Filesystem,
    },
    Rule {
        id: "builtins_access",
        matcher: Matcher::Reference(&["__builtins__", "builtins.*"]),
        severity: 8,
        category: IssueCategory::Introspection,
    },
    Rule {
        id: "sandbox_escape",
        matcher: Matcher::Reference(&[
            "*.__subclasses__",
            "*.__globals__",
            "*.__code__",
            "*.__bases__",
            "*.__mro__",
        ]),
        severity: 8,
        category: IssueCategory::Introspection,
    },
    Rule {
        id: "socket_use",
        matcher: Matcher::Reference(&["socket.*", "ssl.*"]),
        severity: 7,
        category: IssueCategory::RawSocket,
    },
    Rule {
        id: "globals_access",
        matcher: Matcher::Reference(&["globals", "vars"]),
        severity: 7,
        category: IssueCategory::Introspection,
    },
    Rule {
        id: "attribute_manipulation",
        matcher: Matcher::Call(&["setattr", "delattr", "getattr"]),
        severity: 5,
        category: IssueCategory::Introspection,
    },
    Rule {
        id: "locals_access",
        matcher: Matcher::Call(&["locals"]),
        severity: 5,
        category: IssueCategory::Introspection,
    },
    Rule {
        id: "environment_access",
        matcher: Matcher::Reference(&["os.environ", "os.getenv", "os.putenv"]),
        severity: 4,
        category: IssueCategory::Introspection,
    },
    Rule {
        id: "print_call",
        matcher: Matcher::Call(&["print"]),
        severity: 1,
        category: IssueCategory::Quality,
    },
];

/// Severity of `open(...)` in a writing mode.
pub const OPEN_WRITE_SEVERITY: u8 = 7;
/// Severity of any other `open(...)`.
pub const OPEN_READ_SEVERITY: u8 = 3;
pub const OPEN_TARGETS: &[&str] = &["open", "io.open", "builtins.open", "codecs.open"];

/// Position of the mode argument for calls that open files, if `target` is one.
/// `Path(...).open(mode)` takes the mode first.
pub fn open_mode_position(target: &str) -> Option<usize> {
    if OPEN_TARGETS.contains(&target) {
        Some(1)
    } else if target == "<expr>.open" {
        Some(0)
    } else {
        None
    }
}

pub const SYNTAX_ERROR_SEVERITY: u8 = 10;
pub const MISSING_ENTRY_POINT_SEVERITY: u8 = 7;
pub const HARDCODED_SECRET_SEVERITY: u8 = 8;
pub const BARE_EXCEPT_SEVERITY: u8 = 3;
pub const HIGH_COMPLEXITY_SEVERITY: u8 = 4;

/// Match a dotted target against a pattern with at most one leading or
/// trailing `*`.
pub fn pattern_matches(pattern: &str, target: &str) -> bool {
    if let Some(prefix) = pattern.strip_suffix('*') {
        target.starts_with(prefix) && target.len() > prefix.len()
    } else if let Some(suffix) = pattern.strip_prefix('*') {
        target.ends_with(suffix)
    } else {
        pattern == target
    }
}

/// `os` matches `os` and `os.path`, never `osmosis`.
pub fn module_matches(pattern: &str, module: &str) -> bool {
    module == pattern
        || module
            .strip_prefix(pattern)
            .is_some_and(|rest| rest.starts_with('.'))
}

/// True when an `open` mode string can create or modify files.
pub fn is_write_mode(mode: &str) -> bool {
    mode.chars().any(|c| matches!(c, 'w' | 'a' | 'x' | '+'))
}

/// First import rule matching `module`.
pub fn match_import(module: &str) -> Option<&'static Rule> {
    RULES.iter().find(|rule| match rule.matcher {
        Matcher::Import(patterns) => patterns.iter().any(|p| module_matches(p, module)),
        _ => false,
    })
}

/// First reference or call rule matching `target`.
pub fn match_reference(target: &str, is_call: bool) -> Option<&'static Rule> {
    RULES.iter().find(|rule| match rule.matcher {
        Matcher::Reference(patterns) => patterns.iter().any(|p| pattern_matches(p, target)),
        Matcher::Call(patterns) => is_call && patterns.iter().any(|p| pattern_matches(p, target)),
        Matcher::Import(_) => false,
    })
}
