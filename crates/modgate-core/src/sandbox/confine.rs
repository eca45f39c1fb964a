//! Namespace and filesystem confinement for the sandbox child.
//!
//! The parent prepares a jail directory and a [`MountPlan`]; the child
//! unshares mount and network namespaces (through a user namespace when it
//! lacks privilege), binds the candidate directory and the interpreter's
//! runtime read-only into the jail, and pivots into it. Everything the child
//! touches is allocated in the parent so the pre-exec path only issues
//! syscalls.

use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// What to do when the kernel refuses namespaces or mounts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationMode {
    /// Refuse to run the candidate unconfined.
    #[default]
    Required,
    /// Run anyway and report what was achieved in the result.
    BestEffort,
}

/// Confinement actually in force for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Isolation {
    pub network_isolated: bool,
    pub filesystem_confined: bool,
}

impl Isolation {
    pub const FULL: Isolation = Isolation {
        network_isolated: true,
        filesystem_confined: true,
    };

    /// True when the run was confined enough to trust its result.
    pub fn satisfies(&self, allow_network: bool) -> bool {
        self.filesystem_confined && (allow_network || self.network_isolated)
    }

    pub(crate) fn to_byte(self) -> u8 {
        u8::from(self.network_isolated) | (u8::from(self.filesystem_confined) << 1)
    }

    pub(crate) fn from_byte(byte: u8) -> Self {
        Self {
            network_isolated: byte & 1 != 0,
            filesystem_confined: byte & 2 != 0,
        }
    }
}

/// Host paths an interpreter commonly needs, bound read-only when present.
pub fn default_runtime_paths() -> Vec<PathBuf> {
    ["/usr", "/bin", "/lib", "/lib64", "/nix"]
        .iter()
        .map(PathBuf::from)
        .collect()
}

/// Working directory of the candidate inside the jail.
pub const JAIL_WORKDIR: &str = "/work";
const DEVICES: &[&str] = &["null", "zero", "urandom"];

#[derive(Debug)]
struct Bind {
    source: CString,
    target: CString,
    remount_flags: libc::c_ulong,
    /// Failure to bind is tolerated.
    optional: bool,
}

/// Mount steps executed by the child, all strings pre-built.
#[derive(Debug)]
pub(crate) struct MountPlan {
    root: CString,
    root_remount_flags: libc::c_ulong,
    binds: Vec<Bind>,
    slash: CString,
    dot: CString,
    workdir: CString,
}

/// A prepared jail directory; removed on drop.
#[derive(Debug)]
pub(crate) struct Jail {
    _dir: tempfile::TempDir,
    plan: Arc<MountPlan>,
}

impl Jail {
    /// Lay out the jail for `candidate_dir` and `interpreter` (an absolute,
    /// canonical path).
    pub(crate) fn prepare(
        candidate_dir: &Path,
        runtime_paths: &[PathBuf],
        interpreter: &Path,
    ) -> io::Result<Self> {
        let dir = tempfile::Builder::new().prefix("modgate-jail-").tempdir()?;
        let root = dir.path().to_path_buf();
        let mut binds = Vec::new();

        let work = root.join(JAIL_WORKDIR.trim_start_matches('/'));
        std::fs::create_dir(&work)?;
        binds.push(Bind::new(candidate_dir, &work, remount_flags(source_flags(candidate_dir)?), false)?);

        let mut covered = Vec::new();
        for host in runtime_paths {
            let Ok(meta) = std::fs::symlink_metadata(host) else {
                continue;
            };
            let inside = jail_path(&root, host);
            if let Some(parent) = inside.parent() {
                std::fs::create_dir_all(parent)?;
            }
            if meta.file_type().is_symlink() {
                // Merged-usr layouts: `/bin -> usr/bin` resolves inside the jail.
                std::os::unix::fs::symlink(std::fs::read_link(host)?, &inside)?;
            } else if meta.is_dir() {
                std::fs::create_dir_all(&inside)?;
                binds.push(Bind::new(host, &inside, remount_flags(source_flags(host)?), false)?);
                covered.push(std::fs::canonicalize(host)?);
            }
        }

        if !covered.iter().any(|c| interpreter.starts_with(c)) {
            let prefix = interpreter_prefix(interpreter);
            let inside = jail_path(&root, &prefix);
            std::fs::create_dir_all(&inside)?;
            binds.push(Bind::new(&prefix, &inside, remount_flags(source_flags(&prefix)?), false)?);
        }

        let dev = root.join("dev");
        std::fs::create_dir(&dev)?;
        for name in DEVICES {
            let host = Path::new("/dev").join(name);
            if !host.exists() {
                continue;
            }
            let inside = dev.join(name);
            std::fs::File::create(&inside)?;
            let locked = source_flags(&host)?;
            let flags = (remount_flags(locked) & !libc::MS_NODEV) | (locked & libc::MS_NODEV);
            binds.push(Bind::new(&host, &inside, flags, true)?);
        }

        let plan = MountPlan {
            root: cstring(&root)?,
            root_remount_flags: remount_flags(source_flags(&root)?),
            binds,
            slash: cstring(Path::new("/"))?,
            dot: cstring(Path::new("."))?,
            workdir: cstring(Path::new(JAIL_WORKDIR))?,
        };
        Ok(Self {
            _dir: dir,
            plan: Arc::new(plan),
        })
    }

    pub(crate) fn plan(&self) -> Arc<MountPlan> {
        Arc::clone(&self.plan)
    }
}

impl Bind {
    fn new(source: &Path, target: &Path, remount_flags: libc::c_ulong, optional: bool) -> io::Result<Self> {
        Ok(Self {
            source: cstring(source)?,
            target: cstring(target)?,
            remount_flags,
            optional,
        })
    }
}

impl MountPlan {
    /// Runs in the forked child after the mount namespace was unshared.
    pub(crate) fn enter(&self) -> io::Result<()> {
        mount(None, &self.slash, libc::MS_REC | libc::MS_PRIVATE)?;
        mount(Some(&self.root), &self.root, libc::MS_BIND)?;
        for bind in &self.binds {
            let bound = mount(Some(&bind.source), &bind.target, libc::MS_BIND | libc::MS_REC)
                .and_then(|_| mount(None, &bind.target, bind.remount_flags));
            if let Err(e) = bound {
                if !bind.optional {
                    return Err(e);
                }
            }
        }
        mount(None, &self.root, self.root_remount_flags)?;

        // SAFETY: chdir/chroot/syscall/umount2 read NUL-terminated strings
        // owned by `self`.
        unsafe {
            check(libc::chdir(self.root.as_ptr()))?;
            let pivoted =
                libc::syscall(libc::SYS_pivot_root, self.dot.as_ptr(), self.dot.as_ptr()) == 0;
            if pivoted {
                // The old root is stacked on the new one; detach it.
                check(libc::umount2(self.dot.as_ptr(), libc::MNT_DETACH))?;
            } else {
                check(libc::chroot(self.dot.as_ptr()))?;
            }
            check(libc::chdir(self.workdir.as_ptr()))?;
        }
        Ok(())
    }
}

/// Identity maps written after unsharing a user namespace.
#[derive(Debug)]
pub(crate) struct IdMaps {
    setgroups_path: CString,
    uid_map_path: CString,
    gid_map_path: CString,
    uid_map: Vec<u8>,
    gid_map: Vec<u8>,
}

impl IdMaps {
    /// Map root in the new namespace to the calling user.
    pub(crate) fn for_current_user() -> io::Result<Self> {
        // SAFETY: getuid/getgid cannot fail.
        let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
        Ok(Self {
            setgroups_path: cstring(Path::new("/proc/self/setgroups"))?,
            uid_map_path: cstring(Path::new("/proc/self/uid_map"))?,
            gid_map_path: cstring(Path::new("/proc/self/gid_map"))?,
            uid_map: format!("0 {uid} 1").into_bytes(),
            gid_map: format!("0 {gid} 1").into_bytes(),
        })
    }

    fn write(&self) -> io::Result<()> {
        write_file(&self.setgroups_path, b"deny")?;
        write_file(&self.uid_map_path, &self.uid_map)?;
        write_file(&self.gid_map_path, &self.gid_map)
    }
}

/// Unshare the namespaces confinement needs, falling back to a new user
/// namespace when the caller lacks `CAP_SYS_ADMIN`.
pub(crate) fn unshare_namespaces(mount: bool, network: bool, id_maps: &IdMaps) -> io::Result<()> {
    let mut flags = 0;
    if mount {
        flags |= libc::CLONE_NEWNS;
    }
    if network {
        flags |= libc::CLONE_NEWNET;
    }
    if flags == 0 {
        return Ok(());
    }
    // SAFETY: unshare affects only the calling (child) process.
    unsafe {
        if libc::unshare(flags) == 0 {
            return Ok(());
        }
        check(libc::unshare(flags | libc::CLONE_NEWUSER))?;
    }
    id_maps.write()
}

fn write_file(path: &CString, contents: &[u8]) -> io::Result<()> {
    // SAFETY: open/write/close on a path and buffer owned by the caller.
    unsafe {
        let fd = libc::open(path.as_ptr(), libc::O_WRONLY | libc::O_CLOEXEC);
        check(fd)?;
        let written = libc::write(fd, contents.as_ptr().cast(), contents.len());
        libc::close(fd);
        if written < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn mount(source: Option<&CString>, target: &std::ffi::CStr, flags: libc::c_ulong) -> io::Result<()> {
    let source = source.map_or(std::ptr::null(), |s| s.as_ptr());
    // SAFETY: every pointer is NUL-terminated or null, as mount(2) allows.
    check(unsafe { libc::mount(source, target.as_ptr(), std::ptr::null(), flags, std::ptr::null()) })
}

fn check(rc: libc::c_int) -> io::Result<()> {
    if rc >= 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Read-only remount flags for a bind of a source mounted with `locked`.
fn remount_flags(locked: libc::c_ulong) -> libc::c_ulong {
    libc::MS_REMOUNT | libc::MS_BIND | libc::MS_RDONLY | libc::MS_NOSUID | libc::MS_NODEV | locked
}

/// Mount flags of the filesystem holding `path`. A remount inside a user
/// namespace must keep them.
fn source_flags(path: &Path) -> io::Result<libc::c_ulong> {
    let c_path = cstring(path)?;
    // SAFETY: statvfs fills a zeroed struct for a NUL-terminated path.
    let vfs = unsafe {
        let mut vfs: libc::statvfs = std::mem::zeroed();
        check(libc::statvfs(c_path.as_ptr(), &mut vfs))?;
        vfs
    };
    let pairs = [
        (libc::ST_RDONLY, libc::MS_RDONLY),
        (libc::ST_NOSUID, libc::MS_NOSUID),
        (libc::ST_NODEV, libc::MS_NODEV),
        (libc::ST_NOEXEC, libc::MS_NOEXEC),
        (libc::ST_NOATIME, libc::MS_NOATIME),
        (libc::ST_NODIRATIME, libc::MS_NODIRATIME),
        (libc::ST_RELATIME, libc::MS_RELATIME),
    ];
    let flags = pairs
        .iter()
        .filter(|(st, _)| vfs.f_flag & *st != 0)
        .fold(0, |acc, (_, ms)| acc | ms);
    if flags & (libc::MS_NOATIME | libc::MS_RELATIME) == 0 {
        return Ok(flags | libc::MS_STRICTATIME);
    }
    Ok(flags)
}

fn jail_path(root: &Path, host: &Path) -> PathBuf {
    root.join(host.strip_prefix("/").unwrap_or(host))
}

/// `/opt/py/bin/python3` -> `/opt/py`.
fn interpreter_prefix(interpreter: &Path) -> PathBuf {
    let dir = interpreter.parent().unwrap_or(Path::new("/"));
    match dir.parent() {
        Some(prefix) if dir.ends_with("bin") && prefix != Path::new("/") => prefix.to_path_buf(),
        _ => dir.to_path_buf(),
    }
}

fn cstring(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, format!("{} contains NUL", path.display())))
}
