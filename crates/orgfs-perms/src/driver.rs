//! Narrow filesystem driver.
//!
//! Everything the reconciler and verifier do to the filesystem goes through
//! these functions: plain syscalls via `std::fs`, and synchronous
//! `getent`/`getfacl`/`setfacl`/`find`/`xargs`/`chgrp`/`chmod` children for
//! the batch operations.  Batches write NUL-separated paths to the child's
//! stdin; stdin is closed before waiting so pipelines drain.

use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::{Child, Command, Stdio};

use orgfs_core::acl::FileAcl;
use orgfs_core::groups::{self, Group};
use tracing::debug;

use crate::error::{FsError, FsResult};

/// Reads the system group table via `getent group`.
pub fn read_group_table() -> FsResult<Vec<Group>> {
    let out = run_output(Command::new("getent").arg("group"), "getent group")?;
    let text = String::from_utf8_lossy(&out);
    Ok(groups::parse_group_table(&text)?)
}

/// Creates the directory if it is missing.  Returns whether it was created.
/// Only a single level is created, so a config pointing at a missing root
/// fails instead of silently materializing it.
pub fn ensure_dir(path: &Path) -> FsResult<bool> {
    match fs::symlink_metadata(path) {
        Ok(_) => Ok(false),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            fs::create_dir(path).map_err(|e| FsError::io("mkdir", path, e))?;
            Ok(true)
        }
        Err(e) => Err(FsError::io("stat", path, e)),
    }
}

/// `chown root:<gid>`.
pub fn chown_root_group(path: &Path, gid: u32) -> FsResult<()> {
    std::os::unix::fs::chown(path, Some(0), Some(gid))
        .map_err(|e| FsError::io("chown", path, e))
}

/// Adds the setgid bit when it is missing.  Skipping the chmod on
/// unchanged dirs avoids needless ctime updates.
pub fn ensure_setgid(path: &Path) -> FsResult<()> {
    let meta = fs::metadata(path).map_err(|e| FsError::io("stat", path, e))?;
    let mode = meta.permissions().mode() & 0o7777;
    if mode & 0o2000 == 0 {
        fs::set_permissions(path, fs::Permissions::from_mode(mode | 0o2000))
            .map_err(|e| FsError::io("chmod g+s", path, e))?;
    }
    Ok(())
}

/// Whether `path` is a symlink whose target equals `target`.  Errors read
/// as `false`.
pub fn is_symlink_to(path: &Path, target: &Path) -> bool {
    fs::read_link(path).map(|t| t == target).unwrap_or(false)
}

/// Creates a symlink.  `symlink(2)` is atomic; an existing path of any
/// kind makes this fail instead of being replaced.
pub fn symlink(target: &Path, path: &Path) -> FsResult<()> {
    std::os::unix::fs::symlink(target, path).map_err(|e| FsError::io("symlink", path, e))
}

/// Removes a file, symlink, or empty directory.
pub fn remove(path: &Path) -> FsResult<()> {
    let meta = fs::symlink_metadata(path).map_err(|e| FsError::io("lstat", path, e))?;
    if meta.is_dir() {
        fs::remove_dir(path).map_err(|e| FsError::io("rmdir", path, e))
    } else {
        fs::remove_file(path).map_err(|e| FsError::io("unlink", path, e))
    }
}

/// Whether an I/O error is `ENOTEMPTY`, i.e. a directory that still has
/// children.
pub fn is_not_empty(err: &std::io::Error) -> bool {
    err.raw_os_error() == Some(libc::ENOTEMPTY)
}

/// Lists directory children with their file types (not following
/// symlinks).
pub fn list_dir(path: &Path) -> FsResult<Vec<(String, fs::FileType)>> {
    let mut children = Vec::new();
    let entries = fs::read_dir(path).map_err(|e| FsError::io("read dir", path, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| FsError::io("read dir", path, e))?;
        let ft = entry
            .file_type()
            .map_err(|e| FsError::io("read dir", path, e))?;
        children.push((entry.file_name().to_string_lossy().into_owned(), ft));
    }
    Ok(children)
}

/// `setfacl -M -` with one ACL entry per stdin line.  Modifying keeps
/// named entries owned by other components, notably sharing traversal
/// `--x` entries.
pub fn setfacl_modify(path: &Path, entries: &[String]) -> FsResult<()> {
    let mut input = entries.join("\n");
    input.push('\n');
    run_with_stdin(
        Command::new("setfacl").arg("-M").arg("-").arg(path),
        input.as_bytes(),
        "setfacl -M",
    )?;
    Ok(())
}

/// `setfacl -X -` with one ACL entry per stdin line.
pub fn setfacl_remove(path: &Path, entries: &[String]) -> FsResult<()> {
    let mut input = entries.join("\n");
    input.push('\n');
    run_with_stdin(
        Command::new("setfacl").arg("-X").arg("-").arg(path),
        input.as_bytes(),
        "setfacl -X",
    )?;
    Ok(())
}

/// `chgrp` on descendants whose owning group differs.  The `-not -gid`
/// predicate avoids ctime changes on files that already match.
pub fn chgrp_descendants(path: &Path, gid: u32) -> FsResult<()> {
    let gid = gid.to_string();
    find_xargs(
        None,
        path,
        &["-mindepth", "1", "-not", "-gid", &gid, "-print0"],
        &["chgrp", "--no-dereference", &gid, "--"],
    )
}

/// `chmod g+s` on descendant directories that are missing the bit.
pub fn setgid_descendant_dirs(path: &Path) -> FsResult<()> {
    find_xargs(
        None,
        path,
        &[
            "-mindepth", "1", "-type", "d", "-not", "-perm", "-g+s", "-print0",
        ],
        &["chmod", "g+s", "--"],
    )
}

/// Modifies descendant directory and file ACLs below `path` (the toplevel
/// itself is left alone).
pub fn setfacl_descendants(
    path: &Path,
    dir_entries: &[String],
    file_entries: &[String],
) -> FsResult<()> {
    find_xargs(
        None,
        path,
        &["-mindepth", "1", "-type", "d", "-print0"],
        &["setfacl", "-m", &dir_entries.join(","), "--"],
    )?;
    find_xargs(
        None,
        path,
        &["-mindepth", "1", "-type", "f", "-print0"],
        &["setfacl", "-m", &file_entries.join(","), "--"],
    )
}

/// Modifies directory and file ACL entries recursively below
/// `<root>/<relpath>`, including the toplevel.
pub fn setfacl_tree_modify(
    root: &Path,
    relpath: &str,
    dir_entries: &[String],
    file_entries: &[String],
) -> FsResult<()> {
    find_xargs(
        Some(root),
        Path::new(relpath),
        &["-type", "d", "-print0"],
        &["setfacl", "-nm", &dir_entries.join(","), "--"],
    )?;
    find_xargs(
        Some(root),
        Path::new(relpath),
        &["-type", "f", "-print0"],
        &["setfacl", "-nm", &file_entries.join(","), "--"],
    )
}

/// Removes ACL entries recursively below `<root>/<relpath>`.
pub fn setfacl_tree_remove(root: &Path, relpath: &str, entries: &[String]) -> FsResult<()> {
    find_xargs(
        Some(root),
        Path::new(relpath),
        &[
            "-type", "d", "-print0", "-or", "-type", "f", "-print0",
        ],
        &["setfacl", "-nx", &entries.join(","), "--"],
    )
}

/// Adds one traversal entry `group:<group>:--x` to many paths in a single
/// `xargs | setfacl` batch; paths are relative to `root`.
pub fn setfacl_paths_traversal(root: &Path, relpaths: &[String], group: &str) -> FsResult<()> {
    let entry = format!("group:{group}:--x");
    run_with_stdin(
        Command::new("xargs")
            .args(["-0", "--no-run-if-empty", "setfacl", "-nm", &entry, "--"])
            .current_dir(root),
        &nul_joined(relpaths),
        "xargs setfacl traversal",
    )?;
    Ok(())
}

/// Reads the ACLs of many paths relative to `root` in one `getfacl` batch.
/// Missing paths are silently skipped; with no existing path at all this
/// is a no-op returning an empty list.
pub fn getfacl_paths(root: &Path, relpaths: &[String]) -> FsResult<Vec<FileAcl>> {
    let existing: Vec<String> = relpaths
        .iter()
        .filter(|p| root.join(p).is_dir())
        .cloned()
        .collect();
    if existing.is_empty() {
        debug!("getfacl batch: no existing paths under `{}`", root.display());
        return Ok(vec![]);
    }

    let out = run_with_stdin(
        Command::new("xargs")
            .args(["-0", "--no-run-if-empty", "getfacl", "--"])
            .current_dir(root)
            .stdout(Stdio::piped()),
        &nul_joined(&existing),
        "xargs getfacl",
    )?;
    let text = String::from_utf8_lossy(&out);
    Ok(orgfs_core::acl::parse_getfacl_output(&text)?)
}

/// Reads one path's ACL in the canonical comparison form: absolute path,
/// no effective-rights comments, numeric ids.
pub fn getfacl_numeric(path: &Path) -> FsResult<String> {
    let out = run_output(
        Command::new("getfacl").args(["-p", "-E", "-n"]).arg(path),
        "getfacl",
    )?;
    Ok(String::from_utf8_lossy(&out).trim().to_string())
}

/// Enumerates paths below `subroot` to depth 2, as `find` reports them.
pub fn find_paths_depth2(subroot: &Path) -> FsResult<Vec<String>> {
    let out = run_output(
        Command::new("find")
            .arg(subroot)
            .args(["-maxdepth", "2", "-print0"]),
        "find",
    )?;
    let text = String::from_utf8_lossy(&out);
    Ok(text
        .split('\0')
        .filter(|p| !p.is_empty())
        .map(|p| p.to_string())
        .collect())
}

fn nul_joined(paths: &[String]) -> Vec<u8> {
    let mut buf = Vec::new();
    for p in paths {
        buf.extend_from_slice(p.as_bytes());
        buf.push(0);
    }
    buf
}

fn spawn(cmd: &mut Command, what: &str) -> FsResult<Child> {
    cmd.spawn().map_err(|e| FsError::Command {
        what: what.to_string(),
        detail: e.to_string(),
    })
}

fn wait_checked(mut child: Child, what: &str) -> FsResult<()> {
    let status = child.wait().map_err(|e| FsError::Command {
        what: what.to_string(),
        detail: e.to_string(),
    })?;
    if !status.success() {
        return Err(FsError::Command {
            what: what.to_string(),
            detail: format!("exited with {status}"),
        });
    }
    Ok(())
}

/// Runs a command, capturing stdout; stderr is inherited.
fn run_output(cmd: &mut Command, what: &str) -> FsResult<Vec<u8>> {
    let out = cmd.stdout(Stdio::piped()).output().map_err(|e| FsError::Command {
        what: what.to_string(),
        detail: e.to_string(),
    })?;
    if !out.status.success() {
        return Err(FsError::Command {
            what: what.to_string(),
            detail: format!("exited with {}", out.status),
        });
    }
    Ok(out.stdout)
}

/// Runs a command feeding `input` on stdin.  Stdin is closed before the
/// wait.  Returns captured stdout if the caller piped it, else empty.
fn run_with_stdin(cmd: &mut Command, input: &[u8], what: &str) -> FsResult<Vec<u8>> {
    let mut child = spawn(cmd.stdin(Stdio::piped()), what)?;
    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(input).map_err(|e| FsError::Command {
            what: what.to_string(),
            detail: format!("writing stdin: {e}"),
        })?;
    }
    let out = child.wait_with_output().map_err(|e| FsError::Command {
        what: what.to_string(),
        detail: e.to_string(),
    })?;
    if !out.status.success() {
        return Err(FsError::Command {
            what: what.to_string(),
            detail: format!("exited with {}", out.status),
        });
    }
    Ok(out.stdout)
}

/// Runs `find <start> <find_args> | xargs -0 --no-run-if-empty <apply>`,
/// with both children sharing `cwd` when given.
fn find_xargs(cwd: Option<&Path>, start: &Path, find_args: &[&str], apply: &[&str]) -> FsResult<()> {
    let what = format!("find | xargs {}", apply.first().copied().unwrap_or(""));

    let mut find_cmd = Command::new("find");
    find_cmd.arg(start).args(find_args).stdout(Stdio::piped());
    if let Some(dir) = cwd {
        find_cmd.current_dir(dir);
    }
    let mut find_child = spawn(&mut find_cmd, &what)?;
    let find_out = find_child.stdout.take().ok_or_else(|| FsError::Command {
        what: what.clone(),
        detail: "missing find stdout".to_string(),
    })?;

    let mut xargs_cmd = Command::new("xargs");
    xargs_cmd
        .args(["-0", "--no-run-if-empty"])
        .args(apply)
        .stdin(Stdio::from(find_out));
    if let Some(dir) = cwd {
        xargs_cmd.current_dir(dir);
    }
    let xargs_child = spawn(&mut xargs_cmd, &what)?;

    wait_checked(xargs_child, &what)?;
    wait_checked(find_child, &what)
}
