use std::ffi::CString;
use std::fs::{write, File};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use nix::mount::{mount, MsFlags};
use nix::sched::{unshare, CloneFlags};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{chdir, chroot, close, dup2, execvp, fork, getegid, geteuid, setgid, setuid, ForkResult};

use crate::error::ChariotError;
use crate::fs_util::make_dir;

use super::Context;

const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Entry point: runs `args` inside the container described by `context`,
/// blocking until it exits. Every fork in the chain is `waitpid`-ed before
/// the function returns, including on error paths.
pub fn run(context: &Context, args: &[&str]) -> Result<()> {
    let args: Vec<CString> = args.iter().map(|a| CString::new(*a).expect("argument contains NUL byte")).collect();
    let environment = composed_environment(context);

    match unsafe { fork() }.map_err(|e| ChariotError::ContainerSyscall(anyhow::Error::from(e)))? {
        ForkResult::Child => stage1(context, &args, &environment),
        ForkResult::Parent { child } => {
            match waitpid(child, None).map_err(|e| ChariotError::ContainerSyscall(anyhow::Error::from(e)))? {
                WaitStatus::Exited(_, 0) => Ok(()),
                WaitStatus::Exited(_, code) => bail!("Container process exited with status {code}"),
                status => bail!("Container process ended unexpectedly: {status:?}"),
            }
        }
    }
}

/// Adds `HOME`/`LANG`/`PATH` defaults per the containment contract: `HOME`
/// defaults to the configured cwd, `LANG` defaults to `C`, and `PATH` is
/// always prefixed with the fixed default search path rather than replaced.
fn composed_environment(context: &Context) -> Vec<(String, String)> {
    let mut env: Vec<(String, String)> = context.environment.iter().map(|(k, v)| (k.clone(), v.clone())).collect();

    if !env.iter().any(|(k, _)| k == "HOME") {
        env.push(("HOME".to_string(), context.cwd.to_string_lossy().into_owned()));
    }
    if !env.iter().any(|(k, _)| k == "LANG") {
        env.push(("LANG".to_string(), "C".to_string()));
    }
    match env.iter_mut().find(|(k, _)| k == "PATH") {
        Some((_, value)) => *value = format!("{DEFAULT_PATH}:{value}"),
        None => env.push(("PATH".to_string(), DEFAULT_PATH.to_string())),
    }

    env
}

fn rootfs_relative(rootfs: &Path, path: &str) -> PathBuf {
    match path.strip_prefix('/') {
        Some(rest) => rootfs.join(rest),
        None => rootfs.join(path),
    }
}

/// Stage 1: enters new user and pid namespaces, maps the caller's uid/gid
/// onto the requested container identity, then forks again so the mapped
/// process becomes pid 1 of the new pid namespace.
fn stage1(context: &Context, args: &[CString], environment: &[(String, String)]) -> ! {
    let euid = geteuid();
    let egid = getegid();

    unshare(CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWPID).expect("unshare(user, pid) failed");

    write("/proc/self/setgroups", "deny").expect("setgroups write failed");
    write("/proc/self/uid_map", format!("{} {} 1", context.uid, euid)).expect("uid_map write failed");
    write("/proc/self/gid_map", format!("{} {} 1", context.gid, egid)).expect("gid_map write failed");

    setuid(context.uid).expect("setuid failed");
    setgid(context.gid).expect("setgid failed");

    match unsafe { fork() }.expect("second fork failed") {
        ForkResult::Child => stage2(context, args, environment),
        ForkResult::Parent { child } => match waitpid(child, None).expect("second waitpid failed") {
            WaitStatus::Exited(_, code) => std::process::exit(code),
            status => panic!("container init process ended unexpectedly: {status:?}"),
        },
    }
}

/// Stage 2: enters a new mount namespace, bind-mounts the rootfs onto
/// itself (optionally read-only), lays down the fixed mount set plus the
/// caller's configured mounts, then chroots and forks once more so the
/// final exec runs as pid 1's child rather than pid 1 itself.
fn stage2(context: &Context, args: &[CString], environment: &[(String, String)]) -> ! {
    unshare(CloneFlags::CLONE_NEWNS).expect("unshare(mount) failed");

    let rootfs = &context.rootfs_path;
    mount(Some(rootfs), rootfs, None::<&str>, MsFlags::MS_BIND, None::<&str>).expect("rootfs bind mount failed");

    let mut remount_flags = MsFlags::MS_REMOUNT | MsFlags::MS_BIND | MsFlags::MS_NOSUID | MsFlags::MS_NODEV;
    if context.rootfs_read_only {
        remount_flags |= MsFlags::MS_RDONLY;
    }
    mount(Some(rootfs), rootfs, None::<&str>, remount_flags, None::<&str>).expect("rootfs remount failed");

    bind_mount(rootfs, "/etc/resolv.conf", None, MsFlags::MS_BIND, false);
    bind_mount(rootfs, "/dev", None, MsFlags::MS_BIND | MsFlags::MS_REC | MsFlags::MS_SLAVE, false);
    bind_mount(rootfs, "/sys", None, MsFlags::MS_BIND | MsFlags::MS_REC | MsFlags::MS_SLAVE, false);
    fs_mount(rootfs, "/run", "tmpfs");
    fs_mount(rootfs, "/tmp", "tmpfs");
    fs_mount(rootfs, "/var/tmp", "tmpfs");
    fs_mount(rootfs, "/proc", "proc");

    for m in &context.mounts {
        let dest = m.to.to_str().expect("mount destination must be utf-8");
        bind_mount(rootfs, dest, Some(&m.from), MsFlags::MS_BIND, true);
        if m.read_only {
            let final_to = rootfs_relative(rootfs, dest);
            mount(Some(&m.from), &final_to, None::<&str>, MsFlags::MS_REMOUNT | MsFlags::MS_BIND | MsFlags::MS_RDONLY, None::<&str>)
                .expect("read-only remount failed");
        }
    }

    chroot(rootfs).expect("chroot failed");
    chdir(&context.cwd).expect("chdir failed");

    match unsafe { fork() }.expect("third fork failed") {
        ForkResult::Child => stage3(context, args, environment),
        ForkResult::Parent { child } => match waitpid(child, None).expect("third waitpid failed") {
            WaitStatus::Exited(_, code) => std::process::exit(code),
            status => panic!("container process ended unexpectedly: {status:?}"),
        },
    }
}

/// Binds `from` (or `dest` itself, when `from` is `None`) onto
/// `<rootfs><dest>`, creating the mountpoint first. Matches `rootfs_mount`.
fn bind_mount(rootfs: &Path, dest: &str, from: Option<&Path>, flags: MsFlags, make_mountpoint: bool) {
    let final_to = rootfs_relative(rootfs, dest);
    if make_mountpoint {
        make_dir(&final_to).expect("failed to create mountpoint");
    }
    let source = from.unwrap_or(Path::new(dest));
    mount(Some(source), &final_to, None::<&str>, flags, None::<&str>).unwrap_or_else(|_| panic!("mount of {dest} failed"));
}

fn fs_mount(rootfs: &Path, dest: &str, fstype: &str) {
    let final_to = rootfs_relative(rootfs, dest);
    make_dir(&final_to).expect("failed to create mountpoint");
    mount(None::<&str>, &final_to, Some(fstype), MsFlags::empty(), None::<&str>).unwrap_or_else(|_| panic!("mount of {dest} failed"));
}

/// Stage 3: the process that actually execs the requested program. When
/// non-verbose, stdout is redirected to `/dev/null` before the environment
/// is cleared and replaced wholesale with the composed environment.
fn stage3(context: &Context, args: &[CString], environment: &[(String, String)]) -> ! {
    if !context.verbose {
        let devnull = File::options().write(true).open("/dev/null").expect("failed to open /dev/null");
        dup2(devnull.as_raw_fd(), nix::libc::STDOUT_FILENO).expect("dup2 onto stdout failed");
        close(devnull.as_raw_fd()).ok();
    }

    for (key, _) in std::env::vars() {
        std::env::remove_var(key);
    }
    for (key, value) in environment {
        std::env::set_var(key, value);
    }

    let err = execvp(&args[0], args).expect_err("execvp returned");
    eprintln!("Exec failed: {err}");
    std::process::exit(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::PathBuf;

    fn bare_context() -> Context {
        Context {
            rootfs_path: PathBuf::from("/rootfs"),
            rootfs_read_only: false,
            uid: nix::unistd::Uid::from_raw(1000),
            gid: nix::unistd::Gid::from_raw(1000),
            cwd: PathBuf::from("/root"),
            verbose: false,
            environment: HashMap::new(),
            mounts: Vec::new(),
        }
    }

    #[test]
    fn default_env_fills_in_home_lang_path() {
        let env = composed_environment(&bare_context());
        let get = |k: &str| env.iter().find(|(key, _)| key == k).map(|(_, v)| v.clone());
        assert_eq!(get("HOME"), Some("/root".to_string()));
        assert_eq!(get("LANG"), Some("C".to_string()));
        assert_eq!(get("PATH"), Some(DEFAULT_PATH.to_string()));
    }

    #[test]
    fn existing_path_is_prefixed_not_replaced() {
        let mut context = bare_context();
        context.environment.insert("PATH".to_string(), "/opt/cross/bin".to_string());
        let env = composed_environment(&context);
        let path = env.iter().find(|(k, _)| k == "PATH").unwrap();
        assert_eq!(path.1, format!("{DEFAULT_PATH}:/opt/cross/bin"));
    }

    #[test]
    fn explicit_home_is_not_overridden() {
        let mut context = bare_context();
        context.environment.insert("HOME".to_string(), "/custom".to_string());
        let env = composed_environment(&context);
        let home = env.iter().find(|(k, _)| k == "HOME").unwrap();
        assert_eq!(home.1, "/custom");
    }
}
