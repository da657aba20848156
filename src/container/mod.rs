use std::collections::HashMap;
use std::path::{Path, PathBuf};

use nix::unistd::{Gid, Uid};

pub mod runtime;

/// A single bind mount staged into the container before `chroot`.
#[derive(Debug, Clone)]
pub struct Mount {
    pub from: PathBuf,
    pub to: PathBuf,
    pub read_only: bool,
}

impl Mount {
    pub fn new(from: impl AsRef<Path>, to: impl AsRef<Path>) -> Mount {
        Mount { from: from.as_ref().to_path_buf(), to: to.as_ref().to_path_buf(), read_only: false }
    }

    pub fn read_only(mut self) -> Mount {
        self.read_only = true;
        self
    }
}

/// Builds up the arguments for one container invocation: the rootfs to
/// chroot into, the identity to run as, the working directory, the
/// environment, and the mount set. `Context::exec`/`exec_shell` run the
/// five-stage fork chain described in `runtime`.
pub struct Context {
    pub rootfs_path: PathBuf,
    pub rootfs_read_only: bool,
    pub uid: Uid,
    pub gid: Gid,
    pub cwd: PathBuf,
    pub verbose: bool,
    pub environment: HashMap<String, String>,
    pub mounts: Vec<Mount>,
}

impl Context {
    pub fn new(rootfs_path: impl AsRef<Path>, cwd: impl AsRef<Path>) -> Context {
        Context {
            rootfs_path: rootfs_path.as_ref().to_path_buf(),
            rootfs_read_only: false,
            uid: Uid::from_raw(0),
            gid: Gid::from_raw(0),
            cwd: cwd.as_ref().to_path_buf(),
            verbose: false,
            environment: HashMap::new(),
            mounts: Vec::new(),
        }
    }

    pub fn set_verbose(mut self, verbose: bool) -> Context {
        self.verbose = verbose;
        self
    }

    pub fn clear_mounts(&mut self) {
        self.mounts.clear();
    }

    pub fn add_mount(&mut self, mount: Mount) {
        self.mounts.push(mount);
    }

    pub fn exec(&self, args: &[&str]) -> anyhow::Result<()> {
        runtime::run(self, args)
    }

    pub fn exec_shell(&self, command: impl AsRef<str>) -> anyhow::Result<()> {
        self.exec(&["bash", "-c", command.as_ref()])
    }
}
