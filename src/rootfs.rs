use std::fs::{exists, read_to_string, write};
use std::path::Path;
use std::process::Command;

use anyhow::{bail, Context, Result};
use log::info;
use serde::{Deserialize, Serialize};

use crate::cache::Cache;
use crate::container::Context as ContainerContext;
use crate::fs_util::clean;

const ROOTFS_ARCHIVE_URL: &str = "https://archive.archlinux.org/iso/2024.08.01/archlinux-bootstrap-x86_64.tar.zst";
const ROOTFS_VERSION: &str = "2024.08.01";

const TOOL_PACKAGES: &[&str] = &[
    "ninja",
    "meson",
    "git",
    "wget",
    "perl",
    "diffutils",
    "inetutils",
    "python",
    "help2man",
    "bison",
    "flex",
    "gettext",
    "libtool",
    "m4",
    "make",
    "patch",
    "texinfo",
    "which",
    "binutils",
    "gcc",
    "gcc-fortran",
    "nasm",
    "rsync",
];

#[derive(Serialize, Deserialize)]
struct RootfsState {
    intact: bool,
    version: String,
}

/// Ensures `<cache>/rootfs` holds a functional Arch Linux install with the
/// fixed tool set, acquiring it if absent or if its `state.toml` marker
/// doesn't match the pinned version. Mirrors `install_rootfs`.
pub fn ensure_rootfs(cache: &Cache) -> Result<()> {
    let rootfs_dir = cache.rootfs_dir();
    let state_path = rootfs_dir.join("state.toml");

    if exists(&state_path)? {
        let data = read_to_string(&state_path).context("Failed to read rootfs state")?;
        let state: RootfsState = toml::from_str(&data).context("Failed to parse rootfs state")?;
        if state.intact && state.version == ROOTFS_VERSION {
            return Ok(());
        }
    }

    info!("Acquiring base rootfs");
    clean(&rootfs_dir).context("Failed to clean rootfs directory")?;

    fetch_and_extract(&rootfs_dir)?;
    bootstrap_pacman(&rootfs_dir)?;

    let state = RootfsState { intact: true, version: ROOTFS_VERSION.to_string() };
    write(&state_path, toml::to_string(&state).context("Failed to serialize rootfs state")?).context("Failed to write rootfs state")?;

    info!("Rootfs ready");
    Ok(())
}

fn fetch_and_extract(rootfs_dir: &Path) -> Result<()> {
    let command = format!(
        "wget -qO- {ROOTFS_ARCHIVE_URL} | tar --strip-components 1 -x --zstd -C {}",
        rootfs_dir.to_str().context("Rootfs path must be utf-8")?
    );
    let status = Command::new("bash").arg("-c").arg(&command).status().context("Failed to invoke wget/tar")?;
    if !status.success() {
        bail!("Failed to fetch and extract rootfs archive");
    }
    Ok(())
}

fn bootstrap_pacman(rootfs_dir: &Path) -> Result<()> {
    let context = ContainerContext::new(rootfs_dir, "/root").set_verbose(true);

    context.exec_shell("echo 'Server = https://archive.archlinux.org/repos/2024/08/01/$repo/os/$arch' > /etc/pacman.d/mirrorlist")?;
    context.exec_shell("echo 'en_US.UTF-8 UTF-8' > /etc/locale.gen")?;
    context.exec_shell("locale-gen")?;
    context.exec_shell("pacman-key --init")?;
    context.exec_shell("pacman-key --populate archlinux")?;
    context.exec_shell("pacman --noconfirm -Sy archlinux-keyring")?;
    context.exec_shell("pacman --noconfirm -S pacman pacman-mirrorlist")?;
    context.exec_shell("pacman --noconfirm -Syu")?;
    context.exec_shell(format!("pacman --noconfirm -S {}", TOOL_PACKAGES.join(" ")))?;

    Ok(())
}
