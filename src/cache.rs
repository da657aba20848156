use std::path::{Path, PathBuf};

use crate::recipe::Namespace;

/// Path helpers over the on-disk `.chariot-cache` layout:
///
/// ```text
/// <root>/
///   rootfs/                  base container rootfs + state.toml
///   patches/                 patch files referenced by `patch:` fields
///   source/<name>/           src/, archive, b2sums.txt
///   host/<name>/             build/, install/
///   target/<name>/           build/, install/
///   deps/{source,host,target}/   dependency staging area for one build
///   chariot.lock              process-held exclusive lock
/// ```
pub struct Cache {
    root: PathBuf,
}

impl Cache {
    pub fn new(root: impl AsRef<Path>) -> Cache {
        Cache { root: root.as_ref().to_path_buf() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn lockfile_path(&self) -> PathBuf {
        self.root.join("chariot.lock")
    }

    pub fn rootfs_dir(&self) -> PathBuf {
        self.root.join("rootfs")
    }

    pub fn patches_dir(&self) -> PathBuf {
        self.root.join("patches")
    }

    pub fn recipe_dir(&self, namespace: Namespace, name: &str) -> PathBuf {
        self.root.join(namespace.as_str()).join(name)
    }

    pub fn source_src_dir(&self, name: &str) -> PathBuf {
        self.recipe_dir(Namespace::Source, name).join("src")
    }

    pub fn source_archive_path(&self, name: &str) -> PathBuf {
        self.recipe_dir(Namespace::Source, name).join("archive")
    }

    pub fn source_b2sums_path(&self, name: &str) -> PathBuf {
        self.recipe_dir(Namespace::Source, name).join("b2sums.txt")
    }

    pub fn host_target_build_dir(&self, namespace: Namespace, name: &str) -> PathBuf {
        self.recipe_dir(namespace, name).join("build")
    }

    pub fn host_target_install_dir(&self, namespace: Namespace, name: &str) -> PathBuf {
        self.recipe_dir(namespace, name).join("install")
    }

    pub fn deps_source_dir(&self) -> PathBuf {
        self.root.join("deps").join("source")
    }

    pub fn deps_host_dir(&self) -> PathBuf {
        self.root.join("deps").join("host")
    }

    pub fn deps_target_dir(&self) -> PathBuf {
        self.root.join("deps").join("target")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recipe_dir_uses_namespace_as_subdirectory() {
        let cache = Cache::new("/tmp/.chariot-cache");
        assert_eq!(cache.recipe_dir(Namespace::Source, "zlib"), Path::new("/tmp/.chariot-cache/source/zlib"));
        assert_eq!(cache.recipe_dir(Namespace::Host, "gcc"), Path::new("/tmp/.chariot-cache/host/gcc"));
    }

    #[test]
    fn host_install_dir_is_under_recipe_dir() {
        let cache = Cache::new(".chariot-cache");
        assert_eq!(
            cache.host_target_install_dir(Namespace::Target, "libc"),
            Path::new(".chariot-cache/target/libc/install")
        );
    }
}
