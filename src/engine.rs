use std::collections::HashMap;
use std::fs::exists;

use anyhow::{bail, Context as _, Result};
use log::{debug, info};

use crate::cache::Cache;
use crate::container::{Context as ContainerContext, Mount};
use crate::error::ChariotError;
use crate::fs_util::{clean, copy_recursive, make_dir, remove_recursive, write_file};
use crate::recipe::{Namespace, Recipe, RecipeGraph, RecipeId, RecipeKind, RecipeSet, RecipeStatus, SourceType};
use crate::substitute::substitute;

/// Drives the cache-gated, dependency-ordered build of one or more recipes
/// against a shared rootfs and cache. One `Engine` is built per invocation
/// of the tool; `process` may be called once per force-listed recipe.
pub struct Engine<'a> {
    cache: &'a Cache,
    graph: &'a RecipeGraph,
    verbose: bool,
}

impl<'a> Engine<'a> {
    pub fn new(cache: &'a Cache, graph: &'a RecipeGraph, verbose: bool) -> Engine<'a> {
        Engine { cache, graph, verbose }
    }

    /// Implements the eight-step `process_recipe` contract: recurse into
    /// the recipe's source/dependencies first, skip recipes already built
    /// or present-and-not-invalidated, stage the dependency closure, clean
    /// and materialize the recipe's own directory, then mark it built.
    pub fn process(&self, id: RecipeId) -> Result<()> {
        let recipe = self.graph.get(id);

        if let RecipeKind::HostTarget(fields) = &recipe.kind {
            if let Some(source_id) = fields.source {
                self.process(source_id)?;
            }
        }
        for edge in &recipe.dependencies {
            self.process(edge.target)?;
        }

        let recipe_dir = self.cache.recipe_dir(recipe.namespace, &recipe.name);
        let status = recipe.status.get();
        let dir_exists = exists(&recipe_dir).unwrap_or(false);
        if status.built || (dir_exists && !status.invalidated) {
            return Ok(());
        }

        info!("> {}", recipe.qualified_name());

        if let Err(err) = self.build_recipe(id, recipe, &recipe_dir) {
            if remove_recursive(&recipe_dir).is_err() {
                log::warn!("Failed to clean up broken build for `{}`, remove manually", recipe.qualified_name());
            }
            return Err(err);
        }

        recipe.status.set(RecipeStatus { built: true, invalidated: status.invalidated });
        Ok(())
    }

    fn build_recipe(&self, id: RecipeId, recipe: &Recipe, recipe_dir: &std::path::Path) -> Result<()> {
        self.clean_cache_dir(recipe, self.cache.deps_source_dir())?;
        self.clean_cache_dir(recipe, self.cache.deps_host_dir())?;
        self.clean_cache_dir(recipe, self.cache.deps_target_dir())?;

        let mut installed = RecipeSet::new();
        self.install_deps(id, false, &mut installed).context("Failed to install dependencies")?;

        self.clean_cache_dir(recipe, recipe_dir.to_path_buf())?;

        let mut context = ContainerContext::new(self.cache.rootfs_dir(), "/root").set_verbose(self.verbose);

        let source_deps_mount = Mount::new(self.cache.deps_source_dir(), "/chariot/sources");
        let host_deps_mount = Mount::new(self.cache.deps_host_dir(), "/usr/local");
        let target_deps_mount = Mount::new(self.cache.deps_target_dir(), "/chariot/sysroot");

        match &recipe.kind {
            RecipeKind::Source(fields) => self.build_source(recipe, recipe_dir, &mut context, &source_deps_mount, &host_deps_mount, &target_deps_mount, fields),
            RecipeKind::HostTarget(fields) => {
                self.build_host_target(recipe, &mut context, &source_deps_mount, &host_deps_mount, &target_deps_mount, fields)
            }
        }
    }

    /// Wraps `clean` for a cache-owned directory, mapping I/O failure onto
    /// `ChariotError::CacheIo` so callers can branch on cache breakage
    /// distinctly from recipe or container failures.
    fn clean_cache_dir(&self, recipe: &Recipe, dir: std::path::PathBuf) -> Result<()> {
        clean(&dir).map_err(|source| {
            ChariotError::CacheIo { namespace: recipe.namespace.to_string(), name: recipe.name.clone(), source }.into()
        })
    }

    /// Stages every dependency edge reachable from `id` into the shared
    /// per-kind deps directories: source deps land in a per-name
    /// subdirectory, host/target deps merge into one shared tree (mirroring
    /// how `/usr/local` and the sysroot are single merged mounts). The
    /// initial call stages every direct edge; recursive calls only follow
    /// `runtime` edges, so a build dependency's own build dependencies are
    /// never transitively re-staged.
    fn install_deps(&self, id: RecipeId, runtime_only: bool, installed: &mut RecipeSet) -> Result<()> {
        let recipe = self.graph.get(id);

        for edge in &recipe.dependencies {
            if runtime_only && !edge.runtime {
                continue;
            }
            if installed.contains(edge.target) {
                continue;
            }

            let dependency = self.graph.get(edge.target);

            let result = match dependency.namespace {
                Namespace::Source => {
                    let dest = self.cache.deps_source_dir().join(&dependency.name);
                    make_dir(&dest).and_then(|_| copy_recursive(self.cache.source_src_dir(&dependency.name), &dest))
                }
                Namespace::Host => copy_recursive(
                    self.cache.host_target_install_dir(Namespace::Host, &dependency.name).join("usr").join("local"),
                    self.cache.deps_host_dir(),
                ),
                Namespace::Target => {
                    copy_recursive(self.cache.host_target_install_dir(Namespace::Target, &dependency.name), self.cache.deps_target_dir())
                }
            };
            result.with_context(|| format!("Failed to install dependency `{}` for `{}`", dependency.qualified_name(), recipe.qualified_name()))?;

            installed.insert(edge.target);
            self.install_deps(edge.target, true, installed)?;
        }

        Ok(())
    }

    fn build_source(
        &self,
        recipe: &Recipe,
        recipe_dir: &std::path::Path,
        context: &mut ContainerContext,
        source_deps_mount: &Mount,
        host_deps_mount: &Mount,
        target_deps_mount: &Mount,
        fields: &crate::recipe::SourceFields,
    ) -> Result<()> {
        let src_path = self.cache.source_src_dir(&recipe.name);
        make_dir(&src_path).with_context(|| format!("Failed to create src directory for `{}`", recipe.name))?;

        context.add_mount(Mount::new(recipe_dir, "/chariot/source"));

        match fields.source_type {
            SourceType::Local => {
                if !exists(&fields.url)? {
                    bail!("Local directory not found `{}` for `{}`", fields.url, recipe.name);
                }
                copy_recursive(&fields.url, &src_path).with_context(|| format!("Local copy failed for `{}`", recipe.name))?;
            }
            SourceType::TarGz | SourceType::TarXz => {
                let tar_format = if fields.source_type == SourceType::TarGz { "--gzip" } else { "--zstd" };

                let sums_path = self.cache.source_b2sums_path(&recipe.name);
                if !exists(&sums_path)? {
                    let b2sum = fields.b2sum.as_deref().expect("tar sources require a b2sum, enforced at parse time");
                    write_file(&sums_path, format!("{b2sum} /chariot/source/archive")).context("Failed to write checksum file")?;
                }

                let archive_path = self.cache.source_archive_path(&recipe.name);
                if !exists(&archive_path)? {
                    context
                        .exec(&["wget", "-qO", "/chariot/source/archive", &fields.url])
                        .map_err(|_| ChariotError::FetchFail { name: recipe.name.clone() })?;
                }

                context
                    .exec(&["b2sum", "--check", "/chariot/source/b2sums.txt"])
                    .map_err(|_| ChariotError::ChecksumFail { name: recipe.name.clone() })?;

                context
                    .exec(&[
                        "tar",
                        "--no-same-owner",
                        "--no-same-permissions",
                        "--strip-components",
                        "1",
                        "-x",
                        tar_format,
                        "-C",
                        "/chariot/source/src",
                        "-f",
                        "/chariot/source/archive",
                    ])
                    .map_err(|_| ChariotError::ExtractFail { name: recipe.name.clone() })?;
            }
        }

        let src_mount = Mount::new(&src_path, "/chariot/source");
        context.cwd = "/chariot/source".into();
        context.clear_mounts();
        context.add_mount(src_mount.clone());

        if let Some(patch) = &fields.patch {
            let patches_dir = self.cache.patches_dir();
            let patch_path = patches_dir.join(patch);
            if !exists(&patch_path)? {
                bail!(ChariotError::PatchMissing { name: recipe.name.clone(), patch: patch.clone() });
            }

            context.add_mount(Mount::new(&patches_dir, "/chariot/patches").read_only());
            let local_patch_path = format!("/chariot/patches/{patch}");
            context
                .exec(&["patch", "-p1", "-i", &local_patch_path])
                .map_err(|_| ChariotError::PatchFail { name: recipe.name.clone(), patch: patch.clone() })?;
        }

        context.clear_mounts();
        context.add_mount(source_deps_mount.clone());
        context.add_mount(host_deps_mount.clone());
        context.add_mount(target_deps_mount.clone());
        context.add_mount(src_mount);

        if let Some(strap) = &fields.strap {
            let vars = HashMap::from([("sources_dir", "/chariot/sources")]);
            let cmd = substitute(strap, &vars).map_err(|e| ChariotError::UnknownEmbed {
                namespace: recipe.namespace.to_string(),
                recipe_name: recipe.name.clone(),
                name: e.name,
            })?;
            context.exec_shell(&cmd).map_err(|_| ChariotError::StageExec {
                namespace: recipe.namespace.to_string(),
                name: recipe.name.clone(),
            })?;
        }

        Ok(())
    }

    fn build_host_target(
        &self,
        recipe: &Recipe,
        context: &mut ContainerContext,
        source_deps_mount: &Mount,
        host_deps_mount: &Mount,
        target_deps_mount: &Mount,
        fields: &crate::recipe::HostTargetFields,
    ) -> Result<()> {
        let prefix = if recipe.namespace == Namespace::Host { "/usr/local" } else { "/usr" };

        let build_path = self.cache.host_target_build_dir(recipe.namespace, &recipe.name);
        let install_path = self.cache.host_target_install_dir(recipe.namespace, &recipe.name);
        make_dir(&build_path).with_context(|| format!("Failed to create build directory for `{}`", recipe.qualified_name()))?;
        make_dir(&install_path).with_context(|| format!("Failed to create install directory for `{}`", recipe.qualified_name()))?;

        let source_path = fields.source.map(|source_id| {
            let source = self.graph.get(source_id);
            self.cache.source_src_dir(&source.name)
        });

        context.cwd = "/chariot/build".into();
        context.clear_mounts();
        context.add_mount(source_deps_mount.clone());
        context.add_mount(host_deps_mount.clone());
        context.add_mount(target_deps_mount.clone());
        if let Some(source_path) = &source_path {
            context.add_mount(Mount::new(source_path, "/chariot/source"));
        }
        context.add_mount(Mount::new(&build_path, "/chariot/build"));
        context.add_mount(Mount::new(&install_path, "/chariot/install"));

        let mut base_vars = HashMap::from([("prefix", prefix), ("sysroot_dir", "/chariot/sysroot"), ("sources_dir", "/chariot/sources")]);

        if let Some(configure) = &fields.configure {
            let mut vars = base_vars.clone();
            if source_path.is_some() {
                vars.insert("source_dir", "/chariot/source");
            }
            self.run_stage(recipe, context, configure, &vars)?;
        }

        if let Some(build) = &fields.build {
            base_vars.insert("thread_count", "8");
            self.run_stage(recipe, context, build, &base_vars)?;
            base_vars.remove("thread_count");
        }

        if let Some(install) = &fields.install {
            base_vars.insert("install_dir", "/chariot/install");
            self.run_stage(recipe, context, install, &base_vars)?;
        }

        Ok(())
    }

    fn run_stage(&self, recipe: &Recipe, context: &ContainerContext, command: &str, vars: &HashMap<&str, &str>) -> Result<()> {
        let cmd = substitute(command, vars).map_err(|e| ChariotError::UnknownEmbed {
            namespace: recipe.namespace.to_string(),
            recipe_name: recipe.name.clone(),
            name: e.name,
        })?;
        debug!("Running stage for `{}`: {cmd}", recipe.qualified_name());
        context.exec_shell(&cmd).map_err(|_| {
            ChariotError::StageExec { namespace: recipe.namespace.to_string(), name: recipe.name.clone() }.into()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipe::{HostTargetFields, SourceFields};
    use std::cell::Cell;

    fn source_recipe(name: &str, url: &str) -> Recipe {
        Recipe {
            namespace: Namespace::Source,
            name: name.to_string(),
            dependencies: Vec::new(),
            kind: RecipeKind::Source(SourceFields { url: url.to_string(), source_type: SourceType::Local, patch: None, b2sum: None, strap: None }),
            status: Cell::new(RecipeStatus::default()),
        }
    }

    #[test]
    fn cache_gate_skips_built_recipe() {
        let mut graph = RecipeGraph::new();
        let id = graph.push(source_recipe("zlib", "./vendor"));
        graph.get(id).status.set(RecipeStatus { built: true, invalidated: false });

        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(dir.path());
        let engine = Engine::new(&cache, &graph, false);

        // Already built: process() should return immediately without
        // attempting any container work (which would fail outside a real
        // namespace sandbox).
        engine.process(id).unwrap();
    }

    #[test]
    fn host_target_without_install_fields_has_no_stage_errors() {
        let mut graph = RecipeGraph::new();
        let id = graph.push(Recipe {
            namespace: Namespace::Host,
            name: "noop".to_string(),
            dependencies: Vec::new(),
            kind: RecipeKind::HostTarget(HostTargetFields { source: None, configure: None, build: None, install: None }),
            status: Cell::new(RecipeStatus { built: true, invalidated: false }),
        });

        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(dir.path());
        let engine = Engine::new(&cache, &graph, false);
        engine.process(id).unwrap();
    }

    #[test]
    fn clean_cache_dir_reports_cache_io_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(dir.path());
        let mut graph = RecipeGraph::new();
        let id = graph.push(source_recipe("zlib", "./vendor"));
        let engine = Engine::new(&cache, &graph, false);
        let recipe = graph.get(id);

        // A path with a regular file standing where a parent directory
        // component is expected makes remove_recursive/make_dir fail.
        let blocker = dir.path().join("blocker");
        write_file(&blocker, b"x").unwrap();
        let unreachable = blocker.join("child");

        let err = engine.clean_cache_dir(recipe, unreachable).unwrap_err();
        assert!(matches!(err.downcast_ref::<ChariotError>(), Some(ChariotError::CacheIo { .. })));
    }
}
