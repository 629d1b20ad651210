//! Parsing of the packaging environment. Also compiled into `build.rs`.

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Error};

/// Overrides the directory build outputs and package metadata are placed in
pub const BUILD_DIR_VAR: &str = "STFPY_BUILD_DIR";
/// Extra linker arguments for the binaries, separated by single spaces
pub const LDFLAGS_VAR: &str = "LDFLAGS";

/// Name of the package metadata directory inside the build directory
pub const METADATA_DIR_NAME: &str = "stf_tools.egg-info";

/// Picks the build directory: the override if it is set and not empty,
/// `default` otherwise
pub fn resolve_build_dir(build_dir: Option<&str>, default: &Path) -> PathBuf {
    match build_dir {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => default.to_path_buf(),
    }
}

/// Splits `LDFLAGS` on single spaces. Empty tokens, e.g. from doubled
/// spaces, are dropped.
pub fn split_ldflags(flags: &str) -> Vec<&str> {
    flags.split(' ').filter(|token| !token.is_empty()).collect()
}

/// Packaging settings resolved from the environment of a build
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildEnv {
    pub build_dir: PathBuf,
    pub metadata_dir: PathBuf,
    pub link_args: Vec<String>,
}

impl BuildEnv {
    /// Resolves the build directory and link arguments from the raw
    /// `STFPY_BUILD_DIR` and `LDFLAGS` values. `out_dir` is the fallback
    /// build directory.
    pub fn resolve(build_dir: Option<&str>, ldflags: Option<&str>, out_dir: &Path) -> Self {
        let build_dir = resolve_build_dir(build_dir, out_dir);
        let metadata_dir = build_dir.join(METADATA_DIR_NAME);
        let link_args = split_ldflags(ldflags.unwrap_or_default())
            .into_iter()
            .map(str::to_string)
            .collect();

        Self {
            build_dir,
            metadata_dir,
            link_args,
        }
    }

    /// Creates the metadata directory and writes `PKG-INFO` into it
    pub fn write_metadata(&self, name: &str, version: &str) -> Result<(), Error> {
        fs::create_dir_all(&self.metadata_dir).with_context(|| {
            format!(
                "Failed to create package metadata directory {}",
                self.metadata_dir.display()
            )
        })?;
        fs::write(
            self.metadata_dir.join("PKG-INFO"),
            format!("Name: {name}\nVersion: {version}\n"),
        )?;

        Ok(())
    }

    /// Cargo directives passing the link arguments to the binaries, in
    /// `LDFLAGS` order. Cargo adds them after rustc's own link arguments.
    pub fn link_directives(&self) -> Vec<String> {
        self.link_args
            .iter()
            .map(|arg| format!("cargo::rustc-link-arg-bins={arg}"))
            .collect()
    }

    /// Source of the generated `build_config.rs`
    pub fn config_source(&self) -> String {
        format!(
            "pub const BUILD_DIR: &str = {:?};\npub const METADATA_DIR: &str = {:?};\npub const EXTRA_LINK_ARGS: &[&str] = &{:?};\n",
            self.build_dir.display().to_string(),
            self.metadata_dir.display().to_string(),
            self.link_args
        )
    }
}
