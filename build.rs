use std::path::PathBuf;
use std::{env, fs};

use anyhow::{Context, Error};

#[path = "src/build_env.rs"]
#[allow(dead_code)]
mod build_env;

use build_env::{BUILD_DIR_VAR, BuildEnv, LDFLAGS_VAR};

fn main() -> Result<(), Error> {
    println!("cargo::rerun-if-changed=build.rs");
    println!("cargo::rerun-if-changed=src/build_env.rs");
    println!("cargo::rerun-if-env-changed={BUILD_DIR_VAR}");
    println!("cargo::rerun-if-env-changed={LDFLAGS_VAR}");

    let out_dir = PathBuf::from(env::var_os("OUT_DIR").context("OUT_DIR must be set")?);

    let build_env = BuildEnv::resolve(
        env::var(BUILD_DIR_VAR).ok().as_deref(),
        env::var(LDFLAGS_VAR).ok().as_deref(),
        &out_dir,
    );
    build_env.write_metadata(&env::var("CARGO_PKG_NAME")?, &env::var("CARGO_PKG_VERSION")?)?;

    for directive in build_env.link_directives() {
        println!("{directive}");
    }

    fs::write(out_dir.join("build_config.rs"), build_env.config_source())?;

    Ok(())
}
