//! Packaging settings resolved by the build script.

include!(concat!(env!("OUT_DIR"), "/build_config.rs"));

/// Human-readable summary printed by `stf-reader-test --build-info`
pub fn summary() -> String {
    format!(
        "build dir: {BUILD_DIR}\nmetadata dir: {METADATA_DIR}\nextra link args: {}",
        EXTRA_LINK_ARGS.join(" ")
    )
}
