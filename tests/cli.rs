use std::{path::Path, process::Command};

use anyhow::Error;
use stf_trace::{
    StfWriter,
    features::TraceFeatures,
    isa::{InstIem, Isa, TraceGenerator},
    records::{Record, TraceInfo},
};
use tempfile::tempdir;

const USAGE: &str = "Usage: stf-reader-test <trace>\n";

fn reader_test() -> Command {
    Command::new(env!("CARGO_BIN_EXE_stf-reader-test"))
}

fn write_trace(path: &Path) -> Result<(), Error> {
    let mut writer = StfWriter::create(path)?;
    writer.set_isa(Isa::Riscv);
    writer.set_iem(InstIem::Rv64);
    writer.set_initial_pc(0x8000_0000);
    writer.add_trace_info(TraceInfo::new(TraceGenerator::Spike, 1, 0, 0, ""));
    writer.set_feature(TraceFeatures::RV64);
    writer.finalize_header()?;
    for _ in 0..100 {
        writer.write(&Record::opcode32(0x13))?;
    }
    // beq x0, x0, -400 back to the start
    writer.write(&Record::InstPcTarget { addr: 0x8000_0000 })?;
    writer.write(&Record::opcode32(0xe60008e3))?;
    writer.write(&Record::opcode32(0x13))?;
    writer.close()
}

#[test]
fn print_usage_on_wrong_argument_count() -> Result<(), Error> {
    for args in [&[][..], &["a.zstf", "b.zstf"][..]] {
        let output = reader_test().args(args).output()?;
        assert_eq!(output.status.code(), Some(1));
        assert_eq!(String::from_utf8(output.stdout)?, USAGE);
    }

    Ok(())
}

#[test]
fn profile_branch_reader_then_inst_reader() -> Result<(), Error> {
    let dir = tempdir()?;

    for name in ["trace.zstf", "trace.stf", "trace.stf.gz"] {
        let path = dir.path().join(name);
        write_trace(&path)?;

        let output = reader_test().arg(&path).output()?;
        assert!(output.status.success());

        let stdout = String::from_utf8(output.stdout)?;
        let lines: Vec<_> = stdout.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("BranchReader: ") && lines[0].ends_with(" s"));
        assert!(lines[1].starts_with("InstReader: ") && lines[1].ends_with(" s"));

        let seconds = lines[1]
            .trim_start_matches("InstReader: ")
            .trim_end_matches(" s")
            .parse::<f64>()?;
        assert!(seconds >= 0.0);
    }

    Ok(())
}

#[test]
fn fail_on_missing_trace() -> Result<(), Error> {
    let dir = tempdir()?;
    let output = reader_test()
        .arg(dir.path().join("missing.zstf"))
        .output()?;
    assert!(!output.status.success());
    assert!(output.stdout.is_empty());

    Ok(())
}

#[test]
fn print_build_info() -> Result<(), Error> {
    let output = reader_test().arg("--build-info").output()?;
    assert!(output.status.success());

    let stdout = String::from_utf8(output.stdout)?;
    assert!(stdout.starts_with("build dir: "));
    assert!(stdout.contains("stf_tools.egg-info"));

    Ok(())
}
