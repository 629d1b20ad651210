use std::{
    fmt,
    path::Path,
    time::{Duration, Instant},
};

use anyhow::Error;
use log::debug;
use stf_trace::{BranchReader, InstReader};

/// Wall-clock time spent iterating a reader
#[derive(Debug, Clone, PartialEq)]
pub struct Timing {
    pub reader: &'static str,
    pub elapsed: Duration,
    pub items: u64,
}

impl fmt::Display for Timing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} s", self.reader, self.elapsed.as_secs_f64())
    }
}

/// Iterates `reader` to exhaustion. Only the iteration is timed. The reader
/// is dropped, and its trace closed, before returning.
pub fn time_reader<I, T>(name: &'static str, reader: I) -> Result<Timing, Error>
where
    I: IntoIterator<Item = Result<T, Error>>,
{
    let start = Instant::now();
    let mut items = 0;
    for item in reader {
        item?;
        items += 1;
    }
    let elapsed = start.elapsed();

    debug!("{name} read {items} items");

    Ok(Timing {
        reader: name,
        elapsed,
        items,
    })
}

/// Runs the branch reader and then the instruction reader over `trace`,
/// calling `report` after each pass
pub fn profile<P: AsRef<Path>, F: FnMut(&Timing)>(
    trace: P,
    mut report: F,
) -> Result<Vec<Timing>, Error> {
    let trace = trace.as_ref();

    let branches = time_reader("BranchReader", BranchReader::open(trace)?)?;
    report(&branches);

    let insts = time_reader("InstReader", InstReader::open(trace)?)?;
    report(&insts);

    Ok(vec![branches, insts])
}
