//! Exit-time serialization of the trace store into per-module `.sancov`
//! files.
//!
//! Each module with at least one record gets its own
//! `cmp.<module>.<pid>.sancov` file in the configured output directory: the
//! 8-byte magic first, then the records, 8 bytes each in little-endian
//! (4-byte hashed records on 32-bit targets, under the matching 32-bit
//! magic).

use std::{
    fs::File,
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
};

use hashbrown::HashSet;

use crate::die;
use crate::options::Options;
use crate::traces::Traces;

#[cfg(target_pointer_width = "64")]
const MAGIC: u64 = crate::MAGIC64;
#[cfg(target_pointer_width = "32")]
const MAGIC: u64 = crate::MAGIC32;

/// Writes one module's records in the sub-instruction `.sancov` layout.
#[derive(Debug)]
pub struct SancovWriter {
    writer: BufWriter<File>,
    path: PathBuf,
    records: usize,
}

impl SancovWriter {
    /// Creates (truncating) the output file and writes the magic header.
    pub fn new(path: &Path) -> io::Result<Self> {
        let mut writer = BufWriter::new(File::create(path)?);
        writer.write_all(&MAGIC.to_le_bytes())?;
        Ok(Self {
            writer,
            path: path.to_path_buf(),
            records: 0,
        })
    }

    /// Appends one encoded record in the target's on-disk width.
    pub fn write_record(&mut self, word: u64) -> io::Result<()> {
        #[cfg(target_pointer_width = "64")]
        self.writer.write_all(&word.to_le_bytes())?;
        #[cfg(target_pointer_width = "32")]
        self.writer
            .write_all(&crate::traces::hash32(word).to_le_bytes())?;

        self.records += 1;
        Ok(())
    }

    /// Flushes the file and emits the one-line summary for it.
    pub fn finish(mut self) -> io::Result<()> {
        self.writer.flush()?;
        eprintln!(
            "CmpSanitizerCoverage: {}: {} PCs written",
            self.path.display(),
            self.records
        );
        Ok(())
    }
}

/// Output path for module `index` named `name`.
///
/// When two distinct modules share a short name, the later ones carry their
/// module index in the filename so neither overwrites the other. `claimed`
/// tracks the names already used during this dump.
fn module_path(
    options: &Options,
    claimed: &mut HashSet<String>,
    index: u16,
    name: &str,
) -> PathBuf {
    let pid = std::process::id();
    let file = if claimed.insert(name.to_string()) {
        format!("cmp.{name}.{pid}.sancov")
    } else {
        format!("cmp.{name}.{pid}.{index}.sancov")
    };
    options.coverage_dir.join(file)
}

/// Serializes every module's records. Invoked once, from the exit hook, with
/// the global lock held. I/O failures are fatal: a partial coverage file
/// would mislead the consumers.
pub fn dump_all(options: &Options, traces: &Traces) {
    let mut claimed = HashSet::new();

    for index in 0..traces.modules_count() as u16 {
        let mut records = traces.module_records(index).peekable();
        if records.peek().is_none() {
            continue;
        }

        let Some(name) = traces.module_name(index) else {
            continue;
        };
        let path = module_path(options, &mut claimed, index, name);

        let Ok(mut writer) = SancovWriter::new(&path) else {
            die(&format!(
                "Unable to open the \"{}\" file for writing.",
                path.display()
            ));
        };
        let written = records
            .try_for_each(|word| writer.write_record(word))
            .and_then(|()| writer.finish());
        if let Err(err) = written {
            die(&format!(
                "Unable to write the \"{}\" file: {err}.",
                path.display()
            ));
        }
    }
}
