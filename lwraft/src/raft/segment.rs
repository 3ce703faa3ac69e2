use serde_derive::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::raft::record::{self, LEN_BYTES};

const HEADER_SIZE: u64 = 16; // 8 bytes for start_index + 8 bytes for end_index
const ENTRY_HEADER_SIZE: u64 = LEN_BYTES as u64;

/// One append-only log segment file.
///
/// Layout: a fixed header followed by length-prefixed records. Record `n`
/// holds log index `start_index + n`. The header's end index is advisory; the
/// record scan on open is authoritative and drops a torn trailing record.
#[derive(Debug)]
pub struct Segment {
    file: File,
    start_index: u64,
    path: PathBuf,
    positions: Vec<u64>, // file position of each record
}

#[derive(Debug, Serialize, Deserialize)]
struct SegmentHeader {
    start_index: u64,
    end_index: u64,
}

impl Segment {
    /// Opens the segment at `path`, creating it for `start_index` if missing.
    pub fn open<P: AsRef<Path>>(path: P, start_index: u64) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let mut segment = Segment {
            file,
            start_index,
            path: path.as_ref().to_path_buf(),
            positions: Vec::new(),
        };

        if segment.file.metadata()?.len() < HEADER_SIZE {
            segment.file.set_len(0)?;
            segment.write_header()?;
            segment.file.sync_all()?;
        } else {
            segment.read_header()?;
            segment.rebuild_positions()?;
        }

        Ok(segment)
    }

    fn write_header(&mut self) -> io::Result<()> {
        let header = SegmentHeader {
            start_index: self.start_index,
            end_index: self.end_index(),
        };

        let header_bytes =
            bincode::serialize(&header).map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&header_bytes)?;
        Ok(())
    }

    fn read_header(&mut self) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut header_bytes = vec![0u8; HEADER_SIZE as usize];
        self.file.read_exact(&mut header_bytes)?;

        let header: SegmentHeader = bincode::deserialize(&header_bytes)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        if header.start_index != self.start_index {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "segment {} starts at {}, expected {}",
                    self.path.display(),
                    header.start_index,
                    self.start_index
                ),
            ));
        }
        Ok(())
    }

    fn read_entry_header(&mut self) -> io::Result<u64> {
        let mut prefix = [0u8; LEN_BYTES];
        self.file.read_exact(&mut prefix)?;
        Ok(record::body_len(prefix))
    }

    fn rebuild_positions(&mut self) -> io::Result<()> {
        self.positions.clear();
        let file_len = self.file.metadata()?.len();
        let mut pos = HEADER_SIZE;

        while pos + ENTRY_HEADER_SIZE <= file_len {
            self.file.seek(SeekFrom::Start(pos))?;
            let entry_size = self.read_entry_header()?;
            let next = pos + ENTRY_HEADER_SIZE + entry_size;
            if next > file_len {
                break;
            }
            self.positions.push(pos);
            pos = next;
        }

        // A crash in the middle of an append leaves a partial record behind.
        if pos != file_len {
            self.file.set_len(pos)?;
            self.write_header()?;
            self.file.sync_all()?;
        }

        Ok(())
    }

    /// Appends records and fsyncs before returning.
    pub fn append(&mut self, records: &[Vec<u8>]) -> io::Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let pos = self.file.seek(SeekFrom::End(0))?;

        let mut buf = Vec::new();
        let mut new_positions = Vec::with_capacity(records.len());
        for body in records {
            new_positions.push(pos + buf.len() as u64);
            record::put(&mut buf, body);
        }
        self.file.write_all(&buf)?;

        self.positions.extend(new_positions);
        self.write_header()?;
        self.file.sync_data()?;
        Ok(())
    }

    pub fn read_entry(&mut self, index: u64) -> io::Result<Vec<u8>> {
        if index < self.start_index || index > self.end_index() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Index out of range",
            ));
        }

        let pos = self.positions[(index - self.start_index) as usize];
        self.file.seek(SeekFrom::Start(pos))?;
        let entry_size = self.read_entry_header()?;

        let mut entry = vec![0u8; entry_size as usize];
        self.file.read_exact(&mut entry)?;
        Ok(entry)
    }

    /// Reads every record in index order.
    pub fn read_all(&mut self) -> io::Result<Vec<Vec<u8>>> {
        (self.start_index..=self.end_index())
            .map(|index| self.read_entry(index))
            .collect()
    }

    /// Removes the records with index >= `index`.
    pub fn truncate_from(&mut self, index: u64) -> io::Result<()> {
        if index > self.end_index() {
            return Ok(());
        }
        let keep = index.saturating_sub(self.start_index) as usize;
        let cut = self.positions.get(keep).copied().unwrap_or(HEADER_SIZE);
        self.file.set_len(cut)?;
        self.positions.truncate(keep);
        self.write_header()?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Deletes the segment file.
    pub fn remove(self) -> io::Result<()> {
        let path = self.path.clone();
        drop(self.file);
        fs::remove_file(path)
    }

    pub fn start_index(&self) -> u64 {
        self.start_index
    }

    /// Index of the last record, `start_index - 1` when empty.
    pub fn end_index(&self) -> u64 {
        (self.start_index + self.positions.len() as u64).saturating_sub(1)
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}
