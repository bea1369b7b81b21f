//! File-backed tape drive simulator.
//!
//! A simulated drive is a directory. `drive-status.json` names the
//! currently loaded tape; each tape lives in `tape-<name>.tape` as a
//! flat sequence of length-prefixed records and filemark markers.
//! The changer simulator rewrites `drive-status.json` when it moves
//! media, so a load is visible to the next `open()`.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use ndmp_api_types::{MtioOp, NdmpError, NdmpResult};

use crate::{TapeDevice, TapePosition};

const FILEMARK_MARKER: u32 = 0xFFFF_FFFF;

#[derive(Serialize, Deserialize, Default)]
struct DriveStatus {
    current_tape: Option<String>,
}

#[derive(Clone)]
enum TapeItem {
    Filemark,
    Record(Vec<u8>),
}

/// One open simulated drive.
pub struct TapeSimulator {
    dir: PathBuf,
    tape_name: String,
    will_write: bool,
    max_size: u64,
    items: Vec<TapeItem>,
    pos: usize,
    soft_errors: u32,
    dirty: bool,
}

pub fn drive_status_path(dir: &Path) -> PathBuf {
    dir.join("drive-status.json")
}

fn tape_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("tape-{}.tape", name))
}

/// Read which tape is in the drive, if any.
pub fn loaded_tape(dir: &Path) -> std::io::Result<Option<String>> {
    let path = drive_status_path(dir);
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read(path)?;
    let status: DriveStatus = serde_json::from_slice(&raw)
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
    Ok(status.current_tape)
}

/// Put a tape into the drive (or empty it with `None`).
pub fn set_loaded_tape(dir: &Path, tape: Option<&str>) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let status = DriveStatus {
        current_tape: tape.map(String::from),
    };
    let raw = serde_json::to_vec_pretty(&status)
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
    std::fs::write(drive_status_path(dir), raw)
}

impl TapeSimulator {
    /// Open the drive rooted at `dir`. Fails with `NoTapeLoaded` when
    /// the changer has not put a tape in.
    pub fn open(dir: &Path, will_write: bool, max_size: u64) -> NdmpResult<Self> {
        let tape_name = match loaded_tape(dir) {
            Ok(Some(name)) => name,
            Ok(None) => return Err(NdmpError::NoTapeLoaded),
            Err(_) => return Err(NdmpError::NoDevice),
        };

        let items = match load_tape(&tape_path(dir, &tape_name)) {
            Ok(items) => items,
            Err(_) => return Err(NdmpError::Io),
        };

        Ok(TapeSimulator {
            dir: dir.to_path_buf(),
            tape_name,
            will_write,
            max_size,
            items,
            pos: 0,
            soft_errors: 0,
            dirty: false,
        })
    }

    fn file_num(&self) -> u32 {
        self.items[..self.pos]
            .iter()
            .filter(|item| matches!(item, TapeItem::Filemark))
            .count() as u32
    }

    fn blockno(&self) -> u32 {
        let mut n = 0;
        for item in self.items[..self.pos].iter().rev() {
            match item {
                TapeItem::Filemark => break,
                TapeItem::Record(_) => n += 1,
            }
        }
        n
    }

    fn bytes_used(&self) -> u64 {
        self.items
            .iter()
            .map(|item| match item {
                TapeItem::Filemark => 4,
                TapeItem::Record(data) => 4 + data.len() as u64,
            })
            .sum()
    }

    fn flush(&mut self) -> NdmpResult<()> {
        if !self.dirty {
            return Ok(());
        }
        store_tape(&tape_path(&self.dir, &self.tape_name), &self.items)
            .map_err(|_| NdmpError::Io)?;
        self.dirty = false;
        Ok(())
    }

    fn space_fsr(&mut self, count: u32) -> NdmpResult<u32> {
        let mut left = count;
        while left > 0 {
            match self.items.get(self.pos) {
                Some(TapeItem::Record(_)) => {
                    self.pos += 1;
                    left -= 1;
                }
                Some(TapeItem::Filemark) | None => return Err(NdmpError::Eof),
            }
        }
        Ok(0)
    }

    fn space_bsr(&mut self, count: u32) -> NdmpResult<u32> {
        let mut left = count;
        while left > 0 {
            if self.pos == 0 {
                return Err(NdmpError::Io);
            }
            match self.items[self.pos - 1] {
                TapeItem::Record(_) => {
                    self.pos -= 1;
                    left -= 1;
                }
                TapeItem::Filemark => return Err(NdmpError::Eof),
            }
        }
        Ok(0)
    }

    fn space_fsf(&mut self, count: u32) -> NdmpResult<u32> {
        let mut left = count;
        while left > 0 {
            match self.items.get(self.pos) {
                Some(TapeItem::Filemark) => {
                    self.pos += 1;
                    left -= 1;
                }
                Some(TapeItem::Record(_)) => self.pos += 1,
                None => return Err(NdmpError::Eof),
            }
        }
        Ok(0)
    }

    fn space_bsf(&mut self, count: u32) -> NdmpResult<u32> {
        let mut left = count;
        while left > 0 {
            if self.pos == 0 {
                return Err(NdmpError::Io);
            }
            self.pos -= 1;
            if matches!(self.items[self.pos], TapeItem::Filemark) {
                left -= 1;
            }
        }
        Ok(0)
    }
}

impl TapeDevice for TapeSimulator {
    fn mtio(&mut self, op: MtioOp, count: u32) -> NdmpResult<u32> {
        match op {
            MtioOp::Rew => {
                self.pos = 0;
                Ok(0)
            }
            MtioOp::Off => {
                self.flush()?;
                self.pos = 0;
                Ok(0)
            }
            MtioOp::Fsr => self.space_fsr(count),
            MtioOp::Bsr => self.space_bsr(count),
            MtioOp::Fsf => self.space_fsf(count),
            MtioOp::Bsf => self.space_bsf(count),
            MtioOp::Eof => {
                for _ in 0..count {
                    self.write_filemark()?;
                }
                Ok(0)
            }
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> NdmpResult<u32> {
        if buf.is_empty() {
            return Ok(0);
        }
        match self.items.get(self.pos) {
            None => Err(NdmpError::Eom),
            Some(TapeItem::Filemark) => {
                self.pos += 1;
                Err(NdmpError::Eof)
            }
            Some(TapeItem::Record(data)) => {
                if buf.len() < data.len() {
                    // undersized request against a larger block
                    return Err(NdmpError::Eof);
                }
                let n = data.len();
                buf[..n].copy_from_slice(data);
                self.pos += 1;
                Ok(n as u32)
            }
        }
    }

    fn write(&mut self, buf: &[u8]) -> NdmpResult<u32> {
        if !self.will_write {
            return Err(NdmpError::Permission);
        }
        if buf.is_empty() {
            return Ok(0);
        }
        if self.bytes_used() + buf.len() as u64 + 4 > self.max_size {
            return Err(NdmpError::Eom);
        }
        // writing implicitly truncates everything past the head
        self.items.truncate(self.pos);
        self.items.push(TapeItem::Record(buf.to_vec()));
        self.pos += 1;
        self.dirty = true;
        Ok(buf.len() as u32)
    }

    fn write_filemark(&mut self) -> NdmpResult<()> {
        if !self.will_write {
            return Err(NdmpError::Permission);
        }
        self.items.truncate(self.pos);
        self.items.push(TapeItem::Filemark);
        self.pos += 1;
        self.dirty = true;
        self.flush()
    }

    fn position(&mut self) -> TapePosition {
        TapePosition {
            file_num: self.file_num(),
            blockno: self.blockno(),
            block_size: 0, // variable block mode
            soft_errors: self.soft_errors,
            total_space: Some(self.max_size),
            space_remain: Some(self.max_size.saturating_sub(self.bytes_used())),
        }
    }

    fn close(&mut self) -> NdmpResult<()> {
        self.flush()
    }
}

fn load_tape(path: &Path) -> std::io::Result<Vec<TapeItem>> {
    let mut items = Vec::new();
    if !path.exists() {
        return Ok(items); // blank tape
    }
    let mut file = File::open(path)?;
    let mut raw = Vec::new();
    file.read_to_end(&mut raw)?;
    let mut off = 0;
    while off + 4 <= raw.len() {
        let marker = u32::from_le_bytes(raw[off..off + 4].try_into().unwrap());
        off += 4;
        if marker == FILEMARK_MARKER {
            items.push(TapeItem::Filemark);
        } else {
            let len = marker as usize;
            if off + len > raw.len() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "truncated tape record",
                ));
            }
            items.push(TapeItem::Record(raw[off..off + len].to_vec()));
            off += len;
        }
    }
    Ok(items)
}

fn store_tape(path: &Path, items: &[TapeItem]) -> std::io::Result<()> {
    let mut file = File::create(path)?;
    for item in items {
        match item {
            TapeItem::Filemark => file.write_all(&FILEMARK_MARKER.to_le_bytes())?,
            TapeItem::Record(data) => {
                file.write_all(&(data.len() as u32).to_le_bytes())?;
                file.write_all(data)?;
            }
        }
    }
    file.sync_data()
}

#[cfg(test)]
mod test {
    use super::*;

    fn create_testdir(name: &str) -> PathBuf {
        let mut testdir: PathBuf = String::from("./target/testout").into();
        testdir.push(std::module_path!());
        testdir.push(name);
        let _ = std::fs::remove_dir_all(&testdir);
        let _ = std::fs::create_dir_all(&testdir);
        testdir
    }

    #[test]
    fn test_read_write_position() {
        let dir = create_testdir("read_write_position");
        set_loaded_tape(&dir, Some("t1")).unwrap();

        let mut drive = TapeSimulator::open(&dir, true, 1024 * 1024).unwrap();

        drive.write(b"one").unwrap();
        drive.write(b"two").unwrap();
        drive.write_filemark().unwrap();
        drive.write(b"three").unwrap();

        assert_eq!(drive.position().file_num, 1);
        assert_eq!(drive.position().blockno, 1);

        drive.mtio(MtioOp::Rew, 1).unwrap();
        let mut buf = [0u8; 64];
        assert_eq!(drive.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"one");

        // zero length read is a no-op
        assert_eq!(drive.read(&mut []).unwrap(), 0);

        assert_eq!(drive.read(&mut buf).unwrap(), 3);
        assert_eq!(drive.read(&mut buf), Err(NdmpError::Eof));
        assert_eq!(drive.read(&mut buf).unwrap(), 5);
        assert_eq!(drive.read(&mut buf), Err(NdmpError::Eom));
    }

    #[test]
    fn test_spacing() {
        let dir = create_testdir("spacing");
        set_loaded_tape(&dir, Some("t1")).unwrap();

        let mut drive = TapeSimulator::open(&dir, true, 1024 * 1024).unwrap();
        for rec in 0..4u8 {
            drive.write(&[rec; 16]).unwrap();
        }
        drive.write_filemark().unwrap();
        drive.write(&[9; 16]).unwrap();

        drive.mtio(MtioOp::Rew, 1).unwrap();
        drive.mtio(MtioOp::Fsr, 2).unwrap();
        assert_eq!(drive.position().blockno, 2);

        // FSR across the filemark stops with EOF
        assert_eq!(drive.mtio(MtioOp::Fsr, 5), Err(NdmpError::Eof));

        drive.mtio(MtioOp::Rew, 1).unwrap();
        drive.mtio(MtioOp::Fsf, 1).unwrap();
        assert_eq!(drive.position().file_num, 1);
        assert_eq!(drive.position().blockno, 0);
    }

    #[test]
    fn test_eom_and_persistence() {
        let dir = create_testdir("eom_and_persistence");
        set_loaded_tape(&dir, Some("t1")).unwrap();

        {
            let mut drive = TapeSimulator::open(&dir, true, 128).unwrap();
            assert_eq!(drive.write(&[1; 64]).unwrap(), 64);
            assert_eq!(drive.write(&[2; 64]), Err(NdmpError::Eom));
            drive.close().unwrap();
        }

        let mut drive = TapeSimulator::open(&dir, false, 128).unwrap();
        let mut buf = [0u8; 64];
        assert_eq!(drive.read(&mut buf).unwrap(), 64);
        assert_eq!(buf[0], 1);

        // read-only open refuses writes
        assert_eq!(drive.write(&[3; 8]), Err(NdmpError::Permission));
    }
}
