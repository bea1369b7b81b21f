//! Media changer simulator.
//!
//! Answers the SMC CDB subset built by [`crate::smc`] against a JSON
//! persisted slot/drive inventory, so a full robot-driven job can run
//! without hardware. Moving media into a drive element rewrites that
//! drive directory's `drive-status.json`, which is how the tape
//! simulator notices the load.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use ndmp_api_types::{CdbDataDir, ExecuteCdbReply, ExecuteCdbRequest, NdmpError};

use crate::smc::{
    self, ElementAddressAssignment, ElementDescriptor, ElementType, InquiryInfo,
};
use crate::{loaded_tape, set_loaded_tape};

pub const SIM_TRANSPORT_ADDR: u16 = 0;
pub const SIM_SLOT_BASE: u16 = 1024;
pub const SIM_IE_BASE: u16 = 768;
pub const SIM_DRIVE_BASE: u16 = 80;

const SCSI_STATUS_CHECK_CONDITION: u8 = 2;

#[derive(Serialize, Deserialize, Clone, Default)]
struct DriveState {
    tape: Option<String>,
    src_slot: Option<u16>,
}

#[derive(Serialize, Deserialize, Clone, Default)]
struct ChangerState {
    slots: Vec<Option<String>>,
    import_export: Vec<Option<String>>,
    drives: Vec<DriveState>,
}

/// One simulated robot plus the drive directories it feeds.
pub struct ChangerSimulator {
    dir: PathBuf,
    state: ChangerState,
}

impl ChangerSimulator {
    /// Open (or create) a simulated changer rooted at `dir` with the
    /// given geometry. Drive `i` serves the directory `drive-<i>`
    /// under `dir`.
    pub fn open(dir: &Path, n_slots: usize, n_drives: usize) -> Result<Self, anyhow::Error> {
        std::fs::create_dir_all(dir)?;
        let state_path = dir.join("changer-state.json");
        let state = if state_path.exists() {
            serde_json::from_slice(&std::fs::read(&state_path)?)?
        } else {
            ChangerState {
                slots: vec![None; n_slots],
                import_export: vec![None; 1],
                drives: vec![DriveState::default(); n_drives],
            }
        };
        let mut changer = ChangerSimulator {
            dir: dir.to_path_buf(),
            state,
        };
        changer.sync_drive_dirs()?;
        changer.store()?;
        Ok(changer)
    }

    pub fn drive_dir(&self, drivenum: usize) -> PathBuf {
        self.dir.join(format!("drive-{}", drivenum))
    }

    /// Fill a storage slot with a (possibly blank) tape.
    pub fn load_slot(&mut self, slot: usize, tape_name: &str) -> Result<(), anyhow::Error> {
        if slot >= self.state.slots.len() {
            anyhow::bail!("slot {} out of range", slot);
        }
        self.state.slots[slot] = Some(tape_name.to_string());
        self.store()
    }

    fn store(&self) -> Result<(), anyhow::Error> {
        let raw = serde_json::to_vec_pretty(&self.state)?;
        std::fs::write(self.dir.join("changer-state.json"), raw)?;
        Ok(())
    }

    fn sync_drive_dirs(&mut self) -> Result<(), anyhow::Error> {
        for (i, drive) in self.state.drives.iter_mut().enumerate() {
            let dir = self.dir.join(format!("drive-{}", i));
            std::fs::create_dir_all(&dir)?;
            match loaded_tape(&dir)? {
                Some(name) => drive.tape = Some(name),
                None => set_loaded_tape(&dir, drive.tape.as_deref())?,
            }
        }
        Ok(())
    }

    fn address_assignment(&self) -> ElementAddressAssignment {
        ElementAddressAssignment {
            mte_addr: SIM_TRANSPORT_ADDR,
            mte_count: 1,
            se_addr: SIM_SLOT_BASE,
            se_count: self.state.slots.len() as u16,
            iee_addr: SIM_IE_BASE,
            iee_count: self.state.import_export.len() as u16,
            dte_addr: SIM_DRIVE_BASE,
            dte_count: self.state.drives.len() as u16,
        }
    }

    fn element_descriptors(&self) -> Vec<ElementDescriptor> {
        let mut list = Vec::new();
        list.push(ElementDescriptor {
            element_address: SIM_TRANSPORT_ADDR,
            element_type: ElementType::MediumTransport,
            full: false,
            except: false,
            svalid: false,
            src_se_addr: 0,
        });
        for (i, slot) in self.state.slots.iter().enumerate() {
            list.push(ElementDescriptor {
                element_address: SIM_SLOT_BASE + i as u16,
                element_type: ElementType::Storage,
                full: slot.is_some(),
                except: false,
                svalid: false,
                src_se_addr: 0,
            });
        }
        for (i, slot) in self.state.import_export.iter().enumerate() {
            list.push(ElementDescriptor {
                element_address: SIM_IE_BASE + i as u16,
                element_type: ElementType::ImportExport,
                full: slot.is_some(),
                except: false,
                svalid: false,
                src_se_addr: 0,
            });
        }
        for (i, drive) in self.state.drives.iter().enumerate() {
            list.push(ElementDescriptor {
                element_address: SIM_DRIVE_BASE + i as u16,
                element_type: ElementType::DataTransfer,
                full: drive.tape.is_some(),
                except: false,
                svalid: drive.src_slot.is_some(),
                src_se_addr: drive.src_slot.unwrap_or(0),
            });
        }
        list
    }

    fn take_from(&mut self, addr: u16) -> Result<(String, Option<u16>), NdmpError> {
        if let Some(i) = self.slot_index(addr) {
            let tape = self.state.slots[i].take().ok_or(NdmpError::NoTapeLoaded)?;
            return Ok((tape, Some(addr)));
        }
        if let Some(i) = self.ie_index(addr) {
            let tape = self.state.import_export[i]
                .take()
                .ok_or(NdmpError::NoTapeLoaded)?;
            return Ok((tape, None));
        }
        if let Some(i) = self.drive_index(addr) {
            let drive = &mut self.state.drives[i];
            let tape = drive.tape.take().ok_or(NdmpError::NoTapeLoaded)?;
            let src = drive.src_slot.take();
            set_loaded_tape(&self.drive_dir(i), None).map_err(|_| NdmpError::Io)?;
            return Ok((tape, src));
        }
        Err(NdmpError::IllegalArgs)
    }

    fn put_to(&mut self, addr: u16, tape: String, src: Option<u16>) -> Result<(), NdmpError> {
        if let Some(i) = self.slot_index(addr) {
            if self.state.slots[i].is_some() {
                return Err(NdmpError::IllegalState);
            }
            self.state.slots[i] = Some(tape);
            return Ok(());
        }
        if let Some(i) = self.ie_index(addr) {
            if self.state.import_export[i].is_some() {
                return Err(NdmpError::IllegalState);
            }
            self.state.import_export[i] = Some(tape);
            return Ok(());
        }
        if let Some(i) = self.drive_index(addr) {
            if self.state.drives[i].tape.is_some() {
                return Err(NdmpError::IllegalState);
            }
            set_loaded_tape(&self.drive_dir(i), Some(&tape)).map_err(|_| NdmpError::Io)?;
            self.state.drives[i].tape = Some(tape);
            self.state.drives[i].src_slot = src;
            return Ok(());
        }
        Err(NdmpError::IllegalArgs)
    }

    fn slot_index(&self, addr: u16) -> Option<usize> {
        let i = addr.checked_sub(SIM_SLOT_BASE)? as usize;
        (i < self.state.slots.len()).then_some(i)
    }

    fn ie_index(&self, addr: u16) -> Option<usize> {
        let i = addr.checked_sub(SIM_IE_BASE)? as usize;
        (i < self.state.import_export.len()).then_some(i)
    }

    fn drive_index(&self, addr: u16) -> Option<usize> {
        let i = addr.checked_sub(SIM_DRIVE_BASE)? as usize;
        (i < self.state.drives.len()).then_some(i)
    }

    fn move_medium(&mut self, src: u16, dst: u16) -> Result<(), NdmpError> {
        let (tape, came_from) = self.take_from(src)?;
        match self.put_to(dst, tape.clone(), came_from) {
            Ok(()) => {
                self.store().map_err(|_| NdmpError::Io)?;
                Ok(())
            }
            Err(err) => {
                // put it back where it was
                let _ = self.put_to(src, tape, came_from);
                Err(err)
            }
        }
    }

    /// Answer one pass-through CDB, the robot simulator callback.
    pub fn execute_cdb(&mut self, request: &ExecuteCdbRequest) -> ExecuteCdbReply {
        let mut reply = ExecuteCdbReply::default();

        let opcode = match request.cdb.first() {
            Some(&op) => op,
            None => {
                reply.error = NdmpError::IllegalArgs;
                return reply;
            }
        };

        match opcode {
            smc::SCSI_CMD_INQUIRY => {
                let info = InquiryInfo {
                    peripheral_type: 8, // medium changer
                    vendor: "NDMPSIM".into(),
                    product: "MEDIA CHANGER".into(),
                    revision: "0100".into(),
                };
                reply.datain = smc::encode_inquiry(&info);
            }

            smc::SCSI_CMD_MODE_SENSE6 => {
                if request.cdb.get(2).copied().unwrap_or(0) & 0x3F
                    != smc::ELEMENT_ADDRESS_ASSIGNMENT_PAGE
                {
                    reply.status = SCSI_STATUS_CHECK_CONDITION;
                    return reply;
                }
                reply.datain = smc::encode_element_address_assignment(&self.address_assignment());
            }

            smc::SCSI_CMD_READ_ELEMENT_STATUS => {
                reply.datain = smc::encode_element_status(&self.element_descriptors());
            }

            smc::SCSI_CMD_INIT_ELEMENT_STATUS => {
                // inventory is always current in the simulator
            }

            smc::SCSI_CMD_MOVE_MEDIUM => {
                let cdb = &request.cdb;
                if cdb.len() < 12 {
                    reply.error = NdmpError::IllegalArgs;
                    return reply;
                }
                let src = u16::from_be_bytes([cdb[4], cdb[5]]);
                let dst = u16::from_be_bytes([cdb[6], cdb[7]]);
                if let Err(err) = self.move_medium(src, dst) {
                    log::warn!("changer-sim: move @{} to @{} failed: {}", src, dst, err);
                    reply.status = SCSI_STATUS_CHECK_CONDITION;
                    reply.ext_sense = vec![0x70, 0, 0x05, 0, 0, 0, 0, 0]; // illegal request
                }
            }

            _ => {
                log::warn!("changer-sim: unsupported CDB opcode {:#04x}", opcode);
                reply.status = SCSI_STATUS_CHECK_CONDITION;
                reply.ext_sense = vec![0x70, 0, 0x05, 0, 0, 0, 0, 0];
            }
        }

        if request.data_dir == CdbDataDir::In {
            reply.datain.truncate(request.datain_len as usize);
        }
        reply.dataout_len = request.dataout.len() as u32;
        reply
    }
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
    fn test_move_medium_updates_drive_status() {
        let dir = create_testdir("move_medium");
        let mut changer = ChangerSimulator::open(&dir, 4, 1).unwrap();
        changer.load_slot(0, "TAPE01").unwrap();

        let request = ExecuteCdbRequest {
            data_dir: CdbDataDir::None,
            timeout: 0,
            datain_len: 0,
            cdb: smc::move_medium_cdb(SIM_TRANSPORT_ADDR, SIM_SLOT_BASE, SIM_DRIVE_BASE),
            dataout: Vec::new(),
        };
        let reply = changer.execute_cdb(&request);
        assert_eq!(reply.status, 0);

        assert_eq!(
            loaded_tape(&changer.drive_dir(0)).unwrap().as_deref(),
            Some("TAPE01")
        );

        // moving from the now empty slot fails with check condition
        let reply = changer.execute_cdb(&request);
        assert_eq!(reply.status, SCSI_STATUS_CHECK_CONDITION);

        // move it back to its source
        let back = ExecuteCdbRequest {
            cdb: smc::move_medium_cdb(SIM_TRANSPORT_ADDR, SIM_DRIVE_BASE, SIM_SLOT_BASE),
            ..Default::default()
        };
        let reply = changer.execute_cdb(&back);
        assert_eq!(reply.status, 0);
        assert_eq!(loaded_tape(&changer.drive_dir(0)).unwrap(), None);
    }

    #[test]
    fn test_element_status_reflects_inventory() {
        let dir = create_testdir("element_status");
        let mut changer = ChangerSimulator::open(&dir, 2, 1).unwrap();
        changer.load_slot(1, "TAPE02").unwrap();

        let request = ExecuteCdbRequest {
            data_dir: CdbDataDir::In,
            datain_len: 4096,
            cdb: smc::read_element_status_cdb(0, 100, 4096),
            ..Default::default()
        };
        let reply = changer.execute_cdb(&request);
        let list = smc::decode_element_status(&reply.datain).unwrap();

        let slots: Vec<_> = list
            .iter()
            .filter(|d| d.element_type == ElementType::Storage)
            .collect();
        assert_eq!(slots.len(), 2);
        assert!(!slots[0].full);
        assert!(slots[1].full);
    }
}
