//! ROBOT agent: SCSI pass-through surface.
//!
//! All semantic operations go straight to the embedder's robot
//! backend (a real pass-through device or the changer simulator);
//! the agent only tracks open state and answers `SCSI_GET_STATE`.

use ndmp_api_types::*;

/// Backend vtable for the SCSI pass-through device.
pub trait RobotOps: Send {
    fn open(&mut self, name: &str) -> NdmpResult<()>;
    fn close(&mut self) -> NdmpResult<()>;
    fn reset(&mut self) -> NdmpResult<()>;
    fn execute_cdb(&mut self, request: &ExecuteCdbRequest) -> NdmpResult<ExecuteCdbReply>;
}

pub struct RobotAgent {
    pub protocol_version: u16,
    pub scsi_state: ScsiGetStateReply,
    pub is_open: bool,
}

impl RobotAgent {
    pub fn new() -> Self {
        RobotAgent {
            protocol_version: NDMP4VER,
            scsi_state: ScsiGetStateReply {
                error: NdmpError::DevNotOpen,
                ..Default::default()
            },
            is_open: false,
        }
    }

    pub fn scsi_open(&mut self, ops: &mut dyn RobotOps, name: &str) -> NdmpResult<()> {
        if self.is_open {
            return Err(NdmpError::DeviceOpened);
        }
        ops.open(name)?;
        self.is_open = true;
        self.sync_state();
        Ok(())
    }

    /// Closing a closed device is a successful no-op.
    pub fn scsi_close(&mut self, ops: &mut dyn RobotOps) -> NdmpResult<()> {
        if !self.is_open {
            return Ok(());
        }
        ops.close()?;
        self.is_open = false;
        self.sync_state();
        Ok(())
    }

    pub fn scsi_reset(&mut self, ops: &mut dyn RobotOps) -> NdmpResult<()> {
        if !self.is_open {
            return Err(NdmpError::DevNotOpen);
        }
        ops.reset()
    }

    pub fn scsi_execute_cdb(
        &mut self,
        ops: &mut dyn RobotOps,
        request: &ExecuteCdbRequest,
    ) -> NdmpResult<ExecuteCdbReply> {
        if !self.is_open {
            return Err(NdmpError::DevNotOpen);
        }
        ops.execute_cdb(request)
    }

    pub fn sync_state(&mut self) {
        if self.is_open {
            self.scsi_state.error = NdmpError::NoErr;
            self.scsi_state.target_controller = Some(0);
            self.scsi_state.target_id = Some(0);
            self.scsi_state.target_lun = Some(0);
        } else {
            self.scsi_state = ScsiGetStateReply {
                error: NdmpError::DevNotOpen,
                ..Default::default()
            };
        }
    }
}

impl Default for RobotAgent {
    fn default() -> Self {
        RobotAgent::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct NullRobot;

    impl RobotOps for NullRobot {
        fn open(&mut self, _name: &str) -> NdmpResult<()> {
            Ok(())
        }
        fn close(&mut self) -> NdmpResult<()> {
            Ok(())
        }
        fn reset(&mut self) -> NdmpResult<()> {
            Ok(())
        }
        fn execute_cdb(&mut self, _request: &ExecuteCdbRequest) -> NdmpResult<ExecuteCdbReply> {
            Ok(ExecuteCdbReply::default())
        }
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut ra = RobotAgent::new();
        let mut ops = NullRobot;
        assert!(ra.scsi_close(&mut ops).is_ok());
        ra.scsi_open(&mut ops, "sim:changer").unwrap();
        assert!(ra.scsi_close(&mut ops).is_ok());
        assert!(ra.scsi_close(&mut ops).is_ok());
        assert_eq!(ra.scsi_state.error, NdmpError::DevNotOpen);
    }

    #[test]
    fn test_cdb_requires_open() {
        let mut ra = RobotAgent::new();
        let mut ops = NullRobot;
        let request = ExecuteCdbRequest::default();
        assert_eq!(
            ra.scsi_execute_cdb(&mut ops, &request),
            Err(NdmpError::DevNotOpen)
        );
    }
}
