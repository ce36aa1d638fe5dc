//! Ground command handling.
//!
//! Ground writes a request into its uplink region: a command byte plus a
//! request sequence number, and for `Write` commands the raw id of a target
//! element and a 64-bit value pattern. The handler runs once per loop tick:
//! when the request sequence differs from the processed sequence it publishes
//! the command and catches the processed sequence up. A replayed request
//! (same sequence) is a no-op, so ground can retransmit freely over the
//! lossy link.

use std::sync::Arc;

use crate::dv::{DataVector, DvElem, ElemType};
use crate::errors::Error;

/// Ground commands.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    None = 0,
    /// Write an arbitrary element; target and value ride in the request.
    Write = 1,
    Launch = 2,
    Abort = 3,
}

impl Command {
    pub fn from_raw(raw: u8) -> Option<Command> {
        match raw {
            0 => Some(Command::None),
            1 => Some(Command::Write),
            2 => Some(Command::Launch),
            3 => Some(Command::Abort),
            _ => None,
        }
    }
}

/// The six Data Vector slots the handler works.
#[derive(Debug, Clone, Copy)]
pub struct CmdConfig {
    /// Requested command (ground-owned, `u8`).
    pub cmd_req_elem: DvElem,
    /// Request sequence number (ground-owned, `u32`).
    pub cmd_req_seq_elem: DvElem,
    /// Raw id of the element a `Write` command targets (ground-owned, `u32`).
    pub cmd_write_elem: DvElem,
    /// Value pattern for a `Write` command (ground-owned, `u64`).
    pub cmd_write_val_elem: DvElem,
    /// Published command (`u8`).
    pub cmd_elem: DvElem,
    /// Sequence number of the last processed request (`u32`).
    pub cmd_processed_seq_elem: DvElem,
}

pub struct CommandHandler {
    dv: Arc<DataVector>,
    config: CmdConfig,
}

impl CommandHandler {
    /// Validate the six slots exist with the expected types.
    pub fn new(config: CmdConfig, dv: Arc<DataVector>) -> Result<CommandHandler, Error> {
        let slots = [
            (config.cmd_req_elem, ElemType::U8),
            (config.cmd_req_seq_elem, ElemType::U32),
            (config.cmd_write_elem, ElemType::U32),
            (config.cmd_write_val_elem, ElemType::U64),
            (config.cmd_elem, ElemType::U8),
            (config.cmd_processed_seq_elem, ElemType::U32),
        ];
        for (elem, expected) in slots {
            dv.element_exists(elem)?;
            if dv.elem_type(elem)? != expected {
                return Err(Error::TypeMismatch);
            }
        }
        Ok(CommandHandler { dv, config })
    }

    /// Process at most one pending request.
    pub fn run(&self) -> Result<(), Error> {
        let req_seq: u32 = self.dv.read(self.config.cmd_req_seq_elem)?;
        let processed_seq: u32 = self.dv.read(self.config.cmd_processed_seq_elem)?;
        if req_seq == processed_seq {
            return Ok(());
        }

        let raw_req: u8 = self.dv.read(self.config.cmd_req_elem)?;
        let command = Command::from_raw(raw_req).ok_or(Error::InvalidEnum)?;
        self.dv.write(self.config.cmd_elem, raw_req)?;

        if command == Command::Write {
            let raw_target: u32 = self.dv.read(self.config.cmd_write_elem)?;
            let target = DvElem::from_raw(raw_target).ok_or(Error::InvalidElem)?;
            let bits: u64 = self.dv.read(self.config.cmd_write_val_elem)?;
            self.dv.write_bits(target, bits)?;
        }

        self.dv.write(self.config.cmd_processed_seq_elem, req_seq)
    }
}
