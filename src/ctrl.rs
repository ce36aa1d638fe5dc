//! Controller protocol.
//!
//! A controller is the unit of high-level behavior on the rocket (ignition
//! sequencing, guidance, status lamps). Each one is driven entirely through
//! the Data Vector: a mode element selects between its SAFED and ENABLED
//! branch every tick, and everything it senses or commands is a DV element.
//!
//! Implementing one:
//!
//! 1. Define the controller struct and its config type.
//! 2. Implement [`FromConfig`] (construction) and the [`Controller`]
//!    branches.
//! 3. Build it through [`create`], never directly. The factory checks the
//!    mode element and runs `verify_config` before the controller can be
//!    handed to the loop.
//!
//! Neither branch may block or loop; each call is a single step of a
//! synchronous control law.

use std::sync::Arc;

use crate::dv::{DataVector, DvElem, ElemType};
use crate::errors::Error;

/// Controller mode, read from the mode element each tick.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Safed = 0,
    Enabled = 1,
}

impl Mode {
    pub fn from_raw(raw: u8) -> Option<Mode> {
        match raw {
            0 => Some(Mode::Safed),
            1 => Some(Mode::Enabled),
            _ => None,
        }
    }
}

/// The polymorphic controller surface the loop iterates.
pub trait Controller: Send {
    /// Check the config the controller was built with. Called once by the
    /// factory; a failing controller is dropped before it ever runs.
    fn verify_config(&self) -> Result<(), Error>;

    /// One step of the active control law.
    fn run_enabled(&mut self) -> Result<(), Error>;

    /// One step of the safe posture (outputs parked, nothing armed).
    fn run_safed(&mut self) -> Result<(), Error>;

    /// The element selecting the branch.
    fn mode_elem(&self) -> DvElem;

    /// The Data Vector the controller works against.
    fn data_vector(&self) -> &Arc<DataVector>;

    /// Dispatch one tick according to the mode element.
    fn run(&mut self) -> Result<(), Error> {
        let raw: u8 = self.data_vector().read(self.mode_elem())?;
        match Mode::from_raw(raw) {
            Some(Mode::Safed) => self.run_safed(),
            Some(Mode::Enabled) => self.run_enabled(),
            None => Err(Error::InvalidEnum),
        }
    }
}

/// Construction hook used by [`create`].
pub trait FromConfig: Controller + Sized {
    type Config;

    fn from_config(config: Self::Config, dv: Arc<DataVector>, mode_elem: DvElem) -> Self;
}

/// Build a controller, checking the mode element and the config up front.
pub fn create<C: FromConfig>(
    config: C::Config,
    dv: &Arc<DataVector>,
    mode_elem: DvElem,
) -> Result<Box<C>, Error> {
    dv.element_exists(mode_elem)?;
    if dv.elem_type(mode_elem)? != ElemType::U8 {
        return Err(Error::TypeMismatch);
    }

    let controller = C::from_config(config, Arc::clone(dv), mode_elem);
    controller.verify_config()?;
    Ok(Box::new(controller))
}
