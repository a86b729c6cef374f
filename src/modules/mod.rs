//! Typed drivers for the modules on the slave board.
//!
//! Each driver owns an `Arc<Transport<L>>` and knows its module's request code,
//! sub-command layout and status format. Drivers never resend and never sleep, with
//! one exception: `wait`-style calls, which hand off to [`CommandPoller`].
//!
//! Action commands return [`Issued`], which carries both the ACK outcome and the
//! busy state the action puts the module into. Passing that state to the driver's
//! `wait` is what tells the poller which state change to look for.

mod command;
pub mod dispenser;
pub mod gpio;
pub mod heater;
pub mod kicker;
pub mod kneader;
pub mod poller;
pub mod switch_context;
pub mod vertical_tray;
pub mod wedge_press;
pub mod who_am_i;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::config::TimingConfig;
use crate::transport::{SlaveLink, Transport};

pub use dispenser::{Dispenser, DispenserStatus};
pub use gpio::Gpio;
pub use heater::{CharringStatus, Heater, HeaterStatus};
pub use kicker::{Kicker, KickerStatus};
pub use kneader::{Kneader, KneaderStatus};
pub use poller::{CommandPoller, Completion, PolledStatus, StatusSource};
pub use switch_context::{Context, SwitchContext};
pub use vertical_tray::{VerticalTray, VerticalTrayStatus};
pub use wedge_press::{WedgePress, WedgePressStatus};
pub use who_am_i::{FirmwareVersion, WhoAmI};

pub use crate::transport::DEFAULT_COMMAND_TIMEOUT as COMMAND_TIMEOUT;

/// IDLE state value, shared by every module.
pub const IDLE_STATE: u8 = 0;

/// Outcome of a driver call or a sequencer step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ReturnCode {
    /// The step completed.
    NoError = 0,
    /// The slave refused the command (NACK).
    SendError = 1,
    /// The action ended in a fault or an unexpected state.
    ExecutionError = 2,
    /// The action did not finish within its execution timeout.
    TimeoutError = 3,
    /// The request itself was invalid, e.g. an unknown heater id.
    GeneralError = 4,
}

impl ReturnCode {
    /// True only for [`ReturnCode::NoError`].
    pub fn is_ok(self) -> bool {
        self == ReturnCode::NoError
    }
}

impl fmt::Display for ReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReturnCode::NoError => "no error",
            ReturnCode::SendError => "send error",
            ReturnCode::ExecutionError => "execution error",
            ReturnCode::TimeoutError => "timeout error",
            ReturnCode::GeneralError => "general error",
        };
        f.write_str(name)
    }
}

/// Result of sending an action command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Issued {
    accepted: bool,
    awaiting: u8,
}

impl Issued {
    /// `busy_state` is what the module reports while carrying out the action.
    pub fn new(accepted: bool, busy_state: u8) -> Self {
        Self {
            accepted,
            awaiting: if accepted { busy_state } else { IDLE_STATE },
        }
    }

    /// True when the slave answered with ACK.
    pub fn accepted(&self) -> bool {
        self.accepted
    }

    /// State the module is expected to leave when the action completes.
    pub fn awaiting(&self) -> u8 {
        self.awaiting
    }
}

/// Every driver, sharing one transport.
pub struct Drivers<L> {
    /// Dispenser (DS).
    pub dispenser: Dispenser<L>,
    /// Kneader (KN).
    pub kneader: Kneader<L>,
    /// Heaters, fans and charring elements (HT).
    pub heater: Heater<L>,
    /// Vertical tray (VT).
    pub vertical_tray: VerticalTray<L>,
    /// Wedge press (WP).
    pub wedge_press: WedgePress<L>,
    /// Kicker (KR).
    pub kicker: Kicker<L>,
    /// Board GPIO.
    pub gpio: Gpio<L>,
    /// Firmware identification.
    pub who_am_i: WhoAmI<L>,
    /// Bootloader/application switch.
    pub switch_context: SwitchContext<L>,
}

impl<L: SlaveLink> Drivers<L> {
    /// Builds every driver with its default timing.
    pub fn new(transport: Arc<Transport<L>>) -> Self {
        Self::with_timing(transport, &TimingConfig::default())
    }

    /// Builds every driver, taking execution timeouts and check periods from `timing`.
    pub fn with_timing(transport: Arc<Transport<L>>, timing: &TimingConfig) -> Self {
        Self {
            dispenser: Dispenser::new(transport.clone())
                .with_poller(timing.dispenser.poller()),
            kneader: Kneader::new(transport.clone()).with_poller(timing.kneader.poller()),
            heater: Heater::new(transport.clone())
                .with_check_period(timing.heater.check_period()),
            vertical_tray: VerticalTray::new(transport.clone())
                .with_poller(timing.vertical_tray.poller()),
            wedge_press: WedgePress::new(transport.clone())
                .with_poller(timing.wedge_press.poller()),
            kicker: Kicker::new(transport.clone()).with_poller(timing.kicker.poller()),
            gpio: Gpio::new(transport.clone()),
            who_am_i: WhoAmI::new(transport.clone()),
            switch_context: SwitchContext::new(transport),
        }
    }
}
