//! Typed recipe steps and their parsing from command descriptors.
//!
//! Recipes are authored as a list of loosely-typed descriptors:
//!
//! ```json
//! [
//!   { "module": "vt", "cmd": ["move_top", 10, 20] },
//!   { "module": "kn", "cmd": ["run", 13] },
//!   { "module": "sleep", "cmd": [5000] },
//!   { "module": "kn", "cmd": ["stop"] }
//! ]
//! ```
//!
//! Every descriptor is turned into a [`Step`] before anything is sent, so an
//! unknown module, unknown operation or wrong argument count is reported up front
//! as [`MasterError::Recipe`] and never reaches the hardware.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;

use super::gate::ModuleTag;
use crate::error::{AppResult, MasterError};

/// Raw `{ module, cmd }` record as found in recipe files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandDescriptor {
    /// Module tag, e.g. `"kn"`.
    pub module: String,
    /// Operation name followed by its arguments, or bare arguments for the
    /// positional forms.
    pub cmd: Vec<Value>,
}

impl CommandDescriptor {
    /// Descriptor for `module` with the raw `cmd` array.
    pub fn new(module: impl Into<String>, cmd: Vec<Value>) -> Self {
        Self {
            module: module.into(),
            cmd,
        }
    }
}

/// Kneader operations. Everything except `Wait` is fire-and-forget.
#[derive(Debug, Clone, PartialEq)]
pub enum KneaderOp {
    /// `["run", speed]`
    Run {
        /// Stirrer speed, rpm.
        speed: f64,
    },
    /// `["stop"]`
    Stop,
    /// `["set_dis_pos", id]`
    SetDisPos {
        /// Dispenser to move under.
        id: u8,
    },
    /// `["wait"]` for the last kneader action.
    Wait,
    /// `["eject", state]`
    Eject {
        /// `STIRRER_EJECT` or `STIRRER_RETRACT`.
        state: u8,
    },
    /// `["set_pos", pos, speed]`
    SetPos {
        /// Target position.
        pos: f64,
        /// Move speed.
        speed: f64,
    },
}

/// Dispenser operations. Both dispenses wait for completion.
#[derive(Debug, Clone, PartialEq)]
pub enum DispenserOp {
    /// `["weight", id, grams, speed]`
    Weight {
        /// Dispenser id.
        id: u8,
        /// Target weight, grams.
        weight: f64,
        /// Auger speed.
        speed: f64,
    },
    /// `["time", id, ms, speed]`
    Time {
        /// Dispenser id.
        id: u8,
        /// Run time.
        time_ms: u32,
        /// Auger speed.
        speed: f64,
    },
    /// `["tare"]`, never fails the sequence.
    Tare,
}

/// Vertical-tray moves. The `Top` variants are offsets below the top limit.
#[derive(Debug, Clone, PartialEq)]
pub enum VerticalTrayOp {
    /// `["move_block", pos, speed]`
    MoveBlock {
        /// Absolute position, mm.
        pos: f64,
        /// Move speed.
        speed: f64,
    },
    /// `["move_nonblock", pos, speed]`
    MoveNonBlock {
        /// Absolute position, mm.
        pos: f64,
        /// Move speed.
        speed: f64,
    },
    /// `["move_top", offset, speed]`
    MoveTop {
        /// Distance below the top limit, mm.
        offset: f64,
        /// Move speed.
        speed: f64,
    },
    /// `["move_topnonblock", offset, speed]`
    MoveTopNonBlock {
        /// Distance below the top limit, mm.
        offset: f64,
        /// Move speed.
        speed: f64,
    },
    /// `["wait"]` for the last non-blocking move.
    Wait,
}

/// Wedge-press operations.
#[derive(Debug, Clone, PartialEq)]
pub enum WedgePressOp {
    /// Starts an absolute move and returns without waiting.
    Async {
        /// Press gap, mm.
        press: f64,
        /// Pivot gap, mm.
        pivot: f64,
        /// Move duration.
        time_ms: u16,
    },
    /// `["wait"]` for the last `Async` move.
    Wait,
    /// `["press", pos, ms]`, then wait.
    Press {
        /// Press gap, mm.
        pos: f64,
        /// Move duration.
        time_ms: u16,
    },
    /// `["wedge", pos, ms]`, then wait.
    Wedge {
        /// Pivot gap, mm.
        pos: f64,
        /// Move duration.
        time_ms: u16,
    },
    /// Absolute move, then wait. Written without an op name: `[press, pivot, time]`.
    Move {
        /// Press gap, mm.
        press: f64,
        /// Pivot gap, mm.
        pivot: f64,
        /// Move duration.
        time_ms: u16,
    },
}

/// Kicker operations. Both wait for completion.
#[derive(Debug, Clone, PartialEq)]
pub enum KickerOp {
    /// `["abs", pos, speed]`
    Abs {
        /// Absolute position, mm.
        pos: f64,
        /// Move speed.
        speed: f64,
    },
    /// Steps forward by `step` until within one step of `target`, then finishes
    /// with an absolute move.
    Rel {
        /// Final position, mm.
        target: f64,
        /// Relative move size, always positive.
        step: f64,
        /// Move speed.
        speed: f64,
        /// Pause after each relative move.
        delay_ms: u64,
    },
}

/// Heater operations. Switching never fails the sequence; the waits can.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaterOp {
    /// `["ON", id, temp, duty_max, duty_threshold]`
    On {
        /// Heater id.
        id: u8,
        /// Temperature reference, degrees C.
        temp: f64,
        /// Duty cap.
        duty_max: f64,
        /// Temperature below which full duty is allowed.
        duty_threshold: f64,
    },
    /// `["OFF", id]`
    Off {
        /// Heater id.
        id: u8,
    },
    /// `["LE", id, temp, timeout_ms]`: wait until at or below `temp`.
    Le {
        /// Heater id.
        id: u8,
        /// Threshold, degrees C.
        temp: f64,
        /// Give up after this long.
        timeout_ms: u64,
    },
    /// `["GE", id, temp, timeout_ms]`: wait until at or above `temp`.
    Ge {
        /// Heater id.
        id: u8,
        /// Threshold, degrees C.
        temp: f64,
        /// Give up after this long.
        timeout_ms: u64,
    },
    /// `["EQ", top, btm, tol, timeout_ms]`: wait until both plates are within `tol`.
    Eq {
        /// Top plate target, degrees C.
        top: f64,
        /// Bottom plate target, degrees C.
        btm: f64,
        /// Half-width of the band, exclusive.
        tol: f64,
        /// Give up after this long.
        timeout_ms: u64,
    },
    /// `["CHON", id, ms]`
    CharOn {
        /// Charring element id.
        id: u8,
        /// On-time.
        time_ms: u16,
    },
    /// `["CHOFF", id]`
    CharOff {
        /// Charring element id.
        id: u8,
    },
}

/// Fan operations, served by the heater module.
#[derive(Debug, Clone, PartialEq)]
pub enum FanOp {
    /// `["id", fan, state]`
    Id {
        /// Fan number.
        fan: u8,
        /// Non-zero for on.
        state: u8,
    },
    /// `["pwm", fan, duty]`
    Pwm {
        /// Fan number.
        fan: u8,
        /// Duty, percent.
        duty: u8,
    },
    /// Bare `[mask]`: one bit per fan.
    Mask {
        /// Fan bit mask.
        mask: u8,
    },
}

/// One validated recipe step.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// `kn` step.
    Kneader(KneaderOp),
    /// `ds` step.
    Dispenser(DispenserOp),
    /// `vt` step.
    VerticalTray(VerticalTrayOp),
    /// `wp` step.
    WedgePress(WedgePressOp),
    /// `kr` step.
    Kicker(KickerOp),
    /// `ht` step.
    Heater(HeaterOp),
    /// `fan` step.
    Fan(FanOp),
    /// `sleep` step: `[ms]`.
    Sleep {
        /// Pause length.
        ms: u64,
    },
}

impl Step {
    /// Module the step is addressed to.
    pub fn module(&self) -> ModuleTag {
        match self {
            Step::Kneader(_) => ModuleTag::Kneader,
            Step::Dispenser(_) => ModuleTag::Dispenser,
            Step::VerticalTray(_) => ModuleTag::VerticalTray,
            Step::WedgePress(_) => ModuleTag::WedgePress,
            Step::Kicker(_) => ModuleTag::Kicker,
            Step::Heater(_) => ModuleTag::Heater,
            Step::Fan(_) => ModuleTag::Fan,
            Step::Sleep { .. } => ModuleTag::Sleep,
        }
    }

    /// Validates a single descriptor.
    pub fn from_descriptor(desc: &CommandDescriptor) -> AppResult<Self> {
        parse(desc).map_err(MasterError::Recipe)
    }
}

/// Parses a JSON array of command descriptors.
pub fn parse_recipe(json: &str) -> AppResult<Vec<Step>> {
    let descs: Vec<CommandDescriptor> =
        serde_json::from_str(json).map_err(|e| MasterError::Recipe(e.to_string()))?;
    parse_steps(&descs)
}

/// Validates every descriptor, naming the first bad one by index.
pub fn parse_steps(descs: &[CommandDescriptor]) -> AppResult<Vec<Step>> {
    descs
        .iter()
        .enumerate()
        .map(|(index, desc)| {
            parse(desc).map_err(|msg| MasterError::Recipe(format!("step {}: {}", index, msg)))
        })
        .collect()
}

/// A named, validated list of steps.
#[derive(Debug, Clone, PartialEq)]
pub struct Recipe {
    /// Recipe name; the file stem when the file does not set one.
    pub name: String,
    /// Steps in execution order.
    pub steps: Vec<Step>,
}

#[derive(Deserialize)]
struct RecipeFile {
    #[serde(default)]
    name: String,
    steps: Vec<CommandDescriptor>,
}

impl Recipe {
    /// Parses a TOML recipe with a `name` and `[[steps]]` tables.
    pub fn from_toml_str(text: &str) -> AppResult<Self> {
        let file: RecipeFile =
            toml::from_str(text).map_err(|e| MasterError::Recipe(e.to_string()))?;
        Ok(Self {
            steps: parse_steps(&file.steps)?,
            name: file.name,
        })
    }

    /// Reads and parses a TOML recipe file.
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let mut recipe = Self::from_toml_str(&text)?;
        if recipe.name.is_empty() {
            recipe.name = path
                .as_ref()
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_default();
        }
        Ok(recipe)
    }
}

// ============================================================================
// Descriptor parsing
// ============================================================================

/// Operation arguments following the op name.
struct Args<'a> {
    module: ModuleTag,
    op: &'a str,
    values: &'a [Value],
}

impl<'a> Args<'a> {
    fn arity(&self, n: usize) -> Result<(), String> {
        if self.values.len() != n {
            return Err(format!(
                "{} '{}' takes {} argument(s), got {}",
                self.module,
                self.op,
                n,
                self.values.len()
            ));
        }
        Ok(())
    }

    fn number(&self, i: usize) -> Result<f64, String> {
        self.values
            .get(i)
            .and_then(Value::as_f64)
            .ok_or_else(|| {
                format!(
                    "{} '{}': argument {} must be a number",
                    self.module,
                    self.op,
                    i + 1
                )
            })
    }

    fn int<T: TryFrom<u64>>(&self, i: usize) -> Result<T, String> {
        let value = self.number(i)?;
        if value < 0.0 || value.fract() != 0.0 {
            return Err(format!(
                "{} '{}': argument {} must be a non-negative integer, got {}",
                self.module,
                self.op,
                i + 1,
                value
            ));
        }
        T::try_from(value as u64).map_err(|_| {
            format!(
                "{} '{}': argument {} is out of range ({})",
                self.module,
                self.op,
                i + 1,
                value
            )
        })
    }

    fn unknown(&self) -> String {
        format!("unknown {} operation '{}'", self.module, self.op)
    }
}

fn parse(desc: &CommandDescriptor) -> Result<Step, String> {
    let module: ModuleTag = desc
        .module
        .parse()
        .map_err(|_| format!("unknown module '{}'", desc.module))?;
    let head = desc
        .cmd
        .first()
        .ok_or_else(|| format!("empty cmd for module '{}'", module))?;

    // forms without an op name
    if head.is_number() {
        let args = Args {
            module,
            op: match module {
                ModuleTag::Sleep => "sleep",
                ModuleTag::WedgePress => "move",
                ModuleTag::Fan => "mask",
                _ => "",
            },
            values: &desc.cmd,
        };
        return match module {
            ModuleTag::Sleep => {
                args.arity(1)?;
                Ok(Step::Sleep { ms: args.int(0)? })
            }
            ModuleTag::WedgePress => {
                args.arity(3)?;
                Ok(Step::WedgePress(WedgePressOp::Move {
                    press: args.number(0)?,
                    pivot: args.number(1)?,
                    time_ms: args.int(2)?,
                }))
            }
            ModuleTag::Fan => {
                args.arity(1)?;
                Ok(Step::Fan(FanOp::Mask { mask: args.int(0)? }))
            }
            _ => Err(format!("{} cmd must start with an operation name", module)),
        };
    }

    let op = head
        .as_str()
        .ok_or_else(|| format!("{} cmd must start with an operation name", module))?;
    let args = Args {
        module,
        op,
        values: &desc.cmd[1..],
    };

    match module {
        ModuleTag::Kneader => parse_kneader(&args).map(Step::Kneader),
        ModuleTag::Dispenser => parse_dispenser(&args).map(Step::Dispenser),
        ModuleTag::VerticalTray => parse_vertical_tray(&args).map(Step::VerticalTray),
        ModuleTag::WedgePress => parse_wedge_press(&args).map(Step::WedgePress),
        ModuleTag::Kicker => parse_kicker(&args).map(Step::Kicker),
        ModuleTag::Heater => parse_heater(&args).map(Step::Heater),
        ModuleTag::Fan => parse_fan(&args).map(Step::Fan),
        ModuleTag::Sleep => Err("sleep cmd must be [milliseconds]".to_string()),
    }
}

fn parse_kneader(args: &Args<'_>) -> Result<KneaderOp, String> {
    match args.op {
        "run" => {
            args.arity(1)?;
            Ok(KneaderOp::Run {
                speed: args.number(0)?,
            })
        }
        "stop" => args.arity(0).map(|_| KneaderOp::Stop),
        "wait" => args.arity(0).map(|_| KneaderOp::Wait),
        "set_dis_pos" => {
            args.arity(1)?;
            Ok(KneaderOp::SetDisPos { id: args.int(0)? })
        }
        "eject" => {
            args.arity(1)?;
            Ok(KneaderOp::Eject { state: args.int(0)? })
        }
        "set_pos" => {
            args.arity(2)?;
            Ok(KneaderOp::SetPos {
                pos: args.number(0)?,
                speed: args.number(1)?,
            })
        }
        _ => Err(args.unknown()),
    }
}

fn parse_dispenser(args: &Args<'_>) -> Result<DispenserOp, String> {
    match args.op {
        "weight" => {
            args.arity(3)?;
            Ok(DispenserOp::Weight {
                id: args.int(0)?,
                weight: args.number(1)?,
                speed: args.number(2)?,
            })
        }
        "time" => {
            args.arity(3)?;
            Ok(DispenserOp::Time {
                id: args.int(0)?,
                time_ms: args.int(1)?,
                speed: args.number(2)?,
            })
        }
        "tare" => args.arity(0).map(|_| DispenserOp::Tare),
        _ => Err(args.unknown()),
    }
}

fn parse_vertical_tray(args: &Args<'_>) -> Result<VerticalTrayOp, String> {
    let pair = |args: &Args<'_>| -> Result<(f64, f64), String> {
        args.arity(2)?;
        Ok((args.number(0)?, args.number(1)?))
    };
    match args.op {
        "move_block" => pair(args).map(|(pos, speed)| VerticalTrayOp::MoveBlock { pos, speed }),
        "move_nonblock" => {
            pair(args).map(|(pos, speed)| VerticalTrayOp::MoveNonBlock { pos, speed })
        }
        "move_top" => pair(args).map(|(offset, speed)| VerticalTrayOp::MoveTop { offset, speed }),
        "move_topnonblock" => {
            pair(args).map(|(offset, speed)| VerticalTrayOp::MoveTopNonBlock { offset, speed })
        }
        "wait" => args.arity(0).map(|_| VerticalTrayOp::Wait),
        _ => Err(args.unknown()),
    }
}

fn parse_wedge_press(args: &Args<'_>) -> Result<WedgePressOp, String> {
    match args.op {
        "asyn" | "async" => {
            args.arity(3)?;
            Ok(WedgePressOp::Async {
                press: args.number(0)?,
                pivot: args.number(1)?,
                time_ms: args.int(2)?,
            })
        }
        "wait" => args.arity(0).map(|_| WedgePressOp::Wait),
        "press" => {
            args.arity(2)?;
            Ok(WedgePressOp::Press {
                pos: args.number(0)?,
                time_ms: args.int(1)?,
            })
        }
        "wedge" => {
            args.arity(2)?;
            Ok(WedgePressOp::Wedge {
                pos: args.number(0)?,
                time_ms: args.int(1)?,
            })
        }
        _ => Err(args.unknown()),
    }
}

fn parse_kicker(args: &Args<'_>) -> Result<KickerOp, String> {
    match args.op {
        "abs" => {
            args.arity(2)?;
            Ok(KickerOp::Abs {
                pos: args.number(0)?,
                speed: args.number(1)?,
            })
        }
        "rel" => {
            args.arity(4)?;
            let step = args.number(1)?;
            if step <= 0.0 {
                return Err(format!("kr 'rel': step must be positive, got {}", step));
            }
            Ok(KickerOp::Rel {
                target: args.number(0)?,
                step,
                speed: args.number(2)?,
                delay_ms: args.int(3)?,
            })
        }
        _ => Err(args.unknown()),
    }
}

fn parse_heater(args: &Args<'_>) -> Result<HeaterOp, String> {
    match args.op {
        "ON" => {
            args.arity(4)?;
            Ok(HeaterOp::On {
                id: args.int(0)?,
                temp: args.number(1)?,
                duty_max: args.number(2)?,
                duty_threshold: args.number(3)?,
            })
        }
        "OFF" => {
            args.arity(1)?;
            Ok(HeaterOp::Off { id: args.int(0)? })
        }
        "LE" | "GE" => {
            args.arity(3)?;
            let (id, temp, timeout_ms) = (args.int(0)?, args.number(1)?, args.int(2)?);
            Ok(if args.op == "LE" {
                HeaterOp::Le { id, temp, timeout_ms }
            } else {
                HeaterOp::Ge { id, temp, timeout_ms }
            })
        }
        "EQ" => {
            args.arity(4)?;
            Ok(HeaterOp::Eq {
                top: args.number(0)?,
                btm: args.number(1)?,
                tol: args.number(2)?,
                timeout_ms: args.int(3)?,
            })
        }
        "CHON" => {
            args.arity(2)?;
            Ok(HeaterOp::CharOn {
                id: args.int(0)?,
                time_ms: args.int(1)?,
            })
        }
        "CHOFF" => {
            args.arity(1)?;
            Ok(HeaterOp::CharOff { id: args.int(0)? })
        }
        _ => Err(args.unknown()),
    }
}

fn parse_fan(args: &Args<'_>) -> Result<FanOp, String> {
    match args.op {
        "id" => {
            args.arity(2)?;
            Ok(FanOp::Id {
                fan: args.int(0)?,
                state: args.int(1)?,
            })
        }
        "pwm" => {
            args.arity(2)?;
            Ok(FanOp::Pwm {
                fan: args.int(0)?,
                duty: args.int(1)?,
            })
        }
        _ => Err(args.unknown()),
    }
}
