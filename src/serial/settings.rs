//! # Terminal Settings Module
//!
//! This module translates a [`TerminalSettings`] record into the POSIX termios
//! attribute structure and applies it to an open serial handle. The transform
//! itself is pure; [`apply`] wraps it in a tcgetattr/tcsetattr pair so the
//! attribute block is never partially written.

use rustix::fd::AsFd;
use rustix::termios::{
    ControlModes, InputModes, LocalModes, OptionalActions, OutputModes, SpecialCodeIndex, Termios,
    tcgetattr, tcsetattr,
};

use crate::error::{PortError, Result};

/// Parity bit generation and checking mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Parity {
    /// No parity bit.
    #[default]
    None,
    /// Even parity.
    Even,
    /// Odd parity.
    Odd,
}

/// Number of data bits per character frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DataBits {
    /// 5 data bits.
    Five,
    /// 6 data bits.
    Six,
    /// 7 data bits.
    Seven,
    /// 8 data bits.
    #[default]
    Eight,
}

impl DataBits {
    /// Character-size bits for the termios control modes.
    fn control_mode(self) -> ControlModes {
        match self {
            DataBits::Five => ControlModes::CS5,
            DataBits::Six => ControlModes::CS6,
            DataBits::Seven => ControlModes::CS7,
            DataBits::Eight => ControlModes::CS8,
        }
    }
}

/// Line-discipline configuration for one serial handle.
///
/// A pure value type; it is applied transactionally on each
/// [`SerialConnection::configure`](crate::serial::SerialConnection::configure)
/// call and never persisted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TerminalSettings {
    /// Input baud rate.
    pub receive_rate: u32,
    /// Output baud rate.
    pub transmit_rate: u32,
    /// VMIN: minimum bytes before a blocking read returns.
    pub minimum_bytes_to_read: u8,
    /// VTIME: inter-byte read timeout in deciseconds (0 disables it).
    pub timeout_deciseconds: u8,
    /// Parity mode.
    pub parity: Parity,
    /// Send two stop bits instead of one.
    pub two_stop_bits: bool,
    /// Data bits per character.
    pub data_bits: DataBits,
    /// Enable XON/XOFF software flow control.
    pub software_flow_control: bool,
    /// Enable output post-processing (OPOST).
    pub process_output: bool,
}

impl Default for TerminalSettings {
    fn default() -> Self {
        TerminalSettings {
            receive_rate: 9600,
            transmit_rate: 9600,
            minimum_bytes_to_read: 1,
            timeout_deciseconds: 0,
            parity: Parity::None,
            two_stop_bits: false,
            data_bits: DataBits::Eight,
            software_flow_control: false,
            process_output: false,
        }
    }
}

/// Encodes `settings` into `termios`.
///
/// The receiver is always enabled and modem control lines are ignored
/// (CREAD | CLOCAL); canonical mode, echo and signal generation are always
/// cleared. Input CR/NL translation is disabled so the device sees raw line
/// terminators.
pub fn encode(settings: &TerminalSettings, termios: &mut Termios) -> Result<()> {
    termios
        .set_input_speed(settings.receive_rate)
        .map_err(|e| PortError::config(format!("unsupported receive rate: {e}")))?;
    termios
        .set_output_speed(settings.transmit_rate)
        .map_err(|e| PortError::config(format!("unsupported transmit rate: {e}")))?;

    match settings.parity {
        Parity::None => {
            termios.control_modes &= !(ControlModes::PARENB | ControlModes::PARODD);
        }
        Parity::Even => {
            termios.control_modes |= ControlModes::PARENB;
            termios.control_modes &= !ControlModes::PARODD;
        }
        Parity::Odd => {
            termios.control_modes |= ControlModes::PARENB | ControlModes::PARODD;
        }
    }

    if settings.two_stop_bits {
        termios.control_modes |= ControlModes::CSTOPB;
    } else {
        termios.control_modes &= !ControlModes::CSTOPB;
    }

    termios.control_modes &= !ControlModes::CSIZE;
    termios.control_modes |= settings.data_bits.control_mode();

    // Raw line terminators: no CR/NL mapping on input
    termios.input_modes &= !(InputModes::ICRNL | InputModes::INLCR | InputModes::IGNCR);

    let flow = InputModes::IXON | InputModes::IXOFF | InputModes::IXANY;
    if settings.software_flow_control {
        termios.input_modes |= flow;
    } else {
        termios.input_modes &= !flow;
    }

    termios.control_modes |= ControlModes::CREAD | ControlModes::CLOCAL;

    termios.local_modes &=
        !(LocalModes::ICANON | LocalModes::ECHO | LocalModes::ECHOE | LocalModes::ISIG);

    if settings.process_output {
        termios.output_modes |= OutputModes::OPOST;
    } else {
        termios.output_modes &= !OutputModes::OPOST;
    }

    termios.special_codes[SpecialCodeIndex::VMIN] = settings.minimum_bytes_to_read;
    termios.special_codes[SpecialCodeIndex::VTIME] = settings.timeout_deciseconds;

    Ok(())
}

/// Fetches the handle's attribute block, encodes `settings` into it and
/// writes it back (TCSANOW).
///
/// Any syscall failure is surfaced as [`PortError::Config`]; the attribute
/// block is never partially applied from the caller's perspective.
pub fn apply<Fd: AsFd>(fd: Fd, settings: &TerminalSettings) -> Result<()> {
    let mut termios =
        tcgetattr(&fd).map_err(|e| PortError::config(format!("tcgetattr failed: {e}")))?;

    encode(settings, &mut termios)?;

    tcsetattr(&fd, OptionalActions::Now, &termios)
        .map_err(|e| PortError::config(format!("tcsetattr failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::pty::openpty;

    fn pty_termios() -> (nix::pty::OpenptyResult, Termios) {
        let pty = openpty(None, None).expect("openpty");
        let termios = tcgetattr(&pty.master).expect("tcgetattr");
        (pty, termios)
    }

    #[test]
    fn test_eight_none_one_bit_pattern() {
        let (_pty, mut termios) = pty_termios();
        let settings = TerminalSettings::default();

        encode(&settings, &mut termios).unwrap();

        assert_eq!(
            termios.control_modes & ControlModes::CSIZE,
            ControlModes::CS8
        );
        assert!(!termios.control_modes.contains(ControlModes::PARENB));
        assert!(!termios.control_modes.contains(ControlModes::CSTOPB));
        assert!(termios.control_modes.contains(ControlModes::CREAD));
        assert!(termios.control_modes.contains(ControlModes::CLOCAL));
    }

    #[test]
    fn test_parity_bits() {
        let (_pty, mut termios) = pty_termios();

        let even = TerminalSettings {
            parity: Parity::Even,
            ..Default::default()
        };
        encode(&even, &mut termios).unwrap();
        assert!(termios.control_modes.contains(ControlModes::PARENB));
        assert!(!termios.control_modes.contains(ControlModes::PARODD));

        let odd = TerminalSettings {
            parity: Parity::Odd,
            ..Default::default()
        };
        encode(&odd, &mut termios).unwrap();
        assert!(termios.control_modes.contains(ControlModes::PARENB));
        assert!(termios.control_modes.contains(ControlModes::PARODD));

        let none = TerminalSettings::default();
        encode(&none, &mut termios).unwrap();
        assert!(!termios.control_modes.contains(ControlModes::PARENB));
        assert!(!termios.control_modes.contains(ControlModes::PARODD));
    }

    #[test]
    fn test_stop_bits_and_data_bits() {
        let (_pty, mut termios) = pty_termios();
        let settings = TerminalSettings {
            two_stop_bits: true,
            data_bits: DataBits::Seven,
            ..Default::default()
        };

        encode(&settings, &mut termios).unwrap();

        assert!(termios.control_modes.contains(ControlModes::CSTOPB));
        assert_eq!(
            termios.control_modes & ControlModes::CSIZE,
            ControlModes::CS7
        );
    }

    #[test]
    fn test_software_flow_control_group() {
        let (_pty, mut termios) = pty_termios();
        let flow = InputModes::IXON | InputModes::IXOFF | InputModes::IXANY;

        let on = TerminalSettings {
            software_flow_control: true,
            ..Default::default()
        };
        encode(&on, &mut termios).unwrap();
        assert_eq!(termios.input_modes & flow, flow);

        let off = TerminalSettings::default();
        encode(&off, &mut termios).unwrap();
        assert!((termios.input_modes & flow).is_empty());
    }

    #[test]
    fn test_raw_mode_flags() {
        let (_pty, mut termios) = pty_termios();
        // Start from a canonical, echoing, CR-mapping line
        termios.local_modes |= LocalModes::ICANON | LocalModes::ECHO;
        termios.input_modes |= InputModes::ICRNL;

        encode(&TerminalSettings::default(), &mut termios).unwrap();

        assert!(!termios.local_modes.contains(LocalModes::ICANON));
        assert!(!termios.local_modes.contains(LocalModes::ECHO));
        assert!(!termios.local_modes.contains(LocalModes::ECHOE));
        assert!(!termios.local_modes.contains(LocalModes::ISIG));
        assert!(!termios.input_modes.contains(InputModes::ICRNL));
        assert!(!termios.input_modes.contains(InputModes::INLCR));
        assert!(!termios.input_modes.contains(InputModes::IGNCR));
        assert!(!termios.output_modes.contains(OutputModes::OPOST));
    }

    #[test]
    fn test_vmin_vtime() {
        let (_pty, mut termios) = pty_termios();
        let settings = TerminalSettings {
            minimum_bytes_to_read: 4,
            timeout_deciseconds: 10,
            ..Default::default()
        };

        encode(&settings, &mut termios).unwrap();

        assert_eq!(termios.special_codes[SpecialCodeIndex::VMIN], 4);
        assert_eq!(termios.special_codes[SpecialCodeIndex::VTIME], 10);
    }

    #[test]
    fn test_apply_round_trip() {
        let pty = openpty(None, None).expect("openpty");
        let settings = TerminalSettings {
            receive_rate: 115200,
            transmit_rate: 115200,
            data_bits: DataBits::Seven,
            parity: Parity::Even,
            ..Default::default()
        };

        apply(&pty.master, &settings).unwrap();

        let termios = tcgetattr(&pty.master).unwrap();
        assert_eq!(
            termios.control_modes & ControlModes::CSIZE,
            ControlModes::CS7
        );
        assert!(termios.control_modes.contains(ControlModes::PARENB));
    }
}
